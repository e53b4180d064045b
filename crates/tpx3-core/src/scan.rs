//! Capability surface of the external raster-scan generator.
//!
//! The scan hardware is a collaborator the driver consumes, never owns.
//! Controllers receive a concrete [`ScanCollaborator`] by injection at
//! construction; nothing here goes through a process-wide registry.
//!
//! The trait is synchronous on purpose: its hot callers are the blocking
//! streaming worker, which polls `is_playing`/`filled_sequence_count` on
//! every timeout tick and must not re-enter an async runtime from a
//! blocking thread. Implementations are expected to answer from cached
//! state or a cheap register read.

use anyhow::Result;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::time::Duration;

/// Hardware source used to clock the detector trigger line.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TriggerSource {
    /// The scan generator's own frame clock.
    FrameClock,
    /// A free-running internal generator at a fixed period.
    InternalGenerator,
}

/// Raster-scan generator capabilities consumed by the driver.
pub trait ScanCollaborator: Send + Sync {
    /// Current per-pixel dwell time.
    fn dwell_time(&self) -> Result<Duration>;

    /// Current (sub)scan size as `(width, height)` in pixels.
    fn scan_size(&self) -> Result<(u32, u32)>;

    /// Arm the hardware trigger line feeding the detector.
    fn arm_trigger(&self, source: TriggerSource, period: Duration) -> Result<()>;

    /// Announce how many sequence-buffer entries the coming scan fills.
    fn set_sequence_target(&self, target: u64) -> Result<()>;

    /// Number of sequence-buffer entries filled so far.
    fn filled_sequence_count(&self) -> Result<u64>;

    /// Begin scanning.
    fn start(&self) -> Result<()>;

    /// Stop scanning.
    fn stop(&self) -> Result<()>;

    /// Whether the generator is currently scanning.
    fn is_playing(&self) -> Result<bool>;
}

/// In-memory scan generator for tests and offline operation.
///
/// Tests drive it directly: [`MockScan::fill`] advances the sequence
/// counter as real hardware would while pixels complete.
#[derive(Debug)]
pub struct MockScan {
    dwell: Mutex<Duration>,
    size: Mutex<(u32, u32)>,
    armed: Mutex<Option<(TriggerSource, Duration)>>,
    target: AtomicU64,
    filled: AtomicU64,
    playing: AtomicBool,
}

impl Default for MockScan {
    fn default() -> Self {
        Self::new(Duration::from_micros(1), (64, 64))
    }
}

impl MockScan {
    /// New idle mock with the given dwell time and scan size.
    pub fn new(dwell: Duration, size: (u32, u32)) -> Self {
        Self {
            dwell: Mutex::new(dwell),
            size: Mutex::new(size),
            armed: Mutex::new(None),
            target: AtomicU64::new(0),
            filled: AtomicU64::new(0),
            playing: AtomicBool::new(false),
        }
    }

    /// Simulate `pixels` scan pixels completing.
    pub fn fill(&self, pixels: u64) {
        self.filled.fetch_add(pixels, Ordering::SeqCst);
    }

    /// Trigger configuration recorded by the last `arm_trigger` call.
    pub fn armed_trigger(&self) -> Option<(TriggerSource, Duration)> {
        *self.armed.lock()
    }

    /// Sequence target recorded by the last `set_sequence_target` call.
    pub fn sequence_target(&self) -> u64 {
        self.target.load(Ordering::SeqCst)
    }
}

impl ScanCollaborator for MockScan {
    fn dwell_time(&self) -> Result<Duration> {
        Ok(*self.dwell.lock())
    }

    fn scan_size(&self) -> Result<(u32, u32)> {
        Ok(*self.size.lock())
    }

    fn arm_trigger(&self, source: TriggerSource, period: Duration) -> Result<()> {
        *self.armed.lock() = Some((source, period));
        Ok(())
    }

    fn set_sequence_target(&self, target: u64) -> Result<()> {
        self.target.store(target, Ordering::SeqCst);
        self.filled.store(0, Ordering::SeqCst);
        Ok(())
    }

    fn filled_sequence_count(&self) -> Result<u64> {
        Ok(self.filled.load(Ordering::SeqCst))
    }

    fn start(&self) -> Result<()> {
        self.playing.store(true, Ordering::SeqCst);
        Ok(())
    }

    fn stop(&self) -> Result<()> {
        self.playing.store(false, Ordering::SeqCst);
        Ok(())
    }

    fn is_playing(&self) -> Result<bool> {
        Ok(self.playing.load(Ordering::SeqCst))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn mock_tracks_sequence_accounting() {
        let scan = MockScan::default();
        scan.set_sequence_target(4096).unwrap();
        assert_eq!(scan.sequence_target(), 4096);
        assert_eq!(scan.filled_sequence_count().unwrap(), 0);

        scan.fill(100);
        scan.fill(28);
        assert_eq!(scan.filled_sequence_count().unwrap(), 128);

        // Retargeting resets the fill count.
        scan.set_sequence_target(16).unwrap();
        assert_eq!(scan.filled_sequence_count().unwrap(), 0);
    }

    #[test]
    fn mock_records_trigger_arming() {
        let scan = MockScan::default();
        assert!(scan.armed_trigger().is_none());
        scan.arm_trigger(TriggerSource::FrameClock, Duration::from_micros(2))
            .unwrap();
        assert_eq!(
            scan.armed_trigger(),
            Some((TriggerSource::FrameClock, Duration::from_micros(2)))
        );
    }

    #[test]
    fn mock_play_state() {
        let scan = MockScan::default();
        assert!(!scan.is_playing().unwrap());
        scan.start().unwrap();
        assert!(scan.is_playing().unwrap());
        scan.stop().unwrap();
        assert!(!scan.is_playing().unwrap());
    }
}
