//! Acquisition modes and their derived stream handling.
//!
//! Every mode fixes three things at compile time: how the wire stream is
//! framed, how decoded data is applied to the acquisition buffer, and
//! whether the acquisition is clocked by the external raster scan. The
//! mappings are `match`es over the closed enum so adding a mode without
//! deciding its handling is a compile error.

use serde::{Deserialize, Serialize};

/// Acquisition mode of the detector.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AcquisitionMode {
    /// Free-running full frames, one readout per exposure.
    Frame,
    /// Full frames clocked by an external frame trigger.
    FrameBased,
    /// Full frames integrated server-side across exposures.
    Cumulative,
    /// Time-resolved spectral lines stacked into a chronogram.
    FastChrono,
    /// Chronogram correlated against a second trigger source.
    CoincidenceChrono,
    /// One spectrum per scan pixel over the shared frame socket.
    EventHyperspec,
    /// Hyperspectral with the coincidence window applied.
    EventHyperspecCoincidence,
    /// One full detector sub-image per scan pixel, raw event words.
    Event4DRaw,
    /// Bare per-particle addresses binned into the scan image.
    EventListScan,
    /// Per-scan-pixel image built server-side from a 4D pixel mask.
    Frame4DMasked,
    /// Raw stream persisted server-side; local buffer is a preview.
    SaveAllLocally,
}

/// How decoded payloads mutate the acquisition buffer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ApplyPolicy {
    /// Each record overwrites the whole buffer.
    Replace,
    /// Each record lands at `frame_number * record_len` elements.
    WindowedAccumulate,
    /// Each event word increments one buffer cell.
    Histogram,
}

/// How payload boundaries are recovered from the byte stream.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FramingRegime {
    /// Inline JSON text header followed by `dataSize` raw bytes.
    HeaderFramed,
    /// Bare little-endian fixed-width words, no delimiters.
    RawEvents,
}

impl AcquisitionMode {
    /// The decode/accumulate policy for this mode.
    pub fn policy(self) -> ApplyPolicy {
        match self {
            AcquisitionMode::Frame
            | AcquisitionMode::FrameBased
            | AcquisitionMode::Cumulative
            | AcquisitionMode::FastChrono
            | AcquisitionMode::CoincidenceChrono
            | AcquisitionMode::Frame4DMasked
            | AcquisitionMode::SaveAllLocally => ApplyPolicy::Replace,
            AcquisitionMode::EventHyperspec | AcquisitionMode::EventHyperspecCoincidence => {
                ApplyPolicy::WindowedAccumulate
            }
            AcquisitionMode::Event4DRaw | AcquisitionMode::EventListScan => ApplyPolicy::Histogram,
        }
    }

    /// The wire framing regime for this mode.
    pub fn regime(self) -> FramingRegime {
        match self.policy() {
            ApplyPolicy::Histogram => FramingRegime::RawEvents,
            _ => FramingRegime::HeaderFramed,
        }
    }

    /// Whether acquisition is driven by, and terminates with, the
    /// external raster-scan generator.
    pub fn is_scan_synchronized(self) -> bool {
        matches!(
            self,
            AcquisitionMode::EventHyperspec
                | AcquisitionMode::EventHyperspecCoincidence
                | AcquisitionMode::Event4DRaw
                | AcquisitionMode::EventListScan
                | AcquisitionMode::Frame4DMasked
        )
    }

    /// Whether the coincidence delay/width pair is meaningful.
    pub fn uses_coincidence_window(self) -> bool {
        matches!(
            self,
            AcquisitionMode::CoincidenceChrono | AcquisitionMode::EventHyperspecCoincidence
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const ALL: [AcquisitionMode; 11] = [
        AcquisitionMode::Frame,
        AcquisitionMode::FrameBased,
        AcquisitionMode::Cumulative,
        AcquisitionMode::FastChrono,
        AcquisitionMode::CoincidenceChrono,
        AcquisitionMode::EventHyperspec,
        AcquisitionMode::EventHyperspecCoincidence,
        AcquisitionMode::Event4DRaw,
        AcquisitionMode::EventListScan,
        AcquisitionMode::Frame4DMasked,
        AcquisitionMode::SaveAllLocally,
    ];

    #[test]
    fn histogram_modes_are_raw_event_streams() {
        for mode in ALL {
            let raw = mode.regime() == FramingRegime::RawEvents;
            let hist = mode.policy() == ApplyPolicy::Histogram;
            assert_eq!(raw, hist, "{mode:?} regime/policy mismatch");
        }
    }

    #[test]
    fn windowed_modes_are_scan_synchronized() {
        for mode in ALL {
            if mode.policy() == ApplyPolicy::WindowedAccumulate {
                assert!(mode.is_scan_synchronized(), "{mode:?}");
            }
        }
    }

    #[test]
    fn event_list_is_histogram() {
        assert_eq!(AcquisitionMode::EventListScan.policy(), ApplyPolicy::Histogram);
        assert_eq!(AcquisitionMode::Event4DRaw.regime(), FramingRegime::RawEvents);
        assert_eq!(AcquisitionMode::Frame.policy(), ApplyPolicy::Replace);
    }
}
