//! Acquisition lifecycle orchestration.
//!
//! [`AcquisitionController`] ties the two planes together: it pushes the
//! detector configuration and destination routing over HTTP, opens the
//! data-plane socket, and hands it to a [`StreamWorker`](crate::stream)
//! running on a blocking thread. At most one session is live at a time:
//! a start while a session streams stops that session first, and `stop`
//! is idempotent and always joins the worker before reporting idle.

use crate::control::{CalibrationKind, ControlPlaneClient, DestinationRouting, ServerStatus};
use crate::stream::{connect_data_plane, StreamWorker};
use parking_lot::{Mutex, RwLock};
use serde::Deserialize;
use std::path::Path;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tpx3_core::buffer::{DataBuffer, ElementType};
use tpx3_core::config::DetectorConfig;
use tpx3_core::error::{CoreResult, Tpx3Error};
use tpx3_core::mode::{AcquisitionMode, FramingRegime};
use tpx3_core::scan::{ScanCollaborator, TriggerSource};

/// Client-side acquisition state machine.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AcquisitionStatus {
    Idle,
    Preparing,
    Streaming,
    Stopping,
}

/// Endpoint configuration for one detector, usually loaded from TOML.
#[derive(Debug, Clone, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct Tpx3DriverConfig {
    /// Base URL of the control-plane HTTP server.
    pub server_url: String,
    /// Host the data plane loops the stream back to.
    pub data_host: String,
    /// Port of the looped-back data stream.
    pub data_port: u16,
    /// Pixel-mask calibration file to upload at startup (server-side path).
    pub pixel_mask_file: Option<String>,
    /// Threshold (dacs) calibration file to upload at startup.
    pub threshold_file: Option<String>,
}

impl Default for Tpx3DriverConfig {
    fn default() -> Self {
        Self {
            server_url: "http://127.0.0.1:8080".into(),
            data_host: "127.0.0.1".into(),
            data_port: 8088,
            pixel_mask_file: None,
            threshold_file: None,
        }
    }
}

impl Tpx3DriverConfig {
    /// Load from a TOML file; missing keys fall back to defaults.
    pub fn from_toml(path: impl AsRef<Path>) -> CoreResult<Self> {
        let text = std::fs::read_to_string(path.as_ref())?;
        toml::from_str(&text)
            .map_err(|err| Tpx3Error::Config(format!("{}: {err}", path.as_ref().display())))
    }
}

/// One live (or just-finished) streaming session.
struct Session {
    config: DetectorConfig,
    stop: Arc<AtomicBool>,
    progress: Arc<AtomicU64>,
    buffer: Arc<RwLock<DataBuffer>>,
    data_ready: watch::Receiver<u64>,
    handle: Option<tokio::task::JoinHandle<()>>,
}

/// Owned copy of the acquisition buffer at one instant.
#[derive(Debug, Clone)]
pub struct FrameSnapshot {
    pub shape: Vec<usize>,
    pub element_type: ElementType,
    pub data: Vec<u8>,
    /// Frames applied (header-framed modes) or events binned (raw modes)
    /// when the snapshot was taken.
    pub progress: u64,
}

pub struct AcquisitionController {
    control: ControlPlaneClient,
    scan: Option<Arc<dyn ScanCollaborator>>,
    status: Mutex<AcquisitionStatus>,
    session: Mutex<Option<Session>>,
}

impl AcquisitionController {
    /// Connect to the control plane and upload calibrations.
    ///
    /// An unreachable server is not fatal here: the controller comes up
    /// offline and every start call reports the real transport error.
    /// This keeps instrument boot order flexible.
    pub async fn connect(
        config: Tpx3DriverConfig,
        scan: Option<Arc<dyn ScanCollaborator>>,
    ) -> CoreResult<Self> {
        let control =
            ControlPlaneClient::new(&config.server_url, &config.data_host, config.data_port)?;
        match control.status_code().await {
            Ok(code) => {
                tracing::info!(code, url = %config.server_url, "control plane reachable");
                let uploads = [
                    (CalibrationKind::PixelMask, &config.pixel_mask_file),
                    (CalibrationKind::Threshold, &config.threshold_file),
                ];
                for (kind, file) in uploads {
                    if let Some(file) = file {
                        if let Err(err) = control.load_calibration(kind, file).await {
                            tracing::warn!(?kind, file, %err, "calibration upload failed");
                        }
                    }
                }
            }
            Err(err) => {
                tracing::warn!(url = %config.server_url, %err, "control plane unreachable, starting offline");
            }
        }
        Ok(Self {
            control,
            scan,
            status: Mutex::new(AcquisitionStatus::Idle),
            session: Mutex::new(None),
        })
    }

    /// Direct access to the control plane, for dashboards and tooling.
    pub fn control(&self) -> &ControlPlaneClient {
        &self.control
    }

    /// Server-side measurement status from the dashboard endpoint.
    pub async fn server_status(&self) -> CoreResult<ServerStatus> {
        self.control.dashboard().await?.status()
    }

    /// Update the exposure time on the live server configuration.
    pub async fn set_exposure_time(&self, exposure_s: f64) -> CoreResult<()> {
        self.control.set_exposure(exposure_s).await
    }

    /// Start a free-running frame acquisition (single, soft-binned,
    /// cumulative or save-to-disk-with-preview variants).
    pub async fn start_frame(&self, config: DetectorConfig, exposure_s: f64) -> CoreResult<()> {
        let allowed = matches!(
            config.mode,
            AcquisitionMode::Frame
                | AcquisitionMode::FrameBased
                | AcquisitionMode::Cumulative
                | AcquisitionMode::SaveAllLocally
        );
        if !allowed {
            return Err(Tpx3Error::State(format!(
                "{:?} is not a frame mode",
                config.mode
            )));
        }
        self.begin(config, exposure_s, None).await
    }

    /// Start a time-resolved chronogram acquisition.
    pub async fn start_chrono(&self, config: DetectorConfig, exposure_s: f64) -> CoreResult<()> {
        let allowed = matches!(
            config.mode,
            AcquisitionMode::FastChrono | AcquisitionMode::CoincidenceChrono
        );
        if !allowed {
            return Err(Tpx3Error::State(format!(
                "{:?} is not a chrono mode",
                config.mode
            )));
        }
        self.begin(config, exposure_s, None).await
    }

    /// Start a hyperspectral-image acquisition clocked by the scan
    /// generator, one spectrum per scan pixel.
    pub async fn start_spim(&self, mut config: DetectorConfig, exposure_s: f64) -> CoreResult<()> {
        let allowed = matches!(
            config.mode,
            AcquisitionMode::EventHyperspec | AcquisitionMode::EventHyperspecCoincidence
        );
        if !allowed {
            return Err(Tpx3Error::State(format!(
                "{:?} is not a hyperspectral mode",
                config.mode
            )));
        }
        let scan = self.require_scan()?;
        let dwell = scan.dwell_time().map_err(scan_error)?;
        let (scan_w, scan_h) = scan.scan_size().map_err(scan_error)?;
        config.spim_width = scan_w;
        config.spim_height = scan_h;
        config.pixel_dwell_ns = dwell.as_nanos() as u64;
        scan.arm_trigger(TriggerSource::FrameClock, dwell)
            .map_err(scan_error)?;
        scan.start().map_err(scan_error)?;
        self.begin(config, exposure_s, None).await
    }

    /// Start an acquisition whose lifetime follows the scan generator:
    /// raw event lists binned per pixel, or masked per-pixel frames.
    pub async fn start_synchronized_from_scan(
        &self,
        mut config: DetectorConfig,
        exposure_s: f64,
    ) -> CoreResult<()> {
        let allowed = matches!(
            config.mode,
            AcquisitionMode::Event4DRaw
                | AcquisitionMode::EventListScan
                | AcquisitionMode::Frame4DMasked
        );
        if !allowed {
            return Err(Tpx3Error::State(format!(
                "{:?} is not a scan-synchronized mode",
                config.mode
            )));
        }
        let scan = self.require_scan()?;
        let dwell = scan.dwell_time().map_err(scan_error)?;
        let (scan_w, scan_h) = scan.scan_size().map_err(scan_error)?;
        config.scan_width = scan_w;
        config.scan_height = scan_h;
        config.pixel_dwell_ns = dwell.as_nanos() as u64;
        let target = u64::from(scan_w) * u64::from(scan_h);
        scan.arm_trigger(TriggerSource::FrameClock, dwell)
            .map_err(scan_error)?;
        scan.set_sequence_target(target).map_err(scan_error)?;
        scan.start().map_err(scan_error)?;
        let sequence_target = match config.mode.regime() {
            FramingRegime::RawEvents => Some(target),
            FramingRegime::HeaderFramed => None,
        };
        self.begin(config, exposure_s, sequence_target).await
    }

    /// End the current session. Safe to call when nothing is running.
    pub async fn stop(&self) -> CoreResult<()> {
        let (handle, mode) = {
            let mut session = self.session.lock();
            let Some(sess) = session.as_mut() else {
                return Ok(());
            };
            let Some(handle) = sess.handle.take() else {
                return Ok(());
            };
            sess.stop.store(true, Ordering::SeqCst);
            (handle, sess.config.mode)
        };
        *self.status.lock() = AcquisitionStatus::Stopping;

        if mode.is_scan_synchronized() {
            if let Some(scan) = &self.scan {
                if let Ok(true) = scan.is_playing() {
                    if let Err(err) = scan.stop() {
                        tracing::warn!(%err, "failed to stop scan generator");
                    }
                }
            }
        }
        if let Err(err) = self.control.stop_measurement().await {
            tracing::warn!(%err, "measurement stop request failed");
        }
        if let Err(err) = handle.await {
            tracing::warn!(%err, "stream worker join failed");
        }
        *self.status.lock() = AcquisitionStatus::Idle;
        Ok(())
    }

    /// Current client-side status. A worker that finished on its own
    /// (windowed completion, scan end, remote close) reads as idle even
    /// before `stop` reaps it.
    pub fn status(&self) -> AcquisitionStatus {
        let status = *self.status.lock();
        if status == AcquisitionStatus::Streaming {
            let session = self.session.lock();
            if let Some(sess) = session.as_ref() {
                let finished = sess.handle.as_ref().is_none_or(|h| h.is_finished());
                if finished {
                    return AcquisitionStatus::Idle;
                }
            }
        }
        status
    }

    /// Frames applied (or events binned) in the current session.
    pub fn frame_number(&self) -> u64 {
        self.session
            .lock()
            .as_ref()
            .map_or(0, |sess| sess.progress.load(Ordering::SeqCst))
    }

    /// Consistent copy of the acquisition buffer, or `None` before the
    /// first start. The copy is taken under the buffer lock so it never
    /// shows a half-applied record.
    pub fn frame_snapshot(&self) -> Option<FrameSnapshot> {
        let session = self.session.lock();
        let sess = session.as_ref()?;
        let buffer = sess.buffer.read();
        Some(FrameSnapshot {
            shape: buffer.shape().to_vec(),
            element_type: buffer.element_type(),
            data: buffer.as_bytes().to_vec(),
            progress: sess.progress.load(Ordering::SeqCst),
        })
    }

    /// Wait until the buffer advances past its current state, returning
    /// the new progress count.
    pub async fn wait_for_data(&self, timeout: Duration) -> CoreResult<u64> {
        let mut rx = self
            .session
            .lock()
            .as_ref()
            .map(|sess| sess.data_ready.clone())
            .ok_or_else(|| Tpx3Error::State("no acquisition in progress".into()))?;
        match tokio::time::timeout(timeout, rx.changed()).await {
            Err(_) => Err(Tpx3Error::State("timed out waiting for data".into())),
            // A dropped sender means the worker exited; whatever count it
            // last published is the final one.
            Ok(_) => Ok(*rx.borrow()),
        }
    }

    fn require_scan(&self) -> CoreResult<&Arc<dyn ScanCollaborator>> {
        self.scan
            .as_ref()
            .ok_or_else(|| Tpx3Error::State("no scan generator attached".into()))
    }

    async fn begin(
        &self,
        config: DetectorConfig,
        exposure_s: f64,
        sequence_target: Option<u64>,
    ) -> CoreResult<()> {
        // A start while streaming supersedes the running session: stop
        // it, then proceed. Only a start racing a Preparing/Stopping
        // transition is refused.
        loop {
            {
                let mut status = self.status.lock();
                match self.status_with(*status) {
                    AcquisitionStatus::Idle => {
                        *status = AcquisitionStatus::Preparing;
                        break;
                    }
                    AcquisitionStatus::Streaming => {}
                    other => {
                        return Err(Tpx3Error::State(format!("cannot start while {other:?}")));
                    }
                }
            }
            self.stop().await?;
        }
        match self.launch(config, exposure_s, sequence_target).await {
            Ok(session) => {
                *self.session.lock() = Some(session);
                *self.status.lock() = AcquisitionStatus::Streaming;
                Ok(())
            }
            Err(err) => {
                *self.status.lock() = AcquisitionStatus::Idle;
                Err(err)
            }
        }
    }

    /// `status()` logic against an already-held status value, so `begin`
    /// can test-and-set under one lock.
    fn status_with(&self, status: AcquisitionStatus) -> AcquisitionStatus {
        if status == AcquisitionStatus::Streaming {
            let session = self.session.lock();
            if let Some(sess) = session.as_ref() {
                if sess.handle.as_ref().is_none_or(|h| h.is_finished()) {
                    return AcquisitionStatus::Idle;
                }
            }
        }
        status
    }

    async fn launch(
        &self,
        config: DetectorConfig,
        exposure_s: f64,
        sequence_target: Option<u64>,
    ) -> CoreResult<Session> {
        let routing = if config.save_locally || config.mode == AcquisitionMode::SaveAllLocally {
            DestinationRouting::SaveWithPreview
        } else {
            DestinationRouting::Stream
        };

        self.control.push_config(&config, exposure_s).await?;
        self.control
            .set_destination(routing, config.routing_port)
            .await?;
        self.control.start_measurement().await?;

        let buffer = Arc::new(RwLock::new(DataBuffer::allocate(&config)?));
        let socket = {
            let (host, port) = self.control.data_endpoint();
            let host = host.to_owned();
            let handshake = config.clone();
            tokio::task::spawn_blocking(move || connect_data_plane(&host, port, &handshake))
                .await
                .map_err(|err| Tpx3Error::Transport(format!("connect task failed: {err}")))??
        };

        let stop = Arc::new(AtomicBool::new(false));
        let progress = Arc::new(AtomicU64::new(0));
        let (tx, rx) = watch::channel(0u64);
        let worker = StreamWorker::new(
            socket,
            config.clone(),
            Arc::clone(&buffer),
            Arc::clone(&stop),
            Arc::clone(&progress),
            tx,
            self.scan.clone(),
            sequence_target,
        );
        let handle = tokio::task::spawn_blocking(move || worker.run());
        tracing::info!(mode = ?config.mode, "acquisition started");

        Ok(Session {
            config,
            stop,
            progress,
            buffer,
            data_ready: rx,
            handle: Some(handle),
        })
    }
}

fn scan_error(err: anyhow::Error) -> Tpx3Error {
    Tpx3Error::State(format!("scan generator: {err}"))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn driver_config_defaults() {
        let config = Tpx3DriverConfig::default();
        assert_eq!(config.data_port, 8088);
        assert!(config.pixel_mask_file.is_none());
    }

    #[test]
    fn driver_config_partial_toml() {
        let config: Tpx3DriverConfig = toml::from_str(
            r#"
            server_url = "http://tpx3:8080"
            pixel_mask_file = "/configs/eq.bpc"
            "#,
        )
        .unwrap();
        assert_eq!(config.server_url, "http://tpx3:8080");
        assert_eq!(config.data_host, "127.0.0.1");
        assert_eq!(config.pixel_mask_file.as_deref(), Some("/configs/eq.bpc"));
    }

    #[test]
    fn driver_config_rejects_unknown_keys() {
        let parsed: Result<Tpx3DriverConfig, _> = toml::from_str("serverurl = \"x\"");
        assert!(parsed.is_err());
    }
}
