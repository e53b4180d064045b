//! Client-side driver for Timepix3/CheeTah event-counting detectors
//! behind a SERVAL-style acquisition server.
//!
//! The server exposes two planes and this crate drives both:
//!
//! * a control plane, plain HTTP with JSON bodies, for configuration,
//!   calibration upload and measurement lifecycle
//!   ([`control::ControlPlaneClient`]);
//! * a data plane, a looped-back TCP stream carrying either
//!   header-framed frames or raw event words, consumed by a blocking
//!   worker that fills a shared acquisition buffer
//!   (driven through [`AcquisitionController`]).
//!
//! ```no_run
//! use std::time::Duration;
//! use tpx3_core::{AcquisitionMode, DetectorConfig};
//! use tpx3_driver::{AcquisitionController, Tpx3DriverConfig};
//!
//! #[tokio::main]
//! async fn main() -> anyhow::Result<()> {
//!     let endpoints = Tpx3DriverConfig::default();
//!     let controller = AcquisitionController::connect(endpoints, None).await?;
//!
//!     let detector = DetectorConfig {
//!         mode: AcquisitionMode::Frame,
//!         ..DetectorConfig::default()
//!     };
//!     controller.start_frame(detector, 0.1).await?;
//!     controller.wait_for_data(Duration::from_secs(2)).await?;
//!     if let Some(snapshot) = controller.frame_snapshot() {
//!         println!("{:?} {} frames", snapshot.shape, snapshot.progress);
//!     }
//!     controller.stop().await?;
//!     Ok(())
//! }
//! ```

pub mod control;
pub mod controller;
pub mod framing;
mod stream;

pub use control::{CalibrationKind, ControlPlaneClient, Dashboard, DestinationRouting, ServerStatus};
pub use controller::{
    AcquisitionController, AcquisitionStatus, FrameSnapshot, Tpx3DriverConfig,
};
pub use framing::{EventChunker, Record, RecordAssembler, RecordHeader};
