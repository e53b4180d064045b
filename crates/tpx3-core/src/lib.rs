//! Core types for the Timepix3/CheeTah detector driver.
//!
//! This crate holds everything the streaming driver needs that does not
//! touch a socket: the acquisition mode table, the detector configuration
//! record with its shape/element derivation, the flat acquisition buffer
//! and its mutation policies, the error taxonomy, and the capability trait
//! for the external raster-scan generator.
//!
//! The companion crate `tpx3-driver` owns all I/O (control-plane HTTP and
//! the data-plane TCP reader).

pub mod buffer;
pub mod config;
pub mod error;
pub mod limits;
pub mod mode;
pub mod scan;

pub use buffer::{DataBuffer, ElementType};
pub use config::DetectorConfig;
pub use error::{CoreResult, Tpx3Error};
pub use mode::{AcquisitionMode, ApplyPolicy, FramingRegime};
pub use scan::{MockScan, ScanCollaborator, TriggerSource};
