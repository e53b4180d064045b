//! Mutable acquisition parameter record.
//!
//! [`DetectorConfig`] is created once per controller and mutated
//! immediately before every start call. The destination array's shape and
//! element width are pure functions of the record, derived here; the
//! driver pushes the same record to the control plane and sends its
//! serialized form as the data-plane handshake.

use crate::buffer::ElementType;
use crate::error::{CoreResult, Tpx3Error};
use crate::mode::AcquisitionMode;
use serde::{Deserialize, Serialize};

/// Native width of the CheeTah quad sensor in pixels.
pub const DETECTOR_WIDTH: u32 = 1024;
/// Native height of the CheeTah quad sensor in pixels.
pub const DETECTOR_HEIGHT: u32 = 256;

/// Acquisition parameters in effect for the next measurement.
///
/// Width/height fields are meaningful only for the modes that reference
/// them: `spim_*` sizes the hyperspectral scan, `scan_*` sizes the
/// synchronized event modes, `chrono_line_count` sizes the chronogram.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DetectorConfig {
    /// Collapse frames to a single spectral line at shape level.
    pub soft_binning: bool,
    /// Element byte width of buffer cells and event words (1/2/4/8).
    pub byte_width: u8,
    /// Server-side integration across exposures.
    pub cumulative: bool,
    /// Active acquisition mode.
    pub mode: AcquisitionMode,
    /// Detector readout width in pixels.
    pub width: u32,
    /// Detector readout height in pixels.
    pub height: u32,
    /// Hyperspectral scan width in pixels.
    pub spim_width: u32,
    /// Hyperspectral scan height in pixels.
    pub spim_height: u32,
    /// Synchronized-scan width in pixels.
    pub scan_width: u32,
    /// Synchronized-scan height in pixels.
    pub scan_height: u32,
    /// Number of lines in a chronogram.
    pub chrono_line_count: u32,
    /// Per-pixel dwell time in nanoseconds.
    pub pixel_dwell_ns: u64,
    /// Coincidence window delay, in units of 1.5625 ns.
    pub coincidence_delay: u64,
    /// Coincidence window width, in units of 1.5625 ns.
    pub coincidence_width: u64,
    /// Record per-event arrival times instead of plain counts.
    pub time_resolved: bool,
    /// Persist the raw stream server-side.
    pub save_locally: bool,
    /// Identifier of the loaded pixel-mask (bpc) profile.
    pub pixel_mask_profile: u32,
    /// Identifier of the loaded threshold (dacs) profile.
    pub threshold_profile: u32,
    /// Sensor bias voltage in volts.
    pub bias_voltage: f64,
    /// Counting-mode routing port (0 = counts, 1 = ToT, 2 = ToA, 3 = ToF).
    pub routing_port: u8,
    /// Free calibration scalar: energy/angle scale per channel.
    pub calibration_scale: f64,
    /// Free calibration scalar: offset of the first channel.
    pub calibration_offset: f64,
}

impl Default for DetectorConfig {
    fn default() -> Self {
        Self {
            soft_binning: false,
            byte_width: 2,
            cumulative: false,
            mode: AcquisitionMode::Frame,
            width: DETECTOR_WIDTH,
            height: DETECTOR_HEIGHT,
            spim_width: 64,
            spim_height: 64,
            scan_width: 64,
            scan_height: 64,
            chrono_line_count: 256,
            pixel_dwell_ns: 1_000,
            coincidence_delay: 104,
            coincidence_width: 50,
            time_resolved: false,
            save_locally: false,
            pixel_mask_profile: 0,
            threshold_profile: 0,
            bias_voltage: 140.0,
            routing_port: 0,
            calibration_scale: 1.0,
            calibration_offset: 0.0,
        }
    }
}

impl DetectorConfig {
    /// Destination array shape for the active mode, slowest axis first.
    ///
    /// Fails loudly for a zero dimension rather than allocating an empty
    /// buffer a decode loop would silently index past.
    pub fn array_shape(&self) -> CoreResult<Vec<usize>> {
        let shape: Vec<usize> = match self.mode {
            AcquisitionMode::Frame
            | AcquisitionMode::FrameBased
            | AcquisitionMode::Cumulative
            | AcquisitionMode::SaveAllLocally => {
                if self.soft_binning {
                    vec![1, self.width as usize]
                } else {
                    vec![self.height as usize, self.width as usize]
                }
            }
            AcquisitionMode::FastChrono | AcquisitionMode::CoincidenceChrono => {
                vec![self.chrono_line_count as usize, self.width as usize]
            }
            AcquisitionMode::EventHyperspec | AcquisitionMode::EventHyperspecCoincidence => vec![
                self.spim_height as usize,
                self.spim_width as usize,
                self.width as usize,
            ],
            AcquisitionMode::Event4DRaw => vec![
                self.scan_height as usize,
                self.scan_width as usize,
                self.height as usize,
                self.width as usize,
            ],
            AcquisitionMode::EventListScan | AcquisitionMode::Frame4DMasked => {
                vec![self.scan_height as usize, self.scan_width as usize]
            }
        };
        if shape.iter().any(|&dim| dim == 0) {
            return Err(Tpx3Error::Config(format!(
                "mode {:?} produced a zero dimension in shape {:?}",
                self.mode, shape
            )));
        }
        Ok(shape)
    }

    /// Element type of buffer cells and stream words.
    pub fn element_type(&self) -> CoreResult<ElementType> {
        ElementType::from_byte_width(self.byte_width)
    }

    /// Total number of elements in the destination array.
    pub fn element_count(&self) -> CoreResult<usize> {
        Ok(self.array_shape()?.iter().product())
    }

    /// Total byte length of the destination array.
    pub fn byte_len(&self) -> CoreResult<usize> {
        let count = self.element_count()?;
        count
            .checked_mul(self.element_type()?.width())
            .ok_or(Tpx3Error::Config("buffer byte length overflowed".into()))
    }

    /// Deterministic handshake encoding of all fields.
    ///
    /// Sent once over the data socket immediately after connect, before
    /// the server begins streaming. Compact JSON in declaration order,
    /// newline-terminated so the server can frame it with a line read.
    pub fn serialize(&self) -> CoreResult<Vec<u8>> {
        let mut encoded = serde_json::to_vec(self)
            .map_err(|err| Tpx3Error::Config(format!("handshake encode failed: {err}")))?;
        encoded.push(b'\n');
        Ok(encoded)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn frame_shape_follows_readout_and_binning() {
        let mut config = DetectorConfig::default();
        assert_eq!(config.array_shape().unwrap(), vec![256, 1024]);

        config.soft_binning = true;
        assert_eq!(config.array_shape().unwrap(), vec![1, 1024]);
    }

    #[test]
    fn hyperspec_shape_is_scan_by_spectrum() {
        let config = DetectorConfig {
            mode: AcquisitionMode::EventHyperspec,
            spim_width: 32,
            spim_height: 16,
            ..DetectorConfig::default()
        };
        assert_eq!(config.array_shape().unwrap(), vec![16, 32, 1024]);
    }

    #[test]
    fn raw_4d_shape_is_scan_by_detector() {
        let config = DetectorConfig {
            mode: AcquisitionMode::Event4DRaw,
            scan_width: 8,
            scan_height: 4,
            byte_width: 1,
            ..DetectorConfig::default()
        };
        assert_eq!(config.array_shape().unwrap(), vec![4, 8, 256, 1024]);
        assert_eq!(config.byte_len().unwrap(), 4 * 8 * 256 * 1024);
    }

    #[test]
    fn zero_dimension_fails_loudly() {
        let config = DetectorConfig {
            mode: AcquisitionMode::EventListScan,
            scan_width: 0,
            ..DetectorConfig::default()
        };
        assert!(matches!(config.array_shape(), Err(Tpx3Error::Config(_))));
    }

    #[test]
    fn invalid_byte_width_is_rejected() {
        let config = DetectorConfig {
            byte_width: 3,
            ..DetectorConfig::default()
        };
        assert!(matches!(config.element_type(), Err(Tpx3Error::ByteWidth(3))));
    }

    #[test]
    fn shape_times_width_matches_byte_len() {
        let config = DetectorConfig {
            mode: AcquisitionMode::FastChrono,
            chrono_line_count: 100,
            byte_width: 4,
            ..DetectorConfig::default()
        };
        let elements: usize = config.array_shape().unwrap().iter().product();
        assert_eq!(config.byte_len().unwrap(), elements * 4);
    }

    #[test]
    fn handshake_is_deterministic_and_line_framed() {
        let config = DetectorConfig::default();
        let first = config.serialize().unwrap();
        let second = config.serialize().unwrap();
        assert_eq!(first, second);
        assert_eq!(first.last(), Some(&b'\n'));
        // Exactly one line; the payload itself must not embed newlines.
        assert_eq!(first.iter().filter(|&&b| b == b'\n').count(), 1);
    }
}
