//! Synchronous request/response client for the detector's
//! configuration server.
//!
//! The server speaks a SERVAL-style HTTP API: configuration documents go
//! up as JSON, the dashboard comes back as JSON, and measurement
//! start/stop are plain GETs. Every call that can fail due to transport
//! unavailability returns a recoverable [`Tpx3Error::Transport`] so a
//! detector in simulation/offline mode still constructs; callers log and
//! carry on.

use serde::Deserialize;
use serde_json::json;
use tpx3_core::config::DetectorConfig;
use tpx3_core::error::{CoreResult, Tpx3Error};
use tpx3_core::limits::CONTROL_TIMEOUT;

/// Default control-plane port of the detector server.
pub const DEFAULT_CONTROL_PORT: u16 = 8080;

/// Counting-mode labels selected by the routing port.
const ROUTING_MODES: [&str; 4] = ["count", "tot", "toa", "tof"];

/// Server-side measurement status, as reported by the dashboard.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ServerStatus {
    Idle,
    Preparing,
    Recording,
    Stopping,
}

impl ServerStatus {
    fn from_label(label: &str) -> CoreResult<Self> {
        match label {
            "DA_IDLE" | "IDLE" => Ok(ServerStatus::Idle),
            "DA_PREPARING" | "PREPARING" => Ok(ServerStatus::Preparing),
            "DA_RECORDING" | "RECORDING" => Ok(ServerStatus::Recording),
            "DA_STOPPING" | "STOPPING" => Ok(ServerStatus::Stopping),
            other => Err(Tpx3Error::Decode(format!("unknown server status '{other}'"))),
        }
    }
}

/// Current measurement block of the dashboard document.
#[derive(Debug, Clone, Deserialize)]
pub struct MeasurementInfo {
    /// Status string among IDLE/PREPARING/RECORDING/STOPPING.
    #[serde(rename = "Status")]
    pub status: String,
    /// Active measurement id, or null when idle.
    #[serde(rename = "ID", default)]
    pub id: Option<u64>,
}

/// Dashboard document returned by `GET /dashboard`.
#[derive(Debug, Clone, Deserialize)]
pub struct Dashboard {
    #[serde(rename = "Measurement")]
    pub measurement: MeasurementInfo,
}

impl Dashboard {
    /// Parsed measurement status.
    pub fn status(&self) -> CoreResult<ServerStatus> {
        ServerStatus::from_label(&self.measurement.status)
    }
}

/// Kind of calibration profile the server can load.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CalibrationKind {
    /// Binary pixel-mask configuration (bpc).
    PixelMask,
    /// DAC threshold settings (dacs).
    Threshold,
}

impl CalibrationKind {
    fn format_label(self) -> &'static str {
        match self {
            CalibrationKind::PixelMask => "pixelconfig",
            CalibrationKind::Threshold => "dacs",
        }
    }
}

/// Where the server routes the acquired stream.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DestinationRouting {
    /// Loop the stream back over TCP to this driver.
    Stream,
    /// Persist the raw stream on the server host.
    SaveLocally,
    /// Persist and additionally stream an integrating preview.
    SaveWithPreview,
}

/// Stateless wrapper issuing bounded request/response calls.
#[derive(Debug, Clone)]
pub struct ControlPlaneClient {
    http: reqwest::Client,
    base: String,
    data_host: String,
    data_port: u16,
}

fn transport(err: reqwest::Error) -> Tpx3Error {
    Tpx3Error::Transport(err.to_string())
}

impl ControlPlaneClient {
    /// Client for `base` (e.g. `http://129.175.108.52:8080`), announcing
    /// `data_host:data_port` as the loop-back stream destination.
    pub fn new(base: impl Into<String>, data_host: impl Into<String>, data_port: u16) -> CoreResult<Self> {
        let http = reqwest::Client::builder()
            .timeout(CONTROL_TIMEOUT)
            .build()
            .map_err(transport)?;
        Ok(Self {
            http,
            base: base.into().trim_end_matches('/').to_string(),
            data_host: data_host.into(),
            data_port,
        })
    }

    /// Host and port the data plane loops the stream back to.
    pub fn data_endpoint(&self) -> (&str, u16) {
        (&self.data_host, self.data_port)
    }

    /// HTTP status of a bare GET against the server root.
    pub async fn status_code(&self) -> CoreResult<u16> {
        let resp = self.http.get(&self.base).send().await.map_err(transport)?;
        Ok(resp.status().as_u16())
    }

    /// Current measurement status and id.
    pub async fn dashboard(&self) -> CoreResult<Dashboard> {
        let resp = self
            .http
            .get(format!("{}/dashboard", self.base))
            .send()
            .await
            .map_err(transport)?;
        resp.json().await.map_err(transport)
    }

    /// Load a calibration profile from a file known to the server host.
    pub async fn load_calibration(&self, kind: CalibrationKind, file: &str) -> CoreResult<()> {
        let url = format!(
            "{}/config/load?format={}&file={}",
            self.base,
            kind.format_label(),
            file
        );
        let resp = self.http.get(url).send().await.map_err(transport)?;
        let body = resp.text().await.map_err(transport)?;
        tracing::info!(kind = kind.format_label(), response = %body, "calibration profile loaded");
        Ok(())
    }

    /// Current server-side detector configuration document.
    pub async fn get_config(&self) -> CoreResult<serde_json::Value> {
        let resp = self
            .http
            .get(format!("{}/detector/config", self.base))
            .send()
            .await
            .map_err(transport)?;
        resp.json().await.map_err(transport)
    }

    /// Push the acquisition configuration for the coming measurement.
    ///
    /// The local record is augmented with the continuous-trigger fields
    /// the server expects before a start.
    pub async fn push_config(&self, config: &DetectorConfig, exposure_s: f64) -> CoreResult<()> {
        let mut document = serde_json::to_value(config)
            .map_err(|err| Tpx3Error::Config(format!("config encode failed: {err}")))?;
        document["nTriggers"] = json!(99);
        document["TriggerMode"] = json!("CONTINUOUS");
        document["ExposureTime"] = json!(exposure_s);
        document["BiasVoltage"] = json!(config.bias_voltage);

        self.http
            .put(format!("{}/detector/config", self.base))
            .json(&document)
            .send()
            .await
            .map_err(transport)?;
        Ok(())
    }

    /// Read-modify-write of the server-side exposure time.
    pub async fn set_exposure(&self, exposure_s: f64) -> CoreResult<()> {
        let mut document = self.get_config().await?;
        document["ExposureTime"] = json!(exposure_s);
        self.http
            .put(format!("{}/detector/config", self.base))
            .json(&document)
            .send()
            .await
            .map_err(transport)?;
        Ok(())
    }

    /// Select where the acquired stream goes.
    ///
    /// `routing_port` picks the counting mode of the streamed images
    /// (counts / ToT / ToA / ToF).
    pub async fn set_destination(
        &self,
        routing: DestinationRouting,
        routing_port: u8,
    ) -> CoreResult<()> {
        let mode = ROUTING_MODES
            .get(routing_port as usize)
            .ok_or_else(|| Tpx3Error::Config(format!("routing port {routing_port} out of range")))?;
        let stream_base = format!("tcp://{}:{}", self.data_host, self.data_port);

        let image_channels = json!([
            {"Base": stream_base, "Format": "jsonimage", "Mode": mode},
            {
                "Base": format!("tcp://{}:{}", self.data_host, self.data_port + 1),
                "Format": "jsonimage",
                "Mode": mode,
                "IntegrationSize": -1,
                "IntegrationMode": "Sum",
            },
        ]);
        let raw_channel = json!([{"Base": "file:///data", "FilePattern": "raw%MdHms_"}]);

        let document = match routing {
            DestinationRouting::Stream => json!({ "Image": image_channels }),
            DestinationRouting::SaveLocally => json!({ "Raw": raw_channel }),
            DestinationRouting::SaveWithPreview => {
                json!({ "Raw": raw_channel, "Image": image_channels })
            }
        };

        self.http
            .put(format!("{}/server/destination", self.base))
            .json(&document)
            .send()
            .await
            .map_err(transport)?;
        tracing::info!(?routing, mode, "destination routing updated");
        Ok(())
    }

    /// Begin a server-side measurement.
    pub async fn start_measurement(&self) -> CoreResult<()> {
        self.http
            .get(format!("{}/measurement/start", self.base))
            .send()
            .await
            .map_err(transport)?;
        Ok(())
    }

    /// End the server-side measurement.
    pub async fn stop_measurement(&self) -> CoreResult<()> {
        self.http
            .get(format!("{}/measurement/stop", self.base))
            .send()
            .await
            .map_err(transport)?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn status_labels_parse_with_and_without_prefix() {
        assert_eq!(ServerStatus::from_label("DA_IDLE").unwrap(), ServerStatus::Idle);
        assert_eq!(
            ServerStatus::from_label("RECORDING").unwrap(),
            ServerStatus::Recording
        );
        assert!(ServerStatus::from_label("DA_BROKEN").is_err());
    }

    #[test]
    fn dashboard_deserializes_null_measurement_id() {
        let dashboard: Dashboard = serde_json::from_str(
            r#"{"Measurement": {"Status": "DA_IDLE", "ID": null}}"#,
        )
        .unwrap();
        assert_eq!(dashboard.measurement.id, None);
        assert_eq!(dashboard.status().unwrap(), ServerStatus::Idle);
    }

    #[test]
    fn routing_port_out_of_range_is_config_error() {
        // The lookup is pure; exercise it without a server.
        assert!(ROUTING_MODES.get(4).is_none());
        assert_eq!(ROUTING_MODES[1], "tot");
    }
}
