use serde::{Deserialize, Serialize};
use std::fmt;
use std::time::Duration;
use time::OffsetDateTime;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunConfig {
    pub base_url: String,
    pub download_bytes_per_req: u64,
    pub upload_bytes_per_req: u64,
    #[serde(with = "humantime_serde")]
    pub download_duration: Duration,
    #[serde(with = "humantime_serde")]
    pub upload_duration: Duration,
    pub ping_samples: u32,
    pub gauge_max_mbps: f64,
    pub user_agent: String,
}

/// Server metadata discovered before the measurement phases begin.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ServerInfo {
    #[serde(default)]
    pub sponsor: Option<String>,
    #[serde(default)]
    pub city: Option<String>,
    #[serde(default)]
    pub country: Option<String>,
}

/// Stage events emitted by the engine, in run order.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum ProgressEvent {
    FindingServer,
    Pinging {
        server: ServerInfo,
    },
    Downloading {
        mbps: f64,
    },
    Uploading {
        mbps: f64,
    },
    Finalizing,
    /// Stage tags this crate does not know about pass through verbatim.
    Stage {
        label: String,
        mbps: Option<f64>,
    },
}

/// Events delivered to the dashboard: engine progress plus run lifecycle.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum UiEvent {
    Progress(ProgressEvent),
    RunCompleted {
        // Box to keep UiEvent size small; SpeedResult would bloat the enum.
        result: Box<SpeedResult>,
    },
    RunFailed {
        message: String,
    },
    RunCancelled,
    RunStopped,
    Notice(String),
}

/// Immutable record of one completed run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SpeedResult {
    pub ping_ms: f64,
    #[serde(default)]
    pub jitter_ms: Option<f64>,
    pub download_mbps: f64,
    pub upload_mbps: f64,
    /// Percent of probes lost, when the workload measures it.
    #[serde(default)]
    pub packet_loss: Option<f64>,
    #[serde(default)]
    pub server_name: Option<String>,
    #[serde(default)]
    pub isp: Option<String>,
    #[serde(with = "time::serde::rfc3339")]
    pub timestamp: OffsetDateTime,
}

/// Dashboard status as shown in the status bar.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum Status {
    Idle,
    FindingServer,
    Pinging,
    Downloading,
    Uploading,
    Finalizing,
    Complete,
    Error,
    Cancelled,
    Stopped,
    /// Uppercased passthrough for stage labels with no dedicated state.
    Other(String),
}

impl Status {
    pub fn label(&self) -> &str {
        match self {
            Status::Idle => "IDLE",
            Status::FindingServer => "FINDING SERVER",
            Status::Pinging => "PINGING",
            Status::Downloading => "DOWNLOADING",
            Status::Uploading => "UPLOADING",
            Status::Finalizing => "FINALIZING",
            Status::Complete => "COMPLETE",
            Status::Error => "ERROR",
            Status::Cancelled => "CANCELLED",
            Status::Stopped => "STOPPED",
            Status::Other(label) => label,
        }
    }
}

impl fmt::Display for Status {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.label())
    }
}
