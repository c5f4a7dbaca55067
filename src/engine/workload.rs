use anyhow::Result;

use crate::model::ServerInfo;

/// One progress callback from a transfer phase.
///
/// Counters are cumulative within the phase: total bytes moved so far and
/// seconds since the phase started.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct TransferProgress {
    pub bytes_transferred: u64,
    pub elapsed_secs: f64,
}

/// Aggregate output of a workload in the units measurement libraries report:
/// latency in milliseconds, throughput in bits per second, loss in percent.
#[derive(Debug, Clone, Default)]
pub struct RawResults {
    pub ping_ms: f64,
    pub jitter_ms: Option<f64>,
    pub download_bps: f64,
    pub upload_bps: f64,
    pub packet_loss: Option<f64>,
    pub server: Option<ServerInfo>,
    pub isp: Option<String>,
}

/// Measurement backend driven by the engine, one stage per method.
///
/// Implementations do blocking I/O; the engine hosts them on a blocking
/// task and never calls them from an async context. `download` and `upload`
/// fire the progress callback with cumulative counters; the engine turns
/// those into speed samples.
pub trait Workload: Send {
    fn find_server(&mut self) -> Result<ServerInfo>;
    fn ping(&mut self, server: &ServerInfo) -> Result<()>;
    fn download(&mut self, on_progress: &mut dyn FnMut(TransferProgress)) -> Result<()>;
    fn upload(&mut self, on_progress: &mut dyn FnMut(TransferProgress)) -> Result<()>;
    fn results(&mut self) -> Result<RawResults>;
}
