pub mod http;
pub mod workload;

use std::fmt;
use std::sync::{
    atomic::{AtomicBool, Ordering},
    Arc,
};

use anyhow::anyhow;
use time::OffsetDateTime;
use tokio::sync::mpsc;

use crate::model::{ProgressEvent, ServerInfo, SpeedResult};

use self::workload::{RawResults, TransferProgress, Workload};

/// Cooperative cancellation flag shared between a run and its supervisor.
///
/// The engine only consults it between stages, so cancellation latency is
/// bounded by the duration of the current stage.
#[derive(Debug, Clone, Default)]
pub struct CancelToken(Arc<AtomicBool>);

impl CancelToken {
    pub fn cancel(&self) {
        self.0.store(true, Ordering::Relaxed);
    }

    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::Relaxed)
    }
}

/// Terminal outcome of a failed run.
#[derive(Debug)]
pub enum EngineError {
    /// The cancel flag was observed at a stage boundary.
    Cancelled,
    /// The measurement workload failed.
    Workload(anyhow::Error),
}

impl fmt::Display for EngineError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            EngineError::Cancelled => f.write_str("run cancelled"),
            EngineError::Workload(e) => write!(f, "workload failed: {e}"),
        }
    }
}

impl std::error::Error for EngineError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            EngineError::Cancelled => None,
            EngineError::Workload(e) => {
                let err: &(dyn std::error::Error + 'static) = e.as_ref();
                Some(err)
            }
        }
    }
}

/// Drives one measurement run over a [`Workload`], emitting stage events.
///
/// An engine executes at most one run; `run` consumes it. Supervisors build
/// a fresh engine per run and keep its [`CancelToken`].
pub struct SpeedtestEngine<W> {
    workload: W,
    cancel: CancelToken,
}

impl<W: Workload + 'static> SpeedtestEngine<W> {
    pub fn new(workload: W) -> Self {
        Self {
            workload,
            cancel: CancelToken::default(),
        }
    }

    pub fn cancel_token(&self) -> CancelToken {
        self.cancel.clone()
    }

    /// Execute the full stage sequence on a blocking task.
    ///
    /// The caller's task stays responsive; stage events arrive on `events`
    /// as the run progresses. Event sends ignore a departed subscriber.
    pub async fn run(
        self,
        events: mpsc::UnboundedSender<ProgressEvent>,
    ) -> Result<SpeedResult, EngineError> {
        let Self {
            mut workload,
            cancel,
        } = self;
        tokio::task::spawn_blocking(move || run_blocking(&mut workload, &cancel, &events))
            .await
            .map_err(|e| EngineError::Workload(anyhow!("run task failed: {e}")))?
    }
}

fn run_blocking<W: Workload>(
    workload: &mut W,
    cancel: &CancelToken,
    events: &mpsc::UnboundedSender<ProgressEvent>,
) -> Result<SpeedResult, EngineError> {
    let emit = |ev: ProgressEvent| {
        let _ = events.send(ev);
    };

    emit(ProgressEvent::FindingServer);
    let server = workload
        .find_server()
        .map_err(|e| EngineError::Workload(e.context("find server")))?;
    check_cancelled(cancel)?;

    emit(ProgressEvent::Pinging {
        server: server.clone(),
    });
    workload
        .ping(&server)
        .map_err(|e| EngineError::Workload(e.context("ping")))?;
    check_cancelled(cancel)?;

    let mut download_samples: Vec<f64> = Vec::new();
    emit(ProgressEvent::Downloading { mbps: 0.0 });
    workload
        .download(&mut |p| {
            if let Some(mbps) = sample_mbps(p) {
                download_samples.push(mbps);
                emit(ProgressEvent::Downloading { mbps });
            }
        })
        .map_err(|e| EngineError::Workload(e.context("download")))?;
    check_cancelled(cancel)?;

    let mut upload_samples: Vec<f64> = Vec::new();
    emit(ProgressEvent::Uploading { mbps: 0.0 });
    workload
        .upload(&mut |p| {
            if let Some(mbps) = sample_mbps(p) {
                upload_samples.push(mbps);
                emit(ProgressEvent::Uploading { mbps });
            }
        })
        .map_err(|e| EngineError::Workload(e.context("upload")))?;
    check_cancelled(cancel)?;

    emit(ProgressEvent::Finalizing);
    let raw = workload
        .results()
        .map_err(|e| EngineError::Workload(e.context("collect results")))?;
    Ok(assemble_result(raw, &download_samples, &upload_samples))
}

fn check_cancelled(cancel: &CancelToken) -> Result<(), EngineError> {
    if cancel.is_cancelled() {
        return Err(EngineError::Cancelled);
    }
    Ok(())
}

/// Speed from cumulative phase counters. A non-positive elapsed time would
/// divide by zero; those callbacks are discarded.
fn sample_mbps(p: TransferProgress) -> Option<f64> {
    if p.elapsed_secs <= 0.0 {
        return None;
    }
    Some((p.bytes_transferred as f64 * 8.0) / 1_000_000.0 / p.elapsed_secs)
}

fn assemble_result(
    raw: RawResults,
    download_samples: &[f64],
    upload_samples: &[f64],
) -> SpeedResult {
    let mut download_mbps = raw.download_bps / 1_000_000.0;
    let mut upload_mbps = raw.upload_bps / 1_000_000.0;

    // An aggregate the workload could not produce falls back to the best
    // instantaneous sample observed during the phase.
    if download_mbps <= 0.0 {
        if let Some(best) = max_sample(download_samples) {
            download_mbps = best;
        }
    }
    if upload_mbps <= 0.0 {
        if let Some(best) = max_sample(upload_samples) {
            upload_mbps = best;
        }
    }

    SpeedResult {
        ping_ms: raw.ping_ms.max(0.0),
        jitter_ms: raw.jitter_ms,
        download_mbps: download_mbps.max(0.0),
        upload_mbps: upload_mbps.max(0.0),
        packet_loss: raw.packet_loss,
        server_name: raw.server.as_ref().and_then(server_name),
        isp: raw.isp,
        timestamp: OffsetDateTime::now_utc(),
    }
}

fn max_sample(samples: &[f64]) -> Option<f64> {
    samples.iter().copied().reduce(f64::max)
}

/// Compose `"{sponsor} ({city}, {country})"`, dropping absent parts along
/// with their separators and parentheses.
fn server_name(server: &ServerInfo) -> Option<String> {
    let location = [server.city.as_deref(), server.country.as_deref()]
        .into_iter()
        .flatten()
        .filter(|part| !part.is_empty())
        .collect::<Vec<_>>()
        .join(", ");
    let sponsor = server.sponsor.as_deref().filter(|s| !s.is_empty());
    match (sponsor, location.is_empty()) {
        (Some(sponsor), false) => Some(format!("{sponsor} ({location})")),
        (Some(sponsor), true) => Some(sponsor.to_string()),
        (None, false) => Some(location),
        (None, true) => None,
    }
}
