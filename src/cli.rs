use crate::engine::{EngineError, SpeedtestEngine};
use crate::engine::http::HttpWorkload;
use crate::model::{ProgressEvent, RunConfig, SpeedResult};
use crate::storage::HistoryStore;
use crate::units;
use anyhow::{Context, Result};
use clap::Parser;
use std::io::Write;
use std::time::Duration;
use tokio::sync::mpsc;

/// Output line routing for the stdout/stderr writer.
enum OutputLine {
    Stdout(String),
    Stderr(String),
}

/// Route stdout/stderr lines through a blocking task so async code never
/// writes to the terminal directly.
fn spawn_output_writer() -> (
    mpsc::UnboundedSender<OutputLine>,
    tokio::task::JoinHandle<()>,
) {
    let (tx, mut rx) = mpsc::unbounded_channel::<OutputLine>();
    let handle = tokio::task::spawn_blocking(move || {
        let stdout = std::io::stdout();
        let stderr = std::io::stderr();
        let mut out = std::io::LineWriter::new(stdout.lock());
        let mut err = std::io::LineWriter::new(stderr.lock());

        while let Some(line) = rx.blocking_recv() {
            match line {
                OutputLine::Stdout(msg) => {
                    let _ = writeln!(out, "{}", msg);
                }
                OutputLine::Stderr(msg) => {
                    let _ = writeln!(err, "{}", msg);
                }
            }
        }

        let _ = out.flush();
        let _ = err.flush();
    });
    (tx, handle)
}

#[derive(Debug, Parser, Clone)]
#[command(
    name = "speedline",
    version,
    about = "Terminal speed test dashboard with live gauges and run history"
)]
pub struct Cli {
    /// Base URL for the speed test service
    #[arg(long, default_value = "https://speed.cloudflare.com")]
    pub base_url: String,

    /// Print JSON result and exit (no TUI)
    #[arg(long)]
    pub json: bool,

    /// Print a text summary and exit (no TUI)
    #[arg(long)]
    pub text: bool,

    /// Download phase duration
    #[arg(long, default_value = "10s")]
    pub download_duration: humantime::Duration,

    /// Upload phase duration
    #[arg(long, default_value = "10s")]
    pub upload_duration: humantime::Duration,

    /// Bytes per download request
    #[arg(long, default_value_t = 10_000_000)]
    pub download_bytes: u64,

    /// Bytes per upload request
    #[arg(long, default_value_t = 5_000_000)]
    pub upload_bytes: u64,

    /// Latency probes per run
    #[arg(long, default_value_t = 10)]
    pub ping_samples: u32,

    /// Speedometer ceiling in Mbps
    #[arg(long, default_value_t = 1200.0)]
    pub gauge_max: f64,

    /// History file path (defaults to the per-user data directory)
    #[arg(long)]
    pub history_file: Option<std::path::PathBuf>,

    /// Use --auto-save true or --auto-save false to override
    #[arg(long, default_value_t = true, action = clap::ArgAction::Set)]
    pub auto_save: bool,

    /// Write the history export envelope to this path after a one-shot run
    #[arg(long)]
    pub export: Option<std::path::PathBuf>,
}

pub async fn run(args: Cli) -> Result<()> {
    #[cfg(feature = "tui")]
    if !args.json && !args.text {
        return crate::tui::run(args).await;
    }

    // One-shot modes (and builds without the TUI) log straight to stderr.
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();
    run_once(args).await
}

/// Assemble the engine configuration out of the parsed arguments.
pub fn build_config(args: &Cli) -> RunConfig {
    RunConfig {
        base_url: args.base_url.clone(),
        download_bytes_per_req: args.download_bytes,
        upload_bytes_per_req: args.upload_bytes,
        download_duration: Duration::from(args.download_duration),
        upload_duration: Duration::from(args.upload_duration),
        ping_samples: args.ping_samples,
        gauge_max_mbps: args.gauge_max,
        user_agent: format!("speedline/{}", env!("CARGO_PKG_VERSION")),
    }
}

fn history_store(args: &Cli) -> HistoryStore {
    match args.history_file.as_ref() {
        Some(path) => HistoryStore::new(path),
        None => HistoryStore::at_default(),
    }
}

/// Drive a single headless run: stage progress to stderr, result to stdout.
async fn run_once(args: Cli) -> Result<()> {
    let cfg = build_config(&args);
    let store = history_store(&args);

    let workload = HttpWorkload::new(cfg).context("build workload")?;
    let engine = SpeedtestEngine::new(workload);
    let cancel = engine.cancel_token();

    let (out_tx, out_handle) = spawn_output_writer();
    let (progress_tx, mut progress_rx) = mpsc::unbounded_channel::<ProgressEvent>();

    let handle = tokio::spawn(engine.run(progress_tx));

    // Ctrl-C requests cooperative cancellation; the run settles at the next
    // stage boundary.
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            cancel.cancel();
        }
    });

    while let Some(ev) = progress_rx.recv().await {
        if let Some(line) = describe_progress(&ev) {
            let _ = out_tx.send(OutputLine::Stderr(line));
        }
    }

    let run_res = handle.await.context("engine task failed")?;
    let outcome = match run_res {
        Ok(result) => finish_run(&args, &store, &out_tx, &result),
        Err(EngineError::Cancelled) => {
            let _ = out_tx.send(OutputLine::Stderr("Run cancelled.".to_string()));
            Err(anyhow::anyhow!("run cancelled"))
        }
        Err(EngineError::Workload(e)) => Err(e.context("speed test failed")),
    };

    drop(out_tx);
    let _ = out_handle.await;
    outcome
}

/// One stderr line per progress event; phase markers become headers.
fn describe_progress(ev: &ProgressEvent) -> Option<String> {
    match ev {
        ProgressEvent::FindingServer => Some("== Finding server ==".to_string()),
        ProgressEvent::Pinging { .. } => Some("== Pinging ==".to_string()),
        ProgressEvent::Downloading { mbps } if *mbps > 0.0 => {
            Some(format!("Download: {:.2} Mbps", mbps))
        }
        ProgressEvent::Downloading { .. } => Some("== Download ==".to_string()),
        ProgressEvent::Uploading { mbps } if *mbps > 0.0 => {
            Some(format!("Upload: {:.2} Mbps", mbps))
        }
        ProgressEvent::Uploading { .. } => Some("== Upload ==".to_string()),
        ProgressEvent::Finalizing => Some("== Finalizing ==".to_string()),
        ProgressEvent::Stage { label, mbps } => match mbps {
            Some(v) => Some(format!("{label}: {:.2} Mbps", v)),
            None => Some(format!("== {label} ==")),
        },
    }
}

/// Print, save, and export a finished one-shot run.
fn finish_run(
    args: &Cli,
    store: &HistoryStore,
    out_tx: &mpsc::UnboundedSender<OutputLine>,
    result: &SpeedResult,
) -> Result<()> {
    if args.json {
        let out = serde_json::to_string_pretty(result)?;
        let _ = out_tx.send(OutputLine::Stdout(out));
    } else {
        for line in text_summary(result) {
            let _ = out_tx.send(OutputLine::Stdout(line));
        }
    }

    if args.auto_save {
        match store.append(result) {
            Ok(()) => {
                let _ = out_tx.send(OutputLine::Stderr(format!(
                    "Saved: {}",
                    store.path().display()
                )));
            }
            Err(e) => {
                let _ = out_tx.send(OutputLine::Stderr(format!("Save failed: {e:#}")));
            }
        }
    }

    if let Some(dest) = args.export.as_deref() {
        store.export(dest).context("export history")?;
        let _ = out_tx.send(OutputLine::Stderr(format!("Exported: {}", dest.display())));
    }

    Ok(())
}

fn text_summary(r: &SpeedResult) -> Vec<String> {
    vec![
        format!("Ping:        {}", units::format_latency(Some(r.ping_ms))),
        format!("Jitter:      {}", units::format_latency(r.jitter_ms)),
        format!("Download:    {}", units::format_speed_dual(r.download_mbps)),
        format!("Upload:      {}", units::format_speed_dual(r.upload_mbps)),
        format!("Packet loss: {}", units::format_packet_loss(r.packet_loss)),
        format!("Quality:     {}", units::rate(r)),
        format!("Server:      {}", r.server_name.as_deref().unwrap_or("Auto")),
        format!("ISP:         {}", r.isp.as_deref().unwrap_or("Detected ISP")),
    ]
}

#[cfg(test)]
mod tests {
    use super::*;
    use time::macros::datetime;

    #[test]
    fn defaults_cover_a_full_run() {
        let cli = Cli::parse_from(["speedline"]);
        assert!(cli.auto_save);
        assert!(!cli.json);
        assert_eq!(cli.gauge_max, 1200.0);
        assert_eq!(Duration::from(cli.download_duration), Duration::from_secs(10));

        let cfg = build_config(&cli);
        assert_eq!(cfg.base_url, "https://speed.cloudflare.com");
        assert_eq!(cfg.ping_samples, 10);
        assert_eq!(cfg.gauge_max_mbps, 1200.0);
        assert!(cfg.user_agent.starts_with("speedline/"));
    }

    #[test]
    fn auto_save_takes_an_explicit_value() {
        let cli = Cli::parse_from(["speedline", "--auto-save", "false"]);
        assert!(!cli.auto_save);
    }

    #[test]
    fn durations_parse_humantime_values() {
        let cli = Cli::parse_from(["speedline", "--download-duration", "2s 500ms"]);
        let cfg = build_config(&cli);
        assert_eq!(cfg.download_duration, Duration::from_millis(2500));
    }

    #[test]
    fn text_summary_reports_dual_units_and_quality() {
        let r = SpeedResult {
            ping_ms: 12.0,
            jitter_ms: None,
            download_mbps: 80.0,
            upload_mbps: 10.0,
            packet_loss: None,
            server_name: None,
            isp: Some("Example Net".to_string()),
            timestamp: datetime!(2026-08-25 14:03:22 UTC),
        };
        let lines = text_summary(&r);
        assert!(lines.contains(&"Download:     80.00 Mbps |  10.00 MB/s".to_string()));
        assert!(lines.contains(&"Jitter:      N/A".to_string()));
        assert!(lines.contains(&"Quality:     GOOD".to_string()));
        assert!(lines.contains(&"Server:      Auto".to_string()));
        assert!(lines.contains(&"ISP:         Example Net".to_string()));
    }

    #[test]
    fn progress_lines_mark_phases_and_samples() {
        assert_eq!(
            describe_progress(&ProgressEvent::Downloading { mbps: 0.0 }).as_deref(),
            Some("== Download ==")
        );
        assert_eq!(
            describe_progress(&ProgressEvent::Downloading { mbps: 42.5 }).as_deref(),
            Some("Download: 42.50 Mbps")
        );
        assert_eq!(
            describe_progress(&ProgressEvent::Stage {
                label: "Warming up".to_string(),
                mbps: None,
            })
            .as_deref(),
            Some("== Warming up ==")
        );
    }
}
