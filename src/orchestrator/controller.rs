//! Run lifecycle controller.
//!
//! Owns start/stop orchestration and emits lifecycle events for the
//! dashboard. A stopped run always settles before `RunStopped` goes out, so
//! no late progress event can land after the dashboard declares it stopped.

use anyhow::Result;
use tokio::sync::mpsc::{UnboundedReceiver, UnboundedSender};
use tokio::time::Duration;

use crate::engine::workload::Workload;
use crate::engine::{CancelToken, EngineError, SpeedtestEngine};
use crate::model::{SpeedResult, UiEvent};

/// Commands emitted by UI layers to control runs.
#[derive(Debug, Clone)]
pub(crate) enum UiCommand {
    Start,
    Stop,
    Quit,
}

/// Handle for the active run.
struct RunCtx {
    cancel: CancelToken,
    handle: Option<tokio::task::JoinHandle<Result<SpeedResult, EngineError>>>,
    forward: Option<tokio::task::JoinHandle<()>>,
}

/// Spawn a run over a fresh engine and return its handle.
fn start_run<W: Workload + 'static>(
    workload: W,
    event_tx: &UnboundedSender<UiEvent>,
) -> RunCtx {
    let engine = SpeedtestEngine::new(workload);
    let cancel = engine.cancel_token();

    // The forwarder exits on its own once the engine drops the progress
    // sender.
    let (progress_tx, mut progress_rx) = tokio::sync::mpsc::unbounded_channel();
    let forward_tx = event_tx.clone();
    let forward = tokio::spawn(async move {
        while let Some(ev) = progress_rx.recv().await {
            if forward_tx.send(UiEvent::Progress(ev)).is_err() {
                break;
            }
        }
    });

    let handle = tokio::spawn(engine.run(progress_tx));
    RunCtx {
        cancel,
        handle: Some(handle),
        forward: Some(forward),
    }
}

/// Map a settled run to the lifecycle event the dashboard folds.
fn settlement_event(run_res: Result<SpeedResult, EngineError>) -> UiEvent {
    match run_res {
        Ok(result) => UiEvent::RunCompleted {
            result: Box::new(result),
        },
        Err(EngineError::Cancelled) => UiEvent::RunCancelled,
        Err(EngineError::Workload(e)) => {
            log::warn!("run failed: {e:#}");
            UiEvent::RunFailed {
                message: format!("{e:#}"),
            }
        }
    }
}

/// Supervise runs based on UI commands and emit events back to the dashboard.
pub(crate) async fn run_controller<W, F>(
    make_workload: F,
    event_tx: UnboundedSender<UiEvent>,
    mut cmd_rx: UnboundedReceiver<UiCommand>,
) -> Result<()>
where
    W: Workload + 'static,
    F: Fn() -> Result<W>,
{
    let mut run_ctx: Option<RunCtx> = None;
    let mut stop_pending = false;
    let mut quit_pending = false;
    // Cancel watchdog: if a cancel takes a while (a transfer stage still in
    // flight), keep UI feedback alive.
    let mut cancel_deadline: Option<tokio::time::Instant> = None;
    let mut watchdog = tokio::time::interval(Duration::from_millis(500));

    loop {
        tokio::select! {
            cmd = cmd_rx.recv() => {
                match cmd {
                    Some(UiCommand::Start) => {
                        // One run at a time; a start during an active run is
                        // dropped.
                        if run_ctx.is_none() {
                            match make_workload() {
                                Ok(workload) => {
                                    stop_pending = false;
                                    run_ctx = Some(start_run(workload, &event_tx));
                                }
                                Err(e) => {
                                    let _ = event_tx.send(UiEvent::RunFailed {
                                        message: format!("{e:#}"),
                                    });
                                }
                            }
                        }
                    }
                    Some(UiCommand::Stop) => {
                        if let Some(ctx) = &run_ctx {
                            stop_pending = true;
                            ctx.cancel.cancel();
                            cancel_deadline =
                                Some(tokio::time::Instant::now() + Duration::from_secs(3));
                        }
                    }
                    Some(UiCommand::Quit) => {
                        // Quit waits for the active run to settle so the
                        // engine never outlives the controller.
                        quit_pending = true;
                        if let Some(ctx) = &run_ctx {
                            ctx.cancel.cancel();
                            cancel_deadline =
                                Some(tokio::time::Instant::now() + Duration::from_secs(3));
                        } else {
                            break;
                        }
                    }
                    None => {
                        quit_pending = true;
                        if let Some(ctx) = &run_ctx {
                            ctx.cancel.cancel();
                        } else {
                            break;
                        }
                    }
                }
            }
            // Do not take the JoinHandle before this branch wins; otherwise it
            // can be dropped when another branch is chosen and completion is
            // never observed.
            maybe_done = async {
                if let Some(ctx) = &mut run_ctx {
                    if let Some(h) = ctx.handle.as_mut() {
                        return Some(h.await);
                    }
                }
                futures::future::pending().await
            } => {
                if let Some(join_res) = maybe_done {
                    if let Some(ctx) = &mut run_ctx {
                        ctx.handle.take();
                        // The engine has dropped its sender by now; waiting
                        // for the forwarder guarantees every progress event
                        // is out before any lifecycle event.
                        if let Some(f) = ctx.forward.take() {
                            let _ = f.await;
                        }
                    }
                    let event = match join_res {
                        Ok(run_res) => settlement_event(run_res),
                        Err(e) => UiEvent::RunFailed {
                            message: format!("run join failed: {e}"),
                        },
                    };
                    let _ = event_tx.send(event);
                    if stop_pending {
                        // Always the last word of a stopped run.
                        let _ = event_tx.send(UiEvent::RunStopped);
                        stop_pending = false;
                    }
                    run_ctx = None;
                    cancel_deadline = None;
                    if quit_pending {
                        break;
                    }
                }
            }
            _ = watchdog.tick() => {
                if let Some(deadline) = cancel_deadline {
                    if tokio::time::Instant::now() >= deadline && run_ctx.is_some() {
                        let _ = event_tx.send(UiEvent::Notice("Still stopping…".into()));
                        cancel_deadline = None;
                    }
                }
            }
        }
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::workload::{RawResults, TransferProgress};
    use crate::model::{ProgressEvent, ServerInfo};
    use anyhow::bail;
    use tokio::sync::mpsc;

    /// Workload whose download phase takes long enough to stop mid-flight.
    struct SlowWorkload;

    impl Workload for SlowWorkload {
        fn find_server(&mut self) -> Result<ServerInfo> {
            Ok(ServerInfo::default())
        }

        fn ping(&mut self, _server: &ServerInfo) -> Result<()> {
            Ok(())
        }

        fn download(
            &mut self,
            on_progress: &mut dyn FnMut(TransferProgress),
        ) -> Result<()> {
            for i in 1..=10u64 {
                std::thread::sleep(std::time::Duration::from_millis(10));
                on_progress(TransferProgress {
                    bytes_transferred: i * 250_000,
                    elapsed_secs: 0.2 * i as f64,
                });
            }
            Ok(())
        }

        fn upload(
            &mut self,
            on_progress: &mut dyn FnMut(TransferProgress),
        ) -> Result<()> {
            on_progress(TransferProgress {
                bytes_transferred: 250_000,
                elapsed_secs: 0.2,
            });
            Ok(())
        }

        fn results(&mut self) -> Result<RawResults> {
            Ok(RawResults {
                download_bps: 10_000_000.0,
                upload_bps: 10_000_000.0,
                ..Default::default()
            })
        }
    }

    async fn next_event(rx: &mut mpsc::UnboundedReceiver<UiEvent>) -> UiEvent {
        tokio::time::timeout(std::time::Duration::from_secs(5), rx.recv())
            .await
            .expect("event within deadline")
            .expect("event channel open")
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn stop_mid_download_settles_cancelled_then_stopped() {
        let (event_tx, mut event_rx) = mpsc::unbounded_channel();
        let (cmd_tx, cmd_rx) = mpsc::unbounded_channel();
        let controller = tokio::spawn(run_controller(|| Ok(SlowWorkload), event_tx, cmd_rx));

        cmd_tx.send(UiCommand::Start).unwrap();
        loop {
            if let UiEvent::Progress(ProgressEvent::Downloading { mbps }) =
                next_event(&mut event_rx).await
            {
                if mbps > 0.0 {
                    break;
                }
            }
        }

        cmd_tx.send(UiCommand::Stop).unwrap();

        let mut saw_cancelled = false;
        loop {
            match next_event(&mut event_rx).await {
                UiEvent::RunCancelled => saw_cancelled = true,
                UiEvent::RunStopped => break,
                UiEvent::RunCompleted { .. } | UiEvent::RunFailed { .. } => {
                    panic!("stopped run must settle cancelled")
                }
                _ => {}
            }
        }
        assert!(saw_cancelled, "cancellation precedes the stop confirmation");

        cmd_tx.send(UiCommand::Quit).unwrap();
        controller.await.unwrap().unwrap();
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn start_while_running_is_ignored() {
        let (event_tx, mut event_rx) = mpsc::unbounded_channel();
        let (cmd_tx, cmd_rx) = mpsc::unbounded_channel();
        let controller = tokio::spawn(run_controller(|| Ok(SlowWorkload), event_tx, cmd_rx));

        cmd_tx.send(UiCommand::Start).unwrap();
        cmd_tx.send(UiCommand::Start).unwrap();

        let mut discoveries = 0;
        loop {
            match next_event(&mut event_rx).await {
                UiEvent::Progress(ProgressEvent::FindingServer) => discoveries += 1,
                UiEvent::RunCompleted { .. } => break,
                UiEvent::RunFailed { message } => panic!("unexpected failure: {message}"),
                _ => {}
            }
        }
        assert_eq!(discoveries, 1);

        cmd_tx.send(UiCommand::Quit).unwrap();
        controller.await.unwrap().unwrap();
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn stop_while_idle_emits_nothing() {
        let (event_tx, mut event_rx) = mpsc::unbounded_channel();
        let (cmd_tx, cmd_rx) = mpsc::unbounded_channel();
        let controller = tokio::spawn(run_controller(|| Ok(SlowWorkload), event_tx, cmd_rx));

        cmd_tx.send(UiCommand::Stop).unwrap();
        cmd_tx.send(UiCommand::Quit).unwrap();
        controller.await.unwrap().unwrap();

        // Controller exited without a run; the channel closes empty.
        assert!(event_rx.recv().await.is_none());
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn workload_construction_failure_reports_and_stays_alive() {
        let (event_tx, mut event_rx) = mpsc::unbounded_channel();
        let (cmd_tx, cmd_rx) = mpsc::unbounded_channel();
        let controller = tokio::spawn(run_controller(
            || -> Result<SlowWorkload> { bail!("no backend available") },
            event_tx,
            cmd_rx,
        ));

        cmd_tx.send(UiCommand::Start).unwrap();
        match next_event(&mut event_rx).await {
            UiEvent::RunFailed { message } => assert!(message.contains("no backend")),
            other => panic!("expected RunFailed, got {other:?}"),
        }

        cmd_tx.send(UiCommand::Quit).unwrap();
        controller.await.unwrap().unwrap();
    }

    #[test]
    fn settlement_maps_cancelled_runs() {
        assert!(matches!(
            settlement_event(Err(EngineError::Cancelled)),
            UiEvent::RunCancelled
        ));
    }

    #[test]
    fn settlement_maps_workload_failures_with_chain() {
        let err = anyhow::anyhow!("socket closed").context("download");
        match settlement_event(Err(EngineError::Workload(err))) {
            UiEvent::RunFailed { message } => {
                assert!(message.contains("download"));
                assert!(message.contains("socket closed"));
            }
            other => panic!("expected RunFailed, got {other:?}"),
        }
    }
}
