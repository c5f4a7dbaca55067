use crate::model::{ProgressEvent, SpeedResult, Status, UiEvent};

use super::gauges::SampleBuffer;

/// Dashboard state folded over [`UiEvent`]s, owned by the render thread.
///
/// Pure bookkeeping: no I/O happens here, so every transition is testable
/// without a terminal. Events are applied strictly in arrival order; the
/// controller only emits lifecycle events after a run has settled, so no
/// late progress event can land after `RunStopped`.
pub struct DashboardState {
    pub status: Status,
    pub current_speed: f64,
    pub last_result: Option<SpeedResult>,
    pub running: bool,
    pub gauge: SampleBuffer,
    pub history: Vec<SpeedResult>,
    pub notice: Option<String>,
}

impl DashboardState {
    pub fn new(gauge_capacity: usize) -> Self {
        Self {
            status: Status::Idle,
            current_speed: 0.0,
            last_result: None,
            running: false,
            gauge: SampleBuffer::new(gauge_capacity),
            history: Vec::new(),
            notice: None,
        }
    }

    /// Prepare for a new run. Returns `false` (and changes nothing) while a
    /// run is already active; the caller only issues a start command on
    /// `true`.
    pub fn on_start(&mut self) -> bool {
        if self.running {
            return false;
        }
        self.running = true;
        self.last_result = None;
        self.current_speed = 0.0;
        self.status = Status::FindingServer;
        self.notice = None;
        true
    }

    pub fn apply_event(&mut self, event: &UiEvent) {
        match event {
            UiEvent::Progress(progress) => self.apply_progress(progress),
            UiEvent::RunCompleted { result } => {
                // current_speed keeps the last payload so the needle does
                // not snap to zero on completion.
                self.status = Status::Complete;
                self.running = false;
                self.last_result = Some((**result).clone());
            }
            UiEvent::RunFailed { message } => {
                self.status = Status::Error;
                self.running = false;
                self.current_speed = 0.0;
                self.notice = Some(message.clone());
            }
            UiEvent::RunCancelled => {
                self.status = Status::Cancelled;
                self.running = false;
            }
            UiEvent::RunStopped => {
                self.status = Status::Stopped;
                self.running = false;
            }
            UiEvent::Notice(message) => {
                self.notice = Some(message.clone());
            }
        }
    }

    fn apply_progress(&mut self, progress: &ProgressEvent) {
        match progress {
            ProgressEvent::FindingServer => self.status = Status::FindingServer,
            ProgressEvent::Pinging { .. } => self.status = Status::Pinging,
            ProgressEvent::Downloading { mbps } => {
                self.status = Status::Downloading;
                self.record_speed(*mbps);
            }
            ProgressEvent::Uploading { mbps } => {
                self.status = Status::Uploading;
                self.record_speed(*mbps);
            }
            ProgressEvent::Finalizing => self.status = Status::Finalizing,
            ProgressEvent::Stage { label, mbps } => {
                self.status = Status::Other(label.to_uppercase());
                if let Some(mbps) = mbps {
                    self.record_speed(*mbps);
                }
            }
        }
    }

    // Only events carrying a speed payload touch the needle and the gauge.
    fn record_speed(&mut self, mbps: f64) {
        self.current_speed = mbps;
        self.gauge.push(mbps);
    }
}
