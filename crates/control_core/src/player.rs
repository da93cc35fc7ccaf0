use std::sync::{Arc, Mutex as StdMutex, PoisonError};

use shared::error::{ErrorCode, ReportedError};
use thiserror::Error;
use tokio::{
    sync::{broadcast, watch},
    task::JoinHandle,
};
use tracing::{info, warn};

use crate::{cancel::CancelSignal, dispatcher::CommandDispatcher, sequence::SequenceRun};

const EVENT_CHANNEL_CAPACITY: usize = 64;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum PlayerState {
    #[default]
    Idle,
    Running {
        index: usize,
        total: usize,
    },
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PlaybackOutcome {
    Completed,
    Cancelled,
    Failed(ReportedError),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PlaybackReport {
    pub name: String,
    pub outcome: PlaybackOutcome,
    /// Number of steps dispatched before the run ended.
    pub steps_reached: usize,
    pub total_steps: usize,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PlaybackEvent {
    Started { name: String, total: usize },
    StepDispatched { index: usize, position: String },
    Finished(PlaybackReport),
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum PlaybackError {
    #[error("a sequence is already running")]
    Busy,
    #[error("sequence '{0}' has no steps")]
    Empty(String),
}

impl PlaybackError {
    pub fn code(&self) -> ErrorCode {
        match self {
            PlaybackError::Busy => ErrorCode::Busy,
            PlaybackError::Empty(_) => ErrorCode::Validation,
        }
    }

    pub fn report(&self, label: &str) -> ReportedError {
        ReportedError::new(self.code(), label, self.to_string())
    }
}

/// Handle to a run started by [`SequencePlayer::play`].
pub struct PlaybackHandle {
    task: JoinHandle<PlaybackReport>,
    cancel: CancelSignal,
    name: String,
    total: usize,
}

impl PlaybackHandle {
    pub fn cancel(&self) {
        self.cancel.cancel();
    }

    pub async fn wait(self) -> PlaybackReport {
        match self.task.await {
            Ok(report) => report,
            Err(err) => PlaybackReport {
                name: self.name.clone(),
                outcome: PlaybackOutcome::Failed(ReportedError::new(
                    ErrorCode::Internal,
                    format!("SEQUENCE: {}", self.name),
                    err.to_string(),
                )),
                steps_reached: 0,
                total_steps: self.total,
            },
        }
    }
}

/// Plays sequences through a [`CommandDispatcher`], one at a time.
///
/// Each step is dispatched as an `ALL` command and followed by the step
/// delay, including the last one. A cancel request is honoured before the
/// next dispatch and interrupts the current delay.
pub struct SequencePlayer {
    dispatcher: Arc<CommandDispatcher>,
    active: StdMutex<Option<CancelSignal>>,
    state: watch::Sender<PlayerState>,
    events: broadcast::Sender<PlaybackEvent>,
}

impl SequencePlayer {
    pub fn new(dispatcher: Arc<CommandDispatcher>) -> Arc<Self> {
        let (events, _) = broadcast::channel(EVENT_CHANNEL_CAPACITY);
        Arc::new(Self {
            dispatcher,
            active: StdMutex::new(None),
            state: watch::channel(PlayerState::Idle).0,
            events,
        })
    }

    pub fn state(&self) -> PlayerState {
        *self.state.borrow()
    }

    pub fn watch_state(&self) -> watch::Receiver<PlayerState> {
        self.state.subscribe()
    }

    pub fn subscribe(&self) -> broadcast::Receiver<PlaybackEvent> {
        self.events.subscribe()
    }

    pub fn is_running(&self) -> bool {
        matches!(self.state(), PlayerState::Running { .. })
    }

    /// Starts `run` in the background. Fails with [`PlaybackError::Busy`]
    /// while another run is active.
    pub fn play(self: &Arc<Self>, run: SequenceRun) -> Result<PlaybackHandle, PlaybackError> {
        if run.steps.is_empty() {
            return Err(PlaybackError::Empty(run.name));
        }
        let cancel = CancelSignal::new();
        {
            let mut active = self.active.lock().unwrap_or_else(PoisonError::into_inner);
            if active.is_some() {
                return Err(PlaybackError::Busy);
            }
            *active = Some(cancel.clone());
            self.state.send_replace(PlayerState::Running {
                index: 0,
                total: run.steps.len(),
            });
        }

        let (name, total) = (run.name.clone(), run.steps.len());
        info!(%name, total, "sequence started");

        let player = Arc::clone(self);
        let signal = cancel.clone();
        let task = tokio::spawn(async move {
            let report = player.execute(&run, &signal).await;
            player.finish(&report);
            report
        });

        Ok(PlaybackHandle {
            task,
            cancel,
            name,
            total,
        })
    }

    /// Requests the active run to stop. Returns `false` when idle.
    pub fn cancel(&self) -> bool {
        let active = self.active.lock().unwrap_or_else(PoisonError::into_inner);
        match active.as_ref() {
            Some(signal) => {
                signal.cancel();
                true
            }
            None => false,
        }
    }

    async fn execute(&self, run: &SequenceRun, cancel: &CancelSignal) -> PlaybackReport {
        let total = run.steps.len();
        let report = |outcome: PlaybackOutcome, steps_reached: usize| PlaybackReport {
            name: run.name.clone(),
            outcome,
            steps_reached,
            total_steps: total,
        };
        let _ = self.events.send(PlaybackEvent::Started {
            name: run.name.clone(),
            total,
        });

        for (index, step) in run.steps.iter().enumerate() {
            if cancel.is_cancelled() {
                return report(PlaybackOutcome::Cancelled, index);
            }
            self.state.send_replace(PlayerState::Running { index, total });

            let label = format!("SEQUENCE: {}", step.name);
            if let Err(err) = self.dispatcher.move_all(step.angles, &label).await {
                return report(PlaybackOutcome::Failed(err), index);
            }
            let _ = self.events.send(PlaybackEvent::StepDispatched {
                index,
                position: step.name.clone(),
            });

            tokio::select! {
                biased;
                _ = cancel.cancelled() => return report(PlaybackOutcome::Cancelled, index + 1),
                _ = tokio::time::sleep(run.step_delay) => {}
            }
        }

        report(PlaybackOutcome::Completed, total)
    }

    fn finish(&self, report: &PlaybackReport) {
        match &report.outcome {
            PlaybackOutcome::Completed => {
                info!(name = %report.name, steps = report.steps_reached, "sequence completed");
                self.dispatcher.log(format!("Sequence '{}' completed", report.name));
            }
            PlaybackOutcome::Cancelled => {
                info!(name = %report.name, steps = report.steps_reached, "sequence cancelled");
                self.dispatcher.log(format!(
                    "Sequence '{}' cancelled after {} of {} steps",
                    report.name, report.steps_reached, report.total_steps
                ));
            }
            PlaybackOutcome::Failed(err) => {
                warn!(name = %report.name, %err, "sequence aborted");
            }
        }

        {
            // Same lock as play(), which publishes Running.
            let mut active = self.active.lock().unwrap_or_else(PoisonError::into_inner);
            *active = None;
            self.state.send_replace(PlayerState::Idle);
        }
        let _ = self.events.send(PlaybackEvent::Finished(report.clone()));
    }
}

#[cfg(test)]
#[path = "tests/player_tests.rs"]
mod tests;
