//! Event bus: lifecycle, error and end-of-stream notifications
//!
//! Stages and the streaming thread post messages; the controlling loop
//! receives them in the order they were posted and dispatches them through
//! [`EventBus`], which decides when the loop is done.

use log::{debug, error, info, trace};
use std::time::{Duration, Instant};
use tokio::sync::mpsc;

use super::stage::FlowError;
use super::state::State;

/// Message posted on the pipeline bus
#[derive(Debug, Clone, PartialEq)]
pub enum BusMessage {
    /// All sinks received end of stream
    EndOfStream,

    /// A stage failed during playback
    Error {
        /// Name of the stage or pipeline that failed
        origin: String,
        message: String,
        debug: Option<String>,
    },

    /// A state change step completed
    StateChanged {
        origin: String,
        old: State,
        new: State,
        /// State still being worked towards, `None` once the target is reached
        pending: Option<State>,
    },
}

impl BusMessage {
    pub fn error(origin: impl Into<String>, message: impl Into<String>, debug: Option<String>) -> Self {
        BusMessage::Error {
            origin: origin.into(),
            message: message.into(),
            debug,
        }
    }

    pub fn from_flow(origin: impl Into<String>, err: &FlowError) -> Self {
        Self::error(origin, err.to_string(), err.debug().map(str::to_string))
    }
}

/// Posting side of the bus, cheap to clone into any thread
#[derive(Debug, Clone)]
pub struct Bus {
    tx: mpsc::UnboundedSender<BusMessage>,
}

/// Receiving side of the bus, owned by the controlling loop
#[derive(Debug)]
pub struct BusReceiver {
    rx: mpsc::UnboundedReceiver<BusMessage>,
}

/// Create a connected bus pair
pub fn channel() -> (Bus, BusReceiver) {
    let (tx, rx) = mpsc::unbounded_channel();
    (Bus { tx }, BusReceiver { rx })
}

impl Bus {
    /// Post a message; never blocks. Returns false once nobody listens anymore.
    pub fn post(&self, message: BusMessage) -> bool {
        trace!("bus <- {:?}", message);
        self.tx.send(message).is_ok()
    }
}

impl BusReceiver {
    /// Wait for the next message
    pub async fn next(&mut self) -> Option<BusMessage> {
        self.rx.recv().await
    }

    /// Next message if one is already queued
    pub fn try_next(&mut self) -> Option<BusMessage> {
        self.rx.try_recv().ok()
    }
}

/// How a playback ended
#[derive(Debug, Clone, PartialEq)]
pub enum RunOutcome {
    /// End of stream reached
    Completed,
    /// An error was reported on the bus
    Failed {
        origin: String,
        message: String,
        debug: Option<String>,
    },
}

impl RunOutcome {
    pub fn is_success(&self) -> bool {
        matches!(self, RunOutcome::Completed)
    }
}

/// What the controlling loop should do after a message
#[derive(Debug, Clone, PartialEq)]
pub enum BusAction {
    Continue,
    /// Tear the pipeline down and leave the loop
    Quit(RunOutcome),
}

/// Dispatcher for bus messages of one pipeline
#[derive(Debug)]
pub struct EventBus {
    pipeline: String,
    playing_since: Option<Instant>,
    elapsed: Option<Duration>,
}

impl EventBus {
    pub fn new(pipeline: impl Into<String>) -> Self {
        Self {
            pipeline: pipeline.into(),
            playing_since: None,
            elapsed: None,
        }
    }

    /// When the pipeline first reached `Playing`
    pub fn playing_since(&self) -> Option<Instant> {
        self.playing_since
    }

    /// Playback time measured at end of stream
    pub fn elapsed(&self) -> Option<Duration> {
        self.elapsed
    }

    pub fn dispatch(&mut self, message: &BusMessage) -> BusAction {
        match message {
            BusMessage::EndOfStream => {
                self.elapsed = self.playing_since.map(|since| since.elapsed());
                info!("End-of-stream");
                BusAction::Quit(RunOutcome::Completed)
            }
            BusMessage::Error {
                origin,
                message,
                debug,
            } => {
                error!(
                    "Error from {}: {}: {}",
                    origin,
                    message,
                    debug.as_deref().unwrap_or("no debug info")
                );
                BusAction::Quit(RunOutcome::Failed {
                    origin: origin.clone(),
                    message: message.clone(),
                    debug: debug.clone(),
                })
            }
            BusMessage::StateChanged {
                origin,
                old,
                new,
                pending,
            } => {
                if *origin == self.pipeline {
                    self.log_transition(*old, *new);
                } else {
                    debug!("{} changed state {} -> {} (pending {:?})", origin, old, new, pending);
                }
                BusAction::Continue
            }
        }
    }

    fn log_transition(&mut self, old: State, new: State) {
        match (old, new) {
            (_, State::Playing) => {
                if self.playing_since.is_none() {
                    self.playing_since = Some(Instant::now());
                }
                info!("Pipeline running");
            }
            (State::Playing, State::Paused) => info!("Pipeline paused"),
            (State::Null, State::Ready) => info!("Pipeline ready"),
            (_, State::Ready) => info!("Pipeline stopped"),
            _ => debug!("Pipeline {} -> {}", old, new),
        }
    }
}
