//! Per-job progress fan-out.
//!
//! Each job owns a bounded broadcast channel plus its most recent event, so
//! an observer that attaches late starts from the current state instead of
//! from zero. Once a job has ended its terminal event is kept as a tombstone
//! until the reaper removes it.

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use futures::Stream;
use serde::Serialize;
use std::fmt;
use std::time::Duration;
use tokio::sync::broadcast::{self, error::RecvError};
use tokio::time::Instant;
use tracing::{debug, warn};

use crate::models::JobId;

/// Pipeline step a progress event belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Step {
    Started,
    FetchingCandidates,
    FetchingDetails,
    Aggregating,
    Inferring,
    Complete,
    Error,
}

impl Step {
    pub fn as_str(&self) -> &'static str {
        match self {
            Step::Started => "started",
            Step::FetchingCandidates => "fetching_candidates",
            Step::FetchingDetails => "fetching_details",
            Step::Aggregating => "aggregating",
            Step::Inferring => "inferring",
            Step::Complete => "complete",
            Step::Error => "error",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, Step::Complete | Step::Error)
    }
}

impl fmt::Display for Step {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ProgressEvent {
    #[serde(skip)]
    pub job_id: JobId,
    pub step: Step,
    #[serde(rename = "progress")]
    pub percent: u8,
    pub message: String,
    pub timestamp: DateTime<Utc>,
}

impl ProgressEvent {
    pub fn new(job_id: JobId, step: Step, percent: u8, message: impl Into<String>) -> Self {
        Self {
            job_id,
            step,
            percent: percent.min(100),
            message: message.into(),
            timestamp: Utc::now(),
        }
    }
}

struct Channel {
    sender: broadcast::Sender<ProgressEvent>,
    latest: Option<ProgressEvent>,
}

struct Tombstone {
    event: ProgressEvent,
    closed_at: Instant,
}

pub struct ProgressBroker {
    capacity: usize,
    channels: DashMap<JobId, Channel>,
    finished: DashMap<JobId, Tombstone>,
}

impl ProgressBroker {
    pub fn new(capacity: usize) -> Self {
        Self {
            capacity: capacity.max(1),
            channels: DashMap::new(),
            finished: DashMap::new(),
        }
    }

    /// Create the channel for a job. Reopening replaces any previous state.
    pub fn open(&self, job_id: JobId) {
        let (sender, _) = broadcast::channel(self.capacity);
        self.finished.remove(&job_id);
        self.channels.insert(
            job_id,
            Channel {
                sender,
                latest: None,
            },
        );
    }

    /// Record and fan out an event.
    ///
    /// Returns the event as delivered after percent clamping, or `None` when
    /// the job has no open channel or has already reached a terminal event.
    pub fn publish(&self, mut event: ProgressEvent) -> Option<ProgressEvent> {
        let mut channel = match self.channels.get_mut(&event.job_id) {
            Some(channel) => channel,
            None => {
                debug!(job_id = %event.job_id, "Dropping progress for closed job");
                return None;
            }
        };

        let last = match &channel.latest {
            Some(latest) if latest.step.is_terminal() => {
                debug!(
                    job_id = %event.job_id,
                    step = %event.step,
                    "Ignoring progress after terminal event"
                );
                return None;
            }
            Some(latest) => latest.percent,
            None => 0,
        };

        event.percent = match event.step {
            Step::Complete => 100,
            Step::Error => last,
            _ => event.percent.clamp(last, 100),
        };

        channel.latest = Some(event.clone());
        // No receivers is fine.
        let _ = channel.sender.send(event.clone());
        Some(event)
    }

    /// Attach to a job's events, starting with its latest one.
    pub fn subscribe(&self, job_id: JobId) -> Option<Subscription> {
        if let Some(channel) = self.channels.get(&job_id) {
            let pending = channel.latest.clone();
            let receiver = channel.sender.subscribe();
            return Some(Subscription {
                pending,
                receiver: Some(receiver),
            });
        }

        self.finished.get(&job_id).map(|tombstone| Subscription {
            pending: Some(tombstone.event.clone()),
            receiver: None,
        })
    }

    /// Release the job's channel. Active subscriptions drain what is
    /// buffered and then end.
    pub fn close(&self, job_id: JobId) {
        if let Some((_, channel)) = self.channels.remove(&job_id) {
            if let Some(event) = channel.latest.filter(|e| e.step.is_terminal()) {
                self.finished.insert(
                    job_id,
                    Tombstone {
                        event,
                        closed_at: Instant::now(),
                    },
                );
            }
        }
    }

    /// Drop tombstones older than `retention`.
    pub fn sweep(&self, retention: Duration) -> usize {
        let before = self.finished.len();
        self.finished
            .retain(|_, tombstone| tombstone.closed_at.elapsed() < retention);
        before.saturating_sub(self.finished.len())
    }

    pub fn active_channels(&self) -> usize {
        self.channels.len()
    }

    pub fn latest(&self, job_id: JobId) -> Option<ProgressEvent> {
        if let Some(channel) = self.channels.get(&job_id) {
            return channel.latest.clone();
        }
        self.finished.get(&job_id).map(|t| t.event.clone())
    }
}

/// One observer's cursor over a job's events.
pub struct Subscription {
    pending: Option<ProgressEvent>,
    receiver: Option<broadcast::Receiver<ProgressEvent>>,
}

impl Subscription {
    /// Next event, or `None` once the job's terminal event has been seen or
    /// the channel is closed.
    pub async fn next(&mut self) -> Option<ProgressEvent> {
        if let Some(event) = self.pending.take() {
            if event.step.is_terminal() {
                self.receiver = None;
            }
            return Some(event);
        }

        loop {
            let receiver = self.receiver.as_mut()?;
            match receiver.recv().await {
                Ok(event) => {
                    if event.step.is_terminal() {
                        self.receiver = None;
                    }
                    return Some(event);
                }
                Err(RecvError::Lagged(skipped)) => {
                    warn!(skipped, "Progress subscriber lagged, skipping events");
                }
                Err(RecvError::Closed) => {
                    self.receiver = None;
                    return None;
                }
            }
        }
    }

    pub fn into_stream(self) -> impl Stream<Item = ProgressEvent> + Send {
        futures::stream::unfold(self, |mut subscription| async move {
            subscription
                .next()
                .await
                .map(|event| (event, subscription))
        })
    }
}
