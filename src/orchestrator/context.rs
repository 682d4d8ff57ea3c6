use serde::Deserialize;
use std::future::Future;
use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::{Arc, Mutex};
use tracing::{debug, info};

use crate::cache::MemoCache;
use crate::error::PipelineError;
use crate::models::JobId;
use crate::progress::{ProgressBroker, ProgressEvent, Step};

pub const MIN_RECORDS: usize = 10;
pub const MAX_RECORDS: usize = 200;
pub const DEFAULT_RECORDS: usize = 100;

fn default_record_count() -> usize {
    DEFAULT_RECORDS
}

/// What a caller asks to have analysed.
///
/// The player is named either by `player_id` or by a Riot ID
/// (`game_name` + `tag_line`) that is resolved before the job starts.
#[derive(Debug, Clone, Deserialize)]
pub struct JobRequest {
    #[serde(default)]
    pub player_id: String,
    #[serde(default)]
    pub game_name: Option<String>,
    #[serde(default)]
    pub tag_line: Option<String>,
    #[serde(default)]
    pub display_name: Option<String>,
    #[serde(default = "default_record_count")]
    pub record_count: usize,
}

impl JobRequest {
    pub fn new(player_id: impl Into<String>) -> Self {
        Self {
            player_id: player_id.into(),
            game_name: None,
            tag_line: None,
            display_name: None,
            record_count: DEFAULT_RECORDS,
        }
    }

    pub fn by_riot_id(game_name: impl Into<String>, tag_line: impl Into<String>) -> Self {
        Self {
            game_name: Some(game_name.into()),
            tag_line: Some(tag_line.into()),
            ..Self::new(String::new())
        }
    }

    /// Riot ID still waiting to be resolved into a `player_id`.
    pub fn riot_id(&self) -> Option<(&str, &str)> {
        if !self.player_id.trim().is_empty() {
            return None;
        }
        match (self.game_name.as_deref(), self.tag_line.as_deref()) {
            (Some(name), Some(tag)) if !name.trim().is_empty() && !tag.trim().is_empty() => {
                Some((name.trim(), tag.trim()))
            }
            _ => None,
        }
    }

    pub fn validate(&self) -> Result<(), PipelineError> {
        if self.player_id.trim().is_empty() && self.riot_id().is_none() {
            return Err(PipelineError::InvalidRequest(
                "player_id or game_name and tag_line are required".to_string(),
            ));
        }
        if !(MIN_RECORDS..=MAX_RECORDS).contains(&self.record_count) {
            return Err(PipelineError::InvalidRequest(format!(
                "record_count must be between {} and {}, got {}",
                MIN_RECORDS, MAX_RECORDS, self.record_count
            )));
        }
        Ok(())
    }

    pub fn display_name(&self) -> &str {
        self.display_name.as_deref().unwrap_or(&self.player_id)
    }
}

/// State threaded through every stage of one job.
pub struct JobContext {
    pub job_id: JobId,
    /// Identifies the input data; memoized results are only valid for it.
    pub dataset_key: String,
    pub request: JobRequest,
    memo: Arc<MemoCache>,
    broker: Arc<ProgressBroker>,
    last_percent: AtomicU8,
    notes: Mutex<Vec<String>>,
}

impl JobContext {
    pub fn new(
        job_id: JobId,
        request: JobRequest,
        memo: Arc<MemoCache>,
        broker: Arc<ProgressBroker>,
    ) -> Self {
        Self {
            job_id,
            dataset_key: request.player_id.clone(),
            request,
            memo,
            broker,
            last_percent: AtomicU8::new(0),
            notes: Mutex::new(Vec::new()),
        }
    }

    /// Enter a new pipeline step.
    pub fn transition(&self, step: Step, percent: u8, message: impl Into<String>) {
        let message = message.into();
        info!(job_id = %self.job_id, step = %step, percent, "{}", message);
        self.publish(step, percent, message);
    }

    /// Progress within the current step.
    pub fn report(&self, step: Step, percent: u8, message: impl Into<String>) {
        let message = message.into();
        debug!(job_id = %self.job_id, step = %step, percent, "{}", message);
        self.publish(step, percent, message);
    }

    pub fn complete(&self, message: impl Into<String>) {
        self.transition(Step::Complete, 100, message);
    }

    pub fn fail(&self, err: &PipelineError) {
        let percent = self.last_percent();
        self.publish(Step::Error, percent, err.user_message());
    }

    pub fn last_percent(&self) -> u8 {
        self.last_percent.load(Ordering::SeqCst)
    }

    fn publish(&self, step: Step, percent: u8, message: String) {
        let event = ProgressEvent::new(self.job_id, step, percent, message);
        if let Some(published) = self.broker.publish(event) {
            self.last_percent.fetch_max(published.percent, Ordering::SeqCst);
        }
    }

    /// Memoized fallible result for this job's dataset. Errors are not kept.
    pub async fn memo<T, E, F, Fut>(&self, name: &'static str, compute: F) -> Result<Arc<T>, E>
    where
        T: Send + Sync + 'static,
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T, E>>,
    {
        self.memo
            .get_or_compute(self.job_id, name, &self.dataset_key, compute)
            .await
    }

    /// Memoized derived result for this job's dataset.
    pub fn memo_sync<T, F>(&self, name: &'static str, compute: F) -> Arc<T>
    where
        T: Send + Sync + 'static,
        F: FnOnce() -> T,
    {
        self.memo
            .get_or_compute_sync(self.job_id, name, &self.dataset_key, compute)
    }

    /// Record an annotation for the final result.
    pub fn note(&self, note: impl Into<String>) {
        self.lock_notes().push(note.into());
    }

    pub fn take_notes(&self) -> Vec<String> {
        std::mem::take(&mut *self.lock_notes())
    }

    fn lock_notes(&self) -> std::sync::MutexGuard<'_, Vec<String>> {
        self.notes
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}
