//! Errors that end an analysis job.

use std::time::Duration;
use thiserror::Error;

use crate::upstream::TelemetryError;

#[derive(Debug, Error)]
pub enum PipelineError {
    #[error("invalid request: {0}")]
    InvalidRequest(String),

    #[error("player {0} not found")]
    PlayerNotFound(String),

    #[error("player lookup failed: {0}")]
    Lookup(#[source] TelemetryError),

    #[error("could not list recent matches: {0}")]
    CandidateDiscovery(#[source] TelemetryError),

    #[error("none of the {requested} matches could be fetched")]
    NoUsableRecords { requested: usize },

    #[error("inference service still throttling after {attempts} attempts")]
    RetryBudgetExhausted { attempts: u32, retry_after: Duration },

    #[error("analysis task crashed: {0}")]
    Internal(String),
}

impl PipelineError {
    /// A failed Riot ID or profile lookup. 404s name the player.
    pub fn from_lookup(err: TelemetryError, riot_id: &str) -> Self {
        match err {
            TelemetryError::NotFound(_) => PipelineError::PlayerNotFound(riot_id.to_string()),
            other => PipelineError::Lookup(other),
        }
    }

    /// Suggested delay before the caller tries again, if any.
    pub fn retry_after(&self) -> Option<Duration> {
        match self {
            PipelineError::RetryBudgetExhausted { retry_after, .. } => Some(*retry_after),
            PipelineError::CandidateDiscovery(TelemetryError::Throttled { retry_after })
            | PipelineError::Lookup(TelemetryError::Throttled { retry_after }) => *retry_after,
            _ => None,
        }
    }

    /// Reason shown to the person watching the job.
    pub fn user_message(&self) -> String {
        match self {
            PipelineError::RetryBudgetExhausted { retry_after, .. } => format!(
                "The AI service is busy right now. Please try again in about {} seconds.",
                retry_after.as_secs().max(1)
            ),
            PipelineError::NoUsableRecords { .. } => {
                "Could not fetch any match data for this player. Please try again later."
                    .to_string()
            }
            PipelineError::CandidateDiscovery(TelemetryError::NotFound(_)) => {
                "Player not found. Check the player id and try again.".to_string()
            }
            PipelineError::PlayerNotFound(riot_id) => {
                format!("Player {} not found. Check the Riot ID and try again.", riot_id)
            }
            PipelineError::Internal(_) => {
                "Analysis failed unexpectedly. Please try again.".to_string()
            }
            other => other.to_string(),
        }
    }
}
