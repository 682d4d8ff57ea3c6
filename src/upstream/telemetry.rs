//! Client for the quota-limited match telemetry API.
//!
//! Every method is exactly one HTTP request. Pacing is the caller's job:
//! the orchestrator reserves a quota slot before each call.

use async_trait::async_trait;
use reqwest::header::RETRY_AFTER;
use reqwest::StatusCode;
use serde::de::DeserializeOwned;
use serde::Deserialize;
use std::time::Duration;
use thiserror::Error;
use tracing::debug;

use crate::models::{MatchDetail, RankInfo};

const SOLO_QUEUE: &str = "RANKED_SOLO_5x5";

#[derive(Debug, Clone, Error)]
pub enum TelemetryError {
    #[error("telemetry API throttled the request")]
    Throttled { retry_after: Option<Duration> },

    #[error("not found: {0}")]
    NotFound(String),

    #[error("telemetry API returned HTTP {status}: {body}")]
    Status { status: u16, body: String },

    #[error("telemetry request failed: {0}")]
    Transport(String),

    #[error("invalid telemetry response: {0}")]
    Decode(String),
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct AccountDto {
    pub puuid: String,
    pub game_name: String,
    pub tag_line: String,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct SummonerDto {
    pub puuid: String,
    pub profile_icon_id: u32,
    pub summoner_level: u32,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct LeagueEntryDto {
    pub queue_type: String,
    pub tier: String,
    pub rank: String,
    pub league_points: u32,
    pub wins: u32,
    pub losses: u32,
}

/// Pick the solo-queue entry, or the first one listed.
pub fn rank_from_entries(entries: &[LeagueEntryDto]) -> RankInfo {
    entries
        .iter()
        .find(|e| e.queue_type == SOLO_QUEUE)
        .or_else(|| entries.first())
        .map(|e| RankInfo {
            tier: e.tier.clone(),
            division: e.rank.clone(),
            league_points: e.league_points,
            wins: e.wins,
            losses: e.losses,
        })
        .unwrap_or_default()
}

/// Source of player and match records.
#[async_trait]
pub trait TelemetrySource: Send + Sync {
    /// Resolve `game_name#tag_line` to a player id.
    async fn fetch_account(&self, game_name: &str, tag_line: &str)
        -> Result<AccountDto, TelemetryError>;

    async fn fetch_summoner(&self, puuid: &str) -> Result<SummonerDto, TelemetryError>;

    async fn fetch_league_entries(&self, puuid: &str)
        -> Result<Vec<LeagueEntryDto>, TelemetryError>;

    /// One page of match ids, most recent first.
    async fn fetch_match_ids(
        &self,
        puuid: &str,
        start: usize,
        count: usize,
        start_time: Option<i64>,
    ) -> Result<Vec<String>, TelemetryError>;

    async fn fetch_match(&self, match_id: &str) -> Result<MatchDetail, TelemetryError>;
}

#[derive(Debug, Clone)]
pub struct RiotClientConfig {
    pub api_key: String,
    /// Regional routing host, e.g. `https://americas.api.riotgames.com`.
    pub regional_url: String,
    /// Platform host, e.g. `https://na1.api.riotgames.com`.
    pub platform_url: String,
    pub timeout: Duration,
}

pub struct RiotClient {
    config: RiotClientConfig,
    http_client: reqwest::Client,
}

impl RiotClient {
    pub fn new(config: RiotClientConfig) -> Result<Self, TelemetryError> {
        let http_client = reqwest::Client::builder()
            .timeout(config.timeout)
            .build()
            .map_err(|e| TelemetryError::Transport(e.to_string()))?;

        Ok(Self {
            config,
            http_client,
        })
    }

    async fn get_json<T: DeserializeOwned>(
        &self,
        url: &str,
        query: &[(&str, String)],
    ) -> Result<T, TelemetryError> {
        debug!("GET {}", url);
        let response = self
            .http_client
            .get(url)
            .header("X-Riot-Token", &self.config.api_key)
            .query(query)
            .send()
            .await
            .map_err(|e| {
                if e.is_timeout() {
                    TelemetryError::Transport(format!(
                        "request timed out after {}s",
                        self.config.timeout.as_secs()
                    ))
                } else {
                    TelemetryError::Transport(e.to_string())
                }
            })?;

        let status = response.status();
        if status == StatusCode::TOO_MANY_REQUESTS {
            let retry_after = response
                .headers()
                .get(RETRY_AFTER)
                .and_then(|v| v.to_str().ok())
                .and_then(parse_retry_after);
            return Err(TelemetryError::Throttled { retry_after });
        }
        if status == StatusCode::NOT_FOUND {
            return Err(TelemetryError::NotFound(url.to_string()));
        }
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(TelemetryError::Status {
                status: status.as_u16(),
                body: body.chars().take(200).collect(),
            });
        }

        response
            .json::<T>()
            .await
            .map_err(|e| TelemetryError::Decode(e.to_string()))
    }
}

#[async_trait]
impl TelemetrySource for RiotClient {
    async fn fetch_account(
        &self,
        game_name: &str,
        tag_line: &str,
    ) -> Result<AccountDto, TelemetryError> {
        let url = format!(
            "{}/riot/account/v1/accounts/by-riot-id/{}/{}",
            self.config.regional_url, game_name, tag_line
        );
        self.get_json(&url, &[]).await
    }

    async fn fetch_summoner(&self, puuid: &str) -> Result<SummonerDto, TelemetryError> {
        let url = format!(
            "{}/lol/summoner/v4/summoners/by-puuid/{}",
            self.config.platform_url, puuid
        );
        self.get_json(&url, &[]).await
    }

    async fn fetch_league_entries(
        &self,
        puuid: &str,
    ) -> Result<Vec<LeagueEntryDto>, TelemetryError> {
        let url = format!(
            "{}/lol/league/v4/entries/by-puuid/{}",
            self.config.platform_url, puuid
        );
        self.get_json(&url, &[]).await
    }

    async fn fetch_match_ids(
        &self,
        puuid: &str,
        start: usize,
        count: usize,
        start_time: Option<i64>,
    ) -> Result<Vec<String>, TelemetryError> {
        let url = format!(
            "{}/lol/match/v5/matches/by-puuid/{}/ids",
            self.config.regional_url, puuid
        );
        let mut query = vec![("start", start.to_string()), ("count", count.to_string())];
        if let Some(start_time) = start_time {
            query.push(("startTime", start_time.to_string()));
        }
        self.get_json(&url, &query).await
    }

    async fn fetch_match(&self, match_id: &str) -> Result<MatchDetail, TelemetryError> {
        let url = format!(
            "{}/lol/match/v5/matches/{}",
            self.config.regional_url, match_id
        );
        self.get_json(&url, &[]).await
    }
}

/// `Retry-After` in delta-seconds form.
fn parse_retry_after(value: &str) -> Option<Duration> {
    value.trim().parse::<u64>().ok().map(Duration::from_secs)
}
