//! Client for the generative inference service (Ollama-style `/api/chat`).

use async_trait::async_trait;
use reqwest::StatusCode;
use serde::{Deserialize, Serialize};
use std::time::Duration;
use thiserror::Error;
use tracing::{debug, info};

use crate::models::{ChampionPool, Insight, PerformanceTrends, Playstyle};

const THROTTLE_MARKERS: [&str; 4] = ["throttl", "too many requests", "rate limit", "rate exceeded"];

const SYSTEM_PROMPT: &str = "You are an expert League of Legends analyst. \
You write short, specific, encouraging player reviews grounded in the numbers you are given. \
You always answer with a single JSON object and nothing else.";

#[derive(Debug, Error)]
pub enum InferenceError {
    #[error("inference service is throttling: {0}")]
    Throttled(String),

    #[error("inference service returned HTTP {status}: {body}")]
    Status { status: u16, body: String },

    #[error("inference request failed: {0}")]
    Transport(String),

    #[error("unusable inference reply: {0}")]
    Malformed(String),
}

impl InferenceError {
    pub fn is_throttle(&self) -> bool {
        matches!(self, InferenceError::Throttled(_))
    }
}

/// Text generation backend.
#[async_trait]
pub trait InferenceService: Send + Sync {
    async fn generate(&self, prompt: &str) -> Result<String, InferenceError>;

    fn model_name(&self) -> &str;
}

#[derive(Debug, Clone)]
pub struct ChatClientConfig {
    pub url: String,
    pub model: String,
    pub temperature: f32,
    pub timeout: Duration,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct ChatMessage {
    role: String,
    content: String,
}

#[derive(Debug, Serialize)]
struct ChatRequest<'a> {
    model: &'a str,
    messages: Vec<ChatMessage>,
    stream: bool,
    format: &'a str,
    options: ChatOptions,
}

#[derive(Debug, Serialize)]
struct ChatOptions {
    temperature: f32,
}

#[derive(Debug, Deserialize)]
struct ChatResponse {
    message: ChatMessage,
}

pub struct ChatClient {
    config: ChatClientConfig,
    http_client: reqwest::Client,
}

impl ChatClient {
    pub fn new(config: ChatClientConfig) -> Result<Self, InferenceError> {
        info!("Using inference model {} at {}", config.model, config.url);

        let http_client = reqwest::Client::builder()
            .timeout(config.timeout)
            .build()
            .map_err(|e| InferenceError::Transport(e.to_string()))?;

        Ok(Self {
            config,
            http_client,
        })
    }
}

#[async_trait]
impl InferenceService for ChatClient {
    async fn generate(&self, prompt: &str) -> Result<String, InferenceError> {
        let url = format!("{}/api/chat", self.config.url.trim_end_matches('/'));

        let request = ChatRequest {
            model: &self.config.model,
            messages: vec![
                ChatMessage {
                    role: "system".to_string(),
                    content: SYSTEM_PROMPT.to_string(),
                },
                ChatMessage {
                    role: "user".to_string(),
                    content: prompt.to_string(),
                },
            ],
            stream: false,
            format: "json",
            options: ChatOptions {
                temperature: self.config.temperature,
            },
        };

        let response = self
            .http_client
            .post(&url)
            .json(&request)
            .send()
            .await
            .map_err(|e| {
                if e.is_timeout() {
                    InferenceError::Transport(format!(
                        "request timed out after {}s",
                        self.config.timeout.as_secs()
                    ))
                } else if e.is_connect() {
                    InferenceError::Transport(format!("cannot connect to {}", self.config.url))
                } else {
                    InferenceError::Transport(e.to_string())
                }
            })?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(classify_failure(status, &body));
        }

        let chat: ChatResponse = response
            .json()
            .await
            .map_err(|e| InferenceError::Malformed(e.to_string()))?;

        debug!("Inference reply: {} chars", chat.message.content.len());
        Ok(chat.message.content)
    }

    fn model_name(&self) -> &str {
        &self.config.model
    }
}

/// Map a non-success reply to an error, recognising throttling by status
/// or by the wording providers use for it.
fn classify_failure(status: StatusCode, body: &str) -> InferenceError {
    let lowered = body.to_lowercase();
    if status == StatusCode::TOO_MANY_REQUESTS
        || status == StatusCode::SERVICE_UNAVAILABLE
        || THROTTLE_MARKERS.iter().any(|m| lowered.contains(m))
    {
        return InferenceError::Throttled(format!("HTTP {}", status.as_u16()));
    }

    InferenceError::Status {
        status: status.as_u16(),
        body: body.chars().take(200).collect(),
    }
}

/// Everything the prompt needs, borrowed from the memoized aggregates.
pub struct PromptInput<'a> {
    pub rank: &'a str,
    pub tier: &'a str,
    pub records_analyzed: usize,
    pub performance: &'a PerformanceTrends,
    pub champion_pool: &'a ChampionPool,
    pub playstyle: &'a Playstyle,
}

pub fn build_prompt(input: &PromptInput<'_>) -> String {
    let perf = input.performance;
    let scores = &input.playstyle.scores;
    let tier = if input.tier.is_empty() {
        "GOLD"
    } else {
        input.tier
    };

    let mut prompt = String::new();
    prompt.push_str("Provide a deep, personalized analysis for this player.\n\n");

    prompt.push_str("PLAYER PROFILE:\n");
    prompt.push_str(&format!("- Rank: {}\n", input.rank));
    prompt.push_str(&format!("- Matches Analyzed: {}\n", input.records_analyzed));
    prompt.push_str(&format!("- Main Role: {}\n\n", input.champion_pool.primary_role));

    prompt.push_str("PERFORMANCE METRICS:\n");
    prompt.push_str(&format!("- Win Rate: {:.1}%\n", perf.overall_win_rate));
    prompt.push_str(&format!(
        "- Average KDA: {:.2} (K:{:.1} / D:{:.1} / A:{:.1})\n",
        perf.avg_kda, perf.avg_kills, perf.avg_deaths, perf.avg_assists
    ));
    prompt.push_str(&format!("- CS/min: {:.1}\n", perf.avg_cs_per_min));
    prompt.push_str(&format!("- Vision Score/min: {:.2}\n", perf.avg_vision_per_min));
    prompt.push_str(&format!("- Damage/min: {:.0}\n", perf.avg_damage_per_min));
    prompt.push_str(&format!("- Gold/min: {:.0}\n", perf.avg_gold_per_min));
    prompt.push_str(&format!("- Multikills: {}\n", perf.total_multikills));
    prompt.push_str(&format!("- Pentakills: {}\n\n", perf.total_penta_kills));

    prompt.push_str("TOP CHAMPIONS:\n");
    for champ in input.champion_pool.top_champions.iter().take(3) {
        prompt.push_str(&format!(
            "- {}: {} games, {:.1}% WR, {:.1} KDA\n",
            champ.name, champ.games, champ.win_rate, champ.avg_kda
        ));
    }

    prompt.push_str("\nPLAYSTYLE ANALYSIS:\n");
    prompt.push_str(&format!("- Primary Trait: {}\n", input.playstyle.primary_trait));
    prompt.push_str(&format!("- Aggression Score: {:.0}/100\n", scores.aggression));
    prompt.push_str(&format!("- Carry Potential: {:.0}/100\n", scores.carry_potential));
    prompt.push_str(&format!("- Vision Mastery: {:.0}/100\n", scores.vision_mastery));
    prompt.push_str(&format!("- Teamfight Prowess: {:.0}/100\n", scores.teamfight_prowess));

    if let Some(trend) = &perf.trend {
        prompt.push_str("\nIMPROVEMENT TRENDS:\n");
        prompt.push_str(&format!(
            "- Win rate: {:.1}% (first half) -> {:.1}% (second half)\n",
            trend.first_half_win_rate, trend.second_half_win_rate
        ));
        prompt.push_str(&format!("- KDA change: {:+.2}\n", trend.kda_change));
    }

    prompt.push_str(&format!(
        "\nBENCHMARKS:\n- {tier} average KDA: 2.8-3.2\n- {tier} average CS/min: 6.0-6.5\n- {tier} average vision/min: 0.8-1.2\n\n"
    ));

    prompt.push_str("YOUR TASK:\n");
    prompt.push_str("1. Pick the 3 most notable stats as highlights, with specific numbers.\n");
    prompt.push_str("2. Write a 4-5 sentence insight: playstyle, one or two strengths, one weakness compared to the benchmarks, one measurable goal.\n");
    prompt.push_str("3. Pick one personality: Aggressive Playmaker, Teamfight Specialist, Vision Master, Carry Player, Consistent Performer, Strategic Player.\n\n");
    prompt.push_str("RESPOND IN EXACT JSON FORMAT:\n");
    prompt.push_str(r#"{"highlights": [{"stat": "title", "value": "number with unit"}], "insight": "analysis", "personality": "chosen personality"}"#);
    prompt.push('\n');

    prompt
}

/// Extract the insight object from a model reply that may wrap it in prose
/// or code fences.
pub fn parse_insight(reply: &str) -> Result<Insight, InferenceError> {
    let start = reply
        .find('{')
        .ok_or_else(|| InferenceError::Malformed("no JSON object in reply".to_string()))?;
    let end = reply
        .rfind('}')
        .filter(|&end| end > start)
        .ok_or_else(|| InferenceError::Malformed("unterminated JSON object".to_string()))?;

    let mut insight: Insight = serde_json::from_str(&reply[start..=end])
        .map_err(|e| InferenceError::Malformed(e.to_string()))?;

    if insight.insight.trim().is_empty() {
        return Err(InferenceError::Malformed("empty insight text".to_string()));
    }
    insight.highlights.truncate(3);
    Ok(insight)
}
