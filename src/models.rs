//! Data models shared across the pipeline.
//!
//! Upstream payloads decode with every field defaulted and unknown fields
//! ignored, so additions on the provider side never break cached or fresh
//! records.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};
use std::fmt;
use std::str::FromStr;
use uuid::Uuid;

/// Queue ids counted as ranked play.
pub const RANKED_QUEUES: [u32; 2] = [420, 440];
/// Draft and blind pick.
pub const NORMAL_QUEUES: [u32; 2] = [400, 430];

/// Data Dragon CDN release used for profile icons.
const DDRAGON_VERSION: &str = "14.22.1";

/// Opaque, unguessable job identifier.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct JobId(Uuid);

impl JobId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for JobId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for JobId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl FromStr for JobId {
    type Err = uuid::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Uuid::parse_str(s).map(Self)
    }
}

/// Lifecycle of a job as seen by callers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum JobStatus {
    Running,
    Complete,
    Errored,
}

impl fmt::Display for JobStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            JobStatus::Running => write!(f, "running"),
            JobStatus::Complete => write!(f, "complete"),
            JobStatus::Errored => write!(f, "errored"),
        }
    }
}

// ---------------------------------------------------------------------------
// Telemetry records
// ---------------------------------------------------------------------------

/// One match as returned by the match-detail endpoint.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct MatchDetail {
    pub metadata: MatchMetadata,
    pub info: MatchInfo,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct MatchMetadata {
    pub match_id: String,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct MatchInfo {
    /// Epoch milliseconds.
    pub game_creation: i64,
    /// Seconds.
    pub game_duration: i64,
    pub queue_id: u32,
    pub participants: Vec<Participant>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct Participant {
    pub puuid: String,
    pub champion_name: String,
    pub team_position: String,
    pub win: bool,
    pub kills: u32,
    pub deaths: u32,
    pub assists: u32,
    pub double_kills: u32,
    pub triple_kills: u32,
    pub quadra_kills: u32,
    pub penta_kills: u32,
    pub total_damage_dealt_to_champions: u64,
    pub total_damage_taken: u64,
    pub gold_earned: u64,
    pub total_minions_killed: u32,
    pub neutral_minions_killed: u32,
    pub vision_score: u32,
    pub challenges: Challenges,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct Challenges {
    pub solo_kills: f64,
    /// Fraction of team damage, 0.0 - 1.0.
    pub team_damage_percentage: f64,
    pub gold_per_minute: f64,
    pub vision_score_per_minute: f64,
}

impl MatchDetail {
    pub fn participant(&self, puuid: &str) -> Option<&Participant> {
        self.info.participants.iter().find(|p| p.puuid == puuid)
    }

    pub fn is_ranked(&self) -> bool {
        RANKED_QUEUES.contains(&self.info.queue_id)
    }

    pub fn is_normal(&self) -> bool {
        NORMAL_QUEUES.contains(&self.info.queue_id)
    }
}

/// Ranked standing in the solo queue (or the first listed queue).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RankInfo {
    pub tier: String,
    pub division: String,
    pub league_points: u32,
    pub wins: u32,
    pub losses: u32,
}

impl Default for RankInfo {
    fn default() -> Self {
        Self {
            tier: "UNRANKED".to_string(),
            division: String::new(),
            league_points: 0,
            wins: 0,
            losses: 0,
        }
    }
}

impl RankInfo {
    pub fn is_ranked(&self) -> bool {
        self.tier != "UNRANKED" && !self.tier.is_empty()
    }

    pub fn win_rate(&self) -> f64 {
        let games = self.wins + self.losses;
        if games == 0 {
            0.0
        } else {
            self.wins as f64 / games as f64 * 100.0
        }
    }

    /// e.g. `Gold II (45 LP)`.
    pub fn display(&self) -> String {
        if !self.is_ranked() {
            return "Unranked".to_string();
        }
        let mut tier = self.tier.to_lowercase();
        if let Some(first) = tier.get_mut(0..1) {
            first.make_ascii_uppercase();
        }
        if self.division.is_empty() {
            format!("{} ({} LP)", tier, self.league_points)
        } else {
            format!("{} {} ({} LP)", tier, self.division, self.league_points)
        }
    }
}

/// Summary profile, cached under the volatile TTL class.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PlayerProfile {
    pub puuid: String,
    pub display_name: String,
    pub summoner_level: u32,
    pub profile_icon_id: u32,
    pub rank: RankInfo,
}

impl PlayerProfile {
    pub fn profile_icon_url(&self) -> String {
        format!(
            "https://ddragon.leagueoflegends.com/cdn/{}/img/profileicon/{}.png",
            DDRAGON_VERSION, self.profile_icon_id
        )
    }
}

// ---------------------------------------------------------------------------
// Stage boundaries
// ---------------------------------------------------------------------------

/// Output of candidate discovery.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct CandidateSet {
    /// Selected ids, in selection order.
    pub match_ids: Vec<String>,
    /// Ids the upstream listed before selection.
    pub total_available: usize,
    pub strategy: &'static str,
    /// Share of ranked games in the sample, when one was taken.
    pub ranked_ratio: Option<f64>,
    /// Details already fetched while sampling, keyed by selected id.
    pub prefetched: HashMap<String, MatchDetail>,
    /// Discovery stopped early on an upstream failure.
    pub truncated: bool,
}

/// Output of the detail fetch stage.
#[derive(Debug, Clone, Default)]
pub struct DetailSet {
    /// Usable records, in candidate order.
    pub records: Vec<MatchDetail>,
    pub failed: Vec<String>,
    pub cache_hits: usize,
    pub requested: usize,
}

/// Per-game stats for the analysed player.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct PlayerGame {
    pub timestamp: i64,
    pub champion: String,
    pub role: String,
    pub win: bool,
    pub minutes: f64,
    pub queue_id: u32,
    pub kills: u32,
    pub deaths: u32,
    pub assists: u32,
    pub kda: f64,
    pub solo_kills: f64,
    pub multikills: u32,
    pub penta_kills: u32,
    pub damage_per_min: f64,
    pub team_damage_pct: f64,
    pub gold_per_min: f64,
    pub cs_per_min: f64,
    pub vision_per_min: f64,
}

/// First-half vs second-half comparison, present with enough games.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct TrendDelta {
    pub first_half_win_rate: f64,
    pub second_half_win_rate: f64,
    pub kda_change: f64,
    pub cs_change: f64,
    pub vision_change: f64,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct PerformanceTrends {
    pub total_games: usize,
    pub overall_win_rate: f64,
    pub avg_kda: f64,
    pub avg_kills: f64,
    pub avg_deaths: f64,
    pub avg_assists: f64,
    pub avg_cs_per_min: f64,
    pub avg_vision_per_min: f64,
    pub avg_damage_per_min: f64,
    pub avg_gold_per_min: f64,
    pub total_multikills: u32,
    pub total_penta_kills: u32,
    pub best_kda: f64,
    pub highest_kills: u32,
    pub ranked_games: usize,
    pub ranked_percentage: f64,
    pub trend: Option<TrendDelta>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ChampionStat {
    pub name: String,
    pub games: usize,
    pub wins: usize,
    pub win_rate: f64,
    pub avg_kda: f64,
    pub primary_role: String,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct RoleStat {
    pub games: usize,
    pub wins: usize,
    pub win_rate: f64,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct ChampionPool {
    pub unique_champions: usize,
    /// Most played first, at most ten.
    pub top_champions: Vec<ChampionStat>,
    pub role_distribution: BTreeMap<String, RoleStat>,
    pub primary_role: String,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct PlaystyleScores {
    pub aggression: f64,
    pub carry_potential: f64,
    pub vision_mastery: f64,
    pub teamfight_prowess: f64,
    pub overall_kda: f64,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct Playstyle {
    pub primary_trait: String,
    pub description: String,
    pub scores: PlaystyleScores,
}

// ---------------------------------------------------------------------------
// Inference output and final result
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Highlight {
    pub stat: String,
    pub value: String,
}

/// Narrative produced by the inference stage.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Insight {
    pub highlights: Vec<Highlight>,
    pub insight: String,
    pub personality: String,
}

/// Where the insight text came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum InsightSource {
    Model,
    Heuristic,
    /// No records, nothing to describe.
    None,
}

/// Terminal payload of a successful job.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AnalysisResult {
    pub job_id: JobId,
    pub player_id: String,
    pub display_name: String,
    pub rank: String,
    pub main_role: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub profile_icon_url: Option<String>,
    pub top_champions: Vec<ChampionStat>,
    pub highlights: Vec<Highlight>,
    pub insight: String,
    pub personality: String,
    pub insight_source: InsightSource,
    /// How the analysed matches were chosen, e.g. `ranked_only`.
    #[serde(default)]
    pub selection_strategy: String,
    pub records_requested: usize,
    pub records_analyzed: usize,
    pub records_failed: usize,
    pub cache_hits: usize,
    /// Annotations about partial failures and fallbacks.
    pub notes: Vec<String>,
    pub generated_at: DateTime<Utc>,
}

impl AnalysisResult {
    /// Result for a player with no candidate records.
    pub fn empty(job_id: JobId, player_id: &str, display_name: &str) -> Self {
        Self {
            job_id,
            player_id: player_id.to_string(),
            display_name: display_name.to_string(),
            rank: RankInfo::default().display(),
            main_role: "Unknown".to_string(),
            profile_icon_url: None,
            top_champions: Vec::new(),
            highlights: Vec::new(),
            insight: String::new(),
            personality: String::new(),
            insight_source: InsightSource::None,
            selection_strategy: String::new(),
            records_requested: 0,
            records_analyzed: 0,
            records_failed: 0,
            cache_hits: 0,
            notes: vec!["No recent matches found for this player".to_string()],
            generated_at: Utc::now(),
        }
    }

    /// e.g. `matches analyzed: 187 of 200 requested`.
    pub fn coverage_note(&self) -> String {
        format!(
            "matches analyzed: {} of {} requested",
            self.records_analyzed, self.records_requested
        )
    }
}

/// Human-readable role names for `teamPosition` values.
pub fn role_display(position: &str) -> &'static str {
    match position {
        "TOP" => "Top",
        "JUNGLE" => "Jungle",
        "MIDDLE" => "Mid",
        "BOTTOM" => "ADC",
        "UTILITY" => "Support",
        _ => "Fill",
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_match_detail_ignores_unknown_fields() {
        let json = r#"{
            "metadata": {"matchId": "NA1_1", "dataVersion": "2"},
            "info": {
                "gameCreation": 1700000000000,
                "gameDuration": 1800,
                "queueId": 420,
                "gameMode": "CLASSIC",
                "participants": [
                    {"puuid": "p1", "championName": "Ahri", "kills": 7, "newField": [1, 2]}
                ]
            },
            "extra": true
        }"#;

        let detail: MatchDetail = serde_json::from_str(json).unwrap();
        assert_eq!(detail.metadata.match_id, "NA1_1");
        assert!(detail.is_ranked());
        assert!(!detail.is_normal());
        let player = detail.participant("p1").unwrap();
        assert_eq!(player.champion_name, "Ahri");
        assert_eq!(player.kills, 7);
        assert_eq!(player.deaths, 0);
        assert!(detail.participant("p2").is_none());
    }

    #[test]
    fn test_rank_display() {
        let rank = RankInfo {
            tier: "GOLD".to_string(),
            division: "II".to_string(),
            league_points: 45,
            wins: 30,
            losses: 10,
        };
        assert_eq!(rank.display(), "Gold II (45 LP)");
        assert_eq!(rank.win_rate(), 75.0);
        assert_eq!(RankInfo::default().display(), "Unranked");
    }

    #[test]
    fn test_job_id_round_trips_through_string() {
        let id = JobId::new();
        let parsed: JobId = id.to_string().parse().unwrap();
        assert_eq!(id, parsed);
        assert!("not-a-job".parse::<JobId>().is_err());
        assert_ne!(JobId::new(), JobId::new());
    }

    #[test]
    fn test_role_display() {
        assert_eq!(role_display("UTILITY"), "Support");
        assert_eq!(role_display("BOTTOM"), "ADC");
        assert_eq!(role_display(""), "Fill");
    }

    #[test]
    fn test_empty_result_annotates() {
        let result = AnalysisResult::empty(JobId::new(), "p1", "Player#NA1");
        assert_eq!(result.records_analyzed, 0);
        assert_eq!(result.insight_source, InsightSource::None);
        assert_eq!(result.coverage_note(), "matches analyzed: 0 of 0 requested");
        assert!(!result.notes.is_empty());
    }
}
