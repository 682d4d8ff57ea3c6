//! Drives one analysis job through its stages.
//!
//! `Started -> FetchingCandidates -> FetchingDetails -> Aggregating ->
//! Inferring -> Complete`, with `Errored` reachable from any non-terminal
//! step. Each job runs as a supervised background task; observers only
//! ever read its progress and final snapshot.

mod context;

pub use context::{JobContext, JobRequest, DEFAULT_RECORDS, MAX_RECORDS, MIN_RECORDS};

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use futures::StreamExt;
use serde::Serialize;
use std::collections::{HashMap, HashSet};
use std::future::Future;
use std::sync::{Arc, Weak};
use std::time::Duration;
use tokio::sync::OnceCell;
use tokio::task::{JoinError, JoinHandle};
use tokio::time::Instant;
use tracing::{debug, error, info, warn};

use crate::analysis::{
    champion_pool, heuristic_insight, performance_trends, player_games, playstyle,
};
use crate::cache::{CacheStats, MemoCache, RecordCache, TtlClass};
use crate::error::PipelineError;
use crate::limiter::{AdaptiveBackoff, BackoffSnapshot, QuotaLimiter, WindowUsage};
use crate::models::{
    AnalysisResult, CandidateSet, ChampionPool, DetailSet, Insight, InsightSource, JobId,
    JobStatus, MatchDetail, PerformanceTrends, PlayerGame, PlayerProfile, Playstyle,
};
use crate::progress::{ProgressBroker, ProgressEvent, Step, Subscription};
use crate::upstream::inference::{build_prompt, parse_insight, PromptInput};
use crate::upstream::telemetry::rank_from_entries;
use crate::upstream::{InferenceService, TelemetryError, TelemetrySource};

const PCT_STARTED: u8 = 0;
const PCT_CANDIDATES: u8 = 5;
const PCT_DETAILS: u8 = 15;
const PCT_DETAILS_DONE: u8 = 60;
const PCT_AGGREGATING: u8 = 65;
const PCT_INFERRING: u8 = 80;

/// Top champions carried into the result.
const RESULT_CHAMPIONS: usize = 3;

/// Below this sampled share of ranked games, selection ignores queue type.
const RANKED_MAJORITY: f64 = 0.5;

/// Tunables for the pipeline itself.
#[derive(Debug, Clone)]
pub struct PipelineSettings {
    /// Detail fetches in flight at once.
    pub fetch_concurrency: usize,
    /// Ignore matches older than this many days. Zero disables the bound.
    pub max_age_days: u32,
    /// Ids requested per discovery page.
    pub page_size: usize,
    /// Most ids listed before selection, never fewer than the request.
    pub discovery_limit: usize,
    /// Matches inspected to estimate the ranked share.
    pub sample_size: usize,
    /// Wait after a telemetry throttle that carries no `Retry-After`.
    pub throttle_pause: Duration,
    /// How long finished jobs stay queryable.
    pub retention: Duration,
    pub reap_interval: Duration,
    pub broker_capacity: usize,
}

impl Default for PipelineSettings {
    fn default() -> Self {
        Self {
            fetch_concurrency: 10,
            max_age_days: 100,
            page_size: 100,
            discovery_limit: 300,
            sample_size: 50,
            throttle_pause: Duration::from_secs(10),
            retention: Duration::from_secs(30 * 60),
            reap_interval: Duration::from_secs(60),
            broker_capacity: 64,
        }
    }
}

/// Process-wide dependencies shared by every job.
pub struct Services {
    pub telemetry: Arc<dyn TelemetrySource>,
    pub inference: Arc<dyn InferenceService>,
    pub quota: Arc<QuotaLimiter>,
    pub backoff: Arc<AdaptiveBackoff>,
    pub cache: Arc<RecordCache>,
}

#[derive(Debug, Clone, Serialize)]
pub struct JobTicket {
    pub job_id: JobId,
    pub status: JobStatus,
}

/// Job state as returned to callers.
#[derive(Debug, Clone, Serialize)]
pub struct JobSnapshot {
    pub job_id: JobId,
    pub dataset_id: String,
    pub status: JobStatus,
    pub started_at: DateTime<Utc>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub finished_at: Option<DateTime<Utc>>,
    /// Most recent progress event, while the broker still has one.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub progress: Option<ProgressEvent>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub result: Option<Arc<AnalysisResult>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub retry_after_secs: Option<u64>,
}

struct JobRecord {
    snapshot: JobSnapshot,
    finished: Option<Instant>,
}

#[derive(Debug, Clone, Serialize)]
pub struct HealthReport {
    pub status: &'static str,
    pub quota: Vec<WindowUsage>,
    pub inference: BackoffSnapshot,
    pub cache: CacheStats,
    pub memo_entries: usize,
    pub memo_computations: usize,
    pub active_jobs: usize,
    pub tracked_jobs: usize,
}

/// A resolved Riot ID.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct PlayerLookup {
    pub puuid: String,
    pub riot_id: String,
}

#[derive(Debug, Clone, Serialize)]
pub struct ProfileLookup {
    #[serde(flatten)]
    pub profile: PlayerProfile,
    pub rank_display: String,
    pub win_rate: f64,
    pub profile_icon_url: String,
    /// Served from the volatile cache without touching the API.
    pub cached: bool,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub warnings: Vec<String>,
}

impl ProfileLookup {
    fn new(profile: PlayerProfile, cached: bool, warnings: Vec<String>) -> Self {
        Self {
            rank_display: profile.rank.display(),
            win_rate: profile.rank.win_rate(),
            profile_icon_url: profile.profile_icon_url(),
            profile,
            cached,
            warnings,
        }
    }
}

/// Memoized aggregates for one job.
struct Aggregates {
    games: Arc<Vec<PlayerGame>>,
    performance: Arc<PerformanceTrends>,
    champion_pool: Arc<ChampionPool>,
    playstyle: Arc<Playstyle>,
}

/// Outcome of one match fetch, shared by every job that asked for it.
type SharedFetch = Arc<OnceCell<Result<MatchDetail, TelemetryError>>>;

pub struct Orchestrator {
    telemetry: Arc<dyn TelemetrySource>,
    inference: Arc<dyn InferenceService>,
    quota: Arc<QuotaLimiter>,
    backoff: Arc<AdaptiveBackoff>,
    cache: Arc<RecordCache>,
    memo: Arc<MemoCache>,
    broker: Arc<ProgressBroker>,
    settings: PipelineSettings,
    jobs: DashMap<JobId, JobRecord>,
    /// Match fetches not yet written to the cache.
    in_flight: DashMap<String, SharedFetch>,
}

impl Orchestrator {
    pub fn new(services: Services, settings: PipelineSettings) -> Arc<Self> {
        Arc::new(Self {
            telemetry: services.telemetry,
            inference: services.inference,
            quota: services.quota,
            backoff: services.backoff,
            cache: services.cache,
            memo: Arc::new(MemoCache::new()),
            broker: Arc::new(ProgressBroker::new(settings.broker_capacity)),
            settings,
            jobs: DashMap::new(),
            in_flight: DashMap::new(),
        })
    }

    /// Resolve a Riot ID if the request carries one, then start the job.
    pub async fn submit(
        self: &Arc<Self>,
        mut request: JobRequest,
    ) -> Result<JobTicket, PipelineError> {
        request.validate()?;
        if let Some((game_name, tag_line)) = request.riot_id() {
            let (game_name, tag_line) = (game_name.to_string(), tag_line.to_string());
            let player = self.resolve_riot_id(&game_name, &tag_line).await?;
            request.player_id = player.puuid;
            if request.display_name.is_none() {
                request.display_name = Some(player.riot_id);
            }
        }
        self.start_job(request)
    }

    /// Register a job and run it in the background.
    pub fn start_job(self: &Arc<Self>, request: JobRequest) -> Result<JobTicket, PipelineError> {
        request.validate()?;
        if request.player_id.trim().is_empty() {
            return Err(PipelineError::InvalidRequest(
                "player_id must be resolved before the job starts".to_string(),
            ));
        }

        let job_id = JobId::new();
        let snapshot = JobSnapshot {
            job_id,
            dataset_id: request.player_id.clone(),
            status: JobStatus::Running,
            started_at: Utc::now(),
            finished_at: None,
            progress: None,
            result: None,
            error: None,
            retry_after_secs: None,
        };
        self.jobs.insert(
            job_id,
            JobRecord {
                snapshot,
                finished: None,
            },
        );

        self.broker.open(job_id);
        let ctx = JobContext::new(
            job_id,
            request,
            Arc::clone(&self.memo),
            Arc::clone(&self.broker),
        );
        self.memo.begin(job_id, &ctx.dataset_key);
        ctx.transition(Step::Started, PCT_STARTED, "Analysis started");

        tokio::spawn(Arc::clone(self).supervise(Arc::new(ctx)));

        Ok(JobTicket {
            job_id,
            status: JobStatus::Running,
        })
    }

    pub fn snapshot(&self, job_id: JobId) -> Option<JobSnapshot> {
        let mut snapshot = self.jobs.get(&job_id)?.snapshot.clone();
        snapshot.progress = self.broker.latest(job_id);
        Some(snapshot)
    }

    pub fn subscribe(&self, job_id: JobId) -> Option<Subscription> {
        self.broker.subscribe(job_id)
    }

    pub async fn health(&self) -> HealthReport {
        HealthReport {
            status: "healthy",
            quota: self.quota.snapshot(),
            inference: self.backoff.snapshot(),
            cache: self.cache.stats().await,
            memo_entries: self.memo.entry_count(),
            memo_computations: self.memo.total_computations(),
            active_jobs: self.broker.active_channels(),
            tracked_jobs: self.jobs.len(),
        }
    }

    /// Account lookup for a Riot ID, paced by the quota limiter.
    pub async fn resolve_riot_id(
        &self,
        game_name: &str,
        tag_line: &str,
    ) -> Result<PlayerLookup, PipelineError> {
        let riot_id = format!("{}#{}", game_name, tag_line);
        let account = self
            .paced("account", || self.telemetry.fetch_account(game_name, tag_line))
            .await
            .map_err(|e| PipelineError::from_lookup(e, &riot_id))?;

        let resolved = if account.game_name.is_empty() {
            riot_id
        } else {
            format!("{}#{}", account.game_name, account.tag_line)
        };
        debug!("Resolved {} to {}", resolved, account.puuid);
        Ok(PlayerLookup {
            puuid: account.puuid,
            riot_id: resolved,
        })
    }

    /// Profile from the volatile cache, else from the API.
    ///
    /// A failed rank lookup still yields a profile, with a warning, and
    /// that profile is not cached.
    pub async fn profile(
        &self,
        puuid: &str,
        display_name: &str,
    ) -> Result<ProfileLookup, TelemetryError> {
        if let Some(profile) = self.cache.profiles.get(puuid).await {
            return Ok(ProfileLookup::new(profile, true, Vec::new()));
        }

        let summoner = self
            .paced("summoner", || self.telemetry.fetch_summoner(puuid))
            .await?;

        let mut warnings = Vec::new();
        let rank = match self
            .paced("league entries", || self.telemetry.fetch_league_entries(puuid))
            .await
        {
            Ok(entries) => rank_from_entries(&entries),
            Err(e) => {
                warn!("Rank lookup failed for {}: {}", puuid, e);
                warnings.push(format!("Rank unavailable: {}", e));
                Default::default()
            }
        };

        let profile = PlayerProfile {
            puuid: puuid.to_string(),
            display_name: display_name.to_string(),
            summoner_level: summoner.summoner_level,
            profile_icon_id: summoner.profile_icon_id,
            rank,
        };

        if warnings.is_empty() {
            if let Err(e) = self
                .cache
                .profiles
                .put_many(vec![(puuid.to_string(), profile.clone())], TtlClass::Volatile)
                .await
            {
                warn!("Failed to cache profile: {:#}", e);
            }
        }
        Ok(ProfileLookup::new(profile, false, warnings))
    }

    /// Forget jobs that finished more than `retention` ago.
    pub fn reap_finished(&self) -> usize {
        let retention = self.settings.retention;
        let before = self.jobs.len();
        self.jobs.retain(|_, record| {
            record
                .finished
                .map_or(true, |finished| finished.elapsed() < retention)
        });
        let reaped = before.saturating_sub(self.jobs.len());
        let swept = self.broker.sweep(retention);
        if reaped > 0 || swept > 0 {
            info!("Reaped {} finished jobs and {} progress tombstones", reaped, swept);
        }
        reaped
    }

    /// Periodically reap finished jobs until the orchestrator is dropped.
    pub fn spawn_reaper(self: &Arc<Self>) -> JoinHandle<()> {
        let weak: Weak<Self> = Arc::downgrade(self);
        let period = self.settings.reap_interval;

        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(period);
            ticker.tick().await;
            loop {
                ticker.tick().await;
                match weak.upgrade() {
                    Some(this) => {
                        this.reap_finished();
                    }
                    None => break,
                }
            }
        })
    }

    /// Run the pipeline in its own task and settle the job however that
    /// task ends, a panic included.
    async fn supervise(self: Arc<Self>, ctx: Arc<JobContext>) {
        let started = Instant::now();
        let worker = {
            let this = Arc::clone(&self);
            let ctx = Arc::clone(&ctx);
            tokio::spawn(async move { this.execute(&ctx).await })
        };
        let outcome = match worker.await {
            Ok(outcome) => outcome,
            Err(e) => {
                error!(job_id = %ctx.job_id, "Analysis task died: {}", e);
                Err(PipelineError::Internal(crash_reason(e)))
            }
        };

        match outcome {
            Ok(result) => {
                info!(
                    job_id = %ctx.job_id,
                    elapsed_secs = started.elapsed().as_secs_f64(),
                    "Analysis complete: {}",
                    result.coverage_note()
                );
                self.finish(ctx.job_id, JobStatus::Complete, |snapshot| {
                    snapshot.result = Some(Arc::new(result));
                });
                ctx.complete("Analysis complete");
            }
            Err(err) => {
                warn!(job_id = %ctx.job_id, "Analysis failed: {}", err);
                let retry_after = err.retry_after().map(|d| d.as_secs().max(1));
                let message = err.user_message();
                self.finish(ctx.job_id, JobStatus::Errored, |snapshot| {
                    snapshot.error = Some(message);
                    snapshot.retry_after_secs = retry_after;
                });
                ctx.fail(&err);
            }
        }

        self.memo.release(ctx.job_id);
        self.broker.close(ctx.job_id);
    }

    fn finish<F>(&self, job_id: JobId, status: JobStatus, update: F)
    where
        F: FnOnce(&mut JobSnapshot),
    {
        if let Some(mut record) = self.jobs.get_mut(&job_id) {
            record.snapshot.status = status;
            record.snapshot.finished_at = Some(Utc::now());
            record.finished = Some(Instant::now());
            update(&mut record.snapshot);
        }
    }

    async fn execute(&self, ctx: &JobContext) -> Result<AnalysisResult, PipelineError> {
        let profile = self.load_profile(ctx).await;

        ctx.transition(
            Step::FetchingCandidates,
            PCT_CANDIDATES,
            "Finding recent matches",
        );
        let candidates = self.discover_candidates(ctx).await?;
        let strategy = candidates.strategy;
        if candidates.match_ids.is_empty() {
            info!(job_id = %ctx.job_id, "No candidate matches, finishing early");
            let mut result = AnalysisResult::empty(
                ctx.job_id,
                &ctx.request.player_id,
                ctx.request.display_name(),
            );
            apply_profile(&mut result, profile.as_ref());
            result.records_requested = ctx.request.record_count;
            result.selection_strategy = strategy.to_string();
            result.notes.extend(ctx.take_notes());
            return Ok(result);
        }

        ctx.transition(
            Step::FetchingDetails,
            PCT_DETAILS,
            format!("Fetching {} matches", candidates.match_ids.len()),
        );
        let details = self.fetch_details(ctx, candidates).await?;
        info!(
            job_id = %ctx.job_id,
            "Using {} of {} selected matches",
            details.records.len(),
            details.requested
        );

        ctx.transition(
            Step::Aggregating,
            PCT_AGGREGATING,
            format!("Analyzing {} matches", details.records.len()),
        );
        let aggregates = self.aggregate(ctx, &details.records).await?;
        let skipped = details.records.len() - aggregates.games.len();
        if skipped > 0 {
            ctx.note(format!(
                "{} matches did not include this player and were skipped",
                skipped
            ));
        }

        ctx.transition(Step::Inferring, PCT_INFERRING, "Generating insights");
        let (insight, source) = self.infer(ctx, &details.records, profile.as_ref()).await?;

        let mut result = AnalysisResult::empty(
            ctx.job_id,
            &ctx.request.player_id,
            ctx.request.display_name(),
        );
        apply_profile(&mut result, profile.as_ref());
        result.main_role = aggregates.champion_pool.primary_role.clone();
        result.top_champions = aggregates
            .champion_pool
            .top_champions
            .iter()
            .take(RESULT_CHAMPIONS)
            .cloned()
            .collect();
        result.highlights = insight.highlights;
        result.insight = insight.insight;
        result.personality = insight.personality;
        result.insight_source = source;
        result.selection_strategy = strategy.to_string();
        result.records_requested = ctx.request.record_count;
        result.records_analyzed = aggregates.games.len();
        result.records_failed = details.failed.len();
        result.cache_hits = details.cache_hits;
        result.notes = ctx.take_notes();
        result.notes.push(result.coverage_note());
        result.generated_at = Utc::now();
        Ok(result)
    }

    /// Reserve quota, call, and retry once after a server-side throttle.
    async fn paced<T, F, Fut>(&self, what: &str, call: F) -> Result<T, TelemetryError>
    where
        F: Fn() -> Fut,
        Fut: Future<Output = Result<T, TelemetryError>>,
    {
        self.quota.reserve().await;
        match call().await {
            Err(TelemetryError::Throttled { retry_after }) => {
                let pause = retry_after.unwrap_or(self.settings.throttle_pause);
                warn!(
                    "Telemetry API throttled {}, retrying once in {}s",
                    what,
                    pause.as_secs()
                );
                tokio::time::sleep(pause).await;
                self.quota.reserve().await;
                call().await
            }
            other => other,
        }
    }

    /// Fetch one match, joining any fetch of the same id already under way.
    ///
    /// A new fetch checks the cache first: ids leave the map only after
    /// their record is stored there.
    async fn fetch_match_shared(&self, id: &str) -> Result<MatchDetail, TelemetryError> {
        let cell = Arc::clone(self.in_flight.entry(id.to_string()).or_default().value());
        let outcome = cell
            .get_or_init(|| async move {
                if let Some(detail) = self.cache.matches.get(id).await {
                    return Ok(detail);
                }
                self.paced("match detail", || self.telemetry.fetch_match(id))
                    .await
            })
            .await
            .clone();
        if outcome.is_err() {
            self.in_flight.remove_if(id, |_, held| Arc::ptr_eq(held, &cell));
        }
        outcome
    }

    /// Persist fetched matches, then let later fetches of them go to the cache.
    async fn store_fetched(&self, fetched: &HashMap<String, MatchDetail>) {
        if fetched.is_empty() {
            return;
        }
        let entries: Vec<(String, MatchDetail)> = fetched
            .iter()
            .map(|(id, detail)| (id.clone(), detail.clone()))
            .collect();
        if let Err(e) = self.cache.matches.put_many(entries, TtlClass::Stable).await {
            warn!("Failed to cache match details: {:#}", e);
        }
        for id in fetched.keys() {
            self.in_flight.remove(id);
        }
    }

    /// Details for `ids` from the cache or the API. Returns every detail
    /// obtained and the ids that needed an API fetch.
    async fn prefetch(
        &self,
        ctx: &JobContext,
        ids: &[String],
    ) -> (HashMap<String, MatchDetail>, HashSet<String>) {
        let lookup = self.cache.matches.get_many(ids).await;
        let mut details = lookup.hits;
        let job_id = ctx.job_id;

        let fetched: HashMap<String, MatchDetail> = futures::stream::iter(lookup.misses)
            .map(|id| async move {
                let result = self.fetch_match_shared(&id).await;
                (id, result)
            })
            .buffer_unordered(self.settings.fetch_concurrency.max(1))
            .filter_map(|(id, result)| async move {
                match result {
                    Ok(detail) => Some((id, detail)),
                    Err(e) => {
                        debug!(job_id = %job_id, "Sample fetch of {} failed: {}", id, e);
                        None
                    }
                }
            })
            .collect()
            .await;

        self.store_fetched(&fetched).await;
        let fresh: HashSet<String> = fetched.keys().cloned().collect();
        details.extend(fetched);
        (details, fresh)
    }

    /// Profile for the job. Failures are annotated and do not stop it.
    async fn load_profile(&self, ctx: &JobContext) -> Option<PlayerProfile> {
        match self
            .profile(&ctx.request.player_id, ctx.request.display_name())
            .await
        {
            Ok(lookup) => {
                for warning in lookup.warnings {
                    ctx.note(warning);
                }
                Some(lookup.profile)
            }
            Err(e) => {
                warn!(job_id = %ctx.job_id, "Profile lookup failed: {}", e);
                ctx.note(format!("Profile unavailable: {}", e));
                None
            }
        }
    }

    async fn discover_candidates(&self, ctx: &JobContext) -> Result<CandidateSet, PipelineError> {
        let puuid = ctx.request.player_id.as_str();
        let target = ctx.request.record_count;
        let limit = self.settings.discovery_limit.max(target);
        let page_size = self.settings.page_size.max(1);
        // An age beyond the representable range means no bound at all.
        let start_time = match self.settings.max_age_days {
            0 => None,
            days => chrono::Duration::try_days(i64::from(days))
                .and_then(|age| Utc::now().checked_sub_signed(age))
                .map(|cutoff| cutoff.timestamp()),
        };

        let mut ids: Vec<String> = Vec::new();
        let mut truncated = false;
        while ids.len() < limit {
            let start = ids.len();
            let page = self
                .paced("match ids", || {
                    self.telemetry
                        .fetch_match_ids(puuid, start, page_size, start_time)
                })
                .await;

            match page {
                Ok(page) => {
                    let len = page.len();
                    ids.extend(page);
                    if len < page_size {
                        break;
                    }
                }
                Err(e) if ids.is_empty() => return Err(PipelineError::CandidateDiscovery(e)),
                Err(e) => {
                    warn!(job_id = %ctx.job_id, "Match discovery stopped early: {}", e);
                    ctx.note(format!(
                        "Match discovery stopped after {} matches: {}",
                        ids.len(),
                        e
                    ));
                    truncated = true;
                    break;
                }
            }
        }

        let mut seen = HashSet::new();
        ids.retain(|id| seen.insert(id.clone()));
        ids.truncate(limit);

        let candidates = self.select_candidates(ctx, ids, truncated).await;
        info!(
            job_id = %ctx.job_id,
            strategy = candidates.strategy,
            ranked_ratio = candidates.ranked_ratio,
            truncated = candidates.truncated,
            "Selected {} candidate matches ({} listed)",
            candidates.match_ids.len(),
            candidates.total_available
        );
        Ok(candidates)
    }

    /// Choose which listed matches to analyse.
    ///
    /// With more matches than requested, a sample estimates the ranked
    /// share. A mostly-ranked history is analysed on ranked games alone
    /// when enough exist (`ranked_only`), otherwise ranked games come
    /// first, then normals, then unsampled ids (`ranked_priority`).
    /// Anything else keeps the most recent ids.
    async fn select_candidates(
        &self,
        ctx: &JobContext,
        ids: Vec<String>,
        truncated: bool,
    ) -> CandidateSet {
        let target = ctx.request.record_count;
        let total_available = ids.len();
        if total_available <= target {
            return CandidateSet {
                match_ids: ids,
                total_available,
                strategy: "all_available",
                truncated,
                ..Default::default()
            };
        }

        let sample_len = self.settings.sample_size.clamp(1, total_available);
        let (mut known, mut fresh) = self.prefetch(ctx, &ids[..sample_len]).await;
        let ranked: Vec<String> = ids[..sample_len]
            .iter()
            .filter(|id| ranked_in(&known, id))
            .cloned()
            .collect();
        let ratio = ranked.len() as f64 / sample_len as f64;
        let estimated = (total_available as f64 * ratio) as usize;
        debug!(
            job_id = %ctx.job_id,
            "Sampled {} matches: {} ranked, about {} ranked listed",
            sample_len,
            ranked.len(),
            estimated
        );

        let (mut selected, strategy) = if ratio < RANKED_MAJORITY {
            (ids[..target].to_vec(), "most_recent")
        } else if estimated >= target {
            let mut selected = ranked;
            let budget = target.saturating_sub(selected.len()) * 2;
            let rest: Vec<String> = ids[sample_len..].iter().take(budget).cloned().collect();
            for chunk in rest.chunks(self.settings.fetch_concurrency.max(1)) {
                if selected.len() >= target {
                    break;
                }
                let (chunk_known, chunk_fresh) = self.prefetch(ctx, chunk).await;
                selected.extend(chunk.iter().filter(|id| ranked_in(&chunk_known, id)).cloned());
                known.extend(chunk_known);
                fresh.extend(chunk_fresh);
            }
            if selected.len() < target {
                ctx.note(format!(
                    "Only {} ranked matches found for {} requested",
                    selected.len(),
                    target
                ));
            }
            (selected, "ranked_only")
        } else {
            let mut selected = ranked;
            let mut rest: Vec<String> = Vec::new();
            for id in &ids[..sample_len] {
                if known.get(id).is_some_and(MatchDetail::is_normal) {
                    selected.push(id.clone());
                } else if !ranked_in(&known, id) {
                    rest.push(id.clone());
                }
            }
            selected.truncate(target);
            let missing = target - selected.len();
            selected.extend(
                ids[sample_len..]
                    .iter()
                    .chain(rest.iter())
                    .take(missing)
                    .cloned(),
            );
            (selected, "ranked_priority")
        };
        selected.truncate(target);

        let prefetched: HashMap<String, MatchDetail> = selected
            .iter()
            .filter(|id| fresh.contains(*id))
            .filter_map(|id| known.remove(id).map(|detail| (id.clone(), detail)))
            .collect();

        CandidateSet {
            match_ids: selected,
            total_available,
            strategy,
            ranked_ratio: Some(ratio),
            prefetched,
            truncated,
        }
    }

    async fn fetch_details(
        &self,
        ctx: &JobContext,
        candidates: CandidateSet,
    ) -> Result<DetailSet, PipelineError> {
        let requested = candidates.match_ids.len();
        let mut prefetched = candidates.prefetched;
        let pending: Vec<String> = candidates
            .match_ids
            .iter()
            .filter(|id| !prefetched.contains_key(*id))
            .cloned()
            .collect();

        let lookup = self.cache.matches.get_many(&pending).await;
        info!(
            job_id = %ctx.job_id,
            hits = lookup.hits.len(),
            misses = lookup.misses.len(),
            prefetched = prefetched.len(),
            "Match cache hit ratio {:.0}%",
            lookup.hit_ratio() * 100.0
        );

        let cache_hits = lookup.hits.len();
        let mut hits = lookup.hits;
        let to_fetch = lookup.misses.len();
        let batch = self.settings.fetch_concurrency.max(1);
        let ready = cache_hits + prefetched.len();

        let mut fetched: HashMap<String, MatchDetail> = HashMap::new();
        let mut failed: Vec<String> = Vec::new();
        let mut done = 0usize;

        let mut results = futures::stream::iter(lookup.misses)
            .map(|id| async move {
                let result = self.fetch_match_shared(&id).await;
                (id, result)
            })
            .buffer_unordered(batch);

        while let Some((id, result)) = results.next().await {
            done += 1;
            match result {
                Ok(detail) => {
                    fetched.insert(id, detail);
                }
                Err(e) => {
                    warn!(job_id = %ctx.job_id, "Failed to fetch match {}: {}", id, e);
                    failed.push(id);
                }
            }

            if done % batch == 0 || done == to_fetch {
                let span = u64::from(PCT_DETAILS_DONE - PCT_DETAILS);
                let percent = PCT_DETAILS + (span * done as u64 / to_fetch as u64) as u8;
                ctx.report(
                    Step::FetchingDetails,
                    percent,
                    format!("Fetched {}/{} matches", ready + fetched.len(), requested),
                );
            }
        }
        drop(results);

        self.store_fetched(&fetched).await;

        let records: Vec<MatchDetail> = candidates
            .match_ids
            .iter()
            .filter_map(|id| {
                prefetched
                    .remove(id)
                    .or_else(|| hits.remove(id))
                    .or_else(|| fetched.remove(id))
            })
            .collect();

        if records.is_empty() {
            return Err(PipelineError::NoUsableRecords { requested });
        }
        if !failed.is_empty() {
            ctx.note(format!(
                "{} of {} matches could not be fetched",
                failed.len(),
                requested
            ));
        }

        Ok(DetailSet {
            records,
            failed,
            cache_hits,
            requested,
        })
    }

    /// Every derived summary goes through the job's memo cache.
    async fn aggregate(
        &self,
        ctx: &JobContext,
        records: &[MatchDetail],
    ) -> Result<Aggregates, PipelineError> {
        let puuid = ctx.request.player_id.as_str();
        let games: Arc<Vec<PlayerGame>> = ctx
            .memo("player_games", || async move {
                let games = player_games(records, puuid);
                if games.is_empty() {
                    Err(PipelineError::NoUsableRecords {
                        requested: records.len(),
                    })
                } else {
                    Ok(games)
                }
            })
            .await?;
        let performance = ctx.memo_sync("performance", || performance_trends(&games));
        let champion_pool = ctx.memo_sync("champion_pool", || champion_pool(&games));
        let playstyle = ctx.memo_sync("playstyle", || playstyle(&games));

        Ok(Aggregates {
            games,
            performance,
            champion_pool,
            playstyle,
        })
    }

    async fn infer(
        &self,
        ctx: &JobContext,
        records: &[MatchDetail],
        profile: Option<&PlayerProfile>,
    ) -> Result<(Insight, InsightSource), PipelineError> {
        let max_attempts = self.backoff.max_attempts().max(1);
        let rank = profile.map(|p| p.rank.clone()).unwrap_or_default();
        let rank_display = rank.display();

        for attempt in 1..=max_attempts {
            // Retries re-read the memoized aggregates instead of recomputing.
            let aggregates = self.aggregate(ctx, records).await?;
            let prompt = build_prompt(&PromptInput {
                rank: &rank_display,
                tier: &rank.tier,
                records_analyzed: aggregates.games.len(),
                performance: &aggregates.performance,
                champion_pool: &aggregates.champion_pool,
                playstyle: &aggregates.playstyle,
            });

            self.backoff.wait_before_call(attempt > 1).await;
            match self.inference.generate(&prompt).await {
                Ok(reply) => {
                    self.backoff.record_result(true, false);
                    return match parse_insight(&reply) {
                        Ok(insight) => Ok((insight, InsightSource::Model)),
                        Err(e) => Ok(self.fallback(ctx, &aggregates, &e.to_string())),
                    };
                }
                Err(e) if e.is_throttle() => {
                    self.backoff.record_result(false, true);
                    warn!(
                        job_id = %ctx.job_id,
                        consecutive_throttles = self.backoff.consecutive_throttles(),
                        "Inference throttled on attempt {}/{}",
                        attempt,
                        max_attempts
                    );
                    if attempt < max_attempts {
                        ctx.report(
                            Step::Inferring,
                            PCT_INFERRING,
                            format!(
                                "AI service is busy, retrying (attempt {}/{})",
                                attempt + 1,
                                max_attempts
                            ),
                        );
                    }
                }
                Err(e) => {
                    self.backoff.record_result(false, false);
                    return Ok(self.fallback(ctx, &aggregates, &e.to_string()));
                }
            }
        }

        Err(PipelineError::RetryBudgetExhausted {
            attempts: max_attempts,
            retry_after: self.backoff.current_delay(),
        })
    }

    fn fallback(
        &self,
        ctx: &JobContext,
        aggregates: &Aggregates,
        reason: &str,
    ) -> (Insight, InsightSource) {
        warn!(job_id = %ctx.job_id, "Using heuristic insights: {}", reason);
        ctx.note("AI insights unavailable, showing a statistical summary instead");
        (
            heuristic_insight(&aggregates.performance, &aggregates.playstyle),
            InsightSource::Heuristic,
        )
    }
}

fn apply_profile(result: &mut AnalysisResult, profile: Option<&PlayerProfile>) {
    if let Some(profile) = profile {
        result.display_name = profile.display_name.clone();
        result.rank = profile.rank.display();
        result.profile_icon_url = Some(profile.profile_icon_url());
    }
}

fn ranked_in(known: &HashMap<String, MatchDetail>, id: &str) -> bool {
    known.get(id).is_some_and(MatchDetail::is_ranked)
}

fn crash_reason(err: JoinError) -> String {
    if !err.is_panic() {
        return "task was cancelled".to_string();
    }
    let payload = err.into_panic();
    if let Some(message) = payload.downcast_ref::<&str>() {
        message.to_string()
    } else if let Some(message) = payload.downcast_ref::<String>() {
        message.clone()
    } else {
        "task panicked".to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache::TtlPolicy;
    use crate::limiter::{BackoffPolicy, QuotaWindow};
    use crate::progress::ProgressEvent;
    use crate::upstream::inference::InferenceError;
    use crate::upstream::testing::{
        match_ids, sample_match, FakeInference, FakeTelemetry, PLAYER, UNKNOWN_PLAYER,
    };

    fn build(
        telemetry: Arc<FakeTelemetry>,
        inference: Arc<FakeInference>,
    ) -> (Arc<Orchestrator>, Arc<RecordCache>) {
        build_with(telemetry, inference, PipelineSettings::default())
    }

    fn build_with(
        telemetry: Arc<FakeTelemetry>,
        inference: Arc<FakeInference>,
        settings: PipelineSettings,
    ) -> (Arc<Orchestrator>, Arc<RecordCache>) {
        let cache = Arc::new(RecordCache::in_memory(TtlPolicy::default()));
        let services = Services {
            telemetry,
            inference,
            quota: Arc::new(QuotaLimiter::new(vec![QuotaWindow::new(
                1000,
                Duration::from_secs(1),
            )])),
            backoff: Arc::new(AdaptiveBackoff::new(BackoffPolicy::default())),
            cache: Arc::clone(&cache),
        };
        (Orchestrator::new(services, settings), cache)
    }

    fn request(count: usize) -> JobRequest {
        JobRequest {
            display_name: Some("Player#NA1".to_string()),
            record_count: count,
            ..JobRequest::new(PLAYER)
        }
    }

    async fn run_to_end(orch: &Arc<Orchestrator>, count: usize) -> (JobId, Vec<ProgressEvent>) {
        run_request(orch, request(count)).await
    }

    async fn run_request(
        orch: &Arc<Orchestrator>,
        request: JobRequest,
    ) -> (JobId, Vec<ProgressEvent>) {
        let ticket = orch.start_job(request).unwrap();
        let events = orch
            .subscribe(ticket.job_id)
            .unwrap()
            .into_stream()
            .collect()
            .await;
        (ticket.job_id, events)
    }

    fn assert_well_formed(events: &[ProgressEvent]) {
        assert!(events.windows(2).all(|w| w[0].percent <= w[1].percent));
        assert_eq!(events.iter().filter(|e| e.step.is_terminal()).count(), 1);
        assert!(events.last().unwrap().step.is_terminal());
    }

    #[tokio::test(start_paused = true)]
    async fn test_happy_path_publishes_every_transition() {
        let telemetry = Arc::new(FakeTelemetry::with_matches(20));
        let inference = Arc::new(FakeInference::default());
        let (orch, _) = build(telemetry, Arc::clone(&inference));

        let (job_id, events) = run_to_end(&orch, 20).await;
        assert_well_formed(&events);

        let transitions: Vec<(Step, u8)> = events
            .iter()
            .filter(|e| !e.message.starts_with("Fetched"))
            .map(|e| (e.step, e.percent))
            .collect();
        assert_eq!(
            transitions,
            vec![
                (Step::Started, 0),
                (Step::FetchingCandidates, 5),
                (Step::FetchingDetails, 15),
                (Step::Aggregating, 65),
                (Step::Inferring, 80),
                (Step::Complete, 100),
            ]
        );

        let snapshot = orch.snapshot(job_id).unwrap();
        assert_eq!(snapshot.status, JobStatus::Complete);
        let result = snapshot.result.unwrap();
        assert_eq!(result.records_analyzed, 20);
        assert_eq!(result.insight_source, InsightSource::Model);
        assert_eq!(result.rank, "Gold II (45 LP)");
        assert_eq!(result.display_name, "Player#NA1");
        assert_eq!(result.top_champions.len(), 3);
        assert!(result.notes.contains(&"matches analyzed: 20 of 20 requested".to_string()));
        assert_eq!(inference.calls(), 1);
        assert_eq!(orch.memo.entry_count(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_throttled_inference_reuses_aggregates() {
        let telemetry = Arc::new(FakeTelemetry::with_matches(30));
        let inference = Arc::new(FakeInference::throttling(2));
        let (orch, _) = build(Arc::clone(&telemetry), Arc::clone(&inference));

        let (job_id, events) = run_to_end(&orch, 30).await;
        assert_well_formed(&events);
        assert_eq!(events.last().unwrap().step, Step::Complete);

        assert_eq!(inference.calls(), 3);
        assert_eq!(orch.memo.compute_count("performance"), 1);
        assert_eq!(orch.memo.compute_count("player_games"), 1);
        assert_eq!(telemetry.match_calls(), 30);
        assert!(events
            .iter()
            .any(|e| e.message.contains("retrying (attempt 3/3)")));

        let result = orch.snapshot(job_id).unwrap().result.unwrap();
        assert_eq!(result.insight_source, InsightSource::Model);
        assert_eq!(orch.backoff.consecutive_throttles(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_retry_budget_exhaustion_is_terminal_error() {
        let telemetry = Arc::new(FakeTelemetry::with_matches(10));
        let inference = Arc::new(FakeInference::throttling(5));
        let (orch, _) = build(telemetry, Arc::clone(&inference));

        let (job_id, events) = run_to_end(&orch, 10).await;
        assert_well_formed(&events);

        let last = events.last().unwrap();
        assert_eq!(last.step, Step::Error);
        assert_eq!(last.percent, 80);
        assert!(last.message.contains("try again"));
        assert_eq!(inference.calls(), 3);

        let snapshot = orch.snapshot(job_id).unwrap();
        assert_eq!(snapshot.status, JobStatus::Errored);
        assert!(snapshot.retry_after_secs.unwrap() >= 5);
        assert!(snapshot.result.is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn test_cached_records_are_not_refetched() {
        let telemetry = Arc::new(FakeTelemetry::with_matches(100));
        let (orch, cache) = build(Arc::clone(&telemetry), Arc::new(FakeInference::default()));

        let cached: Vec<(String, MatchDetail)> = match_ids(100)
            .into_iter()
            .enumerate()
            .take(60)
            .map(|(i, id)| {
                let detail = sample_match(&id, i);
                (id, detail)
            })
            .collect();
        cache.matches.put_many(cached, TtlClass::Stable).await.unwrap();

        let (job_id, events) = run_to_end(&orch, 100).await;
        assert_well_formed(&events);

        assert_eq!(telemetry.match_calls(), 40);
        let result = orch.snapshot(job_id).unwrap().result.unwrap();
        assert_eq!(result.records_analyzed, 100);
        assert_eq!(result.cache_hits, 60);
        assert_eq!(cache.matches.stats().await.total, 100);
    }

    #[tokio::test(start_paused = true)]
    async fn test_partial_fetch_failures_are_tolerated() {
        let mut fake = FakeTelemetry::with_matches(10);
        fake.failing = fake.ids.iter().take(3).cloned().collect();
        let (orch, _) = build(Arc::new(fake), Arc::new(FakeInference::default()));

        let (job_id, events) = run_to_end(&orch, 10).await;
        assert_eq!(events.last().unwrap().step, Step::Complete);

        let result = orch.snapshot(job_id).unwrap().result.unwrap();
        assert_eq!(result.records_analyzed, 7);
        assert_eq!(result.records_failed, 3);
        assert!(result
            .notes
            .contains(&"3 of 10 matches could not be fetched".to_string()));
    }

    #[tokio::test(start_paused = true)]
    async fn test_all_fetches_failing_is_terminal_error() {
        let mut fake = FakeTelemetry::with_matches(10);
        fake.failing = fake.ids.iter().cloned().collect();
        let inference = Arc::new(FakeInference::default());
        let (orch, _) = build(Arc::new(fake), Arc::clone(&inference));

        let (job_id, events) = run_to_end(&orch, 10).await;
        assert_well_formed(&events);
        assert_eq!(events.last().unwrap().step, Step::Error);
        assert_eq!(orch.snapshot(job_id).unwrap().status, JobStatus::Errored);
        assert_eq!(inference.calls(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_zero_candidates_completes_empty() {
        let telemetry = Arc::new(FakeTelemetry::with_matches(0));
        let inference = Arc::new(FakeInference::default());
        let (orch, _) = build(Arc::clone(&telemetry), Arc::clone(&inference));

        let (job_id, events) = run_to_end(&orch, 10).await;
        assert_well_formed(&events);
        assert_eq!(events.last().unwrap().percent, 100);

        let result = orch.snapshot(job_id).unwrap().result.unwrap();
        assert_eq!(result.records_analyzed, 0);
        assert_eq!(result.insight_source, InsightSource::None);
        assert_eq!(telemetry.match_calls(), 0);
        assert_eq!(inference.calls(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_discovery_failure_is_terminal_error() {
        let fake = FakeTelemetry {
            fail_discovery: true,
            ..FakeTelemetry::with_matches(10)
        };
        let (orch, _) = build(Arc::new(fake), Arc::new(FakeInference::default()));

        let (job_id, events) = run_to_end(&orch, 10).await;
        assert_eq!(events.last().unwrap().step, Step::Error);
        assert_eq!(events.last().unwrap().percent, 5);
        assert_eq!(orch.snapshot(job_id).unwrap().status, JobStatus::Errored);
    }

    #[tokio::test(start_paused = true)]
    async fn test_unusable_reply_falls_back_to_heuristics() {
        let telemetry = Arc::new(FakeTelemetry::with_matches(10));
        let inference = Arc::new(FakeInference::scripted(vec![
            Ok("I cannot answer that".to_string()),
        ]));
        let (orch, _) = build(telemetry, inference);

        let (job_id, _) = run_to_end(&orch, 10).await;
        let result = orch.snapshot(job_id).unwrap().result.unwrap();
        assert_eq!(result.insight_source, InsightSource::Heuristic);
        assert!(!result.insight.is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_inference_outage_falls_back_without_retry() {
        let telemetry = Arc::new(FakeTelemetry::with_matches(10));
        let inference = Arc::new(FakeInference::scripted(vec![Err(
            InferenceError::Transport("cannot connect".to_string()),
        )]));
        let (orch, _) = build(telemetry, Arc::clone(&inference));

        let (job_id, _) = run_to_end(&orch, 10).await;
        let result = orch.snapshot(job_id).unwrap().result.unwrap();
        assert_eq!(result.insight_source, InsightSource::Heuristic);
        assert_eq!(inference.calls(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_profile_failure_is_annotated() {
        let fake = FakeTelemetry {
            fail_profile: true,
            ..FakeTelemetry::with_matches(10)
        };
        let (orch, _) = build(Arc::new(fake), Arc::new(FakeInference::default()));

        let (job_id, events) = run_to_end(&orch, 10).await;
        assert_eq!(events.last().unwrap().step, Step::Complete);
        let result = orch.snapshot(job_id).unwrap().result.unwrap();
        assert_eq!(result.rank, "Unranked");
        assert!(result.notes.iter().any(|n| n.starts_with("Profile unavailable")));
    }

    #[tokio::test(start_paused = true)]
    async fn test_profile_is_cached_between_jobs() {
        let telemetry = Arc::new(FakeTelemetry::with_matches(10));
        let (orch, _) = build(Arc::clone(&telemetry), Arc::new(FakeInference::default()));

        run_to_end(&orch, 10).await;
        run_to_end(&orch, 10).await;

        assert_eq!(
            telemetry
                .profile_calls
                .load(std::sync::atomic::Ordering::SeqCst),
            1
        );
        assert_eq!(telemetry.match_calls(), 10);
    }

    #[tokio::test(start_paused = true)]
    async fn test_invalid_request_is_rejected() {
        let (orch, _) = build(
            Arc::new(FakeTelemetry::with_matches(10)),
            Arc::new(FakeInference::default()),
        );
        assert!(matches!(
            orch.start_job(request(5)),
            Err(PipelineError::InvalidRequest(_))
        ));
        assert_eq!(orch.health().await.tracked_jobs, 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_finished_jobs_are_reaped_after_retention() {
        let (orch, _) = build(
            Arc::new(FakeTelemetry::with_matches(10)),
            Arc::new(FakeInference::default()),
        );
        let (job_id, _) = run_to_end(&orch, 10).await;

        // Terminal event replays after the job ends.
        let replay: Vec<ProgressEvent> = orch
            .subscribe(job_id)
            .unwrap()
            .into_stream()
            .collect()
            .await;
        assert_eq!(replay.len(), 1);
        assert_eq!(replay[0].step, Step::Complete);

        assert_eq!(orch.reap_finished(), 0);
        tokio::time::advance(PipelineSettings::default().retention + Duration::from_secs(1)).await;
        assert_eq!(orch.reap_finished(), 1);
        assert!(orch.snapshot(job_id).is_none());
        assert!(orch.subscribe(job_id).is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn test_panicking_job_still_settles() {
        let fake = FakeTelemetry {
            panic_on_discovery: true,
            ..FakeTelemetry::with_matches(10)
        };
        let (orch, _) = build(Arc::new(fake), Arc::new(FakeInference::default()));

        let (job_id, events) = run_to_end(&orch, 10).await;
        assert_well_formed(&events);
        let last = events.last().unwrap();
        assert_eq!(last.step, Step::Error);
        assert_eq!(last.percent, 5);

        let snapshot = orch.snapshot(job_id).unwrap();
        assert_eq!(snapshot.status, JobStatus::Errored);
        assert!(snapshot.finished_at.is_some());
        assert!(snapshot.error.unwrap().contains("unexpectedly"));
        assert_eq!(orch.broker.active_channels(), 0);
        assert_eq!(orch.memo.entry_count(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_unrepresentable_age_bound_lists_everything() {
        let settings = PipelineSettings {
            max_age_days: u32::MAX,
            ..Default::default()
        };
        let (orch, _) = build_with(
            Arc::new(FakeTelemetry::with_matches(10)),
            Arc::new(FakeInference::default()),
            settings,
        );

        let (job_id, events) = run_to_end(&orch, 10).await;
        assert_eq!(events.last().unwrap().step, Step::Complete);
        assert_eq!(orch.snapshot(job_id).unwrap().result.unwrap().records_analyzed, 10);
    }

    #[tokio::test(start_paused = true)]
    async fn test_submit_resolves_riot_id() {
        let telemetry = Arc::new(FakeTelemetry::with_matches(10));
        let (orch, _) = build(telemetry, Arc::new(FakeInference::default()));

        let request = JobRequest {
            record_count: 10,
            ..JobRequest::by_riot_id("Player", "NA1")
        };
        let ticket = orch.submit(request).await.unwrap();
        let _: Vec<ProgressEvent> = orch
            .subscribe(ticket.job_id)
            .unwrap()
            .into_stream()
            .collect()
            .await;

        let snapshot = orch.snapshot(ticket.job_id).unwrap();
        assert_eq!(snapshot.dataset_id, PLAYER);
        assert_eq!(snapshot.result.unwrap().display_name, "Player#NA1");
    }

    #[tokio::test(start_paused = true)]
    async fn test_submit_unknown_riot_id_starts_nothing() {
        let (orch, _) = build(
            Arc::new(FakeTelemetry::with_matches(10)),
            Arc::new(FakeInference::default()),
        );

        let err = orch
            .submit(JobRequest::by_riot_id(UNKNOWN_PLAYER, "NA1"))
            .await
            .unwrap_err();
        assert!(matches!(err, PipelineError::PlayerNotFound(ref id) if id == "Nobody#NA1"));
        assert_eq!(orch.health().await.tracked_jobs, 0);
        assert_eq!(orch.quota.snapshot()[0].used, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_profile_lookup_uses_volatile_cache() {
        let telemetry = Arc::new(FakeTelemetry::with_matches(0));
        let (orch, cache) = build(Arc::clone(&telemetry), Arc::new(FakeInference::default()));

        let first = orch.profile(PLAYER, "Player#NA1").await.unwrap();
        assert!(!first.cached);
        assert_eq!(first.rank_display, "Gold II (45 LP)");
        assert!((first.win_rate - 30.0 / 55.0 * 100.0).abs() < 1e-9);

        let second = orch.profile(PLAYER, "Player#NA1").await.unwrap();
        assert!(second.cached);
        assert_eq!(second.profile, first.profile);
        assert_eq!(
            telemetry
                .profile_calls
                .load(std::sync::atomic::Ordering::SeqCst),
            1
        );
        assert_eq!(cache.profiles.stats().await.total, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_mostly_ranked_history_selects_ranked_only() {
        // First 50 alternate ranked/normal, the rest are ranked.
        let telemetry = Arc::new(FakeTelemetry::with_queues(200, |i| {
            if i < 50 && i % 2 == 1 {
                400
            } else {
                420
            }
        }));
        let (orch, _) = build(Arc::clone(&telemetry), Arc::new(FakeInference::default()));

        let (job_id, events) = run_to_end(&orch, 40).await;
        assert_well_formed(&events);

        let result = orch.snapshot(job_id).unwrap().result.unwrap();
        assert_eq!(result.selection_strategy, "ranked_only");
        assert_eq!(result.records_analyzed, 40);
        // 50 sampled plus two scan chunks of 10.
        assert_eq!(telemetry.match_calls(), 70);
        assert_eq!(result.cache_hits, 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_half_ranked_history_prioritises_ranked() {
        let telemetry = Arc::new(FakeTelemetry::with_queues(100, |i| {
            if i < 50 && i % 2 == 0 {
                420
            } else {
                400
            }
        }));
        let (orch, _) = build(Arc::clone(&telemetry), Arc::new(FakeInference::default()));

        let (job_id, _) = run_to_end(&orch, 60).await;
        let result = orch.snapshot(job_id).unwrap().result.unwrap();
        assert_eq!(result.selection_strategy, "ranked_priority");
        assert_eq!(result.records_analyzed, 60);
        // 25 ranked and 25 normal from the sample, then 10 unsampled.
        assert_eq!(telemetry.match_calls(), 60);
        let fetched = telemetry.fetched();
        assert!(fetched.contains(&"NA1_1059".to_string()));
        assert!(!fetched.contains(&"NA1_1060".to_string()));
    }

    #[tokio::test(start_paused = true)]
    async fn test_casual_history_keeps_most_recent() {
        let telemetry = Arc::new(FakeTelemetry::with_queues(100, |_| 400));
        let (orch, _) = build(Arc::clone(&telemetry), Arc::new(FakeInference::default()));

        let (job_id, _) = run_to_end(&orch, 30).await;
        let result = orch.snapshot(job_id).unwrap().result.unwrap();
        assert_eq!(result.selection_strategy, "most_recent");
        assert_eq!(result.records_analyzed, 30);
        assert_eq!(telemetry.match_calls(), 50);
    }

    #[tokio::test(start_paused = true)]
    async fn test_concurrent_jobs_keep_datasets_apart() {
        const RIVAL: &str = "rival-puuid";
        let mut fake = FakeTelemetry::with_matches(20);
        // The rival shares the player's ten oldest matches.
        let rival_ids: Vec<String> = (10..30).map(|i| format!("NA1_{}", 1000 + i)).collect();
        fake.rosters.insert(RIVAL.to_string(), rival_ids);
        let telemetry = Arc::new(fake);
        let (orch, _) = build(Arc::clone(&telemetry), Arc::new(FakeInference::default()));

        let rival = JobRequest {
            record_count: 20,
            ..JobRequest::new(RIVAL)
        };
        let (player_job, player_events) = {
            let ticket_a = orch.start_job(request(20)).unwrap();
            let ticket_b = orch.start_job(rival).unwrap();
            let stream_a = orch.subscribe(ticket_a.job_id).unwrap().into_stream();
            let stream_b = orch.subscribe(ticket_b.job_id).unwrap().into_stream();
            let (events_a, events_b): (Vec<ProgressEvent>, Vec<ProgressEvent>) =
                tokio::join!(stream_a.collect(), stream_b.collect());
            assert_eq!(events_b.last().unwrap().step, Step::Complete);

            let rival_result = orch.snapshot(ticket_b.job_id).unwrap().result.unwrap();
            assert_eq!(rival_result.player_id, RIVAL);
            assert_eq!(rival_result.records_analyzed, 20);
            let rival_champions: Vec<&str> = rival_result
                .top_champions
                .iter()
                .map(|c| c.name.as_str())
                .collect();
            assert_eq!(rival_champions, vec!["Yasuo"]);
            (ticket_a.job_id, events_a)
        };
        assert_eq!(player_events.last().unwrap().step, Step::Complete);

        let result = orch.snapshot(player_job).unwrap().result.unwrap();
        assert_eq!(result.player_id, PLAYER);
        assert_eq!(result.records_analyzed, 20);
        assert!(result.top_champions.iter().all(|c| c.name != "Yasuo"));

        let fetched = telemetry.fetched();
        let unique: HashSet<&String> = fetched.iter().collect();
        assert_eq!(fetched.len(), 30);
        assert_eq!(unique.len(), 30);
        assert_eq!(orch.memo.entry_count(), 0);
        assert!(orch.in_flight.is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_records_without_player_are_not_counted() {
        let mut fake = FakeTelemetry::with_matches(10);
        fake.without_player = fake.ids.iter().take(2).cloned().collect();
        let (orch, _) = build(Arc::new(fake), Arc::new(FakeInference::default()));

        let (job_id, _) = run_to_end(&orch, 10).await;
        let result = orch.snapshot(job_id).unwrap().result.unwrap();
        assert_eq!(result.records_analyzed, 8);
        assert_eq!(result.records_failed, 0);
        assert!(result
            .notes
            .contains(&"2 matches did not include this player and were skipped".to_string()));
        assert!(result.notes.contains(&"matches analyzed: 8 of 10 requested".to_string()));
    }

    #[tokio::test(start_paused = true)]
    async fn test_no_record_with_player_is_terminal_error() {
        let mut fake = FakeTelemetry::with_matches(10);
        fake.without_player = fake.ids.iter().cloned().collect();
        let inference = Arc::new(FakeInference::default());
        let (orch, _) = build(Arc::new(fake), Arc::clone(&inference));

        let (job_id, events) = run_to_end(&orch, 10).await;
        assert_well_formed(&events);
        let last = events.last().unwrap();
        assert_eq!(last.step, Step::Error);
        assert_eq!(last.percent, 65);
        assert_eq!(orch.snapshot(job_id).unwrap().status, JobStatus::Errored);
        assert_eq!(inference.calls(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_snapshot_and_health_report_progress() {
        let (orch, _) = build(
            Arc::new(FakeTelemetry::with_matches(10)),
            Arc::new(FakeInference::default()),
        );
        let (job_id, _) = run_to_end(&orch, 10).await;

        let progress = orch.snapshot(job_id).unwrap().progress.unwrap();
        assert_eq!(progress.step, Step::Complete);
        assert_eq!(progress.percent, 100);

        let health = orch.health().await;
        assert_eq!(health.memo_entries, 0);
        assert_eq!(health.memo_computations, 4);
        assert_eq!(health.active_jobs, 0);
        assert_eq!(health.tracked_jobs, 1);
    }
}
