//! Aggregate statistics over a player's match history.
//!
//! Everything here is a pure function of the fetched records, so the
//! orchestrator can memoize each summary per job.

use crate::models::{
    role_display, ChampionPool, ChampionStat, Highlight, Insight, MatchDetail, PerformanceTrends,
    PlayerGame, Playstyle, PlaystyleScores, RoleStat, TrendDelta, RANKED_QUEUES,
};
use std::collections::{BTreeMap, HashMap};

/// Minimum games before first-half vs second-half trends are reported.
pub const TREND_MIN_GAMES: usize = 40;

const TOP_CHAMPIONS: usize = 10;

/// Extract the player's own stats from each record, oldest first.
/// Records the player does not appear in are skipped.
pub fn player_games(records: &[MatchDetail], puuid: &str) -> Vec<PlayerGame> {
    let mut games: Vec<PlayerGame> = records
        .iter()
        .filter_map(|record| {
            let p = record.participant(puuid)?;
            let minutes = (record.info.game_duration as f64 / 60.0).max(1.0);
            let cs = (p.total_minions_killed + p.neutral_minions_killed) as f64;

            Some(PlayerGame {
                timestamp: record.info.game_creation,
                champion: p.champion_name.clone(),
                role: p.team_position.clone(),
                win: p.win,
                minutes,
                queue_id: record.info.queue_id,
                kills: p.kills,
                deaths: p.deaths,
                assists: p.assists,
                kda: (p.kills + p.assists) as f64 / p.deaths.max(1) as f64,
                solo_kills: p.challenges.solo_kills,
                multikills: p.double_kills + p.triple_kills + p.quadra_kills + p.penta_kills,
                penta_kills: p.penta_kills,
                damage_per_min: p.total_damage_dealt_to_champions as f64 / minutes,
                team_damage_pct: p.challenges.team_damage_percentage * 100.0,
                gold_per_min: p.challenges.gold_per_minute,
                cs_per_min: cs / minutes,
                vision_per_min: p.challenges.vision_score_per_minute,
            })
        })
        .collect();

    games.sort_by_key(|g| g.timestamp);
    games
}

fn mean<F>(games: &[PlayerGame], f: F) -> f64
where
    F: Fn(&PlayerGame) -> f64,
{
    if games.is_empty() {
        return 0.0;
    }
    games.iter().map(f).sum::<f64>() / games.len() as f64
}

fn win_rate(games: &[PlayerGame]) -> f64 {
    if games.is_empty() {
        return 0.0;
    }
    games.iter().filter(|g| g.win).count() as f64 / games.len() as f64 * 100.0
}

/// Most frequent value, ties broken alphabetically.
fn most_common<'a>(values: impl Iterator<Item = &'a str>) -> Option<String> {
    let mut counts: BTreeMap<&str, usize> = BTreeMap::new();
    for value in values {
        *counts.entry(value).or_insert(0) += 1;
    }

    let mut best: Option<(&str, usize)> = None;
    for (value, count) in counts {
        if best.map_or(true, |(_, c)| count > c) {
            best = Some((value, count));
        }
    }
    best.map(|(value, _)| value.to_string())
}

pub fn performance_trends(games: &[PlayerGame]) -> PerformanceTrends {
    let total_games = games.len();
    if total_games == 0 {
        return PerformanceTrends::default();
    }

    let trend = (total_games >= TREND_MIN_GAMES).then(|| {
        let (first, second) = games.split_at(total_games / 2);
        TrendDelta {
            first_half_win_rate: win_rate(first),
            second_half_win_rate: win_rate(second),
            kda_change: mean(second, |g| g.kda) - mean(first, |g| g.kda),
            cs_change: mean(second, |g| g.cs_per_min) - mean(first, |g| g.cs_per_min),
            vision_change: mean(second, |g| g.vision_per_min) - mean(first, |g| g.vision_per_min),
        }
    });

    let ranked_games = games
        .iter()
        .filter(|g| RANKED_QUEUES.contains(&g.queue_id))
        .count();

    PerformanceTrends {
        total_games,
        overall_win_rate: win_rate(games),
        avg_kda: mean(games, |g| g.kda),
        avg_kills: mean(games, |g| g.kills as f64),
        avg_deaths: mean(games, |g| g.deaths as f64),
        avg_assists: mean(games, |g| g.assists as f64),
        avg_cs_per_min: mean(games, |g| g.cs_per_min),
        avg_vision_per_min: mean(games, |g| g.vision_per_min),
        avg_damage_per_min: mean(games, |g| g.damage_per_min),
        avg_gold_per_min: mean(games, |g| g.gold_per_min),
        total_multikills: games.iter().map(|g| g.multikills).sum(),
        total_penta_kills: games.iter().map(|g| g.penta_kills).sum(),
        best_kda: games.iter().map(|g| g.kda).fold(0.0, f64::max),
        highest_kills: games.iter().map(|g| g.kills).max().unwrap_or(0),
        ranked_games,
        ranked_percentage: ranked_games as f64 / total_games as f64 * 100.0,
        trend,
    }
}

pub fn champion_pool(games: &[PlayerGame]) -> ChampionPool {
    let mut by_champion: HashMap<&str, Vec<&PlayerGame>> = HashMap::new();
    for game in games {
        by_champion.entry(game.champion.as_str()).or_default().push(game);
    }

    let mut top_champions: Vec<ChampionStat> = by_champion
        .iter()
        .map(|(name, played)| {
            let wins = played.iter().filter(|g| g.win).count();
            let role = most_common(played.iter().map(|g| g.role.as_str())).unwrap_or_default();
            ChampionStat {
                name: name.to_string(),
                games: played.len(),
                wins,
                win_rate: wins as f64 / played.len() as f64 * 100.0,
                avg_kda: played.iter().map(|g| g.kda).sum::<f64>() / played.len() as f64,
                primary_role: role_display(&role).to_string(),
            }
        })
        .collect();
    top_champions.sort_by(|a, b| b.games.cmp(&a.games).then_with(|| a.name.cmp(&b.name)));
    top_champions.truncate(TOP_CHAMPIONS);

    let mut role_distribution: BTreeMap<String, RoleStat> = BTreeMap::new();
    for game in games.iter().filter(|g| !g.role.is_empty() && g.role != "NONE") {
        let stat = role_distribution.entry(game.role.clone()).or_default();
        stat.games += 1;
        if game.win {
            stat.wins += 1;
        }
    }
    for stat in role_distribution.values_mut() {
        stat.win_rate = stat.wins as f64 / stat.games as f64 * 100.0;
    }

    let primary_role = role_distribution
        .iter()
        .fold(None::<(&String, usize)>, |best, (role, stat)| match best {
            Some((_, games)) if games >= stat.games => best,
            _ => Some((role, stat.games)),
        })
        .map(|(role, _)| role_display(role).to_string())
        .unwrap_or_else(|| "Unknown".to_string());

    ChampionPool {
        unique_champions: by_champion.len(),
        top_champions,
        role_distribution,
        primary_role,
    }
}

pub fn playstyle(games: &[PlayerGame]) -> Playstyle {
    let scores = PlaystyleScores {
        aggression: (mean(games, |g| g.solo_kills) * 20.0).min(100.0),
        carry_potential: (mean(games, |g| g.team_damage_pct) * 2.0).min(100.0),
        vision_mastery: (mean(games, |g| g.vision_per_min) * 15.0).min(100.0),
        teamfight_prowess: (mean(games, |g| g.multikills as f64) * 25.0).min(100.0),
        overall_kda: mean(games, |g| g.kda),
    };

    let (primary_trait, description) = if scores.aggression > 60.0 {
        ("Duelist", "You thrive in 1v1 outplays and mechanical skill")
    } else if scores.carry_potential > 70.0 {
        ("Carry", "You consistently deal massive damage for your team")
    } else if scores.vision_mastery > 70.0 {
        ("Vision Master", "Your map awareness and vision control are exceptional")
    } else if scores.teamfight_prowess > 60.0 {
        ("Teamfight Monster", "You excel in coordinated 5v5 engagements")
    } else if scores.overall_kda > 4.0 {
        ("Consistent Performer", "Reliable and steady across all games")
    } else {
        ("Adaptive Player", "Flexible playstyle that adjusts to team needs")
    };

    Playstyle {
        primary_trait: primary_trait.to_string(),
        description: description.to_string(),
        scores,
    }
}

/// Insight built from the aggregates alone, used when the model reply is
/// unusable.
pub fn heuristic_insight(perf: &PerformanceTrends, style: &Playstyle) -> Insight {
    let mut highlights = Vec::new();

    if perf.avg_kda >= 3.0 {
        highlights.push(Highlight {
            stat: "Strong KDA".to_string(),
            value: format!("{:.1}", perf.avg_kda),
        });
    }
    if perf.overall_win_rate >= 50.0 {
        highlights.push(Highlight {
            stat: "Positive Win Rate".to_string(),
            value: format!("{:.0}%", perf.overall_win_rate),
        });
    }
    if perf.avg_cs_per_min >= 6.0 {
        highlights.push(Highlight {
            stat: "Good Farming".to_string(),
            value: format!("{:.1} CS/min", perf.avg_cs_per_min),
        });
    }
    if highlights.len() < 3 {
        highlights.push(Highlight {
            stat: "Games Played".to_string(),
            value: perf.total_games.to_string(),
        });
    }
    if highlights.len() < 3 && perf.highest_kills > 0 {
        highlights.push(Highlight {
            stat: "Most Kills in a Game".to_string(),
            value: perf.highest_kills.to_string(),
        });
    }
    highlights.truncate(3);

    Insight {
        highlights,
        insight: format!(
            "{} with {:.1} KDA across {} games. Focus on consistency and reducing deaths to climb further.",
            style.primary_trait, perf.avg_kda, perf.total_games
        ),
        personality: style.primary_trait.clone(),
    }
}
