//! Markdown and JSON reports for a finished analysis.

use anyhow::{Context, Result};
use serde::Serialize;
use std::io::Write;
use std::path::Path;

use crate::cli::OutputFormat;
use crate::models::{AnalysisResult, ChampionStat, Highlight, InsightSource};

/// Details about the run that produced a result.
#[derive(Debug, Clone, Serialize)]
pub struct RunMetadata {
    pub model_used: String,
    pub duration_seconds: f64,
}

#[derive(Serialize)]
struct JsonReport<'a> {
    metadata: &'a RunMetadata,
    result: &'a AnalysisResult,
}

/// Generate a complete Markdown report.
pub fn generate_markdown_report(result: &AnalysisResult, run: &RunMetadata) -> String {
    let mut output = String::new();

    output.push_str(&format!("# Rewind: {}\n\n", result.display_name));
    output.push_str(&generate_metadata_section(result, run));

    if !result.insight.is_empty() {
        output.push_str(&generate_insight_section(result));
    }
    if !result.highlights.is_empty() {
        output.push_str(&generate_highlights_section(&result.highlights));
    }
    if !result.top_champions.is_empty() {
        output.push_str(&generate_champions_section(&result.top_champions));
    }
    if !result.notes.is_empty() {
        output.push_str(&generate_notes_section(&result.notes));
    }

    output.push_str(&generate_footer());
    output
}

fn generate_metadata_section(result: &AnalysisResult, run: &RunMetadata) -> String {
    let mut section = String::new();

    section.push_str("## Overview\n\n");
    section.push_str(&format!("- **Player:** {}\n", result.display_name));
    section.push_str(&format!("- **Rank:** {}\n", result.rank));
    section.push_str(&format!("- **Main Role:** {}\n", result.main_role));
    section.push_str(&format!(
        "- **Matches Analyzed:** {} of {} requested\n",
        result.records_analyzed, result.records_requested
    ));
    if result.records_failed > 0 {
        section.push_str(&format!(
            "- **Matches Failed:** {}\n",
            result.records_failed
        ));
    }
    if result.records_analyzed > 0 {
        section.push_str(&format!("- **Served From Cache:** {}\n", result.cache_hits));
    }
    section.push_str(&format!(
        "- **Generated:** {}\n",
        result.generated_at.format("%Y-%m-%d %H:%M:%S UTC")
    ));
    let source = match result.insight_source {
        InsightSource::Model => format!("`{}`", run.model_used),
        InsightSource::Heuristic => "heuristic fallback".to_string(),
        InsightSource::None => "none".to_string(),
    };
    section.push_str(&format!("- **Insight Source:** {}\n", source));
    section.push_str(&format!(
        "- **Duration:** {:.1}s\n\n",
        run.duration_seconds
    ));

    section
}

fn generate_insight_section(result: &AnalysisResult) -> String {
    let mut section = String::from("## Season Story\n\n");
    if !result.personality.is_empty() {
        section.push_str(&format!("**{}**\n\n", result.personality));
    }
    section.push_str(&result.insight);
    section.push_str("\n\n");
    section
}

fn generate_highlights_section(highlights: &[Highlight]) -> String {
    let mut section = String::from("## Highlights\n\n");
    for highlight in highlights {
        section.push_str(&format!("- **{}:** {}\n", highlight.stat, highlight.value));
    }
    section.push('\n');
    section
}

fn generate_champions_section(champions: &[ChampionStat]) -> String {
    let mut section = String::from("## Top Champions\n\n");
    section.push_str("| Champion | Games | Win Rate | KDA | Role |\n");
    section.push_str("|----------|-------|----------|-----|------|\n");
    for champ in champions {
        section.push_str(&format!(
            "| {} | {} | {:.1}% | {:.2} | {} |\n",
            champ.name, champ.games, champ.win_rate, champ.avg_kda, champ.primary_role
        ));
    }
    section.push('\n');
    section
}

fn generate_notes_section(notes: &[String]) -> String {
    let mut section = String::from("## Notes\n\n");
    for note in notes {
        section.push_str(&format!("- {}\n", note));
    }
    section.push('\n');
    section
}

fn generate_footer() -> String {
    format!(
        "---\n\n*Report generated by rewind v{}*\n",
        env!("CARGO_PKG_VERSION")
    )
}

/// Generate a JSON report.
pub fn generate_json_report(result: &AnalysisResult, run: &RunMetadata) -> Result<String> {
    serde_json::to_string_pretty(&JsonReport {
        metadata: run,
        result,
    })
    .map_err(Into::into)
}

/// Render in the requested format and write to `path`.
pub fn write_report(
    result: &AnalysisResult,
    run: &RunMetadata,
    format: OutputFormat,
    path: &Path,
) -> Result<()> {
    let content = match format {
        OutputFormat::Markdown => generate_markdown_report(result, run),
        OutputFormat::Json => generate_json_report(result, run)?,
    };

    let mut file = std::fs::File::create(path)
        .with_context(|| format!("Failed to create report file: {}", path.display()))?;
    file.write_all(content.as_bytes())
        .with_context(|| format!("Failed to write report to {}", path.display()))?;

    Ok(())
}
