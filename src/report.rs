use std::fmt::Write;

use serde::Serialize;

use crate::models::{ItemBreakdown, Leaderboard, Phase, RankedCandidate, RaterProgress};

const NOT_AVAILABLE: &str = "N/A";

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ExportRow {
    pub rank: usize,
    pub candidate_number: String,
    pub first_name: String,
    pub last_name: String,
    pub email: String,
    pub application_avg: String,
    pub interview_avg: String,
    pub character_avg: String,
    pub composite: String,
    pub consistency_pct: String,
}

fn fixed2(value: Option<f64>) -> String {
    value.map_or_else(|| NOT_AVAILABLE.to_string(), |v| format!("{:.2}", v))
}

pub fn export_rows(entries: &[RankedCandidate]) -> Vec<ExportRow> {
    entries
        .iter()
        .map(|entry| ExportRow {
            rank: entry.rank,
            candidate_number: entry
                .candidate
                .candidate_number
                .map_or_else(|| entry.candidate.id.to_string(), |n| n.to_string()),
            first_name: entry.candidate.first_name.clone(),
            last_name: entry.candidate.last_name.clone(),
            email: entry.candidate.email.clone().unwrap_or_default(),
            application_avg: fixed2(entry.average(Phase::Application)),
            interview_avg: fixed2(entry.average(Phase::Interview)),
            character_avg: fixed2(entry.average(Phase::Character)),
            composite: fixed2(entry.composite),
            consistency_pct: entry
                .consistency
                .map_or_else(|| NOT_AVAILABLE.to_string(), |c| c.to_string()),
        })
        .collect()
}

pub fn write_csv<W: std::io::Write>(writer: W, entries: &[RankedCandidate]) -> anyhow::Result<()> {
    let mut csv_writer = csv::WriterBuilder::new()
        .quote_style(csv::QuoteStyle::Always)
        .from_writer(writer);
    for row in export_rows(entries) {
        csv_writer.serialize(row)?;
    }
    csv_writer.flush()?;
    Ok(())
}

fn average_cell(value: Option<f64>) -> String {
    value.map_or_else(|| "-".to_string(), |v| format!("{:.2}", v))
}

pub fn build_report(
    cohort_label: &str,
    board: &Leaderboard,
    progress: &[RaterProgress],
) -> String {
    let mut output = String::new();
    let weights = board.settings.weights;

    let _ = writeln!(output, "# Board Evaluation Results");
    let _ = writeln!(output, "Generated for {}", cohort_label);
    let _ = writeln!(
        output,
        "Weights: application {:.0}%, interview {:.0}%, character {:.0}%; outliers beyond {} std devs",
        weights.application * 100.0,
        weights.interview * 100.0,
        weights.character * 100.0,
        board.settings.outlier_std_devs
    );
    let _ = writeln!(output);
    let _ = writeln!(output, "## Leaderboard");

    if board.entries.is_empty() {
        let _ = writeln!(output, "No active candidates in this cohort.");
    } else {
        let _ = writeln!(
            output,
            "| Rank | Candidate | Application | Interview | Character | Composite | Consistency |"
        );
        let _ = writeln!(output, "|---|---|---|---|---|---|---|");
        for entry in board.entries.iter() {
            let marker = if entry.highlighted { " *" } else { "" };
            let flag = if entry.has_outliers() { " (!)" } else { "" };
            let _ = writeln!(
                output,
                "| {}{} | {}{} | {} | {} | {} | {} | {} |",
                entry.rank,
                marker,
                entry.candidate.full_name(),
                flag,
                average_cell(entry.average(Phase::Application)),
                average_cell(entry.average(Phase::Interview)),
                average_cell(entry.average(Phase::Character)),
                entry
                    .composite
                    .map_or_else(|| "Pending".to_string(), |c| format!("{:.2}", c)),
                entry
                    .consistency
                    .map_or_else(|| "-".to_string(), |c| format!("{}%", c)),
            );
        }
        if board.settings.top_n_display > 0 {
            let _ = writeln!(
                output,
                "\n`*` marks the top {} candidates; `(!)` marks candidates with outlier scores.",
                board.settings.top_n_display
            );
        }
    }

    let _ = writeln!(output);
    let _ = writeln!(output, "## Outlier Summary");
    let flagged: Vec<&RankedCandidate> = board.entries.iter().filter(|e| e.has_outliers()).collect();
    if flagged.is_empty() {
        let _ = writeln!(output, "No outlier scores flagged.");
    } else {
        for entry in flagged {
            let parts: Vec<String> = Phase::ALL
                .iter()
                .filter(|p| entry.outlier_count(**p) > 0)
                .map(|p| format!("{} {}", entry.outlier_count(*p), p))
                .collect();
            let _ = writeln!(
                output,
                "- {}: {}",
                entry.candidate.full_name(),
                parts.join(", ")
            );
        }
    }

    let _ = writeln!(output);
    let _ = writeln!(output, "## Rater Progress");
    if progress.is_empty() {
        let _ = writeln!(output, "No board members assigned to this cohort.");
    } else {
        for row in progress {
            let _ = writeln!(output, "- {}", progress_line(row));
        }
    }

    output
}

pub fn progress_line(row: &RaterProgress) -> String {
    let phases: Vec<String> = Phase::ALL
        .iter()
        .map(|phase| format!("{} {}/{}", phase, row.count(*phase), row.candidate_total))
        .collect();
    let mut line = format!("{}: {}", row.name, phases.join(", "));
    if let Some(at) = row.last_activity {
        let _ = write!(line, " (last active {})", at.format("%Y-%m-%d"));
    }
    line
}

pub fn build_breakdown(candidate_label: &str, items: &[ItemBreakdown]) -> String {
    let mut output = String::new();
    let _ = writeln!(output, "# {}", candidate_label);

    if items.is_empty() {
        let _ = writeln!(output, "No scores recorded for this candidate.");
        return output;
    }

    for phase in Phase::ALL {
        let in_phase: Vec<&ItemBreakdown> = items.iter().filter(|i| i.phase == phase).collect();
        if in_phase.is_empty() {
            continue;
        }
        let _ = writeln!(output);
        let _ = writeln!(output, "## {} scores", phase);
        for item in in_phase {
            let scores: Vec<String> = item.scores.iter().map(|s| format!("{}", s)).collect();
            let _ = writeln!(
                output,
                "- {}: adjusted mean {:.2} (raw {:.2}, sd {:.2}) from [{}]",
                item.label,
                item.adjusted_mean,
                item.mean,
                item.std_dev,
                scores.join(", ")
            );
            if !item.outliers.is_empty() {
                let outliers: Vec<String> = item.outliers.iter().map(|s| format!("{}", s)).collect();
                let _ = writeln!(
                    output,
                    "  - {} outlier(s): {}",
                    item.outliers.len(),
                    outliers.join(", ")
                );
            }
            for comment in &item.comments {
                let _ = writeln!(output, "  > {}", comment);
            }
        }
    }

    output
}
