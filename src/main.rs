use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Context;
use clap::{ArgGroup, Parser, Subcommand};
use sqlx::postgres::PgPoolOptions;
use uuid::Uuid;

mod aggregate;
mod db;
mod error;
#[cfg(test)]
mod memory;
mod models;
mod progress;
mod rank;
mod report;
mod settings;
mod stats;
mod store;

use models::{Ballot, CohortSettings, Phase, RaterIdentity};
use store::{RatingRepository, RatingStore};

#[derive(Parser)]
#[command(name = "board-eval")]
#[command(about = "Board evaluation score aggregation and candidate ranking", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Create or upgrade the database schema
    InitDb,
    /// Load a sample cohort with candidates, items and ballots
    Seed,
    /// Submit (or replace) one rater's ballot from a JSON file
    #[command(group(
        ArgGroup::new("rater")
            .args(["rater_id", "alias"])
            .multiple(false)
    ))]
    Submit {
        #[arg(long)]
        ballot: PathBuf,
        #[arg(long)]
        rater_id: Option<Uuid>,
        /// Name of a rater from an imported historical sheet
        #[arg(long)]
        alias: Option<String>,
    },
    /// Show cohort settings, or update them when any value is given
    Settings {
        #[arg(long)]
        cohort: Uuid,
        #[arg(long)]
        application_weight: Option<f64>,
        #[arg(long)]
        interview_weight: Option<f64>,
        #[arg(long)]
        character_weight: Option<f64>,
        #[arg(long)]
        outlier_std_devs: Option<f64>,
        #[arg(long)]
        top_n: Option<u32>,
    },
    /// Print the ranked leaderboard
    Leaderboard {
        #[arg(long)]
        cohort: Uuid,
        #[arg(long, default_value_t = 25)]
        limit: usize,
    },
    /// Export the leaderboard as CSV
    Export {
        #[arg(long)]
        cohort: Uuid,
        #[arg(long, default_value = "results.csv")]
        out: PathBuf,
    },
    /// Generate a markdown report
    Report {
        #[arg(long)]
        cohort: Uuid,
        #[arg(long, default_value = "report.md")]
        out: PathBuf,
    },
    /// Per-item scores and outliers for one candidate
    Breakdown {
        #[arg(long)]
        cohort: Uuid,
        #[arg(long)]
        candidate: Uuid,
    },
    /// Ballots submitted per rater and phase
    Progress {
        #[arg(long)]
        cohort: Uuid,
    },
}

fn init_tracing() {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| "info".into()),
        )
        .with_writer(std::io::stderr)
        .init();
}

fn fmt_avg(value: Option<f64>) -> String {
    value.map_or_else(|| "-".to_string(), |v| format!("{:.2}", v))
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    init_tracing();

    let cli = Cli::parse();
    let database_url = std::env::var("DATABASE_URL")
        .context("DATABASE_URL must be set to a Postgres instance")?;

    let pool = PgPoolOptions::new()
        .max_connections(5)
        .connect(&database_url)
        .await
        .context("failed to connect to Postgres")?;

    let repo = Arc::new(db::PgRepository::new(pool));

    match cli.command {
        Commands::InitDb => {
            db::init_db(repo.pool()).await?;
            println!("Schema ready.");
        }
        Commands::Seed => {
            let cohort_id = db::seed(repo.pool()).await?;
            let store = RatingStore::new(Arc::clone(&repo));
            let ballots = db::seed_ballots(&store, cohort_id).await?;
            println!("Seeded cohort {} with {} ballots.", cohort_id, ballots);
        }
        Commands::Submit {
            ballot,
            rater_id,
            alias,
        } => {
            let raw = std::fs::read_to_string(&ballot)
                .with_context(|| format!("failed to read ballot {}", ballot.display()))?;
            let parsed: Ballot = serde_json::from_str(&raw)
                .with_context(|| format!("invalid ballot JSON in {}", ballot.display()))?;
            let rater = rater_id
                .map(RaterIdentity::LiveUser)
                .or(alias.map(RaterIdentity::HistoricalAlias));

            let store = RatingStore::new(Arc::clone(&repo));
            let rating_id = store.submit_ballot(rater.as_ref(), &parsed).await?;
            if parsed.items.is_empty() {
                println!("Recorded abstain for {} (rating {}).", parsed.phase, rating_id);
            } else {
                println!(
                    "Recorded {} {} scores (rating {}).",
                    parsed.items.len(),
                    parsed.phase,
                    rating_id
                );
            }
        }
        Commands::Settings {
            cohort,
            application_weight,
            interview_weight,
            character_weight,
            outlier_std_devs,
            top_n,
        } => {
            let current = settings::resolve_settings(repo.as_ref(), cohort).await?;
            let updated = CohortSettings {
                weights: models::PhaseWeights {
                    application: application_weight.unwrap_or(current.weights.application),
                    interview: interview_weight.unwrap_or(current.weights.interview),
                    character: character_weight.unwrap_or(current.weights.character),
                },
                outlier_std_devs: outlier_std_devs.unwrap_or(current.outlier_std_devs),
                top_n_display: top_n.unwrap_or(current.top_n_display),
            };

            if updated != current {
                settings::save_settings(repo.as_ref(), cohort, &updated).await?;
                println!("Settings saved.");
            }
            println!(
                "Weights: application {:.2}, interview {:.2}, character {:.2}",
                updated.weights.application, updated.weights.interview, updated.weights.character
            );
            println!(
                "Outlier threshold: {} std devs. Highlighting top {}.",
                updated.outlier_std_devs, updated.top_n_display
            );
        }
        Commands::Leaderboard { cohort, limit } => {
            let board = rank::leaderboard(repo.as_ref(), cohort).await?;

            if board.entries.is_empty() {
                println!("No active candidates in this cohort.");
                return Ok(());
            }

            println!("Cohort {} by composite score:", board.cohort_id);
            for entry in board.entries.iter().take(limit) {
                println!(
                    "{:>3}. {}{} app {} / int {} / char {} => {}",
                    entry.rank,
                    entry.candidate.full_name(),
                    if entry.highlighted { " *" } else { "" },
                    fmt_avg(entry.average(Phase::Application)),
                    fmt_avg(entry.average(Phase::Interview)),
                    fmt_avg(entry.average(Phase::Character)),
                    entry
                        .composite
                        .map_or_else(|| "Pending".to_string(), |c| format!("{:.2}", c)),
                );
            }
        }
        Commands::Export { cohort, out } => {
            let board = rank::leaderboard(repo.as_ref(), cohort).await?;
            let file = std::fs::File::create(&out)
                .with_context(|| format!("failed to create {}", out.display()))?;
            report::write_csv(file, &board.entries)?;
            println!("Exported {} candidates to {}.", board.entries.len(), out.display());
        }
        Commands::Report { cohort, out } => {
            let label = repo.cohort_label(cohort).await?;
            let board = rank::leaderboard(repo.as_ref(), cohort).await?;
            let progress = progress::load_progress(repo.as_ref(), cohort).await?;
            let report = report::build_report(&label, &board, &progress);
            std::fs::write(&out, report)?;
            println!("Report written to {}.", out.display());
        }
        Commands::Breakdown { cohort, candidate } => {
            let resolved = settings::resolve_settings(repo.as_ref(), cohort).await?;
            let items = aggregate::item_breakdown(
                repo.as_ref(),
                cohort,
                candidate,
                resolved.outlier_std_devs,
            )
            .await?;
            let details = repo.candidate(cohort, candidate).await?;
            print!("{}", report::build_breakdown(&details.full_name(), &items));
        }
        Commands::Progress { cohort } => {
            let rows = progress::load_progress(repo.as_ref(), cohort).await?;
            if rows.is_empty() {
                println!("No board members assigned to this cohort.");
                return Ok(());
            }
            for row in &rows {
                println!("- {}", report::progress_line(row));
            }
        }
    }

    Ok(())
}
