use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Context;
use chrono::{DateTime, NaiveDate, Utc};
use clap::{Parser, Subcommand};
use sqlx::postgres::PgPoolOptions;
use tracing::info;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};
use uuid::Uuid;

mod config;
mod cycle;
mod db;
mod error;
mod events;
mod ingest;
mod models;
mod publisher;
mod queries;
mod ranking;
mod report;
mod scarcity;
mod scheduler;
mod scoring;
mod store;

use config::EngineConfig;
use db::PgStore;
use models::{Scope, ScopeKey, NATIONAL_SCOPE_ID};
use store::{EventLog, MemoryStore};

#[derive(Parser)]
#[command(name = "layersrank")]
#[command(about = "Leaderboard ranking and opportunity scarcity engine for LayersRank", long_about = None)]
struct Cli {
    /// Engine configuration file (TOML)
    #[arg(long, global = true, env = "LAYERSRANK_CONFIG")]
    config: Option<PathBuf>,
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Create or upgrade the database schema
    InitDb,
    /// Load realistic seed data
    Seed,
    /// Import student profiles from a CSV file
    ImportStudents {
        #[arg(long)]
        csv: PathBuf,
    },
    /// Import opportunities from a CSV file
    ImportOpportunities {
        #[arg(long)]
        csv: PathBuf,
    },
    /// Append events from a CSV file; rows already imported are skipped
    ImportEvents {
        #[arg(long)]
        csv: PathBuf,
    },
    /// Recompute and publish every leaderboard for one period
    RankCycle {
        /// Any day inside the period; defaults to the last closed period
        #[arg(long)]
        period: Option<NaiveDate>,
    },
    /// Recompute and publish scarcity for every opportunity
    ScarcityCycle,
    /// Run both cycles on their configured cadence until ctrl-c
    Schedule,
    /// Show one student's published rank
    Rank {
        #[arg(long, value_enum)]
        scope: Scope,
        #[arg(long, default_value = NATIONAL_SCOPE_ID)]
        scope_id: String,
        #[arg(long)]
        student: Uuid,
    },
    /// Show the per-dimension breakdown behind a student's composite score
    Score {
        #[arg(long)]
        student: Uuid,
    },
    /// Show a page of a published leaderboard
    Leaderboard {
        #[arg(long, value_enum)]
        scope: Scope,
        #[arg(long, default_value = NATIONAL_SCOPE_ID)]
        scope_id: String,
        #[arg(long, default_value_t = 10)]
        limit: usize,
        #[arg(long, default_value_t = 0)]
        offset: usize,
    },
    /// Show published scarcity for an opportunity as JSON
    Scarcity {
        #[arg(long)]
        opportunity: Uuid,
        /// Viewer's college, for the from-your-college count
        #[arg(long)]
        college: Option<String>,
    },
    /// Generate a markdown leaderboard report
    Report {
        #[arg(long, value_enum)]
        scope: Scope,
        #[arg(long, default_value = NATIONAL_SCOPE_ID)]
        scope_id: String,
        #[arg(long, default_value_t = 10)]
        top: usize,
        #[arg(long, default_value = "report.md")]
        out: PathBuf,
    },
    /// Run both cycles in memory from CSV files, without a database
    Simulate {
        #[arg(long)]
        students: PathBuf,
        #[arg(long)]
        opportunities: PathBuf,
        #[arg(long)]
        events: PathBuf,
        /// Any day inside the period to rank
        #[arg(long)]
        period: NaiveDate,
        /// Instant the scarcity snapshot is taken; defaults to now
        #[arg(long)]
        now: Option<DateTime<Utc>>,
    },
}

fn print_entries(entries: &[models::RankEntry]) {
    for entry in entries {
        println!(
            "#{:<4} {} score {:.2} percentile {:.1} ({})",
            entry.rank, entry.student_id, entry.composite_score, entry.percentile, entry.movement
        );
    }
}

async fn connect() -> anyhow::Result<PgStore> {
    let database_url = std::env::var("DATABASE_URL")
        .context("DATABASE_URL must be set to a production Postgres instance")?;

    let pool = PgPoolOptions::new()
        .max_connections(5)
        .connect(&database_url)
        .await
        .context("failed to connect to Postgres")?;
    Ok(PgStore::new(pool))
}

async fn simulate(
    config: Arc<EngineConfig>,
    students: PathBuf,
    opportunities: PathBuf,
    events: PathBuf,
    period: NaiveDate,
    now: DateTime<Utc>,
) -> anyhow::Result<()> {
    let store = Arc::new(MemoryStore::new());
    for profile in ingest::read_students(ingest::open(&students)?)? {
        store.upsert_student(profile)?;
    }
    for opportunity in ingest::read_opportunities(ingest::open(&opportunities)?)? {
        store.upsert_opportunity(opportunity)?;
    }
    for ingested in ingest::read_events(ingest::open(&events)?)? {
        store.append_event(ingested.event)?;
    }

    let summary = cycle::run_rank_cycle(Arc::clone(&store), Arc::clone(&config), period).await?;
    for (scope, reason) in &summary.failed {
        println!("{scope} failed: {reason}");
    }
    cycle::run_scarcity_cycle(Arc::clone(&store), &config, now).await?;

    let national = queries::get_leaderboard(store.as_ref(), Scope::National, NATIONAL_SCOPE_ID, 10, 0)
        .await?;
    println!(
        "Ranked {} scopes; national top {}:",
        summary.published.len(),
        national.len()
    );
    print_entries(&national);

    for opportunity in store.opportunities().await? {
        let view = queries::get_scarcity(store.as_ref(), opportunity.opportunity_id, None).await?;
        if let Some(view) = view {
            println!("{}", serde_json::to_string(&view.snapshot)?);
        }
    }
    Ok(())
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "layersrank=info".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    let cli = Cli::parse();
    let config = Arc::new(EngineConfig::load(cli.config.as_deref())?);

    match cli.command {
        Commands::Simulate {
            students,
            opportunities,
            events,
            period,
            now,
        } => {
            simulate(
                config,
                students,
                opportunities,
                events,
                period,
                now.unwrap_or_else(Utc::now),
            )
            .await
        }
        command => run(command, Arc::new(connect().await?), config).await,
    }
}

async fn run(command: Commands, store: Arc<PgStore>, config: Arc<EngineConfig>) -> anyhow::Result<()> {
    match command {
        Commands::InitDb => {
            db::init_db(store.pool()).await?;
            println!("Schema ready.");
        }
        Commands::Seed => {
            db::seed(&store).await?;
            println!("Seed data inserted.");
        }
        Commands::ImportStudents { csv } => {
            let students = ingest::read_students(ingest::open(&csv)?)?;
            let upserted = store.upsert_students(&students).await?;
            println!("Upserted {upserted} students from {}.", csv.display());
        }
        Commands::ImportOpportunities { csv } => {
            let opportunities = ingest::read_opportunities(ingest::open(&csv)?)?;
            let upserted = store.upsert_opportunities(&opportunities).await?;
            println!("Upserted {upserted} opportunities from {}.", csv.display());
        }
        Commands::ImportEvents { csv } => {
            let events = ingest::read_events(ingest::open(&csv)?)?;
            let inserted = store.insert_events(&events).await?;
            println!(
                "Inserted {inserted} of {} events from {}.",
                events.len(),
                csv.display()
            );
        }
        Commands::RankCycle { period } => {
            let period = period.unwrap_or_else(|| {
                cycle::last_closed_period(Utc::now().date_naive(), config.rank_cadence)
            });
            let summary = cycle::run_rank_cycle(Arc::clone(&store), config, period).await?;
            println!("Published {} leaderboards.", summary.published.len());
            for (scope, reason) in &summary.failed {
                println!("- {scope} failed: {reason}");
            }
            if !summary.is_clean() {
                anyhow::bail!("{} leaderboards failed to publish", summary.failed.len());
            }
        }
        Commands::ScarcityCycle => {
            let pointer = cycle::run_scarcity_cycle(store, &config, Utc::now()).await?;
            println!(
                "Scarcity published for {} at {}.",
                pointer.current_period, pointer.published_at
            );
        }
        Commands::Schedule => {
            info!("starting scheduler");
            scheduler::run_schedule(store, config).await?;
        }
        Commands::Rank {
            scope,
            scope_id,
            student,
        } => match queries::get_rank(store.as_ref(), scope, &scope_id, student).await? {
            Some(entry) => print_entries(&[entry]),
            None => println!("{student} is not ranked in {scope}/{scope_id}."),
        },
        Commands::Score { student } => match queries::get_score(store.as_ref(), student).await? {
            Some(record) => {
                println!(
                    "{} composite {:.2} (latest attempt {}, as of {})",
                    record.student_id, record.composite_score, record.completed_at, record.as_of
                );
                for (dimension, weight) in &record.weights_used {
                    if let Some(score) = record.dimension(*dimension) {
                        println!(
                            "- {}: mean {:.2} x weight {:.3}, confidence {:.2} over {} attempts",
                            dimension.as_str(),
                            score.mean,
                            weight,
                            score.confidence,
                            score.attempts
                        );
                    }
                }
            }
            None => println!("No published score for {student}."),
        },
        Commands::Leaderboard {
            scope,
            scope_id,
            limit,
            offset,
        } => {
            let entries =
                queries::get_leaderboard(store.as_ref(), scope, &scope_id, limit, offset).await?;
            if entries.is_empty() {
                println!("No published leaderboard for {scope}/{scope_id}.");
                return Ok(());
            }
            print_entries(&entries);
        }
        Commands::Scarcity {
            opportunity,
            college,
        } => match queries::get_scarcity(store.as_ref(), opportunity, college.as_deref()).await? {
            Some(view) => println!("{}", serde_json::to_string_pretty(&view)?),
            None => println!("No published scarcity for {opportunity}."),
        },
        Commands::Report {
            scope,
            scope_id,
            top,
            out,
        } => {
            let key = ScopeKey::new(scope, scope_id);
            let published_at = queries::last_updated(store.as_ref(), &key.pointer_key()).await?;
            let entries = queries::get_leaderboard(
                store.as_ref(),
                scope,
                &key.scope_id,
                queries::MAX_LEADERBOARD_PAGE,
                0,
            )
            .await?;
            let report = report::build_report(&key, published_at, &entries, top);
            std::fs::write(&out, report)?;
            println!("Report written to {}.", out.display());
        }
        Commands::Simulate { .. } => anyhow::bail!("simulate runs without a database"),
    }

    Ok(())
}
