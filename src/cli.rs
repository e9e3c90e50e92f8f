// Detection Summary CLI binary

use std::path::PathBuf;
use std::time::Duration;

use anyhow::Result;
use chrono::Utc;
use clap::{Parser, Subcommand};

use detection_summary_lib::config::StoreConfig;
use detection_summary_lib::paths::resolve_state_path;
use detection_summary_lib::scoring::ranking::rank_best_to_worst;
use detection_summary_lib::scoring::{ScoreFailure, ScoreFn, ScoreOutcome, ScoreResult};
use detection_summary_lib::selection::{adaptive_select_and_score, SelectionParams};
use detection_summary_lib::{ResultRecord, ResultStore, SummaryError, WindowQuery};

#[derive(Parser)]
#[command(name = "dsummary")]
#[command(about = "Inspect detection summary results and dry-run frame selection", long_about = None)]
#[command(version)]
struct Cli {
    /// Store document (defaults to $DETECTION_SUMMARY_STATE_PATH, then ~/.detection-summary/store.json)
    #[arg(long, global = true)]
    state: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// List records for an episode key, newest first
    List {
        #[arg(short, long)]
        key: String,
        #[arg(long, default_value = "20")]
        limit: usize,
    },

    /// Best record published in the last N seconds
    Best {
        #[arg(short, long)]
        key: String,
        #[arg(long, default_value = "600")]
        since_secs: i64,
        #[arg(long)]
        include_consumed: bool,
        #[arg(long)]
        max_age_secs: Option<f64>,
    },

    /// Show one record by session id
    Get {
        #[arg(short, long)]
        key: String,
        #[arg(short, long)]
        session: String,
        /// Wait up to this many seconds for the record to appear
        #[arg(long)]
        wait_secs: Option<f64>,
        #[arg(long)]
        include_consumed: bool,
    },

    /// Mark a record consumed
    Consume {
        #[arg(short, long)]
        key: String,
        #[arg(short, long)]
        session: String,
    },

    /// Drop records older than the retention window
    Cleanup {
        #[arg(long, default_value = "24")]
        retention_hours: f64,
    },

    /// Run the selection engine offline over a JSON array of per-frame scores
    Select {
        /// File holding [{"person_score": .., "face_score": .., ...} | null, ...]
        #[arg(long)]
        scores: PathBuf,
        #[arg(long, default_value = "10")]
        budget: usize,
        #[arg(long, default_value = "dry-run")]
        seed: String,
        #[arg(long, default_value = "1.0")]
        no_people_threshold: f64,
    },
}

fn main() -> Result<()> {
    env_logger::Builder::from_default_env()
        .filter_level(log::LevelFilter::Info)
        .init();

    let cli = Cli::parse();
    let state = cli.state;

    match cli.command {
        Commands::List { key, limit } => cmd_list(state, &key, limit),
        Commands::Best {
            key,
            since_secs,
            include_consumed,
            max_age_secs,
        } => cmd_best(state, &key, since_secs, include_consumed, max_age_secs),
        Commands::Get {
            key,
            session,
            wait_secs,
            include_consumed,
        } => cmd_get(state, &key, &session, wait_secs, include_consumed),
        Commands::Consume { key, session } => cmd_consume(state, &key, &session),
        Commands::Cleanup { retention_hours } => cmd_cleanup(state, retention_hours),
        Commands::Select {
            scores,
            budget,
            seed,
            no_people_threshold,
        } => cmd_select(scores, budget, &seed, no_people_threshold),
    }
}

fn open_store(state: Option<PathBuf>) -> Result<ResultStore> {
    let path = resolve_state_path(state.as_deref());
    Ok(ResultStore::open(StoreConfig::new(path))?)
}

fn not_found(key: &str, session: &str) -> anyhow::Error {
    SummaryError::NotFound(format!("session {} under '{}'", session, key)).into()
}

fn print_record(record: &ResultRecord) -> Result<()> {
    println!("{}", serde_json::to_string_pretty(record)?);
    Ok(())
}

fn cmd_list(state: Option<PathBuf>, key: &str, limit: usize) -> Result<()> {
    let store = open_store(state)?;
    let records = store.list(key, Some(limit));

    if records.is_empty() {
        println!("No records for '{}'.", key);
        return Ok(());
    }

    println!("{:<36}  {:<20}  {:>6}  {:>5}  {:<8}  {}", "Session", "Created", "Score", "Best", "Consumed", "Summary");
    println!("{}", "-".repeat(100));
    for r in records {
        let summary: String = r.best.summary.chars().take(40).collect();
        println!(
            "{:<36}  {:<20}  {:>6.2}  {:>5}  {:<8}  {}",
            r.session_id,
            r.created_at.format("%Y-%m-%d %H:%M:%S"),
            r.score(),
            r.best_index,
            if r.consumed { "yes" } else { "no" },
            summary
        );
    }
    Ok(())
}

fn cmd_best(
    state: Option<PathBuf>,
    key: &str,
    since_secs: i64,
    include_consumed: bool,
    max_age_secs: Option<f64>,
) -> Result<()> {
    let store = open_store(state)?;
    let now = Utc::now();
    let query = WindowQuery::new(now - chrono::Duration::seconds(since_secs.max(0)), now)
        .include_consumed(include_consumed)
        .max_age_secs(max_age_secs);

    match store.get_best_in_window(key, &query) {
        Some(record) => print_record(&record),
        None => {
            println!("No eligible record for '{}' in the last {}s.", key, since_secs);
            Ok(())
        }
    }
}

fn cmd_get(
    state: Option<PathBuf>,
    key: &str,
    session: &str,
    wait_secs: Option<f64>,
    include_consumed: bool,
) -> Result<()> {
    let store = open_store(state)?;
    let found = match wait_secs {
        Some(secs) => {
            let timeout = Duration::try_from_secs_f64(secs.max(0.0)).unwrap_or(Duration::MAX);
            store.wait_for_id(key, session, include_consumed, timeout)
        }
        None => store.get_by_id(key, session, include_consumed),
    };

    match found {
        Some(record) => print_record(&record),
        None => Err(not_found(key, session)),
    }
}

fn cmd_consume(state: Option<PathBuf>, key: &str, session: &str) -> Result<()> {
    let store = open_store(state)?;
    if store.mark_consumed(key, session)? {
        println!("Marked {} consumed.", session);
        Ok(())
    } else {
        Err(not_found(key, session))
    }
}

fn cmd_cleanup(state: Option<PathBuf>, retention_hours: f64) -> Result<()> {
    let store = open_store(state)?;
    let removed = store.cleanup(retention_hours)?;
    println!("Removed {} records older than {}h.", removed, retention_hours);
    Ok(())
}

fn cmd_select(scores_path: PathBuf, budget: usize, seed: &str, no_people_threshold: f64) -> Result<()> {
    let raw = std::fs::read_to_string(&scores_path)
        .map_err(|e| anyhow::anyhow!("Cannot read {}: {}", scores_path.display(), e))?;
    // null entries act as frames the oracle failed on
    let frames: Vec<Option<ScoreResult>> = serde_json::from_str(&raw)?;

    let params = SelectionParams::new(frames.len(), budget, seed)?.with_no_people_threshold(no_people_threshold);
    let scorer = ScoreFn(|i: usize| -> ScoreOutcome {
        match frames.get(i) {
            Some(Some(res)) => Ok(res.clone()),
            Some(None) => Err(ScoreFailure::Provider("no score in input".to_string())),
            None => Err(ScoreFailure::MissingFrame),
        }
    });

    let selection = adaptive_select_and_score(&params, &scorer);
    let ranked = rank_best_to_worst(&selection.scored);

    println!("Frames:   {}", frames.len());
    println!("Budget:   {}", selection.meta.budget);
    println!("Probes:   {:?}", selection.meta.probe_order);
    println!("Scored:   {:?}", selection.meta.scored_indices);
    println!("Cutoff:   {}", selection.meta.cutoff_index_inclusive);
    println!("Best:     {}{}", selection.meta.best_index, if selection.meta.placeholder { " (placeholder)" } else { "" });
    println!();
    println!("{:>5}  {:>7}  {:>6}  {:>6}  {:<10}  {}", "Index", "Person", "Face", "Frame", "Pose", "Summary");
    for idx in ranked {
        if let Some(r) = selection.scored.get(&idx) {
            println!(
                "{:>5}  {:>7.2}  {:>6.2}  {:>6.2}  {:<10}  {}",
                idx, r.person_score, r.face_score, r.frame_score, r.pose, r.summary
            );
        }
    }
    Ok(())
}
