use crate::archive::{AnchorPublisher, ArchiveStore, JobStateStore, RawArchive};
use crate::fetch::{FetchClient, FetchConfig};
use crate::graph::MemoryGraph;
use crate::jobs::{DatasetConfig, IngestJobs};
use crate::reconcile::ReconcileEngine;
use anyhow::Result;
use chrono::NaiveDate;
use clap::{Args, Parser, Subcommand, ValueEnum};
use serde_json::{json, Value};
use std::fs;
use std::path::PathBuf;
use std::time::Duration;
use tracing::info;

#[derive(Parser, Debug)]
#[command(name = "legisarc")]
#[command(about = "Legislative ingestion, archival and reconciliation CLI")]
pub struct Cli {
    #[command(subcommand)]
    command: RootCommand,

    #[arg(long, default_value = ".legisarc")]
    state_dir: PathBuf,

    #[arg(long, default_value = "legisarc.db")]
    db: PathBuf,

    #[arg(long, default_value = crate::endpoints::DEFAULT_BASE_URL)]
    base_url: String,

    #[arg(long, default_value_t = 2.0)]
    max_rps: f64,

    #[arg(long, value_enum, default_value_t = AnchorMode::Composite)]
    anchor: AnchorMode,

    #[arg(long, default_value = "anchors.json")]
    anchor_log: PathBuf,

    #[command(flatten)]
    datasets: DatasetArgs,
}

#[derive(ValueEnum, Clone, Copy, Debug)]
enum AnchorMode {
    File,
    Relational,
    Placeholder,
    Composite,
}

impl AnchorMode {
    fn publisher(self, log_path: PathBuf, store: ArchiveStore) -> AnchorPublisher {
        match self {
            Self::File => AnchorPublisher::File { log_path },
            Self::Relational => AnchorPublisher::Relational { store },
            Self::Placeholder => AnchorPublisher::Placeholder,
            Self::Composite => AnchorPublisher::Composite { log_path, store },
        }
    }
}

/// Bulk dataset URL templates used to back-fill windows the live API
/// could not serve; `{year}` is substituted per covered year.
#[derive(Args, Debug)]
struct DatasetArgs {
    #[arg(long = "bills-dataset")]
    bills_dataset: Option<String>,

    #[arg(long = "votes-dataset")]
    votes_dataset: Option<String>,

    #[arg(long = "votes-nominal-dataset")]
    votes_nominal_dataset: Option<String>,

    #[arg(long = "expenses-dataset")]
    expenses_dataset: Option<String>,

    #[arg(long = "expenses-csv-delimiter", default_value_t = ',')]
    expenses_csv_delimiter: char,
}

impl DatasetArgs {
    fn into_config(self) -> DatasetConfig {
        DatasetConfig {
            bills_url_template: self.bills_dataset,
            votes_url_template: self.votes_dataset,
            votes_nominal_url_template: self.votes_nominal_dataset,
            expenses_url_template: self.expenses_dataset,
            expenses_csv_delimiter: u8::try_from(self.expenses_csv_delimiter).ok(),
        }
    }
}

#[derive(Subcommand, Debug)]
enum RootCommand {
    /// Archive and upsert every current legislator.
    IngestLegislators {
        #[arg(long = "max-pages")]
        max_pages: Option<u32>,
    },
    /// Bills presented since a date, in bounded windows.
    IngestBills {
        #[arg(long)]
        from: NaiveDate,
        #[arg(long)]
        to: Option<NaiveDate>,
        #[arg(long = "max-pages")]
        max_pages: Option<u32>,
    },
    /// Vote events and nominal rolls since a date.
    IngestVotes {
        #[arg(long)]
        from: NaiveDate,
        #[arg(long)]
        to: Option<NaiveDate>,
        #[arg(long = "legislator", value_delimiter = ',')]
        legislators: Vec<i64>,
        #[arg(long = "max-pages")]
        max_pages: Option<u32>,
    },
    /// Expense filings per legislator and year since a date.
    IngestExpenses {
        #[arg(long)]
        from: NaiveDate,
        #[arg(long)]
        to: Option<NaiveDate>,
        #[arg(long = "legislator", value_delimiter = ',')]
        legislators: Vec<i64>,
    },
    /// Legislators, then bills, votes and expenses from one date.
    IngestAll {
        #[arg(long)]
        from: NaiveDate,
        #[arg(long)]
        to: Option<NaiveDate>,
    },
    /// Sampled end-to-end pipeline health check.
    Smoke {
        #[arg(long, default_value_t = 5)]
        sample: usize,
    },
    /// Audit archive, graph and job state; persist and print the report.
    Reconcile {
        #[arg(long = "base-year")]
        base_year: Option<i32>,
    },
    /// List every job's cursor and status.
    JobState,
}

pub fn run() -> Result<()> {
    let cli = Cli::parse();
    fs::create_dir_all(&cli.state_dir)?;

    let db_path = if cli.db.is_absolute() {
        cli.db.clone()
    } else {
        cli.state_dir.join(&cli.db)
    };
    let log_path = if cli.anchor_log.is_absolute() {
        cli.anchor_log.clone()
    } else {
        cli.state_dir.join(&cli.anchor_log)
    };

    info!(db = %db_path.display(), "opening archive store");
    let store = ArchiveStore::open(&db_path)?;
    let job_store = JobStateStore::new(store.clone());
    let publisher = cli.anchor.publisher(log_path, store.clone());
    let archive = RawArchive::new(store.clone(), publisher);
    let client = FetchClient::new(FetchConfig {
        base_url: cli.base_url,
        max_rps: cli.max_rps,
        timeout: Duration::from_secs(30),
        ..FetchConfig::default()
    })?;
    let graph = MemoryGraph::default();
    let jobs = IngestJobs::new(
        client.clone(),
        archive,
        job_store.clone(),
        graph.clone(),
        cli.datasets.into_config(),
    );

    let output = match cli.command {
        RootCommand::IngestLegislators { max_pages } => jobs.ingest_legislators(max_pages)?,
        RootCommand::IngestBills {
            from,
            to,
            max_pages,
        } => jobs.ingest_bills_since(from, to, max_pages)?,
        RootCommand::IngestVotes {
            from,
            to,
            legislators,
            max_pages,
        } => jobs.ingest_votes_since(from, to, &legislators, max_pages)?,
        RootCommand::IngestExpenses {
            from,
            to,
            legislators,
        } => jobs.ingest_expenses_since(from, to, &legislators)?,
        RootCommand::IngestAll { from, to } => json!({
            "legislators": jobs.ingest_legislators(None)?,
            "bills": jobs.ingest_bills_since(from, to, None)?,
            "votes": jobs.ingest_votes_since(from, to, &[], None)?,
            "expenses": jobs.ingest_expenses_since(from, to, &[])?,
        }),
        RootCommand::Smoke { sample } => {
            let mut summary = jobs.smoke(sample)?;
            let report = ReconcileEngine::new(store, job_store, graph, client).run()?;
            summary["reconcile"] = serde_json::to_value(report)?;
            summary
        }
        RootCommand::Reconcile { base_year } => {
            let mut engine = ReconcileEngine::new(store, job_store, graph, client);
            if let Some(base_year) = base_year {
                engine = engine.with_base_year(base_year);
            }
            serde_json::to_value(engine.run()?)?
        }
        RootCommand::JobState => {
            let states: Vec<Value> = job_store
                .list()?
                .into_iter()
                .map(|state| {
                    json!({
                        "job_name": state.job_name,
                        "status": state.status.as_str(),
                        "updated_at": state.updated_at,
                        "cursor": state.cursor,
                    })
                })
                .collect();
            Value::Array(states)
        }
    };

    println!("{}", serde_json::to_string_pretty(&output)?);
    Ok(())
}
