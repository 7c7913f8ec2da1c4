use clap::{ArgAction, Parser, Subcommand, ValueEnum};
use serde::Serialize;
use std::process::ExitCode;
use tether_ir::NullNavigationPolicy;
use tether_runtime::config::IN_MEMORY_URL;
use tether_runtime::entities::sample_model;
use tether_runtime::harness::{Harness, Outcome, Scenario, UpdateResult, UpdateVariant, VerificationFailure};
use tether_runtime::persistence::SchemaManager;
use tether_runtime::{Result, StoreConfig};
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(name = "tether")]
#[command(about = "Parent/child foreign-key update scenarios over SQLite")]
struct Cli {
    /// More log output (-v debug, -vv trace). Without it RUST_LOG applies.
    #[arg(short, long, action = ArgAction::Count, global = true)]
    verbose: u8,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run update scenarios against fresh stores and verify the rows left behind
    Run {
        /// mapper, manual, mapper-with-navigation or manual-with-navigation; all when omitted
        #[arg(long)]
        variant: Option<UpdateVariant>,
        /// Child key the parent is repointed to
        #[arg(long, default_value_t = 2)]
        target_key: i64,
        #[arg(long, value_enum, default_value_t = Policy::KeepForeignKey)]
        policy: Policy,
        #[arg(long, env = "TETHER_DATABASE_URL", default_value = IN_MEMORY_URL)]
        database_url: String,
        /// Print outcomes as JSON
        #[arg(long)]
        json: bool,
    },
    /// Print the DDL of the parent/child model
    Schema,
}

#[derive(Clone, Copy, ValueEnum)]
enum Policy {
    KeepForeignKey,
    Reject,
}

impl From<Policy> for NullNavigationPolicy {
    fn from(policy: Policy) -> Self {
        match policy {
            Policy::KeepForeignKey => NullNavigationPolicy::KeepForeignKey,
            Policy::Reject => NullNavigationPolicy::Reject,
        }
    }
}

#[derive(Serialize)]
struct Report<'a> {
    #[serde(flatten)]
    outcome: &'a Outcome,
    verified: bool,
    failures: Vec<VerificationFailure>,
}

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();
    init_tracing(cli.verbose);

    match execute(cli.command).await {
        Ok(code) => code,
        Err(e) => {
            eprintln!("❌ Error: {}", e);
            ExitCode::FAILURE
        }
    }
}

fn init_tracing(verbose: u8) {
    let filter = match verbose {
        0 => EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn")),
        1 => EnvFilter::new("debug"),
        _ => EnvFilter::new("trace"),
    };
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();
}

async fn execute(command: Commands) -> Result<ExitCode> {
    match command {
        Commands::Run {
            variant,
            target_key,
            policy,
            database_url,
            json,
        } => {
            let harness = Harness::with_config(StoreConfig::default().with_url(database_url), policy.into());
            let scenarios = match variant {
                Some(variant) => vec![Scenario::new(variant, target_key)],
                None => Scenario::all(target_key),
            };

            tracing::debug!(scenarios = scenarios.len(), policy = ?harness.policy(), "running scenarios");
            let outcomes = harness.run_all(&scenarios).await?;
            let reports: Vec<Report> = outcomes
                .iter()
                .map(|outcome| {
                    let failures = outcome.verify_target().err().unwrap_or_default();
                    Report {
                        outcome,
                        verified: failures.is_empty(),
                        failures,
                    }
                })
                .collect();

            if json {
                println!("{}", serde_json::to_string_pretty(&reports)?);
            } else {
                for report in &reports {
                    print_report(report);
                }
            }

            if reports.iter().all(|r| r.verified) {
                Ok(ExitCode::SUCCESS)
            } else {
                Ok(ExitCode::FAILURE)
            }
        }
        Commands::Schema => {
            let schema = sample_model(NullNavigationPolicy::default())?;
            for entity in schema.dependency_order()? {
                println!("{};", SchemaManager::create_table_sql(entity, &schema)?);
            }
            Ok(ExitCode::SUCCESS)
        }
    }
}

fn print_report(report: &Report) {
    let outcome = report.outcome;
    let observed = &outcome.observed;
    let mark = if report.verified { "✔" } else { "❌" };

    let update = match &outcome.update {
        UpdateResult::Saved(save) => format!(
            "saved ({} inserted, {} updated, {} deleted)",
            save.inserted, save.updated, save.deleted
        ),
        UpdateResult::Rejected { reason } => format!("rejected: {}", reason),
    };

    println!(
        "{} {} -> child {}: {}; parents {}, children {}, child_id {}, reloaded child {}",
        mark,
        outcome.scenario.variant,
        outcome.scenario.target_key,
        update,
        observed.parent_count,
        observed.child_count,
        display_key(observed.foreign_key),
        display_key(observed.reloaded_child_id),
    );
    for failure in &report.failures {
        println!("    - {}", failure);
    }
}

fn display_key(key: Option<i64>) -> String {
    key.map(|k| k.to_string()).unwrap_or_else(|| "none".to_string())
}
