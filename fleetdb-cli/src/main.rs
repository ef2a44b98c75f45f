//! fleetdb CLI - run statements against a fleet of Postgres instances
//!
//! Writes issued with `--role` are replicated through the relay to every other
//! instance hosting that role. The process waits for that replication (up to
//! `--wait-ms`) before closing its pools and exiting.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use fleetdb_core::{
    AffectedRoles, DataAccess, DataError, DeliveryReport, FleetConfig, InstanceId,
    KeywordClassifier, Param, PendingWrite, ReplicationObserver, ReplicationTopology,
    StatementClassifier, TracingObserver,
};
use serde_json::json;
use tokio::sync::Notify;
use tracing::{info, warn};

mod env;
mod tracing_setup;

use tracing_setup::{init_tracing, TracingConfig};

#[derive(Parser, Debug)]
#[command(
    name = "fleetdb",
    author,
    version,
    about = "Run SQL against a database fleet with role-based write replication"
)]
struct Cli {
    /// Config file (default: ./fleetdb.toml, then ~/.fleetdb/config.toml)
    #[arg(long, global = true, env = "FLEETDB_CONFIG")]
    config: Option<PathBuf>,

    /// Enable debug logging
    #[arg(long, global = true)]
    debug: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Execute one statement on an instance
    Exec(ExecArgs),
    /// Execute several statements in one transaction
    Tx(TxArgs),
    /// Inspect configuration
    Config {
        #[command(subcommand)]
        command: ConfigCommand,
    },
}

#[derive(Subcommand, Debug)]
enum ConfigCommand {
    /// Report problems that would make calls fail
    Check,
}

#[derive(clap::Args, Debug)]
struct ExecArgs {
    /// Instance the statement runs on
    #[arg(long)]
    instance: String,

    /// Statement text with `$1`-style placeholders
    #[arg(long)]
    sql: String,

    /// Positional parameters as a JSON array
    #[arg(long, default_value = "[]")]
    params: String,

    /// Role whose other instances receive the write (repeatable)
    #[arg(long = "role")]
    roles: Vec<String>,

    /// Maximum time to wait for replication before exiting
    #[arg(long, default_value_t = 5000)]
    wait_ms: u64,
}

#[derive(clap::Args, Debug)]
struct TxArgs {
    /// Instance the transaction runs on
    #[arg(long)]
    instance: String,

    /// Statement to run, in order (repeatable)
    #[arg(long = "sql", required = true)]
    statements: Vec<String>,

    /// Role whose other instances receive the writes (repeatable)
    #[arg(long = "role")]
    roles: Vec<String>,

    /// Maximum time to wait for replication before exiting
    #[arg(long, default_value_t = 5000)]
    wait_ms: u64,
}

/// Logs like [`TracingObserver`] and signals when a fan-out has finished
struct CompletionObserver {
    inner: TracingObserver,
    done: Arc<Notify>,
}

impl ReplicationObserver for CompletionObserver {
    fn delivered(&self, target: &InstanceId, write: &PendingWrite) {
        self.inner.delivered(target, write);
    }

    fn failed(&self, target: &InstanceId, write: &PendingWrite, error: &DataError) {
        self.inner.failed(target, write, error);
    }

    fn completed(&self, report: &DeliveryReport) {
        self.inner.completed(report);
        self.done.notify_one();
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    // Before parsing, so `.env` can supply FLEETDB_CONFIG to clap
    env::load_dotenv();
    let cli = Cli::parse();
    init_tracing(&TracingConfig { debug: cli.debug })?;

    let config = FleetConfig::load(cli.config.as_deref()).context("Failed to load configuration")?;

    match cli.command {
        Commands::Exec(args) => run_exec(&config, args).await,
        Commands::Tx(args) => run_tx(&config, args).await,
        Commands::Config {
            command: ConfigCommand::Check,
        } => run_config_check(&config),
    }
}

fn parse_params(raw: &str) -> Result<Vec<Param>> {
    let value: Param = serde_json::from_str(raw).context("--params is not valid JSON")?;
    match value {
        Param::Array(items) => Ok(items),
        _ => bail!("--params must be a JSON array"),
    }
}

fn affected_roles(roles: &[String]) -> AffectedRoles {
    roles.iter().map(String::as_str).collect()
}

/// Whether a fan-out will be dispatched for these statements
fn expects_replication(
    config: &FleetConfig,
    origin: &InstanceId,
    roles: &AffectedRoles,
    statements: &[String],
) -> bool {
    let classifier = KeywordClassifier;
    !roles.is_empty()
        && statements.iter().any(|s| !classifier.is_read(s))
        && !config.topology().targets(roles, origin).is_empty()
}

fn connect(config: &FleetConfig, done: &Arc<Notify>) -> Result<DataAccess> {
    let access = DataAccess::from_config(config).context("Failed to initialise data access")?;
    Ok(access.with_replication_observer(Arc::new(CompletionObserver {
        inner: TracingObserver,
        done: Arc::clone(done),
    })))
}

/// Waits for replication if any was started, then closes every pool
async fn finish(access: &DataAccess, done: &Notify, replicating: bool, wait: Duration) {
    if replicating && tokio::time::timeout(wait, done.notified()).await.is_err() {
        warn!(
            wait_ms = wait.as_millis() as u64,
            "replication still running at exit"
        );
    }

    let report = access.shutdown().await;
    info!(
        closed = report.closed,
        failed = report.failures.len(),
        "shutdown complete"
    );
}

async fn run_exec(config: &FleetConfig, args: ExecArgs) -> Result<()> {
    let params = parse_params(&args.params)?;
    let origin = InstanceId::from(args.instance);
    let roles = affected_roles(&args.roles);
    let done = Arc::new(Notify::new());
    let access = connect(config, &done)?;

    let outcome = access
        .execute(&origin, &args.sql, &params, Some(&roles))
        .await;
    let replicating = outcome.is_ok()
        && expects_replication(config, &origin, &roles, std::slice::from_ref(&args.sql));
    finish(&access, &done, replicating, Duration::from_millis(args.wait_ms)).await;

    let result = outcome.context("Statement failed")?;
    println!("{}", serde_json::to_string_pretty(&result)?);
    Ok(())
}

async fn run_tx(config: &FleetConfig, args: TxArgs) -> Result<()> {
    let origin = InstanceId::from(args.instance);
    let roles = affected_roles(&args.roles);
    let done = Arc::new(Notify::new());
    let access = connect(config, &done)?;

    let statements = args.statements.clone();
    let outcome = access
        .run_transaction(&origin, Some(&roles), move |tx| {
            Box::pin(async move {
                let mut results = Vec::with_capacity(statements.len());
                for statement in &statements {
                    results.push(tx.query(statement, &[]).await?);
                }
                Ok::<_, DataError>(results)
            })
        })
        .await;
    let replicating =
        outcome.is_ok() && expects_replication(config, &origin, &roles, &args.statements);
    finish(&access, &done, replicating, Duration::from_millis(args.wait_ms)).await;

    let results = outcome.context("Transaction rolled back")?;
    println!("{}", serde_json::to_string_pretty(&results)?);
    Ok(())
}

fn run_config_check(config: &FleetConfig) -> Result<()> {
    let problems = config.validate();
    let summary = json!({
        "instances": config.instances.keys().collect::<Vec<_>>(),
        "roles": config.roles,
        "problems": problems,
    });
    println!("{}", serde_json::to_string_pretty(&summary)?);

    if !problems.is_empty() {
        bail!("configuration has {} problem(s)", problems.len());
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_params() {
        assert_eq!(parse_params("[1, \"a\", null]").unwrap(), vec![json!(1), json!("a"), Param::Null]);
        assert!(parse_params("{\"a\": 1}").is_err());
        assert!(parse_params("not json").is_err());
    }

    #[test]
    fn test_expects_replication() {
        let config = FleetConfig::from_toml_str(
            r#"
            [instances]
            A = "postgres://a/db"
            B = "postgres://b/db"

            [roles]
            Tutor = ["A", "B"]
            Directivo = ["A"]
            "#,
        )
        .unwrap();
        let origin = InstanceId::from("A");
        let write = vec!["UPDATE t SET x = 1".to_string()];
        let read = vec!["SELECT 1".to_string()];

        assert!(expects_replication(&config, &origin, &affected_roles(&["Tutor".into()]), &write));
        assert!(!expects_replication(&config, &origin, &affected_roles(&["Tutor".into()]), &read));
        assert!(!expects_replication(&config, &origin, &affected_roles(&["Directivo".into()]), &write));
        assert!(!expects_replication(&config, &origin, &affected_roles(&[]), &write));
    }
}
