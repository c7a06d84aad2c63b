//! # proplens
//!
//! Command-line client: submits property-analysis jobs and prints each
//! realtime update as a JSON line until the job finishes.

#![deny(unsafe_code)]

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result, anyhow, bail};
use clap::{Args, Parser, Subcommand};
use proplens_core::{JobInput, JobRecord, Priority};
use proplens_jobs::{GraphqlJobApi, JobCompletion, JobMonitor, JobStore, StoreChange};
use proplens_realtime::{Credential, RealtimeClient, RealtimeConfig};
use proplens_settings::ProplensSettings;
use proplens_settings::loader::{load_settings, load_settings_from_path};
use serde_json::Value;
use tokio::sync::broadcast;
use tokio::sync::broadcast::error::RecvError;
use tracing::{info, warn};

/// Property analysis job client.
#[derive(Parser, Debug)]
#[command(name = "proplens", about = "Submit property analysis jobs and follow them live", version)]
struct Cli {
    #[command(flatten)]
    auth: AuthArgs,

    /// Settings file (defaults to `$PROPLENS_SETTINGS`, then `~/.proplens/settings.json`).
    #[arg(long, global = true, value_name = "FILE")]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Args, Debug, Default)]
struct AuthArgs {
    /// Bearer token.
    #[arg(long, env = "PROPLENS_TOKEN", hide_env_values = true, global = true)]
    token: Option<String>,

    /// API key. Used only when no token is given.
    #[arg(long, env = "PROPLENS_API_KEY", hide_env_values = true, global = true)]
    api_key: Option<String>,
}

impl AuthArgs {
    fn credential(&self) -> Option<Credential> {
        let present = |value: &Option<String>| {
            value
                .as_deref()
                .map(str::trim)
                .filter(|v| !v.is_empty())
                .map(str::to_string)
        };
        present(&self.token)
            .map(Credential::Token)
            .or_else(|| present(&self.api_key).map(Credential::ApiKey))
    }
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Submit a job and follow it until it finishes.
    Submit {
        /// Free-text analysis request.
        request: String,

        /// low, medium or high.
        #[arg(long, default_value = "medium")]
        priority: Priority,

        /// Property the request is about.
        #[arg(long)]
        property: Option<String>,

        /// JSON object passed through with the job.
        #[arg(long, value_parser = parse_json)]
        metadata: Option<Value>,

        /// Print the created job and exit without following it.
        #[arg(long)]
        detach: bool,
    },
    /// Follow an existing job until it finishes.
    Watch {
        /// Job id returned by `submit`.
        job_id: String,
    },
    /// Print the effective settings.
    Settings,
}

fn parse_json(raw: &str) -> Result<Value, String> {
    serde_json::from_str(raw).map_err(|e| format!("invalid JSON: {e}"))
}

fn print_record(record: &JobRecord) -> Result<()> {
    println!("{}", serde_json::to_string(record)?);
    Ok(())
}

/// Monitor wired to the live API.
struct Session {
    client: RealtimeClient,
    monitor: JobMonitor,
}

impl Session {
    fn open(settings: &ProplensSettings, credential: Option<Credential>) -> Result<Self> {
        let api = GraphqlJobApi::from_settings(settings).context("invalid GraphQL endpoint")?;
        let config = RealtimeConfig::from_settings(settings).context("invalid realtime endpoint")?;
        let client = RealtimeClient::new(config, credential);
        let monitor = JobMonitor::new(
            settings.monitor.clone(),
            Arc::new(api),
            Arc::new(client.clone()),
            Arc::new(JobStore::new()),
        );
        Ok(Self { client, monitor })
    }

    /// Print updates for `job_id` until `completion` resolves.
    async fn follow(
        &self,
        job_id: &str,
        mut changes: broadcast::Receiver<StoreChange>,
        completion: JobCompletion,
    ) -> Result<JobRecord> {
        let outcome = completion.wait();
        tokio::pin!(outcome);
        loop {
            tokio::select! {
                result = &mut outcome => {
                    return result.map_err(|err| anyhow!("[{}] {}", err.code, err.message));
                }
                change = changes.recv() => match change {
                    Ok(StoreChange::HistoryAppended { job_id: id, record }) if id == job_id => {
                        print_record(&record)?;
                    }
                    Ok(_) => {}
                    Err(RecvError::Lagged(skipped)) => warn!(skipped, "missed job updates"),
                    Err(RecvError::Closed) => {
                        return (&mut outcome)
                            .await
                            .map_err(|err| anyhow!("[{}] {}", err.code, err.message));
                    }
                },
                _ = tokio::signal::ctrl_c() => {
                    self.monitor.shutdown();
                    bail!("interrupted");
                }
            }
        }
    }

    fn close(&self) {
        self.monitor.shutdown();
        self.client.disconnect();
    }
}

async fn submit(
    settings: &ProplensSettings,
    credential: Option<Credential>,
    input: JobInput,
    detach: bool,
) -> Result<()> {
    let session = Session::open(settings, credential.clone())?;
    let changes = session.monitor.store().changes();
    let ticket = session
        .monitor
        .submit_job(input, credential)
        .await
        .map_err(|err| anyhow!("[{}] {err}", err.code()))?;
    print_record(&ticket.record)?;

    if detach {
        session.close();
        return Ok(());
    }
    let job_id = ticket.record.id.clone();
    let outcome = session.follow(&job_id, changes, ticket.completion).await;
    session.close();
    let record = outcome.with_context(|| format!("job {job_id} did not complete"))?;
    info!(job_id = %record.id, status = %record.status, "job finished");
    Ok(())
}

async fn watch(
    settings: &ProplensSettings,
    credential: Option<Credential>,
    job_id: &str,
) -> Result<()> {
    if credential.is_none() {
        bail!("a token or API key is required to watch jobs");
    }
    let session = Session::open(settings, credential)?;
    let changes = session.monitor.store().changes();
    let completion = session.monitor.watch_job(job_id, None);
    let outcome = session.follow(job_id, changes, completion).await;
    session.close();
    let record = outcome.with_context(|| format!("job {job_id} did not complete"))?;
    info!(job_id = %record.id, status = %record.status, "job finished");
    Ok(())
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let settings = match &cli.config {
        Some(path) => load_settings_from_path(path),
        None => load_settings(),
    }
    .context("failed to load settings")?;

    if settings.logging.json {
        proplens_core::logging::init_json_subscriber(&settings.logging.level);
    } else {
        proplens_core::logging::init_subscriber(&settings.logging.level);
    }

    let credential = cli.auth.credential();
    match cli.command {
        Command::Settings => {
            println!("{}", serde_json::to_string_pretty(&settings)?);
            Ok(())
        }
        Command::Submit {
            request,
            priority,
            property,
            metadata,
            detach,
        } => {
            let mut input = JobInput::new(request).with_priority(priority);
            input.property_id = property;
            input.metadata = metadata;
            submit(&settings, credential, input, detach).await
        }
        Command::Watch { job_id } => watch(&settings, credential, &job_id).await,
    }
}
