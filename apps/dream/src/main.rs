mod config;
mod render;

use std::{collections::HashMap, io, path::PathBuf};

use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use client_core::{run_job, status, DreamClient, Form, FormController, JobOutcome, JobTracker};
use futures::StreamExt;
use shared::{
    domain::{FieldKind, JobId},
    protocol::{INIT_IMAGE_FIELD, PROMPT_FIELD, SEED_FIELD},
};
use storage::{NewResult, Storage};
use tokio::task::JoinHandle;
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

use crate::{
    config::{load_settings, normalize_database_url, Settings},
    render::TerminalRenderer,
};

#[derive(Parser, Debug)]
#[command(name = "dream", about = "Terminal client for a streaming image-generation server")]
struct Args {
    /// Overrides `server_url` from dream.toml and the environment.
    #[arg(long, global = true)]
    server_url: Option<String>,
    /// Overrides `database_url` from dream.toml and the environment.
    #[arg(long, global = true)]
    database_url: Option<String>,
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Submit the saved form and stream the job's progress.
    Generate {
        #[arg(long)]
        prompt: Option<String>,
        /// Field override, repeatable: `--set steps=30`.
        #[arg(long = "set", value_name = "NAME=VALUE", value_parser = parse_assignment)]
        set: Vec<(String, String)>,
        #[arg(long)]
        init_image: Option<PathBuf>,
        /// Do not persist the overrides.
        #[arg(long)]
        no_save: bool,
    },
    /// Print the saved form.
    Fields,
    /// Edit and persist form fields.
    Set {
        #[arg(required = true, value_name = "NAME=VALUE", value_parser = parse_assignment)]
        assignments: Vec<(String, String)>,
    },
    /// Clear saved fields, keeping the prompt.
    Reset,
    /// Set the seed back to random.
    ResetSeed,
    /// Cancel a job by id. Without `--job` this sends `GET /cancel` and the
    /// server decides what to stop.
    Cancel {
        #[arg(long)]
        job: Option<String>,
    },
    /// Print server status once, or keep polling.
    Status {
        #[arg(long)]
        watch: bool,
    },
    /// List recent results, newest first.
    History {
        #[arg(long, default_value_t = 10)]
        limit: u32,
    },
    /// Load a past result's settings (and seed) back into the form.
    Recall { job_id: String },
}

fn parse_assignment(raw: &str) -> Result<(String, String), String> {
    let (name, value) = raw
        .split_once('=')
        .ok_or_else(|| format!("expected NAME=VALUE, got '{raw}'"))?;
    let name = name.trim();
    if name.is_empty() {
        return Err(format!("missing field name in '{raw}'"));
    }
    Ok((name.to_string(), value.to_string()))
}

fn init_tracing() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(io::stderr)
        .init();
}

#[tokio::main]
async fn main() -> Result<()> {
    init_tracing();
    let args = Args::parse();

    let mut settings = load_settings()?;
    if let Some(v) = args.server_url {
        settings.server_url = v;
    }
    if let Some(v) = args.database_url {
        settings.database_url = v;
    }

    match args.command {
        Command::Status { watch } => show_status(&settings, watch).await,
        Command::Cancel { job } => cancel(&settings, job.map(JobId::new)).await,
        command => {
            let database_url = normalize_database_url(&settings.database_url);
            let storage = Storage::new(&database_url)
                .await
                .with_context(|| format!("failed to open local state at {database_url}"))?;
            let controller = FormController::new(storage);
            let mut form = Form::generate();
            controller.load(&mut form).await?;
            run_form_command(&settings, &controller, &mut form, command).await
        }
    }
}

async fn run_form_command(
    settings: &Settings,
    controller: &FormController<Storage>,
    form: &mut Form,
    command: Command,
) -> Result<()> {
    match command {
        Command::Generate {
            prompt,
            set,
            init_image,
            no_save,
        } => {
            if let Some(prompt) = prompt {
                form.set(PROMPT_FIELD, &prompt)?;
            }
            for (name, value) in &set {
                form.set(name, value)?;
            }
            if let Some(path) = init_image {
                form.set(INIT_IMAGE_FIELD, &path.to_string_lossy())?;
            }
            if !no_save {
                controller.save(form).await?;
            }
            generate(settings, controller.store(), form).await
        }
        Command::Fields => {
            let stored: HashMap<String, String> =
                controller.store().fields().await?.into_iter().collect();
            for line in field_origins(form, &stored) {
                println!("{line}");
            }
            Ok(())
        }
        Command::Set { assignments } => {
            for (name, value) in &assignments {
                controller.update(form, name, value).await?;
            }
            print_fields(form);
            Ok(())
        }
        Command::Reset => {
            controller.clear(form).await?;
            print_fields(form);
            Ok(())
        }
        Command::ResetSeed => {
            controller.reset_seed(form).await?;
            println!("seed = {}", form.value(SEED_FIELD).unwrap_or_default());
            Ok(())
        }
        Command::History { limit } => {
            let results = controller.store().recent_results(limit).await?;
            if results.is_empty() {
                println!("No results yet.");
            }
            for result in results {
                println!(
                    "{}  {}  {} | {}  {}",
                    result.created_at.format("%Y-%m-%d %H:%M:%S"),
                    result.job_id,
                    result.seed,
                    result.prompt,
                    result.image_path
                );
            }
            Ok(())
        }
        Command::Recall { job_id } => {
            recall(controller, form, &JobId::new(job_id)).await?;
            print_fields(form);
            Ok(())
        }
        Command::Status { .. } | Command::Cancel { .. } => Ok(()),
    }
}

/// Loads a stored result's settings and seed back into the form and persists them.
async fn recall(controller: &FormController<Storage>, form: &mut Form, job_id: &JobId) -> Result<()> {
    let Some(result) = controller.store().result_for_job(job_id).await? else {
        bail!("no stored result for job {job_id}");
    };
    controller
        .apply_result(form, result.seed, &result.config)
        .await
}

/// One line per field, marking whether the value came from the saved snapshot.
fn field_origins(form: &Form, stored: &HashMap<String, String>) -> Vec<String> {
    form.fields()
        .map(|field| {
            let origin = match field.kind() {
                FieldKind::File => "not saved",
                _ if stored.contains_key(field.name()) => "saved",
                _ => "default",
            };
            format!("{} = {} ({origin})", field.name(), field.value())
        })
        .collect()
}

fn print_fields(form: &Form) {
    for field in form.fields() {
        match field.kind() {
            FieldKind::File => println!("{} = {} (not saved)", field.name(), field.value()),
            _ => println!("{} = {}", field.name(), field.value()),
        }
    }
}

async fn generate(settings: &Settings, storage: &Storage, form: &mut Form) -> Result<()> {
    let client = DreamClient::new(&settings.server_url)?;
    let tracker = JobTracker::new();
    let interrupt = spawn_interrupt_handler(client.clone(), tracker.clone());

    let mut renderer = TerminalRenderer::new(io::stdout(), client.base_url().clone());
    let outcome = run_job(&client, form, &tracker, &mut renderer).await;
    interrupt.abort();
    let outcome = outcome?;

    record_results(storage, &outcome).await;

    if let Some(alert) = outcome.alert {
        bail!("{alert}");
    }
    Ok(())
}

/// First Ctrl-C cancels the tracked job and lets the stream drain; a second
/// one exits immediately.
fn spawn_interrupt_handler(client: DreamClient, tracker: JobTracker) -> JoinHandle<()> {
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_err() {
            return;
        }
        let job_id = tracker.current();
        info!(job_id = ?job_id, "interrupt: canceling job");
        let _ = client.cancel(job_id);

        if tokio::signal::ctrl_c().await.is_ok() {
            warn!("interrupt: exiting without waiting for the server");
            std::process::exit(130);
        }
    })
}

async fn record_results(storage: &Storage, outcome: &JobOutcome) {
    // Oldest first so history ids follow arrival order.
    for thumb in outcome.view.results.iter().rev() {
        let Some(job_id) = thumb.job_id.clone() else {
            continue;
        };
        let result = NewResult {
            job_id,
            seed: thumb.seed,
            prompt: thumb.prompt().to_string(),
            image_path: thumb.image_path.clone(),
            config: thumb.config.clone(),
        };
        if let Err(err) = storage.record_result(&result).await {
            error!(error = %err, job_id = %result.job_id, "history: failed to record result");
        }
    }
}

async fn show_status(settings: &Settings, watch: bool) -> Result<()> {
    let client = DreamClient::new(&settings.server_url)?;
    if !watch {
        let report = client.status().await?;
        println!("{}", status::render_status(&report));
        return Ok(());
    }

    let mut updates = status::status_updates(client, settings.status_poll_interval());
    loop {
        tokio::select! {
            line = updates.next() => match line {
                Some(line) => println!("{line}"),
                None => return Ok(()),
            },
            _ = tokio::signal::ctrl_c() => return Ok(()),
        }
    }
}

async fn cancel(settings: &Settings, job_id: Option<JobId>) -> Result<()> {
    let client = DreamClient::new(&settings.server_url)?;
    match client.request_cancel(job_id.as_ref()).await {
        Ok(response) => println!("cancel: {}", response.status),
        Err(err) => error!(job_id = ?job_id, error = %err, "cancel request failed"),
    }
    Ok(())
}

#[cfg(test)]
#[path = "tests/main_tests.rs"]
mod tests;
