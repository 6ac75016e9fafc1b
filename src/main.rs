//! CLI entry point for the transfer tool.

use std::io::{self, IsTerminal};
use std::process::ExitCode;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::Parser;
use tracing::{debug, error, info, warn};
use transfer_core::{
    FileSink, FileSource, HttpTransferApi, ObjectTarget, TaskState, TransferEngine,
    TransferOutcome, TransferRequest, TransferTask,
};

mod cli;
mod config;
mod progress_ui;

use cli::{Args, Command};

/// How the process ends.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum ProcessExit {
    Success,
    Failure,
    Interrupted,
}

impl ProcessExit {
    fn code(self) -> u8 {
        match self {
            Self::Success => 0,
            Self::Failure => 1,
            Self::Interrupted => 130,
        }
    }
}

#[tokio::main]
async fn main() -> ExitCode {
    // Parse CLI arguments first (before tracing, so --help works without logs)
    let args = Args::parse();

    // Priority: RUST_LOG env var > quiet flag > verbose flag > default (info)
    let default_level = if args.quiet {
        "error"
    } else {
        match args.verbose {
            0 => "info",
            1 => "debug",
            _ => "trace",
        }
    };

    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(default_level));

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(io::stderr)
        .init();

    debug!(?args, "CLI arguments parsed");

    match run(args).await {
        Ok(exit) => ExitCode::from(exit.code()),
        Err(e) => {
            error!("{e:#}");
            ExitCode::from(ProcessExit::Failure.code())
        }
    }
}

async fn run(args: Args) -> Result<ProcessExit> {
    let loaded = config::load_config(args.config.as_deref())?;
    let settings = config::resolve_settings(&args, &loaded, config::access_token_from_env())?;

    let api = HttpTransferApi::new(settings.api).context("Failed to set up the HTTP client")?;
    let engine = TransferEngine::new(Arc::new(api), settings.engine)?;

    let (request, label) = build_request(args.command);
    let task = engine.start(request);
    info!(task_id = %task.id(), "transfer started");

    let show_bar = !args.quiet && io::stderr().is_terminal();
    let bar = progress_ui::spawn_progress_bar(show_bar, &task, label);

    let exit = tokio::select! {
        result = task.wait() => report(&task, result),
        signal = tokio::signal::ctrl_c() => {
            if let Err(e) = signal {
                warn!(error = %e, "failed to listen for interrupt");
            }
            interrupt(&task).await
        }
    };

    if let Some(handle) = bar {
        handle.abort();
    }
    Ok(exit)
}

fn build_request(command: Command) -> (TransferRequest, String) {
    match command {
        Command::Upload {
            local,
            remote,
            scope,
            overwrite,
            metadata,
            resume_key,
        } => {
            let target = with_scope(ObjectTarget::new(remote), scope);
            let label = format!("upload {target}");
            let mut request =
                TransferRequest::upload(target, FileSource::new(local)).overwrite(overwrite);
            for (key, value) in metadata {
                request = request.with_metadata(key, value);
            }
            if let Some(key) = resume_key {
                request = request.resume_with_key(key);
            }
            (request, label)
        }
        Command::Download {
            remote,
            local,
            scope,
            range,
        } => {
            let target = with_scope(ObjectTarget::new(remote), scope);
            let label = format!("download {target}");
            let mut request = TransferRequest::download(target, FileSink::new(local));
            if let Some(range) = range {
                request = request.with_range(range);
            }
            (request, label)
        }
    }
}

fn with_scope(target: ObjectTarget, scope: Option<String>) -> ObjectTarget {
    match scope {
        Some(scope) => target.in_scope(scope),
        None => target,
    }
}

fn report(task: &TransferTask, result: transfer_core::transfer::TaskResult) -> ProcessExit {
    match result {
        Ok(TransferOutcome::Uploaded { object, bytes, quick }) => {
            info!(object = %object.object_id, bytes, quick, "upload complete");
            println!("{}", object.object_id);
            ProcessExit::Success
        }
        Ok(TransferOutcome::Downloaded { bytes, .. }) => {
            info!(bytes, "download complete");
            ProcessExit::Success
        }
        Err(e) if e.is_canceled() => {
            warn!(task_id = %task.id(), "transfer canceled");
            ProcessExit::Interrupted
        }
        Err(e) => {
            error!(task_id = %task.id(), error = %e, "transfer failed");
            ProcessExit::Failure
        }
    }
}

/// Stops the task on Ctrl-C.
///
/// Uploads are paused rather than canceled so the session survives; its
/// confirmation key is printed for `--resume-key`.
async fn interrupt(task: &TransferTask) -> ProcessExit {
    warn!("interrupt received, stopping transfer");
    if task.pause().is_err() {
        task.cancel();
        return match task.wait().await {
            Err(e) if e.is_canceled() => ProcessExit::Interrupted,
            result => report(task, result),
        };
    }

    let mut state = task.watch_state();
    let settled = state
        .wait_for(|s| *s == TaskState::Paused || s.is_terminal())
        .await
        .map(|s| *s);
    if !matches!(settled, Ok(TaskState::Paused)) {
        // Finished before the pause took effect.
        return report(task, task.wait().await);
    }

    match task.confirmation_key() {
        Some(key) => {
            let done = task.completed_parts().len();
            info!(parts_done = done, "upload paused");
            println!("{key}");
            eprintln!("Upload interrupted. Resume with: --resume-key {key}");
        }
        None => info!("upload stopped before a session was created"),
    }
    ProcessExit::Interrupted
}
