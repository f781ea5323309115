#![cfg(windows)]

use anyhow::{Context, Result};
use clap::Parser;
use std::path::Path;
use std::process::ExitCode;
use std::sync::Arc;
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::{EnvFilter, fmt, prelude::*};
use windows::Win32::Foundation::{BOOL, CloseHandle, ERROR_ALREADY_EXISTS, GetLastError, HANDLE};
use windows::Win32::System::Threading::CreateMutexW;

use hvckpt::action::CheckpointDisableAction;
use hvckpt::autorun;
use hvckpt::cli::{Cli, Command};
use hvckpt::config::{self, MAX_CONCURRENT_ACTIONS, Paths, VM_ID_PROPERTY_INDEX};
use hvckpt::dispatch::ActionDispatcher;
use hvckpt::error::{BootTaskError, LifecycleError};
use hvckpt::eventlog::WindowsEventLog;
use hvckpt::hyperv::HyperVPowerShell;
use hvckpt::privilege;
use hvckpt::state::StateStore;
use hvckpt::subscription::{ProcessSubscriberTable, SubscriptionManager};

/// Host-wide guard so only one process owns the subscription record.
struct SingleInstance(HANDLE);

impl SingleInstance {
    fn acquire() -> Result<Option<Self>> {
        unsafe {
            let handle = CreateMutexW(None, BOOL(0), windows::core::w!("Global\\HvCheckpointGuard"))
                .context("CreateMutexW failed")?;
            if GetLastError() == ERROR_ALREADY_EXISTS {
                let _ = CloseHandle(handle);
                return Ok(None);
            }
            Ok(Some(Self(handle)))
        }
    }
}

impl Drop for SingleInstance {
    fn drop(&mut self) {
        unsafe {
            let _ = CloseHandle(self.0);
        }
    }
}

fn init_logging(log_dir: &Path, verbose: bool) -> WorkerGuard {
    std::fs::create_dir_all(log_dir).ok();
    let file_appender = tracing_appender::rolling::daily(log_dir, "hvckpt.log");
    let (nb, guard) = tracing_appender::non_blocking(file_appender);
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let console = verbose.then(|| fmt::layer().with_writer(std::io::stderr).with_target(false));
    tracing_subscriber::registry()
        .with(filter)
        .with(fmt::layer().with_ansi(false).with_writer(nb))
        .with(console)
        .init();
    guard
}

fn new_manager(paths: &Paths) -> SubscriptionManager {
    SubscriptionManager::new(
        StateStore::new(&paths.state_file),
        Arc::new(WindowsEventLog),
        Arc::new(ProcessSubscriberTable::new()),
    )
}

fn run_register(paths: &Paths) -> Result<ExitCode> {
    let Some(_instance) = SingleInstance::acquire()? else {
        let existing = StateStore::new(&paths.state_file)
            .load()
            .map(|r| r.identifier)
            .unwrap_or_else(|| "<unknown>".into());
        eprintln!(
            "{}",
            LifecycleError::AlreadyRegistered {
                identifier: existing
            }
        );
        eprintln!("Another hvckpt process owns the subscription.");
        return Ok(ExitCode::FAILURE);
    };

    let rt = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
        .context("Failed to start async runtime")?;
    let action = CheckpointDisableAction::new(HyperVPowerShell::new(), VM_ID_PROPERTY_INDEX);
    let dispatcher = Arc::new(ActionDispatcher::new(
        rt.handle().clone(),
        action,
        MAX_CONCURRENT_ACTIONS,
    ));
    let manager = new_manager(paths);

    let identifier = match manager.register(dispatcher.handler()) {
        Ok(reg) => {
            println!("Registered event subscription '{}'.", reg.identifier);
            if let Some(warning) = reg.warning {
                eprintln!("warning: {warning}");
                eprintln!(
                    "Stop this process to cancel '{}'; the record on disk does not name it.",
                    reg.identifier
                );
            }
            reg.identifier
        }
        Err(e @ LifecycleError::AlreadyRegistered { .. }) => {
            eprintln!("{e}");
            return Ok(ExitCode::FAILURE);
        }
        Err(e) => return Err(e).context("Registration failed"),
    };

    println!("Watching for new virtual machines. Press Ctrl+C to stop.");
    rt.block_on(tokio::signal::ctrl_c())
        .context("Failed to wait for Ctrl+C")?;
    tracing::info!("Stop requested");

    // By identifier, so a watch whose record was never saved is cancelled too.
    match manager.unregister_identifier(&identifier) {
        Ok(()) => println!("Unregistered event subscription '{identifier}'."),
        Err(e) => {
            tracing::error!("{}", e);
            eprintln!("{e}");
            return Ok(ExitCode::FAILURE);
        }
    }
    Ok(ExitCode::SUCCESS)
}

fn run_unregister(paths: &Paths) -> Result<ExitCode> {
    let manager = new_manager(paths);
    match manager.unregister() {
        Ok(identifier) => {
            println!("Unregistered event subscription '{identifier}'.");
            Ok(ExitCode::SUCCESS)
        }
        Err(e @ LifecycleError::NotRegistered) => {
            eprintln!("{e}");
            if let Some(stale) = manager.store().load() {
                eprintln!(
                    "'{}' belongs to another process; stop that process (or its boot task) to end it.",
                    stale.identifier
                );
            }
            Ok(ExitCode::FAILURE)
        }
        Err(e) => Err(e).context("Unregistration failed"),
    }
}

fn report_boot_task(result: std::result::Result<(), BootTaskError>, done: &str) -> ExitCode {
    match result {
        Ok(()) => {
            println!("{done}");
            ExitCode::SUCCESS
        }
        Err(e) => {
            tracing::error!("{}", e);
            eprintln!("{e}");
            ExitCode::FAILURE
        }
    }
}

pub fn main() -> Result<ExitCode> {
    let cli = Cli::parse();

    let paths = config::project_paths()?;
    let _guard = init_logging(&paths.log_dir, cli.command.verbose());
    tracing::info!("hvckpt {} starting: {:?}", env!("CARGO_PKG_VERSION"), cli.command);

    if let Err(e) = privilege::ensure_elevated() {
        tracing::error!("{}", e);
        eprintln!("{e}");
        return Ok(ExitCode::FAILURE);
    }

    match cli.command {
        Command::Register { .. } => run_register(&paths),
        Command::Unregister => run_unregister(&paths),
        Command::InstallBootTask => Ok(report_boot_task(
            autorun::install_boot_task(),
            "Boot task installed.",
        )),
        Command::RemoveBootTask => Ok(report_boot_task(
            autorun::remove_boot_task(),
            "Boot task removed.",
        )),
    }
}
