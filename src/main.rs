//! Scheduled jobs feeding the Nox Pay "Daily Balance" spreadsheet from the payments
//! database and the IUGU API.

use std::{process::exit, time::Duration};

use clap::{Parser, Subcommand};

mod balance_sync;
mod config;
mod db;
mod google_sheets;
mod indicators;
mod iugu;
mod iugu_sync;
mod local_time;
mod looping;
mod numeric;
mod rate_limit;
mod sheet;
mod waiting;
mod withdrawal_stats;

use balance_sync::DailyBalanceJob;
use config::Settings;
use indicators::IndicatorsJob;
use iugu_sync::IuguSyncJob;
use looping::{Job, run_once, update_loop};
use waiting::DefaultWaiter;

#[derive(Parser)]
#[command(name = "noxpay-jobs", version, about)]
struct Cli {
    /// Run a single iteration and exit instead of looping
    #[arg(long)]
    once: bool,

    /// Seconds between two iterations
    #[arg(long, env = "LOOP_INTERVAL_SECS", default_value_t = 60)]
    interval: u64,

    /// Consecutive failed iterations before the program gives up
    #[arg(long, env = "MAX_CONSECUTIVE_FAILURES", default_value_t = 5)]
    max_failures: u32,

    #[command(subcommand)]
    job: JobKind,
}

#[derive(Subcommand)]
enum JobKind {
    /// Bank snapshots and merchant balances
    DailyBalance,
    /// Payment and withdrawal indicators, run when the trigger cell is TRUE
    Indicators {
        /// Ignore the trigger cell
        #[arg(long)]
        force: bool,
    },
    /// IUGU sub-account balances through the SSH tunnel
    IuguSync,
    /// Report which environment variables are set
    CheckEnv,
}

/// Runs `job` once or forever and returns the process exit code.
fn drive<J: Job>(job: Result<J, J::Error>, once: bool, waiter: DefaultWaiter) -> i32 {
    let mut job = match job {
        Ok(job) => job,
        Err(err) => {
            log::error!("Setting up the job failed: {err}");
            return 2;
        }
    };
    if once {
        return match run_once(&mut job) {
            Ok(outcome) => {
                log::info!("{} finished: {outcome:?}", job.name());
                0
            }
            Err(err) => {
                log::error!("{err}");
                1
            }
        };
    }
    let Err(err) = update_loop(&mut job, waiter);
    log::error!("End of program reached: {err}");
    1
}

fn main() {
    if let Err(err) = dotenvy::dotenv() {
        if !err.not_found() {
            eprintln!("Failed to load .env: {err}");
        }
    }
    env_logger::init();
    let cli = Cli::parse();
    log::info!("Starting noxpay-jobs...");

    if let JobKind::CheckEnv = cli.job {
        match config::check_environment(|name| std::env::var(name).ok().filter(|v| !v.is_empty())) {
            Ok(()) => exit(0),
            Err(err) => {
                log::error!("{err}");
                exit(2);
            }
        }
    }

    let settings = match Settings::from_env() {
        Ok(settings) => settings,
        Err(err) => {
            log::error!("Environment check failed, shutting down: {err}");
            exit(2);
        }
    };
    let interval = Duration::from_secs(cli.interval);
    let waiter = DefaultWaiter::new(interval, cli.max_failures);

    let code = match cli.job {
        JobKind::DailyBalance => drive(
            DailyBalanceJob::new(settings.db, &settings.sheets),
            cli.once,
            waiter,
        ),
        JobKind::Indicators { force } => drive(
            IndicatorsJob::new(settings.db, &settings.sheets, force),
            cli.once,
            waiter,
        ),
        JobKind::IuguSync => drive(
            IuguSyncJob::new(&settings.iugu, &settings.sheets),
            cli.once,
            waiter,
        ),
        JobKind::CheckEnv => 0,
    };
    exit(code);
}
