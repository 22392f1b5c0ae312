use std::{convert::Infallible, fmt};

use crate::{
    local_time::{loop_banner, now_sao_paulo},
    waiting::{IntelligentWait, WaitingGaveUp},
};

/// What an iteration of a job ended up doing.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum JobOutcome {
    /// Rows were written to the sheet.
    Updated,
    /// Nothing to do this time.
    Skipped,
}

/// One of the scheduled jobs. An iteration opens its own connections and drops them at the end.
pub trait Job {
    type Error: fmt::Display + fmt::Debug;

    fn name(&self) -> &'static str;

    fn run(&mut self) -> Result<JobOutcome, Self::Error>;

    /// Whether the failure was a remote API refusing due to rate limits.
    fn is_rate_limited(_err: &Self::Error) -> bool {
        false
    }
}

/// A fatal, unrecoverable error that the program wasn't able to ignore.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// The job failed too often in a row.
    #[error("waiting error: {0}")]
    Waiting(#[from] WaitingGaveUp),
    /// A single requested iteration failed.
    #[error("job {job} failed: {message}")]
    Job { job: &'static str, message: String },
}

/// Main application loop.
///
/// After each iteration the instance of [IntelligentWait] provided as parameter
/// is used to delay the next run depending on how the iteration went.
///
/// This function will only return if a fatal error occurs.
pub fn update_loop<J: Job, W: IntelligentWait>(
    job: &mut J,
    mut wait_after: W,
) -> Result<Infallible, Error> {
    loop {
        log::info!("\n{}", loop_banner(now_sao_paulo()));
        log::info!("Start new {} iteration", job.name());
        match job.run() {
            Ok(JobOutcome::Updated) => {
                log::info!("Update finished successfully at {}", now_sao_paulo());
                wait_after.success();
            }
            Ok(JobOutcome::Skipped) => {
                log::info!("Iteration skipped as there is nothing to do");
                wait_after.skipped();
            }
            Err(err) if J::is_rate_limited(&err) => {
                log::warn!("{} hit a remote rate limit: {err}", job.name());
                wait_after.limit_reached();
            }
            Err(err) => {
                log::error!("{} iteration failed: {err}", job.name());
                wait_after.error()?;
            }
        }
    }
}

/// Runs a single iteration, e.g. when scheduled by an external cron.
pub fn run_once<J: Job>(job: &mut J) -> Result<JobOutcome, Error> {
    log::info!("Start single {} iteration at {}", job.name(), now_sao_paulo());
    job.run().map_err(|err| Error::Job {
        job: job.name(),
        message: err.to_string(),
    })
}

#[cfg(test)]
mod tests {
    use std::{collections::VecDeque, time::Duration};

    use super::*;
    use crate::waiting::DefaultWaiter;

    #[derive(Debug, thiserror::Error)]
    enum ScriptedError {
        #[error("limited")]
        Limited,
        #[error("broken")]
        Broken,
    }

    struct Scripted {
        results: VecDeque<Result<JobOutcome, ScriptedError>>,
        runs: usize,
    }

    impl Job for Scripted {
        type Error = ScriptedError;

        fn name(&self) -> &'static str {
            "scripted"
        }

        fn run(&mut self) -> Result<JobOutcome, ScriptedError> {
            self.runs += 1;
            self.results.pop_front().unwrap_or(Err(ScriptedError::Broken))
        }

        fn is_rate_limited(err: &ScriptedError) -> bool {
            matches!(err, ScriptedError::Limited)
        }
    }

    #[test]
    fn loop_ends_after_consecutive_failures() {
        let mut job = Scripted {
            results: VecDeque::from([
                Err(ScriptedError::Broken),
                Ok(JobOutcome::Updated),
                Err(ScriptedError::Limited),
                Ok(JobOutcome::Skipped),
            ]),
            runs: 0,
        };
        let Err(err) = update_loop(&mut job, DefaultWaiter::new(Duration::ZERO, 3));
        assert!(matches!(err, Error::Waiting(WaitingGaveUp::Errors(3))));
        // 4 scripted runs, then 3 failures in a row
        assert_eq!(job.runs, 7);
    }

    #[test]
    fn run_once_reports_failure() {
        let mut job = Scripted {
            results: VecDeque::from([Err(ScriptedError::Broken)]),
            runs: 0,
        };
        let err = run_once(&mut job).unwrap_err();
        assert_eq!(err.to_string(), "job scripted failed: broken");
    }

    #[test]
    fn run_once_passes_outcome() {
        let mut job = Scripted {
            results: VecDeque::from([Ok(JobOutcome::Skipped)]),
            runs: 0,
        };
        assert_eq!(run_once(&mut job).unwrap(), JobOutcome::Skipped);
    }
}
