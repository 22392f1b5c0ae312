use std::time::Duration;

/// The waiting implementation returns this error to indicate that the program should end
/// because too many iterations in a row failed.
#[derive(Debug, thiserror::Error)]
pub enum WaitingGaveUp {
    /// Number of consecutive failures wrapped
    #[error("After {0} consecutive failures the job loop gave up.")]
    Errors(u32),
}

/// Decides how long to pause between two iterations of a job depending on how the last one went.
///
/// The implementation is free to choose any waiting duration and keep internal counters.
pub trait IntelligentWait {
    /// The last iteration wrote its rows.
    fn success(&mut self);
    /// The last iteration had nothing to do (e.g. the trigger cell was off).
    fn skipped(&mut self);
    /// A remote API refused because of its rate limit. Wait a bit longer.
    fn limit_reached(&mut self);
    /// The iteration failed. Wait, or give up when failures pile up.
    fn error(&mut self) -> Result<(), WaitingGaveUp>;
    /// The other methods should use this for waiting. Defaults to [std::thread::sleep]
    fn _wait(&self, status: &str, duration: Duration) {
        log::debug!("[status={status}] wait {duration:?} till next run.");
        if !duration.is_zero() {
            std::thread::sleep(duration);
        }
    }
}

/// Same pause after every outcome, with linear slow down on rate limits and a cap
/// on consecutive failures.
pub struct DefaultWaiter {
    interval: Duration,
    consecutive_errors: u32,
    consecutive_limits: u32,
    max_consecutive_failures: u32,
}
impl DefaultWaiter {
    pub fn new(interval: Duration, max_consecutive_failures: u32) -> DefaultWaiter {
        DefaultWaiter {
            interval,
            max_consecutive_failures,
            consecutive_errors: 0,
            consecutive_limits: 0,
        }
    }
}
impl IntelligentWait for DefaultWaiter {
    /// Successful run: reset error and limit counters, wait [Self::interval] long
    fn success(&mut self) {
        self.consecutive_errors = 0;
        self.consecutive_limits = 0;
        self._wait("success", self.interval);
    }
    /// Skipped run: reset error and limit counters, wait [Self::interval] long
    fn skipped(&mut self) {
        self.consecutive_errors = 0;
        self.consecutive_limits = 0;
        self._wait("skipped", self.interval);
    }
    /// Rate limit reached, wait increasingly longer till the next successful run.
    fn limit_reached(&mut self) {
        self.consecutive_limits += 1;
        log::warn!(
            "Remote rate limit reached, consecutive count: {}",
            self.consecutive_limits
        );
        self._wait("limit-reached", self.interval * (self.consecutive_limits + 1));
    }
    /// Increase the failure counter. Give up once [Self::max_consecutive_failures] is reached.
    fn error(&mut self) -> Result<(), WaitingGaveUp> {
        self.consecutive_errors += 1;
        if self.consecutive_errors >= self.max_consecutive_failures {
            log::error!(
                "{} consecutive failures reached the allowed maximum ({}). Give up!",
                self.consecutive_errors,
                self.max_consecutive_failures
            );
            return Err(WaitingGaveUp::Errors(self.consecutive_errors));
        }
        log::warn!(
            "Failure #{} of {} allowed. Wait {:?}",
            self.consecutive_errors,
            self.max_consecutive_failures,
            self.interval
        );
        self._wait("error", self.interval);
        Ok(())
    }
}
