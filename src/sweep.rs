// Single-sweep trigger and wait.
//
// The instrument has no completion notification we can subscribe to, so the only way to
// know a sweep finished is to put it in SINGLE and read the mode back until the firmware
// moves it somewhere else.

use std::thread;
use std::time::{Duration, Instant};

use log::{debug, warn};

use crate::error::{Error, Result};
use crate::session::{InstrumentSession, Interrupt, SweepMode};

pub const DEFAULT_POLL_INTERVAL: Duration = Duration::from_millis(100);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SweepOptions {
    pub poll_interval: Duration,
    pub timeout: Duration,
    pub auto_restore: bool,
}

impl SweepOptions {
    pub fn new(poll_interval: Duration, timeout: Duration) -> Result<Self> {
        let opts = Self { poll_interval, timeout, auto_restore: true };
        opts.validate()?;
        Ok(opts)
    }

    pub fn with_auto_restore(mut self, auto_restore: bool) -> Self {
        self.auto_restore = auto_restore;
        self
    }

    pub fn validate(&self) -> Result<()> {
        if self.poll_interval.is_zero() {
            return Err(Error::invalid("poll_interval", "must be greater than zero"));
        }
        if self.timeout <= self.poll_interval {
            return Err(Error::invalid(
                "timeout",
                format!("{:?} must be longer than the poll interval {:?}", self.timeout, self.poll_interval),
            ));
        }
        Ok(())
    }

    /// Upper bound on completion reads for one sweep: `ceil(timeout / poll_interval) + 1`.
    pub fn max_polls(&self) -> usize {
        let interval: u128 = self.poll_interval.as_nanos().max(1);
        let timeout: u128 = self.timeout.as_nanos();
        ((timeout + interval - 1) / interval) as usize + 1
    }
}

pub struct SweepController<'a> {
    options: SweepOptions,
    interrupt: Option<&'a Interrupt>,
}

impl<'a> SweepController<'a> {
    pub fn new(options: SweepOptions) -> Self {
        Self { options, interrupt: None }
    }

    pub fn with_interrupt(mut self, interrupt: &'a Interrupt) -> Self {
        self.interrupt = Some(interrupt);
        self
    }

    pub fn options(&self) -> &SweepOptions {
        &self.options
    }

    /// Trigger one sweep and block until the instrument leaves SINGLE.
    ///
    /// Returns the mode the instrument was in before the call. On error the previous
    /// mode is not restored, since the instrument may still be sweeping.
    pub fn run<S: InstrumentSession + ?Sized>(&self, session: &mut S) -> Result<SweepMode> {
        self.options.validate()?;

        let previous_mode: SweepMode = session.get_mode()?;
        debug!("Previous sweep mode {}", previous_mode);

        session.set_mode(SweepMode::Single)?;
        let finished_in: SweepMode = self.wait_for_completion(session)?;
        debug!("Sweep complete, instrument now in {}", finished_in);

        if self.options.auto_restore && previous_mode == SweepMode::Continuous {
            session.set_mode(SweepMode::Continuous)?;
        }

        Ok(previous_mode)
    }

    fn wait_for_completion<S: InstrumentSession + ?Sized>(&self, session: &mut S) -> Result<SweepMode> {
        let start = Instant::now();
        let max_polls: usize = self.options.max_polls();
        let mut polls: usize = 0;

        loop {
            self.check_interrupt(session)?;

            polls += 1;
            let mode: SweepMode = session.get_mode()?;
            if mode != SweepMode::Single {
                return Ok(mode);
            }

            let elapsed: Duration = start.elapsed();
            if elapsed >= self.options.timeout || polls >= max_polls {
                return Err(Error::Timeout { elapsed, polls });
            }

            let remaining: Duration = self.options.timeout - elapsed;
            thread::sleep(self.options.poll_interval.min(remaining));
        }
    }

    fn check_interrupt<S: InstrumentSession + ?Sized>(&self, session: &mut S) -> Result<()> {
        match self.interrupt {
            Some(i) if i.take() => {}
            _ => return Ok(()),
        }

        // The source query goes to the same instrument that may be hung, so a failure
        // here must not mask the interrupt
        let trigger_source = match session.get_trigger_source() {
            Ok(source) => {
                warn!("User abort detected. {}", source.stuck_sweep_hint());
                Some(source)
            }
            Err(e) => {
                warn!("User abort detected. Unable to read the trigger source: {}", e);
                None
            }
        };

        Err(Error::InterruptedWait { trigger_source })
    }
}

/// Convenience wrapper for a one-off sweep.
pub fn run_sweep<S: InstrumentSession + ?Sized>(session: &mut S, options: SweepOptions, interrupt: Option<&Interrupt>) -> Result<SweepMode> {
    match interrupt {
        Some(i) => SweepController::new(options).with_interrupt(i).run(session),
        None => SweepController::new(options).run(session),
    }
}
