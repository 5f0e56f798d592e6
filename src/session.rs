// Abstract view of a VNA as seen by the sweep controller and the measurement routines.
// Concrete sessions live in `devices`.

use std::fmt;
use std::str::FromStr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum SweepMode {
    Hold,
    Continuous,
    Single,
}

impl SweepMode {
    pub fn scpi(&self) -> &'static str {
        match self {
            SweepMode::Hold => "HOLD",
            SweepMode::Continuous => "CONT",
            SweepMode::Single => "SING",
        }
    }
}

impl fmt::Display for SweepMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.scpi())
    }
}

// Instruments answer in short or long form and not always in upper case
impl FromStr for SweepMode {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().trim_matches('"').to_ascii_uppercase().as_str() {
            "HOLD" => Ok(SweepMode::Hold),
            "CONT" | "CONTINUOUS" => Ok(SweepMode::Continuous),
            "SING" | "SINGLE" => Ok(SweepMode::Single),
            _ => Err(Error::unexpected("sweep mode query", s)),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum TriggerSource {
    External,
    Manual,
    Immediate,
}

impl TriggerSource {
    pub fn scpi(&self) -> &'static str {
        match self {
            TriggerSource::External => "EXT",
            TriggerSource::Manual => "MAN",
            TriggerSource::Immediate => "IMM",
        }
    }

    /// Operator hint logged when a wait on this trigger source is interrupted.
    pub fn stuck_sweep_hint(&self) -> &'static str {
        match self {
            TriggerSource::Manual => {
                "The trigger source is manual. Are you sure this is correct? \
                 Set the correct source before sweeping again."
            }
            TriggerSource::External => "The trigger source is external. Is the trigger source functional?",
            TriggerSource::Immediate => {
                "The trigger source is immediate, so the sweep should have run on its own. \
                 Check the sweep time and the connection to the instrument."
            }
        }
    }
}

impl fmt::Display for TriggerSource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.scpi())
    }
}

// Anritsu firmware reports an internal/auto source where Keysight says IMMediate
impl FromStr for TriggerSource {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        let upper: String = s.trim().trim_matches('"').to_ascii_uppercase();
        if upper.starts_with("EXT") {
            Ok(TriggerSource::External)
        } else if upper.starts_with("MAN") {
            Ok(TriggerSource::Manual)
        } else if upper.starts_with("IMM") || upper.starts_with("INT") || upper == "AUTO" {
            Ok(TriggerSource::Immediate)
        } else {
            Err(Error::unexpected("trigger source query", s))
        }
    }
}

/// The operations the sweep controller needs from a live instrument.
///
/// Implementations are stateful handles to one physical device and are not shared
/// between threads without external locking.
pub trait InstrumentSession {
    fn get_mode(&mut self) -> Result<SweepMode>;
    fn set_mode(&mut self, mode: SweepMode) -> Result<()>;
    fn get_trigger_source(&mut self) -> Result<TriggerSource>;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum TraceFormat {
    LogMagnitude,
    LinearMagnitude,
    Phase,
    GroupDelay,
    Real,
    Imaginary,
}

impl TraceFormat {
    pub fn scpi(&self) -> &'static str {
        match self {
            TraceFormat::LogMagnitude => "MLOG",
            TraceFormat::LinearMagnitude => "MLIN",
            TraceFormat::Phase => "PHAS",
            TraceFormat::GroupDelay => "GDEL",
            TraceFormat::Real => "REAL",
            TraceFormat::Imaginary => "IMAG",
        }
    }
}

/// Parameter access a measurement routine needs on top of sweep control.
pub trait VnaSession: InstrumentSession {
    fn get_power(&mut self) -> Result<f64>;
    fn set_power(&mut self, dbm: f64) -> Result<()>;

    fn get_start_frequency(&mut self) -> Result<f64>;
    fn set_start_frequency(&mut self, hz: f64) -> Result<()>;
    fn get_stop_frequency(&mut self) -> Result<f64>;
    fn set_stop_frequency(&mut self, hz: f64) -> Result<()>;
    fn set_center_frequency(&mut self, hz: f64) -> Result<()>;
    fn set_span(&mut self, hz: f64) -> Result<()>;

    fn get_points(&mut self) -> Result<usize>;
    fn set_points(&mut self, points: usize) -> Result<()>;
    fn set_if_bandwidth(&mut self, hz: u32) -> Result<()>;
    fn set_measured_parameter(&mut self, s_param: &str) -> Result<()>;

    /// Read the current trace buffer in the requested format. Does not trigger a sweep.
    fn fetch_trace(&mut self, format: TraceFormat) -> Result<Vec<f64>>;

    /// Frequency of each point in the trace buffer.
    fn frequency_setpoints(&mut self) -> Result<Vec<f64>> {
        let start: f64 = self.get_start_frequency()?;
        let stop: f64 = self.get_stop_frequency()?;
        let points: usize = self.get_points()?;
        Ok(linspace(start, stop, points))
    }
}

/// `n` evenly spaced values from `start` to `stop`, both ends included.
pub fn linspace(start: f64, stop: f64, n: usize) -> Vec<f64> {
    match n {
        0 => vec![],
        1 => vec![start],
        _ => {
            let step: f64 = (stop - start) / (n - 1) as f64;
            (0..n).map(|i| if i == n - 1 { stop } else { start + step * i as f64 }).collect()
        }
    }
}

/// Cooperative interrupt flag checked by the sweep controller between polls.
///
/// Cloning shares the flag, so a signal handler can hold one clone while the
/// measurement thread holds another.
#[derive(Debug, Clone, Default)]
pub struct Interrupt {
    flag: Arc<AtomicBool>,
}

impl Interrupt {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn raise(&self) {
        self.flag.store(true, Ordering::SeqCst);
    }

    /// Raise the flag and report whether it was already raised and not yet consumed.
    pub fn raise_again(&self) -> bool {
        self.flag.swap(true, Ordering::SeqCst)
    }

    pub fn is_raised(&self) -> bool {
        self.flag.load(Ordering::SeqCst)
    }

    // Consumes a pending interrupt so the next wait starts clean
    pub fn take(&self) -> bool {
        self.flag.swap(false, Ordering::SeqCst)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sweep_mode_accepts_short_and_long_forms() {
        assert_eq!("SING\n".parse::<SweepMode>().unwrap(), SweepMode::Single);
        assert_eq!("single".parse::<SweepMode>().unwrap(), SweepMode::Single);
        assert_eq!("continuous".parse::<SweepMode>().unwrap(), SweepMode::Continuous);
        assert_eq!("\"HOLD\"".parse::<SweepMode>().unwrap(), SweepMode::Hold);
        assert!("GRO".parse::<SweepMode>().is_err());
    }

    #[test]
    fn trigger_source_maps_vendor_spellings() {
        assert_eq!("EXTernal".parse::<TriggerSource>().unwrap(), TriggerSource::External);
        assert_eq!("MAN".parse::<TriggerSource>().unwrap(), TriggerSource::Manual);
        assert_eq!("IMM\n".parse::<TriggerSource>().unwrap(), TriggerSource::Immediate);
        assert_eq!("INTernal".parse::<TriggerSource>().unwrap(), TriggerSource::Immediate);
        assert!("BUS".parse::<TriggerSource>().is_err());
    }

    #[test]
    fn linspace_includes_both_ends() {
        let v = linspace(-30.0, 13.0, 3);
        assert_eq!(v, vec![-30.0, -8.5, 13.0]);
        assert_eq!(linspace(1.0, 2.0, 1), vec![1.0]);
        assert!(linspace(1.0, 2.0, 0).is_empty());
    }

    #[test]
    fn interrupt_clones_share_state() {
        let a = Interrupt::new();
        let b = a.clone();
        b.raise();
        assert!(a.is_raised());
        assert!(a.take());
        assert!(!b.is_raised());
    }

    #[test]
    fn second_raise_before_consumption_is_reported() {
        let flag = Interrupt::new();
        assert!(!flag.raise_again());
        assert!(flag.raise_again());
        assert!(flag.take());
        assert!(!flag.raise_again());
    }
}
