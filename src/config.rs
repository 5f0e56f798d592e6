//! Measurement configuration, read from a TOML file.
//!
//! Every section and field is optional; missing values fall back to the settings the lab
//! has been using for the Keysight P9373A:
//!
//! ```text
//! [instrument]
//! address = "TCPIP0::192.168.1.40::inst0::INSTR"
//! model = "P9373A"
//!
//! [experiment]
//! name = "cavity"
//! sample = "nb_chip3"
//! cooldown_date = "24-05-02"
//! data_root = "/data/measurements"
//!
//! [frequency]
//! start = 5.0e9
//! stop = 7.0e9
//! points = 2001
//! ```

use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::devices::vna::VnaModel;
use crate::error::{Error, Result};
use crate::measurement::{FrequencyPlan, PowerSweepPlan};
use crate::sweep::{SweepOptions, DEFAULT_POLL_INTERVAL};

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct MeasurementConfig {
    pub instrument: InstrumentConfig,
    pub experiment: ExperimentConfig,
    pub sweep: SweepConfig,
    pub frequency: FrequencyConfig,
    pub power_sweep: PowerSweepConfig,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct InstrumentConfig {
    pub name: String,
    /// VISA resource string or bare host name.
    pub address: String,
    pub model: String,
}

impl Default for InstrumentConfig {
    fn default() -> Self {
        Self { name: "VNA".to_owned(), address: "TCPIP0::localhost::inst0::INSTR".to_owned(), model: "P9373A".to_owned() }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ExperimentConfig {
    pub name: String,
    pub sample: String,
    pub cooldown_date: String,
    pub data_root: PathBuf,
}

impl Default for ExperimentConfig {
    fn default() -> Self {
        Self { name: "test".to_owned(), sample: "sample".to_owned(), cooldown_date: "00-00-00".to_owned(), data_root: PathBuf::from("data") }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SweepConfig {
    pub poll_interval_ms: u64,
    pub timeout_ms: u64,
    pub auto_restore: bool,
    /// Leave the instrument sweeping continuously when a routine ends.
    pub finish_continuous: bool,
}

impl Default for SweepConfig {
    fn default() -> Self {
        Self { poll_interval_ms: DEFAULT_POLL_INTERVAL.as_millis() as u64, timeout_ms: 60_000, auto_restore: true, finish_continuous: true }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct FrequencyConfig {
    pub start: f64,
    pub stop: f64,
    pub points: usize,
    pub power: f64,
    pub if_bandwidth: u32,
    pub trace: String,
}

impl Default for FrequencyConfig {
    fn default() -> Self {
        Self { start: 300e3, stop: 13.5e9, points: 50, power: -10.0, if_bandwidth: 10, trace: "S21".to_owned() }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PowerSweepConfig {
    pub start: f64,
    pub stop: f64,
    pub steps: usize,
}

impl Default for PowerSweepConfig {
    fn default() -> Self {
        Self { start: -30.0, stop: 13.0, steps: 3 }
    }
}

impl MeasurementConfig {
    pub fn load(path: &Path) -> Result<Self> {
        let text: String = fs::read_to_string(path).map_err(|e| Error::storage(path, e))?;
        Self::parse(&text)
    }

    pub fn parse(text: &str) -> Result<Self> {
        let config: MeasurementConfig = toml::from_str(text)?;
        config.validate()?;
        Ok(config)
    }

    pub fn model(&self) -> Result<VnaModel> {
        VnaModel::by_name(&self.instrument.model)
            .ok_or_else(|| Error::invalid("model", format!("unknown VNA model {:?}", self.instrument.model)))
    }

    pub fn validate(&self) -> Result<()> {
        let model: VnaModel = self.model()?;
        self.sweep_options()?;

        if self.instrument.address.trim().is_empty() {
            return Err(Error::invalid("address", "must not be empty"));
        }

        let f: &FrequencyConfig = &self.frequency;
        model.check_frequency("start", f.start)?;
        model.check_frequency("stop", f.stop)?;
        if f.start >= f.stop {
            return Err(Error::invalid("stop", format!("{} Hz must be above the start frequency {} Hz", f.stop, f.start)));
        }
        model.check_points(f.points)?;
        model.check_power(f.power)?;
        model.check_if_bandwidth(f.if_bandwidth)?;
        model.check_measured_parameter(&f.trace.trim().to_ascii_uppercase())?;

        let p: &PowerSweepConfig = &self.power_sweep;
        if p.steps < 1 {
            return Err(Error::invalid("steps", "a power sweep needs at least one step"));
        }
        model.check_power(p.start)?;
        model.check_power(p.stop)?;
        Ok(())
    }

    pub fn sweep_options(&self) -> Result<SweepOptions> {
        let opts = SweepOptions::new(Duration::from_millis(self.sweep.poll_interval_ms), Duration::from_millis(self.sweep.timeout_ms))?;
        Ok(opts.with_auto_restore(self.sweep.auto_restore))
    }

    pub fn frequency_plan(&self) -> FrequencyPlan {
        let f: &FrequencyConfig = &self.frequency;
        FrequencyPlan {
            start: f.start,
            stop: f.stop,
            points: f.points,
            power: f.power,
            if_bandwidth: f.if_bandwidth,
            trace: f.trace.clone(),
        }
    }

    // The power sweep covers the same band as the frequency sweep
    pub fn power_sweep_plan(&self) -> PowerSweepPlan {
        let f: &FrequencyConfig = &self.frequency;
        PowerSweepPlan {
            center: (f.start + f.stop) / 2.0,
            span: f.stop - f.start,
            points: f.points,
            if_bandwidth: f.if_bandwidth,
            trace: f.trace.clone(),
            power_start: self.power_sweep.start,
            power_stop: self.power_sweep.stop,
            steps: self.power_sweep.steps,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_file_gives_lab_defaults() {
        let config = MeasurementConfig::parse("").unwrap();
        assert_eq!(config, MeasurementConfig::default());
        assert_eq!(config.sweep_options().unwrap().poll_interval, Duration::from_millis(100));
        assert_eq!(config.power_sweep_plan().powers(), vec![-30.0, -8.5, 13.0]);
    }

    #[test]
    fn partial_sections_keep_other_defaults() {
        let config = MeasurementConfig::parse(
            r#"
            [instrument]
            model = "MS46522B"

            [frequency]
            start = 5.0e9
            stop = 7.0e9
            power = 20.0

            [sweep]
            auto_restore = false
            "#,
        )
        .unwrap();

        assert_eq!(config.model().unwrap().name, "MS46522B");
        assert_eq!(config.frequency.points, 50);
        assert!(!config.sweep_options().unwrap().auto_restore);
        assert_eq!(config.sweep.timeout_ms, 60_000);
    }

    #[test]
    fn out_of_range_values_fail_validation() {
        // +20 dBm is fine on the Anritsu but not on the Keysight
        let err = MeasurementConfig::parse("[frequency]\npower = 20.0\n").unwrap_err();
        assert!(matches!(err, Error::InvalidParameter { name: "power", .. }));

        assert!(MeasurementConfig::parse("[instrument]\nmodel = \"E5071C\"\n").is_err());
        assert!(MeasurementConfig::parse("[sweep]\npoll_interval_ms = 500\ntimeout_ms = 100\n").is_err());
        assert!(MeasurementConfig::parse("[frequency]\ntrace = \"S13\"\n").is_err());
        assert!(MeasurementConfig::parse("[power_sweep]\nsteps = 0\n").is_err());
    }

    #[test]
    fn malformed_toml_is_a_config_error() {
        assert!(matches!(MeasurementConfig::parse("[sweep\n"), Err(Error::Config(_))));
        assert!(matches!(MeasurementConfig::parse("[sweep]\ntimeout_ms = \"long\"\n"), Err(Error::Config(_))));
    }

    #[test]
    fn load_reads_from_disk() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("vna.toml");
        fs::write(&path, "[experiment]\nname = \"cavity\"\n").unwrap();
        assert_eq!(MeasurementConfig::load(&path).unwrap().experiment.name, "cavity");

        let missing = MeasurementConfig::load(&dir.path().join("nope.toml"));
        assert!(matches!(missing, Err(Error::Storage { .. })));
    }
}
