// Measurement routines: configure the VNA, run controlled sweeps, hand traces to a sink.

use std::path::PathBuf;

use log::info;
use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};
use crate::session::{linspace, SweepMode, TraceFormat, VnaSession};
use crate::sink::{DataSink, RecordKind, SweepRecord, FREQUENCY, IMAGINARY, MAGNITUDE, PHASE, REAL};
use crate::sweep::SweepController;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FrequencyPlan {
    pub start: f64,
    pub stop: f64,
    pub points: usize,
    pub power: f64,
    pub if_bandwidth: u32,
    pub trace: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PowerSweepPlan {
    pub center: f64,
    pub span: f64,
    pub points: usize,
    pub if_bandwidth: u32,
    pub trace: String,
    pub power_start: f64,
    pub power_stop: f64,
    pub steps: usize,
}

impl PowerSweepPlan {
    /// Powers visited, both ends included.
    pub fn powers(&self) -> Vec<f64> {
        linspace(self.power_start, self.power_stop, self.steps)
    }
}

// Magnitude in dB, phase in degrees, then the complex parts
fn read_traces<S: VnaSession + ?Sized>(session: &mut S, run_id: u64, kind: RecordKind, power_dbm: Option<f64>) -> Result<SweepRecord> {
    let frequency: Vec<f64> = session.frequency_setpoints()?;
    let record = SweepRecord::new(run_id, kind, power_dbm)
        .with_column(FREQUENCY, frequency)
        .with_column(MAGNITUDE, session.fetch_trace(TraceFormat::LogMagnitude)?)
        .with_column(PHASE, session.fetch_trace(TraceFormat::Phase)?)
        .with_column(REAL, session.fetch_trace(TraceFormat::Real)?)
        .with_column(IMAGINARY, session.fetch_trace(TraceFormat::Imaginary)?);

    record.len()?;
    Ok(record)
}

fn apply_common<S: VnaSession + ?Sized>(session: &mut S, points: usize, if_bandwidth: u32, trace: &str) -> Result<()> {
    session.set_measured_parameter(trace)?;
    session.set_points(points)?;
    session.set_if_bandwidth(if_bandwidth)
}

/// Put the instrument back into free-running sweeps.
pub fn finish_continuous<S: VnaSession + ?Sized>(session: &mut S) -> Result<()> {
    session.set_mode(SweepMode::Continuous)
}

/// One sweep over `plan`, stored as a single run.
pub fn record_frequency_sweep<S, D>(
    session: &mut S,
    sink: &mut D,
    controller: &SweepController<'_>,
    plan: &FrequencyPlan,
    finish_in_continuous: bool,
) -> Result<Option<PathBuf>>
where
    S: VnaSession + ?Sized,
    D: DataSink + ?Sized,
{
    if plan.start >= plan.stop {
        return Err(Error::invalid("stop", format!("{} Hz must be above the start frequency {} Hz", plan.stop, plan.start)));
    }

    apply_common(session, plan.points, plan.if_bandwidth, &plan.trace)?;
    session.set_start_frequency(plan.start)?;
    session.set_stop_frequency(plan.stop)?;
    session.set_power(plan.power)?;

    let run_id: u64 = sink.start_run(RecordKind::FrequencySweep)?;
    info!("Run {}: {} point sweep {}..{} Hz at {} dBm", run_id, plan.points, plan.start, plan.stop, plan.power);

    controller.run(session)?;
    sink.add_result(&read_traces(session, run_id, RecordKind::FrequencySweep, Some(plan.power))?)?;
    let path: Option<PathBuf> = sink.finish()?;

    if finish_in_continuous {
        finish_continuous(session)?;
    }
    Ok(path)
}

/// One sweep per power setpoint around a fixed center frequency, stored as a single run.
pub fn record_power_sweep<S, D>(
    session: &mut S,
    sink: &mut D,
    controller: &SweepController<'_>,
    plan: &PowerSweepPlan,
    finish_in_continuous: bool,
) -> Result<Option<PathBuf>>
where
    S: VnaSession + ?Sized,
    D: DataSink + ?Sized,
{
    if plan.steps < 1 {
        return Err(Error::invalid("steps", "a power sweep needs at least one step"));
    }

    apply_common(session, plan.points, plan.if_bandwidth, &plan.trace)?;
    session.set_center_frequency(plan.center)?;
    session.set_span(plan.span)?;

    let run_id: u64 = sink.start_run(RecordKind::PowerSweep)?;
    let powers: Vec<f64> = plan.powers();
    info!("Run {}: power sweep {}..{} dBm in {} steps at {} Hz", run_id, plan.power_start, plan.power_stop, powers.len(), plan.center);

    for power in powers {
        session.set_power(power)?;
        controller.run(session)?;
        sink.add_result(&read_traces(session, run_id, RecordKind::PowerSweep, Some(power))?)?;
    }
    let path: Option<PathBuf> = sink.finish()?;

    if finish_in_continuous {
        finish_continuous(session)?;
    }
    Ok(path)
}

/// Store whatever trace the instrument currently holds, without triggering a sweep.
pub fn take_snapshot<S, D>(session: &mut S, sink: &mut D) -> Result<Option<PathBuf>>
where
    S: VnaSession + ?Sized,
    D: DataSink + ?Sized,
{
    let run_id: u64 = sink.start_run(RecordKind::Snapshot)?;
    let power: f64 = session.get_power()?;
    sink.add_result(&read_traces(session, run_id, RecordKind::Snapshot, Some(power))?)?;
    sink.finish()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::devices::simulated::{SessionCall, SimulatedVna};
    use crate::sink::MemorySink;
    use crate::sweep::SweepOptions;
    use std::time::Duration;

    fn controller() -> SweepController<'static> {
        SweepController::new(SweepOptions::new(Duration::from_millis(1), Duration::from_secs(1)).unwrap())
    }

    fn frequency_plan() -> FrequencyPlan {
        FrequencyPlan { start: 5e9, stop: 7e9, points: 101, power: -10.0, if_bandwidth: 100, trace: "S21".to_owned() }
    }

    #[test]
    fn frequency_sweep_produces_one_complete_record() {
        let mut vna = SimulatedVna::new().with_mode(SweepMode::Continuous).completing_on_read(Some(2));
        let mut sink = MemorySink::new();

        record_frequency_sweep(&mut vna, &mut sink, &controller(), &frequency_plan(), false).unwrap();

        assert_eq!(sink.runs, vec![(1, RecordKind::FrequencySweep)]);
        assert_eq!(sink.records.len(), 1);
        let rec = &sink.records[0];
        assert_eq!(rec.len().unwrap(), 101);
        assert_eq!(rec.column(FREQUENCY).unwrap()[0], 5e9);
        assert_eq!(rec.column(FREQUENCY).unwrap()[100], 7e9);
        assert_eq!(rec.power_dbm, Some(-10.0));
        assert_eq!(vna.sweeps_completed(), 1);
        assert_eq!(vna.mode(), SweepMode::Continuous);
        assert_eq!(vna.if_bandwidth(), 100);
        assert_eq!(vna.measured_parameter(), "S21");
    }

    #[test]
    fn traces_are_read_after_the_sweep() {
        let mut vna = SimulatedVna::new();
        let mut sink = MemorySink::new();
        record_frequency_sweep(&mut vna, &mut sink, &controller(), &frequency_plan(), true).unwrap();

        let calls = vna.calls();
        let last_set_single = calls.iter().rposition(|c| *c == SessionCall::SetMode(SweepMode::Single)).unwrap();
        let first_fetch = calls.iter().position(|c| matches!(c, SessionCall::FetchTrace(_))).unwrap();
        assert!(last_set_single < first_fetch);
        assert_eq!(calls.last(), Some(&SessionCall::SetMode(SweepMode::Continuous)));
        assert_eq!(sink.finished, 1);
    }

    #[test]
    fn power_sweep_visits_each_setpoint() {
        let mut vna = SimulatedVna::new();
        let mut sink = MemorySink::new();
        let plan = PowerSweepPlan {
            center: 6e9,
            span: 1e9,
            points: 11,
            if_bandwidth: 10,
            trace: "S21".to_owned(),
            power_start: -30.0,
            power_stop: 10.0,
            steps: 5,
        };

        record_power_sweep(&mut vna, &mut sink, &controller(), &plan, false).unwrap();

        let powers: Vec<f64> = sink.records.iter().filter_map(|r| r.power_dbm).collect();
        assert_eq!(powers, vec![-30.0, -20.0, -10.0, 0.0, 10.0]);
        assert_eq!(vna.sweeps_completed(), 5);
        assert!(sink.records.iter().all(|r| r.run_id == 1 && r.len().unwrap() == 11));
    }

    #[test]
    fn snapshot_never_triggers() {
        let mut vna = SimulatedVna::new();
        let mut sink = MemorySink::new();
        take_snapshot(&mut vna, &mut sink).unwrap();
        assert!(vna.mode_sets().is_empty());
        assert_eq!(sink.records[0].kind, RecordKind::Snapshot);
    }

    #[test]
    fn failed_sweep_leaves_run_unfinished() {
        let mut vna = SimulatedVna::new().completing_on_read(None);
        let mut sink = MemorySink::new();
        let quick = SweepController::new(SweepOptions::new(Duration::from_millis(1), Duration::from_millis(5)).unwrap());

        let res = record_frequency_sweep(&mut vna, &mut sink, &quick, &frequency_plan(), true);
        assert!(matches!(res, Err(Error::Timeout { .. })));
        assert!(sink.records.is_empty());
        assert_eq!(sink.finished, 0);
        assert_eq!(vna.mode(), SweepMode::Single);
    }

    #[test]
    fn inverted_frequency_range_is_rejected() {
        let mut vna = SimulatedVna::new();
        let mut sink = MemorySink::new();
        let plan = FrequencyPlan { start: 7e9, stop: 5e9, ..frequency_plan() };
        assert!(record_frequency_sweep(&mut vna, &mut sink, &controller(), &plan, false).is_err());
        assert!(vna.calls().is_empty());
    }
}
