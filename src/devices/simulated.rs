
// In-process VNA with a scriptable sweep state machine.
//
// A sweep is armed by set(SINGLE) and completes on a chosen mode read, after which the
// instrument reports its terminal mode. Every call is logged so tests can assert on the
// exact exchange the controller performed.

use std::f64::consts::PI;
use std::io;
use std::thread;
use std::time::Duration;

use log::debug;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};

use crate::devices::vna::{Identity, VnaModel, KEYSIGHT_P9373A};
use crate::error::Result;
use crate::session::{linspace, InstrumentSession, SweepMode, TraceFormat, TriggerSource, VnaSession};

#[derive(Debug, Clone, PartialEq)]
pub enum SessionCall {
    GetMode(SweepMode),
    SetMode(SweepMode),
    GetTriggerSource,
    Get(&'static str),
    Set(&'static str, f64),
    SetMeasuredParameter(String),
    FetchTrace(TraceFormat),
}

/// Notch in S21 from a resonator coupled to the through line.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Resonance {
    pub center_hz: f64,
    pub quality: f64,
    pub depth: f64,
}

impl Resonance {
    // S21 = 1 - depth / (1 + 2jQ(f - f0)/f0)
    fn s21(&self, freq: f64) -> (f64, f64) {
        let x: f64 = 2.0 * self.quality * (freq - self.center_hz) / self.center_hz;
        let d: f64 = 1.0 + x * x;
        (1.0 - self.depth / d, self.depth * x / d)
    }
}

pub struct SimulatedVna {
    model: VnaModel,
    mode: SweepMode,
    complete_on_read: Option<usize>,
    reads_since_armed: usize,
    terminal_mode: SweepMode,
    latency: Duration,
    trigger_source: TriggerSource,
    fail_on_call: Option<usize>,
    n_calls: usize,
    calls: Vec<SessionCall>,
    sweeps_completed: usize,

    power: f64,
    start: f64,
    stop: f64,
    points: usize,
    if_bandwidth: u32,
    measured_parameter: String,

    resonance: Resonance,
    noise: f64,
    rng: StdRng,
    trace: Option<Vec<(f64, f64)>>,
}

impl SimulatedVna {

    /// A P9373A in HOLD whose sweeps finish on the first mode read.
    pub fn new() -> Self {
        let model: VnaModel = KEYSIGHT_P9373A;
        Self {
            model,
            mode: SweepMode::Hold,
            complete_on_read: Some(1),
            reads_since_armed: 0,
            terminal_mode: SweepMode::Hold,
            latency: Duration::ZERO,
            trigger_source: TriggerSource::Immediate,
            fail_on_call: None,
            n_calls: 0,
            calls: vec![],
            sweeps_completed: 0,
            power: -10.0,
            start: model.min_freq_hz,
            stop: model.max_freq_hz,
            points: 50,
            if_bandwidth: 10,
            measured_parameter: "S21".to_owned(),
            resonance: Resonance { center_hz: 6.0e9, quality: 10.0, depth: 0.8 },
            noise: 1e-3,
            rng: StdRng::seed_from_u64(0x5eed),
            trace: None,
        }
    }

    pub fn with_model(mut self, model: VnaModel) -> Self {
        self.model = model;
        self.start = model.min_freq_hz;
        self.stop = model.max_freq_hz;
        self
    }

    pub fn with_mode(mut self, mode: SweepMode) -> Self {
        self.mode = mode;
        self
    }

    /// The `n`-th mode read after arming reports the terminal mode; `None` never completes.
    pub fn completing_on_read(mut self, n: Option<usize>) -> Self {
        self.complete_on_read = n.map(|n| n.max(1));
        self
    }

    pub fn with_terminal_mode(mut self, mode: SweepMode) -> Self {
        self.terminal_mode = mode;
        self
    }

    pub fn with_latency(mut self, latency: Duration) -> Self {
        self.latency = latency;
        self
    }

    pub fn with_trigger_source(mut self, source: TriggerSource) -> Self {
        self.trigger_source = source;
        self
    }

    /// Make the `n`-th call (counting from 1 across every session method) fail as a
    /// dropped link would.
    pub fn failing_on_call(mut self, n: usize) -> Self {
        self.fail_on_call = Some(n);
        self
    }

    pub fn with_resonance(mut self, resonance: Resonance) -> Self {
        self.resonance = resonance;
        self.trace = None;
        self
    }

    pub fn with_noise(mut self, noise: f64, seed: u64) -> Self {
        self.noise = noise;
        self.rng = StdRng::seed_from_u64(seed);
        self
    }

    pub fn identity(&self) -> Identity {
        Identity {
            manufacturer: "Simulated".to_owned(),
            model: self.model.name.to_owned(),
            serial_num: "SIM00001".to_owned(),
            fw_version: env!("CARGO_PKG_VERSION").to_owned(),
        }
    }

    pub fn mode(&self) -> SweepMode { self.mode }
    pub fn calls(&self) -> &[SessionCall] { &self.calls }
    pub fn sweeps_completed(&self) -> usize { self.sweeps_completed }
    pub fn if_bandwidth(&self) -> u32 { self.if_bandwidth }
    pub fn measured_parameter(&self) -> &str { &self.measured_parameter }

    pub fn mode_reads(&self) -> usize {
        self.calls.iter().filter(|c| matches!(c, SessionCall::GetMode(_))).count()
    }

    pub fn mode_sets(&self) -> Vec<SweepMode> {
        self.calls
            .iter()
            .filter_map(|c| match c {
                SessionCall::SetMode(m) => Some(*m),
                _ => None,
            })
            .collect()
    }

    // The span shrinks to keep the center when it would run off the model's range
    fn place(&mut self, center: f64, half_span: f64) {
        let half_span: f64 = half_span.min(center - self.model.min_freq_hz).min(self.model.max_freq_hz - center);
        self.start = center - half_span;
        self.stop = center + half_span;
    }

    // Every session method goes through here first
    fn enter(&mut self) -> Result<()> {
        self.n_calls += 1;
        if !self.latency.is_zero() {
            thread::sleep(self.latency);
        }
        if Some(self.n_calls) == self.fail_on_call {
            debug!("Simulated fault on call {}", self.n_calls);
            return Err(io::Error::new(io::ErrorKind::ConnectionReset, format!("simulated fault on call {}", self.n_calls)).into());
        }
        Ok(())
    }

    fn acquire_trace(&mut self) {
        let freqs: Vec<f64> = linspace(self.start, self.stop, self.points);
        let noise: f64 = self.noise;
        let resonance: Resonance = self.resonance;
        let rng: &mut StdRng = &mut self.rng;
        let trace: Vec<(f64, f64)> = freqs
            .iter()
            .map(|f| {
                let (re, im) = resonance.s21(*f);
                if noise > 0.0 {
                    (re + rng.gen_range(-noise..noise), im + rng.gen_range(-noise..noise))
                } else {
                    (re, im)
                }
            })
            .collect();
        self.trace = Some(trace);
    }

    fn formatted(&self, trace: &[(f64, f64)], format: TraceFormat) -> Vec<f64> {
        let phase = |(re, im): (f64, f64)| im.atan2(re).to_degrees();
        match format {
            TraceFormat::LogMagnitude => trace.iter().map(|(re, im)| 20.0 * re.hypot(*im).log10()).collect(),
            TraceFormat::LinearMagnitude => trace.iter().map(|(re, im)| re.hypot(*im)).collect(),
            TraceFormat::Phase => trace.iter().map(|p| phase(*p)).collect(),
            TraceFormat::Real => trace.iter().map(|(re, _)| *re).collect(),
            TraceFormat::Imaginary => trace.iter().map(|(_, im)| *im).collect(),
            TraceFormat::GroupDelay => {
                // -dphi/domega by finite differences, repeated at the last point
                let freqs: Vec<f64> = linspace(self.start, self.stop, self.points);
                let mut out: Vec<f64> = trace
                    .windows(2)
                    .zip(freqs.windows(2))
                    .map(|(t, f)| {
                        let dphi: f64 = (phase(t[1]) - phase(t[0])).to_radians();
                        -dphi / (2.0 * PI * (f[1] - f[0]))
                    })
                    .collect();
                if let Some(last) = out.last().copied() {
                    out.push(last);
                }
                out
            }
        }
    }

}

impl Default for SimulatedVna {
    fn default() -> Self { Self::new() }
}

impl InstrumentSession for SimulatedVna {

    fn get_mode(&mut self) -> Result<SweepMode> {
        self.enter()?;
        if self.mode == SweepMode::Single {
            self.reads_since_armed += 1;
            if Some(self.reads_since_armed) == self.complete_on_read {
                self.acquire_trace();
                self.sweeps_completed += 1;
                self.mode = self.terminal_mode;
            }
        }
        self.calls.push(SessionCall::GetMode(self.mode));
        Ok(self.mode)
    }

    fn set_mode(&mut self, mode: SweepMode) -> Result<()> {
        self.enter()?;
        self.calls.push(SessionCall::SetMode(mode));
        if mode == SweepMode::Single {
            self.reads_since_armed = 0;
        }
        self.mode = mode;
        Ok(())
    }

    fn get_trigger_source(&mut self) -> Result<TriggerSource> {
        self.enter()?;
        self.calls.push(SessionCall::GetTriggerSource);
        Ok(self.trigger_source)
    }

}

impl VnaSession for SimulatedVna {

    fn get_power(&mut self) -> Result<f64> {
        self.enter()?;
        self.calls.push(SessionCall::Get("power"));
        Ok(self.power)
    }

    fn set_power(&mut self, dbm: f64) -> Result<()> {
        self.model.check_power(dbm)?;
        self.enter()?;
        self.calls.push(SessionCall::Set("power", dbm));
        self.power = dbm;
        Ok(())
    }

    fn get_start_frequency(&mut self) -> Result<f64> {
        self.enter()?;
        self.calls.push(SessionCall::Get("start"));
        Ok(self.start)
    }

    fn set_start_frequency(&mut self, hz: f64) -> Result<()> {
        self.model.check_frequency("start", hz)?;
        self.enter()?;
        self.calls.push(SessionCall::Set("start", hz));
        self.start = hz;
        Ok(())
    }

    fn get_stop_frequency(&mut self) -> Result<f64> {
        self.enter()?;
        self.calls.push(SessionCall::Get("stop"));
        Ok(self.stop)
    }

    fn set_stop_frequency(&mut self, hz: f64) -> Result<()> {
        self.model.check_frequency("stop", hz)?;
        self.enter()?;
        self.calls.push(SessionCall::Set("stop", hz));
        self.stop = hz;
        Ok(())
    }

    fn set_center_frequency(&mut self, hz: f64) -> Result<()> {
        self.model.check_frequency("center", hz)?;
        self.enter()?;
        self.calls.push(SessionCall::Set("center", hz));
        self.place(hz, (self.stop - self.start) / 2.0);
        Ok(())
    }

    fn set_span(&mut self, hz: f64) -> Result<()> {
        self.model.check_span(hz)?;
        self.enter()?;
        self.calls.push(SessionCall::Set("span", hz));
        self.place((self.start + self.stop) / 2.0, hz / 2.0);
        Ok(())
    }

    fn get_points(&mut self) -> Result<usize> {
        self.enter()?;
        self.calls.push(SessionCall::Get("points"));
        Ok(self.points)
    }

    fn set_points(&mut self, points: usize) -> Result<()> {
        self.model.check_points(points)?;
        self.enter()?;
        self.calls.push(SessionCall::Set("points", points as f64));
        self.points = points;
        Ok(())
    }

    fn set_if_bandwidth(&mut self, hz: u32) -> Result<()> {
        self.model.check_if_bandwidth(hz)?;
        self.enter()?;
        self.calls.push(SessionCall::Set("if_bandwidth", hz as f64));
        self.if_bandwidth = hz;
        Ok(())
    }

    fn set_measured_parameter(&mut self, s_param: &str) -> Result<()> {
        let s_param: String = s_param.trim().to_ascii_uppercase();
        self.model.check_measured_parameter(&s_param)?;
        self.enter()?;
        self.calls.push(SessionCall::SetMeasuredParameter(s_param.clone()));
        self.measured_parameter = s_param;
        Ok(())
    }

    fn fetch_trace(&mut self, format: TraceFormat) -> Result<Vec<f64>> {
        self.enter()?;
        self.calls.push(SessionCall::FetchTrace(format));

        // The buffer never matches a changed point count, so a stale one is re-acquired
        let stale: bool = self.trace.as_ref().map_or(true, |t| t.len() != self.points);
        if stale {
            self.acquire_trace();
        }
        let trace: &[(f64, f64)] = self.trace.as_deref().unwrap_or(&[]);
        Ok(self.formatted(trace, format))
    }

}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::Error;

    #[test]
    fn sweep_completes_on_requested_read() {
        let mut vna = SimulatedVna::new().completing_on_read(Some(3)).with_terminal_mode(SweepMode::Hold);
        vna.set_mode(SweepMode::Single).unwrap();
        assert_eq!(vna.get_mode().unwrap(), SweepMode::Single);
        assert_eq!(vna.get_mode().unwrap(), SweepMode::Single);
        assert_eq!(vna.get_mode().unwrap(), SweepMode::Hold);
        assert_eq!(vna.sweeps_completed(), 1);
        assert_eq!(vna.mode_reads(), 3);
    }

    #[test]
    fn never_completing_sweep_stays_single() {
        let mut vna = SimulatedVna::new().completing_on_read(None);
        vna.set_mode(SweepMode::Single).unwrap();
        for _ in 0..20 {
            assert_eq!(vna.get_mode().unwrap(), SweepMode::Single);
        }
        assert_eq!(vna.sweeps_completed(), 0);
    }

    #[test]
    fn injected_fault_is_session_unavailable() {
        let mut vna = SimulatedVna::new().failing_on_call(2);
        vna.get_mode().unwrap();
        assert!(matches!(vna.get_mode(), Err(Error::SessionUnavailable(_))));
        assert_eq!(vna.calls().len(), 1);
        vna.get_mode().unwrap();
    }

    #[test]
    fn invalid_settings_are_rejected_without_a_call() {
        let mut vna = SimulatedVna::new();
        assert!(vna.set_power(20.0).is_err());
        assert!(vna.set_points(20002).is_err());
        assert!(vna.set_measured_parameter("S33").is_err());
        assert!(vna.calls().is_empty());
    }

    #[test]
    fn formats_describe_the_same_trace() {
        let mut vna = SimulatedVna::new().with_noise(0.0, 1);
        vna.set_start_frequency(5.0e9).unwrap();
        vna.set_stop_frequency(7.0e9).unwrap();
        vna.set_points(201).unwrap();

        let mag = vna.fetch_trace(TraceFormat::LinearMagnitude).unwrap();
        let re = vna.fetch_trace(TraceFormat::Real).unwrap();
        let im = vna.fetch_trace(TraceFormat::Imaginary).unwrap();
        let db = vna.fetch_trace(TraceFormat::LogMagnitude).unwrap();
        assert_eq!(mag.len(), 201);
        for i in 0..mag.len() {
            assert!((mag[i] - re[i].hypot(im[i])).abs() < 1e-12);
            assert!((db[i] - 20.0 * mag[i].log10()).abs() < 1e-9);
        }

        // Deepest point sits on the resonance
        let (i_min, _) = mag.iter().enumerate().fold((0, f64::MAX), |acc, (i, m)| if *m < acc.1 { (i, *m) } else { acc });
        assert_eq!(i_min, 100);
        assert!((mag[i_min] - 0.2).abs() < 1e-9);
    }

    #[test]
    fn span_keeps_center() {
        let mut vna = SimulatedVna::new();
        vna.set_start_frequency(5.0e9).unwrap();
        vna.set_stop_frequency(7.0e9).unwrap();
        vna.set_center_frequency(6.5e9).unwrap();
        assert_eq!(vna.get_start_frequency().unwrap(), 5.5e9);
        vna.set_span(1.0e9).unwrap();
        assert_eq!(vna.get_start_frequency().unwrap(), 6.0e9);
        assert_eq!(vna.get_stop_frequency().unwrap(), 7.0e9);
    }
}
