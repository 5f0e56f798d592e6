//! Where sweep results go once they have been read off the instrument.
//!
//! A measurement routine opens a run with [`DataSink::start_run`], pushes one
//! [`SweepRecord`] per sweep and closes the run with [`DataSink::finish`].

use std::fs::{self, File};
use std::io::{BufWriter, Write};
use std::path::{Path, PathBuf};

use chrono::Local;
use log::info;
use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};

pub const FREQUENCY: &str = "frequency";
pub const MAGNITUDE: &str = "magnitude";
pub const PHASE: &str = "phase";
pub const REAL: &str = "real";
pub const IMAGINARY: &str = "imaginary";
pub const POWER: &str = "power";

const TRACE_COLUMNS: [&str; 5] = [FREQUENCY, MAGNITUDE, PHASE, REAL, IMAGINARY];

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum RecordKind {
    FrequencySweep,
    PowerSweep,
    Snapshot,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SweepRecord {
    pub run_id: u64,
    pub kind: RecordKind,
    pub power_dbm: Option<f64>,
    pub columns: Vec<(String, Vec<f64>)>,
}

impl SweepRecord {
    pub fn new(run_id: u64, kind: RecordKind, power_dbm: Option<f64>) -> Self {
        Self { run_id, kind, power_dbm, columns: vec![] }
    }

    pub fn with_column(mut self, name: &str, values: Vec<f64>) -> Self {
        self.columns.push((name.to_owned(), values));
        self
    }

    pub fn column(&self, name: &str) -> Option<&[f64]> {
        self.columns.iter().find(|(n, _)| n == name).map(|(_, v)| v.as_slice())
    }

    /// Number of points, after checking every column has the same length.
    pub fn len(&self) -> Result<usize> {
        let n: usize = self.columns.first().map_or(0, |(_, v)| v.len());
        match self.columns.iter().find(|(_, v)| v.len() != n) {
            Some((name, v)) => Err(Error::invalid("columns", format!("{} has {} values, expected {}", name, v.len(), n))),
            None => Ok(n),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.columns.iter().all(|(_, v)| v.is_empty())
    }
}

pub trait DataSink {
    /// Begin a new run and return its id.
    fn start_run(&mut self, kind: RecordKind) -> Result<u64>;
    fn add_result(&mut self, record: &SweepRecord) -> Result<()>;
    /// Close the current run. Returns the file written, if the sink writes files.
    fn finish(&mut self) -> Result<Option<PathBuf>>;
}

#[derive(Debug, Default)]
pub struct MemorySink {
    pub runs: Vec<(u64, RecordKind)>,
    pub records: Vec<SweepRecord>,
    pub finished: usize,
}

impl MemorySink {
    pub fn new() -> Self {
        Self::default()
    }
}

impl DataSink for MemorySink {
    fn start_run(&mut self, kind: RecordKind) -> Result<u64> {
        let id: u64 = self.runs.len() as u64 + 1;
        self.runs.push((id, kind));
        Ok(id)
    }

    fn add_result(&mut self, record: &SweepRecord) -> Result<()> {
        record.len()?;
        self.records.push(record.clone());
        Ok(())
    }

    fn finish(&mut self) -> Result<Option<PathBuf>> {
        self.finished += 1;
        Ok(None)
    }
}

/// Whitespace separated text tables, one file per run, in the layout of `numpy.savetxt`.
pub struct TextFileSink {
    dir: PathBuf,
    experiment: String,
    run: Option<(u64, RecordKind)>,
    rows: Vec<Vec<f64>>,
    power_dbm: Option<f64>,
}

impl TextFileSink {
    /// Files go to `<data_root>/<cooldown_date>_<sample>/raw/<yy-mm-dd>/`, dated today.
    pub fn new(data_root: &Path, cooldown_date: &str, sample: &str, experiment: &str) -> Self {
        let dir: PathBuf = data_root
            .join(format!("{}_{}", cooldown_date, sample))
            .join("raw")
            .join(Local::now().format("%y-%m-%d").to_string());
        Self::in_directory(dir, experiment)
    }

    pub fn in_directory(dir: impl Into<PathBuf>, experiment: &str) -> Self {
        Self { dir: dir.into(), experiment: experiment.to_owned(), run: None, rows: vec![], power_dbm: None }
    }

    pub fn directory(&self) -> &Path {
        &self.dir
    }

    // One past the largest `<n>_...` prefix already in the directory
    fn next_run_id(&self) -> Result<u64> {
        let entries = fs::read_dir(&self.dir).map_err(|e| Error::storage(&self.dir, e))?;
        let mut max: u64 = 0;
        for entry in entries {
            let entry = entry.map_err(|e| Error::storage(&self.dir, e))?;
            let name: String = entry.file_name().to_string_lossy().into_owned();
            if let Some(Ok(n)) = name.split_once('_').map(|(prefix, _)| prefix.parse::<u64>()) {
                max = max.max(n);
            }
        }
        Ok(max + 1)
    }

    fn file_name(&self, run_id: u64, kind: RecordKind) -> String {
        match kind {
            RecordKind::FrequencySweep => match self.power_dbm {
                // Whole dB only, toward zero
                Some(p) => format!("{}_sweep_{}_{}dB.txt", run_id, self.experiment, p.trunc() as i64),
                None => format!("{}_sweep_{}.txt", run_id, self.experiment),
            },
            RecordKind::PowerSweep => format!("{}_powersweep_{}_all.txt", run_id, self.experiment),
            RecordKind::Snapshot => format!("{}_nosweep_{}.txt", run_id, self.experiment),
        }
    }
}

/// `numpy.savetxt`'s default `%.18e`, which always signs the exponent and pads it to two digits.
pub fn format_savetxt(x: f64) -> String {
    if x.is_nan() {
        return "nan".to_owned();
    }
    if x.is_infinite() {
        return if x > 0.0 { "inf".to_owned() } else { "-inf".to_owned() };
    }

    let s: String = format!("{:.18e}", x);
    match s.split_once('e') {
        Some((mantissa, exp)) => {
            let exp: i32 = exp.parse().unwrap_or(0);
            format!("{}e{}{:02}", mantissa, if exp < 0 { '-' } else { '+' }, exp.abs())
        }
        None => s,
    }
}

impl DataSink for TextFileSink {
    fn start_run(&mut self, kind: RecordKind) -> Result<u64> {
        fs::create_dir_all(&self.dir).map_err(|e| Error::storage(&self.dir, e))?;
        let id: u64 = self.next_run_id()?;
        self.run = Some((id, kind));
        self.rows.clear();
        self.power_dbm = None;
        Ok(id)
    }

    fn add_result(&mut self, record: &SweepRecord) -> Result<()> {
        let (run_id, kind) = self.run.ok_or_else(|| Error::invalid("run", "add_result called before start_run"))?;
        if record.run_id != run_id || record.kind != kind {
            return Err(Error::invalid("run", format!("record for run {} ({:?}) added to run {} ({:?})", record.run_id, record.kind, run_id, kind)));
        }

        let n: usize = record.len()?;
        let mut columns: Vec<&[f64]> = Vec::with_capacity(TRACE_COLUMNS.len());
        for name in TRACE_COLUMNS {
            columns.push(record.column(name).ok_or_else(|| Error::invalid("columns", format!("record has no {} column", name)))?);
        }

        let power: Option<f64> = match kind {
            RecordKind::PowerSweep => Some(record.power_dbm.ok_or_else(|| Error::invalid("power", "power sweep record without a power setpoint"))?),
            _ => None,
        };
        if self.power_dbm.is_none() {
            self.power_dbm = record.power_dbm;
        }

        for i in 0..n {
            let mut row: Vec<f64> = columns.iter().map(|c| c[i]).collect();
            row.extend(power);
            self.rows.push(row);
        }
        Ok(())
    }

    fn finish(&mut self) -> Result<Option<PathBuf>> {
        let (run_id, kind) = match self.run.take() {
            Some(run) => run,
            None => return Ok(None),
        };

        let path: PathBuf = self.dir.join(self.file_name(run_id, kind));
        let file: File = File::create(&path).map_err(|e| Error::storage(&path, e))?;
        let mut w = BufWriter::new(file);
        for row in self.rows.drain(..) {
            let line: Vec<String> = row.into_iter().map(format_savetxt).collect();
            writeln!(w, "{}", line.join(" ")).map_err(|e| Error::storage(&path, e))?;
        }
        w.flush().map_err(|e| Error::storage(&path, e))?;

        info!("Run {} written to {}", run_id, path.display());
        Ok(Some(path))
    }
}
