
use std::io::Cursor;
use std::str;
use std::time::Duration;

use byteorder::{LittleEndian, ReadBytesExt};
use lazy_static::lazy_static;
use log::{debug, warn};
use regex::{Captures, Regex};
use serde::{Deserialize, Serialize};

use crate::devices::ScpiTransport;
use crate::error::{Error, Result};
use crate::session::{InstrumentSession, SweepMode, TraceFormat, TriggerSource, VnaSession};
use crate::vxi11::CoreClient;

lazy_static! {
    static ref IDN_RE: Regex    = Regex::new("([^,]+),([^,]+),([^,]+),([^,\\s]+)").unwrap();
    static ref NUMBER_RE: Regex = Regex::new("^\\s*\"?([-+]?(?:\\d+\\.?\\d*|\\.\\d+)(?:[eE][-+]?\\d+)?)").unwrap();
    static ref SPARAM_RE: Regex = Regex::new("^S([1-9])([1-9])$").unwrap();
    static ref VISA_RE: Regex   = Regex::new("(?i)^TCPIP\\d*::([^:]+)(?:::([^:]+))?(?:::INSTR)?$").unwrap();
}

pub const IF_BANDWIDTHS_HZ: [u32; 15] = [10, 20, 30, 50, 70, 100, 200, 300, 500, 700, 1000, 3000, 5000, 7000, 10000];
pub const MIN_POINTS: usize = 2;
pub const MAX_POINTS: usize = 20001;

/// Fixed properties of a VNA model and the few places its SCPI dialect differs.
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct VnaModel {
    pub name: &'static str,
    pub min_freq_hz: f64,
    pub max_freq_hz: f64,
    pub min_power_dbm: f64,
    pub max_power_dbm: f64,
    pub nports: u8,
    sweep_mode_cmd: &'static str,
    power_cmd: &'static str,
    measured_parameter_cmd: &'static str,
    quote_measured_parameter: bool,
    fetch_cmd: &'static str,
    binary_setup: &'static [&'static str],
}

pub const KEYSIGHT_P9373A: VnaModel = VnaModel {
    name: "P9373A",
    min_freq_hz: 300e3,
    max_freq_hz: 13.5e9,
    min_power_dbm: -90.0,
    max_power_dbm: 13.0,
    nports: 2,
    sweep_mode_cmd: "SENS:SWE:MODE",
    power_cmd: "SOUR:POW1",
    measured_parameter_cmd: "CALC:PAR:MOD:EXT",
    quote_measured_parameter: true,
    fetch_cmd: "CALC:DATA? FDATA",
    binary_setup: &["FORM:DATA REAL,32", "FORM:BORD SWAP"],
};

pub const ANRITSU_MS46522B: VnaModel = VnaModel {
    name: "MS46522B",
    min_freq_hz: 50e6,
    max_freq_hz: 20e9,
    min_power_dbm: -30.0,
    max_power_dbm: 30.0,
    nports: 2,
    sweep_mode_cmd: ":SENS:HOLD:FUNC",
    power_cmd: ":SOUR:POW:PORT",
    measured_parameter_cmd: ":CALC1:PAR:DEF",
    quote_measured_parameter: false,
    fetch_cmd: "CALC:DATA:FDAT?",
    binary_setup: &["FORM:DATA REAL32"],
};

impl VnaModel {
    pub fn by_name(name: &str) -> Option<VnaModel> {
        [KEYSIGHT_P9373A, ANRITSU_MS46522B].into_iter().find(|m| m.name.eq_ignore_ascii_case(name.trim()))
    }

    pub fn check_frequency(&self, name: &'static str, hz: f64) -> Result<()> {
        if !(self.min_freq_hz..=self.max_freq_hz).contains(&hz) {
            return Err(Error::invalid(name, format!("{} Hz outside {}..{} Hz for {}", hz, self.min_freq_hz, self.max_freq_hz, self.name)));
        }
        Ok(())
    }

    pub fn check_power(&self, dbm: f64) -> Result<()> {
        if !(self.min_power_dbm..=self.max_power_dbm).contains(&dbm) {
            return Err(Error::invalid("power", format!("{} dBm outside {}..{} dBm for {}", dbm, self.min_power_dbm, self.max_power_dbm, self.name)));
        }
        Ok(())
    }

    pub fn check_span(&self, hz: f64) -> Result<()> {
        if !(hz > 0.0 && hz <= self.max_freq_hz - self.min_freq_hz) {
            return Err(Error::invalid("span", format!("{} Hz does not fit in the range of {}", hz, self.name)));
        }
        Ok(())
    }

    pub fn check_points(&self, points: usize) -> Result<()> {
        if !(MIN_POINTS..=MAX_POINTS).contains(&points) {
            return Err(Error::invalid("points", format!("{} outside {}..{}", points, MIN_POINTS, MAX_POINTS)));
        }
        Ok(())
    }

    pub fn check_if_bandwidth(&self, hz: u32) -> Result<()> {
        if !IF_BANDWIDTHS_HZ.contains(&hz) {
            return Err(Error::invalid("if_bandwidth", format!("{} Hz is not one of {:?}", hz, IF_BANDWIDTHS_HZ)));
        }
        Ok(())
    }

    pub fn check_measured_parameter(&self, s_param: &str) -> Result<()> {
        let cap: Captures = SPARAM_RE
            .captures(s_param)
            .ok_or_else(|| Error::invalid("trace", format!("{:?} is not of the form S<i><j>", s_param)))?;
        for port in [&cap[1], &cap[2]] {
            let n: u8 = port.parse().unwrap_or(0);
            if n == 0 || n > self.nports {
                return Err(Error::invalid("trace", format!("{} has only {} ports", self.name, self.nports)));
            }
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Identity {
    pub manufacturer: String,
    pub model: String,
    pub serial_num: String,
    pub fw_version: String,
}

pub fn parse_identity(idn: &str) -> Result<Identity> {
    let cap: Captures = IDN_RE.captures(idn).ok_or_else(|| Error::unexpected("*IDN?", idn))?;
    Ok(Identity {
        manufacturer: cap[1].trim().to_owned(),
        model: cap[2].trim().to_owned(),
        serial_num: cap[3].trim().to_owned(),
        fw_version: cap[4].trim().to_owned(),
    })
}

fn parse_number(command: &str, response: &str) -> Result<f64> {
    NUMBER_RE
        .captures(response)
        .and_then(|c| c[1].parse::<f64>().ok())
        .ok_or_else(|| Error::unexpected(command, response))
}

/// Decode an IEEE 488.2 block of little-endian `f32` values.
///
/// Accepts the definite form `#<n><len><payload>` and the indefinite form `#0<payload>\n`.
pub fn parse_real32_block(command: &str, raw: &[u8]) -> Result<Vec<f64>> {
    let bad = |why: &str| Error::unexpected(command, &format!("{} ({} bytes)", why, raw.len()));

    let start: usize = raw.iter().position(|b| *b == b'#').ok_or_else(|| bad("missing block header"))?;
    let n_digits: usize = raw
        .get(start + 1)
        .and_then(|d| (*d as char).to_digit(10))
        .ok_or_else(|| bad("bad block header"))? as usize;

    let payload: &[u8] = if n_digits == 0 {
        let body: &[u8] = &raw[start + 2..];
        body.strip_suffix(b"\n").unwrap_or(body)
    } else {
        let len_field: &[u8] = raw.get(start + 2..start + 2 + n_digits).ok_or_else(|| bad("truncated block length"))?;
        let len: usize = str::from_utf8(len_field)
            .ok()
            .and_then(|s| s.parse::<usize>().ok())
            .ok_or_else(|| bad("non-numeric block length"))?;
        let body_start: usize = start + 2 + n_digits;
        raw.get(body_start..body_start + len).ok_or_else(|| bad("truncated block payload"))?
    };

    if payload.len() % 4 != 0 {
        return Err(bad("payload is not a whole number of f32 values"));
    }

    let mut rdr = Cursor::new(payload);
    let mut ans: Vec<f64> = Vec::with_capacity(payload.len() / 4);
    for _ in 0..payload.len() / 4 {
        ans.push(rdr.read_f32::<LittleEndian>().map_err(|_| bad("short read"))? as f64);
    }
    Ok(ans)
}

/// Split a VISA `TCPIP[n]::<host>[::<device>]::INSTR` resource into host and VXI-11
/// device name. A bare host name means `inst0`.
pub fn parse_resource(address: &str) -> Result<(String, String)> {
    let address: &str = address.trim();
    if !address.contains("::") {
        if address.is_empty() {
            return Err(Error::invalid("address", "must not be empty"));
        }
        return Ok((address.to_owned(), "inst0".to_owned()));
    }

    let cap: Captures = VISA_RE
        .captures(address)
        .ok_or_else(|| Error::invalid("address", format!("{:?} is not a TCPIP VISA resource", address)))?;
    let host: String = cap[1].to_owned();
    let device: String = match cap.get(2).map(|m| m.as_str()) {
        Some(d) if !d.eq_ignore_ascii_case("INSTR") => d.to_owned(),
        _ => "inst0".to_owned(),
    };
    if device.to_ascii_lowercase().starts_with("hislip") {
        return Err(Error::invalid("address", format!("{} is a HiSLIP device; only VXI-11 devices such as inst0 are supported", device)));
    }
    Ok((host, device))
}

pub struct Vna<T: ScpiTransport = CoreClient> {
    transport: T,
    model: VnaModel,
    identity: Identity,
}

impl Vna<CoreClient> {

    /// Open a VXI-11 link to the instrument at a VISA resource string or host name.
    pub fn open(address: &str, model: VnaModel, io_timeout: Duration) -> Result<Self> {
        let (host, device) = parse_resource(address)?;
        Vna::connect(&host, &device, model, io_timeout)
    }

    pub fn connect(host: &str, device: &str, model: VnaModel, io_timeout: Duration) -> Result<Self> {
        let mut core = CoreClient::new(host, io_timeout)?;
        core.create_link(device)?;
        core.clear()?;
        Vna::with_transport(core, model)
    }

}

impl<T: ScpiTransport> Vna<T> {

    /// Wrap an open transport, check that the instrument is the expected model and
    /// switch trace transfers to binary.
    pub fn with_transport(transport: T, model: VnaModel) -> Result<Self> {
        let mut vna = Self { transport, model, identity: Identity::default() };

        let idn: String = vna.ask_str("*IDN?")?;
        let identity: Identity = parse_identity(&idn)?;
        if !identity.model.contains(model.name) {
            return Err(Error::invalid("model", format!("connected to {:?} but expected {}", identity.model, model.name)));
        }
        vna.identity = identity;

        for cmd in model.binary_setup {
            vna.write_str(cmd)?;
        }

        Ok(vna)
    }

    pub fn model(&self) -> &VnaModel { &self.model }
    pub fn identity(&self) -> &Identity { &self.identity }

    pub fn write_str(&mut self, cmd: &str) -> Result<()> {
        debug!("-> {}", cmd);
        self.transport.write(cmd.as_bytes())?;
        Ok(())
    }

    pub fn ask_str(&mut self, cmd: &str) -> Result<String> {
        let raw: Vec<u8> = self.transport.ask(cmd.as_bytes())?;
        let res: String = str::from_utf8(&raw).map_err(|_| Error::unexpected(cmd, "<non UTF-8 response>"))?.trim_end().to_owned();
        debug!("<- {} = {}", cmd, res);
        Ok(res)
    }

    fn ask_number(&mut self, cmd: &str) -> Result<f64> {
        let res: String = self.ask_str(cmd)?;
        parse_number(cmd, &res)
    }
}

impl<T: ScpiTransport> InstrumentSession for Vna<T> {

    fn get_mode(&mut self) -> Result<SweepMode> {
        let cmd: String = format!("{}?", self.model.sweep_mode_cmd);
        let res: String = self.ask_str(&cmd)?;
        res.parse::<SweepMode>().map_err(|_| Error::unexpected(&cmd, &res))
    }

    fn set_mode(&mut self, mode: SweepMode) -> Result<()> {
        let cmd: String = format!("{} {}", self.model.sweep_mode_cmd, mode.scpi());
        self.write_str(&cmd)
    }

    fn get_trigger_source(&mut self) -> Result<TriggerSource> {
        let res: String = self.ask_str("TRIG:SOUR?")?;
        res.parse::<TriggerSource>().map_err(|_| Error::unexpected("TRIG:SOUR?", &res))
    }

}

impl<T: ScpiTransport> VnaSession for Vna<T> {

    fn get_power(&mut self) -> Result<f64> {
        let cmd: String = format!("{}?", self.model.power_cmd);
        self.ask_number(&cmd)
    }

    fn set_power(&mut self, dbm: f64) -> Result<()> {
        self.model.check_power(dbm)?;
        let cmd: String = format!("{} {:.2}", self.model.power_cmd, dbm);
        self.write_str(&cmd)
    }

    fn get_start_frequency(&mut self) -> Result<f64> { self.ask_number("SENS:FREQ:STAR?") }
    fn get_stop_frequency(&mut self) -> Result<f64> { self.ask_number("SENS:FREQ:STOP?") }

    fn set_start_frequency(&mut self, hz: f64) -> Result<()> {
        self.model.check_frequency("start", hz)?;
        self.write_str(&format!("SENS:FREQ:STAR {:.4}", hz))
    }

    fn set_stop_frequency(&mut self, hz: f64) -> Result<()> {
        self.model.check_frequency("stop", hz)?;
        self.write_str(&format!("SENS:FREQ:STOP {:.4}", hz))
    }

    fn set_center_frequency(&mut self, hz: f64) -> Result<()> {
        self.model.check_frequency("center", hz)?;
        self.write_str(&format!("SENS:FREQ:CENT {:.4}", hz))
    }

    fn set_span(&mut self, hz: f64) -> Result<()> {
        self.model.check_span(hz)?;
        self.write_str(&format!("SENS:FREQ:SPAN {:.4}", hz))
    }

    fn get_points(&mut self) -> Result<usize> {
        let n: f64 = self.ask_number("SENS:SWE:POIN?")?;
        if n < 0.0 || n.fract() != 0.0 {
            return Err(Error::unexpected("SENS:SWE:POIN?", &n.to_string()));
        }
        Ok(n as usize)
    }

    fn set_points(&mut self, points: usize) -> Result<()> {
        self.model.check_points(points)?;
        self.write_str(&format!("SENS:SWE:POIN {}", points))
    }

    fn set_if_bandwidth(&mut self, hz: u32) -> Result<()> {
        self.model.check_if_bandwidth(hz)?;
        self.write_str(&format!("SENS:BWID {}", hz))
    }

    fn set_measured_parameter(&mut self, s_param: &str) -> Result<()> {
        let s_param: String = s_param.trim().to_ascii_uppercase();
        self.model.check_measured_parameter(&s_param)?;
        let cmd: String = if self.model.quote_measured_parameter {
            format!("{} \"{}\"", self.model.measured_parameter_cmd, s_param)
        } else {
            format!("{} {}", self.model.measured_parameter_cmd, s_param)
        };
        self.write_str(&cmd)
    }

    fn fetch_trace(&mut self, format: TraceFormat) -> Result<Vec<f64>> {
        self.write_str(&format!("CALC:FORM {}", format.scpi()))?;

        let cmd: &str = self.model.fetch_cmd;
        debug!("-> {}", cmd);
        let raw: Vec<u8> = self.transport.ask(cmd.as_bytes())?;
        let data: Vec<f64> = parse_real32_block(cmd, &raw)?;
        debug!("<- {} ({} points, {})", cmd, data.len(), format.scpi());
        Ok(data)
    }

}

impl<T: ScpiTransport> Drop for Vna<T> {

    fn drop(&mut self) {
        if let Err(e) = self.transport.close() {
            warn!("Unable to close link to {}: {}", self.model.name, e);
        }
    }

}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::VecDeque;
    use std::io;

    // Records writes and replays canned answers in order
    #[derive(Default)]
    struct FakePort {
        written: Vec<String>,
        answers: VecDeque<Vec<u8>>,
    }

    impl FakePort {
        fn answering(answers: &[&[u8]]) -> Self {
            Self { written: vec![], answers: answers.iter().map(|a| a.to_vec()).collect() }
        }
    }

    impl ScpiTransport for FakePort {
        fn write(&mut self, data: &[u8]) -> io::Result<()> {
            self.written.push(String::from_utf8_lossy(data).into_owned());
            Ok(())
        }
        fn ask(&mut self, data: &[u8]) -> io::Result<Vec<u8>> {
            self.write(data)?;
            self.answers.pop_front().ok_or_else(|| io::Error::new(io::ErrorKind::TimedOut, "no answer queued"))
        }
        fn close(&mut self) -> io::Result<()> { Ok(()) }
    }

    const KEYSIGHT_IDN: &[u8] = b"Keysight Technologies,P9373A,MY12345678,A.13.65.10\n";
    const ANRITSU_IDN: &[u8] = b"ANRITSU,MS46522B,1234,1.0\n";

    fn block(values: &[f32]) -> Vec<u8> {
        let payload: Vec<u8> = values.iter().flat_map(|v| v.to_le_bytes()).collect();
        let len: String = payload.len().to_string();
        let mut out: Vec<u8> = format!("#{}{}", len.len(), len).into_bytes();
        out.extend_from_slice(&payload);
        out.push(b'\n');
        out
    }

    #[test]
    fn identity_is_checked_and_binary_format_selected() {
        let vna = Vna::with_transport(FakePort::answering(&[KEYSIGHT_IDN]), KEYSIGHT_P9373A).unwrap();
        assert_eq!(vna.identity().serial_num, "MY12345678");
        assert_eq!(vna.transport.written, vec!["*IDN?", "FORM:DATA REAL,32", "FORM:BORD SWAP"]);

        let wrong = Vna::with_transport(FakePort::answering(&[KEYSIGHT_IDN]), ANRITSU_MS46522B);
        assert!(matches!(wrong, Err(Error::InvalidParameter { name: "model", .. })));
    }

    #[test]
    fn sweep_mode_uses_model_dialect() {
        let mut vna = Vna::with_transport(FakePort::answering(&[KEYSIGHT_IDN, b"SING\n", b"EXT\n"]), KEYSIGHT_P9373A).unwrap();
        assert_eq!(vna.get_mode().unwrap(), SweepMode::Single);
        vna.set_mode(SweepMode::Continuous).unwrap();
        assert_eq!(vna.get_trigger_source().unwrap(), TriggerSource::External);
        assert!(vna.transport.written.contains(&"SENS:SWE:MODE?".to_owned()));
        assert!(vna.transport.written.contains(&"SENS:SWE:MODE CONT".to_owned()));
    }

    #[test]
    fn out_of_range_values_are_not_sent() {
        let mut vna = Vna::with_transport(FakePort::answering(&[ANRITSU_IDN]), ANRITSU_MS46522B).unwrap();
        let sent: usize = vna.transport.written.len();
        assert!(vna.set_power(31.0).is_err());
        assert!(vna.set_start_frequency(300e3).is_err());
        assert!(vna.set_points(1).is_err());
        assert!(vna.set_if_bandwidth(15).is_err());
        assert!(vna.set_measured_parameter("S31").is_err());
        assert_eq!(vna.transport.written.len(), sent);

        vna.set_measured_parameter("s21").unwrap();
        vna.set_power(-10.0).unwrap();
        assert_eq!(vna.transport.written[sent..].to_vec(), vec![":CALC1:PAR:DEF S21", ":SOUR:POW:PORT -10.00"]);
    }

    #[test]
    fn numeric_queries_tolerate_vendor_formatting() {
        let mut vna = Vna::with_transport(FakePort::answering(&[KEYSIGHT_IDN, b"+3.00000000000E+005\n", b"201\n"]), KEYSIGHT_P9373A).unwrap();
        assert_eq!(vna.get_start_frequency().unwrap(), 300e3);
        assert_eq!(vna.get_points().unwrap(), 201);
    }

    #[test]
    fn trace_fetch_decodes_block() {
        let data = block(&[-1.5, 0.25, 3.0]);
        let mut vna = Vna::with_transport(FakePort::answering(&[KEYSIGHT_IDN, data.as_slice()]), KEYSIGHT_P9373A).unwrap();
        assert_eq!(vna.fetch_trace(TraceFormat::Phase).unwrap(), vec![-1.5, 0.25, 3.0]);
        assert!(vna.transport.written.contains(&"CALC:FORM PHAS".to_owned()));
    }

    #[test]
    fn malformed_blocks_are_rejected() {
        assert!(parse_real32_block("q", b"no header").is_err());
        assert!(parse_real32_block("q", b"#15abc").is_err());
        assert!(parse_real32_block("q", b"#3012\x00\x00").is_err());
        assert_eq!(parse_real32_block("q", b"#0\x00\x00\x80\x3f\n").unwrap(), vec![1.0]);
    }

    #[test]
    fn visa_resources_are_split() {
        assert_eq!(parse_resource("TCPIP0::192.168.1.40::inst0::INSTR").unwrap(), ("192.168.1.40".to_owned(), "inst0".to_owned()));
        assert_eq!(parse_resource("tcpip::vna.lab::gpib0,16::instr").unwrap(), ("vna.lab".to_owned(), "gpib0,16".to_owned()));
        assert_eq!(parse_resource("TCPIP0::vna.lab::INSTR").unwrap(), ("vna.lab".to_owned(), "inst0".to_owned()));
        assert_eq!(parse_resource(" vna.lab ").unwrap(), ("vna.lab".to_owned(), "inst0".to_owned()));
        assert!(parse_resource("TCPIP0::vna.lab::hislip0::INSTR").is_err());
        assert!(parse_resource("GPIB0::16::INSTR").is_err());
    }

    #[test]
    fn model_lookup_is_case_insensitive() {
        assert_eq!(VnaModel::by_name("p9373a"), Some(KEYSIGHT_P9373A));
        assert_eq!(VnaModel::by_name(" MS46522B "), Some(ANRITSU_MS46522B));
        assert!(VnaModel::by_name("N5230C").is_none());
    }
}
