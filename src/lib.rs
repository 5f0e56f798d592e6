
// Crate-wide error type and result alias
pub mod error;

// Sweep modes, trigger sources and the traits a VNA session implements
pub mod session;

// Trigger one sweep and wait for the instrument to leave single-sweep mode
pub mod sweep;

// At most one open session per instrument address
pub mod registry;

// External data representation, a protocol for serializing data to be sent over the network
pub mod xdr;

// Remote procedure call, a protocol built on top of XDR to provide something like C-style function calls over the network
pub mod rpc;

// The VXI-11 core channel, which carries SCPI to LAN instruments
pub mod vxi11;

// Concrete sessions: SCPI VNAs over VXI-11 and a simulated VNA
pub mod devices;

// Destinations for sweep results
pub mod sink;

// Frequency sweeps, power sweeps and snapshots built on the sweep controller
pub mod measurement;

// TOML measurement configuration
pub mod config;

pub use error::{Error, Result};
pub use session::{InstrumentSession, Interrupt, SweepMode, TraceFormat, TriggerSource, VnaSession};
pub use sweep::{run_sweep, SweepController, SweepOptions};
