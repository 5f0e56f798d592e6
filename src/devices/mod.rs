
// Concrete instrument sessions. `vna` talks SCPI over a VXI-11 link; `simulated` is an
// in-process stand-in used by the tests and by `vna_measure --simulate`.

use std::io;

use crate::vxi11::CoreClient;

pub mod simulated;
pub mod vna;

/// Byte-level message exchange with an instrument.
pub trait ScpiTransport {
    fn write(&mut self, data: &[u8]) -> io::Result<()>;
    fn ask(&mut self, data: &[u8]) -> io::Result<Vec<u8>>;
    fn close(&mut self) -> io::Result<()>;
}

impl ScpiTransport for CoreClient {
    fn write(&mut self, data: &[u8]) -> io::Result<()> { CoreClient::write(self, data) }
    fn ask(&mut self, data: &[u8]) -> io::Result<Vec<u8>> { CoreClient::ask(self, data) }

    fn close(&mut self) -> io::Result<()> {
        if self.has_link() { self.destroy_link() } else { Ok(()) }
    }
}
