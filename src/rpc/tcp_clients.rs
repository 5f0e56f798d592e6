
use std::io::{self, Read, Write, Error, ErrorKind};
use std::net::{TcpStream, ToSocketAddrs};
use std::time::Duration;

use byteorder::{BigEndian, WriteBytesExt, ReadBytesExt};
use log::trace;

use crate::xdr;
use super::{xdr_pack, xdr_unpack};

const LAST_FRAGMENT:u32 = 0x8000_0000;

// Record-marked RPC over TCP (RFC 5531 section 11). One outstanding call at a time.
pub struct TcpClient {
    stream: TcpStream,
    pub prog: u32,
    pub vers: u32,
    pub lastxid: u32,
    pub packer: xdr::Packer,
    pub unpacker: xdr::Unpacker,
}

impl TcpClient {

    pub fn connect<A: ToSocketAddrs>(addr: A, prog: u32, vers: u32, io_timeout: Duration) -> io::Result<Self> {
        let stream = TcpStream::connect(addr)?;
        stream.set_read_timeout(Some(io_timeout))?;
        stream.set_write_timeout(Some(io_timeout))?;
        stream.set_nodelay(true)?;
        Ok(Self{ stream, prog, vers, lastxid: 0, packer: xdr::Packer::new(), unpacker: xdr::Unpacker::new() })
    }

    // Bump the xid and write a call header for `prc`; arguments are packed by the caller afterwards
    pub fn start_call(&mut self, prc:u32) -> io::Result<()> {
        self.lastxid = self.lastxid.wrapping_add(1);
        self.packer.reset();
        xdr_pack::pack_callheader_no_auth(&mut self.packer, self.lastxid, self.prog, self.vers, prc)
    }

    // Send what's in the packer and load the matching reply's results into the unpacker
    pub fn do_call(&mut self) -> io::Result<()> {
        let call:&[u8] = self.packer.as_bytes();
        if call.len() as u32 >= LAST_FRAGMENT {
            return Err(Error::new(ErrorKind::Other, "RPC call too large for a single fragment"));
        }

        let mut send_bytes:Vec<u8> = Vec::with_capacity(call.len() + 4);
        send_bytes.write_u32::<BigEndian>(call.len() as u32 | LAST_FRAGMENT)?;
        send_bytes.extend_from_slice(call);
        self.stream.write_all(&send_bytes)?;
        trace!("RPC call xid={} prog={:#x} ({} bytes)", self.lastxid, self.prog, call.len());

        loop {
            let reply:Vec<u8> = self.read_record()?;
            self.unpacker.reset(&reply);

            let xid:u32 = xdr_unpack::unpack_replyheader(&mut self.unpacker)?;
            if xid == self.lastxid {
                return Ok(());
            } else if xid < self.lastxid {
                // Late reply to a call we already gave up on
                continue;
            } else {
                return Err(Error::new(ErrorKind::Other, "Received a reply for an xid that hasn't been sent"));
            }
        }
    }

    fn read_record(&mut self) -> io::Result<Vec<u8>> {
        let mut record:Vec<u8> = vec![];
        loop {
            let marker:u32 = self.stream.read_u32::<BigEndian>()?;
            let n:usize = (marker & !LAST_FRAGMENT) as usize;

            let start:usize = record.len();
            record.resize(start + n, 0);
            self.stream.read_exact(&mut record[start..])?;

            if marker & LAST_FRAGMENT != 0 { return Ok(record); }
        }
    }

}
