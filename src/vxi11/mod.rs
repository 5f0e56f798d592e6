// VXI-11 core channel (TCP/IP Instrument Protocol Specification, VXIbus Consortium)

// Device core
pub const DEVICE_CORE_PROG:u32  = 0x0607af;
pub const DEVICE_CORE_VERS:u32  = 1;
pub const CREATE_LINK:u32       = 10;
pub const DEVICE_WRITE:u32      = 11;
pub const DEVICE_READ:u32       = 12;
pub const DEVICE_CLEAR:u32      = 15;
pub const DESTROY_LINK:u32      = 23;

pub const CLIENT_ID:i32 = 3333;
pub const DEFAULT_LOCK_TIMEOUT_MS:u32 = 10000;
pub const DEFAULT_IO_TIMEOUT_MS:u32 = 10000;

pub const OPERATION_FLAGS_END_ONLY:i32 = 8;

// Read termination reasons
pub const REASON_REQCNT:i32 = 1;
pub const REASON_CHR:i32    = 2;
pub const REASON_END:i32    = 4;

use std::io::{self, Error, ErrorKind};
use std::time::Duration;

use log::debug;

use crate::rpc::IPPROTO_TCP;
use crate::rpc::port_mapping::{TcpPortMapperClient, Mapping};
use crate::rpc::tcp_clients::TcpClient;

fn err(msg:&str) -> io::Error { Error::new(ErrorKind::Other, msg) }

pub mod xdr_pack;

// Device error codes from the VXI-11 spec, table B.2
fn device_error(code:i32) -> io::Result<()> {
    let msg:&str = match code {
        0  => return Ok(()),
        1  => "Syntax error",
        3  => "Device not accessible",
        4  => "Invalid link identifier",
        5  => "Parameter error",
        6  => "Channel not established",
        8  => "Operation not supported",
        9  => "Out of resources",
        11 => "Device locked by another link",
        12 => "No lock held by this link",
        15 => return Err(Error::new(ErrorKind::TimedOut, "VXI-11 I/O timeout")),
        17 => "I/O error",
        21 => "Invalid address",
        23 => "Abort",
        29 => "Channel already established",
        _  => "Unknown error",
    };
    Err(Error::new(ErrorKind::Other, format!("VXI-11 device error {}: {}", code, msg)))
}

pub struct Link {
    pub link_id: i32,
    pub abort_port: u32,
    pub max_recv_size: u32,
}

pub struct CoreClient {
    client: TcpClient,
    opt_link: Option<Link>,
    io_timeout_ms: u32,
}

impl CoreClient {

    fn get_link(&self) -> io::Result<&Link> {
        self.opt_link.as_ref().ok_or_else(|| err("No link"))
    }

    pub fn new(host:&str, io_timeout:Duration) -> io::Result<Self> {
        // Find the port to use for the core program
        let mut pmap_client = TcpPortMapperClient::new(host, io_timeout)?;
        let mapping = Mapping {
            program: DEVICE_CORE_PROG,
            version: DEVICE_CORE_VERS,
            protocol: IPPROTO_TCP,
            port: 0,
        };
        let port:u16 = pmap_client.get_port(&mapping)?;
        debug!("VXI-11 core channel for {} on port {}", host, port);

        // The socket timeout has to outlast the device-side timeout or every slow read looks like a dead link
        let io_timeout_ms:u32 = u32::try_from(io_timeout.as_millis()).unwrap_or(u32::MAX);
        let socket_timeout:Duration = io_timeout + Duration::from_secs(2);
        let client = TcpClient::connect((host, port), DEVICE_CORE_PROG, DEVICE_CORE_VERS, socket_timeout)?;

        Ok(CoreClient { client, opt_link: None, io_timeout_ms })
    }

    pub fn create_link(&mut self, device:&str) -> io::Result<()> {
        if self.opt_link.is_some() {
            return Err(err("Already connected to a link"));
        }

        self.client.start_call(CREATE_LINK)?;
        xdr_pack::pack_create_link_parms(&mut self.client.packer, CLIENT_ID, false, DEFAULT_LOCK_TIMEOUT_MS, device)?;
        self.client.do_call()?;

        let error:i32         = self.client.unpacker.unpack_i32()?;
        let link_id:i32       = self.client.unpacker.unpack_i32()?;
        let abort_port:u32    = self.client.unpacker.unpack_u32()?;
        let max_recv_size:u32 = self.client.unpacker.unpack_u32()?;

        device_error(error)?;
        self.opt_link = Some(Link{ link_id, abort_port, max_recv_size });
        Ok(())
    }

    pub fn has_link(&self) -> bool { self.opt_link.is_some() }

    pub fn ask(&mut self, data:&[u8]) -> io::Result<Vec<u8>> {
        self.write(data)?;
        self.read()
    }

    pub fn write(&mut self, data:&[u8]) -> io::Result<()> {
        let link:&Link = self.get_link()?;
        let (link_id, max_recv_size) = (link.link_id, link.max_recv_size as usize);

        // Anything longer than the device's receive buffer goes out in chunks; only the last carries END
        let chunk_size:usize = if max_recv_size == 0 { data.len().max(1) } else { max_recv_size };
        let mut chunks = data.chunks(chunk_size).peekable();
        while let Some(chunk) = chunks.next() {
            let flags:i32 = if chunks.peek().is_none() { OPERATION_FLAGS_END_ONLY } else { 0 };

            self.client.start_call(DEVICE_WRITE)?;
            xdr_pack::pack_device_write_parms(&mut self.client.packer, link_id, self.io_timeout_ms, DEFAULT_LOCK_TIMEOUT_MS, flags, chunk)?;
            self.client.do_call()?;

            let error:i32 = self.client.unpacker.unpack_i32()?;
            let size:u32  = self.client.unpacker.unpack_u32()?;
            device_error(error)?;

            if size as usize != chunk.len() {
                return Err(err("Number of bytes in confirmation doesn't match number of bytes sent"));
            }
        }

        Ok(())
    }

    pub fn read(&mut self) -> io::Result<Vec<u8>> {
        let link_id:i32 = self.get_link()?.link_id;
        let mut ans:Vec<u8> = vec![];

        // A large binary block can arrive over several reads; keep going until END is set
        loop {
            self.client.start_call(DEVICE_READ)?;
            xdr_pack::pack_device_read_parms(&mut self.client.packer, link_id, u32::MAX, self.io_timeout_ms, DEFAULT_LOCK_TIMEOUT_MS, 0, 0)?;
            self.client.do_call()?;

            let error:i32     = self.client.unpacker.unpack_i32()?;
            let reason:i32    = self.client.unpacker.unpack_i32()?;
            let mut data:Vec<u8> = self.client.unpacker.unpack_variable_len_opaque()?;
            device_error(error)?;

            ans.append(&mut data);
            if reason & REASON_END != 0 { return Ok(ans); }
            if reason & (REASON_REQCNT | REASON_CHR) == 0 {
                return Err(err("Expected one of three reason bits to be set"));
            }
        }
    }

    // Device clear: aborts whatever the instrument is doing with its input and output buffers
    pub fn clear(&mut self) -> io::Result<()> {
        let link_id:i32 = self.get_link()?.link_id;
        self.client.start_call(DEVICE_CLEAR)?;
        xdr_pack::pack_device_generic_parms(&mut self.client.packer, link_id, 0, DEFAULT_LOCK_TIMEOUT_MS, self.io_timeout_ms)?;
        self.client.do_call()?;
        device_error(self.client.unpacker.unpack_i32()?)
    }

    pub fn destroy_link(&mut self) -> io::Result<()> {
        let link_id:i32 = match self.opt_link.take() {
            Some(link) => link.link_id,
            None => return Err(err("No link to destroy")),
        };

        self.client.start_call(DESTROY_LINK)?;
        self.client.packer.pack_i32(link_id)?;
        self.client.do_call()?;

        device_error(self.client.unpacker.unpack_i32()?)
    }

}
