
// XDR (RFC 4506) encoding for the handful of types VXI-11 uses: 32-bit integers, bools,
// enums and variable-length opaque data. Everything is big-endian and padded to four bytes.

use std::io::{self, Cursor, Error, ErrorKind};

use byteorder::{BigEndian, ReadBytesExt, WriteBytesExt};

fn err(msg: &str) -> io::Error { Error::new(ErrorKind::Other, msg) }

fn padding(len: usize) -> usize { (4 - len % 4) % 4 }

#[derive(Default)]
pub struct Packer {
    buff: Vec<u8>,
}

impl Packer {

    pub fn new() -> Self { Self::default() }

    pub fn reset(&mut self) { self.buff.clear(); }

    pub fn as_bytes(&self) -> &[u8] { &self.buff }

    // These only ever add multiples of four bytes, so alignment is preserved
    pub fn pack_u32(&mut self, x: u32) -> io::Result<()> { self.buff.write_u32::<BigEndian>(x) }
    pub fn pack_i32(&mut self, x: i32) -> io::Result<()> { self.buff.write_i32::<BigEndian>(x) }
    pub fn pack_enum(&mut self, x: i32) -> io::Result<()> { self.pack_i32(x) }
    pub fn pack_bool(&mut self, b: bool) -> io::Result<()> { self.pack_i32(if b { 1 } else { 0 }) }

    pub fn pack_variable_len_opaque(&mut self, data: &[u8]) -> io::Result<()> {
        let len: u32 = u32::try_from(data.len()).map_err(|_| err("Opaque data too long for XDR"))?;
        self.pack_u32(len)?;
        self.buff.extend_from_slice(data);
        self.buff.resize(self.buff.len() + padding(data.len()), 0);
        Ok(())
    }

}

#[derive(Default)]
pub struct Unpacker {
    rdr: Cursor<Vec<u8>>,
}

impl Unpacker {

    pub fn new() -> Self { Self::default() }

    pub fn reset(&mut self, data: &[u8]) {
        self.rdr = Cursor::new(data.to_vec());
    }

    pub fn remaining(&self) -> usize {
        self.rdr.get_ref().len().saturating_sub(self.rdr.position() as usize)
    }

    pub fn all_data_consumed(&self) -> bool { self.remaining() == 0 }

    pub fn unpack_u32(&mut self) -> io::Result<u32> { self.rdr.read_u32::<BigEndian>() }
    pub fn unpack_i32(&mut self) -> io::Result<i32> { self.rdr.read_i32::<BigEndian>() }

    // An enum is an i32 restricted to values only the caller knows about
    pub fn unpack_enum(&mut self) -> io::Result<i32> { self.unpack_i32() }

    pub fn unpack_bool(&mut self) -> io::Result<bool> {
        match self.unpack_i32()? {
            0 => Ok(false),
            1 => Ok(true),
            _ => Err(err("Expected 0 or 1 for an XDR bool")),
        }
    }

    pub fn unpack_variable_len_opaque(&mut self) -> io::Result<Vec<u8>> {
        let n: usize = self.unpack_u32()? as usize;
        if n + padding(n) > self.remaining() {
            return Err(Error::new(ErrorKind::UnexpectedEof, "Opaque length runs past the end of the buffer"));
        }

        let start: usize = self.rdr.position() as usize;
        let ans: Vec<u8> = self.rdr.get_ref()[start..start + n].to_vec();
        self.rdr.set_position((start + n + padding(n)) as u64);
        Ok(ans)
    }

}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn opaque_is_padded_to_four_bytes() {
        let mut p = Packer::new();
        p.pack_variable_len_opaque(b"inst0").unwrap();
        assert_eq!(p.as_bytes(), &[0, 0, 0, 5, b'i', b'n', b's', b't', b'0', 0, 0, 0]);

        let mut u = Unpacker::new();
        u.reset(p.as_bytes());
        assert_eq!(u.unpack_variable_len_opaque().unwrap(), b"inst0");
        assert!(u.all_data_consumed());
    }

    #[test]
    fn short_buffers_are_errors_not_panics() {
        let mut u = Unpacker::new();
        u.reset(&[0, 0, 0, 9, 1, 2]);
        assert!(u.unpack_variable_len_opaque().is_err());

        u.reset(&[0, 0, 0, 2]);
        assert!(u.unpack_bool().is_err());
        u.reset(&[0, 0]);
        assert!(u.unpack_u32().is_err());
    }
}
