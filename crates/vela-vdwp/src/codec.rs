use crate::types::{Location, RefTag, Result, VwpError, VwpValue};

pub const HANDSHAKE: &[u8] = b"VWP-Handshake";
pub const HEADER_LEN: usize = 11;
pub const FLAG_REPLY: u8 = 0x80;

/// Wire tags for [`VwpValue`]. Unlike JDWP, Vela ids are always 8 bytes, so
/// there is no id-size negotiation step.
pub const VALUE_TAG_NIL: u8 = 0;
pub const VALUE_TAG_BOOL: u8 = 1;
pub const VALUE_TAG_INT: u8 = 2;
pub const VALUE_TAG_FLOAT: u8 = 3;
pub const VALUE_TAG_BYTE: u8 = 4;
pub const VALUE_TAG_STR: u8 = 5;
pub const VALUE_TAG_REF: u8 = 6;

pub struct VwpWriter {
    buf: Vec<u8>,
}

impl VwpWriter {
    pub fn new() -> Self {
        Self { buf: Vec::new() }
    }

    pub fn into_vec(self) -> Vec<u8> {
        self.buf
    }

    pub fn write_u8(&mut self, v: u8) {
        self.buf.push(v);
    }

    pub fn write_bool(&mut self, v: bool) {
        self.buf.push(if v { 1 } else { 0 });
    }

    pub fn write_u16(&mut self, v: u16) {
        self.buf.extend_from_slice(&v.to_be_bytes());
    }

    pub fn write_u32(&mut self, v: u32) {
        self.buf.extend_from_slice(&v.to_be_bytes());
    }

    pub fn write_i32(&mut self, v: i32) {
        self.buf.extend_from_slice(&v.to_be_bytes());
    }

    pub fn write_u64(&mut self, v: u64) {
        self.buf.extend_from_slice(&v.to_be_bytes());
    }

    pub fn write_i64(&mut self, v: i64) {
        self.buf.extend_from_slice(&v.to_be_bytes());
    }

    pub fn write_f64(&mut self, v: f64) {
        self.buf.extend_from_slice(&v.to_be_bytes());
    }

    pub fn write_string(&mut self, s: &str) {
        // VWP strings are length-prefixed with a u32 number of bytes.
        self.write_u32(s.len() as u32);
        self.buf.extend_from_slice(s.as_bytes());
    }

    pub fn write_location(&mut self, loc: &Location) {
        self.write_u64(loc.function_id);
        self.write_u64(loc.code_index);
    }

    pub fn write_value(&mut self, v: &VwpValue) {
        match v {
            VwpValue::Nil => self.write_u8(VALUE_TAG_NIL),
            VwpValue::Bool(b) => {
                self.write_u8(VALUE_TAG_BOOL);
                self.write_bool(*b);
            }
            VwpValue::Int(i) => {
                self.write_u8(VALUE_TAG_INT);
                self.write_i64(*i);
            }
            VwpValue::Float(f) => {
                self.write_u8(VALUE_TAG_FLOAT);
                self.write_f64(*f);
            }
            VwpValue::Byte(b) => {
                self.write_u8(VALUE_TAG_BYTE);
                self.write_u8(*b);
            }
            VwpValue::Str(s) => {
                self.write_u8(VALUE_TAG_STR);
                self.write_string(s);
            }
            VwpValue::Ref { id, tag, type_desc } => {
                self.write_u8(VALUE_TAG_REF);
                self.write_u8(tag.to_wire());
                self.write_u64(*id);
                self.write_u64(*type_desc);
            }
        }
    }
}

pub struct VwpReader<'a> {
    buf: &'a [u8],
    pos: usize,
}

impl<'a> VwpReader<'a> {
    pub fn new(buf: &'a [u8]) -> Self {
        Self { buf, pos: 0 }
    }

    fn require(&self, n: usize) -> Result<()> {
        let end = self.pos.checked_add(n).ok_or_else(|| {
            VwpError::Protocol(format!(
                "buffer underflow: need {n} bytes at {}, have {}",
                self.pos,
                self.buf.len()
            ))
        })?;

        if end > self.buf.len() {
            return Err(VwpError::Protocol(format!(
                "buffer underflow: need {n} bytes at {}, have {}",
                self.pos,
                self.buf.len()
            )));
        }
        Ok(())
    }

    pub fn remaining(&self) -> usize {
        self.buf.len().saturating_sub(self.pos)
    }

    pub fn read_u8(&mut self) -> Result<u8> {
        self.require(1)?;
        let v = self.buf[self.pos];
        self.pos += 1;
        Ok(v)
    }

    pub fn read_bool(&mut self) -> Result<bool> {
        Ok(self.read_u8()? != 0)
    }

    pub fn read_u16(&mut self) -> Result<u16> {
        self.require(2)?;
        let v = u16::from_be_bytes([self.buf[self.pos], self.buf[self.pos + 1]]);
        self.pos += 2;
        Ok(v)
    }

    pub fn read_u32(&mut self) -> Result<u32> {
        self.require(4)?;
        let v = u32::from_be_bytes([
            self.buf[self.pos],
            self.buf[self.pos + 1],
            self.buf[self.pos + 2],
            self.buf[self.pos + 3],
        ]);
        self.pos += 4;
        Ok(v)
    }

    pub fn read_i32(&mut self) -> Result<i32> {
        Ok(self.read_u32()? as i32)
    }

    pub fn read_u64(&mut self) -> Result<u64> {
        self.require(8)?;
        let mut be = [0u8; 8];
        be.copy_from_slice(&self.buf[self.pos..self.pos + 8]);
        self.pos += 8;
        Ok(u64::from_be_bytes(be))
    }

    pub fn read_i64(&mut self) -> Result<i64> {
        Ok(self.read_u64()? as i64)
    }

    pub fn read_f64(&mut self) -> Result<f64> {
        Ok(f64::from_bits(self.read_u64()?))
    }

    pub fn read_string(&mut self) -> Result<String> {
        let len = self.read_u32()? as usize;
        self.require(len)?;
        let bytes = &self.buf[self.pos..self.pos + len];
        self.pos += len;
        let mut out = Vec::new();
        out.try_reserve_exact(len).map_err(|_| {
            VwpError::Protocol(format!("unable to allocate string buffer ({len} bytes)"))
        })?;
        out.extend_from_slice(bytes);
        Ok(String::from_utf8(out)?)
    }

    pub fn read_location(&mut self) -> Result<Location> {
        Ok(Location {
            function_id: self.read_u64()?,
            code_index: self.read_u64()?,
        })
    }

    pub fn read_value(&mut self) -> Result<VwpValue> {
        let tag = self.read_u8()?;
        let v = match tag {
            VALUE_TAG_NIL => VwpValue::Nil,
            VALUE_TAG_BOOL => VwpValue::Bool(self.read_bool()?),
            VALUE_TAG_INT => VwpValue::Int(self.read_i64()?),
            VALUE_TAG_FLOAT => VwpValue::Float(self.read_f64()?),
            VALUE_TAG_BYTE => VwpValue::Byte(self.read_u8()?),
            VALUE_TAG_STR => VwpValue::Str(self.read_string()?),
            VALUE_TAG_REF => {
                let ref_tag = RefTag::from_wire(self.read_u8()?);
                VwpValue::Ref {
                    id: self.read_u64()?,
                    tag: ref_tag,
                    type_desc: self.read_u64()?,
                }
            }
            other => {
                return Err(VwpError::Protocol(format!("unknown value tag: {other}")));
            }
        };
        Ok(v)
    }
}

pub fn encode_command(id: u32, command_set: u8, command: u8, payload: &[u8]) -> Vec<u8> {
    let length = (HEADER_LEN + payload.len()) as u32;
    let mut out = Vec::with_capacity(length as usize);
    out.extend_from_slice(&length.to_be_bytes());
    out.extend_from_slice(&id.to_be_bytes());
    out.push(0); // flags
    out.push(command_set);
    out.push(command);
    out.extend_from_slice(payload);
    out
}

pub fn encode_reply(id: u32, error_code: u16, payload: &[u8]) -> Vec<u8> {
    let length = (HEADER_LEN + payload.len()) as u32;
    let mut out = Vec::with_capacity(length as usize);
    out.extend_from_slice(&length.to_be_bytes());
    out.extend_from_slice(&id.to_be_bytes());
    out.push(FLAG_REPLY);
    out.extend_from_slice(&error_code.to_be_bytes());
    out.extend_from_slice(payload);
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn values_round_trip() {
        let values = [
            VwpValue::Nil,
            VwpValue::Bool(true),
            VwpValue::Int(-42),
            VwpValue::Float(2.5),
            VwpValue::Byte(0xfe),
            VwpValue::Str("héllo".to_string()),
            VwpValue::Ref {
                id: 0x1234,
                tag: RefTag::Record,
                type_desc: 9,
            },
        ];
        let mut w = VwpWriter::new();
        for v in &values {
            w.write_value(v);
        }
        let buf = w.into_vec();
        let mut r = VwpReader::new(&buf);
        for v in &values {
            assert_eq!(&r.read_value().unwrap(), v);
        }
        assert_eq!(r.remaining(), 0);
    }

    #[test]
    fn reader_reports_underflow() {
        let mut r = VwpReader::new(&[0, 0]);
        let err = r.read_u32().unwrap_err();
        assert!(matches!(err, VwpError::Protocol(_)));
    }

    #[test]
    fn command_and_reply_headers() {
        let cmd = encode_command(7, 1, 2, &[0xaa]);
        assert_eq!(cmd.len(), HEADER_LEN + 1);
        assert_eq!(&cmd[..4], &12u32.to_be_bytes());
        assert_eq!(&cmd[4..8], &7u32.to_be_bytes());
        assert_eq!(cmd[8], 0);
        assert_eq!(cmd[9], 1);
        assert_eq!(cmd[10], 2);

        let reply = encode_reply(7, 10, &[]);
        assert_eq!(reply[8], FLAG_REPLY);
        assert_eq!(&reply[9..11], &10u16.to_be_bytes());
    }
}
