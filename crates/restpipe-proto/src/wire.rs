//! Length-delimited tag-value primitives used by the payload codec.
//!
//! Keys and integer fields are varints; strings and byte fields are
//! length-delimited. The layout matches the protobuf wire format for the
//! flat schemas this crate defines, so either peer could be regenerated
//! from a schema compiler without changing the bytes.

pub(crate) const WIRE_VARINT: u8 = 0;
pub(crate) const WIRE_LEN: u8 = 2;

const MAX_VARINT_BYTES: usize = 10;

pub(crate) fn put_varint(buf: &mut Vec<u8>, mut value: u64) {
    loop {
        let byte = (value & 0x7f) as u8;
        value >>= 7;
        if value == 0 {
            buf.push(byte);
            return;
        }
        buf.push(byte | 0x80);
    }
}

fn put_key(buf: &mut Vec<u8>, field: u32, wire_type: u8) {
    put_varint(buf, (u64::from(field) << 3) | u64::from(wire_type));
}

/// Writes a varint field, omitting the zero default.
pub(crate) fn put_uint_field(buf: &mut Vec<u8>, field: u32, value: u64) {
    if value != 0 {
        put_key(buf, field, WIRE_VARINT);
        put_varint(buf, value);
    }
}

/// Writes a signed 32-bit field, sign-extended to 64 bits on the wire.
pub(crate) fn put_int32_field(buf: &mut Vec<u8>, field: u32, value: i32) {
    if value != 0 {
        put_key(buf, field, WIRE_VARINT);
        put_varint(buf, value as i64 as u64);
    }
}

/// Writes a length-delimited field, omitting the empty default.
pub(crate) fn put_len_field(buf: &mut Vec<u8>, field: u32, bytes: &[u8]) {
    if !bytes.is_empty() {
        put_key(buf, field, WIRE_LEN);
        put_varint(buf, bytes.len() as u64);
        buf.extend_from_slice(bytes);
    }
}

pub(crate) enum FieldValue<'a> {
    Varint(u64),
    Bytes(&'a [u8]),
}

pub(crate) struct Decoder<'a> {
    buf: &'a [u8],
    pos: usize,
}

impl<'a> Decoder<'a> {
    pub(crate) fn new(buf: &'a [u8]) -> Self {
        Self { buf, pos: 0 }
    }

    /// Returns the next `(field_number, value)` pair, or `None` at end of
    /// input. Truncated input and unsupported wire types are errors.
    pub(crate) fn next_field(
        &mut self,
    ) -> Result<Option<(u32, FieldValue<'a>)>, String> {
        if self.pos == self.buf.len() {
            return Ok(None);
        }

        let key = self.read_varint()?;
        let field = (key >> 3) as u32;
        let wire_type = (key & 0x7) as u8;

        let value = match wire_type {
            WIRE_VARINT => FieldValue::Varint(self.read_varint()?),
            WIRE_LEN => {
                let len = self.read_varint()? as usize;
                let end = self
                    .pos
                    .checked_add(len)
                    .filter(|end| *end <= self.buf.len())
                    .ok_or_else(|| {
                        format!("field {field} overruns payload by {len} bytes")
                    })?;
                let bytes = &self.buf[self.pos..end];
                self.pos = end;
                FieldValue::Bytes(bytes)
            }
            other => {
                return Err(format!(
                    "field {field} has unsupported wire type {other}"
                ));
            }
        };

        Ok(Some((field, value)))
    }

    fn read_varint(&mut self) -> Result<u64, String> {
        let mut value = 0u64;
        for shift in 0..MAX_VARINT_BYTES {
            let Some(byte) = self.buf.get(self.pos).copied() else {
                return Err("truncated varint".to_string());
            };
            self.pos += 1;

            let bits = u64::from(byte & 0x7f);
            if shift == MAX_VARINT_BYTES - 1 && byte > 0x01 {
                return Err("varint exceeds 64 bits".to_string());
            }
            value |= bits << (shift * 7);

            if byte & 0x80 == 0 {
                return Ok(value);
            }
        }

        Err("varint exceeds 10 bytes".to_string())
    }
}
