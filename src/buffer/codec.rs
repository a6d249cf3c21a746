//! Typed read/write helpers layered on the message cursor.
//!
//! Everything is little-endian. Floats round-trip by bit pattern, never by
//! value conversion. Varints use LEB128 with zigzag mapping for the signed
//! variants (via `integer-encoding`).

use integer_encoding::VarInt;
use uuid::Uuid;

use crate::buffer::Message;
use crate::{TransportError, TransportResult};

/// Longest encoded string accepted by `write_str`/`read_str`.
pub const MAX_STRING_LENGTH: usize = 32 * 1024;

macro_rules! int_codec {
    ($write:ident, $read:ident, $ty:ty) => {
        pub fn $write(&self, value: $ty) -> TransportResult<()> {
            self.write_bytes(&value.to_le_bytes())
        }

        pub fn $read(&self) -> TransportResult<$ty> {
            let mut bytes = [0u8; std::mem::size_of::<$ty>()];
            self.read_bytes(&mut bytes)?;
            Ok(<$ty>::from_le_bytes(bytes))
        }
    };
}

impl Message {
    int_codec!(write_u16, read_u16, u16);
    int_codec!(write_i16, read_i16, i16);
    int_codec!(write_u32, read_u32, u32);
    int_codec!(write_i32, read_i32, i32);
    int_codec!(write_u64, read_u64, u64);
    int_codec!(write_i64, read_i64, i64);
    int_codec!(write_u128, read_u128, u128);

    pub fn write_bool(&self, value: bool) -> TransportResult<()> {
        self.write_u8(value as u8)
    }

    pub fn read_bool(&self) -> TransportResult<bool> {
        Ok(self.read_u8()? != 0)
    }

    pub fn write_f32(&self, value: f32) -> TransportResult<()> {
        self.write_u32(value.to_bits())
    }

    pub fn read_f32(&self) -> TransportResult<f32> {
        Ok(f32::from_bits(self.read_u32()?))
    }

    pub fn write_f64(&self, value: f64) -> TransportResult<()> {
        self.write_u64(value.to_bits())
    }

    pub fn read_f64(&self) -> TransportResult<f64> {
        Ok(f64::from_bits(self.read_u64()?))
    }

    pub fn write_uuid(&self, value: &Uuid) -> TransportResult<()> {
        self.write_bytes(value.as_bytes())
    }

    pub fn read_uuid(&self) -> TransportResult<Uuid> {
        let mut bytes = [0u8; 16];
        self.read_bytes(&mut bytes)?;
        Ok(Uuid::from_bytes(bytes))
    }

    pub fn write_var_u32(&self, value: u32) -> TransportResult<()> {
        self.write_varint(value)
    }

    pub fn write_var_u64(&self, value: u64) -> TransportResult<()> {
        self.write_varint(value)
    }

    pub fn write_var_i32(&self, value: i32) -> TransportResult<()> {
        self.write_varint(value)
    }

    pub fn write_var_i64(&self, value: i64) -> TransportResult<()> {
        self.write_varint(value)
    }

    pub fn read_var_u32(&self) -> TransportResult<u32> {
        self.read_varint()
    }

    pub fn read_var_u64(&self) -> TransportResult<u64> {
        self.read_varint()
    }

    pub fn read_var_i32(&self) -> TransportResult<i32> {
        self.read_varint()
    }

    pub fn read_var_i64(&self) -> TransportResult<i64> {
        self.read_varint()
    }

    fn write_varint<V: VarInt>(&self, value: V) -> TransportResult<()> {
        let mut encoded = [0u8; 10];
        let len = value.encode_var(&mut encoded);
        self.write_bytes(&encoded[..len])
    }

    fn read_varint<V: VarInt>(&self) -> TransportResult<V> {
        // LEB128 continuation bit drives the length, ten bytes at most
        let mut encoded = [0u8; 10];
        for i in 0..encoded.len() {
            encoded[i] = self.read_u8()?;
            if encoded[i] & 0x80 == 0 {
                return V::decode_var(&encoded[..=i])
                    .map(|(value, _)| value)
                    .ok_or_else(|| {
                        TransportError::IllegalState("varint does not fit target type".into())
                    });
            }
        }
        Err(TransportError::IllegalState(
            "varint longer than 10 bytes".into(),
        ))
    }

    /// Strings carry a u16 prefix of `byte_len + 1`; `0` encodes the absent
    /// string, so `None` survives a round trip distinct from `Some("")`.
    pub fn write_str(&self, value: Option<&str>) -> TransportResult<()> {
        let value = match value {
            None => return self.write_u16(0),
            Some(value) => value,
        };
        if value.len() + 1 > MAX_STRING_LENGTH {
            return Err(TransportError::StringTooLong(value.len()));
        }
        self.write_u16((value.len() + 1) as u16)?;
        self.write_bytes(value.as_bytes())
    }

    pub fn read_str(&self) -> TransportResult<Option<String>> {
        let prefix = self.read_u16()? as usize;
        if prefix == 0 {
            return Ok(None);
        }
        let mut bytes = vec![0u8; prefix - 1];
        self.read_bytes(&mut bytes)?;
        Ok(Some(String::from_utf8(bytes)?))
    }
}
