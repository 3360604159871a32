use std::marker::PhantomData;

use bincode::Options as _;
use serde::de::DeserializeOwned;
use serde::Serialize;

use crate::{IndexError, Result};

/// Hard upper bound for any bincode-encoded key or value payload we will attempt to
/// deserialize. Corruption should degrade to a rebuild, not an out-of-memory crash.
const BINCODE_PAYLOAD_LIMIT_BYTES: u64 = 64 * 1024 * 1024;

/// Binary codec for index keys and values.
///
/// The encoding must be bit-stable across process restarts: encoded keys are used as
/// lookup keys in the persisted map, so equal values must always produce equal bytes.
pub trait DataExternalizer<T>: Send + Sync {
    fn save(&self, out: &mut Vec<u8>, value: &T) -> Result<()>;
    fn read(&self, input: &mut &[u8]) -> Result<T>;
}

/// Little-endian `u32` codec.
#[derive(Debug, Default, Clone, Copy)]
pub struct U32Externalizer;

impl DataExternalizer<u32> for U32Externalizer {
    fn save(&self, out: &mut Vec<u8>, value: &u32) -> Result<()> {
        out.extend_from_slice(&value.to_le_bytes());
        Ok(())
    }

    fn read(&self, input: &mut &[u8]) -> Result<u32> {
        let Some((head, rest)) = split_at_checked(input, 4) else {
            return Err(IndexError::decode("truncated u32"));
        };
        *input = rest;
        Ok(u32::from_le_bytes([head[0], head[1], head[2], head[3]]))
    }
}

/// Length-prefixed UTF-8 string codec.
#[derive(Debug, Default, Clone, Copy)]
pub struct StringExternalizer;

impl DataExternalizer<String> for StringExternalizer {
    fn save(&self, out: &mut Vec<u8>, value: &String) -> Result<()> {
        write_uvarint(out, value.len() as u64);
        out.extend_from_slice(value.as_bytes());
        Ok(())
    }

    fn read(&self, input: &mut &[u8]) -> Result<String> {
        let len = read_uvarint(input)? as usize;
        let Some((head, rest)) = split_at_checked(input, len) else {
            return Err(IndexError::decode("truncated string"));
        };
        *input = rest;
        String::from_utf8(head.to_vec()).map_err(|_| IndexError::decode("invalid utf-8 string"))
    }
}

/// Codec for presence-only indices whose value type is `()`.
#[derive(Debug, Default, Clone, Copy)]
pub struct UnitExternalizer;

impl DataExternalizer<()> for UnitExternalizer {
    fn save(&self, _out: &mut Vec<u8>, _value: &()) -> Result<()> {
        Ok(())
    }

    fn read(&self, _input: &mut &[u8]) -> Result<()> {
        Ok(())
    }
}

/// Serde-derived codec with the fixint little-endian options the rest of the on-disk
/// format uses, size-limited on the read side.
pub struct BincodeExternalizer<T> {
    _marker: PhantomData<fn() -> T>,
}

impl<T> Default for BincodeExternalizer<T> {
    fn default() -> Self {
        Self {
            _marker: PhantomData,
        }
    }
}

impl<T> BincodeExternalizer<T> {
    pub fn new() -> Self {
        Self::default()
    }
}

fn bincode_options() -> impl bincode::Options + Copy {
    bincode::DefaultOptions::new()
        .with_fixint_encoding()
        .with_little_endian()
}

impl<T> DataExternalizer<T> for BincodeExternalizer<T>
where
    T: Serialize + DeserializeOwned + Send + Sync,
{
    fn save(&self, out: &mut Vec<u8>, value: &T) -> Result<()> {
        let bytes = bincode_options().serialize(value)?;
        write_uvarint(out, bytes.len() as u64);
        out.extend_from_slice(&bytes);
        Ok(())
    }

    fn read(&self, input: &mut &[u8]) -> Result<T> {
        let len = read_uvarint(input)? as usize;
        let Some((head, rest)) = split_at_checked(input, len) else {
            return Err(IndexError::decode("truncated bincode payload"));
        };
        *input = rest;
        Ok(bincode_options()
            .with_limit(BINCODE_PAYLOAD_LIMIT_BYTES)
            .deserialize(head)?)
    }
}

fn split_at_checked<'a>(input: &&'a [u8], mid: usize) -> Option<(&'a [u8], &'a [u8])> {
    if input.len() < mid {
        None
    } else {
        Some(input.split_at(mid))
    }
}

/// LEB128-style unsigned varint.
pub(crate) fn write_uvarint(out: &mut Vec<u8>, mut value: u64) {
    loop {
        let byte = (value & 0x7f) as u8;
        value >>= 7;
        if value == 0 {
            out.push(byte);
            return;
        }
        out.push(byte | 0x80);
    }
}

pub(crate) fn read_uvarint(input: &mut &[u8]) -> Result<u64> {
    let mut value = 0u64;
    let mut shift = 0u32;
    loop {
        let Some((&byte, rest)) = input.split_first() else {
            return Err(IndexError::decode("truncated varint"));
        };
        *input = rest;
        if shift >= 64 {
            return Err(IndexError::decode("varint overflow"));
        }
        value |= u64::from(byte & 0x7f) << shift;
        if byte & 0x80 == 0 {
            return Ok(value);
        }
        shift += 7;
    }
}

/// Zigzag-encoded signed varint; used for the container chunk header where negative
/// counts are the "invalidated ids follow" sentinel.
pub(crate) fn write_ivarint(out: &mut Vec<u8>, value: i64) {
    let zigzag = ((value << 1) ^ (value >> 63)) as u64;
    write_uvarint(out, zigzag);
}

pub(crate) fn read_ivarint(input: &mut &[u8]) -> Result<i64> {
    let zigzag = read_uvarint(input)?;
    Ok(((zigzag >> 1) as i64) ^ -((zigzag & 1) as i64))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn varint_round_trips_edge_values() {
        for value in [0u64, 1, 127, 128, 300, u32::MAX as u64, u64::MAX] {
            let mut out = Vec::new();
            write_uvarint(&mut out, value);
            let mut input = out.as_slice();
            assert_eq!(read_uvarint(&mut input).unwrap(), value);
            assert!(input.is_empty());
        }
    }

    #[test]
    fn ivarint_round_trips_negative_values() {
        for value in [0i64, -1, 1, -64, 64, i64::MIN, i64::MAX] {
            let mut out = Vec::new();
            write_ivarint(&mut out, value);
            let mut input = out.as_slice();
            assert_eq!(read_ivarint(&mut input).unwrap(), value);
        }
    }

    #[test]
    fn string_externalizer_round_trips() {
        let ext = StringExternalizer;
        let mut out = Vec::new();
        ext.save(&mut out, &"héllo".to_string()).unwrap();
        let mut input = out.as_slice();
        assert_eq!(ext.read(&mut input).unwrap(), "héllo");
    }

    #[test]
    fn truncated_input_is_a_decode_error() {
        let ext = U32Externalizer;
        let mut input: &[u8] = &[1, 2];
        match ext.read(&mut input) {
            Err(IndexError::Decode { .. }) => {}
            other => panic!("expected decode error, got {other:?}"),
        }
    }

    #[test]
    fn bincode_externalizer_round_trips_serde_types() {
        #[derive(Debug, PartialEq, serde::Serialize, serde::Deserialize)]
        struct CompoundKey {
            namespace: String,
            hash: u64,
        }

        let ext = BincodeExternalizer::<CompoundKey>::new();
        let key = CompoundKey {
            namespace: "methods".to_string(),
            hash: 0xdead_beef,
        };
        let mut out = Vec::new();
        ext.save(&mut out, &key).unwrap();
        let mut input = out.as_slice();
        assert_eq!(ext.read(&mut input).unwrap(), key);
    }
}
