//! Field-level encoding helpers shared by every packet body.
//!
//! All integers are big-endian, strings and byte blobs carry a `u32` length
//! prefix. Reads are bounds-checked and report [`CodecError::Truncated`]
//! instead of panicking on short input.

use bytes::{Buf, BufMut, Bytes, BytesMut};
use serde::de::DeserializeOwned;
use serde::Serialize;
use uuid::Uuid;

use super::CodecError;

fn ensure(buf: &Bytes, needed: usize) -> Result<(), CodecError> {
    if buf.remaining() < needed {
        return Err(CodecError::Truncated {
            needed,
            available: buf.remaining(),
        });
    }
    Ok(())
}

pub fn put_string(buf: &mut BytesMut, value: &str) {
    buf.put_u32(value.len() as u32);
    buf.put_slice(value.as_bytes());
}

pub fn get_string(buf: &mut Bytes) -> Result<String, CodecError> {
    let bytes = get_bytes(buf)?;
    String::from_utf8(bytes.to_vec()).map_err(|_| CodecError::InvalidUtf8)
}

pub fn put_bytes(buf: &mut BytesMut, value: &[u8]) {
    buf.put_u32(value.len() as u32);
    buf.put_slice(value);
}

pub fn get_bytes(buf: &mut Bytes) -> Result<Bytes, CodecError> {
    let len = get_u32(buf)? as usize;
    ensure(buf, len)?;
    Ok(buf.split_to(len))
}

pub fn put_uuid(buf: &mut BytesMut, value: &Uuid) {
    buf.put_slice(value.as_bytes());
}

pub fn get_uuid(buf: &mut Bytes) -> Result<Uuid, CodecError> {
    ensure(buf, 16)?;
    let mut raw = [0u8; 16];
    buf.copy_to_slice(&mut raw);
    Ok(Uuid::from_bytes(raw))
}

pub fn get_u8(buf: &mut Bytes) -> Result<u8, CodecError> {
    ensure(buf, 1)?;
    Ok(buf.get_u8())
}

pub fn get_u32(buf: &mut Bytes) -> Result<u32, CodecError> {
    ensure(buf, 4)?;
    Ok(buf.get_u32())
}

pub fn get_i64(buf: &mut Bytes) -> Result<i64, CodecError> {
    ensure(buf, 8)?;
    Ok(buf.get_i64())
}

/// Write a serde value as a length-prefixed bincode blob.
pub fn put_serde<T: Serialize>(buf: &mut BytesMut, value: &T) -> Result<(), CodecError> {
    let encoded = bincode::serialize(value)?;
    put_bytes(buf, &encoded);
    Ok(())
}

/// Read a value written by [`put_serde`].
pub fn get_serde<T: DeserializeOwned>(buf: &mut Bytes) -> Result<T, CodecError> {
    let raw = get_bytes(buf)?;
    Ok(bincode::deserialize(&raw)?)
}
