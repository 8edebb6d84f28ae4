use std::io::{self, Read};

use thiserror::Error;
use tokio::io::{AsyncRead, AsyncReadExt};

/// Largest payload a single frame may declare (2^21 - 1).
pub const MAX_PACKET_BYTES: i32 = 2_097_151;

/// String limit for names and addresses.
pub const MAX_NAME_BYTES: i32 = 32_767;

/// String limit for chat-sized fields.
#[allow(dead_code)]
pub const MAX_CHAT_BYTES: i32 = 262_144;

#[derive(Debug, Error)]
pub enum CodecError {
    #[error("varint runs past five bytes")]
    VarIntTooBig,
    #[error("packet length {0} out of range")]
    BadPacketLength(i32),
    #[error("declared string length {len} exceeds limit {max}")]
    StringTooLong { len: i32, max: i32 },
    #[error("string is not valid utf-8")]
    BadUtf8(#[from] std::string::FromUtf8Error),
    #[error(transparent)]
    Io(#[from] io::Error),
}

/// A raw frame: one id byte plus an opaque payload.
///
/// The frame length on the wire covers the id byte, so an empty payload
/// still encodes as length 1.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Packet {
    pub id: u8,
    pub payload: Vec<u8>,
}

impl Packet {
    pub fn encode(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(self.payload.len() + 6);
        put_varint(&mut out, self.payload.len() as i32 + 1);
        out.push(self.id);
        out.extend_from_slice(&self.payload);
        out
    }
}

/// Reads one frame. Consumes exactly the declared length, never more.
pub async fn read_packet<R>(r: &mut R) -> Result<Packet, CodecError>
where
    R: AsyncRead + Unpin,
{
    let len = read_varint_async(r).await?;
    if !(1..=MAX_PACKET_BYTES).contains(&len) {
        return Err(CodecError::BadPacketLength(len));
    }

    let mut data = vec![0u8; len as usize];
    r.read_exact(&mut data).await?;

    let payload = data.split_off(1);
    Ok(Packet { id: data[0], payload })
}

async fn read_varint_async<R>(r: &mut R) -> Result<i32, CodecError>
where
    R: AsyncRead + Unpin,
{
    let mut out: u32 = 0;
    for i in 0..5 {
        let b = r.read_u8().await?;
        out |= u32::from(b & 0x7f) << (7 * i);
        if b & 0x80 == 0 {
            return Ok(out as i32);
        }
    }
    Err(CodecError::VarIntTooBig)
}

pub fn read_varint<R: Read>(r: &mut R) -> Result<i32, CodecError> {
    let mut out: u32 = 0;
    for i in 0..5 {
        let mut b = [0u8; 1];
        r.read_exact(&mut b)?;
        out |= u32::from(b[0] & 0x7f) << (7 * i);
        if b[0] & 0x80 == 0 {
            return Ok(out as i32);
        }
    }
    Err(CodecError::VarIntTooBig)
}

/// Length-prefixed UTF-8 string. Only the declared per-context limit is
/// enforced here.
pub fn read_string<R: Read>(r: &mut R, max: i32) -> Result<String, CodecError> {
    let len = read_varint(r)?;
    if len < 0 || len > max {
        return Err(CodecError::StringTooLong { len, max });
    }
    let mut buf = vec![0u8; len as usize];
    r.read_exact(&mut buf)?;
    Ok(String::from_utf8(buf)?)
}

pub fn read_u8<R: Read>(r: &mut R) -> Result<u8, CodecError> {
    let mut b = [0u8; 1];
    r.read_exact(&mut b)?;
    Ok(b[0])
}

pub fn read_u16_be<R: Read>(r: &mut R) -> Result<u16, CodecError> {
    let mut b = [0u8; 2];
    r.read_exact(&mut b)?;
    Ok(u16::from_be_bytes(b))
}

#[allow(dead_code)]
pub fn read_i64_be<R: Read>(r: &mut R) -> Result<i64, CodecError> {
    let mut b = [0u8; 8];
    r.read_exact(&mut b)?;
    Ok(i64::from_be_bytes(b))
}

pub fn read_id128<R: Read>(r: &mut R) -> Result<[u8; 16], CodecError> {
    let mut b = [0u8; 16];
    r.read_exact(&mut b)?;
    Ok(b)
}

pub fn put_varint(out: &mut Vec<u8>, v: i32) {
    let mut n = v as u32;
    loop {
        let mut b = (n & 0x7f) as u8;
        n >>= 7;
        if n != 0 {
            b |= 0x80;
        }
        out.push(b);
        if n == 0 {
            return;
        }
    }
}

pub fn put_string(out: &mut Vec<u8>, s: &str) {
    put_varint(out, s.len() as i32);
    out.extend_from_slice(s.as_bytes());
}

pub fn put_u16_be(out: &mut Vec<u8>, v: u16) {
    out.extend_from_slice(&v.to_be_bytes());
}

pub fn put_u8(out: &mut Vec<u8>, v: u8) {
    out.push(v);
}

#[allow(dead_code)]
pub fn put_i64_be(out: &mut Vec<u8>, v: i64) {
    out.extend_from_slice(&v.to_be_bytes());
}

pub fn put_id128(out: &mut Vec<u8>, id: &[u8; 16]) {
    out.extend_from_slice(id);
}
