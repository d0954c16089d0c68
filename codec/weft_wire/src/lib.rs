//! Bounds-checked big-endian primitive access for Weft message frames.
//!
//! Every read and write of a message frame goes through this crate. A read
//! past the end of a buffer is a hard [`WireError::Truncated`] error, never
//! a partial result: a frame that cannot satisfy a read is corrupt and the
//! caller fails fast.
//!
//! Offsets are tracked by the caller. The layout engine computes absolute
//! positions, so a cursor abstraction here would only get in the way.

use thiserror::Error;

/// Sentinel length marking a logically absent (null) variable-length value.
pub const NULL_LEN: u32 = 0xFFFF_FFFF;

/// Error raised by frame reads and writes.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum WireError {
    /// A read would run past the end of the buffer.
    #[error("truncated frame: need {want} bytes at offset {off}, buffer is {len}")]
    Truncated { off: usize, want: usize, len: usize },
    /// A write would run past the end of the buffer.
    #[error("write overflow: need {want} bytes at offset {off}, buffer is {len}")]
    Overflow { off: usize, want: usize, len: usize },
}

pub type Result<T> = std::result::Result<T, WireError>;

#[inline]
fn take<const N: usize>(buf: &[u8], off: usize) -> Result<[u8; N]> {
    match off.checked_add(N).and_then(|end| buf.get(off..end)) {
        Some(bytes) => {
            let mut out = [0u8; N];
            out.copy_from_slice(bytes);
            Ok(out)
        }
        None => Err(WireError::Truncated {
            off,
            want: N,
            len: buf.len(),
        }),
    }
}

#[inline]
fn put(buf: &mut [u8], off: usize, bytes: &[u8]) -> Result<()> {
    let len = buf.len();
    match off
        .checked_add(bytes.len())
        .and_then(|end| buf.get_mut(off..end))
    {
        Some(dst) => {
            dst.copy_from_slice(bytes);
            Ok(())
        }
        None => Err(WireError::Overflow {
            off,
            want: bytes.len(),
            len,
        }),
    }
}

pub fn read_u8(buf: &[u8], off: usize) -> Result<u8> {
    Ok(u8::from_be_bytes(take::<1>(buf, off)?))
}

pub fn read_i8(buf: &[u8], off: usize) -> Result<i8> {
    Ok(i8::from_be_bytes(take::<1>(buf, off)?))
}

pub fn read_u16(buf: &[u8], off: usize) -> Result<u16> {
    Ok(u16::from_be_bytes(take::<2>(buf, off)?))
}

pub fn read_i16(buf: &[u8], off: usize) -> Result<i16> {
    Ok(i16::from_be_bytes(take::<2>(buf, off)?))
}

pub fn read_u32(buf: &[u8], off: usize) -> Result<u32> {
    Ok(u32::from_be_bytes(take::<4>(buf, off)?))
}

pub fn read_i32(buf: &[u8], off: usize) -> Result<i32> {
    Ok(i32::from_be_bytes(take::<4>(buf, off)?))
}

pub fn read_u64(buf: &[u8], off: usize) -> Result<u64> {
    Ok(u64::from_be_bytes(take::<8>(buf, off)?))
}

pub fn read_i64(buf: &[u8], off: usize) -> Result<i64> {
    Ok(i64::from_be_bytes(take::<8>(buf, off)?))
}

pub fn read_f32(buf: &[u8], off: usize) -> Result<f32> {
    Ok(f32::from_bits(read_u32(buf, off)?))
}

pub fn read_f64(buf: &[u8], off: usize) -> Result<f64> {
    Ok(f64::from_bits(read_u64(buf, off)?))
}

/// Read `len` bytes starting at `off`.
pub fn read_bytes<'a>(buf: &'a [u8], off: usize, len: usize) -> Result<&'a [u8]> {
    off.checked_add(len)
        .and_then(|end| buf.get(off..end))
        .ok_or(WireError::Truncated {
            off,
            want: len,
            len: buf.len(),
        })
}

pub fn write_u8(buf: &mut [u8], off: usize, val: u8) -> Result<()> {
    put(buf, off, &val.to_be_bytes())
}

pub fn write_i8(buf: &mut [u8], off: usize, val: i8) -> Result<()> {
    put(buf, off, &val.to_be_bytes())
}

pub fn write_u16(buf: &mut [u8], off: usize, val: u16) -> Result<()> {
    put(buf, off, &val.to_be_bytes())
}

pub fn write_i16(buf: &mut [u8], off: usize, val: i16) -> Result<()> {
    put(buf, off, &val.to_be_bytes())
}

pub fn write_u32(buf: &mut [u8], off: usize, val: u32) -> Result<()> {
    put(buf, off, &val.to_be_bytes())
}

pub fn write_i32(buf: &mut [u8], off: usize, val: i32) -> Result<()> {
    put(buf, off, &val.to_be_bytes())
}

pub fn write_u64(buf: &mut [u8], off: usize, val: u64) -> Result<()> {
    put(buf, off, &val.to_be_bytes())
}

pub fn write_i64(buf: &mut [u8], off: usize, val: i64) -> Result<()> {
    put(buf, off, &val.to_be_bytes())
}

pub fn write_f32(buf: &mut [u8], off: usize, val: f32) -> Result<()> {
    write_u32(buf, off, val.to_bits())
}

pub fn write_f64(buf: &mut [u8], off: usize, val: f64) -> Result<()> {
    write_u64(buf, off, val.to_bits())
}

pub fn write_bytes(buf: &mut [u8], off: usize, bytes: &[u8]) -> Result<()> {
    put(buf, off, bytes)
}

#[cfg(test)]
mod tests;
