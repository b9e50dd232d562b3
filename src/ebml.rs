//! EBML primitives: element IDs, VINT size encoding, and typed leaf writers.
//!
//! The element-id/size split mirrors the teacher's `mp4_box!` reserve-then-
//! patch macro (`boxes.rs`), adapted from MP4's fixed 4-byte box size to
//! EBML's variable-length integer. Two writing modes are offered: appending
//! to an in-memory `Vec<u8>` for elements whose size is known up front
//! (tracks, segment info), and the reserve/patch pattern over a `Write + Seek`
//! sink for elements whose size is only known after their body is written
//! (clusters, the segment itself).

use std::io::{self, Seek, SeekFrom, Write};

/// Reserves this many bytes for a patched-in element size: the 8-byte VINT
/// form, so the placeholder is wide enough for any body length we'll ever
/// produce and can be patched without moving anything that follows it.
pub const SIZE_PLACEHOLDER_LEN: u64 = 8;

/// Writes an EBML element ID. IDs are declared as their full encoded value
/// (leading marker bits included), so the byte count falls out of the
/// constant's magnitude the same way the reference encoder derives it.
pub fn write_id<W: Write>(w: &mut W, id: u32) -> io::Result<()> {
    w.write_all(&id_bytes(id))
}

fn id_bytes(id: u32) -> Vec<u8> {
    if id <= 0xFF {
        vec![id as u8]
    } else if id <= 0xFFFF {
        vec![(id >> 8) as u8, id as u8]
    } else if id <= 0xFF_FFFF {
        vec![(id >> 16) as u8, (id >> 8) as u8, id as u8]
    } else {
        vec![(id >> 24) as u8, (id >> 16) as u8, (id >> 8) as u8, id as u8]
    }
}

/// Encodes `size` as the shortest valid EBML VINT.
pub fn encode_vint(size: u64) -> Vec<u8> {
    if size < 0x7F {
        vec![0x80 | size as u8]
    } else if size < 0x3FFF {
        vec![0x40 | (size >> 8) as u8, size as u8]
    } else if size < 0x1F_FFFF {
        vec![0x20 | (size >> 16) as u8, (size >> 8) as u8, size as u8]
    } else if size < 0x0FFF_FFFF {
        vec![
            0x10 | (size >> 24) as u8,
            (size >> 16) as u8,
            (size >> 8) as u8,
            size as u8,
        ]
    } else {
        encode_vint8(size)
    }
}

/// Encodes `size` as a fixed 8-byte VINT, used for the placeholder/patch
/// pattern where the final length cannot widen the field after the fact.
pub fn encode_vint8(size: u64) -> Vec<u8> {
    let mut bytes = vec![0x01];
    for i in (0..7).rev() {
        bytes.push((size >> (i * 8)) as u8);
    }
    bytes
}

pub fn write_size<W: Write>(w: &mut W, size: u64) -> io::Result<()> {
    w.write_all(&encode_vint(size))
}

/// Minimal big-endian encoding of an unsigned integer element body.
pub fn encode_uint(value: u64) -> Vec<u8> {
    if value == 0 {
        vec![0]
    } else if value <= 0xFF {
        vec![value as u8]
    } else if value <= 0xFFFF {
        vec![(value >> 8) as u8, value as u8]
    } else if value <= 0xFF_FFFF {
        vec![(value >> 16) as u8, (value >> 8) as u8, value as u8]
    } else if value <= 0xFFFF_FFFF {
        value.to_be_bytes()[4..].to_vec()
    } else {
        value.to_be_bytes().to_vec()
    }
}

/// Minimal big-endian encoding of a signed integer element body (timecodes,
/// references).
pub fn encode_sint(value: i64) -> Vec<u8> {
    if value >= -0x80 && value <= 0x7F {
        vec![value as i8 as u8]
    } else if value >= -0x8000 && value <= 0x7FFF {
        (value as i16).to_be_bytes().to_vec()
    } else if value >= -0x80_0000 && value <= 0x7F_FFFF {
        let b = (value as i32).to_be_bytes();
        b[1..].to_vec()
    } else if value >= i32::MIN as i64 && value <= i32::MAX as i64 {
        (value as i32).to_be_bytes().to_vec()
    } else {
        value.to_be_bytes().to_vec()
    }
}

pub fn push_uint_element(buf: &mut Vec<u8>, id: u32, value: u64) {
    buf.extend_from_slice(&id_bytes(id));
    let body = encode_uint(value);
    buf.extend_from_slice(&encode_vint(body.len() as u64));
    buf.extend_from_slice(&body);
}

pub fn push_sint_element(buf: &mut Vec<u8>, id: u32, value: i64) {
    buf.extend_from_slice(&id_bytes(id));
    let body = encode_sint(value);
    buf.extend_from_slice(&encode_vint(body.len() as u64));
    buf.extend_from_slice(&body);
}

pub fn push_float_element(buf: &mut Vec<u8>, id: u32, value: f64) {
    buf.extend_from_slice(&id_bytes(id));
    buf.extend_from_slice(&encode_vint(8));
    buf.extend_from_slice(&value.to_be_bytes());
}

pub fn push_string_element(buf: &mut Vec<u8>, id: u32, value: &str) {
    buf.extend_from_slice(&id_bytes(id));
    buf.extend_from_slice(&encode_vint(value.len() as u64));
    buf.extend_from_slice(value.as_bytes());
}

pub fn push_binary_element(buf: &mut Vec<u8>, id: u32, data: &[u8]) {
    buf.extend_from_slice(&id_bytes(id));
    buf.extend_from_slice(&encode_vint(data.len() as u64));
    buf.extend_from_slice(data);
}

/// Wraps `body` (already-encoded child elements) in a master element with a
/// minimal, precomputed size -- used when every child is already in hand, as
/// opposed to [`write_master_patched`] where the body is produced by writing
/// and the size is only known afterward.
pub fn push_master_element(buf: &mut Vec<u8>, id: u32, body: &[u8]) {
    buf.extend_from_slice(&id_bytes(id));
    buf.extend_from_slice(&encode_vint(body.len() as u64));
    buf.extend_from_slice(body);
}

/// Reserve-then-patch pattern for a master element whose size is not known
/// until its body has been written, the EBML analogue of the teacher's
/// `mp4_box!` macro. `write_body` receives the sink positioned just past the
/// reserved size field.
pub fn write_master_patched<W, F>(w: &mut W, id: u32, write_body: F) -> io::Result<u64>
where
    W: Write + Seek,
    F: FnOnce(&mut W) -> io::Result<()>,
{
    write_id(w, id)?;
    let size_pos = w.stream_position()?;
    w.write_all(&[0u8; SIZE_PLACEHOLDER_LEN as usize])?;
    let body_start = w.stream_position()?;
    write_body(w)?;
    let body_end = w.stream_position()?;
    let body_len = body_end - body_start;

    w.seek(SeekFrom::Start(size_pos))?;
    w.write_all(&encode_vint8(body_len))?;
    w.seek(SeekFrom::Start(body_end))?;
    Ok(body_len)
}
