//! Fixed, versioned, little-endian wire types for inter-rank exchange and checkpoints.

use crate::forest::quadrant::Quadrant;
use crate::forest_error::ForestError;
use bytemuck::{Pod, Zeroable};
use static_assertions::const_assert_eq;
use std::mem::size_of;

pub fn cast_slice<T: Pod>(v: &[T]) -> &[u8] {
    bytemuck::cast_slice(v)
}

pub fn cast_slice_mut<T: Pod>(v: &mut [T]) -> &mut [u8] {
    bytemuck::cast_slice_mut(v)
}

// All multi-byte integers in these structs are **little-endian** on the wire.

/// Byte count announced ahead of a variable-length payload.
#[repr(C)]
#[derive(Copy, Clone, Pod, Zeroable)]
pub struct WireCount {
    pub n_le: u64,
}
impl WireCount {
    pub fn new(n: usize) -> Self {
        Self {
            n_le: (n as u64).to_le(),
        }
    }
    pub fn get(&self) -> usize {
        u64::from_le(self.n_le) as usize
    }
}

/// A single unsigned value (counts, flags) carried on the wire.
#[repr(C)]
#[derive(Copy, Clone, Pod, Zeroable)]
pub struct WireU64 {
    pub v_le: u64,
}
impl WireU64 {
    pub fn of(v: u64) -> Self {
        Self { v_le: v.to_le() }
    }
    pub fn get(&self) -> u64 {
        u64::from_le(self.v_le)
    }
}

/// A quadrant or octant record. The third coordinate is zero for quadtrees.
#[repr(C)]
#[derive(Copy, Clone, Pod, Zeroable)]
pub struct WireQuadrant {
    pub tree_le: u32,
    pub level_le: u32,
    pub coords_le: [u32; 3],
}
impl WireQuadrant {
    pub const SIZE: usize = 20;

    pub fn of<const D: usize>(q: &Quadrant<D>) -> Self {
        let mut coords_le = [0u32; 3];
        for (dst, src) in coords_le.iter_mut().zip(q.coords.iter()) {
            *dst = src.to_le();
        }
        Self {
            tree_le: q.tree.to_le(),
            level_le: u32::from(q.level).to_le(),
            coords_le,
        }
    }

    /// Decode without validation; callers validate against their connectivity.
    pub fn get<const D: usize>(&self) -> Result<Quadrant<D>, ForestError> {
        let level = u32::from_le(self.level_le);
        let level = u8::try_from(level)
            .map_err(|_| ForestError::InvalidQuadrant(format!("level {level} out of range")))?;
        let mut coords = [0u32; D];
        for (dst, src) in coords.iter_mut().zip(self.coords_le.iter()) {
            *dst = u32::from_le(*src);
        }
        Ok(Quadrant {
            tree: u32::from_le(self.tree_le),
            level,
            coords,
        })
    }
}

const_assert_eq!(size_of::<WireCount>(), 8);
const_assert_eq!(size_of::<WireU64>(), 8);
const_assert_eq!(size_of::<WireQuadrant>(), WireQuadrant::SIZE);

/// Pack quadrants into a contiguous LE byte buffer.
pub fn encode_quadrants<const D: usize>(quads: &[Quadrant<D>]) -> Vec<u8> {
    let records: Vec<WireQuadrant> = quads.iter().map(WireQuadrant::of).collect();
    cast_slice(&records).to_vec()
}

/// Inverse of [`encode_quadrants`].
pub fn decode_quadrants<const D: usize>(bytes: &[u8]) -> Result<Vec<Quadrant<D>>, ForestError> {
    if bytes.len() % WireQuadrant::SIZE != 0 {
        return Err(ForestError::InvalidForest(format!(
            "quadrant payload of {} bytes is not a multiple of {}",
            bytes.len(),
            WireQuadrant::SIZE
        )));
    }
    let mut records = vec![WireQuadrant::zeroed(); bytes.len() / WireQuadrant::SIZE];
    cast_slice_mut(&mut records).copy_from_slice(bytes);
    records.iter().map(WireQuadrant::get).collect()
}

/// Pack a list of `u64` as consecutive [`WireU64`] words.
pub fn encode_u64s(values: &[u64]) -> Vec<u8> {
    let words: Vec<WireU64> = values.iter().copied().map(WireU64::of).collect();
    cast_slice(&words).to_vec()
}

/// Inverse of [`encode_u64s`].
pub fn decode_u64s(bytes: &[u8]) -> Result<Vec<u64>, ForestError> {
    if bytes.len() % size_of::<WireU64>() != 0 {
        return Err(ForestError::InvalidForest(format!(
            "u64 payload of {} bytes is not a multiple of 8",
            bytes.len()
        )));
    }
    let mut words = vec![WireU64::zeroed(); bytes.len() / size_of::<WireU64>()];
    cast_slice_mut(&mut words).copy_from_slice(bytes);
    Ok(words.iter().map(WireU64::get).collect())
}

/// Append-only little-endian writer for checkpoint blocks.
#[derive(Default, Debug)]
pub struct ByteWriter {
    buf: Vec<u8>,
}

impl ByteWriter {
    pub fn new() -> Self {
        Self::default()
    }
    pub fn put_bytes(&mut self, bytes: &[u8]) {
        self.buf.extend_from_slice(bytes);
    }
    pub fn put_u8(&mut self, v: u8) {
        self.buf.push(v);
    }
    pub fn put_u32(&mut self, v: u32) {
        self.buf.extend_from_slice(&v.to_le_bytes());
    }
    pub fn put_u64(&mut self, v: u64) {
        self.buf.extend_from_slice(&v.to_le_bytes());
    }
    pub fn put_f64(&mut self, v: f64) {
        self.buf.extend_from_slice(&v.to_le_bytes());
    }
    pub fn len(&self) -> usize {
        self.buf.len()
    }
    pub fn is_empty(&self) -> bool {
        self.buf.is_empty()
    }
    pub fn into_inner(self) -> Vec<u8> {
        self.buf
    }
}

/// Cursor over little-endian bytes. Running past the end is reported as a
/// corrupt header, since every length it reads is announced by the header.
#[derive(Debug)]
pub struct ByteReader<'a> {
    buf: &'a [u8],
    pos: usize,
}

impl<'a> ByteReader<'a> {
    pub fn new(buf: &'a [u8]) -> Self {
        Self { buf, pos: 0 }
    }

    pub fn position(&self) -> usize {
        self.pos
    }

    pub fn remaining(&self) -> usize {
        self.buf.len() - self.pos
    }

    pub fn take(&mut self, n: usize) -> Result<&'a [u8], ForestError> {
        if self.remaining() < n {
            return Err(ForestError::CorruptHeader(format!(
                "unexpected end of data at byte {}: wanted {n}, {} left",
                self.pos,
                self.remaining()
            )));
        }
        let out = &self.buf[self.pos..self.pos + n];
        self.pos += n;
        Ok(out)
    }

    pub fn get_array<const N: usize>(&mut self) -> Result<[u8; N], ForestError> {
        let mut out = [0u8; N];
        out.copy_from_slice(self.take(N)?);
        Ok(out)
    }

    pub fn get_u8(&mut self) -> Result<u8, ForestError> {
        Ok(self.get_array::<1>()?[0])
    }
    pub fn get_u32(&mut self) -> Result<u32, ForestError> {
        Ok(u32::from_le_bytes(self.get_array()?))
    }
    pub fn get_u64(&mut self) -> Result<u64, ForestError> {
        Ok(u64::from_le_bytes(self.get_array()?))
    }
    pub fn get_f64(&mut self) -> Result<f64, ForestError> {
        Ok(f64::from_le_bytes(self.get_array()?))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn quadrant_records_keep_all_fields() {
        let q = Quadrant::<3>::new(7, 2, [1 << 17, 0, 3 << 17]).unwrap();
        let bytes = encode_quadrants(&[q]);
        assert_eq!(bytes.len(), WireQuadrant::SIZE);
        assert_eq!(&bytes[..4], &7u32.to_le_bytes());
        let back = decode_quadrants::<3>(&bytes).unwrap();
        assert_eq!(back, vec![q]);
    }

    #[test]
    fn ragged_payload_is_rejected() {
        let err = decode_quadrants::<2>(&[0u8; 21]).unwrap_err();
        assert!(matches!(err, ForestError::InvalidForest(_)));
    }

    #[test]
    fn u64_lists_keep_order() {
        let bytes = encode_u64s(&[3, u64::MAX, 0]);
        assert_eq!(bytes.len(), 24);
        assert_eq!(decode_u64s(&bytes).unwrap(), vec![3, u64::MAX, 0]);
        assert!(decode_u64s(&bytes[..23]).is_err());
    }

    #[test]
    fn reader_reports_truncation() {
        let mut w = ByteWriter::new();
        w.put_u32(5);
        let bytes = w.into_inner();
        let mut r = ByteReader::new(&bytes);
        assert_eq!(r.get_u32().unwrap(), 5);
        assert!(matches!(r.get_u8(), Err(ForestError::CorruptHeader(_))));
    }

    #[test]
    fn count_header_is_le() {
        let c = WireCount::new(0x0102);
        assert_eq!(&cast_slice(std::slice::from_ref(&c))[..2], &[0x02u8, 0x01]);
        assert_eq!(c.get(), 0x0102);
    }
}
