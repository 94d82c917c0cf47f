//! Byte layout of connectivity and forest checkpoints.
//!
//! All integers are little-endian. The connectivity block is shared by the
//! standalone connectivity file and the forest file.

use crate::algs::wire::{ByteReader, ByteWriter};
use crate::forest::Quadrant;
use crate::forest_error::ForestError;
use crate::topology::connectivity::{Connectivity, TopologyDescription};

pub const CONNECTIVITY_MAGIC: [u8; 8] = *b"QFCONNEC";
pub const FOREST_MAGIC: [u8; 8] = *b"QFFOREST";
/// Format revision stored in the low 24 bits of the version word.
pub const FORMAT_REVISION: u32 = 1;

/// Version word: dimension in the high byte, format revision below.
pub const fn version_word(dim: u32) -> u32 {
    (dim << 24) | FORMAT_REVISION
}

/// Byte length of the fixed forest header preceding the connectivity block.
pub const FOREST_HEADER_LEN: usize = 8 + 4 + 4 + 4 + 8 + 4;
/// Byte length of the connectivity block prefix (magic, version, counts).
pub const CONNECTIVITY_PREFIX_LEN: usize = 8 + 4 + 4 + 4;

/// Bytes per quadrant record: tree, level and `D` coordinates.
pub const fn record_len(dim: usize) -> usize {
    4 + 4 + 4 * dim
}

fn check_version(found: u32, dim: usize) -> Result<(), ForestError> {
    let revision = found & 0x00ff_ffff;
    if revision != FORMAT_REVISION {
        return Err(ForestError::FormatVersionMismatch {
            found: revision,
            supported: FORMAT_REVISION,
        });
    }
    if found >> 24 != dim as u32 {
        return Err(ForestError::DimensionMismatch {
            expected: dim as u32,
            found: found >> 24,
        });
    }
    Ok(())
}

fn check_magic(found: [u8; 8], expected: [u8; 8], what: &str) -> Result<(), ForestError> {
    if found != expected {
        return Err(ForestError::CorruptHeader(format!(
            "bad {what} magic {:?}",
            String::from_utf8_lossy(&found)
        )));
    }
    Ok(())
}

/// Total byte length of a connectivity block with these counts.
pub fn connectivity_block_len<const D: usize>(num_trees: u32, num_vertices: u32) -> Option<u64> {
    let nt = u64::from(num_trees);
    let nv = u64::from(num_vertices);
    let per_tree_vertices = if nv > 0 { (1u64 << D) * 4 } else { 0 };
    let per_tree = per_tree_vertices + (2 * D as u64) * 4 + 2 * D as u64;
    nt.checked_mul(per_tree)?
        .checked_add(nv.checked_mul(24)?)?
        .checked_add(CONNECTIVITY_PREFIX_LEN as u64)
}

/// Counts announced by a connectivity block prefix, after magic and version checks.
pub fn read_connectivity_prefix<const D: usize>(
    r: &mut ByteReader<'_>,
) -> Result<(u32, u32), ForestError> {
    check_magic(r.get_array()?, CONNECTIVITY_MAGIC, "connectivity")?;
    check_version(r.get_u32()?, D)?;
    let num_trees = r.get_u32()?;
    let num_vertices = r.get_u32()?;
    Ok((num_trees, num_vertices))
}

pub fn write_connectivity<const D: usize>(w: &mut ByteWriter, conn: &Connectivity<D>) {
    let desc = conn.to_description();
    w.put_bytes(&CONNECTIVITY_MAGIC);
    w.put_u32(version_word(D as u32));
    w.put_u32(desc.num_trees);
    w.put_u32(conn.num_vertices());
    if conn.num_vertices() > 0 {
        desc.tree_to_vertex.iter().flatten().for_each(|&v| w.put_u32(v));
    }
    desc.tree_to_tree.iter().flatten().for_each(|&t| w.put_u32(t));
    desc.tree_to_face.iter().flatten().for_each(|&f| w.put_u8(f));
    for v in &desc.vertices {
        v.iter().for_each(|&x| w.put_f64(x));
    }
}

/// Decode and validate a connectivity block. Nothing is returned unless the
/// whole block decodes and passes [`Connectivity::build`].
pub fn read_connectivity<const D: usize>(
    r: &mut ByteReader<'_>,
) -> Result<Connectivity<D>, ForestError> {
    let (num_trees, num_vertices) = read_connectivity_prefix::<D>(r)?;
    let body = connectivity_block_len::<D>(num_trees, num_vertices)
        .map(|n| n - CONNECTIVITY_PREFIX_LEN as u64)
        .ok_or_else(|| ForestError::CorruptHeader("connectivity counts overflow".into()))?;
    if body > r.remaining() as u64 {
        return Err(ForestError::CorruptHeader(format!(
            "connectivity of {num_trees} trees and {num_vertices} vertices \
             needs {body} bytes, {} left",
            r.remaining()
        )));
    }
    let (nt, faces, corners) = (
        num_trees as usize,
        Connectivity::<D>::FACES,
        Connectivity::<D>::CORNERS,
    );

    let mut tree_to_vertex = Vec::new();
    if num_vertices > 0 {
        for _ in 0..nt {
            tree_to_vertex.push((0..corners).map(|_| r.get_u32()).collect::<Result<_, _>>()?);
        }
    }
    let mut tree_to_tree = Vec::with_capacity(nt);
    for _ in 0..nt {
        tree_to_tree.push((0..faces).map(|_| r.get_u32()).collect::<Result<_, _>>()?);
    }
    let mut tree_to_face = Vec::with_capacity(nt);
    for _ in 0..nt {
        tree_to_face.push((0..faces).map(|_| r.get_u8()).collect::<Result<_, _>>()?);
    }
    let mut vertices = Vec::with_capacity(num_vertices as usize);
    for _ in 0..num_vertices {
        vertices.push([r.get_f64()?, r.get_f64()?, r.get_f64()?]);
    }

    Connectivity::build(&TopologyDescription {
        dim: D as u32,
        num_trees,
        vertices,
        tree_to_vertex,
        tree_to_tree,
        tree_to_face,
    })
}

/// Fixed fields at the start of a forest file.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ForestHeader {
    pub dim: u32,
    pub max_level: u32,
    pub global_count: u64,
    pub rank_count: u32,
}

impl ForestHeader {
    pub fn write(&self, w: &mut ByteWriter) {
        w.put_bytes(&FOREST_MAGIC);
        w.put_u32(version_word(self.dim));
        w.put_u32(self.dim);
        w.put_u32(self.max_level);
        w.put_u64(self.global_count);
        w.put_u32(self.rank_count);
    }

    /// Decode and check the header for a `D`-dimensional forest.
    pub fn read<const D: usize>(r: &mut ByteReader<'_>) -> Result<Self, ForestError> {
        check_magic(r.get_array()?, FOREST_MAGIC, "forest")?;
        check_version(r.get_u32()?, D)?;
        let header = Self {
            dim: r.get_u32()?,
            max_level: r.get_u32()?,
            global_count: r.get_u64()?,
            rank_count: r.get_u32()?,
        };
        if header.dim != D as u32 {
            return Err(ForestError::DimensionMismatch {
                expected: D as u32,
                found: header.dim,
            });
        }
        if header.max_level != u32::from(Quadrant::<D>::MAX_LEVEL) {
            return Err(ForestError::CorruptHeader(format!(
                "max level {} does not match {}",
                header.max_level,
                Quadrant::<D>::MAX_LEVEL
            )));
        }
        if header.rank_count == 0 {
            return Err(ForestError::CorruptHeader("saved with zero ranks".into()));
        }
        Ok(header)
    }
}

/// Read and check the saved ownership table (`rank_count + 1` prefix sums).
pub fn read_offsets(
    r: &mut ByteReader<'_>,
    header: &ForestHeader,
) -> Result<Vec<u64>, ForestError> {
    let offsets = (0..=header.rank_count)
        .map(|_| r.get_u64())
        .collect::<Result<Vec<_>, _>>()?;
    let monotone = offsets.windows(2).all(|w| w[0] <= w[1]);
    if offsets.first() != Some(&0) || offsets.last() != Some(&header.global_count) || !monotone {
        return Err(ForestError::CorruptHeader(format!(
            "ownership table {offsets:?} does not partition {} quadrants",
            header.global_count
        )));
    }
    Ok(offsets)
}

pub fn write_records<const D: usize>(w: &mut ByteWriter, quads: &[Quadrant<D>]) {
    for q in quads {
        w.put_u32(q.tree);
        w.put_u32(u32::from(q.level));
        q.coords.iter().for_each(|&c| w.put_u32(c));
    }
}

/// Decode quadrant records, checking level, alignment and tree range.
pub fn read_records<const D: usize>(
    r: &mut ByteReader<'_>,
    count: usize,
    num_trees: u32,
) -> Result<Vec<Quadrant<D>>, ForestError> {
    let mut out = Vec::with_capacity(count.min(r.remaining() / record_len(D)));
    for _ in 0..count {
        let tree = r.get_u32()?;
        let level = r.get_u32()?;
        let mut coords = [0u32; D];
        for c in &mut coords {
            *c = r.get_u32()?;
        }
        let level = u8::try_from(level)
            .map_err(|_| ForestError::CorruptHeader(format!("quadrant level {level}")))?;
        if tree >= num_trees {
            return Err(ForestError::InvalidQuadrant(format!(
                "tree {tree} of {num_trees}"
            )));
        }
        out.push(Quadrant::new(tree, level, coords)?);
    }
    Ok(out)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::topology::builders;

    #[test]
    fn connectivity_block_roundtrip_and_length() {
        let conn = builders::star::<3>(5).unwrap();
        let mut w = ByteWriter::new();
        write_connectivity(&mut w, &conn);
        let bytes = w.into_inner();
        assert_eq!(
            connectivity_block_len::<3>(conn.num_trees(), conn.num_vertices()),
            Some(bytes.len() as u64)
        );
        let mut r = ByteReader::new(&bytes);
        let back = read_connectivity::<3>(&mut r).unwrap();
        assert_eq!(r.remaining(), 0);
        assert!(back.is_equal(&conn));
    }

    #[test]
    fn version_checks() {
        assert!(check_version(version_word(2), 2).is_ok());
        assert_eq!(
            check_version((2 << 24) | 7, 2),
            Err(ForestError::FormatVersionMismatch {
                found: 7,
                supported: 1
            })
        );
        assert_eq!(
            check_version(version_word(3), 2),
            Err(ForestError::DimensionMismatch {
                expected: 2,
                found: 3
            })
        );
    }

    #[test]
    fn inflated_counts_fail_before_allocating() {
        let mut w = ByteWriter::new();
        w.put_bytes(&CONNECTIVITY_MAGIC);
        w.put_u32(version_word(2));
        w.put_u32(u32::MAX);
        w.put_u32(u32::MAX);
        let bytes = w.into_inner();
        assert!(matches!(
            read_connectivity::<2>(&mut ByteReader::new(&bytes)),
            Err(ForestError::CorruptHeader(_))
        ));
    }

    #[test]
    fn records_reject_bad_quadrants() {
        let mut w = ByteWriter::new();
        write_records(&mut w, &[Quadrant::<2>::root(0)]);
        w.put_u32(0);
        w.put_u32(1);
        w.put_u32(3);
        w.put_u32(0);
        let bytes = w.into_inner();
        assert_eq!(bytes.len(), 2 * record_len(2));
        let mut r = ByteReader::new(&bytes);
        assert!(matches!(
            read_records::<2>(&mut r, 2, 1),
            Err(ForestError::InvalidQuadrant(_))
        ));
        let mut r = ByteReader::new(&bytes[..record_len(2)]);
        assert!(matches!(
            read_records::<2>(&mut r, 1, 0),
            Err(ForestError::InvalidQuadrant(_))
        ));
    }
}
