//! Quadrant/octant codec: Morton (Z-order) indices and the refinement hierarchy.
//!
//! A quadrant is identified by its root tree, its level, and the integer
//! coordinates of its lower corner on the finest grid of `2^MAX_LEVEL` cells
//! per axis. All functions here are pure.

use crate::forest_error::ForestError;
use std::cmp::Ordering;

/// Deepest level of a quadtree (two coordinates of 30 bits fit a `u64` position).
pub const MAX_LEVEL_2D: u8 = 30;
/// Deepest level of an octree (three coordinates of 19 bits fit a `u64` position).
pub const MAX_LEVEL_3D: u8 = 19;

/// A cell in a quadtree (`D = 2`) or octree (`D = 3`) forest.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Quadrant<const D: usize> {
    /// Root tree the quadrant lives in.
    pub tree: u32,
    /// Refinement level (0 is the tree root).
    pub level: u8,
    /// Lower-corner coordinates on the finest grid; the low `MAX_LEVEL - level`
    /// bits are zero.
    pub coords: [u32; D],
}

/// A quadtree cell.
pub type Quadrant2 = Quadrant<2>;
/// An octree cell.
pub type Quadrant3 = Quadrant<3>;

/// Interleave the low `bits` bits of each coordinate, axis `a` at bit `D*k + a`.
fn interleave<const D: usize>(coords: &[u32; D], bits: u8) -> u64 {
    let mut key = 0u64;
    for b in 0..u32::from(bits) {
        for (axis, &c) in coords.iter().enumerate() {
            key |= u64::from((c >> b) & 1) << (D as u32 * b + axis as u32);
        }
    }
    key
}

fn deinterleave<const D: usize>(key: u64, bits: u8) -> [u32; D] {
    let mut coords = [0u32; D];
    for b in 0..u32::from(bits) {
        for (axis, c) in coords.iter_mut().enumerate() {
            *c |= (((key >> (D as u32 * b + axis as u32)) & 1) as u32) << b;
        }
    }
    coords
}

impl<const D: usize> Quadrant<D> {
    const DIM_OK: () = assert!(D == 2 || D == 3, "quadforest supports D = 2 or D = 3");

    /// Deepest admissible level for this dimension.
    pub const MAX_LEVEL: u8 = if D == 2 { MAX_LEVEL_2D } else { MAX_LEVEL_3D };
    /// Number of children (and corners) of a quadrant.
    pub const CHILDREN: usize = 1 << D;
    /// Number of faces of a quadrant.
    pub const FACES: usize = 2 * D;
    /// Side length of a tree root on the finest grid.
    pub const ROOT_LEN: u32 = 1 << Self::MAX_LEVEL;

    /// The level-0 quadrant covering `tree`.
    pub fn root(tree: u32) -> Self {
        let () = Self::DIM_OK;
        Self {
            tree,
            level: 0,
            coords: [0; D],
        }
    }

    /// Build a quadrant, rejecting unaligned or out-of-domain coordinates.
    pub fn new(tree: u32, level: u8, coords: [u32; D]) -> Result<Self, ForestError> {
        let () = Self::DIM_OK;
        let q = Self {
            tree,
            level,
            coords,
        };
        if q.is_valid() {
            Ok(q)
        } else {
            Err(ForestError::InvalidQuadrant(format!(
                "tree {tree} level {level} coords {coords:?} is not aligned inside the root"
            )))
        }
    }

    /// Level in range, coordinates inside the root and aligned to the level.
    pub fn is_valid(&self) -> bool {
        if self.level > Self::MAX_LEVEL {
            return false;
        }
        let mask = self.side_length() - 1;
        self.coords
            .iter()
            .all(|&c| c < Self::ROOT_LEN && c & mask == 0)
    }

    /// Side length on the finest grid.
    #[inline]
    pub fn side_length(&self) -> u32 {
        1 << (Self::MAX_LEVEL - self.level.min(Self::MAX_LEVEL))
    }

    /// Finest-level Morton position of the lower corner.
    #[inline]
    pub fn position(&self) -> u64 {
        interleave(&self.coords, Self::MAX_LEVEL)
    }

    /// Finest-level Morton position of the last finest descendant.
    pub fn last_position(&self) -> u64 {
        self.position() + (1u64 << (D as u32 * u32::from(Self::MAX_LEVEL - self.level))) - 1
    }

    /// Morton index of the (ancestor or self) quadrant at `level` among the
    /// `2^(D*level)` quadrants of that level in the tree.
    ///
    /// Fails if `level` is finer than `self.level`.
    pub fn linear_id(&self, level: u8) -> Result<u64, ForestError> {
        if level > self.level {
            return Err(ForestError::InvalidQuadrant(format!(
                "no ancestor of {self:?} at level {level}"
            )));
        }
        let shift = Self::MAX_LEVEL - level;
        let mut coords = self.coords;
        for c in &mut coords {
            *c >>= shift;
        }
        Ok(interleave(&coords, level))
    }

    /// Inverse of [`Quadrant::linear_id`].
    pub fn from_linear_id(tree: u32, level: u8, id: u64) -> Result<Self, ForestError> {
        let () = Self::DIM_OK;
        if level > Self::MAX_LEVEL {
            return Err(ForestError::AtMaxRefinement { level });
        }
        if id >> (D as u32 * u32::from(level)) != 0 {
            return Err(ForestError::InvalidQuadrant(format!(
                "Morton index {id} exceeds level {level}"
            )));
        }
        let shift = Self::MAX_LEVEL - level;
        let mut coords = deinterleave::<D>(id, level);
        for c in &mut coords {
            *c <<= shift;
        }
        Ok(Self {
            tree,
            level,
            coords,
        })
    }

    /// Total order: tree, then Morton position, then ancestors before descendants.
    pub fn compare(&self, other: &Self) -> Ordering {
        self.tree
            .cmp(&other.tree)
            .then_with(|| self.position().cmp(&other.position()))
            .then_with(|| self.level.cmp(&other.level))
    }

    /// True if `self` is a strict ancestor of `other`.
    pub fn is_ancestor(&self, other: &Self) -> bool {
        if self.tree != other.tree || self.level >= other.level {
            return false;
        }
        let shift = Self::MAX_LEVEL - self.level;
        self.coords
            .iter()
            .zip(other.coords.iter())
            .all(|(&a, &b)| u64::from(a) >> shift == u64::from(b) >> shift)
    }

    /// True if `self` is the parent of `other`.
    pub fn is_parent(&self, other: &Self) -> bool {
        self.level + 1 == other.level && self.is_ancestor(other)
    }

    /// True if the two quadrants share any area (equal or one contains the other).
    pub fn overlaps(&self, other: &Self) -> bool {
        self == other || self.is_ancestor(other) || other.is_ancestor(self)
    }

    pub fn is_equal(&self, other: &Self) -> bool {
        self.compare(other) == Ordering::Equal
    }

    /// True if the finest-level Morton `position` in `tree` lies inside `self`.
    pub fn contains_position(&self, tree: u32, position: u64) -> bool {
        self.tree == tree && (self.position()..=self.last_position()).contains(&position)
    }

    /// The quadrant one level coarser containing `self`.
    pub fn parent(&self) -> Result<Self, ForestError> {
        if self.level == 0 {
            return Err(ForestError::AtMaxRefinement { level: 0 });
        }
        self.ancestor(self.level - 1)
    }

    /// The ancestor at `level` (`self` when `level == self.level`).
    pub fn ancestor(&self, level: u8) -> Result<Self, ForestError> {
        if level > self.level {
            return Err(ForestError::InvalidQuadrant(format!(
                "level {level} is finer than quadrant level {}",
                self.level
            )));
        }
        let shift = Self::MAX_LEVEL - level;
        let mut coords = self.coords;
        for c in &mut coords {
            *c = ((u64::from(*c) >> shift) << shift) as u32;
        }
        Ok(Self {
            tree: self.tree,
            level,
            coords,
        })
    }

    /// Child `id`, bit `a` of `id` selecting the upper half along axis `a`.
    pub fn child(&self, id: usize) -> Result<Self, ForestError> {
        if self.level >= Self::MAX_LEVEL {
            return Err(ForestError::AtMaxRefinement { level: self.level });
        }
        debug_assert!(id < Self::CHILDREN);
        let h = 1u32 << (Self::MAX_LEVEL - self.level - 1);
        let mut coords = self.coords;
        for (axis, c) in coords.iter_mut().enumerate() {
            if (id >> axis) & 1 == 1 {
                *c += h;
            }
        }
        Ok(Self {
            tree: self.tree,
            level: self.level + 1,
            coords,
        })
    }

    /// The `2^D` children in Morton order.
    pub fn children(&self) -> Result<Vec<Self>, ForestError> {
        (0..Self::CHILDREN).map(|id| self.child(id)).collect()
    }

    /// Position of `self` among its siblings (0 for a root).
    pub fn child_id(&self) -> usize {
        if self.level == 0 {
            return 0;
        }
        let shift = Self::MAX_LEVEL - self.level;
        self.coords
            .iter()
            .enumerate()
            .map(|(axis, &c)| (((c >> shift) & 1) as usize) << axis)
            .sum()
    }

    /// Sibling `id` of `self` (including `self` for `id == child_id()`).
    pub fn sibling(&self, id: usize) -> Result<Self, ForestError> {
        self.parent()?.child(id)
    }

    /// True if `quads` are exactly the `2^D` children of one parent, in order.
    pub fn is_family(quads: &[Self]) -> bool {
        if quads.len() != Self::CHILDREN {
            return false;
        }
        let Ok(parent) = quads[0].parent() else {
            return false;
        };
        quads
            .iter()
            .enumerate()
            .all(|(id, q)| parent.child(id).is_ok_and(|c| c == *q))
    }

    fn check_descendant_level(&self, level: u8) -> Result<(), ForestError> {
        if level > Self::MAX_LEVEL {
            return Err(ForestError::AtMaxRefinement { level });
        }
        if level < self.level {
            return Err(ForestError::InvalidQuadrant(format!(
                "no descendant of {self:?} at level {level}"
            )));
        }
        Ok(())
    }

    /// Smallest descendant at `level` (shares the lower corner).
    pub fn first_descendant(&self, level: u8) -> Result<Self, ForestError> {
        self.check_descendant_level(level)?;
        Ok(Self {
            tree: self.tree,
            level,
            coords: self.coords,
        })
    }

    /// Largest descendant at `level` (shares the upper corner).
    pub fn last_descendant(&self, level: u8) -> Result<Self, ForestError> {
        self.check_descendant_level(level)?;
        let delta = self.side_length() - (1u32 << (Self::MAX_LEVEL - level));
        let mut coords = self.coords;
        for c in &mut coords {
            *c += delta;
        }
        Ok(Self {
            tree: self.tree,
            level,
            coords,
        })
    }

    /// Finest quadrant containing both `self` and `other` (same tree required).
    pub fn nearest_common_ancestor(&self, other: &Self) -> Self {
        debug_assert_eq!(self.tree, other.tree);
        let diff = self
            .coords
            .iter()
            .zip(other.coords.iter())
            .fold(0u32, |acc, (&a, &b)| acc | (a ^ b));
        let differing_bits = (32 - diff.leading_zeros()) as u8;
        let level = (Self::MAX_LEVEL - differing_bits)
            .min(self.level)
            .min(other.level);
        Self {
            tree: self.tree,
            level,
            coords: self.coords.map(|c| {
                let shift = Self::MAX_LEVEL - level;
                ((u64::from(c) >> shift) << shift) as u32
            }),
        }
    }
}

impl<const D: usize> PartialOrd for Quadrant<D> {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl<const D: usize> Ord for Quadrant<D> {
    fn cmp(&self, other: &Self) -> Ordering {
        self.compare(other)
    }
}
