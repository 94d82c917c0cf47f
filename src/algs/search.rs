//! Searches over sorted quadrant arrays and top-down traversals of a forest.

use crate::forest::{Forest, Quadrant};
use crate::forest_error::ForestError;
use std::cmp::Ordering;

/// Lowest index `i` with `array[i] >= q`, or `None` if every entry is smaller.
///
/// `guess` is the first index probed; a good guess makes the search O(1).
pub fn find_lower_bound<const D: usize>(
    array: &[Quadrant<D>],
    q: &Quadrant<D>,
    guess: usize,
) -> Option<usize> {
    if array.is_empty() {
        return None;
    }
    let (mut low, mut high) = (0usize, array.len() - 1);
    let mut guess = guess.min(high);
    loop {
        if array[guess].compare(q) == Ordering::Less {
            low = guess + 1;
            if low > high {
                return None;
            }
            guess = (low + high) / 2;
            continue;
        }
        if guess > low && array[guess - 1].compare(q) != Ordering::Less {
            high = guess - 1;
            guess = (low + high + 1) / 2;
            continue;
        }
        return Some(guess);
    }
}

/// Highest index `i` with `array[i] <= q`, or `None` if every entry is larger.
pub fn find_higher_bound<const D: usize>(
    array: &[Quadrant<D>],
    q: &Quadrant<D>,
    guess: usize,
) -> Option<usize> {
    if array.is_empty() {
        return None;
    }
    let (mut low, mut high) = (0usize, array.len() - 1);
    let mut guess = guess.min(high);
    loop {
        if array[guess].compare(q) == Ordering::Greater {
            if guess == low {
                return None;
            }
            high = guess - 1;
            guess = (low + high + 1) / 2;
            continue;
        }
        if guess < high && array[guess + 1].compare(q) != Ordering::Greater {
            low = guess + 1;
            guess = (low + high) / 2;
            continue;
        }
        return Some(guess);
    }
}

/// Split a sorted array of strict descendants of one level-`level` quadrant
/// by that quadrant's children.
///
/// Returns `2^D + 1` indices: the descendants of child `i` are
/// `array[indices[i]..indices[i + 1]]`.
pub fn split_array<const D: usize>(
    array: &[Quadrant<D>],
    level: u8,
) -> Result<Vec<usize>, ForestError> {
    if level >= Quadrant::<D>::MAX_LEVEL {
        return Err(ForestError::AtMaxRefinement { level });
    }
    if let Some(q) = array.iter().find(|q| q.level <= level) {
        return Err(ForestError::InvalidQuadrant(format!(
            "{q:?} is not a strict descendant of a level {level} quadrant"
        )));
    }
    let child_of = |q: &Quadrant<D>| q.ancestor(level + 1).map_or(0, |a| a.child_id());
    Ok((0..=Quadrant::<D>::CHILDREN)
        .map(|i| array.partition_point(|q| child_of(q) < i))
        .collect())
}

/// Faces, edges and corners of a quadrant touched by a range of its descendants.
///
/// `mask` holds the faces in bits `0..2D`, then the twelve edges of an octant
/// (none for quadtrees), then the `2^D` corners. Octant edges `0..4` run along
/// x, `4..8` along y and `8..12` along z; within a group, bits 0 and 1 of the
/// edge number give the position along the two remaining axes.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RangeBoundaries {
    pub faces: Vec<u8>,
    pub edges: Vec<u8>,
    pub corners: Vec<u8>,
    pub mask: u32,
}

const fn num_edges<const D: usize>() -> usize {
    if D == 3 { 12 } else { 0 }
}

impl RangeBoundaries {
    fn from_mask<const D: usize>(mask: u32) -> Self {
        let faces = Quadrant::<D>::FACES;
        let edges = num_edges::<D>();
        let pick = |first: usize, count: usize| -> Vec<u8> {
            (0..count as u8)
                .filter(|&i| mask & (1 << (first + usize::from(i))) != 0)
                .collect()
        };
        Self {
            faces: pick(0, faces),
            edges: pick(faces, edges),
            corners: pick(faces + edges, Quadrant::<D>::CHILDREN),
            mask,
        }
    }
}

fn full_mask<const D: usize>() -> u32 {
    (1u32 << (Quadrant::<D>::FACES + num_edges::<D>() + Quadrant::<D>::CHILDREN)) - 1
}

/// True if child `cid` lies on the parent's edge `edge`.
fn child_on_edge(edge: usize, cid: usize) -> bool {
    let axis = edge / 4;
    let mut others = (0..3).filter(|&a| a != axis);
    let (Some(o0), Some(o1)) = (others.next(), others.next()) else {
        return false;
    };
    (cid >> o0) & 1 == edge & 1 && (cid >> o1) & 1 == (edge >> 1) & 1
}

/// Boundaries of the parent touched by child `cid`, given the child's own touched set.
fn lift<const D: usize>(child_mask: u32, cid: usize) -> u32 {
    let faces = Quadrant::<D>::FACES;
    let edges = num_edges::<D>();
    let mut mask = 0;
    for f in 0..faces {
        if child_mask & (1 << f) != 0 && (cid >> (f / 2)) & 1 == f % 2 {
            mask |= 1 << f;
        }
    }
    for e in 0..edges {
        if child_mask & (1 << (faces + e)) != 0 && child_on_edge(e, cid) {
            mask |= 1 << (faces + e);
        }
    }
    let corner = faces + edges + cid;
    if child_mask & (1 << corner) != 0 {
        mask |= 1 << corner;
    }
    mask
}

fn range_mask<const D: usize>(
    anc: &Quadrant<D>,
    lq: Option<&Quadrant<D>>,
    uq: Option<&Quadrant<D>>,
) -> u32 {
    // A bound that starts or ends exactly at the quadrant's corner does not cut it.
    let lq = lq.filter(|q| q.position() != anc.position());
    let uq = uq.filter(|q| q.last_position() != anc.last_position());
    if (lq.is_none() && uq.is_none()) || anc.level >= Quadrant::<D>::MAX_LEVEL {
        return full_mask::<D>();
    }
    let child_of = |q: &Quadrant<D>| q.ancestor(anc.level + 1).map_or(0, |a| a.child_id());
    let lid = lq.map_or(0, child_of);
    let uid = uq.map_or(Quadrant::<D>::CHILDREN - 1, child_of);
    let mut mask = 0;
    for cid in lid..=uid {
        let Ok(child) = anc.child(cid) else { continue };
        let lo = if cid == lid { lq } else { None };
        let hi = if cid == uid { uq } else { None };
        mask |= lift::<D>(range_mask(&child, lo, hi), cid);
    }
    mask
}

/// Boundaries of the level-`level` ancestor touched by the descendants from
/// `lq` to `uq` inclusive. A missing end extends the range to the ancestor's
/// first or last descendant. At least one end must be given.
pub fn find_range_boundaries<const D: usize>(
    lq: Option<&Quadrant<D>>,
    uq: Option<&Quadrant<D>>,
    level: u8,
) -> Result<RangeBoundaries, ForestError> {
    let anchor = lq.or(uq).ok_or_else(|| {
        ForestError::InvalidQuadrant("a range needs at least one bounding quadrant".into())
    })?;
    let anc = anchor.ancestor(level)?;
    let outside = |q: &&Quadrant<D>| q.level < level || q.ancestor(level).ok() != Some(anc);
    if let Some(other) = lq.into_iter().chain(uq).find(outside) {
        return Err(ForestError::InvalidQuadrant(format!("{other:?} is not inside {anc:?}")));
    }
    Ok(RangeBoundaries::from_mask::<D>(range_mask(&anc, lq, uq)))
}

fn recurse_local<const D: usize, P, Q, T>(
    quad: Quadrant<D>,
    leaves: &[Quadrant<D>],
    offset: usize,
    active: &[usize],
    points: &[P],
    quadrant_fn: &mut Q,
    point_fn: &mut T,
) -> Result<(), ForestError>
where
    Q: FnMut(&Quadrant<D>, Option<usize>) -> bool,
    T: FnMut(&Quadrant<D>, Option<usize>, &P) -> bool,
{
    let is_leaf = leaves.len() == 1 && leaves[0] == quad;
    let local_num = is_leaf.then_some(offset);
    if !quadrant_fn(&quad, local_num) {
        return Ok(());
    }
    let survivors: Vec<usize> = active
        .iter()
        .copied()
        .filter(|&i| point_fn(&quad, local_num, &points[i]))
        .collect();
    if !points.is_empty() && survivors.is_empty() {
        return Ok(());
    }
    if is_leaf {
        return Ok(());
    }
    let split = split_array(leaves, quad.level)?;
    for (cid, w) in split.windows(2).enumerate() {
        if w[0] < w[1] {
            recurse_local(
                quad.child(cid)?,
                &leaves[w[0]..w[1]],
                offset + w[0],
                &survivors,
                points,
                quadrant_fn,
                point_fn,
            )?;
        }
    }
    Ok(())
}

/// Top-down search over the local quadrants.
///
/// For each tree the recursion starts at the nearest common ancestor of the
/// local quadrants in that tree. `quadrant_fn` receives each visited quadrant
/// and, for leaves, its local index; returning false prunes the branch. With a
/// non-empty `points`, `point_fn` filters the points that stay active below a
/// quadrant and the branch stops when none survive.
pub fn search_local<const D: usize, P, Q, T>(
    forest: &Forest<D>,
    mut quadrant_fn: Q,
    points: &[P],
    mut point_fn: T,
) -> Result<(), ForestError>
where
    Q: FnMut(&Quadrant<D>, Option<usize>) -> bool,
    T: FnMut(&Quadrant<D>, Option<usize>, &P) -> bool,
{
    let all: Vec<usize> = (0..points.len()).collect();
    let mut offset = 0;
    for leaves in forest.local_quadrants().chunk_by(|a, b| a.tree == b.tree) {
        let (first, last) = (leaves[0], leaves[leaves.len() - 1]);
        let root = first.nearest_common_ancestor(&last);
        recurse_local(
            root,
            leaves,
            offset,
            &all,
            points,
            &mut quadrant_fn,
            &mut point_fn,
        )?;
        offset += leaves.len();
    }
    Ok(())
}

fn recurse_partition<const D: usize, P, Q, T>(
    forest: &Forest<D>,
    quad: Quadrant<D>,
    active: &[usize],
    points: &[P],
    quadrant_fn: &mut Q,
    point_fn: &mut T,
) -> Result<(), ForestError>
where
    Q: FnMut(&Quadrant<D>, usize, usize) -> bool,
    T: FnMut(&Quadrant<D>, usize, usize, &P) -> bool,
{
    let (Some(pfirst), Some(plast)) = (
        forest.owner_of_position(quad.tree, quad.position()),
        forest.owner_of_position(quad.tree, quad.last_position()),
    ) else {
        return Ok(());
    };
    if !quadrant_fn(&quad, pfirst, plast) {
        return Ok(());
    }
    let survivors: Vec<usize> = active
        .iter()
        .copied()
        .filter(|&i| point_fn(&quad, pfirst, plast, &points[i]))
        .collect();
    if (!points.is_empty() && survivors.is_empty())
        || pfirst == plast
        || quad.level >= Quadrant::<D>::MAX_LEVEL
    {
        return Ok(());
    }
    for child in quad.children()? {
        recurse_partition(forest, child, &survivors, points, quadrant_fn, point_fn)?;
    }
    Ok(())
}

/// Top-down search over the global partition using the partition markers.
///
/// The callbacks receive the first and last rank owning part of each visited
/// quadrant. Recursion below a quadrant continues only while it is split
/// between several ranks. Needs a synchronized forest; no communication.
pub fn search_partition<const D: usize, P, Q, T>(
    forest: &Forest<D>,
    mut quadrant_fn: Q,
    points: &[P],
    mut point_fn: T,
) -> Result<(), ForestError>
where
    Q: FnMut(&Quadrant<D>, usize, usize) -> bool,
    T: FnMut(&Quadrant<D>, usize, usize, &P) -> bool,
{
    if !forest.is_synchronized() {
        return Err(ForestError::InvalidForest(
            "partition search needs a synchronized forest".into(),
        ));
    }
    let all: Vec<usize> = (0..points.len()).collect();
    for tree in 0..forest.connectivity().num_trees() {
        recurse_partition(
            forest,
            Quadrant::root(tree),
            &all,
            points,
            &mut quadrant_fn,
            &mut point_fn,
        )?;
    }
    Ok(())
}

#[allow(clippy::too_many_arguments)]
fn recurse_all<const D: usize, P, Q, T>(
    forest: &Forest<D>,
    quad: Quadrant<D>,
    leaves: &[Quadrant<D>],
    offset: usize,
    active: &[usize],
    points: &[P],
    quadrant_fn: &mut Q,
    point_fn: &mut T,
) -> Result<(), ForestError>
where
    Q: FnMut(&Quadrant<D>, usize, usize, Option<usize>) -> bool,
    T: FnMut(&Quadrant<D>, usize, usize, Option<usize>, &P) -> bool,
{
    let (Some(pfirst), Some(plast)) = (
        forest.owner_of_position(quad.tree, quad.position()),
        forest.owner_of_position(quad.tree, quad.last_position()),
    ) else {
        return Ok(());
    };
    let single = pfirst == plast;
    let is_leaf = single && pfirst == forest.rank() && leaves.len() == 1 && leaves[0] == quad;
    let local_num = is_leaf.then_some(offset);
    if !quadrant_fn(&quad, pfirst, plast, local_num) {
        return Ok(());
    }
    let survivors: Vec<usize> = active
        .iter()
        .copied()
        .filter(|&i| point_fn(&quad, pfirst, plast, local_num, &points[i]))
        .collect();
    if (!points.is_empty() && survivors.is_empty())
        || is_leaf
        || (single && (pfirst != forest.rank() || leaves.is_empty()))
        || quad.level >= Quadrant::<D>::MAX_LEVEL
    {
        return Ok(());
    }
    let split = split_array(leaves, quad.level)?;
    for (cid, w) in split.windows(2).enumerate() {
        recurse_all(
            forest,
            quad.child(cid)?,
            &leaves[w[0]..w[1]],
            offset + w[0],
            &survivors,
            points,
            quadrant_fn,
            point_fn,
        )?;
    }
    Ok(())
}

/// Top-down search over the whole forest, local and remote.
///
/// Every rank starts at the tree roots. The callbacks receive the first and
/// last owning rank of each visited quadrant and, for local leaves, its local
/// index. The recursion goes on while a quadrant is split between ranks, or
/// while it belongs to this rank alone and is not yet a local leaf. Remote
/// branches end at the first quadrant owned by a single rank. `point_fn`
/// filters the points that stay active below a quadrant; its answer is
/// ignored at local leaves. Needs a synchronized forest; no communication.
pub fn search_all<const D: usize, P, Q, T>(
    forest: &Forest<D>,
    mut quadrant_fn: Q,
    points: &[P],
    mut point_fn: T,
) -> Result<(), ForestError>
where
    Q: FnMut(&Quadrant<D>, usize, usize, Option<usize>) -> bool,
    T: FnMut(&Quadrant<D>, usize, usize, Option<usize>, &P) -> bool,
{
    if !forest.is_synchronized() {
        return Err(ForestError::InvalidForest(
            "search needs a synchronized forest".into(),
        ));
    }
    let all: Vec<usize> = (0..points.len()).collect();
    let local = forest.local_quadrants();
    for tree in 0..forest.connectivity().num_trees() {
        let lo = local.partition_point(|q| q.tree < tree);
        let hi = local.partition_point(|q| q.tree <= tree);
        recurse_all(
            forest,
            Quadrant::root(tree),
            &local[lo..hi],
            lo,
            &all,
            points,
            &mut quadrant_fn,
            &mut point_fn,
        )?;
    }
    Ok(())
}
