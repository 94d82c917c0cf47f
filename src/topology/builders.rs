//! Named connectivities used as fixtures and by [`build_connectivity`].
//!
//! Every builder assembles a [`TopologyDescription`] and goes through
//! [`Connectivity::build`], so the fixtures are validated like user input.
//! Trees get their own `2^D` vertices placed on a unit grid.

use super::connectivity::{Connectivity, FaceLink, TopologyDescription};
use crate::forest_error::ForestError;

struct Draft<const D: usize> {
    vertices: Vec<[f64; 3]>,
    tree_to_vertex: Vec<Vec<u32>>,
    links: Vec<Vec<FaceLink>>,
}

impl<const D: usize> Draft<D> {
    fn new() -> Self {
        Self {
            vertices: Vec::new(),
            tree_to_vertex: Vec::new(),
            links: Vec::new(),
        }
    }

    /// Add a tree with all faces on the boundary, its lower corner at `origin`.
    fn add_tree(&mut self, origin: [f64; 3]) -> u32 {
        let tree = self.links.len() as u32;
        let first = self.vertices.len() as u32;
        for corner in 0..Connectivity::<D>::CORNERS {
            let mut v = origin;
            for (axis, x) in v.iter_mut().enumerate().take(D) {
                *x += ((corner >> axis) & 1) as f64;
            }
            self.vertices.push(v);
        }
        self.tree_to_vertex
            .push((first..first + Connectivity::<D>::CORNERS as u32).collect());
        self.links.push(
            (0..Connectivity::<D>::FACES as u8)
                .map(|face| FaceLink {
                    tree,
                    face,
                    orientation: 0,
                })
                .collect(),
        );
        tree
    }

    /// Glue two faces; both sides record the same orientation.
    fn glue(&mut self, t0: u32, f0: u8, t1: u32, f1: u8, orientation: u8) {
        self.links[t0 as usize][f0 as usize] = FaceLink {
            tree: t1,
            face: f1,
            orientation,
        };
        self.links[t1 as usize][f1 as usize] = FaceLink {
            tree: t0,
            face: f0,
            orientation,
        };
    }

    fn build(self) -> Result<Connectivity<D>, ForestError> {
        let desc = TopologyDescription {
            dim: D as u32,
            num_trees: self.links.len() as u32,
            vertices: self.vertices,
            tree_to_vertex: self.tree_to_vertex,
            tree_to_tree: self
                .links
                .iter()
                .map(|row| row.iter().map(|l| l.tree).collect())
                .collect(),
            tree_to_face: self
                .links
                .iter()
                .map(|row| row.iter().map(Connectivity::<D>::encode_face).collect())
                .collect(),
        };
        Connectivity::build(&desc)
    }
}

/// A single tree with boundary faces.
pub fn unit<const D: usize>() -> Result<Connectivity<D>, ForestError> {
    let mut d = Draft::<D>::new();
    d.add_tree([0.0; 3]);
    d.build()
}

/// A single tree with every pair of opposite faces glued.
pub fn periodic<const D: usize>() -> Result<Connectivity<D>, ForestError> {
    let mut d = Draft::<D>::new();
    let t = d.add_tree([0.0; 3]);
    for axis in 0..D as u8 {
        d.glue(t, 2 * axis, t, 2 * axis + 1, 0);
    }
    d.build()
}

/// A single quadtree whose x faces are glued with a flip and y faces periodically.
pub fn rotwrap<const D: usize>() -> Result<Connectivity<D>, ForestError> {
    if D != 2 {
        return Err(ForestError::InvalidTopology(format!(
            "rotwrap is a 2D topology, requested for D = {D}"
        )));
    }
    let mut d = Draft::<D>::new();
    let t = d.add_tree([0.0; 3]);
    d.glue(t, 0, t, 1, 1);
    d.glue(t, 2, t, 3, 0);
    d.build()
}

/// `n` trees in a row along x, the last glued back to the first.
pub fn ring<const D: usize>(n: u32) -> Result<Connectivity<D>, ForestError> {
    if n == 0 {
        return Err(ForestError::InvalidTopology(
            "a ring needs at least one tree".into(),
        ));
    }
    let mut d = Draft::<D>::new();
    for i in 0..n {
        d.add_tree([f64::from(i), 0.0, 0.0]);
    }
    for i in 0..n {
        d.glue(i, 1, (i + 1) % n, 0, 0);
    }
    d.build()
}

/// A center tree 0 with `k` outer trees: outer tree `i` sits across center
/// face `i - 1` and is glued with its opposite face and a rotated pairing.
pub fn star<const D: usize>(k: u32) -> Result<Connectivity<D>, ForestError> {
    let faces = Connectivity::<D>::FACES as u32;
    if !(3..=faces).contains(&k) {
        return Err(ForestError::InvalidTopology(format!(
            "a star needs 3..={faces} outer trees, got {k}"
        )));
    }
    let mut d = Draft::<D>::new();
    let center = d.add_tree([0.0; 3]);
    for i in 1..=k {
        let face = (i - 1) as u8;
        let (axis, upper) = (usize::from(face / 2), face % 2 == 1);
        let mut origin = [0.0; 3];
        origin[axis] = if upper { 1.0 } else { -1.0 };
        let outer = d.add_tree(origin);
        let orientation = face % Connectivity::<D>::ORIENTATIONS;
        d.glue(center, face, outer, face ^ 1, orientation);
    }
    d.build()
}

/// Two octrees glued across tree 0's upper x face and tree 1's lower z face.
pub fn twocubes<const D: usize>() -> Result<Connectivity<D>, ForestError> {
    if D != 3 {
        return Err(ForestError::InvalidTopology(format!(
            "twocubes is a 3D topology, requested for D = {D}"
        )));
    }
    let mut d = Draft::<D>::new();
    let a = d.add_tree([0.0; 3]);
    let b = d.add_tree([1.0, 0.0, 0.0]);
    d.glue(a, 1, b, 4, 2);
    d.build()
}

/// Build a named connectivity: `unit`, `periodic`, `rotwrap` (2D), `ring`
/// (3 trees), `star` (`2*D` outer trees) or `twocubes` (3D).
pub fn build_connectivity<const D: usize>(name: &str) -> Result<Connectivity<D>, ForestError> {
    match name {
        "unit" => unit(),
        "periodic" => periodic(),
        "rotwrap" => rotwrap(),
        "ring" => ring(3),
        "star" => star(2 * D as u32),
        "twocubes" => twocubes(),
        other => Err(ForestError::InvalidTopology(format!(
            "unknown connectivity '{other}'"
        ))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn star_has_rotated_pairs() {
        let c = star::<2>(4).unwrap();
        assert_eq!(c.num_trees(), 5);
        assert_eq!(c.num_vertices(), 20);
        let l = c.face_neighbor(0, 1).unwrap();
        assert_eq!((l.tree, l.face, l.orientation), (2, 0, 1));
        assert_eq!(c.face_neighbor(2, 0).unwrap().tree, 0);
        assert!(c.is_boundary_face(1, 0));
    }

    #[test]
    fn star_bounds() {
        assert!(star::<2>(2).is_err());
        assert!(star::<2>(5).is_err());
        assert_eq!(star::<3>(6).unwrap().num_trees(), 7);
    }

    #[test]
    fn periodic_and_rotwrap_glue_to_self() {
        let p = periodic::<3>().unwrap();
        assert_eq!(p.face_neighbor(0, 4).unwrap().face, 5);
        let r = rotwrap::<2>().unwrap();
        assert_eq!(r.face_neighbor(0, 1).unwrap().orientation, 1);
        assert!(rotwrap::<3>().is_err());
    }

    #[test]
    fn single_tree_ring_is_periodic_in_x() {
        let r = ring::<2>(1).unwrap();
        let l = r.face_neighbor(0, 1).unwrap();
        assert_eq!((l.tree, l.face), (0, 0));
        assert!(r.is_boundary_face(0, 2));
    }

    #[test]
    fn names_resolve() {
        for name in ["unit", "periodic", "rotwrap", "ring", "star"] {
            assert!(build_connectivity::<2>(name).is_ok(), "{name}");
        }
        assert_eq!(build_connectivity::<3>("twocubes").unwrap().num_trees(), 2);
        assert_eq!(build_connectivity::<3>("star").unwrap().num_trees(), 7);
        assert!(matches!(
            build_connectivity::<2>("moebius"),
            Err(ForestError::InvalidTopology(_))
        ));
    }
}
