//! Coarse topology of a forest: root trees, their face adjacency and optional
//! vertex embedding.
//!
//! A [`Connectivity`] is immutable once built and identical on every rank; it
//! is shared between forests through an `Arc`.

use crate::forest_error::ForestError;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// The far side of a tree face.
///
/// `orientation` is taken relative to the lower-numbered face of the pair, so
/// both sides of a link carry the same value. A boundary face links to itself
/// with orientation 0.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct FaceLink {
    pub tree: u32,
    pub face: u8,
    pub orientation: u8,
}

/// Serializable input to [`Connectivity::build`].
///
/// Tables are indexed by tree; `tree_to_vertex` may be empty when no vertices
/// are given. `tree_to_face` entries use the `face + 2*D*orientation` encoding.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TopologyDescription {
    pub dim: u32,
    pub num_trees: u32,
    #[serde(default)]
    pub vertices: Vec<[f64; 3]>,
    #[serde(default)]
    pub tree_to_vertex: Vec<Vec<u32>>,
    pub tree_to_tree: Vec<Vec<u32>>,
    pub tree_to_face: Vec<Vec<u8>>,
}

/// Root trees and their adjacency for a quadtree (`D = 2`) or octree (`D = 3`) forest.
#[derive(Debug, Clone)]
pub struct Connectivity<const D: usize> {
    num_trees: u32,
    tree_to_vertex: Vec<Vec<u32>>,
    faces: BTreeMap<(u32, u8), FaceLink>,
    vertices: Vec<[f64; 3]>,
}

/// Connectivity of a quadtree forest.
pub type QuadConnectivity = Connectivity<2>;
/// Connectivity of an octree forest.
pub type OctConnectivity = Connectivity<3>;

impl<const D: usize> Connectivity<D> {
    /// Faces per tree.
    pub const FACES: usize = 2 * D;
    /// Corners (and vertices) per tree.
    pub const CORNERS: usize = 1 << D;
    /// Distinct orientations of a face link.
    pub const ORIENTATIONS: u8 = if D == 2 { 2 } else { 4 };

    /// Encode a link as `face + 2*D*orientation`.
    pub fn encode_face(link: &FaceLink) -> u8 {
        link.face + (Self::FACES as u8) * link.orientation
    }

    /// Decode a `tree_to_face` entry paired with its `tree_to_tree` entry.
    pub fn decode_face(tree: u32, code: u8) -> Result<FaceLink, ForestError> {
        let faces = Self::FACES as u8;
        let orientation = code / faces;
        if orientation >= Self::ORIENTATIONS {
            return Err(ForestError::InvalidTopology(format!(
                "face code {code} encodes orientation {orientation}"
            )));
        }
        Ok(FaceLink {
            tree,
            face: code % faces,
            orientation,
        })
    }

    /// Validate a description and build the connectivity.
    ///
    /// Fails with [`ForestError::InvalidTopology`] when a table has the wrong
    /// shape, a vertex or tree index is out of range, or a face adjacency is
    /// not reported back by the neighbor.
    pub fn build(desc: &TopologyDescription) -> Result<Self, ForestError> {
        if desc.dim as usize != D {
            return Err(ForestError::DimensionMismatch {
                expected: D as u32,
                found: desc.dim,
            });
        }
        if desc.num_trees == 0 {
            return Err(ForestError::InvalidTopology(
                "a connectivity needs at least one tree".into(),
            ));
        }
        let n = desc.num_trees as usize;
        check_table_shape("tree_to_tree", &desc.tree_to_tree, n, Self::FACES)?;
        check_table_shape("tree_to_face", &desc.tree_to_face, n, Self::FACES)?;
        let num_vertices = desc.vertices.len();
        if num_vertices > 0 || !desc.tree_to_vertex.is_empty() {
            check_table_shape("tree_to_vertex", &desc.tree_to_vertex, n, Self::CORNERS)?;
            for (tree, vs) in desc.tree_to_vertex.iter().enumerate() {
                if let Some(&bad) = vs.iter().find(|&&v| v as usize >= num_vertices) {
                    return Err(ForestError::InvalidTopology(format!(
                        "tree {tree} references vertex {bad} but only {num_vertices} vertices exist"
                    )));
                }
            }
        }

        let mut faces = BTreeMap::new();
        for (tree, (ttt, ttf)) in desc
            .tree_to_tree
            .iter()
            .zip(desc.tree_to_face.iter())
            .enumerate()
        {
            for (face, (&nt, &code)) in ttt.iter().zip(ttf.iter()).enumerate() {
                faces.insert((tree as u32, face as u8), Self::decode_face(nt, code)?);
            }
        }

        let conn = Self {
            num_trees: desc.num_trees,
            tree_to_vertex: desc.tree_to_vertex.clone(),
            faces,
            vertices: desc.vertices.clone(),
        };
        conn.validate()?;
        Ok(conn)
    }

    /// Check ranges and face symmetry.
    pub fn validate(&self) -> Result<(), ForestError> {
        for (&(tree, face), link) in &self.faces {
            if link.tree >= self.num_trees {
                return Err(ForestError::InvalidTopology(format!(
                    "tree {tree} face {face} points to tree {} of {}",
                    link.tree, self.num_trees
                )));
            }
            if link.face as usize >= Self::FACES || link.orientation >= Self::ORIENTATIONS {
                return Err(ForestError::InvalidTopology(format!(
                    "tree {tree} face {face} has invalid link {link:?}"
                )));
            }
            if link.tree == tree && link.face == face {
                if link.orientation != 0 {
                    return Err(ForestError::InvalidTopology(format!(
                        "boundary face {face} of tree {tree} carries orientation {}",
                        link.orientation
                    )));
                }
                continue;
            }
            let expected = FaceLink {
                tree,
                face,
                orientation: link.orientation,
            };
            match self.faces.get(&(link.tree, link.face)) {
                Some(back) if *back == expected => {}
                Some(back) => {
                    return Err(ForestError::InvalidTopology(format!(
                        "tree {tree} face {face} -> {link:?} but the neighbor reports {back:?}"
                    )));
                }
                None => {
                    return Err(ForestError::InvalidTopology(format!(
                        "tree {tree} face {face} -> {link:?} has no reverse entry"
                    )));
                }
            }
        }
        Ok(())
    }

    /// Export the tables as a serializable description.
    pub fn to_description(&self) -> TopologyDescription {
        TopologyDescription {
            dim: D as u32,
            num_trees: self.num_trees,
            vertices: self.vertices.clone(),
            tree_to_vertex: self.tree_to_vertex.clone(),
            tree_to_tree: self
                .tree_rows()
                .map(|row| row.iter().map(|l| l.tree).collect())
                .collect(),
            tree_to_face: self
                .tree_rows()
                .map(|row| row.iter().map(Self::encode_face).collect())
                .collect(),
        }
    }

    fn tree_rows(&self) -> impl Iterator<Item = Vec<FaceLink>> + '_ {
        (0..self.num_trees).map(move |t| {
            self.faces
                .range((t, 0)..(t, Self::FACES as u8))
                .map(|(_, l)| *l)
                .collect()
        })
    }

    pub fn num_trees(&self) -> u32 {
        self.num_trees
    }

    pub fn num_vertices(&self) -> u32 {
        self.vertices.len() as u32
    }

    pub fn vertices(&self) -> &[[f64; 3]] {
        &self.vertices
    }

    pub fn vertex(&self, id: u32) -> Option<[f64; 3]> {
        self.vertices.get(id as usize).copied()
    }

    /// The `2^D` vertex ids of `tree`, or `None` without a vertex embedding.
    pub fn tree_vertices(&self, tree: u32) -> Option<&[u32]> {
        self.tree_to_vertex.get(tree as usize).map(Vec::as_slice)
    }

    pub fn face_neighbor(&self, tree: u32, face: u8) -> Option<FaceLink> {
        self.faces.get(&(tree, face)).copied()
    }

    pub fn is_boundary_face(&self, tree: u32, face: u8) -> bool {
        self.face_neighbor(tree, face)
            .is_some_and(|l| l.tree == tree && l.face == face)
    }

    /// All face links keyed by `(tree, face)` in ascending order.
    pub fn faces(&self) -> impl Iterator<Item = (&(u32, u8), &FaceLink)> {
        self.faces.iter()
    }

    /// Structural equality of all tables; vertex coordinates compare bitwise.
    pub fn is_equal(&self, other: &Self) -> bool {
        self.num_trees == other.num_trees
            && self.tree_to_vertex == other.tree_to_vertex
            && self.faces == other.faces
            && self.vertices.len() == other.vertices.len()
            && self
                .vertices
                .iter()
                .zip(other.vertices.iter())
                .all(|(a, b)| a.iter().zip(b.iter()).all(|(x, y)| x.to_bits() == y.to_bits()))
    }
}

impl<const D: usize> PartialEq for Connectivity<D> {
    fn eq(&self, other: &Self) -> bool {
        self.is_equal(other)
    }
}

impl<const D: usize> Eq for Connectivity<D> {}

fn check_table_shape<T>(
    name: &str,
    table: &[Vec<T>],
    rows: usize,
    width: usize,
) -> Result<(), ForestError> {
    if table.len() != rows {
        return Err(ForestError::InvalidTopology(format!(
            "{name} has {} rows, expected {rows}",
            table.len()
        )));
    }
    if let Some((tree, row)) = table.iter().enumerate().find(|(_, r)| r.len() != width) {
        return Err(ForestError::InvalidTopology(format!(
            "{name} row {tree} has {} entries, expected {width}",
            row.len()
        )));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn two_trees() -> TopologyDescription {
        // tree 0 face 1 <-> tree 1 face 0
        TopologyDescription {
            dim: 2,
            num_trees: 2,
            vertices: vec![],
            tree_to_vertex: vec![],
            tree_to_tree: vec![vec![0, 1, 0, 0], vec![0, 1, 1, 1]],
            tree_to_face: vec![vec![0, 0, 2, 3], vec![1, 1, 2, 3]],
        }
    }

    #[test]
    fn symmetric_links_build() {
        let conn = QuadConnectivity::build(&two_trees()).unwrap();
        assert_eq!(conn.num_trees(), 2);
        assert_eq!(
            conn.face_neighbor(0, 1),
            Some(FaceLink {
                tree: 1,
                face: 0,
                orientation: 0
            })
        );
        assert!(conn.is_boundary_face(0, 0));
        assert!(!conn.is_boundary_face(1, 0));
        assert_eq!(conn.to_description(), two_trees());
    }

    #[test]
    fn one_sided_link_is_rejected() {
        let mut desc = two_trees();
        desc.tree_to_tree[1][0] = 1;
        let err = QuadConnectivity::build(&desc).unwrap_err();
        assert!(matches!(err, ForestError::InvalidTopology(_)));
    }

    #[test]
    fn orientation_mismatch_is_rejected() {
        let mut desc = two_trees();
        desc.tree_to_face[1][0] = 1 + 4; // same face, orientation 1 on one side only
        assert!(matches!(
            QuadConnectivity::build(&desc),
            Err(ForestError::InvalidTopology(_))
        ));
    }

    #[test]
    fn vertex_out_of_range_is_rejected() {
        let mut desc = two_trees();
        desc.vertices = vec![[0.0; 3]; 4];
        desc.tree_to_vertex = vec![vec![0, 1, 2, 3], vec![1, 4, 3, 2]];
        assert!(matches!(
            QuadConnectivity::build(&desc),
            Err(ForestError::InvalidTopology(_))
        ));
    }

    #[test]
    fn wrong_dimension_is_reported() {
        assert_eq!(
            OctConnectivity::build(&two_trees()).unwrap_err(),
            ForestError::DimensionMismatch {
                expected: 3,
                found: 2
            }
        );
    }

    #[test]
    fn description_accepts_json() {
        let json = r#"{
            "dim": 2, "num_trees": 1,
            "tree_to_tree": [[0, 0, 0, 0]],
            "tree_to_face": [[1, 0, 3, 2]]
        }"#;
        let desc: TopologyDescription = serde_json::from_str(json).unwrap();
        let conn = QuadConnectivity::build(&desc).unwrap();
        assert_eq!(conn.num_vertices(), 0);
        assert_eq!(conn.face_neighbor(0, 0).unwrap().face, 1);
        assert!(conn.tree_vertices(0).is_none());
    }

    #[test]
    fn equality_is_symmetric_and_bitwise() {
        let mut desc = two_trees();
        desc.vertices = vec![[0.0, 0.0, 0.0], [1.0, 0.0, 0.0], [0.0, 1.0, 0.0], [1.0, 1.0, 0.0]];
        desc.tree_to_vertex = vec![vec![0, 1, 2, 3], vec![1, 0, 3, 2]];
        let a = QuadConnectivity::build(&desc).unwrap();
        desc.vertices[3][2] = -0.0;
        let b = QuadConnectivity::build(&desc).unwrap();
        assert!(a.is_equal(&a.clone()));
        assert!(!a.is_equal(&b));
        assert_eq!(a.is_equal(&b), b.is_equal(&a));
    }
}
