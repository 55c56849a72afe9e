//! Structure flattening: nested named mappings to flat ordered sequences and
//! back.
//!
//! The compiler moves parameters and optimizer state across the
//! identity-keyed, nested world of modules/optimizers and the positional,
//! value-based world of graph inputs. [`flatten`] produces the positional
//! sequence plus a [`TreeSpec`] descriptor; [`unflatten`] reverses it.
//! Sequence position is a stable index across repeated calls on structurally
//! identical inputs because maps preserve insertion order.

use crate::error::{CompileError, CompileResult};
use crate::tensor::TensorCell;

/// A nested named mapping with values at the leaves. Map entries keep
/// insertion order; flattening visits them depth-first in that order.
#[derive(Debug, Clone, PartialEq)]
pub enum Tree<T> {
    Leaf(T),
    Map(Vec<(String, Tree<T>)>),
}

/// Reconstruction descriptor: the shape of a [`Tree`] with the leaves
/// removed. Flatten-then-unflatten with the same descriptor is the identity.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TreeSpec {
    Leaf,
    Map(Vec<(String, TreeSpec)>),
}

impl TreeSpec {
    /// Number of leaves a matching sequence must supply.
    pub fn leaf_count(&self) -> usize {
        match self {
            TreeSpec::Leaf => 1,
            TreeSpec::Map(entries) => entries.iter().map(|(_, s)| s.leaf_count()).sum(),
        }
    }
}

/// Flattens a tree into its leaf sequence and reconstruction descriptor.
pub fn flatten<T: Clone>(tree: &Tree<T>) -> (Vec<T>, TreeSpec) {
    fn walk<T: Clone>(tree: &Tree<T>, leaves: &mut Vec<T>) -> TreeSpec {
        match tree {
            Tree::Leaf(value) => {
                leaves.push(value.clone());
                TreeSpec::Leaf
            }
            Tree::Map(entries) => TreeSpec::Map(
                entries
                    .iter()
                    .map(|(key, child)| (key.clone(), walk(child, leaves)))
                    .collect(),
            ),
        }
    }

    let mut leaves = Vec::new();
    let spec = walk(tree, &mut leaves);
    (leaves, spec)
}

/// Rebuilds a tree from a leaf sequence and its descriptor.
///
/// Fails with [`CompileError::StructureMismatch`] when the sequence length
/// disagrees with the descriptor, in either direction.
pub fn unflatten<T>(leaves: Vec<T>, spec: &TreeSpec) -> CompileResult<Tree<T>> {
    fn walk<T, I: Iterator<Item = T>>(spec: &TreeSpec, leaves: &mut I) -> Option<Tree<T>> {
        match spec {
            TreeSpec::Leaf => leaves.next().map(Tree::Leaf),
            TreeSpec::Map(entries) => {
                let mut rebuilt = Vec::with_capacity(entries.len());
                for (key, child) in entries {
                    rebuilt.push((key.clone(), walk(child, leaves)?));
                }
                Some(Tree::Map(rebuilt))
            }
        }
    }

    let expected = spec.leaf_count();
    let got = leaves.len();
    if expected != got {
        return Err(CompileError::StructureMismatch { expected, got });
    }
    let mut iter = leaves.into_iter();
    // Length was checked above; a miss here would be a descriptor bug.
    walk(spec, &mut iter).ok_or(CompileError::StructureMismatch { expected, got })
}

/// Ordered name-to-cell mapping (parameters and buffers).
pub type NamedCells = Vec<(String, TensorCell)>;

/// Ordered name-to-state-record mapping. Each record is itself an ordered
/// state-name-to-cell mapping.
pub type NamedStates = Vec<(String, Vec<(String, TensorCell)>)>;

/// Tree view of a flat named mapping.
pub fn named_tree(named: &NamedCells) -> Tree<TensorCell> {
    Tree::Map(
        named
            .iter()
            .map(|(name, cell)| (name.clone(), Tree::Leaf(cell.clone())))
            .collect(),
    )
}

/// Tree view of a named-state mapping (two levels of nesting).
pub fn states_tree(states: &NamedStates) -> Tree<TensorCell> {
    Tree::Map(
        states
            .iter()
            .map(|(name, record)| {
                (
                    name.clone(),
                    Tree::Map(
                        record
                            .iter()
                            .map(|(key, cell)| (key.clone(), Tree::Leaf(cell.clone())))
                            .collect(),
                    ),
                )
            })
            .collect(),
    )
}

/// Inverse of [`named_tree`].
pub fn tree_to_named(tree: Tree<TensorCell>) -> CompileResult<NamedCells> {
    let Tree::Map(entries) = tree else {
        return Err(CompileError::StructureMismatch {
            expected: 0,
            got: 1,
        });
    };
    entries
        .into_iter()
        .map(|(name, child)| match child {
            Tree::Leaf(cell) => Ok((name, cell)),
            Tree::Map(entries) => Err(CompileError::StructureMismatch {
                expected: 1,
                got: entries.len(),
            }),
        })
        .collect()
}

/// Inverse of [`states_tree`].
pub fn tree_to_states(tree: Tree<TensorCell>) -> CompileResult<NamedStates> {
    let Tree::Map(entries) = tree else {
        return Err(CompileError::StructureMismatch {
            expected: 0,
            got: 1,
        });
    };
    entries
        .into_iter()
        .map(|(name, child)| Ok((name, tree_to_named(child)?)))
        .collect()
}

#[cfg(test)]
mod tests {
    use crate::tensor::HostTensor;

    use super::*;

    fn leaf(value: f32) -> Tree<TensorCell> {
        Tree::Leaf(TensorCell::real(HostTensor::scalar(value)))
    }

    fn values(tree: &Tree<TensorCell>) -> Vec<f32> {
        flatten(tree)
            .0
            .iter()
            .map(|cell| cell.to_host().unwrap().data()[0])
            .collect()
    }

    #[test]
    fn flatten_unflatten_round_trips() {
        let tree = Tree::Map(vec![
            ("layer".into(), Tree::Map(vec![
                ("weight".into(), leaf(1.0)),
                ("bias".into(), leaf(2.0)),
            ])),
            ("head".into(), leaf(3.0)),
        ]);
        let (leaves, spec) = flatten(&tree);
        assert_eq!(leaves.len(), 3);
        assert_eq!(spec.leaf_count(), 3);

        let rebuilt = unflatten(leaves.clone(), &spec).unwrap();
        assert_eq!(values(&rebuilt), vec![1.0, 2.0, 3.0]);
        // Identity of the leaves survives the round trip.
        for (orig, back) in leaves.iter().zip(flatten(&rebuilt).0.iter()) {
            assert!(orig.same_cell(back));
        }
    }

    #[test]
    fn flatten_order_is_insertion_order() {
        let tree = Tree::Map(vec![
            ("z".into(), leaf(1.0)),
            ("a".into(), leaf(2.0)),
        ]);
        assert_eq!(values(&tree), vec![1.0, 2.0]);
    }

    #[test]
    fn unflatten_rejects_short_sequences() {
        let (mut leaves, spec) = flatten(&Tree::Map(vec![
            ("a".into(), leaf(1.0)),
            ("b".into(), leaf(2.0)),
        ]));
        leaves.pop();
        let err = unflatten(leaves, &spec).unwrap_err();
        assert!(matches!(
            err,
            CompileError::StructureMismatch { expected: 2, got: 1 }
        ));
    }

    #[test]
    fn unflatten_rejects_leftover_leaves() {
        let (mut leaves, spec) = flatten(&leaf(1.0));
        leaves.push(TensorCell::real(HostTensor::scalar(9.0)));
        let err = unflatten(leaves, &spec).unwrap_err();
        assert!(matches!(
            err,
            CompileError::StructureMismatch { expected: 1, got: 2 }
        ));
    }

    #[test]
    fn named_states_round_trip() {
        let states: NamedStates = vec![(
            "w".into(),
            vec![("momentum".into(), TensorCell::real(HostTensor::scalar(0.0)))],
        )];
        let (leaves, spec) = flatten(&states_tree(&states));
        let rebuilt = tree_to_states(unflatten(leaves, &spec).unwrap()).unwrap();
        assert_eq!(rebuilt.len(), 1);
        assert_eq!(rebuilt[0].0, "w");
        assert_eq!(rebuilt[0].1[0].0, "momentum");
        assert!(rebuilt[0].1[0].1.same_cell(&states[0].1[0].1));
    }
}
