//! Trees of values: nested list/dict containers with flatten/unflatten,
//! and tree-aware wrappers over the flat transformations.

use crate::error::{Error, Result};
use crate::trace::{jvp, linearize, LinearFn, Value};
use std::cell::RefCell;
use std::collections::BTreeMap;
use std::rc::Rc;

/// A nested container of values.
#[derive(Clone, Debug)]
pub enum Tree {
    /// A single value.
    Leaf(Value),
    /// An ordered sequence of subtrees.
    List(Vec<Tree>),
    /// A name-keyed mapping of subtrees (ordered by key).
    Dict(BTreeMap<String, Tree>),
}

/// The shape of a [`Tree`] with the leaves removed.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum TreeDef {
    /// One leaf slot.
    Leaf,
    /// A list node.
    List(Vec<TreeDef>),
    /// A dict node with sorted keys.
    Dict(Vec<(String, TreeDef)>),
}

impl Tree {
    /// A leaf holding one value.
    pub fn leaf(value: Value) -> Tree {
        Tree::Leaf(value)
    }

    /// A dict tree from key/value pairs of leaves.
    pub fn dict<I: IntoIterator<Item = (&'static str, Value)>>(pairs: I) -> Tree {
        Tree::Dict(
            pairs
                .into_iter()
                .map(|(k, v)| (k.to_string(), Tree::Leaf(v)))
                .collect(),
        )
    }

    /// Look up a dict entry.
    pub fn get(&self, key: &str) -> Option<&Tree> {
        match self {
            Tree::Dict(map) => map.get(key),
            _ => None,
        }
    }

    /// The value of a leaf node.
    pub fn as_leaf(&self) -> Option<&Value> {
        match self {
            Tree::Leaf(v) => Some(v),
            _ => None,
        }
    }

    /// A dict entry that must be a leaf; panics otherwise (test sugar).
    pub fn leaf_at(&self, key: &str) -> &Value {
        self.get(key)
            .and_then(Tree::as_leaf)
            .unwrap_or_else(|| panic!("no leaf at key {:?}", key))
    }

    /// Flatten into leaves (depth-first, dict keys sorted) and structure.
    pub fn flatten(&self) -> (Vec<Value>, TreeDef) {
        let mut leaves = Vec::new();
        let def = self.flatten_into(&mut leaves);
        (leaves, def)
    }

    fn flatten_into(&self, leaves: &mut Vec<Value>) -> TreeDef {
        match self {
            Tree::Leaf(v) => {
                leaves.push(v.clone());
                TreeDef::Leaf
            }
            Tree::List(items) => {
                TreeDef::List(items.iter().map(|t| t.flatten_into(leaves)).collect())
            }
            Tree::Dict(map) => TreeDef::Dict(
                map.iter()
                    .map(|(k, t)| (k.clone(), t.flatten_into(leaves)))
                    .collect(),
            ),
        }
    }

    /// Rebuild a tree of `def` from leaves. The leaf count must match.
    pub fn unflatten(def: &TreeDef, leaves: &[Value]) -> Result<Tree> {
        let mut iter = leaves.iter();
        let tree = build(def, &mut iter)?;
        if iter.next().is_some() {
            return Err(Error::TreeMismatch(format!(
                "{} leaves do not fit the tree structure",
                leaves.len()
            )));
        }
        Ok(tree)
    }
}

fn build<'a>(def: &TreeDef, leaves: &mut std::slice::Iter<'a, Value>) -> Result<Tree> {
    match def {
        TreeDef::Leaf => leaves
            .next()
            .map(|v| Tree::Leaf(v.clone()))
            .ok_or_else(|| Error::TreeMismatch("not enough leaves for the tree".to_string())),
        TreeDef::List(items) => Ok(Tree::List(
            items
                .iter()
                .map(|d| build(d, leaves))
                .collect::<Result<_>>()?,
        )),
        TreeDef::Dict(items) => Ok(Tree::Dict(
            items
                .iter()
                .map(|(k, d)| Ok((k.clone(), build(d, leaves)?)))
                .collect::<Result<_>>()?,
        )),
    }
}

/// Forward-mode over trees: the primal and tangent trees must share one
/// structure, and the outputs are rebuilt into the function's structure.
pub fn jvp_tree<F>(f: F, primals: &Tree, tangents: &Tree) -> Result<(Tree, Tree)>
where
    F: FnOnce(&Tree) -> Tree,
{
    let (primal_leaves, in_def) = primals.flatten();
    let (tangent_leaves, tangent_def) = tangents.flatten();
    if in_def != tangent_def {
        return Err(Error::TreeMismatch(
            "primal and tangent trees have different structures".to_string(),
        ));
    }
    let out_def: Rc<RefCell<Option<TreeDef>>> = Rc::new(RefCell::new(None));
    let out_def_slot = out_def.clone();
    let (outs_p, outs_t) = jvp(
        move |leaves: &[Value]| {
            let tree = Tree::unflatten(&in_def, leaves)
                .unwrap_or_else(|e| panic!("{}", e));
            let (out_leaves, def) = f(&tree).flatten();
            *out_def_slot.borrow_mut() = Some(def);
            out_leaves
        },
        &primal_leaves,
        &tangent_leaves,
    )?;
    let def = out_def
        .borrow_mut()
        .take()
        .expect("traced function did not run");
    Ok((Tree::unflatten(&def, &outs_p)?, Tree::unflatten(&def, &outs_t)?))
}

/// The linear map returned by [`linearize_tree`].
pub struct LinearTreeFn {
    lin: LinearFn,
    in_def: TreeDef,
    out_def: TreeDef,
}

impl LinearTreeFn {
    /// Apply the linear map to a tangent tree of the input structure.
    pub fn call(&self, tangents: &Tree) -> Result<Tree> {
        let (leaves, def) = tangents.flatten();
        if def != self.in_def {
            return Err(Error::TreeMismatch(
                "tangent tree does not match the primal structure".to_string(),
            ));
        }
        let outs = self.lin.call(&leaves)?;
        Tree::unflatten(&self.out_def, &outs)
    }
}

/// [`linearize`] over trees.
pub fn linearize_tree<F>(f: F, primals: &Tree) -> Result<(Tree, LinearTreeFn)>
where
    F: FnOnce(&Tree) -> Tree,
{
    let (primal_leaves, in_def) = primals.flatten();
    let out_def: Rc<RefCell<Option<TreeDef>>> = Rc::new(RefCell::new(None));
    let out_def_slot = out_def.clone();
    let in_def_inner = in_def.clone();
    let (outs, lin) = linearize(
        move |leaves: &[Value]| {
            let tree = Tree::unflatten(&in_def_inner, leaves)
                .unwrap_or_else(|e| panic!("{}", e));
            let (out_leaves, def) = f(&tree).flatten();
            *out_def_slot.borrow_mut() = Some(def);
            out_leaves
        },
        &primal_leaves,
    )?;
    let out_def = out_def
        .borrow_mut()
        .take()
        .expect("traced function did not run");
    let primals_out = Tree::unflatten(&out_def, &outs)?;
    Ok((primals_out, LinearTreeFn { lin, in_def, out_def }))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn leaf(v: f32) -> Tree {
        Tree::Leaf(Value::scalar(v))
    }

    fn get(v: &Value) -> f32 {
        v.expect_concrete().unwrap().item_f32()
    }

    #[test]
    fn test_flatten_unflatten_roundtrip() {
        let tree = Tree::List(vec![
            leaf(1.0),
            Tree::Dict([("a".to_string(), leaf(2.0)), ("b".to_string(), leaf(3.0))].into()),
        ]);
        let (leaves, def) = tree.flatten();
        assert_eq!(leaves.len(), 3);
        let rebuilt = Tree::unflatten(&def, &leaves).unwrap();
        let (leaves2, def2) = rebuilt.flatten();
        assert_eq!(def, def2);
        assert_eq!(get(&leaves[0]), get(&leaves2[0]));
    }

    #[test]
    fn test_dict_keys_sorted() {
        let tree = Tree::dict([("b", Value::scalar(2.0)), ("a", Value::scalar(1.0))]);
        let (leaves, _) = tree.flatten();
        // "a" flattens first regardless of insertion order.
        assert_eq!(get(&leaves[0]), 1.0);
        assert_eq!(get(&leaves[1]), 2.0);
    }

    #[test]
    fn test_unflatten_count_mismatch() {
        let (leaves, def) = leaf(1.0).flatten();
        assert!(Tree::unflatten(&def, &[]).is_err());
        let mut extra = leaves.clone();
        extra.push(Value::scalar(2.0));
        assert!(Tree::unflatten(&def, &extra).is_err());
    }

    #[test]
    fn test_jvp_tree_structure_mismatch() {
        let p = Tree::dict([("a", Value::scalar(1.0))]);
        let t = Tree::dict([("b", Value::scalar(1.0))]);
        assert!(jvp_tree(|tree| tree.clone(), &p, &t).is_err());
    }

    #[test]
    fn test_linearize_tree_pair() {
        // {a, b} -> {r1: a*a + b, r2: b}
        let f = |tree: &Tree| {
            let a = tree.leaf_at("a");
            let b = tree.leaf_at("b");
            Tree::dict([("r1", a.mul(a).add(b)), ("r2", b.clone())])
        };
        let primals = Tree::dict([("a", Value::scalar(1.0)), ("b", Value::scalar(2.0))]);
        let (y, lin) = linearize_tree(f, &primals).unwrap();
        assert_eq!(get(y.leaf_at("r1")), 3.0);
        assert_eq!(get(y.leaf_at("r2")), 2.0);

        let tangents = Tree::dict([("a", Value::scalar(1.0)), ("b", Value::scalar(0.0))]);
        let dy = lin.call(&tangents).unwrap();
        assert_eq!(get(dy.leaf_at("r1")), 2.0);
        assert_eq!(get(dy.leaf_at("r2")), 0.0);
    }
}
