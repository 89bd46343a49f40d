//! Module-tree traversal
//!
//! Every type that can sit in a module tree implements [`TensorTree`]: it visits
//! or rebuilds its tensor leaves, passing each leaf's state-dict key (key maps
//! applied, sequences indexed, mappings keyed). Structural fields are never
//! visited. The free functions below build the tree arithmetic used by gradient
//! accumulation and by stacked layers on top of that traversal.

use std::collections::BTreeMap;

use candle_core::Tensor;

use crate::error::{Error, Result};
use crate::named::{Axis, NamedArray};
use crate::nn::Linear;
use crate::state_dict::join_key;

/// A tensor leaf of a module tree
#[derive(Debug, Clone)]
pub enum Leaf {
    Named(NamedArray),
    Plain(Tensor),
}

impl Leaf {
    pub fn array(&self) -> &Tensor {
        match self {
            Leaf::Named(a) => a.array(),
            Leaf::Plain(t) => t,
        }
    }

    pub fn into_array(self) -> Tensor {
        match self {
            Leaf::Named(a) => a.into_array(),
            Leaf::Plain(t) => t,
        }
    }

    pub fn axes(&self) -> Option<&[Axis]> {
        match self {
            Leaf::Named(a) => Some(a.axes()),
            Leaf::Plain(_) => None,
        }
    }

    pub fn with_array(&self, array: Tensor) -> Result<Self> {
        match self {
            Leaf::Named(a) => Ok(Leaf::Named(a.with_array(array)?)),
            Leaf::Plain(_) => Ok(Leaf::Plain(array)),
        }
    }

    pub fn map(&self, f: impl FnOnce(&Tensor) -> candle_core::Result<Tensor>) -> Result<Self> {
        self.with_array(f(self.array())?)
    }
}

pub type LeafVisitor<'a> = dyn FnMut(Option<&str>, Leaf) -> Result<()> + 'a;
pub type LeafMapper<'a> = dyn FnMut(Option<&str>, Leaf) -> Result<Leaf> + 'a;
pub type LinearVisitor<'a> = dyn FnMut(Option<&str>, &Linear) -> Result<()> + 'a;

/// Traversal over the tensor leaves of a module tree.
///
/// Leaves are visited in a fixed order (declaration order for modules, index
/// order for sequences, key order for mappings), which [`zip_map`] relies on.
pub trait TensorTree: Sized {
    fn visit_leaves(&self, path: Option<&str>, f: &mut LeafVisitor<'_>) -> Result<()>;

    fn map_leaves(&self, path: Option<&str>, f: &mut LeafMapper<'_>) -> Result<Self>;

    /// Calls `f` for every [`Linear`] in the tree with its state-dict key.
    fn visit_linear(&self, _path: Option<&str>, _f: &mut LinearVisitor<'_>) -> Result<()> {
        Ok(())
    }
}

impl TensorTree for NamedArray {
    fn visit_leaves(&self, path: Option<&str>, f: &mut LeafVisitor<'_>) -> Result<()> {
        f(path, Leaf::Named(self.clone()))
    }

    fn map_leaves(&self, path: Option<&str>, f: &mut LeafMapper<'_>) -> Result<Self> {
        match f(path, Leaf::Named(self.clone()))? {
            Leaf::Named(array) => Ok(array),
            Leaf::Plain(array) => self.with_array(array),
        }
    }
}

impl TensorTree for Tensor {
    fn visit_leaves(&self, path: Option<&str>, f: &mut LeafVisitor<'_>) -> Result<()> {
        f(path, Leaf::Plain(self.clone()))
    }

    fn map_leaves(&self, path: Option<&str>, f: &mut LeafMapper<'_>) -> Result<Self> {
        Ok(f(path, Leaf::Plain(self.clone()))?.into_array())
    }
}

impl<T: TensorTree> TensorTree for Option<T> {
    fn visit_leaves(&self, path: Option<&str>, f: &mut LeafVisitor<'_>) -> Result<()> {
        match self {
            Some(value) => value.visit_leaves(path, f),
            None => Ok(()),
        }
    }

    fn map_leaves(&self, path: Option<&str>, f: &mut LeafMapper<'_>) -> Result<Self> {
        match self {
            Some(value) => Ok(Some(value.map_leaves(path, f)?)),
            None => Ok(None),
        }
    }

    fn visit_linear(&self, path: Option<&str>, f: &mut LinearVisitor<'_>) -> Result<()> {
        match self {
            Some(value) => value.visit_linear(path, f),
            None => Ok(()),
        }
    }
}

impl<T: TensorTree> TensorTree for Vec<T> {
    fn visit_leaves(&self, path: Option<&str>, f: &mut LeafVisitor<'_>) -> Result<()> {
        for (i, item) in self.iter().enumerate() {
            item.visit_leaves(Some(join_key(path, &i.to_string()).as_str()), f)?;
        }
        Ok(())
    }

    fn map_leaves(&self, path: Option<&str>, f: &mut LeafMapper<'_>) -> Result<Self> {
        let mut out = Vec::with_capacity(self.len());
        for (i, item) in self.iter().enumerate() {
            out.push(item.map_leaves(Some(join_key(path, &i.to_string()).as_str()), f)?);
        }
        Ok(out)
    }

    fn visit_linear(&self, path: Option<&str>, f: &mut LinearVisitor<'_>) -> Result<()> {
        for (i, item) in self.iter().enumerate() {
            item.visit_linear(Some(join_key(path, &i.to_string()).as_str()), f)?;
        }
        Ok(())
    }
}

impl<T: TensorTree> TensorTree for BTreeMap<String, T> {
    fn visit_leaves(&self, path: Option<&str>, f: &mut LeafVisitor<'_>) -> Result<()> {
        for (key, item) in self {
            item.visit_leaves(Some(join_key(path, key).as_str()), f)?;
        }
        Ok(())
    }

    fn map_leaves(&self, path: Option<&str>, f: &mut LeafMapper<'_>) -> Result<Self> {
        let mut out = BTreeMap::new();
        for (key, item) in self {
            out.insert(key.clone(), item.map_leaves(Some(join_key(path, key).as_str()), f)?);
        }
        Ok(out)
    }

    fn visit_linear(&self, path: Option<&str>, f: &mut LinearVisitor<'_>) -> Result<()> {
        for (key, item) in self {
            item.visit_linear(Some(join_key(path, key).as_str()), f)?;
        }
        Ok(())
    }
}

/// All leaves of `tree` in traversal order
pub fn leaves<T: TensorTree>(tree: &T) -> Result<Vec<Leaf>> {
    let mut out = Vec::new();
    tree.visit_leaves(None, &mut |_: Option<&str>, leaf: Leaf| {
        out.push(leaf);
        Ok(())
    })?;
    Ok(out)
}

/// All leaves of `tree` with their state-dict keys
pub fn keyed_leaves<T: TensorTree>(tree: &T) -> Result<Vec<(String, Leaf)>> {
    let mut out = Vec::new();
    tree.visit_leaves(None, &mut |path: Option<&str>, leaf: Leaf| {
        out.push((path.unwrap_or_default().to_string(), leaf));
        Ok(())
    })?;
    Ok(out)
}

pub fn map<T: TensorTree>(tree: &T, mut f: impl FnMut(Leaf) -> Result<Leaf>) -> Result<T> {
    tree.map_leaves(None, &mut |_: Option<&str>, leaf: Leaf| f(leaf))
}

/// Combines two trees of the same structure leaf by leaf.
pub fn zip_map<T: TensorTree>(
    lhs: &T,
    rhs: &T,
    mut f: impl FnMut(Leaf, Leaf) -> Result<Leaf>,
) -> Result<T> {
    let mut others = leaves(rhs)?.into_iter();
    let out = lhs.map_leaves(None, &mut |path: Option<&str>, leaf: Leaf| {
        let other = others.next().ok_or_else(|| {
            Error::Structure(format!(
                "second tree has no leaf for '{}'",
                path.unwrap_or_default()
            ))
        })?;
        f(leaf, other)
    })?;
    if others.next().is_some() {
        return Err(Error::Structure("second tree has more leaves than the first".into()));
    }
    Ok(out)
}

pub fn add_trees<T: TensorTree>(lhs: &T, rhs: &T) -> Result<T> {
    zip_map(lhs, rhs, |a, b| a.with_array(a.array().add(b.array())?))
}

pub fn scale_tree<T: TensorTree>(tree: &T, factor: f64) -> Result<T> {
    map(tree, |leaf| leaf.map(|t| t.affine(factor, 0.0)))
}

/// Selects `index` along `axis` in every named leaf that has it.
pub fn index_axis<T: TensorTree>(tree: &T, axis: &str, index: usize) -> Result<T> {
    map(tree, |leaf| match leaf {
        Leaf::Named(a) if a.has_axis(axis) => Ok(Leaf::Named(a.index_axis(axis, index)?)),
        other => Ok(other),
    })
}

/// Restricts `axis` to `start..start + len` in every named leaf that has it.
pub fn narrow_axis<T: TensorTree>(tree: &T, axis: &str, start: usize, len: usize) -> Result<T> {
    map(tree, |leaf| match leaf {
        Leaf::Named(a) if a.has_axis(axis) => Ok(Leaf::Named(a.narrow_axis(axis, start, len)?)),
        other => Ok(other),
    })
}

/// Size of `axis`, taken from the first named leaf that has it
pub fn axis_size<T: TensorTree>(tree: &T, axis: &str) -> Result<usize> {
    let mut size = None;
    tree.visit_leaves(None, &mut |_: Option<&str>, leaf: Leaf| {
        if size.is_none()
            && let Leaf::Named(a) = &leaf
            && let Some(i) = a.axis_index(axis)
        {
            size = Some(a.axes()[i].size);
        }
        Ok(())
    })?;
    size.ok_or_else(|| Error::Axis(format!("no leaf has axis '{axis}'")))
}

/// Stacks trees of identical structure along a new leading `axis`.
///
/// Named leaves gain `axis` in front; plain leaves gain an unnamed leading
/// dimension.
pub fn stack_trees<T: TensorTree>(trees: &[T], axis: Axis) -> Result<T> {
    if trees.is_empty() || trees.len() != axis.size {
        return Err(Error::Axis(format!(
            "cannot stack {} trees along {axis}",
            trees.len()
        )));
    }
    let per_tree = trees.iter().map(leaves).collect::<Result<Vec<_>>>()?;
    let mut index = 0;
    trees[0].map_leaves(None, &mut |path: Option<&str>, leaf: Leaf| {
        let parts = per_tree
            .iter()
            .map(|tree| {
                tree.get(index).map(|l| l.array().clone()).ok_or_else(|| {
                    Error::Structure(format!(
                        "tree is missing leaf '{}'",
                        path.unwrap_or_default()
                    ))
                })
            })
            .collect::<Result<Vec<_>>>()?;
        index += 1;
        let stacked = Tensor::stack(&parts, 0)?;
        match leaf {
            Leaf::Named(a) => {
                let mut axes = vec![axis.clone()];
                axes.extend(a.axes().iter().cloned());
                Ok(Leaf::Named(NamedArray::new(stacked, axes)?))
            }
            Leaf::Plain(_) => Ok(Leaf::Plain(stacked)),
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use candle_core::{DType, Device};

    fn vector(values: &[f32], name: &str) -> NamedArray {
        let t = Tensor::new(values, &Device::Cpu).unwrap();
        NamedArray::new(t, vec![Axis::new(name, values.len())]).unwrap()
    }

    #[test]
    fn test_paths_for_sequences_and_mappings() {
        let mut map = BTreeMap::new();
        map.insert("b".to_string(), vec![vector(&[1.0], "x")]);
        map.insert("a".to_string(), vec![vector(&[2.0], "x"), vector(&[3.0], "x")]);
        let keys: Vec<String> = keyed_leaves(&map).unwrap().into_iter().map(|(k, _)| k).collect();
        assert_eq!(keys, vec!["a.0", "a.1", "b.0"]);
    }

    #[test]
    fn test_add_and_scale() {
        let tree = vec![vector(&[1.0, 2.0], "x"), vector(&[3.0], "y")];
        let doubled = add_trees(&tree, &tree).unwrap();
        let halved = scale_tree(&doubled, 0.5).unwrap();
        assert_eq!(halved[0].array().to_vec1::<f32>().unwrap(), vec![1.0, 2.0]);
        assert_eq!(halved[1].axis_names(), vec!["y"]);

        let short = vec![vector(&[1.0, 2.0], "x")];
        assert!(add_trees(&tree, &short).is_err());
    }

    #[test]
    fn test_stack_and_index() {
        let blocks = vec![
            vec![vector(&[1.0, 2.0], "d")],
            vec![vector(&[3.0, 4.0], "d")],
            vec![vector(&[5.0, 6.0], "d")],
        ];
        let stacked = stack_trees(&blocks, Axis::new("layers", 3)).unwrap();
        assert_eq!(stacked[0].axis_names(), vec!["layers", "d"]);
        assert_eq!(axis_size(&stacked, "layers").unwrap(), 3);
        let second = index_axis(&stacked, "layers", 1).unwrap();
        assert_eq!(second[0].array().to_vec1::<f32>().unwrap(), vec![3.0, 4.0]);
        assert!(stack_trees(&blocks, Axis::new("layers", 2)).is_err());
        assert!(axis_size(&stacked, "heads").is_err());

        let plain = vec![Tensor::zeros(2, DType::F32, &Device::Cpu).unwrap()];
        assert_eq!(stack_trees(&[plain.clone(), plain], Axis::new("n", 2)).unwrap()[0].dims(), &[2, 2]);
    }
}
