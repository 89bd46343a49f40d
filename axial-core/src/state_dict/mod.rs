//! State-dict interchange
//!
//! A [`StateDict`] is a flat, ordered map from dot-joined keys to tensors (or
//! `None`). [`StateDictSerialize`] converts module trees to and from that form:
//!
//! - sequences append the element index to the key, mappings append the entry key
//! - module fields append their serialized key, taken from the module's key map
//!   (a field may also be inlined into its parent's key)
//! - tensor leaves need a key; a bare leaf without one is an error
//! - `None` leaves are skipped on write
//!
//! Deserialization walks a template tree of the same structure and replaces only
//! its tensor leaves, so structural fields always come from the template.
//!
//! Most modules derive everything through [`module!`](crate::module). Modules whose
//! foreign layout differs (flattened linears, stacked blocks) implement
//! [`StateDictSerialize`] by hand and fall back to the generated
//! [`Module::default_update_state_dict`] / [`Module::default_from_state_dict`].

pub mod linear;
pub mod stack;

use std::collections::{BTreeMap, btree_map};

use candle_core::Tensor;

use crate::error::{Error, Result};
use crate::named::NamedArray;

/// Flat key -> tensor dictionary
#[derive(Debug, Clone, Default)]
pub struct StateDict {
    entries: BTreeMap<String, Option<Tensor>>,
    shape_checks: bool,
}

impl StateDict {
    pub fn new() -> Self {
        Self::default()
    }

    /// Enables shape validation of named leaves in [`StateDictSerialize::from_state_dict`].
    pub fn with_shape_checks(mut self, enabled: bool) -> Self {
        self.shape_checks = enabled;
        self
    }

    pub fn shape_checks(&self) -> bool {
        self.shape_checks
    }

    /// Empty dict with the same settings
    pub(crate) fn empty_like(&self) -> Self {
        Self::new().with_shape_checks(self.shape_checks)
    }

    pub fn insert(&mut self, key: impl Into<String>, tensor: Tensor) {
        self.entries.insert(key.into(), Some(tensor));
    }

    pub fn insert_optional(&mut self, key: impl Into<String>, tensor: Option<Tensor>) {
        self.entries.insert(key.into(), tensor);
    }

    pub fn get(&self, key: &str) -> Option<&Tensor> {
        self.entries.get(key).and_then(Option::as_ref)
    }

    pub fn require(&self, key: &str) -> Result<&Tensor> {
        self.get(key).ok_or_else(|| Error::MissingKey(key.to_string()))
    }

    pub fn contains_key(&self, key: &str) -> bool {
        self.entries.contains_key(key)
    }

    pub fn remove(&mut self, key: &str) -> Option<Tensor> {
        self.entries.remove(key).flatten()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn keys(&self) -> impl Iterator<Item = &str> {
        self.entries.keys().map(String::as_str)
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, Option<&Tensor>)> {
        self.entries.iter().map(|(k, v)| (k.as_str(), v.as_ref()))
    }

    pub fn extend(&mut self, other: StateDict) {
        self.entries.extend(other.entries);
    }

    /// Drops `None` entries
    pub fn without_none(self) -> Self {
        Self {
            entries: self.entries.into_iter().filter(|(_, v)| v.is_some()).collect(),
            shape_checks: self.shape_checks,
        }
    }
}

impl IntoIterator for StateDict {
    type Item = (String, Option<Tensor>);
    type IntoIter = btree_map::IntoIter<String, Option<Tensor>>;

    fn into_iter(self) -> Self::IntoIter {
        self.entries.into_iter()
    }
}

impl<K: Into<String>> FromIterator<(K, Tensor)> for StateDict {
    fn from_iter<I: IntoIterator<Item = (K, Tensor)>>(iter: I) -> Self {
        Self {
            entries: iter.into_iter().map(|(k, v)| (k.into(), Some(v))).collect(),
            shape_checks: false,
        }
    }
}

/// Joins `prefix` and `leaf` with a dot; either side may be absent.
pub fn apply_prefix(prefix: Option<&str>, leaf: Option<&str>) -> Option<String> {
    match (prefix, leaf) {
        (None, leaf) => leaf.map(str::to_string),
        (Some(prefix), None) => Some(prefix.to_string()),
        (Some(prefix), Some(leaf)) => Some(format!("{prefix}.{leaf}")),
    }
}

pub fn join_key(prefix: Option<&str>, leaf: &str) -> String {
    match prefix {
        Some(prefix) => format!("{prefix}.{leaf}"),
        None => leaf.to_string(),
    }
}

/// Conversion between a module tree and a [`StateDict`]
pub trait StateDictSerialize: Sized {
    /// Writes every non-`None` leaf under `prefix`. Keys already present in
    /// `state_dict` are overwritten, never cleared.
    fn update_state_dict(&self, state_dict: &mut StateDict, prefix: Option<&str>) -> Result<()>;

    /// Builds a tree shaped like `self` whose leaves are read from `state_dict`.
    fn from_state_dict(&self, state_dict: &StateDict, prefix: Option<&str>) -> Result<Self>;

    fn to_state_dict(&self, prefix: Option<&str>) -> Result<StateDict> {
        let mut state_dict = StateDict::new();
        self.update_state_dict(&mut state_dict, prefix)?;
        Ok(state_dict)
    }

    /// Reconstructs a leaf from a raw tensor when the template slot is `None`.
    fn from_untemplated(key: &str, _tensor: &Tensor) -> Result<Self> {
        Err(Error::Structure(format!(
            "cannot rebuild '{key}' without a template value"
        )))
    }
}

/// One field of a module as seen by the codec
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FieldDescriptor {
    pub name: &'static str,
    /// Serialized key; `None` inlines the field into its parent's key.
    pub key: Option<&'static str>,
    /// Structural metadata, never serialized
    pub is_static: bool,
}

/// Field reflection generated by [`module!`](crate::module)
pub trait Module: Clone {
    fn fields() -> &'static [FieldDescriptor];

    /// Field-by-field serialization, honouring the key map
    fn default_update_state_dict(&self, state_dict: &mut StateDict, prefix: Option<&str>) -> Result<()>;

    /// Copy-with: clones `self` and replaces every serialized field
    fn default_from_state_dict(&self, state_dict: &StateDict, prefix: Option<&str>) -> Result<Self>;

    /// Fields whose serialized key differs from their name
    fn key_map() -> Vec<(&'static str, Option<&'static str>)> {
        Self::fields()
            .iter()
            .filter(|f| !f.is_static && f.key != Some(f.name))
            .map(|f| (f.name, f.key))
            .collect()
    }
}

/// Implements [`Module`], [`StateDictSerialize`] and
/// [`TensorTree`](crate::tree::TensorTree) for a struct.
///
/// ```ignore
/// module!(Block {
///     attn,                  // serialized as "attn"
///     ln_1 => "norm1",       // serialized as "norm1"
///     inner => _,            // inlined into the parent's key
/// } static { heads, eps });  // never serialized
/// ```
///
/// `@custom_state_dict` skips the [`StateDictSerialize`] impl so the type can
/// provide its own; `@custom_tree` skips the `TensorTree` impl.
#[macro_export]
macro_rules! module {
    (@custom_state_dict $ty:ty { $($field:ident $(=> $key:tt)?),* $(,)? } $(static { $($sfield:ident),* $(,)? })?) => {
        $crate::module!(@module $ty { $($field $(=> $key)?),* } [$($($sfield),*)?]);
        $crate::module!(@tree $ty { $($field $(=> $key)?),* });
    };
    (@custom_tree $ty:ty { $($field:ident $(=> $key:tt)?),* $(,)? } $(static { $($sfield:ident),* $(,)? })?) => {
        $crate::module!(@module $ty { $($field $(=> $key)?),* } [$($($sfield),*)?]);
        $crate::module!(@codec $ty);
    };
    (@key $field:ident _) => {
        ::core::option::Option::None
    };
    (@key $field:ident $key:literal) => {
        ::core::option::Option::Some($key)
    };
    (@key $field:ident) => {
        ::core::option::Option::Some(stringify!($field))
    };
    (@module $ty:ty { $($field:ident $(=> $key:tt)?),* } [$($sfield:ident),*]) => {
        impl $crate::state_dict::Module for $ty {
            fn fields() -> &'static [$crate::state_dict::FieldDescriptor] {
                const FIELDS: &[$crate::state_dict::FieldDescriptor] = &[
                    $($crate::state_dict::FieldDescriptor {
                        name: stringify!($field),
                        key: $crate::module!(@key $field $($key)?),
                        is_static: false,
                    },)*
                    $($crate::state_dict::FieldDescriptor {
                        name: stringify!($sfield),
                        key: ::core::option::Option::None,
                        is_static: true,
                    },)*
                ];
                FIELDS
            }

            #[allow(unused_variables)]
            fn default_update_state_dict(
                &self,
                state_dict: &mut $crate::state_dict::StateDict,
                prefix: ::core::option::Option<&str>,
            ) -> $crate::error::Result<()> {
                $(
                    let key = $crate::state_dict::apply_prefix(prefix, $crate::module!(@key $field $($key)?));
                    $crate::state_dict::StateDictSerialize::update_state_dict(&self.$field, state_dict, key.as_deref())?;
                )*
                Ok(())
            }

            #[allow(unused_variables, unused_mut)]
            fn default_from_state_dict(
                &self,
                state_dict: &$crate::state_dict::StateDict,
                prefix: ::core::option::Option<&str>,
            ) -> $crate::error::Result<Self> {
                let mut module = ::core::clone::Clone::clone(self);
                $(
                    let key = $crate::state_dict::apply_prefix(prefix, $crate::module!(@key $field $($key)?));
                    module.$field = $crate::state_dict::StateDictSerialize::from_state_dict(&self.$field, state_dict, key.as_deref())?;
                )*
                Ok(module)
            }
        }
    };
    (@codec $ty:ty) => {
        impl $crate::state_dict::StateDictSerialize for $ty {
            fn update_state_dict(
                &self,
                state_dict: &mut $crate::state_dict::StateDict,
                prefix: ::core::option::Option<&str>,
            ) -> $crate::error::Result<()> {
                $crate::state_dict::Module::default_update_state_dict(self, state_dict, prefix)
            }

            fn from_state_dict(
                &self,
                state_dict: &$crate::state_dict::StateDict,
                prefix: ::core::option::Option<&str>,
            ) -> $crate::error::Result<Self> {
                $crate::state_dict::Module::default_from_state_dict(self, state_dict, prefix)
            }
        }
    };
    (@tree $ty:ty { $($field:ident $(=> $key:tt)?),* }) => {
        impl $crate::tree::TensorTree for $ty {
            #[allow(unused_variables)]
            fn visit_leaves(
                &self,
                path: ::core::option::Option<&str>,
                f: &mut $crate::tree::LeafVisitor<'_>,
            ) -> $crate::error::Result<()> {
                $(
                    let key = $crate::state_dict::apply_prefix(path, $crate::module!(@key $field $($key)?));
                    $crate::tree::TensorTree::visit_leaves(&self.$field, key.as_deref(), f)?;
                )*
                Ok(())
            }

            #[allow(unused_variables, unused_mut)]
            fn map_leaves(
                &self,
                path: ::core::option::Option<&str>,
                f: &mut $crate::tree::LeafMapper<'_>,
            ) -> $crate::error::Result<Self> {
                let mut module = ::core::clone::Clone::clone(self);
                $(
                    let key = $crate::state_dict::apply_prefix(path, $crate::module!(@key $field $($key)?));
                    module.$field = $crate::tree::TensorTree::map_leaves(&self.$field, key.as_deref(), f)?;
                )*
                Ok(module)
            }

            #[allow(unused_variables)]
            fn visit_linear(
                &self,
                path: ::core::option::Option<&str>,
                f: &mut $crate::tree::LinearVisitor<'_>,
            ) -> $crate::error::Result<()> {
                $(
                    let key = $crate::state_dict::apply_prefix(path, $crate::module!(@key $field $($key)?));
                    $crate::tree::TensorTree::visit_linear(&self.$field, key.as_deref(), f)?;
                )*
                Ok(())
            }
        }
    };
    ($ty:ty { $($field:ident $(=> $key:tt)?),* $(,)? } $(static { $($sfield:ident),* $(,)? })?) => {
        $crate::module!(@module $ty { $($field $(=> $key)?),* } [$($($sfield),*)?]);
        $crate::module!(@codec $ty);
        $crate::module!(@tree $ty { $($field $(=> $key)?),* });
    };
}

impl StateDictSerialize for NamedArray {
    fn update_state_dict(&self, state_dict: &mut StateDict, prefix: Option<&str>) -> Result<()> {
        let key = prefix.ok_or(Error::MissingPrefix("serialize"))?;
        state_dict.insert(key, self.array().clone());
        Ok(())
    }

    fn from_state_dict(&self, state_dict: &StateDict, prefix: Option<&str>) -> Result<Self> {
        let key = prefix.ok_or(Error::MissingPrefix("deserialize"))?;
        let tensor = state_dict.require(key)?;
        if state_dict.shape_checks() && tensor.dims() != self.shape().as_slice() {
            return Err(Error::ShapeMismatch {
                key: key.to_string(),
                expected: self.shape(),
                got: tensor.dims().to_vec(),
            });
        }
        let tensor = tensor.to_device(self.device())?;
        Ok(NamedArray::new_unchecked(tensor, self.axes().to_vec()))
    }
}

impl StateDictSerialize for Tensor {
    fn update_state_dict(&self, state_dict: &mut StateDict, prefix: Option<&str>) -> Result<()> {
        let key = prefix.ok_or(Error::MissingPrefix("serialize"))?;
        state_dict.insert(key, self.clone());
        Ok(())
    }

    fn from_state_dict(&self, state_dict: &StateDict, prefix: Option<&str>) -> Result<Self> {
        let key = prefix.ok_or(Error::MissingPrefix("deserialize"))?;
        let tensor = state_dict.require(key)?;
        if state_dict.shape_checks() && tensor.dims() != self.dims() {
            return Err(Error::ShapeMismatch {
                key: key.to_string(),
                expected: self.dims().to_vec(),
                got: tensor.dims().to_vec(),
            });
        }
        Ok(tensor.to_device(self.device())?)
    }

    fn from_untemplated(_key: &str, tensor: &Tensor) -> Result<Self> {
        Ok(tensor.clone())
    }
}

impl<T: StateDictSerialize> StateDictSerialize for Option<T> {
    fn update_state_dict(&self, state_dict: &mut StateDict, prefix: Option<&str>) -> Result<()> {
        match self {
            Some(value) => value.update_state_dict(state_dict, prefix),
            None => Ok(()),
        }
    }

    fn from_state_dict(&self, state_dict: &StateDict, prefix: Option<&str>) -> Result<Self> {
        match self {
            Some(value) => Ok(Some(value.from_state_dict(state_dict, prefix)?)),
            None => {
                let Some(key) = prefix else {
                    return Ok(None);
                };
                match state_dict.get(key) {
                    Some(tensor) => Ok(Some(T::from_untemplated(key, tensor)?)),
                    None => Ok(None),
                }
            }
        }
    }
}

impl<T: StateDictSerialize> StateDictSerialize for Vec<T> {
    fn update_state_dict(&self, state_dict: &mut StateDict, prefix: Option<&str>) -> Result<()> {
        for (i, item) in self.iter().enumerate() {
            item.update_state_dict(state_dict, Some(join_key(prefix, &i.to_string()).as_str()))?;
        }
        Ok(())
    }

    fn from_state_dict(&self, state_dict: &StateDict, prefix: Option<&str>) -> Result<Self> {
        self.iter()
            .enumerate()
            .map(|(i, item)| item.from_state_dict(state_dict, Some(join_key(prefix, &i.to_string()).as_str())))
            .collect()
    }
}

impl<T: StateDictSerialize> StateDictSerialize for BTreeMap<String, T> {
    fn update_state_dict(&self, state_dict: &mut StateDict, prefix: Option<&str>) -> Result<()> {
        for (key, item) in self {
            item.update_state_dict(state_dict, Some(join_key(prefix, key).as_str()))?;
        }
        Ok(())
    }

    fn from_state_dict(&self, state_dict: &StateDict, prefix: Option<&str>) -> Result<Self> {
        self.iter()
            .map(|(key, item)| {
                let value = item.from_state_dict(state_dict, Some(join_key(prefix, key).as_str()))?;
                Ok((key.clone(), value))
            })
            .collect()
    }
}
