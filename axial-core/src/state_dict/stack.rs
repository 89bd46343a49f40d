//! Stacked block groups
//!
//! Repeated blocks are stored natively as one tree whose leaves carry a leading
//! block axis. Foreign checkpoints number them instead: `h.0.attn.weight`,
//! `h.1.attn.weight`, and so on. These helpers convert between the two.

use std::collections::BTreeMap;

use candle_core::Tensor;
use regex::Regex;

use crate::error::{Error, Result};
use crate::state_dict::{StateDict, join_key};

/// Splits every tensor under `prefix` along its leading axis into
/// `prefix.<i>.<rest>` entries. Other keys pass through.
pub fn unstack_state_dict(state_dict: &StateDict, prefix: Option<&str>) -> Result<StateDict> {
    let lead = join_key(prefix, "");
    let mut out = state_dict.empty_like();
    for (key, value) in state_dict.iter() {
        match value {
            Some(tensor) if key.starts_with(&lead) => {
                let rest = &key[lead.len()..];
                let Some(&blocks) = tensor.dims().first() else {
                    return Err(Error::Structure(format!("cannot unstack scalar '{key}'")));
                };
                for i in 0..blocks {
                    out.insert(format!("{lead}{i}.{rest}"), tensor.get(i)?);
                }
            }
            _ => out.insert_optional(key, value.cloned()),
        }
    }
    Ok(out)
}

/// Stacks `prefix.<i>.<rest>` entries into one `prefix.<rest>` tensor per
/// `<rest>`, in index order. Indices must run densely from 0.
///
/// A `<rest>` that is `None` in every block passes through unstacked; one that
/// is `None` in some blocks only is an error.
pub fn stack_state_dict(state_dict: &StateDict, prefix: Option<&str>) -> Result<StateDict> {
    let pattern = match prefix {
        Some(prefix) => format!(r"^{}\.(\d+)\.(.*)$", regex::escape(prefix)),
        None => r"^(\d+)\.(.*)$".to_string(),
    };
    let re = Regex::new(&pattern)
        .map_err(|e| Error::Structure(format!("invalid stack prefix {prefix:?}: {e}")))?;

    let mut groups: BTreeMap<String, BTreeMap<usize, Tensor>> = BTreeMap::new();
    let mut absent: BTreeMap<String, Vec<String>> = BTreeMap::new();
    let mut out = state_dict.empty_like();
    for (key, value) in state_dict.iter() {
        let Some(caps) = re.captures(key) else {
            out.insert_optional(key, value.cloned());
            continue;
        };
        let Some(tensor) = value else {
            absent.entry(caps[2].to_string()).or_default().push(key.to_string());
            continue;
        };
        let index: usize = caps[1]
            .parse()
            .map_err(|_| Error::Structure(format!("block index out of range in '{key}'")))?;
        let slots = groups.entry(caps[2].to_string()).or_default();
        if slots.insert(index, tensor.clone()).is_some() {
            return Err(Error::DuplicateKey(key.to_string()));
        }
    }

    for (rest, keys) in absent {
        if groups.contains_key(&rest) {
            return Err(Error::Structure(format!(
                "'{}' is present in some blocks but not in {keys:?}",
                join_key(prefix, &rest)
            )));
        }
        for key in keys {
            out.insert_optional(key, None);
        }
    }

    for (rest, slots) in groups {
        let key = join_key(prefix, &rest);
        let mut blocks = Vec::with_capacity(slots.len());
        for (expected, (index, tensor)) in slots.into_iter().enumerate() {
            if index != expected {
                return Err(Error::MissingBlock {
                    key,
                    index: expected,
                });
            }
            blocks.push(tensor);
        }
        out.insert(key, Tensor::stack(&blocks, 0)?);
    }
    Ok(out)
}

#[cfg(test)]
mod tests {
    use super::*;
    use candle_core::{DType, Device};

    fn filled(value: f32, shape: &[usize]) -> Tensor {
        Tensor::full(value, shape.to_vec(), &Device::Cpu).unwrap()
    }

    fn values(t: &Tensor) -> Vec<f32> {
        t.flatten_all().unwrap().to_vec1::<f32>().unwrap()
    }

    #[test]
    fn test_stack_then_unstack() {
        let mut sd = StateDict::new();
        for i in 0..3 {
            sd.insert(format!("h.{i}.attn.weight"), filled(i as f32, &[2, 2]));
            sd.insert(format!("h.{i}.ln.bias"), filled(10.0 + i as f32, &[2]));
        }
        sd.insert("wte.weight", filled(7.0, &[4, 2]));

        let stacked = stack_state_dict(&sd, Some("h")).unwrap();
        let keys: Vec<&str> = stacked.keys().collect();
        assert_eq!(keys, vec!["h.attn.weight", "h.ln.bias", "wte.weight"]);
        assert_eq!(stacked.get("h.attn.weight").unwrap().dims(), &[3, 2, 2]);
        assert_eq!(values(stacked.get("h.ln.bias").unwrap()), vec![10.0, 10.0, 11.0, 11.0, 12.0, 12.0]);

        let unstacked = unstack_state_dict(&stacked, Some("h")).unwrap();
        assert_eq!(unstacked.len(), sd.len());
        for (key, value) in sd.iter() {
            assert_eq!(values(unstacked.get(key).unwrap()), values(value.unwrap()), "{key}");
        }
    }

    #[test]
    fn test_unstack_then_stack() {
        let mut sd = StateDict::new();
        let t = Tensor::arange(0f32, 12f32, &Device::Cpu).unwrap().reshape((3, 4)).unwrap();
        sd.insert("blocks.w", t.clone());
        sd.insert("blocksx", filled(1.0, &[1]));
        let unstacked = unstack_state_dict(&sd, Some("blocks")).unwrap();
        assert_eq!(values(unstacked.get("blocks.2.w").unwrap()), vec![8.0, 9.0, 10.0, 11.0]);
        assert!(unstacked.contains_key("blocksx"));

        let stacked = stack_state_dict(&unstacked, Some("blocks")).unwrap();
        assert_eq!(values(stacked.get("blocks.w").unwrap()), values(&t));
    }

    #[test]
    fn test_missing_index_fails() {
        let mut sd = StateDict::new();
        for i in [0, 1, 3] {
            sd.insert(format!("h.{i}.w"), filled(0.0, &[1]));
        }
        match stack_state_dict(&sd, Some("h")) {
            Err(Error::MissingBlock { key, index }) => {
                assert_eq!(key, "h.w");
                assert_eq!(index, 2);
            }
            other => panic!("expected a missing block, got {other:?}"),
        }
    }

    #[test]
    fn test_duplicate_index_fails() {
        let mut sd = StateDict::new();
        sd.insert("h.1.w", filled(0.0, &[1]));
        sd.insert("h.01.w", filled(0.0, &[1]));
        sd.insert("h.0.w", filled(0.0, &[1]));
        assert!(matches!(stack_state_dict(&sd, Some("h")), Err(Error::DuplicateKey(_))));
    }

    #[test]
    fn test_absent_leaves() {
        let mut sd = StateDict::new();
        for i in 0..2 {
            sd.insert(format!("h.{i}.w"), filled(i as f32, &[2]));
            sd.insert_optional(format!("h.{i}.bias"), None);
        }
        let stacked = stack_state_dict(&sd, Some("h")).unwrap();
        let keys: Vec<&str> = stacked.keys().collect();
        assert_eq!(keys, vec!["h.0.bias", "h.1.bias", "h.w"]);
        assert!(stacked.get("h.0.bias").is_none());

        let unstacked = unstack_state_dict(&stacked, Some("h")).unwrap();
        assert_eq!(unstacked.len(), sd.len());
        assert!(unstacked.get("h.1.bias").is_none());
        assert_eq!(values(unstacked.get("h.1.w").unwrap()), vec![1.0, 1.0]);

        sd.insert("h.1.bias", filled(0.0, &[2]));
        assert!(matches!(stack_state_dict(&sd, Some("h")), Err(Error::Structure(_))));
    }

    #[test]
    fn test_prefix_is_escaped() {
        let mut sd = StateDict::new();
        sd.insert("a.b.0.w", filled(1.0, &[1]));
        sd.insert("aXb.0.w", filled(2.0, &[1]));
        let stacked = stack_state_dict(&sd, Some("a.b")).unwrap();
        assert!(stacked.contains_key("a.b.w"));
        assert!(stacked.contains_key("aXb.0.w"));
        assert_eq!(stacked.get("a.b.w").unwrap().dtype(), DType::F32);
    }
}
