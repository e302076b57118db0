//! Canonical JSON serialization
//!
//! The canonical form is the sole input to every hash FlowSeal computes, so
//! its output is a compatibility contract:
//! - object keys sorted byte-lexicographically, array order preserved
//! - no insignificant whitespace
//! - strings escaped exactly as `serde_json` escapes them
//! - numbers rendered by `serde_json::Number`'s `Display`
//!
//! Traversal tracks every composite node it enters. Visiting the same node
//! twice fails with [`Error::CyclicStructure`]; the evidence model is a tree.

use std::cell::RefCell;
use std::collections::HashSet;
use std::rc::Rc;

use serde::Serialize;
use serde_json::Value;

use crate::{Error, Result};

/// Serialize any value to canonical JSON bytes
pub fn canonical_bytes<T: Serialize + ?Sized>(value: &T) -> Result<Vec<u8>> {
    let value = serde_json::to_value(value)?;
    Ok(canonical_string(&value)?.into_bytes())
}

/// Serialize a JSON value to its canonical string form
pub fn canonical_string(value: &Value) -> Result<String> {
    let mut writer = Writer::default();
    writer.value(value)?;
    Ok(writer.out)
}

/// Serialize a shared node graph to its canonical string form
pub fn canonical_shared(node: &SharedNode) -> Result<String> {
    let mut writer = Writer::default();
    writer.shared(node)?;
    Ok(writer.out)
}

/// JSON-like node whose composites are reference counted and may be shared.
///
/// Used where evidence is assembled incrementally from handles that can
/// alias each other. Owned [`Value`] trees cannot alias, shared nodes can.
#[derive(Debug, Clone)]
pub enum SharedNode {
    Leaf(Value),
    Array(Rc<RefCell<Vec<SharedNode>>>),
    Object(Rc<RefCell<Vec<(String, SharedNode)>>>),
}

impl SharedNode {
    pub fn leaf(value: impl Into<Value>) -> Self {
        SharedNode::Leaf(value.into())
    }

    pub fn array() -> Self {
        SharedNode::Array(Rc::new(RefCell::new(Vec::new())))
    }

    pub fn object() -> Self {
        SharedNode::Object(Rc::new(RefCell::new(Vec::new())))
    }

    /// Append to an array node; no-op on other node kinds
    pub fn push(&self, child: SharedNode) {
        if let SharedNode::Array(items) = self {
            items.borrow_mut().push(child);
        }
    }

    /// Insert or replace a key on an object node; no-op on other node kinds
    pub fn insert(&self, key: impl Into<String>, child: SharedNode) {
        if let SharedNode::Object(entries) = self {
            let key = key.into();
            let mut entries = entries.borrow_mut();
            match entries.iter_mut().find(|(k, _)| *k == key) {
                Some(slot) => slot.1 = child,
                None => entries.push((key, child)),
            }
        }
    }
}

#[derive(Default)]
struct Writer {
    out: String,
    seen: HashSet<usize>,
    path: Vec<String>,
}

impl Writer {
    fn enter(&mut self, addr: usize) -> Result<()> {
        if !self.seen.insert(addr) {
            return Err(Error::CyclicStructure {
                path: self.render_path(),
            });
        }
        Ok(())
    }

    fn render_path(&self) -> String {
        let mut rendered = String::from("$");
        for segment in &self.path {
            rendered.push_str(segment);
        }
        rendered
    }

    fn value(&mut self, value: &Value) -> Result<()> {
        match value {
            Value::Array(items) => {
                self.enter(items as *const Vec<Value> as usize)?;
                self.out.push('[');
                for (i, item) in items.iter().enumerate() {
                    if i > 0 {
                        self.out.push(',');
                    }
                    self.path.push(format!("[{}]", i));
                    self.value(item)?;
                    self.path.pop();
                }
                self.out.push(']');
                Ok(())
            }
            Value::Object(map) => {
                self.enter(map as *const serde_json::Map<String, Value> as usize)?;
                let mut entries: Vec<(&String, &Value)> = map.iter().collect();
                entries.sort_by(|a, b| a.0.as_bytes().cmp(b.0.as_bytes()));
                self.out.push('{');
                for (i, (key, child)) in entries.into_iter().enumerate() {
                    if i > 0 {
                        self.out.push(',');
                    }
                    self.key(key)?;
                    self.path.push(format!(".{}", key));
                    self.value(child)?;
                    self.path.pop();
                }
                self.out.push('}');
                Ok(())
            }
            scalar => self.scalar(scalar),
        }
    }

    fn shared(&mut self, node: &SharedNode) -> Result<()> {
        match node {
            SharedNode::Leaf(value) => self.value(value),
            SharedNode::Array(items) => {
                self.enter(Rc::as_ptr(items) as *const () as usize)?;
                let items = items.borrow();
                self.out.push('[');
                for (i, item) in items.iter().enumerate() {
                    if i > 0 {
                        self.out.push(',');
                    }
                    self.path.push(format!("[{}]", i));
                    self.shared(item)?;
                    self.path.pop();
                }
                self.out.push(']');
                Ok(())
            }
            SharedNode::Object(entries) => {
                self.enter(Rc::as_ptr(entries) as *const () as usize)?;
                let entries = entries.borrow();
                let mut sorted: Vec<&(String, SharedNode)> = entries.iter().collect();
                sorted.sort_by(|a, b| a.0.as_bytes().cmp(b.0.as_bytes()));
                self.out.push('{');
                for (i, (key, child)) in sorted.into_iter().enumerate() {
                    if i > 0 {
                        self.out.push(',');
                    }
                    self.key(key)?;
                    self.path.push(format!(".{}", key));
                    self.shared(child)?;
                    self.path.pop();
                }
                self.out.push('}');
                Ok(())
            }
        }
    }

    fn key(&mut self, key: &str) -> Result<()> {
        self.out.push_str(&serde_json::to_string(key)?);
        self.out.push(':');
        Ok(())
    }

    fn scalar(&mut self, value: &Value) -> Result<()> {
        match value {
            Value::Null => self.out.push_str("null"),
            Value::Bool(b) => self.out.push_str(if *b { "true" } else { "false" }),
            Value::Number(n) => self.out.push_str(&n.to_string()),
            Value::String(s) => self.out.push_str(&serde_json::to_string(s)?),
            Value::Array(_) | Value::Object(_) => {
                return Err(Error::Sealing("composite passed as scalar".to_string()))
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_keys_sorted_and_compact() {
        let value = json!({"b": 1, "a": [3, 2, {"z": null, "y": true}], "c": "x"});
        let out = canonical_string(&value).unwrap();
        assert_eq!(out, r#"{"a":[3,2,{"y":true,"z":null}],"b":1,"c":"x"}"#);
    }

    #[test]
    fn test_insertion_order_independent() {
        let mut first = serde_json::Map::new();
        first.insert("run_id".into(), json!("r1"));
        first.insert("files".into(), json!([]));
        first.insert("created_at".into(), json!("2024-01-01T00:00:00Z"));

        let mut second = serde_json::Map::new();
        second.insert("created_at".into(), json!("2024-01-01T00:00:00Z"));
        second.insert("run_id".into(), json!("r1"));
        second.insert("files".into(), json!([]));

        assert_eq!(
            canonical_string(&Value::Object(first)).unwrap(),
            canonical_string(&Value::Object(second)).unwrap()
        );
    }

    #[test]
    fn test_string_escaping() {
        let value = json!({"note": "line\n\"quoted\"\u{1}"});
        let out = canonical_string(&value).unwrap();
        assert_eq!(out, r#"{"note":"line\n\"quoted\"\u0001"}"#);
    }

    #[test]
    fn test_shared_tree_matches_owned_tree() {
        let root = SharedNode::object();
        let list = SharedNode::array();
        list.push(SharedNode::leaf(1));
        list.push(SharedNode::leaf("two"));
        root.insert("z", SharedNode::leaf(false));
        root.insert("list", list);

        let owned = json!({"list": [1, "two"], "z": false});
        assert_eq!(
            canonical_shared(&root).unwrap(),
            canonical_string(&owned).unwrap()
        );
    }

    #[test]
    fn test_self_reference_is_rejected() {
        let root = SharedNode::object();
        root.insert("self", root.clone());

        let err = canonical_shared(&root).unwrap_err();
        assert!(err.is_cyclic());
        assert!(err.to_string().contains("$.self"));
    }

    #[test]
    fn test_indirect_cycle_is_rejected() {
        let outer = SharedNode::array();
        let inner = SharedNode::object();
        inner.insert("back", outer.clone());
        outer.push(inner);

        assert!(canonical_shared(&outer).unwrap_err().is_cyclic());
    }

    #[test]
    fn test_canonical_bytes_of_struct() {
        #[derive(Serialize)]
        struct Entry {
            size: u64,
            path: &'static str,
        }
        let bytes = canonical_bytes(&Entry { size: 3, path: "a.txt" }).unwrap();
        assert_eq!(bytes, br#"{"path":"a.txt","size":3}"#.to_vec());
    }
}
