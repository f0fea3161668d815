//! Host-side model of a value produced inside the sandbox.
//!
//! The sandbox flattens each captured value into a node table before handing
//! it across the op boundary: primitives travel inline, every object travels
//! once as a [`Node`] and is referred to by index. Reference cycles therefore
//! survive the trip as index cycles, and identity is simply the node index.

use serde::Deserialize;

/// Index of a node in a [`Capture`]'s node table.
pub type NodeId = usize;

/// A value as seen by the serializer.
#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Value {
    #[default]
    Undefined,
    Null,
    Bool { value: bool },
    Number { value: f64 },
    /// `NaN`, `Infinity` or `-Infinity`
    NonFinite { value: String },
    /// Decimal digits of a bigint
    BigInt { value: String },
    String { value: String },
    /// Description as produced by `String(symbol)`
    Symbol { value: String },
    Function { name: String },
    Ref { id: NodeId },
    /// A property whose read threw inside the sandbox
    Unreadable { reason: String },
}

/// A structured value with identity.
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Node {
    Array { items: Vec<Value> },
    /// Own enumerable string-keyed properties, in the object's own order
    Object { entries: Vec<(String, Value)> },
    /// Milliseconds since the epoch, `None` for an invalid date
    Date { time: Option<f64> },
    Error { name: String, message: String },
    /// The object could not be inspected at all (e.g. a throwing proxy)
    Unreadable { reason: String },
}

/// One value plus the node table it refers into.
#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
pub struct Capture {
    pub root: Value,
    #[serde(default)]
    pub nodes: Vec<Node>,
}

impl Capture {
    pub fn primitive(root: Value) -> Self {
        Self {
            root,
            nodes: Vec::new(),
        }
    }

    pub fn node(&self, id: NodeId) -> Option<&Node> {
        self.nodes.get(id)
    }
}

/// One argument slot as it arrives from the sandbox: either a flattened value
/// or the reason the sandbox could not flatten it.
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(untagged)]
pub enum Transported {
    Captured(Capture),
    Failed { error: String },
}

/// Payload of a single log-style call.
#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
pub struct LogCall {
    pub args: Vec<Transported>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_decode_cyclic_capture() {
        let capture: Capture = serde_json::from_str(
            r#"{
                "root": {"type": "ref", "id": 0},
                "nodes": [
                    {"kind": "object", "entries": [["self", {"type": "ref", "id": 0}]]}
                ]
            }"#,
        )
        .unwrap();

        assert_eq!(capture.root, Value::Ref { id: 0 });
        match capture.node(0) {
            Some(Node::Object { entries }) => {
                assert_eq!(entries[0].0, "self");
                assert_eq!(entries[0].1, Value::Ref { id: 0 });
            }
            other => panic!("Expected object node, got {:?}", other),
        }
    }

    #[test]
    fn test_decode_log_call_with_failed_argument() {
        let call: LogCall = serde_json::from_str(
            r#"{"args": [
                {"root": {"type": "string", "value": "hi"}},
                {"error": "too many objects"}
            ]}"#,
        )
        .unwrap();

        assert_eq!(call.args.len(), 2);
        assert!(matches!(call.args[0], Transported::Captured(_)));
        assert!(matches!(call.args[1], Transported::Failed { .. }));
    }

    #[test]
    fn test_decode_invalid_date() {
        let node: Node = serde_json::from_str(r#"{"kind": "date", "time": null}"#).unwrap();
        assert_eq!(node, Node::Date { time: None });
    }
}
