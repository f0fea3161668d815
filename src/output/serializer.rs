//! Crash-safe text rendering of captured values.
//!
//! Primitives render as plain text. Arrays and objects render as pretty JSON
//! with keys in the order the value provided them. A reference back to an
//! object that is still being rendered becomes [`CIRCULAR_SENTINEL`]; anything
//! that cannot be encoded becomes [`UNSERIALIZABLE_SENTINEL`] in place. No
//! input makes this module fail or recurse without bound.

use std::collections::HashSet;

use chrono::{DateTime, SecondsFormat};
use serde_json::{Map, Value as Json};
use thiserror::Error;
use tracing::debug;

use crate::output::value::{Capture, Node, NodeId, Transported, Value};

pub const CIRCULAR_SENTINEL: &str = "[Circular]";
pub const UNSERIALIZABLE_SENTINEL: &str = "[Unserializable]";

/// Deepest nesting rendered before the subtree is replaced by a sentinel.
pub const MAX_DEPTH: usize = 256;

/// Largest integer that is still exact in an f64.
const MAX_SAFE_INTEGER: f64 = 9_007_199_254_740_991.0;

/// Render budget used when the caller has no tighter one.
pub const DEFAULT_BUDGET: usize = 1024 * 1024;

/// State shared by the serialize calls of one log call or final value.
///
/// `path` holds the identities on the current descent path. A node is marked
/// on the way down and unmarked on the way back up, so two siblings sharing an
/// object are both rendered in full and only a node that is reachable from
/// itself is cut.
///
/// `budget` is an estimate of the bytes still allowed out. Shared subtrees are
/// rendered once per path through them, so without it a small node table can
/// expand exponentially. Once it runs out the context is exhausted and every
/// further call yields nothing.
#[derive(Debug)]
pub struct SerializationContext {
    path: HashSet<NodeId>,
    budget: usize,
    exhausted: bool,
}

impl Default for SerializationContext {
    fn default() -> Self {
        Self::with_budget(DEFAULT_BUDGET)
    }
}

impl SerializationContext {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_budget(budget: usize) -> Self {
        Self {
            path: HashSet::new(),
            budget,
            exhausted: false,
        }
    }

    /// True once rendering stopped because the budget ran out.
    pub fn is_exhausted(&self) -> bool {
        self.exhausted
    }

    fn charge(&mut self, cost: usize) -> Result<(), SerializeError> {
        match self.budget.checked_sub(cost) {
            Some(left) if !self.exhausted => {
                self.budget = left;
                Ok(())
            }
            _ => {
                self.exhausted = true;
                Err(SerializeError::OverBudget)
            }
        }
    }

    fn enter(&mut self, id: NodeId) -> bool {
        self.path.insert(id)
    }

    fn leave(&mut self, id: NodeId) {
        self.path.remove(&id);
    }
}

#[derive(Debug, Error)]
enum SerializeError {
    #[error("bigint {0} has no JSON form")]
    BigInt(String),

    #[error("value could not be read: {0}")]
    Unreadable(String),

    #[error("nesting deeper than {MAX_DEPTH} levels")]
    TooDeep,

    #[error("reference to missing node {0}")]
    DanglingRef(NodeId),

    #[error("render budget exhausted")]
    OverBudget,
}

/// Render one captured value as text.
///
/// Returns an empty string when the context's budget runs out; the caller
/// treats that as truncated output.
pub fn serialize(capture: &Capture, ctx: &mut SerializationContext) -> String {
    if ctx.is_exhausted() {
        return String::new();
    }

    let text = match &capture.root {
        Value::Ref { id } => match capture.node(*id) {
            Some(Node::Date { time }) => time
                .and_then(iso_date)
                .unwrap_or_else(|| "Invalid Date".to_string()),
            Some(Node::Error { name, message }) => error_text(name, message),
            Some(_) => {
                let mut encoder = Encoder {
                    capture,
                    ctx: &mut *ctx,
                };
                // Structures were charged member by member while encoding.
                return match encoder.encode_node(*id, 0) {
                    Ok(json) => serde_json::to_string_pretty(&json)
                        .unwrap_or_else(|_| UNSERIALIZABLE_SENTINEL.to_string()),
                    Err(SerializeError::OverBudget) => String::new(),
                    Err(e) => {
                        debug!(error = %e, "Replacing unserializable value");
                        UNSERIALIZABLE_SENTINEL.to_string()
                    }
                };
            }
            None => UNSERIALIZABLE_SENTINEL.to_string(),
        },
        root => primitive_text(root),
    };

    // Already materialized; the buffer clips it if it does not fit.
    ctx.budget = ctx.budget.saturating_sub(text.len());
    text
}

/// Render an argument slot, substituting the sentinel when the sandbox could
/// not capture it.
pub fn serialize_transported(arg: &Transported, ctx: &mut SerializationContext) -> String {
    match arg {
        Transported::Captured(capture) => serialize(capture, ctx),
        Transported::Failed { error } => {
            debug!(error = %error, "Sandbox failed to capture value");
            UNSERIALIZABLE_SENTINEL.to_string()
        }
    }
}

struct Encoder<'a> {
    capture: &'a Capture,
    ctx: &'a mut SerializationContext,
}

impl<'a> Encoder<'a> {
    /// `None` means the value has no JSON form and is skipped by its parent.
    fn encode_value(&mut self, value: &'a Value, depth: usize) -> Result<Option<Json>, SerializeError> {
        match value {
            Value::Undefined | Value::Function { .. } | Value::Symbol { .. } => Ok(None),
            Value::Null | Value::NonFinite { .. } => Ok(Some(Json::Null)),
            Value::Bool { value } => Ok(Some(Json::Bool(*value))),
            Value::Number { value } => Ok(Some(number_json(*value))),
            Value::String { value } => {
                self.ctx.charge(value.len())?;
                Ok(Some(Json::String(value.clone())))
            }
            Value::BigInt { value } => Err(SerializeError::BigInt(value.clone())),
            Value::Unreadable { reason } => Err(SerializeError::Unreadable(reason.clone())),
            Value::Ref { id } => self.encode_node(*id, depth + 1).map(Some),
        }
    }

    /// Encode a member of an array or object. Failures become the sentinel in
    /// place, except an exhausted budget, which ends the whole render.
    fn encode_child(
        &mut self,
        value: &'a Value,
        depth: usize,
        key_len: usize,
    ) -> Result<Option<Json>, SerializeError> {
        // Indentation, key, quotes, separator and a short scalar.
        self.ctx.charge(2 * (depth + 1) + key_len + 8)?;
        match self.encode_value(value, depth) {
            Err(SerializeError::OverBudget) => Err(SerializeError::OverBudget),
            Err(e) => {
                debug!(error = %e, "Replacing unserializable value");
                Ok(Some(Json::String(UNSERIALIZABLE_SENTINEL.to_string())))
            }
            Ok(json) => Ok(json),
        }
    }

    fn encode_node(&mut self, id: NodeId, depth: usize) -> Result<Json, SerializeError> {
        if depth > MAX_DEPTH {
            return Err(SerializeError::TooDeep);
        }
        let capture = self.capture;
        let node = capture.node(id).ok_or(SerializeError::DanglingRef(id))?;

        match node {
            Node::Date { time } => Ok(time.and_then(iso_date).map_or(Json::Null, Json::String)),
            Node::Error { name, message } => Ok(Json::String(error_text(name, message))),
            Node::Unreadable { reason } => Err(SerializeError::Unreadable(reason.clone())),
            Node::Array { items } => {
                if !self.ctx.enter(id) {
                    return Ok(Json::String(CIRCULAR_SENTINEL.to_string()));
                }
                let mut encoded = Vec::with_capacity(items.len());
                for item in items {
                    encoded.push(self.encode_child(item, depth, 0)?.unwrap_or(Json::Null));
                }
                self.ctx.leave(id);
                Ok(Json::Array(encoded))
            }
            Node::Object { entries } => {
                if !self.ctx.enter(id) {
                    return Ok(Json::String(CIRCULAR_SENTINEL.to_string()));
                }
                let mut map = Map::with_capacity(entries.len());
                for (key, value) in entries {
                    if let Some(json) = self.encode_child(value, depth, key.len())? {
                        map.insert(key.clone(), json);
                    }
                }
                self.ctx.leave(id);
                Ok(Json::Object(map))
            }
        }
    }
}

fn primitive_text(value: &Value) -> String {
    match value {
        Value::Undefined => "undefined".to_string(),
        Value::Null => "null".to_string(),
        Value::Bool { value } => value.to_string(),
        Value::Number { value } => number_text(*value),
        Value::NonFinite { value } | Value::BigInt { value } | Value::String { value } => value.clone(),
        Value::Symbol { value } => value.clone(),
        Value::Function { name } if name.is_empty() => "[Function (anonymous)]".to_string(),
        Value::Function { name } => format!("[Function: {}]", name),
        Value::Unreadable { .. } | Value::Ref { .. } => UNSERIALIZABLE_SENTINEL.to_string(),
    }
}

/// Number to text the way `String(number)` does it.
fn number_text(value: f64) -> String {
    if value == 0.0 {
        return "0".to_string();
    }
    let magnitude = value.abs();
    if magnitude >= 1e21 || magnitude < 1e-6 {
        let text = format!("{:e}", value);
        match text.split_once('e') {
            Some((mantissa, exponent)) if !exponent.starts_with('-') => {
                format!("{}e+{}", mantissa, exponent)
            }
            _ => text,
        }
    } else {
        value.to_string()
    }
}

fn number_json(value: f64) -> Json {
    if value.fract() == 0.0 && value.abs() <= MAX_SAFE_INTEGER {
        return Json::from(value as i64);
    }
    serde_json::Number::from_f64(value).map_or(Json::Null, Json::Number)
}

fn iso_date(millis: f64) -> Option<String> {
    if !millis.is_finite() {
        return None;
    }
    DateTime::from_timestamp_millis(millis as i64)
        .map(|date| date.to_rfc3339_opts(SecondsFormat::Millis, true))
}

fn error_text(name: &str, message: &str) -> String {
    if message.is_empty() {
        name.to_string()
    } else {
        format!("{}: {}", name, message)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn render(capture: &Capture) -> String {
        serialize(capture, &mut SerializationContext::new())
    }

    fn string(value: &str) -> Value {
        Value::String {
            value: value.to_string(),
        }
    }

    fn number(value: f64) -> Value {
        Value::Number { value }
    }

    fn object(entries: Vec<(&str, Value)>) -> Node {
        Node::Object {
            entries: entries
                .into_iter()
                .map(|(k, v)| (k.to_string(), v))
                .collect(),
        }
    }

    #[test]
    fn test_primitives_render_as_plain_text() {
        assert_eq!(render(&Capture::primitive(string("hi"))), "hi");
        assert_eq!(render(&Capture::primitive(number(42.0))), "42");
        assert_eq!(render(&Capture::primitive(number(1.5))), "1.5");
        assert_eq!(render(&Capture::primitive(number(-0.0))), "0");
        assert_eq!(render(&Capture::primitive(number(1e21))), "1e+21");
        assert_eq!(render(&Capture::primitive(number(1e-7))), "1e-7");
        assert_eq!(render(&Capture::primitive(Value::Bool { value: true })), "true");
        assert_eq!(render(&Capture::primitive(Value::Null)), "null");
        assert_eq!(render(&Capture::primitive(Value::Undefined)), "undefined");
        assert_eq!(
            render(&Capture::primitive(Value::Function {
                name: "add".to_string()
            })),
            "[Function: add]"
        );
    }

    #[test]
    fn test_self_reference_is_cut_once() {
        let capture = Capture {
            root: Value::Ref { id: 0 },
            nodes: vec![object(vec![
                ("name", string("a")),
                ("self", Value::Ref { id: 0 }),
            ])],
        };

        let text = render(&capture);
        assert_eq!(text.matches(CIRCULAR_SENTINEL).count(), 1);

        let parsed: Json = serde_json::from_str(&text).unwrap();
        assert_eq!(parsed["name"], "a");
        assert_eq!(parsed["self"], CIRCULAR_SENTINEL);
    }

    #[test]
    fn test_indirect_cycle_is_cut_once_per_edge() {
        // a.b = b; b.a = a; [a, b]
        let capture = Capture {
            root: Value::Ref { id: 0 },
            nodes: vec![
                Node::Array {
                    items: vec![Value::Ref { id: 1 }, Value::Ref { id: 2 }],
                },
                object(vec![("b", Value::Ref { id: 2 })]),
                object(vec![("a", Value::Ref { id: 1 })]),
            ],
        };

        let text = render(&capture);
        let parsed: Json = serde_json::from_str(&text).unwrap();
        assert_eq!(parsed[0]["b"]["a"], CIRCULAR_SENTINEL);
        assert_eq!(parsed[1]["a"]["b"], CIRCULAR_SENTINEL);
        assert_eq!(text.matches(CIRCULAR_SENTINEL).count(), 2);
    }

    #[test]
    fn test_shared_sibling_is_not_circular() {
        // const shared = {v: 1}; {left: shared, right: shared}
        let capture = Capture {
            root: Value::Ref { id: 0 },
            nodes: vec![
                object(vec![
                    ("left", Value::Ref { id: 1 }),
                    ("right", Value::Ref { id: 1 }),
                ]),
                object(vec![("v", number(1.0))]),
            ],
        };

        let text = render(&capture);
        assert!(!text.contains(CIRCULAR_SENTINEL));
        let parsed: Json = serde_json::from_str(&text).unwrap();
        assert_eq!(parsed["left"]["v"], 1);
        assert_eq!(parsed["right"]["v"], 1);
    }

    #[test]
    fn test_acyclic_structure_round_trips() {
        let capture = Capture {
            root: Value::Ref { id: 0 },
            nodes: vec![
                object(vec![
                    ("zeta", number(1.0)),
                    ("alpha", Value::Ref { id: 1 }),
                    ("flag", Value::Bool { value: false }),
                    ("none", Value::Null),
                    ("ratio", number(0.25)),
                ]),
                Node::Array {
                    items: vec![string("x"), number(2.0)],
                },
            ],
        };

        let text = render(&capture);
        let parsed: Json = serde_json::from_str(&text).unwrap();
        assert_eq!(
            parsed,
            serde_json::json!({
                "zeta": 1,
                "alpha": ["x", 2],
                "flag": false,
                "none": null,
                "ratio": 0.25
            })
        );

        // Key order is the object's own order, not sorted.
        let zeta = text.find("zeta").unwrap();
        let alpha = text.find("alpha").unwrap();
        assert!(zeta < alpha);
        assert!(text.contains("\n  \"zeta\": 1"));
    }

    #[test]
    fn test_json_conventions_for_nested_values() {
        let capture = Capture {
            root: Value::Ref { id: 0 },
            nodes: vec![
                object(vec![
                    ("skip", Value::Undefined),
                    ("fn", Value::Function {
                        name: "f".to_string(),
                    }),
                    ("list", Value::Ref { id: 1 }),
                    ("nan", Value::NonFinite {
                        value: "NaN".to_string(),
                    }),
                ]),
                Node::Array {
                    items: vec![Value::Undefined, number(1.0)],
                },
            ],
        };

        let parsed: Json = serde_json::from_str(&render(&capture)).unwrap();
        assert_eq!(
            parsed,
            serde_json::json!({ "list": [null, 1], "nan": null })
        );
    }

    #[test]
    fn test_unencodable_value_is_replaced_in_place() {
        let capture = Capture {
            root: Value::Ref { id: 0 },
            nodes: vec![object(vec![
                ("ok", number(1.0)),
                ("big", Value::BigInt {
                    value: "10".to_string(),
                }),
                ("getter", Value::Unreadable {
                    reason: "boom".to_string(),
                }),
                ("dangling", Value::Ref { id: 7 }),
            ])],
        };

        let parsed: Json = serde_json::from_str(&render(&capture)).unwrap();
        assert_eq!(parsed["ok"], 1);
        assert_eq!(parsed["big"], UNSERIALIZABLE_SENTINEL);
        assert_eq!(parsed["getter"], UNSERIALIZABLE_SENTINEL);
        assert_eq!(parsed["dangling"], UNSERIALIZABLE_SENTINEL);
    }

    #[test]
    fn test_unreadable_root_and_failed_capture() {
        let capture = Capture {
            root: Value::Ref { id: 0 },
            nodes: vec![Node::Unreadable {
                reason: "proxy trap threw".to_string(),
            }],
        };
        assert_eq!(render(&capture), UNSERIALIZABLE_SENTINEL);

        let failed = Transported::Failed {
            error: "too many objects".to_string(),
        };
        assert_eq!(
            serialize_transported(&failed, &mut SerializationContext::new()),
            UNSERIALIZABLE_SENTINEL
        );
    }

    #[test]
    fn test_deep_nesting_is_bounded() {
        let depth = MAX_DEPTH * 4;
        let nodes = (0..depth)
            .map(|i| Node::Array {
                items: if i + 1 < depth {
                    vec![Value::Ref { id: i + 1 }]
                } else {
                    Vec::new()
                },
            })
            .collect();
        let capture = Capture {
            root: Value::Ref { id: 0 },
            nodes,
        };

        let text = render(&capture);
        assert!(text.contains(UNSERIALIZABLE_SENTINEL));
    }

    #[test]
    fn test_dates_and_errors() {
        let date = Capture {
            root: Value::Ref { id: 0 },
            nodes: vec![Node::Date { time: Some(0.0) }],
        };
        assert_eq!(render(&date), "1970-01-01T00:00:00.000Z");

        let invalid = Capture {
            root: Value::Ref { id: 0 },
            nodes: vec![Node::Date { time: None }],
        };
        assert_eq!(render(&invalid), "Invalid Date");

        let error = Capture {
            root: Value::Ref { id: 0 },
            nodes: vec![Node::Error {
                name: "TypeError".to_string(),
                message: "nope".to_string(),
            }],
        };
        assert_eq!(render(&error), "TypeError: nope");
    }

    /// x = {}; repeat n times: x = {a: x, b: x}. Node 0 is the outermost.
    fn doubling(n: usize) -> Capture {
        let mut nodes: Vec<Node> = (0..n)
            .map(|i| {
                object(vec![
                    ("a", Value::Ref { id: i + 1 }),
                    ("b", Value::Ref { id: i + 1 }),
                ])
            })
            .collect();
        nodes.push(object(Vec::new()));
        Capture {
            root: Value::Ref { id: 0 },
            nodes,
        }
    }

    #[test]
    fn test_shared_subtrees_render_within_budget() {
        let text = render(&doubling(3));
        let parsed: Json = serde_json::from_str(&text).unwrap();
        assert_eq!(parsed["a"]["b"]["a"], serde_json::json!({}));
        assert_eq!(parsed["b"]["b"]["b"], serde_json::json!({}));
    }

    #[test]
    fn test_exponential_expansion_stops_at_budget() {
        let started = std::time::Instant::now();
        let mut ctx = SerializationContext::with_budget(64 * 1024);
        let text = serialize(&doubling(40), &mut ctx);

        assert!(ctx.is_exhausted());
        assert!(text.is_empty());
        assert!(started.elapsed() < std::time::Duration::from_secs(5));

        // An exhausted context renders nothing further.
        assert_eq!(serialize(&Capture::primitive(string("late")), &mut ctx), "");
    }

    #[test]
    fn test_budget_is_shared_across_calls() {
        let capture = Capture {
            root: Value::Ref { id: 0 },
            nodes: vec![Node::Array {
                items: vec![string(&"x".repeat(40))],
            }],
        };
        let mut ctx = SerializationContext::with_budget(80);
        assert!(!serialize(&capture, &mut ctx).is_empty());
        assert!(serialize(&capture, &mut ctx).is_empty());
        assert!(ctx.is_exhausted());
    }
}
