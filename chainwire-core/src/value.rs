// Dynamic value model shared by the capture, interpretation and extraction layers.
// Containers and non-plain values are reference types so that identity, shared
// sub-graphs and cycles survive being passed around.

use crate::deferred::Deferred;
use crate::error::RpcError;
use crate::sequence::Sequence;
use indexmap::IndexMap;
use parking_lot::RwLock;
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use serde_json::Number;
use std::fmt;
use std::sync::Arc;

pub type ArrayRef = Arc<RwLock<Vec<Value>>>;
pub type ObjectRef = Arc<RwLock<IndexMap<String, Value>>>;

/// A value as seen by the engine
#[derive(Clone)]
pub enum Value {
    Null,
    Bool(bool),
    Number(Number),
    String(String),
    Array(ArrayRef),
    Object(ObjectRef),
    Function(Function),
    Deferred(Deferred),
    Sequence(Sequence),
}

#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum ValueError {
    #[error("value at '{path}' is a {kind} and cannot be represented as plain data")]
    NotPlainData { path: String, kind: &'static str },

    #[error("value at '{path}' refers back to one of its ancestors")]
    Cycle { path: String },

    #[error("cannot write '{key}' into a {kind}")]
    NotAContainer { key: String, kind: &'static str },

    #[error("index '{key}' is out of bounds")]
    IndexOutOfBounds { key: String },
}

impl From<ValueError> for RpcError {
    fn from(err: ValueError) -> Self {
        RpcError::bad_request(err.to_string())
    }
}

impl Value {
    pub fn array(items: impl IntoIterator<Item = Value>) -> Self {
        Value::Array(Arc::new(RwLock::new(items.into_iter().collect())))
    }

    pub fn object<K: Into<String>>(entries: impl IntoIterator<Item = (K, Value)>) -> Self {
        Value::Object(Arc::new(RwLock::new(
            entries.into_iter().map(|(k, v)| (k.into(), v)).collect(),
        )))
    }

    pub fn empty_object() -> Self {
        Value::Object(Arc::new(RwLock::new(IndexMap::new())))
    }

    pub fn type_name(&self) -> &'static str {
        match self {
            Value::Null => "null",
            Value::Bool(_) => "boolean",
            Value::Number(_) => "number",
            Value::String(_) => "string",
            Value::Array(_) => "array",
            Value::Object(_) => "object",
            Value::Function(_) => "function",
            Value::Deferred(_) => "deferred",
            Value::Sequence(_) => "sequence",
        }
    }

    pub fn is_null(&self) -> bool {
        matches!(self, Value::Null)
    }

    pub fn is_container(&self) -> bool {
        matches!(self, Value::Array(_) | Value::Object(_))
    }

    pub fn as_bool(&self) -> Option<bool> {
        match self {
            Value::Bool(b) => Some(*b),
            _ => None,
        }
    }

    pub fn as_f64(&self) -> Option<f64> {
        match self {
            Value::Number(n) => n.as_f64(),
            _ => None,
        }
    }

    pub fn as_i64(&self) -> Option<i64> {
        match self {
            Value::Number(n) => n.as_i64(),
            _ => None,
        }
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            Value::String(s) => Some(s),
            _ => None,
        }
    }

    pub fn as_function(&self) -> Option<&Function> {
        match self {
            Value::Function(f) => Some(f),
            _ => None,
        }
    }

    /// Stable address of a value with reference identity; `None` for plain data.
    pub fn identity(&self) -> Option<usize> {
        match self {
            Value::Array(a) => Some(Arc::as_ptr(a) as *const () as usize),
            Value::Object(o) => Some(Arc::as_ptr(o) as *const () as usize),
            Value::Function(f) => Some(f.identity()),
            Value::Deferred(d) => Some(d.identity()),
            Value::Sequence(s) => Some(s.identity()),
            _ => None,
        }
    }

    /// True when both values are the same live object.
    pub fn same(&self, other: &Value) -> bool {
        match (self.identity(), other.identity()) {
            (Some(a), Some(b)) => a == b,
            _ => false,
        }
    }

    /// Read one member: object key, array index or function property.
    pub fn get(&self, key: &str) -> Option<Value> {
        match self {
            Value::Object(map) => map.read().get(key).cloned(),
            Value::Array(items) => {
                let index: usize = key.parse().ok()?;
                items.read().get(index).cloned()
            }
            Value::Function(f) => f.property(key),
            _ => None,
        }
    }

    /// Write one member in place. Array writes may append at `len`.
    pub fn set(&self, key: &str, value: Value) -> Result<(), ValueError> {
        match self {
            Value::Object(map) => {
                map.write().insert(key.to_string(), value);
                Ok(())
            }
            Value::Array(items) => {
                let index: usize = key.parse().map_err(|_| ValueError::IndexOutOfBounds {
                    key: key.to_string(),
                })?;
                let mut items = items.write();
                if index < items.len() {
                    items[index] = value;
                    Ok(())
                } else if index == items.len() {
                    items.push(value);
                    Ok(())
                } else {
                    Err(ValueError::IndexOutOfBounds {
                        key: key.to_string(),
                    })
                }
            }
            Value::Function(f) => {
                f.set_property(key, value);
                Ok(())
            }
            other => Err(ValueError::NotAContainer {
                key: key.to_string(),
                kind: other.type_name(),
            }),
        }
    }

    /// Remove one member; returns the previous value if there was one.
    pub fn remove(&self, key: &str) -> Option<Value> {
        match self {
            Value::Object(map) => map.write().shift_remove(key),
            Value::Function(f) => f.remove_property(key),
            _ => None,
        }
    }

    /// Snapshot of `(key, child)` pairs for containers.
    pub fn entries(&self) -> Vec<(String, Value)> {
        match self {
            Value::Object(map) => map
                .read()
                .iter()
                .map(|(k, v)| (k.clone(), v.clone()))
                .collect(),
            Value::Array(items) => items
                .read()
                .iter()
                .enumerate()
                .map(|(i, v)| (i.to_string(), v.clone()))
                .collect(),
            _ => Vec::new(),
        }
    }

    /// Convert to plain JSON, failing on non-plain leaves and on cycles.
    pub fn to_json(&self) -> Result<serde_json::Value, ValueError> {
        let mut ancestors = Vec::new();
        let mut path = Vec::new();
        self.to_json_inner(&mut ancestors, &mut path)
    }

    fn to_json_inner(
        &self,
        ancestors: &mut Vec<usize>,
        path: &mut Vec<String>,
    ) -> Result<serde_json::Value, ValueError> {
        match self {
            Value::Null => Ok(serde_json::Value::Null),
            Value::Bool(b) => Ok(serde_json::Value::Bool(*b)),
            Value::Number(n) => Ok(serde_json::Value::Number(n.clone())),
            Value::String(s) => Ok(serde_json::Value::String(s.clone())),
            Value::Array(_) | Value::Object(_) => {
                let id = self.identity().unwrap_or_default();
                if ancestors.contains(&id) {
                    return Err(ValueError::Cycle { path: path.join(".") });
                }
                ancestors.push(id);
                let is_array = matches!(self, Value::Array(_));
                let mut array = Vec::new();
                let mut object = serde_json::Map::new();
                for (key, child) in self.entries() {
                    path.push(key.clone());
                    let json = child.to_json_inner(ancestors, path)?;
                    path.pop();
                    if is_array {
                        array.push(json);
                    } else {
                        object.insert(key, json);
                    }
                }
                ancestors.pop();
                Ok(if is_array {
                    serde_json::Value::Array(array)
                } else {
                    serde_json::Value::Object(object)
                })
            }
            other => Err(ValueError::NotPlainData {
                path: path.join("."),
                kind: other.type_name(),
            }),
        }
    }

    pub fn from_json(json: serde_json::Value) -> Self {
        match json {
            serde_json::Value::Null => Value::Null,
            serde_json::Value::Bool(b) => Value::Bool(b),
            serde_json::Value::Number(n) => Value::Number(n),
            serde_json::Value::String(s) => Value::String(s),
            serde_json::Value::Array(items) => {
                Value::array(items.into_iter().map(Value::from_json))
            }
            serde_json::Value::Object(map) => {
                Value::object(map.into_iter().map(|(k, v)| (k, Value::from_json(v))))
            }
        }
    }

    fn eq_inner(&self, other: &Value, assumed: &mut Vec<(usize, usize)>) -> bool {
        match (self, other) {
            (Value::Null, Value::Null) => true,
            (Value::Bool(a), Value::Bool(b)) => a == b,
            (Value::Number(a), Value::Number(b)) => a == b,
            (Value::String(a), Value::String(b)) => a == b,
            (Value::Array(_), Value::Array(_)) | (Value::Object(_), Value::Object(_)) => {
                let pair = (
                    self.identity().unwrap_or_default(),
                    other.identity().unwrap_or_default(),
                );
                if pair.0 == pair.1 || assumed.contains(&pair) {
                    return true;
                }
                let left = self.entries();
                let right = other.entries();
                if left.len() != right.len() {
                    return false;
                }
                assumed.push(pair);
                let equal = if matches!(self, Value::Array(_)) {
                    left.iter()
                        .zip(right.iter())
                        .all(|((_, a), (_, b))| a.eq_inner(b, assumed))
                } else {
                    left.iter().all(|(key, a)| {
                        right
                            .iter()
                            .find(|(k, _)| k == key)
                            .is_some_and(|(_, b)| a.eq_inner(b, assumed))
                    })
                };
                assumed.pop();
                equal
            }
            (Value::Function(_), Value::Function(_))
            | (Value::Deferred(_), Value::Deferred(_))
            | (Value::Sequence(_), Value::Sequence(_)) => self.same(other),
            _ => false,
        }
    }

    fn render(&self, ancestors: &mut Vec<usize>, out: &mut String) {
        match self {
            Value::Null => out.push_str("null"),
            Value::Bool(b) => out.push_str(&b.to_string()),
            Value::Number(n) => out.push_str(&n.to_string()),
            Value::String(s) => out.push_str(&format!("{:?}", s)),
            Value::Array(_) | Value::Object(_) => {
                let id = self.identity().unwrap_or_default();
                if ancestors.contains(&id) {
                    out.push_str("<cycle>");
                    return;
                }
                ancestors.push(id);
                let is_array = matches!(self, Value::Array(_));
                out.push(if is_array { '[' } else { '{' });
                for (i, (key, child)) in self.entries().into_iter().enumerate() {
                    if i > 0 {
                        out.push_str(", ");
                    }
                    if !is_array {
                        out.push_str(&format!("{:?}: ", key));
                    }
                    child.render(ancestors, out);
                }
                out.push(if is_array { ']' } else { '}' });
                ancestors.pop();
            }
            Value::Function(f) => out.push_str(&format!("<function {}>", f.name())),
            Value::Deferred(_) => out.push_str("<deferred>"),
            Value::Sequence(_) => out.push_str("<sequence>"),
        }
    }
}

impl PartialEq for Value {
    fn eq(&self, other: &Self) -> bool {
        self.eq_inner(other, &mut Vec::new())
    }
}

impl fmt::Debug for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut out = String::new();
        self.render(&mut Vec::new(), &mut out);
        f.write_str(&out)
    }
}

impl Default for Value {
    fn default() -> Self {
        Value::Null
    }
}

impl Serialize for Value {
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        self.to_json()
            .map_err(serde::ser::Error::custom)?
            .serialize(serializer)
    }
}

impl<'de> Deserialize<'de> for Value {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: Deserializer<'de>,
    {
        serde_json::Value::deserialize(deserializer).map(Value::from_json)
    }
}

impl From<serde_json::Value> for Value {
    fn from(json: serde_json::Value) -> Self {
        Value::from_json(json)
    }
}

impl From<bool> for Value {
    fn from(b: bool) -> Self {
        Value::Bool(b)
    }
}

impl From<i64> for Value {
    fn from(n: i64) -> Self {
        Value::Number(n.into())
    }
}

impl From<f64> for Value {
    fn from(n: f64) -> Self {
        Number::from_f64(n).map(Value::Number).unwrap_or(Value::Null)
    }
}

impl From<&str> for Value {
    fn from(s: &str) -> Self {
        Value::String(s.to_string())
    }
}

impl From<String> for Value {
    fn from(s: String) -> Self {
        Value::String(s)
    }
}

impl From<Vec<Value>> for Value {
    fn from(items: Vec<Value>) -> Self {
        Value::array(items)
    }
}

impl From<Function> for Value {
    fn from(f: Function) -> Self {
        Value::Function(f)
    }
}

impl From<Deferred> for Value {
    fn from(d: Deferred) -> Self {
        Value::Deferred(d)
    }
}

impl From<Sequence> for Value {
    fn from(s: Sequence) -> Self {
        Value::Sequence(s)
    }
}

type NativeFn = dyn Fn(Vec<Value>) -> Result<Value, RpcError> + Send + Sync;

/// A native callable exposed to the engine.
///
/// Like a function object it can carry its own properties, which is how
/// "methods on methods" (for example `multiply.docs`) are modelled.
#[derive(Clone)]
pub struct Function {
    inner: Arc<FunctionInner>,
}

struct FunctionInner {
    name: String,
    call: Option<Box<NativeFn>>,
    construct: Option<Box<NativeFn>>,
    properties: RwLock<IndexMap<String, Value>>,
}

impl Function {
    /// Plain callable function
    pub fn new<F>(name: impl Into<String>, call: F) -> Self
    where
        F: Fn(Vec<Value>) -> Result<Value, RpcError> + Send + Sync + 'static,
    {
        Self::builder(name).call(call).build()
    }

    pub fn builder(name: impl Into<String>) -> FunctionBuilder {
        FunctionBuilder {
            name: name.into(),
            call: None,
            construct: None,
            properties: IndexMap::new(),
        }
    }

    pub fn name(&self) -> &str {
        &self.inner.name
    }

    pub fn is_callable(&self) -> bool {
        self.inner.call.is_some()
    }

    pub fn is_constructible(&self) -> bool {
        self.inner.construct.is_some()
    }

    pub fn call(&self, args: Vec<Value>) -> Result<Value, RpcError> {
        match &self.inner.call {
            Some(call) => call(args),
            None => Err(RpcError::bad_request(format!(
                "{} can only be constructed",
                self.inner.name
            ))),
        }
    }

    pub fn construct(&self, args: Vec<Value>) -> Result<Value, RpcError> {
        match &self.inner.construct {
            Some(construct) => construct(args),
            None => Err(RpcError::bad_request(format!(
                "{} is not a constructor",
                self.inner.name
            ))),
        }
    }

    pub fn property(&self, name: &str) -> Option<Value> {
        self.inner.properties.read().get(name).cloned()
    }

    pub fn set_property(&self, name: &str, value: Value) {
        self.inner.properties.write().insert(name.to_string(), value);
    }

    pub fn remove_property(&self, name: &str) -> Option<Value> {
        self.inner.properties.write().shift_remove(name)
    }

    pub fn identity(&self) -> usize {
        Arc::as_ptr(&self.inner) as *const () as usize
    }
}

impl fmt::Debug for Function {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Function")
            .field("name", &self.inner.name)
            .field("callable", &self.is_callable())
            .field("constructible", &self.is_constructible())
            .finish()
    }
}

pub struct FunctionBuilder {
    name: String,
    call: Option<Box<NativeFn>>,
    construct: Option<Box<NativeFn>>,
    properties: IndexMap<String, Value>,
}

impl FunctionBuilder {
    pub fn call<F>(mut self, call: F) -> Self
    where
        F: Fn(Vec<Value>) -> Result<Value, RpcError> + Send + Sync + 'static,
    {
        self.call = Some(Box::new(call));
        self
    }

    pub fn construct<F>(mut self, construct: F) -> Self
    where
        F: Fn(Vec<Value>) -> Result<Value, RpcError> + Send + Sync + 'static,
    {
        self.construct = Some(Box::new(construct));
        self
    }

    pub fn property(mut self, name: impl Into<String>, value: impl Into<Value>) -> Self {
        self.properties.insert(name.into(), value.into());
        self
    }

    pub fn build(self) -> Function {
        Function {
            inner: Arc::new(FunctionInner {
                name: self.name,
                call: self.call,
                construct: self.construct,
                properties: RwLock::new(self.properties),
            }),
        }
    }
}

impl fmt::Debug for FunctionBuilder {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("FunctionBuilder")
            .field("name", &self.name)
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_json_round_trip() {
        let json = json!({"a": [1, 2.5, "x"], "b": {"c": null, "d": true}});
        let value = Value::from_json(json.clone());
        assert_eq!(value.to_json().unwrap(), json);
    }

    #[test]
    fn test_object_preserves_insertion_order() {
        let value = Value::object([("z", Value::from(1)), ("a", Value::from(2))]);
        let keys: Vec<String> = value.entries().into_iter().map(|(k, _)| k).collect();
        assert_eq!(keys, vec!["z", "a"]);
    }

    #[test]
    fn test_to_json_rejects_non_plain_leaf() {
        let f = Function::new("noop", |_| Ok(Value::Null));
        let value = Value::object([("inner", Value::array([Value::from(f)]))]);
        match value.to_json() {
            Err(ValueError::NotPlainData { path, kind }) => {
                assert_eq!(path, "inner.0");
                assert_eq!(kind, "function");
            }
            other => panic!("unexpected: {:?}", other),
        }
    }

    #[test]
    fn test_to_json_rejects_cycle() {
        let value = Value::empty_object();
        value.set("me", value.clone()).unwrap();
        assert_eq!(
            value.to_json(),
            Err(ValueError::Cycle {
                path: "me".to_string()
            })
        );
        assert!(serde_json::to_string(&value).is_err());
    }

    #[test]
    fn test_shared_subgraph_is_not_a_cycle() {
        let shared = Value::array([Value::from(1)]);
        let value = Value::object([("a", shared.clone()), ("b", shared)]);
        assert_eq!(value.to_json().unwrap(), json!({"a": [1], "b": [1]}));
    }

    #[test]
    fn test_get_and_set() {
        let value = Value::object([("list", Value::array(Vec::new()))]);
        let list = value.get("list").unwrap();
        list.set("0", Value::from("first")).unwrap();
        assert!(list.set("5", Value::Null).is_err());
        assert_eq!(value.get("list").unwrap().get("0"), Some(Value::from("first")));
        assert!(Value::from(3).set("x", Value::Null).is_err());
    }

    #[test]
    fn test_structural_equality_handles_cycles() {
        let a = Value::empty_object();
        a.set("me", a.clone()).unwrap();
        let b = Value::empty_object();
        b.set("me", b.clone()).unwrap();
        assert_eq!(a, b);
        assert_eq!(format!("{:?}", a), "{\"me\": <cycle>}");
    }

    #[test]
    fn test_function_properties_and_calls() {
        let docs = Function::new("docs", |_| Ok(Value::from("multiplies two numbers")));
        let multiply = Function::builder("multiply")
            .call(|args| {
                let a = args.first().and_then(Value::as_f64).unwrap_or(0.0);
                let b = args.get(1).and_then(Value::as_f64).unwrap_or(0.0);
                Ok(Value::from(a * b))
            })
            .property("docs", docs)
            .build();

        assert_eq!(
            multiply.call(vec![Value::from(3), Value::from(4)]).unwrap(),
            Value::from(12.0)
        );
        assert!(multiply.construct(vec![]).is_err());
        let docs = Value::from(multiply).get("docs").unwrap();
        assert_eq!(
            docs.as_function().unwrap().call(vec![]).unwrap(),
            Value::from("multiplies two numbers")
        );
    }
}
