use crate::error::RpcError;
use serde::{Deserialize, Deserializer, Serialize};
use serde_json::Value as JsonValue;

// `"result": null` is a successful null, not a missing result.
fn present<'de, D>(deserializer: D) -> Result<Option<JsonValue>, D::Error>
where
    D: Deserializer<'de>,
{
    JsonValue::deserialize(deserializer).map(Some)
}

fn is_false(value: &bool) -> bool {
    !*value
}

/// One call slice as it travels to the interpreter
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RpcFunctionCall {
    pub id: String,
    pub method: Vec<String>,
    #[serde(default)]
    pub args: Vec<JsonValue>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub chain: Option<String>,
    #[serde(rename = "new", default, skip_serializing_if = "is_false")]
    pub is_construct: bool,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub expect: Vec<String>,
}

impl RpcFunctionCall {
    pub fn new(id: impl Into<String>, method: Vec<String>, args: Vec<JsonValue>) -> Self {
        RpcFunctionCall {
            id: id.into(),
            method,
            args,
            chain: None,
            is_construct: false,
            expect: Vec::new(),
        }
    }

    pub fn chained_from(mut self, parent: impl Into<String>) -> Self {
        self.chain = Some(parent.into());
        self
    }

    pub fn construct(mut self) -> Self {
        self.is_construct = true;
        self
    }

    pub fn expecting(mut self, expect: Vec<String>) -> Self {
        self.expect = expect;
        self
    }
}

/// Answer to one [`RpcFunctionCall`]; exactly one of `result` and `error` is set.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RpcFunctionResult {
    pub id: String,
    #[serde(default, deserialize_with = "present", skip_serializing_if = "Option::is_none")]
    pub result: Option<JsonValue>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<RpcError>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub expect: Vec<String>,
}

impl RpcFunctionResult {
    pub fn success(id: impl Into<String>, result: JsonValue, expect: Vec<String>) -> Self {
        RpcFunctionResult {
            id: id.into(),
            result: Some(result),
            error: None,
            expect,
        }
    }

    pub fn failure(id: impl Into<String>, error: RpcError) -> Self {
        RpcFunctionResult {
            id: id.into(),
            result: None,
            error: Some(error),
            expect: Vec::new(),
        }
    }

    pub fn is_error(&self) -> bool {
        self.error.is_some()
    }

    pub fn outcome(&self) -> Result<&JsonValue, &RpcError> {
        match (&self.result, &self.error) {
            (_, Some(error)) => Err(error),
            (Some(result), None) => Ok(result),
            (None, None) => Ok(&JsonValue::Null),
        }
    }
}

/// Settlement of an extracted reference, keyed by its scoped id
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RpcEvent {
    pub id: String,
    #[serde(default, deserialize_with = "present", skip_serializing_if = "Option::is_none")]
    pub result: Option<JsonValue>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<RpcError>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub expect: Vec<String>,
}

impl RpcEvent {
    pub fn success(id: impl Into<String>, result: JsonValue, expect: Vec<String>) -> Self {
        RpcEvent {
            id: id.into(),
            result: Some(result),
            error: None,
            expect,
        }
    }

    pub fn failure(id: impl Into<String>, error: RpcError) -> Self {
        RpcEvent {
            id: id.into(),
            result: None,
            error: Some(error),
            expect: Vec::new(),
        }
    }

    /// One produced sequence item
    pub fn item(id: impl Into<String>, value: JsonValue, expect: Vec<String>) -> Self {
        Self::success(
            id,
            serde_json::json!({ "value": value, "done": false }),
            expect,
        )
    }

    /// Terminal event of a sequence
    pub fn done(id: impl Into<String>) -> Self {
        Self::success(id, serde_json::json!({ "done": true }), Vec::new())
    }

    pub fn outcome(&self) -> Result<&JsonValue, &RpcError> {
        match (&self.result, &self.error) {
            (_, Some(error)) => Err(error),
            (Some(result), None) => Ok(result),
            (None, None) => Ok(&JsonValue::Null),
        }
    }
}
