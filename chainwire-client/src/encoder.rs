use crate::capture::{CapturedOperation, OperationKind};
use chainwire_core::references::{expect_ids, wire_config, wire_extractor_with};
use chainwire_core::{
    ExtractError, Extracted, ExtractorConfig, RpcError, RpcFunctionCall, Value, ValueError,
};
use tracing::debug;

#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum EncodeError {
    #[error("nothing has been captured")]
    Empty,

    #[error("{0} cannot be expressed as an RPC call")]
    Unsupported(OperationKind),

    #[error("argument extraction failed: {0}")]
    Extract(#[from] ExtractError),

    #[error("arguments are not plain data: {0}")]
    Value(#[from] ValueError),
}

impl From<EncodeError> for RpcError {
    fn from(err: EncodeError) -> Self {
        RpcError::bad_request(err.to_string())
    }
}

/// A call ready for the transport plus the references pulled out of its
/// arguments, which still have to be streamed as events.
#[derive(Debug, Clone)]
pub struct EncodedCall {
    pub call: RpcFunctionCall,
    pub references: Extracted,
}

/// Turns the tail of a capture stack into an [`RpcFunctionCall`].
///
/// Wire ids are `<namespace>:<operation id>`; the namespace must be the one of
/// the allocator that produced the operation ids.
#[derive(Debug, Clone)]
pub struct ChainEncoder {
    namespace: String,
    config: ExtractorConfig,
}

impl ChainEncoder {
    pub fn new(namespace: impl Into<String>) -> Self {
        Self::with_config(namespace, wire_config())
    }

    /// Back references cannot be settled by events, so cyclic and reuse
    /// tracking are always off for arguments.
    pub fn with_config(namespace: impl Into<String>, config: ExtractorConfig) -> Self {
        ChainEncoder {
            namespace: namespace.into(),
            config: ExtractorConfig {
                cyclic: false,
                reuse: false,
                ..config
            },
        }
    }

    pub fn wire_id(&self, op: &CapturedOperation) -> String {
        format!("{}:{}", self.namespace, op.id.as_u64())
    }

    pub fn encode(&self, stack: &[CapturedOperation]) -> Result<EncodedCall, EncodeError> {
        let op = stack.last().ok_or(EncodeError::Empty)?;
        if !op.kind.is_invocation() {
            return Err(EncodeError::Unsupported(op.kind));
        }

        let args = Value::array(op.args.iter().cloned());
        let references = wire_extractor_with(self.config.clone()).extract(&args)?;
        let args = match references.replaced.to_json()? {
            serde_json::Value::Array(items) => items,
            other => vec![other],
        };

        let mut call = RpcFunctionCall::new(self.wire_id(op), op.path.clone(), args)
            .expecting(expect_ids(&references));
        if let Some(parent) = op.chain_parent {
            call = call.chained_from(format!("{}:{}", self.namespace, parent.as_u64()));
        }
        if op.kind == OperationKind::Construct {
            call = call.construct();
        }

        debug!(
            id = %call.id,
            method = ?call.method,
            chain = ?call.chain,
            construct = call.is_construct,
            references = references.references.len(),
            "encoded call"
        );
        Ok(EncodedCall { call, references })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::capture::{CaptureSession, InteractionSet, Outcome, Step};
    use chainwire_core::{Deferred, Function, IdAllocator};
    use serde_json::json;

    fn session() -> (CaptureSession<Result<EncodedCall, EncodeError>>, ChainEncoder) {
        let ids = IdAllocator::with_namespace("t");
        let encoder = ChainEncoder::new(ids.namespace());
        let policy_encoder = encoder.clone();
        let session = CaptureSession::with_allocator(
            ids,
            move |stack: &[CapturedOperation]| match stack.last().map(|op| op.kind) {
                Some(OperationKind::PropertyAccess) => Outcome::Continue,
                _ => Outcome::Complete(policy_encoder.encode(stack)),
            },
            InteractionSet::all(),
        );
        (session, encoder)
    }

    #[test]
    fn test_encode_simple_call() {
        let (root, _) = session();
        let add = root.get("add").unwrap().into_session();
        let encoded = add
            .call(vec![Value::from(2), Value::from(3)])
            .unwrap()
            .completed()
            .unwrap()
            .unwrap();
        assert_eq!(
            serde_json::to_value(&encoded.call).unwrap(),
            json!({"id": "t:2", "method": ["add"], "args": [2, 3]})
        );
        assert!(encoded.references.is_plain());
    }

    #[test]
    fn test_encode_chained_construct() {
        let (root, _) = session();
        let first = match root.get("make").unwrap().into_session().call(Vec::new()).unwrap() {
            Step::Complete(_, session) => session,
            Step::Continue(_) => panic!("call should complete"),
        };
        let encoded = first
            .get("Widget")
            .unwrap()
            .into_session()
            .construct(vec![Value::from("blue")])
            .unwrap()
            .completed()
            .unwrap()
            .unwrap();
        assert_eq!(encoded.call.chain.as_deref(), Some("t:2"));
        assert!(encoded.call.is_construct);
        assert_eq!(encoded.call.method, vec!["Widget"]);
    }

    #[test]
    fn test_non_plain_arguments_become_references() {
        let (root, _) = session();
        let callback = Function::new("cb", |_| Ok(Value::Null));
        let encoded = root
            .call(vec![
                Value::Deferred(Deferred::resolved(Value::from(1))),
                Value::object([("cb", Value::from(callback))]),
            ])
            .unwrap()
            .completed()
            .unwrap()
            .unwrap();
        assert_eq!(encoded.call.args, vec![json!("p-0"), json!({"cb": "f-1.cb"})]);
        assert_eq!(encoded.call.expect, vec!["p-0"]);
    }

    #[test]
    fn test_unsupported_operations() {
        let (root, encoder) = session();
        let assigned = root.assign("x", Value::Null).unwrap().completed().unwrap();
        assert_eq!(
            assigned.unwrap_err(),
            EncodeError::Unsupported(OperationKind::Assign)
        );

        let dangling = root.get("x").unwrap().into_session().stack();
        assert_eq!(
            encoder.encode(&dangling).unwrap_err(),
            EncodeError::Unsupported(OperationKind::PropertyAccess)
        );
        assert_eq!(encoder.encode(&[]).unwrap_err(), EncodeError::Empty);
    }

    #[test]
    fn test_cyclic_arguments_are_rejected() {
        let (root, _) = session();
        let looped = Value::empty_object();
        looped.set("me", looped.clone()).unwrap();
        let result = root.call(vec![looped]).unwrap().completed().unwrap();
        assert!(matches!(result, Err(EncodeError::Extract(ExtractError::Cycle { .. }))));
    }
}
