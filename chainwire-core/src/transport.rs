use crate::error::RpcError;
use crate::message::{RpcEvent, RpcFunctionCall, RpcFunctionResult};
use async_trait::async_trait;
use futures::stream::{self, BoxStream, StreamExt};
use std::fmt;

/// Answer to one call: the result message plus the events for every
/// reference it listed in `expect`.
pub struct Reply {
    pub result: RpcFunctionResult,
    pub events: BoxStream<'static, RpcEvent>,
}

impl Reply {
    pub fn new(result: RpcFunctionResult, events: BoxStream<'static, RpcEvent>) -> Self {
        Reply { result, events }
    }

    /// Reply that carries no reference events
    pub fn immediate(result: RpcFunctionResult) -> Self {
        Reply {
            result,
            events: stream::empty().boxed(),
        }
    }
}

impl fmt::Debug for Reply {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Reply")
            .field("result", &self.result)
            .finish_non_exhaustive()
    }
}

/// Seam to whatever carries calls to an interpreter.
///
/// Framing, batching, serialization and retries belong to implementations.
/// An `Err` means the call never produced a result (connection lost, timeout);
/// failures of the called function arrive as `Ok` with `result.error` set.
#[async_trait]
pub trait Transport: Send + Sync {
    async fn call(&self, call: RpcFunctionCall) -> Result<Reply, RpcError>;

    /// Settlement of a reference that was passed as a call argument
    async fn event(&self, event: RpcEvent) -> Result<(), RpcError>;
}

#[async_trait]
impl<T: Transport + ?Sized> Transport for std::sync::Arc<T> {
    async fn call(&self, call: RpcFunctionCall) -> Result<Reply, RpcError> {
        (**self).call(call).await
    }

    async fn event(&self, event: RpcEvent) -> Result<(), RpcError> {
        (**self).event(event).await
    }
}
