use crate::error::RpcError;
use crate::value::Value;
use futures::future::{BoxFuture, FutureExt, Shared};
use std::fmt;
use std::future::{Future, IntoFuture};
use std::sync::Arc;
use tokio::sync::oneshot;

type SharedResult = Shared<BoxFuture<'static, Result<Value, RpcError>>>;

/// A value that settles later to success or failure.
///
/// Cloning a `Deferred` shares the same settlement; any number of holders may
/// await it.
#[derive(Clone)]
pub struct Deferred {
    inner: Arc<SharedResult>,
}

impl Deferred {
    pub fn from_future<F>(future: F) -> Self
    where
        F: Future<Output = Result<Value, RpcError>> + Send + 'static,
    {
        Deferred {
            inner: Arc::new(future.boxed().shared()),
        }
    }

    pub fn resolved(value: Value) -> Self {
        Self::from_future(futures::future::ready(Ok(value)))
    }

    pub fn rejected(error: RpcError) -> Self {
        Self::from_future(futures::future::ready(Err(error)))
    }

    /// Unsettled deferred plus the handle that settles it
    pub fn pending() -> (DeferredResolver, Deferred) {
        let (tx, rx) = oneshot::channel();
        let deferred = Self::from_future(async move {
            match rx.await {
                Ok(result) => result,
                Err(_) => Err(RpcError::canceled(
                    "deferred value was dropped before it settled",
                )),
            }
        });
        (DeferredResolver { tx: Some(tx) }, deferred)
    }

    pub fn identity(&self) -> usize {
        Arc::as_ptr(&self.inner) as *const () as usize
    }

    /// Settled outcome, if the deferred has already been driven to completion
    pub fn peek(&self) -> Option<Result<Value, RpcError>> {
        self.inner.peek().cloned()
    }

    pub async fn wait(&self) -> Result<Value, RpcError> {
        (*self.inner).clone().await
    }

    pub fn then<F>(&self, on_success: F) -> Deferred
    where
        F: FnOnce(Value) -> Result<Value, RpcError> + Send + 'static,
    {
        let source = (*self.inner).clone();
        Deferred::from_future(async move { on_success(source.await?) })
    }

    pub fn catch<F>(&self, on_failure: F) -> Deferred
    where
        F: FnOnce(RpcError) -> Result<Value, RpcError> + Send + 'static,
    {
        let source = (*self.inner).clone();
        Deferred::from_future(async move {
            match source.await {
                Ok(value) => Ok(value),
                Err(err) => on_failure(err),
            }
        })
    }

    pub fn finally<F>(&self, on_settled: F) -> Deferred
    where
        F: FnOnce() + Send + 'static,
    {
        let source = (*self.inner).clone();
        Deferred::from_future(async move {
            let result = source.await;
            on_settled();
            result
        })
    }
}

impl IntoFuture for Deferred {
    type Output = Result<Value, RpcError>;
    type IntoFuture = SharedResult;

    fn into_future(self) -> Self::IntoFuture {
        (*self.inner).clone()
    }
}

impl fmt::Debug for Deferred {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Deferred")
            .field("settled", &self.inner.peek().is_some())
            .finish()
    }
}

/// Settles the matching [`Deferred`]. Dropping it unsettled cancels the deferred.
#[derive(Debug)]
pub struct DeferredResolver {
    tx: Option<oneshot::Sender<Result<Value, RpcError>>>,
}

impl DeferredResolver {
    pub fn resolve(self, value: Value) {
        self.settle(Ok(value))
    }

    pub fn reject(self, error: RpcError) {
        self.settle(Err(error))
    }

    pub fn settle(mut self, result: Result<Value, RpcError>) {
        if let Some(tx) = self.tx.take() {
            // The deferred may already be gone; nobody is left to tell.
            let _ = tx.send(result);
        }
    }

    pub fn is_closed(&self) -> bool {
        self.tx.as_ref().map_or(true, |tx| tx.is_closed())
    }
}
