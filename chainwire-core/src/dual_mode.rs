// Placeholder for a result whose nature (single value or sequence) is not known
// yet. Operations of either kind may be invoked before resolution; each one is
// queued on its own branch and answered once the nature is given.

use crate::deferred::Deferred;
use crate::error::RpcError;
use crate::sequence::Sequence;
use crate::value::Value;
use futures::future::{BoxFuture, FutureExt};
use futures::stream::{self, BoxStream, StreamExt};
use parking_lot::Mutex;
use std::fmt;
use std::future::IntoFuture;
use std::sync::Arc;
use tokio::sync::oneshot;
use tracing::trace;

#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum DeferredError {
    #[error("value already given")]
    AlreadyGiven,

    #[error("given was not a sequence")]
    NotASequence,

    #[error("given was not a deferred result")]
    NotADeferredResult,

    #[error("neither a deferred result nor a sequence was given")]
    NeitherGiven,
}

impl From<DeferredError> for RpcError {
    fn from(err: DeferredError) -> Self {
        RpcError::conflict(err.to_string())
    }
}

/// Observable state of a [`DualModeValue`]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DualModeState {
    Unresolved,
    Single,
    Sequence,
    Neither,
}

type DeferredWaiter = oneshot::Sender<Result<Deferred, RpcError>>;
type SequenceWaiter = oneshot::Sender<Result<Sequence, RpcError>>;

enum DualState {
    Unresolved {
        deferred_waiters: Vec<DeferredWaiter>,
        sequence_waiters: Vec<SequenceWaiter>,
    },
    Single(Deferred),
    Sequence(Sequence),
    Neither(RpcError),
}

#[derive(Clone)]
pub struct DualModeValue {
    state: Arc<Mutex<DualState>>,
}

impl DualModeValue {
    pub fn new() -> Self {
        DualModeValue {
            state: Arc::new(Mutex::new(DualState::Unresolved {
                deferred_waiters: Vec::new(),
                sequence_waiters: Vec::new(),
            })),
        }
    }

    pub fn state(&self) -> DualModeState {
        match &*self.state.lock() {
            DualState::Unresolved { .. } => DualModeState::Unresolved,
            DualState::Single(_) => DualModeState::Single,
            DualState::Sequence(_) => DualModeState::Sequence,
            DualState::Neither(_) => DualModeState::Neither,
        }
    }

    fn take_waiters(
        &self,
        resolved: DualState,
    ) -> Result<(Vec<DeferredWaiter>, Vec<SequenceWaiter>), DeferredError> {
        let mut state = self.state.lock();
        if !matches!(*state, DualState::Unresolved { .. }) {
            return Err(DeferredError::AlreadyGiven);
        }
        match std::mem::replace(&mut *state, resolved) {
            DualState::Unresolved {
                deferred_waiters,
                sequence_waiters,
            } => Ok((deferred_waiters, sequence_waiters)),
            _ => Ok((Vec::new(), Vec::new())),
        }
    }

    /// Resolve as a single result. A `Value::Deferred` is forwarded as-is.
    pub fn give_single(&self, value: Value) -> Result<(), DeferredError> {
        let deferred = match value {
            Value::Deferred(deferred) => deferred,
            other => Deferred::resolved(other),
        };
        let (deferred_waiters, sequence_waiters) =
            self.take_waiters(DualState::Single(deferred.clone()))?;
        trace!(
            queued_deferred = deferred_waiters.len(),
            queued_sequence = sequence_waiters.len(),
            "dual-mode value resolved as single"
        );
        for waiter in deferred_waiters {
            let _ = waiter.send(Ok(deferred.clone()));
        }
        for waiter in sequence_waiters {
            let _ = waiter.send(Err(DeferredError::NotASequence.into()));
        }
        Ok(())
    }

    pub fn give_sequence(&self, sequence: Sequence) -> Result<(), DeferredError> {
        let (deferred_waiters, sequence_waiters) =
            self.take_waiters(DualState::Sequence(sequence.clone()))?;
        trace!(
            queued_deferred = deferred_waiters.len(),
            queued_sequence = sequence_waiters.len(),
            "dual-mode value resolved as sequence"
        );
        for waiter in sequence_waiters {
            let _ = waiter.send(Ok(sequence.clone()));
        }
        for waiter in deferred_waiters {
            let _ = waiter.send(Err(DeferredError::NotADeferredResult.into()));
        }
        Ok(())
    }

    /// Resolve as a sequence from a synchronous source.
    pub fn give_iter<I>(&self, values: I) -> Result<(), DeferredError>
    where
        I: IntoIterator<Item = Value>,
        I::IntoIter: Send + 'static,
    {
        self.give_sequence(Sequence::from_values(values))
    }

    /// Reject both branches with `error`, or with `NeitherGiven` when absent.
    pub fn give_neither(&self, error: Option<RpcError>) -> Result<(), DeferredError> {
        let error = error.unwrap_or_else(|| DeferredError::NeitherGiven.into());
        let (deferred_waiters, sequence_waiters) =
            self.take_waiters(DualState::Neither(error.clone()))?;
        trace!(error = %error, "dual-mode value resolved as neither");
        for waiter in deferred_waiters {
            let _ = waiter.send(Err(error.clone()));
        }
        for waiter in sequence_waiters {
            let _ = waiter.send(Err(error.clone()));
        }
        Ok(())
    }

    /// Resolve by the nature of `value` itself: sequences become the sequence
    /// branch, everything else the single branch.
    pub fn give(&self, value: Value) -> Result<(), DeferredError> {
        match value {
            Value::Sequence(sequence) => self.give_sequence(sequence),
            other => self.give_single(other),
        }
    }

    /// Deferred-result view. Registers immediately, settles on resolution.
    pub fn wait(&self) -> Deferred {
        let mut state = self.state.lock();
        match &mut *state {
            DualState::Unresolved {
                deferred_waiters, ..
            } => {
                let (tx, rx) = oneshot::channel();
                deferred_waiters.push(tx);
                Deferred::from_future(async move {
                    match rx.await {
                        Ok(Ok(deferred)) => deferred.wait().await,
                        Ok(Err(err)) => Err(err),
                        Err(_) => Err(RpcError::canceled("dual-mode value was dropped")),
                    }
                })
            }
            DualState::Single(deferred) => deferred.clone(),
            DualState::Sequence(_) => Deferred::rejected(DeferredError::NotADeferredResult.into()),
            DualState::Neither(err) => Deferred::rejected(err.clone()),
        }
    }

    pub fn then<F>(&self, on_success: F) -> Deferred
    where
        F: FnOnce(Value) -> Result<Value, RpcError> + Send + 'static,
    {
        self.wait().then(on_success)
    }

    pub fn catch<F>(&self, on_failure: F) -> Deferred
    where
        F: FnOnce(RpcError) -> Result<Value, RpcError> + Send + 'static,
    {
        self.wait().catch(on_failure)
    }

    pub fn finally<F>(&self, on_settled: F) -> Deferred
    where
        F: FnOnce() + Send + 'static,
    {
        self.wait().finally(on_settled)
    }

    fn sequence_handle(&self) -> BoxFuture<'static, Result<Sequence, RpcError>> {
        let mut state = self.state.lock();
        match &mut *state {
            DualState::Unresolved {
                sequence_waiters, ..
            } => {
                let (tx, rx) = oneshot::channel();
                sequence_waiters.push(tx);
                async move {
                    match rx.await {
                        Ok(result) => result,
                        Err(_) => Err(RpcError::canceled("dual-mode value was dropped")),
                    }
                }
                .boxed()
            }
            DualState::Sequence(sequence) => futures::future::ready(Ok(sequence.clone())).boxed(),
            DualState::Single(_) => {
                futures::future::ready(Err(DeferredError::NotASequence.into())).boxed()
            }
            DualState::Neither(err) => futures::future::ready(Err(err.clone())).boxed(),
        }
    }

    /// Sequence view: pull one item, `Ok(None)` when exhausted.
    pub fn next(&self) -> BoxFuture<'static, Result<Option<Value>, RpcError>> {
        let handle = self.sequence_handle();
        async move { handle.await?.next().await }.boxed()
    }

    /// Sequence view: early return.
    pub fn finish(
        &self,
        value: Option<Value>,
    ) -> BoxFuture<'static, Result<Option<Value>, RpcError>> {
        let handle = self.sequence_handle();
        async move { handle.await?.finish(value).await }.boxed()
    }

    /// Sequence view: throw into the sequence.
    pub fn throw(&self, error: RpcError) -> BoxFuture<'static, Result<Option<Value>, RpcError>> {
        let handle = self.sequence_handle();
        async move { handle.await?.throw(error).await }.boxed()
    }

    pub fn into_stream(self) -> BoxStream<'static, Result<Value, RpcError>> {
        let handle = self.sequence_handle();
        stream::once(handle)
            .flat_map(|result| match result {
                Ok(sequence) => sequence.into_stream(),
                Err(err) => stream::once(futures::future::ready(Err(err))).boxed(),
            })
            .boxed()
    }
}

impl Default for DualModeValue {
    fn default() -> Self {
        Self::new()
    }
}

impl IntoFuture for DualModeValue {
    type Output = Result<Value, RpcError>;
    type IntoFuture = <Deferred as IntoFuture>::IntoFuture;

    fn into_future(self) -> Self::IntoFuture {
        self.wait().into_future()
    }
}

impl fmt::Debug for DualModeValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DualModeValue")
            .field("state", &self.state())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ErrorCode;
    use futures::StreamExt;

    #[tokio::test]
    async fn test_single_resolves_queued_waits() {
        let value = DualModeValue::new();
        let early = value.wait();
        let mapped = value.then(|v| Ok(Value::from(v.as_i64().unwrap_or(0) + 1)));

        value.give_single(Value::from(41)).unwrap();
        assert_eq!(value.state(), DualModeState::Single);
        assert_eq!(early.await.unwrap(), Value::from(41));
        assert_eq!(mapped.await.unwrap(), Value::from(42));
        assert_eq!(value.await.unwrap(), Value::from(41));
    }

    #[tokio::test]
    async fn test_single_rejects_queued_sequence_ops() {
        let value = DualModeValue::new();
        let pending_next = value.next();
        let pending_finish = value.finish(None);

        value.give_single(Value::from("plain")).unwrap();
        let err = pending_next.await.unwrap_err();
        assert_eq!(err.code, ErrorCode::Conflict);
        assert_eq!(err.message, "given was not a sequence");
        assert!(pending_finish.await.is_err());
        assert!(value.next().await.is_err());
    }

    #[tokio::test]
    async fn test_sequence_rejects_queued_deferred_ops() {
        let value = DualModeValue::new();
        let pending_wait = value.wait();

        value.give_iter(vec![Value::from(1)]).unwrap();
        let err = pending_wait.await.unwrap_err();
        assert_eq!(err.message, "given was not a deferred result");
        assert!(value.wait().await.is_err());
    }

    #[tokio::test]
    async fn test_queued_nexts_are_served_as_produced() {
        let value = DualModeValue::new();
        let first = value.next();
        let second = value.next();
        let third = value.next();

        value
            .give_iter(vec![Value::from("a"), Value::from("b")])
            .unwrap();

        let mut results = vec![
            first.await.unwrap(),
            second.await.unwrap(),
            third.await.unwrap(),
        ];
        results.sort_by_key(|item| item.is_none());
        assert_eq!(
            results,
            vec![Some(Value::from("a")), Some(Value::from("b")), None]
        );
    }

    #[tokio::test]
    async fn test_forwarded_deferred_settles_later() {
        let (resolver, deferred) = Deferred::pending();
        let value = DualModeValue::new();
        let waiting = value.wait();

        value.give_single(Value::Deferred(deferred)).unwrap();
        resolver.reject(RpcError::remote("remote failure"));
        assert_eq!(waiting.await.unwrap_err().code, ErrorCode::Remote);
    }

    #[tokio::test]
    async fn test_neither_rejects_both_branches() {
        let value = DualModeValue::new();
        let waiting = value.wait();
        let pulling = value.next();

        value.give_neither(None).unwrap();
        assert_eq!(
            waiting.await.unwrap_err().message,
            "neither a deferred result nor a sequence was given"
        );
        assert!(pulling.await.is_err());

        let custom = DualModeValue::new();
        custom
            .give_neither(Some(RpcError::canceled("timed out")))
            .unwrap();
        assert_eq!(custom.wait().await.unwrap_err().code, ErrorCode::Canceled);
    }

    #[tokio::test]
    async fn test_second_give_fails() {
        let value = DualModeValue::new();
        value.give_single(Value::Null).unwrap();
        assert_eq!(
            value.give_iter(Vec::new()),
            Err(DeferredError::AlreadyGiven)
        );
        assert_eq!(value.give_neither(None), Err(DeferredError::AlreadyGiven));
    }

    #[tokio::test]
    async fn test_give_dispatches_on_nature() {
        let value = DualModeValue::new();
        value
            .give(Value::Sequence(Sequence::from_values(vec![Value::from(7)])))
            .unwrap();
        assert_eq!(value.state(), DualModeState::Sequence);
        let items: Vec<_> = value.into_stream().collect().await;
        assert_eq!(items.len(), 1);
    }
}
