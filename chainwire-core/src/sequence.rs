use crate::error::RpcError;
use crate::value::Value;
use futures::stream::{self, BoxStream, Stream, StreamExt};
use std::fmt;
use std::sync::Arc;
use tokio::sync::{mpsc, Mutex};

enum SequenceState {
    Open(BoxStream<'static, Result<Value, RpcError>>),
    Closed,
}

/// Single-pass asynchronous lazy sequence.
///
/// Clones share the same cursor: every item is handed out exactly once, to
/// whichever `next()` acquires the cursor first. Sync sources are lifted into
/// the async form on construction.
#[derive(Clone)]
pub struct Sequence {
    inner: Arc<Mutex<SequenceState>>,
}

impl Sequence {
    pub fn from_stream<S>(source: S) -> Self
    where
        S: Stream<Item = Result<Value, RpcError>> + Send + 'static,
    {
        Sequence {
            inner: Arc::new(Mutex::new(SequenceState::Open(source.boxed()))),
        }
    }

    pub fn from_values<I>(values: I) -> Self
    where
        I: IntoIterator<Item = Value>,
        I::IntoIter: Send + 'static,
    {
        Self::from_stream(stream::iter(values.into_iter().map(Ok)))
    }

    /// Sequence fed from the returned sender; it ends when the sender is dropped.
    pub fn channel() -> (SequenceSender, Sequence) {
        let (tx, mut rx) = mpsc::unbounded_channel();
        let source = stream::poll_fn(move |cx| rx.poll_recv(cx));
        (SequenceSender { tx }, Self::from_stream(source))
    }

    pub fn identity(&self) -> usize {
        Arc::as_ptr(&self.inner) as *const () as usize
    }

    /// Pull the next item; `Ok(None)` once exhausted. An error closes the sequence.
    pub async fn next(&self) -> Result<Option<Value>, RpcError> {
        let mut state = self.inner.lock().await;
        let item = match &mut *state {
            SequenceState::Open(source) => source.next().await,
            SequenceState::Closed => return Ok(None),
        };
        match item {
            Some(Ok(value)) => Ok(Some(value)),
            Some(Err(err)) => {
                *state = SequenceState::Closed;
                Err(err)
            }
            None => {
                *state = SequenceState::Closed;
                Ok(None)
            }
        }
    }

    /// Early return: closes the sequence and hands back `value`.
    pub async fn finish(&self, value: Option<Value>) -> Result<Option<Value>, RpcError> {
        *self.inner.lock().await = SequenceState::Closed;
        Ok(value)
    }

    /// Throw into the sequence: closes it and fails with `error`.
    pub async fn throw(&self, error: RpcError) -> Result<Option<Value>, RpcError> {
        *self.inner.lock().await = SequenceState::Closed;
        Err(error)
    }

    pub async fn is_closed(&self) -> bool {
        matches!(*self.inner.lock().await, SequenceState::Closed)
    }

    pub fn into_stream(self) -> BoxStream<'static, Result<Value, RpcError>> {
        stream::unfold(Some(self), |sequence| async move {
            let sequence = sequence?;
            match sequence.next().await {
                Ok(Some(value)) => Some((Ok(value), Some(sequence))),
                Ok(None) => None,
                Err(err) => Some((Err(err), None)),
            }
        })
        .boxed()
    }
}

impl fmt::Debug for Sequence {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Sequence")
            .field("identity", &self.identity())
            .finish()
    }
}

/// Producer half of [`Sequence::channel`]
#[derive(Debug, Clone)]
pub struct SequenceSender {
    tx: mpsc::UnboundedSender<Result<Value, RpcError>>,
}

impl SequenceSender {
    /// Returns false once the sequence has been dropped.
    pub fn push(&self, value: Value) -> bool {
        self.tx.send(Ok(value)).is_ok()
    }

    pub fn fail(&self, error: RpcError) -> bool {
        self.tx.send(Err(error)).is_ok()
    }

    pub fn is_closed(&self) -> bool {
        self.tx.is_closed()
    }
}
