// Fluent client over the capture harness.
//
// Property accesses keep capturing; calls and constructions are encoded by the
// session policy and dispatched on a tokio task. The caller gets a
// `RemoteValue` back straight away: a dual-mode placeholder for the result plus
// the branch to chain further calls from.

use crate::capture::{
    CaptureError, CaptureSession, CapturedOperation, InteractionSet, OperationKind, Outcome, Step,
};
use crate::encoder::{ChainEncoder, EncodeError, EncodedCall};
use chainwire_core::references::wire_config;
use chainwire_core::{
    Deferred, DeferredResolver, DualModeValue, ExtractorConfig, IdAllocator, PendingReferences,
    ReferenceProducer, RpcError, Transport, Value,
};
use futures::StreamExt;
use std::future::IntoFuture;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, warn};

/// Client configuration
#[derive(Debug, Clone)]
pub struct ClientConfig {
    /// Interactions the capture sessions trap
    pub interactions: InteractionSet,
    /// How arguments are searched for deferreds, sequences and functions
    pub extractor: ExtractorConfig,
    /// Give up on a call that has not been answered after this long
    pub call_timeout: Option<Duration>,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            interactions: InteractionSet::rpc(),
            extractor: wire_config(),
            call_timeout: Some(Duration::from_secs(30)),
        }
    }
}

#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum ClientError {
    #[error(transparent)]
    Capture(#[from] CaptureError),

    #[error(transparent)]
    Encode(#[from] EncodeError),

    #[error("{0} does not dispatch a call")]
    NotDispatched(OperationKind),
}

impl From<ClientError> for RpcError {
    fn from(err: ClientError) -> Self {
        RpcError::bad_request(err.to_string())
    }
}

type Encoded = Result<EncodedCall, EncodeError>;

/// Entry point: hands out independent chains over one transport
pub struct Client<T> {
    transport: Arc<T>,
    config: ClientConfig,
}

impl<T: Transport + 'static> Client<T> {
    pub fn new(transport: T) -> Self {
        Self::with_config(transport, ClientConfig::default())
    }

    pub fn with_config(transport: T, config: ClientConfig) -> Self {
        Client {
            transport: Arc::new(transport),
            config,
        }
    }

    pub fn config(&self) -> &ClientConfig {
        &self.config
    }

    /// A fresh chain on the remote root, with its own id namespace
    pub fn root(&self) -> Chain<T> {
        let ids = IdAllocator::new();
        let encoder = ChainEncoder::with_config(ids.namespace(), self.config.extractor.clone());
        let session = CaptureSession::with_allocator(
            ids,
            move |stack: &[CapturedOperation]| match stack.last().map(|op| op.kind) {
                Some(OperationKind::PropertyAccess) | None => Outcome::Continue,
                Some(_) => Outcome::Complete(encoder.encode(stack)),
            },
            self.config.interactions,
        );
        Chain {
            session,
            transport: self.transport.clone(),
            parent: None,
            timeout: self.config.call_timeout,
        }
    }

    /// Shortcut for `root().path(names)`
    pub fn path<I, S>(&self, names: I) -> Result<Chain<T>, ClientError>
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        self.root().path(names)
    }
}

impl<T> std::fmt::Debug for Client<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Client")
            .field("config", &self.config)
            .finish_non_exhaustive()
    }
}

/// One position in a call chain
pub struct Chain<T> {
    session: CaptureSession<Encoded>,
    transport: Arc<T>,
    /// Settles once the call this chain continues from has been answered
    parent: Option<Deferred>,
    timeout: Option<Duration>,
}

impl<T> Clone for Chain<T> {
    fn clone(&self) -> Self {
        Chain {
            session: self.session.clone(),
            transport: self.transport.clone(),
            parent: self.parent.clone(),
            timeout: self.timeout,
        }
    }
}

impl<T: Transport + 'static> Chain<T> {
    pub fn get(&self, name: &str) -> Result<Chain<T>, ClientError> {
        let step = self.session.get(name)?;
        Ok(self.advance(step.into_session()))
    }

    pub fn path<I, S>(&self, names: I) -> Result<Chain<T>, ClientError>
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        names
            .into_iter()
            .try_fold(self.clone(), |chain, name| chain.get(name.as_ref()))
    }

    /// Call the value at this position. Must run inside a tokio runtime.
    pub fn call(&self, args: Vec<Value>) -> Result<RemoteValue<T>, ClientError> {
        let step = self.session.call(args)?;
        self.dispatch(step, OperationKind::Call)
    }

    /// Construct the value at this position. Must run inside a tokio runtime.
    pub fn construct(&self, args: Vec<Value>) -> Result<RemoteValue<T>, ClientError> {
        let step = self.session.construct(args)?;
        self.dispatch(step, OperationKind::Construct)
    }

    pub fn stack(&self) -> Vec<CapturedOperation> {
        self.session.stack()
    }

    fn advance(&self, session: CaptureSession<Encoded>) -> Chain<T> {
        Chain {
            session,
            transport: self.transport.clone(),
            parent: self.parent.clone(),
            timeout: self.timeout,
        }
    }

    fn dispatch(
        &self,
        step: Step<Encoded>,
        kind: OperationKind,
    ) -> Result<RemoteValue<T>, ClientError> {
        let (encoded, session) = match step {
            Step::Complete(encoded, session) => (encoded?, session),
            Step::Continue(_) => return Err(ClientError::NotDispatched(kind)),
        };

        let id = encoded.call.id.clone();
        let value = DualModeValue::new();
        let (ack_resolver, ack) = Deferred::pending();
        tokio::spawn(run_call(
            self.transport.clone(),
            encoded,
            self.parent.clone(),
            value.clone(),
            ack_resolver,
            self.timeout,
        ));

        Ok(RemoteValue {
            id,
            value,
            chain: Chain {
                session,
                transport: self.transport.clone(),
                parent: Some(ack),
                timeout: self.timeout,
            },
        })
    }
}

impl<T> std::fmt::Debug for Chain<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Chain")
            .field("session", &self.session)
            .field("waits_for_parent", &self.parent.is_some())
            .finish()
    }
}

async fn run_call<T: Transport + 'static>(
    transport: Arc<T>,
    encoded: EncodedCall,
    parent: Option<Deferred>,
    value: DualModeValue,
    ack: DeferredResolver,
    timeout: Option<Duration>,
) {
    let EncodedCall { call, references } = encoded;
    let id = call.id.clone();

    // The interpreter only knows the parent's decoder once the parent answered.
    if let Some(parent) = parent {
        if let Err(err) = parent.wait().await {
            debug!(id = %id, error = %err, "parent call failed, not sending");
            let _ = value.give_neither(Some(err.clone()));
            ack.reject(err);
            return;
        }
    }

    let mut argument_events = ReferenceProducer::events(&id, &references);
    let events_transport = transport.clone();
    tokio::spawn(async move {
        while let Some(event) = argument_events.next().await {
            if let Err(err) = events_transport.event(event).await {
                warn!(error = %err, "failed to send argument event");
                break;
            }
        }
    });

    debug!(id = %id, method = ?call.method, chain = ?call.chain, "sending call");
    let sent = transport.call(call);
    let answered = match timeout {
        Some(limit) => tokio::time::timeout(limit, sent)
            .await
            .unwrap_or_else(|_| Err(RpcError::canceled(format!("no answer after {:?}", limit)))),
        None => sent.await,
    };
    let reply = match answered {
        Ok(reply) => reply,
        Err(err) => {
            warn!(id = %id, error = %err, "transport failed");
            let _ = value.give_neither(Some(err.clone()));
            ack.reject(err);
            return;
        }
    };

    let payload = match reply.result.outcome() {
        Ok(payload) => payload.clone(),
        Err(err) => {
            debug!(id = %id, error = %err, "call failed remotely");
            let _ = value.give_neither(Some(err.clone()));
            ack.reject(err.clone());
            return;
        }
    };

    let pending = Arc::new(PendingReferences::new());
    let result = match pending.resolve(&id, payload, &reply.result.expect) {
        Ok(result) => result,
        Err(err) => {
            let _ = value.give_neither(Some(err.clone()));
            ack.reject(err);
            return;
        }
    };

    if !pending.is_empty() {
        let mut events = reply.events;
        let owner = id.clone();
        tokio::spawn(async move {
            while let Some(event) = events.next().await {
                if let Err(err) = pending.deliver(event) {
                    warn!(id = %owner, error = %err, "dropping undeliverable event");
                }
            }
            if !pending.is_empty() {
                pending.fail_all(RpcError::canceled(format!(
                    "event stream for {} ended early",
                    owner
                )));
            }
        });
    }

    debug!(id = %id, kind = result.type_name(), "call answered");
    let _ = value.give(result);
    ack.resolve(Value::Null);
}

/// Result of a dispatched call
pub struct RemoteValue<T> {
    id: String,
    value: DualModeValue,
    chain: Chain<T>,
}

impl<T: Transport + 'static> RemoteValue<T> {
    /// Wire id of the call that produces this value
    pub fn id(&self) -> &str {
        &self.id
    }

    /// The placeholder the result is delivered into
    pub fn value(&self) -> &DualModeValue {
        &self.value
    }

    /// Chain position on the returned value
    pub fn chain(&self) -> &Chain<T> {
        &self.chain
    }

    pub fn get(&self, name: &str) -> Result<Chain<T>, ClientError> {
        self.chain.get(name)
    }

    /// Call the returned value itself
    pub fn call(&self, args: Vec<Value>) -> Result<RemoteValue<T>, ClientError> {
        self.chain.call(args)
    }

    pub async fn next(&self) -> Result<Option<Value>, RpcError> {
        self.value.next().await
    }
}

impl<T> IntoFuture for RemoteValue<T> {
    type Output = Result<Value, RpcError>;
    type IntoFuture = <DualModeValue as IntoFuture>::IntoFuture;

    fn into_future(self) -> Self::IntoFuture {
        self.value.into_future()
    }
}

impl<T> std::fmt::Debug for RemoteValue<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RemoteValue")
            .field("id", &self.id)
            .field("value", &self.value)
            .finish()
    }
}
