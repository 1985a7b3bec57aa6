use crate::allow_list::AllowList;
use crate::interpreter::Interpreter;
use chainwire_core::references::{wire_config, wire_extractor_with, DEFAULT_MAX_EARLY_EVENTS};
use chainwire_core::{
    expect_ids, ExtractorConfig, PendingReferences, ReferenceProducer, Reply, RpcError, RpcEvent,
    RpcFunctionCall, RpcFunctionResult, Value,
};
use dashmap::DashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use tracing::{debug, trace, warn};

/// Session configuration
#[derive(Debug, Clone)]
pub struct SessionConfig {
    /// How results are searched for deferreds, sequences and functions
    pub extractor: ExtractorConfig,
    /// Property names callable on an allowed function
    pub methods_on_methods: Vec<String>,
    /// Decoders kept for chained calls before the oldest is evicted; `0`
    /// keeps none, so no call can be chained
    pub max_decoders: usize,
    /// Argument events held for calls that have not arrived yet
    pub max_early_events: usize,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            extractor: wire_config(),
            methods_on_methods: Vec::new(),
            max_decoders: 1024,
            max_early_events: DEFAULT_MAX_EARLY_EVENTS,
        }
    }
}

/// Server side of one connection.
///
/// Turns incoming calls into replies, keeps the decoders later calls may be
/// chained from and collects argument events.
pub struct Session {
    root: Interpreter,
    decoders: DashMap<String, (u64, Interpreter)>,
    counter: AtomicU64,
    arguments: PendingReferences,
    config: SessionConfig,
}

impl Session {
    pub fn new(target: Option<Value>, allow_list: AllowList, config: SessionConfig) -> Self {
        let root = Interpreter::new(target, allow_list, config.methods_on_methods.clone());
        Session {
            root,
            decoders: DashMap::new(),
            counter: AtomicU64::new(0),
            arguments: PendingReferences::with_limit(config.max_early_events),
            config,
        }
    }

    pub fn config(&self) -> &SessionConfig {
        &self.config
    }

    /// Interpret one call. Every failure is reported inside the reply.
    pub fn handle(&self, call: RpcFunctionCall) -> Reply {
        let id = call.id.clone();
        match self.interpret(&call) {
            Ok(reply) => reply,
            Err(err) => {
                debug!(id = %id, error = %err, "call failed");
                Reply::immediate(RpcFunctionResult::failure(id, err))
            }
        }
    }

    fn interpret(&self, call: &RpcFunctionCall) -> Result<Reply, RpcError> {
        let interpreter = match &call.chain {
            Some(parent) => self
                .decoders
                .get(parent)
                .map(|entry| entry.value().1.clone())
                // the root rejects chained calls with the proper error
                .unwrap_or_else(|| self.root.clone()),
            None => self.root.clone(),
        };

        let args = self.arguments.resolve(
            &call.id,
            serde_json::Value::Array(call.args.clone()),
            &call.expect,
        )?;
        let args = args.entries().into_iter().map(|(_, arg)| arg).collect();

        let outcome = interpreter.call_with_args(call, args)?;
        let value = outcome.result?;
        self.store_decoder(&call.id, outcome.decoder);

        let extracted = wire_extractor_with(self.config.extractor.clone()).extract(&value)?;
        let json = extracted.replaced.to_json()?;
        let expect = expect_ids(&extracted);
        trace!(
            id = %call.id,
            kind = value.type_name(),
            references = expect.len(),
            "call succeeded"
        );
        Ok(Reply::new(
            RpcFunctionResult::success(call.id.clone(), json, expect),
            ReferenceProducer::events(&call.id, &extracted),
        ))
    }

    fn store_decoder(&self, id: &str, decoder: Interpreter) {
        if self.config.max_decoders == 0 {
            return;
        }
        let order = self.counter.fetch_add(1, Ordering::Relaxed);
        self.decoders.insert(id.to_string(), (order, decoder));

        while self.decoders.len() > self.config.max_decoders {
            let oldest = self
                .decoders
                .iter()
                .min_by_key(|entry| entry.value().0)
                .map(|entry| entry.key().clone());
            match oldest {
                Some(key) => {
                    trace!(id = %key, "evicting decoder");
                    self.decoders.remove(&key);
                }
                None => break,
            }
        }
    }

    /// Feed an event for a reference passed as an argument.
    pub fn deliver(&self, event: RpcEvent) -> Result<(), RpcError> {
        self.arguments.deliver(event)
    }

    /// Forget the decoder of call `id`; later calls chained from it fail.
    pub fn release(&self, id: &str) -> bool {
        self.decoders.remove(id).is_some()
    }

    pub fn decoder_count(&self) -> usize {
        self.decoders.len()
    }

    /// Argument events waiting for their call
    pub fn held_events(&self) -> usize {
        self.arguments.early_len()
    }

    /// Drop all decoders and reject argument references still waiting for events.
    pub fn close(&self) {
        let decoders = self.decoders.len();
        self.decoders.clear();
        if !self.arguments.is_empty() {
            warn!(pending = self.arguments.len(), "closing session with pending arguments");
        }
        self.arguments.fail_all(RpcError::canceled("session closed"));
        debug!(decoders, "session closed");
    }
}

impl std::fmt::Debug for Session {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Session")
            .field("root", &self.root)
            .field("decoders", &self.decoders.len())
            .field("arguments", &self.arguments)
            .field("config", &self.config)
            .finish()
    }
}
