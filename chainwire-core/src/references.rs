// Streaming of extracted references.
//
// The sending side turns every extracted deferred (`p`) and sequence (`i`)
// into `RpcEvent`s as they settle; the receiving side holds placeholders for
// the ids it was told to expect and settles them as events arrive. Payloads
// are extracted again before they are sent, so references nest: a nested
// reference is owned by the event that carried it.

use crate::deferred::{Deferred, DeferredResolver};
use crate::error::RpcError;
use crate::extract::{parse_reference_id, Depth, Extracted, Extractor, ExtractorConfig};
use crate::ids::scoped_reference;
use crate::message::RpcEvent;
use crate::sequence::{Sequence, SequenceSender};
use crate::value::Value;
use futures::stream::{self, BoxStream, FusedStream, SelectAll, StreamExt};
use indexmap::{IndexMap, IndexSet};
use parking_lot::Mutex;
use std::collections::HashMap;
use std::task::Poll;
use tracing::{debug, trace, warn};

pub const DEFERRED_PREFIX: char = 'p';
pub const SEQUENCE_PREFIX: char = 'i';
pub const FUNCTION_PREFIX: char = 'f';

/// Extractor config used for everything that goes on the wire
pub fn wire_config() -> ExtractorConfig {
    ExtractorConfig {
        depth: Depth::Unbounded,
        recurse_arrays: true,
        cyclic: false,
        reuse: false,
    }
}

/// Extractor with the default `p`/`i`/`f` matchers registered
pub fn wire_extractor() -> Extractor {
    wire_extractor_with(wire_config())
}

pub fn wire_extractor_with(config: ExtractorConfig) -> Extractor {
    let mut extractor = Extractor::new(config);
    let matchers: [(char, fn(&Value) -> bool); 3] = [
        (DEFERRED_PREFIX, |v| matches!(v, Value::Deferred(_))),
        (SEQUENCE_PREFIX, |v| matches!(v, Value::Sequence(_))),
        (FUNCTION_PREFIX, |v| matches!(v, Value::Function(_))),
    ];
    for (prefix, matcher) in matchers {
        // fresh extractor, none of these can collide
        let _ = extractor.support(prefix, matcher);
    }
    extractor
}

fn produces_events(id: &str) -> bool {
    id.starts_with(DEFERRED_PREFIX) || id.starts_with(SEQUENCE_PREFIX)
}

/// Reference ids that will be followed by events
pub fn expect_ids(extracted: &Extracted) -> Vec<String> {
    extracted
        .references
        .keys()
        .filter(|id| produces_events(id))
        .cloned()
        .collect()
}

/// Extract a payload with the wire matchers and convert it to JSON.
pub fn to_wire(value: &Value) -> Result<(serde_json::Value, Extracted), RpcError> {
    let extracted = wire_extractor().extract(value)?;
    let json = extracted.replaced.to_json()?;
    Ok((json, extracted))
}

type Produced = (RpcEvent, BoxStream<'static, RpcEvent>);

/// Emits head events in order while their nested event streams run alongside.
fn ordered_with_children(heads: BoxStream<'static, Produced>) -> BoxStream<'static, RpcEvent> {
    let mut heads = heads.fuse();
    let mut children: SelectAll<BoxStream<'static, RpcEvent>> = SelectAll::new();
    stream::poll_fn(move |cx| {
        if !heads.is_terminated() {
            if let Poll::Ready(Some((event, nested))) = heads.poll_next_unpin(cx) {
                children.push(nested);
                return Poll::Ready(Some(event));
            }
        }
        match children.poll_next_unpin(cx) {
            Poll::Ready(Some(event)) => Poll::Ready(Some(event)),
            Poll::Ready(None) if heads.is_terminated() => Poll::Ready(None),
            Poll::Ready(None) | Poll::Pending => Poll::Pending,
        }
    })
    .boxed()
}

/// Sending half of reference streaming
#[derive(Debug, Clone, Copy, Default)]
pub struct ReferenceProducer;

impl ReferenceProducer {
    /// Events for every `p`/`i` reference in `extracted`, owned by `owner`.
    pub fn events(owner: &str, extracted: &Extracted) -> BoxStream<'static, RpcEvent> {
        let streams: Vec<_> = extracted
            .references
            .iter()
            .filter(|(id, _)| produces_events(id))
            .map(|(id, value)| Self::reference_events(scoped_reference(owner, id), value.clone()))
            .collect();
        if streams.is_empty() {
            return stream::empty().boxed();
        }
        stream::select_all(streams).boxed()
    }

    fn reference_events(event_id: String, value: Value) -> BoxStream<'static, RpcEvent> {
        match value {
            Value::Deferred(deferred) => {
                let head = async move {
                    let settled = deferred.wait().await;
                    trace!(id = %event_id, ok = settled.is_ok(), "deferred reference settled");
                    Self::payload_event(&event_id, settled)
                };
                ordered_with_children(stream::once(head).boxed())
            }
            Value::Sequence(sequence) => {
                let items = stream::unfold(
                    (sequence, event_id, 0usize, false),
                    |(sequence, event_id, index, finished)| async move {
                        if finished {
                            return None;
                        }
                        let produced = match sequence.next().await {
                            Ok(Some(item)) => {
                                let owner = scoped_reference(&event_id, &index.to_string());
                                Self::item_event(&event_id, &owner, item)
                            }
                            Ok(None) => {
                                let done =
                                    (RpcEvent::done(event_id.clone()), stream::empty().boxed());
                                return Some((done, (sequence, event_id, index, true)));
                            }
                            Err(err) => (
                                RpcEvent::failure(event_id.clone(), err),
                                stream::empty().boxed(),
                            ),
                        };
                        let finished = produced.0.error.is_some();
                        Some((produced, (sequence, event_id, index + 1, finished)))
                    },
                );
                ordered_with_children(items.boxed())
            }
            other => {
                warn!(id = %event_id, kind = other.type_name(), "reference cannot produce events");
                stream::empty().boxed()
            }
        }
    }

    fn payload_event(event_id: &str, settled: Result<Value, RpcError>) -> Produced {
        let value = match settled {
            Ok(value) => value,
            Err(err) => return (RpcEvent::failure(event_id, err), stream::empty().boxed()),
        };
        match to_wire(&value) {
            Ok((json, extracted)) => (
                RpcEvent::success(event_id, json, expect_ids(&extracted)),
                Self::events(event_id, &extracted),
            ),
            Err(err) => (RpcEvent::failure(event_id, err), stream::empty().boxed()),
        }
    }

    fn item_event(event_id: &str, owner: &str, item: Value) -> Produced {
        match to_wire(&item) {
            Ok((json, extracted)) => (
                RpcEvent::item(event_id, json, expect_ids(&extracted)),
                Self::events(owner, &extracted),
            ),
            Err(err) => (RpcEvent::failure(event_id, err), stream::empty().boxed()),
        }
    }
}

enum Pending {
    Deferred(DeferredResolver),
    Sequence { sender: SequenceSender, next_index: usize },
}

/// What `deliver` decided under the lock, carried out after releasing it
enum Route {
    Deferred(DeferredResolver),
    Item { sender: SequenceSender, index: usize },
    Failed(SequenceSender),
    Finished,
}

/// Events held back by default before the oldest is dropped
pub const DEFAULT_MAX_EARLY_EVENTS: usize = 1024;

#[derive(Default)]
struct PendingState {
    entries: HashMap<String, Pending>,
    early: IndexMap<String, Vec<RpcEvent>>,
    early_count: usize,
    /// Recently finished ids; later events for them are dropped
    settled: IndexSet<String>,
}

impl PendingState {
    fn settle(&mut self, id: String, limit: usize) {
        self.settled.insert(id);
        while self.settled.len() > limit {
            self.settled.shift_remove_index(0);
        }
    }

    fn hold(&mut self, event: RpcEvent, limit: usize) {
        if self.settled.contains(&event.id) {
            debug!(id = %event.id, "dropping event for a settled reference");
            return;
        }
        if limit == 0 {
            warn!(id = %event.id, "dropping early event, buffer disabled");
            return;
        }
        while self.early_count >= limit {
            let Some((_, held)) = self.early.get_index_mut(0) else {
                break;
            };
            if !held.is_empty() {
                held.remove(0);
                self.early_count -= 1;
            }
            if held.is_empty() {
                if let Some((id, _)) = self.early.shift_remove_index(0) {
                    warn!(id = %id, limit, "early event buffer full, dropped oldest");
                }
            }
        }
        trace!(id = %event.id, "holding early event");
        self.early.entry(event.id.clone()).or_default().push(event);
        self.early_count += 1;
    }

    fn take_early(&mut self, id: &str) -> Vec<RpcEvent> {
        let held = self.early.shift_remove(id).unwrap_or_default();
        self.early_count -= held.len();
        held
    }
}

/// Receiving half of reference streaming.
///
/// Events that arrive before their placeholder exists are held back and
/// replayed when the owner materializes it. The hold-back buffer is bounded;
/// once full the oldest held event is dropped.
pub struct PendingReferences {
    state: Mutex<PendingState>,
    max_early: usize,
}

impl Default for PendingReferences {
    fn default() -> Self {
        Self::with_limit(DEFAULT_MAX_EARLY_EVENTS)
    }
}

impl PendingReferences {
    pub fn new() -> Self {
        Self::default()
    }

    /// At most `max_early` events are held for placeholders not yet materialized.
    pub fn with_limit(max_early: usize) -> Self {
        PendingReferences {
            state: Mutex::new(PendingState::default()),
            max_early,
        }
    }

    /// Outstanding placeholders
    pub fn len(&self) -> usize {
        self.state.lock().entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.state.lock().entries.is_empty()
    }

    /// Events currently held back
    pub fn early_len(&self) -> usize {
        self.state.lock().early_count
    }

    /// Placeholders for `expect`, keyed by the unscoped reference id, ready for merge.
    pub fn materialize(
        &self,
        owner: &str,
        expect: &[String],
    ) -> Result<IndexMap<String, Value>, RpcError> {
        let mut placeholders = IndexMap::new();
        let mut held = Vec::new();
        {
            let mut state = self.state.lock();
            for id in expect {
                let (prefix, _) = parse_reference_id(id)?;
                let key = scoped_reference(owner, id);
                let (pending, placeholder) = match prefix {
                    DEFERRED_PREFIX => {
                        let (resolver, deferred) = Deferred::pending();
                        (Pending::Deferred(resolver), Value::Deferred(deferred))
                    }
                    SEQUENCE_PREFIX => {
                        let (sender, sequence) = Sequence::channel();
                        (
                            Pending::Sequence {
                                sender,
                                next_index: 0,
                            },
                            Value::Sequence(sequence),
                        )
                    }
                    other => {
                        return Err(RpcError::bad_request(format!(
                            "reference '{}' with prefix '{}' does not produce events",
                            id, other
                        )))
                    }
                };
                state.settled.shift_remove(&key);
                held.extend(state.take_early(&key));
                state.entries.insert(key, pending);
                placeholders.insert(id.clone(), placeholder);
            }
        }
        trace!(
            owner,
            count = placeholders.len(),
            replayed = held.len(),
            "materialized references"
        );

        for event in held {
            self.deliver(event)?;
        }
        Ok(placeholders)
    }

    /// Materialize the expected references of a payload and merge them into it.
    pub fn resolve(
        &self,
        owner: &str,
        payload: serde_json::Value,
        expect: &[String],
    ) -> Result<Value, RpcError> {
        let replaced = Value::from_json(payload);
        if expect.is_empty() {
            return Ok(replaced);
        }
        let placeholders = self.materialize(owner, expect)?;
        Ok(Extractor::default().merge(replaced, &placeholders)?)
    }

    /// Route one event to its placeholder.
    pub fn deliver(&self, event: RpcEvent) -> Result<(), RpcError> {
        let route = {
            let mut state = self.state.lock();
            let route = match state.entries.get_mut(&event.id) {
                None => {
                    state.hold(event, self.max_early);
                    return Ok(());
                }
                Some(Pending::Sequence {
                    sender,
                    next_index,
                }) if event.error.is_none() && !is_done(&event) => {
                    let index = *next_index;
                    *next_index += 1;
                    Some(Route::Item {
                        sender: sender.clone(),
                        index,
                    })
                }
                Some(_) => None,
            };
            match route {
                Some(route) => route,
                None => match state.entries.remove(&event.id) {
                    Some(Pending::Deferred(resolver)) => {
                        state.settle(event.id.clone(), self.max_early);
                        Route::Deferred(resolver)
                    }
                    Some(Pending::Sequence { sender, next_index }) => {
                        state.settle(event.id.clone(), self.max_early);
                        if event.error.is_some() {
                            Route::Failed(sender)
                        } else {
                            trace!(
                                id = %event.id,
                                items = next_index,
                                "sequence reference finished"
                            );
                            Route::Finished
                        }
                    }
                    None => return Ok(()),
                },
            }
        };

        match route {
            Route::Deferred(resolver) => {
                let settled = match event.outcome() {
                    Err(err) => Err(err.clone()),
                    Ok(payload) => self.resolve(&event.id, payload.clone(), &event.expect),
                };
                resolver.settle(settled);
            }
            Route::Item { sender, index } => {
                let owner = scoped_reference(&event.id, &index.to_string());
                let item = event
                    .result
                    .as_ref()
                    .and_then(|payload| payload.get("value"))
                    .cloned()
                    .unwrap_or_default();
                let item = self.resolve(&owner, item, &event.expect)?;
                sender.push(item);
            }
            Route::Failed(sender) => {
                if let Err(err) = event.outcome() {
                    sender.fail(err.clone());
                }
            }
            Route::Finished => {}
        }
        Ok(())
    }

    /// Reject everything outstanding, for example after a transport failure.
    pub fn fail_all(&self, error: RpcError) {
        let drained: Vec<_> = {
            let mut state = self.state.lock();
            state.early.clear();
            state.early_count = 0;
            let drained: Vec<_> = state.entries.drain().collect();
            for (id, _) in &drained {
                state.settle(id.clone(), self.max_early);
            }
            drained
        };
        if !drained.is_empty() {
            debug!(count = drained.len(), error = %error, "failing pending references");
        }
        for (_, pending) in drained {
            match pending {
                Pending::Deferred(resolver) => resolver.reject(error.clone()),
                Pending::Sequence { sender, .. } => {
                    sender.fail(error.clone());
                }
            }
        }
    }
}

fn is_done(event: &RpcEvent) -> bool {
    event
        .result
        .as_ref()
        .and_then(|payload| payload.get("done"))
        .and_then(serde_json::Value::as_bool)
        == Some(true)
}

impl std::fmt::Debug for PendingReferences {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let state = self.state.lock();
        f.debug_struct("PendingReferences")
            .field("pending", &state.entries.len())
            .field("early", &state.early_count)
            .field("max_early", &self.max_early)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ErrorCode;
    use crate::value::Function;
    use serde_json::json;
    use std::sync::Arc;

    async fn collect_events(
        owner: &str,
        value: &Value,
    ) -> (serde_json::Value, Vec<String>, Vec<RpcEvent>) {
        let (json, extracted) = to_wire(value).unwrap();
        let events = ReferenceProducer::events(owner, &extracted).collect().await;
        (json, expect_ids(&extracted), events)
    }

    #[tokio::test]
    async fn test_wire_extractor_ids() {
        let value = Value::object([
            ("later", Value::Deferred(Deferred::resolved(Value::from(1)))),
            ("items", Value::Sequence(Sequence::from_values(Vec::new()))),
            ("cb", Value::Function(Function::new("cb", |_| Ok(Value::Null)))),
        ]);
        let (json, expect, _) = collect_events("ns:1", &value).await;
        assert_eq!(json, json!({"later": "p-later", "items": "i-items", "cb": "f-cb"}));
        assert_eq!(expect, vec!["p-later", "i-items"]);
    }

    #[tokio::test]
    async fn test_deferred_and_sequence_events() {
        let value = Value::object([
            ("later", Value::Deferred(Deferred::resolved(Value::from("ready")))),
            (
                "items",
                Value::Sequence(Sequence::from_values(vec![Value::from(1), Value::from(2)])),
            ),
        ]);
        let (_, _, events) = collect_events("ns:1", &value).await;
        let later: Vec<_> = events.iter().filter(|e| e.id == "ns:1#p-later").collect();
        assert_eq!(later.len(), 1);
        assert_eq!(later[0].result, Some(json!("ready")));

        let items: Vec<_> = events
            .iter()
            .filter(|e| e.id == "ns:1#i-items")
            .map(|e| e.result.clone().unwrap())
            .collect();
        assert_eq!(
            items,
            vec![
                json!({"value": 1, "done": false}),
                json!({"value": 2, "done": false}),
                json!({"done": true}),
            ]
        );
    }

    #[tokio::test]
    async fn test_nested_reference_is_owned_by_its_event() {
        let inner = Value::Deferred(Deferred::resolved(Value::from(7)));
        let outer = Value::Deferred(Deferred::resolved(Value::object([("inner", inner)])));
        let (json, expect, events) = collect_events("ns:3", &outer).await;
        assert_eq!(json, json!("p"));
        assert_eq!(expect, vec!["p"]);
        assert_eq!(events[0].id, "ns:3#p");
        assert_eq!(events[0].result, Some(json!({"inner": "p-inner"})));
        assert_eq!(events[0].expect, vec!["p-inner"]);
        assert_eq!(events[1].id, "ns:3#p#p-inner");
        assert_eq!(events[1].result, Some(json!(7)));
    }

    #[tokio::test]
    async fn test_round_trip_through_pending_references() {
        let (tx, sequence) = Sequence::channel();
        let value = Value::object([
            ("count", Value::from(2)),
            ("items", Value::Sequence(sequence)),
            (
                "later",
                Value::Deferred(Deferred::resolved(Value::object([(
                    "nested",
                    Value::Deferred(Deferred::resolved(Value::from("deep"))),
                )]))),
            ),
        ]);
        tx.push(Value::from("a"));
        tx.push(Value::Deferred(Deferred::resolved(Value::from("b"))));
        drop(tx);

        let (json, extracted) = to_wire(&value).unwrap();
        let expect = expect_ids(&extracted);
        let events: Vec<_> = ReferenceProducer::events("ns:9", &extracted).collect().await;

        let pending = PendingReferences::new();
        let received = pending.resolve("ns:9", json, &expect).unwrap();
        for event in events {
            pending.deliver(event).unwrap();
        }

        assert_eq!(received.get("count"), Some(Value::from(2)));
        let later = match received.get("later") {
            Some(Value::Deferred(deferred)) => deferred.wait().await.unwrap(),
            other => panic!("unexpected: {:?}", other),
        };
        let nested = match later.get("nested") {
            Some(Value::Deferred(deferred)) => deferred.wait().await.unwrap(),
            other => panic!("unexpected: {:?}", other),
        };
        assert_eq!(nested, Value::from("deep"));

        let items = match received.get("items") {
            Some(Value::Sequence(sequence)) => sequence,
            other => panic!("unexpected: {:?}", other),
        };
        assert_eq!(items.next().await.unwrap(), Some(Value::from("a")));
        let second = items.next().await.unwrap();
        match second {
            Some(Value::Deferred(deferred)) => {
                assert_eq!(deferred.wait().await.unwrap(), Value::from("b"))
            }
            other => panic!("unexpected: {:?}", other),
        }
        assert_eq!(items.next().await.unwrap(), None);
        assert!(pending.is_empty());
    }

    #[tokio::test]
    async fn test_early_events_are_replayed() {
        let pending = PendingReferences::new();
        pending
            .deliver(RpcEvent::success("ns:1#p", json!(5), Vec::new()))
            .unwrap();
        let received = pending.resolve("ns:1", json!("p"), &["p".to_string()]).unwrap();
        match received {
            Value::Deferred(deferred) => assert_eq!(deferred.wait().await.unwrap(), Value::from(5)),
            other => panic!("unexpected: {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_fail_all_rejects_outstanding() {
        let pending = PendingReferences::new();
        let placeholders = pending
            .materialize("ns:1", &["p-a".to_string(), "i-b".to_string()])
            .unwrap();
        assert_eq!(pending.len(), 2);
        pending.fail_all(RpcError::canceled("transport closed"));
        assert!(pending.is_empty());

        match &placeholders["p-a"] {
            Value::Deferred(deferred) => {
                assert_eq!(deferred.wait().await.unwrap_err().code, ErrorCode::Canceled)
            }
            other => panic!("unexpected: {:?}", other),
        }
        match &placeholders["i-b"] {
            Value::Sequence(sequence) => assert!(sequence.next().await.is_err()),
            other => panic!("unexpected: {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_early_buffer_is_bounded() {
        let pending = PendingReferences::with_limit(4);
        for n in 0..10 {
            pending
                .deliver(RpcEvent::success(format!("ns:{}#p", n), json!(n), Vec::new()))
                .unwrap();
        }
        assert_eq!(pending.early_len(), 4);

        // the newest events survived
        let received = pending.resolve("ns:9", json!("p"), &["p".to_string()]).unwrap();
        match received {
            Value::Deferred(deferred) => assert_eq!(deferred.wait().await.unwrap(), Value::from(9)),
            other => panic!("unexpected: {:?}", other),
        }
        assert_eq!(pending.early_len(), 3);
    }

    #[test]
    fn test_events_for_settled_references_are_dropped() {
        let pending = PendingReferences::new();
        pending.resolve("ns:1", json!("p"), &["p".to_string()]).unwrap();
        let event = RpcEvent::success("ns:1#p", json!(1), Vec::new());
        pending.deliver(event.clone()).unwrap();
        pending.deliver(event).unwrap();
        assert!(pending.is_empty());
        assert_eq!(pending.early_len(), 0);
    }

    #[tokio::test]
    async fn test_concurrent_items_are_not_lost() {
        let pending = Arc::new(PendingReferences::new());
        let received = pending.resolve("ns:1", json!("i"), &["i".to_string()]).unwrap();

        let workers: Vec<_> = (0..8)
            .map(|worker| {
                let pending = pending.clone();
                std::thread::spawn(move || {
                    for n in 0..50 {
                        pending
                            .deliver(RpcEvent::item("ns:1#i", json!(worker * 50 + n), Vec::new()))
                            .unwrap();
                    }
                })
            })
            .collect();
        for worker in workers {
            worker.join().unwrap();
        }
        pending.deliver(RpcEvent::done("ns:1#i")).unwrap();
        assert_eq!(pending.early_len(), 0);

        let Value::Sequence(items) = received else {
            panic!("expected a sequence");
        };
        let mut seen = Vec::new();
        while let Some(item) = items.next().await.unwrap() {
            seen.push(item.as_i64().unwrap());
        }
        seen.sort_unstable();
        assert_eq!(seen, (0..400).collect::<Vec<i64>>());
    }

    #[test]
    fn test_function_ids_do_not_materialize() {
        let pending = PendingReferences::new();
        assert!(pending.materialize("ns:1", &["f-cb".to_string()]).is_err());
    }
}
