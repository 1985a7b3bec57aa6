use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};

/// Identifier of one captured operation, unique within its root allocator
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct OperationId(u64);

impl OperationId {
    pub fn new(value: u64) -> Self {
        OperationId(value)
    }

    pub fn as_u64(&self) -> u64 {
        self.0
    }
}

impl fmt::Display for OperationId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Op#{}", self.0)
    }
}

impl From<u64> for OperationId {
    fn from(value: u64) -> Self {
        OperationId::new(value)
    }
}

/// Monotonic id source owned by one capture root.
///
/// Every allocator carries a namespace so that wire ids produced by two
/// independent roots never collide when they share a server session.
#[derive(Debug)]
pub struct IdAllocator {
    namespace: String,
    next: AtomicU64,
}

impl IdAllocator {
    /// Allocator with a fresh random namespace
    pub fn new() -> Self {
        let uuid = uuid::Uuid::new_v4().simple().to_string();
        Self::with_namespace(&uuid[..12])
    }

    pub fn with_namespace(namespace: &str) -> Self {
        IdAllocator {
            namespace: namespace.to_string(),
            next: AtomicU64::new(1),
        }
    }

    pub fn allocate(&self) -> OperationId {
        let id = self.next.fetch_add(1, Ordering::Relaxed);
        OperationId::new(id)
    }

    pub fn peek_next(&self) -> u64 {
        self.next.load(Ordering::Relaxed)
    }

    pub fn namespace(&self) -> &str {
        &self.namespace
    }

    /// Wire form of an operation id, as used in `RpcFunctionCall.id`
    pub fn wire_id(&self, id: OperationId) -> String {
        format!("{}:{}", self.namespace, id.0)
    }
}

impl Default for IdAllocator {
    fn default() -> Self {
        Self::new()
    }
}

/// Event key for an extracted reference owned by a call or by another event.
pub fn scoped_reference(owner: &str, reference: &str) -> String {
    format!("{}#{}", owner, reference)
}
