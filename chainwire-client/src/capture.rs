// Call capture harness.
//
// Every interaction appends one operation to a persistent, parent-linked list.
// Sessions are cheap handles onto a node of that list, so two branches taken
// from the same intermediate session share their ancestors and never see each
// other's operations. Ids come from the root's allocator, which keeps them
// unique across the whole tree.

use chainwire_core::{IdAllocator, OperationId, Value};
use std::fmt;
use std::sync::Arc;
use tracing::trace;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum OperationKind {
    PropertyAccess,
    Call,
    Construct,
    Assign,
    Delete,
}

impl OperationKind {
    /// Kinds that close the accumulated path and start a new chain link
    pub fn is_invocation(&self) -> bool {
        matches!(self, OperationKind::Call | OperationKind::Construct)
    }
}

impl fmt::Display for OperationKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            OperationKind::PropertyAccess => "property access",
            OperationKind::Call => "call",
            OperationKind::Construct => "construction",
            OperationKind::Assign => "assignment",
            OperationKind::Delete => "deletion",
        };
        write!(f, "{}", s)
    }
}

/// One captured step of a call chain
#[derive(Debug, Clone)]
pub struct CapturedOperation {
    pub id: OperationId,
    pub kind: OperationKind,
    /// Property names accumulated since the last call or construction
    pub path: Vec<String>,
    /// Arguments of a call or construction
    pub args: Vec<Value>,
    /// Assigned value
    pub value: Option<Value>,
    /// Most recent call or construction earlier in the same chain
    pub chain_parent: Option<OperationId>,
}

/// Interaction kinds a session traps
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct InteractionSet {
    pub property_access: bool,
    pub call: bool,
    pub construct: bool,
    pub assign: bool,
    pub delete: bool,
}

impl InteractionSet {
    pub fn all() -> Self {
        Self {
            property_access: true,
            call: true,
            construct: true,
            assign: true,
            delete: true,
        }
    }

    /// Everything the RPC encoding can express
    pub fn rpc() -> Self {
        Self {
            assign: false,
            delete: false,
            ..Self::all()
        }
    }

    pub fn allows(&self, kind: OperationKind) -> bool {
        match kind {
            OperationKind::PropertyAccess => self.property_access,
            OperationKind::Call => self.call,
            OperationKind::Construct => self.construct,
            OperationKind::Assign => self.assign,
            OperationKind::Delete => self.delete,
        }
    }
}

impl Default for InteractionSet {
    fn default() -> Self {
        Self::rpc()
    }
}

/// What the policy decided after looking at the pending stack
#[derive(Debug, Clone, PartialEq)]
pub enum Outcome<T> {
    Continue,
    Complete(T),
}

/// Result of one trapped interaction
pub enum Step<T> {
    /// Keep capturing from the returned session
    Continue(CaptureSession<T>),
    /// The policy produced a value; the session continues the same branch
    Complete(T, CaptureSession<T>),
}

impl<T> Step<T> {
    pub fn session(&self) -> &CaptureSession<T> {
        match self {
            Step::Continue(session) | Step::Complete(_, session) => session,
        }
    }

    pub fn into_session(self) -> CaptureSession<T> {
        match self {
            Step::Continue(session) | Step::Complete(_, session) => session,
        }
    }

    pub fn completed(self) -> Option<T> {
        match self {
            Step::Continue(_) => None,
            Step::Complete(value, _) => Some(value),
        }
    }
}

impl<T> fmt::Debug for Step<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Step::Continue(session) => f.debug_tuple("Continue").field(session).finish(),
            Step::Complete(_, session) => f.debug_tuple("Complete").field(session).finish(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum CaptureError {
    #[error("{0} is not enabled for this capture session")]
    InteractionDisabled(OperationKind),
}

type Policy<T> = dyn Fn(&[CapturedOperation]) -> Outcome<T> + Send + Sync;

struct Root<T> {
    ids: IdAllocator,
    policy: Box<Policy<T>>,
    interactions: InteractionSet,
}

struct Node {
    op: CapturedOperation,
    parent: Option<Arc<Node>>,
}

pub struct CaptureSession<T> {
    root: Arc<Root<T>>,
    tail: Option<Arc<Node>>,
}

impl<T> Clone for CaptureSession<T> {
    fn clone(&self) -> Self {
        CaptureSession {
            root: self.root.clone(),
            tail: self.tail.clone(),
        }
    }
}

impl<T> CaptureSession<T> {
    pub fn new<P>(policy: P, interactions: InteractionSet) -> Self
    where
        P: Fn(&[CapturedOperation]) -> Outcome<T> + Send + Sync + 'static,
    {
        Self::with_allocator(IdAllocator::new(), policy, interactions)
    }

    pub fn with_allocator<P>(ids: IdAllocator, policy: P, interactions: InteractionSet) -> Self
    where
        P: Fn(&[CapturedOperation]) -> Outcome<T> + Send + Sync + 'static,
    {
        CaptureSession {
            root: Arc::new(Root {
                ids,
                policy: Box::new(policy),
                interactions,
            }),
            tail: None,
        }
    }

    /// Next id from the root allocator
    pub fn create_id(&self) -> OperationId {
        self.root.ids.allocate()
    }

    pub fn namespace(&self) -> &str {
        self.root.ids.namespace()
    }

    pub fn wire_id(&self, id: OperationId) -> String {
        self.root.ids.wire_id(id)
    }

    pub fn interactions(&self) -> InteractionSet {
        self.root.interactions
    }

    pub fn last(&self) -> Option<&CapturedOperation> {
        self.tail.as_deref().map(|node| &node.op)
    }

    /// Operations of this branch, oldest first
    pub fn stack(&self) -> Vec<CapturedOperation> {
        let mut ops = Vec::new();
        let mut cursor = self.tail.as_deref();
        while let Some(node) = cursor {
            ops.push(node.op.clone());
            cursor = node.parent.as_deref();
        }
        ops.reverse();
        ops
    }

    pub fn get(&self, name: &str) -> Result<Step<T>, CaptureError> {
        let (base, mut path) = self.open_path();
        path.push(name.to_string());
        self.append(base, OperationKind::PropertyAccess, path, Vec::new(), None)
    }

    pub fn call(&self, args: Vec<Value>) -> Result<Step<T>, CaptureError> {
        let (base, path) = self.open_path();
        self.append(base, OperationKind::Call, path, args, None)
    }

    pub fn construct(&self, args: Vec<Value>) -> Result<Step<T>, CaptureError> {
        let (base, path) = self.open_path();
        self.append(base, OperationKind::Construct, path, args, None)
    }

    pub fn assign(&self, name: &str, value: Value) -> Result<Step<T>, CaptureError> {
        let (base, mut path) = self.open_path();
        path.push(name.to_string());
        self.append(base, OperationKind::Assign, path, Vec::new(), Some(value))
    }

    pub fn delete(&self, name: &str) -> Result<Step<T>, CaptureError> {
        let (base, mut path) = self.open_path();
        path.push(name.to_string());
        self.append(base, OperationKind::Delete, path, Vec::new(), None)
    }

    /// Path still open at the tail. A trailing property access is folded into
    /// whatever comes next, so the new node hangs off its parent instead.
    fn open_path(&self) -> (Option<Arc<Node>>, Vec<String>) {
        match self.tail.as_ref() {
            Some(node) if node.op.kind == OperationKind::PropertyAccess => {
                (node.parent.clone(), node.op.path.clone())
            }
            other => (other.cloned(), Vec::new()),
        }
    }

    fn append(
        &self,
        base: Option<Arc<Node>>,
        kind: OperationKind,
        path: Vec<String>,
        args: Vec<Value>,
        value: Option<Value>,
    ) -> Result<Step<T>, CaptureError> {
        if !self.root.interactions.allows(kind) {
            return Err(CaptureError::InteractionDisabled(kind));
        }

        let op = CapturedOperation {
            id: self.create_id(),
            kind,
            path,
            args,
            value,
            chain_parent: chain_parent(base.as_deref()),
        };
        trace!(id = %op.id, kind = %op.kind, path = ?op.path, "captured operation");

        let child = CaptureSession {
            root: self.root.clone(),
            tail: Some(Arc::new(Node { op, parent: base })),
        };
        let stack = child.stack();
        Ok(match (self.root.policy)(&stack) {
            Outcome::Continue => Step::Continue(child),
            Outcome::Complete(value) => Step::Complete(value, child),
        })
    }
}

fn chain_parent(mut cursor: Option<&Node>) -> Option<OperationId> {
    while let Some(node) = cursor {
        if node.op.kind.is_invocation() {
            return Some(node.op.id);
        }
        cursor = node.parent.as_deref();
    }
    None
}

impl<T> fmt::Debug for CaptureSession<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CaptureSession")
            .field("namespace", &self.namespace())
            .field("last", &self.last())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn recording() -> CaptureSession<Vec<CapturedOperation>> {
        CaptureSession::new(
            |stack: &[CapturedOperation]| match stack.last().map(|op| op.kind) {
                Some(kind) if kind.is_invocation() => Outcome::Complete(stack.to_vec()),
                _ => Outcome::Continue,
            },
            InteractionSet::all(),
        )
    }

    #[test]
    fn test_property_accesses_merge() {
        let root = recording();
        let step = root.get("a").unwrap().into_session();
        let step = step.get("b").unwrap().into_session();
        let step = step.get("c").unwrap().into_session();

        let stack = step.stack();
        assert_eq!(stack.len(), 1);
        assert_eq!(stack[0].kind, OperationKind::PropertyAccess);
        assert_eq!(stack[0].path, vec!["a", "b", "c"]);
    }

    #[test]
    fn test_call_closes_the_path() {
        let root = recording();
        let access = root.get("math").unwrap().into_session();
        let access = access.get("add").unwrap().into_session();
        let stack = access.call(vec![Value::from(2), Value::from(3)]).unwrap().completed().unwrap();

        assert_eq!(stack.len(), 1);
        assert_eq!(stack[0].kind, OperationKind::Call);
        assert_eq!(stack[0].path, vec!["math", "add"]);
        assert_eq!(stack[0].args.len(), 2);
        assert_eq!(stack[0].chain_parent, None);
    }

    #[test]
    fn test_bare_call_has_empty_path() {
        let root = recording();
        let stack = root.call(Vec::new()).unwrap().completed().unwrap();
        assert!(stack[0].path.is_empty());
    }

    #[test]
    fn test_chained_calls_link_to_parent() {
        let root = recording();
        let first = root.get("add").unwrap().into_session();
        let first = match first.call(vec![Value::from(2)]).unwrap() {
            Step::Complete(_, session) => session,
            Step::Continue(_) => panic!("call should complete"),
        };
        let first_id = first.last().unwrap().id;

        let second = first.get("add").unwrap().into_session();
        let stack = second.call(vec![Value::from(3)]).unwrap().completed().unwrap();
        assert_eq!(stack.len(), 2);
        assert_eq!(stack[1].path, vec!["add"]);
        assert_eq!(stack[1].chain_parent, Some(first_id));
    }

    #[test]
    fn test_branches_share_ancestors_and_ids() {
        let root = recording();
        let api = root.get("api").unwrap().into_session();
        let user = api.call(Vec::new()).unwrap().into_session();

        let name = user.get("name").unwrap().into_session().call(Vec::new()).unwrap();
        let age = user.get("age").unwrap().into_session().call(Vec::new()).unwrap();
        let name = name.completed().unwrap();
        let age = age.completed().unwrap();

        assert_eq!(name[0].id, age[0].id);
        assert_ne!(name[1].id, age[1].id);
        assert_eq!(name[1].chain_parent, age[1].chain_parent);
        assert_eq!(user.stack().len(), 1);
    }

    #[test]
    fn test_policy_sees_full_stack() {
        let seen = Arc::new(AtomicUsize::new(0));
        let counter = seen.clone();
        let root: CaptureSession<()> = CaptureSession::new(
            move |stack: &[CapturedOperation]| {
                counter.store(stack.len(), Ordering::SeqCst);
                Outcome::Continue
            },
            InteractionSet::all(),
        );
        let session = root.call(Vec::new()).unwrap().into_session();
        let session = session.get("x").unwrap().into_session();
        session.construct(Vec::new()).unwrap();
        assert_eq!(seen.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn test_disabled_interactions() {
        let root: CaptureSession<()> =
            CaptureSession::new(|_: &[CapturedOperation]| Outcome::Continue, InteractionSet::rpc());
        assert_eq!(
            root.assign("x", Value::Null).unwrap_err(),
            CaptureError::InteractionDisabled(OperationKind::Assign)
        );
        assert!(root.delete("x").is_err());
        assert!(root.get("x").is_ok());
    }

    #[test]
    fn test_assignment_folds_open_path() {
        let root = recording();
        let session = root.get("config").unwrap().into_session();
        let step = session.assign("level", Value::from(3)).unwrap();
        let stack = step.session().stack();
        assert_eq!(stack.len(), 1);
        assert_eq!(stack[0].kind, OperationKind::Assign);
        assert_eq!(stack[0].path, vec!["config", "level"]);
        assert_eq!(stack[0].value, Some(Value::from(3)));
    }
}
