// Allow-list for the interpreter.
//
// A tree mirroring the module's shape. It is built from a schema whose leaves
// are booleans plus an explicit registration table, and each node answers
// whether the function found at that path may be called or constructed.
// Subtrees describe the shape of returned values, which is how decoders for
// chained calls are scoped.

use chainwire_core::Value;
use indexmap::IndexMap;
use std::fmt;
use std::sync::Arc;
use tracing::debug;

/// What a registered function may be used for
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CallPolicy {
    Call,
    Construct,
    CallOrConstruct,
    Deny,
}

impl CallPolicy {
    pub fn permits(&self, construct: bool) -> bool {
        match self {
            CallPolicy::Call => !construct,
            CallPolicy::Construct => construct,
            CallPolicy::CallOrConstruct => true,
            CallPolicy::Deny => false,
        }
    }
}

impl fmt::Display for CallPolicy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            CallPolicy::Call => "call",
            CallPolicy::Construct => "construct",
            CallPolicy::CallOrConstruct => "call or construct",
            CallPolicy::Deny => "deny",
        };
        write!(f, "{}", s)
    }
}

#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum AllowListError {
    #[error("registered path '{0}' does not exist in the module")]
    MissingPath(String),

    #[error("registered path '{path}' is a {kind}, not a function")]
    NotAFunction { path: String, kind: &'static str },

    #[error("function at '{path}' cannot be used for {policy}")]
    Incompatible { path: String, policy: CallPolicy },
}

#[derive(Debug, Clone, Default)]
struct AllowNode {
    /// The schema has a truthy leaf at or below this node
    allowed: bool,
    /// The schema is literally `true` here
    literal: bool,
    policy: Option<CallPolicy>,
    children: IndexMap<String, Arc<AllowNode>>,
}

impl AllowNode {
    fn from_schema(schema: &serde_json::Value) -> Self {
        match schema {
            serde_json::Value::Bool(allowed) => AllowNode {
                allowed: *allowed,
                literal: *allowed,
                ..AllowNode::default()
            },
            serde_json::Value::Object(map) => {
                let children: IndexMap<_, _> = map
                    .iter()
                    .map(|(key, child)| (key.clone(), Arc::new(AllowNode::from_schema(child))))
                    .collect();
                AllowNode {
                    allowed: children.values().any(|child| child.allowed),
                    literal: false,
                    policy: None,
                    children,
                }
            }
            _ => AllowNode::default(),
        }
    }

    fn registrations(&self, prefix: &mut Vec<String>, out: &mut Vec<(Vec<String>, CallPolicy)>) {
        if let Some(policy) = self.policy {
            out.push((prefix.clone(), policy));
        }
        for (key, child) in &self.children {
            prefix.push(key.clone());
            child.registrations(prefix, out);
            prefix.pop();
        }
    }
}

/// Which functions of a module may be invoked remotely
#[derive(Clone, Default)]
pub struct AllowList {
    root: Arc<AllowNode>,
}

impl AllowList {
    /// Allows nothing
    pub fn new() -> Self {
        Self::default()
    }

    /// `true`, or an object with at least one truthy leaf, allows the path.
    pub fn from_schema(schema: &serde_json::Value) -> Self {
        AllowList {
            root: Arc::new(AllowNode::from_schema(schema)),
        }
    }

    /// Register an explicit policy for a path, overriding the schema there.
    pub fn register<I, S>(mut self, path: I, policy: CallPolicy) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let mut node = Arc::make_mut(&mut self.root);
        for segment in path {
            let child = node.children.entry(segment.into()).or_default();
            node = Arc::make_mut(child);
        }
        node.policy = Some(policy);
        self
    }

    fn node(&self, path: &[String]) -> Option<&AllowNode> {
        path.iter()
            .try_fold(self.root.as_ref(), |node, segment| {
                node.children.get(segment).map(Arc::as_ref)
            })
    }

    /// Policy for the function at `path`. Registrations win over the schema;
    /// a schema-allowed path may be called or constructed. The empty path
    /// (the module itself) needs a registration or a literal `true`.
    pub fn policy_at(&self, path: &[String]) -> CallPolicy {
        match self.node(path) {
            Some(AllowNode {
                policy: Some(policy),
                ..
            }) => *policy,
            Some(node) if node.allowed && (node.literal || !path.is_empty()) => {
                CallPolicy::CallOrConstruct
            }
            _ => CallPolicy::Deny,
        }
    }

    pub fn permits(&self, path: &[String], construct: bool) -> bool {
        self.policy_at(path).permits(construct)
    }

    /// Allow-list for the value returned from `path`
    pub fn subtree(&self, path: &[String]) -> AllowList {
        let mut cursor = &self.root;
        for segment in path {
            match cursor.children.get(segment) {
                Some(child) => cursor = child,
                None => return AllowList::new(),
            }
        }
        AllowList {
            root: cursor.clone(),
        }
    }

    /// Registered `(path, policy)` pairs, depth first
    pub fn registrations(&self) -> Vec<(Vec<String>, CallPolicy)> {
        let mut out = Vec::new();
        self.root.registrations(&mut Vec::new(), &mut out);
        out
    }

    /// Check every registration against the module.
    ///
    /// A path that continues past a function describes the shape of that
    /// function's return value and is only checked up to the function.
    pub fn validate(&self, module: &Value) -> Result<(), AllowListError> {
        for (path, policy) in self.registrations() {
            let joined = path.join(".");
            let mut cursor = module.clone();
            let mut complete = true;
            for segment in &path {
                match cursor.get(segment) {
                    Some(next) => cursor = next,
                    None if cursor.as_function().is_some() => {
                        complete = false;
                        break;
                    }
                    None => return Err(AllowListError::MissingPath(joined)),
                }
            }
            if !complete {
                continue;
            }

            let function = match &cursor {
                Value::Function(function) => function,
                other => {
                    return Err(AllowListError::NotAFunction {
                        path: joined,
                        kind: other.type_name(),
                    })
                }
            };
            let supported = match policy {
                CallPolicy::Call => function.is_callable(),
                CallPolicy::Construct => function.is_constructible(),
                CallPolicy::CallOrConstruct => {
                    function.is_callable() || function.is_constructible()
                }
                CallPolicy::Deny => true,
            };
            if !supported {
                return Err(AllowListError::Incompatible {
                    path: joined,
                    policy,
                });
            }
        }
        debug!(registrations = self.registrations().len(), "allow-list validated");
        Ok(())
    }
}

impl fmt::Debug for AllowList {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AllowList")
            .field("allowed", &self.root.allowed)
            .field("registrations", &self.registrations())
            .finish()
    }
}
