use crate::allow_list::AllowList;
use chainwire_core::{ErrorCode, Function, RpcError, RpcFunctionCall, Value};
use serde_json::json;
use std::sync::Arc;
use tracing::{debug, trace};

/// Names that are never resolved, whatever the allow-list says
pub const DENIED_NAMES: &[&str] = &[
    "constructor",
    "prototype",
    "__proto__",
    "caller",
    "arguments",
    "__defineGetter__",
    "__defineSetter__",
    "__lookupGetter__",
    "__lookupSetter__",
];

#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum InterpreterError {
    #[error("no module was provided")]
    ModuleNotProvided,

    #[error("module is a {kind}, expected a function or an object")]
    ModuleIsInvalid { kind: &'static str },

    #[error("function '{path}' does not exist")]
    FunctionDoesNotExist { path: String },

    #[error("method chain '{}' does not exist", .chain.as_deref().unwrap_or("<none>"))]
    MethodChainDoesNotExist { chain: Option<String> },
}

impl InterpreterError {
    pub fn kind(&self) -> &'static str {
        match self {
            InterpreterError::ModuleNotProvided => "ModuleNotProvided",
            InterpreterError::ModuleIsInvalid { .. } => "ModuleIsInvalid",
            InterpreterError::FunctionDoesNotExist { .. } => "FunctionDoesNotExist",
            InterpreterError::MethodChainDoesNotExist { .. } => "MethodChainDoesNotExist",
        }
    }
}

impl From<InterpreterError> for RpcError {
    fn from(err: InterpreterError) -> Self {
        let code = match err {
            InterpreterError::ModuleIsInvalid { .. } => ErrorCode::BadRequest,
            _ => ErrorCode::NotFound,
        };
        RpcError::with_data(code, err.to_string(), json!({ "kind": err.kind() }))
    }
}

/// Outcome of one interpreted call
#[derive(Debug, Clone)]
pub struct MethodOutcome {
    /// What the invoked function returned; its own failures land here
    pub result: Result<Value, RpcError>,
    /// Interpreter over the result, accepting calls chained from this one
    pub decoder: Interpreter,
}

/// Executes calls against a module under an allow-list.
///
/// A root interpreter accepts only unchained calls. The decoder returned with
/// every result accepts only calls whose `chain` is the id of the call that
/// produced it.
#[derive(Clone)]
pub struct Interpreter {
    target: Option<Value>,
    allow_list: AllowList,
    methods_on_methods: Arc<Vec<String>>,
    scope: Option<String>,
}

impl Interpreter {
    pub fn new<I, S>(target: Option<Value>, allow_list: AllowList, methods_on_methods: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Interpreter {
            target,
            allow_list,
            methods_on_methods: Arc::new(methods_on_methods.into_iter().map(Into::into).collect()),
            scope: None,
        }
    }

    pub fn target(&self) -> Option<&Value> {
        self.target.as_ref()
    }

    /// Id of the call whose result this interpreter wraps
    pub fn scope(&self) -> Option<&str> {
        self.scope.as_deref()
    }

    pub fn allow_list(&self) -> &AllowList {
        &self.allow_list
    }

    /// Interpret `call` with its arguments taken as plain data.
    pub fn call_method(&self, call: &RpcFunctionCall) -> Result<MethodOutcome, InterpreterError> {
        let args = call.args.iter().cloned().map(Value::from_json).collect();
        self.call_with_args(call, args)
    }

    /// Interpret `call` with already reconstructed arguments.
    pub fn call_with_args(
        &self,
        call: &RpcFunctionCall,
        args: Vec<Value>,
    ) -> Result<MethodOutcome, InterpreterError> {
        debug!(
            id = %call.id,
            method = ?call.method,
            chain = ?call.chain,
            construct = call.is_construct,
            "interpreting call"
        );
        let function = self.resolve(call)?;

        let result = if call.is_construct {
            function.construct(args)
        } else {
            function.call(args)
        };
        if let Err(err) = &result {
            debug!(id = %call.id, error = %err, "invoked function failed");
        }

        let decoder = Interpreter {
            target: result.as_ref().ok().cloned(),
            allow_list: self.allow_list.subtree(&call.method),
            methods_on_methods: self.methods_on_methods.clone(),
            scope: Some(call.id.clone()),
        };
        Ok(MethodOutcome { result, decoder })
    }

    fn resolve(&self, call: &RpcFunctionCall) -> Result<Function, InterpreterError> {
        let target = match &self.target {
            None | Some(Value::Null) => return Err(InterpreterError::ModuleNotProvided),
            Some(target @ (Value::Function(_) | Value::Object(_))) => target,
            Some(other) => {
                return Err(InterpreterError::ModuleIsInvalid {
                    kind: other.type_name(),
                })
            }
        };

        if call.chain != self.scope {
            return Err(InterpreterError::MethodChainDoesNotExist {
                chain: call.chain.clone(),
            });
        }

        let path = &call.method;
        let missing = || InterpreterError::FunctionDoesNotExist {
            path: path.join("."),
        };

        let mut cursor = target.clone();
        for (depth, segment) in path.iter().enumerate() {
            if DENIED_NAMES.contains(&segment.as_str()) {
                trace!(segment = %segment, "denied reflective name");
                return Err(missing());
            }

            if let Value::Function(owner) = &cursor {
                // method on a method: only the last segment, only listed names,
                // and only on a function that is itself callable from here
                let last = depth + 1 == path.len();
                if !last
                    || !self.methods_on_methods.iter().any(|name| name == segment)
                    || !self.allow_list.permits(&path[..depth], false)
                {
                    return Err(missing());
                }
                trace!(owner = owner.name(), method = %segment, "method on method");
                return match owner.property(segment) {
                    Some(Value::Function(method)) => Ok(method),
                    _ => Err(missing()),
                };
            }

            cursor = cursor.get(segment).ok_or_else(missing)?;
        }

        match cursor {
            Value::Function(function) if self.allow_list.permits(path, call.is_construct) => {
                Ok(function)
            }
            _ => Err(missing()),
        }
    }

    /// Run `calls` in order, each against the decoder of the previous one.
    ///
    /// Lazy and single pass; it ends after the first validation failure.
    pub fn call_chain<I>(&self, calls: I) -> CallChain<I::IntoIter>
    where
        I: IntoIterator<Item = RpcFunctionCall>,
    {
        CallChain {
            current: Some(self.clone()),
            calls: calls.into_iter(),
        }
    }
}

impl std::fmt::Debug for Interpreter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Interpreter")
            .field("target", &self.target.as_ref().map(Value::type_name))
            .field("scope", &self.scope)
            .field("methods_on_methods", &self.methods_on_methods)
            .finish()
    }
}

/// Iterator returned by [`Interpreter::call_chain`]
#[derive(Debug)]
pub struct CallChain<I> {
    current: Option<Interpreter>,
    calls: I,
}

impl<I> Iterator for CallChain<I>
where
    I: Iterator<Item = RpcFunctionCall>,
{
    type Item = Result<MethodOutcome, InterpreterError>;

    fn next(&mut self) -> Option<Self::Item> {
        let interpreter = self.current.take()?;
        let call = self.calls.next()?;
        let outcome = interpreter.call_method(&call);
        if let Ok(outcome) = &outcome {
            self.current = Some(outcome.decoder.clone());
        }
        Some(outcome)
    }
}
