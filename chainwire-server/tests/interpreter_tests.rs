use chainwire_core::{Function, RpcError, RpcFunctionCall, Value};
use chainwire_server::{
    AllowList, CallPolicy, Interpreter, InterpreterError, Session, SessionConfig,
};
use proptest::prelude::*;
use serde_json::json;

fn number(args: &[Value], index: usize) -> i64 {
    args.get(index).and_then(Value::as_i64).unwrap_or(0)
}

fn add() -> Function {
    Function::new("add", |args| Ok(Value::from(number(&args, 0) + number(&args, 1))))
}

/// `add(a)` returns an object whose `add(b)` returns `a + b`
fn curried_add() -> Function {
    Function::new("add", |args| {
        let a = number(&args, 0);
        Ok(Value::object([(
            "add",
            Value::from(Function::new("add", move |rest| {
                Ok(Value::from(a + number(&rest, 0)))
            })),
        )]))
    })
}

fn call(id: &str, method: &[&str], args: Vec<serde_json::Value>) -> RpcFunctionCall {
    RpcFunctionCall::new(id, method.iter().map(|s| s.to_string()).collect(), args)
}

#[test]
fn test_add_two_numbers() {
    let module = Value::object([("add", Value::from(add()))]);
    let allow_list = AllowList::new().register(["add"], CallPolicy::Call);
    allow_list.validate(&module).unwrap();

    let interpreter = Interpreter::new(Some(module), allow_list, Vec::<String>::new());
    let outcome = interpreter
        .call_method(&call("1", &["add"], vec![json!(2), json!(3)]))
        .unwrap();
    assert_eq!(outcome.result.unwrap(), Value::from(5));
}

#[test]
fn test_docs_on_multiply() {
    let multiply = Function::builder("multiply")
        .call(|args| Ok(Value::from(number(&args, 0) * number(&args, 1))))
        .property(
            "docs",
            Function::new("docs", |_| Ok(Value::from("multiply(a, b) returns a * b"))),
        )
        .build();
    let session = Session::new(
        Some(Value::object([("multiply", Value::from(multiply))])),
        AllowList::from_schema(&json!({"multiply": true})),
        SessionConfig {
            methods_on_methods: vec!["docs".to_string()],
            ..SessionConfig::default()
        },
    );

    let reply = session.handle(call("1", &["multiply", "docs"], vec![]));
    assert_eq!(reply.result.result, Some(json!("multiply(a, b) returns a * b")));

    let reply = session.handle(call("2", &["multiply"], vec![json!(4), json!(5)]));
    assert_eq!(reply.result.result, Some(json!(20)));
}

#[test]
fn test_curried_add_through_decoder() {
    let session = Session::new(
        Some(Value::object([("add", Value::from(curried_add()))])),
        AllowList::from_schema(&json!({"add": {"add": true}})),
        SessionConfig::default(),
    );

    let first = session.handle(call("a:1", &["add"], vec![json!(2)]));
    assert!(first.result.error.is_none());
    // the returned object carries a function, which goes out as a reference
    assert_eq!(first.result.result, Some(json!({"add": "f-add"})));
    assert!(first.result.expect.is_empty());

    let second = session.handle(call("a:2", &["add"], vec![json!(3)]).chained_from("a:1"));
    assert_eq!(second.result.result, Some(json!(5)));
    assert_eq!(session.decoder_count(), 2);
}

#[test]
fn test_released_decoder_breaks_the_chain() {
    let session = Session::new(
        Some(Value::object([("add", Value::from(curried_add()))])),
        AllowList::from_schema(&json!({"add": {"add": true}})),
        SessionConfig::default(),
    );
    session.handle(call("1", &["add"], vec![json!(2)]));
    assert!(session.release("1"));

    let reply = session.handle(call("2", &["add"], vec![json!(3)]).chained_from("1"));
    let err: RpcError = reply.result.error.unwrap();
    assert_eq!(err.data, Some(json!({"kind": "MethodChainDoesNotExist"})));
}

#[test]
fn test_call_chain_feeds_decoders() {
    let interpreter = Interpreter::new(
        Some(Value::object([("add", Value::from(curried_add()))])),
        AllowList::from_schema(&json!({"add": {"add": true}})),
        Vec::<String>::new(),
    );
    let outcomes: Vec<_> = interpreter
        .call_chain(vec![
            call("1", &["add"], vec![json!(10)]),
            call("2", &["add"], vec![json!(-4)]).chained_from("1"),
        ])
        .collect::<Result<_, _>>()
        .unwrap();
    assert_eq!(outcomes.len(), 2);
    assert_eq!(outcomes[1].result.clone().unwrap(), Value::from(6));
}

proptest! {
    #[test]
    fn wrong_chain_never_resolves(parent in "[a-z0-9:]{1,12}", other in "[a-z0-9:]{1,12}") {
        prop_assume!(parent != other);
        let interpreter = Interpreter::new(
            Some(Value::object([("add", Value::from(curried_add()))])),
            AllowList::from_schema(&json!({"add": {"add": true}})),
            Vec::<String>::new(),
        );
        let outcome = interpreter.call_method(&call(&parent, &["add"], vec![json!(1)])).unwrap();

        let chained = call("next", &["add"], vec![json!(1)]).chained_from(other.clone());
        let is_chain_error = matches!(
            outcome.decoder.call_method(&chained),
            Err(InterpreterError::MethodChainDoesNotExist { .. })
        );
        prop_assert!(is_chain_error);

        let unchained = call("next", &["add"], vec![json!(1)]);
        let is_chain_error = matches!(
            outcome.decoder.call_method(&unchained),
            Err(InterpreterError::MethodChainDoesNotExist { .. })
        );
        prop_assert!(is_chain_error);
    }
}
