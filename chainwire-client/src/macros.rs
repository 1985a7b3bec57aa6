//! Macros for building argument lists

/// Build a `Vec<Value>` of call arguments from JSON-like literals
///
/// # Example
///
/// ```rust
/// use chainwire_client::args;
/// let args = args![5, "hello", true, {"nested": [1, 2]}];
/// assert_eq!(args.len(), 4);
/// ```
#[macro_export]
macro_rules! args {
    [$($tt:tt)*] => {
        match $crate::serde_json::json!([$($tt)*]) {
            $crate::serde_json::Value::Array(items) => items
                .into_iter()
                .map($crate::Value::from_json)
                .collect::<Vec<$crate::Value>>(),
            _ => Vec::new(),
        }
    };
}
