//! Server side of chainwire: an allow-listed interpreter for call chains and
//! a session that turns incoming calls into replies.

pub mod allow_list;
pub mod interpreter;
pub mod logging;
pub mod session;

pub use allow_list::{AllowList, AllowListError, CallPolicy};
pub use interpreter::{CallChain, Interpreter, InterpreterError, MethodOutcome, DENIED_NAMES};
pub use logging::{init_logging, init_test_logging};
pub use session::{Session, SessionConfig};
