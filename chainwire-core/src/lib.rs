//! Protocol engine shared by the chainwire client and server.
//!
//! Holds the dynamic value model, the wire messages, reference extraction and
//! streaming, and the deferred primitives results are reconstructed into.

pub mod deferred;
pub mod dual_mode;
pub mod error;
pub mod extract;
pub mod ids;
pub mod message;
pub mod references;
pub mod sequence;
pub mod transport;
pub mod value;

pub use deferred::{Deferred, DeferredResolver};
pub use dual_mode::{DeferredError, DualModeState, DualModeValue};
pub use error::{ErrorCode, RpcError};
pub use extract::{Depth, ExtractError, Extracted, Extractor, ExtractorConfig};
pub use ids::{scoped_reference, IdAllocator, OperationId};
pub use message::{RpcEvent, RpcFunctionCall, RpcFunctionResult};
pub use references::{expect_ids, to_wire, wire_extractor, PendingReferences, ReferenceProducer};
pub use sequence::{Sequence, SequenceSender};
pub use transport::{Reply, Transport};
pub use value::{Function, FunctionBuilder, Value, ValueError};
