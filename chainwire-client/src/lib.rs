//! Client side of chainwire: capture call chains, encode them, dispatch them
//! through a [`Transport`](chainwire_core::Transport) and hand back
//! dual-mode results.

pub mod capture;
pub mod client;
pub mod encoder;
pub mod macros;

pub use capture::{
    CaptureError, CaptureSession, CapturedOperation, InteractionSet, OperationKind, Outcome, Step,
};
pub use client::{Chain, Client, ClientConfig, ClientError, RemoteValue};
pub use encoder::{ChainEncoder, EncodeError, EncodedCall};

pub use chainwire_core::{DualModeValue, RpcError, Value};

#[doc(hidden)]
pub use serde_json;
