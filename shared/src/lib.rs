//! Shared wire types for the seam RPC protocol
//!
//! Used by the client session layer and by anything that needs to speak
//! the `{event, data}` envelope format (test servers, tooling).

pub mod codec;
pub mod error;
pub mod message;

pub use codec::{Codec, CodecError, JsonCodec};
pub use error::RpcError;
pub use message::{Envelope, ServerEvent};
