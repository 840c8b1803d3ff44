//! Wire types and message codec for the kb adapter-call transport.
//!
//! A sandboxed child process invokes platform adapters that live in the
//! parent process. Both sides exchange newline-delimited JSON envelopes over
//! a local socket: the child sends an [`AdapterCall`], the parent answers
//! with an [`AdapterResponse`] carrying the same request id. This crate
//! defines the envelope types, the [`Value`] model that argument and result
//! payloads are restricted to, and the [`codec`] that frames envelopes for
//! stream transmission.
//!
//! Transport implementations live in `kb-ipc-client`; the parent-process
//! listener lives in `kb-ipc-server`.

pub mod codec;
mod envelope;
mod value;

pub use self::codec::{CodecError, LineDecoder, MAX_LINE_BYTES};
pub use self::envelope::{
    AdapterCall, AdapterKind, AdapterResponse, CallContext, EnvelopeError, PROTOCOL_VERSION,
    WireMessage,
};
pub use self::value::{ErrorValue, Value};
