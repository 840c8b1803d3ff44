//! End-to-end test support for the kb adapter-call transport.
//!
//! Wires the real server and the real client transports together over a
//! throwaway socket so behaviour tests can exercise the full round trip:
//! encode, frame, dispatch, respond, correlate.

#[cfg(unix)]
mod fixtures;

#[cfg(unix)]
pub use self::fixtures::{ScriptedDispatcher, TestPlatform};
