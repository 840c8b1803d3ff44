//! The injected adapter-dispatch seam.

use kb_ipc_types::{AdapterCall, ErrorValue, Value};

/// Executes adapter calls on behalf of the server.
///
/// The hosting process supplies the implementation: typically a dispatcher
/// that maps the call's `(adapter, method)` pair to a live adapter instance
/// and invokes it. The server never interprets the call beyond routing it
/// here, and converts an `Err` into a normally-framed error response rather
/// than letting it disturb the connection.
///
/// Calls are dispatched concurrently: several invocations may run at once
/// for the same connection, so implementations must be safe to call from
/// multiple threads. Implementations should avoid panicking; a panic
/// abandons only that call's dispatch thread, and the remote caller times
/// out instead of receiving an error response.
///
/// # Example
///
/// ```
/// use kb_ipc_server::CallHandler;
/// use kb_ipc_types::{AdapterCall, ErrorValue, Value};
///
/// struct EchoHandler;
///
/// impl CallHandler for EchoHandler {
///     fn handle(&self, call: AdapterCall) -> Result<Value, ErrorValue> {
///         Ok(Value::from(call.method()))
///     }
/// }
/// ```
pub trait CallHandler: Send + Sync + 'static {
    /// Executes one adapter call, returning its result value or the error
    /// to serialize back to the caller.
    ///
    /// # Errors
    ///
    /// Returns an [`ErrorValue`] describing the adapter failure; it travels
    /// the wire verbatim and surfaces to the remote caller.
    fn handle(&self, call: AdapterCall) -> Result<Value, ErrorValue>;
}
