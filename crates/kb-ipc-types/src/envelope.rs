//! Call and response envelopes exchanged over the adapter transport.
//!
//! The wire carries two message shapes, discriminated by a `type` field:
//! `adapter:call` from the child process and `adapter:response` from the
//! parent. Responses echo the call's request id so a client multiplexing
//! several in-flight calls over one connection can re-correlate them
//! regardless of completion order.

use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;
use uuid::Uuid;

use crate::value::{ErrorValue, Value};

/// Version stamped on every outbound call envelope.
pub const PROTOCOL_VERSION: u32 = 2;

/// The closed set of adapter kinds a call can target.
///
/// The transport never interprets this beyond routing it to the dispatcher;
/// the set exists so that a mistyped adapter name fails at the serialization
/// boundary instead of inside the parent process.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum AdapterKind {
    /// Vector similarity store.
    VectorStore,
    /// Key-value cache.
    Cache,
    /// Large language model gateway.
    Llm,
    /// Embedding generation.
    Embeddings,
    /// Blob and file storage.
    Storage,
    /// Structured logging sink.
    Logger,
    /// Analytics event recording.
    Analytics,
    /// Platform event bus.
    EventBus,
    /// Cross-plugin invocation.
    Invoke,
    /// Build and run artifacts.
    Artifacts,
}

impl AdapterKind {
    /// Returns the wire name of the adapter kind.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::VectorStore => "vectorStore",
            Self::Cache => "cache",
            Self::Llm => "llm",
            Self::Embeddings => "embeddings",
            Self::Storage => "storage",
            Self::Logger => "logger",
            Self::Analytics => "analytics",
            Self::EventBus => "eventBus",
            Self::Invoke => "invoke",
            Self::Artifacts => "artifacts",
        }
    }
}

impl std::fmt::Display for AdapterKind {
    fn fmt(&self, formatter: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        formatter.write_str(self.as_str())
    }
}

/// Caller-side context propagated alongside a call.
///
/// Every field is optional; the transport forwards the context verbatim and
/// never inspects it.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CallContext {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    trace_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    session_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    plugin_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    workspace_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    tenant_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    permissions: Option<Vec<String>>,
}

impl CallContext {
    /// Creates an empty context.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Sets the trace id.
    #[must_use]
    pub fn with_trace_id(mut self, trace_id: impl Into<String>) -> Self {
        self.trace_id = Some(trace_id.into());
        self
    }

    /// Sets the session id.
    #[must_use]
    pub fn with_session_id(mut self, session_id: impl Into<String>) -> Self {
        self.session_id = Some(session_id.into());
        self
    }

    /// Sets the plugin id.
    #[must_use]
    pub fn with_plugin_id(mut self, plugin_id: impl Into<String>) -> Self {
        self.plugin_id = Some(plugin_id.into());
        self
    }

    /// Sets the workspace id.
    #[must_use]
    pub fn with_workspace_id(mut self, workspace_id: impl Into<String>) -> Self {
        self.workspace_id = Some(workspace_id.into());
        self
    }

    /// Sets the tenant id.
    #[must_use]
    pub fn with_tenant_id(mut self, tenant_id: impl Into<String>) -> Self {
        self.tenant_id = Some(tenant_id.into());
        self
    }

    /// Sets the permission hints.
    #[must_use]
    pub fn with_permissions(mut self, permissions: Vec<String>) -> Self {
        self.permissions = Some(permissions);
        self
    }

    /// Returns the trace id, when present.
    #[must_use]
    pub fn trace_id(&self) -> Option<&str> {
        self.trace_id.as_deref()
    }

    /// Returns the session id, when present.
    #[must_use]
    pub fn session_id(&self) -> Option<&str> {
        self.session_id.as_deref()
    }

    /// Returns the plugin id, when present.
    #[must_use]
    pub fn plugin_id(&self) -> Option<&str> {
        self.plugin_id.as_deref()
    }

    /// Returns the workspace id, when present.
    #[must_use]
    pub fn workspace_id(&self) -> Option<&str> {
        self.workspace_id.as_deref()
    }

    /// Returns the tenant id, when present.
    #[must_use]
    pub fn tenant_id(&self) -> Option<&str> {
        self.tenant_id.as_deref()
    }

    /// Returns the permission hints, when present.
    #[must_use]
    pub fn permissions(&self) -> Option<&[String]> {
        self.permissions.as_deref()
    }
}

/// One outbound adapter invocation. Immutable once sent.
///
/// Serialised as a single JSONL line terminated by a newline character.
///
/// # Example
///
/// ```
/// use kb_ipc_types::{AdapterCall, AdapterKind, Value};
///
/// let call = AdapterCall::new(AdapterKind::Cache, "get", vec![Value::from("k1")]);
/// assert_eq!(call.method(), "get");
/// assert!(!call.request_id().is_empty());
/// ```
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AdapterCall {
    version: u32,
    request_id: String,
    adapter: AdapterKind,
    method: String,
    #[serde(default)]
    args: Vec<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    timeout: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    context: Option<CallContext>,
}

impl AdapterCall {
    /// Creates a call with a freshly generated request id.
    #[must_use]
    pub fn new(adapter: AdapterKind, method: impl Into<String>, args: Vec<Value>) -> Self {
        Self {
            version: PROTOCOL_VERSION,
            request_id: Uuid::new_v4().to_string(),
            adapter,
            method: method.into(),
            args,
            timeout: None,
            context: None,
        }
    }

    /// Replaces the generated request id with a caller-supplied one.
    #[must_use]
    pub fn with_request_id(mut self, request_id: impl Into<String>) -> Self {
        self.request_id = request_id.into();
        self
    }

    /// Sets the per-call timeout.
    #[must_use]
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(u64::try_from(timeout.as_millis()).unwrap_or(u64::MAX));
        self
    }

    /// Attaches a call context.
    #[must_use]
    pub fn with_context(mut self, context: CallContext) -> Self {
        self.context = Some(context);
        self
    }

    /// Returns the protocol version stamped on the envelope.
    #[must_use]
    pub const fn version(&self) -> u32 {
        self.version
    }

    /// Returns the request id.
    #[must_use]
    pub const fn request_id(&self) -> &str {
        self.request_id.as_str()
    }

    /// Returns the target adapter kind.
    #[must_use]
    pub const fn adapter(&self) -> AdapterKind {
        self.adapter
    }

    /// Returns the method name.
    #[must_use]
    pub const fn method(&self) -> &str {
        self.method.as_str()
    }

    /// Returns the ordered argument list.
    #[must_use]
    pub fn args(&self) -> &[Value] {
        &self.args
    }

    /// Returns the per-call timeout, when set.
    #[must_use]
    pub fn timeout(&self) -> Option<Duration> {
        self.timeout.map(Duration::from_millis)
    }

    /// Returns the call context, when present.
    #[must_use]
    pub const fn context(&self) -> Option<&CallContext> {
        self.context.as_ref()
    }

    /// Validates that required fields are present and non-empty.
    ///
    /// # Errors
    ///
    /// Returns [`EnvelopeError`] if the request id or method is empty or
    /// contains only whitespace.
    pub fn validate(&self) -> Result<(), EnvelopeError> {
        if self.request_id.trim().is_empty() {
            return Err(EnvelopeError::MissingRequestId);
        }
        if self.method.trim().is_empty() {
            return Err(EnvelopeError::MissingMethod);
        }
        Ok(())
    }
}

/// One inbound reply, echoing the request id of the call it answers.
///
/// Exactly one of `result` and `error` is meaningfully populated; a response
/// carrying both resolves in favour of the error.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AdapterResponse {
    request_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    result: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    error: Option<ErrorValue>,
}

impl AdapterResponse {
    /// Creates a successful response carrying a result value.
    #[must_use]
    pub fn success(request_id: impl Into<String>, result: Value) -> Self {
        Self {
            request_id: request_id.into(),
            result: Some(result),
            error: None,
        }
    }

    /// Creates a failed response carrying a serialized error.
    #[must_use]
    pub fn failure(request_id: impl Into<String>, error: ErrorValue) -> Self {
        Self {
            request_id: request_id.into(),
            result: None,
            error: Some(error),
        }
    }

    /// Returns the request id this response answers.
    #[must_use]
    pub const fn request_id(&self) -> &str {
        self.request_id.as_str()
    }

    /// Returns the result value, when the call succeeded.
    #[must_use]
    pub const fn result(&self) -> Option<&Value> {
        self.result.as_ref()
    }

    /// Returns the serialized error, when the call failed.
    #[must_use]
    pub const fn error(&self) -> Option<&ErrorValue> {
        self.error.as_ref()
    }

    /// Consumes the response into the caller-facing outcome.
    ///
    /// The error wins when both sides are populated; a response carrying
    /// neither resolves to [`Value::Null`].
    #[must_use]
    pub fn into_outcome(self) -> Result<Value, ErrorValue> {
        match (self.result, self.error) {
            (_, Some(error)) => Err(error),
            (Some(result), None) => Ok(result),
            (None, None) => Ok(Value::Null),
        }
    }
}

/// Envelope shapes carried on the wire, discriminated by the `type` field.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum WireMessage {
    /// An outbound adapter invocation.
    #[serde(rename = "adapter:call")]
    Call(AdapterCall),
    /// A reply to a previously sent call.
    #[serde(rename = "adapter:response")]
    Response(AdapterResponse),
}

/// Structural problems with an envelope, caught before transmission.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum EnvelopeError {
    /// The request id is empty.
    #[error("call envelope has an empty request id")]
    MissingRequestId,
    /// The method name is empty.
    #[error("call envelope has an empty method name")]
    MissingMethod,
}
