//! Per-request context, passed explicitly on every call.
//!
//! Nothing here is process-wide: logging, metrics and attribution read the
//! context value they were handed, so concurrent requests never observe each
//! other's identity.

/// Caller identity and capabilities for one request.
#[derive(Debug, Clone, Default)]
pub struct RequestContext {
    /// Opaque id of the contributing agent, from `x-llm-model-id`.
    pub llm_model_id: Option<String>,
    /// Whether the client advertises the elicitation capability.
    pub elicitation_supported: bool,
}

impl RequestContext {
    pub fn model_id(&self) -> &str {
        self.llm_model_id.as_deref().unwrap_or("unknown")
    }
}
