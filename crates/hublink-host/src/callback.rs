use std::fmt;
use std::sync::Arc;

/// Metadata of one app running on the hub.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NanoappInfo {
    pub app_id: u64,
    pub app_version: u32,
    pub enabled: bool,
    pub permissions: Vec<String>,
}

/// A message from a hub app to a host endpoint.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ContextHubMessage {
    pub nanoapp_id: u64,
    /// Mutated id on the way in; restored to the client's own id before
    /// delivery.
    pub host_endpoint_id: u16,
    pub message_type: u32,
    pub message_body: Vec<u8>,
    pub permissions: Vec<String>,
}

/// Hub-wide events delivered to connected clients.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum AsyncEventType {
    Restarted,
}

/// Callbacks a host client registers to receive hub traffic.
///
/// Invoked without any manager lock held; implementations may call back
/// into the manager.
pub trait ContextHubCallback: Send + Sync {
    fn handle_nanoapp_info(&self, apps: &[NanoappInfo]);

    fn handle_context_hub_message(&self, message: &ContextHubMessage, permissions: &[String]);

    /// Terminal result of a load or unload.
    fn handle_transaction_result(&self, transaction_id: u32, success: bool);

    fn handle_context_hub_async_event(&self, event: AsyncEventType);
}

/// Shared handle to a registered callback. Identity is pointer identity.
pub type CallbackRef = Arc<dyn ContextHubCallback>;

pub(crate) fn same_callback(a: &CallbackRef, b: &CallbackRef) -> bool {
    Arc::ptr_eq(a, b)
}

pub(crate) struct DebugCallback<'a>(pub(crate) &'a Option<CallbackRef>);

impl fmt::Debug for DebugCallback<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.0 {
            Some(callback) => write!(f, "Some({:p})", Arc::as_ptr(callback)),
            None => f.write_str("None"),
        }
    }
}
