//! App-layer multiplexing for hublink.
//!
//! Many clients and services share one link. Each registered endpoint gets a
//! small [`Handle`]; datagrams carry a 6-byte [`AppHeader`] naming the handle,
//! message type, transaction id and command. This crate routes inbound
//! datagrams to endpoints, correlates responses with the requests that caused
//! them, synthesizes [`ErrorCode::Timeout`] responses for requests the peer
//! never answers, and fans link resets out to every endpoint.
//!
//! ```ignore
//! let (host_link, hub_link) = MemoryLink::pair();
//! let app = AppContext::new(AppConfig::default(), Arc::new(host_link.clone()))?;
//! let worker = AppWorker::spawn(app.clone())?;
//! host_link.attach(worker.link_handler());
//! ```

pub mod config;
pub mod context;
pub mod dispatch;
pub mod endpoint;
pub mod error;
pub mod header;
pub mod loopback;
pub mod registry;
pub mod reset;
pub mod tracker;
pub mod worker;

#[cfg(test)]
mod test_support;

pub use config::AppConfig;
pub use context::AppContext;
pub use dispatch::DispatchOutcome;
pub use endpoint::{Endpoint, EndpointContext, EndpointDescriptor, EndpointKind, Version};
pub use error::{AppError, Result};
pub use header::{
    AppHeader, AppMessage, ErrorCode, Handle, MessageType, APP_HEADER_LEN, HANDLE_LOOPBACK,
    HANDLE_NEGOTIATED_RANGE_START, HANDLE_NONE,
};
pub use loopback::{LoopbackClient, LoopbackService, LOOPBACK_ECHO, LOOPBACK_UUID};
pub use registry::{EndpointRegistry, RegisteredEndpoint};
pub use tracker::{
    ExpiredRequest, IncomingRequestState, OutgoingRequestState, ResponseMatch, TransactionId,
    TransactionTracker,
};
pub use worker::{AppWorker, WorkItem, WorkQueue};
