use std::path::PathBuf;

use uuid::Uuid;

use crate::client_id::{ClientId, Pid};
use crate::pending::TransactionKind;

/// Errors surfaced by the host-side client manager.
#[derive(Debug, thiserror::Error)]
pub enum HostError {
    /// No connected client is registered under the pid.
    #[error("no client registered for pid {0}")]
    UnknownPid(Pid),

    /// Every assignable client id is taken.
    #[error("client ids exhausted ({max_clients} clients)")]
    ClientIdsExhausted { max_clients: usize },

    /// The liveness monitor refused to watch the client.
    #[error("failed to link liveness monitor for pid {0}")]
    LinkFailed(Pid),

    /// The uuid/client id mapping could not be written.
    #[error("failed to persist client mapping to {path}: {source}")]
    Persist {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    /// The mapping could not be serialized.
    #[error("json error: {0}")]
    Json(#[from] serde_json::Error),

    /// The endpoint id is outside the caller's allowed range.
    #[error("endpoint id {endpoint_id:#06x} out of range for client {client_id} (limit {limit:#06x})")]
    EndpointIdOutOfRange {
        client_id: ClientId,
        endpoint_id: u16,
        limit: u16,
    },

    /// The endpoint id was never registered by the caller.
    #[error("endpoint id {endpoint_id:#06x} not registered by pid {pid}")]
    EndpointNotRegistered { pid: Pid, endpoint_id: u16 },

    /// A load or unload is already in flight and has not timed out.
    #[error("{kind:?} transaction {transaction_id} from client {client_id} still pending")]
    TransactionPending {
        kind: TransactionKind,
        transaction_id: u32,
        client_id: ClientId,
    },

    /// The uuid is already bound to a different client id.
    #[error("uuid {uuid} already mapped to client id {client_id}")]
    UuidConflict { uuid: Uuid, client_id: ClientId },
}

pub type Result<T> = std::result::Result<T, HostError>;
