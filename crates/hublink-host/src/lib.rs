//! Host-side client management for hublink.
//!
//! Several host processes share one hub. [`ClientManager`] gives each of
//! them a stable [`ClientId`] keyed by a uuid and persisted across restarts,
//! rewrites their endpoint ids into one shared namespace, routes hub
//! messages back to the owning client, and allows at most one app load or
//! unload in flight at a time.
//!
//! ```ignore
//! let config = ClientManagerConfig::with_mapping_path("/data/hublink/clients.json");
//! let manager = ClientManager::with_process_watcher(config, Duration::from_secs(1));
//! let client_id = manager.register_callback(pid, callback, uuid)?;
//! manager.register_endpoint_id(pid, 3)?;
//! let on_wire = manager.mutate_endpoint_id_from_host(pid, 3)?;
//! ```

pub mod callback;
pub mod client_id;
pub mod config;
pub mod endpoint;
pub mod error;
pub mod liveness;
pub mod manager;
pub mod mapping;
pub mod pending;

pub use callback::{AsyncEventType, CallbackRef, ContextHubCallback, ContextHubMessage, NanoappInfo};
pub use client_id::{
    ClientId, Pid, DEFAULT_CLIENT_ID, HAL_CLIENT_ID, SYSTEM_CLIENT_ID, VENDOR_CLIENT_ID_MAX,
    VENDOR_CLIENT_ID_MIN,
};
pub use config::{ClientManagerConfig, SYSTEM_SERVER_UUID};
pub use endpoint::{
    BROADCAST_HOST_ENDPOINT_ID, MUTATION_BIT, SYSTEM_ENDPOINT_ID_LIMIT, VENDOR_ENDPOINT_ID_LIMIT,
};
pub use error::{HostError, Result};
pub use liveness::{process_alive, LivenessMonitor, ProcessWatcher};
pub use manager::{ClientManager, HalClient};
pub use mapping::ClientIdMapping;
pub use pending::{
    FragmentedLoadTransaction, LoadFragment, PendingOperationTracker, PendingTransaction,
    TransactionKind,
};
