use std::path::PathBuf;
use std::time::Duration;

use uuid::Uuid;

/// Uuid the trusted system client registers with.
pub const SYSTEM_SERVER_UUID: Uuid = Uuid::from_u128(0x9a17_008d_6bf1_445a_9011_6d21_bd98_5b6c);

/// Configuration for [`crate::ClientManager`].
#[derive(Debug, Clone)]
pub struct ClientManagerConfig {
    /// Where the uuid → client id mapping is persisted.
    pub mapping_path: PathBuf,
    /// How long a load or unload may stay pending before a new one may
    /// supersede it.
    pub transaction_timeout: Duration,
    /// Uuid identifying the trusted system client.
    pub system_server_uuid: Uuid,
    /// Most distinct uuids ever assigned an id, system client included.
    pub max_clients: usize,
}

impl Default for ClientManagerConfig {
    fn default() -> Self {
        Self {
            mapping_path: PathBuf::from("hublink_clients.json"),
            transaction_timeout: Duration::from_secs(5),
            system_server_uuid: SYSTEM_SERVER_UUID,
            max_clients: 64,
        }
    }
}

impl ClientManagerConfig {
    /// Default configuration persisting to `mapping_path`.
    pub fn with_mapping_path(mapping_path: impl Into<PathBuf>) -> Self {
        Self {
            mapping_path: mapping_path.into(),
            ..Self::default()
        }
    }
}
