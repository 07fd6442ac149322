//! Client id space.
//!
//! Ids are 9 bits wide so that a client id fits between the mutation bit and
//! the 6-bit endpoint id of a mutated host endpoint.

/// Stable identity of one logical host client.
pub type ClientId = u16;

/// Process id of a host client.
pub type Pid = i32;

/// Unassigned client id.
pub const DEFAULT_CLIENT_ID: ClientId = 0;

/// Id given to the trusted system client when the mapping has none for it.
pub const SYSTEM_CLIENT_ID: ClientId = 1;

/// Lowest id handed to ordinary clients.
pub const VENDOR_CLIENT_ID_MIN: ClientId = 2;

/// Id of the HAL itself. Never assigned.
pub const HAL_CLIENT_ID: ClientId = 0x1ff;

/// Highest id handed to ordinary clients.
pub const VENDOR_CLIENT_ID_MAX: ClientId = HAL_CLIENT_ID - 1;

/// Whether `client_id` may be handed to a client.
pub fn is_assignable(client_id: ClientId) -> bool {
    client_id != DEFAULT_CLIENT_ID && client_id < HAL_CLIENT_ID
}
