//! Host endpoint id namespace.
//!
//! Every host process numbers its endpoints from zero. Before an id reaches
//! the shared link it is tagged with the owning client's id:
//!
//! ```text
//!  15   14 ........ 6   5 ..... 0
//! ┌───┬──────────────┬──────────┐
//! │ 1 │  client id   │ endpoint │
//! └───┴──────────────┴──────────┘
//! ```
//!
//! The trusted system client is exempt and keeps the ids below `0x8000`.

use crate::client_id::ClientId;

/// Marks a mutated endpoint id.
pub const MUTATION_BIT: u16 = 0x8000;

/// Position of the client id inside a mutated endpoint id.
pub const CLIENT_ID_SHIFT: u32 = 6;

/// Ordinary clients may only use endpoint ids below this.
pub const VENDOR_ENDPOINT_ID_LIMIT: u16 = 1 << CLIENT_ID_SHIFT;

/// The system client may only use endpoint ids below this.
pub const SYSTEM_ENDPOINT_ID_LIMIT: u16 = MUTATION_BIT;

/// Host endpoint id addressing every connected client.
pub const BROADCAST_HOST_ENDPOINT_ID: u16 = 0xffff;

const ENDPOINT_ID_MASK: u16 = VENDOR_ENDPOINT_ID_LIMIT - 1;
const CLIENT_ID_MASK: u16 = (MUTATION_BIT - 1) >> CLIENT_ID_SHIFT;

/// Tag `endpoint_id` with `client_id`.
///
/// `endpoint_id` must be below [`VENDOR_ENDPOINT_ID_LIMIT`]; higher bits are
/// masked off.
pub fn mutate(endpoint_id: u16, client_id: ClientId) -> u16 {
    MUTATION_BIT | ((client_id & CLIENT_ID_MASK) << CLIENT_ID_SHIFT) | (endpoint_id & ENDPOINT_ID_MASK)
}

/// Whether `endpoint_id` carries a client tag.
pub fn is_mutated(endpoint_id: u16) -> bool {
    endpoint_id != BROADCAST_HOST_ENDPOINT_ID && endpoint_id & MUTATION_BIT != 0
}

/// The id the originating process knows. Unmutated ids pass through.
pub fn original_endpoint_id(endpoint_id: u16) -> u16 {
    if is_mutated(endpoint_id) {
        endpoint_id & ENDPOINT_ID_MASK
    } else {
        endpoint_id
    }
}

/// The client that owns a mutated id; `None` for unmutated ids.
pub fn owning_client_id(endpoint_id: u16) -> Option<ClientId> {
    is_mutated(endpoint_id).then(|| (endpoint_id & !MUTATION_BIT) >> CLIENT_ID_SHIFT)
}
