//! Multiplexed request/response transactions between a host and a sensor hub.
//!
//! # Crate Structure
//!
//! - [`transport`]: link boundary and reference links (in-memory, byte stream)
//! - [`app`]: endpoint registry, dispatch and transaction correlation
//! - [`host`]: host client identity and endpoint namespace (behind `host` feature)
//! - [`logging`]: `tracing` subscriber bootstrap (behind `logging` feature)

/// Re-export transport types.
pub mod transport {
    pub use hublink_transport::*;
}

/// Re-export App-layer types.
pub mod app {
    pub use hublink_app::*;
}

/// Re-export host client management types (requires `host` feature).
#[cfg(feature = "host")]
pub mod host {
    pub use hublink_host::*;
}

#[cfg(feature = "logging")]
pub mod logging;
