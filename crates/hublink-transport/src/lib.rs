//! Transport boundary for hublink.
//!
//! The App layer never interprets link-level framing. It hands complete
//! datagrams to a [`Transport`] and receives datagrams, resets and link-up
//! signals through a [`LinkHandler`].
//!
//! Two reference links are provided:
//! - [`MemoryLink`]: an in-process pair, used by tests and demos
//! - [`StreamLink`]: magic + length-prefixed datagrams over any byte stream

pub mod codec;
pub mod error;
pub mod memory;
pub mod reader;
pub mod stream;
pub mod traits;
pub mod writer;

pub use codec::{decode_frame, encode_frame, LinkConfig, DEFAULT_MAX_PAYLOAD, HEADER_SIZE};
pub use error::{Result, TransportError};
pub use memory::MemoryLink;
pub use reader::FrameReader;
pub use stream::{spawn_reader, StreamLink};
pub use traits::{LinkHandler, Transport};
pub use writer::FrameWriter;
