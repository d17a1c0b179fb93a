//! Wire protocol between daemons.
//!
//! - JSON [`WireMessage`]s for heartbeats and broadcast envelopes
//! - Bincode frames (optionally zlib-compressed) inside broadcast envelopes

pub mod codec;
pub mod messages;

pub use codec::{CodecError, MAX_MESSAGE_SIZE, compress_block, decompress_block};
pub use messages::{RbcastEnvelope, WireMessage};
