//! The Transport layer (spec §4.1, C1): two framed TCP endpoints per
//! server — request/reply (query) and one-to-many push (publish).

pub mod client;
pub mod codec;
pub mod server;

pub use client::{PublishConnection, QueryConnection};
pub use codec::{CodecError, JsonFrameCodec};
pub use server::{PublishServer, QueryServer};
