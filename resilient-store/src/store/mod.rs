// Resilient key-value store client

pub mod client;
pub mod codec;
pub mod transport;

pub use client::{ResilientStoreClient, SetOptions, StoreConnection};
pub use codec::{DecodedValue, ObjectBlob, SetMember, StoreValue};
pub use transport::{RedisTransport, StoreTransport};
