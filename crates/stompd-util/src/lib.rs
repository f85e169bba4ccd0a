//! Shared data structures for the stompd broker: owned byte strings, a
//! randomized-keyed byte map, and a slot-reusing container.

mod bytestring;
mod bytemap;
mod macros;
mod slab;

pub use bytemap::ByteMap;
pub use bytestring::ByteString;
pub use slab::Slab;
pub use tracing;
