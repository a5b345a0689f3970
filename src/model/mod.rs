pub mod message;
pub mod queue;
pub mod shard;

pub use message::*;
pub use queue::*;
pub use shard::*;
