pub mod memory;
#[cfg(feature = "scylladb")]
pub mod scylla;
pub mod traits;

pub use memory::*;
#[cfg(feature = "scylladb")]
pub use scylla::*;
pub use traits::*;
