pub mod actor;
pub mod allocator;
pub mod buffer;
pub mod metrics;
pub mod service;
pub mod sweeper;

pub use actor::*;
pub use allocator::*;
pub use buffer::*;
pub use metrics::*;
pub use service::*;
pub use sweeper::*;
