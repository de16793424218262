pub mod dispatch;
pub mod registry;
pub mod supervisor;

pub use dispatch::EventDispatcher;
pub use registry::SubscriptionRegistry;
pub use supervisor::{StreamSupervisor, StreamSupervisorConfig};
