pub mod endpoint;
pub mod funding;
pub mod order;
pub mod stream;

pub use endpoint::*;
pub use funding::*;
pub use order::*;
pub use stream::*;
