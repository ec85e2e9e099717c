pub mod dispatch;
pub mod error;
pub mod provider;
pub mod registry;
pub mod routine;

pub use dispatch::*;
pub use error::*;
pub use provider::*;
pub use registry::*;
pub use routine::*;
