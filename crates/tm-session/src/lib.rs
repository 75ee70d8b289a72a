pub mod backend;
pub mod command;
pub mod error;
#[cfg(any(test, feature = "testing"))]
pub mod memory;
pub mod script;

pub use backend::*;
pub use command::*;
pub use error::*;
#[cfg(any(test, feature = "testing"))]
pub use memory::*;
pub use script::*;
