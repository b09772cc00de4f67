pub mod room;
pub mod registry;

pub use room::*;
pub use registry::*;
