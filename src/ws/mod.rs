pub mod gateway;
pub mod session;

pub use gateway::*;
pub use session::*;
