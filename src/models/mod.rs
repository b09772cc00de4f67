pub mod collaborator;
pub mod health;
pub mod diagnostics;
pub mod messages;
pub mod error;

pub use collaborator::*;
pub use health::*;
pub use diagnostics::*;
pub use messages::*;
pub use error::*;
