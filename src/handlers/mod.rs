pub mod health;
pub mod collaborators;
pub mod diagnostics;

pub use health::*;
pub use collaborators::*;
pub use diagnostics::*;
