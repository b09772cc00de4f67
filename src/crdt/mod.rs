pub mod clock;
pub mod files;
pub mod activity;
pub mod document;

pub use clock::*;
pub use files::*;
pub use activity::*;
pub use document::*;
