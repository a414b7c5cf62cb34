pub mod pipeline;
pub mod session;

pub use pipeline::*;
pub use session::*;
