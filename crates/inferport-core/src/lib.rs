pub mod artifact;
pub mod backend;
pub mod binding;
pub mod error;
pub mod graph;
pub mod optimizer;
pub mod runtime;
pub mod spec;
pub mod tensor;

pub use artifact::*;
pub use backend::*;
pub use binding::*;
pub use error::*;
pub use graph::*;
pub use optimizer::*;
pub use runtime::*;
pub use spec::*;
pub use tensor::*;
