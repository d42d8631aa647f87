//! Path-expression evaluation and large-value offloading over context
//! documents.

pub mod offload;
pub mod path;
pub mod resolver;

pub use offload::{hydrate_value, offload_if_large, OffloadOutcome};
pub use path::{parse_path, PathSegment};
pub use resolver::{set_by_path, Resolution, ValueResolver};
