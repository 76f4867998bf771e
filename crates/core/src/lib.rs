//! Reader Core Library
//!
//! Spine section loading for reflowable books: a bounded working set of
//! loaded sections with counted pins and cancellable neighbour prefetch.

pub mod logging;
pub mod spine;

pub use logging::init_logging;
pub use spine::{RequestFn, SpineError, SpineLoader, SpineSection};
