//! Reader Render Library
//!
//! PDF page orchestration: cancellable renders behind a backend trait, a
//! page cache keyed by scale and layers with neighbour prefetch, progressive
//! preview and crisp display, and weighted reading progress.

pub mod fenwick;
pub mod page_cache;
pub mod progress;
pub mod progressive;
pub mod renderer;

#[cfg(test)]
mod test_support;

pub use fenwick::FenwickTree;
pub use page_cache::{PageAcquisition, PageKey, PageOwner, PdfPageCache, ViewId};
pub use progress::{ProgressIndex, DEFAULT_BASE_WEIGHT};
pub use progressive::{DisplayState, PageView, ProgressCallback};
pub use renderer::{
    render_page, PageRenderer, RenderError, RenderResult, RenderTask, RenderedPage, Viewport,
};
