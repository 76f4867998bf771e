//! Page rendering backend and cancellable page renders
//!
//! The rasterizer itself lives outside this crate behind [`PageRenderer`].
//! [`render_page`] drives one backend render for a [`PageKey`], wiring an
//! [`AbortSignal`] into the backend task and making sure an image that
//! finishes while the render is being aborted is handed back to the backend
//! instead of leaking. Dropping an unfinished render cancels the backend
//! task as well.

use std::cell::RefCell;
use std::rc::Rc;

use futures::future::{self, Either, LocalBoxFuture};
use futures::FutureExt;
use reader_cache::CacheError;
use reader_scheduler::{AbortError, AbortSignal, ListenerId};
use thiserror::Error;

use crate::page_cache::PageKey;

/// Errors produced while rendering a page
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum RenderError {
    /// The render was cancelled
    #[error("render aborted")]
    Aborted,

    /// The page number is outside `1..=page_count`
    #[error("page {page} out of range (document has {page_count} pages)")]
    PageOutOfRange { page: usize, page_count: usize },

    /// The backend failed
    #[error("render backend error: {0}")]
    Backend(String),
}

impl From<AbortError> for RenderError {
    fn from(_: AbortError) -> Self {
        RenderError::Aborted
    }
}

impl From<RenderError> for CacheError {
    fn from(err: RenderError) -> Self {
        match err {
            RenderError::Aborted => CacheError::Aborted(AbortError),
            other => CacheError::creation(other),
        }
    }
}

/// Result type for render operations
pub type RenderResult<T> = Result<T, RenderError>;

/// Output dimensions of a render, in pixels
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Viewport {
    pub width: f64,
    pub height: f64,
}

impl Viewport {
    /// Create a new viewport
    pub fn new(width: f64, height: f64) -> Self {
        Self { width, height }
    }

    /// Scale both dimensions
    pub fn scaled(&self, scale: f64) -> Self {
        Self::new(self.width * scale, self.height * scale)
    }

    /// Pixel area
    pub fn area(&self) -> f64 {
        self.width * self.height
    }
}

/// An in-flight backend render
pub struct RenderTask<I> {
    /// Dimensions of the image being produced
    pub viewport: Viewport,

    /// Resolves to the rendered image
    pub result: LocalBoxFuture<'static, RenderResult<I>>,

    cancel: Option<Box<dyn FnOnce()>>,
}

impl<I> RenderTask<I> {
    /// Create a task without a cancel hook
    pub fn new(viewport: Viewport, result: LocalBoxFuture<'static, RenderResult<I>>) -> Self {
        Self {
            viewport,
            result,
            cancel: None,
        }
    }

    /// Attach the backend's cancel hook, run when the render is aborted
    pub fn with_cancel<F>(mut self, cancel: F) -> Self
    where
        F: FnOnce() + 'static,
    {
        self.cancel = Some(Box::new(cancel));
        self
    }
}

/// Rasterizer used by the page cache
///
/// Page numbers are 1-based.
pub trait PageRenderer: 'static {
    /// Handle to a rendered image; cloning must not copy pixels
    type Image: Clone + 'static;

    /// Text layer built alongside the image
    type TextLayer: 'static;

    /// Annotation layer built alongside the image
    type AnnotationLayer: 'static;

    /// Number of pages in the document
    fn page_count(&self) -> usize;

    /// Unscaled page size
    fn page_size(&self, page: usize) -> RenderResult<Viewport>;

    /// Start rendering `page` at `scale`
    fn render(&self, page: usize, scale: f32) -> RenderResult<RenderTask<Self::Image>>;

    /// Build the text layer of `page`
    fn text_layer(&self, page: usize) -> LocalBoxFuture<'static, RenderResult<Self::TextLayer>>;

    /// Build the annotation layer of `page`
    fn annotation_layer(
        &self,
        page: usize,
    ) -> LocalBoxFuture<'static, RenderResult<Self::AnnotationLayer>>;

    /// Free an image that is no longer displayed or cached
    fn release_image(&self, image: Self::Image) -> RenderResult<()>;
}

/// A rendered page with the layers its key asked for
pub struct RenderedPage<R: PageRenderer> {
    pub key: PageKey,
    pub viewport: Viewport,
    pub image: R::Image,
    pub text_layer: Option<R::TextLayer>,
    pub annotation_layer: Option<R::AnnotationLayer>,
}

impl<R: PageRenderer> RenderedPage<R> {
    /// Page area at scale 1.0, used as the page's progress weight
    pub fn normalized_area(&self) -> f64 {
        let scale = f64::from(self.key.scale());
        if scale > 0.0 {
            self.viewport.area() / (scale * scale)
        } else {
            0.0
        }
    }
}

/// Await `work` unless `signal` aborts first
async fn until_aborted<T>(
    work: LocalBoxFuture<'static, RenderResult<T>>,
    signal: &AbortSignal,
) -> RenderResult<T> {
    match future::select(work, signal.aborted()).await {
        Either::Left((result, _)) => result,
        Either::Right(_) => Err(RenderError::Aborted),
    }
}

type CancelHook = Rc<RefCell<Option<Box<dyn FnOnce()>>>>;

fn run_cancel(hook: &CancelHook) {
    let cancel = hook.borrow_mut().take();
    if let Some(cancel) = cancel {
        cancel();
    }
}

/// Ties the backend cancel hook to one render
///
/// Unsubscribes from the signal when dropped. A render dropped before its
/// backend task settled runs the hook.
struct CancelGuard {
    signal: AbortSignal,
    listener: ListenerId,
    hook: CancelHook,
    settled: bool,
}

impl CancelGuard {
    fn new(signal: &AbortSignal, cancel: Option<Box<dyn FnOnce()>>) -> Self {
        let hook: CancelHook = Rc::new(RefCell::new(cancel));
        let listener_hook = hook.clone();
        let listener = signal.subscribe(move || run_cancel(&listener_hook));
        Self {
            signal: signal.clone(),
            listener,
            hook,
            settled: false,
        }
    }
}

impl Drop for CancelGuard {
    fn drop(&mut self) {
        self.signal.unsubscribe(self.listener);
        if self.settled {
            self.hook.borrow_mut().take();
        } else {
            run_cancel(&self.hook);
        }
    }
}

/// Render the page described by `key`
///
/// Fails with [`RenderError::Aborted`] before touching the backend if
/// `signal` is already aborted. Aborting later, or dropping the returned
/// future before the backend finishes, runs the backend task's cancel hook;
/// an image that completes anyway is released through
/// [`PageRenderer::release_image`].
pub fn render_page<R: PageRenderer>(
    renderer: &Rc<R>,
    key: PageKey,
    signal: &AbortSignal,
) -> LocalBoxFuture<'static, RenderResult<RenderedPage<R>>> {
    if signal.is_aborted() {
        return future::ready(Err(RenderError::Aborted)).boxed_local();
    }

    let task = match renderer.render(key.page_number, key.scale()) {
        Ok(task) => task,
        Err(err) => return future::ready(Err(err)).boxed_local(),
    };
    let RenderTask {
        viewport,
        result,
        cancel,
    } = task;

    let mut guard = CancelGuard::new(signal, cancel);
    let renderer = renderer.clone();
    let signal = signal.clone();

    async move {
        let outcome = until_aborted(result, &signal).await;
        guard.settled = true;
        drop(guard);
        let image = match outcome {
            Ok(image) => image,
            Err(err) => return Err(err),
        };

        let page = async {
            signal.check()?;
            let text_layer = if key.text_layer {
                Some(until_aborted(renderer.text_layer(key.page_number), &signal).await?)
            } else {
                None
            };
            let annotation_layer = if key.annotation_layer {
                Some(until_aborted(renderer.annotation_layer(key.page_number), &signal).await?)
            } else {
                None
            };
            signal.check()?;
            Ok::<_, RenderError>((text_layer, annotation_layer))
        }
        .await;

        match page {
            Ok((text_layer, annotation_layer)) => Ok(RenderedPage {
                key,
                viewport,
                image,
                text_layer,
                annotation_layer,
            }),
            Err(err) => {
                tracing::debug!(page = key.page_number, error = %err, "render discarded");
                if let Err(release) = renderer.release_image(image) {
                    tracing::warn!(page = key.page_number, error = %release, "image release failed");
                }
                Err(err)
            }
        }
    }
    .boxed_local()
}
