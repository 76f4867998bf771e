//! Rendered page cache with view ownership and neighbour prefetch
//!
//! Pages are keyed by page number, render scale and layer flags, so the same
//! page at two zoom levels is two independently evictable entries. Views
//! hold pages under [`PageOwner::View`]; each prefetch pass holds its pages
//! under [`PageOwner::Prefetch`] with the pass's epoch, so cancelling a pass
//! releases exactly the pages it retained.
//!
//! A backend render belongs to its cache entry, not to whoever asked first:
//! it is aborted only once every hold on the page is gone. A caller's abort
//! signal just stops that caller waiting.

use std::cell::{Cell, Ref, RefCell};
use std::fmt;
use std::rc::Rc;

use futures::future::{self, Either, LocalBoxFuture};
use futures::FutureExt;
use reader_cache::{CacheConfig, CacheError, CacheStats, ResourceCache};
use reader_scheduler::{yield_now, AbortController, AbortError, AbortSignal, Epoch, EpochCounter};

use crate::progress::{ProgressIndex, DEFAULT_BASE_WEIGHT};
use crate::renderer::{render_page, PageRenderer, RenderError, RenderedPage};

/// Cache key of a rendered page
///
/// The scale is stored in thousandths so keys hash and compare exactly.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct PageKey {
    /// 1-based page number
    pub page_number: usize,

    scale_milli: u32,

    /// Whether the text layer is built
    pub text_layer: bool,

    /// Whether the annotation layer is built
    pub annotation_layer: bool,
}

impl PageKey {
    /// Key for `page_number` at `scale` with both layers
    pub fn new(page_number: usize, scale: f32) -> Self {
        Self {
            page_number,
            scale_milli: quantize_scale(scale),
            text_layer: true,
            annotation_layer: true,
        }
    }

    /// Set the layer flags
    pub fn with_layers(mut self, text_layer: bool, annotation_layer: bool) -> Self {
        self.text_layer = text_layer;
        self.annotation_layer = annotation_layer;
        self
    }

    /// Same key for another page
    pub fn with_page(mut self, page_number: usize) -> Self {
        self.page_number = page_number;
        self
    }

    /// Same key at another scale
    pub fn with_scale(mut self, scale: f32) -> Self {
        self.scale_milli = quantize_scale(scale);
        self
    }

    /// Render scale, rounded to thousandths
    pub fn scale(&self) -> f32 {
        self.scale_milli as f32 / 1000.0
    }
}

impl fmt::Display for PageKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "page {} @ {:.3}", self.page_number, self.scale())?;
        if self.text_layer {
            write!(f, " +text")?;
        }
        if self.annotation_layer {
            write!(f, " +annotations")?;
        }
        Ok(())
    }
}

fn quantize_scale(scale: f32) -> u32 {
    if scale.is_finite() && scale > 0.0 {
        (scale * 1000.0).round() as u32
    } else {
        0
    }
}

/// Identity of a view displaying pages
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ViewId(u64);

impl fmt::Display for ViewId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "view:{}", self.0)
    }
}

/// Parent key for page holds
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum PageOwner {
    /// A view displaying pages
    View(ViewId),

    /// One prefetch pass
    Prefetch(Epoch),

    /// Pages owned by another page entry
    Page(PageKey),
}

impl From<PageKey> for PageOwner {
    fn from(key: PageKey) -> Self {
        PageOwner::Page(key)
    }
}

type PageResources<R> = ResourceCache<PageKey, Rc<RenderedPage<R>>, PageOwner>;

/// Future returned by [`PdfPageCache::acquire_page`]
pub type PageAcquisition<R> = LocalBoxFuture<'static, Result<Rc<RenderedPage<R>>, CacheError>>;

struct PrefetchPass {
    epoch: Epoch,
    controller: AbortController,
}

struct PageCacheInner<R: PageRenderer> {
    renderer: Rc<R>,
    pages: PageResources<R>,
    progress: Rc<RefCell<ProgressIndex>>,
    epochs: EpochCounter,
    prefetch: RefCell<Option<PrefetchPass>>,
    next_view: Cell<u64>,
    preview_scale: f32,
    prefetch_distance: usize,
}

/// Page cache for one PDF document
///
/// Cloning yields another handle to the same cache.
pub struct PdfPageCache<R: PageRenderer> {
    inner: Rc<PageCacheInner<R>>,
}

impl<R: PageRenderer> Clone for PdfPageCache<R> {
    fn clone(&self) -> Self {
        Self {
            inner: self.inner.clone(),
        }
    }
}

impl<R: PageRenderer> PdfPageCache<R> {
    /// Create a cache for `renderer`'s document
    ///
    /// Page retention, preview scale and prefetch distance come from
    /// `config`. The progress base weight is the first page's area.
    pub fn new(renderer: Rc<R>, config: &CacheConfig) -> Self {
        let backend = renderer.clone();
        let pages = ResourceCache::with_revoke(
            config.pages,
            move |page: Rc<RenderedPage<R>>, _key: &PageKey| {
                backend
                    .release_image(page.image.clone())
                    .map_err(anyhow::Error::from)
            },
        );

        let page_count = renderer.page_count();
        let base_weight = match page_count {
            0 => DEFAULT_BASE_WEIGHT,
            _ => renderer
                .page_size(1)
                .map(|size| size.area())
                .unwrap_or(DEFAULT_BASE_WEIGHT),
        };

        Self {
            inner: Rc::new(PageCacheInner {
                renderer,
                pages,
                progress: Rc::new(RefCell::new(ProgressIndex::new(page_count, base_weight))),
                epochs: EpochCounter::new(),
                prefetch: RefCell::new(None),
                next_view: Cell::new(0),
                preview_scale: config.preview_scale,
                prefetch_distance: config.prefetch_distance,
            }),
        }
    }

    /// The rendering backend
    pub fn renderer(&self) -> &Rc<R> {
        &self.inner.renderer
    }

    /// Number of pages in the document
    pub fn page_count(&self) -> usize {
        self.inner.renderer.page_count()
    }

    /// Scale factor applied for progressive previews
    pub fn preview_scale(&self) -> f32 {
        self.inner.preview_scale
    }

    /// Configured prefetch distance
    pub fn prefetch_distance(&self) -> usize {
        self.inner.prefetch_distance
    }

    /// Weighted progress over the document's pages
    pub fn progress(&self) -> Ref<'_, ProgressIndex> {
        self.inner.progress.borrow()
    }

    /// Underlying resource cache
    pub fn resources(&self) -> &ResourceCache<PageKey, Rc<RenderedPage<R>>, PageOwner> {
        &self.inner.pages
    }

    /// Cache statistics
    pub fn stats(&self) -> CacheStats {
        self.inner.pages.stats()
    }

    /// Allocate an identity for a new view
    pub fn new_view(&self) -> ViewId {
        let id = self.inner.next_view.get();
        self.inner.next_view.set(id + 1);
        ViewId(id)
    }

    fn acquire(&self, key: PageKey, owner: PageOwner, signal: &AbortSignal) -> PageAcquisition<R> {
        if let Err(abort) = signal.check() {
            return future::ready(Err(abort.into())).boxed_local();
        }

        let page_count = self.page_count();
        if key.page_number == 0 || key.page_number > page_count {
            let err = RenderError::PageOutOfRange {
                page: key.page_number,
                page_count,
            };
            return future::ready(Err(err.into())).boxed_local();
        }

        let renderer = self.inner.renderer.clone();
        let progress = self.inner.progress.clone();

        let acquisition = self.inner.pages.acquire(key, Some(owner), move |render_signal| {
            let render = render_page(&renderer, key, &render_signal);
            async move {
                let page = render.await.map_err(CacheError::from)?;
                progress
                    .borrow_mut()
                    .record_page_weight(key.page_number - 1, page.normalized_area());
                Ok::<_, CacheError>(Rc::new(page))
            }
        });

        let signal = signal.clone();
        async move {
            match future::select(acquisition, signal.aborted()).await {
                Either::Left((result, _)) => result,
                Either::Right(_) => Err(CacheError::Aborted(AbortError)),
            }
        }
        .boxed_local()
    }

    /// Acquire a page for `view`
    ///
    /// The view holds the page until [`release_page`](Self::release_page)
    /// or [`release_view`](Self::release_view). Acquiring the same key again
    /// for the same view does not add a second hold.
    ///
    /// An already-aborted `signal` fails before any bookkeeping. Aborting it
    /// later only ends this wait: the hold stays registered and the render
    /// keeps going for everyone else holding the page.
    pub fn acquire_page(&self, view: ViewId, key: PageKey, signal: &AbortSignal) -> PageAcquisition<R> {
        self.acquire(key, PageOwner::View(view), signal)
    }

    /// Drop `view`'s hold on `key`
    pub fn release_page(&self, view: ViewId, key: &PageKey) -> bool {
        self.inner.pages.release_child(&PageOwner::View(view), key)
    }

    /// Drop every hold of `view`
    pub fn release_view(&self, view: ViewId) -> usize {
        self.inner.pages.release_parent(&PageOwner::View(view))
    }

    /// Abort the running prefetch pass and release the pages it holds
    ///
    /// Returns the new epoch.
    pub fn cancel_prefetch(&self) -> Epoch {
        let pass = self.inner.prefetch.borrow_mut().take();
        if let Some(pass) = pass {
            pass.controller.abort();
            let released = self
                .inner
                .pages
                .release_parent(&PageOwner::Prefetch(pass.epoch));
            tracing::debug!(epoch = %pass.epoch, released, "prefetch cancelled");
        }
        self.inner.epochs.advance()
    }

    /// Number of pages held by the running prefetch pass
    pub fn prefetch_holds(&self) -> usize {
        match self.inner.prefetch.borrow().as_ref() {
            Some(pass) => self.prefetch_holds_for(pass.epoch),
            None => 0,
        }
    }

    /// Number of pages held by the prefetch pass started at `epoch`
    pub fn prefetch_holds_for(&self, epoch: Epoch) -> usize {
        self.inner.pages.children_len(&PageOwner::Prefetch(epoch))
    }

    /// Epoch the next prefetch pass would invalidate
    pub fn current_epoch(&self) -> Epoch {
        self.inner.epochs.current()
    }

    /// Neighbours of `center` in prefetch order: +1, -1, +2, -2, ...
    fn neighbor_pages(center: usize, distance: usize, page_count: usize) -> Vec<usize> {
        let mut pages = Vec::with_capacity(distance * 2);
        for offset in 1..=distance {
            if center + offset <= page_count {
                pages.push(center + offset);
            }
            if center > offset {
                pages.push(center - offset);
            }
        }
        pages
    }

    /// Render and hold up to `2 × distance` neighbours of page `center`
    ///
    /// Pages are acquired one at a time with `template`'s scale and layer
    /// flags. The previous pass is cancelled first. The result holds one
    /// slot per neighbour; failed or stale steps hold `None`.
    pub fn prefetch(
        &self,
        center: usize,
        template: PageKey,
        distance: usize,
    ) -> LocalBoxFuture<'static, Vec<Option<Rc<RenderedPage<R>>>>> {
        self.cancel_prefetch();
        let epoch = self.inner.epochs.current();
        let controller = AbortController::new();
        *self.inner.prefetch.borrow_mut() = Some(PrefetchPass {
            epoch,
            controller: controller.clone(),
        });

        let pages = Self::neighbor_pages(center, distance, self.page_count());
        let cache = self.clone();

        async move {
            let signal = controller.signal();
            let owner = PageOwner::Prefetch(epoch);
            let mut results = Vec::with_capacity(pages.len());

            for page_number in pages {
                yield_now().await;
                if !cache.inner.epochs.is_current(epoch) {
                    results.push(None);
                    continue;
                }

                let key = template.with_page(page_number);
                match cache.acquire(key, owner.clone(), &signal).await {
                    Ok(page) if cache.inner.epochs.is_current(epoch) => results.push(Some(page)),
                    Ok(_) => results.push(None),
                    Err(err) => {
                        tracing::debug!(%key, error = %err, "prefetch step skipped");
                        results.push(None);
                    }
                }
            }
            results
        }
        .boxed_local()
    }

    /// Prefetch around `center` using the configured distance
    pub fn prefetch_around(
        &self,
        center: usize,
        template: PageKey,
    ) -> LocalBoxFuture<'static, Vec<Option<Rc<RenderedPage<R>>>>> {
        self.prefetch(center, template, self.inner.prefetch_distance)
    }

    /// Cancel prefetch and revoke every cached page
    pub fn clear(&self) {
        self.cancel_prefetch();
        self.inner.pages.clear();
    }
}
