//! Progressive page display
//!
//! Zooming a page is a two-stage load:
//! 1. A preview rendered at a fraction of the target scale is shown as soon
//!    as it arrives
//! 2. The crisp render at the target scale replaces it
//!
//! Every zoom bumps the view's render version. Results that arrive for an
//! older version are discarded and their cache hold released, unless the
//! same page key is on screen or still wanted by the current version.

use std::cell::RefCell;
use std::rc::Rc;

use futures::future::{self, LocalBoxFuture};
use futures::FutureExt;
use reader_cache::CacheError;
use reader_scheduler::AbortController;

use crate::page_cache::{PageKey, PdfPageCache, ViewId};
use crate::renderer::{PageRenderer, RenderedPage};

/// What a view currently shows
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DisplayState {
    /// Nothing is displayed yet
    NotLoaded,

    /// A low-resolution preview is displayed
    PreviewLoaded,

    /// The render at the requested scale is displayed (final state)
    CrispLoaded,
}

/// Called whenever a view displays a new render
pub type ProgressCallback<R> = Rc<dyn Fn(PageKey, DisplayState, &RenderedPage<R>)>;

struct ViewState<R: PageRenderer> {
    /// Incremented by every zoom and by close
    version: u64,

    /// Keys the current version is still waiting for
    requested: Vec<PageKey>,

    displayed: Option<Rc<RenderedPage<R>>>,

    display_state: DisplayState,

    /// Aborted when the view closes
    controller: AbortController,
}

impl<R: PageRenderer> ViewState<R> {
    fn displayed_key(&self) -> Option<PageKey> {
        self.displayed.as_ref().map(|page| page.key)
    }

    /// Whether a hold on `key` must survive a discarded result
    fn keeps(&self, key: &PageKey) -> bool {
        self.displayed_key().as_ref() == Some(key) || self.requested.contains(key)
    }
}

/// One page displayed through a [`PdfPageCache`]
pub struct PageView<R: PageRenderer> {
    id: ViewId,
    page_number: usize,
    text_layer: bool,
    annotation_layer: bool,
    cache: PdfPageCache<R>,
    state: Rc<RefCell<ViewState<R>>>,
    callback: Option<ProgressCallback<R>>,
}

impl<R: PageRenderer> Clone for PageView<R> {
    fn clone(&self) -> Self {
        Self {
            id: self.id,
            page_number: self.page_number,
            text_layer: self.text_layer,
            annotation_layer: self.annotation_layer,
            cache: self.cache.clone(),
            state: self.state.clone(),
            callback: self.callback.clone(),
        }
    }
}

impl<R: PageRenderer> PageView<R> {
    /// Create a view of `page_number` with both layers enabled
    pub fn new(cache: &PdfPageCache<R>, page_number: usize) -> Self {
        Self {
            id: cache.new_view(),
            page_number,
            text_layer: true,
            annotation_layer: true,
            cache: cache.clone(),
            state: Rc::new(RefCell::new(ViewState {
                version: 0,
                requested: Vec::new(),
                displayed: None,
                display_state: DisplayState::NotLoaded,
                controller: AbortController::new(),
            })),
            callback: None,
        }
    }

    /// Choose which layers renders include
    pub fn with_layers(mut self, text_layer: bool, annotation_layer: bool) -> Self {
        self.text_layer = text_layer;
        self.annotation_layer = annotation_layer;
        self
    }

    /// Invoke `callback` for every render the view displays
    pub fn with_callback(mut self, callback: ProgressCallback<R>) -> Self {
        self.callback = Some(callback);
        self
    }

    /// Identity of the view's cache holds
    pub fn id(&self) -> ViewId {
        self.id
    }

    /// Displayed page number
    pub fn page_number(&self) -> usize {
        self.page_number
    }

    /// Current display state
    pub fn display_state(&self) -> DisplayState {
        self.state.borrow().display_state
    }

    /// The render currently on screen
    pub fn displayed(&self) -> Option<Rc<RenderedPage<R>>> {
        self.state.borrow().displayed.clone()
    }

    /// Key of the render currently on screen
    pub fn displayed_key(&self) -> Option<PageKey> {
        self.state.borrow().displayed_key()
    }

    /// Current render version
    pub fn version(&self) -> u64 {
        self.state.borrow().version
    }

    fn key(&self, scale: f32) -> PageKey {
        PageKey::new(self.page_number, scale).with_layers(self.text_layer, self.annotation_layer)
    }

    fn is_current(&self, version: u64) -> bool {
        self.state.borrow().version == version
    }

    /// Display the page at `scale`
    ///
    /// A preview at `scale × preview_scale` is shown first unless the crisp
    /// render is already cached. Resolves to the display state once this
    /// zoom finishes or is superseded by a newer one.
    pub fn render_at(
        &self,
        scale: f32,
    ) -> LocalBoxFuture<'static, Result<DisplayState, CacheError>> {
        let crisp_key = self.key(scale);
        let preview_key = Some(self.key(scale * self.cache.preview_scale())).filter(|preview| {
            preview.scale() > 0.0
                && *preview != crisp_key
                && self.cache.resources().get(&crisp_key).is_none()
        });

        let (version, signal) = {
            let mut state = self.state.borrow_mut();
            state.version += 1;
            if state.displayed_key() == Some(crisp_key) {
                // Whatever is on screen already has the requested scale
                state.requested.clear();
                state.display_state = DisplayState::CrispLoaded;
                return future::ready(Ok(DisplayState::CrispLoaded)).boxed_local();
            }
            state.requested = preview_key.into_iter().chain([crisp_key]).collect();
            (state.version, state.controller.signal())
        };

        let view = self.clone();
        async move {
            if let Some(preview_key) = preview_key {
                match view.cache.acquire_page(view.id, preview_key, &signal).await {
                    Ok(page) => view.offer(version, page, DisplayState::PreviewLoaded),
                    Err(err) => {
                        tracing::debug!(key = %preview_key, error = %err, "preview render failed");
                        view.discard(version, preview_key);
                    }
                }
                if !view.is_current(version) {
                    return Ok(view.display_state());
                }
            }

            match view.cache.acquire_page(view.id, crisp_key, &signal).await {
                Ok(page) => {
                    view.offer(version, page, DisplayState::CrispLoaded);
                    Ok(view.display_state())
                }
                Err(err) => {
                    let current = view.is_current(version);
                    view.discard(version, crisp_key);
                    if current {
                        Err(err)
                    } else {
                        Ok(view.display_state())
                    }
                }
            }
        }
        .boxed_local()
    }

    /// Show `page` if `version` is still current, otherwise drop it
    fn offer(&self, version: u64, page: Rc<RenderedPage<R>>, display_state: DisplayState) {
        let key = page.key;
        let replaced = {
            let mut state = self.state.borrow_mut();
            if state.version != version {
                None
            } else {
                state.requested.retain(|requested| *requested != key);
                let previous = state.displayed.replace(page.clone()).map(|page| page.key);
                state.display_state = display_state;
                Some(previous.filter(|previous| !state.keeps(previous)))
            }
        };

        match replaced {
            None => {
                tracing::debug!(%key, "discarding stale render");
                self.discard(version, key);
            }
            Some(previous) => {
                if let Some(previous) = previous {
                    self.cache.release_page(self.id, &previous);
                }
                if let Some(callback) = &self.callback {
                    callback(key, display_state, &page);
                }
            }
        }
    }

    /// Release the hold on `key` unless the view still needs it
    fn discard(&self, version: u64, key: PageKey) {
        let keep = {
            let mut state = self.state.borrow_mut();
            if state.version == version {
                state.requested.retain(|requested| *requested != key);
            }
            state.keeps(&key)
        };
        if !keep {
            self.cache.release_page(self.id, &key);
        }
    }

    /// Abort pending renders and release every hold of the view
    pub fn close(&self) {
        let controller = {
            let mut state = self.state.borrow_mut();
            state.version += 1;
            state.requested.clear();
            state.displayed = None;
            state.display_state = DisplayState::NotLoaded;
            std::mem::replace(&mut state.controller, AbortController::new())
        };
        controller.abort();
        self.cache.release_view(self.id);
    }
}
