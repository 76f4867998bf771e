//! In-memory page renderer for unit tests

use std::cell::{Cell, RefCell};
use std::collections::HashMap;
use std::rc::Rc;

use futures::channel::oneshot;
use futures::future::{self, LocalBoxFuture};
use futures::FutureExt;

use crate::renderer::{PageRenderer, RenderError, RenderResult, RenderTask, Viewport};

fn scale_milli(scale: f32) -> u32 {
    (scale * 1000.0).round() as u32
}

/// Renders numbered images; every page defaults to 100 x 150
pub(crate) struct FakeRenderer {
    page_count: usize,
    sizes: RefCell<HashMap<usize, Viewport>>,
    gates: RefCell<HashMap<(usize, Option<u32>), oneshot::Receiver<()>>>,
    renders: RefCell<Vec<(usize, u32)>>,
    released: RefCell<Vec<u64>>,
    cancelled: Rc<RefCell<Vec<usize>>>,
    next_image: Cell<u64>,
    text_layers: Cell<usize>,
    annotation_layers: Cell<usize>,
    fail_releases: Cell<bool>,
}

impl FakeRenderer {
    pub fn new(page_count: usize) -> Self {
        Self {
            page_count,
            sizes: RefCell::new(HashMap::new()),
            gates: RefCell::new(HashMap::new()),
            renders: RefCell::new(Vec::new()),
            released: RefCell::new(Vec::new()),
            cancelled: Rc::new(RefCell::new(Vec::new())),
            next_image: Cell::new(0),
            text_layers: Cell::new(0),
            annotation_layers: Cell::new(0),
            fail_releases: Cell::new(false),
        }
    }

    pub fn set_page_size(&self, page: usize, width: f64, height: f64) {
        self.sizes.borrow_mut().insert(page, Viewport::new(width, height));
    }

    /// Hold the next render of `page` until `gate` fires or is dropped
    pub fn gate(&self, page: usize, gate: oneshot::Receiver<()>) {
        self.gates.borrow_mut().insert((page, None), gate);
    }

    /// Like [`gate`](Self::gate), but only for renders at `scale`
    pub fn gate_at(&self, page: usize, scale: f32, gate: oneshot::Receiver<()>) {
        self.gates
            .borrow_mut()
            .insert((page, Some(scale_milli(scale))), gate);
    }

    pub fn fail_releases(&self) {
        self.fail_releases.set(true);
    }

    /// `(page, scale in thousandths)` for every render started
    pub fn renders(&self) -> Vec<(usize, u32)> {
        self.renders.borrow().clone()
    }

    pub fn released(&self) -> Vec<u64> {
        self.released.borrow().clone()
    }

    pub fn cancelled(&self) -> Vec<usize> {
        self.cancelled.borrow().clone()
    }

    pub fn text_layers(&self) -> usize {
        self.text_layers.get()
    }

    pub fn annotation_layers(&self) -> usize {
        self.annotation_layers.get()
    }
}

impl PageRenderer for FakeRenderer {
    type Image = u64;
    type TextLayer = String;
    type AnnotationLayer = Vec<String>;

    fn page_count(&self) -> usize {
        self.page_count
    }

    fn page_size(&self, page: usize) -> RenderResult<Viewport> {
        if page == 0 || page > self.page_count {
            return Err(RenderError::PageOutOfRange {
                page,
                page_count: self.page_count,
            });
        }
        Ok(self
            .sizes
            .borrow()
            .get(&page)
            .copied()
            .unwrap_or(Viewport::new(100.0, 150.0)))
    }

    fn render(&self, page: usize, scale: f32) -> RenderResult<RenderTask<u64>> {
        let viewport = self.page_size(page)?.scaled(f64::from(scale));
        let milli = scale_milli(scale);
        self.renders.borrow_mut().push((page, milli));

        let image = self.next_image.get();
        self.next_image.set(image + 1);

        let gate = {
            let mut gates = self.gates.borrow_mut();
            gates
                .remove(&(page, Some(milli)))
                .or_else(|| gates.remove(&(page, None)))
        };
        let result = async move {
            if let Some(gate) = gate {
                let _ = gate.await;
            }
            Ok(image)
        }
        .boxed_local();

        let cancelled = self.cancelled.clone();
        Ok(RenderTask::new(viewport, result).with_cancel(move || cancelled.borrow_mut().push(page)))
    }

    fn text_layer(&self, page: usize) -> LocalBoxFuture<'static, RenderResult<String>> {
        self.text_layers.set(self.text_layers.get() + 1);
        future::ready(Ok(format!("text of page {page}"))).boxed_local()
    }

    fn annotation_layer(&self, page: usize) -> LocalBoxFuture<'static, RenderResult<Vec<String>>> {
        self.annotation_layers.set(self.annotation_layers.get() + 1);
        future::ready(Ok(vec![format!("note on page {page}")])).boxed_local()
    }

    fn release_image(&self, image: u64) -> RenderResult<()> {
        if self.fail_releases.get() {
            return Err(RenderError::Backend(format!("image {image} already freed")));
        }
        self.released.borrow_mut().push(image);
        Ok(())
    }
}
