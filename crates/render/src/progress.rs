//! Weighted reading progress over PDF pages
//!
//! Every page starts at a base weight (the reference page area). Pages that
//! have been rendered record their observed, scale-normalised area; the
//! difference from the base is kept in a [`FenwickTree`] so prefix weights
//! stay O(log n) under repeated re-renders.
//!
//! Positions are measured at page starts, so the last page's own weight
//! never counts towards the denominator. Percentages are fractions in
//! `[0.0, 1.0]`.

use crate::fenwick::FenwickTree;

/// Fallback base weight when the reference page area is unusable
pub const DEFAULT_BASE_WEIGHT: f64 = 1.0;

/// Progress index over page weights
#[derive(Debug, Clone)]
pub struct ProgressIndex {
    base_weight: f64,

    /// Observed weight minus base weight, per page index
    deltas: Vec<f64>,

    tree: FenwickTree,
}

impl ProgressIndex {
    /// Create an index where every page weighs `base_weight`
    ///
    /// Non-finite or non-positive base weights fall back to
    /// [`DEFAULT_BASE_WEIGHT`].
    pub fn new(page_count: usize, base_weight: f64) -> Self {
        let base_weight = if base_weight.is_finite() && base_weight > 0.0 {
            base_weight
        } else {
            DEFAULT_BASE_WEIGHT
        };

        Self {
            base_weight,
            deltas: vec![0.0; page_count],
            tree: FenwickTree::new(page_count),
        }
    }

    /// Number of pages
    pub fn page_count(&self) -> usize {
        self.deltas.len()
    }

    /// Weight of an unrecorded page
    pub fn base_weight(&self) -> f64 {
        self.base_weight
    }

    /// Current weight of page `index`
    pub fn page_weight(&self, index: usize) -> Option<f64> {
        self.deltas.get(index).map(|delta| self.base_weight + delta)
    }

    /// Overwrite the observed weight of page `index`
    ///
    /// Returns `true` if the stored weight changed. Out-of-range indices and
    /// negative or non-finite weights are ignored.
    pub fn record_page_weight(&mut self, index: usize, weight: f64) -> bool {
        if !weight.is_finite() || weight < 0.0 {
            return false;
        }
        let Some(stored) = self.deltas.get_mut(index) else {
            return false;
        };

        let delta = weight - self.base_weight;
        if delta == *stored {
            return false;
        }

        let difference = delta - *stored;
        *stored = delta;
        self.tree.add(index, difference);
        true
    }

    /// Change the page count, keeping recorded weights of surviving pages
    pub fn resize(&mut self, page_count: usize) {
        self.deltas.resize(page_count, 0.0);
        self.tree = FenwickTree::from_values(&self.deltas);
    }

    /// Total weight of pages `[0, index)`
    pub fn progress_prefix_before(&self, index: usize) -> f64 {
        let index = index.min(self.page_count());
        index as f64 * self.base_weight + self.tree.prefix_sum(index)
    }

    /// Weight of every page except the last
    pub fn progress_denominator(&self) -> f64 {
        match self.page_count() {
            0 => 0.0,
            count => self.progress_prefix_before(count - 1),
        }
    }

    /// Fraction of the document before page `index`
    pub fn percentage_from_page_index(&self, index: usize) -> f64 {
        self.fraction_before(index, self.progress_denominator())
    }

    fn fraction_before(&self, index: usize, denominator: f64) -> f64 {
        if denominator <= 0.0 {
            return 0.0;
        }
        (self.progress_prefix_before(index) / denominator).clamp(0.0, 1.0)
    }

    /// Page containing the position `percentage` of the way through
    ///
    /// Binary search for the last page whose start fraction is at or before
    /// the position. Start fractions are computed exactly as
    /// [`percentage_from_page_index`](Self::percentage_from_page_index) does,
    /// so a page maps back to itself unless its weight is too small to move
    /// the next page's start; then the later page wins. Non-finite input maps
    /// to the first page.
    pub fn page_index_from_percentage(&self, percentage: f64) -> usize {
        let count = self.page_count();
        let denominator = self.progress_denominator();
        if count == 0 || denominator <= 0.0 || !percentage.is_finite() {
            return 0;
        }

        let target = percentage.clamp(0.0, 1.0);
        let (mut low, mut high) = (0, count - 1);
        while low < high {
            let mid = low + (high - low + 1) / 2;
            if self.fraction_before(mid, denominator) <= target {
                low = mid;
            } else {
                high = mid - 1;
            }
        }
        low
    }
}
