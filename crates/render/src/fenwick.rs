//! Fenwick (binary indexed) tree over `f64` values

/// Prefix-sum structure with O(log n) point updates and queries
///
/// Indices are 0-based externally; the backing array is 1-based.
#[derive(Debug, Clone, Default)]
pub struct FenwickTree {
    tree: Vec<f64>,
}

impl FenwickTree {
    /// Create a tree of `len` zeros
    pub fn new(len: usize) -> Self {
        Self {
            tree: vec![0.0; len + 1],
        }
    }

    /// Build a tree from initial values in O(n)
    pub fn from_values(values: &[f64]) -> Self {
        let mut tree = vec![0.0; values.len() + 1];
        tree[1..].copy_from_slice(values);

        for i in 1..tree.len() {
            let parent = i + lowest_bit(i);
            if parent < tree.len() {
                tree[parent] += tree[i];
            }
        }
        Self { tree }
    }

    /// Number of slots
    pub fn len(&self) -> usize {
        self.tree.len().saturating_sub(1)
    }

    /// Check if the tree has no slots
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Add `delta` to slot `index`
    ///
    /// Out-of-range indices are ignored.
    pub fn add(&mut self, index: usize, delta: f64) {
        if index >= self.len() {
            return;
        }

        let mut i = index + 1;
        while i < self.tree.len() {
            self.tree[i] += delta;
            i += lowest_bit(i);
        }
    }

    /// Sum of slots `[0, count)`
    ///
    /// `count` is clamped to the tree length.
    pub fn prefix_sum(&self, count: usize) -> f64 {
        let mut i = count.min(self.len());
        let mut sum = 0.0;
        while i > 0 {
            sum += self.tree[i];
            i -= lowest_bit(i);
        }
        sum
    }

    /// Sum of every slot
    pub fn total(&self) -> f64 {
        self.prefix_sum(self.len())
    }
}

#[inline]
fn lowest_bit(i: usize) -> usize {
    i & i.wrapping_neg()
}
