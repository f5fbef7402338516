use crate::components::{Numeric, tiling::SUBGROUP_SIZE};

#[derive(Clone, Debug, PartialEq)]
/// Register-resident tile owned by one subgroup, row major.
///
/// Columns are spread over the lanes of the subgroup: lane `l` holds every column `c` with
/// `c % SUBGROUP_SIZE == l`, for all rows. Lane-local reductions therefore scan a row with a
/// stride of [SUBGROUP_SIZE].
pub struct Fragment<E> {
    rows: usize,
    cols: usize,
    data: Vec<E>,
}

impl<E: Numeric> Fragment<E> {
    pub fn zeros(rows: usize, cols: usize) -> Self {
        Self::filled(rows, cols, E::default())
    }

    pub fn filled(rows: usize, cols: usize, value: E) -> Self {
        Self {
            rows,
            cols,
            data: vec![value; rows * cols],
        }
    }

    pub fn from_fn<F: FnMut(usize, usize) -> E>(rows: usize, cols: usize, mut func: F) -> Self {
        let mut data = Vec::with_capacity(rows * cols);
        for row in 0..rows {
            for col in 0..cols {
                data.push(func(row, col));
            }
        }
        Self { rows, cols, data }
    }

    pub fn rows(&self) -> usize {
        self.rows
    }

    pub fn cols(&self) -> usize {
        self.cols
    }

    pub fn len(&self) -> usize {
        self.data.len()
    }

    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    pub fn get(&self, row: usize, col: usize) -> E {
        self.data[row * self.cols + col]
    }

    pub fn set(&mut self, row: usize, col: usize, value: E) {
        self.data[row * self.cols + col] = value;
    }

    pub fn row(&self, row: usize) -> &[E] {
        &self.data[row * self.cols..(row + 1) * self.cols]
    }

    pub fn row_mut(&mut self, row: usize) -> &mut [E] {
        &mut self.data[row * self.cols..(row + 1) * self.cols]
    }

    pub fn as_slice(&self) -> &[E] {
        &self.data
    }

    pub fn as_mut_slice(&mut self) -> &mut [E] {
        &mut self.data
    }

    pub fn fill(&mut self, value: E) {
        self.data.fill(value);
    }

    /// Values held by one lane per row.
    pub fn values_per_lane(&self) -> usize {
        self.cols.div_ceil(SUBGROUP_SIZE)
    }

    /// Elementwise conversion into a new fragment of the same shape.
    pub fn map<T: Numeric, F: Fn(E) -> T>(&self, func: F) -> Fragment<T> {
        Fragment {
            rows: self.rows,
            cols: self.cols,
            data: self.data.iter().map(|value| func(*value)).collect(),
        }
    }

    /// Elementwise `self = func(self, other)`.
    pub fn zip_apply<T: Numeric, F: Fn(E, T) -> E>(&mut self, other: &Fragment<T>, func: F) {
        assert_eq!((self.rows, self.cols), (other.rows, other.cols));
        for (value, other) in self.data.iter_mut().zip(other.data.iter()) {
            *value = func(*value, *other);
        }
    }
}

/// Lane owning a column of a fragment.
pub fn lane_of(col: usize) -> usize {
    col % SUBGROUP_SIZE
}
