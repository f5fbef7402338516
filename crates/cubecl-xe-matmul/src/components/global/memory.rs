use serde::{Deserialize, Serialize};

use crate::components::{
    MatmulAvailabilityError, MatmulIdent, MatrixLayout, Numeric, tile::Fragment,
};

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize, new)]
/// Element strides of a `(rows, cols, batch)` tensor.
pub struct Strides {
    pub row: usize,
    pub col: usize,
    pub batch: usize,
}

impl Strides {
    pub fn row_major(rows: usize, cols: usize) -> Self {
        Self {
            row: cols,
            col: 1,
            batch: rows * cols,
        }
    }

    pub fn col_major(rows: usize, cols: usize) -> Self {
        Self {
            row: 1,
            col: rows,
            batch: rows * cols,
        }
    }

    /// Packed strides of a `(rows, cols)` matrix in `layout`.
    pub fn packed(layout: MatrixLayout, rows: usize, cols: usize) -> Self {
        match layout {
            MatrixLayout::RowMajor => Self::row_major(rows, cols),
            MatrixLayout::ColMajor => Self::col_major(rows, cols),
        }
    }

    fn offset(&self, row: usize, col: usize, batch: usize) -> usize {
        row * self.row + col * self.col + batch * self.batch
    }
}

#[derive(Clone, Copy, Debug, new)]
/// Caller memory of one operand, before it is bound to a problem shape.
pub struct OperandArguments<'a, E> {
    pub data: &'a [E],
    pub strides: Strides,
}

#[derive(Clone, Copy, Debug)]
/// Read-only view of an operand in matmul orientation.
///
/// Reads outside of `shape` return zero, like the predicated block loads do.
pub struct TensorView<'a, E> {
    data: &'a [E],
    shape: (usize, usize, usize),
    strides: Strides,
    layout: MatrixLayout,
}

impl<'a, E: Numeric> TensorView<'a, E> {
    /// Binds `arguments` to a `(rows, cols, batch)` shape.
    ///
    /// Fails when the buffer is too short for the addressed elements.
    pub fn new(
        ident: MatmulIdent,
        arguments: OperandArguments<'a, E>,
        shape: (usize, usize, usize),
        layout: MatrixLayout,
    ) -> Result<Self, MatmulAvailabilityError> {
        let view = Self {
            data: arguments.data,
            shape,
            strides: arguments.strides,
            layout,
        };

        let required = view.required_len();
        if arguments.data.len() < required {
            return Err(MatmulAvailabilityError::BufferTooSmall {
                ident,
                len: arguments.data.len(),
                required,
            });
        }

        Ok(view)
    }

    pub fn shape(&self) -> (usize, usize, usize) {
        self.shape
    }

    pub fn strides(&self) -> Strides {
        self.strides
    }

    pub fn layout(&self) -> MatrixLayout {
        self.layout
    }

    /// Number of elements addressed by the view, the last one included.
    pub fn required_len(&self) -> usize {
        let (rows, cols, batch) = self.shape;
        if rows == 0 || cols == 0 || batch == 0 {
            return 0;
        }
        self.strides.offset(rows - 1, cols - 1, batch - 1) + 1
    }

    /// Number of contiguous elements of one row in memory.
    pub fn contiguous_extent(&self) -> usize {
        match self.layout {
            MatrixLayout::RowMajor => self.shape.1,
            MatrixLayout::ColMajor => self.shape.0,
        }
    }

    pub fn in_bounds(&self, row: usize, col: usize, batch: usize) -> bool {
        row < self.shape.0 && col < self.shape.1 && batch < self.shape.2
    }

    pub fn read(&self, row: usize, col: usize, batch: usize) -> E {
        match self.in_bounds(row, col, batch) {
            true => self.data[self.strides.offset(row, col, batch)],
            false => E::default(),
        }
    }

    /// Host address of an in-bounds element.
    pub fn address(&self, row: usize, col: usize, batch: usize) -> Option<usize> {
        self.in_bounds(row, col, batch).then(|| {
            let base = self.data.as_ptr() as usize;
            base + self.strides.offset(row, col, batch) * size_of::<E>()
        })
    }
}

/// Output tensor shared by every subgroup of a launch.
///
/// Store partitions are disjoint, so the lock is only held for the duration of one tile store.
pub struct OutputTensor<'a, E> {
    data: spin::Mutex<&'a mut [E]>,
    shape: (usize, usize, usize),
    strides: Strides,
}

impl<'a, E: Numeric> OutputTensor<'a, E> {
    pub fn new(
        data: &'a mut [E],
        shape: (usize, usize, usize),
        strides: Strides,
    ) -> Result<Self, MatmulAvailabilityError> {
        let (rows, cols, batch) = shape;
        let required = match rows == 0 || cols == 0 || batch == 0 {
            true => 0,
            false => strides.offset(rows - 1, cols - 1, batch - 1) + 1,
        };
        if data.len() < required {
            return Err(MatmulAvailabilityError::BufferTooSmall {
                ident: MatmulIdent::Out,
                len: data.len(),
                required,
            });
        }

        Ok(Self {
            data: spin::Mutex::new(data),
            shape,
            strides,
        })
    }

    pub fn shape(&self) -> (usize, usize, usize) {
        self.shape
    }

    fn in_bounds(&self, row: usize, col: usize, batch: usize) -> bool {
        row < self.shape.0 && col < self.shape.1 && batch < self.shape.2
    }

    /// Stores a fragment at `(row, col)`; elements outside of the tensor are dropped.
    pub fn store(&self, fragment: &Fragment<E>, row: usize, col: usize, batch: usize) {
        let mut data = self.data.lock();
        for r in 0..fragment.rows() {
            for c in 0..fragment.cols() {
                if self.in_bounds(row + r, col + c, batch) {
                    data[self.strides.offset(row + r, col + c, batch)] = fragment.get(r, c);
                }
            }
        }
    }

    /// Reads a tile into a fragment, with zeros outside of the tensor.
    pub fn load(&self, fragment: &mut Fragment<E>, row: usize, col: usize, batch: usize) {
        let data = self.data.lock();
        for r in 0..fragment.rows() {
            for c in 0..fragment.cols() {
                let value = match self.in_bounds(row + r, col + c, batch) {
                    true => data[self.strides.offset(row + r, col + c, batch)],
                    false => E::default(),
                };
                fragment.set(r, c, value);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn col_major_view_reads_transposed_memory() {
        let data = [1.0f32, 2.0, 3.0, 4.0, 5.0, 6.0];
        let view = TensorView::new(
            MatmulIdent::Lhs,
            OperandArguments::new(&data, Strides::col_major(2, 3)),
            (2, 3, 1),
            MatrixLayout::ColMajor,
        )
        .unwrap();

        assert_eq!(view.read(0, 1, 0), 3.0);
        assert_eq!(view.read(1, 2, 0), 6.0);
        assert_eq!(view.read(2, 0, 0), 0.0);
        assert_eq!(view.contiguous_extent(), 2);
    }

    #[test]
    fn short_buffers_are_rejected() {
        let data = [0.0f32; 5];
        let result = TensorView::new(
            MatmulIdent::Rhs,
            OperandArguments::new(&data, Strides::row_major(2, 3)),
            (2, 3, 1),
            MatrixLayout::RowMajor,
        );

        assert!(matches!(
            result,
            Err(MatmulAvailabilityError::BufferTooSmall { required: 6, .. })
        ));
    }

    #[test]
    fn stores_outside_of_the_output_are_dropped() {
        let mut data = [0.0f32; 4];
        let out = OutputTensor::new(&mut data, (2, 2, 1), Strides::row_major(2, 2)).unwrap();

        out.store(&Fragment::filled(2, 2, 7.0), 1, 1, 0);

        drop(out);
        assert_eq!(data, [0.0, 0.0, 0.0, 7.0]);
    }
}
