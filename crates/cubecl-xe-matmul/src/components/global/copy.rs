use crate::components::{
    MatmulIdent, MatmulSetupError, MatrixLayout, Numeric,
    global::memory::TensorView,
    tile::Fragment,
    tiling::SUBGROUP_SIZE,
    transfer::{BlockOp, BlockTransfer, BlockTransform, select_transfer},
};

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
/// Partition of one subgroup tile across the lanes of the subgroup.
///
/// Built once from static shapes; [CopyPlan::with] binds it to memory at runtime.
pub struct CopyPlan {
    pub ident: MatmulIdent,
    /// Block instruction repeated to cover the tile.
    pub transfer: BlockTransfer,
    /// Tile rows in matmul orientation.
    pub rows: usize,
    /// Tile columns in matmul orientation.
    pub cols: usize,
    pub layout: MatrixLayout,
}

impl CopyPlan {
    /// Plans the transfer of a `(rows, cols)` tile of elements `E`.
    ///
    /// Fails when no block instruction tiles the region exactly.
    pub fn new<E: Numeric>(
        ident: MatmulIdent,
        layout: MatrixLayout,
        rows: usize,
        cols: usize,
    ) -> Result<Self, MatmulSetupError> {
        let transposed = layout.is_transposed();
        let (op, transform) = match (ident, transposed) {
            (MatmulIdent::Lhs, false) => (BlockOp::Load, BlockTransform::None),
            (MatmulIdent::Rhs, false) if E::BITS < 32 => (BlockOp::Load, BlockTransform::Vnni),
            (MatmulIdent::Rhs, false) => (BlockOp::Load, BlockTransform::None),
            (MatmulIdent::Lhs | MatmulIdent::Rhs, true) => {
                (BlockOp::Load, BlockTransform::Transpose)
            }
            (MatmulIdent::Out, _) => (BlockOp::Store, BlockTransform::None),
        };

        let (mem_rows, mem_cols) = match transposed {
            true => (cols, rows),
            false => (rows, cols),
        };
        let transfer = select_transfer(E::BITS, op, transform, mem_rows, mem_cols)?;

        Ok(Self {
            ident,
            transfer,
            rows,
            cols,
            layout,
        })
    }

    /// Lanes along `(rows, cols)`: the whole subgroup spreads along the columns.
    pub fn thread_shape(&self) -> (usize, usize) {
        (1, SUBGROUP_SIZE)
    }

    /// Elements held by each lane once the tile is copied.
    pub fn values_per_lane(&self) -> usize {
        (self.rows * self.cols).div_ceil(SUBGROUP_SIZE)
    }

    /// Number of block instructions issued per tile.
    pub fn instructions(&self) -> usize {
        (self.rows * self.cols).div_ceil(self.transfer.elements())
    }

    pub fn with<'a, E: Numeric>(&self, view: &'a TensorView<'a, E>) -> BoundCopy<'a, E> {
        BoundCopy { plan: *self, view }
    }
}

/// A [CopyPlan] bound to an operand view.
pub struct BoundCopy<'a, E> {
    plan: CopyPlan,
    view: &'a TensorView<'a, E>,
}

impl<E: Numeric> BoundCopy<'_, E> {
    pub fn plan(&self) -> &CopyPlan {
        &self.plan
    }

    /// Copies the tile starting at `(row, col)` of `batch` into `fragment`.
    ///
    /// Out-of-bounds elements are zero filled.
    pub fn copy(&self, row: usize, col: usize, batch: usize, fragment: &mut Fragment<E>) {
        debug_assert_eq!(
            (fragment.rows(), fragment.cols()),
            (self.plan.rows, self.plan.cols)
        );

        for r in 0..self.plan.rows {
            for c in 0..self.plan.cols {
                fragment.set(r, c, self.view.read(row + r, col + c, batch));
            }
        }
    }
}
