//! Cache warming ahead of the operand copies.
//!
//! A prefetch plan splits an operand's K tile in cache-line sized blocks and spreads them over
//! the subgroups. Prefetches carry no data, so issuing them or not never changes a result.

use hashbrown::HashSet;

use crate::components::{
    MatmulIdent, MatrixLayout, Numeric, SubgroupCoord, TileShape, WorkgroupCoord,
    WorkgroupTiling,
    global::memory::TensorView,
    transfer::{BlockTransfer, select_prefetch},
};

/// Size of a cache line in bytes.
pub const CACHELINE_BYTES: usize = 64;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
/// Which subgroups share the blocks of one K tile.
pub enum PrefetchScope {
    /// The whole work-group tile is split between every subgroup.
    Workgroup,
    /// Each subgroup tile is split between the subgroups that read the same operand rows.
    Subgroup,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
/// Static partition of one operand's K tile for prefetching.
///
/// Shapes are in memory orientation: `tile.1` runs along the contiguous dimension.
pub struct PrefetchPlan {
    pub ident: MatmulIdent,
    pub scope: PrefetchScope,
    pub layout: MatrixLayout,
    /// Elements fitting in one cache line, bounded by the relevant dimension.
    pub block_size: usize,
    pub num_blocks: usize,
    /// Subgroups along each memory axis.
    pub thread_shape: (usize, usize),
    /// Region prefetched by one subgroup.
    pub tile: (usize, usize),
    pub transfer: BlockTransfer,
    tiling: WorkgroupTiling,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
/// Region of an operand warmed by one prefetch, in matmul orientation.
pub struct PrefetchRegion {
    pub ident: MatmulIdent,
    pub row: usize,
    pub col: usize,
    pub rows: usize,
    pub cols: usize,
    pub batch: usize,
}

fn gcd(a: usize, b: usize) -> usize {
    match b {
        0 => a,
        _ => gcd(b, a % b),
    }
}

fn cacheline_elements<E: Numeric>() -> usize {
    CACHELINE_BYTES * 8 / E::BITS as usize
}

impl PrefetchPlan {
    /// Work-group scoped plan, used by the pipelined mainloops.
    ///
    /// Every subgroup of the work-group takes a slice of the whole `BLK` operand tile.
    pub fn workgroup<E: Numeric>(
        ident: MatmulIdent,
        layout: MatrixLayout,
        tiling: &WorkgroupTiling,
    ) -> Self {
        let blk = tiling.tile();
        let transposed = layout.is_transposed();

        let relevant = match (ident, transposed) {
            (MatmulIdent::Lhs, true) => blk.m,
            (MatmulIdent::Lhs, false) => blk.k,
            (MatmulIdent::Rhs, true) => blk.k,
            _ => blk.n,
        };
        let (rows, cols) = match (ident, transposed) {
            (MatmulIdent::Lhs, true) => (blk.k, blk.m),
            (MatmulIdent::Lhs, false) => (blk.m, blk.k),
            (MatmulIdent::Rhs, true) => (blk.n, blk.k),
            _ => (blk.k, blk.n),
        };

        let block_size = relevant.min(cacheline_elements::<E>());
        let num_blocks = relevant.div_ceil(block_size);
        let total = tiling.num_subgroups();
        let g = gcd(total, num_blocks);
        let thread_shape = (total / g, g);
        let tile = (rows.div_ceil(thread_shape.0), cols.div_ceil(thread_shape.1));

        Self {
            ident,
            scope: PrefetchScope::Workgroup,
            layout,
            block_size,
            num_blocks,
            thread_shape,
            tile,
            transfer: select_prefetch(E::BITS, tile.0, tile.1),
            tiling: *tiling,
        }
    }

    /// Subgroup scoped plan, used by the unpredicated mainloops on row-major operands.
    ///
    /// The A tile of a subgroup is shared with its `ATOM_N` row peers and the B tile with its
    /// `ATOM_M` column peers; each peer prefetches one slice.
    pub fn subgroup<E: Numeric>(ident: MatmulIdent, tiling: &WorkgroupTiling) -> Self {
        let sg = tiling.subgroup_tile();
        let atoms = tiling.atoms();

        let (relevant, peers, rows, cols) = match ident {
            MatmulIdent::Lhs => (sg.k, atoms.n, sg.m, sg.k),
            _ => (sg.n, atoms.m, sg.k, sg.n),
        };

        let block_size = relevant.min(cacheline_elements::<E>());
        let num_blocks = relevant.div_ceil(block_size);
        let g = gcd(peers, num_blocks);
        let thread_shape = (peers / g, g);
        let tile = (rows.div_ceil(thread_shape.0), cols.div_ceil(thread_shape.1));

        Self {
            ident,
            scope: PrefetchScope::Subgroup,
            layout: MatrixLayout::RowMajor,
            block_size,
            num_blocks,
            thread_shape,
            tile,
            transfer: select_prefetch(E::BITS, tile.0, tile.1),
            tiling: *tiling,
        }
    }

    /// Region prefetched by `subgroup` for the absolute K tile `k_tile`.
    pub fn region(
        &self,
        workgroup: &WorkgroupCoord,
        subgroup: &SubgroupCoord,
        k_tile: usize,
    ) -> PrefetchRegion {
        let blk: TileShape = self.tiling.tile();
        let (thr0, thr1) = self.thread_shape;
        let (tile0, tile1) = self.tile;

        let (axis0, axis1) = match self.scope {
            PrefetchScope::Workgroup => {
                let base = match (self.ident, self.layout.is_transposed()) {
                    (MatmulIdent::Lhs, true) => (k_tile * blk.k, workgroup.m * blk.m),
                    (MatmulIdent::Lhs, false) => (workgroup.m * blk.m, k_tile * blk.k),
                    (MatmulIdent::Rhs, true) => (workgroup.n * blk.n, k_tile * blk.k),
                    _ => (k_tile * blk.k, workgroup.n * blk.n),
                };
                let id = subgroup.id;
                debug_assert!(id / thr1 < thr0);
                (base.0 + (id / thr1) * tile0, base.1 + (id % thr1) * tile1)
            }
            PrefetchScope::Subgroup => {
                let atoms_n = self.tiling.atoms().n;
                match self.ident {
                    MatmulIdent::Lhs => {
                        let idx = subgroup.id % atoms_n;
                        (
                            subgroup.m + (idx / thr1) * tile0,
                            k_tile * blk.k + (idx % thr1) * tile1,
                        )
                    }
                    _ => {
                        let idx = subgroup.id / atoms_n;
                        (
                            k_tile * blk.k + (idx / thr1) * tile0,
                            subgroup.n + (idx % thr1) * tile1,
                        )
                    }
                }
            }
        };

        let (row, col, rows, cols) = match self.layout.is_transposed() {
            true => (axis1, axis0, tile1, tile0),
            false => (axis0, axis1, tile0, tile1),
        };

        PrefetchRegion {
            ident: self.ident,
            row,
            col,
            rows,
            cols,
            batch: subgroup.l,
        }
    }
}

/// Unit issuing prefetches on behalf of one subgroup.
pub trait Prefetcher: Send {
    fn prefetch<E: Numeric>(&mut self, view: &TensorView<'_, E>, region: &PrefetchRegion);

    /// Number of prefetches issued so far.
    fn issued(&self) -> usize;
}

#[derive(Default, Debug, Clone, Copy)]
/// Use when prefetching is disabled
pub struct NoPrefetch;

impl Prefetcher for NoPrefetch {
    fn prefetch<E: Numeric>(&mut self, _view: &TensorView<'_, E>, _region: &PrefetchRegion) {
        // Nothing to do
    }

    fn issued(&self) -> usize {
        0
    }
}

#[derive(Default, Debug, Clone)]
/// Records the host cache lines touched by each prefetch.
///
/// Only in-bounds elements are considered, out-of-bounds prefetches are dropped like on the
/// hardware.
pub struct CacheLinePrefetcher {
    lines: HashSet<usize>,
    issued: usize,
}

impl CacheLinePrefetcher {
    pub fn new() -> Self {
        Self::default()
    }

    /// Distinct cache lines warmed so far.
    pub fn lines(&self) -> &HashSet<usize> {
        &self.lines
    }
}

impl Prefetcher for CacheLinePrefetcher {
    fn prefetch<E: Numeric>(&mut self, view: &TensorView<'_, E>, region: &PrefetchRegion) {
        self.issued += 1;

        for row in region.row..region.row + region.rows {
            for col in region.col..region.col + region.cols {
                if let Some(address) = view.address(row, col, region.batch) {
                    self.lines.insert(address / CACHELINE_BYTES);
                }
            }
        }
    }

    fn issued(&self) -> usize {
        self.issued
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
/// Keeps prefetches `stages` K tiles ahead of the tile being computed.
///
/// Indices handed to the prefetch closures are relative to the first tile of the range.
pub struct PrefetchCursor {
    next: usize,
    count: usize,
}

impl PrefetchCursor {
    /// Issues the prefetches of the first `stages` out of `count` tiles.
    pub fn warmup(stages: usize, count: usize, mut prefetch: impl FnMut(usize)) -> Self {
        let mut cursor = Self { next: 0, count };
        for _ in 0..stages {
            cursor.advance(&mut prefetch);
        }
        cursor
    }

    /// Issues the prefetch of the next tile, if the range still has one.
    pub fn advance(&mut self, prefetch: impl FnOnce(usize)) {
        if self.next < self.count {
            prefetch(self.next);
        }
        self.next += 1;
    }
}
