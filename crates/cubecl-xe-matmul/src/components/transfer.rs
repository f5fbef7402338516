//! Parameterized 2D block transfers.
//!
//! The hardware exposes one block load, store and prefetch per element width, block shape and
//! transform. Instead of one type per instruction, a [BlockTransfer] carries those parameters
//! as data, and the supported combinations live in a lookup table.

use std::fmt::Display;

use crate::components::{FormattedConfigError, MatmulSetupError};

/// Largest number of bytes a single block row may span.
pub const MAX_BLOCK_ROW_BYTES: usize = 64;
/// Widest single block of 8 and 16-bit loads, in bytes; wider rows are split in several blocks.
const BLOCK_BYTES: usize = 32;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
/// Register layout transform applied by a block load.
pub enum BlockTransform {
    /// Rows land in registers as they are in memory.
    None,
    /// Pairs (16-bit) or quads (8-bit) of rows are interleaved for the systolic array.
    Vnni,
    /// The block is transposed on the way to registers.
    Transpose,
}

impl BlockTransform {
    fn suffix(&self) -> &'static str {
        match self {
            BlockTransform::None => "N",
            BlockTransform::Vnni => "V",
            BlockTransform::Transpose => "T",
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum BlockOp {
    Load,
    Store,
    Prefetch,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
/// One 2D block instruction.
///
/// `height` rows of `width * blocks` elements, where rows are the strided dimension in memory.
pub struct BlockTransfer {
    /// Container width of one element, in bits. Sub-byte elements are moved as bytes.
    pub elem_bits: u32,
    pub height: usize,
    pub width: usize,
    pub blocks: usize,
    pub transform: BlockTransform,
    pub op: BlockOp,
}

impl BlockTransfer {
    /// Rows moved by one instruction.
    pub fn rows(&self) -> usize {
        self.height
    }

    /// Contiguous elements moved per row by one instruction.
    pub fn cols(&self) -> usize {
        self.width * self.blocks
    }

    pub fn elements(&self) -> usize {
        self.rows() * self.cols()
    }

    pub fn row_bytes(&self) -> usize {
        self.cols() * self.elem_bits as usize / 8
    }

    /// Instruction name, e.g. `XE_2D_U16x32x32_LD_N`.
    pub fn name(&self) -> String {
        let base = format!(
            "XE_2D_U{}x{}x{}",
            self.elem_bits,
            self.height,
            self.cols()
        );
        match self.op {
            BlockOp::Load => format!("{base}_LD_{}", self.transform.suffix()),
            BlockOp::Store => format!("{base}_ST_{}", self.transform.suffix()),
            BlockOp::Prefetch => format!("{base}_LD_{}::PREFETCH", self.transform.suffix()),
        }
    }
}

impl Display for BlockTransfer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.name())
    }
}

struct TransferFamily {
    elem_bits: u32,
    op: BlockOp,
    transform: BlockTransform,
    heights: &'static [usize],
    widths: &'static [usize],
}

const fn family(
    elem_bits: u32,
    op: BlockOp,
    transform: BlockTransform,
    heights: &'static [usize],
    widths: &'static [usize],
) -> TransferFamily {
    TransferFamily {
        elem_bits,
        op,
        transform,
        heights,
        widths,
    }
}

use BlockOp::{Load, Store};
use BlockTransform::{None as N, Transpose as T, Vnni as V};

const HEIGHTS: &[usize] = &[1, 2, 4, 8, 16, 32];

/// Every block instruction available, grouped by element width, operation and transform.
static TRANSFER_FAMILIES: &[TransferFamily] = &[
    family(8, Load, N, HEIGHTS, &[32, 64]),
    family(8, Load, V, &[32], &[16, 32, 64]),
    family(8, Store, N, &[1, 2, 4, 8], &[16]),
    family(8, Store, N, &[2, 8], &[32]),
    family(16, Load, N, HEIGHTS, &[16, 32]),
    family(16, Load, V, &[16, 32], &[16, 32]),
    family(16, Load, T, &[16], &[8, 16]),
    family(16, Store, N, &[1, 2, 4, 8], &[16]),
    family(32, Load, N, HEIGHTS, &[16]),
    family(32, Load, T, &[16], &[1, 2, 4, 8]),
    family(32, Store, N, &[1, 2, 4, 8], &[16]),
];

fn instruction(family: &TransferFamily, height: usize, width: usize, op: BlockOp) -> BlockTransfer {
    let bytes = width * family.elem_bits as usize / 8;
    let blocks = if family.op == BlockOp::Load
        && family.transform == BlockTransform::None
        && family.elem_bits < 32
        && bytes > BLOCK_BYTES
    {
        bytes / BLOCK_BYTES
    } else {
        1
    };

    BlockTransfer {
        elem_bits: family.elem_bits,
        height,
        width: width / blocks,
        blocks,
        transform: family.transform,
        op,
    }
}

/// All instructions of the table for one element width.
pub fn supported_transfers(elem_bits: u32) -> impl Iterator<Item = BlockTransfer> {
    let bits = container_bits(elem_bits);
    TRANSFER_FAMILIES
        .iter()
        .filter(move |family| family.elem_bits == bits)
        .flat_map(|family| {
            family.heights.iter().flat_map(move |&height| {
                family
                    .widths
                    .iter()
                    .map(move |&width| instruction(family, height, width, family.op))
            })
        })
}

/// Sub-byte elements are moved in byte containers.
fn container_bits(elem_bits: u32) -> u32 {
    elem_bits.max(8)
}

/// Number of elements of `elem_bits` packed in one container.
pub fn elements_per_container(elem_bits: u32) -> usize {
    (container_bits(elem_bits) / elem_bits) as usize
}

/// Selects the largest load or store that tiles `(rows, cols)` exactly.
///
/// `rows` and `cols` are in memory orientation, `cols` being the contiguous dimension.
pub fn select_transfer(
    elem_bits: u32,
    op: BlockOp,
    transform: BlockTransform,
    rows: usize,
    cols: usize,
) -> Result<BlockTransfer, MatmulSetupError> {
    let per_container = elements_per_container(elem_bits);
    if cols % per_container != 0 {
        return Err(unsupported_shape(elem_bits, op, transform, rows, cols));
    }
    let containers = cols / per_container;

    supported_transfers(elem_bits)
        .filter(|transfer| transfer.op == op && transfer.transform == transform)
        .filter(|transfer| rows % transfer.rows() == 0 && containers % transfer.cols() == 0)
        .max_by_key(|transfer| (transfer.elements(), transfer.cols()))
        .ok_or_else(|| unsupported_shape(elem_bits, op, transform, rows, cols))
}

/// Selects the prefetch covering as much of `(rows, cols)` as possible in one instruction.
///
/// Prefetches never fault, so the block may overreach the tile when the tile is narrower
/// than the smallest block.
pub fn select_prefetch(elem_bits: u32, rows: usize, cols: usize) -> BlockTransfer {
    let containers = cols.div_ceil(elements_per_container(elem_bits));
    let max_cols = MAX_BLOCK_ROW_BYTES * 8 / container_bits(elem_bits) as usize;

    let candidates = || {
        supported_transfers(elem_bits)
            .filter(|transfer| transfer.op == Load && transfer.transform == BlockTransform::None)
    };

    let fitting = candidates()
        .filter(|transfer| transfer.rows() <= rows.max(1))
        .filter(|transfer| transfer.cols() <= containers.min(max_cols).max(1))
        .max_by_key(|transfer| (transfer.elements(), transfer.cols()));

    let transfer = match fitting {
        Some(transfer) => transfer,
        None => candidates()
            .filter(|transfer| transfer.rows() <= rows.max(1))
            .min_by_key(|transfer| (transfer.cols(), usize::MAX - transfer.rows()))
            .unwrap_or_else(|| instruction(&TRANSFER_FAMILIES[0], 1, 32, Load)),
    };

    BlockTransfer {
        op: BlockOp::Prefetch,
        ..transfer
    }
}

fn unsupported_shape(
    elem_bits: u32,
    op: BlockOp,
    transform: BlockTransform,
    rows: usize,
    cols: usize,
) -> MatmulSetupError {
    MatmulSetupError::InvalidConfig(FormattedConfigError::new(move || {
        format!(
            "No {op:?} block transfer of {elem_bits}-bit elements with transform {transform:?} tiles a {rows}x{cols} region"
        )
    }))
}
