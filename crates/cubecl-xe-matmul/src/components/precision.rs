use std::any::TypeId;
use std::fmt::Debug;

use bytemuck::{Pod, Zeroable};
use half::{bf16, f16};

/// Scalar that can live in an operand or accumulator tensor.
///
/// Conversions go through `f32`, which is exact for every operand type. Accumulation goes
/// through [mul_add](Numeric::mul_add) and [add](Numeric::add), which integer accumulators
/// implement natively so their sums stay exact past `2^24`.
pub trait Numeric: Pod + Default + PartialEq + Debug + Send + Sync + 'static {
    /// Width of one element in bits.
    const BITS: u32;
    /// Short name used in block transfer instruction names and logs.
    const NAME: &'static str;

    fn to_f32(self) -> f32;
    fn from_f32(value: f32) -> Self;

    /// Exact for every supported type, `i32` included.
    fn to_f64(self) -> f64 {
        self.to_f32() as f64
    }

    fn from_f64(value: f64) -> Self {
        Self::from_f32(value as f32)
    }

    /// `self + lhs · rhs`, rounded once to `Self`.
    fn mul_add<A: Numeric, B: Numeric>(self, lhs: A, rhs: B) -> Self {
        Self::from_f32(self.to_f32() + lhs.to_f32() * rhs.to_f32())
    }

    fn add(self, other: Self) -> Self {
        Self::from_f32(self.to_f32() + other.to_f32())
    }

    /// Width of one element in bytes, rounded up.
    fn size_bytes() -> usize {
        (Self::BITS as usize).div_ceil(8)
    }
}

impl Numeric for f32 {
    const BITS: u32 = 32;
    const NAME: &'static str = "f32";

    fn to_f32(self) -> f32 {
        self
    }

    fn from_f32(value: f32) -> Self {
        value
    }
}

impl Numeric for f16 {
    const BITS: u32 = 16;
    const NAME: &'static str = "f16";

    fn to_f32(self) -> f32 {
        f16::to_f32(self)
    }

    fn from_f32(value: f32) -> Self {
        f16::from_f32(value)
    }
}

impl Numeric for bf16 {
    const BITS: u32 = 16;
    const NAME: &'static str = "bf16";

    fn to_f32(self) -> f32 {
        bf16::to_f32(self)
    }

    fn from_f32(value: f32) -> Self {
        bf16::from_f32(value)
    }
}

impl Numeric for i8 {
    const BITS: u32 = 8;
    const NAME: &'static str = "i8";

    fn to_f32(self) -> f32 {
        self as f32
    }

    fn from_f32(value: f32) -> Self {
        value.round().clamp(i8::MIN as f32, i8::MAX as f32) as i8
    }
}

impl Numeric for u8 {
    const BITS: u32 = 8;
    const NAME: &'static str = "u8";

    fn to_f32(self) -> f32 {
        self as f32
    }

    fn from_f32(value: f32) -> Self {
        value.round().clamp(0.0, u8::MAX as f32) as u8
    }
}

impl Numeric for i32 {
    const BITS: u32 = 32;
    const NAME: &'static str = "i32";

    fn to_f32(self) -> f32 {
        self as f32
    }

    fn from_f32(value: f32) -> Self {
        value.round() as i32
    }

    fn to_f64(self) -> f64 {
        self as f64
    }

    fn from_f64(value: f64) -> Self {
        value.round() as i32
    }

    /// Products of integer operands are exact in `f64`; the sum wraps like the hardware.
    fn mul_add<A: Numeric, B: Numeric>(self, lhs: A, rhs: B) -> Self {
        self.wrapping_add((lhs.to_f64() * rhs.to_f64()).round() as i32)
    }

    fn add(self, other: Self) -> Self {
        self.wrapping_add(other)
    }
}

/// Signed 4-bit integer.
///
/// Host memory keeps one value per byte; only [Numeric::BITS] reflects the packed width the
/// hardware would see.
#[allow(non_camel_case_types)]
#[repr(transparent)]
#[derive(Clone, Copy, Default, PartialEq, Eq, Debug, Pod, Zeroable)]
pub struct i4(i8);

impl i4 {
    pub const MIN: i8 = -8;
    pub const MAX: i8 = 7;

    /// Saturating constructor.
    pub fn new(value: i8) -> Self {
        Self(value.clamp(Self::MIN, Self::MAX))
    }

    pub fn get(self) -> i8 {
        self.0
    }
}

impl Numeric for i4 {
    const BITS: u32 = 4;
    const NAME: &'static str = "i4";

    fn to_f32(self) -> f32 {
        self.0 as f32
    }

    fn from_f32(value: f32) -> Self {
        Self(value.round().clamp(Self::MIN as f32, Self::MAX as f32) as i8)
    }
}

/// Whether two element types are the same type.
pub fn same_type<A: Numeric, B: Numeric>() -> bool {
    TypeId::of::<A>() == TypeId::of::<B>()
}

/// Matrix multiplication precisions.
pub trait MatmulPrecision: Send + Sync + Copy + 'static {
    /// Element types of the A operand.
    type Lhs: MatrixPrecision;
    /// Element types of the B operand(s).
    type Rhs: MatrixPrecision;
    /// Element types of the accumulator and of C/D.
    type Acc: MatrixPrecision;
}

pub trait MatrixPrecision: Send + Sync + Copy + 'static {
    /// Element type of the tensor in global memory
    type Global: Numeric;
    /// Element type once in registers for computation
    type Register: Numeric;
}

impl<EG: Numeric, ER: Numeric> MatrixPrecision for (EG, ER) {
    type Global = EG;
    type Register = ER;
}

impl<Lhs: MatrixPrecision, Rhs: MatrixPrecision, Acc: MatrixPrecision> MatmulPrecision
    for (Lhs, Rhs, Acc)
{
    type Lhs = Lhs;
    type Rhs = Rhs;
    type Acc = Acc;
}

impl MatmulPrecision for bf16 {
    type Lhs = (bf16, bf16);
    type Rhs = (bf16, bf16);
    type Acc = (f32, f32);
}

impl MatmulPrecision for f16 {
    type Lhs = (f16, f16);
    type Rhs = (f16, f16);
    type Acc = (f32, f32);
}

impl MatmulPrecision for f32 {
    type Lhs = (f32, f32);
    type Rhs = (f32, f32);
    type Acc = (f32, f32);
}

impl MatmulPrecision for i8 {
    type Lhs = (i8, i8);
    type Rhs = (i8, i8);
    type Acc = (i32, i32);
}

pub type LhsG<MP> = <<MP as MatmulPrecision>::Lhs as MatrixPrecision>::Global;
pub type LhsR<MP> = <<MP as MatmulPrecision>::Lhs as MatrixPrecision>::Register;
pub type RhsG<MP> = <<MP as MatmulPrecision>::Rhs as MatrixPrecision>::Global;
pub type RhsR<MP> = <<MP as MatmulPrecision>::Rhs as MatrixPrecision>::Register;
pub type AccG<MP> = <<MP as MatmulPrecision>::Acc as MatrixPrecision>::Global;
pub type AccR<MP> = <<MP as MatmulPrecision>::Acc as MatrixPrecision>::Register;
