//! Blockwise low-bit quantization of dense weight matrices.
//!
//! Three packed layouts are produced, each consumed byte-for-byte by a
//! downstream matmul kernel:
//!
//! - the column-stacked Q4 GEMM operand ([`gemm`]),
//! - the column-major transposed blockwise layout ([`Blockwise`]),
//! - the row-major row-packed layout used by Quantize/Dequantize operator
//!   pairs ([`Qdq`]).
//!
//! All routines are pure functions over caller-owned slices and parallelize
//! over independent tiles via [`parallel_for`].

mod bits;
mod blockwise;
mod dispatch;
pub mod gemm;
mod parallel;
mod qdq;
mod range;

pub use ::half::{bf16, f16};

pub use bits::Bits;
pub use blockwise::Blockwise;
pub use dispatch::{
    blockwise_quant_meta_shape, blockwise_quantized_buffer_sizes, blockwise_quantized_shape,
    dequantize_blockwise, qdq_quantize_column_wise, qdq_transpose, quantize_blockwise,
    BufferSizes,
};
pub use parallel::parallel_for;
pub use qdq::Qdq;

/// Scalar types a source matrix and its scales may use.
///
/// Arithmetic always happens in `f32`; narrower types round-trip through it.
pub trait Element: Copy + Send + Sync + 'static {
    fn to_f32(self) -> f32;
    fn from_f32(v: f32) -> Self;
}

impl Element for f32 {
    #[inline]
    fn to_f32(self) -> f32 {
        self
    }
    #[inline]
    fn from_f32(v: f32) -> Self {
        v
    }
}

impl Element for f16 {
    #[inline]
    fn to_f32(self) -> f32 {
        f16::to_f32(self)
    }
    #[inline]
    fn from_f32(v: f32) -> Self {
        f16::from_f32(v)
    }
}

impl Element for bf16 {
    #[inline]
    fn to_f32(self) -> f32 {
        bf16::to_f32(self)
    }
    #[inline]
    fn from_f32(v: f32) -> Self {
        bf16::from_f32(v)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum QuantizeError {
    /// The requested bit width has no specialization.
    UnsupportedBits,
    /// The requested block size has no specialization.
    UnsupportedBlockSize,
    /// A buffer is smaller than the size helpers require.
    LengthMismatch,
}
