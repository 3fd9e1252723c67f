//! Runtime parameter dispatch onto the compile-time specializations.
//!
//! Every entry switches on `{qbits, block_size, columnwise}` and hands the
//! slices to the monomorphized implementation. Shape helpers report zeroed
//! shapes for unsupported parameters; compute entries return an error.

use log::debug;

use crate::blockwise::Blockwise;
use crate::qdq::{self, Qdq};
use crate::{Element, QuantizeError};

/// Exact sizes of the three blockwise output buffers.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct BufferSizes {
    /// Bytes of the packed payload, `q_rows * q_cols`.
    pub data_bytes: usize,
    /// Elements of the scale grid, `meta_rows * meta_cols`.
    pub scale_count: usize,
    /// Bytes of the packed zero points; meaningful only for asymmetric use.
    pub zero_point_bytes: usize,
}

macro_rules! blockwise_dispatch {
    ($block_size:expr, $columnwise:expr, $with:ident, $fallback:expr) => {
        match ($block_size, $columnwise) {
            (16, true) => $with!(16, true),
            (16, false) => $with!(16, false),
            (32, true) => $with!(32, true),
            (32, false) => $with!(32, false),
            (64, true) => $with!(64, true),
            (64, false) => $with!(64, false),
            (128, true) => $with!(128, true),
            (128, false) => $with!(128, false),
            (256, true) => $with!(256, true),
            (256, false) => $with!(256, false),
            _ => $fallback,
        }
    };
}

/// Shape of the scale (and zero point) grid, `(meta_rows, meta_cols)`.
/// Zeroed for unsupported parameters.
pub fn blockwise_quant_meta_shape(
    qbits: u32,
    block_size: usize,
    columnwise: bool,
    rows: usize,
    columns: usize,
) -> (usize, usize) {
    if qbits != 4 {
        return (0, 0);
    }
    macro_rules! with {
        ($b:literal, $cw:literal) => {
            Blockwise::<f32, $b, 4, $cw>::meta_shape(rows, columns)
        };
    }
    blockwise_dispatch!(block_size, columnwise, with, (0, 0))
}

/// Shape of the packed payload, `(q_rows, q_cols)`. Zeroed for unsupported
/// parameters.
pub fn blockwise_quantized_shape(
    qbits: u32,
    block_size: usize,
    columnwise: bool,
    rows: usize,
    columns: usize,
) -> (usize, usize) {
    if qbits != 4 {
        return (0, 0);
    }
    macro_rules! with {
        ($b:literal, $cw:literal) => {
            Blockwise::<f32, $b, 4, $cw>::quantized_shape(rows, columns)
        };
    }
    blockwise_dispatch!(block_size, columnwise, with, (0, 0))
}

/// Exact byte and element counts of the blockwise output buffers. Zeroed
/// for unsupported parameters.
pub fn blockwise_quantized_buffer_sizes(
    qbits: u32,
    block_size: usize,
    columnwise: bool,
    rows: usize,
    columns: usize,
) -> BufferSizes {
    if qbits != 4 {
        return BufferSizes::default();
    }
    macro_rules! with {
        ($b:literal, $cw:literal) => {{
            let (data_bytes, scale_count, zero_point_bytes) =
                Blockwise::<f32, $b, 4, $cw>::buffer_sizes(rows, columns);
            BufferSizes {
                data_bytes,
                scale_count,
                zero_point_bytes,
            }
        }};
    }
    blockwise_dispatch!(block_size, columnwise, with, BufferSizes::default())
}

/// Quantize a row-major source into the column-major packed layout.
/// See [`Blockwise::quantize`] for the per-specialization contract.
#[allow(clippy::too_many_arguments)]
pub fn quantize_blockwise<T: Element>(
    qbits: u32,
    dst: &mut [u8],
    scales: &mut [T],
    zero_points: Option<&mut [u8]>,
    src: &[T],
    block_size: usize,
    columnwise: bool,
    rows: usize,
    columns: usize,
    ld: usize,
    pool: Option<&rayon::ThreadPool>,
) -> Result<(), QuantizeError> {
    if qbits != 4 {
        return Err(QuantizeError::UnsupportedBits);
    }
    debug!(
        "blockwise quantize {rows}x{columns}, block_size={block_size}, columnwise={columnwise}"
    );
    macro_rules! with {
        ($b:literal, $cw:literal) => {
            Blockwise::<T, $b, 4, $cw>::quantize(
                dst,
                scales,
                zero_points,
                src,
                rows,
                columns,
                ld,
                pool,
            )
        };
    }
    blockwise_dispatch!(
        block_size,
        columnwise,
        with,
        Err(QuantizeError::UnsupportedBlockSize)
    )
}

/// Expand a column-major packed operand back into a dense column-major
/// matrix. See [`Blockwise::dequantize`].
#[allow(clippy::too_many_arguments)]
pub fn dequantize_blockwise<T: Element>(
    qbits: u32,
    dst: &mut [T],
    weights: &[u8],
    scales: &[T],
    zero_points: Option<&[u8]>,
    block_size: usize,
    columnwise: bool,
    rows: usize,
    columns: usize,
    pool: Option<&rayon::ThreadPool>,
) -> Result<(), QuantizeError> {
    if qbits != 4 {
        return Err(QuantizeError::UnsupportedBits);
    }
    debug!(
        "blockwise dequantize {rows}x{columns}, block_size={block_size}, columnwise={columnwise}"
    );
    macro_rules! with {
        ($b:literal, $cw:literal) => {
            Blockwise::<T, $b, 4, $cw>::dequantize(
                dst,
                weights,
                scales,
                zero_points,
                rows,
                columns,
                pool,
            )
        };
    }
    blockwise_dispatch!(
        block_size,
        columnwise,
        with,
        Err(QuantizeError::UnsupportedBlockSize)
    )
}

/// Quantize column-wise blocks into the row-major row-packed layout.
/// See [`Qdq::quantize_column_wise`].
#[allow(clippy::too_many_arguments)]
pub fn qdq_quantize_column_wise<T: Element>(
    qbits: u32,
    src: &[T],
    scales: &mut [T],
    zero_points: Option<&mut [u8]>,
    dst: &mut [u8],
    rows: usize,
    columns: usize,
    quant_block_size: usize,
    pool: Option<&rayon::ThreadPool>,
) -> Result<(), QuantizeError> {
    debug!("qdq quantize {rows}x{columns}, qbits={qbits}, block_size={quant_block_size}");
    match qbits {
        2 => Qdq::<T, 2>::quantize_column_wise(
            src,
            scales,
            zero_points,
            dst,
            rows,
            columns,
            quant_block_size,
            pool,
        ),
        4 => Qdq::<T, 4>::quantize_column_wise(
            src,
            scales,
            zero_points,
            dst,
            rows,
            columns,
            quant_block_size,
            pool,
        ),
        _ => Err(QuantizeError::UnsupportedBits),
    }
}

/// Repack a row-major row-packed tensor into the column-major blocked
/// operand. See [`qdq::transpose`].
pub fn qdq_transpose(
    qbits: u32,
    src: &[u8],
    dst: &mut [u8],
    rows: usize,
    columns: usize,
    quant_block_size: usize,
    pool: Option<&rayon::ThreadPool>,
) -> Result<(), QuantizeError> {
    match qbits {
        2 => qdq::transpose::<2>(src, dst, rows, columns, quant_block_size, pool),
        4 => qdq::transpose::<4>(src, dst, rows, columns, quant_block_size, pool),
        _ => Err(QuantizeError::UnsupportedBits),
    }
}
