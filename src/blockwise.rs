//! The generic blockwise quantizer: 2-D block tiling with a per-block scale
//! (and optional zero point), emitting a column-major, nibble-packed,
//! transposed operand for the fused matmul.

use std::marker::PhantomData;

use crate::bits::Bits;
use crate::parallel::{parallel_for, SharedSlice};
use crate::range::{range_to_scale, range_to_scale_zp};
use crate::{Element, QuantizeError};

/// Quantizer specialized for one `(element, block size, width, axis)`
/// combination.
///
/// `COLUMNWISE` blocks are `[B, 1]`: one scale per vertical stripe of a
/// single column. Otherwise blocks are `[1, B]`.
pub struct Blockwise<T, const B: usize, const QBITS: u32, const COLUMNWISE: bool> {
    _marker: PhantomData<T>,
}

impl<T: Element, const B: usize, const QBITS: u32, const COLUMNWISE: bool>
    Blockwise<T, B, QBITS, COLUMNWISE>
{
    const BLOCK_ROWS: usize = if COLUMNWISE { B } else { 1 };
    const BLOCK_COLS: usize = if COLUMNWISE { 1 } else { B };

    // A tile stacks PACK blocks along the quantization axis so the zero
    // points it produces fill whole bytes.
    const TILE_ROWS: usize = Self::BLOCK_ROWS * Bits::<QBITS>::PACK;
    const TILE_COLS: usize = Self::BLOCK_COLS;

    /// Shape of the scale (and zero point) grid.
    pub fn meta_shape(rows: usize, columns: usize) -> (usize, usize) {
        (
            rows.div_ceil(Self::BLOCK_ROWS),
            columns.div_ceil(Self::BLOCK_COLS),
        )
    }

    /// Shape of the packed payload, stored column major and packed along
    /// each column.
    pub fn quantized_shape(rows: usize, columns: usize) -> (usize, usize) {
        let (meta_rows, meta_cols) = Self::meta_shape(rows, columns);
        let q_rows = (meta_rows * Self::BLOCK_ROWS * QBITS as usize).div_ceil(8);
        let q_cols = meta_cols * Self::BLOCK_COLS;
        (q_rows, q_cols)
    }

    /// Exact byte and element counts of the three output buffers:
    /// `(payload bytes, scale elements, zero point bytes)`.
    pub fn buffer_sizes(rows: usize, columns: usize) -> (usize, usize, usize) {
        let (meta_rows, meta_cols) = Self::meta_shape(rows, columns);
        let (q_rows, q_cols) = Self::quantized_shape(rows, columns);
        let zp_bytes = (meta_rows * QBITS as usize).div_ceil(8) * meta_cols;
        (q_rows * q_cols, meta_rows * meta_cols, zp_bytes)
    }

    /// Quantize a row-major `[rows, columns]` source (leading dimension
    /// `ld`) into the column-major packed layout. Scales (and packed zero
    /// points, when requested) land column major over the meta grid.
    ///
    /// Tiles own disjoint bytes of every output, so the pool never needs
    /// synchronization beyond its final join.
    #[allow(clippy::too_many_arguments)]
    pub fn quantize(
        dst: &mut [u8],
        scales: &mut [T],
        zero_points: Option<&mut [u8]>,
        src: &[T],
        rows: usize,
        columns: usize,
        ld: usize,
        pool: Option<&rayon::ThreadPool>,
    ) -> Result<(), QuantizeError> {
        const { assert!(QBITS == 4, "only 4-bit payloads are packed here") }

        let (data_bytes, scale_count, zp_bytes) = Self::buffer_sizes(rows, columns);
        if dst.len() < data_bytes || scales.len() < scale_count {
            return Err(QuantizeError::LengthMismatch);
        }
        if let Some(zp) = &zero_points {
            if zp.len() < zp_bytes {
                return Err(QuantizeError::LengthMismatch);
            }
        }
        if rows > 0 && columns > 0 && (ld < columns || src.len() < (rows - 1) * ld + columns) {
            return Err(QuantizeError::LengthMismatch);
        }

        let tile_rows = rows.div_ceil(Self::TILE_ROWS);
        let tile_cols = columns.div_ceil(Self::TILE_COLS);
        let row_blks = rows.div_ceil(Self::BLOCK_ROWS);
        let (q_rows, _) = Self::quantized_shape(rows, columns);

        let has_zp = zero_points.is_some();
        let dst = SharedSlice::new(dst);
        let scales = SharedSlice::new(scales);
        let zero_points = zero_points.map(SharedSlice::new);

        parallel_for(pool, tile_rows * tile_cols, |tile| {
            // Zero-point lanes default to the midpoint; lanes whose block
            // scans no rows keep it.
            let mut zp_pair = [Bits::<QBITS>::MID; 2];

            let r = (tile / tile_cols) * Self::TILE_ROWS;
            let c = (tile % tile_cols) * Self::TILE_COLS;
            let r_end = (r + Self::TILE_ROWS).min(rows);
            let c_end = (c + Self::TILE_COLS).min(columns);
            let meta_row = r / Self::BLOCK_ROWS;
            let meta_col = c / Self::BLOCK_COLS;

            for kpack in 0..Bits::<QBITS>::PACK {
                let row_start = r + kpack * Self::BLOCK_ROWS;
                let row_end = (row_start + Self::BLOCK_ROWS).min(r_end);
                if row_start >= row_end {
                    continue;
                }

                let mut min = f32::MAX;
                let mut max = f32::MIN;
                for i in row_start..row_end {
                    for j in c..c_end {
                        let v = src[i * ld + j].to_f32();
                        min = min.min(v);
                        max = max.max(v);
                    }
                }

                let meta_idx = meta_col * row_blks + meta_row + kpack;
                let scale = if has_zp {
                    let (scale, zp) = range_to_scale_zp::<QBITS>(min, max);
                    zp_pair[kpack] = zp;
                    scale
                } else {
                    range_to_scale::<QBITS>(min, max)
                };
                // SAFETY: meta_idx is owned by this tile.
                unsafe { scales.store(meta_idx, T::from_f32(scale)) };
            }

            if let Some(zp_out) = &zero_points {
                let meta_idx = meta_col * row_blks.div_ceil(2) + meta_row / 2;
                // SAFETY: the byte holds exactly this tile's two lanes.
                unsafe { zp_out.store(meta_idx, (zp_pair[0] & 0xf) | (zp_pair[1] << 4)) };
            }

            for j in c..c_end {
                let meta_c = j / Self::BLOCK_COLS;
                let mut i = r;
                while i < r_end {
                    let meta_r = i / Self::BLOCK_ROWS;
                    // Scales are read back as stored so any narrowing is
                    // part of the contract.
                    // SAFETY: written above by this same tile.
                    let scale = unsafe { scales.load(meta_c * row_blks + meta_r) }.to_f32();
                    let recip = if scale != 0.0 { scale.recip() } else { 0.0 };
                    let zp = zp_pair[meta_r & 1];
                    let zp1 = zp_pair[((i + 1) / Self::BLOCK_ROWS) & 1];

                    let v0 = src[i * ld + j].to_f32();
                    let q0 = (v0 * recip + zp as f32)
                        .round()
                        .clamp(0.0, Bits::<QBITS>::MAX_F) as u8;

                    // A row past the tile encodes its block's zero.
                    let mut q1 = zp;
                    if i + 1 < r_end {
                        let recip1 = if Self::BLOCK_ROWS == 1 {
                            let s1 =
                                unsafe { scales.load(meta_c * row_blks + meta_r + 1) }.to_f32();
                            if s1 != 0.0 {
                                s1.recip()
                            } else {
                                0.0
                            }
                        } else {
                            recip
                        };
                        let v1 = src[(i + 1) * ld + j].to_f32();
                        q1 = (v1 * recip1 + zp1 as f32)
                            .round()
                            .clamp(0.0, Bits::<QBITS>::MAX_F) as u8;
                    }

                    // SAFETY: byte (j, i/2) belongs to this tile alone.
                    unsafe { dst.store(j * q_rows + i / 2, (q0 & 0xf) | (q1 << 4)) };
                    i += 2;
                }
            }
        });
        Ok(())
    }

    /// Invert [`Self::quantize`]: expand the packed operand into a dense
    /// column-major `[columns, rows]` matrix.
    ///
    /// Absent zero points read as the packed midpoint pair `0x88`.
    pub fn dequantize(
        dst: &mut [T],
        weights: &[u8],
        scales: &[T],
        zero_points: Option<&[u8]>,
        rows: usize,
        columns: usize,
        pool: Option<&rayon::ThreadPool>,
    ) -> Result<(), QuantizeError> {
        const { assert!(QBITS == 4, "only 4-bit payloads are packed here") }

        let (data_bytes, scale_count, zp_bytes) = Self::buffer_sizes(rows, columns);
        if weights.len() < data_bytes || scales.len() < scale_count {
            return Err(QuantizeError::LengthMismatch);
        }
        if let Some(zp) = &zero_points {
            if zp.len() < zp_bytes {
                return Err(QuantizeError::LengthMismatch);
            }
        }
        if dst.len() < rows * columns {
            return Err(QuantizeError::LengthMismatch);
        }

        let tile_rows = rows.div_ceil(Self::TILE_ROWS);
        let tile_cols = columns.div_ceil(Self::TILE_COLS);
        let row_blks = rows.div_ceil(Self::BLOCK_ROWS);
        let (q_rows, _) = Self::quantized_shape(rows, columns);

        let dst = SharedSlice::new(dst);

        parallel_for(pool, tile_rows * tile_cols, |tile| {
            let r = (tile / tile_cols) * Self::TILE_ROWS;
            let c = (tile % tile_cols) * Self::TILE_COLS;
            let r_end = (r + Self::TILE_ROWS).min(rows);
            let c_end = (c + Self::TILE_COLS).min(columns);

            for j in c..c_end {
                let meta_c = j / Self::BLOCK_COLS;
                let mut i = r;
                while i < r_end {
                    let meta_r = i / Self::BLOCK_ROWS;
                    let scale0 = scales[meta_c * row_blks + meta_r].to_f32();
                    let zp_byte = match zero_points {
                        Some(zp) => zp[meta_c * row_blks.div_ceil(2) + meta_r / 2],
                        None => 0x88,
                    };
                    let zp0 = if meta_r & 1 == 1 {
                        (zp_byte >> 4) as i32
                    } else {
                        (zp_byte & 0xf) as i32
                    };

                    let byte = weights[j * q_rows + i / 2];
                    let v0 = ((byte & 0xf) as i32 - zp0) as f32 * scale0;
                    // SAFETY: element (j, i) belongs to this tile alone.
                    unsafe { dst.store(j * rows + i, T::from_f32(v0)) };

                    if i + 1 < r_end {
                        let (scale1, zp1) = if Self::BLOCK_ROWS == 1 {
                            (
                                scales[meta_c * row_blks + meta_r + 1].to_f32(),
                                (zp_byte >> 4) as i32,
                            )
                        } else {
                            (scale0, zp0)
                        };
                        let v1 = ((byte >> 4) as i32 - zp1) as f32 * scale1;
                        // SAFETY: as above.
                        unsafe { dst.store(j * rows + i + 1, T::from_f32(v1)) };
                    }
                    i += 2;
                }
            }
        });
        Ok(())
    }
}
