//! Row-packed quantization for graph-level Quantize/Dequantize operator
//! pairs.
//!
//! Unlike [`crate::Blockwise`], the output keeps the source's row-major
//! `[rows, columns]` shape: `PACK` adjacent elements of a row share one
//! byte, so in bytes the tensor is `rows * columns / PACK`. Scales are row
//! major over the meta grid and zero points are themselves packed.

use std::marker::PhantomData;

use crate::bits::Bits;
use crate::parallel::{parallel_for, SharedSlice};
use crate::range::{range_to_scale, range_to_scale_zp};
use crate::{Element, QuantizeError};

/// Quantizer for one `(element, width)` combination, 4-bit or 2-bit.
pub struct Qdq<T, const QBITS: u32> {
    _marker: PhantomData<T>,
}

impl<T: Element, const QBITS: u32> Qdq<T, QBITS> {
    const PACK: usize = Bits::<QBITS>::PACK;
    const SHIFT: u32 = Bits::<QBITS>::SHIFT;

    // Column stride of a thread tile; a multiple of PACK for both widths.
    const TILE_COLS: usize = 16;

    /// Quantize column-wise blocks of `quant_block_size` rows, packing the
    /// output along rows. Scales land row major,
    /// `[ceil(rows / quant_block_size), columns]`; zero points share that
    /// shape but pack `PACK` per byte.
    ///
    /// `columns` must be a multiple of `PACK` so every packed byte (and
    /// every zero-point byte) is produced by a single tile.
    #[allow(clippy::too_many_arguments)]
    pub fn quantize_column_wise(
        src: &[T],
        scales: &mut [T],
        zero_points: Option<&mut [u8]>,
        dst: &mut [u8],
        rows: usize,
        columns: usize,
        quant_block_size: usize,
        pool: Option<&rayon::ThreadPool>,
    ) -> Result<(), QuantizeError> {
        const { assert!(QBITS == 4 || QBITS == 2, "only 4-bit or 2-bit packing is supported") }
        assert!(
            columns % Self::PACK == 0,
            "column count {columns} must be a multiple of {} for {QBITS}-bit row packing",
            Self::PACK,
        );
        if quant_block_size == 0 {
            return Err(QuantizeError::UnsupportedBlockSize);
        }

        let row_blks = rows.div_ceil(quant_block_size);
        let scale_count = row_blks * columns;
        if scales.len() < scale_count || dst.len() < (rows * columns) >> Self::SHIFT {
            return Err(QuantizeError::LengthMismatch);
        }
        if let Some(zp) = &zero_points {
            if zp.len() < scale_count >> Self::SHIFT {
                return Err(QuantizeError::LengthMismatch);
            }
        }
        if src.len() < rows * columns {
            return Err(QuantizeError::LengthMismatch);
        }

        let col_tiles = columns.div_ceil(Self::TILE_COLS);
        let has_zp = zero_points.is_some();
        let dst = SharedSlice::new(dst);
        let scales = SharedSlice::new(scales);
        let zero_points = zero_points.map(SharedSlice::new);

        parallel_for(pool, row_blks * col_tiles, |tile| {
            let mut zp_t = [Bits::<QBITS>::MID; 4];
            let mut out_t = [0u8; 4];
            let mut recip_t = [0.0f32; 4];
            let mut zp_f_t = [0.0f32; 4];
            let mut vmin_t = [0.0f32; 4];
            let mut vmax_t = [0.0f32; 4];

            let row_blk_idx = tile / col_tiles;
            let col_idx = (tile % col_tiles) * Self::TILE_COLS;
            let row_idx = row_blk_idx * quant_block_size;
            let row_size = quant_block_size.min(rows - row_idx);
            let col_size = Self::TILE_COLS.min(columns - col_idx);

            let mut input_idx = row_idx * columns + col_idx;
            let mut scale_idx = row_blk_idx * columns + col_idx;
            let input_end = input_idx + col_size;

            // PACK side-by-side column blocks per step, so their zero
            // points and quantized lanes fill whole bytes.
            while input_idx < input_end {
                zp_t[..Self::PACK].fill(Bits::<QBITS>::MID);
                vmin_t[..Self::PACK].fill(f32::MAX);
                vmax_t[..Self::PACK].fill(f32::MIN);

                let mut idx = input_idx;
                for _ in 0..row_size {
                    for lane in 0..Self::PACK {
                        let v = src[idx + lane].to_f32();
                        vmin_t[lane] = vmin_t[lane].min(v);
                        vmax_t[lane] = vmax_t[lane].max(v);
                    }
                    idx += columns;
                }

                for lane in 0..Self::PACK {
                    let scale = if has_zp {
                        let (scale, zp) = range_to_scale_zp::<QBITS>(vmin_t[lane], vmax_t[lane]);
                        zp_t[lane] = zp;
                        scale
                    } else {
                        range_to_scale::<QBITS>(vmin_t[lane], vmax_t[lane])
                    };
                    let stored = T::from_f32(scale);
                    // SAFETY: scale_idx + lane is owned by this tile.
                    unsafe { scales.store(scale_idx + lane, stored) };

                    let scale = stored.to_f32();
                    recip_t[lane] = if scale != 0.0 { scale.recip() } else { 0.0 };
                    zp_f_t[lane] = zp_t[lane] as f32;
                }

                if let Some(zp_out) = &zero_points {
                    // SAFETY: the byte holds exactly this tile's lanes.
                    unsafe {
                        zp_out.store(
                            scale_idx >> Self::SHIFT,
                            Bits::<QBITS>::pack(&zp_t[..Self::PACK]),
                        )
                    };
                }

                let mut idx = input_idx;
                for _ in 0..row_size {
                    for lane in 0..Self::PACK {
                        let v = src[idx + lane].to_f32();
                        out_t[lane] = ((v * recip_t[lane]).round() + zp_f_t[lane])
                            .clamp(0.0, Bits::<QBITS>::MAX_F)
                            as u8;
                    }
                    // SAFETY: byte idx >> SHIFT belongs to this tile alone.
                    unsafe {
                        dst.store(idx >> Self::SHIFT, Bits::<QBITS>::pack(&out_t[..Self::PACK]))
                    };
                    idx += columns;
                }

                input_idx += Self::PACK;
                scale_idx += Self::PACK;
            }
        });
        Ok(())
    }

    /// Row-wise blocks with row packing. Reserved; no caller needs it yet.
    #[allow(clippy::too_many_arguments)]
    pub fn quantize_row_wise(
        _src: &[T],
        _scales: &mut [T],
        _zero_points: Option<&mut [u8]>,
        _dst: &mut [u8],
        _rows: usize,
        _columns: usize,
        _quant_block_size: usize,
        _pool: Option<&rayon::ThreadPool>,
    ) -> Result<(), QuantizeError> {
        unimplemented!("row-wise quantization")
    }
}

/// Repack a row-major row-packed tensor into the column-major blocked
/// operand consumed by the fused matmul:
/// `[columns, ceil(rows / quant_block_size), ceil(quant_block_size * QBITS / 8)]`
/// bytes. Packed values move as opaque bit groups; trailing groups of a
/// ragged final block stay zero.
pub fn transpose<const QBITS: u32>(
    src: &[u8],
    dst: &mut [u8],
    rows: usize,
    columns: usize,
    quant_block_size: usize,
    pool: Option<&rayon::ThreadPool>,
) -> Result<(), QuantizeError> {
    const { assert!(QBITS == 4 || QBITS == 2, "only 4-bit or 2-bit packing is supported") }
    let pack = Bits::<QBITS>::PACK;
    let shift = Bits::<QBITS>::SHIFT;
    assert!(
        columns % pack == 0,
        "column count {columns} must be a multiple of {pack} for {QBITS}-bit row packing",
    );
    if quant_block_size == 0 {
        return Err(QuantizeError::UnsupportedBlockSize);
    }

    let k_blocks = rows.div_ceil(quant_block_size);
    let blob = (quant_block_size * QBITS as usize).div_ceil(8);
    if src.len() < (rows * columns) >> shift || dst.len() < columns * k_blocks * blob {
        return Err(QuantizeError::LengthMismatch);
    }

    let dst = SharedSlice::new(dst);
    parallel_for(pool, columns, |n| {
        let base = n * k_blocks * blob;
        // This column's blobs are exclusively ours; build them in place.
        for b in 0..k_blocks * blob {
            // SAFETY: [base, base + k_blocks * blob) is this tile's region.
            unsafe { dst.store(base + b, 0) };
        }
        for i in 0..rows {
            let flat = i * columns + n;
            let q = Bits::<QBITS>::unpack(src[flat >> shift], flat % pack);
            let off = base + (i / quant_block_size) * blob + ((i % quant_block_size) >> shift);
            let lane = (i % quant_block_size) % pack;
            // SAFETY: as above; the read-modify-write stays inside the tile.
            unsafe {
                let cur = dst.load(off);
                dst.store(off, cur | (q << (lane as u32 * QBITS)));
            }
        }
    });
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn two_bit_row_packing() {
        // Column blocks span both rows; every column stretches over [0, 3]
        // so scales are 1 and zero points 0.
        let src = [0.0f32, 1.0, 2.0, 3.0, 3.0, 3.0, 3.0, 3.0];
        let (rows, columns) = (2usize, 4usize);

        let mut dst = vec![0u8; 2];
        let mut scales = vec![0.0f32; 4];
        let mut zps = vec![0u8; 1];
        Qdq::<f32, 2>::quantize_column_wise(
            &src,
            &mut scales,
            Some(&mut zps[..]),
            &mut dst,
            rows,
            columns,
            16,
            None,
        )
        .unwrap();

        assert_eq!(scales, [1.0; 4]);
        assert_eq!(zps[0], 0x00);
        assert_eq!(dst[0], 0xE4); // 0 | 1 << 2 | 2 << 4 | 3 << 6
        assert_eq!(dst[1], 0xFF);
    }

    #[test]
    fn four_bit_row_packing() {
        let src = [0.0f32, 15.0, 15.0, 0.0];
        let (rows, columns) = (2usize, 2usize);

        let mut dst = vec![0u8; 2];
        let mut scales = vec![0.0f32; 2];
        let mut zps = vec![0u8; 1];
        Qdq::<f32, 4>::quantize_column_wise(
            &src,
            &mut scales,
            Some(&mut zps[..]),
            &mut dst,
            rows,
            columns,
            16,
            None,
        )
        .unwrap();

        assert_eq!(scales, [1.0; 2]);
        assert_eq!(zps[0], 0x00);
        assert_eq!(dst[0], 0xF0);
        assert_eq!(dst[1], 0x0F);
    }

    #[test]
    fn symmetric_quantizes_around_midpoint() {
        let src = [-8.0f32, 8.0, 4.0, -8.0];
        let (rows, columns) = (2usize, 2usize);

        let mut dst = vec![0u8; 2];
        let mut scales = vec![0.0f32; 2];
        Qdq::<f32, 4>::quantize_column_wise(
            &src, &mut scales, None, &mut dst, rows, columns, 16, None,
        )
        .unwrap();

        // Column 0 range [-8, 8]: the tie goes to the min, scale 1.
        assert_eq!(scales[0], 1.0);
        // Column 1 range [-8, 8] likewise.
        assert_eq!(scales[1], 1.0);
        // q = round(v / scale) + 8.
        assert_eq!(dst[0] & 0xf, 0);
        assert_eq!(dst[0] >> 4, 15); // 16 clamps to 15
        assert_eq!(dst[1] & 0xf, 12);
        assert_eq!(dst[1] >> 4, 0);
    }

    #[test]
    fn bf16_elements_quantize_like_f32() {
        use crate::bf16;

        let data = [0.0f32, 15.0, 15.0, 0.0];
        let src: Vec<bf16> = data.iter().map(|&v| bf16::from_f32(v)).collect();
        let (rows, columns) = (2usize, 2usize);

        let mut dst = vec![0u8; 2];
        let mut scales = vec![bf16::ZERO; 2];
        let mut zps = vec![0u8; 1];
        Qdq::<bf16, 4>::quantize_column_wise(
            &src,
            &mut scales,
            Some(&mut zps[..]),
            &mut dst,
            rows,
            columns,
            16,
            None,
        )
        .unwrap();

        assert_eq!(scales, [bf16::ONE; 2]);
        assert_eq!(dst[0], 0xF0);
        assert_eq!(dst[1], 0x0F);
    }

    #[test]
    fn roundtrip_column_wise() {
        use rand::Rng;

        let (rows, columns, block) = (45usize, 32usize, 16usize);
        let mut src = vec![0.0f32; rows * columns];
        rand::thread_rng().fill(&mut src[..]);
        for v in &mut src {
            *v = *v * 2.0 - 1.0;
        }

        let row_blks = rows.div_ceil(block);
        let mut dst = vec![0u8; rows * columns / 2];
        let mut scales = vec![0.0f32; row_blks * columns];
        let mut zps = vec![0u8; row_blks * columns / 2];
        Qdq::<f32, 4>::quantize_column_wise(
            &src,
            &mut scales,
            Some(&mut zps[..]),
            &mut dst,
            rows,
            columns,
            block,
            None,
        )
        .unwrap();

        for i in 0..rows {
            for j in 0..columns {
                let flat = i * columns + j;
                let q = Bits::<4>::unpack(dst[flat >> 1], flat % 2) as i32;
                let scale_idx = (i / block) * columns + j;
                let scale = scales[scale_idx];
                let zp = Bits::<4>::unpack(zps[scale_idx >> 1], scale_idx % 2) as i32;
                let got = (q - zp) as f32 * scale;
                assert!(
                    (src[flat] - got).abs() <= scale.abs() + 1e-6,
                    "({i}, {j}): {} vs {got}",
                    src[flat],
                );
            }
        }
    }

    #[test]
    #[should_panic(expected = "multiple of")]
    fn odd_column_count_is_fatal() {
        let src = [0.0f32; 6];
        let mut dst = vec![0u8; 3];
        let mut scales = vec![0.0f32; 3];
        let _ = Qdq::<f32, 4>::quantize_column_wise(
            &src, &mut scales, None, &mut dst, 2, 3, 16, None,
        );
    }

    #[test]
    #[should_panic(expected = "row-wise quantization")]
    fn row_wise_is_reserved() {
        let src = [0.0f32; 4];
        let mut dst = vec![0u8; 2];
        let mut scales = vec![0.0f32; 2];
        let _ =
            Qdq::<f32, 4>::quantize_row_wise(&src, &mut scales, None, &mut dst, 2, 2, 16, None);
    }

    #[test]
    fn transpose_gathers_columns() {
        // 4 rows x 2 columns of 4-bit groups, blocks of 2 rows.
        // q(i, n) = i * 2 + n.
        let src = [0x10u8, 0x32, 0x54, 0x76];
        let mut dst = vec![0xAAu8; 4];
        transpose::<4>(&src, &mut dst, 4, 2, 2, None).unwrap();
        assert_eq!(dst, [0x20, 0x64, 0x31, 0x75]);
    }

    #[test]
    fn transpose_ragged_tail_stays_zero() {
        // 3 rows in blocks of 2: the second blob of each column has an
        // empty high lane.
        let src = [0x10u8, 0x32, 0x54];
        let mut dst = vec![0xAAu8; 4];
        transpose::<4>(&src, &mut dst, 3, 2, 2, None).unwrap();
        assert_eq!(dst, [0x20, 0x04, 0x31, 0x05]);
    }

    #[test]
    fn transpose_matches_blockwise_packing() {
        use crate::Blockwise;
        use rand::Rng;

        // With whole blocks on both sides, row-packed output re-blocked by
        // column must equal the direct column-major packing.
        let (rows, columns, block) = (64usize, 32usize, 32usize);
        let mut src = vec![0.0f32; rows * columns];
        rand::thread_rng().fill(&mut src[..]);

        let row_blks = rows / block;
        let mut qdq_dst = vec![0u8; rows * columns / 2];
        let mut qdq_scales = vec![0.0f32; row_blks * columns];
        let mut qdq_zps = vec![0u8; row_blks * columns / 2];
        Qdq::<f32, 4>::quantize_column_wise(
            &src,
            &mut qdq_scales,
            Some(&mut qdq_zps[..]),
            &mut qdq_dst,
            rows,
            columns,
            block,
            None,
        )
        .unwrap();

        let mut transposed = vec![0u8; columns * row_blks * (block / 2)];
        transpose::<4>(&qdq_dst, &mut transposed, rows, columns, block, None).unwrap();

        type Q = Blockwise<f32, 32, 4, true>;
        let (data_bytes, scale_count, zp_bytes) = Q::buffer_sizes(rows, columns);
        let mut blk_dst = vec![0u8; data_bytes];
        let mut blk_scales = vec![0.0f32; scale_count];
        let mut blk_zps = vec![0u8; zp_bytes];
        Q::quantize(
            &mut blk_dst,
            &mut blk_scales,
            Some(&mut blk_zps[..]),
            &src,
            rows,
            columns,
            columns,
            None,
        )
        .unwrap();

        assert_eq!(transposed, blk_dst);
    }
}
