//! Column-wise Q4 packing of the B operand for the fp32 GEMM kernel family.
//!
//! The packed buffer is a sequence of blobs, one per `(column, k-block)`
//! pair, columns outermost. Each blob is `[scale: f32 LE][zp: u8?][payload]`
//! with two 4-bit values sharing byte `l` of every 32-element sub-stride:
//! element `l` in the low nibble, element `l + 16` in the high nibble.

use crate::range::range_to_scale_zp;

/// Block variants of the packed Q4 GEMM operand.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Q4Type {
    /// Symmetric, 32-element blocks.
    Sym,
    /// Asymmetric, 32-element blocks, one zero point per block.
    Asym,
    /// Symmetric, 64-element blocks.
    Sym64,
    /// Symmetric, 128-element blocks.
    Sym128,
}

/// Byte layout of one packed block.
trait Q4Layout {
    const BLK_LEN: usize;
    const HAS_ZP: bool = false;
    /// Offset of the nibble payload inside a blob.
    const DATA: usize = 4 + Self::HAS_ZP as usize;
    const BLOB_SIZE: usize = Self::DATA + Self::BLK_LEN / 2;
}

struct Sym32;
impl Q4Layout for Sym32 {
    const BLK_LEN: usize = 32;
}

struct Asym32;
impl Q4Layout for Asym32 {
    const BLK_LEN: usize = 32;
    const HAS_ZP: bool = true;
}

struct Sym64;
impl Q4Layout for Sym64 {
    const BLK_LEN: usize = 64;
}

struct Sym128;
impl Q4Layout for Sym128 {
    const BLK_LEN: usize = 128;
}

fn packed_size<L: Q4Layout>(n: usize, k: usize) -> usize {
    n * k.div_ceil(L::BLK_LEN) * L::BLOB_SIZE
}

/// Whether this target ships a GEMM kernel consuming the packed operand.
#[inline]
fn has_q4_kernel() -> bool {
    cfg!(any(target_arch = "x86_64", target_arch = "aarch64"))
}

/// Bytes needed for the packed operand of an `[K, N]` source.
///
/// Returns 0 when the target has no consumer kernel; callers must treat
/// that as unsupported.
pub fn pack_b_size(qtype: Q4Type, n: usize, k: usize) -> usize {
    if !has_q4_kernel() {
        return 0;
    }
    match qtype {
        Q4Type::Sym => packed_size::<Sym32>(n, k),
        Q4Type::Asym => packed_size::<Asym32>(n, k),
        Q4Type::Sym64 => packed_size::<Sym64>(n, k),
        Q4Type::Sym128 => packed_size::<Sym128>(n, k),
    }
}

/// Pack a row-major `[K, N]` fp32 source (leading dimension `ldb`) column
/// by column. `packed` must hold at least the ungated packed size.
pub fn pack_b(qtype: Q4Type, packed: &mut [u8], src: &[f32], n: usize, k: usize, ldb: usize) {
    match qtype {
        Q4Type::Sym => pack_sym::<Sym32>(packed, src, n, k, ldb),
        Q4Type::Asym => pack_asym(packed, src, n, k, ldb),
        Q4Type::Sym64 => pack_sym::<Sym64>(packed, src, n, k, ldb),
        Q4Type::Sym128 => pack_sym::<Sym128>(packed, src, n, k, ldb),
    }
}

/// Inverse of [`pack_b`], for tests and diagnostics. Only elements covered
/// by the source shape are written back.
pub fn unpack_b(qtype: Q4Type, dst: &mut [f32], packed: &[u8], n: usize, k: usize, ldb: usize) {
    match qtype {
        Q4Type::Sym => unpack_sym::<Sym32>(dst, packed, n, k, ldb),
        Q4Type::Asym => unpack_asym(dst, packed, n, k, ldb),
        Q4Type::Sym64 => unpack_sym::<Sym64>(dst, packed, n, k, ldb),
        Q4Type::Sym128 => unpack_sym::<Sym128>(dst, packed, n, k, ldb),
    }
}

fn check_shapes(packed_len: usize, src_len: usize, blob_bytes: usize, n: usize, k: usize, ldb: usize) {
    assert!(packed_len >= blob_bytes, "packed operand too small");
    if n > 0 && k > 0 {
        assert!(ldb >= n, "leading dimension shorter than a row");
        assert!(src_len >= (k - 1) * ldb + n, "source matrix too small");
    }
}

fn pack_sym<L: Q4Layout>(packed: &mut [u8], src: &[f32], n: usize, k: usize, ldb: usize) {
    let k_blocks = k.div_ceil(L::BLK_LEN);
    check_shapes(packed.len(), src.len(), n * k_blocks * L::BLOB_SIZE, n, k, ldb);

    for col in 0..n {
        for (kb_idx, kb) in (0..k).step_by(L::BLK_LEN).enumerate() {
            let klen = L::BLK_LEN.min(k - kb);
            let blob = &mut packed[(col * k_blocks + kb_idx) * L::BLOB_SIZE..][..L::BLOB_SIZE];

            // The signed extreme of largest magnitude maps to the most
            // negative level.
            let mut amax = 0.0f32;
            let mut m = 0.0f32;
            for l in 0..klen {
                let v = src[(kb + l) * ldb + col];
                if amax < v.abs() {
                    amax = v.abs();
                    m = v;
                }
            }
            let scale = m / -8.0;
            let recip = if scale != 0.0 { scale.recip() } else { 0.0 };
            blob[..4].copy_from_slice(&scale.to_le_bytes());

            let data = &mut blob[L::DATA..];
            for kk in (0..klen).step_by(32) {
                let kklen = 32.min(klen - kk);
                for l in 0..16 {
                    let v0 = if l < kklen {
                        src[(kb + kk + l) * ldb + col] * recip
                    } else {
                        0.0
                    };
                    let q0 = (v0 + 8.5).clamp(0.0, 15.0) as u8;

                    let l1 = l + 16;
                    let v1 = if l1 < kklen {
                        src[(kb + kk + l1) * ldb + col] * recip
                    } else {
                        0.0
                    };
                    let q1 = (v1 + 8.5).clamp(0.0, 15.0) as u8;

                    data[kk / 2 + l] = q0 | (q1 << 4);
                }
            }
            // Sub-strides past the ragged tail stay deterministic.
            let covered = klen.div_ceil(32) * 16;
            data[covered..].fill(0);
        }
    }
}

fn pack_asym(packed: &mut [u8], src: &[f32], n: usize, k: usize, ldb: usize) {
    type L = Asym32;
    let k_blocks = k.div_ceil(L::BLK_LEN);
    check_shapes(packed.len(), src.len(), n * k_blocks * L::BLOB_SIZE, n, k, ldb);

    for col in 0..n {
        for (kb_idx, kb) in (0..k).step_by(L::BLK_LEN).enumerate() {
            let klen = L::BLK_LEN.min(k - kb);
            let blob = &mut packed[(col * k_blocks + kb_idx) * L::BLOB_SIZE..][..L::BLOB_SIZE];

            let mut min = f32::MAX;
            let mut max = f32::MIN;
            for l in 0..klen {
                let v = src[(kb + l) * ldb + col];
                min = min.min(v);
                max = max.max(v);
            }
            let (scale, zp) = range_to_scale_zp::<4>(min, max);
            let recip = if scale != 0.0 { scale.recip() } else { 0.0 };
            blob[..4].copy_from_slice(&scale.to_le_bytes());
            blob[4] = zp;

            let data = &mut blob[L::DATA..];
            for kk in (0..klen).step_by(32) {
                let kklen = 32.min(klen - kk);
                for l in 0..16 {
                    let v0 = if l < kklen {
                        src[(kb + kk + l) * ldb + col]
                    } else {
                        0.0
                    };
                    let q0 = (v0 * recip + zp as f32).round().clamp(0.0, 15.0) as u8;

                    let l1 = l + 16;
                    let v1 = if l1 < kklen {
                        src[(kb + kk + l1) * ldb + col]
                    } else {
                        0.0
                    };
                    let q1 = (v1 * recip + zp as f32).round().clamp(0.0, 15.0) as u8;

                    data[kk / 2 + l] = q0 | (q1 << 4);
                }
            }
            let covered = klen.div_ceil(32) * 16;
            data[covered..].fill(0);
        }
    }
}

fn unpack_sym<L: Q4Layout>(dst: &mut [f32], packed: &[u8], n: usize, k: usize, ldb: usize) {
    let k_blocks = k.div_ceil(L::BLK_LEN);
    check_shapes(packed.len(), dst.len(), n * k_blocks * L::BLOB_SIZE, n, k, ldb);

    for col in 0..n {
        for (kb_idx, kb) in (0..k).step_by(L::BLK_LEN).enumerate() {
            let klen = L::BLK_LEN.min(k - kb);
            let blob = &packed[(col * k_blocks + kb_idx) * L::BLOB_SIZE..][..L::BLOB_SIZE];
            let scale = f32::from_le_bytes([blob[0], blob[1], blob[2], blob[3]]);
            let data = &blob[L::DATA..];

            for kk in (0..klen).step_by(32) {
                let kklen = 32.min(klen - kk);
                for l in 0..16 {
                    let byte = data[kk / 2 + l];
                    if l < kklen {
                        let q = (byte & 0xf) as i32 - 8;
                        dst[(kb + kk + l) * ldb + col] = q as f32 * scale;
                    }
                    let l1 = l + 16;
                    if l1 < kklen {
                        let q = (byte >> 4) as i32 - 8;
                        dst[(kb + kk + l1) * ldb + col] = q as f32 * scale;
                    }
                }
            }
        }
    }
}

fn unpack_asym(dst: &mut [f32], packed: &[u8], n: usize, k: usize, ldb: usize) {
    type L = Asym32;
    let k_blocks = k.div_ceil(L::BLK_LEN);
    check_shapes(packed.len(), dst.len(), n * k_blocks * L::BLOB_SIZE, n, k, ldb);

    for col in 0..n {
        for (kb_idx, kb) in (0..k).step_by(L::BLK_LEN).enumerate() {
            let klen = L::BLK_LEN.min(k - kb);
            let blob = &packed[(col * k_blocks + kb_idx) * L::BLOB_SIZE..][..L::BLOB_SIZE];
            let scale = f32::from_le_bytes([blob[0], blob[1], blob[2], blob[3]]);
            let zp = blob[4] as i32;
            let data = &blob[L::DATA..];

            for kk in (0..klen).step_by(32) {
                let kklen = 32.min(klen - kk);
                for l in 0..16 {
                    let byte = data[kk / 2 + l];
                    if l < kklen {
                        let q = (byte & 0xf) as i32 - zp;
                        dst[(kb + kk + l) * ldb + col] = q as f32 * scale;
                    }
                    let l1 = l + 16;
                    if l1 < kklen {
                        let q = (byte >> 4) as i32 - zp;
                        dst[(kb + kk + l1) * ldb + col] = q as f32 * scale;
                    }
                }
            }
        }
    }
}
