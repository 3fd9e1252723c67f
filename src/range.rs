//! Range reduction: a scanned `[min, max]` becomes quantization parameters.

use crate::bits::Bits;

/// Asymmetric reduction. The range is first rectified to include 0 so the
/// zero point stays representable, then the zero point is rounded and
/// clamped to the quantized domain.
///
/// The scale is 0 exactly when the rectified range is empty; callers treat
/// its reciprocal as 0.
#[inline]
pub(crate) fn range_to_scale_zp<const QBITS: u32>(min: f32, max: f32) -> (f32, u8) {
    let min = min.min(0.0);
    let max = max.max(0.0);

    let scale = (max - min) / Bits::<QBITS>::MAX_F;
    let zp_fp = if scale != 0.0 { -min / scale } else { min };

    let zp = if zp_fp < 0.0 {
        0
    } else if zp_fp > Bits::<QBITS>::MAX_F {
        Bits::<QBITS>::MAX
    } else {
        zp_fp.round() as u8
    };
    (scale, zp)
}

/// Symmetric reduction. The extreme of larger magnitude lands on the most
/// negative representable level, so the scale keeps that extreme's sign.
#[inline]
pub(crate) fn range_to_scale<const QBITS: u32>(min: f32, max: f32) -> f32 {
    let m = if max.abs() > min.abs() { max } else { min };
    m / -(Bits::<QBITS>::MID as f32)
}
