//! SIMD distance kernels shared by the flat and graph indexes.
//!
//! NEON on aarch64, AVX2+FMA (runtime-detected) on x86_64, scalar fold
//! elsewhere. The wide loops walk `chunks_exact` windows and fold the
//! ragged tail separately, so vectors of any dimension are handled
//! without padding.

#[cfg(target_arch = "aarch64")]
#[inline(always)]
unsafe fn dot_neon(a: &[f32], b: &[f32]) -> f32 {
    use std::arch::aarch64::*;

    let mut acc = vdupq_n_f32(0.0);
    let mut wide_a = a.chunks_exact(4);
    let mut wide_b = b.chunks_exact(4);
    for (lane_a, lane_b) in wide_a.by_ref().zip(wide_b.by_ref()) {
        acc = vfmaq_f32(acc, vld1q_f32(lane_a.as_ptr()), vld1q_f32(lane_b.as_ptr()));
    }

    let tail = wide_a
        .remainder()
        .iter()
        .zip(wide_b.remainder())
        .fold(0.0f32, |sum, (x, y)| x.mul_add(*y, sum));
    vaddvq_f32(acc) + tail
}

#[cfg(target_arch = "aarch64")]
#[inline(always)]
unsafe fn l2_squared_neon(a: &[f32], b: &[f32]) -> f32 {
    use std::arch::aarch64::*;

    let mut acc = vdupq_n_f32(0.0);
    let mut wide_a = a.chunks_exact(4);
    let mut wide_b = b.chunks_exact(4);
    for (lane_a, lane_b) in wide_a.by_ref().zip(wide_b.by_ref()) {
        let delta = vsubq_f32(vld1q_f32(lane_a.as_ptr()), vld1q_f32(lane_b.as_ptr()));
        acc = vfmaq_f32(acc, delta, delta);
    }

    let tail = wide_a
        .remainder()
        .iter()
        .zip(wide_b.remainder())
        .fold(0.0f32, |sum, (x, y)| {
            let d = x - y;
            d.mul_add(d, sum)
        });
    vaddvq_f32(acc) + tail
}

#[cfg(target_arch = "x86_64")]
#[target_feature(enable = "avx2,fma")]
#[inline]
unsafe fn dot_avx2(a: &[f32], b: &[f32]) -> f32 {
    use std::arch::x86_64::*;

    let mut acc = _mm256_setzero_ps();
    let mut wide_a = a.chunks_exact(8);
    let mut wide_b = b.chunks_exact(8);
    for (lane_a, lane_b) in wide_a.by_ref().zip(wide_b.by_ref()) {
        let va = _mm256_loadu_ps(lane_a.as_ptr());
        let vb = _mm256_loadu_ps(lane_b.as_ptr());
        acc = _mm256_fmadd_ps(va, vb, acc);
    }

    let tail = wide_a
        .remainder()
        .iter()
        .zip(wide_b.remainder())
        .fold(0.0f32, |sum, (x, y)| x.mul_add(*y, sum));
    lane_sum(acc) + tail
}

#[cfg(target_arch = "x86_64")]
#[target_feature(enable = "avx2,fma")]
#[inline]
unsafe fn l2_squared_avx2(a: &[f32], b: &[f32]) -> f32 {
    use std::arch::x86_64::*;

    let mut acc = _mm256_setzero_ps();
    let mut wide_a = a.chunks_exact(8);
    let mut wide_b = b.chunks_exact(8);
    for (lane_a, lane_b) in wide_a.by_ref().zip(wide_b.by_ref()) {
        let delta = _mm256_sub_ps(_mm256_loadu_ps(lane_a.as_ptr()), _mm256_loadu_ps(lane_b.as_ptr()));
        acc = _mm256_fmadd_ps(delta, delta, acc);
    }

    let tail = wide_a
        .remainder()
        .iter()
        .zip(wide_b.remainder())
        .fold(0.0f32, |sum, (x, y)| {
            let d = x - y;
            d.mul_add(d, sum)
        });
    lane_sum(acc) + tail
}

/// Reduce the 8 accumulator lanes to one f32 by spilling to the stack.
/// The spill compiles to a handful of moves and keeps the reduction
/// readable next to the fused-multiply loops.
#[cfg(target_arch = "x86_64")]
#[target_feature(enable = "avx2,fma")]
#[inline]
unsafe fn lane_sum(acc: std::arch::x86_64::__m256) -> f32 {
    let mut lanes = [0.0f32; 8];
    std::arch::x86_64::_mm256_storeu_ps(lanes.as_mut_ptr(), acc);
    lanes.iter().sum()
}

#[inline(always)]
fn dot_scalar(a: &[f32], b: &[f32]) -> f32 {
    a.iter()
        .zip(b)
        .fold(0.0f32, |sum, (x, y)| x.mul_add(*y, sum))
}

#[inline(always)]
fn l2_squared_scalar(a: &[f32], b: &[f32]) -> f32 {
    a.iter().zip(b).fold(0.0f32, |sum, (x, y)| {
        let d = x - y;
        d.mul_add(d, sum)
    })
}

/// Dot product of two equal-length vectors.
#[inline(always)]
pub fn dot(a: &[f32], b: &[f32]) -> f32 {
    debug_assert_eq!(a.len(), b.len(), "vector length mismatch");

    #[cfg(target_arch = "aarch64")]
    {
        return unsafe { dot_neon(a, b) };
    }

    #[cfg(target_arch = "x86_64")]
    {
        if has_avx2_fma() {
            return unsafe { dot_avx2(a, b) };
        }
    }

    #[allow(unreachable_code)]
    dot_scalar(a, b)
}

/// Squared euclidean distance of two equal-length vectors.
#[inline(always)]
pub fn l2_squared(a: &[f32], b: &[f32]) -> f32 {
    debug_assert_eq!(a.len(), b.len(), "vector length mismatch");

    #[cfg(target_arch = "aarch64")]
    {
        return unsafe { l2_squared_neon(a, b) };
    }

    #[cfg(target_arch = "x86_64")]
    {
        if has_avx2_fma() {
            return unsafe { l2_squared_avx2(a, b) };
        }
    }

    #[allow(unreachable_code)]
    l2_squared_scalar(a, b)
}

#[cfg(target_arch = "x86_64")]
#[inline(always)]
fn has_avx2_fma() -> bool {
    is_x86_feature_detected!("avx2") && is_x86_feature_detected!("fma")
}
