//! AVX2 + FMA kernels.
//!
//! Unaligned loads are used throughout, so callers can pass any subslice.
//! The dot product keeps two independent accumulators to hide FMA latency.

use std::arch::x86_64::{
    _mm256_add_pd, _mm256_fmadd_pd, _mm256_loadu_pd, _mm256_setzero_pd, _mm256_storeu_pd,
};

const LANES: usize = 4;

/// # Safety
///
/// The CPU must support `avx2` and `fma`.
#[target_feature(enable = "avx2,fma")]
pub unsafe fn dot_product(a: &[f64], b: &[f64]) -> f64 {
    let n = a.len().min(b.len());
    let (pa, pb) = (a.as_ptr(), b.as_ptr());
    let mut lanes = [0.0f64; LANES];
    let mut i = 0;

    // SAFETY: every load reads `LANES` elements starting at `i`, and the loop
    // conditions keep `i + LANES <= n`.
    unsafe {
        let mut acc0 = _mm256_setzero_pd();
        let mut acc1 = _mm256_setzero_pd();

        while i + 2 * LANES <= n {
            acc0 = _mm256_fmadd_pd(_mm256_loadu_pd(pa.add(i)), _mm256_loadu_pd(pb.add(i)), acc0);
            acc1 = _mm256_fmadd_pd(
                _mm256_loadu_pd(pa.add(i + LANES)),
                _mm256_loadu_pd(pb.add(i + LANES)),
                acc1,
            );
            i += 2 * LANES;
        }
        if i + LANES <= n {
            acc0 = _mm256_fmadd_pd(_mm256_loadu_pd(pa.add(i)), _mm256_loadu_pd(pb.add(i)), acc0);
            i += LANES;
        }

        _mm256_storeu_pd(lanes.as_mut_ptr(), _mm256_add_pd(acc0, acc1));
    }

    let mut sum = (lanes[0] + lanes[1]) + (lanes[2] + lanes[3]);
    for (x, y) in a[i..n].iter().zip(&b[i..n]) {
        sum += x * y;
    }
    sum
}

/// # Safety
///
/// The CPU must support `avx2`.
#[target_feature(enable = "avx2,fma")]
pub unsafe fn add(a: &[f64], b: &[f64], out: &mut [f64]) {
    let n = out.len().min(a.len()).min(b.len());
    let mut i = 0;

    // SAFETY: as in `dot_product`; stores stay within `out[..n]`.
    unsafe {
        while i + LANES <= n {
            let sum = _mm256_add_pd(
                _mm256_loadu_pd(a.as_ptr().add(i)),
                _mm256_loadu_pd(b.as_ptr().add(i)),
            );
            _mm256_storeu_pd(out.as_mut_ptr().add(i), sum);
            i += LANES;
        }
    }

    for ((o, x), y) in out[i..n].iter_mut().zip(&a[i..n]).zip(&b[i..n]) {
        *o = x + y;
    }
}
