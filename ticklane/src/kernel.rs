//! Double-precision vector kernels with runtime ISA dispatch.
//!
//! Two variants exist:
//! - [`Isa::Scalar`]: plain loops, always available, the correctness baseline
//! - [`Isa::WidenedVector`]: AVX2 + FMA, four `f64` lanes per instruction
//!
//! The best variant is detected once per process and cached. Inputs of any
//! length and alignment are accepted; elements that don't fill a full vector
//! go through the scalar tail.
//!
//! # Accuracy
//!
//! `elementwise_add` is bit-identical across variants. `dot_product` sums in a
//! different order per variant, so results may differ in the last bits; do
//! not compare them for exact equality.
//!
//! ```
//! use ticklane::kernel;
//!
//! let a = [1.0, 2.0, 3.0];
//! let b = [4.0, 5.0, 6.0];
//! assert_eq!(kernel::dot_product(&a, &b)?, 32.0);
//! assert_eq!(kernel::elementwise_add(&a, &b)?, vec![5.0, 7.0, 9.0]);
//! # Ok::<(), kernel::KernelError>(())
//! ```

mod scalar;
#[cfg(target_arch = "x86_64")]
mod wide;

use std::fmt;
use std::sync::OnceLock;

use thiserror::Error;

use crate::trace::info;

/// Instruction-set variant a [`Kernel`] runs on.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Isa {
    /// Portable scalar loops.
    Scalar,
    /// 256-bit vectors with fused multiply-add.
    WidenedVector,
}

impl Isa {
    /// Whether the running CPU can execute this variant.
    #[must_use]
    pub fn is_supported(self) -> bool {
        match self {
            Self::Scalar => true,
            Self::WidenedVector => widened_available(),
        }
    }
}

impl fmt::Display for Isa {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Scalar => write!(f, "scalar"),
            Self::WidenedVector => write!(f, "avx2+fma"),
        }
    }
}

/// Errors from kernel calls.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum KernelError {
    /// Input sequences differ in length.
    #[error("input lengths differ: {left} vs {right}")]
    LengthMismatch {
        /// Length of the first input.
        left: usize,
        /// Length of the second input.
        right: usize,
    },
    /// Output buffer does not match the input length.
    #[error("output length {actual} does not match input length {expected}")]
    OutputLength {
        /// Required output length.
        expected: usize,
        /// Provided output length.
        actual: usize,
    },
    /// Requested variant cannot run on this CPU.
    #[error("{0} kernel is not supported on this CPU")]
    Unsupported(Isa),
}

static DETECTED: OnceLock<Kernel> = OnceLock::new();

#[cfg(target_arch = "x86_64")]
fn widened_available() -> bool {
    static AVAILABLE: OnceLock<bool> = OnceLock::new();
    *AVAILABLE.get_or_init(|| {
        std::arch::is_x86_feature_detected!("avx2") && std::arch::is_x86_feature_detected!("fma")
    })
}

#[cfg(not(target_arch = "x86_64"))]
fn widened_available() -> bool {
    false
}

/// Handle to one kernel variant.
///
/// A `Kernel` can only be built for a variant the CPU supports, so its
/// methods never hit an illegal instruction.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Kernel {
    isa: Isa,
}

impl Kernel {
    /// Returns the fastest supported kernel, detected once per process.
    pub fn detect() -> Self {
        *DETECTED.get_or_init(|| {
            let isa = if Isa::WidenedVector.is_supported() {
                Isa::WidenedVector
            } else {
                Isa::Scalar
            };
            info!(%isa, "kernel variant selected");
            Self { isa }
        })
    }

    /// Returns the scalar kernel.
    #[must_use]
    pub const fn scalar() -> Self {
        Self { isa: Isa::Scalar }
    }

    /// Returns a kernel for `isa`.
    ///
    /// # Errors
    ///
    /// Returns [`KernelError::Unsupported`] if the CPU lacks the features.
    pub fn with_isa(isa: Isa) -> Result<Self, KernelError> {
        if isa.is_supported() {
            Ok(Self { isa })
        } else {
            Err(KernelError::Unsupported(isa))
        }
    }

    /// The variant this kernel runs.
    #[must_use]
    pub const fn isa(&self) -> Isa {
        self.isa
    }

    /// Computes `sum(a[i] * b[i])`.
    ///
    /// # Errors
    ///
    /// Returns [`KernelError::LengthMismatch`] if `a` and `b` differ in length.
    pub fn dot_product(&self, a: &[f64], b: &[f64]) -> Result<f64, KernelError> {
        check_lengths(a, b)?;
        Ok(match self.isa {
            Isa::Scalar => scalar::dot_product(a, b),
            Isa::WidenedVector => self.dot_product_wide(a, b),
        })
    }

    /// Computes `a[i] + b[i]` into a new vector.
    ///
    /// # Errors
    ///
    /// Returns [`KernelError::LengthMismatch`] if `a` and `b` differ in length.
    pub fn elementwise_add(&self, a: &[f64], b: &[f64]) -> Result<Vec<f64>, KernelError> {
        let mut out = vec![0.0; a.len()];
        self.elementwise_add_into(a, b, &mut out)?;
        Ok(out)
    }

    /// Computes `a[i] + b[i]` into `out`.
    ///
    /// # Errors
    ///
    /// Returns [`KernelError::LengthMismatch`] if `a` and `b` differ in length,
    /// or [`KernelError::OutputLength`] if `out` has a different length.
    pub fn elementwise_add_into(
        &self,
        a: &[f64],
        b: &[f64],
        out: &mut [f64],
    ) -> Result<(), KernelError> {
        check_lengths(a, b)?;
        if out.len() != a.len() {
            return Err(KernelError::OutputLength {
                expected: a.len(),
                actual: out.len(),
            });
        }
        match self.isa {
            Isa::Scalar => scalar::add(a, b, out),
            Isa::WidenedVector => self.add_wide(a, b, out),
        }
        Ok(())
    }

    #[cfg(target_arch = "x86_64")]
    fn dot_product_wide(&self, a: &[f64], b: &[f64]) -> f64 {
        // SAFETY: a WidenedVector kernel is only constructed after detecting
        // avx2 and fma.
        unsafe { wide::dot_product(a, b) }
    }

    #[cfg(not(target_arch = "x86_64"))]
    fn dot_product_wide(&self, a: &[f64], b: &[f64]) -> f64 {
        scalar::dot_product(a, b)
    }

    #[cfg(target_arch = "x86_64")]
    fn add_wide(&self, a: &[f64], b: &[f64], out: &mut [f64]) {
        // SAFETY: see dot_product_wide.
        unsafe { wide::add(a, b, out) }
    }

    #[cfg(not(target_arch = "x86_64"))]
    fn add_wide(&self, a: &[f64], b: &[f64], out: &mut [f64]) {
        scalar::add(a, b, out);
    }
}

impl Default for Kernel {
    fn default() -> Self {
        Self::detect()
    }
}

fn check_lengths(a: &[f64], b: &[f64]) -> Result<(), KernelError> {
    if a.len() == b.len() {
        Ok(())
    } else {
        Err(KernelError::LengthMismatch {
            left: a.len(),
            right: b.len(),
        })
    }
}

/// Dot product on the detected kernel.
///
/// # Errors
///
/// See [`Kernel::dot_product`].
pub fn dot_product(a: &[f64], b: &[f64]) -> Result<f64, KernelError> {
    Kernel::detect().dot_product(a, b)
}

/// Elementwise sum on the detected kernel.
///
/// # Errors
///
/// See [`Kernel::elementwise_add`].
pub fn elementwise_add(a: &[f64], b: &[f64]) -> Result<Vec<f64>, KernelError> {
    Kernel::detect().elementwise_add(a, b)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn all_supported() -> Vec<Kernel> {
        [Isa::Scalar, Isa::WidenedVector]
            .into_iter()
            .filter_map(|isa| Kernel::with_isa(isa).ok())
            .collect()
    }

    #[test]
    fn scalar_always_supported() {
        assert!(Isa::Scalar.is_supported());
        assert_eq!(Kernel::with_isa(Isa::Scalar), Ok(Kernel::scalar()));
    }

    #[test]
    fn detect_is_stable() {
        assert_eq!(Kernel::detect(), Kernel::detect());
        assert!(Kernel::detect().isa().is_supported());
    }

    #[test]
    fn unsupported_variant_is_refused() {
        if !Isa::WidenedVector.is_supported() {
            assert_eq!(
                Kernel::with_isa(Isa::WidenedVector),
                Err(KernelError::Unsupported(Isa::WidenedVector))
            );
        }
    }

    #[test]
    fn empty_inputs() {
        for kernel in all_supported() {
            assert_eq!(kernel.dot_product(&[], &[]), Ok(0.0));
            assert_eq!(kernel.elementwise_add(&[], &[]), Ok(Vec::new()));
        }
    }

    #[test]
    fn mismatched_lengths_rejected() {
        for kernel in all_supported() {
            assert_eq!(
                kernel.dot_product(&[1.0, 2.0], &[1.0]),
                Err(KernelError::LengthMismatch { left: 2, right: 1 })
            );
            let mut out = [0.0; 3];
            assert_eq!(
                kernel.elementwise_add_into(&[1.0, 2.0], &[1.0, 2.0], &mut out),
                Err(KernelError::OutputLength {
                    expected: 2,
                    actual: 3
                })
            );
        }
    }

    #[test]
    fn small_exact_values() {
        // Integers keep every partial sum exact regardless of order.
        let a: Vec<f64> = (1..=11).map(f64::from).collect();
        let b: Vec<f64> = (1..=11).rev().map(f64::from).collect();
        let expected: f64 = a.iter().zip(&b).map(|(x, y)| x * y).sum();

        for kernel in all_supported() {
            assert_eq!(kernel.dot_product(&a, &b), Ok(expected), "{}", kernel.isa());
            assert_eq!(kernel.elementwise_add(&a, &b), Ok(vec![12.0; 11]));
        }
    }

    #[test]
    fn add_identical_across_variants() {
        let a: Vec<f64> = (0..37).map(|i| f64::from(i) * 0.1).collect();
        let b: Vec<f64> = (0..37).map(|i| 1.0 / f64::from(i + 1)).collect();

        let baseline = Kernel::scalar().elementwise_add(&a, &b).unwrap();
        for kernel in all_supported() {
            let got = kernel.elementwise_add(&a, &b).unwrap();
            assert!(
                got.iter()
                    .zip(&baseline)
                    .all(|(x, y)| x.to_bits() == y.to_bits()),
                "{} differs from scalar",
                kernel.isa()
            );
        }
    }

    #[test]
    fn error_messages() {
        assert_eq!(
            KernelError::LengthMismatch { left: 3, right: 4 }.to_string(),
            "input lengths differ: 3 vs 4"
        );
        assert_eq!(
            KernelError::Unsupported(Isa::WidenedVector).to_string(),
            "avx2+fma kernel is not supported on this CPU"
        );
    }
}
