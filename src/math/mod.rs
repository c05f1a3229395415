// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at http://mozilla.org/MPL/2.0/.

//! Some helper mathematics.


use hifitime::{Epoch, Unit};
use ndarray::prelude::*;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum MathError {
    #[error("Singular matrix: pivot {pivot:e} is below the singular threshold {threshold:e}")]
    Singular { pivot: f64, threshold: f64 },
}

/// Solve `A x = B` in place by Gauss-Jordan elimination with full pivoting.
///
/// On exit, `a` is replaced by its inverse and `b` by the solution vectors
/// (one per column). The `singular_threshold` is relative to the largest
/// element of `a`; a pivot below it means the matrix is (numerically)
/// singular, which during fitting usually indicates an ill-constrained free
/// parameter.
pub(crate) fn gauss_jordan(
    a: &mut Array2<f64>,
    b: &mut Array2<f64>,
    singular_threshold: f64,
) -> Result<(), MathError> {
    let n = a.nrows();
    assert_eq!(a.ncols(), n);
    assert_eq!(b.nrows(), n);
    let num_rhs = b.ncols();

    let scale = a.iter().fold(0.0_f64, |acc, x| acc.max(x.abs()));
    let threshold = singular_threshold * scale;

    let mut indxr = vec![0_usize; n];
    let mut indxc = vec![0_usize; n];
    let mut ipiv = vec![false; n];

    for i in 0..n {
        // Find the largest remaining pivot.
        let mut big = 0.0;
        let (mut irow, mut icol) = (0, 0);
        for j in 0..n {
            if ipiv[j] {
                continue;
            }
            for k in 0..n {
                if !ipiv[k] && a[(j, k)].abs() >= big {
                    big = a[(j, k)].abs();
                    irow = j;
                    icol = k;
                }
            }
        }
        if scale == 0.0 || big <= threshold {
            return Err(MathError::Singular {
                pivot: big,
                threshold,
            });
        }
        ipiv[icol] = true;

        if irow != icol {
            for k in 0..n {
                a.swap((irow, k), (icol, k));
            }
            for k in 0..num_rhs {
                b.swap((irow, k), (icol, k));
            }
        }
        indxr[i] = irow;
        indxc[i] = icol;

        let pivinv = 1.0 / a[(icol, icol)];
        a[(icol, icol)] = 1.0;
        for k in 0..n {
            a[(icol, k)] *= pivinv;
        }
        for k in 0..num_rhs {
            b[(icol, k)] *= pivinv;
        }

        for ll in 0..n {
            if ll == icol {
                continue;
            }
            let dum = a[(ll, icol)];
            a[(ll, icol)] = 0.0;
            for k in 0..n {
                let t = a[(icol, k)];
                a[(ll, k)] -= t * dum;
            }
            for k in 0..num_rhs {
                let t = b[(icol, k)];
                b[(ll, k)] -= t * dum;
            }
        }
    }

    // Unscramble the column interchanges.
    for l in (0..n).rev() {
        if indxr[l] != indxc[l] {
            for k in 0..n {
                a.swap((k, indxr[l]), (k, indxc[l]));
            }
        }
    }

    Ok(())
}

/// Wrap an angle into (-π, π].
#[inline]
pub(crate) fn wrap_angle(theta: f64) -> f64 {
    use std::f64::consts::{PI, TAU};
    let wrapped = theta - TAU * (theta / TAU).round();
    if wrapped <= -PI {
        wrapped + TAU
    } else {
        wrapped
    }
}

/// A running inverse-variance-weighted mean of a linear quantity.
#[derive(Clone, Copy, Debug, Default)]
pub(crate) struct WeightedMean {
    wsum: f64,
    vsum: f64,
}

impl WeightedMean {
    pub(crate) fn integrate(&mut self, value: f64, weight: f64) {
        self.wsum += weight;
        self.vsum += value * weight;
    }

    pub(crate) fn is_empty(&self) -> bool {
        self.wsum == 0.0
    }

    /// The mean and its variance.
    pub(crate) fn get(&self) -> Option<(f64, f64)> {
        if self.is_empty() {
            None
        } else {
            Some((self.vsum / self.wsum, 1.0 / self.wsum))
        }
    }
}

/// A running weighted mean of a quantity that wraps modulo 2π.
///
/// An arithmetic mean of angles straddling ±π is meaningless; accumulating
/// unit phasors and taking the argument of their sum is not.
#[derive(Clone, Copy, Debug, Default)]
pub(crate) struct CircularMean {
    sin_sum: f64,
    cos_sum: f64,
    wsum: f64,
}

impl CircularMean {
    pub(crate) fn integrate(&mut self, angle: f64, weight: f64) {
        self.sin_sum += angle.sin() * weight;
        self.cos_sum += angle.cos() * weight;
        self.wsum += weight;
    }

    pub(crate) fn is_empty(&self) -> bool {
        self.wsum == 0.0
    }

    pub(crate) fn get(&self) -> Option<(f64, f64)> {
        if self.is_empty() {
            None
        } else {
            Some((self.sin_sum.atan2(self.cos_sum), 1.0 / self.wsum))
        }
    }
}

/// Average an iterator of [Epoch]s.
pub(crate) fn average_epoch<I: IntoIterator<Item = Epoch>>(epochs: I) -> Epoch {
    let (count, sum) = epochs.into_iter().fold((0, 0.0), |(count, acc), epoch| {
        (count + 1, acc + epoch.to_gpst_seconds())
    });
    Epoch::from_gpst_seconds(sum / count as f64).round(Unit::Millisecond * 10.0)
}
