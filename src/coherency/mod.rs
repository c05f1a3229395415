// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at http://mozilla.org/MPL/2.0/.

//! Polarization measurements and the coordinate context they share.
//!
//! A beam of radiation is described interchangeably by a Stokes 4-vector or
//! a 2x2 complex coherency matrix; the two are related through the Pauli
//! basis (linear receptor convention, ρ = ½ Σ Sₖ σₖ). Measurements carry a
//! per-component variance used to weight the least-squares fit.


use std::ops::{Add, Index, Mul, Neg, Sub};

use hifitime::Epoch;
use marlu::{c64, Jones};

/// A Stokes 4-vector (I, Q, U, V).
#[derive(Clone, Copy, Debug, Default, PartialEq)]
pub struct Stokes(pub [f64; 4]);

impl Stokes {
    /// The coherency matrix ρ = ½ (I σ₀ + Q σ₁ + U σ₂ + V σ₃).
    pub fn to_coherency(self) -> Jones<f64> {
        let [i, q, u, v] = self.0;
        Jones::from([
            c64::new(0.5 * (i + q), 0.0),
            c64::new(0.5 * u, -0.5 * v),
            c64::new(0.5 * u, 0.5 * v),
            c64::new(0.5 * (i - q), 0.0),
        ])
    }

    /// The Stokes parameters of a coherency matrix, Sₖ = Tr(σₖ ρ).
    ///
    /// Imaginary parts are discarded; for the Hermitian matrices this crate
    /// produces they are zero.
    pub fn from_coherency(rho: Jones<f64>) -> Stokes {
        Stokes([
            (rho[0] + rho[3]).re,
            (rho[0] - rho[3]).re,
            (rho[1] + rho[2]).re,
            (rho[2] - rho[1]).im,
        ])
    }

    /// ∂ρ/∂Sₖ, the coherency basis matrix for the k-th Stokes parameter.
    pub(crate) fn basis(k: usize) -> Jones<f64> {
        let mut s = [0.0; 4];
        s[k] = 1.0;
        Stokes(s).to_coherency()
    }

    pub fn any_nan(self) -> bool {
        self.0.iter().any(|x| x.is_nan())
    }
}

impl Index<usize> for Stokes {
    type Output = f64;

    fn index(&self, k: usize) -> &f64 {
        &self.0[k]
    }
}

impl Add for Stokes {
    type Output = Stokes;

    fn add(self, rhs: Stokes) -> Stokes {
        let mut out = self.0;
        for (o, r) in out.iter_mut().zip(rhs.0) {
            *o += r;
        }
        Stokes(out)
    }
}

impl Sub for Stokes {
    type Output = Stokes;

    fn sub(self, rhs: Stokes) -> Stokes {
        let mut out = self.0;
        for (o, r) in out.iter_mut().zip(rhs.0) {
            *o -= r;
        }
        Stokes(out)
    }
}

impl Mul<f64> for Stokes {
    type Output = Stokes;

    fn mul(self, rhs: f64) -> Stokes {
        Stokes(self.0.map(|x| x * rhs))
    }
}

impl Neg for Stokes {
    type Output = Stokes;

    fn neg(self) -> Stokes {
        Stokes(self.0.map(|x| -x))
    }
}

/// The independent variables shared by a set of measurements: the epoch of
/// the observation and the known transformation from the sky to the
/// receptors at that epoch (e.g. parallactic rotation). The known
/// transformation is applied before the fitted signal path and contributes
/// nothing to the gradient.
#[derive(Clone, Copy, Debug)]
pub struct Coordinates {
    pub epoch: Epoch,
    pub sky: Option<Jones<f64>>,
}

impl Coordinates {
    pub fn new(epoch: Epoch) -> Coordinates {
        Coordinates { epoch, sky: None }
    }

    pub fn with_sky(epoch: Epoch, sky: Jones<f64>) -> Coordinates {
        Coordinates {
            epoch,
            sky: Some(sky),
        }
    }
}

/// One polarization measurement: the observed Stokes parameters of an input
/// state, with a variance per component.
#[derive(Clone, Copy, Debug)]
pub struct CoherencyMeasurement {
    /// Which unknown input state this measurement constrains.
    pub input_index: usize,

    pub stokes: Stokes,

    /// Per-component variances. Must be non-negative; a zero variance means
    /// the component is exact and is given unit weight.
    pub variance: [f64; 4],
}

impl CoherencyMeasurement {
    /// The number of scalar constraints this measurement provides.
    pub fn nconstraint(&self) -> usize {
        4
    }

    /// The weight of the k-th Stokes component.
    pub(crate) fn weight(&self, k: usize) -> f64 {
        if self.variance[k] > 0.0 {
            1.0 / self.variance[k]
        } else {
            1.0
        }
    }
}

/// An ordered sequence of measurements that share one signal path and one
/// set of coordinates. Created once per observation/channel/epoch and
/// immutable after being added to a measurement equation.
#[derive(Clone, Debug)]
pub struct CoherencyMeasurementSet {
    /// The index of the signal path these measurements passed through.
    pub path_index: usize,

    pub coordinates: Coordinates,

    measurements: Vec<CoherencyMeasurement>,
}

impl CoherencyMeasurementSet {
    pub fn new(
        path_index: usize,
        coordinates: Coordinates,
        measurements: Vec<CoherencyMeasurement>,
    ) -> CoherencyMeasurementSet {
        CoherencyMeasurementSet {
            path_index,
            coordinates,
            measurements,
        }
    }

    pub fn measurements(&self) -> &[CoherencyMeasurement] {
        &self.measurements
    }

    pub fn len(&self) -> usize {
        self.measurements.len()
    }

    pub fn is_empty(&self) -> bool {
        self.measurements.is_empty()
    }

    /// The total number of scalar constraints provided by this set.
    pub fn nconstraint(&self) -> usize {
        self.measurements.iter().map(|m| m.nconstraint()).sum()
    }
}
