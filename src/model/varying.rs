// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at http://mozilla.org/MPL/2.0/.

//! Time-variant scalar functions that parameters may be bound to.

use hifitime::{Epoch, Unit};
use serde::{Deserialize, Serialize};

/// Serialize an [Epoch] as GPST seconds.
pub(crate) mod epoch_serde {
    use hifitime::Epoch;
    use serde::{Deserialize, Deserializer, Serialize, Serializer};

    pub fn serialize<S: Serializer>(epoch: &Epoch, serializer: S) -> Result<S::Ok, S::Error> {
        epoch.to_gpst_seconds().serialize(serializer)
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Epoch, D::Error> {
        f64::deserialize(deserializer).map(Epoch::from_gpst_seconds)
    }
}

/// Serialize a list of [Epoch]s as GPST seconds.
pub(crate) mod epoch_vec_serde {
    use hifitime::Epoch;
    use serde::{Deserialize, Deserializer, Serialize, Serializer};

    pub fn serialize<S: Serializer>(epochs: &[Epoch], serializer: S) -> Result<S::Ok, S::Error> {
        epochs
            .iter()
            .map(|e| e.to_gpst_seconds())
            .collect::<Vec<_>>()
            .serialize(serializer)
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(
        deserializer: D,
    ) -> Result<Vec<Epoch>, D::Error> {
        Ok(Vec::<f64>::deserialize(deserializer)?
            .into_iter()
            .map(Epoch::from_gpst_seconds)
            .collect())
    }
}

/// A polynomial of time. A bound parameter takes the value
/// Σⱼ cⱼ (t - t₀)ʲ, where t - t₀ is measured in days; the coefficients cⱼ
/// are free parameters of the enclosing [Bound](super::TransformKind::Bound)
/// node, not of the segment that carries the bound parameter.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct TimePolynomial {
    /// The reference epoch, t₀.
    #[serde(with = "epoch_serde")]
    pub ref_epoch: Epoch,

    /// The number of coefficients (polynomial order + 1).
    pub ncoef: usize,
}

impl TimePolynomial {
    pub fn new(ref_epoch: Epoch, ncoef: usize) -> TimePolynomial {
        TimePolynomial { ref_epoch, ncoef }
    }

    /// The abscissa powers (1, Δt, Δt², ...) at `epoch`. These are both the
    /// factors that multiply the coefficients and the partial derivatives of
    /// the bound parameter with respect to them.
    pub(crate) fn factors(&self, epoch: Epoch) -> Vec<f64> {
        let dt = (epoch - self.ref_epoch).to_unit(Unit::Day);
        let mut factors = Vec::with_capacity(self.ncoef);
        let mut power = 1.0;
        for _ in 0..self.ncoef {
            factors.push(power);
            power *= dt;
        }
        factors
    }
}
