// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at http://mozilla.org/MPL/2.0/.

//! Nonlinear least-squares solution of a measurement equation.
//!
//! The engine is a damped Gauss-Newton (Levenberg-Marquardt) fit
//! specialized for Stokes 4-vector residuals: every measurement contributes
//! a weighted residual and one gradient row per free parameter, accumulated
//! into the curvature matrix ("alpha") and the chi-squared gradient
//! ("beta"). The damping parameter λ is driven towards zero while
//! chi-squared falls (favoring the exact Newton step) and restored when a
//! step goes backwards (favoring steepest descent); convergence is a small
//! absolute chi-squared change at λ = 0, or an exhausted patience budget in
//! the late stages of a stubborn fit.
//!
//! On success the inverse of the curvature matrix provides the parameter
//! covariance matrix; its diagonal becomes each free parameter's variance.
//! Parameters held fixed keep the variance they already carried.

mod error;

pub use error::{FailureClass, SolveError};

// The Gauss-Jordan failure surfaces through [SolveError::Singular].
pub use crate::math::MathError;

use log::{debug, trace};
use ndarray::prelude::*;

use crate::equation::MeasurementEquation;
use crate::math::gauss_jordan;

/// Options controlling a fit.
#[derive(Clone, Debug)]
pub struct SolveOptions {
    /// The maximum number of iterations before the fit is abandoned.
    pub max_iterations: u32,

    /// If set, iterate until chi-squared falls below this value instead of
    /// using the relative convergence criteria. Useful with simulated,
    /// noise-free measurements.
    pub convergence_chisq: Option<f64>,

    /// If set, a solution whose reduced chi-squared exceeds this ceiling is
    /// rejected outright.
    pub maximum_reduced: Option<f64>,

    /// Passed to the Gauss-Jordan elimination to decide when the curvature
    /// matrix is close to singular.
    pub singular_threshold: f64,
}

impl Default for SolveOptions {
    fn default() -> SolveOptions {
        SolveOptions {
            max_iterations: 50,
            convergence_chisq: None,
            maximum_reduced: None,
            singular_threshold: 1e-8,
        }
    }
}

/// Per-channel fit state.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum SolveStatus {
    #[default]
    Unsolved,
    Fitting,
    Converged,
    Failed,
}

/// The result of a successful fit.
#[derive(Clone, Debug)]
pub struct SolveResult {
    /// The number of iterations taken.
    pub iterations: u32,

    /// The best chi-squared found.
    pub best_chisq: f64,

    /// The total number of scalar constraints.
    pub nconstraint: usize,

    /// The number of free parameters.
    pub nfit: usize,

    /// The number of degrees of freedom (constraints minus free
    /// parameters).
    pub nfree: u32,

    /// best_chisq / nfree.
    pub reduced_chisq: f64,

    /// The full parameter covariance matrix. Rows and columns of fixed
    /// parameters are zero except for the diagonal, which carries the
    /// variance the parameter already had.
    pub covariance: Array2<f64>,
}

/// Solve a measurement equation in place: on success the equation's
/// parameters hold the best-fit values and their variances.
pub fn solve(
    equation: &mut MeasurementEquation,
    options: &SolveOptions,
) -> Result<SolveResult, SolveError> {
    equation.begin_solve();

    let nfit = count_infit(equation);
    if nfit == 0 {
        return Err(SolveError::NoFreeParameters);
    }

    let nconstraint = count_constraint(equation)?;
    if nconstraint <= nfit {
        return Err(SolveError::InsufficientConstraints { nconstraint, nfit });
    }
    let nfree = (nconstraint - nfit) as u32;

    check_constraints(equation)?;

    let (iterations, best_chisq, mut covariance) = fit(equation, options, nfit)?;

    let reduced_chisq = best_chisq / f64::from(nfree);
    if !reduced_chisq.is_finite()
        || options
            .maximum_reduced
            .is_some_and(|ceiling| reduced_chisq > ceiling)
    {
        return Err(SolveError::BadReducedChisq {
            reduced_chisq,
            nfree,
        });
    }

    set_variances(equation, &mut covariance)?;

    debug!(
        "converged after {iterations} iterations: chisq = {best_chisq:.6e} / ({nconstraint} - {nfit}) = {reduced_chisq:.6e}"
    );

    Ok(SolveResult {
        iterations,
        best_chisq,
        nconstraint,
        nfit,
        nfree,
        reduced_chisq,
        covariance,
    })
}

/// Count the parameters that are to be fit.
fn count_infit(equation: &MeasurementEquation) -> usize {
    (0..equation.get_nparam())
        .filter(|&i| equation.get_infit(i).unwrap_or(false))
        .count()
}

/// Count the scalar constraints, and flag which paths and input states have
/// at least one measurement to constrain them.
fn count_constraint(equation: &MeasurementEquation) -> Result<usize, SolveError> {
    if equation.get_ndata() == 0 {
        return Err(SolveError::NoData);
    }

    let mut nconstraint = 0;
    for set in equation.data() {
        nconstraint += set.nconstraint();
    }
    Ok(nconstraint)
}

/// Every path and input state with a free parameter must be referenced by
/// at least one measurement; an unreferenced one would make the normal
/// equations singular, so identify it up front.
fn check_constraints(equation: &MeasurementEquation) -> Result<(), SolveError> {
    let mut path_observed = vec![false; equation.num_paths()];
    let mut state_observed = vec![false; equation.num_inputs()];
    for set in equation.data() {
        path_observed[set.path_index] = true;
        for measurement in set.measurements() {
            state_observed[measurement.input_index] = true;
        }
    }

    for (path, &observed) in path_observed.iter().enumerate() {
        if observed {
            continue;
        }
        let root = equation.path(path)?;
        let arena = equation.arena();
        let free = arena
            .subtree_params(root)
            .map_err(crate::equation::EquationError::from)?
            .into_iter()
            .any(|(node, iparam)| arena.get_infit(node, iparam).unwrap_or(false));
        if free {
            return Err(SolveError::UnconstrainedPath { path });
        }
    }

    for (input, &observed) in state_observed.iter().enumerate() {
        if observed {
            continue;
        }
        let free = (0..4).any(|k| {
            equation
                .input_param_index(input, k)
                .and_then(|i| equation.get_infit(i))
                .unwrap_or(false)
        });
        if free {
            return Err(SolveError::UnconstrainedInput { input });
        }
    }

    Ok(())
}

/// Write the covariance diagonal into each parameter's variance.
///
/// A fixed parameter's diagonal element is zero by construction; its
/// variance is left exactly as it was (it was most likely loaded from a
/// previous solution), and that prior variance is propagated back into the
/// covariance matrix so downstream consumers see it.
fn set_variances(
    equation: &mut MeasurementEquation,
    covariance: &mut Array2<f64>,
) -> Result<(), SolveError> {
    for iparam in 0..equation.get_nparam() {
        let variance = covariance[(iparam, iparam)];
        if !variance.is_finite() {
            return Err(SolveError::NonFiniteVariance {
                name: equation.param_name(iparam)?,
            });
        }
        if variance < 0.0 {
            return Err(SolveError::NegativeVariance {
                name: equation.param_name(iparam)?,
                variance,
            });
        }
        if variance > 0.0 {
            equation.set_variance(iparam, variance)?;
        } else if !equation.get_infit(iparam)? {
            covariance[(iparam, iparam)] = equation.get_variance(iparam)?;
        }
    }
    Ok(())
}

/// Iterate to the chi-squared minimum. Returns the iteration count, the
/// best chi-squared and the full covariance matrix.
fn fit(
    equation: &mut MeasurementEquation,
    options: &SolveOptions,
    nfit: usize,
) -> Result<(u32, f64, Array2<f64>), SolveError> {
    let mut lm = LevenbergMarquardt::new(options.singular_threshold);
    let mut best_chisq = lm.init(equation)?;

    lm.lamda = 1e-5;
    lm.lamda_increase_factor = 10.0;
    lm.lamda_decrease_factor = 0.5;

    let mut last_lamda = 0.0;
    let mut stick_to_steepest_descent = 0_u32;
    let mut patience = 5_u32;
    let mut converged = false;

    let mut iterations = 0;
    while iterations < options.max_iterations {
        iterations += 1;
        let chisq = lm.iter(equation).map_err(|source| match source {
            SolveError::Singular { source, .. } => SolveError::Singular {
                iteration: iterations,
                source,
            },
            other => other,
        })?;

        // An absolute convergence criterion for noise-free data.
        if let Some(convergence_chisq) = options.convergence_chisq {
            if chisq < convergence_chisq {
                best_chisq = best_chisq.min(chisq);
                converged = true;
                break;
            }
            continue;
        }

        let delta_chisq = chisq - best_chisq;
        trace!(
            "iteration {iterations}: chisq={chisq:.6e} delta={delta_chisq:.6e} lamda={:.3e}",
            lm.lamda
        );
        if chisq < best_chisq {
            best_chisq = chisq;
        }

        if lm.lamda == 0.0 && delta_chisq <= 0.0 && delta_chisq.abs() < 1.0 {
            converged = true;
            break;
        }

        if lm.lamda == 0.0 && delta_chisq > 0.0 {
            // The exact Newton step went backwards; back to damping.
            lm.lamda = last_lamda;
            stick_to_steepest_descent += 1;
        }

        if delta_chisq <= 0.0 && delta_chisq.abs() < 10.0 {
            if stick_to_steepest_descent >= 5 {
                if iterations >= options.max_iterations / 2
                    && delta_chisq.abs() / best_chisq < 1e-3
                {
                    // Newton's method keeps misfiring and late iterations
                    // are barely moving; accept the stagnation.
                    patience -= 1;
                    if patience == 0 {
                        converged = true;
                        break;
                    }
                }
            } else {
                if lm.lamda != 0.0 {
                    last_lamda = lm.lamda;
                }
                lm.lamda = 0.0;
            }
        }
    }

    if !converged {
        return Err(SolveError::ConvergenceFailure { iterations });
    }

    let covariance = lm.result(equation, nfit)?;
    Ok((iterations, best_chisq, covariance))
}

/// The Levenberg-Marquardt engine (Numerical Recipes chapter 15.5),
/// specialized for Stokes-vector measurements with per-component inverse
/// variance weights.
struct LevenbergMarquardt {
    /// λ determines the dominance of the steepest descent method.
    lamda: f64,
    lamda_increase_factor: f64,
    lamda_decrease_factor: f64,
    singular_threshold: f64,

    /// Chi-squared of the best fit.
    best_chisq: f64,

    /// Curvature matrix (one half of the Hessian) of the best fit, over all
    /// parameters.
    best_alpha: Array2<f64>,

    /// Chi-squared gradient of the best fit.
    best_beta: Array1<f64>,

    /// Work space for the current trial.
    alpha: Array2<f64>,
    beta: Array1<f64>,

    /// The model parameters before the current trial step.
    backup: Vec<f64>,
}

impl LevenbergMarquardt {
    fn new(singular_threshold: f64) -> LevenbergMarquardt {
        LevenbergMarquardt {
            lamda: 1e-3,
            lamda_increase_factor: 10.0,
            lamda_decrease_factor: 0.1,
            singular_threshold,
            best_chisq: 0.0,
            best_alpha: Array2::zeros((0, 0)),
            best_beta: Array1::zeros(0),
            alpha: Array2::zeros((0, 0)),
            beta: Array1::zeros(0),
            backup: vec![],
        }
    }

    /// Size the work space and compute the initial chi-squared, curvature
    /// and gradient.
    fn init(&mut self, equation: &MeasurementEquation) -> Result<f64, SolveError> {
        let nparam = equation.get_nparam();
        self.alpha = Array2::zeros((nparam, nparam));
        self.beta = Array1::zeros(nparam);
        self.backup = vec![0.0; nparam];

        self.best_chisq = self.calculate_chisq(equation)?;
        self.best_alpha = self.alpha.clone();
        self.best_beta = self.beta.clone();
        self.lamda = 1e-3;
        Ok(self.best_chisq)
    }

    /// Chi-squared of the current model, with the curvature matrix and
    /// gradient accumulated over every measurement in every set.
    fn calculate_chisq(&mut self, equation: &MeasurementEquation) -> Result<f64, SolveError> {
        let nparam = equation.get_nparam();
        self.alpha.fill(0.0);
        self.beta.fill(0.0);
        let mut chisq = 0.0;

        let free: Vec<bool> = (0..nparam)
            .map(|i| equation.get_infit(i).unwrap_or(false))
            .collect();

        for set in equation.data() {
            for measurement in set.measurements() {
                let (predicted, gradient) = equation.evaluate(
                    set.path_index,
                    measurement.input_index,
                    &set.coordinates,
                    true,
                )?;
                let gradient = gradient.expect("gradient was requested");
                let residual = measurement.stokes - predicted;

                for k in 0..4 {
                    let weight = measurement.weight(k);
                    chisq += residual[k] * residual[k] * weight;

                    for ifit in 0..nparam {
                        if !free[ifit] {
                            continue;
                        }
                        let gi = gradient[ifit][k];
                        if gi == 0.0 {
                            continue;
                        }
                        self.beta[ifit] += weight * residual[k] * gi;
                        for jfit in 0..=ifit {
                            if free[jfit] {
                                self.alpha[(ifit, jfit)] += weight * gi * gradient[jfit][k];
                            }
                        }
                    }
                }
            }
        }

        // Populate the symmetric half of the curvature matrix.
        for ifit in 1..nparam {
            for jfit in 0..ifit {
                self.alpha[(jfit, ifit)] = self.alpha[(ifit, jfit)];
            }
        }

        Ok(chisq)
    }

    /// Solve (α' δ = β) for the change in the free parameters, where α' is
    /// the curvature matrix of the best fit with its diagonal inflated by
    /// (1 + λ). Returns δ over the free parameters.
    fn solve_delta(
        &self,
        free: &[usize],
    ) -> Result<(Array2<f64>, Array2<f64>), SolveError> {
        let nfit = free.len();
        let mut compressed = Array2::zeros((nfit, nfit));
        let mut delta = Array2::zeros((nfit, 1));
        for (i, &ifit) in free.iter().enumerate() {
            for (j, &jfit) in free.iter().enumerate() {
                compressed[(i, j)] = self.best_alpha[(ifit, jfit)];
            }
            compressed[(i, i)] *= 1.0 + self.lamda;
            delta[(i, 0)] = self.best_beta[ifit];
        }

        gauss_jordan(&mut compressed, &mut delta, self.singular_threshold).map_err(|source| {
            SolveError::Singular {
                iteration: 0,
                source,
            }
        })?;
        Ok((compressed, delta))
    }

    /// One trial step: update the model by δ, recompute chi-squared, and
    /// either keep the step (decreasing λ) or restore the model (increasing
    /// λ).
    fn iter(&mut self, equation: &mut MeasurementEquation) -> Result<f64, SolveError> {
        let nparam = equation.get_nparam();
        let free: Vec<usize> = (0..nparam)
            .filter(|&i| equation.get_infit(i).unwrap_or(false))
            .collect();
        let (_, delta) = self.solve_delta(&free)?;

        for iparam in 0..nparam {
            self.backup[iparam] = equation.get_param(iparam)?;
        }
        for (i, &ifit) in free.iter().enumerate() {
            equation.set_param(ifit, self.backup[ifit] + delta[(i, 0)])?;
        }

        let new_chisq = self.calculate_chisq(equation)?;

        if new_chisq < self.best_chisq {
            self.lamda *= self.lamda_decrease_factor;
            self.best_chisq = new_chisq;
            self.best_alpha.assign(&self.alpha);
            self.best_beta.assign(&self.beta);
        } else {
            self.lamda *= self.lamda_increase_factor;
            // Restore the old model.
            for iparam in 0..nparam {
                equation.set_param(iparam, self.backup[iparam])?;
            }
        }

        Ok(new_chisq)
    }

    /// The covariance matrix at the best fit: invert the curvature matrix
    /// with λ = 0 and expand it over all parameters, with zeros in the rows
    /// and columns of fixed parameters.
    fn result(
        &mut self,
        equation: &MeasurementEquation,
        nfit: usize,
    ) -> Result<Array2<f64>, SolveError> {
        let nparam = equation.get_nparam();
        let free: Vec<usize> = (0..nparam)
            .filter(|&i| equation.get_infit(i).unwrap_or(false))
            .collect();
        assert_eq!(free.len(), nfit);

        self.lamda = 0.0;
        let (inverse, _) = self.solve_delta(&free)?;

        let mut covariance = Array2::zeros((nparam, nparam));
        for (i, &ifit) in free.iter().enumerate() {
            for (j, &jfit) in free.iter().enumerate() {
                covariance[(ifit, jfit)] = inverse[(i, j)];
            }
        }
        Ok(covariance)
    }
}
