//! Levenberg-Marquardt least squares for the two-parameter SED fit.
//! Minimises Σ (ln S_obs − ln S_model)² over (T, τ). f64 throughout.

use serde::{Deserialize, Serialize};

use crate::model::ModifiedBlackbody;
use crate::types::{ParameterVector, NUM_BANDS};

const NUM_PARAMS: usize = 2;
/// Diagonal floor for Marquardt scaling.
const DIAG_FLOOR: f64 = 1e-12;
/// Damping beyond which no useful step can be taken.
const MAX_LAMBDA: f64 = 1e16;

/// Solver tolerances and caps.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SolverConfig {
    /// Hard cap on LM iterations per pixel.
    pub max_iterations: usize,
    /// Converged when a step, accepted or not, satisfies |δp_i| ≤ xtol · |p_i|.
    pub xtol: f64,
    /// Converged when an accepted step reduces the cost by less than ftol · cost.
    pub ftol: f64,
    /// Converged when every gradient component is at most gtol, either
    /// log-scaled (|p_i · (Jᵀr)_i|) or as the cosine between column i of J and r.
    pub gtol: f64,
    /// Initial damping factor.
    pub initial_lambda: f64,
}

impl Default for SolverConfig {
    fn default() -> Self {
        SolverConfig {
            max_iterations: 200,
            xtol: 1e-10,
            ftol: 1e-12,
            gtol: 1e-10,
            initial_lambda: 1e-3,
        }
    }
}

/// Outcome of one LM run.
#[derive(Debug, Clone, Copy)]
pub struct SolverResult {
    pub params: ParameterVector,
    /// Sum of squared log residuals at `params`.
    pub cost: f64,
    pub iterations: usize,
    pub converged: bool,
}

/// A model of ln S(ν) with an analytic parameter gradient.
pub trait SedModel {
    fn ln_flux(&self, p: ParameterVector, nu: f64) -> f64;

    fn ln_flux_gradient(&self, p: ParameterVector, nu: f64) -> [f64; NUM_PARAMS];

    /// Pull a trial step back into the physical domain. `prev` is the last accepted point.
    fn constrain(&self, trial: &mut [f64; NUM_PARAMS], prev: &[f64; NUM_PARAMS]);
}

impl SedModel for ModifiedBlackbody {
    fn ln_flux(&self, p: ParameterVector, nu: f64) -> f64 {
        ModifiedBlackbody::ln_flux(self, p, nu)
    }

    fn ln_flux_gradient(&self, p: ParameterVector, nu: f64) -> [f64; NUM_PARAMS] {
        ModifiedBlackbody::ln_flux_gradient(self, p, nu)
    }

    fn constrain(&self, trial: &mut [f64; NUM_PARAMS], prev: &[f64; NUM_PARAMS]) {
        // Keep T and τ positive
        for i in 0..NUM_PARAMS {
            if trial[i] <= 0.0 {
                trial[i] = prev[i] * 0.5;
            }
        }
    }
}

/// Fit one pixel from `initial`.
///
/// Never fails. Non-finite costs are rejected steps. A pixel stops as
/// converged once no further step can lower its cost, and as unconverged
/// when the iteration cap or a singular system ends the search first; both
/// return the best point seen.
pub fn solve<M: SedModel>(
    model: &M,
    freqs: &[f64; NUM_BANDS],
    log_flux: &[f64; NUM_BANDS],
    initial: ParameterVector,
    config: &SolverConfig,
) -> SolverResult {
    let mut params = initial.to_array();
    let mut best_cost = cost(model, freqs, log_flux, &params);
    let mut lambda = config.initial_lambda;
    let mut nu = 2.0_f64;
    let mut converged = false;
    let mut iterations = 0;

    if !best_cost.is_finite() {
        return SolverResult {
            params: initial,
            cost: best_cost,
            iterations,
            converged,
        };
    }

    for iter in 0..config.max_iterations {
        iterations = iter + 1;

        if best_cost == 0.0 {
            converged = true;
            break;
        }

        // Normal equations, J = ∂ ln S / ∂p, r = ln S_obs − ln S
        let mut jtj = [[0.0_f64; NUM_PARAMS]; NUM_PARAMS];
        let mut jtr = [0.0_f64; NUM_PARAMS];
        let p = ParameterVector::from_array(params);
        for (&f, &y) in freqs.iter().zip(log_flux) {
            let r = y - model.ln_flux(p, f);
            let j = model.ln_flux_gradient(p, f);
            for a in 0..NUM_PARAMS {
                jtr[a] += j[a] * r;
                for b in 0..NUM_PARAMS {
                    jtj[a][b] += j[a] * j[b];
                }
            }
        }

        if gradient_converged(&jtj, &jtr, &params, best_cost, config.gtol) {
            converged = true;
            break;
        }

        let mut mat = jtj;
        for a in 0..NUM_PARAMS {
            mat[a][a] += lambda * jtj[a][a].max(DIAG_FLOOR);
        }

        let delta = match cholesky_solve(&mat, &jtr) {
            Some(d) => d,
            None => break,
        };

        let mut trial = params;
        for a in 0..NUM_PARAMS {
            trial[a] += delta[a];
        }
        model.constrain(&mut trial, &params);
        let step = [trial[0] - params[0], trial[1] - params[1]];
        let small_step = (0..NUM_PARAMS)
            .all(|a| step[a].abs() <= config.xtol * params[a].abs().max(f64::MIN_POSITIVE));

        let new_cost = cost(model, freqs, log_flux, &trial);

        // Nielsen gain ratio
        let predicted: f64 = (0..NUM_PARAMS)
            .map(|a| delta[a] * (lambda * jtj[a][a].max(DIAG_FLOOR) * delta[a] + jtr[a]))
            .sum();

        let rho = if predicted > 0.0 && new_cost.is_finite() {
            (best_cost - new_cost) / predicted
        } else {
            -1.0
        };

        if rho > 0.0 {
            let reduction = best_cost - new_cost;
            let prev_cost = best_cost;
            params = trial;
            best_cost = new_cost;
            lambda *= (1.0_f64 / 3.0).max(1.0 - (2.0 * rho - 1.0).powi(3));
            nu = 2.0;

            let small_reduction = rho > 0.25 && reduction <= config.ftol * prev_cost;
            if small_step || small_reduction {
                converged = true;
                break;
            }
        } else {
            // Damping has shrunk the step below roundoff of the current point
            if small_step {
                converged = true;
                break;
            }
            lambda *= nu;
            nu *= 2.0;
            if lambda > MAX_LAMBDA {
                // No descent direction left at any step length: stationary
                converged = true;
                break;
            }
        }
    }

    SolverResult {
        params: ParameterVector::from_array(params),
        cost: best_cost,
        iterations,
        converged,
    }
}

/// Scaled gradient test. Residuals at a real SED's minimum are not zero, so
/// the raw gradient only reaches roundoff relative to ‖J_i‖·‖r‖.
fn gradient_converged(
    jtj: &[[f64; NUM_PARAMS]; NUM_PARAMS],
    jtr: &[f64; NUM_PARAMS],
    params: &[f64; NUM_PARAMS],
    cost: f64,
    gtol: f64,
) -> bool {
    let r_norm = cost.sqrt();
    (0..NUM_PARAMS).all(|a| {
        let g = jtr[a].abs();
        g * params[a].abs() <= gtol || g <= gtol * jtj[a][a].sqrt() * r_norm
    })
}

/// Sum of squared log residuals; +inf when the model leaves its domain.
fn cost<M: SedModel>(
    model: &M,
    freqs: &[f64; NUM_BANDS],
    log_flux: &[f64; NUM_BANDS],
    params: &[f64; NUM_PARAMS],
) -> f64 {
    let p = ParameterVector::from_array(*params);
    let c: f64 = freqs
        .iter()
        .zip(log_flux)
        .map(|(&f, &y)| {
            let r = y - model.ln_flux(p, f);
            r * r
        })
        .sum();
    if c.is_finite() {
        c
    } else {
        f64::INFINITY
    }
}

/// Cholesky solve of a symmetric positive-definite system.
fn cholesky_solve(
    mat: &[[f64; NUM_PARAMS]; NUM_PARAMS],
    rhs: &[f64; NUM_PARAMS],
) -> Option<[f64; NUM_PARAMS]> {
    let n = NUM_PARAMS;
    let mut l = [[0.0_f64; NUM_PARAMS]; NUM_PARAMS];

    for i in 0..n {
        for j in 0..=i {
            let mut sum = 0.0;
            for k in 0..j {
                sum += l[i][k] * l[j][k];
            }
            if i == j {
                let diag = mat[i][i] - sum;
                if diag.is_nan() || diag <= 0.0 || diag.is_infinite() {
                    return None;
                }
                l[i][j] = diag.sqrt();
            } else {
                l[i][j] = (mat[i][j] - sum) / l[j][j];
            }
        }
    }

    // L y = rhs
    let mut y = [0.0_f64; NUM_PARAMS];
    for i in 0..n {
        let mut sum = 0.0;
        for j in 0..i {
            sum += l[i][j] * y[j];
        }
        y[i] = (rhs[i] - sum) / l[i][i];
    }

    // Lᵀ x = y
    let mut x = [0.0_f64; NUM_PARAMS];
    for i in (0..n).rev() {
        let mut sum = 0.0;
        for j in (i + 1)..n {
            sum += l[j][i] * x[j];
        }
        x[i] = (y[i] - sum) / l[i][i];
    }

    if x.iter().all(|v| v.is_finite()) {
        Some(x)
    } else {
        None
    }
}
