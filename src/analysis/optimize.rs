use nalgebra::{DMatrix, DVector};

use crate::errors::DaError;

/// A twice-differentiable cost over ensemble-space weights.
///
/// The relinearizing kernels build one value of this trait per analysis and
/// hand it to the Newton loop and the line search; gradient and Hessian are
/// written through the output references so a caller can request only what
/// it needs. Implementations re-evaluate the observation operator at the
/// supplied iterate, so no state is captured across iterations.
pub trait CostModel {
    fn evaluate(
        &mut self,
        w: &DVector<f64>,
        grad: Option<&mut DVector<f64>>,
        hess: Option<&mut DMatrix<f64>>,
    ) -> Result<f64, DaError>;
}

/// Strong Wolfe sufficient-decrease constant.
const WOLFE_C1: f64 = 1e-4;
/// Strong Wolfe curvature constant.
const WOLFE_C2: f64 = 0.9;
const WOLFE_ALPHA_MAX: f64 = 8.0;
const WOLFE_MAX_ITER: usize = 20;
const ZOOM_MAX_ITER: usize = 30;

/// Strong Wolfe line search along `p` from `w`, by bracketing and zoom.
///
/// Returns the accepted step length. The directional derivative is taken
/// from the model's own gradient, so the curvature condition sees the same
/// relinearization as the cost.
pub fn strong_wolfe<C: CostModel>(
    model: &mut C,
    w: &DVector<f64>,
    p: &DVector<f64>,
) -> Result<f64, DaError> {
    let n = w.len();
    let mut grad = DVector::zeros(n);

    let phi0 = model.evaluate(w, Some(&mut grad), None)?;
    let dphi0 = grad.dot(p);
    if dphi0 >= 0.0 {
        // Not a descent direction; no step can satisfy the conditions.
        return Err(DaError::LineSearch);
    }

    let eval = |alpha: f64, model: &mut C, grad: &mut DVector<f64>| -> Result<(f64, f64), DaError> {
        let trial = w + p * alpha;
        let phi = model.evaluate(&trial, Some(grad), None)?;
        Ok((phi, grad.dot(p)))
    };

    let zoom = |mut lo: f64,
                mut phi_lo: f64,
                mut hi: f64,
                model: &mut C,
                grad: &mut DVector<f64>|
     -> Result<f64, DaError> {
        for _ in 0..ZOOM_MAX_ITER {
            let alpha = 0.5 * (lo + hi);
            let trial = w + p * alpha;
            let phi = model.evaluate(&trial, Some(grad), None)?;
            let dphi = grad.dot(p);
            if phi > phi0 + WOLFE_C1 * alpha * dphi0 || phi >= phi_lo {
                hi = alpha;
            } else {
                if dphi.abs() <= -WOLFE_C2 * dphi0 {
                    return Ok(alpha);
                }
                if dphi * (hi - lo) >= 0.0 {
                    hi = lo;
                }
                lo = alpha;
                phi_lo = phi;
            }
        }
        Err(DaError::LineSearch)
    };

    let mut alpha_prev = 0.0;
    let mut phi_prev = phi0;
    let mut alpha = 1.0;
    for i in 0..WOLFE_MAX_ITER {
        let (phi, dphi) = eval(alpha, model, &mut grad)?;
        if phi > phi0 + WOLFE_C1 * alpha * dphi0 || (i > 0 && phi >= phi_prev) {
            return zoom(alpha_prev, phi_prev, alpha, model, &mut grad);
        }
        if dphi.abs() <= -WOLFE_C2 * dphi0 {
            return Ok(alpha);
        }
        if dphi >= 0.0 {
            return zoom(alpha, phi, alpha_prev, model, &mut grad);
        }
        alpha_prev = alpha;
        phi_prev = phi;
        alpha = (2.0 * alpha).min(WOLFE_ALPHA_MAX);
        if (alpha - alpha_prev).abs() < f64::EPSILON {
            break;
        }
    }
    Err(DaError::LineSearch)
}

const BRENT_GOLDEN: f64 = 0.381_966_011_250_105;

/// Bounded scalar minimization by Brent's method (golden section with
/// parabolic interpolation), as used on the finite-size dual cost.
pub fn brent_min<F: FnMut(f64) -> f64>(
    mut f: F,
    a: f64,
    b: f64,
    tol: f64,
    max_iter: usize,
) -> Result<f64, DaError> {
    let (mut a, mut b) = if a < b { (a, b) } else { (b, a) };
    let sqrt_eps = f64::EPSILON.sqrt();

    let mut x = a + BRENT_GOLDEN * (b - a);
    let mut w = x;
    let mut v = x;
    let mut fx = f(x);
    let mut fw = fx;
    let mut fv = fx;
    let mut d = 0.0f64;
    let mut e = 0.0f64;

    for _ in 0..max_iter {
        let m = 0.5 * (a + b);
        let tol1 = sqrt_eps * x.abs() + tol / 3.0;
        let tol2 = 2.0 * tol1;
        if (x - m).abs() <= tol2 - 0.5 * (b - a) {
            return Ok(x);
        }

        let mut use_golden = true;
        if e.abs() > tol1 {
            // Attempt a parabolic fit through (v, w, x).
            let r = (x - w) * (fx - fv);
            let mut q = (x - v) * (fx - fw);
            let mut pnum = (x - v) * q - (x - w) * r;
            q = 2.0 * (q - r);
            if q > 0.0 {
                pnum = -pnum;
            }
            q = q.abs();
            let e_prev = e;
            e = d;
            if pnum.abs() < (0.5 * q * e_prev).abs() && pnum > q * (a - x) && pnum < q * (b - x) {
                d = pnum / q;
                let u = x + d;
                if (u - a) < tol2 || (b - u) < tol2 {
                    d = if x < m { tol1 } else { -tol1 };
                }
                use_golden = false;
            }
        }
        if use_golden {
            e = if x < m { b - x } else { a - x };
            d = BRENT_GOLDEN * e;
        }

        let u = if d.abs() >= tol1 {
            x + d
        } else if d > 0.0 {
            x + tol1
        } else {
            x - tol1
        };
        let fu = f(u);

        if fu <= fx {
            if u < x {
                b = x;
            } else {
                a = x;
            }
            v = w;
            fv = fw;
            w = x;
            fw = fx;
            x = u;
            fx = fu;
        } else {
            if u < x {
                a = u;
            } else {
                b = u;
            }
            if fu <= fw || (w - x).abs() < f64::EPSILON {
                v = w;
                fv = fw;
                w = u;
                fw = fu;
            } else if fu <= fv || (v - x).abs() < f64::EPSILON || (v - w).abs() < f64::EPSILON {
                v = u;
                fv = fu;
            }
        }
    }
    Err(DaError::BrentMinimization)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn brent_finds_a_quadratic_minimum() {
        let xmin = brent_min(|x| (x - 2.5) * (x - 2.5) + 1.0, 0.0, 10.0, 1e-10, 100).unwrap();
        assert!((xmin - 2.5).abs() < 1e-6);
    }

    #[test]
    fn brent_handles_a_boundary_minimum() {
        let xmin = brent_min(|x| x, 1e-6, 4.0, 1e-10, 100).unwrap();
        assert!(xmin < 1e-3);
    }
}
