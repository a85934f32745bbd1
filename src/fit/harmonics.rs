//! Two harmonics fit of periodic scan data
//!
//! `H(φ) = a₀ + a₁·sin(φ + p₁) + a₂·sin(2φ + p₂)`, phases in degrees.

use nalgebra as na;

use super::FitError;
use interface::units::wrap_phase;

/// Two harmonics function
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct HarmonicsFunc {
    /// `[a₀, a₁, p₁, a₂, p₂]`
    pub params: [f64; 5],
    /// RMS of the fit residuals
    pub rms_err: f64,
}

impl HarmonicsFunc {
    pub fn new(params: [f64; 5]) -> Self {
        Self {
            params,
            rms_err: 0.,
        }
    }
    /// Least squares fit of the function to `(x, y)`; at least 5 points are required
    pub fn fit(x: &[f64], y: &[f64]) -> Result<Self, FitError> {
        let n = x.len();
        if n < 5 {
            return Err(FitError::NotEnoughPoints { needed: 5, found: n });
        }
        let a = na::DMatrix::from_fn(n, 5, |row, col| {
            let phi = x[row].to_radians();
            match col {
                0 => 1.,
                1 => phi.sin(),
                2 => phi.cos(),
                3 => (2. * phi).sin(),
                _ => (2. * phi).cos(),
            }
        });
        let b = na::DVector::from_row_slice(y);
        let c = na::SVD::new(a.clone(), true, true)
            .solve(&b, 1e-18)
            .map_err(|e| FitError::Singular(e.to_string()))?;
        let (s1, c1, s2, c2) = (c[1], c[2], c[3], c[4]);
        // a·sin(φ + p) = a·cos(p)·sin(φ) + a·sin(p)·cos(φ)
        let params = [
            c[0],
            s1.hypot(c1),
            c1.atan2(s1).to_degrees(),
            s2.hypot(c2),
            c2.atan2(s2).to_degrees(),
        ];
        let residuals = &a * &c - &b;
        let rms_err = (residuals.norm_squared() / n as f64).sqrt();
        Ok(Self { params, rms_err })
    }
    pub fn value(&self, phase: f64) -> f64 {
        let [a0, a1, p1, a2, p2] = self.params;
        a0 + a1 * (phase + p1).to_radians().sin() + a2 * (2. * phase + p2).to_radians().sin()
    }
    /// Derivative with respect to the phase in degrees
    pub fn derivative(&self, phase: f64) -> f64 {
        let [_, a1, p1, a2, p2] = self.params;
        (a1 * (phase + p1).to_radians().cos() + 2. * a2 * (2. * phase + p2).to_radians().cos())
            .to_radians()
    }
    /// Peak to peak amplitude
    pub fn peak_to_peak(&self) -> f64 {
        self.value(self.find_max()) - self.value(self.find_min())
    }
    /// Phase of the function maximum in [-180°,180°)
    pub fn find_max(&self) -> f64 {
        self.find_extremum(1.)
    }
    /// Phase of the function minimum in [-180°,180°)
    pub fn find_min(&self) -> f64 {
        self.find_extremum(-1.)
    }
    fn find_extremum(&self, sign: f64) -> f64 {
        let (grid_phase, _) = (0..360)
            .map(|i| -180. + i as f64)
            .map(|phase| (phase, sign * self.value(phase)))
            .fold((-180., f64::NEG_INFINITY), |best, p| {
                if p.1 > best.1 {
                    p
                } else {
                    best
                }
            });
        let derivative = |phase: f64| sign * self.derivative(phase);
        match roots::find_root_brent(grid_phase - 1., grid_phase + 1., &derivative, &mut 1e-9f64) {
            Ok(phase) => wrap_phase(phase),
            Err(_) => grid_phase,
        }
    }
    /// Phase in [-180°,180°) where the function crosses its mid level
    /// going up from its minimum to its maximum
    pub fn rising_mid_crossing(&self) -> f64 {
        let phase_min = self.find_min();
        let phase_max = phase_min + (self.find_max() - phase_min).rem_euclid(360.);
        let mid = 0.5 * (self.value(phase_min) + self.value(phase_max));
        let f = |phase: f64| self.value(phase) - mid;
        match roots::find_root_brent(phase_min, phase_max, &f, &mut 1e-9f64) {
            Ok(phase) => wrap_phase(phase),
            Err(_) => wrap_phase(0.5 * (phase_min + phase_max)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn invertibility() {
        let (a, b, c, delta) = (3.5, 12., 2.5, 27.);
        let x: Vec<f64> = (0..36).map(|i| -180. + 10. * i as f64).collect();
        let y: Vec<f64> = x
            .iter()
            .map(|phi| {
                a + b * (phi + delta).to_radians().sin() + c * (2. * (phi + delta)).to_radians().sin()
            })
            .collect();
        let h = HarmonicsFunc::fit(&x, &y).unwrap();
        let [a0, a1, p1, a2, p2] = h.params;
        assert!((a0 - a).abs() < 1e-3);
        assert!((a1 - b).abs() < 1e-3);
        assert!((wrap_phase(p1 - delta)).abs() < 1e-3);
        assert!((a2 - c).abs() < 1e-3);
        assert!((wrap_phase(p2 - 2. * delta)).abs() < 1e-3);
        assert!(h.rms_err < 1e-9);
    }

    #[test]
    fn extrema() {
        // sin(φ - 30°): maximum at 120°, minimum at -60°, rising mid crossing at 30°
        let h = HarmonicsFunc::new([0., 1., -30., 0., 0.]);
        assert!((h.find_max() - 120.).abs() < 1e-6);
        assert!((h.find_min() + 60.).abs() < 1e-6);
        assert!((h.rising_mid_crossing() - 30.).abs() < 1e-6);
        assert!((h.peak_to_peak() - 2.).abs() < 1e-9);
    }

    #[test]
    fn too_few_points() {
        assert!(matches!(
            HarmonicsFunc::fit(&[0., 1., 2.], &[0., 1., 2.]),
            Err(FitError::NotEnoughPoints { .. })
        ));
    }
}
