use nalgebra as na;

use super::FitError;

/// Least squares polynomial fit, returns the coefficients in increasing degree order
pub fn polyfit(x_values: &[f64], y_values: &[f64], polynomial_degree: usize) -> Result<Vec<f64>, FitError> {
    let number_of_columns = polynomial_degree + 1;
    let number_of_rows = x_values.len();
    if number_of_rows < number_of_columns {
        return Err(FitError::NotEnoughPoints {
            needed: number_of_columns,
            found: number_of_rows,
        });
    }
    let a = na::DMatrix::from_fn(number_of_rows, number_of_columns, |row, col| {
        x_values[row].powi(col as i32)
    });
    let b = na::DVector::from_row_slice(y_values);

    let decomp = na::SVD::new(a, true, true);
    decomp
        .solve(&b, 1e-18)
        .map(|mat| mat.data.into())
        .map_err(|e| FitError::Singular(e.to_string()))
}

/// Straight line fit `y = intercept + slope·x`
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct LinearFit {
    pub intercept: f64,
    pub slope: f64,
    pub intercept_err: f64,
    pub slope_err: f64,
}
impl LinearFit {
    /// Fits a straight line; the parameter errors are estimated from the residuals
    /// and are 0 when there are only 2 points
    pub fn new(x: &[f64], y: &[f64]) -> Result<Self, FitError> {
        let n = x.len();
        if n < 2 {
            return Err(FitError::NotEnoughPoints { needed: 2, found: n });
        }
        let nf = n as f64;
        let x_avg = x.iter().sum::<f64>() / nf;
        let y_avg = y.iter().sum::<f64>() / nf;
        let sxx: f64 = x.iter().map(|xi| (xi - x_avg).powi(2)).sum();
        if sxx <= 0. {
            return Err(FitError::Singular("all x values are equal".into()));
        }
        let sxy: f64 = x.iter().zip(y).map(|(xi, yi)| (xi - x_avg) * (yi - y_avg)).sum();
        let slope = sxy / sxx;
        let intercept = y_avg - slope * x_avg;
        let (intercept_err, slope_err) = if n > 2 {
            let s2 = x
                .iter()
                .zip(y)
                .map(|(xi, yi)| (yi - intercept - slope * xi).powi(2))
                .sum::<f64>()
                / (nf - 2.);
            let sx2 = x.iter().map(|xi| xi * xi).sum::<f64>();
            ((s2 * sx2 / (nf * sxx)).sqrt(), (s2 / sxx).sqrt())
        } else {
            (0., 0.)
        };
        Ok(Self {
            intercept,
            slope,
            intercept_err,
            slope_err,
        })
    }
    pub fn value(&self, x: f64) -> f64 {
        self.intercept + self.slope * x
    }
    /// Abscissa of the intersection with another line
    pub fn intersection(&self, other: &LinearFit) -> Option<f64> {
        let ds = self.slope - other.slope;
        if ds.abs() < f64::EPSILON {
            None
        } else {
            Some((other.intercept - self.intercept) / ds)
        }
    }
}

/// Weighted linear least squares `min Σ wᵢ (Aᵢ·p − bᵢ)²`
///
/// Returns the solution and its covariance matrix `(AᵀWA)⁻¹`
pub fn weighted_least_squares(
    a: &na::DMatrix<f64>,
    b: &na::DVector<f64>,
    w: &na::DVector<f64>,
) -> Result<(na::DVector<f64>, na::DMatrix<f64>), FitError> {
    let n = a.ncols();
    if a.nrows() < n {
        return Err(FitError::NotEnoughPoints {
            needed: n,
            found: a.nrows(),
        });
    }
    let aw = na::DMatrix::from_fn(a.nrows(), n, |i, j| a[(i, j)] * w[i]);
    let ata = a.transpose() * &aw;
    let atb = aw.transpose() * b;
    let cov = ata
        .try_inverse()
        .ok_or_else(|| FitError::Singular("(AᵀWA) is not invertible".into()))?;
    Ok((&cov * atb, cov))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn polynomial() {
        let x: Vec<f64> = (0..10).map(|i| i as f64).collect();
        let y: Vec<f64> = x.iter().map(|x| 1. - 2. * x + 0.5 * x * x).collect();
        let c = polyfit(&x, &y, 2).unwrap();
        assert!((c[0] - 1.).abs() < 1e-9);
        assert!((c[1] + 2.).abs() < 1e-9);
        assert!((c[2] - 0.5).abs() < 1e-9);
    }

    #[test]
    fn lines() {
        let x = [0., 1., 2., 3.];
        let a = LinearFit::new(&x, &[1., 3., 5., 7.]).unwrap();
        assert!((a.slope - 2.).abs() < 1e-12 && a.slope_err < 1e-12);
        let b = LinearFit::new(&x, &[4., 3., 2., 1.]).unwrap();
        assert!((a.intersection(&b).unwrap() - 1.).abs() < 1e-12);
        assert!(LinearFit::new(&[1.], &[1.]).is_err());
    }

    #[test]
    fn weighted() {
        let a = na::DMatrix::from_row_slice(3, 2, &[1., 0., 1., 1., 1., 2.]);
        let b = na::DVector::from_vec(vec![1., 2., 3.]);
        let w = na::DVector::from_vec(vec![1., 1., 1.]);
        let (p, cov) = weighted_least_squares(&a, &b, &w).unwrap();
        assert!((p[0] - 1.).abs() < 1e-12 && (p[1] - 1.).abs() < 1e-12);
        assert!(cov[(1, 1)] > 0.);
    }
}
