//! Longitudinal Twiss parameters from the BPM amplitudes
//!
//! A BPM amplitude drops with the bunch length `σz` as
//! ```text
//! A = A₀·I₀(ωr/(β₀γ₀c))/I₀(ωr/(βγc))·exp(-½(ω·σz/(βc))²)
//! ```
//! where `A₀` is the amplitude calibrated at the energy `β₀γ₀` and `r` the BPM bore radius.
//! The bunch length at a BPM is linear in the second moments at the entrance of the scanned
//! cavity through the model transfer matrix: the moments are solved by weighted least squares
//! (matrix method) and the Twiss parameters are fitted with a simplex on the amplitudes.

use std::{f64::consts::PI, time::Duration};

use interface::{
    model::{EnvelopeState, Sigma, Transfer},
    units::{beta, gamma, C_LIGHT},
    DataAdaptor, XmlError,
};
use nalgebra as na;
use serde::{Deserialize, Serialize};

use super::{AnalysisError, Result, SclLinac};
use crate::{
    fit::{weighted_least_squares, FitError, FitVariable, ScoreError, Scorer, Simplex, Termination},
    model::{bessel_i0, ModelAdapter},
    progress::ScanProgress,
    stats::AvgErr,
};

/// Bore radius of the HEBT BPMs (m)
const HEBT_BORE_RADIUS: f64 = 0.0555;
/// Bore radius of the SCL BPMs (m)
const SCL_BORE_RADIUS: f64 = 0.035;

/// Longitudinal Twiss parameters, `z` in m and `δ = Δp/p`
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct LongTwiss {
    pub alpha: f64,
    /// m
    pub beta: f64,
    /// m
    pub emittance: f64,
}
impl Default for LongTwiss {
    fn default() -> Self {
        Self {
            alpha: 0.,
            beta: 20.,
            emittance: 2e-5,
        }
    }
}
impl LongTwiss {
    /// Second moments `[[<z²>, <zδ>], [<zδ>, <δ²>]]`
    pub fn sigma(&self) -> Sigma {
        let Self {
            alpha,
            beta,
            emittance,
        } = *self;
        [
            [emittance * beta, -emittance * alpha],
            [-emittance * alpha, emittance * (1. + alpha * alpha) / beta],
        ]
    }
    fn write_xml(&self, parent: &mut DataAdaptor, name: &str) {
        parent
            .create_child(name)
            .set_value("alpha", self.alpha)
            .set_value("beta", self.beta)
            .set_value("emitt", self.emittance);
    }
    fn read_xml(parent: &DataAdaptor, name: &str) -> std::result::Result<Self, XmlError> {
        let da = parent.require_child(name)?;
        Ok(Self {
            alpha: da.f64_value("alpha")?,
            beta: da.f64_value("beta")?,
            emittance: da.f64_value("emitt")?,
        })
    }
}

/// Reference amplitude of a BPM
#[derive(Debug, Clone, PartialEq)]
pub struct AmpCalibration {
    pub amp: f64,
    /// rms spread of the amplitude
    pub err: f64,
    /// `I₀(ωr/(βγc))` at the calibration energy
    pub bessel: f64,
    /// bore radius (m)
    pub bore: f64,
    /// cavity whose phase scan gave the amplitude, the bunch is taken as point-like if unknown
    pub scan: Option<String>,
}
impl AmpCalibration {
    const XML: &'static str = "AMP_CALIBRATION";
    pub(super) fn write_xml(&self, parent: &mut DataAdaptor) {
        let da = parent
            .create_child(Self::XML)
            .set_value("amp", self.amp)
            .set_value("err", self.err)
            .set_value("bessel", self.bessel)
            .set_value("bore", self.bore);
        if let Some(scan) = &self.scan {
            da.set_value("cavity", scan);
        }
    }
    pub(super) fn read_xml(parent: &DataAdaptor) -> std::result::Result<Option<Self>, XmlError> {
        parent
            .child(Self::XML)
            .map(|da| {
                Ok(Self {
                    amp: da.f64_value("amp")?,
                    err: da.f64_value("err")?,
                    bessel: da.f64_value("bessel")?,
                    bore: da.f64_value("bore")?,
                    scan: da
                        .has_attribute("cavity")
                        .then(|| da.string_value("cavity").map(str::to_string))
                        .transpose()?,
                })
            })
            .transpose()
    }
}

/// Twiss parameters at the entrance of a cavity
#[derive(Debug, Clone, PartialEq)]
pub struct TwissResult {
    /// simplex fit of the amplitudes
    pub fit: LongTwiss,
    /// rms difference of the fitted and measured amplitudes
    pub fit_rms: f64,
    pub matrix: LongTwiss,
    pub matrix_err: LongTwiss,
    /// `[<z²>, <zδ>, <δ²>]` from the matrix method
    pub moments: [f64; 3],
    pub moments_err: [f64; 3],
}
impl TwissResult {
    const XML: &'static str = "TWISS";
    pub(super) fn write_xml(&self, parent: &mut DataAdaptor) {
        let da = parent
            .create_child(Self::XML)
            .set_value("fit_rms", self.fit_rms)
            .set_f64_array("moments", &self.moments)
            .set_f64_array("moments_err", &self.moments_err);
        self.fit.write_xml(da, "FIT");
        self.matrix.write_xml(da, "MATRIX");
        self.matrix_err.write_xml(da, "MATRIX_ERR");
    }
    pub(super) fn read_xml(parent: &DataAdaptor) -> std::result::Result<Option<Self>, XmlError> {
        let Some(da) = parent.child(Self::XML) else {
            return Ok(None);
        };
        let triple = |key: &str| -> std::result::Result<[f64; 3], XmlError> {
            let values = da.f64_array(key)?;
            <[f64; 3]>::try_from(values.as_slice()).map_err(|_| XmlError::InvalidValue {
                element: Self::XML.into(),
                attribute: key.into(),
                value: format!("{values:?}"),
            })
        };
        Ok(Some(Self {
            fit: LongTwiss::read_xml(da, "FIT")?,
            fit_rms: da.f64_value("fit_rms")?,
            matrix: LongTwiss::read_xml(da, "MATRIX")?,
            matrix_err: LongTwiss::read_xml(da, "MATRIX_ERR")?,
            moments: triple("moments")?,
            moments_err: triple("moments_err")?,
        }))
    }
}

/// Bunch length at a BPM for one setting of the cavities
#[derive(Debug, Clone, Copy)]
struct Row {
    /// transfer matrix from the cavity entrance
    transfer: Transfer,
    /// `(ω/(βc))²` at the BPM (1/m²)
    k_z: f64,
    /// `I₀(ωr/(βγc))` at the BPM
    bessel: f64,
}
impl Row {
    /// Coefficients of `-½·k_z·σz²` against `[<z²>, <zδ>, <δ²>]`
    fn coefficients(&self) -> [f64; 3] {
        let [[t00, t01], _] = self.transfer;
        let k = -0.5 * self.k_z;
        [k * t00 * t00, 2. * k * t00 * t01, k * t01 * t01]
    }
    /// `ln(A/A₀)` of a Gaussian bunch with the second moments `sigma` at the cavity entrance
    fn exponent(&self, sigma: &Sigma) -> f64 {
        let [c11, c12, c22] = self.coefficients();
        c11 * sigma[0][0] + c12 * sigma[0][1] + c22 * sigma[1][1] - self.bessel.ln()
    }
}

/// Calibrated amplitude of a BPM and the readings it was averaged from
#[derive(Debug, Clone)]
struct Reference {
    amp: f64,
    /// bunch length rows of the calibration readings, empty for a point-like bunch
    rows: Vec<Row>,
    /// `I₀` at the calibration energy
    bessel: f64,
}
impl Reference {
    /// `ln` of the calibration readings over the amplitude of a point-like bunch at `I₀ = 1`
    fn ln_factor(&self, sigma: &Sigma) -> f64 {
        if self.rows.is_empty() {
            return -self.bessel.ln();
        }
        let mean = self.rows.iter().map(|r| r.exponent(sigma).exp()).sum::<f64>()
            / self.rows.len() as f64;
        mean.ln()
    }
    /// Linear part of [Reference::ln_factor]: coefficients against the moments and constant
    fn linear(&self) -> ([f64; 3], f64) {
        if self.rows.is_empty() {
            return ([0.; 3], -self.bessel.ln());
        }
        let n = self.rows.len() as f64;
        let mut coefficients = [0.; 3];
        let mut constant = 0.;
        for row in &self.rows {
            coefficients
                .iter_mut()
                .zip(row.coefficients())
                .for_each(|(c, x)| *c += x / n);
            constant -= row.bessel.ln() / n;
        }
        (coefficients, constant)
    }
}

/// One BPM amplitude of a cavity scan
#[derive(Debug, Clone, Copy)]
struct AmpPoint {
    amp: f64,
    err: f64,
    row: Row,
    /// index of the BPM [Reference]
    reference: usize,
}

/// BPM amplitudes of a cavity scan and their references
#[derive(Debug, Clone, Default)]
struct AmpData {
    points: Vec<AmpPoint>,
    references: Vec<Reference>,
}
impl AmpData {
    fn model_amps(&self, sigma: &Sigma) -> Vec<f64> {
        let factors: Vec<f64> = self.references.iter().map(|r| r.ln_factor(sigma)).collect();
        self.points
            .iter()
            .map(|p| {
                let reference = &self.references[p.reference];
                reference.amp * (p.row.exponent(sigma) - factors[p.reference]).exp()
            })
            .collect()
    }
    fn rms(&self, twiss: &LongTwiss) -> f64 {
        let sum2: f64 = self
            .model_amps(&twiss.sigma())
            .into_iter()
            .zip(&self.points)
            .map(|(model, p)| (model - p.amp).powi(2))
            .sum();
        (sum2 / self.points.len().max(1) as f64).sqrt()
    }
    /// Weighted least squares of the moments on `ln A`
    ///
    /// The calibration factors are linearized around the previous solution, starting from a
    /// point-like bunch.
    fn moments(&self) -> Result<(na::DVector<f64>, na::DMatrix<f64>)> {
        let points: Vec<&AmpPoint> = self.points.iter().filter(|p| p.amp > 0.).collect();
        let n = points.len();
        if n < 3 {
            return Err(FitError::NotEnoughPoints { needed: 3, found: n }.into());
        }
        let linear: Vec<([f64; 3], f64)> = self.references.iter().map(Reference::linear).collect();
        let a = na::DMatrix::from_fn(n, 3, |row, col| {
            let p = points[row];
            p.row.coefficients()[col] - linear[p.reference].0[col]
        });
        let w = na::DVector::from_iterator(
            n,
            points
                .iter()
                .map(|p| if p.err > 0. { (p.amp / p.err).powi(2) } else { 1. }),
        );
        let rhs = |curvature: &[f64]| {
            na::DVector::from_iterator(
                n,
                points.iter().map(|p| {
                    let (_, constant) = linear[p.reference];
                    (p.amp / self.references[p.reference].amp).ln()
                        + p.row.bessel.ln()
                        + constant
                        + curvature[p.reference]
                }),
            )
        };
        let (mut m, mut cov) = weighted_least_squares(&a, &rhs(&vec![0.; linear.len()]), &w)?;
        for _ in 0..3 {
            let sigma = [[m[0], m[1]], [m[1], m[2]]];
            let curvature: Vec<f64> = self
                .references
                .iter()
                .zip(&linear)
                .map(|(r, (c, constant))| {
                    r.ln_factor(&sigma) - (c[0] * m[0] + c[1] * m[1] + c[2] * m[2] + constant)
                })
                .collect();
            (m, cov) = weighted_least_squares(&a, &rhs(&curvature), &w)?;
        }
        Ok((m, cov))
    }
}

/// Mean squared difference of the model and measured amplitudes against `[alpha, beta, emittance]`
struct TwissScorer<'a> {
    data: &'a AmpData,
}
impl Scorer for TwissScorer<'_> {
    fn score(&mut self, params: &[f64]) -> std::result::Result<f64, ScoreError> {
        let twiss = LongTwiss {
            alpha: params[0],
            beta: params[1].abs(),
            emittance: params[2].abs(),
        };
        if twiss.beta == 0. {
            return Ok(f64::MAX);
        }
        Ok(self.data.rms(&twiss).powi(2))
    }
}

/// Twiss parameters and their errors from the moments and their covariance
fn twiss_from_moments(m: [f64; 3], cov: &na::DMatrix<f64>) -> (LongTwiss, LongTwiss) {
    let [m11, m12, m22] = m;
    let [d11, d12, d22] = [0, 1, 2].map(|i| cov[(i, i)].abs().sqrt());
    let emittance = (m11 * m22 - m12 * m12).abs().sqrt();
    if emittance == 0. {
        return (LongTwiss { alpha: 0., beta: 0., emittance }, LongTwiss { alpha: 0., beta: 0., emittance: 0. });
    }
    let twiss = LongTwiss {
        alpha: -m12 / emittance,
        beta: m11 / emittance,
        emittance,
    };
    let emittance_err = ((m22 * d11).powi(2) + (m11 * d22).powi(2) + (2. * m12 * d12).powi(2)).sqrt()
        / (2. * emittance);
    let relative = emittance_err / emittance;
    let err = LongTwiss {
        alpha: (d12 / emittance).hypot(twiss.alpha * relative),
        beta: (d11 / emittance).hypot(twiss.beta * relative),
        emittance: emittance_err,
    };
    (twiss, err)
}

impl SclLinac {
    /// Calibrates the BPM amplitudes with the scan of the last analyzed cavity
    ///
    /// Returns the number of calibrated BPMs.
    pub fn calibrate_bpm_amps(&mut self) -> Result<usize> {
        let k = self
            .cavities
            .iter()
            .rposition(|c| c.wrapper.is_analyzed)
            .ok_or_else(|| AnalysisError::NotAnalyzed("any".into()))?;
        let omega = 2. * PI * self.bpm_frequency;
        let limit = self.params.bpm_limit;
        let scan = self.cavities[k].alias().to_string();
        let bpms: Vec<usize> = self
            .downstream_bpms(k)
            .filter(|&b| self.bpms[b].position() < limit)
            .collect();
        let mut count = 0;
        for b in bpms {
            let position = self.bpms[b].position();
            let ekin = self
                .cavities
                .iter()
                .rev()
                .find(|c| c.wrapper.is_analyzed && c.position() < position)
                .map(|c| c.wrapper.ekin_out)
                .or_else(|| self.cavities.first().map(|c| c.wrapper.ekin_in))
                .filter(|&e| e > 0.)
                .unwrap_or(self.ekin_in);
            let trace = &self.cavities[k].traces[b].amp;
            let Some(avg) = AvgErr::from_samples(trace.ys()) else {
                continue;
            };
            let bpm = &mut self.bpms[b];
            let bore = if bpm.alias().contains("HEBT") {
                HEBT_BORE_RADIUS
            } else {
                SCL_BORE_RADIUS
            };
            let (b, g) = (beta(ekin, self.mass), gamma(ekin, self.mass));
            let calibration = AmpCalibration {
                amp: avg.avg,
                err: avg.err * (trace.len() as f64).sqrt(),
                bessel: bessel_i0(omega * bore / (b * g * C_LIGHT)),
                bore,
                scan: Some(scan.clone()),
            };
            log::debug!(
                "{}: amplitude {:.3}±{:.3} at {ekin:.3} MeV",
                bpm.alias(),
                calibration.amp,
                calibration.err
            );
            bpm.calibration = Some(calibration);
            count += 1;
        }
        log::info!("{count} BPM amplitudes calibrated");
        Ok(count)
    }

    fn row(&self, state: &EnvelopeState, bore: f64) -> Row {
        let omega = 2. * PI * self.bpm_frequency;
        let (b, g) = (beta(state.ekin, self.mass), gamma(state.ekin, self.mass));
        Row {
            transfer: state.transfer,
            k_z: (omega / (b * C_LIGHT)).powi(2),
            bessel: bessel_i0(omega * bore / (b * g * C_LIGHT)),
        }
    }

    /// Bunch length rows, from the entrance of cavity `k`, of the calibration readings of `bpms`
    ///
    /// During the scan of cavity `scan` the cavities from `k` up to `scan` are at their analyzed
    /// settings and the downstream cavities are off.
    fn calibration_rows(
        &self,
        model: &mut ModelAdapter,
        k: usize,
        scan: usize,
        bpms: &[usize],
    ) -> Result<Vec<Vec<Row>>> {
        let mut rows = vec![vec![]; bpms.len()];
        let Some(&last) = bpms.last() else {
            return Ok(rows);
        };
        let stop = self.bpms[last].alias();
        let target = &self.cavities[scan];
        let mut active = model.activate(self.cavities[k].alias(), stop)?;
        for cav in &self.cavities[k..scan] {
            let w = &cav.wrapper;
            active.power_cavity(cav.alias(), w.design_amp, w.design_phase)?;
        }
        let w = &target.wrapper;
        for (j, &phase) in target.scan_phases().iter().enumerate() {
            active.power_cavity(target.alias(), w.design_amp, phase - w.phase_shift)?;
            let envelope = active.track_envelope(
                stop,
                self.cavities[k].wrapper.ekin_in,
                LongTwiss::default().sigma(),
            )?;
            for (rows, &b) in rows.iter_mut().zip(bpms) {
                let bpm = &self.bpms[b];
                let (Some(state), Some(calibration)) = (
                    envelope.iter().find(|s| s.node == bpm.alias()),
                    bpm.calibration.as_ref(),
                ) else {
                    continue;
                };
                if j < target.traces[b].amp.len() {
                    rows.push(self.row(state, calibration.bore));
                }
            }
        }
        Ok(rows)
    }

    /// BPM amplitudes of the scan of cavity `k` with the model transfer matrices
    fn amp_data(&self, model: &mut ModelAdapter, k: usize) -> Result<AmpData> {
        let cav = &self.cavities[k];
        let alias = cav.alias();
        let limit = self.params.bpm_limit;
        let bpms: Vec<usize> = self
            .downstream_bpms(k)
            .filter(|&b| self.bpms[b].position() < limit && self.bpms[b].calibration.is_some())
            .collect();
        let Some(&last) = bpms.last() else {
            return Err(AnalysisError::NotCalibrated);
        };

        // calibration scans that can be tracked from the entrance of cavity `k`
        let scans: Vec<Option<usize>> = bpms
            .iter()
            .map(|&b| {
                self.bpms[b]
                    .calibration
                    .as_ref()
                    .and_then(|c| c.scan.as_deref())
                    .and_then(|scan| self.cavity_index(scan))
                    .filter(|&scan| {
                        scan > k && self.cavities[k..=scan].iter().all(|c| c.wrapper.is_analyzed)
                    })
            })
            .collect();
        let mut rows = vec![vec![]; bpms.len()];
        let mut distinct: Vec<usize> = scans.iter().flatten().copied().collect();
        distinct.sort_unstable();
        distinct.dedup();
        for scan in distinct {
            let (indices, group): (Vec<usize>, Vec<usize>) = bpms
                .iter()
                .enumerate()
                .filter(|(i, _)| scans[*i] == Some(scan))
                .map(|(i, &b)| (i, b))
                .unzip();
            for (i, r) in indices.into_iter().zip(self.calibration_rows(model, k, scan, &group)?) {
                rows[i] = r;
            }
        }
        let references = bpms
            .iter()
            .zip(rows)
            .map(|(&b, rows)| {
                self.bpms[b]
                    .calibration
                    .as_ref()
                    .map(|c| Reference {
                        amp: c.amp,
                        rows,
                        bessel: c.bessel,
                    })
                    .ok_or(AnalysisError::NotCalibrated)
            })
            .collect::<Result<Vec<_>>>()?;

        let stop = self.bpms[last].alias();
        let w = &cav.wrapper;
        let mut active = model.activate(alias, stop)?;
        let mut points = vec![];
        for (j, &phase) in cav.scan_phases().iter().enumerate() {
            active.set_model_amp_phase(w.design_amp, phase, w.phase_shift)?;
            let envelope = active.track_envelope(stop, w.ekin_in, LongTwiss::default().sigma())?;
            for (reference, &b) in bpms.iter().enumerate() {
                let bpm = &self.bpms[b];
                let (Some(state), Some(calibration)) = (
                    envelope.iter().find(|s| s.node == bpm.alias()),
                    bpm.calibration.as_ref(),
                ) else {
                    continue;
                };
                points.push(AmpPoint {
                    amp: cav.traces[b].amp.y(j),
                    err: calibration.err,
                    row: self.row(state, calibration.bore),
                    reference,
                });
            }
        }
        Ok(AmpData { points, references })
    }

    /// Emittance at the entrance of cavity `k` scaled from the first cavity with Twiss parameters
    fn scaled_emittance(&self, k: usize) -> Option<f64> {
        let reference = self
            .cavities
            .iter()
            .enumerate()
            .find(|(i, c)| *i != k && c.twiss.is_some())
            .map(|(_, c)| c)?;
        let emittance = reference.twiss.as_ref()?.fit.emittance;
        let scale = |ekin: f64| gamma(ekin, self.mass).powi(3) * beta(ekin, self.mass);
        Some(emittance * scale(reference.wrapper.ekin_in) / scale(self.cavities[k].wrapper.ekin_in))
    }

    /// Longitudinal Twiss parameters at the entrance of the analyzed cavity `k`
    pub fn fit_twiss(
        &mut self,
        model: &mut ModelAdapter,
        k: usize,
        progress: &ScanProgress,
    ) -> Result<TwissResult> {
        let alias = self.cavities[k].alias().to_string();
        if !self.cavities[k].wrapper.is_analyzed {
            return Err(AnalysisError::NotAnalyzed(alias));
        }
        let data = self.amp_data(model, k)?;
        let (m, cov) = data.moments()?;
        let moments = [m[0], m[1], m[2]];
        let moments_err = [0, 1, 2].map(|i| cov[(i, i)].abs().sqrt());
        let (matrix, matrix_err) = twiss_from_moments(moments, &cov);
        log::debug!("{alias}: matrix Twiss {matrix:?}");

        let start = if matrix.beta > 0. && matrix.emittance > 0. && matrix.alpha.is_finite() {
            matrix
        } else {
            self.params.twiss_guess
        };
        let (emittance, fit_emittance) = match self.scaled_emittance(k) {
            Some(emittance) if self.params.keep_emittance => (emittance, false),
            _ => (start.emittance, true),
        };
        let variables = [
            FitVariable::new("alpha", start.alpha, 0.1),
            FitVariable::new("beta", start.beta, 0.1 * start.beta),
            FitVariable::new("emittance", emittance, 0.1 * emittance).used(fit_emittance),
        ];
        let simplex = Simplex::new()
            .max_evaluations(self.params.twiss_evaluations)
            .max_time(Duration::from_secs_f64(self.params.fit_time.max(0.)))
            .run_state(std::sync::Arc::clone(self.run_state()));
        let mut scorer = TwissScorer { data: &data };
        let outcome = simplex.minimize(&mut scorer, &variables, |evaluations, score| {
            progress.set_message(format!("{alias}: Twiss fit {evaluations} rms={:.4}", score.sqrt()))
        })?;
        match outcome.termination {
            Termination::UserStop => return Err(AnalysisError::Interrupted),
            Termination::ScorerFailure(e) => return Err(FitError::Scorer(e).into()),
            _ => (),
        }
        let fit = LongTwiss {
            alpha: outcome.params[0],
            beta: outcome.params[1].abs(),
            emittance: outcome.params[2].abs(),
        };
        let result = TwissResult {
            fit,
            fit_rms: data.rms(&fit),
            matrix,
            matrix_err,
            moments,
            moments_err,
        };
        log::info!(
            "{alias}: alpha={:.3} beta={:.3} m emittance={:.3e} m, amplitude rms={:.4}",
            fit.alpha,
            fit.beta,
            fit.emittance,
            result.fit_rms
        );
        self.cavities[k].twiss = Some(result.clone());
        Ok(result)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{live::SimulationConfig, scl::fixture};

    const SIGMA0: Sigma = [[4e-4, 0.], [0., 1e-6]];

    fn with_true_cavities(scl: &mut SclLinac, cs: &crate::live::SimulatedMachine) {
        let mut ekin = fixture::EKIN_IN;
        for (cav, (_, _, offset)) in scl.cavities.iter_mut().zip(fixture::CAVITIES) {
            let w = &mut cav.wrapper;
            w.design_amp = 8.;
            w.phase_shift = offset;
            w.ekin_in = ekin;
            w.design_phase = -20.;
            w.is_analyzed = true;
            ekin += 8. * (-20f64).to_radians().cos();
            w.ekin_out = ekin;
        }
        scl.cavities[2].wrapper.ekin_out = cs.final_energy().unwrap();
    }

    fn calibrated(scl: &mut SclLinac) {
        for bpm in scl.bpms.iter_mut() {
            bpm.calibration = Some(AmpCalibration {
                amp: 20.,
                err: 0.,
                bessel: 1.,
                bore: SCL_BORE_RADIUS,
                scan: None,
            });
        }
    }

    #[test]
    fn twiss_sigma() {
        let twiss = LongTwiss {
            alpha: -1.,
            beta: 2.,
            emittance: 3.,
        };
        let s = twiss.sigma();
        assert_eq!(s, [[6., 3.], [3., 3.]]);
        assert!((s[0][0] * s[1][1] - s[0][1] * s[1][0] - 9.).abs() < 1e-12);
        let cov = na::DMatrix::zeros(3, 3);
        let (back, err) = twiss_from_moments([6., 3., 3.], &cov);
        assert!((back.alpha + 1.).abs() < 1e-12);
        assert!((back.beta - 2.).abs() < 1e-12);
        assert!((back.emittance - 3.).abs() < 1e-12);
        assert_eq!(err.emittance, 0.);
    }

    #[test]
    fn amplitude_calibration() {
        let (cs, mut scl) = fixture::measured(SimulationConfig::default());
        assert!(matches!(
            scl.calibrate_bpm_amps(),
            Err(AnalysisError::NotAnalyzed(_))
        ));
        with_true_cavities(&mut scl, &cs);
        assert_eq!(scl.calibrate_bpm_amps().unwrap(), 3);
        assert!(scl.bpms[1].calibration.is_none());
        for bpm in &scl.bpms[2..] {
            let c = bpm.calibration.as_ref().unwrap();
            assert!((c.amp - 20.).abs() < 1e-9);
            assert_eq!(c.scan.as_deref(), Some("SCL_RF:Cav01c"));
            assert!(c.bessel > 1.);
            assert_eq!(c.bore, SCL_BORE_RADIUS);
        }
    }

    #[test]
    fn matrix_twiss() {
        let (cs, mut scl) = fixture::measured(SimulationConfig {
            sigma: Some(SIGMA0),
            ..Default::default()
        });
        with_true_cavities(&mut scl, &cs);
        calibrated(&mut scl);
        let mut model = fixture::model();
        let result = scl.fit_twiss(&mut model, 0, &ScanProgress::hidden()).unwrap();
        // drift from the lattice start to the first gap of the first cavity
        let g = gamma(fixture::EKIN_IN, scl.mass);
        let d = 0.75 / (g * g);
        let s11 = SIGMA0[0][0] + d * d * SIGMA0[1][1];
        let s12 = d * SIGMA0[1][1];
        let emittance = (s11 * SIGMA0[1][1] - s12 * s12).sqrt();
        let m = result.matrix;
        assert!((m.emittance / emittance - 1.).abs() < 0.01, "{m:?}");
        assert!((m.beta / (s11 / emittance) - 1.).abs() < 0.01, "{m:?}");
        assert!((m.alpha + s12 / emittance).abs() < 0.01, "{m:?}");
        assert!(result.fit_rms < 1e-3, "{}", result.fit_rms);
        assert!(scl.cavities[0].twiss.is_some());
    }

    #[test]
    fn twiss_with_scan_calibration() {
        let (cs, mut scl) = fixture::measured(SimulationConfig {
            sigma: Some(SIGMA0),
            ..Default::default()
        });
        with_true_cavities(&mut scl, &cs);
        assert_eq!(scl.calibrate_bpm_amps().unwrap(), 3);
        let mut model = fixture::model();
        let data = scl.amp_data(&mut model, 0).unwrap();
        assert_eq!(data.references.len(), 3);
        assert!(data.references.iter().all(|r| !r.rows.is_empty()));
        let result = scl.fit_twiss(&mut model, 0, &ScanProgress::hidden()).unwrap();
        // the emittance does not change along the drift to the first cavity
        let emittance = (SIGMA0[0][0] * SIGMA0[1][1]).sqrt();
        let m = result.matrix;
        assert!((m.emittance / emittance - 1.).abs() < 0.03, "{m:?}");
        let fit = result.fit;
        assert!((fit.emittance / emittance - 1.).abs() < 0.1, "{fit:?}");
        assert!(result.fit_rms < 1e-2, "{}", result.fit_rms);
    }

    #[test]
    fn simplex_lowers_the_rms() {
        let (cs, mut scl) = fixture::measured(SimulationConfig {
            sigma: Some(SIGMA0),
            ..Default::default()
        });
        with_true_cavities(&mut scl, &cs);
        calibrated(&mut scl);
        let mut model = fixture::model();
        let data = scl.amp_data(&mut model, 1).unwrap();
        let guess = LongTwiss {
            alpha: 1.,
            beta: 5.,
            emittance: 1e-4,
        };
        let result = scl.fit_twiss(&mut model, 1, &ScanProgress::hidden()).unwrap();
        assert!(result.fit_rms < data.rms(&guess));
    }

    #[test]
    fn kept_emittance() {
        let (cs, mut scl) = fixture::measured(SimulationConfig {
            sigma: Some(SIGMA0),
            ..Default::default()
        });
        with_true_cavities(&mut scl, &cs);
        calibrated(&mut scl);
        let mut model = fixture::model();
        let first = scl.fit_twiss(&mut model, 0, &ScanProgress::hidden()).unwrap();
        scl.params.keep_emittance = true;
        let second = scl.fit_twiss(&mut model, 1, &ScanProgress::hidden()).unwrap();
        let scale = |ekin: f64| gamma(ekin, scl.mass).powi(3) * beta(ekin, scl.mass);
        let expected = first.fit.emittance * scale(scl.cavities[0].wrapper.ekin_in)
            / scale(scl.cavities[1].wrapper.ekin_in);
        assert!((second.fit.emittance / expected - 1.).abs() < 1e-12);
    }

    #[test]
    fn needs_calibration() {
        let (cs, mut scl) = fixture::measured(SimulationConfig::default());
        let mut model = fixture::model();
        assert!(matches!(
            scl.fit_twiss(&mut model, 0, &ScanProgress::hidden()),
            Err(AnalysisError::NotAnalyzed(_))
        ));
        with_true_cavities(&mut scl, &cs);
        assert!(matches!(
            scl.fit_twiss(&mut model, 0, &ScanProgress::hidden()),
            Err(AnalysisError::NotCalibrated)
        ));
    }
}
