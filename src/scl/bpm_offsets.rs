//! BPM phase offsets of the superconducting linac
//!
//! The offsets are propagated cavity by cavity: with at least two ready BPMs after a
//! scanned cavity, a line through their corrected phases at each scan point gives the
//! output energy and the expected phases at the other BPMs, the difference with the
//! measured phases is the offset of these BPMs.
//!
//! * backward: from the ring energy, BPMs after the last cavity first, then upstream
//! * forward: from the input energy with all the cavities off, then downstream

use std::sync::Arc;

use interface::{
    units::{beta, ekin_from_beta, gamma, make_phase_near, C_LIGHT},
    Channel, ControlSystem, RingFrequency,
};
use rayon::prelude::*;

use super::{AnalysisError, OffsetSource, PhaseOffset, Result, SclLinac};
use crate::{
    fit::{HarmonicsFunc, LinearFit},
    progress::ScanProgress,
    stats::{AvgErr, GraphData},
};

impl SclLinac {
    /// Offsets of the BPMs after cavity `k` that are not ready yet
    ///
    /// The cavity energy guess must be set, the output energy against the cavity phase is
    /// stored into `ekin_out_gd`.
    fn propagate(&mut self, k: usize, source: OffsetSource) -> Result<()> {
        let alias = self.cavities[k].alias().to_string();
        let (ready, todo): (Vec<usize>, Vec<usize>) = self
            .downstream_bpms(k)
            .partition(|&b| self.bpms[b].offset(source).is_ready);
        if ready.len() < 2 {
            return Err(AnalysisError::NotEnoughBpms(alias));
        }
        let cav = &self.cavities[k];
        let mut gd = GraphData::new();
        let mut samples = vec![vec![]; todo.len()];
        for (j, &phase) in cav.scan_phases().iter().enumerate() {
            let ekin_guess = cav.energy_guess.value(phase);
            let (z, p) = self.scan_point(k, j, &ready, source, ekin_guess);
            let Ok(line) = LinearFit::new(&z, &p) else {
                continue;
            };
            let Some((ekin, err)) = self.energy_from_line(&line) else {
                log::debug!("{alias}: unphysical phase slope at {phase:.1} deg");
                continue;
            };
            gd.add_point(phase, ekin, err);
            for (&b, samples) in todo.iter().zip(samples.iter_mut()) {
                let measured = cav.traces[b].phase.y(j);
                samples.push(make_phase_near(
                    measured - line.value(self.bpms[b].position()),
                    0.,
                ));
            }
        }
        if gd.is_empty() {
            return Err(AnalysisError::AllBad(alias));
        }
        for (&b, samples) in todo.iter().zip(&samples) {
            if let Some(offset) = PhaseOffset::from_samples(samples) {
                log::debug!(
                    "{alias}: {} {} offset {:.2}±{:.2} deg",
                    self.bpms[b].alias(),
                    source.as_str(),
                    offset.avg,
                    offset.err
                );
                *self.bpms[b].offset_mut(source) = offset;
            }
        }
        self.cavities[k].ekin_out_gd = gd;
        Ok(())
    }
    /// Output energy at the live phase from the measured output energies
    fn live_ekin_out(&self, k: usize) -> Option<f64> {
        let cav = &self.cavities[k];
        match HarmonicsFunc::fit(cav.ekin_out_gd.xs(), cav.ekin_out_gd.ys()) {
            Ok(h) => Some(h.value(cav.live_phase)),
            Err(_) => cav.ekin_out_gd.value_y(cav.live_phase),
        }
    }
    /// Shifts the ready offsets so the first good ready BPM after the last cavity has a zero offset
    fn reference_offsets(&mut self, source: OffsetSource) {
        let last = self.cavities.last().map_or(f64::NEG_INFINITY, |c| c.position());
        let Some(base) = self
            .bpms
            .iter()
            .find(|b| b.is_good && b.position() > last && b.offset(source).is_ready)
            .map(|b| b.offset(source).avg)
        else {
            return;
        };
        for bpm in self.bpms.iter_mut() {
            let offset = bpm.offset_mut(source);
            if offset.is_ready {
                offset.avg = make_phase_near(offset.avg - base, 0.);
            }
        }
    }
    /// Offsets of the good BPMs with all-cavities-off data from a drift at `ekin`
    ///
    /// Ready BPMs define the reference line when there are at least two of them,
    /// otherwise the first BPM with data is the reference.
    fn cav_off_offsets(&mut self, source: OffsetSource, ekin: f64) -> Result<()> {
        let slope = self.drift_slope(ekin);
        let with_data: Vec<(usize, AvgErr)> = self
            .bpms
            .iter()
            .zip(&self.cav_off)
            .enumerate()
            .filter_map(|(b, (bpm, off))| off.filter(|_| bpm.is_good).map(|off| (b, off)))
            .collect();
        let Some(&(b0, off0)) = with_data.first() else {
            return Err(AnalysisError::NoCavOffData);
        };
        let ready: Vec<(usize, AvgErr)> = with_data
            .iter()
            .copied()
            .filter(|(b, _)| self.bpms[*b].offset(source).is_ready)
            .collect();
        // corrected phase along the drift
        let line = if ready.len() >= 2 {
            let mut z = Vec::with_capacity(ready.len());
            let mut p: Vec<f64> = Vec::with_capacity(ready.len());
            for &(b, off) in &ready {
                let bpm = &self.bpms[b];
                let phase = off.avg - bpm.offset(source).avg;
                let phase = match (z.last(), p.last()) {
                    (Some(&z0), Some(&p0)) => make_phase_near(phase, p0 + slope * (bpm.position() - z0)),
                    _ => phase,
                };
                z.push(bpm.position());
                p.push(phase);
            }
            LinearFit::new(&z, &p)?
        } else {
            let z0 = self.bpms[b0].position();
            LinearFit {
                intercept: off0.avg - slope * z0,
                slope,
                ..Default::default()
            }
        };
        for &(b, off) in &with_data {
            let z = self.bpms[b].position();
            let offset = self.bpms[b].offset_mut(source);
            if offset.is_ready {
                continue;
            }
            *offset = PhaseOffset {
                avg: make_phase_near(off.avg - line.value(z), 0.),
                err: off.err,
                is_ready: true,
            };
        }
        Ok(())
    }

    /// Propagates the offsets downstream from the all-cavities-off case at the input energy
    ///
    /// A bad cavity passes its input energy to the next one and the walk ends at the first
    /// cavity without scan data.
    pub fn forward_offsets(&mut self) -> Result<()> {
        let source = OffsetSource::Forward;
        for bpm in self.bpms.iter_mut() {
            bpm.forward = PhaseOffset::default();
        }
        self.cav_off_offsets(source, self.ekin_in)?;
        let mut ekin = self.ekin_in;
        for k in 0..self.cavities.len() {
            if !self.cavities[k].is_good {
                continue;
            }
            if !self.cavities[k].is_measured {
                log::warn!(
                    "{}: no phase scan, forward offsets stop here",
                    self.cavities[k].alias()
                );
                break;
            }
            let guess = self.energy_guess(k, ekin)?;
            let cav = &mut self.cavities[k];
            cav.ekin_in_guess = ekin;
            cav.energy_guess = guess;
            self.propagate(k, source)?;
            ekin = self
                .live_ekin_out(k)
                .ok_or_else(|| AnalysisError::AllBad(self.cavities[k].alias().to_string()))?;
            self.cavities[k].ekin_out_guess = ekin;
        }
        self.reference_offsets(source);
        log::info!("forward BPM offsets are ready");
        Ok(())
    }

    /// Propagates the offsets upstream from the ring energy
    ///
    /// The offsets of the BPMs after the last cavity come from [SclLinac::ring_statistics].
    pub fn backward_offsets(&mut self) -> Result<()> {
        let source = OffsetSource::Backward;
        let mut ekin = match self.ring_energy {
            Some(ring) if ring.avg > 0. => ring.avg,
            _ => return Err(AnalysisError::ZeroRingEnergy),
        };
        let last = self.cavities.last().map_or(f64::NEG_INFINITY, |c| c.position());
        for bpm in self.bpms.iter_mut().filter(|b| b.position() < last) {
            bpm.backward = PhaseOffset::default();
        }
        let mut completed = true;
        for k in (0..self.cavities.len()).rev() {
            if !self.cavities[k].is_good {
                continue;
            }
            if !self.cavities[k].is_measured {
                log::warn!(
                    "{}: no phase scan, backward offsets stop here",
                    self.cavities[k].alias()
                );
                completed = false;
                break;
            }
            let guess = self.energy_out_guess(k, ekin)?;
            let cav = &mut self.cavities[k];
            cav.ekin_out_guess = ekin;
            cav.energy_guess = guess;
            self.propagate(k, source)?;
            let gd = &self.cavities[k].ekin_out_gd;
            ekin = gd.ys().iter().sum::<f64>() / gd.len() as f64;
            self.cavities[k].ekin_in_guess = ekin;
        }
        let missing = self
            .bpms
            .iter()
            .any(|b| b.is_good && !b.backward.is_ready);
        if completed && missing {
            if self.cav_off.iter().all(Option::is_none) {
                return Err(AnalysisError::NoCavOffData);
            }
            self.cav_off_offsets(source, ekin)?;
        }
        self.reference_offsets(source);
        log::info!("backward BPM offsets are ready");
        Ok(())
    }

    /// Averages the ring revolution frequency and the BPM phases after the last cavity
    ///
    /// The ring energy sets the backward offsets of these BPMs relative to the first one.
    pub fn ring_statistics(&mut self, cs: &dyn ControlSystem, progress: &ScanProgress) -> Result<AvgErr> {
        let run_state = Arc::clone(self.run_state());
        let Some(_guard) = run_state.start() else {
            return Err(AnalysisError::AlreadyRunning);
        };
        let ring: Channel<RingFrequency> = Channel::with_pv(self.params.ring.pv.as_str());
        ring.connect(cs)?;
        let last = self.cavities.last().map_or(f64::NEG_INFINITY, |c| c.position());
        let limit = self.params.bpm_limit;
        let bpms: Vec<usize> = self
            .bpms
            .iter()
            .enumerate()
            .filter(|(_, b)| {
                b.is_good && b.wrapper.is_on() && b.position() > last && b.position() < limit
            })
            .map(|(b, _)| b)
            .collect();
        for &b in &bpms {
            self.bpms[b].wrapper.connect(cs)?;
        }
        let n = self.params.n_ring_readings.max(1);
        progress.set_max_time_count(n as f64 * self.params.sleep_time);
        let mut frequencies = Vec::with_capacity(n);
        let mut phases = vec![Vec::with_capacity(n); bpms.len()];
        for i in 0..n {
            if !progress.time_sleep(self.params.sleep_time, &run_state) {
                progress.finish();
                return Err(AnalysisError::Stopped);
            }
            frequencies.push(ring.get(cs)?);
            for (&b, phases) in bpms.iter().zip(phases.iter_mut()) {
                phases.push(self.bpms[b].wrapper.read(cs)?.phase);
            }
            progress.set_message(format!("ring statistics {} of {n}", i + 1));
        }
        progress.finish();
        let frequency = AvgErr::from_samples(&frequencies).ok_or(AnalysisError::ZeroRingEnergy)?;
        let b = self.params.ring.circumference * frequency.avg / C_LIGHT;
        if !(b > 0. && b < 1.) {
            return Err(AnalysisError::ZeroRingEnergy);
        }
        let ekin = ekin_from_beta(b, self.mass);
        let g = gamma(ekin, self.mass);
        let ring_energy = AvgErr {
            avg: ekin,
            err: self.mass * g.powi(3) * b * self.params.ring.circumference * frequency.err / C_LIGHT,
        };
        log::info!(
            "ring energy {:.3}±{:.3} MeV from {n} readings",
            ring_energy.avg,
            ring_energy.err
        );
        self.ring_energy = Some(ring_energy);

        let averages: Vec<Option<AvgErr>> = phases.iter().map(|p| AvgErr::from_phases(p)).collect();
        let Some((base, base_avg)) = bpms
            .iter()
            .zip(&averages)
            .find_map(|(&b, avg)| avg.map(|avg| (b, avg)))
        else {
            return Err(AnalysisError::NotEnoughBpms("ring".into()));
        };
        let slope = -360. * self.bpm_frequency / (C_LIGHT * beta(ekin, self.mass));
        let z0 = self.bpms[base].position();
        let positions: Vec<f64> = bpms.iter().map(|&b| self.bpms[b].position()).collect();
        let offsets: Vec<Option<PhaseOffset>> = positions
            .par_iter()
            .zip(averages.par_iter())
            .map(|(&z, avg)| {
                avg.map(|avg| PhaseOffset {
                    avg: make_phase_near(avg.avg - base_avg.avg - slope * (z - z0), 0.),
                    err: avg.err.hypot(base_avg.err),
                    is_ready: true,
                })
            })
            .collect();
        for (&b, offset) in bpms.iter().zip(offsets) {
            if let Some(offset) = offset {
                self.bpms[b].backward = offset;
            }
        }
        Ok(ring_energy)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{live::SimulationConfig, scl::fixture};

    fn noisy() -> SimulationConfig {
        SimulationConfig {
            seed: 7,
            phase_noise: 0.05,
            ..Default::default()
        }
    }

    fn rms_offset_error(scl: &SclLinac, source: OffsetSource) -> f64 {
        let errors: Vec<f64> = scl
            .bpms
            .iter()
            .zip(fixture::BPMS)
            .map(|(bpm, (_, _, truth))| {
                let offset = bpm.offset(source);
                assert!(offset.is_ready, "{}", bpm.alias());
                make_phase_near(offset.avg - truth, 0.)
            })
            .collect();
        (errors.iter().map(|e| e * e).sum::<f64>() / errors.len() as f64).sqrt()
    }

    #[test]
    fn ring_energy() {
        let (cs, mut scl) = fixture::measured(noisy());
        let ring = scl.ring_statistics(&cs, &ScanProgress::hidden()).unwrap();
        let final_energy = cs.final_energy().unwrap();
        assert!((ring.avg - final_energy).abs() < 1e-6, "{} {final_energy}", ring.avg);
        // BPMs after the last cavity relative to the first of them
        for (bpm, (_, _, truth)) in scl.bpms.iter().zip(fixture::BPMS).skip(2) {
            assert!((bpm.backward.avg - truth).abs() < 0.2, "{}", bpm.alias());
        }
        assert!(!scl.bpms[0].backward.is_ready);
    }

    #[test]
    fn backward_offsets() {
        let (cs, mut scl) = fixture::measured(noisy());
        scl.ring_statistics(&cs, &ScanProgress::hidden()).unwrap();
        scl.backward_offsets().unwrap();
        let rms = rms_offset_error(&scl, OffsetSource::Backward);
        assert!(rms < 0.3, "{rms}");
        let c1 = &scl.cavities[0];
        assert!((c1.ekin_in_guess - fixture::EKIN_IN).abs() < 1., "{}", c1.ekin_in_guess);
    }

    #[test]
    fn forward_agrees_with_backward() {
        let (cs, mut scl) = fixture::measured(noisy());
        assert!(scl.measure_all_off(&cs, &ScanProgress::hidden()).unwrap());
        scl.forward_offsets().unwrap();
        scl.ring_statistics(&cs, &ScanProgress::hidden()).unwrap();
        scl.backward_offsets().unwrap();
        for bpm in &scl.bpms {
            let d = make_phase_near(bpm.forward.avg - bpm.backward.avg, 0.);
            assert!(d.abs() < 0.3, "{}: {d}", bpm.alias());
        }
        let final_energy = cs.final_energy().unwrap();
        let last = scl.cavities.last().unwrap();
        assert!((last.ekin_out_guess - final_energy).abs() < 0.5);
    }

    #[test]
    fn backward_needs_the_ring_energy() {
        let (_cs, mut scl) = fixture::measured(SimulationConfig::default());
        assert!(matches!(
            scl.backward_offsets(),
            Err(AnalysisError::ZeroRingEnergy)
        ));
        assert!(matches!(
            scl.forward_offsets(),
            Err(AnalysisError::NoCavOffData)
        ));
    }

    #[test]
    fn unmeasured_cavity_ends_the_walk() {
        let cs = fixture::machine(SimulationConfig::default());
        let mut scl = fixture::scl();
        scl.measure_cavity(&cs, 2, &ScanProgress::hidden()).unwrap();
        scl.ring_statistics(&cs, &ScanProgress::hidden()).unwrap();
        scl.backward_offsets().unwrap();
        assert!(scl.bpms[2..].iter().all(|b| b.backward.is_ready));
        assert!(!scl.bpms[0].backward.is_ready);
        assert!(!scl.bpms[1].backward.is_ready);
    }
}
