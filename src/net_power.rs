//! # RF net power
//!
//! Averages the net RF power of the DTL and CCL cavities and derives new amplitudes
//! that bring the power to the target of each cavity, the power scaling as the square
//! of the amplitude:
//! ```text
//! new_amp = sqrt(|goal / <P>|) · init_amp
//! ```

use std::sync::Arc;

use interface::{ChannelError, ControlSystem};
use serde::{Deserialize, Serialize};

use crate::{
    cavity::CavityWrapper,
    controller::ScanKind,
    main_loop::MainLoop,
    progress::ScanProgress,
    run_state::{LoopRunState, RunState},
};

#[derive(Debug, thiserror::Error)]
pub enum NetPowerError {
    #[error("The SetUp Loop is running already!")]
    AlreadyRunning,
    #[error("Cannot read the net power of cavity={cavity}")]
    Read {
        cavity: String,
        #[source]
        source: ChannelError,
    },
    #[error("Cannot write to cavities' PVs! Cav={cavity}")]
    Write {
        cavity: String,
        #[source]
        source: ChannelError,
    },
}
pub type Result<T> = std::result::Result<T, NetPowerError>;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct NetPowerParams {
    /// number of readings
    pub n_avg: usize,
    /// time between readings (s)
    pub time_step: f64,
}
impl Default for NetPowerParams {
    fn default() -> Self {
        Self {
            n_avg: 10,
            time_step: 1.,
        }
    }
}

/// Net power of one cavity
#[derive(Debug, Clone, PartialEq)]
pub struct NetPowerRecord {
    pub cavity: String,
    pub goal: f64,
    pub avg: f64,
    /// relative rms error of the average (%)
    pub sigma: f64,
    pub init_amp: f64,
    pub new_amp: f64,
}
impl NetPowerRecord {
    /// Relative amplitude change (%)
    pub fn amp_change(&self) -> f64 {
        if self.init_amp == 0. {
            0.
        } else {
            100. * (self.new_amp - self.init_amp) / self.init_amp
        }
    }
}

#[derive(Debug)]
pub struct NetPowerOutcome {
    pub records: Vec<NetPowerRecord>,
    /// number of readings actually averaged
    pub count: usize,
    pub stopped: bool,
    pub message: String,
}

/// Running sums of the net power readings of one cavity
#[derive(Debug, Default, Clone, Copy)]
struct PowerSums {
    sum: f64,
    sum2: f64,
}
impl PowerSums {
    fn add(&mut self, power: f64) {
        let power = power.abs();
        self.sum += power;
        self.sum2 += power * power;
    }
    /// Average and relative error of the average in percent
    fn stats(&self, count: usize) -> (f64, f64) {
        if count == 0 {
            return (0., 0.);
        }
        let n = count as f64;
        let avg = self.sum / n;
        let mut sigma = if count > 1 {
            ((self.sum2 / n - avg * avg).max(0.) / n).sqrt()
        } else {
            0.
        };
        if avg != 0. {
            sigma *= 100. / avg;
        }
        (avg, sigma)
    }
}

/// Net power averaging of the tank cavities
#[derive(Debug)]
pub struct NetPowerController {
    pub params: NetPowerParams,
    run_state: Arc<LoopRunState>,
}
impl Default for NetPowerController {
    fn default() -> Self {
        Self::new(NetPowerParams::default())
    }
}

impl NetPowerController {
    pub fn new(params: NetPowerParams) -> Self {
        Self {
            params,
            run_state: RunState::new(),
        }
    }
    pub fn run_state(&self) -> &Arc<LoopRunState> {
        &self.run_state
    }
    /// The cavities with a net power target: every cavity but the MEBT re-bunchers
    pub fn tank_cavities(main_loop: &mut MainLoop) -> Vec<&mut CavityWrapper> {
        main_loop
            .controllers
            .iter_mut()
            .filter(|c| !matches!(c.kind, ScanKind::Mebt(_)))
            .map(|c| &mut c.cavity)
            .collect()
    }

    /// Averages the net power and computes the new amplitudes
    ///
    /// A stop request ends the averaging early; the statistics of the readings taken so far
    /// are still committed to the cavities.
    pub fn average(
        &self,
        cs: &dyn ControlSystem,
        cavities: &mut [&mut CavityWrapper],
        progress: &ScanProgress,
    ) -> Result<NetPowerOutcome> {
        let run_state = Arc::clone(&self.run_state);
        let Some(_guard) = run_state.start() else {
            return Err(NetPowerError::AlreadyRunning);
        };
        for cav in cavities.iter() {
            cav.connect(cs).map_err(|source| NetPowerError::Read {
                cavity: cav.alias.clone(),
                source,
            })?;
        }
        progress.set_max_time_count(self.params.n_avg as f64 * self.params.time_step);
        let mut sums = vec![PowerSums::default(); cavities.len()];
        let mut count = 0;
        let mut stopped = false;
        for _ in 0..self.params.n_avg {
            if !progress.time_sleep(self.params.time_step, &run_state) {
                stopped = true;
                break;
            }
            for (cav, sums) in cavities.iter().zip(sums.iter_mut()) {
                let power = cav.read_net_power(cs).map_err(|source| NetPowerError::Read {
                    cavity: cav.alias.clone(),
                    source,
                })?;
                sums.add(power);
            }
            count += 1;
            progress.set_message(format!("Running. Step # {count} out of {}", self.params.n_avg));
            if run_state.should_stop() {
                stopped = true;
                break;
            }
        }
        progress.finish();
        let records = cavities
            .iter_mut()
            .zip(&sums)
            .map(|(cav, sums)| {
                let (avg, sigma) = sums.stats(count);
                cav.net_pwr_avg = avg;
                cav.net_pwr_sigma = sigma;
                let coeff = if avg > 0. { cav.net_pwr_goal / avg } else { 0. };
                let new_amp = coeff.abs().sqrt() * cav.init_amp;
                cav.new_amp = Some(new_amp);
                log::info!(
                    "{}: net power={avg:.1} kW ±{sigma:.1}%, goal={:.1} kW, new amp={new_amp:.5}",
                    cav.alias,
                    cav.net_pwr_goal
                );
                NetPowerRecord {
                    cavity: cav.alias.clone(),
                    goal: cav.net_pwr_goal,
                    avg,
                    sigma,
                    init_amp: cav.init_amp,
                    new_amp,
                }
            })
            .collect();
        let message = if stopped {
            "The averaging stopped by user's request!".to_string()
        } else {
            String::new()
        };
        Ok(NetPowerOutcome {
            records,
            count,
            stopped,
            message,
        })
    }
    /// Writes the new amplitudes to the cavities that have one
    pub fn set_new_amps(cs: &dyn ControlSystem, cavities: &mut [&mut CavityWrapper]) -> Result<()> {
        for cav in cavities.iter_mut() {
            let Some(amp) = cav.new_amp else {
                continue;
            };
            cav.set_live_amp(cs, amp).map_err(|source| NetPowerError::Write {
                cavity: cav.alias.clone(),
                source,
            })?;
        }
        Ok(())
    }
    /// Takes the measured net power as the new target
    pub fn measured_as_target(cavities: &mut [&mut CavityWrapper]) {
        for cav in cavities.iter_mut() {
            cav.net_pwr_goal = cav.net_pwr_avg;
        }
    }
}
