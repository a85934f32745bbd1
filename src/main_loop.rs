//! # Main loop
//!
//! [MainLoop] owns the cavity controllers of the linac, the BPMs and the on-line model,
//! and runs the cavity set-ups one after the other in beamline order.
//!
//! Before the first set-up, the cavities upstream of the first one are un-blanked and the
//! cavities downstream of it are blanked; each cavity is un-blanked just before its own set-up.
//! After a successful set-up the new settings are committed according to the [CommitPolicy];
//! after a failure the cavity is returned to its initial settings and the loop stops, leaving
//! the blanking of the chain as it is.

use std::{
    sync::{Arc, Mutex},
    time::Duration,
};

use interface::{ChannelError, ControlSystem, DataAdaptor, XmlError};
use serde::{Deserialize, Serialize};

use crate::{
    bpm::BpmWrapper,
    controller::{CavityController, SetupContext, SetupError, SetupReport},
    model::ModelAdapter,
    progress::{RunTimer, ScanProgress},
    run_state::{LoopRunState, RunState},
};

/// What the main loop writes to a cavity after a successful set-up
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CommitPolicy {
    /// the new phase and the new amplitude
    #[default]
    NewSettings,
    /// the new phase, the amplitude stays at its initial value
    KeepAmps,
    /// nothing, the cavity stays at its initial settings
    KeepAll,
}

#[derive(Debug, thiserror::Error)]
pub enum LoopError {
    #[error("Select one or more cavities to start SetUp!")]
    NoSelection,
    #[error("The main loop is already running!")]
    AlreadyRunning,
    #[error("Cannot connect PVs for cavity={cavity}")]
    Connect {
        cavity: String,
        #[source]
        source: ChannelError,
    },
    #[error("Cannot read cavities' PVs! Cavity={cavity}")]
    Init {
        cavity: String,
        #[source]
        source: SetupError,
    },
    #[error("Cannot blank/un-blank cavities!")]
    Blank(#[source] ChannelError),
    #[error("Cannot write to cavity PVs! Cavity={cavity}")]
    Write {
        cavity: String,
        #[source]
        source: ChannelError,
    },
    #[error("Cannot remove {bpm} It is used in cavs: {cavities}")]
    BpmInUse { bpm: String, cavities: String },
    #[error("Unknown BPM={0}")]
    UnknownBpm(String),
}
pub type Result<T> = std::result::Result<T, LoopError>;

/// Result of a main loop run
#[derive(Debug)]
pub struct LoopOutcome {
    /// successful set-ups in the order they ran
    pub reports: Vec<SetupReport>,
    /// the cavity the loop ended on
    pub last_cavity: String,
    pub stopped: bool,
    /// the set-up failure that ended the loop
    pub failure: Option<SetupError>,
    pub message: String,
}
impl LoopOutcome {
    pub fn is_success(&self) -> bool {
        self.failure.is_none() && !self.stopped
    }
}

/// Sequencer of the cavity set-ups
pub struct MainLoop {
    pub controllers: Vec<CavityController>,
    pub bpms: Vec<BpmWrapper>,
    pub model: ModelAdapter,
    pub policy: CommitPolicy,
    run_state: Arc<LoopRunState>,
    timer_period: Duration,
    time_text: Arc<Mutex<String>>,
}

impl std::fmt::Debug for MainLoop {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MainLoop")
            .field("cavities", &self.controllers.iter().map(|c| c.alias()).collect::<Vec<_>>())
            .field("policy", &self.policy)
            .finish()
    }
}

impl MainLoop {
    pub fn new(controllers: Vec<CavityController>, bpms: Vec<BpmWrapper>, model: ModelAdapter) -> Self {
        Self {
            controllers,
            bpms,
            model,
            policy: CommitPolicy::default(),
            run_state: RunState::new(),
            timer_period: Duration::from_secs(1),
            time_text: Arc::new(Mutex::new(String::new())),
        }
    }
    pub fn with_policy(mut self, policy: CommitPolicy) -> Self {
        self.policy = policy;
        self
    }
    /// Sampling period of the run timer
    pub fn with_timer_period(mut self, period: Duration) -> Self {
        self.timer_period = period;
        self
    }
    /// Run state of the loop, a stop request ends the loop at the next suspension point
    pub fn run_state(&self) -> &Arc<LoopRunState> {
        &self.run_state
    }
    /// Elapsed time against the expected duration of the current run
    pub fn time_text(&self) -> String {
        self.time_text
            .lock()
            .map(|text| text.clone())
            .unwrap_or_default()
    }
    pub fn index_of(&self, cavity: &str) -> Option<usize> {
        self.controllers.iter().position(|c| c.alias() == cavity)
    }
    pub fn bpm(&self, alias: &str) -> Option<&BpmWrapper> {
        self.bpms.iter().find(|b| b.alias() == alias)
    }

    /// Connects the PVs of every cavity and every BPM
    pub fn connect_all_pvs(&self, cs: &dyn ControlSystem) -> Result<()> {
        for c in &self.controllers {
            c.cavity.connect(cs).map_err(|source| LoopError::Connect {
                cavity: c.alias().to_string(),
                source,
            })?;
        }
        for bpm in &self.bpms {
            if let Err(e) = bpm.connect(cs) {
                log::warn!("{}: {e}", bpm.alias());
            }
        }
        Ok(())
    }
    /// Reads the live settings of the cavities `first..=last`, all of them if `None`
    pub fn init_all(&mut self, cs: &dyn ControlSystem, range: Option<(usize, usize)>) -> Result<()> {
        self.connect_all_pvs(cs)?;
        let n = self.controllers.len();
        let (first, last) = range.unwrap_or((0, n.saturating_sub(1)));
        for c in self.controllers.iter_mut().take(last + 1).skip(first) {
            c.init(cs).map_err(|source| LoopError::Init {
                cavity: c.alias().to_string(),
                source,
            })?;
        }
        Ok(())
    }
    /// Returns the cavities to their initial settings
    pub fn restore_all(&mut self, cs: &dyn ControlSystem) -> Result<()> {
        self.connect_all_pvs(cs)?;
        for c in self.controllers.iter_mut().filter(|c| c.cavity.init_amp > 0.) {
            c.cavity
                .restore_initial(cs)
                .map_err(|source| LoopError::Write {
                    cavity: c.cavity.alias.clone(),
                    source,
                })?;
        }
        Ok(())
    }
    pub fn unblank_all(&self, cs: &dyn ControlSystem) -> Result<()> {
        self.connect_all_pvs(cs)?;
        for c in &self.controllers {
            c.cavity.set_blank_beam(cs, false).map_err(LoopError::Blank)?;
        }
        log::info!("all the cavities are un-blanked");
        Ok(())
    }
    /// Removes a BPM from the measurements unless a cavity set-up depends on it
    pub fn set_bpm_off(&self, bpm: &str) -> Result<()> {
        let wrapper = self
            .bpm(bpm)
            .ok_or_else(|| LoopError::UnknownBpm(bpm.to_string()))?;
        let users = self
            .controllers
            .iter()
            .filter(|c| c.check_bpm_usage(bpm))
            .map(|c| c.alias())
            .collect::<Vec<_>>()
            .join(" ");
        if !users.is_empty() {
            return Err(LoopError::BpmInUse {
                bpm: bpm.to_string(),
                cavities: users,
            });
        }
        wrapper.set_on(false);
        log::info!("{bpm} is off");
        Ok(())
    }
    pub fn set_bpm_on(&self, bpm: &str) -> Result<()> {
        self.bpm(bpm)
            .ok_or_else(|| LoopError::UnknownBpm(bpm.to_string()))?
            .set_on(true);
        Ok(())
    }
    /// Upper bound of the duration of the set-ups of the cavities `first..=last` in seconds
    pub fn total_time(&self, first: usize, last: usize) -> f64 {
        self.controllers
            .iter()
            .take(last + 1)
            .skip(first)
            .map(CavityController::max_time)
            .sum()
    }

    /// Runs the set-ups from cavity `first` to the last cavity of the linac
    pub fn run_to_end(
        &mut self,
        cs: &dyn ControlSystem,
        first: usize,
        progress: &ScanProgress,
    ) -> Result<LoopOutcome> {
        let last = self.controllers.len().saturating_sub(1);
        self.run(cs, first, last, progress)
    }
    /// Runs the set-ups of the cavities `first..=last`
    ///
    /// Errors are returned only if the loop cannot start; a failed set-up ends the loop
    /// and is reported in the [LoopOutcome].
    pub fn run(
        &mut self,
        cs: &dyn ControlSystem,
        first: usize,
        last: usize,
        progress: &ScanProgress,
    ) -> Result<LoopOutcome> {
        if first > last || last >= self.controllers.len() {
            return Err(LoopError::NoSelection);
        }
        let run_state = Arc::clone(&self.run_state);
        let Some(_guard) = run_state.start() else {
            return Err(LoopError::AlreadyRunning);
        };
        self.connect_all_pvs(cs)?;
        for (i, c) in self.controllers.iter().enumerate() {
            c.cavity.set_blank_beam(cs, i > first).map_err(LoopError::Blank)?;
        }
        let budget = self.total_time(first, last);
        log::info!(
            "From {} to {}: expected duration{}",
            self.controllers[first].alias(),
            self.controllers[last].alias(),
            crate::progress::format_time(budget)
        );
        let time_text = Arc::clone(&self.time_text);
        RunTimer::spawn(
            Arc::clone(&run_state),
            Duration::from_secs_f64(budget),
            self.timer_period,
            move |report| {
                if let Ok(mut text) = time_text.lock() {
                    *text = report.text();
                }
            },
        );

        let mut reports = vec![];
        let mut active = first;
        let mut stopped = false;
        let mut failure = None;
        for index in first..=last {
            active = index;
            if run_state.should_stop() {
                stopped = true;
                break;
            }
            let controller = &mut self.controllers[index];
            controller
                .cavity
                .set_blank_beam(cs, false)
                .map_err(LoopError::Blank)?;
            progress.set_message(controller.alias().to_string());
            let mut ctx = SetupContext {
                cs,
                model: &mut self.model,
                bpms: &self.bpms,
                run_state: &run_state,
                progress,
            };
            let result = controller.run_setup(&mut ctx);
            let cav = &mut controller.cavity;
            // a failed set-up has already restored the initial settings
            let committed = match (&result, self.policy) {
                (Ok(report), CommitPolicy::NewSettings) => cav
                    .set_live_phase(cs, report.new_phase)
                    .and_then(|_| cav.set_live_amp(cs, report.new_amp).map(|_| ())),
                (Ok(report), CommitPolicy::KeepAmps) => {
                    let amp = cav.init_amp;
                    cav.set_live_phase(cs, report.new_phase)
                        .and_then(|_| cav.set_live_amp(cs, amp).map(|_| ()))
                }
                (Ok(_), CommitPolicy::KeepAll) => cav.restore_initial(cs),
                (Err(_), _) => Ok(()),
            };
            committed.map_err(|source| LoopError::Write {
                cavity: cav.alias.clone(),
                source,
            })?;
            match result {
                Ok(report) => {
                    log::info!(
                        "{}: committed with {:?} policy, live amp={:.5} phase={:.2}",
                        report.cavity,
                        self.policy,
                        cav.live_amp,
                        cav.live_phase
                    );
                    reports.push(report);
                }
                Err(SetupError::UserStop) => {
                    stopped = true;
                    break;
                }
                Err(e) => {
                    failure = Some(e);
                    break;
                }
            }
            if run_state.should_stop() {
                stopped = true;
                break;
            }
        }
        progress.finish();
        let last_cavity = self.controllers[active].alias().to_string();
        let message = match (&failure, stopped) {
            (Some(e), _) => e.to_string(),
            (None, true) => format!("The setup stopped by user's request! Cavity={last_cavity}"),
            (None, false) => format!("The setup finished at cavity={last_cavity}!"),
        };
        if failure.is_some() {
            log::error!("{message}");
        } else {
            log::info!("{message}");
        }
        Ok(LoopOutcome {
            reports,
            last_cavity,
            stopped,
            failure,
            message,
        })
    }

    /// Writes the main loop state under `MAIN_CONTROLLER`
    pub fn write_xml(&self, root: &mut DataAdaptor) {
        let da = root.create_child("MAIN_CONTROLLER");
        da.set_value("keep_cav_params", self.policy == CommitPolicy::KeepAll)
            .set_value("keep_cav_amp", self.policy == CommitPolicy::KeepAmps);
        let bpms = da.create_child("BPM_WRAPPERS");
        for bpm in &self.bpms {
            bpm.write_xml(bpms);
        }
        for c in &self.controllers {
            c.write_xml(da);
        }
    }
    /// Restores the main loop state from `MAIN_CONTROLLER`
    pub fn read_xml(&mut self, root: &DataAdaptor) -> std::result::Result<(), XmlError> {
        let da = root.require_child("MAIN_CONTROLLER")?;
        let keep_all = da.has_attribute("keep_cav_params") && da.bool_value("keep_cav_params")?;
        let keep_amps = da.has_attribute("keep_cav_amp") && da.bool_value("keep_cav_amp")?;
        self.policy = match (keep_all, keep_amps) {
            (true, _) => CommitPolicy::KeepAll,
            (false, true) => CommitPolicy::KeepAmps,
            _ => CommitPolicy::NewSettings,
        };
        if let Some(bpms) = da.child("BPM_WRAPPERS") {
            for bpm in &self.bpms {
                bpm.read_xml(bpms)?;
            }
        }
        for c in &mut self.controllers {
            c.read_xml(da)?;
        }
        Ok(())
    }
}
