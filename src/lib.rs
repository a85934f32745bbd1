//! # Linac RF Tune-Up
//!
//! Phase and amplitude set-up of the RF cavities of a hadron linac from BPM phase scans.
//!
//! The warm linac cavities are tuned one at a time by a [main loop](main_loop::MainLoop):
//! each cavity [controller](controller::CavityController) scans its cavity, fits the
//! [model](model::ModelAdapter) to the BPM data and proposes new live settings that are
//! either committed or reverted according to the [commit policy](main_loop::CommitPolicy).
//! There are 3 kinds of controllers:
//!  - **MEBT**: re-bunchers, a sine-like scan gives the zero-acceleration phase
//!  - **DTL1**: the first tank, the amplitude front of a BPM behind an energy degrader gives
//!    the phase guess that is refined by a PASTA fit
//!  - **DTL/CCL**: the other tanks, a 360° scan gives the guess for the PASTA fit
//!
//! The superconducting linac cavities are analyzed downstream of the warm linac by
//! [SclLinac](scl::SclLinac): BPM phase offsets, cavity phases and longitudinal Twiss parameters.
//!
//! The control system is abstracted by [interface::ControlSystem]; [live::SimulatedMachine]
//! implements it on top of a [thin gap model](model::ThinGapLinac) of the linac.
//!
//! ```no_run
//! use linac_tuneup::{config::TuneUpConfig, main_loop::CommitPolicy, progress::ScanProgress};
//!
//! let config = TuneUpConfig::default();
//! let cs = config.simulated_machine()?;
//! let mut main_loop = config.main_loop()?.with_policy(CommitPolicy::KeepAll);
//! main_loop.init_all(&cs, None)?;
//! let outcome = main_loop.run(&cs, 0, 3, &ScanProgress::new("MEBT"))?;
//! println!("{}", outcome.message);
//! # Ok::<(), linac_tuneup::TuneUpError>(())
//! ```

pub mod bpm;
pub mod cavity;
pub mod config;
pub mod controller;
pub mod fit;
pub mod live;
pub mod main_loop;
pub mod model;
pub mod net_power;
pub mod persistence;
pub mod progress;
pub mod run_state;
pub mod scl;
pub mod scorer;
pub mod stats;

#[derive(Debug, thiserror::Error)]
pub enum TuneUpError {
    #[error("model failed")]
    Model(#[from] interface::ModelError),
    #[error("control system failed")]
    Channel(#[from] interface::ChannelError),
    #[error("XML data failed")]
    Xml(#[from] interface::XmlError),
    #[error("filing failed")]
    Filing(#[from] interface::filing::FilingError),
    #[error("fit failed")]
    Fit(#[from] fit::FitError),
    #[error("cavity set-up failed")]
    Setup(#[from] controller::SetupError),
    #[error("main loop failed")]
    Loop(#[from] main_loop::LoopError),
    #[error("net power averaging failed")]
    NetPower(#[from] net_power::NetPowerError),
    #[error("SCL analysis failed")]
    Analysis(#[from] scl::AnalysisError),
    #[error("configuration failed")]
    Config(#[from] config::ConfigError),
    #[error("simulated machine failed")]
    Simulation(#[from] live::SimulationError),
}
pub type Result<T> = std::result::Result<T, TuneUpError>;
