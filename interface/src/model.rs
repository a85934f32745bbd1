//! # On-line model interface
//!
//! The beam dynamics model is consumed through the [OnlineModel] trait:
//! cavity amplitudes and phases can be changed on a model-local copy of the lattice
//! and a probe (a single particle or a longitudinal envelope) is tracked between two nodes.
//!
//! Nodes are identified by their alias; a cavity alias used as a tracking start
//! stands for the cavity first RF gap and, used as a tracking stop, for its last RF gap.

/// Longitudinal second moments `[[<z²>, <zz'>], [<zz'>, <z'²>]]` (m, rad)
pub type Sigma = [[f64; 2]; 2];
/// Longitudinal 2x2 transfer matrix
pub type Transfer = [[f64; 2]; 2];

#[derive(Debug, thiserror::Error)]
pub enum ModelError {
    #[error("unknown lattice node {0}")]
    UnknownNode(String),
    #[error("{0} is not a cavity")]
    NotACavity(String),
    #[error("tracking from {start} to {stop} is not possible: stop is upstream of start")]
    Range { start: String, stop: String },
    #[error("cannot track the probe: {0}")]
    Tracking(String),
}
pub type Result<T> = std::result::Result<T, ModelError>;

/// Single particle probe state at a lattice node
#[derive(Debug, Clone, PartialEq)]
pub struct ProbeState {
    pub node: String,
    /// longitudinal position (m)
    pub position: f64,
    /// kinetic energy (MeV)
    pub ekin: f64,
    /// absolute time of flight (s)
    pub time: f64,
    /// RF phase seen by the particle if the node is an RF gap (degree)
    pub gap_phase: Option<f64>,
}

/// Single particle trajectory
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Trajectory {
    states: Vec<ProbeState>,
}
impl Trajectory {
    pub fn new(states: Vec<ProbeState>) -> Self {
        Self { states }
    }
    /// Returns the probe state at the given node
    pub fn state(&self, node: &str) -> Option<&ProbeState> {
        self.states.iter().find(|s| s.node == node)
    }
    pub fn final_state(&self) -> Option<&ProbeState> {
        self.states.last()
    }
    pub fn states(&self) -> &[ProbeState] {
        &self.states
    }
}

/// Envelope probe state at a lattice node
#[derive(Debug, Clone, PartialEq)]
pub struct EnvelopeState {
    pub node: String,
    pub position: f64,
    pub ekin: f64,
    /// longitudinal second moments
    pub sigma: Sigma,
    /// transfer matrix from the tracking start to this node
    pub transfer: Transfer,
}

/// Beam dynamics model
pub trait OnlineModel: Send {
    /// Cavity aliases in beamline order
    fn cavities(&self) -> Vec<String>;
    /// BPM aliases in beamline order
    fn bpms(&self) -> Vec<String>;
    /// Longitudinal position of a node (cavity center for cavities)
    fn position(&self, node: &str) -> Result<f64>;
    /// Particle rest mass (MeV)
    fn mass(&self) -> f64;
    /// Cavity RF frequency (Hz)
    fn rf_frequency(&self, cavity: &str) -> Result<f64>;
    /// Cavity amplitude in model units
    fn cavity_amp(&self, cavity: &str) -> Result<f64>;
    fn set_cavity_amp(&mut self, cavity: &str, amp: f64) -> Result<()>;
    /// Phase of the cavity first RF gap (degree)
    fn cavity_phase(&self, cavity: &str) -> Result<f64>;
    fn set_cavity_phase(&mut self, cavity: &str, phase: f64) -> Result<()>;
    /// Tracks a single particle entering `start` with kinetic energy `ekin` up to `stop`
    ///
    /// A `None` start is the beginning of the lattice.
    fn track_particle(&self, start: Option<&str>, stop: &str, ekin: f64) -> Result<Trajectory>;
    /// Tracks the longitudinal envelope entering `start` with second moments `sigma` up to `stop`
    fn track_envelope(
        &self,
        start: Option<&str>,
        stop: &str,
        ekin: f64,
        sigma: Sigma,
    ) -> Result<Vec<EnvelopeState>>;
}
