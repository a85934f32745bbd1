//! Thin RF gap longitudinal model
//!
//! Each cavity is a sequence of equally spaced thin RF gaps. A design pass
//! records the arrival time of the design particle at every node; the RF phase
//! seen by a probe at gap `k` is `φ_cavity + 360·f_rf·(t − T_k)` and its energy
//! gain `amp/n_gaps·cos φ`.
//!
//! The longitudinal envelope `(z, δp/p)` is tracked with linear drift and
//! thin gap bunching matrices around the probe trajectory.

use std::f64::consts::PI;

use interface::{
    model::{Result, Sigma, Transfer},
    units::{beta, gamma, C_LIGHT},
    EnvelopeState, ModelError, OnlineModel, ProbeState, Trajectory,
};
use serde::{Deserialize, Serialize};

/// Cavity of the lattice
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CavitySpec {
    pub alias: String,
    /// cavity center (m)
    pub position: f64,
    /// distance between the first and the last gap (m)
    pub length: f64,
    pub n_gaps: usize,
    pub rf_frequency: f64,
    /// design amplitude: maximum energy gain (MeV)
    pub amp: f64,
    /// design phase (degree)
    pub phase: f64,
}

/// BPM of the lattice
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BpmSpec {
    pub alias: String,
    pub position: f64,
}

/// Lattice description
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LatticeSpec {
    /// particle rest mass (MeV)
    pub mass: f64,
    /// kinetic energy at the lattice entrance (MeV)
    pub injection_energy: f64,
    pub cavities: Vec<CavitySpec>,
    pub bpms: Vec<BpmSpec>,
}

#[derive(Debug, Clone, Copy, PartialEq)]
enum NodeKind {
    Gap { cavity: usize },
    Bpm,
}

#[derive(Debug, Clone)]
struct Node {
    name: String,
    kind: NodeKind,
    position: f64,
    /// design arrival time
    time: f64,
}

/// Thin gap linac model
#[derive(Debug, Clone)]
pub struct ThinGapLinac {
    spec: LatticeSpec,
    nodes: Vec<Node>,
    amps: Vec<f64>,
    phases: Vec<f64>,
}

impl ThinGapLinac {
    /// Builds the model and runs the design pass
    pub fn new(spec: LatticeSpec) -> Result<Self> {
        let mut nodes = vec![];
        for (c, cav) in spec.cavities.iter().enumerate() {
            if cav.n_gaps == 0 {
                return Err(ModelError::NotACavity(cav.alias.clone()));
            }
            let step = if cav.n_gaps > 1 {
                cav.length / (cav.n_gaps - 1) as f64
            } else {
                0.
            };
            let first = cav.position - 0.5 * cav.length;
            for g in 0..cav.n_gaps {
                nodes.push(Node {
                    name: format!("{}:Rg{:02}", cav.alias, g + 1),
                    kind: NodeKind::Gap { cavity: c },
                    position: first + step * g as f64,
                    time: 0.,
                });
            }
        }
        for bpm in &spec.bpms {
            nodes.push(Node {
                name: bpm.alias.clone(),
                kind: NodeKind::Bpm,
                position: bpm.position,
                time: 0.,
            });
        }
        nodes.sort_by(|a, b| a.position.total_cmp(&b.position));
        let mut this = Self {
            amps: spec.cavities.iter().map(|c| c.amp).collect(),
            phases: spec.cavities.iter().map(|c| c.phase).collect(),
            spec,
            nodes,
        };
        this.design_pass()?;
        Ok(this)
    }
    /// Records the arrival time of the design particle at every node
    fn design_pass(&mut self) -> Result<()> {
        let mass = self.spec.mass;
        let (mut w, mut t, mut z) = (self.spec.injection_energy, 0., 0.);
        for i in 0..self.nodes.len() {
            if w <= 0. {
                return Err(ModelError::Tracking(format!(
                    "the design particle stopped before {}",
                    self.nodes[i].name
                )));
            }
            t += (self.nodes[i].position - z) / (beta(w, mass) * C_LIGHT);
            z = self.nodes[i].position;
            self.nodes[i].time = t;
            w += self.gap_kick(&self.nodes[i], t).1;
        }
        Ok(())
    }
    pub fn spec(&self) -> &LatticeSpec {
        &self.spec
    }
    fn cavity_index(&self, cavity: &str) -> Result<usize> {
        self.spec
            .cavities
            .iter()
            .position(|c| c.alias == cavity)
            .ok_or_else(|| {
                if self.node_index(cavity).is_ok() {
                    ModelError::NotACavity(cavity.to_string())
                } else {
                    ModelError::UnknownNode(cavity.to_string())
                }
            })
    }
    fn node_index(&self, node: &str) -> Result<usize> {
        self.nodes
            .iter()
            .position(|n| n.name == node)
            .ok_or_else(|| ModelError::UnknownNode(node.to_string()))
    }
    /// Index of the first gap of a cavity or of a node
    fn start_index(&self, node: &str) -> Result<usize> {
        match self.cavity_index(node) {
            Ok(c) => self
                .nodes
                .iter()
                .position(|n| matches!(n.kind, NodeKind::Gap { cavity, .. } if cavity == c))
                .ok_or_else(|| ModelError::NotACavity(node.to_string())),
            Err(_) => self.node_index(node),
        }
    }
    /// Index of the last gap of a cavity or of a node
    fn stop_index(&self, node: &str) -> Result<usize> {
        match self.cavity_index(node) {
            Ok(c) => self
                .nodes
                .iter()
                .rposition(|n| matches!(n.kind, NodeKind::Gap { cavity, .. } if cavity == c))
                .ok_or_else(|| ModelError::NotACavity(node.to_string())),
            Err(_) => self.node_index(node),
        }
    }
    fn range(&self, start: Option<&str>, stop: &str) -> Result<(usize, usize)> {
        let i0 = start.map_or(Ok(0), |s| self.start_index(s))?;
        let i1 = self.stop_index(stop)?;
        if i1 < i0 {
            return Err(ModelError::Range {
                start: start.unwrap_or_default().to_string(),
                stop: stop.to_string(),
            });
        }
        Ok((i0, i1))
    }
    /// Gap kick: returns the gap phase and the energy gain
    fn gap_kick(&self, node: &Node, time: f64) -> (f64, f64) {
        match node.kind {
            NodeKind::Gap { cavity, .. } => {
                let cav = &self.spec.cavities[cavity];
                let phase = self.phases[cavity] + 360. * cav.rf_frequency * (time - node.time);
                let gain = self.amps[cavity] / cav.n_gaps as f64 * phase.to_radians().cos();
                (phase, gain)
            }
            NodeKind::Bpm => (0., 0.),
        }
    }
    /// Single particle tracking from node `i0` (before its gap kick) to node `i1`
    ///
    /// The particle enters with kinetic energy `ekin` at time `t0` and position `z0`;
    /// starting from the lattice origin `z0` is 0.
    fn run(&self, i0: usize, i1: usize, ekin: f64, t0: f64, z0: f64) -> Result<Trajectory> {
        let mass = self.spec.mass;
        let (mut w, mut t, mut z) = (ekin, t0, z0);
        let mut states = Vec::with_capacity(i1 + 1 - i0);
        for node in &self.nodes[i0..=i1] {
            if w <= 0. {
                return Err(ModelError::Tracking(format!(
                    "the particle stopped before {} (W={w:.6} MeV)",
                    node.name
                )));
            }
            t += (node.position - z) / (beta(w, mass) * C_LIGHT);
            z = node.position;
            let gap_phase = match node.kind {
                NodeKind::Gap { .. } => {
                    let (phase, gain) = self.gap_kick(node, t);
                    w += gain;
                    Some(phase)
                }
                NodeKind::Bpm => None,
            };
            if !w.is_finite() || w <= 0. {
                return Err(ModelError::Tracking(format!(
                    "non-physical energy {w} MeV at {}",
                    node.name
                )));
            }
            states.push(ProbeState {
                node: node.name.clone(),
                position: z,
                ekin: w,
                time: t,
                gap_phase,
            });
        }
        Ok(Trajectory::new(states))
    }
}

fn mat_mul(a: &Transfer, b: &Transfer) -> Transfer {
    let mut c = [[0.; 2]; 2];
    for i in 0..2 {
        for j in 0..2 {
            c[i][j] = a[i][0] * b[0][j] + a[i][1] * b[1][j];
        }
    }
    c
}
fn transpose(a: &Transfer) -> Transfer {
    [[a[0][0], a[1][0]], [a[0][1], a[1][1]]]
}
const IDENTITY: Transfer = [[1., 0.], [0., 1.]];

impl OnlineModel for ThinGapLinac {
    fn cavities(&self) -> Vec<String> {
        self.spec.cavities.iter().map(|c| c.alias.clone()).collect()
    }
    fn bpms(&self) -> Vec<String> {
        self.spec.bpms.iter().map(|b| b.alias.clone()).collect()
    }
    fn position(&self, node: &str) -> Result<f64> {
        match self.cavity_index(node) {
            Ok(c) => Ok(self.spec.cavities[c].position),
            Err(_) => Ok(self.nodes[self.node_index(node)?].position),
        }
    }
    fn mass(&self) -> f64 {
        self.spec.mass
    }
    fn rf_frequency(&self, cavity: &str) -> Result<f64> {
        Ok(self.spec.cavities[self.cavity_index(cavity)?].rf_frequency)
    }
    fn cavity_amp(&self, cavity: &str) -> Result<f64> {
        Ok(self.amps[self.cavity_index(cavity)?])
    }
    fn set_cavity_amp(&mut self, cavity: &str, amp: f64) -> Result<()> {
        let c = self.cavity_index(cavity)?;
        self.amps[c] = amp;
        Ok(())
    }
    fn cavity_phase(&self, cavity: &str) -> Result<f64> {
        Ok(self.phases[self.cavity_index(cavity)?])
    }
    fn set_cavity_phase(&mut self, cavity: &str, phase: f64) -> Result<()> {
        let c = self.cavity_index(cavity)?;
        self.phases[c] = phase;
        Ok(())
    }
    fn track_particle(&self, start: Option<&str>, stop: &str, ekin: f64) -> Result<Trajectory> {
        let (i0, i1) = self.range(start, stop)?;
        match start {
            Some(_) => {
                let node = &self.nodes[i0];
                self.run(i0, i1, ekin, node.time, node.position)
            }
            None => self.run(i0, i1, ekin, 0., 0.),
        }
    }
    fn track_envelope(
        &self,
        start: Option<&str>,
        stop: &str,
        ekin: f64,
        sigma: Sigma,
    ) -> Result<Vec<EnvelopeState>> {
        let trajectory = self.track_particle(start, stop, ekin)?;
        let (i0, _) = self.range(start, stop)?;
        let mass = self.spec.mass;
        let mut w = ekin;
        let mut z = match start {
            Some(_) => self.nodes[i0].position,
            None => 0.,
        };
        let mut transfer = IDENTITY;
        let mut envelope = Vec::with_capacity(trajectory.states().len());
        for (node, state) in self.nodes[i0..].iter().zip(trajectory.states()) {
            let g = gamma(w, mass);
            let drift = [[1., (state.position - z) / (g * g)], [0., 1.]];
            transfer = mat_mul(&drift, &transfer);
            if let (NodeKind::Gap { cavity, .. }, Some(phase)) = (node.kind, state.gap_phase) {
                let cav = &self.spec.cavities[cavity];
                let w_out = state.ekin;
                let (b_in, g_in) = (beta(w, mass), gamma(w, mass));
                let (b_out, g_out) = (beta(w_out, mass), gamma(w_out, mass));
                let k = 2. * PI * cav.rf_frequency / (b_in * C_LIGHT);
                let amp = self.amps[cavity] / cav.n_gaps as f64;
                let kick = amp * k * phase.to_radians().sin() / (b_out * b_out * g_out * mass);
                let ratio = (b_in * b_in * g_in) / (b_out * b_out * g_out);
                transfer = mat_mul(&[[1., 0.], [kick, ratio]], &transfer);
            }
            w = state.ekin;
            z = state.position;
            let s = mat_mul(&mat_mul(&transfer, &sigma), &transpose(&transfer));
            if !(s[0][0] >= 0. && s[1][1] >= 0.) || s.iter().flatten().any(|v| !v.is_finite()) {
                return Err(ModelError::Tracking(format!(
                    "cannot track the envelope at {}",
                    node.name
                )));
            }
            envelope.push(EnvelopeState {
                node: node.name.clone(),
                position: z,
                ekin: w,
                sigma: s,
                transfer,
            });
        }
        Ok(envelope)
    }
}
