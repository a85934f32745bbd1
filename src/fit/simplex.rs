//! Nelder-Mead simplex minimization bounded by wall-clock time, number of evaluations
//! and cooperative cancellation

use std::{
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc, Mutex,
    },
    time::{Duration, Instant},
};

use argmin::{
    core::{CostFunction, Error, Executor, IterState, Solver, TerminationReason, KV},
    solver::neldermead::NelderMead,
};
use nalgebra::DVector;

use super::FitError;
use crate::run_state::RunState;

/// Scoring function failure
#[derive(Debug, thiserror::Error)]
#[error("{0}")]
pub struct ScoreError(pub String);
impl From<interface::ModelError> for ScoreError {
    fn from(e: interface::ModelError) -> Self {
        Self(e.to_string())
    }
}

/// Objective function of a simplex fit
///
/// `params` has one value per [FitVariable], including the variables excluded from the fit.
pub trait Scorer: Send {
    fn score(&mut self, params: &[f64]) -> Result<f64, ScoreError>;
}

/// A fit parameter
#[derive(Debug, Clone, PartialEq)]
pub struct FitVariable {
    pub name: String,
    pub value: f64,
    /// initial simplex step
    pub step: f64,
    /// whether the variable is varied by the fit
    pub used: bool,
}
impl FitVariable {
    pub fn new<S: Into<String>>(name: S, value: f64, step: f64) -> Self {
        Self {
            name: name.into(),
            value,
            step,
            used: true,
        }
    }
    pub fn used(mut self, used: bool) -> Self {
        self.used = used;
        self
    }
}

/// Handle to stop a running fit, the fit returns its best point at the next evaluation
#[derive(Debug, Clone, Default)]
pub struct StopSolving(Arc<AtomicBool>);
impl StopSolving {
    pub fn stop_solving(&self) {
        self.0.store(true, Ordering::Relaxed);
    }
    pub fn is_stopped(&self) -> bool {
        self.0.load(Ordering::Relaxed)
    }
}

/// Reason the minimization ended
#[derive(Debug, Clone, PartialEq)]
pub enum Termination {
    /// the simplex size fell below the tolerance or no variable is used
    Converged,
    TimeOut,
    MaxEvaluations,
    /// either [StopSolving::stop_solving] or the run state stop request
    UserStop,
    /// the scorer failed, the best point so far is returned
    ScorerFailure(String),
}

/// Best point found by a fit
#[derive(Debug, Clone)]
pub struct FitOutcome {
    pub params: Vec<f64>,
    pub score: f64,
    pub evaluations: usize,
    pub termination: Termination,
}

/// Simplex minimizer settings
#[derive(Debug, Clone)]
pub struct Simplex {
    max_time: Option<Duration>,
    max_evaluations: Option<usize>,
    sd_tolerance: f64,
    stop: StopSolving,
    run_state: Option<Arc<RunState>>,
}
impl Default for Simplex {
    fn default() -> Self {
        Self {
            max_time: None,
            max_evaluations: None,
            sd_tolerance: 1e-12,
            stop: StopSolving::default(),
            run_state: None,
        }
    }
}

struct Progress<'a> {
    best: Option<(Vec<f64>, f64)>,
    evaluations: usize,
    termination: Option<Termination>,
    observer: Box<dyn FnMut(usize, f64) + Send + 'a>,
}

struct FitProblem<'p, 'a> {
    scorer: Mutex<&'a mut dyn Scorer>,
    progress: &'p Mutex<Progress<'a>>,
    template: Vec<f64>,
    active: Vec<usize>,
    deadline: Option<Instant>,
    max_evaluations: Option<usize>,
    stop: StopSolving,
    run_state: Option<Arc<RunState>>,
    halted: Arc<AtomicBool>,
}
impl FitProblem<'_, '_> {
    fn full_params(&self, p: &DVector<f64>) -> Vec<f64> {
        let mut params = self.template.clone();
        self.active.iter().zip(p.iter()).for_each(|(&i, &v)| params[i] = v);
        params
    }
    /// Records why the fit ends and returns the cost given to the solver from then on
    fn halt(&self, progress: &mut Progress, termination: Termination) -> f64 {
        progress.termination = Some(termination);
        self.halted.store(true, Ordering::Relaxed);
        HALTED_COST
    }
}

/// Cost of every point evaluated once the fit is halted
///
/// Nelder-Mead unwraps the cost of the initial simplex vertices,
/// so the cost function never fails and the solver is ended by [Bounded::terminate] instead.
const HALTED_COST: f64 = f64::MAX;

impl CostFunction for FitProblem<'_, '_> {
    type Param = DVector<f64>;
    type Output = f64;

    fn cost(&self, p: &Self::Param) -> Result<Self::Output, Error> {
        let Ok(mut progress) = self.progress.lock() else {
            self.halted.store(true, Ordering::Relaxed);
            return Ok(HALTED_COST);
        };
        if progress.termination.is_some() {
            return Ok(HALTED_COST);
        }
        if self.stop.is_stopped() || self.run_state.as_ref().map_or(false, |s| s.should_stop()) {
            return Ok(self.halt(&mut progress, Termination::UserStop));
        }
        // the starting point is always scored
        if progress.evaluations > 0 && self.deadline.map_or(false, |d| Instant::now() >= d) {
            return Ok(self.halt(&mut progress, Termination::TimeOut));
        }
        if self
            .max_evaluations
            .map_or(false, |n| progress.evaluations >= n)
        {
            return Ok(self.halt(&mut progress, Termination::MaxEvaluations));
        }
        let params = self.full_params(p);
        let score = match self.scorer.lock() {
            Ok(mut scorer) => scorer.score(&params),
            Err(_) => Err(ScoreError("fit scorer lock poisoned".into())),
        };
        let score = match score {
            Ok(score) if score.is_finite() => score,
            Ok(score) => {
                return Ok(self.halt(
                    &mut progress,
                    Termination::ScorerFailure(format!("non-finite score {score}")),
                ))
            }
            Err(e) => return Ok(self.halt(&mut progress, Termination::ScorerFailure(e.0))),
        };
        progress.evaluations += 1;
        if progress.best.as_ref().map_or(true, |(_, s)| score < *s) {
            let n = progress.evaluations;
            (progress.observer)(n, score);
            progress.best = Some((params, score));
        }
        Ok(score)
    }
}

type NelderMeadState = IterState<DVector<f64>, (), (), (), f64>;

/// Nelder-Mead that terminates as soon as the cost function halts the fit
#[derive(serde::Serialize)]
struct Bounded {
    solver: NelderMead<DVector<f64>, f64>,
    #[serde(skip)]
    halted: Arc<AtomicBool>,
}
impl<'p, 'a> Solver<FitProblem<'p, 'a>, NelderMeadState> for Bounded {
    const NAME: &'static str = "Bounded Nelder-Mead";

    fn init(
        &mut self,
        problem: &mut argmin::core::Problem<FitProblem<'p, 'a>>,
        state: NelderMeadState,
    ) -> Result<(NelderMeadState, Option<KV>), Error> {
        <NelderMead<DVector<f64>, f64> as Solver<FitProblem<'p, 'a>, NelderMeadState>>::init(
            &mut self.solver,
            problem,
            state,
        )
    }

    fn next_iter(
        &mut self,
        problem: &mut argmin::core::Problem<FitProblem<'p, 'a>>,
        state: NelderMeadState,
    ) -> Result<(NelderMeadState, Option<KV>), Error> {
        <NelderMead<DVector<f64>, f64> as Solver<FitProblem<'p, 'a>, NelderMeadState>>::next_iter(
            &mut self.solver,
            problem,
            state,
        )
    }

    fn terminate(&mut self, state: &NelderMeadState) -> TerminationReason {
        if self.halted.load(Ordering::Relaxed) {
            return TerminationReason::Aborted;
        }
        <NelderMead<DVector<f64>, f64> as Solver<FitProblem<'p, 'a>, NelderMeadState>>::terminate(
            &mut self.solver,
            state,
        )
    }
}

impl Simplex {
    pub fn new() -> Self {
        Default::default()
    }
    /// Wall-clock bound of the fit
    pub fn max_time(mut self, max_time: Duration) -> Self {
        self.max_time = Some(max_time);
        self
    }
    pub fn max_evaluations(mut self, n: usize) -> Self {
        self.max_evaluations = Some(n);
        self
    }
    pub fn sd_tolerance(mut self, tolerance: f64) -> Self {
        self.sd_tolerance = tolerance;
        self
    }
    /// The fit stops when the run state stop is requested
    pub fn run_state(mut self, run_state: Arc<RunState>) -> Self {
        self.run_state = Some(run_state);
        self
    }
    /// Returns a handle to stop the fit from another thread
    pub fn stopper(&self) -> StopSolving {
        self.stop.clone()
    }

    /// Minimizes the scorer over the used variables
    ///
    /// `observer` is called with the number of evaluations and the score each time the best score improves.
    pub fn minimize<'a>(
        &self,
        scorer: &'a mut dyn Scorer,
        variables: &[FitVariable],
        observer: impl FnMut(usize, f64) + Send + 'a,
    ) -> Result<FitOutcome, FitError> {
        let template: Vec<f64> = variables.iter().map(|v| v.value).collect();
        let active: Vec<usize> = variables
            .iter()
            .enumerate()
            .filter_map(|(i, v)| v.used.then_some(i))
            .collect();
        if active.is_empty() {
            let score = scorer.score(&template).map_err(|e| FitError::Scorer(e.0))?;
            return Ok(FitOutcome {
                params: template,
                score,
                evaluations: 1,
                termination: Termination::Converged,
            });
        }
        let x0 = DVector::from_iterator(active.len(), active.iter().map(|&i| template[i]));
        let mut simplex = vec![x0.clone()];
        for (k, &i) in active.iter().enumerate() {
            let mut vertex = x0.clone();
            vertex[k] += variables[i].step;
            simplex.push(vertex);
        }
        let halted = Arc::new(AtomicBool::new(false));
        let solver = Bounded {
            solver: NelderMead::new(simplex)
                .with_sd_tolerance(self.sd_tolerance)
                .map_err(|e| FitError::Solver(e.to_string()))?,
            halted: Arc::clone(&halted),
        };
        let progress = Mutex::new(Progress {
            best: None,
            evaluations: 0,
            termination: None,
            observer: Box::new(observer),
        });
        let problem = FitProblem {
            scorer: Mutex::new(scorer),
            progress: &progress,
            template,
            active,
            deadline: self.max_time.map(|t| Instant::now() + t),
            max_evaluations: self.max_evaluations,
            stop: self.stop.clone(),
            run_state: self.run_state.clone(),
            halted,
        };
        let run_error = Executor::new(problem, solver)
            .configure(|state| state.max_iters(u64::MAX))
            .run()
            .err()
            .map(|e| e.to_string());
        let Progress {
            best,
            evaluations,
            termination,
            ..
        } = progress
            .into_inner()
            .map_err(|_| FitError::Solver("fit progress lock poisoned".into()))?;
        let termination = match (termination, run_error) {
            (Some(termination), _) => termination,
            (None, None) => Termination::Converged,
            (None, Some(e)) => return Err(FitError::Solver(e)),
        };
        match (best, termination) {
            (Some((params, score)), termination) => {
                log::debug!("simplex: {termination:?} after {evaluations} evaluations, score={score:e}");
                Ok(FitOutcome {
                    params,
                    score,
                    evaluations,
                    termination,
                })
            }
            (None, Termination::ScorerFailure(e)) => Err(FitError::Scorer(e)),
            (None, Termination::UserStop) => Err(FitError::Stopped),
            (None, termination) => Err(FitError::Solver(format!(
                "no evaluation before {termination:?}"
            ))),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct Paraboloid {
        center: [f64; 3],
        fail_after: Option<usize>,
        calls: usize,
    }
    impl Scorer for Paraboloid {
        fn score(&mut self, params: &[f64]) -> Result<f64, ScoreError> {
            self.calls += 1;
            if self.fail_after.map_or(false, |n| self.calls > n) {
                return Err(ScoreError("cannot track the probe".into()));
            }
            Ok(params
                .iter()
                .zip(&self.center)
                .map(|(p, c)| (p - c).powi(2))
                .sum())
        }
    }

    fn variables() -> Vec<FitVariable> {
        vec![
            FitVariable::new("phase_shift", 0., 1.),
            FitVariable::new("ekin_in", 2.5, 0.003),
            FitVariable::new("amp_coeff", 1., 0.005),
        ]
    }

    #[test]
    fn converges() {
        let mut scorer = Paraboloid {
            center: [2., 2.6, 1.01],
            fail_after: None,
            calls: 0,
        };
        let mut improvements = 0;
        let outcome = Simplex::new()
            .max_evaluations(2000)
            .minimize(&mut scorer, &variables(), |_, _| improvements += 1)
            .unwrap();
        assert!((outcome.params[0] - 2.).abs() < 1e-3);
        assert!((outcome.params[1] - 2.6).abs() < 1e-3);
        assert!((outcome.params[2] - 1.01).abs() < 1e-3);
        assert!(improvements > 0);
    }

    #[test]
    fn unused_variables_are_kept() {
        let mut scorer = Paraboloid {
            center: [2., 2.6, 1.01],
            fail_after: None,
            calls: 0,
        };
        let mut vars = variables();
        vars[1].used = false;
        let outcome = Simplex::new()
            .max_evaluations(2000)
            .minimize(&mut scorer, &vars, |_, _| ())
            .unwrap();
        assert_eq!(outcome.params[1], 2.5);
        assert!((outcome.params[0] - 2.).abs() < 1e-3);
    }

    #[test]
    fn evaluation_bound() {
        let mut scorer = Paraboloid {
            center: [2., 2.6, 1.01],
            fail_after: None,
            calls: 0,
        };
        let outcome = Simplex::new()
            .max_evaluations(10)
            .minimize(&mut scorer, &variables(), |_, _| ())
            .unwrap();
        assert_eq!(outcome.termination, Termination::MaxEvaluations);
        assert_eq!(outcome.evaluations, 10);
    }

    #[test]
    fn stop_and_failure_return_best() {
        let mut scorer = Paraboloid {
            center: [2., 2.6, 1.01],
            fail_after: Some(20),
            calls: 0,
        };
        let outcome = Simplex::new()
            .minimize(&mut scorer, &variables(), |_, _| ())
            .unwrap();
        assert!(matches!(outcome.termination, Termination::ScorerFailure(_)));
        assert_eq!(outcome.evaluations, 20);

        let simplex = Simplex::new();
        simplex.stopper().stop_solving();
        let mut scorer = Paraboloid {
            center: [0.; 3],
            fail_after: None,
            calls: 0,
        };
        assert!(matches!(
            simplex.minimize(&mut scorer, &variables(), |_, _| ()),
            Err(FitError::Stopped)
        ));
    }

    #[test]
    fn early_halts_keep_the_starting_point() {
        // the second vertex of the initial simplex fails
        let mut scorer = Paraboloid {
            center: [2., 2.6, 1.01],
            fail_after: Some(1),
            calls: 0,
        };
        let outcome = Simplex::new()
            .minimize(&mut scorer, &variables(), |_, _| ())
            .unwrap();
        assert!(matches!(outcome.termination, Termination::ScorerFailure(_)));
        assert_eq!(outcome.evaluations, 1);
        assert_eq!(outcome.params, vec![0., 2.5, 1.]);

        let mut scorer = Paraboloid {
            center: [2., 2.6, 1.01],
            fail_after: None,
            calls: 0,
        };
        let outcome = Simplex::new()
            .max_time(Duration::ZERO)
            .minimize(&mut scorer, &variables(), |_, _| ())
            .unwrap();
        assert_eq!(outcome.termination, Termination::TimeOut);
        assert_eq!(outcome.evaluations, 1);
        assert_eq!(scorer.calls, 1);

        let mut scorer = Paraboloid {
            center: [2., 2.6, 1.01],
            fail_after: None,
            calls: 0,
        };
        let outcome = Simplex::new()
            .max_evaluations(2)
            .minimize(&mut scorer, &variables(), |_, _| ())
            .unwrap();
        assert_eq!(outcome.termination, Termination::MaxEvaluations);
        assert_eq!(outcome.evaluations, 2);
    }
}
