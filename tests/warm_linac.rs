use std::sync::{Arc, Mutex};

use interface::{
    units::{wrap_phase, H_MINUS_MASS},
    ChannelError, ControlSystem,
};
use linac_tuneup::{
    bpm::{BpmReading, BpmWrapper},
    cavity::CavityWrapper,
    controller::{
        amp_front_position, CavityController, Dtl1Params, DtlCclController, DtlCclParams,
        MebtController, MebtMode, MebtParams, ScanKind,
    },
    fit::FitVariable,
    live::{CavityError, PlantCavity, SimulatedMachine, SimulationConfig},
    main_loop::{CommitPolicy, MainLoop},
    model::{BpmSpec, CavitySpec, LatticeSpec, ModelAdapter, ThinGapLinac},
    progress::ScanProgress,
    run_state::RunState,
    scorer::{run_cavity_fit, PastaMode, PastaRecord, PastaScorer, PastaSettings},
    stats::GraphData,
};

fn lattice(injection_energy: f64, amp: f64, phase: f64, bpms: &[(&str, f64)]) -> LatticeSpec {
    LatticeSpec {
        mass: H_MINUS_MASS,
        injection_energy,
        cavities: vec![CavitySpec {
            alias: "CAV".into(),
            position: 1.,
            length: 1.,
            n_gaps: 10,
            rf_frequency: 402.5e6,
            amp,
            phase,
        }],
        bpms: bpms
            .iter()
            .map(|&(alias, position)| BpmSpec {
                alias: alias.into(),
                position,
            })
            .collect(),
    }
}

/// A buncher whose BPM phase follows `sin(φ − 30°)` (degree) with a constant amplitude
struct SineBuncher {
    state: Mutex<(f64, f64, bool)>,
}
impl ControlSystem for SineBuncher {
    fn connect(&self, _pv: &str) -> Result<(), ChannelError> {
        Ok(())
    }
    fn get(&self, pv: &str) -> Result<f64, ChannelError> {
        let (amp, phase, blanked) = *self.state.lock().unwrap();
        let bpm_phase = if blanked {
            0.
        } else {
            (phase - 30.).to_radians().sin()
        };
        match pv {
            "CAV:CtlAmpSet" => Ok(amp),
            "CAV:CtlPhaseSet" => Ok(phase),
            "CAV:BlnkBeam" => Ok(if blanked { 1. } else { 0. }),
            "CAV:NetPwr" => Ok(10. * amp * amp),
            "BPM1:phaseAvg" | "BPM2:phaseAvg" => Ok(wrap_phase(bpm_phase)),
            "BPM1:amplitudeAvg" | "BPM2:amplitudeAvg" => Ok(10.),
            _ if pv.starts_with("BPM") => Ok(0.),
            _ => Err(ChannelError::Read(pv.into())),
        }
    }
    fn put(&self, pv: &str, value: f64) -> Result<(), ChannelError> {
        let mut state = self.state.lock().unwrap();
        match pv {
            "CAV:CtlAmpSet" => state.0 = value,
            "CAV:CtlPhaseSet" => state.1 = value,
            "CAV:BlnkBeam" => state.2 = value != 0.,
            _ => {
                return Err(ChannelError::Write {
                    pv: pv.into(),
                    value,
                })
            }
        }
        Ok(())
    }
}

#[test]
fn mebt_buncher_sine_scan() -> anyhow::Result<()> {
    let cs = SineBuncher {
        state: Mutex::new((0.8, -60., false)),
    };
    let bpms = [("BPM1", 1.5), ("BPM2", 2.5)];
    let mut buncher = lattice(2.5, 0.1, -90., &bpms);
    buncher.cavities[0].position = 0.5;
    buncher.cavities[0].length = 0.1;
    buncher.cavities[0].n_gaps = 2;
    let model = ModelAdapter::new(Box::new(ThinGapLinac::new(buncher)?), 402.5e6)?;
    let mut cav = CavityWrapper::new("CAV", 0.5, "CAV", "CAV:NetPwr");
    cav.ekin_in_design = 2.5;
    let mebt = MebtController::new(vec!["BPM1".into(), "BPM2".into()]).with_params(MebtParams {
        sleep_time: 0.,
        full_scan_phase_step: 10.,
        mode: MebtMode::None,
        ..Default::default()
    });
    let controller = CavityController::new(cav, ScanKind::Mebt(mebt));
    let wrappers = bpms
        .iter()
        .map(|&(alias, position)| BpmWrapper::new(alias, position))
        .collect();
    let mut main_loop =
        MainLoop::new(vec![controller], wrappers, model).with_policy(CommitPolicy::NewSettings);
    main_loop.init_all(&cs, None)?;
    let outcome = main_loop.run(&cs, 0, 0, &ScanProgress::hidden())?;
    assert!(outcome.is_success(), "{}", outcome.message);

    let report = &outcome.reports[0];
    assert!((report.new_phase - 30.).abs() < 1., "{report:?}");
    assert_eq!(report.new_amp, 0.8);
    let (amp, phase, blanked) = *cs.state.lock().unwrap();
    assert_eq!(amp, 0.8);
    assert!((phase - 30.).abs() < 1.);
    assert!(!blanked);
    Ok(())
}

#[test]
fn dtl1_half_maximum_front() {
    let mut front = GraphData::new();
    for i in 0..36 {
        let phase = -180. + 10. * i as f64;
        let amp = if wrap_phase(phase + 150.) > 0. && wrap_phase(phase + 150.) < 150. {
            10.
        } else if wrap_phase(phase + 150.) == 0. {
            5.5
        } else {
            1.
        };
        front.add_point(phase, amp, 0.);
    }
    let position = amp_front_position(&front).expect("a rising front");
    assert!((position + 150.).abs() < 1e-9, "{position}");
    let guess = wrap_phase(position + Dtl1Params::default().phase_shift_from_front);
    assert!((guess + 100.).abs() < 1e-9, "{guess}");
}

#[test]
fn pasta_fit_three_amplitudes() -> anyhow::Result<()> {
    let bpms = [("B0", 2.), ("B1", 3.5), ("B2", 5.)];
    let mut model = ModelAdapter::new(
        Box::new(ThinGapLinac::new(lattice(40., 1.5, -30., &bpms))?),
        402.5e6,
    )?;
    let mut active = model.activate("CAV", "B2")?;
    let aliases = ["B0", "B1", "B2"];
    let (phase_shift, ekin_in, amp_coeff) = (2., 40.5, 1.);

    let mut records = vec![];
    for cav_amp in [1.02, 1., 0.98] {
        let mut record = PastaRecord::new(cav_amp, &aliases);
        active.set_model_amp_phase(amp_coeff * cav_amp, 0., phase_shift)?;
        for i in 0..11 {
            let cav_phase = -20. + 3. * i as f64;
            let phases = active.get_bpm_phases(ekin_in, cav_phase, phase_shift, &aliases)?;
            for (scan, phase) in record.scans.iter_mut().zip(phases) {
                scan.add_point(
                    cav_phase,
                    BpmReading {
                        phase: wrap_phase(phase - 12.),
                        amp: 1.,
                    },
                    0.1,
                );
            }
        }
        records.push(record);
    }

    let settings = PastaSettings {
        bpm_indices: (1, 2),
        mode: PastaMode::Difference,
        cav_off_phases: None,
        fit_range: (-20., 10.),
        n_points: 30,
    };
    let variables = [
        FitVariable::new("phase_shift", 0.5, 1.),
        FitVariable::new("ekin_in", 40.3, 0.003),
        FitVariable::new("amp_coeff", 1.01, 0.005),
    ];
    let mut scorer = PastaScorer::new(&mut active, &mut records, settings);
    let fit = run_cavity_fit(
        "CAV",
        &mut scorer,
        &variables,
        20.,
        &RunState::new(),
        &ScanProgress::hidden(),
    )?;
    assert!((fit.amp_coeff - amp_coeff).abs() < 0.005, "{fit:?}");
    assert!((fit.phase_shift - phase_shift).abs() < 0.5, "{fit:?}");
    assert!((fit.ekin_in - ekin_in).abs() < 0.05, "{fit:?}");
    Ok(())
}

/// Requests the scan to stop once the cavity phase reaches 90°
struct StopAt90<'a> {
    machine: &'a SimulatedMachine,
    run_state: Arc<RunState>,
}
impl ControlSystem for StopAt90<'_> {
    fn connect(&self, pv: &str) -> Result<(), ChannelError> {
        self.machine.connect(pv)
    }
    fn get(&self, pv: &str) -> Result<f64, ChannelError> {
        self.machine.get(pv)
    }
    fn put(&self, pv: &str, value: f64) -> Result<(), ChannelError> {
        if pv == "CAV:CtlPhaseSet" && value >= 90. {
            self.run_state.request_stop();
        }
        self.machine.put(pv, value)
    }
}

#[test]
fn cooperative_stop() -> anyhow::Result<()> {
    let bpms = [("BPM_IN", 1.2), ("BPM_A", 2.), ("BPM_B", 3.5)];
    let machine = SimulatedMachine::new(
        lattice(7.5, 1.5, -30., &bpms),
        402.5e6,
        vec![PlantCavity {
            alias: "CAV".into(),
            llrf: "CAV".into(),
            net_pwr_pv: "CAV:NetPwr".into(),
            design_power: 1000.,
        }],
        SimulationConfig {
            cavities: vec![CavityError {
                alias: "CAV".into(),
                phase_offset: 25.,
                amp_coeff: 0.8,
                acceptance: None,
            }],
            ..Default::default()
        },
    )?;
    let mut model = ModelAdapter::new(
        Box::new(ThinGapLinac::new(lattice(7.5, 1.5, -30., &bpms))?),
        402.5e6,
    )?;
    let mut cav = CavityWrapper::new("CAV", 1., "CAV", "CAV:NetPwr");
    cav.design_amp = 1.5;
    cav.design_phase = -30.;
    cav.ekin_in_design = 7.5;
    let dtl = DtlCclController::new(bpms.iter().map(|(b, _)| b.to_string()).collect(), 1)
        .with_params(DtlCclParams {
            sleep_time: 0.,
            ..Default::default()
        });
    let mut controller = CavityController::new(cav, ScanKind::DtlCcl(dtl));
    controller.init(&machine)?;
    let (init_amp, init_phase) = machine.live_settings("CAV").expect("a simulated cavity");

    let cs = StopAt90 {
        machine: &machine,
        run_state: Arc::clone(controller.local_run_state()),
    };
    let wrappers: Vec<_> = bpms
        .iter()
        .map(|&(alias, position)| BpmWrapper::new(alias, position))
        .collect();
    let e = controller
        .run_local(&cs, &mut model, &wrappers, &ScanProgress::hidden())
        .unwrap_err();
    assert!(e.is_user_stop(), "{e}");
    assert_eq!(e.to_string(), "user stop");
    assert_eq!(machine.live_settings("CAV"), Some((init_amp, init_phase)));
    assert_eq!(controller.cavity.new_phase, None);
    let ScanKind::DtlCcl(dtl) = &controller.kind else {
        unreachable!()
    };
    // -180° to 80° plus at most one partial point
    let n = dtl.full_scans[0].len();
    assert!((27..=28).contains(&n), "{n}");
    assert!(!controller.local_run_state().is_running());
    Ok(())
}
