use interface::filing::Filing;
use linac_tuneup::{
    config::TuneUpConfig, controller::ScanKind, main_loop::LoopError, progress::ScanProgress,
};

fn fast_config() -> TuneUpConfig {
    let mut config = TuneUpConfig::default();
    config.set_sleep_times(0.);
    config.cap_fit_times(1.);
    config
}

#[test]
fn session_survives_a_restart() -> anyhow::Result<()> {
    let config = fast_config();
    let cs = config.simulated_machine()?;
    let mut main_loop = config.main_loop()?;
    main_loop.init_all(&cs, None)?;
    let outcome = main_loop.run(&cs, 0, 3, &ScanProgress::hidden())?;
    assert!(outcome.is_success(), "{}", outcome.message);
    assert_eq!(outcome.reports.len(), 4);
    assert_eq!(outcome.last_cavity, "MEBT4");

    // the tanks as if they had been tuned as well
    for (k, c) in main_loop.controllers.iter_mut().enumerate().skip(4) {
        let cav = &mut c.cavity;
        cav.new_amp = Some(cav.init_amp * (1. + 0.003 * k as f64));
        cav.new_phase = Some(-25. + 1.5 * k as f64);
        cav.ekin_in = cav.ekin_in_design + 0.001 * k as f64;
        cav.ekin_out = cav.ekin_out_design - 0.002 * k as f64;
        cav.avg_fit_err = 0.05 * k as f64;
        cav.is_analyzed = true;
    }
    // CCL4 measures with the SCL BPMs
    let in_use = main_loop.set_bpm_off("SCL_Diag:BPM02").unwrap_err();
    assert!(
        matches!(in_use, LoopError::BpmInUse { ref cavities, .. } if cavities == "CCL4"),
        "{in_use}"
    );
    main_loop.set_bpm_off("DTL_Diag:BPM102")?;

    let path = std::env::temp_dir().join(format!("linac-tuneup-session-{}.xml", std::process::id()));
    main_loop.to_path(&path)?;

    let mut restored = fast_config().main_loop()?;
    restored.update_from_path(&path)?;
    std::fs::remove_file(&path)?;

    assert_eq!(restored.policy, main_loop.policy);
    assert_eq!(restored.controllers.len(), 14);
    for (a, b) in main_loop.controllers.iter().zip(&restored.controllers) {
        let (a, b) = (&a.cavity, &b.cavity);
        assert_eq!(a.alias, b.alias);
        assert_eq!(a.new_amp, b.new_amp, "{}", a.alias);
        assert_eq!(a.new_phase, b.new_phase, "{}", a.alias);
        assert_eq!(a.ekin_in, b.ekin_in, "{}", a.alias);
        assert_eq!(a.ekin_out, b.ekin_out, "{}", a.alias);
        assert_eq!(a.avg_fit_err, b.avg_fit_err, "{}", a.alias);
    }
    for (a, b) in main_loop.controllers.iter().zip(&restored.controllers).take(4) {
        let (ScanKind::Mebt(a), ScanKind::Mebt(b)) = (&a.kind, &b.kind) else {
            panic!("the MEBT cavities are bunchers")
        };
        assert_eq!(a.sine_scans, b.sine_scans);
        assert_eq!(a.analysis, b.analysis);
    }
    for (a, b) in main_loop.bpms.iter().zip(&restored.bpms) {
        assert_eq!(a.is_on(), b.is_on(), "{}", a.alias());
    }
    Ok(())
}

#[test]
fn template_round_trip() -> anyhow::Result<()> {
    let config = fast_config();
    let path = std::env::temp_dir().join(format!("linac-tuneup-config-{}.toml", std::process::id()));
    config.to_path(&path)?;
    let restored = TuneUpConfig::from_path(&path)?;
    std::fs::remove_file(&path)?;
    assert_eq!(restored, config);
    restored.validate()?;
    Ok(())
}
