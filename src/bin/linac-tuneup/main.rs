use std::path::PathBuf;

use anyhow::Context;
use clap::{Parser, Subcommand, ValueEnum};
use interface::{filing::Filing, print_info};
use linac_tuneup::{
    config::TuneUpConfig,
    live::CavityError,
    main_loop::{CommitPolicy, MainLoop},
    progress::ScanProgress,
};

/// Warm linac RF cavities phase and amplitude tune-up
#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// TOML configuration, the default warm linac if not given
    #[arg(short, long)]
    config: Option<PathBuf>,
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Prints the default configuration
    Template,
    /// Tunes up the cavities of a simulated machine
    Simulate(SimulateArgs),
    /// Prints the cavity table of a saved session
    Show {
        /// XML session document
        path: PathBuf,
    },
}

#[derive(clap::Args, Debug)]
struct SimulateArgs {
    /// First cavity of the run
    #[arg(short, long)]
    first: Option<String>,
    /// Last cavity of the run, the last cavity of the linac if not given
    #[arg(short, long)]
    last: Option<String>,
    /// What is written to the cavities after their set-up
    #[arg(short, long, value_enum)]
    policy: Option<Policy>,
    /// Random generator seed of the measurement noise
    #[arg(long)]
    seed: Option<u64>,
    /// rms BPM phase noise (degree)
    #[arg(long)]
    phase_noise: Option<f64>,
    /// Live to model phase offset of a cavity, as ALIAS=DEGREE
    #[arg(long, value_parser = alias_value)]
    phase_offset: Vec<(String, f64)>,
    /// Model to live amplitude ratio of a cavity, as ALIAS=COEFFICIENT
    #[arg(long, value_parser = alias_value)]
    amp_coeff: Vec<(String, f64)>,
    /// Wait time after every cavity change (s)
    #[arg(long, default_value_t = 0.)]
    sleep: f64,
    /// Upper bound of the fit times (s)
    #[arg(long)]
    fit_time: Option<f64>,
    /// Saves the session to this XML document
    #[arg(short, long)]
    save: Option<PathBuf>,
}

#[derive(ValueEnum, Clone, Copy, Debug)]
enum Policy {
    NewSettings,
    KeepAmps,
    KeepAll,
}
impl From<Policy> for CommitPolicy {
    fn from(policy: Policy) -> Self {
        match policy {
            Policy::NewSettings => CommitPolicy::NewSettings,
            Policy::KeepAmps => CommitPolicy::KeepAmps,
            Policy::KeepAll => CommitPolicy::KeepAll,
        }
    }
}

fn alias_value(s: &str) -> Result<(String, f64), String> {
    let (alias, value) = s
        .split_once('=')
        .ok_or_else(|| format!("expected ALIAS=VALUE, found {s}"))?;
    let value = value
        .trim()
        .parse::<f64>()
        .map_err(|e| format!("{value}: {e}"))?;
    Ok((alias.trim().to_string(), value))
}

fn error_entry<'a>(config: &'a mut TuneUpConfig, alias: &str) -> &'a mut CavityError {
    let errors = &mut config.simulation.cavities;
    match errors.iter().position(|e| e.alias == alias) {
        Some(k) => &mut errors[k],
        None => {
            errors.push(CavityError {
                alias: alias.to_string(),
                ..Default::default()
            });
            let n = errors.len();
            &mut errors[n - 1]
        }
    }
}

fn cavity_index(main_loop: &MainLoop, alias: &str) -> anyhow::Result<usize> {
    main_loop
        .index_of(alias)
        .with_context(|| format!("unknown cavity {alias}"))
}

fn print_table(main_loop: &MainLoop) {
    println!(
        "{:<8} {:>10} {:>9} {:>10} {:>9} {:>10} {:>10} {:>8}",
        "cavity", "init amp", "init phs", "new amp", "new phs", "Ekin in", "Ekin out", "fit err"
    );
    let opt = |x: Option<f64>, precision: usize| {
        x.map_or_else(|| "-".to_string(), |x| format!("{x:.precision$}"))
    };
    for c in &main_loop.controllers {
        let cav = &c.cavity;
        println!(
            "{:<8} {:>10.5} {:>9.2} {:>10} {:>9} {:>10.4} {:>10.4} {:>8.3}",
            cav.alias,
            cav.init_amp,
            cav.init_phase,
            opt(cav.new_amp, 5),
            opt(cav.new_phase, 2),
            cav.ekin_in,
            cav.ekin_out,
            cav.avg_fit_err
        );
    }
}

fn simulate(mut config: TuneUpConfig, args: SimulateArgs) -> anyhow::Result<()> {
    if let Some(seed) = args.seed {
        config.simulation.seed = seed;
    }
    if let Some(noise) = args.phase_noise {
        config.simulation.phase_noise = noise;
    }
    for (alias, offset) in args.phase_offset {
        error_entry(&mut config, &alias).phase_offset = offset;
    }
    for (alias, coeff) in args.amp_coeff {
        error_entry(&mut config, &alias).amp_coeff = coeff;
    }
    config.set_sleep_times(args.sleep);
    if let Some(seconds) = args.fit_time {
        config.cap_fit_times(seconds);
    }
    config.validate()?;

    let cs = config.simulated_machine()?;
    let mut main_loop = config.main_loop()?;
    if let Some(policy) = args.policy {
        main_loop = main_loop.with_policy(policy.into());
    }
    let first = match &args.first {
        Some(alias) => cavity_index(&main_loop, alias)?,
        None => 0,
    };
    let last = match &args.last {
        Some(alias) => cavity_index(&main_loop, alias)?,
        None => main_loop.controllers.len().saturating_sub(1),
    };
    main_loop.connect_all_pvs(&cs)?;
    main_loop.init_all(&cs, None)?;
    log::info!(
        "tuning up {} cavities with the {:?} policy",
        (first..=last).count(),
        main_loop.policy
    );

    let progress = ScanProgress::new("Tune-up");
    let outcome = main_loop.run(&cs, first, last, &progress)?;
    progress.finish();
    match &outcome.failure {
        Some(e) => print_info(&outcome.message, Some(e as &dyn std::error::Error)),
        None => print_info(&outcome.message, None),
    }
    for report in &outcome.reports {
        log::info!(
            "{}: amp={:.5} phase={:.2} Ekin {:.4} -> {:.4} MeV ({})",
            report.cavity,
            report.new_amp,
            report.new_phase,
            report.ekin_in,
            report.ekin_out,
            report.message
        );
    }
    print_table(&main_loop);
    println!("{}", main_loop.time_text());

    if let Some(path) = args.save {
        main_loop.to_path(&path)?;
    }
    anyhow::ensure!(outcome.failure.is_none(), "{}", outcome.message);
    Ok(())
}

fn main() -> anyhow::Result<()> {
    env_logger::builder()
        .format_timestamp(None)
        .format_target(false)
        .init();

    let args = Args::parse();
    let config = match &args.config {
        Some(path) => TuneUpConfig::from_path(path)?,
        None => TuneUpConfig::default(),
    };

    match args.command {
        Command::Template => print!("{}", config.to_toml()?),
        Command::Simulate(sim) => simulate(config, sim)?,
        Command::Show { path } => {
            let mut main_loop = config.main_loop()?;
            main_loop
                .update_from_path(&path)
                .with_context(|| format!("cannot load the session {}", path.display()))?;
            println!("commit policy: {:?}", main_loop.policy);
            print_table(&main_loop);
        }
    }

    Ok(())
}
