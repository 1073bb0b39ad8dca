//! # pulseprobe-sim
//!
//! Drives the measurement engine against the simulated bench, the same way the front panel
//! drives it against real instruments.
//!
//! ```bash
//! pulseprobe-sim run --settings demos/settings.json --save run1
//! pulseprobe-sim delta "{I+: A, I-: E, V1+: B, V1-: D}" --rounds 20
//! pulseprobe-sim survey --save chip3
//! pulseprobe-sim inspect run1.cbor
//! ```

use std::cell::Cell;
use std::path::PathBuf;
use std::rc::Rc;
use std::time::Duration;

use clap::{Parser, Subcommand};
use log::{error, info, warn};

use pulseprobe::instruments::sim::SimLab;
use pulseprobe::instruments::{OpenPlan, Role};
use pulseprobe::protocol::DeltaSettings;
use pulseprobe::settings::Timing;
use pulseprobe::{store, survey};
use pulseprobe::{validate, CancelFlag, Error, Polarity, Protocol, RawSettings, Reading, RunController, RunData, Settings, SwitchAssignment};

/// Pulse switching measurements on a simulated bench
#[derive(Parser)]
#[command(name = "pulseprobe-sim")]
#[command(author, version, about, long_about = None)]
struct Cli {
	/// Verbosity level (-v for debug, -vv for trace)
	#[arg(short, long, action = clap::ArgAction::Count)]
	verbose: u8,

	/// Settings file (JSON); a two-instrument bench on COM3/COM5 when omitted
	#[arg(short, long, global = true)]
	settings: Option<PathBuf>,

	/// Use the settle times from the settings instead of running flat out
	#[arg(long, global = true)]
	real_timing: bool,

	#[command(subcommand)]
	command: Commands,
}

#[derive(Subcommand)]
enum Commands {
	/// Pulse-and-probe switching run
	Run {
		/// Save the run under this name when it ends
		#[arg(long)]
		save: Option<String>,

		/// Backup file rewritten while the run is in progress
		#[arg(long)]
		backup: Option<PathBuf>,

		/// Look-back window of the live summary, in seconds
		#[arg(short, long, default_value = "5")]
		window: f64,

		/// Request a stop once this many switching samples have arrived
		#[arg(long)]
		stop_after: Option<usize>,
	},

	/// Continuous delta measurement on one path
	Delta {
		/// Probe path, e.g. "{I+: A, I-: E, V1+: B, V1-: D}"
		path: String,

		/// Probe current in uA
		#[arg(short, long, default_value = "100")]
		current: f64,

		/// Number of +I/-I sweeps; runs until interrupted when omitted
		#[arg(short, long)]
		rounds: Option<usize>,

		#[arg(long)]
		save: Option<String>,
	},

	/// Two-wire and four-wire resistance survey
	Survey {
		#[arg(long)]
		save: Option<String>,
	},

	/// Print a saved run as JSON
	Inspect {
		#[arg(value_name = "FILE")]
		file: PathBuf,
	},
}

fn load_settings(cli:&Cli) -> pulseprobe::Result<RawSettings> {
	let mut raw = match &cli.settings {
		Some(path) => RawSettings::load(path)?,
		None => RawSettings{ sb_port: "3".into(), dmm_port: "5".into(), ..RawSettings::default() },
	};
	if !cli.real_timing {
		raw.timing = Timing::none();
	}
	Ok(raw)
}

fn summarize(data:&RunData, window:f64) {
	for polarity in [Polarity::Pos, Polarity::Neg] {
		let (_, resistances) = match data.switching.latest() {
			Some(now) => data.switching.series(polarity, now, window),
			None => return,
		};
		if resistances.is_empty() {
			continue;
		}
		let mean = resistances.iter().sum::<f64>() / resistances.len() as f64;
		match data.switching.trend(polarity) {
			Some(fit) => info!("{}: {} points, mean {:.4} Ohm, drift {:.3e} Ohm/s", polarity, resistances.len(), mean, fit.slope),
			None => info!("{}: {} points, mean {:.4} Ohm", polarity, resistances.len(), mean),
		}
	}
}

fn run(cli:&Cli, save:Option<&str>, backup:Option<PathBuf>, window:f64, stop_after:Option<usize>) -> pulseprobe::Result<()> {
	let raw = load_settings(cli)?;
	let lab = SimLab::new();
	let mut ctl = RunController::new();
	ctl.set_autosave(backup);

	let count = Rc::new(Cell::new(0usize));
	{
		let count = count.clone();
		ctl.on_sample(move |r| if let Reading::Switching(_) = r { count.set(count.get() + 1) });
	}
	ctl.on_finished(|r| info!("Run ended: {:?}", r.reason));

	ctl.start(&raw, lab.bench())?;
	while ctl.is_running() {
		if ctl.poll_timeout(Duration::from_millis(250)) > 0 {
			if let Some(data) = ctl.data() {
				summarize(data, window);
			}
		}
		if stop_after.map_or(false, |n| count.get() >= n) {
			ctl.stop();
		}
	}

	let finished = match ctl.take_finished() {
		Some(f) => f,
		None => return Ok(()),
	};
	summarize(&finished.data, f64::INFINITY);
	finished.save(save)?;
	// The sequencer has logged the failure already
	if finished.result.error().is_some() {
		std::process::exit(2);
	}
	Ok(())
}

fn delta(cli:&Cli, path:&str, current:f64, rounds:Option<usize>, save:Option<&str>) -> pulseprobe::Result<()> {
	let settings:Settings = validate(&load_settings(cli)?)?;
	let path:SwitchAssignment = path.parse::<SwitchAssignment>()
		.map_err(|e| Error::Configuration(vec![pulseprobe::ConfigIssue::new("path", e.to_string())]))?;

	let lab = SimLab::new();
	let plan = OpenPlan{ steps: vec![
		(Role::SwitchMatrix, settings.ports.switch.clone()),
		(Role::Source, settings.ports.source.clone()),
	]};
	let session = lab.bench().open(&plan)?;

	let delta = DeltaSettings{ current: current * 1e-6, delay: 1e-3, repeats: 1, width: 1e-4, rounds };
	let protocol = Protocol::delta(path, &delta, settings.timing);

	let mut ctl = RunController::new();
	ctl.launch(settings, protocol, session)?;
	let finished = match ctl.wait() {
		Some(f) => f,
		None => return Ok(()),
	};
	summarize(&finished.data, f64::INFINITY);
	finished.save(save)?;
	Ok(())
}

fn run_survey(cli:&Cli, save:Option<&str>) -> pulseprobe::Result<()> {
	let settings = validate(&load_settings(cli)?)?;
	let mut steps = vec![(Role::SwitchMatrix, settings.ports.switch.clone())];
	if let Some(port) = &settings.ports.balance {
		steps.push((Role::BalanceBox, port.clone()));
	}
	steps.push((Role::Source, settings.ports.source.clone()));

	let lab = SimLab::new();
	let mut session = lab.bench().open(&OpenPlan{ steps })?;
	let (result, failure) = survey::run(&mut session, &settings.recipe, settings.probe_current, &settings.timing, &CancelFlag::new());
	session.close();

	if !result.complete {
		warn!("Survey incomplete");
	}
	// Whatever was measured is saved, even when the survey failed part way
	store::save_survey(save, &result)?;
	match failure {
		Some(e) => Err(e),
		None => Ok(()),
	}
}

fn inspect(file:&PathBuf) -> pulseprobe::Result<()> {
	let run = store::read(file)?;
	let text = serde_json::to_string_pretty(&run).map_err(|e| Error::Io(e.into()))?;
	println!("{}", text);
	Ok(())
}

fn main() {
	let cli = Cli::parse();

	let log_level = match cli.verbose {
		0 => "info",
		1 => "debug",
		_ => "trace",
	};
	env_logger::Builder::from_env(env_logger::Env::default().default_filter_or(log_level)).init();

	let outcome = match &cli.command {
		Commands::Run{ save, backup, window, stop_after } => run(&cli, save.as_deref(), backup.clone(), *window, *stop_after),
		Commands::Delta{ path, current, rounds, save } => delta(&cli, path, *current, *rounds, save.as_deref()),
		Commands::Survey{ save } => run_survey(&cli, save.as_deref()),
		Commands::Inspect{ file } => inspect(file),
	};

	if let Err(e) = outcome {
		error!("{}", e);
		std::process::exit(1);
	}
}
