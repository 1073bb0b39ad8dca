//! Measurement protocols: the step lists the sequencer walks through.

use crate::assignment::{ResistanceAssignment, SwitchAssignment};
use crate::instruments::{PulseKind, Wiring};
use crate::sample::Polarity;
use crate::settings::{Settings, Timing, REFERENCE_RESISTANCE};

/// Routing for a `Switch` step. A polarized route picks its path from the half of the
/// loop being run.
#[derive(Debug, Clone, PartialEq)]
pub enum Route {
	Fixed(SwitchAssignment),
	Polarized{ pos:SwitchAssignment, neg:SwitchAssignment },
}

impl Route {
	pub fn resolve(&self, polarity:Polarity) -> &SwitchAssignment {
		match self {
			Route::Fixed(a) => a,
			Route::Polarized{ pos, .. } if polarity == Polarity::Pos => pos,
			Route::Polarized{ neg, .. } => neg,
		}
	}
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Pulse {
	pub kind: PulseKind,
	pub magnitude: f64,
	pub width: f64,
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Probe {
	pub count: usize,
	pub wiring: Wiring,
	pub current: f64,
	// Read the Hall voltage on the multimeter in lockstep
	pub secondary: bool,
	// Read the object temperature in lockstep
	pub temperature: bool,
}

/// A custom current sweep on the source. Each trace point becomes one sample.
#[derive(Debug, Clone, PartialEq)]
pub struct Sweep {
	pub currents: Vec<f64>,
	pub delay: f64,
	pub repeats: usize,
	pub width: f64,
	// Overrides the protocol's channel tag for the samples of this sweep
	pub tag: Option<String>,
}

#[derive(Debug, Clone, PartialEq)]
pub enum Step {
	Switch(Route),
	Pulse(Pulse),
	Probe(Probe),
	// `count: None` repeats until the run is stopped
	Loop{ count:Option<usize>, alternate:bool, body:Vec<Step> },
	Sweep(Sweep),
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ScopeSetup {
	pub magnitude: f64,
	pub width: f64,
	pub reference_resistance: f64,
}

/// Instrument preparation done once per run, before the first step.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct Preparation {
	pub resistances: Option<ResistanceAssignment>,
	pub scope: Option<ScopeSetup>,
	pub temperature: Option<f64>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct Protocol {
	pub steps: Vec<Step>,
	pub channel_tag: String,
	pub preparation: Preparation,
	pub timing: Timing,
}

#[derive(Debug, Clone, PartialEq)]
pub struct DeltaSettings {
	pub current: f64,
	pub delay: f64,
	pub repeats: usize,
	pub width: f64,
	// None runs until stopped
	pub rounds: Option<usize>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct PumpProbeSettings {
	pub probe_paths: Vec<SwitchAssignment>,
	pub pulse_paths: Vec<SwitchAssignment>,
	pub pulse_current: f64,
	pub probe_current: f64,
	pub delay: f64,
	pub pre_repeats: usize,
	pub post_repeats: usize,
	pub width: f64,
	pub loops: usize,
}

impl Protocol {

	pub fn new(steps:Vec<Step>, channel_tag:&str, timing:Timing) -> Self {
		Self{ steps, channel_tag: channel_tag.to_owned(), preparation: Preparation::default(), timing }
	}

	/// Pulse-and-probe switching run: every loop pulses along pulse path 1 and probes (POS),
	/// then pulses along pulse path 2 and probes (NEG).
	pub fn switching(settings:&Settings) -> Self {
		let recipe = &settings.recipe;
		let body = vec![
			Step::Switch(Route::Polarized{ pos: recipe.pulse1.clone(), neg: recipe.pulse2.clone() }),
			Step::Pulse(Pulse{ kind: settings.pulse_kind, magnitude: settings.pulse_magnitude, width: settings.pulse_width }),
			Step::Switch(Route::Fixed(recipe.measure.clone())),
			Step::Probe(Probe {
				count: settings.measurement_count,
				wiring: Wiring::FourWire,
				current: settings.probe_current,
				secondary: true,
				temperature: settings.temperature.is_some(),
			}),
		];

		let mut protocol = Self::new(
			vec![Step::Loop{ count: Some(settings.loop_count), alternate: true, body }],
			"switching",
			settings.timing,
		);
		protocol.preparation = Preparation {
			resistances: if settings.balance_enabled { Some(recipe.resistance.clone()) } else { None },
			scope: if settings.scope_enabled {
				Some(ScopeSetup{ magnitude: settings.pulse_magnitude, width: settings.pulse_width, reference_resistance: REFERENCE_RESISTANCE })
			} else {
				None
			},
			temperature: settings.temperature.map(|t| t.target),
		};
		protocol
	}

	/// Continuous delta measurement: `+I, -I` sweeps along one path, repeated.
	pub fn delta(path:SwitchAssignment, delta:&DeltaSettings, timing:Timing) -> Self {
		let sweep = Sweep {
			currents: vec![delta.current, -delta.current],
			delay: delta.delay,
			repeats: delta.repeats,
			width: delta.width,
			tag: None,
		};
		Self::new(vec![
			Step::Switch(Route::Fixed(path)),
			Step::Loop{ count: delta.rounds, alternate: false, body: vec![Step::Sweep(sweep)] },
		], "delta", timing)
	}

	/// Pump-probe: a delta reference on the first probe path, then for every probe path and
	/// every pulse path, one pulse sweep followed by a delta probe.
	pub fn pump_probe(pp:&PumpProbeSettings, timing:Timing) -> Self {
		let probe_sweep = |repeats:usize, tag:String| Step::Sweep(Sweep {
			currents: vec![pp.probe_current, -pp.probe_current],
			delay: pp.delay,
			repeats,
			width: pp.width,
			tag: Some(tag),
		});

		let mut steps = vec![];
		if let Some(first) = pp.probe_paths.first() {
			steps.push(Step::Switch(Route::Fixed(first.clone())));
			steps.push(probe_sweep(pp.pre_repeats, format!("pre {}", first)));
		}

		let mut body = vec![];
		for probe in pp.probe_paths.iter() {
			for pulse in pp.pulse_paths.iter() {
				body.push(Step::Switch(Route::Fixed(pulse.clone())));
				body.push(Step::Sweep(Sweep {
					currents: vec![pp.pulse_current],
					delay: pp.delay,
					repeats: 1,
					width: pp.width,
					tag: Some(format!("pump {}", pulse)),
				}));
				body.push(Step::Switch(Route::Fixed(probe.clone())));
				body.push(probe_sweep(pp.post_repeats, format!("probe {}", probe)));
			}
		}
		if !body.is_empty() {
			steps.push(Step::Loop{ count: Some(pp.loops), alternate: false, body });
		}

		Self::new(steps, "pump-probe", timing)
	}

	/// Probe readings a finite protocol produces, or None if it runs until stopped.
	pub fn expected_samples(&self) -> Option<usize> {
		fn count(steps:&[Step]) -> Option<usize> {
			steps.iter().map(|step| match step {
				Step::Probe(p) => Some(p.count),
				Step::Sweep(s) => Some(s.currents.len() * s.repeats.max(1)),
				Step::Loop{ count: Some(n), alternate, body } => count(body).map(|c| c * n * if *alternate { 2 } else { 1 }),
				Step::Loop{ count: None, .. } => None,
				Step::Switch(_) | Step::Pulse(_) => Some(0),
			}).sum()
		}
		count(&self.steps)
	}

}
