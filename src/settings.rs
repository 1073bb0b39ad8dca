//! Run settings, as typed into the front panel and as used by the sequencer.
//!
//! [`RawSettings`] mirrors the front panel: every value is the text the user typed, in
//! front-panel units (mA or V, ms, µA). [`validate`] turns it into [`Settings`] in one
//! pass and reports every field that fails, not just the first.

use std::fs;
use std::path::Path;
use std::str::FromStr;

use log::warn;
use serde::{Deserialize, Serialize};

use crate::assignment::{list_to_string, ResistanceAssignment, SwitchAssignment, TerminalRole};
use crate::error::{ConfigIssue, Error, Result};
use crate::instruments::{OpenPlan, Port, PulseKind, Role};
use crate::sample::Polarity;
use crate::table::{Cell, Table};

pub const PULSE_CURRENT: &str = "Pulse Current";
pub const PULSE_VOLTAGE: &str = "Pulse Voltage";

// Reference resistor in series with the sample when the scope watches a voltage pulse
pub const REFERENCE_RESISTANCE: f64 = 50.036;

const CURRENT_PAIR: &[TerminalRole] = &[TerminalRole::CurrentHigh, TerminalRole::CurrentLow];
const FOUR_WIRE: &[TerminalRole] = &[
	TerminalRole::CurrentHigh, TerminalRole::CurrentLow, TerminalRole::V1High, TerminalRole::V1Low];

/// Settle delays in seconds.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Timing {
	pub switch_settle: f64,
	pub pulse_settle: f64,
	pub probe_settle: f64,
	pub survey_settle: f64,
	pub scope_arm: f64,
	pub temperature_poll: f64,
}

impl Default for Timing {
	fn default() -> Self {
		Self {
			switch_settle: 0.3,
			pulse_settle: 0.5,
			probe_settle: 0.5,
			survey_settle: 0.2,
			scope_arm: 12.0,
			temperature_poll: 1.0,
		}
	}
}

impl Timing {

	// No waiting at all, for simulated benches
	pub fn none() -> Self {
		Self{ switch_settle: 0.0, pulse_settle: 0.0, probe_settle: 0.0, survey_settle: 0.0, scope_arm: 0.0, temperature_poll: 0.0 }
	}

	fn fields(&self) -> [(&'static str, f64); 6] {
		[
			("timing.switch_settle", self.switch_settle),
			("timing.pulse_settle", self.pulse_settle),
			("timing.probe_settle", self.probe_settle),
			("timing.survey_settle", self.survey_settle),
			("timing.scope_arm", self.scope_arm),
			("timing.temperature_poll", self.temperature_poll),
		]
	}

}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RawRecipe {
	pub pulse1: String,
	pub pulse2: String,
	pub measure: String,
	pub resistance: String,
	pub two_wire: Vec<String>,
	pub four_wire: Vec<String>,
}

impl Default for RawRecipe {
	fn default() -> Self {
		Self {
			pulse1: "{I+: B, I-: F}".into(),
			pulse2: "{I+: D, I-: H}".into(),
			measure: "{I+: A, I-: E, V1+: B, V1-: D, V2+: C, V2-: G}".into(),
			resistance: "{A: 0, B: 0, C: 0, D: 0, E: 0, F: 0, G: 0, H: 0}".into(),
			two_wire: vec![
				"{I+: A, I-: E}".into(),
				"{I+: B, I-: F}".into(),
				"{I+: C, I-: G}".into(),
				"{I+: D, I-: H}".into(),
			],
			four_wire: vec![
				"{I+: A, I-: E, V1+: C, V1-: G}".into(),
				"{I+: B, I-: F, V1+: D, V1-: H}".into(),
				"{I+: C, I-: G, V1+: E, V1-: A}".into(),
				"{I+: D, I-: H, V1+: F, V1-: B}".into(),
			],
		}
	}
}

#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct RawTemperature {
	pub port: String,
	pub target: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RawSettings {
	pub pulse_type: String,
	pub sb_port: String,
	pub bb_port: String,
	pub dmm_port: String,
	pub pulse_mag: String,
	pub pulse_width: String,
	pub probe_current: String,
	pub measurement_count: String,
	pub loop_count: String,
	pub bb_enabled: bool,
	pub scope_enabled: bool,
	pub temperature: Option<RawTemperature>,
	pub assignments: RawRecipe,
	pub timing: Timing,
}

impl Default for RawSettings {
	fn default() -> Self {
		Self {
			pulse_type: PULSE_CURRENT.into(),
			sb_port: String::new(),
			bb_port: String::new(),
			dmm_port: String::new(),
			pulse_mag: "15".into(),
			pulse_width: "0.5".into(),
			probe_current: "100".into(),
			measurement_count: "5".into(),
			loop_count: "1".into(),
			bb_enabled: false,
			scope_enabled: false,
			temperature: None,
			assignments: RawRecipe::default(),
			timing: Timing::default(),
		}
	}
}

impl RawSettings {

	pub fn from_json(text:&str) -> Result<Self> {
		serde_json::from_str(text).map_err(|e| Error::Configuration(vec![ConfigIssue::new("settings", e.to_string())]))
	}

	pub fn load<P: AsRef<Path>>(path:P) -> Result<Self> {
		let text = fs::read_to_string(path.as_ref()).map_err(|e| Error::Configuration(vec![
			ConfigIssue::new("settings", format!("cannot read {}: {}", path.as_ref().display(), e))]))?;
		Self::from_json(&text)
	}

	pub fn to_json(&self) -> Result<String> {
		serde_json::to_string_pretty(self).map_err(|e| Error::Io(e.into()))
	}

}

#[derive(Debug, Clone, PartialEq)]
pub struct Recipe {
	pub pulse1: SwitchAssignment,
	pub pulse2: SwitchAssignment,
	pub measure: SwitchAssignment,
	pub resistance: ResistanceAssignment,
	pub two_wire: Vec<SwitchAssignment>,
	pub four_wire: Vec<SwitchAssignment>,
}

impl Recipe {

	// Pulse 1 sets the POS state, pulse 2 the NEG state
	pub fn pulse_path(&self, polarity:Polarity) -> &SwitchAssignment {
		match polarity {
			Polarity::Pos => &self.pulse1,
			Polarity::Neg => &self.pulse2,
		}
	}

}

#[derive(Debug, Clone, PartialEq)]
pub struct Ports {
	pub switch: Port,
	pub multimeter: Port,
	pub source: Port,
	pub balance: Option<Port>,
	pub scope: Option<Port>,
	pub thermal: Option<Port>,
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct TemperatureSettings {
	pub target: f64,
}

/// Validated, immutable run settings in SI units.
#[derive(Debug, Clone, PartialEq)]
pub struct Settings {
	pub pulse_kind: PulseKind,
	// A for current pulses, V for voltage pulses
	pub pulse_magnitude: f64,
	pub pulse_width: f64,
	pub probe_current: f64,
	pub measurement_count: usize,
	pub loop_count: usize,
	pub ports: Ports,
	pub balance_enabled: bool,
	pub scope_enabled: bool,
	pub temperature: Option<TemperatureSettings>,
	pub recipe: Recipe,
	pub timing: Timing,
}

impl Settings {

	pub fn pulse_type(&self) -> &'static str {
		match self.pulse_kind {
			PulseKind::Current => PULSE_CURRENT,
			PulseKind::Voltage => PULSE_VOLTAGE,
		}
	}

	/// Instruments this run opens, in connection order.
	pub fn open_plan(&self) -> OpenPlan {
		let mut steps = vec![(Role::SwitchMatrix, self.ports.switch.clone())];
		if let Some(port) = &self.ports.balance {
			steps.push((Role::BalanceBox, port.clone()));
		}
		if let Some(port) = &self.ports.scope {
			steps.push((Role::Oscilloscope, port.clone()));
		}
		steps.push((Role::Multimeter, self.ports.multimeter.clone()));
		steps.push((Role::Source, self.ports.source.clone()));
		if let Some(port) = &self.ports.thermal {
			steps.push((Role::Thermal, port.clone()));
		}
		OpenPlan{ steps }
	}

	/// One-row table of the flattened settings, stored next to the data.
	pub fn meta_row(&self, absolute_start_time:f64) -> Table {
		let port = |p:&Option<Port>| -> Cell { p.as_ref().map(|p| Cell::from(p.to_string())).unwrap_or(Cell::Empty) };
		Table::single_row(vec![
			("pulse_type", self.pulse_type().into()),
			("pulse_mag", self.pulse_magnitude.into()),
			("pulse_width", self.pulse_width.into()),
			("probe_current", self.probe_current.into()),
			("measurement_count", (self.measurement_count as f64).into()),
			("loop_count", (self.loop_count as f64).into()),
			("target_temp_c", self.temperature.map(|t| t.target).into()),
			("dmm_port", self.ports.multimeter.to_string().into()),
			("sb_port", self.ports.switch.to_string().into()),
			("bb_port", port(&self.ports.balance)),
			("tc_port", port(&self.ports.thermal)),
			("bb_enabled", self.balance_enabled.into()),
			("scope_enabled", self.scope_enabled.into()),
			("pulse1_assignments", self.recipe.pulse1.to_string().into()),
			("pulse2_assignments", self.recipe.pulse2.to_string().into()),
			("measure_assignments", self.recipe.measure.to_string().into()),
			("resistance_assignments", self.recipe.resistance.to_string().into()),
			("two_wire_assignments", list_to_string(&self.recipe.two_wire).into()),
			("four_wire_assignments", list_to_string(&self.recipe.four_wire).into()),
			("absolute_start_time", absolute_start_time.into()),
		])
	}

}

// Collects conversion failures so all of them can be reported together
struct Checker {
	issues: Vec<ConfigIssue>,
}

impl Checker {

	fn fail(&mut self, field:&str, msg:impl Into<String>) {
		self.issues.push(ConfigIssue::new(field, msg));
	}

	fn port(&mut self, field:&str, text:&str) -> Option<Port> {
		match text.trim().parse::<u32>() {
			Ok(n) => Some(Port::Com(n)),
			Err(_) => { self.fail(field, format!("'{}' is not an integer port", text)); None },
		}
	}

	fn float(&mut self, field:&str, text:&str, scale:f64) -> Option<f64> {
		match f64::from_str(text.trim()) {
			Ok(x) if x.is_finite() => Some(x * scale),
			_ => { self.fail(field, format!("'{}' is not a valid number", text)); None },
		}
	}

	fn count(&mut self, field:&str, text:&str) -> Option<usize> {
		match text.trim().parse::<usize>() {
			Ok(0) => { self.fail(field, "must be at least 1"); None },
			Ok(n) => Some(n),
			Err(_) => { self.fail(field, format!("'{}' is not a positive integer", text)); None },
		}
	}

	fn route(&mut self, field:&str, text:&str, roles:&[TerminalRole]) -> Option<SwitchAssignment> {
		match text.parse::<SwitchAssignment>().and_then(|a| a.require(roles).map(|_| a)) {
			Ok(a) => Some(a),
			Err(e) => { self.fail(field, e.to_string()); None },
		}
	}

	fn routes(&mut self, field:&str, texts:&[String], roles:&[TerminalRole]) -> Option<Vec<SwitchAssignment>> {
		let parsed:Vec<Option<SwitchAssignment>> = texts.iter().enumerate()
			.map(|(idx, text)| self.route(&format!("{}[{}]", field, idx), text, roles))
			.collect();
		parsed.into_iter().collect()
	}

	fn recipe(&mut self, raw:&RawRecipe) -> Option<Recipe> {
		let pulse1 = self.route("assignments.pulse1", &raw.pulse1, CURRENT_PAIR);
		let pulse2 = self.route("assignments.pulse2", &raw.pulse2, CURRENT_PAIR);
		let measure = self.route("assignments.measure", &raw.measure, FOUR_WIRE);
		let resistance = match raw.resistance.parse::<ResistanceAssignment>() {
			Ok(r) => Some(r),
			Err(e) => { self.fail("assignments.resistance", e.to_string()); None },
		};
		let two_wire = self.routes("assignments.two_wire", &raw.two_wire, CURRENT_PAIR);
		let four_wire = self.routes("assignments.four_wire", &raw.four_wire, FOUR_WIRE);

		Some(Recipe {
			pulse1: pulse1?, pulse2: pulse2?, measure: measure?, resistance: resistance?,
			two_wire: two_wire?, four_wire: four_wire?,
		})
	}

}

/// Converts front-panel settings into typed settings, or reports every failing field.
pub fn validate(raw:&RawSettings) -> Result<Settings> {
	let mut c = Checker{ issues: vec![] };

	let pulse_kind = match raw.pulse_type.trim() {
		PULSE_CURRENT => Some(PulseKind::Current),
		PULSE_VOLTAGE => Some(PulseKind::Voltage),
		other => { c.fail("pulse_type", format!("unknown pulse mode '{}'", other)); None },
	};

	let switch = c.port("sb_port", &raw.sb_port);
	let multimeter = c.port("dmm_port", &raw.dmm_port);
	let balance = if raw.bb_enabled { c.port("bb_port", &raw.bb_port).map(Some) } else { Some(None) };

	// mA for current pulses, V for voltage pulses
	let mag_scale = if pulse_kind == Some(PulseKind::Voltage) { 1.0 } else { 1e-3 };
	let pulse_magnitude = c.float("pulse_mag", &raw.pulse_mag, mag_scale);
	let pulse_width = match c.float("pulse_width", &raw.pulse_width, 1e-3) {
		Some(w) if w <= 0.0 => { c.fail("pulse_width", "must be positive"); None },
		w => w,
	};
	let probe_current = match c.float("probe_current", &raw.probe_current, 1e-6) {
		Some(i) if i == 0.0 => { c.fail("probe_current", "must be non-zero"); None },
		i => i,
	};
	let measurement_count = c.count("measurement_count", &raw.measurement_count);
	let loop_count = c.count("loop_count", &raw.loop_count);

	let (thermal, temperature) = match &raw.temperature {
		Some(t) => {
			let port = c.port("temperature.port", &t.port);
			let target = c.float("temperature.target", &t.target, 1.0);
			(port, target.map(|target| TemperatureSettings{ target }))
		},
		None => (None, None),
	};

	let recipe = c.recipe(&raw.assignments);

	for (field, value) in raw.timing.fields().iter() {
		if !(value.is_finite() && *value >= 0.0) {
			c.fail(field, "must be a non-negative number of seconds");
		}
	}

	if !c.issues.is_empty() {
		return Err(Error::Configuration(c.issues));
	}

	// Every Option below is Some once no issue was recorded
	match (pulse_kind, switch, multimeter, balance, pulse_magnitude, pulse_width, probe_current, measurement_count, loop_count, recipe) {
		(Some(pulse_kind), Some(switch), Some(multimeter), Some(balance), Some(pulse_magnitude), Some(pulse_width),
			Some(probe_current), Some(measurement_count), Some(loop_count), Some(recipe)) => {

			let scope_enabled = raw.scope_enabled && pulse_kind == PulseKind::Voltage;
			if raw.scope_enabled && !scope_enabled {
				warn!("Oscilloscope only records voltage pulses, disabling it for this run");
			}

			Ok(Settings {
				pulse_kind, pulse_magnitude, pulse_width, probe_current, measurement_count, loop_count,
				ports: Ports {
					switch, multimeter,
					source: Port::Auto,
					balance: balance.clone(),
					scope: if scope_enabled { Some(Port::Auto) } else { None },
					thermal: if temperature.is_some() { thermal } else { None },
				},
				balance_enabled: balance.is_some(),
				scope_enabled,
				temperature,
				recipe,
				timing: raw.timing,
			})
		},
		_ => Err(Error::Configuration(vec![ConfigIssue::new("settings", "incomplete settings")])),
	}
}

#[cfg(test)]
pub(crate) mod tests {
	use super::*;
	use crate::error::ErrorKind;

	pub fn bench_raw() -> RawSettings {
		RawSettings {
			sb_port: "3".into(),
			dmm_port: "5".into(),
			timing: Timing::none(),
			..RawSettings::default()
		}
	}

	fn issues(raw:&RawSettings) -> Vec<String> {
		match validate(raw) {
			Err(Error::Configuration(issues)) => issues.into_iter().map(|i| i.field).collect(),
			other => panic!("expected configuration error, got {:?}", other.map(|_| ())),
		}
	}

	#[test]
	fn converts_front_panel_units() {
		let s = validate(&bench_raw()).unwrap();
		assert_eq!(s.pulse_kind, PulseKind::Current);
		assert!((s.pulse_magnitude - 15e-3).abs() < 1e-12);
		assert!((s.pulse_width - 0.5e-3).abs() < 1e-12);
		assert!((s.probe_current - 100e-6).abs() < 1e-12);
		assert_eq!(s.measurement_count, 5);
		assert_eq!(s.ports.switch, Port::Com(3));
		assert_eq!(s.ports.balance, None);
		assert_eq!(s.recipe.pulse_path(Polarity::Neg).to_string(), "{I+: D, I-: H}");
	}

	#[test]
	fn voltage_magnitude_is_not_scaled() {
		let raw = RawSettings{ pulse_type: PULSE_VOLTAGE.into(), pulse_mag: "2.5".into(), scope_enabled: true, ..bench_raw() };
		let s = validate(&raw).unwrap();
		assert_eq!(s.pulse_magnitude, 2.5);
		assert!(s.scope_enabled);
		assert_eq!(s.ports.scope, Some(Port::Auto));
	}

	#[test]
	fn scope_is_dropped_for_current_pulses() {
		let raw = RawSettings{ scope_enabled: true, ..bench_raw() };
		let s = validate(&raw).unwrap();
		assert!(!s.scope_enabled);
		assert!(!s.open_plan().includes(Role::Oscilloscope));
	}

	#[test]
	fn reports_every_bad_field() {
		let raw = RawSettings {
			sb_port: "COM3".into(),
			pulse_mag: "fifteen".into(),
			loop_count: "0".into(),
			bb_enabled: true,
			..bench_raw()
		};
		assert_eq!(issues(&raw), vec!["sb_port", "bb_port", "pulse_mag", "loop_count"]);
	}

	#[test]
	fn balance_port_only_checked_when_enabled() {
		let raw = RawSettings{ bb_port: "not a port".into(), ..bench_raw() };
		assert!(validate(&raw).is_ok());
	}

	#[test]
	fn bad_routing_is_a_configuration_error() {
		let mut raw = bench_raw();
		raw.assignments.measure = "{I+: A, I-: E}".into();
		raw.assignments.two_wire[1] = "{I+: A, I+: B}".into();
		assert_eq!(issues(&raw), vec!["assignments.measure", "assignments.two_wire[1]"]);
	}

	#[test]
	fn zero_probe_current_rejected() {
		let raw = RawSettings{ probe_current: "0".into(), ..bench_raw() };
		let e = validate(&raw).unwrap_err();
		assert_eq!(e.kind(), ErrorKind::Configuration);
	}

	#[test]
	fn open_plan_order() {
		let raw = RawSettings {
			bb_enabled: true, bb_port: "4".into(),
			temperature: Some(RawTemperature{ port: "7".into(), target: "25".into() }),
			..bench_raw()
		};
		let s = validate(&raw).unwrap();
		let roles: Vec<Role> = s.open_plan().steps.into_iter().map(|(r, _)| r).collect();
		assert_eq!(roles, vec![Role::SwitchMatrix, Role::BalanceBox, Role::Multimeter, Role::Source, Role::Thermal]);
	}

	#[test]
	fn settings_file_round_trip() {
		let raw = bench_raw();
		let back = RawSettings::from_json(&raw.to_json().unwrap()).unwrap();
		assert_eq!(back, raw);

		// Missing keys fall back to the defaults
		let partial = RawSettings::from_json(r#"{"sb_port": "9", "dmm_port": "2"}"#).unwrap();
		assert_eq!(partial.assignments, RawRecipe::default());
		assert!(validate(&partial).is_ok());
	}

	#[test]
	fn meta_row_flattens_settings() {
		let s = validate(&bench_raw()).unwrap();
		let meta = s.meta_row(1.7e9);
		assert_eq!(meta.first("pulse_type").and_then(|c| c.as_str()), Some(PULSE_CURRENT));
		assert_eq!(meta.first("sb_port").and_then(|c| c.as_str()), Some("COM3"));
		assert_eq!(meta.first("bb_port"), Some(&Cell::Empty));
		assert_eq!(meta.first("pulse1_assignments").and_then(|c| c.as_str()), Some("{I+: B, I-: F}"));
		assert_eq!(meta.first("absolute_start_time").and_then(|c| c.as_f64()), Some(1.7e9));
	}
}
