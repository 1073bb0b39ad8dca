
// Simulated bench. Every driver shares one `SimLab`, which holds a two-state device model,
// per-instrument open/close counters, an operation log, and injectable faults.

use std::collections::HashMap;
use std::io::{self, Error, ErrorKind};
use std::sync::Arc;

use parking_lot::Mutex;

use crate::assignment::{ResistanceAssignment, SwitchAssignment, TerminalRole};
use crate::sample::Polarity;
use crate::sequencer::CancelFlag;
use super::*;

pub const SWITCH: &str = "sim-switch";
pub const SOURCE: &str = "sim-source";
pub const MULTIMETER: &str = "sim-dmm";
pub const BALANCE: &str = "sim-balance";
pub const SCOPE: &str = "sim-scope";
pub const THERMAL: &str = "sim-tec";

// Pulses below this magnitude (A) leave the device alone
const SWITCHING_CURRENT: f64 = 1e-3;
const CONTACT_RESISTANCE: f64 = 10.0;
const AMBIENT: f64 = 21.0;
const TRACE_LEN: usize = 10;

#[derive(Debug, Clone)]
pub enum Fault {
	// connect() fails with ConnectionRefused
	RefuseConnect(&'static str),
	// The nth call (1-based) of `operation` on `instrument` fails with InvalidData
	FailCall{ instrument:&'static str, operation:&'static str, nth:usize },
	// The nth source reading reports zero current
	ZeroCurrentOnRead(usize),
	// The flag is raised while the nth source reading is taken
	CancelOnRead(usize, CancelFlag),
}

/// Resistances of the simulated sample in each state.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct DeviceModel {
	pub r_xx: [f64; 2],
	pub r_xy: [f64; 2],
	// Added to r_xx for every reading taken, in ohms
	pub drift: f64,
}

impl Default for DeviceModel {
	fn default() -> Self {
		Self{ r_xx: [102.5, 100.0], r_xy: [1.5, -1.5], drift: 1e-3 }
	}
}

#[derive(Default)]
struct Counter {
	opens: usize,
	closes: usize,
}

#[derive(Clone)]
struct Sweep {
	currents: Vec<f64>,
	delay: f64,
	repeats: usize,
	armed: bool,
	triggered: bool,
}

struct LabState {
	model: DeviceModel,
	state: Polarity,
	set_path: Option<SwitchAssignment>,
	route: Option<SwitchAssignment>,
	connected: HashMap<&'static str, Port>,
	counters: HashMap<&'static str, Counter>,
	calls: HashMap<(&'static str, &'static str), usize>,
	log: Vec<String>,
	faults: Vec<Fault>,
	reads: usize,
	probe: Option<(Wiring, f64)>,
	pulse: Option<(PulseKind, f64, f64)>,
	pulse_armed: bool,
	sweep: Option<Sweep>,
	resistances: Option<ResistanceAssignment>,
	scope_armed: bool,
	tec_target: Option<f64>,
	tec_enabled: bool,
	tec_polls: usize,
	tec_settle_polls: usize,
}

impl LabState {

	// Bookkeeping shared by every simulated operation
	fn call(&mut self, name:&'static str, op:&'static str) -> io::Result<()> {
		if !self.connected.contains_key(name) {
			return Err(Error::new(ErrorKind::NotConnected, format!("{} is not connected", name)));
		}

		let n = { let c = self.calls.entry((name, op)).or_insert(0); *c += 1; *c };
		self.log.push(format!("{}:{}", name, op));

		let failed = self.faults.iter().any(|f| match f {
			Fault::FailCall{ instrument, operation, nth } => *instrument == name && *operation == op && *nth == n,
			_ => false,
		});
		if failed {
			return Err(Error::new(ErrorKind::InvalidData, format!("{} rejected {} (simulated)", name, op)));
		}
		Ok(())
	}

	fn r_xx(&self) -> f64 {
		self.model.r_xx[self.state.index()] + self.model.drift * self.reads as f64
	}

	fn r_xy(&self) -> f64 {
		self.model.r_xy[self.state.index()]
	}

	// A large enough excitation along a current path sets the device state
	fn excite(&mut self, current:f64) {
		if current.abs() < SWITCHING_CURRENT {
			return;
		}
		let route = match &self.route {
			Some(r) => r.clone(),
			None => return,
		};
		let set_path = self.set_path.get_or_insert_with(|| route.clone());
		let same = route.get(TerminalRole::CurrentHigh) == set_path.get(TerminalRole::CurrentHigh)
			&& route.get(TerminalRole::CurrentLow) == set_path.get(TerminalRole::CurrentLow);
		self.state = if same { Polarity::Pos } else { Polarity::Neg };
	}

}

/// Shared handle to the simulated lab.
#[derive(Clone)]
pub struct SimLab {
	state: Arc<Mutex<LabState>>,
}

impl Default for SimLab {
	fn default() -> Self { Self::new() }
}

impl SimLab {

	pub fn new() -> Self {
		Self::with_model(DeviceModel::default())
	}

	pub fn with_model(model:DeviceModel) -> Self {
		let state = LabState {
			model,
			state: Polarity::Neg,
			set_path: None,
			route: None,
			connected: HashMap::new(),
			counters: HashMap::new(),
			calls: HashMap::new(),
			log: vec![],
			faults: vec![],
			reads: 0,
			probe: None,
			pulse: None,
			pulse_armed: false,
			sweep: None,
			resistances: None,
			scope_armed: false,
			tec_target: None,
			tec_enabled: false,
			tec_polls: 0,
			tec_settle_polls: 2,
		};
		Self{ state: Arc::new(Mutex::new(state)) }
	}

	pub fn inject(&self, fault:Fault) -> &Self {
		self.state.lock().faults.push(fault);
		self
	}

	/// Pulses routed like `path` put the device in the POS state, any other path in NEG.
	/// Without one, the first pulsed path is taken as the POS path.
	pub fn set_path(&self, path:SwitchAssignment) -> &Self {
		self.state.lock().set_path = Some(path);
		self
	}

	pub fn thermal_settle_polls(&self, polls:usize) -> &Self {
		self.state.lock().tec_settle_polls = polls;
		self
	}

	// Every simulated driver, unopened
	pub fn bench(&self) -> Bench {
		Bench::new(Box::new(SimSwitch(self.clone())), Box::new(SimSource(self.clone())))
			.with_multimeter(Box::new(SimMultimeter(self.clone())))
			.with_balance(Box::new(SimBalance(self.clone())))
			.with_scope(Box::new(SimScope(self.clone())))
			.with_thermal(Box::new(SimThermal(self.clone())))
	}

	pub fn opens(&self, name:&str) -> usize {
		self.state.lock().counters.get(name).map(|c| c.opens).unwrap_or(0)
	}

	pub fn closes(&self, name:&str) -> usize {
		self.state.lock().counters.get(name).map(|c| c.closes).unwrap_or(0)
	}

	pub fn total_opens(&self) -> usize {
		self.state.lock().counters.values().map(|c| c.opens).sum()
	}

	pub fn total_closes(&self) -> usize {
		self.state.lock().counters.values().map(|c| c.closes).sum()
	}

	pub fn connected(&self) -> Vec<&'static str> {
		let mut names:Vec<&'static str> = self.state.lock().connected.keys().copied().collect();
		names.sort();
		names
	}

	/// `instrument:operation` for every call made, in order.
	pub fn log(&self) -> Vec<String> {
		self.state.lock().log.clone()
	}

	pub fn reads(&self) -> usize { self.state.lock().reads }
	pub fn device_state(&self) -> Polarity { self.state.lock().state }
	pub fn route(&self) -> Option<SwitchAssignment> { self.state.lock().route.clone() }
	pub fn resistances(&self) -> Option<ResistanceAssignment> { self.state.lock().resistances.clone() }
	pub fn probe_enabled(&self) -> bool { self.state.lock().probe.is_some() }

	fn connect(&self, name:&'static str, port:&Port) -> io::Result<()> {
		let mut s = self.state.lock();
		let refused = s.faults.iter().any(|f| matches!(f, Fault::RefuseConnect(n) if *n == name));
		if refused {
			return Err(Error::new(ErrorKind::ConnectionRefused, format!("{} did not answer on {}", name, port)));
		}
		s.connected.insert(name, port.clone());
		s.counters.entry(name).or_default().opens += 1;
		s.log.push(format!("{}:connect", name));
		Ok(())
	}

	fn close(&self, name:&'static str) -> io::Result<()> {
		let mut s = self.state.lock();
		s.connected.remove(name);
		s.counters.entry(name).or_default().closes += 1;
		s.log.push(format!("{}:close", name));
		if name == SOURCE {
			s.probe = None;
		}
		Ok(())
	}

	fn with<T, F: FnOnce(&mut LabState) -> io::Result<T>>(&self, name:&'static str, op:&'static str, f:F) -> io::Result<T> {
		let mut s = self.state.lock();
		s.call(name, op)?;
		f(&mut s)
	}

}

macro_rules! sim_instrument {
	($ty:ident, $name:expr) => {
		pub struct $ty(SimLab);

		impl Instrument for $ty {
			fn name(&self) -> &str { $name }
			fn connect(&mut self, port:&Port) -> io::Result<()> { self.0.connect($name, port) }
			fn close(&mut self) -> io::Result<()> { self.0.close($name) }
		}
	};
}

sim_instrument!(SimSwitch, SWITCH);
sim_instrument!(SimSource, SOURCE);
sim_instrument!(SimMultimeter, MULTIMETER);
sim_instrument!(SimBalance, BALANCE);
sim_instrument!(SimScope, SCOPE);
sim_instrument!(SimThermal, THERMAL);

impl SwitchMatrix for SimSwitch {
	fn switch(&mut self, assignment:&SwitchAssignment) -> io::Result<()> {
		self.0.with(SWITCH, "switch", |s| { s.route = Some(assignment.clone()); Ok(()) })
	}
}

impl BalanceBox for SimBalance {
	fn enable_all(&mut self) -> io::Result<()> {
		self.0.with(BALANCE, "enable_all", |_| Ok(()))
	}

	fn set_resistances(&mut self, resistances:&ResistanceAssignment) -> io::Result<()> {
		self.0.with(BALANCE, "set_resistances", |s| { s.resistances = Some(resistances.clone()); Ok(()) })
	}

	fn reset_resistances(&mut self) -> io::Result<()> {
		self.0.with(BALANCE, "reset_resistances", |s| { s.resistances = None; Ok(()) })
	}
}

impl SourceMeter for SimSource {
	fn prepare_pulse(&mut self, kind:PulseKind, magnitude:f64, width:f64) -> io::Result<()> {
		self.0.with(SOURCE, "prepare_pulse", |s| {
			s.pulse = Some((kind, magnitude, width));
			s.pulse_armed = false;
			Ok(())
		})
	}

	fn arm_pulse(&mut self) -> io::Result<()> {
		self.0.with(SOURCE, "arm_pulse", |s| match s.pulse {
			Some(_) => { s.pulse_armed = true; Ok(()) },
			None => Err(err("no pulse prepared")),
		})
	}

	fn fire_pulse(&mut self) -> io::Result<()> {
		self.0.with(SOURCE, "fire_pulse", |s| {
			let (kind, magnitude, _) = match (s.pulse, s.pulse_armed) {
				(Some(p), true) => p,
				_ => return Err(err("pulse fired before it was armed")),
			};
			s.pulse_armed = false;
			// A voltage pulse drives current through the two-wire path
			let current = match kind {
				PulseKind::Current => magnitude,
				PulseKind::Voltage => magnitude / (s.r_xx() + 2.0*CONTACT_RESISTANCE),
			};
			s.excite(current);
			Ok(())
		})
	}

	fn enable_probe(&mut self, wiring:Wiring, current:f64) -> io::Result<()> {
		self.0.with(SOURCE, "enable_probe", |s| { s.probe = Some((wiring, current)); Ok(()) })
	}

	fn trigger(&mut self) -> io::Result<()> {
		self.0.with(SOURCE, "trigger", |s| {
			if let Some(sweep) = s.sweep.as_mut() {
				if sweep.armed {
					sweep.triggered = true;
				}
			}
			Ok(())
		})
	}

	fn fetch(&mut self) -> io::Result<(f64, f64)> {
		self.0.with(SOURCE, "fetch", |s| {
			let (wiring, current) = s.probe.ok_or_else(|| err("probe current is off"))?;
			s.reads += 1;
			let n = s.reads;

			let resistance = match wiring {
				Wiring::TwoWire => s.r_xx() + 2.0*CONTACT_RESISTANCE,
				Wiring::FourWire => s.r_xx(),
			};
			let mut reading = (current * resistance, current);

			for fault in s.faults.iter() {
				match fault {
					Fault::ZeroCurrentOnRead(k) if *k == n => reading.1 = 0.0,
					Fault::CancelOnRead(k, flag) if *k == n => flag.cancel(),
					_ => {},
				}
			}
			Ok(reading)
		})
	}

	fn disable_probe(&mut self) -> io::Result<()> {
		self.0.with(SOURCE, "disable_probe", |s| { s.probe = None; Ok(()) })
	}

	fn configure_sweep(&mut self, currents:&[f64], delay:f64, repeats:usize, _width:f64) -> io::Result<()> {
		self.0.with(SOURCE, "configure_sweep", |s| {
			if currents.is_empty() {
				return Err(Error::new(ErrorKind::InvalidInput, "empty sweep"));
			}
			s.sweep = Some(Sweep{ currents: currents.to_vec(), delay, repeats: repeats.max(1), armed: false, triggered: false });
			Ok(())
		})
	}

	fn arm_sweep(&mut self) -> io::Result<()> {
		self.0.with(SOURCE, "arm_sweep", |s| match s.sweep.as_mut() {
			Some(sweep) => { sweep.armed = true; sweep.triggered = false; Ok(()) },
			None => Err(err("no sweep configured")),
		})
	}

	fn sweep_trace(&mut self) -> io::Result<Vec<(f64, f64)>> {
		self.0.with(SOURCE, "sweep_trace", |s| {
			let sweep = match s.sweep.take() {
				Some(sw) if sw.triggered => sw,
				other => { s.sweep = other; return Err(err("sweep was not triggered")); },
			};

			let mut trace = Vec::with_capacity(sweep.currents.len() * sweep.repeats);
			let mut idx = 0;
			for _ in 0..sweep.repeats {
				for current in sweep.currents.iter() {
					s.excite(*current);
					s.reads += 1;
					trace.push((current * s.r_xx(), idx as f64 * sweep.delay));
					idx += 1;
				}
			}
			s.sweep = Some(Sweep{ triggered: false, ..sweep });
			Ok(trace)
		})
	}
}

impl Multimeter for SimMultimeter {
	fn prepare_single(&mut self) -> io::Result<()> {
		self.0.with(MULTIMETER, "prepare_single", |_| Ok(()))
	}

	fn trigger(&mut self) -> io::Result<()> {
		self.0.with(MULTIMETER, "trigger", |_| Ok(()))
	}

	fn fetch(&mut self) -> io::Result<f64> {
		self.0.with(MULTIMETER, "fetch", |s| {
			let current = s.probe.map(|(_, i)| i).unwrap_or(0.0);
			Ok(current * s.r_xy())
		})
	}
}

impl Oscilloscope for SimScope {
	fn prepare_for_pulse(&mut self, _magnitude:f64, _reference_resistance:f64, _width:f64) -> io::Result<()> {
		self.0.with(SCOPE, "prepare_for_pulse", |_| Ok(()))
	}

	fn single_trigger(&mut self) -> io::Result<()> {
		self.0.with(SCOPE, "single_trigger", |s| { s.scope_armed = true; Ok(()) })
	}

	fn fetch_trace(&mut self) -> io::Result<Vec<f64>> {
		self.0.with(SCOPE, "fetch_trace", |s| {
			if !s.scope_armed {
				return Err(err("scope was not armed"));
			}
			s.scope_armed = false;
			let level = match s.pulse {
				Some((PulseKind::Voltage, v, _)) => v * 0.25,
				_ => 0.0,
			};
			Ok((0..TRACE_LEN).map(|i| if (2..6).contains(&i) { level } else { 0.0 }).collect())
		})
	}

	fn time_increment(&mut self) -> io::Result<f64> {
		self.0.with(SCOPE, "time_increment", |_| Ok(1e-5))
	}
}

impl TemperatureController for SimThermal {
	fn set_target(&mut self, celsius:f64) -> io::Result<()> {
		self.0.with(THERMAL, "set_target", |s| { s.tec_target = Some(celsius); Ok(()) })
	}

	fn enable_control(&mut self) -> io::Result<()> {
		self.0.with(THERMAL, "enable_control", |s| { s.tec_enabled = true; s.tec_polls = 0; Ok(()) })
	}

	fn disable_control(&mut self) -> io::Result<()> {
		self.0.with(THERMAL, "disable_control", |s| { s.tec_enabled = false; Ok(()) })
	}

	fn is_stable(&mut self) -> io::Result<bool> {
		self.0.with(THERMAL, "is_stable", |s| {
			if !s.tec_enabled {
				return Ok(false);
			}
			s.tec_polls += 1;
			Ok(s.tec_polls >= s.tec_settle_polls)
		})
	}

	fn object_temperature(&mut self) -> io::Result<f64> {
		self.0.with(THERMAL, "object_temperature", |s| {
			Ok(match (s.tec_enabled, s.tec_target) {
				(true, Some(t)) => t + 0.01 * (s.reads % 3) as f64,
				_ => AMBIENT,
			})
		})
	}
}

#[cfg(test)]
mod tests {
	use super::*;

	fn route(text:&str) -> SwitchAssignment { text.parse().unwrap() }

	#[test]
	fn counts_opens_and_closes() {
		let lab = SimLab::new();
		let mut bench = lab.bench();
		bench.switch.connect(&Port::Com(3)).unwrap();
		bench.switch.close().unwrap();
		assert_eq!(lab.opens(SWITCH), 1);
		assert_eq!(lab.closes(SWITCH), 1);
		assert!(lab.connected().is_empty());
	}

	#[test]
	fn calls_need_a_connection() {
		let lab = SimLab::new();
		let mut bench = lab.bench();
		let e = bench.switch.switch(&route("{I+: A, I-: E}")).unwrap_err();
		assert_eq!(e.kind(), ErrorKind::NotConnected);
	}

	#[test]
	fn pulses_flip_state() {
		let lab = SimLab::new();
		let mut bench = lab.bench();
		bench.switch.connect(&Port::Com(3)).unwrap();
		bench.source.connect(&Port::Auto).unwrap();

		for (path, expected) in [("{I+: B, I-: F}", Polarity::Pos), ("{I+: D, I-: H}", Polarity::Neg), ("{I+: B, I-: F}", Polarity::Pos)] {
			bench.switch.switch(&route(path)).unwrap();
			bench.source.prepare_pulse(PulseKind::Current, 15e-3, 5e-4).unwrap();
			bench.source.arm_pulse().unwrap();
			bench.source.fire_pulse().unwrap();
			assert_eq!(lab.device_state(), expected);
		}
	}

	#[test]
	fn probe_reads_ohms_law() {
		let lab = SimLab::with_model(DeviceModel{ drift: 0.0, ..DeviceModel::default() });
		let mut bench = lab.bench();
		bench.source.connect(&Port::Auto).unwrap();
		bench.multimeter.as_mut().unwrap().connect(&Port::Com(5)).unwrap();

		bench.source.enable_probe(Wiring::FourWire, 100e-6).unwrap();
		bench.source.trigger().unwrap();
		let (v, i) = bench.source.fetch().unwrap();
		assert!((v / i - 100.0).abs() < 1e-9);
		let vxy = bench.multimeter.as_mut().unwrap().fetch().unwrap();
		assert!((vxy / i + 1.5).abs() < 1e-9);
	}

	#[test]
	fn injected_faults() {
		let lab = SimLab::new();
		let flag = CancelFlag::new();
		lab.inject(Fault::ZeroCurrentOnRead(2))
			.inject(Fault::CancelOnRead(1, flag.clone()))
			.inject(Fault::FailCall{ instrument: SOURCE, operation: "disable_probe", nth: 1 })
			.inject(Fault::RefuseConnect(SCOPE));

		let mut bench = lab.bench();
		bench.source.connect(&Port::Auto).unwrap();
		bench.source.enable_probe(Wiring::TwoWire, 1e-4).unwrap();

		assert!(bench.source.fetch().unwrap().1 != 0.0);
		assert!(flag.is_cancelled());
		assert_eq!(bench.source.fetch().unwrap().1, 0.0);
		assert_eq!(bench.source.disable_probe().unwrap_err().kind(), ErrorKind::InvalidData);
		assert!(bench.source.disable_probe().is_ok());

		let e = bench.scope.as_mut().unwrap().connect(&Port::Auto).unwrap_err();
		assert_eq!(e.kind(), ErrorKind::ConnectionRefused);
	}

	#[test]
	fn sweep_alternates_sign() {
		let lab = SimLab::with_model(DeviceModel{ drift: 0.0, ..DeviceModel::default() });
		let mut bench = lab.bench();
		bench.source.connect(&Port::Auto).unwrap();
		bench.source.configure_sweep(&[1e-4, -1e-4], 0.01, 2, 1e-3).unwrap();
		bench.source.arm_sweep().unwrap();
		assert!(bench.source.sweep_trace().is_err());
		bench.source.trigger().unwrap();

		let trace = bench.source.sweep_trace().unwrap();
		assert_eq!(trace.len(), 4);
		assert!(trace[0].0 > 0.0 && trace[1].0 < 0.0);
		assert!((trace[3].1 - 0.03).abs() < 1e-12);
	}

	#[test]
	fn thermal_settles_after_polls() {
		let lab = SimLab::new();
		lab.thermal_settle_polls(3);
		let mut bench = lab.bench();
		let tec = bench.thermal.as_mut().unwrap();
		tec.connect(&Port::Com(7)).unwrap();
		tec.set_target(30.0).unwrap();
		assert!(!tec.is_stable().unwrap());
		tec.enable_control().unwrap();
		assert!(!tec.is_stable().unwrap());
		assert!(!tec.is_stable().unwrap());
		assert!(tec.is_stable().unwrap());
		assert!((tec.object_temperature().unwrap() - 30.0).abs() < 0.1);
	}
}
