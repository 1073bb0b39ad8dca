//! Runs a [`Protocol`] against an opened [`Session`].
//!
//! The sequencer owns the session for the duration of the run and always closes it,
//! whatever the outcome. Hardware failures and zero-current readings end the run with a
//! `Failed` result; they are never returned as `Err`. Cancellation is cooperative: the
//! flag is read before every step and before every probe read round, so after a stop at
//! most the step in flight completes.

use std::collections::HashMap;
use std::io;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use log::{debug, error, info, warn};

use crate::error::{Error, ErrorKind, Result};
use crate::instruments::{Bench, Role, Session};
use crate::protocol::{Preparation, Probe, Protocol, Pulse, Step, Sweep};
use crate::sample::{Polarity, Sample, TraceSample};
use crate::settings::{validate, RawSettings, Timing};
use crate::sink::{LiveDataSink, Reading, SCOPE, SWITCHING, TEMPERATURE};

/// Shared stop request. Cloning shares the flag.
#[derive(Debug, Clone, Default)]
pub struct CancelFlag(Arc<AtomicBool>);

impl CancelFlag {
	pub fn new() -> Self { Self::default() }
	pub fn cancel(&self) { self.0.store(true, Ordering::SeqCst) }
	pub fn is_cancelled(&self) -> bool { self.0.load(Ordering::SeqCst) }
	pub(crate) fn reset(&self) { self.0.store(false, Ordering::SeqCst) }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Phase { Idle, Configuring, Armed, Running, Completed, Cancelled, Failed, Closed }

#[derive(Debug)]
pub enum EndReason {
	Completed,
	Cancelled,
	Failed(Error),
}

#[derive(Debug)]
pub struct RunResult {
	pub completed: bool,
	pub reason: EndReason,
	// Every phase the run went through, in order
	pub phases: Vec<Phase>,
	// Switching samples emitted
	pub samples: usize,
	// Instrument handles closed at the end
	pub closed: usize,
}

impl RunResult {

	pub(crate) fn failed(e:Error, phases:Vec<Phase>) -> Self {
		Self{ completed: false, reason: EndReason::Failed(e), phases, samples: 0, closed: 0 }
	}

	pub fn error(&self) -> Option<&Error> {
		match &self.reason {
			EndReason::Failed(e) => Some(e),
			_ => None,
		}
	}

	pub fn error_kind(&self) -> Option<ErrorKind> { self.error().map(|e| e.kind()) }
	pub fn is_cancelled(&self) -> bool { matches!(self.reason, EndReason::Cancelled) }

}

/// Seconds since the start of the run on one monotonic clock, kept strictly increasing
/// per (stream, polarity).
pub struct RunClock {
	epoch: Instant,
	last: HashMap<(&'static str, Polarity), f64>,
}

impl RunClock {

	pub fn new() -> Self { Self::starting_at(Instant::now()) }

	pub fn starting_at(epoch:Instant) -> Self { Self{ epoch, last: HashMap::new() } }

	pub fn elapsed(&self) -> f64 { self.epoch.elapsed().as_secs_f64() }

	// Moves `t` just past the previous stamp of the stream if it does not already follow it
	pub fn stamp(&mut self, stream:&'static str, polarity:Polarity, t:f64) -> f64 {
		let t = match self.last.get(&(stream, polarity)) {
			Some(prev) if t <= *prev => *prev + f64::EPSILON * prev.abs().max(1.0),
			_ => t,
		};
		self.last.insert((stream, polarity), t);
		t
	}

}

impl Default for RunClock {
	fn default() -> Self { Self::new() }
}

pub(crate) fn settle(secs:f64) {
	if secs > 0.0 {
		thread::sleep(Duration::from_secs_f64(secs));
	}
}

pub(crate) fn hw(role:Role, operation:&'static str) -> impl FnOnce(io::Error) -> Error {
	move |e| Error::instrument(&role.to_string(), operation, e)
}

enum Flow { Continue, Cancelled }

struct Runner<'a> {
	session: &'a mut Session,
	sink: &'a mut dyn LiveDataSink,
	cancel: &'a CancelFlag,
	timing: Timing,
	channel_tag: &'a str,
	reference_resistance: Option<f64>,
	clock: RunClock,
	// Run time at which the pulse the scope is waiting on was fired
	pending_scope: Option<f64>,
	armed_sweep: Option<Sweep>,
	samples: usize,
}

impl<'a> Runner<'a> {

	fn prepare(&mut self, prep:&Preparation) -> Result<Flow> {
		if let Some(dmm) = self.session.multimeter() {
			dmm.prepare_single().map_err(hw(Role::Multimeter, "prepare"))?;
		}

		if let Some(bb) = self.session.balance() {
			bb.enable_all().map_err(hw(Role::BalanceBox, "enable"))?;
			if let Some(resistances) = &prep.resistances {
				bb.set_resistances(resistances).map_err(hw(Role::BalanceBox, "set resistances"))?;
			}
		}

		if let (Some(scope), Some(setup)) = (self.session.scope(), prep.scope) {
			scope.prepare_for_pulse(setup.magnitude, setup.reference_resistance, setup.width)
				.map_err(hw(Role::Oscilloscope, "prepare"))?;
			settle(self.timing.scope_arm);
		}

		if let (Some(tec), Some(target)) = (self.session.thermal(), prep.temperature) {
			tec.set_target(target).map_err(hw(Role::Thermal, "set target"))?;
			tec.enable_control().map_err(hw(Role::Thermal, "enable"))?;
			info!("Waiting for the temperature to settle at {} C", target);
			loop {
				if self.cancel.is_cancelled() {
					return Ok(Flow::Cancelled);
				}
				if tec.is_stable().map_err(hw(Role::Thermal, "stability"))? {
					break;
				}
				settle(self.timing.temperature_poll);
			}
		}

		Ok(Flow::Continue)
	}

	fn run_steps(&mut self, steps:&[Step], polarity:Polarity) -> Result<Flow> {
		for step in steps.iter() {
			if self.cancel.is_cancelled() {
				return Ok(Flow::Cancelled);
			}
			let flow = match step {
				Step::Switch(route) => {
					let assignment = route.resolve(polarity);
					debug!("Switching to {}", assignment);
					self.session.switch().switch(assignment).map_err(hw(Role::SwitchMatrix, "switch"))?;
					settle(self.timing.switch_settle);
					Flow::Continue
				},
				Step::Pulse(pulse) => { self.pulse(pulse)?; Flow::Continue },
				Step::Probe(probe) => self.probe(probe, polarity)?,
				Step::Sweep(sweep) => { self.sweep(sweep)?; Flow::Continue },
				Step::Loop{ count, alternate, body } => self.repeat(*count, *alternate, body, polarity)?,
			};
			if let Flow::Cancelled = flow {
				return Ok(Flow::Cancelled);
			}
		}
		Ok(Flow::Continue)
	}

	fn repeat(&mut self, count:Option<usize>, alternate:bool, body:&[Step], polarity:Polarity) -> Result<Flow> {
		let halves = if alternate { vec![Polarity::Pos, Polarity::Neg] } else { vec![polarity] };
		let mut i = 0;
		while count.map_or(true, |n| i < n) {
			for half in halves.iter() {
				if let Flow::Cancelled = self.run_steps(body, *half)? {
					return Ok(Flow::Cancelled);
				}
			}
			i += 1;
			debug!("Loop {} of {} done", i, count.map(|n| n.to_string()).unwrap_or_else(|| "inf".into()));
		}
		Ok(Flow::Continue)
	}

	fn pulse(&mut self, pulse:&Pulse) -> Result<()> {
		let scope_armed = match self.session.scope() {
			Some(scope) => { scope.single_trigger().map_err(hw(Role::Oscilloscope, "single trigger"))?; true },
			None => false,
		};

		debug!("Pulsing {:?} {} for {} s", pulse.kind, pulse.magnitude, pulse.width);
		let source = self.session.source();
		source.prepare_pulse(pulse.kind, pulse.magnitude, pulse.width).map_err(hw(Role::Source, "prepare pulse"))?;
		source.arm_pulse().map_err(hw(Role::Source, "arm pulse"))?;
		settle(self.timing.pulse_settle);

		let fired_at = self.clock.elapsed();
		self.session.source().fire_pulse().map_err(hw(Role::Source, "fire pulse"))?;
		if scope_armed {
			self.pending_scope = Some(fired_at);
		}
		settle(self.timing.pulse_settle);
		Ok(())
	}

	fn probe(&mut self, probe:&Probe, polarity:Polarity) -> Result<Flow> {
		self.session.source().enable_probe(probe.wiring, probe.current).map_err(hw(Role::Source, "enable probe"))?;
		settle(self.timing.probe_settle);

		let res = self.probe_rounds(probe, polarity);

		// Never leave the probe current on, whatever happened above
		let disabled = self.session.source().disable_probe().map_err(hw(Role::Source, "disable probe"));
		let flow = match (res, disabled) {
			(Err(e), Err(cleanup)) => {
				warn!("{}", cleanup);
				return Err(e);
			},
			(Err(e), Ok(())) | (Ok(_), Err(e)) => return Err(e),
			(Ok(flow), Ok(())) => flow,
		};

		if let Flow::Continue = flow {
			self.emit_scope_trace(polarity)?;
		}
		Ok(flow)
	}

	fn probe_rounds(&mut self, probe:&Probe, polarity:Polarity) -> Result<Flow> {
		for round in 0..probe.count {
			if self.cancel.is_cancelled() {
				debug!("Stopped after {} of {} probe reads", round, probe.count);
				return Ok(Flow::Cancelled);
			}

			self.session.source().trigger().map_err(hw(Role::Source, "trigger"))?;
			let secondary = probe.secondary && self.session.is_open(Role::Multimeter);
			if let (true, Some(dmm)) = (secondary, self.session.multimeter()) {
				dmm.trigger().map_err(hw(Role::Multimeter, "trigger"))?;
			}

			let (voltage, current) = self.session.source().fetch().map_err(hw(Role::Source, "fetch"))?;
			let secondary_voltage = match (secondary, self.session.multimeter()) {
				(true, Some(dmm)) => Some(dmm.fetch().map_err(hw(Role::Multimeter, "fetch"))?),
				_ => None,
			};
			let t = self.clock.elapsed();
			let temperature = match (probe.temperature, self.session.thermal()) {
				(true, Some(tec)) => Some(tec.object_temperature().map_err(hw(Role::Thermal, "read temperature"))?),
				_ => None,
			};

			let timestamp = self.clock.stamp(SWITCHING, polarity, t);
			let sample = Sample::new(timestamp, current, voltage, secondary_voltage, polarity, self.channel_tag)?;
			self.sink.push(Reading::Switching(sample));
			self.samples += 1;

			if let Some(celsius) = temperature {
				let stamp = self.clock.stamp(TEMPERATURE, polarity, t);
				self.sink.push(Reading::Temperature(TraceSample::new(stamp, celsius, polarity, TEMPERATURE)));
			}
		}
		Ok(Flow::Continue)
	}

	fn emit_scope_trace(&mut self, polarity:Polarity) -> Result<()> {
		let fired_at = match self.pending_scope.take() {
			Some(t) => t,
			None => return Ok(()),
		};
		let reference = self.reference_resistance.unwrap_or(crate::settings::REFERENCE_RESISTANCE);
		let (trace, dt) = match self.session.scope() {
			Some(scope) => (
				scope.fetch_trace().map_err(hw(Role::Oscilloscope, "fetch trace"))?,
				scope.time_increment().map_err(hw(Role::Oscilloscope, "time increment"))?,
			),
			None => return Ok(()),
		};

		for (i, volts) in trace.iter().enumerate() {
			let stamp = self.clock.stamp(SCOPE, polarity, fired_at + i as f64 * dt);
			self.sink.push(Reading::Scope(TraceSample::new(stamp, volts / reference, polarity, SCOPE)));
		}
		Ok(())
	}

	fn sweep(&mut self, sweep:&Sweep) -> Result<()> {
		if self.armed_sweep.as_ref() != Some(sweep) {
			let source = self.session.source();
			source.configure_sweep(&sweep.currents, sweep.delay, sweep.repeats, sweep.width)
				.map_err(hw(Role::Source, "configure sweep"))?;
			source.arm_sweep().map_err(hw(Role::Source, "arm sweep"))?;
			settle(self.timing.pulse_settle);
			self.armed_sweep = Some(sweep.clone());
		}

		let triggered_at = self.clock.elapsed();
		self.session.source().trigger().map_err(hw(Role::Source, "trigger"))?;
		settle(self.timing.probe_settle);
		let trace = self.session.source().sweep_trace().map_err(hw(Role::Source, "sweep trace"))?;

		let tag = sweep.tag.as_deref().unwrap_or(self.channel_tag);
		for ((volts, offset), current) in trace.into_iter().zip(sweep.currents.iter().cycle()) {
			let polarity = Polarity::of(*current);
			let timestamp = self.clock.stamp(SWITCHING, polarity, triggered_at + offset);
			let sample = Sample::new(timestamp, *current, volts, None, polarity, tag)?;
			self.sink.push(Reading::Switching(sample));
			self.samples += 1;
		}
		Ok(())
	}

	fn release_thermal(&mut self) {
		if let Some(tec) = self.session.thermal() {
			if let Err(e) = tec.disable_control() {
				warn!("Could not disable temperature control: {}", e);
			}
		}
	}

}

/// Runs the protocol and closes the session. Never returns an error; the outcome is in
/// the result.
pub fn run(protocol:&Protocol, session:Session, sink:&mut dyn LiveDataSink, cancel:&CancelFlag) -> RunResult {
	run_from(Instant::now(), protocol, session, sink, cancel)
}

/// Like [`run`], with timestamps counted from `epoch`.
pub fn run_from(epoch:Instant, protocol:&Protocol, mut session:Session, sink:&mut dyn LiveDataSink, cancel:&CancelFlag) -> RunResult {
	let mut phases = vec![Phase::Armed];
	info!("Preparing instruments for a {} run", protocol.channel_tag);

	let (outcome, samples) = {
		let mut runner = Runner {
			session: &mut session,
			sink,
			cancel,
			timing: protocol.timing,
			channel_tag: &protocol.channel_tag,
			reference_resistance: protocol.preparation.scope.map(|s| s.reference_resistance),
			clock: RunClock::starting_at(epoch),
			pending_scope: None,
			armed_sweep: None,
			samples: 0,
		};

		let outcome = match runner.prepare(&protocol.preparation) {
			Ok(Flow::Continue) => {
				phases.push(Phase::Running);
				info!("Running");
				runner.run_steps(&protocol.steps, Polarity::Pos)
			},
			other => other,
		};
		if protocol.preparation.temperature.is_some() {
			runner.release_thermal();
		}
		(outcome, runner.samples)
	};

	let reason = match outcome {
		Ok(Flow::Continue) => {
			info!("Run completed with {} samples", samples);
			phases.push(Phase::Completed);
			EndReason::Completed
		},
		Ok(Flow::Cancelled) => {
			info!("Run stopped after {} samples", samples);
			phases.push(Phase::Cancelled);
			EndReason::Cancelled
		},
		Err(e) => {
			error!("Run failed after {} samples: {}", samples, e);
			phases.push(Phase::Failed);
			EndReason::Failed(e)
		},
	};

	let closed = session.close();
	phases.push(Phase::Closed);

	RunResult{ completed: matches!(reason, EndReason::Completed), reason, phases, samples, closed }
}

/// Validates raw settings, opens the bench and runs the switching protocol, recording
/// every phase. Bad settings fail before any instrument is touched.
pub fn execute(raw:&RawSettings, bench:Bench, sink:&mut dyn LiveDataSink, cancel:&CancelFlag) -> RunResult {
	let mut phases = vec![Phase::Idle, Phase::Configuring];

	let settings = match validate(raw) {
		Ok(s) => s,
		Err(e) => {
			error!("{}", e);
			phases.extend([Phase::Failed, Phase::Closed]);
			return RunResult::failed(e, phases);
		},
	};

	let session = match bench.open(&settings.open_plan()) {
		Ok(s) => s,
		Err(e) => {
			error!("{}", e);
			phases.extend([Phase::Failed, Phase::Closed]);
			return RunResult::failed(e, phases);
		},
	};

	let mut result = run(&Protocol::switching(&settings), session, sink, cancel);
	phases.append(&mut result.phases);
	result.phases = phases;
	result
}

#[cfg(test)]
mod tests {
	use super::*;
	use crate::instruments::sim::{Fault, SimLab, SOURCE, SWITCH};
	use crate::instruments::{OpenPlan, Port, PulseKind, Wiring};
	use crate::protocol::Route;
	use crate::settings::tests::bench_raw;
	use crate::sink::RunData;

	fn route(text:&str) -> Route { Route::Fixed(text.parse().unwrap()) }

	fn two_instrument_plan() -> OpenPlan {
		OpenPlan{ steps: vec![(Role::SwitchMatrix, Port::Com(3)), (Role::Source, Port::Auto)] }
	}

	fn scenario(count:usize) -> Protocol {
		Protocol::new(vec![
			Step::Switch(route("{I+: B, I-: F}")),
			Step::Pulse(Pulse{ kind: PulseKind::Current, magnitude: 15e-3, width: 500e-6 }),
			Step::Switch(route("{I+: A, I-: E, V1+: B, V1-: D}")),
			Step::Probe(Probe{ count, wiring: Wiring::FourWire, current: 100e-6, secondary: false, temperature: false }),
		], "switching", Timing::none())
	}

	#[test]
	fn clock_stamps_strictly_increase() {
		let mut clock = RunClock::new();
		assert_eq!(clock.stamp(SWITCHING, Polarity::Pos, 1.0), 1.0);
		let second = clock.stamp(SWITCHING, Polarity::Pos, 1.0);
		assert!(second > 1.0);
		assert!(clock.stamp(SWITCHING, Polarity::Pos, 0.5) > second);
		// Streams and polarities are independent
		assert_eq!(clock.stamp(SWITCHING, Polarity::Neg, 0.5), 0.5);
		assert_eq!(clock.stamp(SCOPE, Polarity::Pos, 0.5), 0.5);
	}

	#[test]
	fn completes_and_closes() {
		let lab = SimLab::new();
		let session = lab.bench().open(&two_instrument_plan()).unwrap();
		let mut data = RunData::new();
		let result = run(&scenario(5), session, &mut data, &CancelFlag::new());

		assert!(result.completed, "{:?}", result.reason);
		assert_eq!(result.samples, 5);
		assert_eq!(data.switching.len(), 5);
		assert_eq!(result.closed, 2);
		assert_eq!(lab.total_closes(), lab.total_opens());
		assert!(!lab.probe_enabled());
		assert_eq!(result.phases, vec![Phase::Armed, Phase::Running, Phase::Completed, Phase::Closed]);
	}

	#[test]
	fn timestamps_count_from_the_given_epoch() {
		let lab = SimLab::new();
		let session = lab.bench().open(&two_instrument_plan()).unwrap();
		let epoch = Instant::now().checked_sub(Duration::from_secs(2)).unwrap();
		let mut data = RunData::new();
		let result = run_from(epoch, &scenario(3), session, &mut data, &CancelFlag::new());

		assert!(result.completed);
		assert!(data.switching.iter().all(|s| s.timestamp() >= 2.0));
	}

	#[test]
	fn cancel_during_probe_block() {
		let lab = SimLab::new();
		let cancel = CancelFlag::new();
		lab.inject(Fault::CancelOnRead(2, cancel.clone()));
		let session = lab.bench().open(&two_instrument_plan()).unwrap();
		let mut data = RunData::new();
		let result = run(&scenario(5), session, &mut data, &cancel);

		assert!(!result.completed);
		assert!(result.is_cancelled());
		assert_eq!(data.switching.len(), 2);
		assert_eq!(lab.closes(SWITCH), 1);
		assert_eq!(lab.closes(SOURCE), 1);
		assert!(!lab.probe_enabled());
	}

	#[test]
	fn zero_current_fails_the_run() {
		let lab = SimLab::new();
		lab.inject(Fault::ZeroCurrentOnRead(3));
		let session = lab.bench().open(&two_instrument_plan()).unwrap();
		let mut data = RunData::new();
		let result = run(&scenario(5), session, &mut data, &CancelFlag::new());

		assert_eq!(result.error_kind(), Some(ErrorKind::DivisionByZero));
		assert_eq!(data.switching.len(), 2);
		assert_eq!(lab.total_closes(), lab.total_opens());
	}

	#[test]
	fn instrument_error_stops_before_next_step() {
		let lab = SimLab::new();
		lab.inject(Fault::FailCall{ instrument: SOURCE, operation: "fire_pulse", nth: 1 });
		let session = lab.bench().open(&two_instrument_plan()).unwrap();
		let mut data = RunData::new();
		let result = run(&scenario(5), session, &mut data, &CancelFlag::new());

		assert_eq!(result.error_kind(), Some(ErrorKind::Instrument));
		assert!(data.switching.is_empty());
		let switches = lab.log().iter().filter(|l| l.as_str() == "sim-switch:switch").count();
		assert_eq!(switches, 1);
		assert_eq!(lab.total_closes(), 2);
	}

	#[test]
	fn alternating_loop_tags_polarity() {
		let lab = SimLab::new();
		let mut data = RunData::new();
		let result = execute(&bench_raw(), lab.bench(), &mut data, &CancelFlag::new());

		assert!(result.completed, "{:?}", result.reason);
		assert_eq!(result.phases[..2], [Phase::Idle, Phase::Configuring]);
		let pos = data.switching.of_polarity(Polarity::Pos).count();
		let neg = data.switching.of_polarity(Polarity::Neg).count();
		assert_eq!((pos, neg), (5, 5));
		// POS samples come first, and the device really switched between halves
		assert_eq!(data.switching.as_slice()[0].polarity(), Polarity::Pos);
		let r_pos = data.switching.as_slice()[0].resistance();
		let r_neg = data.switching.as_slice()[5].resistance();
		assert!(r_pos > r_neg);
		assert!(data.switching.as_slice()[0].secondary_resistance().is_some());
	}

	#[test]
	fn bad_settings_never_open_instruments() {
		let lab = SimLab::new();
		let raw = RawSettings{ sb_port: "three".into(), ..bench_raw() };
		let result = execute(&raw, lab.bench(), &mut RunData::new(), &CancelFlag::new());

		assert_eq!(result.error_kind(), Some(ErrorKind::Configuration));
		assert_eq!(result.phases, vec![Phase::Idle, Phase::Configuring, Phase::Failed, Phase::Closed]);
		assert_eq!(lab.total_opens(), 0);
	}
}
