// Two-wire and four-wire resistance survey over the recipe's survey paths

use log::{debug, error, info, warn};

use crate::assignment::SwitchAssignment;
use crate::error::{Error, Result};
use crate::instruments::{Role, Session, Wiring};
use crate::sequencer::{hw, settle, CancelFlag};
use crate::settings::{Recipe, Timing};

#[derive(Debug, Clone, PartialEq, Default)]
pub struct SurveyResult {
	pub two_wire: Vec<f64>,
	pub four_wire: Vec<f64>,
	// False when the survey was stopped before every path was measured
	pub complete: bool,
}

fn measure_path(session:&mut Session, path:&SwitchAssignment, wiring:Wiring, current:f64, timing:&Timing) -> Result<f64> {
	session.switch().switch(path).map_err(hw(Role::SwitchMatrix, "switch"))?;
	settle(timing.switch_settle);

	let source = session.source();
	source.enable_probe(wiring, current).map_err(hw(Role::Source, "enable probe"))?;
	settle(timing.survey_settle);

	let reading = source.trigger().and_then(|_| source.fetch()).map_err(hw(Role::Source, "fetch"));
	if let Err(e) = source.disable_probe() {
		warn!("Could not disable the probe current: {}", e);
	}
	let (voltage, current) = reading?;

	if current == 0.0 {
		return Err(Error::DivisionByZero{ timestamp: 0.0, channel_tag: path.to_string() });
	}
	let r = voltage / current;
	debug!("{:?} {} -> {} Ohm", wiring, path, r);
	Ok(r)
}

/// Measures every two-wire path, then every four-wire path, with the balance box
/// reference resistors reset first. Checks the cancel flag between paths.
///
/// Readings taken before a failure are kept: the result is always returned, together
/// with the error that ended the survey early, if any.
pub fn run(session:&mut Session, recipe:&Recipe, probe_current:f64, timing:&Timing, cancel:&CancelFlag) -> (SurveyResult, Option<Error>) {
	let mut result = SurveyResult::default();

	if let Some(bb) = session.balance() {
		if let Err(e) = bb.reset_resistances().map_err(hw(Role::BalanceBox, "reset resistances")) {
			error!("Survey not started: {}", e);
			return (result, Some(e));
		}
	}

	let passes = [
		(Wiring::TwoWire, &recipe.two_wire),
		(Wiring::FourWire, &recipe.four_wire),
	];
	for (wiring, paths) in passes.iter() {
		for path in paths.iter() {
			if cancel.is_cancelled() {
				info!("Survey stopped after {} two-wire and {} four-wire readings", result.two_wire.len(), result.four_wire.len());
				return (result, None);
			}
			let r = match measure_path(session, path, *wiring, probe_current, timing) {
				Ok(r) => r,
				Err(e) => {
					error!("Survey failed after {} two-wire and {} four-wire readings: {}", result.two_wire.len(), result.four_wire.len(), e);
					return (result, Some(e));
				},
			};
			match wiring {
				Wiring::TwoWire => result.two_wire.push(r),
				Wiring::FourWire => result.four_wire.push(r),
			}
		}
	}

	info!("Two wires: {:?}", result.two_wire);
	info!("Four wires: {:?}", result.four_wire);
	result.complete = true;
	(result, None)
}

#[cfg(test)]
mod tests {
	use super::*;
	use crate::instruments::sim::{DeviceModel, Fault, SimLab, SOURCE};
	use crate::instruments::{OpenPlan, Port};
	use crate::settings::{tests::bench_raw, validate};

	fn plan(with_balance:bool) -> OpenPlan {
		let mut steps = vec![(Role::SwitchMatrix, Port::Com(3))];
		if with_balance {
			steps.push((Role::BalanceBox, Port::Com(4)));
		}
		steps.push((Role::Source, Port::Auto));
		OpenPlan{ steps }
	}

	#[test]
	fn measures_every_path() {
		let lab = SimLab::with_model(DeviceModel{ drift: 0.0, ..DeviceModel::default() });
		let settings = validate(&bench_raw()).unwrap();
		let mut session = lab.bench().open(&plan(true)).unwrap();
		let (r, failure) = run(&mut session, &settings.recipe, settings.probe_current, &Timing::none(), &CancelFlag::new());

		assert!(failure.is_none());
		assert!(r.complete);
		assert_eq!(r.two_wire.len(), 4);
		assert_eq!(r.four_wire.len(), 4);
		// Contacts add to every two-wire reading
		assert!(r.two_wire.iter().zip(r.four_wire.iter()).all(|(two, four)| two > four));
		assert!(lab.log().contains(&"sim-balance:reset_resistances".to_owned()));
		assert!(!lab.probe_enabled());
		session.close();
		assert_eq!(lab.total_closes(), 3);
	}

	#[test]
	fn stops_between_paths() {
		let lab = SimLab::new();
		let cancel = CancelFlag::new();
		lab.inject(Fault::CancelOnRead(3, cancel.clone()));
		let settings = validate(&bench_raw()).unwrap();
		let mut session = lab.bench().open(&plan(false)).unwrap();
		let (r, failure) = run(&mut session, &settings.recipe, settings.probe_current, &Timing::none(), &cancel);

		assert!(failure.is_none());
		assert!(!r.complete);
		assert_eq!(r.two_wire.len(), 3);
		assert!(r.four_wire.is_empty());
	}

	#[test]
	fn zero_current_is_an_error() {
		let lab = SimLab::new();
		lab.inject(Fault::ZeroCurrentOnRead(1));
		let settings = validate(&bench_raw()).unwrap();
		let mut session = lab.bench().open(&plan(false)).unwrap();
		let (r, failure) = run(&mut session, &settings.recipe, settings.probe_current, &Timing::none(), &CancelFlag::new());
		assert_eq!(failure.map(|e| e.kind()), Some(crate::error::ErrorKind::DivisionByZero));
		assert!(r.two_wire.is_empty());
		assert!(!lab.probe_enabled());
	}

	#[test]
	fn failure_keeps_earlier_readings() {
		let lab = SimLab::new();
		lab.inject(Fault::FailCall{ instrument: SOURCE, operation: "fetch", nth: 3 });
		let settings = validate(&bench_raw()).unwrap();
		let mut session = lab.bench().open(&plan(false)).unwrap();
		let (r, failure) = run(&mut session, &settings.recipe, settings.probe_current, &Timing::none(), &CancelFlag::new());

		assert_eq!(failure.map(|e| e.kind()), Some(crate::error::ErrorKind::Instrument));
		assert!(!r.complete);
		assert_eq!(r.two_wire.len(), 2);
		assert!(r.four_wire.is_empty());
		assert!(!lab.probe_enabled());
	}
}
