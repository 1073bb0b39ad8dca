
// Instrument seams consumed by the sequencer. Concrete drivers (VISA, serial, VXI-11) live outside
// this crate; `sim` provides a simulated bench that implements every trait.

use std::fmt;
use std::io::{self, Error, ErrorKind};

use log::{debug, info, warn};

use crate::assignment::{ResistanceAssignment, SwitchAssignment};

pub mod sim;

pub(crate) fn err(msg:&str) -> io::Error { Error::new(ErrorKind::Other, msg) }

fn unsupported(name:&str, what:&str) -> io::Error {
	Error::new(ErrorKind::Unsupported, format!("{} does not support {}", name, what))
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Port {
	// Serial instruments, addressed by COM number
	Com(u32),
	// Bus-addressed instruments (USB, LAN) that the driver finds on its own
	Auto,
}

impl fmt::Display for Port {
	fn fmt(&self, f:&mut fmt::Formatter) -> fmt::Result {
		match self {
			Port::Com(n) => write!(f, "COM{}", n),
			Port::Auto   => write!(f, "auto"),
		}
	}
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PulseKind { Current, Voltage }

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Wiring { TwoWire, FourWire }

pub trait Instrument: Send {
	fn name(&self) -> &str;
	fn connect(&mut self, port:&Port) -> io::Result<()>;
	fn close(&mut self) -> io::Result<()>;
}

pub trait SwitchMatrix: Instrument {
	// Blocks until the matrix acknowledges the new routing
	fn switch(&mut self, assignment:&SwitchAssignment) -> io::Result<()>;
}

pub trait BalanceBox: Instrument {
	fn enable_all(&mut self) -> io::Result<()>;
	fn set_resistances(&mut self, resistances:&ResistanceAssignment) -> io::Result<()>;
	fn reset_resistances(&mut self) -> io::Result<()>;
}

/// Pulse source that doubles as the probe source and first voltmeter.
pub trait SourceMeter: Instrument {
	fn prepare_pulse(&mut self, kind:PulseKind, magnitude:f64, width:f64) -> io::Result<()>;
	// Arms the pulse on an external trigger
	fn arm_pulse(&mut self) -> io::Result<()>;
	fn fire_pulse(&mut self) -> io::Result<()>;

	fn enable_probe(&mut self, wiring:Wiring, current:f64) -> io::Result<()>;
	fn trigger(&mut self) -> io::Result<()>;
	// (voltage, current) of the last triggered reading
	fn fetch(&mut self) -> io::Result<(f64, f64)>;
	fn disable_probe(&mut self) -> io::Result<()>;

	// Custom current sweeps (delta mode). Not every source has them.
	fn configure_sweep(&mut self, _currents:&[f64], _delay:f64, _repeats:usize, _width:f64) -> io::Result<()> {
		Err(unsupported(self.name(), "custom sweeps"))
	}
	fn arm_sweep(&mut self) -> io::Result<()> {
		Err(unsupported(self.name(), "custom sweeps"))
	}
	// (voltage, seconds since trigger) for every sweep point
	fn sweep_trace(&mut self) -> io::Result<Vec<(f64, f64)>> {
		Err(unsupported(self.name(), "custom sweeps"))
	}
}

pub trait Multimeter: Instrument {
	fn prepare_single(&mut self) -> io::Result<()>;
	fn trigger(&mut self) -> io::Result<()>;
	fn fetch(&mut self) -> io::Result<f64>;
}

pub trait Oscilloscope: Instrument {
	fn prepare_for_pulse(&mut self, magnitude:f64, reference_resistance:f64, width:f64) -> io::Result<()>;
	fn single_trigger(&mut self) -> io::Result<()>;
	// Voltages across the reference resistor
	fn fetch_trace(&mut self) -> io::Result<Vec<f64>>;
	fn time_increment(&mut self) -> io::Result<f64>;
}

pub trait TemperatureController: Instrument {
	fn set_target(&mut self, celsius:f64) -> io::Result<()>;
	fn enable_control(&mut self) -> io::Result<()>;
	fn disable_control(&mut self) -> io::Result<()>;
	fn is_stable(&mut self) -> io::Result<bool>;
	fn object_temperature(&mut self) -> io::Result<f64>;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Role { SwitchMatrix, BalanceBox, Oscilloscope, Multimeter, Source, Thermal }

impl fmt::Display for Role {
	fn fmt(&self, f:&mut fmt::Formatter) -> fmt::Result {
		f.write_str(match self {
			Role::SwitchMatrix => "switch matrix",
			Role::BalanceBox   => "balance box",
			Role::Oscilloscope => "oscilloscope",
			Role::Multimeter   => "multimeter",
			Role::Source       => "source",
			Role::Thermal      => "temperature controller",
		})
	}
}

// Runs `$body` against the role's driver as a plain `Instrument`, or yields `None` when the
// session holds no driver for it.
macro_rules! on_role {
	($session:expr, $role:expr, |$i:ident| $body:expr) => {
		match $role {
			Role::SwitchMatrix => { let $i = &mut $session.switch; Some($body) },
			Role::Source       => { let $i = &mut $session.source; Some($body) },
			Role::Multimeter   => $session.multimeter.as_mut().map(|$i| $body),
			Role::BalanceBox   => $session.balance.as_mut().map(|$i| $body),
			Role::Oscilloscope => $session.scope.as_mut().map(|$i| $body),
			Role::Thermal      => $session.thermal.as_mut().map(|$i| $body),
		}
	};
}

/// Unopened drivers for one run.
pub struct Bench {
	pub switch: Box<dyn SwitchMatrix>,
	pub source: Box<dyn SourceMeter>,
	pub multimeter: Option<Box<dyn Multimeter>>,
	pub balance: Option<Box<dyn BalanceBox>>,
	pub scope: Option<Box<dyn Oscilloscope>>,
	pub thermal: Option<Box<dyn TemperatureController>>,
}

/// Which instruments a run opens and where, in the order they are connected.
#[derive(Debug, Clone, PartialEq)]
pub struct OpenPlan {
	pub steps: Vec<(Role, Port)>,
}

impl OpenPlan {
	pub fn includes(&self, role:Role) -> bool {
		self.steps.iter().any(|(r, _)| *r == role)
	}
}

impl Bench {

	pub fn new(switch:Box<dyn SwitchMatrix>, source:Box<dyn SourceMeter>) -> Self {
		Self{ switch, source, multimeter: None, balance: None, scope: None, thermal: None }
	}

	pub fn with_multimeter(mut self, m:Box<dyn Multimeter>) -> Self { self.multimeter = Some(m); self }
	pub fn with_balance(mut self, b:Box<dyn BalanceBox>) -> Self { self.balance = Some(b); self }
	pub fn with_scope(mut self, s:Box<dyn Oscilloscope>) -> Self { self.scope = Some(s); self }
	pub fn with_thermal(mut self, t:Box<dyn TemperatureController>) -> Self { self.thermal = Some(t); self }

	/// Connects every instrument named by the plan, in order.
	///
	/// Drivers the plan leaves out are dropped unopened. On the first failure the handles
	/// opened so far are closed in reverse order and a `Connection` error is returned.
	pub fn open(self, plan:&OpenPlan) -> crate::Result<Session> {
		let Bench{ switch, source, multimeter, balance, scope, thermal } = self;

		let mut session = Session {
			switch, source,
			multimeter: if plan.includes(Role::Multimeter) { multimeter } else { None },
			balance:    if plan.includes(Role::BalanceBox) { balance } else { None },
			scope:      if plan.includes(Role::Oscilloscope) { scope } else { None },
			thermal:    if plan.includes(Role::Thermal) { thermal } else { None },
			opened: vec![],
		};

		for (role, port) in plan.steps.iter() {
			let res = on_role!(session, *role, |i| {
				debug!("Connecting {} ({}) on {}", role, i.name(), port);
				i.connect(port)
			}).unwrap_or_else(|| Err(Error::new(ErrorKind::NotFound, "no driver supplied")));

			if let Err(source) = res {
				// Dropping the session closes whatever is already open
				return Err(crate::Error::Connection{ instrument: role.to_string(), port: port.to_string(), source });
			}
			session.opened.push(*role);
		}

		info!("Opened {} instrument(s)", session.opened.len());
		Ok(session)
	}

}

/// Instrument handles owned by one run.
///
/// Handles are closed in reverse order of acquisition, either explicitly through
/// [`Session::close`] or when the session is dropped.
pub struct Session {
	switch: Box<dyn SwitchMatrix>,
	source: Box<dyn SourceMeter>,
	multimeter: Option<Box<dyn Multimeter>>,
	balance: Option<Box<dyn BalanceBox>>,
	scope: Option<Box<dyn Oscilloscope>>,
	thermal: Option<Box<dyn TemperatureController>>,
	opened: Vec<Role>,
}

impl Session {

	pub fn is_open(&self, role:Role) -> bool { self.opened.contains(&role) }
	pub fn opened(&self) -> &[Role] { &self.opened }

	pub fn switch(&mut self) -> &mut dyn SwitchMatrix { self.switch.as_mut() }
	pub fn source(&mut self) -> &mut dyn SourceMeter { self.source.as_mut() }

	pub fn multimeter(&mut self) -> Option<&mut (dyn Multimeter + 'static)> {
		if self.is_open(Role::Multimeter) { self.multimeter.as_deref_mut() } else { None }
	}

	pub fn balance(&mut self) -> Option<&mut (dyn BalanceBox + 'static)> {
		if self.is_open(Role::BalanceBox) { self.balance.as_deref_mut() } else { None }
	}

	pub fn scope(&mut self) -> Option<&mut (dyn Oscilloscope + 'static)> {
		if self.is_open(Role::Oscilloscope) { self.scope.as_deref_mut() } else { None }
	}

	pub fn thermal(&mut self) -> Option<&mut (dyn TemperatureController + 'static)> {
		if self.is_open(Role::Thermal) { self.thermal.as_deref_mut() } else { None }
	}

	fn close_all(&mut self) -> usize {
		let mut closed = 0;
		while let Some(role) = self.opened.pop() {
			let res = on_role!(self, role, |i| match i.close() {
				Ok(()) => debug!("Closed {} ({})", role, i.name()),
				Err(e) => warn!("Failed to close {} ({}): {}", role, i.name(), e),
			});
			if res.is_some() {
				closed += 1;
			}
		}
		closed
	}

	/// Closes every open handle, newest first, and returns how many were closed.
	/// Close failures are logged and otherwise ignored.
	pub fn close(mut self) -> usize {
		self.close_all()
	}

}

impl Drop for Session {

	fn drop(&mut self) { self.close_all(); }

}
