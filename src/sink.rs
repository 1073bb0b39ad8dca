//! Where the sequencer sends what it measures.

use std::collections::BTreeMap;

use crossbeam_channel::Sender;
use log::debug;

use crate::accumulator::SampleAccumulator;
use crate::error::Result;
use crate::sample::{Sample, TraceSample};
use crate::sequencer::RunResult;
use crate::table::Table;

pub const SWITCHING: &str = "switching";
pub const SCOPE: &str = "scope";
pub const TEMPERATURE: &str = "temperature";

/// One emitted reading, tagged by the stream it belongs to.
#[derive(Debug, Clone, PartialEq)]
pub enum Reading {
	Switching(Sample),
	Scope(TraceSample),
	Temperature(TraceSample),
}

impl Reading {
	pub fn stream(&self) -> &'static str {
		match self {
			Reading::Switching(_) => SWITCHING,
			Reading::Scope(_) => SCOPE,
			Reading::Temperature(_) => TEMPERATURE,
		}
	}
}

pub trait LiveDataSink {
	fn push(&mut self, reading:Reading);
}

/// Messages from the run thread to the foreground.
#[derive(Debug)]
pub enum Event {
	Reading(Reading),
	Finished(RunResult),
}

/// Forwards readings over a channel, in the order they are pushed.
pub struct ChannelSink {
	tx: Sender<Event>,
}

impl ChannelSink {
	pub fn new(tx:Sender<Event>) -> Self { Self{ tx } }
}

impl LiveDataSink for ChannelSink {
	fn push(&mut self, reading:Reading) {
		// The run keeps going if nobody listens anymore
		if self.tx.send(Event::Reading(reading)).is_err() {
			debug!("Reading dropped, receiver is gone");
		}
	}
}

/// Accumulators for every stream of one run.
pub struct RunData {
	pub switching: SampleAccumulator<Sample>,
	pub scope: SampleAccumulator<TraceSample>,
	pub temperature: SampleAccumulator<TraceSample>,
}

impl Default for RunData {
	fn default() -> Self { Self::new() }
}

impl RunData {

	pub fn new() -> Self {
		Self {
			switching: SampleAccumulator::new(SWITCHING),
			scope: SampleAccumulator::new(SCOPE),
			temperature: SampleAccumulator::new(TEMPERATURE),
		}
	}

	pub fn append(&mut self, reading:Reading) {
		match reading {
			Reading::Switching(s) => self.switching.append(s),
			Reading::Scope(t) => self.scope.append(t),
			Reading::Temperature(t) => self.temperature.append(t),
		}
	}

	pub fn is_empty(&self) -> bool {
		self.switching.is_empty() && self.scope.is_empty() && self.temperature.is_empty()
	}

	// Streams with no data are left out
	pub fn tables(&self) -> BTreeMap<String, Table> {
		let mut tables = BTreeMap::new();
		if !self.switching.is_empty() {
			tables.insert(SWITCHING.to_owned(), self.switching.export());
		}
		if !self.scope.is_empty() {
			tables.insert(SCOPE.to_owned(), self.scope.export());
		}
		if !self.temperature.is_empty() {
			tables.insert(TEMPERATURE.to_owned(), self.temperature.export());
		}
		tables
	}

	pub fn from_tables(tables:&BTreeMap<String, Table>) -> Result<Self> {
		let mut data = Self::new();
		if let Some(t) = tables.get(SWITCHING) {
			data.switching = SampleAccumulator::from_table(SWITCHING, t)?;
		}
		if let Some(t) = tables.get(SCOPE) {
			data.scope = SampleAccumulator::from_table(SCOPE, t)?;
		}
		if let Some(t) = tables.get(TEMPERATURE) {
			data.temperature = SampleAccumulator::from_table(TEMPERATURE, t)?;
		}
		Ok(data)
	}

}

impl LiveDataSink for RunData {
	fn push(&mut self, reading:Reading) { self.append(reading) }
}

/// Hands every reading to each of several sinks.
#[derive(Default)]
pub struct FanOut<'a> {
	sinks: Vec<&'a mut dyn LiveDataSink>,
}

impl<'a> FanOut<'a> {

	pub fn new() -> Self { Self{ sinks: vec![] } }

	pub fn with(mut self, sink:&'a mut dyn LiveDataSink) -> Self {
		self.sinks.push(sink);
		self
	}

}

impl<'a> LiveDataSink for FanOut<'a> {
	fn push(&mut self, reading:Reading) {
		if let Some((last, rest)) = self.sinks.split_last_mut() {
			for sink in rest.iter_mut() {
				sink.push(reading.clone());
			}
			last.push(reading);
		}
	}
}

#[cfg(test)]
mod tests {
	use super::*;
	use crate::sample::Polarity;

	fn switching(t:f64) -> Reading {
		Reading::Switching(Sample::new(t, 1e-4, 1e-2, None, Polarity::Pos, SWITCHING).unwrap())
	}

	#[test]
	fn run_data_routes_by_stream() {
		let mut data = RunData::new();
		data.push(switching(0.1));
		data.push(Reading::Scope(TraceSample::new(0.05, 2e-2, Polarity::Pos, SCOPE)));
		assert_eq!(data.switching.len(), 1);
		assert_eq!(data.scope.len(), 1);
		assert!(data.temperature.is_empty());

		let tables = data.tables();
		assert_eq!(tables.keys().cloned().collect::<Vec<_>>(), vec![SCOPE.to_owned(), SWITCHING.to_owned()]);
		let back = RunData::from_tables(&tables).unwrap();
		assert_eq!(back.switching.as_slice(), data.switching.as_slice());
	}

	#[test]
	fn fan_out_reaches_every_sink() {
		let mut a = RunData::new();
		let mut b = RunData::new();
		{
			let mut fan = FanOut::new().with(&mut a).with(&mut b);
			fan.push(switching(0.1));
			fan.push(switching(0.2));
		}
		assert_eq!(a.switching.len(), 2);
		assert_eq!(b.switching.as_slice(), a.switching.as_slice());
	}

	#[test]
	fn channel_sink_preserves_order() {
		let (tx, rx) = crossbeam_channel::unbounded();
		let mut sink = ChannelSink::new(tx);
		for i in 0..5 {
			sink.push(switching(i as f64));
		}
		drop(sink);
		let times: Vec<f64> = rx.iter().map(|e| match e {
			Event::Reading(Reading::Switching(s)) => s.timestamp(),
			other => panic!("unexpected {:?}", other),
		}).collect();
		assert_eq!(times, vec![0.0, 1.0, 2.0, 3.0, 4.0]);
	}

	#[test]
	fn channel_sink_survives_closed_receiver() {
		let (tx, rx) = crossbeam_channel::unbounded();
		drop(rx);
		ChannelSink::new(tx).push(switching(0.0));
	}
}
