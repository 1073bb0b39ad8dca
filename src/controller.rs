//! Starts and stops runs on a background thread and hands their readings to the
//! foreground.
//!
//! The run thread owns the instruments and pushes readings into a channel. The foreground
//! drains that channel with [`RunController::poll`] or [`RunController::poll_timeout`];
//! observers are called there, and the run's accumulators are only ever touched there.

use std::path::PathBuf;
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant, SystemTime, UNIX_EPOCH};

use crossbeam_channel::{unbounded, Receiver, RecvTimeoutError, TryRecvError};
use log::{info, warn};

use crate::error::{Error, Result};
use crate::instruments::{Bench, Session};
use crate::protocol::Protocol;
use crate::sequencer::{self, CancelFlag, Phase, RunResult};
use crate::settings::{validate, RawSettings, Settings};
use crate::sink::{ChannelSink, Event, Reading, RunData};
use crate::store::{self, RunFile};

/// A run that has ended, with everything needed to save it.
pub struct FinishedRun {
	pub settings: Settings,
	// Seconds since the Unix epoch when the run was started
	pub start_time: f64,
	pub data: RunData,
	pub result: RunResult,
}

impl FinishedRun {

	pub fn run_file(&self) -> RunFile {
		RunFile::new(self.settings.meta_row(self.start_time), &self.data)
	}

	pub fn save(&self, name:Option<&str>) -> Result<Option<PathBuf>> {
		store::save(name, &self.run_file())
	}

}

struct ActiveRun {
	settings: Settings,
	start_time: f64,
	data: RunData,
	rx: Receiver<Event>,
	handle: Option<JoinHandle<()>>,
}

pub struct RunController {
	cancel: CancelFlag,
	active: Option<ActiveRun>,
	finished: Option<FinishedRun>,
	sample_observers: Vec<Box<dyn FnMut(&Reading)>>,
	finished_observers: Vec<Box<dyn FnMut(&RunResult)>>,
	autosave: Option<PathBuf>,
}

impl Default for RunController {
	fn default() -> Self { Self::new() }
}

fn unix_now() -> f64 {
	SystemTime::now().duration_since(UNIX_EPOCH).map(|d| d.as_secs_f64()).unwrap_or(0.0)
}

impl RunController {

	pub fn new() -> Self {
		Self {
			cancel: CancelFlag::new(),
			active: None,
			finished: None,
			sample_observers: vec![],
			finished_observers: vec![],
			autosave: None,
		}
	}

	/// Rewrites `path` with everything collected so far each time new readings arrive.
	pub fn set_autosave(&mut self, path:Option<PathBuf>) {
		self.autosave = path;
	}

	pub fn on_sample<F: FnMut(&Reading) + 'static>(&mut self, f:F) {
		self.sample_observers.push(Box::new(f));
	}

	pub fn on_finished<F: FnMut(&RunResult) + 'static>(&mut self, f:F) {
		self.finished_observers.push(Box::new(f));
	}

	// The flag `stop` raises. Shared across runs and cleared by every start.
	pub fn cancel_flag(&self) -> CancelFlag { self.cancel.clone() }

	pub fn is_running(&self) -> bool { self.active.is_some() }

	/// Readings of the active run received so far.
	pub fn data(&self) -> Option<&RunData> { self.active.as_ref().map(|a| &a.data) }

	pub fn finished(&self) -> Option<&FinishedRun> { self.finished.as_ref() }

	pub fn take_finished(&mut self) -> Option<FinishedRun> { self.finished.take() }

	/// Validates the settings, opens the bench and starts the switching protocol.
	pub fn start(&mut self, raw:&RawSettings, bench:Bench) -> Result<()> {
		if self.is_running() {
			return Err(Error::AlreadyRunning);
		}
		let settings = validate(raw)?;
		let session = bench.open(&settings.open_plan())?;
		let protocol = Protocol::switching(&settings);
		self.launch(settings, protocol, session)
	}

	/// Starts any protocol on an already opened session.
	pub fn launch(&mut self, settings:Settings, protocol:Protocol, session:Session) -> Result<()> {
		if self.is_running() {
			// Dropping the session closes it
			return Err(Error::AlreadyRunning);
		}

		self.cancel.reset();
		let cancel = self.cancel.clone();
		let (tx, rx) = unbounded();

		// Sample timestamps and the recorded start time share one instant
		let epoch = Instant::now();
		let start_time = unix_now();

		let handle = thread::Builder::new()
			.name("pulseprobe-run".to_string())
			.spawn(move || {
				let mut sink = ChannelSink::new(tx.clone());
				let result = sequencer::run_from(epoch, &protocol, session, &mut sink, &cancel);
				if tx.send(Event::Finished(result)).is_err() {
					warn!("Run finished but the controller is gone");
				}
			})?;

		info!("Run started");
		self.active = Some(ActiveRun{ settings, start_time, data: RunData::new(), rx, handle: Some(handle) });
		Ok(())
	}

	/// Requests a stop. Returns immediately; the run ends at its next step boundary.
	pub fn stop(&self) {
		if self.is_running() {
			info!("Stop requested");
		}
		self.cancel.cancel();
	}

	/// Handles everything queued without blocking. Returns the number of events handled.
	pub fn poll(&mut self) -> usize {
		self.drain(None)
	}

	/// Waits up to `timeout` for the first event, then handles everything queued.
	pub fn poll_timeout(&mut self, timeout:Duration) -> usize {
		let rx = match &self.active {
			Some(a) => a.rx.clone(),
			None => return 0,
		};
		match rx.recv_timeout(timeout) {
			Ok(first) => self.drain(Some(first)),
			Err(RecvTimeoutError::Timeout) => 0,
			Err(RecvTimeoutError::Disconnected) => self.drain(None),
		}
	}

	/// Polls until the active run has finished.
	pub fn wait(&mut self) -> Option<&FinishedRun> {
		while self.is_running() {
			self.poll_timeout(Duration::from_millis(50));
		}
		self.finished.as_ref()
	}

	fn drain(&mut self, first:Option<Event>) -> usize {
		let rx = match &self.active {
			Some(a) => a.rx.clone(),
			None => return 0,
		};

		let mut events:Vec<Event> = first.into_iter().collect();
		let mut disconnected = false;
		loop {
			match rx.try_recv() {
				Ok(ev) => events.push(ev),
				Err(TryRecvError::Empty) => break,
				Err(TryRecvError::Disconnected) => { disconnected = true; break },
			}
		}

		let handled = events.len();
		let mut fresh = false;
		let mut result = None;
		for ev in events {
			match ev {
				Event::Reading(reading) => {
					for observer in self.sample_observers.iter_mut() {
						observer(&reading);
					}
					if let Some(active) = self.active.as_mut() {
						active.data.append(reading);
					}
					fresh = true;
				},
				Event::Finished(r) => result = Some(r),
			}
		}

		// The thread is gone without saying how the run ended
		if disconnected && result.is_none() {
			result = Some(RunResult::failed(Error::ThreadPanicked, vec![Phase::Failed, Phase::Closed]));
		}

		if fresh {
			self.autosave();
		}
		if let Some(r) = result {
			self.finish(r);
		}
		handled
	}

	fn autosave(&self) {
		if let (Some(path), Some(active)) = (&self.autosave, &self.active) {
			let file = RunFile::new(active.settings.meta_row(active.start_time), &active.data);
			if let Err(e) = store::write(path, &file) {
				warn!("Backup to {} failed: {}", path.display(), e);
			}
		}
	}

	fn finish(&mut self, result:RunResult) {
		let mut active = match self.active.take() {
			Some(a) => a,
			None => return,
		};
		if let Some(handle) = active.handle.take() {
			if handle.join().is_err() {
				warn!("Run thread panicked");
			}
		}

		for observer in self.finished_observers.iter_mut() {
			observer(&result);
		}
		if self.finished.is_some() {
			warn!("Previous run was never taken, replacing it");
		}
		self.finished = Some(FinishedRun{ settings: active.settings, start_time: active.start_time, data: active.data, result });
	}

}

impl Drop for RunController {

	fn drop(&mut self) {
		if let Some(mut active) = self.active.take() {
			self.cancel.cancel();
			if let Some(handle) = active.handle.take() {
				let _ = handle.join();
			}
		}
	}

}
