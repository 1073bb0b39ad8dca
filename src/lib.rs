
// Errors shared by every module, with the coarse kind callers branch on
pub mod error;

// Terminal roles, switch matrix terminals, and the "{I+: A, I-: E}" assignment notation
pub mod assignment;

// One measured point and the derived resistances
pub mod sample;

// Column tables used to save and reload runs
pub mod table;

// Least squares line through a series, used for live drift estimates
pub mod utils;

// Append-only per-stream sample store with a look-back window
pub mod accumulator;

// Raw front panel settings, their validation and the typed result
pub mod settings;

// Instrument capabilities, the bench of drivers, and the session that guarantees they get closed
pub mod instruments;

// Measurement protocols as data: switching, delta and pump-probe
pub mod protocol;

// Destinations for readings while a run is in progress
pub mod sink;

// Runs a protocol against an opened session
pub mod sequencer;

// Background run thread with stop, polling and observers
pub mod controller;

// Two-wire and four-wire resistance survey
pub mod survey;

// Run files on disk
pub mod store;

pub use error::{ConfigIssue, Error, ErrorKind, Result};
pub use assignment::{ResistanceAssignment, SwitchAssignment, Terminal, TerminalRole};
pub use sample::{Polarity, Sample, TraceSample};
pub use settings::{validate, RawSettings, Settings};
pub use instruments::{Bench, Session};
pub use protocol::Protocol;
pub use sink::{LiveDataSink, Reading, RunData};
pub use sequencer::{CancelFlag, Phase, RunResult};
pub use controller::{FinishedRun, RunController};
pub use store::RunFile;
