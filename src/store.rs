//! Run files on disk.
//!
//! A run is saved as one CBOR document holding the one-row `meta_data` table and a table
//! per stream. User-supplied names are normalized first: known data extensions and stream
//! suffixes are stripped and `.cbor` is appended. No name means nothing is written.

use std::collections::BTreeMap;
use std::fs::{self, File};
use std::io::{BufReader, BufWriter, Write};
use std::path::{Path, PathBuf};

use log::{info, warn};
use serde::{Deserialize, Serialize};

use crate::error::Result;
use crate::sink::RunData;
use crate::survey::SurveyResult;
use crate::table::Table;

pub const EXTENSION: &str = "cbor";

const DATA_SUFFIXES: &[&str] = &[".txt", ".hdf", ".h5", ".hd5", ".cbor", "_scope", "_tec"];
const SURVEY_SUFFIXES: &[&str] = &[".txt", "_2wires", "_4wires"];

fn strip_all(name:&str, suffixes:&[&str]) -> Option<String> {
	let mut stem = name.trim();
	'strip: loop {
		for suffix in suffixes.iter() {
			if let Some(s) = stem.strip_suffix(*suffix) {
				stem = s;
				continue 'strip;
			}
		}
		break;
	}
	if stem.is_empty() || stem.ends_with('/') || stem.ends_with('\\') {
		None
	} else {
		Some(stem.to_owned())
	}
}

/// The user's name without data extensions or stream suffixes.
pub fn stem(name:&str) -> Option<String> {
	strip_all(name, DATA_SUFFIXES)
}

pub fn normalize_name(name:&str) -> Option<String> {
	stem(name).map(|s| format!("{}.{}", s, EXTENSION))
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RunFile {
	pub meta_data: Table,
	pub tables: BTreeMap<String, Table>,
}

impl RunFile {

	pub fn new(meta_data:Table, data:&RunData) -> Self {
		Self{ meta_data, tables: data.tables() }
	}

	pub fn data(&self) -> Result<RunData> {
		RunData::from_tables(&self.tables)
	}

}

pub fn write<P: AsRef<Path>>(path:P, file:&RunFile) -> Result<()> {
	let mut writer = BufWriter::new(File::create(path)?);
	serde_cbor::to_writer(&mut writer, file)?;
	writer.flush()?;
	Ok(())
}

pub fn read<P: AsRef<Path>>(path:P) -> Result<RunFile> {
	let reader = BufReader::new(File::open(path)?);
	Ok(serde_cbor::from_reader(reader)?)
}

/// Saves under the normalized name, or discards the data with a warning when no usable
/// name is given.
pub fn save(name:Option<&str>, file:&RunFile) -> Result<Option<PathBuf>> {
	let path = match name.and_then(normalize_name) {
		Some(n) => PathBuf::from(n),
		None => {
			warn!("No file name, data not saved");
			return Ok(None);
		},
	};
	write(&path, file)?;
	info!("Data saved as {}", path.display());
	Ok(Some(path))
}

fn write_column(path:&Path, values:&[f64]) -> Result<()> {
	let mut writer = BufWriter::new(File::create(path)?);
	for v in values.iter() {
		writeln!(writer, "{:e}", v)?;
	}
	writer.flush()?;
	Ok(())
}

/// Writes `<name>_2wires.txt` and `<name>_4wires.txt`, one resistance per line.
pub fn save_survey(name:Option<&str>, survey:&SurveyResult) -> Result<Option<(PathBuf, PathBuf)>> {
	let stem = match name.and_then(|n| strip_all(n, SURVEY_SUFFIXES)) {
		Some(s) => s,
		None => {
			warn!("No file name, survey not saved");
			return Ok(None);
		},
	};
	let two = PathBuf::from(format!("{}_2wires.txt", stem));
	let four = PathBuf::from(format!("{}_4wires.txt", stem));
	write_column(&two, &survey.two_wire)?;
	write_column(&four, &survey.four_wire)?;
	info!("Survey saved as {} and {}", two.display(), four.display());
	Ok(Some((two, four)))
}

pub fn read_column<P: AsRef<Path>>(path:P) -> Result<Vec<f64>> {
	fs::read_to_string(path)?
		.lines()
		.filter(|l| !l.trim().is_empty())
		.map(|l| l.trim().parse::<f64>().map_err(|e| crate::Error::Table(format!("'{}': {}", l, e))))
		.collect()
}
