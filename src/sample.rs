//! Measurement records produced by the sequencer.
//!
//! A [`Sample`] is one probe reading on the switching stream. Its resistance is derived
//! when the sample is created and a zero current is refused there, so every `Sample`
//! in existence carries a finite resistance. [`TraceSample`] holds the auxiliary
//! streams (oscilloscope pulse current, object temperature), where nothing is derived.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};
use crate::table::{Cell, Table};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Polarity {
    Pos,
    Neg,
}

impl Polarity {
    pub fn flip(self) -> Self {
        match self {
            Polarity::Pos => Polarity::Neg,
            Polarity::Neg => Polarity::Pos,
        }
    }

    pub fn of(value: f64) -> Self {
        if value < 0.0 { Polarity::Neg } else { Polarity::Pos }
    }

    pub fn index(self) -> usize {
        match self {
            Polarity::Pos => 0,
            Polarity::Neg => 1,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Polarity::Pos => "POS",
            Polarity::Neg => "NEG",
        }
    }
}

impl fmt::Display for Polarity {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Polarity {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "POS" => Ok(Polarity::Pos),
            "NEG" => Ok(Polarity::Neg),
            other => Err(Error::Table(format!("unknown polarity '{}'", other))),
        }
    }
}

/// A row type that can live in a [`crate::accumulator::SampleAccumulator`].
pub trait Record: Clone {
    const COLUMNS: &'static [&'static str];

    fn timestamp(&self) -> f64;
    fn polarity(&self) -> Polarity;
    fn to_row(&self) -> Vec<Cell>;
    fn from_row(row: &[Cell]) -> Result<Self>;

    fn to_table<'a, I>(records: I) -> Table
    where
        I: IntoIterator<Item = &'a Self>,
        Self: 'a,
    {
        Table {
            columns: Self::COLUMNS.iter().map(|c| c.to_string()).collect(),
            rows: records.into_iter().map(|r| r.to_row()).collect(),
        }
    }
}

fn float_at(row: &[Cell], idx: usize, name: &str) -> Result<f64> {
    row.get(idx)
        .and_then(|c| c.as_f64())
        .ok_or_else(|| Error::Table(format!("column {} is not a number", name)))
}

fn text_at<'a>(row: &'a [Cell], idx: usize, name: &str) -> Result<&'a str> {
    row.get(idx)
        .and_then(|c| c.as_str())
        .ok_or_else(|| Error::Table(format!("column {} is not text", name)))
}

#[derive(Debug, Clone, PartialEq)]
pub struct Sample {
    timestamp: f64,
    current: f64,
    primary_voltage: f64,
    secondary_voltage: Option<f64>,
    polarity: Polarity,
    channel_tag: String,
    resistance: f64,
    secondary_resistance: Option<f64>,
}

impl Sample {
    /// Creates a probe sample and derives its resistances.
    ///
    /// A zero current is an error rather than an infinite resistance. Any other reading
    /// that does not give a finite resistance (NaN, infinities, a current so small the
    /// quotient overflows) is refused as an invalid reading.
    pub fn new(
        timestamp: f64,
        current: f64,
        primary_voltage: f64,
        secondary_voltage: Option<f64>,
        polarity: Polarity,
        channel_tag: &str,
    ) -> Result<Self> {
        if current == 0.0 {
            return Err(Error::DivisionByZero { timestamp, channel_tag: channel_tag.to_owned() });
        }

        let resistance = primary_voltage / current;
        let secondary_resistance = secondary_voltage.map(|v| v / current);
        if !resistance.is_finite() || secondary_resistance.map_or(false, |r| !r.is_finite()) {
            return Err(Error::InvalidReading {
                timestamp,
                channel_tag: channel_tag.to_owned(),
                detail: format!("{} V, {:?} V at {} A", primary_voltage, secondary_voltage, current),
            });
        }

        Ok(Self {
            timestamp,
            current,
            primary_voltage,
            secondary_voltage,
            polarity,
            channel_tag: channel_tag.to_owned(),
            resistance,
            secondary_resistance,
        })
    }

    pub fn timestamp(&self) -> f64 { self.timestamp }
    pub fn current(&self) -> f64 { self.current }
    pub fn primary_voltage(&self) -> f64 { self.primary_voltage }
    pub fn secondary_voltage(&self) -> Option<f64> { self.secondary_voltage }
    pub fn polarity(&self) -> Polarity { self.polarity }
    pub fn channel_tag(&self) -> &str { &self.channel_tag }
    pub fn resistance(&self) -> f64 { self.resistance }
    pub fn secondary_resistance(&self) -> Option<f64> { self.secondary_resistance }
}

impl Record for Sample {
    const COLUMNS: &'static [&'static str] =
        &["timestamp", "current", "primary_voltage", "secondary_voltage", "polarity", "channel_tag"];

    fn timestamp(&self) -> f64 { self.timestamp }
    fn polarity(&self) -> Polarity { self.polarity }

    fn to_row(&self) -> Vec<Cell> {
        vec![
            Cell::Float(self.timestamp),
            Cell::Float(self.current),
            Cell::Float(self.primary_voltage),
            self.secondary_voltage.into(),
            Cell::Text(self.polarity.to_string()),
            Cell::Text(self.channel_tag.clone()),
        ]
    }

    fn from_row(row: &[Cell]) -> Result<Self> {
        let secondary_voltage = match row.get(3) {
            Some(Cell::Empty) => None,
            _ => Some(float_at(row, 3, "secondary_voltage")?),
        };
        Sample::new(
            float_at(row, 0, "timestamp")?,
            float_at(row, 1, "current")?,
            float_at(row, 2, "primary_voltage")?,
            secondary_voltage,
            text_at(row, 4, "polarity")?.parse()?,
            text_at(row, 5, "channel_tag")?,
        )
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TraceSample {
    pub timestamp: f64,
    pub value: f64,
    pub polarity: Polarity,
    pub channel_tag: String,
}

impl TraceSample {
    pub fn new(timestamp: f64, value: f64, polarity: Polarity, channel_tag: &str) -> Self {
        Self { timestamp, value, polarity, channel_tag: channel_tag.to_owned() }
    }
}

impl Record for TraceSample {
    const COLUMNS: &'static [&'static str] = &["timestamp", "value", "polarity", "channel_tag"];

    fn timestamp(&self) -> f64 { self.timestamp }
    fn polarity(&self) -> Polarity { self.polarity }

    fn to_row(&self) -> Vec<Cell> {
        vec![
            Cell::Float(self.timestamp),
            Cell::Float(self.value),
            Cell::Text(self.polarity.to_string()),
            Cell::Text(self.channel_tag.clone()),
        ]
    }

    fn from_row(row: &[Cell]) -> Result<Self> {
        Ok(TraceSample::new(
            float_at(row, 0, "timestamp")?,
            float_at(row, 1, "value")?,
            text_at(row, 2, "polarity")?.parse()?,
            text_at(row, 3, "channel_tag")?,
        ))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ErrorKind;

    #[test]
    fn resistance_is_derived_at_creation() {
        let s = Sample::new(1.5, 100e-6, 2.5e-3, Some(-1.0e-4), Polarity::Pos, "switching").unwrap();
        assert!((s.resistance() - 25.0).abs() < 1e-9);
        assert!((s.secondary_resistance().unwrap() + 1.0).abs() < 1e-9);
    }

    #[test]
    fn zero_current_is_refused() {
        let e = Sample::new(0.1, 0.0, 1.0, None, Polarity::Neg, "switching").unwrap_err();
        assert_eq!(e.kind(), ErrorKind::DivisionByZero);
    }

    #[test]
    fn non_finite_readings_are_refused() {
        for (current, voltage, secondary) in [
            (f64::NAN, 1.0, None),
            (1e-320, 1.0, None),
            (1e-4, f64::INFINITY, None),
            (1e-4, 1e-2, Some(f64::NAN)),
        ] {
            let e = Sample::new(0.1, current, voltage, secondary, Polarity::Pos, "switching").unwrap_err();
            assert_eq!(e.kind(), ErrorKind::Instrument, "{} {} {:?}", current, voltage, secondary);
            assert!(matches!(e, Error::InvalidReading { .. }));
        }
    }

    #[test]
    fn negative_current_keeps_sign() {
        let s = Sample::new(0.0, -1e-3, 0.5, None, Polarity::Neg, "delta").unwrap();
        assert!((s.resistance() + 500.0).abs() < 1e-9);
    }

    #[test]
    fn polarity_helpers() {
        assert_eq!(Polarity::of(-0.2), Polarity::Neg);
        assert_eq!(Polarity::of(0.2), Polarity::Pos);
        assert_eq!(Polarity::Pos.flip(), Polarity::Neg);
        assert_eq!("NEG".parse::<Polarity>().unwrap(), Polarity::Neg);
        assert!("neg".parse::<Polarity>().is_err());
    }

    #[test]
    fn missing_secondary_voltage_is_empty_cell() {
        let s = Sample::new(0.2, 1e-4, 1e-3, None, Polarity::Pos, "switching").unwrap();
        let row = s.to_row();
        assert_eq!(row[3], Cell::Empty);
        assert_eq!(Sample::from_row(&row).unwrap(), s);
    }

    #[test]
    fn trace_row_rejects_bad_polarity() {
        let row = vec![Cell::Float(0.0), Cell::Float(1.0), Cell::Text("UP".into()), Cell::Text("scope".into())];
        assert!(TraceSample::from_row(&row).is_err());
    }
}
