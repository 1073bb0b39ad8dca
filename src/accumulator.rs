//! Append-only per-stream sample store with a look-back window for live display.

use crate::error::Result;
use crate::sample::{Polarity, Record, Sample, TraceSample};
use crate::table::Table;
use crate::utils::{LinearFit, LinearFitProblem};

pub struct SampleAccumulator<R: Record = Sample> {
    stream: String,
    records: Vec<R>,
    // True while every append has had a timestamp no earlier than the previous one
    in_order: bool,
}

impl<R: Record> SampleAccumulator<R> {

    pub fn new(stream: &str) -> Self {
        Self { stream: stream.to_owned(), records: vec![], in_order: true }
    }

    pub fn stream(&self) -> &str { &self.stream }
    pub fn len(&self) -> usize { self.records.len() }
    pub fn is_empty(&self) -> bool { self.records.is_empty() }
    pub fn as_slice(&self) -> &[R] { &self.records }
    pub fn iter(&self) -> std::slice::Iter<'_, R> { self.records.iter() }

    pub fn append(&mut self, record: R) {
        let t = record.timestamp();
        if t.is_nan() {
            self.in_order = false;
        } else if let Some(last) = self.records.last() {
            if !(t >= last.timestamp()) {
                self.in_order = false;
            }
        }
        self.records.push(record);
    }

    pub fn latest(&self) -> Option<f64> {
        self.records.last().map(|r| r.timestamp())
    }

    /// Records with `timestamp >= now - max_age`, in append order.
    pub fn window(&self, now: f64, max_age: f64) -> Vec<&R> {
        let cutoff = now - max_age;
        if self.in_order {
            let start = self.records.partition_point(|r| r.timestamp() < cutoff);
            self.records[start..].iter().collect()
        } else {
            self.records.iter().filter(|r| r.timestamp() >= cutoff).collect()
        }
    }

    /// Window anchored on the most recent record.
    pub fn recent(&self, max_age: f64) -> Vec<&R> {
        match self.latest() {
            Some(now) => self.window(now, max_age),
            None => vec![],
        }
    }

    pub fn of_polarity(&self, polarity: Polarity) -> impl Iterator<Item = &R> + '_ {
        self.records.iter().filter(move |r| r.polarity() == polarity)
    }

    pub fn export(&self) -> Table {
        R::to_table(self.records.iter())
    }

    pub fn from_table(stream: &str, table: &Table) -> Result<Self> {
        table.expect_columns(R::COLUMNS)?;
        let mut acc = Self::new(stream);
        for row in table.rows.iter() {
            acc.append(R::from_row(row)?);
        }
        Ok(acc)
    }
}

impl SampleAccumulator<Sample> {

    /// `(timestamps, resistances)` of one polarity inside the display window.
    pub fn series(&self, polarity: Polarity, now: f64, max_age: f64) -> (Vec<f64>, Vec<f64>) {
        self.window(now, max_age)
            .into_iter()
            .filter(|s| s.polarity() == polarity)
            .map(|s| (s.timestamp(), s.resistance()))
            .unzip()
    }

    pub fn trend(&self, polarity: Polarity) -> Option<LinearFit> {
        LinearFitProblem::new(self.of_polarity(polarity).map(|s| (s.timestamp(), s.resistance()))).solve()
    }
}

impl SampleAccumulator<TraceSample> {

    pub fn series(&self, polarity: Polarity, now: f64, max_age: f64) -> (Vec<f64>, Vec<f64>) {
        self.window(now, max_age)
            .into_iter()
            .filter(|s| s.polarity == polarity)
            .map(|s| (s.timestamp, s.value))
            .unzip()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    fn sample(t: f64, polarity: Polarity) -> Sample {
        Sample::new(t, 1e-4, 1e-4 * (100.0 + t), Some(2e-4), polarity, "switching").unwrap()
    }

    #[test]
    fn window_is_inclusive_at_cutoff() {
        let mut acc = SampleAccumulator::new("switching");
        for t in [0.0, 1.0, 2.0, 3.0] {
            acc.append(sample(t, Polarity::Pos));
        }
        let w: Vec<f64> = acc.window(3.0, 1.0).iter().map(|s| s.timestamp()).collect();
        assert_eq!(w, vec![2.0, 3.0]);
        assert!(acc.window(10.0, 1.0).is_empty());
        assert_eq!(acc.recent(100.0).len(), 4);
    }

    #[test]
    fn out_of_order_appends_fall_back_to_filter() {
        let mut acc = SampleAccumulator::new("switching");
        for t in [5.0, 1.0, 6.0, 2.0] {
            acc.append(sample(t, Polarity::Pos));
        }
        let w: Vec<f64> = acc.window(6.0, 1.5).iter().map(|s| s.timestamp()).collect();
        assert_eq!(w, vec![5.0, 6.0]);
    }

    #[test]
    fn series_splits_polarity() {
        let mut acc = SampleAccumulator::new("switching");
        acc.append(sample(0.0, Polarity::Pos));
        acc.append(sample(1.0, Polarity::Neg));
        acc.append(sample(2.0, Polarity::Pos));
        let (t, r) = acc.series(Polarity::Pos, 2.0, 10.0);
        assert_eq!(t, vec![0.0, 2.0]);
        assert!((r[1] - 102.0).abs() < 1e-9);
    }

    #[test]
    fn trend_follows_drift() {
        let mut acc = SampleAccumulator::new("switching");
        for i in 0..10 {
            acc.append(sample(i as f64, Polarity::Neg));
        }
        let fit = acc.trend(Polarity::Neg).unwrap();
        assert!((fit.slope - 1.0).abs() < 1e-6);
        assert!(acc.trend(Polarity::Pos).is_none());
    }

    #[test]
    fn from_table_rejects_foreign_columns() {
        let table = Table::new(&["t", "value"]);
        assert!(SampleAccumulator::<Sample>::from_table("switching", &table).is_err());
    }

    #[test]
    fn trace_export_round_trip() {
        let mut acc: SampleAccumulator<TraceSample> = SampleAccumulator::new("temperature");
        acc.append(TraceSample::new(0.5, 21.3, Polarity::Pos, "temperature"));
        acc.append(TraceSample::new(0.9, 21.4, Polarity::Neg, "temperature"));
        let back = SampleAccumulator::<TraceSample>::from_table("temperature", &acc.export()).unwrap();
        assert_eq!(back.as_slice(), acc.as_slice());
    }

    fn arb_sample() -> impl Strategy<Value = Sample> {
        (
            -1.0e3..1.0e3f64,
            prop_oneof![-1.0e-2..-1.0e-9f64, 1.0e-9..1.0e-2f64],
            -10.0..10.0f64,
            proptest::option::of(-10.0..10.0f64),
            any::<bool>(),
            "[a-z]{1,8}",
        )
            .prop_map(|(t, i, v, v2, pos, tag)| {
                let polarity = if pos { Polarity::Pos } else { Polarity::Neg };
                Sample::new(t, i, v, v2, polarity, &tag).unwrap()
            })
    }

    proptest! {
        #[test]
        fn window_matches_definition(samples in prop::collection::vec(arb_sample(), 0..60), now in -1.0e3..1.0e3f64, max_age in 0.0..2.0e3f64) {
            let mut acc = SampleAccumulator::new("switching");
            for s in samples.iter() {
                acc.append(s.clone());
            }
            let expected: Vec<&Sample> = samples.iter().filter(|s| s.timestamp() >= now - max_age).collect();
            prop_assert_eq!(acc.window(now, max_age), expected);
        }

        #[test]
        fn sorted_window_matches_definition(mut ts in prop::collection::vec(0.0..100.0f64, 0..60), now in 0.0..120.0f64, max_age in 0.0..50.0f64) {
            ts.sort_by(|a, b| a.partial_cmp(b).unwrap());
            let mut acc = SampleAccumulator::new("switching");
            for t in ts.iter() {
                acc.append(sample(*t, Polarity::Pos));
            }
            let got: Vec<f64> = acc.window(now, max_age).iter().map(|s| s.timestamp()).collect();
            let expected: Vec<f64> = ts.iter().copied().filter(|t| *t >= now - max_age).collect();
            prop_assert_eq!(got, expected);
        }

        #[test]
        fn export_then_parse_reproduces_samples(samples in prop::collection::vec(arb_sample(), 0..40)) {
            let mut acc = SampleAccumulator::new("switching");
            for s in samples.iter() {
                acc.append(s.clone());
            }
            let back = SampleAccumulator::<Sample>::from_table("switching", &acc.export()).unwrap();
            prop_assert_eq!(back.as_slice(), samples.as_slice());
        }
    }
}
