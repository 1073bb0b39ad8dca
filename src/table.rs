// Column-oriented export tables handed to the persistence collaborator

use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum Cell {
    Float(f64),
    Text(String),
    Empty,
}

impl Cell {
    pub fn as_f64(&self) -> Option<f64> {
        match self {
            Cell::Float(x) => Some(*x),
            _ => None,
        }
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            Cell::Text(s) => Some(s),
            _ => None,
        }
    }
}

impl From<f64> for Cell {
    fn from(x: f64) -> Self { Cell::Float(x) }
}

impl From<Option<f64>> for Cell {
    fn from(x: Option<f64>) -> Self { x.map(Cell::Float).unwrap_or(Cell::Empty) }
}

impl From<&str> for Cell {
    fn from(s: &str) -> Self { Cell::Text(s.to_owned()) }
}

impl From<String> for Cell {
    fn from(s: String) -> Self { Cell::Text(s) }
}

impl From<bool> for Cell {
    fn from(b: bool) -> Self { Cell::Text(if b { "true" } else { "false" }.to_owned()) }
}

#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct Table {
    pub columns: Vec<String>,
    pub rows: Vec<Vec<Cell>>,
}

impl Table {
    pub fn new(columns: &[&str]) -> Self {
        Self { columns: columns.iter().map(|c| c.to_string()).collect(), rows: vec![] }
    }

    /// Builds a single-row table from (column, value) pairs.
    pub fn single_row(pairs: Vec<(&str, Cell)>) -> Self {
        let (columns, row): (Vec<String>, Vec<Cell>) = pairs.into_iter().map(|(c, v)| (c.to_owned(), v)).unzip();
        Self { columns, rows: vec![row] }
    }

    pub fn push_row(&mut self, row: Vec<Cell>) -> Result<()> {
        if row.len() != self.columns.len() {
            return Err(Error::Table(format!("row has {} cells, table has {} columns", row.len(), self.columns.len())));
        }
        self.rows.push(row);
        Ok(())
    }

    pub fn column(&self, name: &str) -> Option<usize> {
        self.columns.iter().position(|c| c == name)
    }

    /// Looks up a cell of the first row by column name.
    pub fn first(&self, name: &str) -> Option<&Cell> {
        let idx = self.column(name)?;
        self.rows.first().and_then(|r| r.get(idx))
    }

    pub fn len(&self) -> usize {
        self.rows.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rows.is_empty()
    }

    pub fn expect_columns(&self, columns: &[&str]) -> Result<()> {
        if self.columns.iter().map(|c| c.as_str()).eq(columns.iter().copied()) {
            Ok(())
        } else {
            Err(Error::Table(format!("expected columns {:?}, found {:?}", columns, self.columns)))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn push_row_checks_width() {
        let mut t = Table::new(&["a", "b"]);
        assert!(t.push_row(vec![Cell::Float(1.0), Cell::Empty]).is_ok());
        assert!(t.push_row(vec![Cell::Float(1.0)]).is_err());
        assert_eq!(t.len(), 1);
    }

    #[test]
    fn single_row_lookup() {
        let t = Table::single_row(vec![("pulse_type", "Pulse Current".into()), ("loop_count", Cell::Float(3.0))]);
        assert_eq!(t.first("pulse_type").and_then(|c| c.as_str()), Some("Pulse Current"));
        assert_eq!(t.first("loop_count").and_then(|c| c.as_f64()), Some(3.0));
        assert!(t.first("missing").is_none());
    }

    #[test]
    fn cells_survive_json() {
        let row = vec![Cell::Float(0.25), Cell::Text("POS".into()), Cell::Empty];
        let json = serde_json::to_string(&row).unwrap();
        assert_eq!(json, "[0.25,\"POS\",null]");
        let back: Vec<Cell> = serde_json::from_str(&json).unwrap();
        assert_eq!(back, row);
    }
}
