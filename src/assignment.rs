//! Routing tables for the switch matrix.
//!
//! A [`SwitchAssignment`] names which physical terminal of the sample carries each
//! electrical role. Assignments are written the way they are noted on the bench,
//! `{I+: B, I-: F}`, and are validated when they are built: unknown roles, malformed
//! terminals, duplicated roles and one terminal wired to two roles are all rejected
//! here rather than at the switch box.

use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

use lazy_static::lazy_static;
use regex::Regex;
use serde::{Deserialize, Deserializer, Serialize, Serializer};

lazy_static! {
    static ref BRACES_RE: Regex = Regex::new(r"^\s*\{(.*)\}\s*$").unwrap();
    static ref ENTRY_RE: Regex  = Regex::new(r"^\s*([A-Za-z0-9+\-]+)\s*:\s*([A-Za-z0-9]+)\s*$").unwrap();
}

#[derive(Debug, Clone, PartialEq, thiserror::Error)]
#[error("{0}")]
pub struct RoutingError(String);

fn routing_err(msg: impl Into<String>) -> RoutingError {
    RoutingError(msg.into())
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum TerminalRole {
    CurrentHigh,
    CurrentLow,
    V1High,
    V1Low,
    V2High,
    V2Low,
}

impl TerminalRole {
    pub const ALL: [TerminalRole; 6] = [
        TerminalRole::CurrentHigh,
        TerminalRole::CurrentLow,
        TerminalRole::V1High,
        TerminalRole::V1Low,
        TerminalRole::V2High,
        TerminalRole::V2Low,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            TerminalRole::CurrentHigh => "I+",
            TerminalRole::CurrentLow  => "I-",
            TerminalRole::V1High      => "V1+",
            TerminalRole::V1Low       => "V1-",
            TerminalRole::V2High      => "V2+",
            TerminalRole::V2Low       => "V2-",
        }
    }
}

impl fmt::Display for TerminalRole {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for TerminalRole {
    type Err = RoutingError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        TerminalRole::ALL
            .iter()
            .find(|r| r.as_str() == s.trim())
            .copied()
            .ok_or_else(|| routing_err(format!("unknown terminal role '{}'", s.trim())))
    }
}

/// A physical contact on the switch matrix: a lettered pad or a numbered line.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum Terminal {
    Letter(char),
    Index(u8),
}

impl fmt::Display for Terminal {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            Terminal::Letter(c) => write!(f, "{}", c),
            Terminal::Index(n)  => write!(f, "{}", n),
        }
    }
}

impl FromStr for Terminal {
    type Err = RoutingError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let s = s.trim();
        let mut chars = s.chars();
        match (chars.next(), chars.next()) {
            (Some(c), None) if c.is_ascii_alphabetic() => Ok(Terminal::Letter(c.to_ascii_uppercase())),
            _ => s
                .parse::<u8>()
                .map(Terminal::Index)
                .map_err(|_| routing_err(format!("'{}' is not a terminal letter or index", s))),
        }
    }
}

// Splits "{K: V, K: V}" into validated (key, value) string pairs
fn entries(s: &str) -> Result<Vec<(String, String)>, RoutingError> {
    let body = match BRACES_RE.captures(s) {
        Some(cap) => cap.get(1).map(|m| m.as_str()).unwrap_or(""),
        None => s,
    };
    if body.trim().is_empty() {
        return Ok(vec![]);
    }

    body.split(',')
        .map(|entry| match ENTRY_RE.captures(entry) {
            Some(cap) => Ok((cap[1].to_owned(), cap[2].to_owned())),
            None => Err(routing_err(format!("malformed entry '{}'", entry.trim()))),
        })
        .collect()
}

/// Role to terminal routing for one measurement path.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct SwitchAssignment {
    routes: BTreeMap<TerminalRole, Terminal>,
}

impl SwitchAssignment {
    pub fn new<I>(routes: I) -> Result<Self, RoutingError>
    where
        I: IntoIterator<Item = (TerminalRole, Terminal)>,
    {
        let mut map: BTreeMap<TerminalRole, Terminal> = BTreeMap::new();
        for (role, terminal) in routes {
            if map.contains_key(&role) {
                return Err(routing_err(format!("role {} assigned twice", role)));
            }
            if let Some((other, _)) = map.iter().find(|(_, t)| **t == terminal) {
                return Err(routing_err(format!("terminal {} wired to both {} and {}", terminal, other, role)));
            }
            map.insert(role, terminal);
        }
        Ok(Self { routes: map })
    }

    /// Builds an assignment from textual pairs, e.g. `&[("I+", "B"), ("I-", "F")]`.
    pub fn from_pairs(pairs: &[(&str, &str)]) -> Result<Self, RoutingError> {
        let parsed = pairs
            .iter()
            .map(|(r, t)| Ok((r.parse::<TerminalRole>()?, t.parse::<Terminal>()?)))
            .collect::<Result<Vec<_>, RoutingError>>()?;
        Self::new(parsed)
    }

    pub fn get(&self, role: TerminalRole) -> Option<Terminal> {
        self.routes.get(&role).copied()
    }

    pub fn iter(&self) -> impl Iterator<Item = (TerminalRole, Terminal)> + '_ {
        self.routes.iter().map(|(r, t)| (*r, *t))
    }

    pub fn len(&self) -> usize {
        self.routes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.routes.is_empty()
    }

    pub fn require(&self, roles: &[TerminalRole]) -> Result<(), RoutingError> {
        match roles.iter().find(|r| !self.routes.contains_key(r)) {
            Some(missing) => Err(routing_err(format!("{} is not routed in {}", missing, self))),
            None => Ok(()),
        }
    }
}

impl fmt::Display for SwitchAssignment {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        let body = self
            .routes
            .iter()
            .map(|(r, t)| format!("{}: {}", r, t))
            .collect::<Vec<String>>()
            .join(", ");
        write!(f, "{{{}}}", body)
    }
}

impl FromStr for SwitchAssignment {
    type Err = RoutingError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let pairs = entries(s)?;
        let parsed = pairs
            .iter()
            .map(|(r, t)| Ok((r.parse::<TerminalRole>()?, t.parse::<Terminal>()?)))
            .collect::<Result<Vec<_>, RoutingError>>()?;
        Self::new(parsed)
    }
}

/// Concatenates a list of assignments the way the metadata row stores it.
pub fn list_to_string(list: &[SwitchAssignment]) -> String {
    list.iter().map(|a| a.to_string()).collect::<Vec<String>>().concat()
}

/// Reference-resistor settings of the balance box, keyed by sample terminal.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct ResistanceAssignment {
    settings: BTreeMap<Terminal, u32>,
}

impl ResistanceAssignment {
    pub fn new<I: IntoIterator<Item = (Terminal, u32)>>(settings: I) -> Self {
        Self { settings: settings.into_iter().collect() }
    }

    pub fn iter(&self) -> impl Iterator<Item = (Terminal, u32)> + '_ {
        self.settings.iter().map(|(t, r)| (*t, *r))
    }

    pub fn is_empty(&self) -> bool {
        self.settings.is_empty()
    }
}

impl fmt::Display for ResistanceAssignment {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        let body = self
            .settings
            .iter()
            .map(|(t, r)| format!("{}: {}", t, r))
            .collect::<Vec<String>>()
            .join(", ");
        write!(f, "{{{}}}", body)
    }
}

impl FromStr for ResistanceAssignment {
    type Err = RoutingError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let mut settings = BTreeMap::new();
        for (t, r) in entries(s)? {
            let terminal: Terminal = t.parse()?;
            let value: u32 = r.parse().map_err(|_| routing_err(format!("'{}' is not a resistance setting", r)))?;
            if settings.insert(terminal, value).is_some() {
                return Err(routing_err(format!("terminal {} set twice", terminal)));
            }
        }
        Ok(Self { settings })
    }
}

macro_rules! serde_via_str {
    ($ty:ty) => {
        impl Serialize for $ty {
            fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
                serializer.serialize_str(&self.to_string())
            }
        }

        impl<'de> Deserialize<'de> for $ty {
            fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
                let s = String::deserialize(deserializer)?;
                s.parse().map_err(serde::de::Error::custom)
            }
        }
    };
}

serde_via_str!(SwitchAssignment);
serde_via_str!(ResistanceAssignment);

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_bench_notation() {
        let a: SwitchAssignment = "{I+: A, I-: E, V1+: B, V1-: D, V2+: C, V2-: G}".parse().unwrap();
        assert_eq!(a.len(), 6);
        assert_eq!(a.get(TerminalRole::V1High), Some(Terminal::Letter('B')));
        assert_eq!(a.to_string(), "{I+: A, I-: E, V1+: B, V1-: D, V2+: C, V2-: G}");
    }

    #[test]
    fn display_uses_canonical_role_order() {
        let a = SwitchAssignment::from_pairs(&[("I-", "f"), ("I+", "b")]).unwrap();
        assert_eq!(a.to_string(), "{I+: B, I-: F}");
    }

    #[test]
    fn rejects_unknown_role() {
        let e = "{I+: A, V3+: C}".parse::<SwitchAssignment>().unwrap_err();
        assert!(e.to_string().contains("V3+"));
    }

    #[test]
    fn rejects_shared_terminal() {
        assert!(SwitchAssignment::from_pairs(&[("I+", "A"), ("V1+", "A")]).is_err());
    }

    #[test]
    fn rejects_duplicate_role() {
        assert!("{I+: A, I+: B}".parse::<SwitchAssignment>().is_err());
    }

    #[test]
    fn numbered_terminals() {
        let a: SwitchAssignment = "{I+: 1, I-: 12}".parse().unwrap();
        assert_eq!(a.get(TerminalRole::CurrentLow), Some(Terminal::Index(12)));
    }

    #[test]
    fn require_reports_missing_role() {
        let a: SwitchAssignment = "{I+: B, I-: F}".parse().unwrap();
        assert!(a.require(&[TerminalRole::CurrentHigh, TerminalRole::CurrentLow]).is_ok());
        let e = a.require(&[TerminalRole::V1High]).unwrap_err();
        assert!(e.to_string().starts_with("V1+"));
    }

    #[test]
    fn resistance_assignment_round_trip() {
        let r: ResistanceAssignment = "{A: 0, B: 3, H: 0}".parse().unwrap();
        assert_eq!(r.to_string(), "{A: 0, B: 3, H: 0}");
        assert!("{A: x}".parse::<ResistanceAssignment>().is_err());
    }

    #[test]
    fn list_concatenates() {
        let l: Vec<SwitchAssignment> = vec!["{I+: A, I-: E}".parse().unwrap(), "{I+: B, I-: F}".parse().unwrap()];
        assert_eq!(list_to_string(&l), "{I+: A, I-: E}{I+: B, I-: F}");
    }

    #[test]
    fn serde_as_string() {
        let a: SwitchAssignment = "{I+: B, I-: F}".parse().unwrap();
        let json = serde_json::to_string(&a).unwrap();
        assert_eq!(json, "\"{I+: B, I-: F}\"");
        let back: SwitchAssignment = serde_json::from_str(&json).unwrap();
        assert_eq!(back, a);
    }
}
