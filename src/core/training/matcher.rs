//! Object-name matching between device reports and scenario expectations.
//!
//! Device-side names are inconsistent ("Snap3DInteractable - A fire
//! extinguisher"), so the default policy is permissive: case-folded,
//! punctuation-folded, substring in either direction. The stricter token mode
//! requires every expected word to appear as a whole word.

use once_cell::sync::Lazy;
use regex::Regex;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

static NON_ALPHANUMERIC: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"[^\p{L}\p{N}\s]+").expect("static pattern is valid"));

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MatchMode {
    /// Either name contains the other.
    #[default]
    Substring,
    /// Every token of the expected name is a token of the received name.
    Token,
}

impl fmt::Display for MatchMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            MatchMode::Substring => write!(f, "substring"),
            MatchMode::Token => write!(f, "token"),
        }
    }
}

impl FromStr for MatchMode {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "substring" => Ok(MatchMode::Substring),
            "token" => Ok(MatchMode::Token),
            other => Err(format!(
                "Invalid object match mode '{other}', expected 'substring' or 'token'"
            )),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct MatchPolicy {
    pub mode: MatchMode,
    pub strip_punctuation: bool,
}

impl Default for MatchPolicy {
    fn default() -> Self {
        Self {
            mode: MatchMode::Substring,
            strip_punctuation: true,
        }
    }
}

impl MatchPolicy {
    /// Case-fold, optionally replace punctuation with spaces, collapse whitespace.
    pub fn normalize(&self, name: &str) -> String {
        let lowered = name.to_lowercase();
        let folded = if self.strip_punctuation {
            NON_ALPHANUMERIC.replace_all(&lowered, " ").into_owned()
        } else {
            lowered
        };
        folded.split_whitespace().collect::<Vec<_>>().join(" ")
    }

    /// Whether `received` names the `expected` object. Empty names never match.
    pub fn matches(&self, expected: &str, received: &str) -> bool {
        let expected = self.normalize(expected);
        let received = self.normalize(received);
        if expected.is_empty() || received.is_empty() {
            return false;
        }
        match self.mode {
            MatchMode::Substring => received.contains(&expected) || expected.contains(&received),
            MatchMode::Token => {
                let tokens: Vec<&str> = received.split(' ').collect();
                expected.split(' ').all(|word| tokens.contains(&word))
            }
        }
    }

    /// First expected name matched by `received`, if any.
    pub fn find_match<'a>(&self, expected: &'a [String], received: &str) -> Option<&'a str> {
        expected
            .iter()
            .find(|candidate| self.matches(candidate, received))
            .map(String::as_str)
    }
}
