use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

use crate::model::UnknownVariant;

/// Whether a round reveals itself once everybody has voted.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AutoRevealPolicy {
    /// The host always reveals by hand.
    #[default]
    Off,
    /// Reveal as soon as every participant, host included, has voted in the round.
    All,
}

impl fmt::Display for AutoRevealPolicy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Off => f.write_str("off"),
            Self::All => f.write_str("all"),
        }
    }
}

impl FromStr for AutoRevealPolicy {
    type Err = UnknownVariant;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "off" | "false" | "none" => Ok(Self::Off),
            "all" | "true" => Ok(Self::All),
            other => Err(UnknownVariant {
                kind: "auto-reveal policy",
                value: other.to_string(),
            }),
        }
    }
}

/// Vote completeness for the current round of one session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct RoundTally {
    /// Votes in the round, including those of participants who have left.
    pub votes_cast: i64,
    pub total_participants: i64,
}

impl RoundTally {
    pub fn all_voted(&self) -> bool {
        self.votes_cast >= self.total_participants
    }

    pub fn should_auto_reveal(&self, policy: AutoRevealPolicy) -> bool {
        match policy {
            AutoRevealPolicy::Off => false,
            AutoRevealPolicy::All => self.total_participants > 0 && self.all_voted(),
        }
    }
}
