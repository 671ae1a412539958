//! Journal sizing policies.
//!
//! Policies are written the way operators configure virtual pools: `min`,
//! a multiplier such as `0.25x`, a percentage such as `25%`, or a fixed
//! size such as `50GB` or `1TB`. Every policy is floored at the configured
//! minimum journal size.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use thiserror::Error;

const BYTES_PER_MB: u64 = 1024 * 1024;
const BYTES_PER_GB: u64 = 1024 * BYTES_PER_MB;
const BYTES_PER_TB: u64 = 1024 * BYTES_PER_GB;
const SIZE_UNITS: [(&str, u64); 4] = [
    ("TB", BYTES_PER_TB),
    ("GB", BYTES_PER_GB),
    ("MB", BYTES_PER_MB),
    ("B", 1),
];

/// Raised when a journal policy string cannot be parsed.
#[derive(Clone, Debug, Error, Eq, PartialEq)]
#[error("invalid journal policy {policy:?}: expected min, <n>x, <n>% or a size such as 50GB")]
pub struct PolicyError {
    /// Policy text as supplied.
    pub policy: String,
}

/// Parsed journal sizing policy.
#[derive(Clone, Copy, Debug, Deserialize, Eq, PartialEq, Serialize)]
#[serde(try_from = "String", into = "String")]
pub enum JournalSizePolicy {
    /// The configured minimum journal size.
    Minimum,
    /// Source capacity multiplied by `hundredths / 100`.
    Multiplier {
        /// Multiplier in hundredths, so `0.25x` is 25.
        hundredths: u64,
    },
    /// Percentage of the source capacity.
    Percent(u64),
    /// Fixed size in bytes.
    Fixed(u64),
}

impl JournalSizePolicy {
    /// Returns the journal size the policy requires for `source_capacity`,
    /// never less than `minimum`.
    #[must_use]
    pub const fn journal_size(self, source_capacity: u64, minimum: u64) -> u64 {
        let sized = match self {
            Self::Minimum => minimum,
            Self::Multiplier { hundredths } | Self::Percent(hundredths) => {
                source_capacity.saturating_mul(hundredths).div_ceil(100)
            }
            Self::Fixed(bytes) => bytes,
        };
        if sized < minimum { minimum } else { sized }
    }

    fn parse_hundredths(text: &str) -> Option<u64> {
        let (whole, fraction) = text.split_once('.').unwrap_or((text, ""));
        if fraction.len() > 2 || (whole.is_empty() && fraction.is_empty()) {
            return None;
        }
        let whole_value = if whole.is_empty() {
            0
        } else {
            whole.parse::<u64>().ok()?
        };
        let fraction_value = match fraction.len() {
            0 => 0,
            1 => fraction.parse::<u64>().ok()?.checked_mul(10)?,
            _ => fraction.parse::<u64>().ok()?,
        };
        whole_value.checked_mul(100)?.checked_add(fraction_value)
    }

    fn parse_sized(text: &str) -> Option<u64> {
        let upper = text.to_ascii_uppercase();
        let (digits, unit) = SIZE_UNITS.into_iter().find_map(|(suffix, unit)| {
            upper
                .strip_suffix(suffix)
                .map(|digits| (digits.trim().to_owned(), unit))
        })?;
        digits.parse::<u64>().ok()?.checked_mul(unit)
    }
}

impl FromStr for JournalSizePolicy {
    type Err = PolicyError;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        let trimmed = value.trim();
        let invalid = || PolicyError {
            policy: value.to_owned(),
        };
        if trimmed.eq_ignore_ascii_case("min") {
            return Ok(Self::Minimum);
        }
        if let Some(multiplier) = trimmed
            .strip_suffix('x')
            .or_else(|| trimmed.strip_suffix('X'))
        {
            return Self::parse_hundredths(multiplier)
                .filter(|hundredths| *hundredths > 0)
                .map(|hundredths| Self::Multiplier { hundredths })
                .ok_or_else(invalid);
        }
        if let Some(percent) = trimmed.strip_suffix('%') {
            return percent
                .trim()
                .parse::<u64>()
                .ok()
                .filter(|value| *value > 0)
                .map(Self::Percent)
                .ok_or_else(invalid);
        }
        Self::parse_sized(trimmed)
            .filter(|bytes| *bytes > 0)
            .map(Self::Fixed)
            .ok_or_else(invalid)
    }
}

impl TryFrom<String> for JournalSizePolicy {
    type Error = PolicyError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        value.parse()
    }
}

impl From<JournalSizePolicy> for String {
    fn from(value: JournalSizePolicy) -> Self {
        value.to_string()
    }
}

impl fmt::Display for JournalSizePolicy {
    fn fmt(&self, formatter: &mut fmt::Formatter<'_>) -> fmt::Result {
        match *self {
            Self::Minimum => formatter.write_str("min"),
            Self::Multiplier { hundredths } => {
                let whole = hundredths.checked_div(100).unwrap_or_default();
                let fraction = hundredths.checked_rem(100).unwrap_or_default();
                write!(formatter, "{whole}.{fraction:02}x")
            }
            Self::Percent(percent) => write!(formatter, "{percent}%"),
            Self::Fixed(bytes) => {
                let (suffix, unit) = SIZE_UNITS
                    .into_iter()
                    .find(|(_, unit)| bytes.checked_rem(*unit) == Some(0))
                    .unwrap_or(("B", 1));
                let count = bytes.checked_div(unit).unwrap_or(bytes);
                write!(formatter, "{count}{suffix}")
            }
        }
    }
}
