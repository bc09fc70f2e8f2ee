use std::cmp::Ordering;
use std::fmt;
use std::hash::{Hash, Hasher};
use std::str::FromStr;

use serde::{Deserialize, Deserializer, Serialize, Serializer};
use thiserror::Error;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("invalid version '{input}': {reason}")]
pub struct VersionParseError {
    pub input: String,
    pub reason: String,
}

/// Dotted numeric product version. Missing trailing components compare as
/// zero, so `1.2` and `1.2.0` are the same version.
#[derive(Debug, Clone)]
pub struct ProductVersion {
    parts: Vec<u64>,
}

impl ProductVersion {
    pub fn parse(input: &str) -> Result<Self, VersionParseError> {
        let fail = |reason: &str| VersionParseError {
            input: input.to_string(),
            reason: reason.to_string(),
        };

        let trimmed = input.trim();
        if trimmed.is_empty() {
            return Err(fail("version must not be empty"));
        }

        let mut parts = Vec::new();
        for (index, segment) in trimmed.split('.').enumerate() {
            if segment.is_empty() {
                return Err(fail(&format!("component {} is empty", index + 1)));
            }
            if !segment.bytes().all(|b| b.is_ascii_digit()) {
                return Err(fail(&format!(
                    "component '{segment}' is not a non-negative integer"
                )));
            }
            let value = segment
                .parse::<u64>()
                .map_err(|_| fail(&format!("component '{segment}' is out of range")))?;
            parts.push(value);
        }

        Ok(Self { parts })
    }

    pub fn parts(&self) -> &[u64] {
        &self.parts
    }

    fn significant(&self) -> &[u64] {
        let len = self
            .parts
            .iter()
            .rposition(|part| *part != 0)
            .map(|idx| idx + 1)
            .unwrap_or(0);
        &self.parts[..len]
    }
}

pub fn compare_versions(left: &str, right: &str) -> Result<Ordering, VersionParseError> {
    let left = ProductVersion::parse(left)?;
    let right = ProductVersion::parse(right)?;
    Ok(left.cmp(&right))
}

impl Ord for ProductVersion {
    fn cmp(&self, other: &Self) -> Ordering {
        let width = self.parts.len().max(other.parts.len());
        for index in 0..width {
            let left = self.parts.get(index).copied().unwrap_or(0);
            let right = other.parts.get(index).copied().unwrap_or(0);
            match left.cmp(&right) {
                Ordering::Equal => continue,
                unequal => return unequal,
            }
        }
        Ordering::Equal
    }
}

impl PartialOrd for ProductVersion {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl PartialEq for ProductVersion {
    fn eq(&self, other: &Self) -> bool {
        self.cmp(other) == Ordering::Equal
    }
}

impl Eq for ProductVersion {}

impl Hash for ProductVersion {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.significant().hash(state);
    }
}

impl fmt::Display for ProductVersion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let rendered = self
            .parts
            .iter()
            .map(u64::to_string)
            .collect::<Vec<_>>()
            .join(".");
        f.write_str(&rendered)
    }
}

impl FromStr for ProductVersion {
    type Err = VersionParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::parse(s)
    }
}

impl Serialize for ProductVersion {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.collect_str(self)
    }
}

impl<'de> Deserialize<'de> for ProductVersion {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let raw = String::deserialize(deserializer)?;
        Self::parse(&raw).map_err(serde::de::Error::custom)
    }
}
