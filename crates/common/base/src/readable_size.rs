// Copyright 2025 Crrow
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//      http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.

//! Human readable byte sizes such as `64MiB` or `512KB`.
//!
//! Both decimal-looking (`KB`, `MB`) and binary (`KiB`, `MiB`) suffixes are
//! accepted and are interpreted as powers of 1024.

use std::{fmt, str::FromStr};

use serde::{Deserialize, Deserializer, Serialize, Serializer, de};
use snafu::{OptionExt, ResultExt, Snafu};

const UNIT: u64 = 1;
const KIB: u64 = UNIT * 1024;
const MIB: u64 = KIB * 1024;
const GIB: u64 = MIB * 1024;
const TIB: u64 = GIB * 1024;

#[derive(Debug, Snafu)]
#[snafu(visibility(pub))]
pub enum ParseSizeError {
    #[snafu(display("Invalid size string: {input:?}"))]
    Malformed { input: String },

    #[snafu(display("Invalid number in size string {input:?}"))]
    Number {
        input:  String,
        source: std::num::ParseIntError,
    },

    #[snafu(display("Unknown size unit {unit:?}"))]
    Unit { unit: String },

    #[snafu(display("Size {input:?} overflows u64"))]
    Overflow { input: String },
}

/// A byte count that (de)serializes as a readable string.
#[derive(
    Clone,
    Copy,
    PartialEq,
    Eq,
    PartialOrd,
    Ord,
    Hash,
    Default,
    derive_more::From,
    derive_more::Into,
)]
pub struct ReadableSize(pub u64);

impl ReadableSize {
    #[must_use]
    pub const fn b(count: u64) -> Self { Self(count) }

    #[must_use]
    pub const fn kb(count: u64) -> Self { Self(count * KIB) }

    #[must_use]
    pub const fn mb(count: u64) -> Self { Self(count * MIB) }

    #[must_use]
    pub const fn gb(count: u64) -> Self { Self(count * GIB) }

    #[must_use]
    pub const fn as_bytes(self) -> u64 { self.0 }

    #[must_use]
    pub const fn as_mb(self) -> u64 { self.0 / MIB }
}

impl fmt::Display for ReadableSize {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let size = self.0;
        if size == 0 {
            write!(f, "0B")
        } else if size % TIB == 0 {
            write!(f, "{}TiB", size / TIB)
        } else if size % GIB == 0 {
            write!(f, "{}GiB", size / GIB)
        } else if size % MIB == 0 {
            write!(f, "{}MiB", size / MIB)
        } else if size % KIB == 0 {
            write!(f, "{}KiB", size / KIB)
        } else {
            write!(f, "{size}B")
        }
    }
}

impl fmt::Debug for ReadableSize {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result { write!(f, "{self}") }
}

impl FromStr for ReadableSize {
    type Err = ParseSizeError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let trimmed = s.trim();
        let split_at = trimmed
            .find(|c: char| !c.is_ascii_digit())
            .unwrap_or(trimmed.len());
        let (digits, unit) = trimmed.split_at(split_at);
        if digits.is_empty() {
            return MalformedSnafu { input: s }.fail();
        }
        let count: u64 = digits.parse().context(NumberSnafu { input: s })?;

        let multiplier = match unit.trim().to_ascii_uppercase().as_str() {
            "" | "B" => UNIT,
            "K" | "KB" | "KIB" => KIB,
            "M" | "MB" | "MIB" => MIB,
            "G" | "GB" | "GIB" => GIB,
            "T" | "TB" | "TIB" => TIB,
            _ => return UnitSnafu { unit }.fail(),
        };

        let bytes = count
            .checked_mul(multiplier)
            .context(OverflowSnafu { input: s })?;
        Ok(Self(bytes))
    }
}

impl Serialize for ReadableSize {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.to_string())
    }
}

impl<'de> Deserialize<'de> for ReadableSize {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        s.parse().map_err(de::Error::custom)
    }
}

#[cfg(test)]
mod tests {
    use test_case::test_case;

    use super::*;

    #[test_case("0", 0)]
    #[test_case("250", 250)]
    #[test_case("4KB", 4 * KIB)]
    #[test_case("64MiB", 64 * MIB)]
    #[test_case("64 mb", 64 * MIB)]
    #[test_case("2G", 2 * GIB)]
    fn parse_readable_size(input: &str, expected: u64) {
        assert_eq!(input.parse::<ReadableSize>().unwrap().as_bytes(), expected);
    }

    #[test_case("")]
    #[test_case("MiB")]
    #[test_case("12parsecs")]
    fn parse_rejects_garbage(input: &str) {
        assert!(input.parse::<ReadableSize>().is_err());
    }

    #[test]
    fn display_picks_largest_exact_unit() {
        assert_eq!(ReadableSize::mb(64).to_string(), "64MiB");
        assert_eq!(ReadableSize::kb(1536).to_string(), "1536KiB");
        assert_eq!(ReadableSize::b(1001).to_string(), "1001B");
    }

    #[test]
    fn serde_uses_string_form() {
        let json = serde_json::to_string(&ReadableSize::mb(64)).unwrap();
        assert_eq!(json, "\"64MiB\"");
        let back: ReadableSize = serde_json::from_str(&json).unwrap();
        assert_eq!(back, ReadableSize::mb(64));
    }
}
