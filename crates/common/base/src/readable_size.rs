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

//! Human readable byte sizes such as `512KiB` or `64MB`.
//!
//! Units are binary: `KB` and `KiB` both mean 1024 bytes.

use std::{fmt, str::FromStr};

use serde::{Deserialize, Deserializer, Serialize, Serializer, de};
use snafu::{OptionExt, Snafu, ensure};

pub const B: u64 = 1;
pub const KIB: u64 = B * 1024;
pub const MIB: u64 = KIB * 1024;
pub const GIB: u64 = MIB * 1024;
pub const TIB: u64 = GIB * 1024;

#[derive(Debug, Snafu, PartialEq, Eq)]
#[snafu(visibility(pub))]
pub enum ParseSizeError {
    #[snafu(display("Invalid size string: {input:?}"))]
    InvalidNumber { input: String },

    #[snafu(display("Unknown size unit {unit:?} in {input:?}"))]
    UnknownUnit { input: String, unit: String },

    #[snafu(display("Size {input:?} overflows u64"))]
    Overflow { input: String },
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, PartialOrd, Ord, Hash, derive_more::From)]
pub struct ReadableSize(pub u64);

impl ReadableSize {
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

    /// Byte count clamped to `usize`, for buffer capacities.
    #[must_use]
    pub fn as_usize(self) -> usize { usize::try_from(self.0).unwrap_or(usize::MAX) }
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

impl FromStr for ReadableSize {
    type Err = ParseSizeError;

    fn from_str(input: &str) -> Result<Self, Self::Err> {
        let trimmed = input.trim();
        let split = trimmed
            .find(|c: char| !(c.is_ascii_digit() || c == '.'))
            .unwrap_or(trimmed.len());
        let (number, unit) = trimmed.split_at(split);

        let unit_bytes = match unit.trim().to_ascii_uppercase().as_str() {
            "" | "B" => B,
            "K" | "KB" | "KIB" => KIB,
            "M" | "MB" | "MIB" => MIB,
            "G" | "GB" | "GIB" => GIB,
            "T" | "TB" | "TIB" => TIB,
            other => {
                return UnknownUnitSnafu {
                    input,
                    unit: other.to_string(),
                }
                .fail();
            }
        };

        if let Ok(whole) = number.parse::<u64>() {
            return whole
                .checked_mul(unit_bytes)
                .map(Self)
                .context(OverflowSnafu { input });
        }

        let fractional: f64 = number
            .parse()
            .ok()
            .context(InvalidNumberSnafu { input })?;
        ensure!(
            fractional.is_finite() && fractional >= 0.0,
            InvalidNumberSnafu { input }
        );
        #[allow(clippy::cast_precision_loss)]
        let bytes = fractional * unit_bytes as f64;
        #[allow(clippy::cast_precision_loss)]
        let limit = u64::MAX as f64;
        ensure!(bytes < limit, OverflowSnafu { input });
        #[allow(clippy::cast_possible_truncation, clippy::cast_sign_loss)]
        let bytes = bytes as u64;
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
        struct SizeVisitor;

        impl de::Visitor<'_> for SizeVisitor {
            type Value = ReadableSize;

            fn expecting(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.write_str("a byte count or a size string like \"64MiB\"")
            }

            fn visit_u64<E: de::Error>(self, value: u64) -> Result<Self::Value, E> {
                Ok(ReadableSize(value))
            }

            fn visit_i64<E: de::Error>(self, value: i64) -> Result<Self::Value, E> {
                u64::try_from(value)
                    .map(ReadableSize)
                    .map_err(|_| E::custom("size must not be negative"))
            }

            fn visit_str<E: de::Error>(self, value: &str) -> Result<Self::Value, E> {
                value.parse().map_err(E::custom)
            }
        }

        deserializer.deserialize_any(SizeVisitor)
    }
}

#[cfg(test)]
mod tests {
    use test_case::test_case;

    use super::*;

    #[test_case("0", 0)]
    #[test_case("17", 17)]
    #[test_case("512KiB", 512 * KIB)]
    #[test_case("512kb", 512 * KIB)]
    #[test_case("64MB", 64 * MIB)]
    #[test_case("1.5GiB", 3 * GIB / 2)]
    #[test_case(" 2 T ", 2 * TIB)]
    fn test_parse(input: &str, expected: u64) {
        assert_eq!(input.parse::<ReadableSize>().unwrap().as_bytes(), expected);
    }

    #[test]
    fn test_parse_errors() {
        assert!(matches!(
            "12XB".parse::<ReadableSize>(),
            Err(ParseSizeError::UnknownUnit { .. })
        ));
        assert!(matches!(
            "MB".parse::<ReadableSize>(),
            Err(ParseSizeError::InvalidNumber { .. })
        ));
        assert!(matches!(
            "99999999999TiB".parse::<ReadableSize>(),
            Err(ParseSizeError::Overflow { .. })
        ));
    }

    #[test]
    fn test_display() {
        assert_eq!(ReadableSize(0).to_string(), "0B");
        assert_eq!(ReadableSize::kb(512).to_string(), "512KiB");
        assert_eq!(ReadableSize::mb(100).to_string(), "100MiB");
        assert_eq!(ReadableSize::gb(3).to_string(), "3GiB");
        assert_eq!(ReadableSize(1500).to_string(), "1500B");
    }

    #[test]
    fn test_serde() {
        let size: ReadableSize = serde_json::from_str("\"64MiB\"").unwrap();
        assert_eq!(size, ReadableSize::mb(64));
        let size: ReadableSize = serde_json::from_str("4096").unwrap();
        assert_eq!(size, ReadableSize::kb(4));
        assert_eq!(serde_json::to_string(&ReadableSize::kb(8)).unwrap(), "\"8KiB\"");
    }
}
