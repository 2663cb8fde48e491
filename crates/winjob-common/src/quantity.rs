//! Quantity parsing and representation.
//!
//! Supports the human-readable forms used in limit configuration:
//! - Memory: "128Mi", "1Gi", "512M", "1G", "1024" (bytes)
//! - CPU rate: "12.5%" (percent of all cycles), "1250" (cycles per 10,000)
//! - Duration: "250ms", "30s", "5min", "1h", "1.5s"

use std::fmt;
use std::str::FromStr;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::{WinjobError, WinjobResult};

/// CPU rates are expressed as cycles per this many cycles.
pub const CPU_RATE_SCALE: u64 = 10_000;

/// A quantity with a value and unit.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Quantity {
    /// The raw value in the smallest unit (bytes, cycles per 10,000, nanoseconds).
    value: u64,
    /// The type of quantity.
    kind: QuantityKind,
}

/// The type of quantity.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum QuantityKind {
    /// Memory in bytes.
    Memory,
    /// CPU rate in cycles per 10,000.
    CpuRate,
    /// Duration in nanoseconds.
    Duration,
}

impl Quantity {
    /// Create a memory quantity from bytes.
    #[must_use]
    pub const fn memory_bytes(bytes: u64) -> Self {
        Self {
            value: bytes,
            kind: QuantityKind::Memory,
        }
    }

    /// Create a memory quantity from mebibytes (MiB).
    #[must_use]
    pub const fn memory_mebibytes(mib: u64) -> Self {
        Self::memory_bytes(mib * 1024 * 1024)
    }

    /// Create a memory quantity from gibibytes (GiB).
    #[must_use]
    pub const fn memory_gibibytes(gib: u64) -> Self {
        Self::memory_bytes(gib * 1024 * 1024 * 1024)
    }

    /// Create a CPU rate from cycles per 10,000.
    #[must_use]
    pub const fn cpu_cycles(cycles: u64) -> Self {
        Self {
            value: cycles,
            kind: QuantityKind::CpuRate,
        }
    }

    /// Create a duration quantity.
    #[must_use]
    #[allow(clippy::cast_possible_truncation)]
    pub const fn duration(d: Duration) -> Self {
        Self {
            value: d.as_nanos() as u64,
            kind: QuantityKind::Duration,
        }
    }

    /// Get the raw value.
    #[must_use]
    pub const fn value(&self) -> u64 {
        self.value
    }

    /// Get the quantity kind.
    #[must_use]
    pub const fn kind(&self) -> QuantityKind {
        self.kind
    }

    /// Memory in bytes.
    #[must_use]
    pub const fn as_bytes(&self) -> u64 {
        self.value
    }

    /// CPU rate in cycles per 10,000.
    #[must_use]
    pub const fn as_cycles(&self) -> u64 {
        self.value
    }

    /// The quantity as a [`Duration`].
    #[must_use]
    pub const fn as_duration(&self) -> Duration {
        Duration::from_nanos(self.value)
    }

    fn invalid(s: &str) -> WinjobError {
        WinjobError::InvalidQuantity {
            value: s.to_string(),
        }
    }

    /// Parse a memory quantity string.
    ///
    /// Formats (binary - powers of 1024):
    /// - "128Ki" -> 128 * 1024 bytes
    /// - "128Mi" -> 128 * 1024^2 bytes
    /// - "1Gi" -> 1 * 1024^3 bytes
    ///
    /// Formats (decimal - powers of 1000):
    /// - "128k" -> 128 * 1000 bytes
    /// - "128M" -> 128 * 1000^2 bytes
    /// - "1G" -> 1 * 1000^3 bytes
    ///
    /// Plain number is bytes.
    pub fn parse_memory(s: &str) -> WinjobResult<Self> {
        let s = s.trim();

        let binary_suffixes = [
            ("Ki", 1024u64),
            ("Mi", 1024 * 1024),
            ("Gi", 1024 * 1024 * 1024),
            ("Ti", 1024 * 1024 * 1024 * 1024),
        ];

        for (suffix, multiplier) in binary_suffixes {
            if let Some(stripped) = s.strip_suffix(suffix) {
                let value: u64 = stripped.parse().map_err(|_| Self::invalid(s))?;
                let bytes = value.checked_mul(multiplier).ok_or_else(|| Self::invalid(s))?;
                return Ok(Self::memory_bytes(bytes));
            }
        }

        let decimal_suffixes = [
            ("k", 1000u64),
            ("m", 1000 * 1000), // lowercase 'm' is mega here, not milli
            ("M", 1000 * 1000),
            ("g", 1000 * 1000 * 1000),
            ("G", 1000 * 1000 * 1000),
            ("t", 1000 * 1000 * 1000 * 1000),
            ("T", 1000 * 1000 * 1000 * 1000),
        ];

        for (suffix, multiplier) in decimal_suffixes {
            if let Some(stripped) = s.strip_suffix(suffix) {
                let value: u64 = stripped.parse().map_err(|_| Self::invalid(s))?;
                let bytes = value.checked_mul(multiplier).ok_or_else(|| Self::invalid(s))?;
                return Ok(Self::memory_bytes(bytes));
            }
        }

        let bytes: u64 = s.parse().map_err(|_| Self::invalid(s))?;
        Ok(Self::memory_bytes(bytes))
    }

    /// Parse a CPU rate string.
    ///
    /// Formats:
    /// - "12.34%" -> 1234 cycles per 10,000
    /// - "1234" -> 1234 cycles per 10,000
    ///
    /// Rates above 100% are rejected.
    #[allow(
        clippy::cast_possible_truncation,
        clippy::cast_sign_loss,
        clippy::cast_precision_loss
    )]
    pub fn parse_cpu_rate(s: &str) -> WinjobResult<Self> {
        let s = s.trim();

        let cycles = if let Some(stripped) = s.strip_suffix('%') {
            let percent: f64 = stripped.trim().parse().map_err(|_| Self::invalid(s))?;
            if !percent.is_finite() || percent < 0.0 {
                return Err(Self::invalid(s));
            }
            (percent * 100.0).round() as u64
        } else {
            s.parse::<u64>().map_err(|_| Self::invalid(s))?
        };

        if cycles > CPU_RATE_SCALE {
            return Err(Self::invalid(s));
        }
        Ok(Self::cpu_cycles(cycles))
    }

    /// Parse a duration string.
    ///
    /// Suffixes: "ns", "us", "ms", "s", "min", "h". A plain number is seconds.
    /// Fractions are accepted ("1.5s").
    #[allow(
        clippy::cast_possible_truncation,
        clippy::cast_sign_loss,
        clippy::cast_precision_loss
    )]
    pub fn parse_duration(s: &str) -> WinjobResult<Self> {
        const NANOS_PER_SEC: u64 = 1_000_000_000;

        let s = s.trim();

        let suffixes = [
            ("ns", 1u64),
            ("us", 1_000),
            ("ms", 1_000_000),
            ("min", 60 * NANOS_PER_SEC),
            ("s", NANOS_PER_SEC),
            ("h", 3600 * NANOS_PER_SEC),
        ];

        let (number, scale) = suffixes
            .iter()
            .find_map(|(suffix, scale)| s.strip_suffix(suffix).map(|n| (n.trim(), *scale)))
            .unwrap_or((s, NANOS_PER_SEC));

        let nanos = if let Ok(whole) = number.parse::<u64>() {
            whole.checked_mul(scale).ok_or_else(|| Self::invalid(s))?
        } else {
            let value: f64 = number.parse().map_err(|_| Self::invalid(s))?;
            let nanos = (value * scale as f64).round();
            if !nanos.is_finite() || nanos < 0.0 || nanos > u64::MAX as f64 {
                return Err(Self::invalid(s));
            }
            nanos as u64
        };

        Ok(Self {
            value: nanos,
            kind: QuantityKind::Duration,
        })
    }
}

impl fmt::Display for Quantity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.kind {
            QuantityKind::Memory => {
                const GI: u64 = 1024 * 1024 * 1024;
                const MI: u64 = 1024 * 1024;
                const KI: u64 = 1024;

                if self.value >= GI && self.value % GI == 0 {
                    write!(f, "{}Gi", self.value / GI)
                } else if self.value >= MI && self.value % MI == 0 {
                    write!(f, "{}Mi", self.value / MI)
                } else if self.value >= KI && self.value % KI == 0 {
                    write!(f, "{}Ki", self.value / KI)
                } else {
                    write!(f, "{}", self.value)
                }
            }
            QuantityKind::CpuRate => {
                let whole = self.value / 100;
                let frac = self.value % 100;
                if frac == 0 {
                    write!(f, "{whole}%")
                } else {
                    write!(f, "{whole}.{frac:02}%")
                }
            }
            QuantityKind::Duration => write!(f, "{:?}", self.as_duration()),
        }
    }
}

impl FromStr for Quantity {
    type Err = WinjobError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let t = s.trim();
        if t.ends_with('%') {
            Self::parse_cpu_rate(t)
        } else if t.ends_with('s') || t.ends_with("min") || t.ends_with('h') {
            Self::parse_duration(t)
        } else {
            Self::parse_memory(t)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    #[test]
    fn parse_memory_binary() {
        assert_eq!(Quantity::parse_memory("1Ki").unwrap().value, 1024);
        assert_eq!(
            Quantity::parse_memory("128Mi").unwrap().value,
            128 * 1024 * 1024
        );
        assert_eq!(
            Quantity::parse_memory("1Gi").unwrap().value,
            1024 * 1024 * 1024
        );
    }

    #[test]
    fn parse_memory_decimal() {
        assert_eq!(Quantity::parse_memory("1k").unwrap().value, 1000);
        assert_eq!(
            Quantity::parse_memory("128M").unwrap().value,
            128 * 1000 * 1000
        );
        assert_eq!(
            Quantity::parse_memory("1G").unwrap().value,
            1000 * 1000 * 1000
        );
    }

    #[test]
    fn parse_memory_bytes() {
        assert_eq!(Quantity::parse_memory("1024").unwrap().value, 1024);
        assert!(Quantity::parse_memory("lots").is_err());
        assert!(Quantity::parse_memory("99999999999Ti").is_err());
    }

    #[test]
    fn parse_cpu_rate_forms() {
        assert_eq!(Quantity::parse_cpu_rate("12.34%").unwrap().as_cycles(), 1234);
        assert_eq!(Quantity::parse_cpu_rate("5%").unwrap().as_cycles(), 500);
        assert_eq!(Quantity::parse_cpu_rate("1500").unwrap().as_cycles(), 1500);
        assert!(Quantity::parse_cpu_rate("101%").is_err());
        assert!(Quantity::parse_cpu_rate("-1%").is_err());
        assert!(Quantity::parse_cpu_rate("20000").is_err());
    }

    #[test]
    fn parse_duration_forms() {
        let d = |s| Quantity::parse_duration(s).unwrap().as_duration();
        assert_eq!(d("250ms"), Duration::from_millis(250));
        assert_eq!(d("30s"), Duration::from_secs(30));
        assert_eq!(d("5min"), Duration::from_secs(300));
        assert_eq!(d("1h"), Duration::from_secs(3600));
        assert_eq!(d("1.5s"), Duration::from_millis(1500));
        assert_eq!(d("10"), Duration::from_secs(10));
        assert!(Quantity::parse_duration("-3s").is_err());
        assert!(Quantity::parse_duration("soon").is_err());
    }

    #[test]
    fn from_str_dispatches_on_suffix() {
        let q: Quantity = "64Mi".parse().unwrap();
        assert_eq!(q.kind(), QuantityKind::Memory);
        let q: Quantity = "50%".parse().unwrap();
        assert_eq!(q.kind(), QuantityKind::CpuRate);
        let q: Quantity = "100ms".parse().unwrap();
        assert_eq!(q.kind(), QuantityKind::Duration);
    }

    #[test]
    fn display_memory() {
        assert_eq!(Quantity::memory_gibibytes(1).to_string(), "1Gi");
        assert_eq!(Quantity::memory_mebibytes(512).to_string(), "512Mi");
        assert_eq!(Quantity::memory_bytes(1024).to_string(), "1Ki");
        assert_eq!(Quantity::memory_bytes(500).to_string(), "500");
    }

    #[test]
    fn display_cpu_rate() {
        assert_eq!(Quantity::cpu_cycles(500).to_string(), "5%");
        assert_eq!(Quantity::cpu_cycles(1234).to_string(), "12.34%");
        assert_eq!(Quantity::cpu_cycles(1205).to_string(), "12.05%");
    }

    proptest! {
        #[test]
        fn cpu_rate_display_parses_back(cycles in 0u64..=CPU_RATE_SCALE) {
            let q = Quantity::cpu_cycles(cycles);
            prop_assert_eq!(Quantity::parse_cpu_rate(&q.to_string()).unwrap(), q);
        }

        #[test]
        fn mebibytes_parse(mib in 0u64..1_000_000) {
            let q = Quantity::parse_memory(&format!("{mib}Mi")).unwrap();
            prop_assert_eq!(q.as_bytes(), mib * 1024 * 1024);
        }
    }
}
