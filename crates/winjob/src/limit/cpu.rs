//! CPU rate control modes.

use serde::{Deserialize, Serialize};

use crate::api::info::{CpuControlFlags, CpuRateControl};

/// One of the mutually exclusive CPU rate control modes.
///
/// Rates are cycles per 10 000 (percent times 100).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CpuRate {
    /// Hard cap on the portion of cycles the job may use (1-10000).
    HardCap(u32),
    /// Scheduling weight relative to other jobs (1-9).
    Weight(u32),
    /// Reserved minimum and allowed maximum rates.
    MinMax {
        /// Minimum rate.
        min: u16,
        /// Maximum rate.
        max: u16,
    },
}

impl CpuRate {
    /// The control flag selecting this mode.
    #[must_use]
    pub const fn mode(self) -> CpuControlFlags {
        match self {
            Self::HardCap(_) => CpuControlFlags::HARD_CAP,
            Self::Weight(_) => CpuControlFlags::WEIGHT_BASED,
            Self::MinMax { .. } => CpuControlFlags::MIN_MAX_RATE,
        }
    }

    /// The shared 32-bit value: min in the low half, max in the high half.
    #[must_use]
    pub const fn raw_value(self) -> u32 {
        match self {
            Self::HardCap(v) | Self::Weight(v) => v,
            Self::MinMax { min, max } => (min as u32) | ((max as u32) << 16),
        }
    }

    /// Decode a control block. Modes are checked as hard cap, weight, min/max.
    #[must_use]
    #[allow(clippy::cast_possible_truncation)]
    pub fn from_control(control: &CpuRateControl) -> Option<Self> {
        let flags = control.control_flags;
        if flags.contains(CpuControlFlags::HARD_CAP) {
            Some(Self::HardCap(control.value))
        } else if flags.contains(CpuControlFlags::WEIGHT_BASED) {
            Some(Self::Weight(control.value))
        } else if flags.contains(CpuControlFlags::MIN_MAX_RATE) {
            Some(Self::MinMax {
                min: (control.value & 0xffff) as u16,
                max: (control.value >> 16) as u16,
            })
        } else {
            None
        }
    }

    /// Write this mode into a control block, replacing any other mode.
    pub(crate) fn write(self, control: &mut CpuRateControl) {
        control.value = self.raw_value();
        control.control_flags = self.mode() | CpuControlFlags::ENABLE | CpuControlFlags::NOTIFY;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    #[test]
    fn min_max_packs_little_endian() {
        let rate = CpuRate::MinMax {
            min: 0x1234,
            max: 0x5678,
        };
        assert_eq!(rate.raw_value(), 0x5678_1234);
        assert_eq!(rate.raw_value().to_le_bytes(), [0x34, 0x12, 0x78, 0x56]);
    }

    #[test]
    fn write_replaces_previous_mode() {
        let mut control = CpuRateControl::default();
        CpuRate::HardCap(1234).write(&mut control);
        CpuRate::Weight(7).write(&mut control);
        assert_eq!(
            control.control_flags,
            CpuControlFlags::ENABLE | CpuControlFlags::NOTIFY | CpuControlFlags::WEIGHT_BASED
        );
        assert_eq!(CpuRate::from_control(&control), Some(CpuRate::Weight(7)));
    }

    #[test]
    fn serializes_as_tagged_object() {
        let json = serde_json::to_string(&CpuRate::MinMax { min: 10, max: 20 }).unwrap();
        insta::assert_snapshot!(json, @r#"{"min_max":{"min":10,"max":20}}"#);
    }

    proptest! {
        #[test]
        fn decode_inverts_write(min in any::<u16>(), max in any::<u16>(), cap in 1u32..=10_000) {
            for rate in [CpuRate::HardCap(cap), CpuRate::Weight(cap % 9 + 1), CpuRate::MinMax { min, max }] {
                let mut control = CpuRateControl::default();
                rate.write(&mut control);
                prop_assert_eq!(CpuRate::from_control(&control), Some(rate));
            }
        }
    }
}
