//! In-memory mirror of a job's information blocks.

use std::collections::BTreeSet;

use crate::api::info::{
    AccountingInfo, CpuRateControl, ExtendedLimits, InfoBlock, InfoClass, NetRateControl,
    UiRestrictions,
};
use crate::limit::CpuRate;

/// Cached copies of the five information blocks of a job.
///
/// A block mirrors the OS only between a successful query and the next local
/// mutation. Reading a block that was never queried yields its defaults.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct JobInfo {
    /// Extended limit information.
    pub extended: ExtendedLimits,
    /// UI restrictions.
    pub ui: UiRestrictions,
    /// Accounting and I/O counters.
    pub accounting: AccountingInfo,
    /// CPU rate control.
    pub cpu: CpuRateControl,
    /// Network rate control.
    pub net: NetRateControl,
    synced: BTreeSet<InfoClass>,
}

impl JobInfo {
    /// The cached block of `class`.
    #[must_use]
    pub const fn block(&self, class: InfoClass) -> InfoBlock {
        match class {
            InfoClass::ExtendedLimits => InfoBlock::ExtendedLimits(self.extended),
            InfoClass::UiRestrictions => InfoBlock::UiRestrictions(self.ui),
            InfoClass::Accounting => InfoBlock::Accounting(self.accounting),
            InfoClass::CpuRateControl => InfoBlock::CpuRateControl(self.cpu),
            InfoClass::NetRateControl => InfoBlock::NetRateControl(self.net),
        }
    }

    /// Replace a block with a freshly queried copy.
    pub fn store(&mut self, block: InfoBlock) {
        let class = block.class();
        match block {
            InfoBlock::ExtendedLimits(b) => self.extended = b,
            InfoBlock::UiRestrictions(b) => self.ui = b,
            InfoBlock::Accounting(b) => self.accounting = b,
            InfoBlock::CpuRateControl(b) => self.cpu = b,
            InfoBlock::NetRateControl(b) => self.net = b,
        }
        self.synced.insert(class);
    }

    /// Whether `class` was refreshed since its last local mutation.
    #[must_use]
    pub fn is_synced(&self, class: InfoClass) -> bool {
        self.synced.contains(&class)
    }

    /// Record a local mutation of `class`.
    pub(crate) fn touch(&mut self, class: InfoClass) {
        self.synced.remove(&class);
    }

    /// Limit classes whose cached block has any limit in effect.
    #[must_use]
    pub fn limit_classes_set(&self) -> Vec<InfoClass> {
        InfoClass::LIMITS
            .into_iter()
            .filter(|class| self.block(*class).has_limits())
            .collect()
    }

    /// Zero every block.
    pub fn clear(&mut self) {
        *self = Self::default();
    }

    /// Cached minimum and maximum working set sizes.
    #[must_use]
    pub const fn working_set(&self) -> (usize, usize) {
        let basic = &self.extended.basic;
        (
            basic.minimum_working_set_size,
            basic.maximum_working_set_size,
        )
    }

    /// Cached CPU rate, decoded according to the control flags.
    #[must_use]
    pub fn cpu_rate(&self) -> Option<CpuRate> {
        CpuRate::from_control(&self.cpu)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::api::info::{CpuControlFlags, LimitFlags};

    #[test]
    fn store_marks_synced_and_touch_clears() {
        let mut info = JobInfo::default();
        assert!(!info.is_synced(InfoClass::ExtendedLimits));

        info.store(InfoBlock::ExtendedLimits(ExtendedLimits::default()));
        assert!(info.is_synced(InfoClass::ExtendedLimits));
        assert!(!info.is_synced(InfoClass::Accounting));

        info.touch(InfoClass::ExtendedLimits);
        assert!(!info.is_synced(InfoClass::ExtendedLimits));
    }

    #[test]
    fn limit_classes_set_ignores_accounting() {
        let mut info = JobInfo::default();
        info.accounting.active_processes = 2;
        assert!(info.limit_classes_set().is_empty());

        info.extended.basic.limit_flags = LimitFlags::KILL_ON_JOB_CLOSE;
        info.cpu.control_flags = CpuControlFlags::ENABLE | CpuControlFlags::WEIGHT_BASED;
        assert_eq!(
            info.limit_classes_set(),
            vec![InfoClass::ExtendedLimits, InfoClass::CpuRateControl]
        );

        info.clear();
        assert_eq!(info, JobInfo::default());
    }

    #[test]
    fn stale_reads_return_defaults() {
        let info = JobInfo::default();
        assert_eq!(info.working_set(), (0, 0));
        assert_eq!(info.cpu_rate(), None);
    }
}
