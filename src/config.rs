//! Tunables for wear-leveling and consolidation

use crate::{Error, Result};

/// Engine configuration
///
/// Every field has a sensible default; the setters return `Self` so configurations can be built
/// up in one expression, in the same manner as [crate::ubi::Ec].
#[derive(Debug, Clone)]
pub struct WlConfig {
    /// Maximum EC difference between the least-worn used PEB and the best free PEB before a move
    /// is started
    pub wl_threshold: u64,

    /// Number of buckets in the protection queue; a freshly allocated PEB stays out of reach of
    /// wear-leveling for this many completed erases
    pub prot_queue_len: usize,

    /// PEBs numbered below this may hold a checkpoint anchor
    pub anchor_max_start: u32,

    /// Hold back anchor-capable PEBs until a checkpoint has been written
    pub anchor_reservation: bool,

    /// How many LEBs a consolidated PEB holds; 1 disables consolidation
    pub lebs_per_cpeb: usize,

    /// Free PEBs kept back for consolidation targets
    pub conso_reserved_pebs: u32,

    /// Free PEBs kept back for wear-leveling targets
    pub wl_reserved_pebs: u32,

    /// Ceiling on PEBs quarantined after read errors; `None` picks a tenth of the device, at
    /// least 16
    pub max_erroneous: Option<u32>,

    /// May blocks that fail to erase be marked bad?
    pub bad_allowed: bool,

    /// PEBs reserved for bad block handling, per 1024 PEBs
    pub bad_peb_limit: u32,

    /// Erase counters may not exceed this
    pub max_erase_counter: u64,

    /// Consecutive job failures before the worker gives up and the device turns read-only
    pub max_work_failures: u32,

    /// Run expensive consistency checks
    pub self_checks: bool,

    /// Run jobs on a dedicated thread; otherwise callers drive the queue
    pub background: bool,

    /// Consolidate whenever it is possible, regardless of the free PEB count
    pub force_consolidation: bool,
}

impl Default for WlConfig {
    fn default() -> Self {
        Self {
            wl_threshold: 4096,
            prot_queue_len: 10,
            anchor_max_start: 64,
            anchor_reservation: false,
            lebs_per_cpeb: 1,
            conso_reserved_pebs: 1,
            wl_reserved_pebs: 1,
            max_erroneous: None,
            bad_allowed: true,
            bad_peb_limit: 20,
            max_erase_counter: 0x7FFF_FFFF,
            max_work_failures: 32,
            self_checks: false,
            background: true,
            force_consolidation: false,
        }
    }
}

impl WlConfig {
    pub fn wl_threshold(mut self, wl_threshold: u64) -> Self {
        self.wl_threshold = wl_threshold;
        self
    }

    pub fn prot_queue_len(mut self, prot_queue_len: usize) -> Self {
        self.prot_queue_len = prot_queue_len;
        self
    }

    pub fn anchor_reservation(mut self, anchor_max_start: u32) -> Self {
        self.anchor_reservation = true;
        self.anchor_max_start = anchor_max_start;
        self
    }

    pub fn lebs_per_cpeb(mut self, lebs_per_cpeb: usize) -> Self {
        self.lebs_per_cpeb = lebs_per_cpeb;
        self
    }

    pub fn conso_reserved_pebs(mut self, conso_reserved_pebs: u32) -> Self {
        self.conso_reserved_pebs = conso_reserved_pebs;
        self
    }

    pub fn wl_reserved_pebs(mut self, wl_reserved_pebs: u32) -> Self {
        self.wl_reserved_pebs = wl_reserved_pebs;
        self
    }

    pub fn max_erroneous(mut self, max_erroneous: u32) -> Self {
        self.max_erroneous = Some(max_erroneous);
        self
    }

    pub fn bad_allowed(mut self, bad_allowed: bool) -> Self {
        self.bad_allowed = bad_allowed;
        self
    }

    pub fn bad_peb_limit(mut self, bad_peb_limit: u32) -> Self {
        self.bad_peb_limit = bad_peb_limit;
        self
    }

    pub fn max_erase_counter(mut self, max_erase_counter: u64) -> Self {
        self.max_erase_counter = max_erase_counter;
        self
    }

    pub fn max_work_failures(mut self, max_work_failures: u32) -> Self {
        self.max_work_failures = max_work_failures;
        self
    }

    pub fn self_checks(mut self, self_checks: bool) -> Self {
        self.self_checks = self_checks;
        self
    }

    pub fn background(mut self, background: bool) -> Self {
        self.background = background;
        self
    }

    pub fn force_consolidation(mut self, force_consolidation: bool) -> Self {
        self.force_consolidation = force_consolidation;
        self
    }

    /// Free PEBs may differ in EC by this much before allocation stops picking the median one
    pub fn free_max_diff(&self) -> u64 {
        self.wl_threshold * 2
    }

    /// The erroneous ceiling, resolved against the device size
    pub fn max_erroneous_for(&self, peb_count: u32) -> u32 {
        self.max_erroneous
            .unwrap_or_else(|| std::cmp::max(peb_count / 10, 16))
    }

    /// PEBs to reserve for bad block handling on a device of `peb_count` PEBs
    pub fn beb_reserve_for(&self, peb_count: u32) -> u32 {
        if !self.bad_allowed {
            return 0;
        }
        let limit = u64::from(peb_count) * u64::from(self.bad_peb_limit);
        limit.div_ceil(1024) as u32
    }

    /// Reject configurations the engine cannot run with
    pub fn validate(&self) -> Result<()> {
        if self.wl_threshold == 0 {
            return Err(Error::Invalid("wl_threshold must be nonzero".into()));
        }
        if self.prot_queue_len == 0 {
            return Err(Error::Invalid("prot_queue_len must be nonzero".into()));
        }
        if self.lebs_per_cpeb == 0 {
            return Err(Error::Invalid("lebs_per_cpeb must be at least 1".into()));
        }
        if self.max_work_failures == 0 {
            return Err(Error::Invalid("max_work_failures must be nonzero".into()));
        }
        if self.max_erase_counter == 0 {
            return Err(Error::Invalid("max_erase_counter must be nonzero".into()));
        }
        Ok(())
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = WlConfig::default();
        assert!(config.validate().is_ok());
        assert_eq!(config.free_max_diff(), 8192);
        assert_eq!(config.max_erroneous_for(40), 16);
        assert_eq!(config.max_erroneous_for(1000), 100);
        assert_eq!(config.beb_reserve_for(1024), 20);
        assert_eq!(config.beb_reserve_for(100), 2);
        assert_eq!(config.clone().bad_allowed(false).beb_reserve_for(1024), 0);
    }

    #[test]
    fn test_validate() {
        assert!(WlConfig::default().lebs_per_cpeb(0).validate().is_err());
        assert!(WlConfig::default().prot_queue_len(0).validate().is_err());
        assert!(WlConfig::default().wl_threshold(0).validate().is_err());
        assert!(WlConfig::default().lebs_per_cpeb(4).validate().is_ok());
    }
}
