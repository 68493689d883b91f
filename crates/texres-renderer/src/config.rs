//! Cache tuning, read from console variables.

use texres_common::cvar::{CvarContext, CvarFlags};

pub const CVAR_POOL_BUDGET_KB: &str = "tex_pool_budget_kb";
pub const CVAR_POOL_MAX_SLOTS: &str = "tex_pool_max_slots";
pub const CVAR_POOL_SLOTS: &str = "tex_pool_slots";
pub const CVAR_THRASH_WINDOW: &str = "tex_thrash_window";
pub const CVAR_DIRECT_MAP: &str = "tex_direct_map";
pub const CVAR_FALLBACK_GREY: &str = "tex_fallback_grey";

/// Changes to these only take effect after a flush.
pub const LATCHED_PATTERN: &str = "tex_pool_*";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CacheConfig {
    /// Video memory each pool may size itself for, in KiB.
    pub pool_budget_kb: u32,
    /// Upper bound on slots per pool.
    pub max_slots: u32,
    /// Fixed slot count for every pool; 0 derives it from the budget.
    pub slot_override: u32,
    /// How many recent slots the thrash round-robin cycles through.
    pub thrash_window: u32,
    /// Fill straight into device memory when it can be mapped.
    pub direct_map: bool,
    pub fallback_grey: u8,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            pool_budget_kb: 2048,
            max_slots: 64,
            slot_override: 0,
            thrash_window: 4,
            direct_map: true,
            fallback_grey: 128,
        }
    }
}

impl CacheConfig {
    /// A config whose pools all hold exactly `slots` textures.
    pub fn with_slots(slots: u32) -> Self {
        Self {
            slot_override: slots,
            ..Self::default()
        }
    }

    /// Create the `tex_*` cvars with their defaults.
    pub fn register_cvars(cvars: &mut CvarContext) {
        let d = Self::default();
        let pool = CvarFlags::ARCHIVE | CvarFlags::LATCH;
        cvars.get(CVAR_POOL_BUDGET_KB, &d.pool_budget_kb.to_string(), pool);
        cvars.get(CVAR_POOL_MAX_SLOTS, &d.max_slots.to_string(), pool);
        cvars.get(CVAR_POOL_SLOTS, &d.slot_override.to_string(), pool);
        cvars.get(CVAR_THRASH_WINDOW, &d.thrash_window.to_string(), CvarFlags::ARCHIVE);
        cvars.get(CVAR_DIRECT_MAP, "1", CvarFlags::ARCHIVE);
        cvars.get(CVAR_FALLBACK_GREY, &d.fallback_grey.to_string(), CvarFlags::ARCHIVE);
    }

    /// Read the current cvar values. Missing or nonsense values fall back
    /// to defaults.
    pub fn from_cvars(cvars: &CvarContext) -> Self {
        let d = Self::default();
        let uint = |name: &str, default: u32| match cvars.find_var(name) {
            Some(var) if var.value >= 0.0 => var.value as u32,
            _ => default,
        };
        Self {
            pool_budget_kb: uint(CVAR_POOL_BUDGET_KB, d.pool_budget_kb).max(1),
            max_slots: uint(CVAR_POOL_MAX_SLOTS, d.max_slots).max(1),
            slot_override: uint(CVAR_POOL_SLOTS, d.slot_override),
            thrash_window: uint(CVAR_THRASH_WINDOW, d.thrash_window).max(1),
            direct_map: cvars
                .find_var(CVAR_DIRECT_MAP)
                .map_or(d.direct_map, |v| v.value != 0.0),
            fallback_grey: uint(CVAR_FALLBACK_GREY, d.fallback_grey as u32).min(255) as u8,
        }
    }

    /// Slot count for a pool, fixed until the next flush.
    pub fn pool_capacity(&self, slot_bytes: usize) -> usize {
        if self.slot_override > 0 {
            return self.slot_override as usize;
        }
        let budget = self.pool_budget_kb as usize * 1024;
        (budget / slot_bytes.max(1)).clamp(1, self.max_slots as usize)
    }

    /// Whether moving from `self` to `next` invalidates existing pools.
    pub fn needs_flush(&self, next: &CacheConfig) -> bool {
        self.pool_budget_kb != next.pool_budget_kb
            || self.max_slots != next.max_slots
            || self.slot_override != next.slot_override
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_round_trip_through_cvars() {
        let mut cvars = CvarContext::new();
        CacheConfig::register_cvars(&mut cvars);
        assert_eq!(CacheConfig::from_cvars(&cvars), CacheConfig::default());
    }

    #[test]
    fn test_from_cvars_reads_config_file() {
        let mut cvars = CvarContext::new();
        CacheConfig::register_cvars(&mut cvars);
        cvars.exec_config(
            "set tex_pool_slots 4\nset tex_thrash_window \"2\"\nset tex_direct_map 0\nset tex_fallback_grey 900\n",
        );
        let cfg = CacheConfig::from_cvars(&cvars);
        assert_eq!(cfg.slot_override, 4);
        assert_eq!(cfg.thrash_window, 2);
        assert!(!cfg.direct_map);
        assert_eq!(cfg.fallback_grey, 255);
    }

    #[test]
    fn test_latched_pool_cvars() {
        let mut cvars = CvarContext::new();
        CacheConfig::register_cvars(&mut cvars);
        cvars.check_modified("tex_*");
        cvars.set_latch_active(true);
        cvars.set(CVAR_POOL_SLOTS, "8");
        assert_eq!(CacheConfig::from_cvars(&cvars).slot_override, 0);
        assert_eq!(cvars.get_latched_vars(), vec![CVAR_POOL_SLOTS.to_string()]);
        assert_eq!(cvars.check_modified(LATCHED_PATTERN), vec![CVAR_POOL_SLOTS.to_string()]);
        assert_eq!(CacheConfig::from_cvars(&cvars).slot_override, 8);
    }

    #[test]
    fn test_pool_capacity() {
        let cfg = CacheConfig::default();
        assert_eq!(cfg.pool_capacity(64 * 1024), 32);
        assert_eq!(cfg.pool_capacity(16), 64);
        assert_eq!(cfg.pool_capacity(64 << 20), 1);
        assert_eq!(CacheConfig::with_slots(3).pool_capacity(16), 3);
    }

    #[test]
    fn test_needs_flush() {
        let a = CacheConfig::default();
        let b = CacheConfig { thrash_window: 8, ..a };
        assert!(!a.needs_flush(&b));
        let c = CacheConfig { pool_budget_kb: 512, ..a };
        assert!(a.needs_flush(&c));
    }
}
