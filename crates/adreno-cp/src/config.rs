//! Device tunables.
//!
//! Everything has a default matching the production driver; integrators can
//! override individual fields from JSON.

use std::time::Duration;

use serde::Deserialize;

use crate::error::{CpError, CpResult};

/// Board-specific identification and power quirks.
#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct PlatformQuirks {
    /// Core id to use instead of the one in `RBBM_PERIPHID1`. A22x parts
    /// report 0 there on some SoCs.
    pub core_id_override: Option<u8>,
    /// Patch id to use instead of the one in `RBBM_PATCH_RELEASE`.
    pub patch_id_override: Option<u8>,
    /// `RBBM_PM_OVERRIDE1` value restored after the soft reset.
    pub pm_override1: u32,
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct CpConfig {
    /// Default timestamp wait budget in milliseconds. 0 waits forever.
    pub wait_timeout_ms: u32,
    /// Sample the hang-detect registers while waiting.
    pub fast_hang_detect: bool,
    /// Overall deadline for ring drain and core idle polling.
    pub idle_timeout_ms: u32,
    /// Doorbell / hang-sample interval.
    pub timeout_part_ms: u32,
    /// First timestamp wait interval (and first drain re-kick).
    pub first_wait_ms: u32,
    /// First timestamp wait interval when the budget is shorter than
    /// `first_wait_ms`.
    pub short_wait_ms: u32,
    pub soft_reset_settle_ms: u32,
    /// Out of every 100 timestamp wait iterations, how many block on the
    /// interrupt-driven wake before falling back to polled waits.
    pub io_fraction: u32,
    /// Perform MMU state changes with direct register writes instead of
    /// in-band commands.
    pub direct_register_setstate: bool,
    pub gmem_base: u32,
    pub ring_size_dwords: u32,
    /// Memory-hub client interface configuration (ignored on A20x).
    pub mh_intf_cfg1: u32,
    pub mh_intf_cfg2: u32,
    pub mpu_base: u32,
    pub mpu_range: u32,
    /// Most memory a recovery pass may take for its ring snapshot. `None`
    /// leaves it to the allocator.
    pub recovery_memory_limit: Option<usize>,
    pub platform: PlatformQuirks,
}

impl Default for CpConfig {
    fn default() -> Self {
        Self {
            wait_timeout_ms: 0,
            fast_hang_detect: true,
            idle_timeout_ms: 20_000,
            timeout_part_ms: 50,
            first_wait_ms: 100,
            short_wait_ms: 20,
            soft_reset_settle_ms: 30,
            io_fraction: 33,
            direct_register_setstate: false,
            gmem_base: 0,
            ring_size_dwords: 8192,
            mh_intf_cfg1: 0x0003_2F07,
            mh_intf_cfg2: 0,
            mpu_base: 0,
            mpu_range: 0xFFFF_F000,
            recovery_memory_limit: None,
            platform: PlatformQuirks::default(),
        }
    }
}

impl CpConfig {
    pub fn from_json(raw: &str) -> CpResult<Self> {
        let cfg: CpConfig = serde_json::from_str(raw)
            .map_err(|err| CpError::InvalidArgument(format!("config: {err}")))?;
        cfg.validate()?;
        Ok(cfg)
    }

    pub fn validate(&self) -> CpResult<()> {
        if self.timeout_part_ms == 0 {
            return Err(CpError::InvalidArgument(
                "timeout_part_ms must be non-zero".into(),
            ));
        }
        if self.idle_timeout_ms == 0 {
            return Err(CpError::InvalidArgument(
                "idle_timeout_ms must be non-zero".into(),
            ));
        }
        if !self.ring_size_dwords.is_power_of_two() || self.ring_size_dwords < 64 {
            return Err(CpError::InvalidArgument(format!(
                "ring_size_dwords {} must be a power of two >= 64",
                self.ring_size_dwords
            )));
        }
        if self.io_fraction > 100 {
            return Err(CpError::InvalidArgument(format!(
                "io_fraction {} exceeds 100",
                self.io_fraction
            )));
        }
        Ok(())
    }

    pub fn idle_timeout(&self) -> Duration {
        Duration::from_millis(self.idle_timeout_ms.into())
    }

    pub fn timeout_part(&self) -> Duration {
        Duration::from_millis(self.timeout_part_ms.into())
    }

    pub fn first_wait(&self) -> Duration {
        Duration::from_millis(self.first_wait_ms.into())
    }

    pub fn short_wait(&self) -> Duration {
        Duration::from_millis(self.short_wait_ms.into())
    }

    pub fn soft_reset_settle(&self) -> Duration {
        Duration::from_millis(self.soft_reset_settle_ms.into())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn partial_json_keeps_defaults_for_missing_fields() {
        let cfg = CpConfig::from_json(
            r#"{ "wait_timeout_ms": 500, "platform": { "core_id_override": 2 } }"#,
        )
        .unwrap();
        assert_eq!(cfg.wait_timeout_ms, 500);
        assert_eq!(cfg.platform.core_id_override, Some(2));
        assert_eq!(cfg.timeout_part_ms, 50);
        assert_eq!(cfg.ring_size_dwords, 8192);
        assert!(cfg.fast_hang_detect);
    }

    #[test]
    fn rejects_zero_intervals_and_odd_ring_sizes() {
        assert!(matches!(
            CpConfig::from_json(r#"{ "timeout_part_ms": 0 }"#),
            Err(CpError::InvalidArgument(_))
        ));
        assert!(matches!(
            CpConfig::from_json(r#"{ "ring_size_dwords": 1000 }"#),
            Err(CpError::InvalidArgument(_))
        ));
        assert!(CpConfig::from_json("not json").is_err());
    }
}
