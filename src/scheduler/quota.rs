use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

use crate::error::AppError;
use crate::orchestrator::CPU_PERIOD_US;

/// Subscription tier. Declaration order is tier order.
#[derive(
    Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
#[serde(rename_all = "lowercase")]
pub enum Plan {
    #[default]
    Free,
    Basic,
    Pro,
    Enterprise,
}

impl Plan {
    pub const ALL: [Plan; 4] = [Plan::Free, Plan::Basic, Plan::Pro, Plan::Enterprise];

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Free => "free",
            Self::Basic => "basic",
            Self::Pro => "pro",
            Self::Enterprise => "enterprise",
        }
    }

    pub fn quota(&self) -> Quota {
        match self {
            Self::Free => Quota {
                cpu: 0.5,
                memory_mb: 512,
                storage_mb: 1024,
                sandboxes: 1,
            },
            Self::Basic => Quota {
                cpu: 1.0,
                memory_mb: 1024,
                storage_mb: 5120,
                sandboxes: 3,
            },
            Self::Pro => Quota {
                cpu: 2.0,
                memory_mb: 4096,
                storage_mb: 20480,
                sandboxes: 10,
            },
            Self::Enterprise => Quota {
                cpu: 4.0,
                memory_mb: 8192,
                storage_mb: 51200,
                sandboxes: UNLIMITED_SANDBOXES,
            },
        }
    }
}

impl fmt::Display for Plan {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Plan {
    type Err = AppError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::ALL
            .into_iter()
            .find(|plan| plan.as_str() == s)
            .ok_or_else(|| AppError::InvalidInput(format!("Unknown plan: {}", s)))
    }
}

pub const UNLIMITED_SANDBOXES: i32 = -1;

/// Per-plan resource ceiling
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct Quota {
    /// Cores
    pub cpu: f64,
    pub memory_mb: i64,
    pub storage_mb: i64,
    /// -1 = unlimited
    pub sandboxes: i32,
}

impl Quota {
    pub fn memory_bytes(&self) -> i64 {
        self.memory_mb * 1024 * 1024
    }

    /// Quota compared against host stats, which are byte/GB denominated
    pub fn memory_gb(&self) -> f64 {
        self.memory_mb as f64 / 1024.0
    }

    /// Docker `CpuQuota` for the standard CFS period
    pub fn cpu_quota(&self) -> i64 {
        (self.cpu * CPU_PERIOD_US as f64).round() as i64
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_quotas_increase_with_tier() {
        for pair in Plan::ALL.windows(2) {
            let (lower, higher) = (pair[0].quota(), pair[1].quota());
            assert!(lower.cpu < higher.cpu, "{} vs {}", pair[0], pair[1]);
            assert!(lower.memory_mb < higher.memory_mb);
            assert!(lower.storage_mb < higher.storage_mb);
        }
        assert!(Plan::Free < Plan::Enterprise);
    }

    #[test]
    fn test_only_top_tier_is_unbounded() {
        assert_eq!(Plan::Enterprise.quota().sandboxes, UNLIMITED_SANDBOXES);
        for plan in &Plan::ALL[..3] {
            assert!(plan.quota().sandboxes > 0);
        }
    }

    #[test]
    fn test_unit_conversions() {
        let basic = Plan::Basic.quota();
        assert_eq!(basic.memory_bytes(), 1024 * 1024 * 1024);
        assert_eq!(basic.memory_gb(), 1.0);
        assert_eq!(basic.cpu_quota(), 100_000);
        assert_eq!(Plan::Free.quota().cpu_quota(), 50_000);
    }

    #[test]
    fn test_parse_plan() {
        assert_eq!("pro".parse::<Plan>().unwrap(), Plan::Pro);
        assert!("platinum".parse::<Plan>().is_err());
    }
}
