//! Capacity and scheduler configuration structures.

use std::collections::{BTreeMap, HashMap};

use serde::{Deserialize, Serialize};

/// Quota replenishment behavior for a capacity pool.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "mode", rename_all = "snake_case")]
pub enum ReplenishConfig {
    /// Restore every resource to its limit on each tick.
    Reset {
        /// Tick interval in milliseconds.
        interval_ms: u64,
    },
    /// Add `delta` per resource on each tick, capped at the limits.
    Increment {
        /// Tick interval in milliseconds.
        interval_ms: u64,
        /// Units added per resource per tick.
        delta: BTreeMap<String, u64>,
    },
}

impl ReplenishConfig {
    fn interval_ms(&self) -> u64 {
        match self {
            Self::Reset { interval_ms } | Self::Increment { interval_ms, .. } => *interval_ms,
        }
    }
}

/// One capacity pool: its limits, optional parent, and optional quota timer.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CapacityConfig {
    /// Resource limits, by name.
    pub limits: BTreeMap<String, u64>,
    /// Name of the parent pool acquisitions must also fit within.
    #[serde(default)]
    pub parent: Option<String>,
    /// Quota replenishment; absent means completed tasks restore capacity.
    #[serde(default)]
    pub replenish: Option<ReplenishConfig>,
}

/// Priority aging configuration.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct AgingConfig {
    /// Boost added per waited millisecond.
    pub rate_per_ms: f64,
    /// Upper bound on the total boost.
    pub max_boost: f64,
}

/// Root scheduler configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SchedulerConfig {
    /// Map of capacity pool name to configuration.
    pub capacities: HashMap<String, CapacityConfig>,
    /// Priority aging; absent means no aging.
    #[serde(default)]
    pub aging: Option<AgingConfig>,
}

impl CapacityConfig {
    /// Validate one capacity pool's values.
    pub fn validate(&self) -> Result<(), String> {
        if self.limits.is_empty() {
            return Err("limits must name at least one resource".into());
        }
        if let Some(replenish) = &self.replenish {
            if replenish.interval_ms() == 0 {
                return Err("replenish interval_ms must be greater than 0".into());
            }
            if let ReplenishConfig::Increment { delta, .. } = replenish {
                if delta.is_empty() {
                    return Err("replenish delta must name at least one resource".into());
                }
            }
        }
        Ok(())
    }
}

impl AgingConfig {
    /// Validate aging values.
    pub fn validate(&self) -> Result<(), String> {
        if !self.rate_per_ms.is_finite() || self.rate_per_ms < 0.0 {
            return Err("aging rate_per_ms must be finite and non-negative".into());
        }
        if !self.max_boost.is_finite() || self.max_boost < 0.0 {
            return Err("aging max_boost must be finite and non-negative".into());
        }
        Ok(())
    }
}

impl SchedulerConfig {
    /// Validate every pool, the parent topology, and aging values.
    pub fn validate(&self) -> Result<(), String> {
        if self.capacities.is_empty() {
            return Err("at least one capacity pool must be defined".into());
        }
        for (name, capacity) in &self.capacities {
            capacity
                .validate()
                .map_err(|e| format!("capacity `{name}` invalid: {e}"))?;
            if let Some(parent) = &capacity.parent {
                let Some(parent_cfg) = self.capacities.get(parent) else {
                    return Err(format!("capacity `{name}` names unknown parent `{parent}`"));
                };
                if parent_cfg.replenish.is_some() {
                    return Err(format!(
                        "capacity `{name}` has quota pool `{parent}` as parent"
                    ));
                }
            }
            // Walk the parent chain to reject cycles.
            let mut seen = vec![name.as_str()];
            let mut current = capacity.parent.as_deref();
            while let Some(ancestor) = current {
                if seen.contains(&ancestor) {
                    return Err(format!("capacity `{name}` has a cyclic parent chain"));
                }
                seen.push(ancestor);
                current = self
                    .capacities
                    .get(ancestor)
                    .and_then(|c| c.parent.as_deref());
            }
        }
        if let Some(aging) = &self.aging {
            aging.validate().map_err(|e| format!("aging invalid: {e}"))?;
        }
        Ok(())
    }

    /// Parse scheduler configuration from a JSON string and validate.
    pub fn from_json_str(input: &str) -> Result<Self, String> {
        let cfg: SchedulerConfig =
            serde_json::from_str(input).map_err(|e| format!("parse error: {e}"))?;
        cfg.validate()?;
        Ok(cfg)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_and_validates_json() {
        let cfg = SchedulerConfig::from_json_str(
            r#"{
                "capacities": {
                    "global": { "limits": { "cpu": 16 } },
                    "inference": {
                        "limits": { "cpu": 8, "vram": 24 },
                        "parent": "global"
                    },
                    "api": {
                        "limits": { "requests": 100 },
                        "replenish": { "mode": "reset", "interval_ms": 60000 }
                    }
                },
                "aging": { "rate_per_ms": 0.001, "max_boost": 5.0 }
            }"#,
        )
        .unwrap();
        assert_eq!(cfg.capacities.len(), 3);
        assert_eq!(
            cfg.capacities["inference"].parent.as_deref(),
            Some("global")
        );
    }

    #[test]
    fn rejects_unknown_parent() {
        let err = SchedulerConfig::from_json_str(
            r#"{ "capacities": { "a": { "limits": { "cpu": 1 }, "parent": "nope" } } }"#,
        )
        .unwrap_err();
        assert!(err.contains("unknown parent"));
    }

    #[test]
    fn rejects_cyclic_parent_chain() {
        let err = SchedulerConfig::from_json_str(
            r#"{ "capacities": {
                "a": { "limits": { "cpu": 1 }, "parent": "b" },
                "b": { "limits": { "cpu": 1 }, "parent": "a" }
            } }"#,
        )
        .unwrap_err();
        assert!(err.contains("cyclic"));
    }

    #[test]
    fn rejects_quota_parent() {
        let err = SchedulerConfig::from_json_str(
            r#"{ "capacities": {
                "limited": {
                    "limits": { "requests": 10 },
                    "replenish": { "mode": "reset", "interval_ms": 1000 }
                },
                "child": { "limits": { "requests": 5 }, "parent": "limited" }
            } }"#,
        )
        .unwrap_err();
        assert!(err.contains("quota pool"));
    }

    #[test]
    fn rejects_zero_interval() {
        let err = SchedulerConfig::from_json_str(
            r#"{ "capacities": { "a": {
                "limits": { "cpu": 1 },
                "replenish": { "mode": "increment", "interval_ms": 0, "delta": { "cpu": 1 } }
            } } }"#,
        )
        .unwrap_err();
        assert!(err.contains("interval_ms"));
    }
}
