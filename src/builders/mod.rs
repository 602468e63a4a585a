//! Builders to construct capacity pools and aging policy from configuration.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use tracing::info;

use crate::config::{ReplenishConfig, SchedulerConfig};
use crate::core::{AgingPolicy, CapacitySource, QuotaCapacity, ResourceCapacity, SchedulerError};
use crate::core::capacity::ResourceCost;

fn to_cost(limits: &std::collections::BTreeMap<String, u64>) -> ResourceCost {
    limits.iter().map(|(k, v)| (k.clone(), *v)).collect()
}

/// Build every configured capacity pool, wiring parent chains and starting
/// quota replenishment timers.
///
/// Quota timers are tokio tasks, so this must run within a tokio runtime.
pub fn build_capacities(
    cfg: &SchedulerConfig,
) -> Result<HashMap<String, Arc<dyn CapacitySource>>, SchedulerError> {
    cfg.validate().map_err(SchedulerError::InvalidConfig)?;

    // Plain pools first, parents before children. Validation guarantees the
    // chains are acyclic and that no quota pool is a parent.
    let mut plain: HashMap<String, Arc<ResourceCapacity>> = HashMap::new();
    let mut pending: Vec<(&String, &crate::config::CapacityConfig)> = cfg
        .capacities
        .iter()
        .filter(|(_, c)| c.replenish.is_none())
        .collect();
    while !pending.is_empty() {
        let before = pending.len();
        pending.retain(|(name, capacity)| match &capacity.parent {
            None => {
                plain.insert(
                    (*name).clone(),
                    Arc::new(ResourceCapacity::new(to_cost(&capacity.limits))),
                );
                false
            }
            Some(parent) => match plain.get(parent) {
                Some(parent) => {
                    plain.insert(
                        (*name).clone(),
                        Arc::new(ResourceCapacity::with_parent(
                            to_cost(&capacity.limits),
                            Arc::clone(parent),
                        )),
                    );
                    false
                }
                None => true,
            },
        });
        if pending.len() == before {
            return Err(SchedulerError::InvalidConfig(
                "unresolvable capacity parent chain".into(),
            ));
        }
    }

    let mut pools: HashMap<String, Arc<dyn CapacitySource>> = HashMap::new();
    for (name, capacity) in &cfg.capacities {
        let Some(replenish) = &capacity.replenish else {
            pools.insert(name.clone(), plain[name].clone());
            continue;
        };
        let limits = to_cost(&capacity.limits);
        let quota = match &capacity.parent {
            Some(parent) => QuotaCapacity::with_parent(limits, Arc::clone(&plain[parent])),
            None => QuotaCapacity::new(limits),
        };
        match replenish {
            ReplenishConfig::Reset { interval_ms } => {
                quota.start_periodic_reset(Duration::from_millis(*interval_ms));
            }
            ReplenishConfig::Increment { interval_ms, delta } => {
                quota.start_periodic_increment(Duration::from_millis(*interval_ms), to_cost(delta));
            }
        }
        pools.insert(name.clone(), Arc::new(quota));
    }

    info!(pools = pools.len(), "capacity pools built");
    Ok(pools)
}

/// Aging policy from configuration; no configuration means no aging.
pub fn aging_policy(cfg: &SchedulerConfig) -> AgingPolicy {
    cfg.aging.map_or(AgingPolicy::NONE, |aging| AgingPolicy {
        rate_per_ms: aging.rate_per_ms,
        max_boost: aging.max_boost,
    })
}
