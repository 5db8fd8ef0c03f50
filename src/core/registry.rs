// ============================================
// CHORUS - Circuit Breaker Registry
// ============================================

use std::collections::{BTreeMap, HashMap};
use std::sync::{Arc, PoisonError, RwLock};

use super::circuit_breaker::{BreakerConfig, BreakerSnapshot, CircuitBreaker};

/// One breaker per provider id, created on first use and shared by every
/// request for the lifetime of the registry.
pub struct CircuitRegistry {
    breakers: RwLock<HashMap<String, Arc<CircuitBreaker>>>,
    default_config: BreakerConfig,
}

impl Default for CircuitRegistry {
    fn default() -> Self {
        Self::new(BreakerConfig::default())
    }
}

impl CircuitRegistry {
    pub fn new(default_config: BreakerConfig) -> Self {
        Self {
            breakers: RwLock::new(HashMap::new()),
            default_config,
        }
    }

    /// Get the breaker for `provider_id`, creating it if absent
    pub fn get(&self, provider_id: &str) -> Arc<CircuitBreaker> {
        if let Some(breaker) = self
            .breakers
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(provider_id)
        {
            return breaker.clone();
        }

        let mut breakers = self
            .breakers
            .write()
            .unwrap_or_else(PoisonError::into_inner);
        breakers
            .entry(provider_id.to_string())
            .or_insert_with(|| {
                tracing::debug!(provider = provider_id, "creating circuit breaker");
                Arc::new(CircuitBreaker::new(provider_id, self.default_config.clone()))
            })
            .clone()
    }

    /// Provider id -> breaker state, sorted by id
    pub fn snapshot(&self) -> BTreeMap<String, BreakerSnapshot> {
        self.breakers
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .iter()
            .map(|(id, breaker)| (id.clone(), breaker.snapshot()))
            .collect()
    }

    /// Keep the ids whose breaker would currently admit a call, in input order
    pub fn healthy<S: AsRef<str>>(&self, provider_ids: &[S]) -> Vec<String> {
        provider_ids
            .iter()
            .map(|id| id.as_ref())
            .filter(|id| self.get(id).is_available())
            .map(|id| id.to_string())
            .collect()
    }

    /// Administrative reset; returns false when no breaker exists yet
    pub fn reset(&self, provider_id: &str) -> bool {
        let breaker = self
            .breakers
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(provider_id)
            .cloned();

        match breaker {
            Some(breaker) => {
                breaker.reset();
                true
            }
            None => false,
        }
    }

    pub fn reset_all(&self) {
        for breaker in self
            .breakers
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .values()
        {
            breaker.reset();
        }
    }
}
