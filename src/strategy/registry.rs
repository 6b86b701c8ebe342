//! Strategy name to factory table.
//!
//! Strategies are registered at startup; custom strategies are added with
//! [`StrategyRegistry::register`] before the pool starts.

use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;

use serde::de::DeserializeOwned;

use crate::error::StrategyError;
use crate::scheduler::HostCapabilities;

use super::{
    AffinityStrategy, LoadBalancingStrategy, PriorityBasedStrategy, ResourceAwareStrategy,
    RoundRobinStrategy, WorkerStrategy,
};

/// Values injected into every strategy factory.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct StrategyContext {
    /// Capabilities of the host running the workers.
    pub host: HostCapabilities,
}

impl StrategyContext {
    /// Creates a context with explicit host capabilities.
    pub fn new(host: HostCapabilities) -> Self {
        Self { host }
    }

    /// Creates a context for the current host.
    pub fn detect() -> Self {
        Self::new(HostCapabilities::detect())
    }
}

/// Builds a strategy from its JSON options.
pub type StrategyFactory = Arc<
    dyn Fn(&serde_json::Value, &StrategyContext) -> Result<Box<dyn WorkerStrategy>, StrategyError>
        + Send
        + Sync,
>;

/// Deserialises strategy options; `null` yields the defaults.
pub fn parse_options<T>(strategy: &str, options: &serde_json::Value) -> Result<T, StrategyError>
where
    T: DeserializeOwned + Default,
{
    if options.is_null() {
        return Ok(T::default());
    }
    serde_json::from_value(options.clone()).map_err(|e| StrategyError::InvalidOptions {
        strategy: strategy.to_string(),
        message: e.to_string(),
    })
}

/// Registered strategy factories.
#[derive(Clone, Default)]
pub struct StrategyRegistry {
    factories: BTreeMap<String, StrategyFactory>,
}

impl StrategyRegistry {
    /// Creates an empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// Creates a registry holding the built-in strategies.
    pub fn with_builtin() -> Self {
        let mut registry = Self::new();
        registry.insert(RoundRobinStrategy::NAME, |options, _ctx| {
            Ok(Box::new(RoundRobinStrategy::new(parse_options(
                RoundRobinStrategy::NAME,
                options,
            )?)))
        });
        registry.insert(LoadBalancingStrategy::NAME, |options, _ctx| {
            Ok(Box::new(LoadBalancingStrategy::new(parse_options(
                LoadBalancingStrategy::NAME,
                options,
            )?)))
        });
        registry.insert(PriorityBasedStrategy::NAME, |options, ctx| {
            Ok(Box::new(PriorityBasedStrategy::new(
                parse_options(PriorityBasedStrategy::NAME, options)?,
                ctx.host,
            )))
        });
        registry.insert(AffinityStrategy::NAME, |options, _ctx| {
            Ok(Box::new(AffinityStrategy::new(parse_options(
                AffinityStrategy::NAME,
                options,
            )?)))
        });
        registry.insert(ResourceAwareStrategy::NAME, |options, ctx| {
            Ok(Box::new(ResourceAwareStrategy::new(
                parse_options(ResourceAwareStrategy::NAME, options)?,
                ctx.host,
            )))
        });
        registry
    }

    fn insert<F>(&mut self, name: &str, factory: F)
    where
        F: Fn(&serde_json::Value, &StrategyContext) -> Result<Box<dyn WorkerStrategy>, StrategyError>
            + Send
            + Sync
            + 'static,
    {
        self.factories.insert(name.to_string(), Arc::new(factory));
    }

    /// Registers a custom strategy. Names must be unique.
    pub fn register<F>(&mut self, name: &str, factory: F) -> Result<(), StrategyError>
    where
        F: Fn(&serde_json::Value, &StrategyContext) -> Result<Box<dyn WorkerStrategy>, StrategyError>
            + Send
            + Sync
            + 'static,
    {
        if self.factories.contains_key(name) {
            return Err(StrategyError::DuplicateStrategy(name.to_string()));
        }
        self.insert(name, factory);
        Ok(())
    }

    /// Instantiates a strategy by name.
    pub fn create(
        &self,
        name: &str,
        options: &serde_json::Value,
        ctx: &StrategyContext,
    ) -> Result<Box<dyn WorkerStrategy>, StrategyError> {
        let factory = self
            .factories
            .get(name)
            .ok_or_else(|| StrategyError::UnknownStrategy(name.to_string()))?;
        factory(options, ctx)
    }

    /// Returns true if `name` is registered.
    pub fn contains(&self, name: &str) -> bool {
        self.factories.contains_key(name)
    }

    /// Registered names in sorted order.
    pub fn names(&self) -> Vec<&str> {
        self.factories.keys().map(|k| k.as_str()).collect()
    }
}

impl fmt::Debug for StrategyRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("StrategyRegistry")
            .field("strategies", &self.names())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::strategy::RoundRobinConfig;
    use serde_json::json;

    fn ctx() -> StrategyContext {
        StrategyContext::new(HostCapabilities::new(4, 8192))
    }

    #[test]
    fn test_builtin_names() {
        let registry = StrategyRegistry::with_builtin();
        assert_eq!(
            registry.names(),
            vec![
                "affinity",
                "load-balancing",
                "priority-based",
                "resource-aware",
                "round-robin"
            ]
        );
    }

    #[test]
    fn test_create_with_and_without_options() {
        let registry = StrategyRegistry::with_builtin();
        for name in registry.names() {
            let strategy = registry.create(name, &serde_json::Value::Null, &ctx()).unwrap();
            assert_eq!(strategy.name(), name);
        }

        let strategy = registry
            .create("round-robin", &json!({"maxSkipAttempts": 3}), &ctx())
            .unwrap();
        assert_eq!(strategy.name(), "round-robin");
    }

    #[test]
    fn test_unknown_strategy_is_an_error() {
        let registry = StrategyRegistry::with_builtin();
        let err = registry
            .create("random", &serde_json::Value::Null, &ctx())
            .err()
            .unwrap();
        assert!(matches!(err, StrategyError::UnknownStrategy(name) if name == "random"));
    }

    #[test]
    fn test_invalid_options_are_rejected() {
        let registry = StrategyRegistry::with_builtin();
        let err = registry
            .create("round-robin", &json!({"maxSkipAttempts": "many"}), &ctx())
            .err()
            .unwrap();
        assert!(matches!(err, StrategyError::InvalidOptions { .. }));
    }

    #[test]
    fn test_parse_options_defaults_on_null() {
        let config: RoundRobinConfig =
            parse_options("round-robin", &serde_json::Value::Null).unwrap();
        assert_eq!(config, RoundRobinConfig::default());
    }

    #[test]
    fn test_register_custom_strategy() {
        let mut registry = StrategyRegistry::with_builtin();
        registry
            .register("sticky-rr", |options, _ctx| {
                Ok(Box::new(RoundRobinStrategy::new(parse_options(
                    "sticky-rr",
                    options,
                )?)))
            })
            .unwrap();
        assert!(registry.contains("sticky-rr"));

        let err = registry
            .register("affinity", |_, _| {
                Ok(Box::new(RoundRobinStrategy::default()))
            })
            .err()
            .unwrap();
        assert!(matches!(err, StrategyError::DuplicateStrategy(_)));
    }
}
