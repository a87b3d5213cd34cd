// TaskChainFactory: the entry point a plugin holds on to. Binds chains to one
// host and settings, and keeps the registry of named shared groups.

use crate::chain::TaskChain;
use crate::host::GameInterface;
use crate::settings::ChainSettings;
use crate::shared::SharedTaskChain;

use dashmap::DashMap;
use std::sync::Arc;

/// Creates chains and shared groups for one host.
pub struct TaskChainFactory {
    host: Arc<dyn GameInterface>,
    settings: ChainSettings,
    shared: DashMap<String, Arc<SharedTaskChain>>,
}

impl TaskChainFactory {
    pub fn new(host: Arc<dyn GameInterface>) -> Self {
        Self::with_settings(host, ChainSettings::default())
    }

    pub fn with_settings(host: Arc<dyn GameInterface>, settings: ChainSettings) -> Self {
        Self {
            host,
            settings,
            shared: DashMap::new(),
        }
    }

    pub fn host(&self) -> &Arc<dyn GameInterface> {
        &self.host
    }

    pub fn settings(&self) -> &ChainSettings {
        &self.settings
    }

    /// An empty chain using the configured callback timeout.
    pub fn new_chain(&self) -> TaskChain<()> {
        TaskChain::from_parts(
            Arc::clone(&self.host),
            None,
            self.settings.callback_timeout_ticks,
        )
    }

    /// An empty chain that will run inside the shared group `name`.
    pub fn new_shared_chain(&self, name: &str) -> TaskChain<()> {
        self.shared_group(name).new_chain()
    }

    /// The shared group called `name`, created on first use.
    pub fn shared_group(&self, name: &str) -> Arc<SharedTaskChain> {
        if let Some(group) = self.shared.get(name) {
            return Arc::clone(group.value());
        }
        let group = self
            .shared
            .entry(name.to_string())
            .or_insert_with(|| {
                tracing::debug!(group = name, "Creating shared task chain group");
                SharedTaskChain::with_timeout(
                    name,
                    Arc::clone(&self.host),
                    self.settings.callback_timeout_ticks,
                )
            });
        Arc::clone(group.value())
    }

    /// Names of the shared groups created so far.
    pub fn shared_group_names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.shared.iter().map(|entry| entry.key().clone()).collect();
        names.sort();
        names
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::chain::ChainOutcome;
    use crate::error::ChainError;
    use crate::step::Next;
    use crate::testing::{Recorder, TestHost};

    #[test]
    fn test_shared_group_is_reused_by_name() {
        let host = TestHost::new();
        let factory = TaskChainFactory::new(host);
        let a = factory.shared_group("world");
        let b = factory.shared_group("world");
        let c = factory.shared_group("economy");
        assert!(Arc::ptr_eq(&a, &b));
        assert!(!Arc::ptr_eq(&a, &c));
        assert_eq!(a.name(), "world");
        assert_eq!(factory.shared_group_names(), vec!["economy", "world"]);
    }

    #[test]
    fn test_factory_chains_use_configured_timeout() {
        let host = TestHost::new();
        host.enter_main();
        let settings = ChainSettings {
            callback_timeout_ticks: Some(5),
            ..ChainSettings::default()
        };
        let factory = TaskChainFactory::with_settings(host.clone(), settings);
        let faults = Recorder::new();
        let sink = faults.clone();
        let parked = Recorder::new();
        let park = parked.clone();

        factory
            .new_chain()
            .main_callback(move |_: (), _, next: Next<()>| {
                park.push(next);
                Ok(())
            })
            .execute_with_error_handler(move |error, _| {
                sink.push(matches!(
                    error.downcast_ref::<ChainError>(),
                    Some(ChainError::StepTimedOut { ticks: 5, .. })
                ));
            });

        host.run_until_idle();
        assert_eq!(host.tick(), 5);
        assert_eq!(faults.items(), vec![true]);
    }

    #[test]
    fn test_new_shared_chain_joins_group() {
        let host = TestHost::new();
        host.enter_main();
        let factory = TaskChainFactory::new(host.clone());
        let done = Recorder::new();
        let sink = done.clone();

        factory
            .new_shared_chain("bank")
            .main_first(|_| Ok(1u64))
            .main_last(|_, _| Ok(()))
            .execute_with_done(move |outcome| sink.push(outcome));

        host.run_until_idle();
        assert_eq!(done.items(), vec![ChainOutcome::Completed]);
        assert!(!factory.shared_group("bank").is_running());
    }
}
