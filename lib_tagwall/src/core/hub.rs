//! # Tag Hub
//!
//! Wires the registry, dispatcher, filter controller and fallback poller
//! together and owns their tasks.

use std::sync::Arc;

use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::config::HubConfig;
use crate::core::broadcaster::Broadcaster;
use crate::core::dispatcher::Dispatcher;
use crate::core::fallback_poller::{FallbackPoller, InitialLoader};
use crate::core::filter_controller::{ConnectionState, FilterController, FilterUpdateHandle};
use crate::core::rate_limiter::TokenBucket;
use crate::core::registry::TagRegistry;
use crate::error::ConfigError;
use crate::feed::source::{LiveFeed, SearchClient};

/// A running hub. Dropping it leaves the workers running; call
/// [`TagHub::shutdown`] to stop them.
pub struct TagHub {
    broadcaster: Broadcaster,
    filter: FilterUpdateHandle,
    shutdown: CancellationToken,
    tasks: Vec<JoinHandle<()>>,
}

impl TagHub {
    /// Validates `config` and spawns the filter controller and fallback
    /// poller. Must be called from within a tokio runtime.
    pub fn start(
        config: HubConfig,
        live_feed: Arc<dyn LiveFeed>,
        search: Arc<dyn SearchClient>,
    ) -> Result<Self, ConfigError> {
        config.validate()?;

        let registry = Arc::new(TagRegistry::new());
        let dispatcher = Arc::new(Dispatcher::new());
        let shutdown = CancellationToken::new();

        let (controller, filter) = FilterController::new(
            Arc::clone(&registry),
            Arc::clone(&dispatcher),
            live_feed,
            TokenBucket::new("filter", config.filter_update_rate),
            config.filter_debounce(),
            config.filter_recheck(),
        );
        let poller = FallbackPoller::new(
            Arc::clone(&registry),
            Arc::clone(&dispatcher),
            Arc::clone(&search),
            TokenBucket::new("fallback", config.fallback_poll_rate),
            filter.watch_connection(),
            config.fallback_poll_period(),
            config.tags_per_query(),
            config.search_max_results,
        );
        let loader = InitialLoader::new(
            Arc::clone(&dispatcher),
            search,
            TokenBucket::new("initial", config.initial_load_rate),
            config.search_max_results,
            shutdown.child_token(),
        );

        let tasks = vec![
            tokio::spawn(controller.run(shutdown.child_token())),
            tokio::spawn(poller.run(shutdown.child_token())),
        ];
        log::info!("Tag hub started");

        Ok(Self {
            broadcaster: Broadcaster::new(registry, dispatcher, filter.clone(), loader),
            filter,
            shutdown,
            tasks,
        })
    }

    /// The subscriber-facing entry points.
    pub fn broadcaster(&self) -> &Broadcaster {
        &self.broadcaster
    }

    /// The tracked tags.
    pub fn registry(&self) -> &Arc<TagRegistry> {
        self.broadcaster.registry()
    }

    /// Current state of the live connection.
    pub fn connection_state(&self) -> ConnectionState {
        self.filter.connection_state()
    }

    /// Receiver for connection state changes.
    pub fn watch_connection(&self) -> watch::Receiver<ConnectionState> {
        self.filter.watch_connection()
    }

    /// Stops every worker, closes the live connection and waits for the
    /// tasks to finish.
    pub async fn shutdown(self) {
        self.shutdown.cancel();
        for task in self.tasks {
            if let Err(e) = task.await {
                log::error!("Hub task ended abnormally: {}", e);
            }
        }
        log::info!("Tag hub stopped");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::registry::TagSet;
    use crate::error::FeedError;
    use crate::feed::item::FeedItem;
    use crate::feed::source::FeedStream;
    use async_trait::async_trait;
    use std::time::Duration;

    struct Offline;

    #[async_trait]
    impl LiveFeed for Offline {
        async fn connect(&self, _tags: &TagSet) -> Result<FeedStream, FeedError> {
            Err(FeedError::Connect("offline".to_string()))
        }
    }

    #[async_trait]
    impl SearchClient for Offline {
        async fn search(&self, _query: &str, _max: usize) -> Result<Vec<FeedItem>, FeedError> {
            Ok(Vec::new())
        }
    }

    fn start(config: HubConfig) -> Result<TagHub, ConfigError> {
        TagHub::start(config, Arc::new(Offline), Arc::new(Offline))
    }

    #[tokio::test]
    async fn unschedulable_periods_are_refused_at_start() {
        for secs in [1e-12, 1e30] {
            let config = HubConfig {
                fallback_poll_period_secs: secs,
                ..HubConfig::default()
            };
            assert!(matches!(
                start(config),
                Err(ConfigError::OutOfRange { field: "fallbackPollPeriodSecs", .. })
            ));
        }
    }

    #[tokio::test(start_paused = true)]
    async fn workers_survive_until_shutdown() {
        let config = HubConfig {
            fallback_poll_period_secs: 1e-3,
            ..HubConfig::default()
        };
        let hub = start(config).unwrap();
        hub.broadcaster().registry().track("alive").unwrap();
        tokio::time::sleep(Duration::from_secs(5)).await;
        assert!(hub.tasks.iter().all(|task| !task.is_finished()));
        hub.shutdown().await;
    }
}
