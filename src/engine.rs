//! Backend wiring.
//!
//! Resolves the broker and result store URLs into trait objects and builds
//! the dispatcher, worker pool, beat scheduler and monitor on top of them.
//!
//! | URL scheme                  | Broker + lock      | Result store      |
//! |-----------------------------|--------------------|-------------------|
//! | `redis://`, `rediss://`     | Redis              | -                 |
//! | `postgres://`, `postgresql://` | -               | PostgreSQL        |
//! | `memory://`                 | in-process         | in-process        |

use std::sync::Arc;

use tracing::{info, warn};

use crate::beat::{BeatConfig, BeatScheduler, ScheduleTable};
use crate::broker::{Broker, MemoryBroker, RedisBroker};
use crate::config::EngineConfig;
use crate::dispatcher::Dispatcher;
use crate::error::EngineError;
use crate::lock::{LeaseLock, MemoryLock, RedisLock};
use crate::monitor::Monitor;
use crate::registry::TaskRegistry;
use crate::store::{
    MemoryStore, PostgresStore, ResultStore, ScheduleStateStore, StoreError, SyncLogStore,
};
use crate::sync::{self, EventSyncContext, SyncContext};
use crate::worker::{WorkerPool, WorkerPoolConfig};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Scheme {
    Memory,
    Redis,
    Postgres,
}

fn scheme(component: &'static str, url: &str) -> Result<Scheme, EngineError> {
    let prefix = url.split("://").next().unwrap_or_default();
    match prefix {
        "memory" if url.contains("://") => Ok(Scheme::Memory),
        "redis" | "rediss" | "redis+unix" => Ok(Scheme::Redis),
        "postgres" | "postgresql" => Ok(Scheme::Postgres),
        _ => Err(EngineError::UnsupportedUrl {
            component,
            url: url.to_string(),
        }),
    }
}

/// Connected broker, lock and store handles.
#[derive(Clone)]
pub struct Backends {
    pub broker: Arc<dyn Broker>,
    pub lock: Arc<dyn LeaseLock>,
    pub store: Arc<dyn ResultStore>,
    pub schedule_state: Arc<dyn ScheduleStateStore>,
    pub sync_log: Arc<dyn SyncLogStore>,
    postgres: Option<Arc<PostgresStore>>,
}

impl Backends {
    /// Everything in process memory. State dies with the process.
    pub fn in_memory() -> Self {
        let store = Arc::new(MemoryStore::new());
        Self {
            broker: Arc::new(MemoryBroker::new()),
            lock: Arc::new(MemoryLock::new()),
            store: store.clone(),
            schedule_state: store.clone(),
            sync_log: store,
            postgres: None,
        }
    }

    /// Connects to the backends named in `config`.
    ///
    /// # Errors
    ///
    /// Fails when a URL scheme is unsupported or a backend is unreachable.
    /// An unreachable result store is always fatal.
    pub async fn connect(config: &EngineConfig) -> Result<Self, EngineError> {
        let broker_scheme = scheme("broker", &config.broker_url)?;
        let store_scheme = scheme("result store", &config.result_store_url)?;

        let (broker, lock): (Arc<dyn Broker>, Arc<dyn LeaseLock>) = match broker_scheme {
            Scheme::Memory => (Arc::new(MemoryBroker::new()), Arc::new(MemoryLock::new())),
            Scheme::Redis => {
                let broker = RedisBroker::connect(&config.broker_url, &config.namespace).await?;
                let lock = RedisLock::from_connection(broker.connection(), &config.namespace);
                (Arc::new(broker), Arc::new(lock))
            }
            Scheme::Postgres => {
                return Err(EngineError::UnsupportedUrl {
                    component: "broker",
                    url: config.broker_url.clone(),
                })
            }
        };
        if let Err(e) = broker.ping().await {
            warn!(error = %e, "Broker not reachable yet, will keep retrying");
        }

        let backends = match store_scheme {
            Scheme::Memory => {
                let store = Arc::new(MemoryStore::new());
                Self {
                    broker,
                    lock,
                    store: store.clone(),
                    schedule_state: store.clone(),
                    sync_log: store,
                    postgres: None,
                }
            }
            Scheme::Postgres => {
                let store = Arc::new(PostgresStore::connect(&config.result_store_url).await?);
                Self {
                    broker,
                    lock,
                    store: store.clone(),
                    schedule_state: store.clone(),
                    sync_log: store.clone(),
                    postgres: Some(store),
                }
            }
            Scheme::Redis => {
                return Err(EngineError::UnsupportedUrl {
                    component: "result store",
                    url: config.result_store_url.clone(),
                })
            }
        };

        backends.store.ping().await?;
        info!(
            broker = ?broker_scheme,
            store = ?store_scheme,
            namespace = %config.namespace,
            "Backends connected"
        );
        Ok(backends)
    }

    /// Creates the result store tables. Returns the number of statements
    /// applied; in-memory stores need none.
    pub async fn migrate(&self) -> Result<usize, StoreError> {
        match &self.postgres {
            Some(store) => store.run_migrations().await,
            None => Ok(0),
        }
    }

    pub fn dispatcher(&self) -> Dispatcher {
        Dispatcher::new(Arc::clone(&self.broker), Arc::clone(&self.store))
    }

    /// Task registry with the built-in tasks. `sync.reservations` needs both
    /// sync URLs; `sync.events` only the data source.
    pub fn registry(&self, config: &EngineConfig) -> TaskRegistry {
        let mut registry = TaskRegistry::new();
        match SyncContext::from_config(config, Arc::clone(&self.sync_log)) {
            Ok(ctx) => sync::register(&mut registry, Arc::new(ctx)),
            Err(e) => warn!(error = %e, "Sync tasks disabled"),
        }
        match EventSyncContext::from_config(config, Arc::clone(&self.sync_log)) {
            Ok(ctx) => sync::register_events(&mut registry, Arc::new(ctx)),
            Err(e) => warn!(error = %e, "Event sync disabled"),
        }
        registry
    }

    pub fn worker_pool(&self, config: &EngineConfig, registry: TaskRegistry) -> WorkerPool {
        let pool_config = WorkerPoolConfig::new(config.concurrency)
            .with_queues(config.queues.clone())
            .with_visibility_timeout(config.visibility_timeout)
            .with_retry_policy(config.retry_policy());
        WorkerPool::new(
            pool_config,
            Arc::clone(&self.broker),
            Arc::clone(&self.store),
            registry,
        )
    }

    pub fn beat(
        &self,
        config: &EngineConfig,
        table: ScheduleTable,
        dispatcher: Arc<Dispatcher>,
    ) -> BeatScheduler {
        let beat_config = BeatConfig::default()
            .with_tick_interval(config.beat_tick)
            .with_lock_ttl(config.lock_ttl);
        BeatScheduler::new(
            beat_config,
            table,
            dispatcher,
            Arc::clone(&self.lock),
            Arc::clone(&self.schedule_state),
        )
    }

    pub fn monitor(&self) -> Monitor {
        Monitor::new(Arc::clone(&self.broker), Arc::clone(&self.store))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sync::{SYNC_EVENTS, SYNC_RESERVATIONS};

    #[test]
    fn test_scheme() {
        assert_eq!(scheme("broker", "redis://localhost:6379").unwrap(), Scheme::Redis);
        assert_eq!(scheme("broker", "memory://").unwrap(), Scheme::Memory);
        assert_eq!(
            scheme("store", "postgresql://u@db/tasks").unwrap(),
            Scheme::Postgres
        );
        assert!(scheme("broker", "amqp://rabbit").is_err());
        assert!(scheme("broker", "memory").is_err());
    }

    #[tokio::test]
    async fn test_connect_in_memory() {
        let config = EngineConfig::default()
            .with_broker_url("memory://")
            .with_result_store_url("memory://");
        let backends = Backends::connect(&config).await.unwrap();
        assert_eq!(backends.migrate().await.unwrap(), 0);
        assert!(backends.store.ping().await.is_ok());
    }

    #[tokio::test]
    async fn test_mismatched_schemes_rejected() {
        let config = EngineConfig::default()
            .with_broker_url("postgres://db/tasks")
            .with_result_store_url("memory://");
        let err = Backends::connect(&config).await.err().unwrap();
        assert!(matches!(err, EngineError::UnsupportedUrl { component: "broker", .. }));
    }

    #[test]
    fn test_registry_registers_sync_when_configured() {
        let backends = Backends::in_memory();
        let registry = backends.registry(&EngineConfig::default());
        assert!(!registry.contains(SYNC_RESERVATIONS));
        assert!(!registry.contains(SYNC_EVENTS));

        let mut config = EngineConfig::default();
        config.datasource_url = Some("http://source.local/".to_string());
        let registry = backends.registry(&config);
        assert!(registry.contains(SYNC_EVENTS));
        assert!(!registry.contains(SYNC_RESERVATIONS));

        config.destination_url = Some("http://dest.local/".to_string());
        assert!(backends.registry(&config).contains(SYNC_RESERVATIONS));
    }
}
