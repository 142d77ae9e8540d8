//! Queue and exchange topology.
//!
//! Stages refer to queues by logical name. [`Topology`] maps every logical
//! name to its physical name once, at construction, and declares the queues
//! and exchanges on the broker.
//!
//! In isolated mode every name is prefixed with `isolated-` (plus a random
//! per-instance suffix when unique names are requested) and everything is
//! declared auto-delete, so parallel test runs neither collide nor leak.

use rand::distributions::Alphanumeric;
use rand::Rng;
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, Ordering};

use crate::broker::{Channel, Connection, Destination, ExchangeKind, QueueOptions};
use crate::codec::Generation;
use crate::config::Environment;
use crate::dynamic::{keys, ConfigStore};
use crate::error::{BrokerError, ConfigError, PixelflowError, TopologyError};

/// Logical queue and exchange names.
pub mod names {
    /// Load jobs fanned out by the loader.
    pub const FILES: &str = "files";
    /// Jobs with perceptual hash work, after preprocessing.
    pub const FILE_PREPROCESSED: &str = "file-preprocessed";
    /// Jobs with digest work, after preprocessing.
    pub const FILE_DIGESTS: &str = "file-digests";
    /// Structured persistence updates.
    pub const PERSISTENCE: &str = "persistence";
    /// Legacy hash updates.
    pub const HASHES: &str = "hashes";
    /// Legacy thumbnail updates.
    pub const THUMBNAILS: &str = "thumbnails";
    /// Thumbnail re-creation requests.
    pub const THUMBNAIL_REQUESTS: &str = "thumbnail-requests";
    /// Fan-out exchange the loader publishes to.
    pub const LOADER_COMMAND: &str = "loader-command";

    pub const QUEUES: [&str; 7] = [
        FILES,
        FILE_PREPROCESSED,
        FILE_DIGESTS,
        PERSISTENCE,
        HASHES,
        THUMBNAILS,
        THUMBNAIL_REQUESTS,
    ];

    pub const EXCHANGES: [&str; 1] = [LOADER_COMMAND];

    pub const ALL: [&str; 8] = [
        FILES,
        FILE_PREPROCESSED,
        FILE_DIGESTS,
        PERSISTENCE,
        HASHES,
        THUMBNAILS,
        THUMBNAIL_REQUESTS,
        LOADER_COMMAND,
    ];
}

/// Where persistence updates of each kind are published.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UpdateRoutes {
    pub hashes: Destination,
    pub thumbnails: Destination,
}

/// Declared topology with a stable logical -> physical mapping.
pub struct Topology {
    environment: Environment,
    physical: BTreeMap<&'static str, String>,
    channel: Channel,
    torn_down: AtomicBool,
}

impl Topology {
    /// Resolve every name through the config store and declare it.
    ///
    /// Fails with `ConfigError::Missing` when the store has no name for a
    /// logical queue, and with a broker error when a declaration conflicts.
    pub fn declare(
        connection: &Connection,
        store: &dyn ConfigStore,
        environment: Environment,
        unique: bool,
    ) -> Result<Self, PixelflowError> {
        let suffix = match (environment, unique) {
            (Environment::Isolated, true) => Some(instance_suffix()),
            _ => None,
        };

        let mut physical = BTreeMap::new();
        for logical in names::ALL {
            let key = keys::topology(logical);
            let configured = store.get(&key).ok_or(ConfigError::Missing(key))?;
            let name = match environment {
                Environment::Production => configured,
                Environment::Isolated => match &suffix {
                    Some(suffix) => format!("isolated-{configured}-{suffix}"),
                    None => format!("isolated-{configured}"),
                },
            };
            physical.insert(logical, name);
        }

        let topology = Self {
            environment,
            physical,
            channel: connection.channel()?,
            torn_down: AtomicBool::new(false),
        };
        topology.declare_all()?;
        tracing::info!(
            "Declared {} queues ({:?} mode)",
            names::QUEUES.len(),
            environment
        );
        Ok(topology)
    }

    fn declare_all(&self) -> Result<(), PixelflowError> {
        let (options, auto_delete) = match self.environment {
            Environment::Production => (QueueOptions::DURABLE, false),
            Environment::Isolated => (QueueOptions::TRANSIENT, true),
        };
        for logical in names::QUEUES {
            self.channel.queue_declare(self.resolve(logical)?, options)?;
        }
        let exchange = self.resolve(names::LOADER_COMMAND)?;
        self.channel
            .exchange_declare(exchange, ExchangeKind::Fanout, auto_delete)?;
        self.channel
            .queue_bind(self.resolve(names::FILES)?, exchange, "")?;
        Ok(())
    }

    pub fn environment(&self) -> Environment {
        self.environment
    }

    /// Physical name of a logical queue or exchange.
    pub fn resolve(&self, logical: &str) -> Result<&str, TopologyError> {
        self.physical
            .get(logical)
            .map(String::as_str)
            .ok_or_else(|| TopologyError::UnknownQueue(logical.to_string()))
    }

    /// Publish destination for a logical name.
    pub fn destination(&self, logical: &str) -> Result<Destination, TopologyError> {
        let name = self.resolve(logical)?;
        if names::EXCHANGES.contains(&logical) {
            Ok(Destination::exchange(name))
        } else {
            Ok(Destination::queue(name))
        }
    }

    /// Destinations for persistence updates under a codec generation.
    pub fn update_routes(&self, generation: Generation) -> Result<UpdateRoutes, TopologyError> {
        Ok(match generation {
            Generation::Structured => {
                let persistence = self.destination(names::PERSISTENCE)?;
                UpdateRoutes {
                    hashes: persistence.clone(),
                    thumbnails: persistence,
                }
            }
            Generation::Legacy => UpdateRoutes {
                hashes: self.destination(names::HASHES)?,
                thumbnails: self.destination(names::THUMBNAILS)?,
            },
        })
    }

    /// Physical names of every queue the persistence sink consumes.
    pub fn update_queues(&self) -> Result<Vec<&str>, TopologyError> {
        [names::PERSISTENCE, names::HASHES, names::THUMBNAILS]
            .into_iter()
            .map(|logical| self.resolve(logical))
            .collect()
    }

    /// Physical names of every declared queue.
    pub fn queue_names(&self) -> Vec<&str> {
        names::QUEUES
            .iter()
            .filter_map(|logical| self.physical.get(logical).map(String::as_str))
            .collect()
    }

    /// Delete every isolated queue and exchange. Idempotent; a no-op in
    /// production mode.
    pub fn teardown_all(&self) -> Result<(), BrokerError> {
        if self.environment == Environment::Production {
            return Ok(());
        }
        if self.torn_down.load(Ordering::Acquire) {
            return Ok(());
        }
        match self.delete_all() {
            // Closing the connection already removed the auto-delete objects.
            Ok(()) | Err(BrokerError::ConnectionClosed) => {
                self.torn_down.store(true, Ordering::Release);
                Ok(())
            }
            // Deletes tolerate missing objects, so a later call can finish the job.
            Err(e) => Err(e),
        }
    }

    fn delete_all(&self) -> Result<(), BrokerError> {
        for name in self.queue_names() {
            self.channel.queue_delete(name)?;
        }
        for logical in names::EXCHANGES {
            if let Some(name) = self.physical.get(logical) {
                self.channel.exchange_delete(name)?;
            }
        }
        tracing::info!("Tore down isolated topology");
        Ok(())
    }
}

fn instance_suffix() -> String {
    rand::thread_rng()
        .sample_iter(&Alphanumeric)
        .take(8)
        .map(|b| char::from(b).to_ascii_lowercase())
        .collect()
}
