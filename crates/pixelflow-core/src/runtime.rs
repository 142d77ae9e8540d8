//! Local runner: every role wired over one embedded broker.

use std::sync::Arc;
use std::time::Duration;

use tokio::task::JoinHandle;

use crate::broker::{Broker, Connection};
use crate::codec::Codec;
use crate::config::Config;
use crate::dynamic::{keys, spawn_watch, DynamicCell, MemoryConfigStore};
use crate::error::Result;
use crate::pipeline::preprocess::PreprocessRoutes;
use crate::pipeline::{
    HashWorker, Loader, MessageHandler, PersistenceSink, Preprocessor, StageContext, StagePool,
    StageStats, ThumbnailRequestHandler, WorkerKind,
};
use crate::store::{Buckets, MetadataStore};
use crate::topology::{names, Topology};

/// Interval between queue depth checks while waiting for the pipeline to drain.
const IDLE_POLL: Duration = Duration::from_millis(20);

/// A complete pipeline in one process.
///
/// Construction declares the topology and starts the config watches, so it
/// must happen inside a Tokio runtime. Consumers start with [`start_workers`].
///
/// [`start_workers`]: Pipeline::start_workers
pub struct Pipeline {
    config: Config,
    broker: Broker,
    connection: Connection,
    topology: Topology,
    config_store: Arc<MemoryConfigStore>,
    context: StageContext,
    loader: Arc<Loader>,
    thumbnail_size: Arc<DynamicCell<u32>>,
    watches: Vec<JoinHandle<()>>,
    pools: Vec<StagePool>,
}

impl Pipeline {
    pub fn new(config: Config, metadata: Arc<dyn MetadataStore>) -> Result<Self> {
        let config_store = Arc::new(MemoryConfigStore::from_config(&config));
        let broker = Broker::new();
        let connection = broker.connect();
        let topology = Topology::declare(
            &connection,
            config_store.as_ref(),
            config.general.environment,
            config.general.unique_names,
        )?;

        let rate = Arc::new(DynamicCell::<f64>::from_store(
            config_store.as_ref(),
            keys::RATE_LIMIT,
        )?);
        let thumbnail_size = Arc::new(DynamicCell::<u32>::from_store(
            config_store.as_ref(),
            keys::THUMBNAIL_SIZE,
        )?);
        let watches = vec![
            spawn_watch(Arc::clone(&rate), config_store.as_ref()),
            spawn_watch(Arc::clone(&thumbnail_size), config_store.as_ref()),
        ];

        let codec: Arc<dyn Codec> = config.general.codec.codec();
        let context = StageContext {
            codec,
            publisher: Arc::new(connection.channel()?),
            buckets: Buckets::from_config(&config),
            metadata,
        };
        let loader = Arc::new(Loader::new(
            &config,
            context.clone(),
            topology.destination(names::LOADER_COMMAND)?,
            rate,
        ));

        tracing::debug!(
            "Pipeline ready ({:?} mode, {:?} codec)",
            config.general.environment,
            config.general.codec
        );
        Ok(Self {
            config,
            broker,
            connection,
            topology,
            config_store,
            context,
            loader,
            thumbnail_size,
            watches,
            pools: Vec::new(),
        })
    }

    /// Start every consumer pool. Calling it twice starts a second set.
    pub fn start_workers(&mut self) -> Result<()> {
        let count = self.config.workers.pool_size();
        let prefetch = self.config.workers.prefetch;
        let updates = self.topology.update_routes(self.context.codec.generation())?;

        let preprocessor: Arc<dyn MessageHandler> = Arc::new(Preprocessor::new(
            &self.config,
            self.context.clone(),
            PreprocessRoutes {
                digests: self.topology.destination(names::FILE_DIGESTS)?,
                perceptual: self.topology.destination(names::FILE_PREPROCESSED)?,
                updates: updates.clone(),
            },
            Arc::clone(&self.thumbnail_size),
        ));
        let digest: Arc<dyn MessageHandler> = Arc::new(HashWorker::new(
            WorkerKind::Digest,
            &self.config,
            self.context.clone(),
            updates.hashes.clone(),
        ));
        let perceptual: Arc<dyn MessageHandler> = Arc::new(HashWorker::new(
            WorkerKind::Perceptual,
            &self.config,
            self.context.clone(),
            updates.hashes,
        ));
        let sink: Arc<dyn MessageHandler> = Arc::new(PersistenceSink::new(self.context.clone()));
        let requests: Arc<dyn MessageHandler> =
            Arc::new(ThumbnailRequestHandler::new(Arc::clone(&self.loader)));

        let mut stages: Vec<(&str, usize, Arc<dyn MessageHandler>)> = vec![
            (self.topology.resolve(names::FILES)?, count, preprocessor),
            (self.topology.resolve(names::FILE_DIGESTS)?, count, digest),
            (self.topology.resolve(names::FILE_PREPROCESSED)?, count, perceptual),
            (self.topology.resolve(names::THUMBNAIL_REQUESTS)?, 1, requests),
        ];
        for queue in self.topology.update_queues()? {
            stages.push((queue, count, Arc::clone(&sink)));
        }

        for (queue, workers, handler) in stages {
            let pool = StagePool::spawn(&self.connection, queue, workers, prefetch, handler)?;
            self.pools.push(pool);
        }
        Ok(())
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    pub fn loader(&self) -> &Arc<Loader> {
        &self.loader
    }

    pub fn topology(&self) -> &Topology {
        &self.topology
    }

    pub fn buckets(&self) -> &Buckets {
        &self.context.buckets
    }

    pub fn metadata(&self) -> &Arc<dyn MetadataStore> {
        &self.context.metadata
    }

    /// The naming authority; setting the dynamic keys retunes running stages.
    pub fn config_store(&self) -> &Arc<MemoryConfigStore> {
        &self.config_store
    }

    /// A connection to the pipeline's broker, e.g. for publishing thumbnail requests.
    pub fn connect(&self) -> Connection {
        self.broker.connect()
    }

    /// Wait until every queue is empty with nothing in flight.
    ///
    /// Requires two consecutive empty readings. Returns `false` on timeout.
    pub async fn wait_idle(&self, timeout: Duration) -> bool {
        let deadline = tokio::time::Instant::now() + timeout;
        let mut empty_readings = 0;
        loop {
            if self.is_drained() {
                empty_readings += 1;
                if empty_readings >= 2 {
                    return true;
                }
            } else {
                empty_readings = 0;
            }
            if tokio::time::Instant::now() >= deadline {
                tracing::warn!("Pipeline still busy after {:?}", timeout);
                return false;
            }
            tokio::time::sleep(IDLE_POLL).await;
        }
    }

    fn is_drained(&self) -> bool {
        self.topology.queue_names().into_iter().all(|queue| {
            matches!(self.broker.queue_depth(queue), None | Some((0, 0)))
        })
    }

    /// Stop the loader, tear down an isolated topology, close the connection,
    /// and wait for every consumer to finish. Returns per-stage counters.
    pub async fn shutdown(self) -> Vec<(&'static str, StageStats)> {
        self.loader.cancel();
        if let Err(e) = self.topology.teardown_all() {
            tracing::error!("Topology teardown failed: {}", e);
        }
        self.connection.close();

        let mut totals: Vec<(&'static str, StageStats)> = Vec::new();
        for pool in self.pools {
            let stage = pool.stage();
            let stats = pool.join().await;
            match totals.iter_mut().find(|(name, _)| *name == stage) {
                Some((_, total)) => *total += stats,
                None => totals.push((stage, stats)),
            }
        }
        for watch in self.watches {
            watch.abort();
        }
        for (stage, stats) in &totals {
            tracing::info!(
                "{}: {} succeeded, {} dropped, {} rejected, {} requeued",
                stage,
                stats.succeeded,
                stats.dropped,
                stats.rejected,
                stats.requeued
            );
        }
        totals
    }
}
