use std::sync::Arc;

use log::{info, warn};
use parking_lot::Mutex;
use tokio::runtime::Handle;

use crate::buffer::analyzer::Analyzer;
use crate::buffer::atomic_buffer::{AtomicBuffer, BufferStats};
use crate::buffer::evictor::Evictor;
use crate::buffer::index_tree::IndexTree;
use crate::common::config::{ContainerId, DataPlaneConfig};
use crate::common::exception::StorageError;
use crate::query::index_query::IndexQuery;
use crate::query::query_engine::QueryEngine;
use crate::storage::index::branch_indexer::BranchIndexer;
use crate::storage::persistence::{JobHandle, JobReport, PersistenceManager};
use crate::types_db::record::Record;

/// One data plane: the record chain with its analyzer thread and evictor task, the live
/// index behind the query engine, and the persistence manager.
pub struct MonitorInstance {
    config: DataPlaneConfig,
    buffer: Arc<AtomicBuffer>,
    analyzer: Mutex<Option<Analyzer>>,
    evictor: Arc<Evictor>,
    query_engine: QueryEngine,
    persistence: PersistenceManager,
}

impl MonitorInstance {
    /// Validates `config` and starts the background stages on the current runtime.
    pub async fn new(config: DataPlaneConfig) -> Result<Self, StorageError> {
        config.validate()?;

        let tree = Arc::new(IndexTree::new(BranchIndexer::buffer_default()));
        let buffer = Arc::new(AtomicBuffer::new(&config, Arc::clone(&tree)));
        let analyzer = Analyzer::spawn(Arc::clone(&buffer))?;
        let evictor = Arc::new(Evictor::new(Arc::clone(&buffer), config.eviction_interval()));
        evictor.start();

        let instance = Self {
            query_engine: QueryEngine::new(tree),
            persistence: PersistenceManager::new(&config, Handle::current()),
            analyzer: Mutex::new(Some(analyzer)),
            buffer,
            evictor,
            config,
        };
        info!("Monitor instance started, storage root {:?}", instance.config.storage_root);
        Ok(instance)
    }

    pub fn config(&self) -> &DataPlaneConfig {
        &self.config
    }

    pub fn buffer(&self) -> &Arc<AtomicBuffer> {
        &self.buffer
    }

    pub fn evictor(&self) -> &Arc<Evictor> {
        &self.evictor
    }

    pub fn query_engine(&self) -> &QueryEngine {
        &self.query_engine
    }

    pub fn persistence(&self) -> &PersistenceManager {
        &self.persistence
    }

    pub fn stats(&self) -> BufferStats {
        self.buffer.stats()
    }

    /// Appends `record` to the chain. The returned reference keeps it alive past eviction.
    pub fn ingest(&self, record: Record) -> Arc<Record> {
        let record = Arc::new(record);
        self.buffer.append(Arc::clone(&record));
        record
    }

    pub fn query(&self, query: &IndexQuery) -> Vec<Arc<Record>> {
        self.query_engine.query(query)
    }

    pub fn query_parallel(&self, query: &IndexQuery) -> Vec<Arc<Record>> {
        self.query_engine.query_parallel(query)
    }

    pub async fn begin_job(&self, container_id: ContainerId) -> Result<JobHandle, StorageError> {
        self.persistence.begin_job(container_id).await
    }

    pub fn persist(&self, job: &JobHandle, record: Arc<Record>) -> Result<(), StorageError> {
        self.persistence.persist(job, record)
    }

    pub async fn close_job(&self, job: JobHandle) -> Result<JobReport, StorageError> {
        self.persistence.close_job(job).await
    }

    /// Stops the background stages and closes every job still open.
    pub async fn shutdown(&self) -> Result<Vec<JobReport>, StorageError> {
        self.evictor.stop();
        let analyzer = self.analyzer.lock().take();
        if let Some(mut analyzer) = analyzer {
            tokio::task::spawn_blocking(move || analyzer.stop())
                .await
                .map_err(|e| StorageError::TaskAborted(e.to_string()))?;
        }

        let mut reports = Vec::new();
        for job in self.persistence.job_handles() {
            let container_id = job.container_id();
            match self.persistence.close_job(job).await {
                Ok(report) => reports.push(report),
                Err(StorageError::JobClosed(_)) => warn!("Job {} was closed concurrently with shutdown", container_id),
                Err(e) => return Err(e),
            }
        }
        info!("Monitor instance shut down, {} jobs closed", reports.len());
        Ok(reports)
    }
}
