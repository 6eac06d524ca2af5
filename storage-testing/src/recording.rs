use std::collections::VecDeque;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use async_trait::async_trait;
use futures_util::stream::BoxStream;

use storage_contracts::{AgentError, Registry, Result, WatchEvent};
use storage_types::{LabelSelector, RegistryObject};

/// Successful writes seen by a [`RecordingRegistry`]
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct WriteCounts {
    pub creates: usize,
    pub updates: usize,
    pub deletes: usize,
}

impl WriteCounts {
    pub fn total(&self) -> usize {
        self.creates + self.updates + self.deletes
    }
}

#[derive(Debug, Default)]
struct Recorded {
    counts: WriteCounts,
    conflicts: usize,
    failures: VecDeque<AgentError>,
}

/// Wraps a registry, counting successful writes and failing writes on demand.
pub struct RecordingRegistry<T: RegistryObject> {
    inner: Arc<dyn Registry<T>>,
    recorded: Mutex<Recorded>,
}

impl<T: RegistryObject> RecordingRegistry<T> {
    pub fn new(inner: Arc<dyn Registry<T>>) -> Self {
        Self {
            inner,
            recorded: Mutex::new(Recorded::default()),
        }
    }

    fn recorded(&self) -> MutexGuard<'_, Recorded> {
        self.recorded.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn writes(&self) -> WriteCounts {
        self.recorded().counts
    }

    pub fn reset(&self) {
        self.recorded().counts = WriteCounts::default();
    }

    /// The next `count` updates fail with `Conflict` before reaching the inner registry
    pub fn inject_conflicts(&self, count: usize) {
        self.recorded().conflicts += count;
    }

    /// The next write of any kind fails with `error`
    pub fn fail_next_write(&self, error: AgentError) {
        self.recorded().failures.push_back(error);
    }

    fn injected(&self, update: bool) -> Result<()> {
        let mut recorded = self.recorded();
        if let Some(error) = recorded.failures.pop_front() {
            return Err(error);
        }
        if update && recorded.conflicts > 0 {
            recorded.conflicts -= 1;
            return Err(AgentError::conflict("injected conflict"));
        }
        Ok(())
    }
}

#[async_trait]
impl<T: RegistryObject> Registry<T> for RecordingRegistry<T> {
    async fn list(
        &self,
        selector: &LabelSelector,
        page_size: usize,
    ) -> Result<BoxStream<'static, Result<T>>> {
        self.inner.list(selector, page_size).await
    }

    async fn get(&self, name: &str) -> Result<T> {
        self.inner.get(name).await
    }

    async fn create(&self, record: T) -> Result<T> {
        self.injected(false)?;
        let created = self.inner.create(record).await?;
        self.recorded().counts.creates += 1;
        Ok(created)
    }

    async fn update(&self, record: T) -> Result<T> {
        self.injected(true)?;
        let updated = self.inner.update(record).await?;
        self.recorded().counts.updates += 1;
        Ok(updated)
    }

    async fn delete(&self, name: &str) -> Result<()> {
        self.injected(false)?;
        self.inner.delete(name).await?;
        self.recorded().counts.deletes += 1;
        Ok(())
    }

    async fn watch(&self, selector: &LabelSelector) -> Result<BoxStream<'static, WatchEvent<T>>> {
        self.inner.watch(selector).await
    }
}
