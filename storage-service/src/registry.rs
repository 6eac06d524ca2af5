// SPDX-License-Identifier: GPL-3.0-only

//! Process-local registry
//!
//! Keeps records in name order, stamps each write with a monotonically increasing resource
//! version and broadcasts watch events. With a state directory every record is also
//! written as `<name>.json` and reloaded on open.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use async_trait::async_trait;
use futures_util::StreamExt;
use futures_util::stream::{self, BoxStream};
use serde::Serialize;
use serde::de::DeserializeOwned;
use tokio::sync::{Mutex, broadcast};

use storage_contracts::{AgentError, Registry, Result, WatchEvent};
use storage_types::labels::VOLUME_FINALIZER_PREFIX;
use storage_types::{LabelSelector, RegistryObject};

const WATCH_BUFFER: usize = 256;

struct Store<T> {
    records: BTreeMap<String, T>,
    version: u64,
}

pub struct LocalRegistry<T: RegistryObject> {
    store: Mutex<Store<T>>,
    events: broadcast::Sender<WatchEvent<T>>,
    state_dir: Option<PathBuf>,
}

impl<T> LocalRegistry<T>
where
    T: RegistryObject + Serialize + DeserializeOwned,
{
    pub fn in_memory() -> Self {
        Self::with_records(BTreeMap::new(), 0, None)
    }

    /// Opens a persistent registry, loading every `*.json` record under `state_dir`.
    pub async fn open(state_dir: impl Into<PathBuf>) -> Result<Self> {
        let state_dir = state_dir.into();
        tokio::fs::create_dir_all(&state_dir)
            .await
            .map_err(|e| io_error(&state_dir, e))?;

        let mut records = BTreeMap::new();
        let mut version = 0;
        let mut entries = tokio::fs::read_dir(&state_dir)
            .await
            .map_err(|e| io_error(&state_dir, e))?;
        while let Some(entry) = entries.next_entry().await.map_err(|e| io_error(&state_dir, e))? {
            let path = entry.path();
            if path.extension().and_then(|e| e.to_str()) != Some("json") {
                continue;
            }
            let bytes = tokio::fs::read(&path).await.map_err(|e| io_error(&path, e))?;
            let record: T = serde_json::from_slice(&bytes).map_err(|e| {
                AgentError::new(
                    storage_contracts::ErrorKind::ParseError,
                    format!("{}: {e}", path.display()),
                )
            })?;
            version = version.max(record.meta().resource_version);
            records.insert(record.name().to_string(), record);
        }

        tracing::info!(
            kind = T::KIND,
            records = records.len(),
            dir = %state_dir.display(),
            "registry loaded"
        );
        Ok(Self::with_records(records, version, Some(state_dir)))
    }

    fn with_records(records: BTreeMap<String, T>, version: u64, state_dir: Option<PathBuf>) -> Self {
        let (events, _) = broadcast::channel(WATCH_BUFFER);
        Self {
            store: Mutex::new(Store { records, version }),
            events,
            state_dir,
        }
    }

    fn record_path(&self, name: &str) -> Option<PathBuf> {
        self.state_dir.as_ref().map(|dir| dir.join(format!("{name}.json")))
    }

    async fn persist(&self, record: &T) -> Result<()> {
        let Some(path) = self.record_path(record.name()) else {
            return Ok(());
        };
        let bytes = serde_json::to_vec_pretty(record)
            .map_err(|e| AgentError::internal(format!("serialize {}: {e}", record.name())))?;
        let staging = path.with_extension("json.tmp");
        tokio::fs::write(&staging, bytes)
            .await
            .map_err(|e| io_error(&staging, e))?;
        tokio::fs::rename(&staging, &path)
            .await
            .map_err(|e| io_error(&path, e))
    }

    async fn forget(&self, name: &str) -> Result<()> {
        let Some(path) = self.record_path(name) else {
            return Ok(());
        };
        match tokio::fs::remove_file(&path).await {
            Err(e) if e.kind() != std::io::ErrorKind::NotFound => Err(io_error(&path, e)),
            _ => Ok(()),
        }
    }

    fn publish(&self, event: WatchEvent<T>) {
        // No receivers is not an error.
        let _ = self.events.send(event);
    }
}

fn validate_name(kind: &str, name: &str) -> Result<()> {
    if name.is_empty() || name.contains('/') || name.starts_with('.') {
        return Err(AgentError::internal(format!("invalid {kind} name '{name}'")));
    }
    Ok(())
}

fn io_error(path: &Path, err: std::io::Error) -> AgentError {
    AgentError::internal(format!("{}: {err}", path.display()))
}

fn event_object<T>(event: &WatchEvent<T>) -> &T {
    match event {
        WatchEvent::Added(record) | WatchEvent::Modified(record) | WatchEvent::Deleted(record) => record,
    }
}

#[async_trait]
impl<T> Registry<T> for LocalRegistry<T>
where
    T: RegistryObject + Serialize + DeserializeOwned,
{
    async fn list(
        &self,
        selector: &LabelSelector,
        page_size: usize,
    ) -> Result<BoxStream<'static, Result<T>>> {
        let matching: Vec<T> = {
            let store = self.store.lock().await;
            store
                .records
                .values()
                .filter(|record| selector.matches(&record.meta().labels))
                .cloned()
                .collect()
        };

        let page_size = page_size.max(1);
        let pages: Vec<Vec<T>> = matching.chunks(page_size).map(<[T]>::to_vec).collect();
        Ok(stream::iter(pages)
            .flat_map(|page| stream::iter(page.into_iter().map(Ok)))
            .boxed())
    }

    async fn get(&self, name: &str) -> Result<T> {
        self.store
            .lock()
            .await
            .records
            .get(name)
            .cloned()
            .ok_or_else(|| AgentError::not_found(T::KIND, name))
    }

    async fn create(&self, mut record: T) -> Result<T> {
        validate_name(T::KIND, record.name())?;
        let mut store = self.store.lock().await;
        if store.records.contains_key(record.name()) {
            return Err(AgentError::conflict(format!(
                "{} {} already exists",
                T::KIND,
                record.name()
            )));
        }
        store.version += 1;
        record.meta_mut().resource_version = store.version;
        self.persist(&record).await?;
        store.records.insert(record.name().to_string(), record.clone());
        drop(store);

        self.publish(WatchEvent::Added(record.clone()));
        Ok(record)
    }

    async fn update(&self, mut record: T) -> Result<T> {
        let mut store = self.store.lock().await;
        let stored_version = store
            .records
            .get(record.name())
            .map(|stored| stored.meta().resource_version)
            .ok_or_else(|| AgentError::not_found(T::KIND, record.name()))?;
        if stored_version != record.meta().resource_version {
            return Err(AgentError::conflict(format!(
                "{} {} was modified (version {} != {})",
                T::KIND,
                record.name(),
                record.meta().resource_version,
                stored_version
            )));
        }
        store.version += 1;
        record.meta_mut().resource_version = store.version;
        self.persist(&record).await?;
        store.records.insert(record.name().to_string(), record.clone());
        drop(store);

        self.publish(WatchEvent::Modified(record.clone()));
        Ok(record)
    }

    /// Refused with `Conflict` while the record still carries volume finalizers.
    async fn delete(&self, name: &str) -> Result<()> {
        let mut store = self.store.lock().await;
        let record = store
            .records
            .get(name)
            .ok_or_else(|| AgentError::not_found(T::KIND, name))?;
        if let Some(finalizer) = record
            .meta()
            .finalizers
            .iter()
            .find(|f| f.starts_with(VOLUME_FINALIZER_PREFIX))
        {
            return Err(AgentError::conflict(format!(
                "{} {name} is still referenced by {finalizer}",
                T::KIND
            )));
        }
        self.forget(name).await?;
        let removed = store.records.remove(name);
        drop(store);

        if let Some(record) = removed {
            self.publish(WatchEvent::Deleted(record));
        }
        Ok(())
    }

    async fn watch(&self, selector: &LabelSelector) -> Result<BoxStream<'static, WatchEvent<T>>> {
        let receiver = self.events.subscribe();
        let selector = selector.clone();
        Ok(stream::unfold(receiver, move |mut receiver| {
            let selector = selector.clone();
            async move {
                loop {
                    match receiver.recv().await {
                        Ok(event) if selector.matches(&event_object(&event).meta().labels) => {
                            return Some((event, receiver));
                        }
                        Ok(_) => continue,
                        Err(broadcast::error::RecvError::Lagged(skipped)) => {
                            tracing::warn!(kind = T::KIND, skipped, "watch fell behind");
                        }
                        Err(broadcast::error::RecvError::Closed) => return None,
                    }
                }
            }
        })
        .boxed())
    }
}
