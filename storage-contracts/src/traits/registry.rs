// SPDX-License-Identifier: GPL-3.0-only

use async_trait::async_trait;
use futures_util::TryStreamExt;
use futures_util::stream::BoxStream;

use storage_types::{Drive, LabelSelector, RegistryObject, Volume};

use crate::Result;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WatchEvent<T> {
    Added(T),
    Modified(T),
    Deleted(T),
}

/// Cluster-wide record store.
///
/// `update` fails with `ErrorKind::Conflict` when the record's resource version is stale
/// and with `ErrorKind::NotFound` when the record is gone. Transport failures surface as
/// any other kind.
#[async_trait]
pub trait Registry<T: RegistryObject>: Send + Sync {
    async fn list(
        &self,
        selector: &LabelSelector,
        page_size: usize,
    ) -> Result<BoxStream<'static, Result<T>>>;

    async fn get(&self, name: &str) -> Result<T>;

    async fn create(&self, record: T) -> Result<T>;

    async fn update(&self, record: T) -> Result<T>;

    async fn delete(&self, name: &str) -> Result<()>;

    async fn watch(&self, selector: &LabelSelector) -> Result<BoxStream<'static, WatchEvent<T>>>;
}

pub type DriveRegistry = dyn Registry<Drive>;
pub type VolumeRegistry = dyn Registry<Volume>;

/// Drains a paged `list` into memory, preserving registry order.
pub async fn list_all<T: RegistryObject>(
    registry: &dyn Registry<T>,
    selector: &LabelSelector,
    page_size: usize,
) -> Result<Vec<T>> {
    registry.list(selector, page_size).await?.try_collect().await
}
