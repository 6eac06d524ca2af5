// SPDX-License-Identifier: GPL-3.0-only

//! Mount event listener
//!
//! A worker task waits for the kernel to flag the mount-info file (POLLPRI), re-reads it,
//! diffs it against the previous snapshot keyed by mount point and buffers the resulting
//! events. A consumer drains them one at a time with [`MountListener::get`].

use std::collections::{BTreeMap, HashMap, VecDeque};
use std::fs::File;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use async_trait::async_trait;
use tokio::io::Interest;
use tokio::io::unix::AsyncFd;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use storage_types::MountInfo;

use crate::backoff::Backoff;
use crate::mountinfo::parse_mount_entries;
use crate::{Result, SysError};

/// Safety-net resync when no kernel notification arrives
pub const DEFAULT_RESYNC_INTERVAL: Duration = Duration::from_secs(10 * 60);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MountEventKind {
    Attached,
    Modified,
    Detached,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MountEvent {
    pub kind: MountEventKind,
    pub mount_point: String,
    /// Current record; for `Detached` the last record seen
    pub info: MountInfo,
    /// Record before the change, for `Modified`
    pub previous: Option<MountInfo>,
}

/// Where mount snapshots come from and how change notifications arrive
#[async_trait]
pub trait MountSource: Send + Sync + 'static {
    async fn read(&self) -> Result<Vec<MountInfo>>;

    /// Resolves when the kernel reports that the mount table changed
    async fn changed(&self) -> Result<()>;
}

/// Mount source backed by a `/proc/<pid>/mountinfo` file
pub struct ProcMountSource {
    path: PathBuf,
    fd: AsyncFd<File>,
}

impl ProcMountSource {
    /// Opens `path` and registers it for priority readiness. Must run inside a tokio runtime.
    pub fn open(path: &Path) -> Result<Self> {
        let file = File::open(path)?;
        let fd = AsyncFd::with_interest(file, Interest::PRIORITY)?;
        Ok(Self {
            path: path.to_path_buf(),
            fd,
        })
    }
}

#[async_trait]
impl MountSource for ProcMountSource {
    async fn read(&self) -> Result<Vec<MountInfo>> {
        let input = tokio::fs::read_to_string(&self.path).await?;
        parse_mount_entries(&input)
    }

    async fn changed(&self) -> Result<()> {
        let mut guard = self.fd.ready(Interest::PRIORITY).await?;
        guard.clear_ready();
        Ok(())
    }
}

/// Last-write-wins buffer delivered in first-insertion order
struct EventBuffer {
    events: HashMap<String, MountEvent>,
    order: VecDeque<String>,
    /// One-shot completion handle, fired and replaced on every push
    waiter: CancellationToken,
}

impl EventBuffer {
    fn new() -> Self {
        Self {
            events: HashMap::new(),
            order: VecDeque::new(),
            waiter: CancellationToken::new(),
        }
    }

    fn push(&mut self, event: MountEvent) {
        let key = event.mount_point.clone();
        if self.events.insert(key.clone(), event).is_none() {
            self.order.push_back(key);
        }
        let fired = std::mem::replace(&mut self.waiter, CancellationToken::new());
        fired.cancel();
    }

    fn pop(&mut self) -> Option<MountEvent> {
        while let Some(key) = self.order.pop_front() {
            if let Some(event) = self.events.remove(&key) {
                return Some(event);
            }
        }
        None
    }
}

struct Shared {
    buffer: Mutex<EventBuffer>,
    closed: CancellationToken,
}

impl Shared {
    fn buffer(&self) -> MutexGuard<'_, EventBuffer> {
        self.buffer.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn push_all(&self, events: Vec<MountEvent>) {
        if events.is_empty() {
            return;
        }
        let mut buffer = self.buffer();
        for event in events {
            tracing::debug!(
                mount_point = %event.mount_point,
                kind = ?event.kind,
                "mount event"
            );
            buffer.push(event);
        }
    }
}

pub struct MountListener {
    shared: Arc<Shared>,
    worker: Mutex<Option<JoinHandle<()>>>,
}

impl MountListener {
    /// Captures the baseline snapshot and spawns the watch worker.
    ///
    /// Failing to read the baseline is fatal and returned to the caller.
    pub async fn start<S: MountSource>(
        source: S,
        resync_interval: Duration,
        cancel: CancellationToken,
    ) -> Result<Self> {
        let baseline = index_by_mount_point(source.read().await?);
        let shared = Arc::new(Shared {
            buffer: Mutex::new(EventBuffer::new()),
            closed: CancellationToken::new(),
        });

        let worker = tokio::spawn(watch(
            source,
            baseline,
            resync_interval,
            Arc::clone(&shared),
            cancel,
        ));

        Ok(Self {
            shared,
            worker: Mutex::new(Some(worker)),
        })
    }

    /// Waits for the next event.
    ///
    /// Returns `SysError::Cancelled` without consuming anything when `cancel` fires and
    /// `SysError::Closed` once the listener is closed and drained.
    pub async fn get(&self, cancel: &CancellationToken) -> Result<MountEvent> {
        loop {
            let waiter = {
                let mut buffer = self.shared.buffer();
                if let Some(event) = buffer.pop() {
                    return Ok(event);
                }
                if self.shared.closed.is_cancelled() {
                    return Err(SysError::Closed);
                }
                buffer.waiter.clone()
            };

            tokio::select! {
                _ = cancel.cancelled() => return Err(SysError::Cancelled),
                _ = self.shared.closed.cancelled() => return Err(SysError::Closed),
                _ = waiter.cancelled() => {}
            }
        }
    }

    /// Stops the worker. Safe to call more than once.
    pub fn close(&self) {
        self.shared.closed.cancel();
        let worker = self
            .worker
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        if let Some(worker) = worker {
            worker.abort();
        }
    }

    pub fn is_closed(&self) -> bool {
        self.shared.closed.is_cancelled()
    }
}

impl Drop for MountListener {
    fn drop(&mut self) {
        self.close();
    }
}

async fn watch<S: MountSource>(
    source: S,
    mut previous: BTreeMap<String, MountInfo>,
    resync_interval: Duration,
    shared: Arc<Shared>,
    cancel: CancellationToken,
) {
    let mut backoff = Backoff::mount_listener();

    loop {
        tokio::select! {
            _ = cancel.cancelled() => break,
            _ = shared.closed.cancelled() => break,
            woke = tokio::time::timeout(resync_interval, source.changed()) => {
                if let Ok(Err(err)) = woke {
                    tracing::warn!("waiting for mount changes failed: {err}");
                }
            }
        }

        match source.read().await {
            Ok(entries) => {
                backoff.reset();
                let current = index_by_mount_point(entries);
                shared.push_all(diff(&previous, &current));
                previous = current;
            }
            Err(err) => {
                let delay = backoff.next_delay();
                tracing::error!("unable to read mount table, retrying in {delay:?}: {err}");
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    _ = shared.closed.cancelled() => break,
                    _ = tokio::time::sleep(delay) => {}
                }
            }
        }
    }

    shared.closed.cancel();
}

/// Keys records by mount point; a later record at the same point shadows the earlier one
pub fn index_by_mount_point(entries: Vec<MountInfo>) -> BTreeMap<String, MountInfo> {
    entries
        .into_iter()
        .map(|entry| (entry.mount_point.clone(), entry))
        .collect()
}

fn is_modified(previous: &MountInfo, current: &MountInfo) -> bool {
    previous.full_fs_type() != current.full_fs_type()
        || previous.major_minor != current.major_minor
        || previous.mount_options != current.mount_options
}

/// Events turning `previous` into `current`, ordered by mount point
pub fn diff(
    previous: &BTreeMap<String, MountInfo>,
    current: &BTreeMap<String, MountInfo>,
) -> Vec<MountEvent> {
    let mut events = Vec::new();

    for (mount_point, info) in current {
        match previous.get(mount_point) {
            None => events.push(MountEvent {
                kind: MountEventKind::Attached,
                mount_point: mount_point.clone(),
                info: info.clone(),
                previous: None,
            }),
            Some(old) if is_modified(old, info) => events.push(MountEvent {
                kind: MountEventKind::Modified,
                mount_point: mount_point.clone(),
                info: info.clone(),
                previous: Some(old.clone()),
            }),
            Some(_) => {}
        }
    }

    for (mount_point, info) in previous {
        if !current.contains_key(mount_point) {
            events.push(MountEvent {
                kind: MountEventKind::Detached,
                mount_point: mount_point.clone(),
                info: info.clone(),
                previous: None,
            });
        }
    }

    events
}
