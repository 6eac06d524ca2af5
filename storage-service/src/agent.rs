// SPDX-License-Identifier: GPL-3.0-only

//! Agent main loop
//!
//! Reconciles once at start, then again on every resync tick, on every mount event that
//! concerns a drive and whenever an operator changes a drive's spec.

use std::collections::HashMap;
use std::sync::Arc;

use futures_util::StreamExt;
use tokio::task::JoinSet;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;

use storage_contracts::{AgentError, DriveRegistry, ErrorKind, Result, WatchEvent};
use storage_sys::{MountEvent, MountListener, SysError};
use storage_types::{Drive, DriveSpec};

use crate::config::AgentConfig;
use crate::format::{FormatRequest, FormatService};
use crate::reconciler::{ReconcileReport, Reconciler};
use crate::records;

enum Trigger {
    Resync,
    Mount(String),
    Spec(String),
}

pub struct Agent {
    config: Arc<AgentConfig>,
    reconciler: Arc<Reconciler>,
    formatter: Arc<FormatService>,
    drives: Arc<DriveRegistry>,
}

impl Agent {
    pub fn new(
        config: Arc<AgentConfig>,
        reconciler: Arc<Reconciler>,
        formatter: Arc<FormatService>,
        drives: Arc<DriveRegistry>,
    ) -> Self {
        Self {
            config,
            reconciler,
            formatter,
            drives,
        }
    }

    /// Runs until `cancel` fires or the listener closes.
    pub async fn run(&self, listener: &MountListener, cancel: &CancellationToken) -> Result<()> {
        let mut watch = self
            .drives
            .watch(&records::node_selector(&self.config))
            .await?;
        let mut specs: HashMap<String, DriveSpec> = HashMap::new();

        // The first tick fires immediately and drives the initial pass.
        let mut ticker = tokio::time::interval(self.config.resync_interval());
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        let result = loop {
            let trigger = tokio::select! {
                _ = cancel.cancelled() => break Ok(()),
                _ = ticker.tick() => Trigger::Resync,
                event = listener.get(cancel) => match event {
                    Ok(event) if self.is_relevant(&event) => Trigger::Mount(event.mount_point),
                    Ok(_) => continue,
                    Err(SysError::Cancelled) => break Ok(()),
                    Err(err) => break Err(AgentError::from(err)),
                },
                Some(event) = watch.next() => match spec_change(&mut specs, event) {
                    Some(name) => Trigger::Spec(name),
                    None => continue,
                },
            };

            match &trigger {
                Trigger::Resync => tracing::debug!("Periodic resync"),
                Trigger::Mount(mount_point) => {
                    tracing::debug!("Mount table changed at {}", mount_point)
                }
                Trigger::Spec(name) => tracing::debug!("Format requested for drive {}", name),
            }
            match self.sync(cancel).await {
                Ok(_) => {}
                Err(err) if err.is(ErrorKind::Cancelled) => break Ok(()),
                Err(err) => tracing::warn!("Reconcile pass failed: {}", err),
            }
        };

        self.reconciler.wait_background().await;
        result
    }

    /// One reconcile pass, then the format requests it produced. A pass follows any
    /// successful format so the new drives settle in the same call.
    pub async fn sync(&self, cancel: &CancellationToken) -> Result<ReconcileReport> {
        let report = self.reconciler.reconcile(cancel).await?;
        if report.format_requests.is_empty() {
            return Ok(report);
        }

        let formatted = self
            .dispatch_formats(report.format_requests.clone(), cancel)
            .await?;
        if formatted == 0 {
            return Ok(report);
        }
        self.reconciler.reconcile(cancel).await
    }

    async fn dispatch_formats(
        &self,
        requests: Vec<FormatRequest>,
        cancel: &CancellationToken,
    ) -> Result<usize> {
        let mut tasks = JoinSet::new();
        for request in requests {
            let formatter = Arc::clone(&self.formatter);
            let cancel = cancel.clone();
            tasks.spawn(async move {
                let result = formatter.format(&request, &cancel).await;
                (request.name, result)
            });
        }

        let mut formatted = 0;
        let mut cancelled = false;
        while let Some(joined) = tasks.join_next().await {
            match joined {
                Ok((_, Ok(drive))) => {
                    tracing::info!("Formatted drive {}", drive.meta.name);
                    formatted += 1;
                }
                Ok((_, Err(err))) if err.is(ErrorKind::Cancelled) => cancelled = true,
                Ok((name, Err(err))) => match &err.suggestion {
                    Some(hint) => tracing::warn!("Format of drive {} failed: {} ({})", name, err, hint),
                    None => tracing::warn!("Format of drive {} failed: {}", name, err),
                },
                Err(err) => tracing::error!("Format task failed: {}", err),
            }
        }

        if cancelled {
            return Err(AgentError::cancelled());
        }
        Ok(formatted)
    }

    fn is_relevant(&self, event: &MountEvent) -> bool {
        let prefix = format!("{}/", self.config.mount_root());
        event.mount_point.starts_with(&prefix)
            || self.reconciler.tracks(event.info.major_minor)
            || event
                .previous
                .as_ref()
                .is_some_and(|previous| self.reconciler.tracks(previous.major_minor))
    }
}

/// Name of the drive whose format request was just set or changed
fn spec_change(specs: &mut HashMap<String, DriveSpec>, event: WatchEvent<Drive>) -> Option<String> {
    match event {
        WatchEvent::Added(drive) | WatchEvent::Modified(drive) => {
            let name = drive.meta.name;
            let wants_format = drive.spec.requested_format.is_some();
            let previous = specs.insert(name.clone(), drive.spec);
            let changed = previous.as_ref() != specs.get(&name);
            (changed && wants_format).then_some(name)
        }
        WatchEvent::Deleted(drive) => {
            specs.remove(&drive.meta.name);
            None
        }
    }
}

#[cfg(test)]
mod tests {
    use storage_types::RequestedFormat;

    use super::*;

    fn with_format(name: &str, force: bool) -> Drive {
        let mut drive = Drive::new(name);
        drive.spec.requested_format = Some(RequestedFormat {
            force,
            ..RequestedFormat::default()
        });
        drive
    }

    #[test]
    fn only_new_format_requests_trigger() {
        let mut specs = HashMap::new();

        assert_eq!(spec_change(&mut specs, WatchEvent::Added(Drive::new("d1"))), None);
        assert_eq!(
            spec_change(&mut specs, WatchEvent::Modified(with_format("d1", false))),
            Some("d1".to_string())
        );
        assert_eq!(spec_change(&mut specs, WatchEvent::Modified(with_format("d1", false))), None);
        assert_eq!(
            spec_change(&mut specs, WatchEvent::Modified(with_format("d1", true))),
            Some("d1".to_string())
        );
        assert_eq!(spec_change(&mut specs, WatchEvent::Modified(Drive::new("d1"))), None);
        assert_eq!(spec_change(&mut specs, WatchEvent::Deleted(Drive::new("d1"))), None);
        assert!(specs.is_empty());
    }
}
