// SPDX-License-Identifier: GPL-3.0-only

//! Per-node drive agent
//!
//! Discovers block devices, keeps one drive record per device in the registry, formats
//! and mounts drives on request and mounts volumes carved out of them.

pub mod agent;
pub mod availability;
pub mod config;
pub mod format;
pub mod matcher;
pub mod reconciler;
pub mod records;
pub mod registry;
pub mod retry;
pub mod volumes;

pub use agent::Agent;
pub use config::{AgentConfig, Cli};
pub use format::{FormatRequest, FormatService};
pub use reconciler::{ReconcileReport, Reconciler};
pub use registry::LocalRegistry;
pub use volumes::VolumeCoordinator;
