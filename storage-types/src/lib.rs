// SPDX-License-Identifier: GPL-3.0-only

//! Canonical domain models for the localdrive node agent
//!
//! This crate defines the single source of truth for all drive management types.
//! These models are used throughout the stack:
//!
//! - **storage-sys**: Produces `Device` snapshots and `MountInfo` records from the host
//! - **storage-contracts**: Moves `Drive` and `Volume` records across the registry boundary
//! - **storage-service**: Reconciles records against snapshots and mutates them
//!
//! ## Lifecycles
//!
//! - `Device` → captured from the OS on demand, never persisted
//! - `Drive` → durable record of one adopted or candidate physical device
//! - `Volume` → accounting and mount-binding entity backed by a drive

pub mod common;
pub mod condition;
pub mod device;
pub mod drive;
pub mod filesystem;
pub mod labels;
pub mod meta;
pub mod mount;
pub mod volume;

pub use common::{MIN_SUPPORTED_DEVICE_SIZE, bytes_to_pretty, pretty_to_bytes};
pub use condition::{Condition, ConditionStatus, Conditions, DriveCondition, VolumeCondition};
pub use device::{Device, MajorMinor};
pub use drive::{AccessTier, Drive, DriveSpec, DriveState, DriveStatus, RequestedFormat};
pub use filesystem::{FormatMetadata, FsInfo, Quota};
pub use labels::{LabelSelector, sanitize_label_value};
pub use meta::{ObjectMeta, RegistryObject};
pub use mount::{MountInfo, MountTable};
pub use volume::Volume;
