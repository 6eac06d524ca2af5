// SPDX-License-Identifier: GPL-3.0-only

use serde::{Deserialize, Serialize};

use crate::{Conditions, ObjectMeta, RegistryObject};

/// Accounting and mount-binding entity backed by a drive.
///
/// The drive is referenced by name only; the drive side keeps the back-reference as a
/// finalizer.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Volume {
    pub meta: ObjectMeta,
    pub drive_name: String,
    pub node_name: String,
    pub total_capacity: u64,
    pub used_capacity: u64,
    pub staging_path: String,
    pub container_path: String,
    pub conditions: Conditions,
}

impl Volume {
    pub fn new(name: impl Into<String>, drive_name: impl Into<String>, total_capacity: u64) -> Self {
        Self {
            meta: ObjectMeta::new(name),
            drive_name: drive_name.into(),
            total_capacity,
            ..Self::default()
        }
    }
}

impl RegistryObject for Volume {
    const KIND: &'static str = "volume";

    fn meta(&self) -> &ObjectMeta {
        &self.meta
    }

    fn meta_mut(&mut self) -> &mut ObjectMeta {
        &mut self.meta
    }
}
