// SPDX-License-Identifier: GPL-3.0-only

//! Label keys, finalizers and label selectors

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

pub const GROUP: &str = "localdrive.io";

pub const NODE_LABEL: &str = "localdrive.io/node";
pub const DRIVE_NAME_LABEL: &str = "localdrive.io/drive-name";
pub const PATH_LABEL: &str = "localdrive.io/path";
pub const ACCESS_TIER_LABEL: &str = "localdrive.io/access-tier";
pub const VERSION_LABEL: &str = "localdrive.io/version";
pub const CREATED_BY_LABEL: &str = "localdrive.io/created-by";
pub const DRIVE_LABEL: &str = "localdrive.io/drive";
pub const DRIVE_PATH_LABEL: &str = "localdrive.io/drive-path";

/// Schema tag written on every record by this version
pub const CURRENT_VERSION: &str = "v1";
/// Schema tag of records that only carry a device path as identity
pub const LEGACY_VERSION: &str = "v1beta1";

pub const CREATED_BY: &str = "localdrive-agent";

pub const DATA_PROTECTION_FINALIZER: &str = "localdrive.io/data-protection";
pub const VOLUME_FINALIZER_PREFIX: &str = "localdrive.io.volume/";

pub const TOPOLOGY_IDENTITY: &str = "localdrive.io/identity";
pub const TOPOLOGY_RACK: &str = "localdrive.io/rack";
pub const TOPOLOGY_ZONE: &str = "localdrive.io/zone";
pub const TOPOLOGY_REGION: &str = "localdrive.io/region";
pub const TOPOLOGY_NODE: &str = "localdrive.io/node";

const MAX_LABEL_VALUE_LEN: usize = 63;

pub fn volume_finalizer(volume_name: &str) -> String {
    format!("{VOLUME_FINALIZER_PREFIX}{volume_name}")
}

/// Volume name carried by a volume finalizer
pub fn volume_from_finalizer(finalizer: &str) -> Option<&str> {
    finalizer
        .strip_prefix(VOLUME_FINALIZER_PREFIX)
        .filter(|name| !name.is_empty())
}

/// Rewrites `value` into a valid label value: alphanumerics, `-`, `_` and `.`, starting and
/// ending with an alphanumeric, at most 63 characters.
pub fn sanitize_label_value(value: &str) -> String {
    let replaced: String = value
        .chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() || matches!(c, '-' | '_' | '.') {
                c
            } else {
                '-'
            }
        })
        .collect();

    let truncated: String = replaced.chars().take(MAX_LABEL_VALUE_LEN).collect();
    truncated
        .trim_matches(|c: char| !c.is_ascii_alphanumeric())
        .to_string()
}

/// Equality-based label selector; an empty selector matches everything
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct LabelSelector(BTreeMap<String, String>);

impl LabelSelector {
    pub fn everything() -> Self {
        Self::default()
    }

    pub fn with(mut self, key: &str, value: impl Into<String>) -> Self {
        self.0.insert(key.to_string(), value.into());
        self
    }

    pub fn matches(&self, labels: &BTreeMap<String, String>) -> bool {
        self.0
            .iter()
            .all(|(key, value)| labels.get(key).is_some_and(|v| v == value))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sanitizes_device_paths() {
        assert_eq!(sanitize_label_value("/dev/sdb1"), "dev-sdb1");
        assert_eq!(sanitize_label_value("nvme0n1p2"), "nvme0n1p2");
        assert_eq!(sanitize_label_value("dm-0"), "dm-0");
        assert_eq!(sanitize_label_value("mapper/vg0 lv"), "mapper-vg0-lv");
        assert_eq!(sanitize_label_value(&"x".repeat(80)).len(), 63);
    }

    #[test]
    fn volume_finalizers_round_trip_names() {
        let finalizer = volume_finalizer("pvc-1234");
        assert_eq!(finalizer, "localdrive.io.volume/pvc-1234");
        assert_eq!(volume_from_finalizer(&finalizer), Some("pvc-1234"));
        assert_eq!(volume_from_finalizer(DATA_PROTECTION_FINALIZER), None);
    }

    #[test]
    fn selector_matches_subset() {
        let labels = BTreeMap::from([
            (NODE_LABEL.to_string(), "node-1".to_string()),
            (PATH_LABEL.to_string(), "sdb".to_string()),
        ]);
        assert!(LabelSelector::everything().matches(&labels));
        assert!(LabelSelector::default().with(NODE_LABEL, "node-1").matches(&labels));
        assert!(!LabelSelector::default().with(NODE_LABEL, "node-2").matches(&labels));
        assert!(!LabelSelector::default().with(DRIVE_LABEL, "x").matches(&labels));
    }
}
