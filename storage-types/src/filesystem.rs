// SPDX-License-Identifier: GPL-3.0-only

//! Filesystem probe results, quotas and identity metadata

use serde::{Deserialize, Serialize};

/// Result of reading an on-disk superblock
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FsInfo {
    #[serde(rename = "fsUUID")]
    pub fs_uuid: String,
    pub fs_type: String,
    pub label: String,
    pub block_size: u64,
    pub total_bytes: u64,
    pub free_bytes: u64,
}

/// Project quota for one volume directory
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Quota {
    pub soft_limit: u64,
    pub hard_limit: u64,
    pub current_space: u64,
}

impl Quota {
    pub fn limits(soft_limit: u64, hard_limit: u64) -> Self {
        Self {
            soft_limit,
            hard_limit,
            current_space: 0,
        }
    }
}

/// Identity file written inside every formatted drive
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FormatMetadata {
    pub fsuuid: String,
    pub formatted_by: String,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn metadata_uses_documented_keys() {
        let metadata = FormatMetadata {
            fsuuid: "d79dff9e-2884-46f2-8919-dada2eecb12d".to_string(),
            formatted_by: "node-1".to_string(),
        };
        let json = serde_json::to_string(&metadata).expect("serialize metadata");
        assert_eq!(
            json,
            r#"{"fsuuid":"d79dff9e-2884-46f2-8919-dada2eecb12d","formattedBy":"node-1"}"#
        );
    }
}
