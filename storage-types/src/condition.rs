// SPDX-License-Identifier: GPL-3.0-only

//! Status conditions attached to drive and volume records

use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub enum ConditionStatus {
    True,
    False,
    #[default]
    Unknown,
}

impl From<bool> for ConditionStatus {
    fn from(value: bool) -> Self {
        if value { Self::True } else { Self::False }
    }
}

impl fmt::Display for ConditionStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::True => "True",
            Self::False => "False",
            Self::Unknown => "Unknown",
        };
        f.write_str(s)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DriveCondition {
    Owned,
    Mounted,
    Formatted,
    Initialized,
    Ready,
}

impl DriveCondition {
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Owned => "Owned",
            Self::Mounted => "Mounted",
            Self::Formatted => "Formatted",
            Self::Initialized => "Initialized",
            Self::Ready => "Ready",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum VolumeCondition {
    Staged,
    Published,
    Ready,
}

impl VolumeCondition {
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Staged => "Staged",
            Self::Published => "Published",
            Self::Ready => "Ready",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Condition {
    #[serde(rename = "type")]
    pub kind: String,
    pub status: ConditionStatus,
    pub reason: String,
    pub message: String,
    pub last_transition_time: DateTime<Utc>,
}

/// Insertion-ordered mapping from condition type to condition
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Conditions(Vec<Condition>);

impl Conditions {
    pub fn get(&self, kind: &str) -> Option<&Condition> {
        self.0.iter().find(|c| c.kind == kind)
    }

    /// Status of `kind`, `Unknown` when the condition was never set
    pub fn status(&self, kind: &str) -> ConditionStatus {
        self.get(kind).map(|c| c.status).unwrap_or_default()
    }

    pub fn is_true(&self, kind: &str) -> bool {
        self.status(kind) == ConditionStatus::True
    }

    /// Sets a condition and reports whether anything observable changed.
    ///
    /// `last_transition_time` moves only when status or reason differ. A message-only
    /// change rewrites the message and keeps the timestamp.
    pub fn set(
        &mut self,
        kind: &str,
        status: ConditionStatus,
        reason: &str,
        message: &str,
        now: DateTime<Utc>,
    ) -> bool {
        match self.0.iter_mut().find(|c| c.kind == kind) {
            Some(existing) => {
                let transitioned = existing.status != status || existing.reason != reason;
                let changed = transitioned || existing.message != message;
                if transitioned {
                    existing.status = status;
                    existing.reason = reason.to_string();
                    existing.last_transition_time = now;
                }
                if existing.message != message {
                    existing.message = message.to_string();
                }
                changed
            }
            None => {
                self.0.push(Condition {
                    kind: kind.to_string(),
                    status,
                    reason: reason.to_string(),
                    message: message.to_string(),
                    last_transition_time: now,
                });
                true
            }
        }
    }

    pub fn iter(&self) -> impl Iterator<Item = &Condition> {
        self.0.iter()
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use chrono::TimeZone;

    use super::*;

    fn at(secs: i64) -> DateTime<Utc> {
        Utc.timestamp_opt(secs, 0).single().expect("valid timestamp")
    }

    #[test]
    fn keeps_insertion_order() {
        let mut conditions = Conditions::default();
        conditions.set("Owned", ConditionStatus::False, "NotOwned", "", at(1));
        conditions.set("Mounted", ConditionStatus::False, "NotMounted", "", at(1));
        conditions.set("Owned", ConditionStatus::True, "Owned", "", at(2));

        let kinds: Vec<_> = conditions.iter().map(|c| c.kind.as_str()).collect();
        assert_eq!(kinds, vec!["Owned", "Mounted"]);
    }

    #[test]
    fn transition_time_moves_only_on_status_or_reason_change() {
        let mut conditions = Conditions::default();
        assert!(conditions.set("Ready", ConditionStatus::True, "Ready", "", at(10)));
        assert!(!conditions.set("Ready", ConditionStatus::True, "Ready", "", at(20)));
        assert_eq!(conditions.get("Ready").map(|c| c.last_transition_time), Some(at(10)));

        assert!(conditions.set("Ready", ConditionStatus::True, "Ready", "still fine", at(30)));
        assert_eq!(conditions.get("Ready").map(|c| c.last_transition_time), Some(at(10)));

        assert!(conditions.set("Ready", ConditionStatus::False, "DriveLost", "", at(40)));
        assert_eq!(conditions.get("Ready").map(|c| c.last_transition_time), Some(at(40)));
    }

    #[test]
    fn missing_condition_is_unknown() {
        let conditions = Conditions::default();
        assert_eq!(conditions.status("Formatted"), ConditionStatus::Unknown);
        assert!(!conditions.is_true("Formatted"));
    }
}
