use serde::{Deserialize, Serialize};
use std::fmt;

/// Status of a league join. It is part of the durable partition key, so a
/// change of status is always a row replacement, never an in-place update.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum JoinStatus {
    #[serde(rename = "1")]
    Pending,
    #[serde(rename = "2")]
    Superseded,
    #[serde(rename = "3")]
    Disconnected,
    #[serde(rename = "4")]
    Cancelled,
}

impl JoinStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            JoinStatus::Pending => "1",
            JoinStatus::Superseded => "2",
            JoinStatus::Disconnected => "3",
            JoinStatus::Cancelled => "4",
        }
    }

    pub fn from_id(id: &str) -> Option<Self> {
        match id {
            "1" => Some(JoinStatus::Pending),
            "2" => Some(JoinStatus::Superseded),
            "3" => Some(JoinStatus::Disconnected),
            "4" => Some(JoinStatus::Cancelled),
            _ => None,
        }
    }
}

impl fmt::Display for JoinStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MatchStatus {
    Active,
    Expired,
}
