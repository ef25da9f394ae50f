//! Query and entry status.

use serde::{Deserialize, Serialize};
use std::fmt;

/// Lifecycle status reported to subscribers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Status {
    /// Nothing has been fetched or written yet.
    #[default]
    Init,
    /// A fetch is in flight. Previously loaded data may still be present.
    Loading,
    /// Data is present and confirmed.
    Loaded,
    /// The last fetch failed.
    Error,
}

impl Status {
    /// Returns true once a fetch has settled either way.
    pub fn is_settled(&self) -> bool {
        matches!(self, Self::Loaded | Self::Error)
    }
}

impl fmt::Display for Status {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Init => "init",
            Self::Loading => "loading",
            Self::Loaded => "loaded",
            Self::Error => "error",
        };
        f.write_str(s)
    }
}
