use std::fmt;

use serde::{Deserialize, Serialize};

/// Milestones of a host run, visited once each, in declaration order.
#[allow(missing_docs)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Phase {
    ParseArgs,
    Init,
    LoadScript,
    RunScript,
    Finalize,
    Done,
}

impl Phase {
    /// Every phase in order.
    pub const ALL: [Self; 6] = [
        Self::ParseArgs,
        Self::Init,
        Self::LoadScript,
        Self::RunScript,
        Self::Finalize,
        Self::Done,
    ];

    /// The phase after this one, or `None` after `Done`.
    #[must_use]
    pub const fn next(self) -> Option<Self> {
        match self {
            Self::ParseArgs => Some(Self::Init),
            Self::Init => Some(Self::LoadScript),
            Self::LoadScript => Some(Self::RunScript),
            Self::RunScript => Some(Self::Finalize),
            Self::Finalize => Some(Self::Done),
            Self::Done => None,
        }
    }

    /// Snake-case name used in logs.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::ParseArgs => "parse_args",
            Self::Init => "init",
            Self::LoadScript => "load_script",
            Self::RunScript => "run_script",
            Self::Finalize => "finalize",
            Self::Done => "done",
        }
    }
}

impl fmt::Display for Phase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}
