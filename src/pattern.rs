//! Channel patterns for bus subscriptions.
//!
//! A subscription names the channels it wants with a small pattern language:
//!
//! | Syntax     | Meaning                                                    |
//! |------------|------------------------------------------------------------|
//! | `loss`     | exactly the `loss` channel (strict: absence is an error)   |
//! | `?loss`    | the `loss` channel, which may never appear                 |
//! | `verify.*` | glob over channel names                                    |
//! | `#*`       | glob over a reserved family (`#` and `$` prefixes)         |
//! | `*`        | every non-reserved channel                                 |
//!
//! Channels whose name starts with `$` or `#` are reserved for engine
//! plumbing (probe spans, stop signals). Only a pattern that spells out the
//! same sigil can reach them.

use std::collections::HashMap;
use std::fmt;
use std::sync::{OnceLock, RwLock};

use regex::Regex;

const GLOB_CACHE_MAX: usize = 256;

static GLOB_CACHE: OnceLock<RwLock<HashMap<String, Regex>>> = OnceLock::new();

fn cached_glob(glob: &str) -> Option<Regex> {
    let cache = GLOB_CACHE.get_or_init(|| RwLock::new(HashMap::new()));

    if let Ok(guard) = cache.read() {
        if let Some(re) = guard.get(glob) {
            return Some(re.clone());
        }
    }

    let source = glob
        .split('*')
        .map(regex::escape)
        .collect::<Vec<_>>()
        .join(".*");
    let compiled = Regex::new(&format!("^{source}$")).ok()?;

    if let Ok(mut guard) = cache.write() {
        if guard.len() >= GLOB_CACHE_MAX {
            guard.clear();
        }
        guard
            .entry(glob.to_string())
            .or_insert_with(|| compiled.clone());
    }
    Some(compiled)
}

/// Returns true for engine-reserved channel names.
#[must_use]
pub fn is_reserved(name: &str) -> bool {
    name.starts_with('$') || name.starts_with('#')
}

/// A compiled glob over channel names.
#[derive(Debug, Clone)]
pub struct Glob {
    source: String,
    re: Regex,
}

impl Glob {
    fn matches(&self, name: &str) -> bool {
        if is_reserved(name) && !self.source.starts_with(&name[..1]) {
            return false;
        }
        self.re.is_match(name)
    }
}

/// Which channels a subscription receives.
#[derive(Debug, Clone)]
pub enum ChannelPattern {
    /// One channel that the subscriber expects to see.
    Exact(String),
    /// One channel that may legitimately stay silent.
    Optional(String),
    /// A family of channels.
    Glob(Glob),
    /// Every non-reserved channel.
    Any,
}

impl ChannelPattern {
    /// Parses the pattern syntax described in the module docs.
    #[must_use]
    pub fn parse(text: &str) -> Self {
        let text = text.trim();
        if text == "*" {
            return Self::Any;
        }
        if let Some(name) = text.strip_prefix('?') {
            return Self::Optional(name.to_string());
        }
        if text.contains('*') {
            if let Some(re) = cached_glob(text) {
                return Self::Glob(Glob {
                    source: text.to_string(),
                    re,
                });
            }
        }
        Self::Exact(text.to_string())
    }

    /// Pattern for exactly one channel.
    #[must_use]
    pub fn exact(name: impl Into<String>) -> Self {
        Self::Exact(name.into())
    }

    /// Pattern for one channel that may never appear.
    #[must_use]
    pub fn optional(name: impl Into<String>) -> Self {
        Self::Optional(name.into())
    }

    /// Returns true if events on `name` are delivered to this pattern.
    #[must_use]
    pub fn matches(&self, name: &str) -> bool {
        match self {
            Self::Exact(n) | Self::Optional(n) => n == name,
            Self::Glob(g) => g.matches(name),
            Self::Any => !is_reserved(name),
        }
    }

    /// Strict patterns treat a channel that never produced an event as an error
    /// for reducers such as `first()`.
    #[must_use]
    pub const fn is_strict(&self) -> bool {
        matches!(self, Self::Exact(_))
    }
}

impl From<&str> for ChannelPattern {
    fn from(text: &str) -> Self {
        Self::parse(text)
    }
}

impl From<String> for ChannelPattern {
    fn from(text: String) -> Self {
        Self::parse(&text)
    }
}

impl fmt::Display for ChannelPattern {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Exact(n) => f.write_str(n),
            Self::Optional(n) => write!(f, "?{n}"),
            Self::Glob(g) => f.write_str(&g.source),
            Self::Any => f.write_str("*"),
        }
    }
}
