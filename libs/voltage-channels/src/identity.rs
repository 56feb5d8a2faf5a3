//! Channel identity
//!
//! A channel is keyed by its (name, access mode) pair. Malformed names are still
//! representable so callers always obtain a handle; validation happens on demand.

use std::fmt;
use std::sync::OnceLock;

use regex::Regex;
use serde::{Deserialize, Serialize};

/// Maximum length of a full channel name, field suffix included
pub const MAX_NAME_LENGTH: usize = 60;

/// Field suffix implied when a name carries none
pub const DEFAULT_FIELD: &str = "VAL";

/// How much auxiliary metadata accompanies each value
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
pub enum AccessMode {
    /// Bare value
    #[default]
    Value,
    /// Value with server timestamp and alarm quality
    ValueWithTimestamp,
    /// Value with timestamp, alarm quality and control/display metadata
    ValueWithControl,
}

impl AccessMode {
    pub fn as_str(&self) -> &'static str {
        match self {
            AccessMode::Value => "VALUE",
            AccessMode::ValueWithTimestamp => "TIME",
            AccessMode::ValueWithControl => "CTRL",
        }
    }

    /// Whether control metadata is requested
    pub fn wants_control(&self) -> bool {
        matches!(self, AccessMode::ValueWithControl)
    }
}

impl fmt::Display for AccessMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

// ============================================================================
// Name validation
// ============================================================================

/// Why a channel name was rejected
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum InvalidNameReason {
    Empty,
    TooLong(usize),
    IllegalCharacter(char),
    MultipleDots,
    BadFieldSuffix(String),
}

impl fmt::Display for InvalidNameReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            InvalidNameReason::Empty => write!(f, "name is empty"),
            InvalidNameReason::TooLong(len) => {
                write!(f, "name has {} characters (max {})", len, MAX_NAME_LENGTH)
            },
            InvalidNameReason::IllegalCharacter(c) => write!(f, "illegal character {:?}", c),
            InvalidNameReason::MultipleDots => write!(f, "more than one '.'"),
            InvalidNameReason::BadFieldSuffix(s) => {
                write!(f, "field suffix {:?} must be 1-4 uppercase letters", s)
            },
        }
    }
}

#[allow(clippy::expect_used)] // constant pattern
fn base_pattern() -> &'static Regex {
    static PATTERN: OnceLock<Regex> = OnceLock::new();
    PATTERN.get_or_init(|| {
        Regex::new(r"^[A-Za-z0-9_+\-\[\]<>;:]+$").expect("valid base name pattern")
    })
}

#[allow(clippy::expect_used)] // constant pattern
fn field_pattern() -> &'static Regex {
    static PATTERN: OnceLock<Regex> = OnceLock::new();
    PATTERN.get_or_init(|| {
        Regex::new(r"^[A-Z]{1,4}$").expect("valid field suffix pattern")
    })
}

/// A validated channel name split into base and field suffix
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ChannelName {
    base: String,
    field: Option<String>,
}

impl ChannelName {
    /// Validate and split a channel name
    pub fn parse(name: &str) -> Result<Self, InvalidNameReason> {
        if name.is_empty() {
            return Err(InvalidNameReason::Empty);
        }
        let len = name.chars().count();
        if len > MAX_NAME_LENGTH {
            return Err(InvalidNameReason::TooLong(len));
        }

        let mut parts = name.splitn(3, '.');
        let base = parts.next().unwrap_or_default();
        let field = parts.next();
        if parts.next().is_some() {
            return Err(InvalidNameReason::MultipleDots);
        }

        if base.is_empty() {
            return Err(InvalidNameReason::Empty);
        }
        if !base_pattern().is_match(base) {
            let bad = base
                .chars()
                .find(|c| !base_pattern().is_match(&c.to_string()))
                .unwrap_or(' ');
            return Err(InvalidNameReason::IllegalCharacter(bad));
        }

        if let Some(field) = field {
            if !field_pattern().is_match(field) {
                return Err(InvalidNameReason::BadFieldSuffix(field.to_string()));
            }
        }

        Ok(Self {
            base: base.to_string(),
            field: field.map(str::to_string),
        })
    }

    pub fn base(&self) -> &str {
        &self.base
    }

    /// Field suffix, `VAL` when the name carries none
    pub fn field(&self) -> &str {
        self.field.as_deref().unwrap_or(DEFAULT_FIELD)
    }

    pub fn has_explicit_field(&self) -> bool {
        self.field.is_some()
    }

    /// Canonical `base.FIELD` form
    pub fn canonical(&self) -> String {
        format!("{}.{}", self.base, self.field())
    }
}

impl fmt::Display for ChannelName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.field {
            Some(field) => write!(f, "{}.{}", self.base, field),
            None => f.write_str(&self.base),
        }
    }
}

// ============================================================================
// ChannelIdentity
// ============================================================================

/// Registry key of a channel: the name as given plus the access mode
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ChannelIdentity {
    name: String,
    access_mode: AccessMode,
}

impl ChannelIdentity {
    pub fn new(name: impl Into<String>, access_mode: AccessMode) -> Self {
        Self {
            name: name.into(),
            access_mode,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn access_mode(&self) -> AccessMode {
        self.access_mode
    }

    pub fn parse_name(&self) -> Result<ChannelName, InvalidNameReason> {
        ChannelName::parse(&self.name)
    }

    pub fn is_valid(&self) -> bool {
        self.parse_name().is_ok()
    }
}

impl From<&str> for ChannelIdentity {
    fn from(name: &str) -> Self {
        Self::new(name, AccessMode::default())
    }
}

impl fmt::Display for ChannelIdentity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.access_mode {
            AccessMode::Value => f.write_str(&self.name),
            mode => write!(f, "{} ({})", self.name, mode),
        }
    }
}
