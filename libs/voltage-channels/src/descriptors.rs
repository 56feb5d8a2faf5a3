//! Value and field descriptors
//!
//! Immutable records describing a channel's server-side data type and the values
//! it carries. `LocalChannelDescriptor` is the text form used to declare simulated
//! channels.

use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use errors::{usage_error, ChannelError};
use serde::{Deserialize, Serialize};

// ============================================================================
// Field Type
// ============================================================================

/// Server-assigned data type of a channel
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum FieldType {
    String,
    Short,
    Float,
    Enum,
    Char,
    Long,
    Double,
}

impl FieldType {
    pub fn as_str(&self) -> &'static str {
        match self {
            FieldType::String => "string",
            FieldType::Short => "short",
            FieldType::Float => "float",
            FieldType::Enum => "enum",
            FieldType::Char => "char",
            FieldType::Long => "long",
            FieldType::Double => "double",
        }
    }

    pub fn is_integer(&self) -> bool {
        matches!(self, FieldType::Short | FieldType::Char | FieldType::Long)
    }

    pub fn is_floating(&self) -> bool {
        matches!(self, FieldType::Float | FieldType::Double)
    }

    /// Inclusive integer range representable by this type
    fn integer_range(&self) -> Option<(i64, i64)> {
        match self {
            FieldType::Char => Some((u8::MIN as i64, u8::MAX as i64)),
            FieldType::Short => Some((i16::MIN as i64, i16::MAX as i64)),
            FieldType::Long => Some((i32::MIN as i64, i32::MAX as i64)),
            FieldType::Enum => Some((0, u16::MAX as i64)),
            _ => None,
        }
    }
}

impl fmt::Display for FieldType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for FieldType {
    type Err = ChannelError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "string" | "str" => Ok(FieldType::String),
            "short" | "int16" | "i16" => Ok(FieldType::Short),
            "float" | "f32" => Ok(FieldType::Float),
            "enum" => Ok(FieldType::Enum),
            "char" | "byte" | "u8" => Ok(FieldType::Char),
            "long" | "int" | "int32" | "i32" => Ok(FieldType::Long),
            "double" | "f64" => Ok(FieldType::Double),
            other => Err(usage_error!("Unknown field type '{}'", other)),
        }
    }
}

/// Shape and type of a channel as reported on connection
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FieldInfo {
    pub field_type: FieldType,
    /// Number of elements, 1 for scalars
    pub element_count: usize,
    pub writable: bool,
}

impl FieldInfo {
    pub fn new(field_type: FieldType, element_count: usize) -> Self {
        Self {
            field_type,
            element_count: element_count.max(1),
            writable: true,
        }
    }

    pub fn scalar(field_type: FieldType) -> Self {
        Self::new(field_type, 1)
    }

    pub fn read_only(mut self) -> Self {
        self.writable = false;
        self
    }

    pub fn is_array(&self) -> bool {
        self.element_count > 1
    }

    /// Whether `value` can be written to a field of this shape
    pub fn accepts(&self, value: &ChannelValue) -> bool {
        let fits_int = |v: i64| {
            self.field_type
                .integer_range()
                .map_or(true, |(lo, hi)| v >= lo && v <= hi)
        };
        match (self.field_type, value) {
            (FieldType::String, ChannelValue::String(_)) => true,
            (FieldType::Enum, ChannelValue::Enum(_)) => true,
            (FieldType::Enum, ChannelValue::Integer(v)) => fits_int(*v),
            (t, ChannelValue::Integer(v)) if t.is_integer() => fits_int(*v),
            (t, ChannelValue::Integer(_) | ChannelValue::Float(_)) if t.is_floating() => true,
            (t, ChannelValue::IntegerArray(items)) if t.is_integer() => {
                items.len() <= self.element_count && items.iter().all(|v| fits_int(*v))
            },
            (t, ChannelValue::FloatArray(items)) if t.is_floating() => {
                items.len() <= self.element_count
            },
            _ => false,
        }
    }
}

impl fmt::Display for FieldInfo {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.is_array() {
            write!(f, "{}[{}]", self.field_type, self.element_count)
        } else {
            write!(f, "{}", self.field_type)
        }
    }
}

// ============================================================================
// Channel Value
// ============================================================================

/// A concrete value carried by a channel
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum ChannelValue {
    String(String),
    Integer(i64),
    Float(f64),
    Enum(u16),
    IntegerArray(Vec<i64>),
    FloatArray(Vec<f64>),
}

impl ChannelValue {
    pub fn as_f64(&self) -> Option<f64> {
        match self {
            Self::Float(f) => Some(*f),
            Self::Integer(i) => Some(*i as f64),
            Self::Enum(e) => Some(*e as f64),
            Self::String(s) => s.parse().ok(),
            Self::IntegerArray(_) | Self::FloatArray(_) => None,
        }
    }

    pub fn as_i64(&self) -> Option<i64> {
        match self {
            Self::Integer(i) => Some(*i),
            Self::Enum(e) => Some(*e as i64),
            Self::Float(f) => Some(f.round() as i64),
            Self::String(s) => s.parse().ok(),
            Self::IntegerArray(_) | Self::FloatArray(_) => None,
        }
    }

    pub fn element_count(&self) -> usize {
        match self {
            Self::IntegerArray(items) => items.len(),
            Self::FloatArray(items) => items.len(),
            _ => 1,
        }
    }

    /// Parse text into a value of the given field type
    pub fn parse_as(field: &FieldInfo, text: &str) -> Result<Self, ChannelError> {
        let text = text.trim();
        if field.is_array() && field.field_type != FieldType::String {
            let items: Vec<&str> = text.split(',').map(str::trim).collect();
            return if field.field_type.is_floating() {
                let parsed = items
                    .iter()
                    .map(|s| s.parse::<f64>())
                    .collect::<Result<Vec<_>, _>>()?;
                Ok(Self::FloatArray(parsed))
            } else {
                let parsed = items
                    .iter()
                    .map(|s| s.parse::<i64>())
                    .collect::<Result<Vec<_>, _>>()?;
                Ok(Self::IntegerArray(parsed))
            };
        }

        match field.field_type {
            FieldType::String => Ok(Self::String(text.to_string())),
            FieldType::Enum => Ok(Self::Enum(text.parse()?)),
            FieldType::Float | FieldType::Double => Ok(Self::Float(text.parse()?)),
            FieldType::Short | FieldType::Char | FieldType::Long => {
                Ok(Self::Integer(text.parse()?))
            },
        }
    }
}

impl fmt::Display for ChannelValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fn join<T: fmt::Display>(items: &[T]) -> String {
            items
                .iter()
                .map(|v| v.to_string())
                .collect::<Vec<_>>()
                .join(",")
        }
        match self {
            Self::String(s) => write!(f, "{:?}", s),
            Self::Integer(i) => write!(f, "{}", i),
            Self::Float(v) => write!(f, "{}", v),
            Self::Enum(e) => write!(f, "enum({})", e),
            Self::IntegerArray(items) => write!(f, "[{}]", join(items)),
            Self::FloatArray(items) => write!(f, "[{}]", join(items)),
        }
    }
}

impl From<f64> for ChannelValue {
    fn from(v: f64) -> Self {
        Self::Float(v)
    }
}

impl From<i64> for ChannelValue {
    fn from(v: i64) -> Self {
        Self::Integer(v)
    }
}

impl From<i32> for ChannelValue {
    fn from(v: i32) -> Self {
        Self::Integer(v as i64)
    }
}

impl From<&str> for ChannelValue {
    fn from(v: &str) -> Self {
        Self::String(v.to_string())
    }
}

impl From<String> for ChannelValue {
    fn from(v: String) -> Self {
        Self::String(v)
    }
}

impl From<Vec<f64>> for ChannelValue {
    fn from(v: Vec<f64>) -> Self {
        Self::FloatArray(v)
    }
}

// ============================================================================
// Value Info
// ============================================================================

/// Alarm severity reported alongside a value
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
pub enum AlarmSeverity {
    #[default]
    NoAlarm,
    Minor,
    Major,
    Invalid,
}

impl fmt::Display for AlarmSeverity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            AlarmSeverity::NoAlarm => write!(f, "NO_ALARM"),
            AlarmSeverity::Minor => write!(f, "MINOR"),
            AlarmSeverity::Major => write!(f, "MAJOR"),
            AlarmSeverity::Invalid => write!(f, "INVALID"),
        }
    }
}

/// Display and control metadata, present only for control access
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct ControlInfo {
    pub units: String,
    pub precision: u16,
    pub display_low: f64,
    pub display_high: f64,
    pub alarm_low: Option<f64>,
    pub alarm_high: Option<f64>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub enum_strings: Vec<String>,
}

/// A value together with its timestamp and quality
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ValueInfo {
    pub value: ChannelValue,
    pub timestamp: DateTime<Utc>,
    pub severity: AlarmSeverity,
    /// Alarm status text, `NO_ALARM` when quiet
    pub status: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub control: Option<ControlInfo>,
}

impl ValueInfo {
    pub fn new(value: impl Into<ChannelValue>) -> Self {
        Self {
            value: value.into(),
            timestamp: Utc::now(),
            severity: AlarmSeverity::NoAlarm,
            status: "NO_ALARM".to_string(),
            control: None,
        }
    }

    pub fn with_timestamp(mut self, timestamp: DateTime<Utc>) -> Self {
        self.timestamp = timestamp;
        self
    }

    pub fn with_alarm(mut self, severity: AlarmSeverity, status: impl Into<String>) -> Self {
        self.severity = severity;
        self.status = status.into();
        self
    }

    pub fn with_control(mut self, control: ControlInfo) -> Self {
        self.control = Some(control);
        self
    }

    pub fn is_alarmed(&self) -> bool {
        self.severity != AlarmSeverity::NoAlarm
    }
}

impl fmt::Display for ValueInfo {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.value)?;
        if let Some(control) = &self.control {
            if !control.units.is_empty() {
                write!(f, " {}", control.units)?;
            }
        }
        if self.is_alarmed() {
            write!(f, " [{} {}]", self.severity, self.status)?;
        }
        Ok(())
    }
}

// ============================================================================
// Local Channel Descriptor
// ============================================================================

/// Declaration of a simulated channel
///
/// Text form: `<name> <type>[<count>] [<initial>]`, e.g. `sim:temp double 21.5`
/// or `sim:wave double[4] 1,2,3,4`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LocalChannelDescriptor {
    pub name: String,
    pub field_info: FieldInfo,
    pub initial_value: Option<ChannelValue>,
}

impl LocalChannelDescriptor {
    pub fn new(name: impl Into<String>, field_info: FieldInfo) -> Self {
        Self {
            name: name.into(),
            field_info,
            initial_value: None,
        }
    }

    pub fn with_initial_value(mut self, value: impl Into<ChannelValue>) -> Self {
        self.initial_value = Some(value.into());
        self
    }
}

impl FromStr for LocalChannelDescriptor {
    type Err = ChannelError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let mut tokens = s.split_whitespace();
        let name = tokens
            .next()
            .ok_or_else(|| usage_error!("Empty channel descriptor"))?;
        let type_spec = tokens
            .next()
            .ok_or_else(|| usage_error!("Descriptor '{}' has no field type", s))?;

        let (type_name, count) = match type_spec.split_once('[') {
            Some((type_name, rest)) => {
                let count = rest
                    .strip_suffix(']')
                    .ok_or_else(|| usage_error!("Unclosed element count in '{}'", type_spec))?
                    .parse::<usize>()?;
                if count == 0 {
                    return Err(usage_error!("Element count must be positive in '{}'", s));
                }
                (type_name, count)
            },
            None => (type_spec, 1),
        };
        let field_info = FieldInfo::new(type_name.parse()?, count);

        let rest: Vec<&str> = tokens.collect();
        let initial_value = if rest.is_empty() {
            None
        } else {
            let value = ChannelValue::parse_as(&field_info, &rest.join(" "))?;
            if !field_info.accepts(&value) {
                return Err(usage_error!(
                    "Initial value {} does not fit field {}",
                    value,
                    field_info
                ));
            }
            Some(value)
        };

        Ok(Self {
            name: name.to_string(),
            field_info,
            initial_value,
        })
    }
}
