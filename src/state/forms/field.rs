//! Form field value objects and field definitions

use super::rule::ValidationRule;
use super::timing::Strategy;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;

/// Values of a whole form, keyed by field name
pub type FormData = BTreeMap<String, FieldValue>;

/// Metadata of a picked file. The engine never reads file contents.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FileRef {
    pub name: String,
    #[serde(default)]
    pub size: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub mime: Option<String>,
}

/// Type-safe field values
///
/// Serialized untagged, so a JSON form payload maps onto it directly. A
/// file list is a `List` of `File` values.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(untagged)]
pub enum FieldValue {
    #[default]
    Null,
    Bool(bool),
    Number(f64),
    Text(String),
    List(Vec<FieldValue>),
    File(FileRef),
}

impl FieldValue {
    /// Whether the value counts as "not filled in" for a required rule
    pub fn is_empty(&self) -> bool {
        match self {
            FieldValue::Null => true,
            FieldValue::Bool(b) => !b,
            FieldValue::Text(s) => s.is_empty(),
            FieldValue::List(items) => items.is_empty(),
            FieldValue::Number(_) | FieldValue::File(_) => false,
        }
    }

    /// Get the text value, if this is a text field
    pub fn as_text(&self) -> Option<&str> {
        match self {
            FieldValue::Text(s) => Some(s),
            _ => None,
        }
    }

    /// Numeric view of the value. Text is parsed, since number inputs
    /// usually report their content as a string.
    pub fn as_number(&self) -> Option<f64> {
        match self {
            FieldValue::Number(n) => Some(*n),
            FieldValue::Text(s) => s.trim().parse().ok(),
            _ => None,
        }
    }

    /// Character count for text, item count for lists
    pub fn length(&self) -> Option<usize> {
        match self {
            FieldValue::Text(s) => Some(s.chars().count()),
            FieldValue::List(items) => Some(items.len()),
            _ => None,
        }
    }
}

impl fmt::Display for FieldValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            FieldValue::Null => Ok(()),
            FieldValue::Bool(b) => write!(f, "{b}"),
            FieldValue::Number(n) => write!(f, "{}", format_number(*n)),
            FieldValue::Text(s) => f.write_str(s),
            FieldValue::List(items) => {
                for (i, item) in items.iter().enumerate() {
                    if i > 0 {
                        f.write_str(",")?;
                    }
                    write!(f, "{item}")?;
                }
                Ok(())
            }
            FieldValue::File(file) => f.write_str(&file.name),
        }
    }
}

/// Render whole numbers without a trailing `.0`
pub(crate) fn format_number(n: f64) -> String {
    if n.is_finite() && n.fract() == 0.0 && n.abs() < 1e15 {
        format!("{}", n as i64)
    } else {
        n.to_string()
    }
}

impl From<&str> for FieldValue {
    fn from(value: &str) -> Self {
        FieldValue::Text(value.to_string())
    }
}

impl From<String> for FieldValue {
    fn from(value: String) -> Self {
        FieldValue::Text(value)
    }
}

impl From<bool> for FieldValue {
    fn from(value: bool) -> Self {
        FieldValue::Bool(value)
    }
}

impl From<f64> for FieldValue {
    fn from(value: f64) -> Self {
        FieldValue::Number(value)
    }
}

impl From<i64> for FieldValue {
    fn from(value: i64) -> Self {
        FieldValue::Number(value as f64)
    }
}

impl From<FileRef> for FieldValue {
    fn from(value: FileRef) -> Self {
        FieldValue::File(value)
    }
}

impl<T: Into<FieldValue>> From<Vec<T>> for FieldValue {
    fn from(value: Vec<T>) -> Self {
        FieldValue::List(value.into_iter().map(Into::into).collect())
    }
}

impl<T: Into<FieldValue>> From<Option<T>> for FieldValue {
    fn from(value: Option<T>) -> Self {
        value.map_or(FieldValue::Null, Into::into)
    }
}

/// Kind of input control a field is rendered with
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum InputKind {
    #[default]
    Text,
    Email,
    Password,
    Number,
    Tel,
    Url,
    Textarea,
    Select,
    Checkbox,
    Radio,
    File,
    Date,
    DatetimeLocal,
    Custom,
}

/// A selectable option of a select or radio field
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FieldOption {
    pub label: String,
    pub value: FieldValue,
}

impl FieldOption {
    pub fn new(label: &str, value: impl Into<FieldValue>) -> Self {
        Self {
            label: label.to_string(),
            value: value.into(),
        }
    }
}

/// Configuration of a single form field
///
/// Immutable once the form is built; the engine keeps the mutable value,
/// error and touched state separately.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct FieldDefinition {
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub label: Option<String>,
    #[serde(default)]
    pub kind: InputKind,
    #[serde(default)]
    pub required: bool,
    /// Fields whose changes re-trigger validation of this one
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub dependencies: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub validation: Option<ValidationRule>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub options: Vec<FieldOption>,
    #[serde(default)]
    pub multiple: bool,
    #[serde(default)]
    pub timing: Strategy,
}

impl FieldDefinition {
    /// Create a new text field
    pub fn new(name: &str) -> Self {
        Self {
            name: name.to_string(),
            ..Default::default()
        }
    }

    pub fn label(mut self, label: &str) -> Self {
        self.label = Some(label.to_string());
        self
    }

    pub fn kind(mut self, kind: InputKind) -> Self {
        self.kind = kind;
        self
    }

    pub fn required(mut self) -> Self {
        self.required = true;
        self
    }

    pub fn depends_on(mut self, fields: &[&str]) -> Self {
        self.dependencies.extend(fields.iter().map(|f| f.to_string()));
        self
    }

    pub fn rule(mut self, rule: ValidationRule) -> Self {
        self.validation = Some(rule);
        self
    }

    pub fn options(mut self, options: Vec<FieldOption>) -> Self {
        self.options = options;
        self
    }

    pub fn multiple(mut self) -> Self {
        self.multiple = true;
        self
    }

    pub fn timing(mut self, timing: Strategy) -> Self {
        self.timing = timing;
        self
    }

    /// Label used in messages, falling back to the field name
    pub fn display_label(&self) -> &str {
        self.label.as_deref().unwrap_or(&self.name)
    }

    /// Required either through the flag or through the rule
    pub fn is_required(&self) -> bool {
        self.required
            || self
                .validation
                .as_ref()
                .and_then(|rule| rule.required.as_ref())
                .is_some_and(|r| r.is_required())
    }

    /// Value a field starts with when no initial value is configured
    pub fn empty_value(&self) -> FieldValue {
        match self.kind {
            InputKind::Checkbox if self.options.is_empty() => FieldValue::Bool(false),
            // checkbox group
            InputKind::Checkbox => FieldValue::List(vec![]),
            InputKind::Select if self.multiple => FieldValue::List(vec![]),
            InputKind::File | InputKind::Number => FieldValue::Null,
            _ => FieldValue::Text(String::new()),
        }
    }
}
