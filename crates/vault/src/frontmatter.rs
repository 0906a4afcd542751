//! YAML frontmatter codec.
//!
//! On-disk layout:
//!
//! ```text
//! ---
//! id: "1"
//! tags: [a, b]
//! ---
//!
//! Body text.
//! ```
//!
//! A file without a leading `---` line has empty metadata and is all body.

use serde::Serialize;
use serde_yaml::{Mapping, Value};

use crate::error::CodecError;

/// Ordered metadata block.  Key order is preserved through a round trip.
pub type Metadata = Mapping;

const DELIMITER: &str = "---";

/// Split `text` into metadata and body.  The body is trimmed at both ends.
pub fn parse(text: &str) -> Result<(Metadata, String), CodecError> {
    let text = text.strip_prefix('\u{feff}').unwrap_or(text);

    let mut lines = text.split_inclusive('\n');
    let Some(first) = lines.next() else {
        return Ok((Metadata::new(), String::new()));
    };
    if !is_delimiter(first) {
        return Ok((Metadata::new(), text.trim().to_string()));
    }

    let yaml_start = first.len();
    let mut offset = yaml_start;
    for line in lines {
        if is_delimiter(line) {
            let metadata = decode_block(&text[yaml_start..offset])?;
            let body = text[offset + line.len()..].trim().to_string();
            return Ok((metadata, body));
        }
        offset += line.len();
    }

    Err(CodecError::Unterminated)
}

fn is_delimiter(line: &str) -> bool {
    line.trim_end() == DELIMITER
}

fn decode_block(yaml: &str) -> Result<Metadata, CodecError> {
    if yaml.trim().is_empty() {
        return Ok(Metadata::new());
    }
    match serde_yaml::from_str::<Value>(yaml)? {
        Value::Mapping(map) => Ok(map),
        Value::Null => Ok(Metadata::new()),
        other => Err(CodecError::NotAMapping {
            found: kind_name(&other),
        }),
    }
}

fn kind_name(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "boolean",
        Value::Number(_) => "number",
        Value::String(_) => "string",
        Value::Sequence(_) => "sequence",
        Value::Mapping(_) => "mapping",
        Value::Tagged(_) => "tagged value",
    }
}

/// Join metadata and body into the on-disk layout.
///
/// Empty metadata produces the bare body, unless the body itself opens with
/// `---`; then an empty block is written so the body is not misread as one.
pub fn serialize(metadata: &Metadata, body: &str) -> Result<String, CodecError> {
    let body = body.trim();
    let mut out = String::new();

    if metadata.is_empty() {
        if body.starts_with(DELIMITER) {
            out.push_str("---\n---\n\n");
        }
    } else {
        out.push_str("---\n");
        out.push_str(&serde_yaml::to_string(metadata)?);
        out.push_str("---\n");
        if !body.is_empty() {
            out.push('\n');
        }
    }

    if !body.is_empty() {
        out.push_str(body);
        out.push('\n');
    }
    Ok(out)
}

/// Set a single metadata field, keeping every other field and the body.
pub fn update_field(
    text: &str,
    key: &str,
    value: impl Into<Value>,
) -> Result<String, CodecError> {
    let (mut metadata, body) = parse(text)?;
    metadata.insert(Value::String(key.to_string()), value.into());
    serialize(&metadata, &body)
}

/// Outcome of [`validate_fields`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct FieldCheck {
    pub valid: bool,
    pub missing: Vec<String>,
}

/// Report which of `required` are absent from `metadata`.  A key that is
/// present with a null value counts as present.
pub fn validate_fields(metadata: &Metadata, required: &[&str]) -> FieldCheck {
    let missing: Vec<String> = required
        .iter()
        .copied()
        .filter(|field| !metadata.contains_key(*field))
        .map(|field| field.to_string())
        .collect();
    FieldCheck {
        valid: missing.is_empty(),
        missing,
    }
}

/// A parsed document: metadata plus body.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Document {
    pub metadata: Metadata,
    pub body: String,
}

impl Document {
    pub fn new(metadata: Metadata, body: impl Into<String>) -> Self {
        Self {
            metadata,
            body: body.into(),
        }
    }

    pub fn parse(text: &str) -> Result<Self, CodecError> {
        let (metadata, body) = parse(text)?;
        Ok(Self { metadata, body })
    }

    pub fn to_text(&self) -> Result<String, CodecError> {
        serialize(&self.metadata, &self.body)
    }

    pub fn get(&self, key: &str) -> Option<&Value> {
        self.metadata.get(key)
    }

    /// The field as a string, if present and a YAML string.
    pub fn get_str(&self, key: &str) -> Option<&str> {
        self.get(key).and_then(Value::as_str)
    }

    /// Insert or replace a field.  Replacing keeps the field's position.
    pub fn set(&mut self, key: &str, value: impl Into<Value>) {
        self.metadata
            .insert(Value::String(key.to_string()), value.into());
    }

    pub fn validate(&self, required: &[&str]) -> FieldCheck {
        validate_fields(&self.metadata, required)
    }
}

// ── Tests ────────────────────────────────────────────────────────────────────
