//! Decoded record representation.
//!
//! A [`Record`] keeps fields in the canonical order established by its decoder.
//! Values stay raw (`Option<String>`): typing happens in the analyzer, and
//! processors decide their own coercions.

use std::fmt;

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

/// Where a record came from in its source.
#[derive(Debug, Clone, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Provenance {
    /// Zero-based index of the record within the decoded stream.
    pub record_number: u64,

    /// Byte offset of the record start, when the decoder tracks it.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub byte_offset: Option<u64>,

    /// One-based source line of the record start, when known.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub line: Option<u64>,

    /// Entity (table or element name) the record belongs to.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub entity: Option<String>,
}

impl Provenance {
    /// Provenance for the given record number with no positional detail.
    pub fn at(record_number: u64) -> Self {
        Self {
            record_number,
            ..Self::default()
        }
    }

    pub fn with_line(mut self, line: u64) -> Self {
        self.line = Some(line);
        self
    }

    pub fn with_offset(mut self, offset: u64) -> Self {
        self.byte_offset = Some(offset);
        self
    }

    pub fn with_entity(mut self, entity: impl Into<String>) -> Self {
        self.entity = Some(entity.into());
        self
    }
}

impl fmt::Display for Provenance {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "record {}", self.record_number)?;
        match (self.line, self.byte_offset) {
            (Some(line), Some(offset)) => write!(f, " (line {}, byte {})", line, offset)?,
            (Some(line), None) => write!(f, " (line {})", line)?,
            (None, Some(offset)) => write!(f, " (byte {})", offset)?,
            (None, None) => {}
        }
        if let Some(ref entity) = self.entity {
            write!(f, " [{}]", entity)?;
        }
        Ok(())
    }
}

/// One structured unit of decoded input (a row, an element, an INSERT tuple).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Record {
    fields: Vec<(String, Option<String>)>,
    provenance: Provenance,
}

impl Record {
    /// Create an empty record.
    pub fn new(provenance: Provenance) -> Self {
        Self {
            fields: Vec::new(),
            provenance,
        }
    }

    /// Build a record from parallel name/value lists.
    pub fn from_pairs<I, K>(pairs: I, provenance: Provenance) -> Self
    where
        I: IntoIterator<Item = (K, Option<String>)>,
        K: Into<String>,
    {
        Self {
            fields: pairs.into_iter().map(|(k, v)| (k.into(), v)).collect(),
            provenance,
        }
    }

    /// Append a field, or replace the value if the name already exists.
    pub fn set(&mut self, name: impl Into<String>, value: Option<String>) {
        let name = name.into();
        if let Some(slot) = self.fields.iter_mut().find(|(n, _)| *n == name) {
            slot.1 = value;
        } else {
            self.fields.push((name, value));
        }
    }

    /// Value of a field; `None` when the field is absent or null.
    pub fn get(&self, name: &str) -> Option<&str> {
        self.fields
            .iter()
            .find(|(n, _)| n == name)
            .and_then(|(_, v)| v.as_deref())
    }

    /// Whether the record carries the field at all (null or not).
    pub fn contains(&self, name: &str) -> bool {
        self.fields.iter().any(|(n, _)| n == name)
    }

    /// Fields in canonical order.
    pub fn fields(&self) -> &[(String, Option<String>)] {
        &self.fields
    }

    /// Field names in canonical order.
    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.fields.iter().map(|(n, _)| n.as_str())
    }

    pub fn len(&self) -> usize {
        self.fields.len()
    }

    pub fn is_empty(&self) -> bool {
        self.fields.is_empty()
    }

    pub fn provenance(&self) -> &Provenance {
        &self.provenance
    }

    /// Render the record as a JSON object, preserving field order.
    pub fn to_json(&self) -> Value {
        let mut map = Map::new();
        for (name, value) in &self.fields {
            let v = match value {
                Some(s) => Value::String(s.clone()),
                None => Value::Null,
            };
            map.insert(name.clone(), v);
        }
        Value::Object(map)
    }
}
