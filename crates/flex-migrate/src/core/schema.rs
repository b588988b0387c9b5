//! Inferred schema types handed to external artifact generators.
//!
//! Everything here is the frozen output of the analyzer. Field order in every
//! list follows the source's canonical field order.

use std::fmt;

use serde::{Deserialize, Serialize};

use crate::error::Result;

/// Kind of source a decoder reads.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SourceKind {
    /// Delimited text (CSV, TSV, pipe-separated, ...).
    Tabular,
    /// Hierarchical markup (XML).
    Markup,
    /// Relational dump script (SQL).
    Script,
}

impl SourceKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            SourceKind::Tabular => "tabular",
            SourceKind::Markup => "markup",
            SourceKind::Script => "script",
        }
    }
}

impl fmt::Display for SourceKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Primitive type inferred for a field.
///
/// Declaration order matters: when two detectors score the same hit rate the
/// earlier variant wins.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PrimitiveType {
    Integer,
    Decimal,
    Boolean,
    Uuid,
    Email,
    Url,
    Ip,
    Date,
    Json,
    String,
}

impl PrimitiveType {
    pub fn as_str(&self) -> &'static str {
        match self {
            PrimitiveType::Integer => "integer",
            PrimitiveType::Decimal => "decimal",
            PrimitiveType::Boolean => "boolean",
            PrimitiveType::Uuid => "uuid",
            PrimitiveType::Email => "email",
            PrimitiveType::Url => "url",
            PrimitiveType::Ip => "ip",
            PrimitiveType::Date => "date",
            PrimitiveType::Json => "json",
            PrimitiveType::String => "string",
        }
    }

    /// Whether values of this type are stored as free text.
    pub fn is_textual(&self) -> bool {
        matches!(
            self,
            PrimitiveType::String | PrimitiveType::Email | PrimitiveType::Url | PrimitiveType::Ip
        )
    }
}

impl fmt::Display for PrimitiveType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Structural shape a field's values (or name) can match.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StructuralPattern {
    Slug,
    Code,
    EnumLike,
    ForeignKey,
}

impl StructuralPattern {
    pub fn as_str(&self) -> &'static str {
        match self {
            StructuralPattern::Slug => "slug",
            StructuralPattern::Code => "code",
            StructuralPattern::EnumLike => "enum_like",
            StructuralPattern::ForeignKey => "foreign_key",
        }
    }
}

/// Finalized definition of one field.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FieldDefinition {
    /// Normalized field name.
    pub name: String,

    /// Field name as it appeared in the source.
    pub source_name: String,

    /// Detected primitive type.
    pub primitive_type: PrimitiveType,

    /// Whether nulls/empties are frequent enough to declare the field nullable.
    pub nullable: bool,

    /// Suggested storage length for string-like fields (`None` = unbounded).
    pub length: Option<u32>,

    /// Suggested precision for decimal fields.
    pub precision: Option<u32>,

    /// Suggested scale for decimal fields.
    pub scale: Option<u32>,

    /// No duplicate observed over a large enough sample.
    pub unique: bool,

    /// Whether an index is suggested for this field.
    pub index: bool,

    /// Looks like the entity's primary key.
    pub primary_key: bool,

    /// Confidence in the detected type, 0-100.
    pub confidence: f64,

    /// Distinct values when the field looks enum-like.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub enum_values: Vec<String>,
}

/// Relationship kind between the analyzed entity and another.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RelationKind {
    BelongsTo,
}

/// Suggested relationship derived from a foreign-key-shaped field.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Relationship {
    pub field: String,
    pub references_entity: String,
    pub references_field: String,
    pub kind: RelationKind,
}

/// Suggested index with the reason it was suggested.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IndexSuggestion {
    pub fields: Vec<String>,
    pub unique: bool,
    pub reason: String,
}

/// Cast/coercion hint for one field.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CastHint {
    pub field: String,
    pub cast: String,
}

/// A single validation rule.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ValidationRule {
    Required,
    Nullable,
    Integer,
    Numeric,
    Boolean,
    Uuid,
    Email,
    Url,
    Ip,
    Date,
    Json,
    String,
    MaxLength(u32),
    Unique { table: String, column: String },
    In(Vec<String>),
}

impl fmt::Display for ValidationRule {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ValidationRule::Required => f.write_str("required"),
            ValidationRule::Nullable => f.write_str("nullable"),
            ValidationRule::Integer => f.write_str("integer"),
            ValidationRule::Numeric => f.write_str("numeric"),
            ValidationRule::Boolean => f.write_str("boolean"),
            ValidationRule::Uuid => f.write_str("uuid"),
            ValidationRule::Email => f.write_str("email"),
            ValidationRule::Url => f.write_str("url"),
            ValidationRule::Ip => f.write_str("ip"),
            ValidationRule::Date => f.write_str("date"),
            ValidationRule::Json => f.write_str("json"),
            ValidationRule::String => f.write_str("string"),
            ValidationRule::MaxLength(n) => write!(f, "max:{}", n),
            ValidationRule::Unique { table, column } => write!(f, "unique:{},{}", table, column),
            ValidationRule::In(values) => write!(f, "in:{}", values.join(",")),
        }
    }
}

/// Validation rules for one field.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FieldRules {
    pub field: String,
    pub rules: Vec<ValidationRule>,
}

/// A structural pattern that dominated a field's sample.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DetectedPattern {
    pub field: String,
    pub pattern: StructuralPattern,
    /// Share of non-empty sampled values matching the pattern, 0-1.
    pub ratio: f64,
}

/// Analysis metadata.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SchemaMetadata {
    /// Total records in the source, when knowable.
    pub total_records: Option<u64>,

    /// Records actually sampled.
    pub sample_size: u64,

    /// Mean of per-field confidences, rounded to 2 decimals.
    pub analysis_confidence: f64,

    /// Structural patterns detected across fields.
    pub detected_patterns: Vec<DetectedPattern>,
}

/// Immutable inferred schema for a whole source.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SchemaDescriptor {
    pub source_kind: SourceKind,

    /// Suggested entity (model) name, e.g. `Customer`.
    pub entity_name: String,

    /// Suggested collection/table name, e.g. `customers`.
    pub table_name: String,

    pub fields: Vec<FieldDefinition>,
    pub relationships: Vec<Relationship>,
    pub indexes: Vec<IndexSuggestion>,
    pub fillable: Vec<String>,
    pub casts: Vec<CastHint>,
    pub validation_rules: Vec<FieldRules>,
    pub metadata: SchemaMetadata,
}

impl SchemaDescriptor {
    /// Look up a field definition by normalized name.
    pub fn field(&self, name: &str) -> Option<&FieldDefinition> {
        self.fields.iter().find(|f| f.name == name)
    }

    /// Serialize to pretty JSON.
    pub fn to_json(&self) -> Result<String> {
        Ok(serde_json::to_string_pretty(self)?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_primitive_type_order_is_declaration_order() {
        assert!(PrimitiveType::Integer < PrimitiveType::Decimal);
        assert!(PrimitiveType::Json < PrimitiveType::String);
    }

    #[test]
    fn test_validation_rule_display() {
        assert_eq!(ValidationRule::MaxLength(255).to_string(), "max:255");
        assert_eq!(
            ValidationRule::In(vec!["a".into(), "b".into()]).to_string(),
            "in:a,b"
        );
        assert_eq!(
            ValidationRule::Unique {
                table: "users".into(),
                column: "email".into()
            }
            .to_string(),
            "unique:users,email"
        );
    }

    #[test]
    fn test_source_kind_serializes_snake_case() {
        assert_eq!(
            serde_json::to_string(&SourceKind::Markup).unwrap(),
            "\"markup\""
        );
    }
}
