//! Core data types shared by every component.
//!
//! - [`record`]: decoded records and their provenance
//! - [`schema`]: the inferred schema handed to external generators
//! - [`naming`]: identifier normalization for entities and fields

pub mod naming;
pub mod record;
pub mod schema;

pub use record::{Provenance, Record};
pub use schema::{
    CastHint, DetectedPattern, FieldDefinition, FieldRules, IndexSuggestion, PrimitiveType,
    RelationKind, Relationship, SchemaDescriptor, SchemaMetadata, SourceKind, StructuralPattern,
    ValidationRule,
};
