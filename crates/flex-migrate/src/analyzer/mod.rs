//! Schema inference over a bounded sample of a decoder's records.
//!
//! The analyzer reads at most `sample_size` records in chunks, folds each field
//! into a [`FieldProfile`], and freezes the profiles into a [`SchemaDescriptor`].
//! Nothing past the sample is read, so analysis cost is independent of source size.

mod detectors;
mod patterns;
mod profile;

pub use detectors::{
    BooleanDetector, DateDetector, DecimalDetector, DetectorRegistry, EmailDetector,
    IntegerDetector, IpDetector, JsonDetector, TextDetector, TypeDetector, UrlDetector,
    UuidDetector,
};
pub use patterns::{
    default_matchers, is_foreign_key_name, is_searchable_name, referenced_base, CodeMatcher,
    ForeignKeyMatcher, PatternMatcher, SlugMatcher,
};
pub use profile::FieldProfile;

use std::collections::HashMap;

use tracing::{debug, info};

use crate::config::AnalysisConfig;
use crate::core::naming::{entity_name, table_name};
use crate::core::{
    CastHint, DetectedPattern, FieldDefinition, FieldRules, IndexSuggestion, PrimitiveType,
    RelationKind, Relationship, Record, SchemaDescriptor, SchemaMetadata, SourceKind,
    StructuralPattern, ValidationRule,
};
use crate::decoder::{ColumnShape, DeclaredType, Decoder, TableShape};
use crate::error::{MigrateError, Result};
use profile::ratio;

/// Fields never offered as mass-assignable.
const GUARDED_FIELDS: &[&str] = &["id", "created_at", "updated_at", "deleted_at"];

fn round2(value: f64) -> f64 {
    (value * 100.0).round() / 100.0
}

/// Bucket an observed maximum length into a storage suggestion.
pub fn suggest_length(max_length: usize) -> Option<u32> {
    match max_length {
        0..=50 => Some(50),
        51..=100 => Some(100),
        101..=255 => Some(255),
        _ => None,
    }
}

/// Infers a [`SchemaDescriptor`] from a sample of records.
pub struct SchemaAnalyzer {
    config: AnalysisConfig,
    detectors: DetectorRegistry,
    matchers: Vec<Box<dyn PatternMatcher>>,
}

impl SchemaAnalyzer {
    pub fn new(config: AnalysisConfig) -> Self {
        Self {
            config,
            detectors: DetectorRegistry::default(),
            matchers: default_matchers(),
        }
    }

    /// Replace the detector list.
    pub fn with_detectors(mut self, detectors: DetectorRegistry) -> Self {
        self.detectors = detectors;
        self
    }

    /// Add a structural pattern matcher.
    pub fn with_matcher(mut self, matcher: Box<dyn PatternMatcher>) -> Self {
        self.matchers.push(matcher);
        self
    }

    /// Analyze up to the configured sample size.
    pub fn analyze<D: Decoder + ?Sized>(&self, decoder: &mut D) -> Result<SchemaDescriptor> {
        self.analyze_with_limit(decoder, self.config.sample_size)
    }

    /// Analyze up to `limit` records.
    pub fn analyze_with_limit<D: Decoder + ?Sized>(
        &self,
        decoder: &mut D,
        limit: usize,
    ) -> Result<SchemaDescriptor> {
        let mut state = Sampling {
            profiles: Vec::new(),
            index: HashMap::new(),
            sampled: 0,
        };
        for name in decoder.header_names() {
            state.ensure(name, &self.detectors, self.config.sample_cache_cap);
        }

        let chunk_size = self.config.chunk_size.max(1);
        let mut exhausted = false;
        let mut skipped = 0u64;
        let mut chunk: Vec<Record> = Vec::with_capacity(chunk_size.min(limit));

        while (state.sampled as usize) < limit && !exhausted {
            let want = chunk_size.min(limit - state.sampled as usize);
            chunk.clear();
            while chunk.len() < want {
                match decoder.next_record() {
                    Ok(Some(record)) => chunk.push(record),
                    Ok(None) => {
                        exhausted = true;
                        break;
                    }
                    Err(MigrateError::Decode {
                        message,
                        provenance,
                    }) => {
                        debug!("Skipping malformed {} during analysis: {}", provenance, message);
                        skipped += 1;
                    }
                    Err(e) => return Err(e),
                }
            }
            for record in &chunk {
                state.observe(record, &self.detectors, &self.matchers, self.config.sample_cache_cap);
            }
        }

        // A stream that ends exactly at the limit is not observed as exhausted.
        let total_records = if exhausted {
            Some(state.sampled)
        } else {
            decoder.estimated_total()
        };

        let entity = decoder
            .entity_hint()
            .map(entity_name)
            .unwrap_or_else(|| "Record".to_string());
        let shape = decoder.entity_hint().and_then(|hint| {
            decoder
                .table_shapes()
                .iter()
                .find(|s| s.name.eq_ignore_ascii_case(hint))
                .cloned()
        });

        let source_names: HashMap<String, String> = decoder
            .header_names()
            .iter()
            .cloned()
            .zip(decoder.source_names().iter().cloned())
            .collect();

        info!(
            "Analyzed {} record(s) across {} field(s){}",
            state.sampled,
            state.profiles.len(),
            if skipped > 0 {
                format!(", skipped {} malformed", skipped)
            } else {
                String::new()
            }
        );

        let descriptor = self.finalize(
            decoder.source_kind(),
            entity,
            state,
            shape.as_ref(),
            &source_names,
            total_records,
        );
        Ok(descriptor)
    }

    fn finalize(
        &self,
        source_kind: SourceKind,
        entity: String,
        state: Sampling,
        shape: Option<&TableShape>,
        source_names: &HashMap<String, String>,
        total_records: Option<u64>,
    ) -> SchemaDescriptor {
        let table = table_name(&entity);
        let sampled = state.sampled;

        let mut fields = Vec::with_capacity(state.profiles.len());
        let mut relationships = Vec::new();
        let mut indexes = Vec::new();
        let mut fillable = Vec::new();
        let mut casts = Vec::new();
        let mut validation_rules = Vec::new();
        let mut detected_patterns = Vec::new();

        for profile in state.profiles {
            let column = shape.and_then(|s| s.column(profile.name()));
            let field = self.define(&profile, sampled, column, source_names);

            for pattern in [
                StructuralPattern::Slug,
                StructuralPattern::Code,
                StructuralPattern::ForeignKey,
            ] {
                let r = profile.pattern_ratio(pattern);
                if r > 0.0 && r >= self.config.pattern_min_ratio {
                    detected_patterns.push(DetectedPattern {
                        field: field.name.clone(),
                        pattern,
                        ratio: round2(r),
                    });
                }
            }
            if !field.enum_values.is_empty() {
                detected_patterns.push(DetectedPattern {
                    field: field.name.clone(),
                    pattern: StructuralPattern::EnumLike,
                    ratio: round2(1.0 - ratio(profile.distinct() as u64, profile.non_empty())),
                });
            }

            let foreign_key =
                is_foreign_key_name(&field.name) && field.primitive_type == PrimitiveType::Integer;
            if foreign_key {
                if let Some(base) = referenced_base(&field.name) {
                    relationships.push(Relationship {
                        field: field.name.clone(),
                        references_entity: entity_name(base),
                        references_field: "id".to_string(),
                        kind: RelationKind::BelongsTo,
                    });
                }
            }

            if field.index && !field.primary_key {
                let reason = if field.unique {
                    "no duplicate values in sample"
                } else if foreign_key {
                    "foreign key"
                } else {
                    "searchable field name"
                };
                indexes.push(IndexSuggestion {
                    fields: vec![field.name.clone()],
                    unique: field.unique,
                    reason: reason.to_string(),
                });
            }

            if let Some(cast) = cast_for(&field) {
                casts.push(CastHint {
                    field: field.name.clone(),
                    cast,
                });
            }

            if !field.primary_key && !GUARDED_FIELDS.contains(&field.name.as_str()) {
                fillable.push(field.name.clone());
                validation_rules.push(FieldRules {
                    field: field.name.clone(),
                    rules: rules_for(&field, &table),
                });
            }

            fields.push(field);
        }

        let analysis_confidence = if fields.is_empty() {
            0.0
        } else {
            round2(fields.iter().map(|f| f.confidence).sum::<f64>() / fields.len() as f64)
        };

        SchemaDescriptor {
            source_kind,
            entity_name: entity,
            table_name: table,
            fields,
            relationships,
            indexes,
            fillable,
            casts,
            validation_rules,
            metadata: SchemaMetadata {
                total_records,
                sample_size: sampled,
                analysis_confidence,
                detected_patterns,
            },
        }
    }

    /// Freeze one profile into a field definition.
    fn define(
        &self,
        profile: &FieldProfile,
        sampled: u64,
        column: Option<&ColumnShape>,
        source_names: &HashMap<String, String>,
    ) -> FieldDefinition {
        let name = profile.name().to_string();
        let (mut primitive_type, mut confidence) = self.best_type(profile);

        let mut nullable = profile.null_fraction() > self.config.nullable_threshold;
        let unique = !profile.has_duplicates()
            && profile.non_empty() > 0
            && sampled > self.config.unique_min_sample;
        let mut primary_key =
            name == "id" && !profile.has_duplicates() && profile.nulls() + profile.empties() == 0;

        let mut length = if primitive_type.is_textual() {
            suggest_length(profile.max_length())
        } else {
            None
        };

        // Declared columns override inference.
        if let Some(column) = column {
            primitive_type = column.primitive;
            confidence = 100.0;
            nullable = column.nullable;
            primary_key = column.primary_key;
            length = if primitive_type.is_textual() {
                DeclaredType::parse(&column.declared_type)
                    .length
                    .or_else(|| suggest_length(profile.max_length()))
            } else {
                None
            };
        }

        let (precision, scale) = if primitive_type == PrimitiveType::Decimal {
            let scale = profile.max_scale();
            (Some(profile.max_integer_digits() + scale), Some(scale))
        } else {
            (None, None)
        };

        let index = unique
            || is_searchable_name(&name)
            || (is_foreign_key_name(&name) && primitive_type == PrimitiveType::Integer);

        let enum_values = if primitive_type.is_textual() && !primary_key {
            profile
                .enum_values(self.config.enum_max_distinct, self.config.enum_max_ratio)
                .unwrap_or_default()
        } else {
            Vec::new()
        };

        FieldDefinition {
            source_name: source_names.get(&name).cloned().unwrap_or_else(|| name.clone()),
            name,
            primitive_type,
            nullable,
            length,
            precision,
            scale,
            unique,
            index,
            primary_key,
            confidence,
            enum_values,
        }
    }

    /// Highest-scoring detector; earlier detectors win ties.
    fn best_type(&self, profile: &FieldProfile) -> (PrimitiveType, f64) {
        if profile.non_empty() == 0 {
            return (PrimitiveType::String, 0.0);
        }
        let mut best: Option<(PrimitiveType, f64)> = None;
        for (i, detector) in self.detectors.iter().enumerate() {
            let rate = profile.hit_rate(i);
            if best.map_or(true, |(_, b)| rate > b) {
                best = Some((detector.primitive(), rate));
            }
        }
        match best {
            Some((primitive, rate)) => (primitive, round2(rate * 100.0)),
            None => (PrimitiveType::String, 0.0),
        }
    }
}

impl Default for SchemaAnalyzer {
    fn default() -> Self {
        Self::new(AnalysisConfig::default())
    }
}

fn cast_for(field: &FieldDefinition) -> Option<String> {
    let cast = match field.primitive_type {
        PrimitiveType::Integer => "integer".to_string(),
        PrimitiveType::Decimal => format!("decimal:{}", field.scale.unwrap_or(0)),
        PrimitiveType::Boolean => "boolean".to_string(),
        PrimitiveType::Date => "datetime".to_string(),
        PrimitiveType::Json => "array".to_string(),
        _ => return None,
    };
    Some(cast)
}

fn rules_for(field: &FieldDefinition, table: &str) -> Vec<ValidationRule> {
    let mut rules = vec![if field.nullable {
        ValidationRule::Nullable
    } else {
        ValidationRule::Required
    }];
    rules.push(match field.primitive_type {
        PrimitiveType::Integer => ValidationRule::Integer,
        PrimitiveType::Decimal => ValidationRule::Numeric,
        PrimitiveType::Boolean => ValidationRule::Boolean,
        PrimitiveType::Uuid => ValidationRule::Uuid,
        PrimitiveType::Email => ValidationRule::Email,
        PrimitiveType::Url => ValidationRule::Url,
        PrimitiveType::Ip => ValidationRule::Ip,
        PrimitiveType::Date => ValidationRule::Date,
        PrimitiveType::Json => ValidationRule::Json,
        PrimitiveType::String => ValidationRule::String,
    });
    if let Some(length) = field.length {
        rules.push(ValidationRule::MaxLength(length));
    }
    if field.unique {
        rules.push(ValidationRule::Unique {
            table: table.to_string(),
            column: field.name.clone(),
        });
    }
    if !field.enum_values.is_empty() {
        rules.push(ValidationRule::In(field.enum_values.clone()));
    }
    rules
}

/// Profiles in first-appearance order.
struct Sampling {
    profiles: Vec<FieldProfile>,
    index: HashMap<String, usize>,
    sampled: u64,
}

impl Sampling {
    fn ensure(&mut self, name: &str, detectors: &DetectorRegistry, cap: usize) -> usize {
        if let Some(&i) = self.index.get(name) {
            return i;
        }
        let i = self.profiles.len();
        self.profiles
            .push(FieldProfile::late(name, detectors.len(), cap, self.sampled));
        self.index.insert(name.to_string(), i);
        i
    }

    fn observe(
        &mut self,
        record: &Record,
        detectors: &DetectorRegistry,
        matchers: &[Box<dyn PatternMatcher>],
        cap: usize,
    ) {
        let mut touched = vec![false; self.profiles.len()];
        for (name, value) in record.fields() {
            let i = self.ensure(name, detectors, cap);
            if i >= touched.len() {
                touched.resize(i + 1, false);
            }
            if !touched[i] {
                touched[i] = true;
                self.profiles[i].observe(value.as_deref(), detectors, matchers);
            }
        }
        // Fields absent from this record count as null.
        for (i, seen) in touched.iter().enumerate() {
            if !seen {
                self.profiles[i].observe(None, detectors, matchers);
            }
        }
        self.sampled += 1;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::DecoderConfig;
    use crate::decoder::{ScriptDecoder, TabularDecoder};

    fn tabular(data: &str) -> TabularDecoder<&[u8]> {
        TabularDecoder::from_reader(data.as_bytes(), &DecoderConfig::default(), Some("users".into()))
            .unwrap()
    }

    #[test]
    fn test_email_field_small_sample() {
        let mut d = tabular("id,name,email\n1,Ann,a@x.com\n2,Bo,b@x.com\n");
        let schema = SchemaAnalyzer::default().analyze_with_limit(&mut d, 2).unwrap();

        let email = schema.field("email").unwrap();
        assert_eq!(email.primitive_type, PrimitiveType::Email);
        assert!(!email.nullable);
        assert!(!email.unique);
        assert!(email.index);
        assert_eq!(email.confidence, 100.0);

        assert_eq!(schema.field("id").unwrap().primitive_type, PrimitiveType::Integer);
        assert!(schema.field("id").unwrap().primary_key);
        assert_eq!(schema.entity_name, "User");
        assert_eq!(schema.table_name, "users");
        assert_eq!(schema.metadata.sample_size, 2);
        assert_eq!(schema.fillable, vec!["name".to_string(), "email".to_string()]);
    }

    #[test]
    fn test_sampling_stops_at_limit() {
        let mut data = String::from("n\n");
        for i in 0..500 {
            data.push_str(&format!("{}\n", i));
        }
        let mut d = tabular(&data);
        let schema = SchemaAnalyzer::default().analyze_with_limit(&mut d, 120).unwrap();
        assert_eq!(schema.metadata.sample_size, 120);
        assert_eq!(d.position(), 120);
    }

    #[test]
    fn test_exhausted_stream_reports_total() {
        let mut d = tabular("a\n1\n2\n3\n");
        let schema = SchemaAnalyzer::default().analyze(&mut d).unwrap();
        assert_eq!(schema.metadata.total_records, Some(3));
    }

    #[test]
    fn test_uniqueness_needs_large_sample() {
        let mut data = String::from("code,status\n");
        for i in 0..20 {
            data.push_str(&format!("C{:03},{}\n", i, if i % 2 == 0 { "open" } else { "closed" }));
        }
        let mut d = tabular(&data);
        let schema = SchemaAnalyzer::default().analyze(&mut d).unwrap();

        let code = schema.field("code").unwrap();
        assert!(code.unique);
        assert!(schema
            .indexes
            .iter()
            .any(|i| i.fields == vec!["code".to_string()] && i.unique));

        let status = schema.field("status").unwrap();
        assert!(!status.unique);
        assert_eq!(status.enum_values, vec!["closed".to_string(), "open".to_string()]);
        assert!(schema
            .metadata
            .detected_patterns
            .iter()
            .any(|p| p.field == "code" && p.pattern == StructuralPattern::Code));
    }

    #[test]
    fn test_nullable_threshold_and_lengths() {
        let mut data = String::from("note,price\n");
        for i in 0..10 {
            let note = if i < 2 { "" } else { "short text" };
            data.push_str(&format!("{},{}.25\n", note, i));
        }
        let mut d = tabular(&data);
        let schema = SchemaAnalyzer::default().analyze(&mut d).unwrap();

        let note = schema.field("note").unwrap();
        assert!(note.nullable);
        assert_eq!(note.length, Some(50));

        let price = schema.field("price").unwrap();
        assert_eq!(price.primitive_type, PrimitiveType::Decimal);
        assert_eq!(price.precision, Some(3));
        assert_eq!(price.scale, Some(2));
        assert!(schema
            .casts
            .iter()
            .any(|c| c.field == "price" && c.cast == "decimal:2"));
    }

    #[test]
    fn test_foreign_key_relationship() {
        let mut d = tabular("id,author_id,title\n1,7,a\n2,8,b\n");
        let schema = SchemaAnalyzer::default().analyze(&mut d).unwrap();
        assert_eq!(schema.relationships.len(), 1);
        assert_eq!(schema.relationships[0].field, "author_id");
        assert_eq!(schema.relationships[0].references_entity, "Author");
        assert!(schema.field("author_id").unwrap().index);
    }

    #[test]
    fn test_confidence_bounds_and_mean() {
        let mut d = tabular("a,b\n1,x\n2.5,y\nfoo,z\n");
        let schema = SchemaAnalyzer::default().analyze(&mut d).unwrap();
        for f in &schema.fields {
            assert!((0.0..=100.0).contains(&f.confidence));
        }
        let mean: f64 =
            schema.fields.iter().map(|f| f.confidence).sum::<f64>() / schema.fields.len() as f64;
        assert_eq!(schema.metadata.analysis_confidence, round2(mean));
    }

    #[test]
    fn test_reanalysis_is_deterministic() {
        let data = "id,tag,when\n1,a-b,2024-01-01\n2,c-d,2024-02-01\n3,a-b,2024-03-01\n";
        let first = SchemaAnalyzer::default().analyze(&mut tabular(data)).unwrap();
        let second = SchemaAnalyzer::default().analyze(&mut tabular(data)).unwrap();
        assert_eq!(first, second);
        assert_eq!(first.to_json().unwrap(), second.to_json().unwrap());
        assert_eq!(first.field("when").unwrap().primitive_type, PrimitiveType::Date);
    }

    #[test]
    fn test_declared_columns_override_inference() {
        let sql = "CREATE TABLE items (id INT NOT NULL, label VARCHAR(80), qty INT);\n\
                   INSERT INTO items VALUES (1,'12',NULL),(2,'13',NULL);";
        let mut d = ScriptDecoder::from_reader(sql.as_bytes(), &DecoderConfig::default());
        let schema = SchemaAnalyzer::default().analyze(&mut d).unwrap();

        let label = schema.field("label").unwrap();
        assert_eq!(label.primitive_type, PrimitiveType::String);
        assert_eq!(label.length, Some(80));
        let qty = schema.field("qty").unwrap();
        assert_eq!(qty.primitive_type, PrimitiveType::Integer);
        assert!(qty.nullable);
        assert_eq!(schema.entity_name, "Item");
    }

    #[test]
    fn test_empty_source() {
        let mut d = tabular("");
        let schema = SchemaAnalyzer::default().analyze(&mut d).unwrap();
        assert!(schema.fields.is_empty());
        assert_eq!(schema.metadata.analysis_confidence, 0.0);
        assert_eq!(schema.metadata.sample_size, 0);
    }
}
