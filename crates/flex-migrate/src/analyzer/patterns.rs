//! Structural pattern matchers.
//!
//! Unlike type detectors these look at a value in the context of its field
//! name. Enum-likeness is a property of the whole distribution and is decided
//! at finalization instead (see [`FieldProfile::enum_values`](super::FieldProfile::enum_values)).

use lazy_static::lazy_static;
use regex::Regex;

use crate::core::StructuralPattern;

lazy_static! {
    static ref SLUG: Option<Regex> = Regex::new(r"^[a-z0-9]+(-[a-z0-9]+)+$").ok();
    static ref CODE: Option<Regex> = Regex::new(r"^[A-Z]{1,6}[-_]?[0-9]{2,}$").ok();
}

/// Suffix marking a foreign-key-shaped field name.
pub const FOREIGN_KEY_SUFFIX: &str = "_id";

/// Field-name vocabulary that suggests a lookup index.
pub const SEARCHABLE_NAMES: &[&str] = &["email", "username", "slug", "code", "sku"];

/// Whether a normalized field name has the foreign-key suffix.
pub fn is_foreign_key_name(name: &str) -> bool {
    name.len() > FOREIGN_KEY_SUFFIX.len() && name.ends_with(FOREIGN_KEY_SUFFIX)
}

/// Entity referenced by a foreign-key-shaped field (`author_id` → `author`).
pub fn referenced_base(name: &str) -> Option<&str> {
    if is_foreign_key_name(name) {
        name.strip_suffix(FOREIGN_KEY_SUFFIX)
    } else {
        None
    }
}

/// Whether a normalized field name is in the searchable vocabulary.
pub fn is_searchable_name(name: &str) -> bool {
    SEARCHABLE_NAMES
        .iter()
        .any(|w| name == *w || name.strip_suffix(w).map_or(false, |rest| rest.ends_with('_')))
}

/// A value-level structural pattern.
pub trait PatternMatcher: Send + Sync {
    fn pattern(&self) -> StructuralPattern;

    fn matches(&self, field: &str, value: &str) -> bool;
}

pub struct SlugMatcher;

impl PatternMatcher for SlugMatcher {
    fn pattern(&self) -> StructuralPattern {
        StructuralPattern::Slug
    }

    fn matches(&self, _field: &str, value: &str) -> bool {
        SLUG.as_ref().map_or(false, |re| re.is_match(value))
    }
}

/// Upper-case prefix followed by a number (`SKU-001`, `AB12`).
pub struct CodeMatcher;

impl PatternMatcher for CodeMatcher {
    fn pattern(&self) -> StructuralPattern {
        StructuralPattern::Code
    }

    fn matches(&self, _field: &str, value: &str) -> bool {
        CODE.as_ref().map_or(false, |re| re.is_match(value))
    }
}

/// Positive integer in a field named `*_id`.
pub struct ForeignKeyMatcher;

impl PatternMatcher for ForeignKeyMatcher {
    fn pattern(&self) -> StructuralPattern {
        StructuralPattern::ForeignKey
    }

    fn matches(&self, field: &str, value: &str) -> bool {
        is_foreign_key_name(field) && value.parse::<u64>().map_or(false, |n| n > 0)
    }
}

/// Default value-level matchers.
pub fn default_matchers() -> Vec<Box<dyn PatternMatcher>> {
    vec![
        Box::new(SlugMatcher),
        Box::new(CodeMatcher),
        Box::new(ForeignKeyMatcher),
    ]
}
