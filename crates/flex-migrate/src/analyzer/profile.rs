//! Per-field analysis accumulator.

use std::collections::{BTreeMap, HashSet};

use super::detectors::DetectorRegistry;
use super::patterns::PatternMatcher;
use crate::core::StructuralPattern;

/// Mutable statistics for one field, built up one sampled record at a time.
#[derive(Debug, Clone)]
pub struct FieldProfile {
    name: String,
    sample_cap: usize,
    samples: Vec<String>,
    sampled: u64,
    nulls: u64,
    empties: u64,
    min_length: Option<usize>,
    max_length: usize,
    total_length: u64,
    /// Hits per detector, indexed like the registry.
    type_hits: Vec<u64>,
    pattern_hits: BTreeMap<StructuralPattern, u64>,
    seen: HashSet<String>,
    duplicate: bool,
    frequencies: BTreeMap<String, u64>,
    max_integer_digits: u32,
    max_scale: u32,
}

impl FieldProfile {
    pub fn new(name: impl Into<String>, detectors: usize, sample_cap: usize) -> Self {
        Self {
            name: name.into(),
            sample_cap,
            samples: Vec::new(),
            sampled: 0,
            nulls: 0,
            empties: 0,
            min_length: None,
            max_length: 0,
            total_length: 0,
            type_hits: vec![0; detectors],
            pattern_hits: BTreeMap::new(),
            seen: HashSet::new(),
            duplicate: false,
            frequencies: BTreeMap::new(),
            max_integer_digits: 0,
            max_scale: 0,
        }
    }

    /// Profile for a field first seen after `missed` records; those count as nulls.
    pub fn late(name: impl Into<String>, detectors: usize, sample_cap: usize, missed: u64) -> Self {
        let mut profile = Self::new(name, detectors, sample_cap);
        profile.sampled = missed;
        profile.nulls = missed;
        profile
    }

    /// Fold one value into the profile.
    pub fn observe(
        &mut self,
        value: Option<&str>,
        detectors: &DetectorRegistry,
        matchers: &[Box<dyn PatternMatcher>],
    ) {
        self.sampled += 1;
        let value = match value {
            None => {
                self.nulls += 1;
                return;
            }
            Some(v) => v.trim(),
        };
        if value.is_empty() {
            self.empties += 1;
            return;
        }

        let length = value.chars().count();
        self.min_length = Some(self.min_length.map_or(length, |m| m.min(length)));
        self.max_length = self.max_length.max(length);
        self.total_length += length as u64;

        if self.samples.len() < self.sample_cap {
            self.samples.push(value.to_string());
        }
        if !self.seen.insert(value.to_string()) {
            self.duplicate = true;
        }
        *self.frequencies.entry(value.to_string()).or_insert(0) += 1;

        for (i, detector) in detectors.iter().enumerate() {
            if detector.detect(value) {
                if let Some(hits) = self.type_hits.get_mut(i) {
                    *hits += 1;
                }
            }
        }
        for matcher in matchers {
            if matcher.matches(&self.name, value) {
                *self.pattern_hits.entry(matcher.pattern()).or_insert(0) += 1;
            }
        }

        self.observe_digits(value);
    }

    fn observe_digits(&mut self, value: &str) {
        let unsigned = value.trim_start_matches(['-', '+']);
        if unsigned.is_empty() || unsigned.contains(['e', 'E']) {
            return;
        }
        let (int_part, frac_part) = match unsigned.split_once('.') {
            Some((i, f)) => (i, f),
            None => (unsigned, ""),
        };
        if !int_part.bytes().all(|b| b.is_ascii_digit()) || !frac_part.bytes().all(|b| b.is_ascii_digit()) {
            return;
        }
        let digits = int_part.trim_start_matches('0').len().max(1) as u32;
        self.max_integer_digits = self.max_integer_digits.max(digits);
        self.max_scale = self.max_scale.max(frac_part.len() as u32);
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn sampled(&self) -> u64 {
        self.sampled
    }

    pub fn nulls(&self) -> u64 {
        self.nulls
    }

    pub fn empties(&self) -> u64 {
        self.empties
    }

    pub fn non_empty(&self) -> u64 {
        self.sampled - self.nulls - self.empties
    }

    /// Share of sampled values that were null or empty; 0 with no samples.
    pub fn null_fraction(&self) -> f64 {
        ratio(self.nulls + self.empties, self.sampled)
    }

    pub fn non_empty_fraction(&self) -> f64 {
        if self.sampled == 0 {
            0.0
        } else {
            1.0 - self.null_fraction()
        }
    }

    /// Hit rate of detector `index` over non-empty values.
    pub fn hit_rate(&self, index: usize) -> f64 {
        ratio(self.type_hits.get(index).copied().unwrap_or(0), self.non_empty())
    }

    /// Share of non-empty values matching `pattern`.
    pub fn pattern_ratio(&self, pattern: StructuralPattern) -> f64 {
        ratio(
            self.pattern_hits.get(&pattern).copied().unwrap_or(0),
            self.non_empty(),
        )
    }

    pub fn samples(&self) -> &[String] {
        &self.samples
    }

    pub fn min_length(&self) -> Option<usize> {
        self.min_length
    }

    pub fn max_length(&self) -> usize {
        self.max_length
    }

    pub fn avg_length(&self) -> f64 {
        ratio(self.total_length, self.non_empty())
    }

    pub fn has_duplicates(&self) -> bool {
        self.duplicate
    }

    pub fn distinct(&self) -> usize {
        self.frequencies.len()
    }

    pub fn max_integer_digits(&self) -> u32 {
        self.max_integer_digits
    }

    pub fn max_scale(&self) -> u32 {
        self.max_scale
    }

    /// Distinct values, sorted, when the distribution looks enum-like.
    pub fn enum_values(&self, max_distinct: usize, max_ratio: f64) -> Option<Vec<String>> {
        let distinct = self.distinct();
        if distinct == 0 || distinct > max_distinct {
            return None;
        }
        if ratio(distinct as u64, self.non_empty()) > max_ratio {
            return None;
        }
        Some(self.frequencies.keys().cloned().collect())
    }
}

/// Zero-guarded ratio.
pub(crate) fn ratio(part: u64, whole: u64) -> f64 {
    if whole == 0 {
        0.0
    } else {
        part as f64 / whole as f64
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::analyzer::patterns::default_matchers;

    fn profile_of(name: &str, values: &[Option<&str>], cap: usize) -> FieldProfile {
        let detectors = DetectorRegistry::default();
        let matchers = default_matchers();
        let mut p = FieldProfile::new(name, detectors.len(), cap);
        for v in values {
            p.observe(*v, &detectors, &matchers);
        }
        p
    }

    #[test]
    fn test_counters_and_fractions() {
        let p = profile_of("score", &[Some("1.50"), None, Some(""), Some("12.125")], 50);
        assert_eq!(p.sampled(), 4);
        assert_eq!(p.nulls(), 1);
        assert_eq!(p.empties(), 1);
        assert_eq!(p.non_empty(), 2);
        assert!((p.null_fraction() - 0.5).abs() < f64::EPSILON);
        assert_eq!(p.max_integer_digits(), 2);
        assert_eq!(p.max_scale(), 3);
        assert_eq!(p.min_length(), Some(4));
        assert_eq!(p.max_length(), 6);
    }

    #[test]
    fn test_sample_cache_is_bounded() {
        let values: Vec<String> = (0..500).map(|i| i.to_string()).collect();
        let refs: Vec<Option<&str>> = values.iter().map(|v| Some(v.as_str())).collect();
        let p = profile_of("n", &refs, 50);
        assert_eq!(p.samples().len(), 50);
        assert_eq!(p.sampled(), 500);
        assert!(!p.has_duplicates());
    }

    #[test]
    fn test_empty_profile_is_zero_guarded() {
        let p = profile_of("x", &[], 50);
        assert_eq!(p.null_fraction(), 0.0);
        assert_eq!(p.non_empty_fraction(), 0.0);
        assert_eq!(p.hit_rate(0), 0.0);
        assert_eq!(p.avg_length(), 0.0);
        assert!(p.enum_values(10, 0.5).is_none());
    }

    #[test]
    fn test_enum_values() {
        let values = ["a", "b", "a", "b", "a", "c"];
        let refs: Vec<Option<&str>> = values.iter().map(|v| Some(*v)).collect();
        let p = profile_of("status", &refs, 50);
        assert!(p.has_duplicates());
        assert_eq!(
            p.enum_values(10, 0.5),
            Some(vec!["a".to_string(), "b".to_string(), "c".to_string()])
        );
        assert_eq!(p.enum_values(2, 0.5), None);
    }

    #[test]
    fn test_late_profile_counts_missed_records_as_null() {
        let detectors = DetectorRegistry::default();
        let mut p = FieldProfile::late("extra", detectors.len(), 50, 3);
        p.observe(Some("x"), &detectors, &[]);
        assert_eq!(p.sampled(), 4);
        assert_eq!(p.nulls(), 3);
    }
}
