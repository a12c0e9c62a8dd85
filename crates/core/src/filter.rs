//! Metadata filters pushed down to the vector search service.
//!
//! Filters range over a fixed field set and compose conjunctively (`And`)
//! and disjunctively (`Or`). They are applied *inside* each similarity
//! search, never as a post-filter over the top-k window.

use std::cmp::Ordering;

use chrono::NaiveDate;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

/// The passage metadata fields a filter may constrain.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FilterField {
    Competitor,
    SourceType,
    Topic,
    Credibility,
    PublishDate,
}

impl FilterField {
    /// The metadata key this field is stored under in the corpus.
    pub fn key(&self) -> &'static str {
        match self {
            Self::Competitor => "competitor",
            Self::SourceType => "source_type",
            Self::Topic => "primary_topic",
            Self::Credibility => "credibility",
            Self::PublishDate => "content_date",
        }
    }
}

/// A filter expression over passage metadata.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "op", rename_all = "snake_case")]
pub enum MetadataFilter {
    /// Field equals value.
    Eq { field: FilterField, value: String },
    /// Field is one of the values.
    In { field: FilterField, values: Vec<String> },
    /// Field lies within an inclusive range.
    ///
    /// Values and bounds that start with an ISO date compare by calendar day,
    /// so a timestamp on the bound day is inside the range. Anything else
    /// compares as a string.
    Range {
        field: FilterField,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        gte: Option<String>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        lte: Option<String>,
    },
    /// All clauses must match.
    And { clauses: Vec<MetadataFilter> },
    /// At least one clause must match.
    Or { clauses: Vec<MetadataFilter> },
}

impl MetadataFilter {
    /// Build a filter for one field from a list of accepted values.
    ///
    /// One value becomes `Eq`, several become `In`, none yields `None`.
    pub fn any_of(field: FilterField, values: &[String]) -> Option<Self> {
        match values {
            [] => None,
            [single] => Some(Self::Eq {
                field,
                value: single.clone(),
            }),
            many => Some(Self::In {
                field,
                values: many.to_vec(),
            }),
        }
    }

    /// Conjoin clauses, collapsing the trivial cases.
    pub fn all(mut clauses: Vec<Self>) -> Option<Self> {
        match clauses.len() {
            0 => None,
            1 => clauses.pop(),
            _ => Some(Self::And { clauses }),
        }
    }

    /// Evaluate the filter against a passage's metadata map.
    ///
    /// A missing field never matches a leaf clause.
    pub fn matches(&self, metadata: &Map<String, Value>) -> bool {
        match self {
            Self::Eq { field, value } => {
                field_value(metadata, *field).is_some_and(|v| v == *value)
            }
            Self::In { field, values } => {
                field_value(metadata, *field).is_some_and(|v| values.iter().any(|x| *x == v))
            }
            Self::Range { field, gte, lte } => match field_value(metadata, *field) {
                Some(v) => {
                    gte.as_ref().is_none_or(|lo| range_cmp(&v, lo) != Ordering::Less)
                        && lte.as_ref().is_none_or(|hi| range_cmp(&v, hi) != Ordering::Greater)
                }
                None => false,
            },
            Self::And { clauses } => clauses.iter().all(|c| c.matches(metadata)),
            Self::Or { clauses } => clauses.iter().any(|c| c.matches(metadata)),
        }
    }
}

fn leading_date(s: &str) -> Option<NaiveDate> {
    NaiveDate::parse_from_str(s.get(..10)?, "%Y-%m-%d").ok()
}

fn range_cmp(value: &str, bound: &str) -> Ordering {
    match (leading_date(value), leading_date(bound)) {
        (Some(v), Some(b)) => v.cmp(&b),
        _ => value.cmp(bound),
    }
}

fn field_value(metadata: &Map<String, Value>, field: FilterField) -> Option<String> {
    match metadata.get(field.key())? {
        Value::String(s) => Some(s.clone()),
        Value::Null => None,
        other => Some(other.to_string()),
    }
}

/// Caller-facing filter selections for one query.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct QueryFilters {
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub competitors: Vec<String>,

    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub topics: Vec<String>,

    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub source_types: Vec<String>,

    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub credibility: Vec<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub published_after: Option<NaiveDate>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub published_before: Option<NaiveDate>,
}

impl QueryFilters {
    pub fn is_empty(&self) -> bool {
        self.to_metadata_filter().is_none()
    }

    /// Lower the selections into a single pushed-down filter expression.
    pub fn to_metadata_filter(&self) -> Option<MetadataFilter> {
        let mut clauses: Vec<MetadataFilter> = [
            (FilterField::Competitor, &self.competitors),
            (FilterField::Topic, &self.topics),
            (FilterField::SourceType, &self.source_types),
            (FilterField::Credibility, &self.credibility),
        ]
        .into_iter()
        .filter_map(|(field, values)| MetadataFilter::any_of(field, values))
        .collect();

        if self.published_after.is_some() || self.published_before.is_some() {
            clauses.push(MetadataFilter::Range {
                field: FilterField::PublishDate,
                gte: self.published_after.map(|d| d.to_string()),
                lte: self.published_before.map(|d| d.to_string()),
            });
        }

        MetadataFilter::all(clauses)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn meta(value: Value) -> Map<String, Value> {
        value.as_object().cloned().unwrap()
    }

    #[test]
    fn single_value_becomes_eq() {
        let filters = QueryFilters {
            competitors: vec!["questdb".into()],
            ..Default::default()
        };
        assert_eq!(
            filters.to_metadata_filter(),
            Some(MetadataFilter::Eq {
                field: FilterField::Competitor,
                value: "questdb".into()
            })
        );
    }

    #[test]
    fn several_fields_become_and() {
        let filters = QueryFilters {
            competitors: vec!["questdb".into(), "clickhouse".into()],
            source_types: vec!["benchmark".into()],
            ..Default::default()
        };
        match filters.to_metadata_filter().unwrap() {
            MetadataFilter::And { clauses } => {
                assert_eq!(clauses.len(), 2);
                assert!(matches!(clauses[0], MetadataFilter::In { .. }));
            }
            other => panic!("expected And, got {other:?}"),
        }
    }

    #[test]
    fn empty_filters_yield_none() {
        assert!(QueryFilters::default().is_empty());
    }

    #[test]
    fn and_or_evaluation() {
        let m = meta(json!({"competitor": "kx", "source_type": "blog", "credibility": "high"}));
        let f = MetadataFilter::And {
            clauses: vec![
                MetadataFilter::Eq {
                    field: FilterField::Competitor,
                    value: "kx".into(),
                },
                MetadataFilter::Or {
                    clauses: vec![
                        MetadataFilter::Eq {
                            field: FilterField::SourceType,
                            value: "official_docs".into(),
                        },
                        MetadataFilter::In {
                            field: FilterField::Credibility,
                            values: vec!["high".into(), "medium".into()],
                        },
                    ],
                },
            ],
        };
        assert!(f.matches(&m));

        let other = meta(json!({"competitor": "questdb", "credibility": "high"}));
        assert!(!f.matches(&other));
    }

    #[test]
    fn date_range_is_inclusive() {
        let filters = QueryFilters {
            published_after: NaiveDate::from_ymd_opt(2024, 1, 1),
            published_before: NaiveDate::from_ymd_opt(2024, 12, 31),
            ..Default::default()
        };
        let f = filters.to_metadata_filter().unwrap();
        assert!(f.matches(&meta(json!({"content_date": "2024-01-01"}))));
        assert!(f.matches(&meta(json!({"content_date": "2024-06-15"}))));
        assert!(!f.matches(&meta(json!({"content_date": "2023-12-31"}))));
        assert!(!f.matches(&meta(json!({}))));
    }

    #[test]
    fn timestamp_on_bound_day_is_in_range() {
        let f = MetadataFilter::Range {
            field: FilterField::PublishDate,
            gte: Some("2024-06-01".into()),
            lte: Some("2024-06-30".into()),
        };
        assert!(f.matches(&meta(json!({"content_date": "2024-06-30T12:00"}))));
        assert!(f.matches(&meta(json!({"content_date": "2024-06-01T00:00:00Z"}))));
        assert!(!f.matches(&meta(json!({"content_date": "2024-07-01T00:00"}))));
        // Not a date: plain string order.
        assert!(!f.matches(&meta(json!({"content_date": "unknown"}))));
    }

    #[test]
    fn filter_serializes_with_op_tag() {
        let f = MetadataFilter::Eq {
            field: FilterField::Topic,
            value: "licensing_pricing".into(),
        };
        let json = serde_json::to_string(&f).unwrap();
        assert!(json.contains(r#""op":"eq""#));
        assert!(json.contains(r#""field":"topic""#));
    }
}
