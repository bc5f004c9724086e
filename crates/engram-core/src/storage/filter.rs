//! Query filter predicate.
//!
//! A conjunction of optional clauses compiled into SQL against the
//! `memories` table. Archived rows are excluded unless asked for.

use rusqlite::types::Value;

use crate::memory::{MemoryType, MetaValue, TagMode};
use crate::timeparse::TimeRange;

/// Which instant column a time clause applies to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum TimeField {
    #[default]
    CreatedAt,
    LastAccessedAt,
    /// Internal: used by consolidation to sample recently-modified rows.
    UpdatedAt,
}

impl TimeField {
    pub(crate) fn column(&self) -> &'static str {
        match self {
            TimeField::CreatedAt => "created_at_us",
            TimeField::LastAccessedAt => "last_accessed_at_us",
            TimeField::UpdatedAt => "updated_at_us",
        }
    }
}

/// Conjunctive filter over memories.
#[derive(Debug, Clone, Default)]
pub struct Filter {
    /// Tag clause; empty means no tag constraint.
    pub tags: Vec<String>,
    pub tag_mode: TagMode,
    /// Type clause; empty means any type.
    pub types: Vec<MemoryType>,
    /// Half-open time clause.
    pub time_range: Option<TimeRange>,
    pub time_field: TimeField,
    /// Include archived rows. Default excludes them.
    pub include_archived: bool,
    /// Single-key metadata equality.
    pub metadata_eq: Option<(String, MetaValue)>,
}

impl Filter {
    pub fn include_archived(mut self) -> Self {
        self.include_archived = true;
        self
    }

    pub fn with_time_range(mut self, range: TimeRange) -> Self {
        self.time_range = Some(range);
        self
    }

    pub fn with_tags(mut self, tags: Vec<String>, mode: TagMode) -> Self {
        self.tags = tags;
        self.tag_mode = mode;
        self
    }

    /// Compile to a WHERE fragment over table alias `m`, appending
    /// positional params. Always produces at least one predicate.
    pub(crate) fn to_sql(&self, params: &mut Vec<Value>) -> String {
        let mut clauses: Vec<String> = Vec::new();

        if !self.include_archived {
            clauses.push("m.archived = 0".to_string());
        }

        if !self.tags.is_empty() {
            let placeholders = vec!["?"; self.tags.len()].join(", ");
            for tag in &self.tags {
                params.push(Value::Text(tag.clone()));
            }
            match self.tag_mode {
                TagMode::Any => clauses.push(format!(
                    "m.row_id IN (SELECT row_id FROM memory_tags WHERE tag IN ({placeholders}))"
                )),
                TagMode::All => {
                    clauses.push(format!(
                        "m.row_id IN (SELECT row_id FROM memory_tags WHERE tag IN ({placeholders}) \
                         GROUP BY row_id HAVING COUNT(DISTINCT tag) = ?)"
                    ));
                    params.push(Value::Integer(self.tags.len() as i64));
                }
            }
        }

        if !self.types.is_empty() {
            let placeholders = vec!["?"; self.types.len()].join(", ");
            for ty in &self.types {
                params.push(Value::Text(ty.as_str().into_owned()));
            }
            clauses.push(format!("m.memory_type IN ({placeholders})"));
        }

        if let Some(range) = &self.time_range {
            let col = self.time_field.column();
            clauses.push(format!("m.{col} >= ? AND m.{col} < ?"));
            params.push(Value::Integer(range.start.timestamp_micros()));
            params.push(Value::Integer(range.end.timestamp_micros()));
        }

        if let Some((key, value)) = &self.metadata_eq {
            clauses.push("json_extract(m.metadata_json, '$.' || ?) = ?".to_string());
            params.push(Value::Text(key.clone()));
            params.push(match value {
                MetaValue::Bool(b) => Value::Integer(i64::from(*b)),
                MetaValue::Number(n) => Value::Real(*n),
                MetaValue::String(s) => Value::Text(s.clone()),
                MetaValue::StringList(list) => Value::Text(
                    serde_json::to_string(list).unwrap_or_default(),
                ),
            });
        }

        if clauses.is_empty() {
            "1 = 1".to_string()
        } else {
            clauses.join(" AND ")
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{TimeZone, Utc};

    #[test]
    fn test_default_filter_excludes_archived() {
        let mut params = Vec::new();
        let sql = Filter::default().to_sql(&mut params);
        assert!(sql.contains("archived = 0"));
        assert!(params.is_empty());
    }

    #[test]
    fn test_include_archived_drops_clause() {
        let mut params = Vec::new();
        let sql = Filter::default().include_archived().to_sql(&mut params);
        assert!(!sql.contains("archived"));
    }

    #[test]
    fn test_all_mode_counts_distinct_tags() {
        let mut params = Vec::new();
        let sql = Filter::default()
            .with_tags(vec!["a".into(), "b".into()], TagMode::All)
            .to_sql(&mut params);
        assert!(sql.contains("HAVING COUNT(DISTINCT tag) = ?"));
        // two tags + count + (no archived param)
        assert_eq!(params.len(), 3);
    }

    #[test]
    fn test_time_clause_is_half_open() {
        let start = Utc.with_ymd_and_hms(2025, 2, 3, 0, 0, 0).unwrap();
        let end = Utc.with_ymd_and_hms(2025, 2, 10, 0, 0, 0).unwrap();
        let mut params = Vec::new();
        let sql = Filter::default()
            .with_time_range(TimeRange::new(start, end))
            .to_sql(&mut params);
        assert!(sql.contains(">= ?") && sql.contains("< ?"));
    }

    #[test]
    fn test_accessed_at_field() {
        let start = Utc.with_ymd_and_hms(2025, 2, 3, 0, 0, 0).unwrap();
        let end = Utc.with_ymd_and_hms(2025, 2, 10, 0, 0, 0).unwrap();
        let filter = Filter {
            time_range: Some(TimeRange::new(start, end)),
            time_field: TimeField::LastAccessedAt,
            ..Default::default()
        };
        let mut params = Vec::new();
        let sql = filter.to_sql(&mut params);
        assert!(sql.contains("last_accessed_at_us"));
    }
}
