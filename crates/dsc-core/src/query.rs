//! # Query Specification
//!
//! A [`QuerySpec`] describes a filtered, sorted and paginated view over an
//! entity store: `offset`, `limit`, an optional sort field and order, and a
//! list of [`Criterion`]s that must all match.
//!
//! Fields are addressed by dotted JSON paths (`"dataRequest.assetId"`) over
//! the serde representation of the entity, so one resolver serves every
//! entity type. [`QueryResolver`] is the in-memory implementation used by
//! the reference stores; persistent stores translate the same spec into
//! their native query language.
//!
//! ## Semantics
//!
//! - Filter, then sort, then skip `offset`, then take `limit`.
//! - A criterion naming a field an item does not have does not match it.
//! - Sorting by a field that is missing on any candidate yields an empty
//!   result rather than an arbitrary order.

use std::cmp::Ordering;
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;

/// Default page size when none is given.
pub const DEFAULT_LIMIT: usize = 50;

/// Errors raised while building or resolving a query.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum QueryError {
    /// Limit must be strictly positive.
    #[error("limit must be greater than 0")]
    InvalidLimit,

    /// Operator string is not one of the supported operators.
    #[error("unsupported operator: {0}")]
    UnsupportedOperator(String),

    /// Right operand does not fit the operator.
    #[error("invalid right operand for '{operator}': {reason}")]
    InvalidOperand {
        /// Operator the operand was supplied for.
        operator: String,
        /// Why the operand was rejected.
        reason: String,
    },

    /// An item could not be converted to its JSON representation.
    #[error("serialization failed: {0}")]
    Serialization(String),
}

/// Comparison operator of a [`Criterion`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum CriterionOperator {
    /// Equal.
    #[serde(rename = "=")]
    Eq,
    /// Not equal.
    #[serde(rename = "!=")]
    Neq,
    /// Member of an array of candidates.
    #[serde(rename = "in")]
    In,
    /// SQL-style pattern with `%` wildcards.
    #[serde(rename = "like")]
    Like,
}

impl FromStr for CriterionOperator {
    type Err = QueryError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "=" => Ok(Self::Eq),
            "!=" => Ok(Self::Neq),
            "in" => Ok(Self::In),
            "like" => Ok(Self::Like),
            other => Err(QueryError::UnsupportedOperator(other.to_string())),
        }
    }
}

impl std::fmt::Display for CriterionOperator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::Eq => "=",
            Self::Neq => "!=",
            Self::In => "in",
            Self::Like => "like",
        };
        f.write_str(s)
    }
}

/// A single `(left, operator, right)` filter expression.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Criterion {
    /// Dotted path of the field to test.
    pub operand_left: String,
    /// Comparison operator.
    pub operator: CriterionOperator,
    /// Literal to compare against.
    pub operand_right: Value,
}

impl Criterion {
    /// Build a criterion, rejecting operands that cannot fit the operator.
    pub fn new(
        left: impl Into<String>,
        operator: &str,
        right: impl Into<Value>,
    ) -> Result<Self, QueryError> {
        let operator = CriterionOperator::from_str(operator)?;
        let operand_right = right.into();
        if operator == CriterionOperator::In && !operand_right.is_array() {
            return Err(QueryError::InvalidOperand {
                operator: operator.to_string(),
                reason: "expected an array".into(),
            });
        }
        if operator == CriterionOperator::Like && !operand_right.is_string() {
            return Err(QueryError::InvalidOperand {
                operator: operator.to_string(),
                reason: "expected a string pattern".into(),
            });
        }
        Ok(Self {
            operand_left: left.into(),
            operator,
            operand_right,
        })
    }

    /// Shorthand for an equality criterion.
    pub fn eq(left: impl Into<String>, right: impl Into<Value>) -> Self {
        Self {
            operand_left: left.into(),
            operator: CriterionOperator::Eq,
            operand_right: right.into(),
        }
    }

    fn matches(&self, item: &Value) -> bool {
        let Some(value) = lookup(item, &self.operand_left) else {
            return false;
        };
        match self.operator {
            CriterionOperator::Eq => loosely_equal(value, &self.operand_right),
            CriterionOperator::Neq => !loosely_equal(value, &self.operand_right),
            CriterionOperator::In => self
                .operand_right
                .as_array()
                .is_some_and(|candidates| candidates.iter().any(|c| loosely_equal(value, c))),
            CriterionOperator::Like => self
                .operand_right
                .as_str()
                .is_some_and(|pattern| like(&as_text(value), pattern)),
        }
    }
}

/// Sort direction.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum SortOrder {
    /// Ascending.
    #[default]
    Asc,
    /// Descending.
    Desc,
}

/// Filter, sort and paging parameters for a store query.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct QuerySpec {
    /// Number of matching items to skip.
    pub offset: usize,
    /// Maximum number of items to return.
    pub limit: usize,
    /// Criteria that must all match.
    pub filter: Vec<Criterion>,
    /// Dotted path of the field to sort by.
    pub sort_field: Option<String>,
    /// Sort direction.
    pub sort_order: SortOrder,
}

impl Default for QuerySpec {
    fn default() -> Self {
        Self {
            offset: 0,
            limit: DEFAULT_LIMIT,
            filter: Vec::new(),
            sort_field: None,
            sort_order: SortOrder::Asc,
        }
    }
}

impl QuerySpec {
    /// A spec that returns every item.
    pub fn max() -> Self {
        Self {
            limit: usize::MAX,
            ..Self::default()
        }
    }

    /// Set the offset.
    pub fn with_offset(mut self, offset: usize) -> Self {
        self.offset = offset;
        self
    }

    /// Set the limit.
    pub fn with_limit(mut self, limit: usize) -> Self {
        self.limit = limit;
        self
    }

    /// Add a criterion.
    pub fn with_criterion(mut self, criterion: Criterion) -> Self {
        self.filter.push(criterion);
        self
    }

    /// Sort by `field` in `order`.
    pub fn with_sort(mut self, field: impl Into<String>, order: SortOrder) -> Self {
        self.sort_field = Some(field.into());
        self.sort_order = order;
        self
    }

    /// Reject specs that cannot be resolved.
    pub fn validate(&self) -> Result<(), QueryError> {
        if self.limit == 0 {
            return Err(QueryError::InvalidLimit);
        }
        Ok(())
    }
}

/// Applies a [`QuerySpec`] to an in-memory collection.
#[derive(Debug, Clone, Copy, Default)]
pub struct QueryResolver;

impl QueryResolver {
    /// Filter, sort and page `items` according to `spec`.
    pub fn resolve<T, I>(spec: &QuerySpec, items: I) -> Result<Vec<T>, QueryError>
    where
        T: Serialize,
        I: IntoIterator<Item = T>,
    {
        spec.validate()?;

        let mut candidates = Vec::new();
        for item in items {
            let json =
                serde_json::to_value(&item).map_err(|e| QueryError::Serialization(e.to_string()))?;
            if spec.filter.iter().all(|c| c.matches(&json)) {
                candidates.push((json, item));
            }
        }

        if let Some(field) = &spec.sort_field {
            if candidates.iter().any(|(json, _)| lookup(json, field).is_none()) {
                return Ok(Vec::new());
            }
            candidates.sort_by(|(a, _), (b, _)| {
                let ordering = match (lookup(a, field), lookup(b, field)) {
                    (Some(x), Some(y)) => compare(x, y),
                    _ => Ordering::Equal,
                };
                match spec.sort_order {
                    SortOrder::Asc => ordering,
                    SortOrder::Desc => ordering.reverse(),
                }
            });
        }

        Ok(candidates
            .into_iter()
            .skip(spec.offset)
            .take(spec.limit)
            .map(|(_, item)| item)
            .collect())
    }
}

fn lookup<'a>(value: &'a Value, path: &str) -> Option<&'a Value> {
    path.split('.')
        .try_fold(value, |current, segment| current.get(segment))
        .filter(|v| !v.is_null())
}

fn as_text(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}

fn loosely_equal(value: &Value, expected: &Value) -> bool {
    value == expected || as_text(value) == as_text(expected)
}

fn compare(a: &Value, b: &Value) -> Ordering {
    match (a.as_f64(), b.as_f64()) {
        (Some(x), Some(y)) => x.partial_cmp(&y).unwrap_or(Ordering::Equal),
        _ => as_text(a).cmp(&as_text(b)),
    }
}

/// `%` matches any run of characters, everything else matches literally.
fn like(text: &str, pattern: &str) -> bool {
    let parts: Vec<&str> = pattern.split('%').collect();
    if parts.len() == 1 {
        return text == pattern;
    }
    let mut rest = text;
    let last = parts.len() - 1;
    for (i, part) in parts.iter().enumerate() {
        if part.is_empty() {
            continue;
        }
        if i == 0 {
            match rest.strip_prefix(part) {
                Some(r) => rest = r,
                None => return false,
            }
        } else if i == last {
            return rest.ends_with(part);
        } else {
            match rest.find(part) {
                Some(pos) => rest = &rest[pos + part.len()..],
                None => return false,
            }
        }
    }
    true
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[derive(Debug, Clone, PartialEq, Serialize)]
    struct Row {
        id: String,
        state: i32,
        nested: Nested,
    }

    #[derive(Debug, Clone, PartialEq, Serialize)]
    struct Nested {
        asset: String,
    }

    fn rows(n: usize) -> Vec<Row> {
        (0..n)
            .map(|i| Row {
                id: format!("id-{i:02}"),
                state: (i % 3) as i32,
                nested: Nested {
                    asset: format!("asset-{}", i % 2),
                },
            })
            .collect()
    }

    // ── Paging ──────────────────────────────────────────────────────

    #[test]
    fn offset_and_limit_page_the_result() {
        let spec = QuerySpec::default().with_offset(3).with_limit(4);
        let out = QueryResolver::resolve(&spec, rows(10)).unwrap();
        assert_eq!(out.len(), 4);
        assert_eq!(out[0].id, "id-03");
    }

    #[test]
    fn limit_beyond_remaining_returns_rest() {
        let spec = QuerySpec::default().with_offset(5).with_limit(100);
        let out = QueryResolver::resolve(&spec, rows(10)).unwrap();
        assert_eq!(out.len(), 5);
    }

    #[test]
    fn zero_limit_is_rejected() {
        let spec = QuerySpec::default().with_limit(0);
        assert_eq!(
            QueryResolver::resolve(&spec, rows(1)).unwrap_err(),
            QueryError::InvalidLimit
        );
    }

    // ── Filtering ───────────────────────────────────────────────────

    #[test]
    fn filter_by_id() {
        let spec = QuerySpec::max().with_criterion(Criterion::eq("id", "id-07"));
        let out = QueryResolver::resolve(&spec, rows(10)).unwrap();
        assert_eq!(out.len(), 1);
        assert_eq!(out[0].id, "id-07");
    }

    #[test]
    fn filter_by_nested_path_and_number() {
        let spec = QuerySpec::max()
            .with_criterion(Criterion::eq("nested.asset", "asset-1"))
            .with_criterion(Criterion::new("state", "=", "0").unwrap());
        let out = QueryResolver::resolve(&spec, rows(10)).unwrap();
        assert!(out.iter().all(|r| r.nested.asset == "asset-1" && r.state == 0));
        assert_eq!(out.len(), 2);
    }

    #[test]
    fn in_and_like_operators() {
        let spec = QuerySpec::max().with_criterion(
            Criterion::new("id", "in", json!(["id-01", "id-02", "nope"])).unwrap(),
        );
        assert_eq!(QueryResolver::resolve(&spec, rows(10)).unwrap().len(), 2);

        let spec = QuerySpec::max().with_criterion(Criterion::new("id", "like", "id-0%").unwrap());
        assert_eq!(QueryResolver::resolve(&spec, rows(12)).unwrap().len(), 10);
    }

    #[test]
    fn unknown_filter_field_matches_nothing() {
        let spec = QuerySpec::max().with_criterion(Criterion::eq("missing", "x"));
        assert!(QueryResolver::resolve(&spec, rows(5)).unwrap().is_empty());
    }

    #[test]
    fn in_requires_array_operand() {
        assert!(matches!(
            Criterion::new("id", "in", "x"),
            Err(QueryError::InvalidOperand { .. })
        ));
        assert_eq!(
            Criterion::new("id", "~", "x").unwrap_err(),
            QueryError::UnsupportedOperator("~".into())
        );
    }

    // ── Sorting ─────────────────────────────────────────────────────

    #[test]
    fn sort_ascending_and_descending() {
        let asc = QuerySpec::max().with_sort("id", SortOrder::Asc);
        let out = QueryResolver::resolve(&asc, rows(5).into_iter().rev()).unwrap();
        assert_eq!(out.first().map(|r| r.id.as_str()), Some("id-00"));

        let desc = QuerySpec::max().with_sort("id", SortOrder::Desc);
        let out = QueryResolver::resolve(&desc, rows(5)).unwrap();
        assert_eq!(out.first().map(|r| r.id.as_str()), Some("id-04"));
    }

    #[test]
    fn sort_by_unknown_field_is_empty() {
        let spec = QuerySpec::max().with_sort("notAField", SortOrder::Asc);
        assert!(QueryResolver::resolve(&spec, rows(5)).unwrap().is_empty());
    }

    #[test]
    fn like_pattern_matching() {
        assert!(like("transfer-42", "transfer-%"));
        assert!(like("transfer-42", "%42"));
        assert!(like("transfer-42", "%fer%"));
        assert!(like("abc", "abc"));
        assert!(!like("abc", "abd"));
        assert!(!like("abc", "b%"));
    }
}
