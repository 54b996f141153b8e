use std::cmp::Ordering;

use serde_json::Value;

/// Comparison operator of a [`Criterion`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CriterionOperator {
    Eq,
    Ne,
    Lt,
    Le,
    Gt,
    Ge,
    Like,
    In,
}

impl CriterionOperator {
    pub fn parse(op: &str) -> Option<Self> {
        match op {
            "=" | "==" => Some(Self::Eq),
            "!=" | "<>" => Some(Self::Ne),
            "<" => Some(Self::Lt),
            "<=" => Some(Self::Le),
            ">" => Some(Self::Gt),
            ">=" => Some(Self::Ge),
            "like" | "LIKE" => Some(Self::Like),
            "in" | "IN" => Some(Self::In),
            _ => None,
        }
    }

    pub fn sql(self) -> &'static str {
        match self {
            Self::Eq => "=",
            Self::Ne => "!=",
            Self::Lt => "<",
            Self::Le => "<=",
            Self::Gt => ">",
            Self::Ge => ">=",
            Self::Like => "LIKE",
            Self::In => "IN",
        }
    }
}

/// A single (field, operator, value) filter triple.
///
/// Field paths use `.` to address nested fields of the serialized entity,
/// e.g. `destination.type`. Values are dynamic JSON so callers can filter on
/// strings, numbers, booleans, or (for `in`) lists.
#[derive(Debug, Clone, PartialEq)]
pub struct Criterion {
    pub field: String,
    pub operator: CriterionOperator,
    pub value: Value,
}

impl Criterion {
    pub fn new(field: impl Into<String>, operator: CriterionOperator, value: impl Into<Value>) -> Self {
        Self {
            field: field.into(),
            operator,
            value: value.into(),
        }
    }

    pub fn eq(field: impl Into<String>, value: impl Into<Value>) -> Self {
        Self::new(field, CriterionOperator::Eq, value)
    }

    /// Evaluate this criterion against the serialized form of an entity.
    /// Missing fields never match (mirrors SQL NULL comparison semantics).
    pub fn matches(&self, doc: &Value) -> bool {
        let Some(actual) = lookup(doc, &self.field) else {
            return false;
        };
        match self.operator {
            CriterionOperator::Eq => compare(actual, &self.value) == Some(Ordering::Equal),
            CriterionOperator::Ne => {
                matches!(compare(actual, &self.value), Some(ord) if ord != Ordering::Equal)
            }
            CriterionOperator::Lt => compare(actual, &self.value) == Some(Ordering::Less),
            CriterionOperator::Le => {
                matches!(compare(actual, &self.value), Some(Ordering::Less | Ordering::Equal))
            }
            CriterionOperator::Gt => compare(actual, &self.value) == Some(Ordering::Greater),
            CriterionOperator::Ge => {
                matches!(compare(actual, &self.value), Some(Ordering::Greater | Ordering::Equal))
            }
            CriterionOperator::Like => match (actual.as_str(), self.value.as_str()) {
                (Some(text), Some(pattern)) => like_match(pattern, text),
                _ => false,
            },
            CriterionOperator::In => match &self.value {
                Value::Array(candidates) => candidates
                    .iter()
                    .any(|candidate| compare(actual, candidate) == Some(Ordering::Equal)),
                _ => false,
            },
        }
    }
}

/// Sort direction for [`QuerySpec`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum SortOrder {
    #[default]
    Ascending,
    Descending,
}

/// Filter + sort + pagination specification for plain (non-leasing) reads.
#[derive(Debug, Clone, Default)]
pub struct QuerySpec {
    pub filter: Vec<Criterion>,
    pub limit: Option<u32>,
    pub offset: u32,
    pub sort_field: Option<String>,
    pub sort_order: SortOrder,
}

impl QuerySpec {
    pub fn all() -> Self {
        Self::default()
    }

    pub fn with_filter(mut self, criterion: Criterion) -> Self {
        self.filter.push(criterion);
        self
    }

    pub fn with_limit(mut self, limit: u32) -> Self {
        self.limit = Some(limit);
        self
    }

    pub fn with_offset(mut self, offset: u32) -> Self {
        self.offset = offset;
        self
    }

    pub fn sorted_by(mut self, field: impl Into<String>, order: SortOrder) -> Self {
        self.sort_field = Some(field.into());
        self.sort_order = order;
        self
    }
}

/// Resolve a dotted field path against a JSON document.
pub(crate) fn lookup<'a>(doc: &'a Value, path: &str) -> Option<&'a Value> {
    let mut current = doc;
    for segment in path.split('.') {
        current = current.get(segment)?;
    }
    Some(current)
}

/// Compare two JSON scalars. Numbers compare numerically regardless of
/// integer/float representation; mixed types are incomparable.
pub(crate) fn compare(left: &Value, right: &Value) -> Option<Ordering> {
    match (left, right) {
        (Value::Number(l), Value::Number(r)) => l.as_f64()?.partial_cmp(&r.as_f64()?),
        (Value::String(l), Value::String(r)) => Some(l.cmp(r)),
        (Value::Bool(l), Value::Bool(r)) => Some(l.cmp(r)),
        (Value::Null, Value::Null) => Some(Ordering::Equal),
        _ => None,
    }
}

/// SQL LIKE semantics: `%` matches any sequence, `_` matches one character,
/// ASCII-case-insensitive (matching SQLite's default LIKE behavior).
pub(crate) fn like_match(pattern: &str, text: &str) -> bool {
    let p: Vec<char> = pattern.chars().collect();
    let t: Vec<char> = text.chars().collect();
    let mut dp = vec![vec![false; t.len() + 1]; p.len() + 1];
    dp[0][0] = true;
    for i in 1..=p.len() {
        if p[i - 1] == '%' {
            dp[i][0] = dp[i - 1][0];
        }
    }
    for i in 1..=p.len() {
        for j in 1..=t.len() {
            dp[i][j] = match p[i - 1] {
                '%' => dp[i - 1][j] || dp[i][j - 1],
                '_' => dp[i - 1][j - 1],
                c => dp[i - 1][j - 1] && c.eq_ignore_ascii_case(&t[j - 1]),
            };
        }
    }
    dp[p.len()][t.len()]
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_operator_parse() {
        assert_eq!(CriterionOperator::parse("="), Some(CriterionOperator::Eq));
        assert_eq!(CriterionOperator::parse("!="), Some(CriterionOperator::Ne));
        assert_eq!(CriterionOperator::parse("<>"), Some(CriterionOperator::Ne));
        assert_eq!(CriterionOperator::parse("like"), Some(CriterionOperator::Like));
        assert_eq!(CriterionOperator::parse("IN"), Some(CriterionOperator::In));
        assert_eq!(CriterionOperator::parse("~"), None);
    }

    #[test]
    fn test_eq_matches_numbers_across_representations() {
        let doc = json!({"state": 100});
        assert!(Criterion::eq("state", 100).matches(&doc));
        assert!(Criterion::eq("state", 100.0).matches(&doc));
        assert!(!Criterion::eq("state", 200).matches(&doc));
    }

    #[test]
    fn test_nested_field_path() {
        let doc = json!({"destination": {"type": "blob", "properties": {"container": "out"}}});
        assert!(Criterion::eq("destination.type", "blob").matches(&doc));
        assert!(Criterion::eq("destination.properties.container", "out").matches(&doc));
        // Missing fields never match, for any operator
        assert!(!Criterion::eq("destination.missing", "x").matches(&doc));
        assert!(!Criterion::new("destination.missing", CriterionOperator::Ne, "x").matches(&doc));
    }

    #[test]
    fn test_range_operators() {
        let doc = json!({"state_timestamp": 500});
        assert!(Criterion::new("state_timestamp", CriterionOperator::Le, 500).matches(&doc));
        assert!(Criterion::new("state_timestamp", CriterionOperator::Lt, 501).matches(&doc));
        assert!(!Criterion::new("state_timestamp", CriterionOperator::Gt, 500).matches(&doc));
        // Mixed types are incomparable rather than panicking
        assert!(!Criterion::new("state_timestamp", CriterionOperator::Lt, "abc").matches(&doc));
    }

    #[test]
    fn test_in_operator() {
        let doc = json!({"state": 100});
        assert!(Criterion::new("state", CriterionOperator::In, json!([0, 100, 200])).matches(&doc));
        assert!(!Criterion::new("state", CriterionOperator::In, json!([0, 200])).matches(&doc));
        // Non-array value for IN never matches
        assert!(!Criterion::new("state", CriterionOperator::In, 100).matches(&doc));
    }

    #[test]
    fn test_like_wildcards() {
        assert!(like_match("%transfer%", "my-transfer-01"));
        assert!(like_match("flow_", "flow1"));
        assert!(!like_match("flow_", "flow12"));
        assert!(like_match("FLOW%", "flow12"));
        assert!(like_match("%", ""));
        assert!(!like_match("a%", "ba"));
    }
}
