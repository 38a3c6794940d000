use anyhow::{anyhow, Result};
use serde::{Deserialize, Serialize};

/// Sentinel meaning "property missing or empty". Never compiled as a
/// literal string comparison.
pub const PROPERTY_VALUE_NONE: &str = "$none";

/// Alias prefix for group-by select expressions. The suffix is the
/// group-by's assigned `index`, not its position in the list.
pub const GROUP_KEY_PREFIX: &str = "_group_key_";

/// Separator used in numeric bucket range labels ("2 - 6").
pub const BUCKET_RANGE_SEPARATOR: &str = " - ";

/// Which table/column family a property predicate reads from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PropertyEntity {
    Event,
    User,
    /// Cross-event user property, appended after the per-event filters.
    UserGlobal,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PropertyDataType {
    Categorical,
    Numerical,
    Datetime,
}

/// Logical connective between predicates sharing a `(entity, property)` key.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum LogicalOp {
    #[serde(rename = "AND")]
    And,
    #[serde(rename = "OR")]
    Or,
}

impl LogicalOp {
    pub fn as_sql(&self) -> &'static str {
        match self {
            LogicalOp::And => "AND",
            LogicalOp::Or => "OR",
        }
    }

    pub fn from_str(raw: &str) -> Result<Self> {
        match raw {
            "AND" => Ok(LogicalOp::And),
            "OR" => Ok(LogicalOp::Or),
            other => Err(anyhow!("invalid logical op: {other}")),
        }
    }
}

/// The closed operator set accepted on query properties. Comparison
/// operators apply to categorical/numerical properties; the range family
/// (between, inPrevious, before, ...) applies to datetime properties.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum PropertyOperator {
    Equals,
    NotEqual,
    GreaterThan,
    LesserThan,
    GreaterThanOrEqual,
    LesserThanOrEqual,
    Contains,
    NotContains,
    Between,
    NotInBetween,
    InPrevious,
    InCurrent,
    NotInCurrent,
    InLast,
    Before,
    Since,
}

impl PropertyOperator {
    /// Immutable operator table for value comparisons. Contains and the
    /// range-family operators compile to function calls rather than a
    /// single infix symbol and return None here.
    pub fn comparison_sql(&self) -> Option<&'static str> {
        match self {
            PropertyOperator::Equals => Some("="),
            PropertyOperator::NotEqual => Some("!="),
            PropertyOperator::GreaterThan => Some(">"),
            PropertyOperator::LesserThan => Some("<"),
            PropertyOperator::GreaterThanOrEqual => Some(">="),
            PropertyOperator::LesserThanOrEqual => Some("<="),
            _ => None,
        }
    }

    pub fn is_negation(&self) -> bool {
        matches!(
            self,
            PropertyOperator::NotEqual
                | PropertyOperator::NotContains
                | PropertyOperator::NotInBetween
                | PropertyOperator::NotInCurrent
        )
    }
}

/// One property predicate of an analytics or attribution query.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QueryProperty {
    pub entity: PropertyEntity,
    #[serde(rename = "type")]
    pub data_type: PropertyDataType,
    pub property: String,
    pub operator: PropertyOperator,
    pub value: String,
    pub logical_op: LogicalOp,
}

impl QueryProperty {
    pub fn is_none_value(&self) -> bool {
        self.value == PROPERTY_VALUE_NONE
    }
}

/// Whether a numerical group-by buckets values or passes them through.
/// The wire format allows an empty string, which means bucketing.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum GroupByType {
    #[serde(rename = "raw_values")]
    RawValues,
    #[default]
    #[serde(rename = "with_buckets", alias = "")]
    WithBuckets,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum DateTimeGranularity {
    #[serde(rename = "hour")]
    Hour,
    #[default]
    #[serde(rename = "date")]
    Day,
    #[serde(rename = "week")]
    Week,
    #[serde(rename = "month")]
    Month,
    #[serde(rename = "quarter")]
    Quarter,
}

impl DateTimeGranularity {
    pub fn date_part(&self) -> &'static str {
        match self {
            DateTimeGranularity::Hour => "hour",
            DateTimeGranularity::Day => "day",
            DateTimeGranularity::Week => "week",
            DateTimeGranularity::Month => "month",
            DateTimeGranularity::Quarter => "quarter",
        }
    }
}

/// A group-by specification. `index` is assigned once when the query is
/// built and stays stable through result translation; `event_name_index`
/// is 0 unless the group-by is scoped to one step of an event sequence.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QueryGroupByProperty {
    pub entity: PropertyEntity,
    pub property: String,
    #[serde(rename = "type")]
    pub data_type: PropertyDataType,
    pub index: usize,
    #[serde(default)]
    pub granularity: DateTimeGranularity,
    #[serde(default)]
    pub group_by_type: GroupByType,
    #[serde(default)]
    pub event_name: String,
    #[serde(default)]
    pub event_name_index: usize,
}

impl QueryGroupByProperty {
    pub fn alias(&self) -> String {
        format!("{GROUP_KEY_PREFIX}{}", self.index)
    }

    pub fn is_event_scoped(&self) -> bool {
        self.event_name_index > 0
    }
}

/// Decoded payload of a datetime predicate's `value` field.
/// The range is interpreted as `[from, to)` by the `before` family and as
/// an inclusive `BETWEEN from AND to` by the equals/between family.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct DateTimeFilterValue {
    pub from: i64,
    pub to: i64,
}

impl DateTimeFilterValue {
    pub fn decode(raw: &str) -> Result<Self> {
        let value: DateTimeFilterValue = serde_json::from_str(raw)
            .map_err(|e| anyhow!("failed to decode datetime filter value: {e}"))?;
        Ok(value)
    }
}

/// An event reference with its own predicate list, used for conversion
/// goals and linked funnel events.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QueryEventWithProperties {
    pub name: String,
    #[serde(default)]
    pub properties: Vec<QueryProperty>,
}
