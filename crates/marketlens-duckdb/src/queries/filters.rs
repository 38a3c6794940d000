use std::collections::HashMap;

use anyhow::{anyhow, Result};

use marketlens_core::query::{
    DateTimeFilterValue, PropertyDataType, PropertyEntity, PropertyOperator, QueryProperty,
};

use crate::fragment::SqlFragment;

/// Which columns property extraction reads from. The optimized read path
/// swaps these for the denormalized projection tables.
#[derive(Debug, Clone, Copy)]
pub struct PropertySource {
    pub event_properties: &'static str,
    pub user_properties: &'static str,
}

impl Default for PropertySource {
    fn default() -> Self {
        Self {
            event_properties: "events.properties",
            user_properties: "events.user_properties",
        }
    }
}

impl PropertySource {
    pub fn optimized() -> Self {
        Self {
            event_properties: "ep.properties",
            user_properties: "up.properties",
        }
    }

    fn column(&self, entity: PropertyEntity) -> &'static str {
        match entity {
            PropertyEntity::Event => self.event_properties,
            PropertyEntity::User | PropertyEntity::UserGlobal => self.user_properties,
        }
    }
}

/// JSON types accepted by the numeric comparison guard.
const NUMERIC_JSON_TYPES: &str = "('BIGINT', 'UBIGINT', 'DOUBLE')";

fn push_extract(frag: &mut SqlFragment, column: &str, property: &str) {
    frag.push("json_extract_string(");
    frag.push(column);
    frag.push(", ");
    frag.push_bind(format!("$.{property}"));
    frag.push(")");
}

/// Compile a predicate list into one parameterized boolean expression.
///
/// Predicates sharing an `(entity, property)` key form one parenthesized
/// group joined by their own logical operators; groups join with AND in
/// first-seen key order, so the shape of the output is stable under
/// reordering of predicates across keys.
pub fn compile_property_filters(
    properties: &[QueryProperty],
    source: &PropertySource,
) -> Result<SqlFragment> {
    let mut key_order: Vec<(PropertyEntity, String)> = Vec::new();
    let mut groups: HashMap<(PropertyEntity, String), Vec<&QueryProperty>> = HashMap::new();
    for p in properties {
        let key = (p.entity, p.property.clone());
        if !groups.contains_key(&key) {
            key_order.push(key.clone());
        }
        groups.entry(key).or_default().push(p);
    }

    let mut out = SqlFragment::new();
    for (i, key) in key_order.iter().enumerate() {
        let group = &groups[key];
        // The none-safe OR-rewrite for not-equals is only sound when this
        // key has a single predicate and no explicit $none filter;
        // otherwise the extra OR branches double-count rows.
        let allow_none_safe = group.len() == 1 && !group.iter().any(|p| p.is_none_value());

        if i > 0 {
            out.push(" AND ");
        }
        out.push("(");
        for (j, p) in group.iter().enumerate() {
            if j > 0 {
                out.push(" ");
                out.push(p.logical_op.as_sql());
                out.push(" ");
            }
            out.append(compile_predicate(p, source, allow_none_safe)?);
        }
        out.push(")");
    }
    Ok(out)
}

fn compile_predicate(
    p: &QueryProperty,
    source: &PropertySource,
    allow_none_safe: bool,
) -> Result<SqlFragment> {
    let column = source.column(p.entity);
    match p.data_type {
        PropertyDataType::Datetime => compile_datetime_predicate(p, column),
        _ if p.is_none_value() => compile_none_predicate(p, column),
        PropertyDataType::Numerical => compile_numeric_predicate(p, column),
        PropertyDataType::Categorical => compile_categorical_predicate(p, column, allow_none_safe),
    }
}

fn compile_datetime_predicate(p: &QueryProperty, column: &str) -> Result<SqlFragment> {
    let range = DateTimeFilterValue::decode(&p.value)?;
    let mut frag = SqlFragment::new();
    frag.push("CAST(");
    push_extract(&mut frag, column, &p.property);
    frag.push(" AS BIGINT)");
    match p.operator {
        PropertyOperator::Before => {
            frag.push(" < ");
            frag.push_bind(range.to);
        }
        PropertyOperator::NotInCurrent => {
            frag.push(" < ");
            frag.push_bind(range.from);
        }
        PropertyOperator::Since | PropertyOperator::InCurrent => {
            frag.push(" >= ");
            frag.push_bind(range.from);
        }
        PropertyOperator::Equals
        | PropertyOperator::Between
        | PropertyOperator::InPrevious
        | PropertyOperator::InLast => {
            frag.push(" BETWEEN ");
            frag.push_bind(range.from);
            frag.push(" AND ");
            frag.push_bind(range.to);
        }
        PropertyOperator::NotEqual | PropertyOperator::NotInBetween => {
            frag.push(" NOT BETWEEN ");
            frag.push_bind(range.from);
            frag.push(" AND ");
            frag.push_bind(range.to);
        }
        other => {
            return Err(anyhow!("unsupported operator {other:?} for datetime filter"));
        }
    }
    Ok(frag)
}

/// `$none` means missing-or-empty; it never compiles to a literal string
/// comparison.
fn compile_none_predicate(p: &QueryProperty, column: &str) -> Result<SqlFragment> {
    let mut frag = SqlFragment::new();
    match p.operator {
        PropertyOperator::Equals => {
            frag.push("(");
            push_extract(&mut frag, column, &p.property);
            frag.push(" IS NULL OR ");
            push_extract(&mut frag, column, &p.property);
            frag.push(" = '')");
        }
        PropertyOperator::NotEqual => {
            frag.push("(");
            push_extract(&mut frag, column, &p.property);
            frag.push(" IS NOT NULL AND ");
            push_extract(&mut frag, column, &p.property);
            frag.push(" != '')");
        }
        other => {
            return Err(anyhow!("unsupported operator {other:?} for none value"));
        }
    }
    Ok(frag)
}

/// Typed numeric branch: evaluates false when the stored value is not
/// numeric instead of erroring mid-scan.
fn compile_numeric_predicate(p: &QueryProperty, column: &str) -> Result<SqlFragment> {
    let op = p
        .operator
        .comparison_sql()
        .ok_or_else(|| anyhow!("unsupported operator {:?} for numeric filter", p.operator))?;
    let value: f64 = p
        .value
        .parse()
        .map_err(|_| anyhow!("invalid numeric filter value: {}", p.value))?;

    let mut frag = SqlFragment::new();
    frag.push("(json_type(");
    frag.push(column);
    frag.push(", ");
    frag.push_bind(format!("$.{}", p.property));
    frag.push(&format!(") IN {NUMERIC_JSON_TYPES} AND CAST("));
    push_extract(&mut frag, column, &p.property);
    frag.push(&format!(" AS DOUBLE) {op} "));
    frag.push_bind(value);
    frag.push(")");
    Ok(frag)
}

fn compile_categorical_predicate(
    p: &QueryProperty,
    column: &str,
    allow_none_safe: bool,
) -> Result<SqlFragment> {
    let mut frag = SqlFragment::new();
    let none_safe = allow_none_safe
        && matches!(
            p.operator,
            PropertyOperator::NotEqual | PropertyOperator::NotContains
        );
    if none_safe {
        frag.push("(");
    }
    match p.operator {
        PropertyOperator::Contains => {
            frag.push("regexp_matches(");
            push_extract(&mut frag, column, &p.property);
            frag.push(", ");
            frag.push_bind(p.value.clone());
            frag.push(")");
        }
        PropertyOperator::NotContains => {
            frag.push("NOT regexp_matches(");
            push_extract(&mut frag, column, &p.property);
            frag.push(", ");
            frag.push_bind(p.value.clone());
            frag.push(")");
        }
        op => {
            let symbol = op.comparison_sql().ok_or_else(|| {
                anyhow!("unsupported operator {op:?} for categorical filter")
            })?;
            push_extract(&mut frag, column, &p.property);
            frag.push(&format!(" {symbol} "));
            frag.push_bind(p.value.clone());
        }
    }
    if none_safe {
        // "not equal to X" must also match rows with no recorded value.
        frag.push(" OR ");
        push_extract(&mut frag, column, &p.property);
        frag.push(" = '' OR ");
        push_extract(&mut frag, column, &p.property);
        frag.push(" IS NULL)");
    }
    Ok(frag)
}
