use duckdb::types::{ToSql, ToSqlOutput};

/// A bound parameter value. Only the types the compilers actually emit.
#[derive(Debug, Clone, PartialEq)]
pub enum SqlValue {
    Text(String),
    Int(i64),
    Float(f64),
}

impl ToSql for SqlValue {
    fn to_sql(&self) -> duckdb::Result<ToSqlOutput<'_>> {
        match self {
            SqlValue::Text(s) => s.to_sql(),
            SqlValue::Int(i) => i.to_sql(),
            SqlValue::Float(f) => f.to_sql(),
        }
    }
}

impl From<&str> for SqlValue {
    fn from(v: &str) -> Self {
        SqlValue::Text(v.to_string())
    }
}

impl From<String> for SqlValue {
    fn from(v: String) -> Self {
        SqlValue::Text(v)
    }
}

impl From<i64> for SqlValue {
    fn from(v: i64) -> Self {
        SqlValue::Int(v)
    }
}

impl From<f64> for SqlValue {
    fn from(v: f64) -> Self {
        SqlValue::Float(v)
    }
}

/// SQL text paired with its bound parameters. Fragments compose by
/// concatenation, so text and parameter order cannot drift apart the way
/// they can with a string plus a parallel params slice. Placeholders are
/// positional `?`.
#[derive(Debug, Clone, Default)]
pub struct SqlFragment {
    pub sql: String,
    pub params: Vec<SqlValue>,
}

impl SqlFragment {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn from_sql(sql: &str) -> Self {
        Self {
            sql: sql.to_string(),
            params: Vec::new(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.sql.is_empty()
    }

    /// Append literal SQL text. Only for internal, non-user-controlled
    /// identifiers; values go through [`SqlFragment::push_bind`].
    pub fn push(&mut self, sql: &str) {
        self.sql.push_str(sql);
    }

    /// Append a `?` placeholder and its value in one step.
    pub fn push_bind(&mut self, value: impl Into<SqlValue>) {
        self.sql.push('?');
        self.params.push(value.into());
    }

    /// Append a parenthesized `(?, ?, ...)` list.
    pub fn push_bind_list<I, V>(&mut self, values: I)
    where
        I: IntoIterator<Item = V>,
        V: Into<SqlValue>,
    {
        self.sql.push('(');
        let mut first = true;
        for value in values {
            if !first {
                self.sql.push_str(", ");
            }
            first = false;
            self.push_bind(value);
        }
        self.sql.push(')');
    }

    /// Concatenate another fragment, text and parameters together.
    pub fn append(&mut self, other: SqlFragment) {
        self.sql.push_str(&other.sql);
        self.params.extend(other.params);
    }

    /// Parameter references in placeholder order, for statement execution.
    pub fn param_refs(&self) -> Vec<&dyn ToSql> {
        self.params.iter().map(|p| p as &dyn ToSql).collect()
    }
}
