//! Binding rows to the parameterized statement executed by the writer. The SQL text itself comes
//! from outside (dialects are not this crate's concern).

use bytes::Bytes;

/// A single bound parameter.
#[derive(Debug, Clone, PartialEq)]
pub enum Value {
    Null,
    Bool(bool),
    Int(i64),
    Float(f64),
    Text(String),
    Bytes(Bytes),
}

impl From<i64> for Value {
    fn from(v: i64) -> Self {
        Value::Int(v)
    }
}

impl From<f64> for Value {
    fn from(v: f64) -> Self {
        Value::Float(v)
    }
}

impl From<bool> for Value {
    fn from(v: bool) -> Self {
        Value::Bool(v)
    }
}

impl From<&str> for Value {
    fn from(v: &str) -> Self {
        Value::Text(v.to_string())
    }
}

impl From<String> for Value {
    fn from(v: String) -> Self {
        Value::Text(v)
    }
}

impl From<Bytes> for Value {
    fn from(v: Bytes) -> Self {
        Value::Bytes(v)
    }
}

impl<T: Into<Value>> From<Option<T>> for Value {
    fn from(v: Option<T>) -> Self {
        v.map_or(Value::Null, Into::into)
    }
}

/// The statement every row of a sink is written with.
pub trait QueryStatement: Send + Sync + 'static {
    type Row: Send + 'static;

    fn sql(&self) -> &str;

    /// Bind the row's fields, in placeholder order.
    fn bind(&self, row: &Self::Row) -> Vec<Value>;
}

/// A [QueryStatement] made of the SQL text and a binding closure.
pub struct SimpleStatement<R, F> {
    sql: String,
    binder: F,
    _row: std::marker::PhantomData<fn(&R)>,
}

impl<R, F> SimpleStatement<R, F>
where
    F: Fn(&R) -> Vec<Value>,
{
    pub fn new(sql: impl Into<String>, binder: F) -> Self {
        Self {
            sql: sql.into(),
            binder,
            _row: std::marker::PhantomData,
        }
    }
}

impl<R, F> QueryStatement for SimpleStatement<R, F>
where
    R: Send + 'static,
    F: Fn(&R) -> Vec<Value> + Send + Sync + 'static,
{
    type Row = R;

    fn sql(&self) -> &str {
        &self.sql
    }

    fn bind(&self, row: &R) -> Vec<Value> {
        (self.binder)(row)
    }
}
