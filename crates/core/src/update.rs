//! Partial-update builder shared by patient, intake-history and appointment edits.
//!
//! Each entity exposes a typed patch struct whose fields are all optional. The patch feeds
//! an [`UpdateSet`], which records only the fields that are present and validates their
//! length caps. [`UpdateSet::build`] is the only way to obtain a [`PendingUpdate`] and it
//! refuses an empty set, so an `UPDATE` with no columns can never be issued.
//!
//! Column names always come from `&'static str` literals in the patch implementations;
//! values are always bound as parameters.

use crate::validation::{check_len, Flag};
use crate::{EmrError, EmrResult};
use chrono::{NaiveDate, Utc};
use sqlx::{QueryBuilder, Sqlite};

#[derive(Debug, Clone, PartialEq)]
pub enum Value {
    Text(Option<String>),
    Integer(Option<i64>),
    Real(Option<f64>),
    Date(Option<NaiveDate>),
}

/// Binds `value` as the next parameter of `qb`.
pub(crate) fn push_value(qb: &mut QueryBuilder<'_, Sqlite>, value: Value) {
    match value {
        Value::Text(v) => qb.push_bind(v),
        Value::Integer(v) => qb.push_bind(v),
        Value::Real(v) => qb.push_bind(v),
        Value::Date(v) => qb.push_bind(v),
    };
}

/// An accumulating set of column changes for one row of one table.
#[derive(Debug)]
pub struct UpdateSet {
    table: &'static str,
    changes: Vec<(&'static str, Value)>,
    errors: Vec<String>,
}

impl UpdateSet {
    pub fn new(table: &'static str) -> Self {
        Self {
            table,
            changes: Vec::new(),
            errors: Vec::new(),
        }
    }

    /// Nullable text column. `Some(None)` or a blank string clears the column.
    pub fn text(
        &mut self,
        column: &'static str,
        field: &str,
        value: Option<Option<String>>,
        max_len: usize,
    ) -> &mut Self {
        let Some(value) = value else {
            return self;
        };
        let cleaned = value
            .map(|v| v.trim().to_string())
            .filter(|v| !v.is_empty());
        if let Some(v) = &cleaned {
            check_len(&mut self.errors, field, v, max_len);
        }
        self.changes.push((column, Value::Text(cleaned)));
        self
    }

    /// Non-nullable text column: when present it must not be blank.
    pub fn required_text(
        &mut self,
        column: &'static str,
        field: &str,
        value: Option<String>,
        max_len: usize,
    ) -> &mut Self {
        let Some(value) = value else {
            return self;
        };
        let trimmed = value.trim().to_string();
        if trimmed.is_empty() {
            self.errors.push(format!("{field} cannot be empty"));
            return self;
        }
        check_len(&mut self.errors, field, &trimmed, max_len);
        self.changes.push((column, Value::Text(Some(trimmed))));
        self
    }

    /// Checklist flag stored as 0/1.
    pub fn flag(&mut self, column: &'static str, value: Option<Flag>) -> &mut Self {
        if let Some(flag) = value {
            self.changes
                .push((column, Value::Integer(Some(flag.as_int()))));
        }
        self
    }

    /// Pre-validated value for the given column.
    pub fn set(&mut self, column: &'static str, value: Value) -> &mut Self {
        self.changes.push((column, value));
        self
    }

    /// Records a validation message discovered by the caller.
    pub fn reject(&mut self, message: impl Into<String>) -> &mut Self {
        self.errors.push(message.into());
        self
    }

    pub fn touches(&self, column: &str) -> bool {
        self.changes.iter().any(|(c, _)| *c == column)
    }

    pub fn value(&self, column: &str) -> Option<&Value> {
        self.changes
            .iter()
            .find(|(c, _)| *c == column)
            .map(|(_, v)| v)
    }

    /// Finishes the set.
    ///
    /// # Errors
    ///
    /// - [`EmrError::Validation`] with every collected message, if any field was invalid.
    /// - [`EmrError::NoFieldsToUpdate`] if no recognised field was present.
    pub fn build(self) -> EmrResult<PendingUpdate> {
        if !self.errors.is_empty() {
            return Err(EmrError::Validation(self.errors));
        }
        if self.changes.is_empty() {
            return Err(EmrError::NoFieldsToUpdate);
        }
        Ok(PendingUpdate {
            table: self.table,
            changes: self.changes,
        })
    }
}

/// A validated, non-empty update ready to run.
#[derive(Debug)]
pub struct PendingUpdate {
    table: &'static str,
    changes: Vec<(&'static str, Value)>,
}

impl PendingUpdate {
    pub fn columns(&self) -> Vec<&'static str> {
        self.changes.iter().map(|(c, _)| *c).collect()
    }

    /// Runs the update against the row whose `key_column` equals `key`, also bumping
    /// `updated_at`. Returns the number of affected rows.
    pub async fn execute<'c, E>(self, executor: E, key_column: &'static str, key: i64) -> EmrResult<u64>
    where
        E: sqlx::Executor<'c, Database = Sqlite>,
    {
        let mut qb: QueryBuilder<'_, Sqlite> = QueryBuilder::new("UPDATE ");
        qb.push(self.table);
        qb.push(" SET ");

        for (column, value) in self.changes {
            qb.push(column);
            qb.push(" = ");
            push_value(&mut qb, value);
            qb.push(", ");
        }
        qb.push("updated_at = ");
        qb.push_bind(Utc::now());

        qb.push(" WHERE ");
        qb.push(key_column);
        qb.push(" = ");
        qb.push_bind(key);

        let result = qb.build().execute(executor).await?;
        Ok(result.rows_affected())
    }
}
