use std::fmt::Write as _;

use surge_core::types::Message;

/// A write to the backing store: SQL text plus one positional parameter per message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Statement {
    sql: String,
    params: Vec<Message>,
}

impl Statement {
    /// `INSERT INTO <table> (payload) VALUES ($1)`
    pub fn insert_one(table: &str, message: Message) -> Self {
        Self {
            sql: format!("INSERT INTO {table} (payload) VALUES ($1)"),
            params: vec![message],
        }
    }

    /// One multi-row insert binding every message, in order, to its own placeholder.
    ///
    /// `messages` must be non-empty; the batch accumulator never hands out an empty batch.
    pub fn insert_many(table: &str, messages: Vec<Message>) -> Self {
        debug_assert!(!messages.is_empty());
        let mut sql = String::with_capacity(40 + table.len() + messages.len() * 8);
        sql.push_str("INSERT INTO ");
        sql.push_str(table);
        sql.push_str(" (payload) VALUES ");
        for i in 1..=messages.len() {
            if i > 1 {
                sql.push(',');
            }
            let _ = write!(sql, "(${i})");
        }
        Self {
            sql,
            params: messages,
        }
    }

    pub fn sql(&self) -> &str {
        &self.sql
    }

    pub fn params(&self) -> &[Message] {
        &self.params
    }

    pub fn param_count(&self) -> usize {
        self.params.len()
    }
}
