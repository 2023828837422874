//! Select action: keeps only fields whose metadata matches a predicate, equality or
//! membership on a list of values per key. Control messages pass through untouched.

use super::{Action, ActionError, ActionStats};
use crate::message::{Message, Tag};
use std::collections::HashMap;

pub struct SelectAction {
    predicate: HashMap<String, Vec<String>>,
    stats: ActionStats,
    next: Option<Box<dyn Action>>,
}

impl SelectAction {
    pub fn new(predicate: HashMap<String, Vec<String>>, next: Option<Box<dyn Action>>) -> Self {
        Self {
            predicate,
            stats: ActionStats::default(),
            next,
        }
    }

    fn matches(&self, msg: &Message) -> bool {
        self.predicate.iter().all(|(key, allowed)| {
            msg.metadata()
                .get_raw(key)
                .map(|v| allowed.iter().any(|a| value_matches(v, a)))
                .unwrap_or(false)
        })
    }
}

fn value_matches(value: &crate::metadata::Value, candidate: &str) -> bool {
    use crate::metadata::Value;
    match value {
        Value::String(s) => s == candidate,
        Value::Int(i) => i.to_string() == candidate,
        Value::Double(d) => d.to_string() == candidate,
        Value::Bool(b) => b.to_string() == candidate,
        Value::Nested(_) | Value::List(_) => false,
    }
}

#[async_trait::async_trait]
impl Action for SelectAction {
    async fn execute_impl(&self, msg: Message) -> Result<(), ActionError> {
        if msg.tag() == Tag::Field || msg.tag() == Tag::Grib {
            if self.matches(&msg) {
                self.execute_next(msg).await?;
            }
        } else {
            self.execute_next(msg).await?;
        }
        Ok(())
    }

    fn next(&self) -> Option<&(dyn Action)> {
        self.next.as_deref()
    }

    fn stats(&self) -> &ActionStats {
        &self.stats
    }
}
