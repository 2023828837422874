//! Statistics action: temporal aggregates (mean, min, max, accumulation) across
//! successive time steps of the same field-id, emitted on the step marking the end of the
//! configured window.

use super::{Action, ActionError, ActionStats};
use crate::config::StatisticOperation;
use crate::message::{Message, Tag};
use std::collections::HashMap;
use tokio::sync::Mutex;

struct Window {
    sum: Vec<f64>,
    min: Vec<f64>,
    max: Vec<f64>,
    steps_seen: usize,
    template: Message,
}

pub struct StatisticsAction {
    operations: Vec<StatisticOperation>,
    window_size: usize,
    hash_keys: Vec<String>,
    windows: Mutex<HashMap<String, Window>>,
    stats: ActionStats,
    next: Option<Box<dyn Action>>,
}

impl StatisticsAction {
    pub fn new(
        operations: Vec<StatisticOperation>,
        output_frequency: String,
        hash_keys: Vec<String>,
        next: Option<Box<dyn Action>>,
    ) -> Self {
        Self {
            operations,
            window_size: parse_window_size(&output_frequency),
            hash_keys,
            windows: Mutex::new(HashMap::new()),
            stats: ActionStats::default(),
            next,
        }
    }

    async fn accumulate(&self, msg: &Message) -> Result<Option<Vec<Message>>, ActionError> {
        let field_id = msg.field_id(&self.hash_keys)?;
        let values = bytes_to_f64(&msg.payload);

        let mut windows = self.windows.lock().await;
        let window = windows.entry(field_id.clone()).or_insert_with(|| Window {
            sum: vec![0.0; values.len()],
            min: vec![f64::INFINITY; values.len()],
            max: vec![f64::NEG_INFINITY; values.len()],
            steps_seen: 0,
            template: msg.clone(),
        });

        for (i, v) in values.iter().enumerate() {
            window.sum[i] += v;
            window.min[i] = window.min[i].min(*v);
            window.max[i] = window.max[i].max(*v);
        }
        window.steps_seen += 1;

        if window.steps_seen < self.window_size {
            return Ok(None);
        }

        let window = windows.remove(&field_id).expect("just accessed");
        let mut out = Vec::with_capacity(self.operations.len());
        for op in &self.operations {
            let aggregate = match op {
                StatisticOperation::Mean => window
                    .sum
                    .iter()
                    .map(|s| s / window.steps_seen as f64)
                    .collect::<Vec<_>>(),
                StatisticOperation::Min => window.min.clone(),
                StatisticOperation::Max => window.max.clone(),
                StatisticOperation::Accumulate => window.sum.clone(),
            };
            let mut emitted = window.template.clone();
            emitted.payload = f64_to_bytes(&aggregate);
            out.push(emitted);
        }
        Ok(Some(out))
    }
}

#[async_trait::async_trait]
impl Action for StatisticsAction {
    async fn execute_impl(&self, msg: Message) -> Result<(), ActionError> {
        if msg.tag() == Tag::Field {
            if let Some(aggregates) = self.accumulate(&msg).await? {
                for aggregate in aggregates {
                    self.execute_next(aggregate).await?;
                }
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

fn parse_window_size(output_frequency: &str) -> usize {
    output_frequency
        .chars()
        .take_while(|c| c.is_ascii_digit())
        .collect::<String>()
        .parse()
        .unwrap_or(1)
        .max(1)
}

fn bytes_to_f64(bytes: &[u8]) -> Vec<f64> {
    bytes
        .chunks_exact(8)
        .map(|c| f64::from_le_bytes(c.try_into().unwrap()))
        .collect()
}

fn f64_to_bytes(values: &[f64]) -> Vec<u8> {
    let mut out = Vec::with_capacity(values.len() * 8);
    for v in values {
        out.extend_from_slice(&v.to_le_bytes());
    }
    out
}
