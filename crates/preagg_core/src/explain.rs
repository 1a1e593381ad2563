use std::collections::BTreeMap;
use std::fmt;

use serde::{Deserialize, Serialize};

use crate::shared_state::SharedAggregationState;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ExplainConfig {
    pub verbose: bool,
}

/// An entry describing how an execution ran.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExplainEntry {
    pub name: String,
    /// Using a btree to ensure consistent ordering (mostly for test output).
    pub items: BTreeMap<String, ExplainValue>,
}

impl ExplainEntry {
    pub fn new(name: impl Into<String>) -> Self {
        ExplainEntry {
            name: name.into(),
            items: BTreeMap::new(),
        }
    }

    /// Put a value in the explain entry.
    pub fn with_value(mut self, key: impl Into<String>, value: impl fmt::Display) -> Self {
        self.items
            .insert(key.into(), ExplainValue::Value(value.to_string()));
        self
    }

    /// Put a list of values in the explain entry.
    pub fn with_values<S: fmt::Display>(
        mut self,
        key: impl Into<String>,
        values: impl IntoIterator<Item = S>,
    ) -> Self {
        let vals = ExplainValue::Values(values.into_iter().map(|s| s.to_string()).collect());
        self.items.insert(key.into(), vals);
        self
    }
}

impl fmt::Display for ExplainEntry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.name)?;
        if !self.items.is_empty() {
            write!(f, " (")?;
            for (idx, (k, v)) in self.items.iter().enumerate() {
                if idx > 0 {
                    write!(f, ", ")?;
                }
                write!(f, "{k} = {v}")?;
            }
            write!(f, ")")?;
        }
        Ok(())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum ExplainValue {
    Value(String),
    Values(Vec<String>),
}

impl fmt::Display for ExplainValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Value(v) => write!(f, "{v}"),
            Self::Values(v) => write!(f, "[{}]", v.join(", ")),
        }
    }
}

pub trait Explainable {
    fn explain_entry(&self, conf: ExplainConfig) -> ExplainEntry;
}

impl Explainable for SharedAggregationState {
    fn explain_entry(&self, conf: ExplainConfig) -> ExplainEntry {
        let stats = self.statistics();

        let mut ent = ExplainEntry::new("GpuPreAgg")
            .with_value("reduction", stats.tasks.policy(self.predicted_mode()))
            .with_value("tasks", stats.tasks.total())
            .with_value(
                "dma_send",
                format!("{} ({} bytes)", stats.dma_send_count, stats.dma_send_bytes),
            )
            .with_value(
                "dma_recv",
                format!("{} ({} bytes)", stats.dma_recv_count, stats.dma_recv_bytes),
            )
            .with_values(
                "kernels",
                [
                    format!("main: {}", stats.main_kernel_launches),
                    format!("init: {}", stats.init_kernel_launches),
                    format!("fixup: {}", stats.fixup_kernel_launches),
                ],
            )
            .with_value(
                "buffers",
                format!(
                    "created: {}, drained: {}, discarded: {}",
                    stats.buffers_created, stats.buffers_drained, stats.buffers_discarded
                ),
            );

        if stats.fallback_rows > 0 {
            ent = ent.with_value("fallback_rows", stats.fallback_rows);
        }

        if conf.verbose {
            ent = ent
                .with_value("max_nrooms", stats.max_buffer_nrooms)
                .with_value("observed_rows", stats.observed_rows)
                .with_value("observed_groups", stats.observed_groups)
                .with_value("plan_groups", stats.plan_groups)
                .with_values(
                    "retries",
                    [
                        format!("overflow: {}", stats.overflow_retries),
                        format!("regrow: {}", stats.regrow_retries),
                        format!("oom: {}", stats.oom_retries),
                    ],
                );
        }

        ent
    }
}
