//! Client-side registry for direct-answer tasks
//!
//! Tasks whose execution type is not LLM are answered by callables that
//! cannot be serialized, so the registry lives on the submitting process
//! and maps task ids to the objects needed to produce an answer locally.
//!
//! Status flow for direct tasks: PENDING -> READY -> COMPLETED, bypassing
//! rendering and queuing entirely.

use std::collections::HashMap;
use std::sync::Mutex;

use eyre::eyre;
use serde_json::Value;

use crate::domain::ExecutionType;
use crate::service::DirectTaskEntry;

/// Outcome of a direct execution.
#[derive(Debug, Clone)]
pub struct DirectAnswerOutcome {
    pub answer: Value,
    pub comment: String,
}

/// Maps task ids to their direct-answer callables.
#[derive(Default)]
pub struct DirectAnswerRegistry {
    entries: Mutex<HashMap<String, DirectTaskEntry>>,
}

impl DirectAnswerRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&self, entry: DirectTaskEntry) {
        lock(&self.entries).insert(entry.task_id.clone(), entry);
    }

    pub fn has_entry(&self, task_id: &str) -> bool {
        lock(&self.entries).contains_key(task_id)
    }

    pub fn remove(&self, task_id: &str) {
        lock(&self.entries).remove(task_id);
    }

    pub fn len(&self) -> usize {
        lock(&self.entries).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Execute a direct-answer task.
    pub fn execute(&self, task_id: &str) -> eyre::Result<DirectAnswerOutcome> {
        let entry = lock(&self.entries)
            .get(task_id)
            .cloned()
            .ok_or_else(|| eyre!("No direct answer entry for task {task_id}"))?;

        match entry.execution_type {
            ExecutionType::Functional => {
                let func = entry
                    .question
                    .func
                    .as_ref()
                    .ok_or_else(|| eyre!("Functional question without a function"))?;
                let answer = func(&entry.scenario, Some(&entry.agent.traits))?;
                Ok(DirectAnswerOutcome {
                    answer,
                    comment: "Functional question result".to_string(),
                })
            }
            ExecutionType::AgentDirect => {
                let answerer = entry
                    .agent
                    .direct_answerer
                    .as_ref()
                    .ok_or_else(|| eyre!("Agent without a direct answerer"))?;
                let answer = answerer(&entry.question, &entry.scenario)?;
                Ok(DirectAnswerOutcome {
                    answer,
                    comment: "Direct answer from agent method".to_string(),
                })
            }
            ExecutionType::Llm => Err(eyre!("LLM task {task_id} in direct registry")),
        }
    }
}

fn lock<T>(mutex: &Mutex<T>) -> std::sync::MutexGuard<'_, T> {
    match mutex.lock() {
        Ok(guard) => guard,
        Err(poisoned) => poisoned.into_inner(),
    }
}
