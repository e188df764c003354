//! Answer store: dual-written, idempotent by key
//!
//! Answers go to the persistent surface for durability and the volatile
//! surface for fast reads during rendering. Reads prefer volatile and fall
//! back to persistent for anything missing.

use std::collections::HashMap;
use std::sync::Arc;

use kvstore::{Storage, StoreResult};

use crate::domain::Answer;

/// Reads and writes answers keyed by (job, interview, question_name).
pub struct AnswerStore {
    storage: Arc<dyn Storage>,
}

impl AnswerStore {
    pub fn new(storage: Arc<dyn Storage>) -> Self {
        Self { storage }
    }

    /// Write to both surfaces. Rewrites under the same key are idempotent,
    /// which is what makes at-least-once task delivery safe.
    pub fn store(&self, answer: &Answer) -> StoreResult<()> {
        let key = answer.storage_key();
        let data = serde_json::to_value(answer)?;
        self.storage.write_persistent(&key, data.clone())?;
        self.storage.write_volatile(&key, data)?;
        Ok(())
    }

    pub fn get(
        &self,
        job_id: &str,
        interview_id: &str,
        question_name: &str,
    ) -> StoreResult<Option<Answer>> {
        let key = Answer::key(job_id, interview_id, question_name);
        let data = match self.storage.read_volatile(&key)? {
            Some(v) => Some(v),
            None => self.storage.read_persistent(&key)?,
        };
        match data {
            Some(v) => Ok(Some(serde_json::from_value(v)?)),
            None => Ok(None),
        }
    }

    /// Quick existence check, volatile only.
    pub fn exists(&self, job_id: &str, interview_id: &str, question_name: &str) -> StoreResult<bool> {
        let key = Answer::key(job_id, interview_id, question_name);
        Ok(self.storage.read_volatile(&key)?.is_some())
    }

    /// Batch read by known question names; never scans.
    pub fn get_for_interview(
        &self,
        job_id: &str,
        interview_id: &str,
        question_names: &[String],
    ) -> StoreResult<HashMap<String, Answer>> {
        if question_names.is_empty() {
            return Ok(HashMap::new());
        }
        let keys: Vec<String> = question_names
            .iter()
            .map(|qn| Answer::key(job_id, interview_id, qn))
            .collect();

        let mut values = self.storage.batch_read_volatile(&keys)?;

        // Fall back to persistent for whatever volatile is missing
        let missing: Vec<String> = keys
            .iter()
            .filter(|k| !values.contains_key(*k))
            .cloned()
            .collect();
        if !missing.is_empty() {
            values.extend(self.storage.batch_read_persistent(&missing)?);
        }

        let mut result = HashMap::new();
        for (qn, key) in question_names.iter().zip(keys.iter()) {
            if let Some(v) = values.get(key) {
                result.insert(qn.clone(), serde_json::from_value(v.clone())?);
            }
        }
        Ok(result)
    }

    /// Batch read across interviews in one round trip per surface.
    /// Returns interview_id -> question_name -> Answer.
    pub fn get_for_interviews_batch(
        &self,
        job_id: &str,
        interview_ids: &[String],
        question_names: &[String],
    ) -> StoreResult<HashMap<String, HashMap<String, Answer>>> {
        if interview_ids.is_empty() || question_names.is_empty() {
            return Ok(HashMap::new());
        }

        let mut keys = Vec::with_capacity(interview_ids.len() * question_names.len());
        for iid in interview_ids {
            for qn in question_names {
                keys.push(Answer::key(job_id, iid, qn));
            }
        }

        let mut values = self.storage.batch_read_volatile(&keys)?;
        let missing: Vec<String> = keys
            .iter()
            .filter(|k| !values.contains_key(*k))
            .cloned()
            .collect();
        if !missing.is_empty() {
            values.extend(self.storage.batch_read_persistent(&missing)?);
        }

        let mut result: HashMap<String, HashMap<String, Answer>> = HashMap::new();
        let mut key_iter = keys.iter();
        for iid in interview_ids {
            let per_interview = result.entry(iid.clone()).or_default();
            for qn in question_names {
                let key = key_iter.next().unwrap_or_else(|| unreachable!());
                if let Some(v) = values.get(key) {
                    per_interview.insert(qn.clone(), serde_json::from_value(v.clone())?);
                }
            }
        }
        Ok(result)
    }
}
