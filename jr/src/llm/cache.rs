//! In-memory LLM response cache shared across workers

use std::collections::HashMap;
use std::sync::Mutex;

use super::ModelResponse;

/// Response cache keyed by the deterministic prompt cache key.
///
/// Shared by all workers of a pool; a hit skips the provider call and the
/// stored response is returned with `cache_used` set.
#[derive(Default)]
pub struct ResponseCache {
    entries: Mutex<HashMap<String, ModelResponse>>,
}

impl ResponseCache {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, cache_key: &str) -> Option<ModelResponse> {
        let entries = match self.entries.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        entries.get(cache_key).map(|response| {
            let mut hit = response.clone();
            hit.cache_used = true;
            hit.cache_key = Some(cache_key.to_string());
            hit
        })
    }

    pub fn put(&self, cache_key: &str, response: &ModelResponse) {
        let mut entries = match self.entries.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        entries.insert(cache_key.to_string(), response.clone());
    }

    pub fn len(&self) -> usize {
        match self.entries.lock() {
            Ok(guard) => guard.len(),
            Err(poisoned) => poisoned.into_inner().len(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
