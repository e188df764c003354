//! Queue registry: routing and auto-registration

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use tracing::{debug, info};

use super::heap::DispatchHeap;
use super::queue::{Queue, QueueMeta};
use crate::domain::generate_id;
use crate::render::RenderedPrompt;

/// Services with shipped rate-limit defaults. High enough to avoid
/// artificial bottlenecks; real limits come from queue registration.
const KNOWN_SERVICES: &[&str] = &[
    "openai",
    "anthropic",
    "google",
    "groq",
    "mistral",
    "deepseek",
    "xai",
    "together",
    "perplexity",
    "bedrock",
    "azure",
    "test",
];

/// Default (rpm, tpm) for a service.
pub fn default_rate_limits(service: &str) -> (u32, u32) {
    if KNOWN_SERVICES.contains(&service) {
        (10_000, 1_000_000)
    } else {
        (60, 100_000)
    }
}

/// Indexes queues by id and by (service, model); owns the dispatch heap.
pub struct QueueRegistry {
    queues: Mutex<HashMap<String, Arc<Queue>>>,
    by_service_model: Mutex<HashMap<(String, String), Vec<String>>>,
    heap: DispatchHeap,
    auto_register: bool,
    api_keys: Mutex<HashMap<String, String>>,
}

impl Default for QueueRegistry {
    fn default() -> Self {
        Self::new(true)
    }
}

impl QueueRegistry {
    pub fn new(auto_register: bool) -> Self {
        Self {
            queues: Mutex::new(HashMap::new()),
            by_service_model: Mutex::new(HashMap::new()),
            heap: DispatchHeap::new(),
            auto_register,
            api_keys: Mutex::new(HashMap::new()),
        }
    }

    pub fn dispatch_heap(&self) -> &DispatchHeap {
        &self.heap
    }

    /// Store an API key so tasks routed to an unregistered (service, model)
    /// can create their queue on demand.
    pub fn set_service_api_key(&self, service: &str, api_key: &str) {
        debug!(service, "Stored service API key");
        lock(&self.api_keys).insert(service.to_string(), api_key.to_string());
    }

    pub fn get_service_api_key(&self, service: &str) -> Option<String> {
        lock(&self.api_keys).get(service).cloned()
    }

    /// Register a queue, using service defaults for unspecified limits.
    /// Returns the queue id.
    pub fn register_queue(
        &self,
        service: &str,
        model: &str,
        api_key: &str,
        rpm_limit: Option<u32>,
        tpm_limit: Option<u32>,
    ) -> String {
        let (default_rpm, default_tpm) = default_rate_limits(service);
        let rpm = rpm_limit.unwrap_or(default_rpm);
        let tpm = tpm_limit.unwrap_or(default_tpm);

        let queue_id = generate_id();
        let queue = Arc::new(Queue::new(&queue_id, service, model, api_key, rpm, tpm));

        lock(&self.queues).insert(queue_id.clone(), queue);
        lock(&self.by_service_model)
            .entry((service.to_string(), model.to_string()))
            .or_default()
            .push(queue_id.clone());

        info!(queue_id = %queue_id, service, model, rpm, tpm, "Queue registered");
        queue_id
    }

    pub fn get_queue(&self, queue_id: &str) -> Option<Arc<Queue>> {
        lock(&self.queues).get(queue_id).cloned()
    }

    pub fn find_queues(&self, service: &str, model: &str) -> Vec<String> {
        lock(&self.by_service_model)
            .get(&(service.to_string(), model.to_string()))
            .cloned()
            .unwrap_or_default()
    }

    /// Pick the queue with the shortest depth for (service, model),
    /// auto-creating one when possible. `None` means no queue and no API
    /// key for the service.
    pub fn route_task(&self, service: &str, model: &str) -> Option<String> {
        let mut queue_ids = self.find_queues(service, model);

        if queue_ids.is_empty() && self.auto_register {
            if let Some(api_key) = self.get_service_api_key(service) {
                info!(service, model, "Auto-registering queue");
                queue_ids = vec![self.register_queue(service, model, &api_key, None, None)];
            }
        }

        if queue_ids.is_empty() {
            debug!(service, model, "No queue for service/model");
            return None;
        }

        let queues = lock(&self.queues);
        queue_ids
            .into_iter()
            .min_by_key(|qid| queues.get(qid).map(|q| q.depth()).unwrap_or(usize::MAX))
    }

    /// Route and enqueue. Pushes the dispatch heap only when the queue was
    /// empty; a non-empty queue already has a live heap entry.
    pub fn enqueue_task(
        &self,
        task: RenderedPrompt,
        service: &str,
        model: &str,
    ) -> Option<String> {
        let queue_id = self.route_task(service, model)?;
        let queue = self.get_queue(&queue_id)?;

        let estimated_tokens = task.estimated_tokens;
        let was_empty = queue.depth() == 0;
        queue.enqueue(task);

        if was_empty {
            let wait = queue.time_until_available(estimated_tokens);
            self.heap
                .push(&queue_id, Instant::now() + Duration::from_secs_f64(wait));
        }

        Some(queue_id)
    }

    pub fn list_queues(&self) -> Vec<QueueMeta> {
        lock(&self.queues).values().map(|q| q.meta()).collect()
    }

    /// Total queued tasks across all queues.
    pub fn total_depth(&self) -> usize {
        lock(&self.queues).values().map(|q| q.depth()).sum()
    }
}

fn lock<T>(mutex: &Mutex<T>) -> std::sync::MutexGuard<'_, T> {
    match mutex.lock() {
        Ok(guard) => guard,
        Err(poisoned) => poisoned.into_inner(),
    }
}

/// Register queues from API keys found in the environment. Returns
/// service -> queue id for each service with a key.
pub fn load_queues_from_env(registry: &QueueRegistry) -> HashMap<String, String> {
    let key_mappings: &[(&str, &str, &[&str])] = &[
        ("OPENAI_API_KEY", "openai", &["gpt-4o", "gpt-4o-mini"]),
        (
            "ANTHROPIC_API_KEY",
            "anthropic",
            &["claude-3-5-sonnet-20241022", "claude-3-5-haiku-20241022"],
        ),
        ("GOOGLE_API_KEY", "google", &["gemini-1.5-pro", "gemini-1.5-flash"]),
        ("GROQ_API_KEY", "groq", &["llama-3.3-70b-versatile"]),
        ("MISTRAL_API_KEY", "mistral", &["mistral-large-latest"]),
        ("DEEPSEEK_API_KEY", "deepseek", &["deepseek-chat"]),
        ("XAI_API_KEY", "xai", &["grok-2-latest"]),
    ];

    let mut registered = HashMap::new();
    for (env_var, service, models) in key_mappings {
        let Ok(api_key) = std::env::var(env_var) else {
            continue;
        };
        registry.set_service_api_key(service, &api_key);
        for model in *models {
            let queue_id = registry.register_queue(service, model, &api_key, None, None);
            registered
                .entry(service.to_string())
                .or_insert(queue_id);
        }
    }
    registered
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::render::RenderedPrompt;

    fn prompt(task_id: &str) -> RenderedPrompt {
        RenderedPrompt {
            task_id: task_id.to_string(),
            job_id: "j".to_string(),
            interview_id: "i".to_string(),
            system_prompt: String::new(),
            user_prompt: String::new(),
            estimated_tokens: 500,
            cache_key: "ck".to_string(),
            question_name: "q1".to_string(),
            model_id: "m".to_string(),
            model_name: "test-model".to_string(),
            service_name: "test".to_string(),
            iteration: 0,
            files: None,
        }
    }

    #[test]
    fn test_default_limits() {
        assert_eq!(default_rate_limits("anthropic"), (10_000, 1_000_000));
        assert_eq!(default_rate_limits("somebody-else"), (60, 100_000));
    }

    #[test]
    fn test_route_shortest_depth() {
        let registry = QueueRegistry::new(false);
        let q1 = registry.register_queue("test", "m", "k1", None, None);
        let q2 = registry.register_queue("test", "m", "k2", None, None);

        // Load q1 so routing prefers q2
        registry.get_queue(&q1).unwrap().enqueue(prompt("t1"));
        assert_eq!(registry.route_task("test", "m").unwrap(), q2);

        // Even them out; either is acceptable
        registry.get_queue(&q2).unwrap().enqueue(prompt("t2"));
        let routed = registry.route_task("test", "m").unwrap();
        assert!(routed == q1 || routed == q2);
    }

    #[test]
    fn test_auto_register_with_api_key() {
        let registry = QueueRegistry::new(true);
        assert!(registry.route_task("test", "new-model").is_none());

        registry.set_service_api_key("test", "secret");
        let queue_id = registry.route_task("test", "new-model").unwrap();
        let queue = registry.get_queue(&queue_id).unwrap();
        assert_eq!(queue.api_key(), "secret");
    }

    #[test]
    fn test_no_auto_register_without_key() {
        let registry = QueueRegistry::new(true);
        assert!(registry.route_task("unknown", "m").is_none());
        assert!(registry.list_queues().is_empty());
    }

    #[test]
    fn test_enqueue_pushes_heap_only_when_empty() {
        let registry = QueueRegistry::new(false);
        registry.register_queue("test", "m", "k", None, None);

        registry.enqueue_task(prompt("t1"), "test", "m").unwrap();
        assert_eq!(registry.dispatch_heap().len(), 1);

        // Second enqueue on a non-empty queue adds no heap entry
        registry.enqueue_task(prompt("t2"), "test", "m").unwrap();
        assert_eq!(registry.dispatch_heap().len(), 1);
        assert_eq!(registry.total_depth(), 2);
    }

    #[test]
    fn test_enqueue_unroutable() {
        let registry = QueueRegistry::new(false);
        assert!(registry.enqueue_task(prompt("t1"), "ghost", "m").is_none());
    }
}
