//! Rate-limited dispatch primitives
//!
//! Each (service, model, api key) combination gets a [`Queue`] holding two
//! continuous-refill [`TokenBucket`]s (requests/minute and tokens/minute).
//! The [`DispatchHeap`] orders queues by next-available time so assignment
//! probes the most promising queue first, and the [`QueueRegistry`] routes
//! tasks to the shortest matching queue, creating queues on demand when an
//! API key is known for the service.

mod bucket;
mod heap;
mod queue;
mod registry;

pub use bucket::TokenBucket;
pub use heap::DispatchHeap;
pub use queue::{Queue, QueueMeta, ThroughputStats};
pub use registry::{QueueRegistry, default_rate_limits, load_queues_from_env};
