//! Execution workers and worker liveness
//!
//! [`ExecutionWorker`]s long-poll the coordinator, invoke the model
//! capability, and feed outcomes back to the job service. In distributed
//! mode workers register with the storage-backed [`WorkerRegistry`] and a
//! [`HeartbeatManager`] keeps their liveness fresh; the coordinator
//! recovers tasks from workers whose heartbeats lapse.

mod executor;
mod heartbeat;
mod pool;
mod registry;

pub use executor::{ExecutionResult, ExecutionWorker};
pub use heartbeat::HeartbeatManager;
pub use pool::ExecutionWorkerPool;
pub use registry::{WorkerInfo, WorkerRegistry, WorkerRegistryStats};
