//! Typed stores over the storage protocol
//!
//! Each store owns the key encoding and counter maintenance for one entity
//! type. Definitions go to the persistent surface, hot state to the
//! volatile surface, and the ready/counted sets to the set surface. None
//! of the stores hold locks across storage calls; backend atomicity is
//! the synchronization primitive.

mod answers;
mod interviews;
mod jobs;
mod tasks;

pub use answers::AnswerStore;
pub use interviews::InterviewStore;
pub use jobs::JobStore;
pub use tasks::TaskStore;
