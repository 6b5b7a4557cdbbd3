//! In-memory stores for tests and single-process deployments.

mod delivery_store;
mod job_store;

pub use delivery_store::MemoryDeliveryStore;
pub use job_store::MemoryJobStore;
