//! 分发引擎：模式解析、幂等、作业状态机、快速路径 / 后台执行、回调

pub mod callback;
pub mod controller;
pub mod idempotency;
pub mod job;
pub mod mode;
pub mod runner;
#[cfg(feature = "async-sqlite")]
pub mod sqlite_store;
pub mod store;
pub mod worker;

pub use callback::{CallbackDispatcher, CallbackPayload};
pub use controller::{DispatchRequest, DispatchResponse, Dispatcher, IngestAck, ResponseStatus};
pub use idempotency::IdempotencyCache;
pub use job::{Document, Job, JobId, JobStatus, JobView, Trace};
pub use mode::{Mode, ModeResolver, RequestedMode};
pub use runner::JobRunner;
#[cfg(feature = "async-sqlite")]
pub use sqlite_store::SqliteJobStore;
pub use store::{Claim, JobStore, MemoryJobStore};
pub use worker::WorkerPool;
