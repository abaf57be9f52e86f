pub mod aggregate;
pub mod config;
pub mod error;
pub mod executor;
pub mod flow;
pub mod job;
pub mod partition;
pub mod persist;
pub mod record;
pub mod registry;
pub mod results;
pub mod source;
pub mod task;
pub mod worker;

pub use aggregate::{merge_all, Accumulator, AggregateResult};
pub use config::EngineConfig;
pub use error::{EngineError, EngineResult};
pub use executor::{execute_partition, CancelToken, PartitionOutput};
pub use flow::{Aggregation, Extractor, FlowGraph, SortOrder, Stage};
pub use job::{
    JobId, JobInfo, JobOutput, JobRequest, JobResult, JobStatus, Progress, SourceSpec,
    StorageDirective,
};
pub use partition::{Locator, Partition};
pub use persist::{PersistConfig, PersistHandle, PersistStore, PersistedInfo, StorageTier};
pub use record::{Record, Records};
pub use registry::FnRegistry;
pub use results::JobResults;
pub use task::{Task, TaskId};
pub use worker::{WorkerId, WorkerMetrics};
