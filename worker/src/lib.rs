pub mod pool;
pub mod telemetry;
pub mod worker;

pub use pool::WorkerPool;
pub use worker::LocalWorker;
