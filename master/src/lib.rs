pub mod controller;
pub mod handlers;
pub mod monitor;
pub mod session;
pub mod state;

pub use controller::{JobController, JobHandle, JobPoll};
pub use session::{Session, SourcePin};
