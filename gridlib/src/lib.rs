pub mod config;
pub mod consumer;
pub mod dispatcher;
pub mod error;
pub mod events;
pub mod ipc;
pub mod job;
mod process;
pub mod runner;
pub mod store;
pub mod streamer;
pub mod types;

pub use config::{ExitPolicy, GridConfig};
pub use consumer::{Consumer, ResultHandler};
pub use dispatcher::{Dispatcher, OutputBuffer};
pub use error::{Error, Result};
pub use events::{JobResult, JobStatus, JobStreamEvent, LineData, OutputLine};
pub use job::{Job, JobUpdate, Submission};
pub use runner::Runner;
pub use store::{submit, JobStore, MemoryStore};
pub use streamer::Streamer;
