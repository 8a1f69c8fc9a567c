pub mod ingest;
pub mod job;
pub mod tracking;
pub mod worker;

pub use ingest::{OutboundIngest, SubmitPayload, SubmitResponse, SubmitStatus};
pub use job::SendJob;
pub use worker::{OutboundWorker, WorkerConfig};
