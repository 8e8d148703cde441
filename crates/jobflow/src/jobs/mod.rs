pub mod dispatcher;
pub mod error_codes;
pub mod heartbeat;
pub mod manager;
pub mod memory;
pub mod model;
pub mod processor;
pub mod processors;
pub mod recovery;
pub mod repo;
pub mod retry;
pub mod state;
pub mod store;
pub mod transitions;
pub mod watchdog;
pub mod workers;

pub use dispatcher::{DispatchSettings, Dispatcher};
pub use manager::{DispatchHandle, ErrorView, JobManager, JobStatusView, ManagerSettings};
pub use memory::MemoryJobStore;
pub use model::{
    ClaimedJob, CompleteAck, Directive, HeartbeatAck, ItemCompletion, ItemFailure, ItemReport,
    ItemStatus, Job, JobErrorKind, JobFilter, JobOutcome, JobStatus, NewJob, ReportedOutcome,
    ReprocessOutcome, ResumeOutcome, Topology, WorkItem, Worker,
};
pub use processor::{ItemProcessor, ProcessorRegistry};
pub use recovery::Recovery;
pub use repo::PgJobStore;
pub use store::JobStore;
pub use watchdog::{SweepReport, Watchdog};
pub use workers::WorkerProtocol;
