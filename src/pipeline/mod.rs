//! The re-index pipeline: formatter, router, drain controller, supervisor, and watchdog.

pub mod drain;
pub mod formatter;
pub mod handler;
pub mod router;
/// Run orchestration and the operations exposed to the HTTP surface and the CLI.
pub mod service;
pub mod supervisor;
pub mod types;
pub mod watchdog;

pub use drain::{DrainContext, DrainController, DrainSettings};
pub use formatter::{FormatterSettings, format_records};
pub use handler::{DiscoveryIngestHandler, JobHandler};
pub use router::QueueRouter;
pub use service::{ReindexApi, ReindexService, ReindexSettings, connect_queue_store};
pub use supervisor::{RunRegistry, RunStatus, ShutdownSupervisor};
pub use types::{
    ChildConversionJob, FormattedBatch, FormattedRecord, JobHandlerFailure, PipelineError,
    RunOutcome, RunTarget, UNCATEGORIZED,
};
pub use watchdog::{StuckJobWatchdog, SweepReport, WatchdogSettings};
