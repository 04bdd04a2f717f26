//! # Sidecar
//!
//! Tracked jobs that submit a prompt to a remote, streaming text surface and
//! recover a structured answer from whatever the surface prints back.
//!
//! ## Architecture
//!
//! ```text
//! trigger(topic)
//!     │
//!     ▼
//! Dispatcher ───────── RUN_JOB ─────────► Executor
//!     │     ◄──────── { ok, error } ───────   │
//!     │                                       ├─► Surface.inject_prompt()
//!     │                                       ├─► Surface.submit()
//!     │                                       └─► ResponseCapture
//!     │                                             ├─ phase 1: new output unit
//!     │                                             └─ phase 2: quiet window
//!     │     ◄──── JOB_RAW_RESULT { raw } ─────────────┘
//!     ▼
//! parse_response ─► JobStore ◄── TimeoutSupervisor (ks-timeout-{jobId})
//! ```
//!
//! The dispatcher and executor are separate agents. They share no memory
//! and talk only through [`Mailbox`]es carrying JSON messages.
//!
//! ## Key Invariants
//!
//! 1. **Monotone status** - `waiting < processing < terminal`, never backward
//! 2. **Every job terminates** - the watchdog marks stuck jobs `timeout`
//! 3. **Failures are data** - a failed dispatch or capture becomes a terminal
//!    status with the error text in `raw`, never a panic across agents
//! 4. **Last write wins for results** - a late answer after a timeout is kept
//! 5. **Nothing retries** - re-running a topic is a new job
//!
//! ## Modules
//!
//! - [`job`] - Job records, statuses and patches
//! - [`store`] - The [`JobStore`] trait and [`MemoryJobStore`]
//! - [`parser`] - Lenient extraction of the JSON payload from raw text
//! - [`capture`] - Output sources and the two-phase [`ResponseCapture`]
//! - [`watchdog`] - Per-job deadlines ([`TimeoutSupervisor`])
//! - [`dispatcher`] / [`executor`] - The two agents
//! - [`agents`] - Launching both agents together
//! - [`scripted`] - An in-memory surface for tests and simulation

pub mod agents;
pub mod capture;
pub mod config;
pub mod dispatcher;
pub mod error;
pub mod executor;
pub mod job;
pub mod mailbox;
pub mod parser;
pub mod prompt;
pub mod protocol;
pub mod scripted;
pub mod store;
pub mod watchdog;

pub use agents::{Sidecar, SidecarBuilder};
pub use capture::{
    CaptureConfig, OutputSource, QuiescenceDetector, ResponseCapture, Subscription, SurfaceEvent,
};
pub use config::SidecarConfig;
pub use dispatcher::Dispatcher;
pub use error::{CaptureError, DispatchError, MailboxError, ProtocolError, StoreError};
pub use executor::{Executor, Surface};
pub use job::{JobContent, JobId, JobPatch, JobRecord, JobStatus, PatchField};
pub use mailbox::{CorrelationId, Envelope, Mailbox};
pub use parser::{parse_response, ParsedResponse};
pub use prompt::build_prompt;
pub use protocol::{Ack, DispatcherEvent, ExecutorRequest, JobRawResult, RunJob};
pub use store::{JobStore, MemoryJobStore};
pub use watchdog::{deadline_name, job_id_from_deadline, TimeoutSupervisor};

// Re-export for implementors of `JobStore` and `Surface`
pub use async_trait::async_trait;
