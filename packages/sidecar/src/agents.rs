//! Wiring for a running sidecar.
//!
//! [`SidecarBuilder`] creates both mailboxes, restores watchdog deadlines
//! for jobs left open by a previous run, and spawns the dispatcher and
//! executor loops. The returned [`Sidecar`] is the handle for triggering
//! jobs and shutting down.
//!
//! # Example
//!
//! ```ignore
//! let sidecar = SidecarBuilder::new(Arc::new(MemoryJobStore::new()), surface)
//!     .with_config(SidecarConfig::from_env()?)
//!     .launch()
//!     .await?;
//!
//! let job_id = sidecar.trigger("Vector databases").await?;
//! sidecar.shutdown().await;
//! ```

use std::sync::Arc;
use std::time::Duration;

use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{error, info};

use crate::config::SidecarConfig;
use crate::dispatcher::Dispatcher;
use crate::error::{DispatchError, StoreError};
use crate::executor::{Executor, Surface};
use crate::job::{JobId, JobRecord};
use crate::mailbox::Mailbox;
use crate::store::JobStore;

/// How often [`Sidecar::wait_for_terminal`] re-reads the job.
const POLL_INTERVAL: Duration = Duration::from_millis(50);

pub struct SidecarBuilder<S> {
    store: Arc<S>,
    surface: Arc<dyn Surface>,
    config: SidecarConfig,
}

impl<S: JobStore + 'static> SidecarBuilder<S> {
    pub fn new(store: Arc<S>, surface: Arc<dyn Surface>) -> Self {
        Self {
            store,
            surface,
            config: SidecarConfig::default(),
        }
    }

    pub fn with_config(mut self, config: SidecarConfig) -> Self {
        self.config = config;
        self
    }

    /// Spawn both agents.
    ///
    /// Fails only if the store cannot be scanned for open jobs.
    pub async fn launch(self) -> Result<Sidecar<S>, StoreError> {
        let (dispatcher_mailbox, dispatcher_inbox) = Mailbox::channel();
        let (executor_mailbox, executor_inbox) = Mailbox::channel();

        let dispatcher = Arc::new(Dispatcher::new(
            self.store,
            executor_mailbox,
            self.config.clone(),
        ));
        let restored = dispatcher
            .supervisor()
            .restore(self.config.watchdog_delay)
            .await?;

        let executor = Executor::new(self.surface, dispatcher_mailbox, self.config.capture());

        let shutdown = CancellationToken::new();
        let handles = vec![
            tokio::spawn(dispatcher.clone().run(dispatcher_inbox, shutdown.child_token())),
            tokio::spawn(executor.run(executor_inbox, shutdown.child_token())),
        ];

        info!(restored, "sidecar started");
        Ok(Sidecar {
            dispatcher,
            shutdown,
            handles,
        })
    }
}

/// Handle to a running sidecar.
pub struct Sidecar<S> {
    dispatcher: Arc<Dispatcher<S>>,
    shutdown: CancellationToken,
    handles: Vec<JoinHandle<()>>,
}

impl<S: JobStore + 'static> Sidecar<S> {
    pub fn dispatcher(&self) -> &Arc<Dispatcher<S>> {
        &self.dispatcher
    }

    pub fn store(&self) -> &Arc<S> {
        self.dispatcher.store()
    }

    /// See [`Dispatcher::trigger`].
    pub async fn trigger(&self, topic: &str) -> Result<Option<JobId>, DispatchError> {
        self.dispatcher.trigger(topic).await
    }

    /// Re-read the job until it is terminal or `limit` elapses, then return
    /// its latest state. `None` if the job does not exist.
    pub async fn wait_for_terminal(
        &self,
        job_id: JobId,
        limit: Duration,
    ) -> Result<Option<JobRecord>, StoreError> {
        let deadline = tokio::time::Instant::now() + limit;

        loop {
            let record = self.store().get(job_id).await?;
            match &record {
                Some(current) if !current.is_terminal() => {}
                _ => return Ok(record),
            }
            if tokio::time::Instant::now() >= deadline {
                return Ok(record);
            }
            tokio::time::sleep(POLL_INTERVAL).await;
        }
    }

    /// Stop both agents and wait for their loops to exit.
    pub async fn shutdown(self) {
        self.shutdown.cancel();

        for result in futures::future::join_all(self.handles).await {
            if let Err(e) = result {
                error!(error = %e, "agent task failed");
            }
        }
        info!("sidecar stopped");
    }
}
