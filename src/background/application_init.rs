//! Application init worker.
//!
//! Serial per application: clones the canonical tree if absent, then
//! delegates the first fetch (with watch diffing, so watched refs
//! auto-start) to the fetch worker. Emits the event sequence
//! `InitializationStarted → FetchStarted → FetchCompleted →
//! InitializationCompleted`; any error converts to `InitializationFailed`
//! and aborts the sequence.

use std::sync::Arc;

use tracing::{error, info};

use crate::mediator::{ApplicationFetchInput, Mediator, RequestReceiver};
use crate::models::{Application, ApplicationEventType};
use crate::versioning::{GitClient, GitError};

/// Consumes `Mediator::application_init`.
pub struct ApplicationInitWorker {
    git: Arc<dyn GitClient>,
    mediator: Mediator,
}

impl ApplicationInitWorker {
    pub fn new(git: Arc<dyn GitClient>, mediator: Mediator) -> Self {
        ApplicationInitWorker { git, mediator }
    }

    pub async fn run(self, mut rx: RequestReceiver<Arc<Application>, Result<(), GitError>>) {
        while let Some((application, reply)) = rx.recv().await {
            let result = self.init_application(&application).await;
            if let Err(e) = &result {
                error!(application = %application.name, error = %e, "Application initialization failed");
                application.emit(ApplicationEventType::InitializationFailed);
            }
            let _ = reply.send(result);
        }
    }

    async fn init_application(&self, application: &Arc<Application>) -> Result<(), GitError> {
        info!(application = %application.name, "Initializing application");
        application.emit(ApplicationEventType::InitializationStarted);

        if !application.base_folder.exists() {
            let conf = application.configuration();
            self.git
                .clone_repository(&conf.remote, conf.auth.as_ref(), &application.base_folder)
                .await?;
        }

        application.emit(ApplicationEventType::FetchStarted);
        self.mediator
            .application_fetch
            .enqueue(ApplicationFetchInput {
                application: Arc::clone(application),
                watch_objects: true,
            })
            .await
            .map_err(|_| GitError::CommandFailed {
                command: "application fetch".to_string(),
                stderr: "fetch worker unavailable".to_string(),
            })?;
        application.emit(ApplicationEventType::FetchCompleted);

        application.emit(ApplicationEventType::InitializationCompleted);
        info!(application = %application.name, "Application initialized");
        Ok(())
    }
}
