//! Process assembly: stores, mediator, workers, and the startup sequence.
//!
//! `bootstrap_core` wires the queue fabric to its workers; `Startup` layers
//! the boot sequence on top: register applications, kick off their
//! initialization, rehydrate persisted sessions, and arm the configuration
//! watchers and the periodic refetch loop.

use std::sync::Arc;
use std::time::Duration;

use chrono::NaiveDate;
use tokio_util::sync::CancellationToken;
use tracing::{error, info};

use crate::background::{
    ApplicationFetchWorker, ApplicationInitWorker, PortAllocator, SessionBuildWorker,
    SessionCleanWorker, SessionDestroyWorker, SessionFileSystemWorker, SessionHealthcheckWorker,
    SessionStartWorker,
};
use crate::config::{GlobalConfiguration, LoadedConfiguration, watcher};
use crate::mediator::{ApplicationFetchInput, Mediator};
use crate::models::{Application, Session};
use crate::services::RequestService;
use crate::storage::{ApplicationStore, SessionPersistence, SessionStore};
use crate::versioning::GitClient;

/// Interval between periodic `fetch --all` cycles per application.
const FETCH_INTERVAL: Duration = Duration::from_secs(60);

/// The assembled core: every shared surface reachable from the HTTP layer.
pub struct Core {
    pub global: GlobalConfiguration,
    pub mediator: Mediator,
    pub application_storage: Arc<ApplicationStore>,
    pub session_storage: Arc<SessionStore>,
    pub request_service: Arc<RequestService>,
}

/// Builds the stores, the mediator, and spawns all eight workers.
pub fn bootstrap_core(
    global: GlobalConfiguration,
    git: Arc<dyn GitClient>,
    persistence: Box<dyn SessionPersistence>,
) -> Core {
    let (mediator, receivers) = Mediator::new();
    let application_storage = Arc::new(ApplicationStore::new());
    let session_storage = Arc::new(SessionStore::new(persistence));
    let ports = Arc::new(PortAllocator::new());

    let since = NaiveDate::parse_from_str(&global.since, "%Y-%m-%d").unwrap_or_else(|_| {
        error!(since = %global.since, "Unparsable global since date, using 2018-01-01");
        NaiveDate::from_ymd_opt(2018, 1, 1).expect("valid fallback date")
    });

    tokio::spawn(
        SessionBuildWorker::new(
            global.clone(),
            Arc::clone(&session_storage),
            Arc::clone(&ports),
            mediator.clone(),
        )
        .run(receivers.build_session),
    );
    tokio::spawn(
        SessionStartWorker::new(Arc::clone(&session_storage), mediator.clone())
            .run(receivers.start_session),
    );
    tokio::spawn(
        SessionHealthcheckWorker::new(Arc::clone(&session_storage), mediator.clone())
            .run(receivers.healthcheck_session),
    );
    tokio::spawn(
        SessionFileSystemWorker::new(Arc::clone(&git)).run(receivers.session_filesystem),
    );
    tokio::spawn(
        SessionDestroyWorker::new(Arc::clone(&session_storage), mediator.clone())
            .run(receivers.destroy_session),
    );
    tokio::spawn(
        SessionCleanWorker::new(
            Arc::clone(&session_storage),
            Arc::clone(&ports),
            mediator.clone(),
        )
        .run(receivers.clean_session),
    );
    tokio::spawn(
        ApplicationInitWorker::new(Arc::clone(&git), mediator.clone())
            .run(receivers.application_init),
    );
    tokio::spawn(
        ApplicationFetchWorker::new(
            Arc::clone(&git),
            Arc::clone(&session_storage),
            mediator.clone(),
            since,
        )
        .run(receivers.application_fetch),
    );

    let request_service = Arc::new(RequestService::new(
        Arc::clone(&application_storage),
        Arc::clone(&session_storage),
        mediator.clone(),
    ));

    Core {
        global,
        mediator,
        application_storage,
        session_storage,
        request_service,
    }
}

/// Startup options; everything on by default, tests switch pieces off.
pub struct StartupOptions {
    pub watch_applications: bool,
    pub periodic_fetch: bool,
}

impl Default for StartupOptions {
    fn default() -> Self {
        StartupOptions {
            watch_applications: true,
            periodic_fetch: true,
        }
    }
}

/// Drives the boot sequence against an assembled core.
pub struct Startup {
    core: Core,
    applications: Vec<Arc<Application>>,
    shutdown: CancellationToken,
}

impl Startup {
    /// Builds the application models from a loaded configuration.
    pub fn new(
        configuration: LoadedConfiguration,
        git: Arc<dyn GitClient>,
        persistence: Box<dyn SessionPersistence>,
    ) -> Startup {
        let sessions_folder = std::path::PathBuf::from(&configuration.global.sessions_folder);
        let core = bootstrap_core(configuration.global, git, persistence);

        let applications: Vec<Arc<Application>> = configuration
            .applications
            .into_iter()
            .map(|(conf, filename)| {
                Arc::new(Application::new(conf, filename, &sessions_folder))
            })
            .collect();

        Startup {
            core,
            applications,
            shutdown: CancellationToken::new(),
        }
    }

    pub fn core(&self) -> &Core {
        &self.core
    }

    pub fn applications(&self) -> &[Arc<Application>] {
        &self.applications
    }

    pub fn shutdown_token(&self) -> CancellationToken {
        self.shutdown.clone()
    }

    /// Runs the boot sequence: store applications, enqueue their
    /// initialization, rehydrate persisted sessions, arm watchers.
    pub async fn start(&self, options: &StartupOptions) {
        self.store_applications();
        self.load_applications();
        if options.watch_applications {
            self.watch_applications();
        }
        self.load_sessions();
        if options.periodic_fetch {
            self.start_periodic_fetch();
        }
    }

    fn store_applications(&self) {
        for application in &self.applications {
            self.core.application_storage.add(Arc::clone(application));
        }
    }

    /// Initialization runs concurrently per application; one slow clone
    /// must not delay the others.
    fn load_applications(&self) {
        for application in &self.applications {
            let mediator = self.core.mediator.clone();
            let application = Arc::clone(application);
            tokio::spawn(async move {
                match mediator.application_init.enqueue(Arc::clone(&application)).await {
                    Ok(Ok(())) => {}
                    Ok(Err(e)) => {
                        error!(application = %application.name, error = %e, "Error while loading application")
                    }
                    Err(_) => error!("Init worker unavailable"),
                }
            });
        }
    }

    fn watch_applications(&self) {
        for application in &self.applications {
            watcher::watch_application_configuration(
                Arc::clone(application),
                self.shutdown.clone(),
            );
        }
    }

    /// Rehydrates persisted sessions and hands each alive one to the
    /// healthcheck worker for a best-effort liveness probe.
    fn load_sessions(&self) {
        let records = self.core.session_storage.load_records();
        for record in records {
            if !record.status.is_alive() {
                continue;
            }
            let Some(application) = self
                .core
                .application_storage
                .get(&record.application_name)
            else {
                continue;
            };
            let session = Session::from_record(record, application);
            info!(session = %session.short_uuid, "Rehydrated persisted session");
            self.core.session_storage.add(Arc::clone(&session));

            let mediator = self.core.mediator.clone();
            tokio::spawn(async move {
                let _ = mediator.healthcheck_session.enqueue(session).await;
            });
        }
    }

    fn start_periodic_fetch(&self) {
        for application in &self.applications {
            let mediator = self.core.mediator.clone();
            let application = Arc::clone(application);
            let shutdown = self.shutdown.clone();
            tokio::spawn(async move {
                loop {
                    tokio::select! {
                        _ = shutdown.cancelled() => return,
                        _ = tokio::time::sleep(FETCH_INTERVAL) => {}
                    }
                    let _ = mediator
                        .application_fetch
                        .enqueue(ApplicationFetchInput {
                            application: Arc::clone(&application),
                            watch_objects: true,
                        })
                        .await;
                }
            });
        }
    }
}
