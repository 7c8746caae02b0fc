//! Request service: resolves inbound HTTP requests to sessions.
//!
//! Resolution order: (1) the explicit tracking cookie `polo-session=<uuid>`,
//! (2) a path of the form `/s/<application>/<checkout...>`, falling back to
//! the default application when the first segment names no application.
//! Every match refreshes the session's inactivity deadline; a miss enqueues
//! a build so the caller can render a waiting page.

use std::sync::Arc;

use crate::mediator::{Mediator, SessionBuildInput, SessionBuildResult};
use crate::models::{Application, Session, SessionStatus};
use crate::storage::{ApplicationStore, SessionStore};
use crate::types::SessionUuid;

/// Name of the session-pinning cookie.
pub const TRACKING_COOKIE: &str = "polo-session";

/// Outcome of resolving an inbound request.
pub enum SessionRoute {
    /// A started session: proxy to its target.
    Ready(Arc<Session>),

    /// A session exists but is still starting: render the waiting page.
    Starting(Arc<Session>),

    /// No session existed; a build was requested with this outcome.
    Requested(SessionBuildResult),

    /// The path names no known application or checkout.
    NotFound,
}

/// Routing glue between the HTTP layer and the core.
pub struct RequestService {
    application_storage: Arc<ApplicationStore>,
    session_storage: Arc<SessionStore>,
    mediator: Mediator,
}

impl RequestService {
    pub fn new(
        application_storage: Arc<ApplicationStore>,
        session_storage: Arc<SessionStore>,
        mediator: Mediator,
    ) -> Self {
        RequestService {
            application_storage,
            session_storage,
            mediator,
        }
    }

    /// Requests a new session build.
    pub async fn request_new_session(
        &self,
        application: Arc<Application>,
        checkout: &str,
        previous_session: Option<Arc<Session>>,
    ) -> SessionBuildResult {
        match self
            .mediator
            .build_session
            .enqueue(SessionBuildInput {
                application,
                checkout: checkout.to_string(),
                previous_session,
            })
            .await
        {
            Ok(result) => result,
            Err(_) => SessionBuildResult::failed(
                crate::mediator::FailingReason::CommandFailed,
                "Build worker unavailable",
            ),
        }
    }

    /// Resolves a session by its tracking-cookie value. A live match
    /// refreshes the inactivity deadline.
    pub fn session_by_tracking_cookie(&self, cookie_value: &str) -> Option<Arc<Session>> {
        let uuid = SessionUuid::parse(cookie_value)?;
        let session = self.session_storage.get_by_uuid(uuid)?;
        if !session.status().is_alive() {
            return None;
        }
        session.mark_as_being_requested();
        Some(session)
    }

    /// Resolves an inbound request to a session.
    pub async fn resolve(&self, path: &str, tracking_cookie: Option<&str>) -> SessionRoute {
        if let Some(cookie) = tracking_cookie
            && let Some(session) = self.session_by_tracking_cookie(cookie)
        {
            return route_for(session);
        }

        let Some((application, checkout)) = self.application_and_checkout_from_path(path) else {
            return SessionRoute::NotFound;
        };

        let Some(commit_id) = application.resolve_checkout(&checkout) else {
            return SessionRoute::NotFound;
        };

        if let Some(session) = self
            .session_storage
            .get_alive_application_session_by_checkout(&commit_id, &application)
        {
            session.mark_as_being_requested();
            return route_for(session);
        }

        let result = self
            .request_new_session(application, &checkout, None)
            .await;
        SessionRoute::Requested(result)
    }

    /// Maps `/s/<application>/<checkout...>` to an application and
    /// checkout. When the first segment names no application, the default
    /// application absorbs the whole remainder as the checkout.
    fn application_and_checkout_from_path(&self, path: &str) -> Option<(Arc<Application>, String)> {
        let rest = path.strip_prefix("/s/")?;
        let rest = rest.trim_end_matches('/');
        if rest.is_empty() {
            return None;
        }

        if let Some((first, remainder)) = rest.split_once('/')
            && let Some(application) = self.application_storage.get(first)
        {
            return Some((application, remainder.to_string()));
        }

        let application = self.application_storage.get_default()?;
        Some((application, rest.to_string()))
    }
}

fn route_for(session: Arc<Session>) -> SessionRoute {
    match session.status() {
        SessionStatus::Started => SessionRoute::Ready(session),
        _ => SessionRoute::Starting(session),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mediator::MediatorReceivers;
    use crate::models::ApplicationGitState;
    use crate::storage::NoopPersistence;
    use crate::test_utils::{sha, test_application_with};

    struct Fixture {
        service: RequestService,
        storage: Arc<SessionStore>,
        applications: Arc<ApplicationStore>,
        _receivers: MediatorReceivers,
    }

    fn fixture() -> Fixture {
        let (mediator, receivers) = Mediator::new();
        let storage = Arc::new(SessionStore::new(Box::new(NoopPersistence)));
        let applications = Arc::new(ApplicationStore::new());
        Fixture {
            service: RequestService::new(
                Arc::clone(&applications),
                Arc::clone(&storage),
                mediator,
            ),
            storage,
            applications,
            _receivers: receivers,
        }
    }

    fn resolved_application(name: &str, default: bool) -> Arc<Application> {
        let application = test_application_with(name, |conf| {
            conf.is_default = default;
        });
        let mut state = ApplicationGitState::default();
        state
            .objects_to_hash_map
            .insert("main".to_string(), sha("aa"));
        application.replace_git_state(state);
        application
    }

    #[tokio::test]
    async fn cookie_resolves_and_refreshes_session() {
        let fixture = fixture();
        let application = resolved_application("cookie-app", false);
        let session = Session::new(application, "main");
        session.set_status(SessionStatus::Started);
        session.set_max_age(5);
        fixture.storage.add(Arc::clone(&session));

        let before = session.inactive_at();
        let found = fixture
            .service
            .session_by_tracking_cookie(&session.uuid.to_string())
            .unwrap();
        assert_eq!(found.uuid, session.uuid);
        assert!(session.inactive_at() >= before);
    }

    #[tokio::test]
    async fn dead_session_cookie_is_ignored() {
        let fixture = fixture();
        let application = resolved_application("dead-cookie", false);
        let session = Session::new(application, "main");
        session.set_status(SessionStatus::StartFailed);
        fixture.storage.add(Arc::clone(&session));

        assert!(
            fixture
                .service
                .session_by_tracking_cookie(&session.uuid.to_string())
                .is_none()
        );
    }

    #[tokio::test]
    async fn path_resolves_named_application_session() {
        let fixture = fixture();
        let application = resolved_application("path-app", false);
        fixture.applications.add(Arc::clone(&application));

        let session = Session::new(Arc::clone(&application), "main");
        session.set_commit(sha("aa"), None);
        session.set_status(SessionStatus::Started);
        fixture.storage.add(Arc::clone(&session));

        let route = fixture.service.resolve("/s/path-app/main", None).await;
        let SessionRoute::Ready(found) = route else {
            panic!("expected ready route");
        };
        assert_eq!(found.uuid, session.uuid);
    }

    #[tokio::test]
    async fn path_falls_back_to_default_application() {
        let fixture = fixture();
        let application = resolved_application("default-app", true);
        fixture.applications.add(Arc::clone(&application));

        let session = Session::new(Arc::clone(&application), "main");
        session.set_commit(sha("aa"), None);
        fixture.storage.add(Arc::clone(&session));

        let route = fixture.service.resolve("/s/main", None).await;
        let SessionRoute::Starting(found) = route else {
            panic!("expected starting route");
        };
        assert_eq!(found.uuid, session.uuid);
    }

    #[tokio::test]
    async fn unknown_path_is_not_found() {
        let fixture = fixture();
        assert!(matches!(
            fixture.service.resolve("/s/nope/main", None).await,
            SessionRoute::NotFound
        ));
        assert!(matches!(
            fixture.service.resolve("/other", None).await,
            SessionRoute::NotFound
        ));
    }

    #[tokio::test]
    async fn miss_requests_a_build() {
        let mut fixture = fixture();
        let application = resolved_application("miss-app", false);
        fixture.applications.add(Arc::clone(&application));

        // Answer the build request like the build worker would.
        let mut build_rx = fixture._receivers.build_session;
        tokio::spawn(async move {
            let (input, reply) = build_rx.recv().await.unwrap();
            let session = Session::new(input.application, input.checkout);
            let _ = reply.send(SessionBuildResult::Succeeded { session });
        });

        let route = fixture.service.resolve("/s/miss-app/main", None).await;
        let SessionRoute::Requested(result) = route else {
            panic!("expected requested route");
        };
        assert!(result.session().is_some());
    }
}
