//! Configuration hot-reload.
//!
//! Each application's source file is polled every two seconds. When the
//! application's section changes, the new configuration is swapped in
//! (which emits `HotSwap` on the application bus); sessions pick up the
//! change on their next configuration read, since they always read through
//! their application.

use std::sync::Arc;
use std::time::Duration;

use tokio_util::sync::CancellationToken;
use tracing::info;

use crate::models::Application;

use super::loader::parse_configuration_file;

/// Poll interval for configuration files.
const WATCH_INTERVAL: Duration = Duration::from_secs(2);

/// Spawns the polling task for one application. The task exits when
/// `shutdown` is cancelled.
pub fn watch_application_configuration(application: Arc<Application>, shutdown: CancellationToken) {
    tokio::spawn(async move {
        info!(
            file = %application.filename.display(),
            application = %application.name,
            "Watching configuration file"
        );
        loop {
            tokio::select! {
                _ = shutdown.cancelled() => return,
                _ = tokio::time::sleep(WATCH_INTERVAL) => {}
            }

            let Ok(root) = parse_configuration_file(&application.filename) else {
                continue;
            };
            let current = application.configuration();
            let Some(changed) = root
                .applications
                .into_iter()
                .find(|candidate| candidate.name == application.name && *candidate != current)
            else {
                continue;
            };

            info!(application = %application.name, "Configuration changed");
            application.set_configuration(changed);
        }
    });
}
