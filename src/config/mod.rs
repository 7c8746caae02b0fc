//! Declarative configuration for the orchestrator.
//!
//! Configuration is discovered as `*.yml` files in the working directory,
//! each contributing a `global` section and/or a list of `applications`.
//! All files are merged into a single [`RootConfiguration`]; the last
//! `global` section found wins.
//!
//! Defaults: server port 8888, sessions folder `./.sessions`, 10 global
//! concurrent sessions.

pub mod loader;
pub mod watcher;

pub use loader::{ConfigError, LoadedConfiguration, load_configurations, parse_configuration_file};

use serde::{Deserialize, Serialize};

/// Top-level configuration: one global section plus any number of
/// application sections, merged across every discovered file.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct RootConfiguration {
    #[serde(default)]
    pub global: GlobalConfiguration,

    #[serde(default)]
    pub applications: Vec<ApplicationConfiguration>,
}

/// Process-wide settings.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct GlobalConfiguration {
    /// Port the HTTP server binds to.
    pub port: u16,

    /// Directory under which per-session working trees are provisioned.
    pub sessions_folder: String,

    /// Upper bound on alive sessions across all applications.
    pub max_concurrent_sessions: usize,

    /// TLS certificate file; TLS is enabled when both files are set.
    pub tls_cert_file: Option<String>,

    /// TLS key file.
    pub tls_key_file: Option<String>,

    /// Lower bound of the commit walk performed on fetch, as `YYYY-MM-DD`.
    pub since: String,
}

impl Default for GlobalConfiguration {
    fn default() -> Self {
        GlobalConfiguration {
            port: 8888,
            sessions_folder: "./.sessions".to_string(),
            max_concurrent_sessions: 10,
            tls_cert_file: None,
            tls_key_file: None,
            since: "2018-01-01".to_string(),
        }
    }
}

/// Per-application settings, as declared in YAML.
#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct ApplicationConfiguration {
    /// Unique application name.
    pub name: String,

    /// At most one application may be the default; requests that do not
    /// name an application resolve to it.
    #[serde(default)]
    pub is_default: bool,

    /// Git remote URL.
    pub remote: String,

    /// Optional authentication for the remote.
    #[serde(default)]
    pub auth: Option<AuthConfiguration>,

    /// Start and stop command lists.
    #[serde(default)]
    pub commands: Commands,

    /// Build-phase bounds.
    #[serde(default)]
    pub startup: Startup,

    /// Optional HTTP healthcheck; when absent a session is marked started
    /// as soon as its start commands and warmups complete.
    #[serde(default)]
    pub healthcheck: Option<Healthcheck>,

    /// Warmup requests issued after the start commands.
    #[serde(default)]
    pub warmup: Warmups,

    /// Inactivity reaping policy.
    #[serde(default)]
    pub recycle: Recycle,

    /// Refs that are auto-built and pinned (never age out).
    #[serde(default)]
    pub watch: Vec<String>,

    /// Port allocation preferences.
    #[serde(default)]
    pub port: PortConfiguration,

    /// Target URL template; must contain `{{port}}`.
    pub target: String,

    /// Extra headers applied to warmup and healthcheck requests, as
    /// `Name: value` strings.
    #[serde(default)]
    pub headers: Headers,

    /// Host header override for warmup and healthcheck requests.
    #[serde(default)]
    pub host: Option<String>,

    /// Upper bound on alive sessions for this application.
    #[serde(default = "default_app_max_concurrent")]
    pub max_concurrent_sessions: usize,
}

fn default_app_max_concurrent() -> usize {
    5
}

/// Credentials for the git remote.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct AuthConfiguration {
    #[serde(default)]
    pub username: Option<String>,

    #[serde(default)]
    pub password: Option<String>,

    #[serde(default)]
    pub token: Option<String>,
}

/// Start and stop command lists.
#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
pub struct Commands {
    #[serde(default)]
    pub start: Vec<Command>,

    #[serde(default)]
    pub stop: Vec<Command>,
}

/// A single shell command executed during session start or stop.
///
/// The command line is subject to `{{variable}}` substitution from the
/// session's variables before execution.
#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct Command {
    /// The command line, run through the platform shell.
    pub command: String,

    /// Extra environment entries, as `NAME=value` strings.
    #[serde(default)]
    pub environment: Vec<String>,

    /// Working directory relative to the session folder; the session
    /// folder itself when empty.
    #[serde(default)]
    pub working_dir: Option<String>,

    /// Per-command timeout in seconds; unbounded (within the startup
    /// timeout) when zero.
    #[serde(default)]
    pub timeout: u64,

    /// When true, a failure of this command does not abort the build.
    #[serde(default)]
    pub continue_on_error: bool,

    /// When true, healthchecking starts as soon as this command succeeds,
    /// while the remaining commands keep executing. The healthcheck may
    /// flip the session to started before the command list finishes.
    #[serde(default)]
    pub start_healthchecking: bool,
}

impl Command {
    /// Shorthand used by tests: a bare command line with defaults.
    pub fn shell(command: impl Into<String>) -> Self {
        Command {
            command: command.into(),
            environment: Vec::new(),
            working_dir: None,
            timeout: 0,
            continue_on_error: false,
            start_healthchecking: false,
        }
    }
}

/// Bounds on the build phase.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct Startup {
    /// Total build timeout in seconds.
    pub timeout: u64,

    /// How many times a failed build or exhausted healthcheck is recycled.
    pub retries: u32,
}

impl Default for Startup {
    fn default() -> Self {
        Startup {
            timeout: 300,
            retries: 0,
        }
    }
}

/// HTTP healthcheck specification.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct Healthcheck {
    /// Probe URL, subject to `{{variable}}` substitution.
    pub url: String,

    #[serde(default = "default_method")]
    pub method: String,

    /// Expected response status.
    #[serde(default = "default_status")]
    pub status: u16,

    /// Seconds between probes.
    #[serde(default = "default_healthcheck_retry_interval")]
    pub retry_interval: u64,

    /// Per-probe timeout in seconds.
    #[serde(default = "default_healthcheck_timeout")]
    pub timeout: u64,

    /// Consecutive failures tolerated before the session is killed.
    #[serde(default = "default_healthcheck_max_retries")]
    pub max_retries: u32,

    /// Extra headers for the probe, as `Name: value` strings.
    #[serde(default)]
    pub headers: Headers,
}

fn default_method() -> String {
    "GET".to_string()
}

fn default_status() -> u16 {
    200
}

fn default_healthcheck_retry_interval() -> u64 {
    5
}

fn default_healthcheck_timeout() -> u64 {
    10
}

fn default_healthcheck_max_retries() -> u32 {
    5
}

/// The warmup block: a list of URLs requested sequentially after the start
/// commands, with a shared retry budget.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct Warmups {
    pub urls: Vec<Warmup>,

    /// Attempts per URL before giving up.
    pub max_retries: u32,

    /// Seconds between attempts.
    pub retry_interval: u64,
}

impl Default for Warmups {
    fn default() -> Self {
        Warmups {
            urls: Vec::new(),
            max_retries: 3,
            retry_interval: 5,
        }
    }
}

/// A single warmup request.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct Warmup {
    /// Request URL, subject to `{{variable}}` substitution.
    pub url: String,

    #[serde(default = "default_method")]
    pub method: String,

    /// Expected response status.
    #[serde(default = "default_status")]
    pub status: u16,

    /// Per-request timeout in seconds; 0 picks the 60s default, -1 disables
    /// the timeout entirely.
    #[serde(default)]
    pub timeout: i64,
}

/// Inactivity reaping policy.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct Recycle {
    /// Seconds a started session may go unrequested before it is destroyed.
    pub inactivity_timeout: u64,
}

impl Default for Recycle {
    fn default() -> Self {
        Recycle {
            inactivity_timeout: 600,
        }
    }
}

/// Port allocation preferences.
#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct PortConfiguration {
    /// Preferred starting point for the port scan; the OS picks when absent.
    pub preferred: Option<u16>,

    /// Ports never to allocate.
    pub except: Vec<u16>,
}

/// Header list in `Name: value` form.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Headers(pub Vec<String>);

impl Headers {
    /// Iterates over parsed `(name, value)` pairs, skipping malformed
    /// entries.
    pub fn pairs(&self) -> impl Iterator<Item = (&str, &str)> {
        self.0.iter().filter_map(|raw| {
            let (name, value) = raw.split_once(':')?;
            Some((name.trim(), value.trim()))
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn global_defaults() {
        let global = GlobalConfiguration::default();
        assert_eq!(global.port, 8888);
        assert_eq!(global.sessions_folder, "./.sessions");
        assert_eq!(global.max_concurrent_sessions, 10);
        assert_eq!(global.since, "2018-01-01");
    }

    #[test]
    fn application_minimal_yaml_parses_with_defaults() {
        let yaml = r#"
name: my-app
remote: https://example.com/repo.git
target: http://127.0.0.1:{{port}}
"#;
        let conf: ApplicationConfiguration = serde_yaml::from_str(yaml).unwrap();
        assert_eq!(conf.name, "my-app");
        assert!(!conf.is_default);
        assert!(conf.healthcheck.is_none());
        assert_eq!(conf.startup.timeout, 300);
        assert_eq!(conf.startup.retries, 0);
        assert_eq!(conf.recycle.inactivity_timeout, 600);
        assert_eq!(conf.max_concurrent_sessions, 5);
        assert!(conf.watch.is_empty());
    }

    #[test]
    fn healthcheck_defaults_fill_in() {
        let yaml = r#"
url: http://127.0.0.1:{{port}}/health
"#;
        let hc: Healthcheck = serde_yaml::from_str(yaml).unwrap();
        assert_eq!(hc.method, "GET");
        assert_eq!(hc.status, 200);
        assert_eq!(hc.retry_interval, 5);
        assert_eq!(hc.timeout, 10);
        assert_eq!(hc.max_retries, 5);
    }

    #[test]
    fn command_string_defaults() {
        let yaml = r#"
command: npm start
"#;
        let command: Command = serde_yaml::from_str(yaml).unwrap();
        assert_eq!(command.command, "npm start");
        assert_eq!(command.timeout, 0);
        assert!(!command.continue_on_error);
        assert!(!command.start_healthchecking);
    }

    #[test]
    fn headers_pairs_skips_malformed() {
        let headers = Headers(vec![
            "X-Forwarded-For: 10.0.0.1".to_string(),
            "garbage".to_string(),
            "Accept:application/json".to_string(),
        ]);
        let pairs: Vec<_> = headers.pairs().collect();
        assert_eq!(
            pairs,
            vec![
                ("X-Forwarded-For", "10.0.0.1"),
                ("Accept", "application/json"),
            ]
        );
    }

    #[test]
    fn full_application_yaml_parses() {
        let yaml = r#"
name: full
is_default: true
remote: https://example.com/full.git
commands:
  start:
    - command: npm install
      timeout: 120
    - command: npm start
      start_healthchecking: true
  stop:
    - command: pkill -f npm
      continue_on_error: true
startup:
  timeout: 600
  retries: 2
healthcheck:
  url: http://127.0.0.1:{{port}}/health
  status: 204
warmup:
  urls:
    - url: http://127.0.0.1:{{port}}/warm
  max_retries: 2
  retry_interval: 1
recycle:
  inactivity_timeout: 120
watch:
  - main
  - develop
port:
  preferred: 5000
  except: [5001, 5002]
target: http://127.0.0.1:{{port}}
host: my-app.localhost
max_concurrent_sessions: 3
"#;
        let conf: ApplicationConfiguration = serde_yaml::from_str(yaml).unwrap();
        assert_eq!(conf.commands.start.len(), 2);
        assert!(conf.commands.start[1].start_healthchecking);
        assert_eq!(conf.startup.retries, 2);
        assert_eq!(conf.healthcheck.as_ref().unwrap().status, 204);
        assert_eq!(conf.warmup.urls.len(), 1);
        assert_eq!(conf.recycle.inactivity_timeout, 120);
        assert_eq!(conf.watch, vec!["main", "develop"]);
        assert_eq!(conf.port.preferred, Some(5000));
        assert_eq!(conf.port.except, vec![5001, 5002]);
        assert_eq!(conf.max_concurrent_sessions, 3);
    }
}
