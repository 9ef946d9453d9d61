use std::{
    collections::{HashMap, VecDeque},
    io::ErrorKind,
    path::PathBuf,
    sync::{Arc, Mutex, MutexGuard},
};

use serde::Deserialize;
use tokio::{fs, sync::mpsc, task::JoinHandle};
use tokio_util::sync::CancellationToken;

use crate::{
    command::{CommandRunner, RunContext},
    registry::ControlRequest,
    settings::Settings,
};

pub const MAIN_COMMAND_KEY: &str = "main";

/// Locks a std mutex, recovering the guard if a holder panicked.
pub(crate) fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

/// Mutable service metadata, shared with every CommandRunner so spawns see
/// the values current at that instant.
#[derive(Debug, Clone, Default)]
pub struct ServiceMeta {
    pub name: Option<String>,
    pub port: u16,
    pub subdomain: Option<String>,
    pub domain: Option<String>,
    pub disable_caching: bool,
}

impl ServiceMeta {
    pub fn domain(&self, root_domain: &str) -> String {
        if let Some(domain) = &self.domain {
            return domain.clone();
        }
        match &self.subdomain {
            Some(subdomain) => format!("{subdomain}.{root_domain}"),
            None => root_domain.to_string(),
        }
    }
}

pub type SharedMeta = Arc<Mutex<ServiceMeta>>;

struct LogsInner {
    is_self: bool,
    capacity: usize,
    stdout: Mutex<VecDeque<String>>,
    stderr: Mutex<VecDeque<String>>,
}

/// Bounded per-stream log sink. FIFO within a stream; the oldest line is
/// evicted once the configured capacity is exceeded. The self service mirrors
/// everything to the supervisor's own console.
#[derive(Clone)]
pub struct ServiceLogs {
    inner: Arc<LogsInner>,
}

impl ServiceLogs {
    pub fn new(capacity: usize, is_self: bool) -> Self {
        Self {
            inner: Arc::new(LogsInner {
                is_self,
                capacity,
                stdout: Mutex::new(VecDeque::new()),
                stderr: Mutex::new(VecDeque::new()),
            }),
        }
    }

    pub fn log(&self, line: String) {
        if self.inner.is_self {
            info!("{line}");
        }
        push_bounded(&mut lock(&self.inner.stdout), line, self.inner.capacity);
    }

    pub fn log_err(&self, line: String) {
        if self.inner.is_self {
            error!("{line}");
        }
        push_bounded(&mut lock(&self.inner.stderr), line, self.inner.capacity);
    }

    pub fn snapshot(&self) -> (Vec<String>, Vec<String>) {
        let stdout = lock(&self.inner.stdout).iter().cloned().collect();
        let stderr = lock(&self.inner.stderr).iter().cloned().collect();
        (stdout, stderr)
    }

    pub fn has_error(&self) -> bool {
        !lock(&self.inner.stderr).is_empty()
    }

    pub fn clear(&self) {
        lock(&self.inner.stdout).clear();
        lock(&self.inner.stderr).clear();
    }
}

fn push_bounded(buffer: &mut VecDeque<String>, line: String, capacity: usize) {
    buffer.push_back(line);
    while buffer.len() > capacity {
        buffer.pop_front();
    }
}

/// Shape of `<working_dir>/service.json`.
#[derive(Debug, Deserialize)]
struct ServiceSettings {
    #[serde(default)]
    port: u16,
    name: Option<String>,
    subdomain: Option<String>,
    domain: Option<String>,
    #[serde(rename = "disablecaching", default)]
    disable_caching: bool,
    #[serde(default)]
    commands: HashMap<String, String>,
}

/// Actions that don't wrap a shell process. The registry-level ones are
/// delivered to the registry's control loop over the injected channel.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum BuiltinCommand {
    ClearLog,
    ReloadConfig,
    ReloadServiceList,
    UpdateVarnish,
}

#[derive(Clone)]
pub enum ServiceCommand {
    Shell(CommandRunner),
    Builtin(BuiltinCommand),
}

struct ServiceInner {
    id: String,
    is_self: bool,
    working_dir: PathBuf,
    settings: Settings,
    meta: SharedMeta,
    commands: Mutex<HashMap<String, ServiceCommand>>,
    logs: ServiceLogs,
    control: mpsc::UnboundedSender<ControlRequest>,
    shutdown: CancellationToken,
}

/// A supervised unit: a named set of commands plus bounded log buffers.
#[derive(Clone)]
pub struct Service {
    inner: Arc<ServiceInner>,
}

impl Service {
    pub async fn new(
        id: String,
        working_dir: PathBuf,
        is_self: bool,
        settings: Settings,
        control: mpsc::UnboundedSender<ControlRequest>,
        shutdown: CancellationToken,
    ) -> Self {
        let logs = ServiceLogs::new(settings.output_length(), is_self);

        let mut commands = HashMap::new();
        commands.insert(
            "clearlog".to_string(),
            ServiceCommand::Builtin(BuiltinCommand::ClearLog),
        );
        commands.insert(
            "reloadconfig".to_string(),
            ServiceCommand::Builtin(BuiltinCommand::ReloadConfig),
        );
        if is_self {
            commands.insert(
                "reloadservicelist".to_string(),
                ServiceCommand::Builtin(BuiltinCommand::ReloadServiceList),
            );
            commands.insert(
                "updatevarnish".to_string(),
                ServiceCommand::Builtin(BuiltinCommand::UpdateVarnish),
            );
        }

        let service = Service {
            inner: Arc::new(ServiceInner {
                id,
                is_self,
                working_dir,
                settings,
                meta: Arc::new(Mutex::new(ServiceMeta::default())),
                commands: Mutex::new(commands),
                logs,
                control,
                shutdown,
            }),
        };

        service.update_from_config().await;

        if !is_self {
            service.ensure_main_command();
            service.start().await;
        }

        service
    }

    pub fn id(&self) -> &str {
        &self.inner.id
    }

    pub fn is_self(&self) -> bool {
        self.inner.is_self
    }

    pub fn working_dir(&self) -> &PathBuf {
        &self.inner.working_dir
    }

    pub fn display_name(&self) -> String {
        lock(&self.inner.meta)
            .name
            .clone()
            .unwrap_or_else(|| self.inner.id.clone())
    }

    pub fn port(&self) -> u16 {
        lock(&self.inner.meta).port
    }

    pub fn domain(&self) -> String {
        lock(&self.inner.meta).domain(self.inner.settings.root_domain())
    }

    pub fn disable_caching(&self) -> bool {
        lock(&self.inner.meta).disable_caching
    }

    pub(crate) fn run_context(&self) -> RunContext {
        RunContext {
            service_id: self.inner.id.clone(),
            working_dir: self.inner.working_dir.clone(),
            root_domain: self.inner.settings.root_domain().to_string(),
            meta: self.inner.meta.clone(),
            logs: self.inner.logs.clone(),
            shutdown: self.inner.shutdown.clone(),
        }
    }

    /// Re-reads this service's settings file. Any failure leaves prior state
    /// untouched and puts one descriptive line in the error buffer.
    pub async fn update_from_config(&self) {
        let path = self
            .inner
            .working_dir
            .join(self.inner.settings.service_json());

        let content = match fs::read_to_string(&path).await {
            Ok(content) => content,
            Err(err) if err.kind() == ErrorKind::NotFound => {
                self.log_err(format!(
                    "Can't find service settings file: {}",
                    path.display()
                ));
                return;
            }
            Err(err) => {
                self.log_err(format!(
                    "Can't read service settings file {}: {err}",
                    path.display()
                ));
                return;
            }
        };

        let parsed: ServiceSettings = match serde_json::from_str(&content) {
            Ok(parsed) => parsed,
            Err(err) => {
                self.log_err(format!(
                    "Invalid JSON in service settings file {}: {err}",
                    path.display()
                ));
                return;
            }
        };

        if parsed.name.is_none() {
            warn!("Missing name in settings file: {}", path.display());
        }

        {
            let mut meta = lock(&self.inner.meta);
            meta.port = parsed.port;
            meta.name = parsed.name;
            meta.subdomain = parsed.subdomain;
            meta.domain = parsed.domain;
            meta.disable_caching = parsed.disable_caching;
        }

        for (name, template) in parsed.commands {
            let key = name.to_lowercase();
            let existing = lock(&self.inner.commands).get(&key).cloned();
            match existing {
                Some(ServiceCommand::Shell(runner)) => runner.update(template, name),
                Some(ServiceCommand::Builtin(_)) => {
                    warn!(
                        "Ignoring command \"{name}\" for service \"{}\": key is reserved",
                        self.inner.id
                    );
                }
                None => {
                    let is_main = key == MAIN_COMMAND_KEY;
                    // The main command inherits its display name from the service
                    let display_name = if is_main { self.display_name() } else { name };
                    let runner =
                        CommandRunner::new(self.run_context(), template, display_name, is_main);
                    lock(&self.inner.commands).insert(key, ServiceCommand::Shell(runner));
                }
            }
        }
    }

    /// Guarantees a `main` runner exists, so start/stop/restart always have a
    /// target. The placeholder template stays empty until configuration
    /// provides one, and an empty template never spawns.
    fn ensure_main_command(&self) {
        let mut commands = lock(&self.inner.commands);
        if !commands.contains_key(MAIN_COMMAND_KEY) {
            let runner = CommandRunner::new(
                self.run_context(),
                String::new(),
                self.display_name(),
                true,
            );
            commands.insert(MAIN_COMMAND_KEY.to_string(), ServiceCommand::Shell(runner));
        }
    }

    /// The only entry point by which the control plane starts anything.
    /// Unknown keys report failure without touching any service state.
    pub async fn exec_command(&self, key: &str, keep_running: bool) -> bool {
        let command = lock(&self.inner.commands).get(key).cloned();
        let Some(command) = command else {
            warn!(
                "Unknown command \"{key}\" requested for service \"{}\"",
                self.inner.id
            );
            return false;
        };

        match command {
            ServiceCommand::Shell(runner) => {
                if keep_running {
                    runner.keep_running();
                } else {
                    runner.run_once();
                }
            }
            ServiceCommand::Builtin(builtin) => self.exec_builtin(builtin).await,
        }

        true
    }

    async fn exec_builtin(&self, builtin: BuiltinCommand) {
        match builtin {
            BuiltinCommand::ClearLog => self.clear_log(),
            BuiltinCommand::ReloadConfig => {
                self.update_from_config().await;
                self.log("Updated service from config".to_string());
                let _ = self.inner.control.send(ControlRequest::RegenerateRoutes);
            }
            BuiltinCommand::ReloadServiceList => {
                let _ = self.inner.control.send(ControlRequest::ReloadServiceList);
            }
            BuiltinCommand::UpdateVarnish => {
                let _ = self.inner.control.send(ControlRequest::RegenerateRoutes);
            }
        }
    }

    pub fn stop_command(&self, key: &str) {
        if let Some(ServiceCommand::Shell(runner)) = lock(&self.inner.commands).get(key) {
            runner.kill();
        }
    }

    pub async fn start(&self) -> bool {
        self.exec_command(MAIN_COMMAND_KEY, true).await
    }

    pub fn stop(&self) {
        // Can't kill the supervisor itself
        if self.inner.is_self {
            return;
        }
        self.stop_command(MAIN_COMMAND_KEY);
    }

    pub async fn restart(&self) -> bool {
        self.stop();
        self.start().await
    }

    pub fn is_running(&self) -> bool {
        if self.inner.is_self {
            return true;
        }
        match lock(&self.inner.commands).get(MAIN_COMMAND_KEY) {
            Some(ServiceCommand::Shell(runner)) => runner.is_running(),
            _ => false,
        }
    }

    pub fn log(&self, line: String) {
        self.inner.logs.log(line);
    }

    pub fn log_err(&self, line: String) {
        self.inner.logs.log_err(line);
    }

    pub fn has_error(&self) -> bool {
        self.inner.logs.has_error()
    }

    pub fn clear_log(&self) {
        self.inner.logs.clear();
    }

    pub fn logs_snapshot(&self) -> (Vec<String>, Vec<String>) {
        self.inner.logs.snapshot()
    }

    /// Command keys offered to operators, sorted. `main` is supervised, not
    /// user-invocable, so it is skipped.
    pub fn command_keys(&self) -> Vec<String> {
        let mut keys: Vec<String> = lock(&self.inner.commands)
            .keys()
            .filter(|key| key.as_str() != MAIN_COMMAND_KEY)
            .cloned()
            .collect();
        keys.sort();
        keys
    }

    /// Kills every live process of this service and hands back the
    /// supervision task handles so shutdown can join them.
    pub(crate) fn kill_all(&self) -> Vec<JoinHandle<()>> {
        let commands = lock(&self.inner.commands);
        let mut handles = Vec::new();
        for command in commands.values() {
            if let ServiceCommand::Shell(runner) = command {
                runner.kill();
                if let Some(handle) = runner.take_task() {
                    handles.push(handle);
                }
            }
        }
        handles
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn test_settings(dir: &std::path::Path) -> Settings {
        Settings::from_pairs(vec![
            ("root_path".to_string(), dir.display().to_string()),
            ("root_domain".to_string(), "example.com".to_string()),
            ("output_length".to_string(), "4".to_string()),
        ])
    }

    async fn service_in(dir: &std::path::Path, id: &str) -> Service {
        let (control, _control_rx) = mpsc::unbounded_channel();
        Service::new(
            id.to_string(),
            dir.to_path_buf(),
            false,
            test_settings(dir),
            control,
            CancellationToken::new(),
        )
        .await
    }

    #[test]
    fn log_buffers_evict_oldest_past_capacity() {
        let logs = ServiceLogs::new(3, false);
        for i in 0..5 {
            logs.log(format!("out {i}"));
            logs.log_err(format!("err {i}"));
        }

        let (stdout, stderr) = logs.snapshot();
        assert_eq!(stdout, vec!["out 2", "out 3", "out 4"]);
        assert_eq!(stderr, vec!["err 2", "err 3", "err 4"]);
    }

    #[test]
    fn domain_prefers_override_then_subdomain() {
        let mut meta = ServiceMeta::default();
        assert_eq!(meta.domain("example.com"), "example.com");

        meta.subdomain = Some("api".to_string());
        assert_eq!(meta.domain("example.com"), "api.example.com");

        meta.domain = Some("other.net".to_string());
        assert_eq!(meta.domain("example.com"), "other.net");
    }

    #[tokio::test]
    async fn missing_settings_file_leaves_state_and_logs_error() {
        let dir = tempfile::tempdir().expect("tempdir");
        let service = service_in(dir.path(), "ghost").await;

        assert!(service.has_error());
        assert_eq!(service.display_name(), "ghost");
        assert_eq!(service.port(), 0);
        assert!(!service.is_running());
    }

    #[tokio::test]
    async fn malformed_settings_file_keeps_prior_state() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("service.json");

        std::fs::write(&path, r#"{"port": 9100, "name": "One"}"#).expect("write");
        let service = service_in(dir.path(), "one").await;
        assert_eq!(service.port(), 9100);
        assert_eq!(service.display_name(), "One");

        std::fs::write(&path, "{not json").expect("write");
        service.update_from_config().await;

        assert_eq!(service.port(), 9100);
        assert_eq!(service.display_name(), "One");
        let (_, stderr) = service.logs_snapshot();
        assert!(stderr.iter().any(|line| line.contains("Invalid JSON")));
    }

    #[tokio::test]
    async fn commands_are_registered_and_main_is_hidden() {
        let dir = tempfile::tempdir().expect("tempdir");
        std::fs::write(
            dir.path().join("service.json"),
            r#"{"port": 9100, "name": "One", "commands": {"Build": "echo build"}}"#,
        )
        .expect("write");

        let service = service_in(dir.path(), "one").await;

        assert_eq!(
            service.command_keys(),
            vec!["build", "clearlog", "reloadconfig"]
        );
        // A main runner exists even without a configured main command
        assert!(lock(&service.inner.commands).contains_key(MAIN_COMMAND_KEY));
        assert!(!service.is_running());
    }

    #[tokio::test]
    async fn exec_command_with_unknown_key_fails_without_mutation() {
        let dir = tempfile::tempdir().expect("tempdir");
        std::fs::write(
            dir.path().join("service.json"),
            r#"{"port": 9100, "name": "One"}"#,
        )
        .expect("write");

        let service = service_in(dir.path(), "one").await;
        let before = service.logs_snapshot();

        assert!(!service.exec_command("nosuch", false).await);
        assert_eq!(service.logs_snapshot(), before);
    }

    #[tokio::test]
    async fn clearlog_builtin_empties_both_buffers() {
        let dir = tempfile::tempdir().expect("tempdir");
        std::fs::write(
            dir.path().join("service.json"),
            r#"{"port": 9100, "name": "One"}"#,
        )
        .expect("write");

        let service = service_in(dir.path(), "one").await;
        service.log("hello".to_string());
        service.log_err("oops".to_string());
        assert!(service.has_error());

        assert!(service.exec_command("clearlog", false).await);
        assert!(!service.has_error());
        assert_eq!(service.logs_snapshot(), (Vec::new(), Vec::new()));
    }
}
