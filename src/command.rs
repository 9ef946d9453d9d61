use std::{
    path::PathBuf,
    process::Stdio,
    sync::{
        Arc, Mutex,
        atomic::{AtomicBool, AtomicU8, AtomicU32, Ordering},
    },
    time::Duration,
};

use nix::libc::{SIGKILL, kill};
use tokio::{
    io::{AsyncBufReadExt, AsyncRead, BufReader},
    process::Command,
    task::JoinHandle,
    time::sleep,
};
use tokio_util::sync::CancellationToken;

use crate::service::{ServiceLogs, SharedMeta, lock};

/// Delay before a keep-running command is respawned after its process exits.
pub const RESTART_DELAY: Duration = Duration::from_secs(30);

const STATE_IDLE: u8 = 0;
const STATE_STARTING: u8 = 1;
const STATE_RUNNING: u8 = 2;
const STATE_BACKOFF: u8 = 3;

/// Everything a runner needs from its owning service. Port and domain are
/// read through `meta` at each spawn, so template substitution always sees
/// the service's current values.
#[derive(Clone)]
pub struct RunContext {
    pub service_id: String,
    pub working_dir: PathBuf,
    pub root_domain: String,
    pub meta: SharedMeta,
    pub logs: ServiceLogs,
    pub shutdown: CancellationToken,
}

struct CommandSpec {
    template: String,
    name: String,
}

struct RunnerInner {
    is_main: bool,
    spec: Mutex<CommandSpec>,
    /// Desired state: true while the supervision loop should respawn on exit.
    keep_running: AtomicBool,
    /// Single run-state word. Transitions out of `STATE_IDLE` happen only via
    /// compare-and-swap, so two concurrent exec calls cannot both spawn.
    state: AtomicU8,
    /// Pid of the live child, 0 while none is active.
    pid: AtomicU32,
    task: Mutex<Option<JoinHandle<()>>>,
    context: RunContext,
}

/// Supervises zero or one OS process for a single named command.
#[derive(Clone)]
pub struct CommandRunner {
    inner: Arc<RunnerInner>,
}

impl CommandRunner {
    pub fn new(context: RunContext, template: String, name: String, is_main: bool) -> Self {
        Self {
            inner: Arc::new(RunnerInner {
                is_main,
                spec: Mutex::new(CommandSpec { template, name }),
                keep_running: AtomicBool::new(false),
                state: AtomicU8::new(STATE_IDLE),
                pid: AtomicU32::new(0),
                task: Mutex::new(None),
                context,
            }),
        }
    }

    pub fn display_name(&self) -> String {
        lock(&self.inner.spec).name.clone()
    }

    pub fn is_running(&self) -> bool {
        self.inner.state.load(Ordering::SeqCst) == STATE_RUNNING
    }

    pub fn run_once(&self) {
        self.exec(false);
    }

    pub fn keep_running(&self) {
        self.exec(true);
    }

    /// Sets the desired state and starts the supervision loop if it isn't
    /// already alive. Must be called from within the tokio runtime.
    pub fn exec(&self, keep_running: bool) {
        let inner = &self.inner;
        inner.keep_running.store(keep_running, Ordering::SeqCst);

        let name = self.display_name();
        if lock(&inner.spec).template.is_empty() {
            inner.context.logs.log_err(format!(
                "No command configured for \"{name}\" in service \"{}\"",
                inner.context.service_id
            ));
            return;
        }

        if inner
            .state
            .compare_exchange(
                STATE_IDLE,
                STATE_STARTING,
                Ordering::SeqCst,
                Ordering::SeqCst,
            )
            .is_err()
        {
            info!(
                "Command \"{name}\" for service \"{}\" is already running",
                inner.context.service_id
            );
            return;
        }

        let handle = tokio::spawn(supervise(inner.clone()));
        *lock(&inner.task) = Some(handle);
    }

    /// Forcefully terminates the live process, if any, and clears the desired
    /// state so the supervision loop won't respawn. Safe to call repeatedly.
    pub fn kill(&self) {
        let inner = &self.inner;
        inner.keep_running.store(false, Ordering::SeqCst);

        let pid = inner.pid.load(Ordering::SeqCst);
        if pid == 0 {
            return;
        }

        // SAFETY: plain signal send, no memory is shared with the callee
        let result = unsafe { kill(pid as i32, SIGKILL) };
        if result != 0 {
            warn!("Failed to send SIGKILL to pid {pid}: result {result}");
            return;
        }
        inner
            .context
            .logs
            .log(format!("Process {} killed", self.display_name()));
    }

    /// Replaces the stored template and display name. A changed template does
    /// not restart a live process; that remains an operator-driven action.
    pub fn update(&self, template: String, name: String) {
        let mut spec = lock(&self.inner.spec);
        let needs_restart = spec.template != template;
        spec.template = template;
        spec.name = name;
        if needs_restart {
            self.inner
                .context
                .logs
                .log_err("Restart not yet implemented".to_string());
        }
    }

    pub(crate) fn take_task(&self) -> Option<JoinHandle<()>> {
        lock(&self.inner.task).take()
    }
}

async fn supervise(inner: Arc<RunnerInner>) {
    loop {
        let (command, name) = {
            let spec = lock(&inner.spec);
            let meta = lock(&inner.context.meta);
            let command = spec
                .template
                .replace("%p", &meta.port.to_string())
                .replace("%d", &meta.domain(&inner.context.root_domain));
            (command, spec.name.clone())
        };

        let child = Command::new("sh")
            .args(["-c", &command])
            .current_dir(&inner.context.working_dir)
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            // Make sure we clean up if we die
            .kill_on_drop(true)
            .spawn();

        match child {
            Ok(mut child) => {
                inner.pid.store(child.id().unwrap_or(0), Ordering::SeqCst);
                inner.state.store(STATE_RUNNING, Ordering::SeqCst);
                info!(
                    "Spawned process for \"{name}\" in service \"{}\": \"{command}\"",
                    inner.context.service_id
                );

                let stdout_task = child
                    .stdout
                    .take()
                    .map(|stream| spawn_line_reader(stream, inner.context.logs.clone(), name.clone(), false));
                let stderr_task = child
                    .stderr
                    .take()
                    .map(|stream| spawn_line_reader(stream, inner.context.logs.clone(), name.clone(), true));

                let status = tokio::select! {
                    _ = inner.context.shutdown.cancelled() => None,
                    status = child.wait() => Some(status),
                };

                inner.pid.store(0, Ordering::SeqCst);

                let Some(status) = status else {
                    // Supervisor teardown: terminate the child and bail out
                    // without retrying.
                    inner.context.logs.log(format!("Stopping command {name}"));
                    let _ = child.kill().await;
                    join_readers(stdout_task, stderr_task).await;
                    inner.state.store(STATE_IDLE, Ordering::SeqCst);
                    return;
                };

                // Readers finish once the pipes hit EOF; wait for them so all
                // output has landed in the buffers before we log completion.
                join_readers(stdout_task, stderr_task).await;

                match status {
                    Ok(status) => {
                        info!("Process for \"{name}\" exited with status: {status}");
                        inner.context.logs.log(format!("Command {name} completed"));
                    }
                    Err(err) => {
                        inner
                            .context
                            .logs
                            .log_err(format!("Error waiting on process for \"{name}\": {err}"));
                    }
                }
            }
            Err(err) => {
                error!("Failed to spawn process for \"{name}\": {err}");
                inner
                    .context
                    .logs
                    .log_err(format!("Process {name} didn't load: {err}"));
            }
        }

        if !inner.keep_running.load(Ordering::SeqCst) {
            break;
        }

        inner.state.store(STATE_BACKOFF, Ordering::SeqCst);
        if inner.is_main {
            inner.context.logs.log(format!(
                "Service {name} stopped, restarting in {} seconds...",
                RESTART_DELAY.as_secs()
            ));
        }

        tokio::select! {
            _ = inner.context.shutdown.cancelled() => {
                inner.state.store(STATE_IDLE, Ordering::SeqCst);
                return;
            }
            _ = sleep(RESTART_DELAY) => {}
        }

        // The command may have been killed during the backoff wait
        if !inner.keep_running.load(Ordering::SeqCst) {
            break;
        }
        inner.state.store(STATE_STARTING, Ordering::SeqCst);
    }

    inner.state.store(STATE_IDLE, Ordering::SeqCst);
}

fn spawn_line_reader<R>(
    stream: R,
    logs: ServiceLogs,
    name: String,
    is_err: bool,
) -> JoinHandle<()>
where
    R: AsyncRead + Unpin + Send + 'static,
{
    tokio::spawn(async move {
        let mut lines = BufReader::new(stream).lines();
        loop {
            match lines.next_line().await {
                Ok(Some(line)) => {
                    if is_err {
                        logs.log_err(line);
                    } else {
                        logs.log(line);
                    }
                }
                Ok(None) => break,
                Err(err) => {
                    logs.log_err(format!("Can't read from {name}: {err}"));
                    break;
                }
            }
        }
    })
}

async fn join_readers(stdout: Option<JoinHandle<()>>, stderr: Option<JoinHandle<()>>) {
    if let Some(handle) = stdout {
        let _ = handle.await;
    }
    if let Some(handle) = stderr {
        let _ = handle.await;
    }
}
