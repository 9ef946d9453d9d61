use std::{
    sync::{Arc, Mutex},
    time::{Duration, Instant},
};

use servman::{
    command::{CommandRunner, RunContext},
    service::{ServiceLogs, ServiceMeta, SharedMeta},
};
use tokio::time::sleep;
use tokio_util::sync::CancellationToken;

struct Harness {
    logs: ServiceLogs,
    meta: SharedMeta,
    shutdown: CancellationToken,
}

impl Harness {
    fn new(port: u16) -> Self {
        Self {
            logs: ServiceLogs::new(20, false),
            meta: Arc::new(Mutex::new(ServiceMeta {
                port,
                ..ServiceMeta::default()
            })),
            shutdown: CancellationToken::new(),
        }
    }

    fn runner(&self, template: &str) -> CommandRunner {
        let context = RunContext {
            service_id: "test".to_string(),
            working_dir: std::env::temp_dir(),
            root_domain: "example.com".to_string(),
            meta: self.meta.clone(),
            logs: self.logs.clone(),
            shutdown: self.shutdown.clone(),
        };
        CommandRunner::new(context, template.to_string(), "Test".to_string(), false)
    }

    fn stdout_count(&self, needle: &str) -> usize {
        self.logs
            .snapshot()
            .0
            .iter()
            .filter(|line| line.contains(needle))
            .count()
    }
}

async fn wait_until<F>(condition: F, timeout: Duration) -> bool
where
    F: Fn() -> bool,
{
    let deadline = Instant::now() + timeout;
    while Instant::now() < deadline {
        if condition() {
            return true;
        }
        sleep(Duration::from_millis(25)).await;
    }
    condition()
}

const WAIT: Duration = Duration::from_secs(5);

#[tokio::test]
async fn substitution_reflects_metadata_at_spawn_time() {
    let harness = Harness::new(9100);
    let runner = harness.runner("echo port=%p domain=%d");

    runner.run_once();
    assert!(
        wait_until(
            || harness.stdout_count("port=9100 domain=example.com") == 1,
            WAIT
        )
        .await
    );
    assert!(wait_until(|| !runner.is_running(), WAIT).await);

    // The same runner picks up a port change on its next spawn
    harness.meta.lock().expect("meta lock").port = 9200;
    runner.run_once();
    assert!(
        wait_until(
            || harness.stdout_count("port=9200 domain=example.com") == 1,
            WAIT
        )
        .await
    );
}

#[tokio::test]
async fn run_once_does_not_respawn_after_exit() {
    let harness = Harness::new(0);
    let runner = harness.runner("echo once");

    runner.run_once();
    assert!(wait_until(|| harness.stdout_count("once") == 1, WAIT).await);
    assert!(wait_until(|| !runner.is_running(), WAIT).await);

    sleep(Duration::from_millis(300)).await;
    assert_eq!(harness.stdout_count("once"), 1);
}

#[tokio::test]
async fn kill_is_idempotent() {
    let harness = Harness::new(0);
    let runner = harness.runner("sleep 30");

    runner.keep_running();
    assert!(wait_until(|| runner.is_running(), WAIT).await);

    runner.kill();
    runner.kill();
    assert!(wait_until(|| !runner.is_running(), WAIT).await);

    // Desired state was cleared, so nothing respawns
    sleep(Duration::from_millis(300)).await;
    assert!(!runner.is_running());
}

#[tokio::test]
async fn update_does_not_restart_running_process() {
    let harness = Harness::new(0);
    let runner = harness.runner("sleep 30");

    runner.run_once();
    assert!(wait_until(|| runner.is_running(), WAIT).await);

    runner.update("echo changed".to_string(), "Test".to_string());

    sleep(Duration::from_millis(300)).await;
    assert!(runner.is_running());
    let (stdout, stderr) = harness.logs.snapshot();
    assert!(
        stderr
            .iter()
            .any(|line| line.contains("Restart not yet implemented"))
    );
    assert!(!stdout.iter().any(|line| line.contains("changed")));

    runner.kill();
    assert!(wait_until(|| !runner.is_running(), WAIT).await);
}

#[tokio::test]
async fn keep_running_holds_backoff_and_shutdown_cancels_it() {
    let harness = Harness::new(0);
    let runner = harness.runner("echo ran");

    runner.keep_running();
    assert!(wait_until(|| harness.stdout_count("ran") == 1, WAIT).await);
    assert!(wait_until(|| harness.stdout_count("completed") == 1, WAIT).await);

    // The loop is now in its backoff wait; no respawn happens early
    sleep(Duration::from_millis(500)).await;
    assert_eq!(harness.stdout_count("ran"), 1);

    harness.shutdown.cancel();
    sleep(Duration::from_millis(300)).await;
    assert_eq!(harness.stdout_count("ran"), 1);
    assert!(!runner.is_running());
}

#[tokio::test]
async fn concurrent_exec_spawns_a_single_process() {
    let harness = Harness::new(0);
    let runner = harness.runner("echo guarded; sleep 30");

    runner.run_once();
    runner.run_once();
    assert!(wait_until(|| runner.is_running(), WAIT).await);

    sleep(Duration::from_millis(300)).await;
    assert_eq!(harness.stdout_count("guarded"), 1);

    runner.kill();
    assert!(wait_until(|| !runner.is_running(), WAIT).await);
}

#[tokio::test]
async fn empty_template_never_spawns() {
    let harness = Harness::new(0);
    let runner = harness.runner("");

    runner.keep_running();
    assert!(!runner.is_running());
    let (_, stderr) = harness.logs.snapshot();
    assert!(
        stderr
            .iter()
            .any(|line| line.contains("No command configured"))
    );
}
