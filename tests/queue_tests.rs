//! End-to-end tests for the queue: scheduling order, the failure gate,
//! skip cascades, global controls, and both execution strategies, driven
//! through scripted provider mocks.

use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use taskdeck::providers::{
    Capacity, CapacityProvider, EnvironmentProvider, Notifier, SessionStatus, TerminalProvider,
    TerminalSession,
};
use taskdeck::types::{
    CreateTaskInput, CreateTemplateInput, ExecutionMode, QueueEvent, TaskStatus, TemplateStep,
    TemplateVariables,
};
use taskdeck::{Database, ErrorCode, Providers, QueueConfig, TaskQueue};
use tempfile::TempDir;

// ---------------------------------------------------------------------------
// Provider mocks
// ---------------------------------------------------------------------------

#[derive(Clone)]
struct SessionState {
    exists: bool,
    status: SessionStatus,
    lines: Vec<String>,
}

struct MockTerminal {
    sessions: Arc<Mutex<HashMap<String, SessionState>>>,
    create_gate: Mutex<Option<Arc<tokio::sync::Notify>>>,
}

impl MockTerminal {
    fn new() -> Self {
        Self {
            sessions: Arc::new(Mutex::new(HashMap::new())),
            create_gate: Mutex::new(None),
        }
    }

    /// Make `create` block until the returned handle is notified, then fail.
    fn hold_creates(&self) -> Arc<tokio::sync::Notify> {
        let gate = Arc::new(tokio::sync::Notify::new());
        *self.create_gate.lock().unwrap() = Some(gate.clone());
        gate
    }

    fn set_status(&self, name: &str, status: SessionStatus) {
        let mut sessions = self.sessions.lock().unwrap();
        if let Some(state) = sessions.get_mut(name) {
            state.status = status;
        }
    }

    /// Simulate the session disappearing out from under the queue.
    fn kill_external(&self, name: &str) {
        let mut sessions = self.sessions.lock().unwrap();
        if let Some(state) = sessions.get_mut(name) {
            state.exists = false;
        }
    }

    fn exists(&self, name: &str) -> bool {
        self.sessions
            .lock()
            .unwrap()
            .get(name)
            .map(|s| s.exists)
            .unwrap_or(false)
    }

    fn lines(&self, name: &str) -> Vec<String> {
        self.sessions
            .lock()
            .unwrap()
            .get(name)
            .map(|s| s.lines.clone())
            .unwrap_or_default()
    }
}

struct MockSession {
    name: String,
    sessions: Arc<Mutex<HashMap<String, SessionState>>>,
}

#[async_trait]
impl TerminalSession for MockSession {
    async fn wait_ready(&self) -> anyhow::Result<()> {
        Ok(())
    }

    async fn write_line(&self, text: &str) -> anyhow::Result<()> {
        let mut sessions = self.sessions.lock().unwrap();
        let state = sessions
            .get_mut(&self.name)
            .ok_or_else(|| anyhow::anyhow!("no such session"))?;
        state.lines.push(text.to_string());
        Ok(())
    }

    async fn kill(&self) -> anyhow::Result<()> {
        let mut sessions = self.sessions.lock().unwrap();
        if let Some(state) = sessions.get_mut(&self.name) {
            state.exists = false;
        }
        Ok(())
    }
}

#[async_trait]
impl TerminalProvider for MockTerminal {
    async fn create(
        &self,
        _working_dir: &str,
        session_name: &str,
        _env: &HashMap<String, String>,
        _use_worktree: bool,
    ) -> anyhow::Result<Box<dyn TerminalSession>> {
        let gate = self.create_gate.lock().unwrap().clone();
        if let Some(gate) = gate {
            gate.notified().await;
            anyhow::bail!("terminal backend unavailable");
        }
        self.sessions.lock().unwrap().insert(
            session_name.to_string(),
            SessionState {
                exists: true,
                status: SessionStatus::Working,
                lines: Vec::new(),
            },
        );
        Ok(Box::new(MockSession {
            name: session_name.to_string(),
            sessions: Arc::clone(&self.sessions),
        }))
    }

    async fn session_exists(&self, session_name: &str) -> anyhow::Result<bool> {
        Ok(self.exists(session_name))
    }

    async fn session_status(&self, session_name: &str) -> anyhow::Result<SessionStatus> {
        Ok(self
            .sessions
            .lock()
            .unwrap()
            .get(session_name)
            .map(|s| s.status)
            .unwrap_or(SessionStatus::Unknown))
    }
}

struct MockEnvironment;

#[async_trait]
impl EnvironmentProvider for MockEnvironment {
    async fn resolve(&self, environment_id: &str) -> anyhow::Result<HashMap<String, String>> {
        let mut env = HashMap::new();
        env.insert("ENV_ID".to_string(), environment_id.to_string());
        Ok(env)
    }
}

struct MockCapacity {
    available: AtomicU32,
    registered: Mutex<Vec<String>>,
}

impl MockCapacity {
    fn new(available: u32) -> Self {
        Self {
            available: AtomicU32::new(available),
            registered: Mutex::new(Vec::new()),
        }
    }
}

#[async_trait]
impl CapacityProvider for MockCapacity {
    async fn capacity(&self) -> anyhow::Result<Capacity> {
        Ok(Capacity {
            available: self.available.load(Ordering::SeqCst),
        })
    }

    async fn register(
        &self,
        session_name: &str,
        _project: &str,
        _metadata: serde_json::Value,
    ) -> anyhow::Result<()> {
        self.registered
            .lock()
            .unwrap()
            .push(session_name.to_string());
        Ok(())
    }

    async fn unregister(&self, session_name: &str) -> anyhow::Result<()> {
        self.registered
            .lock()
            .unwrap()
            .retain(|name| name != session_name);
        Ok(())
    }
}

struct RecordingNotifier {
    events: Mutex<Vec<QueueEvent>>,
}

impl RecordingNotifier {
    fn new() -> Self {
        Self {
            events: Mutex::new(Vec::new()),
        }
    }

    fn count<F: Fn(&QueueEvent) -> bool>(&self, pred: F) -> usize {
        self.events.lock().unwrap().iter().filter(|e| pred(e)).count()
    }
}

impl Notifier for RecordingNotifier {
    fn send(&self, event: QueueEvent) {
        self.events.lock().unwrap().push(event);
    }
}

// ---------------------------------------------------------------------------
// Harness
// ---------------------------------------------------------------------------

struct TestQueue {
    queue: TaskQueue,
    db: Database,
    terminal: Arc<MockTerminal>,
    capacity: Arc<MockCapacity>,
    notifier: Arc<RecordingNotifier>,
    _workspace: TempDir,
}

fn setup_with(available: u32, runner_bin: &str) -> TestQueue {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();

    let workspace = TempDir::new().unwrap();
    std::fs::create_dir_all(workspace.path().join("proj")).unwrap();

    let db = Database::open_in_memory().unwrap();
    let terminal = Arc::new(MockTerminal::new());
    let capacity = Arc::new(MockCapacity::new(available));
    let notifier = Arc::new(RecordingNotifier::new());

    let config = QueueConfig {
        poll_interval: Duration::from_millis(20),
        monitor_interval: Duration::from_millis(5),
        settle_delay: Duration::from_millis(1),
        runner_bin: runner_bin.to_string(),
        print_args: Vec::new(),
        trust_flag: "--auto-approve".to_string(),
        workspace_root: workspace.path().to_path_buf(),
    };

    let queue = TaskQueue::start(
        db.clone(),
        Providers {
            terminal: terminal.clone(),
            environment: Arc::new(MockEnvironment),
            capacity: capacity.clone(),
            notifier: notifier.clone(),
        },
        config,
    );

    TestQueue {
        queue,
        db,
        terminal,
        capacity,
        notifier,
        _workspace: workspace,
    }
}

fn setup() -> TestQueue {
    setup_with(4, "true")
}

fn task(name: &str, mode: ExecutionMode) -> CreateTaskInput {
    CreateTaskInput {
        name: name.to_string(),
        prompt: format!("do {}", name),
        project: "proj".to_string(),
        mode: Some(mode),
        ..Default::default()
    }
}

fn task_with_deps(name: &str, mode: ExecutionMode, deps: Vec<String>) -> CreateTaskInput {
    CreateTaskInput {
        depends_on: deps,
        ..task(name, mode)
    }
}

/// Poll until the condition holds or a generous deadline passes.
async fn wait_for<F: Fn() -> bool>(what: &str, cond: F) {
    let deadline = tokio::time::Instant::now() + Duration::from_secs(10);
    while !cond() {
        if tokio::time::Instant::now() > deadline {
            panic!("timed out waiting for {}", what);
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
}

fn status_of(db: &Database, task_id: &str) -> TaskStatus {
    db.get_task(task_id).unwrap().unwrap().status
}

async fn wait_for_status(db: &Database, task_id: &str, status: TaskStatus) {
    let db = db.clone();
    let task_id = task_id.to_string();
    wait_for(&format!("task {} to become {}", task_id, status), || {
        status_of(&db, &task_id) == status
    })
    .await;
}

impl TestQueue {
    /// Wait for a running session-backed task until its session has actually
    /// been created in the provider, then return the session name. Waiting
    /// on the store link alone is not enough: the link is written before the
    /// session exists, so scripting the session status would be a no-op.
    async fn wait_for_session(&self, task_id: &str) -> String {
        wait_for_status(&self.db, task_id, TaskStatus::Running).await;
        let db = self.db.clone();
        let id = task_id.to_string();
        wait_for("session link", || {
            db.get_task(&id).unwrap().unwrap().session_name.is_some()
        })
        .await;
        let name = db.get_task(&id).unwrap().unwrap().session_name.unwrap();

        let terminal = self.terminal.clone();
        let session = name.clone();
        wait_for("session creation", move || terminal.exists(&session)).await;
        name
    }
}

// ---------------------------------------------------------------------------
// Scenarios
// ---------------------------------------------------------------------------

#[tokio::test(flavor = "multi_thread")]
async fn dependent_task_runs_after_its_dependency_completes() {
    let t = setup();
    let a = t.queue.create_task(&task("a", ExecutionMode::Interactive)).unwrap();
    let b = t
        .queue
        .create_task(&task_with_deps(
            "b",
            ExecutionMode::Interactive,
            vec![a.id.clone()],
        ))
        .unwrap();

    let session_a = t.wait_for_session(&a.id).await;
    assert_eq!(status_of(&t.db, &b.id), TaskStatus::Pending);

    t.terminal.set_status(&session_a, SessionStatus::Idle);
    wait_for_status(&t.db, &a.id, TaskStatus::Completed).await;
    wait_for_status(&t.db, &b.id, TaskStatus::Running).await;

    t.queue.shutdown().await;
}

#[tokio::test(flavor = "multi_thread")]
async fn failed_task_occupies_the_gate_and_skip_cascades() {
    let t = setup();
    let a = t.queue.create_task(&task("a", ExecutionMode::Interactive)).unwrap();
    let b = t
        .queue
        .create_task(&task_with_deps(
            "b",
            ExecutionMode::Interactive,
            vec![a.id.clone()],
        ))
        .unwrap();

    let session_a = t.wait_for_session(&a.id).await;
    t.terminal.kill_external(&session_a);
    wait_for_status(&t.db, &a.id, TaskStatus::Failed).await;

    assert_eq!(
        t.queue.awaiting_decision().await.unwrap(),
        Some(a.id.clone())
    );

    // A non-matching id is rejected and changes nothing.
    let err = t.queue.skip_task(&b.id).await.unwrap_err();
    assert_eq!(err.code, ErrorCode::GateMismatch);
    assert_eq!(status_of(&t.db, &b.id), TaskStatus::Pending);
    assert_eq!(
        t.queue.awaiting_decision().await.unwrap(),
        Some(a.id.clone())
    );

    let affected = t.queue.skip_task(&a.id).await.unwrap();
    assert_eq!(affected, vec![a.id.clone(), b.id.clone()]);
    assert_eq!(status_of(&t.db, &a.id), TaskStatus::Skipped);
    assert_eq!(status_of(&t.db, &b.id), TaskStatus::Skipped);
    assert_eq!(t.queue.awaiting_decision().await.unwrap(), None);

    t.queue.shutdown().await;
}

#[tokio::test(flavor = "multi_thread")]
async fn retry_clears_the_error_without_bumping_the_counter_again() {
    let t = setup();
    let a = t.queue.create_task(&task("a", ExecutionMode::Interactive)).unwrap();

    let session_a = t.wait_for_session(&a.id).await;
    t.terminal.kill_external(&session_a);
    wait_for_status(&t.db, &a.id, TaskStatus::Failed).await;

    let failed = t.db.get_task(&a.id).unwrap().unwrap();
    assert_eq!(failed.retry_count, 1);
    assert!(failed.error.is_some());

    let retried = t.queue.retry_task(&a.id).await.unwrap();
    assert_eq!(retried.status, TaskStatus::Ready);
    assert!(retried.error.is_none());
    assert_eq!(retried.retry_count, 1);
    assert_eq!(t.queue.awaiting_decision().await.unwrap(), None);

    // The task starts again and can complete this time.
    let session_a = t.wait_for_session(&a.id).await;
    t.terminal.set_status(&session_a, SessionStatus::Idle);
    wait_for_status(&t.db, &a.id, TaskStatus::Completed).await;
    assert_eq!(t.db.get_task(&a.id).unwrap().unwrap().retry_count, 1);

    t.queue.shutdown().await;
}

#[tokio::test(flavor = "multi_thread")]
async fn stop_all_kills_sessions_and_resume_reenters_resolution() {
    let t = setup();
    let a = t.queue.create_task(&task("a", ExecutionMode::Interactive)).unwrap();
    let b = t
        .queue
        .create_task(&task_with_deps(
            "b",
            ExecutionMode::Interactive,
            vec![a.id.clone()],
        ))
        .unwrap();

    let session_a = t.wait_for_session(&a.id).await;

    t.queue.stop_all_tasks().await.unwrap();

    assert_eq!(status_of(&t.db, &a.id), TaskStatus::Paused);
    assert_eq!(status_of(&t.db, &b.id), TaskStatus::Paused);
    assert!(t.queue.is_paused().await.unwrap());
    assert_eq!(t.queue.tracked_handle_counts().await.unwrap(), (0, 0, 0));

    // Teardown of a launch still in its handoff window finishes shortly
    // after stop returns, so poll for the external effects.
    let terminal = t.terminal.clone();
    let name = session_a.clone();
    wait_for("session teardown", move || !terminal.exists(&name)).await;
    let capacity = t.capacity.clone();
    wait_for("capacity release", move || {
        capacity.registered.lock().unwrap().is_empty()
    })
    .await;
    assert_eq!(
        t.notifier.count(|e| matches!(e, QueueEvent::QueuePaused)),
        1
    );

    let resumed = t.queue.resume_queue().await.unwrap();
    let a_after = resumed.iter().find(|task| task.id == a.id).unwrap();
    // Resumed tasks go back to pending, not straight to ready.
    assert_eq!(a_after.status, TaskStatus::Pending);
    assert!(!t.queue.is_paused().await.unwrap());

    // A re-enters resolution and runs again.
    t.wait_for_session(&a.id).await;

    t.queue.shutdown().await;
}

#[tokio::test(flavor = "multi_thread")]
async fn launch_failure_after_stop_does_not_unpause_the_task() {
    let t = setup();
    let release = t.terminal.hold_creates();
    let a = t.queue.create_task(&task("a", ExecutionMode::Interactive)).unwrap();

    // The launch is stuck in session creation when everything is stopped.
    wait_for_status(&t.db, &a.id, TaskStatus::Running).await;
    t.queue.stop_all_tasks().await.unwrap();
    assert_eq!(status_of(&t.db, &a.id), TaskStatus::Paused);

    // Let the held launch fail; its report lands after the stop and must
    // not flip the paused task to failed or occupy the gate.
    release.notify_one();
    tokio::time::sleep(Duration::from_millis(100)).await;

    let a_after = t.db.get_task(&a.id).unwrap().unwrap();
    assert_eq!(a_after.status, TaskStatus::Paused);
    assert_eq!(a_after.retry_count, 0);
    assert_eq!(t.queue.awaiting_decision().await.unwrap(), None);
    assert!(t.capacity.registered.lock().unwrap().is_empty());

    t.queue.shutdown().await;
}

#[tokio::test(flavor = "multi_thread")]
async fn handle_maps_are_empty_after_a_session_completes() {
    let t = setup();
    let a = t.queue.create_task(&task("a", ExecutionMode::Interactive)).unwrap();

    let session_a = t.wait_for_session(&a.id).await;
    t.terminal.set_status(&session_a, SessionStatus::Idle);
    wait_for_status(&t.db, &a.id, TaskStatus::Completed).await;

    assert_eq!(t.queue.tracked_handle_counts().await.unwrap(), (0, 0, 0));
    // Completion frees the capacity slot but leaves the session alive.
    assert!(t.capacity.registered.lock().unwrap().is_empty());
    assert!(t.terminal.exists(&session_a));

    t.queue.shutdown().await;
}

// ---------------------------------------------------------------------------
// Execution strategies
// ---------------------------------------------------------------------------

#[tokio::test(flavor = "multi_thread")]
async fn print_mode_completes_on_zero_exit() {
    let t = setup_with(4, "true");
    let a = t.queue.create_task(&task("a", ExecutionMode::Print)).unwrap();

    wait_for_status(&t.db, &a.id, TaskStatus::Completed).await;
    assert_eq!(t.queue.tracked_handle_counts().await.unwrap(), (0, 0, 0));

    t.queue.shutdown().await;
}

#[tokio::test(flavor = "multi_thread")]
async fn print_mode_nonzero_exit_fails_with_synthesized_error() {
    let t = setup_with(4, "false");
    let a = t.queue.create_task(&task("a", ExecutionMode::Print)).unwrap();

    wait_for_status(&t.db, &a.id, TaskStatus::Failed).await;

    let failed = t.db.get_task(&a.id).unwrap().unwrap();
    assert!(failed.error.unwrap().contains("exited abnormally"));
    assert_eq!(failed.retry_count, 1);
    assert_eq!(
        t.queue.awaiting_decision().await.unwrap(),
        Some(a.id.clone())
    );

    t.queue.shutdown().await;
}

#[tokio::test(flavor = "multi_thread")]
async fn print_mode_launch_failure_reports_the_spawn_error() {
    let t = setup_with(4, "taskdeck-no-such-binary");
    let a = t.queue.create_task(&task("a", ExecutionMode::Print)).unwrap();

    wait_for_status(&t.db, &a.id, TaskStatus::Failed).await;

    let failed = t.db.get_task(&a.id).unwrap().unwrap();
    assert!(failed.error.unwrap().contains("failed to launch"));

    t.queue.shutdown().await;
}

#[tokio::test(flavor = "multi_thread")]
async fn trust_mode_appends_the_permission_flag() {
    let t = setup();
    let a = t.queue.create_task(&task("a", ExecutionMode::Trust)).unwrap();

    let session_a = t.wait_for_session(&a.id).await;
    let terminal = t.terminal.clone();
    let name = session_a.clone();
    wait_for("prompt injection", move || !terminal.lines(&name).is_empty()).await;

    let lines = t.terminal.lines(&session_a);
    assert_eq!(lines.len(), 1);
    assert!(lines[0].ends_with("--auto-approve"));

    t.queue.shutdown().await;
}

#[tokio::test(flavor = "multi_thread")]
async fn interactive_mode_injects_the_bare_prompt() {
    let t = setup();
    let input = CreateTaskInput {
        prompt: "first line\nsecond `line`".to_string(),
        ..task("a", ExecutionMode::Interactive)
    };
    let a = t.queue.create_task(&input).unwrap();

    let session_a = t.wait_for_session(&a.id).await;
    let terminal = t.terminal.clone();
    let name = session_a.clone();
    wait_for("prompt injection", move || !terminal.lines(&name).is_empty()).await;

    let lines = t.terminal.lines(&session_a);
    assert_eq!(lines, vec!["first line second line".to_string()]);

    t.queue.shutdown().await;
}

#[tokio::test(flavor = "multi_thread")]
async fn trust_mode_attention_is_an_anomaly_not_a_failure() {
    let t = setup();
    let a = t.queue.create_task(&task("a", ExecutionMode::Trust)).unwrap();

    let session_a = t.wait_for_session(&a.id).await;
    t.terminal.set_status(&session_a, SessionStatus::NeedsAttention);
    tokio::time::sleep(Duration::from_millis(50)).await;

    assert_eq!(status_of(&t.db, &a.id), TaskStatus::Running);
    assert_eq!(t.queue.awaiting_decision().await.unwrap(), None);

    t.terminal.set_status(&session_a, SessionStatus::Idle);
    wait_for_status(&t.db, &a.id, TaskStatus::Completed).await;

    t.queue.shutdown().await;
}

// ---------------------------------------------------------------------------
// Gating and capacity
// ---------------------------------------------------------------------------

#[tokio::test(flavor = "multi_thread")]
async fn zero_capacity_blocks_new_starts() {
    let t = setup_with(0, "true");
    let a = t.queue.create_task(&task("a", ExecutionMode::Interactive)).unwrap();

    tokio::time::sleep(Duration::from_millis(100)).await;
    assert_eq!(status_of(&t.db, &a.id), TaskStatus::Pending);

    t.capacity.available.store(1, Ordering::SeqCst);
    wait_for_status(&t.db, &a.id, TaskStatus::Running).await;

    t.queue.shutdown().await;
}

#[tokio::test(flavor = "multi_thread")]
async fn soft_pause_blocks_starts_without_touching_state() {
    let t = setup();
    t.queue.pause_queue().await.unwrap();
    let a = t.queue.create_task(&task("a", ExecutionMode::Interactive)).unwrap();

    tokio::time::sleep(Duration::from_millis(100)).await;
    assert_eq!(status_of(&t.db, &a.id), TaskStatus::Pending);
    assert!(t.queue.is_paused().await.unwrap());

    t.queue.unpause_queue().await.unwrap();
    wait_for_status(&t.db, &a.id, TaskStatus::Running).await;

    t.queue.shutdown().await;
}

#[tokio::test(flavor = "multi_thread")]
async fn occupied_gate_blocks_new_starts_but_not_running_work() {
    let t = setup();
    let a = t.queue.create_task(&task("a", ExecutionMode::Interactive)).unwrap();
    let b = t.queue.create_task(&task("b", ExecutionMode::Interactive)).unwrap();

    let session_a = t.wait_for_session(&a.id).await;
    let session_b = t.wait_for_session(&b.id).await;
    let c = t.queue.create_task(&task("c", ExecutionMode::Interactive)).unwrap();

    // A fails; the gate blocks C from starting, while B keeps running.
    t.terminal.kill_external(&session_a);
    wait_for_status(&t.db, &a.id, TaskStatus::Failed).await;

    tokio::time::sleep(Duration::from_millis(100)).await;
    assert_eq!(status_of(&t.db, &c.id), TaskStatus::Pending);
    assert_eq!(status_of(&t.db, &b.id), TaskStatus::Running);

    // B can still complete while the gate is occupied.
    t.terminal.set_status(&session_b, SessionStatus::Idle);
    wait_for_status(&t.db, &b.id, TaskStatus::Completed).await;

    t.queue.shutdown().await;
}

// ---------------------------------------------------------------------------
// Validation and templates
// ---------------------------------------------------------------------------

#[tokio::test(flavor = "multi_thread")]
async fn create_rejects_missing_fields_without_mutating_state() {
    let t = setup();

    let err = t
        .queue
        .create_task(&CreateTaskInput {
            name: "a".to_string(),
            prompt: "".to_string(),
            project: "proj".to_string(),
            ..Default::default()
        })
        .unwrap_err();

    assert_eq!(err.code, ErrorCode::MissingRequiredField);
    assert_eq!(err.field.as_deref(), Some("prompt"));
    assert!(t.queue.list_tasks().unwrap().is_empty());
    assert_eq!(
        t.notifier.count(|e| matches!(e, QueueEvent::TaskCreated { .. })),
        0
    );

    t.queue.shutdown().await;
}

#[tokio::test(flavor = "multi_thread")]
async fn create_rejects_unknown_dependencies() {
    let t = setup();

    let err = t
        .queue
        .create_task(&task_with_deps(
            "a",
            ExecutionMode::Interactive,
            vec!["ghost".to_string()],
        ))
        .unwrap_err();

    assert_eq!(err.code, ErrorCode::InvalidFieldValue);
    assert!(t.queue.list_tasks().unwrap().is_empty());

    t.queue.shutdown().await;
}

#[tokio::test(flavor = "multi_thread")]
async fn batch_create_rejects_unknown_dependencies_up_front() {
    let t = setup();

    let err = t
        .queue
        .create_task_batch(&[
            task("a", ExecutionMode::Interactive),
            task_with_deps("b", ExecutionMode::Interactive, vec!["ghost".to_string()]),
        ])
        .unwrap_err();

    assert_eq!(err.code, ErrorCode::InvalidFieldValue);
    assert_eq!(err.field.as_deref(), Some("depends_on"));
    assert!(t.queue.list_tasks().unwrap().is_empty());

    t.queue.shutdown().await;
}

#[tokio::test(flavor = "multi_thread")]
async fn delete_is_limited_to_deletable_statuses() {
    let t = setup();
    let a = t.queue.create_task(&task("a", ExecutionMode::Interactive)).unwrap();
    wait_for_status(&t.db, &a.id, TaskStatus::Running).await;

    let err = t.queue.delete_task(&a.id).unwrap_err();
    assert_eq!(err.code, ErrorCode::NotDeletable);

    t.queue.shutdown().await;
}

#[tokio::test(flavor = "multi_thread")]
async fn template_instantiation_substitutes_and_chains_steps() {
    let t = setup();
    t.queue.pause_queue().await.unwrap();

    let template = t
        .queue
        .create_template(&CreateTemplateInput {
            name: "feature".to_string(),
            description: None,
            steps: vec![
                TemplateStep {
                    name: "plan {thing}".to_string(),
                    prompt: "plan the {thing}".to_string(),
                    mode: ExecutionMode::Print,
                    depends_on_step: None,
                    use_worktree: false,
                },
                TemplateStep {
                    name: "build {thing}".to_string(),
                    prompt: "build the {thing}".to_string(),
                    mode: ExecutionMode::Trust,
                    depends_on_step: None,
                    use_worktree: true,
                },
                TemplateStep {
                    name: "review".to_string(),
                    prompt: "review the {thing} against the plan".to_string(),
                    mode: ExecutionMode::Interactive,
                    depends_on_step: Some(0),
                    use_worktree: false,
                },
            ],
        })
        .unwrap();

    let mut vars = TemplateVariables::new();
    vars.insert("thing".to_string(), "parser".to_string());
    let tasks = t
        .queue
        .instantiate_template(&template.id, "proj", &vars)
        .unwrap();

    assert_eq!(tasks.len(), 3);
    assert_eq!(tasks[0].name, "plan parser");
    assert_eq!(tasks[0].prompt, "plan the parser");
    assert!(tasks[0].depends_on.is_empty());
    // Default wiring: step 1 follows step 0.
    assert_eq!(tasks[1].depends_on, vec![tasks[0].id.clone()]);
    assert_eq!(tasks[1].mode, ExecutionMode::Trust);
    assert!(tasks[1].use_worktree);
    // Explicit wiring: step 2 depends on step 0, not step 1.
    assert_eq!(tasks[2].depends_on, vec![tasks[0].id.clone()]);

    // Positions are contiguous at the tail of the queue.
    assert_eq!(
        tasks.iter().map(|task| task.position).collect::<Vec<_>>(),
        vec![0, 1, 2]
    );

    t.queue.shutdown().await;
}

#[tokio::test(flavor = "multi_thread")]
async fn template_with_invalid_step_index_is_rejected() {
    let t = setup();
    let template = t
        .queue
        .create_template(&CreateTemplateInput {
            name: "broken".to_string(),
            description: None,
            steps: vec![TemplateStep {
                name: "s".to_string(),
                prompt: "p".to_string(),
                mode: ExecutionMode::Print,
                depends_on_step: Some(5),
                use_worktree: false,
            }],
        })
        .unwrap();

    let err = t
        .queue
        .instantiate_template(&template.id, "proj", &TemplateVariables::new())
        .unwrap_err();
    assert_eq!(err.code, ErrorCode::InvalidFieldValue);
    assert!(t.queue.list_tasks().unwrap().is_empty());

    t.queue.shutdown().await;
}

#[tokio::test(flavor = "multi_thread")]
async fn template_with_cyclic_steps_is_rejected_with_the_cycle_code() {
    let t = setup();
    let template = t
        .queue
        .create_template(&CreateTemplateInput {
            name: "tangled".to_string(),
            description: None,
            steps: vec![
                TemplateStep {
                    name: "a".to_string(),
                    prompt: "a".to_string(),
                    mode: ExecutionMode::Print,
                    depends_on_step: Some(1),
                    use_worktree: false,
                },
                TemplateStep {
                    name: "b".to_string(),
                    prompt: "b".to_string(),
                    mode: ExecutionMode::Print,
                    depends_on_step: Some(0),
                    use_worktree: false,
                },
            ],
        })
        .unwrap();

    let err = t
        .queue
        .instantiate_template(&template.id, "proj", &TemplateVariables::new())
        .unwrap_err();

    assert_eq!(err.code, ErrorCode::DependencyCycle);
    assert!(err.message.contains("cycle"));
    // The whole instantiation rolls back.
    assert!(t.queue.list_tasks().unwrap().is_empty());

    t.queue.shutdown().await;
}

#[tokio::test(flavor = "multi_thread")]
async fn failure_emits_a_single_awaiting_decision_event() {
    let t = setup();
    let a = t.queue.create_task(&task("a", ExecutionMode::Interactive)).unwrap();

    let session_a = t.wait_for_session(&a.id).await;
    t.terminal.kill_external(&session_a);
    wait_for_status(&t.db, &a.id, TaskStatus::Failed).await;

    assert_eq!(
        t.notifier
            .count(|e| matches!(e, QueueEvent::TaskFailed { .. })),
        1
    );

    t.queue.shutdown().await;
}
