use async_trait::async_trait;
use mongodb_container::engine::{Engine, EngineProcess, Phase};
use mongodb_container::error::{EntrypointError, ErrorKind};
use mongodb_container::service::{Sequencer, Shutdown, supervise};
use mongodb_container::types::{BootState, DataDirState, MongoEnv};
use mongodb_container::Settings;
use std::os::unix::process::ExitStatusExt;
use std::process::ExitStatus;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tracing_test::traced_test;

type Log = Arc<Mutex<Vec<String>>>;

#[derive(Default, Clone)]
struct Behaviour {
    /// Probes that fail before one succeeds; `usize::MAX` never succeeds.
    probe_failures: usize,
    /// The temporary engine is already dead when first probed.
    exits_early: bool,
    /// Database whose user creation fails.
    fail_eval_on: Option<&'static str>,
    lock_held: bool,
    /// The final engine runs until it is terminated.
    final_runs: bool,
}

struct FakeEngine {
    log: Log,
    scripts: Arc<Mutex<Vec<(String, String)>>>,
    probes: AtomicUsize,
    behaviour: Behaviour,
}

impl FakeEngine {
    fn new(behaviour: Behaviour) -> Self {
        Self {
            log: Log::default(),
            scripts: Arc::default(),
            probes: AtomicUsize::new(0),
            behaviour,
        }
    }

    fn calls(&self) -> Vec<String> {
        self.log.lock().unwrap().clone()
    }

    fn record(&self, call: impl Into<String>) {
        self.log.lock().unwrap().push(call.into());
    }
}

#[derive(Debug)]
struct FakeProcess {
    phase: Phase,
    log: Log,
    exited: Mutex<Option<ExitStatus>>,
    runs_until_stopped: bool,
}

#[async_trait]
impl Engine for FakeEngine {
    type Process = FakeProcess;

    async fn launch(&self, phase: Phase) -> Result<FakeProcess, EntrypointError> {
        self.record(format!("launch:{}", phase.name()));
        let exited = (phase == Phase::Temporary && self.behaviour.exits_early)
            .then(|| ExitStatus::from_raw(100 << 8));
        Ok(FakeProcess {
            phase,
            log: self.log.clone(),
            exited: Mutex::new(exited),
            runs_until_stopped: phase == Phase::Final && self.behaviour.final_runs,
        })
    }

    async fn probe(&self) -> Result<(), EntrypointError> {
        self.record("probe");
        let n = self.probes.fetch_add(1, Ordering::SeqCst);
        if n < self.behaviour.probe_failures {
            Err(EntrypointError::Unreachable("connection refused".into()))
        } else {
            Ok(())
        }
    }

    async fn eval(&self, database: &str, script: &str) -> Result<String, EntrypointError> {
        self.record(format!("eval:{database}"));
        self.scripts
            .lock()
            .unwrap()
            .push((database.to_string(), script.to_string()));
        if self.behaviour.fail_eval_on == Some(database) {
            return Err(EntrypointError::ShellFailed {
                program: "mongo".into(),
                status: ExitStatus::from_raw(1 << 8),
                output: "E11000 duplicate key".into(),
            });
        }
        Ok(String::new())
    }

    async fn await_release(&self) -> Result<(), EntrypointError> {
        self.record("release");
        if self.behaviour.lock_held {
            return Err(EntrypointError::LockHeld("/data/mongod.lock".into()));
        }
        Ok(())
    }
}

#[async_trait]
impl EngineProcess for FakeProcess {
    fn pid(&self) -> Option<u32> {
        None
    }

    fn exit_status(&self) -> Option<ExitStatus> {
        *self.exited.lock().unwrap()
    }

    fn diagnostics(&self) -> Vec<String> {
        vec!["[initandlisten] exception in initAndListen".to_string()]
    }

    async fn wait(&self) -> Result<ExitStatus, EntrypointError> {
        if self.runs_until_stopped {
            std::future::pending::<()>().await;
        }
        Ok(ExitStatus::from_raw(0))
    }

    async fn terminate(&self, _timeout: Duration) -> Result<ExitStatus, EntrypointError> {
        self.log
            .lock()
            .unwrap()
            .push(format!("terminate:{}", self.phase.name()));
        // a long-running engine reports death by SIGTERM, a bootstrap one a clean exit
        let status = if self.runs_until_stopped {
            ExitStatus::from_raw(15)
        } else {
            ExitStatus::from_raw(0)
        };
        *self.exited.lock().unwrap() = Some(status);
        Ok(status)
    }
}

fn settings(attempts: usize) -> Settings {
    Settings {
        ready_attempts: attempts,
        ready_interval_ms: 1,
        ..Settings::default()
    }
}

fn env(admin: bool) -> MongoEnv {
    let mut vars = vec![
        ("MONGODB_USER", "user1"),
        ("MONGODB_PASSWORD", "pass1"),
        ("MONGODB_DATABASE", "test_db"),
    ];
    if admin {
        vars.push(("MONGODB_ADMIN_PASSWORD", "adminpass"));
    }
    MongoEnv::from_vars(vars).expect("valid environment")
}

/// A stop source that never fires.
fn idle() -> Shutdown {
    Shutdown::channel().1
}

fn sequencer(
    behaviour: Behaviour,
    admin: bool,
    attempts: usize,
    data_dir: DataDirState,
) -> Sequencer<FakeEngine> {
    Sequencer::new(
        FakeEngine::new(behaviour),
        env(admin),
        settings(attempts),
        data_dir,
    )
}

#[tokio::test]
async fn first_boot_provisions_application_user_then_restarts() {
    let mut seq = sequencer(Behaviour::default(), false, 5, DataDirState::Empty);
    seq.start(&mut idle()).await.expect("bootstrap succeeds");

    assert_eq!(seq.state(), BootState::Running);
    assert_eq!(
        seq.engine().calls(),
        [
            "launch:bootstrap",
            "probe",
            "eval:test_db",
            "terminate:bootstrap",
            "release",
            "launch:run",
        ]
    );
}

#[tokio::test]
async fn admin_is_created_before_application_user() {
    let mut seq = sequencer(Behaviour::default(), true, 5, DataDirState::Empty);
    seq.start(&mut idle()).await.expect("bootstrap succeeds");

    let scripts = seq.engine().scripts.lock().unwrap().clone();
    assert_eq!(scripts.len(), 2);
    assert_eq!(scripts[0].0, "admin");
    assert!(scripts[0].1.contains("\"user\":\"admin\""));
    assert!(scripts[0].1.contains("clusterAdmin"));
    assert_eq!(scripts[1].0, "test_db");
    assert!(scripts[1].1.contains("\"user\":\"user1\""));
    assert!(scripts[1].1.contains("[\"readWrite\"]"));
}

#[tokio::test]
async fn populated_data_dir_never_touches_users() {
    let mut seq = sequencer(Behaviour::default(), true, 5, DataDirState::Populated);
    seq.start(&mut idle()).await.expect("start succeeds");

    assert_eq!(seq.state(), BootState::Running);
    assert_eq!(seq.engine().calls(), ["launch:run"]);
    assert!(seq.engine().scripts.lock().unwrap().is_empty());
}

#[tokio::test]
async fn readiness_retries_until_engine_answers() {
    let behaviour = Behaviour {
        probe_failures: 2,
        ..Default::default()
    };
    let mut seq = sequencer(behaviour, false, 5, DataDirState::Empty);
    seq.start(&mut idle()).await.expect("bootstrap succeeds");

    assert_eq!(seq.engine().probes.load(Ordering::SeqCst), 3);
}

#[tokio::test]
async fn readiness_gives_up_after_budget() {
    let behaviour = Behaviour {
        probe_failures: usize::MAX,
        ..Default::default()
    };
    let mut seq = sequencer(behaviour, false, 3, DataDirState::Empty);
    let err = seq.start(&mut idle()).await.expect_err("engine never ready");

    assert!(matches!(err, EntrypointError::NotReady { attempts: 3, .. }));
    assert_eq!(err.kind(), ErrorKind::Readiness);
    assert_eq!(seq.engine().probes.load(Ordering::SeqCst), 3);
    let calls = seq.engine().calls();
    assert!(calls.contains(&"terminate:bootstrap".to_string()));
    assert!(!calls.contains(&"launch:run".to_string()));
    assert_eq!(seq.state(), BootState::Bootstrapping);
}

#[tokio::test]
async fn early_engine_exit_is_not_retried() {
    let behaviour = Behaviour {
        exits_early: true,
        ..Default::default()
    };
    let mut seq = sequencer(behaviour, false, 10, DataDirState::Empty);
    let err = seq.start(&mut idle()).await.expect_err("engine exited");

    match err {
        EntrypointError::EngineExited { phase, status } => {
            assert_eq!(phase, "bootstrap");
            assert_eq!(status.code(), Some(100));
        }
        other => panic!("unexpected error: {other}"),
    }
    assert_eq!(seq.engine().probes.load(Ordering::SeqCst), 0);
}

#[tokio::test]
async fn partial_provisioning_is_reported_and_never_runs() {
    let behaviour = Behaviour {
        fail_eval_on: Some("test_db"),
        ..Default::default()
    };
    let mut seq = sequencer(behaviour, true, 5, DataDirState::Empty);
    let err = seq.start(&mut idle()).await.expect_err("application user fails");

    match &err {
        EntrypointError::ProvisioningIncomplete { created, failed, .. } => {
            assert_eq!(created, &["admin".to_string()]);
            assert_eq!(failed, "user1@test_db");
        }
        other => panic!("unexpected error: {other}"),
    }
    assert_eq!(err.exit_code(), 4);
    let calls = seq.engine().calls();
    assert!(calls.contains(&"terminate:bootstrap".to_string()));
    assert!(!calls.contains(&"launch:run".to_string()));
}

#[tokio::test]
async fn failed_admin_creation_stops_before_application_user() {
    let behaviour = Behaviour {
        fail_eval_on: Some("admin"),
        ..Default::default()
    };
    let mut seq = sequencer(behaviour, true, 5, DataDirState::Empty);
    let err = seq.start(&mut idle()).await.expect_err("admin creation fails");

    assert!(matches!(err, EntrypointError::Provisioning { ref target, .. } if target == "admin@admin"));
    assert!(!seq.engine().calls().contains(&"eval:test_db".to_string()));
}

#[tokio::test]
async fn held_lock_blocks_final_start() {
    let behaviour = Behaviour {
        lock_held: true,
        ..Default::default()
    };
    let mut seq = sequencer(behaviour, false, 5, DataDirState::Empty);
    let err = seq.start(&mut idle()).await.expect_err("lock never released");

    assert!(matches!(err, EntrypointError::LockHeld(_)));
    assert_eq!(seq.state(), BootState::UserProvisioned);
    assert!(!seq.engine().calls().contains(&"launch:run".to_string()));
}

#[tokio::test]
async fn supervise_reports_engine_exit_code() {
    let mut seq = sequencer(Behaviour::default(), false, 5, DataDirState::Populated);
    let process = seq.start(&mut idle()).await.expect("start succeeds");
    let code = supervise(process, Duration::from_secs(1), &mut idle())
        .await
        .unwrap();
    assert_eq!(code, 0);
}

#[tokio::test]
async fn supervise_forwards_stop_request_to_running_engine() {
    let behaviour = Behaviour {
        final_runs: true,
        ..Default::default()
    };
    let mut seq = sequencer(behaviour, false, 5, DataDirState::Populated);
    let process = seq.start(&mut idle()).await.expect("start succeeds");

    let (tx, mut shutdown) = Shutdown::channel();
    let supervised = supervise(process, Duration::from_secs(1), &mut shutdown);
    tokio::pin!(supervised);
    // still running without a stop request
    assert!(
        tokio::time::timeout(Duration::from_millis(50), &mut supervised)
            .await
            .is_err()
    );

    tx.send("SIGTERM").unwrap();
    let code = supervised.await.unwrap();
    assert_eq!(code, 128 + 15);
    assert_eq!(seq.engine().calls(), ["launch:run", "terminate:run"]);
}

#[tokio::test]
async fn stop_request_during_bootstrap_stops_temporary_engine() {
    let behaviour = Behaviour {
        probe_failures: usize::MAX,
        ..Default::default()
    };
    let mut seq = sequencer(behaviour, false, 1000, DataDirState::Empty);
    let (tx, mut shutdown) = Shutdown::channel();
    tx.send("SIGTERM").unwrap();

    let err = seq.start(&mut shutdown).await.expect_err("bootstrap interrupted");
    assert!(matches!(err, EntrypointError::Interrupted("SIGTERM")));
    assert_ne!(err.exit_code(), 0);
    let calls = seq.engine().calls();
    assert!(calls.contains(&"terminate:bootstrap".to_string()));
    assert!(calls.contains(&"release".to_string()));
    assert!(!calls.contains(&"launch:run".to_string()));
    assert_eq!(seq.state(), BootState::Bootstrapping);
}

#[traced_test]
#[tokio::test]
async fn readiness_failure_logs_engine_output() {
    let behaviour = Behaviour {
        probe_failures: usize::MAX,
        ..Default::default()
    };
    let mut seq = sequencer(behaviour, false, 2, DataDirState::Empty);
    seq.start(&mut idle()).await.expect_err("engine never ready");

    assert!(logs_contain("[initandlisten] exception in initAndListen"));
}
