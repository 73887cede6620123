//! Worker state-machine and retry-supervisor behavior, end to end.

#![cfg(unix)]

use std::sync::Arc;
use std::time::{Duration, Instant};

use gosu_core::logging::{JobLogger, LogOptions};
use gosu_core::{new_worker, Options, Scope, Task, Whiteboard, Worker, WorkerEnv};
use gosu_types::{Rate, Status};

fn isolate_home() {
    static ONCE: std::sync::Once = std::sync::Once::new();
    ONCE.call_once(|| {
        let dir = std::env::temp_dir().join(format!("gosu-test-home-{}", std::process::id()));
        std::fs::create_dir_all(&dir).unwrap();
        std::env::set_var("GOSUHOME", &dir);
    });
}

fn quiet_logger() -> JobLogger {
    JobLogger::new(
        None,
        &LogOptions {
            output: "null".into(),
            error: "null".into(),
            log_name: "test".into(),
            ..Default::default()
        },
    )
    .unwrap()
}

fn worker_for(task_json: &str, options: Options) -> Arc<dyn Worker> {
    isolate_home();
    let task: Task = serde_json::from_str(task_json).unwrap();
    new_worker(
        WorkerEnv {
            scope: Scope::new(),
            logger: quiet_logger(),
            whiteboard: Whiteboard::new(),
        },
        task,
        options,
    )
}

fn marker_task(marker: &std::path::Path, exit_code: i32) -> String {
    format!(
        r#"{{ "run": {{ "exec": "sh", "args": ["-c", "echo x >> {} && exit {}"] }} }}"#,
        marker.display(),
        exit_code
    )
}

fn attempts(marker: &std::path::Path) -> usize {
    std::fs::read_to_string(marker)
        .map(|text| text.lines().count())
        .unwrap_or(0)
}

#[tokio::test]
async fn crash_restart_respects_retry_limit() {
    let dir = tempfile::tempdir().unwrap();
    let marker = dir.path().join("attempts");

    let options = Options {
        retry_limit: Rate::new(3, Duration::from_secs(10)),
        retry_backoff: Duration::from_millis(100),
        retry_backoff_scale: 1.0,
        ..Default::default()
    };
    let worker = worker_for(&marker_task(&marker, 1), options);

    let started = Instant::now();
    let result = worker.clone().run().await;

    assert!(result.is_err());
    assert_eq!(worker.status().status(), Status::Errored);
    // The first run plus exactly three retries.
    assert_eq!(attempts(&marker), 4);
    // Backoff floors at 500 ms, so attempts are well spaced.
    assert!(started.elapsed() >= Duration::from_millis(3 * 50));
}

#[tokio::test]
async fn start_timeout_fires_before_running() {
    let options = Options {
        retry_disabled: true,
        min_uptime: Duration::from_secs(1),
        start_timeout: Duration::from_millis(500),
        ..Default::default()
    };
    let worker = worker_for(r#""wait 2s""#, options);

    let started = Instant::now();
    let result = worker.clone().run().await;

    assert_eq!(result.unwrap_err().status(), Status::TimeoutStart);
    assert_eq!(worker.status().status(), Status::TimeoutStart);
    assert!(started.elapsed() < Duration::from_millis(900));
}

#[tokio::test]
async fn early_success_is_quit_too_early() {
    let options = Options {
        retry_disabled: true,
        min_uptime: Duration::from_millis(300),
        ..Default::default()
    };
    let worker = worker_for(r#""noop""#, options);

    let result = worker.clone().run().await;
    let cause = result.unwrap_err();
    assert_eq!(cause.status(), Status::Errored);
    assert!(cause.to_string().contains("quit too early"));
}

#[tokio::test]
async fn zero_min_uptime_allows_immediate_success() {
    let options = Options {
        retry_disabled: true,
        ..Default::default()
    };
    let worker = worker_for(r#""noop""#, options);
    assert!(worker.clone().run().await.is_ok());
    assert_eq!(worker.status().status(), Status::Complete);
}

#[tokio::test]
async fn exec_timeout_cuts_long_tasks() {
    let options = Options {
        retry_disabled: true,
        exec_timeout: Duration::from_millis(300),
        ..Default::default()
    };
    let worker = worker_for(r#""wait 10s""#, options);

    let started = Instant::now();
    let result = worker.clone().run().await;
    assert_eq!(result.unwrap_err().status(), Status::TimeoutExec);
    assert!(started.elapsed() < Duration::from_secs(2));
}

#[tokio::test]
async fn terminal_status_is_monotonic() {
    let options = Options {
        retry_disabled: true,
        ..Default::default()
    };
    let worker = worker_for(r#""noop""#, options);
    worker.clone().run().await.unwrap();

    let first = worker.status().status();
    assert_eq!(first, Status::Complete);

    // Stop and kill after terminal must not change the verdict.
    worker.stop().await;
    worker.kill();
    assert_eq!(worker.status().status(), first);
}

#[tokio::test]
async fn stop_is_idempotent_and_bounded() {
    let options = Options {
        retry_disabled: true,
        stop_timeout: Duration::from_millis(300),
        ..Default::default()
    };
    let worker = worker_for(r#""wait 10s""#, options);

    let running = tokio::spawn({
        let worker = worker.clone();
        async move { worker.run().await }
    });
    tokio::time::sleep(Duration::from_millis(100)).await;

    let started = Instant::now();
    worker.stop().await;
    worker.stop().await;
    assert!(started.elapsed() < Duration::from_secs(2));

    let result = running.await.unwrap();
    // The wait task ignores the stop signal, so the stop timeout enforces.
    assert_eq!(result.unwrap_err().status(), Status::TimeoutStop);
}

#[tokio::test]
async fn kill_cancels_immediately() {
    let options = Options {
        retry_disabled: true,
        ..Default::default()
    };
    let worker = worker_for(r#""wait 10s""#, options);

    let running = tokio::spawn({
        let worker = worker.clone();
        async move { worker.run().await }
    });
    tokio::time::sleep(Duration::from_millis(50)).await;
    worker.kill();

    let result = running.await.unwrap();
    assert_eq!(result.unwrap_err().status(), Status::Cancelled);
}

#[tokio::test]
async fn retry_success_reruns_successful_tasks() {
    let dir = tempfile::tempdir().unwrap();
    let marker = dir.path().join("attempts");

    let options = Options {
        retry_success: true,
        retry_limit: Rate::new(2, Duration::from_secs(30)),
        retry_backoff_scale: 1.0,
        ..Default::default()
    };
    let worker = worker_for(&marker_task(&marker, 0), options);

    let result = worker.clone().run().await;
    assert!(result.is_ok());
    assert_eq!(worker.status().status(), Status::Complete);
    assert_eq!(attempts(&marker), 3);
}

#[tokio::test]
async fn composed_failures_are_not_retried() {
    let dir = tempfile::tempdir().unwrap();
    let marker = dir.path().join("attempts");

    // Retries are enabled at every level: the failing subtask burns its own
    // retry budget, but the parallel pipeline marks the composed failure
    // non-retriable, so the outer supervisor must not start a second round.
    let options = Options {
        retry_limit: Rate::new(3, Duration::from_secs(30)),
        retry_backoff_scale: 1.0,
        ..Default::default()
    };
    let task = format!(r#"[{}, "wait 30s"]"#, marker_task(&marker, 1));
    let worker = worker_for(&task, options);

    let result = worker.clone().run().await;
    assert!(result.is_err());
    assert_eq!(worker.status().status(), Status::Errored);
    // One inner round only: the initial run plus three subtask retries.
    assert_eq!(attempts(&marker), 4);
}

#[tokio::test]
async fn subprocess_reports_process_tree() {
    let options = Options {
        retry_disabled: true,
        ..Default::default()
    };
    let worker = worker_for(r#"{ "run": { "exec": "sleep", "args": ["3"] } }"#, options);

    let running = tokio::spawn({
        let worker = worker.clone();
        async move { worker.run().await }
    });

    // The sampler publishes within the first second.
    let mut saw_report = false;
    for _ in 0..25 {
        tokio::time::sleep(Duration::from_millis(100)).await;
        if !worker.inspect().is_zero() {
            saw_report = true;
            break;
        }
    }
    assert!(saw_report, "no report was ever published");

    worker.kill();
    let _ = running.await.unwrap();
}
