//! Supervision against the scripted platform, on paused time.

use std::sync::Arc;
use std::time::Duration;

use tierflow::domain::{FileReference, LaunchPath, LaunchRouting, SizeTier, TaskStatus};
use tierflow::platform::{InMemoryPlatform, TaskScript};
use tierflow::supervisor::{SupervisorConfig, TaskSupervisor};

fn setup(config: SupervisorConfig) -> (Arc<InMemoryPlatform>, TaskSupervisor) {
    let platform = Arc::new(InMemoryPlatform::new());
    let supervisor = TaskSupervisor::new(platform.clone(), config, LaunchRouting::default());
    (platform, supervisor)
}

fn file() -> FileReference {
    FileReference::new("ingest", "data/input.csv", 120 * 1024 * 1024, "etag-1")
}

#[tokio::test(start_paused = true)]
async fn test_exit_zero_is_success() {
    let (platform, supervisor) = setup(SupervisorConfig::default());
    platform.push_script(
        TaskScript::new()
            .pending()
            .running(["[INFO] reading", "[INFO] 100 rows"])
            .running(["[INFO] 200 rows"])
            .exit(Some(0), ["[INFO] done"]),
    );

    let outcome = supervisor.run(file(), SizeTier::Medium, "run-1").await.unwrap();

    assert_eq!(outcome.status, TaskStatus::Success);
    assert_eq!(outcome.exit_code, Some(0));
    assert_eq!(outcome.tier, SizeTier::Medium);
    assert_eq!(outcome.launch_path, LaunchPath::Container);
    assert_eq!(outcome.file, file());
    assert_eq!(
        outcome.log_tail,
        vec![
            "[INFO] reading",
            "[INFO] 100 rows",
            "[INFO] 200 rows",
            "[INFO] done"
        ]
    );
    assert_eq!(outcome.log_lines, 4);
    assert!(outcome.error_detail.is_none());
    assert_eq!(platform.released(), vec![outcome.task_id.clone()]);
    assert!(platform.terminate_calls().is_empty());
}

#[tokio::test(start_paused = true)]
async fn test_nonzero_exit_is_failure() {
    let (platform, supervisor) = setup(SupervisorConfig::default());
    platform.push_script(
        TaskScript::new()
            .running(["[INFO] start"])
            .exit(Some(137), ["[ERROR] out of memory"]),
    );

    let outcome = supervisor.run(file(), SizeTier::Large, "run-2").await.unwrap();

    assert_eq!(outcome.status, TaskStatus::Failure);
    assert_eq!(outcome.exit_code, Some(137));
    assert_eq!(outcome.error_detail.as_deref(), Some("[ERROR] out of memory"));
    assert!(outcome.summary().contains("exit code 137"));
}

#[tokio::test(start_paused = true)]
async fn test_missing_exit_code_is_failure() {
    let (platform, supervisor) = setup(SupervisorConfig::default());
    platform.push_script(TaskScript::new().running(["x"]).exit(None, Vec::<String>::new()));

    let outcome = supervisor.run(file(), SizeTier::Medium, "run-3").await.unwrap();

    assert_eq!(outcome.status, TaskStatus::Failure);
    assert_eq!(outcome.exit_code, None);
}

#[tokio::test(start_paused = true)]
async fn test_ceiling_terminates_exactly_once() {
    let (platform, supervisor) = setup(SupervisorConfig::default());
    platform.push_script(TaskScript::new().running(["[INFO] still going"]));

    let outcome = supervisor.run(file(), SizeTier::Xlarge, "run-4").await.unwrap();

    assert_eq!(outcome.status, TaskStatus::Timeout);
    assert_eq!(outcome.exit_code, None);
    assert!(outcome.elapsed >= Duration::from_secs(900));
    assert!(outcome.elapsed < Duration::from_secs(905));
    assert_eq!(platform.terminate_calls(), vec![outcome.task_id.clone()]);
    assert_eq!(outcome.log_tail, vec!["[INFO] still going"]);
}

#[tokio::test(start_paused = true)]
async fn test_function_path_has_shorter_ceiling() {
    let (platform, supervisor) = setup(SupervisorConfig::default());
    platform.push_script(TaskScript::new().pending());

    let outcome = supervisor.run(file(), SizeTier::Small, "run-5").await.unwrap();

    assert_eq!(outcome.launch_path, LaunchPath::Function);
    assert_eq!(outcome.status, TaskStatus::Timeout);
    assert!(outcome.elapsed >= Duration::from_secs(300));
    assert!(outcome.elapsed < Duration::from_secs(305));
    assert_eq!(outcome.log_lines, 0);
    assert_eq!(platform.terminate_calls().len(), 1);
}

#[tokio::test(start_paused = true)]
async fn test_transient_poll_errors_are_retried() {
    let (platform, supervisor) = setup(SupervisorConfig::default());
    platform.push_script(
        TaskScript::new()
            .pending()
            .transient_error()
            .running(["a"])
            .transient_error()
            .exit(Some(0), ["b"]),
    );

    let outcome = supervisor.run(file(), SizeTier::Medium, "run-6").await.unwrap();

    assert_eq!(outcome.status, TaskStatus::Success);
    assert_eq!(outcome.log_tail, vec!["a", "b"]);
}

#[tokio::test(start_paused = true)]
async fn test_log_read_faults_do_not_lose_lines() {
    let (platform, supervisor) = setup(SupervisorConfig::default());
    platform.push_script(
        TaskScript::new()
            .running(["1", "2"])
            .running(["3"])
            .running(["4"])
            .exit(Some(0), ["5"])
            .with_log_read_faults(3),
    );

    let outcome = supervisor.run(file(), SizeTier::Medium, "run-7").await.unwrap();

    assert_eq!(outcome.log_tail, vec!["1", "2", "3", "4", "5"]);
    assert_eq!(outcome.log_lines, 5);
}

#[tokio::test(start_paused = true)]
async fn test_log_tail_is_bounded() {
    let config = SupervisorConfig {
        log_tail_lines: 3,
        ..Default::default()
    };
    let (platform, supervisor) = setup(config);
    let lines: Vec<String> = (0..10).map(|i| format!("line {i}")).collect();
    platform.push_script(TaskScript::new().running(lines).exit(Some(0), ["end"]));

    let outcome = supervisor.run(file(), SizeTier::Medium, "run-8").await.unwrap();

    assert_eq!(outcome.log_lines, 11);
    assert_eq!(outcome.log_tail, vec!["line 8", "line 9", "end"]);
}

#[tokio::test(start_paused = true)]
async fn test_run_request_correlates_by_run_key() {
    let (platform, supervisor) = setup(SupervisorConfig::default());
    let request = tierflow::domain::DispatchRequest::new(
        file(),
        SizeTier::Medium,
        LaunchPath::Container,
    );

    let outcome = supervisor.run_request(&request).await.unwrap();

    assert_eq!(outcome.correlation_id, request.run_key);
    let launches = platform.launches();
    assert_eq!(launches[0].correlation_id, request.run_key);
    assert_eq!(launches[0].task_definition_key, "file-processor-medium");
}

#[tokio::test(start_paused = true)]
async fn test_final_drain_reads_sink_of_unstarted_task() {
    let (platform, supervisor) = setup(SupervisorConfig::default());
    platform.push_script(TaskScript::new().pending());

    let handle = supervisor.launch(file(), SizeTier::Small, "run-10").await.unwrap();
    platform.append_to_sink(&handle.log_sink, ["[ERROR] image pull failed"]);
    let outcome = supervisor.supervise(handle).await;

    assert_eq!(outcome.status, TaskStatus::Timeout);
    assert_eq!(outcome.log_tail, vec!["[ERROR] image pull failed"]);
    assert_eq!(outcome.error_detail.as_deref(), Some("[ERROR] image pull failed"));
}

#[tokio::test(start_paused = true)]
async fn test_no_polls_after_outcome() {
    let (platform, supervisor) = setup(SupervisorConfig::default());
    platform.push_script(
        TaskScript::new()
            .pending()
            .running(["working"])
            .exit(Some(0), ["done"]),
    );

    let outcome = supervisor.run(file(), SizeTier::Medium, "run-11").await.unwrap();
    let polls = platform.poll_calls(&outcome.task_id);
    assert_eq!(polls, 3);

    tokio::time::sleep(Duration::from_secs(60)).await;
    assert_eq!(platform.poll_calls(&outcome.task_id), polls);
    assert_eq!(platform.released(), vec![outcome.task_id.clone()]);
}
