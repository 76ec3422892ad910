mod test_harness;

use std::time::Duration;

use suite_scheduler::backend::{InMemoryLab, InventoryBackend};
use suite_scheduler::error::SchedulerError;
use suite_scheduler::scheduler::{HqeStatus, StatusCode, SERVER_JOB};
use suite_scheduler::suite::{
    Priority, SuiteDispatcher, SuiteSpec, SuiteTest, MAX_TIMEOUT_MINS,
};
use suite_scheduler::worker::{DryRunExecutor, OutcomeScript};
use test_harness::{lab_with_duts, spawn_executor, test_config};

const BUILD: &str = "eve-release/R90-13816.0.0";

fn spec(max_retries: u32, test_retry: bool) -> SuiteSpec {
    SuiteSpec::builder("bvt-inline")
        .build_for("eve", BUILD)
        .priority(Priority::Cq)
        .max_retries(max_retries)
        .test_retry(test_retry)
        .build()
        .unwrap()
}

#[tokio::test(start_paused = true)]
async fn test_test_failing_twice_uses_one_retry_and_fails_suite() {
    let lab = lab_with_duts("eve", "suites", 2).await;
    let (token, handle) = spawn_executor(&lab, OutcomeScript::new().failing("platform_Crash"));

    let dispatcher = SuiteDispatcher::new(lab.clone(), test_config());
    let outcome = dispatcher
        .run(&spec(1, true), &[SuiteTest::new("platform_Crash")])
        .await
        .unwrap();
    token.cancel();
    assert_eq!(handle.await.unwrap(), 2);

    assert!(!outcome.is_success());
    assert!(!outcome.timed_out);
    let test = &outcome.tests[0];
    assert_eq!(test.job_ids.len(), 2);
    assert_eq!(test.retries(), 1);
    assert_eq!(test.final_status, Some(StatusCode::Fail));
    assert_eq!(lab.child_jobs(outcome.suite_id).await.len(), 2);
}

#[tokio::test(start_paused = true)]
async fn test_test_passing_on_retry_passes_suite() {
    let lab = lab_with_duts("eve", "suites", 2).await;
    let (token, handle) = spawn_executor(&lab, OutcomeScript::new().flaky("platform_Flaky"));

    let dispatcher = SuiteDispatcher::new(lab.clone(), test_config());
    let outcome = dispatcher
        .run(&spec(1, true), &[SuiteTest::new("platform_Flaky")])
        .await
        .unwrap();
    token.cancel();
    handle.await.unwrap();

    assert!(outcome.is_success());
    let test = &outcome.tests[0];
    assert_eq!(test.job_ids.len(), 2);
    assert_eq!(test.final_status, Some(StatusCode::Good));
    // Statuses from the failed first attempt are kept for reporting
    assert!(test
        .statuses
        .iter()
        .any(|s| s.job_id == test.job_ids[0] && s.status == StatusCode::Fail));
}

#[tokio::test(start_paused = true)]
async fn test_retry_budget_of_several_attempts() {
    let lab = lab_with_duts("eve", "suites", 1).await;
    let script = OutcomeScript::new().with_outcomes(
        "power_Resume",
        [StatusCode::Error, StatusCode::Fail, StatusCode::Good],
    );
    let (token, _handle) = spawn_executor(&lab, script);

    let dispatcher = SuiteDispatcher::new(lab, test_config());
    let outcome = dispatcher
        .run(&spec(3, true), &[SuiteTest::new("power_Resume")])
        .await
        .unwrap();
    token.cancel();

    assert!(outcome.is_success());
    assert_eq!(outcome.tests[0].job_ids.len(), 3);
}

#[tokio::test(start_paused = true)]
async fn test_no_retry_without_test_retry() {
    let lab = lab_with_duts("eve", "suites", 1).await;
    let (token, _handle) = spawn_executor(&lab, OutcomeScript::new().flaky("platform_Flaky"));

    let dispatcher = SuiteDispatcher::new(lab, test_config());
    let outcome = dispatcher
        .run(&spec(5, false), &[SuiteTest::new("platform_Flaky")])
        .await
        .unwrap();
    token.cancel();

    assert!(!outcome.is_success());
    assert_eq!(outcome.total_jobs(), 1);
}

#[tokio::test(start_paused = true)]
async fn test_not_enough_duts_submits_nothing() {
    let lab = lab_with_duts("eve", "suites", 1).await;
    lab.add_duts("eve", "cq", 5).await;

    let spec = SuiteSpec::builder("bvt-inline")
        .build_for("eve", BUILD)
        .minimum_duts(3)
        .build()
        .unwrap();
    let dispatcher = SuiteDispatcher::new(lab.clone(), test_config());
    let err = dispatcher
        .run(&spec, &[SuiteTest::new("dummy_Pass")])
        .await
        .unwrap_err();

    match err {
        SchedulerError::NotEnoughDuts {
            board,
            pool,
            required,
            available,
        } => {
            assert_eq!(board, "eve");
            assert_eq!(pool, "suites");
            assert_eq!(required, 3);
            assert_eq!(available, 1);
        }
        other => panic!("unexpected error: {other}"),
    }
    assert!(lab.all_jobs().await.is_empty());
}

#[tokio::test(start_paused = true)]
async fn test_locked_duts_do_not_count() {
    let lab = InMemoryLab::new();
    let hosts = lab.add_duts("eve", "suites", 2).await;
    lab.lock_host(hosts[0]).await.unwrap();

    let spec = SuiteSpec::builder("bvt")
        .build_for("eve", BUILD)
        .minimum_duts(2)
        .build()
        .unwrap();
    let dispatcher = SuiteDispatcher::new(lab, test_config());
    assert!(matches!(
        dispatcher.check_capacity(&spec).await,
        Err(SchedulerError::NotEnoughDuts { available: 1, .. })
    ));
}

#[tokio::test(start_paused = true)]
async fn test_child_jobs_per_test_and_board() {
    let lab = lab_with_duts("eve", "suites", 1).await;
    lab.add_duts("kevin", "suites", 1).await;
    let (token, _handle) = spawn_executor(&lab, OutcomeScript::new());

    let spec = SuiteSpec::builder("bvt-inline")
        .build_for("eve", BUILD)
        .build_for("kevin", "kevin-release/R90-13816.0.0")
        .priority(Priority::Weekly)
        .job_keyval("cts_abi", "arm")
        .build()
        .unwrap();
    let tests = [
        SuiteTest::new("login_LoginSuccess").with_dependency("chameleon"),
        SuiteTest::new("dummy_Pass"),
    ];
    let dispatcher = SuiteDispatcher::new(lab.clone(), test_config());
    let outcome = dispatcher.run(&spec, &tests).await.unwrap();
    token.cancel();

    assert!(outcome.is_success());
    assert_eq!(outcome.tests.len(), 4);

    let children = lab.child_jobs(outcome.suite_id).await;
    let names: Vec<&str> = children.iter().map(|j| j.name.as_str()).collect();
    assert_eq!(
        names,
        [
            "eve-release/R90-13816.0.0/bvt-inline/login_LoginSuccess",
            "kevin-release/R90-13816.0.0/bvt-inline/login_LoginSuccess",
            "eve-release/R90-13816.0.0/bvt-inline/dummy_Pass",
            "kevin-release/R90-13816.0.0/bvt-inline/dummy_Pass",
        ]
    );

    let first = &children[0];
    assert_eq!(first.priority, 230);
    assert_eq!(first.owner, "chromeos-test");
    assert!(first.dependency_labels.contains("chameleon"));
    assert!(first.dependency_labels.contains("board:eve"));
    assert!(first.dependency_labels.contains("pool:suites"));
    assert_eq!(first.keyvals["cts_abi"], "arm");
    assert_eq!(first.keyvals["build"], BUILD);
    assert_eq!(first.keyvals["suite"], "bvt-inline");
    assert!(!children[3].dependency_labels.contains("chameleon"));

    let suite_keyvals = lab.suite_keyvals(outcome.suite_id).await.unwrap();
    assert_eq!(suite_keyvals["suite"], "bvt-inline");
}

#[tokio::test(start_paused = true)]
async fn test_suite_times_out_without_results() {
    let lab = lab_with_duts("eve", "suites", 1).await;
    let spec = SuiteSpec::builder("bvt")
        .build_for("eve", BUILD)
        .timeout_mins(1)
        .build()
        .unwrap();

    let start = tokio::time::Instant::now();
    let dispatcher = SuiteDispatcher::new(lab, test_config());
    let outcome = dispatcher
        .run(&spec, &[SuiteTest::new("dummy_Pass")])
        .await
        .unwrap();

    assert!(outcome.timed_out);
    assert!(!outcome.is_success());
    assert_eq!(outcome.tests[0].final_status, None);
    assert!(start.elapsed() >= Duration::from_secs(60));
}

#[tokio::test(start_paused = true)]
async fn test_longest_timeout_runs_to_completion() {
    let lab = lab_with_duts("eve", "suites", 1).await;
    let (token, _handle) = spawn_executor(&lab, OutcomeScript::new());
    let spec = SuiteSpec::builder("bvt")
        .build_for("eve", BUILD)
        .timeout_mins(MAX_TIMEOUT_MINS)
        .build()
        .unwrap();

    let dispatcher = SuiteDispatcher::new(lab, test_config());
    let outcome = dispatcher
        .run(&spec, &[SuiteTest::new("dummy_Pass")])
        .await
        .unwrap();
    token.cancel();

    assert!(!outcome.timed_out);
    assert!(outcome.is_success());
}

#[tokio::test(start_paused = true)]
async fn test_started_job_is_not_handed_out_again() {
    let lab = InMemoryLab::new();
    let started = lab.create_job_with_labels("o", ["a"]).await.unwrap();
    let queued = lab.create_job_with_labels("o", ["a"]).await.unwrap();

    lab.start_job(started).await.unwrap();
    let runnable: Vec<u64> = lab.runnable_jobs().await.iter().map(|j| j.id).collect();
    assert_eq!(runnable, [queued]);

    lab.record_status(started, StatusCode::Good, SERVER_JOB, "")
        .await
        .unwrap();
    assert!(lab
        .get_host_queue_entries(started)
        .await
        .unwrap()
        .iter()
        .all(|e| e.status == HqeStatus::Completed));
    assert!(lab.start_job(99).await.is_err());
}

#[tokio::test(start_paused = true)]
async fn test_aborted_child_fails_suite_without_results() {
    let lab = lab_with_duts("eve", "suites", 1).await;

    let aborter = lab.clone();
    tokio::spawn(async move {
        loop {
            tokio::time::sleep(Duration::from_millis(5)).await;
            let jobs = aborter.runnable_jobs().await;
            if !jobs.is_empty() {
                for job in jobs {
                    aborter.abort_job(job.id).await.unwrap();
                }
                break;
            }
        }
    });

    let dispatcher = SuiteDispatcher::new(lab, test_config());
    let outcome = dispatcher
        .run(&spec(2, true), &[SuiteTest::new("dummy_Pass")])
        .await
        .unwrap();

    assert!(!outcome.timed_out);
    assert!(!outcome.is_success());
    let test = &outcome.tests[0];
    assert!(test.statuses.is_empty());
    assert_eq!(test.final_status, None);
    assert_eq!(test.job_ids.len(), 1);
}

#[tokio::test(start_paused = true)]
async fn test_executor_records_scripted_statuses() {
    let lab = InMemoryLab::new();
    let first = lab.create_job_with_labels("o", ["a"]).await.unwrap();
    let second = lab.create_job_with_labels("o", ["a"]).await.unwrap();

    let script = OutcomeScript::new().failing(format!("job-{}", first));
    let mut executor = DryRunExecutor::new(lab.clone(), script);
    let results = executor.run_once().await.unwrap();

    assert_eq!(results.len(), 2);
    assert_eq!(results[0].status, StatusCode::Fail);
    assert_eq!(results[1].status, StatusCode::Good);

    let job = lab.get_job(first).await.unwrap();
    assert!(job.is_complete());
    assert_eq!(job.statuses()[0].status, StatusCode::Fail);
    assert!(lab.get_job(second).await.unwrap().is_complete());

    // Nothing left to run
    assert!(executor.run_once().await.unwrap().is_empty());
}
