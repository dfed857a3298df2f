//! Run Engine Integration Tests
//!
//! Tests for run lifecycle, failure handling, admission and recovery.

mod common;

use std::sync::Arc;
use std::time::Duration;

use agentkit::core::{EventLog, JsonlEventLog, RunStore, INTERRUPTED_MESSAGE, MISSING_TERMINAL_MESSAGE};
use agentkit::{EchoAgent, Engine, EngineError, EventKind, InputValue, RunInputs, RunRecord, RunStatus};
use common::*;
use tempfile::TempDir;

#[tokio::test]
async fn test_simple_run_completes() {
    let temp = TempDir::new().unwrap();
    let engine = open_engine(
        &temp,
        ScriptAgent::new(vec![Step::Token("4"), Step::Final("4")]),
    )
    .await;

    let run_id = engine.create_run(task("2+2")).await.unwrap();
    let stream = engine.open_stream(run_id, 0).await.unwrap();

    let events = collect(stream).await;
    assert_eq!(
        events.iter().map(|e| e.kind.clone()).collect::<Vec<_>>(),
        vec![EventKind::token("4"), EventKind::final_result("4", vec![])]
    );
    assert_eq!(seqs(&events), vec![1, 2]);

    assert_eq!(engine.wait_for(run_id).await.unwrap(), RunStatus::Completed);
    let run = engine.get_run(run_id).await.unwrap();
    assert_eq!(run.status, RunStatus::Completed);
    assert!(run.started_at.is_some());
    assert!(run.finished_at.is_some());
    assert!(run.error.is_none());
    assert_eq!(run.inputs["task"].as_text(), Some("2+2"));
}

#[tokio::test]
async fn test_failure_after_tool_start() {
    let temp = TempDir::new().unwrap();
    let engine = open_engine(
        &temp,
        ScriptAgent::new(vec![Step::ToolStart("calculator"), Step::Fail("calculator exploded")]),
    )
    .await;

    let run_id = engine.create_run(task("2+2")).await.unwrap();
    let events = collect(engine.open_stream(run_id, 0).await.unwrap()).await;

    assert_eq!(kinds(&events), vec!["tool_start", "error"]);
    match &events[1].kind {
        EventKind::Error { message } => assert!(message.contains("calculator exploded")),
        other => panic!("expected error event, got {:?}", other),
    }

    assert_eq!(engine.wait_for(run_id).await.unwrap(), RunStatus::Failed);
    let run = engine.get_run(run_id).await.unwrap();
    assert!(run.error.unwrap().contains("calculator exploded"));
}

#[tokio::test]
async fn test_concurrent_runs_are_independent() {
    let temp = TempDir::new().unwrap();
    let agent = ScriptAgent::new(vec![
        Step::Token("a"),
        Step::Gate,
        Step::Token("b"),
        Step::Final("done"),
    ]);
    let gate = agent.gate();
    let engine = open_engine(&temp, agent).await;

    let first = engine.create_run(task("one")).await.unwrap();
    let second = engine.create_run(task("two")).await.unwrap();
    assert_ne!(first, second);

    // Both are parked at the gate at the same time
    wait_for_events(&engine, first, 1).await;
    wait_for_events(&engine, second, 1).await;
    assert_eq!(engine.active_runs(), 2);

    gate.add_permits(2);

    for run_id in [first, second] {
        let events = collect(engine.open_stream(run_id, 0).await.unwrap()).await;
        assert_eq!(seqs(&events), vec![1, 2, 3]);
        assert!(events.iter().all(|e| e.run_id == run_id));
        assert_eq!(events.iter().filter(|e| e.is_terminal()).count(), 1);
        assert!(events.last().unwrap().is_terminal());
    }
}

#[tokio::test]
async fn test_missing_terminal_is_synthesized() {
    let temp = TempDir::new().unwrap();
    let engine = open_engine(&temp, ScriptAgent::new(vec![Step::Token("partial")])).await;

    let run_id = engine.create_run(task("x")).await.unwrap();
    assert_eq!(engine.wait_for(run_id).await.unwrap(), RunStatus::Failed);

    let events = engine.read_log(run_id).await.unwrap();
    assert_eq!(
        events.last().map(|e| e.kind.clone()),
        Some(EventKind::error(MISSING_TERMINAL_MESSAGE))
    );
}

#[tokio::test]
async fn test_panic_is_contained() {
    let temp = TempDir::new().unwrap();
    let engine = open_engine(
        &temp,
        ScriptAgent::new(vec![Step::Token("about to"), Step::Panic("kaboom")]),
    )
    .await;

    let run_id = engine.create_run(task("x")).await.unwrap();
    assert_eq!(engine.wait_for(run_id).await.unwrap(), RunStatus::Failed);

    let run = engine.get_run(run_id).await.unwrap();
    let error = run.error.unwrap();
    assert!(error.contains("panicked"));
    assert!(error.contains("kaboom"));

    // The engine keeps serving other runs
    let next = engine.create_run(task("y")).await.unwrap();
    assert_eq!(engine.wait_for(next).await.unwrap(), RunStatus::Failed);
}

#[tokio::test]
async fn test_emit_after_terminal_not_persisted() {
    let temp = TempDir::new().unwrap();
    let engine = open_engine(
        &temp,
        ScriptAgent::new(vec![Step::Final("done"), Step::Token("too late")]),
    )
    .await;

    let run_id = engine.create_run(task("x")).await.unwrap();
    assert_eq!(engine.wait_for(run_id).await.unwrap(), RunStatus::Completed);

    let events = engine.read_log(run_id).await.unwrap();
    assert_eq!(kinds(&events), vec!["final"]);
}

#[tokio::test]
async fn test_unpaired_tool_end_fails_run() {
    let temp = TempDir::new().unwrap();
    let engine = open_engine(&temp, ScriptAgent::new(vec![Step::ToolEnd("search")])).await;

    let run_id = engine.create_run(task("x")).await.unwrap();
    assert_eq!(engine.wait_for(run_id).await.unwrap(), RunStatus::Failed);

    let events = engine.read_log(run_id).await.unwrap();
    assert_eq!(kinds(&events), vec!["error"]);
}

#[tokio::test]
async fn test_invalid_input_creates_nothing() {
    let temp = TempDir::new().unwrap();
    let mut config = test_config(&temp);
    config.inputs.required = vec!["task".to_string()];
    let engine = Engine::open(config, Arc::new(EchoAgent::new())).await.unwrap();

    for bad in [RunInputs::new(), inputs(&[("other", "x")]), task("   ")] {
        let result = engine.create_run(bad).await;
        assert!(matches!(result, Err(EngineError::InvalidInput(_))));
    }

    assert!(engine.list_runs(10).await.unwrap().is_empty());
    assert_eq!(engine.active_runs(), 0);
}

#[tokio::test]
async fn test_unavailable_after_shutdown() {
    let temp = TempDir::new().unwrap();
    let agent = ScriptAgent::new(vec![Step::Gate, Step::Final("done")]);
    let gate = agent.gate();
    let engine = Arc::new(open_engine(&temp, agent).await);

    let run_id = engine.create_run(task("x")).await.unwrap();

    let shutdown = {
        let engine = engine.clone();
        tokio::spawn(async move { engine.shutdown().await })
    };

    // Refused as soon as shutdown begins
    tokio::time::sleep(Duration::from_millis(50)).await;
    assert!(!engine.is_accepting());
    assert!(matches!(
        engine.create_run(task("y")).await,
        Err(EngineError::EngineUnavailable(_))
    ));

    // Active runs are allowed to finish within the grace period
    gate.add_permits(1);
    assert!(shutdown.await.unwrap());
    assert_eq!(engine.wait_for(run_id).await.unwrap(), RunStatus::Completed);
}

#[tokio::test]
async fn test_max_active_runs() {
    let temp = TempDir::new().unwrap();
    let agent = ScriptAgent::new(vec![Step::Gate, Step::Final("done")]);
    let gate = agent.gate();
    let mut config = test_config(&temp);
    config.engine.max_active_runs = 1;
    let engine = Engine::open(config, Arc::new(agent)).await.unwrap();

    let first = engine.create_run(task("a")).await.unwrap();
    assert!(matches!(
        engine.create_run(task("b")).await,
        Err(EngineError::EngineUnavailable(_))
    ));

    gate.add_permits(1);
    engine.wait_for(first).await.unwrap();

    let second = engine.create_run(task("c")).await.unwrap();
    gate.add_permits(1);
    assert_eq!(engine.wait_for(second).await.unwrap(), RunStatus::Completed);
}

#[tokio::test]
async fn test_storage_failure_fails_run_only() {
    let temp = TempDir::new().unwrap();
    let config = test_config(&temp);
    // First append succeeds, everything after fails
    let log = Arc::new(FailingLog::new(JsonlEventLog::new(config.runs_dir()), 1));
    let agent = ScriptAgent::new(vec![Step::Token("one"), Step::Token("two"), Step::Final("done")]);
    let engine = Engine::open_with_log(config, Arc::new(agent), log).await.unwrap();

    let run_id = engine.create_run(task("x")).await.unwrap();
    assert_eq!(engine.wait_for(run_id).await.unwrap(), RunStatus::Failed);

    let run = engine.get_run(run_id).await.unwrap();
    assert!(run.error.unwrap().contains("disk full"));

    // Only the durable prefix is visible; no terminal could be written
    let events = engine.read_log(run_id).await.unwrap();
    assert_eq!(kinds(&events), vec!["token"]);
}

#[tokio::test]
async fn test_second_engine_on_same_data_dir_refused() {
    let temp = TempDir::new().unwrap();
    let _engine = open_engine(&temp, EchoAgent::new()).await;

    let second = Engine::open(test_config(&temp), Arc::new(EchoAgent::new())).await;
    assert!(matches!(second, Err(EngineError::EngineUnavailable(_))));
}

#[tokio::test]
async fn test_recovery_after_restart() {
    let temp = TempDir::new().unwrap();
    let config = test_config(&temp);
    std::fs::create_dir_all(&config.data_dir).unwrap();

    // Simulate a previous process that died mid-run
    let store = RunStore::open(&config.database_path()).unwrap();
    let log = JsonlEventLog::new(config.runs_dir());

    let mut interrupted = RunRecord::new(task("a"));
    interrupted.status = RunStatus::Running;
    store.insert_run(&interrupted).await.unwrap();
    log.append(interrupted.id, EventKind::token("half")).await.unwrap();

    let mut finished = RunRecord::new(task("b"));
    finished.status = RunStatus::Running;
    store.insert_run(&finished).await.unwrap();
    log.append(finished.id, EventKind::final_result("all done", vec![]))
        .await
        .unwrap();

    let never_started = RunRecord::new(task("c"));
    store.insert_run(&never_started).await.unwrap();
    drop(store);

    let engine = Engine::open(config, Arc::new(EchoAgent::new())).await.unwrap();

    let run = engine.get_run(interrupted.id).await.unwrap();
    assert_eq!(run.status, RunStatus::Failed);
    assert_eq!(run.error.as_deref(), Some(INTERRUPTED_MESSAGE));
    let events = engine.read_log(interrupted.id).await.unwrap();
    assert_eq!(seqs(&events), vec![1, 2]);
    assert_eq!(events[1].kind, EventKind::error(INTERRUPTED_MESSAGE));

    let run = engine.get_run(finished.id).await.unwrap();
    assert_eq!(run.status, RunStatus::Completed);
    assert_eq!(engine.read_log(finished.id).await.unwrap().len(), 1);

    let run = engine.get_run(never_started.id).await.unwrap();
    assert_eq!(run.status, RunStatus::Failed);

    // Archived runs still stream their full history
    let events = collect(engine.open_stream(interrupted.id, 0).await.unwrap()).await;
    assert_eq!(kinds(&events), vec!["token", "error"]);
}

#[tokio::test]
async fn test_echo_agent_writes_artifact() {
    let temp = TempDir::new().unwrap();
    let engine = open_engine(&temp, EchoAgent::new()).await;

    let run_id = engine.create_run(task("hello world")).await.unwrap();
    let events = collect(engine.open_stream(run_id, 0).await.unwrap()).await;

    assert_eq!(kinds(&events), vec!["tool_start", "token", "tool_end", "final"]);
    match &events[3].kind {
        EventKind::Final { text, artifacts } => {
            assert_eq!(text, "hello world");
            assert_eq!(artifacts.len(), 1);
            assert_eq!(artifacts[0].name, "response.md");
            let content = std::fs::read_to_string(&artifacts[0].path).unwrap();
            assert!(content.contains("hello world"));
        }
        other => panic!("expected final event, got {:?}", other),
    }
}

#[tokio::test]
async fn test_uploaded_file_as_input() {
    let temp = TempDir::new().unwrap();
    let engine = open_engine(&temp, EchoAgent::new()).await;

    let file = engine.save_upload("notes.txt", "text/plain", b"some notes").await.unwrap();
    assert_eq!(engine.list_uploads().await.unwrap().len(), 1);

    let mut run_inputs = task("summarize");
    run_inputs.insert("files".to_string(), InputValue::Files(vec![file.clone()]));
    let run_id = engine.create_run(run_inputs).await.unwrap();
    assert_eq!(engine.wait_for(run_id).await.unwrap(), RunStatus::Completed);

    let events = engine.read_log(run_id).await.unwrap();
    match &events[0].kind {
        EventKind::ToolStart { input, .. } => assert_eq!(input["files"][0], "notes.txt"),
        other => panic!("expected tool_start, got {:?}", other),
    }

    assert!(matches!(
        engine.save_upload("server.pem", "", b"-----BEGIN").await,
        Err(EngineError::InvalidInput(_))
    ));
}

#[tokio::test]
async fn test_unknown_run() {
    let temp = TempDir::new().unwrap();
    let engine = open_engine(&temp, EchoAgent::new()).await;
    let run_id = uuid::Uuid::new_v4();

    assert!(matches!(engine.get_run(run_id).await, Err(EngineError::RunNotFound(_))));
    assert!(matches!(engine.read_log(run_id).await, Err(EngineError::RunNotFound(_))));
    assert!(matches!(engine.wait_for(run_id).await, Err(EngineError::RunNotFound(_))));
}

#[tokio::test]
async fn test_finished_runs_leave_memory() {
    let temp = TempDir::new().unwrap();
    let engine = open_engine(
        &temp,
        ScriptAgent::new(vec![Step::Token("4"), Step::Final("4")]),
    )
    .await;

    let mut run_ids = Vec::new();
    for _ in 0..5 {
        let run_id = engine.create_run(task("2+2")).await.unwrap();
        engine.wait_for(run_id).await.unwrap();
        run_ids.push(run_id);
    }

    // Eviction follows the terminal status write to the store
    let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
    while engine.tracked_runs() > 0 {
        assert!(tokio::time::Instant::now() < deadline, "runs still held in memory");
        tokio::time::sleep(Duration::from_millis(10)).await;
    }

    for run_id in run_ids {
        let run = engine.get_run(run_id).await.unwrap();
        assert_eq!(run.status, RunStatus::Completed);
        assert!(run.finished_at.is_some());
        assert_eq!(engine.wait_for(run_id).await.unwrap(), RunStatus::Completed);

        let events = collect(engine.open_stream(run_id, 0).await.unwrap()).await;
        assert_eq!(kinds(&events), vec!["token", "final"]);
    }
}
