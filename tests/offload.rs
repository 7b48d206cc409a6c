//! Offload path
//!
//! The action document handed to the dispatch tool, and the fallback to a
//! local build when capacity negotiation stalls, and the abort when it is
//! cancelled.

mod common;

use async_trait::async_trait;
use buildflow::offload::{sort_for_offload, WireDocument};
use buildflow::{
    Action, ActionGraph, ActionState, BuildExecutor, ExecutionMode, ExecutorConfig, FixedMemory,
    OffloadConfig, ResourceBroker, ResourceGrant, Result,
};
use common::{MockRunner, Pace};
use pretty_assertions::assert_eq;
use std::path::Path;
use std::sync::Arc;
use std::time::{Duration, Instant};

#[test]
fn test_wire_document_round_trip() {
    // 0 <- 1 <- 2, plus two independent actions
    let mut builder = ActionGraph::builder();
    let a = builder.add(Action::new("a", "/usr/bin/clang").args(["-c", "a.c"]).working_dir("/src"));
    let b = builder.add(Action::new("b", "/usr/bin/clang").args(["-c", "b.c"]).after(a));
    builder.add(Action::new("c", "/usr/bin/ld").args(["-o", "app", "a.o", "b.o"]).after(b));
    builder.add(Action::new("d", "/usr/bin/clang").args(["-c", "d.c"]));
    builder.add(Action::new("e", "/usr/bin/clang").args(["-c", "e.c"]));
    let graph = builder.build();

    let order = sort_for_offload(&graph, 3).unwrap();
    let document = WireDocument::from_graph(&graph, &order).unwrap();
    let text = String::from_utf8(document.to_json().unwrap()).unwrap();
    let parsed = WireDocument::parse(&text).unwrap();

    assert_eq!(parsed, document);
    assert!(parsed.is_ordered());
    let indices: Vec<usize> = parsed.actions.iter().map(|a| a.index).collect();
    assert_eq!(indices, vec![0, 1, 2, 3, 4]);
    let deps: Vec<Vec<usize>> = parsed.actions.iter().map(|a| a.dep.clone()).collect();
    assert_eq!(deps, vec![vec![], vec![0], vec![1], vec![], vec![]]);
    assert_eq!(parsed.actions[2].cmd, "/usr/bin/ld");
    assert_eq!(parsed.actions[0].workdir, "/src");

    let raw: serde_json::Value = serde_json::from_str(&text).unwrap();
    assert_eq!(raw["actions"][2]["index"], "2");
    assert_eq!(raw["actions"][2]["dep"], serde_json::json!(["1"]));
}

#[derive(Debug)]
struct StalledBroker;

#[async_trait]
impl ResourceBroker for StalledBroker {
    async fn request(&self, _toolchain_file: &Path) -> Result<ResourceGrant> {
        std::future::pending().await
    }
}

/// An offload setup with every tool present and a two-action clang graph.
struct StalledSetup {
    _tools: tempfile::TempDir,
    _bin: tempfile::TempDir,
    graph: ActionGraph,
    runner: Arc<MockRunner>,
    executor: BuildExecutor,
}

fn stalled_setup(negotiation_timeout_secs: u64) -> StalledSetup {
    let tools = tempfile::tempdir().unwrap();
    let offload = OffloadConfig {
        min_actions: Some(0),
        negotiation_timeout_secs,
        tool_dir: Some(tools.path().to_path_buf()),
        ..Default::default()
    };
    for name in [
        &offload.booster,
        &offload.apply_script,
        &offload.idle_loop,
        &offload.dispatch_tool,
        &offload.switch_file,
    ] {
        std::fs::write(tools.path().join(name), b"").unwrap();
    }

    // The toolchain manifest needs a compiler that exists on disk.
    let bin = tempfile::tempdir().unwrap();
    let clang = bin.path().join("clang");
    std::fs::write(&clang, b"").unwrap();

    let mut builder = ActionGraph::builder();
    let a = builder.add(Action::new("a", &clang).args(["-c", "a.c"]));
    builder.add(Action::new("b", &clang).args(["-c", "b.c"]).after(a));
    let graph = builder.build();

    let config = ExecutorConfig::builder().offload(offload).build().unwrap();
    let runner = Arc::new(MockRunner::new(Pace::Fixed(Duration::from_millis(2))));
    let executor = BuildExecutor::new(config)
        .memory_probe(Arc::new(FixedMemory::new(u64::MAX)))
        .max_slots(2)
        .runner(runner.clone())
        .broker(Arc::new(StalledBroker));
    StalledSetup {
        _tools: tools,
        _bin: bin,
        graph,
        runner,
        executor,
    }
}

#[tokio::test]
async fn test_stalled_negotiation_falls_back_to_local() {
    let setup = stalled_setup(1);

    let started = Instant::now();
    let report = setup.executor.execute(setup.graph).await.unwrap();

    assert!(started.elapsed() >= Duration::from_secs(1));
    assert_eq!(report.mode, ExecutionMode::Local);
    assert!(report.success);
    assert_eq!(report.succeeded, 2);
    assert_eq!(setup.runner.started(), vec!["a".to_string(), "b".to_string()]);
}

#[tokio::test]
async fn test_cancel_during_negotiation_aborts_without_local_build() {
    let setup = stalled_setup(70);
    let token = setup.executor.cancellation_token();
    tokio::spawn(async move {
        tokio::time::sleep(Duration::from_millis(20)).await;
        token.cancel();
    });

    let started = Instant::now();
    let report = setup.executor.execute(setup.graph).await.unwrap();

    assert!(started.elapsed() < Duration::from_secs(5));
    assert_eq!(report.mode, ExecutionMode::Aborted);
    assert!(report.interrupted);
    assert!(!report.success);
    assert_eq!(report.cancelled, 2);
    assert!(report
        .actions
        .iter()
        .all(|record| record.state == ActionState::Cancelled));
    assert!(setup.runner.started().is_empty());
}
