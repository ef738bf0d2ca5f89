mod common;

use std::sync::Arc;
use std::time::Duration;

use common::{FakeOracle, FakePage, Harness, RecordingStore, act, click, give_up, shop_page};
use page_agent::agent::{AgentEvent, AgentHandle, LoopExit};
use page_agent::brain::OracleDecision;
use page_agent::config::AgentConfig;
use page_agent::error::{BreakReason, OracleError};
use page_agent::state::{PersistedSnapshot, TaskState, TaskStatus, now_millis};
use page_agent::store::{KeyValueStore, MemoryStore, SNAPSHOT_KEY, SnapshotStore};
use page_agent::types::{ActionDecision, ActionKind, ActionOutcome};
use tokio::time::{Instant, sleep};

fn snapshot_present(kv: &Arc<dyn KeyValueStore>) -> bool {
    kv.get(SNAPSHOT_KEY).unwrap().is_some()
}

#[tokio::test(start_paused = true)]
async fn click_then_complete() {
    let mut h = Harness::new(shop_page(), FakeOracle::replying(vec![click(1)]));

    let exit = h.agent.run("open the cart").await;

    assert_eq!(exit, LoopExit::Completed);
    assert_eq!(h.agent.task().status(), &TaskStatus::Completed);
    assert_eq!(h.agent.task().current_step(), 1);
    assert_eq!(h.agent.page().clicks(), vec!["1:1".to_string()]);
    assert!(!snapshot_present(&h.kv));
    assert!(!h.agent.handle().is_busy());

    let events = h.drain();
    assert!(events.contains(&AgentEvent::Target {
        description: "🎯 Target [1]: <BUTTON> \"Cart\"".into()
    }));
    assert!(events.iter().any(|e| matches!(
        e,
        AgentEvent::Step {
            number: 1,
            success: true,
            ..
        }
    )));
    assert!(events.contains(&AgentEvent::TaskComplete {
        summary: "✅ Goal reached!".into()
    }));
    assert_eq!(events.last(), Some(&AgentEvent::Ready));
}

#[tokio::test(start_paused = true)]
async fn oracle_context_reflects_history() {
    let mut h = Harness::new(shop_page(), FakeOracle::replying(vec![click(1)]));
    h.agent.run("open the cart").await;

    let contexts = h.agent.oracle().contexts();
    assert_eq!(contexts.len(), 2);
    assert_eq!(contexts[0].goal, "open the cart");
    assert_eq!(contexts[0].elements.len(), 3);
    assert_eq!(contexts[0].page.title, "Test Shop");
    assert!(contexts[0].history.is_empty());
    assert_eq!(contexts[1].step, 1);
    assert_eq!(contexts[1].history.len(), 1);
    assert!(contexts[1].history[0].success);
}

#[tokio::test(start_paused = true)]
async fn oracle_calls_are_spaced_by_the_minimum_delay() {
    let mut h = Harness::new(shop_page(), FakeOracle::replying(vec![click(0), click(1)]));
    let start = Instant::now();
    h.agent.run("browse").await;
    // Two actions, each followed by at least the 500ms settle; three calls
    // need two gaps of at least one second.
    assert!(start.elapsed() >= Duration::from_secs(2));
}

#[tokio::test(start_paused = true)]
async fn oracle_may_give_up() {
    let mut h = Harness::new(
        shop_page(),
        FakeOracle::replying(vec![give_up("no login form on this page")]),
    );

    let exit = h.agent.run("log in").await;

    assert_eq!(exit, LoopExit::GaveUp("no login form on this page".into()));
    assert!(h.drain().contains(&AgentEvent::TaskError {
        message: "❌ no login form on this page".into()
    }));
    assert!(!snapshot_present(&h.kv));
}

#[tokio::test(start_paused = true)]
async fn repeated_malformed_replies_trip_the_attempt_breaker() {
    let malformed = || -> Result<OracleDecision, OracleError> {
        Err(OracleError::Malformed("missing isComplete".into()))
    };
    let mut h = Harness::new(
        shop_page(),
        FakeOracle::replying(vec![malformed(), malformed(), malformed(), click(0)]),
    );

    let exit = h.agent.run("anything").await;

    assert_eq!(exit, LoopExit::Broken(BreakReason::MaxAttempts { limit: 3 }));
    assert_eq!(h.agent.oracle().calls(), 3);
    assert_eq!(h.agent.task().errors().len(), 3);
    assert!(h.agent.page().clicks().is_empty());
    assert!(!snapshot_present(&h.kv));
}

#[tokio::test(start_paused = true)]
async fn step_limit_stops_a_wandering_task() {
    let mut config = AgentConfig::default();
    config.limits.max_steps = 2;
    let mut h = Harness::with(
        shop_page(),
        FakeOracle::replying(vec![click(0), click(1), click(2)]),
        config,
        Arc::new(MemoryStore::default()),
    );

    let exit = h.agent.run("wander").await;

    assert_eq!(exit, LoopExit::Broken(BreakReason::MaxSteps { limit: 2 }));
    assert_eq!(h.agent.oracle().calls(), 2);
    assert!(matches!(
        h.agent.task().status(),
        TaskStatus::CircuitBroken(BreakReason::MaxSteps { .. })
    ));
}

#[tokio::test(start_paused = true)]
async fn rate_limit_cools_down_without_costing_an_attempt() {
    let mut h = Harness::new(
        shop_page(),
        FakeOracle::replying(vec![Err(OracleError::RateLimited)]),
    );
    let start = Instant::now();

    let exit = h.agent.run("open the cart").await;

    assert_eq!(exit, LoopExit::Completed);
    assert!(start.elapsed() >= Duration::from_secs(5));
    assert!(h.agent.task().errors().is_empty());
    assert_eq!(h.agent.oracle().calls(), 2);
    assert!(h.drain().contains(&AgentEvent::Notice {
        message: "⚠️ Rate limit reached. Waiting...".into()
    }));
}

#[tokio::test(start_paused = true)]
async fn missing_credential_ends_the_task() {
    let mut h = Harness::new(
        shop_page(),
        FakeOracle::replying(vec![Err(OracleError::CredentialMissing), click(0)]),
    );

    let exit = h.agent.run("open the cart").await;

    assert!(matches!(exit, LoopExit::Fatal(_)));
    assert_eq!(h.agent.oracle().calls(), 1);
    assert_eq!(h.agent.task().status(), &TaskStatus::Idle);
    assert!(!snapshot_present(&h.kv));
    assert!(h.drain().contains(&AgentEvent::TaskError {
        message: "❌ API key not configured.".into()
    }));
}

#[tokio::test(start_paused = true)]
async fn unreachable_or_rejecting_provider_ends_the_task() {
    for (failure, message) in [
        (
            OracleError::Network("connection refused".into()),
            "❌ Connection error.",
        ),
        (OracleError::CredentialInvalid, "❌ API key is not valid."),
    ] {
        let mut h = Harness::new(shop_page(), FakeOracle::replying(vec![Err(failure), click(0)]));

        let exit = h.agent.run("open the cart").await;

        assert!(matches!(exit, LoopExit::Fatal(_)));
        assert_eq!(h.agent.oracle().calls(), 1);
        assert!(h.agent.page().clicks().is_empty());
        assert_eq!(h.agent.task().status(), &TaskStatus::Idle);
        assert!(!snapshot_present(&h.kv));
        assert!(h.drain().contains(&AgentEvent::TaskError {
            message: message.into()
        }));
    }
}

#[tokio::test(start_paused = true)]
async fn error_action_without_completion_costs_an_attempt() {
    let stuck = ActionDecision::new(ActionKind::Error).with_reasoning("captcha in the way");
    let mut h = Harness::new(shop_page(), FakeOracle::replying(vec![act(stuck)]));

    let exit = h.agent.run("check out").await;

    assert_eq!(exit, LoopExit::Completed);
    let contexts = h.agent.oracle().contexts();
    assert_eq!(contexts.len(), 2);
    assert_eq!(contexts[1].attempts, 1);
    let last = contexts[1].last_result.as_ref().unwrap();
    assert_eq!(last.error(), Some("captcha in the way"));
    assert!(h.drain().contains(&AgentEvent::StepError {
        message: "captcha in the way".into()
    }));
}

#[tokio::test(start_paused = true)]
async fn successful_action_clears_earlier_failures() {
    let malformed = || -> Result<OracleDecision, OracleError> {
        Err(OracleError::Malformed("missing isComplete".into()))
    };
    let mut h = Harness::new(
        shop_page(),
        FakeOracle::replying(vec![malformed(), malformed(), click(1)]),
    );

    let exit = h.agent.run("open the cart").await;

    assert_eq!(exit, LoopExit::Completed);
    let attempts: Vec<u32> = h
        .agent
        .oracle()
        .contexts()
        .iter()
        .map(|c| c.attempts)
        .collect();
    assert_eq!(attempts, vec![0, 1, 2, 0]);
    assert_eq!(h.agent.task().attempts(), 0);
}

#[tokio::test(start_paused = true)]
async fn resumed_task_past_its_deadline_trips_the_timeout() {
    let kv: Arc<dyn KeyValueStore> = Arc::new(MemoryStore::default());
    let config = AgentConfig::default();
    let store = SnapshotStore::new(kv.clone(), config.snapshot_freshness());
    store.save(&PersistedSnapshot {
        running: true,
        goal: "fill the long form".into(),
        current_step: 4,
        attempts: 0,
        start_time: now_millis() - 400_000,
        completed_actions: Vec::new(),
        errors: Vec::new(),
        pending_action: None,
        saved_at: now_millis(),
    });

    let mut h = Harness::with(shop_page(), FakeOracle::default(), config, kv);
    let exit = h.agent.resume().await;

    assert_eq!(
        exit,
        Some(LoopExit::Broken(BreakReason::Timeout {
            limit: Duration::from_secs(300)
        }))
    );
    assert_eq!(h.agent.oracle().calls(), 0);
    assert!(!snapshot_present(&h.kv));
    assert!(h.drain().contains(&AgentEvent::TaskError {
        message: "⚠️ Timeout: exceeded 300 seconds".into()
    }));
}

#[tokio::test(start_paused = true)]
async fn empty_page_ends_without_asking_the_oracle() {
    let mut h = Harness::new(FakePage::default(), FakeOracle::default());

    let exit = h.agent.run("do something").await;

    assert_eq!(exit, LoopExit::NoElements);
    assert_eq!(h.agent.oracle().calls(), 0);
    assert!(!snapshot_present(&h.kv));
}

#[tokio::test(start_paused = true)]
async fn stop_lets_the_in_flight_action_finish() {
    let handle = AgentHandle::default();
    let oracle = FakeOracle::replying(vec![click(1), click(2)]).stopping(handle.clone());
    let store = Arc::new(RecordingStore::default());
    let mut h = Harness::with(shop_page(), oracle, AgentConfig::default(), store.clone());
    h.agent = h.agent.with_handle(handle);

    let exit = h.agent.run("open the cart").await;

    assert_eq!(exit, LoopExit::Broken(BreakReason::Stopped));
    assert_eq!(h.agent.page().clicks(), vec!["1:1".to_string()]);
    assert_eq!(h.agent.oracle().calls(), 1);
    assert_eq!(h.agent.task().status(), &TaskStatus::Stopped);
    assert!(!snapshot_present(&h.kv));
    assert!(h.agent.resume().await.is_none());

    // The in-flight click must not write the snapshot back after the stop.
    let writes = store.writes();
    let stopped_at = writes.iter().position(|w| *w == "remove").unwrap();
    assert!(!writes[stopped_at..].contains(&"set"));
}

#[tokio::test(start_paused = true)]
async fn stop_request_discards_the_snapshot_at_once() {
    let kv: Arc<dyn KeyValueStore> = Arc::new(MemoryStore::default());
    let config = AgentConfig::default();
    {
        let store = SnapshotStore::new(kv.clone(), config.snapshot_freshness());
        let mut previous = TaskState::new(config.task_limits(), store);
        previous.initiate("add the book to the cart");
    }
    let mut h = Harness::with(shop_page(), FakeOracle::default(), config, kv);
    assert!(snapshot_present(&h.kv));

    h.agent.handle().request_stop();

    assert!(!snapshot_present(&h.kv));
    assert_eq!(h.agent.resume().await, None);
    assert_eq!(h.agent.oracle().calls(), 0);
}

#[tokio::test(start_paused = true)]
async fn interrupted_run_leaves_nothing_to_resume() {
    let kv: Arc<dyn KeyValueStore> = Arc::new(MemoryStore::default());
    let oracle = FakeOracle::replying(vec![click(0), click(1), click(2)]);
    let mut h = Harness::with(shop_page(), oracle, AgentConfig::default(), kv.clone());
    let handle = h.agent.handle();

    tokio::select! {
        _ = h.agent.run("wander") => panic!("the run should outlast the interrupt"),
        _ = sleep(Duration::from_millis(1500)) => {}
    }
    assert!(snapshot_present(&kv));
    handle.request_stop();
    assert!(!snapshot_present(&kv));

    let mut next = Harness::with(shop_page(), FakeOracle::default(), AgentConfig::default(), kv);
    assert_eq!(next.agent.resume().await, None);
    assert_eq!(next.agent.oracle().calls(), 0);
}

#[tokio::test(start_paused = true)]
async fn navigation_mid_click_promotes_the_pending_action() {
    let page = shop_page();
    page.navigate_on_next_click();
    let mut h = Harness::new(page, FakeOracle::replying(vec![click(2)]));

    let exit = h.agent.run("check out").await;

    assert_eq!(exit, LoopExit::Completed);
    assert_eq!(h.agent.task().current_step(), 1);
    let promoted = &h.agent.task().completed_actions()[0];
    assert!(matches!(
        promoted.result.outcome,
        ActionOutcome::Assumed { .. }
    ));

    let contexts = h.agent.oracle().contexts();
    assert_eq!(contexts.len(), 2);
    assert!(contexts[1].resumed);
    assert!(contexts[1].last_result.as_ref().is_some_and(|r| r.success));

    let events = h.drain();
    assert!(events.contains(&AgentEvent::Resumed {
        goal: "check out".into(),
        step: 2
    }));
}

#[tokio::test(start_paused = true)]
async fn reload_note_is_dropped_after_the_next_step() {
    let page = shop_page();
    page.navigate_on_next_click();
    let mut h = Harness::new(page, FakeOracle::replying(vec![click(2), click(9)]));

    let exit = h.agent.run("check out").await;

    assert_eq!(exit, LoopExit::Completed);
    let contexts = h.agent.oracle().contexts();
    assert_eq!(contexts.len(), 3);
    assert!(!contexts[0].resumed);
    assert!(contexts[1].resumed);
    assert!(!contexts[2].resumed);
    assert!(contexts[2].last_result.as_ref().is_some_and(|r| !r.success));
    assert_eq!(contexts[2].attempts, 1);
}

#[tokio::test(start_paused = true)]
async fn startup_resumes_a_fresh_snapshot() {
    let kv: Arc<dyn KeyValueStore> = Arc::new(MemoryStore::default());
    let config = AgentConfig::default();
    {
        let store = SnapshotStore::new(kv.clone(), config.snapshot_freshness());
        let mut previous = TaskState::new(config.task_limits(), store);
        previous.initiate("add the book to the cart");
        previous.mark_pending(&ActionDecision::click(1).with_reasoning("add to cart"));
    }

    let mut h = Harness::with(shop_page(), FakeOracle::default(), config, kv);
    let exit = h.agent.resume().await;

    assert_eq!(exit, Some(LoopExit::Completed));
    let contexts = h.agent.oracle().contexts();
    assert_eq!(contexts[0].goal, "add the book to the cart");
    assert_eq!(contexts[0].step, 1);
    assert!(contexts[0].resumed);
    assert_eq!(contexts[0].history.len(), 1);
    assert!(h.agent.page().clicks().is_empty());
    assert!(!snapshot_present(&h.kv));

    assert_eq!(h.agent.resume().await, None);
}

#[tokio::test(start_paused = true)]
async fn debug_command_lists_elements_without_the_oracle() {
    let mut h = Harness::new(shop_page(), FakeOracle::default());

    let LoopExit::DebugReport(report) = h.agent.run("/debug cart").await else {
        panic!("expected a debug report");
    };

    assert!(report.contains("Total elements: 3"));
    assert!(report.contains("Filtered by \"cart\": 1"));
    assert!(report.contains("[1] BUTTON \"Cart\""));
    assert!(!report.contains("Checkout"));
    assert_eq!(h.agent.oracle().calls(), 0);
    assert_eq!(h.agent.task().status(), &TaskStatus::Idle);
}
