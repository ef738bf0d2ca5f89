#![allow(dead_code)]

use std::collections::VecDeque;
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use page_agent::agent::{Agent, AgentEvent, AgentHandle};
use page_agent::brain::{DecisionContext, Oracle, OracleDecision};
use page_agent::config::AgentConfig;
use page_agent::error::{OracleError, PageError, StoreError};
use page_agent::page::{
    ChangeSource, Delivery, Discovery, Page, PageIdentity, Relation, ScannedNode, SyntheticEvent,
    Viewport,
};
use page_agent::stabilize::Silent;
use page_agent::store::{KeyValueStore, MemoryStore};
use page_agent::types::{ActionDecision, ActionKind, ElementHandle, Rect};
use serde_json::Value;
use tokio::sync::broadcast;

#[derive(Debug, Clone, PartialEq)]
pub enum Call {
    Highlight(String),
    Dispatch(String, &'static str),
    Focus(String),
    Click(String),
    Commit(String, String),
    Reveal(String),
}

#[derive(Default)]
struct Inner {
    current: Vec<ScannedNode>,
    upcoming: VecDeque<Vec<ScannedNode>>,
    generation: u64,
    scans: usize,
    calls: Vec<Call>,
    navigate_on_click: bool,
}

/// Scripted page. Each scan shows the next queued screen, or the current one
/// again when nothing is queued.
#[derive(Default)]
pub struct FakePage {
    inner: Mutex<Inner>,
}

impl FakePage {
    pub fn with_nodes(nodes: Vec<ScannedNode>) -> Self {
        let page = Self::default();
        page.lock().current = nodes;
        page
    }

    pub fn then_show(&self, nodes: Vec<ScannedNode>) {
        self.lock().upcoming.push_back(nodes);
    }

    /// The next native click destroys the execution context.
    pub fn navigate_on_next_click(&self) {
        self.lock().navigate_on_click = true;
    }

    pub fn scans(&self) -> usize {
        self.lock().scans
    }

    pub fn calls(&self) -> Vec<Call> {
        self.lock().calls.clone()
    }

    pub fn clicks(&self) -> Vec<String> {
        self.calls()
            .into_iter()
            .filter_map(|c| match c {
                Call::Click(token) => Some(token),
                _ => None,
            })
            .collect()
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Inner> {
        self.inner.lock().unwrap()
    }

    fn touch(&self, handle: &ElementHandle, call: Call) -> Result<(), PageError> {
        let mut inner = self.lock();
        if handle.generation != inner.generation {
            return Err(PageError::StaleHandle(handle.token.clone()));
        }
        inner.calls.push(call);
        Ok(())
    }
}

#[async_trait]
impl Page for FakePage {
    async fn identity(&self) -> Result<PageIdentity, PageError> {
        Ok(PageIdentity {
            title: "Test Shop".into(),
            url: "https://shop.test/".into(),
            description: "A shop for tests".into(),
        })
    }

    async fn discover(&self, _selector: &str, generation: u64) -> Result<Discovery, PageError> {
        let mut inner = self.lock();
        inner.generation = generation;
        inner.scans += 1;
        if let Some(next) = inner.upcoming.pop_front() {
            inner.current = next;
        }
        Ok(Discovery {
            viewport: Viewport {
                width: 1280.0,
                height: 800.0,
            },
            nodes: inner.current.clone(),
        })
    }

    async fn text_blocks(&self) -> Result<Vec<String>, PageError> {
        Ok(vec!["Welcome to the test shop".into()])
    }

    async fn highlight(&self, handle: &ElementHandle) -> Result<(), PageError> {
        self.touch(handle, Call::Highlight(handle.token.clone()))
    }

    async fn dispatch(
        &self,
        handle: &ElementHandle,
        event: SyntheticEvent,
    ) -> Result<Delivery, PageError> {
        self.touch(handle, Call::Dispatch(handle.token.clone(), event.primary))?;
        Ok(Delivery::Full)
    }

    async fn focus(&self, handle: &ElementHandle) -> Result<(), PageError> {
        self.touch(handle, Call::Focus(handle.token.clone()))
    }

    async fn native_click(&self, handle: &ElementHandle) -> Result<(), PageError> {
        self.touch(handle, Call::Click(handle.token.clone()))?;
        let mut inner = self.lock();
        if inner.navigate_on_click {
            inner.navigate_on_click = false;
            return Err(PageError::Navigated);
        }
        Ok(())
    }

    async fn commit_text(&self, handle: &ElementHandle, text: &str) -> Result<(), PageError> {
        self.touch(handle, Call::Commit(handle.token.clone(), text.to_string()))
    }

    async fn relatives(
        &self,
        handle: &ElementHandle,
        relation: Relation,
    ) -> Result<Vec<ElementHandle>, PageError> {
        if relation != Relation::Parent {
            return Ok(Vec::new());
        }
        Ok(vec![ElementHandle {
            generation: handle.generation,
            token: format!("{}:r0", handle.generation),
        }])
    }

    async fn reveal(&self, handle: &ElementHandle, _classes: &[&str]) -> Result<(), PageError> {
        self.touch(handle, Call::Reveal(handle.token.clone()))
    }

    async fn observe_changes(&self) -> Result<Box<dyn ChangeSource>, PageError> {
        Ok(Box::new(Silent))
    }
}

fn node(slot: usize, tag: &str, text: &str) -> ScannedNode {
    ScannedNode {
        slot,
        tag: tag.into(),
        direct_text: Some(text.into()),
        text_content: Some(text.into()),
        rect: Rect {
            left: 20.0,
            top: 10.0 + 40.0 * slot as f64,
            width: 120.0,
            height: 30.0,
        },
        display: "block".into(),
        visibility: "visible".into(),
        opacity: 1.0,
        ..ScannedNode::default()
    }
}

pub fn button(slot: usize, text: &str) -> ScannedNode {
    node(slot, "BUTTON", text)
}

pub fn link(slot: usize, text: &str) -> ScannedNode {
    node(slot, "A", text)
}

pub fn text_input(slot: usize, placeholder: &str) -> ScannedNode {
    ScannedNode {
        input_type: Some("text".into()),
        placeholder: Some(placeholder.into()),
        direct_text: None,
        text_content: None,
        ..node(slot, "INPUT", "")
    }
}

pub fn shop_page() -> FakePage {
    FakePage::with_nodes(vec![
        link(0, "Home"),
        button(1, "Cart"),
        button(2, "Checkout"),
    ])
}

/// Replays scripted replies; once they run out it declares the goal reached.
#[derive(Default)]
pub struct FakeOracle {
    replies: Mutex<VecDeque<Result<OracleDecision, OracleError>>>,
    seen: Mutex<Vec<DecisionContext>>,
    stop_on_first_call: Mutex<Option<AgentHandle>>,
}

impl FakeOracle {
    pub fn replying(replies: Vec<Result<OracleDecision, OracleError>>) -> Self {
        Self {
            replies: Mutex::new(replies.into()),
            ..Self::default()
        }
    }

    /// Request a stop while the first decision is in flight.
    pub fn stopping(self, handle: AgentHandle) -> Self {
        *self.stop_on_first_call.lock().unwrap() = Some(handle);
        self
    }

    pub fn contexts(&self) -> Vec<DecisionContext> {
        self.seen.lock().unwrap().clone()
    }

    pub fn calls(&self) -> usize {
        self.seen.lock().unwrap().len()
    }
}

#[async_trait]
impl Oracle for FakeOracle {
    async fn decide(&self, context: &DecisionContext) -> Result<OracleDecision, OracleError> {
        self.seen.lock().unwrap().push(context.clone());
        if let Some(handle) = self.stop_on_first_call.lock().unwrap().take() {
            handle.request_stop();
        }
        self.replies
            .lock()
            .unwrap()
            .pop_front()
            .unwrap_or_else(|| Ok(done()))
    }
}

pub fn act(action: ActionDecision) -> Result<OracleDecision, OracleError> {
    Ok(OracleDecision {
        thought: String::new(),
        action: Some(action),
        expectation: None,
        is_complete: false,
    })
}

pub fn click(index: usize) -> Result<OracleDecision, OracleError> {
    act(ActionDecision::click(index).with_reasoning(format!("press element {index}")))
}

pub fn done() -> OracleDecision {
    OracleDecision {
        thought: "goal reached".into(),
        action: Some(ActionDecision::new(ActionKind::None)),
        expectation: None,
        is_complete: true,
    }
}

pub fn give_up(reason: &str) -> Result<OracleDecision, OracleError> {
    Ok(OracleDecision {
        thought: String::new(),
        action: Some(ActionDecision::new(ActionKind::Error).with_reasoning(reason)),
        expectation: None,
        is_complete: true,
    })
}

/// In-memory store that also logs each write as `set` or `remove`.
#[derive(Default)]
pub struct RecordingStore {
    inner: MemoryStore,
    writes: Mutex<Vec<&'static str>>,
}

impl RecordingStore {
    pub fn writes(&self) -> Vec<&'static str> {
        self.writes.lock().unwrap().clone()
    }
}

impl KeyValueStore for RecordingStore {
    fn get(&self, key: &str) -> Result<Option<Value>, StoreError> {
        self.inner.get(key)
    }

    fn set(&self, key: &str, value: Value) -> Result<(), StoreError> {
        self.writes.lock().unwrap().push("set");
        self.inner.set(key, value)
    }

    fn remove(&self, key: &str) -> Result<(), StoreError> {
        self.writes.lock().unwrap().push("remove");
        self.inner.remove(key)
    }
}

pub struct Harness {
    pub agent: Agent<FakePage, FakeOracle>,
    pub events: broadcast::Receiver<AgentEvent>,
    pub kv: Arc<dyn KeyValueStore>,
}

impl Harness {
    pub fn new(page: FakePage, oracle: FakeOracle) -> Self {
        Self::with(page, oracle, AgentConfig::default(), Arc::new(MemoryStore::default()))
    }

    pub fn with(
        page: FakePage,
        oracle: FakeOracle,
        config: AgentConfig,
        kv: Arc<dyn KeyValueStore>,
    ) -> Self {
        let (tx, events) = broadcast::channel(256);
        let agent = Agent::new(page, oracle, config, kv.clone(), tx);
        Self { agent, events, kv }
    }

    pub fn drain(&mut self) -> Vec<AgentEvent> {
        let mut out = Vec::new();
        while let Ok(event) = self.events.try_recv() {
            out.push(event);
        }
        out
    }
}
