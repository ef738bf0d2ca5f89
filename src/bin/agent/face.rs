use anyhow::{Result, anyhow};
use axum::Json;
use axum::Router;
use axum::extract::State;
use axum::response::Html;
use axum::response::sse::{Event, Sse};
use axum::routing::{get, post};
use page_agent::{AgentEvent, AgentHandle};
use serde::Deserialize;
use std::convert::Infallible;
use std::sync::Arc;
use tokio::sync::{broadcast, mpsc};
use tokio_stream::StreamExt;
use tokio_stream::wrappers::BroadcastStream;
use tracing::{debug, error, info, warn};

const PORT_ATTEMPTS: u16 = 10;

#[derive(Clone)]
pub struct AppState {
    pub cmd_tx: mpsc::Sender<String>,
    pub event_tx: broadcast::Sender<AgentEvent>,
    pub agent: AgentHandle,
}

#[derive(Deserialize)]
struct CommandPayload {
    command: String,
}

fn to_sse_event(event: &AgentEvent) -> Option<Event> {
    match Event::default().event(event.name()).json_data(event) {
        Ok(sse) => Some(sse),
        Err(e) => {
            warn!("dropping unserializable event: {}", e);
            None
        }
    }
}

/// Serve the command page on the first free port from `port` upward.
/// Returns the receiving end of the command channel.
pub async fn start_server(
    port: u16,
    agent: AgentHandle,
    event_tx: broadcast::Sender<AgentEvent>,
) -> Result<mpsc::Receiver<String>> {
    let (cmd_tx, cmd_rx) = mpsc::channel::<String>(1);

    let state = Arc::new(AppState {
        cmd_tx,
        event_tx,
        agent,
    });

    let app = Router::new()
        .route("/", get(index_handler))
        .route("/command", post(command_handler))
        .route("/stop", post(stop_handler))
        .route("/events", get(sse_handler))
        .route(
            "/favicon.ico",
            get(|| async { axum::http::StatusCode::NO_CONTENT }),
        )
        .with_state(state);

    let mut bound = None;
    for candidate in port..port.saturating_add(PORT_ATTEMPTS) {
        match tokio::net::TcpListener::bind(("127.0.0.1", candidate)).await {
            Ok(listener) => {
                bound = Some((listener, candidate));
                break;
            }
            Err(e) => debug!(port = candidate, "port unavailable: {}", e),
        }
    }
    let (listener, port) = bound.ok_or_else(|| {
        anyhow!(
            "could not bind any port in {}..{}; is another agent running?",
            port,
            port.saturating_add(PORT_ATTEMPTS)
        )
    })?;

    info!("web UI running at http://localhost:{}", port);

    tokio::spawn(async move {
        if let Err(e) = axum::serve(listener, app).await {
            error!("web server stopped: {}", e);
        }
    });

    Ok(cmd_rx)
}

async fn index_handler() -> Html<&'static str> {
    Html(INDEX_HTML)
}

/// Goals are not queued: while a task runs, new ones are turned away.
async fn command_handler(
    State(state): State<Arc<AppState>>,
    Json(payload): Json<CommandPayload>,
) -> &'static str {
    let command = payload.command.trim().to_string();
    if command.is_empty() {
        return "empty";
    }
    info!(%command, "command submitted");

    if state.agent.is_busy() || state.cmd_tx.try_send(command).is_err() {
        let _ = state.event_tx.send(AgentEvent::Notice {
            message: "⏳ Still working, please wait...".into(),
        });
        return "busy";
    }
    "ok"
}

async fn stop_handler(State(state): State<Arc<AppState>>) -> &'static str {
    state.agent.request_stop();
    let _ = state.event_tx.send(AgentEvent::Notice {
        message: "🛑 Stopping after the current action...".into(),
    });
    "ok"
}

async fn sse_handler(
    State(state): State<Arc<AppState>>,
) -> Sse<impl tokio_stream::Stream<Item = Result<Event, Infallible>>> {
    let rx = state.event_tx.subscribe();
    let stream =
        BroadcastStream::new(rx).filter_map(|result: Result<AgentEvent, _>| match result {
            Ok(event) => to_sse_event(&event).map(Ok::<_, Infallible>),
            Err(_) => None,
        });
    Sse::new(stream)
}

const INDEX_HTML: &str = r##"<!DOCTYPE html>
<html lang="en">
<head>
<meta charset="UTF-8">
<title>Page Agent</title>
<style>
  body { font: 14px/1.45 system-ui, sans-serif; max-width: 720px; margin: 2em auto; padding: 0 1em; }
  #state { font-weight: 600; }
  #state.working { color: #b45309; }
  form { display: flex; gap: .5em; margin: 1em 0; }
  #goal { flex: 1; padding: .4em; }
  ol { padding-left: 1.5em; }
  li.fail, li.error { color: #b91c1c; }
  li.ok { color: #15803d; }
  li.aside { list-style: none; color: #555; }
</style>
</head>
<body>
<h1>Page Agent <small id="state">idle</small></h1>
<form id="ask">
  <input id="goal" placeholder="Goal, or /debug [filter]" autofocus>
  <button id="go">Run</button>
  <button id="halt" type="button" disabled>Stop</button>
</form>
<ol id="steps"></ol>
<script>
  const $ = id => document.getElementById(id);
  const line = (cls, text) => {
    const li = document.createElement('li');
    li.className = cls;
    li.textContent = text;
    $('steps').appendChild(li);
    li.scrollIntoView();
  };
  const working = on => {
    $('state').textContent = on ? 'working' : 'idle';
    $('state').className = on ? 'working' : '';
    $('goal').disabled = $('go').disabled = on;
    $('halt').disabled = !on;
  };

  $('ask').onsubmit = async e => {
    e.preventDefault();
    const command = $('goal').value.trim();
    if (!command) return;
    $('goal').value = '';
    line('aside', '> ' + command);
    working(true);
    const reply = await fetch('/command', {
      method: 'POST',
      headers: {'Content-Type': 'application/json'},
      body: JSON.stringify({command}),
    });
    if ((await reply.text()) !== 'ok') working(false);
  };
  $('halt').onclick = () => fetch('/stop', {method: 'POST'});

  const feed = new EventSource('/events');
  const on = (name, fn) => feed.addEventListener(name, e => fn(JSON.parse(e.data)));
  on('started', () => working(true));
  on('resumed', d => { working(true); line('aside', 'resumed "' + d.goal + '" at step ' + d.step); });
  on('decision', d => line('aside', d.kind + ': ' + d.reasoning));
  on('target', d => line('aside', d.description));
  on('step', d => line(d.success ? 'ok' : 'fail', d.description));
  on('step_error', d => line('error', d.message));
  on('notice', d => line('aside', d.message));
  on('task_complete', d => line('ok', d.summary));
  on('task_error', d => line('error', d.message));
  on('ready', () => working(false));
</script>
</body>
</html>
"##;
