//! [`Page`] over a Chrome tab driven through the DevTools protocol.
//!
//! Every operation is a small script evaluated in the page. Scripts answer
//! with a JSON envelope: `{ok: true, value}`, `{ok: false, stale: true}` when
//! the handle no longer resolves, or `{ok: false, error}`.

use std::ffi::OsStr;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use headless_chrome::{Browser, LaunchOptions, Tab};
use serde::Deserialize;
use serde::de::DeserializeOwned;
use serde_json::{Value, json};
use tokio::time::sleep;
use tracing::{debug, info, warn};

use crate::error::PageError;
use crate::page::{
    ChangeSource, Delivery, Discovery, Page, PageIdentity, Relation, SyntheticEvent,
};
use crate::types::ElementHandle;

/// Substrings of DevTools errors raised when the document went away
/// between or during evaluations.
const NAVIGATION_MARKERS: [&str; 4] = [
    "Execution context was destroyed",
    "Cannot find context",
    "Inspected target navigated or closed",
    "No node with given id",
];

const MUTATION_POLL: Duration = Duration::from_millis(50);

const PRELUDE: &str = r#"(() => { try {
const find = (t) => document.querySelector('[data-agent-eid="' + t + '"]');
const ok = (v) => JSON.stringify({ ok: true, value: v === undefined ? null : v });
const stale = () => JSON.stringify({ ok: false, stale: true });
"#;

const EPILOGUE: &str = r#"
} catch (e) { return JSON.stringify({ ok: false, error: String(e) }); } })()"#;

const IDENTITY_JS: &str = r#"
const meta = document.querySelector('meta[name="description"]');
return ok({ title: document.title, url: location.href, description: (meta && meta.content) || '' });
"#;

const DISCOVER_JS: &str = r#"
document.querySelectorAll('[data-agent-eid]').forEach(el => el.removeAttribute('data-agent-eid'));
const common = Array.from(document.querySelectorAll(ARGS.selector));
const seen = new Set(common);
const pointer = [];
document.querySelectorAll('*').forEach(el => {
  if (!seen.has(el) && getComputedStyle(el).cursor === 'pointer') { seen.add(el); pointer.push(el); }
});
const attr = (el, n) => { const v = el.getAttribute(n); return v && v.trim() ? v : null; };
const nodes = common.concat(pointer).map((el, slot) => {
  el.setAttribute('data-agent-eid', ARGS.generation + ':' + slot);
  const r = el.getBoundingClientRect();
  const s = getComputedStyle(el);
  const toggle = el.tagName === 'INPUT' && (el.type === 'radio' || el.type === 'checkbox');
  let labelText = null;
  if (toggle && el.id) {
    const label = document.querySelector('label[for="' + CSS.escape(el.id) + '"]');
    if (label) labelText = label.textContent.trim();
  }
  let value = null;
  if (toggle) value = attr(el, 'value');
  else if (typeof el.value === 'string' && el.value.trim()) value = el.value;
  const first = el.childNodes[0];
  const opacity = parseFloat(s.opacity);
  return {
    slot,
    tag: el.tagName,
    id: el.id || null,
    class_name: typeof el.className === 'string' && el.className ? el.className : null,
    role: attr(el, 'role'),
    input_type: el.tagName === 'INPUT' ? (el.type || null) : null,
    aria_label: attr(el, 'aria-label'),
    title: attr(el, 'title'),
    alt: attr(el, 'alt'),
    placeholder: attr(el, 'placeholder'),
    value,
    label_text: labelText,
    direct_text: first && first.textContent ? (first.textContent.trim() || null) : null,
    text_content: el.textContent ? (el.textContent.trim().slice(0, 500) || null) : null,
    has_onclick: el.hasAttribute('onclick'),
    pointer_cursor: s.cursor === 'pointer',
    checked: !!el.checked,
    selected: !!el.selected,
    aria_checked: el.getAttribute('aria-checked'),
    aria_selected: el.getAttribute('aria-selected'),
    rect: { left: r.left, top: r.top, width: r.width, height: r.height },
    display: s.display,
    visibility: s.visibility,
    opacity: isNaN(opacity) ? 1 : opacity,
  };
});
return ok({ viewport: { width: window.innerWidth, height: window.innerHeight }, nodes });
"#;

const TEXT_BLOCKS_JS: &str = r#"
const out = [];
document.querySelectorAll('h1, h2, h3, h4, h5, h6, p, [role="heading"], [role="alert"]').forEach(el => {
  const r = el.getBoundingClientRect();
  const s = getComputedStyle(el);
  if (r.width === 0 || r.height === 0 || s.display === 'none' || s.visibility === 'hidden') return;
  const t = (el.innerText || '').replace(/\s+/g, ' ').trim();
  if (t) out.push(t);
});
return ok(out);
"#;

const HIGHLIGHT_JS: &str = r#"
const prev = window.__agentHighlight;
if (prev && prev.el && prev.el.isConnected) {
  prev.el.style.outline = prev.outline;
  prev.el.style.boxShadow = prev.shadow;
}
window.__agentHighlight = null;
const el = find(ARGS.token);
if (!el) return stale();
const r = el.getBoundingClientRect();
const vh = window.innerHeight || document.documentElement.clientHeight;
const vw = window.innerWidth || document.documentElement.clientWidth;
if (!(r.top >= 0 && r.left >= 0 && r.bottom <= vh && r.right <= vw)) {
  el.scrollIntoView({ behavior: 'auto', block: 'center' });
}
window.__agentHighlight = { el, outline: el.style.outline, shadow: el.style.boxShadow };
el.style.outline = '3px solid #00ff00';
el.style.outlineOffset = '2px';
el.style.boxShadow = '0 0 15px rgba(0, 255, 0, 0.6)';
el.style.transition = 'outline 0.2s, box-shadow 0.2s';
return ok(null);
"#;

const DISPATCH_JS: &str = r#"
const el = find(ARGS.token);
if (!el) return stale();
const ev = ARGS.event;
const node = ev.target === 'parent' ? el.parentElement : el;
if (!node) return ok('no_target');
const r = el.getBoundingClientRect();
const opts = {
  bubbles: true, cancelable: true, view: window,
  clientX: r.left + r.width / 2, clientY: r.top + r.height / 2,
  pointerId: 1, width: 1, height: 1, pressure: 0.5, isPrimary: true,
};
node.dispatchEvent(new MouseEvent(ev.primary, opts));
if (!ev.secondary) return ok('full');
try {
  node.dispatchEvent(new PointerEvent(ev.secondary, { ...opts, pointerType: 'mouse' }));
  return ok('full');
} catch (e) {
  return ok('primary_only');
}
"#;

const FOCUS_JS: &str = r#"
const el = find(ARGS.token);
if (!el) return stale();
if (typeof el.focus === 'function') el.focus({ preventScroll: true });
return ok(null);
"#;

const CLICK_JS: &str = r#"
const el = find(ARGS.token);
if (!el) return stale();
el.click();
return ok(null);
"#;

const COMMIT_TEXT_JS: &str = r#"
const el = find(ARGS.token);
if (!el) return stale();
if (typeof el.focus === 'function') el.focus({ preventScroll: true });
const proto = el instanceof HTMLTextAreaElement ? HTMLTextAreaElement.prototype
  : el instanceof HTMLInputElement ? HTMLInputElement.prototype : null;
const desc = proto && Object.getOwnPropertyDescriptor(proto, 'value');
if (desc && desc.set) desc.set.call(el, ARGS.text);
else if (el.isContentEditable) el.textContent = ARGS.text;
else el.value = ARGS.text;
el.dispatchEvent(new Event('input', { bubbles: true }));
el.dispatchEvent(new Event('change', { bubbles: true }));
return ok(null);
"#;

const RELATIVES_JS: &str = r#"
const el = find(ARGS.token);
if (!el) return stale();
const found = [];
if (ARGS.relation === 'parent') {
  if (el.parentElement) found.push(el.parentElement);
} else if (ARGS.relation === 'grandparent') {
  const p = el.parentElement;
  if (p && p.parentElement) found.push(p.parentElement);
} else if (ARGS.relation === 'following_siblings') {
  let s = el.nextElementSibling;
  while (s) { found.push(s); s = s.nextElementSibling; }
} else if (ARGS.relation === 'controlled') {
  const id = el.getAttribute('aria-controls');
  const c = id && document.getElementById(id);
  if (c) found.push(c);
}
const gen = ARGS.token.split(':')[0];
return ok(found.map(n => {
  let t = n.getAttribute('data-agent-eid');
  if (!t || t.split(':')[0] !== gen) {
    window.__agentRelSeq = (window.__agentRelSeq || 0) + 1;
    t = gen + ':r' + window.__agentRelSeq;
    n.setAttribute('data-agent-eid', t);
  }
  return t;
}));
"#;

const REVEAL_JS: &str = r#"
const el = find(ARGS.token);
if (!el) return stale();
ARGS.classes.forEach(c => el.classList.add(c));
const s = getComputedStyle(el);
if (s.display === 'none') el.style.display = 'block';
if (s.visibility === 'hidden') el.style.visibility = 'visible';
if (s.opacity === '0') el.style.opacity = '1';
el.removeAttribute('hidden');
if (el.hasAttribute('aria-expanded')) el.setAttribute('aria-expanded', 'true');
return ok(null);
"#;

/// Installs the mutation counter on first use; a reload drops it, and the
/// reinstalled counter restarts from zero.
const MUTATION_SEQ_JS: &str = r#"
if (!window.__agentObserver) {
  window.__agentMutationSeq = 0;
  window.__agentObserver = new MutationObserver(ms => { window.__agentMutationSeq += ms.length; });
  window.__agentObserver.observe(document.body || document.documentElement, {
    childList: true, subtree: true, attributes: true,
    attributeFilter: ['class', 'style', 'disabled', 'value'],
  });
}
return ok(window.__agentMutationSeq);
"#;

#[derive(Deserialize)]
struct Envelope {
    ok: bool,
    #[serde(default)]
    stale: bool,
    #[serde(default)]
    error: Option<String>,
    #[serde(default)]
    value: Value,
}

fn script(body: &str, args: &Value) -> String {
    [PRELUDE, "const ARGS = ", &args.to_string(), ";\n", body, EPILOGUE].concat()
}

fn classify(message: String) -> PageError {
    if NAVIGATION_MARKERS.iter().any(|m| message.contains(m)) {
        PageError::Navigated
    } else {
        PageError::Script(message)
    }
}

#[derive(Clone)]
pub struct ChromePage {
    tab: Arc<Tab>,
}

impl ChromePage {
    pub fn new(tab: Arc<Tab>) -> Self {
        Self { tab }
    }

    async fn eval<T: DeserializeOwned>(&self, body: &str, args: Value) -> Result<T, PageError> {
        let token = args["token"].as_str().unwrap_or_default().to_string();
        let source = script(body, &args);
        let tab = self.tab.clone();

        let remote = tokio::task::spawn_blocking(move || tab.evaluate(&source, false))
            .await
            .map_err(|e| PageError::Script(e.to_string()))?
            .map_err(|e| classify(format!("{e:#}")))?;

        let raw = remote
            .value
            .as_ref()
            .and_then(Value::as_str)
            .ok_or_else(|| PageError::Script("script returned no value".into()))?;
        let envelope: Envelope = serde_json::from_str(raw)?;

        if envelope.ok {
            return Ok(serde_json::from_value(envelope.value)?);
        }
        if envelope.stale {
            return Err(PageError::StaleHandle(token));
        }
        Err(classify(
            envelope.error.unwrap_or_else(|| "unknown script failure".into()),
        ))
    }

    async fn on_handle<T: DeserializeOwned>(
        &self,
        body: &str,
        handle: &ElementHandle,
        mut args: Value,
    ) -> Result<T, PageError> {
        args["token"] = Value::String(handle.token.clone());
        self.eval(body, args).await
    }

    async fn mutation_seq(&self) -> Result<u64, PageError> {
        self.eval(MUTATION_SEQ_JS, json!({})).await
    }
}

#[async_trait]
impl Page for ChromePage {
    async fn identity(&self) -> Result<PageIdentity, PageError> {
        self.eval(IDENTITY_JS, json!({})).await
    }

    async fn discover(&self, selector: &str, generation: u64) -> Result<Discovery, PageError> {
        self.eval(
            DISCOVER_JS,
            json!({ "selector": selector, "generation": generation }),
        )
        .await
    }

    async fn text_blocks(&self) -> Result<Vec<String>, PageError> {
        self.eval(TEXT_BLOCKS_JS, json!({})).await
    }

    async fn highlight(&self, handle: &ElementHandle) -> Result<(), PageError> {
        self.on_handle(HIGHLIGHT_JS, handle, json!({})).await
    }

    async fn dispatch(
        &self,
        handle: &ElementHandle,
        event: SyntheticEvent,
    ) -> Result<Delivery, PageError> {
        self.on_handle(DISPATCH_JS, handle, json!({ "event": event }))
            .await
    }

    async fn focus(&self, handle: &ElementHandle) -> Result<(), PageError> {
        self.on_handle(FOCUS_JS, handle, json!({})).await
    }

    async fn native_click(&self, handle: &ElementHandle) -> Result<(), PageError> {
        self.on_handle(CLICK_JS, handle, json!({})).await
    }

    async fn commit_text(&self, handle: &ElementHandle, text: &str) -> Result<(), PageError> {
        self.on_handle(COMMIT_TEXT_JS, handle, json!({ "text": text }))
            .await
    }

    async fn relatives(
        &self,
        handle: &ElementHandle,
        relation: Relation,
    ) -> Result<Vec<ElementHandle>, PageError> {
        let tokens: Vec<String> = self
            .on_handle(RELATIVES_JS, handle, json!({ "relation": relation }))
            .await?;
        Ok(tokens
            .into_iter()
            .map(|token| ElementHandle {
                generation: handle.generation,
                token,
            })
            .collect())
    }

    async fn reveal(&self, handle: &ElementHandle, classes: &[&str]) -> Result<(), PageError> {
        self.on_handle(REVEAL_JS, handle, json!({ "classes": classes }))
            .await
    }

    async fn observe_changes(&self) -> Result<Box<dyn ChangeSource>, PageError> {
        let last = self.mutation_seq().await?;
        Ok(Box::new(ChromeChanges {
            page: self.clone(),
            last,
        }))
    }
}

/// Polls the in-page mutation counter.
struct ChromeChanges {
    page: ChromePage,
    last: u64,
}

#[async_trait]
impl ChangeSource for ChromeChanges {
    async fn next_change(&mut self) -> Option<()> {
        loop {
            sleep(MUTATION_POLL).await;
            match self.page.mutation_seq().await {
                Ok(seq) if seq != self.last => {
                    self.last = seq;
                    return Some(());
                }
                Ok(_) => {}
                // A document swap is a change; the next poll reinstalls the counter.
                Err(PageError::Navigated) => {
                    self.last = 0;
                    return Some(());
                }
                Err(e) => {
                    debug!("mutation polling stopped: {}", e);
                    return None;
                }
            }
        }
    }
}

#[derive(Debug, Clone)]
pub struct SessionOptions {
    pub headless: bool,
    /// Port of an already running Chrome to attach to.
    pub debug_port: u16,
    pub profile_dir: Option<PathBuf>,
    pub chrome_path: Option<PathBuf>,
}

impl Default for SessionOptions {
    fn default() -> Self {
        Self {
            headless: false,
            debug_port: 9222,
            profile_dir: None,
            chrome_path: None,
        }
    }
}

/// Browser session. Created once, reused for all tasks. All calls block;
/// run them on a blocking thread.
pub struct BrowserSession {
    _browser: Browser,
    tab: Arc<Tab>,
}

impl BrowserSession {
    pub fn launch(options: &SessionOptions) -> Result<Self, PageError> {
        let endpoint = format!("http://127.0.0.1:{}", options.debug_port);
        info!(%endpoint, "attempting to attach to a running Chrome");
        if let Ok(browser) = Browser::connect(endpoint) {
            let existing = browser
                .get_tabs()
                .lock()
                .map_err(|_| PageError::Browser("tab list lock poisoned".into()))?
                .first()
                .cloned();
            let tab = match existing {
                Some(tab) => {
                    info!("attached, using existing tab");
                    tab
                }
                None => browser.new_tab().map_err(browser_error)?,
            };
            return Ok(Self {
                _browser: browser,
                tab,
            });
        }

        warn!("could not attach, launching a new Chrome");
        let launch = LaunchOptions {
            headless: options.headless,
            path: options.chrome_path.clone(),
            user_data_dir: options.profile_dir.clone(),
            args: vec![
                OsStr::new("--no-first-run"),
                OsStr::new("--no-default-browser-check"),
                OsStr::new("--disable-blink-features=AutomationControlled"),
                OsStr::new("--disable-infobars"),
                OsStr::new("--password-store=basic"),
            ],
            idle_browser_timeout: Duration::from_secs(60 * 60),
            ..Default::default()
        };

        let browser = Browser::new(launch).map_err(browser_error)?;
        let tab = browser.new_tab().map_err(browser_error)?;
        info!(headless = options.headless, "chrome ready");
        Ok(Self {
            _browser: browser,
            tab,
        })
    }

    pub fn navigate(&self, url: &str) -> Result<(), PageError> {
        info!(url, "navigating");
        self.tab
            .navigate_to(url)
            .and_then(|tab| tab.wait_until_navigated())
            .map_err(browser_error)?;
        Ok(())
    }

    pub fn page(&self) -> ChromePage {
        ChromePage::new(self.tab.clone())
    }
}

fn browser_error(e: impl std::fmt::Display) -> PageError {
    PageError::Browser(e.to_string())
}
