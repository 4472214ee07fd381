use super::envd::{self, EnvelopeDecoder, ProcessCollector, StartRequest};
use super::traits::{
    CommandOutput, Coordinate, DesktopError, RemoteDesktop, SandboxService, ScrollDirection,
};
use crate::config::SandboxConfig;
use async_trait::async_trait;
use base64::Engine;
use dashmap::DashMap;
use futures_util::StreamExt;
use reqwest::header::{HeaderMap, HeaderValue, AUTHORIZATION, CONTENT_TYPE};
use reqwest::{Client, StatusCode};
use serde::Deserialize;
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

/// Characters per `xdotool type` invocation. Long strings drop keystrokes.
const TYPE_CHUNK_CHARS: usize = 25;
/// Delay between typed characters, in milliseconds.
const TYPE_DELAY_MS: u32 = 12;
/// Longest error body kept in [`DesktopError::Api`].
const MAX_ERROR_BODY_CHARS: usize = 300;
/// Cached connections older than this are resolved again through the control plane.
const CONNECTION_TTL: Duration = Duration::from_secs(10 * 60);

// ── Control plane ───────────────────────────────────────────────────────────

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct SandboxInfo {
    #[serde(rename = "sandboxID")]
    sandbox_id: String,
    #[serde(default)]
    envd_access_token: Option<String>,
    #[serde(default)]
    domain: Option<String>,
}

struct CachedDesktop {
    desktop: Arc<E2bDesktop>,
    connected_at: Instant,
}

impl CachedDesktop {
    fn new(desktop: Arc<E2bDesktop>) -> Self {
        Self {
            desktop,
            connected_at: Instant::now(),
        }
    }

    fn is_usable(&self, ttl: Duration) -> bool {
        self.connected_at.elapsed() < ttl && !self.desktop.is_stale()
    }
}

/// E2B sandboxes: lookup and kill via the REST API, desktop control via the
/// in-sandbox daemon.
///
/// Connections are cached per sandbox id. An entry is dropped when it outlives
/// the cache TTL, when the daemon rejects its token or reports the sandbox
/// gone, or when this service kills the sandbox.
pub struct E2bSandboxService {
    client: Client,
    config: SandboxConfig,
    desktops: DashMap<String, CachedDesktop>,
    cache_ttl: Duration,
}

impl E2bSandboxService {
    pub fn new(config: SandboxConfig) -> Self {
        let client = Client::builder()
            .connect_timeout(Duration::from_secs(10))
            .build()
            .unwrap_or_else(|_| Client::new());
        Self {
            client,
            config,
            desktops: DashMap::new(),
            cache_ttl: CONNECTION_TTL,
        }
    }

    pub fn with_cache_ttl(mut self, ttl: Duration) -> Self {
        self.cache_ttl = ttl;
        self
    }

    /// Number of live cached connections.
    pub fn cached_connections(&self) -> usize {
        self.desktops.len()
    }

    fn evict_unusable(&self) {
        let ttl = self.cache_ttl;
        self.desktops.retain(|sandbox_id, cached| {
            let keep = cached.is_usable(ttl);
            if !keep {
                tracing::debug!(sandbox_id = %sandbox_id, "dropping cached sandbox connection");
            }
            keep
        });
    }

    fn api_key(&self) -> Result<&str, DesktopError> {
        self.config
            .api_key
            .as_deref()
            .filter(|k| !k.is_empty())
            .ok_or_else(|| {
                DesktopError::NotConfigured(
                    "Sandbox API key not set. Set E2B_API_KEY or sandbox.api_key in config.toml."
                        .into(),
                )
            })
    }

    fn sandbox_url(&self, sandbox_id: &str) -> String {
        format!(
            "{}/sandboxes/{sandbox_id}",
            self.config.api_url.trim_end_matches('/')
        )
    }

    async fn lookup(&self, sandbox_id: &str) -> Result<SandboxInfo, DesktopError> {
        let response = self
            .client
            .get(self.sandbox_url(sandbox_id))
            .header("X-API-Key", self.api_key()?)
            .timeout(Duration::from_secs(30))
            .send()
            .await?;

        let status = response.status();
        if status == StatusCode::NOT_FOUND {
            return Err(DesktopError::NotFound(sandbox_id.to_string()));
        }
        if !status.is_success() {
            return Err(api_error(response).await);
        }
        Ok(response.json().await?)
    }
}

/// `https://{port}-{sandbox}.{domain}`
fn envd_url(config: &SandboxConfig, sandbox_id: &str, domain: Option<&str>) -> String {
    let domain = domain
        .filter(|d| !d.is_empty())
        .unwrap_or(config.domain.as_str());
    format!("https://{}-{sandbox_id}.{domain}", config.envd_port)
}

async fn api_error(response: reqwest::Response) -> DesktopError {
    let status = response.status().as_u16();
    let body = response.text().await.unwrap_or_default();
    DesktopError::Api {
        status,
        body: crate::util::truncate_with_ellipsis(body.trim(), MAX_ERROR_BODY_CHARS),
    }
}

#[async_trait]
impl SandboxService for E2bSandboxService {
    async fn connect(&self, sandbox_id: &str) -> Result<Arc<dyn RemoteDesktop>, DesktopError> {
        self.evict_unusable();
        if let Some(entry) = self.desktops.get(sandbox_id) {
            let desktop: Arc<dyn RemoteDesktop> = entry.value().desktop.clone();
            return Ok(desktop);
        }

        let info = self.lookup(sandbox_id).await?;
        let url = envd_url(&self.config, &info.sandbox_id, info.domain.as_deref());
        tracing::debug!(sandbox_id, envd = %url, "connected to sandbox");

        let desktop = Arc::new(E2bDesktop::new(
            self.client.clone(),
            url,
            info.envd_access_token,
            &self.config,
        ));
        self.desktops
            .insert(sandbox_id.to_string(), CachedDesktop::new(desktop.clone()));
        Ok(desktop)
    }

    async fn kill(&self, sandbox_id: &str) -> Result<(), DesktopError> {
        self.desktops.remove(sandbox_id);

        let response = self
            .client
            .delete(self.sandbox_url(sandbox_id))
            .header("X-API-Key", self.api_key()?)
            .timeout(Duration::from_secs(30))
            .send()
            .await?;

        let status = response.status();
        if status == StatusCode::NOT_FOUND {
            tracing::debug!(sandbox_id, "sandbox already gone");
            return Ok(());
        }
        if !status.is_success() {
            return Err(api_error(response).await);
        }
        tracing::info!(sandbox_id, "sandbox killed");
        Ok(())
    }
}

// ── Data plane ──────────────────────────────────────────────────────────────

/// Desktop control over the sandbox daemon's process and file APIs.
/// Input is injected with `xdotool`, frames are captured with `scrot`.
pub struct E2bDesktop {
    client: Client,
    envd_url: String,
    access_token: Option<String>,
    user: String,
    display: String,
    command_timeout: Duration,
    stale: AtomicBool,
}

impl E2bDesktop {
    pub fn new(
        client: Client,
        envd_url: impl Into<String>,
        access_token: Option<String>,
        config: &SandboxConfig,
    ) -> Self {
        Self {
            client,
            envd_url: envd_url.into().trim_end_matches('/').to_string(),
            access_token,
            user: config.user.clone(),
            display: config.display.clone(),
            command_timeout: Duration::from_secs(config.command_timeout_secs),
            stale: AtomicBool::new(false),
        }
    }

    /// Set once the daemon rejected this connection's token or lost the sandbox.
    pub fn is_stale(&self) -> bool {
        self.stale.load(Ordering::Relaxed)
    }

    fn track<T>(&self, result: Result<T, DesktopError>) -> Result<T, DesktopError> {
        if let Err(e) = &result {
            if e.is_session_lost() && !self.stale.swap(true, Ordering::Relaxed) {
                tracing::warn!(envd = %self.envd_url, "sandbox connection lost: {e}");
            }
        }
        result
    }

    fn headers(&self) -> Result<HeaderMap, DesktopError> {
        let mut headers = HeaderMap::new();
        let basic = base64::engine::general_purpose::STANDARD.encode(format!("{}:", self.user));
        headers.insert(
            AUTHORIZATION,
            HeaderValue::from_str(&format!("Basic {basic}"))
                .map_err(|_| DesktopError::Protocol("invalid sandbox user".into()))?,
        );
        if let Some(token) = self.access_token.as_deref() {
            headers.insert(
                "x-access-token",
                HeaderValue::from_str(token)
                    .map_err(|_| DesktopError::Protocol("invalid access token".into()))?,
            );
        }
        Ok(headers)
    }

    /// Run a shell command, bounded by the configured timeout.
    async fn exec(&self, command: &str) -> Result<CommandOutput, DesktopError> {
        tracing::debug!(command, "sandbox exec");
        match tokio::time::timeout(self.command_timeout, self.exec_inner(command)).await {
            Ok(result) => self.track(result),
            Err(_) => Err(DesktopError::Timeout(self.command_timeout.as_secs())),
        }
    }

    async fn exec_inner(&self, command: &str) -> Result<CommandOutput, DesktopError> {
        let mut envs = BTreeMap::new();
        envs.insert("DISPLAY".to_string(), self.display.clone());
        let body = StartRequest::bash(command, envs, None).to_envelope()?;

        let response = self
            .client
            .post(format!("{}{}", self.envd_url, envd::START_PATH))
            .headers(self.headers()?)
            .header(CONTENT_TYPE, envd::CONTENT_TYPE)
            .header("Connect-Protocol-Version", "1")
            .body(body)
            .send()
            .await?;

        if !response.status().is_success() {
            return Err(api_error(response).await);
        }

        let mut decoder = EnvelopeDecoder::new();
        let mut collector = ProcessCollector::new();
        let mut stream = response.bytes_stream();
        while let Some(chunk) = stream.next().await {
            decoder.push(&chunk?);
            while let Some(envelope) = decoder.next_envelope() {
                if collector.apply(&envelope)? {
                    return collector.finish();
                }
            }
        }

        if decoder.pending() > 0 {
            tracing::warn!(bytes = decoder.pending(), "truncated frame at end of process stream");
        }
        collector.finish()
    }

    async fn xdotool(&self, args: &str) -> Result<(), DesktopError> {
        self.exec(&format!("xdotool {args}")).await.map(|_| ())
    }

    async fn read_file(&self, path: &str) -> Result<Vec<u8>, DesktopError> {
        let result = self.read_file_inner(path).await;
        self.track(result)
    }

    async fn read_file_inner(&self, path: &str) -> Result<Vec<u8>, DesktopError> {
        let response = self
            .client
            .get(format!("{}/files", self.envd_url))
            .headers(self.headers()?)
            .query(&[("path", path), ("username", self.user.as_str())])
            .timeout(self.command_timeout)
            .send()
            .await?;

        if !response.status().is_success() {
            return Err(api_error(response).await);
        }
        Ok(response.bytes().await?.to_vec())
    }
}

#[async_trait]
impl RemoteDesktop for E2bDesktop {
    async fn screenshot(&self) -> Result<Vec<u8>, DesktopError> {
        let path = format!("/tmp/screenshot-{}.png", uuid::Uuid::new_v4());
        self.exec(&format!("scrot --pointer {path}")).await?;
        let bytes = self.read_file(&path).await;
        if let Err(e) = self.exec(&format!("rm -f {path}")).await {
            tracing::warn!("Failed to remove {path}: {e}");
        }
        bytes
    }

    async fn move_mouse(&self, at: Coordinate) -> Result<(), DesktopError> {
        self.xdotool(&format!("mousemove --sync {} {}", at.x, at.y))
            .await
    }

    async fn left_click(&self) -> Result<(), DesktopError> {
        self.xdotool("click 1").await
    }

    async fn double_click(&self) -> Result<(), DesktopError> {
        self.xdotool("click --repeat 2 1").await
    }

    async fn right_click(&self) -> Result<(), DesktopError> {
        self.xdotool("click 3").await
    }

    async fn write(&self, text: &str) -> Result<(), DesktopError> {
        for chunk in chunk_text(text, TYPE_CHUNK_CHARS) {
            self.xdotool(&format!(
                "type --delay {TYPE_DELAY_MS} -- {}",
                shell_quote(&chunk)
            ))
            .await?;
        }
        Ok(())
    }

    async fn press(&self, key: &str) -> Result<(), DesktopError> {
        self.xdotool(&format!("key {}", shell_quote(&map_key(key))))
            .await
    }

    async fn scroll(&self, direction: ScrollDirection, amount: u32) -> Result<(), DesktopError> {
        self.xdotool(&scroll_args(direction, amount)).await
    }

    async fn drag(&self, from: Coordinate, to: Coordinate) -> Result<(), DesktopError> {
        self.xdotool(&drag_args(from, to)).await
    }

    async fn run_command(&self, command: &str) -> Result<CommandOutput, DesktopError> {
        self.exec(command).await
    }
}

// ── Helpers ─────────────────────────────────────────────────────────────────

/// Single-quote for POSIX shells.
fn shell_quote(value: &str) -> String {
    format!("'{}'", value.replace('\'', "'\\''"))
}

fn chunk_text(text: &str, size: usize) -> Vec<String> {
    let chars: Vec<char> = text.chars().collect();
    chars
        .chunks(size.max(1))
        .map(|c| c.iter().collect())
        .collect()
}

/// Buttons 4 and 5 are the wheel.
fn scroll_args(direction: ScrollDirection, amount: u32) -> String {
    let button = match direction {
        ScrollDirection::Up => 4,
        ScrollDirection::Down => 5,
    };
    format!("click --repeat {amount} {button}")
}

fn drag_args(from: Coordinate, to: Coordinate) -> String {
    format!(
        "mousemove --sync {} {} mousedown 1 mousemove --sync {} {} mouseup 1",
        from.x, from.y, to.x, to.y
    )
}

/// Map common key names to X keysyms. Combos like `ctrl+c` are mapped part by part.
fn map_key(combo: &str) -> String {
    combo
        .split('+')
        .map(str::trim)
        .map(map_key_name)
        .collect::<Vec<_>>()
        .join("+")
}

fn map_key_name(name: &str) -> String {
    let mapped = match name.to_lowercase().as_str() {
        "enter" | "return" => "Return",
        "esc" | "escape" => "Escape",
        "tab" => "Tab",
        "space" | " " => "space",
        "backspace" => "BackSpace",
        "delete" | "del" => "Delete",
        "insert" => "Insert",
        "up" | "arrowup" => "Up",
        "down" | "arrowdown" => "Down",
        "left" | "arrowleft" => "Left",
        "right" | "arrowright" => "Right",
        "home" => "Home",
        "end" => "End",
        "pageup" | "page_up" | "page-up" => "Page_Up",
        "pagedown" | "page_down" | "page-down" => "Page_Down",
        "ctrl" | "control" => "ctrl",
        "alt" | "option" => "alt",
        "shift" => "shift",
        "cmd" | "command" | "super" | "meta" | "win" => "super",
        lower => {
            if let Some(n) = lower.strip_prefix('f').and_then(|n| n.parse::<u8>().ok()) {
                if (1..=24).contains(&n) {
                    return format!("F{n}");
                }
            }
            // Single characters and unknown keysyms pass through unchanged.
            return name.to_string();
        }
    };
    mapped.to_string()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::desktop::envd::{encode_envelope, EnvelopeDecoder, FLAG_END_STREAM};
    use axum::body::Bytes;
    use axum::extract::{Path, Query, State};
    use axum::http::{HeaderMap as AxumHeaders, StatusCode as AxumStatus};
    use axum::response::IntoResponse;
    use axum::routing::{any, get, post};
    use axum::{Json, Router};
    use serde_json::json;
    use std::collections::HashMap;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Mutex;

    // ── Pure helpers ────────────────────────────────────────────────────

    #[test]
    fn shell_quote_escapes_single_quotes() {
        assert_eq!(shell_quote("hello"), "'hello'");
        assert_eq!(shell_quote("it's"), "'it'\\''s'");
        assert_eq!(shell_quote("$(rm -rf /)"), "'$(rm -rf /)'");
    }

    #[test]
    fn chunk_text_splits_on_char_boundaries() {
        assert_eq!(chunk_text("abcdef", 4), vec!["abcd", "ef"]);
        assert_eq!(chunk_text("żółw", 2), vec!["żó", "łw"]);
        assert!(chunk_text("", 25).is_empty());
    }

    #[test]
    fn scroll_uses_wheel_buttons() {
        assert_eq!(scroll_args(ScrollDirection::Up, 3), "click --repeat 3 4");
        assert_eq!(scroll_args(ScrollDirection::Down, 1), "click --repeat 1 5");
    }

    #[test]
    fn drag_presses_moves_releases() {
        let args = drag_args(Coordinate::new(10, 20), Coordinate::new(30, 40));
        assert_eq!(
            args,
            "mousemove --sync 10 20 mousedown 1 mousemove --sync 30 40 mouseup 1"
        );
    }

    #[test]
    fn key_names_map_to_keysyms() {
        assert_eq!(map_key("enter"), "Return");
        assert_eq!(map_key("Return"), "Return");
        assert_eq!(map_key("backspace"), "BackSpace");
        assert_eq!(map_key("esc"), "Escape");
        assert_eq!(map_key("pagedown"), "Page_Down");
        assert_eq!(map_key("f5"), "F5");
        assert_eq!(map_key("a"), "a");
        assert_eq!(map_key("ctrl+c"), "ctrl+c");
        assert_eq!(map_key("cmd+shift+t"), "super+shift+t");
        assert_eq!(map_key("XF86AudioMute"), "XF86AudioMute");
    }

    #[test]
    fn envd_url_prefers_reported_domain() {
        let config = SandboxConfig::default();
        assert_eq!(
            envd_url(&config, "sbx1", None),
            "https://49983-sbx1.e2b.app"
        );
        assert_eq!(
            envd_url(&config, "sbx1", Some("e2b.dev")),
            "https://49983-sbx1.e2b.dev"
        );
        assert_eq!(envd_url(&config, "sbx1", Some("")), "https://49983-sbx1.e2b.app");
    }

    // ── Fake servers ────────────────────────────────────────────────────

    async fn spawn(router: Router) -> String {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            axum::serve(listener, router).await.unwrap();
        });
        format!("http://{addr}")
    }

    #[derive(Clone, Default)]
    struct FakeEnvd {
        commands: Arc<Mutex<Vec<String>>>,
        auth: Arc<Mutex<Vec<(String, Option<String>)>>>,
        file_reads: Arc<Mutex<Vec<HashMap<String, String>>>>,
    }

    fn event(value: serde_json::Value) -> Vec<u8> {
        encode_envelope(0, &serde_json::to_vec(&value).unwrap())
    }

    fn b64(s: &str) -> String {
        base64::engine::general_purpose::STANDARD.encode(s)
    }

    async fn fake_start(
        State(state): State<FakeEnvd>,
        headers: AxumHeaders,
        body: Bytes,
    ) -> impl IntoResponse {
        let mut decoder = EnvelopeDecoder::new();
        decoder.push(&body);
        let request = decoder.next_envelope().unwrap();
        let request: serde_json::Value = serde_json::from_slice(&request.payload).unwrap();
        let command = request["process"]["args"][2].as_str().unwrap().to_string();
        assert_eq!(request["process"]["envs"]["DISPLAY"], ":0");

        state.commands.lock().unwrap().push(command.clone());
        state.auth.lock().unwrap().push((
            headers
                .get("authorization")
                .and_then(|v| v.to_str().ok())
                .unwrap_or_default()
                .to_string(),
            headers
                .get("x-access-token")
                .and_then(|v| v.to_str().ok())
                .map(str::to_string),
        ));

        let mut out = event(json!({"event": {"start": {"pid": 7}}}));
        if command.starts_with("fail") {
            out.extend(event(json!({"event": {"data": {"stderr": b64("it broke")}}})));
            out.extend(event(json!({"event": {"end": {"exitCode": 3, "exited": true}}})));
        } else if command.starts_with("echo ") {
            let text = format!("{}\n", &command[5..]);
            out.extend(event(json!({"event": {"data": {"stdout": b64(&text)}}})));
            out.extend(event(json!({"event": {"end": {"exited": true}}})));
        } else {
            out.extend(event(json!({"event": {"end": {"exited": true}}})));
        }
        out.extend(encode_envelope(FLAG_END_STREAM, b"{}"));

        ([("content-type", envd::CONTENT_TYPE)], out)
    }

    async fn fake_files(
        State(state): State<FakeEnvd>,
        Query(params): Query<HashMap<String, String>>,
    ) -> impl IntoResponse {
        state.file_reads.lock().unwrap().push(params);
        vec![0x89, b'P', b'N', b'G']
    }

    async fn envd_desktop(token: Option<&str>) -> (FakeEnvd, E2bDesktop) {
        let state = FakeEnvd::default();
        let router = Router::new()
            .route(envd::START_PATH, post(fake_start))
            .route("/files", get(fake_files))
            .with_state(state.clone());
        let url = spawn(router).await;
        let desktop = E2bDesktop::new(
            Client::new(),
            url,
            token.map(str::to_string),
            &SandboxConfig::default(),
        );
        (state, desktop)
    }

    // ── Desktop over fake envd ──────────────────────────────────────────

    #[tokio::test]
    async fn run_command_returns_stdout() {
        let (state, desktop) = envd_desktop(Some("tok")).await;
        let out = desktop.run_command("echo hello").await.unwrap();
        assert_eq!(out.stdout, "hello\n");
        assert_eq!(out.exit_code, 0);

        let auth = state.auth.lock().unwrap();
        // base64("user:")
        assert_eq!(auth[0].0, "Basic dXNlcjo=");
        assert_eq!(auth[0].1.as_deref(), Some("tok"));
    }

    #[tokio::test]
    async fn run_command_nonzero_exit_is_error() {
        let (_state, desktop) = envd_desktop(None).await;
        match desktop.run_command("fail now").await {
            Err(DesktopError::CommandExit { exit_code, stderr }) => {
                assert_eq!(exit_code, 3);
                assert_eq!(stderr, "it broke");
            }
            other => panic!("expected CommandExit, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn input_actions_issue_xdotool_commands() {
        let (state, desktop) = envd_desktop(None).await;
        desktop.move_mouse(Coordinate::new(5, 6)).await.unwrap();
        desktop.left_click().await.unwrap();
        desktop.double_click().await.unwrap();
        desktop.right_click().await.unwrap();
        desktop.press("enter").await.unwrap();
        desktop.scroll(ScrollDirection::Down, 2).await.unwrap();
        desktop
            .drag(Coordinate::new(1, 2), Coordinate::new(3, 4))
            .await
            .unwrap();

        let commands = state.commands.lock().unwrap().clone();
        assert_eq!(
            commands,
            vec![
                "xdotool mousemove --sync 5 6",
                "xdotool click 1",
                "xdotool click --repeat 2 1",
                "xdotool click 3",
                "xdotool key 'Return'",
                "xdotool click --repeat 2 5",
                "xdotool mousemove --sync 1 2 mousedown 1 mousemove --sync 3 4 mouseup 1",
            ]
        );
    }

    #[tokio::test]
    async fn write_types_in_chunks() {
        let (state, desktop) = envd_desktop(None).await;
        let text = "a".repeat(30);
        desktop.write(&text).await.unwrap();

        let commands = state.commands.lock().unwrap().clone();
        assert_eq!(commands.len(), 2);
        assert_eq!(
            commands[0],
            format!("xdotool type --delay 12 -- '{}'", "a".repeat(25))
        );
        assert_eq!(commands[1], "xdotool type --delay 12 -- 'aaaaa'");
    }

    #[tokio::test]
    async fn screenshot_captures_reads_and_cleans_up() {
        let (state, desktop) = envd_desktop(None).await;
        let bytes = desktop.screenshot().await.unwrap();
        assert_eq!(bytes, vec![0x89, b'P', b'N', b'G']);

        let commands = state.commands.lock().unwrap().clone();
        assert_eq!(commands.len(), 2);
        assert!(commands[0].starts_with("scrot --pointer /tmp/screenshot-"));
        assert!(commands[1].starts_with("rm -f /tmp/screenshot-"));

        let reads = state.file_reads.lock().unwrap();
        assert_eq!(reads.len(), 1);
        assert!(reads[0]["path"].ends_with(".png"));
        assert_eq!(reads[0]["username"], "user");
    }

    async fn rejecting_desktop(router: Router) -> E2bDesktop {
        let url = spawn(router).await;
        E2bDesktop::new(Client::new(), url, Some("expired".into()), &SandboxConfig::default())
    }

    #[tokio::test]
    async fn unauthorized_daemon_marks_connection_stale() {
        let desktop = rejecting_desktop(Router::new().route(
            envd::START_PATH,
            any(|| async { (AxumStatus::UNAUTHORIZED, "invalid access token") }),
        ))
        .await;
        assert!(!desktop.is_stale());

        let err = desktop.left_click().await.unwrap_err();
        assert!(matches!(err, DesktopError::Api { status: 401, .. }));
        assert!(desktop.is_stale());
    }

    #[tokio::test]
    async fn unauthenticated_end_of_stream_marks_connection_stale() {
        let desktop = rejecting_desktop(Router::new().route(
            envd::START_PATH,
            any(|| async {
                let body = encode_envelope(
                    FLAG_END_STREAM,
                    br#"{"error":{"code":"unauthenticated","message":"token expired"}}"#,
                );
                ([("content-type", envd::CONTENT_TYPE)], body)
            }),
        ))
        .await;

        let err = desktop.run_command("ls").await.unwrap_err();
        assert!(matches!(err, DesktopError::Rpc { ref code, .. } if code == "unauthenticated"));
        assert!(desktop.is_stale());
    }

    #[tokio::test]
    async fn command_failures_keep_connection_live() {
        let (_state, desktop) = envd_desktop(None).await;
        assert!(desktop.run_command("fail now").await.is_err());
        assert!(!desktop.is_stale());
    }

    // ── Control plane over fake API ─────────────────────────────────────

    #[derive(Clone, Default)]
    struct FakeApi {
        lookups: Arc<AtomicUsize>,
        kills: Arc<Mutex<Vec<String>>>,
    }

    async fn fake_lookup(
        State(state): State<FakeApi>,
        Path(id): Path<String>,
        headers: AxumHeaders,
    ) -> axum::response::Response {
        assert_eq!(
            headers.get("x-api-key").and_then(|v| v.to_str().ok()),
            Some("e2b_test")
        );
        state.lookups.fetch_add(1, Ordering::SeqCst);
        if id == "missing" {
            return AxumStatus::NOT_FOUND.into_response();
        }
        Json(json!({
            "sandboxID": id,
            "templateID": "desktop",
            "envdAccessToken": "tok",
            "domain": "e2b.dev"
        }))
        .into_response()
    }

    async fn fake_kill(State(state): State<FakeApi>, Path(id): Path<String>) -> AxumStatus {
        state.kills.lock().unwrap().push(id.clone());
        match id.as_str() {
            "missing" => AxumStatus::NOT_FOUND,
            "broken" => AxumStatus::INTERNAL_SERVER_ERROR,
            _ => AxumStatus::NO_CONTENT,
        }
    }

    async fn api_service(api_key: Option<&str>) -> (FakeApi, E2bSandboxService) {
        let state = FakeApi::default();
        let router = Router::new()
            .route("/sandboxes/{id}", get(fake_lookup).delete(fake_kill))
            .with_state(state.clone());
        let url = spawn(router).await;
        let service = E2bSandboxService::new(SandboxConfig {
            api_url: url,
            api_key: api_key.map(str::to_string),
            ..SandboxConfig::default()
        });
        (state, service)
    }

    #[tokio::test]
    async fn connect_caches_per_sandbox() {
        let (state, service) = api_service(Some("e2b_test")).await;
        service.connect("sbx1").await.unwrap();
        service.connect("sbx1").await.unwrap();
        assert_eq!(state.lookups.load(Ordering::SeqCst), 1);

        service.connect("sbx2").await.unwrap();
        assert_eq!(state.lookups.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn stale_connection_is_resolved_again() {
        let (state, service) = api_service(Some("e2b_test")).await;
        let desktop = rejecting_desktop(Router::new().route(
            envd::START_PATH,
            any(|| async { (AxumStatus::NOT_FOUND, "sandbox not found") }),
        ))
        .await;
        let desktop = Arc::new(desktop);
        service
            .desktops
            .insert("sbx1".into(), CachedDesktop::new(desktop.clone()));

        service.connect("sbx1").await.unwrap();
        assert_eq!(state.lookups.load(Ordering::SeqCst), 0);

        assert!(desktop.right_click().await.is_err());
        service.connect("sbx1").await.unwrap();
        assert_eq!(state.lookups.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn expired_connections_are_swept() {
        let (state, service) = api_service(Some("e2b_test")).await;
        let service = service.with_cache_ttl(Duration::ZERO);
        for id in ["sbx1", "sbx2", "sbx3"] {
            service.connect(id).await.unwrap();
            assert_eq!(service.cached_connections(), 1);
        }
        service.connect("sbx1").await.unwrap();
        assert_eq!(state.lookups.load(Ordering::SeqCst), 4);
    }

    #[tokio::test]
    async fn connect_unknown_sandbox_is_not_found() {
        let (_state, service) = api_service(Some("e2b_test")).await;
        let err = service.connect("missing").await.err().unwrap();
        assert!(matches!(err, DesktopError::NotFound(id) if id == "missing"));
    }

    #[tokio::test]
    async fn connect_without_api_key_fails_fast() {
        let (state, service) = api_service(None).await;
        let err = service.connect("sbx1").await.err().unwrap();
        assert!(matches!(err, DesktopError::NotConfigured(_)));
        assert_eq!(state.lookups.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn kill_evicts_cache_and_tolerates_missing() {
        let (state, service) = api_service(Some("e2b_test")).await;
        service.connect("sbx1").await.unwrap();
        service.kill("sbx1").await.unwrap();
        service.connect("sbx1").await.unwrap();
        assert_eq!(state.lookups.load(Ordering::SeqCst), 2);

        service.kill("missing").await.unwrap();
        let err = service.kill("broken").await.unwrap_err();
        assert!(matches!(err, DesktopError::Api { status: 500, .. }));
        assert_eq!(
            state.kills.lock().unwrap().clone(),
            vec!["sbx1", "missing", "broken"]
        );
    }
}
