use std::collections::BTreeMap;
use std::ops::ControlFlow;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::{Duration, Instant, SystemTime, UNIX_EPOCH};

use anyhow::{Context, Result};
use async_trait::async_trait;
use serde::Serialize;
use serde_json::{json, Map, Value};
use tracing::{debug, warn};

use crate::channel::Channel;
use crate::client::Client;
use crate::config::{Config, ConnectOptions, LoadConfig, ScenarioKind};
use crate::connection::StatsSnapshot;
use crate::filter::Filter;
use crate::message::Message;
use crate::rails;

const CHAT_ROUNDS: usize = 5;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct CheckTally {
    pub passed: u64,
    pub failed: u64,
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct RttSummary {
    pub count: usize,
    pub min: u64,
    pub avg: f64,
    pub p50: u64,
    pub p95: u64,
    pub max: u64,
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct ScenarioReport {
    pub iterations: u64,
    pub errors: u64,
    pub checks: BTreeMap<String, CheckTally>,
    pub messages_received: u64,
    pub broadcasts_sent: u64,
    #[serde(skip)]
    pub rtt_ms: Vec<u64>,
    pub stats: StatsSnapshot,
}

impl ScenarioReport {
    /// Tallies a named check and returns `ok` so callers can branch on it.
    pub fn check(&mut self, name: &str, ok: bool) -> bool {
        let tally = self.checks.entry(name.to_owned()).or_default();
        if ok {
            tally.passed += 1;
        } else {
            tally.failed += 1;
            debug!("check failed: {name}");
        }
        ok
    }

    pub fn failed_checks(&self) -> u64 {
        self.checks.values().map(|tally| tally.failed).sum()
    }

    pub fn merge(&mut self, other: ScenarioReport) {
        self.iterations += other.iterations;
        self.errors += other.errors;
        for (name, tally) in other.checks {
            let entry = self.checks.entry(name).or_default();
            entry.passed += tally.passed;
            entry.failed += tally.failed;
        }
        self.messages_received += other.messages_received;
        self.broadcasts_sent += other.broadcasts_sent;
        self.rtt_ms.extend(other.rtt_ms);
        self.stats.merge(&other.stats);
    }

    pub fn rtt_summary(&self) -> Option<RttSummary> {
        if self.rtt_ms.is_empty() {
            return None;
        }
        let mut sorted = self.rtt_ms.clone();
        sorted.sort_unstable();
        let count = sorted.len();
        let percentile = |p: usize| sorted[((count - 1) * p) / 100];
        Some(RttSummary {
            count,
            min: sorted[0],
            avg: sorted.iter().sum::<u64>() as f64 / count as f64,
            p50: percentile(50),
            p95: percentile(95),
            max: sorted[count - 1],
        })
    }
}

#[derive(Clone, Default)]
struct SharedReport(Arc<Mutex<ScenarioReport>>);

impl SharedReport {
    fn lock(&self) -> MutexGuard<'_, ScenarioReport> {
        self.0.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn check(&self, name: &str, ok: bool) -> bool {
        self.lock().check(name, ok)
    }

    fn take(&self) -> ScenarioReport {
        std::mem::take(&mut *self.lock())
    }
}

#[async_trait]
pub trait Scenario: Send + Sync {
    fn kind(&self) -> ScenarioKind;

    async fn iteration(&self, vu: usize, iteration: usize) -> Result<ScenarioReport>;
}

#[derive(Debug, Clone)]
pub struct ScenarioSettings {
    pub url: String,
    pub channel: String,
    pub params: Map<String, Value>,
    pub connect: ConnectOptions,
    pub load: LoadConfig,
    pub page_url: Option<String>,
    pub form_url: Option<String>,
}

impl ScenarioSettings {
    pub fn from_config(config: &Config) -> Self {
        let mut params = config.target.params.clone();
        if config.target.scenario == ScenarioKind::Chat && params.is_empty() {
            params.insert("id".to_owned(), json!("demo"));
        }
        Self {
            url: config.target.url.trim().to_owned(),
            channel: config.channel_name(),
            params,
            connect: config.connect.clone(),
            load: config.load.clone(),
            page_url: config.turbo.page_url.clone(),
            form_url: config.turbo.form_url.clone(),
        }
    }

    fn user_id(vu: usize) -> String {
        format!("100{vu}")
    }

    fn connect_options(&self, vu: usize, with_identity: bool) -> ConnectOptions {
        let mut options = self.connect.clone();
        options.tags.insert("vu".to_owned(), vu.to_string());
        if with_identity && options.cookies.is_none() {
            let user_id = Self::user_id(vu);
            options.cookies = Some(format!("uid=Kay{user_id}/{user_id}"));
        }
        options
    }

    fn think_time(&self) -> Duration {
        Duration::from_millis(self.load.think_time_ms)
    }
}

pub fn build(config: &Config) -> Arc<dyn Scenario> {
    let settings = ScenarioSettings::from_config(config);
    match config.target.scenario {
        ScenarioKind::Echo => Arc::new(EchoScenario { settings }),
        ScenarioKind::Chat => Arc::new(ChatScenario { settings }),
        ScenarioKind::Broadcast => Arc::new(BroadcastScenario { settings }),
        ScenarioKind::Turbo => Arc::new(TurboScenario { settings }),
    }
}

fn now_ms() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|elapsed| elapsed.as_millis() as u64)
        .unwrap_or_default()
}

fn elapsed_ms(started: Instant) -> u64 {
    started.elapsed().as_millis() as u64
}

async fn connect_checked(
    url: &str,
    options: ConnectOptions,
    report: &mut ScenarioReport,
) -> Option<Client> {
    match Client::connect(url, options).await {
        Ok(client) => {
            report.check("successful connection", true);
            Some(client)
        }
        Err(err) => {
            warn!("connection to {url} failed: {err}");
            report.check("successful connection", false);
            None
        }
    }
}

fn abandon(mut report: ScenarioReport) -> ScenarioReport {
    report.iterations += 1;
    report
}

async fn finish(client: Client, mut report: ScenarioReport) -> ScenarioReport {
    client.disconnect().await;
    report.stats.merge(&client.stats());
    report.iterations += 1;
    report
}

pub struct EchoScenario {
    settings: ScenarioSettings,
}

#[async_trait]
impl Scenario for EchoScenario {
    fn kind(&self) -> ScenarioKind {
        ScenarioKind::Echo
    }

    async fn iteration(&self, vu: usize, _iteration: usize) -> Result<ScenarioReport> {
        let settings = &self.settings;
        let mut report = ScenarioReport::default();
        let Some(client) =
            connect_checked(&settings.url, settings.connect_options(vu, false), &mut report).await
        else {
            return Ok(abandon(report));
        };
        let channel = match client
            .subscribe(&settings.channel, Value::Object(settings.params.clone()))
            .await
        {
            Ok(channel) => channel,
            Err(err) => {
                warn!("subscribe to {} failed: {err}", settings.channel);
                report.check("successful subscription", false);
                return Ok(finish(client, report).await);
            }
        };
        report.check("successful subscription", true);

        let shared = SharedReport::default();
        let first_seen = Arc::new(AtomicU64::new(0));
        let counter = first_seen.clone();
        channel.on_message(move |_| {
            counter.fetch_add(1, Ordering::SeqCst);
        });

        let started = Instant::now();
        channel.perform("echo", json!({"foo": 1})).await?;
        let echoed = channel.receive(None::<Value>).await?;
        if report.check(
            "received echo",
            echoed.as_ref().and_then(|m| m.get("foo")) == Some(&json!(1)),
        ) {
            report.rtt_ms.push(elapsed_ms(started));
        }

        channel.perform("echo", json!({"bar": 2})).await?;
        let bar = channel
            .receive(Filter::predicate(|m| m.get("bar") == Some(&json!(2))))
            .await?;
        report.check("received with predicate", bar.is_some());

        for body in [json!({"foobar": 3}), json!({"foobaz": 3}), json!({"baz": 3})] {
            channel.perform("echo", body).await?;
        }
        let baz = channel.receive(json!({"baz": 3})).await?;
        report.check("received with exact filter", baz.is_some());
        let rest = channel.receive_n(2, None::<Value>).await?;
        report.check(
            "unmatched messages kept in order",
            rest.as_ref().is_some_and(|messages| {
                messages[0].get("foobar").is_some() && messages[1].get("foobaz").is_some()
            }),
        );

        for body in [json!({"foobar": 3}), json!({"foobaz": 3}), json!({"baz": 3})] {
            channel.perform("echo", body).await?;
        }
        let three = channel.receive_n(3, None::<Value>).await?;
        report.check("received 3 messages", three.is_some_and(|m| m.len() == 3));

        for body in [json!({"baz": 3}), json!({"foobaz": 3}), json!({"baz": 3, "foobaz": 3})] {
            channel.perform("echo", body).await?;
        }
        let two = channel
            .receive_n(2, json!({"action": "echo", "baz": 3}))
            .await?;
        report.check("receiveN with filter", two.is_some_and(|m| m.len() == 2));
        let leftover = channel.receive(json!({"foobaz": 3})).await?;
        report.check("filtered-out message still queued", leftover.is_some());

        let before_swap = first_seen.load(Ordering::SeqCst);
        let phrase = shared.clone();
        channel.on_message(move |message| {
            phrase.check("received phrase", message.get("test") == Some(&json!(1)));
        });
        channel.perform("echo", json!({"test": 1})).await?;
        let last = channel.receive(json!({"test": 1})).await?;
        report.check("received phrase synchronously", last.is_some());
        report.check(
            "replaced callback no longer fires",
            first_seen.load(Ordering::SeqCst) == before_swap,
        );
        report.messages_received = first_seen.load(Ordering::SeqCst) + 1;

        report.merge(shared.take());
        Ok(finish(client, report).await)
    }
}

pub struct ChatScenario {
    settings: ScenarioSettings,
}

#[async_trait]
impl Scenario for ChatScenario {
    fn kind(&self) -> ScenarioKind {
        ScenarioKind::Chat
    }

    async fn iteration(&self, vu: usize, _iteration: usize) -> Result<ScenarioReport> {
        let settings = &self.settings;
        let mut report = ScenarioReport::default();
        let Some(client) =
            connect_checked(&settings.url, settings.connect_options(vu, true), &mut report).await
        else {
            return Ok(abandon(report));
        };
        let channel = match client
            .subscribe(&settings.channel, Value::Object(settings.params.clone()))
            .await
        {
            Ok(channel) => channel,
            Err(err) => {
                warn!("subscribe to {} failed: {err}", settings.channel);
                report.check("successful subscription", false);
                return Ok(finish(client, report).await);
            }
        };
        report.check("successful subscription", true);

        let user_id = ScenarioSettings::user_id(vu);
        for _ in 0..CHAT_ROUNDS {
            let started = Instant::now();
            channel
                .perform("speak", json!({"message": format!("hello from Kay{user_id}")}))
                .await?;
            let own = channel.receive(json!({"author_id": user_id})).await?;
            if report.check("received its own message", own.is_some()) {
                report.messages_received += 1;
                report.rtt_ms.push(elapsed_ms(started));
            }
            tokio::time::sleep(settings.think_time()).await;
        }
        Ok(finish(client, report).await)
    }
}

pub struct BroadcastScenario {
    settings: ScenarioSettings,
}

#[async_trait]
impl Scenario for BroadcastScenario {
    fn kind(&self) -> ScenarioKind {
        ScenarioKind::Broadcast
    }

    async fn iteration(&self, vu: usize, _iteration: usize) -> Result<ScenarioReport> {
        let settings = &self.settings;
        let mut report = ScenarioReport::default();
        let Some(client) =
            connect_checked(&settings.url, settings.connect_options(vu, false), &mut report).await
        else {
            return Ok(abandon(report));
        };
        let channel = match client
            .subscribe(&settings.channel, Value::Object(settings.params.clone()))
            .await
        {
            Ok(channel) => channel,
            Err(err) => {
                warn!("subscribe to {} failed: {err}", settings.channel);
                report.check("successful subscription", false);
                return Ok(finish(client, report).await);
            }
        };
        report.check("successful subscription", true);

        channel.ignore_reads();
        let received = Arc::new(AtomicU64::new(0));
        let rtts = Arc::new(Mutex::new(Vec::new()));
        {
            let received = received.clone();
            let rtts = rtts.clone();
            channel.on_message(move |message| {
                let body = message.body();
                let payload = body
                    .get("message")
                    .filter(|inner| inner.is_object())
                    .unwrap_or(body);
                if payload.get("action").and_then(Value::as_str) != Some("broadcast") {
                    return;
                }
                received.fetch_add(1, Ordering::Relaxed);
                if let Some(ts) = payload.get("ts").and_then(Value::as_u64) {
                    rtts.lock()
                        .unwrap_or_else(PoisonError::into_inner)
                        .push(now_ms().saturating_sub(ts));
                }
            });
        }

        let deadline = Instant::now() + Duration::from_secs(settings.load.duration_secs);
        let sample_every = settings.load.sample_every.max(1);
        let mut tick = 0u64;
        let mut sent = 0u64;
        client
            .run_loop(|| {
                tick += 1;
                let expired = Instant::now() >= deadline;
                let payload = (!expired && tick % sample_every == 0).then(|| {
                    sent += 1;
                    json!({
                        "ts": now_ms(),
                        "content": format!("hello from {vu} numero {tick}"),
                    })
                });
                broadcast_tick(channel.clone(), payload, expired, settings.think_time())
            })
            .await
            .with_context(|| format!("broadcast loop for user {vu}"))?;

        // Let in-flight broadcasts land before tallying.
        tokio::time::sleep(settings.think_time()).await;
        report.broadcasts_sent = sent;
        report.messages_received = received.load(Ordering::Relaxed);
        report.rtt_ms = std::mem::take(&mut *rtts.lock().unwrap_or_else(PoisonError::into_inner));
        report.check("received broadcasts", report.messages_received > 0 || sent == 0);
        Ok(finish(client, report).await)
    }
}

async fn broadcast_tick(
    channel: Channel,
    payload: Option<Value>,
    expired: bool,
    think_time: Duration,
) -> crate::error::Result<ControlFlow<()>> {
    if expired {
        return Ok(ControlFlow::Break(()));
    }
    if let Some(payload) = payload {
        channel.perform("broadcast", payload).await?;
    }
    tokio::time::sleep(think_time).await;
    Ok(ControlFlow::Continue(()))
}

pub struct TurboScenario {
    settings: ScenarioSettings,
}

impl TurboScenario {
    fn resolve_cable_url(page_url: &str, cable_url: &str) -> Result<String> {
        let mut resolved = Self::resolve_page_link(page_url, cable_url)?;
        let scheme = match resolved.scheme() {
            "http" => Some("ws"),
            "https" => Some("wss"),
            _ => None,
        };
        if let Some(scheme) = scheme {
            resolved
                .set_scheme(scheme)
                .map_err(|_| anyhow::anyhow!("cannot switch {resolved} to {scheme}"))?;
        }
        Ok(resolved.to_string())
    }

    fn resolve_page_link(page_url: &str, link: &str) -> Result<url::Url> {
        let page =
            url::Url::parse(page_url).with_context(|| format!("invalid page url {page_url}"))?;
        page.join(link)
            .with_context(|| format!("invalid link {link} on {page_url}"))
    }

    fn session_cookies(
        configured: Option<&str>,
        headers: &reqwest::header::HeaderMap,
    ) -> Option<String> {
        let mut pairs: Vec<String> = configured
            .map(|raw| {
                raw.split(';')
                    .map(str::trim)
                    .filter(|pair| !pair.is_empty())
                    .map(str::to_owned)
                    .collect()
            })
            .unwrap_or_default();
        for value in headers.get_all(reqwest::header::SET_COOKIE) {
            let Some(pair) = value
                .to_str()
                .ok()
                .and_then(|raw| raw.split(';').next())
                .map(str::trim)
                .filter(|pair| pair.contains('='))
            else {
                continue;
            };
            let name = pair.split('=').next().unwrap_or_default();
            pairs.retain(|existing| existing.split('=').next() != Some(name));
            pairs.push(pair.to_owned());
        }
        (!pairs.is_empty()).then(|| pairs.join("; "))
    }

    fn form_fields(html: &str, message: String) -> Vec<(String, String)> {
        let mut fields = Vec::with_capacity(2);
        if let (Some(param), Some(token)) = (rails::csrf_param(html), rails::csrf_token(html)) {
            fields.push((param, token));
        }
        fields.push(("message".to_owned(), message));
        fields
    }
}

/// Turbo broadcasts arrive as HTML strings.
fn authored_by(message: &Message, user_id: &str) -> bool {
    let marker = format!("data-author-id=\"{user_id}\"");
    match message.body() {
        Value::String(html) => html.contains(&marker),
        Value::Object(fields) => fields
            .values()
            .filter_map(Value::as_str)
            .any(|html| html.contains(&marker)),
        _ => false,
    }
}

#[async_trait]
impl Scenario for TurboScenario {
    fn kind(&self) -> ScenarioKind {
        ScenarioKind::Turbo
    }

    async fn iteration(&self, vu: usize, _iteration: usize) -> Result<ScenarioReport> {
        let settings = &self.settings;
        let mut report = ScenarioReport::default();
        let page_url = settings
            .page_url
            .as_deref()
            .context("turbo.page_url is required for the turbo scenario")?;
        let mut options = settings.connect_options(vu, true);

        let http = reqwest::Client::builder()
            .timeout(options.handshake_timeout())
            .build()
            .context("failed building http client")?;
        let mut request = http.get(page_url);
        if let Some(cookies) = options.cookies.as_deref() {
            request = request.header(reqwest::header::COOKIE, cookies);
        }
        let response = request
            .send()
            .await
            .with_context(|| format!("GET {page_url}"))?;
        if !report.check("is status 200", response.status() == reqwest::StatusCode::OK) {
            return Ok(abandon(report));
        }
        options.cookies = Self::session_cookies(options.cookies.as_deref(), response.headers());
        let html = response.text().await.context("reading page body")?;

        let Some(cable_url) = rails::cable_url(&html) else {
            report.check("found cable url", false);
            return Ok(abandon(report));
        };
        report.check("found cable url", true);
        let Some(stream_name) = rails::turbo_stream_name(&html) else {
            report.check("found turbo stream", false);
            return Ok(abandon(report));
        };
        report.check("found turbo stream", true);
        let Some(form_link) = settings
            .form_url
            .clone()
            .or_else(|| rails::form_action(&html))
        else {
            report.check("found chat form", false);
            return Ok(abandon(report));
        };
        report.check("found chat form", true);
        let form_url = Self::resolve_page_link(page_url, &form_link)?;

        let ws_url = Self::resolve_cable_url(page_url, &cable_url)?;
        let cookies = options.cookies.clone();
        let Some(client) = connect_checked(&ws_url, options, &mut report).await else {
            return Ok(abandon(report));
        };
        let channel = match client
            .subscribe(&settings.channel, json!({"signed_stream_name": stream_name}))
            .await
        {
            Ok(channel) => channel,
            Err(err) => {
                warn!("subscribe to {} failed: {err}", settings.channel);
                report.check("successful subscription", false);
                return Ok(finish(client, report).await);
            }
        };
        report.check("successful subscription", true);

        let user_id = ScenarioSettings::user_id(vu);
        for _ in 0..CHAT_ROUNDS {
            let started = Instant::now();
            let fields = Self::form_fields(&html, format!("hello from Kay{user_id}"));
            let mut post = http.post(form_url.clone()).form(&fields);
            if let Some(cookies) = cookies.as_deref() {
                post = post.header(reqwest::header::COOKIE, cookies);
            }
            let submitted = match post.send().await {
                Ok(response) => response.status() == reqwest::StatusCode::OK,
                Err(err) => {
                    warn!("POST {form_url} failed: {err}");
                    false
                }
            };
            if !report.check("form submitted", submitted) {
                break;
            }

            let author = user_id.clone();
            let own = channel
                .receive(Filter::predicate(move |message| authored_by(message, &author)))
                .await?;
            if report.check("received its own message", own.is_some()) {
                report.messages_received += 1;
                report.rtt_ms.push(elapsed_ms(started));
            }
            tokio::time::sleep(settings.think_time()).await;
        }
        Ok(finish(client, report).await)
    }
}
