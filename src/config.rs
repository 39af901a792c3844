use std::collections::HashMap;
use std::env;
use std::path::Path;
use std::time::Duration;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::codec::Codec;
use crate::error::CableError;

const DEFAULT_HANDSHAKE_TIMEOUT_S: u64 = 60;
const DEFAULT_RECEIVE_TIMEOUT_MS: u64 = 1_000;
const DEFAULT_SEND_QUEUE_CAPACITY: usize = 256;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
pub struct ConnectOptions {
    #[serde(default)]
    pub headers: HashMap<String, String>,
    #[serde(default)]
    pub cookies: Option<String>,
    #[serde(default)]
    pub tags: HashMap<String, String>,
    #[serde(default)]
    pub codec: Codec,
    #[serde(default = "default_handshake_timeout_s")]
    pub handshake_timeout_s: u64,
    #[serde(default = "default_receive_timeout_ms")]
    pub receive_timeout_ms: u64,
    #[serde(default)]
    pub subscribe_timeout_ms: Option<u64>,
    #[serde(default)]
    pub inbox_capacity: Option<usize>,
    #[serde(default = "default_send_queue_capacity")]
    pub send_queue_capacity: usize,
}

impl Default for ConnectOptions {
    fn default() -> Self {
        Self {
            headers: HashMap::new(),
            cookies: None,
            tags: HashMap::new(),
            codec: Codec::default(),
            handshake_timeout_s: default_handshake_timeout_s(),
            receive_timeout_ms: default_receive_timeout_ms(),
            subscribe_timeout_ms: None,
            inbox_capacity: None,
            send_queue_capacity: default_send_queue_capacity(),
        }
    }
}

impl ConnectOptions {
    /// `null` yields the defaults; unknown keys are rejected.
    pub fn from_value(value: Value) -> std::result::Result<Self, CableError> {
        if value.is_null() {
            return Ok(Self::default());
        }
        let options: Self = serde_json::from_value(value)
            .map_err(|err| CableError::InvalidOptions(err.to_string()))?;
        options.validate()?;
        Ok(options)
    }

    pub fn validate(&self) -> std::result::Result<(), CableError> {
        if self.send_queue_capacity == 0 {
            return Err(CableError::InvalidOptions(
                "sendQueueCapacity must be > 0".to_owned(),
            ));
        }
        if self.inbox_capacity == Some(0) {
            return Err(CableError::InvalidOptions(
                "inboxCapacity must be > 0 when provided".to_owned(),
            ));
        }
        Ok(())
    }

    pub fn handshake_timeout(&self) -> Duration {
        if self.handshake_timeout_s == 0 {
            return Duration::from_secs(DEFAULT_HANDSHAKE_TIMEOUT_S);
        }
        Duration::from_secs(self.handshake_timeout_s)
    }

    pub fn receive_timeout(&self) -> Duration {
        if self.receive_timeout_ms == 0 {
            return Duration::from_millis(DEFAULT_RECEIVE_TIMEOUT_MS);
        }
        Duration::from_millis(self.receive_timeout_ms)
    }

    pub fn subscribe_timeout(&self) -> Duration {
        match self.subscribe_timeout_ms {
            Some(ms) if ms > 0 => Duration::from_millis(ms),
            _ => self.receive_timeout(),
        }
    }

    pub fn tag_summary(&self) -> String {
        let mut tags = self
            .tags
            .iter()
            .map(|(key, value)| format!("{key}={value}"))
            .collect::<Vec<_>>();
        tags.sort();
        tags.join(",")
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ScenarioKind {
    Echo,
    Chat,
    Broadcast,
    Turbo,
}

impl ScenarioKind {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Echo => "echo",
            Self::Chat => "chat",
            Self::Broadcast => "broadcast",
            Self::Turbo => "turbo",
        }
    }

    fn default_channel(self) -> &'static str {
        match self {
            Self::Echo | Self::Broadcast => "BenchmarkChannel",
            Self::Chat => "ChatChannel",
            Self::Turbo => "Turbo::StreamsChannel",
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    pub target: TargetConfig,
    #[serde(default)]
    pub load: LoadConfig,
    #[serde(default)]
    pub connect: ConnectOptions,
    #[serde(default)]
    pub turbo: TurboConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TargetConfig {
    pub url: String,
    #[serde(default = "default_scenario")]
    pub scenario: ScenarioKind,
    #[serde(default)]
    pub channel: Option<String>,
    #[serde(default)]
    pub params: Map<String, Value>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoadConfig {
    #[serde(default = "default_vus")]
    pub vus: usize,
    #[serde(default = "default_iterations")]
    pub iterations: usize,
    #[serde(default = "default_duration_secs")]
    pub duration_secs: u64,
    #[serde(default = "default_think_time_ms")]
    pub think_time_ms: u64,
    #[serde(default = "default_sample_every")]
    pub sample_every: u64,
}

impl Default for LoadConfig {
    fn default() -> Self {
        Self {
            vus: default_vus(),
            iterations: default_iterations(),
            duration_secs: default_duration_secs(),
            think_time_ms: default_think_time_ms(),
            sample_every: default_sample_every(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct TurboConfig {
    #[serde(default)]
    pub page_url: Option<String>,
    #[serde(default)]
    pub form_url: Option<String>,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            target: TargetConfig {
                url: "ws://localhost:8080/cable".to_owned(),
                scenario: default_scenario(),
                channel: None,
                params: Map::new(),
            },
            load: LoadConfig::default(),
            connect: ConnectOptions::default(),
            turbo: TurboConfig::default(),
        }
    }
}

impl Config {
    pub fn load(path: &Path) -> Result<Self> {
        let mut cfg = if path.exists() {
            let text = std::fs::read_to_string(path)
                .with_context(|| format!("failed reading config file {}", path.display()))?;
            toml::from_str::<Config>(&text)
                .with_context(|| format!("failed parsing TOML config {}", path.display()))?
        } else {
            Self::default()
        };
        cfg.apply_env_overrides();
        cfg.validate()?;
        Ok(cfg)
    }

    pub fn apply_cli_overrides(
        &mut self,
        url: Option<&str>,
        scenario: Option<ScenarioKind>,
        vus: Option<usize>,
        iterations: Option<usize>,
    ) {
        if let Some(url) = url {
            self.target.url = url.to_owned();
        }
        if let Some(scenario) = scenario {
            self.target.scenario = scenario;
        }
        if let Some(vus) = vus {
            self.load.vus = vus;
        }
        if let Some(iterations) = iterations {
            self.load.iterations = iterations;
        }
    }

    pub fn channel_name(&self) -> String {
        self.target
            .channel
            .as_deref()
            .map(str::trim)
            .filter(|name| !name.is_empty())
            .unwrap_or_else(|| self.target.scenario.default_channel())
            .to_owned()
    }

    fn apply_env_overrides(&mut self) {
        if let Ok(v) = env::var("CABLE_LOADGEN_URL") {
            let trimmed = v.trim();
            if !trimmed.is_empty() {
                self.target.url = trimmed.to_owned();
            }
        }
        if let Ok(v) = env::var("CABLE_LOADGEN_SCENARIO") {
            if let Some(kind) = parse_scenario_kind(&v) {
                self.target.scenario = kind;
            }
        }
        if let Ok(v) = env::var("CABLE_LOADGEN_VUS") {
            if let Ok(n) = v.trim().parse::<usize>() {
                self.load.vus = n.max(1);
            }
        }
        if let Ok(v) = env::var("CABLE_LOADGEN_ITERATIONS") {
            if let Ok(n) = v.trim().parse::<usize>() {
                self.load.iterations = n.max(1);
            }
        }
        if let Ok(v) = env::var("CABLE_LOADGEN_RECEIVE_TIMEOUT_MS") {
            if let Ok(n) = v.trim().parse::<u64>() {
                self.connect.receive_timeout_ms = n.max(1);
            }
        }
        if let Ok(v) = env::var("CABLE_LOADGEN_COOKIES") {
            let trimmed = v.trim();
            self.connect.cookies = if trimmed.is_empty() {
                None
            } else {
                Some(trimmed.to_owned())
            };
        }
    }

    pub fn validate(&self) -> Result<()> {
        let url = self.target.url.trim();
        if url.is_empty() {
            anyhow::bail!("target.url must not be empty");
        }
        let parsed =
            url::Url::parse(url).with_context(|| format!("target.url is not a valid URL: {url}"))?;
        if !matches!(parsed.scheme(), "ws" | "wss") {
            anyhow::bail!("target.url must use ws:// or wss://, got {}", parsed.scheme());
        }
        if self.load.vus == 0 {
            anyhow::bail!("load.vus must be > 0");
        }
        if self.load.iterations == 0 {
            anyhow::bail!("load.iterations must be > 0");
        }
        if self.load.sample_every == 0 {
            anyhow::bail!("load.sample_every must be > 0");
        }
        if self.target.scenario == ScenarioKind::Broadcast && self.load.duration_secs == 0 {
            anyhow::bail!("load.duration_secs must be > 0 for the broadcast scenario");
        }
        if self.target.scenario == ScenarioKind::Turbo
            && self
                .turbo
                .page_url
                .as_deref()
                .map(str::trim)
                .unwrap_or_default()
                .is_empty()
        {
            anyhow::bail!("turbo.page_url is required for the turbo scenario");
        }
        self.connect
            .validate()
            .map_err(|err| anyhow::anyhow!("connect: {err}"))?;
        Ok(())
    }
}

pub fn parse_scenario_kind(s: &str) -> Option<ScenarioKind> {
    match s.trim().to_ascii_lowercase().as_str() {
        "echo" => Some(ScenarioKind::Echo),
        "chat" => Some(ScenarioKind::Chat),
        "broadcast" | "benchmark" => Some(ScenarioKind::Broadcast),
        "turbo" | "hotwire" => Some(ScenarioKind::Turbo),
        _ => None,
    }
}

fn default_handshake_timeout_s() -> u64 {
    DEFAULT_HANDSHAKE_TIMEOUT_S
}

fn default_receive_timeout_ms() -> u64 {
    DEFAULT_RECEIVE_TIMEOUT_MS
}

fn default_send_queue_capacity() -> usize {
    DEFAULT_SEND_QUEUE_CAPACITY
}

fn default_scenario() -> ScenarioKind {
    ScenarioKind::Echo
}

fn default_vus() -> usize {
    1
}

fn default_iterations() -> usize {
    1
}

fn default_duration_secs() -> u64 {
    30
}

fn default_think_time_ms() -> u64 {
    50
}

fn default_sample_every() -> u64 {
    5
}
