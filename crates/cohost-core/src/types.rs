//! Shared types for the cohost speech pipeline.
//!
//! These types are used by cohost-lib, cohost-cli, and the chat/dashboard
//! adapters that sit outside the core. Keeping them in cohost-core means
//! adapters can depend on them without pulling in tokio, rodio, or reqwest.

use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::text_prep::DEFAULT_MAX_CHUNK_LEN;

// ─── Conversation types ────────────────────────────────────────────────────

/// Who produced a turn.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    User,
    Assistant,
}

/// One line of conversation. Immutable once created.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Turn {
    speaker: String,
    role: Role,
    text: String,
    tags: Vec<String>,
    timestamp: DateTime<Utc>,
}

impl Turn {
    /// A chat message from a viewer.
    pub fn user(
        speaker: impl Into<String>,
        text: impl Into<String>,
        tags: Vec<String>,
        timestamp: DateTime<Utc>,
    ) -> Self {
        Self {
            speaker: speaker.into(),
            role: Role::User,
            text: text.into(),
            tags,
            timestamp,
        }
    }

    /// A reply spoken by the co-host.
    pub fn assistant(speaker: impl Into<String>, text: impl Into<String>) -> Self {
        Self {
            speaker: speaker.into(),
            role: Role::Assistant,
            text: text.into(),
            tags: Vec::new(),
            timestamp: Utc::now(),
        }
    }

    pub fn speaker(&self) -> &str {
        &self.speaker
    }

    pub fn role(&self) -> Role {
        self.role
    }

    pub fn text(&self) -> &str {
        &self.text
    }

    pub fn tags(&self) -> &[String] {
        &self.tags
    }

    pub fn timestamp(&self) -> DateTime<Utc> {
        self.timestamp
    }
}

/// Chat event pushed in by the chat-platform adapter.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChatEvent {
    pub username: String,
    pub text: String,
    /// Emotes and other platform tags attached to the message.
    #[serde(default)]
    pub tags: Vec<String>,
    #[serde(default = "Utc::now")]
    pub timestamp: DateTime<Utc>,
}

impl ChatEvent {
    pub fn new(username: impl Into<String>, text: impl Into<String>) -> Self {
        Self {
            username: username.into(),
            text: text.into(),
            tags: Vec::new(),
            timestamp: Utc::now(),
        }
    }

    pub fn with_tags(mut self, tags: Vec<String>) -> Self {
        self.tags = tags;
        self
    }

    pub fn into_turn(self) -> Turn {
        Turn::user(self.username, self.text, self.tags, self.timestamp)
    }
}

/// Emote usage count, most used first in [`ChatStats::top_emotes`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct EmoteCount {
    pub emote: String,
    pub count: u64,
}

/// How recently a speaker must have chatted to count as active.
pub const ACTIVE_SPEAKER_WINDOW: Duration = Duration::from_secs(5 * 60);

/// Running chat statistics kept alongside the context window.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ChatStats {
    pub total_messages: u64,
    pub unique_speakers: usize,
    /// Speakers seen within the last [`ACTIVE_SPEAKER_WINDOW`].
    pub active_speakers: usize,
    pub top_emotes: Vec<EmoteCount>,
}

/// Context window plus statistics, as returned by `context()`.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ContextView {
    pub window: usize,
    pub turns: Vec<Turn>,
    pub stats: ChatStats,
}

// ─── Audio types ───────────────────────────────────────────────────────────

/// Voice selection passed to the voice backend.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct VoiceParams {
    pub voice: String,
    pub language: String,
    pub speed: f32,
}

/// Sample rate and channel count of a PCM stream.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AudioFormat {
    pub sample_rate: u32,
    pub channels: u16,
}

/// Supported configuration range reported by an output device.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct OutputCaps {
    pub channels: u16,
    pub min_sample_rate: u32,
    pub max_sample_rate: u32,
}

/// An enumerated output device.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct DeviceInfo {
    /// Position in the host's enumeration order.
    pub index: usize,
    pub name: String,
    pub is_default: bool,
    pub caps: Vec<OutputCaps>,
}

impl DeviceInfo {
    /// Whether any supported configuration covers the sample rate with at
    /// least as many channels as `format` needs.
    pub fn supports(&self, format: AudioFormat) -> bool {
        self.caps.iter().any(|c| {
            c.channels >= format.channels
                && c.min_sample_rate <= format.sample_rate
                && c.max_sample_rate >= format.sample_rate
        })
    }
}

// ─── Pipeline state ────────────────────────────────────────────────────────

/// Per-utterance state machine.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum UtteranceState {
    Idle,
    Generating,
    Synthesizing,
    Playing,
    Cancelled,
}

/// Last error surfaced by an utterance.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ErrorReport {
    /// Taxonomy name, e.g. `transient_backend` or `device_unavailable`.
    pub kind: String,
    pub message: String,
    pub at: DateTime<Utc>,
}

/// Pipeline status snapshot.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct PipelineStatus {
    pub state: UtteranceState,
    pub last_error: Option<ErrorReport>,
    /// A request is waiting in the depth-1 pending slot.
    pub pending: bool,
    pub utterances_completed: u64,
    pub utterances_cancelled: u64,
    pub requests_dropped: u64,
}

impl Default for PipelineStatus {
    fn default() -> Self {
        Self {
            state: UtteranceState::Idle,
            last_error: None,
            pending: false,
            utterances_completed: 0,
            utterances_cancelled: 0,
            requests_dropped: 0,
        }
    }
}

/// Backend reachability.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct HealthReport {
    pub reasoning: bool,
    pub voice: bool,
    /// Name of the selected output device, if one is usable.
    pub output_device: Option<String>,
}

impl HealthReport {
    pub fn healthy(&self) -> bool {
        self.reasoning && self.voice && self.output_device.is_some()
    }
}

// ─── Configuration ─────────────────────────────────────────────────────────

pub const DEFAULT_SYSTEM_PREAMBLE: &str = "You are a friendly and engaging Twitch co-host. \
Respond directly to messages without any meta-commentary. \
Keep responses concise (1-2 sentences), entertaining, and suitable for a live stream. \
Never explain your thought process or how you plan to respond. \
Match the chat's energy and use emotes when appropriate.";

/// Top-level pipeline configuration. Every field has a default, so a partial
/// TOML file is valid.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PipelineConfig {
    /// Number of turns kept in the context window.
    pub context_window: usize,
    /// Append the co-host's own replies to the context window.
    pub record_replies: bool,
    /// Speaker name used for the co-host's turns.
    pub bot_name: String,
    pub reasoning: ReasoningConfig,
    pub voice: VoiceConfig,
    pub audio: AudioConfig,
    pub cache: CacheConfig,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            context_window: 5,
            record_replies: true,
            bot_name: "cohost".into(),
            reasoning: ReasoningConfig::default(),
            voice: VoiceConfig::default(),
            audio: AudioConfig::default(),
            cache: CacheConfig::default(),
        }
    }
}

/// Reasoning backend (OpenAI-compatible chat completions).
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ReasoningConfig {
    pub base_url: String,
    pub model: String,
    pub max_tokens: u32,
    pub temperature: f32,
    pub top_p: f32,
    pub timeout_secs: u64,
    pub max_retries: u32,
    pub initial_backoff_ms: u64,
    pub system_preamble: String,
}

impl Default for ReasoningConfig {
    fn default() -> Self {
        Self {
            base_url: "http://localhost:1234/v1".into(),
            model: "local-model".into(),
            max_tokens: 100,
            temperature: 0.7,
            top_p: 0.95,
            timeout_secs: 10,
            max_retries: 2,
            initial_backoff_ms: 250,
            system_preamble: DEFAULT_SYSTEM_PREAMBLE.into(),
        }
    }
}

impl ReasoningConfig {
    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_secs)
    }

    pub fn initial_backoff(&self) -> Duration {
        Duration::from_millis(self.initial_backoff_ms)
    }
}

/// Voice backend (Kokoro-style `/v1/audio/speech`).
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct VoiceConfig {
    pub base_url: String,
    pub voice: String,
    pub language: String,
    pub speed: f32,
    pub timeout_secs: u64,
    pub max_retries: u32,
    pub initial_backoff_ms: u64,
    /// Sentences longer than this are sub-split before synthesis.
    pub max_chunk_len: usize,
}

impl Default for VoiceConfig {
    fn default() -> Self {
        Self {
            base_url: "http://localhost:8880".into(),
            voice: "af_heart".into(),
            language: "en".into(),
            speed: 1.0,
            timeout_secs: 10,
            max_retries: 2,
            initial_backoff_ms: 250,
            max_chunk_len: DEFAULT_MAX_CHUNK_LEN,
        }
    }
}

impl VoiceConfig {
    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_secs)
    }

    pub fn initial_backoff(&self) -> Duration {
        Duration::from_millis(self.initial_backoff_ms)
    }

    pub fn params(&self) -> VoiceParams {
        VoiceParams {
            voice: self.voice.clone(),
            language: self.language.clone(),
            speed: self.speed,
        }
    }
}

/// Output device and post-processing target.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct AudioConfig {
    /// Preferred device index in host enumeration order. `None` = system default.
    pub device_index: Option<usize>,
    pub sample_rate: u32,
    pub channels: u16,
    /// Peak magnitude ceiling applied after normalization (0, 1].
    pub clip_threshold: f32,
}

impl Default for AudioConfig {
    fn default() -> Self {
        Self {
            device_index: None,
            // Native rate of most desktop outputs; voice audio is resampled up.
            sample_rate: 48_000,
            channels: 1,
            clip_threshold: 0.98,
        }
    }
}

impl AudioConfig {
    pub fn format(&self) -> AudioFormat {
        AudioFormat {
            sample_rate: self.sample_rate,
            channels: self.channels,
        }
    }
}

/// Response and audio cache settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CacheConfig {
    pub response_ttl_secs: u64,
    /// Directory for persisted audio entries. `None` keeps audio in memory only.
    pub audio_dir: Option<std::path::PathBuf>,
    pub audio_max_entries: usize,
    pub audio_max_bytes: u64,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            response_ttl_secs: 300,
            audio_dir: None,
            audio_max_entries: 1000,
            audio_max_bytes: 256 * 1024 * 1024,
        }
    }
}

impl CacheConfig {
    pub fn response_ttl(&self) -> Duration {
        Duration::from_secs(self.response_ttl_secs)
    }
}

impl PipelineConfig {
    /// Reject configurations the pipeline cannot run with.
    pub fn validate(&self) -> Result<(), String> {
        if self.context_window == 0 {
            return Err("context_window must be at least 1".into());
        }
        if self.reasoning.base_url.trim().is_empty() {
            return Err("reasoning.base_url must not be empty".into());
        }
        if self.reasoning.timeout_secs == 0 {
            return Err("reasoning.timeout_secs must be greater than 0".into());
        }
        if self.voice.base_url.trim().is_empty() {
            return Err("voice.base_url must not be empty".into());
        }
        if self.voice.voice.trim().is_empty() {
            return Err("voice.voice must not be empty".into());
        }
        if self.voice.timeout_secs == 0 {
            return Err("voice.timeout_secs must be greater than 0".into());
        }
        if !(self.voice.speed > 0.0) {
            return Err(format!("voice.speed must be positive, got {}", self.voice.speed));
        }
        if self.voice.max_chunk_len < 2 {
            return Err("voice.max_chunk_len must be at least 2".into());
        }
        if !(1..=2).contains(&self.audio.channels) {
            return Err(format!(
                "audio.channels must be 1 or 2, got {}",
                self.audio.channels
            ));
        }
        if !(8_000..=192_000).contains(&self.audio.sample_rate) {
            return Err(format!(
                "audio.sample_rate must be within 8000..=192000, got {}",
                self.audio.sample_rate
            ));
        }
        if !(self.audio.clip_threshold > 0.0 && self.audio.clip_threshold <= 1.0) {
            return Err(format!(
                "audio.clip_threshold must be within (0, 1], got {}",
                self.audio.clip_threshold
            ));
        }
        if self.cache.response_ttl_secs == 0 {
            return Err("cache.response_ttl_secs must be greater than 0".into());
        }
        if self.cache.audio_max_entries == 0 || self.cache.audio_max_bytes == 0 {
            return Err("audio cache limits must be greater than 0".into());
        }
        Ok(())
    }
}
