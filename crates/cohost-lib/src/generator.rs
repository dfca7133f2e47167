//! Response generator: prompt assembly, reasoning backend calls, cleaning.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use cohost_core::text_prep::clean_response;
use cohost_core::types::{ChatStats, ReasoningConfig, Role, Turn};
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::cancel::CancelToken;
use crate::error::{BackendKind, Error, Result};
use crate::retry::{RetryPolicy, is_retryable_status, with_retry_detached, with_timeout};

/// Deadline for the reasoning health probe.
const HEALTH_TIMEOUT: Duration = Duration::from_secs(5);

/// Everything the reasoning backend needs for one reply.
#[derive(Debug, Clone)]
pub struct ReasoningRequest {
    pub system: String,
    pub context: Vec<Turn>,
    pub speaker: String,
    pub message: String,
}

impl ReasoningRequest {
    /// Chat-completion messages as `(role, content)` pairs. Viewer turns are
    /// prefixed with the speaker's name; the co-host's own turns are sent
    /// verbatim.
    pub fn messages(&self) -> Vec<(&'static str, String)> {
        let mut out = Vec::with_capacity(self.context.len() + 2);
        out.push(("system", self.system.clone()));
        for turn in &self.context {
            match turn.role() {
                Role::User => out.push(("user", format!("{}: {}", turn.speaker(), turn.text()))),
                Role::Assistant => out.push(("assistant", turn.text().to_string())),
            }
        }
        out.push(("user", format!("{}: {}", self.speaker, self.message)));
        out
    }
}

/// A reasoning service with a request/response contract.
#[async_trait]
pub trait ReasoningBackend: Send + Sync {
    /// Raw, uncleaned completion text.
    async fn complete(&self, request: &ReasoningRequest) -> Result<String>;

    /// Whether the service answers at all.
    async fn health(&self) -> bool;
}

// ─── OpenAI-compatible HTTP backend ───────────────────────────────────────

#[derive(Serialize)]
struct ChatMessage {
    role: &'static str,
    content: String,
}

#[derive(Serialize)]
struct ChatRequest<'a> {
    model: &'a str,
    messages: Vec<ChatMessage>,
    max_tokens: u32,
    temperature: f32,
    top_p: f32,
}

#[derive(Deserialize)]
struct ChatResponse {
    #[serde(default)]
    choices: Vec<Choice>,
}

#[derive(Deserialize)]
struct Choice {
    message: Option<ChoiceMessage>,
}

#[derive(Deserialize)]
struct ChoiceMessage {
    content: Option<String>,
}

/// `POST {base_url}/chat/completions` against LM Studio, llama.cpp server,
/// or anything else speaking the OpenAI chat API.
pub struct OpenAiChatBackend {
    client: reqwest::Client,
    base_url: String,
    model: String,
    max_tokens: u32,
    temperature: f32,
    top_p: f32,
}

impl OpenAiChatBackend {
    pub fn new(config: &ReasoningConfig) -> Self {
        Self {
            client: reqwest::Client::new(),
            base_url: config.base_url.trim_end_matches('/').to_string(),
            model: config.model.clone(),
            max_tokens: config.max_tokens,
            temperature: config.temperature,
            top_p: config.top_p,
        }
    }
}

#[async_trait]
impl ReasoningBackend for OpenAiChatBackend {
    async fn complete(&self, request: &ReasoningRequest) -> Result<String> {
        let body = ChatRequest {
            model: &self.model,
            messages: request
                .messages()
                .into_iter()
                .map(|(role, content)| ChatMessage { role, content })
                .collect(),
            max_tokens: self.max_tokens,
            temperature: self.temperature,
            top_p: self.top_p,
        };

        let resp = self
            .client
            .post(format!("{}/chat/completions", self.base_url))
            .json(&body)
            .send()
            .await
            .map_err(|e| Error::backend_error(BackendKind::Reasoning, e.to_string()))?;

        let status = resp.status();
        if !status.is_success() {
            let text = resp.text().await.unwrap_or_default();
            let message = format!("HTTP {status}: {text}");
            return Err(if is_retryable_status(status.as_u16()) {
                Error::backend_error(BackendKind::Reasoning, message)
            } else {
                Error::malformed(BackendKind::Reasoning, message)
            });
        }

        let parsed: ChatResponse = resp
            .json()
            .await
            .map_err(|e| Error::malformed(BackendKind::Reasoning, e.to_string()))?;

        parsed
            .choices
            .into_iter()
            .next()
            .and_then(|c| c.message)
            .and_then(|m| m.content)
            .ok_or_else(|| Error::malformed(BackendKind::Reasoning, "no choices[0].message.content"))
    }

    async fn health(&self) -> bool {
        let probe = self
            .client
            .get(format!("{}/models", self.base_url))
            .timeout(HEALTH_TIMEOUT)
            .send()
            .await;
        matches!(probe, Ok(resp) if resp.status().is_success())
    }
}

// ─── Generator ────────────────────────────────────────────────────────────

/// Append chat statistics to the base preamble.
pub fn build_preamble(base: &str, stats: &ChatStats) -> String {
    let mut preamble = base.trim_end().to_string();
    if stats.total_messages > 0 {
        preamble.push_str(&format!(
            "\n\nChat so far: {} messages from {} chatters, {} active in the last 5 minutes.",
            stats.total_messages, stats.unique_speakers, stats.active_speakers
        ));
    }
    if !stats.top_emotes.is_empty() {
        let names: Vec<&str> = stats.top_emotes.iter().map(|e| e.emote.as_str()).collect();
        preamble.push_str(&format!(" Popular emotes: {}.", names.join(", ")));
    }
    preamble
}

/// Turns context plus a new message into a cleaned reply.
pub struct ResponseGenerator {
    backend: Arc<dyn ReasoningBackend>,
    preamble: String,
    timeout: Duration,
    policy: RetryPolicy,
}

impl ResponseGenerator {
    pub fn new(backend: Arc<dyn ReasoningBackend>, config: &ReasoningConfig) -> Self {
        Self {
            backend,
            preamble: config.system_preamble.clone(),
            timeout: config.timeout(),
            policy: RetryPolicy::new(config.max_retries, config.initial_backoff()),
        }
    }

    /// Generate a reply. Each backend call is bounded by the configured
    /// timeout; transient failures are retried with backoff. A reply that is
    /// empty after cleaning is a protocol error.
    ///
    /// Once `cancel` fires no new attempt starts. An attempt already in
    /// flight runs to completion and the call returns `Cancelled`.
    pub async fn generate(
        &self,
        context: &[Turn],
        speaker: &str,
        message: &str,
        stats: &ChatStats,
        cancel: &CancelToken,
    ) -> Result<String> {
        let request = ReasoningRequest {
            system: build_preamble(&self.preamble, stats),
            context: context.to_vec(),
            speaker: speaker.to_string(),
            message: message.to_string(),
        };

        let backend = &self.backend;
        let request = &request;
        let timeout = self.timeout;
        let started = tokio::time::Instant::now();
        let raw = with_retry_detached(&self.policy, cancel, "reasoning", move || {
            with_timeout(BackendKind::Reasoning, timeout, backend.complete(request))
        })
        .await?;

        let cleaned = clean_response(&raw);
        debug!(
            elapsed_ms = started.elapsed().as_millis() as u64,
            raw_len = raw.len(),
            len = cleaned.len(),
            "reasoning reply"
        );
        if cleaned.is_empty() {
            warn!("reasoning reply empty after cleaning: {raw:?}");
            return Err(Error::malformed(
                BackendKind::Reasoning,
                "reply empty after cleaning",
            ));
        }
        Ok(cleaned)
    }

    pub async fn health(&self) -> bool {
        self.backend.health().await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use cohost_core::types::EmoteCount;
    use std::collections::VecDeque;
    use std::sync::Mutex;

    struct Scripted {
        replies: Mutex<VecDeque<Result<String>>>,
        seen: Mutex<Vec<ReasoningRequest>>,
    }

    impl Scripted {
        fn new(replies: Vec<Result<String>>) -> Arc<Self> {
            Arc::new(Self {
                replies: Mutex::new(replies.into()),
                seen: Mutex::new(Vec::new()),
            })
        }
    }

    #[async_trait]
    impl ReasoningBackend for Scripted {
        async fn complete(&self, request: &ReasoningRequest) -> Result<String> {
            self.seen.lock().unwrap().push(request.clone());
            self.replies
                .lock()
                .unwrap()
                .pop_front()
                .unwrap_or_else(|| Err(Error::backend_error(BackendKind::Reasoning, "exhausted")))
        }

        async fn health(&self) -> bool {
            true
        }
    }

    fn config() -> ReasoningConfig {
        ReasoningConfig {
            initial_backoff_ms: 10,
            ..Default::default()
        }
    }

    #[test]
    fn messages_prefix_viewers_only() {
        let req = ReasoningRequest {
            system: "be nice".into(),
            context: vec![
                Turn::user("ana", "hi", vec![], Utc::now()),
                Turn::assistant("cohost", "hey ana!"),
            ],
            speaker: "bo".into(),
            message: "yo".into(),
        };
        assert_eq!(req.messages(), vec![
            ("system", "be nice".to_string()),
            ("user", "ana: hi".to_string()),
            ("assistant", "hey ana!".to_string()),
            ("user", "bo: yo".to_string()),
        ]);
    }

    #[test]
    fn preamble_includes_stats() {
        let stats = ChatStats {
            total_messages: 12,
            unique_speakers: 4,
            active_speakers: 2,
            top_emotes: vec![
                EmoteCount {
                    emote: "Kappa".into(),
                    count: 5,
                },
                EmoteCount {
                    emote: "LUL".into(),
                    count: 2,
                },
            ],
        };
        let p = build_preamble("Base.", &stats);
        assert!(p.starts_with("Base."));
        assert!(p.contains("12 messages from 4 chatters, 2 active in the last 5 minutes."));
        assert!(p.ends_with("Popular emotes: Kappa, LUL."));
        assert_eq!(build_preamble("Base.", &ChatStats::default()), "Base.");
    }

    #[tokio::test(start_paused = true)]
    async fn cleans_reply() {
        let backend = Scripted::new(vec![Ok("<think>hmm</think>Assistant: Welcome in!".into())]);
        let generator = ResponseGenerator::new(backend.clone(), &config());
        let reply = generator
            .generate(&[], "ana", "hi", &ChatStats::default(), &CancelToken::never())
            .await
            .unwrap();
        assert_eq!(reply, "Welcome in!");
        assert_eq!(backend.seen.lock().unwrap()[0].message, "hi");
    }

    #[tokio::test(start_paused = true)]
    async fn retries_transient_failures() {
        let backend = Scripted::new(vec![
            Err(Error::backend_error(BackendKind::Reasoning, "503")),
            Ok("Hello!".into()),
        ]);
        let generator = ResponseGenerator::new(backend.clone(), &config());
        let reply = generator
            .generate(&[], "ana", "hi", &ChatStats::default(), &CancelToken::never())
            .await
            .unwrap();
        assert_eq!(reply, "Hello!");
        assert_eq!(backend.seen.lock().unwrap().len(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn surfaces_error_after_exhaustion() {
        let backend = Scripted::new(vec![]);
        let generator = ResponseGenerator::new(backend.clone(), &config());
        let err = generator
            .generate(&[], "ana", "hi", &ChatStats::default(), &CancelToken::never())
            .await
            .unwrap_err();
        assert!(matches!(err, Error::Backend { .. }));
        assert_eq!(backend.seen.lock().unwrap().len(), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn empty_after_cleaning_is_malformed() {
        let backend = Scripted::new(vec![Ok("<think>only thinking".into())]);
        let generator = ResponseGenerator::new(backend, &config());
        let err = generator
            .generate(&[], "ana", "hi", &ChatStats::default(), &CancelToken::never())
            .await
            .unwrap_err();
        assert!(matches!(err, Error::MalformedResponse { .. }));
    }

    struct Stalled;

    #[async_trait]
    impl ReasoningBackend for Stalled {
        async fn complete(&self, _request: &ReasoningRequest) -> Result<String> {
            std::future::pending().await
        }

        async fn health(&self) -> bool {
            false
        }
    }

    #[tokio::test(start_paused = true)]
    async fn times_out_each_attempt() {
        let cfg = ReasoningConfig {
            timeout_secs: 2,
            max_retries: 1,
            initial_backoff_ms: 100,
            ..Default::default()
        };
        let generator = ResponseGenerator::new(Arc::new(Stalled), &cfg);
        let start = tokio::time::Instant::now();
        let err = generator
            .generate(&[], "ana", "hi", &ChatStats::default(), &CancelToken::never())
            .await
            .unwrap_err();
        assert!(matches!(err, Error::BackendTimeout { .. }));
        assert!(start.elapsed() >= Duration::from_millis(4100));
        assert!(!generator.health().await);
    }
}
