//! Orchestrator: the per-utterance state machine.
//!
//! Cloneable handle. A single worker task runs utterances one at a time:
//!
//! - **Pending slot**: depth one. A newer chat event replaces (drops) an
//!   older one that has not started yet.
//! - **Epoch**: `mute()` bumps it. The running utterance notices at its next
//!   suspension point, discards its audio, and goes `Cancelled` → `Idle`.
//! - **Status**: published on a `watch` channel after every transition.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, PoisonError};

use chrono::Utc;
use cohost_core::text_prep::{is_speakable, prepare_for_speech};
use cohost_core::types::{
    ChatEvent, ContextView, DeviceInfo, ErrorReport, HealthReport, PipelineConfig,
    PipelineStatus, Turn, UtteranceState, VoiceParams,
};
use tokio::sync::{Notify, watch};
use tracing::{debug, error, info};

use crate::audio_cache::AudioCache;
use crate::cancel::{CancelToken, Epoch};
use crate::context::ContextStore;
use crate::device::{CpalHost, DeviceManager, OutputHost};
use crate::error::{BackendKind, Error, Result};
use crate::generator::{OpenAiChatBackend, ReasoningBackend, ResponseGenerator};
use crate::response_cache::{ResponseCache, ResponseKey};
use crate::synth::{KokoroBackend, SpeechSynthesizer, VoiceBackend};

struct Inner {
    config: PipelineConfig,
    voice: VoiceParams,
    context: ContextStore,
    responses: ResponseCache,
    generator: Arc<ResponseGenerator>,
    synthesizer: SpeechSynthesizer,
    audio_cache: Arc<AudioCache>,
    device: Arc<DeviceManager>,
    pending: Mutex<Option<ChatEvent>>,
    wake: Notify,
    epoch: Epoch,
    status_tx: watch::Sender<PipelineStatus>,
    shutdown: AtomicBool,
}

/// The co-host pipeline service.
#[derive(Clone)]
pub struct Orchestrator {
    inner: Arc<Inner>,
}

impl Orchestrator {
    /// Build the pipeline on explicit backends and start its worker task.
    /// Must be called inside a tokio runtime.
    pub fn new(
        config: PipelineConfig,
        reasoning: Arc<dyn ReasoningBackend>,
        voice: Arc<dyn VoiceBackend>,
        output: Arc<dyn OutputHost>,
    ) -> Result<Self> {
        config.validate().map_err(Error::Config)?;

        let audio_cache = Arc::new(AudioCache::open(&config.cache)?);
        let generator = Arc::new(ResponseGenerator::new(reasoning, &config.reasoning));
        let synthesizer =
            SpeechSynthesizer::new(voice, audio_cache.clone(), &config.voice, &config.audio);
        let device = Arc::new(DeviceManager::new(
            output,
            config.audio.device_index,
            config.audio.format(),
        ));
        let (status_tx, _) = watch::channel(PipelineStatus::default());

        let inner = Arc::new(Inner {
            voice: config.voice.params(),
            context: ContextStore::new(config.context_window),
            responses: ResponseCache::new(),
            generator,
            synthesizer,
            audio_cache,
            device,
            pending: Mutex::new(None),
            wake: Notify::new(),
            epoch: Epoch::new(),
            status_tx,
            shutdown: AtomicBool::new(false),
            config,
        });

        tokio::spawn(worker_loop(inner.clone()));
        info!(
            window = inner.config.context_window,
            voice = %inner.voice.voice,
            "orchestrator started"
        );
        Ok(Self { inner })
    }

    /// Build the pipeline on the HTTP backends and the system audio host.
    pub fn from_config(config: PipelineConfig) -> Result<Self> {
        let reasoning = Arc::new(OpenAiChatBackend::new(&config.reasoning));
        let voice = Arc::new(KokoroBackend::new(&config.voice));
        Self::new(config, reasoning, voice, Arc::new(CpalHost))
    }

    /// Chat-event ingestion point. Never blocks; if a request is already
    /// waiting it is dropped in favour of this one.
    pub fn submit(&self, event: ChatEvent) {
        {
            let mut pending = self.lock_pending();
            if let Some(old) = pending.replace(event) {
                info!(user = %old.username, "pending request dropped for a newer one");
                update_status(&self.inner.status_tx, |s| s.requests_dropped += 1);
            }
            update_status(&self.inner.status_tx, |s| s.pending = true);
        }
        self.inner.wake.notify_one();
    }

    /// Emergency mute: cancel the running utterance and discard the pending
    /// request.
    pub fn mute(&self) {
        let mut pending = self.lock_pending();
        let epoch = self.inner.epoch.bump();
        let discarded = pending.take().is_some();
        info!(epoch, discarded, "mute");
        update_status(&self.inner.status_tx, |s| {
            s.pending = false;
            if s.state != UtteranceState::Idle {
                s.state = UtteranceState::Cancelled;
            }
        });
    }

    pub fn status(&self) -> PipelineStatus {
        self.inner.status_tx.borrow().clone()
    }

    pub fn subscribe_status(&self) -> watch::Receiver<PipelineStatus> {
        self.inner.status_tx.subscribe()
    }

    /// Probe both backends and the output device concurrently.
    pub async fn health(&self) -> HealthReport {
        let (reasoning, voice, device) = tokio::join!(
            self.inner.generator.health(),
            self.inner.synthesizer.health(),
            self.inner.device.current(),
        );
        HealthReport {
            reasoning,
            voice,
            output_device: device.ok().map(|d| d.name),
        }
    }

    pub fn context(&self) -> ContextView {
        self.inner.context.view()
    }

    pub fn clear_context(&self) {
        self.inner.context.clear();
        info!("context cleared");
    }

    /// Empty the response cache and the audio cache (memory and disk).
    pub fn clear_caches(&self) {
        self.inner.responses.clear();
        self.inner.audio_cache.clear();
        info!("caches cleared");
    }

    pub async fn devices(&self) -> Result<Vec<DeviceInfo>> {
        self.inner.device.devices().await
    }

    pub fn config(&self) -> &PipelineConfig {
        &self.inner.config
    }

    /// Stop the worker after cancelling any running utterance.
    pub fn shutdown(&self) {
        self.inner.shutdown.store(true, Ordering::SeqCst);
        self.inner.epoch.bump();
        self.inner.wake.notify_one();
    }

    fn lock_pending(&self) -> std::sync::MutexGuard<'_, Option<ChatEvent>> {
        self.inner
            .pending
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
    }
}

// ─── Worker ───────────────────────────────────────────────────────────────

async fn worker_loop(inner: Arc<Inner>) {
    loop {
        // Taking the event and its token under the pending lock means a
        // mute either discards the event or cancels the token.
        let (event, cancel) = loop {
            if inner.shutdown.load(Ordering::SeqCst) {
                debug!("orchestrator worker stopped");
                return;
            }
            {
                let mut pending = inner.pending.lock().unwrap_or_else(PoisonError::into_inner);
                if let Some(event) = pending.take() {
                    update_status(&inner.status_tx, |s| s.pending = false);
                    break (event, inner.epoch.token());
                }
            }
            inner.wake.notified().await;
        };

        match run_utterance(&inner, event, &cancel).await {
            Ok(()) => update_status(&inner.status_tx, |s| {
                s.state = UtteranceState::Idle;
                s.utterances_completed += 1;
            }),
            Err(Error::Cancelled) => {
                debug!("utterance cancelled");
                update_status(&inner.status_tx, |s| {
                    s.state = UtteranceState::Cancelled;
                    s.utterances_cancelled += 1;
                });
                update_status(&inner.status_tx, |s| s.state = UtteranceState::Idle);
            }
            Err(e) => {
                error!(kind = e.kind(), "utterance failed: {e}");
                update_status(&inner.status_tx, |s| {
                    s.state = UtteranceState::Idle;
                    s.last_error = Some(ErrorReport {
                        kind: e.kind().to_string(),
                        message: e.to_string(),
                        at: Utc::now(),
                    });
                });
            }
        }
    }
}

async fn run_utterance(inner: &Arc<Inner>, event: ChatEvent, cancel: &CancelToken) -> Result<()> {
    transition(inner, cancel, UtteranceState::Generating)?;

    let context = inner.context.snapshot();
    let key = ResponseKey::derive(&context, &event.username, &event.text);
    let speaker = event.username.clone();
    let message = event.text.clone();
    inner.context.append(event.into_turn());

    let reply = match inner.responses.get(&key) {
        Some(reply) => {
            debug!(key = %key, "response cache hit");
            reply
        }
        None => {
            let reply = generate_detached(inner, context, speaker, message, cancel).await?;
            inner
                .responses
                .put(key, reply.clone(), inner.config.cache.response_ttl());
            reply
        }
    };
    cancel.check()?;
    info!(reply = %reply, "reply ready");

    if inner.config.record_replies {
        inner
            .context
            .append(Turn::assistant(&inner.config.bot_name, &reply));
    }

    let speech = prepare_for_speech(&reply);
    if !is_speakable(&speech) {
        debug!("nothing speakable in reply, skipping playback");
        return Ok(());
    }

    transition(inner, cancel, UtteranceState::Synthesizing)?;
    let audio = tokio::select! {
        r = inner.synthesizer.synthesize(&speech, &inner.voice, cancel) => r?,
        _ = cancel.cancelled() => return Err(Error::Cancelled),
    };

    transition(inner, cancel, UtteranceState::Playing)?;
    inner.device.play(Arc::new(audio), cancel.clone()).await
}

/// Run generation on its own task. On cancellation the task is left to
/// finish its in-flight call in the background; it starts no new attempt
/// and its result is dropped.
async fn generate_detached(
    inner: &Arc<Inner>,
    context: Vec<Turn>,
    speaker: String,
    message: String,
    cancel: &CancelToken,
) -> Result<String> {
    let generator = inner.generator.clone();
    let stats = inner.context.stats();
    let token = cancel.clone();
    let task = tokio::spawn(async move {
        generator
            .generate(&context, &speaker, &message, &stats, &token)
            .await
    });
    tokio::select! {
        joined = task => joined.map_err(|e| {
            Error::backend_error(BackendKind::Reasoning, format!("generation task failed: {e}"))
        })?,
        _ = cancel.cancelled() => Err(Error::Cancelled),
    }
}

/// Move to `state` unless the utterance has been cancelled.
fn transition(inner: &Inner, cancel: &CancelToken, state: UtteranceState) -> Result<()> {
    cancel.check()?;
    debug!(?state, "utterance state");
    // Checked again under the channel lock so a concurrent mute wins.
    update_status(&inner.status_tx, |s| {
        if !cancel.is_cancelled() {
            s.state = state;
        }
    });
    cancel.check()
}

fn update_status(tx: &watch::Sender<PipelineStatus>, f: impl FnOnce(&mut PipelineStatus)) {
    tx.send_modify(f);
}
