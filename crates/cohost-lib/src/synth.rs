//! Speech synthesizer: sentence split, per-sentence cache, voice backend
//! calls, post-processing and concatenation.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use cohost_core::audio::{self, AudioBuffer, VOICE_SAMPLE_RATE};
use cohost_core::text_prep::speech_units;
use cohost_core::types::{AudioConfig, AudioFormat, VoiceConfig, VoiceParams};
use futures_util::{StreamExt, TryStreamExt, stream};
use tracing::debug;

use crate::audio_cache::{AudioCache, AudioKey};
use crate::cancel::CancelToken;
use crate::error::{BackendKind, Error, Result};
use crate::retry::{RetryPolicy, is_retryable_status, with_retry, with_timeout};

/// Sentences synthesized ahead of the one being assembled.
const PREFETCH: usize = 2;

/// Deadline for the voice health probe.
const HEALTH_TIMEOUT: Duration = Duration::from_secs(1);

/// A voice service: one sentence in, PCM out.
#[async_trait]
pub trait VoiceBackend: Send + Sync {
    /// Render `text`. `sample_rate` is the rate the caller will play at; a
    /// backend may return another rate and leave resampling to the caller.
    async fn synthesize(
        &self,
        text: &str,
        params: &VoiceParams,
        sample_rate: u32,
    ) -> Result<AudioBuffer>;

    async fn health(&self) -> bool;
}

/// Kokoro-FastAPI style `POST {base_url}/v1/audio/speech`.
pub struct KokoroBackend {
    client: reqwest::Client,
    base_url: String,
}

impl KokoroBackend {
    pub fn new(config: &VoiceConfig) -> Self {
        Self {
            client: reqwest::Client::new(),
            base_url: config.base_url.trim_end_matches('/').to_string(),
        }
    }
}

#[async_trait]
impl VoiceBackend for KokoroBackend {
    async fn synthesize(
        &self,
        text: &str,
        params: &VoiceParams,
        _sample_rate: u32,
    ) -> Result<AudioBuffer> {
        // Kokoro renders 24 kHz mono regardless; postprocess converts.
        let body = serde_json::json!({
            "input": text,
            "voice": params.voice,
            "lang_code": params.language,
            "model": "kokoro",
            "response_format": "pcm",
            "stream": false,
            "speed": params.speed,
        });

        debug!("voice: POST {} chars", text.len());

        let resp = self
            .client
            .post(format!("{}/v1/audio/speech", self.base_url))
            .json(&body)
            .send()
            .await
            .map_err(|e| Error::backend_error(BackendKind::Voice, e.to_string()))?;

        let status = resp.status();
        if !status.is_success() {
            let text = resp.text().await.unwrap_or_default();
            let message = format!("HTTP {status}: {text}");
            return Err(if is_retryable_status(status.as_u16()) {
                Error::backend_error(BackendKind::Voice, message)
            } else {
                Error::malformed(BackendKind::Voice, message)
            });
        }

        let bytes = resp
            .bytes()
            .await
            .map_err(|e| Error::backend_error(BackendKind::Voice, e.to_string()))?;
        audio::decode_voice_payload(&bytes, VOICE_SAMPLE_RATE)
            .map_err(|e| Error::malformed(BackendKind::Voice, e))
    }

    async fn health(&self) -> bool {
        self.client
            .get(format!("{}/", self.base_url))
            .timeout(HEALTH_TIMEOUT)
            .send()
            .await
            .is_ok()
    }
}

/// Turns reply text into one playable buffer in the output format.
#[derive(Clone)]
pub struct SpeechSynthesizer {
    backend: Arc<dyn VoiceBackend>,
    cache: Arc<AudioCache>,
    format: AudioFormat,
    clip_threshold: f32,
    max_chunk_len: usize,
    timeout: Duration,
    policy: RetryPolicy,
}

impl SpeechSynthesizer {
    pub fn new(
        backend: Arc<dyn VoiceBackend>,
        cache: Arc<AudioCache>,
        voice: &VoiceConfig,
        output: &AudioConfig,
    ) -> Self {
        Self {
            backend,
            cache,
            format: output.format(),
            clip_threshold: output.clip_threshold,
            max_chunk_len: voice.max_chunk_len,
            timeout: voice.timeout(),
            policy: RetryPolicy::new(voice.max_retries, voice.initial_backoff()),
        }
    }

    pub fn format(&self) -> AudioFormat {
        self.format
    }

    /// Synthesize `text` sentence by sentence. Up to [`PREFETCH`] sentences
    /// are in flight at once; output order always matches the text. Text
    /// with no sentences yields an empty buffer.
    pub async fn synthesize(
        &self,
        text: &str,
        params: &VoiceParams,
        cancel: &CancelToken,
    ) -> Result<AudioBuffer> {
        let units = speech_units(text, self.max_chunk_len);
        if units.is_empty() {
            return Ok(AudioBuffer::empty(self.format));
        }
        let count = units.len();

        let parts: Vec<Arc<AudioBuffer>> = stream::iter(units)
            .map(|unit| self.sentence(unit, params, cancel))
            .buffered(PREFETCH)
            .try_collect()
            .await?;

        cancel.check()?;
        let utterance =
            audio::concat(&parts, self.format).map_err(|e| Error::malformed(BackendKind::Voice, e))?;
        debug!(
            sentences = count,
            duration_ms = utterance.duration().as_millis() as u64,
            "utterance synthesized"
        );
        Ok(utterance)
    }

    async fn sentence(
        &self,
        text: String,
        params: &VoiceParams,
        cancel: &CancelToken,
    ) -> Result<Arc<AudioBuffer>> {
        let key = AudioKey::derive(&text, params, self.format);
        if let Some(hit) = self.cache.get(&key) {
            debug!(key = %key, "audio cache hit");
            return Ok(self.within_ceiling(hit));
        }

        let backend = &self.backend;
        let text = text.as_str();
        let timeout = self.timeout;
        let rate = self.format.sample_rate;
        let raw = with_retry(&self.policy, cancel, "voice", move || {
            with_timeout(BackendKind::Voice, timeout, backend.synthesize(text, params, rate))
        })
        .await?;

        if raw.is_empty() {
            return Err(Error::malformed(
                BackendKind::Voice,
                format!("no audio for {text:?}"),
            ));
        }
        // Never cache audio for an utterance that has been muted.
        cancel.check()?;

        let processed = audio::postprocess(raw, self.format, self.clip_threshold);
        debug!(key = %key, frames = processed.frames(), "audio cache store");
        Ok(self.cache.put(key, processed))
    }

    /// A persisted entry may have been limited under a higher threshold by
    /// an earlier run. Re-limit it; audio already under the ceiling is
    /// returned as is.
    fn within_ceiling(&self, hit: Arc<AudioBuffer>) -> Arc<AudioBuffer> {
        if hit.peak() <= self.clip_threshold {
            return hit;
        }
        let mut samples = hit.samples.clone();
        audio::normalize_peak(&mut samples, self.clip_threshold);
        Arc::new(AudioBuffer::new(samples, hit.format()))
    }

    pub async fn health(&self) -> bool {
        self.backend.health().await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;
    use std::sync::Mutex;

    use cohost_core::types::CacheConfig;

    /// Returns 16 kHz stereo audio, one frame per character, filled with a
    /// value unique to the sentence.
    struct Fake {
        calls: Mutex<Vec<String>>,
        values: HashMap<&'static str, f32>,
        fail_on: Option<&'static str>,
    }

    impl Fake {
        fn new(values: &[(&'static str, f32)]) -> Arc<Self> {
            Arc::new(Self {
                calls: Mutex::new(Vec::new()),
                values: values.iter().copied().collect(),
                fail_on: None,
            })
        }

        fn calls(&self) -> Vec<String> {
            self.calls.lock().unwrap().clone()
        }
    }

    #[async_trait]
    impl VoiceBackend for Fake {
        async fn synthesize(
            &self,
            text: &str,
            _params: &VoiceParams,
            _sample_rate: u32,
        ) -> Result<AudioBuffer> {
            self.calls.lock().unwrap().push(text.to_string());
            if self.fail_on == Some(text) {
                return Err(Error::malformed(BackendKind::Voice, "unsupported voice"));
            }
            let value = self.values.get(text).copied().unwrap_or(0.1);
            Ok(AudioBuffer::new(vec![value; text.len() * 2], AudioFormat {
                sample_rate: 16_000,
                channels: 2,
            }))
        }

        async fn health(&self) -> bool {
            true
        }
    }

    fn synthesizer(backend: Arc<Fake>) -> SpeechSynthesizer {
        let voice = VoiceConfig {
            max_retries: 0,
            ..Default::default()
        };
        let output = AudioConfig {
            sample_rate: 32_000,
            channels: 1,
            clip_threshold: 0.5,
            ..Default::default()
        };
        SpeechSynthesizer::new(
            backend,
            Arc::new(AudioCache::in_memory(100, 1 << 20)),
            &voice,
            &output,
        )
    }

    fn params() -> VoiceParams {
        VoiceConfig::default().params()
    }

    #[tokio::test]
    async fn concatenates_in_sentence_order() {
        let fake = Fake::new(&[("One.", 0.2), ("Two!", 0.3), ("Three?", 0.4)]);
        let synth = synthesizer(fake.clone());
        let out = synth
            .synthesize("One. Two! Three?", &params(), &CancelToken::never())
            .await
            .unwrap();

        assert_eq!(out.format(), synth.format());
        // 16 kHz -> 32 kHz doubles the frame count.
        assert_eq!(out.frames(), (4 + 4 + 6) * 2);
        let firsts: Vec<f32> = [0, 8, 16].iter().map(|&i| out.samples[i]).collect();
        assert_eq!(firsts, vec![0.2, 0.3, 0.4]);
    }

    #[tokio::test]
    async fn reuses_cached_sentences() {
        let fake = Fake::new(&[]);
        let synth = synthesizer(fake.clone());
        synth
            .synthesize("Hello chat. Welcome in.", &params(), &CancelToken::never())
            .await
            .unwrap();
        synth
            .synthesize("Hello chat. Good to see you.", &params(), &CancelToken::never())
            .await
            .unwrap();
        assert_eq!(fake.calls(), vec![
            "Hello chat.",
            "Welcome in.",
            "Good to see you."
        ]);
    }

    #[tokio::test]
    async fn persisted_audio_respects_lowered_threshold() {
        let dir = tempfile::tempdir().unwrap();
        let cache_config = CacheConfig {
            audio_dir: Some(dir.path().to_path_buf()),
            ..Default::default()
        };
        let open = |clip_threshold: f32, fake: Arc<Fake>| {
            let output = AudioConfig {
                clip_threshold,
                ..Default::default()
            };
            SpeechSynthesizer::new(
                fake,
                Arc::new(AudioCache::open(&cache_config).unwrap()),
                &VoiceConfig::default(),
                &output,
            )
        };

        let first = Fake::new(&[("Loud.", 3.0)]);
        let out = open(0.98, first)
            .synthesize("Loud.", &params(), &CancelToken::never())
            .await
            .unwrap();
        assert!((out.peak() - 0.98).abs() < 1e-6);

        let second = Fake::new(&[]);
        let out = open(0.5, second.clone())
            .synthesize("Loud.", &params(), &CancelToken::never())
            .await
            .unwrap();
        assert!(second.calls().is_empty(), "served from disk");
        assert!(out.peak() <= 0.5);
    }

    #[tokio::test]
    async fn loud_audio_is_limited() {
        let fake = Fake::new(&[("Loud.", 3.0)]);
        let out = synthesizer(fake)
            .synthesize("Loud.", &params(), &CancelToken::never())
            .await
            .unwrap();
        assert!(out.peak() <= 0.5);
    }

    #[tokio::test]
    async fn empty_text_makes_no_calls() {
        let fake = Fake::new(&[]);
        let out = synthesizer(fake.clone())
            .synthesize("   ", &params(), &CancelToken::never())
            .await
            .unwrap();
        assert!(out.is_empty());
        assert!(fake.calls().is_empty());
    }

    #[tokio::test]
    async fn backend_failure_is_a_voice_error() {
        let fake = Arc::new(Fake {
            calls: Mutex::new(Vec::new()),
            values: HashMap::new(),
            fail_on: Some("Bad."),
        });
        let err = synthesizer(fake)
            .synthesize("Good. Bad.", &params(), &CancelToken::never())
            .await
            .unwrap_err();
        assert_eq!(err.backend(), Some(BackendKind::Voice));
        assert_eq!(err.kind(), "synthesis_backend");
    }

    #[tokio::test]
    async fn cancelled_synthesis_caches_nothing() {
        let fake = Fake::new(&[]);
        let synth = synthesizer(fake.clone());
        let epoch = crate::cancel::Epoch::new();
        let token = epoch.token();
        epoch.bump();
        let err = synth.synthesize("Hi there.", &params(), &token).await.unwrap_err();
        assert!(matches!(err, Error::Cancelled));
        assert_eq!(synth.cache.stats().entries, 0);
    }
}
