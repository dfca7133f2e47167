//! Audio device manager: output selection and the single playback slot.
//!
//! Device I/O is blocking (and rodio's `OutputStream` is `!Send`), so each
//! playback runs start to finish on a blocking thread. The slot is a
//! one-permit semaphore; an overlapping `play` gets `DeviceBusy`.

use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use cohost_core::audio::AudioBuffer;
use cohost_core::types::{AudioFormat, DeviceInfo, OutputCaps};
use cpal::traits::{DeviceTrait, HostTrait};
use rodio::buffer::SamplesBuffer;
use rodio::{OutputStream, Sink};
use tokio::sync::Semaphore;
use tracing::{debug, info, warn};

use crate::cancel::CancelToken;
use crate::error::{Error, Result};

/// How often a blocking playback checks for completion and cancellation.
const POLL_INTERVAL: Duration = Duration::from_millis(20);

/// Let the device drain its last buffer before the stream is dropped.
const TAIL_GRACE: Duration = Duration::from_millis(60);

/// Platform audio output.
pub trait OutputHost: Send + Sync {
    /// Enumerate output devices in a stable order.
    fn devices(&self) -> Result<Vec<DeviceInfo>>;

    /// Play `audio` on `device`, blocking until it finishes or `cancel`
    /// fires (then `Err(Error::Cancelled)`).
    fn play_blocking(
        &self,
        device: &DeviceInfo,
        audio: &AudioBuffer,
        cancel: &CancelToken,
    ) -> Result<()>;
}

/// The default cpal host, played through rodio.
pub struct CpalHost;

impl CpalHost {
    fn find(&self, device: &DeviceInfo) -> Result<cpal::Device> {
        let host = cpal::default_host();
        let found = host
            .output_devices()
            .map_err(|e| Error::DeviceUnavailable(e.to_string()))?
            .nth(device.index)
            .ok_or_else(|| Error::DeviceUnavailable(format!("device {} is gone", device.index)))?;
        let name = found.name().unwrap_or_default();
        if name != device.name {
            return Err(Error::DeviceUnavailable(format!(
                "device {} is now {name:?}, expected {:?}",
                device.index, device.name
            )));
        }
        Ok(found)
    }
}

impl OutputHost for CpalHost {
    fn devices(&self) -> Result<Vec<DeviceInfo>> {
        let host = cpal::default_host();
        let default_name = host.default_output_device().and_then(|d| d.name().ok());
        let devices = host
            .output_devices()
            .map_err(|e| Error::DeviceUnavailable(e.to_string()))?;

        Ok(devices
            .enumerate()
            .map(|(index, device)| {
                let name = device.name().unwrap_or_else(|_| format!("device {index}"));
                let caps = device
                    .supported_output_configs()
                    .map(|configs| {
                        configs
                            .map(|c| OutputCaps {
                                channels: c.channels(),
                                min_sample_rate: c.min_sample_rate().0,
                                max_sample_rate: c.max_sample_rate().0,
                            })
                            .collect()
                    })
                    .unwrap_or_default();
                DeviceInfo {
                    index,
                    is_default: default_name.as_deref() == Some(name.as_str()),
                    name,
                    caps,
                }
            })
            .collect())
    }

    fn play_blocking(
        &self,
        device: &DeviceInfo,
        audio: &AudioBuffer,
        cancel: &CancelToken,
    ) -> Result<()> {
        let output = self.find(device)?;
        let (_stream, handle) =
            OutputStream::try_from_device(&output).map_err(|e| Error::Playback(e.to_string()))?;
        let sink = Sink::try_new(&handle).map_err(|e| Error::Playback(e.to_string()))?;
        sink.append(SamplesBuffer::new(
            audio.channels,
            audio.sample_rate,
            audio.samples.clone(),
        ));

        while !sink.empty() {
            if cancel.is_cancelled() {
                sink.stop();
                return Err(Error::Cancelled);
            }
            std::thread::sleep(POLL_INTERVAL);
        }
        std::thread::sleep(TAIL_GRACE);
        Ok(())
    }
}

/// Pick an output device: the configured index if present and capable, then
/// the system default, then the first capable device in enumeration order.
pub fn select_device(
    devices: &[DeviceInfo],
    configured: Option<usize>,
    format: AudioFormat,
) -> Result<DeviceInfo> {
    if let Some(index) = configured {
        match devices.iter().find(|d| d.index == index) {
            Some(d) if d.supports(format) => return Ok(d.clone()),
            Some(d) => warn!(
                index,
                name = %d.name,
                "configured device cannot play {} Hz / {} ch, falling back",
                format.sample_rate,
                format.channels
            ),
            None => warn!(index, "configured device not present, falling back"),
        }
    }

    devices
        .iter()
        .find(|d| d.is_default && d.supports(format))
        .or_else(|| devices.iter().find(|d| d.supports(format)))
        .cloned()
        .ok_or_else(|| {
            Error::DeviceUnavailable(format!(
                "no output device supports {} Hz / {} ch ({} enumerated)",
                format.sample_rate,
                format.channels,
                devices.len()
            ))
        })
}

/// Owns the selected device and the one-permit playback slot.
pub struct DeviceManager {
    host: Arc<dyn OutputHost>,
    configured: Option<usize>,
    format: AudioFormat,
    selected: Mutex<Option<DeviceInfo>>,
    slot: Arc<Semaphore>,
}

impl DeviceManager {
    pub fn new(host: Arc<dyn OutputHost>, configured: Option<usize>, format: AudioFormat) -> Self {
        Self {
            host,
            configured,
            format,
            selected: Mutex::new(None),
            slot: Arc::new(Semaphore::new(1)),
        }
    }

    /// The device for this run. Selected once and reused until a playback
    /// on it fails.
    pub fn select(&self) -> Result<DeviceInfo> {
        let mut selected = self.selected.lock().unwrap_or_else(PoisonError::into_inner);
        if let Some(device) = selected.as_ref() {
            return Ok(device.clone());
        }
        let devices = self.host.devices()?;
        let device = select_device(&devices, self.configured, self.format)?;
        info!(index = device.index, name = %device.name, "output device selected");
        *selected = Some(device.clone());
        Ok(device)
    }

    /// Forget the selection so the next playback selects again.
    pub fn invalidate(&self) {
        let mut selected = self.selected.lock().unwrap_or_else(PoisonError::into_inner);
        if let Some(old) = selected.take() {
            warn!(name = %old.name, "output device deselected after error");
        }
    }

    /// [`DeviceManager::select`] off the async runtime.
    pub async fn current(self: &Arc<Self>) -> Result<DeviceInfo> {
        let this = Arc::clone(self);
        tokio::task::spawn_blocking(move || this.select())
            .await
            .map_err(|e| Error::Playback(e.to_string()))?
    }

    pub async fn devices(&self) -> Result<Vec<DeviceInfo>> {
        let host = Arc::clone(&self.host);
        tokio::task::spawn_blocking(move || host.devices())
            .await
            .map_err(|e| Error::Playback(e.to_string()))?
    }

    pub fn is_busy(&self) -> bool {
        self.slot.available_permits() == 0
    }

    /// Play one utterance. Fails with `DeviceBusy` if another playback holds
    /// the slot; the caller is responsible for queueing.
    pub async fn play(self: &Arc<Self>, audio: Arc<AudioBuffer>, cancel: CancelToken) -> Result<()> {
        let permit = Arc::clone(&self.slot)
            .try_acquire_owned()
            .map_err(|_| Error::DeviceBusy)?;
        if audio.is_empty() {
            return Ok(());
        }

        let this = Arc::clone(self);
        tokio::task::spawn_blocking(move || {
            let _permit = permit;
            let device = this.select()?;
            debug!(
                name = %device.name,
                duration_ms = audio.duration().as_millis() as u64,
                "playback start"
            );
            let result = this.host.play_blocking(&device, &audio, &cancel);
            match &result {
                Ok(()) => debug!("playback complete"),
                Err(Error::Cancelled) => debug!("playback cancelled"),
                Err(e) => {
                    warn!("playback failed: {e}");
                    this.invalidate();
                }
            }
            result
        })
        .await
        .map_err(|e| Error::Playback(e.to_string()))?
    }
}
