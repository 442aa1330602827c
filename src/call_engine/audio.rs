//! Audio Capture und Playback
//!
//! Verwendet cpal für Cross-Platform Audio I/O. Das Mikrofon wird auf
//! 8 kHz Mono gebracht, als G.711 μ-law (PCMU) kodiert und in 20 ms
//! Samples auf den lokalen WebRTC-Track geschrieben. Eingehendes PCMU
//! wird dekodiert und auf dem Standard-Ausgabegerät abgespielt.
//!
//! cpal-Streams sind nicht `Send`, deshalb lebt jeder Stream auf einem
//! eigenen OS-Thread und wird über einen Stop-Kanal beendet.

use super::media::{
    CaptureDevice, CaptureStream, CapturedMedia, LocalTrack, MediaAcquisitionError,
    MediaConstraints, TrackKind,
};
use async_trait::async_trait;
use bytes::Bytes;
use cpal::traits::{DeviceTrait, HostTrait, StreamTrait};
use cpal::{Device, SampleFormat, Stream, StreamConfig, SupportedStreamConfigRange};
use parking_lot::Mutex;
use ringbuf::{traits::*, HeapRb};
use std::sync::mpsc as std_mpsc;
use std::sync::Arc;
use std::thread;
use std::time::Duration;
use thiserror::Error;
use tokio::sync::oneshot;
use tokio::task::JoinHandle;
use webrtc::api::media_engine::MIME_TYPE_PCMU;
use webrtc::media::Sample;
use webrtc::rtp_transceiver::rtp_codec::RTCRtpCodecCapability;
use webrtc::track::track_local::track_local_static_sample::TrackLocalStaticSample;

// ============================================================================
// CONSTANTS
// ============================================================================

/// Sample Rate von PCMU
pub const SAMPLE_RATE: u32 = 8000;

/// Channels (Mono für Voice)
pub const CHANNELS: u16 = 1;

/// Frame Size in Samples (20ms @ 8kHz = 160 samples)
pub const FRAME_SIZE: usize = 160;

/// Dauer eines Frames
pub const FRAME_DURATION: Duration = Duration::from_millis(20);

/// Bevorzugte Geräte-Rate
const DEVICE_SAMPLE_RATE: u32 = 48000;

/// Buffer Size für Audio-Ring-Buffer (ca. 1 Sekunde)
const RING_BUFFER_SIZE: usize = DEVICE_SAMPLE_RATE as usize;

const STREAM_ID: &str = "pulse-endpoint";

// ============================================================================
// ERROR TYPES
// ============================================================================

#[derive(Error, Debug)]
pub enum AudioError {
    #[error("No audio input device found")]
    NoInputDevice,

    #[error("No audio output device found")]
    NoOutputDevice,

    #[error("Audio device is not available")]
    DeviceNotAvailable,

    #[error("Access to audio device denied: {0}")]
    AccessDenied(String),

    #[error("Unsupported audio configuration: {0}")]
    UnsupportedConfig(String),

    #[error("Failed to build audio stream: {0}")]
    StreamBuildError(String),

    #[error("Failed to start audio stream: {0}")]
    StreamPlayError(String),
}

impl From<AudioError> for MediaAcquisitionError {
    fn from(error: AudioError) -> Self {
        match error {
            AudioError::NoInputDevice | AudioError::NoOutputDevice => {
                MediaAcquisitionError::DeviceNotFound(error.to_string())
            }
            AudioError::DeviceNotAvailable => MediaAcquisitionError::DeviceBusy(error.to_string()),
            AudioError::AccessDenied(_) => MediaAcquisitionError::PermissionDenied,
            other => MediaAcquisitionError::Other(other.to_string()),
        }
    }
}

fn from_backend(err: cpal::BackendSpecificError) -> AudioError {
    let description = err.description.to_lowercase();
    if description.contains("permission") || description.contains("denied") {
        AudioError::AccessDenied(err.description)
    } else {
        AudioError::StreamBuildError(err.description)
    }
}

fn from_build_error(err: cpal::BuildStreamError) -> AudioError {
    match err {
        cpal::BuildStreamError::DeviceNotAvailable => AudioError::DeviceNotAvailable,
        cpal::BuildStreamError::BackendSpecific { err } => from_backend(err),
        other => AudioError::StreamBuildError(other.to_string()),
    }
}

fn from_play_error(err: cpal::PlayStreamError) -> AudioError {
    match err {
        cpal::PlayStreamError::DeviceNotAvailable => AudioError::DeviceNotAvailable,
        cpal::PlayStreamError::BackendSpecific { err } => from_backend(err),
    }
}

fn from_configs_error(err: cpal::SupportedStreamConfigsError) -> AudioError {
    match err {
        cpal::SupportedStreamConfigsError::DeviceNotAvailable => AudioError::DeviceNotAvailable,
        cpal::SupportedStreamConfigsError::BackendSpecific { err } => from_backend(err),
        other => AudioError::UnsupportedConfig(other.to_string()),
    }
}

// ============================================================================
// G.711 μ-LAW
// ============================================================================

const ULAW_BIAS: i32 = 0x84;
const ULAW_CLIP: i32 = 32635;

/// Kodiert ein 16-bit PCM Sample als μ-law
pub fn linear_to_ulaw(sample: i16) -> u8 {
    let mut pcm = sample as i32;
    let sign = if pcm < 0 {
        pcm = -pcm;
        0x80
    } else {
        0x00
    };
    pcm = pcm.min(ULAW_CLIP) + ULAW_BIAS;

    let mut exponent = 7;
    let mut mask = 0x4000;
    while pcm & mask == 0 && exponent > 0 {
        exponent -= 1;
        mask >>= 1;
    }
    let mantissa = (pcm >> (exponent + 3)) & 0x0F;

    !(sign | (exponent << 4) | mantissa) as u8
}

/// Dekodiert ein μ-law Byte zu 16-bit PCM
pub fn ulaw_to_linear(byte: u8) -> i16 {
    let byte = !byte;
    let sign = byte & 0x80;
    let exponent = ((byte >> 4) & 0x07) as i32;
    let mantissa = (byte & 0x0F) as i32;

    let magnitude = (((mantissa << 3) + ULAW_BIAS) << exponent) - ULAW_BIAS;
    if sign != 0 {
        -magnitude as i16
    } else {
        magnitude as i16
    }
}

fn f32_to_i16(sample: f32) -> i16 {
    (sample.clamp(-1.0, 1.0) * i16::MAX as f32) as i16
}

fn i16_to_f32(sample: i16) -> f32 {
    sample as f32 / i16::MAX as f32
}

// ============================================================================
// RESAMPLING
// ============================================================================

/// Einfaches lineares Resampling, hält Zustand über Callback-Grenzen
#[derive(Debug, Clone)]
pub struct LinearResampler {
    step: f64,
    pos: f64,
    prev: f32,
}

impl LinearResampler {
    pub fn new(from_rate: u32, to_rate: u32) -> Self {
        Self {
            step: from_rate as f64 / to_rate as f64,
            pos: 1.0,
            prev: 0.0,
        }
    }

    pub fn process(&mut self, input: &[f32], mut emit: impl FnMut(f32)) {
        for &sample in input {
            while self.pos <= 1.0 {
                let t = self.pos as f32;
                emit(self.prev * (1.0 - t) + sample * t);
                self.pos += self.step;
            }
            self.pos -= 1.0;
            self.prev = sample;
        }
    }
}

// ============================================================================
// DEVICE CONFIG
// ============================================================================

fn find_best_input_config(device: &Device) -> Result<StreamConfig, AudioError> {
    let configs = device
        .supported_input_configs()
        .map_err(from_configs_error)?;
    select_best_config(configs.collect())
}

fn find_best_output_config(device: &Device) -> Result<StreamConfig, AudioError> {
    let configs = device
        .supported_output_configs()
        .map_err(from_configs_error)?;
    select_best_config(configs.collect())
}

/// Priorität: 48kHz > höchste Rate, F32 > andere
fn select_best_config(configs: Vec<SupportedStreamConfigRange>) -> Result<StreamConfig, AudioError> {
    let target_rate = cpal::SampleRate(DEVICE_SAMPLE_RATE);

    for config in &configs {
        if config.min_sample_rate() <= target_rate
            && config.max_sample_rate() >= target_rate
            && config.sample_format() == SampleFormat::F32
        {
            return Ok(config.with_sample_rate(target_rate).into());
        }
    }

    if let Some(config) = configs
        .iter()
        .find(|c| c.sample_format() == SampleFormat::F32)
    {
        return Ok(config.with_max_sample_rate().into());
    }

    configs
        .first()
        .map(|c| c.with_max_sample_rate().into())
        .ok_or_else(|| {
            AudioError::UnsupportedConfig("No suitable audio configuration found".to_string())
        })
}

type SharedBuffer = Arc<Mutex<HeapRb<f32>>>;

/// Hält einen cpal-Stream auf einem eigenen Thread am Leben
fn spawn_stream_thread<F>(
    name: &str,
    build: F,
) -> Result<(oneshot::Receiver<Result<(), AudioError>>, std_mpsc::Sender<()>), AudioError>
where
    F: FnOnce() -> Result<Stream, AudioError> + Send + 'static,
{
    let (ready_tx, ready_rx) = oneshot::channel();
    let (stop_tx, stop_rx) = std_mpsc::channel::<()>();

    thread::Builder::new()
        .name(name.to_string())
        .spawn(move || {
            let stream = match build().and_then(|s| {
                s.play().map_err(from_play_error)?;
                Ok(s)
            }) {
                Ok(stream) => stream,
                Err(e) => {
                    let _ = ready_tx.send(Err(e));
                    return;
                }
            };
            let _ = ready_tx.send(Ok(()));

            // Blockiert bis stop() oder bis der Sender gedroppt wird
            let _ = stop_rx.recv();
            drop(stream);
        })
        .map_err(|e| AudioError::StreamBuildError(e.to_string()))?;

    Ok((ready_rx, stop_tx))
}

// ============================================================================
// CAPTURE
// ============================================================================

fn build_capture_stream(buffer: SharedBuffer) -> Result<Stream, AudioError> {
    let host = cpal::default_host();
    let device = host.default_input_device().ok_or(AudioError::NoInputDevice)?;
    let config = find_best_input_config(&device)?;

    tracing::info!(
        "Starting audio capture: {} Hz, {} channels",
        config.sample_rate.0,
        config.channels
    );

    let channels = config.channels.max(1) as usize;
    let mut resampler = LinearResampler::new(config.sample_rate.0, SAMPLE_RATE);
    let mut mono = Vec::new();

    device
        .build_input_stream(
            &config,
            move |data: &[f32], _: &cpal::InputCallbackInfo| {
                // Downmix auf Mono
                mono.clear();
                mono.extend(
                    data.chunks(channels)
                        .map(|frame| frame.iter().sum::<f32>() / frame.len() as f32),
                );

                let mut buffer = buffer.lock();
                resampler.process(&mono, |sample| {
                    let _ = buffer.try_push(sample);
                });
            },
            |err| {
                tracing::error!("Audio capture error: {}", err);
            },
            None,
        )
        .map_err(from_build_error)
}

struct CpalCaptureStream {
    stop_tx: Mutex<Option<std_mpsc::Sender<()>>>,
    pump: JoinHandle<()>,
}

impl CaptureStream for CpalCaptureStream {
    fn stop(&self) {
        if let Some(stop_tx) = self.stop_tx.lock().take() {
            let _ = stop_tx.send(());
            self.pump.abort();
            tracing::info!("Audio capture stopped");
        }
    }
}

/// Liest 20ms Frames aus dem Ring-Buffer und schreibt sie als PCMU auf den Track
fn spawn_pump(buffer: SharedBuffer, track: Arc<TrackLocalStaticSample>) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut interval = tokio::time::interval(FRAME_DURATION);
        interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
        let mut frame = Vec::with_capacity(FRAME_SIZE);

        loop {
            interval.tick().await;

            frame.clear();
            {
                let mut buffer = buffer.lock();
                if buffer.occupied_len() < FRAME_SIZE {
                    continue;
                }
                for _ in 0..FRAME_SIZE {
                    if let Some(sample) = buffer.try_pop() {
                        frame.push(linear_to_ulaw(f32_to_i16(sample)));
                    }
                }
            }

            let sample = Sample {
                data: Bytes::copy_from_slice(&frame),
                duration: FRAME_DURATION,
                ..Default::default()
            };
            if let Err(e) = track.write_sample(&sample).await {
                tracing::warn!("Failed to write audio sample: {}", e);
            }
        }
    })
}

/// Capture-Device auf Basis des Standard-Mikrofons.
///
/// Es gibt keine Kamera-Anbindung; Video-Anfragen scheitern mit
/// `DeviceNotFound`.
#[derive(Debug, Default)]
pub struct CpalCaptureDevice;

impl CpalCaptureDevice {
    pub fn new() -> Self {
        Self
    }
}

#[async_trait]
impl CaptureDevice for CpalCaptureDevice {
    fn supports(&self, constraints: &MediaConstraints) -> bool {
        constraints.video.is_none()
    }

    async fn open(
        &self,
        constraints: &MediaConstraints,
    ) -> Result<CapturedMedia, MediaAcquisitionError> {
        if let Some(video) = constraints.video {
            return Err(MediaAcquisitionError::DeviceNotFound(format!(
                "no video capture source for {}x{}@{}",
                video.max_width, video.max_height, video.max_frame_rate
            )));
        }

        // Echo-Cancellation & Co. kann cpal nicht; wird nur protokolliert
        tracing::debug!("Audio processing requested: {:?}", constraints.audio);

        let buffer: SharedBuffer = Arc::new(Mutex::new(HeapRb::new(RING_BUFFER_SIZE)));
        let capture_buffer = Arc::clone(&buffer);
        let (ready_rx, stop_tx) =
            spawn_stream_thread("audio-capture", move || build_capture_stream(capture_buffer))?;

        ready_rx
            .await
            .map_err(|_| MediaAcquisitionError::Other("capture thread exited".to_string()))??;

        let track = Arc::new(TrackLocalStaticSample::new(
            RTCRtpCodecCapability {
                mime_type: MIME_TYPE_PCMU.to_string(),
                clock_rate: SAMPLE_RATE,
                channels: CHANNELS,
                ..Default::default()
            },
            "audio".to_string(),
            STREAM_ID.to_string(),
        ));

        let pump = spawn_pump(buffer, Arc::clone(&track));

        Ok(CapturedMedia {
            tracks: vec![LocalTrack::new(TrackKind::Audio, track)],
            stream: Box::new(CpalCaptureStream {
                stop_tx: Mutex::new(Some(stop_tx)),
                pump,
            }),
        })
    }
}

// ============================================================================
// PLAYBACK
// ============================================================================

fn build_playback_stream(buffer: SharedBuffer, rate_tx: std_mpsc::Sender<u32>) -> Result<Stream, AudioError> {
    let host = cpal::default_host();
    let device = host
        .default_output_device()
        .ok_or(AudioError::NoOutputDevice)?;
    let config = find_best_output_config(&device)?;

    tracing::info!(
        "Starting audio playback: {} Hz, {} channels",
        config.sample_rate.0,
        config.channels
    );
    let _ = rate_tx.send(config.sample_rate.0);

    let channels = config.channels.max(1) as usize;

    device
        .build_output_stream(
            &config,
            move |data: &mut [f32], _: &cpal::OutputCallbackInfo| {
                let mut buffer = buffer.lock();
                for frame in data.chunks_mut(channels) {
                    let sample = buffer.try_pop().unwrap_or(0.0);
                    frame.fill(sample);
                }
            },
            |err| {
                tracing::error!("Audio playback error: {}", err);
            },
            None,
        )
        .map_err(from_build_error)
}

/// Wiedergabe eines Remote-Audio-Tracks auf dem Standard-Ausgabegerät
pub struct AudioPlayback {
    buffer: SharedBuffer,
    resampler: Mutex<LinearResampler>,
    _stop_tx: std_mpsc::Sender<()>,
}

impl AudioPlayback {
    pub async fn start() -> Result<Self, AudioError> {
        let buffer: SharedBuffer = Arc::new(Mutex::new(HeapRb::new(RING_BUFFER_SIZE)));
        let playback_buffer = Arc::clone(&buffer);
        let (rate_tx, rate_rx) = std_mpsc::channel();

        let (ready_rx, stop_tx) = spawn_stream_thread("audio-playback", move || {
            build_playback_stream(playback_buffer, rate_tx)
        })?;
        ready_rx
            .await
            .map_err(|_| AudioError::StreamPlayError("playback thread exited".to_string()))??;

        let device_rate = rate_rx.try_recv().unwrap_or(DEVICE_SAMPLE_RATE);

        Ok(Self {
            buffer,
            resampler: Mutex::new(LinearResampler::new(SAMPLE_RATE, device_rate)),
            _stop_tx: stop_tx,
        })
    }

    /// Dekodiert einen PCMU-Payload und schreibt ihn in den Playback-Buffer
    pub fn push_pcmu(&self, payload: &[u8]) {
        let decoded: Vec<f32> = payload
            .iter()
            .map(|&b| i16_to_f32(ulaw_to_linear(b)))
            .collect();

        let mut resampler = self.resampler.lock();
        let mut buffer = self.buffer.lock();
        resampler.process(&decoded, |sample| {
            let _ = buffer.try_push(sample);
        });
    }
}

// ============================================================================
// TESTS
// ============================================================================
