//! Gapless playback of model audio.
//!
//! `PlaybackQueue` is the scheduling watermark: each chunk starts at
//! `max(watermark, now)` and pushes the watermark forward by its duration.
//! The rodio sink plays appended sources back to back, which is the same
//! rule, so the queue only has to track *when* things end.

use std::sync::mpsc as std_mpsc;
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::{Duration, Instant};

use rodio::buffer::SamplesBuffer;
use rodio::{OutputStreamBuilder, Sink};
use tracing::{debug, info, warn};

/// Where a scheduled chunk landed on the playback clock.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Scheduled {
    pub start: f64,
    pub end: f64,
    /// Bumped by `reset`; completions from an older generation are stale.
    pub generation: u64,
}

#[derive(Debug, Default)]
pub struct PlaybackQueue {
    watermark: f64,
    pending: usize,
    generation: u64,
}

impl PlaybackQueue {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn schedule(&mut self, now: f64, duration: f64) -> Scheduled {
        let start = self.watermark.max(now);
        self.watermark = start + duration;
        self.pending += 1;
        Scheduled {
            start,
            end: self.watermark,
            generation: self.generation,
        }
    }

    /// Record that a chunk finished. Returns true when this was the last
    /// pending chunk of the current generation.
    pub fn finish(&mut self, generation: u64) -> bool {
        if generation != self.generation || self.pending == 0 {
            return false;
        }
        self.pending -= 1;
        self.pending == 0
    }

    /// Forget everything scheduled so far (barge-in or teardown).
    pub fn reset(&mut self) {
        self.watermark = 0.0;
        self.pending = 0;
        self.generation += 1;
    }

    pub fn pending(&self) -> usize {
        self.pending
    }

    pub fn watermark(&self) -> f64 {
        self.watermark
    }

    pub fn generation(&self) -> u64 {
        self.generation
    }
}

/// Audio output used by the voice session.
pub trait PlaybackSink: Send {
    /// Seconds on the sink's clock.
    fn now(&self) -> f64;
    /// Queue samples after everything already queued.
    fn enqueue(&self, samples: Vec<f32>);
    /// Drop everything queued or playing; the sink stays usable.
    fn stop_all(&self);
    fn close(&mut self);
}

/// Owner thread for a rodio output stream.
///
/// `OutputStream` is not `Send`, so it lives on a dedicated thread that
/// hands back the (shareable) `Sink` and parks until told to stop.
pub struct AudioOutput {
    sink: Arc<Sink>,
    stop_tx: Option<std_mpsc::Sender<()>>,
    thread: Option<JoinHandle<()>>,
}

impl AudioOutput {
    pub fn open() -> Result<Self, String> {
        let (ready_tx, ready_rx) = std_mpsc::channel::<Result<Arc<Sink>, String>>();
        let (stop_tx, stop_rx) = std_mpsc::channel::<()>();

        let thread = std::thread::Builder::new()
            .name("audio-out".into())
            .spawn(move || {
                // rodio 0.21: OutputStream is the handle, Sink connects to its mixer
                let stream = match OutputStreamBuilder::open_default_stream() {
                    Ok(stream) => stream,
                    Err(e) => {
                        let _ = ready_tx.send(Err(format!("Failed to open audio output: {e}")));
                        return;
                    }
                };
                let sink = Arc::new(Sink::connect_new(stream.mixer()));
                if ready_tx.send(Ok(sink.clone())).is_err() {
                    return;
                }
                // Returns on explicit stop or when the sender is dropped
                let _ = stop_rx.recv();
                sink.stop();
                drop(stream);
                debug!("Audio output closed");
            })
            .map_err(|e| format!("Failed to spawn audio output thread: {e}"))?;

        let sink = ready_rx
            .recv()
            .map_err(|_| "Audio output thread exited early".to_string())??;

        Ok(Self {
            sink,
            stop_tx: Some(stop_tx),
            thread: Some(thread),
        })
    }

    pub fn append(&self, samples: Vec<f32>, sample_rate: u32) {
        if samples.is_empty() {
            return;
        }
        self.sink.append(SamplesBuffer::new(1, sample_rate, samples));
    }

    pub fn clear(&self) {
        // clear() also pauses the sink
        self.sink.clear();
        self.sink.play();
    }

    pub fn is_empty(&self) -> bool {
        self.sink.empty()
    }

    /// Wait until everything queued has played.
    pub async fn drain(&self) {
        while !self.sink.empty() {
            tokio::time::sleep(Duration::from_millis(50)).await;
        }
    }

    pub fn close(&mut self) {
        if let Some(tx) = self.stop_tx.take() {
            let _ = tx.send(());
        }
        if let Some(thread) = self.thread.take() {
            if thread.join().is_err() {
                warn!("Audio output thread panicked");
            }
        }
    }
}

impl Drop for AudioOutput {
    fn drop(&mut self) {
        self.close();
    }
}

/// 24 kHz mono playback for the live session.
pub struct RodioPlayback {
    output: AudioOutput,
    sample_rate: u32,
    epoch: Instant,
}

impl RodioPlayback {
    pub fn open(sample_rate: u32) -> Result<Self, String> {
        let output = AudioOutput::open()?;
        info!("Playback opened ({sample_rate} Hz mono)");
        Ok(Self {
            output,
            sample_rate,
            epoch: Instant::now(),
        })
    }
}

impl PlaybackSink for RodioPlayback {
    fn now(&self) -> f64 {
        self.epoch.elapsed().as_secs_f64()
    }

    fn enqueue(&self, samples: Vec<f32>) {
        self.output.append(samples, self.sample_rate);
    }

    fn stop_all(&self) {
        self.output.clear();
    }

    fn close(&mut self) {
        self.output.close();
    }
}
