//! Microphone capture with cpal.
//!
//! cpal streams are not `Send`; each open stream lives on its own thread
//! and is dropped when that thread's stop channel fires. The handle that
//! callers keep is plain data and can move between tasks.

use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::mpsc as std_mpsc;
use std::sync::Arc;
use std::thread::JoinHandle;

use cpal::traits::{DeviceTrait, HostTrait, StreamTrait};
use cpal::{SampleRate, StreamConfig};
use tokio::sync::mpsc::UnboundedSender;
use tracing::{debug, info, warn};

/// Queued frames above which the sender is considered behind.
const BACKLOG_WARN_FRAMES: usize = 32;

/// A running microphone.
pub trait MicStream: Send {
    fn stop(&mut self);
}

/// Owner thread around a cpal input stream that feeds `on_data`.
pub struct InputHandle {
    stop_tx: Option<std_mpsc::Sender<()>>,
    thread: Option<JoinHandle<()>>,
}

impl InputHandle {
    pub fn open<F>(sample_rate: u32, mut on_data: F) -> Result<Self, String>
    where
        F: FnMut(&[f32]) + Send + 'static,
    {
        let (ready_tx, ready_rx) = std_mpsc::channel::<Result<(), String>>();
        let (stop_tx, stop_rx) = std_mpsc::channel::<()>();

        let thread = std::thread::Builder::new()
            .name("mic-capture".into())
            .spawn(move || {
                let host = cpal::default_host();
                let Some(device) = host.default_input_device() else {
                    let _ = ready_tx.send(Err("No input audio device available".into()));
                    return;
                };
                debug!(
                    "Using audio device: {}",
                    device.name().unwrap_or_else(|_| "unknown".into())
                );

                let config = StreamConfig {
                    channels: 1,
                    sample_rate: SampleRate(sample_rate),
                    buffer_size: cpal::BufferSize::Default,
                };
                let stream = match device.build_input_stream(
                    &config,
                    move |data: &[f32], _info: &cpal::InputCallbackInfo| on_data(data),
                    move |err| warn!("Audio stream error: {err}"),
                    None,
                ) {
                    Ok(stream) => stream,
                    Err(e) => {
                        let _ = ready_tx.send(Err(format!("Failed to build input stream: {e}")));
                        return;
                    }
                };
                if let Err(e) = stream.play() {
                    let _ = ready_tx.send(Err(format!("Failed to start audio stream: {e}")));
                    return;
                }
                if ready_tx.send(Ok(())).is_err() {
                    return;
                }
                let _ = stop_rx.recv();
                drop(stream);
            })
            .map_err(|e| format!("Failed to spawn capture thread: {e}"))?;

        ready_rx
            .recv()
            .map_err(|_| "Capture thread exited early".to_string())??;

        Ok(Self {
            stop_tx: Some(stop_tx),
            thread: Some(thread),
        })
    }

    pub fn close(&mut self) {
        if let Some(tx) = self.stop_tx.take() {
            let _ = tx.send(());
        }
        if let Some(thread) = self.thread.take() {
            if thread.join().is_err() {
                warn!("Capture thread panicked");
            }
        }
    }
}

impl Drop for InputHandle {
    fn drop(&mut self) {
        self.close();
    }
}

/// Count of frames sent but not yet consumed.
#[derive(Clone, Default)]
pub struct Backlog(Arc<AtomicUsize>);

impl Backlog {
    fn push(&self) -> usize {
        self.0.fetch_add(1, Ordering::Relaxed) + 1
    }

    pub fn pop(&self) {
        let _ = self
            .0
            .fetch_update(Ordering::Relaxed, Ordering::Relaxed, |n| n.checked_sub(1));
    }

    pub fn queued(&self) -> usize {
        self.0.load(Ordering::Relaxed)
    }
}

/// Cuts the device's arbitrary buffer sizes into fixed frames.
#[derive(Debug)]
pub struct Framer {
    frame_size: usize,
    pending: Vec<f32>,
}

impl Framer {
    pub fn new(frame_size: usize) -> Self {
        let frame_size = frame_size.max(1);
        Self {
            frame_size,
            pending: Vec::with_capacity(frame_size * 2),
        }
    }

    pub fn push(&mut self, data: &[f32]) -> Vec<Vec<f32>> {
        self.pending.extend_from_slice(data);
        let mut frames = Vec::new();
        while self.pending.len() >= self.frame_size {
            let rest = self.pending.split_off(self.frame_size);
            frames.push(std::mem::replace(&mut self.pending, rest));
        }
        frames
    }
}

/// Live-session microphone: fixed-size frames onto an unbounded channel.
pub struct MicCapture {
    input: InputHandle,
}

impl MicCapture {
    pub fn open(
        sample_rate: u32,
        frame_size: usize,
        closing: Arc<AtomicBool>,
        frames: UnboundedSender<Vec<f32>>,
        backlog: Backlog,
    ) -> Result<Self, String> {
        let mut framer = Framer::new(frame_size);
        let input = InputHandle::open(sample_rate, move |data| {
            if closing.load(Ordering::Relaxed) {
                return;
            }
            for frame in framer.push(data) {
                if frames.send(frame).is_err() {
                    return;
                }
                let queued = backlog.push();
                if queued == BACKLOG_WARN_FRAMES {
                    warn!("Audio send backlog reached {queued} frames");
                }
            }
        })?;
        info!("Microphone open ({sample_rate} Hz mono, {frame_size}-sample frames)");
        Ok(Self { input })
    }
}

impl MicStream for MicCapture {
    fn stop(&mut self) {
        self.input.close();
    }
}
