//! Async acquisition sessions.
//!
//! The controller's exposure and continuous-readout loops are synchronous
//! polling loops. This module runs them on the blocking thread pool and
//! streams progress and frames back over channels, so async callers can
//! consume acquisitions without blocking the runtime.
//!
//! Every session hands back an [`AcquisitionGuard`]; dropping it raises the
//! shared abort flag, so an abandoned session always stops the controller
//! instead of polling forever.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use chrono::{DateTime, Utc};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::warn;

use crate::controller::{Controller, ExposeListener, FrameListener};
use crate::error::AppResult;

/// Channel capacity for frames and progress events.
const CHANNEL_CAPACITY: usize = 16;

/// A frame read out of the common buffer.
#[derive(Debug, Clone)]
pub struct Frame {
    /// Pixel data in readout order.
    pub data: Vec<u16>,
    /// Frame number within the acquisition, starting at 1. Zero for a
    /// single exposure.
    pub frame_number: u32,
    /// Image row count.
    pub rows: u32,
    /// Image column count.
    pub cols: u32,
    /// Host time when the frame was taken out of the buffer.
    pub timestamp: DateTime<Utc>,
}

/// Progress events from a running exposure.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum ExposeEvent {
    /// Remaining exposure time in seconds.
    Elapsed(f32),
    /// Pixels read out so far.
    PixelCount(u32),
}

/// Raises the abort flag of an acquisition when dropped.
pub struct AcquisitionGuard {
    abort: Arc<AtomicBool>,
}

impl AcquisitionGuard {
    /// The shared abort flag.
    pub fn abort_flag(&self) -> Arc<AtomicBool> {
        self.abort.clone()
    }

    /// Aborts the acquisition now.
    pub fn abort(&self) {
        self.abort.store(true, Ordering::Relaxed);
    }

    /// Consumes the guard without aborting, leaving the acquisition to run
    /// to completion.
    pub fn disarm(self) {
        std::mem::forget(self);
    }
}

impl Drop for AcquisitionGuard {
    fn drop(&mut self) {
        self.abort.store(true, Ordering::Relaxed);
    }
}

struct ChannelExposeListener {
    events: mpsc::Sender<ExposeEvent>,
}

impl ExposeListener for ChannelExposeListener {
    fn elapsed(&mut self, seconds: f32) {
        // try_send keeps the polling loop from blocking on a slow consumer
        let _ = self.events.try_send(ExposeEvent::Elapsed(seconds));
    }

    fn pixels_read(&mut self, count: u32) {
        let _ = self.events.try_send(ExposeEvent::PixelCount(count));
    }
}

struct ChannelFrameListener {
    frames: mpsc::Sender<Frame>,
}

impl FrameListener for ChannelFrameListener {
    fn frame(&mut self, _buffer_index: u32, frame_number: u32, rows: u32, cols: u32, data: &[u16]) {
        let frame = Frame {
            data: data.to_vec(),
            frame_number,
            rows,
            cols,
            timestamp: Utc::now(),
        };

        if let Err(err) = self.frames.try_send(frame) {
            warn!("dropping frame {frame_number}: {err}");
        }
    }
}

/// Exposure parameters for an async session.
#[derive(Debug, Clone, Copy)]
pub struct ExposureOptions {
    /// Exposure time in seconds.
    pub exp_time_secs: f32,
    /// Image row count.
    pub rows: u32,
    /// Image column count.
    pub cols: u32,
    /// Open the shutter during the exposure; false takes a dark frame.
    pub open_shutter: bool,
}

/// Starts a single exposure on the blocking pool.
///
/// Returns the progress event receiver, the abort guard and a join handle
/// resolving to the controller and the completed [`Frame`].
pub fn start_exposure(
    mut controller: Controller,
    options: ExposureOptions,
) -> (
    mpsc::Receiver<ExposeEvent>,
    AcquisitionGuard,
    JoinHandle<AppResult<(Controller, Frame)>>,
) {
    let (tx, rx) = mpsc::channel(CHANNEL_CAPACITY);
    let abort = Arc::new(AtomicBool::new(false));
    let task_abort = abort.clone();

    let handle = tokio::task::spawn_blocking(move || {
        let mut listener = ChannelExposeListener { events: tx };

        controller.expose(
            options.exp_time_secs,
            options.rows,
            options.cols,
            options.open_shutter,
            Some(&task_abort),
            Some(&mut listener),
        )?;

        let pixels = options.rows as usize * options.cols as usize;
        let data = controller.device().pixels(0, pixels)?;

        let frame = Frame {
            data,
            frame_number: 0,
            rows: options.rows,
            cols: options.cols,
            timestamp: Utc::now(),
        };

        Ok((controller, frame))
    });

    (rx, AcquisitionGuard { abort }, handle)
}

/// Continuous readout parameters for an async session.
#[derive(Debug, Clone, Copy)]
pub struct ContinuousOptions {
    /// Exposure time per frame in seconds.
    pub exp_time_secs: f32,
    /// Image row count.
    pub rows: u32,
    /// Image column count.
    pub cols: u32,
    /// Number of frames to take.
    pub num_frames: u32,
    /// Open the shutter during the exposures.
    pub open_shutter: bool,
}

/// Starts continuous readout on the blocking pool.
///
/// Frames stream out of the returned receiver as they complete; the join
/// handle resolves to the controller once all frames have been read or the
/// acquisition failed.
pub fn start_continuous(
    mut controller: Controller,
    options: ContinuousOptions,
) -> (
    mpsc::Receiver<Frame>,
    AcquisitionGuard,
    JoinHandle<AppResult<Controller>>,
) {
    let (tx, rx) = mpsc::channel(CHANNEL_CAPACITY);
    let abort = Arc::new(AtomicBool::new(false));
    let task_abort = abort.clone();

    let handle = tokio::task::spawn_blocking(move || {
        let mut listener = ChannelFrameListener { frames: tx };

        controller.continuous(
            options.rows,
            options.cols,
            options.num_frames,
            options.exp_time_secs,
            options.open_shutter,
            Some(&task_abort),
            Some(&mut listener),
        )?;

        Ok(controller)
    });

    (rx, AcquisitionGuard { abort }, handle)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn guard_raises_abort_on_drop() {
        let abort = Arc::new(AtomicBool::new(false));
        let guard = AcquisitionGuard {
            abort: abort.clone(),
        };
        assert!(!abort.load(Ordering::Relaxed));
        drop(guard);
        assert!(abort.load(Ordering::Relaxed));
    }

    #[test]
    fn disarmed_guard_leaves_flag_clear() {
        let abort = Arc::new(AtomicBool::new(false));
        let guard = AcquisitionGuard {
            abort: abort.clone(),
        };
        guard.disarm();
        assert!(!abort.load(Ordering::Relaxed));
    }
}
