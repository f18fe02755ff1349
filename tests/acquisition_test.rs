//! Async acquisition session tests against the register-level simulator.

use camctl::acquisition::{self, ContinuousOptions, ExposeEvent, ExposureOptions};
use camctl::controller::Controller;
use camctl::device::sim::{SimHandle, SimTransport};
use camctl::device::PcieDevice;
use camctl::error::CamError;

fn sim_controller() -> (Controller, SimHandle) {
    let sim = SimTransport::new();
    let handle = sim.handle();
    let dev = PcieDevice::with_transport(Box::new(sim));
    (Controller::new(dev), handle)
}

#[tokio::test]
async fn exposure_session_streams_progress_and_returns_the_frame() {
    let (mut ctrl, _) = sim_controller();
    ctrl.set_image_size(16, 16).expect("size");

    let options = ExposureOptions {
        exp_time_secs: 0.1,
        rows: 16,
        cols: 16,
        open_shutter: true,
    };

    let (mut events, guard, handle) = acquisition::start_exposure(ctrl, options);

    let mut saw_pixels = false;
    while let Some(event) = events.recv().await {
        if let ExposeEvent::PixelCount(count) = event {
            assert!(count <= 256);
            saw_pixels = true;
        }
    }
    assert!(saw_pixels);

    let (_ctrl, frame) = handle.await.expect("join").expect("expose");
    guard.disarm();

    assert_eq!(frame.rows, 16);
    assert_eq!(frame.cols, 16);
    assert_eq!(frame.data.len(), 256);
    assert_eq!(frame.data[0], 0);
    assert_eq!(frame.data[255], 255);
}

#[tokio::test]
async fn dropping_the_guard_aborts_the_exposure() {
    let (mut ctrl, handle) = sim_controller();
    ctrl.set_image_size(16, 16).expect("size");

    // Park the simulated exposure far from readout so the abort lands first
    handle.set_exposure_polls(100_000);

    let options = ExposureOptions {
        exp_time_secs: 30.0,
        rows: 16,
        cols: 16,
        open_shutter: true,
    };

    let (_events, guard, join) = acquisition::start_exposure(ctrl, options);
    drop(guard);

    let result = join.await.expect("join");
    assert!(matches!(result, Err(CamError::Aborted)));
}

#[tokio::test]
async fn continuous_session_streams_frames() {
    let (mut ctrl, _) = sim_controller();
    ctrl.device_mut().map_buffer(2 * 8 * 8 * 2).expect("map");
    ctrl.set_image_size(8, 8).expect("size");

    let options = ContinuousOptions {
        exp_time_secs: 0.05,
        rows: 8,
        cols: 8,
        num_frames: 4,
        open_shutter: true,
    };

    let (mut frames, guard, join) = acquisition::start_continuous(ctrl, options);

    let mut seen = Vec::new();
    while let Some(frame) = frames.recv().await {
        assert_eq!(frame.data.len(), 64);
        seen.push(frame.frame_number);
    }

    join.await.expect("join").expect("continuous");
    guard.disarm();

    assert_eq!(seen, vec![1, 2, 3, 4]);
}
