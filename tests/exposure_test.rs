//! Single-exposure integration tests against the register-level simulator.

use std::sync::atomic::AtomicBool;

use camctl::controller::{Controller, ExposeListener};
use camctl::device::sim::{SimHandle, SimTransport};
use camctl::device::PcieDevice;
use camctl::error::CamError;

fn sim_controller() -> (Controller, SimHandle) {
    let sim = SimTransport::new();
    let handle = sim.handle();
    let dev = PcieDevice::with_transport(Box::new(sim));
    (Controller::new(dev), handle)
}

#[derive(Default)]
struct RecordingListener {
    elapsed: Vec<f32>,
    pixel_counts: Vec<u32>,
}

impl ExposeListener for RecordingListener {
    fn elapsed(&mut self, seconds: f32) {
        self.elapsed.push(seconds);
    }

    fn pixels_read(&mut self, count: u32) {
        self.pixel_counts.push(count);
    }
}

#[test]
fn exposure_completes_and_fills_buffer() {
    let (mut ctrl, _) = sim_controller();
    ctrl.set_image_size(16, 16).expect("size");

    let mut listener = RecordingListener::default();
    ctrl.expose(0.1, 16, 16, true, None, Some(&mut listener))
        .expect("expose");

    // Readout progress was reported and never went backwards
    assert!(!listener.pixel_counts.is_empty());
    assert!(listener
        .pixel_counts
        .windows(2)
        .all(|pair| pair[0] <= pair[1]));
    assert_eq!(listener.pixel_counts.last().copied(), Some(256));

    // The frame landed in the buffer: a synthetic ramp from the simulator
    let pixels = ctrl.device().pixels(0, 256).expect("pixels");
    assert_eq!(pixels[0], 0);
    assert_eq!(pixels[1], 1);
    assert_eq!(pixels[255], 255);
}

#[test]
fn long_exposure_reports_remaining_time() {
    let (mut ctrl, handle) = sim_controller();
    ctrl.set_image_size(8, 8).expect("size");

    // Spend a while in the exposing phase so elapsed-time reads fire
    handle.set_exposure_polls(12);

    let mut listener = RecordingListener::default();
    ctrl.expose(1.5, 8, 8, true, None, Some(&mut listener))
        .expect("expose");

    assert!(!listener.elapsed.is_empty());
    for remaining in &listener.elapsed {
        assert!(*remaining <= 1.5, "remaining time {remaining} out of range");
    }
}

#[test]
fn raised_abort_flag_stops_the_exposure() {
    let (mut ctrl, handle) = sim_controller();
    ctrl.set_image_size(16, 16).expect("size");

    let abort = AtomicBool::new(true);
    let err = ctrl
        .expose(0.1, 16, 16, true, Some(&abort), None)
        .unwrap_err();
    assert!(matches!(err, CamError::Aborted));

    // The abort path sends ABR to the timing board
    let history = handle.command_history();
    assert!(history
        .iter()
        .any(|c| c[0] == camctl::proto::TIM_ID && c[1] == camctl::proto::ABR));
}

#[test]
fn exposure_needs_a_large_enough_buffer() {
    let (mut ctrl, _) = sim_controller();
    ctrl.device_mut().map_buffer(64).expect("map");

    let err = ctrl.expose(0.1, 32, 32, true, None, None).unwrap_err();
    assert!(matches!(err, CamError::ImageExceedsBuffer { .. }));
}

#[test]
fn failed_exposure_time_command_is_reported() {
    let (mut ctrl, handle) = sim_controller();
    ctrl.set_image_size(8, 8).expect("size");

    handle.fail_command(camctl::proto::SET, camctl::proto::ERR);
    let err = ctrl.expose(0.1, 8, 8, true, None, None).unwrap_err();
    assert!(matches!(err, CamError::CommandFailed { .. }));
    assert!(err.to_string().contains("Set exposure time failed"));
}
