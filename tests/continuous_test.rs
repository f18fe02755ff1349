//! Continuous-readout integration tests against the register-level
//! simulator.

use std::sync::atomic::AtomicBool;

use camctl::controller::{Controller, FrameListener};
use camctl::device::sim::{SimHandle, SimTransport};
use camctl::device::PcieDevice;
use camctl::error::CamError;
use camctl::proto::{self, TIM_ID};

fn sim_controller() -> (Controller, SimHandle) {
    let sim = SimTransport::new();
    let handle = sim.handle();
    let dev = PcieDevice::with_transport(Box::new(sim));
    (Controller::new(dev), handle)
}

#[derive(Default)]
struct RecordingListener {
    frames: Vec<(u32, u32, u16)>, // (buffer index, frame number, first pixel)
}

impl FrameListener for RecordingListener {
    fn frame(&mut self, buffer_index: u32, frame_number: u32, _rows: u32, _cols: u32, data: &[u16]) {
        self.frames.push((buffer_index, frame_number, data[0]));
    }
}

#[test]
fn continuous_reads_all_frames() {
    let (mut ctrl, _) = sim_controller();

    // A buffer holding four 8x8 frames
    ctrl.device_mut().map_buffer(4 * 8 * 8 * 2).expect("map");
    ctrl.set_image_size(8, 8).expect("size");

    let mut listener = RecordingListener::default();
    ctrl.continuous(8, 8, 6, 0.05, true, None, Some(&mut listener))
        .expect("continuous");

    assert_eq!(listener.frames.len(), 6);

    // Frame numbers run 1..=6 and buffer slots wrap at four frames
    for (i, (slot, frame_number, first_pixel)) in listener.frames.iter().enumerate() {
        assert_eq!(*frame_number, i as u32 + 1);
        assert_eq!(*slot, (i as u32) % 4);
        // The simulator offsets each frame's ramp so frames are telling
        assert_eq!(*first_pixel, (((i as u32 + 1) * 1000) % 65536) as u16);
    }
}

#[test]
fn continuous_restores_single_image_mode() {
    let (mut ctrl, handle) = sim_controller();
    ctrl.device_mut().map_buffer(2 * 8 * 8 * 2).expect("map");
    ctrl.set_image_size(8, 8).expect("size");

    ctrl.continuous(8, 8, 3, 0.05, true, None, None)
        .expect("continuous");

    let history = handle.command_history();
    let last_snf = history
        .iter()
        .rev()
        .find(|c| c[0] == TIM_ID && c[1] == proto::SNF)
        .expect("SNF sent");
    assert_eq!(last_snf[2], 1, "controller left in continuous mode");

    // Frames-per-buffer reflected the mapped buffer capacity
    let fpb = history
        .iter()
        .find(|c| c[0] == TIM_ID && c[1] == proto::FPB)
        .expect("FPB sent");
    assert_eq!(fpb[2], 2);
}

#[test]
fn continuous_rejects_zero_frames() {
    let (mut ctrl, _) = sim_controller();
    ctrl.set_image_size(8, 8).expect("size");

    let err = ctrl.continuous(8, 8, 0, 0.05, true, None, None).unwrap_err();
    assert!(matches!(err, CamError::Configuration(_)));
}

#[test]
fn aborted_continuous_restores_single_image_mode() {
    let (mut ctrl, handle) = sim_controller();
    ctrl.set_image_size(8, 8).expect("size");

    let abort = AtomicBool::new(true);
    let err = ctrl
        .continuous(8, 8, 4, 0.05, true, Some(&abort), None)
        .unwrap_err();
    assert!(matches!(err, CamError::Aborted));

    // The teardown path aborts the exposure and sets SNF back to 1
    let history = handle.command_history();
    assert!(history.iter().any(|c| c[1] == proto::ABR));
    let last_snf = history
        .iter()
        .rev()
        .find(|c| c[1] == proto::SNF)
        .expect("SNF sent");
    assert_eq!(last_snf[2], 1);
}

#[test]
fn continuous_needs_a_large_enough_buffer() {
    let (mut ctrl, _) = sim_controller();
    ctrl.device_mut().map_buffer(64).expect("map");

    let err = ctrl
        .continuous(32, 32, 2, 0.05, true, None, None)
        .unwrap_err();
    assert!(matches!(err, CamError::ImageExceedsBuffer { .. }));
}
