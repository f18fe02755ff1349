//! Register-level controller simulator.
//!
//! Implements [`DeviceTransport`] in software together with a simulated
//! timing/utility board behind it, so the full command protocol can be
//! exercised without a PCIe board: command headers, reply words, DSP memory,
//! exposure and continuous-readout progression, temperature reads and error
//! injection.
//!
//! The simulator is deterministic: exposure and readout advance on register
//! *reads* (one step per pixel-count or frame-count poll), not on wall-clock
//! time, which keeps tests fast and repeatable.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};

use crate::device::regs::{self, STATUS_CLEAR_ALL};
use crate::device::transport::{CfgWidth, DeviceTransport, ImageBufferInfo, PcieBar};
use crate::error::{AppResult, CamError};
use crate::proto::{self, ERR, ROUT};

/// Controller id reported by default. Any non-SmallCam, non-error word.
pub const DEFAULT_CONTROLLER_ID: u32 = 0x0052_4556;

/// Default reported kernel-buffer capacity (bytes).
const DEFAULT_BUFFER_CAPACITY: u64 = 16 * 1024 * 1024;

/// Simulated physical address of the kernel buffer.
const SIM_BUFFER_PHYS_ADDR: u64 = 0xD000_0000;

/// Commands kept in the inspection history. Large enough to hold a full
/// setup including the data-link sweeps.
const HISTORY_LIMIT: usize = 8192;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Phase {
    Exposing,
    Readout,
    Done,
}

#[derive(Debug)]
struct Exposure {
    total_pixels: u32,
    pixel_count: u32,
    phase: Phase,
    polls_until_readout: u32,
    elapsed_ms: u32,
    continuous: bool,
    frames_done: u32,
    frame_poll_accum: u32,
}

#[derive(Debug)]
struct SimState {
    // Command channel
    cmd_words: Vec<u32>,
    expected_len: usize,
    reply: Option<u32>,
    header_error: bool,
    controller_reset: bool,

    // DSP memory, keyed by (board id, tagged address)
    memory: HashMap<(u32, u32), u32>,

    // Executed commands, oldest first: [board, cmd, args...]
    history: Vec<Vec<u32>>,

    // Acquisition
    exposure_ms: u32,
    num_frames: u32,
    frames_per_buffer: u32,
    exposure: Option<Exposure>,

    // Behavior knobs
    cc_params: u32,
    controller_id: Option<u32>,
    high_gain: bool,
    rdt_supported: bool,
    temperature_adu: u32,
    fiber_a_connected: bool,
    fiber_b_connected: bool,
    fiber_2x: bool,
    exposure_polls: u32,
    readout_steps: u32,
    frame_polls: u32,
    noise_seed: Option<u64>,

    // Error injection
    fail_next_command: Option<u32>,
    fail_on_command: Option<(u32, u32)>,
    drop_next_reply: bool,

    buffer_capacity: u64,
}

impl Default for SimState {
    fn default() -> Self {
        Self {
            cmd_words: Vec::new(),
            expected_len: 0,
            reply: None,
            header_error: false,
            controller_reset: false,
            memory: HashMap::new(),
            history: Vec::new(),
            exposure_ms: 0,
            num_frames: 1,
            frames_per_buffer: 1,
            exposure: None,
            cc_params: proto::ARC45
                | proto::TIMREV5
                | proto::UTILREV3
                | proto::SHUTTER_CC
                | proto::TEMP_SIDIODE
                | proto::SUBARRAY
                | proto::BINNING
                | proto::SPLIT_SERIAL
                | proto::SPLIT_PARALLEL
                | proto::CONT_RD,
            controller_id: Some(DEFAULT_CONTROLLER_ID),
            high_gain: false,
            rdt_supported: true,
            temperature_adu: 3000,
            fiber_a_connected: true,
            fiber_b_connected: false,
            fiber_2x: false,
            exposure_polls: 2,
            readout_steps: 4,
            frame_polls: 1,
            noise_seed: None,
            fail_next_command: None,
            fail_on_command: None,
            drop_next_reply: false,
            buffer_capacity: DEFAULT_BUFFER_CAPACITY,
        }
    }
}

/// Cloneable handle for configuring and inspecting a [`SimTransport`] after
/// it has been handed to a device.
#[derive(Clone)]
pub struct SimHandle {
    state: Arc<Mutex<SimState>>,
}

#[allow(clippy::unwrap_used)] // lock poisoning is a test-harness bug
impl SimHandle {
    /// Sets the controller-configuration word returned by `RCC`.
    pub fn set_cc_params(&self, value: u32) {
        self.state.lock().unwrap().cc_params = value;
    }

    /// Sets the controller id returned through the special-command register.
    /// `None` makes the id query time out, as a Gen III system does.
    pub fn set_controller_id(&self, id: Option<u32>) {
        self.state.lock().unwrap().controller_id = id;
    }

    /// Sets the temperature ADU reported by `RDT` and utility `Y:0xC` reads.
    pub fn set_temperature_adu(&self, adu: u32) {
        self.state.lock().unwrap().temperature_adu = adu;
    }

    /// Selects the high-gain utility board calibration (`THG` reply).
    pub fn set_high_gain(&self, on: bool) {
        self.state.lock().unwrap().high_gain = on;
    }

    /// Controls whether the utility board implements `RDT`.
    pub fn set_rdt_supported(&self, on: bool) {
        self.state.lock().unwrap().rdt_supported = on;
    }

    /// Sets the fiber link states reported in the status register.
    pub fn set_fibers(&self, a: bool, b: bool) {
        let mut state = self.state.lock().unwrap();
        state.fiber_a_connected = a;
        state.fiber_b_connected = b;
    }

    /// Number of pixel-count polls spent in the exposing phase before
    /// readout begins.
    pub fn set_exposure_polls(&self, polls: u32) {
        self.state.lock().unwrap().exposure_polls = polls;
    }

    /// Number of pixel-count polls readout takes to complete.
    pub fn set_readout_steps(&self, steps: u32) {
        self.state.lock().unwrap().readout_steps = steps.max(1);
    }

    /// Number of frame-count polls per completed continuous frame.
    pub fn set_frame_polls(&self, polls: u32) {
        self.state.lock().unwrap().frame_polls = polls.max(1);
    }

    /// Adds seeded noise to simulated image data.
    pub fn set_noise_seed(&self, seed: Option<u64>) {
        self.state.lock().unwrap().noise_seed = seed;
    }

    /// Makes the next command reply with the given word (typically `ERR`).
    pub fn fail_next_command(&self, reply: u32) {
        self.state.lock().unwrap().fail_next_command = Some(reply);
    }

    /// Makes the next occurrence of a specific command reply with the given
    /// word, leaving other commands untouched.
    pub fn fail_command(&self, cmd: u32, reply: u32) {
        self.state.lock().unwrap().fail_on_command = Some((cmd, reply));
    }

    /// Swallows the reply to the next command so the caller times out.
    pub fn drop_next_reply(&self) {
        self.state.lock().unwrap().drop_next_reply = true;
    }

    /// Raises the sticky header-error status bit.
    pub fn raise_header_error(&self) {
        self.state.lock().unwrap().header_error = true;
    }

    /// Reads back a DSP memory word written by `WRM`.
    pub fn memory(&self, board: u32, tagged_addr: u32) -> Option<u32> {
        self.state
            .lock()
            .unwrap()
            .memory
            .get(&(board, tagged_addr))
            .copied()
    }

    /// Pre-loads a DSP memory word.
    pub fn set_memory(&self, board: u32, tagged_addr: u32, value: u32) {
        self.state
            .lock()
            .unwrap()
            .memory
            .insert((board, tagged_addr), value);
    }

    /// Returns the executed commands, oldest first, as `[board, cmd, args..]`.
    pub fn command_history(&self) -> Vec<Vec<u32>> {
        self.state.lock().unwrap().history.clone()
    }

    /// Drops the recorded command history.
    pub fn clear_history(&self) {
        self.state.lock().unwrap().history.clear();
    }
}

/// Software transport with a simulated controller behind it.
pub struct SimTransport {
    state: Arc<Mutex<SimState>>,
    buffer: Option<Vec<u8>>,
}

impl Default for SimTransport {
    fn default() -> Self {
        Self::new()
    }
}

impl SimTransport {
    /// Creates a simulator with default behavior: fiber A connected, a CCD
    /// controller with the common feature set, instant replies.
    pub fn new() -> Self {
        Self {
            state: Arc::new(Mutex::new(SimState::default())),
            buffer: None,
        }
    }

    /// Returns a handle for test configuration and inspection.
    pub fn handle(&self) -> SimHandle {
        SimHandle {
            state: self.state.clone(),
        }
    }

    fn pixel_value(noise_seed: Option<u64>, frame: u32, index: u32) -> u16 {
        // Synthetic ramp, offset per frame so consecutive frames differ
        let base = (index.wrapping_add(frame.wrapping_mul(1000)) % 65536) as u16;
        match noise_seed {
            Some(seed) => {
                let mut rng =
                    StdRng::seed_from_u64(seed ^ (u64::from(frame) << 32) ^ u64::from(index));
                base.saturating_add(rng.gen_range(0..64))
            }
            None => base,
        }
    }

    fn write_frame(&mut self, frame: u32, slot: u32, total_pixels: u32) {
        let noise_seed = self.state.lock().map(|s| s.noise_seed).unwrap_or(None);

        let Some(buffer) = self.buffer.as_mut() else {
            return;
        };

        let frame_bytes = total_pixels as usize * 2;
        let offset = slot as usize * frame_bytes;
        if offset + frame_bytes > buffer.len() {
            return;
        }

        for i in 0..total_pixels {
            let value = Self::pixel_value(noise_seed, frame, i);
            let at = offset + i as usize * 2;
            buffer[at..at + 2].copy_from_slice(&value.to_le_bytes());
        }
    }

    fn clear_status(state: &mut SimState) {
        state.reply = None;
        state.cmd_words.clear();
        state.expected_len = 0;
        state.header_error = false;
        state.controller_reset = false;
    }

    fn status_word(state: &SimState) -> u32 {
        let mut status = 0u32;
        status |= match (&state.reply, state.cmd_words.is_empty()) {
            (Some(_), _) => 2,
            (None, false) => 1,
            (None, true) => 0,
        };
        if let Some(exp) = &state.exposure {
            if exp.phase == Phase::Readout {
                status |= 0x04;
            }
        }
        if state.controller_reset {
            status |= 0x08;
        }
        if state.header_error {
            status |= 0x10;
        }
        if state.fiber_a_connected {
            status |= 0x80;
        }
        if state.fiber_b_connected {
            status |= 0x100;
        }
        if state.fiber_2x {
            status |= 0x200;
        }
        status
    }

    fn image_geometry(state: &SimState) -> (u32, u32) {
        let rows = state
            .memory
            .get(&(proto::TIM_ID, proto::Y_MEM | 2))
            .copied()
            .unwrap_or(0);
        let cols = state
            .memory
            .get(&(proto::TIM_ID, proto::Y_MEM | 1))
            .copied()
            .unwrap_or(0);
        (rows, cols)
    }

    /// Advances the exposure state machine by one pixel-count poll. Returns
    /// a completed frame as `(frame, buffer slot, pixels)`.
    fn tick_pixels(state: &mut SimState) -> Option<(u32, u32, u32)> {
        let exposure_ms = state.exposure_ms;
        let exposure_polls = state.exposure_polls.max(1);
        let readout_steps = state.readout_steps;

        let exp = state.exposure.as_mut()?;
        match exp.phase {
            Phase::Exposing => {
                if exp.polls_until_readout > 0 {
                    exp.polls_until_readout -= 1;
                    let step = exposure_ms / exposure_polls;
                    exp.elapsed_ms = (exp.elapsed_ms + step).min(exposure_ms);
                }
                if exp.polls_until_readout == 0 {
                    exp.phase = Phase::Readout;
                }
                None
            }
            Phase::Readout if !exp.continuous => {
                let step = exp.total_pixels / readout_steps + 1;
                exp.pixel_count = (exp.pixel_count + step).min(exp.total_pixels);
                if exp.pixel_count >= exp.total_pixels {
                    exp.phase = Phase::Done;
                    // Single frame lands in buffer slot 0
                    return Some((0, 0, exp.total_pixels));
                }
                None
            }
            _ => None,
        }
    }

    /// Advances the continuous frame counter by one frame-count poll.
    fn tick_frames(state: &mut SimState) -> Option<(u32, u32, u32)> {
        let frame_polls = state.frame_polls;
        let num_frames = state.num_frames;
        let frames_per_buffer = state.frames_per_buffer.max(1);

        let exp = state.exposure.as_mut()?;
        if !exp.continuous || exp.phase == Phase::Done {
            return None;
        }
        exp.phase = Phase::Readout;

        exp.frame_poll_accum += 1;
        if exp.frame_poll_accum < frame_polls {
            return None;
        }
        exp.frame_poll_accum = 0;

        if exp.frames_done < num_frames {
            exp.frames_done += 1;
            let frame = exp.frames_done;
            let slot = (frame - 1) % frames_per_buffer;
            if exp.frames_done >= num_frames {
                exp.phase = Phase::Done;
            }
            return Some((frame, slot, exp.total_pixels));
        }
        None
    }

    fn execute(&mut self, words: &[u32]) {
        let state = self.state.clone();
        let mut state = match state.lock() {
            Ok(guard) => guard,
            Err(_) => return,
        };

        if state.drop_next_reply {
            state.drop_next_reply = false;
            return;
        }
        if let Some(reply) = state.fail_next_command.take() {
            state.reply = Some(reply);
            return;
        }
        if let Some((target, reply)) = state.fail_on_command {
            if words.get(1) == Some(&target) {
                state.fail_on_command = None;
                state.reply = Some(reply);
                return;
            }
        }

        let header = words[0];
        let board = (header >> 8) & 0xFFFF;
        let cmd = words.get(1).copied().unwrap_or(0);
        let arg = |i: usize| words.get(i + 2).copied().unwrap_or(0);

        let mut entry = vec![board, cmd];
        entry.extend_from_slice(words.get(2..).unwrap_or(&[]));
        if state.history.len() >= HISTORY_LIMIT {
            state.history.remove(0);
        }
        state.history.push(entry);

        let reply = match cmd {
            proto::TDL => arg(0),
            proto::WRM => {
                state.memory.insert((board, arg(0)), arg(1));
                proto::DON
            }
            proto::RDM => {
                if board == proto::UTIL_ID && arg(0) == (proto::Y_MEM | 0xC) {
                    state.temperature_adu
                } else {
                    state.memory.get(&(board, arg(0))).copied().unwrap_or(0)
                }
            }
            proto::SET => {
                state.exposure_ms = arg(0);
                proto::DON
            }
            proto::SEX => {
                let (rows, cols) = Self::image_geometry(&state);
                let continuous = state.num_frames > 1;
                let polls = state.exposure_polls;
                state.exposure = Some(Exposure {
                    total_pixels: rows * cols,
                    pixel_count: 0,
                    phase: Phase::Exposing,
                    polls_until_readout: polls,
                    elapsed_ms: 0,
                    continuous,
                    frames_done: 0,
                    frame_poll_accum: 0,
                });
                proto::DON
            }
            proto::RET => {
                let readout = state
                    .exposure
                    .as_ref()
                    .is_some_and(|e| e.phase == Phase::Readout);
                if readout {
                    ROUT
                } else {
                    state.exposure.as_ref().map_or(0, |e| e.elapsed_ms)
                }
            }
            proto::SNF => {
                state.num_frames = arg(0).max(1);
                proto::DON
            }
            proto::FPB => {
                state.frames_per_buffer = arg(0).max(1);
                proto::DON
            }
            proto::ABR => {
                state.exposure = None;
                proto::DON
            }
            proto::RCC => state.cc_params,
            proto::THG => u32::from(state.high_gain),
            proto::RDT => {
                if board == proto::TIM_ID || state.rdt_supported {
                    state.temperature_adu
                } else {
                    ERR
                }
            }
            proto::RDC => state.temperature_adu,
            proto::CDT => {
                state.memory.insert((board, proto::Y_MEM | 0x1C), arg(0));
                proto::DON
            }
            proto::SSS | proto::SSP | proto::PON | proto::POF | proto::STP | proto::IDL
            | proto::CLR | proto::OSH | proto::CSH | proto::XMT | proto::JDL | proto::SBS
            | proto::MPP | proto::SOS | proto::SGN => proto::DON,
            _ => ERR,
        };

        state.reply = Some(reply);
    }
}

impl DeviceTransport for SimTransport {
    fn read_bar(&mut self, bar: PcieBar, offset: u32) -> AppResult<u32> {
        if bar != PcieBar::DeviceRegs {
            return Ok(0);
        }

        let (completed_frame, value) = {
            let state = self.state.clone();
            let mut state = match state.lock() {
                Ok(guard) => guard,
                Err(_) => return Err(CamError::NoDevice),
            };

            match offset {
                regs::STATUS => (None, Self::status_word(&state)),
                regs::CMD_REPLY => (None, state.reply.unwrap_or(0)),
                regs::PIXEL_COUNT => {
                    let frame = Self::tick_pixels(&mut state);
                    let count = state.exposure.as_ref().map_or(0, |e| e.pixel_count);
                    (frame, count)
                }
                regs::FRAME_COUNT => {
                    let frame = Self::tick_frames(&mut state);
                    let count = state.exposure.as_ref().map_or(0, |e| e.frames_done);
                    (frame, count)
                }
                regs::ID_HI => (None, regs::BOARD_ID),
                regs::ID_LO => (None, 0x3652_3141),
                _ => (None, 0),
            }
        };

        if let Some((frame, slot, pixels)) = completed_frame {
            self.write_frame(frame, slot, pixels);
        }
        Ok(value)
    }

    fn write_bar(&mut self, bar: PcieBar, offset: u32, value: u32) -> AppResult<()> {
        if bar != PcieBar::DeviceRegs {
            return Ok(());
        }

        let execute = {
            let state = self.state.clone();
            let mut state = match state.lock() {
                Ok(guard) => guard,
                Err(_) => return Err(CamError::NoDevice),
            };

            match offset {
                regs::CMD_HEADER => {
                    state.reply = None;
                    state.header_error = false;
                    state.controller_reset = false;
                    state.cmd_words.clear();
                    state.cmd_words.push(value & 0x00FF_FFFF);
                    state.expected_len = (value & 0xFF) as usize;
                }
                regs::CMD_COMMAND
                | regs::CMD_ARG0
                | regs::CMD_ARG1
                | regs::CMD_ARG2
                | regs::CMD_ARG3
                | regs::CMD_ARG4 => {
                    state.cmd_words.push(value & 0x00FF_FFFF);
                }
                regs::CTLR_SPECIAL_CMD => {
                    match value {
                        regs::CONTROLLER_GET_ID => {
                            state.reply = state.controller_id;
                        }
                        regs::CONTROLLER_RESET => {
                            state.exposure = None;
                            state.controller_reset = true;
                        }
                        _ => {}
                    }
                    return Ok(());
                }
                regs::RESET => {
                    *state = SimState {
                        buffer_capacity: state.buffer_capacity,
                        ..SimState::default()
                    };
                    return Ok(());
                }
                regs::STATUS => {
                    if value == STATUS_CLEAR_ALL {
                        Self::clear_status(&mut state);
                    }
                    return Ok(());
                }
                regs::FIBER_2X_CTRL => {
                    state.fiber_2x = value != 0;
                    return Ok(());
                }
                _ => return Ok(()),
            }

            if !state.cmd_words.is_empty() && state.cmd_words.len() == state.expected_len {
                Some(state.cmd_words.clone())
            } else {
                None
            }
        };

        if let Some(words) = execute {
            self.execute(&words);
        }
        Ok(())
    }

    fn read_cfg(&mut self, _width: CfgWidth, offset: u32) -> AppResult<u32> {
        // Vendor/device id at offset 0, everything else reads zero
        if offset == 0 {
            Ok(0x9056_10B5)
        } else {
            Ok(0)
        }
    }

    fn write_cfg(&mut self, _width: CfgWidth, _offset: u32, _value: u32) -> AppResult<()> {
        Ok(())
    }

    fn map_buffer(&mut self, bytes: usize) -> AppResult<()> {
        if self.buffer.is_some() {
            return Err(CamError::BufferAlreadyMapped);
        }
        self.buffer = Some(vec![0u8; bytes]);
        Ok(())
    }

    fn unmap_buffer(&mut self) -> AppResult<()> {
        self.buffer = None;
        Ok(())
    }

    fn buffer_info(&mut self) -> AppResult<ImageBufferInfo> {
        let capacity = self
            .state
            .lock()
            .map(|s| s.buffer_capacity)
            .unwrap_or(DEFAULT_BUFFER_CAPACITY);
        Ok(ImageBufferInfo {
            physical_addr: SIM_BUFFER_PHYS_ADDR,
            size: capacity,
        })
    }

    fn buffer(&self) -> Option<&[u8]> {
        self.buffer.as_deref()
    }

    fn buffer_mut(&mut self) -> Option<&mut [u8]> {
        self.buffer.as_deref_mut()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn send(sim: &mut SimTransport, words: &[u32]) -> u32 {
        let header = 0xAC00_0000 | (words[0] << 8) | words.len() as u32;
        sim.write_bar(PcieBar::DeviceRegs, regs::STATUS, STATUS_CLEAR_ALL)
            .expect("clear");
        sim.write_bar(PcieBar::DeviceRegs, regs::CMD_HEADER, header)
            .expect("header");
        let mut offset = regs::CMD_COMMAND;
        for word in &words[1..] {
            sim.write_bar(PcieBar::DeviceRegs, offset, 0xAC00_0000 | word)
                .expect("word");
            offset += 4;
        }
        sim.read_bar(PcieBar::DeviceRegs, regs::CMD_REPLY)
            .expect("reply")
    }

    #[test]
    fn tdl_echoes_argument() {
        let mut sim = SimTransport::new();
        assert_eq!(send(&mut sim, &[proto::TIM_ID, proto::TDL, 0x1234]), 0x1234);
    }

    #[test]
    fn wrm_rdm_round_trip() {
        let mut sim = SimTransport::new();
        let addr = proto::Y_MEM | 7;
        assert_eq!(
            send(&mut sim, &[proto::TIM_ID, proto::WRM, addr, 42]),
            proto::DON
        );
        assert_eq!(send(&mut sim, &[proto::TIM_ID, proto::RDM, addr]), 42);
    }

    #[test]
    fn status_reports_reply_received_after_command() {
        let mut sim = SimTransport::new();
        send(&mut sim, &[proto::TIM_ID, proto::PON]);
        let status = sim
            .read_bar(PcieBar::DeviceRegs, regs::STATUS)
            .expect("status");
        assert_eq!(status & 0x3, 2);
    }

    #[test]
    fn unknown_command_replies_err() {
        let mut sim = SimTransport::new();
        assert_eq!(send(&mut sim, &[proto::TIM_ID, 0x0058_5858]), ERR);
    }

    #[test]
    fn injection_forces_error_reply() {
        let mut sim = SimTransport::new();
        sim.handle().fail_next_command(ERR);
        assert_eq!(send(&mut sim, &[proto::TIM_ID, proto::PON]), ERR);
        // Next command is back to normal
        assert_eq!(send(&mut sim, &[proto::TIM_ID, proto::PON]), proto::DON);
    }

    #[test]
    fn history_records_board_and_arguments() {
        let mut sim = SimTransport::new();
        let handle = sim.handle();
        send(&mut sim, &[proto::TIM_ID, proto::SSS, 10, 20, 30]);
        let history = handle.command_history();
        assert_eq!(history.len(), 1);
        assert_eq!(history[0], vec![proto::TIM_ID, proto::SSS, 10, 20, 30]);
    }
}
