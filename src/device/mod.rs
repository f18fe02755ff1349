//! PCIe device handle.
//!
//! [`PcieDevice`] owns a [`DeviceTransport`] and implements the board-level
//! protocol on top of it: status interpretation, the command/reply channel,
//! controller queries, the common-buffer lifecycle and the command log.
//! Everything camera-specific (geometry, exposures, temperature) lives in
//! [`crate::controller`].

pub mod regs;
pub mod sim;
pub mod transport;

use std::collections::VecDeque;
use std::fmt;
use std::time::{Duration, Instant};

use tracing::debug;

use crate::error::{AppResult, CamError};
use crate::proto::{self, word_name, CNR, HERR, SYR};
pub use transport::{find_devices, CfgWidth, DeviceTransport, ImageBufferInfo, PcieBar};

/// Interval between status polls while waiting on a reply.
const REPLY_POLL_INTERVAL: Duration = Duration::from_millis(1);

/// Default reply timeout.
pub const DEFAULT_REPLY_TIMEOUT: Duration = Duration::from_millis(1500);

/// Reply window used for the controller id query. Gen III systems never
/// answer it, so the window is kept short.
const ID_REPLY_TIMEOUT: Duration = Duration::from_millis(500);

/// Commands kept in the command log.
const CMD_LOG_LIMIT: usize = 256;

/// Receive fiber optic selector.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Fiber {
    /// Receive fiber A.
    A,
    /// Receive fiber B.
    B,
}

/// Board status word with named bit predicates.
///
/// The low two bits encode a three-way command channel state, so `idle`,
/// `command_sent` and `reply_received` are mutually exclusive.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Status(pub u32);

impl Status {
    /// The command channel is idle.
    pub fn idle(self) -> bool {
        self.0 & 0x3 == 0
    }

    /// A command was sent and no reply has arrived yet.
    pub fn command_sent(self) -> bool {
        self.0 & 0x3 == 1
    }

    /// A controller reply has been received.
    pub fn reply_received(self) -> bool {
        self.0 & 0x3 == 2
    }

    /// The controller is currently reading out image data.
    pub fn readout(self) -> bool {
        self.0 & 0x4 != 0
    }

    /// The controller has been reset.
    pub fn controller_reset(self) -> bool {
        self.0 & 0x8 != 0
    }

    /// An incorrect command/reply header was received.
    pub fn header_error(self) -> bool {
        self.0 & 0x10 != 0
    }

    /// The board timed out waiting for image data.
    pub fn image_read_timeout(self) -> bool {
        self.0 & 0x20 != 0
    }

    /// Receive fiber A is connected to a powered-on controller.
    pub fn fiber_a_connected(self) -> bool {
        self.0 & 0x80 != 0
    }

    /// Receive fiber B is connected to a powered-on controller.
    pub fn fiber_b_connected(self) -> bool {
        self.0 & 0x100 != 0
    }

    /// Dual receive fibers are enabled.
    pub fn fiber_2x_receiver(self) -> bool {
        self.0 & 0x200 != 0
    }
}

impl fmt::Display for Status {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:#X}", self.0)
    }
}

/// Handle to a PCIe-attached camera controller interface board.
pub struct PcieDevice {
    transport: Box<dyn DeviceTransport>,
    /// Logical size of the mapped buffer, clamped to the mapping request.
    buffer_len: u64,
    buffer_info: ImageBufferInfo,
    mapped: bool,
    reply_timeout: Duration,
    log_commands: bool,
    cmd_log: VecDeque<String>,
}

impl PcieDevice {
    /// Opens device number `device_number`, without mapping the image buffer.
    ///
    /// Device numbers index the sorted `/dev` node list from
    /// [`find_devices`].
    #[cfg(feature = "pcie_hardware")]
    pub fn open(device_number: u32) -> AppResult<Self> {
        let devices = find_devices()?;
        let path = devices
            .get(device_number as usize)
            .ok_or(CamError::InvalidDeviceNumber(device_number))?;

        let transport = transport::PcieTransport::open(path)?;
        let mut device = Self::with_transport(Box::new(transport));
        device.clear_status()?;
        Ok(device)
    }

    /// Opens device number `device_number` and maps `rows * cols` 16-bit
    /// pixels of the image buffer.
    #[cfg(feature = "pcie_hardware")]
    pub fn open_with_geometry(device_number: u32, rows: u32, cols: u32) -> AppResult<Self> {
        let mut device = Self::open(device_number)?;
        device.map_buffer(rows as usize * cols as usize * 2)?;
        Ok(device)
    }

    /// Wraps an already-connected transport, typically a
    /// [`sim::SimTransport`].
    pub fn with_transport(transport: Box<dyn DeviceTransport>) -> Self {
        Self {
            transport,
            buffer_len: 0,
            buffer_info: ImageBufferInfo::default(),
            mapped: false,
            reply_timeout: DEFAULT_REPLY_TIMEOUT,
            log_commands: false,
            cmd_log: VecDeque::new(),
        }
    }

    /// Sets the reply timeout used by [`PcieDevice::command`].
    pub fn set_reply_timeout(&mut self, timeout: Duration) {
        self.reply_timeout = timeout;
    }

    //  Registers & status
    // +---------------------------------------------------------------+

    /// Reads a device register.
    pub fn read_bar(&mut self, bar: PcieBar, offset: u32) -> AppResult<u32> {
        self.transport.read_bar(bar, offset)
    }

    /// Writes a device register.
    pub fn write_bar(&mut self, bar: PcieBar, offset: u32, value: u32) -> AppResult<()> {
        self.transport.write_bar(bar, offset, value)
    }

    /// Reads PCI configuration space.
    pub fn read_cfg(&mut self, width: CfgWidth, offset: u32) -> AppResult<u32> {
        self.transport.read_cfg(width, offset)
    }

    /// Writes PCI configuration space.
    pub fn write_cfg(&mut self, width: CfgWidth, offset: u32, value: u32) -> AppResult<()> {
        self.transport.write_cfg(width, offset, value)
    }

    /// Returns the board id (`ARC6`).
    pub fn id(&mut self) -> AppResult<u32> {
        self.read_bar(PcieBar::DeviceRegs, regs::ID_HI)
    }

    /// Returns the board status word.
    pub fn status(&mut self) -> AppResult<Status> {
        Ok(Status(self.read_bar(PcieBar::DeviceRegs, regs::STATUS)?))
    }

    /// Clears the board status register.
    pub fn clear_status(&mut self) -> AppResult<()> {
        self.write_bar(PcieBar::DeviceRegs, regs::STATUS, regs::STATUS_CLEAR_ALL)
    }

    /// Resets the board and verifies that it comes back idle.
    pub fn reset(&mut self) -> AppResult<()> {
        self.write_bar(PcieBar::DeviceRegs, regs::RESET, 1)?;

        let status = self.status()?;
        if !status.idle() {
            return Err(CamError::ResetFailed { status: status.0 });
        }
        Ok(())
    }

    //  Common buffer
    // +---------------------------------------------------------------+

    /// Maps `bytes` of the kernel image buffer into this process.
    ///
    /// The driver must report a buffer at least as large as the request; the
    /// logical size visible through [`PcieDevice::buffer_size`] is clamped
    /// to the request.
    pub fn map_buffer(&mut self, bytes: usize) -> AppResult<()> {
        if bytes == 0 {
            return Err(CamError::InvalidBufferSize(bytes));
        }
        if self.mapped {
            return Err(CamError::BufferAlreadyMapped);
        }

        self.transport.map_buffer(bytes)?;

        let info = self.transport.buffer_info()?;
        if info.size < bytes as u64 {
            self.transport.unmap_buffer()?;
            return Err(CamError::ShortBuffer {
                wanted: bytes as u64,
                received: info.size,
            });
        }

        self.buffer_info = info;
        self.buffer_len = bytes as u64;
        self.mapped = true;
        Ok(())
    }

    /// Releases the image buffer mapping.
    pub fn unmap_buffer(&mut self) -> AppResult<()> {
        self.transport.unmap_buffer()?;
        self.buffer_info = ImageBufferInfo::default();
        self.buffer_len = 0;
        self.mapped = false;
        Ok(())
    }

    /// Re-maps the image buffer with a new size.
    pub fn remap_buffer(&mut self, bytes: usize) -> AppResult<()> {
        if self.mapped {
            self.unmap_buffer()?;
        }
        self.map_buffer(bytes)
    }

    /// Fills the mapped image buffer with a pixel value.
    pub fn fill_buffer(&mut self, value: u16) -> AppResult<()> {
        let buffer = self
            .transport
            .buffer_mut()
            .ok_or(CamError::BufferNotMapped)?;
        for chunk in buffer.chunks_exact_mut(2) {
            chunk.copy_from_slice(&value.to_le_bytes());
        }
        Ok(())
    }

    /// Logical size of the mapped buffer, in bytes.
    pub fn buffer_size(&self) -> u64 {
        self.buffer_len
    }

    /// Physical address of the kernel buffer. Informational only.
    pub fn buffer_physical_addr(&self) -> u64 {
        self.buffer_info.physical_addr
    }

    /// Returns true when the image buffer is mapped.
    pub fn is_buffer_mapped(&self) -> bool {
        self.mapped
    }

    /// Copies `count` pixels out of the buffer starting at pixel
    /// `pixel_offset`.
    pub fn pixels(&self, pixel_offset: usize, count: usize) -> AppResult<Vec<u16>> {
        let buffer = self.transport.buffer().ok_or(CamError::BufferNotMapped)?;
        let start = pixel_offset * 2;
        let end = start + count * 2;
        if end > buffer.len() {
            return Err(CamError::ImageExceedsBuffer {
                rows: 0,
                cols: count as u32,
                buffer_size: buffer.len() as u64,
            });
        }
        Ok(buffer[start..end]
            .chunks_exact(2)
            .map(|b| u16::from_le_bytes([b[0], b[1]]))
            .collect())
    }

    //  Command channel
    // +---------------------------------------------------------------+

    /// Sends a command to a controller board and returns the reply word.
    ///
    /// `words` is `[board id, command, arg0, ..]` with at most
    /// [`proto::CTLR_CMD_MAX`] entries. Returns `DON` on success, `ERR` on a
    /// controller error; a missing reply is a timeout error. Sending while
    /// the board reports readout is refused.
    pub fn command(&mut self, words: &[u32]) -> AppResult<u32> {
        let status = self.status()?;
        if status.readout() {
            return Err(CamError::ReadoutInProgress { status: status.0 });
        }

        self.clear_status()?;
        self.write_command_words(words)?;

        let reply = match self.read_reply(self.reply_timeout) {
            Ok(reply) => reply,
            Err(err) => {
                self.log_command(words, None);
                return Err(err);
            }
        };

        self.log_command(words, Some(reply));

        if reply == CNR {
            return Err(CamError::ControllerNotReady(reply));
        }

        Ok(reply)
    }

    /// Sends a command and verifies the reply against `expected`.
    pub fn command_expect(&mut self, words: &[u32], expected: u32) -> AppResult<()> {
        let reply = self.command(words)?;
        if reply != expected {
            return Err(CamError::ReplyMismatch {
                received: reply,
                expected,
            });
        }
        Ok(())
    }

    fn write_command_words(&mut self, words: &[u32]) -> AppResult<()> {
        debug_assert!(!words.is_empty() && words.len() <= proto::CTLR_CMD_MAX);

        let mut offset = regs::CMD_HEADER;
        for (i, &word) in words.iter().enumerate() {
            let value = if i == 0 {
                (word << 8) | words.len() as u32
            } else {
                word
            };

            verify_24_bits(value)?;
            self.write_bar(PcieBar::DeviceRegs, offset, regs::CMD_TAG | value)?;
            offset += 4;
        }
        Ok(())
    }

    /// Waits for a controller reply.
    ///
    /// A header-error status yields `HERR` and a controller-reset status
    /// yields `SYR` instead of the reply register contents.
    pub fn read_reply(&mut self, timeout: Duration) -> AppResult<u32> {
        let start = Instant::now();

        loop {
            let status = self.status()?;

            if status.header_error() {
                return Ok(HERR);
            }
            if status.controller_reset() {
                return Ok(SYR);
            }
            if status.reply_received() {
                return self.read_bar(PcieBar::DeviceRegs, regs::CMD_REPLY);
            }

            if start.elapsed() > timeout {
                return Err(CamError::ReplyTimeout {
                    waited: start.elapsed(),
                    status: status.0,
                });
            }

            std::thread::sleep(REPLY_POLL_INTERVAL);
        }
    }

    //  Controller queries
    // +---------------------------------------------------------------+

    /// Returns the controller id: ascii `SC0` for SmallCam, the id word for
    /// Gen II, or 0 when the query times out (Gen III systems never reply).
    pub fn controller_id(&mut self) -> AppResult<u32> {
        self.clear_status()?;
        self.write_bar(
            PcieBar::DeviceRegs,
            regs::CTLR_SPECIAL_CMD,
            regs::CONTROLLER_GET_ID,
        )?;

        Ok(self.read_reply(ID_REPLY_TIMEOUT).unwrap_or(0))
    }

    /// Resets the controller: power is cycled and the DSP boot code reloads
    /// from ROM.
    pub fn reset_controller(&mut self) -> AppResult<()> {
        self.clear_status()?;
        self.write_bar(
            PcieBar::DeviceRegs,
            regs::CTLR_SPECIAL_CMD,
            regs::CONTROLLER_RESET,
        )?;

        let reply = self.read_reply(self.reply_timeout)?;
        if reply != SYR {
            return Err(CamError::command("Failed to reset controller", reply));
        }
        Ok(())
    }

    /// Returns true when a powered-on controller is attached to fiber A.
    pub fn is_controller_connected(&mut self) -> AppResult<bool> {
        self.is_fiber_connected(Fiber::A)
    }

    /// Returns true when the given receive fiber sees a powered-on
    /// controller.
    pub fn is_fiber_connected(&mut self, fiber: Fiber) -> AppResult<bool> {
        let status = self.status()?;
        Ok(match fiber {
            Fiber::A => status.fiber_a_connected(),
            Fiber::B => status.fiber_b_connected(),
        })
    }

    /// Enables or disables the second fiber optic transmitter on the timing
    /// board and the matching dual receiver on the interface board.
    pub fn set_fo_transmitter_2x(&mut self, enable: bool) -> AppResult<()> {
        let arg = u32::from(enable);
        let reply = self.command(&[proto::TIM_ID, proto::XMT, arg])?;
        if reply != proto::DON {
            return Err(CamError::command(
                format!(
                    "Failed to {} use of 2x fiber optic transmitters on controller",
                    if enable { "set" } else { "clear" }
                ),
                reply,
            ));
        }

        self.write_bar(PcieBar::DeviceRegs, regs::FIBER_2X_CTRL, arg)
    }

    //  Exposure support
    // +---------------------------------------------------------------+

    /// Aborts the current exposure or readout.
    ///
    /// The abort command is written directly to the command registers, not
    /// through [`PcieDevice::command`], because the latter refuses to send
    /// while readout is in progress.
    pub fn stop_exposure(&mut self) -> AppResult<()> {
        let header = (proto::TIM_ID << 8) | 2;
        self.write_bar(PcieBar::DeviceRegs, regs::CMD_HEADER, regs::CMD_TAG | header)?;
        self.write_bar(
            PcieBar::DeviceRegs,
            regs::CMD_COMMAND,
            regs::CMD_TAG | proto::ABR,
        )?;

        let reply = self.read_reply(self.reply_timeout)?;
        if reply != proto::DON {
            return Err(CamError::command("Failed to stop exposure/readout", reply));
        }
        Ok(())
    }

    /// Streams up to six firmware words to a SmallCam controller.
    ///
    /// SmallCam systems take their firmware as a sequence of download
    /// packets addressed to [`proto::SMALLCAM_DLOAD_ID`] rather than as
    /// per-word memory writes.
    pub fn small_cam_dload(&mut self, board_id: u32, data: &[u32]) -> AppResult<u32> {
        let status = self.status()?;
        if status.readout() {
            return Err(CamError::ReadoutInProgress { status: status.0 });
        }

        if data.len() > 6 {
            return Err(CamError::Firmware(format!(
                "download packet too large: {} words, must be at most 6",
                data.len()
            )));
        }
        if board_id != proto::SMALLCAM_DLOAD_ID {
            return Err(CamError::Firmware(format!(
                "invalid download board id: {board_id}, must be {}",
                proto::SMALLCAM_DLOAD_ID
            )));
        }

        self.clear_status()?;

        let header = (board_id << 8) | (data.len() as u32 + 1);
        verify_24_bits(header)?;
        self.write_bar(PcieBar::DeviceRegs, regs::CMD_HEADER, regs::CMD_TAG | header)?;

        let mut offset = regs::CMD_COMMAND;
        for &word in data {
            verify_24_bits(word)?;
            self.write_bar(PcieBar::DeviceRegs, offset, regs::CMD_TAG | word)?;
            offset += 4;
        }

        self.read_reply(self.reply_timeout)
    }

    /// Returns true while the controller is reading out image pixels.
    pub fn is_readout(&mut self) -> AppResult<bool> {
        Ok(self.status()?.readout())
    }

    /// Returns the current readout pixel count.
    pub fn pixel_count(&mut self) -> AppResult<u32> {
        let count = self.read_bar(PcieBar::DeviceRegs, regs::PIXEL_COUNT)?;
        if self.log_commands {
            self.push_log(format!("[ PIXEL COUNT REG: {:#X} -> {count} ]", regs::PIXEL_COUNT));
        }
        Ok(count)
    }

    /// Returns the current continuous-readout frame count.
    pub fn frame_count(&mut self) -> AppResult<u32> {
        let count = self.read_bar(PcieBar::DeviceRegs, regs::FRAME_COUNT)?;
        if self.log_commands {
            self.push_log(format!("[ FRAME COUNT REG: {:#X} -> {count} ]", regs::FRAME_COUNT));
        }
        Ok(count)
    }

    /// Cumulative pixel count across continuous-readout frames. The PCIe
    /// board does not implement this register.
    pub fn cumulative_pixel_count(&mut self) -> AppResult<u32> {
        Err(CamError::Unsupported("cumulative pixel count"))
    }

    /// Boundary-adjusted image size for continuous readout. The PCIe board
    /// writes frames contiguously, so no adjustment is needed.
    pub fn continuous_image_size(&self, image_size: u32) -> u32 {
        image_size
    }

    //  Command log
    // +---------------------------------------------------------------+

    /// Enables or disables command logging. Logging slows every command
    /// down and is intended for debugging.
    pub fn set_log_commands(&mut self, enable: bool) {
        self.log_commands = enable;
    }

    /// Pops the oldest message from the command log.
    pub fn next_logged_command(&mut self) -> Option<String> {
        self.cmd_log.pop_front()
    }

    /// Number of messages in the command log.
    pub fn logged_command_count(&self) -> usize {
        self.cmd_log.len()
    }

    fn log_command(&mut self, words: &[u32], reply: Option<u32>) {
        if !self.log_commands {
            return;
        }

        let mut line = words
            .iter()
            .enumerate()
            .map(|(i, &w)| {
                if i == 1 {
                    word_name(w)
                } else {
                    format!("{w:#X}")
                }
            })
            .collect::<Vec<_>>()
            .join(" ");

        match reply {
            Some(reply) => line.push_str(&format!(" -> {}", word_name(reply))),
            None => line.push_str(" -> <no reply>"),
        }

        debug!(target: "camctl::device", "{line}");
        self.push_log(line);
    }

    fn push_log(&mut self, line: String) {
        if self.cmd_log.len() >= CMD_LOG_LIMIT {
            self.cmd_log.pop_front();
        }
        self.cmd_log.push_back(line);
    }
}

/// Rejects values wider than the 24-bit command payload.
fn verify_24_bits(value: u32) -> AppResult<()> {
    if value > 0x00FF_FFFF {
        return Err(CamError::ValueTooWide(value));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::sim::SimTransport;
    use super::*;
    use crate::proto::{DON, ERR, TIM_ID, UTIL_ID};

    fn sim_device() -> (PcieDevice, sim::SimHandle) {
        let sim = SimTransport::new();
        let handle = sim.handle();
        (PcieDevice::with_transport(Box::new(sim)), handle)
    }

    #[test]
    fn status_predicates_are_exclusive_in_low_bits() {
        assert!(Status(0).idle());
        assert!(!Status(0).command_sent());
        assert!(!Status(0).reply_received());

        assert!(Status(1).command_sent());
        assert!(!Status(1).idle());

        assert!(Status(2).reply_received());
        assert!(!Status(2).idle());
        assert!(!Status(2).command_sent());
    }

    #[test]
    fn status_flag_bits() {
        assert!(Status(0x4).readout());
        assert!(Status(0x8).controller_reset());
        assert!(Status(0x10).header_error());
        assert!(Status(0x20).image_read_timeout());
        assert!(Status(0x80).fiber_a_connected());
        assert!(Status(0x100).fiber_b_connected());
        assert!(Status(0x200).fiber_2x_receiver());
    }

    #[test]
    fn command_returns_reply() {
        let (mut dev, _) = sim_device();
        assert_eq!(dev.command(&[TIM_ID, proto::PON]).expect("reply"), DON);
    }

    #[test]
    fn command_expect_flags_mismatch() {
        let (mut dev, handle) = sim_device();
        handle.fail_next_command(ERR);
        let err = dev.command_expect(&[TIM_ID, proto::PON], DON).unwrap_err();
        assert!(matches!(
            err,
            CamError::ReplyMismatch {
                received: ERR,
                expected: DON
            }
        ));
    }

    #[test]
    fn command_times_out_without_reply() {
        let (mut dev, handle) = sim_device();
        dev.set_reply_timeout(Duration::from_millis(20));
        handle.drop_next_reply();
        let err = dev.command(&[TIM_ID, proto::PON]).unwrap_err();
        assert!(matches!(err, CamError::ReplyTimeout { .. }));
    }

    #[test]
    fn header_error_status_becomes_herr_reply() {
        let (mut dev, handle) = sim_device();
        handle.raise_header_error();
        let reply = dev.read_reply(Duration::from_millis(20)).expect("reply");
        assert_eq!(reply, HERR);
    }

    #[test]
    fn oversized_command_value_is_rejected() {
        let (mut dev, _) = sim_device();
        let err = dev
            .command(&[TIM_ID, proto::WRM, 0x0100_0000, 1])
            .unwrap_err();
        assert!(matches!(err, CamError::ValueTooWide(_)));
    }

    #[test]
    fn board_id_reads_arc6() {
        let (mut dev, _) = sim_device();
        assert_eq!(dev.id().expect("id"), regs::BOARD_ID);
    }

    #[test]
    fn controller_id_times_out_to_zero() {
        let (mut dev, handle) = sim_device();
        handle.set_controller_id(None);
        assert_eq!(dev.controller_id().expect("id"), 0);
    }

    #[test]
    fn reset_controller_expects_syr() {
        let (mut dev, _) = sim_device();
        dev.reset_controller().expect("reset");
    }

    #[test]
    fn buffer_map_lifecycle() {
        let (mut dev, _) = sim_device();

        assert!(matches!(
            dev.map_buffer(0),
            Err(CamError::InvalidBufferSize(0))
        ));

        dev.map_buffer(1024).expect("map");
        assert_eq!(dev.buffer_size(), 1024);
        assert!(dev.is_buffer_mapped());
        assert!(matches!(
            dev.map_buffer(2048),
            Err(CamError::BufferAlreadyMapped)
        ));

        dev.remap_buffer(2048).expect("remap");
        assert_eq!(dev.buffer_size(), 2048);

        dev.unmap_buffer().expect("unmap");
        assert!(!dev.is_buffer_mapped());
        assert_eq!(dev.buffer_size(), 0);
    }

    #[test]
    fn fill_buffer_writes_pixels() {
        let (mut dev, _) = sim_device();
        dev.map_buffer(16).expect("map");
        dev.fill_buffer(0xABCD).expect("fill");
        let pixels = dev.pixels(0, 8).expect("pixels");
        assert!(pixels.iter().all(|&p| p == 0xABCD));
    }

    #[test]
    fn command_log_records_round_trips() {
        let (mut dev, _) = sim_device();
        dev.set_log_commands(true);
        dev.command(&[UTIL_ID, proto::PON]).expect("reply");
        assert_eq!(dev.logged_command_count(), 1);
        let line = dev.next_logged_command().expect("line");
        assert!(line.contains("PON"), "{line}");
        assert!(line.contains("-> DON"), "{line}");
        assert!(dev.next_logged_command().is_none());
    }

    #[test]
    fn fiber_status_follows_simulator() {
        let (mut dev, handle) = sim_device();
        assert!(dev.is_controller_connected().expect("status"));
        handle.set_fibers(false, true);
        assert!(!dev.is_fiber_connected(Fiber::A).expect("status"));
        assert!(dev.is_fiber_connected(Fiber::B).expect("status"));
    }
}
