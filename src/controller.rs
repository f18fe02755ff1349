//! Controller setup and acquisition operations.
//!
//! [`Controller`] layers the camera-facing operations over a
//! [`PcieDevice`]: controller setup and firmware download, image geometry,
//! binning and sub-array readout, the shutter, single exposures with
//! progress callbacks, continuous readout and array temperature control.
//!
//! The exposure and continuous loops are synchronous polling loops, matching
//! the board's register interface. [`crate::acquisition`] adapts them to the
//! async world.

use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use tracing::{debug, info, warn};

use crate::device::PcieDevice;
use crate::error::{AppResult, CamError};
use crate::lod::{LodFile, LodTarget};
use crate::proto::{
    self, contains_error, is_smallcam_id, outside_range, word_name, ARC46, DON, ERR, IR8X, IRREV4,
    READ_TIMEOUT_POLLS, ROUT, TIM_ID, UTIL_ID, Y_MEM,
};
use crate::temp::{average_within_tolerance, TempParams};

/// Pixel-count poll interval during exposure and readout.
const EXPOSE_POLL_INTERVAL: Duration = Duration::from_millis(25);

/// Number of data-link test words sent per board during setup.
const TDL_SWEEP: u32 = 1234;

/// Progress callbacks for a single exposure.
///
/// `elapsed` fires during the exposure countdown, `pixels_read` during
/// image readout.
pub trait ExposeListener: Send {
    /// Called with the remaining exposure time in seconds.
    fn elapsed(&mut self, _seconds: f32) {}

    /// Called with the current readout pixel count.
    fn pixels_read(&mut self, _count: u32) {}
}

/// Per-frame callback for continuous readout.
pub trait FrameListener: Send {
    /// Called once for every completed frame.
    ///
    /// `buffer_index` is the frame's slot within the common buffer,
    /// `frame_number` the running frame count starting at 1, and `data` the
    /// frame pixels in readout order.
    fn frame(&mut self, buffer_index: u32, frame_number: u32, rows: u32, cols: u32, data: &[u16]);
}

/// Options for [`Controller::setup`].
#[derive(Debug, Clone, Default)]
pub struct SetupOptions {
    /// Reset the controller first.
    pub reset: bool,
    /// Run the data-link test sweep against each involved board.
    pub test_data_link: bool,
    /// Power the controller on.
    pub power_on: bool,
    /// Image row count to set on the controller.
    pub rows: u32,
    /// Image column count to set on the controller.
    pub cols: u32,
    /// Timing board firmware to load.
    pub timing_file: Option<std::path::PathBuf>,
    /// Utility board firmware to load.
    pub utility_file: Option<std::path::PathBuf>,
}

fn is_aborted(abort: Option<&AtomicBool>) -> bool {
    abort.is_some_and(|flag| flag.load(Ordering::Relaxed))
}

/// High-level handle to a camera controller.
pub struct Controller {
    dev: PcieDevice,
    temp: TempParams,
    cc_params: Option<u32>,
}

impl Controller {
    /// Wraps an open device.
    pub fn new(dev: PcieDevice) -> Self {
        Self {
            dev,
            temp: TempParams::default(),
            cc_params: None,
        }
    }

    /// The underlying device.
    pub fn device(&self) -> &PcieDevice {
        &self.dev
    }

    /// The underlying device, mutably.
    pub fn device_mut(&mut self) -> &mut PcieDevice {
        &mut self.dev
    }

    /// Consumes the controller, returning the device.
    pub fn into_device(self) -> PcieDevice {
        self.dev
    }

    /// The temperature calibration constants in use.
    pub fn temp_params(&self) -> &TempParams {
        &self.temp
    }

    //  Setup
    // +---------------------------------------------------------------+

    /// Performs a full controller setup: optional reset, optional data-link
    /// tests, firmware downloads, power-on and image dimensions.
    ///
    /// Returns quietly if `abort` is raised between stages.
    pub fn setup(&mut self, options: &SetupOptions, abort: Option<&AtomicBool>) -> AppResult<()> {
        if is_aborted(abort) {
            return Ok(());
        }

        self.dev.clear_status()?;

        if options.reset {
            info!("resetting controller");
            self.dev.reset_controller()?;
            self.cc_params = None;
        }

        if is_aborted(abort) {
            return Ok(());
        }

        if options.test_data_link {
            self.test_data_link(proto::PCI_ID, abort)?;

            if options.timing_file.is_some() {
                self.test_data_link(TIM_ID, abort)?;
            }
            if options.utility_file.is_some() {
                self.test_data_link(UTIL_ID, abort)?;
            }
        }

        if is_aborted(abort) {
            return Ok(());
        }

        if let Some(path) = &options.timing_file {
            self.load_firmware(path, true, abort)?;
        }

        if is_aborted(abort) {
            return Ok(());
        }

        if let Some(path) = &options.utility_file {
            self.load_firmware(path, true, abort)?;
        }

        if is_aborted(abort) {
            return Ok(());
        }

        if options.power_on {
            let reply = self.dev.command(&[TIM_ID, proto::PON])?;
            if reply != DON {
                return Err(CamError::command("Power on failed", reply));
            }
        }

        if is_aborted(abort) {
            return Ok(());
        }

        if options.rows == 0 || options.cols == 0 {
            return Err(CamError::Configuration(format!(
                "invalid image dimensions, rows: {} cols: {}",
                options.rows, options.cols
            )));
        }
        self.set_image_size(options.rows, options.cols)
    }

    /// Sweeps test words through a board's data link, verifying each echo.
    fn test_data_link(&mut self, board: u32, abort: Option<&AtomicBool>) -> AppResult<()> {
        debug!(board, "testing data link");

        for i in 0..TDL_SWEEP {
            if is_aborted(abort) {
                return Ok(());
            }

            let reply = self.dev.command(&[board, proto::TDL, i])?;
            if reply != i {
                return Err(CamError::CommandFailed {
                    context: format!("data link test {i}/{TDL_SWEEP} on board {board} failed"),
                    reply,
                });
            }
        }
        Ok(())
    }

    /// Loads a timing or utility firmware file onto the controller.
    ///
    /// The controller is stopped first; each word is written with `WRM` and,
    /// when `validate` is set, read back with `RDM` and compared. C-runtime
    /// timing files finish with a `JDL` to jump from boot code into the
    /// uploaded application.
    pub fn load_firmware(
        &mut self,
        path: &Path,
        validate: bool,
        abort: Option<&AtomicBool>,
    ) -> AppResult<()> {
        let lod = LodFile::load(path)?;
        info!(file = %path.display(), words = lod.word_count(), "loading firmware");
        self.load_firmware_parsed(&lod, validate, abort)
    }

    /// Downloads an already-parsed firmware file.
    pub fn load_firmware_parsed(
        &mut self,
        lod: &LodFile,
        validate: bool,
        abort: Option<&AtomicBool>,
    ) -> AppResult<()> {
        if is_aborted(abort) {
            return Ok(());
        }

        // Stop the controller first; downloading over executing code
        // crashes it.
        let reply = self.dev.command(&[TIM_ID, proto::STP])?;
        if reply != DON {
            return Err(CamError::command("Stop ('STP') controller failed", reply));
        }

        let board = lod.target.board_id();

        for block in &lod.blocks {
            let mut addr = block.addr;
            for &word in &block.data {
                if is_aborted(abort) {
                    return Ok(());
                }

                let tagged = block.mem.tag() | addr;
                let reply = self.dev.command(&[board, proto::WRM, tagged, word])?;
                if reply != DON {
                    return Err(CamError::CommandFailed {
                        context: format!(
                            "write ('WRM') {tagged:#X} {word:#X} to board {board} failed"
                        ),
                        reply,
                    });
                }

                if validate {
                    let read_back = self.dev.command(&[board, proto::RDM, tagged])?;
                    if read_back != word {
                        return Err(CamError::Firmware(format!(
                            "validation failed at {tagged:#X}: wrote {word:#X}, read {read_back:#X}"
                        )));
                    }
                }

                addr += 1;
            }
        }

        if is_aborted(abort) {
            return Ok(());
        }

        if lod.target == (LodTarget::Timing { c_runtime: true }) {
            let reply = self.dev.command(&[TIM_ID, proto::JDL])?;
            if reply != DON {
                return Err(CamError::command("Jump from boot code failed", reply));
            }
        }

        Ok(())
    }

    //  Image geometry
    // +---------------------------------------------------------------+

    /// Sets the image dimensions on the controller, re-mapping the common
    /// buffer when the new image no longer fits the current mapping.
    pub fn set_image_size(&mut self, rows: u32, cols: u32) -> AppResult<()> {
        let reply = self.dev.command(&[TIM_ID, proto::WRM, Y_MEM | 2, rows])?;
        if reply != DON {
            return Err(CamError::CommandFailed {
                context: format!("write image rows: {rows}"),
                reply,
            });
        }

        let reply = self.dev.command(&[TIM_ID, proto::WRM, Y_MEM | 1, cols])?;
        if reply != DON {
            return Err(CamError::CommandFailed {
                context: format!("write image cols: {cols}"),
                reply,
            });
        }

        let new_size = rows as u64 * cols as u64 * 2;
        if new_size > self.dev.buffer_size() {
            self.dev.remap_buffer(new_size as usize)?;
        }

        Ok(())
    }

    /// Reads the image row count back from the controller.
    pub fn image_rows(&mut self) -> AppResult<u32> {
        let reply = self.dev.command(&[TIM_ID, proto::RDM, Y_MEM | 2])?;
        if contains_error(reply) {
            return Err(CamError::command("Read image rows failed", reply));
        }
        Ok(reply)
    }

    /// Reads the image column count back from the controller.
    pub fn image_cols(&mut self) -> AppResult<u32> {
        let reply = self.dev.command(&[TIM_ID, proto::RDM, Y_MEM | 1])?;
        if contains_error(reply) {
            return Err(CamError::command("Read image cols failed", reply));
        }
        Ok(reply)
    }

    //  Controller configuration
    // +---------------------------------------------------------------+

    /// Reads the controller configuration word (feature bits).
    pub fn cc_params(&mut self) -> AppResult<u32> {
        let reply = self.dev.command(&[TIM_ID, proto::RCC])?;
        if contains_error(reply) {
            return Err(CamError::command(
                "Read controller configuration parameters failed",
                reply,
            ));
        }
        self.cc_params = Some(reply);
        Ok(reply)
    }

    /// Returns true when the controller supports the given configuration
    /// parameter (a bit pattern from [`crate::proto`]).
    pub fn is_cc_param_supported(&mut self, parameter: u32) -> AppResult<bool> {
        let word = match self.cc_params {
            Some(word) => word,
            None => self.cc_params()?,
        };

        // Each comparison masks out one bit field of the configuration word
        const FIELDS: [u32; 12] = [
            0x0000_0007, // video processor
            0x0000_0018, // timing board
            0x0000_0060, // utility board
            0x0000_0080, // shutter
            0x0000_0300, // temperature readout
            0x0000_0400, // sub-array
            0x0000_0800, // binning
            0x0000_3000, // split readouts
            0x0000_4000, // MPP
            0x0001_8000, // clock driver board
            0x000E_0000, // site variants
            0x00F0_0000, // continuous readout / speeds
        ];

        Ok(FIELDS.iter().any(|&mask| (word & mask) == parameter))
    }

    /// Returns true for CCD video processors, false for infrared.
    pub fn is_ccd(&mut self) -> AppResult<bool> {
        let ir_rev4 = self.is_cc_param_supported(IRREV4)?;
        let arc46 = self.is_cc_param_supported(ARC46)?;
        let ir_8x = self.is_cc_param_supported(IR8X)?;
        Ok(!(ir_rev4 || arc46 || ir_8x))
    }

    //  Binning
    // +---------------------------------------------------------------+

    /// Returns true when a binning factor other than 1 is set.
    pub fn is_binning_set(&mut self) -> AppResult<bool> {
        let col_factor = self.dev.command(&[TIM_ID, proto::RDM, Y_MEM | 0x5])?;
        if col_factor == 1 {
            let row_factor = self.dev.command(&[TIM_ID, proto::RDM, Y_MEM | 0x6])?;
            if row_factor == 1 {
                return Ok(false);
            }
        }
        Ok(true)
    }

    /// Sets the binning factors and the binned image size.
    ///
    /// Returns the binned `(rows, cols)`. For example 1000 x 1000 with
    /// factors 2 x 4 bins down to 500 x 250.
    pub fn set_binning(
        &mut self,
        rows: u32,
        cols: u32,
        row_factor: u32,
        col_factor: u32,
    ) -> AppResult<(u32, u32)> {
        if row_factor == 0 || col_factor == 0 {
            return Err(CamError::Configuration(
                "binning factors must be greater than zero".into(),
            ));
        }

        let reply = self
            .dev
            .command(&[TIM_ID, proto::WRM, Y_MEM | 0x5, col_factor])?;
        if reply != DON {
            return Err(CamError::CommandFailed {
                context: format!("failed to set binning column factor ( {col_factor} )"),
                reply,
            });
        }

        let reply = self
            .dev
            .command(&[TIM_ID, proto::WRM, Y_MEM | 0x6, row_factor])?;
        if reply != DON {
            return Err(CamError::CommandFailed {
                context: format!("failed to set binning row factor ( {row_factor} )"),
                reply,
            });
        }

        let binned_rows = rows / row_factor;
        let binned_cols = cols / col_factor;
        self.set_image_size(binned_rows, binned_cols)?;

        Ok((binned_rows, binned_cols))
    }

    /// Clears the binning factors and restores the image size.
    pub fn unset_binning(&mut self, rows: u32, cols: u32) -> AppResult<()> {
        let reply = self.dev.command(&[TIM_ID, proto::WRM, Y_MEM | 0x5, 1])?;
        if reply != DON {
            return Err(CamError::command(
                "failed to set binning column factor ( 1 )",
                reply,
            ));
        }

        let reply = self.dev.command(&[TIM_ID, proto::WRM, Y_MEM | 0x6, 1])?;
        if reply != DON {
            return Err(CamError::command(
                "failed to set binning row factor ( 1 )",
                reply,
            ));
        }

        self.set_image_size(rows, cols)
    }

    //  Sub-array readout
    // +---------------------------------------------------------------+

    /// Puts the controller into sub-array mode, reading a box centered at
    /// (`center_row`, `center_col`) plus a bias strip.
    ///
    /// Returns the image dimensions that were previously set, for restoring
    /// with [`Controller::unset_sub_array`].
    #[allow(clippy::too_many_arguments)]
    pub fn set_sub_array(
        &mut self,
        center_row: u32,
        center_col: u32,
        sub_rows: u32,
        sub_cols: u32,
        bias_offset: u32,
        bias_cols: u32,
    ) -> AppResult<(u32, u32)> {
        if center_row < sub_rows / 2 || center_col < sub_cols / 2 {
            return Err(CamError::Configuration(format!(
                "sub-array box centered at ({center_row}, {center_col}) extends past the array origin"
            )));
        }
        if bias_offset < center_col + sub_cols / 2 {
            return Err(CamError::Configuration(
                "bias region overlaps the sub-array box".into(),
            ));
        }

        let old_rows = self.image_rows()?;
        let old_cols = self.image_cols()?;

        self.set_image_size(sub_rows, sub_cols + bias_cols)?;

        let reply = self
            .dev
            .command(&[TIM_ID, proto::SSS, bias_cols, sub_cols, sub_rows])?;
        if reply != DON {
            return Err(CamError::command(
                "failed to set sub-array size on controller",
                reply,
            ));
        }

        let reply = self.dev.command(&[
            TIM_ID,
            proto::SSP,
            center_row - sub_rows / 2,
            center_col - sub_cols / 2,
            bias_offset - center_col - sub_cols / 2,
        ])?;
        if reply != DON {
            return Err(CamError::command(
                "failed to set sub-array position on controller",
                reply,
            ));
        }

        Ok((old_rows, old_cols))
    }

    /// Leaves sub-array mode and restores the full image size.
    pub fn unset_sub_array(&mut self, rows: u32, cols: u32) -> AppResult<()> {
        self.set_image_size(rows, cols)?;

        let reply = self.dev.command(&[TIM_ID, proto::SSS, 0, 0, 0])?;
        if reply != DON {
            return Err(CamError::command(
                "failed to set sub-array size on controller",
                reply,
            ));
        }
        Ok(())
    }

    //  Synthetic image mode & shutter
    // +---------------------------------------------------------------+

    /// Returns true when the timing board generates synthetic images
    /// (a 0, 1, 2, ... 65535 ramp) instead of reading the video board.
    pub fn is_synthetic_image_mode(&mut self) -> AppResult<bool> {
        let status = self.dev.command(&[TIM_ID, proto::RDM, proto::X_MEM])?;
        if contains_error(status) {
            return Err(CamError::command("Failed to read controller status", status));
        }
        Ok(status & proto::SYNTHETIC_IMG_BIT != 0)
    }

    /// Enables or disables synthetic image mode.
    pub fn set_synthetic_image_mode(&mut self, enable: bool) -> AppResult<()> {
        let status = self.dev.command(&[TIM_ID, proto::RDM, proto::X_MEM])?;
        if contains_error(status) {
            return Err(CamError::command("Failed to read controller status", status));
        }

        let value = if enable {
            status | proto::SYNTHETIC_IMG_BIT
        } else {
            status & !proto::SYNTHETIC_IMG_BIT
        };

        let reply = self
            .dev
            .command(&[TIM_ID, proto::WRM, proto::X_MEM, value])?;
        if reply != DON {
            return Err(CamError::command(
                if enable {
                    "Controller not set to synthetic image mode"
                } else {
                    "Controller not set to normal image mode"
                },
                reply,
            ));
        }
        Ok(())
    }

    /// Selects whether the shutter opens when an exposure starts.
    pub fn set_open_shutter(&mut self, open: bool) -> AppResult<()> {
        let status = self.dev.command(&[TIM_ID, proto::RDM, proto::X_MEM])?;

        let value = if open {
            status | proto::OPEN_SHUTTER_POSITION
        } else {
            status & proto::CLOSED_SHUTTER_POSITION
        };

        let reply = self
            .dev
            .command(&[TIM_ID, proto::WRM, proto::X_MEM, value])?;
        if reply != DON {
            return Err(CamError::command("Shutter position failed to be set", reply));
        }
        Ok(())
    }

    //  Exposure
    // +---------------------------------------------------------------+

    /// Runs a single exposure and readout, blocking until all pixels have
    /// been transferred into the common buffer.
    ///
    /// `abort` is polled throughout; raising it stops the exposure and
    /// returns [`CamError::Aborted`]. Readout is declared stalled after
    /// [`READ_TIMEOUT_POLLS`] polls without pixel progress.
    pub fn expose(
        &mut self,
        exp_time_secs: f32,
        rows: u32,
        cols: u32,
        open_shutter: bool,
        abort: Option<&AtomicBool>,
        mut listener: Option<&mut dyn ExposeListener>,
    ) -> AppResult<()> {
        let total_pixels = rows * cols;

        if u64::from(rows) * u64::from(cols) * 2 > self.dev.buffer_size() {
            return Err(CamError::ImageExceedsBuffer {
                rows,
                cols,
                buffer_size: self.dev.buffer_size(),
            });
        }

        self.set_open_shutter(open_shutter)?;

        let exp_ms = (exp_time_secs * 1000.0) as u32;
        let reply = self.dev.command(&[TIM_ID, proto::SET, exp_ms])?;
        if reply != DON {
            return Err(CamError::command("Set exposure time failed", reply));
        }

        let reply = self.dev.command(&[TIM_ID, proto::SEX])?;
        if reply != DON {
            return Err(CamError::command("Start exposure command failed", reply));
        }

        let mut elapsed = exp_time_secs;
        let mut pixel_count = 0u32;
        let mut timeout_counter = 0u32;
        let mut expose_counter = 0u32;

        while pixel_count < total_pixels {
            let in_readout = self.dev.is_readout()?;

            // Read the elapsed exposure time. Elapsed > 1 s and a few loop
            // iterations guard against racing the board into readout.
            if !in_readout && elapsed > 1.1 && expose_counter >= 5 && exp_time_secs > 1.0 {
                if let Ok(reply) = self.dev.command(&[TIM_ID, proto::RET]) {
                    if reply != ROUT
                        && !contains_error(reply)
                        && !outside_range(reply, 0, exp_ms)
                    {
                        expose_counter = 0;
                        elapsed = exp_time_secs - (reply as f32 / 1000.0);

                        if let Some(l) = listener.as_deref_mut() {
                            l.elapsed(elapsed);
                        }
                    }
                }
            }

            expose_counter += 1;

            if is_aborted(abort) {
                self.dev.stop_exposure()?;
                return Err(CamError::Aborted);
            }

            let last_pixel_count = pixel_count;
            pixel_count = self.dev.pixel_count()?;

            if contains_error(pixel_count) {
                self.dev.stop_exposure()?;
                return Err(CamError::command("Failed to read pixel count", pixel_count));
            }

            if is_aborted(abort) {
                self.dev.stop_exposure()?;
                return Err(CamError::Aborted);
            }

            if in_readout {
                if let Some(l) = listener.as_deref_mut() {
                    l.pixels_read(pixel_count);
                }
            }

            // Only count stalls while actually reading out; clearing large
            // or slow arrays takes time without pixel progress.
            if in_readout && pixel_count == last_pixel_count {
                timeout_counter += 1;
            } else {
                timeout_counter = 0;
            }

            if timeout_counter >= READ_TIMEOUT_POLLS {
                self.dev.stop_exposure()?;
                return Err(CamError::ReadTimeout);
            }

            std::thread::sleep(EXPOSE_POLL_INTERVAL);
        }

        Ok(())
    }

    /// Runs continuous readout of `num_frames` frames, invoking `listener`
    /// for each completed frame.
    ///
    /// The controller is restored to single-image mode afterwards, also on
    /// error and abort.
    #[allow(clippy::too_many_arguments)]
    pub fn continuous(
        &mut self,
        rows: u32,
        cols: u32,
        num_frames: u32,
        exp_time_secs: f32,
        open_shutter: bool,
        abort: Option<&AtomicBool>,
        listener: Option<&mut dyn FrameListener>,
    ) -> AppResult<()> {
        if rows == 0 || cols == 0 {
            return Err(CamError::Configuration(format!(
                "invalid image dimensions, rows: {rows} cols: {cols}"
            )));
        }

        let image_size = rows * cols * 2;
        let bounded_size = self.dev.continuous_image_size(image_size);

        if u64::from(image_size) > self.dev.buffer_size() {
            return Err(CamError::ImageExceedsBuffer {
                rows,
                cols,
                buffer_size: self.dev.buffer_size(),
            });
        }

        if num_frames == 0 {
            return Err(CamError::Configuration("number of frames must be > 0".into()));
        }

        if is_aborted(abort) {
            return Err(CamError::Aborted);
        }

        let frames_per_buffer = (self.dev.buffer_size() / u64::from(bounded_size)) as u32;

        let result = self.continuous_inner(
            rows,
            cols,
            num_frames,
            exp_time_secs,
            open_shutter,
            frames_per_buffer,
            bounded_size,
            abort,
            listener,
        );

        if result.is_err() {
            // Best effort: put the controller back into single-image mode
            if let Err(stop_err) = self.stop_continuous() {
                warn!("failed to stop continuous readout: {stop_err}");
            }
        }

        result
    }

    #[allow(clippy::too_many_arguments)]
    fn continuous_inner(
        &mut self,
        rows: u32,
        cols: u32,
        num_frames: u32,
        exp_time_secs: f32,
        open_shutter: bool,
        frames_per_buffer: u32,
        bounded_size: u32,
        abort: Option<&AtomicBool>,
        mut listener: Option<&mut dyn FrameListener>,
    ) -> AppResult<()> {
        let reply = self
            .dev
            .command(&[TIM_ID, proto::FPB, frames_per_buffer])?;
        if reply != DON {
            return Err(CamError::command(
                "Failed to set the frames per buffer (FPB)",
                reply,
            ));
        }

        if is_aborted(abort) {
            return Err(CamError::Aborted);
        }

        let reply = self.dev.command(&[TIM_ID, proto::SNF, num_frames])?;
        if reply != DON {
            return Err(CamError::command(
                "Failed to set the number of frames (SNF)",
                reply,
            ));
        }

        if is_aborted(abort) {
            return Err(CamError::Aborted);
        }

        self.set_open_shutter(open_shutter)?;

        let exp_ms = (exp_time_secs * 1000.0) as u32;
        let reply = self.dev.command(&[TIM_ID, proto::SET, exp_ms])?;
        if reply != DON {
            return Err(CamError::command("Set exposure time failed", reply));
        }

        let reply = self.dev.command(&[TIM_ID, proto::SEX])?;
        if reply != DON {
            return Err(CamError::command("Start exposure command failed", reply));
        }

        let mut frame_count = 0u32;
        let mut last_frame_count = 0u32;
        let mut fpb_index = 0u32;

        while frame_count < num_frames {
            if is_aborted(abort) {
                return Err(CamError::Aborted);
            }

            frame_count = self.dev.frame_count()?;

            if fpb_index >= frames_per_buffer {
                fpb_index = 0;
            }

            if frame_count > last_frame_count {
                if let Some(l) = listener.as_deref_mut() {
                    let pixel_offset = (fpb_index * bounded_size / 2) as usize;
                    let data = self.dev.pixels(pixel_offset, rows as usize * cols as usize)?;
                    l.frame(fpb_index, frame_count, rows, cols, &data);
                }

                last_frame_count = frame_count;
                fpb_index += 1;
            }
        }

        // Back to single-image mode
        let reply = self.dev.command(&[TIM_ID, proto::SNF, 1])?;
        if reply != DON {
            return Err(CamError::command(
                "Failed to set number of frames (SNF) to 1",
                reply,
            ));
        }

        Ok(())
    }

    /// Aborts continuous readout and restores single-image mode.
    pub fn stop_continuous(&mut self) -> AppResult<()> {
        self.dev.stop_exposure()?;

        let reply = self.dev.command(&[TIM_ID, proto::SNF, 1])?;
        if reply != DON {
            return Err(CamError::command(
                "Failed to set number of frames (SNF) to 1",
                reply,
            ));
        }
        Ok(())
    }

    //  Temperature control
    // +---------------------------------------------------------------+

    /// Reads the average array temperature in Celsius.
    ///
    /// The sensor is read multiple times and only reads within the
    /// configured tolerance of the mean are averaged. SmallCam systems take
    /// a single read.
    pub fn array_temperature(&mut self) -> AppResult<f64> {
        if self.dev.is_readout()? {
            return Err(CamError::Temperature(
                "readout in progress, skipping temperature read".into(),
            ));
        }

        let smallcam = is_smallcam_id(self.dev.controller_id()?);
        let has_rdt = self.dev.command(&[UTIL_ID, proto::RDT])? != ERR;
        let high_gain = self.dev.command(&[UTIL_ID, proto::THG])? == 1;

        let mut samples = Vec::with_capacity(self.temp.sd_number_of_reads as usize);

        for _ in 0..self.temp.sd_number_of_reads {
            if self.dev.is_readout()? {
                break;
            }

            let adu = if smallcam {
                self.dev.command(&[TIM_ID, proto::RDT])?
            } else if has_rdt {
                self.dev.command(&[UTIL_ID, proto::RDT])?
            } else {
                self.dev.command(&[UTIL_ID, proto::RDM, Y_MEM | 0xC])?
            };

            if contains_error(adu) {
                return Err(CamError::Temperature(format!(
                    "failed to read temperature from controller, reply: {}",
                    word_name(adu)
                )));
            }

            // Boards implementing RDT report a DT-670 style linear scale
            let linear = smallcam || has_rdt;
            let voltage = self.temp.adu_to_voltage(adu, linear, high_gain);
            samples.push(self.temp.temperature_from_voltage(voltage)?);

            if smallcam {
                break;
            }
        }

        if smallcam {
            return Ok(samples.first().copied().unwrap_or(0.0));
        }

        Ok(average_within_tolerance(&samples, self.temp.sd_deg_tolerance))
    }

    /// Reads the raw digital number behind the array temperature.
    pub fn array_temperature_dn(&mut self) -> AppResult<f64> {
        if self.dev.is_readout()? {
            return Err(CamError::Temperature(
                "readout in progress, skipping temperature read".into(),
            ));
        }

        let dn = if is_smallcam_id(self.dev.controller_id()?) {
            self.dev.command(&[TIM_ID, proto::RDC])?
        } else {
            self.dev.command(&[UTIL_ID, proto::RDM, Y_MEM | 0xC])?
        };

        Ok(f64::from(dn))
    }

    /// Sets the temperature the array is regulated around, in Celsius.
    pub fn set_array_temperature(&mut self, celsius: f64) -> AppResult<()> {
        if self.dev.is_readout()? {
            return Err(CamError::Temperature("readout in progress".into()));
        }

        let smallcam = is_smallcam_id(self.dev.controller_id()?);
        let high_gain = self.dev.command(&[UTIL_ID, proto::THG])? == 1;

        let voltage = self.temp.voltage_from_temperature(celsius)?;
        let adu = self.temp.voltage_to_adu(voltage, smallcam, high_gain) as u32;

        let reply = if smallcam {
            self.dev.command(&[TIM_ID, proto::CDT, adu])?
        } else {
            self.dev.command(&[UTIL_ID, proto::WRM, Y_MEM | 0x1C, adu])?
        };

        if reply != DON {
            return Err(CamError::command("Failed to set array temperature", reply));
        }
        Ok(())
    }

    /// Loads temperature calibration overrides from a constants file.
    pub fn load_temperature_data(&mut self, path: &Path) -> AppResult<()> {
        self.temp.load_from(path)
    }

    /// Saves the current temperature calibration to a constants file.
    pub fn save_temperature_data(&self, path: &Path) -> AppResult<()> {
        self.temp.save_to(path)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::device::sim::{SimHandle, SimTransport};
    use crate::proto::{BINNING, SUBARRAY};

    fn sim_controller() -> (Controller, SimHandle) {
        let sim = SimTransport::new();
        let handle = sim.handle();
        let dev = PcieDevice::with_transport(Box::new(sim));
        (Controller::new(dev), handle)
    }

    #[test]
    fn set_image_size_writes_geometry_and_maps_buffer() {
        let (mut ctrl, handle) = sim_controller();
        ctrl.set_image_size(32, 16).expect("size");

        assert_eq!(handle.memory(TIM_ID, Y_MEM | 2), Some(32));
        assert_eq!(handle.memory(TIM_ID, Y_MEM | 1), Some(16));
        assert_eq!(ctrl.device().buffer_size(), 32 * 16 * 2);

        assert_eq!(ctrl.image_rows().expect("rows"), 32);
        assert_eq!(ctrl.image_cols().expect("cols"), 16);
    }

    #[test]
    fn growing_image_remaps_buffer() {
        let (mut ctrl, _) = sim_controller();
        ctrl.set_image_size(16, 16).expect("size");
        assert_eq!(ctrl.device().buffer_size(), 512);

        ctrl.set_image_size(64, 64).expect("size");
        assert_eq!(ctrl.device().buffer_size(), 8192);

        // Shrinking keeps the larger mapping
        ctrl.set_image_size(8, 8).expect("size");
        assert_eq!(ctrl.device().buffer_size(), 8192);
    }

    #[test]
    fn cc_param_feature_queries() {
        let (mut ctrl, _) = sim_controller();
        assert!(ctrl.is_cc_param_supported(SUBARRAY).expect("query"));
        assert!(ctrl.is_cc_param_supported(BINNING).expect("query"));
        assert!(ctrl.is_ccd().expect("query"));

        let (mut ir, handle) = sim_controller();
        handle.set_cc_params(IRREV4 | proto::TIMREV5);
        assert!(!ir.is_ccd().expect("query"));
    }

    #[test]
    fn binning_round_trip() {
        let (mut ctrl, handle) = sim_controller();

        let (rows, cols) = ctrl.set_binning(1000, 1000, 2, 4).expect("binning");
        assert_eq!((rows, cols), (500, 250));
        assert_eq!(handle.memory(TIM_ID, Y_MEM | 0x5), Some(4));
        assert_eq!(handle.memory(TIM_ID, Y_MEM | 0x6), Some(2));
        assert!(ctrl.is_binning_set().expect("query"));

        ctrl.unset_binning(1000, 1000).expect("unset");
        assert_eq!(handle.memory(TIM_ID, Y_MEM | 0x5), Some(1));
        assert!(!ctrl.is_binning_set().expect("query"));
        assert_eq!(ctrl.image_rows().expect("rows"), 1000);
    }

    #[test]
    fn sub_array_command_sequence() {
        let (mut ctrl, handle) = sim_controller();
        ctrl.set_image_size(1024, 1024).expect("size");
        handle.clear_history();

        let (old_rows, old_cols) = ctrl
            .set_sub_array(512, 512, 100, 100, 600, 50)
            .expect("sub-array");
        assert_eq!((old_rows, old_cols), (1024, 1024));

        let history = handle.command_history();
        let sss = history
            .iter()
            .find(|c| c[1] == proto::SSS)
            .expect("SSS sent");
        assert_eq!(&sss[2..], &[50, 100, 100]);

        let ssp = history
            .iter()
            .find(|c| c[1] == proto::SSP)
            .expect("SSP sent");
        assert_eq!(&ssp[2..], &[512 - 50, 512 - 50, 600 - 512 - 50]);

        // Image is now box + bias strip
        assert_eq!(ctrl.image_rows().expect("rows"), 100);
        assert_eq!(ctrl.image_cols().expect("cols"), 150);

        ctrl.unset_sub_array(1024, 1024).expect("unset");
        assert_eq!(ctrl.image_rows().expect("rows"), 1024);
    }

    #[test]
    fn sub_array_validates_geometry() {
        let (mut ctrl, _) = sim_controller();
        ctrl.set_image_size(1024, 1024).expect("size");

        assert!(ctrl.set_sub_array(10, 512, 100, 100, 600, 50).is_err());
        assert!(ctrl.set_sub_array(512, 512, 100, 100, 100, 50).is_err());
    }

    #[test]
    fn synthetic_image_mode_toggles_status_bit() {
        let (mut ctrl, handle) = sim_controller();
        handle.set_memory(TIM_ID, proto::X_MEM, 0);

        assert!(!ctrl.is_synthetic_image_mode().expect("query"));
        ctrl.set_synthetic_image_mode(true).expect("set");
        assert!(ctrl.is_synthetic_image_mode().expect("query"));
        ctrl.set_synthetic_image_mode(false).expect("clear");
        assert!(!ctrl.is_synthetic_image_mode().expect("query"));
    }

    #[test]
    fn shutter_bit_follows_selection() {
        let (mut ctrl, handle) = sim_controller();
        handle.set_memory(TIM_ID, proto::X_MEM, 0);

        ctrl.set_open_shutter(true).expect("open");
        assert_eq!(
            handle.memory(TIM_ID, proto::X_MEM).unwrap_or(0) & proto::OPEN_SHUTTER_POSITION,
            proto::OPEN_SHUTTER_POSITION
        );

        ctrl.set_open_shutter(false).expect("close");
        assert_eq!(
            handle.memory(TIM_ID, proto::X_MEM).unwrap_or(0) & proto::OPEN_SHUTTER_POSITION,
            0
        );
    }

    #[test]
    fn expose_rejects_oversized_image() {
        let (mut ctrl, _) = sim_controller();
        ctrl.device_mut().map_buffer(128).expect("map");

        let err = ctrl.expose(0.1, 64, 64, false, None, None).unwrap_err();
        assert!(matches!(err, CamError::ImageExceedsBuffer { .. }));
    }

    #[test]
    fn temperature_read_uses_calibration() {
        let (mut ctrl, handle) = sim_controller();
        handle.set_temperature_adu(3000);

        let celsius = ctrl.array_temperature().expect("temperature");

        // With RDT implemented the board reports a linear DT-670 scale
        let params = TempParams::default();
        let voltage = params.adu_to_voltage(3000, true, false);
        let expected = params.temperature_from_voltage(voltage).expect("curve");
        assert!((celsius - expected).abs() < 1e-6, "got {celsius}");
    }

    #[test]
    fn temperature_read_falls_back_to_memory_read() {
        let (mut ctrl, handle) = sim_controller();
        handle.set_rdt_supported(false);
        handle.set_temperature_adu(3000);

        let celsius = ctrl.array_temperature().expect("temperature");

        let params = TempParams::default();
        let voltage = params.adu_to_voltage(3000, false, false);
        let expected = params.temperature_from_voltage(voltage).expect("curve");
        assert!((celsius - expected).abs() < 1e-6, "got {celsius}");
    }

    #[test]
    fn set_array_temperature_writes_target_dn() {
        let (mut ctrl, handle) = sim_controller();
        ctrl.set_array_temperature(-100.0).expect("set");

        let dn = handle
            .memory(UTIL_ID, Y_MEM | 0x1C)
            .expect("target written");

        let params = TempParams::default();
        let voltage = params.voltage_from_temperature(-100.0).expect("voltage");
        let expected = params.voltage_to_adu(voltage, false, false) as u32;
        assert_eq!(dn, expected);
    }

    #[test]
    fn smallcam_temperature_paths() {
        let (mut ctrl, handle) = sim_controller();
        let sc_id = (u32::from(b'S') << 16) | (u32::from(b'C') << 8) | u32::from(b'0');
        handle.set_controller_id(Some(sc_id));
        handle.set_temperature_adu(20000);

        let celsius = ctrl.array_temperature().expect("temperature");
        let params = TempParams::default();
        let voltage = params.adu_to_voltage(20000, true, false);
        let expected = params.temperature_from_voltage(voltage).expect("curve");
        assert!((celsius - expected).abs() < 1e-6);

        ctrl.set_array_temperature(-100.0).expect("set");
        assert!(handle.memory(TIM_ID, Y_MEM | 0x1C).is_some());
    }

    #[test]
    fn temperature_file_round_trip_through_controller() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("tempctrl.txt");

        let (mut ctrl, _) = sim_controller();
        ctrl.save_temperature_data(&path).expect("save");
        ctrl.load_temperature_data(&path).expect("load");
        assert_eq!(ctrl.temp_params(), &TempParams::default());
    }
}
