//! Readout deinterlacing.
//!
//! Multi-amplifier readout delivers pixels in amplifier order, not raster
//! order: split-serial readout interleaves the left and right halves of each
//! row, quad readout interleaves all four quadrants, and so on. The
//! algorithms here rearrange a raw frame into raster order in place.
//!
//! The readout patterns:
//!
//! ```text
//!  split-parallel       split-serial          quad CCD             quad IR
//!  ---------------     ---------------     ---------------     ---------------
//! |    1  ------->|   |       |       |   |<-----  ----->|   | ----->  ----->|
//! |               |   |       |       |   |   3   |   2  |   |   0   |   1   |
//! |_______________|   |       |       |   |_______|______|   |_______|_______|
//! |               |   |   0   |   1   |   |   0   |   1  |   |   3   |   2   |
//! |<--------  0   |   |<----- | ----->|   |<-----  ----->|   | ----->  ----->|
//!  ---------------     ---------------     ---------------     ---------------
//! ```
//!
//! `QuadIrCds` handles correlated-double-sampling frames: two quad-IR
//! images stacked vertically, deinterlaced independently. `HawaiiRg`
//! handles N adjacent same-direction channels per row, `Sta1600` the
//! sixteen-channel top/bottom split of an STA1600 device.

use crate::error::{AppResult, CamError};

/// Deinterlace algorithm selector.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Algorithm {
    /// Single-amplifier readout, nothing to do.
    None,
    /// Split-parallel readout (two amplifiers, top/bottom).
    Parallel,
    /// Split-serial readout (two amplifiers, left/right).
    Serial,
    /// Four-amplifier CCD readout.
    QuadCcd,
    /// Four-amplifier IR readout.
    QuadIr,
    /// Correlated-double-sampling quad IR readout (two stacked images).
    QuadIrCds,
    /// Hawaii RG channel-interleaved readout.
    HawaiiRg {
        /// Number of readout channels (must be even, or 1 for none).
        channels: u32,
    },
    /// STA1600 sixteen-channel readout.
    Sta1600,
}

impl Algorithm {
    /// Parses an algorithm name as used by configuration and the CLI.
    pub fn from_name(name: &str, channels: u32) -> Option<Self> {
        match name.to_lowercase().as_str() {
            "none" => Some(Algorithm::None),
            "parallel" => Some(Algorithm::Parallel),
            "serial" => Some(Algorithm::Serial),
            "quad_ccd" | "quadccd" => Some(Algorithm::QuadCcd),
            "quad_ir" | "quadir" => Some(Algorithm::QuadIr),
            "quad_ir_cds" | "quadircds" => Some(Algorithm::QuadIrCds),
            "hawaii_rg" | "hawaiirg" => Some(Algorithm::HawaiiRg { channels }),
            "sta1600" => Some(Algorithm::Sta1600),
            _ => None,
        }
    }
}

/// In-place deinterlacer with a reusable scratch buffer.
///
/// The scratch buffer grows to the largest frame seen and is reused across
/// calls, so repeated deinterlacing of a frame stream allocates once.
#[derive(Debug, Default)]
pub struct Deinterlacer<T: Copy + Default> {
    scratch: Vec<T>,
}

impl<T: Copy + Default> Deinterlacer<T> {
    /// Creates a deinterlacer with an empty scratch buffer.
    pub fn new() -> Self {
        Self {
            scratch: Vec::new(),
        }
    }

    /// Deinterlaces `buf` (a `rows` x `cols` frame) in place.
    pub fn run(
        &mut self,
        buf: &mut [T],
        cols: u32,
        rows: u32,
        algorithm: Algorithm,
    ) -> AppResult<()> {
        let pixels = cols as usize * rows as usize;
        if buf.len() < pixels {
            return Err(CamError::Deinterlace(format!(
                "buffer holds {} pixels, frame needs {pixels}",
                buf.len()
            )));
        }

        if self.scratch.len() < pixels {
            self.scratch.resize(pixels, T::default());
        }

        match algorithm {
            Algorithm::None => {}
            Algorithm::Parallel => self.parallel(buf, cols, rows)?,
            Algorithm::Serial => self.serial(buf, cols, rows)?,
            Algorithm::QuadCcd => self.quad_ccd(buf, cols, rows)?,
            Algorithm::QuadIr => self.quad_ir(buf, cols, rows)?,
            Algorithm::QuadIrCds => self.quad_ir_cds(buf, cols, rows)?,
            Algorithm::HawaiiRg { channels } => self.hawaii_rg(buf, cols, rows, channels)?,
            Algorithm::Sta1600 => self.sta1600(buf, cols, rows)?,
        }

        Ok(())
    }

    fn parallel(&mut self, buf: &mut [T], cols: u32, rows: u32) -> AppResult<()> {
        if rows % 2 != 0 {
            return Err(CamError::Deinterlace(
                "number of rows must be even for parallel deinterlace".into(),
            ));
        }

        let cols = cols as usize;
        let rows = rows as usize;
        let pixels = cols * rows;

        for i in 0..pixels / 2 {
            self.scratch[i] = buf[2 * i];
            self.scratch[pixels - i - 1] = buf[2 * i + 1];
        }

        buf[..pixels].copy_from_slice(&self.scratch[..pixels]);
        Ok(())
    }

    fn serial(&mut self, buf: &mut [T], cols: u32, rows: u32) -> AppResult<()> {
        if cols % 2 != 0 {
            return Err(CamError::Deinterlace(
                "number of cols must be even for serial deinterlace".into(),
            ));
        }

        let cols = cols as usize;
        let rows = rows as usize;

        for row in 0..rows {
            let mut p1 = row * cols;
            let mut p2 = row * cols + 1;
            let mut begin = row * cols;
            let mut end = row * cols + cols - 1;

            for _ in (0..cols).step_by(2) {
                self.scratch[begin] = buf[p1];
                self.scratch[end] = buf[p2];

                begin += 1;
                end -= 1;
                p1 += 2;
                p2 += 2;
            }
        }

        let pixels = cols * rows;
        buf[..pixels].copy_from_slice(&self.scratch[..pixels]);
        Ok(())
    }

    fn quad_ccd(&mut self, buf: &mut [T], cols: u32, rows: u32) -> AppResult<()> {
        if cols % 2 != 0 || rows % 2 != 0 {
            return Err(CamError::Deinterlace(
                "number of cols and rows must be even for quad CCD deinterlace".into(),
            ));
        }

        let cols = cols as usize;
        let rows = rows as usize;
        let pixels = cols * rows;

        let mut i = 0usize;
        let mut j = 0usize;
        let mut counter = 0usize;
        let mut begin = 0usize;
        let mut end = 0usize;

        while i < pixels {
            if counter % (cols / 2) == 0 {
                end = pixels - (cols * j) - 1;
                begin = cols * j;
                j += 1;
                counter = 0;
            }

            self.scratch[begin + counter] = buf[i]; // front row, left amp
            self.scratch[begin + cols - 1 - counter] = buf[i + 1]; // front row, right amp
            self.scratch[end - counter] = buf[i + 2]; // back row, right amp
            self.scratch[end - cols + 1 + counter] = buf[i + 3]; // back row, left amp
            i += 4;

            counter += 1;
        }

        buf[..pixels].copy_from_slice(&self.scratch[..pixels]);
        Ok(())
    }

    fn quad_ir(&mut self, buf: &mut [T], cols: u32, rows: u32) -> AppResult<()> {
        if cols % 2 != 0 || rows % 2 != 0 {
            return Err(CamError::Deinterlace(
                "number of cols and rows must be even for quad IR deinterlace".into(),
            ));
        }

        let cols_u = cols as usize;
        let rows_u = rows as usize;
        let pixels = cols_u * rows_u;

        quad_ir_section(&mut self.scratch[..pixels], buf, cols_u, rows_u);

        buf[..pixels].copy_from_slice(&self.scratch[..pixels]);
        Ok(())
    }

    fn quad_ir_cds(&mut self, buf: &mut [T], cols: u32, rows: u32) -> AppResult<()> {
        if cols % 2 != 0 || rows % 2 != 0 {
            return Err(CamError::Deinterlace(
                "number of cols and rows must be even for quad IR CDS deinterlace".into(),
            ));
        }

        let cols_u = cols as usize;
        let half_rows = rows as usize / 2;
        let half_pixels = cols_u * half_rows;

        // The sample and reference halves deinterlace independently
        for section in 0..2 {
            let offset = section * half_pixels;
            quad_ir_section(
                &mut self.scratch[offset..offset + half_pixels],
                &buf[offset..offset + half_pixels],
                cols_u,
                half_rows,
            );
        }

        buf[..2 * half_pixels].copy_from_slice(&self.scratch[..2 * half_pixels]);
        Ok(())
    }

    fn hawaii_rg(&mut self, buf: &mut [T], cols: u32, rows: u32, channels: u32) -> AppResult<()> {
        if cols % 2 != 0 {
            return Err(CamError::Deinterlace(
                "number of cols must be even for Hawaii RG deinterlace".into(),
            ));
        }
        if channels == 1 {
            // Single-channel data arrives in raster order already
            return Ok(());
        }
        if channels == 0 {
            return Err(CamError::Deinterlace(
                "the number of readout channels must be supplied for Hawaii RG deinterlace".into(),
            ));
        }
        if channels % 2 != 0 {
            return Err(CamError::Deinterlace(
                "the readout channel count must be even for Hawaii RG deinterlace".into(),
            ));
        }

        let cols = cols as usize;
        let rows = rows as usize;
        let channels = channels as usize;
        let offset = cols / channels;

        let mut data_index = 0usize;
        for row in 0..rows {
            let row_base = cols * row;
            for c in 0..cols / channels {
                for ch in 0..channels {
                    self.scratch[row_base + c + ch * offset] = buf[data_index];
                    data_index += 1;
                }
            }
        }

        let pixels = cols * rows;
        buf[..pixels].copy_from_slice(&self.scratch[..pixels]);
        Ok(())
    }

    fn sta1600(&mut self, buf: &mut [T], cols: u32, rows: u32) -> AppResult<()> {
        if cols % 16 != 0 {
            return Err(CamError::Deinterlace(
                "number of cols must be a multiple of 16 for STA1600 deinterlace".into(),
            ));
        }
        if rows % 2 != 0 {
            return Err(CamError::Deinterlace(
                "number of rows must be a multiple of 2 for STA1600 deinterlace".into(),
            ));
        }

        let cols = cols as usize;
        let rows = rows as usize;
        let offset = cols / 8;

        let mut data_index = 0usize;
        for r in 0..rows / 2 {
            let top = cols * (rows - r - 1);
            let bot = cols * r;

            for c in 0..cols / 8 {
                for ch in (0..8).rev() {
                    self.scratch[bot + c + ch * offset] = buf[data_index];
                    data_index += 1;
                }
                for ch in (0..8).rev() {
                    self.scratch[top + c + ch * offset] = buf[data_index];
                    data_index += 1;
                }
            }
        }

        let pixels = cols * rows;
        buf[..pixels].copy_from_slice(&self.scratch[..pixels]);
        Ok(())
    }
}

/// Quad-IR deinterlace of one `rows` x `cols` section into `scratch`.
fn quad_ir_section<T: Copy>(scratch: &mut [T], buf: &[T], cols: usize, rows: usize) {
    let pixels = cols * rows;

    let mut i = 0usize;
    let mut j = rows - 1;
    let mut counter = 0usize;
    let mut begin = 0usize;
    let mut end = 0usize;

    while i < pixels {
        if counter % (cols / 2) == 0 {
            end = (j - rows / 2) * cols;
            begin = j * cols;
            j = j.wrapping_sub(1);
            counter = 0;
        }

        scratch[begin + counter] = buf[i]; // top-left amp
        scratch[begin + cols / 2 + counter] = buf[i + 1]; // top-right amp
        scratch[end + cols / 2 + counter] = buf[i + 2]; // bottom-right amp
        scratch[end + counter] = buf[i + 3]; // bottom-left amp
        i += 4;

        counter += 1;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn run(input: &[u16], cols: u32, rows: u32, algorithm: Algorithm) -> Vec<u16> {
        let mut buf = input.to_vec();
        Deinterlacer::new()
            .run(&mut buf, cols, rows, algorithm)
            .expect("deinterlace");
        buf
    }

    #[test]
    fn none_leaves_data_untouched() {
        assert_eq!(run(&[1, 2, 3, 4], 2, 2, Algorithm::None), vec![1, 2, 3, 4]);
    }

    #[test]
    fn parallel_splits_top_and_bottom() {
        // Even pixels stream from the bottom amp forward, odd pixels from
        // the top amp backward
        assert_eq!(
            run(&[1, 2, 3, 4], 2, 2, Algorithm::Parallel),
            vec![1, 3, 4, 2]
        );
    }

    #[test]
    fn parallel_rejects_odd_rows() {
        let mut buf = vec![0u16; 6];
        let err = Deinterlacer::new()
            .run(&mut buf, 2, 3, Algorithm::Parallel)
            .unwrap_err();
        assert!(matches!(err, CamError::Deinterlace(_)));
    }

    #[test]
    fn serial_splits_left_and_right() {
        assert_eq!(
            run(&[1, 2, 3, 4], 4, 1, Algorithm::Serial),
            vec![1, 3, 4, 2]
        );
    }

    #[test]
    fn quad_ccd_small_frame() {
        assert_eq!(
            run(&[1, 2, 3, 4], 2, 2, Algorithm::QuadCcd),
            vec![1, 2, 4, 3]
        );
    }

    #[test]
    fn quad_ir_small_frame() {
        assert_eq!(
            run(&[1, 2, 3, 4], 2, 2, Algorithm::QuadIr),
            vec![4, 3, 1, 2]
        );
    }

    #[test]
    fn quad_ir_cds_deinterlaces_both_halves() {
        assert_eq!(
            run(&[1, 2, 3, 4, 5, 6, 7, 8], 2, 4, Algorithm::QuadIrCds),
            vec![4, 3, 1, 2, 8, 7, 5, 6]
        );
    }

    #[test]
    fn hawaii_rg_interleaves_channels() {
        assert_eq!(
            run(&[1, 2, 3, 4], 4, 1, Algorithm::HawaiiRg { channels: 2 }),
            vec![1, 3, 2, 4]
        );
    }

    #[test]
    fn hawaii_rg_single_channel_is_noop() {
        assert_eq!(
            run(&[4, 3, 2, 1], 4, 1, Algorithm::HawaiiRg { channels: 1 }),
            vec![4, 3, 2, 1]
        );
    }

    #[test]
    fn hawaii_rg_rejects_bad_channel_counts() {
        let mut buf = vec![0u16; 4];
        let mut dl = Deinterlacer::new();
        assert!(dl
            .run(&mut buf, 4, 1, Algorithm::HawaiiRg { channels: 0 })
            .is_err());
        assert!(dl
            .run(&mut buf, 4, 1, Algorithm::HawaiiRg { channels: 3 })
            .is_err());
    }

    #[test]
    fn sta1600_splits_top_and_bottom_channels() {
        let input: Vec<u16> = (0..32).collect();
        let out = run(&input, 16, 2, Algorithm::Sta1600);

        // First 8 raw pixels land in the bottom row, channels 7 down to 0
        assert_eq!(out[14], 0);
        assert_eq!(out[0], 7);
        // Next 8 land mirrored in the top row
        assert_eq!(out[16 + 14], 8);
        assert_eq!(out[16], 15);
        // Second column pass
        assert_eq!(out[15], 16);
        assert_eq!(out[16 + 15], 24);
    }

    #[test]
    fn sta1600_rejects_bad_geometry() {
        let mut buf = vec![0u16; 30];
        let mut dl = Deinterlacer::new();
        assert!(dl.run(&mut buf, 15, 2, Algorithm::Sta1600).is_err());
        assert!(dl.run(&mut buf, 16, 1, Algorithm::Sta1600).is_err());
    }

    #[test]
    fn works_for_32_bit_pixels() {
        let mut buf: Vec<u32> = vec![1, 2, 3, 4];
        Deinterlacer::new()
            .run(&mut buf, 2, 2, Algorithm::QuadCcd)
            .expect("deinterlace");
        assert_eq!(buf, vec![1, 2, 4, 3]);
    }

    #[test]
    fn algorithm_names_parse() {
        assert_eq!(Algorithm::from_name("serial", 0), Some(Algorithm::Serial));
        assert_eq!(
            Algorithm::from_name("hawaii_rg", 4),
            Some(Algorithm::HawaiiRg { channels: 4 })
        );
        assert_eq!(Algorithm::from_name("bogus", 0), None);
    }
}
