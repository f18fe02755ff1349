//! DSP firmware file (`.lod`) parsing.
//!
//! Timing and utility board firmware ships as text files: a banner line
//! naming the target boot ROM (`TIMBOOT`, `UTILBOOT` or `CRT` for C-runtime
//! timing code), followed by `_DATA <space> <hex address>` block headers and
//! lines of hex data words. Parsing is separated from the download so the
//! format can be tested without a controller; [`crate::controller`] performs
//! the actual memory writes.

use std::path::Path;

use crate::error::{AppResult, CamError};
use crate::proto::{self, MAX_DSP_START_LOAD_ADDR};

/// Which controller board a firmware file targets.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LodTarget {
    /// Timing board firmware. `c_runtime` marks a CRT file, which needs a
    /// trailing `JDL` to jump from boot code into the uploaded application.
    Timing {
        /// True for `CRT` files.
        c_runtime: bool,
    },
    /// Utility board firmware.
    Utility,
}

impl LodTarget {
    /// The board id download words are addressed to.
    pub fn board_id(self) -> u32 {
        match self {
            LodTarget::Timing { .. } => proto::TIM_ID,
            LodTarget::Utility => proto::UTIL_ID,
        }
    }
}

/// DSP memory space selector in a `_DATA` block header.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MemSpace {
    /// Program memory.
    P,
    /// X data memory.
    X,
    /// Y data memory.
    Y,
    /// ROM.
    R,
}

impl MemSpace {
    /// The address tag bits for this memory space.
    pub fn tag(self) -> u32 {
        match self {
            MemSpace::P => proto::P_MEM,
            MemSpace::X => proto::X_MEM,
            MemSpace::Y => proto::Y_MEM,
            MemSpace::R => proto::R_MEM,
        }
    }

    fn from_char(c: char) -> Option<Self> {
        match c {
            'P' => Some(MemSpace::P),
            'X' => Some(MemSpace::X),
            'Y' => Some(MemSpace::Y),
            'R' => Some(MemSpace::R),
            _ => None,
        }
    }
}

/// One `_DATA` block: consecutive words starting at `addr` in `mem`.
#[derive(Debug, Clone)]
pub struct LodBlock {
    /// Target memory space.
    pub mem: MemSpace,
    /// Start address within the memory space.
    pub addr: u32,
    /// Data words, written to `addr`, `addr + 1`, ...
    pub data: Vec<u32>,
}

/// A parsed firmware file.
#[derive(Debug, Clone)]
pub struct LodFile {
    /// Target board.
    pub target: LodTarget,
    /// Download blocks in file order. Blocks whose start address is at or
    /// above [`MAX_DSP_START_LOAD_ADDR`] are dropped during parsing; they
    /// address boot ROM shadow space and must not be overwritten.
    pub blocks: Vec<LodBlock>,
}

impl LodFile {
    /// Reads and parses a firmware file from disk.
    pub fn load(path: &Path) -> AppResult<Self> {
        let text = std::fs::read_to_string(path).map_err(|e| {
            CamError::Firmware(format!("cannot open file {}: {e}", path.display()))
        })?;
        Self::parse(&text)
    }

    /// Parses firmware file text.
    pub fn parse(text: &str) -> AppResult<Self> {
        let mut lines = text.lines();

        let banner = lines.next().unwrap_or("");
        let target = if banner.contains("CRT") {
            LodTarget::Timing { c_runtime: true }
        } else if banner.contains("TIM") {
            LodTarget::Timing { c_runtime: false }
        } else if banner.contains("UTIL") {
            LodTarget::Utility
        } else {
            return Err(CamError::Firmware(
                "invalid file, missing TIMBOOT/CRT or UTILBOOT banner".into(),
            ));
        };

        let mut blocks = Vec::new();
        let mut current: Option<LodBlock> = None;

        for line in lines {
            if line.starts_with('_') {
                if let Some(block) = current.take() {
                    blocks.push(block);
                }

                if !line.contains("_DATA ") {
                    // _START/_END and friends terminate the current block
                    continue;
                }

                let tokens: Vec<&str> = line.split_whitespace().collect();
                if tokens.len() < 3 {
                    return Err(CamError::Firmware(format!("malformed block header: {line}")));
                }

                let mem = tokens[1]
                    .chars()
                    .next()
                    .and_then(MemSpace::from_char)
                    .ok_or_else(|| {
                        CamError::Firmware(format!("unknown memory space in: {line}"))
                    })?;

                let addr = u32::from_str_radix(tokens[2], 16).map_err(|_| {
                    CamError::Firmware(format!("failed to convert memory address: {line}"))
                })?;

                if addr < MAX_DSP_START_LOAD_ADDR {
                    current = Some(LodBlock {
                        mem,
                        addr,
                        data: Vec::new(),
                    });
                }
                continue;
            }

            if let Some(block) = current.as_mut() {
                for token in line.split_whitespace() {
                    let word = u32::from_str_radix(token, 16).map_err(|_| {
                        CamError::Firmware(format!("failed to convert data word: {token}"))
                    })?;
                    block.data.push(word);
                }
            }
        }

        if let Some(block) = current.take() {
            blocks.push(block);
        }

        Ok(Self { target, blocks })
    }

    /// Total number of data words across all blocks.
    pub fn word_count(&self) -> usize {
        self.blocks.iter().map(|b| b.data.len()).sum()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const TIM_FILE: &str = "\
_START TIMBOOT
_DATA P 0
000102 000304
000506
_DATA Y 2
00000A
_DATA X 5000
FFFFFF
_END TIMBOOT
";

    #[test]
    fn parses_timing_file_blocks() {
        let lod = LodFile::parse(TIM_FILE).expect("parse");
        assert_eq!(lod.target, LodTarget::Timing { c_runtime: false });
        assert_eq!(lod.target.board_id(), proto::TIM_ID);

        // The X 0x5000 block is above the load address limit and is dropped
        assert_eq!(lod.blocks.len(), 2);

        assert_eq!(lod.blocks[0].mem, MemSpace::P);
        assert_eq!(lod.blocks[0].addr, 0);
        assert_eq!(lod.blocks[0].data, vec![0x102, 0x304, 0x506]);

        assert_eq!(lod.blocks[1].mem, MemSpace::Y);
        assert_eq!(lod.blocks[1].addr, 2);
        assert_eq!(lod.blocks[1].data, vec![0xA]);

        assert_eq!(lod.word_count(), 4);
    }

    #[test]
    fn parses_utility_and_crt_banners() {
        let util = LodFile::parse("_START UTILBOOT\n").expect("parse");
        assert_eq!(util.target, LodTarget::Utility);
        assert_eq!(util.target.board_id(), proto::UTIL_ID);

        let crt = LodFile::parse("_START CRT\n").expect("parse");
        assert_eq!(crt.target, LodTarget::Timing { c_runtime: true });
        assert_eq!(crt.target.board_id(), proto::TIM_ID);
    }

    #[test]
    fn rejects_unknown_banner() {
        let err = LodFile::parse("garbage\n").unwrap_err();
        assert!(matches!(err, CamError::Firmware(_)));
    }

    #[test]
    fn rejects_bad_hex() {
        let text = "_START TIMBOOT\n_DATA P 0\nZZZZ\n";
        let err = LodFile::parse(text).unwrap_err();
        assert!(matches!(err, CamError::Firmware(_)));
    }

    #[test]
    fn memory_space_tags() {
        assert_eq!(MemSpace::P.tag(), proto::P_MEM);
        assert_eq!(MemSpace::X.tag(), proto::X_MEM);
        assert_eq!(MemSpace::Y.tag(), proto::Y_MEM);
        assert_eq!(MemSpace::R.tag(), proto::R_MEM);
    }
}
