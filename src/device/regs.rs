//! PCIe interface board register map (BAR 2 offsets).

/// Command header register.
pub const CMD_HEADER: u32 = 0x00;
/// Command word register.
pub const CMD_COMMAND: u32 = 0x04;
/// Command argument 0 register.
pub const CMD_ARG0: u32 = 0x08;
/// Command argument 1 register.
pub const CMD_ARG1: u32 = 0x0C;
/// Command argument 2 register.
pub const CMD_ARG2: u32 = 0x10;
/// Command argument 3 register.
pub const CMD_ARG3: u32 = 0x14;
/// Command argument 4 register.
pub const CMD_ARG4: u32 = 0x18;
/// Special command register: controller id query and controller reset.
pub const CTLR_SPECIAL_CMD: u32 = 0x1C;
/// Board reset register. Writing 1 clears every register to its initial
/// state.
pub const RESET: u32 = 0x20;
/// Tells the board to reset its internal image buffer address.
pub const INIT_IMG_ADDR: u32 = 0x38;
/// Enables or disables dual fiber optic receivers.
pub const FIBER_2X_CTRL: u32 = 0x5C;
/// Board status register.
pub const STATUS: u32 = 0x60;
/// Controller command reply register.
pub const CMD_REPLY: u32 = 0x64;
/// First reply argument for the current command.
pub const CTLR_ARG1: u32 = 0x68;
/// Second reply argument for the current command.
pub const CTLR_ARG2: u32 = 0x6C;
/// Current image readout pixel count.
pub const PIXEL_COUNT: u32 = 0x70;
/// Current continuous-readout frame count.
pub const FRAME_COUNT: u32 = 0x74;
/// Lower 32 bits of the board id (`6R1A`).
pub const ID_LO: u32 = 0x78;
/// Upper 32 bits of the board id (`ARC6`).
pub const ID_HI: u32 = 0x7C;

/// Special-command register value: read the controller id.
pub const CONTROLLER_GET_ID: u32 = 0x09;
/// Special-command register value: reset the controller.
pub const CONTROLLER_RESET: u32 = 0x0B;

/// Writing this value to the status register clears it.
pub const STATUS_CLEAR_ALL: u32 = 0x7F;

/// Expected board id, ascii `ARC6`.
pub const BOARD_ID: u32 = 0x4152_4336;

/// Command words are tagged with this marker in their top byte before being
/// written to the command registers.
pub const CMD_TAG: u32 = 0xAC00_0000;
