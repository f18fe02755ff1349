//! Device transport seam.
//!
//! Everything above this module speaks registers; everything below it is the
//! kernel driver. [`DeviceTransport`] is the object-safe boundary between the
//! two, with a real PCIe implementation (feature `pcie_hardware`) that talks
//! to the driver device nodes, and a register-level simulator in
//! [`crate::device::sim`] for development and tests.

use std::path::PathBuf;

use crate::error::{AppResult, CamError};

/// Base address registers exposed by the PCIe interface board.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u32)]
pub enum PcieBar {
    /// Local configuration registers (BAR 0).
    LocalConfig = 0x00,
    /// Device registers (BAR 2). All command and status traffic uses this.
    DeviceRegs = 0x02,
}

/// Common-buffer properties reported by the kernel driver.
#[derive(Debug, Clone, Copy, Default)]
pub struct ImageBufferInfo {
    /// Physical address of the kernel image buffer. Informational only.
    pub physical_addr: u64,
    /// Size of the kernel image buffer in bytes.
    pub size: u64,
}

/// Driver request: read a base address register.
pub const ARC_READ_BAR: u64 = 0x01;
/// Driver request: write a base address register.
pub const ARC_WRITE_BAR: u64 = 0x02;
/// Driver request: get a base address register size.
pub const ARC_BAR_SIZE: u64 = 0x03;
/// Driver request: read 8 bits of configuration space.
pub const ARC_READ_CFG_8: u64 = 0x04;
/// Driver request: read 16 bits of configuration space.
pub const ARC_READ_CFG_16: u64 = 0x05;
/// Driver request: read 32 bits of configuration space.
pub const ARC_READ_CFG_32: u64 = 0x06;
/// Driver request: write 8 bits of configuration space.
pub const ARC_WRITE_CFG_8: u64 = 0x07;
/// Driver request: write 16 bits of configuration space.
pub const ARC_WRITE_CFG_16: u64 = 0x08;
/// Driver request: write 32 bits of configuration space.
pub const ARC_WRITE_CFG_32: u64 = 0x09;
/// Driver request: get common buffer properties.
pub const ARC_BUFFER_PROP: u64 = 0x0A;

/// Directory scanned for driver device nodes.
pub const DEVICE_DIR: &str = "/dev";
/// Device node name used by older driver versions.
pub const DEVICE_NAME: &str = "AstroPCIe";
/// Device node name used by current driver versions.
pub const DEVICE_NAME_ALT: &str = "Arc66PCIe";

/// Width selector for configuration-space access.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CfgWidth {
    /// 8-bit access.
    Byte,
    /// 16-bit access.
    Word,
    /// 32-bit access.
    DWord,
}

/// Object-safe boundary to the device driver.
///
/// A transport is constructed connected; dropping it releases the device.
/// Implementations do not interpret register contents, they only move words
/// and manage the common-buffer mapping.
pub trait DeviceTransport: Send {
    /// Reads a 32-bit value from a base address register offset.
    fn read_bar(&mut self, bar: PcieBar, offset: u32) -> AppResult<u32>;

    /// Writes a 32-bit value to a base address register offset.
    fn write_bar(&mut self, bar: PcieBar, offset: u32, value: u32) -> AppResult<()>;

    /// Reads from PCI configuration space at the given byte offset.
    fn read_cfg(&mut self, width: CfgWidth, offset: u32) -> AppResult<u32>;

    /// Writes to PCI configuration space at the given byte offset.
    fn write_cfg(&mut self, width: CfgWidth, offset: u32, value: u32) -> AppResult<()>;

    /// Maps `bytes` of the kernel common buffer into this process.
    fn map_buffer(&mut self, bytes: usize) -> AppResult<()>;

    /// Releases the common-buffer mapping. The buffer must not be accessed
    /// afterwards.
    fn unmap_buffer(&mut self) -> AppResult<()>;

    /// Returns the common-buffer properties from the driver.
    fn buffer_info(&mut self) -> AppResult<ImageBufferInfo>;

    /// Returns the mapped buffer, if any.
    fn buffer(&self) -> Option<&[u8]>;

    /// Returns the mapped buffer mutably, if any.
    fn buffer_mut(&mut self) -> Option<&mut [u8]>;
}

/// Scans `/dev` for PCIe interface board device nodes.
///
/// The returned list is sorted so device numbers are stable across calls.
pub fn find_devices() -> AppResult<Vec<PathBuf>> {
    find_devices_in(DEVICE_DIR)
}

pub(crate) fn find_devices_in(dir: &str) -> AppResult<Vec<PathBuf>> {
    let mut devices: Vec<PathBuf> = std::fs::read_dir(dir)?
        .filter_map(|entry| entry.ok())
        .filter(|entry| {
            let name = entry.file_name();
            let name = name.to_string_lossy();
            name.contains(DEVICE_NAME) || name.contains(DEVICE_NAME_ALT)
        })
        .map(|entry| entry.path())
        .collect();

    devices.sort();

    if devices.is_empty() {
        return Err(CamError::NoDevicesFound);
    }

    Ok(devices)
}

#[cfg(feature = "pcie_hardware")]
pub use hardware::PcieTransport;

#[cfg(feature = "pcie_hardware")]
mod hardware {
    //! Real PCIe board access through the kernel driver.

    #![allow(unsafe_code)]

    use std::fs::OpenOptions;
    use std::os::fd::AsRawFd;
    use std::path::Path;

    use memmap2::MmapOptions;

    use super::{
        CfgWidth, DeviceTransport, ImageBufferInfo, PcieBar, ARC_BUFFER_PROP, ARC_READ_BAR,
        ARC_READ_CFG_16, ARC_READ_CFG_32, ARC_READ_CFG_8, ARC_WRITE_BAR, ARC_WRITE_CFG_16,
        ARC_WRITE_CFG_32, ARC_WRITE_CFG_8,
    };
    use crate::error::{AppResult, CamError};

    /// Transport backed by an open driver device node.
    pub struct PcieTransport {
        file: std::fs::File,
        map: Option<memmap2::MmapMut>,
    }

    impl PcieTransport {
        /// Opens the given device node.
        ///
        /// The descriptor is marked close-on-exec so forked children cannot
        /// keep the device usage count pinned and block a later re-open.
        pub fn open(path: &Path) -> AppResult<Self> {
            let file = OpenOptions::new()
                .read(true)
                .write(true)
                .open(path)
                .map_err(|e| CamError::OpenFailed {
                    path: path.display().to_string(),
                    reason: e.to_string(),
                })?;

            let fd = file.as_raw_fd();
            let rc = unsafe { libc::fcntl(fd, libc::F_SETFD, libc::FD_CLOEXEC) };
            if rc != 0 {
                return Err(CamError::OpenFailed {
                    path: path.display().to_string(),
                    reason: std::io::Error::last_os_error().to_string(),
                });
            }

            Ok(Self { file, map: None })
        }

        fn ioctl_inout(&self, request: u64, data: &mut [u8]) -> AppResult<()> {
            let rc = unsafe {
                libc::ioctl(
                    self.file.as_raw_fd(),
                    request as libc::c_ulong,
                    data.as_mut_ptr(),
                )
            };
            if rc < 0 {
                return Err(std::io::Error::last_os_error().into());
            }
            Ok(())
        }
    }

    impl DeviceTransport for PcieTransport {
        fn read_bar(&mut self, bar: PcieBar, offset: u32) -> AppResult<u32> {
            let mut args = [0u8; 8];
            args[..4].copy_from_slice(&(bar as u32).to_ne_bytes());
            args[4..].copy_from_slice(&offset.to_ne_bytes());
            self.ioctl_inout(ARC_READ_BAR, &mut args)?;
            let mut out = [0u8; 4];
            out.copy_from_slice(&args[..4]);
            Ok(u32::from_ne_bytes(out))
        }

        fn write_bar(&mut self, bar: PcieBar, offset: u32, value: u32) -> AppResult<()> {
            let mut args = [0u8; 12];
            args[..4].copy_from_slice(&(bar as u32).to_ne_bytes());
            args[4..8].copy_from_slice(&offset.to_ne_bytes());
            args[8..].copy_from_slice(&value.to_ne_bytes());
            self.ioctl_inout(ARC_WRITE_BAR, &mut args)
        }

        fn read_cfg(&mut self, width: CfgWidth, offset: u32) -> AppResult<u32> {
            let request = match width {
                CfgWidth::Byte => ARC_READ_CFG_8,
                CfgWidth::Word => ARC_READ_CFG_16,
                CfgWidth::DWord => ARC_READ_CFG_32,
            };
            let mut args = offset.to_ne_bytes();
            self.ioctl_inout(request, &mut args)?;
            Ok(u32::from_ne_bytes(args))
        }

        fn write_cfg(&mut self, width: CfgWidth, offset: u32, value: u32) -> AppResult<()> {
            let request = match width {
                CfgWidth::Byte => ARC_WRITE_CFG_8,
                CfgWidth::Word => ARC_WRITE_CFG_16,
                CfgWidth::DWord => ARC_WRITE_CFG_32,
            };
            let mut args = [0u8; 8];
            args[..4].copy_from_slice(&offset.to_ne_bytes());
            args[4..].copy_from_slice(&value.to_ne_bytes());
            self.ioctl_inout(request, &mut args)
        }

        fn map_buffer(&mut self, bytes: usize) -> AppResult<()> {
            if self.map.is_some() {
                return Err(CamError::BufferAlreadyMapped);
            }
            let map = unsafe { MmapOptions::new().len(bytes).map_mut(&self.file)? };
            self.map = Some(map);
            Ok(())
        }

        fn unmap_buffer(&mut self) -> AppResult<()> {
            self.map = None;
            Ok(())
        }

        fn buffer_info(&mut self) -> AppResult<ImageBufferInfo> {
            let mut args = [0u8; 16];
            self.ioctl_inout(ARC_BUFFER_PROP, &mut args)?;
            let mut physical = [0u8; 8];
            let mut size = [0u8; 8];
            physical.copy_from_slice(&args[..8]);
            size.copy_from_slice(&args[8..]);
            Ok(ImageBufferInfo {
                physical_addr: u64::from_ne_bytes(physical),
                size: u64::from_ne_bytes(size),
            })
        }

        fn buffer(&self) -> Option<&[u8]> {
            self.map.as_deref()
        }

        fn buffer_mut(&mut self) -> Option<&mut [u8]> {
            self.map.as_deref_mut()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn discovery_finds_and_sorts_device_nodes() {
        let dir = tempfile::tempdir().expect("tempdir");
        std::fs::write(dir.path().join("Arc66PCIe1"), b"").expect("node");
        std::fs::write(dir.path().join("Arc66PCIe0"), b"").expect("node");
        std::fs::write(dir.path().join("ttyS0"), b"").expect("node");

        let found = find_devices_in(dir.path().to_str().expect("utf8")).expect("devices");
        assert_eq!(found.len(), 2);
        assert!(found[0].ends_with("Arc66PCIe0"));
        assert!(found[1].ends_with("Arc66PCIe1"));
    }

    #[test]
    fn discovery_errors_when_no_nodes_exist() {
        let dir = tempfile::tempdir().expect("tempdir");
        let result = find_devices_in(dir.path().to_str().expect("utf8"));
        assert!(matches!(result, Err(CamError::NoDevicesFound)));
    }
}
