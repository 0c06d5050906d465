// vim: tw=80

use serde_derive::{Deserialize, Serialize};
use std::{fmt, path::{Path, PathBuf}};

use crate::{
    config::*,
    types::*,
    zone::*,
};

/// How the device manages its zones
#[derive(Clone, Copy, Debug, Deserialize, Eq, PartialEq, Serialize)]
pub enum DeviceModel {
    /// Sequential write rules are enforced by the device.
    HostManaged,
    /// The device accepts any write, but performs best when the host honors
    /// the zones.
    HostAware,
}

/// The command set used to reach the device's zones
#[derive(Clone, Copy, Debug, Deserialize, Eq, PartialEq, Serialize)]
pub enum Interface {
    /// SCSI Zoned Block Commands
    Zbc,
    /// ATA Zoned Device ATA Command Set, reached through SCSI/ATA translation
    Zac,
    /// Zones simulated in software over a file or block device
    Emulated,
}

impl fmt::Display for Interface {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Interface::Zbc => "ZBC",
            Interface::Zac => "ZAC",
            Interface::Emulated => "emulated",
        })
    }
}

/// Information about an open device.  Only `zone_count` may change while the
/// device is open, and only through `set_zones`.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct DeviceInfo {
    /// The path used to open the device
    pub path: PathBuf,
    /// Vendor, product, and revision, where known
    pub vendor_id: String,
    pub model: DeviceModel,
    pub interface: Interface,
    pub access: Access,
    /// Bytes per logical block
    pub logical_block_size: u32,
    /// Bytes per physical block
    pub physical_block_size: u32,
    /// Total addressable capacity, in logical blocks
    pub capacity: LbaT,
    /// Number of zones covering the capacity
    pub zone_count: ZoneT,
    /// Maximum number of simultaneously open sequential zones.  0 means
    /// unlimited.
    pub max_open_zones: u32,
}

impl DeviceInfo {
    /// Convert a buffer length in bytes into logical blocks.
    pub fn bytes_to_lbas(&self, bytes: usize) -> Result<LbaT> {
        let lbs = self.logical_block_size as usize;
        if bytes % lbs != 0 {
            Err(Error::Unaligned)
        } else {
            Ok((bytes / lbs) as LbaT)
        }
    }

    /// Byte offset of the given LBA.
    pub fn lba_to_offset(&self, lba: LbaT) -> u64 {
        lba * u64::from(self.logical_block_size)
    }

    /// Fail unless the device was opened for writing.
    pub(crate) fn check_writable(&self) -> Result<()> {
        if self.access.writable() {
            Ok(())
        } else {
            Err(Error::PermissionDenied)
        }
    }
}

/// Target of a write pointer reset
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum ResetTarget {
    /// The zone starting at this LBA
    Zone(LbaT),
    /// Every sequential zone that can be reset.  Conventional, read-only, and
    /// offline zones are skipped.
    All,
}

/// The operations that every zoned device backend provides.
///
/// A backend is selected once, when a [`Device`](crate::Device) is opened, and
/// is then used through a trait object.  Each method blocks until the
/// underlying file or device completes the operation.  Methods take `&mut
/// self`; callers that share a backend between threads must serialize access
/// themselves.
///
/// All addresses are absolute LBAs.  Buffer lengths must be multiples of the
/// logical block size.
pub trait Backend: fmt::Debug + Send {
    /// Open the backend for the device at `path`.
    ///
    /// Fails with `NotAZonedDevice` if the path exists but this backend can't
    /// drive it.
    fn open(path: &Path, flags: &OpenFlags) -> Result<Self>
        where Self: Sized;

    fn info(&self) -> &DeviceInfo;

    /// Read into `buf`, starting at `lba`, from within `zone`.
    ///
    /// Returns the number of blocks read, which is less than requested if the
    /// read reaches a sequential zone's write pointer.
    fn pread(&mut self, zone: &Zone, buf: &mut [u8], lba: LbaT)
        -> Result<LbaT>;

    /// Write `buf` at `lba`, within `zone`.
    ///
    /// On success, returns the number of blocks written and advances `zone`'s
    /// write pointer to match the device's.  On failure, neither `zone` nor
    /// the device's write pointer changes.
    fn pwrite(&mut self, zone: &mut Zone, buf: &[u8], lba: LbaT)
        -> Result<LbaT>;

    /// Request that written data in `lbas` blocks starting at `lba` reach
    /// stable storage.  With `immediate`, the request may be acknowledged
    /// before the data is stable.
    fn flush(&mut self, lba: LbaT, lbas: LbaT, immediate: bool) -> Result<()>;

    /// Report up to `max` zones matching `filter`, beginning with the zone
    /// containing `lba`.
    fn report_zones(&mut self, lba: LbaT, filter: ReportingFilter, max: usize)
        -> Result<ZoneReport>;

    fn reset_write_pointer(&mut self, target: ResetTarget) -> Result<()>;

    /// Replace the entire zone table.  Only emulated devices can do this.
    fn set_zones(&mut self, _layout: &ZoneLayout) -> Result<()> {
        Err(Error::Unsupported)
    }

    /// Force the write pointer of the zone starting at `lba`.  Only emulated
    /// devices can do this.
    fn set_write_pointer(&mut self, _lba: LbaT, _wp: LbaT) -> Result<()> {
        Err(Error::Unsupported)
    }

    /// Look up the zone containing `lba`.
    fn zone_at(&mut self, lba: LbaT) -> Result<Zone> {
        self.report_zones(lba, ReportingFilter::All, 1)?
            .zones
            .pop()
            .ok_or(Error::OutOfRange)
    }

    /// Release the backend's file descriptors.  Calling `close` more than
    /// once is harmless.  Every other operation fails after `close`.
    fn close(&mut self) -> Result<()>;
}

// LCOV_EXCL_STOP
