// vim: tw=80
//! The handle that callers open and operate on

use std::{
    os::unix::fs::FileTypeExt,
    path::Path,
};
use nix::errno::Errno;
use tracing::{debug, instrument, warn};

use crate::{
    backend::*,
    config::*,
    emulation::Emulation,
    hardware::Hardware,
    types::*,
    zone::*,
};

const CLOSED: Error = Error::IoFailure(Errno::EBADF);

/// Number of zones requested per report while listing the whole table
const LIST_PAGE_LEN: usize = 4096;

/// An open zoned device.
///
/// `Device` binds one [`Backend`], chosen when the device is opened, and
/// forwards every operation to it.  It adds only the translation of plain
/// addresses and zone indices into the zone references the backend expects.
///
/// Operations block until the backend completes them.  A `Device` may be moved
/// between threads but not shared; wrap it in a `Mutex` for that.
#[derive(Debug)]
pub struct Device {
    /// `None` once closed
    backend: Option<Box<dyn Backend>>,
    info: DeviceInfo,
}

impl Device {
    /// Open the zoned device at `path`.
    ///
    /// Device nodes are first checked for native zone support, if
    /// `flags.native` is set.  Failing that, and if `flags.emulation` is set,
    /// the path is opened as an emulated zoned device.
    pub fn open<P: AsRef<Path>>(path: P, flags: &OpenFlags) -> Result<Self> {
        Self::open_path(path.as_ref(), flags)
    }

    #[instrument(skip(flags))]
    fn open_path(path: &Path, flags: &OpenFlags) -> Result<Self> {
        let ft = std::fs::metadata(path)
            .map_err(Error::from_open)?
            .file_type();
        let is_node = ft.is_block_device() || ft.is_char_device();
        if flags.native && is_node {
            match Hardware::open(path, flags) {
                Ok(hw) => return Ok(Device::from_backend(Box::new(hw))),
                Err(Error::NotAZonedDevice) if flags.emulation => {
                    warn!(?path,
                        "no native zone support; falling back to emulation");
                },
                Err(e) => return Err(e)
            }
        }
        if flags.emulation && (ft.is_file() || ft.is_block_device()) {
            let emu = Emulation::open(path, flags)?;
            debug!(?path, meta = ?emu.meta_path(), "opened emulated device");
            return Ok(Device::from_backend(Box::new(emu)));
        }
        Err(Error::NotAZonedDevice)
    }

    /// Bind an already opened backend.
    pub fn from_backend(backend: Box<dyn Backend>) -> Self {
        let info = backend.info().clone();
        Device { backend: Some(backend), info }
    }

    fn backend(&mut self) -> Result<&mut Box<dyn Backend>> {
        self.backend.as_mut().ok_or(CLOSED)
    }

    pub fn info(&self) -> &DeviceInfo {
        &self.info
    }

    /// Has the device been closed?
    pub fn is_closed(&self) -> bool {
        self.backend.is_none()
    }

    /// Read into `buf` from the zone containing `lba`.  The read may not cross
    /// into the next zone.
    ///
    /// Returns the number of blocks read, which is short if the read reaches
    /// the zone's write pointer.
    #[instrument(skip(self, buf))]
    pub fn pread(&mut self, buf: &mut [u8], lba: LbaT) -> Result<LbaT> {
        let zone = self.backend()?.zone_at(lba)?;
        self.backend()?.pread(&zone, buf, lba)
    }

    /// Write `buf` at `lba`, within the zone containing `lba`.
    #[instrument(skip(self, buf))]
    pub fn pwrite(&mut self, buf: &[u8], lba: LbaT) -> Result<LbaT> {
        let mut zone = self.backend()?.zone_at(lba)?;
        self.backend()?.pwrite(&mut zone, buf, lba)
    }

    /// Read into `buf` from `zone`, starting at the absolute address `lba`.
    #[instrument(skip(self, buf))]
    pub fn pread_zone(&mut self, zone: &Zone, buf: &mut [u8], lba: LbaT)
        -> Result<LbaT>
    {
        self.backend()?.pread(zone, buf, lba)
    }

    /// Write `buf` into `zone`, starting at the absolute address `lba`.
    ///
    /// On success `zone` is updated, so that the caller may keep writing
    /// without looking the zone up again.
    #[instrument(skip(self, buf))]
    pub fn pwrite_zone(&mut self, zone: &mut Zone, buf: &[u8], lba: LbaT)
        -> Result<LbaT>
    {
        self.backend()?.pwrite(zone, buf, lba)
    }

    #[instrument(skip(self))]
    pub fn flush(&mut self, lba: LbaT, lbas: LbaT, immediate: bool)
        -> Result<()>
    {
        self.backend()?.flush(lba, lbas, immediate)
    }

    /// Report up to `max` zones matching `filter`, starting with the zone that
    /// contains `lba`.
    #[instrument(skip(self))]
    pub fn report_zones(&mut self, lba: LbaT, filter: ReportingFilter,
                        max: usize) -> Result<ZoneReport>
    {
        self.backend()?.report_zones(lba, filter, max)
    }

    /// Count the zones at or after `lba` that match `filter`.
    pub fn report_nr_zones(&mut self, lba: LbaT, filter: ReportingFilter)
        -> Result<usize>
    {
        self.report_zones(lba, filter, 0).map(|r| r.total)
    }

    /// Page through the entire zone table.
    #[instrument(skip(self))]
    pub fn list_zones(&mut self) -> Result<Vec<Zone>> {
        let capacity = self.info.capacity;
        let mut zones = Vec::with_capacity(self.info.zone_count as usize);
        let backend = self.backend()?;
        let mut lba = 0;
        loop {
            let r = backend.report_zones(lba, ReportingFilter::All,
                                         LIST_PAGE_LEN)?;
            let truncated = r.truncated();
            let next = r.next_lba();
            zones.extend(r.zones);
            match next {
                Some(n) if truncated && n < capacity => lba = n,
                _ => break
            }
        }
        Ok(zones)
    }

    /// Look up the zone containing `lba`.
    pub fn zone(&mut self, lba: LbaT) -> Result<Zone> {
        self.backend()?.zone_at(lba)
    }

    /// Look up a zone by its position in the zone table.
    pub fn zone_by_index(&mut self, index: ZoneT) -> Result<Zone> {
        if index >= self.info.zone_count {
            return Err(Error::OutOfRange);
        }
        let want = index as usize + 1;
        self.backend()?
            .report_zones(0, ReportingFilter::All, want)?
            .zones
            .get(index as usize)
            .copied()
            .ok_or(Error::OutOfRange)
    }

    #[instrument(skip(self))]
    pub fn reset_write_pointer(&mut self, target: ResetTarget) -> Result<()> {
        self.backend()?.reset_write_pointer(target)
    }

    /// Replace the whole zone table.  Emulated devices only.
    ///
    /// Data already stored on the device is left in place.
    #[instrument(skip(self, layout), fields(zones = layout.len()))]
    pub fn set_zones(&mut self, layout: &ZoneLayout) -> Result<()> {
        let backend = self.backend()?;
        backend.set_zones(layout)?;
        let info = backend.info().clone();
        self.info = info;
        Ok(())
    }

    /// Force the write pointer of the zone starting at `lba`.  Emulated
    /// devices only.
    #[instrument(skip(self))]
    pub fn set_write_pointer(&mut self, lba: LbaT, wp: LbaT) -> Result<()> {
        self.backend()?.set_write_pointer(lba, wp)
    }

    /// Release the backend.  The backend is released even if closing it
    /// reports an error.  Closing an already closed device does nothing.
    #[instrument(skip(self), fields(path = ?self.info.path))]
    pub fn close(&mut self) -> Result<()> {
        match self.backend.take() {
            Some(mut backend) => backend.close(),
            None => Ok(())
        }
    }
}

impl Drop for Device {
    fn drop(&mut self) {
        if let Err(e) = self.close() {
            warn!(path = ?self.info.path, error = ?e,
                  "error closing zoned device");
        }
    }
}

// LCOV_EXCL_START
#[cfg(test)]
mockall::mock! {
    pub Backend {}
    impl Backend for Backend {
        fn open(path: &Path, flags: &OpenFlags) -> Result<Self>;
        fn info(&self) -> &DeviceInfo;
        fn pread(&mut self, zone: &Zone, buf: &mut [u8], lba: LbaT)
            -> Result<LbaT>;
        fn pwrite(&mut self, zone: &mut Zone, buf: &[u8], lba: LbaT)
            -> Result<LbaT>;
        fn flush(&mut self, lba: LbaT, lbas: LbaT, immediate: bool)
            -> Result<()>;
        fn report_zones(&mut self, lba: LbaT, filter: ReportingFilter,
                        max: usize) -> Result<ZoneReport>;
        fn reset_write_pointer(&mut self, target: ResetTarget) -> Result<()>;
        fn set_zones(&mut self, layout: &ZoneLayout) -> Result<()>;
        fn set_write_pointer(&mut self, lba: LbaT, wp: LbaT) -> Result<()>;
        fn zone_at(&mut self, lba: LbaT) -> Result<Zone>;
        fn close(&mut self) -> Result<()>;
    }
}

#[cfg(test)]
impl std::fmt::Debug for MockBackend {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MockBackend").finish()
    }
}

// LCOV_EXCL_STOP
