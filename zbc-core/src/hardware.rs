// vim: tw=80
//! Devices with native zone support, driven by ZBC commands
//!
//! The backend itself never touches a file descriptor.  It builds typed
//! [`Command`]s and hands them to a [`CommandChannel`], which knows how to
//! deliver them to a real device (see `SgChannel`) or to something pretending
//! to be one.

use byteorder::{BigEndian, ByteOrder};
use cfg_if::cfg_if;
use nix::errno::Errno;
use std::{fmt, path::Path};
use tracing::{debug, warn};

use crate::{
    backend::*,
    config::*,
    types::*,
    zone::*,
};

/// Length of the REPORT ZONES parameter data header
pub const REPORT_HEADER_LEN: usize = 64;
/// Length of one zone descriptor in REPORT ZONES parameter data
pub const DESCRIPTOR_LEN: usize = 64;
/// Allocation length used for standard INQUIRY data
pub const INQUIRY_LEN: usize = 96;
/// Allocation length used for VPD pages
pub const VPD_LEN: usize = 64;
/// Length of READ CAPACITY(16) parameter data
pub const READ_CAPACITY_LEN: usize = 32;

/// Peripheral device type of an ordinary direct access block device
pub const PERIPHERAL_DIRECT_ACCESS: u8 = 0x00;
/// Peripheral device type of a host-managed zoned block device
pub const PERIPHERAL_HOST_MANAGED: u8 = 0x14;
/// Block Device Characteristics VPD page
pub const VPD_BLOCK_DEVICE_CHARACTERISTICS: u8 = 0xb1;
/// Zoned Block Device Characteristics VPD page
pub const VPD_ZONED_CHARACTERISTICS: u8 = 0xb6;

const BAD_RESPONSE: Error = Error::IoFailure(Errno::EIO);
const CLOSED: Error = Error::IoFailure(Errno::EBADF);

/// A command understood by zoned block devices.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum Command {
    /// Standard INQUIRY data
    Inquiry,
    /// INQUIRY for the given vital product data page
    InquiryVpd(u8),
    /// READ CAPACITY(16)
    ReadCapacity,
    Read { lba: LbaT, lbas: u32 },
    Write { lba: LbaT, lbas: u32 },
    /// SYNCHRONIZE CACHE(16).  `lbas == 0` means through the end of the device.
    SyncCache { lba: LbaT, lbas: u32, immediate: bool },
    /// REPORT ZONES, starting with the zone containing `lba`
    ReportZones { lba: LbaT, filter: ReportingFilter },
    ResetWritePointer(ResetTarget),
}

/// Data phase of a [`Command`]
#[derive(Debug)]
pub enum Transfer<'a> {
    None,
    FromDevice(&'a mut [u8]),
    ToDevice(&'a [u8]),
}

impl Transfer<'_> {
    pub fn len(&self) -> usize {
        match self {
            Transfer::None => 0,
            Transfer::FromDevice(buf) => buf.len(),
            Transfer::ToDevice(buf) => buf.len(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Delivers commands to a zoned device.
pub trait CommandChannel: fmt::Debug + Send {
    /// Execute `cmd`, blocking until it completes.
    ///
    /// Returns the number of bytes actually transferred, which may be less
    /// than `data.len()` if the device had less to say.  Device-reported
    /// failures are already translated into [`Error`] kinds.
    fn execute(&mut self, cmd: Command, data: Transfer<'_>) -> Result<usize>;
}

/// One REPORT ZONES response, as parsed
#[derive(Clone, Debug, Default, Eq, PartialEq)]
struct ReportPage {
    zones: Vec<Zone>,
    /// Number of matching zones the device claims to have
    total: usize,
    max_lba: LbaT,
}

fn parse_descriptor(d: &[u8]) -> Result<Zone> {
    let zone_type = ZoneType::try_from(d[0] & 0x0f)
        .map_err(|_| BAD_RESPONSE)?;
    let condition = ZoneCondition::try_from(d[1] >> 4)
        .map_err(|_| BAD_RESPONSE)?;
    let flags = ZoneFlags {
        reset_recommended: d[1] & 0x01 != 0,
        non_seq: d[1] & 0x02 != 0,
    };
    let len = BigEndian::read_u64(&d[8..16]);
    let start = BigEndian::read_u64(&d[16..24]);
    if zone_type == ZoneType::Conventional {
        // The write pointer field of a conventional zone is undefined
        Ok(Zone { flags, ..Zone::conventional(start, len) })
    } else {
        let write_pointer = BigEndian::read_u64(&d[24..32]);
        Ok(Zone { start, len, zone_type, condition, write_pointer, flags })
    }
}

/// Parse REPORT ZONES parameter data, of which `transferred` bytes are valid.
fn parse_report(buf: &[u8], transferred: usize) -> Result<ReportPage> {
    let valid = transferred.min(buf.len());
    if valid < REPORT_HEADER_LEN {
        return Err(BAD_RESPONSE);
    }
    let list_len = BigEndian::read_u32(&buf[0..4]) as usize;
    let max_lba = BigEndian::read_u64(&buf[8..16]);
    let total = list_len / DESCRIPTOR_LEN;
    let returned = total.min((valid - REPORT_HEADER_LEN) / DESCRIPTOR_LEN);
    let end = REPORT_HEADER_LEN + returned * DESCRIPTOR_LEN;
    let zones = buf[REPORT_HEADER_LEN..end]
        .chunks_exact(DESCRIPTOR_LEN)
        .map(parse_descriptor)
        .collect::<Result<Vec<_>>>()?;
    Ok(ReportPage { zones, total, max_lba })
}

/// INQUIRY strings are space padded ASCII
fn ascii(field: &[u8]) -> String {
    String::from_utf8_lossy(field)
        .trim_matches(|c: char| c.is_whitespace() || c == '\0')
        .to_owned()
}

/// Convert a block count into a CDB transfer length.
fn transfer_len(lbas: LbaT) -> Result<u32> {
    u32::try_from(lbas).map_err(|_| Error::OutOfRange)
}

/// `Hardware`: a zoned device that implements zones itself
///
/// The device is the only authority on zone state.  Nothing is cached here, so
/// every lookup costs a REPORT ZONES command.  Reads and writes are checked
/// against the caller's zone before they are issued, and then checked again
/// by the device.
#[derive(Debug)]
pub struct Hardware {
    /// `None` once closed
    channel: Option<Box<dyn CommandChannel>>,
    info: DeviceInfo,
    config: HardwareConfig,
}

impl Hardware {
    /// Identify the device behind `channel` and bind to it if it is zoned.
    pub fn with_channel(path: &Path, mut channel: Box<dyn CommandChannel>,
                        flags: &OpenFlags) -> Result<Self>
    {
        let info = Self::identify(&mut *channel, path, flags)?;
        let mut hw = Hardware {
            channel: Some(channel),
            info,
            config: flags.hardware.clone()
        };
        let total = hw.report_zones(0, ReportingFilter::All, 0)?.total;
        hw.info.zone_count = ZoneT::try_from(total)
            .map_err(|_| BAD_RESPONSE)?;
        debug!(path = ?hw.info.path, model = ?hw.info.model,
               interface = %hw.info.interface, capacity = hw.info.capacity,
               zones = hw.info.zone_count, "found native zoned device");
        Ok(hw)
    }

    fn identify(channel: &mut dyn CommandChannel, path: &Path,
                flags: &OpenFlags) -> Result<DeviceInfo>
    {
        let mut inq = [0u8; INQUIRY_LEN];
        // Nodes that don't speak SCSI at all fail right here.
        let n = channel.execute(Command::Inquiry,
                                Transfer::FromDevice(&mut inq))
            .map_err(|e| {
                debug!(?path, error = ?e, "INQUIRY failed");
                Error::NotAZonedDevice
            })?;
        if n < 36 {
            return Err(Error::NotAZonedDevice);
        }
        let vendor = ascii(&inq[8..16]);
        let vendor_id = format!("{} {} {}", vendor, ascii(&inq[16..32]),
                                ascii(&inq[32..36]));
        let model = match inq[0] & 0x1f {
            PERIPHERAL_HOST_MANAGED => DeviceModel::HostManaged,
            PERIPHERAL_DIRECT_ACCESS => {
                let mut page = [0u8; VPD_LEN];
                let r = channel.execute(
                    Command::InquiryVpd(VPD_BLOCK_DEVICE_CHARACTERISTICS),
                    Transfer::FromDevice(&mut page));
                match r {
                    Ok(n) if n > 8 && (page[8] >> 4) & 0x3 == 0x1 =>
                        DeviceModel::HostAware,
                    _ => return Err(Error::NotAZonedDevice)
                }
            },
            _ => return Err(Error::NotAZonedDevice)
        };
        let interface = if vendor == "ATA" {
            Interface::Zac
        } else {
            Interface::Zbc
        };

        let mut rc = [0u8; READ_CAPACITY_LEN];
        let n = channel.execute(Command::ReadCapacity,
                                Transfer::FromDevice(&mut rc))?;
        if n < 14 {
            return Err(BAD_RESPONSE);
        }
        let capacity = BigEndian::read_u64(&rc[0..8]).checked_add(1)
            .ok_or(BAD_RESPONSE)?;
        let logical_block_size = BigEndian::read_u32(&rc[8..12]);
        if logical_block_size == 0 {
            return Err(BAD_RESPONSE);
        }
        let physical_block_size = logical_block_size
            .checked_shl(u32::from(rc[13] & 0x0f))
            .ok_or(BAD_RESPONSE)?;

        let mut page = [0u8; VPD_LEN];
        let r = channel.execute(Command::InquiryVpd(VPD_ZONED_CHARACTERISTICS),
                                Transfer::FromDevice(&mut page));
        let max_open_zones = match r {
            Ok(n) if n >= 20 => match BigEndian::read_u32(&page[16..20]) {
                u32::MAX => 0,
                m => m
            },
            _ => {
                warn!(?path, "zoned characteristics VPD page unavailable");
                0
            }
        };

        Ok(DeviceInfo {
            path: path.to_owned(),
            vendor_id,
            model,
            interface,
            access: flags.access,
            logical_block_size,
            physical_block_size,
            capacity,
            zone_count: 0,
            max_open_zones
        })
    }

    fn channel(&mut self) -> Result<&mut Box<dyn CommandChannel>> {
        self.channel.as_mut().ok_or(CLOSED)
    }

    /// Largest number of descriptors requested by a single REPORT ZONES
    fn descriptors_per_report(&self) -> usize {
        let bytes = self.config.max_report_bytes as usize;
        (bytes.saturating_sub(REPORT_HEADER_LEN) / DESCRIPTOR_LEN).max(1)
    }

    /// Reject zone references that can't belong to this device.
    fn check_zone(&self, zone: &Zone) -> Result<()> {
        if zone.len == 0 || zone.end() > self.info.capacity {
            Err(Error::OutOfRange)
        } else {
            Ok(())
        }
    }

    /// Fetch the device's current state of the zone that `zone` refers to.
    /// The caller's copy may be stale.
    fn current_zone(&mut self, zone: &Zone) -> Result<Zone> {
        self.check_zone(zone)?;
        let current = self.zone_at(zone.start)?;
        if current.start != zone.start {
            return Err(Error::OutOfRange);
        }
        Ok(current)
    }

    fn report_page(&mut self, lba: LbaT, filter: ReportingFilter, want: usize)
        -> Result<ReportPage>
    {
        let mut buf = vec![0u8; REPORT_HEADER_LEN + want * DESCRIPTOR_LEN];
        let n = self.channel()?.execute(Command::ReportZones { lba, filter },
                                        Transfer::FromDevice(&mut buf))?;
        parse_report(&buf, n)
    }
}

impl Backend for Hardware {
    fn open(path: &Path, flags: &OpenFlags) -> Result<Self> {
        cfg_if! {
            if #[cfg(target_os = "linux")] {
                let channel = crate::sg::SgChannel::open(path, flags)?;
                Hardware::with_channel(path, Box::new(channel), flags)
            } else {
                let _ = (path, flags);
                Err(Error::NotAZonedDevice)
            }
        }
    }

    fn info(&self) -> &DeviceInfo {
        &self.info
    }

    fn pread(&mut self, zone: &Zone, buf: &mut [u8], lba: LbaT)
        -> Result<LbaT>
    {
        self.channel()?;
        let lbas = self.info.bytes_to_lbas(buf.len())?;
        if lbas == 0 {
            return Ok(0);
        }
        let current = self.current_zone(zone)?;
        let readable = current.check_read(lba, lbas)?;
        if readable > 0 {
            let len = (readable * u64::from(self.info.logical_block_size))
                as usize;
            let cmd = Command::Read { lba, lbas: transfer_len(readable)? };
            let n = self.channel()?
                .execute(cmd, Transfer::FromDevice(&mut buf[..len]))?;
            if n < len {
                return Err(BAD_RESPONSE);
            }
        }
        Ok(readable)
    }

    fn pwrite(&mut self, zone: &mut Zone, buf: &[u8], lba: LbaT)
        -> Result<LbaT>
    {
        self.info.check_writable()?;
        self.channel()?;
        let lbas = self.info.bytes_to_lbas(buf.len())?;
        if lbas == 0 {
            return Ok(0);
        }
        let current = self.current_zone(zone)?;
        current.check_write(lba, lbas)?;
        let cmd = Command::Write { lba, lbas: transfer_len(lbas)? };
        let n = self.channel()?.execute(cmd, Transfer::ToDevice(buf))?;
        if n < buf.len() {
            return Err(BAD_RESPONSE);
        }
        *zone = current.advance(lbas);
        Ok(lbas)
    }

    fn flush(&mut self, lba: LbaT, lbas: LbaT, immediate: bool) -> Result<()>
    {
        match lba.checked_add(lbas) {
            Some(end) if end <= self.info.capacity => (),
            _ => return Err(Error::OutOfRange)
        }
        // Ranges too large for the CDB are flushed through the end instead
        let lbas = u32::try_from(lbas).unwrap_or(0);
        self.channel()?
            .execute(Command::SyncCache { lba, lbas, immediate },
                     Transfer::None)
            .map(drop)
    }

    fn report_zones(&mut self, lba: LbaT, filter: ReportingFilter, max: usize)
        -> Result<ZoneReport>
    {
        self.channel()?;
        if lba >= self.info.capacity {
            return Err(Error::OutOfRange);
        }
        let per_report = self.descriptors_per_report();
        let mut zones = Vec::new();
        let mut total = None;
        let mut next = lba;
        loop {
            let want = (max - zones.len()).min(per_report);
            let page = self.report_page(next, filter, want)?;
            let expected = *total.get_or_insert(page.total);
            let got = page.zones.len();
            zones.extend(page.zones);
            if zones.len() >= max.min(expected) {
                break;
            }
            if got == 0 {
                warn!(lba = next, expected, received = zones.len(),
                      "device returned a short zone report");
                break;
            }
            match zones.last().map(Zone::end) {
                Some(end) if end <= page.max_lba => next = end,
                _ => break
            }
        }
        Ok(ZoneReport { zones, total: total.unwrap_or_default() })
    }

    fn reset_write_pointer(&mut self, target: ResetTarget) -> Result<()> {
        self.info.check_writable()?;
        self.channel()?;
        if let ResetTarget::Zone(lba) = target {
            if lba >= self.info.capacity {
                return Err(Error::OutOfRange);
            }
            let zone = self.zone_at(lba)?;
            if zone.start != lba {
                return Err(Error::OutOfRange);
            }
            match zone.condition {
                _ if !zone.is_sequential() =>
                    return Err(Error::NotResettable),
                ZoneCondition::ReadOnly | ZoneCondition::Offline =>
                    return Err(Error::ReadOnlyZone),
                ZoneCondition::Empty => return Ok(()),
                _ => ()
            }
        }
        self.channel()?
            .execute(Command::ResetWritePointer(target), Transfer::None)
            .map(drop)
    }

    fn close(&mut self) -> Result<()> {
        self.channel = None;
        Ok(())
    }
}

// LCOV_EXCL_STOP
