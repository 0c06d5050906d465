// vim: tw=80
//! Zoned device emulation over ordinary files and block devices

use cfg_if::cfg_if;
#[cfg(test)] use mockall::automock;
use nix::{
    errno::Errno,
    fcntl::{Flock, FlockArg},
};
use serde_derive::{Deserialize, Serialize};
use std::{
    ffi::OsString,
    fmt,
    fs::{File, OpenOptions},
    io::{self, Read, Seek, SeekFrom},
    os::unix::fs::{FileExt, FileTypeExt, MetadataExt},
    path::{Path, PathBuf},
};
use tracing::{debug, warn};

use crate::{
    backend::*,
    config::*,
    label::*,
    types::*,
    zone::{self, *},
};

/// Version of the [`Label`] layout
const LABEL_VERSION: u32 = 1;

/// Offset of the second label slot in a freshly formatted metadata file.
/// Slot offsets are always powers of two no smaller than this.
const MIN_SLOT_LEN: u64 = 4096;

/// Extension appended to a device's file name to form its metadata file name
pub const META_EXTENSION: &str = "zbcmeta";

const CLOSED: Error = Error::IoFailure(Errno::EBADF);

/// Positional I/O on the storage underneath an emulated device.
#[cfg_attr(test, automock)]
pub trait BackingStore: fmt::Debug + Send {
    /// Fill `buf` from `offset`, or fail.
    fn read_at(&self, buf: &mut [u8], offset: u64) -> io::Result<()>;

    /// Write all of `buf` at `offset`, or fail.
    fn write_at(&self, buf: &[u8], offset: u64) -> io::Result<()>;

    fn sync_data(&self) -> io::Result<()>;

    /// Size of the storage in bytes
    fn size(&self) -> io::Result<u64>;
}

impl BackingStore for File {
    fn read_at(&self, buf: &mut [u8], offset: u64) -> io::Result<()> {
        self.read_exact_at(buf, offset)
    }

    fn write_at(&self, buf: &[u8], offset: u64) -> io::Result<()> {
        self.write_all_at(buf, offset)
    }

    fn sync_data(&self) -> io::Result<()> {
        File::sync_data(self)
    }

    fn size(&self) -> io::Result<u64> {
        // Unlike metadata().len(), seeking also works for device nodes.
        let mut f = self;
        f.seek(SeekFrom::End(0))
    }
}

/// The persisted state of an emulated device
#[derive(Debug, Deserialize, Serialize)]
struct Label {
    version: u32,
    /// Bumped on every save.  The newest intact label wins.
    generation: u64,
    /// Capacity in logical blocks at format time
    capacity: LbaT,
    logical_block_size: u32,
    physical_block_size: u32,
    zones: Vec<Zone>,
}

/// Offsets at which a label slot may begin in a metadata file of `file_len`
/// bytes
fn slot_offsets(file_len: u64) -> impl Iterator<Item=u64> {
    std::iter::once(0)
        .chain(std::iter::successors(Some(MIN_SLOT_LEN), |o| o.checked_mul(2)))
        .take_while(move |o| *o < file_len)
}

/// The locked metadata file of an emulated device.
///
/// The file holds two label slots, one at offset 0 and one at `slot_len`.
/// Saves alternate between them, so a torn write can only damage the older
/// copy.  When a label outgrows `slot_len`, it goes to a new second slot at
/// the next power of two, beyond anything written so far.
struct MetaFile {
    file: Flock<File>,
    path: PathBuf,
    slot_len: u64,
    /// Will the next save go to the second slot?
    next_is_second: bool,
    /// Generation of the newest label on disk
    generation: u64,
}

impl fmt::Debug for MetaFile {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MetaFile")
            .field("path", &self.path)
            .finish()
    }
}

impl MetaFile {
    /// Open and lock the metadata file.  Returns `None` if there is no
    /// metadata and none may be created.
    fn open(path: &Path, writable: bool, create: bool) -> Result<Option<Self>>
    {
        let r = OpenOptions::new()
            .read(true)
            .write(writable)
            .create(writable && create)
            .truncate(false)
            .open(path);
        let f = match r {
            Ok(f) => f,
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(Error::from_open(e))
        };
        let arg = if writable {
            FlockArg::LockExclusiveNonblock
        } else {
            FlockArg::LockSharedNonblock
        };
        let file = Flock::lock(f, arg)
            .map_err(|(_f, errno)| Error::IoFailure(errno))?;
        Ok(Some(MetaFile {
            file,
            path: path.to_owned(),
            slot_len: MIN_SLOT_LEN,
            next_is_second: false,
            generation: 0,
        }))
    }

    /// Read the newest intact label.  Returns `None` if the file is empty.
    fn read(&mut self) -> Result<Option<Label>> {
        let mut buf = Vec::new();
        let mut f: &File = &self.file;
        f.seek(SeekFrom::Start(0))?;
        f.read_to_end(&mut buf)?;
        if buf.is_empty() {
            return Ok(None);
        }
        let intact = slot_offsets(buf.len() as u64)
            .filter_map(|offset| {
                let mut lr = LabelReader::new(buf[offset as usize..].to_vec())
                    .ok()?;
                let len = lr.framed_len() as u64;
                let label = lr.deserialize::<Label>().ok()?;
                Some((offset, len, label))
            }).collect::<Vec<_>>();
        let newest = intact.iter()
            .enumerate()
            .max_by_key(|(_, (_, _, label))| label.generation)
            .map(|(i, _)| i)
            .ok_or(CORRUPT)?;
        if intact.len() < 2 {
            debug!(path = ?self.path, "only one intact emulation label");
        }
        let (offset, len) = (intact[newest].0, intact[newest].1);
        if offset == 0 {
            self.slot_len = intact.iter()
                .map(|(o, _, _)| *o)
                .chain([MIN_SLOT_LEN, len.next_power_of_two()])
                .max()
                .unwrap_or(MIN_SLOT_LEN);
            self.next_is_second = true;
        } else {
            self.slot_len = offset;
            self.next_is_second = false;
        }
        let label = intact.into_iter().nth(newest).map(|(_, _, l)| l)
            .ok_or(CORRUPT)?;
        self.generation = label.generation;
        Ok(Some(label))
    }

    /// Save `label` over the older of the two slots, stamping it with the
    /// next generation.
    fn write(&mut self, label: &mut Label) -> Result<()> {
        label.generation = self.generation + 1;
        let mut lw = LabelWriter::new();
        lw.serialize(&*label)?;
        let buf = lw.into_bytes();
        let len = buf.len() as u64;
        let (offset, slot_len) = if len > self.slot_len {
            let grown = len.next_power_of_two();
            (grown, grown)
        } else if self.next_is_second {
            (self.slot_len, self.slot_len)
        } else {
            (0, self.slot_len)
        };
        self.file.write_all_at(&buf, offset)?;
        self.slot_len = slot_len;
        self.next_is_second = offset == 0;
        self.generation = label.generation;
        Ok(())
    }

    fn sync(&self) -> Result<()> {
        self.file.sync_data().map_err(Error::from)
    }
}

/// A zone table too long to count in a [`ZoneT`] is not a usable layout.
fn zone_count(len: usize) -> Result<ZoneT> {
    ZoneT::try_from(len).map_err(|_| Error::InvalidLayout)
}

cfg_if! {
    if #[cfg(target_os = "linux")] {
        fn device_number(rdev: u64) -> String {
            use nix::sys::stat::{major, minor};
            format!("-{}:{}", major(rdev), minor(rdev))
        }
    } else {
        fn device_number(rdev: u64) -> String {
            format!("-{rdev:#x}")
        }
    }
}

/// Where does the emulation metadata for the device at `path` live?
///
/// * A regular file's metadata is `<path>.zbcmeta`, next to the file.
/// * A device node's metadata is `<name>-<major>:<minor>.zbcmeta` in the
///   system's temporary directory (`<name>-<rdev in hex>.zbcmeta` off Linux).
///   Node names are not unique across directories, but device numbers are.
///   The temporary directory is often a tmpfs, which loses the metadata at
///   reboot.  Set [`OpenFlags::meta_dir`] to keep it.
/// * With `meta_dir` set, either kind lives in that directory under the same
///   name it would otherwise get, minus any leading directories.
pub fn meta_path(path: &Path, flags: &OpenFlags) -> Result<PathBuf> {
    let md = std::fs::metadata(path).map_err(Error::from_open)?;
    let ft = md.file_type();
    let mut name = path.file_name().ok_or(Error::NotFound)?.to_owned();
    if ft.is_block_device() || ft.is_char_device() {
        name.push(device_number(md.rdev()));
    }
    name.push(".");
    name.push(META_EXTENSION);
    let dir = match &flags.meta_dir {
        Some(dir) => dir.clone(),
        None if md.is_file() => {
            let mut s = OsString::from(path.as_os_str());
            s.push(".");
            s.push(META_EXTENSION);
            return Ok(PathBuf::from(s));
        },
        None => std::env::temp_dir()
    };
    Ok(dir.join(name))
}

/// `Emulation`: software zones over a file or block device
///
/// The zone table lives in memory and is the only source of truth about zone
/// state.  It is persisted to a separate metadata file after every operation
/// that changes it, and that file is locked for as long as the device is open.
/// The data itself is stored 1:1 in the underlying file: LBA `n` lives at byte
/// offset `n * logical_block_size`.
///
/// Changing the zone layout with `set_zones` leaves the underlying data in
/// place.  Stale data is not visible through sequential zones, because reads
/// stop at the write pointer.
///
/// # Performance
///
/// Every save rewrites the whole label, so each write that moves a write
/// pointer costs O(zones) bytes of metadata I/O on top of the data itself.
/// A zone takes 34 bytes, so a device with 25,000 zones writes about 850 kB of
/// metadata per data write.  Nothing is synced until `flush` or `close`.
#[derive(Debug)]
pub struct Emulation {
    /// `None` once closed
    store: Option<Box<dyn BackingStore>>,
    /// `None` once closed
    meta: Option<MetaFile>,
    info: DeviceInfo,
    zones: Vec<Zone>,
}

impl Emulation {
    /// Vendor identification reported by every emulated device
    pub const VENDOR_ID: &'static str = "zbc-core emulated device";

    /// Open an emulated device on top of an arbitrary store.
    ///
    /// * `store`:      Storage holding the device's data
    /// * `path`:       Name of the device, as reported by `info`
    /// * `meta_path`:  Location of the emulation metadata
    pub fn with_store(store: Box<dyn BackingStore>, path: &Path,
                      meta_path: &Path, flags: &OpenFlags) -> Result<Self>
    {
        let writable = flags.access.writable();
        let mut meta = MetaFile::open(meta_path, writable,
                                      flags.create.is_some())?
            .ok_or(Error::NotAZonedDevice)?;
        let store_bytes = store.size()?;
        let label = match meta.read()? {
            Some(label) => {
                Self::check_label(&label, store_bytes)?;
                label
            },
            // Either freshly created, or left empty by an interrupted format.
            None => match (&flags.create, writable) {
                (Some(config), true) => {
                    let mut label = Self::format(config, store_bytes)?;
                    meta.write(&mut label)?;
                    meta.sync()?;
                    debug!(?meta_path, zones = label.zones.len(),
                           "formatted emulated device");
                    label
                },
                _ => return Err(Error::NotAZonedDevice)
            }
        };
        let zone_count = zone_count(label.zones.len())?;
        let info = DeviceInfo {
            path: path.to_owned(),
            vendor_id: Self::VENDOR_ID.to_owned(),
            model: DeviceModel::HostManaged,
            interface: Interface::Emulated,
            access: flags.access,
            logical_block_size: label.logical_block_size,
            physical_block_size: label.physical_block_size,
            capacity: label.capacity,
            zone_count,
            max_open_zones: 0,
        };
        Ok(Emulation {
            store: Some(store),
            meta: Some(meta),
            info,
            zones: label.zones
        })
    }

    fn check_label(label: &Label, store_bytes: u64) -> Result<()> {
        if label.version != LABEL_VERSION || label.logical_block_size == 0 {
            warn!(version = label.version, "unrecognized emulation metadata");
            return Err(Error::InvalidLayout);
        }
        if label.capacity > store_bytes / u64::from(label.logical_block_size) {
            warn!(capacity = label.capacity, store_bytes,
                  "emulated device has shrunk since it was formatted");
            return Err(Error::InvalidLayout);
        }
        zone::validate_table(&label.zones, label.capacity)
    }

    fn format(config: &EmulationConfig, store_bytes: u64) -> Result<Label> {
        let lbs = config.logical_block_size;
        if lbs == 0 || !lbs.is_power_of_two() {
            return Err(Error::InvalidLayout);
        }
        let capacity = store_bytes / u64::from(lbs);
        let zones = ZoneLayout::uniform(capacity, config.zone_size,
                                        config.conventional_zones)?
            .build(capacity)?;
        Ok(Label {
            version: LABEL_VERSION,
            generation: 0,
            capacity,
            logical_block_size: lbs,
            physical_block_size: config.physical_block_size.max(lbs),
            zones
        })
    }

    /// Find the authoritative copy of a caller's zone reference.
    fn index_of(&self, zone: &Zone) -> Result<usize> {
        self.index_of_start(zone.start)
    }

    /// Find the zone that starts exactly at `lba`.
    fn index_of_start(&self, lba: LbaT) -> Result<usize> {
        zone::zone_index(&self.zones, lba)
            .filter(|i| self.zones[*i].start == lba)
            .ok_or(Error::OutOfRange)
    }

    fn meta(&self) -> Result<&MetaFile> {
        self.meta.as_ref().ok_or(CLOSED)
    }

    fn store(&self) -> Result<&dyn BackingStore> {
        self.store.as_deref().ok_or(CLOSED)
    }

    /// Write the zone table to the metadata file.  This serializes every zone,
    /// not just the ones that changed.
    fn save(&mut self) -> Result<()> {
        let mut label = Label {
            version: LABEL_VERSION,
            generation: 0,
            capacity: self.info.capacity,
            logical_block_size: self.info.logical_block_size,
            physical_block_size: self.info.physical_block_size,
            zones: self.zones.clone()
        };
        self.meta.as_mut().ok_or(CLOSED)?.write(&mut label)
    }

    /// Replace the zone table, persist it, and roll back if that fails.
    fn commit(&mut self, zones: Vec<Zone>) -> Result<()> {
        let old = std::mem::replace(&mut self.zones, zones);
        self.save().inspect_err(|_| self.zones = old)
    }

    /// Replace the zone at index `i`, persist it, and roll back if that
    /// fails.
    fn commit_one(&mut self, i: usize, zone: Zone) -> Result<()> {
        let old = std::mem::replace(&mut self.zones[i], zone);
        if old == zone {
            return Ok(());
        }
        self.save().inspect_err(|_| self.zones[i] = old)
    }

    /// Path of the metadata file, while open
    pub fn meta_path(&self) -> Option<&Path> {
        self.meta.as_ref().map(|m| m.path.as_path())
    }
}

impl Backend for Emulation {
    fn open(path: &Path, flags: &OpenFlags) -> Result<Self> {
        let meta_path = meta_path(path, flags)?;
        let file = OpenOptions::new()
            .read(true)
            .write(flags.access.writable())
            .open(path)
            .map_err(Error::from_open)?;
        Emulation::with_store(Box::new(file), path, &meta_path, flags)
    }

    fn info(&self) -> &DeviceInfo {
        &self.info
    }

    fn pread(&mut self, zone: &Zone, buf: &mut [u8], lba: LbaT)
        -> Result<LbaT>
    {
        let store = self.store()?;
        let lbas = self.info.bytes_to_lbas(buf.len())?;
        if lbas == 0 {
            return Ok(0);
        }
        let current = self.zones[self.index_of(zone)?];
        let readable = current.check_read(lba, lbas)?;
        if readable > 0 {
            let len = (readable * u64::from(self.info.logical_block_size))
                as usize;
            store.read_at(&mut buf[..len], self.info.lba_to_offset(lba))?;
        }
        Ok(readable)
    }

    fn pwrite(&mut self, zone: &mut Zone, buf: &[u8], lba: LbaT)
        -> Result<LbaT>
    {
        self.info.check_writable()?;
        let store = self.store()?;
        let lbas = self.info.bytes_to_lbas(buf.len())?;
        if lbas == 0 {
            return Ok(0);
        }
        let i = self.index_of(zone)?;
        let current = self.zones[i];
        current.check_write(lba, lbas)?;
        store.write_at(buf, self.info.lba_to_offset(lba))?;
        // Only now that the data is down may the write pointer move.
        self.commit_one(i, current.advance(lbas))?;
        *zone = self.zones[i];
        Ok(lbas)
    }

    fn flush(&mut self, lba: LbaT, lbas: LbaT, _immediate: bool) -> Result<()>
    {
        match lba.checked_add(lbas) {
            Some(end) if end <= self.info.capacity => (),
            _ => return Err(Error::OutOfRange)
        }
        self.store()?.sync_data()?;
        if self.info.access.writable() {
            self.meta()?.sync()?;
        }
        Ok(())
    }

    fn report_zones(&mut self, lba: LbaT, filter: ReportingFilter, max: usize)
        -> Result<ZoneReport>
    {
        self.store()?;
        zone::report(&self.zones, lba, filter, max)
    }

    fn reset_write_pointer(&mut self, target: ResetTarget) -> Result<()> {
        self.info.check_writable()?;
        self.store()?;
        match target {
            ResetTarget::Zone(lba) => {
                let i = self.index_of_start(lba)?;
                let z = self.zones[i];
                match z.condition {
                    _ if !z.is_sequential() => Err(Error::NotResettable),
                    ZoneCondition::ReadOnly | ZoneCondition::Offline =>
                        Err(Error::ReadOnlyZone),
                    _ => self.commit_one(i, z.reset())
                }
            },
            ResetTarget::All => {
                let zones = self.zones.iter()
                    .map(|z| match z.condition {
                        _ if !z.is_sequential() => *z,
                        ZoneCondition::ReadOnly | ZoneCondition::Offline => *z,
                        _ => z.reset()
                    }).collect::<Vec<_>>();
                if zones != self.zones {
                    self.commit(zones)
                } else {
                    Ok(())
                }
            }
        }
    }

    fn set_zones(&mut self, layout: &ZoneLayout) -> Result<()> {
        self.info.check_writable()?;
        self.store()?;
        let zones = layout.build(self.info.capacity)?;
        let zone_count = zone_count(zones.len())?;
        self.commit(zones)?;
        self.info.zone_count = zone_count;
        debug!(zones = self.zones.len(), "replaced emulated zone layout");
        Ok(())
    }

    fn set_write_pointer(&mut self, lba: LbaT, wp: LbaT) -> Result<()> {
        self.info.check_writable()?;
        self.store()?;
        let i = self.index_of_start(lba)?;
        let z = self.zones[i];
        if matches!(z.condition, ZoneCondition::ReadOnly | ZoneCondition::Offline)
        {
            return Err(Error::ReadOnlyZone);
        }
        self.commit_one(i, z.with_write_pointer(wp)?)
    }

    fn zone_at(&mut self, lba: LbaT) -> Result<Zone> {
        self.store()?;
        zone::zone_index(&self.zones, lba)
            .map(|i| self.zones[i])
            .ok_or(Error::OutOfRange)
    }

    fn close(&mut self) -> Result<()> {
        let r = if self.store.is_some() && self.info.access.writable() {
            self.save().and_then(|_| self.meta()?.sync())
        } else {
            Ok(())
        };
        // Dropping the MetaFile releases the lock
        self.meta = None;
        self.store = None;
        r
    }
}

// LCOV_EXCL_STOP
