// vim: tw=80
//! SCSI generic passthrough for Linux
//!
//! Encodes [`Command`]s as SCSI CDBs and submits them through the `SG_IO`
//! ioctl, which works on both `/dev/sgN` and `/dev/sdX` nodes.  ZAC drives are
//! reached the same way, through the kernel's SCSI/ATA translation layer.

use byteorder::{BigEndian, ByteOrder};
use nix::errno::Errno;
use std::{
    fs::{File, OpenOptions},
    os::{fd::AsRawFd, unix::fs::OpenOptionsExt},
    path::Path,
    ptr,
};
use tracing::debug;

use crate::{
    backend::ResetTarget,
    config::*,
    hardware::*,
    types::*,
};

/// FFI definitions that don't belong in libc.  The ioctl can't go in libc
/// because it uses Nix's macros.
#[doc(hidden)]
mod ffi {
    use nix::{
        ioctl_readwrite_bad,
        libc::{c_int, c_uchar, c_uint, c_ushort, c_void}
    };

    pub const SG_INTERFACE_ID_ORIG: c_int = b'S' as c_int;
    pub const SG_DXFER_NONE: c_int = -1;
    pub const SG_DXFER_TO_DEV: c_int = -2;
    pub const SG_DXFER_FROM_DEV: c_int = -3;
    pub const SG_INFO_OK_MASK: c_uint = 0x1;
    pub const SG_INFO_OK: c_uint = 0x0;
    pub const DID_TIME_OUT: c_ushort = 0x03;

    /// From <scsi/sg.h>
    #[repr(C)]
    #[allow(non_camel_case_types)]
    pub struct sg_io_hdr {
        pub interface_id: c_int,
        pub dxfer_direction: c_int,
        pub cmd_len: c_uchar,
        pub mx_sb_len: c_uchar,
        pub iovec_count: c_ushort,
        pub dxfer_len: c_uint,
        pub dxferp: *mut c_void,
        pub cmdp: *mut c_uchar,
        pub sbp: *mut c_uchar,
        pub timeout: c_uint,
        pub flags: c_uint,
        pub pack_id: c_int,
        pub usr_ptr: *mut c_void,
        pub status: c_uchar,
        pub masked_status: c_uchar,
        pub msg_status: c_uchar,
        pub sb_len_wr: c_uchar,
        pub host_status: c_ushort,
        pub driver_status: c_ushort,
        pub resid: c_int,
        pub duration: c_uint,
        pub info: c_uint,
    }

    ioctl_readwrite_bad! {
        /// Submit a SCSI command and wait for it to complete
        #[doc(hidden)]
        sg_io, 0x2285, sg_io_hdr
    }
}

const SENSE_LEN: usize = 64;

/// Opcodes and service actions
const INQUIRY: u8 = 0x12;
const READ_16: u8 = 0x88;
const WRITE_16: u8 = 0x8a;
const SYNCHRONIZE_CACHE_16: u8 = 0x91;
const ZBC_OUT: u8 = 0x94;
const ZBC_IN: u8 = 0x95;
const SERVICE_ACTION_IN_16: u8 = 0x9e;
const SA_READ_CAPACITY_16: u8 = 0x10;
const SA_REPORT_ZONES: u8 = 0x00;
const SA_RESET_WRITE_POINTER: u8 = 0x04;

/// Encode `cmd` as a CDB, with an allocation length of `alloc_len` bytes for
/// commands that return data.
pub fn encode(cmd: &Command, alloc_len: usize) -> Vec<u8> {
    let alloc32 = u32::try_from(alloc_len).unwrap_or(u32::MAX);
    match *cmd {
        Command::Inquiry | Command::InquiryVpd(_) => {
            let mut cdb = vec![0u8; 6];
            cdb[0] = INQUIRY;
            if let Command::InquiryVpd(page) = *cmd {
                cdb[1] = 0x01;
                cdb[2] = page;
            }
            let alloc16 = u16::try_from(alloc_len).unwrap_or(u16::MAX);
            BigEndian::write_u16(&mut cdb[3..5], alloc16);
            cdb
        },
        Command::ReadCapacity => {
            let mut cdb = vec![0u8; 16];
            cdb[0] = SERVICE_ACTION_IN_16;
            cdb[1] = SA_READ_CAPACITY_16;
            BigEndian::write_u32(&mut cdb[10..14], alloc32);
            cdb
        },
        Command::Read { lba, lbas } | Command::Write { lba, lbas } => {
            let mut cdb = vec![0u8; 16];
            cdb[0] = if matches!(cmd, Command::Read {..}) {
                READ_16
            } else {
                WRITE_16
            };
            BigEndian::write_u64(&mut cdb[2..10], lba);
            BigEndian::write_u32(&mut cdb[10..14], lbas);
            cdb
        },
        Command::SyncCache { lba, lbas, immediate } => {
            let mut cdb = vec![0u8; 16];
            cdb[0] = SYNCHRONIZE_CACHE_16;
            if immediate {
                cdb[1] = 0x02;
            }
            BigEndian::write_u64(&mut cdb[2..10], lba);
            BigEndian::write_u32(&mut cdb[10..14], lbas);
            cdb
        },
        Command::ReportZones { lba, filter } => {
            let mut cdb = vec![0u8; 16];
            cdb[0] = ZBC_IN;
            cdb[1] = SA_REPORT_ZONES;
            BigEndian::write_u64(&mut cdb[2..10], lba);
            BigEndian::write_u32(&mut cdb[10..14], alloc32);
            // PARTIAL is clear, so the list length counts every match
            cdb[14] = u8::from(filter) & 0x3f;
            cdb
        },
        Command::ResetWritePointer(target) => {
            let mut cdb = vec![0u8; 16];
            cdb[0] = ZBC_OUT;
            cdb[1] = SA_RESET_WRITE_POINTER;
            match target {
                ResetTarget::Zone(lba) =>
                    BigEndian::write_u64(&mut cdb[2..10], lba),
                ResetTarget::All => cdb[14] = 0x01
            }
            cdb
        }
    }
}

/// Translate SCSI sense data into an error.
pub fn decode_sense(sense: &[u8]) -> Error {
    let (asc, ascq) = match sense.first().map(|b| b & 0x7f) {
        // Fixed format
        Some(0x70 | 0x71) if sense.len() >= 14 => (sense[12], sense[13]),
        // Descriptor format
        Some(0x72 | 0x73) if sense.len() >= 4 => (sense[2], sense[3]),
        _ => return Error::IoFailure(Errno::EIO)
    };
    match (asc, ascq) {
        (0x21, 0x04) => Error::SequentialOrderViolation,
        (0x21, _) => Error::OutOfRange,
        (0x27, _) => Error::ReadOnlyZone,
        (0x20, _) => Error::Unsupported,
        _ => Error::IoFailure(Errno::EIO)
    }
}

/// `SgChannel`: delivers commands to a device node through `SG_IO`
#[derive(Debug)]
pub struct SgChannel {
    file: File,
    timeout_ms: u32,
}

impl SgChannel {
    pub fn open(path: &Path, flags: &OpenFlags) -> Result<Self> {
        let file = OpenOptions::new()
            .read(true)
            .write(flags.access.writable())
            .custom_flags(libc::O_NONBLOCK)
            .open(path)
            .map_err(Error::from_open)?;
        Ok(SgChannel {
            file,
            timeout_ms: flags.hardware.command_timeout_ms
        })
    }
}

impl CommandChannel for SgChannel {
    fn execute(&mut self, cmd: Command, data: Transfer<'_>) -> Result<usize> {
        let (direction, dxferp, dxfer_len) = match data {
            Transfer::None => (ffi::SG_DXFER_NONE, ptr::null_mut(), 0),
            Transfer::FromDevice(buf) =>
                (ffi::SG_DXFER_FROM_DEV, buf.as_mut_ptr(), buf.len()),
            // The kernel only reads through dxferp for SG_DXFER_TO_DEV
            Transfer::ToDevice(buf) =>
                (ffi::SG_DXFER_TO_DEV, buf.as_ptr() as *mut u8, buf.len()),
        };
        let dxfer_len = u32::try_from(dxfer_len)
            .map_err(|_| Error::IoFailure(Errno::EINVAL))?;
        let mut cdb = encode(&cmd, dxfer_len as usize);
        let mut sense = [0u8; SENSE_LEN];
        let mut hdr = ffi::sg_io_hdr {
            interface_id: ffi::SG_INTERFACE_ID_ORIG,
            dxfer_direction: direction,
            cmd_len: cdb.len() as u8,
            mx_sb_len: SENSE_LEN as u8,
            iovec_count: 0,
            dxfer_len,
            dxferp: dxferp.cast(),
            cmdp: cdb.as_mut_ptr(),
            sbp: sense.as_mut_ptr(),
            timeout: self.timeout_ms,
            flags: 0,
            pack_id: 0,
            usr_ptr: ptr::null_mut(),
            status: 0,
            masked_status: 0,
            msg_status: 0,
            sb_len_wr: 0,
            host_status: 0,
            driver_status: 0,
            resid: 0,
            duration: 0,
            info: 0,
        };
        // Safe because every pointer in hdr refers to a buffer that outlives
        // the synchronous ioctl, and each length matches its buffer.
        unsafe {
            ffi::sg_io(self.file.as_raw_fd(), &mut hdr)
        }?;
        if hdr.info & ffi::SG_INFO_OK_MASK != ffi::SG_INFO_OK {
            let e = if hdr.host_status == ffi::DID_TIME_OUT {
                Error::IoFailure(Errno::ETIMEDOUT)
            } else {
                let len = usize::from(hdr.sb_len_wr).min(SENSE_LEN);
                decode_sense(&sense[..len])
            };
            debug!(?cmd, status = hdr.status, host = hdr.host_status,
                   driver = hdr.driver_status, error = ?e, "command failed");
            return Err(e);
        }
        let resid = usize::try_from(hdr.resid).unwrap_or(0);
        Ok((dxfer_len as usize).saturating_sub(resid))
    }
}

// LCOV_EXCL_STOP
