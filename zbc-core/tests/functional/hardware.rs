// vim: tw=80
//! The hardware backend, driven through the ZBC simulator
use std::path::Path;

use nix::errno::Errno;
use pretty_assertions::assert_eq;
use rstest::{fixture, rstest};

use zbc_core::{
    hardware::*,
    Access,
    Backend,
    Device,
    DeviceModel,
    Error,
    HardwareConfig,
    Interface,
    OpenFlags,
    ReportingFilter,
    ResetTarget,
    Zone,
    ZoneCondition,
    ZoneLayout,
    ZoneType,
};

use super::{LBS, pattern, simulator::*};

const CAPACITY: u64 = 4096;

struct Harness {
    dev: Device,
    sim: SimChannel,
}

fn open(state: SimState, flags: &OpenFlags) -> zbc_core::Result<Harness> {
    let sim = SimChannel::new(state);
    let hw = Hardware::with_channel(Path::new("/dev/sg7"),
                                    Box::new(sim.clone()), flags)?;
    Ok(Harness { dev: Device::from_backend(Box::new(hw)), sim })
}

fn layout() -> ZoneLayout {
    ZoneLayout::uniform(CAPACITY, 256, 2).unwrap()
}

#[fixture]
fn harness() -> Harness {
    let state = SimState::host_managed(CAPACITY, &layout());
    open(state, &OpenFlags::new()).unwrap()
}

mod identify {
    use super::*;
    use pretty_assertions::assert_eq;

    #[rstest]
    fn host_managed(harness: Harness) {
        let info = harness.dev.info();
        assert_eq!(info.model, DeviceModel::HostManaged);
        assert_eq!(info.interface, Interface::Zbc);
        assert_eq!(info.vendor_id, "ZBCSIM Virtual ZBC 0100");
        assert_eq!(info.capacity, CAPACITY);
        assert_eq!(info.logical_block_size, 512);
        assert_eq!(info.physical_block_size, 4096);
        assert_eq!(info.max_open_zones, 128);
        assert_eq!(info.zone_count, 16);
        assert_eq!(info.access, Access::ReadWrite);
    }

    #[test]
    fn host_aware() {
        let mut state = SimState::host_managed(CAPACITY, &layout());
        state.peripheral = PERIPHERAL_DIRECT_ACCESS;
        state.zoned = 1;
        let h = open(state, &OpenFlags::new()).unwrap();
        assert_eq!(h.dev.info().model, DeviceModel::HostAware);
    }

    /// An ordinary disk
    #[test]
    fn not_zoned() {
        let mut state = SimState::host_managed(CAPACITY, &layout());
        state.peripheral = PERIPHERAL_DIRECT_ACCESS;
        let e = open(state, &OpenFlags::new()).err().unwrap();
        assert_eq!(e, Error::NotAZonedDevice);
    }

    /// Tape drives are right out
    #[test]
    fn wrong_peripheral_type() {
        let mut state = SimState::host_managed(CAPACITY, &layout());
        state.peripheral = 0x01;
        let e = open(state, &OpenFlags::new()).err().unwrap();
        assert_eq!(e, Error::NotAZonedDevice);
    }

    /// ZAC drives show up through the SCSI/ATA translation layer
    #[test]
    fn zac() {
        let mut state = SimState::host_managed(CAPACITY, &layout());
        state.vendor = "ATA";
        let h = open(state, &OpenFlags::new()).unwrap();
        assert_eq!(h.dev.info().interface, Interface::Zac);
    }

    #[test]
    fn unlimited_open_zones() {
        let mut state = SimState::host_managed(CAPACITY, &layout());
        state.max_open = u32::MAX;
        let h = open(state, &OpenFlags::new()).unwrap();
        assert_eq!(h.dev.info().max_open_zones, 0);
    }
}

mod pwrite {
    use super::*;
    use pretty_assertions::assert_eq;

    /// Zone 1000 from the canonical example of the sequential write rule
    #[test]
    fn sequential_order() {
        let layout: ZoneLayout = vec![
            (1000, ZoneType::Conventional),
            (1000, ZoneType::SequentialWriteRequired),
            (2096, ZoneType::SequentialWriteRequired),
        ].into_iter().collect();
        let state = SimState::host_managed(CAPACITY, &layout);
        let mut h = open(state, &OpenFlags::new()).unwrap();
        let buf = pattern(1000, 8);
        assert_eq!(h.dev.pwrite(&buf, 1000), Ok(8));
        assert_eq!(h.dev.zone(1000).unwrap().write_pointer, 1008);
        assert_eq!(h.dev.pwrite(&buf, 1000),
                   Err(Error::SequentialOrderViolation));
        assert_eq!(h.dev.pwrite(&buf, 1008), Ok(8));
        assert_eq!(h.dev.zone(1000).unwrap().write_pointer, 1016);
    }

    /// Writes that the device would reject are never sent
    #[rstest]
    fn prevalidated(mut harness: Harness) {
        let mut zone = harness.dev.zone(512).unwrap();
        let buf = vec![0u8; 8 * LBS];
        assert_eq!(harness.dev.pwrite_zone(&mut zone, &buf, 520),
                   Err(Error::SequentialOrderViolation));
        assert_eq!(harness.dev.pwrite_zone(&mut zone, &buf, 764),
                   Err(Error::OutOfRange));
        assert_eq!(harness.dev.pwrite_zone(&mut zone, &buf[1..], 512),
                   Err(Error::Unaligned));
        let sim = harness.sim.0.lock().unwrap();
        assert_eq!(sim.count(|c| matches!(c, Command::Write {..})), 0);
    }

    /// Writes are checked against the device's zone, not the caller's copy
    #[rstest]
    fn stale_zone_behind(mut harness: Harness) {
        let mut stale = harness.dev.zone(512).unwrap();
        let buf = vec![0u8; 8 * LBS];
        harness.dev.pwrite(&buf, 512).unwrap();
        assert_eq!(harness.dev.pwrite_zone(&mut stale, &buf, 512),
                   Err(Error::SequentialOrderViolation));
        assert_eq!(stale.write_pointer, 512);
        assert_eq!(harness.dev.pwrite_zone(&mut stale, &buf, 520), Ok(8));
        assert_eq!(stale.write_pointer, 528);
    }

    /// A zone reference taken before a reset still works after it
    #[rstest]
    fn stale_zone_after_reset(mut harness: Harness) {
        let buf = vec![0u8; 256 * LBS];
        harness.dev.pwrite(&buf, 512).unwrap();
        let mut stale = harness.dev.zone(512).unwrap();
        assert_eq!(stale.condition, ZoneCondition::Full);
        harness.dev.reset_write_pointer(ResetTarget::Zone(512)).unwrap();
        assert_eq!(harness.dev.pwrite_zone(&mut stale, &buf[..8 * LBS], 512),
                   Ok(8));
        assert_eq!(stale.write_pointer, 520);
        assert_eq!(stale.condition, ZoneCondition::ImplicitOpen);

        // Reads aren't truncated at the old write pointer either
        let mut full = harness.dev.zone(768).unwrap();
        harness.dev.pwrite_zone(&mut full, &buf[..8 * LBS], 768).unwrap();
        let old = full;
        harness.dev.pwrite_zone(&mut full, &buf[..8 * LBS], 776).unwrap();
        let mut rbuf = vec![0u8; 16 * LBS];
        assert_eq!(harness.dev.pread_zone(&old, &mut rbuf, 768), Ok(16));
    }

    #[rstest]
    fn advances_callers_zone(mut harness: Harness) {
        let mut zone = harness.dev.zone(512).unwrap();
        for i in 0..4 {
            let lba = 512 + i * 64;
            let buf = pattern(lba, 64);
            assert_eq!(harness.dev.pwrite_zone(&mut zone, &buf, lba), Ok(64));
        }
        assert_eq!(zone.condition, ZoneCondition::Full);
        assert_eq!(harness.dev.zone(512).unwrap(), zone);
        // A full zone is reported as such, wherever the write was aimed
        let buf = vec![0u8; LBS];
        assert_eq!(harness.dev.pwrite_zone(&mut zone, &buf, 768),
                   Err(Error::ZoneFull));
        assert_eq!(harness.dev.pwrite_zone(&mut zone, &buf, 600),
                   Err(Error::ZoneFull));
    }

    #[rstest]
    fn io_failure(mut harness: Harness) {
        harness.sim.0.lock().unwrap().fail_next_write = true;
        let mut zone = harness.dev.zone(512).unwrap();
        let before = zone;
        let buf = vec![0u8; 8 * LBS];
        assert_eq!(harness.dev.pwrite_zone(&mut zone, &buf, 512),
                   Err(Error::IoFailure(Errno::EIO)));
        assert_eq!(zone, before);
        assert_eq!(harness.dev.zone(512).unwrap(), before);
    }

    #[test]
    fn read_only_handle() {
        let state = SimState::host_managed(CAPACITY, &layout());
        let mut h = open(state, &OpenFlags::new().read_only()).unwrap();
        let buf = vec![0u8; LBS];
        assert_eq!(h.dev.pwrite(&buf, 0), Err(Error::PermissionDenied));
        assert_eq!(h.dev.reset_write_pointer(ResetTarget::All),
                   Err(Error::PermissionDenied));
    }
}

mod pread {
    use super::*;
    use pretty_assertions::assert_eq;

    #[rstest]
    fn clamped_at_write_pointer(mut harness: Harness) {
        let wbuf = pattern(512, 8);
        harness.dev.pwrite(&wbuf, 512).unwrap();
        let mut rbuf = vec![0u8; 16 * LBS];
        assert_eq!(harness.dev.pread(&mut rbuf, 512), Ok(8));
        assert_eq!(&rbuf[..8 * LBS], &wbuf[..]);
        assert_eq!(harness.dev.pread(&mut rbuf, 520), Ok(0));
        let sim = harness.sim.0.lock().unwrap();
        assert_eq!(sim.count(|c| matches!(c, Command::Read {..})), 1);
    }

    #[rstest]
    fn conventional(mut harness: Harness) {
        let wbuf = pattern(100, 4);
        harness.dev.pwrite(&wbuf, 100).unwrap();
        let mut rbuf = vec![0u8; 4 * LBS];
        assert_eq!(harness.dev.pread(&mut rbuf, 100), Ok(4));
        assert_eq!(rbuf, wbuf);
    }
}

mod report_zones {
    use super::*;
    use pretty_assertions::assert_eq;

    #[rstest]
    fn conventional_normalized(mut harness: Harness) {
        let z = harness.dev.zone(0).unwrap();
        assert_eq!(z, Zone::conventional(0, 256));
    }

    #[rstest]
    fn truncated(mut harness: Harness) {
        let r = harness.dev.report_zones(0, ReportingFilter::All, 5).unwrap();
        assert_eq!(r.zones.len(), 5);
        assert_eq!(r.total, 16);
        assert_eq!(r.next_lba(), Some(1280));
    }

    #[rstest]
    fn count_only(mut harness: Harness) {
        assert_eq!(harness.dev.report_nr_zones(0, ReportingFilter::Empty),
                   Ok(14));
        assert_eq!(harness.dev.report_nr_zones(600, ReportingFilter::All),
                   Ok(14));
    }

    #[rstest]
    fn past_the_end(mut harness: Harness) {
        assert_eq!(harness.dev.report_zones(CAPACITY, ReportingFilter::All, 1),
                   Err(Error::OutOfRange));
    }

    /// Large reports are split into several commands
    #[test]
    fn chunked() {
        let state = SimState::host_managed(CAPACITY,
            &ZoneLayout::uniform(CAPACITY, 16, 4).unwrap());
        let flags = OpenFlags::new().hardware(HardwareConfig {
            max_report_bytes: (REPORT_HEADER_LEN + 64 * DESCRIPTOR_LEN) as u32,
            ..Default::default()
        });
        let mut h = open(state, &flags).unwrap();
        h.sim.0.lock().unwrap().log.clear();
        let r = h.dev.report_zones(0, ReportingFilter::All, usize::MAX)
            .unwrap();
        assert_eq!(r.total, 256);
        assert_eq!(r.zones, h.sim.0.lock().unwrap().zones);
        let sim = h.sim.0.lock().unwrap();
        assert_eq!(sim.count(|c| matches!(c, Command::ReportZones {..})), 4);
    }

    /// Chunking works with filters, too
    #[test]
    fn chunked_filtered() {
        let state = SimState::host_managed(CAPACITY,
            &ZoneLayout::uniform(CAPACITY, 16, 4).unwrap());
        let flags = OpenFlags::new().hardware(HardwareConfig {
            max_report_bytes: (REPORT_HEADER_LEN + 10 * DESCRIPTOR_LEN) as u32,
            ..Default::default()
        });
        let mut h = open(state, &flags).unwrap();
        let buf = vec![0u8; LBS];
        for lba in (64..CAPACITY).step_by(32) {
            h.dev.pwrite(&buf, lba).unwrap();
        }
        let r = h.dev.report_zones(0, ReportingFilter::ImplicitOpen, 25)
            .unwrap();
        assert_eq!(r.total, 126);
        assert_eq!(r.zones.len(), 25);
        assert!(r.zones.iter().all(|z| z.start % 32 == 0));
    }

    #[rstest]
    fn list_zones(mut harness: Harness) {
        let zones = harness.dev.list_zones().unwrap();
        assert_eq!(zones, harness.sim.0.lock().unwrap().zones);
    }

    /// Nothing is cached: changes made behind our back are visible at once
    #[rstest]
    fn not_cached(mut harness: Harness) {
        harness.dev.zone(512).unwrap();
        {
            let mut sim = harness.sim.0.lock().unwrap();
            sim.zones[2] = sim.zones[2].advance(10);
        }
        assert_eq!(harness.dev.zone(512).unwrap().write_pointer, 522);
    }
}

mod reset {
    use super::*;
    use pretty_assertions::assert_eq;

    #[rstest]
    fn one(mut harness: Harness) {
        let buf = vec![0u8; 8 * LBS];
        harness.dev.pwrite(&buf, 512).unwrap();
        harness.dev.reset_write_pointer(ResetTarget::Zone(512)).unwrap();
        let z = harness.dev.zone(512).unwrap();
        assert_eq!(z.write_pointer, 512);
        assert_eq!(z.condition, ZoneCondition::Empty);
    }

    /// Resetting an empty zone succeeds without bothering the device
    #[rstest]
    fn empty(mut harness: Harness) {
        harness.dev.reset_write_pointer(ResetTarget::Zone(512)).unwrap();
        let sim = harness.sim.0.lock().unwrap();
        assert_eq!(sim.count(|c| matches!(c, Command::ResetWritePointer(_))),
                   0);
    }

    #[rstest]
    fn conventional(mut harness: Harness) {
        assert_eq!(harness.dev.reset_write_pointer(ResetTarget::Zone(256)),
                   Err(Error::NotResettable));
    }

    #[rstest]
    fn not_zone_start(mut harness: Harness) {
        assert_eq!(harness.dev.reset_write_pointer(ResetTarget::Zone(513)),
                   Err(Error::OutOfRange));
    }

    #[rstest]
    fn all(mut harness: Harness) {
        let buf = vec![0u8; 8 * LBS];
        for lba in [100, 512, 768, 1024] {
            harness.dev.pwrite(&buf, lba).unwrap();
        }
        harness.dev.reset_write_pointer(ResetTarget::All).unwrap();
        let zones = harness.dev.list_zones().unwrap();
        assert_eq!(zones, layout().build(CAPACITY).unwrap());
    }
}

#[rstest]
fn set_zones_unsupported(mut harness: Harness) {
    assert_eq!(harness.dev.set_zones(&layout()), Err(Error::Unsupported));
    assert_eq!(harness.dev.set_write_pointer(512, 520),
               Err(Error::Unsupported));
}

#[rstest]
fn flush(mut harness: Harness) {
    harness.dev.flush(0, CAPACITY, true).unwrap();
    assert_eq!(harness.dev.flush(1, CAPACITY, false), Err(Error::OutOfRange));
    let sim = harness.sim.0.lock().unwrap();
    assert_eq!(sim.log.last(), Some(&Command::SyncCache {
        lba: 0,
        lbas: CAPACITY as u32,
        immediate: true
    }));
}

#[rstest]
fn close(mut harness: Harness) {
    harness.dev.close().unwrap();
    harness.dev.close().unwrap();
    assert_eq!(harness.dev.zone(0), Err(Error::IoFailure(Errno::EBADF)));
}

/// The backend can be used without a Device, too
#[test]
fn bare_backend() {
    let sim = SimChannel::new(SimState::host_managed(CAPACITY, &layout()));
    let mut hw = Hardware::with_channel(Path::new("/dev/sg7"), Box::new(sim),
                                        &OpenFlags::new()).unwrap();
    assert_eq!(hw.zone_at(300).unwrap().start, 256);
    hw.close().unwrap();
    hw.close().unwrap();
    assert_eq!(hw.zone_at(300), Err(Error::IoFailure(Errno::EBADF)));
}
