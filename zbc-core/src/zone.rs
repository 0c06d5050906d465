// vim: tw=80
//! The zone data model
//!
//! Plain values describing zones and zone tables, plus the predicates that
//! every backend uses to validate I/O before issuing it.

use itertools::Itertools;
use num_enum::{IntoPrimitive, TryFromPrimitive};
use serde_derive::{Deserialize, Serialize};
use std::fmt;

use crate::types::*;

/// Write rules of a zone.  Discriminants are the ZBC zone type codes.
#[derive(Clone, Copy, Debug, Deserialize, Eq, Hash, IntoPrimitive, PartialEq,
         Serialize, TryFromPrimitive)]
#[repr(u8)]
pub enum ZoneType {
    /// Random writes allowed; no write pointer.
    Conventional = 0x1,
    /// Writes must start exactly at the write pointer.
    SequentialWriteRequired = 0x2,
    /// Sequential writes are preferred, but the device itself tolerates
    /// random writes.  This layer enforces the same ordering as for
    /// `SequentialWriteRequired` zones.
    SequentialWritePreferred = 0x3,
}

/// Lifecycle state of a zone.  Discriminants are the ZBC condition codes.
#[derive(Clone, Copy, Debug, Deserialize, Eq, Hash, IntoPrimitive, PartialEq,
         Serialize, TryFromPrimitive)]
#[repr(u8)]
pub enum ZoneCondition {
    /// The only condition a conventional zone ever has.
    NotWritePointer = 0x0,
    Empty = 0x1,
    ImplicitOpen = 0x2,
    ExplicitOpen = 0x3,
    Closed = 0x4,
    Inactive = 0x5,
    ReadOnly = 0xd,
    Full = 0xe,
    Offline = 0xf,
}

impl fmt::Display for ZoneCondition {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            ZoneCondition::NotWritePointer => "Not-write-pointer",
            ZoneCondition::Empty => "Empty",
            ZoneCondition::ImplicitOpen => "Implicit-open",
            ZoneCondition::ExplicitOpen => "Explicit-open",
            ZoneCondition::Closed => "Closed",
            ZoneCondition::Inactive => "Inactive",
            ZoneCondition::ReadOnly => "Read-only",
            ZoneCondition::Full => "Full",
            ZoneCondition::Offline => "Offline",
        };
        f.write_str(s)
    }
}

/// Selects which zones a report returns.  Discriminants are the ZBC
/// REPORTING OPTIONS codes.
#[derive(Clone, Copy, Debug, Default, Deserialize, Eq, Hash, IntoPrimitive,
         PartialEq, Serialize, TryFromPrimitive)]
#[repr(u8)]
pub enum ReportingFilter {
    #[default]
    All = 0x00,
    Empty = 0x01,
    ImplicitOpen = 0x02,
    ExplicitOpen = 0x03,
    Closed = 0x04,
    Full = 0x05,
    ReadOnly = 0x06,
    Offline = 0x07,
    ResetRecommended = 0x10,
    NonSequentialWritten = 0x11,
    /// Conventional zones only
    NotWritePointer = 0x3f,
}

impl ReportingFilter {
    pub fn matches(self, zone: &Zone) -> bool {
        use ZoneCondition as C;

        match self {
            ReportingFilter::All => true,
            ReportingFilter::Empty => zone.condition == C::Empty,
            ReportingFilter::ImplicitOpen => zone.condition == C::ImplicitOpen,
            ReportingFilter::ExplicitOpen => zone.condition == C::ExplicitOpen,
            ReportingFilter::Closed => zone.condition == C::Closed,
            ReportingFilter::Full => zone.condition == C::Full,
            ReportingFilter::ReadOnly => zone.condition == C::ReadOnly,
            ReportingFilter::Offline => zone.condition == C::Offline,
            ReportingFilter::ResetRecommended => zone.flags.reset_recommended,
            ReportingFilter::NonSequentialWritten => zone.flags.non_seq,
            ReportingFilter::NotWritePointer =>
                zone.condition == C::NotWritePointer,
        }
    }
}

/// Zone attribute bits, as reported in a ZBC zone descriptor.
#[derive(Clone, Copy, Debug, Default, Deserialize, Eq, Hash, PartialEq,
         Serialize)]
pub struct ZoneFlags {
    /// The device recommends resetting this zone's write pointer.
    pub reset_recommended: bool,
    /// Non-sequential write resources are active for this zone.
    pub non_seq: bool,
}

/// One zone of a zoned device.  All addresses are in logical blocks.
#[derive(Clone, Copy, Debug, Deserialize, Eq, Hash, PartialEq, Serialize)]
pub struct Zone {
    /// First LBA of the zone
    pub start: LbaT,
    /// Number of LBAs in the zone
    pub len: LbaT,
    pub zone_type: ZoneType,
    pub condition: ZoneCondition,
    /// Next LBA that may be written.  For conventional zones it always equals
    /// `start` and carries no meaning.
    pub write_pointer: LbaT,
    pub flags: ZoneFlags,
}

impl Zone {
    /// Construct a conventional zone
    pub fn conventional(start: LbaT, len: LbaT) -> Self {
        Zone {
            start,
            len,
            zone_type: ZoneType::Conventional,
            condition: ZoneCondition::NotWritePointer,
            write_pointer: start,
            flags: ZoneFlags::default()
        }
    }

    /// Construct an empty zone of the given type
    pub fn empty(start: LbaT, len: LbaT, zone_type: ZoneType) -> Self {
        if zone_type == ZoneType::Conventional {
            Zone::conventional(start, len)
        } else {
            Zone {
                start,
                len,
                zone_type,
                condition: ZoneCondition::Empty,
                write_pointer: start,
                flags: ZoneFlags::default()
            }
        }
    }

    /// Advance the write pointer by `lbas` blocks after a successful write.
    ///
    /// The resulting condition is `Full` once the write pointer reaches the
    /// end of the zone.  Otherwise an explicitly opened zone stays explicitly
    /// open, and anything else becomes implicitly open.  Conventional zones
    /// are returned unchanged.
    pub fn advance(&self, lbas: LbaT) -> Self {
        if !self.is_sequential() {
            return *self;
        }
        let write_pointer = self.write_pointer + lbas;
        debug_assert!(write_pointer <= self.end());
        let condition = if write_pointer >= self.end() {
            ZoneCondition::Full
        } else if self.condition == ZoneCondition::ExplicitOpen {
            ZoneCondition::ExplicitOpen
        } else {
            ZoneCondition::ImplicitOpen
        };
        Zone { write_pointer, condition, ..*self }
    }

    /// Validate a write of `lbas` blocks at `lba`, without issuing it.
    pub fn check_write(&self, lba: LbaT, lbas: LbaT) -> Result<()> {
        match self.condition {
            ZoneCondition::ReadOnly | ZoneCondition::Offline =>
                return Err(Error::ReadOnlyZone),
            ZoneCondition::Full if self.is_sequential() =>
                return Err(Error::ZoneFull),
            _ => ()
        }
        if !self.contains_range(lba, lbas) {
            Err(Error::OutOfRange)
        } else if self.is_sequential() && lba != self.write_pointer {
            Err(Error::SequentialOrderViolation)
        } else {
            Ok(())
        }
    }

    /// Validate a read of `lbas` blocks at `lba`, and return how many blocks
    /// may actually be read.
    ///
    /// Reads from sequential zones stop at the write pointer, so the result
    /// may be smaller than `lbas`.
    pub fn check_read(&self, lba: LbaT, lbas: LbaT) -> Result<LbaT> {
        if self.condition == ZoneCondition::Offline {
            return Err(Error::ReadOnlyZone);
        }
        if !self.contains_range(lba, lbas) {
            return Err(Error::OutOfRange);
        }
        if self.is_sequential() && self.condition != ZoneCondition::Full {
            Ok(self.write_pointer.saturating_sub(lba).min(lbas))
        } else {
            Ok(lbas)
        }
    }

    /// Does the zone contain the given LBA?
    pub fn contains(&self, lba: LbaT) -> bool {
        self.start <= lba && lba < self.end()
    }

    /// Does `[lba, lba + lbas)` lie entirely within this zone?
    pub fn contains_range(&self, lba: LbaT, lbas: LbaT) -> bool {
        match lba.checked_add(lbas) {
            Some(end) => self.start <= lba && end <= self.end(),
            None => false
        }
    }

    /// The first LBA past the end of the zone
    pub fn end(&self) -> LbaT {
        self.start + self.len
    }

    /// Is this zone governed by a write pointer?
    pub fn is_sequential(&self) -> bool {
        self.zone_type != ZoneType::Conventional
    }

    /// May a write of `lbas` blocks be issued at `lba`?
    pub fn is_writable_at(&self, lba: LbaT, lbas: LbaT) -> bool {
        self.check_write(lba, lbas).is_ok()
    }

    /// Return the same zone with its write pointer rewound.
    pub fn reset(&self) -> Self {
        Zone::empty(self.start, self.len, self.zone_type)
    }

    /// Return the same zone with its write pointer forced to `wp`.
    pub fn with_write_pointer(&self, wp: LbaT) -> Result<Self> {
        if !self.is_sequential() {
            return Err(Error::NotResettable);
        }
        if wp < self.start || wp > self.end() {
            return Err(Error::OutOfRange);
        }
        let condition = if wp == self.start {
            ZoneCondition::Empty
        } else if wp == self.end() {
            ZoneCondition::Full
        } else {
            ZoneCondition::ImplicitOpen
        };
        Ok(Zone { write_pointer: wp, condition, ..*self })
    }
}

/// The result of a zone report.
#[derive(Clone, Debug, Default, Eq, PartialEq)]
pub struct ZoneReport {
    /// Matching zones, up to the caller's requested capacity.
    pub zones: Vec<Zone>,
    /// Total number of matching zones at or after the start address,
    /// regardless of how many were returned.
    pub total: usize,
}

impl ZoneReport {
    /// Is there more to report after `self.zones`?
    pub fn truncated(&self) -> bool {
        self.zones.len() < self.total
    }

    /// Address at which to resume paging through a truncated report.
    pub fn next_lba(&self) -> Option<LbaT> {
        self.zones.last().map(Zone::end)
    }
}

/// One entry of a [`ZoneLayout`]
#[derive(Clone, Copy, Debug, Deserialize, Eq, PartialEq, Serialize)]
pub struct ZoneSpec {
    pub len: LbaT,
    pub zone_type: ZoneType,
}

/// An ordered list of zone sizes and types, used to reconfigure emulated
/// devices.  Zones are laid out back-to-back starting at LBA 0.
#[derive(Clone, Debug, Default, Deserialize, Eq, PartialEq, Serialize)]
pub struct ZoneLayout {
    zones: Vec<ZoneSpec>
}

impl ZoneLayout {
    pub fn new(zones: Vec<ZoneSpec>) -> Self {
        ZoneLayout { zones }
    }

    /// The usual layout: `conventional` conventional zones followed by
    /// sequential-write-required zones, all `zone_len` LBAs long.  The last
    /// zone is shortened if `capacity` isn't a multiple of `zone_len`.
    pub fn uniform(capacity: LbaT, zone_len: LbaT, conventional: ZoneT)
        -> Result<Self>
    {
        if zone_len == 0 || capacity == 0 {
            return Err(Error::InvalidLayout);
        }
        let nzones = capacity.div_ceil(zone_len);
        if LbaT::from(conventional) > nzones {
            return Err(Error::InvalidLayout);
        }
        let zones = (0..nzones).map(|i| {
            let len = zone_len.min(capacity - i * zone_len);
            let zone_type = if i < LbaT::from(conventional) {
                ZoneType::Conventional
            } else {
                ZoneType::SequentialWriteRequired
            };
            ZoneSpec { len, zone_type }
        }).collect();
        Ok(ZoneLayout { zones })
    }

    /// Lay out an empty zone table covering exactly `capacity` LBAs.
    pub fn build(&self, capacity: LbaT) -> Result<Vec<Zone>> {
        let mut start = 0;
        let mut table = Vec::with_capacity(self.zones.len());
        for spec in self.zones.iter() {
            if spec.len == 0 {
                return Err(Error::InvalidLayout);
            }
            table.push(Zone::empty(start, spec.len, spec.zone_type));
            start = start.checked_add(spec.len).ok_or(Error::InvalidLayout)?;
        }
        validate_table(&table, capacity)?;
        Ok(table)
    }

    pub fn iter(&self) -> impl Iterator<Item=&ZoneSpec> {
        self.zones.iter()
    }

    pub fn len(&self) -> usize {
        self.zones.len()
    }

    pub fn is_empty(&self) -> bool {
        self.zones.is_empty()
    }
}

impl FromIterator<(LbaT, ZoneType)> for ZoneLayout {
    fn from_iter<I>(iter: I) -> Self
        where I: IntoIterator<Item=(LbaT, ZoneType)>
    {
        let zones = iter.into_iter()
            .map(|(len, zone_type)| ZoneSpec { len, zone_type })
            .collect();
        ZoneLayout { zones }
    }
}

impl From<&[Zone]> for ZoneLayout {
    fn from(table: &[Zone]) -> Self {
        table.iter().map(|z| (z.len, z.zone_type)).collect()
    }
}

/// Check that a zone table is ordered, contiguous, covers `capacity` LBAs, and
/// that every zone's write pointer and condition are consistent.
pub fn validate_table(table: &[Zone], capacity: LbaT) -> Result<()> {
    let first = table.first().ok_or(Error::InvalidLayout)?;
    let last = table.last().ok_or(Error::InvalidLayout)?;
    if first.start != 0 || last.end() != capacity {
        return Err(Error::InvalidLayout);
    }
    if !table.iter().tuple_windows().all(|(a, b)| a.end() == b.start) {
        return Err(Error::InvalidLayout);
    }
    for z in table {
        let consistent = z.len > 0 && if z.is_sequential() {
            z.start <= z.write_pointer && z.write_pointer <= z.end() &&
                z.condition != ZoneCondition::NotWritePointer
        } else {
            z.condition == ZoneCondition::NotWritePointer &&
                z.write_pointer == z.start
        };
        if !consistent {
            return Err(Error::InvalidLayout);
        }
    }
    Ok(())
}

/// Find the index of the zone containing `lba` in an ordered zone table.
pub fn zone_index(table: &[Zone], lba: LbaT) -> Option<usize> {
    let i = table.partition_point(|z| z.start <= lba);
    if i > 0 && table[i - 1].contains(lba) {
        Some(i - 1)
    } else {
        None
    }
}

/// Answer a report query from an in-memory zone table.
///
/// Reporting begins with the zone containing `lba`.  At most `max` zones are
/// returned, but `total` counts every match.
pub fn report(table: &[Zone], lba: LbaT, filter: ReportingFilter, max: usize)
    -> Result<ZoneReport>
{
    let first = zone_index(table, lba).ok_or(Error::OutOfRange)?;
    let mut matching = table[first..].iter().filter(|z| filter.matches(z));
    let zones = matching.by_ref().take(max).copied().collect::<Vec<_>>();
    let total = zones.len() + matching.count();
    Ok(ZoneReport { zones, total })
}

// LCOV_EXCL_STOP
