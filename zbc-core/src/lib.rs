// vim: tw=80
//! Zone-aware block I/O
//!
//! Talks to zoned block devices either natively, through ZBC commands, or by
//! emulating zones in software on top of an ordinary file or block device.
//! Either way callers see the same [`Device`].

use cfg_if::cfg_if;

pub mod backend;
pub mod config;
pub mod device;
pub mod emulation;
pub mod hardware;
pub mod label;
pub mod types;
pub mod zone;

cfg_if! {
    if #[cfg(target_os = "linux")] {
        pub mod sg;
    }
}

pub use crate::backend::{Backend, DeviceInfo, DeviceModel, Interface,
                         ResetTarget};
pub use crate::config::{Access, EmulationConfig, HardwareConfig, OpenFlags};
pub use crate::device::Device;
pub use crate::emulation::{BackingStore, Emulation};
pub use crate::hardware::{Command, CommandChannel, Hardware, Transfer};
pub use crate::types::*;
pub use crate::zone::{
    ReportingFilter,
    Zone,
    ZoneCondition,
    ZoneFlags,
    ZoneLayout,
    ZoneReport,
    ZoneSpec,
    ZoneType,
};
