// vim: tw=80
//! Options controlling how a device is opened

use serde_derive::{Deserialize, Serialize};
use std::{path::{Path, PathBuf}, time::Duration};

use crate::types::*;

/// Whether a device is opened for reading only, or for reading and writing
#[derive(Clone, Copy, Debug, Default, Deserialize, Eq, PartialEq, Serialize)]
pub enum Access {
    ReadOnly,
    #[default]
    ReadWrite,
}

impl Access {
    pub fn writable(self) -> bool {
        self == Access::ReadWrite
    }
}

/// How to format a new emulated device.
#[derive(Clone, Debug, Deserialize, Eq, PartialEq, Serialize)]
#[serde(default, deny_unknown_fields)]
pub struct EmulationConfig {
    /// Bytes per logical block.
    pub logical_block_size: u32,
    /// Bytes per physical block.  Informational only.
    pub physical_block_size: u32,
    /// Size of each zone, in logical blocks.  The last zone may be shorter.
    pub zone_size: LbaT,
    /// Number of conventional zones at the start of the device.
    pub conventional_zones: ZoneT,
}

impl EmulationConfig {
    /// Default zone size in bytes.  Matches common SMR drives.
    pub const DEFAULT_ZONE_BYTES: u64 = 256 << 20;
}

impl Default for EmulationConfig {
    fn default() -> Self {
        let logical_block_size = 512;
        EmulationConfig {
            logical_block_size,
            physical_block_size: 4096,
            zone_size: Self::DEFAULT_ZONE_BYTES /
                u64::from(logical_block_size),
            conventional_zones: 1,
        }
    }
}

/// Tunables for devices with native zone support.
#[derive(Clone, Debug, Deserialize, Eq, PartialEq, Serialize)]
#[serde(default, deny_unknown_fields)]
pub struct HardwareConfig {
    /// Upper bound on how long any single command may take, in milliseconds.
    pub command_timeout_ms: u32,
    /// Largest data-in transfer used for a single REPORT ZONES command.
    /// Larger reports are split into several commands.
    pub max_report_bytes: u32,
}

impl HardwareConfig {
    pub fn command_timeout(&self) -> Duration {
        Duration::from_millis(self.command_timeout_ms.into())
    }
}

impl Default for HardwareConfig {
    fn default() -> Self {
        HardwareConfig {
            command_timeout_ms: 30_000,
            max_report_bytes: 512 << 10,
        }
    }
}

/// Options and flags used to open a device.
///
/// Works like [`std::fs::OpenOptions`]: start from [`OpenFlags::new`] and
/// chain setters.  It can also be loaded from YAML.
///
/// ```yaml
/// access: ReadWrite
/// native: false
/// create:
///   zone_size: 65536
///   conventional_zones: 4
/// ```
#[derive(Clone, Debug, Deserialize, Eq, PartialEq, Serialize)]
#[serde(default, deny_unknown_fields)]
pub struct OpenFlags {
    pub access: Access,
    /// Look for native zone commands on device nodes.
    pub native: bool,
    /// Fall back to software emulation when native zones are absent.
    pub emulation: bool,
    /// Format a new emulated device if no emulation metadata exists yet.
    pub create: Option<EmulationConfig>,
    /// Directory holding emulation metadata.  By default, metadata for a
    /// regular file lives next to it, and metadata for a device node lives in
    /// the system's temporary directory, named after the node and its device
    /// number.  A tmpfs temporary directory does not survive a reboot, so
    /// emulated block devices that must persist should set this.
    pub meta_dir: Option<PathBuf>,
    pub hardware: HardwareConfig,
}

impl Default for OpenFlags {
    fn default() -> Self {
        OpenFlags {
            access: Access::default(),
            native: true,
            emulation: true,
            create: None,
            meta_dir: None,
            hardware: HardwareConfig::default(),
        }
    }
}

impl OpenFlags {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn access(mut self, access: Access) -> Self {
        self.access = access;
        self
    }

    pub fn read_only(self) -> Self {
        self.access(Access::ReadOnly)
    }

    pub fn native(mut self, native: bool) -> Self {
        self.native = native;
        self
    }

    pub fn emulation(mut self, emulation: bool) -> Self {
        self.emulation = emulation;
        self
    }

    pub fn create(mut self, config: EmulationConfig) -> Self {
        self.create = Some(config);
        self
    }

    pub fn meta_dir<P: AsRef<Path>>(mut self, dir: P) -> Self {
        self.meta_dir = Some(dir.as_ref().to_path_buf());
        self
    }

    pub fn hardware(mut self, config: HardwareConfig) -> Self {
        self.hardware = config;
        self
    }

    /// Parse `OpenFlags` from a YAML document.  Missing fields get their
    /// default values.
    pub fn from_yaml(s: &str)
        -> std::result::Result<Self, serde_yaml_ng::Error>
    {
        serde_yaml_ng::from_str(s)
    }
}

// LCOV_EXCL_STOP
