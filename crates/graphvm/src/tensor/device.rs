use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

/// Placement of a tensor buffer.
///
/// Accelerator slots carry placement only; their storage is host-resident and kernels for
/// real devices live outside this crate.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Default, Serialize, Deserialize,
)]
pub enum Device {
    #[default]
    Host,
    Accelerator(u32),
}

impl Device {
    /// Host memory may be reinterpreted as another element kind of equal byte size;
    /// accelerator buffers keep the dtype they were allocated with.
    pub fn allows_reinterpret(self) -> bool {
        matches!(self, Device::Host)
    }
}

impl fmt::Display for Device {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Device::Host => f.write_str("host"),
            Device::Accelerator(slot) => write!(f, "accel:{slot}"),
        }
    }
}

impl FromStr for Device {
    type Err = String;

    fn from_str(raw: &str) -> Result<Self, Self::Err> {
        let trimmed = raw.trim().to_ascii_lowercase();
        if trimmed == "host" || trimmed == "cpu" {
            return Ok(Device::Host);
        }
        let slot = trimmed
            .strip_prefix("accel:")
            .or_else(|| trimmed.strip_prefix("cuda:"))
            .ok_or_else(|| format!("unrecognised device `{raw}`"))?;
        slot.parse::<u32>()
            .map(Device::Accelerator)
            .map_err(|_| format!("invalid accelerator slot in `{raw}`"))
    }
}
