use std::{fmt, str::FromStr};

/// Hardware platforms the firmware emulator can impersonate.
///
/// Declaration order is the enumeration order used wherever platforms are scanned in sequence
/// (screenshot diffs report the first platform in this order).
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum Platform {
    Aplite,
    Basalt,
    Chalk,
    Diorite,
    Emery,
}

/// How the per-instance SPI flash copy is attached to the emulated machine.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FlashAttach {
    Mtdblock,
    Pflash,
}

impl FlashAttach {
    pub fn flag(self) -> &'static str {
        match self {
            Self::Mtdblock => "-mtdblock",
            Self::Pflash => "-pflash",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MachineProfile {
    pub machine: &'static str,
    pub cpu: &'static str,
    pub flash: FlashAttach,
}

impl Platform {
    pub const ALL: [Platform; 5] = [
        Platform::Aplite,
        Platform::Basalt,
        Platform::Chalk,
        Platform::Diorite,
        Platform::Emery,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Aplite => "aplite",
            Self::Basalt => "basalt",
            Self::Chalk => "chalk",
            Self::Diorite => "diorite",
            Self::Emery => "emery",
        }
    }

    pub fn profile(self) -> MachineProfile {
        let (machine, cpu, flash) = match self {
            Self::Aplite => ("pebble-bb2", "cortex-m3", FlashAttach::Mtdblock),
            Self::Basalt => ("pebble-snowy-bb", "cortex-m4", FlashAttach::Pflash),
            Self::Chalk => ("pebble-s4-bb", "cortex-m4", FlashAttach::Pflash),
            Self::Diorite => ("pebble-silk-bb", "cortex-m4", FlashAttach::Mtdblock),
            Self::Emery => ("pebble-robert-bb", "cortex-m4", FlashAttach::Pflash),
        };
        MachineProfile {
            machine,
            cpu,
            flash,
        }
    }
}

impl fmt::Display for Platform {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("unknown platform {0:?}")]
pub struct UnknownPlatform(pub String);

impl FromStr for Platform {
    type Err = UnknownPlatform;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::ALL
            .into_iter()
            .find(|platform| platform.as_str() == s)
            .ok_or_else(|| UnknownPlatform(s.to_string()))
    }
}
