use std::fmt;
use std::str::FromStr;

/// Guest instruction-set architectures we can re-execute.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum ArchName {
    X86,
    Amd64,
    Aarch64,
}

impl ArchName {
    /// Upper bound on the byte length of one instruction; the decoder never
    /// fetches more than this per PC.
    pub fn max_instruction_bytes(self) -> usize {
        match self {
            ArchName::X86 | ArchName::Amd64 => 15,
            ArchName::Aarch64 => 4,
        }
    }

    pub fn address_size_bits(self) -> u32 {
        match self {
            ArchName::X86 => 32,
            ArchName::Amd64 | ArchName::Aarch64 => 64,
        }
    }

    /// Mask applied to every guest address before it is looked up. 32-bit
    /// guests wrap at 4GiB.
    pub fn address_mask(self) -> u64 {
        match self {
            ArchName::X86 => 0xFFFF_FFFF,
            ArchName::Amd64 | ArchName::Aarch64 => u64::max_value(),
        }
    }
}

impl fmt::Display for ArchName {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        let name = match self {
            ArchName::X86 => "x86",
            ArchName::Amd64 => "amd64",
            ArchName::Aarch64 => "aarch64",
        };
        write!(f, "{}", name)
    }
}

impl FromStr for ArchName {
    type Err = String;

    fn from_str(s: &str) -> Result<ArchName, String> {
        match s {
            "x86" => Ok(ArchName::X86),
            "amd64" | "x86_64" => Ok(ArchName::Amd64),
            "aarch64" | "arm64" => Ok(ArchName::Aarch64),
            _ => Err(format!("unsupported guest architecture: {}", s)),
        }
    }
}

/// Guest operating systems. Only the system-call personality differs between
/// them; the memory and dispatch machinery is OS-agnostic.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum OsName {
    Linux,
}

impl fmt::Display for OsName {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            OsName::Linux => write!(f, "linux"),
        }
    }
}

impl FromStr for OsName {
    type Err = String;

    fn from_str(s: &str) -> Result<OsName, String> {
        match s {
            "linux" => Ok(OsName::Linux),
            _ => Err(format!("unsupported guest OS: {}", s)),
        }
    }
}

/// Default runtime library name for a guest `(os, arch)` pair.
pub fn default_runtime_name(os: OsName, arch: ArchName) -> String {
    format!("{}_{}", os, arch)
}
