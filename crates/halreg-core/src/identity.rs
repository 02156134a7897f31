//! Versioned interface-identity parsing and formatting.
//!
//! A fully-qualified interface name (fqname) has the shape
//! `package.path@major.minor::InterfaceName`, e.g.
//! `halreg.manager@1.0::IServiceManager`. The grammar is strict:
//! identifiers start with a letter or underscore, package segments are
//! dot-separated, versions are decimal non-negative integers.

use crate::error::{RegistryError, Result};
use regex::Regex;
use std::fmt;
use std::sync::LazyLock;

/// Full fqname grammar. Capture groups: package path, major, minor,
/// interface name.
static FQNAME_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(
        r"^([A-Za-z_][A-Za-z_0-9]*(?:\.[A-Za-z_][A-Za-z_0-9]*)*)@([0-9]+)\.([0-9]+)::([A-Za-z_][A-Za-z_0-9]*)$",
    )
    .unwrap()
});

/// A `major.minor` interface version.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Version {
    pub major: u32,
    pub minor: u32,
}

impl Version {
    pub fn new(major: u32, minor: u32) -> Self {
        Self { major, minor }
    }

    /// Whether a service published at `self` satisfies a request for
    /// `requested`. Compatibility is directional: same major, requested
    /// minor no greater than published minor. Major is never coerced.
    pub fn supports(&self, requested: Version) -> bool {
        requested.major == self.major && requested.minor <= self.minor
    }
}

impl fmt::Display for Version {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}", self.major, self.minor)
    }
}

/// A parsed fully-qualified interface name.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct FqName {
    /// Dotted package path, e.g. `halreg.manager`.
    pub package: String,
    /// Interface version.
    pub version: Version,
    /// Interface name, e.g. `IServiceManager`.
    pub interface: String,
}

impl FqName {
    /// Parse an fqname string against the strict grammar.
    ///
    /// Any string failing the grammar is rejected with
    /// [`RegistryError::InvalidIdentity`]; no registry state is touched by
    /// operations handed an invalid identity.
    pub fn parse(fqname: &str) -> Result<Self> {
        let caps = FQNAME_RE
            .captures(fqname)
            .ok_or_else(|| RegistryError::invalid_identity(fqname, "does not match fqname grammar"))?;

        let major = caps[2]
            .parse::<u32>()
            .map_err(|_| RegistryError::invalid_identity(fqname, "major version out of range"))?;
        let minor = caps[3]
            .parse::<u32>()
            .map_err(|_| RegistryError::invalid_identity(fqname, "minor version out of range"))?;

        Ok(Self {
            package: caps[1].to_string(),
            version: Version::new(major, minor),
            interface: caps[4].to_string(),
        })
    }

    /// Version-less index key, e.g. `halreg.manager::IServiceManager`.
    ///
    /// All versions of an interface share one index bucket under this key.
    pub fn package_interface(&self) -> String {
        format!("{}::{}", self.package, self.interface)
    }

    /// Human-readable identifier for a named instance of this interface,
    /// e.g. `halreg.manager@1.0::IServiceManager/default`.
    pub fn instance_string(&self, instance: &str) -> String {
        format!("{}/{}", self, instance)
    }
}

impl fmt::Display for FqName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}@{}::{}", self.package, self.version, self.interface)
    }
}
