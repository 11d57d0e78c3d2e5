// Author: Lukas Bower
//! Fully-qualified HIDL interface names.

use core::fmt;
use core::str::FromStr;

use crate::RegistryError;

/// Parsed `package@major.minor::Interface` identifier.
#[derive(Clone, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct FqName {
    package: String,
    major: u32,
    minor: u32,
    interface: String,
}

impl FqName {
    /// Parse a fully-qualified interface name.
    pub fn parse(name: &str) -> Result<Self, RegistryError> {
        let fail = |reason| RegistryError::InvalidFqName {
            name: name.to_owned(),
            reason,
        };

        let (package, rest) = name.split_once('@').ok_or_else(|| fail("missing '@'"))?;
        let (version, interface) = rest
            .split_once("::")
            .ok_or_else(|| fail("missing '::'"))?;
        let (major, minor) = version
            .split_once('.')
            .ok_or_else(|| fail("version must be major.minor"))?;

        if package.is_empty() || !package.split('.').all(is_identifier) {
            return Err(fail("malformed package"));
        }
        if !is_identifier(interface) {
            return Err(fail("malformed interface"));
        }
        let major = major.parse().map_err(|_| fail("major version is not a number"))?;
        let minor = minor.parse().map_err(|_| fail("minor version is not a number"))?;

        Ok(Self {
            package: package.to_owned(),
            major,
            minor,
            interface: interface.to_owned(),
        })
    }

    /// Package component, e.g. `android.hidl.manager`.
    #[must_use]
    pub fn package(&self) -> &str {
        &self.package
    }

    /// `(major, minor)` version pair.
    #[must_use]
    pub const fn version(&self) -> (u32, u32) {
        (self.major, self.minor)
    }

    /// Bare interface name, e.g. `IServiceManager`.
    #[must_use]
    pub fn interface(&self) -> &str {
        &self.interface
    }
}

fn is_identifier(part: &str) -> bool {
    let mut chars = part.chars();
    match chars.next() {
        Some(first) if first.is_ascii_alphabetic() || first == '_' => {}
        _ => return false,
    }
    chars.all(|c| c.is_ascii_alphanumeric() || c == '_')
}

impl fmt::Display for FqName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}@{}.{}::{}",
            self.package, self.major, self.minor, self.interface
        )
    }
}

impl FromStr for FqName {
    type Err = RegistryError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::parse(s)
    }
}
