// Author: Lukas Bower
//! Ordered interface chains, most-derived first.
//!
//! Entries are the names an object reports, unvalidated. Whether a name is
//! acceptable is the registry's call, made per name at `add` time.

use core::fmt;

use crate::RegistryError;

/// Immutable interface chain reported by a HIDL object.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct InterfaceChain {
    entries: Vec<String>,
}

impl InterfaceChain {
    /// Chain headed by `descriptor`, followed by `ancestors` in order.
    pub fn new<D, I, S>(descriptor: D, ancestors: I) -> Self
    where
        D: Into<String>,
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let mut entries = vec![descriptor.into()];
        entries.extend(ancestors.into_iter().map(Into::into));
        Self { entries }
    }

    /// Build a chain from a list of names; the list must not be empty.
    pub fn from_names<I, S>(names: I) -> Result<Self, RegistryError>
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let mut names = names.into_iter();
        let descriptor = names.next().ok_or(RegistryError::EmptyChain)?;
        Ok(Self::new(descriptor, names))
    }

    /// Most-derived interface of the chain.
    #[must_use]
    pub fn descriptor(&self) -> &str {
        &self.entries[0]
    }

    /// Iterate the chain in order.
    pub fn iter(&self) -> impl Iterator<Item = &str> {
        self.entries.iter().map(String::as_str)
    }

    /// Number of entries.
    #[must_use]
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Chains are never empty; provided for API symmetry.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Return `true` when `name` appears anywhere in the chain.
    #[must_use]
    pub fn contains(&self, name: &str) -> bool {
        self.iter().any(|entry| entry == name)
    }
}

impl fmt::Display for InterfaceChain {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.entries.join(" -> "))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_name_list_is_rejected() {
        assert_eq!(
            InterfaceChain::from_names(Vec::<String>::new()).unwrap_err(),
            RegistryError::EmptyChain
        );
    }

    #[test]
    fn descriptor_is_most_derived() {
        let chain = InterfaceChain::new(
            "android.hidl.token@1.0::ITokenManager",
            ["android.hidl.base@1.0::IBase"],
        );
        assert_eq!(chain.descriptor(), "android.hidl.token@1.0::ITokenManager");
        assert_eq!(chain.len(), 2);
        assert_eq!(
            chain.to_string(),
            "android.hidl.token@1.0::ITokenManager -> android.hidl.base@1.0::IBase"
        );
    }

    #[test]
    fn bare_names_are_carried_verbatim() {
        let chain = InterfaceChain::from_names(["IRegistry", "IBase"]).unwrap();
        assert_eq!(chain.iter().collect::<Vec<_>>(), vec!["IRegistry", "IBase"]);
        assert!(chain.contains("IBase"));
        assert!(!chain.contains("android.hidl.base@1.0::IBase"));
    }
}
