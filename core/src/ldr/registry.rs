//! Loaded-module registry.
//!
//! One process-wide list of every module the loader has brought in, keyed
//! by trimmed filename and searchable by base address. Enumeration order
//! is load order.

use indexmap::IndexMap;
use thiserror::Error;

/// A loaded module.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Module {
    /// Trimmed filename, as given (case preserved).
    pub name: String,
    /// Runtime base address.
    pub base: u32,
    /// Reference count; at least 1 while the record exists.
    pub refs: u32,
}

/// Registry of loaded modules, in insertion order.
#[derive(Debug, Default)]
pub struct Registry {
    map: IndexMap<String, Module>,
}

impl Registry {
    /// Constructs an empty registry.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Looks up a module by name (case-insensitive, path trimmed).
    #[must_use]
    pub fn find(&self, name: &str) -> Option<&Module> {
        self.map.get(&key(name))
    }

    /// Looks up a module by name for mutation.
    pub fn find_mut(&mut self, name: &str) -> Option<&mut Module> {
        self.map.get_mut(&key(name))
    }

    /// Looks up a module by base address.
    #[must_use]
    pub fn find_by_base(&self, base: u32) -> Option<&Module> {
        self.map.values().find(|module| module.base == base)
    }

    /// Adds a module with a reference count of 1.
    ///
    /// # Errors
    ///
    /// Fails if a module with the same name or base is already registered.
    pub fn add(&mut self, name: &str, base: u32) -> Result<(), Error> {
        if self.map.contains_key(&key(name)) {
            return Err(Error::Name);
        }
        if self.find_by_base(base).is_some() {
            return Err(Error::Base);
        }
        self.map.insert(
            key(name),
            Module {
                name: trim(name).to_string(),
                base,
                refs: 1,
            },
        );
        Ok(())
    }

    /// Removes the module at `base`, returning its record.
    pub fn remove(&mut self, base: u32) -> Option<Module> {
        let name = self
            .map
            .iter()
            .find(|(_, module)| module.base == base)
            .map(|(name, _)| name.clone())?;
        // shift_remove keeps the remaining entries in insertion order.
        self.map.shift_remove(&name)
    }

    /// Iterates modules in load order.
    pub fn iter(&self) -> impl Iterator<Item = &Module> {
        self.map.values()
    }

    /// Number of registered modules.
    #[must_use]
    pub fn len(&self) -> usize {
        self.map.len()
    }

    /// Whether the registry is empty.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.map.is_empty()
    }
}

/// A registry invariant violation.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum Error {
    /// A module with this name is already registered.
    #[error("duplicate module name")]
    Name,
    /// A module with this base address is already registered.
    #[error("duplicate base address")]
    Base,
}

/// Strips any leading path, keeping only the filename.
#[must_use]
pub fn trim(path: &str) -> &str {
    path.rsplit(['\\', '/']).next().unwrap_or(path)
}

/// Canonical lookup key for a module name.
fn key(name: &str) -> String {
    trim(name).to_ascii_lowercase()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn trim_strips_paths() {
        assert_eq!(trim("C:\\SYS\\DOSCALLS.DLL"), "DOSCALLS.DLL");
        assert_eq!(trim("lib/thing.dll"), "thing.dll");
        assert_eq!(trim("PLAIN.EXE"), "PLAIN.EXE");
    }

    #[test]
    fn lookup_is_case_insensitive_and_trimmed() {
        let mut reg = Registry::new();
        reg.add("C:\\APP\\TEST.DLL", 0x40_0000).unwrap();
        assert!(reg.find("test.dll").is_some());
        assert!(reg.find("D:\\OTHER\\TEST.DLL").is_some());
        assert!(reg.find("other.dll").is_none());
    }

    #[test]
    fn duplicates_rejected() {
        let mut reg = Registry::new();
        reg.add("a.dll", 0x40_0000).unwrap();
        assert_eq!(reg.add("A.DLL", 0x50_0000), Err(Error::Name));
        assert_eq!(reg.add("b.dll", 0x40_0000), Err(Error::Base));
    }

    #[test]
    fn enumeration_preserves_insertion_order() {
        let mut reg = Registry::new();
        reg.add("a.dll", 1).unwrap();
        reg.add("b.dll", 2).unwrap();
        reg.add("c.dll", 3).unwrap();
        reg.remove(2);
        let names: Vec<_> = reg.iter().map(|m| m.name.as_str()).collect();
        assert_eq!(names, ["a.dll", "c.dll"]);
    }

    #[test]
    fn remove_returns_record() {
        let mut reg = Registry::new();
        reg.add("a.dll", 0x40_0000).unwrap();
        let module = reg.remove(0x40_0000).unwrap();
        assert_eq!(module.name, "a.dll");
        assert_eq!(module.refs, 1);
        assert!(reg.is_empty());
        assert!(reg.remove(0x40_0000).is_none());
    }
}
