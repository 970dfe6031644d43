//! Session-scoped table of loaded dependency images.
//!
//! The registry is an explicit value owned by the load session and passed
//! into every recursive load, so repeated sessions (and tests) never share
//! state. Entries are keyed by image name and inserted once per unique name
//! for the lifetime of the session.

use std::collections::HashMap;

use super::LoadedImage;

/// Loaded dependency images, keyed by image name.
#[derive(Default)]
pub struct Registry {
    images: HashMap<String, LoadedImage>,
}

impl Registry {
    pub fn new() -> Registry {
        Registry::default()
    }

    pub fn contains(&self, name: &str) -> bool {
        self.images.contains_key(name)
    }

    pub fn insert(&mut self, name: String, image: LoadedImage) {
        self.images.insert(name, image);
    }

    pub fn get(&self, name: &str) -> Option<&LoadedImage> {
        self.images.get(name)
    }

    /// Detaches an image so its tables can be rebuilt without aliasing the
    /// registry; callers put it back when done.
    pub(crate) fn take(&mut self, name: &str) -> Option<LoadedImage> {
        self.images.remove(name)
    }

    /// Finds the first image exposing `symbol` and returns its name and the
    /// symbol's absolute address.
    pub fn lookup_symbol(&self, symbol: &str) -> Option<(&str, u64)> {
        self.images.iter().find_map(|(name, image)| {
            image
                .symbols
                .get(symbol)
                .map(|&address| (name.as_str(), address))
        })
    }

    pub fn images(&self) -> impl Iterator<Item = &LoadedImage> {
        self.images.values()
    }

    pub fn len(&self) -> usize {
        self.images.len()
    }

    pub fn is_empty(&self) -> bool {
        self.images.is_empty()
    }
}
