//! Static path lookup.

use std::collections::HashMap;
use std::sync::{Arc, PoisonError, RwLock};

use super::Path;
use crate::core::{IsdAs, PathLookup};

/// A fixed table of paths between AS pairs.
///
/// A pair that was only registered in one direction is answered in the other
/// direction with the reversed paths.
#[derive(Debug, Clone, Default)]
pub struct StaticPathLookup {
    table: Arc<RwLock<HashMap<(IsdAs, IsdAs), Vec<Path>>>>,
}

impl StaticPathLookup {
    /// Empty table.
    pub fn new() -> Self {
        Self::default()
    }

    /// Replace the paths from `src` to `dst`.
    pub fn insert(&self, src: IsdAs, dst: IsdAs, paths: Vec<Path>) {
        self.table
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .insert((src, dst), paths);
    }

    /// Forget the paths from `src` to `dst`.
    pub fn remove(&self, src: IsdAs, dst: IsdAs) {
        self.table
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(&(src, dst));
    }
}

impl PathLookup for StaticPathLookup {
    fn paths(&self, src: IsdAs, dst: IsdAs) -> Vec<Path> {
        let table = self.table.read().unwrap_or_else(PoisonError::into_inner);
        if let Some(paths) = table.get(&(src, dst)) {
            return paths.clone();
        }
        table
            .get(&(dst, src))
            .map(|paths| paths.iter().map(Path::reverse).collect())
            .unwrap_or_default()
    }
}
