//! Extension point for overriding how individual overlay nodes are rebuilt.
// SPDX-License-Identifier: Apache-2.0 OR MIT

use std::path::Path;

use anyhow::Result;

use crate::overlay::BuildRoots;

/// Hook consulted for every node of the previous overlay before the default
/// carbon copy. `supports` sees the node's absolute path inside the old
/// overlay; `handle` receives the path relative to the overlay root plus the
/// four build roots and owns reproducing the node under the target root.
pub trait FileHandler {
    fn supports(&self, path: &Path) -> bool;
    fn handle(&self, relative_path: &Path, roots: &BuildRoots) -> Result<()>;
}

/// Ordered collection of [`FileHandler`]s. The first handler claiming a path
/// wins. The set is fixed at construction; the engine itself ships none.
#[derive(Default)]
pub struct HandlerRegistry {
    handlers: Vec<Box<dyn FileHandler>>,
}

impl HandlerRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_handlers(handlers: Vec<Box<dyn FileHandler>>) -> Self {
        Self { handlers }
    }

    /// The first handler whose `supports` accepts `path`, if any.
    pub fn find(&self, path: &Path) -> Option<&dyn FileHandler> {
        self.handlers
            .iter()
            .find(|handler| handler.supports(path))
            .map(|handler| handler.as_ref())
    }
}
