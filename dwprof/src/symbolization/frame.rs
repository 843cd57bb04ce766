use std::sync::Arc;

use crate::session::Module;

/// One logical frame of a call chain
///
/// A single sampled address may expand to several of these when the compiler
/// inlined calls: the innermost inlined function comes first and the physical
/// function that owns the instruction comes last. `None` fields mean the
/// metadata was unavailable, which is expected for stripped libraries.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ResolvedFrame {
    pub address: u64,
    /// Copy of the owning module, detached from the session
    pub module: Option<Module>,
    pub function: Option<Arc<str>>,
    /// Offset of `address` from the start of `function`
    pub offset: Option<u64>,
    pub file: Option<Arc<str>>,
    pub line: Option<u32>,
    /// True for synthetic frames produced by inline expansion
    pub inlined: bool,
}

impl ResolvedFrame {
    /// A frame with no module and no symbol information
    #[must_use]
    pub fn unresolved(address: u64) -> Self {
        Self {
            address,
            module: None,
            function: None,
            offset: None,
            file: None,
            line: None,
            inlined: false,
        }
    }

    /// A frame inside a known module whose metadata yielded nothing
    #[must_use]
    pub fn in_module(address: u64, module: &Module) -> Self {
        Self { module: Some(module.clone()), ..Self::unresolved(address) }
    }

    /// Whether a function name was found
    #[must_use]
    pub fn is_resolved(&self) -> bool {
        self.function.is_some()
    }
}
