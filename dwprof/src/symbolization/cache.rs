use log::debug;
use std::collections::HashMap;
use std::rc::Rc;
use std::sync::Arc;

use super::{DebugInfoLoader, ResolvedFrame, SymbolFrame, SymbolSource};
use crate::session::Module;

/// Per-session symbol state: opened debug-info handles and resolved frames
///
/// Both maps are keyed by module so a module that unloads can be dropped in
/// one step. A module whose metadata failed to load is remembered as `None`
/// and not retried until it is unloaded.
#[derive(Default)]
pub(crate) struct SymbolCache {
    sources: HashMap<Module, Option<Box<dyn SymbolSource>>>,
    frames: HashMap<Module, HashMap<FrameKey, Rc<[ResolvedFrame]>>>,
}

/// Module-relative lookup offset, and whether it was derived from a return
/// address one byte further on
type FrameKey = (u64, bool);

impl SymbolCache {
    /// Frames for `addr`, with symbols looked up at `lookup`
    ///
    /// `lookup` is `addr` for a sampled instruction and `addr - 1` for a
    /// return address. Frames keep `addr`, and the outermost offset stays
    /// relative to it.
    pub(crate) fn frames(
        &mut self,
        loader: &dyn DebugInfoLoader,
        module: &Module,
        addr: u64,
        lookup: u64,
    ) -> Vec<ResolvedFrame> {
        let offset = module.offset_of(lookup);
        let shift = addr.wrapping_sub(lookup);
        let key = (offset, shift != 0);

        if let Some(hit) = self.frames.get(module).and_then(|by_offset| by_offset.get(&key)) {
            return hit.to_vec();
        }

        let source = self.sources.entry(module.clone()).or_insert_with(|| loader.load(module));
        let found = source.as_ref().map(|s| s.lookup(offset)).unwrap_or_default();

        let resolved: Rc<[ResolvedFrame]> = if found.is_empty() {
            Rc::from(vec![ResolvedFrame::in_module(addr, module)])
        } else {
            let outermost = found.len() - 1;
            found
                .into_iter()
                .enumerate()
                .map(|(idx, mut frame)| {
                    frame.offset = frame.offset.map(|o| o.wrapping_add(shift));
                    to_resolved(addr, module, frame, idx < outermost)
                })
                .collect()
        };

        self.frames.entry(module.clone()).or_default().insert(key, Rc::clone(&resolved));
        resolved.to_vec()
    }

    pub(crate) fn evict(&mut self, module: &Module) {
        let dropped = self.frames.remove(module).map_or(0, |by_offset| by_offset.len());
        self.sources.remove(module);
        debug!("Evicted {dropped} cached frames of {}", module.path.display());
    }

    pub(crate) fn len(&self) -> usize {
        self.frames.values().map(HashMap::len).sum()
    }
}

fn to_resolved(addr: u64, module: &Module, frame: SymbolFrame, inlined: bool) -> ResolvedFrame {
    ResolvedFrame {
        address: addr,
        module: Some(module.clone()),
        function: frame.function.map(Arc::from),
        offset: frame.offset,
        file: frame.file.map(Arc::from),
        line: frame.line,
        inlined,
    }
}
