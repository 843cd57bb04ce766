use log::{debug, trace};
use rustc_demangle::try_demangle;

use super::ResolvedFrame;
use crate::session::Session;

/// Resolve one sampled address into its logical frames
///
/// Never fails. An address outside every module, or inside a module without
/// usable metadata, yields a single frame with no function, file or line. An
/// address inside inlined code yields several frames, innermost first.
///
/// On a module miss the session's module map is refreshed once per sampling
/// batch and the lookup retried, catching libraries loaded since the last
/// snapshot. A failed refresh detaches the session; the caller observes it
/// through [`Session::check_attached`].
pub fn resolve(session: &mut Session, address: u64) -> Vec<ResolvedFrame> {
    resolve_at(session, address, address)
}

/// Resolve a return address found in a caller's frame
///
/// A return address points past the call instruction, possibly into an
/// unrelated inlined body or the next function entirely. The lookup therefore
/// uses `address - 1`, which lies inside the call. The returned frames still
/// carry `address`.
pub fn resolve_return_address(session: &mut Session, address: u64) -> Vec<ResolvedFrame> {
    resolve_at(session, address, address.saturating_sub(1))
}

fn resolve_at(session: &mut Session, address: u64, lookup: u64) -> Vec<ResolvedFrame> {
    let module = match session.find_module(lookup) {
        Some(module) => Some(module.clone()),
        None if !session.refreshed_this_batch() && session.detached().is_none() => {
            debug!("0x{address:x} outside known modules, refreshing module map");
            match session.refresh() {
                Ok(_) => session.find_module(lookup).cloned(),
                Err(_) => None,
            }
        }
        None => None,
    };

    let Some(module) = module else {
        trace!("0x{address:x} unresolved: no module");
        return vec![ResolvedFrame::unresolved(address)];
    };

    session.frames_at(&module, address, lookup)
}

/// Resolve every address of a sampled call chain, preserving order
///
/// The first address is the sampled instruction and goes through
/// [`resolve`]. Every later one is a return address and goes through
/// [`resolve_return_address`].
pub fn resolve_chain(session: &mut Session, ips: &[u64]) -> Vec<ResolvedFrame> {
    let Some((&sampled, callers)) = ips.split_first() else {
        return Vec::new();
    };

    let mut frames = resolve(session, sampled);
    for &ret in callers {
        frames.extend(resolve_return_address(session, ret));
    }
    frames
}

/// Demangle a Rust or C++ symbol name
///
/// Names that are not mangled come back unchanged.
#[must_use]
pub fn demangle_symbol(symbol: &str) -> String {
    if let Ok(demangled) = try_demangle(symbol) {
        return format!("{demangled:#}");
    }
    addr2line::demangle(symbol, gimli::DW_LANG_C_plus_plus).unwrap_or_else(|| symbol.to_string())
}
