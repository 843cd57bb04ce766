//! Call-chain rendering
//!
//! A chain renders as its frames joined with `;`:
//!
//! | frame                         | rendering             |
//! |-------------------------------|-----------------------|
//! | function and line             | `compute:42`          |
//! | function and offset           | `compute+0x20`        |
//! | function only                 | `compute`             |
//! | no function                   | `0x7f3a1c0042d0`      |
//!
//! An empty chain renders as [`NO_CALLCHAIN`], which can never collide with a
//! rendered frame.

use crate::symbolization::ResolvedFrame;

/// Rendering of a sample that carried no addresses
pub const NO_CALLCHAIN: &str = "[no callchain]";

/// Separator between frames of one chain
pub const FRAME_SEPARATOR: char = ';';

/// Terminator after each chain of a batch
pub const CHAIN_TERMINATOR: char = '|';

/// Order of frames in the rendered chain
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ChainOrder {
    /// Sampled instruction first, as the kernel reports it
    #[default]
    InnermostFirst,
    /// Entry point first, the collapsed-stack convention
    OutermostFirst,
}

/// Renders chains in a fixed frame order
#[derive(Debug, Clone, Copy, Default)]
pub struct ChainFormatter {
    pub order: ChainOrder,
}

impl ChainFormatter {
    #[must_use]
    pub fn new(order: ChainOrder) -> Self {
        Self { order }
    }

    #[must_use]
    pub fn format(&self, frames: &[ResolvedFrame]) -> String {
        if frames.is_empty() {
            return NO_CALLCHAIN.to_string();
        }

        let mut out = String::new();
        let mut push = |idx: usize, frame: &ResolvedFrame| {
            if idx > 0 {
                out.push(FRAME_SEPARATOR);
            }
            write_frame(&mut out, frame);
        };

        match self.order {
            ChainOrder::InnermostFirst => frames.iter().enumerate().for_each(|(i, f)| push(i, f)),
            ChainOrder::OutermostFirst => {
                frames.iter().rev().enumerate().for_each(|(i, f)| push(i, f));
            }
        }
        out
    }
}

/// Render one chain, innermost frame first
#[must_use]
pub fn format_chain(frames: &[ResolvedFrame]) -> String {
    ChainFormatter::default().format(frames)
}

/// Render a single frame
#[must_use]
pub fn format_frame(frame: &ResolvedFrame) -> String {
    let mut out = String::new();
    write_frame(&mut out, frame);
    out
}

/// Concatenate rendered chains, each followed by `|`
#[must_use]
pub fn format_batch<I, S>(chains: I) -> String
where
    I: IntoIterator<Item = S>,
    S: AsRef<str>,
{
    chains.into_iter().fold(String::new(), |mut out, chain| {
        out.push_str(chain.as_ref());
        out.push(CHAIN_TERMINATOR);
        out
    })
}

fn write_frame(out: &mut String, frame: &ResolvedFrame) {
    match (&frame.function, frame.line, frame.offset) {
        (Some(function), Some(line), _) => out.push_str(&format!("{function}:{line}")),
        (Some(function), None, Some(offset)) => out.push_str(&format!("{function}+0x{offset:x}")),
        (Some(function), None, None) => out.push_str(function),
        (None, ..) => out.push_str(&format!("0x{:x}", frame.address)),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    fn named(address: u64, function: &str, offset: Option<u64>, line: Option<u32>) -> ResolvedFrame {
        ResolvedFrame {
            function: Some(Arc::from(function)),
            offset,
            line,
            ..ResolvedFrame::unresolved(address)
        }
    }

    #[test]
    fn test_function_with_offset() {
        let frame = named(0x1020, "compute", Some(0x20), None);
        assert_eq!(format_frame(&frame), "compute+0x20");
    }

    #[test]
    fn test_line_takes_precedence_over_offset() {
        let frame = named(0x1020, "compute", Some(0x20), Some(42));
        assert_eq!(format_frame(&frame), "compute:42");
    }

    #[test]
    fn test_function_without_offset_or_line() {
        assert_eq!(format_frame(&named(0x1020, "compute", None, None)), "compute");
    }

    #[test]
    fn test_unresolved_is_lower_hex() {
        assert_eq!(format_frame(&ResolvedFrame::unresolved(0x7F3A_1C00_42D0)), "0x7f3a1c0042d0");
    }

    #[test]
    fn test_chain_joined_innermost_first() {
        let frames = vec![
            named(0x1110, "helper", None, Some(12)),
            named(0x1110, "compute_all", Some(0x10), None),
            ResolvedFrame::unresolved(0xbeef),
        ];
        assert_eq!(format_chain(&frames), "helper:12;compute_all+0x10;0xbeef");
    }

    #[test]
    fn test_outermost_first_reverses() {
        let frames = vec![named(0x1, "leaf", None, None), named(0x2, "main", None, None)];
        let formatter = ChainFormatter::new(ChainOrder::OutermostFirst);
        assert_eq!(formatter.format(&frames), "main;leaf");
    }

    #[test]
    fn test_empty_chain_sentinel_differs_from_unresolved() {
        let empty = format_chain(&[]);
        let unresolved = format_chain(&[ResolvedFrame::unresolved(0)]);
        assert_eq!(empty, NO_CALLCHAIN);
        assert_ne!(empty, unresolved);
    }

    #[test]
    fn test_format_is_deterministic() {
        let frames = vec![named(0x1020, "compute", Some(0x20), None), ResolvedFrame::unresolved(0x9)];
        assert_eq!(format_chain(&frames), format_chain(&frames.clone()));
    }

    #[test]
    fn test_batch_terminates_each_chain() {
        assert_eq!(format_batch(["a;b", "c"]), "a;b|c|");
        assert_eq!(format_batch(Vec::<String>::new()), "");
    }
}
