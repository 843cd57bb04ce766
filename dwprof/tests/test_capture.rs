use dwprof::domain::{AttachError, CaptureError, OverrunError, Pid};
use dwprof::format::{format_batch, ChainFormatter, ChainOrder, NO_CALLCHAIN};
use dwprof::ring_buffer::{HeapRing, RecordReader};
use dwprof::session::{modules_from_maps, Module, ModuleSource, Session};
use dwprof::symbolization::{DebugInfoLoader, SymbolFrame, SymbolSource};
use dwprof::{capture_batch, capture_chain};
use std::path::Path;

const MAPS: &str = "\
00001000-00002000 r-xp 00000000 08:01 1001                               /opt/app/bin/app
7f0000000000-7f0000001000 r-xp 00000000 08:01 2002                       /usr/lib/libstripped.so
7ffc00000000-7ffc00021000 rw-p 00000000 00:00 0                          [stack]
";

/// Metadata for /opt/app/bin/app: `compute` at [0x0, 0x50), `main` at
/// [0x100, 0x200) with `helper` inlined at [0x180, 0x190)
struct AppSymbols;

impl SymbolSource for AppSymbols {
    fn lookup(&self, offset: u64) -> Vec<SymbolFrame> {
        let function = |name: &str, offset: Option<u64>, line: Option<u32>| SymbolFrame {
            function: Some(name.to_string()),
            offset,
            file: None,
            line,
        };
        match offset {
            0x0..=0x4f => vec![function("compute", Some(offset), None)],
            0x180..=0x18f => {
                vec![function("helper", None, Some(7)), function("main", Some(offset - 0x100), None)]
            }
            0x100..=0x1ff => vec![function("main", Some(offset - 0x100), None)],
            _ => Vec::new(),
        }
    }
}

struct AppOnly;

impl DebugInfoLoader for AppOnly {
    fn load(&self, module: &Module) -> Option<Box<dyn SymbolSource>> {
        (module.path.as_ref() == Path::new("/opt/app/bin/app"))
            .then(|| Box::new(AppSymbols) as Box<dyn SymbolSource>)
    }
}

struct FixedMaps(&'static str);

impl ModuleSource for FixedMaps {
    fn modules(&self) -> Result<Vec<Module>, AttachError> {
        Ok(modules_from_maps(self.0))
    }
}

fn session() -> Session {
    Session::with_sources(Pid(100), Box::new(FixedMaps(MAPS)), Box::new(AppOnly)).unwrap()
}

#[test]
fn test_scenario_compute_plus_offset() {
    let mut session = session();
    let ring = HeapRing::new(1024);
    ring.push_sample(&[0x1020]);

    let mut reader = RecordReader::new(&ring);
    assert_eq!(capture_chain(&mut session, &mut reader), Ok(Some("compute+0x20".to_string())));
}

#[test]
fn test_full_chain_with_inline_stripped_and_unknown_frames() {
    let mut session = session();
    let ring = HeapRing::new(1024);
    ring.push_sample(&[0x1184, 0x7f00_0000_0010, 0x1120, 0xdead_beef]);

    let mut reader = RecordReader::new(&ring);
    let chain = capture_chain(&mut session, &mut reader).unwrap().unwrap();
    assert_eq!(chain, "helper:7;main+0x84;0x7f0000000010;main+0x20;0xdeadbeef");
}

#[test]
fn test_empty_sample_and_unresolved_sample_differ() {
    let mut session = session();
    let ring = HeapRing::new(1024);
    ring.push_sample(&[]);
    ring.push_sample(&[0x9]);

    let mut reader = RecordReader::new(&ring);
    let empty = capture_chain(&mut session, &mut reader).unwrap().unwrap();
    let unresolved = capture_chain(&mut session, &mut reader).unwrap().unwrap();
    assert_eq!(empty, NO_CALLCHAIN);
    assert_eq!(unresolved, "0x9");
}

#[test]
fn test_overrun_reported_then_capture_continues() {
    let mut session = session();
    let ring = HeapRing::new(1024);
    ring.push_sample(&[0x1020]);
    ring.push_lost(9);
    ring.push_sample(&[0x1010]);

    let mut reader = RecordReader::new(&ring);
    assert_eq!(capture_chain(&mut session, &mut reader), Ok(Some("compute+0x20".to_string())));
    assert_eq!(
        capture_chain(&mut session, &mut reader),
        Err(CaptureError::Overrun(OverrunError { lost: Some(9) }))
    );
    assert_eq!(capture_chain(&mut session, &mut reader), Ok(Some("compute+0x10".to_string())));
}

#[test]
fn test_batch_in_collapsed_order() {
    let mut session = session();
    let ring = HeapRing::new(1024);
    ring.push_sample(&[0x1020, 0x1120]);
    ring.push_sample(&[0x1184]);

    let mut reader = RecordReader::new(&ring);
    let formatter = ChainFormatter::new(ChainOrder::OutermostFirst);
    let batch = capture_batch(&mut session, &mut reader, &formatter).unwrap();

    assert_eq!(batch.chains, vec!["main+0x20;compute+0x20", "main+0x84;helper:7"]);
    assert_eq!(format_batch(&batch.chains), "main+0x20;compute+0x20|main+0x84;helper:7|");
}

#[test]
fn test_caller_return_address_at_function_end() {
    let mut session = session();
    let ring = HeapRing::new(1024);
    // `compute` ends at 0x1050: a call as its last instruction returns there
    ring.push_sample(&[0x1120, 0x1050]);
    ring.push_sample(&[0x1050]);

    let mut reader = RecordReader::new(&ring);
    assert_eq!(
        capture_chain(&mut session, &mut reader),
        Ok(Some("main+0x20;compute+0x50".to_string()))
    );
    // Sampled there, the same address belongs to no function
    assert_eq!(capture_chain(&mut session, &mut reader), Ok(Some("0x1050".to_string())));
}
