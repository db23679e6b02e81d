//! Criterion benchmarks for cc2svn-core.
//!
//! ## Benchmark groups
//!
//! 1. **parser**: `lshistory` record splitting and event mapping.
//! 2. **planning**: Topology observation plus commit grouping.
//! 3. **assembly**: Planning, assembly and dump writing end to end, with
//!    inline content so no cache I/O is measured.
//!
//! ## Running
//!
//! ```sh
//! cargo bench --manifest-path crates/cc2svn-core/Cargo.toml
//! # Run only the planning group:
//! cargo bench --manifest-path crates/cc2svn-core/Cargo.toml -- planning
//! ```

use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion};

use cc2svn_core::assembler::{plan_groups, Assembler, ContentResolver, ConversionState};
use cc2svn_core::autoprops::AutoProps;
use cc2svn_core::cache::{BlobReader, MemoryBlobs};
use cc2svn_core::config::EngineConfig;
use cc2svn_core::dump::DumpWriter;
use cc2svn_core::errors::ConvertResult;
use cc2svn_core::filters::Filters;
use cc2svn_core::history::parser::HistoryParser;
use cc2svn_core::models::{
    BlobRef, ChangeEvent, ElementVersion, EventKind, NodeContent, Timestamp, VersionId,
};
use cc2svn_core::ContentCache;

// ---------------------------------------------------------------------------
// Helpers
// ---------------------------------------------------------------------------

/// `n` events over 50 directories and three branches, five authors, with
/// bursts that fold into multi-file revisions.
fn synthetic_history(n: usize) -> Vec<ChangeEvent> {
    (0..n)
        .map(|i| {
            let branch = match i % 10 {
                0..=6 => "/main",
                7 | 8 => "/main/dev",
                _ => "/main/dev/fix",
            };
            let author = format!("user{}", i % 5);
            ChangeEvent {
                element: format!("dir{}/file{}.c", i % 50, i % 400),
                version: VersionId::parse(&format!("{branch}/{}", i / 400 + 1)).unwrap(),
                timestamp: Timestamp::from_unix(1_000_000 + (i as i64) * 37),
                comment: format!("{author} batch {}", i / 25),
                author,
                kind: EventKind::ContentModify,
            }
        })
        .collect()
}

fn synthetic_lshistory(n: usize) -> String {
    (0..n)
        .rev()
        .map(|i| {
            format!(
                "2020{:02}{:02}.1200{:02}@@@src/file{i}.c@@@/main/{}@@@checkin@@@(REL_{i})@@@@@@version@@@user{}@@@comment line one\nline two@@@\n",
                i % 12 + 1,
                i % 28 + 1,
                i % 60,
                i + 1,
                i % 5
            )
        })
        .collect()
}

struct InlineContent;

impl ContentResolver for InlineContent {
    fn resolve(&mut self, version: &ElementVersion) -> ConvertResult<NodeContent> {
        Ok(NodeContent::Inline(version.key().into_bytes()))
    }
}

struct NoBlobs;

impl BlobReader for NoBlobs {
    fn read_blob(&self, _blob: &BlobRef) -> ConvertResult<Vec<u8>> {
        Ok(Vec::new())
    }
}

// ---------------------------------------------------------------------------
// 1. parser
// ---------------------------------------------------------------------------

fn bench_parser(c: &mut Criterion) {
    let mut group = c.benchmark_group("parser");
    let parser = HistoryParser::new();
    for size in [100usize, 1_000] {
        let text = synthetic_lshistory(size);
        group.bench_with_input(BenchmarkId::new("parse", size), &text, |b, text| {
            b.iter(|| parser.parse(black_box(text)).unwrap())
        });
    }
    group.finish();
}

// ---------------------------------------------------------------------------
// 2. planning
// ---------------------------------------------------------------------------

fn bench_planning(c: &mut Criterion) {
    let mut group = c.benchmark_group("planning");
    for size in [1_000usize, 10_000] {
        let events = synthetic_history(size);
        group.bench_with_input(BenchmarkId::new("plan_groups", size), &events, |b, events| {
            b.iter(|| {
                let mut state = ConversionState::fresh(&EngineConfig::default());
                plan_groups(black_box(events.clone()), 300, &mut state.topology)
            })
        });
    }
    group.finish();
}

// ---------------------------------------------------------------------------
// 3. assembly
// ---------------------------------------------------------------------------

fn bench_assembly(c: &mut Criterion) {
    let mut group = c.benchmark_group("assembly");
    group.sample_size(20);
    let config = EngineConfig::default();
    let filters = Filters::default();
    let autoprops = AutoProps::parse("*.c = svn:eol-style=native\n*.sh = svn:executable").unwrap();

    for size in [1_000usize, 5_000] {
        let events = synthetic_history(size);
        group.bench_with_input(BenchmarkId::new("assemble_and_write", size), &events, |b, events| {
            b.iter(|| {
                let mut state = ConversionState::fresh(&config);
                let groups = plan_groups(events.clone(), 300, &mut state.topology);
                let assembler = Assembler::new(&config, &filters, &autoprops);
                let mut writer = DumpWriter::new(Vec::with_capacity(1 << 20));
                writer.write_header().unwrap();
                for g in &groups {
                    if let Some(record) = assembler.assemble(&mut state, g, &mut InlineContent).unwrap().record {
                        writer.write_record(&record, &NoBlobs).unwrap();
                    }
                }
                black_box(writer.offset())
            })
        });
    }

    // Cache round trip through the verifying blob store.
    let dir = tempfile::tempdir().unwrap();
    let cache = ContentCache::open(dir.path(), true).unwrap();
    let mut source = MemoryBlobs::new();
    source.insert("a.c", "/main/1", vec![b'x'; 64 * 1024]);
    let version = ElementVersion::new("a.c", VersionId::parse("/main/1").unwrap());
    let policy = config.retry.clone();
    group.bench_function("cache_fetch_through_hit", |b| {
        b.iter(|| cache.fetch_through(&source, &policy, black_box(&version)).unwrap())
    });
    group.finish();
}

criterion_group!(benches, bench_parser, bench_planning, bench_assembly);
criterion_main!(benches);
