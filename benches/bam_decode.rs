//! Benchmarks for the BAM read path
//!
//! - Sequential streaming of raw records through the BGZF reader
//! - Full record decode (bases, qualities, CIGAR, tags)
//! - SAM line formatting
//! - BAI chunk lookup
//!
//! Run with: cargo bench --bench bam_decode

use std::io::{Cursor, Write};

use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion, Throughput};
use ngs_bam::io::bam::{
    parse_sam_line, reg2bin, Bin, Chunk, Header, ReferenceIndex, RecordSource,
};
use ngs_bam::io::bgzf::{BgzfWriter, VirtualOffset};
use ngs_bam::{BamReader, ReadOutcome};

const HEADER: &str = "@HD\tVN:1.6\tSO:coordinate\n@SQ\tSN:chr1\tLN:250000000\n";

fn sam_line(i: usize) -> String {
    let bases: String = (0..100).map(|j| ['A', 'C', 'G', 'T'][(i + j) % 4]).collect();
    format!(
        "read_{i}\t0\tchr1\t{}\t60\t50M2I48M\t*\t0\t0\t{bases}\t{}\tNM:i:2\tRG:Z:grp1",
        i * 10 + 1,
        "I".repeat(100)
    )
}

/// BAM image holding `n` 100 bp reads
fn generate_bam(n: usize) -> Vec<u8> {
    let header = Header::from_sam_text(HEADER.to_string()).unwrap();
    let mut writer = BgzfWriter::new(Vec::new());
    writer.write_all(b"BAM\x01").unwrap();
    writer.write_all(&(HEADER.len() as i32).to_le_bytes()).unwrap();
    writer.write_all(HEADER.as_bytes()).unwrap();
    writer.write_all(&1i32.to_le_bytes()).unwrap();
    writer.write_all(&5i32.to_le_bytes()).unwrap();
    writer.write_all(b"chr1\0").unwrap();
    writer.write_all(&250_000_000i32.to_le_bytes()).unwrap();
    for i in 0..n {
        let body = parse_sam_line(sam_line(i).as_bytes(), &header).unwrap();
        writer.write_all(&(body.len() as i32).to_le_bytes()).unwrap();
        writer.write_all(&body).unwrap();
    }
    writer.finish().unwrap()
}

fn bench_sequential(c: &mut Criterion) {
    let mut group = c.benchmark_group("bam_sequential");

    for n in [1_000, 10_000] {
        let bytes = generate_bam(n);
        group.throughput(Throughput::Elements(n as u64));

        group.bench_with_input(BenchmarkId::new("read_raw", n), &bytes, |b, bytes| {
            b.iter(|| {
                let mut bam = BamReader::new(Cursor::new(bytes.as_slice())).unwrap();
                let mut count = 0usize;
                while let ReadOutcome::Record(record) = bam.next_record().unwrap() {
                    count += record.sequence_len();
                }
                black_box(count)
            });
        });

        group.bench_with_input(BenchmarkId::new("read_record", n), &bytes, |b, bytes| {
            b.iter(|| {
                let mut bam = BamReader::new(Cursor::new(bytes.as_slice())).unwrap();
                let decoded: usize = bam.records().map(|r| r.unwrap().sequence.len()).sum();
                black_box(decoded)
            });
        });
    }

    group.finish();
}

fn bench_format_sam(c: &mut Criterion) {
    let bytes = generate_bam(1_000);

    c.bench_function("format_sam_1k", |b| {
        b.iter(|| {
            let mut bam = BamReader::new(Cursor::new(bytes.as_slice())).unwrap();
            let header = bam.header().clone();
            let mut total = 0usize;
            while let ReadOutcome::Record(record) = bam.next_record().unwrap() {
                total += record.to_sam(&header).unwrap().len();
            }
            black_box(total)
        });
    });
}

/// Index over one chunk per 16 kbp window across 10 Mbp
fn generate_index() -> ReferenceIndex {
    let windows = 10_000_000u64 >> 14;
    let bins: Vec<Bin> = (0..windows)
        .map(|w| {
            let beg = (w << 14) as i64;
            let start = VirtualOffset::new(w * 20_000, 0);
            let end = VirtualOffset::new((w + 1) * 20_000, 0);
            Bin {
                bin_id: u32::from(reg2bin(beg, beg + 100)),
                chunks: vec![Chunk::new(start, end)],
            }
        })
        .collect();
    let intervals: Vec<u64> = (0..windows)
        .map(|w| VirtualOffset::new(w * 20_000, 0).as_raw())
        .collect();
    ReferenceIndex::new(bins, &intervals, None)
}

fn bench_index_slice(c: &mut Criterion) {
    let index = generate_index();
    let mut group = c.benchmark_group("index_slice");

    for width in [100u32, 100_000, 1_000_000] {
        group.bench_with_input(BenchmarkId::from_parameter(width), &width, |b, &width| {
            b.iter(|| black_box(index.merged_chunks(black_box(5_000_000), 5_000_000 + width)));
        });
    }

    group.finish();
}

criterion_group!(benches, bench_sequential, bench_format_sam, bench_index_slice);
criterion_main!(benches);
