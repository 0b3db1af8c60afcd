//! Replay hot-path benchmarks
//!
//! Chunked body parsing, HTML script injection, and archive lookups

use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion};
use std::sync::Arc;
use tokio::runtime::Runtime;
use webreplay::archive::{Archive, MemoryArchive};
use webreplay::chunked::read_chunks;
use webreplay::inject::inject_script;
use webreplay::record::{ArchivedRequest, ArchivedResponse, HeaderList};

/// `count` chunks of `size` bytes each, chunked-encoded
fn chunked_body(count: usize, size: usize) -> Vec<u8> {
    let chunk = "x".repeat(size);
    let mut out = Vec::with_capacity(count * (size + 8) + 5);
    for _ in 0..count {
        out.extend_from_slice(format!("{:x}\r\n{}\r\n", size, chunk).as_bytes());
    }
    out.extend_from_slice(b"0\r\n\r\n");
    out
}

fn bench_chunk_parsing(c: &mut Criterion) {
    let rt = Runtime::new().unwrap();
    let mut group = c.benchmark_group("chunk_parsing");

    for (count, size) in [(4, 1024), (64, 1024), (16, 64 * 1024)] {
        let body = chunked_body(count, size);
        group.bench_with_input(
            BenchmarkId::from_parameter(format!("{}x{}", count, size)),
            &body,
            |b, body| {
                b.to_async(&rt).iter(|| async {
                    let mut reader: &[u8] = black_box(body.as_slice());
                    read_chunks(&mut reader, true).await.unwrap()
                })
            },
        );
    }

    group.finish();
}

fn html_page(body_size: usize) -> Arc<ArchivedResponse> {
    let mut headers = HeaderList::new();
    headers.push("Content-Type", "text/html; charset=utf-8");
    let body = format!(
        "<!DOCTYPE html><html><head><title>t</title></head><body>{}</body></html>",
        "<p>content</p>".repeat(body_size / 14)
    );
    Arc::new(ArchivedResponse::simple(200, "OK", headers, body))
}

fn bench_injection(c: &mut Criterion) {
    let mut group = c.benchmark_group("script_injection");
    let script = include_str!("../scripts/deterministic.js");

    for size in [4 * 1024, 256 * 1024] {
        let page = html_page(size);
        group.bench_with_input(BenchmarkId::new("inject", size), &page, |b, page| {
            b.iter(|| inject_script(black_box(page), Some(script)))
        });
    }

    // Already injected: the no-op path
    let injected = inject_script(&html_page(4 * 1024), Some(script));
    group.bench_function("already_injected", |b| {
        b.iter(|| inject_script(black_box(&injected), Some(script)))
    });

    group.finish();
}

fn bench_archive_lookup(c: &mut Criterion) {
    let rt = Runtime::new().unwrap();
    let archive = MemoryArchive::new();
    let response = Arc::new(ArchivedResponse::simple(200, "OK", HeaderList::new(), "ok"));

    rt.block_on(async {
        for i in 0..1000 {
            archive
                .put(
                    ArchivedRequest::get("bench.example", format!("/resource/{}", i), true),
                    Arc::clone(&response),
                )
                .await;
        }
    });

    let mut group = c.benchmark_group("archive_lookup");
    let hit = ArchivedRequest::get("bench.example", "/resource/500", true);
    let near = ArchivedRequest::get("bench.example", "/resource/5000", true);

    group.bench_function("exact_hit", |b| {
        b.to_async(&rt).iter(|| archive.get(black_box(&hit)))
    });
    group.bench_function("closest_match_1000", |b| {
        b.to_async(&rt).iter(|| archive.find_closest(black_box(&near), true))
    });

    group.finish();
}

criterion_group!(benches, bench_chunk_parsing, bench_injection, bench_archive_lookup);
criterion_main!(benches);
