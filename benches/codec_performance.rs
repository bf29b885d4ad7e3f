// Storage codec throughput on signature-sized and document-sized payloads
// Run with: cargo bench --bench codec_performance

use criterion::{black_box, criterion_group, criterion_main, Criterion};
use fieldsign_core::{decode_from_storage, encode_for_storage};

fn payload(len: usize) -> Vec<u8> {
    (0..len).map(|i| (i * 31 % 256) as u8).collect()
}

fn benchmark_storage_codec(c: &mut Criterion) {
    let signature = payload(8 * 1024);
    let document = payload(256 * 1024);

    c.bench_function("encode_signature_8k", |b| {
        b.iter(|| black_box(encode_for_storage(black_box(&signature))))
    });

    let stored = encode_for_storage(&document);
    c.bench_function("decode_document_256k", |b| {
        b.iter(|| black_box(decode_from_storage(black_box(&stored))))
    });

    let text = serde_json::to_string(&stored).unwrap_or_default();
    c.bench_function("parse_and_decode_document_256k", |b| {
        b.iter(|| {
            let value: serde_json::Value = serde_json::from_str(black_box(&text)).unwrap_or_default();
            black_box(decode_from_storage(&value))
        })
    });
}

criterion_group!(benches, benchmark_storage_codec);
criterion_main!(benches);
