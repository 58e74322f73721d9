use criterion::{black_box, criterion_group, criterion_main, Criterion};
use serde_json::json;

use turnwire::pipeline::{Normalizer, WireEncoder};
use turnwire::stream::decode_upstream_data;
use turnwire::stream::sse::SseParser;

fn upstream_body(text_chunks: usize) -> String {
    let mut body = String::new();
    for i in 0..text_chunks {
        let frame = json!({
            "id": "up",
            "choices": [{"index": 0, "delta": {"content": format!("token{i} ")}}]
        });
        body.push_str(&format!("data: {frame}\n\n"));
    }
    for piece in ["{\"city\":", "\"Paris\",", "\"unit\":\"c\"}"] {
        let frame = json!({
            "choices": [{"index": 0, "delta": {"tool_calls": [
                {"index": 0, "id": "call_1", "function": {"name": "get_weather", "arguments": piece}}
            ]}}]
        });
        body.push_str(&format!("data: {frame}\n\n"));
    }
    body.push_str("data: {\"choices\":[{\"index\":0,\"delta\":{},\"finish_reason\":\"tool_calls\"}]}\n\n");
    body.push_str("data: {\"choices\":[],\"usage\":{\"prompt_tokens\":40,\"completion_tokens\":260,\"total_tokens\":300}}\n\n");
    body.push_str("data: [DONE]\n\n");
    body
}

/// Split into network-sized pieces so the parser sees partial frames.
fn split_chunks(body: &str, size: usize) -> Vec<&str> {
    let mut chunks = Vec::new();
    let mut rest = body;
    while !rest.is_empty() {
        let mut end = size.min(rest.len());
        while !rest.is_char_boundary(end) {
            end += 1;
        }
        let (head, tail) = rest.split_at(end);
        chunks.push(head);
        rest = tail;
    }
    chunks
}

fn run_pipeline(chunks: &[&str]) -> usize {
    let mut parser = SseParser::new();
    let mut normalizer = Normalizer::new();
    let mut encoder = WireEncoder::new("chatcmpl-bench".to_string(), 0, "gpt-4o".to_string(), 40);
    let mut sse_events = Vec::new();
    let mut canonical = Vec::new();
    let mut out = String::new();

    for chunk in chunks {
        parser.feed_into(chunk, &mut sse_events);
        for event in sse_events.drain(..) {
            if let Ok(Some(decoded)) = decode_upstream_data(&event.data) {
                normalizer.push_chunk(decoded, &mut canonical);
            }
        }
        for event in canonical.drain(..) {
            encoder.encode(event, &mut out);
        }
    }
    if let Some(event) = normalizer.finish_input() {
        encoder.encode(event, &mut out);
    }
    encoder.finish(&mut out);
    out.len()
}

fn bench_pipeline(c: &mut Criterion) {
    let body = upstream_body(256);
    let chunks = split_chunks(&body, 512);

    c.bench_function("pipeline/normalize_encode_256_deltas", |b| {
        b.iter(|| black_box(run_pipeline(black_box(&chunks))));
    });

    c.bench_function("pipeline/sse_parse_only", |b| {
        b.iter(|| {
            let mut parser = SseParser::new();
            let mut events = Vec::new();
            for chunk in &chunks {
                parser.feed_into(black_box(chunk), &mut events);
            }
            black_box(events.len())
        });
    });
}

criterion_group!(benches, bench_pipeline);
criterion_main!(benches);
