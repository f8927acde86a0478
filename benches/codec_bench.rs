//! Codec encode / decode benchmarks

use std::sync::Arc;

use criterion::{black_box, criterion_group, criterion_main, Criterion};
use voltage_plc::{
    A1eCodec, FinsCodec, FrameCodec, HostLinkCodec, McCodec, Operation, SessionContext,
};

fn codecs() -> Vec<Arc<dyn FrameCodec>> {
    vec![
        Arc::new(A1eCodec::binary()),
        Arc::new(A1eCodec::ascii()),
        Arc::new(McCodec::binary()),
        Arc::new(McCodec::ascii()),
        Arc::new(FinsCodec::udp()),
        Arc::new(HostLinkCodec::new(0)),
    ]
}

/// Resolve, split and encode a 64-word read
fn bench_encode(c: &mut Criterion) {
    let mut group = c.benchmark_group("encode_read");
    for codec in codecs() {
        let spec = codec.resolve("D100").unwrap();
        group.bench_function(codec.name(), |b| {
            let mut session = codec.new_session();
            b.iter(|| {
                codec
                    .encode_request(black_box(&spec), Operation::Read, 64, None, &mut session)
                    .unwrap()
            })
        });
    }
    group.finish();
}

/// Decode the server's reply to a 16-word read
fn bench_decode(c: &mut Criterion) {
    let mut group = c.benchmark_group("decode_response");
    for codec in codecs() {
        let spec = codec.resolve("D100").unwrap();
        let mut session = codec.new_session();
        let (frame, bytes) = codec
            .encode_request(&spec, Operation::Read, 16, None, &mut session)
            .unwrap()
            .remove(0);
        let mut server_session = SessionContext::default();
        let request = match codec.decode_inbound(&bytes, &mut server_session).unwrap() {
            voltage_plc::protocol::Inbound::Command(request) => request,
            other => panic!("unexpected inbound {:?}", other),
        };
        let payload = voltage_plc::DataPayload::Bytes(vec![0x5A; 32]);
        let reply = codec.encode_reply(&request, 0, Some(&payload), &server_session).unwrap();

        group.bench_function(codec.name(), |b| {
            b.iter(|| codec.decode_response(black_box(&reply), &frame, &session).unwrap())
        });
    }
    group.finish();
}

criterion_group!(benches, bench_encode, bench_decode);
criterion_main!(benches);
