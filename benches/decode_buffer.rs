use bt_media_backend::audio::{DecodeBuffer, DecodeBufferParams, RateController};
use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion, Throughput};

const RATE: u32 = 48_000;
const FRAME_SIZE: usize = 4;

/// One graph period: packets in, rate control, one period out
fn bench_period(c: &mut Criterion) {
    let mut group = c.benchmark_group("decode_buffer_period");

    for period in [256u32, 1024, 2048] {
        group.throughput(Throughput::Bytes(u64::from(period) * FRAME_SIZE as u64));

        group.bench_with_input(BenchmarkId::from_parameter(period), &period, |b, &period| {
            let mut buffer = DecodeBuffer::new(DecodeBufferParams::new(FRAME_SIZE, RATE, 8192));
            let packet = (period as usize / 2) * FRAME_SIZE;
            b.iter(|| {
                for _ in 0..2 {
                    let region = buffer.get_write();
                    let n = packet.min(region.len());
                    region[..n].fill(0x55);
                    buffer.write_packet(n);
                }
                buffer.process(black_box(period), period);
                let size = buffer.get_read().len().min(period as usize * FRAME_SIZE);
                buffer.read(size);
                black_box(buffer.corr())
            });
        });
    }

    group.finish();
}

/// The rate controller update alone, fed a noisy level
fn bench_rate_controller(c: &mut Criterion) {
    c.bench_function("rate_controller_update", |b| {
        let mut ctl = RateController::new(1024.0);
        let mut tick = 0u32;
        b.iter(|| {
            tick = tick.wrapping_add(1);
            let level = 1024.0 + f64::from(tick % 97) - 48.0;
            black_box(ctl.update(black_box(level), 1024.0, 1024.0, 48_000.0, 0.005))
        });
    });
}

criterion_group!(benches, bench_period, bench_rate_controller);
criterion_main!(benches);
