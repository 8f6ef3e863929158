//! Revocation cost for deep and wide capability trees

use criterion::{black_box, criterion_group, criterion_main, BatchSize, BenchmarkId, Criterion};
use tilemux::kif::SEL_ACT;
use tilemux::tcu::ActId;
use tilemux::{CapRngDesc, Kernel, PlatformConfig, Selector, Syscall};

const ROOT: Selector = 10;

fn setup(shape: &str, n: u64) -> (Kernel, ActId) {
    let mut k = Kernel::new(PlatformConfig::default()).unwrap();
    let act = k.create_activity(0).unwrap();
    k.call(act, &Syscall::CreateSem { dst: ROOT, value: 0 }).unwrap();
    for i in 1..=n {
        let src = if shape == "chain" { ROOT + i - 1 } else { ROOT };
        k.call(act, &Syscall::Derive { act: SEL_ACT, src, dst: ROOT + i }).unwrap();
    }
    (k, act)
}

fn bench_revoke(c: &mut Criterion) {
    let mut group = c.benchmark_group("revoke");
    for shape in ["chain", "fan"] {
        for n in [16u64, 256, 2048] {
            group.bench_with_input(BenchmarkId::new(shape, n), &n, |b, &n| {
                b.iter_batched(
                    || setup(shape, n),
                    |(mut k, act)| {
                        let revoke = Syscall::Revoke { act: SEL_ACT, crd: CapRngDesc::one(ROOT), own: true };
                        black_box(k.call(act, &revoke).unwrap());
                        k
                    },
                    BatchSize::SmallInput,
                );
            });
        }
    }
    group.finish();
}

criterion_group!(benches, bench_revoke);
criterion_main!(benches);
