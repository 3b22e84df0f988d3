use criterion::{BenchmarkId, Criterion, Throughput, criterion_group, criterion_main};
use fiballoc::FibAllocator;
use std::hint::black_box;

const OPS: u64 = 100_000;

/// fiballoc alloc/free throughput.
fn fiballoc_alloc_free(engine: &mut FibAllocator, size: usize) {
  for _ in 0..OPS {
    let ptr = engine.alloc(size);
    black_box(ptr);
    unsafe { engine.free(ptr) };
  }
}

/// libc alloc/free throughput.
fn libc_malloc_free(size: usize) {
  for _ in 0..OPS {
    unsafe {
      let ptr = libc::malloc(size);
      black_box(ptr);
      libc::free(ptr);
    }
  }
}

fn benchmark_alloc_throughput(c: &mut Criterion) {
  let mut group = c.benchmark_group("alloc_throughput");

  for size in [16, 64, 256, 1024, 4096] {
    group.throughput(Throughput::Elements(OPS));

    group.bench_with_input(BenchmarkId::new("fiballoc", size), &size, |b, &size| {
      let mut engine = FibAllocator::new();
      b.iter(|| fiballoc_alloc_free(&mut engine, size))
    });

    group.bench_with_input(BenchmarkId::new("libc", size), &size, |b, &size| {
      b.iter(|| libc_malloc_free(size))
    });
  }

  group.finish();
}

criterion_group!(benches, benchmark_alloc_throughput);
criterion_main!(benches);
