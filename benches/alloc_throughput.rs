use criterion::{BenchmarkId, Criterion, Throughput, criterion_group, criterion_main};
use nbbuddy::{BuddyAllocator, Config, Heuristic};
use std::hint::black_box;

const OPS: u64 = 100_000;
const THREADS: usize = 4;

fn allocator(heuristic: Heuristic) -> BuddyAllocator {
  let conf = Config::default()
    .with_levels(16)
    .with_max_order(10)
    .with_heuristic(heuristic);
  BuddyAllocator::new(conf).expect("allocator")
}

/// nbbuddy alloc/free throughput, one thread.
fn nbbuddy_alloc_free(alloc: &BuddyAllocator, size: usize) {
  for _ in 0..OPS {
    let ptr = alloc.allocate(size).expect("alloc");
    black_box(ptr);
    unsafe { alloc.deallocate(ptr).expect("free") };
  }
}

/// Same loop split across threads sharing one allocator.
fn nbbuddy_alloc_free_mt(alloc: &BuddyAllocator, size: usize) {
  std::thread::scope(|s| {
    for _ in 0..THREADS {
      s.spawn(|| {
        for _ in 0..OPS / THREADS as u64 {
          let ptr = alloc.allocate(size).expect("alloc");
          black_box(ptr);
          unsafe { alloc.deallocate(ptr).expect("free") };
        }
      });
    }
  });
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
  let ema = allocator(Heuristic::Ema);
  let off = allocator(Heuristic::Off);

  for size in [4096, 16 << 10, 256 << 10, 4 << 20] {
    group.throughput(Throughput::Elements(OPS));

    group.bench_with_input(BenchmarkId::new("nbbuddy-ema", size), &size, |b, &size| {
      b.iter(|| nbbuddy_alloc_free(&ema, size))
    });

    group.bench_with_input(BenchmarkId::new("nbbuddy-off", size), &size, |b, &size| {
      b.iter(|| nbbuddy_alloc_free(&off, size))
    });

    group.bench_with_input(BenchmarkId::new("nbbuddy-mt", size), &size, |b, &size| {
      b.iter(|| nbbuddy_alloc_free_mt(&ema, size))
    });

    group.bench_with_input(BenchmarkId::new("libc", size), &size, |b, &size| {
      b.iter(|| libc_malloc_free(size))
    });
  }

  group.finish();
}

criterion_group!(benches, benchmark_alloc_throughput);
criterion_main!(benches);
