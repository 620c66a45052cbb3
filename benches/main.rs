use criterion::criterion_group;
use criterion::criterion_main;
use criterion::Criterion;

// Pick the benchmark via the SCYTHE_BENCH env var:
//   SCYTHE_BENCH=table cargo bench
//   SCYTHE_BENCH=pages cargo bench


fn bench_main(c: &mut Criterion) {
    match std::env::var("SCYTHE_BENCH") {
        Ok(bench) => match bench.as_str() {
            "table" => table::bench(c),
            "pages" => pages::bench(c),
            _ => panic!("unknown benchmark {:?}", bench),
        },
        Err(_) => panic!("need to name a benchmark via the env var SCYTHE_BENCH"),
    }
}

criterion_group!(benches, bench_main);
criterion_main!(benches);
