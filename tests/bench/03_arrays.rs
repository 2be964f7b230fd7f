// Benchmark 03: arrays - build, scan, filter and reduce.
// Reference implementation for tests/bench/03_arrays.kn.

use std::time::Instant;

fn main() {
    // Part A: build via push
    let n_build: i64 = 100_000;
    let start = Instant::now();
    let mut a: Vec<i64> = Vec::new();
    for i in 0..n_build {
        a.push(i);
    }
    let ms = start.elapsed().as_secs_f64() * 1000.0;
    println!("[bench] array_build: {n_build} elements in {ms:.1} ms");

    // Part B: sequential index reads
    let start = Instant::now();
    let mut total: i64 = 0;
    for i in 0..a.len() {
        total += a[i];
    }
    let ms = start.elapsed().as_secs_f64() * 1000.0;
    println!(
        "[bench] array_scan: {} elements in {ms:.1} ms (result={total})",
        a.len()
    );

    // Part C: filter + reduce
    let start = Instant::now();
    let evens: Vec<i64> = a.iter().copied().filter(|v| v % 2 == 0).collect();
    let esum: i64 = evens.iter().sum();
    let ms = start.elapsed().as_secs_f64() * 1000.0;
    println!(
        "[bench] array_filter_reduce: {} elements in {ms:.1} ms (result={esum})",
        a.len()
    );
}
