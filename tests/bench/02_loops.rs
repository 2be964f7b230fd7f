// Benchmark 02: loops - iteration overhead.
// Reference implementation for tests/bench/02_loops.kn.

use std::hint::black_box;
use std::time::Instant;

fn main() {
    // Part A: counting loop
    let n_count: i64 = 1_000_000;
    let start = Instant::now();
    let mut x: i64 = 0;
    for _ in 0..n_count {
        x += 1;
    }
    let ms = start.elapsed().as_secs_f64() * 1000.0;
    println!(
        "[bench] loops_count: {n_count} iterations in {ms:.1} ms (result={})",
        black_box(x)
    );

    // Part B: arithmetic body
    let n_arith: i64 = 500_000;
    let start = Instant::now();
    let mut s: i64 = 0;
    for i in 0..n_arith {
        s += i * i % 7;
    }
    let ms = start.elapsed().as_secs_f64() * 1000.0;
    println!(
        "[bench] loops_arith: {n_arith} iterations in {ms:.1} ms (result={})",
        black_box(s)
    );

    // Part C: while loop
    let n_while: i64 = 500_000;
    let start = Instant::now();
    let mut m = n_while;
    while m > 0 {
        m -= 1;
    }
    let ms = start.elapsed().as_secs_f64() * 1000.0;
    println!(
        "[bench] loops_while: {n_while} iterations in {ms:.1} ms (result={})",
        black_box(m)
    );
}
