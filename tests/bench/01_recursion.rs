// Benchmark 01: recursion - naive recursive Fibonacci.
// Reference implementation for tests/bench/01_recursion.kn.

use std::time::Instant;

fn fib(n: i64) -> i64 {
    if n < 2 { n } else { fib(n - 1) + fib(n - 2) }
}

fn main() {
    let n = 30;
    let start = Instant::now();
    let r = fib(n);
    let ms = start.elapsed().as_secs_f64() * 1000.0;
    println!("[bench] recursion: fib({n}) = {r} in {ms:.1} ms");
}
