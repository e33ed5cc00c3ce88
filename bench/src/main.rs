use precode::{
    LoaderHeap, MethodDef, MethodDescChunk, PrecodeCapabilities, PrecodeKind,
    TemporaryEntryPointAllocator, TemporaryEntryPoints, Trampolines,
};
use serde::Serialize;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Barrier;
use std::time::Instant;

const METHODS: u32 = 64;
const ITERATIONS: usize = 20_000;
const RACE_ROUNDS: usize = 200;

#[derive(Serialize)]
struct BenchmarkResult {
    name: String,
    kind: PrecodeKind,
    threads: usize,
    attempts: usize,
    wins: usize,
    secs: f64,
    ns_per_attempt: f64,
}

#[derive(Serialize)]
struct BenchmarkOutput {
    isa: String,
    results: Vec<BenchmarkResult>,
}

fn entry_points(stub_only: bool) -> TemporaryEntryPoints {
    let heap = LoaderHeap::with_defaults(Trampolines::for_tests());
    let flags = precode::MethodFlags {
        requires_md_calling_convention: stub_only,
        ..Default::default()
    };
    let chunk = MethodDescChunk::new(
        heap,
        (0..METHODS).map(|i| MethodDef::new(format!("m{}", i), 0x0600_0001 + i).with_flags(flags)),
    );
    let allocated = TemporaryEntryPointAllocator::host()
        .allocate(&chunk)
        .unwrap_or_else(|e| panic!("allocating entry points failed: {}", e));
    allocated
        .into_precodes()
        .unwrap_or_else(|| panic!("host ISA unexpectedly chose compact entry points"))
}

/// Every thread keeps retargeting every precode; the CAS fails whenever
/// another thread got there first.
fn bench_retarget(stub_only: bool, threads: usize) -> BenchmarkResult {
    let eps = entry_points(stub_only);
    let wins = AtomicUsize::new(0);
    let barrier = Barrier::new(threads);

    let start = Instant::now();
    std::thread::scope(|s| {
        for t in 0..threads {
            let eps = &eps;
            let wins = &wins;
            let barrier = &barrier;
            s.spawn(move || {
                let target = 0x7000_0000 + t * 0x1000;
                barrier.wait();
                let mut won = 0;
                for i in 0..ITERATIONS {
                    let precode = eps.get(i % eps.len()).unwrap_or_else(|| unreachable!());
                    if precode.set_target_interlocked(target, false).unwrap_or(false) {
                        won += 1;
                    }
                }
                wins.fetch_add(won, Ordering::Relaxed);
            });
        }
    });
    let secs = start.elapsed().as_secs_f64();
    let attempts = threads * ITERATIONS;

    BenchmarkResult {
        name: "retarget".to_string(),
        kind: eps.kind(),
        threads,
        attempts,
        wins: wins.into_inner(),
        secs,
        ns_per_attempt: secs * 1e9 / attempts as f64,
    }
}

/// Threads race to take every precode away from the prestub. Exactly one
/// wins per precode per round.
fn bench_first_call_race(stub_only: bool, threads: usize) -> BenchmarkResult {
    let eps = entry_points(stub_only);
    let wins = AtomicUsize::new(0);
    let mut secs = 0.0;

    for _ in 0..RACE_ROUNDS {
        for precode in eps.iter() {
            precode
                .reset()
                .unwrap_or_else(|e| panic!("reset failed: {}", e));
        }
        let barrier = Barrier::new(threads);
        let start = Instant::now();
        std::thread::scope(|s| {
            for t in 0..threads {
                let eps = &eps;
                let wins = &wins;
                let barrier = &barrier;
                s.spawn(move || {
                    barrier.wait();
                    for precode in eps.iter() {
                        let target = 0x7100_0000 + t * 0x1000;
                        if precode.set_target_interlocked(target, true).unwrap_or(false) {
                            wins.fetch_add(1, Ordering::Relaxed);
                        }
                    }
                });
            }
        });
        secs += start.elapsed().as_secs_f64();
    }

    let wins = wins.into_inner();
    let expected = RACE_ROUNDS * eps.len();
    if wins != expected {
        eprintln!("first call race: {} winners, expected {}", wins, expected);
    }
    let attempts = RACE_ROUNDS * eps.len() * threads;
    BenchmarkResult {
        name: "first_call_race".to_string(),
        kind: eps.kind(),
        threads,
        attempts,
        wins,
        secs,
        ns_per_attempt: secs * 1e9 / attempts as f64,
    }
}

fn main() {
    let mut results = Vec::new();
    for stub_only in [false, true] {
        for threads in [1, 2, 4, 8] {
            results.push(bench_retarget(stub_only, threads));
            results.push(bench_first_call_race(stub_only, threads));
        }
    }

    let output = BenchmarkOutput {
        isa: PrecodeCapabilities::host().isa.to_string(),
        results,
    };
    match serde_json::to_string_pretty(&output) {
        Ok(json) => println!("{}", json),
        Err(e) => eprintln!("failed to serialize results: {}", e),
    }
}
