// this_file: tests/pool_integration.rs
//! Buffer pool behaviour through the public API

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread;
use surfpool::{Config, EntryState, PixelFormat, PoolConfig, SurfaceContext};

fn context(limits: PoolConfig) -> SurfaceContext {
    let mut config = Config::default();
    config.pool = limits;
    config.allocator.panic_on_invariant_violation = false;
    SurfaceContext::new(&config).unwrap()
}

#[test]
fn render_cycle_reuses_the_same_storage() {
    let ctx = context(PoolConfig::default());

    let first = ctx.acquire(800, 600, PixelFormat::Rgba32).unwrap();
    assert_eq!(first.bytes_per_row(), 3200);
    assert_eq!(first.length(), 3200 * 600);
    let block = first.block();
    let bits = first.bits();
    drop(first);

    let regions = ctx.provider().stats().regions_allocated;
    let second = ctx.acquire(800, 600, PixelFormat::Rgba32).unwrap();
    assert_eq!(second.block(), block);
    assert_eq!(second.bits(), bits);
    assert_eq!(ctx.provider().stats().regions_allocated, regions);
}

#[test]
fn shared_handles_release_once() {
    let ctx = context(PoolConfig::default());
    let bitmap = ctx.acquire(128, 128, PixelFormat::Rgb32).unwrap();

    let workers: Vec<_> = (0..8)
        .map(|_| {
            let bitmap = bitmap.clone();
            thread::spawn(move || {
                let mut copies = Vec::new();
                for _ in 0..100 {
                    copies.push(bitmap.clone());
                }
                for _ in 0..50 {
                    copies.pop();
                }
                copies
            })
        })
        .collect();
    let held: Vec<_> = workers.into_iter().map(|w| w.join().unwrap()).collect();

    assert_eq!(bitmap.ref_count(), 1 + 8 * 50);
    assert_eq!(ctx.pool().stats().acquired, 1);

    drop(held);
    assert_eq!(ctx.pool().stats().acquired, 1);
    drop(bitmap);

    let stats = ctx.pool().stats();
    assert_eq!(stats.acquired, 0);
    assert_eq!(stats.idle, 1);
}

#[test]
fn eviction_never_frees_acquired_surfaces() {
    let ctx = context(PoolConfig {
        max_idle_entries: 1,
        max_idle_bytes: 64 * 1024,
    });
    let stop = Arc::new(AtomicBool::new(false));

    let trimmer = {
        let pool = ctx.pool().clone();
        let stop = Arc::clone(&stop);
        thread::spawn(move || {
            while !stop.load(Ordering::Relaxed) {
                pool.purge();
                thread::yield_now();
            }
        })
    };

    let workers: Vec<_> = (0..6u8)
        .map(|id| {
            let ctx = ctx.clone();
            thread::spawn(move || {
                for round in 0..200u32 {
                    let width = 16 + (round % 3) * 16;
                    let bitmap = ctx.acquire(width, 16, PixelFormat::Gray8).unwrap();
                    let tag = id.wrapping_mul(41).wrapping_add(round as u8);
                    // SAFETY: this thread holds the only handle.
                    unsafe { bitmap.as_bytes_mut().fill(tag) };
                    thread::yield_now();
                    assert!(
                        bitmap.as_bytes().iter().all(|&b| b == tag),
                        "acquired surface was recycled under us"
                    );
                }
            })
        })
        .collect();
    for w in workers {
        w.join().unwrap();
    }
    stop.store(true, Ordering::Relaxed);
    trimmer.join().unwrap();

    assert!(ctx
        .pool()
        .entries()
        .iter()
        .all(|e| e.state == EntryState::Free));
    assert_eq!(ctx.pool().stats().acquired, 0);
    ctx.allocator().check_consistency().unwrap();
}

#[test]
fn pool_shutdown_returns_all_memory() {
    let ctx = context(PoolConfig::default());
    for w in 1..=5 {
        drop(ctx.acquire(w * 100, 100, PixelFormat::Rgba32).unwrap());
    }
    assert_eq!(ctx.pool().stats().idle, 5);

    let provider = Arc::clone(ctx.provider());
    drop(ctx);
    assert_eq!(provider.live_regions(), 0);
    assert_eq!(provider.stats().current_bytes, 0);
}

#[test]
fn purge_hands_storage_back_to_the_allocator() {
    let ctx = context(PoolConfig::default());
    let kept = ctx.acquire(64, 64, PixelFormat::Rgba32).unwrap();
    drop(ctx.acquire(32, 32, PixelFormat::Rgba32).unwrap());
    assert_eq!(ctx.allocator().stats().used_blocks, 2);

    assert_eq!(ctx.pool().purge(), 1);
    assert_eq!(ctx.allocator().stats().used_blocks, 1);
    drop(kept);
}
