//! Engine tests against the simulated kernel
//!
//! Run with: cargo test --test engine

mod capture;
mod orchestrator;
mod transmit;

use pktring::ring::{page_size, Direction, Ring, RingAllocator, RingGeometry};
use pktring::testkit::SimKernel;
use std::time::{Duration, Instant};

/// 4 blocks of 8 frames each, or of one page each where pages are larger
/// than 16 KiB.
fn small_geometry() -> RingGeometry {
    let block = (8 * 2048).max(page_size()) as u32;
    RingGeometry::new(2048, block, 4).expect("valid geometry")
}

#[test]
fn test_small_geometry_layout() {
    let geometry = small_geometry();
    assert_eq!(geometry.block_count(), 4);
    assert_eq!(geometry.frames_per_block() * 2048, geometry.block_size());
    if page_size() <= 8 * 2048 {
        assert_eq!(geometry.frames_per_block(), 8);
        assert_eq!(geometry.frame_count(), 32);
    }
}

fn open_ring(sim: &mut SimKernel, geometry: RingGeometry, direction: Direction) -> Ring {
    RingAllocator::new(geometry, direction)
        .allocate(sim)
        .expect("simulated ring")
}

/// Polls `cond` until it holds or `timeout` passes.
fn wait_until(timeout: Duration, mut cond: impl FnMut() -> bool) -> bool {
    let deadline = Instant::now() + timeout;
    while Instant::now() < deadline {
        if cond() {
            return true;
        }
        std::thread::sleep(Duration::from_millis(1));
    }
    cond()
}
