//! End-to-end lifecycle tests driving the pool through its public API the
//! way a decoder and presenter pair would.

use std::sync::Arc;
use std::time::{Duration, Instant};

use framepool::{
    BufferQueue, Dimensions, FramePool, PixelFormat, PoolConfig, PoolError, SoftwareBridge,
    SurfaceHandle,
};

const DIMS: Dimensions = Dimensions {
    width: 64,
    height: 48,
};

fn make_pool(pool_size: usize, bridge: Arc<SoftwareBridge>) -> FramePool {
    let config = PoolConfig {
        pool_size,
        reserved_for_overlay: 0,
        ..Default::default()
    };
    FramePool::new(config, bridge, PixelFormat::Yuv420p, DIMS).unwrap()
}

fn token_of(pool: &FramePool, id: framepool::FrameId) -> SurfaceHandle {
    pool.registry()
        .slot(id)
        .with_content(|c| c.render_token)
        .unwrap()
}

#[test]
fn exhausted_pool_rejects_further_acquires() {
    let pool = make_pool(4, Arc::new(SoftwareBridge::accelerated()));
    let mut held = Vec::new();
    for _ in 0..4 {
        held.push(pool.get_next_free_frame(false).unwrap());
    }
    assert!(matches!(
        pool.get_next_free_frame(false),
        Err(PoolError::PoolExhausted)
    ));

    // returning one frame makes acquisition succeed again
    let recycled = held.pop().unwrap();
    pool.submit(recycled);
    pool.show(recycled).unwrap();
    pool.done_displaying_frame();
    assert!(pool.get_next_free_frame(false).is_ok());
}

#[test]
fn parent_stays_out_of_free_until_overlay_resolves() {
    let bridge = Arc::new(SoftwareBridge::accelerated());
    let pool = make_pool(4, bridge.clone());

    let parent = pool.get_next_free_frame(false).unwrap();
    let child = pool.acquire_for_overlay().unwrap();
    pool.attach_overlay(parent, child).unwrap();
    pool.submit(parent);
    pool.show(parent).unwrap();

    bridge.set_status(token_of(&pool, child), false, true);
    for _ in 0..3 {
        pool.reclaim_sweep();
    }
    assert!(!pool.registry().contains(BufferQueue::Free, parent));
    assert!(!pool.registry().contains(BufferQueue::Free, child));

    bridge.set_status(token_of(&pool, child), false, false);
    pool.reclaim_sweep();
    assert!(pool.registry().contains(BufferQueue::Free, parent));
    assert!(pool.registry().contains(BufferQueue::Free, child));
}

#[test]
fn proxy_policy_holds_pair_on_parent_status() {
    let bridge = Arc::new(SoftwareBridge::accelerated_parent_poll_only());
    let pool = make_pool(4, bridge.clone());

    let parent = pool.get_next_free_frame(false).unwrap();
    let child = pool.acquire_for_overlay().unwrap();
    pool.attach_overlay(parent, child).unwrap();
    pool.submit(parent);
    pool.show(parent).unwrap();

    // only the parent surface is pollable; its status stands for both
    bridge.set_status(token_of(&pool, parent), false, true);
    pool.reclaim_sweep();
    assert!(!pool.registry().contains(BufferQueue::Free, parent));

    bridge.set_status(token_of(&pool, parent), false, false);
    pool.reclaim_sweep();
    assert!(pool.registry().contains(BufferQueue::Free, parent));
    assert!(pool.registry().contains(BufferQueue::Free, child));
}

#[test]
fn freeze_without_displayed_frame_copies_into_scratch() {
    // a plain software bridge has no frozen-surface support, forcing the
    // pixel-copy path
    let pool = make_pool(4, Arc::new(SoftwareBridge::new()));

    let id = pool.get_next_free_frame(false).unwrap();
    pool.fill_frame(id, |storage| storage.planes[0].data.fill(0xAB));
    pool.submit(id);

    assert!(pool.freeze());
    assert_eq!(pool.registry().size(BufferQueue::Pause), 1);
    let scratch = pool.registry().scratch_id();
    assert!(pool.registry().contains(BufferQueue::Pause, scratch));
    pool.registry().slot(scratch).with_content(|c| {
        assert!(c.storage.planes[0].data.iter().all(|&px| px == 0xAB));
    });

    pool.unfreeze();
    assert_eq!(pool.registry().size(BufferQueue::Pause), 0);
    assert!(pool.registry().contains(BufferQueue::Free, scratch));
}

#[test]
fn keyframe_discard_flushes_every_queue() {
    let pool = make_pool(6, Arc::new(SoftwareBridge::accelerated()));

    for _ in 0..2 {
        let id = pool.get_next_free_frame(false).unwrap();
        pool.submit(id);
        pool.show(id).unwrap();
    }
    for _ in 0..3 {
        let id = pool.get_next_free_frame(false).unwrap();
        pool.submit(id);
    }
    assert!(pool.freeze());
    assert_eq!(pool.registry().size(BufferQueue::Used), 3);

    pool.discard_frames(true);
    assert_eq!(pool.registry().size(BufferQueue::Used), 0);
    assert_eq!(pool.registry().size(BufferQueue::Displayed), 0);
    assert_eq!(pool.registry().size(BufferQueue::Pause), 0);
    assert_eq!(
        pool.registry().size(BufferQueue::Free),
        pool.registry().slots().len()
    );
}

#[test]
fn soft_discard_preserves_picture_on_screen() {
    let bridge = Arc::new(SoftwareBridge::accelerated());
    let pool = make_pool(4, bridge.clone());

    let shown = pool.get_next_free_frame(false).unwrap();
    pool.submit(shown);
    pool.show(shown).unwrap();
    bridge.set_status(token_of(&pool, shown), false, true);

    let queued = pool.get_next_free_frame(false).unwrap();
    pool.submit(queued);

    pool.discard_frames(false);
    assert!(pool.registry().contains(BufferQueue::Free, queued));
    // the on-screen frame survives a soft flush
    assert!(pool.registry().contains(BufferQueue::Displayed, shown));
}

#[test]
fn frames_return_to_free_with_no_locks_held() {
    let pool = make_pool(3, Arc::new(SoftwareBridge::accelerated()));
    for _ in 0..9 {
        let id = pool.get_next_free_frame(false).unwrap();
        pool.fill_frame(id, |storage| storage.planes[0].data.fill(1));
        pool.submit(id);
        pool.show(id).unwrap();
        pool.done_displaying_frame();
        assert!(pool.registry().contains(BufferQueue::Free, id));
        assert_eq!(pool.registry().slot(id).lock_count(), 0);
    }
}

#[test]
fn submit_sequences_are_strictly_increasing() {
    let pool = make_pool(4, Arc::new(SoftwareBridge::accelerated()));
    let mut last = 0;
    for _ in 0..12 {
        let id = pool.get_next_free_frame(false).unwrap();
        let seq = pool.submit(id);
        assert!(seq > last);
        last = seq;
        pool.show(id).unwrap();
        pool.done_displaying_frame();
    }
}

#[test]
fn detach_overlay_is_idempotent() {
    let pool = make_pool(4, Arc::new(SoftwareBridge::accelerated()));
    let parent = pool.get_next_free_frame(false).unwrap();
    let child = pool.acquire_for_overlay().unwrap();

    pool.attach_overlay(parent, child).unwrap();
    assert_eq!(pool.detach_overlay(parent), Some(child));
    assert_eq!(pool.detach_overlay(parent), None);
    assert_eq!(pool.detach_overlay(parent), None);
}

#[test]
fn concurrent_decode_and_present() {
    let pool = Arc::new(make_pool(4, Arc::new(SoftwareBridge::accelerated())));
    const TOTAL: u64 = 60;

    let producer = {
        let pool = Arc::clone(&pool);
        std::thread::spawn(move || {
            let deadline = Instant::now() + Duration::from_secs(10);
            for n in 0..TOTAL {
                let id = loop {
                    match pool.get_next_free_frame(false) {
                        Ok(id) => break id,
                        Err(PoolError::PoolExhausted) => {
                            assert!(Instant::now() < deadline, "starved at frame {n}");
                            std::thread::sleep(Duration::from_millis(1));
                        }
                        Err(e) => panic!("acquire failed: {e}"),
                    }
                };
                pool.fill_frame(id, |storage| {
                    storage.planes[0].data.fill((n % 251) as u8);
                });
                pool.submit(id);
            }
        })
    };

    let mut shown = 0u64;
    let deadline = Instant::now() + Duration::from_secs(10);
    while shown < TOTAL {
        assert!(Instant::now() < deadline, "presenter stalled at {shown}");
        match pool.next_frame_to_show() {
            Some(id) => {
                pool.show(id).unwrap();
                pool.done_displaying_frame();
                shown += 1;
            }
            None => std::thread::sleep(Duration::from_millis(1)),
        }
    }
    producer.join().unwrap();

    pool.reclaim_sweep();
    assert_eq!(
        pool.registry().size(BufferQueue::Free),
        pool.registry().slots().len()
    );
}

#[test]
fn teardown_fails_blocked_acquire() {
    let pool = Arc::new(make_pool(2, Arc::new(SoftwareBridge::accelerated())));
    let _a = pool.get_next_free_frame(false).unwrap();
    let _b = pool.get_next_free_frame(false).unwrap();

    let waiter = {
        let pool = Arc::clone(&pool);
        std::thread::spawn(move || pool.get_next_free_frame(false))
    };
    std::thread::sleep(Duration::from_millis(5));
    pool.teardown();
    match waiter.join().unwrap() {
        Err(PoolError::PoolTornDown) | Err(PoolError::PoolExhausted) => {}
        other => panic!("expected failure after teardown, got {other:?}"),
    }
    assert!(matches!(
        pool.get_next_free_frame(false),
        Err(PoolError::PoolTornDown)
    ));
}
