// SPDX-License-Identifier: CEPL-1.0
mod common;

use std::{
    sync::{atomic::Ordering, mpsc, Arc},
    thread,
    time::Duration,
};

use common::{id, raw, MockBackend, MockSource, MockWindow, SharedJournal};
use vidsurf_render::{
    event_queue, CacheError, ControlEvent, EventSender, RenderError, RenderLoop, Renderer,
    SwapchainStatus,
};

fn manual_loop(journal: &SharedJournal) -> (EventSender, RenderLoop<MockBackend>) {
    let (tx, rx) = event_queue();
    let backend = MockBackend::new(journal.clone(), 3);
    (tx.clone(), RenderLoop::new(backend, tx, rx))
}

type Harness = (EventSender, RenderLoop<MockBackend>, Arc<MockSource>);

fn bring_up(journal: &SharedJournal, first: usize) -> Harness {
    bring_up_with(journal, first, false)
}

/// Bind, start, unpause, with `first` already decoded. Leaves one frame presented.
fn bring_up_with(journal: &SharedJournal, first: usize, gpu_stalled: bool) -> Harness {
    let (tx, mut rl) = manual_loop(journal);
    rl.backend().stall_handle().store(gpu_stalled, Ordering::SeqCst);
    let source = MockSource::new(journal.clone());
    source.push(raw(first));

    tx.send(ControlEvent::BindWindow(MockWindow::arc(640, 480)))
        .unwrap();
    tx.send(ControlEvent::Start(source.clone())).unwrap();
    tx.send(ControlEvent::Unpause).unwrap();
    for _ in 0..3 {
        assert!(rl.step().unwrap());
    }
    assert_eq!(rl.frames_presented(), 1);
    (tx, rl, source)
}

#[test]
fn one_frame_per_decoded_buffer() {
    let journal = SharedJournal::default();
    let source = MockSource::new(journal.clone());
    let renderer = Renderer::spawn(MockBackend::new(journal.clone(), 3)).unwrap();

    renderer.bind_window(MockWindow::arc(640, 480));
    renderer.start(source.clone());
    renderer.unpause();
    source.wait_listening();

    for n in 1..=20 {
        source.announce(raw(n));
        source.wait_drained();
        source.remove(raw(n));
    }
    source.finish();
    drop(renderer);

    let journal = journal.lock();
    let expected: Vec<_> = (1..=20).map(id).collect();
    assert_eq!(journal.presented, expected);
    assert_eq!(journal.count_prefix("release"), 20);
    // Every buffer was reclaimed after its frame completed, so every import went away.
    assert_eq!(journal.count_prefix("evict"), 20);
    for n in 1..=20 {
        let evicted = journal.position(&format!("evict {:?}", id(n))).unwrap();
        let released = journal.position(&format!("release {:?}", id(n))).unwrap();
        assert!(released < evicted, "buffer {n} evicted while on screen");
    }
    assert_eq!(journal.log.last().map(String::as_str), Some("teardown"));
}

#[test]
fn pause_parks_the_loop_until_unpause() {
    let journal = SharedJournal::default();
    let (tx, mut rl, source) = bring_up(&journal, 1);

    source.announce(raw(2));
    assert!(rl.step().unwrap());
    assert_eq!(rl.frames_presented(), 2);

    tx.send(ControlEvent::Pause).unwrap();
    assert!(rl.step().unwrap());
    assert!(rl.state().paused);
    assert_eq!(rl.frames_presented(), 2);

    // Decoder keeps going while we are paused.
    source.announce(raw(3));

    let (done_tx, done_rx) = mpsc::channel();
    thread::scope(|s| {
        let rl = &mut rl;
        s.spawn(move || {
            let more = rl.step().unwrap();
            done_tx.send(more).unwrap();
        });
        assert!(
            done_rx.recv_timeout(Duration::from_millis(100)).is_err(),
            "paused loop should block on the event queue"
        );
        tx.send(ControlEvent::Unpause).unwrap();
        assert!(done_rx.recv_timeout(Duration::from_secs(5)).unwrap());
    });

    assert_eq!(rl.frames_presented(), 3);
    assert_eq!(journal.lock().presented, [id(1), id(2), id(3)]);
}

#[test]
fn sixty_fifth_distinct_buffer_is_fatal() {
    let journal = SharedJournal::default();
    let (_tx, mut rl, source) = bring_up(&journal, 1);

    for n in 2..=64 {
        source.announce(raw(n));
        assert!(rl.step().unwrap());
    }
    assert_eq!(rl.backend().live_imports(), 64);

    source.announce(raw(65));
    let err = rl.step().unwrap_err();
    assert!(matches!(
        err,
        RenderError::Cache(CacheError::Full { capacity: 64 })
    ));
    assert_eq!(journal.lock().presented.len(), 64);
}

#[test]
fn rebinding_drains_the_old_chain_before_the_new_surface() {
    let journal = SharedJournal::default();
    let (tx, mut rl, source) = bring_up_with(&journal, 1, true);
    let stall = rl.backend().stall_handle();

    source.announce(raw(2));
    assert!(rl.step().unwrap());
    assert_eq!(rl.frames_presented(), 2);

    tx.send(ControlEvent::UnbindWindow).unwrap();
    tx.send(ControlEvent::BindWindow(MockWindow::arc(800, 600)))
        .unwrap();
    assert!(rl.step().unwrap());
    assert!(!rl.state().window_bound);
    assert_eq!(rl.frames_presented(), 2);

    stall.store(false, Ordering::SeqCst);
    source.announce(raw(3));
    assert!(rl.step().unwrap());
    assert!(rl.state().window_bound);
    assert_eq!(rl.frames_presented(), 3);

    let journal = journal.lock();
    let at = |entry: &str| {
        journal
            .position(entry)
            .unwrap_or_else(|| panic!("missing `{entry}` in {:?}", journal.log))
    };
    let new_surface = at("create surface 800x600");
    assert!(at("wait frame 0") < at("destroy chain 1"));
    assert!(at("wait frame 1") < at("destroy chain 1"));
    assert!(at(&format!("release {:?}", id(1))) < at("destroy chain 1"));
    assert!(at(&format!("release {:?}", id(2))) < at("destroy chain 1"));
    assert!(at("destroy chain 1") < at("destroy surface 640x480"));
    assert!(at("destroy surface 640x480") < new_surface);
    assert!(new_surface < at("create chain 2"));
}

/// A present reports `status`; the next frame must land on a fresh chain.
fn rebuild_after_present(status: SwapchainStatus) {
    let journal = SharedJournal::default();
    let (_tx, mut rl, source) = bring_up_with(&journal, 1, true);

    rl.backend().script_present_status(status);
    source.announce(raw(2));
    assert!(rl.step().unwrap());
    assert_eq!(journal.lock().count_prefix("create chain"), 1);

    source.announce(raw(3));
    assert!(rl.step().unwrap());
    assert_eq!(rl.frames_presented(), 3);

    let journal = journal.lock();
    let at = |entry: &str| {
        journal
            .position(entry)
            .unwrap_or_else(|| panic!("missing `{entry}` in {:?}", journal.log))
    };
    let destroyed = at("destroy chain 1");
    assert!(at("wait frame 0") < destroyed);
    assert!(at("wait frame 1") < destroyed);
    assert!(at(&format!("release {:?}", id(1))) < destroyed);
    assert!(at(&format!("release {:?}", id(2))) < destroyed);
    assert!(destroyed < at("create chain 2"));
    assert!(at("create chain 2") < at(&format!("pop {:?}", id(3))));
    assert_eq!(journal.count_prefix("create chain"), 2);
    assert_eq!(journal.presented, [id(1), id(2), id(3)]);
}

#[test]
fn stale_present_rebuilds_the_chain() {
    rebuild_after_present(SwapchainStatus::Stale);
}

#[test]
fn suboptimal_present_rebuilds_the_chain() {
    rebuild_after_present(SwapchainStatus::Suboptimal);
}

#[test]
fn stale_acquire_skips_the_frame_and_keeps_the_buffer() {
    let journal = SharedJournal::default();
    let (_tx, mut rl, source) = bring_up(&journal, 1);

    rl.backend().script_stale_acquire();
    source.announce(raw(2));
    assert!(rl.step().unwrap());
    assert_eq!(rl.frames_presented(), 1);
    assert_eq!(journal.lock().count_prefix("pop"), 1);

    assert!(rl.step().unwrap());
    assert_eq!(rl.frames_presented(), 2);

    let journal = journal.lock();
    let at = |entry: &str| journal.position(entry).unwrap();
    assert!(at("acquire stale") < at("destroy chain 1"));
    assert!(at("destroy chain 1") < at("create chain 2"));
    assert!(at("create chain 2") < at(&format!("pop {:?}", id(2))));
    assert_eq!(journal.presented, [id(1), id(2)]);
}

#[test]
fn end_of_stream_stops_without_error() {
    let journal = SharedJournal::default();
    let (_tx, mut rl, source) = bring_up(&journal, 1);

    source.finish();
    assert!(rl.step().unwrap());
    assert!(rl.state().ending);
    assert!(!rl.step().unwrap());
    assert_eq!(rl.frames_presented(), 1);
    drop(rl);
    assert!(!source.is_listening());
}

#[test]
fn reclaim_of_unknown_buffer_is_ignored() {
    let journal = SharedJournal::default();
    let (tx, mut rl, _source) = bring_up(&journal, 1);
    tx.send(ControlEvent::Pause).unwrap();
    tx.send(ControlEvent::BufferReclaimed(id(99))).unwrap();
    assert!(rl.step().is_ok());
    assert!(rl.step().is_ok());
    assert_eq!(journal.lock().count_prefix("evict"), 0);
}

#[test]
fn stop_detaches_from_the_source() {
    let journal = SharedJournal::default();
    let (tx, mut rl, source) = bring_up(&journal, 1);
    assert!(source.is_listening());
    tx.send(ControlEvent::Stop).unwrap();
    rl.run().unwrap();
    assert!(!source.is_listening());
}

fn expect_rejected(events: Vec<ControlEvent>, rejected: &str) {
    let journal = SharedJournal::default();
    let (tx, mut rl) = manual_loop(&journal);
    let steps = events.len();
    for ev in events {
        tx.send(ev).unwrap();
    }
    let mut outcome = Ok(true);
    for _ in 0..steps {
        outcome = rl.step();
        if outcome.is_err() {
            break;
        }
    }
    match outcome {
        Err(RenderError::InvalidTransition { event, .. }) => assert_eq!(event, rejected),
        other => panic!("expected {rejected} to be rejected, got {other:?}"),
    }
}

#[test]
fn precondition_violations_are_fatal() {
    let journal = SharedJournal::default();
    let window = || ControlEvent::BindWindow(MockWindow::arc(1, 1));
    let start = || ControlEvent::Start(MockSource::new(journal.clone()));

    expect_rejected(vec![ControlEvent::Pause], "Pause");
    expect_rejected(vec![ControlEvent::Unpause], "Unpause");
    expect_rejected(vec![ControlEvent::UnbindWindow], "UnbindWindow");
    expect_rejected(vec![window(), window()], "BindWindow");
    expect_rejected(vec![start(), start()], "Start");
}
