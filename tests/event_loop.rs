use std::panic::{self, AssertUnwindSafe};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{mpsc, Arc, Mutex};
use std::thread;
use std::time::{Duration, Instant};

use lightvoice::{EventLoop, LoopCell, LoopPool, LoopThread, TimerId};

mod util;

use util::init;

#[test]
fn run_in_loop_from_another_thread() {
    init();
    let mut lt = LoopThread::spawn("cross-thread").unwrap();

    let (tx, rx) = mpsc::channel();
    lt.handle().run_in_loop(move |_lp| {
        tx.send(thread::current().id()).unwrap();
    });

    let loop_thread = rx.recv_timeout(Duration::from_secs(5)).unwrap();
    assert_ne!(loop_thread, thread::current().id());
    lt.stop();
}

#[test]
fn tasks_queued_before_run_execute_on_first_cycle() {
    init();
    let (handle_tx, handle_rx) = mpsc::channel();
    let (go_tx, go_rx) = mpsc::channel::<()>();

    let worker = thread::spawn(move || {
        let lp = EventLoop::new().unwrap();
        handle_tx.send(Arc::clone(lp.handle())).unwrap();
        go_rx.recv().unwrap();
        lp.run();
    });

    let handle = handle_rx.recv().unwrap();
    let (tx, rx) = mpsc::channel();
    // The loop is not running yet, so this must queue, not execute.
    handle.run_in_loop(move |_lp| tx.send(()).unwrap());
    assert!(rx.try_recv().is_err());

    go_tx.send(()).unwrap();
    rx.recv_timeout(Duration::from_secs(5)).unwrap();

    handle.quit();
    worker.join().unwrap();
}

#[test]
fn pending_tasks_run_before_loop_exits() {
    init();
    let lt = LoopThread::spawn("drain-on-quit").unwrap();
    let counter = Arc::new(AtomicUsize::new(0));

    for _ in 0..4 {
        let counter = Arc::clone(&counter);
        lt.handle().run_in_loop(move |_lp| {
            counter.fetch_add(1, Ordering::SeqCst);
        });
    }
    drop(lt); // quit + join

    assert_eq!(counter.load(Ordering::SeqCst), 4);
}

#[test]
fn second_loop_on_same_thread_panics() {
    init();
    let result = thread::spawn(|| {
        let _first = EventLoop::new().unwrap();
        let _second = EventLoop::new();
    })
    .join();
    assert!(result.is_err());
}

#[test]
fn loop_cell_asserts_affinity() {
    init();
    let mut lt = LoopThread::spawn("affinity").unwrap();
    let cell = Arc::new(LoopCell::new(Arc::clone(lt.handle()), 0u32));

    // Touching loop-owned state from this thread must abort.
    let cell2 = Arc::clone(&cell);
    let result = panic::catch_unwind(AssertUnwindSafe(move || {
        let _ = *cell2.borrow();
    }));
    assert!(result.is_err());

    // Posting the mutation to the owning loop succeeds.
    let (tx, rx) = mpsc::channel();
    let cell2 = Arc::clone(&cell);
    lt.handle().run_in_loop(move |_lp| {
        *cell2.borrow_mut() += 1;
        tx.send(*cell2.borrow()).unwrap();
    });
    assert_eq!(rx.recv_timeout(Duration::from_secs(5)).unwrap(), 1);
    lt.stop();
}

#[test]
fn pool_assigns_round_robin() {
    init();
    let base = LoopThread::spawn("pool-base").unwrap();
    let mut pool = LoopPool::start(Arc::clone(base.handle()), 4, "pool-worker").unwrap();
    assert_eq!(pool.worker_count(), 4);

    let first_round: Vec<_> = (0..4).map(|_| pool.next_loop()).collect();
    let second_round: Vec<_> = (0..4).map(|_| pool.next_loop()).collect();

    // All four distinct, and the sequence repeats exactly.
    for i in 0..4 {
        assert!(Arc::ptr_eq(&first_round[i], &second_round[i]));
        for j in (i + 1)..4 {
            assert!(!Arc::ptr_eq(&first_round[i], &first_round[j]));
        }
    }

    pool.stop();
}

#[test]
fn empty_pool_returns_base_loop() {
    init();
    let base = LoopThread::spawn("solo-base").unwrap();
    let pool = LoopPool::start(Arc::clone(base.handle()), 0, "unused").unwrap();
    assert!(Arc::ptr_eq(&pool.next_loop(), base.handle()));
    assert!(Arc::ptr_eq(&pool.next_loop(), base.handle()));
}

#[test]
fn one_shot_timer_fires_after_delay() {
    init();
    let mut lt = LoopThread::spawn("one-shot").unwrap();
    let (tx, rx) = mpsc::channel();

    let started = Instant::now();
    lt.handle().run_in_loop(move |lp| {
        let tx = tx.clone();
        lp.add_timer(Duration::from_millis(50), None, move |_lp| {
            tx.send(Instant::now()).unwrap();
        });
    });

    let fired = rx.recv_timeout(Duration::from_secs(5)).unwrap();
    assert!(fired.duration_since(started) >= Duration::from_millis(45));
    lt.stop();
}

#[test]
fn repeating_timer_fires_until_cancelled() {
    init();
    let mut lt = LoopThread::spawn("repeating").unwrap();
    let count = Arc::new(AtomicUsize::new(0));
    let timer_id: Arc<Mutex<Option<TimerId>>> = Arc::new(Mutex::new(None));

    {
        let count = Arc::clone(&count);
        let timer_id = Arc::clone(&timer_id);
        lt.handle().run_in_loop(move |lp| {
            let count = Arc::clone(&count);
            let id = lp.add_timer(
                Duration::from_millis(20),
                Some(Duration::from_millis(20)),
                move |_lp| {
                    count.fetch_add(1, Ordering::SeqCst);
                },
            );
            *timer_id.lock().unwrap() = Some(id);
        });
    }

    thread::sleep(Duration::from_millis(110));

    // Cancel on the loop and snapshot the count there, so no fire can race
    // the snapshot.
    let (tx, rx) = mpsc::channel();
    {
        let count = Arc::clone(&count);
        let timer_id = Arc::clone(&timer_id);
        lt.handle().run_in_loop(move |lp| {
            let id = timer_id.lock().unwrap().take().unwrap();
            assert!(lp.cancel_timer(id));
            tx.send(count.load(Ordering::SeqCst)).unwrap();
        });
    }
    let at_cancel = rx.recv_timeout(Duration::from_secs(5)).unwrap();
    assert!(at_cancel >= 2, "only {} fires in 110ms", at_cancel);

    thread::sleep(Duration::from_millis(100));
    assert_eq!(count.load(Ordering::SeqCst), at_cancel);
    lt.stop();
}
