#[cfg(test)]
mod tests {
    use parallel_toolbox::{deadlock, model::Action, stress::StressTester};
    use parking_lot::Mutex;
    use std::{
        sync::{
            atomic::{AtomicUsize, Ordering},
            Arc, Barrier,
        },
        thread,
        time::{Duration, Instant},
    };

    /// Два потока, берущие `a` и `b` в разном порядке. Никогда не завершаются.
    fn form_cycle_outside_harness() {
        let a = Arc::new(Mutex::new(()));
        let b = Arc::new(Mutex::new(()));
        let barrier = Arc::new(Barrier::new(2));

        let (a1, b1, barrier1) = (a.clone(), b.clone(), barrier.clone());
        thread::spawn(move || {
            let _a = a1.lock();
            barrier1.wait();
            let _b = b1.lock();
        });
        thread::spawn(move || {
            let _b = b.lock();
            barrier.wait();
            let _a = a.lock();
        });
    }

    #[test]
    fn test_existing_deadlock_is_not_attributed_to_new_run() {
        println!("\n=== TEST: Чужая взаимная блокировка до старта ===");
        form_cycle_outside_harness();

        let started = Instant::now();
        while deadlock::known_deadlocks().is_empty() {
            assert!(started.elapsed() < Duration::from_secs(10), "цикл так и не сформировался");
            thread::sleep(Duration::from_millis(20));
        }
        let before = deadlock::known_deadlocks().len();

        let counter = Arc::new(AtomicUsize::new(0));
        let hits = counter.clone();
        StressTester::new()
            .threads(4)
            .rounds_per_thread(50)
            .poll_interval(Duration::from_millis(20))
            .add(Action::from_fn("increment", move || {
                hits.fetch_add(1, Ordering::SeqCst);
                thread::sleep(Duration::from_millis(1));
            }))
            .run()
            .unwrap();

        assert_eq!(counter.load(Ordering::SeqCst), 200);
        assert_eq!(deadlock::known_deadlocks().len(), before);
        println!("  ✓ прогон чистый, известных циклов: {}", before);
    }
}
