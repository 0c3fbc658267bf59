#[cfg(test)]
mod tests {
    use parallel_toolbox::{deadlock, errors::Failure, model::Action, stress::StressTester};
    use parking_lot::Mutex;
    use std::{
        sync::{Arc, Barrier},
        time::{Duration, Instant},
    };

    #[test]
    fn test_opposite_lock_order_is_detected() {
        println!("\n=== TEST: Обнаружение взаимной блокировки ===");
        let a = Arc::new(Mutex::new(()));
        let b = Arc::new(Mutex::new(()));
        let both_hold_one = Arc::new(Barrier::new(2));

        let (a1, b1, barrier1) = (a.clone(), b.clone(), both_hold_one.clone());
        let a_then_b = Action::from_fn("a then b", move || {
            let _a = a1.lock();
            barrier1.wait();
            let _b = b1.lock();
        });
        let (a2, b2, barrier2) = (a, b, both_hold_one);
        let b_then_a = Action::from_fn("b then a", move || {
            let _b = b2.lock();
            barrier2.wait();
            let _a = a2.lock();
        });

        let started = Instant::now();
        let err = StressTester::new()
            .threads(2)
            .rounds_per_thread(1)
            .poll_interval(Duration::from_millis(100))
            .add(a_then_b)
            .add(b_then_a)
            .run()
            .unwrap_err();
        let elapsed = started.elapsed();

        match &err {
            Failure::Deadlock { threads, dump } => {
                assert!(threads.len() >= 2, "в цикле минимум два потока");
                assert!(!dump.is_empty());
            }
            other => panic!("expected deadlock, got {other:?}"),
        }
        assert!(err.to_string().starts_with("detected"));
        assert!(elapsed < Duration::from_secs(10), "took {elapsed:?}");
        assert!(!deadlock::known_deadlocks().is_empty());
        println!("  ✓ обнаружено за {:?}", elapsed);
    }
}
