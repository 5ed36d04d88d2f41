//! 时钟相关集成测试：虚拟时钟的确定性唤醒序列，以及 Tokio 时钟与限流器的协作。
//!
//! # 结构概览（What）
//! - [`deterministic_wake_order`]：多个睡眠 Future 按登记顺序、且仅在跨过截止点时被唤醒；
//! - [`tokio_clock`]：启用 `runtime-tokio` 时，限流器在 Tokio 运行时内完成一次真实等待。

mod deterministic_wake_order {
    use std::future::Future;
    use std::sync::{Arc, Mutex};
    use std::task::Context;
    use std::time::Duration;

    use futures::task::{ArcWake, waker};
    use spark_ratelimit::{Clock, MockClock};

    struct Recorder {
        label: &'static str,
        events: Arc<Mutex<Vec<&'static str>>>,
    }

    impl ArcWake for Recorder {
        fn wake_by_ref(arc_self: &Arc<Self>) {
            arc_self
                .events
                .lock()
                .expect("recorder lock")
                .push(arc_self.label);
        }
    }

    #[test]
    fn sleepers_wake_in_registration_order_once_due() {
        let clock = MockClock::new();
        let events = Arc::new(Mutex::new(Vec::new()));

        let mut short = clock.sleep(Duration::from_secs(1));
        let mut long = clock.sleep(Duration::from_secs(3));
        let mut also_short = clock.sleep(Duration::from_secs(1));

        for (label, sleep) in [
            ("short", &mut short),
            ("long", &mut long),
            ("also_short", &mut also_short),
        ] {
            let waker = waker(Arc::new(Recorder {
                label,
                events: Arc::clone(&events),
            }));
            let mut cx = Context::from_waker(&waker);
            assert!(sleep.as_mut().poll(&mut cx).is_pending());
        }

        clock.advance(Duration::from_millis(999));
        assert!(events.lock().expect("recorder lock").is_empty());

        clock.advance(Duration::from_millis(1));
        assert_eq!(
            *events.lock().expect("recorder lock"),
            vec!["short", "also_short"]
        );

        clock.advance(Duration::from_secs(2));
        assert_eq!(
            *events.lock().expect("recorder lock"),
            vec!["short", "also_short", "long"]
        );
        assert_eq!(clock.pending_sleepers(), 0);
    }
}

#[cfg(feature = "runtime-tokio")]
mod tokio_clock {
    use std::sync::Arc;
    use std::time::{Duration, Instant};

    use spark_ratelimit::time::TokioClock;
    use spark_ratelimit::{Cancellation, Limiter};

    #[tokio::test]
    async fn limiter_waits_on_tokio_timer() {
        let limiter = Limiter::with_clock(1, Duration::from_millis(20), Arc::new(TokioClock))
            .expect("参数合法");
        let token = Cancellation::new();

        let started = Instant::now();
        limiter.acquire(&token).await.expect("首个令牌立即可用");
        limiter.acquire(&token).await.expect("一个窗口后补出令牌");
        assert!(started.elapsed() >= Duration::from_millis(20));
    }
}
