use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Barrier};
use std::thread;
use std::time::{Duration, Instant};

use spark_ratelimit::{Cancellation, Limiter};

use super::mock_limiter;

/// 无时间推进时，M 个并发调用方恰好取得 min(M, N) 个令牌。
#[test]
fn concurrent_immediate_grants_never_exceed_capacity() {
    for (callers, capacity) in [(8usize, 3u32), (4, 4), (3, 10), (16, 1)] {
        let (limiter, _clock) = mock_limiter(capacity, Duration::from_secs(60));
        let barrier = Arc::new(Barrier::new(callers));
        let granted = Arc::new(AtomicUsize::new(0));

        let handles: Vec<_> = (0..callers)
            .map(|_| {
                let limiter = Arc::clone(&limiter);
                let barrier = Arc::clone(&barrier);
                let granted = Arc::clone(&granted);
                thread::spawn(move || {
                    barrier.wait();
                    if limiter.try_acquire() {
                        granted.fetch_add(1, Ordering::SeqCst);
                    }
                })
            })
            .collect();
        for handle in handles {
            handle.join().expect("工作线程不应 panic");
        }

        assert_eq!(
            granted.load(Ordering::SeqCst),
            callers.min(capacity as usize),
            "callers={callers}, capacity={capacity}"
        );
        assert_eq!(limiter.available(), capacity.saturating_sub(callers as u32));
    }
}

/// 真实时钟下的多调用方阻塞获取：全部最终成功，且总耗时不短于补出额外令牌所需的时长。
#[test]
fn blocked_callers_all_eventually_pass_at_configured_rate() {
    let started = Instant::now();
    let limiter = Arc::new(Limiter::new(2, Duration::from_millis(100)).expect("参数合法"));
    let token = Cancellation::new();

    let handles: Vec<_> = (0..6)
        .map(|_| {
            let limiter = Arc::clone(&limiter);
            let token = token.child();
            thread::spawn(move || limiter.acquire_blocking(&token))
        })
        .collect();
    for handle in handles {
        handle
            .join()
            .expect("工作线程不应 panic")
            .expect("未取消时最终必然取得令牌");
    }

    // 初始 2 个令牌之外还需补出 4 个，速率为每 50ms 一个。
    assert!(started.elapsed() >= Duration::from_millis(200));
}
