use std::future::Future;
use std::sync::Arc;
use std::task::{Context, Poll};
use std::thread;
use std::time::{Duration, Instant};

use futures::task::noop_waker_ref;
use spark_ratelimit::{CancelReason, Cancellation, Limiter, LimiterError};

use super::mock_limiter;

#[test]
fn pre_cancelled_signal_still_gets_available_token_then_fails_promptly() {
    let limiter = Limiter::new(1, Duration::from_secs(15)).expect("参数合法");
    let token = Cancellation::new();
    token.cancel();

    let started = Instant::now();
    assert_eq!(limiter.acquire_blocking(&token), Ok(()), "可用令牌优先于取消");
    assert_eq!(
        limiter.acquire_blocking(&token),
        Err(LimiterError::Cancelled {
            reason: CancelReason::Cancelled
        })
    );
    assert!(started.elapsed() < Duration::from_secs(1), "已取消时必须立即返回");
}

#[test]
fn cancel_during_wait_returns_error_without_granting() {
    let (limiter, clock) = mock_limiter(1, Duration::from_secs(60));
    let token = Cancellation::new();
    assert!(limiter.try_acquire());

    let mut cx = Context::from_waker(noop_waker_ref());
    let mut waiter = Box::pin(limiter.acquire(&token));
    assert!(waiter.as_mut().poll(&mut cx).is_pending());

    token.cancel();
    let outcome = waiter.as_mut().poll(&mut cx);
    assert!(matches!(
        outcome,
        Poll::Ready(Err(LimiterError::Cancelled {
            reason: CancelReason::Cancelled
        }))
    ));
    drop(waiter);
    assert_eq!(clock.pending_sleepers(), 0, "落败的等待应被注销");

    clock.advance(Duration::from_secs(60));
    assert_eq!(limiter.available(), 1, "取消不应消耗或泄漏令牌");
}

#[test]
fn deadline_cuts_the_wait_short() {
    let (limiter, clock) = mock_limiter(1, Duration::from_secs(60));
    let token = Cancellation::with_timeout(&clock, Duration::from_secs(5));
    assert!(limiter.try_acquire());

    let mut cx = Context::from_waker(noop_waker_ref());
    let mut waiter = Box::pin(limiter.acquire(&token));
    assert!(waiter.as_mut().poll(&mut cx).is_pending());

    clock.advance(Duration::from_secs(5));
    let outcome = waiter.as_mut().poll(&mut cx);
    assert_eq!(
        outcome,
        Poll::Ready(Err(LimiterError::Cancelled {
            reason: CancelReason::DeadlineExceeded
        }))
    );
    assert_eq!(token.reason(), Some(CancelReason::DeadlineExceeded));
}

/// 截止时间早于轮询间隔时，单次等待被截短到截止时刻，而不是等满整个间隔。
#[test]
fn wait_is_shortened_to_remaining_deadline() {
    // 容量 5、窗口 60s：轮询间隔 12s，截止时间 5s。
    let (limiter, clock) = mock_limiter(5, Duration::from_secs(60));
    let token = Cancellation::with_timeout(&clock, Duration::from_secs(5));
    for _ in 0..5 {
        assert!(limiter.try_acquire());
    }

    let mut cx = Context::from_waker(noop_waker_ref());
    let mut waiter = Box::pin(limiter.acquire(&token));
    assert!(waiter.as_mut().poll(&mut cx).is_pending());
    assert_eq!(clock.pending_sleepers(), 1);

    clock.advance(Duration::from_secs(4));
    assert!(waiter.as_mut().poll(&mut cx).is_pending(), "截止时间之前仍应等待");
    assert_eq!(clock.pending_sleepers(), 1, "等待期间只应有一个睡眠");

    clock.advance(Duration::from_secs(1));
    assert_eq!(clock.pending_sleepers(), 0, "睡眠应恰好在截止时刻到期");
    assert_eq!(
        waiter.as_mut().poll(&mut cx),
        Poll::Ready(Err(LimiterError::Cancelled {
            reason: CancelReason::DeadlineExceeded
        }))
    );
    assert_eq!(clock.sleep_calls(), 1, "截短后的单次等待即触及截止时间");
}

#[test]
fn cancel_from_another_thread_unblocks_waiter() {
    let limiter = Arc::new(Limiter::new(1, Duration::from_secs(3600)).expect("参数合法"));
    let token = Cancellation::new();
    assert!(limiter.try_acquire());

    let canceller = {
        let token = token.child();
        thread::spawn(move || {
            thread::sleep(Duration::from_millis(20));
            token.cancel();
        })
    };

    let started = Instant::now();
    let err = limiter
        .acquire_blocking(&token)
        .expect_err("令牌耗尽且被取消时应返回错误");
    canceller.join().expect("取消线程不应 panic");

    assert_eq!(err.reason(), CancelReason::Cancelled);
    assert_eq!(err.to_string(), "acquire cancelled: operation cancelled");
    assert!(started.elapsed() < Duration::from_secs(60));
}
