//! Wall-clock triggers on top of tokio timers: daily jobs, one-shot jobs at
//! a local time, and jobs after a delay.

use chrono::{DateTime, Days, FixedOffset, NaiveTime};
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::debug;

use crate::clock::Clock;

/// First moment strictly after `after` whose local time is `at`. Each day is
/// resolved with its own offset.
pub fn next_occurrence(clock: &dyn Clock, after: DateTime<FixedOffset>, at: NaiveTime) -> DateTime<FixedOffset> {
    let on = |date: chrono::NaiveDate| clock.resolve_local(date.and_time(at));
    let today = after.date_naive();
    match on(today) {
        Some(t) if t > after => t,
        _ => today
            .checked_add_days(Days::new(1))
            .and_then(on)
            .unwrap_or(after + chrono::Duration::days(1)),
    }
}

/// Time left until `when`, zero when it already passed.
pub fn until(clock: &dyn Clock, when: DateTime<FixedOffset>) -> Duration {
    (when - clock.now()).to_std().unwrap_or(Duration::ZERO)
}

/// Run `job` every day at local time `at` until `cancel` fires.
pub fn spawn_daily<F, Fut>(clock: Arc<dyn Clock>, at: NaiveTime, cancel: CancellationToken, mut job: F) -> JoinHandle<()>
where
    F: FnMut() -> Fut + Send + 'static,
    Fut: Future<Output = ()> + Send,
{
    tokio::spawn(async move {
        let mut after = clock.now();
        loop {
            let target = next_occurrence(clock.as_ref(), after, at);
            debug!(at = %target, "daily job armed");
            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = tokio::time::sleep(until(clock.as_ref(), target)) => {}
            }
            job().await;
            after = target.max(clock.now());
        }
    })
}

/// Run `job` once at `when` (immediately if it already passed).
pub fn spawn_at<Fut>(clock: Arc<dyn Clock>, when: DateTime<FixedOffset>, job: Fut) -> JoinHandle<()>
where
    Fut: Future<Output = ()> + Send + 'static,
{
    let delay = until(clock.as_ref(), when);
    spawn_after(delay, job)
}

pub fn spawn_after<Fut>(delay: Duration, job: Fut) -> JoinHandle<()>
where
    Fut: Future<Output = ()> + Send + 'static,
{
    tokio::spawn(async move {
        tokio::time::sleep(delay).await;
        job.await;
    })
}

/// Run `job` every `period` until `cancel` fires. The first run happens one
/// period after the call.
pub fn spawn_every<F, Fut>(period: Duration, cancel: CancellationToken, mut job: F) -> JoinHandle<()>
where
    F: FnMut() -> Fut + Send + 'static,
    Fut: Future<Output = ()> + Send,
{
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval_at(tokio::time::Instant::now() + period, period);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = ticker.tick() => job().await,
            }
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::{format_timestamp, ManualClock};
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn hm(h: u32, m: u32) -> NaiveTime {
        NaiveTime::from_hms_opt(h, m, 0).unwrap()
    }

    #[test]
    fn next_occurrence_today_or_tomorrow() {
        let clock = ManualClock::at("2025-06-10 00:00:30");
        let next = next_occurrence(&clock, clock.now(), hm(0, 1));
        assert_eq!(format_timestamp(&next), "2025-06-10 00:01:00");

        let next = next_occurrence(&clock, clock.now(), hm(0, 0));
        assert_eq!(format_timestamp(&next), "2025-06-11 00:00:00");
    }

    #[test]
    fn next_occurrence_is_strictly_after() {
        let clock = ManualClock::at("2025-06-10 06:00:00");
        let next = next_occurrence(&clock, clock.now(), hm(6, 0));
        assert_eq!(format_timestamp(&next), "2025-06-11 06:00:00");
    }

    #[test]
    fn next_occurrence_after_a_clock_change_uses_the_new_offset() {
        let clock = ManualClock::at("2025-03-29 12:00:00");
        let change = chrono::NaiveDate::from_ymd_opt(2025, 3, 30).unwrap().and_time(hm(2, 0));
        clock.change_offset_at(change, FixedOffset::east_opt(3600).unwrap());

        let next = next_occurrence(&clock, clock.now(), hm(6, 0));
        assert_eq!(format_timestamp(&next), "2025-03-30 06:00:00");
        assert_eq!(next - clock.now(), chrono::Duration::hours(17));
    }

    #[test]
    fn until_past_is_zero() {
        let clock = ManualClock::at("2025-06-10 06:00:00");
        let past = clock.now() - chrono::Duration::minutes(1);
        assert_eq!(until(&clock, past), Duration::ZERO);
        let future = clock.now() + chrono::Duration::seconds(90);
        assert_eq!(until(&clock, future), Duration::from_secs(90));
    }

    #[tokio::test(start_paused = true)]
    async fn daily_job_fires_once_per_day() {
        let clock: Arc<dyn Clock> = Arc::new(ManualClock::at("2025-06-10 23:59:00"));
        let runs = Arc::new(AtomicUsize::new(0));
        let cancel = CancellationToken::new();

        let counter = runs.clone();
        let handle = spawn_daily(clock, hm(0, 0), cancel.clone(), move || {
            let counter = counter.clone();
            async move {
                counter.fetch_add(1, Ordering::SeqCst);
            }
        });

        tokio::time::sleep(Duration::from_secs(61)).await;
        assert_eq!(runs.load(Ordering::SeqCst), 1);

        // The manual clock did not move, so the next run is a full day out.
        tokio::time::sleep(Duration::from_secs(3600)).await;
        assert_eq!(runs.load(Ordering::SeqCst), 1);

        cancel.cancel();
        handle.await.unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn every_runs_on_period() {
        let runs = Arc::new(AtomicUsize::new(0));
        let cancel = CancellationToken::new();
        let counter = runs.clone();
        let handle = spawn_every(Duration::from_secs(60), cancel.clone(), move || {
            let counter = counter.clone();
            async move {
                counter.fetch_add(1, Ordering::SeqCst);
            }
        });

        tokio::time::sleep(Duration::from_secs(181)).await;
        assert_eq!(runs.load(Ordering::SeqCst), 3);
        cancel.cancel();
        handle.await.unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn spawn_at_waits_for_wall_time() {
        let clock: Arc<dyn Clock> = Arc::new(ManualClock::at("2025-06-10 05:59:00"));
        let runs = Arc::new(AtomicUsize::new(0));
        let counter = runs.clone();
        let when = clock.now() + chrono::Duration::minutes(1);
        spawn_at(clock, when, async move {
            counter.fetch_add(1, Ordering::SeqCst);
        });

        tokio::time::sleep(Duration::from_secs(59)).await;
        assert_eq!(runs.load(Ordering::SeqCst), 0);
        tokio::time::sleep(Duration::from_secs(2)).await;
        assert_eq!(runs.load(Ordering::SeqCst), 1);
    }
}
