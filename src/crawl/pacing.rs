use std::time::{Duration, Instant};

/// Spaces consecutive requests `required` apart, crediting the time the
/// previous unit of work already took.
#[derive(Debug, Clone)]
pub struct Pacer {
    required: Duration,
    last_work: Option<Duration>,
}

impl Pacer {
    pub fn new(required: Duration) -> Self {
        Self {
            required,
            last_work: None,
        }
    }

    /// Delay to wait before the next request.
    pub fn next_delay(&self) -> Duration {
        match self.last_work {
            Some(work) => adjusted_delay(self.required, work),
            None => self.required,
        }
    }

    pub fn record_work(&mut self, work: Duration) {
        self.last_work = Some(work);
    }

    /// Run one paced step. `step` receives the delay it must sleep before
    /// its request; the time spent beyond that delay counts as work.
    pub async fn run<F, Fut, T>(&mut self, step: F) -> T
    where
        F: FnOnce(Duration) -> Fut,
        Fut: std::future::Future<Output = T>,
    {
        let delay = self.next_delay();
        let started = Instant::now();
        let out = step(delay).await;
        self.record_work(started.elapsed().saturating_sub(delay));
        out
    }
}

pub fn adjusted_delay(required: Duration, last_work: Duration) -> Duration {
    required.saturating_sub(last_work)
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    #[test]
    fn first_request_waits_full_delay() {
        let p = Pacer::new(Duration::from_secs(2));
        assert_eq!(p.next_delay(), Duration::from_secs(2));
    }

    #[test]
    fn work_is_credited() {
        let mut p = Pacer::new(Duration::from_secs(2));
        p.record_work(Duration::from_millis(1500));
        assert_eq!(p.next_delay(), Duration::from_millis(500));
        p.record_work(Duration::from_secs(5));
        assert_eq!(p.next_delay(), Duration::ZERO);
    }

    #[tokio::test]
    async fn run_measures_work_without_delay() {
        let mut p = Pacer::new(Duration::from_millis(200));
        let v = p
            .run(|delay| async move {
                tokio::time::sleep(delay).await;
                7
            })
            .await;
        assert_eq!(v, 7);
        // The step did nothing besides sleeping, so nearly the whole delay is owed again.
        assert!(p.next_delay() > Duration::from_millis(50));
    }

    #[tokio::test]
    async fn storing_inside_the_step_counts_as_work() {
        let mut p = Pacer::new(Duration::from_millis(300));
        p.run(|delay| async move {
            tokio::time::sleep(delay).await;
            // A slow write after the response arrives.
            std::thread::sleep(Duration::from_millis(250));
        })
        .await;
        assert!(p.next_delay() <= Duration::from_millis(50));
    }

    proptest! {
        #[test]
        fn adjusted_delay_bounded(req_ms in 0u64..100_000, work_ms in 0u64..1_000_000) {
            let req = Duration::from_millis(req_ms);
            let d = adjusted_delay(req, Duration::from_millis(work_ms));
            prop_assert!(d <= req);
            if work_ms >= req_ms {
                prop_assert_eq!(d, Duration::ZERO);
            } else {
                prop_assert_eq!(d, Duration::from_millis(req_ms - work_ms));
            }
        }
    }
}
