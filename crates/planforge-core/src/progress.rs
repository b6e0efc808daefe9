//! Cooperative progress simulation for the single opaque generator call.
//!
//! The generator reports nothing while it runs, yet it dominates total wall
//! time. The simulator interpolates a percentage between two bounds over an
//! estimated duration and invokes a callback on a fixed tick, so the stream
//! keeps moving. It is a scoped resource: `stop` is idempotent and the
//! returned handle also cancels on drop, so no exit path of the generator
//! call can leak a ticker.

use std::time::Duration;

use tokio_util::sync::CancellationToken;

/// Handle to a running simulator task.
///
/// Dropping the handle cancels the ticker.
pub struct ProgressSimulator {
    cancel: CancellationToken,
}

impl ProgressSimulator {
    /// Spawn a ticker that calls `on_tick` every `tick_interval` with a
    /// percentage interpolated from `start_percent` toward (but never
    /// reaching) `end_percent` over `estimated_duration`.
    pub fn start<F>(
        start_percent: u8,
        end_percent: u8,
        estimated_duration: Duration,
        tick_interval: Duration,
        on_tick: F,
    ) -> Self
    where
        F: Fn(u8) + Send + Sync + 'static,
    {
        let cancel = CancellationToken::new();
        let token = cancel.clone();

        tokio::spawn(async move {
            let started = tokio::time::Instant::now();
            let mut interval = tokio::time::interval(tick_interval);
            // The first tick of a tokio interval fires immediately; the
            // caller already emitted `start_percent`, so skip it.
            interval.tick().await;

            loop {
                tokio::select! {
                    _ = token.cancelled() => break,
                    _ = interval.tick() => {
                        let elapsed = started.elapsed();
                        let percent = interpolate(
                            start_percent,
                            end_percent,
                            elapsed,
                            estimated_duration,
                        );
                        on_tick(percent);
                    }
                }
            }
        });

        Self { cancel }
    }

    /// Stop the ticker. Idempotent; called in every exit path of the
    /// generator call (success, failure, timeout).
    pub fn stop(&self) {
        self.cancel.cancel();
    }
}

impl Drop for ProgressSimulator {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}

/// Linear interpolation capped one point short of `end`, so the simulated
/// value approaches the upper bound without ever claiming it.
fn interpolate(start: u8, end: u8, elapsed: Duration, estimated: Duration) -> u8 {
    if end <= start {
        return start;
    }
    let ceiling = end - 1;
    let span = (ceiling - start) as f64;
    let fraction = if estimated.is_zero() {
        1.0
    } else {
        (elapsed.as_secs_f64() / estimated.as_secs_f64()).min(1.0)
    };
    start + (span * fraction).round() as u8
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use std::sync::Arc;
    use std::sync::Mutex;

    use super::*;

    #[test]
    fn interpolate_spans_the_range() {
        let est = Duration::from_secs(100);
        assert_eq!(interpolate(45, 75, Duration::ZERO, est), 45);
        assert_eq!(interpolate(45, 75, Duration::from_secs(50), est), 60);
        // Saturates one point short of the end bound.
        assert_eq!(interpolate(45, 75, Duration::from_secs(100), est), 74);
        assert_eq!(interpolate(45, 75, Duration::from_secs(10_000), est), 74);
    }

    #[test]
    fn interpolate_degenerate_bounds() {
        assert_eq!(interpolate(50, 50, Duration::from_secs(5), Duration::from_secs(1)), 50);
        assert_eq!(interpolate(60, 40, Duration::from_secs(5), Duration::from_secs(1)), 60);
    }

    #[tokio::test(start_paused = true)]
    async fn ticks_are_monotone_and_below_end() {
        let ticks: Arc<Mutex<Vec<u8>>> = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&ticks);

        let sim = ProgressSimulator::start(
            45,
            75,
            Duration::from_secs(120),
            Duration::from_secs(2),
            move |p| sink.lock().unwrap().push(p),
        );

        tokio::time::sleep(Duration::from_secs(240)).await;
        sim.stop();
        // Let the ticker observe cancellation.
        tokio::time::sleep(Duration::from_millis(10)).await;

        let ticks = ticks.lock().unwrap();
        assert!(!ticks.is_empty(), "simulator should have ticked");
        let mut last = 0u8;
        for &p in ticks.iter() {
            assert!(p >= last, "tick regressed: {p} < {last}");
            assert!(p < 75, "tick reached the end bound: {p}");
            last = p;
        }
        assert_eq!(last, 74, "interpolation should saturate just below end");
    }

    #[tokio::test(start_paused = true)]
    async fn stop_is_idempotent_and_halts_ticks() {
        let ticks: Arc<Mutex<Vec<u8>>> = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&ticks);

        let sim = ProgressSimulator::start(
            0,
            100,
            Duration::from_secs(60),
            Duration::from_secs(2),
            move |p| sink.lock().unwrap().push(p),
        );

        tokio::time::sleep(Duration::from_secs(10)).await;
        sim.stop();
        sim.stop();
        tokio::time::sleep(Duration::from_millis(10)).await;

        let count = ticks.lock().unwrap().len();
        tokio::time::sleep(Duration::from_secs(60)).await;
        assert_eq!(
            ticks.lock().unwrap().len(),
            count,
            "no ticks may arrive after stop"
        );
    }

    #[tokio::test(start_paused = true)]
    async fn dropping_the_handle_cancels_the_ticker() {
        let ticks: Arc<Mutex<Vec<u8>>> = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&ticks);

        let sim = ProgressSimulator::start(
            0,
            100,
            Duration::from_secs(60),
            Duration::from_secs(2),
            move |p| sink.lock().unwrap().push(p),
        );

        tokio::time::sleep(Duration::from_secs(6)).await;
        drop(sim);
        tokio::time::sleep(Duration::from_millis(10)).await;

        let count = ticks.lock().unwrap().len();
        tokio::time::sleep(Duration::from_secs(60)).await;
        assert_eq!(ticks.lock().unwrap().len(), count);
    }
}
