use core::time::Duration;
use std::time::Instant;

/// Bounded polling policy.
///
/// The deadline is measured with `Instant`, so a coarse or oversleeping
/// `pause` only delays the next probe and never extends the timeout by more
/// than one interval.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub struct Poll {
    /// Time to pause between probes. Zero polls in a tight loop.
    pub interval: Duration,
    /// Give up after this long. `None` polls forever.
    pub timeout: Option<Duration>,
}

/// Result of a completed `Poll::run`.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum Outcome {
    Ready { polls: u32, elapsed: Duration },
    Expired { polls: u32, elapsed: Duration },
}

impl Poll {
    pub fn new(interval: Duration, timeout: Option<Duration>) -> Self {
        Poll { interval, timeout }
    }

    /// Call `probe` until it returns `Ok(true)` or the timeout expires.
    ///
    /// `probe` is always called at least once, even with a zero timeout.
    /// Errors from `probe` are returned immediately.
    pub fn run<C, E, P, F>(&self, ctx: &mut C, mut pause: P, mut probe: F) -> Result<Outcome, E>
    where
        P: FnMut(&mut C, Duration),
        F: FnMut(&mut C) -> Result<bool, E>,
    {
        let start = Instant::now();
        let mut polls = 0;
        loop {
            polls += 1;
            if probe(ctx)? {
                return Ok(Outcome::Ready { polls, elapsed: start.elapsed() });
            }
            let elapsed = start.elapsed();
            let wait = match self.timeout {
                Some(timeout) if elapsed >= timeout => {
                    return Ok(Outcome::Expired { polls, elapsed });
                },
                Some(timeout) => self.interval.min(timeout - elapsed),
                None => self.interval,
            };
            if wait > Duration::from_secs(0) {
                pause(ctx, wait);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct Counter {
        probes: u32,
        pauses: Vec<Duration>,
    }

    fn counter() -> Counter {
        Counter { probes: 0, pauses: Vec::new() }
    }

    #[test]
    fn test_ready_after_several_probes() {
        let mut ctx = counter();
        let poll = Poll::new(Duration::from_micros(10), Some(Duration::from_secs(5)));
        let outcome = poll.run(&mut ctx, |c, d| c.pauses.push(d), |c| -> Result<bool, ()> {
            c.probes += 1;
            Ok(c.probes == 5)
        }).unwrap();
        assert!(matches!(outcome, Outcome::Ready { polls: 5, .. }));
        assert_eq!(ctx.pauses.len(), 4);
        assert!(ctx.pauses.iter().all(|&d| d <= Duration::from_micros(10)));
    }

    #[test]
    fn test_zero_timeout_probes_once() {
        let mut ctx = counter();
        let poll = Poll::new(Duration::from_millis(1), Some(Duration::from_secs(0)));
        let outcome = poll.run(&mut ctx, |c, d| c.pauses.push(d), |c| -> Result<bool, ()> {
            c.probes += 1;
            Ok(false)
        }).unwrap();
        assert!(matches!(outcome, Outcome::Expired { polls: 1, .. }));
        assert!(ctx.pauses.is_empty());
    }

    #[test]
    fn test_expires_with_real_clock() {
        let mut ctx = counter();
        let timeout = Duration::from_millis(20);
        let poll = Poll::new(Duration::from_millis(1), Some(timeout));
        let outcome = poll.run(&mut ctx, |_, d| std::thread::sleep(d), |c| -> Result<bool, ()> {
            c.probes += 1;
            Ok(false)
        }).unwrap();
        match outcome {
            Outcome::Expired { polls, elapsed } => {
                assert!(polls > 1);
                assert!(elapsed >= timeout);
            },
            other => panic!("expected expiry, got {:?}", other),
        }
    }

    #[test]
    fn test_tight_loop_never_pauses() {
        let mut ctx = counter();
        let poll = Poll::new(Duration::from_secs(0), None);
        poll.run(&mut ctx, |c, d| c.pauses.push(d), |c| -> Result<bool, ()> {
            c.probes += 1;
            Ok(c.probes == 100)
        }).unwrap();
        assert_eq!(ctx.probes, 100);
        assert!(ctx.pauses.is_empty());
    }

    #[test]
    fn test_probe_error_is_returned() {
        let mut ctx = counter();
        let poll = Poll::new(Duration::from_secs(0), None);
        let result = poll.run(&mut ctx, |_, _| {}, |c| {
            c.probes += 1;
            if c.probes == 3 { Err("bus fault") } else { Ok(false) }
        });
        assert_eq!(result, Err("bus fault"));
    }
}
