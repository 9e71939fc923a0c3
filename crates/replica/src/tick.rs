use std::time::Duration;

/// Fixed-cadence accumulator that decides when a role produces updates.
///
/// Reception never waits on it. While frozen it neither accumulates nor
/// ticks; resuming starts a fresh interval.
#[derive(Debug, Clone)]
pub struct TickScheduler {
    tick_rate: u32,
    dt: f32,
    accumulator: f32,
    tick: u64,
    frozen: bool,
    broadcast_due: bool,
}

impl TickScheduler {
    pub fn new(tick_rate: u32) -> Self {
        let tick_rate = tick_rate.max(1);
        Self {
            tick_rate,
            dt: 1.0 / tick_rate as f32,
            accumulator: 0.0,
            tick: 0,
            frozen: false,
            broadcast_due: false,
        }
    }

    pub fn tick_rate(&self) -> u32 {
        self.tick_rate
    }

    pub fn interval(&self) -> Duration {
        Duration::from_secs_f32(self.dt)
    }

    /// Feeds frame time in. Returns the number of ticks that elapsed.
    pub fn advance(&mut self, delta: Duration) -> u32 {
        self.broadcast_due = false;
        if self.frozen {
            return 0;
        }

        self.accumulator += delta.as_secs_f32().min(0.25);
        let mut ticks = 0;
        while self.accumulator >= self.dt {
            self.accumulator -= self.dt;
            self.tick += 1;
            ticks += 1;
        }
        self.broadcast_due = ticks > 0;
        ticks
    }

    /// Whether the last [`TickScheduler::advance`] crossed a tick boundary.
    pub fn should_broadcast(&self) -> bool {
        self.broadcast_due
    }

    pub fn freeze(&mut self) {
        if !self.frozen {
            log::debug!("tick scheduler frozen at tick {}", self.tick);
        }
        self.frozen = true;
        self.broadcast_due = false;
    }

    pub fn resume(&mut self) {
        if self.frozen {
            log::debug!("tick scheduler resumed at tick {}", self.tick);
        }
        self.frozen = false;
        self.accumulator = 0.0;
    }

    pub fn is_frozen(&self) -> bool {
        self.frozen
    }

    pub fn tick(&self) -> u64 {
        self.tick
    }

    pub fn alpha(&self) -> f32 {
        self.accumulator / self.dt
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn accumulates_whole_ticks() {
        let mut scheduler = TickScheduler::new(60);

        assert_eq!(scheduler.advance(Duration::from_millis(35)), 2);
        assert!(scheduler.should_broadcast());
        assert_eq!(scheduler.tick(), 2);

        assert_eq!(scheduler.advance(Duration::from_millis(1)), 0);
        assert!(!scheduler.should_broadcast());
    }

    #[test]
    fn long_frames_are_clamped() {
        let mut scheduler = TickScheduler::new(10);
        assert_eq!(scheduler.advance(Duration::from_secs(5)), 2);
    }

    #[test]
    fn frozen_scheduler_never_ticks() {
        let mut scheduler = TickScheduler::new(30);
        scheduler.advance(Duration::from_millis(20));
        scheduler.freeze();

        assert_eq!(scheduler.advance(Duration::from_millis(100)), 0);
        assert!(!scheduler.should_broadcast());
        assert!(scheduler.is_frozen());

        scheduler.resume();
        assert_eq!(scheduler.alpha(), 0.0);
        assert_eq!(scheduler.advance(Duration::from_millis(40)), 1);
    }

    #[test]
    fn zero_rate_is_clamped() {
        let scheduler = TickScheduler::new(0);
        assert_eq!(scheduler.tick_rate(), 1);
    }
}
