//! Timer registry with one handle per timer role.
//!
//! Each armed timer is a spawned tokio task that sends a [`TimerFired`]
//! message to the owner's event channel. The owner hands the message back to
//! [`TimerRegistry::fire`], which rejects firings from cancelled or replaced
//! handles by comparing generations. A firing already queued when its timer
//! is cancelled is therefore never delivered.

use std::collections::HashMap;
use std::fmt;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::{Duration, Instant, MissedTickBehavior};
use tracing::{debug, warn};

/// Logical timer roles owned by the controller
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum TimerRole {
    /// Recurring poll of collection lock state
    PeriodicCheck,
    /// One-shot lock after the grace period
    DelayedLock,
    /// One-shot "check soon" request, deduplicated
    DeferredRecheck,
}

/// What `schedule` does when the role is already armed
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RearmPolicy {
    /// Keep the armed timer; the new request is a no-op
    Coalesce,
    /// Cancel the armed timer and arm a new one
    Replace,
}

impl TimerRole {
    pub const ALL: [TimerRole; 3] = [
        TimerRole::PeriodicCheck,
        TimerRole::DelayedLock,
        TimerRole::DeferredRecheck,
    ];

    pub fn policy(self) -> RearmPolicy {
        match self {
            TimerRole::PeriodicCheck | TimerRole::DeferredRecheck => RearmPolicy::Coalesce,
            TimerRole::DelayedLock => RearmPolicy::Replace,
        }
    }

    /// Periodic roles keep their handle across firings
    pub fn is_periodic(self) -> bool {
        matches!(self, TimerRole::PeriodicCheck)
    }
}

impl fmt::Display for TimerRole {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TimerRole::PeriodicCheck => write!(f, "periodic-check"),
            TimerRole::DelayedLock => write!(f, "delayed-lock"),
            TimerRole::DeferredRecheck => write!(f, "deferred-recheck"),
        }
    }
}

/// Message sent by a timer task when it fires
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TimerFired {
    pub role: TimerRole,
    pub generation: u64,
}

struct TimerHandle {
    generation: u64,
    fire_at: Instant,
    period: Option<Duration>,
    task: JoinHandle<()>,
}

/// Registry holding at most one live timer per role
pub struct TimerRegistry<E> {
    handles: HashMap<TimerRole, TimerHandle>,
    next_generation: u64,
    events: mpsc::UnboundedSender<E>,
}

impl<E> TimerRegistry<E>
where
    E: From<TimerFired> + Send + 'static,
{
    /// Create a registry delivering firings to `events`
    pub fn new(events: mpsc::UnboundedSender<E>) -> Self {
        Self {
            handles: HashMap::new(),
            next_generation: 1,
            events,
        }
    }

    /// Arm `role` to fire after `delay` (and every `delay` after that for
    /// periodic roles). Returns `false` when a coalescing role was already
    /// armed and nothing changed, or when a periodic role is given a zero
    /// period.
    pub fn schedule(&mut self, role: TimerRole, delay: Duration) -> bool {
        if role.is_periodic() && delay.is_zero() {
            warn!(timer = %role, "Refusing to arm periodic timer with a zero period");
            return false;
        }

        if self.is_armed(role) {
            match role.policy() {
                RearmPolicy::Coalesce => {
                    debug!(timer = %role, "Timer already armed, coalescing");
                    return false;
                }
                RearmPolicy::Replace => {
                    self.cancel(role);
                }
            }
        }

        let generation = self.next_generation;
        self.next_generation += 1;

        let fire_at = Instant::now() + delay;
        let period = role.is_periodic().then_some(delay);
        let fired = TimerFired { role, generation };
        let events = self.events.clone();

        let task = tokio::spawn(async move {
            match period {
                Some(period) => {
                    let mut ticker = tokio::time::interval_at(fire_at, period);
                    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
                    loop {
                        ticker.tick().await;
                        if events.send(E::from(fired)).is_err() {
                            break;
                        }
                    }
                }
                None => {
                    tokio::time::sleep_until(fire_at).await;
                    let _ = events.send(E::from(fired));
                }
            }
        });

        debug!(timer = %role, generation, delay_ms = delay.as_millis() as u64, "Timer armed");
        self.handles.insert(
            role,
            TimerHandle {
                generation,
                fire_at,
                period,
                task,
            },
        );
        true
    }

    /// Cancel `role` and arm it again with `delay`
    pub fn reschedule(&mut self, role: TimerRole, delay: Duration) -> bool {
        self.cancel(role);
        self.schedule(role, delay)
    }

    /// Cancel `role` if armed. Returns whether a timer was cancelled.
    pub fn cancel(&mut self, role: TimerRole) -> bool {
        match self.handles.remove(&role) {
            Some(handle) => {
                handle.task.abort();
                debug!(timer = %role, generation = handle.generation, "Timer cancelled");
                true
            }
            None => false,
        }
    }

    /// Cancel every armed timer
    pub fn cancel_all(&mut self) {
        for role in TimerRole::ALL {
            self.cancel(role);
        }
    }

    pub fn is_armed(&self, role: TimerRole) -> bool {
        self.handles.contains_key(&role)
    }

    /// When `role` fires next, if armed
    pub fn deadline(&self, role: TimerRole) -> Option<Instant> {
        self.handles.get(&role).map(|h| h.fire_at)
    }

    /// Number of armed timers
    pub fn armed_count(&self) -> usize {
        self.handles.len()
    }

    /// Accept a firing message. Returns `false` for firings of cancelled or
    /// replaced timers, which the caller must ignore. One-shot roles are
    /// disarmed before returning, so the caller may re-arm the same role.
    pub fn fire(&mut self, fired: TimerFired) -> bool {
        let current = match self.handles.get_mut(&fired.role) {
            Some(handle) if handle.generation == fired.generation => handle,
            _ => {
                debug!(timer = %fired.role, generation = fired.generation, "Ignoring stale timer firing");
                return false;
            }
        };

        let period = current.period;
        match period {
            Some(period) => {
                current.fire_at = Instant::now() + period;
            }
            None => {
                self.handles.remove(&fired.role);
            }
        }
        true
    }
}

impl<E> Drop for TimerRegistry<E> {
    fn drop(&mut self) {
        for (_, handle) in self.handles.drain() {
            handle.task.abort();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    async fn settle(duration: Duration) {
        tokio::time::sleep(duration).await;
        for _ in 0..5 {
            tokio::task::yield_now().await;
        }
    }

    fn drain(rx: &mut mpsc::UnboundedReceiver<TimerFired>) -> Vec<TimerFired> {
        let mut fired = Vec::new();
        while let Ok(f) = rx.try_recv() {
            fired.push(f);
        }
        fired
    }

    fn registry() -> (TimerRegistry<TimerFired>, mpsc::UnboundedReceiver<TimerFired>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (TimerRegistry::new(tx), rx)
    }

    #[test]
    fn test_role_policies() {
        assert_eq!(TimerRole::PeriodicCheck.policy(), RearmPolicy::Coalesce);
        assert_eq!(TimerRole::DeferredRecheck.policy(), RearmPolicy::Coalesce);
        assert_eq!(TimerRole::DelayedLock.policy(), RearmPolicy::Replace);
        assert!(TimerRole::PeriodicCheck.is_periodic());
        assert!(!TimerRole::DelayedLock.is_periodic());
    }

    #[tokio::test]
    async fn test_coalescing_schedule_arms_once() {
        tokio::time::pause();
        let (mut timers, mut rx) = registry();

        assert!(timers.schedule(TimerRole::PeriodicCheck, Duration::from_secs(10)));
        assert!(!timers.schedule(TimerRole::PeriodicCheck, Duration::from_secs(10)));
        assert_eq!(timers.armed_count(), 1);

        settle(Duration::from_secs(11)).await;
        let fired = drain(&mut rx);
        assert_eq!(fired.len(), 1);
        assert!(timers.fire(fired[0]));
        assert!(timers.is_armed(TimerRole::PeriodicCheck));
    }

    #[tokio::test]
    async fn test_periodic_fires_repeatedly() {
        tokio::time::pause();
        let (mut timers, mut rx) = registry();

        timers.schedule(TimerRole::PeriodicCheck, Duration::from_secs(5));
        settle(Duration::from_secs(16)).await;

        let fired = drain(&mut rx);
        assert_eq!(fired.len(), 3);
        for f in fired {
            assert!(timers.fire(f));
        }
        assert!(timers.is_armed(TimerRole::PeriodicCheck));
    }

    #[tokio::test]
    async fn test_periodic_rejects_zero_period() {
        tokio::time::pause();
        let (mut timers, mut rx) = registry();

        assert!(!timers.schedule(TimerRole::PeriodicCheck, Duration::ZERO));
        assert!(!timers.is_armed(TimerRole::PeriodicCheck));

        // Zero delay is fine for one-shot roles
        assert!(timers.schedule(TimerRole::DeferredRecheck, Duration::ZERO));
        settle(Duration::from_millis(1)).await;
        assert_eq!(drain(&mut rx).len(), 1);
    }

    #[tokio::test]
    async fn test_one_shot_clears_handle_on_fire() {
        tokio::time::pause();
        let (mut timers, mut rx) = registry();

        timers.schedule(TimerRole::DelayedLock, Duration::from_secs(3));
        settle(Duration::from_secs(4)).await;

        let fired = drain(&mut rx);
        assert_eq!(fired.len(), 1);
        assert!(timers.fire(fired[0]));
        assert!(!timers.is_armed(TimerRole::DelayedLock));

        // The callback may re-arm the same role
        assert!(timers.schedule(TimerRole::DelayedLock, Duration::from_secs(3)));
    }

    #[tokio::test]
    async fn test_replace_policy_moves_deadline() {
        tokio::time::pause();
        let (mut timers, mut rx) = registry();

        let start = Instant::now();
        timers.schedule(TimerRole::DelayedLock, Duration::from_secs(60));
        assert_eq!(timers.deadline(TimerRole::DelayedLock), Some(start + Duration::from_secs(60)));

        assert!(timers.schedule(TimerRole::DelayedLock, Duration::from_secs(5)));
        assert_eq!(timers.armed_count(), 1);
        assert_eq!(timers.deadline(TimerRole::DelayedLock), Some(start + Duration::from_secs(5)));

        settle(Duration::from_secs(61)).await;
        let fired = drain(&mut rx);
        assert_eq!(fired.len(), 1);
        assert!(timers.fire(fired[0]));
    }

    #[tokio::test]
    async fn test_cancel_is_idempotent() {
        tokio::time::pause();
        let (mut timers, mut rx) = registry();

        assert!(!timers.cancel(TimerRole::DelayedLock));
        timers.schedule(TimerRole::DelayedLock, Duration::from_secs(1));
        assert!(timers.cancel(TimerRole::DelayedLock));
        assert!(!timers.cancel(TimerRole::DelayedLock));

        settle(Duration::from_secs(2)).await;
        assert!(drain(&mut rx).is_empty());
    }

    #[tokio::test]
    async fn test_queued_firing_rejected_after_cancel() {
        tokio::time::pause();
        let (mut timers, mut rx) = registry();

        timers.schedule(TimerRole::DeferredRecheck, Duration::ZERO);
        settle(Duration::from_millis(1)).await;

        // The firing is already queued when the timer is cancelled
        timers.cancel(TimerRole::DeferredRecheck);
        let fired = drain(&mut rx);
        assert_eq!(fired.len(), 1);
        assert!(!timers.fire(fired[0]));
    }

    #[tokio::test]
    async fn test_reschedule_rejects_old_generation() {
        tokio::time::pause();
        let (mut timers, mut rx) = registry();

        timers.schedule(TimerRole::PeriodicCheck, Duration::from_secs(1));
        settle(Duration::from_millis(1500)).await;
        let old = drain(&mut rx);
        assert_eq!(old.len(), 1);

        timers.reschedule(TimerRole::PeriodicCheck, Duration::from_secs(30));
        assert!(!timers.fire(old[0]));
        assert!(timers.is_armed(TimerRole::PeriodicCheck));
    }

    #[tokio::test]
    async fn test_cancel_all() {
        tokio::time::pause();
        let (mut timers, mut rx) = registry();

        for role in TimerRole::ALL {
            timers.schedule(role, Duration::from_secs(1));
        }
        assert_eq!(timers.armed_count(), 3);

        timers.cancel_all();
        assert_eq!(timers.armed_count(), 0);

        settle(Duration::from_secs(5)).await;
        assert!(drain(&mut rx).is_empty());
    }
}
