use std::{
    collections::HashMap,
    time::{Duration, Instant},
};

/// How many records of one class may be emitted per period.
#[derive(Debug, Copy, Clone)]
pub struct Rate {
    num: u16,
    period: Duration,
}

impl Rate {
    pub fn new(num: u16, period: Duration) -> Self {
        Self { num, period }
    }
}

#[derive(Debug, Copy, Clone)]
enum State {
    Deny { until: Instant, suppressed: u64 },
    Allow { until: Instant, rem: u16 },
}

/// Throttles repetitive log records, so an outage of a chain endpoint or of the key custody layer
/// does not flood the logs with one record per head.
///
/// Records are grouped by a static class name. Within each period the first `num` records of a
/// class are admitted and the rest are counted. The count is handed back with the next admitted
/// record of that class, so it can be reported alongside it.
#[derive(Debug)]
pub struct LogThrottle {
    rate: Rate,
    states: HashMap<&'static str, State>,
}

impl LogThrottle {
    pub fn new(rate: Rate) -> Self {
        Self {
            rate,
            states: HashMap::new(),
        }
    }

    /// Admits at most one record per class per `period`.
    pub fn periodic(period: Duration) -> Self {
        Self::new(Rate::new(1, period))
    }

    /// Returns `Some(suppressed)` if a record of `class` should be emitted now, where
    /// `suppressed` is the number of records dropped since the last admitted one.
    pub fn check(&mut self, class: &'static str, now: Instant) -> Option<u64> {
        // disable throttling if rate is 0
        if self.rate.num == 0 {
            return Some(0);
        }

        let fresh = State::Allow {
            until: now + self.rate.period,
            rem: self.rate.num - 1,
        };
        let (next_state, admitted) = match self.states.get(class).copied() {
            None => (fresh, Some(0)),
            Some(State::Allow { until, rem }) => {
                if now >= until {
                    (fresh, Some(0))
                } else if rem == 0 {
                    (
                        State::Deny {
                            until,
                            suppressed: 1,
                        },
                        None,
                    )
                } else {
                    (State::Allow { until, rem: rem - 1 }, Some(0))
                }
            }
            Some(State::Deny { until, suppressed }) => {
                if now < until {
                    (
                        State::Deny {
                            until,
                            suppressed: suppressed + 1,
                        },
                        None,
                    )
                } else {
                    (fresh, Some(suppressed))
                }
            }
        };

        self.states.insert(class, next_state);
        admitted
    }

    /// Drains the counts of records which were suppressed and never reported.
    pub fn flush(&mut self) -> Vec<(&'static str, u64)> {
        let mut pending: Vec<_> = self
            .states
            .drain()
            .filter_map(|(class, state)| match state {
                State::Deny { suppressed, .. } if suppressed > 0 => Some((class, suppressed)),
                _ => None,
            })
            .collect();
        pending.sort();
        pending
    }
}
