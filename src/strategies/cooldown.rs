use chrono::{DateTime, Duration, Utc};
use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::{Mutex, MutexGuard, PoisonError};

use crate::models::Timeframe;
use crate::strategies::signals::SuppressedReason;

type Key = (String, Timeframe);

#[derive(Default)]
struct Inner {
    last_emitted: HashMap<Key, DateTime<Utc>>,
    /// Emission times per symbol, oldest first.
    emissions: HashMap<String, VecDeque<DateTime<Utc>>>,
    pending: HashSet<Key>,
    pending_per_symbol: HashMap<String, usize>,
}

/// Per (symbol, timeframe) cooldown plus a per-symbol trailing-hour rate limit.
///
/// A caller first reserves a slot; the check and the reservation happen under
/// one lock, so two concurrent requests can never both pass. An in-flight
/// reservation counts as an emission for both gates until it is committed or
/// dropped.
pub struct CooldownState {
    cooldown: Duration,
    max_per_hour: usize,
    inner: Mutex<Inner>,
}

impl CooldownState {
    pub fn new(cooldown: std::time::Duration, max_per_hour: usize) -> Self {
        Self {
            cooldown: Duration::from_std(cooldown).unwrap_or(Duration::zero()),
            max_per_hour,
            inner: Mutex::new(Inner::default()),
        }
    }

    fn lock(&self) -> MutexGuard<'_, Inner> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn try_reserve(
        &self,
        symbol: &str,
        timeframe: Timeframe,
        now: DateTime<Utc>,
    ) -> Result<Reservation<'_>, SuppressedReason> {
        let key = (symbol.to_string(), timeframe);
        let mut inner = self.lock();

        if inner.pending.contains(&key) {
            return Err(SuppressedReason::Cooldown);
        }
        if let Some(last) = inner.last_emitted.get(&key) {
            if now - *last < self.cooldown {
                return Err(SuppressedReason::Cooldown);
            }
        }

        let emitted = prune(&mut inner, symbol, now);
        let pending = inner.pending_per_symbol.get(symbol).copied().unwrap_or(0);
        if emitted + pending >= self.max_per_hour {
            return Err(SuppressedReason::RateLimit);
        }

        inner.pending.insert(key.clone());
        *inner.pending_per_symbol.entry(symbol.to_string()).or_insert(0) += 1;

        Ok(Reservation {
            state: self,
            key,
            committed: false,
        })
    }

    pub fn last_emitted(&self, symbol: &str, timeframe: Timeframe) -> Option<DateTime<Utc>> {
        self.lock()
            .last_emitted
            .get(&(symbol.to_string(), timeframe))
            .copied()
    }

    pub fn emissions_last_hour(&self, symbol: &str, now: DateTime<Utc>) -> usize {
        let mut inner = self.lock();
        prune(&mut inner, symbol, now)
    }

    fn release(&self, key: &Key) {
        let mut inner = self.lock();
        unpend(&mut inner, key);
    }

    fn record(&self, key: &Key, at: DateTime<Utc>) {
        let mut inner = self.lock();
        unpend(&mut inner, key);
        inner.last_emitted.insert(key.clone(), at);
        inner.emissions.entry(key.0.clone()).or_default().push_back(at);
    }
}

/// Drop emissions older than one hour; returns how many remain.
fn prune(inner: &mut Inner, symbol: &str, now: DateTime<Utc>) -> usize {
    let Some(q) = inner.emissions.get_mut(symbol) else {
        return 0;
    };
    let cutoff = now - Duration::hours(1);
    while q.front().is_some_and(|t| *t <= cutoff) {
        q.pop_front();
    }
    q.len()
}

fn unpend(inner: &mut Inner, key: &Key) {
    if inner.pending.remove(key) {
        if let Some(n) = inner.pending_per_symbol.get_mut(&key.0) {
            *n = n.saturating_sub(1);
        }
    }
}

/// A held cooldown slot. Released on drop unless committed.
pub struct Reservation<'a> {
    state: &'a CooldownState,
    key: Key,
    committed: bool,
}

impl Reservation<'_> {
    pub fn commit(mut self, at: DateTime<Utc>) {
        self.state.record(&self.key, at);
        self.committed = true;
    }
}

impl Drop for Reservation<'_> {
    fn drop(&mut self) {
        if !self.committed {
            self.state.release(&self.key);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn t0() -> DateTime<Utc> {
        DateTime::parse_from_rfc3339("2024-03-01T10:00:00Z")
            .unwrap()
            .with_timezone(&Utc)
    }

    fn state(cooldown_secs: u64, max: usize) -> CooldownState {
        CooldownState::new(std::time::Duration::from_secs(cooldown_secs), max)
    }

    #[test]
    fn pending_reservation_blocks_second_request() {
        let cd = state(60, 50);
        let r = cd.try_reserve("BTC-USD", Timeframe::H1, t0()).unwrap();
        assert!(matches!(
            cd.try_reserve("BTC-USD", Timeframe::H1, t0()),
            Err(SuppressedReason::Cooldown)
        ));
        // other timeframe is independent
        assert!(cd.try_reserve("BTC-USD", Timeframe::M5, t0()).is_ok());
        drop(r);
        assert!(cd.try_reserve("BTC-USD", Timeframe::H1, t0()).is_ok());
    }

    #[test]
    fn committed_emission_starts_cooldown() {
        let cd = state(60, 50);
        cd.try_reserve("BTC-USD", Timeframe::H1, t0()).unwrap().commit(t0());
        assert_eq!(cd.last_emitted("BTC-USD", Timeframe::H1), Some(t0()));

        let within = t0() + Duration::seconds(59);
        assert!(matches!(
            cd.try_reserve("BTC-USD", Timeframe::H1, within),
            Err(SuppressedReason::Cooldown)
        ));
        let after = t0() + Duration::seconds(60);
        assert!(cd.try_reserve("BTC-USD", Timeframe::H1, after).is_ok());
    }

    #[test]
    fn rate_limit_counts_trailing_hour_per_symbol() {
        let cd = state(0, 2);
        cd.try_reserve("ETH-USD", Timeframe::M1, t0()).unwrap().commit(t0());
        let t1 = t0() + Duration::minutes(10);
        cd.try_reserve("ETH-USD", Timeframe::M5, t1).unwrap().commit(t1);

        let t2 = t0() + Duration::minutes(30);
        assert!(matches!(
            cd.try_reserve("ETH-USD", Timeframe::H1, t2),
            Err(SuppressedReason::RateLimit)
        ));
        assert!(cd.try_reserve("BTC-USD", Timeframe::H1, t2).is_ok());

        // first emission ages out
        let t3 = t0() + Duration::minutes(61);
        assert_eq!(cd.emissions_last_hour("ETH-USD", t3), 1);
        assert!(cd.try_reserve("ETH-USD", Timeframe::H1, t3).is_ok());
    }

    #[test]
    fn concurrent_reservations_admit_one() {
        let cd = std::sync::Arc::new(state(60, 50));
        let barrier = std::sync::Arc::new(std::sync::Barrier::new(8));
        let handles: Vec<_> = (0..8)
            .map(|_| {
                let cd = cd.clone();
                let barrier = barrier.clone();
                std::thread::spawn(move || {
                    barrier.wait();
                    match cd.try_reserve("BTC-USD", Timeframe::H1, t0()) {
                        Ok(r) => {
                            r.commit(t0());
                            true
                        }
                        Err(_) => false,
                    }
                })
            })
            .collect();
        let admitted = handles
            .into_iter()
            .map(|h| h.join().unwrap())
            .filter(|ok| *ok)
            .count();
        assert_eq!(admitted, 1);
    }
}
