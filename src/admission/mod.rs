//! Admission control
//!
//! Requests are gated per scope (`global` and `route:<id>`) by a concurrency ceiling,
//! a requests-per-second ceiling over a fixed one-second window and an optional circuit
//! breaker. Counters are plain atomics, so the hot path never takes a lock. A successful
//! admission returns an [`AdmissionPermit`] that gives the concurrency slots back when it
//! is dropped and feeds the request's outcome to the breakers.

mod breaker;

use std::{
    collections::{BTreeMap, HashMap},
    sync::{
        atomic::{AtomicU64, Ordering},
        Arc,
    },
    time::{SystemTime, UNIX_EPOCH},
};

use arc_swap::ArcSwap;
use serde::Serialize;

use crate::{
    config::{AdmissionLimits, AdmissionPolicies},
    core::{GatewayError, GatewayResult, RejectReason},
    metrics,
};

use self::breaker::{Breaker, Decision};

pub const GLOBAL_SCOPE: &str = "global";

pub fn route_scope(route_id: &str) -> String {
    format!("route:{route_id}")
}

// rate slot layout: window second (high 32 bits) | requests counted in it (low 32 bits)
const HALF_MASK: u64 = 0xFFFF_FFFF;

fn pack_slot(window: u64, count: u64) -> u64 {
    ((window & HALF_MASK) << 32) | count.min(HALF_MASK)
}

fn unpack_slot(slot: u64) -> (u64, u64) {
    (slot >> 32, slot & HALF_MASK)
}

/// Live counters and ceilings of one scope.
///
/// Ceilings are updated in place on reload so in-flight counts survive a policy swap.
struct ScopeState {
    name: String,
    max_concurrents: AtomicU64,
    max_rps: AtomicU64,
    concurrents: AtomicU64,
    slot: AtomicU64,
    blocked: AtomicU64,
    breaker: Breaker,
}

impl ScopeState {
    fn new(name: String, limits: AdmissionLimits) -> Self {
        Self {
            name,
            max_concurrents: AtomicU64::new(limits.max_concurrents),
            max_rps: AtomicU64::new(limits.max_rps),
            concurrents: AtomicU64::new(0),
            slot: AtomicU64::new(0),
            blocked: AtomicU64::new(0),
            breaker: Breaker::new(limits.breaker),
        }
    }

    fn set_limits(&self, limits: AdmissionLimits) {
        self.max_concurrents
            .store(limits.max_concurrents, Ordering::Release);
        self.max_rps.store(limits.max_rps, Ordering::Release);
        self.breaker.set_policy(limits.breaker);
    }

    fn try_acquire(&self) -> bool {
        let max = self.max_concurrents.load(Ordering::Acquire);
        if max == 0 {
            self.concurrents.fetch_add(1, Ordering::AcqRel);
            return true;
        }
        self.concurrents
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |n| {
                (n < max).then_some(n + 1)
            })
            .is_ok()
    }

    fn release(&self) {
        let _ = self
            .concurrents
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |n| n.checked_sub(1));
    }

    /// Count one request in the window of `now`, unless the window is already full.
    ///
    /// Window and count move together in one atomic, so a request counted while another
    /// thread opens the next second is never lost.
    fn try_count(&self, now: u64) -> bool {
        let max = self.max_rps.load(Ordering::Acquire);
        let now = now & HALF_MASK;
        self.slot
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |slot| {
                let (window, count) = unpack_slot(slot);
                if now > window {
                    return Some(pack_slot(now, 1));
                }
                (max == 0 || count < max).then(|| pack_slot(window, count + 1))
            })
            .is_ok()
    }

    fn uncount(&self, now: u64) {
        let now = now & HALF_MASK;
        let _ = self
            .slot
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |slot| {
                let (window, count) = unpack_slot(slot);
                (window == now && count > 0).then(|| pack_slot(window, count - 1))
            });
    }

    fn rps(&self, now: u64) -> u64 {
        let (window, count) = unpack_slot(self.slot.load(Ordering::Acquire));
        if window == now & HALF_MASK {
            count
        } else {
            0
        }
    }
}

struct HeldScope {
    state: Arc<ScopeState>,
    /// Admitted as the recovery trial of a half-open breaker
    trial: bool,
}

/// Proof of admission. Dropping it releases every concurrency slot it holds, exactly once.
#[must_use = "dropping the permit releases the admission immediately"]
pub struct AdmissionPermit {
    scopes: Vec<HeldScope>,
    outcome: Option<bool>,
}

impl AdmissionPermit {
    pub fn scopes(&self) -> impl Iterator<Item = &str> {
        self.scopes.iter().map(|s| s.state.name.as_str())
    }

    /// Report how the admitted request went. Permits dropped without an outcome are not
    /// counted by the circuit breakers.
    pub fn record_outcome(&mut self, success: bool) {
        self.outcome = Some(success);
    }

    #[cfg(test)]
    fn finish_at(mut self, now: u64) {
        self.settle(now);
    }

    fn settle(&mut self, now: u64) {
        let outcome = self.outcome;
        for held in self.scopes.drain(..) {
            let scope = &held.state;
            scope.release();
            if held.trial {
                scope.breaker.finish_trial(now, outcome);
                match outcome {
                    Some(true) => log::info!("Circuit breaker for {} closed", scope.name),
                    Some(false) => log::warn!("Circuit breaker for {} reopened", scope.name),
                    None => log::debug!("Circuit breaker trial for {} abandoned", scope.name),
                }
            } else if let Some(success) = outcome {
                if scope.breaker.record(now, success) {
                    log::warn!("Circuit breaker for {} opened", scope.name);
                }
            }
        }
    }
}

impl Drop for AdmissionPermit {
    fn drop(&mut self) {
        if !self.scopes.is_empty() {
            self.settle(now_secs());
        }
    }
}

impl std::fmt::Debug for AdmissionPermit {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_list().entries(self.scopes()).finish()
    }
}

/// Per-scope counters as reported by the flow-control status endpoint.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct ScopeSnapshot {
    pub concurrents: u64,
    pub rps: u64,
    #[serde(skip)]
    pub blocked: u64,
    /// Breaker state, for scopes that have one
    #[serde(skip_serializing_if = "Option::is_none")]
    pub breaker: Option<&'static str>,
}

pub struct AdmissionController {
    scopes: ArcSwap<HashMap<String, Arc<ScopeState>>>,
}

impl Default for AdmissionController {
    fn default() -> Self {
        Self::new()
    }
}

impl AdmissionController {
    pub fn new() -> Self {
        let mut scopes = HashMap::new();
        scopes.insert(
            GLOBAL_SCOPE.to_string(),
            Arc::new(ScopeState::new(
                GLOBAL_SCOPE.to_string(),
                AdmissionLimits::default(),
            )),
        );
        Self {
            scopes: ArcSwap::from_pointee(scopes),
        }
    }

    /// Install the ceilings of a new bundle.
    ///
    /// Surviving scopes keep their counter objects and only get new ceilings; scopes that
    /// disappear are dropped from the table while any outstanding permit still releases
    /// into its own copy.
    pub fn update_policies<'a>(
        &self,
        policies: &AdmissionPolicies,
        route_ids: impl IntoIterator<Item = &'a str>,
    ) {
        let current = self.scopes.load();
        let mut next = HashMap::new();

        let mut install = |name: String, limits: AdmissionLimits| {
            let state = match current.get(&name) {
                Some(existing) => {
                    existing.set_limits(limits);
                    existing.clone()
                }
                None => Arc::new(ScopeState::new(name.clone(), limits)),
            };
            next.insert(name, state);
        };

        install(
            GLOBAL_SCOPE.to_string(),
            policies.global.unwrap_or_default(),
        );
        for route_id in route_ids {
            install(route_scope(route_id), policies.for_route(route_id));
        }

        self.scopes.store(Arc::new(next));
    }

    pub fn try_admit(&self, scopes: &[&str]) -> GatewayResult<AdmissionPermit> {
        self.try_admit_at(scopes, now_secs())
    }

    fn try_admit_at(&self, scopes: &[&str], now: u64) -> GatewayResult<AdmissionPermit> {
        let table = self.scopes.load();
        let mut acquired: Vec<HeldScope> = Vec::with_capacity(scopes.len());

        for name in scopes {
            let Some(state) = table.get(*name) else {
                log::debug!("Admission scope {name} is not tracked, skipping");
                continue;
            };

            let mut trial = false;
            let reason = if !state.try_acquire() {
                Some(RejectReason::Concurrency)
            } else if !state.try_count(now) {
                state.release();
                Some(RejectReason::Rate)
            } else {
                match state.breaker.decide(now) {
                    Decision::Allow => None,
                    Decision::Trial => {
                        log::info!("Circuit breaker for {name} half-open, admitting a trial");
                        trial = true;
                        None
                    }
                    Decision::Reject => {
                        state.release();
                        state.uncount(now);
                        Some(RejectReason::Degraded)
                    }
                }
            };

            if let Some(reason) = reason {
                for held in acquired.drain(..) {
                    held.state.release();
                    held.state.uncount(now);
                    if held.trial {
                        held.state.breaker.finish_trial(now, None);
                    }
                }
                state.blocked.fetch_add(1, Ordering::Relaxed);
                metrics::ADMISSION_REJECTED
                    .with_label_values(&[*name, reason.as_str()])
                    .inc();
                log::debug!("Admission rejected for {name}: {}", reason.as_str());
                return Err(GatewayError::AdmissionRejected {
                    scope: name.to_string(),
                    reason,
                });
            }

            acquired.push(HeldScope {
                state: state.clone(),
                trial,
            });
        }

        Ok(AdmissionPermit {
            scopes: acquired,
            outcome: None,
        })
    }

    /// Number of requests currently holding a global permit.
    pub fn in_flight(&self) -> u64 {
        self.scopes
            .load()
            .get(GLOBAL_SCOPE)
            .map_or(0, |s| s.concurrents.load(Ordering::Acquire))
    }

    pub fn snapshot(&self) -> BTreeMap<String, ScopeSnapshot> {
        let now = now_secs();
        self.scopes
            .load()
            .iter()
            .map(|(name, state)| {
                (
                    name.clone(),
                    ScopeSnapshot {
                        concurrents: state.concurrents.load(Ordering::Acquire),
                        rps: state.rps(now),
                        blocked: state.blocked.load(Ordering::Relaxed),
                        breaker: state
                            .breaker
                            .is_enabled()
                            .then(|| state.breaker.state_name()),
                    },
                )
            })
            .collect()
    }
}

fn now_secs() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map_or(0, |d| d.as_secs())
}

#[cfg(test)]
mod tests {
    use std::{sync::Barrier, thread};

    use super::*;
    use crate::config::BreakerPolicy;

    fn controller(global: AdmissionLimits, route: AdmissionLimits) -> AdmissionController {
        let ctl = AdmissionController::new();
        let mut policies = AdmissionPolicies {
            global: Some(global),
            ..Default::default()
        };
        policies.routes.insert("r".to_string(), route);
        ctl.update_policies(&policies, ["r"]);
        ctl
    }

    fn limits(max_concurrents: u64, max_rps: u64) -> AdmissionLimits {
        AdmissionLimits {
            max_concurrents,
            max_rps,
            breaker: None,
        }
    }

    #[test]
    fn test_concurrency_ceiling_and_release() {
        let ctl = controller(limits(0, 0), limits(2, 0));
        let scopes = [GLOBAL_SCOPE, "route:r"];

        let first = ctl.try_admit(&scopes).unwrap();
        let second = ctl.try_admit(&scopes).unwrap();
        let third = ctl.try_admit(&scopes);
        assert!(matches!(
            third,
            Err(GatewayError::AdmissionRejected {
                reason: RejectReason::Concurrency,
                ..
            })
        ));
        // the rejected call must not leak a global slot
        assert_eq!(ctl.in_flight(), 2);

        drop(first);
        let fourth = ctl.try_admit(&scopes).unwrap();
        assert_eq!(ctl.snapshot()["route:r"].concurrents, 2);

        drop(second);
        drop(fourth);
        assert_eq!(ctl.in_flight(), 0);
        assert_eq!(ctl.snapshot()["route:r"].blocked, 1);
    }

    #[test]
    fn test_rate_window() {
        let ctl = controller(limits(0, 0), limits(0, 2));
        let scopes = [GLOBAL_SCOPE, "route:r"];

        drop(ctl.try_admit_at(&scopes, 100).unwrap());
        drop(ctl.try_admit_at(&scopes, 100).unwrap());
        let err = ctl.try_admit_at(&scopes, 100).unwrap_err();
        assert!(matches!(
            err,
            GatewayError::AdmissionRejected {
                reason: RejectReason::Rate,
                ..
            }
        ));
        assert_eq!(ctl.in_flight(), 0);

        // a new second opens a new window
        assert!(ctl.try_admit_at(&scopes, 101).is_ok());
    }

    #[test]
    fn test_rejection_rolls_back_earlier_scopes() {
        let ctl = controller(limits(10, 10), limits(1, 0));
        let scopes = [GLOBAL_SCOPE, "route:r"];

        let held = ctl.try_admit_at(&scopes, 5).unwrap();
        assert!(ctl.try_admit_at(&scopes, 5).is_err());
        assert_eq!(ctl.in_flight(), 1);

        let table = ctl.scopes.load();
        assert_eq!(table[GLOBAL_SCOPE].rps(5), 1);
        drop(held);
    }

    #[test]
    fn test_policy_swap_keeps_counters() {
        let ctl = controller(limits(0, 0), limits(1, 0));
        let permit = ctl.try_admit(&["route:r"]).unwrap();
        assert!(ctl.try_admit(&["route:r"]).is_err());

        let mut raised = AdmissionPolicies::default();
        raised.routes.insert("r".to_string(), limits(5, 0));
        ctl.update_policies(&raised, ["r"]);
        assert_eq!(ctl.snapshot()["route:r"].concurrents, 1);
        let second = ctl.try_admit(&["route:r"]).unwrap();
        assert_eq!(ctl.snapshot()["route:r"].concurrents, 2);

        // route removed while permits are outstanding
        ctl.update_policies(&AdmissionPolicies::default(), std::iter::empty());
        assert!(!ctl.snapshot().contains_key("route:r"));
        drop(permit);
        drop(second);
    }

    #[test]
    fn test_unknown_scope_is_not_tracked() {
        let ctl = AdmissionController::new();
        let permit = ctl.try_admit(&[GLOBAL_SCOPE, "route:missing"]).unwrap();
        assert_eq!(permit.scopes().collect::<Vec<_>>(), vec![GLOBAL_SCOPE]);
    }

    #[test]
    fn test_ceiling_holds_under_contention() {
        let ctl = Arc::new(controller(limits(4, 0), limits(0, 0)));
        let peak = Arc::new(AtomicU64::new(0));

        let handles: Vec<_> = (0..8)
            .map(|_| {
                let ctl = ctl.clone();
                let peak = peak.clone();
                thread::spawn(move || {
                    for _ in 0..500 {
                        if let Ok(permit) = ctl.try_admit(&[GLOBAL_SCOPE]) {
                            peak.fetch_max(ctl.in_flight(), Ordering::AcqRel);
                            drop(permit);
                        }
                    }
                })
            })
            .collect();
        for handle in handles {
            handle.join().unwrap();
        }

        assert!(peak.load(Ordering::Acquire) <= 4);
        assert_eq!(ctl.in_flight(), 0);
    }

    #[test]
    fn test_snapshot_json_shape() {
        let ctl = controller(limits(0, 0), limits(0, 0));
        let _permit = ctl.try_admit(&[GLOBAL_SCOPE]).unwrap();
        let json = serde_json::to_value(ctl.snapshot()).unwrap();
        assert_eq!(json["global"]["concurrents"], 1);
        assert!(json["global"].get("rps").is_some());
        assert!(json["global"].get("blocked").is_none());
    }

    #[test]
    fn test_rate_window_rolls_over_under_contention() {
        let ctl = Arc::new(controller(limits(0, 100), limits(0, 0)));
        let barrier = Arc::new(Barrier::new(8));
        let admitted = Arc::new(AtomicU64::new(0));

        let handles: Vec<_> = (0..8)
            .map(|_| {
                let ctl = ctl.clone();
                let barrier = barrier.clone();
                let admitted = admitted.clone();
                thread::spawn(move || {
                    for now in [300, 301] {
                        for _ in 0..50 {
                            if ctl.try_admit_at(&[GLOBAL_SCOPE], now).is_ok() {
                                admitted.fetch_add(1, Ordering::AcqRel);
                            }
                        }
                        barrier.wait();
                    }
                })
            })
            .collect();
        for handle in handles {
            handle.join().unwrap();
        }

        assert_eq!(admitted.load(Ordering::Acquire), 200);
        assert_eq!(ctl.scopes.load()[GLOBAL_SCOPE].rps(301), 100);
    }

    fn breaker_limits() -> AdmissionLimits {
        AdmissionLimits {
            breaker: Some(BreakerPolicy {
                error_ratio_percent: 50,
                min_requests: 2,
                monitor_secs: 10,
                break_secs: 5,
            }),
            ..limits(0, 0)
        }
    }

    fn is_degraded(result: GatewayResult<AdmissionPermit>) -> bool {
        matches!(
            result,
            Err(GatewayError::AdmissionRejected {
                reason: RejectReason::Degraded,
                ..
            })
        )
    }

    #[test]
    fn test_breaker_cycle() {
        let ctl = controller(limits(0, 0), breaker_limits());
        let scopes = [GLOBAL_SCOPE, "route:r"];
        assert_eq!(ctl.snapshot()["route:r"].breaker, Some("closed"));
        assert_eq!(ctl.snapshot()[GLOBAL_SCOPE].breaker, None);

        for _ in 0..2 {
            let mut permit = ctl.try_admit_at(&scopes, 100).unwrap();
            permit.record_outcome(false);
            permit.finish_at(100);
        }
        assert_eq!(ctl.snapshot()["route:r"].breaker, Some("open"));
        assert!(is_degraded(ctl.try_admit_at(&scopes, 101)));
        assert_eq!(ctl.in_flight(), 0);

        // one trial once the break is over, everyone else keeps being turned away
        let mut trial = ctl.try_admit_at(&scopes, 105).unwrap();
        assert_eq!(ctl.snapshot()["route:r"].breaker, Some("half_open"));
        assert!(is_degraded(ctl.try_admit_at(&scopes, 105)));
        trial.record_outcome(false);
        trial.finish_at(105);
        assert_eq!(ctl.snapshot()["route:r"].breaker, Some("open"));
        assert!(is_degraded(ctl.try_admit_at(&scopes, 109)));

        let mut trial = ctl.try_admit_at(&scopes, 110).unwrap();
        trial.record_outcome(true);
        trial.finish_at(110);
        assert_eq!(ctl.snapshot()["route:r"].breaker, Some("closed"));
        assert!(ctl.try_admit_at(&scopes, 110).is_ok());
        assert_eq!(ctl.in_flight(), 0);
    }

    #[test]
    fn test_trial_handed_back_when_later_scope_rejects() {
        let ctl = controller(limits(1, 0), breaker_limits());
        for _ in 0..2 {
            let mut permit = ctl.try_admit_at(&["route:r"], 100).unwrap();
            permit.record_outcome(false);
            permit.finish_at(100);
        }

        let _held = ctl.try_admit_at(&[GLOBAL_SCOPE], 105).unwrap();
        let err = ctl.try_admit_at(&["route:r", GLOBAL_SCOPE], 105);
        assert!(matches!(
            err,
            Err(GatewayError::AdmissionRejected {
                reason: RejectReason::Concurrency,
                ..
            })
        ));
        assert_eq!(ctl.snapshot()["route:r"].breaker, Some("open"));
        // the next caller gets the trial right away
        assert!(ctl.try_admit_at(&["route:r"], 105).is_ok());
    }

    #[test]
    fn test_permit_without_outcome_is_not_counted() {
        let ctl = controller(limits(0, 0), breaker_limits());
        for _ in 0..5 {
            drop(ctl.try_admit_at(&["route:r"], 100).unwrap());
        }
        assert_eq!(ctl.snapshot()["route:r"].breaker, Some("closed"));
    }
}
