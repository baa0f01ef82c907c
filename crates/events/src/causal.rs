//! Deterministic total order over arbitrary event sets.
//!
//! No global sequence exists across streams, and wall clocks on disconnected
//! devices drift. When semantic order matters (conflict resolution,
//! order-sensitive projections), consumers sort with `causal_sort`, which
//! applies six rules, first difference wins:
//!
//! 1. same stream: lower `aggregate_version` first
//! 2. causation: a cause precedes its effects, transitively
//! 3. same device: lower `local_sequence_number` first
//! 4. drift-adjusted `occurred_at`, ascending
//! 5. `recorded_at`, ascending
//! 6. `event_id`, ascending (time-sortable tiebreak)
//!
//! Rules 1–3 are hard precedence constraints and become edges in a graph;
//! rules 4–6 form the comparison key that picks among unconstrained events.
//! The result is independent of input order. A causation cycle means an
//! operator violated provenance; it is reported, never reordered around.

use std::cmp::Reverse;
use std::collections::{BinaryHeap, HashMap};

use thiserror::Error;

use caresync_core::{AggregateId, AggregateKind, EventId, InvariantCode};

use crate::envelope::EventEnvelope;

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum CausalOrderError {
    /// Precedence constraints contradict each other; carries the events that
    /// could not be scheduled and the invariant code for the review queue.
    #[error("{code}: causal precedence cycle involving {} events", remaining.len())]
    Cycle {
        code: InvariantCode,
        remaining: Vec<EventId>,
    },
}

/// Sort an arbitrary event set into the canonical causal order.
///
/// Deterministic: any permutation of the same set yields the same sequence.
pub fn causal_sort<E: Clone>(
    events: Vec<EventEnvelope<E>>,
) -> Result<Vec<EventEnvelope<E>>, CausalOrderError> {
    let n = events.len();
    if n <= 1 {
        return Ok(events);
    }

    let index_by_id: HashMap<EventId, usize> = events
        .iter()
        .enumerate()
        .map(|(i, e)| (e.event_id(), i))
        .collect();

    let mut successors: Vec<Vec<usize>> = vec![Vec::new(); n];
    let mut indegree: Vec<usize> = vec![0; n];
    let add_edge = |successors: &mut Vec<Vec<usize>>, indegree: &mut Vec<usize>, from: usize, to: usize| {
        successors[from].push(to);
        indegree[to] += 1;
    };

    // Rule 1: within one stream, ascending aggregate_version. Equal versions
    // (contested writes) get no edge and fall through to the key rules.
    let mut by_stream: HashMap<(AggregateKind, AggregateId), Vec<usize>> = HashMap::new();
    for (i, e) in events.iter().enumerate() {
        by_stream
            .entry((e.aggregate_type(), e.aggregate_id()))
            .or_default()
            .push(i);
    }
    for members in by_stream.values_mut() {
        members.sort_by_key(|&i| (events[i].aggregate_version(), events[i].event_id()));
        for pair in members.windows(2) {
            if events[pair[0]].aggregate_version() < events[pair[1]].aggregate_version() {
                add_edge(&mut successors, &mut indegree, pair[0], pair[1]);
            }
        }
    }

    // Rule 2: causation chains, transitively via edges.
    for (i, e) in events.iter().enumerate() {
        if let Some(cause) = e.causation_id() {
            if let Some(&j) = index_by_id.get(&cause) {
                if j != i {
                    add_edge(&mut successors, &mut indegree, j, i);
                }
            }
        }
    }

    // Rule 3: within one device, ascending local sequence number.
    let mut by_device: HashMap<&str, Vec<usize>> = HashMap::new();
    for (i, e) in events.iter().enumerate() {
        by_device.entry(&e.device().device_id).or_default().push(i);
    }
    for members in by_device.values_mut() {
        members.sort_by_key(|&i| {
            (
                events[i].device().local_sequence_number,
                events[i].event_id(),
            )
        });
        for pair in members.windows(2) {
            let a = events[pair[0]].device().local_sequence_number;
            let b = events[pair[1]].device().local_sequence_number;
            if a < b {
                add_edge(&mut successors, &mut indegree, pair[0], pair[1]);
            }
        }
    }

    // Rules 4-6 pick among simultaneously ready events.
    let key = |i: usize| {
        let e = &events[i];
        (
            e.adjusted_occurred_at(),
            e.recorded_at(),
            e.event_id(),
        )
    };

    let mut ready: BinaryHeap<Reverse<_>> = indegree
        .iter()
        .enumerate()
        .filter(|&(_, &deg)| deg == 0)
        .map(|(i, _)| Reverse((key(i), i)))
        .collect();

    let mut order = Vec::with_capacity(n);
    while let Some(Reverse((_, i))) = ready.pop() {
        order.push(i);
        for &next in &successors[i] {
            indegree[next] -= 1;
            if indegree[next] == 0 {
                ready.push(Reverse((key(next), next)));
            }
        }
    }

    if order.len() < n {
        let mut scheduled = vec![false; n];
        for &i in &order {
            scheduled[i] = true;
        }
        let mut remaining: Vec<EventId> = events
            .iter()
            .enumerate()
            .filter(|&(i, _)| !scheduled[i])
            .map(|(_, e)| e.event_id())
            .collect();
        remaining.sort();
        return Err(CausalOrderError::Cycle {
            code: InvariantCode::CausationCycle,
            remaining,
        });
    }

    // Reorder by indices without cloning payloads.
    let mut slots: Vec<Option<EventEnvelope<E>>> = events.into_iter().map(Some).collect();
    Ok(order
        .into_iter()
        .filter_map(|i| slots[i].take())
        .collect())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::envelope::{ActorContext, DeviceContext, OrgContext, TraceContext};
    use caresync_core::{
        ConnectionStatus, CorrelationId, FacilityId, OrganizationId, PerformerId, PerformerRole,
        Visibility,
    };
    use chrono::{TimeZone, Utc};
    use proptest::prelude::*;
    use serde_json::json;

    struct Spec {
        aggregate: (AggregateKind, AggregateId),
        version: u64,
        device: &'static str,
        lsn: u64,
        drift_ms: i64,
        occurred_s: i64,
        caused_by: Option<EventId>,
    }

    fn envelope(spec: Spec) -> EventEnvelope<serde_json::Value> {
        let occurred = Utc
            .with_ymd_and_hms(2024, 6, 1, 9, 0, 0)
            .unwrap()
            .fixed_offset()
            + chrono::Duration::seconds(spec.occurred_s);
        EventEnvelope::new(
            EventId::new(),
            "test.event",
            1,
            spec.aggregate.1,
            spec.aggregate.0,
            spec.version,
            occurred,
            occurred,
            ActorContext {
                performed_by: PerformerId::new(),
                performer_role: PerformerRole::Nurse,
            },
            OrgContext {
                organization_id: OrganizationId::new(),
                facility_id: FacilityId::new(),
            },
            DeviceContext {
                device_id: spec.device.to_string(),
                connection_status: ConnectionStatus::Offline,
                device_clock_drift_ms: spec.drift_ms,
                local_sequence_number: spec.lsn,
                sync_batch_id: None,
            },
            TraceContext {
                correlation_id: CorrelationId::new(),
                causation_id: spec.caused_by,
            },
            Visibility::clinical(),
            json!({}),
        )
    }

    #[test]
    fn stream_version_dominates_time() {
        let stream = (AggregateKind::Encounter, AggregateId::new());
        // v2 happened "later" by clock but must come before v3.
        let v2 = envelope(Spec {
            aggregate: stream,
            version: 2,
            device: "d1",
            lsn: 1,
            drift_ms: 0,
            occurred_s: 100,
            caused_by: None,
        });
        let v3 = envelope(Spec {
            aggregate: stream,
            version: 3,
            device: "d2",
            lsn: 1,
            drift_ms: 0,
            occurred_s: 0,
            caused_by: None,
        });
        let sorted = causal_sort(vec![v3.clone(), v2.clone()]).unwrap();
        assert_eq!(sorted[0].event_id(), v2.event_id());
        assert_eq!(sorted[1].event_id(), v3.event_id());
    }

    #[test]
    fn causation_chains_are_transitive() {
        let a = envelope(Spec {
            aggregate: (AggregateKind::Encounter, AggregateId::new()),
            version: 1,
            device: "d1",
            lsn: 1,
            drift_ms: 0,
            occurred_s: 50,
            caused_by: None,
        });
        let b_spec = Spec {
            aggregate: (AggregateKind::VitalSigns, AggregateId::new()),
            version: 1,
            device: "d2",
            lsn: 1,
            drift_ms: 0,
            occurred_s: 10, // claims an earlier clock, causation still wins
            caused_by: Some(a.event_id()),
        };
        let b = envelope(b_spec);
        let c = envelope(Spec {
            aggregate: (AggregateKind::Symptom, AggregateId::new()),
            version: 1,
            device: "d3",
            lsn: 1,
            drift_ms: 0,
            occurred_s: 0,
            caused_by: Some(b.event_id()),
        });

        let sorted = causal_sort(vec![c.clone(), a.clone(), b.clone()]).unwrap();
        let ids: Vec<_> = sorted.iter().map(|e| e.event_id()).collect();
        assert_eq!(ids, vec![a.event_id(), b.event_id(), c.event_id()]);
    }

    #[test]
    fn drift_adjustment_reorders_across_devices() {
        // d1 reads 09:00:30 but runs 60s fast; adjusted time is 08:59:30.
        let fast = envelope(Spec {
            aggregate: (AggregateKind::VitalSigns, AggregateId::new()),
            version: 1,
            device: "d1",
            lsn: 1,
            drift_ms: 60_000,
            occurred_s: 30,
            caused_by: None,
        });
        let honest = envelope(Spec {
            aggregate: (AggregateKind::Symptom, AggregateId::new()),
            version: 1,
            device: "d2",
            lsn: 1,
            drift_ms: 0,
            occurred_s: 0,
            caused_by: None,
        });
        let sorted = causal_sort(vec![honest.clone(), fast.clone()]).unwrap();
        assert_eq!(sorted[0].event_id(), fast.event_id());
    }

    #[test]
    fn causation_cycle_is_reported_not_swallowed() {
        let stream = (AggregateKind::Encounter, AggregateId::new());
        let a = envelope(Spec {
            aggregate: stream,
            version: 1,
            device: "d1",
            lsn: 1,
            drift_ms: 0,
            occurred_s: 0,
            caused_by: None,
        });
        // Claims to be caused by a later event in the same stream.
        let mut b = envelope(Spec {
            aggregate: stream,
            version: 2,
            device: "d1",
            lsn: 2,
            drift_ms: 0,
            occurred_s: 1,
            caused_by: None,
        });
        let c = envelope(Spec {
            aggregate: stream,
            version: 3,
            device: "d1",
            lsn: 3,
            drift_ms: 0,
            occurred_s: 2,
            caused_by: Some(b.event_id()),
        });
        b = EventEnvelope::new(
            b.event_id(),
            b.event_type().to_string(),
            b.schema_version(),
            b.aggregate_id(),
            b.aggregate_type(),
            b.aggregate_version(),
            b.occurred_at(),
            b.recorded_at(),
            *b.actor(),
            *b.org(),
            b.device().clone(),
            TraceContext {
                correlation_id: b.trace().correlation_id,
                causation_id: Some(c.event_id()),
            },
            b.visibility().clone(),
            b.payload().clone(),
        );

        let err = causal_sort(vec![a, b, c]).unwrap_err();
        match err {
            CausalOrderError::Cycle { code, remaining } => {
                assert_eq!(code, InvariantCode::CausationCycle);
                assert_eq!(remaining.len(), 2);
            }
        }
    }

    proptest! {
        /// Determinism: any shuffle of the same set sorts identically.
        #[test]
        fn order_is_shuffle_invariant(seed in 0u64..1000) {
            let stream = (AggregateKind::Encounter, AggregateId::new());
            let mut events = Vec::new();
            for v in 1..=4u64 {
                events.push(envelope(Spec {
                    aggregate: stream,
                    version: v,
                    device: "d1",
                    lsn: v,
                    drift_ms: 0,
                    occurred_s: 100 - v as i64,
                    caused_by: None,
                }));
            }
            for lsn in 1..=3u64 {
                events.push(envelope(Spec {
                    aggregate: (AggregateKind::VitalSigns, AggregateId::new()),
                    version: 1,
                    device: "d2",
                    lsn,
                    drift_ms: 30_000,
                    occurred_s: lsn as i64,
                    caused_by: None,
                }));
            }

            let baseline: Vec<_> = causal_sort(events.clone())
                .unwrap()
                .iter()
                .map(|e| e.event_id())
                .collect();

            // Cheap deterministic shuffle driven by the seed.
            let mut shuffled = events;
            let len = shuffled.len();
            let mut s = seed;
            for i in (1..len).rev() {
                s = s.wrapping_mul(6364136223846793005).wrapping_add(1442695040888963407);
                shuffled.swap(i, (s as usize) % (i + 1));
            }

            let resorted: Vec<_> = causal_sort(shuffled)
                .unwrap()
                .iter()
                .map(|e| e.event_id())
                .collect();
            prop_assert_eq!(baseline, resorted);
        }
    }
}
