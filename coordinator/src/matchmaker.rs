//! The matchmaker abstraction and built-in implementations (spec.md §4.D).
//!
//! A [`Matchmaker`] is a pure, side-effect-free predicate-and-selector: given
//! an arriving candidate and an already-filtered waiting list, it either
//! proposes a group or says "wait". It never mutates the registry or the
//! wait room itself — the caller (the session lifecycle manager) does that.

use crate::registry::GroupHistory;
use protocol::SubjectId;
use std::collections::{HashSet, VecDeque};

/// Ephemeral, constructed per match attempt (§3 `MatchCandidate`).
#[derive(Debug, Clone)]
pub struct MatchCandidate {
    pub subject_id: SubjectId,
    pub rtt_to_server_ms: Option<u32>,
    pub group_history: Option<GroupHistory>,
    pub custom_attributes: serde_json::Map<String, serde_json::Value>,
}

/// `find_match` must be deterministic and side-effect-free (§4.D).
pub trait Matchmaker: Send + Sync {
    /// Returns `None` to mean "the arriving candidate should wait" — the
    /// only way to signal that. Otherwise returns exactly `group_size`
    /// candidates, including `arriving`, in player-slot order.
    fn find_match(
        &self,
        arriving: &MatchCandidate,
        waiting: &[MatchCandidate],
        group_size: usize,
    ) -> Option<Vec<SubjectId>>;

    fn name(&self) -> &'static str;
}

/// Takes the first `group_size - 1` waiting candidates (stable insertion
/// order) and appends the arriving one.
pub struct Fifo;

impl Matchmaker for Fifo {
    fn find_match(
        &self,
        arriving: &MatchCandidate,
        waiting: &[MatchCandidate],
        group_size: usize,
    ) -> Option<Vec<SubjectId>> {
        if group_size == 0 {
            return None;
        }
        let needed = group_size - 1;
        if waiting.len() < needed {
            return None;
        }
        let mut group: Vec<SubjectId> =
            waiting[..needed].iter().map(|c| c.subject_id.clone()).collect();
        group.push(arriving.subject_id.clone());
        Some(group)
    }

    fn name(&self) -> &'static str {
        "fifo"
    }
}

/// FIFO over the subset of `waiting` whose combined server RTT with
/// `arriving` is within `max_server_rtt_sum_ms`. A missing RTT on either
/// side is always treated as compatible (§4.D: "never block indefinitely on
/// missing data alone").
pub struct LatencyFifo {
    pub max_server_rtt_sum_ms: u32,
}

impl Matchmaker for LatencyFifo {
    fn find_match(
        &self,
        arriving: &MatchCandidate,
        waiting: &[MatchCandidate],
        group_size: usize,
    ) -> Option<Vec<SubjectId>> {
        let filtered: Vec<MatchCandidate> = waiting
            .iter()
            .filter(|c| match (c.rtt_to_server_ms, arriving.rtt_to_server_ms) {
                (Some(a), Some(b)) => a + b <= self.max_server_rtt_sum_ms,
                _ => true,
            })
            .cloned()
            .collect();
        Fifo.find_match(arriving, &filtered, group_size)
    }

    fn name(&self) -> &'static str {
        "latency_fifo"
    }
}

/// Prefers reuniting `arriving` with its most recent partners (§4.D); falls
/// back to FIFO over the full waiting list if configured and reunion finds
/// too few candidates.
pub struct GroupReunion {
    pub fallback_to_fifo: bool,
}

impl Matchmaker for GroupReunion {
    fn find_match(
        &self,
        arriving: &MatchCandidate,
        waiting: &[MatchCandidate],
        group_size: usize,
    ) -> Option<Vec<SubjectId>> {
        let previous_partners: HashSet<SubjectId> = arriving
            .group_history
            .as_ref()
            .map(|h| h.previous_partners.clone())
            .unwrap_or_default();

        if !previous_partners.is_empty() {
            let intersection: Vec<SubjectId> = waiting
                .iter()
                .filter(|c| previous_partners.contains(&c.subject_id))
                .map(|c| c.subject_id.clone())
                .collect();
            if intersection.len() + 1 >= group_size {
                let mut group = intersection;
                group.truncate(group_size - 1);
                group.push(arriving.subject_id.clone());
                return Some(group);
            }
        }

        if self.fallback_to_fifo {
            return Fifo.find_match(arriving, waiting, group_size);
        }
        None
    }

    fn name(&self) -> &'static str {
        "group_reunion"
    }
}

/// Per-scene FIFO queue of `IDLE`-entering participants; insertion order is
/// the authoritative "waiting" order (§3 `WaitRoom`).
#[derive(Default)]
pub struct WaitRoom {
    queue: VecDeque<MatchCandidate>,
}

impl WaitRoom {
    pub fn new() -> Self {
        Self { queue: VecDeque::new() }
    }

    pub fn push(&mut self, candidate: MatchCandidate) {
        self.queue.push_back(candidate);
    }

    pub fn as_slice_vec(&self) -> Vec<MatchCandidate> {
        self.queue.iter().cloned().collect()
    }

    /// Removes the named candidates, preserving the relative order of the
    /// survivors.
    pub fn remove(&mut self, subjects: &[SubjectId]) {
        self.queue.retain(|c| !subjects.contains(&c.subject_id));
    }

    /// Re-inserts candidates at the head, in their original relative order,
    /// i.e. ahead of whoever is currently waiting (used when a proposed
    /// match's probe fails and candidates return to their queue positions).
    pub fn push_front_many(&mut self, candidates: Vec<MatchCandidate>) {
        for candidate in candidates.into_iter().rev() {
            self.queue.push_front(candidate);
        }
    }

    pub fn len(&self) -> usize {
        self.queue.len()
    }

    pub fn is_empty(&self) -> bool {
        self.queue.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn candidate(id: &str, rtt: Option<u32>) -> MatchCandidate {
        MatchCandidate {
            subject_id: SubjectId::from(id),
            rtt_to_server_ms: rtt,
            group_history: None,
            custom_attributes: serde_json::Map::new(),
        }
    }

    #[test]
    fn fifo_waits_until_enough_candidates() {
        let arriving = candidate("arriving", None);
        assert_eq!(Fifo.find_match(&arriving, &[], 2), None);
        let waiting = vec![candidate("a", None)];
        assert_eq!(
            Fifo.find_match(&arriving, &waiting, 2),
            Some(vec![SubjectId::from("a"), SubjectId::from("arriving")])
        );
    }

    #[test]
    fn fifo_fairness_k_th_arrival_in_k_th_group() {
        // p0 is the longest-waiting compatible candidate; the k-th arriving
        // participant (p3) must land in the k-th matched group with p0, not
        // with a later arrival.
        let arriving = candidate("p3", None);
        let group = Fifo.find_match(&arriving, &[candidate("p0", None)], 2).unwrap();
        assert_eq!(group, vec![SubjectId::from("p0"), SubjectId::from("p3")]);
    }

    #[test]
    fn latency_fifo_filters_incompatible_rtt() {
        let mm = LatencyFifo { max_server_rtt_sum_ms: 100 };
        let arriving = candidate("arriving", Some(60));
        let waiting = vec![candidate("far", Some(80)), candidate("near", Some(20))];
        let group = mm.find_match(&arriving, &waiting, 2).unwrap();
        assert_eq!(group, vec![SubjectId::from("near"), SubjectId::from("arriving")]);
    }

    #[test]
    fn latency_fifo_treats_missing_rtt_as_compatible() {
        let mm = LatencyFifo { max_server_rtt_sum_ms: 10 };
        let arriving = candidate("arriving", None);
        let waiting = vec![candidate("a", Some(1000))];
        let group = mm.find_match(&arriving, &waiting, 2).unwrap();
        assert_eq!(group, vec![SubjectId::from("a"), SubjectId::from("arriving")]);
    }

    #[test]
    fn group_reunion_prefers_previous_partner_over_fifo_head() {
        let mut history = GroupHistory::default();
        history.previous_partners.insert(SubjectId::from("b"));
        let arriving = MatchCandidate {
            subject_id: SubjectId::from("a"),
            rtt_to_server_ms: None,
            group_history: Some(history),
            custom_attributes: serde_json::Map::new(),
        };
        // c arrived before b, but b is the reunion partner.
        let waiting = vec![candidate("c", None), candidate("b", None)];
        let mm = GroupReunion { fallback_to_fifo: true };
        let group = mm.find_match(&arriving, &waiting, 2).unwrap();
        assert_eq!(group, vec![SubjectId::from("b"), SubjectId::from("a")]);
    }

    #[test]
    fn group_reunion_without_fallback_waits_if_no_partner_present() {
        let mut history = GroupHistory::default();
        history.previous_partners.insert(SubjectId::from("b"));
        let arriving = MatchCandidate {
            subject_id: SubjectId::from("a"),
            rtt_to_server_ms: None,
            group_history: Some(history),
            custom_attributes: serde_json::Map::new(),
        };
        let waiting = vec![candidate("c", None)];
        let mm = GroupReunion { fallback_to_fifo: false };
        assert_eq!(mm.find_match(&arriving, &waiting, 2), None);
    }

    #[test]
    fn matchmaker_purity_is_deterministic_for_same_snapshot() {
        let arriving = candidate("arriving", None);
        let waiting = vec![candidate("a", None), candidate("b", None)];
        assert_eq!(
            Fifo.find_match(&arriving, &waiting, 3),
            Fifo.find_match(&arriving, &waiting, 3)
        );
    }

    #[test]
    fn wait_room_preserves_insertion_order_across_removal() {
        let mut room = WaitRoom::new();
        room.push(candidate("a", None));
        room.push(candidate("b", None));
        room.push(candidate("c", None));
        room.remove(&[SubjectId::from("b")]);
        let remaining: Vec<SubjectId> = room.as_slice_vec().into_iter().map(|c| c.subject_id).collect();
        assert_eq!(remaining, vec![SubjectId::from("a"), SubjectId::from("c")]);
    }
}
