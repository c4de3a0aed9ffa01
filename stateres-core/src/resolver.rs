// SPDX-License-Identifier: MIT OR Apache-2.0

//! Iterative auth-based state resolution.
use std::cmp::Reverse;
use std::collections::{BinaryHeap, HashMap, HashSet};

use async_trait::async_trait;
use tracing::{debug, trace};

use crate::auth::auth_types_for_event;
use crate::event::{Event, EventId};
use crate::room_version::RoomVersion;
use crate::state_key::{StateKey, StateMap};
use crate::traits::{AuthChecker, AuthError, EventStore, ResolveError, Resolver};

/// Resolves conflicts by replaying the conflicted events in auth order and keeping every state
/// event which passes authorization against the state resolved so far.
#[derive(Clone, Debug, Default)]
pub struct IterativeResolver<A> {
    auth_checker: A,
}

impl<A> IterativeResolver<A>
where
    A: AuthChecker,
{
    pub fn new(auth_checker: A) -> Self {
        Self { auth_checker }
    }

    /// State to authorize `event` against: its own auth events, overridden by the resolved state.
    async fn auth_state(
        &self,
        event: &Event,
        resolved: &StateMap<EventId>,
        store: &dyn EventStore,
    ) -> Result<Vec<Event>, ResolveError> {
        let mut state: HashMap<StateKey, Event> = store
            .get_events(event.auth_events())
            .await?
            .into_values()
            .filter_map(|auth_event| auth_event.key().map(|key| (key, auth_event)))
            .collect();

        for key in auth_types_for_event(event) {
            let Some(event_id) = resolved.get(&key) else {
                continue;
            };
            if state
                .get(&key)
                .is_some_and(|current| current.id() == event_id)
            {
                continue;
            }
            let resolved_event = store.get_event(event_id).await?;
            state.insert(key, resolved_event);
        }

        Ok(state.into_values().collect())
    }
}

#[async_trait]
impl<A> Resolver for IterativeResolver<A>
where
    A: AuthChecker,
{
    async fn resolve(
        &self,
        room_id: &str,
        room_version: RoomVersion,
        state_sets: &[StateMap<EventId>],
        store: &dyn EventStore,
    ) -> Result<StateMap<EventId>, ResolveError> {
        let (unconflicted, conflicted) = separate(state_sets);
        if conflicted.is_empty() {
            return Ok(unconflicted);
        }

        debug!(
            %room_id,
            %room_version,
            conflicted = conflicted.len(),
            "resolving conflicted state"
        );

        let auth_sets: Vec<HashSet<EventId>> = state_sets
            .iter()
            .map(|state_set| state_set.values().cloned().collect())
            .collect();
        let mut full_conflicted: HashSet<EventId> =
            store.get_auth_chain_difference(room_id, &auth_sets).await?;
        full_conflicted.extend(conflicted.into_values().flatten());

        let event_ids: Vec<EventId> = full_conflicted.into_iter().collect();
        let events = store.get_events(&event_ids).await?;

        let mut resolved = unconflicted.clone();
        for event_id in auth_order(&events) {
            let Some(event) = events.get(&event_id) else {
                continue;
            };
            let Some(key) = event.key() else {
                continue;
            };

            let auth_state = self.auth_state(event, &resolved, store).await?;
            match self.auth_checker.check_dependent(event, &auth_state) {
                Ok(()) => {
                    trace!(%event_id, %key, "accepted");
                    resolved.insert(key, event_id);
                }
                Err(AuthError::Store(err)) => return Err(err.into()),
                Err(err) => {
                    trace!(%event_id, %key, %err, "rejected");
                }
            }
        }

        resolved.extend(unconflicted);
        Ok(resolved)
    }
}

/// Split the state sets into keys all sets agree on and keys with competing event ids.
fn separate(state_sets: &[StateMap<EventId>]) -> (StateMap<EventId>, StateMap<HashSet<EventId>>) {
    let mut candidates: StateMap<HashSet<EventId>> = HashMap::new();
    let mut occurrences: HashMap<StateKey, usize> = HashMap::new();
    for state_set in state_sets {
        for (key, event_id) in state_set {
            candidates
                .entry(key.clone())
                .or_default()
                .insert(event_id.clone());
            *occurrences.entry(key.clone()).or_default() += 1;
        }
    }

    let mut unconflicted = HashMap::new();
    let mut conflicted = HashMap::new();
    for (key, event_ids) in candidates {
        let in_every_set = occurrences.get(&key) == Some(&state_sets.len());
        if in_every_set && event_ids.len() == 1 {
            if let Some(event_id) = event_ids.into_iter().next() {
                unconflicted.insert(key, event_id);
            }
        } else {
            conflicted.insert(key, event_ids);
        }
    }

    (unconflicted, conflicted)
}

/// Topological order along auth edges inside the given events, parents first.
///
/// Ties are broken by depth, timestamp and event id. Events caught in a cycle are appended in
/// the same tie-break order.
fn auth_order(events: &HashMap<EventId, Event>) -> Vec<EventId> {
    let sort_key = |event: &Event| Reverse(tie_break(event));

    let mut pending: HashMap<&EventId, usize> = HashMap::with_capacity(events.len());
    let mut children: HashMap<&EventId, Vec<&Event>> = HashMap::new();
    for event in events.values() {
        let mut parents = 0;
        for auth_id in event.auth_events() {
            if let Some((parent_id, _)) = events.get_key_value(auth_id) {
                parents += 1;
                children.entry(parent_id).or_default().push(event);
            }
        }
        pending.insert(event.id(), parents);
    }

    let mut ready: BinaryHeap<_> = events
        .values()
        .filter(|event| pending.get(event.id()) == Some(&0))
        .map(sort_key)
        .collect();

    let mut ordered = Vec::with_capacity(events.len());
    while let Some(Reverse((_, _, event_id))) = ready.pop() {
        if let Some(dependents) = children.get(&event_id) {
            for child in dependents {
                if let Some(count) = pending.get_mut(child.id()) {
                    *count -= 1;
                    if *count == 0 {
                        ready.push(sort_key(*child));
                    }
                }
            }
        }
        ordered.push(event_id);
    }

    if ordered.len() < events.len() {
        let placed: HashSet<&EventId> = ordered.iter().collect();
        let mut cyclic: Vec<&Event> = events
            .values()
            .filter(|event| !placed.contains(event.id()))
            .collect();
        cyclic.sort_by_key(|event| tie_break(event));
        let cyclic: Vec<EventId> = cyclic.into_iter().map(|event| event.id().clone()).collect();
        ordered.extend(cyclic);
    }

    ordered
}

fn tie_break(event: &Event) -> (u64, u64, EventId) {
    (event.depth(), event.origin_server_ts(), event.id().clone())
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap;

    use assert_matches::assert_matches;
    use serde_json::json;

    use crate::auth::RuleAuthChecker;
    use crate::event::EventId;
    use crate::room_version::RoomVersion;
    use crate::state_key::{StateKey, StateMap};
    use crate::test_utils::{EventBuilder, TEST_ROOM_ID, TestRoom, graph_store};
    use crate::traits::{ResolveError, Resolver, StoreError};

    use super::{IterativeResolver, auth_order, separate};

    const BASE: [&str; 5] = ["$create", "$alice_join", "$power", "$join_rules", "$bob_join"];

    fn state_set(room: &TestRoom, ids: &[&str]) -> StateMap<EventId> {
        ids.iter()
            .map(|id| {
                let event = room.event(id);
                (event.key().expect("state event"), event.id().clone())
            })
            .collect()
    }

    fn with_extra(room: &TestRoom, extra: &str) -> StateMap<EventId> {
        let mut ids = BASE.to_vec();
        ids.push(extra);
        state_set(room, &ids)
    }

    fn resolver() -> IterativeResolver<RuleAuthChecker> {
        IterativeResolver::new(RuleAuthChecker::new())
    }

    fn topic(sender: &str, depth: u64) -> EventBuilder {
        EventBuilder::new("m.room.topic", sender)
            .state_key("")
            .auth_events(&["$create", "$power", "$alice_join"])
            .depth(depth)
    }

    #[test]
    fn separate_conflicts() {
        let a = StateKey::new("m.room.topic", "");
        let b = StateKey::new("m.room.name", "");
        let c = StateKey::new("m.room.avatar", "");
        let first = HashMap::from([
            (a.clone(), EventId::from("$a")),
            (b.clone(), EventId::from("$b1")),
            (c.clone(), EventId::from("$c")),
        ]);
        let second = HashMap::from([
            (a.clone(), EventId::from("$a")),
            (b.clone(), EventId::from("$b2")),
        ]);

        let (unconflicted, conflicted) = separate(&[first, second]);
        assert_eq!(unconflicted, HashMap::from([(a, EventId::from("$a"))]));
        assert_eq!(conflicted.len(), 2);
        assert_eq!(conflicted[&b].len(), 2);
        // Keys missing from some sets are conflicted too.
        assert_eq!(conflicted[&c].len(), 1);
    }

    #[test]
    fn auth_order_follows_edges_then_depth() {
        let store = graph_store(&[
            ("$create", &[]),
            ("$b", &["$create"]),
            ("$a", &["$create"]),
            ("$c", &["$a", "$b"]),
        ]);
        let events = ["$create", "$a", "$b", "$c"]
            .into_iter()
            .map(|id| {
                let id = EventId::from(id);
                let event = futures_util::FutureExt::now_or_never(
                    crate::traits::EventStore::get_event(&store, &id),
                )
                .expect("ready")
                .expect("exists");
                (id, event)
            })
            .collect();

        // Equal depth and timestamp, ties broken by id.
        let ordered = auth_order(&events);
        let ordered: Vec<&str> = ordered.iter().map(EventId::as_str).collect();
        assert_eq!(ordered, ["$create", "$a", "$b", "$c"]);
    }

    #[tokio::test]
    async fn unconflicted_state_is_returned_without_fetching() {
        let room = TestRoom::new();
        let store = room.store();
        let set = state_set(&room, &BASE);

        let resolved = resolver()
            .resolve(
                TEST_ROOM_ID,
                RoomVersion::V10,
                &[set.clone(), set.clone()],
                &store,
            )
            .await
            .unwrap();
        assert_eq!(resolved, set);
        assert_eq!(store.fetch_count(), 0);

        let resolved = resolver()
            .resolve(TEST_ROOM_ID, RoomVersion::V10, &[], &store)
            .await
            .unwrap();
        assert!(resolved.is_empty());
    }

    #[tokio::test]
    async fn unauthorized_events_lose() {
        let room = TestRoom::new()
            .with("$alice_topic", topic(TestRoom::ALICE, 6))
            .with(
                "$bob_topic",
                EventBuilder::new("m.room.topic", TestRoom::BOB)
                    .state_key("")
                    .auth_events(&["$create", "$power", "$bob_join"])
                    .depth(7),
            );
        let store = room.store();

        let resolved = resolver()
            .resolve(
                TEST_ROOM_ID,
                RoomVersion::V10,
                &[
                    with_extra(&room, "$alice_topic"),
                    with_extra(&room, "$bob_topic"),
                ],
                &store,
            )
            .await
            .unwrap();

        assert_eq!(
            resolved.get(&StateKey::new("m.room.topic", "")),
            Some(&EventId::from("$alice_topic"))
        );
        assert_eq!(resolved.len(), BASE.len() + 1);
    }

    #[tokio::test]
    async fn later_authorized_events_win() {
        let room = TestRoom::new()
            .with("$first", topic(TestRoom::ALICE, 6))
            .with("$second", topic(TestRoom::ALICE, 7));
        let store = room.store();

        let resolved = resolver()
            .resolve(
                TEST_ROOM_ID,
                RoomVersion::V10,
                &[with_extra(&room, "$second"), with_extra(&room, "$first")],
                &store,
            )
            .await
            .unwrap();

        assert_eq!(
            resolved.get(&StateKey::new("m.room.topic", "")),
            Some(&EventId::from("$second"))
        );
    }

    #[tokio::test]
    async fn ban_replaces_join() {
        let room = TestRoom::new().with(
            "$bob_ban",
            EventBuilder::new("m.room.member", TestRoom::ALICE)
                .state_key(TestRoom::BOB)
                .content(json!({ "membership": "ban" }))
                .auth_events(&["$create", "$power", "$alice_join", "$bob_join"])
                .depth(6),
        );
        let store = room.store();

        let banned = state_set(
            &room,
            &["$create", "$alice_join", "$power", "$join_rules", "$bob_ban"],
        );
        let resolved = resolver()
            .resolve(
                TEST_ROOM_ID,
                RoomVersion::V10,
                &[state_set(&room, &BASE), banned.clone()],
                &store,
            )
            .await
            .unwrap();

        assert_eq!(resolved, banned);
    }

    #[tokio::test]
    async fn store_failures_abort_resolution() {
        let room = TestRoom::new();
        let store = room.store();

        let mut broken = state_set(&room, &BASE);
        broken.insert(StateKey::new("m.room.topic", ""), EventId::from("$ghost"));

        let result = resolver()
            .resolve(
                TEST_ROOM_ID,
                RoomVersion::V10,
                &[state_set(&room, &BASE), broken],
                &store,
            )
            .await;
        assert_matches!(
            result,
            Err(ResolveError::Store(StoreError::NotFound(event_id)))
                if event_id.as_str() == "$ghost"
        );
    }
}
