// SPDX-License-Identifier: MIT OR Apache-2.0

//! Auth chain closure and difference over lazily fetched events.
use std::collections::HashSet;

use futures_util::future::try_join_all;

use crate::event::EventId;
use crate::traits::{EventStore, StoreError};

/// Collect all events reachable from the seeds by following auth edges, including the seeds.
///
/// Events are fetched from the store as the traversal reaches them. The visited set guarantees
/// termination on cyclic graphs.
pub async fn auth_chain<S>(
    store: &S,
    seeds: impl IntoIterator<Item = EventId>,
) -> Result<HashSet<EventId>, StoreError>
where
    S: EventStore + ?Sized,
{
    let mut chain = HashSet::new();
    let mut stack: Vec<EventId> = seeds.into_iter().collect();

    while let Some(event_id) = stack.pop() {
        if chain.contains(&event_id) {
            continue;
        }

        let event = store.get_event(&event_id).await?;
        stack.extend(
            event
                .auth_events()
                .iter()
                .filter(|auth_id| !chain.contains(*auth_id))
                .cloned(),
        );
        chain.insert(event_id);
    }

    Ok(chain)
}

/// Events which are in the auth chain of some, but not all of the given sets.
///
/// The auth chains of all sets are computed concurrently. A single set (or none) has an empty
/// difference.
pub async fn auth_chain_difference<S>(
    store: &S,
    auth_sets: &[HashSet<EventId>],
) -> Result<HashSet<EventId>, StoreError>
where
    S: EventStore + ?Sized,
{
    let chains = try_join_all(
        auth_sets
            .iter()
            .map(|set| auth_chain(store, set.iter().cloned())),
    )
    .await?;

    let Some((first, rest)) = chains.split_first() else {
        return Ok(HashSet::new());
    };

    // Only events present in every single chain are excluded.
    let common: HashSet<&EventId> = first
        .iter()
        .filter(|event_id| rest.iter().all(|chain| chain.contains(*event_id)))
        .collect();

    Ok(chains
        .iter()
        .flatten()
        .filter(|event_id| !common.contains(event_id))
        .cloned()
        .collect())
}
