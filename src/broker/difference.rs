//! Pure computation of the changeset between desired and actual subscription
//! assignments.

use std::collections::{BTreeMap, HashSet};

use sha2::{Digest, Sha256};

use super::subscriber::{SubscriberKey, SubscriberState};
use super::subscription::{Changeset, SubscriptionChange, SubscriptionState};
use crate::identifier::Identifier;

/// Deterministically partitions a group's declared sources across its live
/// members: members are ordered by instance id and each source goes to the
/// member selected by a stable hash of the source's identifier.
///
/// Every member gets a row, possibly with no sources. Returns an empty set
/// when the group has no live members.
pub fn allocate_sources(
    members: &[SubscriberState],
    sources: &[Identifier],
) -> Vec<SubscriptionState> {
    if members.is_empty() {
        return Vec::new();
    }

    let mut members: Vec<&SubscriberState> = members.iter().collect();
    members.sort_by(|a, b| a.key.id.cmp(&b.key.id));

    let mut buckets: Vec<Vec<Identifier>> = vec![Vec::new(); members.len()];
    for source in sources {
        let slot = (stable_hash(source) % members.len() as u64) as usize;
        buckets[slot].push(source.clone());
    }

    members
        .into_iter()
        .zip(buckets)
        .map(|(member, event_sources)| SubscriptionState {
            key: member.key.clone(),
            node_id: member.node_id,
            event_sources,
        })
        .collect()
}

/// Computes the minimal set of changes turning `actual` into `desired`.
///
/// Unchanged rows (same node, same source set, order-insensitive) produce no
/// change, minimising churn. Rows absent from `desired` are removed; rows
/// absent from `actual` are added; rows whose source set differs are
/// replaced. A row whose node differs is removed and re-added, since a
/// replace only carries sources.
pub fn diff(desired: &[SubscriptionState], actual: &[SubscriptionState]) -> Changeset {
    let desired_by_key: BTreeMap<&SubscriberKey, &SubscriptionState> =
        desired.iter().map(|state| (&state.key, state)).collect();
    let actual_by_key: BTreeMap<&SubscriberKey, &SubscriptionState> =
        actual.iter().map(|state| (&state.key, state)).collect();

    let mut changes = Vec::new();

    for (key, have) in &actual_by_key {
        if !desired_by_key.contains_key(*key) {
            changes.push(SubscriptionChange::Remove((*have).key.clone()));
        }
    }

    for (key, want) in &desired_by_key {
        match actual_by_key.get(*key) {
            None => changes.push(SubscriptionChange::Add((*want).clone())),

            Some(have) if have.node_id != want.node_id => {
                changes.push(SubscriptionChange::Remove((*key).clone()));
                changes.push(SubscriptionChange::Add((*want).clone()));
            }

            Some(have) => {
                let have_sources: HashSet<&Identifier> = have.event_sources.iter().collect();
                let want_sources: HashSet<&Identifier> = want.event_sources.iter().collect();

                if have_sources != want_sources {
                    changes.push(SubscriptionChange::Replace(
                        (*key).clone(),
                        want.event_sources.clone(),
                    ));
                }
            }
        }
    }

    Changeset { changes }
}

fn stable_hash(identifier: &Identifier) -> u64 {
    let digest = Sha256::digest(identifier.to_string().as_bytes());

    let mut bytes = [0u8; 8];
    bytes.copy_from_slice(&digest[..8]);

    u64::from_be_bytes(bytes)
}

#[cfg(test)]
mod tests {
    use chrono::Utc;
    use uuid::Uuid;

    use super::*;
    use crate::broker::subscriber::SubscriberHealth;
    use crate::broker::subscription::{InMemorySubscriptionStateStore, SubscriptionStateStore};

    fn member(group: &str, id: &str, node_id: Uuid) -> SubscriberState {
        SubscriberState {
            key: SubscriberKey::new(group, id),
            node_id,
            last_seen_at: Utc::now(),
            health: SubscriberHealth::Healthy,
        }
    }

    fn sources(names: &[&str]) -> Vec<Identifier> {
        names.iter().map(|name| Identifier::category(*name)).collect()
    }

    #[test]
    fn allocation_covers_every_source_exactly_once() {
        let node_id = Uuid::new_v4();
        let members = vec![member("g", "s1", node_id), member("g", "s2", node_id)];
        let declared = sources(&["a", "b", "c", "d"]);

        let allocated = allocate_sources(&members, &declared);
        assert_eq!(2, allocated.len());

        let mut all: Vec<Identifier> = allocated
            .iter()
            .flat_map(|state| state.event_sources.clone())
            .collect();
        assert_eq!(declared.len(), all.len());

        all.sort_by_key(Identifier::to_string);
        let mut expected = declared.clone();
        expected.sort_by_key(Identifier::to_string);
        assert_eq!(expected, all);
    }

    #[test]
    fn allocation_is_deterministic() {
        let node_id = Uuid::new_v4();
        let members = vec![member("g", "s1", node_id), member("g", "s2", node_id)];
        let reversed: Vec<SubscriberState> = members.iter().rev().cloned().collect();
        let declared = sources(&["a", "b", "c", "d", "e"]);

        assert_eq!(
            allocate_sources(&members, &declared),
            allocate_sources(&reversed, &declared)
        );
    }

    #[test]
    fn a_single_member_receives_everything() {
        let members = vec![member("g", "s1", Uuid::new_v4())];
        let declared = sources(&["a", "b", "c", "d"]);

        let allocated = allocate_sources(&members, &declared);
        assert_eq!(1, allocated.len());
        assert_eq!(declared, allocated[0].event_sources);
    }

    #[test]
    fn no_members_means_no_assignments() {
        assert!(allocate_sources(&[], &sources(&["a"])).is_empty());
    }

    #[test]
    fn diff_of_identical_states_is_empty() {
        let node_id = Uuid::new_v4();
        let members = vec![member("g", "s1", node_id), member("g", "s2", node_id)];
        let desired = allocate_sources(&members, &sources(&["a", "b", "c"]));

        assert!(diff(&desired, &desired).is_empty());
    }

    #[test]
    fn diff_ignores_source_ordering() {
        let node_id = Uuid::new_v4();

        let want = vec![SubscriptionState {
            key: SubscriberKey::new("g", "s1"),
            node_id,
            event_sources: sources(&["a", "b"]),
        }];
        let have = vec![SubscriptionState {
            key: SubscriberKey::new("g", "s1"),
            node_id,
            event_sources: sources(&["b", "a"]),
        }];

        assert!(diff(&want, &have).is_empty());
    }

    #[test]
    fn diff_emits_minimal_changes() {
        let node_id = Uuid::new_v4();

        let desired = vec![
            SubscriptionState {
                key: SubscriberKey::new("g", "kept"),
                node_id,
                event_sources: sources(&["a"]),
            },
            SubscriptionState {
                key: SubscriberKey::new("g", "resized"),
                node_id,
                event_sources: sources(&["b", "c"]),
            },
            SubscriptionState {
                key: SubscriberKey::new("g", "new"),
                node_id,
                event_sources: sources(&["d"]),
            },
        ];
        let actual = vec![
            SubscriptionState {
                key: SubscriberKey::new("g", "kept"),
                node_id,
                event_sources: sources(&["a"]),
            },
            SubscriptionState {
                key: SubscriberKey::new("g", "resized"),
                node_id,
                event_sources: sources(&["b"]),
            },
            SubscriptionState {
                key: SubscriberKey::new("g", "gone"),
                node_id,
                event_sources: sources(&["e"]),
            },
        ];

        let changeset = diff(&desired, &actual);
        assert_eq!(3, changeset.len());
        assert!(changeset
            .changes
            .contains(&SubscriptionChange::Remove(SubscriberKey::new("g", "gone"))));
        assert!(changeset
            .changes
            .contains(&SubscriptionChange::Add(desired[2].clone())));
        assert!(changeset.changes.contains(&SubscriptionChange::Replace(
            SubscriberKey::new("g", "resized"),
            sources(&["b", "c"]),
        )));
    }

    #[tokio::test]
    async fn applying_the_diff_converges_on_the_desired_state() {
        let node_id = Uuid::new_v4();
        let store = InMemorySubscriptionStateStore::new();

        // Start from the two-member allocation.
        let members = vec![member("g", "s1", node_id), member("g", "s2", node_id)];
        let declared = sources(&["a", "b", "c", "d"]);
        let initial = allocate_sources(&members, &declared);

        store
            .apply(diff(&initial, &[]))
            .await
            .expect("apply should not fail");
        assert_eq!(initial, store.list().await.expect("list should not fail"));

        // One member disappears: survivors take over its sources.
        let survivors = vec![member("g", "s1", node_id)];
        let desired = allocate_sources(&survivors, &declared);

        let actual = store.list().await.expect("list should not fail");
        store
            .apply(diff(&desired, &actual))
            .await
            .expect("apply should not fail");

        assert_eq!(desired, store.list().await.expect("list should not fail"));
    }
}
