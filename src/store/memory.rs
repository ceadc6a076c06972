//! In-memory implementation of the storage adapter, backed by thread-safe
//! maps. Intended for tests and single-process deployments.

use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;

use async_trait::async_trait;
use futures::stream::{iter, StreamExt};
use parking_lot::Mutex;
use tokio::sync::Mutex as AsyncMutex;
use uuid::Uuid;

use crate::condition::WriteCondition;
use crate::constraint::QueryConstraint;
use crate::event::{NewEvent, StoredEvent};
use crate::identifier::{Identifier, StreamId};
use crate::store::{
    EventStorageAdapter, EventStream, SaveError, ScanError, SerializationGuarantee,
};

#[derive(Debug)]
struct LogBackend {
    next_sequence_number: u64,
    events: BTreeMap<u64, StoredEvent>,
    streams: HashMap<StreamId, Vec<u64>>,
}

impl Default for LogBackend {
    fn default() -> Self {
        Self {
            // Sequence numbers start at 1, matching the persistent backend's
            // BIGSERIAL column.
            next_sequence_number: 1,
            events: BTreeMap::default(),
            streams: HashMap::default(),
        }
    }
}

/// In-memory [`EventStorageAdapter`].
///
/// Writes to streams sharing a serialization scope (derived from the
/// adapter's [`SerializationGuarantee`]) are serialized on a per-scope lock
/// held for the whole save. Sequence-number reservation and commit visibility
/// are separate steps, so under the weaker guarantees a log-level reader can
/// observe the same holes a concurrent-writer persistent backend produces.
#[derive(Debug, Clone, Default)]
pub struct InMemoryEventStorageAdapter {
    guarantee: SerializationGuarantee,
    backend: Arc<Mutex<LogBackend>>,
    write_scopes: Arc<Mutex<HashMap<String, Arc<AsyncMutex<()>>>>>,
}

impl InMemoryEventStorageAdapter {
    /// Creates an adapter with the given serialization guarantee.
    pub fn new(guarantee: SerializationGuarantee) -> Self {
        Self {
            guarantee,
            ..Self::default()
        }
    }

    fn write_scope(&self, target: &StreamId) -> Arc<AsyncMutex<()>> {
        let scope = self.guarantee.scope(target);

        self.write_scopes
            .lock()
            .entry(scope)
            .or_insert_with(|| Arc::new(AsyncMutex::new(())))
            .clone()
    }
}

#[async_trait]
impl EventStorageAdapter for InMemoryEventStorageAdapter {
    async fn save(
        &self,
        target: &StreamId,
        events: Vec<NewEvent>,
        condition: WriteCondition,
    ) -> Result<Vec<StoredEvent>, SaveError> {
        let scope = self.write_scope(target);
        let _serialized = scope.lock().await;

        let (start_sequence_number, start_position) = {
            let mut backend = self.backend.lock();

            let last_event = backend
                .streams
                .get(target)
                .and_then(|sequence_numbers| sequence_numbers.last())
                .and_then(|sequence_number| backend.events.get(sequence_number))
                .cloned();

            condition.assert_met_by(last_event.as_ref())?;

            let start_position = last_event.map_or(0, |event| event.position + 1);
            let start_sequence_number = backend.next_sequence_number;
            backend.next_sequence_number += events.len() as u64;

            (start_sequence_number, start_position)
        };

        // Reservation and publication are separate steps, like the
        // nextval-then-commit round-trip of the persistent backend. Writers
        // in other scopes may publish later-reserved numbers first.
        tokio::task::yield_now().await;

        let stored: Vec<StoredEvent> = events
            .into_iter()
            .enumerate()
            .map(|(i, event)| StoredEvent {
                id: Uuid::new_v4(),
                name: event.name,
                category: target.category.clone(),
                stream: target.stream.clone(),
                position: start_position + i as u64,
                sequence_number: start_sequence_number + i as u64,
                payload: event.payload,
                observed_at: event.observed_at,
                occurred_at: event.occurred_at,
            })
            .collect();

        {
            let mut guard = self.backend.lock();
            let backend = &mut *guard;
            let stream_index = backend.streams.entry(target.clone()).or_default();

            for event in &stored {
                stream_index.push(event.sequence_number);
                backend.events.insert(event.sequence_number, event.clone());
            }
        }

        Ok(stored)
    }

    fn scan<'a>(
        &'a self,
        target: &Identifier,
        constraints: &[Arc<dyn QueryConstraint>],
    ) -> EventStream<'a> {
        let backend = self.backend.lock();

        let snapshot: Vec<StoredEvent> = backend
            .events
            .values()
            .filter(|event| target.includes(event))
            .filter(|event| constraints.iter().all(|constraint| constraint.met_by(event)))
            .cloned()
            .collect();

        drop(backend);

        iter(snapshot.into_iter().map(Ok)).boxed()
    }

    async fn latest(&self, target: &Identifier) -> Result<Option<StoredEvent>, ScanError> {
        let backend = self.backend.lock();

        Ok(backend
            .events
            .values()
            .rev()
            .find(|event| target.includes(event))
            .cloned())
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicBool, Ordering};

    use futures::TryStreamExt;
    use tokio_test::task;
    use tokio_test::{assert_pending, assert_ready};

    use super::*;
    use crate::condition::{position_is, stream_is_empty};
    use crate::constraint::sequence_number_after;
    use crate::testing::{random_category_name, random_stream_name, NewEventBuilder};

    fn random_stream_id() -> StreamId {
        StreamId::new(random_category_name(), random_stream_name())
    }

    async fn scan_all(adapter: &InMemoryEventStorageAdapter, target: &Identifier) -> Vec<StoredEvent> {
        adapter
            .scan(target, &[])
            .try_collect()
            .await
            .expect("scan should not fail")
    }

    #[tokio::test]
    async fn assigns_contiguous_positions_from_zero() {
        let adapter = InMemoryEventStorageAdapter::default();
        let target = random_stream_id();

        let stored = adapter
            .save(
                &target,
                vec![NewEventBuilder::new().build(), NewEventBuilder::new().build()],
                WriteCondition::default(),
            )
            .await
            .expect("save should not fail");

        assert_eq!(vec![0, 1], stored.iter().map(|e| e.position).collect::<Vec<_>>());

        let latest = adapter
            .latest(&Identifier::from(target))
            .await
            .expect("latest should not fail")
            .expect("the stream is not empty");
        assert_eq!(1, latest.position);
    }

    #[tokio::test]
    async fn returns_stored_events_in_input_order() {
        let adapter = InMemoryEventStorageAdapter::default();
        let target = random_stream_id();

        let first = NewEventBuilder::new().with_name("first").build();
        let second = NewEventBuilder::new().with_name("second").build();

        let stored = adapter
            .save(&target, vec![first, second], WriteCondition::default())
            .await
            .expect("save should not fail");

        assert_eq!(
            vec!["first", "second"],
            stored.iter().map(|e| e.name.as_str()).collect::<Vec<_>>()
        );
    }

    #[tokio::test]
    async fn sequential_saves_continue_the_stream() {
        let adapter = InMemoryEventStorageAdapter::default();
        let target = random_stream_id();

        adapter
            .save(
                &target,
                vec![NewEventBuilder::new().build()],
                WriteCondition::default(),
            )
            .await
            .expect("first save should not fail");

        let stored = adapter
            .save(
                &target,
                vec![NewEventBuilder::new().build()],
                WriteCondition::default(),
            )
            .await
            .expect("second save should not fail");

        assert_eq!(1, stored[0].position);

        let events = scan_all(&adapter, &Identifier::from(target)).await;
        assert_eq!(vec![0, 1], events.iter().map(|e| e.position).collect::<Vec<_>>());
    }

    #[tokio::test]
    async fn empty_stream_condition_passes_on_empty_stream() {
        let adapter = InMemoryEventStorageAdapter::default();
        let target = random_stream_id();

        let stored = adapter
            .save(&target, vec![NewEventBuilder::new().build()], stream_is_empty())
            .await
            .expect("the stream is empty, the condition is met");

        assert_eq!(1, stored.len());
    }

    #[tokio::test]
    async fn empty_stream_condition_ignores_other_streams_in_the_category() {
        let adapter = InMemoryEventStorageAdapter::default();
        let category = random_category_name();

        adapter
            .save(
                &StreamId::new(category.clone(), random_stream_name()),
                vec![NewEventBuilder::new().build()],
                WriteCondition::default(),
            )
            .await
            .expect("save should not fail");

        adapter
            .save(
                &StreamId::new(category, random_stream_name()),
                vec![NewEventBuilder::new().build()],
                stream_is_empty(),
            )
            .await
            .expect("only the target stream must be empty");
    }

    #[tokio::test]
    async fn empty_stream_condition_fails_on_non_empty_stream() {
        let adapter = InMemoryEventStorageAdapter::default();
        let target = random_stream_id();

        adapter
            .save(
                &target,
                vec![NewEventBuilder::new().build()],
                WriteCondition::default(),
            )
            .await
            .expect("save should not fail");

        let error = adapter
            .save(&target, vec![NewEventBuilder::new().build()], stream_is_empty())
            .await
            .expect_err("the stream is not empty");

        assert!(matches!(error, SaveError::UnmetWriteCondition(_)));
    }

    #[tokio::test]
    async fn position_condition_passes_on_matching_tail() {
        let adapter = InMemoryEventStorageAdapter::default();
        let target = random_stream_id();

        adapter
            .save(
                &target,
                vec![NewEventBuilder::new().build(), NewEventBuilder::new().build()],
                WriteCondition::default(),
            )
            .await
            .expect("save should not fail");

        adapter
            .save(&target, vec![NewEventBuilder::new().build()], position_is(1))
            .await
            .expect("the tail is at position 1");
    }

    #[tokio::test]
    async fn position_condition_fails_on_mismatched_or_empty_stream() {
        let adapter = InMemoryEventStorageAdapter::default();
        let target = random_stream_id();

        let error = adapter
            .save(&target, vec![NewEventBuilder::new().build()], position_is(0))
            .await
            .expect_err("the stream is empty");
        assert!(matches!(error, SaveError::UnmetWriteCondition(_)));

        adapter
            .save(
                &target,
                vec![NewEventBuilder::new().build(), NewEventBuilder::new().build()],
                WriteCondition::default(),
            )
            .await
            .expect("save should not fail");

        for position in [0, 2] {
            let error = adapter
                .save(
                    &target,
                    vec![NewEventBuilder::new().build()],
                    position_is(position),
                )
                .await
                .expect_err("the tail is at position 1");
            assert!(matches!(error, SaveError::UnmetWriteCondition(_)));
        }
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn concurrent_checked_writes_to_an_empty_stream_write_once() {
        let adapter = Arc::new(InMemoryEventStorageAdapter::default());
        let target = random_stream_id();

        let mut handles = Vec::new();
        for _ in 0..10 {
            let adapter = adapter.clone();
            let target = target.clone();

            handles.push(tokio::spawn(async move {
                adapter
                    .save(
                        &target,
                        vec![NewEventBuilder::new().build(), NewEventBuilder::new().build()],
                        stream_is_empty(),
                    )
                    .await
            }));
        }

        let mut wins = 0;
        let mut losses = 0;
        let mut winner_len = 0;
        for handle in handles {
            match handle.await.expect("task should not panic") {
                Ok(stored) => {
                    wins += 1;
                    winner_len = stored.len();
                }
                Err(SaveError::UnmetWriteCondition(_)) => losses += 1,
                Err(other) => panic!("unexpected error: {other}"),
            }
        }

        assert_eq!(1, wins);
        assert_eq!(9, losses);

        let events = scan_all(&adapter, &Identifier::from(target)).await;
        assert_eq!(winner_len, events.len());
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn concurrent_unchecked_writes_do_not_interleave_within_a_stream() {
        let adapter = Arc::new(InMemoryEventStorageAdapter::default());
        let target = random_stream_id();

        let mut handles = Vec::new();
        for _ in 0..4 {
            let adapter = adapter.clone();
            let target = target.clone();

            handles.push(tokio::spawn(async move {
                adapter
                    .save(
                        &target,
                        vec![NewEventBuilder::new().build(), NewEventBuilder::new().build()],
                        WriteCondition::default(),
                    )
                    .await
                    .expect("unchecked saves should not fail")
            }));
        }

        for handle in handles {
            let stored = handle.await.expect("task should not panic");
            // Each call's events are contiguous in the stream.
            assert_eq!(stored[0].position + 1, stored[1].position);
        }

        let events = scan_all(&adapter, &Identifier::from(target)).await;
        let positions: Vec<u64> = events.iter().map(|e| e.position).collect();
        assert_eq!((0..8).collect::<Vec<u64>>(), positions);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn log_readers_observe_a_contiguous_prefix_under_log_guarantee() {
        let adapter = Arc::new(InMemoryEventStorageAdapter::new(SerializationGuarantee::Log));
        let done = Arc::new(AtomicBool::new(false));

        let mut writers = Vec::new();
        for _ in 0..2 {
            let adapter = adapter.clone();
            let target = random_stream_id();

            writers.push(tokio::spawn(async move {
                let mut written = Vec::new();
                for _ in 0..10 {
                    let stored = adapter
                        .save(
                            &target,
                            vec![NewEventBuilder::new().build()],
                            WriteCondition::default(),
                        )
                        .await
                        .expect("save should not fail");
                    written.extend(stored.into_iter().map(|e| e.sequence_number));
                }
                written
            }));
        }

        let reader = {
            let adapter = adapter.clone();
            let done = done.clone();

            tokio::spawn(async move {
                while !done.load(Ordering::Acquire) {
                    let snapshot: Vec<u64> = adapter
                        .scan(&Identifier::log(), &[])
                        .try_collect::<Vec<_>>()
                        .await
                        .expect("scan should not fail")
                        .into_iter()
                        .map(|e| e.sequence_number)
                        .collect();

                    // Every observation is a contiguous strictly-increasing
                    // prefix, with no hole that later fills.
                    let expected: Vec<u64> = (1..=snapshot.len() as u64).collect();
                    assert_eq!(expected, snapshot);

                    tokio::task::yield_now().await;
                }
            })
        };

        let mut written = Vec::new();
        for writer in writers {
            written.extend(writer.await.expect("writer should not panic"));
        }
        done.store(true, Ordering::Release);
        reader.await.expect("reader should not panic");

        written.sort_unstable();
        let observed: Vec<u64> = scan_all(&adapter, &Identifier::log())
            .await
            .into_iter()
            .map(|e| e.sequence_number)
            .collect();
        assert_eq!(written, observed);
    }

    #[tokio::test]
    async fn category_guarantee_admits_log_order_holes_across_categories() {
        let adapter =
            InMemoryEventStorageAdapter::new(SerializationGuarantee::Category);
        let first = StreamId::new("category-one", random_stream_name());
        let second = StreamId::new("category-two", random_stream_name());

        // Drive the first save up to its commit round-trip and leave it there:
        // its sequence number is reserved but not yet visible.
        let stalled_save = adapter.save(
            &first,
            vec![NewEventBuilder::new().build()],
            WriteCondition::default(),
        );
        let mut stalled = task::spawn(stalled_save);
        assert_pending!(stalled.poll());

        let committed = adapter
            .save(
                &second,
                vec![NewEventBuilder::new().build()],
                WriteCondition::default(),
            )
            .await
            .expect("save should not fail");

        // A log reader sees the later-reserved number with a hole before it.
        let observed: Vec<u64> = scan_all(&adapter, &Identifier::log())
            .await
            .into_iter()
            .map(|e| e.sequence_number)
            .collect();
        assert_eq!(vec![committed[0].sequence_number], observed);
        assert_eq!(2, committed[0].sequence_number);

        // A reader resuming past what it has seen will skip the hole forever.
        let resumed: Vec<StoredEvent> = adapter
            .scan(&Identifier::log(), &[sequence_number_after(2)])
            .try_collect()
            .await
            .expect("scan should not fail");
        assert!(resumed.is_empty());

        // Per-category readers are unaffected once their writer commits.
        assert_ready!(stalled.poll()).expect("the stalled save should complete");

        let category_one: Vec<u64> = adapter
            .scan(&Identifier::category("category-one"), &[])
            .try_collect::<Vec<_>>()
            .await
            .expect("scan should not fail")
            .into_iter()
            .map(|e| e.sequence_number)
            .collect();
        assert_eq!(vec![1], category_one);

        let log: Vec<u64> = scan_all(&adapter, &Identifier::log())
            .await
            .into_iter()
            .map(|e| e.sequence_number)
            .collect();
        assert_eq!(vec![1, 2], log);
    }

    #[tokio::test]
    async fn log_guarantee_serializes_commit_visibility_across_categories() {
        let adapter = InMemoryEventStorageAdapter::new(SerializationGuarantee::Log);
        let first = StreamId::new("category-one", random_stream_name());
        let second = StreamId::new("category-two", random_stream_name());

        let first_save = adapter.save(
            &first,
            vec![NewEventBuilder::new().build()],
            WriteCondition::default(),
        );
        let mut stalled = task::spawn(first_save);
        assert_pending!(stalled.poll());

        // The second writer blocks on the log-wide scope: it cannot reserve
        // a number, let alone commit one, ahead of the stalled writer.
        let second_save = adapter.save(
            &second,
            vec![NewEventBuilder::new().build()],
            WriteCondition::default(),
        );
        let mut blocked = task::spawn(second_save);
        assert_pending!(blocked.poll());

        assert!(scan_all(&adapter, &Identifier::log()).await.is_empty());

        let first_stored = assert_ready!(stalled.poll()).expect("save should complete");
        assert_eq!(1, first_stored[0].sequence_number);

        let observed: Vec<u64> = scan_all(&adapter, &Identifier::log())
            .await
            .into_iter()
            .map(|e| e.sequence_number)
            .collect();
        assert_eq!(vec![1], observed);

        assert!(blocked.is_woken());
        assert_pending!(blocked.poll());
        let second_stored = assert_ready!(blocked.poll()).expect("save should complete");
        assert_eq!(2, second_stored[0].sequence_number);
    }

    #[tokio::test]
    async fn scan_resumes_after_a_sequence_number() {
        let adapter = InMemoryEventStorageAdapter::default();
        let first = StreamId::new("category-one", random_stream_name());
        let second = StreamId::new("category-two", random_stream_name());

        let mut batches = Vec::new();
        for target in [&first, &second, &first, &second] {
            batches.push(
                adapter
                    .save(
                        target,
                        vec![NewEventBuilder::new().build(), NewEventBuilder::new().build()],
                        WriteCondition::default(),
                    )
                    .await
                    .expect("save should not fail"),
            );
        }

        let resume_from = batches[1].last().expect("batch is not empty").sequence_number;

        let resumed: Vec<StoredEvent> = adapter
            .scan(&Identifier::log(), &[sequence_number_after(resume_from)])
            .try_collect()
            .await
            .expect("scan should not fail");

        let expected: Vec<StoredEvent> = batches[2..].iter().flatten().cloned().collect();
        assert_eq!(expected, resumed);
    }

    #[tokio::test]
    async fn scan_orders_by_sequence_number_across_streams_and_categories() {
        let adapter = InMemoryEventStorageAdapter::default();
        let category = random_category_name();
        let first = StreamId::new(category.clone(), random_stream_name());
        let second = StreamId::new(category.clone(), random_stream_name());
        let other = random_stream_id();

        for target in [&first, &other, &second, &first] {
            adapter
                .save(
                    target,
                    vec![NewEventBuilder::new().build()],
                    WriteCondition::default(),
                )
                .await
                .expect("save should not fail");
        }

        let log = scan_all(&adapter, &Identifier::log()).await;
        let sequence_numbers: Vec<u64> = log.iter().map(|e| e.sequence_number).collect();
        assert_eq!(vec![1, 2, 3, 4], sequence_numbers);

        let in_category = scan_all(&adapter, &Identifier::category(category)).await;
        let sequence_numbers: Vec<u64> = in_category.iter().map(|e| e.sequence_number).collect();
        assert_eq!(vec![1, 3, 4], sequence_numbers);

        let in_stream = scan_all(&adapter, &Identifier::from(first)).await;
        let sequence_numbers: Vec<u64> = in_stream.iter().map(|e| e.sequence_number).collect();
        assert_eq!(vec![1, 4], sequence_numbers);
    }

    #[tokio::test]
    async fn latest_matches_the_last_scanned_event() {
        let adapter = InMemoryEventStorageAdapter::default();
        let target = random_stream_id();

        assert!(adapter
            .latest(&Identifier::log())
            .await
            .expect("latest should not fail")
            .is_none());

        adapter
            .save(
                &target,
                vec![NewEventBuilder::new().build(), NewEventBuilder::new().build()],
                WriteCondition::default(),
            )
            .await
            .expect("save should not fail");

        for identifier in [
            Identifier::log(),
            Identifier::category(target.category.clone()),
            Identifier::from(target.clone()),
        ] {
            let latest = adapter
                .latest(&identifier)
                .await
                .expect("latest should not fail");
            let last = scan_all(&adapter, &identifier).await.pop();
            assert_eq!(last, latest);
        }

        assert!(adapter
            .latest(&Identifier::category(random_category_name()))
            .await
            .expect("latest should not fail")
            .is_none());
    }
}
