//! In-memory implementation of the aggregate store, for tests.
//!
//! Mirrors the DynamoDB semantics exactly: records are full attribute maps
//! built through the codec, partitions iterate in ascending sort-key order,
//! and a commit either applies every record or none. The STATE record is
//! guarded by the same sequence condition, so optimistic-concurrency tests
//! run without a database.

use std::collections::BTreeMap;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tokio::sync::RwLock;

use super::{
    build_record, inbound_sort_key, outbound_sort_key, partition_key, record_sequence,
    state_history_sort_key, utc_now, InboundEventReader, Item, OutboundEventReader, PartitionFold,
    QueryResult, Result, StateHistoryReader, Store, StoreError, STATE_SORT_KEY,
};
use crate::codec;
use crate::processor::{InboundEvent, OutboundEvent, State};

/// Partitions keyed by `_pk`; within a partition, records keyed by `_sk`.
/// `BTreeMap` iteration gives the same ascending sort-key order DynamoDB
/// returns within a partition.
type Partitions = BTreeMap<String, BTreeMap<String, Item>>;

/// In-memory aggregate store.
///
/// Cloning shares the underlying storage, so two processors built over
/// clones race against the same records.
#[derive(Debug, Clone)]
pub struct MemoryStore {
    namespace: String,
    partitions: Arc<RwLock<Partitions>>,
    fail_puts: Arc<RwLock<bool>>,
    persist_state_history: bool,
    now: fn() -> DateTime<Utc>,
}

impl MemoryStore {
    pub fn new(namespace: impl Into<String>) -> Self {
        Self {
            namespace: namespace.into(),
            partitions: Arc::new(RwLock::new(BTreeMap::new())),
            fail_puts: Arc::new(RwLock::new(false)),
            persist_state_history: false,
            now: utc_now,
        }
    }

    /// Persist a `STATE/{seq}` snapshot per commit.
    pub fn with_state_history(mut self, persist: bool) -> Self {
        self.persist_state_history = persist;
        self
    }

    /// Replace the clock used for the `_ts`/`_date` columns.
    pub fn with_now(mut self, now: fn() -> DateTime<Utc>) -> Self {
        self.now = now;
        self
    }

    /// Make every subsequent put fail with a database error, before
    /// anything is written.
    pub async fn set_fail_puts(&self, fail: bool) {
        *self.fail_puts.write().await = fail;
    }

    /// All records of an aggregate's partition in ascending sort-key
    /// order. Test inspection.
    pub async fn items(&self, id: &str) -> Vec<Item> {
        let partitions = self.partitions.read().await;
        partitions
            .get(&partition_key(&self.namespace, id))
            .map(|partition| partition.values().cloned().collect())
            .unwrap_or_default()
    }

    /// The sort keys of an aggregate's partition, ascending. Test
    /// inspection.
    pub async fn sort_keys(&self, id: &str) -> Vec<String> {
        let partitions = self.partitions.read().await;
        partitions
            .get(&partition_key(&self.namespace, id))
            .map(|partition| partition.keys().cloned().collect())
            .unwrap_or_default()
    }
}

#[async_trait]
impl<S: State> Store<S> for MemoryStore {
    async fn get(&self, id: &str) -> Result<(S, u64)> {
        let partitions = self.partitions.read().await;
        let item = partitions
            .get(&partition_key(&self.namespace, id))
            .and_then(|partition| partition.get(STATE_SORT_KEY))
            .ok_or(StoreError::StateNotFound)?;
        let state = codec::from_item(item)?;
        let sequence = record_sequence(item)?;
        Ok((state, sequence))
    }

    async fn put(
        &self,
        id: &str,
        at_sequence: u64,
        state: &S,
        inbound: &[S::Inbound],
        outbound: &[S::Outbound],
    ) -> Result<()> {
        if *self.fail_puts.read().await {
            return Err(StoreError::Database("simulated put failure".to_string()));
        }

        let next_sequence = at_sequence + 1;
        let now = (self.now)();

        // Build every record first so a codec failure writes nothing.
        let state_record = build_record(
            &self.namespace,
            id,
            STATE_SORT_KEY.to_string(),
            next_sequence,
            state,
            &self.namespace,
            now,
        )?;
        let mut new_records = Vec::with_capacity(1 + inbound.len() + outbound.len());
        if self.persist_state_history {
            new_records.push((
                state_history_sort_key(next_sequence),
                build_record(
                    &self.namespace,
                    id,
                    state_history_sort_key(next_sequence),
                    next_sequence,
                    state,
                    &self.namespace,
                    now,
                )?,
            ));
        }
        for (index, event) in inbound.iter().enumerate() {
            let sort_key = inbound_sort_key(next_sequence, index, event.event_name());
            new_records.push((
                sort_key.clone(),
                build_record(
                    &self.namespace,
                    id,
                    sort_key,
                    next_sequence,
                    event,
                    event.event_name(),
                    now,
                )?,
            ));
        }
        for (index, event) in outbound.iter().enumerate() {
            let sort_key = outbound_sort_key(next_sequence, index, event.event_name());
            new_records.push((
                sort_key.clone(),
                build_record(
                    &self.namespace,
                    id,
                    sort_key,
                    next_sequence,
                    event,
                    event.event_name(),
                    now,
                )?,
            ));
        }

        let mut partitions = self.partitions.write().await;
        let partition = partitions
            .entry(partition_key(&self.namespace, id))
            .or_default();

        // Check every condition before touching the partition, so a failed
        // transaction leaves no trace.
        if let Some(existing) = partition.get(STATE_SORT_KEY) {
            if record_sequence(existing)? != at_sequence {
                return Err(StoreError::OptimisticConcurrency);
            }
        }
        for (sort_key, _) in &new_records {
            if partition.contains_key(sort_key) {
                return Err(StoreError::OptimisticConcurrency);
            }
        }

        partition.insert(STATE_SORT_KEY.to_string(), state_record);
        for (sort_key, record) in new_records {
            partition.insert(sort_key, record);
        }
        Ok(())
    }

    async fn query(
        &self,
        id: &str,
        inbound_reader: &InboundEventReader<S::Inbound>,
        outbound_reader: &OutboundEventReader<S::Outbound>,
    ) -> Result<QueryResult<S>> {
        self.query_partition(id, inbound_reader, outbound_reader, None)
            .await
    }

    async fn query_with_history(
        &self,
        id: &str,
        inbound_reader: &InboundEventReader<S::Inbound>,
        outbound_reader: &OutboundEventReader<S::Outbound>,
        history_reader: &StateHistoryReader<S>,
    ) -> Result<QueryResult<S>> {
        self.query_partition(id, inbound_reader, outbound_reader, Some(history_reader))
            .await
    }
}

impl MemoryStore {
    async fn query_partition<S: State>(
        &self,
        id: &str,
        inbound_reader: &InboundEventReader<S::Inbound>,
        outbound_reader: &OutboundEventReader<S::Outbound>,
        history_reader: Option<&StateHistoryReader<S>>,
    ) -> Result<QueryResult<S>> {
        let mut fold = PartitionFold::new(inbound_reader, outbound_reader, history_reader);
        let partitions = self.partitions.read().await;
        if let Some(partition) = partitions.get(&partition_key(&self.namespace, id)) {
            for item in partition.values() {
                fold.absorb(item)?;
            }
        }
        fold.finish()
    }
}
