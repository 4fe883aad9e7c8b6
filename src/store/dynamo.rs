//! DynamoDB implementation of the aggregate store.
//!
//! One commit is one `TransactWriteItems` call: the STATE put conditions on
//! `attribute_not_exists(_pk) OR _seq = :at`, every other put on
//! `attribute_not_exists(_pk)`. A transaction cancelled by a conditional
//! check maps to [`StoreError::OptimisticConcurrency`]; every other failure
//! passes through as [`StoreError::Database`].

use async_trait::async_trait;
use aws_config::BehaviorVersion;
use aws_sdk_dynamodb::error::SdkError;
use aws_sdk_dynamodb::operation::transact_write_items::TransactWriteItemsError;
use aws_sdk_dynamodb::types::{AttributeValue, Put, TransactWriteItem};
use aws_sdk_dynamodb::Client;
use chrono::{DateTime, Utc};
use serde::Serialize;
use tracing::info;

use super::{
    build_record, inbound_sort_key, outbound_sort_key, partition_key, record_sequence,
    state_history_sort_key, utc_now, InboundEventReader, OutboundEventReader, PartitionFold,
    QueryResult, Result, StateHistoryReader, Store, StoreError, ATTR_PK, ATTR_SEQ, ATTR_SK,
    STATE_SORT_KEY,
};
use crate::codec;
use crate::processor::{InboundEvent, OutboundEvent, State};

/// Configuration for the DynamoDB store.
#[derive(Debug, Clone, Default)]
pub struct StoreConfig {
    /// AWS region. Uses the default provider chain if not set.
    pub region: Option<String>,
    /// Custom endpoint URL (for DynamoDB Local or LocalStack).
    pub endpoint_url: Option<String>,
    /// When `true`, each commit also writes an immutable `STATE/{seq}`
    /// snapshot.
    pub persist_state_history: bool,
}

impl StoreConfig {
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the AWS region.
    pub fn with_region(mut self, region: impl Into<String>) -> Self {
        self.region = Some(region.into());
        self
    }

    /// Set a custom endpoint URL.
    pub fn with_endpoint(mut self, url: impl Into<String>) -> Self {
        self.endpoint_url = Some(url.into());
        self
    }

    /// Persist a `STATE/{seq}` snapshot per commit.
    pub fn with_state_history(mut self, persist: bool) -> Self {
        self.persist_state_history = persist;
        self
    }
}

/// DynamoDB-backed aggregate store.
///
/// Cloning is cheap and shares the underlying client. The store holds no
/// mutable state between calls; all serialization is delegated to the
/// table's transactional semantics.
#[derive(Clone)]
pub struct DynamoStore {
    client: Client,
    table_name: String,
    namespace: String,
    persist_state_history: bool,
    now: fn() -> DateTime<Utc>,
}

impl std::fmt::Debug for DynamoStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DynamoStore")
            .field("table_name", &self.table_name)
            .field("namespace", &self.namespace)
            .finish()
    }
}

impl DynamoStore {
    /// Create a store from the ambient AWS configuration.
    pub async fn new(
        table_name: impl Into<String>,
        namespace: impl Into<String>,
        config: StoreConfig,
    ) -> Self {
        let mut loader = aws_config::defaults(BehaviorVersion::latest());
        if let Some(ref region) = config.region {
            loader = loader.region(aws_config::Region::new(region.clone()));
        }
        let sdk_config = loader.load().await;

        let client = if let Some(ref endpoint) = config.endpoint_url {
            let dynamo_config = aws_sdk_dynamodb::config::Builder::from(&sdk_config)
                .endpoint_url(endpoint)
                .build();
            Client::from_conf(dynamo_config)
        } else {
            Client::new(&sdk_config)
        };

        Self::from_client(client, table_name, namespace, config)
    }

    /// Create a store from a pre-built client (tests, custom credentials).
    pub fn from_client(
        client: Client,
        table_name: impl Into<String>,
        namespace: impl Into<String>,
        config: StoreConfig,
    ) -> Self {
        let table_name = table_name.into();
        let namespace = namespace.into();
        info!(table = %table_name, namespace = %namespace, "Connected to DynamoDB");
        Self {
            client,
            table_name,
            namespace,
            persist_state_history: config.persist_state_history,
            now: utc_now,
        }
    }

    /// Replace the clock used for the `_ts`/`_date` columns. Tests pin it.
    pub fn with_now(mut self, now: fn() -> DateTime<Utc>) -> Self {
        self.now = now;
        self
    }

    /// Assemble the transact write items for one commit without executing
    /// them. Callers append their own items before [`execute`](Self::execute)
    /// to join the transaction.
    pub fn prepare<St, I, O>(
        &self,
        id: &str,
        at_sequence: u64,
        state: &St,
        inbound: &[I],
        outbound: &[O],
    ) -> Result<Vec<TransactWriteItem>>
    where
        St: Serialize,
        I: InboundEvent,
        O: OutboundEvent,
    {
        let next_sequence = at_sequence + 1;
        let now = (self.now)();

        let mut items = Vec::with_capacity(2 + inbound.len() + outbound.len());
        items.push(self.state_put(id, at_sequence, state, STATE_SORT_KEY.to_string(), now)?);
        if self.persist_state_history {
            let record_type = self.namespace.clone();
            items.push(self.new_record_put(
                id,
                state_history_sort_key(next_sequence),
                next_sequence,
                state,
                &record_type,
                now,
            )?);
        }
        for (index, event) in inbound.iter().enumerate() {
            items.push(self.new_record_put(
                id,
                inbound_sort_key(next_sequence, index, event.event_name()),
                next_sequence,
                event,
                event.event_name(),
                now,
            )?);
        }
        for (index, event) in outbound.iter().enumerate() {
            items.push(self.new_record_put(
                id,
                outbound_sort_key(next_sequence, index, event.event_name()),
                next_sequence,
                event,
                event.event_name(),
                now,
            )?);
        }
        Ok(items)
    }

    /// Execute a transaction assembled by [`prepare`](Self::prepare).
    pub async fn execute(&self, items: Vec<TransactWriteItem>) -> Result<()> {
        let result = self
            .client
            .transact_write_items()
            .set_transact_items(Some(items))
            .send()
            .await;
        match result {
            Ok(_) => Ok(()),
            Err(ref err) if is_conditional_check_cancellation(err) => {
                Err(StoreError::OptimisticConcurrency)
            }
            Err(err) => Err(StoreError::Database(format!(
                "transact write items failed: {err}"
            ))),
        }
    }

    /// The STATE put: overwrite in place, conditioned on the sequence the
    /// caller last saw.
    fn state_put<St: Serialize>(
        &self,
        id: &str,
        at_sequence: u64,
        state: &St,
        sort_key: String,
        now: DateTime<Utc>,
    ) -> Result<TransactWriteItem> {
        let item = build_record(
            &self.namespace,
            id,
            sort_key,
            at_sequence + 1,
            state,
            &self.namespace,
            now,
        )?;
        let put = Put::builder()
            .table_name(&self.table_name)
            .set_item(Some(item))
            .condition_expression("attribute_not_exists(#_pk) OR #_seq = :_seq")
            .expression_attribute_names("#_pk", ATTR_PK)
            .expression_attribute_names("#_seq", ATTR_SEQ)
            .expression_attribute_values(":_seq", AttributeValue::N(at_sequence.to_string()))
            .build()
            .map_err(|e| StoreError::Database(format!("failed to build state put: {e}")))?;
        Ok(TransactWriteItem::builder().put(put).build())
    }

    /// A put for a record that must not exist yet: snapshots and events.
    fn new_record_put<T: Serialize + ?Sized>(
        &self,
        id: &str,
        sort_key: String,
        sequence: u64,
        value: &T,
        record_type: &str,
        now: DateTime<Utc>,
    ) -> Result<TransactWriteItem> {
        let item = build_record(
            &self.namespace,
            id,
            sort_key,
            sequence,
            value,
            record_type,
            now,
        )?;
        let put = Put::builder()
            .table_name(&self.table_name)
            .set_item(Some(item))
            .condition_expression("attribute_not_exists(#_pk)")
            .expression_attribute_names("#_pk", ATTR_PK)
            .build()
            .map_err(|e| StoreError::Database(format!("failed to build record put: {e}")))?;
        Ok(TransactWriteItem::builder().put(put).build())
    }

    async fn query_partition<S: State>(
        &self,
        id: &str,
        inbound_reader: &InboundEventReader<S::Inbound>,
        outbound_reader: &OutboundEventReader<S::Outbound>,
        history_reader: Option<&StateHistoryReader<S>>,
    ) -> Result<QueryResult<S>> {
        let mut fold = PartitionFold::new(inbound_reader, outbound_reader, history_reader);
        let mut pages = self
            .client
            .query()
            .table_name(&self.table_name)
            .consistent_read(true)
            .key_condition_expression("#_pk = :_pk")
            .expression_attribute_names("#_pk", ATTR_PK)
            .expression_attribute_values(
                ":_pk",
                AttributeValue::S(partition_key(&self.namespace, id)),
            )
            .into_paginator()
            .items()
            .send();
        while let Some(item) = pages.next().await {
            let item = item.map_err(|e| StoreError::Database(format!("query failed: {e}")))?;
            fold.absorb(&item)?;
        }
        fold.finish()
    }
}

#[async_trait]
impl<S: State> Store<S> for DynamoStore {
    async fn get(&self, id: &str) -> Result<(S, u64)> {
        let output = self
            .client
            .get_item()
            .table_name(&self.table_name)
            .consistent_read(true)
            .key(
                ATTR_PK,
                AttributeValue::S(partition_key(&self.namespace, id)),
            )
            .key(ATTR_SK, AttributeValue::S(STATE_SORT_KEY.to_string()))
            .send()
            .await
            .map_err(|e| StoreError::Database(format!("get item failed: {e}")))?;
        let item = output.item.ok_or(StoreError::StateNotFound)?;
        let state = codec::from_item(&item)?;
        let sequence = record_sequence(&item)?;
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
        let items = self.prepare(id, at_sequence, state, inbound, outbound)?;
        self.execute(items).await
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

fn is_conditional_check_cancellation<R>(err: &SdkError<TransactWriteItemsError, R>) -> bool {
    let SdkError::ServiceError(service_err) = err else {
        return false;
    };
    let TransactWriteItemsError::TransactionCanceledException(cancelled) = service_err.err() else {
        return false;
    };
    cancelled
        .cancellation_reasons()
        .iter()
        .any(|reason| reason.code() == Some("ConditionalCheckFailed"))
}
