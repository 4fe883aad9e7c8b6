//! Record layout and storage operations for the aggregate table.
//!
//! Table schema (one table, many namespaces):
//! - Hash key `_pk`: `{namespace}/{id}` (String)
//! - Range key `_sk` (String), one of:
//!   - `STATE` — the current state, one per partition
//!   - `STATE/{seq}` — optional immutable snapshot per commit
//!   - `INBOUND/{seq}/{idx}/{event_name}` — the idx-th event consumed in
//!     commit seq
//!   - `OUTBOUND/{seq}/{idx}/{event_name}` — the idx-th event emitted in
//!     commit seq
//!
//! Every record also carries `_namespace`, `_seq` (Number), `_typ` (the
//! namespace for state rows, the event name for event rows), `_ts` (unix
//! seconds) and `_date` (RFC3339 UTC).
//!
//! Leading the event sort keys with the strictly increasing `seq` keeps
//! them unique within the partition even when the same event type shows up
//! in a later commit; `idx` preserves intra-commit order. All records of a
//! commit share a single `_seq`, which is also what the STATE condition
//! expression guards.

pub mod dynamo;
pub mod memory;

use std::collections::HashMap;

use async_trait::async_trait;
use aws_sdk_dynamodb::types::AttributeValue;
use chrono::{DateTime, SecondsFormat, Utc};
use serde::Serialize;

use crate::codec::{self, CodecError, Item};
use crate::processor::State;

pub use dynamo::{DynamoStore, StoreConfig};
pub use memory::MemoryStore;

/// Result type for storage operations.
pub type Result<T> = std::result::Result<T, StoreError>;

/// Errors that can occur during storage operations.
#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    /// The aggregate has no STATE record.
    #[error("state not found")]
    StateNotFound,

    /// The state has been updated since it was read. Reload and try again.
    #[error("state has been updated since it was read, try again")]
    OptimisticConcurrency,

    #[error("missing {name} attribute in record")]
    MissingAttribute { name: &'static str },

    #[error("invalid {name} attribute in record: {message}")]
    InvalidAttribute {
        name: &'static str,
        message: String,
    },

    #[error("{direction} event: no reader for {event_name:?}")]
    NoEventReader {
        direction: &'static str,
        event_name: String,
    },

    #[error(transparent)]
    Codec(#[from] CodecError),

    #[error("database error: {0}")]
    Database(String),
}

pub(crate) const ATTR_PK: &str = "_pk";
pub(crate) const ATTR_SK: &str = "_sk";
pub(crate) const ATTR_NAMESPACE: &str = "_namespace";
pub(crate) const ATTR_SEQ: &str = "_seq";
pub(crate) const ATTR_TYP: &str = "_typ";
pub(crate) const ATTR_TS: &str = "_ts";
pub(crate) const ATTR_DATE: &str = "_date";

pub(crate) const STATE_SORT_KEY: &str = "STATE";

pub(crate) fn partition_key(namespace: &str, id: &str) -> String {
    format!("{namespace}/{id}")
}

pub(crate) fn state_history_sort_key(sequence: u64) -> String {
    format!("STATE/{sequence}")
}

pub(crate) fn inbound_sort_key(sequence: u64, index: usize, event_name: &str) -> String {
    format!("INBOUND/{sequence}/{index}/{event_name}")
}

pub(crate) fn outbound_sort_key(sequence: u64, index: usize, event_name: &str) -> String {
    format!("OUTBOUND/{sequence}/{index}/{event_name}")
}

pub(crate) fn utc_now() -> DateTime<Utc> {
    Utc::now()
}

/// Marshal a value and stamp the metadata columns on it.
pub(crate) fn build_record<T: Serialize + ?Sized>(
    namespace: &str,
    id: &str,
    sort_key: String,
    sequence: u64,
    value: &T,
    record_type: &str,
    now: DateTime<Utc>,
) -> Result<Item> {
    let mut item = codec::to_item(value)?;
    item.insert(
        ATTR_PK.to_string(),
        AttributeValue::S(partition_key(namespace, id)),
    );
    item.insert(ATTR_SK.to_string(), AttributeValue::S(sort_key));
    item.insert(
        ATTR_NAMESPACE.to_string(),
        AttributeValue::S(namespace.to_string()),
    );
    item.insert(ATTR_SEQ.to_string(), AttributeValue::N(sequence.to_string()));
    item.insert(
        ATTR_TYP.to_string(),
        AttributeValue::S(record_type.to_string()),
    );
    item.insert(
        ATTR_TS.to_string(),
        AttributeValue::N(now.timestamp().to_string()),
    );
    item.insert(
        ATTR_DATE.to_string(),
        AttributeValue::S(now.to_rfc3339_opts(SecondsFormat::Secs, true)),
    );
    Ok(item)
}

/// Read the `_seq` column of a record.
pub(crate) fn record_sequence(item: &Item) -> Result<u64> {
    let attr = item
        .get(ATTR_SEQ)
        .ok_or(StoreError::MissingAttribute { name: "_seq" })?;
    let n = attr.as_n().map_err(|_| StoreError::InvalidAttribute {
        name: "_seq",
        message: "not a number".to_string(),
    })?;
    n.parse::<u64>().map_err(|e| StoreError::InvalidAttribute {
        name: "_seq",
        message: e.to_string(),
    })
}

/// Read the `_typ` column of a record.
pub(crate) fn record_type(item: &Item) -> Result<&str> {
    let attr = item
        .get(ATTR_TYP)
        .ok_or(StoreError::MissingAttribute { name: "_typ" })?;
    attr.as_s()
        .map(String::as_str)
        .map_err(|_| StoreError::InvalidAttribute {
            name: "_typ",
            message: "not a string".to_string(),
        })
}

/// Split a record's sort key into its prefix and the remainder after the
/// first `/`. `None` if the record has no string sort key.
pub(crate) fn split_sort_key(item: &Item) -> Option<(&str, Option<&str>)> {
    let sk = item.get(ATTR_SK)?.as_s().ok()?;
    Some(match sk.split_once('/') {
        Some((prefix, suffix)) => (prefix, Some(suffix)),
        None => (sk.as_str(), None),
    })
}

type EventFactory<E> = Box<dyn Fn(&Item) -> std::result::Result<E, CodecError> + Send + Sync>;

/// Dispatch table from inbound event name to a decoding factory.
///
/// Records store only the event-name string, not a language type, so the
/// caller registers a factory per name before querying. A name encountered
/// during a query without a factory is a fatal error.
pub struct InboundEventReader<E> {
    factories: HashMap<String, EventFactory<E>>,
}

impl<E> InboundEventReader<E> {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a factory for an event name. Chainable.
    pub fn add<F>(mut self, event_name: impl Into<String>, factory: F) -> Self
    where
        F: Fn(&Item) -> std::result::Result<E, CodecError> + Send + Sync + 'static,
    {
        self.factories.insert(event_name.into(), Box::new(factory));
        self
    }

    fn read(&self, event_name: &str, item: &Item) -> Option<std::result::Result<E, CodecError>> {
        self.factories.get(event_name).map(|factory| factory(item))
    }
}

impl<E> Default for InboundEventReader<E> {
    fn default() -> Self {
        Self {
            factories: HashMap::new(),
        }
    }
}

/// Dispatch table from outbound event name to a decoding factory.
pub struct OutboundEventReader<E> {
    factories: HashMap<String, EventFactory<E>>,
}

impl<E> OutboundEventReader<E> {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a factory for an event name. Chainable.
    pub fn add<F>(mut self, event_name: impl Into<String>, factory: F) -> Self
    where
        F: Fn(&Item) -> std::result::Result<E, CodecError> + Send + Sync + 'static,
    {
        self.factories.insert(event_name.into(), Box::new(factory));
        self
    }

    fn read(&self, event_name: &str, item: &Item) -> Option<std::result::Result<E, CodecError>> {
        self.factories.get(event_name).map(|factory| factory(item))
    }
}

impl<E> Default for OutboundEventReader<E> {
    fn default() -> Self {
        Self {
            factories: HashMap::new(),
        }
    }
}

/// Decoder for `STATE/{seq}` snapshot records.
pub struct StateHistoryReader<S> {
    factory: EventFactory<S>,
}

impl<S> StateHistoryReader<S> {
    pub fn new<F>(factory: F) -> Self
    where
        F: Fn(&Item) -> std::result::Result<S, CodecError> + Send + Sync + 'static,
    {
        Self {
            factory: Box::new(factory),
        }
    }

    fn read(&self, item: &Item) -> std::result::Result<S, CodecError> {
        (self.factory)(item)
    }
}

/// Everything a partition holds for one aggregate.
#[derive(Debug)]
pub struct QueryResult<S: State> {
    /// Sequence of the last successful commit.
    pub sequence: u64,
    /// The decoded current state.
    pub state: S,
    /// Inbound events in commit order, insertion order within a commit.
    pub inbound: Vec<S::Inbound>,
    /// Outbound events in commit order, insertion order within a commit.
    pub outbound: Vec<S::Outbound>,
    /// Decoded `STATE/{seq}` snapshots; empty unless the store persists
    /// history and a history reader was supplied.
    pub state_history: Vec<S>,
}

/// Interface for aggregate persistence.
///
/// Implementations:
/// - [`DynamoStore`]: DynamoDB storage
/// - [`MemoryStore`]: in-memory storage with identical condition and
///   ordering semantics, for tests
#[async_trait]
pub trait Store<S: State>: Send + Sync {
    /// Read the current state, strongly consistent.
    ///
    /// Returns the state and the sequence of the last successful commit,
    /// or [`StoreError::StateNotFound`].
    async fn get(&self, id: &str) -> Result<(S, u64)>;

    /// Commit state plus events atomically at `at_sequence + 1`.
    ///
    /// `at_sequence` is the `_seq` the caller last saw, 0 for a brand new
    /// aggregate. A concurrent writer who got there first causes
    /// [`StoreError::OptimisticConcurrency`]; nothing is written. The
    /// store never retries.
    async fn put(
        &self,
        id: &str,
        at_sequence: u64,
        state: &S,
        inbound: &[S::Inbound],
        outbound: &[S::Outbound],
    ) -> Result<()>;

    /// Read the whole partition and reconstruct typed events through the
    /// readers.
    async fn query(
        &self,
        id: &str,
        inbound_reader: &InboundEventReader<S::Inbound>,
        outbound_reader: &OutboundEventReader<S::Outbound>,
    ) -> Result<QueryResult<S>>;

    /// [`query`](Store::query), also decoding `STATE/{seq}` snapshots.
    async fn query_with_history(
        &self,
        id: &str,
        inbound_reader: &InboundEventReader<S::Inbound>,
        outbound_reader: &OutboundEventReader<S::Outbound>,
        history_reader: &StateHistoryReader<S>,
    ) -> Result<QueryResult<S>>;
}

/// Shared partition fold: both backends feed records in ascending sort-key
/// order and this accumulates the query result. The iteration order is the
/// database's; records are never reordered.
pub(crate) struct PartitionFold<'r, S: State> {
    inbound_reader: &'r InboundEventReader<S::Inbound>,
    outbound_reader: &'r OutboundEventReader<S::Outbound>,
    history_reader: Option<&'r StateHistoryReader<S>>,
    sequence: u64,
    state: Option<S>,
    inbound: Vec<S::Inbound>,
    outbound: Vec<S::Outbound>,
    state_history: Vec<S>,
}

impl<'r, S: State> PartitionFold<'r, S> {
    pub(crate) fn new(
        inbound_reader: &'r InboundEventReader<S::Inbound>,
        outbound_reader: &'r OutboundEventReader<S::Outbound>,
        history_reader: Option<&'r StateHistoryReader<S>>,
    ) -> Self {
        Self {
            inbound_reader,
            outbound_reader,
            history_reader,
            sequence: 0,
            state: None,
            inbound: Vec::new(),
            outbound: Vec::new(),
            state_history: Vec::new(),
        }
    }

    pub(crate) fn absorb(&mut self, item: &Item) -> Result<()> {
        match split_sort_key(item) {
            Some((STATE_SORT_KEY, None)) => {
                self.state = Some(codec::from_item(item)?);
                self.sequence = record_sequence(item)?;
            }
            Some((STATE_SORT_KEY, Some(_))) => {
                if let Some(reader) = self.history_reader {
                    self.state_history.push(reader.read(item)?);
                }
            }
            Some(("INBOUND", _)) => {
                let event_name = record_type(item)?;
                let event = self
                    .inbound_reader
                    .read(event_name, item)
                    .ok_or_else(|| StoreError::NoEventReader {
                        direction: "inbound",
                        event_name: event_name.to_string(),
                    })??;
                self.inbound.push(event);
            }
            Some(("OUTBOUND", _)) => {
                let event_name = record_type(item)?;
                let event = self
                    .outbound_reader
                    .read(event_name, item)
                    .ok_or_else(|| StoreError::NoEventReader {
                        direction: "outbound",
                        event_name: event_name.to_string(),
                    })??;
                self.outbound.push(event);
            }
            _ => {}
        }
        Ok(())
    }

    pub(crate) fn finish(self) -> Result<QueryResult<S>> {
        let state = self.state.ok_or(StoreError::StateNotFound)?;
        Ok(QueryResult {
            sequence: self.sequence,
            state,
            inbound: self.inbound,
            outbound: self.outbound,
            state_history: self.state_history,
        })
    }
}
