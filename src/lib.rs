//! Transactional, event-sourced state store for single aggregates, backed
//! by DynamoDB.
//!
//! For each aggregate the store keeps the current state record together
//! with an append-only log of the inbound events that produced it and the
//! outbound events it emitted, all in one partition. Every commit is a
//! single conditional transaction, so state transitions are atomic,
//! optimistic-concurrency safe, reproducible, and queryable. A
//! downstream worker can watch the table's change stream and use
//! [`bridge`] to republish outbound records to an EventBridge bus.
//!
//! # Key Types
//!
//! | Type | Role |
//! |------|------|
//! | [`State`] | User-defined aggregate logic: folds inbound events, emits outbound events |
//! | [`Processor`] | Binds one aggregate id to a store, processes events, commits |
//! | [`DynamoStore`] | DynamoDB persistence with the optimistic-concurrency protocol |
//! | [`MemoryStore`] | In-memory persistence with the same semantics, for tests |
//! | [`InboundEventReader`] / [`OutboundEventReader`] | Name-keyed dispatch tables to rebuild typed events on read |
//! | [`Bridge`](bridge::Bridge) | Change-stream to EventBridge republisher |
//!
//! # Quick Start
//!
//! ```no_run
//! use serde::{Deserialize, Serialize};
//! use streamstate::{
//!     DynamoStore, InboundEvent, OutboundEvent, Processor, State, StoreConfig,
//! };
//!
//! #[derive(Debug, Default, Serialize, Deserialize)]
//! struct Counter {
//!     count: i64,
//! }
//!
//! #[derive(Debug, Serialize)]
//! struct Increment {
//!     amount: i64,
//! }
//!
//! impl InboundEvent for Increment {
//!     fn event_name(&self) -> &str {
//!         "Increment"
//!     }
//! }
//!
//! #[derive(Debug, Serialize)]
//! struct CounterUpdated {
//!     count: i64,
//! }
//!
//! impl OutboundEvent for CounterUpdated {
//!     fn event_name(&self) -> &str {
//!         "CounterUpdated"
//!     }
//! }
//!
//! impl State for Counter {
//!     type Inbound = Increment;
//!     type Outbound = CounterUpdated;
//!     type Error = std::convert::Infallible;
//!
//!     fn process(&mut self, event: &Increment) -> Result<Vec<CounterUpdated>, Self::Error> {
//!         self.count += event.amount;
//!         Ok(vec![CounterUpdated { count: self.count }])
//!     }
//! }
//!
//! # async fn run() -> Result<(), Box<dyn std::error::Error>> {
//! let store = DynamoStore::new("table", "Counter", StoreConfig::new()).await;
//! let mut processor = Processor::new(store, "counter-1", Counter::default());
//! processor.process(vec![Increment { amount: 1 }]).await?;
//! # Ok(())
//! # }
//! ```

pub mod bridge;
pub mod codec;
pub mod processor;
pub mod store;

pub use bridge::{Bridge, BridgeConfig, BridgeError, PutEventsApi};
pub use codec::{CodecError, Item};
pub use processor::{InboundEvent, OutboundEvent, ProcessError, Processor, State};
pub use store::{
    DynamoStore, InboundEventReader, MemoryStore, OutboundEventReader, QueryResult,
    StateHistoryReader, Store, StoreConfig, StoreError,
};
