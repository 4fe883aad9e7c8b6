//! State and event capabilities, and the processor that folds events into
//! state and commits the result.
//!
//! The processor is bound to a single aggregate id. Each call to
//! [`Processor::process`] runs the inbound events through the user's
//! [`State::process`], collects the emitted outbound events, and asks the
//! store to commit state plus events atomically at the next sequence
//! number. The in-memory sequence does not advance on success: a caller who
//! wants to process again must reload, because the new outbound events are
//! a function of the new state.

use aws_sdk_dynamodb::types::TransactWriteItem;
use serde::de::DeserializeOwned;
use serde::Serialize;

use crate::store::{DynamoStore, Store, StoreError};

/// An event received from an external system.
///
/// The name is the stable string stored in the record's `_typ` column and
/// sort key, and the key the read-side dispatch tables use.
pub trait InboundEvent: Serialize + Send + Sync {
    fn event_name(&self) -> &str;
}

/// An event emitted by a state transition, destined for the event bus.
pub trait OutboundEvent: Serialize + Send + Sync {
    fn event_name(&self) -> &str;
}

/// State of an aggregate.
///
/// A state is a serde-round-trippable record plus a single transition
/// operation. The processor mutates the state in place; implementations
/// must be deterministic for replay to reproduce both the state and the
/// outbound sequence.
pub trait State: Serialize + DeserializeOwned + Send + Sync + 'static {
    type Inbound: InboundEvent;
    type Outbound: OutboundEvent;
    type Error: std::error::Error + Send + Sync + 'static;

    /// Apply one inbound event, returning the outbound events it produced.
    fn process(&mut self, event: &Self::Inbound) -> Result<Vec<Self::Outbound>, Self::Error>;
}

/// Errors from processing: either the user's state logic rejected an event,
/// or the commit failed.
#[derive(Debug, thiserror::Error)]
pub enum ProcessError<E>
where
    E: std::error::Error + Send + Sync + 'static,
{
    #[error(transparent)]
    State(E),

    #[error(transparent)]
    Store(#[from] StoreError),
}

/// Processor of inbound events for one aggregate.
#[derive(Debug)]
pub struct Processor<St, S> {
    store: St,
    id: String,
    state: S,
    sequence: u64,
}

impl<St, S> Processor<St, S>
where
    St: Store<S>,
    S: State,
{
    /// Create a processor for a new, never-written aggregate.
    ///
    /// The first commit will condition on the partition not existing and
    /// write `_seq = 1`.
    pub fn new(store: St, id: impl Into<String>, state: S) -> Self {
        Self {
            store,
            id: id.into(),
            state,
            sequence: 0,
        }
    }

    /// Load the current state from the store and return a processor
    /// positioned at the stored sequence.
    pub async fn load(store: St, id: impl Into<String>) -> Result<Self, StoreError> {
        let id = id.into();
        let (state, sequence) = store.get(&id).await?;
        Ok(Self {
            store,
            id,
            state,
            sequence,
        })
    }

    /// The current in-memory state.
    pub fn state(&self) -> &S {
        &self.state
    }

    /// The sequence this processor's next commit conditions on.
    pub fn sequence(&self) -> u64 {
        self.sequence
    }

    /// Process inbound events, then commit the updated state together with
    /// the inbound and outbound events.
    ///
    /// On [`StoreError::OptimisticConcurrency`] nothing was written; the
    /// caller reloads and re-derives before trying again.
    pub async fn process(&mut self, events: Vec<S::Inbound>) -> Result<(), ProcessError<S::Error>> {
        let outbound = self.fold(&events)?;
        self.store
            .put(&self.id, self.sequence, &self.state, &events, &outbound)
            .await?;
        Ok(())
    }

    fn fold(&mut self, events: &[S::Inbound]) -> Result<Vec<S::Outbound>, ProcessError<S::Error>> {
        let mut outbound = Vec::new();
        for event in events {
            outbound.extend(self.state.process(event).map_err(ProcessError::State)?);
        }
        Ok(outbound)
    }
}

/// The transactional surface, available when the processor is bound to the
/// DynamoDB store: callers who need to append their own writes to the
/// commit use [`prepare`](Processor::prepare) and
/// [`execute`](Processor::execute) instead of
/// [`process`](Processor::process).
impl<S: State> Processor<DynamoStore, S> {
    /// Run the events through the state logic and return the transact
    /// write items of the resulting commit, without executing it.
    pub fn prepare(
        &mut self,
        events: Vec<S::Inbound>,
    ) -> Result<Vec<TransactWriteItem>, ProcessError<S::Error>> {
        let outbound = self.fold(&events)?;
        let items = self
            .store
            .prepare(&self.id, self.sequence, &self.state, &events, &outbound)
            .map_err(ProcessError::Store)?;
        Ok(items)
    }

    /// Execute a transaction assembled by [`prepare`](Processor::prepare),
    /// possibly extended with additional items.
    pub async fn execute(&self, items: Vec<TransactWriteItem>) -> Result<(), StoreError> {
        self.store.execute(items).await
    }
}
