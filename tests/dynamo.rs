//! DynamoDB integration tests.
//!
//! Run against DynamoDB Local:
//!
//! ```text
//! docker run -p 8000:8000 amazon/dynamodb-local
//! cargo test --test dynamo -- --ignored
//! ```
//!
//! `DYNAMODB_ENDPOINT` overrides the default `http://localhost:8000`.
//! Each test creates a uniquely named table and deletes it afterwards.

use std::convert::Infallible;

use aws_config::BehaviorVersion;
use aws_sdk_dynamodb::config::{Credentials, Region};
use aws_sdk_dynamodb::types::{
    AttributeDefinition, BillingMode, KeySchemaElement, KeyType, ScalarAttributeType,
};
use aws_sdk_dynamodb::Client;
use serde::{Deserialize, Serialize};
use streamstate::{
    codec, DynamoStore, InboundEvent, InboundEventReader, OutboundEvent, OutboundEventReader,
    ProcessError, Processor, QueryResult, State, Store, StoreConfig, StoreError,
};
use uuid::Uuid;

fn endpoint() -> String {
    std::env::var("DYNAMODB_ENDPOINT").unwrap_or_else(|_| "http://localhost:8000".to_string())
}

fn test_client() -> Client {
    let config = aws_sdk_dynamodb::Config::builder()
        .behavior_version(BehaviorVersion::latest())
        .region(Region::new("eu-west-1"))
        .credentials_provider(Credentials::new("fake", "fake", None, None, "static"))
        .endpoint_url(endpoint())
        .build();
    Client::from_conf(config)
}

async fn create_local_table(client: &Client) -> String {
    let name = Uuid::new_v4().to_string();
    client
        .create_table()
        .table_name(&name)
        .attribute_definitions(
            AttributeDefinition::builder()
                .attribute_name("_pk")
                .attribute_type(ScalarAttributeType::S)
                .build()
                .expect("valid attribute definition"),
        )
        .attribute_definitions(
            AttributeDefinition::builder()
                .attribute_name("_sk")
                .attribute_type(ScalarAttributeType::S)
                .build()
                .expect("valid attribute definition"),
        )
        .key_schema(
            KeySchemaElement::builder()
                .attribute_name("_pk")
                .key_type(KeyType::Hash)
                .build()
                .expect("valid key schema element"),
        )
        .key_schema(
            KeySchemaElement::builder()
                .attribute_name("_sk")
                .key_type(KeyType::Range)
                .build()
                .expect("valid key schema element"),
        )
        .billing_mode(BillingMode::PayPerRequest)
        .send()
        .await
        .expect("failed to create local table");
    name
}

async fn delete_local_table(client: &Client, name: &str) {
    client
        .delete_table()
        .table_name(name)
        .send()
        .await
        .expect("failed to delete local table");
}

#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
struct AverageState {
    sum: i64,
    count: i64,
    value: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
struct Add {
    number: i64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
struct Subtract {
    number: i64,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(untagged)]
enum AverageInbound {
    Add(Add),
    Subtract(Subtract),
}

impl InboundEvent for AverageInbound {
    fn event_name(&self) -> &str {
        match self {
            AverageInbound::Add(_) => "Add",
            AverageInbound::Subtract(_) => "Subtract",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
struct Average {
    value: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
struct Total {
    sum: i64,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(untagged)]
enum AverageOutbound {
    Average(Average),
    Total(Total),
}

impl OutboundEvent for AverageOutbound {
    fn event_name(&self) -> &str {
        match self {
            AverageOutbound::Average(_) => "Average",
            AverageOutbound::Total(_) => "Total",
        }
    }
}

impl State for AverageState {
    type Inbound = AverageInbound;
    type Outbound = AverageOutbound;
    type Error = Infallible;

    fn process(&mut self, event: &AverageInbound) -> Result<Vec<AverageOutbound>, Infallible> {
        match event {
            AverageInbound::Add(add) => {
                self.count += 1;
                self.sum += add.number;
            }
            AverageInbound::Subtract(subtract) => {
                self.count -= 1;
                self.sum -= subtract.number;
            }
        }
        self.value = self.sum as f64 / self.count as f64;
        Ok(vec![
            AverageOutbound::Average(Average { value: self.value }),
            AverageOutbound::Total(Total { sum: self.sum }),
        ])
    }
}

fn average_inbound_reader() -> InboundEventReader<AverageInbound> {
    InboundEventReader::new()
        .add("Add", |item| Ok(AverageInbound::Add(codec::from_item(item)?)))
        .add("Subtract", |item| {
            Ok(AverageInbound::Subtract(codec::from_item(item)?))
        })
}

fn average_outbound_reader() -> OutboundEventReader<AverageOutbound> {
    OutboundEventReader::new()
        .add("Average", |item| {
            Ok(AverageOutbound::Average(codec::from_item(item)?))
        })
        .add("Total", |item| {
            Ok(AverageOutbound::Total(codec::from_item(item)?))
        })
}

fn store_for(client: &Client, table: &str) -> DynamoStore {
    DynamoStore::from_client(client.clone(), table, "Average", StoreConfig::new())
}

#[tokio::test]
#[ignore = "requires DynamoDB Local (set DYNAMODB_ENDPOINT)"]
async fn test_get_state_not_found() {
    let client = test_client();
    let table = create_local_table(&client).await;
    let store = store_for(&client, &table);

    let result: Result<(AverageState, u64), _> = store.get("id").await;
    assert!(matches!(result, Err(StoreError::StateNotFound)));

    delete_local_table(&client, &table).await;
}

#[tokio::test]
#[ignore = "requires DynamoDB Local (set DYNAMODB_ENDPOINT)"]
async fn test_put_and_get_state() {
    let client = test_client();
    let table = create_local_table(&client).await;
    let store = store_for(&client, &table);

    let initial = AverageState {
        sum: 1,
        count: 1,
        value: 1.0,
    };
    store
        .put("id", 0, &initial, &[], &[])
        .await
        .expect("initial put should succeed");

    let (retrieved, sequence): (AverageState, u64) =
        store.get("id").await.expect("get should succeed");
    assert_eq!(sequence, 1);
    assert_eq!(initial, retrieved);

    delete_local_table(&client, &table).await;
}

#[tokio::test]
#[ignore = "requires DynamoDB Local (set DYNAMODB_ENDPOINT)"]
async fn test_put_cannot_overwrite() {
    let client = test_client();
    let table = create_local_table(&client).await;
    let store = store_for(&client, &table);

    let state = AverageState::default();
    store
        .put("id", 0, &state, &[], &[])
        .await
        .expect("initial put should succeed");

    let err = store
        .put("id", 0, &state, &[], &[])
        .await
        .expect_err("overwriting an existing sequence should fail");
    assert!(matches!(err, StoreError::OptimisticConcurrency));

    delete_local_table(&client, &table).await;
}

#[tokio::test]
#[ignore = "requires DynamoDB Local (set DYNAMODB_ENDPOINT)"]
async fn test_put_with_state_history() {
    let client = test_client();
    let table = create_local_table(&client).await;
    let store = DynamoStore::from_client(
        client.clone(),
        table.as_str(),
        "Average",
        StoreConfig::new().with_state_history(true),
    );

    let state = AverageState::default();
    store
        .put("id", 0, &state, &[], &[])
        .await
        .expect("initial put should succeed");
    store
        .put("id", 1, &state, &[], &[])
        .await
        .expect("second put should succeed");

    delete_local_table(&client, &table).await;
}

/// Reprocessing after a reload reuses inbound event types; the
/// sequence-led sort keys keep the second commit from colliding with the
/// first.
#[tokio::test]
#[ignore = "requires DynamoDB Local (set DYNAMODB_ENDPOINT)"]
async fn test_reload_and_reprocess_duplicate_event_types() {
    let client = test_client();
    let table = create_local_table(&client).await;
    let store = store_for(&client, &table);
    let id = Uuid::new_v4().to_string();

    let mut processor = Processor::new(store.clone(), id.as_str(), AverageState::default());
    processor
        .process(vec![
            AverageInbound::Add(Add { number: 10 }),
            AverageInbound::Add(Add { number: 15 }),
            AverageInbound::Subtract(Subtract { number: 7 }),
        ])
        .await
        .expect("first processing run should succeed");

    let mut processor: Processor<_, AverageState> = Processor::load(store.clone(), id.as_str())
        .await
        .expect("load should succeed");
    processor
        .process(vec![AverageInbound::Add(Add { number: 10 })])
        .await
        .expect("second processing run should succeed");

    let result: QueryResult<AverageState> = store
        .query(&id, &average_inbound_reader(), &average_outbound_reader())
        .await
        .expect("query should succeed");
    assert_eq!(result.sequence, 2);
    assert_eq!(result.inbound.len(), 4);
    assert_eq!(result.outbound.len(), 8);
    assert_eq!(result.state.sum, 28);
    assert_eq!(result.state.count, 2);

    delete_local_table(&client, &table).await;
}

/// Two processors loaded at the same sequence; the loser gets the
/// concurrency sentinel and a subsequent get sees the winner's commit.
#[tokio::test]
#[ignore = "requires DynamoDB Local (set DYNAMODB_ENDPOINT)"]
async fn test_concurrent_processors_conflict() {
    let client = test_client();
    let table = create_local_table(&client).await;
    let store = store_for(&client, &table);

    let mut first = Processor::new(store.clone(), "id", AverageState::default());
    let mut second = Processor::new(store.clone(), "id", AverageState::default());

    first
        .process(vec![AverageInbound::Add(Add { number: 1 })])
        .await
        .expect("first processor should win");
    let err = second
        .process(vec![AverageInbound::Add(Add { number: 2 })])
        .await
        .expect_err("second processor should conflict");
    assert!(matches!(
        err,
        ProcessError::Store(StoreError::OptimisticConcurrency)
    ));

    let (_, sequence): (AverageState, u64) = store.get("id").await.expect("get should succeed");
    assert_eq!(sequence, 1);

    delete_local_table(&client, &table).await;
}
