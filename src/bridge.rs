//! Outbound bridge: republishes `OUTBOUND/` records from the table's
//! change stream to an EventBridge bus.
//!
//! A downstream worker feeds the stream's new images to
//! [`Bridge::handle`]. For each image whose sort key begins `OUTBOUND/`,
//! the bridge strips the `_`-prefixed metadata attributes, decodes the
//! rest to plain JSON (integers prefer i64, then f64), and publishes an
//! entry with the record's `_typ` as the detail type.
//!
//! # Configuration
//!
//! | Variable | Description |
//! |----------|-------------|
//! | `EVENT_BUS_NAME` | Bus to publish to (required) |
//! | `EVENT_SOURCE_NAME` | Source stamped on every entry (required) |

use async_trait::async_trait;
use aws_sdk_eventbridge::types::PutEventsRequestEntry;
use aws_sdk_eventbridge::Client;
use serde_json::Value;
use tracing::{debug, info};

use crate::codec::{self, CodecError, Item};

/// Maximum number of entries per publish batch.
pub const MAX_BATCH_ENTRIES: usize = 10;

/// Maximum cumulative entry size per publish batch, in bytes.
pub const MAX_BATCH_BYTES: usize = 256 * 1024;

/// Errors from the bridge.
#[derive(Debug, thiserror::Error)]
pub enum BridgeError {
    #[error("missing {0} environment variable")]
    MissingEnv(&'static str),

    #[error("entry {index} is {size} bytes, larger than the maximum allowed size of {MAX_BATCH_BYTES} bytes")]
    EntryTooLarge { index: usize, size: usize },

    #[error(transparent)]
    Codec(#[from] CodecError),

    #[error("failed to serialize detail: {0}")]
    Detail(String),

    #[error("failed to send events: {0}")]
    Publish(String),

    #[error("failed to send {0} events")]
    FailedEntries(i32),
}

/// Names of the environment variables [`BridgeConfig::from_env`] reads.
pub const ENV_EVENT_BUS_NAME: &str = "EVENT_BUS_NAME";
pub const ENV_EVENT_SOURCE_NAME: &str = "EVENT_SOURCE_NAME";

/// Bridge configuration: where entries go and who they come from.
#[derive(Debug, Clone)]
pub struct BridgeConfig {
    pub bus_name: String,
    pub source_name: String,
}

impl BridgeConfig {
    pub fn new(bus_name: impl Into<String>, source_name: impl Into<String>) -> Self {
        Self {
            bus_name: bus_name.into(),
            source_name: source_name.into(),
        }
    }

    /// Read the configuration from the environment. A missing or empty
    /// variable is a startup error.
    pub fn from_env() -> Result<Self, BridgeError> {
        let bus_name = std::env::var(ENV_EVENT_BUS_NAME)
            .ok()
            .filter(|v| !v.is_empty())
            .ok_or(BridgeError::MissingEnv(ENV_EVENT_BUS_NAME))?;
        let source_name = std::env::var(ENV_EVENT_SOURCE_NAME)
            .ok()
            .filter(|v| !v.is_empty())
            .ok_or(BridgeError::MissingEnv(ENV_EVENT_SOURCE_NAME))?;
        Ok(Self::new(bus_name, source_name))
    }
}

/// The publish seam, implemented by the EventBridge client and by test
/// doubles. Returns the service-reported failed entry count.
#[async_trait]
pub trait PutEventsApi: Send + Sync {
    async fn put_events(&self, entries: Vec<PutEventsRequestEntry>) -> Result<i32, BridgeError>;
}

#[async_trait]
impl PutEventsApi for Client {
    async fn put_events(&self, entries: Vec<PutEventsRequestEntry>) -> Result<i32, BridgeError> {
        let output = Client::put_events(self)
            .set_entries(Some(entries))
            .send()
            .await
            .map_err(|e| BridgeError::Publish(format!("{e}")))?;
        Ok(output.failed_entry_count())
    }
}

/// Change-stream to EventBridge bridge.
pub struct Bridge<C> {
    client: C,
    config: BridgeConfig,
}

impl<C: PutEventsApi> Bridge<C> {
    pub fn new(client: C, config: BridgeConfig) -> Self {
        Self { client, config }
    }

    /// Publish the outbound records found in a batch of new images.
    ///
    /// Returns the number of entries published. A partial-batch failure
    /// propagates as [`BridgeError::FailedEntries`]; entries are not
    /// retried here.
    pub async fn handle(&self, images: Vec<Item>) -> Result<usize, BridgeError> {
        info!(count = images.len(), "processing records");
        let mut entries = Vec::new();
        for image in &images {
            let Some(entry) = self.entry_for_image(image)? else {
                continue;
            };
            let id = image
                .get("_pk")
                .and_then(|v| v.as_s().ok())
                .map(String::as_str)
                .unwrap_or_default();
            debug!(
                id = %id,
                event_type = entry.detail_type().unwrap_or_default(),
                "found outbound event"
            );
            entries.push(entry);
        }
        let sent = entries.len();
        let batches = batch(entries)?;
        let total = batches.len();
        for (i, page) in batches.into_iter().enumerate() {
            info!(batch = i + 1, n = total, "sending batch");
            let failed = self.client.put_events(page).await?;
            if failed > 0 {
                return Err(BridgeError::FailedEntries(failed));
            }
        }
        info!(sent, "complete");
        Ok(sent)
    }

    /// Build the publish entry for one new image, or `None` when the image
    /// is not an outbound record.
    pub fn entry_for_image(&self, image: &Item) -> Result<Option<PutEventsRequestEntry>, BridgeError> {
        let Some(sort_key) = image.get("_sk").and_then(|v| v.as_s().ok()) else {
            return Ok(None);
        };
        if !sort_key.starts_with("OUTBOUND/") {
            return Ok(None);
        }
        let Some(detail_type) = image.get("_typ").and_then(|v| v.as_s().ok()) else {
            return Ok(None);
        };

        let mut detail = serde_json::Map::new();
        for (name, value) in image {
            if name.starts_with('_') {
                continue;
            }
            detail.insert(name.clone(), codec::from_attribute(value)?);
        }
        let detail = serde_json::to_string(&Value::Object(detail))
            .map_err(|e| BridgeError::Detail(e.to_string()))?;

        Ok(Some(
            PutEventsRequestEntry::builder()
                .source(&self.config.source_name)
                .detail_type(detail_type)
                .detail(detail)
                .event_bus_name(&self.config.bus_name)
                .build(),
        ))
    }
}

/// Size of one entry as EventBridge counts it.
pub fn entry_size(entry: &PutEventsRequestEntry) -> usize {
    let mut size = 0;
    if entry.time().is_some() {
        size += 14;
    }
    size += entry.source().map(str::len).unwrap_or(0);
    size += entry.detail_type().map(str::len).unwrap_or(0);
    size += entry.detail().map(str::len).unwrap_or(0);
    size += entry.resources().iter().map(String::len).sum::<usize>();
    size
}

/// Split entries into publishable batches of at most
/// [`MAX_BATCH_ENTRIES`] entries and under [`MAX_BATCH_BYTES`] cumulative
/// bytes. A single entry over the limit is an error before anything is
/// sent.
pub fn batch(
    values: Vec<PutEventsRequestEntry>,
) -> Result<Vec<Vec<PutEventsRequestEntry>>, BridgeError> {
    let mut pages = Vec::new();
    let mut batch_from = 0;
    let mut batch_size = 0;
    for (i, entry) in values.iter().enumerate() {
        let size = entry_size(entry);
        if size > MAX_BATCH_BYTES {
            return Err(BridgeError::EntryTooLarge { index: i, size });
        }
        if batch_size + size >= MAX_BATCH_BYTES || i - batch_from == MAX_BATCH_ENTRIES {
            pages.push(values[batch_from..i].to_vec());
            batch_from = i;
            batch_size = 0;
        }
        batch_size += size;
    }
    if batch_from < values.len() {
        pages.push(values[batch_from..].to_vec());
    }
    Ok(pages)
}
