//! Read-through/write-through data access tier for the market-analysis
//! pipeline.
//!
//! Requests arrive on Redis streams through a consumer group. Fetched data
//! is written to the document store, read requests are answered from it,
//! and read misses are forwarded to the updater. The same store backs the
//! HTTP table API, which deduplicates rows before appending them.

pub mod broker;
pub mod codec;
pub mod config;
pub mod consumer;
pub mod dedup;
pub mod error;
pub mod handler;
pub mod metrics;
pub mod producer;
pub mod redis_broker;
pub mod store;
pub mod surreal_store;
pub mod tables;
pub mod telemetry;
pub mod testing;

pub use broker::{StreamBroker, StreamEntry, StreamRead};
pub use codec::{decode, encode, DecodedMessage, Document, MessageType, ReadParams, Request, StreamMessage};
pub use config::{load_config, BrokerConfig, Config, ConsumerSettings, StoreConfig};
pub use consumer::GroupConsumer;
pub use error::{BrokerError, DecodeError, StoreError, SyncError};
pub use handler::{Disposition, RequestHandler};
pub use metrics::SyncMetrics;
pub use producer::Producer;
pub use redis_broker::RedisBroker;
pub use store::{DocumentStore, FindQuery, Namespace, TableStore};
pub use surreal_store::SurrealStore;
pub use tables::{TableService, Trace, WriteOutcome};
