pub mod adapter;
pub mod aggregator;
pub mod events;
pub mod json_stream;
pub mod manager;
pub mod processor;

pub use adapter::StreamAdapter;
pub use aggregator::{UsageAggregator, UsageEstimate, create_usage_aggregator};
pub use events::{EventMeta, StreamDelta, StreamEvent};
pub use json_stream::JsonStreamHandler;
pub use manager::EventManager;
pub use processor::EventProcessor;
