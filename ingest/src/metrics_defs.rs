use shared::metrics_defs::{MetricDef, MetricType};

pub const CONSUMER_MESSAGES: MetricDef = MetricDef {
    name: "consumer.messages",
    metric_type: MetricType::Counter,
    description: "Messages finished by a consumer worker. Tagged with topic, outcome (acked, requeued).",
};

pub const CONSUMER_DROPPED: MetricDef = MetricDef {
    name: "consumer.dropped",
    metric_type: MetricType::Counter,
    description: "Messages acknowledged without being stored. Tagged with topic, reason.",
};

pub const CONSUMER_CONNECT_ATTEMPTS: MetricDef = MetricDef {
    name: "consumer.connect.attempts",
    metric_type: MetricType::Counter,
    description: "Broker subscription attempts. Tagged with topic, status.",
};

pub const BATCHER_FLUSH_SIZE: MetricDef = MetricDef {
    name: "batcher.flush.size",
    metric_type: MetricType::Histogram,
    description: "Number of items per flush. Tagged with batcher.",
};

pub const BATCHER_FLUSH_DURATION: MetricDef = MetricDef {
    name: "batcher.flush.duration",
    metric_type: MetricType::Histogram,
    description: "Flush duration in seconds. Tagged with batcher.",
};

pub const BATCHER_FLUSH_FAILURES: MetricDef = MetricDef {
    name: "batcher.flush.failures",
    metric_type: MetricType::Counter,
    description: "Flushes that failed or timed out. Tagged with batcher.",
};

pub const STORE_ROWS_OFFERED: MetricDef = MetricDef {
    name: "store.rows.offered",
    metric_type: MetricType::Counter,
    description: "Rows handed to the store, including duplicates. Tagged with table.",
};

pub const STORE_TRACK_EVENTS_NEW: MetricDef = MetricDef {
    name: "store.track_events.new",
    metric_type: MetricType::Counter,
    description: "Track events that were newly inserted and added to the daily rollup",
};

pub const PRODUCER_PUBLISH: MetricDef = MetricDef {
    name: "producer.publish",
    metric_type: MetricType::Counter,
    description: "Broker messages published. Tagged with topic, status.",
};

pub const ALL_METRICS: &[MetricDef] = &[
    CONSUMER_MESSAGES,
    CONSUMER_DROPPED,
    CONSUMER_CONNECT_ATTEMPTS,
    BATCHER_FLUSH_SIZE,
    BATCHER_FLUSH_DURATION,
    BATCHER_FLUSH_FAILURES,
    STORE_ROWS_OFFERED,
    STORE_TRACK_EVENTS_NEW,
    PRODUCER_PUBLISH,
];
