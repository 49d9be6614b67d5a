pub mod record;
pub mod registry;
pub mod statistics;

pub use record::{Counter, Gauge, Latency, MetricRecord, MetricSnapshot};
pub use registry::MetricRegistry;
pub use statistics::PipelineStatistics;

pub const LABEL_PROJECT: &str = "project";
pub const LABEL_LOGSTORE: &str = "logstore";
pub const LABEL_CONFIG_NAME: &str = "config_name";
pub const LABEL_PLUGIN_TYPE: &str = "plugin_type";
pub const LABEL_PLUGIN_ID: &str = "plugin_id";

pub const PROC_IN_RECORDS_TOTAL: &str = "proc_in_records_total";
pub const PROC_OUT_RECORDS_TOTAL: &str = "proc_out_records_total";
pub const PROC_TIME_MS: &str = "proc_time_ms";

pub const FLUSHER_IN_RECORDS_TOTAL: &str = "flusher_in_records_total";
pub const FLUSHER_IN_RECORDS_SIZE_BYTES: &str = "flusher_in_records_size_bytes";
pub const FLUSHER_DISCARD_RECORDS_TOTAL: &str = "flusher_discard_records_total";
pub const FLUSHER_ERROR_TOTAL: &str = "flusher_error_total";
pub const FLUSHER_COST_TIME_MS: &str = "flusher_cost_time_ms";
