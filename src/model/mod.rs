pub mod events;
pub mod log;

pub use events::{
    Event, GroupEvents, GroupInfo, BODY_KEY, FILE_OFFSET_KEY, META_SOURCE, META_TOPIC,
};
pub use log::{Batch, LogContent, LogTag, Record, RecordContext, RecordWithContext, TAG_PREFIX};
