pub mod dict;
pub mod events;

pub use dict::{DictKey, DictSink, DictValue, FileDictSink, SharedDictSink};
pub use events::{EventSink, SharedEventSink, SqliteEventSink};
