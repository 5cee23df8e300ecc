pub mod time;

pub use time::{
    parse_iso, timestamp_from_json, to_iso, Clock, IdGenerator, ManualClock, SequentialIds,
    SystemClock, UuidGenerator,
};
