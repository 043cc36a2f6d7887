pub mod ndjson;

pub use ndjson::NdjsonSource;
