pub mod metadata;
pub mod sample;
pub mod setting;

pub use metadata::SourceMetadata;
pub use sample::{epoch_millis, from_epoch_millis, Sample, SampleType};
pub use setting::{decode_timestamp, encode_timestamp, Setting, SettingFlag};
