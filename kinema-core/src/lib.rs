pub mod asset;
pub mod database;
pub mod error;
pub mod layout;
pub mod media;
pub mod probe;
pub mod scanner;

pub use asset::{is_transcoded, DONE_MARKER, MIN_SEGMENTS_FOR_DONE, TRANSCODING_MARKER};
pub use database::{MediaKind, MediaRecord, MemoryMetadataStore, MetadataStore};
pub use error::{Result, TranscodeError};
pub use layout::{output_dir, safe_name};
pub use media::MediaFile;
pub use probe::{AudioTrack, Prober, StreamInfo, SubtitleTrack};
pub use scanner::{MediaScanner, ScanResult};
