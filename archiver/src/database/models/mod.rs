//! Database models.

pub mod archive;
pub mod channel;
pub mod vod;

pub use archive::*;
pub use channel::*;
pub use vod::*;

/// An archive record together with the rows it references.
///
/// Loaded on demand for the duration of one operation; nothing keeps these
/// rows linked in memory.
#[derive(Debug, Clone)]
pub struct ArchiveContext {
    pub record: ArchiveRecordDbModel,
    pub vod: VodDbModel,
    pub channel: ChannelDbModel,
}
