//! Repository layer for database access.
//!
//! Each repository is a trait with a SQLx-backed implementation so the
//! pipeline can be exercised against any store that honours the same
//! single-row update semantics.

pub mod archive;
pub mod channel;
pub mod signal;
pub mod vod;

pub use archive::*;
pub use channel::*;
pub use signal::*;
pub use vod::*;

use crate::database::models::ArchiveContext;
use crate::{Error, Result};

/// Load an archive record together with its VOD and channel.
///
/// Returns `None` when the record was deleted, e.g. by compensation.
pub async fn load_archive_context(
    archives: &dyn ArchiveRepository,
    vods: &dyn VodRepository,
    channels: &dyn ChannelRepository,
    archive_id: &str,
) -> Result<Option<ArchiveContext>> {
    let Some(record) = archives.find(archive_id).await? else {
        return Ok(None);
    };
    let vod = vods
        .find(&record.vod_id)
        .await?
        .ok_or_else(|| Error::not_found("Vod", &record.vod_id))?;
    let channel = channels
        .find(&vod.channel_id)
        .await?
        .ok_or_else(|| Error::not_found("Channel", &vod.channel_id))?;
    Ok(Some(ArchiveContext {
        record,
        vod,
        channel,
    }))
}
