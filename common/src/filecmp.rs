use std::os::unix::fs::MetadataExt;
use tracing::instrument;

use anyhow::{anyhow, Result};

/// Which metadata fields decide that a destination file is "unchanged".
#[derive(Copy, Clone, Debug, Default)]
pub struct MetadataCmpSettings {
    pub uid: bool,
    pub gid: bool,
    pub size: bool,
    pub mtime: bool,
    pub ctime: bool,
}

/// Parses a comma separated field list, e.g. `"size,mtime"`.
pub fn parse_metadata_cmp_settings(settings: &str) -> Result<MetadataCmpSettings> {
    let mut metadata_cmp_settings = MetadataCmpSettings::default();
    for field in settings.split(',') {
        match field.trim() {
            "uid" => metadata_cmp_settings.uid = true,
            "gid" => metadata_cmp_settings.gid = true,
            "size" => metadata_cmp_settings.size = true,
            "mtime" => metadata_cmp_settings.mtime = true,
            "ctime" => metadata_cmp_settings.ctime = true,
            _ => return Err(anyhow!("unknown metadata field to compare: {:?}", field)),
        }
    }
    Ok(metadata_cmp_settings)
}

#[instrument]
pub fn metadata_equal(
    settings: &MetadataCmpSettings,
    metadata1: &std::fs::Metadata,
    metadata2: &std::fs::Metadata,
) -> bool {
    if settings.uid && metadata1.uid() != metadata2.uid() {
        return false;
    }
    if settings.gid && metadata1.gid() != metadata2.gid() {
        return false;
    }
    if settings.size && metadata1.size() != metadata2.size() {
        return false;
    }
    if settings.mtime {
        if metadata1.mtime() != metadata2.mtime() {
            return false;
        }
        // some filesystems do not support nanosecond precision, so we only compare nanoseconds if both files have them
        if metadata1.mtime_nsec() != 0
            && metadata2.mtime_nsec() != 0
            && metadata1.mtime_nsec() != metadata2.mtime_nsec()
        {
            return false;
        }
    }
    if settings.ctime {
        if metadata1.ctime() != metadata2.ctime() {
            return false;
        }
        if metadata1.ctime_nsec() != 0
            && metadata2.ctime_nsec() != 0
            && metadata1.ctime_nsec() != metadata2.ctime_nsec()
        {
            return false;
        }
    }
    true
}
