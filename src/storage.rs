//! Recorded video storage layout
//!
//! `<folder>/<video_id>.flv` holds the recording and
//! `<folder>/<video_id>.flv.md` holds its duration in milliseconds as a
//! single integer.

use std::io;
use std::path::{Path, PathBuf};

use crate::session::state::RecordingErrorCode;

/// Container extension of recordings
pub const VIDEO_EXTENSION: &str = "flv";

/// Sidecar extension appended to the video file name
pub const METADATA_EXTENSION: &str = "md";

/// Paths and metadata of saved videos
#[derive(Debug, Clone)]
pub struct VideoStore {
    folder: PathBuf,
}

impl VideoStore {
    pub fn new(folder: impl Into<PathBuf>) -> Self {
        Self {
            folder: folder.into(),
        }
    }

    pub fn folder(&self) -> &Path {
        &self.folder
    }

    /// Create the folder if needed
    pub async fn ensure_folder(&self) -> io::Result<()> {
        tokio::fs::create_dir_all(&self.folder).await
    }

    /// Ids are plain file stems; anything that could escape the folder is
    /// treated as an unknown video
    pub fn validate_id(video_id: &str) -> Result<(), RecordingErrorCode> {
        let bad = video_id.is_empty()
            || video_id.contains(['/', '\\', '\0'])
            || video_id.contains("..");
        if bad {
            Err(RecordingErrorCode::VideoNotFound)
        } else {
            Ok(())
        }
    }

    pub fn video_path(&self, video_id: &str) -> Result<PathBuf, RecordingErrorCode> {
        Self::validate_id(video_id)?;
        Ok(self
            .folder
            .join(format!("{}.{}", video_id, VIDEO_EXTENSION)))
    }

    pub fn metadata_path(&self, video_id: &str) -> Result<PathBuf, RecordingErrorCode> {
        let video = self.video_path(video_id)?;
        Ok(metadata_path_for(&video))
    }

    pub async fn exists(&self, video_id: &str) -> bool {
        match self.video_path(video_id) {
            Ok(path) => tokio::fs::try_exists(&path).await.unwrap_or(false),
            Err(_) => false,
        }
    }

    /// Duration recorded in the sidecar
    pub async fn read_duration(&self, video_id: &str) -> Result<i64, RecordingErrorCode> {
        if !self.exists(video_id).await {
            return Err(RecordingErrorCode::VideoNotFound);
        }
        let md = self.metadata_path(video_id)?;
        let content = tokio::fs::read_to_string(&md)
            .await
            .map_err(|_| RecordingErrorCode::MetadataNotFound)?;
        content
            .trim()
            .parse::<i64>()
            .map_err(|_| RecordingErrorCode::MetadataNotFound)
    }

    /// Remove a video and its sidecar
    pub async fn delete(&self, video_id: &str) -> Result<(), RecordingErrorCode> {
        let video = self.video_path(video_id)?;
        tokio::fs::remove_file(&video).await.map_err(|e| {
            if e.kind() == io::ErrorKind::NotFound {
                RecordingErrorCode::VideoNotFound
            } else {
                tracing::warn!(path = %video.display(), error = %e, "Failed to delete video");
                RecordingErrorCode::Unknown
            }
        })?;

        let md = metadata_path_for(&video);
        if let Err(e) = tokio::fs::remove_file(&md).await {
            if e.kind() != io::ErrorKind::NotFound {
                tracing::warn!(path = %md.display(), error = %e, "Failed to delete video metadata");
            }
        }
        tracing::info!(path = %video.display(), "Video deleted");
        Ok(())
    }
}

pub fn metadata_path_for(video: &Path) -> PathBuf {
    let mut name = video.as_os_str().to_owned();
    name.push(".");
    name.push(METADATA_EXTENSION);
    PathBuf::from(name)
}

/// Rewrite the sidecar with the current duration
pub async fn write_duration(metadata: &Path, duration_ms: i64) -> io::Result<()> {
    tokio::fs::write(metadata, duration_ms.to_string()).await
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_rejects_path_escapes() {
        assert!(VideoStore::validate_id("flight_01").is_ok());
        for id in ["", "../etc/passwd", "a/b", "a\\b", ".."] {
            assert_eq!(
                VideoStore::validate_id(id),
                Err(RecordingErrorCode::VideoNotFound),
                "{id}"
            );
        }
    }

    #[test]
    fn test_paths() {
        let store = VideoStore::new("/data/videos");
        assert_eq!(
            store.video_path("x").unwrap(),
            PathBuf::from("/data/videos/x.flv")
        );
        assert_eq!(
            store.metadata_path("x").unwrap(),
            PathBuf::from("/data/videos/x.flv.md")
        );
    }

    #[tokio::test]
    async fn test_duration_and_delete() {
        let dir = tempfile::tempdir().unwrap();
        let store = VideoStore::new(dir.path());

        assert_eq!(
            store.read_duration("v").await,
            Err(RecordingErrorCode::VideoNotFound)
        );

        tokio::fs::write(store.video_path("v").unwrap(), b"FLV").await.unwrap();
        assert_eq!(
            store.read_duration("v").await,
            Err(RecordingErrorCode::MetadataNotFound)
        );

        write_duration(&store.metadata_path("v").unwrap(), 1234).await.unwrap();
        assert_eq!(store.read_duration("v").await, Ok(1234));

        store.delete("v").await.unwrap();
        assert!(!store.exists("v").await);
        assert!(!store.metadata_path("v").unwrap().exists());
        assert_eq!(store.delete("v").await, Err(RecordingErrorCode::VideoNotFound));
    }
}
