//! Media handling
//!
//! This module provides:
//! - FLV tag parsing and generation
//! - `onMetaData` script tag encoding
//! - JPEG frame splitting for MJPEG pipes

pub mod flv;
pub mod jpeg;
pub mod metadata;

pub use flv::{FlvReader, FlvTag, FlvTagType, VideoCodec};
pub use jpeg::JpegSplitter;
pub use metadata::StreamMetadata;
