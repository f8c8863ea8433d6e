//! FLV container reading and writing
//!
//! Recordings are FLV files whose video tags carry one JPEG image each
//! (codec id 1). The same tag layout is used to hand encoded frames to the
//! broadcast publisher.
//!
//! FLV Tag Structure:
//! ```text
//! +--------+-------------+-----------+-------------+---------+---------------+
//! | Type(1)| DataSize(3) | TS(3+1)   | StreamID(3) | Data(N) | PrevTagSize(4)|
//! +--------+-------------+-----------+-------------+---------+---------------+
//! ```
//!
//! Video Data:
//! ```text
//! +----------+----------+
//! | FrameType| CodecID  | CodecData...
//! | (4 bits) | (4 bits) |
//! +----------+----------+
//! ```

use std::io::{self, Read, Seek, SeekFrom};

use bytes::{BufMut, Bytes, BytesMut};

/// Size of the file header, without the first PreviousTagSize
pub const FLV_HEADER_SIZE: usize = 9;

/// Size of a tag header
pub const TAG_HEADER_SIZE: usize = 11;

/// FLV tag type
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FlvTagType {
    Audio,
    Video,
    Script,
}

impl FlvTagType {
    pub fn from_byte(b: u8) -> Option<Self> {
        match b & 0x1F {
            8 => Some(FlvTagType::Audio),
            9 => Some(FlvTagType::Video),
            18 => Some(FlvTagType::Script),
            _ => None,
        }
    }

    pub fn as_byte(self) -> u8 {
        match self {
            FlvTagType::Audio => 8,
            FlvTagType::Video => 9,
            FlvTagType::Script => 18,
        }
    }
}

/// Parsed FLV tag
#[derive(Debug, Clone)]
pub struct FlvTag {
    /// Tag type
    pub tag_type: FlvTagType,
    /// Timestamp in milliseconds
    pub timestamp: u32,
    /// Raw tag data (including the codec byte for video)
    pub data: Bytes,
}

impl FlvTag {
    /// Build a video tag from a codec payload
    pub fn video(timestamp: u32, codec: VideoCodec, keyframe: bool, payload: &[u8]) -> Self {
        let frame_type = if keyframe {
            VideoFrameType::Keyframe
        } else {
            VideoFrameType::InterFrame
        };
        let mut data = BytesMut::with_capacity(payload.len() + 1);
        data.put_u8(((frame_type as u8) << 4) | codec as u8);
        data.put_slice(payload);
        Self {
            tag_type: FlvTagType::Video,
            timestamp,
            data: data.freeze(),
        }
    }

    /// Build a script data tag
    pub fn script(timestamp: u32, data: Bytes) -> Self {
        Self {
            tag_type: FlvTagType::Script,
            timestamp,
            data,
        }
    }

    pub fn is_video(&self) -> bool {
        self.tag_type == FlvTagType::Video
    }

    /// Video codec of this tag, if it is a video tag
    pub fn video_codec(&self) -> Option<VideoCodec> {
        if !self.is_video() {
            return None;
        }
        self.data.first().and_then(|b| VideoCodec::from_byte(*b))
    }

    /// Codec payload without the leading frame type/codec byte
    pub fn video_payload(&self) -> Bytes {
        if self.is_video() && !self.data.is_empty() {
            self.data.slice(1..)
        } else {
            Bytes::new()
        }
    }

    /// Serialize tag header, data and trailing PreviousTagSize
    pub fn encode(&self) -> Bytes {
        let size = self.data.len();
        let mut buf = BytesMut::with_capacity(TAG_HEADER_SIZE + size + 4);
        buf.put_u8(self.tag_type.as_byte());
        put_u24(&mut buf, size as u32);
        put_u24(&mut buf, self.timestamp & 0x00FF_FFFF);
        buf.put_u8((self.timestamp >> 24) as u8);
        put_u24(&mut buf, 0);
        buf.put_slice(&self.data);
        buf.put_u32((TAG_HEADER_SIZE + size) as u32);
        buf.freeze()
    }
}

/// Video frame type (upper 4 bits of first byte)
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum VideoFrameType {
    /// Keyframe
    Keyframe = 1,
    /// Inter frame
    InterFrame = 2,
    /// Disposable inter frame (H.263 only)
    DisposableInterFrame = 3,
}

/// Video codec ID (lower 4 bits of first byte)
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum VideoCodec {
    /// JPEG still images
    Jpeg = 1,
    /// Sorenson H.263, what ffmpeg's `flv1` encoder emits
    SorensonH263 = 2,
    /// Screen video
    ScreenVideo = 3,
    /// VP6
    Vp6 = 4,
    /// AVC (H.264)
    Avc = 7,
}

impl VideoCodec {
    pub fn from_byte(b: u8) -> Option<Self> {
        match b & 0x0F {
            1 => Some(VideoCodec::Jpeg),
            2 => Some(VideoCodec::SorensonH263),
            3 => Some(VideoCodec::ScreenVideo),
            4 => Some(VideoCodec::Vp6),
            7 => Some(VideoCodec::Avc),
            _ => None,
        }
    }
}

/// Encode the file header followed by PreviousTagSize0
pub fn encode_header(has_video: bool, has_audio: bool) -> [u8; FLV_HEADER_SIZE + 4] {
    let mut flags = 0u8;
    if has_audio {
        flags |= 0x04;
    }
    if has_video {
        flags |= 0x01;
    }
    [
        b'F', b'L', b'V', 1, flags, 0, 0, 0, FLV_HEADER_SIZE as u8, 0, 0, 0, 0,
    ]
}

fn put_u24(buf: &mut BytesMut, v: u32) {
    buf.put_u8((v >> 16) as u8);
    buf.put_u8((v >> 8) as u8);
    buf.put_u8(v as u8);
}

fn read_u24(b: &[u8]) -> u32 {
    ((b[0] as u32) << 16) | ((b[1] as u32) << 8) | b[2] as u32
}

/// Seek point of a video tag inside a file
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct IndexEntry {
    pub timestamp: u32,
    pub offset: u64,
}

/// Sequential FLV tag reader
pub struct FlvReader<R> {
    inner: R,
    position: u64,
}

impl<R: Read> FlvReader<R> {
    pub fn new(inner: R) -> Self {
        Self { inner, position: 0 }
    }

    /// Read and validate the file header, returning (has_video, has_audio)
    pub fn read_header(&mut self) -> io::Result<(bool, bool)> {
        let mut header = [0u8; FLV_HEADER_SIZE];
        self.inner.read_exact(&mut header)?;
        if &header[0..3] != b"FLV" {
            return Err(io::Error::new(io::ErrorKind::InvalidData, "not an FLV stream"));
        }
        let data_offset = u32::from_be_bytes([header[5], header[6], header[7], header[8]]) as u64;
        if data_offset < FLV_HEADER_SIZE as u64 {
            return Err(io::Error::new(io::ErrorKind::InvalidData, "bad FLV header size"));
        }
        // Skip any extended header plus PreviousTagSize0
        let skip = data_offset - FLV_HEADER_SIZE as u64 + 4;
        io::copy(&mut (&mut self.inner).take(skip), &mut io::sink())?;
        self.position = data_offset + 4;
        Ok((header[4] & 0x01 != 0, header[4] & 0x04 != 0))
    }

    /// Offset of the next tag
    pub fn position(&self) -> u64 {
        self.position
    }

    /// Read the next tag. Returns `None` on a clean end of stream.
    pub fn read_tag(&mut self) -> io::Result<Option<FlvTag>> {
        loop {
            let mut header = [0u8; TAG_HEADER_SIZE];
            match read_full(&mut self.inner, &mut header)? {
                0 => return Ok(None),
                n if n < TAG_HEADER_SIZE => {
                    return Err(io::ErrorKind::UnexpectedEof.into());
                }
                _ => {}
            }

            let size = read_u24(&header[1..4]) as usize;
            let timestamp = read_u24(&header[4..7]) | ((header[7] as u32) << 24);

            let mut data = vec![0u8; size];
            self.inner.read_exact(&mut data)?;
            let mut prev = [0u8; 4];
            self.inner.read_exact(&mut prev)?;
            self.position += (TAG_HEADER_SIZE + size + 4) as u64;

            // Unknown tag types are skipped
            if let Some(tag_type) = FlvTagType::from_byte(header[0]) {
                return Ok(Some(FlvTag {
                    tag_type,
                    timestamp,
                    data: Bytes::from(data),
                }));
            }
        }
    }

    /// Read tags until the next video tag
    pub fn read_video_tag(&mut self) -> io::Result<Option<FlvTag>> {
        while let Some(tag) = self.read_tag()? {
            if tag.is_video() {
                return Ok(Some(tag));
            }
        }
        Ok(None)
    }

    pub fn into_inner(self) -> R {
        self.inner
    }
}

impl<R: Read + Seek> FlvReader<R> {
    /// Scan the remaining tags and record the offset of every video tag.
    ///
    /// The reader is left positioned where it started.
    pub fn build_index(&mut self) -> io::Result<Vec<IndexEntry>> {
        let start = self.position;
        let mut index = Vec::new();
        loop {
            let offset = self.position;
            match self.read_tag() {
                Ok(Some(tag)) if tag.is_video() => index.push(IndexEntry {
                    timestamp: tag.timestamp,
                    offset,
                }),
                Ok(Some(_)) => {}
                Ok(None) => break,
                // A truncated trailing tag is expected in an unfinished recording
                Err(e) if e.kind() == io::ErrorKind::UnexpectedEof => break,
                Err(e) => return Err(e),
            }
        }
        self.seek_to(start)?;
        Ok(index)
    }

    /// Position the reader at a tag offset
    pub fn seek_to(&mut self, offset: u64) -> io::Result<()> {
        self.inner.seek(SeekFrom::Start(offset))?;
        self.position = offset;
        Ok(())
    }
}

/// Like `read_exact`, but reports how many bytes were read before EOF
fn read_full<R: Read>(reader: &mut R, buf: &mut [u8]) -> io::Result<usize> {
    let mut filled = 0;
    while filled < buf.len() {
        match reader.read(&mut buf[filled..]) {
            Ok(0) => break,
            Ok(n) => filled += n,
            Err(e) if e.kind() == io::ErrorKind::Interrupted => {}
            Err(e) => return Err(e),
        }
    }
    Ok(filled)
}
