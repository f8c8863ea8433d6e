//! `onMetaData` script tag encoding
//!
//! Only the AMF0 subset needed to describe a recording is produced:
//! a String name followed by an ECMA array of numbers, strings and booleans.

use bytes::{BufMut, Bytes, BytesMut};

const MARKER_NUMBER: u8 = 0x00;
const MARKER_BOOLEAN: u8 = 0x01;
const MARKER_STRING: u8 = 0x02;
const MARKER_ECMA_ARRAY: u8 = 0x08;
const OBJECT_END: [u8; 3] = [0x00, 0x00, 0x09];

/// A metadata property value
#[derive(Debug, Clone, PartialEq)]
pub enum MetaValue {
    Number(f64),
    Boolean(bool),
    String(String),
}

/// Ordered `onMetaData` property list
#[derive(Debug, Clone, Default)]
pub struct StreamMetadata {
    properties: Vec<(String, MetaValue)>,
}

impl StreamMetadata {
    pub fn new() -> Self {
        Self::default()
    }

    /// Metadata for a JPEG-in-FLV recording of the given geometry
    pub fn for_video(width: u32, height: u32) -> Self {
        let mut meta = Self::new()
            .number("videocodecid", 1.0)
            .string("encoder", "vstreamer");
        if width > 0 && height > 0 {
            meta = meta.number("width", width as f64).number("height", height as f64);
        }
        meta.boolean("hasAudio", false)
    }

    pub fn number(mut self, key: &str, value: f64) -> Self {
        self.properties.push((key.to_string(), MetaValue::Number(value)));
        self
    }

    pub fn boolean(mut self, key: &str, value: bool) -> Self {
        self.properties.push((key.to_string(), MetaValue::Boolean(value)));
        self
    }

    pub fn string(mut self, key: &str, value: &str) -> Self {
        self.properties
            .push((key.to_string(), MetaValue::String(value.to_string())));
        self
    }

    pub fn get(&self, key: &str) -> Option<&MetaValue> {
        self.properties.iter().find(|(k, _)| k == key).map(|(_, v)| v)
    }

    /// Encode as the body of an FLV script tag
    pub fn encode(&self) -> Bytes {
        let mut buf = BytesMut::with_capacity(64 + self.properties.len() * 24);
        buf.put_u8(MARKER_STRING);
        write_utf8(&mut buf, "onMetaData");

        buf.put_u8(MARKER_ECMA_ARRAY);
        buf.put_u32(self.properties.len() as u32);
        for (key, value) in &self.properties {
            write_utf8(&mut buf, key);
            match value {
                MetaValue::Number(n) => {
                    buf.put_u8(MARKER_NUMBER);
                    buf.put_f64(*n);
                }
                MetaValue::Boolean(b) => {
                    buf.put_u8(MARKER_BOOLEAN);
                    buf.put_u8(*b as u8);
                }
                MetaValue::String(s) => {
                    buf.put_u8(MARKER_STRING);
                    write_utf8(&mut buf, s);
                }
            }
        }
        buf.put_slice(&OBJECT_END);
        buf.freeze()
    }
}

fn write_utf8(buf: &mut BytesMut, s: &str) {
    let bytes = s.as_bytes();
    let len = bytes.len().min(u16::MAX as usize);
    buf.put_u16(len as u16);
    buf.put_slice(&bytes[..len]);
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_encode_layout() {
        let encoded = StreamMetadata::new().number("width", 640.0).encode();

        assert_eq!(encoded[0], MARKER_STRING);
        assert_eq!(&encoded[1..3], &[0, 10]);
        assert_eq!(&encoded[3..13], b"onMetaData");
        assert_eq!(encoded[13], MARKER_ECMA_ARRAY);
        assert_eq!(&encoded[14..18], &1u32.to_be_bytes());
        assert_eq!(&encoded[18..20], &[0, 5]);
        assert_eq!(&encoded[20..25], b"width");
        assert_eq!(encoded[25], MARKER_NUMBER);
        assert_eq!(&encoded[26..34], &640.0f64.to_be_bytes());
        assert_eq!(&encoded[34..], &OBJECT_END);
    }

    #[test]
    fn test_video_metadata_skips_unknown_geometry() {
        let meta = StreamMetadata::for_video(0, 0);
        assert!(meta.get("width").is_none());
        assert_eq!(meta.get("videocodecid"), Some(&MetaValue::Number(1.0)));

        let meta = StreamMetadata::for_video(320, 240);
        assert_eq!(meta.get("height"), Some(&MetaValue::Number(240.0)));
    }
}
