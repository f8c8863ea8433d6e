//! Splitting a concatenated MJPEG byte stream into JPEG images
//!
//! ffmpeg's `mjpeg` muxer writes images back to back with no framing, so
//! frames are delimited by the SOI (`FF D8`) and EOI (`FF D9`) markers.

use bytes::{Buf, Bytes, BytesMut};

const SOI: [u8; 2] = [0xFF, 0xD8];
const EOI: [u8; 2] = [0xFF, 0xD9];

/// Incremental JPEG frame splitter
#[derive(Debug)]
pub struct JpegSplitter {
    buffer: BytesMut,
    max_frame_size: usize,
}

impl JpegSplitter {
    /// Create a splitter that discards anything larger than `max_frame_size`
    pub fn new(max_frame_size: usize) -> Self {
        Self {
            buffer: BytesMut::with_capacity(64 * 1024),
            max_frame_size,
        }
    }

    pub fn push(&mut self, data: &[u8]) {
        self.buffer.extend_from_slice(data);
    }

    /// Pop the next complete image, if one is buffered
    pub fn next_frame(&mut self) -> Option<Bytes> {
        loop {
            let start = find(&self.buffer, &SOI, 0)?;
            if start > 0 {
                self.buffer.advance(start);
            }

            match find(&self.buffer, &EOI, SOI.len()) {
                Some(end) => {
                    let frame = self.buffer.split_to(end + EOI.len()).freeze();
                    return Some(frame);
                }
                None if self.buffer.len() > self.max_frame_size => {
                    // Runaway image without EOI, resync on the next SOI
                    self.buffer.advance(SOI.len());
                }
                None => return None,
            }
        }
    }

    pub fn buffered(&self) -> usize {
        self.buffer.len()
    }
}

/// Check that a buffer starts with SOI and ends with EOI
pub fn is_complete_jpeg(data: &[u8]) -> bool {
    data.len() >= 4 && data[..2] == SOI && data[data.len() - 2..] == EOI
}

/// Read (width, height) from the first SOF marker
pub fn dimensions(data: &[u8]) -> Option<(u32, u32)> {
    if data.len() < 4 || data[..2] != SOI {
        return None;
    }
    let mut pos = 2;
    while pos + 4 <= data.len() {
        if data[pos] != 0xFF {
            return None;
        }
        let marker = data[pos + 1];
        let len = u16::from_be_bytes([data[pos + 2], data[pos + 3]]) as usize;
        // SOF0..SOF15 except DHT (C4), JPG (C8) and DAC (CC)
        if (0xC0..=0xCF).contains(&marker) && !matches!(marker, 0xC4 | 0xC8 | 0xCC) {
            if pos + 9 > data.len() {
                return None;
            }
            let height = u16::from_be_bytes([data[pos + 5], data[pos + 6]]) as u32;
            let width = u16::from_be_bytes([data[pos + 7], data[pos + 8]]) as u32;
            return Some((width, height));
        }
        pos += 2 + len;
    }
    None
}

fn find(haystack: &[u8], needle: &[u8; 2], from: usize) -> Option<usize> {
    if haystack.len() < from + 2 {
        return None;
    }
    haystack[from..]
        .windows(2)
        .position(|w| w == needle)
        .map(|p| p + from)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_split_across_pushes() {
        let mut splitter = JpegSplitter::new(1024);
        splitter.push(&[0x00, 0xFF, 0xD8, 0x01, 0x02]);
        assert!(splitter.next_frame().is_none());

        splitter.push(&[0xFF, 0xD9, 0xFF, 0xD8, 0x03]);
        let frame = splitter.next_frame().unwrap();
        assert_eq!(&frame[..], &[0xFF, 0xD8, 0x01, 0x02, 0xFF, 0xD9]);
        assert!(is_complete_jpeg(&frame));

        assert!(splitter.next_frame().is_none());
        splitter.push(&[0xFF, 0xD9]);
        assert_eq!(&splitter.next_frame().unwrap()[..], &[0xFF, 0xD8, 0x03, 0xFF, 0xD9]);
        assert_eq!(splitter.buffered(), 0);
    }

    #[test]
    fn test_dimensions_from_sof() {
        let jpeg = [
            0xFF, 0xD8, // SOI
            0xFF, 0xE0, 0x00, 0x04, 0x00, 0x00, // APP0, 2 bytes payload
            0xFF, 0xC0, 0x00, 0x0B, 0x08, 0x01, 0xE0, 0x02, 0x80, 0x01, 0x01, 0x11, 0x00,
            0xFF, 0xD9,
        ];
        assert_eq!(dimensions(&jpeg), Some((640, 480)));
        assert_eq!(dimensions(&[0x00, 0x01]), None);
    }

    #[test]
    fn test_oversized_frame_is_dropped() {
        let mut splitter = JpegSplitter::new(8);
        splitter.push(&[0xFF, 0xD8, 1, 2, 3, 4, 5, 6, 7, 8, 9]);
        assert!(splitter.next_frame().is_none());

        splitter.push(&[0xFF, 0xD8, 0xAA, 0xFF, 0xD9]);
        assert_eq!(&splitter.next_frame().unwrap()[..], &[0xFF, 0xD8, 0xAA, 0xFF, 0xD9]);
    }
}
