//! Line-oriented parser for the multipart MJPEG stream served by network cameras.
//!
//! The camera emits, for every frame, a boundary marker line, a handful of
//! header lines (`Content-length`, `Date`, `Content-type`), a blank line and
//! then the JPEG bytes. The body is binary, but it is still fed to the parser
//! in newline-delimited chunks; the advertised length decides when a frame is
//! complete, not the line structure.

use tracing::{debug, warn};

const CONTENT_LENGTH: &[u8] = b"content-length";
const DATE: &[u8] = b"date";
const CONTENT_TYPE: &[u8] = b"content-type";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ParserState {
    Header,
    Body,
}

/// A complete frame payload, borrowed from the parser's buffer until the next line is fed.
#[derive(Debug)]
pub struct FrameParts<'a> {
    pub payload: &'a [u8],
    pub date: &'a str,
}

pub struct MultipartParser {
    camera_id: String,
    state: ParserState,
    /// `Some(0)` when the header was present but unusable.
    content_length: Option<usize>,
    date: String,
    body: Vec<u8>,
    max_frame_bytes: usize,
    /// Set when the last fed line completed a frame; the buffer is cleared on the next feed.
    completed: bool,
}

impl MultipartParser {
    pub fn new(camera_id: impl Into<String>, max_frame_bytes: usize) -> Self {
        Self {
            camera_id: camera_id.into(),
            state: ParserState::Header,
            content_length: None,
            date: String::new(),
            body: Vec::with_capacity(256 * 1024),
            max_frame_bytes,
            completed: false,
        }
    }

    pub fn state(&self) -> ParserState {
        self.state
    }

    /// Drop any partial frame, e.g. after the connection was lost.
    pub fn reset(&mut self) {
        self.state = ParserState::Header;
        self.content_length = None;
        self.date.clear();
        self.body.clear();
        self.completed = false;
    }

    /// Feed one line, including its trailing `\n`. Returns the frame it completed, if any.
    pub fn feed_line(&mut self, line: &[u8]) -> Option<FrameParts<'_>> {
        if self.completed {
            self.body.clear();
            self.completed = false;
        }

        match self.state {
            ParserState::Header => {
                if self.read_header(line) {
                    return Some(self.complete());
                }
                None
            }
            ParserState::Body => {
                self.body.extend_from_slice(line);
                if self.body.len() >= self.content_length.unwrap_or(0) {
                    debug!("Camera '{}': end of body, {} bytes", self.camera_id, self.body.len());
                    return Some(self.complete());
                }
                None
            }
        }
    }

    /// Returns true when the header section ended with a zero-length body.
    fn read_header(&mut self, line: &[u8]) -> bool {
        if line.starts_with(b"--") {
            // Boundary marker: a new part begins
            self.content_length = None;
            self.date.clear();
            return false;
        }

        if let Some(value) = header_value(line, CONTENT_LENGTH) {
            self.content_length = Some(self.parse_content_length(value));
            return false;
        }

        if let Some(value) = header_value(line, DATE) {
            self.date = String::from_utf8_lossy(value).into_owned();
            return false;
        }

        if header_value(line, CONTENT_TYPE).is_some() {
            return false;
        }

        if trim_line_end(line).is_empty() {
            match self.content_length {
                // Stray separator between parts
                None => {}
                Some(0) => {
                    warn!("Camera '{}': header ended without a usable content length", self.camera_id);
                    return true;
                }
                Some(_) => self.state = ParserState::Body,
            }
        }

        false
    }

    fn parse_content_length(&self, value: &[u8]) -> usize {
        let text = String::from_utf8_lossy(value);
        match text.parse::<usize>() {
            Ok(size) if size > self.max_frame_bytes => {
                warn!(
                    "Camera '{}': content length {} exceeds maximum {}, ignoring frame",
                    self.camera_id, size, self.max_frame_bytes
                );
                0
            }
            Ok(size) => size,
            Err(e) => {
                warn!("Camera '{}': invalid content length '{}': {}", self.camera_id, text, e);
                0
            }
        }
    }

    fn complete(&mut self) -> FrameParts<'_> {
        self.state = ParserState::Header;
        self.content_length = None;
        self.completed = true;
        FrameParts {
            payload: &self.body,
            date: &self.date,
        }
    }
}

/// Case-insensitive `Name: value` match, returning the trimmed value.
fn header_value<'a>(line: &'a [u8], name: &[u8]) -> Option<&'a [u8]> {
    if line.len() < name.len() || !line[..name.len()].eq_ignore_ascii_case(name) {
        return None;
    }
    let rest = &line[name.len()..];
    // "Content-length: 10", "Content-length 10" and "Content-length:10" are all seen in the wild
    let rest = match rest.first() {
        Some(b':') => &rest[1..],
        Some(b' ') | Some(b'\t') | Some(b'\r') | Some(b'\n') | None => rest,
        Some(_) => return None,
    };
    Some(trim(rest))
}

fn trim_line_end(line: &[u8]) -> &[u8] {
    let mut end = line.len();
    while end > 0 && matches!(line[end - 1], b'\r' | b'\n') {
        end -= 1;
    }
    &line[..end]
}

fn trim(value: &[u8]) -> &[u8] {
    let start = value.iter().position(|b| !b.is_ascii_whitespace()).unwrap_or(value.len());
    let end = value.iter().rposition(|b| !b.is_ascii_whitespace()).map_or(start, |i| i + 1);
    &value[start..end]
}

#[cfg(test)]
mod tests {
    use super::*;

    fn lines(data: &[u8]) -> Vec<&[u8]> {
        data.split_inclusive(|b| *b == b'\n').collect()
    }

    fn part(body: &[u8], date: &str) -> Vec<u8> {
        let mut out = Vec::new();
        out.extend_from_slice(b"--video boundary--\r\n");
        out.extend_from_slice(format!("Content-length: {}\r\n", body.len()).as_bytes());
        out.extend_from_slice(format!("Date: {}\r\n", date).as_bytes());
        out.extend_from_slice(b"Content-type: image/jpeg\r\n");
        out.extend_from_slice(b"\r\n");
        out.extend_from_slice(body);
        out
    }

    fn collect_frames(parser: &mut MultipartParser, data: &[u8]) -> Vec<(Vec<u8>, String)> {
        let mut frames = Vec::new();
        for line in lines(data) {
            if let Some(frame) = parser.feed_line(line) {
                frames.push((frame.payload.to_vec(), frame.date.to_string()));
            }
        }
        frames
    }

    #[test]
    fn test_single_frame_spanning_many_lines() {
        let body = b"\xff\xd8line one\nline two\n\nline four\xff\xd9".to_vec();
        let data = part(&body, "2024-01-01 10:00:00");

        let mut parser = MultipartParser::new("cam", 1024);
        let frames = collect_frames(&mut parser, &data);

        assert_eq!(frames.len(), 1);
        assert_eq!(frames[0].0, body);
        assert_eq!(frames[0].1, "2024-01-01 10:00:00");
        assert_eq!(parser.state(), ParserState::Header);
    }

    #[test]
    fn test_consecutive_frames() {
        let mut data = part(b"first\n", "d1");
        data.extend_from_slice(b"\r\n");
        data.extend(part(b"second frame\n", "d2"));
        data.extend_from_slice(b"\r\n");
        data.extend(part(b"3\n", "d3"));

        let mut parser = MultipartParser::new("cam", 1024);
        let frames = collect_frames(&mut parser, &data);

        let payloads: Vec<&[u8]> = frames.iter().map(|(p, _)| p.as_slice()).collect();
        assert_eq!(payloads, vec![&b"first\n"[..], &b"second frame\n"[..], &b"3\n"[..]]);
        let dates: Vec<&str> = frames.iter().map(|(_, d)| d.as_str()).collect();
        assert_eq!(dates, vec!["d1", "d2", "d3"]);
    }

    #[test]
    fn test_trailing_slack_is_kept() {
        // Length says 4 but the line carries more bytes; the frame ends at the line boundary
        let mut data = Vec::new();
        data.extend_from_slice(b"--b\r\nContent-length: 4\r\n\r\n");
        data.extend_from_slice(b"abcdef\r\n");

        let mut parser = MultipartParser::new("cam", 1024);
        let frames = collect_frames(&mut parser, &data);

        assert_eq!(frames.len(), 1);
        assert_eq!(frames[0].0, b"abcdef\r\n");
    }

    #[test]
    fn test_malformed_content_length_yields_empty_frame() {
        let mut data = Vec::new();
        data.extend_from_slice(b"--video boundary--\r\n");
        data.extend_from_slice(b"Content-length: abc\r\n");
        data.extend_from_slice(b"\r\n");
        data.extend_from_slice(b"\xff\xd8 jpeg bytes\n");

        let mut parser = MultipartParser::new("cam", 1024);
        let frames = collect_frames(&mut parser, &data);

        assert_eq!(frames.len(), 1);
        assert!(frames[0].0.is_empty());
        assert_eq!(parser.state(), ParserState::Header);

        // The stream recovers on the next boundary
        let frames = collect_frames(&mut parser, &part(b"ok\n", "d"));
        assert_eq!(frames.len(), 1);
        assert_eq!(frames[0].0, b"ok\n");
    }

    #[test]
    fn test_oversized_frame_is_ignored() {
        let data = part(&[b'x'; 64], "d");
        let mut parser = MultipartParser::new("cam", 16);
        let frames = collect_frames(&mut parser, &data);

        assert_eq!(frames.len(), 1);
        assert!(frames[0].0.is_empty());
    }

    #[test]
    fn test_header_names_are_case_insensitive() {
        let mut data = Vec::new();
        data.extend_from_slice(b"--myboundary\r\n");
        data.extend_from_slice(b"Content-Type: image/jpeg\r\n");
        data.extend_from_slice(b"Content-Length:3\r\n");
        data.extend_from_slice(b"DATE: now\r\n");
        data.extend_from_slice(b"\r\n");
        data.extend_from_slice(b"abc");
        data.extend_from_slice(b"\n");

        let mut parser = MultipartParser::new("cam", 1024);
        let frames = collect_frames(&mut parser, &data);

        assert_eq!(frames.len(), 1);
        assert_eq!(frames[0].0, b"abc\n");
        assert_eq!(frames[0].1, "now");
    }

    #[test]
    fn test_boundary_resets_header() {
        let mut parser = MultipartParser::new("cam", 1024);
        assert!(parser.feed_line(b"Content-length: 10\r\n").is_none());
        assert!(parser.feed_line(b"Date: stale\r\n").is_none());
        assert!(parser.feed_line(b"--boundary\r\n").is_none());

        // Without a fresh length the blank line is only a separator
        assert!(parser.feed_line(b"\r\n").is_none());
        assert_eq!(parser.state(), ParserState::Header);

        parser.feed_line(b"Content-length: 2\r\n");
        parser.feed_line(b"\r\n");
        let frame = parser.feed_line(b"ok").unwrap();
        assert_eq!(frame.payload, b"ok");
        assert_eq!(frame.date, "");
    }

    #[test]
    fn test_stray_separator_lines_are_ignored() {
        let mut data = part(b"one\n", "d1");
        data.extend_from_slice(b"\r\n\r\n");
        data.extend(part(b"two\n", "d2"));

        let mut parser = MultipartParser::new("cam", 1024);
        let frames = collect_frames(&mut parser, &data);
        assert_eq!(frames.len(), 2);
        assert_eq!(frames[1].0, b"two\n");
    }

    #[test]
    fn test_reset_drops_partial_frame() {
        let mut parser = MultipartParser::new("cam", 1024);
        parser.feed_line(b"Content-length: 100\r\n");
        parser.feed_line(b"\r\n");
        parser.feed_line(b"partial\n");
        assert_eq!(parser.state(), ParserState::Body);

        parser.reset();
        assert_eq!(parser.state(), ParserState::Header);

        let frames = collect_frames(&mut parser, &part(b"fresh\n", "d"));
        assert_eq!(frames[0].0, b"fresh\n");
    }

    #[test]
    fn test_header_value() {
        assert_eq!(header_value(b"Content-length: 42\r\n", CONTENT_LENGTH), Some(&b"42"[..]));
        assert_eq!(header_value(b"Content-length 42\r\n", CONTENT_LENGTH), Some(&b"42"[..]));
        assert_eq!(header_value(b"Content-lengthy: 42\r\n", CONTENT_LENGTH), None);
        assert_eq!(header_value(b"Dated: x\r\n", DATE), None);
        assert_eq!(header_value(b"Date: Mon, 1 Jan\r\n", DATE), Some(&b"Mon, 1 Jan"[..]));
    }
}
