//! Per-job log streams.
//!
//! Workers produce through [`LogWriter`], which buffers output and pushes it
//! over a [`LogTransport`]. The server keeps one append-only file per job in a
//! [`FileLogStore`] and serves full reads and live follows from it.
//!
//! A stream is complete once [`END_OF_STREAM`] has been appended. Readers
//! never see the marker itself. Job output that happens to contain the exact
//! marker text ends the stream early.

pub mod store;
pub mod tail;
pub mod writer;

pub use store::{FileLogStore, LogAppender, LogStoreError};
pub use tail::LogFollow;
pub use writer::{LogConnector, LogError, LogTransport, LogWriter};

/// Reserved line written by a worker once a job's output is complete.
pub const END_OF_STREAM: &str = "##<labqueue:end-of-stream>##";

/// Cut `data` at the first end-of-stream marker.
pub fn strip_end_marker(data: &[u8]) -> &[u8] {
    match find(data, END_OF_STREAM.as_bytes()) {
        Some(pos) => &data[..pos],
        None => data,
    }
}

pub(crate) fn find(haystack: &[u8], needle: &[u8]) -> Option<usize> {
    if needle.is_empty() || haystack.len() < needle.len() {
        return None;
    }
    haystack
        .windows(needle.len())
        .position(|window| window == needle)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn strip_end_marker_cuts_marker_and_trailer() {
        let data = format!("line 1\nline 2\n{END_OF_STREAM}\n");
        assert_eq!(strip_end_marker(data.as_bytes()), b"line 1\nline 2\n");
    }

    #[test]
    fn strip_end_marker_without_marker_is_identity() {
        assert_eq!(strip_end_marker(b"partial"), b"partial");
        assert_eq!(strip_end_marker(b""), b"");
    }
}
