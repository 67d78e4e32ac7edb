//! Streaming gzip decompression
//!
//! Responses that arrive compressed declare their original length in a
//! custom header; the adapter is created with that length, fed each
//! compressed chunk as it arrives, and writes the expanded bytes straight
//! into the output region leased from the response sink. State carries
//! over between calls, so chunk boundaries can fall anywhere in the
//! stream, including inside the gzip header or trailer.
//!
//! The member framing (RFC 1952) is decoded here and the deflate body is
//! handed to a raw `flate2` inflate stream; the trailer's CRC32 and size
//! fields are checked against what was actually produced.

use flate2::{Crc, Decompress, FlushDecompress, Status};

use crate::{Error, Result};

const GZIP_MAGIC: [u8; 2] = [0x1f, 0x8b];
const METHOD_DEFLATE: u8 = 8;
const FIXED_HEADER_LEN: usize = 10;
const TRAILER_LEN: usize = 8;

const FLAG_HEADER_CRC: u8 = 1 << 1;
const FLAG_EXTRA: u8 = 1 << 2;
const FLAG_NAME: u8 = 1 << 3;
const FLAG_COMMENT: u8 = 1 << 4;

/// What a feed call established about the stream
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FeedOutcome {
    /// Input exhausted, stream still open; feed the next chunk.
    NeedsInput,
    /// The stream ended, the trailer checked out, and the declared
    /// length was produced exactly.
    Finished,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Stage {
    FixedHeader,
    ExtraLen,
    Extra(usize),
    Name,
    Comment,
    HeaderCrc,
    Body,
    Trailer,
    Done,
}

/// Stateful inflate over one compressed response body
pub struct GzipInflater {
    stage: Stage,
    /// Partial fixed-size field spanning a chunk boundary.
    hold: Vec<u8>,
    flags: u8,
    stream: Decompress,
    crc: Crc,
    declared: usize,
    produced: usize,
}

impl GzipInflater {
    /// Create an adapter for a stream declaring `declared` expanded bytes.
    pub fn new(declared: usize) -> GzipInflater {
        GzipInflater {
            stage: Stage::FixedHeader,
            hold: Vec::with_capacity(FIXED_HEADER_LEN),
            flags: 0,
            stream: Decompress::new(false),
            crc: Crc::new(),
            declared,
            produced: 0,
        }
    }

    /// The expanded length the stream declared up front.
    pub fn declared(&self) -> usize {
        self.declared
    }

    /// Expanded bytes produced so far.
    pub fn produced(&self) -> usize {
        self.produced
    }

    /// Whether the stream ended and its trailer validated.
    pub fn is_finished(&self) -> bool {
        self.stage == Stage::Done
    }

    /// Feed one compressed chunk, writing expanded bytes into `out`.
    ///
    /// Returns the number of bytes written and whether the stream ended.
    /// Errors on corrupt framing, on a stream that ends short of the
    /// declared length, on one that would exceed it, and on input after
    /// the end of the member. Partially consumed input never needs
    /// re-feeding.
    pub fn feed(&mut self, input: &[u8], out: &mut [u8]) -> Result<(usize, FeedOutcome)> {
        let mut consumed = 0usize;
        let mut written = 0usize;

        while consumed < input.len() {
            let remaining = &input[consumed..];
            match self.stage {
                Stage::FixedHeader => {
                    consumed += self.fill_hold(remaining, FIXED_HEADER_LEN);
                    if self.hold.len() == FIXED_HEADER_LEN {
                        if self.hold[..2] != GZIP_MAGIC {
                            return Err(Error::Inflate("bad gzip magic".to_string()));
                        }
                        if self.hold[2] != METHOD_DEFLATE {
                            return Err(Error::Inflate(format!(
                                "unsupported compression method {}",
                                self.hold[2]
                            )));
                        }
                        self.flags = self.hold[3];
                        self.hold.clear();
                        self.stage = if self.flags & FLAG_EXTRA != 0 {
                            Stage::ExtraLen
                        } else {
                            stage_after_extra(self.flags)
                        };
                    }
                }

                Stage::ExtraLen => {
                    consumed += self.fill_hold(remaining, 2);
                    if self.hold.len() == 2 {
                        let len = u16::from_le_bytes([self.hold[0], self.hold[1]]) as usize;
                        self.hold.clear();
                        self.stage = if len == 0 {
                            stage_after_extra(self.flags)
                        } else {
                            Stage::Extra(len)
                        };
                    }
                }

                Stage::Extra(left) => {
                    let skip = left.min(remaining.len());
                    consumed += skip;
                    self.stage = if left == skip {
                        stage_after_extra(self.flags)
                    } else {
                        Stage::Extra(left - skip)
                    };
                }

                Stage::Name => {
                    consumed += skip_terminated(remaining, &mut self.stage, stage_after_name(self.flags));
                }

                Stage::Comment => {
                    consumed += skip_terminated(remaining, &mut self.stage, Stage::body_or_crc(self.flags));
                }

                Stage::HeaderCrc => {
                    consumed += self.fill_hold(remaining, 2);
                    if self.hold.len() == 2 {
                        // the header checksum is consumed, not verified
                        self.hold.clear();
                        self.stage = Stage::Body;
                    }
                }

                Stage::Body => {
                    let (used, wrote) = self.inflate_step(remaining, &mut out[written..])?;
                    consumed += used;
                    written += wrote;
                }

                Stage::Trailer => {
                    consumed += self.fill_hold(remaining, TRAILER_LEN);
                    if self.hold.len() == TRAILER_LEN {
                        let crc =
                            u32::from_le_bytes([self.hold[0], self.hold[1], self.hold[2], self.hold[3]]);
                        let size =
                            u32::from_le_bytes([self.hold[4], self.hold[5], self.hold[6], self.hold[7]]);
                        if crc != self.crc.sum() {
                            return Err(Error::Inflate("trailer checksum mismatch".to_string()));
                        }
                        if size != self.produced as u32 {
                            return Err(Error::Inflate("trailer length mismatch".to_string()));
                        }
                        self.hold.clear();
                        self.stage = Stage::Done;
                    }
                }

                Stage::Done => {
                    return Err(Error::Inflate("input after end of stream".to_string()));
                }
            }
        }

        if self.stage == Stage::Done {
            Ok((written, FeedOutcome::Finished))
        } else {
            Ok((written, FeedOutcome::NeedsInput))
        }
    }

    /// Accumulate up to `want` bytes of a fixed-size field into `hold`,
    /// returning how many were taken from `input`.
    fn fill_hold(&mut self, input: &[u8], want: usize) -> usize {
        let take = (want - self.hold.len()).min(input.len());
        self.hold.extend_from_slice(&input[..take]);
        take
    }

    /// One raw-deflate step over the body. Writes into `out` while space
    /// remains; once the lease is exhausted only the end of the stream is
    /// acceptable.
    fn inflate_step(&mut self, input: &[u8], out: &mut [u8]) -> Result<(usize, usize)> {
        let before_in = self.stream.total_in();
        let before_out = self.stream.total_out();

        let status = if !out.is_empty() {
            self.stream.decompress(input, out, FlushDecompress::None)
        } else {
            let mut probe = [0u8; 1];
            let status = self.stream.decompress(input, &mut probe, FlushDecompress::None);
            if self.stream.total_out() != before_out {
                return Err(Error::OversizedStream {
                    declared: self.declared,
                });
            }
            status
        }
        .map_err(|e| Error::Inflate(e.to_string()))?;

        let used = (self.stream.total_in() - before_in) as usize;
        let wrote = (self.stream.total_out() - before_out) as usize;
        self.crc.update(&out[..wrote]);
        self.produced += wrote;

        match status {
            Status::StreamEnd => {
                if self.produced != self.declared {
                    return Err(Error::TruncatedStream {
                        produced: self.produced,
                        declared: self.declared,
                    });
                }
                self.stage = Stage::Trailer;
            }
            Status::Ok | Status::BufError => {
                if used == 0 && wrote == 0 {
                    return Err(Error::Inflate(
                        "compressed stream made no progress".to_string(),
                    ));
                }
            }
        }
        Ok((used, wrote))
    }
}

impl std::fmt::Debug for GzipInflater {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("GzipInflater")
            .field("stage", &self.stage)
            .field("declared", &self.declared)
            .field("produced", &self.produced)
            .finish()
    }
}

impl Stage {
    fn body_or_crc(flags: u8) -> Stage {
        if flags & FLAG_HEADER_CRC != 0 {
            Stage::HeaderCrc
        } else {
            Stage::Body
        }
    }
}

fn stage_after_extra(flags: u8) -> Stage {
    if flags & FLAG_NAME != 0 {
        Stage::Name
    } else {
        stage_after_name(flags)
    }
}

fn stage_after_name(flags: u8) -> Stage {
    if flags & FLAG_COMMENT != 0 {
        Stage::Comment
    } else {
        Stage::body_or_crc(flags)
    }
}

/// Skip a zero-terminated header field, advancing `stage` to `next` once
/// the terminator is seen. Returns the bytes consumed.
fn skip_terminated(input: &[u8], stage: &mut Stage, next: Stage) -> usize {
    match input.iter().position(|&b| b == 0) {
        Some(pos) => {
            *stage = next;
            pos + 1
        }
        None => input.len(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use flate2::write::{DeflateEncoder, GzEncoder};
    use flate2::Compression;
    use std::io::Write;

    fn gzip(data: &[u8]) -> Vec<u8> {
        let mut encoder = GzEncoder::new(Vec::new(), Compression::default());
        encoder.write_all(data).unwrap();
        encoder.finish().unwrap()
    }

    /// A gzip member with FNAME and FCOMMENT fields, which the stock
    /// encoder never emits.
    fn gzip_with_optional_fields(data: &[u8]) -> Vec<u8> {
        let mut deflated = DeflateEncoder::new(Vec::new(), Compression::default());
        deflated.write_all(data).unwrap();
        let deflated = deflated.finish().unwrap();

        let mut crc = Crc::new();
        crc.update(data);

        let mut member = vec![
            0x1f, 0x8b, 8, FLAG_NAME | FLAG_COMMENT, 0, 0, 0, 0, 0, 255,
        ];
        member.extend_from_slice(b"payload.json\0");
        member.extend_from_slice(b"a comment\0");
        member.extend_from_slice(&deflated);
        member.extend_from_slice(&crc.sum().to_le_bytes());
        member.extend_from_slice(&(data.len() as u32).to_le_bytes());
        member
    }

    fn sample(len: usize) -> Vec<u8> {
        (0..len).map(|i| (i % 251) as u8).collect()
    }

    #[test]
    fn test_round_trip_single_feed() {
        let original = sample(1000);
        let compressed = gzip(&original);

        let mut inflater = GzipInflater::new(original.len());
        let mut out = vec![0u8; original.len()];

        let (written, outcome) = inflater.feed(&compressed, &mut out).unwrap();
        assert_eq!(outcome, FeedOutcome::Finished);
        assert_eq!(written, original.len());
        assert_eq!(out, original);
        assert!(inflater.is_finished());
    }

    #[test]
    fn test_round_trip_arbitrary_chunk_boundaries() {
        let original = sample(4096);
        let compressed = gzip(&original);

        // deliberately awkward split points, including a 1-byte chunk
        let splits = [1, 7, 64, 300, compressed.len()];
        let mut inflater = GzipInflater::new(original.len());
        let mut out = vec![0u8; original.len()];
        let mut fed = 0;
        let mut written_total = 0;

        for &end in &splits {
            let end = end.min(compressed.len());
            if fed >= end {
                continue;
            }
            let (written, _) = inflater
                .feed(&compressed[fed..end], &mut out[written_total..])
                .unwrap();
            fed = end;
            written_total += written;
        }

        assert!(inflater.is_finished());
        assert_eq!(written_total, original.len());
        assert_eq!(out, original);
    }

    #[test]
    fn test_optional_header_fields_are_skipped() {
        let original = sample(2000);
        let compressed = gzip_with_optional_fields(&original);

        let mut inflater = GzipInflater::new(original.len());
        let mut out = vec![0u8; original.len()];

        // split inside the name field to exercise resumption
        let (first, _) = inflater.feed(&compressed[..14], &mut out).unwrap();
        let (rest, outcome) = inflater.feed(&compressed[14..], &mut out[first..]).unwrap();

        assert_eq!(outcome, FeedOutcome::Finished);
        assert_eq!(first + rest, original.len());
        assert_eq!(out, original);
    }

    #[test]
    fn test_short_stream_is_an_error() {
        let original = sample(500);
        let compressed = gzip(&original);

        // stream expands to 500 bytes but 600 were declared
        let mut inflater = GzipInflater::new(600);
        let mut out = vec![0u8; 600];

        let err = inflater.feed(&compressed, &mut out).unwrap_err();
        assert!(matches!(
            err,
            Error::TruncatedStream {
                produced: 500,
                declared: 600
            }
        ));
    }

    #[test]
    fn test_oversized_stream_is_an_error() {
        let original = sample(500);
        let compressed = gzip(&original);

        // stream expands past the declared 400 bytes
        let mut inflater = GzipInflater::new(400);
        let mut out = vec![0u8; 400];

        assert!(inflater.feed(&compressed, &mut out).is_err());
    }

    #[test]
    fn test_truncated_input_reports_needs_input() {
        let original = sample(500);
        let compressed = gzip(&original);

        let mut inflater = GzipInflater::new(500);
        let mut out = vec![0u8; 500];

        let (_, outcome) = inflater
            .feed(&compressed[..compressed.len() / 2], &mut out)
            .unwrap();
        assert_eq!(outcome, FeedOutcome::NeedsInput);
        assert!(!inflater.is_finished());
    }

    #[test]
    fn test_bad_magic_is_an_error() {
        let mut inflater = GzipInflater::new(100);
        let mut out = vec![0u8; 100];

        assert!(inflater.feed(b"this is not a gzip stream", &mut out).is_err());
    }

    #[test]
    fn test_corrupt_trailer_checksum_is_an_error() {
        let original = sample(100);
        let mut compressed = gzip(&original);
        let crc_pos = compressed.len() - 8;
        compressed[crc_pos] ^= 0xff;

        let mut inflater = GzipInflater::new(100);
        let mut out = vec![0u8; 100];

        assert!(inflater.feed(&compressed, &mut out).is_err());
    }

    #[test]
    fn test_input_after_end_of_stream_is_an_error() {
        let original = sample(100);
        let compressed = gzip(&original);

        let mut inflater = GzipInflater::new(100);
        let mut out = vec![0u8; 100];
        inflater.feed(&compressed, &mut out).unwrap();

        let mut spare = [0u8; 1];
        assert!(inflater.feed(b"tail", &mut spare).is_err());
    }

    #[test]
    fn test_trailer_split_across_chunks() {
        let original = sample(300);
        let compressed = gzip(&original);

        // everything except half the 8-byte trailer, then the rest
        let cut = compressed.len() - 4;
        let mut inflater = GzipInflater::new(300);
        let mut out = vec![0u8; 300];

        let (written, outcome) = inflater.feed(&compressed[..cut], &mut out).unwrap();
        assert_eq!(outcome, FeedOutcome::NeedsInput);

        let (more, outcome) = inflater
            .feed(&compressed[cut..], &mut out[written..])
            .unwrap();
        assert_eq!(outcome, FeedOutcome::Finished);
        assert_eq!(written + more, 300);
        assert_eq!(out, original);
    }

    #[test]
    fn test_empty_payload_round_trip() {
        let compressed = gzip(b"");

        let mut inflater = GzipInflater::new(0);
        let mut out = Vec::new();

        let (written, outcome) = inflater.feed(&compressed, &mut out).unwrap();
        assert_eq!(outcome, FeedOutcome::Finished);
        assert_eq!(written, 0);
    }
}
