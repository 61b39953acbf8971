//! 字节流分帧器
//!
//! 把通知负载累积成完整的逻辑记录。负载可能跨多个通知，
//! 一个通知也可能携带多条记录，分帧器对两种情况都一视同仁。
//!
//! # 分帧策略
//!
//! - `Fixed`: 定长记录（默认 21 字节，与观测到的 GPS 模块一致）。
//!   帧起始处的 `\r` / `\n` 会被跳过，带行尾的负载不会破坏对齐
//! - `Delimited`: 以分隔符结尾的行（默认 `\n`，会去掉末尾的 `\r`）

use log::{trace, warn};
use serde::{Deserialize, Serialize};

use crate::stream::record::MIN_RECORD_LEN;

/// 默认缓冲区上限
pub const DEFAULT_MAX_BUFFER: usize = 4096;

/// 分帧错误
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum FrameError {
    #[error("frame buffer overflow: {buffered} bytes buffered, limit is {limit}")]
    FrameOverflow { buffered: usize, limit: usize },
}

/// 分帧策略
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "mode", rename_all = "snake_case")]
pub enum Framing {
    /// 定长记录
    Fixed { length: usize },
    /// 分隔符结尾的记录
    Delimited { delimiter: u8 },
}

impl Default for Framing {
    fn default() -> Self {
        Framing::Fixed {
            length: MIN_RECORD_LEN,
        }
    }
}

impl Framing {
    /// 换行分隔
    pub fn lines() -> Self {
        Framing::Delimited { delimiter: b'\n' }
    }
}

/// 一次 `feed` 的结果
#[derive(Debug, Default)]
pub struct FeedOutcome {
    /// 本次提取出的完整帧，按到达顺序排列
    pub frames: Vec<Vec<u8>>,
    /// 缓冲区超限时为 `Some`，此时缓冲区已被清空
    pub overflow: Option<FrameError>,
}

pub struct Framer {
    framing: Framing,
    max_buffer: usize,
    buffer: Vec<u8>,
}

impl Framer {
    pub fn new(framing: Framing, max_buffer: usize) -> Self {
        // 定长帧本身比上限还长时永远无法提取，上限至少要容纳一帧
        let max_buffer = match framing {
            Framing::Fixed { length } => max_buffer.max(length),
            Framing::Delimited { .. } => max_buffer,
        };
        Self {
            framing,
            max_buffer,
            buffer: Vec::new(),
        }
    }

    /// 当前缓冲但尚未成帧的字节数
    pub fn buffered(&self) -> usize {
        self.buffer.len()
    }

    /// 追加字节并提取所有完整帧
    ///
    /// 不完整的尾部保留到下一次调用；剩余字节超过上限时清空缓冲区
    /// 并在结果中报告 `FrameOverflow`，已经提取出的帧仍然返回。
    pub fn feed(&mut self, chunk: &[u8]) -> FeedOutcome {
        self.buffer.extend_from_slice(chunk);

        let mut outcome = FeedOutcome::default();
        match self.framing {
            Framing::Fixed { length } => self.extract_fixed(length.max(1), &mut outcome.frames),
            Framing::Delimited { delimiter } => {
                self.extract_delimited(delimiter, &mut outcome.frames);
            }
        }

        if self.buffer.len() > self.max_buffer {
            let buffered = self.buffer.len();
            warn!(
                "Frame buffer overflow ({} > {} bytes), resetting",
                buffered, self.max_buffer
            );
            self.buffer.clear();
            outcome.overflow = Some(FrameError::FrameOverflow {
                buffered,
                limit: self.max_buffer,
            });
        }

        outcome
    }

    fn extract_fixed(&mut self, length: usize, frames: &mut Vec<Vec<u8>>) {
        let mut consumed = 0;
        loop {
            let skipped = self.buffer[consumed..]
                .iter()
                .take_while(|&&b| is_line_end(b))
                .count();
            if skipped > 0 {
                trace!("Skipping {} line-end byte(s) between records", skipped);
            }
            consumed += skipped;

            if self.buffer.len() - consumed < length {
                break;
            }
            frames.push(self.buffer[consumed..consumed + length].to_vec());
            consumed += length;
        }
        self.buffer.drain(..consumed);
    }

    fn extract_delimited(&mut self, delimiter: u8, frames: &mut Vec<Vec<u8>>) {
        let mut consumed = 0;
        while let Some(pos) = self.buffer[consumed..]
            .iter()
            .position(|&b| b == delimiter)
        {
            let mut line = &self.buffer[consumed..consumed + pos];
            consumed += pos + 1;

            if delimiter == b'\n' {
                if let Some(stripped) = line.strip_suffix(b"\r") {
                    line = stripped;
                }
            }

            if line.len() < MIN_RECORD_LEN {
                trace!("Dropping short line ({} bytes)", line.len());
                continue;
            }
            frames.push(line.to_vec());
        }
        self.buffer.drain(..consumed);
    }
}

fn is_line_end(byte: u8) -> bool {
    byte == b'\r' || byte == b'\n'
}

impl Default for Framer {
    fn default() -> Self {
        Self::new(Framing::default(), DEFAULT_MAX_BUFFER)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const RECORD: &[u8] = b"A112.345678123.456789";

    fn feed_all(framer: &mut Framer, chunks: &[&[u8]]) -> Vec<Vec<u8>> {
        chunks
            .iter()
            .flat_map(|chunk| framer.feed(chunk).frames)
            .collect()
    }

    #[test]
    fn test_fixed_single_record_per_notification() {
        let mut framer = Framer::default();
        let out = framer.feed(RECORD);
        assert_eq!(out.frames, vec![RECORD.to_vec()]);
        assert!(out.overflow.is_none());
        assert_eq!(framer.buffered(), 0);
    }

    #[test]
    fn test_fixed_record_split_across_notifications() {
        let mut framer = Framer::default();
        assert!(framer.feed(&RECORD[..20]).frames.is_empty());
        assert_eq!(framer.buffered(), 20);

        let out = framer.feed(&RECORD[20..]);
        assert_eq!(out.frames, vec![RECORD.to_vec()]);
    }

    #[test]
    fn test_fixed_multiple_records_in_one_notification() {
        let mut framer = Framer::default();
        let mut payload = RECORD.to_vec();
        payload.extend_from_slice(b"B2-1.000000-80.000000");
        payload.extend_from_slice(b"C3");

        let out = framer.feed(&payload);
        assert_eq!(out.frames.len(), 2);
        assert_eq!(out.frames[1], b"B2-1.000000-80.000000".to_vec());
        assert_eq!(framer.buffered(), 2);
    }

    #[test]
    fn test_fixed_skips_line_endings_between_records() {
        for ending in [&b"\n"[..], b"\r\n", b"\r"] {
            let mut framer = Framer::default();
            let mut payload = RECORD.to_vec();
            payload.extend_from_slice(ending);

            for _ in 0..3 {
                let out = framer.feed(&payload);
                assert_eq!(out.frames, vec![RECORD.to_vec()], "ending {:?}", ending);
                assert!(out.overflow.is_none());
            }
            assert_eq!(framer.buffered(), 0);
        }
    }

    #[test]
    fn test_fixed_line_ending_split_from_record() {
        let mut framer = Framer::default();
        let chunks: &[&[u8]] = &[&RECORD[..15], &RECORD[15..], b"\r", b"\n", RECORD, b"\r\n"];
        assert_eq!(feed_all(&mut framer, chunks), vec![RECORD.to_vec(); 2]);
        assert_eq!(framer.buffered(), 0);
    }

    #[test]
    fn test_delimited_strips_carriage_return_and_drops_short_lines() {
        let mut framer = Framer::new(Framing::lines(), DEFAULT_MAX_BUFFER);
        let out = framer.feed(b"A112.345678123.456789\r\n\r\nshort\nB2");
        assert_eq!(out.frames, vec![RECORD.to_vec()]);
        assert_eq!(framer.buffered(), 2);
    }

    #[test]
    fn test_chunk_invariance() {
        let mut stream = Vec::new();
        for _ in 0..3 {
            stream.extend_from_slice(RECORD);
            stream.extend_from_slice(b"\n");
        }
        stream.extend_from_slice(b"tail");

        for framing in [Framing::default(), Framing::lines()] {
            let mut whole = Framer::new(framing, DEFAULT_MAX_BUFFER);
            let expected = whole.feed(&stream).frames.concat();

            let mut bytewise = Framer::new(framing, DEFAULT_MAX_BUFFER);
            let chunks: Vec<&[u8]> = stream.chunks(1).collect();
            assert_eq!(feed_all(&mut bytewise, &chunks).concat(), expected);

            let mut uneven = Framer::new(framing, DEFAULT_MAX_BUFFER);
            let chunks: Vec<&[u8]> = stream.chunks(7).collect();
            assert_eq!(feed_all(&mut uneven, &chunks).concat(), expected);
        }
    }

    #[test]
    fn test_overflow_resets_buffer() {
        let mut framer = Framer::new(Framing::lines(), 32);
        let out = framer.feed(&[b'x'; 40]);
        assert!(out.frames.is_empty());
        assert_eq!(
            out.overflow,
            Some(FrameError::FrameOverflow {
                buffered: 40,
                limit: 32
            })
        );
        assert_eq!(framer.buffered(), 0);

        // 溢出后可以继续正常分帧
        let out = framer.feed(b"A112.345678123.456789\n");
        assert_eq!(out.frames, vec![RECORD.to_vec()]);
        assert!(out.overflow.is_none());
    }

    #[test]
    fn test_overflow_keeps_frames_extracted_before_reset() {
        let mut framer = Framer::new(Framing::lines(), 32);
        let mut payload = b"A112.345678123.456789\n".to_vec();
        payload.extend_from_slice(&[b'x'; 40]);

        let out = framer.feed(&payload);
        assert_eq!(out.frames, vec![RECORD.to_vec()]);
        assert!(out.overflow.is_some());
    }

    #[test]
    fn test_fixed_limit_never_below_frame_length() {
        let mut framer = Framer::new(Framing::Fixed { length: 21 }, 4);
        assert!(framer.feed(&RECORD[..10]).overflow.is_none());
        assert_eq!(framer.feed(&RECORD[10..]).frames.len(), 1);
    }
}
