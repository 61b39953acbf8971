//! GPS 定位记录解析
//!
//! 记录格式 (ASCII/UTF-8):
//!
//! | 偏移    | 长度 | 字段      |
//! |---------|------|-----------|
//! | 0..2    | 2    | 名称      |
//! | 2..11   | 9    | 纬度      |
//! | 11..21  | 10   | 经度      |
//!
//! 第 21 字节之后的内容被忽略。纬度须在 ±90 之内，经度须在 ±180 之内。

use regex::Regex;
use serde::{Deserialize, Serialize};
use std::ops::Range;
use std::sync::LazyLock;

/// 一条记录的最小长度
pub const MIN_RECORD_LEN: usize = 21;

const NAME: Range<usize> = 0..2;
const LATITUDE: Range<usize> = 2..11;
const LONGITUDE: Range<usize> = 11..21;

static DECIMAL_PATTERN: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^[+-]?(\d+(\.\d*)?|\.\d+)$").unwrap());

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ParseError {
    #[error("malformed record: {0}")]
    MalformedRecord(String),
}

/// 一条定位记录 (fix)
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GpsRecord {
    pub name: String,
    pub latitude: f64,
    pub longitude: f64,
    pub observed_at_millis: i64,
}

impl GpsRecord {
    /// 按线格式编码，坐标保留 6 位小数
    pub fn encode(&self) -> Vec<u8> {
        format!(
            "{:<2.2}{:>9.6}{:>10.6}",
            self.name, self.latitude, self.longitude
        )
        .into_bytes()
    }
}

/// 解析一帧
///
/// 纯函数：相同输入总是得到相同结果，失败不会影响后续帧。
pub fn parse(frame: &[u8], observed_at_millis: i64) -> Result<GpsRecord, ParseError> {
    if frame.len() < MIN_RECORD_LEN {
        return Err(ParseError::MalformedRecord(format!(
            "expected at least {} bytes, got {}",
            MIN_RECORD_LEN,
            frame.len()
        )));
    }

    let text = std::str::from_utf8(&frame[..MIN_RECORD_LEN])
        .map_err(|e| ParseError::MalformedRecord(format!("invalid text: {}", e)))?;

    let name = field(text, NAME, "name")?;
    let latitude = decimal(field(text, LATITUDE, "latitude")?, "latitude")?;
    let longitude = decimal(field(text, LONGITUDE, "longitude")?, "longitude")?;
    within("latitude", latitude, 90.0)?;
    within("longitude", longitude, 180.0)?;

    Ok(GpsRecord {
        name: name.to_string(),
        latitude,
        longitude,
        observed_at_millis,
    })
}

fn field<'a>(text: &'a str, range: Range<usize>, label: &str) -> Result<&'a str, ParseError> {
    // 多字节字符可能横跨字段边界
    text.get(range)
        .ok_or_else(|| ParseError::MalformedRecord(format!("{} is not on a char boundary", label)))
}

fn decimal(raw: &str, label: &str) -> Result<f64, ParseError> {
    let trimmed = raw.trim();
    if !DECIMAL_PATTERN.is_match(trimmed) {
        return Err(ParseError::MalformedRecord(format!(
            "{} is not a decimal number: {:?}",
            label, raw
        )));
    }
    trimmed
        .parse::<f64>()
        .map_err(|e| ParseError::MalformedRecord(format!("{}: {}", label, e)))
}

fn within(label: &str, value: f64, limit: f64) -> Result<(), ParseError> {
    if value.abs() > limit {
        return Err(ParseError::MalformedRecord(format!(
            "{} {} is outside ±{}",
            label, value, limit
        )));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn assert_malformed(frame: &[u8]) {
        assert!(
            matches!(parse(frame, 0), Err(ParseError::MalformedRecord(_))),
            "expected MalformedRecord for {:?}",
            String::from_utf8_lossy(frame)
        );
    }

    #[test]
    fn test_parse_reference_record() {
        let record = parse(b"A112.345678123.456789", 42).unwrap();
        assert_eq!(record.name, "A1");
        assert!((record.latitude - 12.345678).abs() < 1e-9);
        assert!((record.longitude - 123.456789).abs() < 1e-9);
        assert_eq!(record.observed_at_millis, 42);
    }

    #[test]
    fn test_trailing_bytes_ignored() {
        let record = parse(b"A112.345678123.456789;garbage", 0).unwrap();
        assert!((record.longitude - 123.456789).abs() < 1e-9);
    }

    #[test]
    fn test_signed_and_padded_fields() {
        let record = parse(b"Z9-33.86880 151.20930", 0).unwrap();
        assert!((record.latitude + 33.8688).abs() < 1e-9);
        assert!((record.longitude - 151.2093).abs() < 1e-9);
    }

    #[test]
    fn test_short_frames_rejected() {
        for len in 0..MIN_RECORD_LEN {
            assert_malformed(&b"A112.345678123.456789"[..len]);
        }
    }

    #[test]
    fn test_non_numeric_fields_rejected() {
        assert_malformed(b"A1 12.3x567123.456789");
        assert_malformed(b"A112.345678123.45.789");
        assert_malformed(b"A1      inf123.456789");
        assert_malformed(b"A1      NaN123.456789");
        assert_malformed(b"A11.2345e01123.456789");
        assert_malformed(b"A1         123.456789");
    }

    #[test]
    fn test_out_of_range_coordinates_rejected() {
        assert_malformed(b"A190.000001  0.000000");
        assert_malformed(b"A1-91.00000  0.000000");
        assert_malformed(b"A112.345678180.000001");
        // 错位帧：名称吞掉了行尾，经度多出一位整数
        assert_malformed(b"\nA112.345678123.45678");

        let edge = parse(b"A1-90.00000-180.00000", 0).unwrap();
        assert!((edge.latitude + 90.0).abs() < 1e-9);
        assert!((edge.longitude + 180.0).abs() < 1e-9);
    }

    #[test]
    fn test_invalid_utf8_rejected() {
        let mut frame = b"A112.345678123.456789".to_vec();
        frame[0] = 0xFF;
        assert_malformed(&frame);

        // 名称字段被多字节字符截断
        assert_malformed("Aé2.345678123.456789".as_bytes());
    }

    #[test]
    fn test_encode_matches_layout() {
        let record = GpsRecord {
            name: "A1".to_string(),
            latitude: 12.345678,
            longitude: 123.456789,
            observed_at_millis: 0,
        };
        assert_eq!(record.encode(), b"A112.345678123.456789".to_vec());
    }
}
