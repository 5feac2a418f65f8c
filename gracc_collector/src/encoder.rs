//! Publishing Encoder (SPEC_FULL.md §4.2): record + wire format → content
//! type and body bytes.

use std::fmt;
use std::str::FromStr;

use libgracc::{Record, RecordSerializeError};
use serde::{Deserialize, Serialize};

/// Wire format selector. Mirrors the teacher's small enum-with-`Display`-
/// and-`FromStr` idiom (see `SensorType`, `DummyMode` in the teacher repo).
#[derive(Copy, Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum WireFormat {
    Raw,
    Xml,
    Json,
}

impl WireFormat {
    pub fn all() -> Vec<Self> {
        vec![Self::Raw, Self::Xml, Self::Json]
    }
}

impl fmt::Display for WireFormat {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}",
            match self {
                Self::Raw => "raw",
                Self::Xml => "xml",
                Self::Json => "json",
            }
        )
    }
}

impl FromStr for WireFormat {
    type Err = ();

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        for fmt in Self::all() {
            if fmt.to_string() == s {
                return Ok(fmt);
            }
        }
        Err(())
    }
}

#[derive(Debug, thiserror::Error)]
pub enum EncodeError {
    #[error("error encoding record for publish: {0}")]
    Serialize(#[from] RecordSerializeError),
}

/// The result of encoding a record for publish: an AMQP-ready body plus the
/// content type to advertise in the publish's message properties.
pub struct EncodedRecord {
    pub content_type: &'static str,
    pub body: Vec<u8>,
}

const JSON_INDENT: &str = "    ";

pub fn encode<R: Record>(record: &R, format: WireFormat) -> Result<EncodedRecord, EncodeError> {
    Ok(match format {
        WireFormat::Raw => EncodedRecord {
            content_type: "text/xml",
            body: record.raw().to_vec(),
        },
        WireFormat::Xml => EncodedRecord {
            content_type: "text/xml",
            body: record.to_xml()?,
        },
        WireFormat::Json => EncodedRecord {
            content_type: "application/json",
            body: record.to_json_indented(JSON_INDENT)?,
        },
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use libgracc::JobUsageRecord;

    const SAMPLE: &[u8] = br#"<JobUsageRecord>
        <RecordId>rec-1</RecordId>
        <GlobalJobId>grid.example.org#1.0</GlobalJobId>
        <Site>T2_US_Example</Site>
        <SubmitHost>ce.example.org</SubmitHost>
        <UserIdentity>alice</UserIdentity>
        <WallDuration>60</WallDuration>
        <StartTime>2026-01-01T00:00:00Z</StartTime>
        <EndTime>2026-01-01T00:01:00Z</EndTime>
    </JobUsageRecord>"#;

    #[test]
    fn raw_format_returns_original_bytes_as_xml_content_type() {
        let rec = JobUsageRecord::parse_xml(SAMPLE).unwrap();
        let enc = encode(&rec, WireFormat::Raw).unwrap();
        assert_eq!(enc.content_type, "text/xml");
        assert_eq!(enc.body, SAMPLE);
    }

    #[test]
    fn json_format_is_four_space_indented() {
        let rec = JobUsageRecord::parse_xml(SAMPLE).unwrap();
        let enc = encode(&rec, WireFormat::Json).unwrap();
        assert_eq!(enc.content_type, "application/json");
        let text = String::from_utf8(enc.body).unwrap();
        assert!(text.contains("\n    \"RecordId\""));
    }

    #[test]
    fn format_round_trips_through_display_and_from_str() {
        for fmt in WireFormat::all() {
            assert_eq!(fmt.to_string().parse::<WireFormat>().unwrap(), fmt);
        }
    }
}
