use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Everything the collector's core needs from a record (SPEC_FULL.md §3).
///
/// The core never inspects a record beyond these four operations: it reads
/// an id for logging, reads the raw bytes it was parsed from (for the `raw`
/// wire format), and asks for structural XML/JSON encodings (for the `xml`
/// and `json` wire formats).
pub trait Record: Sized {
    /// Parse a record from its XML representation as carried in a bundle's
    /// `rec` token. The returned record retains `data` verbatim for
    /// [`Record::raw`].
    fn parse_xml(data: &[u8]) -> Result<Self, RecordParseError>;

    /// An identifier suitable for log correlation. Not guaranteed unique.
    fn id(&self) -> &str;

    /// The exact bytes this record was parsed from.
    fn raw(&self) -> &[u8];

    /// Structural XML serialization (distinct from `raw`: this re-encodes
    /// the parsed fields rather than echoing the input bytes).
    fn to_xml(&self) -> Result<Vec<u8>, RecordSerializeError>;

    /// Structural JSON serialization, indented by `indent`.
    fn to_json_indented(&self, indent: &str) -> Result<Vec<u8>, RecordSerializeError>;
}

/// A usage record for a single completed job, as reported by a grid-computing
/// site. Field set is deliberately small: just what the core's wire-format
/// table and logging touch, not a full OGF Usage Record schema.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename = "JobUsageRecord")]
pub struct JobUsageRecordFields {
    #[serde(rename = "RecordId")]
    pub record_id: String,
    #[serde(rename = "GlobalJobId")]
    pub global_job_id: String,
    #[serde(rename = "Site")]
    pub site: String,
    #[serde(rename = "SubmitHost")]
    pub submit_host: String,
    #[serde(rename = "UserIdentity")]
    pub user_identity: String,
    #[serde(rename = "WallDuration")]
    pub wall_duration_secs: u64,
    #[serde(rename = "StartTime")]
    pub start_time: DateTime<Utc>,
    #[serde(rename = "EndTime")]
    pub end_time: DateTime<Utc>,
}

/// A parsed job usage record, together with the raw bytes it came from.
#[derive(Debug, Clone)]
pub struct JobUsageRecord {
    fields: JobUsageRecordFields,
    raw: Vec<u8>,
}

impl JobUsageRecord {
    pub fn fields(&self) -> &JobUsageRecordFields {
        &self.fields
    }
}

#[derive(Debug, thiserror::Error)]
pub enum RecordParseError {
    #[error("malformed record XML: {0}")]
    Xml(#[from] quick_xml::de::DeError),
}

#[derive(Debug, thiserror::Error)]
pub enum RecordSerializeError {
    #[error("error converting record to XML: {0}")]
    Xml(#[from] quick_xml::se::SeError),
    #[error("error converting record to JSON: {0}")]
    Json(#[from] serde_json::Error),
}

impl Record for JobUsageRecord {
    fn parse_xml(data: &[u8]) -> Result<Self, RecordParseError> {
        let fields: JobUsageRecordFields = quick_xml::de::from_reader(data)?;
        Ok(Self {
            fields,
            raw: data.to_vec(),
        })
    }

    fn id(&self) -> &str {
        &self.fields.record_id
    }

    fn raw(&self) -> &[u8] {
        &self.raw
    }

    fn to_xml(&self) -> Result<Vec<u8>, RecordSerializeError> {
        Ok(quick_xml::se::to_string(&self.fields)?.into_bytes())
    }

    fn to_json_indented(&self, indent: &str) -> Result<Vec<u8>, RecordSerializeError> {
        let mut buf = Vec::new();
        let formatter = serde_json::ser::PrettyFormatter::with_indent(indent.as_bytes());
        let mut ser = serde_json::Serializer::with_formatter(&mut buf, formatter);
        serde::Serialize::serialize(&self.fields, &mut ser)?;
        Ok(buf)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const SAMPLE: &str = r#"<JobUsageRecord>
        <RecordId>rec-1</RecordId>
        <GlobalJobId>grid.example.org#1234.0</GlobalJobId>
        <Site>T2_US_Example</Site>
        <SubmitHost>ce.example.org</SubmitHost>
        <UserIdentity>alice</UserIdentity>
        <WallDuration>3600</WallDuration>
        <StartTime>2026-01-01T00:00:00Z</StartTime>
        <EndTime>2026-01-01T01:00:00Z</EndTime>
    </JobUsageRecord>"#;

    #[test]
    fn parse_xml_round_trips_identity_and_raw() {
        let rec = JobUsageRecord::parse_xml(SAMPLE.as_bytes()).unwrap();
        assert_eq!(rec.id(), "rec-1");
        assert_eq!(rec.raw(), SAMPLE.as_bytes());
    }

    #[test]
    fn parse_xml_rejects_garbage() {
        assert!(JobUsageRecord::parse_xml(b"not xml at all").is_err());
    }

    #[test]
    fn to_json_indented_uses_requested_indent() {
        let rec = JobUsageRecord::parse_xml(SAMPLE.as_bytes()).unwrap();
        let json = rec.to_json_indented("    ").unwrap();
        let text = String::from_utf8(json).unwrap();
        assert!(text.starts_with('{'));
        assert!(text.contains("\n    \"RecordId\""));
    }

    #[test]
    fn to_xml_reencodes_structurally() {
        let rec = JobUsageRecord::parse_xml(SAMPLE.as_bytes()).unwrap();
        let xml = String::from_utf8(rec.to_xml().unwrap()).unwrap();
        assert!(xml.contains("<RecordId>rec-1</RecordId>"));
    }
}
