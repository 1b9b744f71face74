//! Payload codec for cache entries
//!
//! After the engine's resource id line, every entry carries:
//!
//! ```text
//! {"kind":"data","media_type":"application/vnd.opendap.dap4.data","length":42}
//! --DATA:
//! <length bytes>
//! ```
//!
//! The header is a single JSON line naming the payload kind and the exact
//! body length, so a truncated or foreign entry is detected on read.

use std::fmt;
use std::io::{self, BufRead, Read, Write};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Marker line separating the metadata section from the body.
pub const DATA_MARKER: &[u8] = b"--DATA:\n";

/// Longest header line accepted when reading.
const MAX_HEADER_LEN: u64 = 64 * 1024;

/// The three dataset metadata responses kept by the metadata store.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MetadataKind {
    /// DAP2 dataset descriptor structure
    Dds,
    /// DAP2 dataset attribute structure
    Das,
    /// DAP4 dataset metadata response
    Dmr,
}

impl MetadataKind {
    pub const ALL: [MetadataKind; 3] = [Self::Dds, Self::Das, Self::Dmr];

    /// Suffix appended to the dataset name to form the resource id.
    pub fn id_suffix(&self) -> &'static str {
        match self {
            Self::Dds => "dds_r",
            Self::Das => "das_r",
            Self::Dmr => "dmr_r",
        }
    }

    pub fn media_type(&self) -> &'static str {
        match self {
            Self::Dds | Self::Das => "text/plain",
            Self::Dmr => "application/vnd.opendap.dap4.dataset-metadata+xml",
        }
    }
}

impl fmt::Display for MetadataKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Dds => "dds",
            Self::Das => "das",
            Self::Dmr => "dmr",
        };
        f.write_str(name)
    }
}

/// One serialized metadata response for a dataset.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MetadataDoc {
    pub name: String,
    pub kind: MetadataKind,
    pub text: String,
}

/// Result of evaluating a constraint against a dataset.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DataResult {
    pub media_type: String,
    pub bytes: Vec<u8>,
}

impl DataResult {
    pub fn new(media_type: impl Into<String>, bytes: impl Into<Vec<u8>>) -> Self {
        Self {
            media_type: media_type.into(),
            bytes: bytes.into(),
        }
    }
}

/// Body of a resource fetched from a remote URL.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RemoteBytes {
    pub url: String,
    pub content_type: String,
    pub fetched_at: DateTime<Utc>,
    pub bytes: Vec<u8>,
}

/// Anything an adapter stores in an entry.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Payload {
    Metadata(MetadataDoc),
    Data(DataResult),
    Remote(RemoteBytes),
}

/// Metadata section of an entry.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum PayloadHeader {
    Metadata {
        name: String,
        metadata: MetadataKind,
        length: u64,
    },
    Data {
        media_type: String,
        length: u64,
    },
    Remote {
        url: String,
        content_type: String,
        fetched_at: DateTime<Utc>,
        length: u64,
    },
}

impl PayloadHeader {
    pub fn length(&self) -> u64 {
        match self {
            Self::Metadata { length, .. } | Self::Data { length, .. } | Self::Remote { length, .. } => *length,
        }
    }
}

impl Payload {
    fn header(&self) -> PayloadHeader {
        match self {
            Self::Metadata(doc) => PayloadHeader::Metadata {
                name: doc.name.clone(),
                metadata: doc.kind,
                length: doc.text.len() as u64,
            },
            Self::Data(result) => PayloadHeader::Data {
                media_type: result.media_type.clone(),
                length: result.bytes.len() as u64,
            },
            Self::Remote(remote) => PayloadHeader::Remote {
                url: remote.url.clone(),
                content_type: remote.content_type.clone(),
                fetched_at: remote.fetched_at,
                length: remote.bytes.len() as u64,
            },
        }
    }

    fn body(&self) -> &[u8] {
        match self {
            Self::Metadata(doc) => doc.text.as_bytes(),
            Self::Data(result) => &result.bytes,
            Self::Remote(remote) => &remote.bytes,
        }
    }

    /// Serialize the metadata section, the marker and the body.
    pub fn write_to(&self, w: &mut dyn Write) -> io::Result<()> {
        let header = serde_json::to_vec(&self.header())
            .map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e))?;
        w.write_all(&header)?;
        w.write_all(b"\n")?;
        w.write_all(DATA_MARKER)?;
        w.write_all(self.body())?;
        Ok(())
    }

    /// Parse a payload written by [`write_to`](Self::write_to).
    ///
    /// Anything malformed is `InvalidData`.
    pub fn read_from(r: &mut dyn BufRead) -> io::Result<Self> {
        let mut line = Vec::new();
        Read::take(&mut *r, MAX_HEADER_LEN).read_until(b'\n', &mut line)?;
        if line.pop() != Some(b'\n') {
            return Err(invalid("payload header line is incomplete"));
        }
        let header: PayloadHeader = serde_json::from_slice(&line)
            .map_err(|e| invalid(format!("malformed payload header: {}", e)))?;

        let mut marker = [0u8; DATA_MARKER.len()];
        r.read_exact(&mut marker)
            .map_err(|_| invalid("missing data marker"))?;
        if &marker[..] != DATA_MARKER {
            return Err(invalid("missing data marker"));
        }

        let length = header.length();
        let mut body = Vec::new();
        Read::take(&mut *r, length).read_to_end(&mut body)?;
        if body.len() as u64 != length {
            return Err(invalid(format!(
                "payload truncated: expected {} bytes, found {}",
                length,
                body.len()
            )));
        }

        let payload = match header {
            PayloadHeader::Metadata { name, metadata, .. } => {
                let text = String::from_utf8(body)
                    .map_err(|e| invalid(format!("metadata is not UTF-8: {}", e)))?;
                Self::Metadata(MetadataDoc {
                    name,
                    kind: metadata,
                    text,
                })
            }
            PayloadHeader::Data { media_type, .. } => Self::Data(DataResult {
                media_type,
                bytes: body,
            }),
            PayloadHeader::Remote {
                url,
                content_type,
                fetched_at,
                ..
            } => Self::Remote(RemoteBytes {
                url,
                content_type,
                fetched_at,
                bytes: body,
            }),
        };
        Ok(payload)
    }

    pub fn into_metadata(self) -> io::Result<MetadataDoc> {
        match self {
            Self::Metadata(doc) => Ok(doc),
            other => Err(unexpected("metadata", &other)),
        }
    }

    pub fn into_data(self) -> io::Result<DataResult> {
        match self {
            Self::Data(result) => Ok(result),
            other => Err(unexpected("data", &other)),
        }
    }

    pub fn into_remote(self) -> io::Result<RemoteBytes> {
        match self {
            Self::Remote(remote) => Ok(remote),
            other => Err(unexpected("remote", &other)),
        }
    }

    fn kind_name(&self) -> &'static str {
        match self {
            Self::Metadata(_) => "metadata",
            Self::Data(_) => "data",
            Self::Remote(_) => "remote",
        }
    }
}

fn invalid(msg: impl Into<String>) -> io::Error {
    io::Error::new(io::ErrorKind::InvalidData, msg.into())
}

fn unexpected(wanted: &str, found: &Payload) -> io::Error {
    invalid(format!("expected a {} payload, found {}", wanted, found.kind_name()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Cursor;

    fn encode(payload: &Payload) -> Vec<u8> {
        let mut buf = Vec::new();
        payload.write_to(&mut buf).unwrap();
        buf
    }

    #[test]
    fn test_data_layout() {
        let payload = Payload::Data(DataResult::new("application/octet-stream", b"abc".to_vec()));
        let bytes = encode(&payload);
        let text = String::from_utf8(bytes.clone()).unwrap();

        assert!(text.starts_with("{\"kind\":\"data\""));
        assert!(text.ends_with("\n--DATA:\nabc"));
        assert_eq!(Payload::read_from(&mut Cursor::new(bytes)).unwrap(), payload);
    }

    #[test]
    fn test_metadata_round_trip() {
        let payload = Payload::Metadata(MetadataDoc {
            name: "/data/sst.nc".to_string(),
            kind: MetadataKind::Dmr,
            text: "<Dataset name=\"sst.nc\"/>\n".to_string(),
        });
        let decoded = Payload::read_from(&mut Cursor::new(encode(&payload))).unwrap();
        assert_eq!(decoded.into_metadata().unwrap().kind, MetadataKind::Dmr);
    }

    #[test]
    fn test_body_may_contain_marker() {
        let payload = Payload::Data(DataResult::new("text/plain", b"--DATA:\n--DATA:\n".to_vec()));
        let decoded = Payload::read_from(&mut Cursor::new(encode(&payload))).unwrap();
        assert_eq!(decoded, payload);
    }

    #[test]
    fn test_truncated_body_is_invalid() {
        let mut bytes = encode(&Payload::Data(DataResult::new("text/plain", b"0123456789".to_vec())));
        bytes.truncate(bytes.len() - 3);

        let err = Payload::read_from(&mut Cursor::new(bytes)).unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::InvalidData);
        assert!(err.to_string().contains("truncated"));
    }

    #[test]
    fn test_missing_marker_is_invalid() {
        let bytes = b"{\"kind\":\"data\",\"media_type\":\"text/plain\",\"length\":1}\nx".to_vec();
        let err = Payload::read_from(&mut Cursor::new(bytes)).unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::InvalidData);
    }

    #[test]
    fn test_garbage_header_is_invalid() {
        let err = Payload::read_from(&mut Cursor::new(b"not json\n--DATA:\n".to_vec())).unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::InvalidData);

        let err = Payload::read_from(&mut Cursor::new(Vec::new())).unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::InvalidData);
    }

    #[test]
    fn test_wrong_kind_is_invalid() {
        let payload = Payload::Data(DataResult::new("text/plain", b"x".to_vec()));
        let err = payload.into_metadata().unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::InvalidData);
    }

    #[test]
    fn test_metadata_kind_names() {
        assert_eq!(MetadataKind::Dds.id_suffix(), "dds_r");
        assert_eq!(MetadataKind::Dmr.id_suffix(), "dmr_r");
        assert_eq!(MetadataKind::Das.to_string(), "das");
    }
}
