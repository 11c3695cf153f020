// RFH2 layout, integers little-endian:
//   0 struc_id "RFH ", 4 version, 8 struc_length, 12 encoding, 16 charset,
//   20 format (8 bytes), 28 flags, 32 name_value_ccsid,
//   36 [i32 length, XML folder padded to 4 bytes]..., then the body.

use std::fmt;
use std::io::{Read, Write};

use chrono::Utc;
use flate2::read::GzDecoder;
use flate2::write::GzEncoder;
use flate2::Compression;

pub const STRUC_ID: &[u8; 4] = b"RFH ";
pub const VERSION: i32 = 2;
pub const HEADER_LENGTH: usize = 36;
pub const ENCODING_NATIVE: i32 = 273;
pub const CCSID_UTF8: i32 = 1208;
pub const FORMAT_STRING: &[u8; 8] = b"MQSTR   ";
pub const GZIP_ENCODING: &str = "gzip";

#[derive(Debug)]
pub enum FramingError {
    NotFramed,
    TruncatedHeader { length: usize },
    InvalidStrucLength { struc_length: i32, message_length: usize },
    TruncatedNameValue { offset: usize },
    NameValueNotUtf8 { offset: usize },
    InvalidNameValue { offset: usize, reason: String },
    UnsupportedEncoding { encoding: String },
    Compress(std::io::Error),
    Decompress(std::io::Error),
    BodyTooLarge { limit: usize },
}

impl fmt::Display for FramingError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::NotFramed => write!(f, "message does not start with an RFH2 header"),
            Self::TruncatedHeader { length } => write!(
                f,
                "RFH2 header needs {HEADER_LENGTH} bytes, message has {length}"
            ),
            Self::InvalidStrucLength {
                struc_length,
                message_length,
            } => write!(
                f,
                "RFH2 struc_length {struc_length} is invalid for a {message_length} byte message"
            ),
            Self::TruncatedNameValue { offset } => {
                write!(f, "RFH2 name/value folder at offset {offset} is truncated")
            }
            Self::NameValueNotUtf8 { offset } => {
                write!(f, "RFH2 name/value folder at offset {offset} is not UTF-8")
            }
            Self::InvalidNameValue { offset, reason } => write!(
                f,
                "RFH2 name/value folder at offset {offset} is not valid XML: {reason}"
            ),
            Self::UnsupportedEncoding { encoding } => {
                write!(f, "encoding {encoding} is not implemented")
            }
            Self::Compress(source) => write!(f, "failed to gzip RFH2 body: {source}"),
            Self::Decompress(source) => write!(f, "failed to gunzip RFH2 body: {source}"),
            Self::BodyTooLarge { limit } => {
                write!(f, "gunzipped RFH2 body exceeds {limit} bytes")
            }
        }
    }
}

impl std::error::Error for FramingError {}

pub fn is_rfh2(message: &[u8]) -> bool {
    message.len() >= 8 && &message[..4] == STRUC_ID && read_i32(message, 4) == VERSION
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Rfh2Header {
    pub struc_id: [u8; 4],
    pub version: i32,
    pub struc_length: i32,
    pub encoding: i32,
    pub charset: i32,
    pub format: [u8; 8],
    pub flags: i32,
    pub name_value_ccsid: i32,
}

impl Rfh2Header {
    fn parse(message: &[u8]) -> Self {
        let mut struc_id = [0_u8; 4];
        struc_id.copy_from_slice(&message[..4]);
        let mut format = [0_u8; 8];
        format.copy_from_slice(&message[20..28]);

        Self {
            struc_id,
            version: read_i32(message, 4),
            struc_length: read_i32(message, 8),
            encoding: read_i32(message, 12),
            charset: read_i32(message, 16),
            format,
            flags: read_i32(message, 28),
            name_value_ccsid: read_i32(message, 32),
        }
    }

    fn write_to(&self, out: &mut Vec<u8>) {
        out.extend_from_slice(&self.struc_id);
        out.extend_from_slice(&self.version.to_le_bytes());
        out.extend_from_slice(&self.struc_length.to_le_bytes());
        out.extend_from_slice(&self.encoding.to_le_bytes());
        out.extend_from_slice(&self.charset.to_le_bytes());
        out.extend_from_slice(&self.format);
        out.extend_from_slice(&self.flags.to_le_bytes());
        out.extend_from_slice(&self.name_value_ccsid.to_le_bytes());
    }
}

// One name/value folder, e.g. `<usr><ContentEncoding>gzip</ContentEncoding></usr>`.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct NameValue {
    pub folder: String,
    pub elements: Vec<(String, String)>,
}

impl NameValue {
    pub fn get(&self, name: &str) -> Option<&str> {
        self.elements
            .iter()
            .find(|(element, _)| element == name)
            .map(|(_, text)| text.as_str())
    }

    fn parse(fragment: &str, offset: usize) -> Result<Self, FramingError> {
        let trimmed = fragment.trim_end_matches([' ', '\0']);
        let document = roxmltree::Document::parse(trimmed).map_err(|error| {
            FramingError::InvalidNameValue {
                offset,
                reason: error.to_string(),
            }
        })?;
        let root = document.root_element();

        Ok(Self {
            folder: root.tag_name().name().to_owned(),
            elements: root
                .children()
                .filter(|node| node.is_element())
                .map(|node| {
                    (
                        node.tag_name().name().to_owned(),
                        node.text().unwrap_or_default().to_owned(),
                    )
                })
                .collect(),
        })
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Rfh2Message {
    pub header: Rfh2Header,
    pub name_values: Vec<NameValue>,
    body: Vec<u8>,
}

impl Rfh2Message {
    pub fn decode(message: &[u8]) -> Result<Self, FramingError> {
        if !is_rfh2(message) {
            return Err(FramingError::NotFramed);
        }
        if message.len() < HEADER_LENGTH {
            return Err(FramingError::TruncatedHeader {
                length: message.len(),
            });
        }

        let header = Rfh2Header::parse(message);
        let struc_length = usize::try_from(header.struc_length)
            .ok()
            .filter(|length| (HEADER_LENGTH..=message.len()).contains(length))
            .ok_or(FramingError::InvalidStrucLength {
                struc_length: header.struc_length,
                message_length: message.len(),
            })?;

        let mut name_values = Vec::new();
        let mut offset = HEADER_LENGTH;
        while offset < struc_length {
            if offset + 4 > struc_length {
                return Err(FramingError::TruncatedNameValue { offset });
            }
            let fragment_length = usize::try_from(read_i32(message, offset))
                .map_err(|_| FramingError::TruncatedNameValue { offset })?;
            let start = offset + 4;
            let end = start + fragment_length;
            if end > struc_length {
                return Err(FramingError::TruncatedNameValue { offset });
            }

            let fragment = std::str::from_utf8(&message[start..end])
                .map_err(|_| FramingError::NameValueNotUtf8 { offset })?;
            name_values.push(NameValue::parse(fragment, offset)?);
            offset = end;
        }

        Ok(Self {
            header,
            name_values,
            body: message[struc_length..].to_vec(),
        })
    }

    pub fn name_value(&self, folder: &str) -> Option<&NameValue> {
        self.name_values.iter().find(|nv| nv.folder == folder)
    }

    pub fn content_encoding(&self) -> Option<&str> {
        self.name_value("usr")
            .and_then(|usr| usr.get("ContentEncoding"))
    }

    pub fn raw_body(&self) -> &[u8] {
        &self.body
    }

    // The body with any gzip content encoding removed, at most `limit` bytes of it.
    pub fn payload(&self, limit: usize) -> Result<Vec<u8>, FramingError> {
        if self.content_encoding() != Some(GZIP_ENCODING) {
            return Ok(self.body.clone());
        }

        let mut decoded = Vec::new();
        let cap = u64::try_from(limit).unwrap_or(u64::MAX).saturating_add(1);
        GzDecoder::new(self.body.as_slice())
            .take(cap)
            .read_to_end(&mut decoded)
            .map_err(FramingError::Decompress)?;
        if decoded.len() > limit {
            return Err(FramingError::BodyTooLarge { limit });
        }
        Ok(decoded)
    }
}

#[derive(Clone, Debug)]
pub struct Rfh2Encoder {
    body: Vec<u8>,
    queue_name: String,
    encoding: String,
    timestamp_ms: i64,
}

impl Rfh2Encoder {
    pub fn new(
        payload: &[u8],
        queue_name: &str,
        encoding: &str,
        timestamp_ms: Option<i64>,
    ) -> Result<Self, FramingError> {
        if encoding != GZIP_ENCODING {
            return Err(FramingError::UnsupportedEncoding {
                encoding: encoding.to_owned(),
            });
        }

        let mut compressor = GzEncoder::new(Vec::new(), Compression::default());
        compressor.write_all(payload).map_err(FramingError::Compress)?;
        let body = compressor.finish().map_err(FramingError::Compress)?;

        Ok(Self {
            body,
            queue_name: queue_name.to_owned(),
            encoding: encoding.to_owned(),
            timestamp_ms: timestamp_ms.unwrap_or_else(|| Utc::now().timestamp_millis()),
        })
    }

    pub fn name_values(&self) -> Vec<u8> {
        let folders = [
            "<mcd><Msd>jms_bytes</Msd></mcd>".to_owned(),
            format!(
                "<jms><Dst>queue:///{}</Dst><Tms>{}</Tms><Dlv>2</Dlv></jms>",
                escape_xml(&self.queue_name),
                self.timestamp_ms
            ),
            format!(
                "<usr><ContentEncoding>{}</ContentEncoding><ContentLength dt=\"i8\">{}</ContentLength></usr>",
                self.encoding,
                self.body.len()
            ),
        ];

        let mut out = Vec::new();
        for folder in folders {
            let padded = pad_to_word(&folder);
            out.extend_from_slice(&(padded.len() as i32).to_le_bytes());
            out.extend_from_slice(padded.as_bytes());
        }
        out
    }

    pub fn header(&self, name_values_length: usize) -> Rfh2Header {
        Rfh2Header {
            struc_id: *STRUC_ID,
            version: VERSION,
            struc_length: (HEADER_LENGTH + name_values_length) as i32,
            encoding: ENCODING_NATIVE,
            charset: CCSID_UTF8,
            format: *FORMAT_STRING,
            flags: 0,
            name_value_ccsid: CCSID_UTF8,
        }
    }

    pub fn encode(&self) -> Vec<u8> {
        let name_values = self.name_values();
        let mut out = Vec::with_capacity(HEADER_LENGTH + name_values.len() + self.body.len());
        self.header(name_values.len()).write_to(&mut out);
        out.extend_from_slice(&name_values);
        out.extend_from_slice(&self.body);
        out
    }
}

fn read_i32(bytes: &[u8], offset: usize) -> i32 {
    i32::from_le_bytes([
        bytes[offset],
        bytes[offset + 1],
        bytes[offset + 2],
        bytes[offset + 3],
    ])
}

fn pad_to_word(fragment: &str) -> String {
    let padding = (4 - fragment.len() % 4) % 4;
    format!("{fragment}{}", " ".repeat(padding))
}

fn escape_xml(text: &str) -> String {
    text.replace('&', "&amp;")
        .replace('<', "&lt;")
        .replace('>', "&gt;")
}
