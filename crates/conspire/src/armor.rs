//! ASCII armor
//!
//! Text wrapper around binary material, in the OpenPGP style:
//!
//! ```text
//! -----BEGIN CONSPIRE MESSAGE-----
//! Recipients: 4ABEABCDEFCC123B,4ABEABCDEFCC123C
//!
//! <base64, 64 columns>
//! =<base64 CRC-24>
//! -----END CONSPIRE MESSAGE-----
//! ```

use base64::{engine::general_purpose::STANDARD, Engine as _};
use thiserror::Error;

const LINE_WIDTH: usize = 64;

const CRC24_INIT: u32 = 0x00B7_04CE;
const CRC24_POLY: u32 = 0x0186_4CFB;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BlockKind {
    /// An encrypted secret
    Message,
    /// A public-key collection (local public ring or a group)
    PublicKeys,
    /// The local private-key collection
    PrivateKeys,
}

impl BlockKind {
    pub fn label(&self) -> &'static str {
        match self {
            Self::Message => "CONSPIRE MESSAGE",
            Self::PublicKeys => "CONSPIRE PUBLIC KEY BLOCK",
            Self::PrivateKeys => "CONSPIRE PRIVATE KEY BLOCK",
        }
    }

    fn from_label(label: &str) -> Option<Self> {
        [Self::Message, Self::PublicKeys, Self::PrivateKeys]
            .into_iter()
            .find(|kind| kind.label() == label)
    }
}

#[derive(Error, Debug, PartialEq, Eq)]
pub enum ArmorError {
    #[error("no armor header line found")]
    MissingBegin,

    #[error("expected {expected} block, found {found}")]
    WrongKind { expected: &'static str, found: String },

    #[error("armor is truncated (no END line)")]
    MissingEnd,

    #[error("invalid base64 body: {0}")]
    Base64(String),

    #[error("armor checksum mismatch")]
    Checksum,
}

/// A decoded armor block
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Armored {
    pub headers: Vec<(String, String)>,
    pub data: Vec<u8>,
}

impl Armored {
    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers
            .iter()
            .find(|(key, _)| key.eq_ignore_ascii_case(name))
            .map(|(_, value)| value.as_str())
    }
}

/// Armor `data` as a `kind` block with the given headers
pub fn encode(kind: BlockKind, headers: &[(&str, String)], data: &[u8]) -> String {
    let mut out = format!("-----BEGIN {}-----\n", kind.label());

    for (name, value) in headers {
        out.push_str(&format!("{}: {}\n", name, value));
    }
    out.push('\n');

    let body = STANDARD.encode(data);
    for chunk in body.as_bytes().chunks(LINE_WIDTH) {
        // base64 output is ASCII, so any chunk boundary is a char boundary
        out.push_str(&String::from_utf8_lossy(chunk));
        out.push('\n');
    }

    let crc = crc24(data).to_be_bytes();
    out.push('=');
    out.push_str(&STANDARD.encode(&crc[1..]));
    out.push('\n');

    out.push_str(&format!("-----END {}-----\n", kind.label()));
    out
}

/// Decode the first armor block in `text`, which must be of kind `expected`
pub fn decode(text: &str, expected: BlockKind) -> Result<Armored, ArmorError> {
    let mut lines = text.lines().map(str::trim_end);

    let label = lines
        .by_ref()
        .find_map(|line| {
            line.strip_prefix("-----BEGIN ")
                .and_then(|rest| rest.strip_suffix("-----"))
        })
        .ok_or(ArmorError::MissingBegin)?;

    match BlockKind::from_label(label) {
        Some(kind) if kind == expected => {}
        _ => {
            return Err(ArmorError::WrongKind {
                expected: expected.label(),
                found: label.to_string(),
            })
        }
    }

    let end_line = format!("-----END {}-----", label);
    let mut headers = Vec::new();
    let mut body = String::new();
    let mut checksum = None;
    let mut in_headers = true;
    let mut closed = false;

    for line in lines {
        if line == end_line {
            closed = true;
            break;
        }

        if in_headers {
            if line.is_empty() {
                in_headers = false;
                continue;
            }
            if let Some((name, value)) = line.split_once(": ") {
                headers.push((name.trim().to_string(), value.trim().to_string()));
                continue;
            }
            // No header section at all
            in_headers = false;
        }

        if let Some(sum) = line.strip_prefix('=') {
            checksum = Some(sum.to_string());
        } else {
            body.push_str(line.trim());
        }
    }

    if !closed {
        return Err(ArmorError::MissingEnd);
    }

    let data = STANDARD
        .decode(body.as_bytes())
        .map_err(|e| ArmorError::Base64(e.to_string()))?;

    if let Some(sum) = checksum {
        let expected_crc = STANDARD
            .decode(sum.as_bytes())
            .map_err(|e| ArmorError::Base64(e.to_string()))?;
        if expected_crc != crc24(&data).to_be_bytes()[1..] {
            return Err(ArmorError::Checksum);
        }
    }

    Ok(Armored {
        headers,
        data,
    })
}

fn crc24(data: &[u8]) -> u32 {
    let mut crc = CRC24_INIT;
    for byte in data {
        crc ^= u32::from(*byte) << 16;
        for _ in 0..8 {
            crc <<= 1;
            if crc & 0x0100_0000 != 0 {
                crc ^= CRC24_POLY;
            }
        }
    }
    crc & 0x00FF_FFFF
}
