//! Minimal PEM encoding for the DER material the endpoint hands out.
//!
//! SDS consumers expect PEM text while the Workload API and the identity
//! manager work on DER, so the conversion happens at the edges.

use base64::{Engine, engine::general_purpose::STANDARD};

pub const CERTIFICATE: &str = "CERTIFICATE";
pub const PRIVATE_KEY: &str = "PRIVATE KEY";

const LINE_WIDTH: usize = 64;

#[derive(Debug, thiserror::Error)]
pub enum PemError {
    #[error("PEM block `{0}` has no END line")]
    Unterminated(String),

    #[error("PEM block `{label}` is not valid base64: {source}")]
    Base64 {
        label: String,
        #[source]
        source: base64::DecodeError,
    },
}

/// A single decoded PEM block.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Block {
    pub label: String,
    pub der: Vec<u8>,
}

pub fn encode(label: &str, der: &[u8]) -> String {
    let body = STANDARD.encode(der);
    let mut out = String::with_capacity(body.len() + body.len() / LINE_WIDTH + 2 * label.len() + 34);
    out.push_str("-----BEGIN ");
    out.push_str(label);
    out.push_str("-----\n");
    // base64 output is ASCII, so byte chunks are valid UTF-8.
    for line in body.as_bytes().chunks(LINE_WIDTH) {
        out.push_str(core::str::from_utf8(line).unwrap_or_default());
        out.push('\n');
    }
    out.push_str("-----END ");
    out.push_str(label);
    out.push_str("-----\n");
    out
}

/// Encodes every DER blob as its own block, concatenated in order.
pub fn encode_all<'a>(label: &str, ders: impl IntoIterator<Item = &'a [u8]>) -> String {
    ders.into_iter().map(|der| encode(label, der)).collect()
}

/// Decodes every PEM block in `text`. Text outside blocks is ignored.
pub fn decode_all(text: &str) -> Result<Vec<Block>, PemError> {
    let mut blocks = Vec::new();
    let mut lines = text.lines();

    while let Some(line) = lines.next() {
        let Some(label) = line
            .trim()
            .strip_prefix("-----BEGIN ")
            .and_then(|rest| rest.strip_suffix("-----"))
        else {
            continue;
        };

        let end = format!("-----END {label}-----");
        let mut body = String::new();
        let mut terminated = false;
        for line in lines.by_ref() {
            let line = line.trim();
            if line == end {
                terminated = true;
                break;
            }
            body.push_str(line);
        }
        if !terminated {
            return Err(PemError::Unterminated(label.to_string()));
        }

        let der = STANDARD.decode(body).map_err(|source| PemError::Base64 {
            label: label.to_string(),
            source,
        })?;
        blocks.push(Block {
            label: label.to_string(),
            der,
        });
    }

    Ok(blocks)
}

/// Whether `data` looks like PEM text rather than raw DER.
pub fn is_pem(data: &[u8]) -> bool {
    data.trim_ascii_start().starts_with(b"-----BEGIN ")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn wraps_at_64_columns() {
        let pem = encode(CERTIFICATE, &[0xAB; 100]);
        let lines: Vec<_> = pem.lines().collect();
        assert_eq!(lines[0], "-----BEGIN CERTIFICATE-----");
        assert_eq!(lines[1].len(), 64);
        assert!(lines[2].len() < 64);
        assert_eq!(lines[3], "-----END CERTIFICATE-----");
    }

    #[test]
    fn decodes_concatenated_blocks() {
        let text = format!(
            "leading junk\n{}{}",
            encode(CERTIFICATE, b"leaf"),
            encode(PRIVATE_KEY, b"key")
        );
        let blocks = decode_all(&text).unwrap();
        assert_eq!(blocks.len(), 2);
        assert_eq!(blocks[0].der, b"leaf");
        assert_eq!(blocks[1].label, PRIVATE_KEY);
    }

    #[test]
    fn rejects_truncated_block() {
        let err = decode_all("-----BEGIN CERTIFICATE-----\nAAAA\n").unwrap_err();
        assert!(matches!(err, PemError::Unterminated(label) if label == CERTIFICATE));
    }

    #[test]
    fn detects_pem() {
        assert!(is_pem(b"\n-----BEGIN CERTIFICATE-----"));
        assert!(!is_pem(&[0x30, 0x82]));
    }
}
