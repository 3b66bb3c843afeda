//! Deterministic shard wire format.
//!
//! One UTF-8 record per line:
//! `digest,filename,size,photoDate,modifiedDate,width,height,sourceID`
//! (last three optional, empty when absent). Fields containing a comma,
//! quote, CR, or LF are quoted with doubled-quote escaping, so a quoted
//! field may span record delimiters and decoding must be quote-aware before
//! it splits records. Records are sorted by digest ascending so that
//! identical entry sets always serialize to identical bytes — shard
//! checksums are only meaningful because of this.

use crate::digest::ContentDigest;
use crate::entry::{CatalogEntry, LocalFields};
use crate::error::{Error, Result};
use crate::SHARD_COUNT;
use time::OffsetDateTime;

/// Serialize one shard's entries, sorted by digest, byte-deterministic.
///
/// Local-only fields are never written; they exist only on this device.
pub fn encode_shard(entries: &[CatalogEntry]) -> Vec<u8> {
    let mut sorted: Vec<&CatalogEntry> = entries.iter().collect();
    sorted.sort_by_key(|e| e.digest);

    let mut out = String::new();
    for entry in sorted {
        out.push_str(&entry.digest.to_hex());
        out.push(',');
        push_field(&mut out, &entry.filename);
        out.push(',');
        out.push_str(&entry.file_size.to_string());
        out.push(',');
        out.push_str(&entry.photo_date.unix_timestamp().to_string());
        out.push(',');
        out.push_str(&entry.modified_date.unix_timestamp().to_string());
        out.push(',');
        if let Some(w) = entry.width {
            out.push_str(&w.to_string());
        }
        out.push(',');
        if let Some(h) = entry.height {
            out.push_str(&h.to_string());
        }
        out.push(',');
        if let Some(id) = &entry.source_id {
            push_field(&mut out, id);
        }
        out.push('\n');
    }
    out.into_bytes()
}

/// Parse one shard's serialized entries.
///
/// Every record's digest must map to `shard_index`; a record in the wrong
/// shard is an integrity error and fails the whole decode before any of it is
/// trusted. Local-only fields come back at their defaults.
pub fn decode_shard(shard_index: usize, bytes: &[u8]) -> Result<Vec<CatalogEntry>> {
    if shard_index >= SHARD_COUNT {
        return Err(Error::InvalidShardIndex(shard_index));
    }
    let text = std::str::from_utf8(bytes)
        .map_err(|e| Error::WireFormat(format!("shard data is not UTF-8: {e}")))?;

    let mut entries = Vec::new();
    for (line_no, fields) in split_records(text)? {
        if fields.len() != 8 {
            return Err(Error::WireFormat(format!(
                "line {line_no}: expected 8 fields, got {}",
                fields.len()
            )));
        }

        let digest = ContentDigest::from_hex(&fields[0])?;
        if digest.shard_index() != shard_index {
            return Err(Error::ShardMismatch {
                digest: digest.to_hex(),
                expected: shard_index,
                actual: digest.shard_index(),
            });
        }

        entries.push(CatalogEntry {
            digest,
            filename: fields[1].clone(),
            file_size: parse_num(&fields[2], line_no)?,
            photo_date: parse_timestamp(&fields[3], line_no)?,
            modified_date: parse_timestamp(&fields[4], line_no)?,
            width: parse_opt_num(&fields[5], line_no)?,
            height: parse_opt_num(&fields[6], line_no)?,
            source_id: if fields[7].is_empty() {
                None
            } else {
                Some(fields[7].clone())
            },
            local: LocalFields::default(),
        });
    }
    Ok(entries)
}

/// Append a field, quoting it RFC-4180 style if it needs it.
fn push_field(out: &mut String, field: &str) {
    if field
        .chars()
        .any(|c| matches!(c, ',' | '"' | '\n' | '\r'))
    {
        out.push('"');
        for c in field.chars() {
            if c == '"' {
                out.push('"');
            }
            out.push(c);
        }
        out.push('"');
    } else {
        out.push_str(field);
    }
}

/// Split serialized records into their fields, honoring quoted fields.
///
/// Must run over the whole stream, not line by line: a quoted field may
/// contain the record delimiter. Returns each record with the 1-based line
/// it starts on, for error reporting.
fn split_records(text: &str) -> Result<Vec<(usize, Vec<String>)>> {
    let mut records = Vec::new();
    let mut fields: Vec<String> = Vec::new();
    let mut current = String::new();
    let mut chars = text.chars().peekable();
    let mut in_quotes = false;
    let mut line = 1usize;
    let mut record_line = 1usize;

    while let Some(c) = chars.next() {
        if in_quotes {
            match c {
                '"' if chars.peek() == Some(&'"') => {
                    chars.next();
                    current.push('"');
                }
                '"' => in_quotes = false,
                '\n' => {
                    line += 1;
                    current.push(c);
                }
                _ => current.push(c),
            }
        } else {
            match c {
                '"' if current.is_empty() => in_quotes = true,
                '"' => {
                    return Err(Error::WireFormat(format!(
                        "line {record_line}: quote inside unquoted field"
                    )));
                }
                ',' => fields.push(std::mem::take(&mut current)),
                '\n' => {
                    line += 1;
                    if !fields.is_empty() || !current.is_empty() {
                        fields.push(std::mem::take(&mut current));
                        records.push((record_line, std::mem::take(&mut fields)));
                    }
                    record_line = line;
                }
                _ => current.push(c),
            }
        }
    }
    if in_quotes {
        return Err(Error::WireFormat(format!(
            "line {record_line}: unterminated quoted field"
        )));
    }
    if !fields.is_empty() || !current.is_empty() {
        fields.push(current);
        records.push((record_line, fields));
    }
    Ok(records)
}

fn parse_num<T: std::str::FromStr>(s: &str, line_no: usize) -> Result<T> {
    s.parse()
        .map_err(|_| Error::WireFormat(format!("line {line_no}: invalid number {s:?}")))
}

fn parse_opt_num<T: std::str::FromStr>(s: &str, line_no: usize) -> Result<Option<T>> {
    if s.is_empty() {
        Ok(None)
    } else {
        parse_num(s, line_no).map(Some)
    }
}

fn parse_timestamp(s: &str, line_no: usize) -> Result<OffsetDateTime> {
    let secs: i64 = parse_num(s, line_no)?;
    OffsetDateTime::from_unix_timestamp(secs)
        .map_err(|_| Error::WireFormat(format!("line {line_no}: timestamp out of range")))
}
