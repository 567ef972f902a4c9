//! MIME decoding for inbound mail.
//!
//! [`decode`] turns a raw RFC 5322 blob into a [`DecodedMessage`]: decoded
//! headers, the first text and HTML bodies, and every attachment or inline part
//! as one attachable list. Header words (RFC 2047) are decoded independently
//! of the bodies; a header that cannot be decoded cleanly keeps its raw value.
//!
//! Messages arriving without a Message-ID get one synthesized as
//! `<uuid@domain>`, and the header is spliced into the raw bytes right after
//! the Date header so the stored blob and the mirror copy carry the same id.

use chrono::{DateTime, Utc};
use mailparse::{DispositionType, MailHeader, MailHeaderMap, ParsedMail, parse_mail};
use thiserror::Error;
use uuid::Uuid;

#[derive(Debug, Error)]
pub enum DecodeError {
    #[error("failed to parse MIME structure: {0}")]
    Mime(#[from] mailparse::MailParseError),
    #[error("malformed message: {0}")]
    Malformed(String),
}

/// A part that should be stored as an attachment.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AttachablePart {
    /// Decoded file name. Empty when the part carries none.
    pub file_name: String,
    pub content_type: String,
    pub inline: bool,
    pub data: Vec<u8>,
}

impl AttachablePart {
    pub fn size(&self) -> u64 {
        self.data.len() as u64
    }
}

#[derive(Debug, Clone)]
pub struct DecodedMessage {
    /// Message-ID including angle brackets.
    pub message_id: String,
    pub message_id_synthesized: bool,
    pub subject: String,
    pub from_header: String,
    pub sender_name: String,
    pub sender_email: String,
    pub to_header: String,
    pub cc_header: String,
    pub date_header: String,
    pub date: Option<DateTime<Utc>>,
    pub content_type: String,
    pub text_body: String,
    pub html_body: String,
    pub parts: Vec<AttachablePart>,
    /// Source bytes, with the synthesized Message-ID spliced in when one was added.
    pub raw: Vec<u8>,
}

/// Decode a raw message.
pub fn decode(raw: &[u8], mail_domain: &str) -> Result<DecodedMessage, DecodeError> {
    let parsed = parse_mail(raw)?;
    if parsed.headers.is_empty() {
        return Err(DecodeError::Malformed("no header block".to_string()));
    }

    let header = |name: &str| {
        parsed
            .headers
            .get_first_header(name)
            .map(header_text)
            .unwrap_or_default()
    };

    let subject = header("Subject");
    let from_header = header("From");
    let to_header = header("To");
    let cc_header = header("Cc");
    let date_header = header("Date");
    let content_type = header("Content-Type");

    let (sender_name, sender_email) = parse_sender(&from_header);
    let date = parse_date(&date_header);

    let existing_id = header("Message-ID");
    let (message_id, message_id_synthesized, raw) = if existing_id.is_empty() {
        let synthesized = format!("<{}@{}>", Uuid::new_v4(), mail_domain);
        log::debug!("synthesized message id {}", synthesized);
        let spliced = splice_message_id(raw, &synthesized);
        (synthesized, true, spliced)
    } else {
        (normalize_message_id(&existing_id), false, raw.to_vec())
    };

    let mut bodies = Bodies::default();
    collect_parts(&parsed, &mut bodies);

    Ok(DecodedMessage {
        message_id,
        message_id_synthesized,
        subject,
        from_header,
        sender_name,
        sender_email,
        to_header,
        cc_header,
        date_header,
        date,
        content_type,
        text_body: bodies.text,
        html_body: bodies.html,
        parts: bodies.parts,
        raw,
    })
}

/// Decoded header value, or the raw value when decoding produced replacement characters.
fn header_text(header: &MailHeader) -> String {
    let decoded = header.get_value();
    if decoded.contains('\u{FFFD}') {
        String::from_utf8_lossy(header.get_value_raw()).trim().to_string()
    } else {
        decoded.trim().to_string()
    }
}

/// Decode RFC 2047 encoded words in a free-standing value such as a file name.
pub fn decode_words(value: &str) -> String {
    if !value.contains("=?") {
        return value.trim().to_string();
    }
    let synthetic = format!("X-Decode: {}\r\n", value);
    match mailparse::parse_header(synthetic.as_bytes()) {
        Ok((header, _)) => header_text(&header),
        Err(_) => value.trim().to_string(),
    }
}

pub(crate) fn normalize_message_id(value: &str) -> String {
    let trimmed = value.trim();
    if trimmed.starts_with('<') && trimmed.ends_with('>') {
        trimmed.to_string()
    } else {
        format!("<{}>", trimmed.trim_matches(&['<', '>'][..]))
    }
}

fn parse_sender(from_header: &str) -> (String, String) {
    if let Ok(list) = mailparse::addrparse(from_header) {
        for addr in list.iter() {
            let single = match addr {
                mailparse::MailAddr::Single(info) => Some(info),
                mailparse::MailAddr::Group(group) => group.addrs.first(),
            };
            if let Some(info) = single {
                return (
                    info.display_name.clone().unwrap_or_default(),
                    info.addr.trim().to_lowercase(),
                );
            }
        }
    }
    (String::new(), from_header.trim().to_string())
}

fn parse_date(raw: &str) -> Option<DateTime<Utc>> {
    if raw.trim().is_empty() {
        return None;
    }
    if let Some(dt) = mailparse::dateparse(raw)
        .ok()
        .and_then(|ts| DateTime::from_timestamp(ts, 0))
    {
        return Some(dt);
    }
    dateparser::parse(raw).ok().map(|dt| dt.with_timezone(&Utc))
}

#[derive(Default)]
struct Bodies {
    text: String,
    html: String,
    parts: Vec<AttachablePart>,
}

fn collect_parts(part: &ParsedMail, out: &mut Bodies) {
    if !part.subparts.is_empty() {
        for sub in &part.subparts {
            collect_parts(sub, out);
        }
        return;
    }

    let disposition = part.get_content_disposition();
    let is_attachment = matches!(disposition.disposition, DispositionType::Attachment);
    let file_name = disposition
        .params
        .get("filename")
        .or_else(|| part.ctype.params.get("name"))
        .map(|name| decode_words(name));
    let mimetype = part.ctype.mimetype.to_ascii_lowercase();

    if !is_attachment && file_name.is_none() {
        let slot = match mimetype.as_str() {
            "text/plain" if out.text.is_empty() => Some(&mut out.text),
            "text/html" if out.html.is_empty() => Some(&mut out.html),
            _ => None,
        };
        if let Some(slot) = slot {
            match part.get_body() {
                Ok(body) => *slot = body.replace('\0', ""),
                Err(err) => log::warn!("failed to decode {} body: {}", mimetype, err),
            }
            return;
        }
    }

    let has_content_id = part.headers.get_first_value("Content-ID").is_some();
    if !(is_attachment || file_name.is_some() || has_content_id) {
        return;
    }

    match part.get_body_raw() {
        Ok(data) => out.parts.push(AttachablePart {
            file_name: file_name.unwrap_or_default(),
            content_type: mimetype,
            inline: !is_attachment,
            data,
        }),
        Err(err) => log::warn!("failed to decode {} part: {}", mimetype, err),
    }
}

fn find_header_end(raw: &[u8]) -> usize {
    if let Some(pos) = raw.windows(4).position(|w| w == b"\r\n\r\n") {
        return pos + 2;
    }
    if let Some(pos) = raw.windows(2).position(|w| w == b"\n\n") {
        return pos + 1;
    }
    raw.len()
}

/// Insert a `Message-ID` header after the (possibly folded) Date header, or at
/// the top of the header block when there is no Date header.
pub fn splice_message_id(raw: &[u8], message_id: &str) -> Vec<u8> {
    let newline: &[u8] = if raw.windows(2).any(|w| w == b"\r\n") {
        b"\r\n"
    } else {
        b"\n"
    };
    let header_end = find_header_end(raw);

    let mut insert_at = 0;
    let mut in_date = false;
    let mut pos = 0;
    while pos < header_end {
        let line_end = raw[pos..header_end]
            .iter()
            .position(|&b| b == b'\n')
            .map(|i| pos + i + 1)
            .unwrap_or(header_end);
        let line = &raw[pos..line_end];
        let continuation = matches!(line.first(), Some(b' ') | Some(b'\t'));

        if in_date && !continuation {
            break;
        }
        if !continuation && line.len() >= 5 && line[..5].eq_ignore_ascii_case(b"date:") {
            in_date = true;
        }
        if in_date {
            insert_at = line_end;
        }
        pos = line_end;
    }

    let mut out = Vec::with_capacity(raw.len() + message_id.len() + 16);
    out.extend_from_slice(&raw[..insert_at]);
    if insert_at > 0 && raw[insert_at - 1] != b'\n' {
        out.extend_from_slice(newline);
    }
    out.extend_from_slice(b"Message-ID: ");
    out.extend_from_slice(message_id.as_bytes());
    out.extend_from_slice(newline);
    out.extend_from_slice(&raw[insert_at..]);
    out
}
