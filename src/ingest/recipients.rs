//! Recipient classification.
//!
//! The transport envelope lists every address the message was accepted for,
//! while the To and Cc headers only list the visible ones. Any envelope
//! recipient missing from the headers was a blind copy.

use mailparse::MailAddr;
use serde::Serialize;
use std::collections::HashSet;

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct Recipients {
    pub to: Vec<String>,
    pub cc: Vec<String>,
    pub bcc: Vec<String>,
    /// `to`, then `cc`, then `bcc`, without duplicates.
    pub all: Vec<String>,
}

/// Classify recipients. `Bcc = declared - (To ∪ Cc)`; `All = To ∪ Cc ∪ Bcc`.
///
/// Addresses are compared in their bare, lower-cased form.
pub fn classify(declared: &[String], to_header: &str, cc_header: &str) -> Recipients {
    let to = parse_address_list(to_header);
    let cc = parse_address_list(cc_header);

    let bcc: Vec<String> = {
        let visible: HashSet<&str> = to.iter().chain(cc.iter()).map(String::as_str).collect();
        let mut seen = HashSet::new();
        declared
            .iter()
            .filter_map(|raw| normalize_address(raw))
            .filter(|addr| !visible.contains(addr.as_str()))
            .filter(|addr| seen.insert(addr.clone()))
            .collect()
    };

    let all: Vec<String> = {
        let mut seen = HashSet::new();
        to.iter()
            .chain(cc.iter())
            .chain(bcc.iter())
            .filter(|addr| seen.insert(addr.as_str()))
            .cloned()
            .collect()
    };

    Recipients { to, cc, bcc, all }
}

/// Parse a header-style address list into bare, lower-cased, de-duplicated
/// addresses. Entries that fail to parse are logged and dropped.
pub fn parse_address_list(header: &str) -> Vec<String> {
    if header.trim().is_empty() {
        return Vec::new();
    }

    let mut out = Vec::new();
    match mailparse::addrparse(header) {
        Ok(list) => {
            for addr in list.iter() {
                collect_addr(addr, &mut out);
            }
        }
        Err(err) => {
            log::debug!("address list `{}` failed to parse as a whole: {}", header, err);
            for entry in header.split(',').map(str::trim).filter(|e| !e.is_empty()) {
                match mailparse::addrparse(entry) {
                    Ok(list) => {
                        for addr in list.iter() {
                            collect_addr(addr, &mut out);
                        }
                    }
                    Err(err) => log::warn!("dropping unparseable address `{}`: {}", entry, err),
                }
            }
        }
    }

    let mut seen = HashSet::new();
    out.retain(|addr| seen.insert(addr.clone()));
    out
}

fn collect_addr(addr: &MailAddr, out: &mut Vec<String>) {
    match addr {
        MailAddr::Single(info) => push_normalized(&info.addr, out),
        MailAddr::Group(group) => {
            for info in &group.addrs {
                push_normalized(&info.addr, out);
            }
        }
    }
}

fn push_normalized(raw: &str, out: &mut Vec<String>) {
    match normalize_address(raw) {
        Some(addr) => out.push(addr),
        None => log::warn!("dropping invalid address `{}`", raw),
    }
}

/// Bare mailbox form: trimmed, without angle brackets, lower-cased.
pub fn normalize_address(raw: &str) -> Option<String> {
    let bare = raw.trim().trim_start_matches('<').trim_end_matches('>').trim();
    match bare.split_once('@') {
        Some((local, domain)) if !local.is_empty() && !domain.is_empty() && !bare.contains(' ') => {
            Some(bare.to_lowercase())
        }
        _ => None,
    }
}
