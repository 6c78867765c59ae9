//! Per-domain title blacklists

use std::collections::{BTreeMap, HashMap};

use regex::Regex;
use url::Url;

use super::matcher::{is_regex_literal, PatternLeaf};
use super::RuleError;
use crate::event::Event;

/// Compiled blacklist: one alternation per domain.
#[derive(Debug, Clone, Default)]
pub struct Blacklist {
    domains: HashMap<String, Regex>,
}

impl Blacklist {
    /// Compiles `domain -> [title | /regex/]` entries.
    ///
    /// # Errors
    ///
    /// Returns `RuleError::InvalidRegex` if any entry or the combined
    /// alternation fails to compile.
    pub fn compile(entries: &BTreeMap<String, Vec<String>>) -> Result<Self, RuleError> {
        let mut domains = HashMap::new();
        for (domain, titles) in entries {
            if titles.is_empty() {
                continue;
            }
            let mut branches = Vec::with_capacity(titles.len());
            for title in titles {
                if is_regex_literal(title) {
                    let leaf = PatternLeaf::compile(title)?;
                    branches.push(format!("(?:{})", leaf.regex().as_str()));
                } else {
                    branches.push(format!("^{}$", regex::escape(title)));
                }
            }
            let combined = Regex::new(&branches.join("|"))
                .map_err(|e| RuleError::InvalidRegex(format!("blacklist for {}: {}", domain, e)))?;
            domains.insert(domain.clone(), combined);
        }
        Ok(Self { domains })
    }

    /// Returns true if the blacklist has no entries.
    pub fn is_empty(&self) -> bool {
        self.domains.is_empty()
    }

    /// Tests an event's `meta.uri` against its domain's entries.
    pub fn is_blacklisted(&self, event: &Event) -> bool {
        let meta = event.meta();
        let Ok(url) = Url::parse(&meta.uri) else {
            return false;
        };
        let domain = if meta.domain.is_empty() {
            url.host_str().unwrap_or_default().to_string()
        } else {
            meta.domain.clone()
        };
        let Some(pattern) = self.domains.get(&domain) else {
            return false;
        };
        let path = percent_decode(url.path());
        let title = path.strip_prefix("/wiki/").unwrap_or(&path);
        pattern.is_match(title)
    }
}

fn percent_decode(input: &str) -> String {
    let bytes = input.as_bytes();
    let mut out = Vec::with_capacity(bytes.len());
    let mut i = 0;
    while i < bytes.len() {
        if bytes[i] == b'%' && i + 2 < bytes.len() {
            let hex = std::str::from_utf8(&bytes[i + 1..i + 3]).ok();
            if let Some(byte) = hex.and_then(|h| u8::from_str_radix(h, 16).ok()) {
                out.push(byte);
                i += 3;
                continue;
            }
        }
        out.push(bytes[i]);
        i += 1;
    }
    String::from_utf8_lossy(&out).into_owned()
}
