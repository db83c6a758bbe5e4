//! Classify — decide which status-line descriptor, if any, a message belongs to.
//!
//! Plain triggers are tried before keyed (regex) descriptors. Within each
//! group the longest trigger wins; identical triggers never reach this point
//! because they are rejected when the configuration is loaded. The legacy
//! form of the primary status line is checked first of all.

use grep_matcher::{Captures, Matcher};

use crate::conf::builtin::{LEGACY_PRIMARY_FIRST_FIELD, LEGACY_PRIMARY_TRIGGER};
use crate::conf::{DescriptorId, DescriptorKind, DescriptorSet};

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Classification<'a> {
    pub descriptor: DescriptorId,
    /// Resource key captured by a keyed descriptor
    pub key: Option<&'a str>,
    /// Text holding the `key=value` fields
    pub body: &'a str,
}

pub struct LineClassifier<'d> {
    set: &'d DescriptorSet,
    /// (trigger, id), longest trigger first
    simple: Vec<(&'d str, DescriptorId)>,
    keyed: Vec<(&'d str, DescriptorId)>,
}

impl<'d> LineClassifier<'d> {
    pub fn new(set: &'d DescriptorSet) -> Self {
        let mut simple = Vec::new();
        let mut keyed = Vec::new();
        for d in set.iter() {
            match d.kind {
                DescriptorKind::Simple => simple.push((d.trigger.as_str(), d.id)),
                DescriptorKind::Keyed(_) => keyed.push((d.trigger.as_str(), d.id)),
            }
        }
        // Stable sort keeps declaration order among equal lengths.
        simple.sort_by(|a, b| b.0.len().cmp(&a.0.len()));
        keyed.sort_by(|a, b| b.0.len().cmp(&a.0.len()));
        Self { set, simple, keyed }
    }

    pub fn classify<'a>(&self, message: &'a str) -> Option<Classification<'a>> {
        if let Some(body) = message
            .strip_prefix(LEGACY_PRIMARY_TRIGGER)
            .filter(|b| b.starts_with(LEGACY_PRIMARY_FIRST_FIELD))
        {
            return Some(Classification { descriptor: self.set.primary().id, key: None, body });
        }

        for (trigger, id) in &self.simple {
            if let Some(body) = match_trigger(message, trigger) {
                return Some(Classification { descriptor: *id, key: None, body });
            }
        }

        for (trigger, id) in &self.keyed {
            if !message.starts_with(trigger) {
                continue;
            }
            if let Some(found) = self.match_keyed(*id, message) {
                return Some(found);
            }
        }

        None
    }

    fn match_keyed<'a>(&self, id: DescriptorId, message: &'a str) -> Option<Classification<'a>> {
        let spec = self.set.get(id).keyed()?;
        let mut caps = spec.matcher.new_captures().ok()?;
        if !spec.matcher.captures(message.as_bytes(), &mut caps).ok()? {
            return None;
        }
        let whole = caps.get(0)?;
        let key = caps.get(spec.key_group)?;
        Some(Classification {
            descriptor: id,
            key: Some(message.get(key.start()..key.end())?),
            body: message.get(whole.end()..)?.trim_start(),
        })
    }
}

/// The text after `trigger` when `message` starts with it at a word boundary.
fn match_trigger<'a>(message: &'a str, trigger: &str) -> Option<&'a str> {
    let rest = message.strip_prefix(trigger)?;
    match rest.as_bytes().first() {
        None => Some(rest),
        Some(b':') => Some(rest[1..].trim_start()),
        Some(b' ') => {
            let rest = rest.trim_start();
            Some(rest.strip_prefix(':').unwrap_or(rest).trim_start())
        }
        Some(_) => None,
    }
}
