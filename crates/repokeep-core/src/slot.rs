//! Repository slot allocation against a shared backup-tool configuration.
//!
//! Several backup sources write into one destination. Each source owns a
//! numbered slot, visible in the destination's INI configuration as keys of
//! the form `<prefix><N>-<attribute>=<value>` (e.g. `pg2-host=10.0.0.12`).
//!
//! Allocation is read-then-write with no lock: two sources allocating
//! against the same destination at the same moment can both pick the same
//! "next" slot. `register` re-reads the configuration right before writing
//! and refuses to claim a slot another owner already holds, which narrows
//! the window but does not close it.

use std::collections::BTreeMap;

use regex::Regex;
use serde::Serialize;
use tracing::{info, warn};

use crate::error::{RepokeepError, Result};
use crate::remote::RemoteChannel;

/// Result of an allocation call.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SlotAssignment {
    pub owner_identity: String,
    pub slot_number: u32,
    /// True when the destination already listed this owner.
    pub existing: bool,
}

#[derive(Debug, Clone)]
pub struct RepositorySlotAllocator {
    prefix: String,
    owner_attribute: String,
    key_re: Regex,
}

impl RepositorySlotAllocator {
    pub fn new(prefix: &str, owner_attribute: &str) -> Result<Self> {
        if prefix.is_empty() || owner_attribute.is_empty() {
            return Err(RepokeepError::Configuration(
                "slot prefix and owner attribute must not be empty".to_string(),
            ));
        }
        let pattern = format!(r"^{}([^-=\s]+)-([^=\s]+)\s*=\s*(.*)$", regex::escape(prefix));
        let key_re = Regex::new(&pattern)
            .map_err(|e| RepokeepError::Configuration(format!("bad slot prefix: {e}")))?;
        Ok(Self {
            prefix: prefix.to_string(),
            owner_attribute: owner_attribute.to_string(),
            key_re,
        })
    }

    pub fn slot_key(&self, slot: u32, attribute: &str) -> String {
        format!("{}{}-{}", self.prefix, slot, attribute)
    }

    /// Every slot present in `text`, with its owner if the owner attribute is set.
    pub fn existing_slots(&self, text: &str) -> Result<BTreeMap<u32, Option<String>>> {
        let mut slots: BTreeMap<u32, Option<String>> = BTreeMap::new();
        for (idx, raw) in text.lines().enumerate() {
            let line = raw.trim();
            if line.is_empty() || line.starts_with('#') || line.starts_with(';') || line.starts_with('[')
            {
                continue;
            }
            let Some(caps) = self.key_re.captures(line) else {
                continue;
            };
            let id = &caps[1];
            if !id.chars().all(|c| c.is_ascii_digit()) {
                return Err(RepokeepError::Allocation(format!(
                    "line {}: '{}{id}' does not carry a numeric slot",
                    idx + 1,
                    self.prefix
                )));
            }
            let slot: u32 = id.parse().map_err(|_| {
                RepokeepError::Allocation(format!("line {}: slot '{id}' out of range", idx + 1))
            })?;
            if slot == 0 {
                return Err(RepokeepError::Allocation(format!(
                    "line {}: slot numbers start at 1",
                    idx + 1
                )));
            }
            let entry = slots.entry(slot).or_insert(None);
            if &caps[2] == self.owner_attribute {
                let owner = caps[3].trim().to_string();
                match entry {
                    Some(existing) if *existing != owner => {
                        return Err(RepokeepError::Allocation(format!(
                            "slot {slot} lists conflicting owners '{existing}' and '{owner}'"
                        )));
                    }
                    _ => *entry = Some(owner),
                }
            }
        }
        Ok(slots)
    }

    /// Pure allocation against configuration text.
    pub fn allocate_from_text(&self, text: &str, owner_identity: &str) -> Result<SlotAssignment> {
        let slots = self.existing_slots(text)?;

        let owned: Vec<u32> = slots
            .iter()
            .filter(|(_, owner)| owner.as_deref() == Some(owner_identity))
            .map(|(slot, _)| *slot)
            .collect();
        if let Some(&slot) = owned.first() {
            if owned.len() > 1 {
                warn!(owner = owner_identity, ?owned, "owner holds several slots; using the lowest");
            }
            return Ok(SlotAssignment {
                owner_identity: owner_identity.to_string(),
                slot_number: slot,
                existing: true,
            });
        }

        let next = match slots.keys().next_back() {
            Some(max) => max.checked_add(1).ok_or_else(|| {
                RepokeepError::Allocation("slot numbers exhausted".to_string())
            })?,
            None => 1,
        };
        Ok(SlotAssignment {
            owner_identity: owner_identity.to_string(),
            slot_number: next,
            existing: false,
        })
    }

    /// Read the destination configuration and allocate a slot for `owner_identity`.
    /// Nothing is written; see `register`.
    pub fn allocate(
        &self,
        channel: &dyn RemoteChannel,
        host: &str,
        config_path: &str,
        owner_identity: &str,
    ) -> Result<SlotAssignment> {
        let text = channel.read_config(host, config_path)?;
        let assignment = self.allocate_from_text(&text, owner_identity)?;
        info!(
            owner = owner_identity,
            slot = assignment.slot_number,
            existing = assignment.existing,
            "repository slot allocated"
        );
        Ok(assignment)
    }

    /// Add this owner's slot entries to `section` of the destination
    /// configuration. Returns false when the entries were already present.
    pub fn register(
        &self,
        channel: &dyn RemoteChannel,
        host: &str,
        config_path: &str,
        section: &str,
        slot: u32,
        owner_identity: &str,
        extra: &[(&str, &str)],
    ) -> Result<bool> {
        let text = channel.read_config(host, config_path)?;
        let slots = self.existing_slots(&text)?;
        if let Some(Some(owner)) = slots.get(&slot) {
            if owner != owner_identity {
                return Err(RepokeepError::Allocation(format!(
                    "slot {slot} was claimed by '{owner}' since it was allocated; \
                     allocate again with 'repokeep run setup --force-step allocate_slot'"
                )));
            }
        }

        let mut entries = vec![(self.slot_key(slot, &self.owner_attribute), owner_identity.to_string())];
        for (attr, value) in extra {
            entries.push((self.slot_key(slot, attr), value.to_string()));
        }

        match upsert_section_entries(&text, section, &entries) {
            Some(updated) => {
                channel.write_config(host, config_path, &updated)?;
                info!(slot, section, "slot entries written to destination");
                Ok(true)
            }
            None => Ok(false),
        }
    }
}

/// Insert or update `key=value` lines inside `[section]`, creating the
/// section at the end if needed. Returns `None` when nothing changed.
pub fn upsert_section_entries(text: &str, section: &str, entries: &[(String, String)]) -> Option<String> {
    let mut lines: Vec<String> = text.lines().map(str::to_string).collect();
    let header = format!("[{section}]");

    let start = match lines.iter().position(|l| l.trim() == header) {
        Some(i) => i,
        None => {
            if lines.last().is_some_and(|l| !l.trim().is_empty()) {
                lines.push(String::new());
            }
            lines.push(header.clone());
            lines.len() - 1
        }
    };
    let mut end = lines[start + 1..]
        .iter()
        .position(|l| l.trim_start().starts_with('['))
        .map(|p| start + 1 + p)
        .unwrap_or(lines.len());

    let mut changed = false;
    for (key, value) in entries {
        let wanted = format!("{key}={value}");
        let existing = lines[start + 1..end].iter().position(|l| {
            l.split_once('=')
                .is_some_and(|(k, _)| k.trim() == key.as_str())
        });
        match existing {
            Some(offset) => {
                let idx = start + 1 + offset;
                let current = lines[idx].split_once('=').map(|(_, v)| v.trim());
                if current != Some(value.as_str()) {
                    lines[idx] = wanted;
                    changed = true;
                }
            }
            None => {
                // Insert after the last non-blank line of the section.
                let mut at = end;
                while at > start + 1 && lines[at - 1].trim().is_empty() {
                    at -= 1;
                }
                lines.insert(at, wanted);
                end += 1;
                changed = true;
            }
        }
    }

    if !changed {
        return None;
    }
    let mut out = lines.join("\n");
    out.push('\n');
    Some(out)
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
