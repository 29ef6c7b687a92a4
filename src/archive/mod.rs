// Archive units: naming, multi-part grouping, extraction and media discovery
//
// A unit is what the ledger tracks and the extractor unpacks: either a single
// `.zip` or a complete multi-part set. Two multi-part layouts are recognized:
//   name.zip.001, name.zip.002, ...     (byte-split)
//   name.z01, name.z02, ..., name.zip   (split, directory in the final .zip)

pub mod discover;
pub mod extract;

use std::collections::BTreeMap;
use std::sync::OnceLock;
use regex::Regex;

use crate::remote::RemoteFile;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PartStyle {
    Single,
    Numbered,
    Split,
}

/// Parsed archive file name
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PartName {
    pub set_name: String,
    /// 1-based part index; the final `.zip` of a split set and single archives use 0
    pub index: u32,
    pub style: PartStyle,
}

fn numbered_re() -> Option<&'static Regex> {
    static RE: OnceLock<Option<Regex>> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"(?i)^(?P<base>.+\.zip)\.(?P<idx>\d{3})$").ok())
        .as_ref()
}

fn split_re() -> Option<&'static Regex> {
    static RE: OnceLock<Option<Regex>> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"(?i)^(?P<stem>.+)\.z(?P<idx>\d{2})$").ok())
        .as_ref()
}

/// Classify one file name. A plain `.zip` is reported as Single; whether it is
/// really the last part of a split set is only known from the full listing.
pub fn parse_part_name(name: &str) -> PartName {
    if let Some(caps) = numbered_re().and_then(|re| re.captures(name)) {
        return PartName {
            set_name: caps["base"].to_string(),
            index: caps["idx"].parse().unwrap_or(0),
            style: PartStyle::Numbered,
        };
    }
    if let Some(caps) = split_re().and_then(|re| re.captures(name)) {
        return PartName {
            set_name: format!("{}.zip", &caps["stem"]),
            index: caps["idx"].parse().unwrap_or(0),
            style: PartStyle::Split,
        };
    }
    PartName {
        set_name: name.to_string(),
        index: 0,
        style: PartStyle::Single,
    }
}

/// One unit of work: a single archive or a multi-part set
#[derive(Debug, Clone)]
pub struct ArchiveUnit {
    pub name: String,
    pub style: PartStyle,
    /// Parts in concatenation order
    pub parts: Vec<RemoteFile>,
    /// Part names the listing should contain but does not
    pub missing_parts: Vec<String>,
}

impl ArchiveUnit {
    pub fn single(file: RemoteFile) -> Self {
        Self {
            name: file.name.clone(),
            style: PartStyle::Single,
            parts: vec![file],
            missing_parts: Vec::new(),
        }
    }

    pub fn is_multi_part(&self) -> bool {
        self.style != PartStyle::Single
    }

    pub fn is_complete(&self) -> bool {
        self.missing_parts.is_empty() && !self.parts.is_empty()
    }

    pub fn total_size(&self) -> u64 {
        self.parts.iter().map(|p| p.size).sum()
    }

    /// Remote identity of the unit; multi-part sets join their part ids
    pub fn remote_id(&self) -> String {
        self.parts
            .iter()
            .map(|p| p.id.as_str())
            .collect::<Vec<_>>()
            .join("+")
    }
}

#[derive(Default)]
struct PendingSet {
    display_name: Option<String>,
    style: Option<PartStyle>,
    indexed: BTreeMap<u32, RemoteFile>,
    final_part: Option<RemoteFile>,
}

/// Group a remote listing into archive units, sorted by unit name
pub fn group_units(files: &[RemoteFile]) -> Vec<ArchiveUnit> {
    let mut sets: BTreeMap<String, PendingSet> = BTreeMap::new();
    let mut plain: Vec<RemoteFile> = Vec::new();

    for file in files {
        let part = parse_part_name(&file.name);
        match part.style {
            PartStyle::Single => plain.push(file.clone()),
            style => {
                let set = sets.entry(part.set_name.to_lowercase()).or_default();
                set.display_name.get_or_insert(part.set_name.clone());
                // a set mixing both layouts keeps the first one seen
                set.style.get_or_insert(style);
                set.indexed.insert(part.index, file.clone());
            }
        }
    }

    let mut units = Vec::new();
    for file in plain {
        match sets.get_mut(&file.name.to_lowercase()) {
            Some(set) if set.style == Some(PartStyle::Split) => {
                set.display_name = Some(file.name.clone());
                set.final_part = Some(file);
            }
            _ => units.push(ArchiveUnit::single(file)),
        }
    }

    for (key, set) in sets {
        let style = set.style.unwrap_or(PartStyle::Numbered);
        let name = set.display_name.unwrap_or(key);
        let max_index = set.indexed.keys().next_back().copied().unwrap_or(0);

        let mut missing: Vec<String> = Vec::new();
        for i in 1..=max_index {
            if !set.indexed.contains_key(&i) {
                missing.push(match style {
                    PartStyle::Split => split_part_name(&name, i),
                    _ => format!("{}.{:03}", name, i),
                });
            }
        }

        let mut parts: Vec<RemoteFile> = set.indexed.into_values().collect();
        if style == PartStyle::Split {
            match set.final_part {
                Some(last) => parts.push(last),
                None => missing.push(name.clone()),
            }
        }

        units.push(ArchiveUnit {
            name,
            style,
            parts,
            missing_parts: missing,
        });
    }

    units.sort_by(|a, b| a.name.cmp(&b.name));
    units
}

fn split_part_name(set_name: &str, index: u32) -> String {
    let stem = set_name
        .strip_suffix(".zip")
        .or_else(|| set_name.strip_suffix(".ZIP"))
        .unwrap_or(set_name);
    format!("{}.z{:02}", stem, index)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn remote(name: &str, size: u64) -> RemoteFile {
        RemoteFile {
            id: format!("id-{}", name),
            name: name.to_string(),
            size,
            modified_time: None,
        }
    }

    #[test]
    fn test_parse_part_names() {
        assert_eq!(
            parse_part_name("takeout.zip.002"),
            PartName { set_name: "takeout.zip".into(), index: 2, style: PartStyle::Numbered }
        );
        assert_eq!(
            parse_part_name("takeout.z01"),
            PartName { set_name: "takeout.zip".into(), index: 1, style: PartStyle::Split }
        );
        assert_eq!(parse_part_name("takeout-001.zip").style, PartStyle::Single);
    }

    #[test]
    fn test_numbered_exports_are_independent_units() {
        let units = group_units(&[remote("a-002.zip", 2), remote("a-001.zip", 1)]);
        let names: Vec<&str> = units.iter().map(|u| u.name.as_str()).collect();
        assert_eq!(names, vec!["a-001.zip", "a-002.zip"]);
        assert!(units.iter().all(|u| !u.is_multi_part() && u.is_complete()));
    }

    #[test]
    fn test_split_set_groups_with_final_zip() {
        let units = group_units(&[
            remote("set.zip", 5),
            remote("set.z02", 10),
            remote("set.z01", 10),
            remote("other.zip", 1),
        ]);
        assert_eq!(units.len(), 2);
        let set = units.iter().find(|u| u.name == "set.zip").unwrap();
        assert_eq!(set.style, PartStyle::Split);
        assert!(set.is_complete());
        let order: Vec<&str> = set.parts.iter().map(|p| p.name.as_str()).collect();
        assert_eq!(order, vec!["set.z01", "set.z02", "set.zip"]);
        assert_eq!(set.total_size(), 25);
        assert_eq!(set.remote_id(), "id-set.z01+id-set.z02+id-set.zip");
    }

    #[test]
    fn test_missing_parts_are_reported() {
        let units = group_units(&[remote("big.zip.001", 1), remote("big.zip.003", 1), remote("s.z01", 1)]);

        let big = units.iter().find(|u| u.name == "big.zip").unwrap();
        assert!(!big.is_complete());
        assert_eq!(big.missing_parts, vec!["big.zip.002".to_string()]);

        let split = units.iter().find(|u| u.name == "s.zip").unwrap();
        assert_eq!(split.missing_parts, vec!["s.zip".to_string()]);
    }
}
