// SPDX-License-Identifier: AGPL-3.0-or-later
//! Artifact classification and selection
//!
//! Release assets, freshly built jars and archive entries all go through the
//! same rules: classify by filename suffix, drop the non-runtime variants,
//! then match the remaining names against an anchored, case-sensitive
//! pattern. Matching always looks at the final path segment only.

use std::fmt;

use regex::Regex;
use serde::{Deserialize, Serialize};

use crate::error::{InstallError, Result};

/// Classification of a published or built file
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AssetKind {
    /// Runtime jar
    Jar,
    /// Compressed archive that may contain runtime jars
    Zip,
    /// `-sources.jar`
    Sources,
    /// `-javadoc.jar`
    Javadoc,
    /// `-tests.jar` / `-test.jar`
    Tests,
    /// Anything else (checksums, signatures, tarballs)
    Other,
}

impl AssetKind {
    /// Classify a file by its name
    pub fn classify(name: &str) -> Self {
        let name = file_name(name);

        if name.ends_with("-sources.jar") {
            AssetKind::Sources
        } else if name.ends_with("-javadoc.jar") {
            AssetKind::Javadoc
        } else if name.ends_with("-tests.jar") || name.ends_with("-test.jar") {
            AssetKind::Tests
        } else if name.ends_with(".jar") {
            AssetKind::Jar
        } else if name.ends_with(".zip") {
            AssetKind::Zip
        } else {
            AssetKind::Other
        }
    }

    /// Variants that must never end up in the providers directory
    pub fn is_non_runtime(self) -> bool {
        matches!(
            self,
            AssetKind::Sources | AssetKind::Javadoc | AssetKind::Tests
        )
    }
}

impl fmt::Display for AssetKind {
    fn fmt(&self, formatter: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            AssetKind::Jar => write!(formatter, "jar"),
            AssetKind::Zip => write!(formatter, "zip"),
            AssetKind::Sources => write!(formatter, "sources"),
            AssetKind::Javadoc => write!(formatter, "javadoc"),
            AssetKind::Tests => write!(formatter, "tests"),
            AssetKind::Other => write!(formatter, "other"),
        }
    }
}

/// Final path segment of a name, URL or archive entry
pub fn file_name(name: &str) -> &str {
    name.rsplit('/').next().unwrap_or(name)
}

/// Anything that has a file name the selection rules can look at
pub trait NamedArtifact {
    /// Name as published or as found on disk
    fn artifact_name(&self) -> &str;

    /// Classification derived from the name
    fn kind(&self) -> AssetKind {
        AssetKind::classify(self.artifact_name())
    }
}

impl NamedArtifact for String {
    fn artifact_name(&self) -> &str {
        self
    }
}

/// Filename pattern, anchored at both ends and case-sensitive
#[derive(Debug, Clone)]
pub struct AssetPattern {
    source: String,
    regex: Regex,
}

impl AssetPattern {
    /// Compile a pattern; `^` and `$` are added when missing
    pub fn new(pattern: &str) -> Result<Self> {
        let body = pattern.strip_prefix('^').unwrap_or(pattern);
        let body = body.strip_suffix('$').unwrap_or(body);
        let anchored = format!("^(?:{})$", body);

        let regex = Regex::new(&anchored).map_err(|e| InstallError::InvalidConfig {
            message: format!("invalid asset pattern '{}': {}", pattern, e),
        })?;

        Ok(Self {
            source: pattern.to_string(),
            regex,
        })
    }

    /// Whether the file name (not the full path) matches
    pub fn matches(&self, name: &str) -> bool {
        self.regex.is_match(file_name(name))
    }

    /// The pattern as configured
    pub fn as_str(&self) -> &str {
        &self.source
    }
}

impl fmt::Display for AssetPattern {
    fn fmt(&self, formatter: &mut fmt::Formatter<'_>) -> fmt::Result {
        formatter.write_str(&self.source)
    }
}

/// Which plugins to look for
#[derive(Debug, Clone)]
pub struct SelectionRules {
    /// The RADIUS plugin itself
    pub primary: AssetPattern,
    /// Bundled companion plugin, only looked for when `Some`
    pub secondary: Option<AssetPattern>,
}

/// Where a chosen artifact comes from
#[derive(Debug, PartialEq)]
pub enum Choice<'a, T> {
    /// A runtime jar available as-is
    Direct(&'a T),
    /// Archives to search, most likely first
    Archive(Vec<&'a T>),
}

/// Outcome of running the selection rules over a candidate list
#[derive(Debug, PartialEq)]
pub struct Selection<'a, T> {
    pub primary: Choice<'a, T>,
    pub secondary: Option<Choice<'a, T>>,
}

/// First runtime jar whose file name matches `pattern`
///
/// Non-runtime variants are skipped even when they match and come first.
pub fn select_jar<'a, T: NamedArtifact>(items: &'a [T], pattern: &AssetPattern) -> Option<&'a T> {
    items
        .iter()
        .filter(|item| item.kind() == AssetKind::Jar)
        .find(|item| pattern.matches(item.artifact_name()))
}

/// Zip archives, those whose stem resembles the plugin first
pub fn archive_candidates<'a, T: NamedArtifact>(items: &'a [T], pattern: &AssetPattern) -> Vec<&'a T> {
    let mut archives: Vec<&T> = items
        .iter()
        .filter(|item| item.kind() == AssetKind::Zip)
        .collect();

    archives.sort_by_key(|item| {
        let stem = file_name(item.artifact_name()).trim_end_matches(".zip");
        !pattern.matches(&format!("{}.jar", stem))
    });
    archives
}

/// Apply `rules` to a list of candidates
///
/// Returns `None` when the primary plugin has neither a direct jar nor an
/// archive to extract it from, or when a requested secondary plugin has
/// neither.
pub fn select<'a, T: NamedArtifact>(items: &'a [T], rules: &SelectionRules) -> Option<Selection<'a, T>> {
    let primary = choose(items, &rules.primary)?;

    let secondary = match &rules.secondary {
        Some(pattern) => {
            let choice = choose(items, pattern)?;
            if let (Choice::Direct(primary_item), Choice::Direct(secondary_item)) =
                (&primary, &choice)
            {
                if primary_item.artifact_name() == secondary_item.artifact_name() {
                    return None;
                }
            }
            Some(choice)
        }
        None => None,
    };

    Some(Selection { primary, secondary })
}

fn choose<'a, T: NamedArtifact>(items: &'a [T], pattern: &AssetPattern) -> Option<Choice<'a, T>> {
    if let Some(item) = select_jar(items, pattern) {
        return Some(Choice::Direct(item));
    }

    let archives = archive_candidates(items, pattern);
    if archives.is_empty() {
        None
    } else {
        Some(Choice::Archive(archives))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn names(list: &[&str]) -> Vec<String> {
        list.iter().map(|name| name.to_string()).collect()
    }

    fn primary() -> AssetPattern {
        AssetPattern::new(r"radius-plugin-.*\.jar").unwrap()
    }

    #[test]
    fn test_classify() {
        assert_eq!(AssetKind::classify("radius-plugin-1.2.jar"), AssetKind::Jar);
        assert_eq!(AssetKind::classify("radius-plugin-1.2-sources.jar"), AssetKind::Sources);
        assert_eq!(AssetKind::classify("radius-plugin-1.2-javadoc.jar"), AssetKind::Javadoc);
        assert_eq!(AssetKind::classify("radius-plugin-1.2-tests.jar"), AssetKind::Tests);
        assert_eq!(AssetKind::classify("bundle.zip"), AssetKind::Zip);
        assert_eq!(AssetKind::classify("bundle.zip.sha256"), AssetKind::Other);
        assert_eq!(AssetKind::classify("dir/radius-plugin-1.2.jar"), AssetKind::Jar);
    }

    #[test]
    fn test_release_with_variants_selects_runtime_jar() {
        let assets = names(&[
            "radius-plugin-1.2.jar",
            "radius-plugin-1.2-sources.jar",
            "radius-plugin-1.2-tests.jar",
        ]);
        assert_eq!(
            select_jar(&assets, &primary()).map(String::as_str),
            Some("radius-plugin-1.2.jar")
        );
    }

    #[test]
    fn test_variant_listed_first_is_still_skipped() {
        let assets = names(&[
            "radius-plugin-1.2-javadoc.jar",
            "radius-plugin-1.2-sources.jar",
            "radius-plugin-1.2-tests.jar",
            "radius-plugin-1.2.jar",
        ]);
        let loose = AssetPattern::new(r".*\.jar").unwrap();
        assert_eq!(
            select_jar(&assets, &loose).map(String::as_str),
            Some("radius-plugin-1.2.jar")
        );
    }

    #[test]
    fn test_only_variants_selects_nothing() {
        let assets = names(&["radius-plugin-1.2-sources.jar", "radius-plugin-1.2-tests.jar"]);
        assert!(select_jar(&assets, &primary()).is_none());
        assert!(select(&assets, &SelectionRules {
            primary: primary(),
            secondary: None,
        })
        .is_none());
    }

    #[test]
    fn test_pattern_is_case_sensitive() {
        let assets = names(&["Radius-Plugin-1.2.jar"]);
        assert!(select_jar(&assets, &primary()).is_none());
    }

    #[test]
    fn test_pattern_is_anchored_to_file_name() {
        let pattern = primary();
        assert!(!pattern.matches("https://example.com/radius-plugin-1.2.jar/download/other.jar"));
        assert!(pattern.matches("https://example.com/releases/radius-plugin-1.2.jar"));
        assert!(!pattern.matches("my-radius-plugin-1.2.jar"));
        assert!(!pattern.matches("radius-plugin-1.2.jar.asc"));
    }

    #[test]
    fn test_explicit_anchors_are_not_doubled() {
        let pattern = AssetPattern::new(r"^radius-plugin-.*\.jar$").unwrap();
        assert!(pattern.matches("radius-plugin-1.2.jar"));
        assert_eq!(pattern.as_str(), r"^radius-plugin-.*\.jar$");
    }

    #[test]
    fn test_invalid_pattern_is_config_error() {
        let error = AssetPattern::new("radius-(plugin").unwrap_err();
        assert!(matches!(error, InstallError::InvalidConfig { .. }));
    }

    #[test]
    fn test_primary_preferred_over_secondary() {
        let assets = names(&["rad-sec-plugin-1.2.jar", "radius-plugin-1.2.jar"]);
        let rules = SelectionRules {
            primary: primary(),
            secondary: None,
        };
        let selection = select(&assets, &rules).unwrap();
        assert_eq!(selection.primary, Choice::Direct(&assets[1]));
        assert!(selection.secondary.is_none());
    }

    #[test]
    fn test_secondary_selected_when_requested() {
        let assets = names(&["rad-sec-plugin-1.2.jar", "radius-plugin-1.2.jar"]);
        let rules = SelectionRules {
            primary: primary(),
            secondary: Some(AssetPattern::new(r"rad-sec-plugin-.*\.jar").unwrap()),
        };
        let selection = select(&assets, &rules).unwrap();
        assert_eq!(selection.secondary, Some(Choice::Direct(&assets[0])));
    }

    #[test]
    fn test_missing_requested_secondary_fails_selection() {
        let assets = names(&["radius-plugin-1.2.jar"]);
        let rules = SelectionRules {
            primary: primary(),
            secondary: Some(AssetPattern::new(r"rad-sec-plugin-.*\.jar").unwrap()),
        };
        assert!(select(&assets, &rules).is_none());
    }

    #[test]
    fn test_archive_fallback() {
        let assets = names(&["checksums.txt", "other.zip", "radius-plugin-1.2.zip"]);
        let rules = SelectionRules {
            primary: primary(),
            secondary: None,
        };
        let selection = select(&assets, &rules).unwrap();
        assert_eq!(
            selection.primary,
            Choice::Archive(vec![&assets[2], &assets[1]])
        );
    }

    #[test]
    fn test_archive_entries_use_last_segment() {
        let entries = names(&[
            "keycloak-radius-plugin/",
            "keycloak-radius-plugin/radius-plugin-1.2-sources.jar",
            "keycloak-radius-plugin/radius-plugin-1.2.jar",
        ]);
        assert_eq!(
            select_jar(&entries, &primary()).map(String::as_str),
            Some("keycloak-radius-plugin/radius-plugin-1.2.jar")
        );
    }
}
