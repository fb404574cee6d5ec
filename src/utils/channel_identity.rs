//! Channel name normalization and variant identity
//!
//! Raw upstream channel names are noisy: quality tags, bracketed region
//! markers, provider prefixes. This module turns a raw name into a stable
//! `normalized_name` key. Two channels that normalize to the same key are
//! treated as variants of one logical channel across sources, which is what
//! drives variant discovery and failover.
//!
//! The normalization is a pure function of the cleaned name and must stay
//! bit-identical across invocations: the key is persisted in the catalog
//! and compared against freshly computed values.

use regex::Regex;
use tracing::warn;

use crate::models::{ChannelCleanupRule, Quality};

/// Result of analyzing one raw channel name.
#[derive(Debug, Clone, PartialEq)]
pub struct ChannelIdentity {
    /// Display name after cleanup rules and quality-tag stripping.
    pub display_name: String,
    /// Quality extracted from the raw name.
    pub quality: Quality,
    /// Stable dedup key; empty when nothing survives normalization, in
    /// which case the channel is kept but never deduplicated.
    pub normalized_name: String,
}

/// Compiled normalizer. Construct once and reuse; the tier patterns are
/// checked in order and the first hit wins.
pub struct ChannelNameNormalizer {
    quality_tiers: Vec<(Regex, Quality)>,
    defensive_tokens: Regex,
    whitespace: Regex,
}

impl Default for ChannelNameNormalizer {
    fn default() -> Self {
        Self::new()
    }
}

impl ChannelNameNormalizer {
    pub fn new() -> Self {
        // Unwraps are safe: the patterns are fixed literals.
        let quality_tiers = vec![
            (Regex::new(r"(?i)UHD|4K|2160p").unwrap(), Quality::Uhd),
            (Regex::new(r"(?i)FHD|1080p").unwrap(), Quality::Fhd),
            (Regex::new(r"(?i)HD|720p").unwrap(), Quality::Hd),
            (Regex::new(r"(?i)SD").unwrap(), Quality::Sd),
        ];

        Self {
            quality_tiers,
            defensive_tokens: Regex::new(r"\b(hd|fhd|uhd|4k|sd|hevc|h\.?265)\b").unwrap(),
            whitespace: Regex::new(r"\s+").unwrap(),
        }
    }

    /// Apply user-defined cleanup rules in order. Disabled rules are
    /// skipped; an invalid regex rule is skipped with a warning rather than
    /// failing the whole pass.
    pub fn apply_cleanup_rules(&self, name: &str, rules: &[ChannelCleanupRule]) -> String {
        let mut result = name.to_string();
        for rule in rules {
            if !rule.is_enabled {
                continue;
            }
            if rule.is_regex {
                match Regex::new(&rule.find_pattern) {
                    Ok(re) => {
                        result = re.replace_all(&result, rule.replace_with.as_str()).into_owned();
                    }
                    Err(e) => {
                        warn!("Skipping invalid cleanup rule {}: {}", rule.id, e);
                    }
                }
            } else {
                result = result.replace(&rule.find_pattern, &rule.replace_with);
            }
        }
        result
    }

    /// Pull the quality tag out of a cleaned name. The first matching tier
    /// wins (UHD before FHD before HD before SD, so `FHD` never reads as
    /// `HD`), the matched token is removed, and the remainder is
    /// whitespace-collapsed.
    pub fn extract_quality(&self, name: &str) -> (Quality, String) {
        for (pattern, quality) in &self.quality_tiers {
            if let Some(m) = pattern.find(name) {
                let mut stripped = String::with_capacity(name.len());
                stripped.push_str(&name[..m.start()]);
                stripped.push_str(&name[m.end()..]);
                let collapsed = self.collapse_whitespace(&stripped);
                return (*quality, collapsed);
            }
        }
        (Quality::Unknown, self.collapse_whitespace(name))
    }

    /// The dedup key: lowercase, residual quality tokens removed, every
    /// non-alphanumeric character dropped. An empty result means the name
    /// carries no usable identity.
    pub fn normalize(&self, cleaned_name: &str) -> String {
        let lower = cleaned_name.to_lowercase();
        let without_tokens = self.defensive_tokens.replace_all(&lower, "");
        without_tokens
            .chars()
            .filter(|c| c.is_ascii_lowercase() || c.is_ascii_digit())
            .collect()
    }

    /// Full pipeline: cleanup rules, quality extraction, normalization.
    pub fn analyze(&self, raw_name: &str, rules: &[ChannelCleanupRule]) -> ChannelIdentity {
        let cleaned = self.apply_cleanup_rules(raw_name, rules);
        let (quality, display_name) = self.extract_quality(&cleaned);
        let normalized_name = self.normalize(&display_name);

        ChannelIdentity {
            display_name,
            quality,
            normalized_name,
        }
    }

    fn collapse_whitespace(&self, s: &str) -> String {
        self.whitespace.replace_all(s.trim(), " ").into_owned()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn rule(id: i64, find: &str, replace: &str, is_regex: bool) -> ChannelCleanupRule {
        ChannelCleanupRule {
            id,
            source_id: None,
            find_pattern: find.to_string(),
            replace_with: replace.to_string(),
            is_regex,
            is_enabled: true,
            sort_order: id,
        }
    }

    #[test]
    fn quality_extraction_first_match_wins() {
        let n = ChannelNameNormalizer::new();

        let (q, rest) = n.extract_quality("BBC One FHD");
        assert_eq!(q, Quality::Fhd);
        assert_eq!(rest, "BBC One");

        let (q, _) = n.extract_quality("Discovery UHD");
        assert_eq!(q, Quality::Uhd);

        let (q, rest) = n.extract_quality("CNN 1080p");
        assert_eq!(q, Quality::Fhd);
        assert_eq!(rest, "CNN");

        let (q, rest) = n.extract_quality("Plain Channel");
        assert_eq!(q, Quality::Unknown);
        assert_eq!(rest, "Plain Channel");
    }

    #[test]
    fn normalization_is_case_and_whitespace_insensitive() {
        let n = ChannelNameNormalizer::new();
        assert_eq!(n.normalize("BBC One"), n.normalize("bbc   ONE"));
        assert_eq!(n.normalize("BBC One"), "bbcone");
    }

    #[test]
    fn normalization_strips_residual_quality_tokens() {
        let n = ChannelNameNormalizer::new();
        assert_eq!(n.normalize("bbc one hd"), "bbcone");
        assert_eq!(n.normalize("bbc one hevc"), "bbcone");
        assert_eq!(n.normalize("bbc one h.265"), "bbcone");
        // Tokens inside words are left alone.
        assert_eq!(n.normalize("shdtv"), "shdtv");
    }

    #[test]
    fn normalization_is_idempotent() {
        let n = ChannelNameNormalizer::new();
        let once = n.normalize("Sky Sports F1 UHD!");
        let twice = n.normalize(&once);
        assert_eq!(once, twice);
    }

    #[test]
    fn variants_converge_on_the_same_key() {
        let n = ChannelNameNormalizer::new();
        let a = n.analyze("Sky Sports F1 FHD", &[]);
        let b = n.analyze("SKY SPORTS F1 hd", &[]);
        let c = n.analyze("sky sports f1", &[]);
        assert_eq!(a.normalized_name, b.normalized_name);
        assert_eq!(b.normalized_name, c.normalized_name);
        assert_eq!(a.quality, Quality::Fhd);
        assert_eq!(b.quality, Quality::Hd);
    }

    #[test]
    fn cleanup_rules_apply_in_order_and_skip_disabled() {
        let n = ChannelNameNormalizer::new();
        let mut rules = vec![
            rule(1, "UK: ", "", false),
            rule(2, r"\[.*?\]", "", true),
        ];
        let identity = n.analyze("UK: BBC One [Backup] HD", &rules);
        assert_eq!(identity.display_name, "BBC One");
        assert_eq!(identity.normalized_name, "bbcone");
        assert_eq!(identity.quality, Quality::Hd);

        rules[0].is_enabled = false;
        let identity = n.analyze("UK: BBC One [Backup] HD", &rules);
        assert_eq!(identity.normalized_name, "ukbbcone");
    }

    #[test]
    fn empty_normalization_keeps_channel_undeduplicated() {
        let n = ChannelNameNormalizer::new();
        let identity = n.analyze("***", &[]);
        assert_eq!(identity.normalized_name, "");
    }

    #[test]
    fn invalid_regex_rule_is_skipped() {
        let n = ChannelNameNormalizer::new();
        let rules = vec![rule(1, "([", "", true), rule(2, "XX ", "", false)];
        let identity = n.analyze("XX BBC Two", &rules);
        assert_eq!(identity.normalized_name, "bbctwo");
    }
}
