//! Prefix policy store
//!
//! Holds the monitored prefixes and answers longest-prefix-match queries.
//! A `RuleSet` is immutable; `PolicyStore` swaps whole rule sets atomically
//! so readers always see either the old or the new set, never a mix.

use crate::error::{Result, WatchError};
use crate::types::{Prefix, PrefixRecord, PrefixRule};
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet};
use std::sync::{Arc, RwLock};

/// How to choose among several rules with the same prefix (different users)
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", tag = "type")]
pub enum TieBreak {
    /// The rule loaded first wins
    #[default]
    FirstLoaded,
    /// The rule loaded last wins
    LastLoaded,
    /// Rules owned by this user win; otherwise first loaded
    PreferUser { user: String },
}

/// An immutable, indexed set of prefix rules
#[derive(Debug, Default)]
pub struct RuleSet {
    /// Rules in load order
    rules: Vec<PrefixRule>,

    /// Rule prefix → indices into `rules`, in load order
    index: HashMap<Prefix, Vec<usize>>,

    tie_break: TieBreak,
}

impl RuleSet {
    /// Validate records and build an indexed rule set
    ///
    /// Fails on the first invalid record, on duplicate `(prefix, user)`
    /// identities, and on an empty input.
    pub fn from_records(records: Vec<PrefixRecord>, tie_break: TieBreak) -> Result<Self> {
        if records.is_empty() {
            return Err(WatchError::Policy("no prefixes to monitor".to_string()));
        }

        let mut rules = Vec::with_capacity(records.len());
        let mut seen = HashSet::new();
        for record in records {
            let rule = record.into_rule()?;
            if !seen.insert((rule.prefix, rule.user.clone())) {
                return Err(WatchError::InvalidRule {
                    prefix: rule.prefix.to_string(),
                    reason: format!("duplicate rule for user '{}'", rule.user),
                });
            }
            rules.push(rule);
        }

        let mut index: HashMap<Prefix, Vec<usize>> = HashMap::new();
        for (i, rule) in rules.iter().enumerate() {
            index.entry(rule.prefix).or_default().push(i);
        }

        Ok(Self {
            rules,
            index,
            tie_break,
        })
    }

    /// Longest-prefix match: the most specific rule covering `prefix`
    ///
    /// An exact match wins over any containing supernet.
    pub fn match_prefix(&self, prefix: &Prefix) -> Option<&PrefixRule> {
        for len in (0..=prefix.len()).rev() {
            let Ok(candidate) = Prefix::new(prefix.network(), len) else {
                continue;
            };
            if let Some(indices) = self.index.get(&candidate) {
                return self.pick(indices);
            }
        }
        None
    }

    /// Exact lookup honoring the tie-break policy
    pub fn exact(&self, prefix: &Prefix) -> Option<&PrefixRule> {
        self.index.get(prefix).and_then(|indices| self.pick(indices))
    }

    fn pick(&self, indices: &[usize]) -> Option<&PrefixRule> {
        let idx = match &self.tie_break {
            TieBreak::FirstLoaded => indices.first(),
            TieBreak::LastLoaded => indices.last(),
            TieBreak::PreferUser { user } => indices
                .iter()
                .find(|&&i| &self.rules[i].user == user)
                .or_else(|| indices.first()),
        }?;
        self.rules.get(*idx)
    }

    /// All rules in load order
    pub fn rules(&self) -> &[PrefixRule] {
        &self.rules
    }

    pub fn len(&self) -> usize {
        self.rules.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rules.is_empty()
    }
}

/// Shared, atomically reloadable policy store
pub struct PolicyStore {
    current: RwLock<Arc<RuleSet>>,
    tie_break: TieBreak,
}

impl PolicyStore {
    /// Build the initial policy
    ///
    /// An error here means no detection is possible; callers treat it as fatal.
    pub fn new(records: Vec<PrefixRecord>, tie_break: TieBreak) -> Result<Self> {
        let rules = RuleSet::from_records(records, tie_break.clone())?;
        tracing::info!(rules = rules.len(), "Policy loaded");
        Ok(Self {
            current: RwLock::new(Arc::new(rules)),
            tie_break,
        })
    }

    /// Replace the whole rule set
    ///
    /// On error the previous rule set stays authoritative.
    pub fn reload(&self, records: Vec<PrefixRecord>) -> Result<usize> {
        let rules = match RuleSet::from_records(records, self.tie_break.clone()) {
            Ok(rules) => rules,
            Err(e) => {
                tracing::warn!(error = %e, "Policy reload rejected, keeping previous rules");
                return Err(e);
            }
        };
        let count = rules.len();
        let mut current = self
            .current
            .write()
            .map_err(|e| WatchError::Lock(format!("policy store: {}", e)))?;
        *current = Arc::new(rules);
        tracing::info!(rules = count, "Policy reloaded");
        Ok(count)
    }

    /// Current rule set; stays valid across concurrent reloads
    pub fn snapshot(&self) -> Result<Arc<RuleSet>> {
        let current = self
            .current
            .read()
            .map_err(|e| WatchError::Lock(format!("policy store: {}", e)))?;
        Ok(Arc::clone(&current))
    }

    /// Longest-prefix match against the current rule set
    pub fn match_prefix(&self, prefix: &Prefix) -> Result<Option<PrefixRule>> {
        Ok(self.snapshot()?.match_prefix(prefix).cloned())
    }

    /// True if `announced` is strictly inside the rule's prefix
    pub fn is_more_specific(announced: &Prefix, rule: &PrefixRule) -> bool {
        announced.is_more_specific_of(&rule.prefix)
    }

    /// True if `origin_as` is authorized to originate the rule's prefix
    pub fn is_authorized(rule: &PrefixRule, origin_as: u32) -> bool {
        rule.is_authorized(origin_as)
    }
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct PrefixFileEntry {
    #[serde(default)]
    description: String,
    asn: serde_yaml::Value,
    #[serde(default)]
    ignore_morespecifics: bool,
}

/// Parse a prefixes file: a YAML mapping of prefix → `{description, asn, ignoreMorespecifics}`
///
/// Every record is tagged with `user`. Entries keep file order.
pub fn parse_prefix_file(yaml: &str, user: &str) -> Result<Vec<PrefixRecord>> {
    let doc: serde_yaml::Value = serde_yaml::from_str(yaml)?;
    let mapping = match doc {
        serde_yaml::Value::Mapping(m) => m,
        serde_yaml::Value::Null => return Ok(Vec::new()),
        _ => {
            return Err(WatchError::Config(
                "prefixes file must be a mapping of prefix to rule".to_string(),
            ))
        }
    };

    let mut records = Vec::with_capacity(mapping.len());
    for (key, value) in mapping {
        let prefix = key
            .as_str()
            .ok_or_else(|| WatchError::Config(format!("prefix key is not a string: {:?}", key)))?
            .to_string();
        let entry: PrefixFileEntry = serde_yaml::from_value(value)?;
        let asn = match entry.asn {
            serde_yaml::Value::Sequence(seq) => seq
                .iter()
                .map(|v| asn_from_yaml(&prefix, v))
                .collect::<Result<Vec<_>>>()?,
            other => vec![asn_from_yaml(&prefix, &other)?],
        };
        records.push(PrefixRecord {
            asn,
            description: entry.description,
            ignore_morespecifics: entry.ignore_morespecifics,
            prefix,
            user: user.to_string(),
        });
    }
    Ok(records)
}

fn asn_from_yaml(prefix: &str, value: &serde_yaml::Value) -> Result<u32> {
    value
        .as_u64()
        .and_then(|n| u32::try_from(n).ok())
        .ok_or_else(|| WatchError::InvalidRule {
            prefix: prefix.to_string(),
            reason: format!("invalid ASN {:?}", value),
        })
}
