//! Filter rules deciding which recovery points are copied

use chrono::{DateTime, Utc};
use serde::Serialize;
use std::collections::BTreeSet;
use std::fmt;
use std::str::FromStr;
use vaultshift_config::{FilterConfig, FilterRuleConfig};
use vaultshift_types::{Error, FilterDecision, Item, ItemFilter, Result, BYTES_PER_GB};

/// What a rule compares, with its parsed value
#[derive(Debug, Clone, PartialEq)]
pub enum FilterCriteria {
    /// Resource type equals the value
    ResourceType(String),
    /// Item is at least this many days old
    MinAgeDays(i64),
    /// Item is at most this many days old
    MaxAgeDays(i64),
    /// Item is at least this large
    MinSizeGb(f64),
    /// Item is at most this large
    MaxSizeGb(f64),
    /// Remote status equals the value
    Status(String),
    /// Vault name equals the pattern, or starts with it when it ends in `*`
    VaultNamePattern(String),
    /// Attribute `key` holds one of `values`
    AttributeIn {
        /// Attribute name
        key: String,
        /// Accepted values
        values: BTreeSet<String>,
    },
}

impl FilterCriteria {
    /// Parse a criteria name and its raw value
    pub fn parse(criteria: &str, value: &str) -> Result<Self> {
        let invalid = |reason: &str| {
            Error::config(format!(
                "Invalid value '{value}' for filter criteria '{criteria}': {reason}"
            ))
        };
        let parsed = match criteria {
            "resource_type" => Self::ResourceType(value.to_string()),
            "min_age_days" => Self::MinAgeDays(parse_number(value).map_err(|e| invalid(&e))?),
            "max_age_days" => Self::MaxAgeDays(parse_number(value).map_err(|e| invalid(&e))?),
            "min_size_gb" => Self::MinSizeGb(parse_number(value).map_err(|e| invalid(&e))?),
            "max_size_gb" => Self::MaxSizeGb(parse_number(value).map_err(|e| invalid(&e))?),
            "status" => Self::Status(value.to_uppercase()),
            "vault_name_pattern" => Self::VaultNamePattern(value.to_string()),
            "attribute_in" => {
                let (key, values) = value
                    .split_once('=')
                    .ok_or_else(|| invalid("expected KEY=VALUE[,VALUE...]"))?;
                let values: BTreeSet<String> = values
                    .split(',')
                    .map(str::trim)
                    .filter(|v| !v.is_empty())
                    .map(str::to_string)
                    .collect();
                if key.trim().is_empty() || values.is_empty() {
                    return Err(invalid("expected KEY=VALUE[,VALUE...]"));
                }
                Self::AttributeIn {
                    key: key.trim().to_string(),
                    values,
                }
            }
            other => return Err(Error::config(format!("Unknown filter criteria '{other}'"))),
        };
        Ok(parsed)
    }

    fn matches(&self, item: &Item, now: DateTime<Utc>) -> bool {
        match self {
            Self::ResourceType(kind) => item.resource_type == *kind,
            Self::MinAgeDays(days) => item.age_days(now).is_some_and(|age| age >= *days),
            Self::MaxAgeDays(days) => item.age_days(now).is_some_and(|age| age <= *days),
            Self::MinSizeGb(gb) => item.size_gb() >= *gb,
            Self::MaxSizeGb(gb) => item.size_gb() <= *gb,
            Self::Status(status) => item.status.to_string() == *status,
            Self::VaultNamePattern(pattern) => match pattern.strip_suffix('*') {
                Some(prefix) => item.vault_name.starts_with(prefix.trim_end_matches('*')),
                None => item.vault_name == *pattern,
            },
            Self::AttributeIn { key, values } => item
                .attribute(key)
                .is_some_and(|value| values.contains(value)),
        }
    }
}

fn parse_number<T: FromStr>(value: &str) -> std::result::Result<T, String> {
    value
        .trim()
        .parse()
        .map_err(|_| "not a number".to_string())
}

impl fmt::Display for FilterCriteria {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::ResourceType(v) => write!(f, "resource_type = {v}"),
            Self::MinAgeDays(v) => write!(f, "age >= {v} days"),
            Self::MaxAgeDays(v) => write!(f, "age <= {v} days"),
            Self::MinSizeGb(v) => write!(f, "size >= {v} GB"),
            Self::MaxSizeGb(v) => write!(f, "size <= {v} GB"),
            Self::Status(v) => write!(f, "status = {v}"),
            Self::VaultNamePattern(v) => write!(f, "vault matches {v}"),
            Self::AttributeIn { key, values } => {
                let values: Vec<&str> = values.iter().map(String::as_str).collect();
                write!(f, "{key} in [{}]", values.join(", "))
            }
        }
    }
}

/// One criteria, applied as an include or an exclude rule
#[derive(Debug, Clone, PartialEq)]
pub struct FilterRule {
    /// What the rule compares
    pub criteria: FilterCriteria,
    /// Whether a match includes the item; exclude rules invert the match
    pub include: bool,
}

impl FilterRule {
    /// Rule that keeps matching items
    pub fn include(criteria: FilterCriteria) -> Self {
        Self {
            criteria,
            include: true,
        }
    }

    /// Rule that drops matching items
    pub fn exclude(criteria: FilterCriteria) -> Self {
        Self {
            criteria,
            include: false,
        }
    }

    /// Whether the item passes this rule
    pub fn passes(&self, item: &Item, now: DateTime<Utc>) -> bool {
        self.criteria.matches(item, now) == self.include
    }
}

impl TryFrom<&FilterRuleConfig> for FilterRule {
    type Error = Error;

    fn try_from(config: &FilterRuleConfig) -> Result<Self> {
        Ok(Self {
            criteria: FilterCriteria::parse(&config.criteria, &config.value)?,
            include: config.include,
        })
    }
}

/// Rules combined with all-of or any-of semantics
#[derive(Debug, Clone, PartialEq)]
pub struct FilterRuleSet {
    /// Rules in evaluation order
    pub rules: Vec<FilterRule>,
    /// All rules must pass when true, one is enough when false
    pub match_all: bool,
}

impl Default for FilterRuleSet {
    fn default() -> Self {
        Self {
            rules: Vec::new(),
            match_all: true,
        }
    }
}

impl FilterRuleSet {
    /// Build a rule set from the `filter` config section
    pub fn from_config(config: &FilterConfig) -> Result<Self> {
        let rules = config
            .rules
            .iter()
            .map(FilterRule::try_from)
            .collect::<Result<Vec<_>>>()?;
        Ok(Self {
            rules,
            match_all: config.match_all,
        })
    }

    /// Append a rule
    pub fn add_rule(&mut self, rule: FilterRule) {
        self.rules.push(rule);
    }

    /// Whether the set has no rules
    pub fn is_empty(&self) -> bool {
        self.rules.is_empty()
    }

    /// Decide for one item at a fixed point in time
    pub fn evaluate_at(&self, item: &Item, now: DateTime<Utc>) -> FilterDecision {
        if self.rules.is_empty() {
            return FilterDecision::Include;
        }
        let included = if self.match_all {
            self.rules.iter().all(|rule| rule.passes(item, now))
        } else {
            self.rules.iter().any(|rule| rule.passes(item, now))
        };
        if included {
            FilterDecision::Include
        } else {
            FilterDecision::Exclude(self.exclusion_reason(item, now))
        }
    }

    fn exclusion_reason(&self, item: &Item, now: DateTime<Utc>) -> String {
        let failed = self.rules.iter().find(|rule| !rule.passes(item, now));
        match failed {
            Some(rule) if self.match_all => {
                let verb = if rule.include { "requires" } else { "excludes" };
                format!("Excluded by filter: rule {verb} {}", rule.criteria)
            }
            _ => "Excluded by filter: no rule matched".to_string(),
        }
    }
}

impl ItemFilter for FilterRuleSet {
    fn evaluate(&self, item: &Item) -> FilterDecision {
        self.evaluate_at(item, Utc::now())
    }
}

/// How a filter split an inventory
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct FilterSummary {
    /// Items evaluated
    pub total_count: usize,
    /// Items included
    pub included_count: usize,
    /// Items excluded
    pub excluded_count: usize,
    /// Included share, in percent
    pub inclusion_rate_percent: f64,
    /// Size of included items
    pub total_size_gb_included: f64,
    /// Size of excluded items
    pub total_size_gb_excluded: f64,
}

impl FilterSummary {
    /// Evaluate `filter` over `items`
    pub fn of(filter: &dyn ItemFilter, items: &[Item]) -> Self {
        let mut summary = Self {
            total_count: items.len(),
            ..Self::default()
        };
        let (mut bytes_in, mut bytes_out) = (0u64, 0u64);
        for item in items {
            if filter.evaluate(item).is_included() {
                summary.included_count += 1;
                bytes_in += item.size_bytes;
            } else {
                summary.excluded_count += 1;
                bytes_out += item.size_bytes;
            }
        }
        if summary.total_count > 0 {
            summary.inclusion_rate_percent =
                summary.included_count as f64 / summary.total_count as f64 * 100.0;
        }
        summary.total_size_gb_included = bytes_in as f64 / BYTES_PER_GB;
        summary.total_size_gb_excluded = bytes_out as f64 / BYTES_PER_GB;
        summary
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;
    use rstest::rstest;

    fn item() -> Item {
        let now = Utc::now();
        let mut item = Item::new("arn:rp:1", "arn:vol:1");
        item.resource_type = "EBS".to_string();
        item.vault_name = "prod-vault-eu".to_string();
        item.size_bytes = 50 * 1024 * 1024 * 1024;
        item.creation_date = Some(now - Duration::days(40));
        item.attributes.insert("APMID".to_string(), "APM0001".to_string());
        item
    }

    #[rstest]
    #[case("resource_type", "EBS", true)]
    #[case("resource_type", "RDS", false)]
    #[case("min_age_days", "30", true)]
    #[case("max_age_days", "30", false)]
    #[case("min_size_gb", "10", true)]
    #[case("max_size_gb", "10.5", false)]
    #[case("status", "completed", true)]
    #[case("vault_name_pattern", "prod-*", true)]
    #[case("vault_name_pattern", "prod", false)]
    #[case("vault_name_pattern", "prod-vault-eu", true)]
    #[case("attribute_in", "APMID=APM0001,APM0002", true)]
    #[case("attribute_in", "APMID=APM0003", false)]
    #[case("attribute_in", "OWNER=ops", false)]
    fn test_criteria(#[case] criteria: &str, #[case] value: &str, #[case] expected: bool) {
        let rule = FilterRule::include(FilterCriteria::parse(criteria, value).unwrap());
        assert_eq!(rule.passes(&item(), Utc::now()), expected);

        let inverted = FilterRule::exclude(FilterCriteria::parse(criteria, value).unwrap());
        assert_eq!(inverted.passes(&item(), Utc::now()), !expected);
    }

    #[rstest]
    #[case("min_age_days", "ten")]
    #[case("attribute_in", "APMID")]
    #[case("attribute_in", "APMID=")]
    #[case("colour", "red")]
    fn test_invalid_rules(#[case] criteria: &str, #[case] value: &str) {
        let err = FilterCriteria::parse(criteria, value).unwrap_err();
        assert!(err.is_fatal());
    }

    #[test]
    fn test_age_rule_without_creation_date() {
        let mut item = item();
        item.creation_date = None;
        let rule = FilterRule::include(FilterCriteria::MinAgeDays(1));
        assert!(!rule.passes(&item, Utc::now()));
    }

    #[test]
    fn test_empty_set_includes() {
        assert!(FilterRuleSet::default().evaluate(&item()).is_included());
    }

    #[test]
    fn test_match_all_and_any() {
        let mut rules = FilterRuleSet::default();
        rules.add_rule(FilterRule::include(FilterCriteria::ResourceType("EBS".into())));
        rules.add_rule(FilterRule::include(FilterCriteria::MaxSizeGb(1.0)));

        let decision = rules.evaluate(&item());
        assert_eq!(
            decision,
            FilterDecision::Exclude("Excluded by filter: rule requires size <= 1 GB".to_string())
        );

        rules.match_all = false;
        assert!(rules.evaluate(&item()).is_included());
    }

    #[test]
    fn test_from_config() {
        let config = FilterConfig {
            match_all: true,
            rules: vec![FilterRuleConfig {
                criteria: "resource_type".to_string(),
                value: "RDS".to_string(),
                include: false,
            }],
        };
        let rules = FilterRuleSet::from_config(&config).unwrap();
        assert!(rules.evaluate(&item()).is_included());
    }

    #[test]
    fn test_summary() {
        let mut small = item();
        small.size_bytes = 0;
        let mut rules = FilterRuleSet::default();
        rules.add_rule(FilterRule::include(FilterCriteria::MinSizeGb(1.0)));

        let summary = FilterSummary::of(&rules, &[item(), small]);
        assert_eq!(summary.included_count, 1);
        assert_eq!(summary.excluded_count, 1);
        assert_eq!(summary.inclusion_rate_percent, 50.0);
        assert_eq!(summary.total_size_gb_included, 50.0);
    }
}
