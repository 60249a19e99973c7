//! Subscription filter policies for notification routing.
//!
//! A policy is a pair of allow-lists over the `account` and `region` message
//! attributes. Producers use the [`ALL`] sentinel to address every consumer
//! along a dimension; consumers put [`ALL`] in their allow-lists to accept
//! those broadcasts.

use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};

/// Sentinel attribute value meaning "every account" or "every region".
pub const ALL: &str = "ALL";

/// Message attribute carrying the addressed account.
pub const ACCOUNT_ATTRIBUTE: &str = "account";

/// Message attribute carrying the addressed region.
pub const REGION_ATTRIBUTE: &str = "region";

/// An exact-match allow-list over a single string attribute.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StringFilter {
    allowlist: BTreeSet<String>,
}

impl StringFilter {
    /// Creates a filter accepting exactly the listed values.
    #[must_use]
    pub fn allowlist<I, S>(values: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            allowlist: values.into_iter().map(Into::into).collect(),
        }
    }

    /// Creates a filter accepting broadcasts ([`ALL`]) and `local`.
    #[must_use]
    pub fn all_or(local: impl Into<String>) -> Self {
        Self::allowlist([ALL.to_string(), local.into()])
    }

    /// Returns true if `value` is on the allow-list.
    ///
    /// An absent attribute never matches.
    #[must_use]
    pub fn matches(&self, value: Option<&str>) -> bool {
        value.is_some_and(|v| self.allowlist.contains(v))
    }

    /// Returns the allowed values.
    #[must_use]
    pub fn values(&self) -> &BTreeSet<String> {
        &self.allowlist
    }
}

/// Filter policy attached to a queue's subscription to a notification channel.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NotificationFilterPolicy {
    /// Allowed values of the `account` attribute.
    pub account: StringFilter,
    /// Allowed values of the `region` attribute.
    pub region: StringFilter,
}

impl NotificationFilterPolicy {
    /// The policy of a consumer deployed in `account`/`region`.
    #[must_use]
    pub fn for_consumer(account: impl Into<String>, region: impl Into<String>) -> Self {
        Self {
            account: StringFilter::all_or(account),
            region: StringFilter::all_or(region),
        }
    }

    /// Returns true if a message with `attributes` should be delivered.
    ///
    /// Both dimensions must pass.
    #[must_use]
    pub fn matches(&self, attributes: &BTreeMap<String, String>) -> bool {
        self.account
            .matches(attributes.get(ACCOUNT_ATTRIBUTE).map(String::as_str))
            && self
                .region
                .matches(attributes.get(REGION_ATTRIBUTE).map(String::as_str))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const LOCAL_ACCOUNT: &str = "123456789012";
    const LOCAL_REGION: &str = "eu-west-1";

    fn attrs(account: &str, region: &str) -> BTreeMap<String, String> {
        BTreeMap::from([
            (ACCOUNT_ATTRIBUTE.to_string(), account.to_string()),
            (REGION_ATTRIBUTE.to_string(), region.to_string()),
        ])
    }

    fn policy() -> NotificationFilterPolicy {
        NotificationFilterPolicy::for_consumer(LOCAL_ACCOUNT, LOCAL_REGION)
    }

    #[test]
    fn test_broadcast_account_is_delivered() {
        assert!(policy().matches(&attrs(ALL, "eu-west-1")));
    }

    #[test]
    fn test_foreign_account_is_not_delivered() {
        assert!(!policy().matches(&attrs("999999999999", ALL)));
    }

    #[test]
    fn test_exact_and_full_broadcast() {
        assert!(policy().matches(&attrs(LOCAL_ACCOUNT, LOCAL_REGION)));
        assert!(policy().matches(&attrs(ALL, ALL)));
        assert!(policy().matches(&attrs(LOCAL_ACCOUNT, ALL)));
    }

    #[test]
    fn test_filter_soundness() {
        let accounts = [ALL, LOCAL_ACCOUNT, "999999999999", "all", ""];
        let regions = [ALL, LOCAL_REGION, "us-east-1", "EU-WEST-1", ""];

        for account in accounts {
            for region in regions {
                let account_ok = account == ALL || account == LOCAL_ACCOUNT;
                let region_ok = region == ALL || region == LOCAL_REGION;
                assert_eq!(
                    policy().matches(&attrs(account, region)),
                    account_ok && region_ok,
                    "account={account:?} region={region:?}"
                );
            }
        }
    }

    #[test]
    fn test_missing_attribute_never_matches() {
        let only_account =
            BTreeMap::from([(ACCOUNT_ATTRIBUTE.to_string(), ALL.to_string())]);
        assert!(!policy().matches(&only_account));
        assert!(!policy().matches(&BTreeMap::new()));
    }
}
