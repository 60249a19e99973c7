//! Canned values for tests.

use chrono::{TimeZone, Utc};

use crate::core::DeploymentTarget;
use crate::ingestion::Credentials;

/// Credentials with fixed, obviously fake values.
#[must_use]
pub fn fixed_credentials() -> Credentials {
    Credentials {
        access_key_id: "ASIATESTTESTTEST".to_string(),
        secret_access_key: "test-secret-access-key".to_string(),
        session_token: "test-session-token".to_string(),
        expires_at: Utc
            .with_ymd_and_hms(2030, 1, 1, 0, 0, 0)
            .single()
            .unwrap_or_else(Utc::now),
    }
}

/// Renders `(account, region)` pairs as a target parameter value.
#[must_use]
pub fn targets_json(targets: &[(&str, &str)]) -> String {
    let list: Vec<DeploymentTarget> = targets
        .iter()
        .map(|(account, region)| DeploymentTarget::new(*account, *region))
        .collect();
    serde_json::to_string(&list).unwrap_or_else(|_| "[]".to_string())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pipeline::parse_targets;

    #[test]
    fn test_targets_json_parses_back() {
        let value = targets_json(&[("1", "eu-west-1"), ("1", "eu-west-1")]);
        assert_eq!(parse_targets("/p", "eu-west-1", &value).unwrap().len(), 1);
    }
}
