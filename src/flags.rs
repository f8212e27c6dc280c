//! Flag configuration types and the polling/cache/fetch engine.

pub mod cache;
pub mod fetch;
pub mod manager;

// std
use std::collections::HashMap;
// crates.io
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Per-flag record returned by the evaluation service.
///
/// `variation` is the value handed to the application; the ids alongside it
/// attribute the evaluation for telemetry summaries.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ConfigValue {
	/// Value returned to the application.
	pub variation: Value,
	/// Experience attribution id.
	#[serde(default, skip_serializing_if = "Option::is_none")]
	pub experience_id: Option<String>,
	/// Config attribution id.
	#[serde(default, skip_serializing_if = "Option::is_none")]
	pub config_id: Option<String>,
	/// Rule attribution id.
	#[serde(default, skip_serializing_if = "Option::is_none")]
	pub rule_id: Option<String>,
	/// Variation attribution id.
	#[serde(default, skip_serializing_if = "Option::is_none")]
	pub variation_id: Option<String>,
	/// Config version.
	#[serde(default, skip_serializing_if = "Option::is_none")]
	pub version: Option<i64>,
}
impl ConfigValue {
	/// Build a record carrying only a variation, for tests and defaults.
	pub fn of(variation: Value) -> Self {
		Self {
			variation,
			experience_id: None,
			config_id: None,
			rule_id: None,
			variation_id: None,
			version: None,
		}
	}
}

/// Flag key → config record map; replaced wholesale on every successful fetch.
pub type ConfigMap = HashMap<String, ConfigValue>;

/// Conditional-request validators retained across polls.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct SettingsMetadata {
	/// `Last-Modified` value from the previous settings response.
	#[serde(default, skip_serializing_if = "Option::is_none")]
	pub last_modified: Option<String>,
	/// `ETag` value from the previous settings response.
	#[serde(default, skip_serializing_if = "Option::is_none")]
	pub etag: Option<String>,
}
impl SettingsMetadata {
	/// Whether either validator differs from `other`.
	pub fn differs_from(&self, other: &Self) -> bool {
		self.last_modified != other.last_modified || self.etag != other.etag
	}

	/// Whether any validator has been captured yet.
	pub fn is_empty(&self) -> bool {
		self.last_modified.is_none() && self.etag.is_none()
	}
}

/// Remote kill-switch document scoped to the tenant.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct SdkSettings {
	/// Whether the account is enabled at all.
	#[serde(default)]
	pub cf_account_enabled: bool,
	/// Remote request to bypass the SDK entirely.
	#[serde(default)]
	pub cf_skip_sdk: bool,
	/// Forward-compatible bag for settings this SDK version does not model.
	#[serde(flatten)]
	pub extra: serde_json::Map<String, Value>,
}
impl SdkSettings {
	/// Effective enablement after applying both kill switches.
	pub fn sdk_enabled(&self) -> bool {
		self.cf_account_enabled && !self.cf_skip_sdk
	}
}

#[cfg(test)]
mod tests {
	// crates.io
	use serde_json::json;
	// self
	use super::*;

	#[test]
	fn config_value_tolerates_unknown_and_missing_fields() {
		let parsed: ConfigValue =
			serde_json::from_value(json!({ "variation": "v1", "unexpected": 1 }))
				.expect("deserialize");

		assert_eq!(parsed.variation, json!("v1"));
		assert!(parsed.variation_id.is_none());
	}

	#[test]
	fn settings_metadata_difference_checks_both_validators() {
		let a = SettingsMetadata { last_modified: Some("A".into()), etag: Some("\"1\"".into()) };
		let same = a.clone();
		let new_etag = SettingsMetadata { last_modified: Some("A".into()), etag: Some("\"2\"".into()) };

		assert!(!a.differs_from(&same));
		assert!(a.differs_from(&new_etag));
		assert!(a.differs_from(&SettingsMetadata::default()));
	}

	#[test]
	fn sdk_enabled_requires_account_on_and_skip_off() {
		let enabled: SdkSettings =
			serde_json::from_value(json!({ "cf_account_enabled": true, "cf_skip_sdk": false }))
				.expect("deserialize");
		let skipped: SdkSettings =
			serde_json::from_value(json!({ "cf_account_enabled": true, "cf_skip_sdk": true }))
				.expect("deserialize");
		let disabled: SdkSettings =
			serde_json::from_value(json!({ "cf_account_enabled": false })).expect("deserialize");

		assert!(enabled.sdk_enabled());
		assert!(!skipped.sdk_enabled());
		assert!(!disabled.sdk_enabled());
	}

	#[test]
	fn unmodelled_settings_survive_round_trip() {
		let settings: SdkSettings = serde_json::from_value(
			json!({ "cf_account_enabled": true, "cf_intelligent_sampling": 0.5 }),
		)
		.expect("deserialize");
		let round = serde_json::to_value(&settings).expect("serialize");

		assert_eq!(round["cf_intelligent_sampling"], json!(0.5));
	}
}
