//! User model, evaluation contexts, and the canonical wire serialization.
//!
//! Users are value objects: every mutator returns a new instance and the
//! original (including its property map) is never touched, so snapshots handed
//! to in-flight requests stay stable.

// crates.io
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

/// SDK type reported in the injected device attributes.
pub const SDK_TYPE: &str = "rust-client";
/// SDK version reported in the injected device attributes.
pub const SDK_VERSION: &str = env!("CARGO_PKG_VERSION");

/// Kind of evaluation context attached to a user.
#[allow(missing_docs)]
#[derive(Clone, Debug, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ContextType {
	Location,
	Device,
	Session,
	Custom,
}

/// Targeting context evaluated server-side alongside the user.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct EvaluationContext {
	/// Context kind.
	#[serde(rename = "type")]
	pub context_type: ContextType,
	/// Key identifying the context within its kind.
	pub key: String,
	/// Context properties.
	#[serde(default)]
	pub properties: Map<String, Value>,
}
impl EvaluationContext {
	/// Create a context with no properties.
	pub fn new(context_type: ContextType, key: impl Into<String>) -> Self {
		Self { context_type, key: key.into(), properties: Map::new() }
	}

	/// Return a copy with the property set.
	pub fn with_property(mut self, key: impl Into<String>, value: Value) -> Self {
		self.properties.insert(key.into(), value);

		self
	}
}

/// Immutable user snapshot evaluated by the remote service.
#[derive(Clone, Debug, PartialEq, Default)]
pub struct User {
	customer_id: Option<String>,
	anonymous_id: Option<String>,
	device_id: Option<String>,
	anonymous: bool,
	properties: Map<String, Value>,
	contexts: Vec<EvaluationContext>,
}
impl User {
	/// Create a user identified by a customer id.
	pub fn new(customer_id: impl Into<String>) -> Self {
		Self { customer_id: Some(customer_id.into()), ..Default::default() }
	}

	/// Create an anonymous user with the given anonymous id.
	pub fn anonymous(anonymous_id: impl Into<String>) -> Self {
		Self { anonymous_id: Some(anonymous_id.into()), anonymous: true, ..Default::default() }
	}

	/// Customer id, when identified.
	pub fn customer_id(&self) -> Option<&str> {
		self.customer_id.as_deref()
	}

	/// Anonymous id, when assigned.
	pub fn anonymous_id(&self) -> Option<&str> {
		self.anonymous_id.as_deref()
	}

	/// Device id, when assigned.
	pub fn device_id(&self) -> Option<&str> {
		self.device_id.as_deref()
	}

	/// Whether the user is anonymous.
	pub fn is_anonymous(&self) -> bool {
		self.anonymous
	}

	/// Property map view.
	pub fn properties(&self) -> &Map<String, Value> {
		&self.properties
	}

	/// Attached evaluation contexts.
	pub fn contexts(&self) -> &[EvaluationContext] {
		&self.contexts
	}

	/// Return a copy with the customer id replaced.
	pub fn with_customer_id(&self, customer_id: impl Into<String>) -> Self {
		let mut next = self.clone();

		next.customer_id = Some(customer_id.into());
		next.anonymous = false;

		next
	}

	/// Return a copy with the anonymous id replaced.
	pub fn with_anonymous_id(&self, anonymous_id: impl Into<String>) -> Self {
		let mut next = self.clone();

		next.anonymous_id = Some(anonymous_id.into());

		next
	}

	/// Return a copy with the device id replaced.
	pub fn with_device_id(&self, device_id: impl Into<String>) -> Self {
		let mut next = self.clone();

		next.device_id = Some(device_id.into());

		next
	}

	/// Return a copy with one property set.
	pub fn with_property(&self, key: impl Into<String>, value: Value) -> Self {
		let mut next = self.clone();

		next.properties.insert(key.into(), value);

		next
	}

	/// Return a copy with all given properties merged in.
	pub fn with_properties(&self, properties: Map<String, Value>) -> Self {
		let mut next = self.clone();

		next.properties.extend(properties);

		next
	}

	/// Return a copy with the context appended.
	///
	/// A context with the same `(type, key)` pair is replaced rather than
	/// duplicated.
	pub fn with_context(&self, context: EvaluationContext) -> Self {
		let mut next = self.clone();

		next.contexts
			.retain(|c| !(c.context_type == context.context_type && c.key == context.key));
		next.contexts.push(context);

		next
	}

	/// Return a copy with the matching context removed.
	pub fn without_context(&self, context_type: ContextType, key: &str) -> Self {
		let mut next = self.clone();

		next.contexts.retain(|c| !(c.context_type == context_type && c.key == key));

		next
	}

	/// Canonical wire representation sent in user-config requests.
	///
	/// When `auto_env_attributes` is set, host environment attributes are
	/// injected into a `device` sub-object at serialization time; the stored
	/// property map is left untouched either way.
	pub fn to_wire(&self, auto_env_attributes: bool) -> WireUser {
		let mut properties = self.properties.clone();

		if auto_env_attributes {
			let mut device = Map::new();

			if let Some(device_id) = &self.device_id {
				device.insert("device_id".into(), Value::String(device_id.clone()));
			}

			device.insert("os_name".into(), Value::String(std::env::consts::OS.to_string()));
			device.insert("sdk_type".into(), Value::String(SDK_TYPE.to_string()));
			device.insert("sdk_version".into(), Value::String(SDK_VERSION.to_string()));
			properties.insert("device".into(), Value::Object(device));
		}

		WireUser {
			user_customer_id: self.customer_id.clone(),
			anonymous_id: self.anonymous_id.clone(),
			anonymous: self.anonymous,
			properties,
			contexts: self.contexts.clone(),
		}
	}
}
impl From<WireUser> for User {
	fn from(wire: WireUser) -> Self {
		let mut properties = wire.properties;
		// The device sub-object is an injection artifact, not user state.
		let device_id = match properties.remove("device") {
			Some(Value::Object(device)) => device
				.get("device_id")
				.and_then(|v| v.as_str())
				.map(|s| s.to_string()),
			_ => None,
		};

		Self {
			customer_id: wire.user_customer_id,
			anonymous_id: wire.anonymous_id,
			device_id,
			anonymous: wire.anonymous,
			properties,
			contexts: wire.contexts,
		}
	}
}

/// Serialized user shape expected by the evaluation service.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct WireUser {
	/// Customer id, omitted when unidentified.
	#[serde(skip_serializing_if = "Option::is_none")]
	pub user_customer_id: Option<String>,
	/// Anonymous id, omitted when unassigned.
	#[serde(skip_serializing_if = "Option::is_none")]
	pub anonymous_id: Option<String>,
	/// Whether the user is anonymous.
	pub anonymous: bool,
	/// Property map, including the injected `device` sub-object.
	#[serde(default)]
	pub properties: Map<String, Value>,
	/// Evaluation contexts.
	#[serde(default)]
	pub contexts: Vec<EvaluationContext>,
}

#[cfg(test)]
mod tests {
	// crates.io
	use serde_json::json;
	// self
	use super::*;

	#[test]
	fn mutators_leave_the_original_untouched() {
		let base = User::new("user-1").with_property("plan", json!("pro"));
		let derived = base
			.with_property("beta", json!(true))
			.with_context(EvaluationContext::new(ContextType::Location, "eu-west"));

		assert_eq!(base.properties().len(), 1);
		assert!(base.contexts().is_empty());
		assert_eq!(derived.properties().len(), 2);
		assert_eq!(derived.contexts().len(), 1);
	}

	#[test]
	fn with_context_replaces_same_type_and_key() {
		let user = User::new("user-1")
			.with_context(
				EvaluationContext::new(ContextType::Device, "tablet")
					.with_property("os", json!("android")),
			)
			.with_context(
				EvaluationContext::new(ContextType::Device, "tablet")
					.with_property("os", json!("ios")),
			);

		assert_eq!(user.contexts().len(), 1);
		assert_eq!(user.contexts()[0].properties["os"], json!("ios"));
	}

	#[test]
	fn without_context_removes_only_the_match() {
		let user = User::new("user-1")
			.with_context(EvaluationContext::new(ContextType::Session, "checkout"))
			.with_context(EvaluationContext::new(ContextType::Custom, "checkout"));
		let trimmed = user.without_context(ContextType::Session, "checkout");

		assert_eq!(trimmed.contexts().len(), 1);
		assert_eq!(trimmed.contexts()[0].context_type, ContextType::Custom);
	}

	#[test]
	fn wire_serialization_injects_device_attributes() {
		let user = User::new("user-1").with_device_id("device-9");
		let wire = serde_json::to_value(user.to_wire(true)).expect("serialize");

		assert_eq!(wire["user_customer_id"], json!("user-1"));
		assert_eq!(wire["properties"]["device"]["device_id"], json!("device-9"));
		assert_eq!(wire["properties"]["device"]["sdk_type"], json!(SDK_TYPE));
		assert_eq!(wire["properties"]["device"]["sdk_version"], json!(SDK_VERSION));
	}

	#[test]
	fn wire_round_trip_preserves_user_state() {
		let user = User::anonymous("anon-7")
			.with_device_id("device-9")
			.with_property("plan", json!("free"))
			.with_context(EvaluationContext::new(ContextType::Location, "us-east"));
		let json = serde_json::to_string(&user.to_wire(true)).expect("serialize");
		let restored: User = serde_json::from_str::<WireUser>(&json).expect("deserialize").into();

		assert_eq!(restored, user);
	}

	#[test]
	fn anonymous_user_omits_customer_id_on_the_wire() {
		let wire = serde_json::to_value(User::anonymous("anon-7").to_wire(false))
			.expect("serialize");

		assert!(wire.get("user_customer_id").is_none());
		assert_eq!(wire["anonymous"], json!(true));
	}
}
