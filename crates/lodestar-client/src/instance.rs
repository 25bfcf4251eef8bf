//! Service instance model
//!
//! An [`Instance`] is the record a service publishes under
//! `{namespace}/{name}/{id}`. Its JSON encoding is the wire contract shared with
//! every other participant reading the same key space.

use std::collections::BTreeMap;
use std::fmt;

use serde::{Deserialize, Deserializer, Serialize};

use crate::endpoint;
use crate::error::{RegistryError, Result};

/// One running, addressable copy of a named service.
///
/// Instances are values: a changed instance is republished as a new write,
/// never patched in place.
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct Instance {
    pub id: String,
    pub name: String,
    #[serde(default)]
    pub version: String,
    #[serde(default, deserialize_with = "null_as_default")]
    pub metadata: BTreeMap<String, String>,
    #[serde(default, deserialize_with = "null_as_default")]
    pub endpoints: Vec<String>,
}

impl Instance {
    pub fn new(id: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            name: name.into(),
            ..Default::default()
        }
    }

    pub fn with_version(mut self, version: impl Into<String>) -> Self {
        self.version = version.into();
        self
    }

    pub fn with_metadata(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.metadata.insert(key.into(), value.into());
        self
    }

    pub fn with_endpoint(mut self, endpoint: impl Into<String>) -> Self {
        self.endpoints.push(endpoint.into());
        self
    }

    pub fn with_endpoints<I, S>(mut self, endpoints: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.endpoints.extend(endpoints.into_iter().map(Into::into));
        self
    }

    /// Check the fields that end up in the store key.
    pub fn validate(&self) -> Result<()> {
        if self.id.is_empty() {
            return Err(RegistryError::InvalidInstance("id must not be empty".to_string()));
        }
        if self.name.is_empty() {
            return Err(RegistryError::InvalidInstance(
                "name must not be empty".to_string(),
            ));
        }
        if self.id.contains('/') || self.name.contains('/') {
            return Err(RegistryError::InvalidInstance(format!(
                "id and name must not contain '/': {}",
                self
            )));
        }
        Ok(())
    }

    /// `host[:port]` of the first endpoint using `scheme`, if any.
    pub fn endpoint(&self, scheme: &str) -> Result<Option<String>> {
        endpoint::parse_endpoint(&self.endpoints, scheme)
    }

    /// Encode to the JSON store value.
    pub fn to_bytes(&self) -> Result<Vec<u8>> {
        Ok(serde_json::to_vec(self)?)
    }

    /// Decode a JSON store value.
    pub fn from_bytes(data: &[u8]) -> Result<Self> {
        Ok(serde_json::from_slice(data)?)
    }

    fn sorted_endpoints(&self) -> Vec<&str> {
        let mut endpoints: Vec<&str> = self.endpoints.iter().map(String::as_str).collect();
        endpoints.sort_unstable();
        endpoints
    }
}

/// Endpoints compare as sets: stores may hand the list back in any order.
impl PartialEq for Instance {
    fn eq(&self, other: &Self) -> bool {
        self.id == other.id
            && self.name == other.name
            && self.version == other.version
            && self.metadata == other.metadata
            && self.endpoints.len() == other.endpoints.len()
            && self.sorted_endpoints() == other.sorted_endpoints()
    }
}

impl Eq for Instance {}

impl fmt::Display for Instance {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}-{}", self.name, self.id)
    }
}

/// Peers that serialize nil collections write `null`.
fn null_as_default<'de, D, T>(deserializer: D) -> std::result::Result<T, D::Error>
where
    D: Deserializer<'de>,
    T: Default + Deserialize<'de>,
{
    Ok(Option::<T>::deserialize(deserializer)?.unwrap_or_default())
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    fn orders() -> Instance {
        Instance::new("i1", "orders")
            .with_version("v1.2.0")
            .with_metadata("zone", "eu-west-1a")
            .with_endpoint("grpc://10.0.0.1:9000")
            .with_endpoint("http://10.0.0.1:8000")
    }

    #[test]
    fn test_display() {
        assert_eq!(orders().to_string(), "orders-i1");
    }

    #[test]
    fn test_wire_format_field_names() {
        let json: serde_json::Value = serde_json::from_slice(&orders().to_bytes().unwrap()).unwrap();
        assert_eq!(json["id"], "i1");
        assert_eq!(json["name"], "orders");
        assert_eq!(json["version"], "v1.2.0");
        assert_eq!(json["metadata"]["zone"], "eu-west-1a");
        assert_eq!(json["endpoints"][0], "grpc://10.0.0.1:9000");
        assert_eq!(json.as_object().unwrap().len(), 5);
    }

    #[test]
    fn test_decode_tolerates_null_collections() {
        let raw = br#"{"id":"i9","name":"orders","version":"","metadata":null,"endpoints":null}"#;
        let instance = Instance::from_bytes(raw).unwrap();
        assert_eq!(instance, Instance::new("i9", "orders"));
        assert!(instance.metadata.is_empty());
        assert!(instance.endpoints.is_empty());
    }

    #[test]
    fn test_decode_rejects_garbage() {
        assert!(matches!(
            Instance::from_bytes(b"not-json"),
            Err(RegistryError::Codec(_))
        ));
    }

    #[test]
    fn test_equality_ignores_endpoint_order() {
        let a = orders();
        let mut b = orders();
        b.endpoints.reverse();
        assert_eq!(a, b);
        // comparing must not reorder either side
        assert_eq!(b.endpoints[0], "http://10.0.0.1:8000");
    }

    #[test]
    fn test_equality_detects_differences() {
        assert_ne!(orders(), orders().with_version("v2"));
        assert_ne!(orders(), orders().with_metadata("zone", "us-east-1"));
        assert_ne!(orders(), orders().with_endpoint("grpc://10.0.0.2:9000"));

        // same length, different members
        let mut duplicated = orders();
        duplicated.endpoints[1] = duplicated.endpoints[0].clone();
        assert_ne!(orders(), duplicated);
    }

    #[test]
    fn test_validate() {
        assert!(orders().validate().is_ok());
        assert!(Instance::new("", "orders").validate().is_err());
        assert!(Instance::new("i1", "").validate().is_err());
        assert!(Instance::new("i1", "orders/v2").validate().is_err());
        assert!(Instance::new("a/b", "orders").validate().is_err());
    }

    #[test]
    fn test_endpoint_lookup() {
        let instance = orders();
        assert_eq!(
            instance.endpoint("grpc").unwrap().as_deref(),
            Some("10.0.0.1:9000")
        );
        assert_eq!(instance.endpoint("https").unwrap(), None);
    }

    fn arb_instance() -> impl Strategy<Value = Instance> {
        (
            "[a-z0-9-]{1,12}",
            "[a-z]{1,8}",
            "[0-9.]{0,6}",
            proptest::collection::btree_map("[a-z]{1,5}", "[ -~]{0,8}", 0..4),
            proptest::collection::vec("grpc://[0-9.]{7,15}:[0-9]{2,5}", 0..4),
        )
            .prop_map(|(id, name, version, metadata, endpoints)| Instance {
                id,
                name,
                version,
                metadata,
                endpoints,
            })
    }

    proptest! {
        #[test]
        fn prop_decode_encode_is_identity(instance in arb_instance()) {
            let decoded = Instance::from_bytes(&instance.to_bytes().unwrap()).unwrap();
            prop_assert_eq!(decoded, instance);
        }

        #[test]
        fn prop_equality_is_order_independent(instance in arb_instance(), seed in any::<u64>()) {
            let mut shuffled = instance.clone();
            let len = shuffled.endpoints.len();
            if len > 1 {
                shuffled.endpoints.rotate_left((seed as usize) % len);
            }
            let rebuilt: BTreeMap<String, String> =
                instance.metadata.iter().rev().map(|(k, v)| (k.clone(), v.clone())).collect();
            shuffled.metadata = rebuilt;
            prop_assert_eq!(shuffled, instance);
        }
    }
}
