//! factbridge marshal: Kubernetes domain objects to and from [`Value`]s.
//!
//! `encode` is total. `decode` checks constructor names, arities and tags at
//! every level and reports the path of the first field that does not match.
//! Optional fields use the `Some`/`None` struct convention and disjoint unions
//! use `Left`/`Right`; an unknown arm is always an error.

#![forbid(unsafe_code)]

use std::collections::BTreeMap;

use factbridge_core::{Int, Value, ValueError};
use thiserror::Error;

mod codec;
pub mod convert;
pub mod model;

pub use convert::ConvertError;
pub use model::*;

/// Engine table names for the input relations.
pub mod tables {
    pub const NAMESPACE: &str = "k8spolicy.Namespace";
    pub const POD: &str = "k8spolicy.Pod";
    pub const NETWORK_POLICY: &str = "k8spolicy.NetworkPolicy";

    pub const ALL: &[&str] = &[NAMESPACE, POD, NETWORK_POLICY];
}

/// Struct constructors of the wire schema.
pub mod ctors {
    use factbridge_core::Ctor;

    pub const UID: Ctor = Ctor::new("UID", 1);
    pub const NAMESPACE: Ctor = Ctor::new("Namespace", 3);
    pub const POD_SPEC: Ctor = Ctor::new("PodSpec", 1);
    pub const POD_STATUS: Ctor = Ctor::new("PodStatus", 1);
    pub const POD: Ctor = Ctor::new("Pod", 6);
    pub const OP_IN: Ctor = Ctor::new("LabelSelectorOpIn", 0);
    pub const OP_NOT_IN: Ctor = Ctor::new("LabelSelectorOpNotIn", 0);
    pub const OP_EXISTS: Ctor = Ctor::new("LabelSelectorOpExists", 0);
    pub const OP_DOES_NOT_EXIST: Ctor = Ctor::new("LabelSelectorOpDoesNotExist", 0);
    pub const LABEL_SELECTOR_REQUIREMENT: Ctor = Ctor::new("LabelSelectorRequirement", 3);
    pub const LABEL_SELECTOR: Ctor = Ctor::new("LabelSelector", 2);
    pub const NETWORK_POLICY_PORT: Ctor = Ctor::new("NetworkPolicyPort", 2);
    pub const IP_BLOCK: Ctor = Ctor::new("IPBlock", 2);
    pub const NETWORK_POLICY_PEER: Ctor = Ctor::new("NetworkPolicyPeer", 3);
    pub const INGRESS_RULE: Ctor = Ctor::new("NetworkPolicyIngressRule", 2);
    pub const EGRESS_RULE: Ctor = Ctor::new("NetworkPolicyEgressRule", 2);
    pub const POLICY_TYPE_INGRESS: Ctor = Ctor::new("PolicyTypeIngress", 0);
    pub const POLICY_TYPE_EGRESS: Ctor = Ctor::new("PolicyTypeEgress", 0);
    pub const NETWORK_POLICY_SPEC: Ctor = Ctor::new("NetworkPolicySpec", 4);
    pub const NETWORK_POLICY: Ctor = Ctor::new("NetworkPolicy", 4);
}

/// Shape mismatch found while decoding, with the field path where it happened.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("decode error at {}: {source}", display_path(.path))]
pub struct DecodeError {
    pub path: String,
    #[source]
    pub source: ValueError,
}

fn display_path(path: &str) -> &str {
    if path.is_empty() { "<root>" } else { path }
}

impl DecodeError {
    /// Prefix the path with an enclosing field (`spec`) or index (`[2]`).
    pub fn within(mut self, segment: &str) -> Self {
        self.path = if self.path.is_empty() {
            segment.to_string()
        } else if self.path.starts_with('[') {
            format!("{}{}", segment, self.path)
        } else {
            format!("{}.{}", segment, self.path)
        };
        self
    }
}

impl From<ValueError> for DecodeError {
    fn from(source: ValueError) -> Self { DecodeError { path: String::new(), source } }
}

pub(crate) trait At<T> {
    fn at(self, segment: &str) -> Result<T, DecodeError>;
}

impl<T, E: Into<DecodeError>> At<T> for Result<T, E> {
    fn at(self, segment: &str) -> Result<T, DecodeError> { self.map_err(|e| e.into().within(segment)) }
}

/// Bidirectional conversion between a domain type and its [`Value`] form.
pub trait Marshal: Sized {
    fn encode(&self) -> Value;
    fn decode(v: &Value) -> Result<Self, DecodeError>;
}

/// A top-level row of an engine input table.
pub trait Fact: Marshal {
    const TABLE: &'static str;

    /// Minimal value identifying a row for `DeleteByKey`.
    fn encode_key(namespace: Option<&str>, name: &str) -> Value;

    /// Extract the deletion key from a full encoded row.
    fn key_of(v: &Value) -> Result<Value, DecodeError>;

    fn namespace(&self) -> Option<&str>;
    fn name(&self) -> &str;

    fn key(&self) -> Value { Self::encode_key(self.namespace(), self.name()) }
}

impl Marshal for String {
    fn encode(&self) -> Value { Value::string(self.as_str()) }
    fn decode(v: &Value) -> Result<Self, DecodeError> { Ok(v.as_str()?.to_string()) }
}

/// Only a signed 32-bit integer decodes; any other width or signedness would
/// re-encode to a different value.
impl Marshal for i32 {
    fn encode(&self) -> Value { Value::i32(*self) }

    fn decode(v: &Value) -> Result<Self, DecodeError> {
        match v.as_int()? {
            Int::Signed { width: 32, value } => {
                Ok(i32::try_from(value).map_err(|_| ValueError::Narrowing { width: 32, target: "i32" })?)
            }
            other => Err(ValueError::Narrowing { width: other.width(), target: "i32" }.into()),
        }
    }
}

impl<T: Marshal> Marshal for Option<T> {
    fn encode(&self) -> Value { Value::from_option(self.as_ref().map(Marshal::encode)) }

    fn decode(v: &Value) -> Result<Self, DecodeError> {
        match v.as_option()? {
            Some(inner) => T::decode(inner).at("Some").map(Some),
            None => Ok(None),
        }
    }
}

impl<T: Marshal> Marshal for Vec<T> {
    fn encode(&self) -> Value {
        if self.is_empty() {
            return Value::empty_vector();
        }
        Value::vector(self.iter().map(Marshal::encode).collect())
    }

    fn decode(v: &Value) -> Result<Self, DecodeError> {
        v.as_vector()?
            .iter()
            .enumerate()
            .map(|(i, item)| T::decode(item).at(&format!("[{}]", i)))
            .collect()
    }
}

/// Label maps: `Map(String -> String)`. Decoding does not depend on encoded order.
impl Marshal for BTreeMap<String, String> {
    fn encode(&self) -> Value {
        if self.is_empty() {
            return Value::empty_map();
        }
        Value::map(self.iter().map(|(k, v)| (Value::string(k.as_str()), Value::string(v.as_str()))).collect())
    }

    fn decode(v: &Value) -> Result<Self, DecodeError> {
        let mut out = BTreeMap::new();
        for (i, (k, val)) in v.as_map()?.iter().enumerate() {
            let k = k.as_str().at(&format!("[{}].key", i))?;
            let val = val.as_str().at(&format!("[{}].value", i))?;
            out.insert(k.to_string(), val.to_string());
        }
        Ok(out)
    }
}
