use factbridge_core::value::Either;
use factbridge_core::{Ctor, Value, ValueError};

use crate::ctors::*;
use crate::model::*;
use crate::{tables, At, DecodeError, Fact, Marshal};

fn string_field(v: &Value, field: &str) -> Result<String, DecodeError> {
    v.as_str().map(str::to_string).at(field)
}

/// Decode a zero-arity struct against a closed set of constructors.
fn decode_unit_enum<T: Copy>(v: &Value, arms: &[(Ctor, T)], names: &'static [&'static str]) -> Result<T, DecodeError> {
    let s = v.as_struct()?;
    for (ctor, out) in arms {
        if s.name == ctor.name {
            ctor.fields(v)?;
            return Ok(*out);
        }
    }
    Err(ValueError::UnknownVariant { expected: names, found: s.name.to_string() }.into())
}

impl Marshal for Uid {
    fn encode(&self) -> Value { UID.build(vec![Value::string(self.0.as_str())]) }

    fn decode(v: &Value) -> Result<Self, DecodeError> {
        let f = UID.fields(v)?;
        Ok(Uid(string_field(&f[0], "0")?))
    }
}

impl Marshal for Namespace {
    fn encode(&self) -> Value {
        NAMESPACE.build(vec![Value::string(self.name.as_str()), self.uid.encode(), self.labels.encode()])
    }

    fn decode(v: &Value) -> Result<Self, DecodeError> {
        let f = NAMESPACE.fields(v)?;
        Ok(Namespace {
            name: string_field(&f[0], "name")?,
            uid: Uid::decode(&f[1]).at("uid")?,
            labels: Labels::decode(&f[2]).at("labels")?,
        })
    }
}

impl Fact for Namespace {
    const TABLE: &'static str = tables::NAMESPACE;

    /// Namespaces are cluster-scoped: the key is the bare name.
    fn encode_key(_namespace: Option<&str>, name: &str) -> Value { Value::string(name) }

    fn key_of(v: &Value) -> Result<Value, DecodeError> {
        let f = NAMESPACE.fields(v)?;
        Ok(Value::string(string_field(&f[0], "name")?))
    }

    fn namespace(&self) -> Option<&str> { None }
    fn name(&self) -> &str { &self.name }
}

impl Marshal for PodSpec {
    fn encode(&self) -> Value { POD_SPEC.build(vec![Value::string(self.node_name.as_str())]) }

    fn decode(v: &Value) -> Result<Self, DecodeError> {
        let f = POD_SPEC.fields(v)?;
        Ok(PodSpec { node_name: string_field(&f[0], "node_name")? })
    }
}

impl Marshal for PodStatus {
    fn encode(&self) -> Value { POD_STATUS.build(vec![Value::string(self.pod_ip.as_str())]) }

    fn decode(v: &Value) -> Result<Self, DecodeError> {
        let f = POD_STATUS.fields(v)?;
        Ok(PodStatus { pod_ip: string_field(&f[0], "pod_ip")? })
    }
}

impl Marshal for Pod {
    fn encode(&self) -> Value {
        POD.build(vec![
            Value::string(self.name.as_str()),
            Value::string(self.namespace.as_str()),
            self.uid.encode(),
            self.labels.encode(),
            self.spec.encode(),
            self.status.encode(),
        ])
    }

    fn decode(v: &Value) -> Result<Self, DecodeError> {
        let f = POD.fields(v)?;
        Ok(Pod {
            name: string_field(&f[0], "name")?,
            namespace: string_field(&f[1], "namespace")?,
            uid: Uid::decode(&f[2]).at("uid")?,
            labels: Labels::decode(&f[3]).at("labels")?,
            spec: PodSpec::decode(&f[4]).at("spec")?,
            status: PodStatus::decode(&f[5]).at("status")?,
        })
    }
}

fn namespaced_key(namespace: Option<&str>, name: &str) -> Value {
    Value::pair(Value::string(namespace.unwrap_or_default()), Value::string(name))
}

impl Fact for Pod {
    const TABLE: &'static str = tables::POD;

    fn encode_key(namespace: Option<&str>, name: &str) -> Value { namespaced_key(namespace, name) }

    fn key_of(v: &Value) -> Result<Value, DecodeError> {
        let f = POD.fields(v)?;
        let name = string_field(&f[0], "name")?;
        let namespace = string_field(&f[1], "namespace")?;
        Ok(namespaced_key(Some(&namespace), &name))
    }

    fn namespace(&self) -> Option<&str> { Some(&self.namespace) }
    fn name(&self) -> &str { &self.name }
}

const OPERATOR_ARMS: &[&str] = &[OP_IN.name, OP_NOT_IN.name, OP_EXISTS.name, OP_DOES_NOT_EXIST.name];

impl Marshal for LabelSelectorOperator {
    fn encode(&self) -> Value {
        match self {
            LabelSelectorOperator::In => OP_IN.unit(),
            LabelSelectorOperator::NotIn => OP_NOT_IN.unit(),
            LabelSelectorOperator::Exists => OP_EXISTS.unit(),
            LabelSelectorOperator::DoesNotExist => OP_DOES_NOT_EXIST.unit(),
        }
    }

    fn decode(v: &Value) -> Result<Self, DecodeError> {
        decode_unit_enum(
            v,
            &[
                (OP_IN, LabelSelectorOperator::In),
                (OP_NOT_IN, LabelSelectorOperator::NotIn),
                (OP_EXISTS, LabelSelectorOperator::Exists),
                (OP_DOES_NOT_EXIST, LabelSelectorOperator::DoesNotExist),
            ],
            OPERATOR_ARMS,
        )
    }
}

impl Marshal for LabelSelectorRequirement {
    fn encode(&self) -> Value {
        LABEL_SELECTOR_REQUIREMENT.build(vec![
            Value::string(self.key.as_str()),
            self.operator.encode(),
            self.values.encode(),
        ])
    }

    fn decode(v: &Value) -> Result<Self, DecodeError> {
        let f = LABEL_SELECTOR_REQUIREMENT.fields(v)?;
        Ok(LabelSelectorRequirement {
            key: string_field(&f[0], "key")?,
            operator: LabelSelectorOperator::decode(&f[1]).at("operator")?,
            values: Vec::<String>::decode(&f[2]).at("values")?,
        })
    }
}

impl Marshal for LabelSelector {
    fn encode(&self) -> Value {
        LABEL_SELECTOR.build(vec![self.match_labels.encode(), self.match_expressions.encode()])
    }

    fn decode(v: &Value) -> Result<Self, DecodeError> {
        let f = LABEL_SELECTOR.fields(v)?;
        Ok(LabelSelector {
            match_labels: Labels::decode(&f[0]).at("match_labels")?,
            match_expressions: Vec::decode(&f[1]).at("match_expressions")?,
        })
    }
}

/// `Left(i32)` for numeric ports, `Right(string)` for named ports.
impl Marshal for IntOrString {
    fn encode(&self) -> Value {
        match self {
            IntOrString::Int(i) => Value::left(Value::i32(*i)),
            IntOrString::String(s) => Value::right(Value::string(s.as_str())),
        }
    }

    fn decode(v: &Value) -> Result<Self, DecodeError> {
        match v.as_either()? {
            Either::Left(i) => Ok(IntOrString::Int(i32::decode(i).at("Left")?)),
            Either::Right(s) => Ok(IntOrString::String(string_field(s, "Right")?)),
        }
    }
}

impl Marshal for NetworkPolicyPort {
    fn encode(&self) -> Value { NETWORK_POLICY_PORT.build(vec![self.protocol.encode(), self.port.encode()]) }

    fn decode(v: &Value) -> Result<Self, DecodeError> {
        let f = NETWORK_POLICY_PORT.fields(v)?;
        Ok(NetworkPolicyPort {
            protocol: Option::decode(&f[0]).at("protocol")?,
            port: Option::decode(&f[1]).at("port")?,
        })
    }
}

impl Marshal for IpBlock {
    fn encode(&self) -> Value { IP_BLOCK.build(vec![Value::string(self.cidr.as_str()), self.except.encode()]) }

    fn decode(v: &Value) -> Result<Self, DecodeError> {
        let f = IP_BLOCK.fields(v)?;
        Ok(IpBlock { cidr: string_field(&f[0], "cidr")?, except: Vec::decode(&f[1]).at("except")? })
    }
}

impl Marshal for NetworkPolicyPeer {
    fn encode(&self) -> Value {
        NETWORK_POLICY_PEER.build(vec![
            self.pod_selector.encode(),
            self.namespace_selector.encode(),
            self.ip_block.encode(),
        ])
    }

    fn decode(v: &Value) -> Result<Self, DecodeError> {
        let f = NETWORK_POLICY_PEER.fields(v)?;
        Ok(NetworkPolicyPeer {
            pod_selector: Option::decode(&f[0]).at("pod_selector")?,
            namespace_selector: Option::decode(&f[1]).at("namespace_selector")?,
            ip_block: Option::decode(&f[2]).at("ip_block")?,
        })
    }
}

impl Marshal for IngressRule {
    fn encode(&self) -> Value { INGRESS_RULE.build(vec![self.ports.encode(), self.from.encode()]) }

    fn decode(v: &Value) -> Result<Self, DecodeError> {
        let f = INGRESS_RULE.fields(v)?;
        Ok(IngressRule { ports: Vec::decode(&f[0]).at("ports")?, from: Vec::decode(&f[1]).at("from")? })
    }
}

impl Marshal for EgressRule {
    fn encode(&self) -> Value { EGRESS_RULE.build(vec![self.ports.encode(), self.to.encode()]) }

    fn decode(v: &Value) -> Result<Self, DecodeError> {
        let f = EGRESS_RULE.fields(v)?;
        Ok(EgressRule { ports: Vec::decode(&f[0]).at("ports")?, to: Vec::decode(&f[1]).at("to")? })
    }
}

const POLICY_TYPE_ARMS: &[&str] = &[POLICY_TYPE_INGRESS.name, POLICY_TYPE_EGRESS.name];

impl Marshal for PolicyType {
    fn encode(&self) -> Value {
        match self {
            PolicyType::Ingress => POLICY_TYPE_INGRESS.unit(),
            PolicyType::Egress => POLICY_TYPE_EGRESS.unit(),
        }
    }

    fn decode(v: &Value) -> Result<Self, DecodeError> {
        decode_unit_enum(
            v,
            &[(POLICY_TYPE_INGRESS, PolicyType::Ingress), (POLICY_TYPE_EGRESS, PolicyType::Egress)],
            POLICY_TYPE_ARMS,
        )
    }
}

impl Marshal for NetworkPolicySpec {
    fn encode(&self) -> Value {
        NETWORK_POLICY_SPEC.build(vec![
            self.pod_selector.encode(),
            self.ingress.encode(),
            self.egress.encode(),
            self.policy_types.encode(),
        ])
    }

    fn decode(v: &Value) -> Result<Self, DecodeError> {
        let f = NETWORK_POLICY_SPEC.fields(v)?;
        Ok(NetworkPolicySpec {
            pod_selector: LabelSelector::decode(&f[0]).at("pod_selector")?,
            ingress: Vec::decode(&f[1]).at("ingress")?,
            egress: Vec::decode(&f[2]).at("egress")?,
            policy_types: Vec::decode(&f[3]).at("policy_types")?,
        })
    }
}

impl Marshal for NetworkPolicy {
    fn encode(&self) -> Value {
        NETWORK_POLICY.build(vec![
            Value::string(self.name.as_str()),
            Value::string(self.namespace.as_str()),
            self.uid.encode(),
            self.spec.encode(),
        ])
    }

    fn decode(v: &Value) -> Result<Self, DecodeError> {
        let f = NETWORK_POLICY.fields(v)?;
        Ok(NetworkPolicy {
            name: string_field(&f[0], "name")?,
            namespace: string_field(&f[1], "namespace")?,
            uid: Uid::decode(&f[2]).at("uid")?,
            spec: NetworkPolicySpec::decode(&f[3]).at("spec")?,
        })
    }
}

impl Fact for NetworkPolicy {
    const TABLE: &'static str = tables::NETWORK_POLICY;

    fn encode_key(namespace: Option<&str>, name: &str) -> Value { namespaced_key(namespace, name) }

    fn key_of(v: &Value) -> Result<Value, DecodeError> {
        let f = NETWORK_POLICY.fields(v)?;
        let name = string_field(&f[0], "name")?;
        let namespace = string_field(&f[1], "namespace")?;
        Ok(namespaced_key(Some(&namespace), &name))
    }

    fn namespace(&self) -> Option<&str> { Some(&self.namespace) }
    fn name(&self) -> &str { &self.name }
}
