//! Conversion from k8s-openapi objects into the domain model.

use k8s_openapi::api::core::v1 as corev1;
use k8s_openapi::api::networking::v1 as netv1;
use k8s_openapi::apimachinery::pkg::apis::meta::v1 as metav1;
use k8s_openapi::apimachinery::pkg::util::intstr::IntOrString as K8sIntOrString;
use thiserror::Error;

use crate::model::*;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ConvertError {
    #[error("unknown label selector operator {0:?}")]
    UnknownOperator(String),
    #[error("unknown policy type {0:?}")]
    UnknownPolicyType(String),
}

fn meta_parts(meta: &metav1::ObjectMeta) -> (String, String, Uid, Labels) {
    (
        meta.name.clone().unwrap_or_default(),
        meta.namespace.clone().unwrap_or_default(),
        Uid(meta.uid.clone().unwrap_or_default()),
        meta.labels.clone().unwrap_or_default(),
    )
}

impl From<&corev1::Namespace> for Namespace {
    fn from(ns: &corev1::Namespace) -> Self {
        let (name, _, uid, labels) = meta_parts(&ns.metadata);
        Namespace { name, uid, labels }
    }
}

impl From<&corev1::Pod> for Pod {
    fn from(pod: &corev1::Pod) -> Self {
        let (name, namespace, uid, labels) = meta_parts(&pod.metadata);
        let node_name = pod.spec.as_ref().and_then(|s| s.node_name.clone()).unwrap_or_default();
        let pod_ip = pod.status.as_ref().and_then(|s| s.pod_ip.clone()).unwrap_or_default();
        Pod { name, namespace, uid, labels, spec: PodSpec { node_name }, status: PodStatus { pod_ip } }
    }
}

impl TryFrom<&metav1::LabelSelectorRequirement> for LabelSelectorRequirement {
    type Error = ConvertError;

    fn try_from(req: &metav1::LabelSelectorRequirement) -> Result<Self, Self::Error> {
        let operator = LabelSelectorOperator::parse(&req.operator)
            .ok_or_else(|| ConvertError::UnknownOperator(req.operator.clone()))?;
        Ok(LabelSelectorRequirement { key: req.key.clone(), operator, values: req.values.clone().unwrap_or_default() })
    }
}

impl TryFrom<&metav1::LabelSelector> for LabelSelector {
    type Error = ConvertError;

    fn try_from(sel: &metav1::LabelSelector) -> Result<Self, Self::Error> {
        let match_expressions = sel
            .match_expressions
            .iter()
            .flatten()
            .map(LabelSelectorRequirement::try_from)
            .collect::<Result<Vec<_>, _>>()?;
        Ok(LabelSelector { match_labels: sel.match_labels.clone().unwrap_or_default(), match_expressions })
    }
}

impl From<&K8sIntOrString> for IntOrString {
    fn from(v: &K8sIntOrString) -> Self {
        match v {
            K8sIntOrString::Int(i) => IntOrString::Int(*i),
            K8sIntOrString::String(s) => IntOrString::String(s.clone()),
        }
    }
}

impl From<&netv1::NetworkPolicyPort> for NetworkPolicyPort {
    fn from(p: &netv1::NetworkPolicyPort) -> Self {
        NetworkPolicyPort { protocol: p.protocol.clone(), port: p.port.as_ref().map(IntOrString::from) }
    }
}

impl From<&netv1::IPBlock> for IpBlock {
    fn from(b: &netv1::IPBlock) -> Self {
        IpBlock { cidr: b.cidr.clone(), except: b.except.clone().unwrap_or_default() }
    }
}

fn opt_selector(sel: &Option<metav1::LabelSelector>) -> Result<Option<LabelSelector>, ConvertError> {
    sel.as_ref().map(LabelSelector::try_from).transpose()
}

impl TryFrom<&netv1::NetworkPolicyPeer> for NetworkPolicyPeer {
    type Error = ConvertError;

    fn try_from(p: &netv1::NetworkPolicyPeer) -> Result<Self, Self::Error> {
        Ok(NetworkPolicyPeer {
            pod_selector: opt_selector(&p.pod_selector)?,
            namespace_selector: opt_selector(&p.namespace_selector)?,
            ip_block: p.ip_block.as_ref().map(IpBlock::from),
        })
    }
}

fn ports(ports: &Option<Vec<netv1::NetworkPolicyPort>>) -> Vec<NetworkPolicyPort> {
    ports.iter().flatten().map(NetworkPolicyPort::from).collect()
}

fn peers(peers: &Option<Vec<netv1::NetworkPolicyPeer>>) -> Result<Vec<NetworkPolicyPeer>, ConvertError> {
    peers.iter().flatten().map(NetworkPolicyPeer::try_from).collect()
}

impl TryFrom<&netv1::NetworkPolicySpec> for NetworkPolicySpec {
    type Error = ConvertError;

    fn try_from(spec: &netv1::NetworkPolicySpec) -> Result<Self, Self::Error> {
        let ingress = spec
            .ingress
            .iter()
            .flatten()
            .map(|r| -> Result<IngressRule, ConvertError> { Ok(IngressRule { ports: ports(&r.ports), from: peers(&r.from)? }) })
            .collect::<Result<Vec<_>, _>>()?;
        let egress = spec
            .egress
            .iter()
            .flatten()
            .map(|r| -> Result<EgressRule, ConvertError> { Ok(EgressRule { ports: ports(&r.ports), to: peers(&r.to)? }) })
            .collect::<Result<Vec<_>, _>>()?;
        let policy_types = spec
            .policy_types
            .iter()
            .flatten()
            .map(|t| PolicyType::parse(t).ok_or_else(|| ConvertError::UnknownPolicyType(t.clone())))
            .collect::<Result<Vec<_>, _>>()?;
        Ok(NetworkPolicySpec { pod_selector: LabelSelector::try_from(&spec.pod_selector)?, ingress, egress, policy_types })
    }
}

impl TryFrom<&netv1::NetworkPolicy> for NetworkPolicy {
    type Error = ConvertError;

    fn try_from(np: &netv1::NetworkPolicy) -> Result<Self, Self::Error> {
        let (name, namespace, uid, _) = meta_parts(&np.metadata);
        let spec = match &np.spec {
            Some(spec) => NetworkPolicySpec::try_from(spec)?,
            None => NetworkPolicySpec::default(),
        };
        Ok(NetworkPolicy { name, namespace, uid, spec })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{Fact, Marshal};

    #[test]
    fn namespace_from_k8s() {
        let ns: corev1::Namespace = serde_json::from_value(serde_json::json!({
            "metadata": { "name": "ns1", "uid": "u1", "labels": { "app": "nginx" } }
        }))
        .unwrap();
        let m = Namespace::from(&ns);
        assert_eq!(m.name, "ns1");
        assert_eq!(m.uid, Uid("u1".into()));
        assert_eq!(m.labels.get("app").map(String::as_str), Some("nginx"));
        assert_eq!(m.key(), factbridge_core::Value::string("ns1"));
    }

    #[test]
    fn pod_without_spec_or_status_gets_empty_fields() {
        let pod: corev1::Pod = serde_json::from_value(serde_json::json!({
            "metadata": { "name": "p", "namespace": "default", "uid": "x" }
        }))
        .unwrap();
        let m = Pod::from(&pod);
        assert!(m.labels.is_empty());
        assert_eq!(m.spec.node_name, "");
        assert_eq!(m.status.pod_ip, "");
        assert_eq!(Pod::decode(&m.encode()).unwrap(), m);
    }

    #[test]
    fn network_policy_from_k8s() {
        let np: netv1::NetworkPolicy = serde_json::from_value(serde_json::json!({
            "metadata": { "name": "web", "namespace": "prod", "uid": "np-1" },
            "spec": {
                "podSelector": { "matchLabels": { "app": "web-server" } },
                "policyTypes": ["Ingress"],
                "ingress": [{
                    "from": [{ "podSelector": { "matchLabels": { "app": "web-client" } } },
                             { "ipBlock": { "cidr": "10.0.0.0/8", "except": ["10.1.0.0/16"] } }],
                    "ports": [{ "protocol": "TCP", "port": 80 }, { "port": "http" }]
                }]
            }
        }))
        .unwrap();
        let m = NetworkPolicy::try_from(&np).unwrap();
        assert_eq!(m.spec.policy_types, vec![PolicyType::Ingress]);
        let rule = &m.spec.ingress[0];
        assert_eq!(rule.ports[0].port, Some(IntOrString::Int(80)));
        assert_eq!(rule.ports[1].port, Some(IntOrString::String("http".into())));
        assert_eq!(rule.ports[1].protocol, None);
        assert!(rule.from[0].pod_selector.is_some());
        assert!(rule.from[0].namespace_selector.is_none());
        assert_eq!(rule.from[1].ip_block.as_ref().unwrap().except, vec!["10.1.0.0/16".to_string()]);
        assert!(m.spec.egress.is_empty());
        assert_eq!(NetworkPolicy::decode(&m.encode()).unwrap(), m);
    }

    #[test]
    fn unknown_operator_is_rejected() {
        let np: netv1::NetworkPolicy = serde_json::from_value(serde_json::json!({
            "metadata": { "name": "bad", "namespace": "prod" },
            "spec": {
                "podSelector": { "matchExpressions": [{ "key": "tier", "operator": "Near" }] }
            }
        }))
        .unwrap();
        assert_eq!(NetworkPolicy::try_from(&np), Err(ConvertError::UnknownOperator("Near".into())));
    }

    #[test]
    fn unknown_policy_type_is_rejected() {
        let np: netv1::NetworkPolicy = serde_json::from_value(serde_json::json!({
            "metadata": { "name": "bad", "namespace": "prod" },
            "spec": { "podSelector": {}, "policyTypes": ["Sideways"] }
        }))
        .unwrap();
        assert!(matches!(NetworkPolicy::try_from(&np), Err(ConvertError::UnknownPolicyType(_))));
    }
}
