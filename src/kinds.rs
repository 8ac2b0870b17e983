//! Built-in kind manifest: the security vocabulary shipped with the engine.
//!
//! Kinds are registered from this static manifest at startup; nothing is
//! discovered at runtime. Trust clamps encode the propagation policy, e.g. a
//! `Service` node is a shared concept and must never carry trust between the
//! hosts that expose it, while a `Finding` inherits the trust of its subject
//! so reporting can rank findings by clearance.

use crate::error::ArgusResult;
use crate::profile::ScanLevel;
use crate::schema::{AttrType, KindSchema, SchemaRegistry};

/// Build a registry populated with the built-in security kinds.
pub fn builtin_schema() -> ArgusResult<SchemaRegistry> {
    let registry = SchemaRegistry::new();

    registry.register(
        KindSchema::new("Network")
            .attr("name", AttrType::Text)
            .natural_key(&["name"]),
    )?;

    // Hostnames and addresses inherit from their network, capped at L2 so a
    // trusted network does not automatically authorize aggressive scanning
    // of every name inside it.
    registry.register(
        KindSchema::new("Hostname")
            .relation("network", "Network", ScanLevel::L4, ScanLevel::L2)
            .attr("name", AttrType::Text)
            .natural_key(&["network", "name"]),
    )?;

    registry.register(
        KindSchema::new("IPAddress")
            .relation("network", "Network", ScanLevel::L4, ScanLevel::L2)
            .attr("address", AttrType::Text)
            .natural_key(&["network", "address"]),
    )?;

    // A resolution binds name and address tightly; trust flows both ways.
    registry.register(
        KindSchema::new("ResolvedHostname")
            .relation("hostname", "Hostname", ScanLevel::L4, ScanLevel::L4)
            .relation("address", "IPAddress", ScanLevel::L4, ScanLevel::L4)
            .natural_key(&["hostname", "address"]),
    )?;

    registry.register(
        KindSchema::new("IPPort")
            .relation("address", "IPAddress", ScanLevel::L4, ScanLevel::L4)
            .attr("protocol", AttrType::Text)
            .attr("port", AttrType::Integer)
            .natural_key(&["address", "protocol", "port"]),
    )?;

    registry.register(
        KindSchema::new("Service")
            .attr("name", AttrType::Text)
            .natural_key(&["name"]),
    )?;

    // Service is a shared concept node ("ssh", "http"); clamping both
    // directions to L0 stops trust leaking between unrelated hosts that
    // happen to run the same service.
    registry.register(
        KindSchema::new("IPService")
            .relation("ip_port", "IPPort", ScanLevel::L4, ScanLevel::L4)
            .relation("service", "Service", ScanLevel::L0, ScanLevel::L0)
            .natural_key(&["ip_port", "service"]),
    )?;

    registry.register(
        KindSchema::new("Website")
            .relation("ip_service", "IPService", ScanLevel::L4, ScanLevel::L4)
            .relation("hostname", "Hostname", ScanLevel::L4, ScanLevel::L4)
            .natural_key(&["ip_service", "hostname"]),
    )?;

    registry.register(
        KindSchema::new("HTTPHeader")
            .relation("website", "Website", ScanLevel::L4, ScanLevel::L4)
            .attr("key", AttrType::Text)
            .attr("value", AttrType::Text)
            .natural_key(&["website", "key"]),
    )?;

    registry.register(
        KindSchema::new("Certificate")
            .relation("website", "Website", ScanLevel::L4, ScanLevel::L4)
            .attr("serial", AttrType::Text)
            .attr("expires_in_days", AttrType::Integer)
            .natural_key(&["website", "serial"]),
    )?;

    registry.register(
        KindSchema::new("FindingType")
            .attr("id", AttrType::Text)
            .natural_key(&["id"]),
    )?;

    // Findings inherit the trust of their subject. They cannot bridge
    // trust between unrelated nodes: the only other relation they carry is
    // the fully clamped finding_type.
    registry.register(
        KindSchema::new("Finding")
            .relation("finding_type", "FindingType", ScanLevel::L0, ScanLevel::L0)
            .any_relation("ooi", ScanLevel::L4, ScanLevel::L4)
            .natural_key(&["finding_type", "ooi"]),
    )?;

    Ok(registry)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::node::{AttrValue, Node};
    use crate::reference::Reference;

    #[test]
    fn builtin_schema_registers_all_kinds() {
        let registry = builtin_schema().unwrap();
        for kind in [
            "Network",
            "Hostname",
            "IPAddress",
            "ResolvedHostname",
            "IPPort",
            "Service",
            "IPService",
            "Website",
            "HTTPHeader",
            "Certificate",
            "FindingType",
            "Finding",
        ] {
            assert!(registry.contains(kind), "missing kind {kind}");
        }
    }

    #[test]
    fn deep_identity_round_trip() {
        let registry = builtin_schema().unwrap();

        let network = Reference::from_tokens("Network", &["internet".to_string()]);
        let address = Node::new("IPAddress")
            .with_attr("network", network.clone())
            .with_attr("address", "192.0.2.7");
        let address_ref = registry.reference_of(&address).unwrap();

        let port = Node::new("IPPort")
            .with_attr("address", address_ref)
            .with_attr("protocol", "tcp")
            .with_attr("port", 443i64);
        let port_ref = registry.reference_of(&port).unwrap();
        assert_eq!(port_ref.to_string(), "IPPort|internet|192.0.2.7|tcp|443");

        let tree = registry.parse(&port_ref.to_string()).unwrap();
        assert_eq!(tree.reference(), port_ref);
    }

    #[test]
    fn finding_identity_embeds_subject() {
        let registry = builtin_schema().unwrap();

        let network = Reference::from_tokens("Network", &["internet".to_string()]);
        let hostname = Node::new("Hostname")
            .with_attr("network", network)
            .with_attr("name", "example.com");
        let hostname_ref = registry.reference_of(&hostname).unwrap();

        let finding_type = Reference::from_tokens("FindingType", &["KAT-NO-HSTS".to_string()]);
        let finding = Node::new("Finding")
            .with_attr("finding_type", finding_type)
            .with_attr("ooi", AttrValue::any_ref(hostname_ref));
        let reference = registry.reference_of(&finding).unwrap();

        let tree = registry.parse(&reference.to_string()).unwrap();
        assert_eq!(tree.reference(), reference);
    }

    #[test]
    fn service_relation_is_fully_clamped() {
        let registry = builtin_schema().unwrap();
        let schema = registry.get("IPService").unwrap();
        let service = schema.relation_schema("service").unwrap();
        assert_eq!(service.max_issue_level, ScanLevel::L0);
        assert_eq!(service.max_inherit_level, ScanLevel::L0);
    }
}
