// Canned node structures and values for tests.

use cdp_proto::{NodeInfo, NodeStructure, NodeType, ValueType, VariantValue, node_flags};

/// The system node (`id = 0`, name `"System"`) with the given applications.
pub fn system_node(children: Vec<NodeStructure>) -> NodeStructure {
    NodeStructure {
        info: NodeInfo {
            node_id: 0,
            name: "System".to_owned(),
            node_type: NodeType::System,
            value_type: ValueType::Undefined,
            flags: node_flags::VALUE_IS_READ_ONLY,
            is_local: false,
        },
        children,
    }
}

pub fn application_node(node_id: u32, name: &str, is_local: bool, leaf: bool) -> NodeStructure {
    let mut flags = node_flags::VALUE_IS_READ_ONLY;
    if leaf {
        flags |= node_flags::NODE_IS_LEAF;
    }
    NodeStructure {
        info: NodeInfo {
            node_id,
            name: name.to_owned(),
            node_type: NodeType::Application,
            value_type: ValueType::Undefined,
            flags,
            is_local,
        },
        children: vec![],
    }
}

pub fn component_node(node_id: u32, name: &str, children: Vec<NodeStructure>) -> NodeStructure {
    NodeStructure {
        info: NodeInfo {
            node_id,
            name: name.to_owned(),
            node_type: NodeType::Component,
            value_type: ValueType::Undefined,
            flags: node_flags::VALUE_IS_READ_ONLY,
            is_local: false,
        },
        children,
    }
}

/// A leaf property node carrying a scalar of `value_type`.
pub fn property_node(node_id: u32, name: &str, value_type: ValueType) -> NodeStructure {
    NodeStructure {
        info: NodeInfo {
            node_id,
            name: name.to_owned(),
            node_type: NodeType::Property,
            value_type,
            flags: node_flags::NODE_IS_LEAF,
            is_local: false,
        },
        children: vec![],
    }
}

pub fn double_value(node_id: u32, value: f64, timestamp: u64) -> VariantValue {
    VariantValue {
        node_id,
        timestamp,
        d_value: Some(value),
        ..Default::default()
    }
}

/// Graft children onto an existing structure, preserving its metadata.
pub fn with_children(mut structure: NodeStructure, children: Vec<NodeStructure>) -> NodeStructure {
    structure.info.flags &= !node_flags::NODE_IS_LEAF;
    structure.children = children;
    structure
}
