use super::types::{Node, NodeId};
use std::collections::{HashMap, HashSet};

/// Render nodes as an indented text tree.
///
/// Siblings are drawn in position order. A node whose parent is not in
/// `nodes` is drawn as a root, so a subtree renders from its top node.
pub fn render(nodes: &[Node]) -> String {
    let present: HashSet<NodeId> = nodes.iter().map(|n| n.id).collect();
    let mut children: HashMap<Option<NodeId>, Vec<&Node>> = HashMap::new();
    for node in nodes {
        let parent = node.parent_id.filter(|p| present.contains(p));
        children.entry(parent).or_default().push(node);
    }
    for siblings in children.values_mut() {
        siblings.sort_by_key(|n| (n.position, n.left));
    }

    let mut output = String::new();
    render_level(&children, None, &mut output, "");
    output
}

fn render_level(
    children: &HashMap<Option<NodeId>, Vec<&Node>>,
    parent: Option<NodeId>,
    output: &mut String,
    prefix: &str,
) {
    let Some(siblings) = children.get(&parent) else {
        return;
    };

    for (i, node) in siblings.iter().enumerate() {
        let is_last = i == siblings.len() - 1;
        let connector = if is_last { "└── " } else { "├── " };

        output.push_str(&format!("{}{}{}\n", prefix, connector, label(node)));

        let child_prefix = format!("{}{}", prefix, if is_last { "    " } else { "│   " });
        render_level(children, Some(node.id), output, &child_prefix);
    }
}

fn label(node: &Node) -> String {
    let mut label = node.name.replace('\n', "↵");

    if let Some(node_type) = node.properties.node_type() {
        label.push_str(&format!(" [{}]", node_type));
    }

    if let Some(counters) = node.properties.counters().filter(|c| !c.is_empty()) {
        let shown: Vec<String> = counters.iter().map(|(k, v)| format!("{}={}", k, v)).collect();
        label.push_str(&format!(" {{{}}}", shown.join(", ")));
    }

    label
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::types::Properties;
    use serde_json::json;

    fn node(name: &str, parent: Option<&Node>, position: i64, left: i64) -> Node {
        Node {
            id: NodeId::new(),
            tree_id: Default::default(),
            parent_id: parent.map(|p| p.id),
            name: name.to_string(),
            position,
            properties: Properties::new(),
            category_id: None,
            left,
            right: left + 1,
            depth: 0,
            created_at: 0,
            updated_at: 0,
        }
    }

    #[test]
    fn test_render_orders_siblings_by_position() {
        let root = node("root", None, 0, 1);
        let b = node("b", Some(&root), 1, 2);
        let a = node("a", Some(&root), 0, 4);
        let leaf = node("leaf", Some(&b), 0, 3);

        let output = render(&[root, b, a, leaf]);
        assert_eq!(output, "└── root\n    ├── a\n    └── b\n        └── leaf\n");
    }

    #[test]
    fn test_orphans_render_as_roots() {
        let root = node("root", None, 0, 1);
        let child = node("child", Some(&root), 0, 2);

        assert_eq!(render(&[child]), "└── child\n");
        assert_eq!(render(&[]), "");
    }

    #[test]
    fn test_label_shows_type_and_counters() {
        let mut n = node("doc", None, 0, 1);
        n.properties = Properties::try_from(json!({"type": "page", "counters": {"views": 3}})).unwrap();

        assert_eq!(render(&[n]), "└── doc [page] {views=3}\n");
    }
}
