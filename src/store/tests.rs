use super::*;
use crate::config::GroveConfig;
use proptest::prelude::*;
use proptest::sample::Index;
use serde_json::json;
use std::collections::HashMap;
use tempfile::{tempdir, TempDir};

async fn create_test_storage() -> (GroveStorage, TempDir) {
    let dir = tempdir().unwrap();
    let storage = GroveStorage::new(GroveConfig::at(dir.path().join("test_grove.db")))
        .await
        .unwrap();
    (storage, dir)
}

async fn create_test_tree(storage: &GroveStorage) -> Tree {
    storage
        .create_tree(NewTree {
            name: "test".to_string(),
            ..Default::default()
        })
        .await
        .unwrap()
}

fn names(entries: &[TreeEntry]) -> Vec<&str> {
    entries.iter().map(|e| e.node.name.as_str()).collect()
}

fn bounds(node: &Node) -> (i64, i64, i64) {
    (node.left, node.right, node.depth)
}

async fn assert_healthy(storage: &GroveStorage, tree_id: &TreeId) {
    let violations = storage.verify_tree(tree_id).await.unwrap();
    assert!(violations.is_empty(), "violations: {:?}", violations);
}

// ============================================================================
// Creation and traversal
// ============================================================================

#[tokio::test]
async fn test_root_child_and_subtree_walk() {
    let (storage, _dir) = create_test_storage().await;
    let tree = create_test_tree(&storage).await;

    let r = storage.create_node(&tree.id, NewNode::new("R")).await.unwrap();
    assert_eq!(bounds(&r), (1, 2, 0));

    let c1 = storage
        .create_node(&tree.id, NewNode::new("C1").under(r.id))
        .await
        .unwrap();
    let c2 = storage
        .create_node(&tree.id, NewNode::new("C2").under(r.id))
        .await
        .unwrap();
    assert_eq!(bounds(&c1), (2, 3, 1));
    assert_eq!(bounds(&c2), (4, 5, 1));
    assert_eq!((c1.position, c2.position), (0, 1));

    let r = storage.get_node(&tree.id, &r.id).await.unwrap().unwrap();
    assert_eq!(bounds(&r), (1, 6, 0));

    let subtree = storage
        .get_subtree(&tree.id, &r.id, SubtreeQuery::unbounded())
        .await
        .unwrap();
    assert_eq!(names(&subtree), vec!["R", "C1", "C2"]);
    assert_eq!(subtree.iter().map(|e| e.level).collect::<Vec<_>>(), vec![0, 1, 1]);

    let path = storage.get_path_to_root(&tree.id, &c1.id).await.unwrap();
    assert_eq!(names(&path), vec!["R", "C1"]);
    assert_healthy(&storage, &tree.id).await;
}

#[tokio::test]
async fn test_move_under_sibling_then_reject_cycle() {
    let (storage, _dir) = create_test_storage().await;
    let tree = create_test_tree(&storage).await;

    let r = storage.create_node(&tree.id, NewNode::new("R")).await.unwrap();
    let c1 = storage
        .create_node(&tree.id, NewNode::new("C1").under(r.id))
        .await
        .unwrap();
    let c2 = storage
        .create_node(&tree.id, NewNode::new("C2").under(r.id))
        .await
        .unwrap();

    let moved = storage
        .move_subtree(&tree.id, &c2.id, Some(&c1.id))
        .await
        .unwrap()
        .unwrap();
    assert_eq!(moved.parent_id, Some(c1.id));
    assert_eq!(bounds(&moved), (3, 4, 2));

    let subtree = storage
        .get_subtree(&tree.id, &c1.id, SubtreeQuery::unbounded())
        .await
        .unwrap();
    assert_eq!(names(&subtree), vec!["C1", "C2"]);
    assert_eq!(subtree[1].level, 1);

    let before = storage.list_all_nodes(&tree.id).await.unwrap();
    let err = storage
        .move_subtree(&tree.id, &r.id, Some(&c1.id))
        .await
        .unwrap_err();
    assert!(matches!(err, GroveError::Cycle));
    assert_eq!(
        err.to_string(),
        "Cycle prevented: the new parent is part of the subtree."
    );

    let after = storage.list_all_nodes(&tree.id).await.unwrap();
    assert_eq!(before, after);
    assert_healthy(&storage, &tree.id).await;
}

#[tokio::test]
async fn test_move_under_itself_is_a_cycle() {
    let (storage, _dir) = create_test_storage().await;
    let tree = create_test_tree(&storage).await;
    let r = storage.create_node(&tree.id, NewNode::new("R")).await.unwrap();

    let err = storage
        .move_subtree(&tree.id, &r.id, Some(&r.id))
        .await
        .unwrap_err();
    assert!(err.is_structural());
}

#[tokio::test]
async fn test_create_errors() {
    let (storage, _dir) = create_test_storage().await;
    let tree = create_test_tree(&storage).await;
    let other = create_test_tree(&storage).await;
    let foreign = storage.create_node(&other.id, NewNode::new("x")).await.unwrap();

    let missing_tree = TreeId::new();
    let err = storage
        .create_node(&missing_tree, NewNode::new("a"))
        .await
        .unwrap_err();
    assert!(matches!(err, GroveError::TreeNotFound(id) if id == missing_tree));

    let err = storage
        .create_node(&tree.id, NewNode::new("a").under(foreign.id))
        .await
        .unwrap_err();
    assert!(matches!(err, GroveError::ParentNotFound(id) if id == foreign.id));

    let err = storage
        .create_node(&tree.id, NewNode::new("a").in_category(CategoryId::new()))
        .await
        .unwrap_err();
    assert!(err.is_not_found());

    assert!(storage.list_all_nodes(&tree.id).await.unwrap().is_empty());
}

#[tokio::test]
async fn test_roots_are_appended_after_existing_trees() {
    let (storage, _dir) = create_test_storage().await;
    let tree = create_test_tree(&storage).await;

    let a = storage.create_node(&tree.id, NewNode::new("a")).await.unwrap();
    storage
        .create_node(&tree.id, NewNode::new("a1").under(a.id))
        .await
        .unwrap();
    let b = storage.create_node(&tree.id, NewNode::new("b")).await.unwrap();
    assert_eq!(bounds(&b), (5, 6, 0));

    let roots = storage.list_children(&tree.id, None).await.unwrap();
    assert_eq!(roots.iter().map(|n| n.name.as_str()).collect::<Vec<_>>(), vec!["a", "b"]);
}

#[tokio::test]
async fn test_interval_numbering_is_per_tree() {
    let (storage, _dir) = create_test_storage().await;
    let first = create_test_tree(&storage).await;
    let second = create_test_tree(&storage).await;

    storage.create_node(&first.id, NewNode::new("a")).await.unwrap();
    let other = storage.create_node(&second.id, NewNode::new("b")).await.unwrap();
    assert_eq!(bounds(&other), (1, 2, 0));
}

#[tokio::test]
async fn test_subtree_max_depth() {
    let (storage, _dir) = create_test_storage().await;
    let tree = create_test_tree(&storage).await;

    let r = storage.create_node(&tree.id, NewNode::new("R")).await.unwrap();
    let a = storage
        .create_node(&tree.id, NewNode::new("A").under(r.id))
        .await
        .unwrap();
    let b = storage
        .create_node(&tree.id, NewNode::new("B").under(a.id))
        .await
        .unwrap();
    storage
        .create_node(&tree.id, NewNode::new("C").under(b.id))
        .await
        .unwrap();

    let zero = storage
        .get_subtree(&tree.id, &r.id, SubtreeQuery::max_depth(0))
        .await
        .unwrap();
    assert_eq!(names(&zero), vec!["R"]);

    let one = storage
        .get_subtree(&tree.id, &r.id, SubtreeQuery::max_depth(1))
        .await
        .unwrap();
    assert_eq!(names(&one), vec!["R", "A"]);

    let from_a = storage
        .get_subtree(&tree.id, &a.id, SubtreeQuery::max_depth(1))
        .await
        .unwrap();
    assert_eq!(names(&from_a), vec!["A", "B"]);
    assert_eq!(from_a.iter().map(|e| e.level).collect::<Vec<_>>(), vec![0, 1]);

    let path = storage.get_path_to_root(&tree.id, &b.id).await.unwrap();
    assert_eq!(path.iter().map(|e| e.level).collect::<Vec<_>>(), vec![0, 1, 2]);
}

#[tokio::test]
async fn test_queries_on_missing_node_are_empty() {
    let (storage, _dir) = create_test_storage().await;
    let tree = create_test_tree(&storage).await;
    let ghost = NodeId::new();

    assert!(storage.get_node(&tree.id, &ghost).await.unwrap().is_none());
    assert!(storage
        .get_subtree(&tree.id, &ghost, SubtreeQuery::unbounded())
        .await
        .unwrap()
        .is_empty());
    assert!(storage.get_path_to_root(&tree.id, &ghost).await.unwrap().is_empty());
}

// ============================================================================
// Moves and deletes
// ============================================================================

#[tokio::test]
async fn test_move_to_root_and_back() {
    let (storage, _dir) = create_test_storage().await;
    let tree = create_test_tree(&storage).await;

    let r = storage.create_node(&tree.id, NewNode::new("R")).await.unwrap();
    let c1 = storage
        .create_node(&tree.id, NewNode::new("C1").under(r.id))
        .await
        .unwrap();
    let leaf = storage
        .create_node(&tree.id, NewNode::new("leaf").under(c1.id))
        .await
        .unwrap();
    storage
        .create_node(&tree.id, NewNode::new("C2").under(r.id))
        .await
        .unwrap();

    let moved = storage
        .move_subtree(&tree.id, &c1.id, None)
        .await
        .unwrap()
        .unwrap();
    assert!(moved.is_root());
    assert_eq!(moved.depth, 0);
    assert_healthy(&storage, &tree.id).await;

    let leaf = storage.get_node(&tree.id, &leaf.id).await.unwrap().unwrap();
    assert_eq!(leaf.depth, 1);
    assert!(moved.is_ancestor_of(&leaf));

    let roots = storage.list_children(&tree.id, None).await.unwrap();
    assert_eq!(roots.len(), 2);

    storage
        .move_subtree(&tree.id, &c1.id, Some(&r.id))
        .await
        .unwrap()
        .unwrap();
    let path = storage.get_path_to_root(&tree.id, &leaf.id).await.unwrap();
    assert_eq!(names(&path), vec!["R", "C1", "leaf"]);
    assert_healthy(&storage, &tree.id).await;
}

#[tokio::test]
async fn test_move_to_current_parent_is_a_no_op() {
    let (storage, _dir) = create_test_storage().await;
    let tree = create_test_tree(&storage).await;

    let r = storage.create_node(&tree.id, NewNode::new("R")).await.unwrap();
    let c = storage
        .create_node(&tree.id, NewNode::new("C").under(r.id))
        .await
        .unwrap();

    let before = storage.list_all_nodes(&tree.id).await.unwrap();
    let same = storage
        .move_subtree(&tree.id, &c.id, Some(&r.id))
        .await
        .unwrap()
        .unwrap();
    assert_eq!(same, c);
    assert_eq!(storage.list_all_nodes(&tree.id).await.unwrap(), before);
}

#[tokio::test]
async fn test_move_missing_references() {
    let (storage, _dir) = create_test_storage().await;
    let tree = create_test_tree(&storage).await;
    let r = storage.create_node(&tree.id, NewNode::new("R")).await.unwrap();

    let none = storage
        .move_subtree(&tree.id, &NodeId::new(), Some(&r.id))
        .await
        .unwrap();
    assert!(none.is_none());

    let ghost = NodeId::new();
    let err = storage
        .move_subtree(&tree.id, &r.id, Some(&ghost))
        .await
        .unwrap_err();
    assert!(matches!(err, GroveError::ParentNotFound(id) if id == ghost));
}

#[tokio::test]
async fn test_delete_subtree_closes_gap() {
    let (storage, _dir) = create_test_storage().await;
    let tree = create_test_tree(&storage).await;

    let r = storage.create_node(&tree.id, NewNode::new("R")).await.unwrap();
    let a = storage
        .create_node(&tree.id, NewNode::new("A").under(r.id))
        .await
        .unwrap();
    let a1 = storage
        .create_node(&tree.id, NewNode::new("A1").under(a.id))
        .await
        .unwrap();
    let b = storage
        .create_node(&tree.id, NewNode::new("B").under(r.id))
        .await
        .unwrap();
    storage
        .create_edge(
            &tree.id,
            NewEdge {
                source_id: a1.id,
                target_id: b.id,
                edge_type: "depends_on".to_string(),
                properties: Properties::new(),
            },
        )
        .await
        .unwrap();

    let removed = storage.delete_subtree(&tree.id, &a.id).await.unwrap();
    assert_eq!(removed, Some(2));

    assert!(storage.get_node(&tree.id, &a1.id).await.unwrap().is_none());
    let r = storage.get_node(&tree.id, &r.id).await.unwrap().unwrap();
    let b = storage.get_node(&tree.id, &b.id).await.unwrap().unwrap();
    assert_eq!(bounds(&r), (1, 4, 0));
    assert_eq!(bounds(&b), (2, 3, 1));
    assert!(storage.list_edges(&tree.id, None).await.unwrap().is_empty());
    assert_healthy(&storage, &tree.id).await;

    assert_eq!(storage.delete_subtree(&tree.id, &a.id).await.unwrap(), None);
}

#[tokio::test]
async fn test_delete_tree_cascades() {
    let (storage, _dir) = create_test_storage().await;
    let tree = create_test_tree(&storage).await;
    let r = storage.create_node(&tree.id, NewNode::new("R")).await.unwrap();

    assert!(storage.delete_tree(&tree.id).await.unwrap());
    assert!(storage.get_tree(&tree.id).await.unwrap().is_none());
    assert!(storage.get_node(&tree.id, &r.id).await.unwrap().is_none());
    assert!(!storage.delete_tree(&tree.id).await.unwrap());
}

#[tokio::test]
async fn test_concurrent_inserts_stay_consistent() {
    let (storage, _dir) = create_test_storage().await;
    let tree = create_test_tree(&storage).await;
    let r = storage.create_node(&tree.id, NewNode::new("R")).await.unwrap();

    let inserts = (0..12).map(|i| {
        storage.create_node(&tree.id, NewNode::new(format!("child-{}", i)).under(r.id))
    });
    for result in futures::future::join_all(inserts).await {
        result.unwrap();
    }

    let r = storage.get_node(&tree.id, &r.id).await.unwrap().unwrap();
    assert_eq!(bounds(&r), (1, 26, 0));
    assert_healthy(&storage, &tree.id).await;
}

// ============================================================================
// Updates and property queries
// ============================================================================

#[tokio::test]
async fn test_update_node_leaves_structure_alone() {
    let (storage, _dir) = create_test_storage().await;
    let tree = create_test_tree(&storage).await;
    let category = storage.create_category("docs", None).await.unwrap();

    let r = storage
        .create_node(&tree.id, NewNode::new("R").in_category(category.id))
        .await
        .unwrap();

    let patch = NodePatch {
        name: Some("Root".to_string()),
        position: Some(7),
        properties: Some(Properties::new().with("type", json!("page"))),
        category_id: Some(None),
    };
    let updated = storage
        .update_node(&tree.id, &r.id, patch)
        .await
        .unwrap()
        .unwrap();

    assert_eq!(updated.name, "Root");
    assert_eq!(updated.position, 7);
    assert_eq!(updated.properties.node_type(), Some("page"));
    assert_eq!(updated.category_id, None);
    assert_eq!(bounds(&updated), bounds(&r));

    let untouched = storage
        .update_node(&tree.id, &r.id, NodePatch::default())
        .await
        .unwrap()
        .unwrap();
    assert_eq!(untouched.name, "Root");

    let missing = storage
        .update_node(&tree.id, &NodeId::new(), NodePatch::default())
        .await
        .unwrap();
    assert!(missing.is_none());
}

#[tokio::test]
async fn test_list_by_type_and_property() {
    let (storage, _dir) = create_test_storage().await;
    let tree = create_test_tree(&storage).await;

    let page = |name: &str, props: serde_json::Value| {
        NewNode::new(name).with_properties(Properties::try_from(props).unwrap())
    };
    let r = storage
        .create_node(&tree.id, page("R", json!({"type": "folder"})))
        .await
        .unwrap();
    storage
        .create_node(
            &tree.id,
            page("a", json!({"type": "page", "tags": ["x", "y"]})).under(r.id),
        )
        .await
        .unwrap();
    storage
        .create_node(&tree.id, page("b", json!({"type": "page", "tags": ["y"]})).under(r.id))
        .await
        .unwrap();
    storage
        .create_node(&tree.id, page("c", json!({"meta": {"lang": "en", "v": 2}})).under(r.id))
        .await
        .unwrap();

    let pages = storage.list_by_type(&tree.id, "page").await.unwrap();
    assert_eq!(pages.iter().map(|n| n.name.as_str()).collect::<Vec<_>>(), vec!["a", "b"]);

    let tags = PropertyKey::new("tags").unwrap();
    let tagged_x = storage
        .list_by_property(&tree.id, &tags, &json!(["x"]))
        .await
        .unwrap();
    assert_eq!(tagged_x.len(), 1);
    assert_eq!(tagged_x[0].name, "a");

    let tagged_y = storage
        .list_by_property(&tree.id, &tags, &json!(["y"]))
        .await
        .unwrap();
    assert_eq!(tagged_y.len(), 2);

    let bare_y = storage.list_by_property(&tree.id, &tags, &json!("y")).await.unwrap();
    assert!(bare_y.is_empty());

    let meta = PropertyKey::new("meta").unwrap();
    let english = storage
        .list_by_property(&tree.id, &meta, &json!({"lang": "en"}))
        .await
        .unwrap();
    assert_eq!(english.len(), 1);
    assert_eq!(english[0].name, "c");
}

#[tokio::test]
async fn test_list_by_type_ignores_array_valued_type() {
    let (storage, _dir) = create_test_storage().await;
    let tree = create_test_tree(&storage).await;

    let tagged = Properties::try_from(json!({"type": ["page", "draft"]})).unwrap();
    storage
        .create_node(&tree.id, NewNode::new("several").with_properties(tagged))
        .await
        .unwrap();
    let plain = Properties::try_from(json!({"type": "page"})).unwrap();
    storage
        .create_node(&tree.id, NewNode::new("single").with_properties(plain))
        .await
        .unwrap();

    let pages = storage.list_by_type(&tree.id, "page").await.unwrap();
    assert_eq!(pages.iter().map(|n| n.name.as_str()).collect::<Vec<_>>(), vec!["single"]);

    let key = PropertyKey::new("type").unwrap();
    let drafts = storage
        .list_by_property(&tree.id, &key, &json!(["draft"]))
        .await
        .unwrap();
    assert_eq!(drafts.len(), 1);
    assert_eq!(drafts[0].name, "several");
}

// ============================================================================
// Counters
// ============================================================================

#[tokio::test]
async fn test_counter_created_at_delta_and_composes() {
    let (storage, _dir) = create_test_storage().await;
    let tree = create_test_tree(&storage).await;
    let props = Properties::try_from(json!({"title": "kept"})).unwrap();
    let r = storage
        .create_node(&tree.id, NewNode::new("R").with_properties(props))
        .await
        .unwrap();
    let views = PropertyKey::new("views").unwrap();

    let node = storage
        .increment_counter(&tree.id, &r.id, &views, 5)
        .await
        .unwrap()
        .unwrap();
    assert_eq!(node.properties.counter("views"), Some(5));
    assert_eq!(node.properties.get("title"), Some(&json!("kept")));

    let node = storage
        .increment_counter(&tree.id, &r.id, &views, -8)
        .await
        .unwrap()
        .unwrap();
    assert_eq!(node.properties.counter("views"), Some(-3));

    let other = PropertyKey::new("other").unwrap();
    storage
        .increment_counter(&tree.id, &r.id, &other, -3)
        .await
        .unwrap();
    let node = storage.get_node(&tree.id, &r.id).await.unwrap().unwrap();
    assert_eq!(node.properties.counter("views"), node.properties.counter("other"));
    assert_eq!(bounds(&node), bounds(&r));
}

#[tokio::test]
async fn test_counter_replaces_non_object_counters() {
    let (storage, _dir) = create_test_storage().await;
    let tree = create_test_tree(&storage).await;
    let props = Properties::try_from(json!({"counters": 3})).unwrap();
    let r = storage
        .create_node(&tree.id, NewNode::new("R").with_properties(props))
        .await
        .unwrap();

    let node = storage
        .increment_counter(&tree.id, &r.id, &PropertyKey::new("hits").unwrap(), 1)
        .await
        .unwrap()
        .unwrap();
    assert_eq!(node.properties.get("counters"), Some(&json!({"hits": 1})));
}

#[tokio::test]
async fn test_concurrent_increments_are_not_lost() {
    let (storage, _dir) = create_test_storage().await;
    let tree = create_test_tree(&storage).await;
    let r = storage.create_node(&tree.id, NewNode::new("R")).await.unwrap();
    let hits = PropertyKey::new("hits").unwrap();

    let bumps = (0..25).map(|_| storage.increment_counter(&tree.id, &r.id, &hits, 2));
    for result in futures::future::join_all(bumps).await {
        assert!(result.unwrap().is_some());
    }

    let node = storage.get_node(&tree.id, &r.id).await.unwrap().unwrap();
    assert_eq!(node.properties.counter("hits"), Some(50));
}

#[tokio::test]
async fn test_counter_on_missing_node_or_tree() {
    let (storage, _dir) = create_test_storage().await;
    let tree = create_test_tree(&storage).await;
    let r = storage.create_node(&tree.id, NewNode::new("R")).await.unwrap();
    let hits = PropertyKey::new("hits").unwrap();

    let missing = storage
        .increment_counter(&tree.id, &NodeId::new(), &hits, 1)
        .await
        .unwrap();
    assert!(missing.is_none());

    let wrong_tree = storage
        .increment_counter(&TreeId::new(), &r.id, &hits, 1)
        .await
        .unwrap();
    assert!(wrong_tree.is_none());
}

// ============================================================================
// Categories, edges, trees
// ============================================================================

#[tokio::test]
async fn test_category_hierarchy_rejects_cycles() {
    let (storage, _dir) = create_test_storage().await;

    let a = storage.create_category("a", None).await.unwrap();
    let b = storage.create_category("b", Some(&a.id)).await.unwrap();
    let c = storage.create_category("c", Some(&b.id)).await.unwrap();

    let err = storage
        .update_category(
            &a.id,
            CategoryPatch {
                parent_id: Some(Some(a.id)),
                ..Default::default()
            },
        )
        .await
        .unwrap_err();
    assert_eq!(err.to_string(), "A category cannot be its own parent.");

    let err = storage
        .update_category(
            &a.id,
            CategoryPatch {
                parent_id: Some(Some(c.id)),
                ..Default::default()
            },
        )
        .await
        .unwrap_err();
    assert!(matches!(err, GroveError::CategoryCycle(id) if id == c.id));
    assert_eq!(storage.get_category(&a.id).await.unwrap().unwrap().parent_id, None);

    let detached = storage
        .update_category(
            &c.id,
            CategoryPatch {
                name: Some("c2".to_string()),
                parent_id: Some(None),
            },
        )
        .await
        .unwrap()
        .unwrap();
    assert_eq!(detached.name, "c2");
    assert_eq!(detached.parent_id, None);

    assert!(storage.delete_category(&a.id).await.unwrap());
    let b = storage.get_category(&b.id).await.unwrap().unwrap();
    assert_eq!(b.parent_id, None);
    assert_eq!(storage.list_categories().await.unwrap().len(), 2);
}

#[tokio::test]
async fn test_category_missing_references() {
    let (storage, _dir) = create_test_storage().await;
    let ghost = CategoryId::new();

    let err = storage.create_category("x", Some(&ghost)).await.unwrap_err();
    assert!(matches!(err, GroveError::CategoryNotFound(id) if id == ghost));
    assert!(storage.list_categories().await.unwrap().is_empty());

    let none = storage
        .update_category(&ghost, CategoryPatch::default())
        .await
        .unwrap();
    assert!(none.is_none());
}

#[tokio::test]
async fn test_deleting_category_clears_node_reference() {
    let (storage, _dir) = create_test_storage().await;
    let tree = create_test_tree(&storage).await;
    let category = storage.create_category("docs", None).await.unwrap();
    let r = storage
        .create_node(&tree.id, NewNode::new("R").in_category(category.id))
        .await
        .unwrap();
    assert_eq!(r.category_id, Some(category.id));

    storage.delete_category(&category.id).await.unwrap();
    let r = storage.get_node(&tree.id, &r.id).await.unwrap().unwrap();
    assert_eq!(r.category_id, None);
}

#[tokio::test]
async fn test_edges() {
    let (storage, _dir) = create_test_storage().await;
    let tree = create_test_tree(&storage).await;
    let a = storage.create_node(&tree.id, NewNode::new("a")).await.unwrap();
    let b = storage.create_node(&tree.id, NewNode::new("b")).await.unwrap();
    let c = storage.create_node(&tree.id, NewNode::new("c")).await.unwrap();

    let link = |source_id, target_id| NewEdge {
        source_id,
        target_id,
        edge_type: "links".to_string(),
        properties: Properties::new(),
    };
    let ab = storage.create_edge(&tree.id, link(a.id, b.id)).await.unwrap();
    storage.create_edge(&tree.id, link(b.id, c.id)).await.unwrap();

    assert_eq!(storage.list_edges(&tree.id, None).await.unwrap().len(), 2);
    assert_eq!(storage.list_edges(&tree.id, Some(&b.id)).await.unwrap().len(), 2);
    assert_eq!(storage.list_edges(&tree.id, Some(&a.id)).await.unwrap(), vec![ab.clone()]);

    let ghost = NodeId::new();
    let err = storage
        .create_edge(&tree.id, link(a.id, ghost))
        .await
        .unwrap_err();
    assert!(matches!(err, GroveError::NodeNotFound(id) if id == ghost));

    let missing_tree = TreeId::new();
    let err = storage
        .create_edge(&missing_tree, link(a.id, b.id))
        .await
        .unwrap_err();
    assert!(matches!(err, GroveError::TreeNotFound(id) if id == missing_tree));
    assert_eq!(storage.list_edges(&tree.id, None).await.unwrap().len(), 2);

    assert!(storage.delete_edge(&tree.id, &ab.id).await.unwrap());
    assert!(!storage.delete_edge(&tree.id, &ab.id).await.unwrap());
}

#[tokio::test]
async fn test_tree_crud() {
    let (storage, _dir) = create_test_storage().await;
    let first = create_test_tree(&storage).await;
    create_test_tree(&storage).await;

    let renamed = storage
        .update_tree(
            &first.id,
            TreePatch {
                name: Some("renamed".to_string()),
                properties: None,
            },
        )
        .await
        .unwrap()
        .unwrap();
    assert_eq!(renamed.name, "renamed");

    let trees = storage.list_trees().await.unwrap();
    assert_eq!(trees.len(), 2);
    assert_eq!(trees[0].id, first.id);

    assert!(storage
        .update_tree(&TreeId::new(), TreePatch::default())
        .await
        .unwrap()
        .is_none());
}

// ============================================================================
// Repair
// ============================================================================

#[tokio::test]
async fn test_renumber_repairs_corrupt_intervals() {
    let (storage, _dir) = create_test_storage().await;
    let tree = create_test_tree(&storage).await;

    let r = storage.create_node(&tree.id, NewNode::new("R")).await.unwrap();
    let a = storage
        .create_node(&tree.id, NewNode::new("A").under(r.id).at(1))
        .await
        .unwrap();
    storage
        .create_node(&tree.id, NewNode::new("B").under(r.id).at(0))
        .await
        .unwrap();

    sqlx::query("UPDATE nodes SET lft = 100, depth = 5 WHERE id = ?")
        .bind(a.id.to_string())
        .execute(storage.pool())
        .await
        .unwrap();
    assert!(!storage.verify_tree(&tree.id).await.unwrap().is_empty());

    let count = storage.renumber_tree(&tree.id).await.unwrap();
    assert_eq!(count, Some(3));
    assert_healthy(&storage, &tree.id).await;

    // Position order wins over the old interval order.
    let subtree = storage
        .get_subtree(&tree.id, &r.id, SubtreeQuery::unbounded())
        .await
        .unwrap();
    assert_eq!(names(&subtree), vec!["R", "B", "A"]);

    assert_eq!(storage.renumber_tree(&TreeId::new()).await.unwrap(), None);
}

#[tokio::test]
async fn test_render_subtree() {
    let (storage, _dir) = create_test_storage().await;
    let tree = create_test_tree(&storage).await;
    let r = storage.create_node(&tree.id, NewNode::new("R")).await.unwrap();
    let c = storage
        .create_node(&tree.id, NewNode::new("C").under(r.id))
        .await
        .unwrap();
    storage
        .create_node(&tree.id, NewNode::new("D").under(c.id))
        .await
        .unwrap();

    let subtree = storage
        .get_subtree(&tree.id, &c.id, SubtreeQuery::unbounded())
        .await
        .unwrap();
    let nodes: Vec<Node> = subtree.into_iter().map(|e| e.node).collect();
    assert_eq!(render(&nodes), "└── C\n    └── D\n");
}

// ============================================================================
// Random operation sequences
// ============================================================================

#[derive(Debug, Clone)]
enum Op {
    Create(Option<Index>),
    Move(Index, Option<Index>),
    Delete(Index),
    Bump(Index, i64),
}

fn op() -> impl Strategy<Value = Op> {
    prop_oneof![
        4 => proptest::option::of(any::<Index>()).prop_map(Op::Create),
        3 => (any::<Index>(), proptest::option::of(any::<Index>()))
            .prop_map(|(node, parent)| Op::Move(node, parent)),
        1 => any::<Index>().prop_map(Op::Delete),
        1 => (any::<Index>(), -5i64..5).prop_map(|(node, delta)| Op::Bump(node, delta)),
    ]
}

/// Parent links and counter totals the database should agree with
#[derive(Default)]
struct Expected {
    ids: Vec<NodeId>,
    parents: HashMap<NodeId, Option<NodeId>>,
    hits: HashMap<NodeId, i64>,
}

impl Expected {
    fn pick(&self, index: &Index) -> Option<NodeId> {
        (!self.ids.is_empty()).then(|| self.ids[index.index(self.ids.len())])
    }

    fn is_within(&self, node: NodeId, root: NodeId) -> bool {
        let mut current = Some(node);
        while let Some(id) = current {
            if id == root {
                return true;
            }
            current = self.parents.get(&id).copied().flatten();
        }
        false
    }

    fn remove_subtree(&mut self, root: NodeId) -> usize {
        let doomed: Vec<NodeId> = self
            .ids
            .iter()
            .copied()
            .filter(|id| self.is_within(*id, root))
            .collect();
        self.ids.retain(|id| !doomed.contains(id));
        for id in &doomed {
            self.parents.remove(id);
            self.hits.remove(id);
        }
        doomed.len()
    }
}

async fn run_ops(ops: Vec<Op>) {
    let (storage, _dir) = create_test_storage().await;
    let tree = create_test_tree(&storage).await;
    let hits = PropertyKey::new("hits").unwrap();
    let mut expected = Expected::default();

    for op in ops {
        match op {
            Op::Create(parent) => {
                let parent = parent.and_then(|p| expected.pick(&p));
                let mut input = NewNode::new("n");
                input.parent_id = parent;
                let node = storage.create_node(&tree.id, input).await.unwrap();
                expected.ids.push(node.id);
                expected.parents.insert(node.id, parent);
            }
            Op::Move(node, parent) => {
                let Some(node) = expected.pick(&node) else { continue };
                let parent = parent.and_then(|p| expected.pick(&p));
                let result = storage.move_subtree(&tree.id, &node, parent.as_ref()).await;
                match parent {
                    Some(p) if expected.is_within(p, node) => {
                        assert!(matches!(result, Err(GroveError::Cycle)));
                    }
                    _ => {
                        assert!(result.unwrap().is_some());
                        expected.parents.insert(node, parent);
                    }
                }
            }
            Op::Delete(node) => {
                let Some(node) = expected.pick(&node) else { continue };
                let removed = storage.delete_subtree(&tree.id, &node).await.unwrap();
                assert_eq!(removed, Some(expected.remove_subtree(node) as u64));
            }
            Op::Bump(node, delta) => {
                let Some(node) = expected.pick(&node) else { continue };
                storage
                    .increment_counter(&tree.id, &node, &hits, delta)
                    .await
                    .unwrap();
                *expected.hits.entry(node).or_default() += delta;
            }
        }

        assert_healthy(&storage, &tree.id).await;
    }

    let nodes = storage.list_all_nodes(&tree.id).await.unwrap();
    assert_eq!(nodes.len(), expected.ids.len());
    for node in &nodes {
        assert_eq!(expected.parents.get(&node.id), Some(&node.parent_id));
        assert_eq!(node.properties.counter("hits"), expected.hits.get(&node.id).copied());

        let path = storage.get_path_to_root(&tree.id, &node.id).await.unwrap();
        assert_eq!(path.len() as i64, node.depth + 1);
        assert_eq!(path.last().map(|e| e.node.id), Some(node.id));
    }
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(16))]

    #[test]
    fn prop_random_operations_keep_intervals_valid(ops in prop::collection::vec(op(), 1..30)) {
        let runtime = tokio::runtime::Builder::new_current_thread()
            .enable_all()
            .build()
            .unwrap();
        runtime.block_on(run_ops(ops));
    }
}
