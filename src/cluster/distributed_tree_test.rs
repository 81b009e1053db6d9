use bytes::Bytes;

use super::*;

#[test]
fn test_children_are_listed_in_creation_order() {
    let tree = MemTree::new();
    for name in ["9", "1", "5"] {
        assert!(tree
            .create(&format!("/grid/nodes/{name}"), Bytes::new(), None)
            .unwrap());
    }
    tree.create("/grid/nodes/1/3", Bytes::new(), None).unwrap();

    assert_eq!(tree.children("/grid/nodes").unwrap(), vec!["9", "1", "5"]);
    assert_eq!(tree.children("/grid/nodes/1").unwrap(), vec!["3"]);
    assert!(tree.exists("/grid").unwrap());
}

#[test]
fn test_create_existing_path_returns_false() {
    let tree = MemTree::new();
    assert!(tree.create("/a/b", Bytes::from_static(b"x"), None).unwrap());
    assert!(!tree.create("/a/b", Bytes::from_static(b"y"), None).unwrap());
    assert_eq!(tree.get("/a/b").unwrap(), Some(Bytes::from_static(b"x")));

    tree.set("/a/b", Bytes::from_static(b"z")).unwrap();
    assert_eq!(tree.get("/a/b/").unwrap(), Some(Bytes::from_static(b"z")));
}

#[test]
fn test_ephemeral_nodes_vanish_on_disconnect() {
    let tree = MemTree::new();
    let mut events = tree.subscribe();
    tree.create("/grid/nodes/1/1", Bytes::new(), Some("s1".into())).unwrap();
    tree.create("/grid/nodes/1/2", Bytes::new(), Some("s2".into())).unwrap();
    tree.create("/grid/props/1", Bytes::new(), None).unwrap();

    let removed = tree.disconnect("s1").unwrap();

    assert_eq!(removed, vec!["/grid/nodes/1/1".to_string()]);
    assert_eq!(tree.children("/grid/nodes/1").unwrap(), vec!["2"]);
    assert!(tree.exists("/grid/props/1").unwrap());

    let mut deleted = Vec::new();
    while let Ok(ev) = events.try_recv() {
        if let TreeEvent::Deleted(p) = ev {
            deleted.push(p);
        }
    }
    assert_eq!(deleted, vec!["/grid/nodes/1/1".to_string()]);
}

#[test]
fn test_delete_removes_subtree_only() {
    let tree = MemTree::new();
    tree.create("/x/y/z", Bytes::new(), None).unwrap();
    tree.create("/x/yy", Bytes::new(), None).unwrap();

    assert!(tree.delete("/x/y").unwrap());
    assert!(!tree.exists("/x/y/z").unwrap());
    assert!(tree.exists("/x/yy").unwrap());
    assert!(!tree.delete("/x/y").unwrap());
}
