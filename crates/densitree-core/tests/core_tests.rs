use std::path::PathBuf;

use densitree_core::{
    ExcludeRule, ExcludeRules, Node, PatternSyntax, PkgMeta, ReadState, Settings, Tree, TreeEvent,
};

fn build_tree() -> (Tree, densitree_core::NodeId, densitree_core::NodeId) {
    let mut tree = Tree::new();
    let top = tree.insert_child(
        tree.root(),
        Node::dir("/data").with_stat(4096, 1_700_000_000, 0o40755, 0, 0, 10, 2, 3),
    );
    let sub = tree.insert_child(
        top,
        Node::dir("projects").with_stat(4096, 1_700_000_100, 0o40755, 1000, 1000, 10, 17, 2),
    );
    tree.insert_child(
        sub,
        Node::file("report.pdf").with_stat(250_000, 1_700_000_200, 0o100644, 1000, 1000, 10, 18, 1),
    );
    (tree, top, sub)
}

#[test]
fn test_tree_construction_and_metadata() {
    let (tree, top, sub) = build_tree();

    assert_eq!(tree.node_count(), 4);
    assert!(tree.is_top_level(top));
    assert_eq!(tree.url_of(sub), PathBuf::from("/data/projects"));

    let report = tree.find_child(sub, "report.pdf").unwrap();
    let node = tree.node(report).unwrap();
    assert_eq!(node.size, 250_000);
    assert_eq!(node.uid, 1000);
    assert_eq!(node.mode, 0o100644);
    assert_eq!(node.links, 1);
    assert_eq!(tree.url_of(report), PathBuf::from("/data/projects/report.pdf"));
}

#[test]
fn test_subtree_aggregates() {
    let (mut tree, top, sub) = build_tree();
    tree.insert_child(
        sub,
        Node::file("notes.txt").with_stat(1_000, 0, 0o100644, 1000, 1000, 10, 19, 1),
    );

    assert_eq!(tree.total_size(top), 4096 + 4096 + 250_000 + 1_000);
    assert_eq!(tree.total_files(top), 2);
    assert_eq!(tree.total_subdirs(top), 1);
    assert_eq!(tree.total_items(top), 3);
}

#[test]
fn test_pending_jobs_keep_ancestors_busy() {
    let (mut tree, top, sub) = build_tree();
    tree.set_read_state(top, ReadState::Finished);
    tree.set_read_state(sub, ReadState::Finished);
    assert!(!tree.is_busy(top));

    tree.read_job_added(sub);
    assert!(tree.is_busy(sub));
    assert!(tree.is_busy(top));
    assert_eq!(tree.pending_read_jobs(tree.root()), 1);

    tree.read_job_finished(sub);
    assert!(!tree.is_busy(top));
}

#[test]
fn test_events_on_insert_and_delete() {
    let mut tree = Tree::new();
    let events = tree.subscribe();

    let top = tree.insert_child(tree.root(), Node::dir("/data"));
    let doomed = tree.insert_child(top, Node::dir("tmp"));
    tree.delete_subtree(doomed);

    let collected: Vec<TreeEvent> = events.try_iter().collect();
    assert_eq!(
        collected,
        vec![
            TreeEvent::ChildAdded(top),
            TreeEvent::ChildAdded(doomed),
            TreeEvent::DeletingChild(doomed),
        ]
    );
}

#[test]
fn test_pkg_nodes_are_directories_with_meta() {
    let mut tree = Tree::new();
    let pkg_root = tree.insert_child(tree.root(), Node::dir("Pkg:"));
    let pkg = tree.insert_child(
        pkg_root,
        Node::pkg(
            "coreutils",
            PkgMeta {
                base_name: "coreutils".into(),
                version: "9.4".into(),
                arch: "amd64".into(),
                multi_version: false,
                multi_arch: false,
            },
        ),
    );

    let node = tree.node(pkg).unwrap();
    assert!(node.is_dir());
    assert!(node.is_pkg());
    assert_eq!(node.pkg_meta().unwrap().version, "9.4");
    assert_eq!(tree.url_of(pkg), PathBuf::from("Pkg:/coreutils"));

    let file = tree.insert_child(pkg, Node::file("usr"));
    assert_eq!(tree.children(pkg), &[file]);
}

#[test]
fn test_clear_subtree_keeps_the_dir() {
    let (mut tree, _, sub) = build_tree();
    tree.clear_subtree(sub);
    assert!(tree.node(sub).is_some());
    assert_eq!(tree.children(sub).len(), 0);
}

#[test]
fn test_aborted_is_sticky_against_finished() {
    let (mut tree, top, sub) = build_tree();
    tree.read_job_aborted(sub);
    tree.set_read_state(sub, ReadState::Finished);
    assert_eq!(tree.read_state(sub), Some(ReadState::Aborted));
    assert_eq!(tree.read_state(top), Some(ReadState::Aborted));
}

#[test]
fn test_exclude_rules_surfaces_work_together() {
    let rules = ExcludeRules::new(vec![
        ExcludeRule::new("/data/projects/*", PatternSyntax::Wildcard)
            .unwrap()
            .with_full_path(true),
        ExcludeRule::new("*.o", PatternSyntax::Wildcard)
            .unwrap()
            .with_check_any_file_child(true),
    ]);

    assert!(rules.match_path("/data/projects/old", "old"));
    assert!(!rules.match_path("/data/docs/old", "old"));
    assert!(rules.match_direct_children(&["main.c", "main.o"]));
    assert!(!rules.match_direct_children(&["main.c", "main.rs"]));
}

#[test]
fn test_settings_persist_under_config_dir_layout() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("densitree").join("settings.toml");

    let mut settings = Settings::load(&path).unwrap();
    assert_eq!(settings.pkg.max_parallel_processes, 6);

    settings.pkg.max_parallel_processes = 12;
    settings.save(&path).unwrap();

    let reloaded = Settings::load(&path).unwrap();
    assert_eq!(reloaded.pkg.max_parallel_processes, 12);
}
