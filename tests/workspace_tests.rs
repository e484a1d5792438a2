//! Workspace reconciliation behavior.

mod common;

use autoprop::vcs::MemoryVcs;
use autoprop::workspace::Workspace;
use common::{derived_at, origin_with_history, primary};
use std::collections::HashMap;
use std::sync::Arc;

#[tokio::test]
async fn test_fresh_workspace_tracks_main() {
    let vcs = MemoryVcs::new();
    let (origin, r1) = origin_with_history(&vcs, "mem://origin");

    let ws = Workspace::builder()
        .main_branch(primary(&origin))
        .build(Arc::new(vcs))
        .await
        .unwrap();

    assert_eq!(ws.base_revid(), &r1);
    assert!(!ws.refreshed());
    assert!(ws.resume_branch().is_none());
    assert!(!ws.any_branch_changes().await.unwrap());
    assert!(!ws.changes_since_base().await.unwrap());
}

#[tokio::test]
async fn test_local_commit_counts_as_change() {
    let vcs = MemoryVcs::new();
    let (origin, _) = origin_with_history(&vcs, "mem://origin");

    let ws = Workspace::builder()
        .main_branch(primary(&origin))
        .build(Arc::new(vcs))
        .await
        .unwrap();

    ws.local_tree()
        .put_file("src/lib.rs", "pub fn answer() -> u8 { 42 }\n")
        .await
        .unwrap();
    ws.local_tree().commit("add answer").await.unwrap();

    assert!(ws.changes_since_base().await.unwrap());
    assert!(ws.changes_since_main().await.unwrap());
    assert!(ws.any_branch_changes().await.unwrap());
}

#[tokio::test]
async fn test_resume_branch_kept_when_still_ahead_of_main() {
    let vcs = MemoryVcs::new();
    let (origin, r1) = origin_with_history(&vcs, "mem://origin");
    let derived = derived_at(&vcs, &origin, "mem://derived", &r1).await;
    let r2 = derived.commit_on("", "earlier run", &[("fix.txt", Some("done\n"))]);

    let ws = Workspace::builder()
        .main_branch(primary(&origin))
        .resume_branch(primary(&derived))
        .build(Arc::new(vcs))
        .await
        .unwrap();

    assert_eq!(ws.base_revid(), &r2);
    assert!(!ws.refreshed());
    assert!(ws.resume_branch().is_some());
    // The earlier run's commits already count as publishable changes.
    assert!(ws.any_branch_changes().await.unwrap());
    assert!(!ws.changes_since_base().await.unwrap());
}

#[tokio::test]
async fn test_diverged_resume_branch_is_discarded() {
    let vcs = MemoryVcs::new();
    let (origin, r1) = origin_with_history(&vcs, "mem://origin");
    let derived = derived_at(&vcs, &origin, "mem://derived", &r1).await;
    derived.commit_on("", "earlier run", &[("fix.txt", Some("done\n"))]);
    // Main moves on without the earlier run's commit.
    let r3 = origin.commit_on("", "upstream work", &[("upstream.txt", Some("u\n"))]);

    let ws = Workspace::builder()
        .main_branch(primary(&origin))
        .resume_branch(primary(&derived))
        .build(Arc::new(vcs))
        .await
        .unwrap();

    assert!(ws.refreshed());
    assert!(ws.resume_branch().is_none());
    assert_eq!(ws.base_revid(), &r3);
    assert!(!ws.any_branch_changes().await.unwrap());
    let tree = ws.local_tree().basis_tree().await.unwrap();
    assert!(tree.get("upstream.txt").is_some());
    assert!(tree.get("fix.txt").is_none());
}

#[tokio::test]
async fn test_resume_colocated_branches_override_main() {
    let vcs = MemoryVcs::new();
    let (origin, r1) = origin_with_history(&vcs, "mem://origin");
    let m1 = origin.commit_on("meta", "main metadata", &[("meta.json", Some("{}\n"))]);
    let derived = derived_at(&vcs, &origin, "mem://derived", &r1).await;
    let m2 = derived.commit_on("meta", "run metadata", &[("meta.json", Some("{\"run\":1}\n"))]);

    let mapping = HashMap::from([("meta".to_string(), "meta".to_string())]);
    let ws = Workspace::builder()
        .main_branch(primary(&origin))
        .resume_branch(primary(&derived))
        .additional_colocated_branches(mapping.clone())
        .resume_branch_additional_colocated_branches(mapping)
        .build(Arc::new(vcs))
        .await
        .unwrap();

    assert_eq!(
        ws.local_tree().colocated_tip("meta").await.unwrap(),
        Some(m2)
    );
    assert_eq!(ws.main_colo_revid().get("meta"), Some(&m1));
    // The colocated branch alone makes the run publishable.
    assert!(ws.any_branch_changes().await.unwrap());
}

#[tokio::test]
async fn test_colocated_branches_follow_main_without_resume() {
    let vcs = MemoryVcs::new();
    let (origin, _) = origin_with_history(&vcs, "mem://origin");
    let m1 = origin.commit_on("meta", "main metadata", &[("meta.json", Some("{}\n"))]);

    let mapping = HashMap::from([("meta".to_string(), "meta".to_string())]);
    let ws = Workspace::builder()
        .main_branch(primary(&origin))
        .additional_colocated_branches(mapping)
        .build(Arc::new(vcs))
        .await
        .unwrap();

    assert_eq!(
        ws.local_tree().colocated_tip("meta").await.unwrap(),
        Some(m1)
    );
    assert!(!ws.any_branch_changes().await.unwrap());
}

#[tokio::test]
async fn test_main_tip_is_fixed_at_reconciliation() {
    let vcs = MemoryVcs::new();
    let (origin, r1) = origin_with_history(&vcs, "mem://origin");

    let ws = Workspace::builder()
        .main_branch(primary(&origin))
        .build(Arc::new(vcs))
        .await
        .unwrap();
    // Main advances after reconciliation; the baseline must not move with
    // it, or an unchanged workspace would look publishable.
    origin.commit_on("", "upstream work", &[("upstream.txt", Some("u\n"))]);

    assert_eq!(ws.main_branch_revid(), Some(&r1));
    assert!(!ws.changes_since_main().await.unwrap());
    assert!(!ws.any_branch_changes().await.unwrap());
    let branches = ws.changed_branches().await.unwrap();
    assert_eq!(branches[0].1, Some(r1));
}

#[tokio::test]
async fn test_changed_branches_lists_primary_first() {
    let vcs = MemoryVcs::new();
    let (origin, r1) = origin_with_history(&vcs, "mem://origin");

    let ws = Workspace::builder()
        .main_branch(primary(&origin))
        .build(Arc::new(vcs))
        .await
        .unwrap();
    ws.local_tree().put_file("x", "1\n").await.unwrap();
    let tip = ws.local_tree().commit("change").await.unwrap();

    let branches = ws.changed_branches().await.unwrap();
    assert_eq!(branches.len(), 1);
    assert_eq!(branches[0].0, "");
    assert_eq!(branches[0].1, Some(r1));
    assert_eq!(branches[0].2, Some(tip));
}

#[tokio::test]
async fn test_show_diff_reports_new_content() {
    let vcs = MemoryVcs::new();
    let (origin, _) = origin_with_history(&vcs, "mem://origin");

    let ws = Workspace::builder()
        .main_branch(primary(&origin))
        .build(Arc::new(vcs))
        .await
        .unwrap();
    ws.local_tree()
        .put_file("notes.txt", "a line\n")
        .await
        .unwrap();
    ws.local_tree().commit("add notes").await.unwrap();

    let mut out = Vec::new();
    ws.show_diff(&mut out, None, None).await.unwrap();
    let text = String::from_utf8(out).unwrap();
    assert!(text.contains("notes.txt"));
    assert!(text.contains("+a line"));
}
