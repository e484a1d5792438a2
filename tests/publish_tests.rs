//! Publish engine behavior against the in-memory backend and mock forge.

mod common;

use autoprop::error::Error;
use autoprop::forge::MergeProposal;
use autoprop::publish::{
    check_proposal_diff_empty, find_existing_proposed, PublishRequest, StaticContent,
};
use autoprop::types::Mode;
use autoprop::vcs::{Branch, MemoryVcs};
use autoprop::workspace::Workspace;
use common::mock_forge::MockForge;
use common::{derived_at, origin_with_history, primary};
use std::sync::Arc;

fn content(description: &str) -> StaticContent {
    StaticContent {
        description: description.to_string(),
        ..StaticContent::default()
    }
}

#[tokio::test]
async fn test_push_mode_updates_main_branch() {
    let vcs = MemoryVcs::new();
    let (origin, _) = origin_with_history(&vcs, "mem://origin");

    let ws = Workspace::builder()
        .main_branch(primary(&origin))
        .build(Arc::new(vcs.clone()))
        .await
        .unwrap();
    ws.local_tree().put_file("fix.txt", "done\n").await.unwrap();
    let tip = ws.local_tree().commit("apply fix").await.unwrap();

    let forge = Arc::new(MockForge::new(vcs));
    let request = PublishRequest::new(Mode::Push, "fix");
    let result = ws
        .publish_changes(None, Some(forge), &content("Apply fix."), &request)
        .await
        .unwrap();

    assert_eq!(result.mode, Mode::Push);
    assert!(result.proposal.is_none());
    assert_eq!(origin.branch("").last_revision().await.unwrap(), tip);
}

#[tokio::test]
async fn test_push_refuses_diverged_target() {
    let vcs = MemoryVcs::new();
    let (origin, _) = origin_with_history(&vcs, "mem://origin");

    let ws = Workspace::builder()
        .main_branch(primary(&origin))
        .build(Arc::new(vcs.clone()))
        .await
        .unwrap();
    ws.local_tree().put_file("fix.txt", "done\n").await.unwrap();
    ws.local_tree().commit("apply fix").await.unwrap();
    // The target grows unrelated history after reconciliation.
    origin.commit_on("", "upstream work", &[("upstream.txt", Some("u\n"))]);

    let forge = Arc::new(MockForge::new(vcs));
    let request = PublishRequest::new(Mode::Push, "fix");
    let err = ws
        .publish_changes(None, Some(forge), &content("Apply fix."), &request)
        .await
        .unwrap_err();
    assert!(matches!(err, Error::Diverged));
}

#[tokio::test]
async fn test_attempt_push_falls_back_to_propose() {
    let vcs = MemoryVcs::new();
    let (origin, _) = origin_with_history(&vcs, "mem://origin");

    let ws = Workspace::builder()
        .main_branch(primary(&origin))
        .build(Arc::new(vcs.clone()))
        .await
        .unwrap();
    ws.local_tree().put_file("fix.txt", "done\n").await.unwrap();
    ws.local_tree().commit("apply fix").await.unwrap();

    let forge = Arc::new(MockForge::new(vcs.clone()));
    forge.deny_push();
    let request = PublishRequest::new(Mode::AttemptPush, "fix");
    let result = ws
        .publish_changes(
            None,
            Some(forge.clone()),
            &content("Apply fix."),
            &request,
        )
        .await
        .unwrap();

    assert_eq!(result.mode, Mode::Propose);
    assert_eq!(result.is_new, Some(true));
    assert!(result.proposal.is_some());
    assert_eq!(forge.create_calls().len(), 1);
    // The derived branch was materialized on the forge.
    assert!(vcs.get_repo(&forge.derived_url("fix", None)).is_some());
}

#[tokio::test]
async fn test_propose_creates_proposal_with_metadata() {
    let vcs = MemoryVcs::new();
    let (origin, _) = origin_with_history(&vcs, "mem://origin");

    let ws = Workspace::builder()
        .main_branch(primary(&origin))
        .build(Arc::new(vcs.clone()))
        .await
        .unwrap();
    ws.local_tree().put_file("fix.txt", "done\n").await.unwrap();
    ws.local_tree().commit("apply fix").await.unwrap();

    let forge = Arc::new(MockForge::new(vcs));
    let mut request = PublishRequest::new(Mode::Propose, "fix");
    request.labels = vec!["automated".to_string()];
    request.reviewers = vec!["alice".to_string()];
    let result = ws
        .publish_changes(
            None,
            Some(forge.clone()),
            &content("Fix the thing.\n\nLonger explanation."),
            &request,
        )
        .await
        .unwrap();

    assert_eq!(result.is_new, Some(true));
    let calls = forge.create_calls();
    assert_eq!(calls.len(), 1);
    assert_eq!(calls[0].labels, vec!["automated".to_string()]);
    assert_eq!(calls[0].reviewers, vec!["alice".to_string()]);
    // The title falls out of the description's first line.
    assert_eq!(calls[0].title.as_deref(), Some("Fix the thing"));
}

#[tokio::test]
async fn test_propose_without_create_permission_fails() {
    let vcs = MemoryVcs::new();
    let (origin, _) = origin_with_history(&vcs, "mem://origin");

    let ws = Workspace::builder()
        .main_branch(primary(&origin))
        .build(Arc::new(vcs.clone()))
        .await
        .unwrap();
    ws.local_tree().put_file("fix.txt", "done\n").await.unwrap();
    ws.local_tree().commit("apply fix").await.unwrap();

    let forge = Arc::new(MockForge::new(vcs));
    let mut request = PublishRequest::new(Mode::Propose, "fix");
    request.allow_create_proposal = false;
    let err = ws
        .publish_changes(None, Some(forge), &content("Apply fix."), &request)
        .await
        .unwrap_err();
    assert!(matches!(err, Error::InsufficientChangesForNewProposal));
}

#[tokio::test]
async fn test_resumed_propose_updates_without_creating() {
    let vcs = MemoryVcs::new();
    let (origin, r1) = origin_with_history(&vcs, "mem://origin");
    let forge = Arc::new(MockForge::new(vcs.clone()));

    // An earlier run left a derived branch and an open proposal behind.
    let derived_url = forge.derived_url("fix", None);
    let derived = derived_at(&vcs, &origin, derived_url.as_str(), &r1).await;
    derived.commit_on("", "earlier run", &[("fix.txt", Some("done\n"))]);
    let proposal = forge.add_open_proposal(&derived_url, origin.url(), "Apply fix.");

    let (resume, _, _) = find_existing_proposed(
        primary(&origin).as_ref(),
        forge.as_ref(),
        "fix",
        false,
        None,
    )
    .await
    .unwrap();
    let resume = resume.expect("derived branch found");

    let ws = Workspace::builder()
        .main_branch(primary(&origin))
        .resume_branch(resume)
        .build(Arc::new(vcs))
        .await
        .unwrap();

    let mut request = PublishRequest::new(Mode::Propose, "fix");
    request.overwrite_existing = false;
    request.existing_proposal = Some(proposal.clone());
    let result = ws
        .publish_changes(
            None,
            Some(forge.clone()),
            &content("Apply fix."),
            &request,
        )
        .await
        .unwrap();

    assert_eq!(result.is_new, Some(false));
    assert!(forge.create_calls().is_empty());
    // Text that matches the forge's copy is never re-sent.
    assert_eq!(
        proposal
            .set_description_calls
            .load(std::sync::atomic::Ordering::SeqCst),
        0
    );
}

#[tokio::test]
async fn test_republish_without_new_commits_is_noop() {
    let vcs = MemoryVcs::new();
    let (origin, _) = origin_with_history(&vcs, "mem://origin");

    let ws = Workspace::builder()
        .main_branch(primary(&origin))
        .build(Arc::new(vcs.clone()))
        .await
        .unwrap();
    ws.local_tree().put_file("fix.txt", "done\n").await.unwrap();
    ws.local_tree().commit("apply fix").await.unwrap();

    let forge = Arc::new(MockForge::new(vcs));
    let request = PublishRequest::new(Mode::Propose, "fix");
    let first = ws
        .publish_changes(
            None,
            Some(forge.clone()),
            &content("Apply fix."),
            &request,
        )
        .await
        .unwrap();
    assert_eq!(first.is_new, Some(true));

    // Publishing again with nothing new must update, not duplicate.
    let mut request = PublishRequest::new(Mode::Propose, "fix");
    request.overwrite_existing = false;
    request.existing_proposal = first.proposal.clone();
    let second = ws
        .publish_changes(
            None,
            Some(forge.clone()),
            &content("Apply fix."),
            &request,
        )
        .await
        .unwrap();

    assert_eq!(second.is_new, Some(false));
    assert_eq!(
        second.proposal.as_ref().unwrap().url(),
        first.proposal.as_ref().unwrap().url()
    );
    assert_eq!(forge.create_calls().len(), 1);
    let proposals = forge.proposals();
    assert_eq!(proposals.len(), 1);
    // Unchanged text is never re-sent.
    assert_eq!(
        proposals[0]
            .set_description_calls
            .load(std::sync::atomic::Ordering::SeqCst),
        0
    );
    assert_eq!(
        proposals[0]
            .set_title_calls
            .load(std::sync::atomic::Ordering::SeqCst),
        0
    );
}

#[tokio::test]
async fn test_resumed_proposal_keeps_text_the_renderer_omits() {
    let vcs = MemoryVcs::new();
    let (origin, r1) = origin_with_history(&vcs, "mem://origin");
    let forge = Arc::new(MockForge::new(vcs.clone()));

    let derived_url = forge.derived_url("fix", None);
    let derived = derived_at(&vcs, &origin, derived_url.as_str(), &r1).await;
    derived.commit_on("", "earlier run", &[("fix.txt", Some("done\n"))]);
    let proposal = forge.add_open_proposal(&derived_url, origin.url(), "Old body.");
    proposal.state.lock().unwrap().commit_message = Some("hand-written message".to_string());

    let ws = Workspace::builder()
        .main_branch(primary(&origin))
        .resume_branch(Arc::new(derived.branch("")))
        .build(Arc::new(vcs))
        .await
        .unwrap();

    let mut request = PublishRequest::new(Mode::Propose, "fix");
    request.overwrite_existing = false;
    request.existing_proposal = Some(proposal.clone());
    // The new content carries no commit message of its own.
    ws.publish_changes(
        None,
        Some(forge.clone()),
        &content("Apply fix."),
        &request,
    )
    .await
    .unwrap();

    // The proposal's message survives; the differing body is replaced.
    assert_eq!(
        proposal.state.lock().unwrap().commit_message.as_deref(),
        Some("hand-written message")
    );
    assert_eq!(
        proposal.state.lock().unwrap().description.as_deref(),
        Some("Apply fix.")
    );
}

#[tokio::test]
async fn test_stale_proposal_closed_when_target_catches_up() {
    let vcs = MemoryVcs::new();
    let (origin, _) = origin_with_history(&vcs, "mem://origin");
    let forge = Arc::new(MockForge::new(vcs.clone()));
    let proposal = forge.add_open_proposal(
        &forge.derived_url("fix", None),
        origin.url(),
        "Apply fix.",
    );

    // The workspace ends up exactly at the main tip: nothing to publish.
    let ws = Workspace::builder()
        .main_branch(primary(&origin))
        .build(Arc::new(vcs))
        .await
        .unwrap();

    let mut request = PublishRequest::new(Mode::Propose, "fix");
    request.existing_proposal = Some(proposal.clone());
    let result = ws
        .publish_changes(None, Some(forge), &content("Apply fix."), &request)
        .await
        .unwrap();

    assert_eq!(result.is_new, Some(false));
    assert_eq!(
        proposal
            .close_calls
            .load(std::sync::atomic::Ordering::SeqCst),
        1
    );
    assert!(proposal.is_closed().await.unwrap());
}

#[tokio::test]
async fn test_empty_proposal_refused() {
    let vcs = MemoryVcs::new();
    let (origin, _) = origin_with_history(&vcs, "mem://origin");

    let ws = Workspace::builder()
        .main_branch(primary(&origin))
        .build(Arc::new(vcs.clone()))
        .await
        .unwrap();
    // Main gains the very same content the run is about to commit.
    origin.commit_on("", "upstream fix", &[("fix.txt", Some("done\n"))]);
    ws.local_tree().put_file("fix.txt", "done\n").await.unwrap();
    ws.local_tree().commit("apply fix").await.unwrap();

    let forge = Arc::new(MockForge::new(vcs));
    let request = PublishRequest::new(Mode::Propose, "fix");
    let err = ws
        .publish_changes(None, Some(forge), &content("Apply fix."), &request)
        .await
        .unwrap_err();
    assert!(matches!(err, Error::EmptyMergeProposal));
}

#[tokio::test]
async fn test_unrelated_histories_count_as_changes() {
    let vcs = MemoryVcs::new();
    let (origin, _) = origin_with_history(&vcs, "mem://origin");
    let other = vcs.create_repo("mem://other");
    other.commit_on("", "independent", &[("other.txt", Some("o\n"))]);

    let empty = check_proposal_diff_empty(
        primary(&other).as_ref(),
        primary(&origin).as_ref(),
        None,
    )
    .await
    .unwrap();
    assert!(!empty);
}

#[tokio::test]
async fn test_reopen_failure_falls_through_to_create() {
    let vcs = MemoryVcs::new();
    let (origin, r1) = origin_with_history(&vcs, "mem://origin");
    let forge = Arc::new(MockForge::new(vcs.clone()));

    let derived_url = forge.derived_url("fix", None);
    let derived = derived_at(&vcs, &origin, derived_url.as_str(), &r1).await;
    derived.commit_on("", "earlier run", &[("fix.txt", Some("done\n"))]);
    let proposal = forge.add_open_proposal(&derived_url, origin.url(), "Apply fix.");
    proposal.force_closed();
    proposal.fail_reopen();

    let ws = Workspace::builder()
        .main_branch(primary(&origin))
        .resume_branch(Arc::new(derived.branch("")))
        .build(Arc::new(vcs))
        .await
        .unwrap();

    let mut request = PublishRequest::new(Mode::Propose, "fix");
    request.overwrite_existing = false;
    request.existing_proposal = Some(proposal.clone());
    let result = ws
        .publish_changes(
            None,
            Some(forge.clone()),
            &content("Apply fix."),
            &request,
        )
        .await
        .unwrap();

    assert_eq!(result.is_new, Some(true));
    assert_eq!(forge.create_calls().len(), 1);
    assert_eq!(
        proposal
            .reopen_calls
            .load(std::sync::atomic::Ordering::SeqCst),
        1
    );
}

#[tokio::test]
async fn test_existing_proposal_adopted_on_conflict() {
    let vcs = MemoryVcs::new();
    let (origin, _) = origin_with_history(&vcs, "mem://origin");
    let forge = Arc::new(MockForge::new(vcs.clone()));
    // A concurrent run already opened a proposal for this branch pair.
    let adopted = forge.add_open_proposal(
        &forge.derived_url("fix", None),
        origin.url(),
        "Apply fix.",
    );

    let ws = Workspace::builder()
        .main_branch(primary(&origin))
        .build(Arc::new(vcs))
        .await
        .unwrap();
    ws.local_tree().put_file("fix.txt", "done\n").await.unwrap();
    ws.local_tree().commit("apply fix").await.unwrap();

    let request = PublishRequest::new(Mode::Propose, "fix");
    let result = ws
        .publish_changes(
            None,
            Some(forge.clone()),
            &content("Apply fix."),
            &request,
        )
        .await
        .unwrap();

    assert_eq!(result.is_new, Some(false));
    assert_eq!(result.proposal.unwrap().url(), adopted.url());
}

#[tokio::test]
async fn test_find_existing_proposed_absent_branch() {
    let vcs = MemoryVcs::new();
    let (origin, _) = origin_with_history(&vcs, "mem://origin");
    let forge = MockForge::new(vcs);

    let (branch, overwrite, proposals) =
        find_existing_proposed(primary(&origin).as_ref(), &forge, "fix", false, None)
            .await
            .unwrap();
    assert!(branch.is_none());
    assert!(overwrite.is_none());
    assert!(proposals.is_none());
}

#[tokio::test]
async fn test_find_existing_proposed_open_proposal() {
    let vcs = MemoryVcs::new();
    let (origin, r1) = origin_with_history(&vcs, "mem://origin");
    let forge = MockForge::new(vcs.clone());
    let derived_url = forge.derived_url("fix", None);
    derived_at(&vcs, &origin, derived_url.as_str(), &r1).await;
    forge.add_open_proposal(&derived_url, origin.url(), "Apply fix.");

    let (branch, overwrite, proposals) =
        find_existing_proposed(primary(&origin).as_ref(), &forge, "fix", false, None)
            .await
            .unwrap();
    assert!(branch.is_some());
    assert_eq!(overwrite, Some(false));
    assert_eq!(proposals.map(|p| p.len()), Some(1));
}

#[tokio::test]
async fn test_find_existing_proposed_merged_proposal_means_overwrite() {
    let vcs = MemoryVcs::new();
    let (origin, r1) = origin_with_history(&vcs, "mem://origin");
    let forge = MockForge::new(vcs.clone());
    let derived_url = forge.derived_url("fix", None);
    derived_at(&vcs, &origin, derived_url.as_str(), &r1).await;
    let proposal = forge.add_open_proposal(&derived_url, origin.url(), "Apply fix.");
    proposal.force_merged();

    let (branch, overwrite, proposals) =
        find_existing_proposed(primary(&origin).as_ref(), &forge, "fix", false, None)
            .await
            .unwrap();
    assert!(branch.is_none());
    assert_eq!(overwrite, Some(true));
    assert!(proposals.is_none());
}

#[tokio::test]
async fn test_propose_publishes_colocated_branches() {
    let vcs = MemoryVcs::new();
    let (origin, _) = origin_with_history(&vcs, "mem://origin");
    let m1 = origin.commit_on("meta", "main metadata", &[("meta.json", Some("{}\n"))]);

    let mapping = std::collections::HashMap::from([("meta".to_string(), "meta".to_string())]);
    let ws = Workspace::builder()
        .main_branch(primary(&origin))
        .additional_colocated_branches(mapping)
        .build(Arc::new(vcs.clone()))
        .await
        .unwrap();
    ws.local_tree().put_file("fix.txt", "done\n").await.unwrap();
    ws.local_tree().commit("apply fix").await.unwrap();

    let forge = Arc::new(MockForge::new(vcs.clone()));
    let request = PublishRequest::new(Mode::Propose, "fix");
    ws.publish_changes(None, Some(forge.clone()), &content("Apply fix."), &request)
        .await
        .unwrap();

    let derived = vcs.get_repo(&forge.derived_url("fix", None)).unwrap();
    assert!(derived.has_branch("meta"));
    assert_eq!(derived.branch("meta").last_revision().await.unwrap(), m1);
}
