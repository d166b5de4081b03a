mod common;

use std::sync::Arc;

use patchwright::FlowError;
use patchwright::collaborators::Completion;
use patchwright::queue::{RecordingQueue, StageHandler};
use patchwright::state_machine::{FailureKind, Job, JobInputs, MODIFY, Stage, State};
use patchwright::store::JobStore;

use common::{
    CountingCollector, FixedCompletion, PROJECT, SETTLE, USER, collaborators, config, engine,
    project, stepped,
};

const ORIGINAL: &str = "import os\n\n\ndef main():\n    print('hello')\n";

const DIFF: &str = concat!(
    "--- a/app.py\n",
    "+++ b/app.py\n",
    "@@ -1,5 +1,7 @@\n",
    " import os\n",
    "+import logging\n",
    " \n",
    " \n",
    " def main():\n",
    "-    print('hello')\n",
    "+    logging.info('hello')\n",
    "+    print('hello')\n",
);

const PATCHED: &str =
    "import os\nimport logging\n\n\ndef main():\n    logging.info('hello')\n    print('hello')\n";

fn patch_reply() -> Arc<FixedCompletion> {
    FixedCompletion::new(Completion::Text(format!("```diff\n{DIFF}```")))
}

#[tokio::test]
async fn start_returns_before_any_stage_runs() {
    let tmp = tempfile::TempDir::new().unwrap();
    let config = config(tmp.path());
    let queue = Arc::new(RecordingQueue::new());
    let (workflows, _) = stepped(&config, collaborators(&config, patch_reply()), queue.clone());

    let id = workflows
        .start_workflow(JobInputs::modify("U", "P", "add logging"))
        .await
        .unwrap();
    let job = workflows.get_job_status(&id).await.unwrap();
    assert_eq!(job.state, State::ContextBuilding);
    assert_eq!(queue.dispatched().len(), 1);
    assert!(matches!(
        workflows.get_job_status("unknown").await,
        Err(FlowError::JobNotFound(_))
    ));
}

#[tokio::test]
async fn patch_is_reviewed_then_applied_after_approval() {
    let tmp = tempfile::TempDir::new().unwrap();
    let mut config = config(tmp.path());
    config.review_test_command = Some(vec![
        "sh".into(),
        "-c".into(),
        "grep -q logging app.py".into(),
    ]);
    let dir = project(&config, &[("app.py", ORIGINAL)]);
    let completion = patch_reply();
    let (workflows, _) = engine(&config, collaborators(&config, completion.clone()));

    let id = workflows
        .start_workflow(JobInputs::modify(USER, PROJECT, "add logging"))
        .await
        .unwrap();
    let job = workflows.wait_until_settled(&id, SETTLE).await.unwrap();
    assert_eq!(job.state, State::AwaitingApproval, "{:?}", job.error_message);
    assert_eq!(job.accumulated.context.as_ref().unwrap()["app.py"], ORIGINAL);
    assert_eq!(job.accumulated.diff_patch.as_deref(), Some(DIFF));
    let review = job.accumulated.review_feedback.as_ref().unwrap();
    assert!(review.success, "{review:?}");
    assert_eq!(completion.requests.lock().unwrap().len(), 1);

    // Nothing touches the project before approval.
    assert_eq!(std::fs::read_to_string(dir.join("app.py")).unwrap(), ORIGINAL);

    let job = workflows.approve(&id).await.unwrap();
    assert_eq!(job.state, State::Done);
    assert_eq!(std::fs::read_to_string(dir.join("app.py")).unwrap(), PATCHED);
    assert_eq!(
        job.states_seen(),
        vec![
            State::Idle,
            State::ContextBuilding,
            State::CodePatching,
            State::Reviewing,
            State::AwaitingApproval,
            State::ApplyingPatch,
            State::Done,
        ]
    );
}

#[tokio::test]
async fn missing_project_directory_fails_the_job() {
    let tmp = tempfile::TempDir::new().unwrap();
    let config = config(tmp.path());
    let (workflows, _) = engine(&config, collaborators(&config, patch_reply()));

    let id = workflows
        .start_workflow(JobInputs::modify(USER, PROJECT, "add logging"))
        .await
        .unwrap();
    let job = workflows.wait_until_settled(&id, SETTLE).await.unwrap();
    assert_eq!(job.state, State::Error);
    assert!(job.error_message.unwrap().contains("not found"));
    assert_eq!(job.failure_kind, Some(FailureKind::Collaborator));
}

#[tokio::test]
async fn approval_outside_the_gate_changes_nothing() {
    let tmp = tempfile::TempDir::new().unwrap();
    let config = config(tmp.path());
    let queue = Arc::new(RecordingQueue::new());
    let (workflows, _) = stepped(&config, collaborators(&config, patch_reply()), queue);

    let id = workflows
        .start_workflow(JobInputs::modify(USER, PROJECT, "add logging"))
        .await
        .unwrap();
    let before = workflows.get_job_status(&id).await.unwrap();
    let err = workflows.approve(&id).await.unwrap_err();
    assert!(matches!(
        err,
        FlowError::NotAwaitingApproval {
            state: State::ContextBuilding,
            ..
        }
    ));
    let after = workflows.get_job_status(&id).await.unwrap();
    assert_eq!(after.state, before.state);
    assert_eq!(after.updated_at, before.updated_at);
    assert_eq!(after.state_history, before.state_history);
}

#[tokio::test]
async fn second_approval_of_an_applied_job_is_rejected() {
    let tmp = tempfile::TempDir::new().unwrap();
    let config = config(tmp.path());
    let dir = project(&config, &[("app.py", ORIGINAL)]);
    let (workflows, _) = engine(&config, collaborators(&config, patch_reply()));

    let id = workflows
        .start_workflow(JobInputs::modify(USER, PROJECT, "add logging"))
        .await
        .unwrap();
    workflows.wait_until_settled(&id, SETTLE).await.unwrap();
    assert_eq!(workflows.approve(&id).await.unwrap().state, State::Done);

    let err = workflows.approve(&id).await.unwrap_err();
    assert!(matches!(
        err,
        FlowError::NotAwaitingApproval {
            state: State::Done,
            ..
        }
    ));
    assert_eq!(std::fs::read_to_string(dir.join("app.py")).unwrap(), PATCHED);
}

#[tokio::test]
async fn conflicting_patch_leaves_project_untouched() {
    let tmp = tempfile::TempDir::new().unwrap();
    let config = config(tmp.path());
    let dir = project(&config, &[("app.py", ORIGINAL)]);
    let (workflows, _) = engine(&config, collaborators(&config, patch_reply()));

    let id = workflows
        .start_workflow(JobInputs::modify(USER, PROJECT, "add logging"))
        .await
        .unwrap();
    workflows.wait_until_settled(&id, SETTLE).await.unwrap();

    // The project drifts between review and approval.
    let drifted = "import sys\n\n\ndef run():\n    pass\n";
    std::fs::write(dir.join("app.py"), drifted).unwrap();

    let job = workflows.approve(&id).await.unwrap();
    assert_eq!(job.state, State::Error);
    assert_eq!(job.failure_kind, Some(FailureKind::ApplyConflict));
    assert!(job.error_message.unwrap().contains("Failed to apply patch"));
    assert_eq!(std::fs::read_to_string(dir.join("app.py")).unwrap(), drifted);
}

#[tokio::test]
async fn missing_prompt_at_a_stage_boundary_names_the_field() {
    let tmp = tempfile::TempDir::new().unwrap();
    let config = config(tmp.path());
    let queue = Arc::new(RecordingQueue::new());
    let (workflows, store) = stepped(&config, collaborators(&config, patch_reply()), queue);

    // Written by an older producer that skipped input validation.
    let mut job = Job::new(JobInputs::modify(USER, PROJECT, ""), State::Idle);
    job.transition(State::ContextBuilding);
    let id = job.id.clone();
    store.insert(job).await.unwrap();

    workflows.handle(Stage::BuildContext, &id).await.unwrap();
    let job = workflows.get_job_status(&id).await.unwrap();
    assert_eq!(job.state, State::Error);
    assert_eq!(job.failure_kind, Some(FailureKind::Input));
    assert!(job.error_message.unwrap().contains("prompt"));
}

#[tokio::test]
async fn duplicate_delivery_runs_the_stage_once() {
    let tmp = tempfile::TempDir::new().unwrap();
    let config = config(tmp.path());
    let counter = Arc::new(CountingCollector::default());
    let mut collaborators = collaborators(&config, patch_reply());
    collaborators.context = counter.clone();
    let queue = Arc::new(RecordingQueue::new());
    let (workflows, _) = stepped(&config, collaborators, queue.clone());

    let id = workflows
        .start_workflow(JobInputs::modify(USER, PROJECT, "add logging"))
        .await
        .unwrap();
    let delivery = queue.pop().unwrap();
    workflows.handle(delivery.stage, &id).await.unwrap();
    workflows.handle(delivery.stage, &id).await.unwrap();

    assert_eq!(counter.calls(), 1);
    let job = workflows.get_job_status(&id).await.unwrap();
    assert_eq!(job.state, State::CodePatching);
    let next: Vec<Stage> = queue.dispatched().iter().map(|d| d.stage).collect();
    assert_eq!(next, vec![Stage::GeneratePatch]);
}

#[tokio::test]
async fn cancelled_job_runs_no_further_stages() {
    let tmp = tempfile::TempDir::new().unwrap();
    let config = config(tmp.path());
    let counter = Arc::new(CountingCollector::default());
    let mut collaborators = collaborators(&config, patch_reply());
    collaborators.context = counter.clone();
    let queue = Arc::new(RecordingQueue::new());
    let (workflows, _) = stepped(&config, collaborators, queue.clone());

    let id = workflows
        .start_workflow(JobInputs::modify(USER, PROJECT, "add logging"))
        .await
        .unwrap();
    let job = workflows.cancel(&id, "wrong project").await.unwrap();
    assert_eq!(job.state, State::Error);
    assert_eq!(job.failure_kind, Some(FailureKind::Cancelled));

    let delivery = queue.pop().unwrap();
    workflows.handle(delivery.stage, &id).await.unwrap();
    assert_eq!(counter.calls(), 0);
    assert!(queue.pop().is_none());
    assert!(workflows.cancel(&id, "again").await.is_err());
}

#[tokio::test]
async fn observed_states_never_move_backwards() {
    let tmp = tempfile::TempDir::new().unwrap();
    let config = config(tmp.path());
    project(&config, &[("app.py", ORIGINAL)]);
    let (workflows, _) = engine(&config, collaborators(&config, patch_reply()));

    let id = workflows
        .start_workflow(JobInputs::modify(USER, PROJECT, "add logging"))
        .await
        .unwrap();
    let mut samples = Vec::new();
    loop {
        let job = workflows.get_job_status(&id).await.unwrap();
        samples.push(job.state);
        if MODIFY.is_settled(job.state) {
            break;
        }
        tokio::time::sleep(std::time::Duration::from_millis(5)).await;
    }
    samples.push(workflows.approve(&id).await.unwrap().state);

    let positions: Vec<usize> = samples
        .iter()
        .filter(|s| **s != State::Error)
        .map(|s| MODIFY.position(*s).unwrap())
        .collect();
    assert!(positions.windows(2).all(|w| w[0] <= w[1]), "{samples:?}");
    assert_eq!(samples.last(), Some(&State::Done));
}
