//! Integration tests for project and deployment lifecycle operations.

mod common;

use chrono::{Duration as ChronoDuration, Utc};
use common::fakes::{Call, Op};
use common::{options, TestControl};
use std::collections::HashSet;
use std::sync::atomic::Ordering;
use tessera_control::store::Store;
use tessera_control::types::{
    Deployment, DeploymentId, DeploymentStatus, MemberRef, Organization, ProjectRole,
    RuntimeEndpoint, UpdateProjectOptions,
};
use tessera_control::{Allocation, ControlError, Project};

async fn prod_deployment(control: &TestControl, project: &Project) -> Deployment {
    let id = project
        .prod_deployment_id
        .as_ref()
        .expect("project has no production deployment");
    control
        .store
        .find_deployment(id)
        .await
        .expect("find deployment failed")
}

/// Record an extra deployment for `project`, created after every other one.
async fn extra_deployment(control: &TestControl, project: &Project) -> Deployment {
    let mut deployment = Deployment::pending(
        DeploymentId::generate(),
        project,
        RuntimeEndpoint {
            host: "http://extra.runtime.test".to_owned(),
            instance_id: "extra".to_owned(),
            audience: "runtime.test".to_owned(),
        },
    );
    deployment.created_on = Utc::now() + ChronoDuration::hours(1);
    control
        .store
        .insert_deployment(&deployment)
        .await
        .expect("insert deployment failed");
    deployment
}

#[tokio::test]
async fn create_project_provisions_sized_deployment_and_seeds_members() {
    let control = TestControl::new().await;

    let project = control.project("sales", 2).await;

    assert_eq!(
        control.provisioner.allocations(),
        [Allocation {
            host: format!(
                "http://{}.runtime.test",
                project.prod_deployment_id.as_ref().expect("no prod deployment")
            ),
            audience: "runtime.test".to_owned(),
            cpu: 2,
            memory_gb: 4,
            storage_bytes: 80_000_000_000,
        }]
    );

    let members = control
        .store
        .find_project_members(&project.id)
        .await
        .expect("find members failed");
    assert_eq!(members.len(), 2);
    assert!(members.iter().any(|m| m.role == ProjectRole::Admin
        && m.member == MemberRef::User(control.creator.clone())));
    assert!(members.iter().any(|m| m.role == ProjectRole::Viewer
        && matches!(&m.member, MemberRef::Usergroup(g) if g.as_str() == "acme-all")));

    let deployment = prod_deployment(&control, &project).await;
    assert_eq!(deployment.slots, 2);
    assert!(!deployment.runtime.host.is_empty());
    assert!(!deployment.runtime.instance_id.is_empty());
    assert_eq!(deployment.status, DeploymentStatus::Ok);
    assert_eq!(control.runtime.requests().len(), 1);

    // The deployment id is the provision id.
    assert_eq!(
        control.provisioner.calls()[..2],
        [
            Call::Provision {
                id: deployment.id.to_string(),
                slots: 2
            },
            Call::AwaitReady(deployment.id.to_string()),
        ]
    );
}

#[tokio::test]
async fn create_project_rejects_unknown_provisioner() {
    let control = TestControl::new().await;
    let mut opts = options("sales", 1);
    opts.provisioner = Some("missing".to_owned());

    let result = control
        .orchestrator
        .create_project(&control.org, &control.creator, opts)
        .await;

    assert!(matches!(result, Err(ControlError::ProvisionerNotFound(_))));
    assert!(control.provisioner.calls().is_empty());
}

#[tokio::test]
async fn failed_project_insert_provisions_nothing() {
    let control = TestControl::new().await;
    control.store.fail(Op::CreateProject);

    let result = control
        .orchestrator
        .create_project(&control.org, &control.creator, options("sales", 1))
        .await;

    assert!(result.is_err());
    assert!(control.provisioner.calls().is_empty());
}

#[tokio::test]
async fn failed_provision_removes_project() {
    let control = TestControl::new().await;
    control.provisioner.fail_provision.store(true, Ordering::SeqCst);

    let result = control
        .orchestrator
        .create_project(&control.org, &control.creator, options("sales", 1))
        .await;

    assert!(result.is_err());
    let projects = control
        .store
        .find_projects_for_organization(&control.org.id)
        .await
        .expect("list failed");
    assert!(projects.is_empty());
    assert!(control.provisioner.deprovisioned().is_empty());
}

#[tokio::test]
async fn runtime_that_never_becomes_ready_is_released() {
    let control = TestControl::new().await;
    control.provisioner.fail_await_ready.store(true, Ordering::SeqCst);

    let result = control
        .orchestrator
        .create_project(&control.org, &control.creator, options("sales", 1))
        .await;

    assert!(result.is_err());
    assert_eq!(
        control.provisioner.deprovisioned(),
        control.provisioner.provisioned()
    );
    let projects = control
        .store
        .find_projects_for_organization(&control.org.id)
        .await
        .expect("list failed");
    assert!(projects.is_empty());
}

#[tokio::test]
async fn failed_deployment_insert_releases_runtime_and_project() {
    let control = TestControl::new().await;
    control.store.fail(Op::InsertDeployment);

    let result = control
        .orchestrator
        .create_project(&control.org, &control.creator, options("sales", 1))
        .await;

    assert!(result.is_err());
    assert_eq!(control.provisioner.deprovisioned().len(), 1);
    assert_eq!(
        control.provisioner.deprovisioned(),
        control.provisioner.provisioned()
    );
    let projects = control
        .store
        .find_projects_for_organization(&control.org.id)
        .await
        .expect("list failed");
    assert!(projects.is_empty());
}

#[tokio::test]
async fn failed_prod_swap_tears_down_deployment_and_project() {
    let control = TestControl::new().await;
    control.store.fail(Op::SwapProd);

    let result = control
        .orchestrator
        .create_project(&control.org, &control.creator, options("sales", 1))
        .await;

    assert!(result.is_err());
    assert_eq!(
        control.provisioner.deprovisioned(),
        control.provisioner.provisioned()
    );
    let projects = control
        .store
        .find_projects_for_organization(&control.org.id)
        .await
        .expect("list failed");
    assert!(projects.is_empty());
    assert!(control.runtime.requests().is_empty());
}

#[tokio::test]
async fn failed_compensations_are_reported_with_the_original_error() {
    let control = TestControl::new().await;
    control.store.fail(Op::SwapProd);
    control.store.fail(Op::DeleteProject);

    let err = control
        .orchestrator
        .create_project(&control.org, &control.creator, options("sales", 1))
        .await
        .expect_err("create should fail");

    match err {
        ControlError::Compensated {
            error,
            compensations,
        } => {
            assert!(error.to_string().contains("failed to set production deployment"));
            assert_eq!(compensations.len(), 1);
            assert!(compensations[0].to_string().contains("DeleteProject"));
        }
        other => panic!("expected compensated error, got {other}"),
    }
}

#[tokio::test]
async fn redeploy_replaces_production_deployment() {
    let control = TestControl::new().await;
    let project = control.project("sales", 1).await;
    let prev = prod_deployment(&control, &project).await;

    let next = control
        .orchestrator
        .trigger_redeploy(&project, &prev)
        .await
        .expect("redeploy failed");
    control.orchestrator.wait_background().await;

    let project = control
        .store
        .find_project(&project.id)
        .await
        .expect("find project failed");
    assert_eq!(project.prod_deployment_id.as_ref(), Some(&next.id));
    assert_eq!(control.provisioner.deprovisioned(), [prev.id.to_string()]);

    let deployments = control
        .store
        .find_deployments_for_project(&project.id)
        .await
        .expect("list failed");
    assert_eq!(deployments.len(), 1);
    assert_eq!(deployments[0].id, next.id);
    assert_eq!(deployments[0].status, DeploymentStatus::Ok);
}

#[tokio::test]
async fn redeploy_swap_failure_keeps_previous_deployment() {
    let control = TestControl::new().await;
    let project = control.project("sales", 1).await;
    let prev = prod_deployment(&control, &project).await;
    control.store.fail(Op::SwapProd);

    let result = control.orchestrator.trigger_redeploy(&project, &prev).await;
    assert!(result.is_err());

    let after = control
        .store
        .find_project(&project.id)
        .await
        .expect("find project failed");
    assert_eq!(after.prod_deployment_id.as_ref(), Some(&prev.id));

    let deployments = control
        .store
        .find_deployments_for_project(&project.id)
        .await
        .expect("list failed");
    assert_eq!(deployments.len(), 1);
    assert_eq!(deployments[0].id, prev.id);

    // The new deployment was provisioned and released again.
    let provisioned = control.provisioner.provisioned();
    assert_eq!(provisioned.len(), 2);
    assert_eq!(control.provisioner.deprovisioned(), [provisioned[1].clone()]);
}

#[tokio::test]
async fn redeploy_from_stale_project_conflicts() {
    let control = TestControl::new().await;
    let stale = control.project("sales", 1).await;
    let prev = prod_deployment(&control, &stale).await;

    control
        .orchestrator
        .trigger_redeploy(&stale, &prev)
        .await
        .expect("first redeploy failed");
    let current = control
        .store
        .find_project(&stale.id)
        .await
        .expect("find project failed");

    let err = control
        .orchestrator
        .trigger_redeploy(&stale, &prev)
        .await
        .expect_err("stale redeploy should fail");
    assert!(matches!(
        err.root(),
        ControlError::ProdDeploymentConflict { .. }
    ));

    let after = control
        .store
        .find_project(&stale.id)
        .await
        .expect("find project failed");
    assert_eq!(after.prod_deployment_id, current.prod_deployment_id);
    let deployments = control
        .store
        .find_deployments_for_project(&stale.id)
        .await
        .expect("list failed");
    assert_eq!(deployments.len(), 1);
}

#[tokio::test]
async fn redeploy_survives_failed_teardown_of_previous() {
    let control = TestControl::new().await;
    let project = control.project("sales", 1).await;
    let prev = prod_deployment(&control, &project).await;
    control.provisioner.fail_deprovision_of(&prev.id);

    let next = control
        .orchestrator
        .trigger_redeploy(&project, &prev)
        .await
        .expect("redeploy should succeed");

    let after = control
        .store
        .find_project(&project.id)
        .await
        .expect("find project failed");
    assert_eq!(after.prod_deployment_id.as_ref(), Some(&next.id));
    // The previous record stays until its teardown succeeds.
    assert!(control.store.find_deployment(&prev.id).await.is_ok());
}

#[tokio::test]
async fn teardown_deprovisions_every_deployment_once_then_deletes_project() {
    let control = TestControl::new().await;
    let project = control.project("sales", 1).await;
    let prod = prod_deployment(&control, &project).await;
    let extra = extra_deployment(&control, &project).await;

    control
        .orchestrator
        .teardown_project(&project)
        .await
        .expect("teardown failed");

    assert_eq!(
        control.provisioner.deprovisioned(),
        [prod.id.to_string(), extra.id.to_string()]
    );
    let err = control
        .store
        .find_project(&project.id)
        .await
        .expect_err("project should be deleted");
    assert!(err.is_not_found());
}

#[tokio::test]
async fn teardown_stops_at_first_failure_and_keeps_project() {
    let control = TestControl::new().await;
    let project = control.project("sales", 1).await;
    let prod = prod_deployment(&control, &project).await;
    let extra = extra_deployment(&control, &project).await;
    control.provisioner.fail_deprovision_of(&prod.id);

    let result = control.orchestrator.teardown_project(&project).await;

    assert!(result.is_err());
    assert_eq!(control.provisioner.deprovisioned(), [prod.id.to_string()]);
    assert!(control.store.find_project(&project.id).await.is_ok());
    assert!(control.store.find_deployment(&extra.id).await.is_ok());
}

#[tokio::test]
async fn hibernate_releases_production_deployment() {
    let control = TestControl::new().await;
    let project = control.project("sales", 1).await;
    let prod = prod_deployment(&control, &project).await;

    let hibernated = control
        .orchestrator
        .hibernate_project(&project)
        .await
        .expect("hibernate failed");

    assert_eq!(hibernated.prod_deployment_id, None);
    assert_eq!(control.provisioner.deprovisioned(), [prod.id.to_string()]);
    assert!(control.store.find_deployment(&prod.id).await.is_err());

    // Hibernating again is a no-op.
    control
        .orchestrator
        .hibernate_project(&hibernated)
        .await
        .expect("second hibernate failed");
    assert_eq!(control.provisioner.deprovisioned().len(), 1);
}

#[tokio::test]
async fn failed_hibernate_keeps_production_pointer() {
    let control = TestControl::new().await;
    let project = control.project("sales", 1).await;
    let prod = prod_deployment(&control, &project).await;
    control.provisioner.fail_deprovision_of(&prod.id);

    control
        .orchestrator
        .hibernate_project(&project)
        .await
        .expect_err("hibernate should fail");

    let after = control
        .store
        .find_project(&project.id)
        .await
        .expect("find project failed");
    assert_eq!(after.prod_deployment_id.as_ref(), Some(&prod.id));
    control
        .store
        .find_deployment(&prod.id)
        .await
        .expect("deployment should be kept");
}

#[tokio::test]
async fn purge_organization_tears_down_every_project() {
    let control = TestControl::new().await;
    control.project("sales", 1).await;
    control.project("marketing", 2).await;

    control
        .orchestrator
        .purge_organization(&control.org.id)
        .await
        .expect("purge failed");

    assert_eq!(control.provisioner.deprovisioned().len(), 2);
    let err = control
        .store
        .find_organization(&control.org.id)
        .await
        .expect_err("organization should be deleted");
    assert!(err.is_not_found());
}

#[tokio::test]
async fn redeploy_all_replaces_every_deployment() {
    let control = TestControl::new().await;
    let sales = control.project("sales", 1).await;
    let marketing = control.project("marketing", 1).await;

    control
        .orchestrator
        .redeploy_all()
        .await
        .expect("redeploy all failed");
    control.orchestrator.wait_background().await;

    for project in [sales, marketing] {
        let after = control
            .store
            .find_project(&project.id)
            .await
            .expect("find project failed");
        assert_ne!(after.prod_deployment_id, project.prod_deployment_id);
        assert!(after.prod_deployment_id.is_some());
    }
    assert_eq!(control.provisioner.deprovisioned().len(), 2);
}

#[tokio::test]
async fn all_projects_includes_same_named_projects_across_pages() {
    let control = TestControl::new().await;
    for i in 0..101 {
        let org = Organization::new(format!("org-{i}"), None);
        control
            .store
            .insert_organization(&org)
            .await
            .expect("insert organization failed");
        control
            .orchestrator
            .create_project(&org, &control.creator, options("analytics", 1))
            .await
            .expect("create project failed");
    }
    control.orchestrator.wait_background().await;

    let projects = control
        .orchestrator
        .all_projects()
        .await
        .expect("list projects failed");

    assert_eq!(projects.len(), 101);
    let ids: HashSet<_> = projects.iter().map(|p| p.id.clone()).collect();
    assert_eq!(ids.len(), 101);
}

#[tokio::test]
async fn update_project_moves_deployments_to_new_branch_and_version() {
    let control = TestControl::new().await;
    let project = control.project("sales", 1).await;
    let prod = prod_deployment(&control, &project).await;
    let requests_before = control.runtime.requests().len();

    let mut opts = UpdateProjectOptions::from_project(&project);
    opts.prod_branch = "release".to_owned();
    opts.runtime_version = Some("v0.42.0".to_owned());
    let updated = control
        .orchestrator
        .update_project(&project, opts)
        .await
        .expect("update failed");
    control.orchestrator.wait_background().await;

    assert_eq!(updated.prod_branch, "release");
    assert_eq!(updated.prod_deployment_id.as_ref(), Some(&prod.id));
    let deployment = prod_deployment(&control, &updated).await;
    assert_eq!(deployment.branch, "release");
    assert!(control.provisioner.calls().contains(&Call::Update {
        id: prod.id.to_string(),
        version: "v0.42.0".to_owned(),
    }));
    assert_eq!(control.runtime.requests().len(), requests_before);
}

#[tokio::test]
async fn update_project_without_serving_changes_leaves_deployments_alone() {
    let control = TestControl::new().await;
    let project = control.project("sales", 1).await;
    let calls_before = control.provisioner.calls().len();
    control.store.fail(Op::UpdateDeployment);

    let mut opts = UpdateProjectOptions::from_project(&project);
    opts.name = "revenue".to_owned();
    opts.prod_ttl_seconds = Some(3600);
    let updated = control
        .orchestrator
        .update_project(&project, opts)
        .await
        .expect("update failed");

    assert_eq!(updated.name, "revenue");
    assert_eq!(updated.prod_ttl_seconds, Some(3600));
    assert_eq!(control.provisioner.calls().len(), calls_before);
}

#[tokio::test]
async fn failed_rollout_leaves_project_unchanged() {
    let control = TestControl::new().await;
    let project = control.project("sales", 1).await;
    control.provisioner.fail_update.store(true, Ordering::SeqCst);

    let mut opts = UpdateProjectOptions::from_project(&project);
    opts.prod_branch = "release".to_owned();
    opts.runtime_version = Some("v0.42.0".to_owned());
    control
        .orchestrator
        .update_project(&project, opts)
        .await
        .expect_err("update should fail");

    let after = control
        .store
        .find_project(&project.id)
        .await
        .expect("find project failed");
    assert_eq!(after.prod_branch, "main");
    assert_eq!(prod_deployment(&control, &after).await.branch, "main");
}
