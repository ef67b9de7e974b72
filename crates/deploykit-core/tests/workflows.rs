//! Verification runs and cleanup with terraform and SSH replaced by doubles

mod common;

use std::path::{Path, PathBuf};
use std::time::Duration;

use common::{
    Answer, GCP_FINISHED, GCP_JOURNAL, MockMigLister, MockProvisioner, ScriptedExecutor,
    ScriptedFactory, exit, ok,
};
use deploykit_core::{
    CleanupOptions, MigError, RunError, ServerTypes, VerifyError, VerifyOptions, VerifyRun,
    cleanup,
};
use deploykit_state::{ArtifactCategory, DeploymentState, TestStatus};
use serde_json::json;
use tempfile::TempDir;

fn saved_state(dir: &Path, applied_by_script: bool) -> PathBuf {
    let mut state = DeploymentState::create(dir.join("aws/vm"), "aws", "vm", applied_by_script);
    state.add_artifact(
        ArtifactCategory::DnsRecords,
        json!({"name": "sip.azure-prod.jambonz.io", "type": "A"})
            .as_object()
            .unwrap()
            .clone(),
    );
    deploykit_state::save_in(&state, dir).unwrap()
}

fn destroy_only() -> CleanupOptions {
    CleanupOptions {
        destroy_terraform: true,
        auto_approve: false,
    }
}

fn run_options(dir: &TempDir) -> VerifyOptions {
    let mut options = VerifyOptions::new(dir.path().join("gcp/mig"));
    options.state_dir = dir.path().to_path_buf();
    options.init_wait = Duration::ZERO;
    options
}

fn only_state_file(dir: &Path) -> PathBuf {
    let states = deploykit_state::list_all(dir).unwrap();
    assert_eq!(states.len(), 1);
    dir.join(states[0].source_file.as_deref().unwrap())
}

#[tokio::test]
async fn test_cleanup_declined_keeps_state_file() {
    let dir = TempDir::new().unwrap();
    let state_file = saved_state(dir.path(), false);
    let provisioner = MockProvisioner::default();
    let answer = Answer::no();

    let report = cleanup(&state_file, &provisioner, destroy_only(), &answer).await;

    assert!(!report.success);
    assert!(!report.state_file_deleted);
    assert!(state_file.exists());
    assert_eq!(answer.times_asked(), 1);
    assert!(provisioner.calls().is_empty());
}

#[tokio::test]
async fn test_cleanup_confirmed_destroys_and_deletes() {
    let dir = TempDir::new().unwrap();
    let state_file = saved_state(dir.path(), false);
    let provisioner = MockProvisioner::default();
    let answer = Answer::yes();

    let report = cleanup(&state_file, &provisioner, destroy_only(), &answer).await;

    assert!(report.success);
    assert!(report.state_file_deleted);
    assert!(!state_file.exists());
    assert_eq!(answer.times_asked(), 1);

    let calls = provisioner.calls();
    assert_eq!(calls.len(), 1);
    assert_eq!(calls[0].0, "destroy");
    assert!(calls[0].1.ends_with("aws/vm"));
    assert!(calls[0].2);

    // the DNS record is reported, not removed
    assert_eq!(report.warnings.len(), 1);
    assert!(report.warnings[0].starts_with("dns_records"));
}

#[tokio::test]
async fn test_cleanup_of_own_deployment_does_not_ask() {
    let dir = TempDir::new().unwrap();
    let state_file = saved_state(dir.path(), true);
    let provisioner = MockProvisioner::default();
    let answer = Answer::no();

    let report = cleanup(&state_file, &provisioner, destroy_only(), &answer).await;

    assert!(report.success);
    assert_eq!(answer.times_asked(), 0);
    assert_eq!(provisioner.calls().len(), 1);
    assert!(!provisioner.calls()[0].2);
}

#[tokio::test]
async fn test_cleanup_auto_approve_skips_prompt() {
    let dir = TempDir::new().unwrap();
    let state_file = saved_state(dir.path(), false);
    let provisioner = MockProvisioner::default();
    let answer = Answer::no();
    let options = CleanupOptions {
        destroy_terraform: true,
        auto_approve: true,
    };

    let report = cleanup(&state_file, &provisioner, options, &answer).await;

    assert!(report.success);
    assert_eq!(answer.times_asked(), 0);
    assert!(provisioner.calls()[0].2);
}

#[tokio::test]
async fn test_cleanup_without_destroy_only_removes_state() {
    let dir = TempDir::new().unwrap();
    let state_file = saved_state(dir.path(), true);
    let provisioner = MockProvisioner::default();

    let report = cleanup(
        &state_file,
        &provisioner,
        CleanupOptions::default(),
        &Answer::no(),
    )
    .await;

    assert!(report.success);
    assert!(report.state_file_deleted);
    assert!(provisioner.calls().is_empty());
}

#[tokio::test]
async fn test_cleanup_failed_destroy_keeps_state_file() {
    let dir = TempDir::new().unwrap();
    let state_file = saved_state(dir.path(), true);
    let provisioner = MockProvisioner::failing_destroy();

    let report = cleanup(&state_file, &provisioner, destroy_only(), &Answer::yes()).await;

    assert!(!report.success);
    assert!(state_file.exists());
    assert!(
        report
            .warnings
            .iter()
            .any(|w| w.starts_with("terraform destroy failed"))
    );

    // the same file can be cleaned up again
    let retry = cleanup(
        &state_file,
        &MockProvisioner::default(),
        destroy_only(),
        &Answer::yes(),
    )
    .await;
    assert!(retry.success);
    assert!(!state_file.exists());
}

#[tokio::test]
async fn test_cleanup_missing_state_file() {
    let dir = TempDir::new().unwrap();
    let provisioner = MockProvisioner::default();

    let report = cleanup(
        &dir.path().join(".test-state-missing.yaml"),
        &provisioner,
        destroy_only(),
        &Answer::yes(),
    )
    .await;

    assert!(!report.success);
    assert!(!report.state_file_deleted);
    assert!(provisioner.calls().is_empty());
}

#[tokio::test]
async fn test_cleanup_without_terraform_dir() {
    let dir = TempDir::new().unwrap();
    let state_file = dir.path().join(".test-state-legacy.yaml");
    std::fs::write(
        &state_file,
        "\
deployment_id: legacy
timestamp: '2025-01-01T12:00:00'
provider: aws
variant: vm
terraform:
  applied_by_script: true
  outputs: {}
artifacts:
  dns_records: []
  tls_certificates: []
  api_resources: []
  credentials: {}
test_results:
  status: pending
  steps_completed: []
  duration_seconds: 0
",
    )
    .unwrap();
    let provisioner = MockProvisioner::default();

    let report = cleanup(&state_file, &provisioner, destroy_only(), &Answer::yes()).await;

    assert!(!report.success);
    assert!(state_file.exists());
    assert!(provisioner.calls().is_empty());
}

#[tokio::test]
async fn test_run_deploy_verify_and_clean_up() {
    let dir = TempDir::new().unwrap();
    let provisioner = MockProvisioner::with_outputs(json!({
        "sbc_public_ips": ["203.0.113.20"],
        "feature_server_private_ips": ["10.0.1.5"]
    }));
    let executors = ScriptedFactory::default();
    let mut options = run_options(&dir);
    options.deploy = true;
    options.cleanup_on_success = true;

    let outcome = VerifyRun::new(&provisioner, &executors, options)
        .execute()
        .await
        .unwrap();

    assert!(outcome.success);
    assert_eq!(outcome.instances.len(), 2);
    assert!(outcome.instances.iter().all(|i| i.passed()));
    assert_eq!(outcome.state.provider, "gcp");
    assert_eq!(outcome.state.variant, "mig");
    assert!(outcome.state.terraform.applied_by_script);
    assert_eq!(outcome.state.test_results.status, TestStatus::Success);
    assert_eq!(
        outcome.state.test_results.steps_completed,
        vec!["cloud_init_verification"]
    );

    let requested = executors.requested();
    assert_eq!(requested[1].jump_host.as_deref(), Some("203.0.113.20"));

    let commands: Vec<String> = provisioner.calls().into_iter().map(|c| c.0).collect();
    assert_eq!(commands, vec!["apply", "output", "destroy"]);
    assert!(provisioner.calls()[0].2);

    let cleanup = outcome.cleanup.unwrap();
    assert!(cleanup.success);
    assert!(!outcome.state_file.exists());
}

#[tokio::test]
async fn test_run_existing_deployment_leaves_it_running() {
    let dir = TempDir::new().unwrap();
    let provisioner = MockProvisioner::with_outputs(json!({
        "web_ip": "203.0.113.9"
    }));
    let executors = ScriptedFactory::default();
    let mut options = run_options(&dir);
    options.cleanup_on_success = true;

    let outcome = VerifyRun::new(&provisioner, &executors, options)
        .execute()
        .await
        .unwrap();

    assert!(outcome.success);
    assert!(outcome.cleanup.is_none());
    assert!(!outcome.state.terraform.applied_by_script);
    assert_eq!(outcome.state_file, only_state_file(dir.path()));

    let commands: Vec<String> = provisioner.calls().into_iter().map(|c| c.0).collect();
    assert_eq!(commands, vec!["output"]);
}

#[tokio::test]
async fn test_run_with_failing_instance() {
    let dir = TempDir::new().unwrap();
    let provisioner = MockProvisioner::with_outputs(json!({
        "sbc_ips": ["203.0.113.20", "203.0.113.21"]
    }));
    let broken = ScriptedExecutor::new("203.0.113.21").on(
        GCP_JOURNAL,
        exit(0, "google-startup-scripts.service: Failed with result 'exit-code'.", ""),
    );
    let executors = ScriptedFactory::default().with(broken);
    let mut options = run_options(&dir);
    options.deploy = true;
    options.cleanup_on_success = true;

    let outcome = VerifyRun::new(&provisioner, &executors, options)
        .execute()
        .await
        .unwrap();

    assert!(!outcome.success);
    assert!(outcome.instances[0].passed());
    assert!(!outcome.instances[1].passed());
    assert!(outcome.cleanup.is_none());

    let saved = deploykit_state::load(&outcome.state_file).unwrap();
    assert_eq!(saved.test_results.status, TestStatus::Failed);
    assert_eq!(saved.terraform.outputs.len(), 1);
    assert!(!provisioner.calls().iter().any(|c| c.0 == "destroy"));
}

#[tokio::test]
async fn test_run_apply_failure_saves_state() {
    let dir = TempDir::new().unwrap();
    let provisioner = MockProvisioner::failing_apply();
    let mut options = run_options(&dir);
    options.deploy = true;

    let err = VerifyRun::new(&provisioner, &ScriptedFactory::default(), options)
        .execute()
        .await
        .unwrap_err();

    assert!(matches!(err, RunError::Apply { .. }));
    let saved = deploykit_state::load(err.state_file().unwrap()).unwrap();
    assert_eq!(saved.test_results.status, TestStatus::Failed);
    assert_eq!(saved.test_results.steps_completed, vec!["terraform_apply"]);
    assert!(saved.terraform.applied_by_script);
    assert_eq!(provisioner.calls().len(), 1);
}

#[tokio::test]
async fn test_run_outputs_failure_saves_state() {
    let dir = TempDir::new().unwrap();
    let provisioner = MockProvisioner::failing_outputs();

    let err = VerifyRun::new(&provisioner, &ScriptedFactory::default(), run_options(&dir))
        .execute()
        .await
        .unwrap_err();

    assert!(matches!(err, RunError::Outputs { .. }));
    let state_file = only_state_file(dir.path());
    assert_eq!(err.state_file(), Some(&state_file));

    let saved = deploykit_state::load(&state_file).unwrap();
    assert_eq!(saved.test_results.steps_completed, vec!["get_outputs"]);
}

#[tokio::test]
async fn test_run_without_instances() {
    let dir = TempDir::new().unwrap();
    let provisioner = MockProvisioner::with_outputs(json!({"vpc_id": "vpc-123"}));
    let executors = ScriptedFactory::default();

    let err = VerifyRun::new(&provisioner, &executors, run_options(&dir))
        .execute()
        .await
        .unwrap_err();

    assert!(matches!(err, RunError::NoInstances { .. }));
    assert!(executors.requested().is_empty());

    let saved = deploykit_state::load(&only_state_file(dir.path())).unwrap();
    assert_eq!(saved.test_results.steps_completed, vec!["identify_instances"]);
    assert_eq!(saved.terraform.outputs["vpc_id"], json!("vpc-123"));
}

#[tokio::test]
async fn test_instance_without_pm2_fails_the_run() {
    let dir = TempDir::new().unwrap();
    let provisioner = MockProvisioner::with_outputs(json!({"web_ip": "203.0.113.9"}));
    let no_pm2 = ScriptedExecutor::new("203.0.113.9").on(GCP_JOURNAL, ok(GCP_FINISHED));
    let executors = ScriptedFactory::default().with(no_pm2);

    let outcome = VerifyRun::new(&provisioner, &executors, run_options(&dir))
        .execute()
        .await
        .unwrap();

    // pm2 is not scripted, so both pm2 commands exit 127
    assert!(!outcome.success);
    assert!(outcome.instances[0].result.is_err());
}

#[tokio::test]
async fn test_run_checks_services_of_each_server_type() {
    let dir = TempDir::new().unwrap();
    let provisioner = MockProvisioner::with_outputs(json!({
        "web_ip": "203.0.113.9",
        "sbc_ips": ["203.0.113.20"]
    }));
    let web = ScriptedExecutor::healthy("203.0.113.9")
        .on("systemctl is-active nginx", ok("active\n"));
    let executors = ScriptedFactory::default().with(web);
    let mut options = run_options(&dir);
    options.server_types = ServerTypes::parse(
        "\
server_types:
  web-monitoring:
    systemd_services: [nginx]
  sbc:
    pm2_processes: [jambonz-sbc-sip, sbc-inbound]
",
        Path::new("server_types.yaml"),
    )
    .unwrap();

    let outcome = VerifyRun::new(&provisioner, &executors, options)
        .execute()
        .await
        .unwrap();

    assert!(!outcome.success);
    assert!(outcome.instances[0].passed());
    assert_eq!(
        outcome.instances[0].result.as_ref().unwrap().units[0].name,
        "nginx"
    );

    // healthy() only runs jambonz-sbc-sip
    match &outcome.instances[1].result {
        Err(VerifyError::Services { role, message }) => {
            assert_eq!(role, "sbc-0");
            assert_eq!(message, "missing expected services: sbc-inbound");
        }
        other => panic!("unexpected result: {other:?}"),
    }
}

#[tokio::test]
async fn test_run_verifies_mig_members_through_web_host() {
    let dir = TempDir::new().unwrap();
    let provisioner = MockProvisioner::with_outputs(json!({
        "web_monitoring_public_ip": "203.0.113.9",
        "sbc_public_ips": ["203.0.113.20"],
        "feature_server_mig_name": "jambonz-fs-mig",
        "recording_mig_name": "Not deployed",
        "service_account_email": "jambonz@voip-test.iam.gserviceaccount.com"
    }));
    let migs = MockMigLister::default().with(
        "name~-fs-",
        &[
            ("jambonz-fs-abcd", Some("10.0.1.5")),
            ("jambonz-fs-efgh", None),
            ("jambonz-fs-ijkl", Some("10.0.1.6")),
        ],
    );
    let executors = ScriptedFactory::default();

    let outcome = VerifyRun::new(&provisioner, &executors, run_options(&dir))
        .with_mig_lister(&migs)
        .execute()
        .await
        .unwrap();

    assert!(outcome.success);
    assert_eq!(
        migs.calls(),
        vec![("voip-test".to_string(), "name~-fs-".to_string())]
    );

    let requested = executors.requested();
    let roles: Vec<&str> = requested.iter().map(|i| i.role.as_str()).collect();
    assert_eq!(
        roles,
        vec!["web-monitoring", "sbc-0", "feature-server-0", "feature-server-1"]
    );
    assert_eq!(requested[2].host, "10.0.1.5");
    assert_eq!(requested[3].host, "10.0.1.6");
    assert_eq!(requested[2].jump_host.as_deref(), Some("203.0.113.9"));
    assert_eq!(requested[3].jump_host.as_deref(), Some("203.0.113.9"));
}

#[tokio::test]
async fn test_run_mig_project_from_configuration() {
    let dir = TempDir::new().unwrap();
    let provisioner = MockProvisioner::with_outputs(json!({
        "web_ip": "203.0.113.9",
        "recording_mig_name": "jambonz-recording-mig"
    }));
    let migs = MockMigLister::default()
        .with("name~-recording-", &[("jambonz-recording-x1", Some("10.0.2.7"))]);
    let executors = ScriptedFactory::default();
    let mut options = run_options(&dir);
    options.gcp_project = Some("voip-prod".to_string());

    let outcome = VerifyRun::new(&provisioner, &executors, options)
        .with_mig_lister(&migs)
        .execute()
        .await
        .unwrap();

    assert_eq!(
        migs.calls(),
        vec![("voip-prod".to_string(), "name~-recording-".to_string())]
    );
    assert_eq!(outcome.instances[1].instance.role, "recording-0");
    assert_eq!(outcome.instances[1].instance.host, "10.0.2.7");
}

#[tokio::test]
async fn test_run_mig_listing_failure_saves_state() {
    let dir = TempDir::new().unwrap();
    let provisioner = MockProvisioner::with_outputs(json!({
        "web_ip": "203.0.113.9",
        "feature_server_mig_name": "jambonz-fs-mig",
        "project_id": "voip-test"
    }));
    let migs = MockMigLister::failing();
    let executors = ScriptedFactory::default();

    let err = VerifyRun::new(&provisioner, &executors, run_options(&dir))
        .with_mig_lister(&migs)
        .execute()
        .await
        .unwrap_err();

    assert!(matches!(
        err,
        RunError::Discovery {
            source: MigError::CommandFailed { .. },
            ..
        }
    ));
    assert!(executors.requested().is_empty());

    let saved = deploykit_state::load(err.state_file().unwrap()).unwrap();
    assert_eq!(saved.test_results.status, TestStatus::Failed);
    assert_eq!(saved.test_results.steps_completed, vec!["identify_instances"]);
}

#[tokio::test]
async fn test_run_mig_without_project() {
    let dir = TempDir::new().unwrap();
    let provisioner = MockProvisioner::with_outputs(json!({
        "web_ip": "203.0.113.9",
        "feature_server_mig_name": "jambonz-fs-mig"
    }));
    let migs = MockMigLister::default();

    let err = VerifyRun::new(&provisioner, &ScriptedFactory::default(), run_options(&dir))
        .with_mig_lister(&migs)
        .execute()
        .await
        .unwrap_err();

    match err {
        RunError::Discovery {
            source: MigError::NoProject { mig },
            ..
        } => assert_eq!(mig, "jambonz-fs-mig"),
        other => panic!("unexpected error: {other}"),
    }
    assert!(migs.calls().is_empty());
}
