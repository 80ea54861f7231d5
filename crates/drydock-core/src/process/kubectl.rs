//! kubectl-backed cluster control plane.
//!
//! Workloads become Deployments, exposures become Services, and each policy
//! rule becomes a labelled NetworkPolicy next to one namespace-wide
//! default-deny policy. Rules round-trip through the `drydock.dev/rule`
//! annotation; deny rules select their destination with no ingress, so they
//! grant nothing and only record the assertion.

use std::time::Duration;

use async_trait::async_trait;
use serde_json::{json, Value};
use sha2::{Digest, Sha256};
use tracing::debug;

use super::{is_auth_failure, run_command, CommandOutput, CommandSpec};
use crate::collaborators::ClusterControlPlane;
use crate::config::ClusterCredentials;
use crate::domain::error::{DrydockError, Result};
use crate::domain::image::ImageRef;
use crate::domain::target::{ApplyChange, WorkloadHealth, WorkloadManifest};
use crate::network_policy::{NetworkPolicyRule, NetworkPolicySet, PolicyAction};
use crate::resource_set::{ExposureKind, ExposureRule};

pub const MANAGED_BY_LABEL: &str = "app.kubernetes.io/managed-by";
pub const IMAGE_REF_ANNOTATION: &str = "drydock.dev/image-ref";
pub const RULE_ANNOTATION: &str = "drydock.dev/rule";
const DEFAULT_DENY_NAME: &str = "drydock-default-deny";

#[derive(Debug, Clone)]
pub struct KubectlCluster {
    binary: String,
    timeout: Duration,
    credentials: ClusterCredentials,
}

impl KubectlCluster {
    pub fn new(credentials: ClusterCredentials) -> Self {
        Self {
            binary: "kubectl".to_string(),
            timeout: Duration::from_secs(120),
            credentials,
        }
    }

    pub fn with_binary(mut self, binary: impl Into<String>) -> Self {
        self.binary = binary.into();
        self
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    fn command(&self, namespace: &str) -> CommandSpec {
        let mut cmd = CommandSpec::new(&self.binary)
            .timeout(self.timeout)
            .arg("--kubeconfig")
            .arg(self.credentials.kubeconfig_path());
        if let Some(ctx) = &self.credentials.context {
            cmd = cmd.arg("--context").arg(ctx);
        }
        cmd.arg("--namespace").arg(namespace)
    }

    async fn run(&self, cmd: CommandSpec) -> Result<CommandOutput> {
        let out = run_command(&cmd).await?;
        if out.success() {
            Ok(out)
        } else {
            Err(classify_failure(&out.stderr))
        }
    }

    async fn apply(&self, namespace: &str, manifest: &Value) -> Result<ApplyChange> {
        let cmd = self
            .command(namespace)
            .args(["apply", "-f", "-"])
            .stdin(serde_json::to_vec(manifest)?);
        let out = self.run(cmd).await?;
        Ok(parse_apply_change(&out.stdout))
    }

    async fn get_deployment(&self, namespace: &str, workload: &str) -> Result<Option<Value>> {
        let cmd = self
            .command(namespace)
            .args(["get", "deployment", workload, "-o", "json"]);
        let out = run_command(&cmd).await?;
        if !out.success() {
            if out.stderr.contains("NotFound") || out.stderr.contains("not found") {
                return Ok(None);
            }
            return Err(classify_failure(&out.stderr));
        }
        Ok(Some(serde_json::from_str(&out.stdout)?))
    }
}

#[async_trait]
impl ClusterControlPlane for KubectlCluster {
    async fn deployed_image(&self, namespace: &str, workload: &str) -> Result<Option<ImageRef>> {
        match self.get_deployment(namespace, workload).await? {
            Some(doc) => deployed_image_from(&doc),
            None => Ok(None),
        }
    }

    async fn apply_workload(
        &self,
        namespace: &str,
        workload: &WorkloadManifest,
    ) -> Result<ApplyChange> {
        self.apply(namespace, &deployment_manifest(namespace, workload))
            .await
    }

    async fn apply_exposure(&self, namespace: &str, exposure: &ExposureRule) -> Result<ApplyChange> {
        self.apply(namespace, &service_manifest(namespace, exposure))
            .await
    }

    async fn network_policy(&self, namespace: &str) -> Result<NetworkPolicySet> {
        let cmd = self
            .command(namespace)
            .args(["get", "networkpolicy", "-l"])
            .arg(format!("{MANAGED_BY_LABEL}=drydock"))
            .args(["-o", "json"]);
        let out = self.run(cmd).await?;
        parse_policy_list(namespace, &out.stdout)
    }

    async fn replace_network_policy(&self, desired: &NetworkPolicySet) -> Result<()> {
        let namespace = desired.namespace();
        let current = self.network_policy(namespace).await?;

        let list = json!({
            "apiVersion": "v1",
            "kind": "List",
            "items": policy_manifests(desired),
        });
        let cmd = self
            .command(namespace)
            .args(["apply", "-f", "-"])
            .stdin(serde_json::to_vec(&list)?);
        self.run(cmd).await?;

        let stale: Vec<String> = current
            .diff(desired)
            .removed
            .iter()
            .map(rule_object_name)
            .collect();
        if !stale.is_empty() {
            debug!(event = "kubectl.policy_prune", namespace = %namespace, objects = stale.len());
            let cmd = self
                .command(namespace)
                .args(["delete", "networkpolicy", "--ignore-not-found"])
                .args(stale);
            self.run(cmd).await?;
        }
        Ok(())
    }

    async fn restart_workload(&self, namespace: &str, workload: &str) -> Result<()> {
        let cmd = self
            .command(namespace)
            .args(["rollout", "restart"])
            .arg(format!("deployment/{workload}"));
        self.run(cmd).await.map(|_| ())
    }

    async fn workload_health(&self, namespace: &str, workload: &str) -> Result<WorkloadHealth> {
        match self.get_deployment(namespace, workload).await? {
            Some(doc) => Ok(health_from(&doc)),
            None => Err(DrydockError::Rollout {
                workload: workload.to_string(),
                reason: "deployment not found".to_string(),
            }),
        }
    }
}

// ---------------------------------------------------------------------------
// Rendering
// ---------------------------------------------------------------------------

fn labels(app: &str) -> Value {
    json!({ "app": app, MANAGED_BY_LABEL: "drydock" })
}

pub fn deployment_manifest(namespace: &str, w: &WorkloadManifest) -> Value {
    let ports: Vec<Value> = w
        .ports
        .iter()
        .map(|p| json!({ "containerPort": p }))
        .collect();
    json!({
        "apiVersion": "apps/v1",
        "kind": "Deployment",
        "metadata": {
            "name": w.name,
            "namespace": namespace,
            "labels": labels(&w.name),
            "annotations": { IMAGE_REF_ANNOTATION: w.image.to_string() },
        },
        "spec": {
            "replicas": w.replicas,
            "selector": { "matchLabels": { "app": w.name } },
            "template": {
                "metadata": { "labels": labels(&w.name) },
                "spec": {
                    "containers": [{
                        "name": w.name,
                        "image": w.image.tagged(),
                        "imagePullPolicy": "Always",
                        "ports": ports,
                    }],
                },
            },
        },
    })
}

pub fn service_manifest(namespace: &str, e: &ExposureRule) -> Value {
    let mut port = json!({
        "name": format!("port-{}", e.port),
        "port": e.port,
        "targetPort": e.target_port(),
        "protocol": "TCP",
    });
    let kind = match e.kind {
        ExposureKind::Internal => "ClusterIP",
        ExposureKind::NodePort(node_port) => {
            port["nodePort"] = json!(node_port);
            "NodePort"
        }
    };
    json!({
        "apiVersion": "v1",
        "kind": "Service",
        "metadata": {
            "name": e.workload,
            "namespace": namespace,
            "labels": labels(&e.workload),
        },
        "spec": {
            "type": kind,
            "selector": { "app": e.workload },
            "ports": [port],
        },
    })
}

/// Deterministic object name for a rule.
pub fn rule_object_name(rule: &NetworkPolicyRule) -> String {
    let mut hasher = Sha256::new();
    hasher.update(rule.to_string().as_bytes());
    let digest = hex::encode(hasher.finalize());
    format!("drydock-{}-{}", rule.to, &digest[..12])
}

/// Default-deny object plus one object per rule.
pub fn policy_manifests(set: &NetworkPolicySet) -> Vec<Value> {
    let namespace = set.namespace();
    let mut items = vec![json!({
        "apiVersion": "networking.k8s.io/v1",
        "kind": "NetworkPolicy",
        "metadata": {
            "name": DEFAULT_DENY_NAME,
            "namespace": namespace,
            "labels": { MANAGED_BY_LABEL: "drydock" },
        },
        "spec": { "podSelector": {}, "policyTypes": ["Ingress"] },
    })];

    for rule in set.rules() {
        let ingress = match rule.action {
            PolicyAction::Allow => {
                let mut entry = json!({
                    "from": [{ "podSelector": { "matchLabels": { "app": rule.from } } }],
                });
                if let Some(port) = rule.port {
                    entry["ports"] = json!([{ "port": port, "protocol": "TCP" }]);
                }
                vec![entry]
            }
            PolicyAction::Deny => Vec::new(),
        };
        let encoded = serde_json::to_string(rule).unwrap_or_default();
        items.push(json!({
            "apiVersion": "networking.k8s.io/v1",
            "kind": "NetworkPolicy",
            "metadata": {
                "name": rule_object_name(rule),
                "namespace": namespace,
                "labels": { MANAGED_BY_LABEL: "drydock" },
                "annotations": { RULE_ANNOTATION: encoded },
            },
            "spec": {
                "podSelector": { "matchLabels": { "app": rule.to } },
                "policyTypes": ["Ingress"],
                "ingress": ingress,
            },
        }));
    }
    items
}

// ---------------------------------------------------------------------------
// Parsing
// ---------------------------------------------------------------------------

/// `deployment.apps/vote configured` -> Configured.
pub fn parse_apply_change(stdout: &str) -> ApplyChange {
    let line = stdout.lines().last().unwrap_or("").trim();
    if line.ends_with("created") {
        ApplyChange::Created
    } else if line.ends_with("unchanged") {
        ApplyChange::Unchanged
    } else {
        ApplyChange::Configured
    }
}

pub fn parse_policy_list(namespace: &str, json: &str) -> Result<NetworkPolicySet> {
    let doc: Value = serde_json::from_str(json)?;
    let mut rules = Vec::new();
    for item in doc["items"].as_array().into_iter().flatten() {
        if let Some(raw) = item["metadata"]["annotations"][RULE_ANNOTATION].as_str() {
            let rule: NetworkPolicyRule = serde_json::from_str(raw)?;
            rules.push(rule);
        }
    }
    NetworkPolicySet::from_rules(namespace, rules)
}

fn deployed_image_from(doc: &Value) -> Result<Option<ImageRef>> {
    if let Some(raw) = doc["metadata"]["annotations"][IMAGE_REF_ANNOTATION].as_str() {
        return ImageRef::parse(raw).map(Some);
    }
    match doc["spec"]["template"]["spec"]["containers"][0]["image"].as_str() {
        Some(raw) => ImageRef::parse(raw).map(Some),
        None => Ok(None),
    }
}

fn health_from(doc: &Value) -> WorkloadHealth {
    let count = |v: &Value| v.as_u64().unwrap_or(0) as u32;
    let status = &doc["status"];
    WorkloadHealth {
        desired: doc["spec"]["replicas"].as_u64().map_or(1, |v| v as u32),
        updated: count(&status["updatedReplicas"]),
        ready: count(&status["readyReplicas"]),
    }
}

fn classify_failure(stderr: &str) -> DrydockError {
    let summary = stderr
        .lines()
        .rev()
        .find(|l| !l.trim().is_empty())
        .unwrap_or("kubectl failed")
        .trim()
        .to_string();
    if is_auth_failure(stderr) {
        DrydockError::config(format!("cluster rejected credentials: {summary}"))
    } else if stderr.contains("is invalid") || stderr.contains("error validating") {
        DrydockError::config(format!("cluster rejected manifest: {summary}"))
    } else {
        DrydockError::transient(format!("cluster call failed: {summary}"))
    }
}
