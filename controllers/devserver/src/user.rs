//! DevServerUser reconciliation.
//!
//! A user gets a namespace, a service account, a namespaced role allowing
//! DevServer CRUD and pod exec/port-forward, a binding of that role to both
//! the user and the service account, and an optional resource quota.
//! Objects are created when absent and replaced when their owned fields
//! drift, following the same rules as DevServer children.

use crate::backoff::{RetryConfig, retry_with_backoff};
use crate::drift::{overlay, owned_fields_match};
use crate::error::ControllerError;
use crds::{API_GROUP, DevServerUser, DevServerUserStatus};
use devserver_client::{ClientError, ClusterClientTrait, LABEL_MANAGED_BY, MANAGED_BY, ManagedObject};
use k8s_openapi::api::core::v1::{Namespace, ResourceQuota, ResourceQuotaSpec, ServiceAccount};
use k8s_openapi::api::rbac::v1::{PolicyRule, Role, RoleBinding, RoleRef, Subject};
use k8s_openapi::apimachinery::pkg::api::resource::Quantity;
use k8s_openapi::apimachinery::pkg::apis::meta::v1::{ObjectMeta, OwnerReference};
use kube::{Resource, ResourceExt};
use std::collections::BTreeMap;
use std::sync::Arc;
use tracing::{debug, info, warn};

/// Name of the per-namespace role and its binding
pub const USER_ROLE: &str = "devserver-user";

/// Name of the per-namespace quota
pub const USER_QUOTA: &str = "devserver-quota";

/// Label naming the DevServerUser an object was provisioned for
pub const LABEL_USER: &str = "devserver.io/user";

const RBAC_GROUP: &str = "rbac.authorization.k8s.io";

/// Provisions namespaces and RBAC for DevServerUsers
pub struct UserReconciler {
    client: Arc<dyn ClusterClientTrait>,
    retry: RetryConfig,
}

impl UserReconciler {
    pub fn new(client: Arc<dyn ClusterClientTrait>, retry: RetryConfig) -> Self {
        Self { client, retry }
    }

    /// Converge the objects derived from `user` and record the outcome in its status.
    pub async fn reconcile(&self, user: &DevServerUser) -> Result<DevServerUserStatus, ControllerError> {
        let name = user.name_any();
        if user.meta().deletion_timestamp.is_some() {
            debug!("DevServerUser {} is being deleted, skipping", name);
            return Ok(user.status.clone().unwrap_or_default());
        }

        let outcome = match desired_objects(user) {
            Ok(objects) => self.apply_all(objects).await,
            Err(e) => Err(e),
        };

        let status = match &outcome {
            Ok(()) => DevServerUserStatus {
                namespace: Some(user.spec.effective_namespace()),
                service_account: Some(user.spec.service_account_name()),
                error: None,
            },
            Err(e) => DevServerUserStatus {
                error: Some(e.to_string()),
                ..user.status.clone().unwrap_or_default()
            },
        };
        self.write_status(user, &status).await?;

        match outcome {
            Ok(()) => {
                info!("DevServerUser {} provisioned in namespace {}", name, user.spec.effective_namespace());
                Ok(status)
            }
            Err(e) => {
                warn!("Failed to provision DevServerUser {}: {}", name, e);
                Err(e)
            }
        }
    }

    async fn apply_all(&self, objects: Vec<ManagedObject>) -> Result<(), ControllerError> {
        for object in objects {
            self.apply(object).await?;
        }
        Ok(())
    }

    async fn apply(&self, desired: ManagedObject) -> Result<(), ControllerError> {
        let reference = desired.object_ref();
        let desired_value = desired.to_value().map_err(serialization_error)?;
        let client = self.client.clone();

        retry_with_backoff(&self.retry, &format!("provision {}", reference), || {
            let client = client.clone();
            let desired = &desired;
            let desired_value = &desired_value;
            let reference = &reference;
            async move {
                let live = client
                    .get_object(reference.kind, reference.namespace.as_deref(), &reference.name)
                    .await?;
                let Some(live) = live else {
                    client.create_object(desired).await?;
                    debug!("Created {}", reference);
                    return Ok(());
                };

                let live_value = live.to_value().map_err(serialization_error)?;
                if owned_fields_match(desired_value, &live_value) {
                    return Ok(());
                }
                let merged =
                    ManagedObject::from_value(reference.kind, overlay(desired_value, &live_value)).map_err(serialization_error)?;
                match client.replace_object(&merged).await {
                    Ok(_) => {
                        debug!("Updated {}", reference);
                        Ok(())
                    }
                    // Deleted since it was read; the next attempt recreates it
                    Err(ClientError::NotFound(msg)) => Err(ControllerError::Conflict(format!(
                        "{} disappeared during update: {}",
                        reference, msg
                    ))),
                    Err(e) => Err(e.into()),
                }
            }
        })
        .await
    }

    async fn write_status(&self, user: &DevServerUser, status: &DevServerUserStatus) -> Result<(), ControllerError> {
        if user.status.as_ref() == Some(status) {
            return Ok(());
        }
        let name = user.name_any();
        let client = self.client.clone();
        retry_with_backoff(&self.retry, &format!("update status of DevServerUser {}", name), || {
            let client = client.clone();
            let name = &name;
            async move { Ok(client.patch_user_status(name, status).await?) }
        })
        .await
    }
}

/// Objects provisioned for `user`, in creation order.
pub fn desired_objects(user: &DevServerUser) -> Result<Vec<ManagedObject>, ControllerError> {
    let spec = &user.spec;
    if spec.username.trim().is_empty() {
        return Err(ControllerError::Validation("DevServerUser username is required".to_string()));
    }
    let namespace = spec.effective_namespace();
    let service_account = spec.service_account_name();
    let labels = user_labels(&user.name_any());

    // The namespace may predate the user, so it is never owned by it
    let mut objects = vec![ManagedObject::Namespace(Namespace {
        metadata: ObjectMeta {
            name: Some(namespace.clone()),
            labels: Some(labels.clone()),
            ..Default::default()
        },
        ..Default::default()
    })];

    let meta = |name: &str| ObjectMeta {
        name: Some(name.to_string()),
        namespace: Some(namespace.clone()),
        labels: Some(labels.clone()),
        owner_references: user.controller_owner_ref(&()).map(|owner| vec![owner_reference(owner)]),
        ..Default::default()
    };

    objects.push(ManagedObject::ServiceAccount(ServiceAccount {
        metadata: meta(&service_account),
        ..Default::default()
    }));

    objects.push(ManagedObject::Role(Role {
        metadata: meta(USER_ROLE),
        rules: Some(role_rules()),
    }));

    objects.push(ManagedObject::RoleBinding(RoleBinding {
        metadata: meta(USER_ROLE),
        role_ref: RoleRef {
            api_group: RBAC_GROUP.to_string(),
            kind: "Role".to_string(),
            name: USER_ROLE.to_string(),
        },
        subjects: Some(vec![
            Subject {
                api_group: Some(RBAC_GROUP.to_string()),
                kind: "User".to_string(),
                name: spec.username.clone(),
                namespace: None,
            },
            Subject {
                api_group: None,
                kind: "ServiceAccount".to_string(),
                name: service_account.clone(),
                namespace: Some(namespace.clone()),
            },
        ]),
    }));

    if !spec.quota.is_empty() {
        let hard: BTreeMap<String, Quantity> =
            spec.quota.iter().map(|(k, v)| (k.clone(), Quantity(v.clone()))).collect();
        objects.push(ManagedObject::ResourceQuota(ResourceQuota {
            metadata: meta(USER_QUOTA),
            spec: Some(ResourceQuotaSpec {
                hard: Some(hard),
                ..Default::default()
            }),
            ..Default::default()
        }));
    }

    Ok(objects)
}

fn role_rules() -> Vec<PolicyRule> {
    let rule = |group: &str, resources: &[&str], verbs: &[&str]| PolicyRule {
        api_groups: Some(vec![group.to_string()]),
        resources: Some(resources.iter().map(|r| r.to_string()).collect()),
        verbs: verbs.iter().map(|v| v.to_string()).collect(),
        ..Default::default()
    };
    vec![
        rule(
            API_GROUP,
            &["devservers"],
            &["get", "list", "watch", "create", "update", "patch", "delete"],
        ),
        rule(API_GROUP, &["devservers/status"], &["get"]),
        rule("", &["pods", "pods/log"], &["get", "list", "watch"]),
        rule("", &["pods/exec", "pods/portforward"], &["create", "get"]),
    ]
}

fn user_labels(user: &str) -> BTreeMap<String, String> {
    BTreeMap::from([
        (LABEL_MANAGED_BY.to_string(), MANAGED_BY.to_string()),
        (LABEL_USER.to_string(), user.to_string()),
    ])
}

fn owner_reference(owner: OwnerReference) -> OwnerReference {
    OwnerReference {
        block_owner_deletion: Some(true),
        ..owner
    }
}

fn serialization_error(e: serde_json::Error) -> ControllerError {
    ControllerError::Validation(format!("object serialization failed: {}", e))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_utils::*;
    use devserver_client::{ClientError, MockClusterClient, MockOp, ObjectKind};

    fn setup() -> (Arc<MockClusterClient>, UserReconciler) {
        let mock = Arc::new(MockClusterClient::new());
        let reconciler = UserReconciler::new(mock.clone(), RetryConfig::immediate(3));
        (mock, reconciler)
    }

    #[tokio::test]
    async fn test_provisions_namespace_and_rbac() {
        let (mock, reconciler) = setup();
        let user = mock.add_user(create_test_user("alice", "alice"));

        let status = reconciler.reconcile(&user).await.unwrap();
        assert_eq!(status.namespace.as_deref(), Some("dev-alice"));
        assert_eq!(status.service_account.as_deref(), Some("alice-sa"));
        assert!(status.error.is_none());

        assert!(mock.object(ObjectKind::Namespace, None, "dev-alice").is_some());
        assert!(mock.object(ObjectKind::ServiceAccount, Some("dev-alice"), "alice-sa").is_some());
        assert!(mock.object(ObjectKind::ResourceQuota, Some("dev-alice"), USER_QUOTA).is_none());

        let Some(ManagedObject::RoleBinding(binding)) =
            mock.object(ObjectKind::RoleBinding, Some("dev-alice"), USER_ROLE)
        else {
            panic!("role binding missing");
        };
        let subjects: Vec<(String, String)> = binding
            .subjects
            .unwrap_or_default()
            .into_iter()
            .map(|s| (s.kind, s.name))
            .collect();
        assert_eq!(
            subjects,
            vec![
                ("User".to_string(), "alice".to_string()),
                ("ServiceAccount".to_string(), "alice-sa".to_string()),
            ]
        );

        let Some(ManagedObject::Role(role)) = mock.object(ObjectKind::Role, Some("dev-alice"), USER_ROLE) else {
            panic!("role missing");
        };
        let rules = role.rules.unwrap_or_default();
        assert!(rules.iter().any(|r| {
            r.resources.as_ref().is_some_and(|res| res.iter().any(|x| x == "pods/exec"))
        }));

        let stored = mock.user("alice").unwrap();
        assert_eq!(stored.status, Some(status));
    }

    #[tokio::test]
    async fn test_namespace_override_and_quota() {
        let (mock, reconciler) = setup();
        let mut user = create_test_user("bob", "bob");
        user.spec.namespace = Some("research".to_string());
        user.spec.quota = map(&[("requests.cpu", "8"), ("requests.memory", "32Gi")]);
        let user = mock.add_user(user);

        reconciler.reconcile(&user).await.unwrap();

        let Some(ManagedObject::ResourceQuota(quota)) =
            mock.object(ObjectKind::ResourceQuota, Some("research"), USER_QUOTA)
        else {
            panic!("quota missing");
        };
        let hard = quota.spec.and_then(|s| s.hard).unwrap_or_default();
        assert_eq!(hard.get("requests.cpu"), Some(&Quantity("8".to_string())));
        assert!(mock.object(ObjectKind::Namespace, None, "dev-bob").is_none());
    }

    #[tokio::test]
    async fn test_second_pass_writes_nothing() {
        let (mock, reconciler) = setup();
        let user = mock.add_user(create_test_user("alice", "alice"));
        reconciler.reconcile(&user).await.unwrap();
        let user = mock.user("alice").unwrap();
        mock.reset_counters();

        reconciler.reconcile(&user).await.unwrap();

        let counters = mock.counters();
        assert_eq!(counters.object_creates, 0);
        assert_eq!(counters.object_replaces, 0);
    }

    #[tokio::test]
    async fn test_quota_drift_is_restored() {
        let (mock, reconciler) = setup();
        let mut user = create_test_user("alice", "alice");
        user.spec.quota = map(&[("requests.cpu", "8")]);
        let user = mock.add_user(user);
        reconciler.reconcile(&user).await.unwrap();

        mock.edit_object(ObjectKind::ResourceQuota, Some("dev-alice"), USER_QUOTA, |object| {
            if let ManagedObject::ResourceQuota(quota) = object {
                quota.spec = Some(ResourceQuotaSpec {
                    hard: Some(BTreeMap::from([("requests.cpu".to_string(), Quantity("64".to_string()))])),
                    ..Default::default()
                });
            }
        });
        mock.reset_counters();

        reconciler.reconcile(&mock.user("alice").unwrap()).await.unwrap();

        assert_eq!(mock.counters().object_replaces, 1);
        let Some(ManagedObject::ResourceQuota(quota)) =
            mock.object(ObjectKind::ResourceQuota, Some("dev-alice"), USER_QUOTA)
        else {
            panic!("quota missing");
        };
        let hard = quota.spec.and_then(|s| s.hard).unwrap_or_default();
        assert_eq!(hard.get("requests.cpu"), Some(&Quantity("8".to_string())));
    }

    #[tokio::test]
    async fn test_failure_is_recorded_in_status() {
        let (mock, reconciler) = setup();
        let user = mock.add_user(create_test_user("alice", "alice"));
        for _ in 0..3 {
            mock.fail_next(MockOp::CreateObject, ClientError::Transient("apiserver unavailable".to_string()));
        }

        let err = reconciler.reconcile(&user).await.unwrap_err();
        assert!(err.is_retryable());
        let status = mock.user("alice").unwrap().status.unwrap();
        assert!(status.error.unwrap().contains("apiserver unavailable"));
        assert!(status.namespace.is_none());
    }

    #[test]
    fn test_empty_username_is_rejected() {
        let user = create_test_user("nobody", "");
        assert!(matches!(desired_objects(&user), Err(ControllerError::Validation(_))));
    }

    #[test]
    fn test_namespace_is_not_owned_by_the_user() {
        let mut user = create_test_user("alice", "alice");
        user.metadata.uid = Some("uid-user-alice".to_string());
        let objects = desired_objects(&user).unwrap();
        assert!(objects[0].metadata().owner_references.is_none());
        for object in &objects[1..] {
            let owners = object.metadata().owner_references.clone().unwrap_or_default();
            assert_eq!(owners.len(), 1);
            assert_eq!(owners[0].uid, "uid-user-alice");
        }
    }
}
