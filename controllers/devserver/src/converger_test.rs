//! Unit tests for DevServer convergence

#[cfg(test)]
mod tests {
    use super::super::*;
    use crate::test_utils::*;
    use chrono::TimeZone;
    use crds::DevServerMode;
    use devserver_client::{MockClusterClient, MockOp};
    use k8s_openapi::api::core::v1::{ConfigMap, PersistentVolumeClaim};
    use k8s_openapi::apimachinery::pkg::api::resource::Quantity;
    use k8s_openapi::apimachinery::pkg::apis::meta::v1::{ObjectMeta, OwnerReference};

    fn setup(posting: bool) -> (Arc<MockClusterClient>, Converger) {
        let mock = mock_with_flavors(vec![create_test_flavor("small", "1", "1Gi", true)]);
        let client: Arc<dyn ClusterClientTrait> = mock.clone();
        let events = EventPublisher::new(client.clone(), posting);
        let retry = RetryConfig::immediate(3);
        let resolver = FlavorResolver::new(client.clone(), events.clone(), retry.clone());
        let converger = Converger::new(client, Arc::new(test_config()), resolver, events, retry);
        (mock, converger)
    }

    fn stored(mock: &MockClusterClient, name: &str) -> DevServer {
        mock.devserver(TEST_NAMESPACE, name).unwrap()
    }

    fn stateful_set(mock: &MockClusterClient, name: &str) -> StatefulSet {
        match mock.object(ObjectKind::StatefulSet, Some(TEST_NAMESPACE), name) {
            Some(ManagedObject::StatefulSet(sts)) => sts,
            other => panic!("expected StatefulSet, got {:?}", other),
        }
    }

    fn image(sts: &StatefulSet) -> Option<String> {
        sts.spec
            .as_ref()
            .and_then(|s| s.template.spec.as_ref())
            .and_then(|p| p.containers[0].image.clone())
    }

    fn condition<'a>(status: &'a DevServerStatus, type_: &str) -> &'a DevServerCondition {
        status.conditions.iter().find(|c| c.type_ == type_).unwrap()
    }

    #[tokio::test]
    async fn test_first_pass_creates_every_child() {
        let (mock, converger) = setup(false);
        let devserver = mock.add_devserver(create_test_devserver("scratch"));

        let result = converger.converge(&devserver).await.unwrap();

        let mut kinds: Vec<ObjectKind> = result.created.iter().map(|r| r.kind).collect();
        kinds.sort();
        assert_eq!(
            kinds,
            vec![
                ObjectKind::Secret,
                ObjectKind::ConfigMap,
                ObjectKind::StatefulSet,
                ObjectKind::Service,
                ObjectKind::Service
            ]
        );
        assert_eq!(mock.counters().object_creates, 5);
        assert_eq!(mock.counters().object_replaces, 0);
        assert_eq!(result.phase, DevServerPhase::Pending);

        let status = stored(&mock, "scratch").status.unwrap();
        assert_eq!(status.phase, DevServerPhase::Pending);
        assert_eq!(status.observed_generation, Some(1));
        assert_eq!(condition(&status, CONDITION_RECONCILED).status, ConditionStatus::True);
        assert_eq!(condition(&status, CONDITION_READY).status, ConditionStatus::False);
    }

    #[tokio::test]
    async fn test_second_pass_writes_nothing() {
        let (mock, converger) = setup(false);
        let devserver = mock.add_devserver(create_test_devserver("scratch"));
        converger.converge(&devserver).await.unwrap();
        mock.reset_counters();

        let result = converger.converge(&stored(&mock, "scratch")).await.unwrap();

        assert!(result.created.is_empty());
        assert!(result.updated.is_empty());
        assert!(!result.status_written);
        assert_eq!(mock.counters(), Default::default());
    }

    #[tokio::test]
    async fn test_external_image_edit_is_restored() {
        let (mock, converger) = setup(false);
        let devserver = mock.add_devserver(create_test_devserver("scratch"));
        converger.converge(&devserver).await.unwrap();

        mock.edit_object(ObjectKind::StatefulSet, Some(TEST_NAMESPACE), "scratch", |object| {
            if let ManagedObject::StatefulSet(sts) = object {
                let spec = sts.spec.as_mut().unwrap();
                spec.revision_history_limit = Some(4);
                spec.template.spec.as_mut().unwrap().containers[0].image = Some("rogue:1".to_string());
            }
        });
        mock.reset_counters();

        let result = converger.converge(&stored(&mock, "scratch")).await.unwrap();

        assert_eq!(
            result.updated,
            vec![ObjectRef::new(ObjectKind::StatefulSet, Some(TEST_NAMESPACE), "scratch")]
        );
        assert_eq!(mock.counters().object_replaces, 1);
        let sts = stateful_set(&mock, "scratch");
        assert_eq!(image(&sts).as_deref(), Some("devserver-base:test"));
        assert_eq!(sts.spec.unwrap().revision_history_limit, Some(4));
    }

    #[tokio::test]
    async fn test_equivalent_quantity_notation_is_not_drift() {
        let (mock, converger) = setup(false);
        let devserver = mock.add_devserver(create_test_devserver("scratch"));
        converger.converge(&devserver).await.unwrap();

        // The API server stores quantities in canonical form
        mock.edit_object(ObjectKind::StatefulSet, Some(TEST_NAMESPACE), "scratch", |object| {
            if let ManagedObject::StatefulSet(sts) = object {
                let container = &mut sts.spec.as_mut().unwrap().template.spec.as_mut().unwrap().containers[0];
                let resources = container.resources.as_mut().unwrap();
                resources
                    .requests
                    .as_mut()
                    .unwrap()
                    .insert("memory".to_string(), Quantity("1024Mi".to_string()));
            }
        });
        mock.reset_counters();

        converger.converge(&stored(&mock, "scratch")).await.unwrap();
        assert_eq!(mock.counters().object_replaces, 0);
    }

    #[tokio::test]
    async fn test_host_keys_are_never_regenerated() {
        let (mock, converger) = setup(false);
        let devserver = mock.add_devserver(create_test_devserver("scratch"));
        converger.converge(&devserver).await.unwrap();
        let keys = mock.object(ObjectKind::Secret, Some(TEST_NAMESPACE), "scratch-host-keys");
        assert!(keys.is_some());

        let mut changed = stored(&mock, "scratch");
        changed.spec.image = Some("custom:1".to_string());
        mock.reset_counters();
        converger.converge(&changed).await.unwrap();

        assert_eq!(mock.counters().object_creates, 0);
        assert_eq!(mock.counters().object_replaces, 1);
        assert_eq!(mock.object(ObjectKind::Secret, Some(TEST_NAMESPACE), "scratch-host-keys"), keys);
        assert_eq!(image(&stateful_set(&mock, "scratch")).as_deref(), Some("custom:1"));
    }

    #[tokio::test]
    async fn test_validation_error_marks_failed_until_spec_changes() {
        let (mock, converger) = setup(true);
        let mut devserver = create_test_devserver("broken");
        devserver.spec.mode = DevServerMode::Distributed;
        let devserver = mock.add_devserver(devserver);

        let err = converger.converge(&devserver).await.unwrap_err();
        assert!(matches!(err, ControllerError::Validation(_)));
        assert!(mock.objects().is_empty());

        let status = stored(&mock, "broken").status.unwrap();
        assert_eq!(status.phase, DevServerPhase::Failed);
        let reconciled = condition(&status, CONDITION_RECONCILED);
        assert_eq!(reconciled.status, ConditionStatus::False);
        assert_eq!(reconciled.reason, "ValidationError");
        assert!(mock.events().iter().any(|(_, e)| e.reason == "ReconcileFailed"));

        // Same generation again: left alone
        mock.reset_counters();
        let result = converger.converge(&stored(&mock, "broken")).await.unwrap();
        assert!(result.skipped);
        assert_eq!(mock.counters(), Default::default());
    }

    #[tokio::test]
    async fn test_missing_flavor_marks_failed() {
        let (mock, converger) = setup(false);
        let mut devserver = create_test_devserver("scratch");
        devserver.spec.flavor = Some("huge".to_string());
        let devserver = mock.add_devserver(devserver);

        let err = converger.converge(&devserver).await.unwrap_err();
        assert!(err.is_terminal());
        let status = stored(&mock, "scratch").status.unwrap();
        assert_eq!(status.phase, DevServerPhase::Failed);
        assert_eq!(condition(&status, CONDITION_RECONCILED).reason, "NotFound");
    }

    #[tokio::test]
    async fn test_ready_workload_reports_running() {
        let (mock, converger) = setup(false);
        let devserver = mock.add_devserver(create_test_devserver("scratch"));
        converger.converge(&devserver).await.unwrap();

        mock.set_statefulset_ready(TEST_NAMESPACE, "scratch", 1);
        mock.reset_counters();
        let result = converger.converge(&stored(&mock, "scratch")).await.unwrap();

        assert_eq!(result.phase, DevServerPhase::Running);
        assert_eq!(mock.counters().object_replaces, 0);
        let status = stored(&mock, "scratch").status.unwrap();
        assert_eq!(status.phase, DevServerPhase::Running);
        assert_eq!(condition(&status, CONDITION_READY).status, ConditionStatus::True);
    }

    #[tokio::test]
    async fn test_conflicting_replace_is_retried_with_a_fresh_read() {
        let (mock, converger) = setup(false);
        let devserver = mock.add_devserver(create_test_devserver("scratch"));
        converger.converge(&devserver).await.unwrap();

        mock.edit_object(ObjectKind::StatefulSet, Some(TEST_NAMESPACE), "scratch", |object| {
            if let ManagedObject::StatefulSet(sts) = object {
                sts.spec.as_mut().unwrap().template.spec.as_mut().unwrap().containers[0].image =
                    Some("rogue:1".to_string());
            }
        });
        mock.fail_next(MockOp::ReplaceObject, ClientError::Conflict("stale".to_string()));
        mock.reset_counters();

        converger.converge(&stored(&mock, "scratch")).await.unwrap();
        assert_eq!(mock.counters().object_replaces, 1);
        assert_eq!(image(&stateful_set(&mock, "scratch")).as_deref(), Some("devserver-base:test"));
    }

    #[tokio::test]
    async fn test_exhausted_retries_surface_in_a_condition() {
        let (mock, converger) = setup(false);
        let devserver = mock.add_devserver(create_test_devserver("scratch"));
        for _ in 0..3 {
            mock.fail_next(MockOp::CreateObject, ClientError::Transient("etcd timeout".to_string()));
        }

        let err = converger.converge(&devserver).await.unwrap_err();
        assert!(err.is_retryable());

        let status = stored(&mock, "scratch").status.unwrap();
        assert_eq!(status.phase, DevServerPhase::Pending);
        let reconciled = condition(&status, CONDITION_RECONCILED);
        assert_eq!(reconciled.status, ConditionStatus::Unknown);
        assert_eq!(reconciled.reason, "TransientAPIError");
    }

    #[tokio::test]
    async fn test_deleting_devserver_keeps_user_claims() {
        let (mock, converger) = setup(false);
        mock.add_object(ManagedObject::PersistentVolumeClaim(PersistentVolumeClaim {
            metadata: ObjectMeta {
                name: Some("datasets".to_string()),
                namespace: Some(TEST_NAMESPACE.to_string()),
                ..Default::default()
            },
            ..Default::default()
        }));
        let mut devserver = create_test_devserver("scratch");
        devserver.spec.volumes = vec![volume("datasets", "/data")];
        let devserver = mock.add_devserver(devserver);
        converger.converge(&devserver).await.unwrap();
        assert_eq!(mock.objects().len(), 6);

        mock.delete_devserver(TEST_NAMESPACE, "scratch").await.unwrap();

        let remaining: Vec<ObjectRef> = mock.objects().iter().map(ManagedObject::object_ref).collect();
        assert_eq!(
            remaining,
            vec![ObjectRef::new(ObjectKind::PersistentVolumeClaim, Some(TEST_NAMESPACE), "datasets")]
        );
    }

    #[tokio::test]
    async fn test_deleting_and_expired_devservers_are_skipped() {
        let (mock, converger) = setup(false);
        let mut deleting = create_test_devserver("going");
        deleting.metadata.deletion_timestamp = crds::time::from_chrono(Utc::now());
        let mut expired = create_test_devserver("done");
        expired.status = Some(DevServerStatus {
            phase: DevServerPhase::Expired,
            ..Default::default()
        });

        assert!(converger.converge(&deleting).await.unwrap().skipped);
        assert!(converger.converge(&expired).await.unwrap().skipped);
        assert_eq!(mock.counters(), Default::default());
    }

    #[tokio::test]
    async fn test_deletion_in_progress_is_reported_as_deleting() {
        let (mock, converger) = setup(false);
        let devserver = mock.add_devserver(create_test_devserver("going"));
        converger.converge(&devserver).await.unwrap();

        let mut deleting = stored(&mock, "going");
        deleting.metadata.deletion_timestamp = crds::time::from_chrono(Utc::now());
        let deleting = mock.add_devserver(deleting);
        mock.reset_counters();

        let result = converger.converge(&deleting).await.unwrap();
        assert!(result.skipped);
        assert!(result.status_written);
        assert_eq!(result.phase, DevServerPhase::Deleting);
        assert_eq!(stored(&mock, "going").status.unwrap().phase, DevServerPhase::Deleting);
        assert_eq!(mock.counters().object_creates + mock.counters().object_replaces, 0);

        let again = converger.converge(&stored(&mock, "going")).await.unwrap();
        assert!(!again.status_written);
        assert_eq!(mock.counters().devserver_status_patches, 1);
    }

    #[tokio::test]
    async fn test_child_deleted_during_update_is_recreated_not_failed() {
        let (mock, converger) = setup(false);
        let devserver = mock.add_devserver(create_test_devserver("scratch"));
        converger.converge(&devserver).await.unwrap();

        mock.edit_object(ObjectKind::StatefulSet, Some(TEST_NAMESPACE), "scratch", |object| {
            if let ManagedObject::StatefulSet(sts) = object {
                sts.spec.as_mut().unwrap().template.spec.as_mut().unwrap().containers[0].image =
                    Some("rogue:1".to_string());
            }
        });
        mock.fail_next(MockOp::ReplaceObject, ClientError::NotFound("statefulset scratch".to_string()));

        let result = converger.converge(&stored(&mock, "scratch")).await.unwrap();
        assert_ne!(result.phase, DevServerPhase::Failed);
        assert_ne!(stored(&mock, "scratch").status.unwrap().phase, DevServerPhase::Failed);
        assert_eq!(image(&stateful_set(&mock, "scratch")).as_deref(), Some("devserver-base:test"));
    }

    #[tokio::test]
    async fn test_created_event_is_posted_once() {
        let (mock, converger) = setup(true);
        let devserver = mock.add_devserver(create_test_devserver("scratch"));
        converger.converge(&devserver).await.unwrap();
        converger.converge(&stored(&mock, "scratch")).await.unwrap();

        let created: Vec<_> = mock.events().into_iter().filter(|(_, e)| e.reason == "Created").collect();
        assert_eq!(created.len(), 1);
        assert_eq!(created[0].0.name.as_deref(), Some("scratch"));
    }

    #[tokio::test]
    async fn test_object_controlled_by_another_owner_is_not_adopted() {
        let (mock, converger) = setup(false);
        mock.add_object(ManagedObject::ConfigMap(ConfigMap {
            metadata: ObjectMeta {
                name: Some("scratch-sshd-config".to_string()),
                namespace: Some(TEST_NAMESPACE.to_string()),
                owner_references: Some(vec![OwnerReference {
                    api_version: "devserver.io/v1".to_string(),
                    kind: "DevServer".to_string(),
                    name: "scratch".to_string(),
                    uid: "uid-previous".to_string(),
                    controller: Some(true),
                    block_owner_deletion: Some(true),
                }]),
                ..Default::default()
            },
            ..Default::default()
        }));
        let devserver = mock.add_devserver(create_test_devserver("scratch"));

        let err = converger.converge(&devserver).await.unwrap_err();
        assert!(err.is_retryable());
        assert!(mock.object(ObjectKind::StatefulSet, Some(TEST_NAMESPACE), "scratch").is_none());
    }

    #[test]
    fn test_condition_transition_time_moves_only_on_change() {
        let t0 = Utc.with_ymd_and_hms(2025, 1, 1, 0, 0, 0).unwrap();
        let t1 = Utc.with_ymd_and_hms(2025, 1, 1, 1, 0, 0).unwrap();

        let pending = converged_status(None, Some(1), false, t0);
        let again = converged_status(Some(&pending), Some(1), false, t1);
        assert_eq!(pending, again);

        let running = converged_status(Some(&again), Some(1), true, t1);
        assert_eq!(condition(&running, CONDITION_READY).last_transition_time, Some(t1));
        assert_eq!(condition(&running, CONDITION_RECONCILED).last_transition_time, Some(t0));
    }
}
