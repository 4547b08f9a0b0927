//! Tests for the broker controller

mod common;

use common::*;
use ism_operator::broker_controller::BrokerReconciler;
use ism_operator::crd::{
    Broker, BrokerService, BrokerServicePlan, BrokerState, ServiceInstance, BROKER_FINALIZER,
    BROKER_NAME_LABEL, SERVICE_ID_LABEL,
};
use ism_operator::error::OperatorError;
use ism_operator::osb::{Catalog, CatalogService};
use ism_operator::runtime::Reconciler;
use ism_operator::store::{has_finalizer, owned_by, ListFilter, ObjectStore, StoreOperation};
use kube::ResourceExt;
use std::time::Duration;

async fn services(h: &Harness) -> Vec<BrokerService> {
    h.store
        .list::<BrokerService>(Some(NAMESPACE), &ListFilter::new())
        .await
        .unwrap()
}

async fn plans(h: &Harness) -> Vec<BrokerServicePlan> {
    h.store
        .list::<BrokerServicePlan>(Some(NAMESPACE), &ListFilter::new())
        .await
        .unwrap()
}

// ==================== Registration Tests ====================

#[tokio::test]
async fn test_catalog_materialization() {
    let h = Harness::new();
    let reconciler = BrokerReconciler::new(h.context());
    let created = h.store.create(&broker("b1")).await.unwrap();

    reconciler
        .reconcile(&key("b1"), &h.reconcile_context())
        .await
        .unwrap();

    let b1: Broker = h.get("b1").await.unwrap();
    assert_eq!(b1.state(), BrokerState::Registered);
    assert_eq!(b1.status.as_ref().unwrap().message, "broker registered");
    assert!(has_finalizer(&b1, BROKER_FINALIZER));

    let services = services(&h).await;
    assert_eq!(services.len(), 1);
    let s1 = &services[0];
    assert_eq!(s1.name_any(), "s1");
    assert_eq!(s1.spec.name, "svc");
    assert_eq!(s1.spec.broker_name, "b1");
    assert!(owned_by(s1, created.uid().as_deref().unwrap()));
    assert_eq!(
        s1.labels().get(BROKER_NAME_LABEL).map(String::as_str),
        Some("b1")
    );

    let plans = plans(&h).await;
    let names: Vec<String> = plans.iter().map(|p| p.name_any()).collect();
    assert_eq!(names, vec!["b1.s1.p1", "b1.s1.p2"]);
    for plan in &plans {
        assert!(owned_by(plan, s1.uid().as_deref().unwrap()));
        assert_eq!(
            plan.labels().get(SERVICE_ID_LABEL).map(String::as_str),
            Some("s1")
        );
    }
    assert_eq!(plans[0].spec.name, "small");
    assert_eq!(plans[1].spec.name, "big");

    assert_eq!(h.broker.catalog_calls(), 1);
    assert_eq!(h.broker.configs(), vec!["b1".to_string()]);
}

#[tokio::test]
async fn test_registered_broker_makes_no_calls() {
    let h = Harness::new();
    let reconciler = BrokerReconciler::new(h.context());
    h.store.create(&broker("b1")).await.unwrap();

    for _ in 0..3 {
        reconciler
            .reconcile(&key("b1"), &h.reconcile_context())
            .await
            .unwrap();
    }

    assert_eq!(h.broker.catalog_calls(), 1);
    assert_eq!(h.broker.configs().len(), 1);
}

#[tokio::test]
async fn test_observed_generation_tracks_generation() {
    let h = Harness::new();
    let reconciler = BrokerReconciler::new(h.context());
    h.store.create(&broker("b1")).await.unwrap();

    reconciler
        .reconcile(&key("b1"), &h.reconcile_context())
        .await
        .unwrap();

    let b1: Broker = h.get("b1").await.unwrap();
    assert_eq!(b1.observed_generation(), b1.metadata.generation);
}

#[tokio::test]
async fn test_missing_broker_is_success() {
    let h = Harness::new();
    let reconciler = BrokerReconciler::new(h.context());

    let action = reconciler
        .reconcile(&key("ghost"), &h.reconcile_context())
        .await
        .unwrap();

    assert_eq!(action.requeue_after(), None);
    assert!(h.broker.calls().is_empty());
}

#[tokio::test]
async fn test_catalog_failure_marks_registration_failed() {
    let h = Harness::new();
    let reconciler = BrokerReconciler::new(h.context());
    h.store.create(&broker("b1")).await.unwrap();
    h.broker.fail_catalog(status_error(401, "bad credentials"));

    let err = reconciler
        .reconcile(&key("b1"), &h.reconcile_context())
        .await
        .unwrap_err();
    assert!(matches!(err, OperatorError::Broker(_)));

    let b1: Broker = h.get("b1").await.unwrap();
    assert_eq!(b1.state(), BrokerState::RegistrationFailed);
    assert!(b1.status.as_ref().unwrap().message.contains("bad credentials"));
    assert!(services(&h).await.is_empty());
    assert!(plans(&h).await.is_empty());

    // The retry succeeds once the broker answers
    reconciler
        .reconcile(&key("b1"), &h.reconcile_context())
        .await
        .unwrap();
    let b1: Broker = h.get("b1").await.unwrap();
    assert_eq!(b1.state(), BrokerState::Registered);
    assert_eq!(h.broker.catalog_calls(), 2);
}

#[tokio::test]
async fn test_duplicate_service_id_fails_registration() {
    let h = Harness::new();
    let reconciler = BrokerReconciler::new(h.context());
    h.store.create(&broker("b1")).await.unwrap();

    let first = scenario_catalog().services.remove(0);
    let second = CatalogService {
        name: "other".to_string(),
        plans: vec![plan("p9", "huge")],
        ..first.clone()
    };
    h.broker.set_catalog(Catalog {
        services: vec![first, second],
    });

    let err = reconciler
        .reconcile(&key("b1"), &h.reconcile_context())
        .await
        .unwrap_err();
    assert!(matches!(err, OperatorError::DuplicateService(ref id) if id == "s1"));

    let b1: Broker = h.get("b1").await.unwrap();
    assert_eq!(b1.state(), BrokerState::RegistrationFailed);

    // First occurrence wins
    let services = services(&h).await;
    assert_eq!(services.len(), 1);
    assert_eq!(services[0].spec.name, "svc");
    assert_eq!(plans(&h).await.len(), 2);
}

#[tokio::test]
async fn test_invalid_spec_is_not_retried() {
    let h = Harness::new();
    let reconciler = BrokerReconciler::new(h.context());
    let mut invalid = broker("b1");
    invalid.spec.url = "not a url".to_string();
    h.store.create(&invalid).await.unwrap();

    reconciler
        .reconcile(&key("b1"), &h.reconcile_context())
        .await
        .unwrap();

    let b1: Broker = h.get("b1").await.unwrap();
    assert_eq!(b1.state(), BrokerState::RegistrationFailed);
    assert!(b1.status.unwrap().message.contains("url"));
    assert!(h.broker.calls().is_empty());
}

// ==================== Idempotency Tests ====================

#[tokio::test]
async fn test_crash_after_service_create_converges() {
    let h = Harness::new();
    let reconciler = BrokerReconciler::new(h.context());
    h.store.create(&broker("b1")).await.unwrap();
    h.store.crash_after_next("BrokerService", StoreOperation::Create);

    assert!(reconciler
        .reconcile(&key("b1"), &h.reconcile_context())
        .await
        .is_err());
    assert_eq!(services(&h).await.len(), 1);
    assert!(plans(&h).await.is_empty());

    reconciler
        .reconcile(&key("b1"), &h.reconcile_context())
        .await
        .unwrap();

    assert_eq!(services(&h).await.len(), 1);
    assert_eq!(plans(&h).await.len(), 2);
    let b1: Broker = h.get("b1").await.unwrap();
    assert_eq!(b1.state(), BrokerState::Registered);
}

#[tokio::test]
async fn test_crash_after_plan_create_converges() {
    let h = Harness::new();
    let reconciler = BrokerReconciler::new(h.context());
    h.store.create(&broker("b1")).await.unwrap();
    h.store.crash_after_next("BrokerServicePlan", StoreOperation::Create);

    assert!(reconciler
        .reconcile(&key("b1"), &h.reconcile_context())
        .await
        .is_err());
    assert_eq!(plans(&h).await.len(), 1);

    reconciler
        .reconcile(&key("b1"), &h.reconcile_context())
        .await
        .unwrap();
    assert_eq!(plans(&h).await.len(), 2);
}

#[tokio::test]
async fn test_status_write_failure_is_retried() {
    let h = Harness::new();
    let reconciler = BrokerReconciler::new(h.context());
    h.store.create(&broker("b1")).await.unwrap();
    h.store.fail_next("Broker", StoreOperation::UpdateStatus);

    assert!(reconciler
        .reconcile(&key("b1"), &h.reconcile_context())
        .await
        .is_err());
    let b1: Broker = h.get("b1").await.unwrap();
    assert_eq!(b1.state(), BrokerState::Pending);

    reconciler
        .reconcile(&key("b1"), &h.reconcile_context())
        .await
        .unwrap();
    let b1: Broker = h.get("b1").await.unwrap();
    assert_eq!(b1.state(), BrokerState::Registered);
    assert_eq!(services(&h).await.len(), 1);
    assert_eq!(plans(&h).await.len(), 2);
}

// ==================== Deletion Tests ====================

#[tokio::test]
async fn test_delete_cascades_catalog_records() {
    let h = Harness::new();
    let reconciler = BrokerReconciler::new(h.context());
    h.store.create(&broker("b1")).await.unwrap();
    reconciler
        .reconcile(&key("b1"), &h.reconcile_context())
        .await
        .unwrap();

    h.store.delete::<Broker>(NAMESPACE, "b1").await.unwrap();
    // The finalizer holds the record until the controller releases it
    assert!(h.get::<Broker>("b1").await.is_some());

    reconciler
        .reconcile(&key("b1"), &h.reconcile_context())
        .await
        .unwrap();

    assert!(h.get::<Broker>("b1").await.is_none());
    assert!(services(&h).await.is_empty());
    assert!(plans(&h).await.is_empty());
    assert!(h.broker.deprovisions().is_empty());
    assert!(h.broker.unbinds().is_empty());
}

#[tokio::test]
async fn test_delete_blocked_by_instances() {
    let h = Harness::new();
    let reconciler = BrokerReconciler::new(h.context());
    h.store.create(&broker("b1")).await.unwrap();
    reconciler
        .reconcile(&key("b1"), &h.reconcile_context())
        .await
        .unwrap();
    h.store.create(&instance("i1", "b1")).await.unwrap();

    h.store.delete::<Broker>(NAMESPACE, "b1").await.unwrap();
    let err = reconciler
        .reconcile(&key("b1"), &h.reconcile_context())
        .await
        .unwrap_err();
    assert!(matches!(err, OperatorError::DeletionBlocked(_)));
    assert_eq!(err.requeue_delay(), Some(Duration::from_secs(30)));

    let b1: Broker = h.get("b1").await.unwrap();
    assert!(b1.status.unwrap().message.contains("i1"));
    assert_eq!(services(&h).await.len(), 1);

    h.store
        .delete::<ServiceInstance>(NAMESPACE, "i1")
        .await
        .unwrap();
    reconciler
        .reconcile(&key("b1"), &h.reconcile_context())
        .await
        .unwrap();
    assert!(h.get::<Broker>("b1").await.is_none());
    assert!(services(&h).await.is_empty());
}

#[tokio::test]
async fn test_instances_of_other_brokers_do_not_block() {
    let h = Harness::new();
    let reconciler = BrokerReconciler::new(h.context());
    h.store.create(&broker("b1")).await.unwrap();
    h.store.create(&instance("i2", "b2")).await.unwrap();
    reconciler
        .reconcile(&key("b1"), &h.reconcile_context())
        .await
        .unwrap();

    h.store.delete::<Broker>(NAMESPACE, "b1").await.unwrap();
    reconciler
        .reconcile(&key("b1"), &h.reconcile_context())
        .await
        .unwrap();
    assert!(h.get::<Broker>("b1").await.is_none());
}

#[tokio::test]
async fn test_shared_service_survives_deletion_of_one_broker() {
    let h = Harness::new();
    let reconciler = BrokerReconciler::new(h.context());
    let b1 = h.store.create(&broker("b1")).await.unwrap();
    let b2 = h.store.create(&broker("b2")).await.unwrap();
    for name in ["b1", "b2"] {
        reconciler
            .reconcile(&key(name), &h.reconcile_context())
            .await
            .unwrap();
    }

    let s1: BrokerService = h.get("s1").await.unwrap();
    assert!(owned_by(&s1, b1.uid().as_deref().unwrap()));
    assert!(owned_by(&s1, b2.uid().as_deref().unwrap()));
    assert_eq!(plans(&h).await.len(), 4);

    h.store.delete::<Broker>(NAMESPACE, "b1").await.unwrap();
    reconciler
        .reconcile(&key("b1"), &h.reconcile_context())
        .await
        .unwrap();
    assert!(h.get::<Broker>("b1").await.is_none());

    let s1: BrokerService = h.get("s1").await.unwrap();
    assert!(!owned_by(&s1, b1.uid().as_deref().unwrap()));
    assert!(owned_by(&s1, b2.uid().as_deref().unwrap()));
    let names: Vec<String> = plans(&h).await.iter().map(|p| p.name_any()).collect();
    assert_eq!(names, vec!["b2.s1.p1", "b2.s1.p2"]);

    h.store.delete::<Broker>(NAMESPACE, "b2").await.unwrap();
    reconciler
        .reconcile(&key("b2"), &h.reconcile_context())
        .await
        .unwrap();
    assert!(services(&h).await.is_empty());
    assert!(plans(&h).await.is_empty());
}

#[tokio::test]
async fn test_shutdown_stops_before_broker_calls() {
    let h = Harness::new();
    let reconciler = BrokerReconciler::new(h.context());
    h.store.create(&broker("b1")).await.unwrap();
    h.shutdown();

    let err = reconciler
        .reconcile(&key("b1"), &h.reconcile_context())
        .await
        .unwrap_err();
    assert!(matches!(err, OperatorError::ShuttingDown));
    assert!(h.broker.calls().is_empty());
}
