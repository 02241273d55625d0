mod common;

use std::sync::Arc;

use common::fast_config;
use kernelmux_client::{
    ClientError, ConnectionState, ExecutionState, KernelClientRegistry, KernelConnector,
    KernelEvent, Result, StubKernel,
};

fn registry_for(stub: &StubKernel) -> KernelClientRegistry {
    let stub = stub.clone();
    let factory = move |_kernel_id: &str| -> Result<Arc<dyn KernelConnector>> {
        Ok(stub.connector())
    };
    KernelClientRegistry::new(Arc::new(factory), fast_config()).unwrap()
}

#[tokio::test]
async fn get_or_create_returns_one_client_per_kernel() {
    let stub = StubKernel::new();
    let registry = registry_for(&stub);
    assert!(registry.is_empty());

    let first = registry.get_or_create("k1").unwrap();
    let again = registry.get_or_create("k1").unwrap();
    assert!(Arc::ptr_eq(&first, &again));
    assert_eq!(first.kernel_id(), "k1");

    registry.get_or_create("k0").unwrap();
    assert_eq!(registry.kernel_ids(), ["k0", "k1"]);
    assert!(registry.contains("k0"));
    assert!(registry.get("missing").is_none());
    assert_eq!(first.connection_state(), ConnectionState::Disconnected);

    registry.shutdown_all().await;
    assert!(registry.is_empty());
    assert_eq!(first.execution_state(), ExecutionState::Dead);
}

#[tokio::test]
async fn connect_requires_a_registered_kernel() {
    let stub = StubKernel::new();
    let registry = registry_for(&stub);

    assert_eq!(
        registry.connect("nope").await,
        Err(ClientError::UnknownKernel("nope".into()))
    );

    registry.get_or_create("k1").unwrap();
    registry.connect("k1").await.unwrap();
    assert!(registry.get("k1").unwrap().is_available());

    registry.shutdown_all().await;
}

#[tokio::test]
async fn lifecycle_events_create_reset_and_remove() {
    let stub = StubKernel::new();
    let registry = registry_for(&stub);

    registry
        .handle_event(KernelEvent::Started("k2".into()))
        .await
        .unwrap();
    let client = registry.get("k2").unwrap();
    assert_eq!(client.connection_state(), ConnectionState::Ready);

    registry
        .handle_event(KernelEvent::Restarted("k2".into()))
        .await
        .unwrap();
    assert!(client.activity().last_shell_status.is_none());
    assert_eq!(
        registry
            .handle_event(KernelEvent::Restarted("other".into()))
            .await,
        Err(ClientError::UnknownKernel("other".into()))
    );

    registry
        .handle_event(KernelEvent::Shutdown("k2".into()))
        .await
        .unwrap();
    assert!(!registry.contains("k2"));
    assert_eq!(client.connection_state(), ConnectionState::Disconnected);
    assert_eq!(client.execution_state(), ExecutionState::Dead);
    assert!(!registry.remove("k2").await);
}
