/// Shared fixtures for session-level tests
use std::sync::Arc;

use crate::broker::replay::ReplayGateway;
use crate::session::IbSession;
use crate::types::RequestConfig;

/// Session connected to `gateway` with its dispatch loop running
pub(crate) async fn connected_session(gateway: ReplayGateway) -> (Arc<IbSession>, Arc<ReplayGateway>) {
    connected_session_with(gateway, RequestConfig::default()).await
}

pub(crate) async fn connected_session_with(
    gateway: ReplayGateway,
    config: RequestConfig,
) -> (Arc<IbSession>, Arc<ReplayGateway>) {
    let gateway = Arc::new(gateway);
    let session = Arc::new(IbSession::new(gateway.clone(), config).unwrap());

    session.connect("localhost", 4002, 1).await.unwrap();
    session.spawn_event_loop().await.unwrap();

    (session, gateway)
}
