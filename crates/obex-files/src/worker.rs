//! Storage worker task.

use crate::store::FsStore;
use obex_core::StorageRequest;
use obex_core::server::ServerHandle;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

/// Serve storage requests until the request channel closes
///
/// Requests are executed in arrival order; each completion is sent back to
/// the engine through `server`. Detached requests are executed and their
/// failures only logged.
pub async fn serve(
    mut store: FsStore,
    mut requests: mpsc::Receiver<StorageRequest>,
    server: ServerHandle,
) -> FsStore {
    tracing::info!("Storage worker started");
    while let Some(request) = requests.recv().await {
        let result = store.execute(&request).await;
        if request.token.is_none() {
            if let Err(e) = &result {
                tracing::warn!(
                    "{} detached {} failed: {}",
                    request.session,
                    request.callout.name(),
                    e
                );
            }
            continue;
        }
        if let Some(completion) = request.complete(result) {
            if server.complete(completion).await.is_err() {
                tracing::debug!("Engine stopped, storage worker exiting");
                break;
            }
        }
    }
    tracing::info!("Storage worker stopped");
    store
}

/// Run [`serve`] on its own task
#[must_use]
pub fn spawn(
    store: FsStore,
    requests: mpsc::Receiver<StorageRequest>,
    server: ServerHandle,
) -> JoinHandle<FsStore> {
    tokio::spawn(serve(store, requests, server))
}
