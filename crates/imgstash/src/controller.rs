//! Startup reconciliation and the pull-event loop.
//!
//! The controller binds the recency policy to its side effects: admission
//! pushes the image into the store, eviction removes it. On startup it
//! replays the persisted cache into the daemon — oldest first, so the most
//! recently used image ends up at the front of the recency index — and
//! only then starts consuming pull events. A single image failing to
//! reload, push, or evict is logged and never stops the loop; only the
//! startup phase itself can fail.

use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use crate::daemon::{ContainerDaemon, PullEvent};
use crate::error::{CacheError, Result};
use crate::mover::Mover;
use crate::recency::{RecencyHooks, RecencyIndex};
use crate::storage::Storage;

/// How long startup waits for the daemon and the storage to become ready.
pub const READY_TIMEOUT: Duration = Duration::from_secs(300);

/// Recency side effects: push on admit, remove on evict.
struct CacheSideEffects {
    mover: Mover,
    storage: Arc<Storage>,
}

#[async_trait]
impl RecencyHooks for CacheSideEffects {
    async fn on_admit(&self, image_name: &str, _image_id: &str) {
        match self.mover.push(image_name).await {
            Ok(()) => info!("image '{image_name}' has been cached"),
            Err(err) => warn!("caching '{image_name}': {err}"),
        }
    }

    async fn on_evict(&self, image_name: &str, _image_id: &str) {
        let storage = Arc::clone(&self.storage);
        let name = image_name.to_string();
        let removed = tokio::task::spawn_blocking(move || storage.remove(&name))
            .await
            .map_err(CacheError::from_join)
            .and_then(|result| result);
        match removed {
            Ok(()) => info!("image '{image_name}' has been evicted"),
            Err(err) => warn!("removing '{image_name}': {err}"),
        }
    }
}

/// Event-driven cache controller.
pub struct Controller {
    recency: RecencyIndex,
    storage: Arc<Storage>,
    daemon: Arc<dyn ContainerDaemon>,
    mover: Mover,
}

impl Controller {
    /// Wire the controller: builds the mover and installs the store side
    /// effects as the recency hooks.
    pub fn new(
        max_count: usize,
        storage: Arc<Storage>,
        daemon: Arc<dyn ContainerDaemon>,
    ) -> Result<Self> {
        let mover = Mover::new(Arc::clone(&storage), Arc::clone(&daemon));
        let hooks = CacheSideEffects {
            mover: mover.clone(),
            storage: Arc::clone(&storage),
        };
        let recency = RecencyIndex::new(max_count, Box::new(hooks))?;
        Ok(Self {
            recency,
            storage,
            daemon,
            mover,
        })
    }

    /// Replay the persisted cache, then consume pull events until the
    /// subscription ends or the token is cancelled.
    pub async fn start(mut self, cancel: CancellationToken) -> Result<()> {
        self.replay_persisted().await?;

        let mut pulls = self.daemon.subscribe_pulls().await?;
        info!("listening for image pulls");
        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                event = pulls.recv() => match event {
                    Some(event) => self.handle_pull(event).await,
                    None => break,
                },
            }
        }
        Ok(())
    }

    async fn handle_pull(&mut self, event: PullEvent) {
        self.recency
            .touch(&event.image_name, &event.image_id)
            .await;
    }

    /// Reload persisted images into the daemon, oldest first, and rebuild
    /// the recency order to match. A failing image is skipped.
    async fn replay_persisted(&mut self) -> Result<()> {
        let mut metas = {
            let storage = Arc::clone(&self.storage);
            tokio::task::spawn_blocking(move || storage.get_all_meta())
                .await
                .map_err(CacheError::from_join)??
        };
        metas.sort_by_key(|meta| meta.updated_at);

        for meta in metas {
            if let Err(err) = self.mover.pull(&meta.image_name).await {
                error!("loading '{}' from storage: {err}", meta.image_name);
                continue;
            }
            self.recency
                .touch_silent(&meta.image_name, &meta.image_id)
                .await;
        }
        Ok(())
    }
}

/// Run the cache to completion: readiness waits, reconciliation, event
/// loop. Errors returned here are fatal startup errors; everything after
/// the event loop begins is logged instead.
pub async fn run(
    dir: &Path,
    max_count: usize,
    daemon: Arc<dyn ContainerDaemon>,
    cancel: CancellationToken,
) -> Result<()> {
    daemon.wait_ready(READY_TIMEOUT, &cancel).await?;

    info!("cache dir: {}", dir.display());
    let storage = Arc::new(Storage::open(dir));
    storage.wait_ready(READY_TIMEOUT, &cancel).await?;

    {
        let storage = Arc::clone(&storage);
        tokio::task::spawn_blocking(move || storage.clean_up())
            .await
            .map_err(CacheError::from_join)??;
    }

    let controller = Controller::new(max_count, storage, daemon)?;
    controller.start(cancel).await
}
