//! Composition root: opens the stores and wires store → session probe →
//! presence → processor → orchestrator, then feeds transport events in.

use std::sync::Arc;
use std::time::Duration;

use relay_core::directory::ChannelDirectory;
use relay_core::events::TransportEvent;
use relay_core::monitor::PoolType;
use relay_core::reply::ReplyEngine;
use relay_core::transport::Transport;
use relay_core::{ChannelId, ServerId};
use relay_engine::{
    EngineError, MessageProcessor, PresenceManager, ProcessorPools, SessionCounter,
    SessionOrchestrator, WorkerPool,
};
use relay_store::{open_stores, CacheBackend, MonitoringStore, Stores};
use relay_telemetry::MetricsRecorder;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::error::ServerError;
use crate::heartbeat::start_heartbeat;
use crate::settings::RelaySettings;

/// External systems the gateway talks to.
#[derive(Clone)]
pub struct Collaborators {
    pub transport: Arc<dyn Transport>,
    pub directory: Arc<dyn ChannelDirectory>,
    pub engine: Arc<dyn ReplyEngine>,
}

pub struct Manager {
    server_id: ServerId,
    settings: RelaySettings,
    backend: Arc<dyn CacheBackend>,
    monitoring: MonitoringStore,
    presence: Arc<PresenceManager>,
    orchestrator: Arc<SessionOrchestrator>,
    pools: ProcessorPools,
    metrics: Arc<MetricsRecorder>,
    cancel: CancellationToken,
    started: Instant,
    tasks: parking_lot::Mutex<Vec<JoinHandle<()>>>,
}

impl Manager {
    /// Open the configured backend, build every component and register the
    /// configured channels.
    pub async fn start(
        settings: RelaySettings,
        collaborators: Collaborators,
        metrics: Arc<MetricsRecorder>,
    ) -> Result<Arc<Self>, ServerError> {
        settings.validate()?;
        let cancel = CancellationToken::new();
        let stores = open_stores(
            &settings.store.backend,
            &settings.store_options(),
            cancel.child_token(),
        )
        .await?;
        let manager = Self::with_stores(settings, stores, collaborators, metrics, cancel);
        for channel in manager.settings.server.channels.clone() {
            manager
                .register_channel(&ChannelId::from_raw(channel))
                .await?;
        }
        Ok(manager)
    }

    /// Build on already opened stores. `cancel` stops the background tasks
    /// the stores were opened with as well as the ones started here.
    pub fn with_stores(
        settings: RelaySettings,
        stores: Stores,
        collaborators: Collaborators,
        metrics: Arc<MetricsRecorder>,
        cancel: CancellationToken,
    ) -> Arc<Self> {
        let server_id = settings
            .server
            .server_id
            .clone()
            .map(ServerId::from_raw)
            .unwrap_or_default();
        let Stores {
            backend,
            sessions,
            presence: presence_store,
            typing,
            monitoring,
            sweepers,
        } = stores;
        let Collaborators {
            transport,
            directory,
            engine,
        } = collaborators;

        let probe = Arc::new(SessionCounter::new(Arc::clone(&sessions)));
        let presence = Arc::new(PresenceManager::new(
            Arc::clone(&transport),
            presence_store,
            probe,
            settings.presence_config(),
            Arc::clone(&metrics),
        ));
        let pool = |kind: PoolType| {
            Arc::new(WorkerPool::start(
                settings.pool_config(kind),
                server_id.clone(),
                monitoring.clone(),
                Arc::clone(&metrics),
                cancel.child_token(),
            ))
        };
        let pools = ProcessorPools {
            processing: pool(PoolType::Processing),
            outbound: pool(PoolType::Outbound),
        };
        let processor = Arc::new(MessageProcessor::new(
            transport,
            directory,
            engine,
            Arc::clone(&sessions),
            Arc::clone(&presence),
            pools.clone(),
            settings.processor_config(),
        ));
        let orchestrator = Arc::new(SessionOrchestrator::new(
            sessions,
            processor,
            Some(typing),
            settings.orchestrator_config(),
            Arc::clone(&metrics),
        ));

        let started = Instant::now();
        let mut tasks = sweepers;
        tasks.push(start_heartbeat(
            monitoring.clone(),
            server_id.clone(),
            started,
            settings.heartbeat_interval(),
            cancel.child_token(),
        ));

        info!(
            server_id = %server_id,
            backend = backend.name(),
            namespace = %settings.store.namespace,
            "relay manager started"
        );
        Arc::new(Self {
            server_id,
            settings,
            backend,
            monitoring,
            presence,
            orchestrator,
            pools,
            metrics,
            cancel,
            started,
            tasks: parking_lot::Mutex::new(tasks),
        })
    }

    pub fn server_id(&self) -> &ServerId {
        &self.server_id
    }

    pub fn settings(&self) -> &RelaySettings {
        &self.settings
    }

    pub fn backend(&self) -> &Arc<dyn CacheBackend> {
        &self.backend
    }

    pub fn monitoring(&self) -> &MonitoringStore {
        &self.monitoring
    }

    pub fn presence(&self) -> &Arc<PresenceManager> {
        &self.presence
    }

    pub fn orchestrator(&self) -> &Arc<SessionOrchestrator> {
        &self.orchestrator
    }

    pub fn metrics(&self) -> &Arc<MetricsRecorder> {
        &self.metrics
    }

    pub fn uptime(&self) -> Duration {
        self.started.elapsed()
    }

    pub async fn register_channel(&self, channel: &ChannelId) -> Result<(), ServerError> {
        self.presence.register(channel).await?;
        Ok(())
    }

    pub async fn unregister_channel(&self, channel: &ChannelId) -> Result<(), ServerError> {
        self.presence.unregister(channel).await?;
        Ok(())
    }

    /// Route one transport event. The channel is woken first; messages then
    /// enter the debounce pipeline, activity only updates typing and chat
    /// state.
    pub async fn handle_event(&self, event: TransportEvent) {
        let channel = event.channel_id().clone();
        match self.presence.on_activity(&channel).await {
            Ok(true) => debug!(channel_id = %channel, "channel woken by event"),
            Ok(false) => {}
            Err(EngineError::ChannelNotRegistered(_)) => {
                warn!(channel_id = %channel, "event for unregistered channel, dropping");
                return;
            }
            Err(e) => warn!(channel_id = %channel, error = %e, "presence update failed"),
        }

        match event {
            TransportEvent::Message(message) => self.orchestrator.handle_inbound(message).await,
            TransportEvent::Activity(activity) => self.orchestrator.note_activity(&activity).await,
        }
    }

    /// Consume events until the sender is dropped or the manager shuts down.
    pub async fn run(&self, mut events: mpsc::Receiver<TransportEvent>) {
        loop {
            let event = tokio::select! {
                _ = self.cancel.cancelled() => break,
                event = events.recv() => match event {
                    Some(event) => event,
                    None => break,
                },
            };
            self.handle_event(event).await;
        }
        debug!("event loop finished");
    }

    /// Stop timers, channels and workers, then leave the cluster view.
    pub async fn shutdown(&self) {
        self.orchestrator.shutdown();
        self.presence.shutdown();
        for channel in self.presence.channels() {
            if let Err(e) = self.presence.unregister(&channel).await {
                warn!(channel_id = %channel, error = %e, "channel stop failed");
            }
        }

        self.cancel.cancel();
        self.pools.processing.join().await;
        self.pools.outbound.join().await;
        let tasks: Vec<_> = std::mem::take(&mut *self.tasks.lock());
        for task in tasks {
            let _ = task.await;
        }

        match self.monitoring.remove_server(&self.server_id).await {
            Ok(removed) => debug!(removed, "monitor records removed"),
            Err(e) => warn!(error = %e, "failed to remove monitor records"),
        }
        info!(server_id = %self.server_id, "relay manager stopped");
    }
}
