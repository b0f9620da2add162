// Ties the registry, the PEX source and the per-torrent sessions
// together, and drives each torrent's lifecycle chain
// (fetch-metadata -> choose-files -> download -> seed -> stop).

use std::sync::Arc;
use std::time::{Duration, Instant};

use dashmap::DashMap;
use peer_wire::{Handshake, PIECE_MESSAGE_DEFAULT_LEN};
use rand::Rng;
use swarm_core::hash_id::Id20;
use swarm_core::spawn_utils::spawn_with_cancel;
use tokio::io::AsyncReadExt;
use tokio_util::sync::CancellationToken;
use tracing::{debug, debug_span, error_span, info, warn};

use crate::config::Config;
use crate::error::{Error, Result};
use crate::events::{EventBus, EventKind};
use crate::metainfo::{MetadataSource, Torrent};
use crate::pex_source::{PexSource, CLEANER_INTERVAL_MS};
use crate::piece_store::DataDescriptor;
use crate::pipeline::{Pipeline, PipelineEvent, Stage};
use crate::registry::TorrentRegistry;
use crate::selector::Selector;
use crate::storage::Storage;
use crate::torrent_state::TorrentSession;

fn generate_peer_id() -> Id20 {
    let mut id = [0u8; 20];
    id[..8].copy_from_slice(b"-SW0100-");
    rand::thread_rng().fill(&mut id[8..]);
    Id20::new(id)
}

#[derive(Clone)]
pub struct AddTorrentOptions {
    pub only_files: Option<Vec<usize>>,
    /// Re-hash whatever the storage already holds before starting.
    pub initial_check: bool,
    /// Terminate the lifecycle after DOWNLOAD instead of seeding.
    pub stop_when_downloaded: bool,
    pub selector: Selector,
    pub initial_peers: Vec<std::net::SocketAddr>,
}

impl Default for AddTorrentOptions {
    fn default() -> Self {
        Self {
            only_files: None,
            initial_check: true,
            stop_when_downloaded: false,
            selector: Selector::RandomizedRarest,
            initial_peers: Vec::new(),
        }
    }
}

struct LifecycleCtx {
    engine: Arc<Engine>,
    storage: Arc<dyn Storage>,
    opts: AddTorrentOptions,
    info_hash: Id20,
    metadata_source: Option<Arc<dyn MetadataSource>>,
    torrent: Option<Torrent>,
    session: Option<Arc<TorrentSession>>,
    handle: tokio::runtime::Handle,
}

pub struct Engine {
    config: Arc<Config>,
    my_peer_id: Id20,
    registry: Arc<TorrentRegistry>,
    event_bus: EventBus,
    pex: Arc<PexSource>,
    sessions: DashMap<Id20, Arc<TorrentSession>>,
    cancellation_token: CancellationToken,
    epoch: Instant,
}

impl Engine {
    /// Must be called from within a tokio runtime; the engine's
    /// periodic tasks are spawned on it.
    pub fn new(config: Config) -> Result<Arc<Self>> {
        config.validate()?;
        let engine = Arc::new(Self {
            my_peer_id: generate_peer_id(),
            registry: Arc::new(TorrentRegistry::new()),
            event_bus: EventBus::new(),
            pex: Arc::new(PexSource::from_config(&config)),
            sessions: DashMap::new(),
            cancellation_token: CancellationToken::new(),
            epoch: Instant::now(),
            config: Arc::new(config),
        });

        {
            let engine2 = engine.clone();
            spawn_with_cancel(
                debug_span!("pex_cleaner"),
                engine.cancellation_token.clone(),
                async move {
                    let mut interval =
                        tokio::time::interval(Duration::from_millis(CLEANER_INTERVAL_MS));
                    loop {
                        interval.tick().await;
                        engine2.pex.cleanup(engine2.now_ms());
                    }
                    // for type inference
                    #[allow(unreachable_code)]
                    Ok::<_, anyhow::Error>(())
                },
            );
        }
        Ok(engine)
    }

    fn now_ms(&self) -> u64 {
        self.epoch.elapsed().as_millis() as u64
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    pub fn peer_id(&self) -> Id20 {
        self.my_peer_id
    }

    pub fn event_bus(&self) -> &EventBus {
        &self.event_bus
    }

    pub fn registry(&self) -> &Arc<TorrentRegistry> {
        &self.registry
    }

    pub fn pex(&self) -> &Arc<PexSource> {
        &self.pex
    }

    pub fn session(&self, torrent_id: Id20) -> Option<Arc<TorrentSession>> {
        self.sessions.get(&torrent_id).map(|e| e.value().clone())
    }

    /// Registers a torrent whose metadata is already known and starts
    /// its lifecycle at CHOOSE_FILES. Adding an already-managed
    /// torrent returns the existing session.
    pub fn add_torrent(
        self: &Arc<Self>,
        torrent: Torrent,
        storage: Arc<dyn Storage>,
        opts: AddTorrentOptions,
    ) -> Result<Arc<TorrentSession>> {
        if let Some(existing) = self.session(torrent.info_hash) {
            return Ok(existing);
        }
        let info_hash = torrent.info_hash;
        let session = self.start_session(torrent, &storage, &opts)?;
        let ctx = LifecycleCtx {
            engine: self.clone(),
            storage,
            opts,
            info_hash,
            metadata_source: None,
            torrent: None,
            session: Some(session.clone()),
            handle: tokio::runtime::Handle::current(),
        };
        self.spawn_lifecycle(ctx, Stage::ChooseFiles);
        Ok(session)
    }

    /// Registers a torrent known only by its id; the metadata source
    /// resolves it in the FETCH_METADATA stage.
    pub fn add_by_info_hash(
        self: &Arc<Self>,
        info_hash: Id20,
        metadata_source: Arc<dyn MetadataSource>,
        storage: Arc<dyn Storage>,
        opts: AddTorrentOptions,
    ) -> Result<()> {
        self.registry.register(info_hash);
        let ctx = LifecycleCtx {
            engine: self.clone(),
            storage,
            opts,
            info_hash,
            metadata_source: Some(metadata_source),
            torrent: None,
            session: None,
            handle: tokio::runtime::Handle::current(),
        };
        self.spawn_lifecycle(ctx, Stage::FetchMetadata);
        Ok(())
    }

    fn start_session(
        self: &Arc<Self>,
        torrent: Torrent,
        storage: &Arc<dyn Storage>,
        opts: &AddTorrentOptions,
    ) -> Result<Arc<TorrentSession>> {
        let torrent = Arc::new(torrent);
        let info_hash = torrent.info_hash;
        let data = Arc::new(
            DataDescriptor::new_with_block_length(&torrent, storage.as_ref(), self.config.block_size)
                .map_err(Error::Storage)?,
        );
        if opts.initial_check {
            data.initial_check().map_err(Error::Storage)?;
        }
        let descriptor = self.registry.register_with_data(torrent.clone(), data.clone())?;

        let session = TorrentSession::new(
            torrent,
            data,
            self.config.clone(),
            opts.selector,
            self.pex.clone(),
            self.event_bus.clone(),
            self.my_peer_id,
            self.epoch,
            self.cancellation_token.child_token(),
        )?;
        if let Some(only_files) = &opts.only_files {
            session.update_only_files(only_files);
        }
        descriptor.start();
        self.sessions.insert(info_hash, session.clone());
        self.event_bus.emit(info_hash, EventKind::TorrentStarted);
        for peer in &opts.initial_peers {
            session.add_peer(*peer);
        }
        info!("torrent {:?} started", info_hash);
        Ok(session)
    }

    fn build_lifecycle(stop_when_downloaded: bool) -> Pipeline<LifecycleCtx> {
        let mut pipeline: Pipeline<LifecycleCtx> = Pipeline::new();

        pipeline.stage(
            Stage::FetchMetadata,
            Some(PipelineEvent::TorrentFetched),
            |ctx: &mut LifecycleCtx| {
                let source = ctx
                    .metadata_source
                    .as_ref()
                    .ok_or_else(|| anyhow::anyhow!("no metadata source configured"))?;
                let torrent = source.fetch(ctx.info_hash)?;
                if torrent.info_hash != ctx.info_hash {
                    anyhow::bail!("metadata source returned the wrong torrent");
                }
                ctx.engine
                    .event_bus
                    .emit(ctx.info_hash, EventKind::MetadataFetched);
                ctx.torrent = Some(torrent);
                Ok(Some(Stage::ChooseFiles))
            },
        );

        pipeline.stage(
            Stage::ChooseFiles,
            Some(PipelineEvent::FilesChosen),
            |ctx: &mut LifecycleCtx| {
                if ctx.session.is_none() {
                    let torrent = ctx
                        .torrent
                        .take()
                        .ok_or_else(|| anyhow::anyhow!("no metadata to start from"))?;
                    let session = ctx.engine.start_session(torrent, &ctx.storage, &ctx.opts)?;
                    ctx.session = Some(session);
                }
                Ok(Some(Stage::Download))
            },
        );

        pipeline.stage(
            Stage::Download,
            Some(PipelineEvent::DownloadComplete),
            |ctx: &mut LifecycleCtx| {
                let session = ctx
                    .session
                    .clone()
                    .ok_or_else(|| anyhow::anyhow!("no session by DOWNLOAD"))?;
                let token = session.cancellation_token().clone();
                ctx.handle.block_on(async {
                    tokio::select! {
                        _ = session.wait_until_completed() => {}
                        _ = token.cancelled() => {}
                    }
                });
                if token.is_cancelled() {
                    return Ok(Some(Stage::Stop));
                }
                Ok(Some(Stage::Seed))
            },
        );

        pipeline.stage(Stage::Seed, None, |ctx: &mut LifecycleCtx| {
            let session = ctx
                .session
                .clone()
                .ok_or_else(|| anyhow::anyhow!("no session by SEED"))?;
            let token = session.cancellation_token().clone();
            ctx.handle.block_on(token.cancelled());
            Ok(Some(Stage::Stop))
        });

        pipeline.stage(Stage::Stop, None, |ctx: &mut LifecycleCtx| {
            ctx.engine.stop_torrent(ctx.info_hash);
            Ok(None)
        });

        if stop_when_downloaded {
            pipeline.on(PipelineEvent::DownloadComplete, |_ctx, _next| None);
        }
        pipeline
    }

    fn spawn_lifecycle(self: &Arc<Self>, mut ctx: LifecycleCtx, start: Stage) {
        let pipeline = Self::build_lifecycle(ctx.opts.stop_when_downloaded);
        let engine = self.clone();
        let info_hash = ctx.info_hash;
        let span = error_span!("lifecycle", torrent = %info_hash);
        tokio::task::spawn_blocking(move || {
            let _guard = span.enter();
            if let Err(e) = pipeline.run(&mut ctx, start) {
                warn!("torrent processing failed: {:#}", e);
                engine
                    .event_bus
                    .emit(info_hash, EventKind::TorrentError(format!("{e:#}")));
            }
            // whatever path the chain took, the torrent ends stopped
            engine.stop_torrent(info_hash);
        });
    }

    /// Stops and unregisters a torrent. Safe to call more than once.
    pub fn stop_torrent(&self, torrent_id: Id20) {
        if let Some((_, session)) = self.sessions.remove(&torrent_id) {
            session.stop();
            self.registry.unregister(torrent_id);
            self.pex.drop_torrent(torrent_id);
            self.event_bus.emit(torrent_id, EventKind::TorrentStopped);
            debug!("torrent {:?} stopped", torrent_id);
        }
    }

    pub fn stop(&self) {
        for id in self.registry.torrent_ids() {
            self.stop_torrent(id);
        }
        self.cancellation_token.cancel();
    }

    /// The accept loop for incoming peer connections. Reads the plain
    /// handshake, then hands the connection to the torrent it names.
    pub async fn task_acceptor(self: Arc<Self>, listener: tokio::net::TcpListener) -> Result<()> {
        loop {
            let (stream, addr) = listener.accept().await.map_err(Error::Connect)?;
            let engine = self.clone();
            spawn_with_cancel(
                debug_span!("incoming", peer = %addr),
                self.cancellation_token.clone(),
                async move { engine.handle_incoming(stream).await },
            );
        }
    }

    async fn handle_incoming(self: Arc<Self>, mut stream: tokio::net::TcpStream) -> Result<()> {
        let mut read_buf = vec![0u8; PIECE_MESSAGE_DEFAULT_LEN * 2];
        let mut read_so_far = 0usize;
        let (handshake, consumed) = loop {
            match Handshake::deserialize(&read_buf[..read_so_far]) {
                Ok(h) => break h,
                Err(e) if e.is_not_enough_data() => {}
                Err(e) => return Err(e.into()),
            }
            let size = stream
                .read(&mut read_buf[read_so_far..])
                .await
                .map_err(Error::ReadHandshake)?;
            if size == 0 {
                return Err(Error::PeerDisconnectedReadingHandshake);
            }
            read_so_far += size;
        };

        let info_hash = handshake.info_hash;
        if !self.registry.is_supported_and_active(info_hash) {
            return Err(Error::TorrentNotRegistered(info_hash));
        }
        let session = self
            .session(info_hash)
            .ok_or(Error::TorrentNotRegistered(info_hash))?;

        if read_so_far > consumed {
            read_buf.copy_within(consumed..read_so_far, 0);
        }
        read_so_far -= consumed;
        session.add_incoming_peer(stream, handshake, read_buf, read_so_far)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::metainfo::test_util::single_file_torrent;
    use crate::metainfo::TorrentFile;
    use crate::storage::{InMemoryStorage, InMemoryStorageUnit, StorageUnit};
    use std::sync::atomic::{AtomicUsize, Ordering};

    /// Storage whose units come pre-filled with the torrent content
    /// and count their close() calls.
    struct PrefilledStorage {
        content: Vec<u8>,
        closes: Arc<AtomicUsize>,
    }

    struct CountingUnit {
        inner: InMemoryStorageUnit,
        closes: Arc<AtomicUsize>,
    }

    impl StorageUnit for CountingUnit {
        fn read_block(&self, offset: u64, buf: &mut [u8]) -> std::io::Result<usize> {
            self.inner.read_block(offset, buf)
        }
        fn write_block(&self, offset: u64, buf: &[u8]) -> std::io::Result<usize> {
            self.inner.write_block(offset, buf)
        }
        fn capacity(&self) -> u64 {
            self.inner.capacity()
        }
        fn size(&self) -> std::io::Result<u64> {
            self.inner.size()
        }
        fn close(&self) -> std::io::Result<()> {
            self.closes.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }
    }

    impl Storage for PrefilledStorage {
        fn open_unit(&self, file: &TorrentFile) -> anyhow::Result<Box<dyn StorageUnit>> {
            let unit = InMemoryStorageUnit::new(file.length);
            crate::storage::write_block_fully(&unit, 0, &self.content)?;
            Ok(Box::new(CountingUnit {
                inner: unit,
                closes: self.closes.clone(),
            }))
        }
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_add_torrent_registers_and_stop_unregisters() {
        let engine = Engine::new(Config::default()).unwrap();
        let torrent = single_file_torrent(&[b'x'; 100], 64);
        let tid = torrent.info_hash;

        let session = engine
            .add_torrent(torrent.clone(), Arc::new(InMemoryStorage), Default::default())
            .unwrap();
        assert!(engine.registry().is_supported_and_active(tid));

        // adding the same torrent again yields the same session
        let again = engine
            .add_torrent(torrent, Arc::new(InMemoryStorage), Default::default())
            .unwrap();
        assert!(Arc::ptr_eq(&session, &again));

        engine.stop_torrent(tid);
        assert!(!engine.registry().is_supported_and_active(tid));
        assert!(engine.session(tid).is_none());
        // stopping again is a no-op
        engine.stop_torrent(tid);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_stop_when_downloaded_terminates_after_download() {
        let engine = Engine::new(Config::default()).unwrap();
        let content: Vec<u8> = (0..200u32).flat_map(|i| i.to_be_bytes()).collect();
        let torrent = single_file_torrent(&content, 256);
        assert!(torrent.piece_hashes.len() >= 2);
        let tid = torrent.info_hash;

        let closes = Arc::new(AtomicUsize::new(0));
        let storage = Arc::new(PrefilledStorage {
            content: content.clone(),
            closes: closes.clone(),
        });

        let mut events = engine.event_bus().subscribe();
        // initial check finds everything: DOWNLOAD completes at once,
        // the stop-when-downloaded listener returns None, and the
        // torrent is flushed and unregistered without seeding
        let session = engine
            .add_torrent(
                torrent,
                storage,
                AddTorrentOptions {
                    stop_when_downloaded: true,
                    ..Default::default()
                },
            )
            .unwrap();
        assert!(session.data().is_complete());

        let stopped = async {
            loop {
                let ev = events.recv().await.unwrap();
                if ev.torrent_id == tid && ev.kind == EventKind::TorrentStopped {
                    return;
                }
            }
        };
        tokio::time::timeout(Duration::from_secs(10), stopped)
            .await
            .expect("torrent should stop by itself");

        assert!(engine.session(tid).is_none());
        assert_eq!(closes.load(Ordering::SeqCst), 1, "storage flushed exactly once");
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_incoming_connection_for_unknown_torrent_rejected() {
        let engine = Engine::new(Config::default()).unwrap();
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(engine.clone().task_acceptor(listener));

        use tokio::io::AsyncWriteExt;
        let mut conn = tokio::net::TcpStream::connect(addr).await.unwrap();
        let mut buf = Vec::new();
        Handshake::new(Id20::new([9u8; 20]), Id20::new([8u8; 20])).serialize(&mut buf);
        conn.write_all(&buf).await.unwrap();

        // the engine drops the connection; our read returns EOF
        let mut out = [0u8; 68];
        let read = tokio::time::timeout(Duration::from_secs(5), conn.read(&mut out))
            .await
            .expect("timed out")
            .unwrap_or(0);
        assert_eq!(read, 0);
    }
}
