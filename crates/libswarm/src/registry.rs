// In-memory torrent registry with create-if-absent semantics. A
// descriptor may exist before its data descriptor does (metadata still
// being fetched); attaching data twice is caller misuse.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use dashmap::DashMap;
use parking_lot::Mutex;
use swarm_core::hash_id::Id20;
use tracing::{debug, error};

use crate::{
    error::{Error, Result},
    metainfo::Torrent,
    piece_store::DataDescriptor,
};

pub struct TorrentDescriptor {
    active: AtomicBool,
    data: Mutex<Option<Arc<DataDescriptor>>>,
}

impl std::fmt::Debug for TorrentDescriptor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TorrentDescriptor")
            .field("active", &self.active)
            .field("data_attached", &self.data.lock().is_some())
            .finish()
    }
}

impl TorrentDescriptor {
    fn new() -> Self {
        Self {
            active: AtomicBool::new(false),
            data: Mutex::new(None),
        }
    }

    pub fn is_active(&self) -> bool {
        self.active.load(Ordering::Acquire)
    }

    pub fn start(&self) {
        self.active.store(true, Ordering::Release);
    }

    pub fn stop(&self) {
        self.active.store(false, Ordering::Release);
    }

    pub fn data_descriptor(&self) -> Option<Arc<DataDescriptor>> {
        self.data.lock().clone()
    }
}

#[derive(Default)]
pub struct TorrentRegistry {
    torrents: DashMap<Id20, Arc<Torrent>>,
    descriptors: DashMap<Id20, Arc<TorrentDescriptor>>,
}

impl TorrentRegistry {
    pub fn new() -> Self {
        Default::default()
    }

    pub fn torrent_ids(&self) -> Vec<Id20> {
        self.descriptors.iter().map(|e| *e.key()).collect()
    }

    pub fn get_torrent(&self, torrent_id: Id20) -> Option<Arc<Torrent>> {
        self.torrents.get(&torrent_id).map(|e| e.value().clone())
    }

    pub fn get_descriptor(&self, torrent_id: Id20) -> Option<Arc<TorrentDescriptor>> {
        self.descriptors.get(&torrent_id).map(|e| e.value().clone())
    }

    /// Registering the same id twice returns the same descriptor.
    pub fn register(&self, torrent_id: Id20) -> Arc<TorrentDescriptor> {
        self.descriptors
            .entry(torrent_id)
            .or_insert_with(|| Arc::new(TorrentDescriptor::new()))
            .value()
            .clone()
    }

    /// Registers a torrent together with its data descriptor. If a
    /// bare descriptor already exists (registered while metadata was
    /// being fetched) the data descriptor is attached to it; if one
    /// is already attached, that's a fatal misuse.
    pub fn register_with_data(
        &self,
        torrent: Arc<Torrent>,
        data: Arc<DataDescriptor>,
    ) -> Result<Arc<TorrentDescriptor>> {
        let torrent_id = torrent.info_hash;
        let descriptor = self.register(torrent_id);
        {
            let mut g = descriptor.data.lock();
            if g.is_some() {
                return Err(Error::DescriptorAlreadyAttached(torrent_id));
            }
            *g = Some(data);
        }
        self.torrents.entry(torrent_id).or_insert(torrent);
        Ok(descriptor)
    }

    /// True while the torrent is registered and, if its data
    /// descriptor exists already, the descriptor reports active. No
    /// data descriptor yet simply means metadata is still being
    /// fetched, which counts as supported.
    pub fn is_supported_and_active(&self, torrent_id: Id20) -> bool {
        match self.descriptors.get(&torrent_id) {
            Some(e) => e.value().data_descriptor().is_none() || e.value().is_active(),
            None => false,
        }
    }

    /// Removes the torrent and closes its data descriptor. Close
    /// errors are logged and swallowed: the torrent is gone either
    /// way. Unregistering twice is a no-op the second time.
    pub fn unregister(&self, torrent_id: Id20) {
        self.torrents.remove(&torrent_id);
        if let Some((_, descriptor)) = self.descriptors.remove(&torrent_id) {
            descriptor.stop();
            if let Some(data) = descriptor.data_descriptor() {
                if let Err(e) = data.close() {
                    error!("error closing data descriptor for {:?}: {:#}", torrent_id, e);
                }
            }
            debug!("unregistered torrent {:?}", torrent_id);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::metainfo::test_util::single_file_torrent;
    use crate::storage::InMemoryStorage;

    fn make() -> (Arc<Torrent>, Arc<DataDescriptor>) {
        let torrent = Arc::new(single_file_torrent(&[b'a'; 100], 64));
        let data = Arc::new(DataDescriptor::new(&torrent, &InMemoryStorage).unwrap());
        (torrent, data)
    }

    #[test]
    fn test_register_is_idempotent() {
        let registry = TorrentRegistry::new();
        let tid = Id20::new([1u8; 20]);
        let d1 = registry.register(tid);
        let d2 = registry.register(tid);
        assert!(Arc::ptr_eq(&d1, &d2));
    }

    #[test]
    fn test_attach_data_to_existing_descriptor() {
        let registry = TorrentRegistry::new();
        let (torrent, data) = make();
        let bare = registry.register(torrent.info_hash);
        assert!(bare.data_descriptor().is_none());

        let attached = registry
            .register_with_data(torrent.clone(), data.clone())
            .unwrap();
        assert!(Arc::ptr_eq(&bare, &attached));
        assert!(attached.data_descriptor().is_some());

        // second attach is fatal misuse
        let err = registry.register_with_data(torrent, data).unwrap_err();
        assert!(matches!(err, Error::DescriptorAlreadyAttached(_)));
    }

    #[test]
    fn test_unregister_twice_is_noop() {
        let registry = TorrentRegistry::new();
        let (torrent, data) = make();
        let tid = torrent.info_hash;
        registry.register_with_data(torrent, data).unwrap();
        assert!(registry.get_torrent(tid).is_some());

        registry.unregister(tid);
        assert!(registry.get_torrent(tid).is_none());
        assert!(registry.get_descriptor(tid).is_none());

        // second time: nothing to do, nothing to panic about
        registry.unregister(tid);
    }

    #[test]
    fn test_supported_and_active() {
        let registry = TorrentRegistry::new();
        let (torrent, data) = make();
        let tid = torrent.info_hash;
        assert!(!registry.is_supported_and_active(tid));

        // registered without data: metadata still being fetched
        registry.register(tid);
        assert!(registry.is_supported_and_active(tid));

        let descriptor = registry.register_with_data(torrent, data).unwrap();
        assert!(!registry.is_supported_and_active(tid));
        descriptor.start();
        assert!(registry.is_supported_and_active(tid));
        descriptor.stop();
        assert!(!registry.is_supported_and_active(tid));
    }
}
