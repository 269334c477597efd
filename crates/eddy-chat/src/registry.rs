//! Lazily resolved registry metadata (agent avatars, tool descriptions)
//!
//! Messages carry only a key into this cache. The first lookup of a key
//! starts a background fetch and reports [`Resolution::Pending`]; subscribers
//! are told when the key settles.

use std::{collections::HashMap, sync::Arc};

use parking_lot::Mutex;
use tokio::sync::broadcast;

use crate::backend::RegistrySource;

/// Result of a cache lookup
#[derive(Debug, Clone, PartialEq)]
pub enum Resolution<T> {
    Ready(T),
    /// A fetch is in progress
    Pending,
    /// The fetch failed; the view shows a placeholder
    Unavailable,
}

#[derive(Debug, Clone)]
enum Entry<T> {
    Ready(T),
    Pending,
    Failed,
}

/// Shared, cloneable registry cache
pub struct RegistryCache<T> {
    source: Arc<dyn RegistrySource<T>>,
    entries: Arc<Mutex<HashMap<String, Entry<T>>>>,
    settled_tx: broadcast::Sender<String>,
}

impl<T> Clone for RegistryCache<T> {
    fn clone(&self) -> Self {
        Self {
            source: Arc::clone(&self.source),
            entries: Arc::clone(&self.entries),
            settled_tx: self.settled_tx.clone(),
        }
    }
}

impl<T> RegistryCache<T>
where
    T: Clone + Send + Sync + 'static,
{
    pub fn new(source: Arc<dyn RegistrySource<T>>) -> Self {
        let (settled_tx, _) = broadcast::channel(64);
        Self {
            source,
            entries: Arc::new(Mutex::new(HashMap::new())),
            settled_tx,
        }
    }

    /// Keys whose fetch finished, successfully or not
    pub fn subscribe(&self) -> broadcast::Receiver<String> {
        self.settled_tx.subscribe()
    }

    /// Look up `id`, starting a fetch on first use. Must be called from
    /// within a tokio runtime.
    pub fn resolve(&self, id: &str) -> Resolution<T> {
        {
            let mut entries = self.entries.lock();
            match entries.get(id) {
                Some(Entry::Ready(value)) => return Resolution::Ready(value.clone()),
                Some(Entry::Pending) => return Resolution::Pending,
                Some(Entry::Failed) => return Resolution::Unavailable,
                None => {
                    entries.insert(id.to_string(), Entry::Pending);
                }
            }
        }

        let source = Arc::clone(&self.source);
        let entries = Arc::clone(&self.entries);
        let settled_tx = self.settled_tx.clone();
        let id = id.to_string();
        tokio::spawn(async move {
            let entry = match source.fetch(&id).await {
                Ok(value) => Entry::Ready(value),
                Err(e) => {
                    tracing::warn!(id = %id, "Registry lookup failed: {}", e);
                    Entry::Failed
                }
            };
            entries.lock().insert(id.clone(), entry);
            let _ = settled_tx.send(id);
        });

        Resolution::Pending
    }
}
