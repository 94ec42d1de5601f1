//! Which physical instance readers see.
//!
//! Processed observations exist in two full copies, instance 0 and 1. One is
//! active (read by the search layer), the other is the write target of the
//! next cycle. The active id lives in an atomic so a flip is one store: a
//! reader sees either the old id or the new one, never a mixture, and is
//! never blocked. It is also persisted in [`INSTANCE_CONFIG_COLLECTION`] so
//! the choice survives restarts.

use std::sync::Arc;
use std::sync::atomic::{AtomicU8, Ordering};

use serde::{Deserialize, Serialize};
use sos_process::{processed_collection, protected_collection};
use sos_store::{CollectionStore, copy_collection, scratch_name};
use tokio::sync::Mutex;

use crate::PublishError;

/// Collection holding the persisted active instance id.
pub const INSTANCE_CONFIG_COLLECTION: &str = "instance-config";

/// Number of instances.
pub const INSTANCE_COUNT: u8 = 2;

const COPY_PAGE_SIZE: usize = 5000;

#[derive(Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
struct InstanceConfig {
    active_instance: u8,
}

fn check_instance(id: u8) -> Result<u8, PublishError> {
    if id < INSTANCE_COUNT {
        Ok(id)
    } else {
        Err(PublishError::InvalidInstance { id })
    }
}

/// Owns the active flag.
pub struct InstanceManager {
    store: Arc<dyn CollectionStore>,
    active: AtomicU8,
    write_lock: Mutex<()>,
}

impl InstanceManager {
    /// Reads the persisted active id. A store that never had one starts
    /// with instance 0 active.
    ///
    /// # Errors
    ///
    /// Returns [`PublishError`] if the configuration cannot be read or
    /// holds an id other than 0 or 1.
    pub async fn load(store: Arc<dyn CollectionStore>) -> Result<Self, PublishError> {
        let active = if store.exists(INSTANCE_CONFIG_COLLECTION).await? {
            let documents = store.get_chunk(INSTANCE_CONFIG_COLLECTION, 0, 1).await?;
            match documents.into_iter().next() {
                Some(document) => {
                    let config: InstanceConfig = serde_json::from_value(document)
                        .map_err(sos_store::StoreError::from)?;
                    check_instance(config.active_instance)?
                }
                None => 0,
            }
        } else {
            0
        };

        log::debug!("Active instance: {active}");

        Ok(Self {
            store,
            active: AtomicU8::new(active),
            write_lock: Mutex::new(()),
        })
    }

    /// The instance readers currently see.
    #[must_use]
    pub fn active_instance(&self) -> u8 {
        self.active.load(Ordering::SeqCst)
    }

    /// The instance the next cycle writes to.
    #[must_use]
    pub fn inactive_instance(&self) -> u8 {
        INSTANCE_COUNT - 1 - self.active_instance()
    }

    /// Makes `id` the active instance. The id is persisted first and then
    /// published to readers in one atomic store.
    ///
    /// # Errors
    ///
    /// Returns [`PublishError::InvalidInstance`] for ids other than 0 or 1,
    /// or [`PublishError::Store`] if persisting fails (readers keep seeing
    /// the previous id).
    pub async fn set_active_instance(&self, id: u8) -> Result<(), PublishError> {
        let id = check_instance(id)?;
        let _guard = self.write_lock.lock().await;

        let scratch = scratch_name(INSTANCE_CONFIG_COLLECTION);
        let document = serde_json::to_value(InstanceConfig { active_instance: id })
            .map_err(sos_store::StoreError::from)?;
        self.store.create_collection(&scratch).await?;
        self.store.write_batch(&scratch, vec![document]).await?;
        self.store
            .rename_collection(&scratch, INSTANCE_CONFIG_COLLECTION)
            .await?;

        let previous = self.active.swap(id, Ordering::SeqCst);
        log::info!("Active instance: {previous} -> {id}");
        Ok(())
    }

    /// Copies one provider's processed (and protected, if any) collections
    /// from instance `from` to instance `to`, replacing what `to` held.
    /// Returns the number of processed observations copied.
    ///
    /// # Errors
    ///
    /// Returns [`PublishError`] for invalid or equal instance ids, or if the
    /// source instance has no processed data for the provider.
    pub async fn copy_provider_data(
        &self,
        from: u8,
        to: u8,
        provider_id: u32,
    ) -> Result<u64, PublishError> {
        let from = check_instance(from)?;
        let to = check_instance(to)?;
        if from == to {
            return Err(PublishError::SameInstance { id: from });
        }

        let copied = self
            .copy_replacing(
                &processed_collection(from, provider_id),
                &processed_collection(to, provider_id),
            )
            .await?;

        let protected_from = protected_collection(from, provider_id);
        let protected_to = protected_collection(to, provider_id);
        if self.store.exists(&protected_from).await? {
            self.copy_replacing(&protected_from, &protected_to).await?;
        } else {
            self.store.delete_collection(&protected_to).await?;
        }

        log::info!("Copied provider {provider_id} from instance {from} to {to} ({copied} observations)");
        Ok(copied)
    }

    async fn copy_replacing(&self, from: &str, to: &str) -> Result<u64, PublishError> {
        let scratch = scratch_name(to);
        match copy_collection(self.store.as_ref(), from, &scratch, COPY_PAGE_SIZE).await {
            Ok(copied) => {
                self.store.rename_collection(&scratch, to).await?;
                Ok(copied)
            }
            Err(e) => {
                if let Err(cleanup) = self.store.delete_collection(&scratch).await {
                    log::error!("Failed to delete {scratch}: {cleanup}");
                }
                Err(e.into())
            }
        }
    }

    /// Starts a read session pinned to the current active instance.
    #[must_use]
    pub fn begin_session(&self) -> ReaderSession {
        ReaderSession {
            instance: self.active_instance(),
        }
    }
}

/// A reader's view of one instance. Every collection name it resolves
/// belongs to the instance that was active when the session began, even if
/// a swap happens meanwhile.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ReaderSession {
    instance: u8,
}

impl ReaderSession {
    /// The pinned instance.
    #[must_use]
    pub const fn instance(&self) -> u8 {
        self.instance
    }

    /// Processed observations of `provider_id`.
    #[must_use]
    pub fn processed_collection(&self, provider_id: u32) -> String {
        processed_collection(self.instance, provider_id)
    }

    /// True locations of `provider_id`'s diffused observations.
    #[must_use]
    pub fn protected_collection(&self, provider_id: u32) -> String {
        protected_collection(self.instance, provider_id)
    }
}
