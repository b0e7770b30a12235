//! Queue of messages whose decryption failed.
//!
//! Entries are deduplicated by message id and kept until a retry succeeds or
//! the queue is cleared. Entries that reached the retry cap stay stored but
//! are no longer offered as retryable. The queue is persisted after every
//! change; an empty queue removes its record.

use crate::storage::{KeyValueStore, FAILED_MESSAGES_RECORD};
use crate::transport::MessagePacket;
use crate::utils::{Result, SpruceError, StorageError};
use chrono::{DateTime, Utc};
use log::{debug, info, warn};
use serde::{Deserialize, Serialize};
use std::fmt::Display;
use std::sync::Arc;
use uuid::Uuid;

/// A message that could not be decrypted
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FailedMessageEntry {
    /// Queue entry id
    pub id: String,
    /// The packet as received
    #[serde(rename = "packet", alias = "originalPacket")]
    pub original_packet: MessagePacket,
    /// Most recent failure
    #[serde(rename = "error", alias = "errorDescription")]
    pub error_description: String,
    /// Number of failed decryption attempts, starting at 1
    pub retry_count: u32,
    /// When the first failure was recorded
    pub timestamp: DateTime<Utc>,
}

/// Bounded, deduplicated retry queue
pub struct RetryQueue {
    entries: Vec<FailedMessageEntry>,
    max_retries: u32,
    persistence: Arc<dyn KeyValueStore>,
}

impl RetryQueue {
    /// Load the persisted queue, starting empty if there is none
    ///
    /// An unreadable record is discarded.
    ///
    /// # Errors
    ///
    /// Returns a storage error if the record cannot be read or removed
    pub fn load(persistence: Arc<dyn KeyValueStore>, max_retries: u32) -> Result<Self> {
        let entries = match crate::storage::load_json::<Vec<FailedMessageEntry>>(
            persistence.as_ref(),
            FAILED_MESSAGES_RECORD,
        ) {
            Ok(entries) => entries.unwrap_or_default(),
            Err(SpruceError::Storage(StorageError::Corrupt { reason, .. })) => {
                warn!("Discarding unreadable failed-message queue: {}", reason);
                persistence.remove(FAILED_MESSAGES_RECORD)?;
                Vec::new()
            }
            Err(e) => return Err(e),
        };

        debug!("Loaded {} failed messages", entries.len());
        Ok(Self {
            entries,
            max_retries,
            persistence,
        })
    }

    /// Record a decryption failure for `packet`
    ///
    /// A packet already queued (same message id) has its retry count
    /// incremented instead of being added twice.
    ///
    /// # Errors
    ///
    /// Returns a storage error if the queue cannot be persisted
    pub fn add_failed(
        &mut self,
        packet: MessagePacket,
        error: &impl Display,
    ) -> Result<&FailedMessageEntry> {
        let index = match self
            .entries
            .iter()
            .position(|entry| entry.original_packet.message_id == packet.message_id)
        {
            Some(index) => {
                let entry = &mut self.entries[index];
                entry.retry_count += 1;
                entry.error_description = error.to_string();
                debug!(
                    "Message {} failed again ({} attempts)",
                    packet.message_id, entry.retry_count
                );
                index
            }
            None => {
                debug!("Queueing undecryptable message {}", packet.message_id);
                self.entries.push(FailedMessageEntry {
                    id: Uuid::new_v4().to_string(),
                    original_packet: packet,
                    error_description: error.to_string(),
                    retry_count: 1,
                    timestamp: Utc::now(),
                });
                self.entries.len() - 1
            }
        };

        self.save()?;
        Ok(&self.entries[index])
    }

    /// Retry decrypting entry `entry_id` with `decrypt`
    ///
    /// On success the entry is removed and the plaintext returned. On
    /// failure the retry count is incremented and `None` returned. Unknown
    /// ids also return `None`. Entries past the cap may still be retried
    /// explicitly.
    ///
    /// # Errors
    ///
    /// Returns a storage error if the queue cannot be persisted; decryption
    /// errors are absorbed into the entry
    pub fn retry<T, F>(&mut self, entry_id: &str, decrypt: F) -> Result<Option<T>>
    where
        F: FnOnce(&MessagePacket) -> Result<T>,
    {
        let Some(index) = self.entries.iter().position(|entry| entry.id == entry_id) else {
            debug!("No failed message with id {}", entry_id);
            return Ok(None);
        };

        match decrypt(&self.entries[index].original_packet) {
            Ok(plaintext) => {
                let entry = self.entries.remove(index);
                info!(
                    "Recovered message {} after {} failed attempts",
                    entry.original_packet.message_id, entry.retry_count
                );
                self.save()?;
                Ok(Some(plaintext))
            }
            Err(e) => {
                let entry = &mut self.entries[index];
                entry.retry_count += 1;
                entry.error_description = e.to_string();
                debug!("Retry of {} failed: {}", entry.id, e);
                self.save()?;
                Ok(None)
            }
        }
    }

    /// Entries still below the retry cap
    pub fn retryable(&self) -> Vec<&FailedMessageEntry> {
        self.entries
            .iter()
            .filter(|entry| entry.retry_count < self.max_retries)
            .collect()
    }

    /// Every queued entry
    pub fn entries(&self) -> &[FailedMessageEntry] {
        &self.entries
    }

    /// Entry by queue id
    pub fn get(&self, entry_id: &str) -> Option<&FailedMessageEntry> {
        self.entries.iter().find(|entry| entry.id == entry_id)
    }

    /// Entry by the packet's message id
    pub fn find_by_message_id(&self, message_id: &str) -> Option<&FailedMessageEntry> {
        self.entries
            .iter()
            .find(|entry| entry.original_packet.message_id == message_id)
    }

    /// Number of queued entries
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Whether the queue is empty
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Empty the queue and its persisted copy
    ///
    /// # Errors
    ///
    /// Returns a storage error if the record cannot be removed
    pub fn clear(&mut self) -> Result<()> {
        self.entries.clear();
        self.save()
    }

    fn save(&self) -> Result<()> {
        if self.entries.is_empty() {
            self.persistence.remove(FAILED_MESSAGES_RECORD)
        } else {
            crate::storage::save_json(self.persistence.as_ref(), FAILED_MESSAGES_RECORD, &self.entries)
        }
    }
}
