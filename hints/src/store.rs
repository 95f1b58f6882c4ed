//! Sequence-indexed persistent store for expensive cryptographic artifacts.
//!
//! Maps a monotonically increasing sequence number (e.g. a construction id)
//! to an artifact that survives process restarts, such as a generated
//! private key. Lookup returns the artifact stored at the largest sequence
//! number not greater than the requested one; an artifact that fails to
//! decode is treated as absent, falling through to the next-lower sequence
//! number rather than failing the node.
//!
//! One blob per sequence number (decimal name) is kept in a configured
//! [commonware_runtime::Storage] partition.

use commonware_codec::{DecodeExt, Encode};
use commonware_runtime::{Blob, Error as RuntimeError, Storage as RStorage};
use std::marker::PhantomData;
use tracing::{debug, info, warn};

use crate::suite::Material;
use crate::Error;

/// Configuration for a [Store].
#[derive(Clone)]
pub struct Config {
    /// The [commonware_runtime::Storage] partition holding the artifacts.
    pub partition: String,
}

/// A sequence-indexed artifact store.
pub struct Store<E: RStorage, V: Material> {
    context: E,
    partition: String,

    _artifact: PhantomData<V>,
}

impl<E: RStorage, V: Material> Store<E, V> {
    /// Create a store over the given partition.
    pub fn init(context: E, config: Config) -> Self {
        Self {
            context,
            partition: config.partition,
            _artifact: PhantomData,
        }
    }

    /// Return the artifact stored at the largest sequence number not greater
    /// than `seq` that still decodes; if none exists, synthesize a new
    /// artifact with `create` and persist it under `seq`.
    pub async fn get_or_create(
        &self,
        seq: u64,
        create: impl FnOnce() -> V,
    ) -> Result<V, Error> {
        let mut stored = self.stored().await?;
        stored.retain(|existing| *existing <= seq);
        for existing in stored.into_iter().rev() {
            if let Some(artifact) = self.read(existing).await? {
                debug!(seq, existing, "reusing stored artifact");
                return Ok(artifact);
            }
        }
        info!(seq, "no usable artifact found, creating one");
        let artifact = create();
        self.write(seq, &artifact).await?;
        Ok(artifact)
    }

    /// Create and persist a new artifact for `seq`, failing if one already
    /// exists for that exact sequence number.
    pub async fn create_for(&self, seq: u64, create: impl FnOnce() -> V) -> Result<V, Error> {
        if self.read(seq).await?.is_some() {
            return Err(Error::ArtifactExists(seq));
        }
        let artifact = create();
        self.write(seq, &artifact).await?;
        Ok(artifact)
    }

    /// Delete all artifacts stored at sequence numbers strictly less than
    /// `seq`.
    pub async fn purge_before(&self, seq: u64) -> Result<(), Error> {
        for existing in self.stored().await? {
            if existing >= seq {
                break;
            }
            info!(seq = existing, "purging artifact");
            self.context
                .remove(&self.partition, Some(existing.to_string().as_bytes()))
                .await?;
        }
        Ok(())
    }

    /// All stored sequence numbers, ascending. Blob names that are not plain
    /// decimal numbers are ignored.
    async fn stored(&self) -> Result<Vec<u64>, Error> {
        let names = match self.context.scan(&self.partition).await {
            Ok(names) => names,
            Err(RuntimeError::PartitionMissing(_)) => Vec::new(),
            Err(err) => return Err(err.into()),
        };
        let mut stored: Vec<u64> = names
            .iter()
            .filter(|name| !name.is_empty() && name.iter().all(u8::is_ascii_digit))
            .filter_map(|name| std::str::from_utf8(name).ok()?.parse().ok())
            .collect();
        stored.sort_unstable();
        Ok(stored)
    }

    /// Read and decode the artifact at exactly `seq`. A missing or corrupt
    /// artifact returns `None`.
    async fn read(&self, seq: u64) -> Result<Option<V>, Error> {
        let name = seq.to_string();
        let names = match self.context.scan(&self.partition).await {
            Ok(names) => names,
            Err(RuntimeError::PartitionMissing(_)) => return Ok(None),
            Err(err) => return Err(err.into()),
        };
        if !names.iter().any(|existing| existing == name.as_bytes()) {
            return Ok(None);
        }
        let (blob, len) = self.context.open(&self.partition, name.as_bytes()).await?;
        let buf = blob.read_at(vec![0u8; len as usize], 0).await?;
        match V::decode(buf.as_ref()) {
            Ok(artifact) => Ok(Some(artifact)),
            Err(err) => {
                warn!(seq, ?err, "unable to decode stored artifact");
                Ok(None)
            }
        }
    }

    /// Encode and durably persist the artifact at `seq`.
    async fn write(&self, seq: u64, artifact: &V) -> Result<(), Error> {
        let name = seq.to_string();
        let encoded = artifact.encode();
        let len = encoded.len() as u64;
        let (blob, _) = self.context.open(&self.partition, name.as_bytes()).await?;
        blob.write_at(encoded, 0).await?;
        blob.resize(len).await?;
        blob.sync().await?;
        Ok(())
    }
}
