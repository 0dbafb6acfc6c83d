// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Pre-generated RSA key material.
//!
//! RSA key generation takes long enough that doing it inline for every
//! signing operation adds noticeable latency. [RsaKeyCache] runs a background
//! producer that keeps a bounded queue of fresh keys filled so signing only
//! has to dequeue one.

use {
    crate::error::XpiSigningError,
    log::{debug, warn},
    rand::rngs::OsRng,
    rsa::RsaPrivateKey,
    std::{
        sync::{
            atomic::{AtomicBool, Ordering},
            mpsc::{sync_channel, Receiver},
            Arc, Mutex,
        },
        thread::JoinHandle,
    },
};

/// Default number of keys held in the queue.
pub const DEFAULT_CAPACITY: usize = 100;

/// A bounded pool of RSA private keys filled by a background thread.
///
/// The producer runs until the cache is dropped or [RsaKeyCache::shutdown] is
/// called. Shutdown sets a stop flag, closes the queue, then joins the thread.
pub struct RsaKeyCache {
    bits: usize,
    receiver: Mutex<Option<Receiver<RsaPrivateKey>>>,
    stop: Arc<AtomicBool>,
    producer: Option<JoinHandle<()>>,
}

impl std::fmt::Debug for RsaKeyCache {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RsaKeyCache")
            .field("bits", &self.bits)
            .field("running", &self.producer.is_some())
            .finish()
    }
}

impl RsaKeyCache {
    /// Start a cache producing keys of `bits` length with the default capacity.
    pub fn new(bits: usize) -> Result<Self, XpiSigningError> {
        Self::with_capacity(bits, DEFAULT_CAPACITY)
    }

    /// Start a cache producing keys of `bits` length, holding at most `capacity` keys.
    pub fn with_capacity(bits: usize, capacity: usize) -> Result<Self, XpiSigningError> {
        let (sender, receiver) = sync_channel(capacity);
        let stop = Arc::new(AtomicBool::new(false));
        let thread_stop = stop.clone();

        let producer = std::thread::Builder::new()
            .name("xpi-rsa-key-cache".into())
            .spawn(move || {
                while !thread_stop.load(Ordering::Relaxed) {
                    let key = match RsaPrivateKey::new(&mut OsRng, bits) {
                        Ok(key) => key,
                        Err(e) => {
                            warn!("RSA key generation failed; stopping key cache: {}", e);
                            return;
                        }
                    };

                    // Blocks while the queue is full. Errors once the receiver is gone.
                    if sender.send(key).is_err() {
                        return;
                    }
                }
            })?;

        debug!(
            "started RSA key cache for {} bit keys (capacity {})",
            bits, capacity
        );

        Ok(Self {
            bits,
            receiver: Mutex::new(Some(receiver)),
            stop,
            producer: Some(producer),
        })
    }

    /// Bit length of produced keys.
    pub fn bits(&self) -> usize {
        self.bits
    }

    /// Obtain a key, waiting for the producer if the queue is empty.
    pub fn acquire(&self) -> Result<RsaPrivateKey, XpiSigningError> {
        let guard = self
            .receiver
            .lock()
            .map_err(|_| XpiSigningError::KeyCacheClosed)?;

        guard
            .as_ref()
            .ok_or(XpiSigningError::KeyCacheClosed)?
            .recv()
            .map_err(|_| XpiSigningError::KeyCacheClosed)
    }

    /// Stop the producer and wait for it to exit.
    ///
    /// Subsequent [RsaKeyCache::acquire] calls fail with
    /// [XpiSigningError::KeyCacheClosed].
    pub fn shutdown(&mut self) {
        self.stop.store(true, Ordering::Relaxed);

        // Dropping the receiver unblocks a producer waiting on a full queue.
        if let Ok(mut guard) = self.receiver.lock() {
            guard.take();
        }

        if let Some(handle) = self.producer.take() {
            if handle.join().is_err() {
                warn!("RSA key cache producer panicked");
            }
            debug!("stopped RSA key cache");
        }
    }
}

impl Drop for RsaKeyCache {
    fn drop(&mut self) {
        self.shutdown();
    }
}

#[cfg(test)]
mod tests {
    use {super::*, rsa::traits::PublicKeyParts};

    #[test]
    fn acquire_beyond_capacity() -> Result<(), XpiSigningError> {
        let cache = RsaKeyCache::with_capacity(512, 2)?;
        assert_eq!(cache.bits(), 512);

        for _ in 0..5 {
            let key = cache.acquire()?;
            assert_eq!(key.size() * 8, 512);
        }

        Ok(())
    }

    #[test]
    fn concurrent_acquire() -> Result<(), XpiSigningError> {
        let cache = Arc::new(RsaKeyCache::with_capacity(512, 1)?);

        let handles = (0..3)
            .map(|_| {
                let cache = cache.clone();
                std::thread::spawn(move || cache.acquire().map(|key| key.size()))
            })
            .collect::<Vec<_>>();

        for handle in handles {
            assert_eq!(handle.join().unwrap()?, 64);
        }

        Ok(())
    }

    #[test]
    fn shutdown_closes() -> Result<(), XpiSigningError> {
        let mut cache = RsaKeyCache::with_capacity(512, 1)?;
        cache.acquire()?;
        cache.shutdown();

        assert!(matches!(
            cache.acquire(),
            Err(XpiSigningError::KeyCacheClosed)
        ));

        // Idempotent.
        cache.shutdown();

        Ok(())
    }
}
