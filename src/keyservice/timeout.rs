use super::{KeyDescriptor, KeyService};
use crate::error::{Result, SopsError};
use std::sync::{mpsc, Arc};
use std::thread;
use std::time::Duration;

/// Bounds every call to an inner service.
///
/// The call runs on a worker thread; when it exceeds the deadline the caller
/// gets [`SopsError::Timeout`] and the worker's eventual result is dropped.
pub struct TimeoutKeyService {
    inner: Arc<dyn KeyService>,
    timeout: Duration,
}

impl TimeoutKeyService {
    pub fn new(inner: Arc<dyn KeyService>, timeout: Duration) -> Self {
        Self { inner, timeout }
    }

    fn run<F>(&self, call: F) -> Result<Vec<u8>>
    where
        F: FnOnce(&dyn KeyService) -> Result<Vec<u8>> + Send + 'static,
    {
        let (tx, rx) = mpsc::channel();
        let inner = Arc::clone(&self.inner);
        thread::spawn(move || {
            let _ = tx.send(call(inner.as_ref()));
        });
        match rx.recv_timeout(self.timeout) {
            Ok(result) => result,
            Err(mpsc::RecvTimeoutError::Timeout) => Err(SopsError::Timeout(self.timeout)),
            Err(mpsc::RecvTimeoutError::Disconnected) => {
                Err(SopsError::KeyService("key service worker exited".into()))
            }
        }
    }
}

impl KeyService for TimeoutKeyService {
    fn encrypt(&self, key: &KeyDescriptor, plaintext: &[u8]) -> Result<Vec<u8>> {
        let key = key.clone();
        let plaintext = plaintext.to_vec();
        self.run(move |service| service.encrypt(&key, &plaintext))
    }

    fn decrypt(&self, key: &KeyDescriptor, ciphertext: &[u8]) -> Result<Vec<u8>> {
        let key = key.clone();
        let ciphertext = ciphertext.to_vec();
        self.run(move |service| service.decrypt(&key, &ciphertext))
    }
}
