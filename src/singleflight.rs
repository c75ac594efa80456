//! In-process request coalescing. Concurrent callers with the same key share
//! one execution and its outcome; the map entry lives only while the call is
//! in flight.

use std::collections::HashMap;
use std::sync::Mutex;

use tokio::sync::broadcast;

pub struct Singleflight<T: Clone> {
    inflight: Mutex<HashMap<String, broadcast::Sender<T>>>,
}

impl<T: Clone> Default for Singleflight<T> {
    fn default() -> Self {
        Self::new()
    }
}

enum Role<T> {
    Owner,
    Passenger(broadcast::Receiver<T>),
}

/// Removes the owner's map entry if the owning future is dropped before it
/// publishes, so passengers observe a closed channel instead of hanging.
struct EntryGuard<'a, T: Clone> {
    map: &'a Mutex<HashMap<String, broadcast::Sender<T>>>,
    key: &'a str,
    armed: bool,
}

impl<T: Clone> Drop for EntryGuard<'_, T> {
    fn drop(&mut self) {
        if self.armed {
            self.map.lock().unwrap().remove(self.key);
        }
    }
}

impl<T: Clone> Singleflight<T> {
    pub fn new() -> Self {
        Self {
            inflight: Mutex::new(HashMap::new()),
        }
    }

    /// Execute `f` under `key`, or join the execution already in flight.
    /// Returns the shared outcome and whether this caller ran it. If an owner
    /// is cancelled before publishing, waiting passengers re-register and one
    /// of them becomes the new owner.
    pub async fn run<F, Fut>(&self, key: &str, f: F) -> (T, bool)
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = T>,
    {
        let mut f = Some(f);
        loop {
            let role = {
                let mut map = self.inflight.lock().unwrap();
                match map.get(key) {
                    Some(tx) => Role::Passenger(tx.subscribe()),
                    None => {
                        let (tx, _) = broadcast::channel(1);
                        map.insert(key.to_string(), tx);
                        Role::Owner
                    }
                }
            };
            match role {
                Role::Owner => {
                    let mut guard = EntryGuard {
                        map: &self.inflight,
                        key,
                        armed: true,
                    };
                    let func = f.take().expect("owner branch runs at most once");
                    let out = func().await;
                    // Remove before publishing so late arrivals become fresh
                    // owners instead of subscribing to a spent channel.
                    let tx = self.inflight.lock().unwrap().remove(key);
                    guard.armed = false;
                    if let Some(tx) = tx {
                        let _ = tx.send(out.clone());
                    }
                    return (out, true);
                }
                Role::Passenger(mut rx) => match rx.recv().await {
                    Ok(out) => return (out, false),
                    // Owner vanished without publishing; try again.
                    Err(_) => continue,
                },
            }
        }
    }

    #[cfg(test)]
    fn inflight_len(&self) -> usize {
        self.inflight.lock().unwrap().len()
    }
}
