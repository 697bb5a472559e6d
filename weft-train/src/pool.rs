//! Worker pool and checkpoint plumbing shared by the aggregation passes.
//!
//! Workers parse disjoint groups of artifact files and send their partial
//! results over a channel to the calling thread, which is the only place
//! the merge target is ever touched. Checkpoints go to disk from a single
//! background writer; a cycle that arrives while a write is still running
//! is deferred and counted, and the delta just stays merged in memory.

use std::fs;
use std::path::Path;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{mpsc, Arc};
use std::thread::{self, JoinHandle};

use tracing::{debug, warn};

use weft::error::ModelError;

/// How the pool carves work up.
#[derive(Debug, Clone, Copy)]
pub struct PoolConfig {
    /// Worker thread count.
    pub jobs: usize,
    /// Files per work unit.
    pub group_size: usize,
}

impl Default for PoolConfig {
    fn default() -> Self {
        PoolConfig {
            jobs: 4,
            group_size: 32,
        }
    }
}

/// Run `work` over disjoint groups of `items` on a bounded pool and apply
/// each group's result with `merge` on the calling thread. An error from
/// `merge` stops the pass; workers notice the closed channel and wind
/// down.
pub fn map_merge<T, D, W, M>(
    items: &[T],
    config: PoolConfig,
    work: W,
    mut merge: M,
) -> anyhow::Result<()>
where
    T: Sync,
    D: Send,
    W: Fn(&[T]) -> D + Sync,
    M: FnMut(D) -> anyhow::Result<()>,
{
    let groups: Vec<&[T]> = items.chunks(config.group_size.max(1)).collect();
    let next = AtomicUsize::new(0);
    let (tx, rx) = mpsc::channel();

    thread::scope(|scope| {
        for _ in 0..config.jobs.max(1).min(groups.len()) {
            let tx = tx.clone();
            let next = &next;
            let groups = &groups;
            let work = &work;
            scope.spawn(move || loop {
                let i = next.fetch_add(1, Ordering::Relaxed);
                let Some(group) = groups.get(i) else {
                    break;
                };
                if tx.send(work(group)).is_err() {
                    break;
                }
            });
        }
        drop(tx);
        for delta in rx {
            merge(delta)?;
        }
        Ok(())
    })
}

/// Background checkpoint writer with at most one write in flight.
pub struct Checkpointer {
    in_flight: Arc<AtomicBool>,
    handle: Option<JoinHandle<()>>,
    deferred: u64,
}

impl Checkpointer {
    pub fn new() -> Self {
        Checkpointer {
            in_flight: Arc::new(AtomicBool::new(false)),
            handle: None,
            deferred: 0,
        }
    }

    /// Checkpoint cycles skipped because the writer was still busy.
    pub fn deferred(&self) -> u64 {
        self.deferred
    }

    /// Hand a snapshot write to the background thread. If the previous
    /// write has not finished, the cycle is deferred; the caller's
    /// in-memory state already holds everything the skipped snapshot
    /// would have, so nothing is lost.
    pub fn submit<F>(&mut self, write: F)
    where
        F: FnOnce() -> Result<(), ModelError> + Send + 'static,
    {
        if self.in_flight.swap(true, Ordering::AcqRel) {
            self.deferred += 1;
            debug!(deferred = self.deferred, "checkpoint writer busy, cycle deferred");
            return;
        }
        // Flag was clear, so the previous thread is done; reap it.
        if let Some(handle) = self.handle.take() {
            let _ = handle.join();
        }
        let in_flight = Arc::clone(&self.in_flight);
        self.handle = Some(thread::spawn(move || {
            if let Err(err) = write() {
                warn!(%err, "checkpoint write failed, state stays in memory");
            }
            in_flight.store(false, Ordering::Release);
        }));
    }

    /// Wait for any outstanding write.
    pub fn finish(&mut self) {
        if let Some(handle) = self.handle.take() {
            let _ = handle.join();
        }
    }
}

impl Default for Checkpointer {
    fn default() -> Self {
        Self::new()
    }
}

/// Write through a temporary sibling and rename into place, so the file
/// at `path` is always either the old checkpoint or the new one.
pub fn write_atomic<F>(path: &Path, save: F) -> Result<(), ModelError>
where
    F: FnOnce(&Path) -> Result<(), ModelError>,
{
    let tmp = path.with_extension("tmp");
    save(&tmp)?;
    fs::rename(&tmp, path).map_err(|source| ModelError::Io {
        path: path.to_path_buf(),
        source,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::BTreeSet;
    use std::sync::Mutex;

    #[test]
    fn every_item_is_merged_exactly_once() {
        let items: Vec<u32> = (0..100).collect();
        let seen = Mutex::new(BTreeSet::new());
        map_merge(
            &items,
            PoolConfig {
                jobs: 4,
                group_size: 7,
            },
            |group| group.to_vec(),
            |group| {
                let mut seen = seen.lock().unwrap();
                for item in group {
                    assert!(seen.insert(item), "item {item} merged twice");
                }
                Ok(())
            },
        )
        .unwrap();
        assert_eq!(seen.into_inner().unwrap().len(), 100);
    }

    #[test]
    fn merge_error_stops_the_pass() {
        let items: Vec<u32> = (0..1000).collect();
        let result = map_merge(
            &items,
            PoolConfig {
                jobs: 2,
                group_size: 1,
            },
            |group| group.to_vec(),
            |_| anyhow::bail!("stop"),
        );
        assert!(result.is_err());
    }

    #[test]
    fn busy_writer_defers_cycles() {
        let (release_tx, release_rx) = mpsc::channel::<()>();
        let mut cp = Checkpointer::new();
        cp.submit(move || {
            release_rx.recv().ok();
            Ok(())
        });
        cp.submit(|| Ok(()));
        assert_eq!(cp.deferred(), 1);

        release_tx.send(()).unwrap();
        cp.finish();
        cp.submit(|| Ok(()));
        cp.finish();
        assert_eq!(cp.deferred(), 1);
    }

    #[test]
    fn atomic_write_replaces_previous_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("state.bin");
        write_atomic(&path, |tmp| {
            fs::write(tmp, b"one").map_err(|source| ModelError::Io {
                path: tmp.to_path_buf(),
                source,
            })
        })
        .unwrap();
        write_atomic(&path, |tmp| {
            fs::write(tmp, b"two").map_err(|source| ModelError::Io {
                path: tmp.to_path_buf(),
                source,
            })
        })
        .unwrap();
        assert_eq!(fs::read(&path).unwrap(), b"two");
        assert!(!path.with_extension("tmp").exists());
    }
}
