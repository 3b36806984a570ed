//! Reload requests from the GUI actor, applied by the rendering actor between frames.

use crossbeam_channel::{unbounded, Receiver, Sender};
use tracing::debug;

use crate::types::ProgramId;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ReloadRequest {
    Program(ProgramId),
    /// Rebuild every program, including the display program.
    All,
}

/// Cloneable sender half; safe to use from any thread.
#[derive(Debug, Clone)]
pub struct ReloadHandle {
    tx: Sender<ReloadRequest>,
}

impl ReloadHandle {
    /// Queues a reload; returns `false` once the pipeline has shut down.
    pub fn request(&self, request: ReloadRequest) -> bool {
        self.tx.send(request).is_ok()
    }

    pub fn reload(&self, id: impl Into<String>) -> bool {
        self.request(ReloadRequest::Program(ProgramId::new(id)))
    }

    pub fn reload_all(&self) -> bool {
        self.request(ReloadRequest::All)
    }
}

#[derive(Debug)]
pub struct ReloadQueue {
    rx: Receiver<ReloadRequest>,
}

impl ReloadQueue {
    /// Takes every pending request, collapsing duplicates.
    ///
    /// An `All` request absorbs any per-program requests queued with it.
    pub fn drain(&self) -> Vec<ReloadRequest> {
        let mut pending: Vec<ReloadRequest> = Vec::new();
        for request in self.rx.try_iter() {
            if pending.contains(&ReloadRequest::All) {
                continue;
            }
            match request {
                ReloadRequest::All => {
                    pending.clear();
                    pending.push(ReloadRequest::All);
                }
                request if !pending.contains(&request) => pending.push(request),
                _ => {}
            }
        }
        if !pending.is_empty() {
            debug!(count = pending.len(), "reload requests pending");
        }
        pending
    }

    pub fn is_empty(&self) -> bool {
        self.rx.is_empty()
    }
}

pub fn reload_channel() -> (ReloadHandle, ReloadQueue) {
    let (tx, rx) = unbounded();
    (ReloadHandle { tx }, ReloadQueue { rx })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn drain_collapses_duplicates() {
        let (handle, queue) = reload_channel();
        assert!(handle.reload("Blur"));
        assert!(handle.reload("Blur"));
        assert!(handle.reload("Agents"));
        assert_eq!(
            queue.drain(),
            vec![
                ReloadRequest::Program(ProgramId::new("Blur")),
                ReloadRequest::Program(ProgramId::new("Agents")),
            ]
        );
        assert!(queue.drain().is_empty());
    }

    #[test]
    fn reload_all_absorbs_program_requests() {
        let (handle, queue) = reload_channel();
        handle.reload("Blur");
        handle.reload_all();
        handle.reload("Agents");
        assert_eq!(queue.drain(), vec![ReloadRequest::All]);
    }

    #[test]
    fn handle_works_across_threads() {
        let (handle, queue) = reload_channel();
        let worker = {
            let handle = handle.clone();
            std::thread::spawn(move || handle.reload("Trail"))
        };
        assert!(worker.join().unwrap());
        assert_eq!(queue.drain().len(), 1);
    }

    #[test]
    fn request_fails_after_queue_dropped() {
        let (handle, queue) = reload_channel();
        drop(queue);
        assert!(!handle.reload_all());
    }
}
