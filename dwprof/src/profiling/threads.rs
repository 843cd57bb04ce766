//! Thread discovery
//!
//! Enumerates the threads of a target process by reading /proc filesystem,
//! and tracks the per-thread samplers as threads come and go.

use anyhow::{Context, Result};
use log::debug;
use std::collections::BTreeMap;
use std::fs;

use crate::domain::{Pid, Tid};

/// Information about one thread of the target
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ThreadInfo {
    pub tid: Tid,
    pub comm: String,
}

/// List the threads of `pid` from /proc/pid/task, sorted by TID
///
/// Threads that exit while the directory is being read are skipped.
///
/// # Errors
/// Returns an error if /proc/pid/task cannot be read
pub fn list_threads(pid: Pid) -> Result<Vec<ThreadInfo>> {
    let task_dir = format!("/proc/{}/task", pid.0);

    let entries = fs::read_dir(&task_dir).context(format!("Failed to read {task_dir}"))?;

    let mut threads: Vec<ThreadInfo> = entries
        .filter_map(|entry| {
            let entry = entry.ok()?;
            let tid = entry.file_name().to_str()?.parse::<i32>().ok()?;

            let comm_path = format!("/proc/{}/task/{}/comm", pid.0, tid);
            let comm = fs::read_to_string(comm_path).ok()?;

            Some(ThreadInfo { tid: Tid(tid), comm: comm.trim().to_string() })
        })
        .collect();

    threads.sort_by_key(|thread| thread.tid.0);
    debug!("Found {} threads in {pid}", threads.len());

    Ok(threads)
}

/// Per-thread state of every thread currently being sampled
///
/// Each rescan of the target retires exited threads first, so their state
/// (an fd and a locked ring buffer for a real sampler) is released instead of
/// piling up in a target that churns threads.
#[derive(Debug)]
pub struct ThreadTracker<S> {
    threads: BTreeMap<Tid, S>,
}

impl<S> Default for ThreadTracker<S> {
    fn default() -> Self {
        Self { threads: BTreeMap::new() }
    }
}

impl<S> ThreadTracker<S> {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.threads.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.threads.is_empty()
    }

    #[must_use]
    pub fn contains(&self, tid: Tid) -> bool {
        self.threads.contains_key(&tid)
    }

    pub fn iter(&self) -> impl Iterator<Item = (Tid, &S)> {
        self.threads.iter().map(|(&tid, state)| (tid, state))
    }

    pub fn iter_mut(&mut self) -> impl Iterator<Item = (Tid, &mut S)> {
        self.threads.iter_mut().map(|(&tid, state)| (tid, state))
    }

    /// Stop tracking every thread missing from `live`
    ///
    /// The removed states are handed back so the caller can drain them one
    /// last time before dropping them.
    pub fn retire_exited(&mut self, live: &[ThreadInfo]) -> Vec<(Tid, S)> {
        let exited: Vec<Tid> = self
            .threads
            .keys()
            .filter(|tid| !live.iter().any(|thread| thread.tid == **tid))
            .copied()
            .collect();

        exited
            .into_iter()
            .filter_map(|tid| {
                debug!("Thread {tid} exited");
                self.threads.remove(&tid).map(|state| (tid, state))
            })
            .collect()
    }

    /// Start tracking every thread of `live` not tracked yet
    ///
    /// `open` may return `Ok(None)` to skip a thread, for instance one that
    /// exited after it was listed. A skipped thread is offered again on the
    /// next call.
    ///
    /// # Errors
    /// Stops at and returns the first error from `open`
    pub fn attach_new<E>(
        &mut self,
        live: &[ThreadInfo],
        mut open: impl FnMut(&ThreadInfo) -> Result<Option<S>, E>,
    ) -> Result<usize, E> {
        let mut attached = 0;
        for thread in live {
            if self.contains(thread.tid) {
                continue;
            }
            if let Some(state) = open(thread)? {
                self.threads.insert(thread.tid, state);
                attached += 1;
            }
        }
        Ok(attached)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_list_threads_self_process() {
        #[allow(clippy::cast_possible_wrap)]
        let pid = Pid(std::process::id() as i32);
        let threads = list_threads(pid).unwrap();

        // The main thread's TID equals the PID
        assert!(threads.iter().any(|t| t.tid.0 == pid.0));
        assert!(threads.windows(2).all(|w| w[0].tid.0 < w[1].tid.0));
    }

    #[test]
    fn test_list_threads_invalid_pid() {
        assert!(list_threads(Pid(9_999_999)).is_err());
    }

    fn threads(tids: &[i32]) -> Vec<ThreadInfo> {
        tids.iter().map(|&tid| ThreadInfo { tid: Tid(tid), comm: format!("worker-{tid}") }).collect()
    }

    fn open_all(thread: &ThreadInfo) -> Result<Option<String>, String> {
        Ok(Some(thread.comm.clone()))
    }

    #[test]
    fn test_tracker_attaches_each_thread_once() {
        let mut tracker = ThreadTracker::new();
        assert_eq!(tracker.attach_new(&threads(&[10, 11]), open_all), Ok(2));
        assert_eq!(tracker.attach_new(&threads(&[10, 11, 12]), open_all), Ok(1));
        assert_eq!(tracker.len(), 3);

        let tids: Vec<Tid> = tracker.iter().map(|(tid, _)| tid).collect();
        assert_eq!(tids, vec![Tid(10), Tid(11), Tid(12)]);
    }

    #[test]
    fn test_tracker_retires_exited_threads() {
        let mut tracker = ThreadTracker::new();
        tracker.attach_new(&threads(&[10, 11, 12]), open_all).unwrap();

        let retired = tracker.retire_exited(&threads(&[10, 12]));
        assert_eq!(retired, vec![(Tid(11), "worker-11".to_string())]);
        assert!(!tracker.contains(Tid(11)));
        assert_eq!(tracker.len(), 2);

        // A churning target never grows the tracker past its live threads
        for round in 0..50 {
            let live = threads(&[10, 100 + round]);
            tracker.retire_exited(&live);
            tracker.attach_new(&live, open_all).unwrap();
            assert_eq!(tracker.len(), 2);
        }
    }

    #[test]
    fn test_tracker_skipped_thread_offered_again() {
        let mut tracker: ThreadTracker<String> = ThreadTracker::new();
        assert_eq!(tracker.attach_new(&threads(&[10]), |_| Ok::<_, String>(None)), Ok(0));
        assert!(tracker.is_empty());
        assert_eq!(tracker.attach_new(&threads(&[10]), open_all), Ok(1));
    }

    #[test]
    fn test_tracker_stops_at_open_error() {
        let mut tracker = ThreadTracker::new();
        let result = tracker.attach_new(&threads(&[10, 11]), |thread| {
            if thread.tid == Tid(11) {
                Err("denied".to_string())
            } else {
                open_all(thread)
            }
        });
        assert_eq!(result, Err("denied".to_string()));
        assert!(tracker.contains(Tid(10)));
    }
}
