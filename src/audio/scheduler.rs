use std::collections::BTreeMap;

use crossbeam_channel::{Receiver, Sender, unbounded};

use crate::audio::codec::AudioBuffer;
use crate::error::Result;

/// Identifies one scheduled buffer.
pub type EntryId = u64;

/// Called by the sink once an entry has played to its end. Not called for
/// entries that were stopped.
pub type CompletionFn = Box<dyn FnOnce() + Send + 'static>;

/// Output device seam: a clock plus the ability to start and stop buffers
/// at points on that clock.
pub trait AudioSink {
    /// Current position of the output clock in seconds.
    fn current_time(&self) -> f64;

    /// Start `buffer` at `at` seconds on the output clock.
    fn start(
        &mut self,
        id: EntryId,
        buffer: AudioBuffer,
        at: f64,
        on_complete: CompletionFn,
    ) -> Result<()>;

    /// Stop an entry immediately, wherever it is.
    fn stop(&mut self, id: EntryId);
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct PlaybackEntry {
    pub id: EntryId,
    pub start_at: f64,
    pub duration: f64,
}

impl PlaybackEntry {
    #[must_use]
    pub fn end_at(&self) -> f64 {
        self.start_at + self.duration
    }
}

/// Places each chunk at `max(next_start_time, now)` on the output clock, so a
/// burst of chunks plays back to back.
pub struct PlaybackScheduler {
    sink: Box<dyn AudioSink>,
    next_start_time: f64,
    active: BTreeMap<EntryId, PlaybackEntry>,
    next_id: EntryId,
    done_tx: Sender<EntryId>,
    done_rx: Receiver<EntryId>,
}

impl PlaybackScheduler {
    #[must_use]
    pub fn new(sink: Box<dyn AudioSink>) -> Self {
        let (done_tx, done_rx) = unbounded();
        Self {
            sink,
            next_start_time: 0.0,
            active: BTreeMap::new(),
            next_id: 0,
            done_tx,
            done_rx,
        }
    }

    /// Schedule a decoded buffer right after whatever is already queued.
    ///
    /// If the sink refuses the buffer, the timeline is left where it was.
    pub fn enqueue(&mut self, buffer: AudioBuffer) -> Result<PlaybackEntry> {
        self.reap();

        let now = self.sink.current_time();
        let start_at = self.next_start_time.max(now);
        let duration = buffer.duration_secs();

        let id = self.next_id;
        self.next_id += 1;

        let done_tx = self.done_tx.clone();
        self.sink.start(
            id,
            buffer,
            start_at,
            Box::new(move || {
                let _ = done_tx.send(id);
            }),
        )?;

        self.next_start_time = start_at + duration;

        let entry = PlaybackEntry {
            id,
            start_at,
            duration,
        };
        self.active.insert(id, entry);

        tracing::debug!(
            "scheduled entry {id} at {start_at:.3}s for {duration:.3}s (now {now:.3}s, {} active)",
            self.active.len()
        );

        Ok(entry)
    }

    /// Hard cutover: stop everything, forget it, and re-anchor the next chunk
    /// to the live output clock.
    pub fn interrupt(&mut self) -> usize {
        let stopped = self.active.len();
        for id in self.active.keys() {
            self.sink.stop(*id);
        }
        self.active.clear();
        // Completions posted before the stop landed are meaningless now.
        while self.done_rx.try_recv().is_ok() {}
        self.next_start_time = 0.0;

        if stopped > 0 {
            tracing::info!("playback interrupted, stopped {stopped} entries");
        }
        stopped
    }

    /// Drop entries the sink reported as finished. Returns how many were removed.
    pub fn reap(&mut self) -> usize {
        let mut removed = 0;
        while let Ok(id) = self.done_rx.try_recv() {
            if self.active.remove(&id).is_some() {
                removed += 1;
            }
        }
        removed
    }

    #[must_use]
    pub fn active_len(&self) -> usize {
        self.active.len()
    }

    #[must_use]
    pub const fn next_start_time(&self) -> f64 {
        self.next_start_time
    }

    /// True while anything is still scheduled or playing.
    #[must_use]
    pub fn is_playing(&self) -> bool {
        !self.active.is_empty()
    }
}

#[cfg(test)]
pub(crate) mod testing {
    use std::collections::BTreeMap;
    use std::sync::{Arc, Mutex};

    use super::{AudioSink, CompletionFn, EntryId};
    use crate::audio::codec::AudioBuffer;
    use crate::error::{ChimeError, Result};

    #[derive(Default)]
    pub struct SinkState {
        pub now: f64,
        pub started: Vec<(EntryId, f64, f64)>,
        pub stopped: Vec<EntryId>,
        pub pending: BTreeMap<EntryId, (f64, CompletionFn)>,
        pub refuse_next: bool,
    }

    /// Sink with a hand-driven clock. `advance` fires completions for every
    /// entry whose end has passed.
    #[derive(Clone, Default)]
    pub struct ManualSink {
        pub state: Arc<Mutex<SinkState>>,
    }

    impl ManualSink {
        pub fn set_now(&self, now: f64) {
            self.lock().now = now;
        }

        pub fn advance(&self, to: f64) {
            let finished: Vec<CompletionFn> = {
                let mut state = self.lock();
                state.now = to;
                let done: Vec<EntryId> = state
                    .pending
                    .iter()
                    .filter(|(_, (end, _))| *end <= to)
                    .map(|(id, _)| *id)
                    .collect();
                done.into_iter()
                    .filter_map(|id| state.pending.remove(&id).map(|(_, cb)| cb))
                    .collect()
            };
            for cb in finished {
                cb();
            }
        }

        pub fn lock(&self) -> std::sync::MutexGuard<'_, SinkState> {
            self.state.lock().unwrap_or_else(|e| panic!("{e}"))
        }
    }

    impl AudioSink for ManualSink {
        fn current_time(&self) -> f64 {
            self.lock().now
        }

        fn start(
            &mut self,
            id: EntryId,
            buffer: AudioBuffer,
            at: f64,
            on_complete: CompletionFn,
        ) -> Result<()> {
            let mut state = self.lock();
            if state.refuse_next {
                state.refuse_next = false;
                return Err(ChimeError::Audio("sink refused buffer".to_string()));
            }
            let duration = buffer.duration_secs();
            state.started.push((id, at, duration));
            state.pending.insert(id, (at + duration, on_complete));
            Ok(())
        }

        fn stop(&mut self, id: EntryId) {
            let mut state = self.lock();
            state.stopped.push(id);
            state.pending.remove(&id);
        }
    }

    pub fn buffer_of(secs: f64) -> AudioBuffer {
        AudioBuffer {
            samples: vec![0.0; (secs * 24000.0).round() as usize],
            sample_rate: 24000,
            channels: 1,
        }
    }
}
