//! Per-slot animation loops
//!
//! Every badge slot holds at most one live loop. [`BadgeScheduler::submit`]
//! swaps the slot's cancellation token under the arena lock and cancels the
//! old one; the old loop notices at its next delay or delivery.
//!
//! Frames are delivered under a per-slot gate and the cancellation check
//! happens inside it, so once a newer loop has delivered anything, a
//! superseded loop can no longer reach the sink.

use std::collections::{HashMap, HashSet};
use std::fmt;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use tokio::sync::watch;
use tokio_util::sync::CancellationToken;

use super::{scroll_windows, AnimationRequest, AnimationTiming, BadgeState, FrameSink, Renderer, SinkError};

/// Host context string identifying one badge slot
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct SlotId(String);

impl SlotId {
    pub fn new(value: impl Into<String>) -> Self {
        Self(value.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for SlotId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for SlotId {
    fn from(value: &str) -> Self {
        Self::new(value)
    }
}

/// Handle to one submitted loop
#[derive(Clone)]
pub struct AnimationHandle {
    cancel: CancellationToken,
    done: watch::Receiver<()>,
}

impl AnimationHandle {
    pub fn cancel(&self) {
        self.cancel.cancel();
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancel.is_cancelled()
    }

    /// True once the loop task has exited
    pub fn is_finished(&self) -> bool {
        self.done.has_changed().is_err()
    }

    /// Wait for the loop task to exit. Loops only exit when cancelled.
    pub async fn join(&self) {
        let mut done = self.done.clone();
        while done.changed().await.is_ok() {}
    }

    fn finished() -> Self {
        let cancel = CancellationToken::new();
        cancel.cancel();
        let (done_tx, done) = watch::channel(());
        drop(done_tx);
        Self { cancel, done }
    }
}

#[derive(Default)]
struct Slot {
    current: Option<CancellationToken>,
    gate: Arc<Mutex<()>>,
}

/// Live slots plus the ids of disposed ones, which never come back
#[derive(Default)]
struct Slots {
    live: HashMap<SlotId, Slot>,
    retired: HashSet<SlotId>,
}

/// Arena of badge slots
pub struct BadgeScheduler {
    renderer: Arc<dyn Renderer>,
    timing: AnimationTiming,
    slots: Mutex<Slots>,
}

impl BadgeScheduler {
    pub fn new(renderer: Arc<dyn Renderer>, timing: AnimationTiming) -> Self {
        Self {
            renderer,
            timing,
            slots: Mutex::new(Slots::default()),
        }
    }

    /// Replace the slot's loop with one animating `request`.
    ///
    /// Never waits on the previous loop. Must be called from within a Tokio
    /// runtime. Submitting to a disposed slot returns an already finished
    /// handle and starts nothing.
    pub fn submit(
        &self,
        slot: &SlotId,
        request: AnimationRequest,
        sink: Arc<dyn FrameSink>,
    ) -> AnimationHandle {
        let token = CancellationToken::new();

        let gate = {
            let mut slots = lock(&self.slots);
            if slots.retired.contains(slot) {
                tracing::debug!("Ignoring animation for disposed slot {}", slot);
                return AnimationHandle::finished();
            }
            let entry = slots.live.entry(slot.clone()).or_default();
            if let Some(previous) = entry.current.replace(token.clone()) {
                previous.cancel();
                tracing::debug!("Replaced animation loop on slot {}", slot);
            }
            entry.gate.clone()
        };

        let (done_tx, done_rx) = watch::channel(());
        let animation = AnimationLoop {
            slot: slot.clone(),
            request,
            sink,
            renderer: self.renderer.clone(),
            timing: self.timing.clone(),
            token: token.clone(),
            gate,
        };
        tokio::spawn(async move {
            animation.run().await;
            drop(done_tx);
        });

        AnimationHandle {
            cancel: token,
            done: done_rx,
        }
    }

    /// Stop the slot's loop, if any. Returns whether one was running.
    pub fn cancel(&self, slot: &SlotId) -> bool {
        let previous = lock(&self.slots)
            .live
            .get_mut(slot)
            .and_then(|entry| entry.current.take());
        match previous {
            Some(token) => {
                let was_running = !token.is_cancelled();
                token.cancel();
                was_running
            }
            None => false,
        }
    }

    /// Cancel and retire the slot for good
    pub fn dispose(&self, slot: &SlotId) {
        let mut slots = lock(&self.slots);
        if let Some(token) = slots.live.remove(slot).and_then(|entry| entry.current) {
            token.cancel();
        }
        slots.retired.insert(slot.clone());
        tracing::debug!("Disposed badge slot {}", slot);
    }

    pub fn is_running(&self, slot: &SlotId) -> bool {
        lock(&self.slots)
            .live
            .get(slot)
            .and_then(|entry| entry.current.as_ref())
            .map(|token| !token.is_cancelled())
            .unwrap_or(false)
    }
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    match mutex.lock() {
        Ok(guard) => guard,
        Err(poisoned) => poisoned.into_inner(),
    }
}

enum Interrupt {
    Cancelled,
    Sink(SinkError),
}

impl From<SinkError> for Interrupt {
    fn from(err: SinkError) -> Self {
        Interrupt::Sink(err)
    }
}

struct AnimationLoop {
    slot: SlotId,
    request: AnimationRequest,
    sink: Arc<dyn FrameSink>,
    renderer: Arc<dyn Renderer>,
    timing: AnimationTiming,
    token: CancellationToken,
    gate: Arc<Mutex<()>>,
}

impl AnimationLoop {
    async fn run(self) {
        let windows = self
            .request
            .footer
            .as_deref()
            .map(|footer| scroll_windows(footer, self.timing.visible_footer_chars))
            .unwrap_or_default();

        loop {
            match self.cycle(&windows).await {
                Ok(()) => {}
                Err(Interrupt::Cancelled) => break,
                Err(Interrupt::Sink(err)) => {
                    tracing::warn!("Frame delivery failed on slot {}: {}", self.slot, err);
                    if self.pause(self.timing.rest_hold()).await.is_err() {
                        break;
                    }
                }
            }
        }
        tracing::debug!("Animation loop on slot {} stopped", self.slot);
    }

    /// Ticker windows, static hold, static re-render, rest
    async fn cycle(&self, windows: &[String]) -> Result<(), Interrupt> {
        for window in windows {
            self.show(Some(window))?;
            self.pause(self.timing.scroll_step()).await?;
        }

        let footer = self.request.footer.as_deref();
        self.show(footer)?;
        self.pause(self.timing.static_hold()).await?;
        self.show(footer)?;
        self.pause(self.timing.rest_hold()).await
    }

    fn show(&self, footer: Option<&str>) -> Result<(), Interrupt> {
        let frame = self.renderer.render(&BadgeState {
            request: &self.request,
            footer,
        });

        let _gate = lock(&self.gate);
        if self.token.is_cancelled() {
            return Err(Interrupt::Cancelled);
        }
        self.sink.deliver(frame)?;
        Ok(())
    }

    async fn pause(&self, duration: Duration) -> Result<(), Interrupt> {
        tokio::select! {
            biased;
            _ = self.token.cancelled() => Err(Interrupt::Cancelled),
            _ = tokio::time::sleep(duration) => Ok(()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::animation::{Color, Frame, Headline};

    /// Renders "<headline>|<footer>" so assertions read naturally
    struct TextRenderer;

    impl Renderer for TextRenderer {
        fn render(&self, state: &BadgeState<'_>) -> Frame {
            Frame::new(format!("{}|{}", state.request.headline, state.footer.unwrap_or("")))
        }
    }

    #[derive(Default)]
    struct RecordingSink {
        frames: Mutex<Vec<String>>,
        attempts: Mutex<usize>,
        fail_first: usize,
    }

    impl RecordingSink {
        fn failing_first(count: usize) -> Self {
            Self {
                fail_first: count,
                ..Default::default()
            }
        }

        fn frames(&self) -> Vec<String> {
            self.frames.lock().unwrap().clone()
        }
    }

    impl FrameSink for RecordingSink {
        fn deliver(&self, frame: Frame) -> Result<(), SinkError> {
            let mut attempts = self.attempts.lock().unwrap();
            *attempts += 1;
            if *attempts <= self.fail_first {
                return Err(SinkError::Rejected("busy".to_string()));
            }
            self.frames.lock().unwrap().push(frame.into_inner());
            Ok(())
        }
    }

    fn scheduler() -> BadgeScheduler {
        BadgeScheduler::new(Arc::new(TextRenderer), AnimationTiming::default())
    }

    fn request(count: u32, footer: Option<&str>) -> AnimationRequest {
        AnimationRequest::new(Headline::Count(count), Color::YELLOW).with_footer(footer.map(String::from))
    }

    fn ms(millis: u64) -> Duration {
        Duration::from_millis(millis)
    }

    #[tokio::test(start_paused = true)]
    async fn rapid_submits_leave_only_the_last_request_on_screen() {
        let scheduler = scheduler();
        let slot = SlotId::from("ctx-1");
        let sink = Arc::new(RecordingSink::default());

        let handles: Vec<AnimationHandle> = (0..5)
            .map(|i| scheduler.submit(&slot, request(i, Some("Long footer that scrolls")), sink.clone()))
            .collect();
        tokio::time::sleep(ms(20_000)).await;

        let frames = sink.frames();
        assert!(!frames.is_empty());
        assert!(frames.iter().all(|f| f.starts_with("4|")), "{:?}", frames);
        for handle in &handles[..4] {
            assert!(handle.is_cancelled());
            handle.join().await;
            assert!(handle.is_finished());
        }
        assert!(!handles[4].is_finished());
        assert!(scheduler.is_running(&slot));
    }

    #[tokio::test(start_paused = true)]
    async fn no_frames_after_cancel_plus_one_interval() {
        let scheduler = scheduler();
        let slot = SlotId::from("ctx-1");
        let sink = Arc::new(RecordingSink::default());

        let handle = scheduler.submit(&slot, request(2, None), sink.clone());
        tokio::time::sleep(ms(1_500)).await;
        assert_eq!(sink.frames().len(), 2);

        assert!(scheduler.cancel(&slot));
        let delivered = sink.frames().len();
        tokio::time::sleep(ms(1_000 + 5_000)).await;

        assert_eq!(sink.frames().len(), delivered);
        handle.join().await;
        assert!(!scheduler.is_running(&slot));
        assert!(!scheduler.cancel(&slot));
    }

    #[tokio::test(start_paused = true)]
    async fn long_footer_scrolls_then_holds_full_text() {
        let scheduler = scheduler();
        let slot = SlotId::from("ctx-1");
        let sink = Arc::new(RecordingSink::default());

        let _handle = scheduler.submit(
            &slot,
            request(0, Some("Quarterly Planning Sync With Finance")),
            sink.clone(),
        );
        // 27 windows at 200ms each, static frame at 5400ms
        tokio::time::sleep(ms(5_900)).await;

        let frames = sink.frames();
        assert_eq!(frames.len(), 28);
        assert_eq!(frames[0], "0|Quarterly ");
        assert_eq!(frames[1], "0|uarterly P");
        assert_eq!(frames[26], "0|th Finance");
        assert_eq!(frames[27], "0|Quarterly Planning Sync With Finance");

        // re-render at 6400ms, next cycle starts at 11400ms
        tokio::time::sleep(ms(5_000)).await;
        assert_eq!(sink.frames().len(), 29);
        tokio::time::sleep(ms(1_000)).await;
        assert_eq!(sink.frames()[29], "0|Quarterly ");
    }

    #[tokio::test(start_paused = true)]
    async fn short_or_missing_footer_only_renders_static_frames() {
        let scheduler = scheduler();
        let sink = Arc::new(RecordingSink::default());

        let _handle = scheduler.submit(&SlotId::from("a"), request(1, None), sink.clone());
        tokio::time::sleep(ms(6_500)).await;
        assert_eq!(sink.frames(), vec!["1|", "1|", "1|"]);

        let sink = Arc::new(RecordingSink::default());
        let _handle = scheduler.submit(&SlotId::from("b"), request(1, Some("Standup")), sink.clone());
        tokio::time::sleep(ms(500)).await;
        assert_eq!(sink.frames(), vec!["1|Standup"]);
    }

    #[tokio::test(start_paused = true)]
    async fn slots_are_independent() {
        let scheduler = scheduler();
        let sink_a = Arc::new(RecordingSink::default());
        let sink_b = Arc::new(RecordingSink::default());

        let _a = scheduler.submit(&SlotId::from("a"), request(1, None), sink_a.clone());
        let _b = scheduler.submit(&SlotId::from("b"), request(2, None), sink_b.clone());
        tokio::time::sleep(ms(500)).await;

        assert_eq!(sink_a.frames(), vec!["1|"]);
        assert_eq!(sink_b.frames(), vec!["2|"]);
    }

    #[tokio::test(start_paused = true)]
    async fn disposed_slot_ignores_later_submits() {
        let scheduler = scheduler();
        let slot = SlotId::from("ctx-1");
        let sink = Arc::new(RecordingSink::default());

        let first = scheduler.submit(&slot, request(1, None), sink.clone());
        tokio::time::sleep(ms(100)).await;
        scheduler.dispose(&slot);
        first.join().await;

        let late = scheduler.submit(&slot, request(9, None), sink.clone());
        assert!(late.is_finished());
        tokio::time::sleep(ms(10_000)).await;

        assert_eq!(sink.frames(), vec!["1|"]);
        assert!(!scheduler.is_running(&slot));
        assert!(lock(&scheduler.slots).live.is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn delivery_failure_waits_and_restarts_cycle() {
        let scheduler = scheduler();
        let sink = Arc::new(RecordingSink::failing_first(1));

        let handle = scheduler.submit(&SlotId::from("ctx"), request(3, None), sink.clone());
        tokio::time::sleep(ms(4_900)).await;
        assert!(sink.frames().is_empty());

        tokio::time::sleep(ms(200)).await;
        assert_eq!(sink.frames(), vec!["3|"]);
        assert_eq!(*sink.attempts.lock().unwrap(), 2);
        assert!(!handle.is_finished());
    }
}
