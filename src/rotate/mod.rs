//! PMU event-group rotation.
//!
//! Only one event group is attached at a time, so a multi-group mode
//! time-slices the groups: every rotation window the next group is attached
//! in round-robin order. The rotator also publishes the per-sample scale
//! factor (the inverse duty cycle, `max(1, group_count)`) so rollup rates
//! stay comparable no matter how many groups share the wire.

use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use parking_lot::Mutex;
use tokio::sync::Notify;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::mode::AgentMode;

/// What the rotator needs from the kernel-sampler controller.
pub trait EventGroupController: Send + Sync {
    /// Number of groups configured for the active mode.
    fn active_group_count(&self) -> usize;
    /// Index of the currently attached group.
    fn current_group_index(&self) -> usize;
    /// Detach the current group and attach the group at `index`.
    fn rotate_to_group(&self, index: usize) -> Result<()>;
}

/// Callback receiving each newly published sample scale.
pub type ScaleHandler = Box<dyn Fn(f64) + Send + Sync>;

#[derive(Default)]
struct RotatorState {
    group_count: usize,
    current_index: usize,
}

/// Round-robin group rotor.
pub struct PmuRotator {
    controller: Arc<dyn EventGroupController>,
    window: Duration,
    on_scale: ScaleHandler,
    state: Mutex<RotatorState>,
    refresh: Notify,
}

impl PmuRotator {
    pub fn new(
        controller: Arc<dyn EventGroupController>,
        window: Duration,
        on_scale: ScaleHandler,
    ) -> Self {
        Self {
            controller,
            window: if window.is_zero() {
                Duration::from_secs(5)
            } else {
                window
            },
            on_scale,
            state: Mutex::new(RotatorState::default()),
            refresh: Notify::new(),
        }
    }

    /// Capture the controller state for the initial mode, publish the scale,
    /// and spawn the rotation task.
    pub fn start(self: &Arc<Self>, _initial_mode: AgentMode, cancel: CancellationToken) {
        self.refresh_state();
        let rotator = Arc::clone(self);
        tokio::spawn(async move {
            rotator.run(cancel).await;
        });
    }

    /// The orchestrator has reprogrammed the sampler for a new mode (or a
    /// new group set); pick up the fresh group count and restart the window.
    pub fn update_mode(&self, _mode: AgentMode) {
        self.refresh_state();
        self.refresh.notify_one();
    }

    /// Re-read group count and index from the controller and publish the
    /// scale factor.
    pub fn refresh_state(&self) {
        let count = self.controller.active_group_count();
        let index = self.controller.current_group_index();
        let scale = count.max(1) as f64;
        (self.on_scale)(scale);

        let mut state = self.state.lock();
        state.group_count = count;
        state.current_index = if count == 0 {
            0
        } else {
            index.min(count - 1)
        };
    }

    async fn run(&self, cancel: CancellationToken) {
        loop {
            tokio::select! {
                _ = cancel.cancelled() => return,
                // A mode change restarts the window without rotating.
                _ = self.refresh.notified() => continue,
                _ = tokio::time::sleep(self.window) => {}
            }

            let next = {
                let state = self.state.lock();
                if state.group_count <= 1 {
                    continue;
                }
                (state.current_index + 1) % state.group_count
            };

            match self.controller.rotate_to_group(next) {
                Ok(()) => {
                    self.state.lock().current_index = next;
                    debug!(group = next, "rotated PMU group");
                }
                Err(e) => {
                    warn!(group = next, error = %e, "PMU group rotation failed, refreshing state");
                    self.refresh_state();
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct FakeController {
        groups: AtomicUsize,
        index: AtomicUsize,
        fail_rotations: std::sync::atomic::AtomicBool,
        rotations: Mutex<Vec<usize>>,
    }

    impl FakeController {
        fn new(groups: usize) -> Self {
            Self {
                groups: AtomicUsize::new(groups),
                index: AtomicUsize::new(0),
                fail_rotations: std::sync::atomic::AtomicBool::new(false),
                rotations: Mutex::new(Vec::new()),
            }
        }
    }

    impl EventGroupController for FakeController {
        fn active_group_count(&self) -> usize {
            self.groups.load(Ordering::Relaxed)
        }

        fn current_group_index(&self) -> usize {
            self.index.load(Ordering::Relaxed)
        }

        fn rotate_to_group(&self, index: usize) -> Result<()> {
            if self.fail_rotations.load(Ordering::Relaxed) {
                anyhow::bail!("attach failed");
            }
            self.rotations.lock().push(index);
            self.index.store(index, Ordering::Relaxed);
            Ok(())
        }
    }

    fn rotator_with(
        controller: Arc<FakeController>,
        window: Duration,
    ) -> (Arc<PmuRotator>, Arc<Mutex<Vec<f64>>>) {
        let scales = Arc::new(Mutex::new(Vec::new()));
        let scales_ref = Arc::clone(&scales);
        let rotator = Arc::new(PmuRotator::new(
            controller,
            window,
            Box::new(move |scale| scales_ref.lock().push(scale)),
        ));
        (rotator, scales)
    }

    #[test]
    fn test_scale_published_on_refresh() {
        let controller = Arc::new(FakeController::new(3));
        let (rotator, scales) = rotator_with(Arc::clone(&controller), Duration::from_secs(5));
        rotator.refresh_state();
        assert_eq!(*scales.lock(), vec![3.0]);

        controller.groups.store(0, Ordering::Relaxed);
        rotator.refresh_state();
        assert_eq!(*scales.lock(), vec![3.0, 1.0]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_rotation_cycles_groups() {
        let controller = Arc::new(FakeController::new(3));
        let (rotator, _) = rotator_with(Arc::clone(&controller), Duration::from_millis(100));
        let cancel = CancellationToken::new();
        rotator.start(AgentMode::Sentinel, cancel.clone());

        tokio::time::sleep(Duration::from_millis(350)).await;
        cancel.cancel();
        tokio::time::sleep(Duration::from_millis(10)).await;

        let rotations = controller.rotations.lock().clone();
        assert!(rotations.len() >= 3, "rotations: {rotations:?}");
        assert_eq!(&rotations[..3], &[1, 2, 0]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_single_group_never_rotates() {
        let controller = Arc::new(FakeController::new(1));
        let (rotator, _) = rotator_with(Arc::clone(&controller), Duration::from_millis(50));
        let cancel = CancellationToken::new();
        rotator.start(AgentMode::Sentinel, cancel.clone());

        tokio::time::sleep(Duration::from_millis(500)).await;
        cancel.cancel();

        assert!(controller.rotations.lock().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_failed_rotation_refreshes_state() {
        let controller = Arc::new(FakeController::new(2));
        let (rotator, scales) = rotator_with(Arc::clone(&controller), Duration::from_millis(50));
        controller.fail_rotations.store(true, Ordering::Relaxed);
        let cancel = CancellationToken::new();
        rotator.start(AgentMode::Sentinel, cancel.clone());

        tokio::time::sleep(Duration::from_millis(120)).await;
        cancel.cancel();
        tokio::time::sleep(Duration::from_millis(10)).await;

        assert!(controller.rotations.lock().is_empty());
        // Initial publish plus one per failed rotation.
        assert!(scales.lock().len() >= 2);
    }
}
