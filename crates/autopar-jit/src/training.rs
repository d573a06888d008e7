use std::cell::Cell;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum TrainingMode {
    #[default]
    Train,
    Eval,
}

thread_local! {
    static TRAINING_MODE: Cell<TrainingMode> = const { Cell::new(TrainingMode::Train) };
}

/// Returns whether modules on this thread are in training mode.
pub fn is_training() -> bool {
    TRAINING_MODE.with(|mode| mode.get()) == TrainingMode::Train
}

pub fn training_mode() -> TrainingMode {
    TRAINING_MODE.with(|mode| mode.get())
}

pub fn set_training_mode(mode: TrainingMode) {
    TRAINING_MODE.with(|cell| cell.set(mode));
}

/// Sets the training mode for its lifetime and restores the previous mode on drop.
pub struct TrainingModeGuard {
    previous: TrainingMode,
}

impl TrainingModeGuard {
    pub fn new(mode: TrainingMode) -> Self {
        let previous = training_mode();
        set_training_mode(mode);
        Self { previous }
    }
}

impl Drop for TrainingModeGuard {
    fn drop(&mut self) {
        set_training_mode(self.previous);
    }
}
