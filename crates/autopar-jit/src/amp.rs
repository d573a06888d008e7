//! Mixed-precision state for compiled calls.
//!
//! While an AMP dtype is set on the current thread, compiled functions are specialized with
//! `f32` in place of that dtype for their inputs.

use std::cell::Cell;

use autopar::DType;

use crate::InputSpec;

thread_local! {
    static AMP_DTYPE: Cell<Option<DType>> = const { Cell::new(None) };
}

/// The low-precision dtype of the active AMP region on this thread, if any.
pub fn amp_dtype() -> Option<DType> {
    AMP_DTYPE.with(|dtype| dtype.get())
}

pub fn set_amp_dtype(dtype: Option<DType>) {
    AMP_DTYPE.with(|cell| cell.set(dtype));
}

/// Enters an AMP region for its lifetime and restores the previous state on drop.
pub struct AmpGuard {
    previous: Option<DType>,
}

impl AmpGuard {
    pub fn new(dtype: DType) -> Self {
        let previous = amp_dtype();
        set_amp_dtype(Some(dtype));
        Self { previous }
    }
}

impl Drop for AmpGuard {
    fn drop(&mut self) {
        set_amp_dtype(self.previous);
    }
}

/// Casts inputs of the active AMP dtype to `f32`. Other specs are left alone.
pub fn amp_cast_inputs(mut specs: Vec<InputSpec>) -> Vec<InputSpec> {
    let Some(amp) = amp_dtype() else {
        return specs;
    };
    for spec in specs.iter_mut().filter(|spec| spec.dtype == amp) {
        log::trace!("[AMP] Cast {amp} input {:?} into f32", spec.shape);
        spec.dtype = DType::F32;
    }
    specs
}
