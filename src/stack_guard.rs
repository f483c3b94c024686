//! Scoped stack discipline.
//!
//! Every bounded binding operation that pushes temporaries runs them under a
//! [`StackGuard`], which records the stack height on entry and restores it on
//! drop — so normal returns, early returns and propagated errors all leave
//! the stack at its pre-operation height.

use std::ops::{Deref, DerefMut};

use crate::state::State;

/// Restores the recorded stack height when dropped.
///
/// Dereferences to the guarded [`State`], so guarded code reads the same as
/// unguarded code:
///
/// ```ignore
/// let mut state = StackGuard::new(state);
/// state.push(1i64);
/// state.push("temp");
/// // guard drops here; both pushes are gone
/// ```
pub struct StackGuard<'a> {
    state: &'a mut State,
    top: usize,
}

impl<'a> StackGuard<'a> {
    pub fn new(state: &'a mut State) -> Self {
        let top = state.absolute_top();
        StackGuard { state, top }
    }

    /// The recorded (absolute) height the guard will restore.
    pub fn saved_top(&self) -> usize {
        self.top
    }
}

impl Deref for StackGuard<'_> {
    type Target = State;

    fn deref(&self) -> &State {
        self.state
    }
}

impl DerefMut for StackGuard<'_> {
    fn deref_mut(&mut self) -> &mut State {
        self.state
    }
}

impl Drop for StackGuard<'_> {
    fn drop(&mut self) {
        self.state.restore_absolute_top(self.top);
    }
}
