/// Runs a closure when dropped, unless disarmed first.
///
/// Used to fault completion sources whose producer went away without
/// completing them: the guard travels with the work, and the happy path
/// disarms it right before delivering a result.
pub(crate) struct ScopeGuard<F: FnOnce()> {
    on_drop: Option<F>,
}

impl<F: FnOnce()> ScopeGuard<F> {
    pub(crate) fn new(on_drop: F) -> Self {
        Self {
            on_drop: Some(on_drop),
        }
    }

    pub(crate) fn disarm(&mut self) {
        self.on_drop = None;
    }

    pub(crate) fn is_armed(&self) -> bool {
        self.on_drop.is_some()
    }
}

impl<F: FnOnce()> Drop for ScopeGuard<F> {
    fn drop(&mut self) {
        // `take` guarantees a single invocation even if the closure panics.
        if let Some(on_drop) = self.on_drop.take() {
            on_drop();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::cell::Cell;

    #[test]
    fn test_guard_runs_on_drop() {
        let fired = Cell::new(false);
        {
            let guard = ScopeGuard::new(|| fired.set(true));
            assert!(guard.is_armed());
        }
        assert!(fired.get());
    }

    #[test]
    fn test_disarmed_guard_does_nothing() {
        let fired = Cell::new(false);
        {
            let mut guard = ScopeGuard::new(|| fired.set(true));
            guard.disarm();
            assert!(!guard.is_armed());
        }
        assert!(!fired.get());
    }
}
