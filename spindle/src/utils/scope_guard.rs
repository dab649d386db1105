/// Runs a closure when dropped, including during unwinding.
///
/// The closure runs at most once. [`disarm`](Self::disarm) cancels it.
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
        self.on_drop.take();
    }
}

impl<F: FnOnce()> Drop for ScopeGuard<F> {
    fn drop(&mut self) {
        if let Some(on_drop) = self.on_drop.take() {
            on_drop();
        }
    }
}
