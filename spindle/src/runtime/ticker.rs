use bitflags::bitflags;

#[derive(Debug)]
pub(crate) struct Ticker {
    tick: u32,
}

impl Ticker {
    pub(crate) fn new() -> Self {
        Self { tick: 0 }
    }

    pub(crate) fn tick<T: TickerData>(&mut self, ctx: &T::Context, data: &mut T) -> TickerEvents {
        self.tick = self.tick.wrapping_add(1);
        data.update_and_check(ctx, self.tick)
    }
}

/// Turns worker ticks into [`TickerEvents`]. The ticker only counts; the
/// implementor decides what each tick means.
pub(crate) trait TickerData {
    type Context;

    fn update_and_check(&mut self, ctx: &Self::Context, tick: u32) -> TickerEvents;
}

bitflags! {
    #[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
    pub(crate) struct TickerEvents: u16 {
        /// The scheduler is shutting down, the worker must exit its loop.
        const SHUTDOWN = 1;

        /// Look at the shared queue before the worker's own queue.
        const POP_SHARED_QUEUE = 1 << 1;
    }
}
