/// The single counter every timeline value in a run is drawn from.
///
/// Values start at 1 (a fresh timeline semaphore already sits at 0) and only ever grow, so a
/// wait for value `n` can never be satisfied by an older submission.
#[derive(Clone, Debug, Default)]
pub struct TimelineCounter {
    value: u64,
}

impl TimelineCounter {
    pub fn new() -> TimelineCounter {
        TimelineCounter { value: 0 }
    }

    /// Last value handed out, 0 if none yet.
    pub fn current(&self) -> u64 {
        self.value
    }

    pub fn advance(&mut self) -> u64 {
        self.value += 1;
        self.value
    }
}

/// Device-side wait until `semaphore` reaches `value`.
#[derive(Debug)]
pub struct TimelineWait<'a, S> {
    pub semaphore: &'a S,
    pub value: u64,
}

/// Device-side signal setting `semaphore` to `value`.
#[derive(Debug)]
pub struct TimelineSignal<'a, S> {
    pub semaphore: &'a S,
    pub value: u64,
}

impl<S> Clone for TimelineWait<'_, S> {
    fn clone(&self) -> Self {
        *self
    }
}

impl<S> Copy for TimelineWait<'_, S> {}

impl<S> Clone for TimelineSignal<'_, S> {
    fn clone(&self) -> Self {
        *self
    }
}

impl<S> Copy for TimelineSignal<'_, S> {}
