//! Unread counter.

/// Number of unread notifications as last reported or provisionally adjusted.
///
/// Unsigned and saturating, so it can never go negative.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct UnreadCounter(u64);

impl UnreadCounter {
    pub fn new(value: u64) -> Self {
        Self(value)
    }

    pub fn get(&self) -> u64 {
        self.0
    }

    pub fn set(&mut self, value: u64) {
        self.0 = value;
    }

    pub fn increment(&mut self) {
        self.0 = self.0.saturating_add(1);
    }

    pub fn decrement(&mut self) {
        self.0 = self.0.saturating_sub(1);
    }

    pub fn reset(&mut self) {
        self.0 = 0;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_decrement_floors_at_zero() {
        let mut counter = UnreadCounter::new(1);
        counter.decrement();
        counter.decrement();
        assert_eq!(counter.get(), 0);
    }

    #[test]
    fn test_increment_and_set() {
        let mut counter = UnreadCounter::default();
        counter.increment();
        counter.increment();
        assert_eq!(counter.get(), 2);

        counter.set(7);
        assert_eq!(counter.get(), 7);

        counter.reset();
        assert_eq!(counter, UnreadCounter::new(0));
    }
}
