use std::time::Duration;

/// Yields the same interval forever. Bound it with [Iterator::take].
#[derive(Debug, Clone, Copy)]
pub struct Interval {
    duration: Duration,
}

impl Interval {
    pub fn new(duration: Duration) -> Self {
        Self { duration }
    }

    pub fn from_millis(millis: u64) -> Self {
        Self::new(Duration::from_millis(millis))
    }
}

impl Iterator for Interval {
    type Item = Duration;

    fn next(&mut self) -> Option<Self::Item> {
        Some(self.duration)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn yields_constant_interval() {
        let delays: Vec<_> = Interval::from_millis(5).take(3).collect();
        assert_eq!(delays, vec![Duration::from_millis(5); 3]);
    }
}
