/// A fixed-capacity circular buffer of the most recent raw inputs.
///
/// Unlike a "wait until full" average, `average()` covers whatever is in the
/// window right now, so the first value averages to itself.
#[derive(Debug, Clone)]
pub struct RollingWindow {
    buffer: Vec<f64>,
    capacity: usize,
    index: usize,
}

impl RollingWindow {
    /// A window holding at most `capacity` values (at least one).
    pub fn new(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        Self {
            buffer: Vec::with_capacity(capacity),
            capacity,
            index: 0,
        }
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn len(&self) -> usize {
        self.buffer.len()
    }

    pub fn is_empty(&self) -> bool {
        self.buffer.is_empty()
    }

    /// Add a value, evicting the oldest once full. Returns the new average.
    pub fn push(&mut self, value: f64) -> f64 {
        if self.buffer.len() < self.capacity {
            self.buffer.push(value);
        } else {
            self.buffer[self.index] = value;
        }
        self.index = (self.index + 1) % self.capacity;
        self.average().unwrap_or(value)
    }

    /// Arithmetic mean of the current contents, `None` when empty.
    pub fn average(&self) -> Option<f64> {
        if self.buffer.is_empty() {
            return None;
        }
        // Summed fresh each time so evictions never accumulate float drift.
        let sum: f64 = self.buffer.iter().sum();
        Some(sum / self.buffer.len() as f64)
    }
}
