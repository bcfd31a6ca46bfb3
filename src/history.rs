//! History of requested windows, input of the movement predictor

use std::collections::VecDeque;

use crate::window::ViewWindow;

/// Default number of windows remembered
pub const HISTORY_SIZE: usize = 10;

/// Bounded FIFO of the most recent foreground windows
#[derive(Debug, Clone)]
pub struct WoiHistory {
    windows: VecDeque<ViewWindow>,
    capacity: usize,
}

impl WoiHistory {
    /// Creates a new history holding at most `capacity` windows
    pub fn new(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        Self {
            windows: VecDeque::with_capacity(capacity),
            capacity,
        }
    }

    /// Records a window, evicting the oldest one when full
    pub fn record(&mut self, window: ViewWindow) {
        if self.windows.len() >= self.capacity {
            self.windows.pop_front();
        }
        self.windows.push_back(window);
    }

    /// Most recent window
    pub fn last(&self) -> Option<&ViewWindow> {
        self.windows.back()
    }

    /// Windows from oldest to newest
    pub fn iter(&self) -> impl Iterator<Item = &ViewWindow> {
        self.windows.iter()
    }

    /// Copy of the windows, oldest first
    pub fn snapshot(&self) -> Vec<ViewWindow> {
        self.windows.iter().cloned().collect()
    }

    pub fn clear(&mut self) {
        self.windows.clear();
    }

    pub fn len(&self) -> usize {
        self.windows.len()
    }

    pub fn is_empty(&self) -> bool {
        self.windows.is_empty()
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }
}

impl Default for WoiHistory {
    fn default() -> Self {
        Self::new(HISTORY_SIZE)
    }
}
