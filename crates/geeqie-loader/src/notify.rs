//! Coalescing of area-ready notifications.
//!
//! Decoders report progress in many small strips. Each report is merged
//! into the most recently queued rectangle when the two share a full edge,
//! so the consumer repaints fewer, larger areas.

use std::collections::VecDeque;

use crate::types::Rect;

/// Identifies a queued rectangle until it is delivered.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct AreaId(u64);

#[derive(Debug, Clone, Copy)]
struct PendingArea {
    id: AreaId,
    rect: Rect,
}

/// Try to grow `prev` by `rect`. The first matching rule wins.
pub fn merge_area(prev: &mut Rect, rect: Rect) -> bool {
    let same_columns = prev.x == rect.x && prev.width == rect.width;
    let same_rows = prev.y == rect.y && prev.height == rect.height;

    if same_columns && prev.bottom() == rect.y {
        // Extends downwards
        prev.height += rect.height;
        true
    } else if same_columns && rect.bottom() == prev.y {
        // Extends upwards
        prev.height += rect.height;
        prev.y = rect.y;
        true
    } else if same_rows && prev.right() == rect.x {
        // Extends to the right
        prev.width += rect.width;
        true
    } else if same_rows && rect.right() == prev.x {
        // Extends to the left
        prev.width += rect.width;
        prev.x = rect.x;
        true
    } else {
        false
    }
}

/// Rectangles waiting for delivery, oldest first.
#[derive(Debug, Default)]
pub struct AreaQueue {
    entries: VecDeque<PendingArea>,
    next_id: u64,
}

impl AreaQueue {
    pub fn new() -> Self {
        Self::default()
    }

    /// Queue `rect`, merging it into the newest entry when possible.
    ///
    /// Returns the id of a new entry, or `None` if the rectangle was merged
    /// and will be delivered with an entry that is already scheduled.
    pub fn push(&mut self, rect: Rect) -> Option<AreaId> {
        if let Some(last) = self.entries.back_mut() {
            if merge_area(&mut last.rect, rect) {
                return None;
            }
        }

        let id = AreaId(self.next_id);
        self.next_id += 1;
        self.entries.push_back(PendingArea { id, rect });
        Some(id)
    }

    /// Remove the entry `id` for delivery.
    pub fn take(&mut self, id: AreaId) -> Option<Rect> {
        let index = self.entries.iter().position(|e| e.id == id)?;
        self.entries.remove(index).map(|e| e.rect)
    }

    /// Remove every entry, oldest first.
    pub fn drain(&mut self) -> Vec<Rect> {
        self.entries.drain(..).map(|e| e.rect).collect()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// The rectangle new reports are merged into.
    pub fn last(&self) -> Option<Rect> {
        self.entries.back().map(|e| e.rect)
    }
}


// ============================================================================
// Property-Based Tests
// ============================================================================
