use std::time::Instant;

/// Index value meaning "not in the heap".
pub(crate) const NO_HEAP_IDX: usize = usize::MAX;

#[derive(Clone, Copy)]
struct Entry {
    deadline: Instant,
    id: usize,
}

/// Binary min-heap of timer deadlines, ordered by absolute expiration.
///
/// Each registered event is present at most once. The heap reports every
/// index move through the `track` callback so the owner can store the
/// position inside the registration, giving O(log n) removal.
pub(crate) struct TimeHeap {
    entries: Vec<Entry>,
}

impl TimeHeap {
    pub(crate) fn new() -> TimeHeap {
        TimeHeap {
            entries: Vec::new(),
        }
    }

    pub(crate) fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub(crate) fn len(&self) -> usize {
        self.entries.len()
    }

    /// The earliest deadline and its event, if any.
    pub(crate) fn top(&self) -> Option<(Instant, usize)> {
        self.entries.first().map(|e| (e.deadline, e.id))
    }

    pub(crate) fn is_top(&self, idx: usize) -> bool {
        idx == 0 && !self.entries.is_empty()
    }

    pub(crate) fn push(
        &mut self,
        deadline: Instant,
        id: usize,
        track: &mut dyn FnMut(usize, usize),
    ) {
        let idx = self.entries.len();
        self.entries.push(Entry { deadline, id });
        track(id, idx);
        self.shift_up(idx, track);
    }

    pub(crate) fn pop(&mut self, track: &mut dyn FnMut(usize, usize)) -> Option<(Instant, usize)> {
        if self.entries.is_empty() {
            return None;
        }
        let top = self.entries[0];
        track(top.id, NO_HEAP_IDX);
        let last = self.entries.pop().unwrap();
        if !self.entries.is_empty() {
            self.entries[0] = last;
            track(last.id, 0);
            self.shift_down(0, track);
        }
        Some((top.deadline, top.id))
    }

    /// Remove the entry at `idx` (as previously reported through `track`).
    pub(crate) fn remove(&mut self, idx: usize, track: &mut dyn FnMut(usize, usize)) {
        debug_assert!(idx < self.entries.len());
        track(self.entries[idx].id, NO_HEAP_IDX);
        let last = self.entries.pop().unwrap();
        if idx == self.entries.len() {
            return;
        }
        self.entries[idx] = last;
        track(last.id, idx);
        // The replacement may belong either above or below its new slot.
        if idx > 0 && last.deadline < self.entries[(idx - 1) / 2].deadline {
            self.shift_up(idx, track);
        } else {
            self.shift_down(idx, track);
        }
    }

    fn shift_up(&mut self, mut idx: usize, track: &mut dyn FnMut(usize, usize)) {
        while idx > 0 {
            let parent = (idx - 1) / 2;
            if self.entries[parent].deadline <= self.entries[idx].deadline {
                break;
            }
            self.entries.swap(parent, idx);
            track(self.entries[idx].id, idx);
            track(self.entries[parent].id, parent);
            idx = parent;
        }
    }

    fn shift_down(&mut self, mut idx: usize, track: &mut dyn FnMut(usize, usize)) {
        loop {
            let left = 2 * idx + 1;
            if left >= self.entries.len() {
                break;
            }
            let mut child = left;
            let right = left + 1;
            if right < self.entries.len()
                && self.entries[right].deadline < self.entries[left].deadline
            {
                child = right;
            }
            if self.entries[idx].deadline <= self.entries[child].deadline {
                break;
            }
            self.entries.swap(idx, child);
            track(self.entries[idx].id, idx);
            track(self.entries[child].id, child);
            idx = child;
        }
    }

    #[cfg(test)]
    fn check(&self) {
        for idx in 1..self.entries.len() {
            let parent = (idx - 1) / 2;
            assert!(self.entries[parent].deadline <= self.entries[idx].deadline);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;
    use std::time::Duration;

    fn tracker(map: &mut HashMap<usize, usize>) -> impl FnMut(usize, usize) + '_ {
        move |id, idx| {
            if idx == NO_HEAP_IDX {
                map.remove(&id);
            } else {
                map.insert(id, idx);
            }
        }
    }

    #[test]
    fn ordering() {
        let now = Instant::now();
        let mut heap = TimeHeap::new();
        let mut idxs = HashMap::new();
        let mut track = tracker(&mut idxs);

        for (id, ms) in [(0, 50u64), (1, 10), (2, 30)] {
            heap.push(now + Duration::from_millis(ms), id, &mut track);
        }
        heap.check();

        assert_eq!(heap.pop(&mut track).unwrap().1, 1);
        assert_eq!(heap.pop(&mut track).unwrap().1, 2);
        assert_eq!(heap.pop(&mut track).unwrap().1, 0);
        assert!(heap.pop(&mut track).is_none());
        drop(track);
        assert!(idxs.is_empty());
    }

    #[test]
    fn remove_by_index() {
        let now = Instant::now();
        let mut heap = TimeHeap::new();
        let mut idxs = HashMap::new();

        {
            let mut track = tracker(&mut idxs);
            for id in 0..10usize {
                let ms = (id * 37 % 11) as u64;
                heap.push(now + Duration::from_millis(ms), id, &mut track);
            }
        }
        heap.check();

        // Remove a middle element and re-validate the heap shape.
        let idx = idxs[&4];
        let mut track = tracker(&mut idxs);
        heap.remove(idx, &mut track);
        drop(track);
        heap.check();
        assert_eq!(heap.len(), 9);
        assert!(!idxs.contains_key(&4));

        // Every remaining id pops exactly once, in deadline order.
        let mut last = None;
        let mut track = tracker(&mut idxs);
        while let Some((deadline, _)) = heap.pop(&mut track) {
            if let Some(prev) = last {
                assert!(prev <= deadline);
            }
            last = Some(deadline);
        }
    }

    #[test]
    fn top_tracks_minimum() {
        let now = Instant::now();
        let mut heap = TimeHeap::new();
        let mut idxs = HashMap::new();
        let mut track = tracker(&mut idxs);

        heap.push(now + Duration::from_millis(100), 7, &mut track);
        assert_eq!(heap.top().unwrap().1, 7);
        heap.push(now + Duration::from_millis(5), 8, &mut track);
        assert_eq!(heap.top().unwrap().1, 8);
        assert!(heap.is_top(0));
    }
}
