use std::time::{Duration, Instant};

/// Handle to a timer owned by one script host.
///
/// Handles carry the generation of the slot they were issued for, so a handle
/// kept around after its timer is gone never reaches a newer timer that reused
/// the same slot.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct TimerId {
    index: u32,
    generation: u32,
}

/// A timer with metadata
#[derive(Debug, Clone)]
struct Timer<C> {
    callback: C,
    interval: Duration,
    single_shot: bool,
    next_fire: Instant,
}

#[derive(Debug)]
struct Slot<C> {
    generation: u32,
    timer: Option<Timer<C>>,
}

/// Arena of timers for a single script host
///
/// The registry never calls anything itself: the owning host asks which timers
/// are due and then fires them one at a time with [`TimerRegistry::fire`], so
/// a callback is free to schedule or cancel timers while it runs.
#[derive(Debug)]
pub struct TimerRegistry<C> {
    slots: Vec<Slot<C>>,
    free: Vec<u32>,
    active: usize,
}

impl<C: Clone> TimerRegistry<C> {
    /// Create an empty registry
    pub fn new() -> Self {
        Self {
            slots: Vec::new(),
            free: Vec::new(),
            active: 0,
        }
    }

    /// Register a callback and start its timer
    pub fn schedule(
        &mut self,
        callback: C,
        interval: Duration,
        single_shot: bool,
        now: Instant,
    ) -> TimerId {
        let timer = Timer {
            callback,
            interval,
            single_shot,
            next_fire: now + interval,
        };

        self.active += 1;
        if let Some(index) = self.free.pop() {
            let slot = &mut self.slots[index as usize];
            slot.timer = Some(timer);
            return TimerId {
                index,
                generation: slot.generation,
            };
        }

        let index = self.slots.len() as u32;
        self.slots.push(Slot {
            generation: 0,
            timer: Some(timer),
        });
        TimerId {
            index,
            generation: 0,
        }
    }

    /// Stop and remove a timer. Returns false if the handle is stale or unknown.
    pub fn cancel(&mut self, id: TimerId) -> bool {
        match self.slots.get(id.index as usize) {
            Some(slot) if slot.generation == id.generation && slot.timer.is_some() => {
                self.release(id.index);
                true
            }
            _ => false,
        }
    }

    /// Remove every timer regardless of state
    pub fn cancel_all(&mut self) -> usize {
        let cancelled = self.active;
        for index in 0..self.slots.len() as u32 {
            if self.slots[index as usize].timer.is_some() {
                self.release(index);
            }
        }
        cancelled
    }

    /// Whether the handle still refers to a live timer
    pub fn contains(&self, id: TimerId) -> bool {
        self.slots
            .get(id.index as usize)
            .is_some_and(|slot| slot.generation == id.generation && slot.timer.is_some())
    }

    /// Timers whose deadline has passed, earliest first
    pub fn due(&self, now: Instant) -> Vec<TimerId> {
        let mut due: Vec<(Instant, TimerId)> = self
            .slots
            .iter()
            .enumerate()
            .filter_map(|(index, slot)| {
                let timer = slot.timer.as_ref()?;
                (now >= timer.next_fire).then_some((
                    timer.next_fire,
                    TimerId {
                        index: index as u32,
                        generation: slot.generation,
                    },
                ))
            })
            .collect();
        due.sort_by_key(|(deadline, _)| *deadline);
        due.into_iter().map(|(_, id)| id).collect()
    }

    /// Fire a due timer and hand back its callback.
    ///
    /// A single-shot timer is removed before its callback is returned, so the
    /// callback never observes its own dead handle. A repeating timer is
    /// rearmed. Returns `None` when the timer was cancelled in the meantime.
    pub fn fire(&mut self, id: TimerId, now: Instant) -> Option<C> {
        if !self.contains(id) {
            return None;
        }

        let slot = &mut self.slots[id.index as usize];
        let timer = slot.timer.as_mut()?;
        if timer.single_shot {
            let callback = timer.callback.clone();
            self.release(id.index);
            return Some(callback);
        }

        timer.next_fire = now + timer.interval;
        Some(timer.callback.clone())
    }

    /// Get the number of active timers
    pub fn active_count(&self) -> usize {
        self.active
    }

    fn release(&mut self, index: u32) {
        let slot = &mut self.slots[index as usize];
        if slot.timer.take().is_some() {
            slot.generation = slot.generation.wrapping_add(1);
            self.free.push(index);
            self.active -= 1;
        }
    }
}

impl<C: Clone> Default for TimerRegistry<C> {
    fn default() -> Self {
        Self::new()
    }
}
