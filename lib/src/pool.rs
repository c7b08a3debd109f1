//! Generational object pool for long-lived session slots.
//!
//! Slots are handed out in this order:
//! 1. the first released slot that reports itself recyclable
//! 2. the next never-used slot of the block allocated at construction
//! 3. the next never-used slot of a block grown on demand
//!
//! Allocation never blocks and never fails. Releasing a slot does not drop
//! the object, it bumps the slot generation so that every [`Ticket`] issued
//! for the previous occupant stops resolving.
use std::{fmt, sync::Arc};

use parking_lot::Mutex;

/// Implemented by pooled objects to veto their reuse
pub trait Recyclable {
    fn is_recyclable(&self) -> bool;
}

/// A `(slot index, generation)` pair identifying one occupant of a slot
#[derive(Clone, Copy, PartialEq, Eq, Hash)]
pub struct Ticket {
    pub index: usize,
    pub generation: u64,
}

impl fmt::Debug for Ticket {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Ticket({}/{})", self.index, self.generation)
    }
}

impl fmt::Display for Ticket {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.index, self.generation)
    }
}

struct Slot<T> {
    generation: u64,
    live: bool,
    node: Arc<Mutex<T>>,
}

struct Slots<T> {
    slots: Vec<Slot<T>>,
    /// index of the next slot that was never handed out
    cursor: usize,
    free: std::collections::VecDeque<usize>,
    live: usize,
}

pub struct ObjectPool<T> {
    inner: Mutex<Slots<T>>,
    grow_by: usize,
    factory: Box<dyn Fn() -> T + Send + Sync>,
}

impl<T: Recyclable> ObjectPool<T> {
    pub fn new<F>(static_size: usize, grow_by: usize, factory: F) -> ObjectPool<T>
    where
        F: Fn() -> T + Send + Sync + 'static,
    {
        let slots = (0..static_size)
            .map(|_| Slot {
                generation: 0,
                live: false,
                node: Arc::new(Mutex::new(factory())),
            })
            .collect();

        ObjectPool {
            inner: Mutex::new(Slots {
                slots,
                cursor: 0,
                free: std::collections::VecDeque::new(),
                live: 0,
            }),
            grow_by: grow_by.max(1),
            factory: Box::new(factory),
        }
    }

    pub fn allocate(&self) -> (Ticket, Arc<Mutex<T>>) {
        let mut inner = self.inner.lock();

        // a slot whose lock is still held is being torn down by a worker,
        // it goes back to the end of the free list
        let mut recycled = None;
        for _ in 0..inner.free.len() {
            let Some(index) = inner.free.pop_front() else {
                break;
            };
            let recyclable = inner.slots[index]
                .node
                .try_lock()
                .map(|node| node.is_recyclable())
                .unwrap_or(false);
            if recyclable {
                recycled = Some(index);
                break;
            }
            inner.free.push_back(index);
        }

        let index = match recycled {
            Some(index) => index,
            None => {
                if inner.cursor == inner.slots.len() {
                    let grow_by = self.grow_by;
                    trace!("growing object pool by {} slots", grow_by);
                    for _ in 0..grow_by {
                        let node = Arc::new(Mutex::new((self.factory)()));
                        inner.slots.push(Slot {
                            generation: 0,
                            live: false,
                            node,
                        });
                    }
                }
                let index = inner.cursor;
                inner.cursor += 1;
                index
            }
        };

        inner.live += 1;
        let slot = &mut inner.slots[index];
        slot.live = true;
        (
            Ticket {
                index,
                generation: slot.generation,
            },
            slot.node.clone(),
        )
    }

    /// Returns the slot to the free list. Stale or unknown tickets are
    /// ignored and yield `false`.
    pub fn deallocate(&self, ticket: Ticket) -> bool {
        let mut inner = self.inner.lock();
        match inner.slots.get_mut(ticket.index) {
            Some(slot) if slot.live && slot.generation == ticket.generation => {
                slot.live = false;
                slot.generation = slot.generation.wrapping_add(1);
            }
            _ => return false,
        }
        inner.live -= 1;
        inner.free.push_back(ticket.index);
        true
    }

    /// resolves a ticket to its slot, `None` if the occupant changed
    pub fn get(&self, ticket: Ticket) -> Option<Arc<Mutex<T>>> {
        let inner = self.inner.lock();
        inner
            .slots
            .get(ticket.index)
            .filter(|slot| slot.live && slot.generation == ticket.generation)
            .map(|slot| slot.node.clone())
    }

    /// occupied slots
    pub fn len(&self) -> usize {
        self.inner.lock().live
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// allocated slots, occupied or not
    pub fn capacity(&self) -> usize {
        self.inner.lock().slots.len()
    }
}
