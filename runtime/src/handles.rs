//! Opaque integer handles for host-side objects.
//!
//! The guest never sees host objects directly, only `u32` ids into a table
//! owned by the subsystem that created them. Id 0 always means "no object".

/// Registry mapping ids to host objects.
///
/// Ids start at 1, increase monotonically and are never reused, so a stale
/// id can never alias a newer object.
#[derive(Debug, Clone)]
pub struct HandleTable<T> {
    /// Slot `i` holds the object with id `i`; slot 0 is always empty.
    slots: Vec<Option<T>>,
    /// Id handed out by the next `allocate`.
    next_id: u32,
    /// Number of live entries.
    live: usize,
}

impl<T> HandleTable<T> {
    /// Create an empty table.
    pub fn new() -> Self {
        HandleTable {
            slots: vec![None],
            next_id: 1,
            live: 0,
        }
    }

    /// Store `value` and return its id.
    pub fn allocate(&mut self, value: T) -> u32 {
        let id = self.next_id;
        self.next_id += 1;
        while self.slots.len() < id as usize {
            self.slots.push(None);
        }
        self.slots.push(Some(value));
        self.live += 1;
        id
    }

    /// Look up an id.
    pub fn get(&self, id: u32) -> Option<&T> {
        self.slots.get(id as usize).and_then(Option::as_ref)
    }

    /// Look up an id for mutation.
    pub fn get_mut(&mut self, id: u32) -> Option<&mut T> {
        self.slots.get_mut(id as usize).and_then(Option::as_mut)
    }

    /// Remove an id, returning its object. The id is never handed out again.
    pub fn release(&mut self, id: u32) -> Option<T> {
        let value = self.slots.get_mut(id as usize)?.take();
        if value.is_some() {
            self.live -= 1;
        }
        value
    }

    /// Whether `id` refers to a live object.
    pub fn contains(&self, id: u32) -> bool {
        self.get(id).is_some()
    }

    /// Number of live entries.
    pub fn len(&self) -> usize {
        self.live
    }

    pub fn is_empty(&self) -> bool {
        self.live == 0
    }

    /// Id the next allocation will receive.
    pub fn next_id(&self) -> u32 {
        self.next_id
    }

    /// Iterate over live `(id, object)` pairs in id order.
    pub fn iter(&self) -> impl Iterator<Item = (u32, &T)> {
        self.slots
            .iter()
            .enumerate()
            .filter_map(|(id, slot)| slot.as_ref().map(|value| (id as u32, value)))
    }
}

impl<T> Default for HandleTable<T> {
    fn default() -> Self {
        Self::new()
    }
}
