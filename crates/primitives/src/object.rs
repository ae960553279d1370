use bitflags::bitflags;
use core::fmt;
use std::{rc::Rc, vec::Vec};

/// Stable handle into the [`ObjectTable`]. Handles are never reused; a
/// destructed object keeps its slot with the `DESTRUCTED` flag set so stale
/// handles resolve to a dead object instead of a different one.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct ObjectId(usize);

impl ObjectId {
    #[inline]
    pub const fn index(self) -> usize {
        self.0
    }
}

impl fmt::Display for ObjectId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

/// Slot handle into the user table. Slots are reused across connections;
/// all liveness checks go through the object back-pointer.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct UserId(usize);

impl UserId {
    #[inline]
    pub const fn new(slot: usize) -> Self {
        Self(slot)
    }

    #[inline]
    pub const fn slot(self) -> usize {
        self.0
    }
}

bitflags! {
    #[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
    #[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
    #[cfg_attr(feature = "serde", serde(transparent))]
    pub struct ObjectFlags: u8 {
        const DESTRUCTED = 0b0000_0001;
        const ONCE_INTERACTIVE = 0b0000_0010;
    }
}

#[derive(Clone, Debug)]
pub struct Object {
    pub name: Rc<str>,
    pub flags: ObjectFlags,
    pub interactive: Option<UserId>,
}

impl Object {
    #[inline]
    pub fn is_destructed(&self) -> bool {
        self.flags.contains(ObjectFlags::DESTRUCTED)
    }
}

/// Grow-only arena of objects. The real lifecycle (loading, swapping,
/// garbage collection) lives outside this core; the table carries exactly
/// the contract the dispatcher needs: flags, name and the interactive
/// back-pointer.
#[derive(Debug, Default)]
pub struct ObjectTable {
    objects: Vec<Object>,
}

impl ObjectTable {
    #[inline]
    pub fn new() -> Self {
        Self::default()
    }

    pub fn create(&mut self, name: &str) -> ObjectId {
        self.objects.push(Object {
            name: Rc::from(name),
            flags: ObjectFlags::empty(),
            interactive: None,
        });
        ObjectId(self.objects.len() - 1)
    }

    #[inline]
    pub fn get(&self, id: ObjectId) -> Option<&Object> {
        self.objects.get(id.0)
    }

    #[inline]
    pub fn get_mut(&mut self, id: ObjectId) -> Option<&mut Object> {
        self.objects.get_mut(id.0)
    }

    /// True when the handle resolves to an object that has not been
    /// destructed.
    #[inline]
    pub fn is_live(&self, id: ObjectId) -> bool {
        self.get(id).is_some_and(|ob| !ob.is_destructed())
    }

    #[inline]
    pub fn name(&self, id: ObjectId) -> Option<&Rc<str>> {
        self.get(id).map(|ob| &ob.name)
    }

    #[inline]
    pub fn interactive_of(&self, id: ObjectId) -> Option<UserId> {
        self.get(id).and_then(|ob| ob.interactive)
    }

    /// Marks the object destructed and severs the interactive back-pointer.
    /// The session itself is torn down by the user table, which also owns
    /// the snoop unlinking.
    pub fn destruct(&mut self, id: ObjectId) -> Option<UserId> {
        let ob = self.objects.get_mut(id.0)?;
        ob.flags.insert(ObjectFlags::DESTRUCTED);
        ob.interactive.take()
    }

    #[inline]
    pub fn len(&self) -> usize {
        self.objects.len()
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.objects.is_empty()
    }
}
