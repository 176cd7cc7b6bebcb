use std::cell::{Cell, RefCell};
use std::collections::HashMap;
use std::hash::Hash;
use std::rc::Rc;

/// Single-owner token. At most one owner at a time; the owner releases it by
/// dropping the [`OwnerGuard`].
#[derive(Debug)]
pub struct OwnerToken<T: Copy + Eq> {
    owner: Rc<Cell<Option<T>>>,
}

impl<T: Copy + Eq> Clone for OwnerToken<T> {
    fn clone(&self) -> Self {
        Self {
            owner: self.owner.clone(),
        }
    }
}

impl<T: Copy + Eq> Default for OwnerToken<T> {
    fn default() -> Self {
        Self {
            owner: Rc::new(Cell::new(None)),
        }
    }
}

impl<T: Copy + Eq> OwnerToken<T> {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn holder(&self) -> Option<T> {
        self.owner.get()
    }

    pub fn is_held(&self) -> bool {
        self.owner.get().is_some()
    }

    /// Held by someone other than `who`.
    pub fn is_held_by_other(&self, who: T) -> bool {
        matches!(self.owner.get(), Some(o) if o != who)
    }

    /// Take the token if free.
    pub fn try_acquire(&self, who: T) -> Option<OwnerGuard<T>> {
        if self.owner.get().is_some() {
            return None;
        }
        self.owner.set(Some(who));
        Some(OwnerGuard {
            owner: self.owner.clone(),
            who,
        })
    }
}

#[derive(Debug)]
pub struct OwnerGuard<T: Copy + Eq> {
    owner: Rc<Cell<Option<T>>>,
    who: T,
}

impl<T: Copy + Eq> OwnerGuard<T> {
    pub fn owner(&self) -> T {
        self.who
    }
}

impl<T: Copy + Eq> Drop for OwnerGuard<T> {
    fn drop(&mut self) {
        if self.owner.get() == Some(self.who) {
            self.owner.set(None);
        }
    }
}

/// Per-key "suppressed" flags; nested guards stack.
#[derive(Debug)]
pub struct SuppressFlags<K: Eq + Hash + Copy> {
    depth: Rc<RefCell<HashMap<K, u32>>>,
}

impl<K: Eq + Hash + Copy> Clone for SuppressFlags<K> {
    fn clone(&self) -> Self {
        Self {
            depth: self.depth.clone(),
        }
    }
}

impl<K: Eq + Hash + Copy> Default for SuppressFlags<K> {
    fn default() -> Self {
        Self {
            depth: Rc::new(RefCell::new(HashMap::new())),
        }
    }
}

impl<K: Eq + Hash + Copy> SuppressFlags<K> {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn suppress(&self, key: K) -> SuppressGuard<K> {
        *self.depth.borrow_mut().entry(key).or_insert(0) += 1;
        SuppressGuard {
            depth: self.depth.clone(),
            key,
        }
    }

    pub fn is_suppressed(&self, key: K) -> bool {
        self.depth.borrow().get(&key).copied().unwrap_or(0) > 0
    }
}

#[derive(Debug)]
pub struct SuppressGuard<K: Eq + Hash + Copy> {
    depth: Rc<RefCell<HashMap<K, u32>>>,
    key: K,
}

impl<K: Eq + Hash + Copy> Drop for SuppressGuard<K> {
    fn drop(&mut self) {
        let mut depth = self.depth.borrow_mut();
        if let Some(d) = depth.get_mut(&self.key) {
            *d = d.saturating_sub(1);
            if *d == 0 {
                depth.remove(&self.key);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn single_owner_until_guard_drops() {
        let token = OwnerToken::new();
        let guard = token.try_acquire(1u8).unwrap();
        assert_eq!(token.holder(), Some(1));
        assert!(token.try_acquire(2).is_none());
        assert!(token.is_held_by_other(2));
        assert!(!token.is_held_by_other(1));
        drop(guard);
        assert!(!token.is_held());
        assert!(token.try_acquire(2).is_some());
    }

    #[test]
    fn clones_share_state() {
        let token = OwnerToken::new();
        let other = token.clone();
        let _g = token.try_acquire('a').unwrap();
        assert_eq!(other.holder(), Some('a'));
    }

    #[test]
    fn suppress_guards_nest() {
        let flags = SuppressFlags::new();
        let outer = flags.suppress("osc");
        let inner = flags.suppress("osc");
        drop(inner);
        assert!(flags.is_suppressed("osc"));
        drop(outer);
        assert!(!flags.is_suppressed("osc"));
        assert!(!flags.is_suppressed("price"));
    }
}
