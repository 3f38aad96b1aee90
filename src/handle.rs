//! Opaque refcounted resource handles (SPEC_FULL.md §3, "Handle").
//!
//! A [`Handle<T>`] is cheap to clone, compares by identity, and keeps its
//! referent alive for as long as any clone (including one held in a command
//! handle's stagging list, see [`crate::command_buffer`]) is reachable.

use std::hash::{Hash, Hasher};
use std::sync::Arc;

/// Reference-counted, identity-comparable handle to a device resource.
///
/// Mirrors the teacher's `Derivative`-based newtype wrappers in
/// `render/src/arena.rs`, but owns its referent via `Arc` instead of
/// borrowing from an arena lifetime: the RHI's resources are created and
/// destroyed across the submitter/render-thread boundary (SPEC_FULL.md §5),
/// which an arena lifetime cannot express.
#[derive(Derivative)]
#[derivative(Clone(bound = ""), Debug(bound = "T: std::fmt::Debug"))]
pub struct Handle<T> {
    inner: Arc<T>,
}

impl<T> Handle<T> {
    pub fn new(value: T) -> Self {
        Handle { inner: Arc::new(value) }
    }

    pub fn ptr_eq(&self, other: &Handle<T>) -> bool {
        Arc::ptr_eq(&self.inner, &other.inner)
    }

    /// Stable identity usable as a hash-map key component (e.g. in a
    /// descriptor-set binding snapshot, SPEC_FULL.md §4.4).
    pub fn identity(&self) -> usize {
        Arc::as_ptr(&self.inner) as *const () as usize
    }

    pub fn strong_count(&self) -> usize {
        Arc::strong_count(&self.inner)
    }
}

impl<T> std::ops::Deref for Handle<T> {
    type Target = T;
    fn deref(&self) -> &T {
        &self.inner
    }
}

impl<T> PartialEq for Handle<T> {
    fn eq(&self, other: &Self) -> bool {
        self.ptr_eq(other)
    }
}
impl<T> Eq for Handle<T> {}

impl<T> Hash for Handle<T> {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.identity().hash(state)
    }
}

/// A non-owning back-reference counterpart to [`Handle<T>`], used where an
/// owner must not keep its referent alive (e.g. a [`crate::texture::Texture`]
/// tracking the render targets that reference it, SPEC_FULL.md §9).
#[derive(Derivative)]
#[derivative(Clone(bound = ""))]
pub struct WeakHandle<T> {
    inner: std::sync::Weak<T>,
}

impl<T> WeakHandle<T> {
    pub fn upgrade(&self) -> Option<Handle<T>> {
        self.inner.upgrade().map(|inner| Handle { inner })
    }
}

impl<T> From<&Handle<T>> for WeakHandle<T> {
    fn from(h: &Handle<T>) -> Self {
        WeakHandle { inner: Arc::downgrade(&h.inner) }
    }
}

impl<T> PartialEq for WeakHandle<T> {
    fn eq(&self, other: &Self) -> bool {
        self.inner.ptr_eq(&other.inner)
    }
}
impl<T> Eq for WeakHandle<T> {}

impl<T> Hash for WeakHandle<T> {
    fn hash<H: Hasher>(&self, state: &mut H) {
        (self.inner.as_ptr() as *const () as usize).hash(state)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn clones_share_identity() {
        let h = Handle::new(42u32);
        let h2 = h.clone();
        assert!(h.ptr_eq(&h2));
        assert_eq!(h.identity(), h2.identity());
    }

    #[test]
    fn distinct_handles_differ() {
        let a = Handle::new(1u32);
        let b = Handle::new(1u32);
        assert!(!a.ptr_eq(&b));
    }

    #[test]
    fn weak_upgrade_follows_lifetime() {
        let h = Handle::new(7u32);
        let weak: WeakHandle<u32> = (&h).into();
        assert!(weak.upgrade().is_some());
        drop(h);
        assert!(weak.upgrade().is_none());
    }
}
