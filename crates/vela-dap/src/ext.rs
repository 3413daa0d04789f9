//! Typed-key extension registry.
//!
//! Per-session odds and ends (client info, launch options) that don't deserve
//! a dedicated struct field live here. A [`Key`] carries a phantom type
//! parameter, so `get`/`insert` are checked at the call site instead of
//! relying on an unchecked downcast behind a string key.

use std::{
    any::{Any, TypeId},
    collections::HashMap,
    marker::PhantomData,
};

pub struct Key<T> {
    name: &'static str,
    _marker: PhantomData<fn() -> T>,
}

impl<T> Key<T> {
    pub const fn new(name: &'static str) -> Self {
        Self {
            name,
            _marker: PhantomData,
        }
    }
}

// Derived Clone/Copy would bound `T`, which the phantom parameter doesn't
// need.
impl<T> Clone for Key<T> {
    fn clone(&self) -> Self {
        *self
    }
}

impl<T> Copy for Key<T> {}

#[derive(Default)]
pub struct ExtRegistry {
    entries: HashMap<(&'static str, TypeId), Box<dyn Any + Send + Sync>>,
}

impl ExtRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert<T: Any + Send + Sync>(&mut self, key: Key<T>, value: T) {
        self.entries
            .insert((key.name, TypeId::of::<T>()), Box::new(value));
    }

    pub fn get<T: Any + Send + Sync>(&self, key: Key<T>) -> Option<&T> {
        self.entries
            .get(&(key.name, TypeId::of::<T>()))
            .and_then(|boxed| boxed.downcast_ref())
    }

    pub fn remove<T: Any + Send + Sync>(&mut self, key: Key<T>) -> Option<T> {
        self.entries
            .remove(&(key.name, TypeId::of::<T>()))
            .and_then(|boxed| boxed.downcast().ok())
            .map(|boxed| *boxed)
    }
}
