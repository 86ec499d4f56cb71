/*
 * Copyright (C) 2023 The Android Open Source Project
 *
 * Licensed under the Apache License, Version 2.0 (the "License");
 * you may not use this file except in compliance with the License.
 * You may obtain a copy of the License at
 *
 *      http://www.apache.org/licenses/LICENSE-2.0
 *
 * Unless required by applicable law or agreed to in writing, software
 * distributed under the License is distributed on an "AS IS" BASIS,
 * WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
 * See the License for the specific language governing permissions and
 * limitations under the License.
 */

//! Keyed side table of auxiliary per-object data.

use crate::proxy::{SpIBinder, WpIBinder};

use std::any::Any;
use std::collections::HashMap;

/// Opaque identity under which auxiliary data is attached to a binder.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ObjectId(pub u64);

/// A value attached to a binder object.
pub type AttachedObject = std::sync::Arc<dyn Any + Send + Sync>;

/// Invoked when the owning binder is destroyed with an entry still
/// attached.
pub type ObjectCleanup = Box<dyn FnOnce(ObjectId, &AttachedObject) + Send>;

enum Slot {
    Object {
        value: AttachedObject,
        cleanup: Option<ObjectCleanup>,
    },
    WeakBinder(WpIBinder),
}

/// Side table of attached objects, keyed by [`ObjectId`].
///
/// The last writer for a given key wins silently; attaching over an
/// existing entry replaces it and returns the displaced value without
/// running its cleanup.
#[derive(Default)]
pub struct ObjectManager {
    entries: HashMap<ObjectId, Slot>,
}

impl ObjectManager {
    pub fn new() -> ObjectManager {
        ObjectManager::default()
    }

    pub fn attach(
        &mut self,
        id: ObjectId,
        value: AttachedObject,
        cleanup: Option<ObjectCleanup>,
    ) -> Option<AttachedObject> {
        let displaced = self.entries.insert(id, Slot::Object { value, cleanup });
        match displaced {
            Some(Slot::Object { value, .. }) => Some(value),
            _ => None,
        }
    }

    pub fn find(&self, id: ObjectId) -> Option<AttachedObject> {
        match self.entries.get(&id) {
            Some(Slot::Object { value, .. }) => Some(value.clone()),
            _ => None,
        }
    }

    /// Remove an entry without invoking its cleanup.
    pub fn detach(&mut self, id: ObjectId) -> Option<AttachedObject> {
        match self.entries.remove(&id) {
            Some(Slot::Object { value, .. }) => Some(value),
            _ => None,
        }
    }

    /// Return the binder stored under `id` if it is still promotable,
    /// otherwise create one with `make`, remember it weakly, and return
    /// it.
    pub fn lookup_or_create_weak(
        &mut self,
        id: ObjectId,
        make: &dyn Fn() -> SpIBinder,
    ) -> SpIBinder {
        if let Some(Slot::WeakBinder(weak)) = self.entries.get(&id) {
            if let Some(binder) = weak.promote() {
                return binder;
            }
        }
        let binder = make();
        self.entries.insert(id, Slot::WeakBinder(binder.downgrade()));
        binder
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

impl Drop for ObjectManager {
    fn drop(&mut self) {
        for (id, slot) in self.entries.drain() {
            if let Slot::Object {
                value,
                cleanup: Some(cleanup),
            } = slot
            {
                cleanup(id, &value);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    #[test]
    fn attach_replaces_silently() {
        let mut mgr = ObjectManager::new();
        assert!(mgr.attach(ObjectId(1), Arc::new(1u32), None).is_none());
        let displaced = mgr.attach(ObjectId(1), Arc::new(2u32), None).unwrap();
        assert_eq!(*displaced.downcast::<u32>().unwrap(), 1);
        let found = mgr.find(ObjectId(1)).unwrap();
        assert_eq!(*found.downcast::<u32>().unwrap(), 2);
    }

    #[test]
    fn detach_skips_cleanup() {
        let calls = Arc::new(AtomicUsize::new(0));
        let mut mgr = ObjectManager::new();
        let calls2 = calls.clone();
        mgr.attach(
            ObjectId(7),
            Arc::new(()),
            Some(Box::new(move |_, _| {
                calls2.fetch_add(1, Ordering::SeqCst);
            })),
        );
        assert!(mgr.detach(ObjectId(7)).is_some());
        drop(mgr);
        assert_eq!(calls.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn drop_runs_cleanups() {
        let calls = Arc::new(AtomicUsize::new(0));
        let mut mgr = ObjectManager::new();
        for key in 0..3 {
            let calls2 = calls.clone();
            mgr.attach(
                ObjectId(key),
                Arc::new(key),
                Some(Box::new(move |_, _| {
                    calls2.fetch_add(1, Ordering::SeqCst);
                })),
            );
        }
        drop(mgr);
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }
}
