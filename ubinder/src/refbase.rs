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

//! Strong/weak reference ownership protocol for binder objects.
//!
//! Memory lifetime is carried by [`std::sync::Arc`]; the protocol counts
//! here are what binder semantics are defined over: they are observable by
//! the object through the [`RefAware`] transition hooks, and a proxy uses
//! them to hand off ownership of its remote exactly once.

use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

/// Per-object strong and weak reference ledger.
pub struct RefCounts {
    strong: AtomicUsize,
    weak: AtomicUsize,
    first_fired: AtomicBool,
}

impl RefCounts {
    pub const fn new() -> RefCounts {
        RefCounts {
            strong: AtomicUsize::new(0),
            weak: AtomicUsize::new(0),
            first_fired: AtomicBool::new(false),
        }
    }

    pub fn strong_count(&self) -> usize {
        self.strong.load(Ordering::Acquire)
    }

    pub fn weak_count(&self) -> usize {
        self.weak.load(Ordering::Acquire)
    }
}

impl Default for RefCounts {
    fn default() -> RefCounts {
        RefCounts::new()
    }
}

/// An object participating in the reference ownership protocol.
///
/// `on_first_ref` is invoked exactly once, when the object gains its first
/// strong referent. `on_last_strong_ref` is invoked every time the strong
/// count returns to zero. `on_inc_strong_attempted` arbitrates promotion
/// of a weak reference while no strong references exist.
pub trait RefAware: Send + Sync {
    fn ref_counts(&self) -> &RefCounts;

    fn on_first_ref(&self) {}

    fn on_last_strong_ref(&self) {}

    fn on_inc_strong_attempted(&self) -> bool {
        false
    }
}

/// Take a strong reference on `obj`, firing `on_first_ref` on the very
/// first acquisition.
pub fn inc_strong<T: RefAware + ?Sized>(obj: &T) {
    let counts = obj.ref_counts();
    let old = counts.strong.fetch_add(1, Ordering::AcqRel);
    if old == 0 && !counts.first_fired.swap(true, Ordering::AcqRel) {
        obj.on_first_ref();
    }
}

/// Release a strong reference on `obj`, firing `on_last_strong_ref` when
/// the count reaches zero.
pub fn dec_strong<T: RefAware + ?Sized>(obj: &T) {
    let counts = obj.ref_counts();
    let old = counts.strong.fetch_sub(1, Ordering::AcqRel);
    debug_assert!(old > 0, "strong reference underflow");
    if old == 1 {
        obj.on_last_strong_ref();
    }
}

/// Attempt to promote a weak reference into a strong one.
///
/// Succeeds immediately while other strong references exist. When the
/// strong count is zero the object is consulted via
/// `on_inc_strong_attempted`; promotion fails if the object refuses.
pub fn attempt_inc_strong<T: RefAware + ?Sized>(obj: &T) -> bool {
    let counts = obj.ref_counts();
    let mut cur = counts.strong.load(Ordering::Acquire);
    loop {
        if cur == 0 {
            if !obj.on_inc_strong_attempted() {
                return false;
            }
            match counts
                .strong
                .compare_exchange(0, 1, Ordering::AcqRel, Ordering::Acquire)
            {
                Ok(_) => return true,
                Err(actual) => {
                    cur = actual;
                    continue;
                }
            }
        }
        match counts
            .strong
            .compare_exchange(cur, cur + 1, Ordering::AcqRel, Ordering::Acquire)
        {
            Ok(_) => return true,
            Err(actual) => cur = actual,
        }
    }
}

pub fn inc_weak(counts: &RefCounts) {
    counts.weak.fetch_add(1, Ordering::AcqRel);
}

pub fn dec_weak(counts: &RefCounts) {
    let old = counts.weak.fetch_sub(1, Ordering::AcqRel);
    debug_assert!(old > 0, "weak reference underflow");
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;

    #[derive(Default)]
    struct Probe {
        counts: RefCounts,
        first: AtomicUsize,
        last: AtomicUsize,
        allow_resurrect: bool,
    }

    impl RefAware for Probe {
        fn ref_counts(&self) -> &RefCounts {
            &self.counts
        }

        fn on_first_ref(&self) {
            self.first.fetch_add(1, Ordering::SeqCst);
        }

        fn on_last_strong_ref(&self) {
            self.last.fetch_add(1, Ordering::SeqCst);
        }

        fn on_inc_strong_attempted(&self) -> bool {
            self.allow_resurrect
        }
    }

    #[test]
    fn first_ref_fires_once() {
        let p = Probe::default();
        inc_strong(&p);
        inc_strong(&p);
        dec_strong(&p);
        dec_strong(&p);
        assert_eq!(p.first.load(Ordering::SeqCst), 1);
        assert_eq!(p.last.load(Ordering::SeqCst), 1);
        assert_eq!(p.counts.strong_count(), 0);
    }

    #[test]
    fn promotion_respects_object_veto() {
        let p = Probe::default();
        assert!(!attempt_inc_strong(&p));

        let p = Probe {
            allow_resurrect: true,
            ..Probe::default()
        };
        assert!(attempt_inc_strong(&p));
        assert_eq!(p.counts.strong_count(), 1);
    }

    #[test]
    fn promotion_with_live_strong_refs() {
        let p = Probe::default();
        inc_strong(&p);
        assert!(attempt_inc_strong(&p));
        assert_eq!(p.counts.strong_count(), 2);
    }

    #[test]
    fn concurrent_inc_dec_balance() {
        let p = std::sync::Arc::new(Probe::default());
        std::thread::scope(|s| {
            for _ in 0..8 {
                let p = &p;
                s.spawn(move || {
                    for _ in 0..1000 {
                        inc_strong(&**p);
                        dec_strong(&**p);
                    }
                });
            }
        });
        assert_eq!(p.counts.strong_count(), 0);
        assert_eq!(p.first.load(Ordering::SeqCst), 1);
    }
}
