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

//! Container for a message (data and object references) that can be sent
//! through a binder transaction.

use crate::error::{Result, StatusCode};
use crate::proxy::SpIBinder;

use std::cell::{Cell, RefCell};
use std::os::unix::io::{AsFd, BorrowedFd, OwnedFd};
use std::sync::Arc;

/// Out-of-band payload slot referenced from the byte stream by index.
#[derive(Clone)]
pub(crate) enum ParcelObject {
    Binder(SpIBinder),
    Fd(Arc<OwnedFd>),
}

/// Typed byte container used as transaction input and reply.
///
/// Primitive values are stored 4-byte aligned in a flat byte buffer.
/// Binder objects and file descriptors are carried out of band and
/// referenced from the byte stream, so a reader that skips over them
/// stays positioned correctly.
pub struct Parcel {
    data: Vec<u8>,
    pos: Cell<usize>,
    objects: RefCell<Vec<ParcelObject>>,
    sensitive: Cell<bool>,
}

/// A struct whose instances can be written to a [`Parcel`].
pub trait Serialize {
    fn serialize(&self, parcel: &mut Parcel) -> Result<()>;
}

/// A struct whose instances can be restored from a [`Parcel`].
pub trait Deserialize: Sized {
    fn deserialize(parcel: &Parcel) -> Result<Self>;
}

/// Helper trait for types that can be nullable when serialized.
pub trait SerializeOption: Serialize {
    fn serialize_option(this: Option<&Self>, parcel: &mut Parcel) -> Result<()>;
}

/// Helper trait for types that can be nullable when deserialized.
pub trait DeserializeOption: Deserialize {
    fn deserialize_option(parcel: &Parcel) -> Result<Option<Self>>;
}

fn pad4(len: usize) -> usize {
    (len + 3) & !3
}

impl Parcel {
    pub fn new() -> Parcel {
        Parcel {
            data: Vec::new(),
            pos: Cell::new(0),
            objects: RefCell::new(Vec::new()),
            sensitive: Cell::new(false),
        }
    }

    /// Reconstruct a parcel from raw wire bytes. Wire parcels never carry
    /// object references.
    pub(crate) fn from_bytes(data: Vec<u8>) -> Parcel {
        Parcel {
            data,
            pos: Cell::new(0),
            objects: RefCell::new(Vec::new()),
            sensitive: Cell::new(false),
        }
    }

    pub fn data(&self) -> &[u8] {
        &self.data
    }

    pub fn data_size(&self) -> usize {
        self.data.len()
    }

    pub fn data_position(&self) -> usize {
        self.pos.get()
    }

    pub fn data_avail(&self) -> usize {
        self.data.len().saturating_sub(self.pos.get())
    }

    /// Move the read cursor to an absolute offset.
    pub fn set_data_position(&self, pos: usize) {
        self.pos.set(pos);
    }

    /// Replace the parcel's contents with raw wire bytes, rewinding the
    /// cursor and dropping any object slots.
    pub(crate) fn set_data(&mut self, data: Vec<u8>) {
        self.data = data;
        self.pos.set(0);
        self.objects.borrow_mut().clear();
    }

    /// Request that the buffer be zeroed when the parcel is reclaimed,
    /// for replies carrying sensitive data.
    pub fn mark_sensitive(&mut self) {
        self.sensitive.set(true);
    }

    pub(crate) fn is_sensitive(&self) -> bool {
        self.sensitive.get()
    }

    pub(crate) fn object_count(&self) -> usize {
        self.objects.borrow().len()
    }

    pub(crate) fn has_binders(&self) -> bool {
        self.objects
            .borrow()
            .iter()
            .any(|o| matches!(o, ParcelObject::Binder(_)))
    }

    pub(crate) fn has_file_descriptors(&self) -> bool {
        self.objects
            .borrow()
            .iter()
            .any(|o| matches!(o, ParcelObject::Fd(_)))
    }

    /// Typed write. Appends at the end of the buffer.
    pub fn write<S: Serialize + ?Sized>(&mut self, value: &S) -> Result<()> {
        value.serialize(self)
    }

    /// Typed read from the current cursor position.
    pub fn read<D: Deserialize>(&self) -> Result<D> {
        D::deserialize(self)
    }

    fn write_aligned(&mut self, bytes: &[u8]) {
        self.data.extend_from_slice(bytes);
        let padded = pad4(bytes.len());
        self.data.resize(self.data.len() + padded - bytes.len(), 0);
    }

    fn read_aligned(&self, len: usize) -> Result<&[u8]> {
        let pos = self.pos.get();
        let end = pos.checked_add(len).ok_or(StatusCode::BAD_VALUE)?;
        if end > self.data.len() {
            return Err(StatusCode::NOT_ENOUGH_DATA);
        }
        self.pos.set(pos + pad4(len).min(self.data.len() - pos));
        Ok(&self.data[pos..end])
    }

    pub fn write_i32(&mut self, value: i32) -> Result<()> {
        self.write_aligned(&value.to_le_bytes());
        Ok(())
    }

    pub fn read_i32(&self) -> Result<i32> {
        let bytes = self.read_aligned(4)?;
        Ok(i32::from_le_bytes(bytes.try_into().unwrap()))
    }

    /// Write a binder object into the next object slot, or an inline
    /// null marker. Writing a local binder marks it as parceled.
    pub fn write_binder(&mut self, binder: Option<&SpIBinder>) -> Result<()> {
        let Some(binder) = binder else {
            // Null carries no capability, so it travels inline and may
            // cross any transport.
            return self.write_i32(-1);
        };
        binder.mark_parceled_if_local();
        let index = {
            let mut objects = self.objects.borrow_mut();
            objects.push(ParcelObject::Binder(binder.clone()));
            objects.len() - 1
        };
        self.write_i32(index as i32)
    }

    /// Read the next binder object slot. Returns `Ok(None)` for a null
    /// reference.
    pub fn read_binder(&self) -> Result<Option<SpIBinder>> {
        let index = self.read_i32()?;
        if index < 0 {
            return Ok(None);
        }
        let objects = self.objects.borrow();
        match objects.get(index as usize) {
            Some(ParcelObject::Binder(b)) => Ok(Some(b.clone())),
            _ => Err(StatusCode::BAD_TYPE),
        }
    }

    /// Write a duplicate of `fd` into the next object slot.
    pub fn write_file_descriptor(&mut self, fd: BorrowedFd<'_>) -> Result<()> {
        let owned = fd
            .try_clone_to_owned()
            .map_err(|_| StatusCode::FDS_NOT_ALLOWED)?;
        self.write_owned_file_descriptor(owned)
    }

    pub fn write_owned_file_descriptor(&mut self, fd: OwnedFd) -> Result<()> {
        let index = {
            let mut objects = self.objects.borrow_mut();
            objects.push(ParcelObject::Fd(Arc::new(fd)));
            objects.len() - 1
        };
        self.write_i32(index as i32)
    }

    /// Read the next file descriptor slot, shared with the parcel.
    pub fn read_file_descriptor(&self) -> Result<Arc<OwnedFd>> {
        let index = self.read_i32()?;
        let objects = self.objects.borrow();
        match objects.get(usize::try_from(index).map_err(|_| StatusCode::BAD_TYPE)?) {
            Some(ParcelObject::Fd(fd)) => Ok(fd.clone()),
            _ => Err(StatusCode::BAD_TYPE),
        }
    }

    /// Read the next file descriptor slot as a freshly owned duplicate.
    pub fn read_unique_file_descriptor(&self) -> Result<OwnedFd> {
        let fd = self.read_file_descriptor()?;
        fd.as_fd()
            .try_clone_to_owned()
            .map_err(|_| StatusCode::FDS_NOT_ALLOWED)
    }
}

impl Default for Parcel {
    fn default() -> Parcel {
        Parcel::new()
    }
}

impl Drop for Parcel {
    fn drop(&mut self) {
        if self.sensitive.get() {
            self.data.iter_mut().for_each(|b| *b = 0);
        }
    }
}

impl std::fmt::Debug for Parcel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Parcel")
            .field("data_size", &self.data.len())
            .field("objects", &self.objects.borrow().len())
            .finish()
    }
}

macro_rules! parcelable_primitive {
    ($ty:ty) => {
        impl Serialize for $ty {
            fn serialize(&self, parcel: &mut Parcel) -> Result<()> {
                parcel.write_aligned(&self.to_le_bytes());
                Ok(())
            }
        }

        impl Deserialize for $ty {
            fn deserialize(parcel: &Parcel) -> Result<Self> {
                let bytes = parcel.read_aligned(std::mem::size_of::<$ty>())?;
                Ok(<$ty>::from_le_bytes(bytes.try_into().unwrap()))
            }
        }
    };
}

parcelable_primitive!(i32);
parcelable_primitive!(u32);
parcelable_primitive!(i64);
parcelable_primitive!(u64);
parcelable_primitive!(f32);
parcelable_primitive!(f64);

impl Serialize for bool {
    fn serialize(&self, parcel: &mut Parcel) -> Result<()> {
        parcel.write_i32(*self as i32)
    }
}

impl Deserialize for bool {
    fn deserialize(parcel: &Parcel) -> Result<Self> {
        Ok(parcel.read_i32()? != 0)
    }
}

impl Serialize for str {
    fn serialize(&self, parcel: &mut Parcel) -> Result<()> {
        parcel.write_i32(self.len() as i32)?;
        parcel.write_aligned(self.as_bytes());
        Ok(())
    }
}

impl Serialize for String {
    fn serialize(&self, parcel: &mut Parcel) -> Result<()> {
        self.as_str().serialize(parcel)
    }
}

impl SerializeOption for str {
    fn serialize_option(this: Option<&Self>, parcel: &mut Parcel) -> Result<()> {
        match this {
            None => parcel.write_i32(-1),
            Some(s) => s.serialize(parcel),
        }
    }
}

impl SerializeOption for String {
    fn serialize_option(this: Option<&Self>, parcel: &mut Parcel) -> Result<()> {
        SerializeOption::serialize_option(this.map(String::as_str), parcel)
    }
}

impl Deserialize for String {
    fn deserialize(parcel: &Parcel) -> Result<Self> {
        DeserializeOption::deserialize_option(parcel)
            .transpose()
            .unwrap_or(Err(StatusCode::UNEXPECTED_NULL))
    }
}

impl DeserializeOption for String {
    fn deserialize_option(parcel: &Parcel) -> Result<Option<Self>> {
        let len = parcel.read_i32()?;
        if len < 0 {
            return Ok(None);
        }
        let bytes = parcel.read_aligned(len as usize)?;
        String::from_utf8(bytes.to_vec())
            .map(Some)
            .map_err(|_| StatusCode::BAD_VALUE)
    }
}

impl<T: SerializeOption> Serialize for Option<T> {
    fn serialize(&self, parcel: &mut Parcel) -> Result<()> {
        SerializeOption::serialize_option(self.as_ref(), parcel)
    }
}

impl<T: DeserializeOption> Deserialize for Option<T> {
    fn deserialize(parcel: &Parcel) -> Result<Self> {
        DeserializeOption::deserialize_option(parcel)
    }
}

impl Serialize for [u8] {
    fn serialize(&self, parcel: &mut Parcel) -> Result<()> {
        parcel.write_i32(self.len() as i32)?;
        parcel.write_aligned(self);
        Ok(())
    }
}

impl Serialize for Vec<u8> {
    fn serialize(&self, parcel: &mut Parcel) -> Result<()> {
        self.as_slice().serialize(parcel)
    }
}

impl Deserialize for Vec<u8> {
    fn deserialize(parcel: &Parcel) -> Result<Self> {
        let len = parcel.read_i32()?;
        if len < 0 {
            return Err(StatusCode::UNEXPECTED_NULL);
        }
        Ok(parcel.read_aligned(len as usize)?.to_vec())
    }
}

impl Serialize for Vec<String> {
    fn serialize(&self, parcel: &mut Parcel) -> Result<()> {
        parcel.write_i32(self.len() as i32)?;
        for s in self {
            s.serialize(parcel)?;
        }
        Ok(())
    }
}

impl Deserialize for Vec<String> {
    fn deserialize(parcel: &Parcel) -> Result<Self> {
        let len = parcel.read_i32()?;
        if len < 0 {
            return Err(StatusCode::UNEXPECTED_NULL);
        }
        let mut out = Vec::with_capacity(len.min(4096) as usize);
        for _ in 0..len {
            out.push(parcel.read()?);
        }
        Ok(out)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn primitives_round_trip() {
        let mut parcel = Parcel::new();
        parcel.write(&42i32).unwrap();
        parcel.write(&u64::MAX).unwrap();
        parcel.write(&true).unwrap();
        parcel.write("hello").unwrap();
        parcel.write(&vec![1u8, 2, 3]).unwrap();

        parcel.set_data_position(0);
        assert_eq!(parcel.read::<i32>().unwrap(), 42);
        assert_eq!(parcel.read::<u64>().unwrap(), u64::MAX);
        assert!(parcel.read::<bool>().unwrap());
        assert_eq!(parcel.read::<String>().unwrap(), "hello");
        assert_eq!(parcel.read::<Vec<u8>>().unwrap(), vec![1, 2, 3]);
        assert_eq!(parcel.data_avail(), 0);
    }

    #[test]
    fn alignment_is_stable() {
        let mut parcel = Parcel::new();
        parcel.write("ab").unwrap();
        parcel.write(&7i32).unwrap();
        parcel.set_data_position(0);
        assert_eq!(parcel.read::<String>().unwrap(), "ab");
        assert_eq!(parcel.read::<i32>().unwrap(), 7);
    }

    #[test]
    fn null_string_is_distinct_from_empty() {
        let mut parcel = Parcel::new();
        parcel.write(&None::<String>).unwrap();
        parcel.write(&Some(String::new())).unwrap();
        parcel.set_data_position(0);
        assert_eq!(parcel.read::<Option<String>>().unwrap(), None);
        assert_eq!(parcel.read::<Option<String>>().unwrap(), Some(String::new()));
    }

    #[test]
    fn binder_slots_round_trip() {
        use crate::binder::Interface;

        let binder = crate::Binder::new(()).as_binder();
        let mut parcel = Parcel::new();
        parcel.write_binder(Some(&binder)).unwrap();
        parcel.write_binder(None).unwrap();
        parcel.write(&5i32).unwrap();

        parcel.set_data_position(0);
        assert_eq!(parcel.read_binder().unwrap(), Some(binder));
        assert_eq!(parcel.read_binder().unwrap(), None);
        assert_eq!(parcel.read::<i32>().unwrap(), 5);
        assert!(parcel.has_binders());
    }

    #[test]
    fn short_read_is_rejected() {
        let mut parcel = Parcel::new();
        parcel.write(&1i32).unwrap();
        parcel.set_data_position(0);
        parcel.read::<i32>().unwrap();
        assert_eq!(parcel.read::<i32>(), Err(StatusCode::NOT_ENOUGH_DATA));
    }
}
