//! In-object container layouts the schema kinds traverse. Embedder types
//! that hold references in arrays, optionals or field paths must use these
//! representations so the tracer can walk them untyped.

use crate::util::{Address, ObjectRef};
use std::marker::PhantomData;

/// Type-erased dynamic array header: what the tracer sees when a schema
/// member names a reference array or an array of structs. `TypedArray<T>`
/// and `RefArray` guarantee this exact layout.
#[repr(C)]
#[derive(Copy, Clone)]
pub struct UntypedArray {
    pub data: Address,
    pub num: i32,
    pub capacity: i32,
}

impl UntypedArray {
    pub fn is_empty(&self) -> bool {
        self.num <= 0
    }
}

/// A growable array of `T` with the `UntypedArray` layout.
#[repr(C)]
pub struct TypedArray<T> {
    data: *mut T,
    num: i32,
    capacity: i32,
    _marker: PhantomData<T>,
}

/// A growable array of strong reference slots.
pub type RefArray = TypedArray<ObjectRef>;

impl<T> TypedArray<T> {
    pub const fn new() -> TypedArray<T> {
        TypedArray {
            data: std::ptr::null_mut(),
            num: 0,
            capacity: 0,
            _marker: PhantomData,
        }
    }

    pub fn len(&self) -> usize {
        self.num as usize
    }

    pub fn is_empty(&self) -> bool {
        self.num == 0
    }

    pub fn push(&mut self, value: T) {
        if self.num == self.capacity {
            self.grow();
        }
        unsafe { self.data.add(self.num as usize).write(value) };
        self.num += 1;
    }

    pub fn as_slice(&self) -> &[T] {
        if self.num == 0 {
            return &[];
        }
        unsafe { std::slice::from_raw_parts(self.data, self.num as usize) }
    }

    pub fn as_mut_slice(&mut self) -> &mut [T] {
        if self.num == 0 {
            return &mut [];
        }
        unsafe { std::slice::from_raw_parts_mut(self.data, self.num as usize) }
    }

    fn grow(&mut self) {
        let new_capacity = if self.capacity == 0 { 4 } else { self.capacity * 2 };
        let mut storage: Vec<T> = Vec::with_capacity(new_capacity as usize);
        let new_data = storage.as_mut_ptr();
        std::mem::forget(storage);
        if self.num > 0 {
            unsafe {
                std::ptr::copy_nonoverlapping(self.data, new_data, self.num as usize);
                drop(Vec::from_raw_parts(self.data, 0, self.capacity as usize));
            }
        }
        self.data = new_data;
        self.capacity = new_capacity;
    }
}

impl<T> Default for TypedArray<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T> Drop for TypedArray<T> {
    fn drop(&mut self) {
        if !self.data.is_null() {
            unsafe {
                drop(Vec::from_raw_parts(
                    self.data,
                    self.num as usize,
                    self.capacity as usize,
                ));
            }
        }
    }
}

// The array owns its storage exactly like a Vec does.
unsafe impl<T: Send> Send for TypedArray<T> {}
unsafe impl<T: Sync> Sync for TypedArray<T> {}

/// Present-or-absent slot visited through a nested schema. The payload comes
/// first so the nested schema's offsets apply unchanged; the presence byte
/// sits at the payload's stride.
#[repr(C)]
pub struct OptionalSlot<T> {
    value: std::mem::MaybeUninit<T>,
    present: bool,
}

impl<T> OptionalSlot<T> {
    pub const fn absent() -> OptionalSlot<T> {
        OptionalSlot {
            value: std::mem::MaybeUninit::uninit(),
            present: false,
        }
    }

    pub fn new(value: T) -> OptionalSlot<T> {
        OptionalSlot {
            value: std::mem::MaybeUninit::new(value),
            present: true,
        }
    }

    pub fn is_present(&self) -> bool {
        self.present
    }

    pub fn get(&self) -> Option<&T> {
        if self.present {
            Some(unsafe { self.value.assume_init_ref() })
        } else {
            None
        }
    }
}

impl<T> Drop for OptionalSlot<T> {
    fn drop(&mut self) {
        if self.present {
            unsafe { self.value.assume_init_drop() };
        }
    }
}

/// A path to a member inside an owning object. Only the owner slot is a
/// strong reference; the path segments are opaque to the tracer.
#[repr(C)]
pub struct FieldPathSlot {
    pub owner: ObjectRef,
    pub path: [u32; 2],
}

impl FieldPathSlot {
    pub const fn empty() -> FieldPathSlot {
        FieldPathSlot {
            owner: ObjectRef::NULL,
            path: [0; 2],
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use memoffset::offset_of;

    #[test]
    fn typed_array_matches_untyped_layout() {
        assert_eq!(
            std::mem::size_of::<RefArray>(),
            std::mem::size_of::<UntypedArray>()
        );
        assert_eq!(offset_of!(UntypedArray, num), std::mem::size_of::<Address>());

        let mut array = RefArray::new();
        let value = 11u64;
        array.push(ObjectRef::from_ref(&value));
        array.push(ObjectRef::NULL);

        let untyped: &UntypedArray = unsafe { &*(&array as *const RefArray as *const UntypedArray) };
        assert_eq!(untyped.num, 2);
        let first: ObjectRef = unsafe { untyped.data.load() };
        assert_eq!(first, ObjectRef::from_ref(&value));
    }

    #[test]
    fn typed_array_growth_preserves_contents() {
        let mut array: TypedArray<usize> = TypedArray::new();
        for i in 0..100 {
            array.push(i);
        }
        assert_eq!(array.len(), 100);
        assert_eq!(array.as_slice()[99], 99);
    }

    #[test]
    fn optional_slot_presence() {
        let absent: OptionalSlot<u64> = OptionalSlot::absent();
        assert!(absent.get().is_none());
        let present = OptionalSlot::new(9u64);
        assert_eq!(*present.get().unwrap(), 9);
    }
}
