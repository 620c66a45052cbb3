use std::fmt;
use std::mem;
use std::ops::*;

/// size in bytes
pub type ByteSize = usize;
/// offset in bytes
pub type ByteOffset = isize;

/// `Address` represents an arbitrary byte address inside the embedder's
/// object universe. It is designed to do address arithmetic mostly in a safe
/// way and to mark the operations that dereference memory as unsafe, while
/// staying zero overhead memory- and time-wise.
///
/// The tracer manipulates reference slots through `Address` exclusively;
/// this module is the only place that turns integers back into pointers.
#[repr(transparent)]
#[derive(Copy, Clone, Default, Eq, PartialEq, Ord, PartialOrd, Hash)]
pub struct Address(usize);

/// Address + ByteSize (positive)
impl Add<ByteSize> for Address {
    type Output = Address;
    fn add(self, offset: ByteSize) -> Address {
        Address(self.0 + offset)
    }
}

/// Address + ByteOffset (positive or negative)
impl Add<ByteOffset> for Address {
    type Output = Address;
    fn add(self, offset: ByteOffset) -> Address {
        Address((self.0 as isize + offset) as usize)
    }
}

/// Address - Address (the first address must be higher)
impl Sub<Address> for Address {
    type Output = ByteSize;
    fn sub(self, other: Address) -> ByteSize {
        debug_assert!(
            self.0 >= other.0,
            "for (addr_a - addr_b), a needs to be larger than b"
        );
        self.0 - other.0
    }
}

impl Address {
    /// The zero address. Never dereferenced; used as the "no slot" value.
    pub const ZERO: Address = Address(0);

    pub fn from_ptr<T>(ptr: *const T) -> Address {
        Address(ptr as usize)
    }

    pub fn from_mut_ptr<T>(ptr: *mut T) -> Address {
        Address(ptr as usize)
    }

    pub fn from_ref<T>(r: &T) -> Address {
        Address(r as *const T as usize)
    }

    /// Creates an arbitrary address. The caller is responsible for it being
    /// meaningful to dereference later.
    pub const unsafe fn from_usize(raw: usize) -> Address {
        Address(raw)
    }

    pub const fn as_usize(self) -> usize {
        self.0
    }

    pub const fn is_zero(self) -> bool {
        self.0 == 0
    }

    pub fn is_aligned_to(self, align: usize) -> bool {
        self.0 % align == 0
    }

    /// Shifts the address by N T-typed elements (addr + N * size_of::<T>()).
    pub fn shift<T>(self, offset: isize) -> Self {
        self + mem::size_of::<T>() as isize * offset
    }

    pub fn to_ptr<T>(self) -> *const T {
        self.0 as *const T
    }

    pub fn to_mut_ptr<T>(self) -> *mut T {
        self.0 as *mut T
    }

    /// Loads a value of type T from the address.
    ///
    /// # Safety
    /// The address must hold a valid, aligned T.
    pub unsafe fn load<T: Copy>(self) -> T {
        *(self.0 as *const T)
    }

    /// Stores a value of type T to the address.
    ///
    /// # Safety
    /// The address must be writable storage for an aligned T.
    pub unsafe fn store<T>(self, value: T) {
        *(self.0 as *mut T) = value;
    }

    /// Issues a best-effort data prefetch for the cache line at this address.
    /// Spurious prefetches of lookahead padding are fine as long as the
    /// address points at mapped memory.
    pub fn prefetch_read(self) {
        #[cfg(target_arch = "x86_64")]
        unsafe {
            use std::arch::x86_64::{_mm_prefetch, _MM_HINT_T0};
            _mm_prefetch(self.0 as *const i8, _MM_HINT_T0);
        }
    }
}

impl fmt::Display for Address {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{:#x}", self.0)
    }
}

impl fmt::Debug for Address {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{:#x}", self.0)
    }
}

/// A possibly-null reference to a managed object. Reference slots inside
/// managed objects hold exactly this representation, which is what lets the
/// tracer read them untyped and the processor null them in place.
#[repr(transparent)]
#[derive(Copy, Clone, Default, Eq, PartialEq, Ord, PartialOrd, Hash)]
pub struct ObjectRef(usize);

impl ObjectRef {
    pub const NULL: ObjectRef = ObjectRef(0);

    pub fn from_address(address: Address) -> ObjectRef {
        ObjectRef(address.as_usize())
    }

    pub fn from_ptr<T>(ptr: *const T) -> ObjectRef {
        ObjectRef(ptr as usize)
    }

    pub fn from_ref<T>(r: &T) -> ObjectRef {
        ObjectRef(r as *const T as usize)
    }

    pub const fn is_null(self) -> bool {
        self.0 == 0
    }

    pub fn to_address(self) -> Address {
        Address(self.0)
    }

    pub const fn as_usize(self) -> usize {
        self.0
    }
}

impl fmt::Display for ObjectRef {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{:#x}", self.0)
    }
}

impl fmt::Debug for ObjectRef {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{:#x}", self.0)
    }
}
