// Copyright (C) 2025 Ryan Daum <ryan.daum@gmail.com> This program is free
// software: you can redistribute it and/or modify it under the terms of the GNU
// General Public License as published by the Free Software Foundation, version
// 3.
//
// This program is distributed in the hope that it will be useful, but WITHOUT
// ANY WARRANTY; without even the implied warranty of MERCHANTABILITY or FITNESS
// FOR A PARTICULAR PURPOSE. See the GNU General Public License for more details.
//
// You should have received a copy of the GNU General Public License along with
// this program. If not, see <https://www.gnu.org/licenses/>.
//

//! Reference slots and pointer compression.
//!
//! A [`RefSlot`] is the address of a location holding a reference. When
//! compressed pointers are enabled the location may hold a 32-bit encoded
//! value instead of a full word; such slots carry [`RefSlot::NARROW_TAG`] in
//! bit 63 of their address. Object fields are always narrow under
//! compression. Root locations are narrow only if the host tagged them so.

use crate::error::BindingError;
use mmtk::util::{Address, ObjectReference};
use mmtk::vm::slot::{MemorySlice, Slot};
use once_cell::sync::OnceCell;
use std::fmt;

static GLOBAL_CODEC: OnceCell<PointerCodec> = OnceCell::new();

/// Encoding of references into 32-bit narrow slots.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct PointerCodec {
    base: usize,
    shift: u32,
}

impl PointerCodec {
    /// Narrow value is the raw address. Only usable below 4 GiB.
    pub const IDENTITY: PointerCodec = PointerCodec { base: 0, shift: 0 };

    const GIB: usize = 1 << 30;

    pub const fn new(base: usize, shift: u32) -> Self {
        Self { base, shift }
    }

    /// Pick base and shift so every address in `[start, end)` is encodable.
    ///
    /// When a base is needed it sits one page below the heap so that no
    /// object encodes to 0, which is reserved for null.
    pub fn for_heap_range(start: Address, end: Address) -> Self {
        let end = end.as_usize();
        if end <= 4 * Self::GIB {
            Self::new(0, 0)
        } else if end <= 32 * Self::GIB {
            Self::new(0, 3)
        } else {
            Self::new(start.as_usize().saturating_sub(4096), 3)
        }
    }

    pub fn base(&self) -> usize {
        self.base
    }

    pub fn shift(&self) -> u32 {
        self.shift
    }

    #[inline(always)]
    pub fn encode(&self, object: Option<ObjectReference>) -> u32 {
        let Some(o) = object else {
            return 0;
        };
        let addr = o.to_raw_address().as_usize();
        debug_assert!(addr >= self.base, "{addr:#x} is below the codec base {:#x}", self.base);
        let encoded = addr.wrapping_sub(self.base) >> self.shift;
        debug_assert!(
            encoded <= u32::MAX as usize,
            "{addr:#x} does not fit a narrow slot under {self:?}"
        );
        encoded as u32
    }

    #[inline(always)]
    pub fn decode(&self, narrow: u32) -> Option<ObjectReference> {
        if narrow == 0 {
            return None;
        }
        let raw = self.base + ((narrow as usize) << self.shift);
        // SAFETY: `raw` is non-zero because `narrow` is non-zero.
        Some(unsafe { ObjectReference::from_raw_address_unchecked(Address::from_usize(raw)) })
    }

    /// Install the process-wide codec used by [`Slot::load`]/[`Slot::store`].
    pub fn install_global(codec: PointerCodec) -> Result<(), BindingError> {
        GLOBAL_CODEC
            .set(codec)
            .map_err(|_| BindingError::AlreadyInstalled)
    }

    /// The installed codec, or [`PointerCodec::IDENTITY`] before installation.
    #[inline(always)]
    pub fn global() -> PointerCodec {
        GLOBAL_CODEC.get().copied().unwrap_or(Self::IDENTITY)
    }
}

impl Default for PointerCodec {
    fn default() -> Self {
        Self::IDENTITY
    }
}

/// Address of a reference location, tagged with its width.
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
#[repr(transparent)]
pub struct RefSlot(usize);

impl RefSlot {
    pub const NARROW_TAG: usize = 1 << 63;

    pub fn wide(addr: Address) -> Self {
        debug_assert_eq!(addr.as_usize() & Self::NARROW_TAG, 0);
        Self(addr.as_usize())
    }

    pub fn narrow(addr: Address) -> Self {
        Self(addr.as_usize() | Self::NARROW_TAG)
    }

    /// A slot as reported by the host, tag bit included.
    pub const fn from_raw(bits: usize) -> Self {
        Self(bits)
    }

    pub const fn to_raw(self) -> usize {
        self.0
    }

    pub const fn is_narrow(self) -> bool {
        self.0 & Self::NARROW_TAG != 0
    }

    /// The slot's location with the tag stripped.
    pub fn address(self) -> Address {
        // SAFETY: only the tag bit is cleared.
        unsafe { Address::from_usize(self.0 & !Self::NARROW_TAG) }
    }

    pub const fn width(self) -> usize {
        if self.is_narrow() { 4 } else { 8 }
    }

    /// Raw bit pattern stored in the slot: the encoded value for narrow
    /// slots, the address for wide ones.
    pub fn load_bits(self) -> usize {
        let ptr = self.address();
        // SAFETY: the host guarantees slot addresses are valid for the width
        // they are tagged with. Code-embedded slots may be unaligned.
        unsafe {
            if self.is_narrow() {
                ptr.to_ptr::<u32>().read_unaligned() as usize
            } else {
                ptr.to_ptr::<usize>().read_unaligned()
            }
        }
    }

    pub fn store_bits(self, bits: usize) {
        let ptr = self.address();
        // SAFETY: see `load_bits`.
        unsafe {
            if self.is_narrow() {
                ptr.to_mut_ptr::<u32>().write_unaligned(bits as u32)
            } else {
                ptr.to_mut_ptr::<usize>().write_unaligned(bits)
            }
        }
    }

    pub fn load_with(self, codec: &PointerCodec) -> Option<ObjectReference> {
        let bits = self.load_bits();
        if self.is_narrow() {
            codec.decode(bits as u32)
        } else {
            // SAFETY: zero maps to None; anything else was stored as a reference.
            ObjectReference::from_raw_address(unsafe { Address::from_usize(bits) })
        }
    }

    pub fn store_with(self, codec: &PointerCodec, object: Option<ObjectReference>) {
        if self.is_narrow() {
            self.store_bits(codec.encode(object) as usize)
        } else {
            self.store_bits(object.map_or(0, |o| o.to_raw_address().as_usize()))
        }
    }

    pub fn clear(self) {
        self.store_bits(0)
    }
}

impl fmt::Debug for RefSlot {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let kind = if self.is_narrow() { "narrow" } else { "wide" };
        write!(f, "RefSlot({kind} {:#x})", self.address().as_usize())
    }
}

impl Slot for RefSlot {
    fn load(&self) -> Option<ObjectReference> {
        self.load_with(&PointerCodec::global())
    }

    fn store(&self, object: ObjectReference) {
        self.store_with(&PointerCodec::global(), Some(object))
    }
}

/// Slot of the field at `offset` bytes into `object`.
pub fn field_slot(object: ObjectReference, offset: usize, compressed: bool) -> RefSlot {
    let addr = object.to_raw_address() + offset;
    if compressed {
        RefSlot::narrow(addr)
    } else {
        RefSlot::wide(addr)
    }
}

/// A contiguous run of reference slots, as touched by one array copy.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct SlotRange {
    object: Option<ObjectReference>,
    start: Address,
    count: usize,
    narrow: bool,
}

impl SlotRange {
    pub fn new(object: Option<ObjectReference>, start: Address, count: usize, narrow: bool) -> Self {
        Self {
            object,
            start,
            count,
            narrow,
        }
    }

    pub fn len(&self) -> usize {
        self.count
    }

    pub fn is_empty(&self) -> bool {
        self.count == 0
    }

    pub fn is_narrow(&self) -> bool {
        self.narrow
    }

    fn stride(&self) -> usize {
        if self.narrow { 4 } else { 8 }
    }
}

pub struct SlotRangeIter {
    cursor: Address,
    remaining: usize,
    narrow: bool,
}

impl Iterator for SlotRangeIter {
    type Item = RefSlot;

    fn next(&mut self) -> Option<RefSlot> {
        if self.remaining == 0 {
            return None;
        }
        self.remaining -= 1;
        let here = self.cursor;
        let (slot, stride) = if self.narrow {
            (RefSlot::narrow(here), 4usize)
        } else {
            (RefSlot::wide(here), 8)
        };
        self.cursor = here + stride;
        Some(slot)
    }

    fn size_hint(&self) -> (usize, Option<usize>) {
        (self.remaining, Some(self.remaining))
    }
}

impl ExactSizeIterator for SlotRangeIter {}

impl MemorySlice for SlotRange {
    type SlotType = RefSlot;
    type SlotIterator = SlotRangeIter;

    fn iter_slots(&self) -> SlotRangeIter {
        SlotRangeIter {
            cursor: self.start,
            remaining: self.count,
            narrow: self.narrow,
        }
    }

    fn object(&self) -> Option<ObjectReference> {
        self.object
    }

    fn start(&self) -> Address {
        self.start
    }

    fn bytes(&self) -> usize {
        self.count * self.stride()
    }

    fn copy(src: &Self, tgt: &Self) {
        debug_assert_eq!(src.bytes(), tgt.bytes());
        debug_assert_eq!(src.narrow, tgt.narrow);
        // SAFETY: both ranges describe live array bodies of equal length.
        unsafe {
            std::ptr::copy(
                src.start.to_ptr::<u8>(),
                tgt.start.to_mut_ptr::<u8>(),
                src.bytes(),
            )
        }
    }
}
