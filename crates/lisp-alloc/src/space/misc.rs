//! Markers and overlays.
//!
//! A marker records a position in a buffer and sits on that buffer's marker
//! chain. Overlays carry their start and end as markers plus a property
//! list, and are chained into one of the buffer's two overlay lists.

use std::ptr;

use super::block::{cell_mut, cell_ref, CellKind, CellSpace, Slot};
use super::buffer::Buffer;
use crate::error::{wrong_type, Result};
use crate::heap::Heap;
use crate::mem_tree::MemType;
use crate::object::{LispObject, LispType, NIL};

#[derive(Debug)]
pub(crate) struct Marker {
    /// Null while the marker points nowhere.
    pub(crate) buffer: *mut Buffer,
    pub(crate) charpos: isize,
    pub(crate) bytepos: isize,
    pub(crate) insertion_type: bool,
    pub(crate) next: *mut Slot<Misc>,
}

#[derive(Debug)]
pub(crate) struct Overlay {
    pub(crate) start: LispObject,
    pub(crate) end: LispObject,
    pub(crate) plist: LispObject,
    pub(crate) next: LispObject,
}

#[derive(Debug)]
pub(crate) enum Misc {
    Marker(Marker),
    Overlay(Overlay),
}

impl CellKind for Misc {
    const MEM_TYPE: MemType = MemType::Misc;
    const NAME: &'static str = "misc";
}

pub(crate) type MiscSpace = CellSpace<Misc>;

/// Take `marker` off its buffer's chain and point it nowhere.
///
/// # Safety
///
/// `marker` must be a live marker cell whose buffer, if any, is still
/// allocated, and every cell on that buffer's chain must be live.
pub(crate) unsafe fn unchain_marker(marker: *mut Slot<Misc>) {
    // SAFETY: forwarded from the caller.
    let (buffer, next) = match unsafe { &*marker } {
        Slot::Live(Misc::Marker(m)) => (m.buffer, m.next),
        _ => return,
    };
    if buffer.is_null() {
        return;
    }
    // SAFETY: the buffer is allocated and its chain holds live markers.
    unsafe {
        let mut link: *mut *mut Slot<Misc> = &raw mut (*buffer).markers;
        while !(*link).is_null() {
            if *link == marker {
                *link = next;
                break;
            }
            match &mut **link {
                Slot::Live(Misc::Marker(m)) => link = &raw mut m.next,
                _ => break,
            }
        }
        if let Slot::Live(Misc::Marker(m)) = &mut *marker {
            m.buffer = ptr::null_mut();
            m.next = ptr::null_mut();
        }
    }
}

impl Heap {
    fn allocate_misc(&mut self, misc: Misc) -> *mut Slot<Misc> {
        let slot = self.miscs.allocate(misc, &mut self.mem);
        self.consing_since_gc += MiscSpace::SLOT_SIZE;
        slot
    }

    /// A marker that points nowhere.
    pub fn allocate_marker(&mut self) -> LispObject {
        let slot = self.allocate_misc(Misc::Marker(Marker {
            buffer: ptr::null_mut(),
            charpos: 0,
            bytepos: 0,
            insertion_type: false,
            next: ptr::null_mut(),
        }));
        LispObject::from_address(slot as usize, LispType::Misc)
    }

    /// An overlay from marker `start` to marker `end`.
    ///
    /// # Errors
    ///
    /// [`crate::Error::WrongType`] if `start` or `end` is not a marker.
    pub fn allocate_overlay(
        &mut self,
        start: LispObject,
        end: LispObject,
        plist: LispObject,
    ) -> Result<LispObject> {
        self.xmarker(start)?;
        self.xmarker(end)?;
        let slot = self.allocate_misc(Misc::Overlay(Overlay {
            start,
            end,
            plist,
            next: NIL,
        }));
        Ok(LispObject::from_address(slot as usize, LispType::Misc))
    }

    pub(crate) fn xmarker(&self, obj: LispObject) -> Result<&Marker> {
        if obj.is_misc() {
            // SAFETY: a misc-tagged reference denotes a live misc cell.
            if let Misc::Marker(m) = unsafe { cell_ref::<Misc>(obj.address()) } {
                return Ok(m);
            }
        }
        Err(wrong_type("marker", obj.lisp_type()))
    }

    fn xmarker_mut(&mut self, obj: LispObject) -> Result<&mut Marker> {
        if obj.is_misc() {
            // SAFETY: as in `xmarker`, made exclusive by `&mut self`.
            if let Misc::Marker(m) = unsafe { cell_mut::<Misc>(obj.address()) } {
                return Ok(m);
            }
        }
        Err(wrong_type("marker", obj.lisp_type()))
    }

    pub(crate) fn xoverlay(&self, obj: LispObject) -> Result<&Overlay> {
        if obj.is_misc() {
            // SAFETY: a misc-tagged reference denotes a live misc cell.
            if let Misc::Overlay(o) = unsafe { cell_ref::<Misc>(obj.address()) } {
                return Ok(o);
            }
        }
        Err(wrong_type("overlay", obj.lisp_type()))
    }

    fn xoverlay_mut(&mut self, obj: LispObject) -> Result<&mut Overlay> {
        if obj.is_misc() {
            // SAFETY: as in `xoverlay`, made exclusive by `&mut self`.
            if let Misc::Overlay(o) = unsafe { cell_mut::<Misc>(obj.address()) } {
                return Ok(o);
            }
        }
        Err(wrong_type("overlay", obj.lisp_type()))
    }

    /// Point `marker` at `position` in `buffer`, or nowhere if `buffer` is
    /// nil.
    ///
    /// # Errors
    ///
    /// [`crate::Error::WrongType`] if `marker` is not a marker or `buffer`
    /// is neither nil nor a live buffer.
    pub fn set_marker(
        &mut self,
        marker: LispObject,
        buffer: LispObject,
        position: isize,
    ) -> Result<()> {
        let target = if buffer.is_nil() {
            ptr::null_mut()
        } else {
            self.xlive_buffer(buffer)?
        };
        let slot = marker.as_ptr::<Slot<Misc>>();
        let current = self.xmarker(marker)?.buffer;
        if current != target {
            // SAFETY: `marker` is live and its old buffer still allocated.
            unsafe { unchain_marker(slot) };
            if !target.is_null() {
                // SAFETY: `target` is a live buffer.
                let head = unsafe { (*target).markers };
                let m = self.xmarker_mut(marker)?;
                m.buffer = target;
                m.next = head;
                // SAFETY: as above.
                unsafe { (*target).markers = slot };
            }
        }
        let m = self.xmarker_mut(marker)?;
        m.charpos = position;
        m.bytepos = position;
        Ok(())
    }

    /// The buffer `marker` points into, or nil.
    ///
    /// # Errors
    ///
    /// [`crate::Error::WrongType`] for non-markers.
    pub fn marker_buffer(&self, marker: LispObject) -> Result<LispObject> {
        let buffer = self.xmarker(marker)?.buffer;
        if buffer.is_null() {
            Ok(NIL)
        } else {
            Ok(LispObject::from_address(buffer as usize, LispType::Vectorlike))
        }
    }

    /// Position of `marker`, or `None` if it points nowhere.
    ///
    /// # Errors
    ///
    /// [`crate::Error::WrongType`] for non-markers.
    pub fn marker_position(&self, marker: LispObject) -> Result<Option<isize>> {
        let m = self.xmarker(marker)?;
        Ok((!m.buffer.is_null()).then_some(m.charpos))
    }

    /// Whether text inserted at `marker` goes before it.
    ///
    /// # Errors
    ///
    /// [`crate::Error::WrongType`] for non-markers.
    pub fn marker_insertion_type(&self, marker: LispObject) -> Result<bool> {
        Ok(self.xmarker(marker)?.insertion_type)
    }

    /// Set whether text inserted at `marker` goes before it.
    ///
    /// # Errors
    ///
    /// [`crate::Error::WrongType`] for non-markers.
    pub fn set_marker_insertion_type(&mut self, marker: LispObject, advance: bool) -> Result<()> {
        self.xmarker_mut(marker)?.insertion_type = advance;
        Ok(())
    }

    /// The start marker of an overlay.
    ///
    /// # Errors
    ///
    /// [`crate::Error::WrongType`] for non-overlays.
    pub fn overlay_start(&self, overlay: LispObject) -> Result<LispObject> {
        Ok(self.xoverlay(overlay)?.start)
    }

    /// The end marker of an overlay.
    ///
    /// # Errors
    ///
    /// [`crate::Error::WrongType`] for non-overlays.
    pub fn overlay_end(&self, overlay: LispObject) -> Result<LispObject> {
        Ok(self.xoverlay(overlay)?.end)
    }

    /// The property list of an overlay.
    ///
    /// # Errors
    ///
    /// [`crate::Error::WrongType`] for non-overlays.
    pub fn overlay_plist(&self, overlay: LispObject) -> Result<LispObject> {
        Ok(self.xoverlay(overlay)?.plist)
    }

    /// Replace the property list of an overlay.
    ///
    /// # Errors
    ///
    /// [`crate::Error::WrongType`] for non-overlays.
    pub fn set_overlay_plist(&mut self, overlay: LispObject, plist: LispObject) -> Result<()> {
        self.xoverlay_mut(overlay)?.plist = plist;
        Ok(())
    }

    /// Put `overlay` on one of `buffer`'s overlay lists: the one before the
    /// buffer's overlay center if it ends at or before the center, the one
    /// after otherwise.
    ///
    /// # Errors
    ///
    /// [`crate::Error::WrongType`] for a non-overlay or a dead buffer.
    pub fn add_overlay(&mut self, buffer: LispObject, overlay: LispObject) -> Result<()> {
        let b = self.xlive_buffer(buffer)?;
        let end = self.xoverlay(overlay)?.end;
        let end_pos = self.marker_position(end)?.unwrap_or(0);
        // SAFETY: `b` is a live buffer and allocation does not collect.
        unsafe {
            if end_pos <= (*b).overlay_center {
                self.xoverlay_mut(overlay)?.next = (*b).overlays_before;
                (*b).overlays_before = overlay;
            } else {
                self.xoverlay_mut(overlay)?.next = (*b).overlays_after;
                (*b).overlays_after = overlay;
            }
        }
        Ok(())
    }

    /// Every overlay on `buffer`, the "before" list first.
    ///
    /// # Errors
    ///
    /// [`crate::Error::WrongType`] for non-buffers.
    pub fn buffer_overlays(&self, buffer: LispObject) -> Result<Vec<LispObject>> {
        let b = self.xbuffer(buffer)?;
        let mut out = Vec::new();
        // SAFETY: `b` is an allocated buffer.
        for head in unsafe { [(*b).overlays_before, (*b).overlays_after] } {
            let mut overlay = head;
            while !overlay.is_nil() {
                out.push(overlay);
                overlay = self.xoverlay(overlay)?.next;
            }
        }
        Ok(out)
    }

    /// The markers on `buffer`'s chain.
    ///
    /// # Errors
    ///
    /// [`crate::Error::WrongType`] for non-buffers.
    pub fn buffer_markers(&self, buffer: LispObject) -> Result<Vec<LispObject>> {
        let b = self.xbuffer(buffer)?;
        let mut out = Vec::new();
        // SAFETY: a buffer's chain holds live marker cells.
        unsafe {
            let mut marker = (*b).markers;
            while !marker.is_null() {
                out.push(LispObject::from_address(marker as usize, LispType::Misc));
                marker = match &*marker {
                    Slot::Live(Misc::Marker(m)) => m.next,
                    _ => break,
                };
            }
        }
        Ok(out)
    }
}

#[cfg(test)]
mod tests {
    use crate::object::NIL;
    use crate::{Heap, HeapConfig};

    fn heap() -> Heap {
        Heap::new(HeapConfig::new().scan_stack(false))
    }

    #[test]
    fn markers_join_and_leave_buffer_chains() {
        let mut heap = heap();
        let name = heap.make_string("a").unwrap();
        let buffer = heap.make_buffer(name).unwrap();
        let base = heap.buffer_markers(buffer).unwrap().len();

        let m = heap.allocate_marker();
        assert_eq!(heap.marker_position(m), Ok(None));
        heap.set_marker(m, buffer, 12).unwrap();
        assert_eq!(heap.marker_position(m), Ok(Some(12)));
        assert_eq!(heap.marker_buffer(m), Ok(buffer));
        assert_eq!(heap.buffer_markers(buffer).unwrap().len(), base + 1);

        heap.set_marker(m, NIL, 0).unwrap();
        assert_eq!(heap.marker_buffer(m), Ok(NIL));
        assert_eq!(heap.buffer_markers(buffer).unwrap().len(), base);
    }

    #[test]
    fn overlays_are_sorted_by_the_center() {
        let mut heap = heap();
        let name = heap.make_string("b").unwrap();
        let buffer = heap.make_buffer(name).unwrap();
        let (s, e) = (heap.allocate_marker(), heap.allocate_marker());
        heap.set_marker(s, buffer, 1).unwrap();
        heap.set_marker(e, buffer, 1).unwrap();
        let early = heap.allocate_overlay(s, e, NIL).unwrap();
        heap.add_overlay(buffer, early).unwrap();

        let (s2, e2) = (heap.allocate_marker(), heap.allocate_marker());
        heap.set_marker(s2, buffer, 5).unwrap();
        heap.set_marker(e2, buffer, 9).unwrap();
        let late = heap.allocate_overlay(s2, e2, NIL).unwrap();
        heap.add_overlay(buffer, late).unwrap();

        assert_eq!(heap.buffer_overlays(buffer).unwrap(), vec![early, late]);
        assert_eq!(heap.overlay_start(late), Ok(s2));
    }

    #[test]
    fn overlays_need_markers() {
        let mut heap = heap();
        assert!(heap.allocate_overlay(NIL, NIL, NIL).is_err());
    }
}
