//! Moving an unrelocated object to a new base.
//!
//! Only the record changes here. Copying the bytes to the new address is up to
//! the caller, who typically does it right before or after the call.
use crate::{Error, Result, elf::ElfPhdrs, object::LoadedObject};

/// Shifts every address-bearing field of `object` so that it starts at `base`.
///
/// Returns the applied delta. Fails with [`Error::AlreadyRelocated`] once
/// relocation has started, leaving the record untouched. A failed relocation
/// counts as started.
pub(crate) fn set_base(object: &mut LoadedObject, base: usize) -> Result<usize> {
    if object.relocated || object.relocating || object.relocation_failed {
        return Err(Error::AlreadyRelocated);
    }
    let delta = base.wrapping_sub(object.map_start());
    if delta != 0 {
        shift(object, delta);
    }
    Ok(delta)
}

fn shift(object: &mut LoadedObject, delta: usize) {
    #[cfg(feature = "log")]
    log::debug!(
        "[Rebase] {}: 0x{:x} -> 0x{:x}",
        object.name,
        object.map_start(),
        object.map_start().wrapping_add(delta)
    );
    object.geometry.shift(delta);
    // a separately allocated copy does not move with the image
    if let ElfPhdrs::Mapped { addr, .. } = &mut object.phdrs {
        *addr = addr.wrapping_add(delta);
    }
    object.ld = object.ld.wrapping_add(delta);
    object.info.shift_slots(delta);
    object.info.adjust_values(delta);
    object.hash.shift(delta);
}
