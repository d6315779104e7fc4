//! The linker context: registry of loaded objects and the operations on them.
use crate::{
    Error, Result,
    dlmem::Mode,
    error::{custom_error, invalid_argument, relocate_error, symbol_error},
    object::{LoadedObject, MapInfo},
    os::{DefaultMmap, Mmap},
    rebase,
    relocation::{FnHandler, RelocationPlan, SymbolResolver, c_abi_handler, run_fini},
    segment::{DefaultPlacement, Placement},
    symbol::SymbolTable,
    sync::LoadLock,
};
use alloc::{
    boxed::Box,
    format,
    string::{String, ToString},
};
use core::{
    cell::{Cell, RefCell, RefMut},
    marker::PhantomData,
    num::NonZeroUsize,
};
use elf::abi::STT_GNU_IFUNC;
use hashbrown::HashMap;

/// An opaque reference to an object registered with a [`Linker`].
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
#[repr(transparent)]
pub struct Handle(NonZeroUsize);

impl Handle {
    /// The raw identifier behind the handle.
    #[inline]
    pub fn as_raw(&self) -> usize {
        self.0.get()
    }
}

pub(crate) struct LinkerState {
    objects: RefCell<HashMap<Handle, LoadedObject>>,
    last_error: RefCell<Option<String>>,
    next_id: Cell<usize>,
}

impl LinkerState {
    fn new() -> Self {
        Self {
            objects: RefCell::new(HashMap::new()),
            last_error: RefCell::new(None),
            next_id: Cell::new(1),
        }
    }

    fn objects(&self) -> Result<RefMut<'_, HashMap<Handle, LoadedObject>>> {
        self.objects
            .try_borrow_mut()
            .map_err(|_| custom_error("object registry is in use by a callback"))
    }

    /// Keeps the message of a failed operation for [`Linker::last_error`].
    pub(crate) fn record<T>(&self, result: &Result<T>) {
        if let Err(err) = result {
            if err.is_silent() {
                return;
            }
            #[cfg(feature = "log")]
            log::error!("{err}");
            if let Ok(mut last) = self.last_error.try_borrow_mut() {
                *last = Some(err.to_string());
            }
        }
    }
}

/// Owns every object loaded through it.
///
/// All operations take the same reentrant lock, so a `Linker` can be shared
/// between threads. Callbacks (symbol resolver, init and fini handlers, premap
/// hooks) run without the registry borrowed and may call back into the
/// linker on the same thread.
///
/// # Examples
/// ```no_run
/// use elf_dlmem::{Linker, MemArgs, MemFlags, Mode};
///
/// let image: &[u8] = &[];
/// let linker = Linker::new();
/// let args = MemArgs::new().flags(MemFlags::NO_RELOCATE | MemFlags::UNALIGNED_SOURCE);
/// let handle = linker.dlmem(image, Mode::NOW, Some(&args)).unwrap();
/// let info = linker.map_info(handle).unwrap();
/// linker.set_object_base(handle, info.map_start).unwrap();
/// linker.relocate(handle).unwrap();
/// ```
pub struct Linker<M: Mmap = DefaultMmap> {
    pub(crate) state: LoadLock<LinkerState>,
    pub(crate) placement: Box<dyn Placement + Send + Sync>,
    pre_find: Option<SymbolResolver>,
    init_fn: FnHandler,
    fini_fn: FnHandler,
    _marker: PhantomData<fn() -> M>,
}

impl Default for Linker {
    fn default() -> Self {
        Self::new()
    }
}

impl Linker {
    /// Creates a linker using the system's memory mapping primitives.
    pub fn new() -> Self {
        let c_abi = c_abi_handler();
        Self {
            state: LoadLock::new(LinkerState::new()),
            placement: Box::new(DefaultPlacement::new()),
            pre_find: None,
            init_fn: c_abi.clone(),
            fini_fn: c_abi,
            _marker: PhantomData,
        }
    }
}

impl<M: Mmap> Linker<M> {
    /// Consumes the linker and returns one mapping memory through `NewMmap`.
    pub fn with_mmap<NewMmap: Mmap>(self) -> Linker<NewMmap> {
        Linker {
            state: self.state,
            placement: self.placement,
            pre_find: self.pre_find,
            init_fn: self.init_fn,
            fini_fn: self.fini_fn,
            _marker: PhantomData,
        }
    }

    /// Replaces the policy choosing where objects are placed.
    pub fn with_placement(&mut self, placement: impl Placement + Send + Sync + 'static) -> &mut Self {
        self.placement = Box::new(placement);
        self
    }

    /// Sets the resolver consulted for symbols while relocating.
    pub fn with_pre_find(&mut self, pre_find: SymbolResolver) -> &mut Self {
        self.pre_find = Some(pre_find);
        self
    }

    /// Sets the initialization function handler.
    ///
    /// This handler is responsible for calling the initialization functions
    /// (e.g., `.init` and `.init_array`) of the loaded ELF object.
    pub fn with_init(&mut self, init_fn: FnHandler) -> &mut Self {
        self.init_fn = init_fn;
        self
    }

    /// Sets the finalization function handler.
    pub fn with_fini(&mut self, fini_fn: FnHandler) -> &mut Self {
        self.fini_fn = fini_fn;
        self
    }

    /// Relocates an object loaded with [`MemFlags::NO_RELOCATE`](crate::MemFlags::NO_RELOCATE)
    /// and runs its initializers.
    ///
    /// Fails if the object was already relocated; initializers never run twice.
    /// A failed attempt leaves the object unusable: later attempts fail too,
    /// since some relocations may already have been applied.
    pub fn relocate(&self, handle: Handle) -> Result<()> {
        let guard = self.state.lock();
        let result = self.relocate_locked(handle);
        guard.record(&result);
        result
    }

    pub(crate) fn relocate_locked(&self, handle: Handle) -> Result<()> {
        let plan = self.with_object_mut(handle, |object| {
            if object.relocated || object.relocating {
                return Err(relocate_error(format!("{}: already relocated", object.name)));
            }
            if object.relocation_failed {
                return Err(relocate_error(format!(
                    "{}: an earlier relocation failed, the object is unusable",
                    object.name
                )));
            }
            object.relocating = true;
            Ok(RelocationPlan::new(object))
        })??;

        let result = plan.apply::<M>(self.pre_find.as_ref());
        self.with_object_mut(handle, |object| {
            object.relocating = false;
            if result.is_ok() {
                object.relocated = true;
                object.init_called = true;
            } else {
                // some slots may already hold relocated values
                object.relocation_failed = true;
            }
        })?;
        result?;
        plan.run_init(&self.init_fn);
        Ok(())
    }

    /// Looks up a symbol the object defines and returns its address.
    ///
    /// An object loaded with [`MemFlags::NO_RELOCATE`](crate::MemFlags::NO_RELOCATE)
    /// is relocated and initialized first, exactly as [`Linker::relocate`] would.
    /// `STT_GNU_IFUNC` symbols are resolved by calling their resolver.
    pub fn dlsym(&self, handle: Handle, name: &str) -> Result<*const ()> {
        let guard = self.state.lock();
        let result = self.dlsym_locked(handle, name);
        guard.record(&result);
        result
    }

    fn dlsym_locked(&self, handle: Handle, name: &str) -> Result<*const ()> {
        if self.with_object(handle, |object| !object.relocated && !object.relocating)? {
            self.relocate_locked(handle)?;
        }
        let (addr, ifunc) = self.with_object(handle, |object| {
            SymbolTable::new(object)
                .and_then(|table| {
                    table.lookup(name).map(|sym| {
                        (
                            object.l_addr().wrapping_add(sym.st_value()),
                            sym.st_type() == STT_GNU_IFUNC,
                        )
                    })
                })
                .ok_or_else(|| symbol_error(format!("{}: undefined symbol: {}", object.name, name)))
        })??;
        if ifunc {
            let resolver: extern "C" fn() -> usize = unsafe { core::mem::transmute(addr) };
            return Ok(resolver() as *const ());
        }
        Ok(addr as *const ())
    }

    /// Moves an unrelocated object's record to `base`.
    ///
    /// Only addresses change; copying the mapped bytes to `base` is the
    /// caller's job. Fails with the silent [`Error::AlreadyRelocated`] once
    /// the object has been relocated.
    pub fn set_object_base(&self, handle: Handle, base: usize) -> Result<()> {
        let guard = self.state.lock();
        let result = self
            .with_object_mut(handle, |object| {
                let old = (object.map_start(), object.map_end());
                rebase::set_base(object, base)
                    .map(|delta| (delta, old, (object.map_start(), object.map_end())))
            })
            .and_then(|moved| moved);
        if let Ok((delta, old, new)) = result {
            if delta != 0 {
                self.placement.release(old.0, old.1);
                self.placement.commit(new.0, new.1);
            }
        }
        let result = result.map(|_| ());
        guard.record(&result);
        result
    }

    /// Mapping geometry of an object, enough to move it with [`Linker::set_object_base`].
    pub fn map_info(&self, handle: Handle) -> Result<MapInfo> {
        let guard = self.state.lock();
        let result = self.with_object(handle, LoadedObject::map_info);
        guard.record(&result);
        result
    }

    /// Runs `f` on the record of an object.
    ///
    /// The registry stays borrowed while `f` runs, so `f` must not call back
    /// into the linker.
    pub fn with_object<R>(&self, handle: Handle, f: impl FnOnce(&LoadedObject) -> R) -> Result<R> {
        let guard = self.state.lock();
        let objects = guard.objects()?;
        let object = objects.get(&handle).ok_or_else(invalid_handle)?;
        Ok(f(object))
    }

    /// Drops one reference to an object, unloading it when none remain.
    ///
    /// Objects opened with [`Mode::NODELETE`] stay loaded.
    pub fn close(&self, handle: Handle) -> Result<()> {
        let guard = self.state.lock();
        let result = self.close_locked(handle);
        guard.record(&result);
        result
    }

    fn close_locked(&self, handle: Handle) -> Result<()> {
        let last = self.with_object_mut(handle, |object| {
            if object.refcount > 1 {
                object.refcount -= 1;
                return false;
            }
            !object.mode.contains(Mode::NODELETE)
        })?;
        if last {
            self.remove(handle)?;
        }
        Ok(())
    }

    /// Takes the message of the last failed operation.
    pub fn last_error(&self) -> Option<String> {
        let guard = self.state.lock();
        guard
            .last_error
            .try_borrow_mut()
            .ok()
            .and_then(|mut last| last.take())
    }

    /// Number of registered objects.
    pub fn len(&self) -> usize {
        let guard = self.state.lock();
        guard.objects().map_or(0, |objects| objects.len())
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn with_object_mut<R>(
        &self,
        handle: Handle,
        f: impl FnOnce(&mut LoadedObject) -> R,
    ) -> Result<R> {
        let guard = self.state.lock();
        let mut objects = guard.objects()?;
        let object = objects.get_mut(&handle).ok_or_else(invalid_handle)?;
        Ok(f(object))
    }

    pub(crate) fn find_by_name(&self, name: &str, nsid: usize) -> Option<Handle> {
        let guard = self.state.lock();
        let objects = guard.objects().ok()?;
        objects
            .iter()
            .find(|(_, object)| object.nsid == nsid && object.name == name)
            .map(|(handle, _)| *handle)
    }

    /// Hands out another reference to a registered object.
    pub(crate) fn reuse(&self, handle: Handle, mode: Mode) -> Result<()> {
        self.with_object_mut(handle, |object| {
            object.refcount += 1;
            object.mode |= mode & (Mode::NODELETE | Mode::GLOBAL);
            #[cfg(feature = "log")]
            log::debug!("[Reuse] {}: refcount {}", object.name, object.refcount);
        })
    }

    pub(crate) fn insert(&self, object: LoadedObject) -> Result<Handle> {
        let guard = self.state.lock();
        let id = guard.next_id.get();
        let handle = NonZeroUsize::new(id)
            .map(Handle)
            .ok_or_else(|| custom_error("handle space exhausted"))?;
        guard.next_id.set(id + 1);
        guard.objects()?.insert(handle, object);
        Ok(handle)
    }

    /// Unregisters an object, runs its finalizers and unmaps it.
    pub(crate) fn remove(&self, handle: Handle) -> Result<()> {
        let object = {
            let guard = self.state.lock();
            let mut objects = guard.objects()?;
            objects.remove(&handle).ok_or_else(invalid_handle)?
        };
        if object.init_called {
            run_fini(&object, &self.fini_fn);
        }
        self.placement.release(object.map_start(), object.map_end());
        drop(object);
        Ok(())
    }
}

#[cold]
fn invalid_handle() -> Error {
    invalid_argument("invalid handle")
}
