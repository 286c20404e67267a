//! Shared memory helpers.
//!
//! A [`SharedMemory`] maps a file into the address space of every process
//! opening it, so all of them see the same data. Files should be placed on
//! a `tmpfs` (for example below `/run` or `/dev/shm`), where the mapping is
//! never written back to a disk.
//!
//! The mapped type is initialized exactly once: the file is created
//! anonymously with `O_TMPFILE`, initialized, and only then linked into
//! place. Processes racing to create the same file either win the `linkat`
//! or open the file the winner linked.

#![deny(unsafe_op_in_unsafe_fn)]

use std::ffi::{CStr, CString};
use std::fs::{File, OpenOptions, Permissions};
use std::io::ErrorKind;
use std::mem::MaybeUninit;
use std::num::NonZeroUsize;
use std::os::unix::ffi::OsStrExt;
use std::os::unix::fs::{OpenOptionsExt, PermissionsExt};
use std::os::unix::io::AsRawFd;
use std::path::Path;
use std::ptr::NonNull;

use anyhow::{bail, format_err, Error};
use nix::errno::Errno;
use nix::sys::mman::{self, MapFlags, ProtFlags};

/// Data inside [`SharedMemory`] needs to implement this trait.
///
/// IMPORTANT: Please use `#[repr(C)]` for all types implementing this, and
/// only use atomic types from `std::sync::atomic` for data modified after
/// initialization.
pub trait Init: Sized {
    /// Make sure the data structure is initialized. This is called
    /// after mapping into shared memory. The caller makes sure that
    /// no other process runs this at the same time.
    fn initialize(this: &mut MaybeUninit<Self>);

    /// Check if the data has the expected type (usually by comparing a
    /// magic value). Called every time an existing file is mapped.
    fn check_type_magic(_this: &MaybeUninit<Self>) -> Result<(), Error> {
        Ok(())
    }
}

/// Default permissions of newly created shared memory files.
pub const DEFAULT_PERMISSIONS: u32 = 0o600;

const PAGE_SIZE: usize = 4096;

const fn up_to_page_size(n: usize) -> usize {
    (n + PAGE_SIZE - 1) & !(PAGE_SIZE - 1)
}

struct Mapping<T> {
    data: NonNull<T>,
}

// The mapped data is shared between processes anyway, so the usual
// auto trait rules of the contained type apply.
unsafe impl<T: Send> Send for Mapping<T> {}
unsafe impl<T: Sync> Sync for Mapping<T> {}

impl<T> Mapping<T> {
    fn uninit_mut(&mut self) -> &mut MaybeUninit<T> {
        unsafe { &mut *(self.data.as_ptr() as *mut MaybeUninit<T>) }
    }
}

impl<T> Drop for Mapping<T> {
    fn drop(&mut self) {
        unsafe {
            // Failing to unmap leaks address space only, there is nothing left to clean up.
            let _ = mman::munmap(self.data.cast(), std::mem::size_of::<T>());
        }
    }
}

fn mmap_file<T: Init>(file: &File, initialize: bool) -> Result<Mapping<T>, Error> {
    let len = NonZeroUsize::new(std::mem::size_of::<T>())
        .ok_or_else(|| format_err!("unable to map zero sized type"))?;

    let data = unsafe {
        mman::mmap(
            None,
            len,
            ProtFlags::PROT_READ | ProtFlags::PROT_WRITE,
            MapFlags::MAP_SHARED | MapFlags::MAP_NORESERVE | MapFlags::MAP_POPULATE,
            file,
            0,
        )
    }
    .map_err(|err| format_err!("mmap failed - {err}"))?;

    let mut mapping = Mapping {
        data: data.cast::<T>(),
    };

    if initialize {
        Init::initialize(mapping.uninit_mut());
    }

    Init::check_type_magic(mapping.uninit_mut())?;

    Ok(mapping)
}

/// Memory mapped shared memory region.
///
/// This allows access to the same memory region from multiple processes.
///
/// `size_of::<T>()` needs to be a multiple of 4096 (the page size).
pub struct SharedMemory<T> {
    mapping: Mapping<T>,
}

impl<T: Sized + Init> SharedMemory<T> {
    /// Open (or create) the shared memory file at `path` using
    /// [`DEFAULT_PERMISSIONS`].
    pub fn open(path: &Path) -> Result<Self, Error> {
        Self::open_with_permissions(path, DEFAULT_PERMISSIONS)
    }

    /// Open (or create) the shared memory file at `path`. The `mode` is
    /// only applied when the file gets created.
    pub fn open_with_permissions(path: &Path, mode: u32) -> Result<Self, Error> {
        let size = std::mem::size_of::<T>();
        let up_size = up_to_page_size(size);

        if size != up_size {
            bail!(
                "SharedMemory::open {:?} failed - data size {} is not a multiple of {}",
                path,
                size,
                PAGE_SIZE,
            );
        }

        let mapping = open_shmem(path, mode)?;

        Ok(Self { mapping })
    }

    pub fn data(&self) -> &T {
        unsafe { self.mapping.data.as_ref() }
    }

    pub fn data_mut(&mut self) -> &mut T {
        unsafe { self.mapping.data.as_mut() }
    }
}

fn open_existing<T: Init>(path: &Path) -> Result<Option<Mapping<T>>, Error> {
    match OpenOptions::new().read(true).write(true).open(path) {
        Ok(file) => {
            check_file_size::<T>(&file, path)?;
            Ok(Some(mmap_file(&file, false)?))
        }
        Err(err) if err.kind() == ErrorKind::NotFound => Ok(None),
        Err(err) => bail!("open {:?} failed - {}", path, err),
    }
}

fn check_file_size<T>(file: &File, path: &Path) -> Result<(), Error> {
    let len = file.metadata()?.len();
    if len != std::mem::size_of::<T>() as u64 {
        bail!(
            "shared memory file {:?} has unexpected size {} (expected {})",
            path,
            len,
            std::mem::size_of::<T>(),
        );
    }
    Ok(())
}

fn open_shmem<T: Init>(path: &Path, mode: u32) -> Result<Mapping<T>, Error> {
    let dir_name = path
        .parent()
        .ok_or_else(|| format_err!("bad path {:?}", path))?
        .to_owned();

    if let Some(mapping) = open_existing(path)? {
        return Ok(mapping);
    }

    // create temporary file using O_TMPFILE
    let file = match OpenOptions::new()
        .read(true)
        .write(true)
        .custom_flags(libc::O_TMPFILE)
        .mode(mode)
        .open(&dir_name)
    {
        Ok(file) => file,
        Err(err) => bail!("open tmpfile in {:?} failed - {}", dir_name, err),
    };

    // the umask may have masked out some bits
    file.set_permissions(Permissions::from_mode(mode))?;
    file.set_len(std::mem::size_of::<T>() as u64)?;

    let mapping = mmap_file(&file, true)?;

    // link the file into place:
    let proc_path = format!("/proc/self/fd/{}\0", file.as_raw_fd());
    let proc_path = CStr::from_bytes_with_nul(proc_path.as_bytes())?;

    let res = {
        let path = CString::new(path.as_os_str().as_bytes())?;
        Errno::result(unsafe {
            libc::linkat(
                -1,
                proc_path.as_ptr(),
                libc::AT_FDCWD,
                path.as_ptr(),
                libc::AT_SYMLINK_FOLLOW,
            )
        })
    };

    drop(file); // no longer required

    match res {
        Ok(_rc) => {
            log::debug!("created shared memory file {:?}", path);
            Ok(mapping)
        }
        // if someone else was faster, open the existing file:
        Err(Errno::EEXIST) => {
            drop(mapping);
            match open_existing(path)? {
                Some(mapping) => Ok(mapping),
                None => bail!("open {:?} failed - file vanished", path),
            }
        }
        Err(err) => bail!("linking {:?} failed - {}", path, err),
    }
}
