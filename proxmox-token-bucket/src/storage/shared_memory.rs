use std::cell::UnsafeCell;
use std::mem::MaybeUninit;
use std::path::Path;
use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};
use std::sync::Arc;

use anyhow::{bail, Error};
use nix::errno::Errno;
use nix::sys::signal::kill;
use nix::unistd::Pid;

use proxmox_shared_memory::{Init, SharedMemory};

use super::{check_timestamp, TimestampStorage};
use crate::StorageError;

/// Maximum length of a key in shared memory, in bytes.
pub const SHARED_KEY_MAX_LEN: usize = 44;

/// Number of keys one shared memory file can hold.
pub const SHARED_SLOTS: usize = 63;

const TABLE_MAGIC: [u8; 8] = *b"PMXTBKT2";

// low half of a slot's state word, the high half holds the claimer's pid
const SLOT_EMPTY: u32 = 0;
const SLOT_CLAIMING: u32 = 1;
const SLOT_READY: u32 = 2;

// a slot stays in SLOT_CLAIMING only for the few stores done by its claimer
const CLAIM_SPIN_LIMIT: usize = 100_000;
const CLAIMER_CHECK_INTERVAL: usize = 1024;

const fn claim_word(pid: u32) -> u64 {
    ((pid as u64) << 32) | SLOT_CLAIMING as u64
}

const fn claimer_pid(word: u64) -> u32 {
    (word >> 32) as u32
}

fn claimer_alive(pid: u32) -> bool {
    if pid == 0 || pid > i32::MAX as u32 {
        return false;
    }
    // EPERM still means the process exists
    !matches!(kill(Pid::from_raw(pid as i32), None), Err(Errno::ESRCH))
}

#[repr(C)]
struct Slot {
    state: AtomicU64,
    timestamp: AtomicU64,
    key_len: AtomicU32,
    // only written while the slot is SLOT_CLAIMING by its claimer
    key: UnsafeCell<[u8; SHARED_KEY_MAX_LEN]>,
}

impl Slot {
    /// Only valid after observing `SLOT_READY` with acquire ordering.
    fn key(&self) -> &[u8] {
        let len = (self.key_len.load(Ordering::Relaxed) as usize).min(SHARED_KEY_MAX_LEN);
        unsafe { &(&*self.key.get())[..len] }
    }

    /// Fill a slot we hold the claim for and publish it.
    fn publish(&self, key: &str, timestamp: f64) {
        let bytes = key.as_bytes();
        unsafe {
            let data = &mut *self.key.get();
            data.fill(0);
            data[..bytes.len()].copy_from_slice(bytes);
        }
        self.key_len.store(bytes.len() as u32, Ordering::Relaxed);
        self.timestamp.store(timestamp.to_bits(), Ordering::Relaxed);
        self.state.store(SLOT_READY as u64, Ordering::Release);
    }
}

enum SlotState {
    Empty,
    Ready,
    /// Claimed by a process which no longer exists, carries the claim word.
    Abandoned(u64),
    /// Claimed by a live process which did not finish in time.
    Busy,
}

/// IMPORTANT: This struct lives in shared memory, do not change the layout
/// without changing [`TABLE_MAGIC`].
#[repr(C)]
struct TimestampTable {
    magic: [u8; 8],
    _padding: [u8; 56],
    slots: [Slot; SHARED_SLOTS],
}

unsafe impl Sync for TimestampTable {}
unsafe impl Send for TimestampTable {}

impl Init for TimestampTable {
    fn initialize(this: &mut MaybeUninit<Self>) {
        // all zero is a valid table: every slot is SLOT_EMPTY
        unsafe {
            std::ptr::write_bytes(this.as_mut_ptr(), 0, 1);
            (*this.as_mut_ptr()).magic = TABLE_MAGIC;
        }
    }

    fn check_type_magic(this: &MaybeUninit<Self>) -> Result<(), Error> {
        let magic = unsafe { (*this.as_ptr()).magic };
        if magic != TABLE_MAGIC {
            bail!("token bucket table has wrong magic {:?}", magic);
        }
        Ok(())
    }
}

/// Keyed timestamps shared between processes through a memory mapped file.
///
/// The file holds a fixed table of [`SHARED_SLOTS`] slots. Timestamps are
/// updated with atomic compare-and-swap only. Claiming a free slot for a new
/// key takes a short claim tagged with the claimer's process id. A claim
/// left behind by a process that died is taken over by the next bootstrap,
/// and lookups skip it in the meantime. Claimers are identified by pid, so
/// all users of one file must share a pid namespace. Keys cannot be removed
/// again.
#[derive(Clone)]
pub struct SharedMemoryStorage {
    shmem: Arc<SharedMemory<TimestampTable>>,
}

impl SharedMemoryStorage {
    /// Open or create the timestamp table at `path`.
    ///
    /// The file should be located on a tmpfs, e.g. below `/run`.
    pub fn open(path: &Path) -> Result<Self, StorageError> {
        let shmem = SharedMemory::open(path)
            .map_err(|err| StorageError::Unavailable(format!("{err:#}")))?;
        Ok(Self {
            shmem: Arc::new(shmem),
        })
    }

    fn table(&self) -> &TimestampTable {
        self.shmem.data()
    }

    fn check_key(key: &str) -> Result<(), StorageError> {
        let reason = if key.is_empty() {
            "key must not be empty"
        } else if key.len() > SHARED_KEY_MAX_LEN {
            "key too long"
        } else {
            return Ok(());
        };
        Err(StorageError::InvalidKey {
            key: key.to_string(),
            reason,
        })
    }

    /// Wait until the slot is not claimed by a live process anymore.
    fn settle(slot: &Slot) -> Result<SlotState, StorageError> {
        let mut spins = 0;
        loop {
            let word = slot.state.load(Ordering::Acquire);
            match word as u32 {
                SLOT_EMPTY => return Ok(SlotState::Empty),
                SLOT_READY => return Ok(SlotState::Ready),
                SLOT_CLAIMING => {
                    if spins % CLAIMER_CHECK_INTERVAL == 0 && !claimer_alive(claimer_pid(word)) {
                        return Ok(SlotState::Abandoned(word));
                    }
                    if spins >= CLAIM_SPIN_LIMIT {
                        return Ok(SlotState::Busy);
                    }
                }
                state => return Err(corrupted_state(state)),
            }
            spins += 1;
            std::thread::yield_now();
        }
    }

    fn find_slot(&self, key: &str) -> Result<&Slot, StorageError> {
        Self::check_key(key)?;
        for slot in self.table().slots.iter() {
            match Self::settle(slot)? {
                SlotState::Ready if slot.key() == key.as_bytes() => return Ok(slot),
                SlotState::Ready | SlotState::Abandoned(_) | SlotState::Busy => continue,
                // slots are filled in order, so the key is not stored
                SlotState::Empty => break,
            }
        }
        Err(StorageError::NotBootstrapped(key.to_string()))
    }

    fn try_claim(slot: &Slot, current: u64) -> bool {
        slot.state
            .compare_exchange(
                current,
                claim_word(std::process::id()),
                Ordering::AcqRel,
                Ordering::Acquire,
            )
            .is_ok()
    }
}

fn corrupted_state(state: u32) -> StorageError {
    StorageError::Unavailable(format!("corrupted shared memory slot state {state}"))
}

impl TimestampStorage for SharedMemoryStorage {
    fn bootstrap(&self, key: &str, timestamp: f64) -> Result<bool, StorageError> {
        Self::check_key(key)?;
        let timestamp = check_timestamp(key, timestamp)?;

        for (index, slot) in self.table().slots.iter().enumerate() {
            loop {
                match Self::settle(slot)? {
                    SlotState::Ready if slot.key() == key.as_bytes() => return Ok(false),
                    SlotState::Ready => break,
                    SlotState::Empty => {
                        if !Self::try_claim(slot, SLOT_EMPTY as u64) {
                            // somebody else claimed it, look again
                            continue;
                        }
                    }
                    SlotState::Abandoned(word) => {
                        if !Self::try_claim(slot, word) {
                            continue;
                        }
                        log::warn!(
                            "reclaiming shared memory slot {index} abandoned by pid {}",
                            claimer_pid(word)
                        );
                    }
                    SlotState::Busy => {
                        log::warn!("skipping shared memory slot {index}, claim does not finish");
                        break;
                    }
                }

                slot.publish(key, timestamp);
                log::debug!("claimed shared memory slot {index} for '{key}'");
                return Ok(true);
            }
        }

        Err(StorageError::TableFull(key.to_string()))
    }

    fn read_timestamp(&self, key: &str) -> Result<f64, StorageError> {
        let slot = self.find_slot(key)?;
        check_timestamp(key, f64::from_bits(slot.timestamp.load(Ordering::Acquire)))
    }

    fn compare_and_swap_timestamp(
        &self,
        key: &str,
        expected: f64,
        new: f64,
    ) -> Result<bool, StorageError> {
        let new = check_timestamp(key, new)?;
        let slot = self.find_slot(key)?;
        Ok(slot
            .timestamp
            .compare_exchange(
                expected.to_bits(),
                new.to_bits(),
                Ordering::AcqRel,
                Ordering::Acquire,
            )
            .is_ok())
    }

    fn is_shared(&self) -> bool {
        true
    }
}

#[cfg(test)]
mod test {
    use super::*;

    // above any possible pid_max
    const DEAD_PID: u32 = i32::MAX as u32;

    fn test_storage(filename: &str) -> Option<SharedMemoryStorage> {
        let mut path = std::env::temp_dir();
        path.push(format!("token-bucket-{}", std::process::id()));
        let _ = std::fs::create_dir_all(&path);
        path.push(filename);
        let _ = std::fs::remove_file(&path);

        // fails without O_TMPFILE support
        let storage = SharedMemoryStorage::open(&path).ok();
        let _ = std::fs::remove_file(&path);
        storage
    }

    fn stale_claim(slot: &Slot, pid: u32, garbage: &[u8]) {
        unsafe { (&mut *slot.key.get())[..garbage.len()].copy_from_slice(garbage) };
        slot.key_len.store(garbage.len() as u32, Ordering::Relaxed);
        slot.state.store(claim_word(pid), Ordering::Release);
    }

    #[test]
    fn test_table_fills_one_page() {
        assert_eq!(std::mem::size_of::<Slot>(), 64);
        assert_eq!(std::mem::size_of::<TimestampTable>(), 4096);
    }

    #[test]
    fn test_key_validation() {
        assert!(SharedMemoryStorage::check_key("datastore-1").is_ok());
        assert!(matches!(
            SharedMemoryStorage::check_key(""),
            Err(StorageError::InvalidKey { .. })
        ));
        let long = "x".repeat(SHARED_KEY_MAX_LEN + 1);
        assert!(matches!(
            SharedMemoryStorage::check_key(&long),
            Err(StorageError::InvalidKey { .. })
        ));
    }

    #[test]
    fn test_claim_word() {
        let word = claim_word(4711);
        assert_eq!(word as u32, SLOT_CLAIMING);
        assert_eq!(claimer_pid(word), 4711);
        assert!(claimer_alive(std::process::id()));
        assert!(!claimer_alive(DEAD_PID));
        assert!(!claimer_alive(0));
    }

    #[test]
    fn test_dead_claimer_is_reclaimed() -> Result<(), StorageError> {
        let storage = match test_storage("dead-claimer.shm") {
            None => return Ok(()),
            Some(storage) => storage,
        };

        assert!(storage.bootstrap("first", 1.0)?);
        stale_claim(&storage.table().slots[1], DEAD_PID, b"half-written");

        // lookups are not blocked by the stale claim
        assert_eq!(storage.read_timestamp("first")?, 1.0);
        assert!(storage.compare_and_swap_timestamp("first", 1.0, 2.0)?);
        assert!(matches!(
            storage.read_timestamp("half-written"),
            Err(StorageError::NotBootstrapped(_))
        ));

        // the next bootstrap takes the slot over
        assert!(storage.bootstrap("second", 3.0)?);
        let slot = &storage.table().slots[1];
        assert_eq!(slot.state.load(Ordering::Acquire), SLOT_READY as u64);
        assert_eq!(slot.key(), b"second");
        assert_eq!(storage.read_timestamp("second")?, 3.0);

        assert!(storage.bootstrap("third", 4.0)?);
        assert_eq!(storage.table().slots[2].key(), b"third");
        assert_eq!(storage.read_timestamp("first")?, 2.0);
        Ok(())
    }

    #[test]
    fn test_stuck_live_claim_is_skipped() -> Result<(), StorageError> {
        let storage = match test_storage("stuck-claimer.shm") {
            None => return Ok(()),
            Some(storage) => storage,
        };

        // our own pid is alive, so the claim is never taken over
        stale_claim(&storage.table().slots[0], std::process::id(), b"");

        assert!(storage.bootstrap("other", 5.0)?);
        assert_eq!(storage.table().slots[1].key(), b"other");
        assert_eq!(storage.read_timestamp("other")?, 5.0);
        assert_eq!(
            storage.table().slots[0].state.load(Ordering::Acquire),
            claim_word(std::process::id())
        );
        Ok(())
    }

    #[test]
    fn test_corrupted_slot_state() {
        let storage = match test_storage("bad-state.shm") {
            None => return,
            Some(storage) => storage,
        };

        storage.table().slots[0].state.store(7, Ordering::Release);
        assert!(matches!(
            storage.read_timestamp("any"),
            Err(StorageError::Unavailable(_))
        ));
    }
}
