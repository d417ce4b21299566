//! Cross-process shared-memory coordination record (§3, §4.4).
//!
//! A C++ implementation of this protocol would build this on
//! `boost::interprocess`'s managed shared memory segment plus an
//! `interprocess_recursive_mutex` embedded in it. Rust's closest
//! equivalent pairing is the `shared_memory` crate (named segment,
//! open-or-create semantics) plus `raw_sync` (a process-shared lock
//! living inside that segment) — the two are commonly used together for
//! exactly this purpose. This gives up a dynamic allocator inside the
//! segment (no Rust crate offers that safely) in favor of a fixed,
//! `#[repr(C)]`, POD-like layout sized up front, matching §4.4's guidance
//! to model the record as a POD-like struct with a recursive mutex, not
//! as an owning container.

use std::ffi::CString;
use std::time::{SystemTime, UNIX_EPOCH};

use md5::{Digest, Md5};
use raw_sync::locks::{LockGuard, LockInit, Mutex as RawMutex};
use shared_memory::{Shmem, ShmemConf, ShmemError};

use crate::config::MAX_S3_PART_COUNT;
use crate::error::{ErrorCode, Result, TransportError};

/// One ETag, stored inline so the table can be pre-sized without a
/// dynamic allocator inside the shared segment (§4.2.1: "sized to this
/// maximum up front to avoid reallocation under contention").
#[repr(C)]
#[derive(Clone, Copy)]
struct EtagSlot {
    len: u16,
    bytes: [u8; 110],
}

impl EtagSlot {
    const EMPTY: EtagSlot = EtagSlot {
        len: 0,
        bytes: [0; 110],
    };

    fn set(&mut self, etag: &str) {
        let bytes = etag.as_bytes();
        let n = bytes.len().min(self.bytes.len());
        self.bytes[..n].copy_from_slice(&bytes[..n]);
        self.len = n as u16;
    }

    fn get(&self) -> Option<String> {
        if self.len == 0 {
            None
        } else {
            Some(String::from_utf8_lossy(&self.bytes[..self.len as usize]).into_owned())
        }
    }

    fn is_empty(&self) -> bool {
        self.len == 0
    }
}

#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub enum CacheDownloadProgress {
    NotStarted,
    Started,
    Success,
    Failed,
}

/// The POD record protected by the process-shared mutex. This is the exact
/// field set from §3 "Shared coordination record".
#[repr(C)]
struct RecordData {
    threads_remaining_to_close: i32,
    done_initiate_multipart: bool,
    upload_id_len: u16,
    upload_id: [u8; 126],
    /// Highest part number any writer has filled in, used as `N` when
    /// building the completion document (§9A.2: iterate `[0, N)`, not
    /// `etags.len()`).
    highest_part_number: u32,
    etags: [EtagSlot; MAX_S3_PART_COUNT],
    last_error_code: u8,
    cache_file_download_progress: u8,
    existing_object_size: i64,
    ref_count: i32,
    file_open_counter: i32,
    know_number_of_threads: bool,
    circular_buffer_read_timeout: bool,
    last_access_time_in_seconds: i64,
}

impl RecordData {
    fn init(&mut self, declared_thread_count: Option<i32>) {
        self.threads_remaining_to_close = declared_thread_count.unwrap_or(0);
        self.done_initiate_multipart = false;
        self.upload_id_len = 0;
        self.upload_id = [0; 126];
        self.highest_part_number = 0;
        self.etags = [EtagSlot::EMPTY; MAX_S3_PART_COUNT];
        self.last_error_code = ErrorCode::Success as u8;
        self.cache_file_download_progress = CacheDownloadProgress::NotStarted as u8;
        self.existing_object_size = -1;
        self.ref_count = 0;
        self.file_open_counter = 0;
        self.know_number_of_threads = declared_thread_count.is_some();
        self.circular_buffer_read_timeout = false;
        self.last_access_time_in_seconds = now_secs();
    }

    fn can_delete(&self) -> bool {
        if self.know_number_of_threads {
            self.threads_remaining_to_close == 0
        } else {
            self.file_open_counter == 0
        }
    }
}

fn now_secs() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs() as i64
}

/// `"irods_s3-shm-" + hash("/" + key)` (§3, §6 "Persisted state").
pub fn shared_memory_name(key: &str) -> String {
    let mut hasher = Md5::new();
    hasher.update(b"/");
    hasher.update(key.as_bytes());
    let digest = hasher.finalize();
    format!("irods_s3-shm-{:x}", digest)
}

/// A mutable view into the record, handed to the closure passed to
/// [`SharedRecordHandle::atomic_exec`]/[`SharedRecordHandle::exec`].
pub struct RecordView<'a> {
    data: &'a mut RecordData,
}

impl<'a> RecordView<'a> {
    pub fn threads_remaining_to_close(&self) -> i32 {
        self.data.threads_remaining_to_close
    }

    pub fn set_threads_remaining_to_close(&mut self, n: i32) {
        self.data.threads_remaining_to_close = n;
    }

    /// Decrements the close counter and reports whether this call is the
    /// finalizer (§4.1.2 step 1).
    pub fn decrement_and_check_finalizer(&mut self) -> bool {
        self.data.threads_remaining_to_close -= 1;
        self.data.threads_remaining_to_close <= 0
    }

    pub fn done_initiate_multipart(&self) -> bool {
        self.data.done_initiate_multipart
    }

    /// Flips `done_initiate_multipart` and returns whether *this* caller
    /// won the race to be the initiator (§3 invariant 1).
    pub fn try_claim_initiator(&mut self) -> bool {
        if self.data.done_initiate_multipart {
            false
        } else {
            self.data.done_initiate_multipart = true;
            true
        }
    }

    pub fn upload_id(&self) -> Option<String> {
        if self.data.upload_id_len == 0 {
            None
        } else {
            Some(String::from_utf8_lossy(&self.data.upload_id[..self.data.upload_id_len as usize]).into_owned())
        }
    }

    pub fn set_upload_id(&mut self, id: &str) {
        let bytes = id.as_bytes();
        let n = bytes.len().min(self.data.upload_id.len());
        self.data.upload_id[..n].copy_from_slice(&bytes[..n]);
        self.data.upload_id_len = n as u16;
    }

    /// Records the ETag for `part_number` (1-based) and bumps the
    /// high-water mark used for completion (§4.2 step 4, §9 "ETag ordering").
    pub fn set_etag(&mut self, part_number: u32, etag: &str) -> Result<()> {
        if part_number == 0 || part_number as usize > MAX_S3_PART_COUNT {
            return Err(TransportError::Config(format!(
                "part number {part_number} exceeds the {MAX_S3_PART_COUNT} part maximum"
            )));
        }
        self.data.etags[(part_number - 1) as usize].set(etag);
        if part_number > self.data.highest_part_number {
            self.data.highest_part_number = part_number;
        }
        Ok(())
    }

    /// Builds the ordered ETag list for completion by iterating
    /// `[0, highest_part_number)`. Any empty slot in that range is a
    /// dropped part and must abort rather than complete (§9 "ETag
    /// ordering", §9A.2).
    pub fn collect_etags_for_completion(&self) -> std::result::Result<Vec<String>, u32> {
        let n = self.data.highest_part_number;
        let mut out = Vec::with_capacity(n as usize);
        for i in 0..n {
            let slot = &self.data.etags[i as usize];
            if slot.is_empty() {
                return Err(i + 1);
            }
            out.push(slot.get().unwrap());
        }
        Ok(out)
    }

    pub fn last_error_code(&self) -> ErrorCode {
        match self.data.last_error_code {
            x if x == ErrorCode::OutOfDiskSpace as u8 => ErrorCode::OutOfDiskSpace,
            x if x == ErrorCode::BadAlloc as u8 => ErrorCode::BadAlloc,
            x if x == ErrorCode::BytesTransferredMismatch as u8 => ErrorCode::BytesTransferredMismatch,
            x if x == ErrorCode::InitiateMultipartUploadError as u8 => ErrorCode::InitiateMultipartUploadError,
            x if x == ErrorCode::CompleteMultipartUploadError as u8 => ErrorCode::CompleteMultipartUploadError,
            x if x == ErrorCode::UploadFileError as u8 => ErrorCode::UploadFileError,
            x if x == ErrorCode::DownloadFileError as u8 => ErrorCode::DownloadFileError,
            _ => ErrorCode::Success,
        }
    }

    /// Sets the sticky error, but only if one is not already latched —
    /// the first failure for a key wins (§7 propagation policy).
    pub fn set_last_error_code_if_unset(&mut self, code: ErrorCode) {
        if self.last_error_code().is_success() {
            self.data.last_error_code = code as u8;
        }
    }

    pub fn cache_file_download_progress(&self) -> CacheDownloadProgress {
        match self.data.cache_file_download_progress {
            x if x == CacheDownloadProgress::Started as u8 => CacheDownloadProgress::Started,
            x if x == CacheDownloadProgress::Success as u8 => CacheDownloadProgress::Success,
            x if x == CacheDownloadProgress::Failed as u8 => CacheDownloadProgress::Failed,
            _ => CacheDownloadProgress::NotStarted,
        }
    }

    pub fn set_cache_file_download_progress(&mut self, progress: CacheDownloadProgress) {
        self.data.cache_file_download_progress = progress as u8;
    }

    pub fn existing_object_size(&self) -> Option<u64> {
        if self.data.existing_object_size < 0 {
            None
        } else {
            Some(self.data.existing_object_size as u64)
        }
    }

    pub fn set_existing_object_size(&mut self, size: u64) {
        self.data.existing_object_size = size as i64;
    }

    pub fn circular_buffer_read_timeout(&self) -> bool {
        self.data.circular_buffer_read_timeout
    }

    pub fn set_circular_buffer_read_timeout(&mut self) {
        self.data.circular_buffer_read_timeout = true;
    }

    pub fn file_open_counter(&self) -> i32 {
        self.data.file_open_counter
    }

    pub fn increment_file_open_counter(&mut self) {
        self.data.file_open_counter += 1;
    }

    pub fn decrement_file_open_counter(&mut self) {
        self.data.file_open_counter -= 1;
    }
}

/// Handle to one key's shared coordination record. Opening it finds or
/// constructs the named segment, bumps `ref_count`, and reconstructs the
/// record if it was found stale (§4.4 "Find-or-construct").
pub struct SharedRecordHandle {
    shmem: Shmem,
    mutex: Box<dyn raw_sync::locks::LockImpl>,
    name: String,
}

// Safety: access to the mapped memory is always taken through the
// process-shared mutex in `mutex`, which serializes readers and writers
// across threads and processes alike.
unsafe impl Send for SharedRecordHandle {}
unsafe impl Sync for SharedRecordHandle {}

const RECORD_SIZE: usize = std::mem::size_of::<RecordData>();

impl SharedRecordHandle {
    /// Opens (creating if necessary) the record for `key`, claiming one
    /// reference. `declared_thread_count` is `Some(n)` when the client
    /// declares its transfer-thread count up front (§3
    /// `know_number_of_threads`).
    pub fn open(key: &str, shared_memory_timeout_seconds: u64, declared_thread_count: Option<i32>) -> Result<Self> {
        let name = shared_memory_name(key);
        let lock_region_size = RawMutex::size_of(None);
        let total_size = lock_region_size + RECORD_SIZE;

        let shmem = match ShmemConf::new().size(total_size).os_id(&name).create() {
            Ok(m) => {
                // We created it: zero + initialize under a fresh lock.
                let base = m.as_ptr();
                unsafe {
                    std::ptr::write_bytes(base, 0, total_size);
                }
                m
            }
            Err(ShmemError::MappingIdExists) => ShmemConf::new()
                .os_id(&name)
                .open()
                .map_err(|e| TransportError::SharedMemory(format!("opening {name}: {e}")))?,
            Err(e) => return Err(TransportError::SharedMemory(format!("creating {name}: {e}"))),
        };

        let base = shmem.as_ptr();
        let lock_ptr = base;
        let data_ptr = unsafe { base.add(lock_region_size) };

        // `LockInit::from_existing` attaches to a lock already initialized
        // by whichever process created the segment first; `new` formats a
        // fresh one. We cannot distinguish "created" from "opened" at this
        // point without a second round-trip, so every opener race on `new`
        // guarded by a short-lived construction mutex, playing the same
        // role a `create_delete_reset_mutex` plays in §4.4.
        let construction_guard = CString::new(format!("{name}-ctor"))
            .map_err(|e| TransportError::SharedMemory(e.to_string()))?;
        let _ctor_lock = named_os_mutex_guard(&construction_guard)?;

        let (mutex, _used) = unsafe {
            match RawMutex::from_existing(lock_ptr, data_ptr) {
                Ok(pair) => pair,
                Err(_) => RawMutex::new(lock_ptr, data_ptr)
                    .map_err(|e| TransportError::SharedMemory(format!("initializing lock: {e}")))?,
            }
        };

        // `ShmemConf::create`'s default owner flag would unlink the named
        // segment as soon as *this* handle drops, regardless of whether any
        // other thread/process still references it. Ownership of the
        // teardown decision belongs to the ref-counted `Drop` impl below,
        // not to whichever caller happened to win the create race.
        let mut shmem = shmem;
        shmem.set_owner(false);

        let handle = SharedRecordHandle { shmem, mutex, name };

        handle.atomic_exec(|record| {
            let now = now_secs();
            let is_fresh = record.data.ref_count == 0
                && record.data.threads_remaining_to_close == 0
                && record.data.last_access_time_in_seconds == 0;
            let is_stale = !is_fresh
                && now - record.data.last_access_time_in_seconds > shared_memory_timeout_seconds as i64;

            if is_fresh || is_stale {
                record.data.init(declared_thread_count);
            }
            record.data.ref_count += 1;
            record.data.last_access_time_in_seconds = now;
        });

        Ok(handle)
    }

    /// Runs `f` under the process-shared mutex, updating
    /// `last_access_time_in_seconds` first (§4.4 `atomic_exec`).
    pub fn atomic_exec<T>(&self, f: impl FnOnce(&mut RecordView<'_>) -> T) -> T {
        let guard: LockGuard<'_> = self.mutex.lock().expect("shared record mutex poisoned");
        let data = unsafe { &mut *(*guard as *mut RecordData) };
        data.last_access_time_in_seconds = now_secs();
        let mut view = RecordView { data };
        f(&mut view)
    }

    pub fn name(&self) -> &str {
        &self.name
    }
}

impl Drop for SharedRecordHandle {
    fn drop(&mut self) {
        let should_remove = {
            let guard = match self.mutex.lock() {
                Ok(g) => g,
                Err(_) => return,
            };
            let data = unsafe { &mut *(*guard as *mut RecordData) };
            data.ref_count -= 1;
            data.ref_count <= 0 && data.can_delete()
        };

        if should_remove {
            // Claim ownership so this handle's own `Shmem::drop` unlinks
            // the named segment (§8 property 5: the segment no longer
            // exists once the last instance is destroyed). Best-effort:
            // another process may race us to remove it first, which is
            // fine (§3 invariant 4).
            self.shmem.set_owner(true);
        }
    }
}

/// A short-lived OS-level named mutex used only to serialize the
/// create-or-find step, the same role `boost::interprocess::named_mutex`
/// plays in a C++ implementation of this protocol. Backed by a `/tmp`
/// flock since Rust has no first-class named-semaphore crate in this
/// dependency graph; this is purely a construction-time guard and is
/// never held across a blocking S3 call.
struct NamedOsMutexGuard {
    _file: std::fs::File,
}

fn named_os_mutex_guard(name: &CString) -> Result<NamedOsMutexGuard> {
    let path = std::env::temp_dir().join(format!("{}.lock", name.to_string_lossy()));
    let file = std::fs::OpenOptions::new()
        .create(true)
        .write(true)
        .open(&path)
        .map_err(TransportError::Io)?;
    flock_exclusive(&file)?;
    Ok(NamedOsMutexGuard { _file: file })
}

impl Drop for NamedOsMutexGuard {
    fn drop(&mut self) {
        let _ = flock_unlock(&self._file);
    }
}

#[cfg(unix)]
fn flock_exclusive(file: &std::fs::File) -> Result<()> {
    use std::os::unix::io::AsRawFd;
    let ret = unsafe { libc::flock(file.as_raw_fd(), libc::LOCK_EX) };
    if ret != 0 {
        return Err(TransportError::Io(std::io::Error::last_os_error()));
    }
    Ok(())
}

#[cfg(unix)]
fn flock_unlock(file: &std::fs::File) -> Result<()> {
    use std::os::unix::io::AsRawFd;
    let ret = unsafe { libc::flock(file.as_raw_fd(), libc::LOCK_UN) };
    if ret != 0 {
        return Err(TransportError::Io(std::io::Error::last_os_error()));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn shared_memory_name_is_deterministic_per_key() {
        let a = shared_memory_name("bucket/key1");
        let b = shared_memory_name("bucket/key1");
        let c = shared_memory_name("bucket/key2");
        assert_eq!(a, b);
        assert_ne!(a, c);
        assert!(a.starts_with("irods_s3-shm-"));
    }

    #[test]
    fn open_initializes_ref_count_and_thread_count() {
        let key = format!("test-key-{}", std::process::id());
        let handle = SharedRecordHandle::open(&key, 900, Some(4)).unwrap();
        handle.atomic_exec(|r| {
            assert_eq!(r.threads_remaining_to_close(), 4);
        });
        drop(handle);
    }

    #[test]
    fn only_one_thread_claims_initiator() {
        let key = format!("test-key-initiator-{}", std::process::id());
        let handle = SharedRecordHandle::open(&key, 900, Some(2)).unwrap();
        let first = handle.atomic_exec(|r| r.try_claim_initiator());
        let second = handle.atomic_exec(|r| r.try_claim_initiator());
        assert!(first);
        assert!(!second);
    }

    #[test]
    fn completion_fails_on_gap_in_etags() {
        let key = format!("test-key-gap-{}", std::process::id());
        let handle = SharedRecordHandle::open(&key, 900, Some(1)).unwrap();
        handle.atomic_exec(|r| {
            r.set_etag(1, "etag-1").unwrap();
            r.set_etag(3, "etag-3").unwrap();
        });
        let result = handle.atomic_exec(|r| r.collect_etags_for_completion());
        assert_eq!(result, Err(2));
    }

    #[test]
    fn completion_succeeds_when_dense() {
        let key = format!("test-key-dense-{}", std::process::id());
        let handle = SharedRecordHandle::open(&key, 900, Some(1)).unwrap();
        handle.atomic_exec(|r| {
            r.set_etag(1, "etag-1").unwrap();
            r.set_etag(2, "etag-2").unwrap();
            r.set_etag(3, "etag-3").unwrap();
        });
        let result = handle.atomic_exec(|r| r.collect_etags_for_completion());
        assert_eq!(result, Ok(vec!["etag-1".to_string(), "etag-2".to_string(), "etag-3".to_string()]));
    }
}
