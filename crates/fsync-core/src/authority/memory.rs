//! An in-process authority that owns the backing file.
//!
//! Handles are issued as `4, 8, 12, …` and slots as `0, 1, 2, …`, one per
//! created object. Named objects are deduplicated by exact name.

use std::collections::HashMap;
use std::fs::{File, OpenOptions};
use std::os::unix::fs::FileExt;
use std::path::PathBuf;

use fsync_error::{Result, ServerStatus};
use fsync_shm::pool::system_page_size;
use fsync_types::limits::STATE_BLOCK_SIZE;
use fsync_types::{Handle, ObjectType, SlotIndex, index_to_handle};
use parking_lot::Mutex;
use tracing::{debug, trace};

use super::Authority;
use super::protocol::{CreateRequest, Reply};
use crate::config::FsyncConfig;

#[derive(Debug, Clone, Copy)]
struct Entry {
    handle: Handle,
    slot: SlotIndex,
    kind: ObjectType,
}

impl Entry {
    fn reply(self, status: ServerStatus) -> Reply {
        Reply {
            status,
            handle: Some(self.handle),
            slot: self.slot,
            object_type: self.kind.to_raw(),
        }
    }
}

#[derive(Debug)]
struct Registry {
    file: File,
    path: PathBuf,
    page_size: u64,
    first_index: u32,
    objects: Vec<Entry>,
    by_handle: HashMap<Handle, usize>,
    by_name: HashMap<String, usize>,
}

#[derive(Debug)]
pub struct MemoryAuthority {
    registry: Option<Mutex<Registry>>,
}

impl MemoryAuthority {
    /// Create (or truncate) the backing file named by `config` and serve
    /// objects from it.
    pub fn create(config: &FsyncConfig) -> Result<Self> {
        Self::create_starting_at(config, 0)
    }

    /// As [`create`](Self::create), issuing handle indices from
    /// `first_index` instead of 0.
    pub fn create_starting_at(config: &FsyncConfig, first_index: u32) -> Result<Self> {
        let path = config.backing_path()?;
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(true)
            .open(&path)?;
        let page_size = system_page_size()? as u64;
        file.set_len(page_size)?;
        debug!(
            target: "fsync_core::authority",
            path = %path.display(),
            "created fsync backing file"
        );
        Ok(Self {
            registry: Some(Mutex::new(Registry {
                file,
                path,
                page_size,
                first_index,
                objects: Vec::new(),
                by_handle: HashMap::new(),
                by_name: HashMap::new(),
            })),
        })
    }

    /// An authority running without fsync: every request is answered with
    /// `NotImplemented`.
    #[must_use]
    pub const fn unsupported() -> Self {
        Self { registry: None }
    }

    #[must_use]
    pub fn backing_path(&self) -> Option<PathBuf> {
        self.registry.as_ref().map(|r| r.lock().path.clone())
    }

    /// Number of distinct objects created so far.
    #[must_use]
    pub fn object_count(&self) -> usize {
        self.registry.as_ref().map_or(0, |r| r.lock().objects.len())
    }
}

impl Registry {
    fn create(&mut self, request: &CreateRequest) -> Result<Reply> {
        let Some(kind) = ObjectType::from_raw(request.object_type) else {
            return Ok(Reply::bare(ServerStatus::InvalidParameter));
        };
        if kind == ObjectType::Semaphore {
            let (initial, max) = (request.low, request.high);
            if max <= 0 || initial < 0 || initial > max {
                return Ok(Reply::bare(ServerStatus::InvalidParameter));
            }
        }

        let name = request
            .attributes
            .as_ref()
            .and_then(|a| a.name.clone())
            .filter(|n| !n.is_empty());
        if let Some(existing) = name.as_ref().and_then(|n| self.by_name.get(n)) {
            let entry = self.objects[*existing];
            if entry.kind != kind {
                return Ok(Reply::bare(ServerStatus::ObjectTypeMismatch));
            }
            trace!(
                target: "fsync_core::authority",
                name = name.as_deref().unwrap_or_default(),
                handle = %entry.handle,
                "opened existing object"
            );
            return Ok(entry.reply(ServerStatus::ObjectNameExists));
        }

        let position = self.objects.len();
        let issued = u32::try_from(position).ok().and_then(|p| {
            let handle = p.checked_add(self.first_index).and_then(index_to_handle)?;
            Some((SlotIndex::new(p), handle))
        });
        let Some((slot, handle)) = issued else {
            return Ok(Reply::bare(ServerStatus::NoMemory));
        };

        self.initialize_slot(slot, request)?;
        let entry = Entry { handle, slot, kind };
        self.objects.push(entry);
        self.by_handle.insert(handle, position);
        if let Some(name) = name {
            self.by_name.insert(name, position);
        }
        trace!(
            target: "fsync_core::authority",
            %handle,
            %slot,
            %kind,
            "created object"
        );
        Ok(entry.reply(ServerStatus::Success))
    }

    /// Grow the file to cover `slot`'s page and write the initial state.
    fn initialize_slot(&mut self, slot: SlotIndex, request: &CreateRequest) -> Result<()> {
        let offset = slot.byte_offset();
        let end = offset + STATE_BLOCK_SIZE as u64;
        let needed = end.div_ceil(self.page_size) * self.page_size;
        if self.file.metadata()?.len() < needed {
            self.file.set_len(needed)?;
        }
        let mut block = [0_u8; STATE_BLOCK_SIZE];
        block[..4].copy_from_slice(&request.low.to_ne_bytes());
        block[4..].copy_from_slice(&request.high.to_ne_bytes());
        self.file.write_all_at(&block, offset)?;
        Ok(())
    }

    fn query(&self, handle: Handle) -> Reply {
        self.by_handle.get(&handle).map_or_else(
            || Reply::bare(ServerStatus::InvalidHandle),
            |&position| self.objects[position].reply(ServerStatus::Success),
        )
    }
}

impl Authority for MemoryAuthority {
    fn create_fsync(&self, request: &CreateRequest) -> Result<Reply> {
        match &self.registry {
            Some(registry) => registry.lock().create(request),
            None => Ok(Reply::bare(ServerStatus::NotImplemented)),
        }
    }

    fn query_object(&self, handle: Handle) -> Result<Reply> {
        Ok(match &self.registry {
            Some(registry) => registry.lock().query(handle),
            None => Reply::bare(ServerStatus::NotImplemented),
        })
    }
}
