//! Shared-memory process runtime.
//!
//! The launching process creates a POSIX shared memory segment and re-executes
//! the current binary once per additional rank. Every ordered pair of ranks
//! owns one message slot in the segment, so a send only has to wait until the
//! previous message on the same slot was consumed. That makes sends eager
//! (one message deep), which is what a process needs to send a block to itself
//! and then receive it.
//!
//! # Segment layout
//!
//! ```text
//! [SharedState][slot 0->0][slot 0->1]...[slot (n-1)->(n-1)]
//! slot = [MessageHeader][payload, MAX_MSG_SIZE bytes]
//! ```
//!
//! An abort flag in the shared state releases every process spinning on a
//! slot or barrier, so one fatal error tears the whole run down instead of
//! leaving peers blocked forever.

use std::mem::size_of;
use std::path::PathBuf;
use std::process::{Child, Command, Stdio};
use std::sync::atomic::{AtomicBool, AtomicI32, AtomicUsize, Ordering};

use log::{debug, info, warn};
use serde::{de::DeserializeOwned, Serialize};
use shared_memory::{Shmem, ShmemConf};

use crate::comm::{
    decode_block, decode_value, encode_block, encode_value, Topology, Transport, TAG_BARRIER_ARRIVE,
    TAG_BARRIER_COMPLETE, TAG_BLOCK, TAG_BROADCAST,
};
use crate::distribution::BlockDescriptor;
use crate::grid::{GridCoord, ProcessGrid};
use crate::{BlacsError, Result};

/// Whether a full `block` of `f64` values fits one message slot.
pub fn block_fits_slot(block: BlockDescriptor) -> bool {
    block
        .row_block
        .checked_mul(block.col_block)
        .and_then(|values| values.checked_mul(size_of::<f64>()))
        .map_or(false, |bytes| bytes <= MAX_MSG_SIZE)
}

/// Largest number of processes a segment is laid out for.
pub const MAX_PROCS: usize = 32;

/// Payload capacity of one message slot. A matrix block travels as one
/// message, so a block may hold at most `MAX_MSG_SIZE / 8` values.
pub const MAX_MSG_SIZE: usize = 1 << 20;
const HEADER_SIZE: usize = size_of::<MessageHeader>();
const SLOT_SIZE: usize = HEADER_SIZE + MAX_MSG_SIZE;
const SPAWNED_ENV: &str = "SIMPLE_BLACS_SPAWNED";
const SEGMENT_ENV: &str = "SIMPLE_BLACS_SEGMENT";

#[repr(C)]
struct MessageHeader {
    valid: AtomicBool,
    tag: AtomicI32,
    source: AtomicUsize,
    size: AtomicUsize,
}

impl MessageHeader {
    fn new() -> Self {
        Self {
            valid: AtomicBool::new(false),
            tag: AtomicI32::new(0),
            source: AtomicUsize::new(usize::MAX),
            size: AtomicUsize::new(0),
        }
    }
}

#[repr(C)]
struct SharedState {
    size: AtomicUsize,
    process_ids: [AtomicUsize; MAX_PROCS], // PID holding each rank, 0 while unclaimed
    init_flags: [AtomicBool; MAX_PROCS],
    aborted: AtomicBool,
}

/// One process's handle on the shared-memory runtime.
pub struct World {
    rank: usize,
    size: usize,
    shmem: Shmem,
    segment: PathBuf,
    // Only populated on rank 0.
    children: Vec<Child>,
}

impl World {
    /// Whether this process was spawned by [`World::init`] rather than
    /// launched by the user.
    pub fn is_spawned() -> bool {
        std::env::var_os(SPAWNED_ENV).is_some()
    }

    /// Initialize a world of `size` processes.
    ///
    /// Called by the launching process, this creates the segment, spawns
    /// `size - 1` copies of the current executable with the same arguments
    /// and becomes rank 0. Called by a spawned copy, it attaches to the
    /// existing segment and claims a free rank. Returns once every rank has
    /// attached.
    ///
    /// # Arguments
    ///
    /// * `size` - The total number of processes, between 1 and [`MAX_PROCS`]
    ///
    /// # Returns
    ///
    /// * `Ok(World)` - Once every rank has attached
    /// * `Err(BlacsError)` - If the segment cannot be created or a spawned
    ///   process exits during startup
    ///
    /// # Examples
    ///
    /// ```rust,no_run
    /// use simple_blacs::World;
    ///
    /// let world = World::init(4).unwrap();
    /// println!("Process {} of {}", world.rank(), world.size());
    /// world.finalize().unwrap();
    /// ```
    pub fn init(size: usize) -> Result<Self> {
        if size == 0 || size > MAX_PROCS {
            return Err(BlacsError::InitError(format!(
                "world size must be between 1 and {}, got {}",
                MAX_PROCS, size
            )));
        }

        if Self::is_spawned() {
            return Self::init_spawned(size);
        }

        let segment = std::env::temp_dir().join(format!("simple_blacs_{}", std::process::id()));
        let total_size = size_of::<SharedState>() + size * size * SLOT_SIZE;
        debug!("Creating shared memory of size {} at {:?}", total_size, segment);

        let shmem = ShmemConf::new()
            .size(total_size)
            .flink(&segment)
            .create()
            .map_err(|e| BlacsError::SharedMemoryError(e.to_string()))?;

        let mut world = World {
            rank: 0,
            size,
            shmem,
            segment,
            children: Vec::new(),
        };
        world.reset_segment();

        let started = world.spawn_children().and_then(|_| world.wait_for_ranks());
        if let Err(e) = started {
            world.raise_abort();
            return Err(e);
        }

        info!("World of {} processes initialized", size);
        Ok(world)
    }

    fn init_spawned(size: usize) -> Result<Self> {
        let segment = std::env::var_os(SEGMENT_ENV)
            .map(PathBuf::from)
            .ok_or_else(|| BlacsError::InitError("spawned without a shared memory segment".into()))?;

        let shmem = ShmemConf::new()
            .flink(&segment)
            .open()
            .map_err(|e| BlacsError::SharedMemoryError(e.to_string()))?;

        let mut world = World {
            rank: 0,
            size,
            shmem,
            segment,
            children: Vec::new(),
        };

        let state = world.state();
        if state.size.load(Ordering::SeqCst) != size {
            return Err(BlacsError::InitError(format!(
                "segment was created for {} processes, not {}",
                state.size.load(Ordering::SeqCst),
                size
            )));
        }

        // Claim a rank by swapping our PID into the first free process id.
        let pid = std::process::id() as usize;
        let rank = (1..size)
            .find(|&i| {
                state.process_ids[i]
                    .compare_exchange(0, pid, Ordering::SeqCst, Ordering::SeqCst)
                    .is_ok()
            })
            .ok_or_else(|| BlacsError::InitError(format!("no available ranks for process {}", pid)))?;

        state.init_flags[rank].store(true, Ordering::SeqCst);
        world.rank = rank;
        debug!("Process {} initialized as rank {}", pid, rank);

        world.wait_for_ranks()?;
        Ok(world)
    }

    fn reset_segment(&self) {
        let state = self.state();
        state.size.store(self.size, Ordering::SeqCst);
        state.aborted.store(false, Ordering::SeqCst);
        for i in 0..MAX_PROCS {
            state.process_ids[i].store(0, Ordering::SeqCst);
            state.init_flags[i].store(false, Ordering::SeqCst);
        }
        state.process_ids[0].store(std::process::id() as usize, Ordering::SeqCst);
        state.init_flags[0].store(true, Ordering::SeqCst);

        for slot in 0..self.size * self.size {
            // SAFETY: the segment was sized for size*size slots after the state.
            unsafe {
                let header = self.slot_ptr(slot) as *mut MessageHeader;
                std::ptr::write(header, MessageHeader::new());
            }
        }
    }

    fn spawn_children(&mut self) -> Result<()> {
        let exe = std::env::current_exe().map_err(|e| BlacsError::ProcessError(e.to_string()))?;
        for _ in 1..self.size {
            let child = Command::new(&exe)
                .args(std::env::args_os().skip(1))
                .env(SPAWNED_ENV, "1")
                .env(SEGMENT_ENV, &self.segment)
                .stdout(Stdio::inherit())
                .stderr(Stdio::inherit())
                .spawn()
                .map_err(|e| BlacsError::ProcessError(e.to_string()))?;
            self.children.push(child);
        }
        Ok(())
    }

    /// Spin until every rank has attached. Rank 0 also watches for children
    /// that exit before attaching.
    fn wait_for_ranks(&mut self) -> Result<()> {
        loop {
            let state = self.state();
            if (0..self.size).all(|i| state.init_flags[i].load(Ordering::SeqCst)) {
                return Ok(());
            }
            if state.aborted.load(Ordering::SeqCst) {
                return Err(BlacsError::Aborted);
            }
            for child in self.children.iter_mut() {
                if let Ok(Some(status)) = child.try_wait() {
                    return Err(BlacsError::ProcessError(format!(
                        "process {} exited during startup with {}",
                        child.id(),
                        status
                    )));
                }
            }
            std::thread::yield_now();
        }
    }

    fn state(&self) -> &SharedState {
        // SAFETY: the segment starts with a SharedState and outlives `self`;
        // every field is atomic.
        unsafe { &*(self.shmem.as_ptr() as *const SharedState) }
    }

    fn slot_ptr(&self, slot: usize) -> *mut u8 {
        let offset = size_of::<SharedState>() + slot * SLOT_SIZE;
        // SAFETY: callers pass slot < size*size, which the segment holds.
        unsafe { self.shmem.as_ptr().add(offset) }
    }

    /// Header and payload pointer of the slot carrying `src -> dst` messages.
    fn slot(&self, src: usize, dst: usize) -> (&MessageHeader, *mut u8) {
        let ptr = self.slot_ptr(src * self.size + dst);
        // SAFETY: headers were written by rank 0 before any rank attached.
        unsafe { (&*(ptr as *const MessageHeader), ptr.add(HEADER_SIZE)) }
    }

    fn spin_until(&self, ready: impl Fn() -> bool) -> Result<()> {
        let state = self.state();
        while !ready() {
            if state.aborted.load(Ordering::SeqCst) {
                return Err(BlacsError::Aborted);
            }
            std::hint::spin_loop();
            std::thread::yield_now();
        }
        Ok(())
    }

    pub fn rank(&self) -> usize {
        self.rank
    }

    pub fn size(&self) -> usize {
        self.size
    }

    fn check_rank(&self, rank: usize) -> Result<()> {
        if rank >= self.size {
            return Err(BlacsError::InvalidRank(rank));
        }
        Ok(())
    }

    /// Post `payload` to `dest`. Waits only for the slot to be free.
    pub fn send_bytes(&self, payload: &[u8], dest: usize, tag: i32) -> Result<()> {
        self.check_rank(dest)?;
        if payload.len() > MAX_MSG_SIZE {
            return Err(BlacsError::CommunicationError(format!(
                "message of {} bytes exceeds the {} byte slot",
                payload.len(),
                MAX_MSG_SIZE
            )));
        }

        debug!("Rank {} sending {} bytes to rank {} with tag {}", self.rank, payload.len(), dest, tag);

        let (header, data) = self.slot(self.rank, dest);
        self.spin_until(|| !header.valid.load(Ordering::SeqCst))?;

        // SAFETY: the slot is free, so the receiver is not reading it, and the
        // payload fits in MAX_MSG_SIZE.
        unsafe {
            std::ptr::copy_nonoverlapping(payload.as_ptr(), data, payload.len());
        }
        header.tag.store(tag, Ordering::SeqCst);
        header.source.store(self.rank, Ordering::SeqCst);
        header.size.store(payload.len(), Ordering::SeqCst);
        header.valid.store(true, Ordering::SeqCst);
        Ok(())
    }

    /// Take the next message from `source`, which must carry `tag`.
    ///
    /// A message with a different tag means the two processes disagree on the
    /// schedule; it is reported as a protocol error and left in the slot.
    pub fn recv_bytes(&self, source: usize, tag: i32) -> Result<Vec<u8>> {
        self.check_rank(source)?;
        debug!("Rank {} receiving from rank {} with tag {}", self.rank, source, tag);

        let (header, data) = self.slot(source, self.rank);
        self.spin_until(|| header.valid.load(Ordering::SeqCst))?;

        let found = header.tag.load(Ordering::SeqCst);
        if found != tag || header.source.load(Ordering::SeqCst) != source {
            return Err(BlacsError::CommunicationError(format!(
                "protocol mismatch: rank {} expected tag {} from rank {}, found tag {}",
                self.rank, tag, source, found
            )));
        }

        let size = header.size.load(Ordering::SeqCst);
        // SAFETY: the sender finished writing `size` bytes before setting valid.
        let payload = unsafe { std::slice::from_raw_parts(data as *const u8, size).to_vec() };
        header.valid.store(false, Ordering::SeqCst);
        Ok(payload)
    }

    pub fn send<T: Serialize>(&self, data: &T, dest: usize, tag: i32) -> Result<()> {
        self.send_bytes(&encode_value(data)?, dest, tag)
    }

    pub fn recv<T: DeserializeOwned>(&self, source: usize, tag: i32) -> Result<T> {
        decode_value(&self.recv_bytes(source, tag)?)
    }

    /// Broadcast `data` from `root`; every rank returns the root's value.
    ///
    /// The root posts one copy per peer slot; every rank has to take part,
    /// the ones other than `root` passing any value of the same type.
    ///
    /// # Examples
    ///
    /// ```rust,no_run
    /// use simple_blacs::World;
    ///
    /// let world = World::init(4).unwrap();
    /// let dims = if world.rank() == 0 { (4usize, 5usize) } else { (0, 0) };
    /// let dims = world.broadcast(&dims, 0).unwrap();
    /// assert_eq!(dims, (4, 5));
    /// world.finalize().unwrap();
    /// ```
    pub fn broadcast<T: Serialize + DeserializeOwned + Clone>(&self, data: &T, root: usize) -> Result<T> {
        self.check_rank(root)?;
        debug!("Rank {} entering broadcast", self.rank);

        if self.rank == root {
            let payload = encode_value(data)?;
            for rank in (0..self.size).filter(|&r| r != root) {
                self.send_bytes(&payload, rank, TAG_BROADCAST)?;
            }
            Ok(data.clone())
        } else {
            self.recv(root, TAG_BROADCAST)
        }
    }

    /// Rank 0 collects an arrival token from every rank, then releases them.
    pub fn barrier(&self) -> Result<()> {
        debug!("Rank {} entering barrier", self.rank);

        // First phase: everyone reports to rank 0, second phase: rank 0 releases.
        if self.rank == 0 {
            for rank in 1..self.size {
                self.recv::<()>(rank, TAG_BARRIER_ARRIVE)?;
            }
            for rank in 1..self.size {
                self.send(&(), rank, TAG_BARRIER_COMPLETE)?;
            }
        } else {
            self.send(&(), 0, TAG_BARRIER_ARRIVE)?;
            self.recv::<()>(0, TAG_BARRIER_COMPLETE)?;
        }

        debug!("Rank {} exiting barrier", self.rank);
        Ok(())
    }

    /// Synchronize shutdown. Rank 0 additionally reaps every spawned process
    /// and removes the segment when dropped.
    pub fn finalize(mut self) -> Result<()> {
        self.barrier()?;
        for mut child in self.children.drain(..) {
            let status = child.wait().map_err(|e| BlacsError::ProcessError(e.to_string()))?;
            if !status.success() {
                return Err(BlacsError::ProcessError(format!(
                    "process {} exited with {}",
                    child.id(),
                    status
                )));
            }
        }
        debug!("Rank {} finished", self.rank);
        Ok(())
    }

    /// Release every peer blocked in the runtime and, on rank 0, reap the
    /// spawned processes.
    fn raise_abort(&mut self) {
        self.state().aborted.store(true, Ordering::SeqCst);
        for mut child in self.children.drain(..) {
            if let Err(e) = child.kill() {
                debug!("process {} already gone: {}", child.id(), e);
            }
            let _ = child.wait();
        }
    }

    /// Abort the whole run and exit this process with `code`.
    pub fn abort(mut self, code: i32) -> ! {
        warn!("Rank {} aborting the run", self.rank);
        self.raise_abort();
        // Exit skips destructors, so drop the segment first to unlink it on rank 0.
        drop(self);
        std::process::exit(code)
    }
}

/// A [`World`] whose ranks are laid onto a [`ProcessGrid`].
///
/// Every block sent through [`Transport::send`] must fit one slot:
/// `rows * cols * 8 <= MAX_MSG_SIZE`. Larger blocks fail with a
/// communication error; [`block_fits_slot`] checks a block size up front.
pub struct GridWorld {
    world: World,
    grid: ProcessGrid,
    coord: GridCoord,
}

impl GridWorld {
    /// Initialize one process per grid coordinate.
    pub fn init(grid: ProcessGrid) -> Result<Self> {
        let world = World::init(grid.size())?;
        let coord = match grid.coordinate_of(world.rank()) {
            Ok(coord) => coord,
            Err(e) => {
                let mut world = world;
                world.raise_abort();
                return Err(e);
            }
        };
        Ok(Self { world, grid, coord })
    }

    pub fn world(&self) -> &World {
        &self.world
    }

    pub fn finalize(self) -> Result<()> {
        self.world.finalize()
    }

    pub fn abort(self, code: i32) -> ! {
        self.world.abort(code)
    }
}

impl Topology for GridWorld {
    fn grid(&self) -> &ProcessGrid {
        &self.grid
    }

    fn coordinate(&self) -> GridCoord {
        self.coord
    }

    fn rank(&self) -> usize {
        self.world.rank()
    }

    fn barrier(&self) -> Result<()> {
        self.world.barrier()
    }
}

impl Transport for GridWorld {
    fn send(&self, buffer: &[f64], rows: usize, cols: usize, stride: usize, dest: GridCoord) -> Result<()> {
        let dest = self.grid.rank_of(dest)?;
        self.world.send_bytes(&encode_block(buffer, rows, cols, stride)?, dest, TAG_BLOCK)
    }

    fn receive(
        &self,
        buffer: &mut [f64],
        rows: usize,
        cols: usize,
        stride: usize,
        source: GridCoord,
    ) -> Result<()> {
        let source = self.grid.rank_of(source)?;
        let payload = self.world.recv_bytes(source, TAG_BLOCK)?;
        decode_block(&payload, buffer, rows, cols, stride)
    }

    fn broadcast<T>(&self, value: &T, root: GridCoord) -> Result<T>
    where
        T: Serialize + DeserializeOwned + Clone,
    {
        let root = self.grid.rank_of(root)?;
        self.world.broadcast(value, root)
    }
}
