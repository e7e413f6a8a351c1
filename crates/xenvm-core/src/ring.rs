//! Crash-safe shared-block ring queues.
//!
//! A ring is a bounded single-producer/single-consumer queue of framed
//! items stored in a logical volume. Producer and consumer normally live
//! in different processes (the daemon and a per-host local allocator) and
//! share nothing but the backing device, so every position that matters is
//! persisted in the ring header and only published by an explicit
//! `advance`.
//!
//! ## Layout
//!
//! ```text
//! byte 0:    magic(4) | version(4) | suspended(4) | pad(4)
//!            | producer(8) | consumer(8) | data_size(8)
//! byte 4096: circular data area of data_size bytes (power of two)
//! ```
//!
//! Stream positions are absolute, monotonically increasing u64s; byte `p`
//! of the stream lives at `DATA_OFFSET + p % data_size` and frames wrap
//! freely around the end of the data area. Each frame is a little-endian
//! `len: u32` followed by `len` bytes of bincode payload.
//!
//! ## Durability
//!
//! `push` stages a frame without touching the header; the item becomes
//! visible (and crash-durable) only when `advance` publishes the producer
//! position, data first, header second. The consumer mirrors this with its
//! own position. An item therefore survives an unclean shutdown iff the
//! corresponding `advance` completed.

use std::marker::PhantomData;
use std::sync::Arc;
use std::time::Duration;

use serde::de::DeserializeOwned;
use serde::Serialize;
use tokio::time::sleep;
use tracing::debug;
use xenvm_proto::{XvError, XvResult};

use crate::dev::BlockDev;

const RING_MAGIC: u32 = 0x5845_4e51; // "XENQ"
const RING_VERSION: u32 = 1;

const OFF_MAGIC: u64 = 0;
const OFF_VERSION: u64 = 4;
const OFF_SUSPENDED: u64 = 8;
const OFF_PRODUCER: u64 = 16;
const OFF_CONSUMER: u64 = 24;
const OFF_DATA_SIZE: u64 = 32;

/// Start of the circular data area; the header owns the first page.
pub const DATA_OFFSET: u64 = 4096;

/// Fixed back-off for transient ring conditions and state waits.
pub const RING_RETRY_INTERVAL: Duration = Duration::from_secs(5);

/// A durable stream position, as returned by `push` and `fold`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub struct Position(pub u64);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RingState {
    Running,
    Suspended,
}

fn largest_power_of_two(n: u64) -> u64 {
    if n == 0 {
        0
    } else {
        1u64 << (63 - n.leading_zeros())
    }
}

/// Shared header/data access for both endpoint handles.
struct RingIo {
    dev: Arc<dyn BlockDev>,
    data_size: u64,
}

impl RingIo {
    fn read_u32(&self, off: u64) -> XvResult<u32> {
        let mut buf = [0u8; 4];
        self.dev.read_at(off, &mut buf)?;
        Ok(u32::from_le_bytes(buf))
    }

    fn read_u64(&self, off: u64) -> XvResult<u64> {
        let mut buf = [0u8; 8];
        self.dev.read_at(off, &mut buf)?;
        Ok(u64::from_le_bytes(buf))
    }

    fn producer(&self) -> XvResult<u64> {
        self.read_u64(OFF_PRODUCER)
    }

    fn set_producer(&self, v: u64) -> XvResult<()> {
        self.dev.write_at(OFF_PRODUCER, &v.to_le_bytes())
    }

    fn consumer(&self) -> XvResult<u64> {
        self.read_u64(OFF_CONSUMER)
    }

    fn set_consumer(&self, v: u64) -> XvResult<()> {
        self.dev.write_at(OFF_CONSUMER, &v.to_le_bytes())
    }

    fn state(&self) -> XvResult<RingState> {
        Ok(match self.read_u32(OFF_SUSPENDED)? {
            0 => RingState::Running,
            _ => RingState::Suspended,
        })
    }

    fn set_state(&self, state: RingState) -> XvResult<()> {
        let v: u32 = match state {
            RingState::Running => 0,
            RingState::Suspended => 1,
        };
        self.dev.write_at(OFF_SUSPENDED, &v.to_le_bytes())
    }

    /// Write stream bytes starting at absolute position `pos`, wrapping
    /// around the end of the data area.
    fn data_write(&self, pos: u64, bytes: &[u8]) -> XvResult<()> {
        let off = pos % self.data_size;
        let first = ((self.data_size - off) as usize).min(bytes.len());
        self.dev.write_at(DATA_OFFSET + off, &bytes[..first])?;
        if first < bytes.len() {
            self.dev.write_at(DATA_OFFSET, &bytes[first..])?;
        }
        Ok(())
    }

    fn data_read(&self, pos: u64, buf: &mut [u8]) -> XvResult<()> {
        let off = pos % self.data_size;
        let first = ((self.data_size - off) as usize).min(buf.len());
        self.dev.read_at(DATA_OFFSET + off, &mut buf[..first])?;
        if first < buf.len() {
            self.dev.read_at(DATA_OFFSET, &mut buf[first..])?;
        }
        Ok(())
    }
}

/// Whether `dev` holds an initialised ring header.
pub fn initialized(dev: &dyn BlockDev) -> XvResult<bool> {
    if dev.len() < DATA_OFFSET {
        return Ok(false);
    }
    let mut buf = [0u8; 4];
    dev.read_at(OFF_MAGIC, &mut buf)?;
    Ok(u32::from_le_bytes(buf) == RING_MAGIC)
}

/// Initialise an empty ring on `dev`: zero positions, `Running` state,
/// data area sized to the largest power of two that fits.
pub fn create(dev: &dyn BlockDev) -> XvResult<()> {
    if dev.len() < 2 * DATA_OFFSET {
        return Err(XvError::Msg(format!(
            "device of {} bytes is too small to hold a ring",
            dev.len()
        )));
    }
    let data_size = largest_power_of_two(dev.len() - DATA_OFFSET);
    dev.write_at(OFF_MAGIC, &RING_MAGIC.to_le_bytes())?;
    dev.write_at(OFF_VERSION, &RING_VERSION.to_le_bytes())?;
    dev.write_at(OFF_SUSPENDED, &0u32.to_le_bytes())?;
    dev.write_at(12, &0u32.to_le_bytes())?;
    dev.write_at(OFF_PRODUCER, &0u64.to_le_bytes())?;
    dev.write_at(OFF_CONSUMER, &0u64.to_le_bytes())?;
    dev.write_at(OFF_DATA_SIZE, &data_size.to_le_bytes())?;
    dev.flush()
}

fn attach_io(dev: Arc<dyn BlockDev>, name: &str) -> XvResult<RingIo> {
    let probe = RingIo {
        dev: dev.clone(),
        data_size: 0,
    };
    let magic = probe.read_u32(OFF_MAGIC)?;
    if magic != RING_MAGIC {
        return Err(XvError::Msg(format!(
            "ring {name}: bad magic {magic:#010x}"
        )));
    }
    let version = probe.read_u32(OFF_VERSION)?;
    if version != RING_VERSION {
        return Err(XvError::Msg(format!(
            "ring {name}: unsupported version {version}"
        )));
    }
    let data_size = probe.read_u64(OFF_DATA_SIZE)?;
    if data_size == 0 || !data_size.is_power_of_two() || DATA_OFFSET + data_size > dev.len() {
        return Err(XvError::Msg(format!(
            "ring {name}: corrupt data size {data_size}"
        )));
    }
    Ok(RingIo { dev, data_size })
}

/// The producing endpoint of a ring.
pub struct Producer<T> {
    io: RingIo,
    name: String,
    /// Next unpublished stream position; starts at the durable producer
    /// position on attach.
    staged: u64,
    _marker: PhantomData<fn(T)>,
}

impl<T: Serialize + DeserializeOwned> Producer<T> {
    /// Open an existing ring, also reporting the state observed at attach
    /// time.
    pub fn attach(dev: Arc<dyn BlockDev>, name: &str) -> XvResult<(Self, RingState)> {
        let io = attach_io(dev, name)?;
        let staged = io.producer()?;
        let state = io.state()?;
        Ok((
            Self {
                io,
                name: name.to_string(),
                staged,
                _marker: PhantomData,
            },
            state,
        ))
    }

    pub fn state(&self) -> XvResult<RingState> {
        self.io.state()
    }

    /// Stage `item` at the head of the ring.
    ///
    /// The item is invisible to the consumer until `advance`. Returns
    /// `Suspended` while the ring is suspended and `Retry` when the frame
    /// does not currently fit.
    pub fn push(&mut self, item: &T) -> XvResult<Position> {
        if self.io.state()? == RingState::Suspended {
            return Err(XvError::Suspended);
        }
        let payload = bincode::serialize(item)
            .map_err(|e| XvError::Msg(format!("ring {}: encode item: {e}", self.name)))?;
        let frame_len = 4 + payload.len() as u64;
        if frame_len > self.io.data_size {
            return Err(XvError::Msg(format!(
                "ring {}: item of {} bytes can never fit",
                self.name,
                payload.len()
            )));
        }
        let consumer = self.io.consumer()?;
        if self.staged - consumer + frame_len > self.io.data_size {
            return Err(XvError::Retry);
        }
        let mut frame = Vec::with_capacity(frame_len as usize);
        frame.extend_from_slice(&(payload.len() as u32).to_le_bytes());
        frame.extend_from_slice(&payload);
        self.io.data_write(self.staged, &frame)?;
        self.staged += frame_len;
        Ok(Position(self.staged))
    }

    /// Durably publish every push up to `pos`: frame bytes reach the
    /// device before the header does.
    pub fn advance(&mut self, pos: Position) -> XvResult<()> {
        self.io.dev.flush()?;
        self.io.set_producer(pos.0)?;
        self.io.dev.flush()
    }
}

/// The consuming endpoint of a ring.
pub struct Consumer<T> {
    io: RingIo,
    name: String,
    retry: Duration,
    _marker: PhantomData<fn() -> T>,
}

impl<T: Serialize + DeserializeOwned> Consumer<T> {
    pub fn attach(dev: Arc<dyn BlockDev>, name: &str) -> XvResult<Self> {
        let io = attach_io(dev, name)?;
        Ok(Self {
            io,
            name: name.to_string(),
            retry: RING_RETRY_INTERVAL,
            _marker: PhantomData,
        })
    }

    /// Override the fixed back-off used while waiting for a state
    /// transition to be observed.
    pub fn with_retry_interval(mut self, retry: Duration) -> Self {
        self.retry = retry;
        self
    }

    pub fn state(&self) -> XvResult<RingState> {
        self.io.state()
    }

    /// Decode every published item without consuming it.
    ///
    /// Returns the position one past the last item read; passing that to
    /// `advance` consumes everything the fold saw.
    pub fn fold<A>(&self, init: A, mut f: impl FnMut(A, T) -> A) -> XvResult<(Position, A)> {
        let producer = self.io.producer()?;
        let mut pos = self.io.consumer()?;
        let mut acc = init;
        while pos < producer {
            let mut len_buf = [0u8; 4];
            self.io.data_read(pos, &mut len_buf)?;
            let len = u32::from_le_bytes(len_buf) as u64;
            if len == 0 || pos + 4 + len > producer {
                return Err(XvError::Msg(format!(
                    "ring {}: corrupt frame at position {pos}",
                    self.name
                )));
            }
            let mut payload = vec![0u8; len as usize];
            self.io.data_read(pos + 4, &mut payload)?;
            let item: T = bincode::deserialize(&payload)
                .map_err(|e| XvError::Msg(format!("ring {}: decode item: {e}", self.name)))?;
            acc = f(acc, item);
            pos += 4 + len;
        }
        Ok((Position(pos), acc))
    }

    /// Durably record that items up to `pos` have been consumed.
    pub fn advance(&mut self, pos: Position) -> XvResult<()> {
        self.io.set_consumer(pos.0)?;
        self.io.dev.flush()
    }

    /// Suspend the ring: once observed, `push` fails with `Suspended`.
    ///
    /// Blocks until the suspended state is durably observed, polling with
    /// the fixed back-off. Already suspended counts as success.
    pub async fn suspend(&mut self) -> XvResult<()> {
        self.transition(RingState::Suspended).await
    }

    /// Resume a suspended ring. Already running counts as success.
    pub async fn resume(&mut self) -> XvResult<()> {
        self.transition(RingState::Running).await
    }

    async fn transition(&mut self, want: RingState) -> XvResult<()> {
        if self.io.state()? == want {
            return Ok(());
        }
        self.io.set_state(want)?;
        self.io.dev.flush()?;
        loop {
            if self.io.state()? == want {
                return Ok(());
            }
            // a concurrent transition is still in flight; poll
            debug!("ring {}: waiting to observe {:?}", self.name, want);
            sleep(self.retry).await;
        }
    }
}
