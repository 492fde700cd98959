// SPDX-License-Identifier: Apache-2.0 or BSD-3-Clause
//! Single purpose writer thread for output streams.
//!
//! This is the narrow variant of [`crate::controller`]: the thread is either
//! running or stopped, there is no pause. It loops on an externally owned stop
//! flag, waits for [`NOT_EMPTY`] on an [`EventFlag`], executes exactly one
//! [`WriteCommand`] against the [`OutputDriver`], posts a [`WriteStatus`] and
//! wakes [`NOT_FULL`]. The loop never returns to a generic thread abstraction
//! and only touches atomics and lock-free queues, so a real-time writer can not
//! be held up by a lock owned by a lower priority thread.

use std::{
    fmt, io,
    sync::{
        atomic::{AtomicBool, Ordering},
        mpsc::sync_channel,
        Arc,
    },
    thread::{self, JoinHandle},
    time::{Duration, Instant},
};

use log::{error, trace, warn};
use nix::unistd::{self, Pid};
use ringbuf::{
    traits::{Consumer as _, Observer as _, Producer as _, Split as _},
    HeapCons, HeapProd, HeapRb,
};
use thiserror::Error as ThisError;

use crate::{
    event_flag::{self, EventFlag, NOT_EMPTY, NOT_FULL},
    thread_setup::{self, PRIORITY_URGENT_AUDIO},
};

/// Largest data queue a client may ask for.
pub const MAX_BUFFER_SIZE: u32 = 1 << 30;
const WRITER_THREAD_NAME: &str = "writer";
/// The writer re-checks its stop flag at least this often.
const WAIT_TIMEOUT: Duration = Duration::from_secs(1);

#[derive(Debug, ThisError)]
pub enum Error {
    #[error("The client attempts to prepare for writing twice")]
    AlreadyPrepared,
    #[error("Null frame size ({0}) or frames count ({1})")]
    NullBufferGeometry(u32, u32),
    #[error("Buffer too big: {0}*{1} bytes > MAX_BUFFER_SIZE ({MAX_BUFFER_SIZE})")]
    BufferTooBig(u32, u32),
    #[error("Failed to start writer thread: {0}")]
    SpawnFailed(io::Error),
    #[error("Writer thread exited before reporting its tid")]
    NoThreadInfo,
    #[error("Command queue is full, {0:?} was not posted")]
    CommandQueueFull(WriteCommand),
    #[error("{0}")]
    EventFlag(event_flag::Error),
}

impl From<event_flag::Error> for Error {
    fn from(val: event_flag::Error) -> Self {
        Self::EventFlag(val)
    }
}

impl Error {
    /// Status code reported to the client for this error.
    pub const fn result(&self) -> WriteResult {
        match self {
            Self::AlreadyPrepared | Self::CommandQueueFull(_) | Self::EventFlag(_) => {
                WriteResult::InvalidState
            }
            _ => WriteResult::InvalidArguments,
        }
    }
}

pub type Result<T> = std::result::Result<T, Error>;

/// Status codes of a command, following the HAL result codes.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum WriteResult {
    Ok,
    NotInitialized,
    InvalidArguments,
    InvalidState,
    NotSupported,
}

impl WriteResult {
    /// Map a driver error the way the HAL status analysis does.
    pub fn from_driver_error(function: &str, err: &io::Error) -> Self {
        let result = match err.raw_os_error() {
            Some(libc::EINVAL) => Self::InvalidArguments,
            Some(libc::ENODEV) => Self::NotInitialized,
            Some(libc::ENOSYS) => Self::NotSupported,
            _ if err.kind() == io::ErrorKind::Unsupported => Self::NotSupported,
            _ => Self::InvalidState,
        };
        if result != Self::NotSupported {
            warn!("Error from output driver in function {}: {}", function, err);
        }
        result
    }
}

#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum WriteCommand {
    Write,
    GetPresentationPosition,
    GetLatency,
}

#[derive(Debug, Default, Copy, Clone, PartialEq, Eq)]
pub struct PresentationPosition {
    /// Frames presented to the listener since the stream started.
    pub frames: u64,
    /// Monotonic time at which `frames` was sampled.
    pub timestamp: Duration,
}

#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum WriteReply {
    Written(u64),
    PresentationPosition(PresentationPosition),
    LatencyMs(u32),
}

#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub struct WriteStatus {
    pub retval: WriteResult,
    pub reply_to: WriteCommand,
    pub reply: WriteReply,
}

/// The audio driver behind an output stream.
pub trait OutputDriver: Send + 'static {
    fn write(&mut self, buffer: &[u8]) -> io::Result<usize>;

    fn presentation_position(&mut self) -> io::Result<PresentationPosition>;

    fn latency_ms(&self) -> u32;
}

/// Process and kernel thread id of the writer.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub struct ThreadInfo {
    pub pid: Pid,
    pub tid: Pid,
}

struct WriteThread<D> {
    stop: Arc<AtomicBool>,
    driver: D,
    commands: HeapCons<WriteCommand>,
    data: HeapCons<u8>,
    statuses: HeapProd<WriteStatus>,
    event_flag: Arc<EventFlag>,
    buffer: Box<[u8]>,
}

impl<D: OutputDriver> WriteThread<D> {
    fn run(mut self) -> D {
        while !self.stop.load(Ordering::Acquire) {
            match self.event_flag.wait(NOT_EMPTY, WAIT_TIMEOUT) {
                Ok(0) => continue,
                Ok(_) => {}
                Err(err) => {
                    error!("{}", err);
                    continue;
                }
            }
            let Some(command) = self.commands.try_pop() else {
                continue;
            };
            let status = match command {
                WriteCommand::Write => self.do_write(),
                WriteCommand::GetPresentationPosition => self.do_get_presentation_position(),
                WriteCommand::GetLatency => self.do_get_latency(),
            };
            if self.statuses.try_push(status).is_err() {
                error!("status message queue write failed");
            }
            if let Err(err) = self.event_flag.wake(NOT_FULL) {
                error!("{}", err);
            }
        }
        trace!("writer thread stopped");
        self.driver
    }

    fn do_write(&mut self) -> WriteStatus {
        let available = self.data.occupied_len().min(self.buffer.len());
        let read = self.data.pop_slice(&mut self.buffer[..available]);
        let (retval, written) = if read == 0 {
            (WriteResult::Ok, 0)
        } else {
            match self.driver.write(&self.buffer[..read]) {
                Ok(written) => (WriteResult::Ok, written as u64),
                Err(err) => (WriteResult::from_driver_error("write", &err), 0),
            }
        };
        WriteStatus {
            retval,
            reply_to: WriteCommand::Write,
            reply: WriteReply::Written(written),
        }
    }

    fn do_get_presentation_position(&mut self) -> WriteStatus {
        let (retval, position) = match self.driver.presentation_position() {
            Ok(position) => (WriteResult::Ok, position),
            Err(err) => (
                WriteResult::from_driver_error("get_presentation_position", &err),
                PresentationPosition::default(),
            ),
        };
        WriteStatus {
            retval,
            reply_to: WriteCommand::GetPresentationPosition,
            reply: WriteReply::PresentationPosition(position),
        }
    }

    fn do_get_latency(&mut self) -> WriteStatus {
        WriteStatus {
            retval: WriteResult::Ok,
            reply_to: WriteCommand::GetLatency,
            reply: WriteReply::LatencyMs(self.driver.latency_ms()),
        }
    }
}

/// Client side of a prepared output stream.
pub struct WriteClient {
    pub commands: HeapProd<WriteCommand>,
    pub data: HeapProd<u8>,
    pub statuses: HeapCons<WriteStatus>,
    pub event_flag: Arc<EventFlag>,
    pub thread_info: ThreadInfo,
    /// Command posted but not answered yet.
    pending: Option<WriteCommand>,
}

impl fmt::Debug for WriteClient {
    fn fmt(&self, fmt: &mut fmt::Formatter) -> fmt::Result {
        fmt.debug_struct(stringify!(WriteClient))
            .field("data_capacity", &self.data.capacity())
            .field("thread_info", &self.thread_info)
            .field("pending", &self.pending)
            .finish_non_exhaustive()
    }
}

impl WriteClient {
    /// Queue as much of `buffer` as fits and post a write command. Returns the
    /// number of bytes queued.
    ///
    /// Nothing is queued while the previous command is not answered.
    pub fn write(&mut self, buffer: &[u8]) -> Result<usize> {
        if self.pending.is_some() || self.commands.is_full() {
            return Err(Error::CommandQueueFull(WriteCommand::Write));
        }
        let queued = self.data.push_slice(buffer);
        self.send(WriteCommand::Write)?;
        Ok(queued)
    }

    /// Post `command` and wake the writer.
    ///
    /// One command is in flight at a time: until [`wait_status`] returned the
    /// reply to the previous command this fails with
    /// [`Error::CommandQueueFull`] and the writer is not woken.
    ///
    /// [`wait_status`]: Self::wait_status
    pub fn send(&mut self, command: WriteCommand) -> Result<()> {
        if let Some(pending) = self.pending {
            warn!("{:?} is not answered yet, rejecting {:?}", pending, command);
            return Err(Error::CommandQueueFull(command));
        }
        if self.commands.try_push(command).is_err() {
            warn!("command message queue is full, rejecting {:?}", command);
            return Err(Error::CommandQueueFull(command));
        }
        self.pending = Some(command);
        Ok(self.event_flag.wake(NOT_EMPTY)?)
    }

    /// Wait up to `timeout` for the writer to post a status. A timeout leaves
    /// the command in flight, a later call still collects its reply.
    pub fn wait_status(&mut self, timeout: Duration) -> Result<Option<WriteStatus>> {
        // No deadline if it can not be represented.
        let deadline = Instant::now().checked_add(timeout);
        loop {
            if let Some(status) = self.statuses.try_pop() {
                self.pending = None;
                return Ok(Some(status));
            }
            let remaining = match deadline {
                Some(deadline) => deadline.saturating_duration_since(Instant::now()),
                None => timeout,
            };
            if remaining.is_zero() {
                return Ok(None);
            }
            self.event_flag.wait(NOT_FULL, remaining)?;
        }
    }
}

/// An output stream whose data is written by a dedicated [`WriteThread`].
pub struct StreamOut<D: OutputDriver> {
    driver: Option<D>,
    stop_write_thread: Arc<AtomicBool>,
    event_flag: Option<Arc<EventFlag>>,
    write_thread: Option<JoinHandle<D>>,
}

impl<D: OutputDriver> fmt::Debug for StreamOut<D> {
    fn fmt(&self, fmt: &mut fmt::Formatter) -> fmt::Result {
        fmt.debug_struct(stringify!(StreamOut))
            .field("prepared", &self.event_flag.is_some())
            .field("writing", &self.write_thread.is_some())
            .finish_non_exhaustive()
    }
}

impl<D: OutputDriver> StreamOut<D> {
    pub fn new(driver: D) -> Self {
        Self {
            driver: Some(driver),
            stop_write_thread: Arc::new(AtomicBool::new(false)),
            event_flag: None,
            write_thread: None,
        }
    }

    /// Allocate the message queues and launch the writer thread.
    ///
    /// The data queue holds `frame_size * frames_count` bytes; the command and
    /// status queues hold one message each.
    pub fn prepare_for_writing(&mut self, frame_size: u32, frames_count: u32) -> Result<WriteClient> {
        if self.event_flag.is_some() {
            error!("the client attempts to call prepare_for_writing twice");
            return Err(Error::AlreadyPrepared);
        }
        if frame_size == 0 || frames_count == 0 {
            error!(
                "Null frame_size ({}) or frames_count ({})",
                frame_size, frames_count
            );
            return Err(Error::NullBufferGeometry(frame_size, frames_count));
        }
        if frame_size > MAX_BUFFER_SIZE / frames_count {
            error!(
                "Buffer too big: {}*{} bytes > MAX_BUFFER_SIZE ({})",
                frame_size, frames_count, MAX_BUFFER_SIZE
            );
            return Err(Error::BufferTooBig(frame_size, frames_count));
        }
        let Some(driver) = self.driver.take() else {
            return Err(Error::AlreadyPrepared);
        };

        let data_size = (frame_size * frames_count) as usize;
        let (command_producer, command_consumer) = HeapRb::<WriteCommand>::new(1).split();
        let (data_producer, data_consumer) = HeapRb::<u8>::new(data_size).split();
        let (status_producer, status_consumer) = HeapRb::<WriteStatus>::new(1).split();
        let event_flag = Arc::new(EventFlag::new());

        self.stop_write_thread.store(false, Ordering::Release);
        let writer = WriteThread {
            stop: self.stop_write_thread.clone(),
            driver,
            commands: command_consumer,
            data: data_consumer,
            statuses: status_producer,
            event_flag: event_flag.clone(),
            buffer: vec![0; data_size].into_boxed_slice(),
        };
        let (tid_sender, tid_receiver) = sync_channel(1);
        let handle = thread::Builder::new()
            .name(WRITER_THREAD_NAME.to_string())
            .spawn(move || {
                if let Err(err) = thread_setup::set_current_thread_priority(PRIORITY_URGENT_AUDIO)
                {
                    warn!("{}", err);
                }
                // The receiver only goes away if prepare_for_writing gave up.
                let _ = tid_sender.send(thread_setup::current_thread_id());
                writer.run()
            })
            .map_err(|err| {
                warn!("failed to start writer thread: {}", err);
                Error::SpawnFailed(err)
            })?;
        let Ok(tid) = tid_receiver.recv() else {
            error!("writer thread exited before reporting its tid");
            if let Ok(driver) = handle.join() {
                self.driver = Some(driver);
            }
            return Err(Error::NoThreadInfo);
        };

        self.event_flag = Some(event_flag.clone());
        self.write_thread = Some(handle);
        Ok(WriteClient {
            commands: command_producer,
            data: data_producer,
            statuses: status_consumer,
            event_flag,
            thread_info: ThreadInfo {
                pid: unistd::getpid(),
                tid,
            },
            pending: None,
        })
    }

    pub fn is_writing(&self) -> bool {
        self.write_thread.is_some()
    }

    /// Stop and join the writer thread, if any, and hand back the driver.
    /// Returns `None` if the driver was already handed back by an earlier
    /// `close()` or the writer panicked.
    pub fn close(&mut self) -> Option<D> {
        self.stop_write_thread.store(true, Ordering::Release);
        if let Some(event_flag) = &self.event_flag {
            if let Err(err) = event_flag.wake(NOT_EMPTY) {
                error!("{}", err);
            }
        }
        if let Some(handle) = self.write_thread.take() {
            match handle.join() {
                Ok(driver) => self.driver = Some(driver),
                Err(_) => error!("writer thread panicked"),
            }
        }
        self.driver.take()
    }
}

impl<D: OutputDriver> Drop for StreamOut<D> {
    fn drop(&mut self) {
        if self.write_thread.is_some() {
            self.close();
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Mutex;

    use assert_matches::assert_matches;
    use ringbuf::traits::Observer as _;
    use rstest::*;

    use super::*;
    use crate::{init_logger, test_utils::TIMEOUT};

    #[derive(Default)]
    struct RecordingDriver {
        written: Arc<Mutex<Vec<u8>>>,
        fail_with: Option<i32>,
    }

    impl OutputDriver for RecordingDriver {
        fn write(&mut self, buffer: &[u8]) -> io::Result<usize> {
            if let Some(errno) = self.fail_with {
                return Err(io::Error::from_raw_os_error(errno));
            }
            self.written.lock().unwrap().extend_from_slice(buffer);
            Ok(buffer.len())
        }

        fn presentation_position(&mut self) -> io::Result<PresentationPosition> {
            if self.fail_with.is_some() {
                return Err(io::Error::from_raw_os_error(libc::ENOSYS));
            }
            Ok(PresentationPosition {
                frames: self.written.lock().unwrap().len() as u64 / 4,
                timestamp: Duration::from_millis(7),
            })
        }

        fn latency_ms(&self) -> u32 {
            25
        }
    }

    #[rstest]
    #[case::null_frame_size(0, 16)]
    #[case::null_frames_count(4, 0)]
    #[case::too_big(1 << 16, 1 << 15)]
    fn test_prepare_invalid_arguments(#[case] frame_size: u32, #[case] frames_count: u32) {
        init_logger();
        let mut stream = StreamOut::new(RecordingDriver::default());
        let err = stream
            .prepare_for_writing(frame_size, frames_count)
            .unwrap_err();
        assert_eq!(err.result(), WriteResult::InvalidArguments);
        assert!(!stream.is_writing());
    }

    #[test]
    fn test_prepare_twice() {
        init_logger();
        let mut stream = StreamOut::new(RecordingDriver::default());
        let client = stream.prepare_for_writing(4, 16).unwrap();
        assert_eq!(client.thread_info.pid, unistd::getpid());
        assert_ne!(client.thread_info.tid, client.thread_info.pid);

        let err = stream.prepare_for_writing(4, 16).unwrap_err();
        assert_matches!(err, Error::AlreadyPrepared);
        assert_eq!(err.result(), WriteResult::InvalidState);
    }

    #[test]
    fn test_write_reaches_driver() {
        init_logger();
        let driver = RecordingDriver::default();
        let written = driver.written.clone();
        let mut stream = StreamOut::new(driver);
        let mut client = stream.prepare_for_writing(4, 16).unwrap();

        let samples: Vec<u8> = (0..32).collect();
        assert_eq!(client.write(&samples).unwrap(), 32);
        let status = client.wait_status(TIMEOUT).unwrap().unwrap();
        assert_eq!(
            status,
            WriteStatus {
                retval: WriteResult::Ok,
                reply_to: WriteCommand::Write,
                reply: WriteReply::Written(32),
            }
        );
        assert_eq!(*written.lock().unwrap(), samples);

        // The data queue holds frame_size * frames_count bytes.
        let oversized = vec![0u8; 100];
        assert_eq!(client.write(&oversized).unwrap(), 64);
        let status = client.wait_status(TIMEOUT).unwrap().unwrap();
        assert_eq!(status.reply, WriteReply::Written(64));
    }

    #[test]
    fn test_queries() {
        init_logger();
        let mut stream = StreamOut::new(RecordingDriver::default());
        let mut client = stream.prepare_for_writing(4, 16).unwrap();

        client.write(&[0; 8]).unwrap();
        client.wait_status(TIMEOUT).unwrap().unwrap();

        client.send(WriteCommand::GetPresentationPosition).unwrap();
        let status = client.wait_status(TIMEOUT).unwrap().unwrap();
        assert_eq!(status.retval, WriteResult::Ok);
        assert_eq!(
            status.reply,
            WriteReply::PresentationPosition(PresentationPosition {
                frames: 2,
                timestamp: Duration::from_millis(7),
            })
        );

        client.send(WriteCommand::GetLatency).unwrap();
        let status = client.wait_status(TIMEOUT).unwrap().unwrap();
        assert_eq!(status.reply, WriteReply::LatencyMs(25));
    }

    #[test]
    fn test_driver_errors() {
        init_logger();
        let driver = RecordingDriver {
            fail_with: Some(libc::EINVAL),
            ..Default::default()
        };
        let mut stream = StreamOut::new(driver);
        let mut client = stream.prepare_for_writing(4, 16).unwrap();

        client.write(&[1; 8]).unwrap();
        let status = client.wait_status(TIMEOUT).unwrap().unwrap();
        assert_eq!(status.retval, WriteResult::InvalidArguments);
        assert_eq!(status.reply, WriteReply::Written(0));

        client.send(WriteCommand::GetPresentationPosition).unwrap();
        let status = client.wait_status(TIMEOUT).unwrap().unwrap();
        assert_eq!(status.retval, WriteResult::NotSupported);
    }

    #[test]
    fn test_no_status_without_command() {
        init_logger();
        let mut stream = StreamOut::new(RecordingDriver::default());
        let mut client = stream.prepare_for_writing(4, 16).unwrap();

        // Waking the writer without a command produces no status.
        client.event_flag.wake(NOT_EMPTY).unwrap();
        assert_eq!(
            client.wait_status(Duration::from_millis(50)).unwrap(),
            None
        );
    }

    #[test]
    fn test_close_returns_driver() {
        init_logger();
        let driver = RecordingDriver::default();
        let written = driver.written.clone();
        let mut stream = StreamOut::new(driver);
        let mut client = stream.prepare_for_writing(4, 16).unwrap();
        client.write(&[9; 4]).unwrap();
        client.wait_status(TIMEOUT).unwrap().unwrap();

        let start = Instant::now();
        let driver = stream.close().unwrap();
        // The stop flag is observed without waiting for the wait timeout.
        assert!(start.elapsed() < WAIT_TIMEOUT);
        assert!(!stream.is_writing());
        assert_eq!(*driver.written.lock().unwrap(), vec![9; 4]);
        assert!(Arc::ptr_eq(&driver.written, &written));
        assert!(stream.close().is_none());
    }

    #[test]
    fn test_one_command_in_flight() {
        init_logger();
        let mut stream = StreamOut::new(RecordingDriver::default());
        let mut client = stream.prepare_for_writing(4, 16).unwrap();

        client.send(WriteCommand::GetPresentationPosition).unwrap();
        assert_matches!(
            client.send(WriteCommand::GetLatency),
            Err(Error::CommandQueueFull(WriteCommand::GetLatency))
        );
        assert_matches!(
            client.write(&[1; 8]),
            Err(Error::CommandQueueFull(WriteCommand::Write))
        );
        assert_eq!(client.data.occupied_len(), 0);
        assert_eq!(
            Error::CommandQueueFull(WriteCommand::Write).result(),
            WriteResult::InvalidState
        );

        // Replies stay paired with their commands.
        let status = client.wait_status(TIMEOUT).unwrap().unwrap();
        assert_eq!(status.reply_to, WriteCommand::GetPresentationPosition);
        client.send(WriteCommand::GetLatency).unwrap();
        let status = client.wait_status(TIMEOUT).unwrap().unwrap();
        assert_eq!(status.reply_to, WriteCommand::GetLatency);
        assert_eq!(status.reply, WriteReply::LatencyMs(25));
        assert_eq!(
            client.wait_status(Duration::from_millis(50)).unwrap(),
            None
        );
    }

    #[test]
    fn test_wait_status_without_deadline() {
        init_logger();
        let mut stream = StreamOut::new(RecordingDriver::default());
        let mut client = stream.prepare_for_writing(4, 16).unwrap();

        client.send(WriteCommand::GetLatency).unwrap();
        let status = client.wait_status(Duration::MAX).unwrap().unwrap();
        assert_eq!(status.reply, WriteReply::LatencyMs(25));
    }

    #[test]
    fn test_close_without_prepare() {
        init_logger();
        let mut stream = StreamOut::new(RecordingDriver::default());

        // The driver was never handed to a writer thread.
        assert!(stream.close().is_some());
        assert!(stream.close().is_none());
    }

    #[test]
    fn test_error_result_mapping() {
        let err = io::Error::from_raw_os_error(libc::ENODEV);
        assert_eq!(
            WriteResult::from_driver_error("write", &err),
            WriteResult::NotInitialized
        );
        let err = io::Error::from_raw_os_error(libc::EIO);
        assert_eq!(
            WriteResult::from_driver_error("write", &err),
            WriteResult::InvalidState
        );
        let err = io::Error::new(io::ErrorKind::Unsupported, "no position");
        assert_eq!(
            WriteResult::from_driver_error("write", &err),
            WriteResult::NotSupported
        );
    }
}
