//! Single-owner device sessions
//!
//! Each GPU handle is moved into its own worker thread. Every vendor call,
//! read or write, is sent to that thread as a closure, so calls against one
//! device are serialised and the caller can stop waiting after a bounded
//! interval.

use crate::error::NvmlError;
use crate::nvml::traits::GpuDevice;

use std::sync::mpsc::{self, RecvTimeoutError, Sender};
use std::thread;
use std::time::Duration;

type Job = Box<dyn FnOnce(&mut dyn GpuDevice) + Send>;

/// Handle to the worker thread that owns one device
///
/// A call that times out is still executed by the worker; only the caller
/// stops waiting for it. The worker exits once the session is dropped.
pub struct DeviceSession {
    index: u32,
    sender: Sender<Job>,
    call_timeout: Duration,
}

impl DeviceSession {
    /// Move `device` into a new worker thread
    pub fn spawn<D>(device: D, call_timeout: Duration) -> Result<Self, NvmlError>
    where
        D: GpuDevice + 'static,
    {
        let index = device.index();
        let (sender, receiver) = mpsc::channel::<Job>();

        thread::Builder::new()
            .name(format!("nvoc-gpu{}", index))
            .spawn(move || {
                let mut device = device;
                for job in receiver {
                    job(&mut device);
                }
                log::debug!("Session worker for GPU {} exiting", index);
            })
            .map_err(|e| {
                NvmlError::InitializationFailed(format!("failed to start session worker: {}", e))
            })?;

        Ok(Self {
            index,
            sender,
            call_timeout,
        })
    }

    /// Index of the device this session owns
    pub fn index(&self) -> u32 {
        self.index
    }

    /// Run `f` against the device on its worker thread
    ///
    /// # Errors
    /// Returns `NvmlError::Timeout` if the worker does not answer within the
    /// call timeout and `NvmlError::SessionClosed` if the worker is gone.
    pub fn call<R, F>(&self, f: F) -> Result<R, NvmlError>
    where
        F: FnOnce(&mut dyn GpuDevice) -> Result<R, NvmlError> + Send + 'static,
        R: Send + 'static,
    {
        let (reply_tx, reply_rx) = mpsc::sync_channel(1);
        let job: Job = Box::new(move |device: &mut dyn GpuDevice| {
            // The caller may have given up already
            let _ = reply_tx.send(f(device));
        });

        self.sender
            .send(job)
            .map_err(|_| NvmlError::SessionClosed)?;

        match reply_rx.recv_timeout(self.call_timeout) {
            Ok(result) => result,
            Err(RecvTimeoutError::Timeout) => {
                log::warn!(
                    "GPU {}: vendor call did not return within {:?}",
                    self.index,
                    self.call_timeout
                );
                Err(NvmlError::Timeout(self.call_timeout))
            }
            Err(RecvTimeoutError::Disconnected) => Err(NvmlError::SessionClosed),
        }
    }
}
