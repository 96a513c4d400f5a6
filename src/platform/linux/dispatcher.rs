//! The process-wide asynchronous URB dispatcher.
//!
//! Grounded on `_linux/asynctransfer.py`'s `AsyncTask`: one background
//! thread per process, one `epoll` set shared by every open device file
//! descriptor, and in-flight transfers tracked in a map keyed by the
//! address of their `Urb` (the kernel hands that same address back on
//! `USBDEVFS_REAPURBNDELAY`).

use std::collections::HashMap;
use std::ffi::c_void;
use std::os::fd::{BorrowedFd, RawFd};
use std::sync::{Arc, Condvar, Mutex, OnceLock};
use std::thread;
use std::time::Duration;

use nix::sys::epoll::{Epoll, EpollCreateFlags, EpollEvent, EpollFlags, EpollTimeout};

use crate::error::{Error, Result};
use crate::model::{TransferDirection, TransferType};

use super::usbdevfs::{
    self, Urb, USBDEVFS_URB_TYPE_BULK, USBDEVFS_URB_TYPE_CONTROL, USBDEVFS_URB_TYPE_INTERRUPT,
    USBDEVFS_URB_TYPE_ISO,
};

fn urb_transfer_type(transfer_type: TransferType) -> u8 {
    match transfer_type {
        TransferType::Bulk => USBDEVFS_URB_TYPE_BULK,
        TransferType::Interrupt => USBDEVFS_URB_TYPE_INTERRUPT,
        TransferType::Control => USBDEVFS_URB_TYPE_CONTROL,
        TransferType::Isochronous => USBDEVFS_URB_TYPE_ISO,
    }
}

/// Outcome of a completed (or aborted) transfer.
struct Outcome {
    /// Negative errno, or 0 on success.
    status: i32,
    actual_length: usize,
}

struct Shared {
    outcome: Mutex<Option<Outcome>>,
    condvar: Condvar,
}

/// A handle to an in-flight transfer, returned by [`Dispatcher::submit`].
pub(crate) struct TransferHandle {
    shared: Arc<Shared>,
    buffer: Arc<Mutex<Vec<u8>>>,
    device_fd: RawFd,
    endpoint_address: u8,
}

impl TransferHandle {
    /// Block until the transfer completes, with no deadline.
    pub(crate) fn wait(self) -> Result<Vec<u8>> {
        let mut guard = self.shared.outcome.lock().unwrap();
        while guard.is_none() {
            guard = self.shared.condvar.wait(guard).unwrap();
        }
        let outcome = guard.take().unwrap();
        drop(guard);
        Self::finish(outcome, &self.buffer)
    }

    /// Block until the transfer completes or `timeout` elapses. On
    /// timeout, discards the URB and then waits (with no further
    /// deadline) for the kernel to confirm the abort, exactly like
    /// `wait_for_transfer` in the original implementation.
    pub(crate) fn wait_timeout(self, timeout: Duration) -> Result<Vec<u8>> {
        let (mut guard, result) = self
            .shared
            .condvar
            .wait_timeout_while(self.shared.outcome.lock().unwrap(), timeout, |o| o.is_none())
            .unwrap();

        if guard.is_none() && result.timed_out() {
            drop(guard);
            Dispatcher::global().abort(self.device_fd, self.endpoint_address);
            guard = self.shared.outcome.lock().unwrap();
            while guard.is_none() {
                guard = self.shared.condvar.wait(guard).unwrap();
            }
        }

        let outcome = guard.take().unwrap();
        drop(guard);
        Self::finish(outcome, &self.buffer)
    }

    fn finish(outcome: Outcome, buffer: &Mutex<Vec<u8>>) -> Result<Vec<u8>> {
        if outcome.status != 0 {
            if outcome.status == -libc::EPIPE {
                return Err(Error::stall("transfer stalled"));
            }
            return Err(Error::usb(format!(
                "transfer failed - {}",
                std::io::Error::from_raw_os_error(-outcome.status)
            )));
        }
        let mut buffer = buffer.lock().unwrap();
        buffer.truncate(outcome.actual_length);
        Ok(std::mem::take(&mut buffer))
    }
}

/// A submitted URB together with the buffer it reads into or writes from.
/// Both must stay alive and at a fixed address for as long as the kernel
/// may reference them, i.e. until it is reaped or the owning fd is removed.
struct PendingUrb {
    urb: Box<Urb>,
    _buffer: Arc<Mutex<Vec<u8>>>,
    device_fd: RawFd,
    endpoint: u8,
    shared: Arc<Shared>,
}

struct Inner {
    epoll: Epoll,
    transfers: Mutex<HashMap<usize, PendingUrb>>,
}

/// The single process-wide URB dispatcher.
pub(crate) struct Dispatcher {
    inner: Inner,
}

impl Dispatcher {
    pub(crate) fn global() -> &'static Dispatcher {
        static DISPATCHER: OnceLock<Dispatcher> = OnceLock::new();
        static STARTED: OnceLock<()> = OnceLock::new();

        let dispatcher = DISPATCHER.get_or_init(|| {
            let epoll = Epoll::new(EpollCreateFlags::empty()).expect("epoll_create1 failed");
            Dispatcher {
                inner: Inner {
                    epoll,
                    transfers: Mutex::new(HashMap::new()),
                },
            }
        });

        STARTED.get_or_init(|| {
            thread::Builder::new()
                .name("usb-host-urb-reaper".into())
                .spawn(|| Dispatcher::global().completion_loop())
                .expect("failed to start URB completion thread");
        });

        dispatcher
    }

    pub(crate) fn add_device(&self, fd: RawFd) {
        let borrowed = unsafe { BorrowedFd::borrow_raw(fd) };
        let event = EpollEvent::new(EpollFlags::EPOLLOUT, fd as u64);
        let _ = self.inner.epoll.add(borrowed, event);
    }

    pub(crate) fn remove_device(&self, fd: RawFd) {
        let borrowed = unsafe { BorrowedFd::borrow_raw(fd) };
        let _ = self.inner.epoll.delete(borrowed);
        self.reap(fd);

        let mut transfers = self.inner.transfers.lock().unwrap();
        let stale: Vec<usize> = transfers
            .iter()
            .filter(|(_, p)| p.device_fd == fd)
            .map(|(k, _)| *k)
            .collect();
        for key in stale {
            if let Some(p) = transfers.remove(&key) {
                let mut outcome = p.shared.outcome.lock().unwrap();
                *outcome = Some(Outcome {
                    status: -libc::ENODEV,
                    actual_length: 0,
                });
                p.shared.condvar.notify_all();
            }
        }
    }

    /// Submit a bulk or interrupt transfer and return a handle to wait on.
    pub(crate) fn submit(
        &self,
        device_fd: RawFd,
        endpoint_number: u8,
        direction: TransferDirection,
        transfer_type: TransferType,
        mut buffer: Vec<u8>,
    ) -> Result<TransferHandle> {
        let address = crate::model::Endpoint::get_address(endpoint_number, direction);
        let shared = Arc::new(Shared {
            outcome: Mutex::new(None),
            condvar: Condvar::new(),
        });

        let buffer_ptr = buffer.as_mut_ptr() as *mut c_void;
        let buffer_len = buffer.len() as i32;
        let shared_buffer = Arc::new(Mutex::new(buffer));

        let urb = Box::new(Urb {
            kind: urb_transfer_type(transfer_type),
            endpoint: address,
            status: 0,
            flags: 0,
            buffer: buffer_ptr,
            buffer_length: buffer_len,
            actual_length: 0,
            start_frame: 0,
            number_of_packets: 0,
            error_count: 0,
            signr: 0,
            usercontext: std::ptr::null_mut(),
        });
        let key = urb.as_ref() as *const Urb as usize;

        {
            let mut transfers = self.inner.transfers.lock().unwrap();
            transfers.insert(
                key,
                PendingUrb {
                    urb,
                    _buffer: Arc::clone(&shared_buffer),
                    device_fd,
                    endpoint: address,
                    shared: Arc::clone(&shared),
                },
            );
        }

        // Use the raw fd ioctl rather than going through any wrapper that
        // copies the struct: the kernel must see the exact address we
        // keep as the map key.
        let res = unsafe { libc::ioctl(device_fd, usbdevfs::usbdevfs_submiturb() as _, key as *mut Urb) };
        if res != 0 {
            self.inner.transfers.lock().unwrap().remove(&key);
            return Err(Error::usb(format!(
                "internal error submitting URB - {}",
                std::io::Error::last_os_error()
            )));
        }

        Ok(TransferHandle {
            shared,
            buffer: shared_buffer,
            device_fd,
            endpoint_address: address,
        })
    }

    pub(crate) fn abort(&self, device_fd: RawFd, endpoint_address: u8) {
        let transfers = self.inner.transfers.lock().unwrap();
        for (key, p) in transfers.iter() {
            if p.device_fd == device_fd && p.endpoint == endpoint_address {
                let res =
                    unsafe { libc::ioctl(device_fd, usbdevfs::usbdevfs_discardurb() as _, *key as *mut c_void) };
                if res != 0 {
                    let err = std::io::Error::last_os_error();
                    // EINVAL happens when the URB completed concurrently;
                    // it will be reaped normally instead.
                    debug_assert_eq!(
                        err.raw_os_error(),
                        Some(libc::EINVAL),
                        "unexpected DISCARDURB failure: {err}"
                    );
                }
            }
        }
    }

    fn completion_loop(&self) -> ! {
        let mut events = [EpollEvent::empty(); 16];
        loop {
            let n = match self.inner.epoll.wait(&mut events, EpollTimeout::NONE) {
                Ok(n) => n,
                Err(_) => continue,
            };
            for event in &events[..n] {
                self.reap(event.data() as RawFd);
            }
        }
    }

    fn reap(&self, fd: RawFd) {
        loop {
            let mut urb_ptr: *mut c_void = std::ptr::null_mut();
            let res = unsafe {
                libc::ioctl(
                    fd,
                    usbdevfs::usbdevfs_reapurbndelay() as _,
                    &mut urb_ptr as *mut *mut c_void,
                )
            };
            if res != 0 {
                let err = std::io::Error::last_os_error().raw_os_error();
                if err == Some(libc::EAGAIN) {
                    return;
                }
                if err == Some(libc::ENODEV) {
                    let borrowed = unsafe { BorrowedFd::borrow_raw(fd) };
                    let _ = self.inner.epoll.delete(borrowed);
                }
                return;
            }

            let key = urb_ptr as usize;
            let mut transfers = self.inner.transfers.lock().unwrap();
            let Some(pending) = transfers.remove(&key) else {
                continue;
            };
            drop(transfers);

            let status = -pending.urb.status;
            let actual_length = pending.urb.actual_length.max(0) as usize;

            let mut outcome = pending.shared.outcome.lock().unwrap();
            *outcome = Some(Outcome { status, actual_length });
            pending.shared.condvar.notify_all();
        }
    }
}

pub(crate) fn submit_bulk_or_interrupt(
    fd: RawFd,
    endpoint_number: u8,
    direction: TransferDirection,
    transfer_type: TransferType,
    buffer: Vec<u8>,
) -> Result<TransferHandle> {
    Dispatcher::global().submit(fd, endpoint_number, direction, transfer_type, buffer)
}
