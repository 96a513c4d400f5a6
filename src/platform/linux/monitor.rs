//! Linux device enumeration and hot-plug notification.
//!
//! Grounded on `_linux/udev.py` and `_linux/linuxregistry.py`, but ported
//! away from dynamically loading `libudev.so.1`: initial enumeration walks
//! `/sys/bus/usb/devices` directly, and hot-plug is a raw
//! `NETLINK_KOBJECT_UEVENT` socket subscribed to the kernel's `usb`
//! multicast group. Both read the same sysfs attributes udev itself reads
//! (`idVendor`, `idProduct`, `manufacturer`, `product`, `serial`, and the
//! `uevent` file's `DEVNAME=`), so the device identity seen here matches
//! what udev would have reported.

use std::fs;
use std::os::fd::RawFd;
use std::path::Path;

use crate::error::Error;
use crate::registry::Registry;

use super::device::Device;

const NETLINK_KOBJECT_UEVENT: i32 = 15;
const SYSFS_USB_DEVICES: &str = "/sys/bus/usb/devices";

fn sysfs_attr(dir: &Path, name: &str) -> Option<String> {
    fs::read_to_string(dir.join(name)).ok().map(|s| s.trim().to_string())
}

fn devnode_path(dir: &Path) -> Option<String> {
    let content = fs::read_to_string(dir.join("uevent")).ok()?;
    content
        .lines()
        .find_map(|line| line.strip_prefix("DEVNAME="))
        .map(|name| format!("/dev/{name}"))
}

fn parse_hex_u16(s: &str) -> Option<u16> {
    u16::from_str_radix(s.trim_start_matches("0x"), 16).ok()
}

fn discover_one(dir: &Path) -> Option<Device> {
    let id_vendor = sysfs_attr(dir, "idVendor")?;
    let id_product = sysfs_attr(dir, "idProduct")?;
    let vid = parse_hex_u16(&id_vendor)?;
    let pid = parse_hex_u16(&id_product)?;
    let path = devnode_path(dir)?;

    match Device::discover(&path) {
        Ok(device) => {
            device.set_identity(
                vid,
                pid,
                sysfs_attr(dir, "manufacturer"),
                sysfs_attr(dir, "product"),
                sysfs_attr(dir, "serial"),
            );
            Some(device)
        }
        Err(_) => None,
    }
}

fn enumerate_devices() -> Vec<Device> {
    let mut devices = Vec::new();
    let Ok(entries) = fs::read_dir(SYSFS_USB_DEVICES) else {
        return devices;
    };
    for entry in entries.flatten() {
        let name = entry.file_name();
        // Interfaces show up here too, named e.g. "1-1:1.0"; only bare
        // bus-port addresses (and root hubs, "usbN") name whole devices.
        if name.to_string_lossy().contains(':') {
            continue;
        }
        if let Some(device) = discover_one(&entry.path()) {
            devices.push(device);
        }
    }
    devices
}

fn open_uevent_socket() -> std::io::Result<RawFd> {
    let fd = unsafe { libc::socket(libc::AF_NETLINK, libc::SOCK_RAW | libc::SOCK_CLOEXEC, NETLINK_KOBJECT_UEVENT) };
    if fd < 0 {
        return Err(std::io::Error::last_os_error());
    }

    let mut addr: libc::sockaddr_nl = unsafe { std::mem::zeroed() };
    addr.nl_family = libc::AF_NETLINK as u16;
    addr.nl_pid = 0;
    addr.nl_groups = 1; // kernel uevent multicast group

    let res = unsafe {
        libc::bind(
            fd,
            &addr as *const libc::sockaddr_nl as *const libc::sockaddr,
            std::mem::size_of::<libc::sockaddr_nl>() as u32,
        )
    };
    if res != 0 {
        let err = std::io::Error::last_os_error();
        unsafe {
            libc::close(fd);
        }
        return Err(err);
    }
    Ok(fd)
}

struct UeventMessage {
    action: String,
    subsystem: Option<String>,
    devtype: Option<String>,
    devname: Option<String>,
    devpath: Option<String>,
}

fn parse_uevent(buf: &[u8]) -> Option<UeventMessage> {
    let mut fields = buf.split(|&b| b == 0).filter(|f| !f.is_empty());
    // First field is "ACTION@DEVPATH"; the KEY=VALUE fields follow.
    let _header = fields.next()?;

    let mut action = None;
    let mut subsystem = None;
    let mut devtype = None;
    let mut devname = None;
    let mut devpath = None;

    for field in fields {
        let Ok(s) = std::str::from_utf8(field) else { continue };
        if let Some(v) = s.strip_prefix("ACTION=") {
            action = Some(v.to_string());
        } else if let Some(v) = s.strip_prefix("SUBSYSTEM=") {
            subsystem = Some(v.to_string());
        } else if let Some(v) = s.strip_prefix("DEVTYPE=") {
            devtype = Some(v.to_string());
        } else if let Some(v) = s.strip_prefix("DEVNAME=") {
            devname = Some(v.to_string());
        } else if let Some(v) = s.strip_prefix("DEVPATH=") {
            devpath = Some(v.to_string());
        }
    }

    Some(UeventMessage {
        action: action?,
        subsystem,
        devtype,
        devname,
        devpath,
    })
}

fn poll_for_notifications(fd: RawFd, registry: &Registry) -> ! {
    let mut buf = [0u8; 8192];
    loop {
        let n = unsafe { libc::recv(fd, buf.as_mut_ptr() as *mut _, buf.len(), 0) };
        if n <= 0 {
            continue;
        }
        let Some(message) = parse_uevent(&buf[..n as usize]) else {
            continue;
        };
        if message.subsystem.as_deref() != Some("usb") || message.devtype.as_deref() != Some("usb_device") {
            continue;
        }

        match message.action.as_str() {
            "add" => {
                if let Some(devpath) = &message.devpath {
                    let syspath = format!("/sys{devpath}");
                    if let Some(device) = discover_one(Path::new(&syspath)) {
                        registry.add_device(device);
                    }
                }
            }
            "remove" => {
                if let Some(devname) = &message.devname {
                    registry.close_and_remove_device(&format!("/dev/{devname}"));
                }
            }
            _ => {}
        }
    }
}

/// Entry point run on the registry's background monitor thread.
pub(crate) fn run(registry: Registry) -> ! {
    match open_uevent_socket() {
        Ok(fd) => {
            // The socket is bound (and therefore already receiving into
            // its kernel buffer) before the initial enumeration runs, so
            // no hot-plug events occurring during enumeration are missed.
            let devices = enumerate_devices();
            registry.notify_enumeration_complete(devices);
            poll_for_notifications(fd, &registry);
        }
        Err(err) => {
            registry.notify_enumeration_failed(Error::usb(format!("opening uevent monitor failed: {err}")).to_string());
            loop {
                std::thread::park();
            }
        }
    }
}
