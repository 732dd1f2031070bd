//! udev integration: block-device discovery and hotplug events.

use anyhow::Result;
use log::{debug, error, info, warn};
use std::ffi::OsStr;
use std::fs::{self, File};
use std::io::{self, Read};
use std::path::{Path, PathBuf};
use std::sync::mpsc::Sender;
use std::thread::{self, JoinHandle};
use std::time::Duration;
use udev::{Device, Enumerator, MonitorBuilder};
use usb_enforcer_core::device::{probe_luks_header, LUKS_HEADER_PROBE_LEN};
use usb_enforcer_core::DeviceEvent;
use usb_enforcer_provider::{DevType, DeviceProperties, LuksVersion};

const SYS_CLASS_BLOCK: &str = "/sys/class/block";

/// How a node sits in the block-device stack.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub(crate) struct Topology {
    pub parent: Option<String>,
    pub has_partitions: bool,
    pub is_mapper: bool,
}

/// Start the monitor thread. It ends once the receiving side hangs up, and
/// stops the consumer when udev itself fails.
pub fn spawn(events: Sender<DeviceEvent>) -> io::Result<JoinHandle<()>> {
    thread::Builder::new()
        .name("udev-monitor".into())
        .spawn(move || {
            if let Err(err) = watch(&events) {
                error!("udev monitor stopped: {err:?}");
                let _ = events.send(DeviceEvent::Shutdown);
            }
        })
}

fn watch(events: &Sender<DeviceEvent>) -> Result<()> {
    // Listen first so nothing plugged in during the scan is missed.
    let monitor = MonitorBuilder::new()?.match_subsystem("block")?.listen()?;
    let seen = scan_existing(events)?;
    info!("startup scan queued {seen} block devices; watching udev");

    loop {
        let Some(event) = monitor.iter().next() else {
            thread::sleep(Duration::from_millis(100));
            continue;
        };
        let device = event.device();
        let Some(translated) = translate(&device) else {
            continue;
        };
        if events.send(translated).is_err() {
            debug!("event consumer gone; udev monitor exiting");
            return Ok(());
        }
    }
}

fn scan_existing(events: &Sender<DeviceEvent>) -> Result<usize> {
    let mut enumerator = Enumerator::new()?;
    enumerator.match_subsystem("block")?;

    let mut queued = 0;
    for device in enumerator.scan_devices()? {
        if let Some(props) = properties_of(&device) {
            if events.send(DeviceEvent::Added(props)).is_err() {
                break;
            }
            queued += 1;
        }
    }
    Ok(queued)
}

fn translate(device: &Device) -> Option<DeviceEvent> {
    let action = device.action().and_then(os_str_to_str).unwrap_or("change");
    match action {
        "add" | "change" | "bind" | "online" => properties_of(device).map(DeviceEvent::Added),
        "remove" | "unbind" | "offline" => node_path(device).map(DeviceEvent::Removed),
        other => {
            debug!("ignoring udev action {other} for {}", syspath(device));
            None
        }
    }
}

/// Current properties of the node at `path`, `None` when it is gone.
pub fn probe_node(path: &str) -> io::Result<Option<DeviceProperties>> {
    let canonical = match fs::canonicalize(path) {
        Ok(canonical) => canonical,
        Err(err) if err.kind() == io::ErrorKind::NotFound => return Ok(None),
        Err(err) => return Err(err),
    };
    let Some(sysname) = canonical.file_name() else {
        return Ok(None);
    };
    let syspath = Path::new(SYS_CLASS_BLOCK).join(sysname);
    if !syspath.exists() {
        return Ok(None);
    }
    let device = Device::from_syspath(&syspath)?;
    Ok(properties_of(&device))
}

fn properties_of(device: &Device) -> Option<DeviceProperties> {
    let node = node_path(device)?;
    let devtype = match device.devtype().and_then(os_str_to_str) {
        Some("disk") => DevType::Disk,
        Some("partition") => DevType::Partition,
        _ => return None,
    };
    let topology = topology_of(device, devtype);
    let lookup = |key: &str| {
        device
            .property_value(key)
            .and_then(os_str_to_str)
            .map(str::to_string)
    };
    let mut props = build_properties(node, devtype, lookup, topology);

    if props.luks_version.is_none() && is_luks(&props) {
        props.luks_version = header_version(&props.path);
    }
    Some(props)
}

/// Assemble [`DeviceProperties`] from udev keys and the node's topology.
pub(crate) fn build_properties<F>(
    node: String,
    devtype: DevType,
    lookup: F,
    topology: Topology,
) -> DeviceProperties
where
    F: Fn(&str) -> Option<String>,
{
    let mut props = DeviceProperties::new(node, devtype);
    props.is_mapper = topology.is_mapper || lookup("DM_NAME").is_some();
    // Mappers take their bus from the device underneath.
    props.bus = if props.is_mapper {
        None
    } else {
        lookup("ID_BUS").filter(|bus| !bus.is_empty())
    };
    props.fs_type = lookup("ID_FS_TYPE").filter(|fs| !fs.is_empty());
    props.fs_usage = lookup("ID_FS_USAGE").filter(|usage| !usage.is_empty());
    if is_luks(&props) {
        props.luks_version = lookup("ID_FS_VERSION").and_then(|v| v.trim().parse::<u8>().ok());
    }
    props.parent = topology.parent;
    props.has_partitions = topology.has_partitions;
    props
}

fn is_luks(props: &DeviceProperties) -> bool {
    props
        .fs_type
        .as_deref()
        .map(|fs| fs.eq_ignore_ascii_case("crypto_LUKS"))
        .unwrap_or(false)
}

fn topology_of(device: &Device, devtype: DevType) -> Topology {
    let syspath = device.syspath().to_path_buf();
    let is_mapper = device
        .sysname()
        .to_str()
        .map(|name| name.starts_with("dm-"))
        .unwrap_or(false);

    let parent = if is_mapper {
        first_slave(&syspath)
    } else if devtype == DevType::Partition {
        device
            .parent()
            .and_then(|parent| parent.devnode().map(|node| node.to_string_lossy().into_owned()))
    } else {
        None
    };

    Topology {
        parent,
        has_partitions: devtype == DevType::Disk && has_partition_children(&syspath),
        is_mapper,
    }
}

/// Registry key for a node; dm devices are keyed by their `/dev/mapper` name.
fn node_path(device: &Device) -> Option<String> {
    if let Some(name) = device.property_value("DM_NAME").and_then(os_str_to_str) {
        return Some(format!("/dev/mapper/{name}"));
    }
    device
        .devnode()
        .map(|node| node.to_string_lossy().into_owned())
}

fn first_slave(syspath: &Path) -> Option<String> {
    let mut slaves: Vec<PathBuf> = fs::read_dir(syspath.join("slaves"))
        .ok()?
        .filter_map(|entry| entry.ok().map(|entry| entry.path()))
        .collect();
    slaves.sort();
    let name = slaves.first()?.file_name()?.to_string_lossy().into_owned();
    Some(format!("/dev/{name}"))
}

fn has_partition_children(syspath: &Path) -> bool {
    let Ok(entries) = fs::read_dir(syspath) else {
        return false;
    };
    entries
        .filter_map(|entry| entry.ok())
        .any(|entry| entry.path().join("partition").exists())
}

fn header_version(node: &str) -> Option<u8> {
    let mut header = [0u8; LUKS_HEADER_PROBE_LEN];
    let read = File::open(node).and_then(|mut file| file.read_exact(&mut header));
    if let Err(err) = read {
        warn!("could not read LUKS header of {node}: {err}");
        return None;
    }
    probe_luks_header(&header).map(|version| match version {
        LuksVersion::Luks1 => 1,
        LuksVersion::Luks2 => 2,
    })
}

fn syspath(device: &Device) -> String {
    device.syspath().to_string_lossy().into_owned()
}

fn os_str_to_str(value: &OsStr) -> Option<&str> {
    value.to_str()
}
