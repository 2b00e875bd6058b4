//! DaynaPort SCSI/Link Ethernet adapter (§4.10).
//!
//! Wire format and opcode table resolved against the teacher's own
//! `ethernet.rs` NCR5380-side implementation rather than the distilled
//! spec's shorthand: READ(6) replies with a 6-byte prefix
//! `[len_hi, len_lo, 0, 0, 0, flag]` per queued frame, where `len` covers
//! `max(frame.len(), 64) + 4` (the trailing CRC-32 FCS) and excludes the
//! prefix itself; `flag` bit 4 (0x10) marks "more frames follow" so a
//! single READ(6) can drain several queued frames in one transfer.
//!
//! Grounded on `devices/scsi_daynaport.cpp` (via the teacher's port of it)
//! for the opcode table and frame layout, and on `devices/scsi_host_bridge`
//! for the transport split: this crate only defines the device-facing
//! opcode handling and a host-implemented link trait, never a concrete
//! network transport, matching [`crate::devices::host_bridge::HostBridgeIo`].

use std::collections::VecDeque;
use std::sync::{Arc, RwLock};

use anyhow::Result;
use rand::Rng;

use crate::device::{CommandResult, Device, ScsiTarget};
use crate::error::{Asc, ScsiError};
use crate::util::get_int16;

/// Maximum frames buffered in either direction before a send is dropped.
pub const PACKET_QUEUE_SIZE: usize = 512;

const OPCODE_READ6: u8 = 0x08;
const OPCODE_RETRIEVE_STATS: u8 = 0x09;
const OPCODE_WRITE6: u8 = 0x0a;
const OPCODE_SET_MULTICAST: u8 = 0x0d;
const OPCODE_ENABLE_INTERFACE: u8 = 0x0e;

/// Ethernet FCS (CRC-32/ISO-HDLC), appended to every frame READ(6) hands the
/// guest, matching real DaynaPort hardware (a host-side TAP device normally
/// strips this before the frame ever reaches this crate).
fn frame_fcs(frame: &[u8]) -> [u8; 4] {
    const FCS: crc::Crc<u32> = crc::Crc::<u32>::new(&crc::CRC_32_ISO_HDLC);
    FCS.checksum(frame).to_be_bytes()
}

/// Host-implemented packet transport. A host binary bridges this to a raw
/// socket, a TAP device, or a userland NAT stack; this crate never picks a
/// transport itself, mirroring [`crate::devices::host_bridge::HostBridgeIo`].
pub trait EthernetLink: Send {
    /// Sends a frame the guest produced (WRITE(6)) onto the wire.
    fn send_frame(&mut self, frame: &[u8]) -> Result<()>;
    /// Non-blocking receive of a frame for the guest (READ(6)). `Ok(None)`
    /// means no frame is currently queued.
    fn try_recv_frame(&mut self) -> Result<Option<Vec<u8>>>;
}

/// A link that is administratively down: WRITE(6) succeeds and discards,
/// READ(6) never has data. Used until a host binds a real [`EthernetLink`].
pub struct DownLink;

impl EthernetLink for DownLink {
    fn send_frame(&mut self, _frame: &[u8]) -> Result<()> {
        Ok(())
    }

    fn try_recv_frame(&mut self) -> Result<Option<Vec<u8>>> {
        Ok(None)
    }
}

/// DaynaPort SCSI/Link Ethernet adapter. Presents as a PROCESSOR-type
/// device (per `device_factory.cpp`'s DaynaPort entry); the generic
/// INQUIRY/TEST UNIT READY handling in [`crate::device::primary`] and the
/// controller covers everything except the command-specific opcodes below.
pub struct DaynaPort {
    mac_address: [u8; 6],
    link: Box<dyn EthernetLink>,
    enabled: bool,
    multicast_groups: Arc<RwLock<Vec<[u8; 6]>>>,
    /// Frames pulled from `link` but not yet consumed by a READ(6); queued
    /// here so a single READ(6) transfer can answer with everything pending
    /// without racing the link's own buffering.
    pending: VecDeque<Vec<u8>>,
}

impl DaynaPort {
    pub fn new(link: Box<dyn EthernetLink>) -> Self {
        let mut rng = rand::rng();
        Self {
            // 00:80:19 is Dayna Communications' IEEE OUI; the remaining
            // three octets are randomized per instance, matching the
            // teacher's `Default` impl.
            mac_address: [0x00, 0x80, 0x19, rng.random(), rng.random(), rng.random()],
            link,
            enabled: false,
            multicast_groups: Arc::new(RwLock::new(Vec::new())),
            pending: VecDeque::new(),
        }
    }

    pub fn mac_address(&self) -> [u8; 6] {
        self.mac_address
    }

    pub fn set_link(&mut self, link: Box<dyn EthernetLink>) {
        self.link = link;
        self.pending.clear();
    }

    fn drain_link(&mut self) -> Result<()> {
        while let Some(frame) = self.link.try_recv_frame()? {
            self.pending.push_back(frame);
        }
        Ok(())
    }

    /// READ(6): drains every frame currently queued into one response,
    /// each framed as `[len_hi, len_lo, 0, 0, 0, flag]` + frame + CRC-32.
    /// An empty response (6 zero bytes) signals "nothing to read" rather
    /// than an error, matching real hardware's idle-poll behavior.
    fn read6(&mut self, alloc_len: usize) -> Result<CommandResult, ScsiError> {
        if alloc_len == 1 {
            // The Mac boot ROM probes unknown SCSI IDs with a 1-byte
            // READ(6) to see if a disk is present; DaynaPort must refuse
            // so it isn't mistaken for a bootable disk.
            return Ok(CommandResult::Status(crate::error::status::CHECK_CONDITION));
        }

        self.drain_link()
            .map_err(|_| ScsiError::illegal_request(Asc::ReadFault))?;

        if self.pending.is_empty() {
            return Ok(CommandResult::DataIn(vec![0; 6]));
        }

        let mut response = Vec::new();
        while let Some(frame) = self.pending.pop_front() {
            let more = !self.pending.is_empty();
            let padded_len = frame.len().max(64);
            let frame_len = padded_len + 4; // + CRC
            let resp_len = 6 + frame_len;
            if alloc_len < resp_len {
                // Put it back; the guest under-allocated and will retry.
                self.pending.push_front(frame);
                if response.is_empty() {
                    return Ok(CommandResult::Status(crate::error::status::CHECK_CONDITION));
                }
                break;
            }

            response.push((frame_len >> 8) as u8);
            response.push(frame_len as u8);
            response.extend_from_slice(&[0, 0, 0]);
            response.push(if more { 0x10 } else { 0x00 });
            response.extend_from_slice(&frame);
            response.extend_from_slice(&frame_fcs(&frame));

            if !more {
                break;
            }
        }
        Ok(CommandResult::DataIn(response))
    }

    fn retrieve_stats(&self) -> Vec<u8> {
        let mut result = vec![0u8; 18];
        result[0..6].copy_from_slice(&self.mac_address);
        result
    }

    fn write6(&mut self, cdb: &[u8], data: &[u8]) -> Result<CommandResult, ScsiError> {
        let with_header = cdb.get(5).copied().unwrap_or(0) & 0x80 != 0;
        let payload = if with_header {
            let len = usize::from(get_int16(data, 0));
            if data.len() < len + 4 {
                return Err(ScsiError::illegal_request(Asc::InvalidFieldInParameterList));
            }
            &data[4..len + 4]
        } else {
            data
        };
        self.link
            .send_frame(payload)
            .map_err(|_| ScsiError::illegal_request(Asc::WriteFault))?;
        Ok(CommandResult::Status(crate::error::status::GOOD))
    }

    fn set_multicast(&mut self, data: &[u8]) -> Result<CommandResult, ScsiError> {
        if data.len() < 6 {
            return Err(ScsiError::illegal_request(Asc::InvalidFieldInParameterList));
        }
        let mac: [u8; 6] = data[0..6].try_into().expect("checked len above");
        let mut groups = self.multicast_groups.write().expect("multicast lock poisoned");
        if !groups.contains(&mac) {
            groups.push(mac);
        }
        Ok(CommandResult::Status(crate::error::status::GOOD))
    }

    fn enable_interface(&mut self, enable: bool) -> Result<CommandResult, ScsiError> {
        if !self.enabled && enable {
            // Discard anything queued while the interface was disabled.
            self.pending.clear();
            while matches!(self.link.try_recv_frame(), Ok(Some(_))) {}
        }
        self.enabled = enable;
        Ok(CommandResult::Status(crate::error::status::GOOD))
    }
}

impl ScsiTarget for DaynaPort {
    fn dispatch(&mut self, dev: &mut Device, cdb: &[u8], outdata: Option<&[u8]>) -> Result<CommandResult, ScsiError> {
        let result = match cdb[0] {
            OPCODE_READ6 => {
                let len = ((usize::from(cdb[3])) << 8) | usize::from(cdb[4]);
                self.read6(len)
            }
            OPCODE_RETRIEVE_STATS => Ok(CommandResult::DataIn(self.retrieve_stats())),
            OPCODE_WRITE6 => match outdata {
                None => {
                    let mut len = ((usize::from(cdb[3])) << 8) | usize::from(cdb[4]);
                    if cdb.get(5).copied().unwrap_or(0) & 0x80 != 0 {
                        len += 8;
                    }
                    Ok(CommandResult::DataOut(len))
                }
                Some(data) => self.write6(cdb, data),
            },
            OPCODE_SET_MULTICAST => match outdata {
                None => Ok(CommandResult::DataOut(6)),
                Some(data) => self.set_multicast(data),
            },
            OPCODE_ENABLE_INTERFACE => {
                let enable = cdb.get(5).copied().unwrap_or(0) & 0x80 != 0;
                self.enable_interface(enable)
            }
            _ => Err(ScsiError::illegal_request(Asc::InvalidCommandOperationCode)),
        };
        result.map_err(|e| dev.fail(e))
    }
}

/// Dedicated errors for a host binary wiring up a raw-socket or TAP-backed
/// [`EthernetLink`]; kept separate from [`ScsiError`] since link setup
/// happens outside SCSI command dispatch.
#[cfg(feature = "ethernet_raw")]
pub mod raw_bridge {
    use super::{EthernetLink, PACKET_QUEUE_SIZE};
    use anyhow::{bail, Result};
    use crossbeam_channel::TrySendError;

    /// A raw-socket bridge to a named host interface, spawning the two
    /// forwarding threads the teacher's `start_bridge` uses. Promiscuous
    /// mode is required since the adapter's MAC differs from the host
    /// interface's; no MAC rewriting is attempted (the teacher's own
    /// comment notes this breaks on adapters with TSO/GSO offload enabled).
    pub struct RawSocketLink {
        tx: crossbeam_channel::Sender<Vec<u8>>,
        rx: crossbeam_channel::Receiver<Vec<u8>>,
    }

    impl RawSocketLink {
        pub fn open(ifidx: u32, mac_address: [u8; 6]) -> Result<Self> {
            let Some(interface) = pnet::datalink::interfaces().into_iter().find(|i| i.index == ifidx) else {
                bail!("cannot find interface index {ifidx}")
            };

            let (bridge_tx, emulator_rx) = crossbeam_channel::bounded(PACKET_QUEUE_SIZE);
            let (emulator_tx, bridge_rx) = crossbeam_channel::bounded(PACKET_QUEUE_SIZE);

            let config = pnet::datalink::Config {
                promiscuous: true,
                ..Default::default()
            };
            let (mut physical_tx, mut physical_rx) = match pnet::datalink::channel(&interface, config) {
                Ok(pnet::datalink::Channel::Ethernet(t, r)) => (t, r),
                Ok(_) => bail!("unsupported datalink channel type for '{}'", interface.name),
                Err(e) => bail!("failed opening bridge channel for '{}': {e}", interface.name),
            };

            let t_mac: pnet::datalink::MacAddr = mac_address.into();
            log::info!("starting ethernet bridge for interface '{}'", interface.name);
            std::thread::spawn(move || loop {
                match physical_rx.next() {
                    Ok(packet) => {
                        let Some(ethpacket) = pnet::packet::ethernet::EthernetPacket::new(packet) else {
                            log::warn!("dropped invalid ethernet frame ({} bytes)", packet.len());
                            continue;
                        };
                        let dest = ethpacket.get_destination();
                        let src = ethpacket.get_source();
                        if (dest != t_mac && !dest.is_broadcast()) || src == t_mac {
                            continue;
                        }
                        match bridge_tx.try_send(packet.to_vec()) {
                            Ok(()) => {}
                            Err(TrySendError::Disconnected(_)) => return,
                            Err(TrySendError::Full(_)) => log::error!("bridge rx queue overflow"),
                        }
                    }
                    Err(e) => {
                        log::info!("bridge terminated (rx closed: {e})");
                        return;
                    }
                }
            });
            std::thread::spawn(move || loop {
                match bridge_rx.recv() {
                    Ok(packet) => match physical_tx.send_to(&packet, None) {
                        Some(Ok(())) => {}
                        Some(Err(e)) => {
                            log::info!("bridge terminated (tx closed: {e})");
                            return;
                        }
                        None => {}
                    },
                    Err(e) => {
                        log::info!("bridge terminated (bridge_rx closed: {e})");
                        return;
                    }
                }
            });

            Ok(Self {
                tx: emulator_tx,
                rx: emulator_rx,
            })
        }
    }

    impl EthernetLink for RawSocketLink {
        fn send_frame(&mut self, frame: &[u8]) -> Result<()> {
            match self.tx.try_send(frame.to_vec()) {
                Ok(()) => Ok(()),
                Err(e) => bail!("failed to queue outgoing frame: {e}"),
            }
        }

        fn try_recv_frame(&mut self) -> Result<Option<Vec<u8>>> {
            match self.rx.try_recv() {
                Ok(frame) => Ok(Some(frame)),
                Err(crossbeam_channel::TryRecvError::Empty) => Ok(None),
                Err(e) => bail!("bridge link closed: {e}"),
            }
        }
    }
}

/// TAP-backed transport, Linux-only like the teacher's own `ethernet_tap`.
#[cfg(all(feature = "ethernet_tap", target_os = "linux"))]
pub mod tap_bridge {
    use super::{EthernetLink, PACKET_QUEUE_SIZE};
    use anyhow::{bail, Result};
    use crossbeam_channel::{RecvTimeoutError, TrySendError};
    use std::io::{Read, Write};
    use std::os::fd::AsRawFd;
    use std::sync::atomic::{AtomicBool, Ordering};
    use std::sync::Arc;
    use std::time::Duration;

    pub struct TapLink {
        tx: crossbeam_channel::Sender<Vec<u8>>,
        rx: crossbeam_channel::Receiver<Vec<u8>>,
        stop: Arc<AtomicBool>,
    }

    impl TapLink {
        pub fn open(tap_name: &str, mac_address: [u8; 6]) -> Result<Self> {
            let mut config = tun::Configuration::default();
            config.layer(tun::Layer::L2).tun_name(tap_name);
            config.platform_config(|c| {
                c.ensure_root_privileges(true);
            });

            let dev = tun::create(&config).map_err(|e| anyhow::anyhow!("failed to open tap device '{tap_name}': {e}"))?;
            log::info!("tap device '{tap_name}' opened");

            let (bridge_tx, emulator_rx) = crossbeam_channel::bounded(PACKET_QUEUE_SIZE);
            let (emulator_tx, bridge_rx) = crossbeam_channel::bounded(PACKET_QUEUE_SIZE);
            let stop = Arc::new(AtomicBool::new(false));
            let (mut reader, mut writer) = dev.split();

            let rx_stop = stop.clone();
            std::thread::spawn(move || {
                use nix::errno::Errno;
                use nix::poll;
                use std::os::fd::BorrowedFd;

                let fd = unsafe { BorrowedFd::borrow_raw(reader.as_raw_fd()) };
                let mut buffer = vec![0u8; 65536];
                loop {
                    let mut pfd = [poll::PollFd::new(fd, poll::PollFlags::POLLIN)];
                    match poll::poll(&mut pfd, 100_u16) {
                        Ok(1) => match reader.read(&mut buffer) {
                            Ok(0) => return,
                            Ok(size) => {
                                let Some(ethpacket) = pnet::packet::ethernet::EthernetPacket::new(&buffer[..size]) else {
                                    continue;
                                };
                                let dest = ethpacket.get_destination();
                                let src = ethpacket.get_source();
                                let t_mac: pnet::datalink::MacAddr = mac_address.into();
                                if (dest != t_mac && !dest.is_broadcast()) || src == t_mac {
                                    continue;
                                }
                                match bridge_tx.try_send(buffer[..size].to_vec()) {
                                    Ok(()) => {}
                                    Err(TrySendError::Disconnected(_)) => return,
                                    Err(TrySendError::Full(_)) => log::error!("tap rx queue overflow"),
                                }
                            }
                            Err(_) => return,
                        },
                        Ok(_) | Err(Errno::EAGAIN) | Err(Errno::EINTR) => {}
                        Err(_) => return,
                    }
                    if rx_stop.load(Ordering::Relaxed) {
                        return;
                    }
                }
            });

            let tx_stop = stop.clone();
            std::thread::spawn(move || loop {
                match bridge_rx.recv_timeout(Duration::from_millis(100)) {
                    Ok(packet) => {
                        if writer.write_all(&packet).is_err() {
                            return;
                        }
                    }
                    Err(RecvTimeoutError::Timeout) => {}
                    Err(RecvTimeoutError::Disconnected) => return,
                }
                if tx_stop.load(Ordering::Relaxed) {
                    return;
                }
            });

            Ok(Self {
                tx: emulator_tx,
                rx: emulator_rx,
                stop,
            })
        }
    }

    impl Drop for TapLink {
        fn drop(&mut self) {
            self.stop.store(true, Ordering::Release);
        }
    }

    impl EthernetLink for TapLink {
        fn send_frame(&mut self, frame: &[u8]) -> Result<()> {
            match self.tx.try_send(frame.to_vec()) {
                Ok(()) => Ok(()),
                Err(e) => bail!("failed to queue outgoing frame: {e}"),
            }
        }

        fn try_recv_frame(&mut self) -> Result<Option<Vec<u8>>> {
            match self.rx.try_recv() {
                Ok(frame) => Ok(Some(frame)),
                Err(crossbeam_channel::TryRecvError::Empty) => Ok(None),
                Err(e) => bail!("tap link closed: {e}"),
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;

    #[derive(Default)]
    struct LoopbackLink {
        outgoing: Mutex<VecDeque<Vec<u8>>>,
        incoming: Mutex<VecDeque<Vec<u8>>>,
    }

    impl EthernetLink for Arc<LoopbackLink> {
        fn send_frame(&mut self, frame: &[u8]) -> Result<()> {
            self.outgoing.lock().unwrap().push_back(frame.to_vec());
            Ok(())
        }
        fn try_recv_frame(&mut self) -> Result<Option<Vec<u8>>> {
            Ok(self.incoming.lock().unwrap().pop_front())
        }
    }

    fn dev() -> Device {
        Device::new(crate::device::DeviceType::Processor, 0)
    }

    #[test]
    fn read6_with_len_one_is_boot_probe_rejected() {
        let mut adapter = DaynaPort::new(Box::new(DownLink));
        let mut d = dev();
        let cdb = [OPCODE_READ6, 0, 0, 0, 1, 0];
        match adapter.dispatch(&mut d, &cdb, None).unwrap() {
            CommandResult::Status(s) => assert_eq!(s, crate::error::status::CHECK_CONDITION),
            other => panic!("expected Status, got {other:?}"),
        }
    }

    #[test]
    fn read6_with_no_frames_returns_six_zero_bytes() {
        let mut adapter = DaynaPort::new(Box::new(DownLink));
        let mut d = dev();
        let cdb = [OPCODE_READ6, 0, 0, 0x10, 0x00, 0];
        match adapter.dispatch(&mut d, &cdb, None).unwrap() {
            CommandResult::DataIn(data) => assert_eq!(data, vec![0; 6]),
            other => panic!("expected DataIn, got {other:?}"),
        }
    }

    #[test]
    fn read6_frames_a_single_queued_packet() {
        let link = Arc::new(LoopbackLink::default());
        link.incoming.lock().unwrap().push_back(vec![0xaa; 10]);
        let mut adapter = DaynaPort::new(Box::new(link));
        let mut d = dev();
        let cdb = [OPCODE_READ6, 0, 0, 0x10, 0x00, 0];
        match adapter.dispatch(&mut d, &cdb, None).unwrap() {
            CommandResult::DataIn(data) => {
                // 64 (padded min size) + 4 CRC = 68
                assert_eq!(&data[0..2], &[0x00, 0x44]);
                assert_eq!(&data[2..5], &[0, 0, 0]);
                assert_eq!(data[5], 0x00); // no more frames
                assert_eq!(&data[6..16], &[0xaa; 10]);
                assert_eq!(data.len(), 6 + 64 + 4);
            }
            other => panic!("expected DataIn, got {other:?}"),
        }
    }

    #[test]
    fn write6_without_header_sends_raw_frame() {
        let link = Arc::new(LoopbackLink::default());
        let mut adapter = DaynaPort::new(Box::new(link.clone()));
        let mut d = dev();
        let cdb = [OPCODE_WRITE6, 0, 0, 0, 4, 0];
        adapter.dispatch(&mut d, &cdb, Some(&[1, 2, 3, 4])).unwrap();
        assert_eq!(link.outgoing.lock().unwrap().pop_front(), Some(vec![1, 2, 3, 4]));
    }

    #[test]
    fn set_multicast_deduplicates_groups() {
        let mut adapter = DaynaPort::new(Box::new(DownLink));
        let mut d = dev();
        let cdb = [OPCODE_SET_MULTICAST, 0, 0, 0, 0, 0];
        let mac = [1, 2, 3, 4, 5, 6];
        adapter.dispatch(&mut d, &cdb, Some(&mac)).unwrap();
        adapter.dispatch(&mut d, &cdb, Some(&mac)).unwrap();
        assert_eq!(adapter.multicast_groups.read().unwrap().len(), 1);
    }

    #[test]
    fn enable_interface_sets_flag() {
        let mut adapter = DaynaPort::new(Box::new(DownLink));
        let mut d = dev();
        let cdb = [OPCODE_ENABLE_INTERFACE, 0, 0, 0, 0, 0x80];
        adapter.dispatch(&mut d, &cdb, None).unwrap();
        assert!(adapter.enabled);
    }

    #[test]
    fn unknown_opcode_is_illegal_request() {
        let mut adapter = DaynaPort::new(Box::new(DownLink));
        let mut d = dev();
        let cdb = [0xff, 0, 0, 0, 0, 0];
        assert!(adapter.dispatch(&mut d, &cdb, None).is_err());
    }
}
