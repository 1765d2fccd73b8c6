//! Session state and the class-specific control plane.
//!
//! One [`ControlShared`] exists per function instance. It is shared between
//! the EP0 [`Handler`], the data-path halves and the notifier, and guards
//! the negotiated framing parameters the way the original driver guarded
//! them with its spinlock.

use core::cell::RefCell;
use core::sync::atomic::{AtomicBool, AtomicU32, Ordering};

use embassy_sync::blocking_mutex::raw::CriticalSectionRawMutex;
use embassy_sync::blocking_mutex::Mutex;
use embassy_sync::signal::Signal;
use embassy_usb::control::{InResponse, OutResponse, Recipient, Request, RequestType};
use embassy_usb::types::{InterfaceNumber, StringIndex};
use embassy_usb::Handler;

use crate::ntb::{
    self, ndp_sign, NtbFormat, NTB_DEFAULT_IN_SIZE, NTB_MIN_IN_SIZE, NTB_OUT_SIZE,
};
use crate::notify::NotifyState;
use crate::{ALT_SETTING_DISABLED, ALT_SETTING_ENABLED};

const REQ_SET_ETHERNET_PACKET_FILTER: u8 = 0x43;
const REQ_GET_NTB_PARAMETERS: u8 = 0x80;
const REQ_GET_NTB_FORMAT: u8 = 0x83;
const REQ_SET_NTB_FORMAT: u8 = 0x84;
const REQ_GET_NTB_INPUT_SIZE: u8 = 0x85;
const REQ_SET_NTB_INPUT_SIZE: u8 = 0x86;
const REQ_GET_CRC_MODE: u8 = 0x89;
const REQ_SET_CRC_MODE: u8 = 0x8A;

const PACKET_TYPE_ALL_MULTICAST: u16 = 1 << 1;
const PACKET_TYPE_DIRECTED: u16 = 1 << 2;
const PACKET_TYPE_BROADCAST: u16 = 1 << 3;

/// Filter applied until the host programs one, and again after every
/// altsetting change.
pub(crate) const DEFAULT_FILTER: u16 =
    PACKET_TYPE_BROADCAST | PACKET_TYPE_ALL_MULTICAST | PACKET_TYPE_DIRECTED;

pub(crate) const NTB_PARAMETERS_LEN: usize = 28;

/// Host-negotiable session parameters, plus the notification latch.
pub(crate) struct SessionState {
    pub format: NtbFormat,
    pub is_crc: bool,
    pub ndp_sign: u32,
    /// Negotiated device-to-host NTB size limit (dwNtbInMaxSize bounded).
    pub in_size: u32,
    pub cdc_filter: u16,
    /// Upper Ethernet device opened by its stack.
    pub is_open: bool,
    pub notify: NotifyState,
}

impl SessionState {
    const fn new() -> Self {
        SessionState {
            format: NtbFormat::Ntb16,
            is_crc: false,
            ndp_sign: ntb::NDP16_SIGN_NOCRC,
            in_size: NTB_DEFAULT_IN_SIZE,
            cdc_filter: DEFAULT_FILTER,
            is_open: false,
            notify: NotifyState::None,
        }
    }

    /// Back to power-on framing values. Altsetting changes reset filters
    /// and sizes; link and notification state are not touched.
    fn reset(&mut self) {
        self.format = NtbFormat::Ntb16;
        self.is_crc = false;
        self.ndp_sign = ntb::NDP16_SIGN_NOCRC;
        self.in_size = NTB_DEFAULT_IN_SIZE;
        self.cdc_filter = DEFAULT_FILTER;
    }
}

/// Egress framing snapshot, taken under the lock when a new NTB opens.
#[derive(Clone, Copy)]
pub(crate) struct FramingParams {
    pub format: NtbFormat,
    pub is_crc: bool,
    pub ndp_sign: u32,
    pub in_size: u32,
}

pub(crate) struct ControlShared {
    state: Mutex<CriticalSectionRawMutex, RefCell<SessionState>>,
    /// Wakes the notifier task after `notify` was rearmed under the lock.
    pub(crate) notify_kick: Signal<CriticalSectionRawMutex, ()>,
    /// Data interface is in altsetting 1.
    connected: AtomicBool,
    pub(crate) tx_dropped: AtomicU32,
    pub(crate) rx_errors: AtomicU32,
}

impl ControlShared {
    pub(crate) const fn new() -> Self {
        ControlShared {
            state: Mutex::new(RefCell::new(SessionState::new())),
            notify_kick: Signal::new(),
            connected: AtomicBool::new(false),
            tx_dropped: AtomicU32::new(0),
            rx_errors: AtomicU32::new(0),
        }
    }

    pub(crate) fn lock<R>(&self, f: impl FnOnce(&mut SessionState) -> R) -> R {
        self.state.lock(|s| f(&mut s.borrow_mut()))
    }

    pub(crate) fn connected(&self) -> bool {
        self.connected.load(Ordering::SeqCst)
    }

    pub(crate) fn framing(&self) -> FramingParams {
        self.lock(|s| FramingParams {
            format: s.format,
            is_crc: s.is_crc,
            ndp_sign: s.ndp_sign,
            in_size: s.in_size,
        })
    }

    /// Rearm the notification machine to SPEED-first and wake the notifier.
    ///
    /// Rearming while the previous CONNECT is still unsent deliberately
    /// replays SPEED before it; hosts tolerate the repetition.
    pub(crate) fn kick_notify(&self) {
        self.lock(|s| s.notify = NotifyState::Speed);
        self.notify_kick.signal(());
    }
}

/// Data interface altsetting transition.
///
/// Any transition while the data path was active resets the negotiated
/// session values; altsetting 1 (re)activates it. Either way the host is
/// told about the link again.
pub(crate) fn data_alt_changed(shared: &ControlShared, alt: u8) {
    if shared.connected.swap(false, Ordering::SeqCst) {
        debug!("ncm data path reset");
        shared.lock(|s| s.reset());
    }
    match alt {
        ALT_SETTING_DISABLED => {}
        ALT_SETTING_ENABLED => {
            debug!("ncm data path activated");
            shared.connected.store(true, Ordering::SeqCst);
        }
        _ => unreachable!(),
    }
    shared.kick_notify();
}

/// Function/configuration teardown.
pub(crate) fn deactivate(shared: &ControlShared) {
    shared.connected.store(false, Ordering::SeqCst);
    shared.lock(|s| s.notify = NotifyState::None);
}

/// GET_NTB_PARAMETERS reply block.
fn ntb_parameters(buf: &mut [u8; NTB_PARAMETERS_LEN]) {
    ntb::put_le16(buf, 0, NTB_PARAMETERS_LEN as u16); // wLength
    ntb::put_le16(buf, 2, 1); // bmNtbFormatsSupported
    ntb::put_le32(buf, 4, NTB_DEFAULT_IN_SIZE); // dwNtbInMaxSize
    ntb::put_le16(buf, 8, ntb::NDP_IN_DIVISOR as u16);
    ntb::put_le16(buf, 10, ntb::NDP_IN_PAYLOAD_REMAINDER as u16);
    ntb::put_le16(buf, 12, ntb::NDP_IN_ALIGNMENT as u16);
    ntb::put_le16(buf, 14, 0); // wReserved
    ntb::put_le32(buf, 16, NTB_OUT_SIZE as u32); // dwNtbOutMaxSize
    ntb::put_le16(buf, 20, 4); // wNdpOutDivisor
    ntb::put_le16(buf, 22, 2); // wNdpOutPayloadRemainder
    ntb::put_le16(buf, 24, 4); // wNdpOutAlignment
    ntb::put_le16(buf, 26, 0); // wNtbOutMaxDatagrams
}

fn class_request_out(shared: &ControlShared, req: Request, data: &[u8]) -> OutResponse {
    match req.request {
        REQ_SET_NTB_INPUT_SIZE => {
            if req.value != 0 || req.length != 4 || data.len() < 4 {
                return OutResponse::Rejected;
            }
            let size = ntb::get_le32(data, 0);
            if !(NTB_MIN_IN_SIZE..=NTB_DEFAULT_IN_SIZE).contains(&size) {
                warn!("host asked for a bad NTB input size: {}", size);
                return OutResponse::Rejected;
            }
            debug!("NTB input size set to {}", size);
            shared.lock(|s| s.in_size = size);
            OutResponse::Accepted
        }
        REQ_SET_NTB_FORMAT => {
            if req.length != 0 {
                return OutResponse::Rejected;
            }
            let format = match req.value {
                0x0000 => NtbFormat::Ntb16,
                0x0001 => NtbFormat::Ntb32,
                _ => return OutResponse::Rejected,
            };
            debug!("NTB format set to {:?}", format);
            shared.lock(|s| {
                s.format = format;
                s.ndp_sign = ndp_sign(format, s.is_crc);
            });
            OutResponse::Accepted
        }
        REQ_SET_CRC_MODE => {
            if req.length != 0 {
                return OutResponse::Rejected;
            }
            let is_crc = match req.value {
                0x0000 => false,
                0x0001 => true,
                _ => return OutResponse::Rejected,
            };
            debug!("CRC mode set to {}", is_crc);
            shared.lock(|s| {
                s.is_crc = is_crc;
                s.ndp_sign = ndp_sign(s.format, is_crc);
            });
            OutResponse::Accepted
        }
        REQ_SET_ETHERNET_PACKET_FILTER => {
            if req.length != 0 {
                return OutResponse::Rejected;
            }
            debug!("packet filter {:02x}", req.value);
            shared.lock(|s| s.cdc_filter = req.value);
            OutResponse::Accepted
        }
        _ => OutResponse::Rejected,
    }
}

fn class_request_in<'a>(shared: &ControlShared, req: Request, buf: &'a mut [u8]) -> InResponse<'a> {
    match req.request {
        REQ_GET_NTB_PARAMETERS => {
            if req.value != 0 || req.length == 0 {
                return InResponse::Rejected;
            }
            let mut block = [0u8; NTB_PARAMETERS_LEN];
            ntb_parameters(&mut block);
            let n = block.len().min(req.length as usize).min(buf.len());
            buf[..n].copy_from_slice(&block[..n]);
            InResponse::Accepted(&buf[..n])
        }
        REQ_GET_NTB_INPUT_SIZE => {
            if req.value != 0 || req.length < 4 || buf.len() < 4 {
                return InResponse::Rejected;
            }
            ntb::put_le32(buf, 0, shared.lock(|s| s.in_size));
            InResponse::Accepted(&buf[..4])
        }
        REQ_GET_NTB_FORMAT => {
            if req.value != 0 || req.length < 2 || buf.len() < 2 {
                return InResponse::Rejected;
            }
            let format = match shared.lock(|s| s.format) {
                NtbFormat::Ntb16 => 0x0000,
                NtbFormat::Ntb32 => 0x0001,
            };
            ntb::put_le16(buf, 0, format);
            InResponse::Accepted(&buf[..2])
        }
        REQ_GET_CRC_MODE => {
            if req.value != 0 || req.length < 2 || buf.len() < 2 {
                return InResponse::Rejected;
            }
            let is_crc = shared.lock(|s| s.is_crc) as u16;
            ntb::put_le16(buf, 0, is_crc);
            InResponse::Accepted(&buf[..2])
        }
        _ => InResponse::Rejected,
    }
}

/// EP0 handler: class requests targeting the control interface plus the
/// data-interface altsetting reactions.
pub(crate) struct Control<'a> {
    shared: &'a ControlShared,
    comm_if: InterfaceNumber,
    data_if: InterfaceNumber,
    mac_addr_string: StringIndex,
    mac_addr_str: [u8; 12],
}

impl<'a> Control<'a> {
    pub(crate) fn new(
        shared: &'a ControlShared,
        comm_if: InterfaceNumber,
        data_if: InterfaceNumber,
        mac_addr_string: StringIndex,
        mac_address: [u8; 6],
    ) -> Self {
        const HEX: &[u8; 16] = b"0123456789ABCDEF";
        let mut mac_addr_str = [0u8; 12];
        for (i, b) in mac_address.iter().enumerate() {
            mac_addr_str[i * 2] = HEX[(b >> 4) as usize];
            mac_addr_str[i * 2 + 1] = HEX[(b & 0x0F) as usize];
        }
        Control {
            shared,
            comm_if,
            data_if,
            mac_addr_string,
            mac_addr_str,
        }
    }

    fn is_ours(&self, req: &Request) -> bool {
        (req.request_type, req.recipient) == (RequestType::Class, Recipient::Interface)
            && req.index == u8::from(self.comm_if) as u16
    }
}

impl Handler for Control<'_> {
    fn reset(&mut self) {
        deactivate(self.shared);
    }

    fn enabled(&mut self, enabled: bool) {
        if !enabled {
            deactivate(self.shared);
        }
    }

    fn configured(&mut self, configured: bool) {
        if !configured {
            deactivate(self.shared);
        }
    }

    fn set_alternate_setting(&mut self, iface: InterfaceNumber, alternate_setting: u8) {
        // The control interface only has altsetting 0 and needs no action;
        // the core already rejects anything else.
        if iface != self.data_if {
            return;
        }
        data_alt_changed(self.shared, alternate_setting);
    }

    fn control_out(&mut self, req: Request, data: &[u8]) -> Option<OutResponse> {
        if !self.is_ours(&req) {
            return None;
        }
        Some(class_request_out(self.shared, req, data))
    }

    fn control_in<'b>(&'b mut self, req: Request, buf: &'b mut [u8]) -> Option<InResponse<'b>> {
        if !self.is_ours(&req) {
            return None;
        }
        Some(class_request_in(self.shared, req, buf))
    }

    fn get_string(&mut self, index: StringIndex, _lang_id: u16) -> Option<&str> {
        if index == self.mac_addr_string {
            core::str::from_utf8(&self.mac_addr_str).ok()
        } else {
            None
        }
    }
}

/// Link hooks for the upper Ethernet glue.
///
/// `open`/`close` mirror the network device being brought up or down by its
/// stack; each rearms the SPEED → CONNECT notification pair.
pub struct LinkControl<'d> {
    pub(crate) shared: &'d ControlShared,
}

impl LinkControl<'_> {
    pub fn open(&self) {
        self.shared.lock(|s| {
            s.is_open = true;
            s.notify = NotifyState::Speed;
        });
        self.shared.notify_kick.signal(());
    }

    pub fn close(&self) {
        self.shared.lock(|s| {
            s.is_open = false;
            s.notify = NotifyState::Speed;
        });
        self.shared.notify_kick.signal(());
    }

    /// Whether the host selected the data altsetting.
    pub fn is_connected(&self) -> bool {
        self.shared.connected()
    }

    /// Current CDC Ethernet packet filter bitmap.
    pub fn packet_filter(&self) -> u16 {
        self.shared.lock(|s| s.cdc_filter)
    }
}
