//! CDC-NCM (Network Control Model) function class for `embassy-usb`.
//!
//! NCM carries Ethernet frames over USB, batching several datagrams into
//! one bulk transfer (an NTB) to cut per-transfer overhead on high-speed
//! links. This crate implements the device side: NTB aggregation and
//! unpacking in both the 16- and 32-bit framings, per-datagram CRC mode,
//! the class control requests that negotiate them, and the
//! SPEED_CHANGE/NETWORK_CONNECTION notifications.
//!
//! Add the function to an [`embassy_usb::Builder`] and split it:
//!
//! ```ignore
//! let class = CdcNcmClass::new(&mut builder, &mut state, Config::new(mac), 64);
//! let (mut tx, mut rx, mut notifier, link) = class.split();
//! ```
//!
//! `tx`/`rx` move datagrams, `notifier.run()` is spawned as its own task,
//! and `link` is handed to the upper Ethernet glue for open/close events.
//! The egress pump races the next outgoing datagram against
//! [`Sender::flush_on_timeout`] so a quiet link still flushes its last
//! aggregate.

#![cfg_attr(not(test), no_std)]

// This mod MUST go first, so that the others see its macros.
pub(crate) mod fmt;

mod control;
mod notify;
mod ntb;
mod rx;
mod tx;

use core::mem::MaybeUninit;

use embassy_time::Duration;
use embassy_usb::driver::Driver;
use embassy_usb::types::InterfaceNumber;
use embassy_usb::Builder;

use crate::control::{Control, ControlShared};
use crate::notify::{ncm_bitrate, NCM_STATUS_BYTECOUNT};
use crate::tx::NtbBuilder;

pub use crate::control::LinkControl;
pub use crate::notify::{BusSpeed, Notifier};
pub use crate::ntb::{
    NtbFormat, NTB_DEFAULT_IN_SIZE, NTB_MIN_IN_SIZE, NTB_OUT_SIZE, TX_MAX_NUM_DPE,
};
pub use crate::rx::{InvalidNtb, Receiver, RxError};
pub use crate::tx::{Sender, TxError};

/// This should be used as `device_class` when building the `UsbDevice`.
pub const USB_CLASS_CDC: u8 = 0x02;

const USB_CLASS_CDC_DATA: u8 = 0x0a;
const CDC_SUBCLASS_NCM: u8 = 0x0d;

const CDC_PROTOCOL_NONE: u8 = 0x00;
const CDC_PROTOCOL_NTB: u8 = 0x01;

const CS_INTERFACE: u8 = 0x24;
const CDC_TYPE_HEADER: u8 = 0x00;
const CDC_TYPE_UNION: u8 = 0x06;
const CDC_TYPE_ETHERNET: u8 = 0x0F;
const CDC_TYPE_NCM: u8 = 0x1A;

/// bmNetworkCapabilities: SetEthernetPacketFilter and CRC mode.
const NCAPS: u8 = (1 << 0) | (1 << 4);

const NOTIF_POLL_INTERVAL_MS: u8 = 32;

pub(crate) const ALT_SETTING_DISABLED: u8 = 0x00;
pub(crate) const ALT_SETTING_ENABLED: u8 = 0x01;

/// NCM function configuration.
#[derive(Clone, Copy)]
pub struct Config {
    /// MAC address the host side of the link uses, exported through the
    /// Ethernet functional descriptor as 12 hex digits.
    pub mac_address: [u8; 6],
    /// How long a pending NTB may wait for more datagrams before
    /// [`Sender::flush_on_timeout`] pushes it out.
    pub tx_flush_timeout: Duration,
    /// Bus speed reported in SPEED_CHANGE notifications.
    pub bus_speed: BusSpeed,
}

impl Config {
    pub fn new(mac_address: [u8; 6]) -> Self {
        Config {
            mac_address,
            tx_flush_timeout: Duration::from_micros(300),
            bus_speed: BusSpeed::High,
        }
    }
}

/// Internal state for the class; lives as long as the USB device.
pub struct State<'a> {
    control: MaybeUninit<Control<'a>>,
    shared: ControlShared,
}

impl<'a> State<'a> {
    pub fn new() -> Self {
        State {
            control: MaybeUninit::uninit(),
            shared: ControlShared::new(),
        }
    }
}

impl<'a> Default for State<'a> {
    fn default() -> Self {
        Self::new()
    }
}

/// A CDC-NCM function on a USB device.
pub struct CdcNcmClass<'d, D: Driver<'d>> {
    comm_if: InterfaceNumber,
    comm_ep: D::EndpointIn,

    data_if: InterfaceNumber,
    read_ep: D::EndpointOut,
    write_ep: D::EndpointIn,

    shared: &'d ControlShared,
    tx_flush_timeout: Duration,
    bitrate: u32,
}

impl<'d, D: Driver<'d>> CdcNcmClass<'d, D> {
    /// Add a CDC-NCM function to `builder`. `max_packet_size` is the bulk
    /// endpoint size: 64 for full speed, 512 for high speed.
    pub fn new(
        builder: &mut Builder<'d, D>,
        state: &'d mut State<'d>,
        config: Config,
        max_packet_size: u16,
    ) -> Self {
        let mut func = builder.function(USB_CLASS_CDC, CDC_SUBCLASS_NCM, CDC_PROTOCOL_NONE);

        // Control interface.
        let mut iface = func.interface();
        let comm_if = iface.interface_number();
        let mac_addr_string = iface.string();
        let mut alt = iface.alt_setting(USB_CLASS_CDC, CDC_SUBCLASS_NCM, CDC_PROTOCOL_NONE, None);

        alt.descriptor(
            CS_INTERFACE,
            &[
                CDC_TYPE_HEADER, // bDescriptorSubtype
                0x10,
                0x01, // bcdCDC (1.10)
            ],
        );
        alt.descriptor(
            CS_INTERFACE,
            &[
                CDC_TYPE_UNION,        // bDescriptorSubtype
                comm_if.into(),        // bControlInterface
                u8::from(comm_if) + 1, // bSubordinateInterface
            ],
        );
        alt.descriptor(
            CS_INTERFACE,
            &[
                CDC_TYPE_ETHERNET,         // bDescriptorSubtype
                mac_addr_string.into(),    // iMACAddress
                0,                         // bmEthernetStatistics
                0,                         // |
                0,                         // |
                0,                         // |
                0xea,                      // wMaxSegmentSize = 1514
                0x05,                      // |
                0,                         // wNumberMCFilters
                0,                         // |
                0,                         // bNumberPowerFilters
            ],
        );
        alt.descriptor(
            CS_INTERFACE,
            &[
                CDC_TYPE_NCM, // bDescriptorSubtype
                0x00,         // bcdNcmVersion (1.00)
                0x01,         // |
                NCAPS,        // bmNetworkCapabilities
            ],
        );

        let comm_ep =
            alt.endpoint_interrupt_in(NCM_STATUS_BYTECOUNT as u16, NOTIF_POLL_INTERVAL_MS);

        // Data interface: altsetting 0 carries no endpoints, altsetting 1
        // the two bulk pipes.
        let mut iface = func.interface();
        let data_if = iface.interface_number();
        let _alt = iface.alt_setting(USB_CLASS_CDC_DATA, 0x00, CDC_PROTOCOL_NTB, None);
        let mut alt = iface.alt_setting(USB_CLASS_CDC_DATA, 0x00, CDC_PROTOCOL_NTB, None);
        let read_ep = alt.endpoint_bulk_out(max_packet_size);
        let write_ep = alt.endpoint_bulk_in(max_packet_size);

        drop(func);

        let control = state.control.write(Control::new(
            &state.shared,
            comm_if,
            data_if,
            mac_addr_string,
            config.mac_address,
        ));
        builder.handler(control);

        CdcNcmClass {
            comm_if,
            comm_ep,
            data_if,
            read_ep,
            write_ep,
            shared: &state.shared,
            tx_flush_timeout: config.tx_flush_timeout,
            bitrate: ncm_bitrate(config.bus_speed),
        }
    }

    /// The data interface number, e.g. for host-side matching.
    pub fn data_interface(&self) -> u8 {
        self.data_if.into()
    }

    /// Split into the independently driven parts: egress, ingress, the
    /// notification task and the link hooks for the upper Ethernet glue.
    pub fn split(
        self,
    ) -> (
        Sender<'d, D>,
        Receiver<'d, D>,
        Notifier<'d, D>,
        LinkControl<'d>,
    ) {
        (
            Sender {
                write_ep: self.write_ep,
                shared: self.shared,
                builder: NtbBuilder::new(),
                deadline: None,
                flush_timeout: self.tx_flush_timeout,
            },
            Receiver {
                read_ep: self.read_ep,
                shared: self.shared,
                ntb: [0; NTB_OUT_SIZE],
                opts: NtbFormat::Ntb16.opts(),
                crc_len: 0,
                next_dpe: 0,
                dgrams_left: 0,
            },
            Notifier {
                comm_ep: self.comm_ep,
                shared: self.shared,
                ctrl_if: self.comm_if,
                bitrate: self.bitrate,
            },
            LinkControl {
                shared: self.shared,
            },
        )
    }
}
