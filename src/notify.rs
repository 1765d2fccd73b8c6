//! Interrupt-endpoint class notifications.
//!
//! Activation (and the upper device opening or closing) rearms a small
//! state machine that emits SPEED_CHANGE followed by NETWORK_CONNECTION.
//! One notification is in flight at a time; rearming while the CONNECT
//! half is still queued replays the pair from SPEED, which hosts accept.

use embassy_usb::driver::{Driver, EndpointError, EndpointIn};
use embassy_usb::types::InterfaceNumber;

use crate::control::ControlShared;
use crate::ntb::{put_le16, put_le32};

const NOTIFY_NETWORK_CONNECTION: u8 = 0x00;
const NOTIFY_SPEED_CHANGE: u8 = 0x2A;

/// Class-specific, interface-recipient, device-to-host.
const NOTIFY_REQUEST_TYPE: u8 = 0xA1;

/// SPEED_CHANGE is the largest notification: 8-byte header plus the
/// up/down bitrates. Sized so any notification fits one interrupt packet.
pub(crate) const NCM_STATUS_BYTECOUNT: usize = 16;

/// Which notification goes out next.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub(crate) enum NotifyState {
    None,
    /// Issue NETWORK_CONNECTION next.
    Connect,
    /// Issue SPEED_CHANGE next.
    Speed,
}

/// Bus speed the device enumerated at, for SPEED_CHANGE reporting.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum BusSpeed {
    Full,
    High,
}

/// Peak theoretical bulk transfer rate in bits per second.
pub(crate) fn ncm_bitrate(speed: BusSpeed) -> u32 {
    match speed {
        BusSpeed::High => 13 * 512 * 8 * 1000 * 8,
        BusSpeed::Full => 19 * 64 * 1000 * 8,
    }
}

fn fill_header(buf: &mut [u8], notification: u8, value: u16, ctrl_if: u8, length: u16) {
    buf[0] = NOTIFY_REQUEST_TYPE;
    buf[1] = notification;
    put_le16(buf, 2, value);
    put_le16(buf, 4, ctrl_if as u16);
    put_le16(buf, 6, length);
}

/// Fill the next pending notification, advancing the state machine.
///
/// Runs under the session lock; returns the number of bytes to queue on
/// the interrupt endpoint, or `None` when the machine is idle.
pub(crate) fn next_notification(
    shared: &ControlShared,
    ctrl_if: u8,
    bitrate: u32,
    buf: &mut [u8; NCM_STATUS_BYTECOUNT],
) -> Option<usize> {
    shared.lock(|s| match s.notify {
        NotifyState::None => None,
        NotifyState::Connect => {
            fill_header(
                buf,
                NOTIFY_NETWORK_CONNECTION,
                s.is_open as u16,
                ctrl_if,
                0,
            );
            debug!("notify connect {}", s.is_open);
            s.notify = NotifyState::None;
            Some(8)
        }
        NotifyState::Speed => {
            fill_header(buf, NOTIFY_SPEED_CHANGE, 0, ctrl_if, 8);
            // Up and down bitrates are the same on a bulk pipe.
            put_le32(buf, 8, bitrate);
            put_le32(buf, 12, bitrate);
            debug!("notify speed {}", bitrate);
            s.notify = NotifyState::Connect;
            Some(NCM_STATUS_BYTECOUNT)
        }
    })
}

/// Owns the interrupt IN endpoint and drains the notification machine.
pub struct Notifier<'d, D: Driver<'d>> {
    pub(crate) comm_ep: D::EndpointIn,
    pub(crate) shared: &'d ControlShared,
    pub(crate) ctrl_if: InterfaceNumber,
    pub(crate) bitrate: u32,
}

impl<'d, D: Driver<'d>> Notifier<'d, D> {
    /// Drive notifications forever. Spawn this alongside the data-path
    /// tasks; it sleeps until the control plane rearms the machine.
    pub async fn run(&mut self) -> ! {
        loop {
            self.shared.notify_kick.wait().await;
            self.drain().await;
        }
    }

    async fn drain(&mut self) {
        let mut buf = [0u8; NCM_STATUS_BYTECOUNT];
        while let Some(len) =
            next_notification(self.shared, u8::from(self.ctrl_if), self.bitrate, &mut buf)
        {
            match self.comm_ep.write(&buf[..len]).await {
                Ok(()) => {}
                Err(EndpointError::Disabled) => {
                    // Reset or shutdown: forget the chain, activation will
                    // rearm it.
                    self.shared.lock(|s| s.notify = NotifyState::None);
                    break;
                }
                Err(EndpointError::BufferOverflow) => unreachable!(),
            }
        }
    }
}
