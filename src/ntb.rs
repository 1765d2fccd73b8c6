//! NTB (NCM Transfer Block) wire format.
//!
//! NCM defines two block layouts, NTB16 and NTB32: in NTB16 offsets and
//! sizes are one 16-bit word wide, in NTB32 two words. Signatures differ as
//! well. The differences live in [`NdpOpts`] records so the framing code is
//! shared; the active record is selected by the host via SET_NTB_FORMAT.

use crc::{Crc, CRC_32_ISO_HDLC};

/// Default device-to-host NTB size, also advertised as dwNtbInMaxSize.
pub const NTB_DEFAULT_IN_SIZE: u32 = 4096;
/// Smallest IN NTB size a host may negotiate (NCM 6.2.7).
pub const NTB_MIN_IN_SIZE: u32 = 2048;
/// Advertised host-to-device NTB size limit (dwNtbOutMaxSize).
pub const NTB_OUT_SIZE: usize = 16384;

/// Datagrams admitted into one IN NTB; the zero terminator entry is extra.
pub const TX_MAX_NUM_DPE: u16 = 32;

/// Datagram placement policy for device-to-host NTBs, advertised in the
/// NTB parameter block and honored by the egress aggregator.
pub(crate) const NDP_IN_DIVISOR: usize = 4;
pub(crate) const NDP_IN_PAYLOAD_REMAINDER: usize = 0;
pub(crate) const NDP_IN_ALIGNMENT: usize = 4;

/// Smallest meaningful datagram: an Ethernet header.
pub(crate) const ETH_HLEN: usize = 14;

pub(crate) const NTH16_SIGN: u32 = 0x484d_434e; // "NCMH"
pub(crate) const NTH32_SIGN: u32 = 0x686d_636e; // "ncmh"
pub(crate) const NDP16_SIGN_NOCRC: u32 = 0x304d_434e; // "NCM0"
pub(crate) const NDP32_SIGN_NOCRC: u32 = 0x306d_636e; // "ncm0"

/// Flag spliced into the NDP signature when per-datagram CRC is on,
/// turning the trailing '0' into '1' ("NCM1"/"ncm1").
pub(crate) const NDP_SIGN_CRC_FLAG: u32 = 0x0100_0000;

/// Per-format framing parameters.
///
/// Field widths are in 16-bit words, matching how the codec consumes them.
pub(crate) struct NdpOpts {
    pub nth_sign: u32,
    /// NDP signature without the CRC flag; see [`ndp_sign`].
    pub ndp_sign: u32,
    pub nth_size: usize,
    pub ndp_size: usize,
    pub dpe_size: usize,
    pub ndplen_align: usize,
    /// Width of one datagram index or length item.
    pub dgram_item_len: usize,
    pub block_length: usize,
    pub ndp_index: usize,
    /// Reserved words between wLength and the next-NDP field.
    pub reserved1: usize,
    pub next_ndp_index: usize,
    /// Reserved words after the next-NDP field.
    pub reserved2: usize,
}

pub(crate) static NDP16_OPTS: NdpOpts = NdpOpts {
    nth_sign: NTH16_SIGN,
    ndp_sign: NDP16_SIGN_NOCRC,
    nth_size: 12,
    ndp_size: 8,
    dpe_size: 4,
    ndplen_align: 4,
    dgram_item_len: 1,
    block_length: 1,
    ndp_index: 1,
    reserved1: 0,
    next_ndp_index: 1,
    reserved2: 0,
};

pub(crate) static NDP32_OPTS: NdpOpts = NdpOpts {
    nth_sign: NTH32_SIGN,
    ndp_sign: NDP32_SIGN_NOCRC,
    nth_size: 16,
    ndp_size: 16,
    dpe_size: 8,
    ndplen_align: 8,
    dgram_item_len: 2,
    block_length: 2,
    ndp_index: 2,
    reserved1: 1,
    next_ndp_index: 2,
    reserved2: 2,
};

/// NTB layout negotiated with SET_NTB_FORMAT.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum NtbFormat {
    /// 16-bit offsets and sizes.
    Ntb16,
    /// 32-bit offsets and sizes.
    Ntb32,
}

impl NtbFormat {
    pub(crate) fn opts(self) -> &'static NdpOpts {
        match self {
            NtbFormat::Ntb16 => &NDP16_OPTS,
            NtbFormat::Ntb32 => &NDP32_OPTS,
        }
    }
}

/// NDP signature for a format and CRC mode.
pub(crate) fn ndp_sign(format: NtbFormat, is_crc: bool) -> u32 {
    let base = format.opts().ndp_sign;
    if is_crc {
        base | NDP_SIGN_CRC_FLAG
    } else {
        base
    }
}

/// Writes an NCM field of `width` 16-bit words at `*pos`, advancing it.
///
/// Widths other than 1 and 2 are a bug in the caller.
pub(crate) fn put_ncm(buf: &mut [u8], pos: &mut usize, width: usize, val: u32) {
    match width {
        1 => buf[*pos..*pos + 2].copy_from_slice(&(val as u16).to_le_bytes()),
        2 => buf[*pos..*pos + 4].copy_from_slice(&val.to_le_bytes()),
        _ => panic!("bad NCM field width"),
    }
    *pos += 2 * width;
}

/// Reads an NCM field of `width` 16-bit words at `*pos`, advancing it.
pub(crate) fn get_ncm(buf: &[u8], pos: &mut usize, width: usize) -> u32 {
    let val = match width {
        1 => get_le16(buf, *pos) as u32,
        2 => get_le32(buf, *pos),
        _ => panic!("bad NCM field width"),
    };
    *pos += 2 * width;
    val
}

pub(crate) fn get_le16(buf: &[u8], pos: usize) -> u16 {
    u16::from_le_bytes([buf[pos], buf[pos + 1]])
}

pub(crate) fn get_le32(buf: &[u8], pos: usize) -> u32 {
    u32::from_le_bytes([buf[pos], buf[pos + 1], buf[pos + 2], buf[pos + 3]])
}

pub(crate) fn put_le16(buf: &mut [u8], pos: usize, val: u16) {
    buf[pos..pos + 2].copy_from_slice(&val.to_le_bytes());
}

pub(crate) fn put_le32(buf: &mut [u8], pos: usize, val: u32) {
    buf[pos..pos + 4].copy_from_slice(&val.to_le_bytes());
}

const CRC_ETHERNET: Crc<u32> = Crc::<u32>::new(&CRC_32_ISO_HDLC);

/// Ethernet FCS over a datagram payload, appended (and checked)
/// little-endian when CRC mode is on.
pub(crate) fn dgram_crc(data: &[u8]) -> u32 {
    CRC_ETHERNET.checksum(data)
}

/// Round `len` up to a multiple of `align`.
pub(crate) fn align(len: usize, align: usize) -> usize {
    (len + align - 1) / align * align
}
