//! Ingress: validation and unpacking of host-to-device NTBs.
//!
//! A received block is checked in full before anything is handed out, so
//! a malformed NTB never yields a partial batch: it is dropped whole and
//! counted, and the host's upper layers retransmit.

use core::sync::atomic::Ordering;

use embassy_usb::driver::{Driver, Endpoint, EndpointError, EndpointOut};

use crate::control::ControlShared;
use crate::ntb::{dgram_crc, get_le16, get_le32, get_ncm, NdpOpts, ETH_HLEN, NTB_OUT_SIZE};

/// Why an inbound NTB was rejected.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum InvalidNtb {
    /// Transfer shorter than the transfer header.
    Truncated,
    NthSignature,
    HeaderLength,
    BlockLength,
    NdpIndex,
    NdpSignature,
    NdpLength,
    DatagramLength,
    DatagramBounds,
    DatagramCrc,
}

/// Ingress errors.
#[derive(Debug)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum RxError {
    /// Bulk OUT endpoint failed.
    Endpoint(EndpointError),
    /// The NTB was malformed and has been dropped.
    Protocol(InvalidNtb),
    /// The caller's buffer cannot hold the next datagram.
    BufferTooSmall,
}

impl From<EndpointError> for RxError {
    fn from(e: EndpointError) -> Self {
        RxError::Endpoint(e)
    }
}

/// Result of validating an NTB: where the DPE table starts and how many
/// real datagrams it carries.
pub(crate) struct NtbScan {
    pub dpe_offset: usize,
    pub dgram_count: usize,
}

/// Full validation pass over one received NTB (NCM 3.2/3.3.1).
pub(crate) fn validate_ntb(
    ntb: &[u8],
    opts: &'static NdpOpts,
    ndp_sign: u32,
    is_crc: bool,
) -> Result<NtbScan, InvalidNtb> {
    let crc_len = if is_crc { 4 } else { 0 };

    if ntb.len() < opts.nth_size {
        return Err(InvalidNtb::Truncated);
    }
    if get_le32(ntb, 0) != opts.nth_sign {
        return Err(InvalidNtb::NthSignature);
    }
    if get_le16(ntb, 4) as usize != opts.nth_size {
        return Err(InvalidNtb::HeaderLength);
    }
    // wSequence is ignored.
    let mut pos = 8;
    let block_len = get_ncm(ntb, &mut pos, opts.block_length) as usize;
    if block_len > NTB_OUT_SIZE {
        return Err(InvalidNtb::BlockLength);
    }

    let index = get_ncm(ntb, &mut pos, opts.ndp_index) as usize;
    if index == 0 || index % 4 != 0 || index < opts.nth_size {
        return Err(InvalidNtb::NdpIndex);
    }
    if index + opts.ndp_size > ntb.len() {
        return Err(InvalidNtb::NdpIndex);
    }

    if get_le32(ntb, index) != ndp_sign {
        return Err(InvalidNtb::NdpSignature);
    }
    let ndp_len = get_le16(ntb, index + 4) as usize;
    // Minimum is the header, one real entry and the terminator.
    if ndp_len < opts.ndp_size + 2 * opts.dpe_size || ndp_len % opts.ndplen_align != 0 {
        return Err(InvalidNtb::NdpLength);
    }
    if index + ndp_len > ntb.len() {
        return Err(InvalidNtb::NdpLength);
    }

    // Skip the reserved and next-NDP fields; chained NDPs are not used.
    let mut pos = index + 6;
    pos += 2 * (opts.reserved1 + opts.next_ndp_index + opts.reserved2);
    let dpe_offset = pos;
    // The last slot the length admits is left to the terminator.
    let max_entries = (ndp_len - opts.ndp_size) / opts.dpe_size;
    let mut count = 0;
    while count < max_entries - 1 {
        let dg_index = get_ncm(ntb, &mut pos, opts.dgram_item_len) as usize;
        let dg_len = get_ncm(ntb, &mut pos, opts.dgram_item_len) as usize;
        if dg_index == 0 || dg_len == 0 {
            // Terminator; an NTB with no datagrams at all is nonsense.
            if count == 0 {
                return Err(InvalidNtb::DatagramLength);
            }
            break;
        }
        if dg_len < ETH_HLEN + crc_len {
            return Err(InvalidNtb::DatagramLength);
        }
        if dg_index + dg_len > ntb.len() {
            return Err(InvalidNtb::DatagramBounds);
        }
        if is_crc {
            let stored = get_le32(ntb, dg_index + dg_len - 4);
            if stored != dgram_crc(&ntb[dg_index..dg_index + dg_len - 4]) {
                return Err(InvalidNtb::DatagramCrc);
            }
        }
        count += 1;
    }

    Ok(NtbScan {
        dpe_offset,
        dgram_count: count,
    })
}

/// Ingress half: reads NTBs from the bulk OUT endpoint and hands out the
/// contained datagrams one at a time, in DPE order.
pub struct Receiver<'d, D: Driver<'d>> {
    pub(crate) read_ep: D::EndpointOut,
    pub(crate) shared: &'d ControlShared,
    pub(crate) ntb: [u8; NTB_OUT_SIZE],
    pub(crate) opts: &'static NdpOpts,
    pub(crate) crc_len: usize,
    pub(crate) next_dpe: usize,
    pub(crate) dgrams_left: usize,
}

impl<'d, D: Driver<'d>> Receiver<'d, D> {
    /// Copy the next received datagram (CRC stripped) into `buf`.
    ///
    /// Reads and validates a whole new NTB from the endpoint when the
    /// previous one is exhausted. A [`RxError::Protocol`] error means one
    /// NTB was dropped; the next call reads fresh data.
    pub async fn read_packet(&mut self, buf: &mut [u8]) -> Result<usize, RxError> {
        while self.dgrams_left == 0 {
            self.read_ntb().await?;
        }

        let mut pos = self.next_dpe;
        let dg_index = get_ncm(&self.ntb, &mut pos, self.opts.dgram_item_len) as usize;
        let dg_len = get_ncm(&self.ntb, &mut pos, self.opts.dgram_item_len) as usize;
        let payload = dg_len - self.crc_len;
        if buf.len() < payload {
            // The NTB was already validated; drop only this datagram.
            self.next_dpe = pos;
            self.dgrams_left -= 1;
            return Err(RxError::BufferTooSmall);
        }
        buf[..payload].copy_from_slice(&self.ntb[dg_index..dg_index + payload]);
        self.next_dpe = pos;
        self.dgrams_left -= 1;
        Ok(payload)
    }

    /// Waits for the host to select the data altsetting, discarding any
    /// partially consumed NTB from a previous session.
    pub async fn wait_connection(&mut self) {
        self.dgrams_left = 0;
        self.next_dpe = 0;
        self.read_ep.wait_enabled().await;
    }

    /// NTBs rejected on the ingress path since bind.
    pub fn rx_errors(&self) -> u32 {
        self.shared.rx_errors.load(Ordering::Relaxed)
    }

    async fn read_ntb(&mut self) -> Result<(), RxError> {
        let mps = self.read_ep.info().max_packet_size as usize;
        let mut pos = 0;
        loop {
            let n = self.read_ep.read(&mut self.ntb[pos..]).await?;
            pos += n;
            if n < mps || pos == self.ntb.len() {
                break;
            }
        }

        let params = self.shared.framing();
        let opts = params.format.opts();
        match validate_ntb(&self.ntb[..pos], opts, params.ndp_sign, params.is_crc) {
            Ok(scan) => {
                self.opts = opts;
                self.crc_len = if params.is_crc { 4 } else { 0 };
                self.next_dpe = scan.dpe_offset;
                self.dgrams_left = scan.dgram_count;
                Ok(())
            }
            Err(reason) => {
                warn!("dropping invalid NTB: {:?}", reason);
                self.shared.rx_errors.fetch_add(1, Ordering::Relaxed);
                Err(RxError::Protocol(reason))
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::control::FramingParams;
    use crate::ntb::{ndp_sign, put_le16, NtbFormat};
    use crate::tx::NtbBuilder;

    fn params(format: NtbFormat, is_crc: bool) -> FramingParams {
        FramingParams {
            format,
            is_crc,
            ndp_sign: ndp_sign(format, is_crc),
            in_size: 4096,
        }
    }

    fn frame(len: usize, seed: u8) -> std::vec::Vec<u8> {
        (0..len).map(|i| (i as u8).wrapping_add(seed)).collect()
    }

    /// Wrap `frames` into one NTB with the egress builder.
    fn build_ntb(format: NtbFormat, is_crc: bool, frames: &[std::vec::Vec<u8>]) -> std::vec::Vec<u8> {
        let mut b = NtbBuilder::new();
        b.open(params(format, is_crc)).unwrap();
        for f in frames {
            let crc = is_crc.then(|| dgram_crc(f));
            b.append(f, crc).unwrap();
        }
        let len = b.finalize().unwrap();
        b.bytes()[..len].to_vec()
    }

    /// Validate and collect every datagram, CRC stripped.
    fn unwrap_all(
        ntb: &[u8],
        format: NtbFormat,
        is_crc: bool,
    ) -> Result<std::vec::Vec<std::vec::Vec<u8>>, InvalidNtb> {
        let opts = format.opts();
        let scan = validate_ntb(ntb, opts, ndp_sign(format, is_crc), is_crc)?;
        let crc_len = if is_crc { 4 } else { 0 };
        let mut out = std::vec::Vec::new();
        let mut pos = scan.dpe_offset;
        for _ in 0..scan.dgram_count {
            let i = get_ncm(ntb, &mut pos, opts.dgram_item_len) as usize;
            let l = get_ncm(ntb, &mut pos, opts.dgram_item_len) as usize;
            out.push(ntb[i..i + l - crc_len].to_vec());
        }
        Ok(out)
    }

    #[test]
    fn round_trip_ntb16() {
        let frames = [frame(64, 1), frame(333, 2), frame(1514, 3)];
        let ntb = build_ntb(NtbFormat::Ntb16, false, &frames);
        let out = unwrap_all(&ntb, NtbFormat::Ntb16, false).unwrap();
        assert_eq!(out, frames);
    }

    #[test]
    fn round_trip_ntb32_with_crc() {
        let frames = [frame(100, 7), frame(61, 9)];
        let ntb = build_ntb(NtbFormat::Ntb32, true, &frames);
        let out = unwrap_all(&ntb, NtbFormat::Ntb32, true).unwrap();
        assert_eq!(out, frames);
    }

    #[test]
    fn wrong_header_length_rejects_whole_ntb() {
        let mut ntb = build_ntb(NtbFormat::Ntb16, false, &[frame(64, 0)]);
        put_le16(&mut ntb, 4, 13);
        assert_eq!(
            unwrap_all(&ntb, NtbFormat::Ntb16, false),
            Err(InvalidNtb::HeaderLength)
        );
    }

    #[test]
    fn wrong_nth_signature() {
        let mut ntb = build_ntb(NtbFormat::Ntb16, false, &[frame(64, 0)]);
        ntb[0] ^= 0xFF;
        assert_eq!(
            unwrap_all(&ntb, NtbFormat::Ntb16, false),
            Err(InvalidNtb::NthSignature)
        );
        // An NTB32 block under an NTB16 session fails the same way.
        let ntb = build_ntb(NtbFormat::Ntb32, false, &[frame(64, 0)]);
        assert_eq!(
            unwrap_all(&ntb, NtbFormat::Ntb16, false),
            Err(InvalidNtb::NthSignature)
        );
    }

    #[test]
    fn oversized_block_length() {
        let mut ntb = build_ntb(NtbFormat::Ntb16, false, &[frame(64, 0)]);
        put_le16(&mut ntb, 8, 0xFFFF);
        assert_eq!(
            unwrap_all(&ntb, NtbFormat::Ntb16, false),
            Err(InvalidNtb::BlockLength)
        );
    }

    #[test]
    fn bad_ndp_index() {
        for bad in [0u16, 2, 6, 8] {
            // Zero, misaligned, or pointing inside the header.
            let mut ntb = build_ntb(NtbFormat::Ntb16, false, &[frame(64, 0)]);
            put_le16(&mut ntb, 10, bad);
            assert_eq!(
                unwrap_all(&ntb, NtbFormat::Ntb16, false),
                Err(InvalidNtb::NdpIndex)
            );
        }
        // Pointing past the end of the transfer.
        let mut ntb = build_ntb(NtbFormat::Ntb16, false, &[frame(64, 0)]);
        put_le16(&mut ntb, 10, 4096);
        assert_eq!(
            unwrap_all(&ntb, NtbFormat::Ntb16, false),
            Err(InvalidNtb::NdpIndex)
        );
    }

    #[test]
    fn ndp_signature_tracks_crc_mode() {
        // Built without CRC, parsed by a session expecting CRC.
        let ntb = build_ntb(NtbFormat::Ntb16, false, &[frame(64, 0)]);
        assert_eq!(
            unwrap_all(&ntb, NtbFormat::Ntb16, true),
            Err(InvalidNtb::NdpSignature)
        );
    }

    #[test]
    fn bad_ndp_length() {
        let ntb = build_ntb(NtbFormat::Ntb16, false, &[frame(64, 0)]);
        let ndp = get_le16(&ntb, 10) as usize;

        // Too short to hold an entry plus the terminator.
        let mut t = ntb.clone();
        put_le16(&mut t, ndp + 4, 12);
        assert_eq!(
            unwrap_all(&t, NtbFormat::Ntb16, false),
            Err(InvalidNtb::NdpLength)
        );

        // Not a multiple of the NDP length alignment.
        let mut t = ntb.clone();
        put_le16(&mut t, ndp + 4, 18);
        assert_eq!(
            unwrap_all(&t, NtbFormat::Ntb16, false),
            Err(InvalidNtb::NdpLength)
        );

        // Running past the end of the transfer.
        let mut t = ntb.clone();
        put_le16(&mut t, ndp + 4, 512);
        assert_eq!(
            unwrap_all(&t, NtbFormat::Ntb16, false),
            Err(InvalidNtb::NdpLength)
        );
    }

    #[test]
    fn runt_datagram() {
        let ntb = build_ntb(NtbFormat::Ntb16, false, &[frame(64, 0)]);
        let ndp = get_le16(&ntb, 10) as usize;
        let mut t = ntb.clone();
        put_le16(&mut t, ndp + 10, 13); // wDatagramLength below an Ethernet header
        assert_eq!(
            unwrap_all(&t, NtbFormat::Ntb16, false),
            Err(InvalidNtb::DatagramLength)
        );
    }

    #[test]
    fn empty_dpe_table() {
        let ntb = build_ntb(NtbFormat::Ntb16, false, &[frame(64, 0)]);
        let ndp = get_le16(&ntb, 10) as usize;
        let mut t = ntb.clone();
        // First entry zeroed: the block claims to carry nothing.
        put_le16(&mut t, ndp + 8, 0);
        put_le16(&mut t, ndp + 10, 0);
        assert_eq!(
            unwrap_all(&t, NtbFormat::Ntb16, false),
            Err(InvalidNtb::DatagramLength)
        );
    }

    #[test]
    fn datagram_out_of_bounds() {
        let ntb = build_ntb(NtbFormat::Ntb16, false, &[frame(64, 0)]);
        let ndp = get_le16(&ntb, 10) as usize;
        let mut t = ntb.clone();
        let len = (t.len() - 8) as u16;
        put_le16(&mut t, ndp + 8, len);
        assert_eq!(
            unwrap_all(&t, NtbFormat::Ntb16, false),
            Err(InvalidNtb::DatagramBounds)
        );
    }

    #[test]
    fn corrupted_crc() {
        let frames = [frame(100, 4)];
        let mut ntb = build_ntb(NtbFormat::Ntb16, true, &frames);
        // Flip one payload byte; the stored CRC no longer matches.
        ntb[20] ^= 0x01;
        assert_eq!(
            unwrap_all(&ntb, NtbFormat::Ntb16, true),
            Err(InvalidNtb::DatagramCrc)
        );
    }

    #[test]
    fn truncated_transfer() {
        assert_eq!(
            unwrap_all(&[0u8; 4], NtbFormat::Ntb16, false),
            Err(InvalidNtb::Truncated)
        );
    }

    #[test]
    fn terminator_mid_table_stops_enumeration() {
        let frames = [frame(64, 1), frame(64, 2), frame(64, 3)];
        let ntb = build_ntb(NtbFormat::Ntb16, false, &frames);
        let ndp = get_le16(&ntb, 10) as usize;
        let mut t = ntb.clone();
        // Zero the second entry: only the first datagram remains visible.
        put_le16(&mut t, ndp + 12, 0);
        put_le16(&mut t, ndp + 14, 0);
        let out = unwrap_all(&t, NtbFormat::Ntb16, false).unwrap();
        assert_eq!(out.len(), 1);
        assert_eq!(out[0], frames[0]);
    }
}
