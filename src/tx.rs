//! Egress: datagram aggregation into device-to-host NTBs.
//!
//! Outgoing datagrams accumulate in a pending NTB until it runs out of
//! room, hits the DPE cap, or the flush deadline fires. The block and its
//! NDP grow as two separate buffers spliced together at finalize time, so
//! datagram indices never depend on the (still unknown) NDP length.

use core::sync::atomic::Ordering;

use embassy_time::{Duration, Instant, Timer};
use embassy_usb::driver::{Driver, Endpoint, EndpointError, EndpointIn};
use heapless::Vec;

use crate::control::{ControlShared, FramingParams};
use crate::ntb::{
    align, dgram_crc, put_le16, put_le32, put_ncm, NdpOpts, NDP16_OPTS, NDP_IN_ALIGNMENT,
    NDP_IN_DIVISOR, NDP_IN_PAYLOAD_REMAINDER, NTB_DEFAULT_IN_SIZE, TX_MAX_NUM_DPE,
};

/// Egress errors.
#[derive(Debug)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum TxError {
    /// Bulk IN endpoint failed; the pending NTB was discarded.
    Endpoint(EndpointError),
    /// No room for the datagram even in a fresh NTB; it was dropped.
    Exhausted,
}

impl From<EndpointError> for TxError {
    fn from(e: EndpointError) -> Self {
        TxError::Endpoint(e)
    }
}

const BODY_CAPACITY: usize = NTB_DEFAULT_IN_SIZE as usize;
/// NDP32 header plus a full table of 32-bit DPEs; the terminator entry is
/// spliced onto the body directly.
const NDP_CAPACITY: usize = 16 + TX_MAX_NUM_DPE as usize * 8;

/// The pending NTB under construction.
///
/// `body` holds NTH + datagrams (+ padding); `ndp` holds the NDP header
/// and the DPE table. `finalize` back-patches the placeholder fields and
/// joins the two.
pub(crate) struct NtbBuilder {
    body: Vec<u8, BODY_CAPACITY>,
    ndp: Vec<u8, NDP_CAPACITY>,
    /// DPEs recorded, including the reserved zero-terminator slot.
    dgram_count: u16,
    opts: &'static NdpOpts,
    ndp_sign: u32,
    max_size: usize,
}

impl NtbBuilder {
    pub(crate) fn new() -> Self {
        NtbBuilder {
            body: Vec::new(),
            ndp: Vec::new(),
            dgram_count: 0,
            opts: &NDP16_OPTS,
            ndp_sign: 0,
            max_size: BODY_CAPACITY,
        }
    }

    pub(crate) fn is_pending(&self) -> bool {
        !self.body.is_empty()
    }

    pub(crate) fn clear(&mut self) {
        self.body.clear();
        self.ndp.clear();
        self.dgram_count = 0;
    }

    /// Conservative room estimate: current body plus worst-case datagram
    /// padding, the NDP so far, its placement padding, and two more DPEs
    /// (the new entry and the terminator).
    pub(crate) fn fits(&self, dgram_len: usize) -> bool {
        self.body.len()
            + NDP_IN_DIVISOR
            + NDP_IN_PAYLOAD_REMAINDER
            + dgram_len
            + self.ndp.len()
            + NDP_IN_ALIGNMENT
            + 2 * self.opts.dpe_size
            <= self.max_size
    }

    pub(crate) fn dpe_table_full(&self) -> bool {
        self.dgram_count > TX_MAX_NUM_DPE
    }

    /// Start a new NTB with the session's current framing parameters:
    /// NTH with placeholder lengths, padded to the datagram divisor, and
    /// an NDP holding just its signature.
    pub(crate) fn open(&mut self, params: FramingParams) -> Result<(), ()> {
        let opts = params.format.opts();
        self.opts = opts;
        self.ndp_sign = params.ndp_sign;
        self.max_size = params.in_size as usize;

        let nth_end = align(opts.nth_size, NDP_IN_DIVISOR) + NDP_IN_PAYLOAD_REMAINDER;
        self.body.resize(nth_end, 0)?;
        put_le32(&mut self.body, 0, opts.nth_sign);
        put_le16(&mut self.body, 4, opts.nth_size as u16);
        // wSequence, BlockLength and NdpIndex stay zero until finalize.

        self.ndp.resize(opts.ndp_size, 0)?;
        put_le32(&mut self.ndp, 0, self.ndp_sign);
        // The zeroed terminator entry is always accounted for.
        self.dgram_count = 1;
        Ok(())
    }

    /// Append one datagram: record its DPE, pad the body to the divisor,
    /// then copy the payload and the optional trailing CRC.
    pub(crate) fn append(&mut self, dgram: &[u8], crc: Option<u32>) -> Result<(), ()> {
        let opts = self.opts;
        let index = align(self.body.len(), NDP_IN_DIVISOR) + NDP_IN_PAYLOAD_REMAINDER;
        let recorded_len = dgram.len() + crc.map_or(0, |_| 4);

        let mut entry = [0u8; 8];
        let mut pos = 0;
        put_ncm(&mut entry, &mut pos, opts.dgram_item_len, index as u32);
        put_ncm(&mut entry, &mut pos, opts.dgram_item_len, recorded_len as u32);
        self.ndp.extend_from_slice(&entry[..pos])?;

        self.body.resize(index, 0)?;
        self.body.extend_from_slice(dgram)?;
        if let Some(crc) = crc {
            self.body.extend_from_slice(&crc.to_le_bytes())?;
        }
        self.dgram_count += 1;
        Ok(())
    }

    /// Back-patch BlockLength, NdpIndex and the NDP wLength, then splice
    /// the alignment pad, the NDP and the terminator DPE onto the body.
    /// Returns the length of the finished NTB, left in `body`.
    pub(crate) fn finalize(&mut self) -> Result<usize, ()> {
        debug_assert!(self.is_pending());
        let opts = self.opts;

        let body_len = self.body.len();
        let ndp_index = align(body_len, NDP_IN_ALIGNMENT);
        let block_len = ndp_index + self.ndp.len() + opts.dpe_size;

        let mut pos = 8;
        put_ncm(&mut self.body, &mut pos, opts.block_length, block_len as u32);
        put_ncm(&mut self.body, &mut pos, opts.ndp_index, ndp_index as u32);

        let ndp_len = opts.ndp_size + self.dgram_count as usize * opts.dpe_size;
        put_le16(&mut self.ndp, 4, ndp_len as u16);

        self.body.resize(ndp_index, 0)?;
        let ndp = &self.ndp;
        self.body.extend_from_slice(ndp)?;
        let zeros = [0u8; 8];
        self.body.extend_from_slice(&zeros[..opts.dpe_size])?;

        self.dgram_count = 0;
        Ok(self.body.len())
    }

    pub(crate) fn bytes(&self) -> &[u8] {
        &self.body
    }
}

/// Egress half: aggregates datagrams and writes finished NTBs to the
/// bulk IN endpoint.
pub struct Sender<'d, D: Driver<'d>> {
    pub(crate) write_ep: D::EndpointIn,
    pub(crate) shared: &'d ControlShared,
    pub(crate) builder: NtbBuilder,
    pub(crate) deadline: Option<Instant>,
    pub(crate) flush_timeout: Duration,
}

impl<'d, D: Driver<'d>> Sender<'d, D> {
    /// Queue one outgoing Ethernet datagram.
    ///
    /// If the pending NTB cannot take it, that NTB is transmitted first
    /// and a fresh one is opened. Each successful append restarts the
    /// flush deadline; pair this with [`Sender::flush_on_timeout`] so
    /// lone datagrams do not sit in the aggregate forever.
    pub async fn write_datagram(&mut self, dgram: &[u8]) -> Result<(), TxError> {
        let params = self.shared.framing();
        let crc = params.is_crc.then(|| dgram_crc(dgram));
        let recorded_len = dgram.len() + crc.map_or(0, |_| 4);

        if self.builder.is_pending()
            && (self.builder.dpe_table_full() || !self.builder.fits(recorded_len))
        {
            self.flush().await?;
        }

        if !self.builder.is_pending() && self.builder.open(params).is_err() {
            return self.drop_dgram();
        }
        if self.builder.append(dgram, crc).is_err() {
            return self.drop_dgram();
        }

        self.deadline = Some(Instant::now() + self.flush_timeout);
        Ok(())
    }

    /// Finalize and transmit the pending NTB, if any.
    pub async fn flush(&mut self) -> Result<(), TxError> {
        self.deadline = None;
        if !self.builder.is_pending() {
            return Ok(());
        }
        let len = match self.builder.finalize() {
            Ok(len) => len,
            Err(()) => return self.drop_dgram(),
        };
        let res = self.write_ntb(len).await;
        self.builder.clear();
        res.map_err(TxError::Endpoint)
    }

    /// Resolves once the flush deadline elapses with an NTB still pending,
    /// then transmits it. Pending forever while nothing is aggregating;
    /// meant to be raced against the next outgoing datagram.
    pub async fn flush_on_timeout(&mut self) -> Result<(), TxError> {
        match self.deadline {
            Some(deadline) => Timer::at(deadline).await,
            None => core::future::pending::<()>().await,
        }
        self.flush().await
    }

    /// Waits for the host to select the data altsetting, discarding any
    /// aggregate left over from a previous session.
    pub async fn wait_connection(&mut self) {
        self.builder.clear();
        self.deadline = None;
        self.write_ep.wait_enabled().await;
    }

    /// Datagrams dropped on the egress path since bind.
    pub fn tx_dropped(&self) -> u32 {
        self.shared.tx_dropped.load(Ordering::Relaxed)
    }

    fn drop_dgram(&mut self) -> Result<(), TxError> {
        warn!("TX datagram dropped, discarding pending NTB");
        self.builder.clear();
        self.deadline = None;
        self.shared.tx_dropped.fetch_add(1, Ordering::Relaxed);
        Err(TxError::Exhausted)
    }

    async fn write_ntb(&mut self, len: usize) -> Result<(), EndpointError> {
        let mps = self.write_ep.info().max_packet_size as usize;
        let data = &self.builder.body[..len];
        for chunk in data.chunks(mps) {
            self.write_ep.write(chunk).await?;
        }
        // NCM conformance wants a short packet to close the transfer.
        if len % mps == 0 {
            self.write_ep.write(&[]).await?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ntb::{dgram_crc, get_le16, get_le32, ndp_sign, NtbFormat};

    fn params(format: NtbFormat, is_crc: bool, in_size: u32) -> FramingParams {
        FramingParams {
            format,
            is_crc,
            ndp_sign: ndp_sign(format, is_crc),
            in_size,
        }
    }

    fn frame(len: usize) -> std::vec::Vec<u8> {
        (0..len).map(|i| i as u8).collect()
    }

    #[test]
    fn single_datagram_ntb16() {
        let mut b = NtbBuilder::new();
        b.open(params(NtbFormat::Ntb16, false, 4096)).unwrap();
        let f = frame(64);
        b.append(&f, None).unwrap();
        let len = b.finalize().unwrap();
        let ntb = b.bytes();

        assert_eq!(len, 92);
        // NTH
        assert_eq!(&ntb[0..4], b"NCMH");
        assert_eq!(get_le16(ntb, 4), 12); // wHeaderLength
        assert_eq!(get_le16(ntb, 6), 0); // wSequence
        assert_eq!(get_le16(ntb, 8), 92); // wBlockLength
        assert_eq!(get_le16(ntb, 10), 76); // wNdpIndex
        assert_eq!(76 % 4, 0);
        // Datagram right after the NTH.
        assert_eq!(&ntb[12..76], &f[..]);
        // NDP
        assert_eq!(&ntb[76..80], b"NCM0");
        assert_eq!(get_le16(ntb, 80), 16); // wLength: header + entry + terminator
        assert_eq!(get_le16(ntb, 82), 0); // wNextNdpIndex
        assert_eq!(get_le16(ntb, 84), 12); // wDatagramIndex
        assert_eq!(get_le16(ntb, 86), 64); // wDatagramLength
        // Terminator DPE.
        assert_eq!(&ntb[88..92], &[0; 4]);
    }

    #[test]
    fn ntb32_with_crc() {
        let mut b = NtbBuilder::new();
        b.open(params(NtbFormat::Ntb32, true, 4096)).unwrap();
        let f = frame(100);
        let crc = dgram_crc(&f);
        b.append(&f, Some(crc)).unwrap();
        let len = b.finalize().unwrap();
        let ntb = b.bytes();

        assert_eq!(len, 152);
        assert_eq!(&ntb[0..4], b"ncmh");
        assert_eq!(get_le16(ntb, 4), 16);
        assert_eq!(get_le32(ntb, 8), 152); // dwBlockLength
        assert_eq!(get_le32(ntb, 12), 120); // dwNdpIndex
        // Datagram plus its trailing CRC.
        assert_eq!(&ntb[16..116], &f[..]);
        assert_eq!(get_le32(ntb, 116), crc);
        // NDP
        assert_eq!(&ntb[120..124], b"ncm1");
        assert_eq!(get_le16(ntb, 124), 32); // wLength, multiple of 8
        assert_eq!(get_le32(ntb, 136), 16); // dwDatagramIndex
        assert_eq!(get_le32(ntb, 140), 104); // dwDatagramLength includes CRC
        assert_eq!(&ntb[144..152], &[0; 8]);
    }

    #[test]
    fn datagram_positions_honor_divisor() {
        let mut b = NtbBuilder::new();
        b.open(params(NtbFormat::Ntb16, false, 4096)).unwrap();
        b.append(&frame(63), None).unwrap();
        b.append(&frame(64), None).unwrap();
        let _ = b.finalize().unwrap();
        let ntb = b.bytes();

        let ndp = get_le16(ntb, 10) as usize;
        let idx0 = get_le16(ntb, ndp + 8) as usize;
        let idx1 = get_le16(ntb, ndp + 12) as usize;
        assert_eq!(idx0, 12);
        assert_eq!(idx1, 76); // 12 + 63 padded up to the divisor
        assert_eq!(idx1 % 4, 0);
        assert_eq!(ntb[idx0 + 63], 0); // pad byte
    }

    #[test]
    fn dpe_cap_closes_block_after_32_datagrams() {
        let mut b = NtbBuilder::new();
        let p = params(NtbFormat::Ntb16, false, 4096);

        let mut first_block = None;
        let mut second_block_count = 0u16;
        for i in 0..33 {
            if b.is_pending() && (b.dpe_table_full() || !b.fits(64)) {
                // The 33rd datagram forces the flush.
                assert_eq!(i, 32);
                let len = b.finalize().unwrap();
                first_block = Some((b.bytes()[..len].to_vec(), len));
                b.clear();
            }
            if !b.is_pending() {
                b.open(p).unwrap();
            }
            b.append(&frame(64), None).unwrap();
            if first_block.is_some() {
                second_block_count += 1;
            }
        }

        let (ntb, _) = first_block.expect("no flush happened");
        let ndp = get_le16(&ntb, 10) as usize;
        // 32 real entries plus the terminator.
        assert_eq!(get_le16(&ntb, ndp + 4), (8 + 33 * 4) as u16);
        assert_eq!(second_block_count, 1);
    }

    #[test]
    fn negotiated_size_limits_block() {
        let mut b = NtbBuilder::new();
        b.open(params(NtbFormat::Ntb16, false, 2048)).unwrap();
        assert!(b.fits(1500));
        b.append(&frame(1500), None).unwrap();
        assert!(!b.fits(1500));
        let len = b.finalize().unwrap();
        assert!(len <= 2048);
        assert_eq!(get_le16(b.bytes(), 8) as usize, len);
    }

    #[test]
    fn block_length_and_ndp_length_are_consistent() {
        for (format, crc) in [
            (NtbFormat::Ntb16, false),
            (NtbFormat::Ntb16, true),
            (NtbFormat::Ntb32, false),
            (NtbFormat::Ntb32, true),
        ] {
            let p = params(format, crc, 4096);
            let opts = format.opts();
            let mut b = NtbBuilder::new();
            b.open(p).unwrap();
            for len in [60, 61, 1514] {
                let f = frame(len);
                let c = crc.then(|| dgram_crc(&f));
                b.append(&f, c).unwrap();
            }
            let total = b.finalize().unwrap();
            let ntb = b.bytes();

            let mut pos = 8;
            let block = crate::ntb::get_ncm(ntb, &mut pos, opts.block_length) as usize;
            let ndp_index = crate::ntb::get_ncm(ntb, &mut pos, opts.ndp_index) as usize;
            assert_eq!(block, total);
            assert_eq!(ndp_index % NDP_IN_ALIGNMENT, 0);
            assert!(ndp_index >= opts.nth_size);

            let ndp_len = get_le16(ntb, ndp_index + 4) as usize;
            assert_eq!(ndp_len % opts.ndplen_align, 0);
            assert_eq!(ndp_len, opts.ndp_size + 4 * opts.dpe_size);
            // Terminator DPE is all zeros.
            let term = block - opts.dpe_size;
            assert!(ntb[term..block].iter().all(|&x| x == 0));
        }
    }
}
