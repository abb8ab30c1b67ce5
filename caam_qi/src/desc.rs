//! Shared descriptors, the DMA-visible descriptor buffer and accelerator
//! status words.
//!
//! A request queue's context-A points at an [`HwDesc`]: a two-word
//! preheader followed by the shared descriptor the accelerator runs for
//! every frame on that queue.

use crate::error::{Error, Result};

/// Capacity of the descriptor buffer, in 32-bit words.
pub const MAX_SDLEN: usize = 53;

/// Descriptor length field of a header word.
pub const HDR_JD_LENGTH_MASK: u32 = 0x7f;

/// Shared descriptor header command.
pub const CMD_SHARED_DESC_HDR: u32 = 0x17 << 27;

/// Mandatory one bit of every header.
pub const HDR_ONE: u32 = 1 << 23;

/// Preheader: reuse the shared descriptor loaded for the previous frame.
pub const PREHDR_RSLS: u32 = 1 << 31;

/// Preheader shared descriptor length field.
pub const PREHDR_SDLEN_MASK: u32 = 0x7f;

// =============================================================================
// Status Words
// =============================================================================

/// Status source field.
pub const JRSTA_SSRC_MASK: u32 = 0xf000_0000;
/// Status source: CCB error.
pub const JRSTA_SSRC_CCB_ERROR: u32 = 0x2000_0000;
/// CCB error id field.
pub const JRSTA_CCBERR_ERRID_MASK: u32 = 0x000f;
/// CCB error id: ICV check failed.
pub const JRSTA_CCBERR_ERRID_ICVCHK: u32 = 0x000a;

/// Status of an authenticated decryption whose ICV did not match.
pub const STATUS_ICV_FAILURE: u32 = JRSTA_SSRC_CCB_ERROR | JRSTA_CCBERR_ERRID_ICVCHK;

/// Whether `status` is an ICV check failure, which is an expected outcome of
/// authenticated decryption rather than a device fault.
pub fn is_icv_failure(status: u32) -> bool {
    status & JRSTA_SSRC_MASK == JRSTA_SSRC_CCB_ERROR
        && status & JRSTA_CCBERR_ERRID_MASK == JRSTA_CCBERR_ERRID_ICVCHK
}

// =============================================================================
// Shared Descriptor
// =============================================================================

/// Validated shared descriptor: a header word carrying the total length
/// followed by the body.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SharedDesc {
    words: Vec<u32>,
}

impl SharedDesc {
    /// Build a descriptor from its body, prefixing a shared descriptor
    /// header.
    pub fn new(body: &[u32]) -> Result<Self> {
        let len = body.len() + 1;
        let hdr_len = u32::try_from(len)
            .ok()
            .filter(|&l| l <= HDR_JD_LENGTH_MASK)
            .ok_or(Error::InvalidDescriptor { words: len })?;
        let mut words = Vec::with_capacity(len);
        words.push(CMD_SHARED_DESC_HDR | HDR_ONE | hdr_len);
        words.extend_from_slice(body);
        Ok(Self { words })
    }

    /// Wrap raw descriptor words. The header length must cover exactly the
    /// given words.
    pub fn from_words(words: Vec<u32>) -> Result<Self> {
        let declared = words
            .first()
            .map_or(0, |hdr| (hdr & HDR_JD_LENGTH_MASK) as usize);
        if declared == 0 || declared != words.len() {
            return Err(Error::InvalidDescriptor {
                words: words.len(),
            });
        }
        Ok(Self { words })
    }

    /// Length in words, as declared by the header.
    pub fn len(&self) -> usize {
        (self.words[0] & HDR_JD_LENGTH_MASK) as usize
    }

    pub fn is_empty(&self) -> bool {
        self.words.is_empty()
    }

    pub fn words(&self) -> &[u32] {
        &self.words
    }

    /// Fail with `InvalidDescriptor` when the descriptor does not fit the
    /// descriptor buffer.
    pub fn check_fits(&self) -> Result<usize> {
        let words = self.len();
        if words > MAX_SDLEN {
            return Err(Error::InvalidDescriptor { words });
        }
        Ok(words)
    }
}

// =============================================================================
// Descriptor Buffer
// =============================================================================

/// Preheader plus shared descriptor, laid out the way the accelerator reads
/// it through context-A.
#[derive(Debug, Clone)]
#[repr(C)]
pub struct HwDesc {
    pub prehdr: [u32; 2],
    pub sh_desc: [u32; MAX_SDLEN],
}

impl HwDesc {
    /// Size of the mapped buffer in bytes.
    pub const SIZE: usize = std::mem::size_of::<HwDesc>();

    /// Buffer loaded with `desc`.
    pub fn new(desc: &SharedDesc) -> Result<Box<Self>> {
        let mut hw = Box::new(Self {
            prehdr: [0; 2],
            sh_desc: [0; MAX_SDLEN],
        });
        hw.load(desc)?;
        Ok(hw)
    }

    /// Rewrite the preheader (RSLS | length) and copy the descriptor in.
    /// Words past the new length keep their previous contents.
    pub fn load(&mut self, desc: &SharedDesc) -> Result<()> {
        let words = desc.check_fits()?;
        self.write(&desc.words()[..words]);
        Ok(())
    }

    /// Load words already checked against [`MAX_SDLEN`]. Anything past the
    /// buffer is dropped.
    pub(crate) fn write(&mut self, words: &[u32]) {
        let n = words.len().min(MAX_SDLEN);
        self.prehdr[0] = PREHDR_RSLS | n as u32;
        self.sh_desc[..n].copy_from_slice(&words[..n]);
    }

    /// Descriptor length recorded in the preheader.
    pub fn sdlen(&self) -> usize {
        (self.prehdr[0] & PREHDR_SDLEN_MASK) as usize
    }

    /// Currently loaded descriptor words.
    pub fn descriptor(&self) -> &[u32] {
        &self.sh_desc[..self.sdlen().min(MAX_SDLEN)]
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_header_carries_length() {
        let desc = SharedDesc::new(&[1, 2, 3]).unwrap();
        assert_eq!(desc.len(), 4);
        assert_eq!(desc.words()[0], 0xb880_0004);
    }

    #[test]
    fn test_from_words_rejects_length_mismatch() {
        assert!(SharedDesc::from_words(vec![CMD_SHARED_DESC_HDR | HDR_ONE | 3, 0]).is_err());
        assert!(SharedDesc::from_words(vec![]).is_err());
        assert!(SharedDesc::from_words(vec![CMD_SHARED_DESC_HDR | HDR_ONE | 2, 7]).is_ok());
    }

    #[test]
    fn test_oversized_descriptor_rejected() {
        let desc = SharedDesc::new(&[0; MAX_SDLEN]).unwrap();
        assert_eq!(desc.len(), MAX_SDLEN + 1);
        assert!(matches!(
            HwDesc::new(&desc),
            Err(Error::InvalidDescriptor { words }) if words == MAX_SDLEN + 1
        ));

        let fits = SharedDesc::new(&[0; MAX_SDLEN - 1]).unwrap();
        assert!(HwDesc::new(&fits).is_ok());
    }

    #[test]
    fn test_preheader() {
        let desc = SharedDesc::new(&[0xdead_beef]).unwrap();
        let hw = HwDesc::new(&desc).unwrap();
        assert_eq!(hw.prehdr[0], 0x8000_0002);
        assert_eq!(hw.descriptor(), desc.words());
        assert_eq!(HwDesc::SIZE, (2 + MAX_SDLEN) * 4);
    }

    #[test]
    fn test_write_keeps_tail_of_longer_descriptor() {
        let long = SharedDesc::new(&[7; 8]).unwrap();
        let mut hw = HwDesc::new(&long).unwrap();

        let short = SharedDesc::new(&[9, 9]).unwrap();
        hw.write(short.words());
        assert_eq!(hw.sdlen(), 3);
        assert_eq!(hw.descriptor(), short.words());
        assert_eq!(hw.sh_desc[3..9], [7; 6]);

        hw.write(&[1; MAX_SDLEN + 4]);
        assert_eq!(hw.sdlen(), MAX_SDLEN);
    }

    #[test]
    fn test_icv_status() {
        assert!(is_icv_failure(STATUS_ICV_FAILURE));
        assert!(is_icv_failure(0x2000_00fa));
        assert!(!is_icv_failure(0x4000_000a));
        assert!(!is_icv_failure(0x2000_0001));
        assert!(!is_icv_failure(0));
    }
}
