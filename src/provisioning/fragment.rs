//! Frame fragmentation for the BLE link.
//!
//! A GATT write or notification carries at most ATT_MTU - 3 bytes, 20 with
//! the default MTU, while a network list or connection report is often
//! longer. Frames are split into fragments, each with a 2-byte header:
//!
//! ```text
//! [sequence: 1 byte][flags: 1 byte][payload: N bytes]
//! ```
//!
//! Flags:
//! - Bit 0: FIRST - first fragment of a frame
//! - Bit 1: MORE - more fragments follow
//!
//! The link has a single peer and GATT delivers writes in order, so the
//! [`Reassembler`] keeps one frame in flight and drops it on any gap.

use log::debug;
use std::fmt;
use std::time::{Duration, Instant};

/// Header size in bytes (sequence + flags).
pub const HEADER_SIZE: usize = 2;

pub const FLAG_FIRST: u8 = 0x01;
pub const FLAG_MORE: u8 = 0x02;

const VALID_FLAGS_MASK: u8 = FLAG_FIRST | FLAG_MORE;

/// Fragment size with the default ATT MTU of 23.
pub const DEFAULT_FRAGMENT_SIZE: usize = 20;

/// Enough for a full scan list at the minimum fragment size.
const DEFAULT_MAX_FRAGMENTS: usize = 128;

/// A single fragment of a frame.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Fragment {
    pub sequence: u8,
    pub flags: u8,
    pub payload: Vec<u8>,
}

impl Fragment {
    #[inline]
    pub fn is_first(&self) -> bool {
        self.flags & FLAG_FIRST != 0
    }

    #[inline]
    pub fn has_more(&self) -> bool {
        self.flags & FLAG_MORE != 0
    }

    /// Serialize to header + payload.
    pub fn to_bytes(&self) -> Vec<u8> {
        let mut bytes = Vec::with_capacity(HEADER_SIZE + self.payload.len());
        bytes.push(self.sequence);
        bytes.push(self.flags);
        bytes.extend_from_slice(&self.payload);
        bytes
    }

    pub fn from_bytes(bytes: &[u8]) -> Result<Self, FragmentError> {
        if bytes.len() < HEADER_SIZE {
            return Err(FragmentError::TooShort);
        }
        if bytes[1] & !VALID_FLAGS_MASK != 0 {
            return Err(FragmentError::InvalidFlags);
        }
        Ok(Self {
            sequence: bytes[0],
            flags: bytes[1],
            payload: bytes[HEADER_SIZE..].to_vec(),
        })
    }
}

/// Errors from fragmenting or parsing fragments.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FragmentError {
    /// Fragment is shorter than its header.
    TooShort,
    /// Fragment size leaves no room for payload.
    SizeTooSmall,
    /// Nothing to fragment.
    EmptyFrame,
    /// Reserved flag bits are set.
    InvalidFlags,
}

impl fmt::Display for FragmentError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::TooShort => write!(f, "fragment too short"),
            Self::SizeTooSmall => {
                write!(f, "fragment size too small (minimum: {})", HEADER_SIZE + 1)
            }
            Self::EmptyFrame => write!(f, "cannot fragment empty frame"),
            Self::InvalidFlags => write!(f, "invalid flags on fragment"),
        }
    }
}

impl std::error::Error for FragmentError {}

/// Splits frames into fragments of at most `size` bytes, header included.
#[derive(Debug)]
pub struct Fragmenter {
    size: usize,
    next_sequence: u8,
}

impl Fragmenter {
    pub fn new(size: usize) -> Result<Self, FragmentError> {
        if size <= HEADER_SIZE {
            return Err(FragmentError::SizeTooSmall);
        }
        Ok(Self {
            size,
            next_sequence: 0,
        })
    }

    pub fn max_payload(&self) -> usize {
        self.size - HEADER_SIZE
    }

    /// Change the fragment size, e.g. after MTU negotiation.
    pub fn set_size(&mut self, size: usize) -> Result<(), FragmentError> {
        if size <= HEADER_SIZE {
            return Err(FragmentError::SizeTooSmall);
        }
        self.size = size;
        Ok(())
    }

    /// Split a frame. The first fragment carries FIRST; all but the last carry MORE.
    pub fn fragment(&mut self, frame: &[u8]) -> Result<Vec<Fragment>, FragmentError> {
        if frame.is_empty() {
            return Err(FragmentError::EmptyFrame);
        }

        let chunks = frame.chunks(self.max_payload());
        let count = chunks.len();
        let mut fragments = Vec::with_capacity(count);
        for (i, chunk) in chunks.enumerate() {
            let mut flags = 0;
            if i == 0 {
                flags |= FLAG_FIRST;
            }
            if i + 1 < count {
                flags |= FLAG_MORE;
            }
            fragments.push(Fragment {
                sequence: self.next_sequence,
                flags,
                payload: chunk.to_vec(),
            });
            self.next_sequence = self.next_sequence.wrapping_add(1);
        }
        Ok(fragments)
    }
}

struct Pending {
    data: Vec<u8>,
    next_sequence: u8,
    fragments: usize,
    started: Instant,
}

/// Rebuilds frames from in-order fragments.
pub struct Reassembler {
    pending: Option<Pending>,
    timeout: Duration,
    max_fragments: usize,
}

impl Reassembler {
    pub fn new(timeout: Duration) -> Self {
        Self {
            pending: None,
            timeout,
            max_fragments: DEFAULT_MAX_FRAGMENTS,
        }
    }

    /// Add a fragment; returns the frame once its last fragment arrives.
    ///
    /// A FIRST fragment always starts over. Fragments out of sequence or
    /// past the limit discard the frame in flight.
    pub fn add(&mut self, fragment: Fragment) -> Option<Vec<u8>> {
        if self
            .pending
            .as_ref()
            .is_some_and(|p| p.started.elapsed() >= self.timeout)
        {
            debug!("Dropping stale partial frame");
            self.pending = None;
        }

        if fragment.is_first() {
            if !fragment.has_more() {
                self.pending = None;
                return Some(fragment.payload);
            }
            self.pending = Some(Pending {
                data: fragment.payload,
                next_sequence: fragment.sequence.wrapping_add(1),
                fragments: 1,
                started: Instant::now(),
            });
            return None;
        }

        let mut pending = self.pending.take()?;
        if fragment.sequence != pending.next_sequence || pending.fragments >= self.max_fragments
        {
            debug!(
                "Dropping partial frame at fragment {} (expected {})",
                fragment.sequence,
                pending.next_sequence
            );
            return None;
        }
        pending.data.extend_from_slice(&fragment.payload);
        if !fragment.has_more() {
            return Some(pending.data);
        }
        pending.next_sequence = fragment.sequence.wrapping_add(1);
        pending.fragments += 1;
        self.pending = Some(pending);
        None
    }

    /// Forget any partial frame, e.g. when the peer goes away.
    pub fn clear(&mut self) {
        self.pending = None;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::provisioning::Reply;
    use crate::wifi::ApRecord;

    fn reassemble(reassembler: &mut Reassembler, fragments: Vec<Fragment>) -> Option<Vec<u8>> {
        let mut complete = None;
        for fragment in fragments {
            let wire = fragment.to_bytes();
            assert!(wire.len() <= DEFAULT_FRAGMENT_SIZE);
            if let Some(frame) = reassembler.add(Fragment::from_bytes(&wire).unwrap()) {
                assert!(complete.is_none());
                complete = Some(frame);
            }
        }
        complete
    }

    #[test]
    fn test_network_list_survives_fragmentation() {
        let records: Vec<ApRecord> = (0..10)
            .map(|i| ApRecord {
                ssid: format!("Network-{:02}", i).into_bytes(),
                rssi: -40 - i as i8,
            })
            .collect();
        let reply = Reply::NetworkList(records);
        let frame = reply.encode();
        assert!(frame.len() > DEFAULT_FRAGMENT_SIZE);

        let mut fragmenter = Fragmenter::new(DEFAULT_FRAGMENT_SIZE).unwrap();
        let fragments = fragmenter.fragment(&frame).unwrap();
        assert_eq!(fragments.len(), frame.len().div_ceil(18));

        let mut reassembler = Reassembler::new(Duration::from_secs(5));
        let rebuilt = reassemble(&mut reassembler, fragments).unwrap();
        assert_eq!(Reply::decode(&rebuilt).unwrap(), reply);
    }

    #[test]
    fn test_short_frame_is_one_fragment() {
        let mut fragmenter = Fragmenter::new(DEFAULT_FRAGMENT_SIZE).unwrap();
        let fragments = fragmenter.fragment(&[0x06]).unwrap();
        assert_eq!(fragments.len(), 1);
        assert_eq!(fragments[0].to_bytes(), vec![0, FLAG_FIRST, 0x06]);

        let mut reassembler = Reassembler::new(Duration::from_secs(5));
        assert_eq!(reassembler.add(fragments[0].clone()), Some(vec![0x06]));
    }

    #[test]
    fn test_flags_and_sequence() {
        let mut fragmenter = Fragmenter::new(5).unwrap();
        let fragments = fragmenter.fragment(&[1, 2, 3, 4, 5, 6, 7, 8]).unwrap();
        let flags: Vec<u8> = fragments.iter().map(|f| f.flags).collect();
        assert_eq!(flags, vec![FLAG_FIRST | FLAG_MORE, FLAG_MORE, 0]);
        assert_eq!(fragments[2].payload, vec![7, 8]);

        // Sequence continues across frames.
        let next = fragmenter.fragment(&[9]).unwrap();
        assert_eq!(next[0].sequence, 3);
    }

    #[test]
    fn test_sequence_wraps() {
        let mut fragmenter = Fragmenter::new(3).unwrap();
        fragmenter.fragment(&[0; 254]).unwrap();
        let fragments = fragmenter.fragment(&[1, 2, 3, 4]).unwrap();
        let sequences: Vec<u8> = fragments.iter().map(|f| f.sequence).collect();
        assert_eq!(sequences, vec![254, 255, 0, 1]);

        let mut reassembler = Reassembler::new(Duration::from_secs(5));
        assert_eq!(
            reassemble_unchecked(&mut reassembler, fragments),
            Some(vec![1, 2, 3, 4])
        );
    }

    fn reassemble_unchecked(
        reassembler: &mut Reassembler,
        fragments: Vec<Fragment>,
    ) -> Option<Vec<u8>> {
        fragments.into_iter().filter_map(|f| reassembler.add(f)).last()
    }

    #[test]
    fn test_gap_drops_frame() {
        let mut fragmenter = Fragmenter::new(4).unwrap();
        let mut fragments = fragmenter.fragment(&[1, 2, 3, 4, 5, 6]).unwrap();
        fragments.remove(1);

        let mut reassembler = Reassembler::new(Duration::from_secs(5));
        assert_eq!(reassemble_unchecked(&mut reassembler, fragments), None);

        // The next frame still goes through.
        let fragments = fragmenter.fragment(&[7, 8, 9]).unwrap();
        assert_eq!(
            reassemble_unchecked(&mut reassembler, fragments),
            Some(vec![7, 8, 9])
        );
    }

    #[test]
    fn test_new_first_fragment_restarts() {
        let mut fragmenter = Fragmenter::new(4).unwrap();
        let abandoned = fragmenter.fragment(&[1, 2, 3, 4]).unwrap();
        let mut reassembler = Reassembler::new(Duration::from_secs(5));
        assert_eq!(reassembler.add(abandoned[0].clone()), None);

        let fragments = fragmenter.fragment(&[5, 6, 7, 8]).unwrap();
        assert_eq!(
            reassemble_unchecked(&mut reassembler, fragments),
            Some(vec![5, 6, 7, 8])
        );
    }

    #[test]
    fn test_invalid_input() {
        assert_eq!(Fragmenter::new(2).unwrap_err(), FragmentError::SizeTooSmall);
        let mut fragmenter = Fragmenter::new(20).unwrap();
        assert_eq!(fragmenter.fragment(&[]), Err(FragmentError::EmptyFrame));
        assert_eq!(Fragment::from_bytes(&[0]), Err(FragmentError::TooShort));
        assert_eq!(
            Fragment::from_bytes(&[0, 0x04, 1]),
            Err(FragmentError::InvalidFlags)
        );
    }

    #[test]
    fn test_orphan_continuation_is_ignored() {
        let mut reassembler = Reassembler::new(Duration::from_secs(5));
        let orphan = Fragment {
            sequence: 3,
            flags: 0,
            payload: vec![1],
        };
        assert_eq!(reassembler.add(orphan), None);
    }
}
