use super::{Result, SliceReader};
use log::{debug, warn};

/// Largest legal value of a PSI section_length field.
pub(crate) const MAX_SECTION_LENGTH: usize = 0x3fd;

/// Per-PID reassembly queue turning packet payloads back into complete sections.
///
/// A section may span packets and a packet may carry several sections back to back, so the
/// queue stays stateful across packet boundaries: the drain loop extracts every complete
/// `3 + section_length` prefix and leaves the trailing bytes queued for the next packet.
pub(crate) struct SectionQueue {
    data: Vec<u8>,
    aligned: bool,
}

impl SectionQueue {
    pub fn new() -> Self {
        Self {
            data: Vec::new(),
            aligned: false,
        }
    }

    /// Drops any in-progress section, e.g. after a continuity break. The next payload is
    /// ignored until a unit start realigns the queue.
    pub fn reset(&mut self) {
        self.data.clear();
        self.aligned = false;
    }

    /// Accepts one packet's payload and returns the complete raw sections it released.
    pub fn accept(&mut self, pusi: bool, pid: u16, payload: &[u8]) -> Result<Vec<Vec<u8>>> {
        let mut complete = Vec::new();
        if pusi {
            let mut reader = SliceReader::new(payload);
            let pointer_field = reader.read_u8()? as usize;
            if pointer_field == 0xff {
                /* Stuffing fills the rest of the packet */
                return Ok(complete);
            }
            let head = reader.read(pointer_field)?;
            if self.aligned && !self.data.is_empty() {
                /* Bytes before the pointed offset finish the in-progress section */
                self.data.extend_from_slice(head);
                self.drain(pid, &mut complete);
                if !self.data.is_empty() {
                    warn!(
                        "Discarding {} bytes of unfinished section on PID {:#06x}",
                        self.data.len(),
                        pid
                    );
                }
            } else if pointer_field > 0 {
                debug!(
                    "Discarding {} pointer-filler bytes on PID {:#06x}",
                    pointer_field, pid
                );
            }
            self.data.clear();
            self.aligned = true;
            self.data.extend_from_slice(reader.read_to_end()?);
        } else {
            if !self.aligned || self.data.is_empty() {
                /* Nothing in progress; wait for the next unit start */
                return Ok(complete);
            }
            if payload.first() == Some(&0xff) {
                /* Stuffing packet; the section in progress continues in a later packet */
                return Ok(complete);
            }
            self.data.extend_from_slice(payload);
        }
        self.drain(pid, &mut complete);
        Ok(complete)
    }

    fn drain(&mut self, pid: u16, complete: &mut Vec<Vec<u8>>) {
        loop {
            if self.data.is_empty() {
                return;
            }
            if self.data[0] == 0xff {
                /* Stuffing runs to the end of the packet payload */
                self.data.clear();
                return;
            }
            if self.data.len() < 3 {
                return;
            }
            let section_length =
                ((usize::from(self.data[1]) & 0x03) << 8) | usize::from(self.data[2]);
            if section_length > MAX_SECTION_LENGTH {
                warn!(
                    "Discarding section with impossible length {} on PID {:#06x}",
                    section_length, pid
                );
                self.reset();
                return;
            }
            let total = 3 + section_length;
            if self.data.len() < total {
                return;
            }
            let rest = self.data.split_off(total);
            complete.push(std::mem::replace(&mut self.data, rest));
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn section(table_id: u8, body_len: usize) -> Vec<u8> {
        let mut raw = vec![
            table_id,
            0xb0 | ((body_len >> 8) as u8 & 0x03),
            body_len as u8,
        ];
        raw.extend(std::iter::repeat(0xab).take(body_len));
        raw
    }

    #[test]
    fn single_packet_single_section() {
        let mut queue = SectionQueue::new();
        let raw = section(0x00, 9);
        let mut payload = vec![0_u8];
        payload.extend_from_slice(&raw);
        let released = queue.accept(true, 0, &payload).unwrap();
        assert_eq!(released, vec![raw]);
    }

    #[test]
    fn section_spanning_two_packets() {
        let mut queue = SectionQueue::new();
        let raw = section(0x42, 300);
        let mut first = vec![0u8];
        first.extend_from_slice(&raw[..183]);
        assert!(queue.accept(true, 0x11, &first).unwrap().is_empty());
        let released = queue.accept(false, 0x11, &raw[183..]).unwrap();
        assert_eq!(released, vec![raw]);
    }

    #[test]
    fn pointer_field_completes_previous_section() {
        let mut queue = SectionQueue::new();
        let old = section(0x42, 20);
        let new = section(0x42, 5);
        let mut first = vec![0u8];
        first.extend_from_slice(&old[..15]);
        assert!(queue.accept(true, 0x11, &first).unwrap().is_empty());

        /* Next unit start points past the 8 bytes that finish the old section */
        let mut second = vec![8u8];
        second.extend_from_slice(&old[15..]);
        second.extend_from_slice(&new);
        let released = queue.accept(true, 0x11, &second).unwrap();
        assert_eq!(released, vec![old, new]);
    }

    #[test]
    fn several_sections_in_one_packet_with_stuffing() {
        let mut queue = SectionQueue::new();
        let a = section(0x00, 4);
        let b = section(0x00, 6);
        let mut payload = vec![0u8];
        payload.extend_from_slice(&a);
        payload.extend_from_slice(&b);
        payload.extend(std::iter::repeat(0xff).take(20));
        let released = queue.accept(true, 0, &payload).unwrap();
        assert_eq!(released, vec![a, b]);
        /* Stuffing cleared the queue */
        let released = queue.accept(false, 0, &[0xde, 0xad]).unwrap();
        assert!(released.is_empty());
    }

    #[test]
    fn stuffing_continuation_leaves_the_section_in_progress() {
        let mut queue = SectionQueue::new();
        let raw = section(0x42, 300);
        let mut first = vec![0u8];
        first.extend_from_slice(&raw[..183]);
        assert!(queue.accept(true, 0x11, &first).unwrap().is_empty());

        /* A full-stuffing packet in between must not disturb the buffer */
        assert!(queue.accept(false, 0x11, &[0xff; 184]).unwrap().is_empty());

        let released = queue.accept(false, 0x11, &raw[183..]).unwrap();
        assert_eq!(released, vec![raw]);
    }

    #[test]
    fn continuation_without_a_start_is_ignored() {
        let mut queue = SectionQueue::new();
        assert!(queue.accept(false, 0, &[0x12, 0x34]).unwrap().is_empty());
    }

    #[test]
    fn reset_drops_the_section_in_progress() {
        let mut queue = SectionQueue::new();
        let raw = section(0x02, 200);
        let mut first = vec![0u8];
        first.extend_from_slice(&raw[..100]);
        assert!(queue.accept(true, 0x100, &first).unwrap().is_empty());
        queue.reset();
        /* The tail of the dropped section no longer matches anything */
        assert!(queue.accept(false, 0x100, &raw[100..]).unwrap().is_empty());
    }

    #[test]
    fn impossible_length_discards_the_queue() {
        let mut queue = SectionQueue::new();
        let payload = [0x00, 0x00, 0xb3, 0xfe, 0x00];
        assert!(queue.accept(true, 0, &payload).unwrap().is_empty());
        assert!(queue.accept(false, 0, &[0x00; 4]).unwrap().is_empty());
    }
}
