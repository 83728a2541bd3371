//! MIDI codec (§4.G): conversion between the legacy ring-buffer MIDI port
//! layout and the graph server's control-sequence representation.
//!
//! Legacy buffer layout, all fields little-endian:
//!
//! ```text
//! [ header: magic, buffer_size, nframes, write_pos, event_count, lost_events ]
//! [ event 0 ][ event 1 ] ... growing upward from the end of the header
//!                                                    ... payload (>4B) growing
//!                                                        downward from the end
//! ```
//!
//! Each event record is `{ time: u16, size: u16, data: [u8; 4] | byte_offset: u32 }`:
//! payloads of 4 bytes or fewer are stored inline in `data`; larger payloads
//! are written at the high end of the buffer and referenced by
//! `byte_offset = buffer_size - 1 - write_pos`.

const HEADER_LEN: usize = 24;
const EVENT_LEN: usize = 8;
const MAGIC: u32 = 0x4A4D4944; // "JMID"

fn read_u32(buf: &[u8], at: usize) -> u32 {
    u32::from_le_bytes(buf[at..at + 4].try_into().unwrap())
}
fn write_u32(buf: &mut [u8], at: usize, v: u32) {
    buf[at..at + 4].copy_from_slice(&v.to_le_bytes());
}
fn read_u16(buf: &[u8], at: usize) -> u16 {
    u16::from_le_bytes(buf[at..at + 2].try_into().unwrap())
}
fn write_u16(buf: &mut [u8], at: usize, v: u16) {
    buf[at..at + 2].copy_from_slice(&v.to_le_bytes());
}

/// One decoded event: its frame-relative time and payload bytes.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MidiEvent {
    pub time: u16,
    pub data: Vec<u8>,
}

/// A view over one legacy MIDI port buffer. Borrows the port's scratch
/// bytes for the duration of one cycle.
pub struct MidiBuffer<'a> {
    buf: &'a mut [u8],
}

impl<'a> MidiBuffer<'a> {
    /// Initialize (or re-initialize) an empty buffer of this byte capacity
    /// for `nframes` (§4.F "Input MIDI": "initialize the legacy MIDI
    /// buffer"; also used by `midi_clear_buffer`/`midi_reset_buffer`).
    pub fn clear(buf: &'a mut [u8], nframes: u32) -> Self {
        let buffer_size = buf.len() as u32;
        write_u32(buf, 0, MAGIC);
        write_u32(buf, 4, buffer_size);
        write_u32(buf, 8, nframes);
        write_u32(buf, 12, HEADER_LEN as u32);
        write_u32(buf, 16, 0);
        write_u32(buf, 20, 0);
        MidiBuffer { buf }
    }

    pub fn attach(buf: &'a mut [u8]) -> Self {
        MidiBuffer { buf }
    }

    pub fn buffer_size(&self) -> u32 {
        read_u32(self.buf, 4)
    }
    pub fn nframes(&self) -> u32 {
        read_u32(self.buf, 8)
    }
    fn write_pos(&self) -> u32 {
        read_u32(self.buf, 12)
    }
    fn set_write_pos(&mut self, v: u32) {
        write_u32(self.buf, 12, v)
    }
    pub fn event_count(&self) -> u32 {
        read_u32(self.buf, 16)
    }
    fn set_event_count(&mut self, v: u32) {
        write_u32(self.buf, 16, v)
    }
    pub fn lost_event_count(&self) -> u32 {
        read_u32(self.buf, 20)
    }
    fn bump_lost(&mut self) {
        let v = self.lost_event_count();
        write_u32(self.buf, 20, v + 1);
    }

    fn last_event_time(&self) -> Option<u16> {
        let n = self.event_count();
        if n == 0 {
            return None;
        }
        let at = HEADER_LEN + (n as usize - 1) * EVENT_LEN;
        Some(read_u16(self.buf, at))
    }

    /// Reserve space for an event of `size` bytes at relative `time`.
    /// Returns `None` (incrementing `lost_events`) if `time` would go
    /// backwards relative to the last reserved event, or if there isn't
    /// room left for both the new event record and its payload.
    pub fn reserve_event(&mut self, time: u16, size: u16) -> Option<&mut [u8]> {
        if let Some(last) = self.last_event_time() {
            if time < last {
                self.bump_lost();
                return None;
            }
        }

        let event_count = self.event_count();
        let events_end = HEADER_LEN + (event_count as usize + 1) * EVENT_LEN;
        let buffer_size = self.buffer_size() as usize;

        let payload_ref_start;
        if size as usize <= 4 {
            if events_end > buffer_size {
                self.bump_lost();
                return None;
            }
            payload_ref_start = None;
        } else {
            let new_write_pos = self.write_pos() as usize + size as usize;
            if new_write_pos > buffer_size.saturating_sub(events_end) {
                self.bump_lost();
                return None;
            }
            payload_ref_start = Some(new_write_pos);
        }

        let event_at = HEADER_LEN + event_count as usize * EVENT_LEN;
        write_u16(self.buf, event_at, time);
        write_u16(self.buf, event_at + 2, size);

        let data_range = if let Some(new_write_pos) = payload_ref_start {
            let byte_offset = (buffer_size - 1 - new_write_pos) as u32;
            write_u32(self.buf, event_at + 4, byte_offset);
            self.set_write_pos(new_write_pos as u32);
            let start = byte_offset as usize;
            start..start + size as usize
        } else {
            let start = event_at + 4;
            start..start + 4
        };

        self.set_event_count(event_count + 1);
        Some(&mut self.buf[data_range])
    }

    pub fn events(&self) -> Vec<MidiEvent> {
        let mut out = Vec::with_capacity(self.event_count() as usize);
        for i in 0..self.event_count() as usize {
            let at = HEADER_LEN + i * EVENT_LEN;
            let time = read_u16(self.buf, at);
            let size = read_u16(self.buf, at + 2);
            let data = if size <= 4 {
                self.buf[at + 4..at + 4 + size as usize].to_vec()
            } else {
                let byte_offset = read_u32(self.buf, at + 4) as usize;
                self.buf[byte_offset..byte_offset + size as usize].to_vec()
            };
            out.push(MidiEvent { time, data });
        }
        out
    }
}

/// One control in the server's control-sequence pod. Only `Midi` controls
/// participate in the legacy MIDI conversion; other control types pass
/// through the ambient `pipewire` pod machinery elsewhere.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SequenceControl {
    pub offset: u32,
    pub data: Vec<u8>,
}

/// Convert a legacy MIDI buffer's events into a server control sequence,
/// in order.
pub fn convert_from_midi(buf: &MidiBuffer<'_>) -> Vec<SequenceControl> {
    buf.events().into_iter().map(|e| SequenceControl { offset: e.time as u32, data: e.data }).collect()
}

/// Merge `n` input control sequences (one per connected mix) into `out` in
/// non-decreasing offset order; ties broken by input index. Returns the
/// number of events lost to capacity (mirrors `reserve_event` failures).
pub fn convert_to_midi(inputs: &[Vec<SequenceControl>], out: &mut MidiBuffer<'_>) -> u32 {
    let mut cursors = vec![0usize; inputs.len()];
    let mut lost = 0u32;
    loop {
        let mut best: Option<(usize, u32)> = None;
        for (i, seq) in inputs.iter().enumerate() {
            if let Some(c) = seq.get(cursors[i]) {
                if best.map(|(_, off)| c.offset < off).unwrap_or(true) {
                    best = Some((i, c.offset));
                }
            }
        }
        let Some((i, _)) = best else { break };
        let control = &inputs[i][cursors[i]];
        cursors[i] += 1;
        match out.reserve_event(control.offset as u16, control.data.len() as u16) {
            Some(slot) => slot.copy_from_slice(&control.data),
            None => lost += 1,
        }
    }
    lost
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    proptest! {
        #[test]
        fn convert_from_midi_after_convert_to_midi_roundtrips(
            mut events in proptest::collection::vec((0u16..2000, proptest::collection::vec(any::<u8>(), 1..4)), 0..16)
        ) {
            events.sort_by_key(|(offset, _)| *offset);
            let input: Vec<SequenceControl> = events
                .iter()
                .map(|(offset, data)| SequenceControl { offset: *offset as u32, data: data.clone() })
                .collect();

            let mut bytes = vec![0u8; 4096];
            let mut out = MidiBuffer::clear(&mut bytes, 4096);
            let lost = convert_to_midi(&[input.clone()], &mut out);
            prop_assert_eq!(lost, 0);

            let roundtripped = convert_from_midi(&out);
            prop_assert_eq!(roundtripped, input);
        }
    }

    #[test]
    fn reserve_in_order_then_out_of_order_is_lost() {
        let mut bytes = vec![0u8; 1024];
        let mut buf = MidiBuffer::clear(&mut bytes, 256);
        assert!(buf.reserve_event(0, 3).is_some());
        assert!(buf.reserve_event(5, 10).is_some());
        assert!(buf.reserve_event(4, 1).is_none());
        assert_eq!(buf.lost_event_count(), 1);
        assert_eq!(buf.event_count(), 2);
    }

    #[test]
    fn inline_and_payload_events_roundtrip() {
        let mut bytes = vec![0u8; 1024];
        let mut buf = MidiBuffer::clear(&mut bytes, 256);
        buf.reserve_event(0, 3).unwrap().copy_from_slice(&[0x90, 60, 100]);
        let long: Vec<u8> = (0..16).collect();
        buf.reserve_event(2, 16).unwrap().copy_from_slice(&long);

        let events = buf.events();
        assert_eq!(events.len(), 2);
        assert_eq!(events[0].data, vec![0x90, 60, 100]);
        assert_eq!(events[1].data, long);
    }

    #[test]
    fn merge_preserves_time_order_across_two_mixes() {
        let a = vec![SequenceControl { offset: 0, data: vec![1] }, SequenceControl { offset: 4, data: vec![3] }];
        let b = vec![SequenceControl { offset: 2, data: vec![2] }];
        let mut bytes = vec![0u8; 1024];
        let mut out = MidiBuffer::clear(&mut bytes, 256);
        let lost = convert_to_midi(&[a, b], &mut out);
        assert_eq!(lost, 0);
        let times: Vec<u16> = out.events().iter().map(|e| e.time).collect();
        assert_eq!(times, vec![0, 2, 4]);
    }
}
