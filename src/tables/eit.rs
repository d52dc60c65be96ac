//! Event Information Table parsing.

use super::time::{decode_bcd_hms, decode_mjd_time};
use super::{commit, Disposition, TableParse, TID_EIT_FIRST, TID_EIT_LAST};
use crate::psi::{self, Section};
use crate::{fsutils, Result, TsDemuxer};
use log::debug;
use modular_bitfield_msb::prelude::*;

/// Flag/length word closing the fixed part of an event entry.
#[bitfield]
#[derive(Debug)]
pub struct EventFlags {
    pub running_status: B3,
    pub free_ca_mode: bool,
    pub descriptors_loop_length: B12,
}

/// Parser for Event Information Tables (table ids 0x4E-0x5F).
///
/// Serves the present/following and schedule variants on any of the H/M/L-EIT PIDs.
#[derive(Debug, Clone, Copy, Default)]
pub struct EitParser;

impl TableParse for EitParser {
    fn accepts(&self, table_id: u8) -> bool {
        (TID_EIT_FIRST..=TID_EIT_LAST).contains(&table_id)
    }

    fn parse(&self, demuxer: &TsDemuxer, section: Section) -> Result<()> {
        if !section.current() {
            debug!("Ignoring not-yet-applicable EIT");
            return Ok(());
        }
        let disposition = demuxer.tables().disposition(
            section.key(),
            section.version(),
            section.section_number(),
        );
        if matches!(disposition, Disposition::Skip) {
            debug!("Ignoring already-known EIT version {}", section.version());
            return Ok(());
        }

        let mut reader = section.reader();
        let transport_stream_id = reader.read_be_u16()?;
        let original_network_id = reader.read_be_u16()?;
        let segment_last_section_number = reader.read_u8()?;
        let last_table_id = reader.read_u8()?;

        let vdir = fsutils::create_version_dir(section.version());
        psi::append_header_leaves(&vdir, &section, "service_id")?;
        fsutils::append_u16(&vdir, "transport_stream_id", transport_stream_id)?;
        fsutils::append_u16(&vdir, "original_network_id", original_network_id)?;
        fsutils::append_u8(&vdir, "segment_last_section_number", segment_last_section_number)?;
        fsutils::append_u8(&vdir, "last_table_id", last_table_id)?;

        let events = fsutils::ensure_dir(&vdir, "Events")?;
        while reader.remaining_len() > 0 {
            let event_id = reader.read_be_u16()?;
            let start_time = *reader.read_array_ref::<5>()?;
            let duration = *reader.read_array_ref::<3>()?;
            let flags = crate::read_bitfield!(reader, EventFlags);

            let event_dir = fsutils::ensure_dir(&events, &format!("0x{:04x}", event_id))?;
            fsutils::append_u16(&event_dir, "event_id", event_id)?;
            fsutils::append_string(&event_dir, "start_time", &decode_mjd_time(&start_time))?;
            fsutils::append_string(&event_dir, "duration", &decode_bcd_hms(&duration))?;
            fsutils::append_u8(&event_dir, "running_status", flags.running_status())?;
            fsutils::append_flag(&event_dir, "free_ca_mode", flags.free_ca_mode())?;

            let mut desc_reader =
                reader.new_sub_reader(flags.descriptors_loop_length() as usize)?;
            let descriptors = fsutils::ensure_dir(&event_dir, "Descriptors")?;
            demuxer
                .descriptors()
                .decode_loop(&mut desc_reader, &descriptors)?;
        }

        let table_root = fsutils::ensure_dir(&demuxer.root(), "EIT")?;
        commit(demuxer, &table_root, vdir, &section, disposition)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::psi::tests::build_section;

    #[test]
    fn events_expose_times_as_iso_8601() {
        let demuxer = TsDemuxer::new();
        let mut body = Vec::new();
        body.extend_from_slice(&0x044du16.to_be_bytes());
        body.extend_from_slice(&0x044eu16.to_be_bytes());
        body.push(0x00);
        body.push(0x4e);
        /* event 0x0101 at MJD 45218 12:45:00, one and a half hours long */
        body.extend_from_slice(&0x0101u16.to_be_bytes());
        body.extend_from_slice(&[0xb0, 0xa2, 0x12, 0x45, 0x00]);
        body.extend_from_slice(&[0x01, 0x30, 0x00]);
        body.extend_from_slice(&0x8000u16.to_be_bytes());

        let raw = build_section(0x4e, 0x0400, 1, &body);
        let section = crate::psi::parse_section(0x0012, &raw).unwrap();
        EitParser::default().parse(&demuxer, section).unwrap();

        let root = demuxer.root();
        let event = root.walk("EIT/Current/Events/0x0101").unwrap();
        assert_eq!(
            event.lookup("start_time").unwrap().file_content(),
            Some(&b"1982-09-06T12:45:00"[..])
        );
        assert_eq!(event.lookup("duration").unwrap().file_content(), Some(&b"01:30:00"[..]));
        assert_eq!(event.lookup("running_status").unwrap().file_content(), Some(&b"4"[..]));
    }
}
