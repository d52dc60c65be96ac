//! Service Description Table parsing.

use super::{commit, Disposition, TableParse, TID_SDT_ACTUAL, TID_SDT_OTHER};
use crate::psi::{self, Section};
use crate::{fsutils, Result, TsDemuxer};
use log::debug;
use modular_bitfield_msb::prelude::*;

/// Fixed part of one service description entry.
#[bitfield]
#[derive(Debug)]
pub struct ServiceEntry {
    pub service_id: B16,
    pub reserved: B6,
    pub eit_schedule_flag: bool,
    pub eit_present_following_flag: bool,
    pub running_status: B3,
    pub free_ca_mode: bool,
    pub descriptors_loop_length: B12,
}

/// Parser for Service Description Tables (table ids 0x42/0x46).
#[derive(Debug, Clone, Copy, Default)]
pub struct SdtParser;

impl TableParse for SdtParser {
    fn accepts(&self, table_id: u8) -> bool {
        matches!(table_id, TID_SDT_ACTUAL | TID_SDT_OTHER)
    }

    fn parse(&self, demuxer: &TsDemuxer, section: Section) -> Result<()> {
        if !section.current() {
            debug!("Ignoring not-yet-applicable SDT");
            return Ok(());
        }
        let disposition = demuxer.tables().disposition(
            section.key(),
            section.version(),
            section.section_number(),
        );
        if matches!(disposition, Disposition::Skip) {
            debug!("Ignoring already-known SDT version {}", section.version());
            return Ok(());
        }

        let mut reader = section.reader();
        let original_network_id = reader.read_be_u16()?;
        reader.skip(1)?;

        let vdir = fsutils::create_version_dir(section.version());
        psi::append_header_leaves(&vdir, &section, "transport_stream_id")?;
        fsutils::append_u16(&vdir, "original_network_id", original_network_id)?;

        let services = fsutils::ensure_dir(&vdir, "Services")?;
        while reader.remaining_len() > 0 {
            let entry = crate::read_bitfield!(reader, ServiceEntry);
            let service_dir =
                fsutils::ensure_dir(&services, &format!("0x{:04x}", entry.service_id()))?;
            fsutils::append_u16(&service_dir, "service_id", entry.service_id())?;
            fsutils::append_flag(&service_dir, "eit_schedule_flag", entry.eit_schedule_flag())?;
            fsutils::append_flag(
                &service_dir,
                "eit_present_following_flag",
                entry.eit_present_following_flag(),
            )?;
            fsutils::append_u8(&service_dir, "running_status", entry.running_status())?;
            fsutils::append_flag(&service_dir, "free_ca_mode", entry.free_ca_mode())?;

            let mut desc_reader =
                reader.new_sub_reader(entry.descriptors_loop_length() as usize)?;
            let descriptors = fsutils::ensure_dir(&service_dir, "Descriptors")?;
            demuxer
                .descriptors()
                .decode_loop(&mut desc_reader, &descriptors)?;
        }

        let table_root = fsutils::ensure_dir(&demuxer.root(), "SDT")?;
        commit(demuxer, &table_root, vdir, &section, disposition)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::psi::tests::build_section;

    #[test]
    fn services_expose_flags_and_descriptors() {
        let demuxer = TsDemuxer::new();
        let mut body = Vec::new();
        body.extend_from_slice(&0x044eu16.to_be_bytes());
        body.push(0xff);
        /* service 0x0400, running, with a service descriptor */
        body.extend_from_slice(&0x0400u16.to_be_bytes());
        let descriptor = [0x48u8, 0x07, 0x01, 0x02, b'T', b'V', 0x02, b'N', b'1'];
        body.push(0xfd);
        body.extend_from_slice(&(0x8000 | descriptor.len() as u16).to_be_bytes());
        body.extend_from_slice(&descriptor);

        let raw = build_section(TID_SDT_ACTUAL, 0x044d, 4, &body);
        let section = crate::psi::parse_section(0x0011, &raw).unwrap();
        SdtParser::default().parse(&demuxer, section).unwrap();

        let root = demuxer.root();
        let service = root.walk("SDT/Current/Services/0x0400").unwrap();
        assert_eq!(service.lookup("running_status").unwrap().file_content(), Some(&b"4"[..]));
        assert_eq!(service.lookup("free_ca_mode").unwrap().file_content(), Some(&b"0"[..]));
        let name = root
            .walk("SDT/Current/Services/0x0400/Descriptors/descriptor_01/service_name")
            .unwrap();
        assert_eq!(name.file_content(), Some(&b"N1"[..]));
    }
}
