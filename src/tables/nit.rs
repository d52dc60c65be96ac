//! Network Information Table parsing.

use super::{commit, Disposition, TableParse, TID_NIT_ACTUAL, TID_NIT_OTHER};
use crate::psi::{self, Section};
use crate::{fsutils, Result, TsDemuxer};
use log::debug;
use modular_bitfield_msb::prelude::*;

/// NIT body prefix carrying the network descriptor loop length.
#[bitfield]
#[derive(Debug)]
pub struct NitHeader {
    pub reserved: B4,
    pub network_descriptors_length: B12,
}

/// Fixed part of one transport stream entry.
#[bitfield]
#[derive(Debug)]
pub struct TransportStreamEntry {
    pub transport_stream_id: B16,
    pub original_network_id: B16,
    pub reserved: B4,
    pub transport_descriptors_length: B12,
}

/// Parser for Network Information Tables (table ids 0x40/0x41).
#[derive(Debug, Clone, Copy, Default)]
pub struct NitParser;

impl TableParse for NitParser {
    fn accepts(&self, table_id: u8) -> bool {
        matches!(table_id, TID_NIT_ACTUAL | TID_NIT_OTHER)
    }

    fn parse(&self, demuxer: &TsDemuxer, section: Section) -> Result<()> {
        if !section.current() {
            debug!("Ignoring not-yet-applicable NIT");
            return Ok(());
        }
        let disposition = demuxer.tables().disposition(
            section.key(),
            section.version(),
            section.section_number(),
        );
        if matches!(disposition, Disposition::Skip) {
            debug!("Ignoring already-known NIT version {}", section.version());
            return Ok(());
        }

        let mut reader = section.reader();
        let header = crate::read_bitfield!(reader, NitHeader);

        let vdir = fsutils::create_version_dir(section.version());
        psi::append_header_leaves(&vdir, &section, "network_id")?;

        let mut net_reader =
            reader.new_sub_reader(header.network_descriptors_length() as usize)?;
        let network_descriptors = fsutils::ensure_dir(&vdir, "NetworkDescriptors")?;
        demuxer
            .descriptors()
            .decode_loop(&mut net_reader, &network_descriptors)?;

        /* Transport stream loop, bounded by its own length field */
        let loop_length = (reader.read_be_u16()? & 0x0fff) as usize;
        let mut loop_reader = reader.new_sub_reader(loop_length)?;
        let transports = fsutils::ensure_dir(&vdir, "TransportStreams")?;
        while loop_reader.remaining_len() > 0 {
            let entry = crate::read_bitfield!(loop_reader, TransportStreamEntry);
            let ts_dir = fsutils::ensure_dir(
                &transports,
                &format!("0x{:04x}", entry.transport_stream_id()),
            )?;
            fsutils::append_u16(&ts_dir, "transport_stream_id", entry.transport_stream_id())?;
            fsutils::append_u16(&ts_dir, "original_network_id", entry.original_network_id())?;
            let mut ts_reader =
                loop_reader.new_sub_reader(entry.transport_descriptors_length() as usize)?;
            let descriptors = fsutils::ensure_dir(&ts_dir, "Descriptors")?;
            demuxer
                .descriptors()
                .decode_loop(&mut ts_reader, &descriptors)?;
        }

        let table_root = fsutils::ensure_dir(&demuxer.root(), "NIT")?;
        commit(demuxer, &table_root, vdir, &section, disposition)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::psi::tests::build_section;

    #[test]
    fn network_and_transport_loops_become_directories() {
        let demuxer = TsDemuxer::new();
        let mut body = Vec::new();
        /* network_name "BR" */
        body.extend_from_slice(&0xf004u16.to_be_bytes());
        body.extend_from_slice(&[0x40, 0x02, b'B', b'R']);
        /* one transport stream without descriptors */
        body.extend_from_slice(&0xf006u16.to_be_bytes());
        body.extend_from_slice(&0x044du16.to_be_bytes());
        body.extend_from_slice(&0x044eu16.to_be_bytes());
        body.extend_from_slice(&0xf000u16.to_be_bytes());

        let raw = build_section(TID_NIT_ACTUAL, 0x073a, 2, &body);
        let section = crate::psi::parse_section(0x0010, &raw).unwrap();
        NitParser::default().parse(&demuxer, section).unwrap();

        let root = demuxer.root();
        assert_eq!(
            root.walk("NIT/Current/network_id").unwrap().file_content(),
            Some(&b"1850"[..])
        );
        let name = root
            .walk("NIT/V02/NetworkDescriptors/descriptor_01/network_name")
            .unwrap();
        assert_eq!(name.file_content(), Some(&b"BR"[..]));
        let ts = root.walk("NIT/V02/TransportStreams/0x044d").unwrap();
        assert_eq!(
            ts.lookup("original_network_id").unwrap().file_content(),
            Some(&b"1102"[..])
        );
    }
}
