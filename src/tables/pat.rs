//! Program Association Table parsing and dispatcher seeding.

use super::nit::NitParser;
use super::pmt::PmtParser;
use super::{commit, Disposition, TableParse, TID_PAT};
use crate::psi::{self, Section};
use crate::{fsutils, Result, TsDemuxer};
use log::debug;
use modular_bitfield_msb::prelude::*;
use smallvec::SmallVec;

/// One four-byte program association entry.
#[bitfield]
#[derive(Debug)]
pub struct PatEntry {
    pub program_num: B16,
    pub reserved: B3,
    pub program_map_pid: B13,
}

/// Parser for the Program Association Table (table id 0x00).
///
/// Besides building the `/PAT` subtree, an accepted PAT seeds the dispatcher: every
/// announced PID is bound to the PMT parser, or to the NIT parser for program number zero.
#[derive(Debug, Clone, Copy, Default)]
pub struct PatParser;

impl TableParse for PatParser {
    fn accepts(&self, table_id: u8) -> bool {
        table_id == TID_PAT
    }

    fn parse(&self, demuxer: &TsDemuxer, section: Section) -> Result<()> {
        if !section.current() {
            debug!("Ignoring not-yet-applicable PAT");
            return Ok(());
        }
        let disposition = demuxer.tables().disposition(
            section.key(),
            section.version(),
            section.section_number(),
        );
        if matches!(disposition, Disposition::Skip) {
            debug!("Ignoring already-known PAT version {}", section.version());
            return Ok(());
        }

        let mut reader = section.reader();
        let mut entries = SmallVec::<[PatEntry; 4]>::new();
        while reader.remaining_len() >= 4 {
            entries.push(PatEntry::from_bytes(*reader.read_array_ref::<4>()?));
        }

        let vdir = fsutils::create_version_dir(section.version());
        psi::append_header_leaves(&vdir, &section, "transport_stream_id")?;
        fsutils::append_u16(&vdir, "num_programs", entries.len() as u16)?;
        let programs = fsutils::ensure_dir(&vdir, "Programs")?;
        for entry in &entries {
            let pid = entry.program_map_pid();
            let name = format!("0x{:04x}", entry.program_num());
            if entry.program_num() == 0 {
                fsutils::append_symlink(&programs, &name, "../../../NIT/Current")?;
                demuxer
                    .tables()
                    .register_psi_if_absent(pid, NitParser::default().into());
            } else {
                let target = format!("../../../PMT/0x{:04x}/Current", pid);
                fsutils::append_symlink(&programs, &name, &target)?;
                demuxer
                    .tables()
                    .register_psi_if_absent(pid, PmtParser::default().into());
            }
        }

        let table_root = fsutils::ensure_dir(&demuxer.root(), "PAT")?;
        commit(demuxer, &table_root, vdir, &section, disposition)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::psi::tests::build_section;
    use crate::tables::TableParser;

    fn pat_body(programs: &[(u16, u16)]) -> Vec<u8> {
        let mut body = Vec::new();
        for (program, pid) in programs {
            body.extend_from_slice(&program.to_be_bytes());
            body.extend_from_slice(&(0xe000 | pid).to_be_bytes());
        }
        body
    }

    fn feed_pat(demuxer: &TsDemuxer, version: u8, programs: &[(u16, u16)]) {
        let raw = build_section(TID_PAT, 0x044d, version, &pat_body(programs));
        let section = crate::psi::parse_section(0x0000, &raw).unwrap();
        PatParser::default().parse(demuxer, section).unwrap();
    }

    #[test]
    fn minimal_pat_builds_programs_and_current() {
        let demuxer = TsDemuxer::new();
        feed_pat(&demuxer, 0, &[(1, 0x100)]);

        let root = demuxer.root();
        let link = root.walk("PAT/V00/Programs").unwrap().lookup("0x0001").unwrap();
        assert_eq!(link.symlink_target(), Some("../../../PMT/0x0100/Current"));
        let current = root.walk("PAT").unwrap().lookup("Current").unwrap();
        assert_eq!(current.symlink_target(), Some("V00"));
        assert!(matches!(
            demuxer.psi_parser(0x100),
            Some(TableParser::Pmt(_))
        ));
    }

    #[test]
    fn program_zero_links_to_the_nit() {
        let demuxer = TsDemuxer::new();
        feed_pat(&demuxer, 0, &[(0, 0x0010), (5, 0x200)]);

        let root = demuxer.root();
        let link = root.walk("PAT/V00/Programs").unwrap().lookup("0x0000").unwrap();
        assert_eq!(link.symlink_target(), Some("../../../NIT/Current"));
        assert!(matches!(
            demuxer.psi_parser(0x200),
            Some(TableParser::Pmt(_))
        ));
    }

    #[test]
    fn same_version_is_idempotent() {
        let demuxer = TsDemuxer::new();
        feed_pat(&demuxer, 0, &[(1, 0x100)]);
        feed_pat(&demuxer, 0, &[(1, 0x100)]);

        let pat = demuxer.root().walk("PAT").unwrap();
        /* V00, Current - a second V00 would have collided */
        assert_eq!(pat.child_count(), 2);
    }

    #[test]
    fn new_version_supersedes_and_retargets_current() {
        let demuxer = TsDemuxer::new();
        feed_pat(&demuxer, 0, &[(1, 0x100)]);
        let old = demuxer.root().walk("PAT/V00").unwrap();

        feed_pat(&demuxer, 1, &[(2, 0x200)]);
        let root = demuxer.root();
        assert_eq!(
            root.walk("PAT").unwrap().lookup("Current").unwrap().symlink_target(),
            Some("V01")
        );
        assert!(root.walk("PAT/V00").is_none());
        let programs = root.walk("PAT/V01/Programs").unwrap();
        assert_eq!(programs.child_names(), vec!["0x0002".to_owned()]);
        /* The superseded subtree stays intact for readers that still hold it */
        assert!(old.lookup("Programs").is_some());
    }
}
