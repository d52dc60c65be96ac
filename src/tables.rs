//! Table parsers and the registries that bind them to PIDs.
//!
//! Parsers are small `Copy` units dispatched through [`TableParser`]; each one declares the
//! table ids it accepts and turns a validated [`Section`] into a freshly built version
//! directory, committed through the shared supersession logic in [`commit`].

use crate::dentry::Dentry;
use crate::psi::{self, Section};
use crate::{fsutils, Result, TsDemuxer};
use enum_dispatch::enum_dispatch;
use log::{debug, info};
use parking_lot::RwLock;
use std::collections::{HashMap, HashSet};
use std::sync::Arc;

pub mod descriptors;
pub mod dsmcc;
pub mod eit;
pub mod nit;
pub mod pat;
pub mod pmt;
pub mod sdt;
pub mod time;

use dsmcc::DsmccParser;
use eit::EitParser;
use nit::NitParser;
use pat::PatParser;
use pmt::PmtParser;
use sdt::SdtParser;
use time::TimeParser;

pub(crate) const TID_PAT: u8 = 0x00;
pub(crate) const TID_PMT: u8 = 0x02;
pub(crate) const TID_DII: u8 = 0x3b;
pub(crate) const TID_DDB: u8 = 0x3c;
pub(crate) const TID_NIT_ACTUAL: u8 = 0x40;
pub(crate) const TID_NIT_OTHER: u8 = 0x41;
pub(crate) const TID_SDT_ACTUAL: u8 = 0x42;
pub(crate) const TID_SDT_OTHER: u8 = 0x46;
pub(crate) const TID_EIT_FIRST: u8 = 0x4e;
pub(crate) const TID_EIT_LAST: u8 = 0x5f;
pub(crate) const TID_TDT: u8 = 0x70;
pub(crate) const TID_ST: u8 = 0x72;
pub(crate) const TID_TOT: u8 = 0x73;

/// Common interface of every table parser.
///
/// `accepts` is the table id predicate fixed at registration time; the packet engine drops
/// sections whose table id the PID's registered parser does not claim.
#[enum_dispatch]
pub(crate) trait TableParse {
    fn accepts(&self, table_id: u8) -> bool;
    fn parse(&self, demuxer: &TsDemuxer, section: Section) -> Result<()>;
}

/// Dispatchable union of the built-in table parsers, registered per PID.
#[enum_dispatch(TableParse)]
#[derive(Debug, Clone, Copy)]
pub enum TableParser {
    /// Program Association Table.
    Pat(PatParser),
    /// Program Map Table.
    Pmt(PmtParser),
    /// Network Information Table.
    Nit(NitParser),
    /// Service Description Table.
    Sdt(SdtParser),
    /// Event Information Table.
    Eit(EitParser),
    /// Time/date tables (TDT and TOT).
    Time(TimeParser),
    /// DSM-CC DII/DDB sections.
    Dsmcc(DsmccParser),
    /// Header-and-raw-body fallback for tables without a dedicated parser.
    Generic(GenericParser),
}

/// Fallback parser exposing the common header plus the raw body under a named top-level
/// directory. Accepts every table id.
#[derive(Debug, Clone, Copy)]
pub struct GenericParser {
    name: &'static str,
}

impl GenericParser {
    /// Creates a fallback parser publishing under `/{name}`.
    pub fn new(name: &'static str) -> Self {
        Self { name }
    }
}

impl TableParse for GenericParser {
    fn accepts(&self, _table_id: u8) -> bool {
        true
    }

    fn parse(&self, demuxer: &TsDemuxer, section: Section) -> Result<()> {
        if !section.current() {
            debug!("Ignoring not-yet-applicable {} section", self.name);
            return Ok(());
        }
        let disposition = demuxer.tables().disposition(
            section.key(),
            section.version(),
            section.section_number(),
        );
        if matches!(disposition, Disposition::Skip) {
            debug!(
                "Ignoring already-known {} version {}",
                self.name,
                section.version()
            );
            return Ok(());
        }

        let vdir = fsutils::create_version_dir(section.version());
        psi::append_header_leaves(&vdir, &section, "table_id_extension")?;
        if !section.body.is_empty() {
            fsutils::append_binary(&vdir, "data", &section.body)?;
        }

        let table_root = fsutils::ensure_dir(&demuxer.root(), self.name)?;
        commit(demuxer, &table_root, vdir, &section, disposition)
    }
}

/// Elementary stream registration produced by the PMT parser.
///
/// The core carries no PES pipeline; this registry is the hand-off point for one.
#[derive(Debug, Clone, Copy)]
pub struct PesEntry {
    /// Elementary stream PID.
    pub pid: u16,
    /// Stream type code from the PMT entry.
    pub stream_type: u8,
}

/* One installed table version: the psi_tables value */
pub(crate) struct TableRecord {
    pub table_id: u8,
    pub version: u8,
    pub sections: HashSet<u8>,
    pub dentry: Arc<Dentry>,
}

/// How an arriving section relates to what is already installed for its table key.
pub(crate) enum Disposition {
    /// Same version, section already merged: idempotent delivery.
    Skip,
    /// Same version, new section number: fold new children into the live directory.
    Merge(Arc<Dentry>),
    /// Different version: replace the carried directory.
    Supersede(Arc<Dentry>),
    /// First sighting of this table key.
    Fresh,
}

/// Shared registries: PID-keyed parsers, installed tables, and announced media PIDs.
///
/// All maps are mutated only by the ingestion thread and read from anywhere; writes are
/// single-entry replacements behind a reader-writer lock, so readers always observe a
/// complete entry.
pub(crate) struct TableStore {
    psi_parsers: RwLock<HashMap<u16, TableParser>>,
    psi_tables: RwLock<HashMap<u32, TableRecord>>,
    pes_parsers: RwLock<HashMap<u16, PesEntry>>,
}

impl TableStore {
    pub fn new() -> Self {
        Self {
            psi_parsers: RwLock::new(HashMap::new()),
            psi_tables: RwLock::new(HashMap::new()),
            pes_parsers: RwLock::new(HashMap::new()),
        }
    }

    pub fn register_psi(&self, pid: u16, parser: TableParser) {
        self.psi_parsers.write().insert(pid, parser);
    }

    pub fn register_psi_if_absent(&self, pid: u16, parser: TableParser) {
        self.psi_parsers.write().entry(pid).or_insert(parser);
    }

    pub fn psi_parser(&self, pid: u16) -> Option<TableParser> {
        self.psi_parsers.read().get(&pid).copied()
    }

    pub fn register_pes(&self, entry: PesEntry) {
        self.pes_parsers.write().insert(entry.pid, entry);
    }

    pub fn pes_parser(&self, pid: u16) -> Option<PesEntry> {
        self.pes_parsers.read().get(&pid).copied()
    }

    pub fn disposition(&self, key: u32, version: u8, section_number: u8) -> Disposition {
        match self.psi_tables.read().get(&key) {
            None => Disposition::Fresh,
            Some(record) if record.version == version => {
                if record.sections.contains(&section_number) {
                    Disposition::Skip
                } else {
                    Disposition::Merge(record.dentry.clone())
                }
            }
            Some(record) => Disposition::Supersede(record.dentry.clone()),
        }
    }

    pub fn lookup_dentry(&self, key: u32) -> Option<Arc<Dentry>> {
        self.psi_tables.read().get(&key).map(|r| r.dentry.clone())
    }

    pub fn install(&self, key: u32, section: &Section, dentry: Arc<Dentry>) {
        let mut sections = HashSet::new();
        sections.insert(section.section_number());
        let record = TableRecord {
            table_id: section.table_id(),
            version: section.version(),
            sections,
            dentry,
        };
        /* Single-entry swap: the superseded record drops after the insert */
        self.psi_tables.write().insert(key, record);
    }

    pub fn merge_section(&self, key: u32, section_number: u8) {
        if let Some(record) = self.psi_tables.write().get_mut(&key) {
            record.sections.insert(section_number);
        }
    }
}

/* Recursively move children the live tree lacks; shared directories are descended into */
fn merge_missing(new: &Arc<Dentry>, live: &Arc<Dentry>) {
    for child in new.children() {
        match live.lookup(child.name()) {
            None => {
                new.remove_child(child.name());
                let _ = live.add_child(child);
            }
            Some(existing) if existing.is_dir() && child.is_dir() => {
                merge_missing(&child, &existing);
            }
            Some(_) => {}
        }
    }
}

/// Publishes a freshly built version directory according to its [`Disposition`].
pub(crate) fn commit(
    demuxer: &TsDemuxer,
    table_root: &Arc<Dentry>,
    vdir: Arc<Dentry>,
    section: &Section,
    disposition: Disposition,
) -> Result<()> {
    let key = section.key();
    match disposition {
        Disposition::Skip => Ok(()),
        Disposition::Merge(live) => {
            merge_missing(&vdir, &live);
            demuxer.tables().merge_section(key, section.section_number());
            debug!(
                "Merged section {} of table {:#04x} on PID {:#06x}",
                section.section_number(),
                section.table_id(),
                section.pid
            );
            Ok(())
        }
        Disposition::Supersede(old) => {
            fsutils::publish_version(table_root, vdir.clone(), Some(old))?;
            demuxer.tables().install(key, section, vdir);
            info!(
                "Installed table {:#04x} version {} on PID {:#06x}",
                section.table_id(),
                section.version(),
                section.pid
            );
            Ok(())
        }
        Disposition::Fresh => {
            fsutils::publish_version(table_root, vdir.clone(), None)?;
            demuxer.tables().install(key, section, vdir);
            info!(
                "Installed table {:#04x} version {} on PID {:#06x}",
                section.table_id(),
                section.version(),
                section.pid
            );
            Ok(())
        }
    }
}

/* ARIB TR-B14 fixed PID assignments seeded into a fresh dispatcher */
pub(crate) fn seed_reserved(store: &TableStore) {
    store.register_psi(0x0000, PatParser::default().into());
    store.register_psi(0x0001, GenericParser::new("CAT").into());
    store.register_psi(0x0010, NitParser::default().into());
    store.register_psi(0x0011, SdtParser::default().into());
    store.register_psi(0x0012, EitParser::default().into());
    store.register_psi(0x0013, GenericParser::new("RST").into());
    store.register_psi(0x0014, TimeParser::default().into());
    store.register_psi(0x0017, GenericParser::new("DCT").into());
    store.register_psi(0x001e, GenericParser::new("DIT").into());
    store.register_psi(0x001f, GenericParser::new("SIT").into());
    store.register_psi(0x0022, GenericParser::new("PCAT").into());
    store.register_psi(0x0023, GenericParser::new("SDTT").into());
    store.register_psi(0x0024, GenericParser::new("BIT").into());
    store.register_psi(0x0025, GenericParser::new("NBIT").into());
    store.register_psi(0x0026, EitParser::default().into());
    store.register_psi(0x0027, EitParser::default().into());
    store.register_psi(0x0028, GenericParser::new("SDTT").into());
    store.register_psi(0x0029, GenericParser::new("CDT").into());
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::psi::tests::build_section;

    #[test]
    fn reserved_pids_are_seeded() {
        let demuxer = TsDemuxer::new();
        assert!(matches!(demuxer.psi_parser(0x0000), Some(TableParser::Pat(_))));
        assert!(matches!(demuxer.psi_parser(0x0010), Some(TableParser::Nit(_))));
        assert!(matches!(demuxer.psi_parser(0x0014), Some(TableParser::Time(_))));
        assert!(matches!(demuxer.psi_parser(0x0027), Some(TableParser::Eit(_))));
        assert!(demuxer.psi_parser(0x0100).is_none());
    }

    #[test]
    fn registration_is_idempotent_per_pid() {
        let store = TableStore::new();
        store.register_psi_if_absent(0x100, PmtParser::default().into());
        store.register_psi_if_absent(0x100, NitParser::default().into());
        assert!(matches!(store.psi_parser(0x100), Some(TableParser::Pmt(_))));
    }

    #[test]
    fn generic_parser_publishes_under_its_name() {
        let demuxer = TsDemuxer::new();
        let raw = build_section(0xc4, 0x044e, 0, &[0x30, 0x00]);
        let section = crate::psi::parse_section(0x0024, &raw).unwrap();
        GenericParser::new("BIT").parse(&demuxer, section).unwrap();

        let root = demuxer.root();
        assert_eq!(
            root.walk("BIT/Current/data").unwrap().file_content(),
            Some(&[0x30, 0x00][..])
        );
    }

    #[test]
    fn same_version_new_section_merges_children() {
        let demuxer = TsDemuxer::new();

        /* EIT section 0 carries event 0x0001, section 1 carries event 0x0002 */
        let event = |id: u16| -> Vec<u8> {
            let mut body = vec![0x04, 0x4d, 0x04, 0x4e, 0x01, 0x4e];
            body.extend_from_slice(&id.to_be_bytes());
            body.extend_from_slice(&[0xb0, 0xa2, 0x12, 0x45, 0x00]);
            body.extend_from_slice(&[0x00, 0x30, 0x00]);
            body.extend_from_slice(&0x8000u16.to_be_bytes());
            body
        };
        let mut first = build_section(0x4e, 0x0400, 1, &event(1));
        /* Rewrite the section numbers so the two sections differ */
        let mut second = build_section(0x4e, 0x0400, 1, &event(2));
        second[6] = 0x01;
        second[7] = 0x01;
        first[7] = 0x01;
        let fix = |raw: &mut Vec<u8>| {
            let len = raw.len();
            let crc = crate::CRC.checksum(&raw[..len - 4]);
            raw[len - 4..].copy_from_slice(&crc.to_be_bytes());
        };
        fix(&mut first);
        fix(&mut second);

        let parser = EitParser::default();
        parser
            .parse(&demuxer, crate::psi::parse_section(0x0012, &first).unwrap())
            .unwrap();
        parser
            .parse(&demuxer, crate::psi::parse_section(0x0012, &second).unwrap())
            .unwrap();

        let events = demuxer.root().walk("EIT/V01/Events").unwrap();
        assert!(events.lookup("0x0001").is_some());
        assert!(events.lookup("0x0002").is_some());

        /* Re-delivering an already-merged section is a no-op */
        parser
            .parse(&demuxer, crate::psi::parse_section(0x0012, &second).unwrap())
            .unwrap();
        assert_eq!(events.child_count(), 2);
    }
}
